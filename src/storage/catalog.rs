//! Host catalog: populations, their variables, generators and rows.
//!
//! The bridge only consumes the catalog through [`HostCatalog`]. [`SqlCatalog`]
//! is the DuckDB implementation used by the binary and the tests; hosts with
//! their own catalog tables implement the trait themselves.

use duckdb::{params, Connection};
use std::str::FromStr;
use tracing::debug;

use super::StorageUtils;
use crate::error::{Error, Result};
use crate::types::{ColNo, GeneratorId, PopulationId, RowId, StatType, Value};

/// Catalog lookups the bridge needs from the host database.
pub trait HostCatalog: Send + Sync {
    fn generator_population(&self, conn: &Connection, generator: GeneratorId) -> Result<PopulationId>;

    fn generator_name(&self, conn: &Connection, generator: GeneratorId) -> Result<String>;

    fn population_table(&self, conn: &Connection, population: PopulationId) -> Result<String>;

    /// Variable column numbers of a population, ascending.
    fn variable_numbers(&self, conn: &Connection, population: PopulationId) -> Result<Vec<ColNo>>;

    fn variable_name(&self, conn: &Connection, population: PopulationId, colno: ColNo) -> Result<String>;

    fn variable_stattype(&self, conn: &Connection, population: PopulationId, colno: ColNo) -> Result<StatType>;

    /// Column number of a variable by (case-insensitive) name.
    fn variable_colno(&self, conn: &Connection, population: PopulationId, name: &str) -> Result<ColNo>;

    /// Values of `colnos` for every row, in row id order.
    fn population_rows(&self, conn: &Connection, population: PopulationId, colnos: &[ColNo]) -> Result<Vec<Vec<Value>>>;

    /// Values of `colnos` for one existing row.
    fn row_values(
        &self,
        conn: &Connection,
        population: PopulationId,
        rowid: RowId,
        colnos: &[ColNo],
    ) -> Result<Vec<Value>>;

    fn row_count(&self, conn: &Connection, population: PopulationId) -> Result<usize>;

    /// Row id one past the last materialized row; denotes a hypothetical row.
    fn fresh_row_id(&self, conn: &Connection, population: PopulationId) -> Result<RowId>;
}

pub const CATALOG_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS catalog_population (
    population_id   BIGINT PRIMARY KEY,
    name            VARCHAR NOT NULL UNIQUE,
    table_name      VARCHAR NOT NULL
);

CREATE TABLE IF NOT EXISTS catalog_variable (
    population_id   BIGINT NOT NULL,
    colno           BIGINT NOT NULL,
    name            VARCHAR NOT NULL,
    stattype        VARCHAR NOT NULL,
    PRIMARY KEY (population_id, colno)
);

CREATE TABLE IF NOT EXISTS catalog_generator (
    generator_id    BIGINT PRIMARY KEY,
    population_id   BIGINT NOT NULL,
    name            VARCHAR NOT NULL UNIQUE
);
"#;

/// Catalog kept in ordinary DuckDB tables next to the data.
///
/// Host row ids are DuckDB's `rowid` plus one, so the first inserted row is 1.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqlCatalog;

impl SqlCatalog {
    pub fn new() -> Self {
        Self
    }

    pub fn install(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(CATALOG_SCHEMA)?;
        Ok(())
    }

    /// Declare a population over an existing table. Variables are numbered
    /// in the order given, starting at 0.
    pub fn create_population(
        &self,
        conn: &Connection,
        name: &str,
        table: &str,
        variables: &[(&str, StatType)],
    ) -> Result<PopulationId> {
        let population = PopulationId(next_id(conn, "catalog_population", "population_id")?);
        conn.execute(
            "INSERT INTO catalog_population (population_id, name, table_name) VALUES (?, ?, ?)",
            params![population, name, table],
        )?;
        let mut stmt = conn.prepare(
            "INSERT INTO catalog_variable (population_id, colno, name, stattype) VALUES (?, ?, ?, ?)",
        )?;
        for (colno, (variable, stattype)) in variables.iter().enumerate() {
            stmt.execute(params![population, colno as i64, variable, stattype.as_str()])?;
        }
        debug!("Created population {} '{}' over table {}", population, name, table);
        Ok(population)
    }

    pub fn create_generator(&self, conn: &Connection, population: PopulationId, name: &str) -> Result<GeneratorId> {
        let generator = GeneratorId(next_id(conn, "catalog_generator", "generator_id")?);
        conn.execute(
            "INSERT INTO catalog_generator (generator_id, population_id, name) VALUES (?, ?, ?)",
            params![generator, population, name],
        )?;
        Ok(generator)
    }

    pub fn generator_by_name(&self, conn: &Connection, name: &str) -> Result<GeneratorId> {
        let id = conn.query_row(
            "SELECT generator_id FROM catalog_generator WHERE name = ?",
            params![name],
            |row| row.get::<_, i64>(0),
        );
        match id {
            Ok(id) => Ok(GeneratorId(id)),
            Err(duckdb::Error::QueryReturnedNoRows) => {
                Err(Error::Catalog(format!("no generator named '{name}'")))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn remove_generator(&self, conn: &Connection, generator: GeneratorId) -> Result<()> {
        conn.execute(
            "DELETE FROM catalog_generator WHERE generator_id = ?",
            params![generator],
        )?;
        Ok(())
    }

    fn column_list(&self, conn: &Connection, population: PopulationId, colnos: &[ColNo]) -> Result<String> {
        let mut names = Vec::with_capacity(colnos.len());
        for colno in colnos {
            names.push(StorageUtils::quote_identifier(&self.variable_name(conn, population, *colno)?));
        }
        Ok(names.join(", "))
    }
}

fn next_id(conn: &Connection, table: &str, column: &str) -> Result<i64> {
    Ok(conn.query_row(
        &format!("SELECT coalesce(max({column}), 0) + 1 FROM {table}"),
        params![],
        |row| row.get(0),
    )?)
}

fn read_values(row: &duckdb::Row<'_>, width: usize) -> Result<Vec<Value>> {
    let mut values = Vec::with_capacity(width);
    for i in 0..width {
        values.push(Value::from_duckdb(row.get::<_, duckdb::types::Value>(i)?)?);
    }
    Ok(values)
}

impl HostCatalog for SqlCatalog {
    fn generator_population(&self, conn: &Connection, generator: GeneratorId) -> Result<PopulationId> {
        let id = conn.query_row(
            "SELECT population_id FROM catalog_generator WHERE generator_id = ?",
            params![generator],
            |row| row.get::<_, i64>(0),
        );
        match id {
            Ok(id) => Ok(PopulationId(id)),
            Err(duckdb::Error::QueryReturnedNoRows) => Err(Error::UnknownGenerator(generator)),
            Err(e) => Err(e.into()),
        }
    }

    fn generator_name(&self, conn: &Connection, generator: GeneratorId) -> Result<String> {
        let name = conn.query_row(
            "SELECT name FROM catalog_generator WHERE generator_id = ?",
            params![generator],
            |row| row.get::<_, String>(0),
        );
        match name {
            Ok(name) => Ok(name),
            Err(duckdb::Error::QueryReturnedNoRows) => Err(Error::UnknownGenerator(generator)),
            Err(e) => Err(e.into()),
        }
    }

    fn population_table(&self, conn: &Connection, population: PopulationId) -> Result<String> {
        let table = conn.query_row(
            "SELECT table_name FROM catalog_population WHERE population_id = ?",
            params![population],
            |row| row.get::<_, String>(0),
        );
        match table {
            Ok(table) => Ok(table),
            Err(duckdb::Error::QueryReturnedNoRows) => {
                Err(Error::Catalog(format!("no population {population}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn variable_numbers(&self, conn: &Connection, population: PopulationId) -> Result<Vec<ColNo>> {
        let mut stmt =
            conn.prepare("SELECT colno FROM catalog_variable WHERE population_id = ? ORDER BY colno")?;
        let rows = stmt.query_map(params![population], |row| row.get::<_, i64>(0))?;
        let mut colnos = Vec::new();
        for row in rows {
            colnos.push(ColNo(row?));
        }
        Ok(colnos)
    }

    fn variable_name(&self, conn: &Connection, population: PopulationId, colno: ColNo) -> Result<String> {
        let name = conn.query_row(
            "SELECT name FROM catalog_variable WHERE population_id = ? AND colno = ?",
            params![population, colno],
            |row| row.get::<_, String>(0),
        );
        match name {
            Ok(name) => Ok(name),
            Err(duckdb::Error::QueryReturnedNoRows) => Err(Error::Catalog(format!(
                "population {population} has no variable {colno}"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    fn variable_stattype(&self, conn: &Connection, population: PopulationId, colno: ColNo) -> Result<StatType> {
        let stattype = conn.query_row(
            "SELECT stattype FROM catalog_variable WHERE population_id = ? AND colno = ?",
            params![population, colno],
            |row| row.get::<_, String>(0),
        );
        match stattype {
            Ok(stattype) => StatType::from_str(&stattype),
            Err(duckdb::Error::QueryReturnedNoRows) => Err(Error::Catalog(format!(
                "population {population} has no variable {colno}"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    fn variable_colno(&self, conn: &Connection, population: PopulationId, name: &str) -> Result<ColNo> {
        let colno = conn.query_row(
            "SELECT colno FROM catalog_variable WHERE population_id = ? AND lower(name) = lower(?)",
            params![population, name],
            |row| row.get::<_, i64>(0),
        );
        match colno {
            Ok(colno) => Ok(ColNo(colno)),
            Err(duckdb::Error::QueryReturnedNoRows) => Err(Error::Catalog(format!(
                "population {population} has no variable '{name}'"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    fn population_rows(&self, conn: &Connection, population: PopulationId, colnos: &[ColNo]) -> Result<Vec<Vec<Value>>> {
        let table = StorageUtils::quote_identifier(&self.population_table(conn, population)?);
        let columns = self.column_list(conn, population, colnos)?;
        let mut stmt = conn.prepare(&format!("SELECT {columns} FROM {table} ORDER BY rowid"))?;
        let mut rows = stmt.query(params![])?;
        let mut values = Vec::new();
        while let Some(row) = rows.next()? {
            values.push(read_values(row, colnos.len())?);
        }
        Ok(values)
    }

    fn row_values(
        &self,
        conn: &Connection,
        population: PopulationId,
        rowid: RowId,
        colnos: &[ColNo],
    ) -> Result<Vec<Value>> {
        let table = StorageUtils::quote_identifier(&self.population_table(conn, population)?);
        let columns = self.column_list(conn, population, colnos)?;
        let mut stmt = conn.prepare(&format!("SELECT {columns} FROM {table} WHERE rowid = ?"))?;
        let mut rows = stmt.query(params![rowid.0 - 1])?;
        match rows.next()? {
            Some(row) => read_values(row, colnos.len()),
            None => Err(Error::MissingRow { population, rowid }),
        }
    }

    fn row_count(&self, conn: &Connection, population: PopulationId) -> Result<usize> {
        let table = StorageUtils::quote_identifier(&self.population_table(conn, population)?);
        let count: i64 = conn.query_row(&format!("SELECT count(*) FROM {table}"), params![], |row| {
            row.get(0)
        })?;
        Ok(count.max(0) as usize)
    }

    fn fresh_row_id(&self, conn: &Connection, population: PopulationId) -> Result<RowId> {
        let table = StorageUtils::quote_identifier(&self.population_table(conn, population)?);
        let next: i64 = conn.query_row(
            &format!("SELECT coalesce(max(rowid), -1) + 2 FROM {table}"),
            params![],
            |row| row.get(0),
        )?;
        Ok(RowId(next))
    }
}
