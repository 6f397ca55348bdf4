//! Encoding and partition storage inside the host database.
//!
//! `PartitionStore` is a thin view over a borrowed connection (or a
//! transaction, which dereferences to one). It performs no transaction
//! management of its own: callers group multi-row writes with
//! `HostConnection::transaction` so a reader never observes a partially
//! written model.

use duckdb::{params, Connection};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use tracing::debug;

use super::schema::{ADAPTER_SCHEMA_V1, GENERATOR_TABLES, PARTITION_TABLES, REGISTRY_SCHEMA};
use super::StorageUtils;
use crate::constants::metamodel;
use crate::error::{Error, Result};
use crate::partition::ModelPartition;
use crate::types::{ColNo, GeneratorId, KindId, ModelNo, PartitionId, Rank, RowId};

/// Registration record of one generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratorRecord {
    pub generator_id: GeneratorId,
    pub name: String,
    pub project_path: PathBuf,
}

pub struct PartitionStore<'a> {
    conn: &'a Connection,
}

impl<'a> PartitionStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Install the adapter tables unless a version is already registered.
    /// Returns whether the schema was installed by this call.
    pub fn register(&self) -> Result<bool> {
        self.conn.execute_batch(REGISTRY_SCHEMA)?;
        match self.registered_version()? {
            Some(metamodel::SCHEMA_VERSION) => Ok(false),
            Some(other) => Err(Error::InvalidArgument(format!(
                "unsupported {} schema version {}",
                metamodel::NAME,
                other
            ))),
            None => {
                self.conn.execute_batch(ADAPTER_SCHEMA_V1)?;
                self.conn.execute(
                    "INSERT INTO metamodel_registry (name, version) VALUES (?, ?)",
                    params![metamodel::NAME, metamodel::SCHEMA_VERSION],
                )?;
                Ok(true)
            }
        }
    }

    pub fn registered_version(&self) -> Result<Option<i64>> {
        let version = self.conn.query_row(
            "SELECT version FROM metamodel_registry WHERE name = ?",
            params![metamodel::NAME],
            |row| row.get::<_, i64>(0),
        );
        match version {
            Ok(v) => Ok(Some(v)),
            Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn registry_exists(&self) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT count(*) FROM information_schema.tables WHERE table_name = 'metamodel_registry'",
            params![],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Fail with a schema error when the adapter tables are absent.
    pub fn ensure_registered(&self) -> Result<()> {
        if !self.registry_exists()? {
            return Err(Error::NotRegistered(metamodel::NAME.to_string()));
        }
        match self.registered_version()? {
            Some(_) => Ok(()),
            None => Err(Error::NotRegistered(metamodel::NAME.to_string())),
        }
    }

    // Generators

    pub fn insert_generator(&self, record: &GeneratorRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO loom_generator (generator_id, name, project_path) VALUES (?, ?, ?)",
            params![
                record.generator_id,
                record.name,
                record.project_path.to_string_lossy().into_owned()
            ],
        )?;
        Ok(())
    }

    pub fn generator(&self, generator: GeneratorId) -> Result<GeneratorRecord> {
        let row = self.conn.query_row(
            "SELECT name, project_path FROM loom_generator WHERE generator_id = ?",
            params![generator],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        );
        match row {
            Ok((name, path)) => Ok(GeneratorRecord {
                generator_id: generator,
                name,
                project_path: PathBuf::from(path),
            }),
            Err(duckdb::Error::QueryReturnedNoRows) => Err(Error::UnknownGenerator(generator)),
            Err(e) => Err(e.into()),
        }
    }

    /// Project names in use, for uniqueness checks.
    pub fn generator_name_exists(&self, name: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT count(*) FROM loom_generator WHERE name = ?",
            params![name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // Model count

    pub fn set_model_count(&self, generator: GeneratorId, num_models: usize) -> Result<()> {
        self.conn.execute(
            "DELETE FROM loom_generator_model_info WHERE generator_id = ?",
            params![generator],
        )?;
        self.conn.execute(
            "INSERT INTO loom_generator_model_info (generator_id, num_models) VALUES (?, ?)",
            params![generator, num_models as i64],
        )?;
        Ok(())
    }

    /// Number of initialized models; zero when models were never initialized.
    pub fn model_count(&self, generator: GeneratorId) -> Result<usize> {
        let count = self.conn.query_row(
            "SELECT num_models FROM loom_generator_model_info WHERE generator_id = ?",
            params![generator],
            |row| row.get::<_, i64>(0),
        );
        match count {
            Ok(n) => Ok(usize::try_from(n).unwrap_or(0)),
            Err(duckdb::Error::QueryReturnedNoRows) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    // Encodings

    pub fn insert_encoding(
        &self,
        generator: GeneratorId,
        colno: ColNo,
        symbols: &BTreeMap<String, i64>,
    ) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "INSERT INTO loom_string_encoding (generator_id, colno, string_form, integer_form)
             VALUES (?, ?, ?, ?)",
        )?;
        for (string_form, integer_form) in symbols {
            stmt.execute(params![generator, colno, string_form, integer_form])?;
        }
        Ok(())
    }

    pub fn integer_form(&self, generator: GeneratorId, colno: ColNo, value: &str) -> Result<i64> {
        let code = self.conn.query_row(
            "SELECT integer_form FROM loom_string_encoding
             WHERE generator_id = ? AND colno = ? AND string_form = ?",
            params![generator, colno, value],
            |row| row.get::<_, i64>(0),
        );
        match code {
            Ok(code) => Ok(code),
            Err(duckdb::Error::QueryReturnedNoRows) => Err(Error::MissingEncoding {
                generator,
                colno,
                value: value.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub fn string_form(&self, generator: GeneratorId, colno: ColNo, code: i64) -> Result<String> {
        let value = self.conn.query_row(
            "SELECT string_form FROM loom_string_encoding
             WHERE generator_id = ? AND colno = ? AND integer_form = ?",
            params![generator, colno, code],
            |row| row.get::<_, String>(0),
        );
        match value {
            Ok(value) => Ok(value),
            Err(duckdb::Error::QueryReturnedNoRows) => Err(Error::MissingEncoding {
                generator,
                colno,
                value: code.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Full symbol table of one column.
    pub fn encoding(&self, generator: GeneratorId, colno: ColNo) -> Result<BTreeMap<String, i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT string_form, integer_form FROM loom_string_encoding
             WHERE generator_id = ? AND colno = ?",
        )?;
        let rows = stmt.query_map(params![generator, colno], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut symbols = BTreeMap::new();
        for row in rows {
            let (string_form, integer_form) = row?;
            symbols.insert(string_form, integer_form);
        }
        Ok(symbols)
    }

    // Column order

    /// Store the engine's column order; `order[rank]` is the host column.
    pub fn insert_order(&self, generator: GeneratorId, order: &[ColNo]) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "INSERT INTO loom_column_ordering (generator_id, colno, col_rank) VALUES (?, ?, ?)",
        )?;
        for (rank, colno) in order.iter().enumerate() {
            stmt.execute(params![generator, colno, rank as i64])?;
        }
        Ok(())
    }

    pub fn rank(&self, generator: GeneratorId, colno: ColNo) -> Result<Rank> {
        let rank = self.conn.query_row(
            "SELECT col_rank FROM loom_column_ordering WHERE generator_id = ? AND colno = ?",
            params![generator, colno],
            |row| row.get::<_, i64>(0),
        );
        match rank {
            Ok(rank) => Ok(Rank(rank)),
            Err(duckdb::Error::QueryReturnedNoRows) => Err(Error::MissingColumn { generator, colno }),
            Err(e) => Err(e.into()),
        }
    }

    /// Host columns sorted by ascending engine rank.
    pub fn order(&self, generator: GeneratorId) -> Result<Vec<ColNo>> {
        let mut stmt = self.conn.prepare(
            "SELECT colno FROM loom_column_ordering WHERE generator_id = ? ORDER BY col_rank ASC",
        )?;
        let rows = stmt.query_map(params![generator], |row| row.get::<_, i64>(0))?;
        let mut order = Vec::new();
        for row in rows {
            order.push(ColNo(row?));
        }
        Ok(order)
    }

    // Partitions

    /// Replace every stored row of `partition.modelno` with `partition`.
    pub fn replace_partition(&self, generator: GeneratorId, partition: &ModelPartition) -> Result<()> {
        self.delete_models(generator, Some(&[partition.modelno]))?;

        let mut column_stmt = self
            .conn
            .prepare(&StorageUtils::generate_insert_sql("loom_column_kind_partition", 4))?;
        for (colno, kind) in &partition.column_kinds {
            column_stmt.execute(params![generator, partition.modelno, colno, kind])?;
        }

        let mut row_stmt = self
            .conn
            .prepare(&StorageUtils::generate_insert_sql("loom_row_kind_partition", 5))?;
        for (kind, partitions) in &partition.row_partitions {
            for (index, partition_id) in partitions.iter().enumerate() {
                let rowid = RowId(index as i64 + 1);
                row_stmt.execute(params![generator, partition.modelno, rowid, kind, partition_id])?;
            }
        }

        debug!(
            "Stored partition for generator {} model {}: {} columns, {} kinds, {} rows",
            generator,
            partition.modelno,
            partition.column_kinds.len(),
            partition.row_partitions.len(),
            partition.num_rows()
        );
        Ok(())
    }

    /// Delete partitions of the listed models, or of every model when `None`.
    pub fn delete_models(&self, generator: GeneratorId, modelnos: Option<&[ModelNo]>) -> Result<()> {
        for table in PARTITION_TABLES {
            match modelnos {
                None => {
                    self.conn.execute(
                        &format!("DELETE FROM {table} WHERE generator_id = ?"),
                        params![generator],
                    )?;
                }
                Some(modelnos) => {
                    let sql = format!("DELETE FROM {table} WHERE generator_id = ? AND modelno = ?");
                    for modelno in modelnos {
                        self.conn.execute(&sql, params![generator, modelno])?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Delete every row the adapter keeps for the generator.
    pub fn delete_generator(&self, generator: GeneratorId) -> Result<()> {
        for table in GENERATOR_TABLES {
            self.conn.execute(
                &format!("DELETE FROM {table} WHERE generator_id = ?"),
                params![generator],
            )?;
        }
        Ok(())
    }

    pub fn has_model(&self, generator: GeneratorId, modelno: ModelNo) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT count(*) FROM loom_column_kind_partition WHERE generator_id = ? AND modelno = ?",
            params![generator, modelno],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn kind_id(&self, generator: GeneratorId, modelno: ModelNo, colno: ColNo) -> Result<KindId> {
        let kind = self.conn.query_row(
            "SELECT kind_id FROM loom_column_kind_partition
             WHERE generator_id = ? AND modelno = ? AND colno = ?",
            params![generator, modelno, colno],
            |row| row.get::<_, i64>(0),
        );
        match kind {
            Ok(kind) => Ok(KindId(kind)),
            Err(duckdb::Error::QueryReturnedNoRows) => {
                if self.has_model(generator, modelno)? {
                    Err(Error::MissingColumn { generator, colno })
                } else {
                    Err(Error::MissingModel { generator, modelno })
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn partition_id(
        &self,
        generator: GeneratorId,
        modelno: ModelNo,
        kind: KindId,
        rowid: RowId,
    ) -> Result<PartitionId> {
        let partition = self.conn.query_row(
            "SELECT partition_id FROM loom_row_kind_partition
             WHERE generator_id = ? AND modelno = ? AND kind_id = ? AND rowid = ?",
            params![generator, modelno, kind, rowid],
            |row| row.get::<_, i64>(0),
        );
        match partition {
            Ok(partition) => Ok(PartitionId(partition)),
            Err(duckdb::Error::QueryReturnedNoRows) => Err(Error::MissingPartition {
                generator,
                modelno,
                kind,
                rowid,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Read a stored model partition back into a value.
    pub fn load_partition(&self, generator: GeneratorId, modelno: ModelNo) -> Result<ModelPartition> {
        let mut partition = ModelPartition::new(modelno);

        let mut stmt = self.conn.prepare(
            "SELECT colno, kind_id FROM loom_column_kind_partition
             WHERE generator_id = ? AND modelno = ? ORDER BY colno",
        )?;
        let rows = stmt.query_map(params![generator, modelno], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (colno, kind) = row?;
            partition.column_kinds.insert(ColNo(colno), KindId(kind));
        }
        if partition.column_kinds.is_empty() {
            return Err(Error::MissingModel { generator, modelno });
        }

        let mut stmt = self.conn.prepare(
            "SELECT kind_id, rowid, partition_id FROM loom_row_kind_partition
             WHERE generator_id = ? AND modelno = ? ORDER BY kind_id, rowid",
        )?;
        let rows = stmt.query_map(params![generator, modelno], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
        })?;
        for row in rows {
            let (kind, rowid, partition_id) = row?;
            let rows = partition.row_partitions.entry(KindId(kind)).or_default();
            if rowid != rows.len() as i64 + 1 {
                return Err(Error::InvalidPartition(format!(
                    "generator {generator} model {modelno} kind {kind} skips row {}",
                    rows.len() + 1
                )));
            }
            rows.push(PartitionId(partition_id));
        }
        Ok(partition)
    }

    /// Row counts per adapter table for one generator.
    pub fn generator_row_counts(&self, generator: GeneratorId) -> Result<HashMap<&'static str, i64>> {
        let mut counts = HashMap::new();
        for table in GENERATOR_TABLES {
            let count: i64 = self.conn.query_row(
                &format!("SELECT count(*) FROM {table} WHERE generator_id = ?"),
                params![generator],
                |row| row.get(0),
            )?;
            counts.insert(table, count);
        }
        Ok(counts)
    }
}
