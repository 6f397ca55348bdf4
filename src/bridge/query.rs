//! Analytic queries answered from stored partitions and engine servers.

use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use super::{GeneratorContext, LoomBridge};
use crate::connection::HostConnection;
use crate::engine::{EngineValue, PredictRequest};
use crate::error::{Error, Result};
use crate::server_cache::ServerKey;
use crate::storage::PartitionStore;
use crate::types::{Affinity, ColNo, GeneratorId, ModelNo, RowId, Value};

impl LoomBridge {
    /// Fraction of models in which the two columns share a kind.
    pub fn column_dependence_probability(
        &self,
        host: &HostConnection,
        generator: GeneratorId,
        modelnos: Option<&[ModelNo]>,
        colno0: ColNo,
        colno1: ColNo,
    ) -> Result<f64> {
        host.with(|conn| {
            self.context(conn, generator)?;
            let modelnos = self.model_numbers(conn, generator, modelnos)?;
            let store = PartitionStore::new(conn);
            let mut hits = 0usize;
            for modelno in &modelnos {
                if store.kind_id(generator, *modelno, colno0)? == store.kind_id(generator, *modelno, colno1)? {
                    hits += 1;
                }
            }
            Ok(hits as f64 / modelnos.len() as f64)
        })
    }

    /// Engine estimate of the mutual information between two column sets.
    ///
    /// This is a single ensemble-level query; `modelnos` is accepted for
    /// symmetry with the other queries and not consulted.
    pub fn column_mutual_information(
        &self,
        host: &HostConnection,
        generator: GeneratorId,
        _modelnos: Option<&[ModelNo]>,
        colnos0: &[ColNo],
        colnos1: &[ColNo],
        numsamples: Option<usize>,
    ) -> Result<f64> {
        let (context, names0, names1) = host.with(|conn| {
            let context = self.context(conn, generator)?;
            let names0 = self.variable_names(conn, &context, colnos0)?;
            let names1 = self.variable_names(conn, &context, colnos1)?;
            Ok((context, names0, names1))
        })?;
        let sample_count = numsamples.unwrap_or(self.config.query.mutual_information_samples);
        let server = self.query_server(host, &context)?;
        self.server_result(
            host,
            generator,
            ServerKey::Query,
            server.mutual_information(&names0, &names1, sample_count),
        )
    }

    /// Engine similarity of two existing rows.
    ///
    /// Both rows are sent whole in rank order; `_colnos` does not narrow the
    /// comparison.
    pub fn row_similarity(
        &self,
        host: &HostConnection,
        generator: GeneratorId,
        _modelnos: Option<&[ModelNo]>,
        rowid: RowId,
        target_rowid: RowId,
        _colnos: &[ColNo],
    ) -> Result<f64> {
        let (context, row, target) = host.with(|conn| {
            let context = self.context(conn, generator)?;
            let order = PartitionStore::new(conn).order(generator)?;
            let row = self.catalog().row_values(conn, context.population, rowid, &order)?;
            let target = self.catalog().row_values(conn, context.population, target_rowid, &order)?;
            Ok((context, dense_fields(&row), dense_fields(&target)))
        })?;
        let server = self.predict_server(host, &context)?;
        self.server_result(host, generator, ServerKey::Predict, server.similar(&row, &target))
    }

    /// For each query row, the fraction of models placing it in the target
    /// row's cluster of the context column's kind.
    pub fn predictive_relevance(
        &self,
        host: &HostConnection,
        generator: GeneratorId,
        modelnos: Option<&[ModelNo]>,
        target: RowId,
        queries: &[RowId],
        colno: ColNo,
    ) -> Result<Vec<f64>> {
        host.with(|conn| {
            self.context(conn, generator)?;
            let modelnos = self.model_numbers(conn, generator, modelnos)?;
            let store = PartitionStore::new(conn);
            let mut hits = vec![0usize; queries.len()];
            for modelno in &modelnos {
                let kind = store.kind_id(generator, *modelno, colno)?;
                let target_partition = store.partition_id(generator, *modelno, kind, target)?;
                for (hit, query) in hits.iter_mut().zip(queries) {
                    if store.partition_id(generator, *modelno, kind, *query)? == target_partition {
                        *hit += 1;
                    }
                }
            }
            Ok(hits
                .into_iter()
                .map(|hit| hit as f64 / modelnos.len() as f64)
                .collect())
        })
    }

    /// Impute one cell of a row with a confidence score.
    ///
    /// Categorical columns return the most frequent simulated value and its
    /// frequency; other columns return the mean with confidence 0.
    pub fn predict_confidence(
        &self,
        host: &HostConnection,
        generator: GeneratorId,
        modelnos: Option<&[ModelNo]>,
        rowid: RowId,
        colno: ColNo,
        numsamples: Option<usize>,
    ) -> Result<(Value, f64)> {
        let numsamples = numsamples.unwrap_or(self.config.query.default_predict_samples);
        if numsamples == 0 {
            return Err(Error::InvalidArgument("numsamples must be positive".to_string()));
        }
        let samples = self.simulate_joint(host, generator, modelnos, rowid, &[colno], &[], numsamples)?;
        let stattype = host.with(|conn| {
            let population = self.catalog().generator_population(conn, generator)?;
            self.catalog().variable_stattype(conn, population, colno)
        })?;
        let draws: Vec<Value> = samples.into_iter().filter_map(|row| row.into_iter().next()).collect();

        if stattype.is_categorical() {
            let (mode, count) = mode_of(&draws)
                .ok_or_else(|| Error::engine(generator, "prediction returned no rows"))?;
            Ok((mode, count as f64 / numsamples as f64))
        } else {
            let values: Vec<f64> = draws.iter().filter_map(Value::as_f64).collect();
            if values.is_empty() {
                return Err(Error::engine(generator, "prediction returned no numeric rows"));
            }
            let mean = values.iter().sum::<f64>() / values.len() as f64;
            Ok((Value::Real(mean), 0.0))
        }
    }

    /// Simulate `num_samples` joint draws of the target columns.
    ///
    /// For an existing row, its non-null stored values join the constraints.
    /// A constraint that disagrees with the row, or that names a target, is a
    /// conflict.
    #[allow(clippy::too_many_arguments)]
    pub fn simulate_joint(
        &self,
        host: &HostConnection,
        generator: GeneratorId,
        _modelnos: Option<&[ModelNo]>,
        rowid: RowId,
        targets: &[ColNo],
        constraints: &[(ColNo, Value)],
        num_samples: usize,
    ) -> Result<Vec<Vec<Value>>> {
        if num_samples == 0 {
            return Err(Error::InvalidArgument("num_samples must be positive".to_string()));
        }
        let target_set: BTreeSet<ColNo> = targets.iter().copied().collect();
        if let Some((colno, _)) = constraints.iter().find(|(colno, _)| target_set.contains(colno)) {
            return Err(Error::ConstraintConflict { colno: *colno });
        }

        let (context, request, target_names, affinities) = host.with(|conn| {
            let context = self.context(conn, generator)?;
            let mut merged: Vec<(ColNo, Value)> = constraints.to_vec();
            let fresh = self.catalog().fresh_row_id(conn, context.population)?;
            if rowid != fresh {
                let colnos = self.catalog().variable_numbers(conn, context.population)?;
                let stored = self.catalog().row_values(conn, context.population, rowid, &colnos)?;
                for (colno, value) in colnos.into_iter().zip(stored) {
                    if value.is_null() || target_set.contains(&colno) {
                        continue;
                    }
                    match constraints.iter().find(|(c, _)| *c == colno) {
                        Some((_, given)) if values_agree(given, &value) => {}
                        Some(_) => return Err(Error::ConstraintConflict { colno }),
                        None => merged.push((colno, value)),
                    }
                }
            }

            let target_names = self.variable_names(conn, &context, targets)?;
            let mut request = PredictRequest::default();
            let mut seen = BTreeSet::new();
            let mut push = |name: &str, field: String| -> Result<()> {
                let lower = name.to_lowercase();
                if !seen.insert(lower.clone()) {
                    return Err(Error::DuplicateHeader(lower));
                }
                request.header.push(lower);
                request.values.push(field);
                Ok(())
            };
            for name in &target_names {
                push(name, String::new())?;
            }
            for (colno, value) in &merged {
                let name = self.catalog().variable_name(conn, context.population, *colno)?;
                push(&name, value.to_field())?;
            }

            let mut affinities = Vec::with_capacity(targets.len());
            for colno in targets {
                affinities.push(self.catalog().variable_stattype(conn, context.population, *colno)?.affinity());
            }
            Ok((context, request, target_names, affinities))
        })?;

        debug!(
            "Simulating {} draws of {:?} for generator {} row {}",
            num_samples, target_names, generator, rowid
        );
        let server = self.predict_server(host, &context)?;
        let output = self.server_result(host, generator, ServerKey::Predict, server.predict(&request, num_samples))?;
        parse_predictions(generator, &output, &target_names, &affinities)
    }

    /// log P(targets | constraints) as the difference of two joint scores.
    pub fn logpdf_joint(
        &self,
        host: &HostConnection,
        generator: GeneratorId,
        _modelnos: Option<&[ModelNo]>,
        _rowid: RowId,
        targets: &[(ColNo, Value)],
        constraints: &[(ColNo, Value)],
    ) -> Result<f64> {
        let (context, and_case, conditional_case) = host.with(|conn| {
            let context = self.context(conn, generator)?;
            let store = PartitionStore::new(conn);
            let width = store.order(generator)?.len();
            let mut and_case: Vec<Option<EngineValue>> = vec![None; width];
            let mut conditional_case: Vec<Option<EngineValue>> = vec![None; width];

            let slot = |colno: ColNo| -> Result<usize> {
                let rank = store.rank(generator, colno)?.index()?;
                if rank >= width {
                    return Err(Error::InvalidPartition(format!(
                        "column {colno} has rank {rank} beyond {width} columns"
                    )));
                }
                Ok(rank)
            };
            for (colno, value) in targets {
                let rank = slot(*colno)?;
                and_case[rank] = self.engine_value(conn, &context, *colno, value)?;
                conditional_case[rank] = None;
            }
            for (colno, value) in constraints {
                let rank = slot(*colno)?;
                let encoded = self.engine_value(conn, &context, *colno, value)?;
                and_case[rank] = encoded;
                conditional_case[rank] = encoded;
            }
            Ok((context, and_case, conditional_case))
        })?;

        let server = self.query_server(host, &context)?;
        let joint = self.server_result(host, generator, ServerKey::Query, server.score(&and_case))?;
        let marginal = self.server_result(host, generator, ServerKey::Query, server.score(&conditional_case))?;
        Ok(joint - marginal)
    }

    fn variable_names(
        &self,
        conn: &duckdb::Connection,
        context: &GeneratorContext,
        colnos: &[ColNo],
    ) -> Result<Vec<String>> {
        colnos
            .iter()
            .map(|colno| self.catalog().variable_name(conn, context.population, *colno))
            .collect()
    }

    /// Coerce a host value to the engine's representation of its column.
    fn engine_value(
        &self,
        conn: &duckdb::Connection,
        context: &GeneratorContext,
        colno: ColNo,
        value: &Value,
    ) -> Result<Option<EngineValue>> {
        if value.is_null() {
            return Ok(None);
        }
        let generator = context.record.generator_id;
        match self.catalog().variable_stattype(conn, context.population, colno)?.affinity() {
            Affinity::Real => value.as_f64().map(|v| Some(EngineValue::Real(v))).ok_or_else(|| {
                Error::InvalidArgument(format!("column {colno} expects a number, got '{value}'"))
            }),
            Affinity::Text => {
                let code = PartitionStore::new(conn).integer_form(generator, colno, &value.to_field())?;
                Ok(Some(EngineValue::Code(code)))
            }
        }
    }
}

fn dense_fields(row: &[Value]) -> Vec<Option<String>> {
    row.iter()
        .map(|value| (!value.is_null()).then(|| value.to_field()))
        .collect()
}

/// Equal as numbers when both parse, otherwise as rendered fields.
fn values_agree(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a.to_field() == b.to_field(),
    }
}

/// Most frequent value; ties go to the value seen first.
fn mode_of(values: &[Value]) -> Option<(Value, usize)> {
    let mut counts: Vec<(String, usize, &Value)> = Vec::new();
    for value in values {
        let field = value.to_field();
        match counts.iter_mut().find(|(f, _, _)| *f == field) {
            Some(entry) => entry.1 += 1,
            None => counts.push((field, 1, value)),
        }
    }
    let mut best: Option<(&Value, usize)> = None;
    for (_, count, value) in counts {
        if best.map_or(true, |(_, c)| count > c) {
            best = Some((value, count));
        }
    }
    best.map(|(value, count)| (value.clone(), count))
}

/// Read the prediction server's CSV output back into target order.
fn parse_predictions(
    generator: GeneratorId,
    output: &str,
    target_names: &[String],
    affinities: &[Affinity],
) -> Result<Vec<Vec<Value>>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(output.as_bytes());
    let header: HashMap<String, usize> = reader
        .headers()?
        .iter()
        .enumerate()
        .map(|(i, name)| (name.trim().to_lowercase(), i))
        .collect();
    let mut positions = Vec::with_capacity(target_names.len());
    for name in target_names {
        let position = header.get(&name.to_lowercase()).ok_or_else(|| {
            Error::engine(generator, format!("prediction output lacks column '{name}'"))
        })?;
        positions.push(*position);
    }

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let mut row = Vec::with_capacity(positions.len());
        for (position, affinity) in positions.iter().zip(affinities) {
            let field = record.get(*position).unwrap_or_default().trim();
            row.push(match (field.is_empty(), affinity) {
                (true, _) => Value::Null,
                (false, Affinity::Real) => Value::Real(field.parse().map_err(|_| {
                    Error::engine(generator, format!("non-numeric prediction '{field}'"))
                })?),
                (false, Affinity::Text) => Value::Text(field.to_string()),
            });
        }
        rows.push(row);
    }
    Ok(rows)
}
