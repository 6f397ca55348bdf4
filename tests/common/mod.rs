//! Common test utilities: an in-process engine, recording servers and a
//! populated host database.
#![allow(dead_code)]

use loombridge_core::engine::artifact::{self, Assignment, CrossCat, EncodingEntry, Kind};
use loombridge_core::engine::{
    EngineRunner, EngineValue, PredictRequest, PredictServer, ProjectPaths, QueryServer, ServerFactory,
};
use loombridge_core::{
    BridgeConfig, ColNo, Error, GeneratorId, HostConnection, LoomBridge, ModelNo, PopulationId, Result,
    SqlCatalog, StatType,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

pub const COLOR: ColNo = ColNo(0);
pub const SIZE: ColNo = ColNo(1);
pub const SHAPE: ColNo = ColNo(2);
pub const WEIGHT: ColNo = ColNo(3);

const PEOPLE: &str = r#"
CREATE TABLE people (color VARCHAR, size DOUBLE, shape VARCHAR, weight DOUBLE);
INSERT INTO people VALUES
    ('red', 1.0, 'round', 10.0),
    ('blue', 2.0, 'square', 20.0),
    ('red', NULL, 'round', 30.0),
    ('green', 4.0, NULL, 40.0);
"#;

/// Column-kind layout and row clustering of one trained model.
#[derive(Debug, Clone)]
pub struct ModelPlan {
    /// Column names of each kind.
    pub kinds: Vec<Vec<&'static str>>,
    /// Cluster of each host row, per kind.
    pub clusters: Vec<Vec<u32>>,
}

/// Three models over the `people` table:
/// color and size share a kind in models 0 and 1, shape and weight always
/// share one, color and weight never do.
pub fn three_models() -> Vec<ModelPlan> {
    vec![
        ModelPlan {
            kinds: vec![vec!["color", "size"], vec!["shape", "weight"]],
            clusters: vec![vec![0, 0, 1, 1], vec![0, 1, 0, 1]],
        },
        ModelPlan {
            kinds: vec![vec!["color", "size"], vec!["shape", "weight"]],
            clusters: vec![vec![0, 1, 0, 1], vec![0, 0, 0, 0]],
        },
        ModelPlan {
            kinds: vec![vec!["color"], vec!["size", "shape", "weight"]],
            clusters: vec![vec![0, 0, 0, 1], vec![0, 1, 1, 0]],
        },
    ]
}

/// Engine stand-in that writes byte-compatible project files.
///
/// Ingestion ranks columns in reverse header order and codes categorical
/// values in sorted order. Training writes the configured plans, with row
/// assignments in descending engine row id. Training more models than there
/// are plans fails.
#[derive(Default)]
pub struct FakeEngine {
    plans: Mutex<Vec<ModelPlan>>,
    corrupt: Mutex<Option<ModelNo>>,
    pub infer_calls: Mutex<Vec<usize>>,
}

impl FakeEngine {
    pub fn set_plans(&self, plans: Vec<ModelPlan>) {
        *self.plans.lock() = plans;
    }

    /// Write an unreadable model file for `modelno` on the next training run.
    pub fn corrupt_model(&self, modelno: Option<ModelNo>) {
        *self.corrupt.lock() = modelno;
    }
}

fn task_error(e: impl std::fmt::Display) -> Error {
    Error::Task(e.to_string())
}

impl EngineRunner for FakeEngine {
    fn ingest(&self, store: &Path, name: &str, rows_csv: &Path, schema: &Path) -> Result<()> {
        let models: BTreeMap<String, String> = serde_json::from_slice(&fs::read(schema)?)?;
        let mut reader = csv::Reader::from_path(rows_csv)?;
        let header: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        let mut columns: Vec<BTreeSet<String>> = vec![BTreeSet::new(); header.len()];
        for record in reader.records() {
            let record = record?;
            for (values, field) in columns.iter_mut().zip(record.iter()) {
                if !field.is_empty() {
                    values.insert(field.to_string());
                }
            }
        }

        let mut entries = Vec::with_capacity(header.len());
        for (column, values) in header.iter().zip(columns).rev() {
            let categorical = matches!(models.get(column).map(String::as_str), Some("dd") | Some("dpd"));
            entries.push(EncodingEntry {
                name: column.clone(),
                symbols: categorical.then(|| {
                    values
                        .into_iter()
                        .enumerate()
                        .map(|(code, value)| (value, code as i64))
                        .collect()
                }),
            });
        }
        artifact::write_encoding(&ProjectPaths::new(store, name).encoding(), &entries).map_err(task_error)
    }

    fn infer(&self, store: &Path, name: &str, sample_count: usize) -> Result<()> {
        self.infer_calls.lock().push(sample_count);
        let project = ProjectPaths::new(store, name);
        let encoding = artifact::read_encoding(&project.encoding()).map_err(task_error)?;
        let ranks: HashMap<&str, u32> = encoding
            .iter()
            .enumerate()
            .map(|(rank, entry)| (entry.name.as_str(), rank as u32))
            .collect();

        let plans = self.plans.lock();
        let corrupt = *self.corrupt.lock();
        for modelno in 0..sample_count {
            let modelno = ModelNo(modelno as i64);
            let plan = plans
                .get(modelno.0 as usize)
                .ok_or_else(|| Error::Task(format!("no plan for model {modelno}")))?;

            let model = CrossCat {
                kinds: plan
                    .kinds
                    .iter()
                    .map(|columns| Kind {
                        featureids: columns.iter().map(|c| ranks[*c]).collect(),
                    })
                    .collect(),
            };
            if corrupt == Some(modelno) {
                fs::create_dir_all(project.sample_dir(modelno))?;
                fs::write(project.model(modelno), b"not a model")?;
            } else {
                artifact::write_model(&project.model(modelno), &model).map_err(task_error)?;
            }

            let num_rows = plan.clusters.first().map_or(0, Vec::len);
            let assignments: Vec<Assignment> = (0..num_rows)
                .rev()
                .map(|row| Assignment {
                    rowid: row as u64,
                    groupids: plan.clusters.iter().map(|kind| kind[row]).collect(),
                })
                .collect();
            artifact::write_assignments(&project.assignments(modelno), &assignments).map_err(task_error)?;
        }
        Ok(())
    }
}

/// Deterministic stand-in for the engine's joint log density.
pub fn fake_score(row: &[Option<EngineValue>]) -> f64 {
    row.iter()
        .flatten()
        .map(|value| match value {
            EngineValue::Real(x) => -0.5 * x * x - 0.9,
            EngineValue::Code(code) => -((*code as f64) + 2.0).ln(),
        })
        .sum()
}

/// Everything the fake servers were asked.
#[derive(Default)]
pub struct ServerLog {
    pub scores: Mutex<Vec<Vec<Option<EngineValue>>>>,
    pub requests: Mutex<Vec<(PredictRequest, usize)>>,
    pub similar: Mutex<Vec<(Vec<Option<String>>, Vec<Option<String>>)>>,
    pub mutual_information: Mutex<Vec<(Vec<String>, Vec<String>, usize)>>,
    pub opened_query: AtomicUsize,
    pub opened_predict: AtomicUsize,
    pub failing_scores: AtomicBool,
}

#[derive(Default)]
pub struct FakeServers {
    pub log: Arc<ServerLog>,
    predictions: Arc<Mutex<HashMap<String, Vec<String>>>>,
}

impl FakeServers {
    /// Values the prediction server cycles through for a simulated column.
    pub fn predict_values(&self, column: &str, values: &[&str]) {
        self.predictions
            .lock()
            .insert(column.to_string(), values.iter().map(|v| v.to_string()).collect());
    }

    /// Make every query server fail its score calls until reset.
    pub fn fail_scores(&self, fail: bool) {
        self.log.failing_scores.store(fail, Ordering::SeqCst);
    }

    pub fn opened_query(&self) -> usize {
        self.log.opened_query.load(Ordering::SeqCst)
    }

    pub fn opened_predict(&self) -> usize {
        self.log.opened_predict.load(Ordering::SeqCst)
    }
}

struct FakeQueryServer {
    log: Arc<ServerLog>,
}

impl QueryServer for FakeQueryServer {
    fn score(&self, row: &[Option<EngineValue>]) -> Result<f64> {
        if self.log.failing_scores.load(Ordering::SeqCst) {
            return Err(Error::Task("query server exited".to_string()));
        }
        self.log.scores.lock().push(row.to_vec());
        Ok(fake_score(row))
    }

    fn mutual_information(&self, names0: &[String], names1: &[String], sample_count: usize) -> Result<f64> {
        self.log
            .mutual_information
            .lock()
            .push((names0.to_vec(), names1.to_vec(), sample_count));
        Ok(0.25)
    }
}

struct FakePredictServer {
    log: Arc<ServerLog>,
    predictions: Arc<Mutex<HashMap<String, Vec<String>>>>,
}

impl PredictServer for FakePredictServer {
    fn predict(&self, request: &PredictRequest, count: usize) -> Result<String> {
        self.log.requests.lock().push((request.clone(), count));
        let predictions = self.predictions.lock();
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(&request.header)?;
        for draw in 0..count {
            let row: Vec<String> = request
                .header
                .iter()
                .zip(&request.values)
                .map(|(column, given)| match (given.is_empty(), predictions.get(column)) {
                    (true, Some(values)) if !values.is_empty() => values[draw % values.len()].clone(),
                    _ => given.clone(),
                })
                .collect();
            writer.write_record(&row)?;
        }
        let bytes = writer.into_inner().map_err(task_error)?;
        String::from_utf8(bytes).map_err(task_error)
    }

    fn similar(&self, row: &[Option<String>], target: &[Option<String>]) -> Result<f64> {
        self.log.similar.lock().push((row.to_vec(), target.to_vec()));
        Ok(0.75)
    }
}

impl ServerFactory for FakeServers {
    fn open_query_server(&self, _project: &ProjectPaths) -> Result<Box<dyn QueryServer>> {
        self.log.opened_query.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeQueryServer {
            log: Arc::clone(&self.log),
        }))
    }

    fn open_predict_server(&self, _project: &ProjectPaths) -> Result<Box<dyn PredictServer>> {
        self.log.opened_predict.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakePredictServer {
            log: Arc::clone(&self.log),
            predictions: Arc::clone(&self.predictions),
        }))
    }
}

/// A registered host with one population, one generator and its loom project.
pub struct Fixture {
    pub host: HostConnection,
    pub bridge: LoomBridge,
    pub engine: Arc<FakeEngine>,
    pub servers: Arc<FakeServers>,
    pub population: PopulationId,
    pub generator: GeneratorId,
    pub store: TempDir,
}

impl Fixture {
    /// Generator created, no models initialized.
    pub fn new() -> Self {
        let store = tempfile::tempdir().unwrap();
        let host = HostConnection::open_in_memory().unwrap();
        host.execute_batch(PEOPLE).unwrap();

        let catalog = SqlCatalog::new();
        let (population, generator) = host
            .with(|conn| {
                catalog.install(conn)?;
                let population = catalog.create_population(
                    conn,
                    "people",
                    "people",
                    &[
                        ("color", StatType::Categorical),
                        ("size", StatType::Numerical),
                        ("shape", StatType::Nominal),
                        ("weight", StatType::Numerical),
                    ],
                )?;
                let generator = catalog.create_generator(conn, population, "g")?;
                Ok((population, generator))
            })
            .unwrap();

        let mut config = BridgeConfig::with_store(store.path());
        config.store.project_prefix = Some("test".to_string());
        config.reconcile.seed = 5;

        let engine = Arc::new(FakeEngine::default());
        let servers = Arc::new(FakeServers::default());
        let bridge = LoomBridge::new(config, Arc::new(catalog), engine.clone()).with_servers(servers.clone());
        bridge.register(&host).unwrap();
        bridge.create_generator(&host, generator).unwrap();

        Self {
            host,
            bridge,
            engine,
            servers,
            population,
            generator,
            store,
        }
    }

    /// Generator with one trained model per plan.
    pub fn trained(plans: Vec<ModelPlan>) -> Self {
        let fixture = Self::new();
        let modelnos: Vec<ModelNo> = (0..plans.len() as i64).map(ModelNo).collect();
        fixture.engine.set_plans(plans);
        fixture
            .bridge
            .initialize_models(&fixture.host, fixture.generator, &modelnos)
            .unwrap();
        fixture
            .bridge
            .analyze_models(&fixture.host, fixture.generator, None)
            .unwrap();
        fixture
    }

    /// Bridge over the same host and engine, without servers.
    pub fn bridge_without_servers(&self) -> LoomBridge {
        LoomBridge::new(self.bridge.config().clone(), Arc::new(SqlCatalog::new()), self.engine.clone())
    }
}
