//! The bridge between the host database and the inference engine.
//!
//! `LoomBridge` owns no database state. Every operation is handed the host
//! connection it runs against; durable facts live in the adapter tables and
//! engine servers live in a cache keyed by that connection's identity.

mod query;

use chrono::Local;
use duckdb::Connection;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::BridgeConfig;
use crate::connection::HostConnection;
use crate::constants::defaults;
use crate::engine::artifact::{self, EncodingEntry};
use crate::engine::paths::sanitize_name;
use crate::engine::{EngineRunner, PredictServer, ProjectPaths, QueryServer, ServerFactory};
use crate::ensemble::{self, Ensemble, EnsembleData, RankPartition};
use crate::error::{Error, Result};
use crate::extract::PartitionExtractor;
use crate::server_cache::{ServerCache, ServerHandle, ServerKey};
use crate::storage::{GeneratorRecord, HostCatalog, PartitionStore};
use crate::types::{ColNo, GeneratorId, ModelNo, PopulationId, StatType};

/// What the bridge knows about a generator it has created.
#[derive(Debug, Clone)]
pub(crate) struct GeneratorContext {
    pub record: GeneratorRecord,
    pub population: PopulationId,
}

impl GeneratorContext {
    pub fn project(&self) -> ProjectPaths {
        ProjectPaths::from_project_path(&self.record.project_path)
    }
}

pub struct LoomBridge {
    config: BridgeConfig,
    catalog: Arc<dyn HostCatalog>,
    runner: Arc<dyn EngineRunner>,
    servers: Option<Arc<dyn ServerFactory>>,
    cache: ServerCache,
}

impl LoomBridge {
    pub fn new(config: BridgeConfig, catalog: Arc<dyn HostCatalog>, runner: Arc<dyn EngineRunner>) -> Self {
        Self {
            config,
            catalog,
            runner,
            servers: None,
            cache: ServerCache::new(),
        }
    }

    /// Attach the factory used to open query and prediction servers.
    pub fn with_servers(mut self, servers: Arc<dyn ServerFactory>) -> Self {
        self.servers = Some(servers);
        self
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn cache(&self) -> &ServerCache {
        &self.cache
    }

    /// Install the adapter tables on the host. Returns whether this call
    /// installed them.
    pub fn register(&self, host: &HostConnection) -> Result<bool> {
        let installed = host.transaction(|tx| PartitionStore::new(tx).register())?;
        if installed {
            info!("Registered loom metamodel on {}", host.id());
        }
        Ok(installed)
    }

    /// Ingest the generator's population into a new engine project and
    /// record its column encodings and order.
    pub fn create_generator(&self, host: &HostConnection, generator: GeneratorId) -> Result<GeneratorRecord> {
        let (population, generator_name, variables, rows) = host.with(|conn| {
            let store = PartitionStore::new(conn);
            store.ensure_registered()?;
            if store.generator(generator).is_ok() {
                return Err(Error::InvalidArgument(format!(
                    "generator {generator} already has a loom project"
                )));
            }
            let population = self.catalog.generator_population(conn, generator)?;
            let generator_name = self.catalog.generator_name(conn, generator)?;
            let mut variables = Vec::new();
            for colno in self.catalog.variable_numbers(conn, population)? {
                let name = self.catalog.variable_name(conn, population, colno)?;
                let stattype = self.catalog.variable_stattype(conn, population, colno)?;
                variables.push((colno, name, stattype));
            }
            let colnos: Vec<ColNo> = variables.iter().map(|(colno, _, _)| *colno).collect();
            let rows = self.catalog.population_rows(conn, population, &colnos)?;
            Ok((population, generator_name, variables, rows))
        })?;

        let prefix = match &self.config.store.project_prefix {
            Some(prefix) => prefix.clone(),
            None => Local::now().format(defaults::PROJECT_TIMESTAMP_FORMAT).to_string(),
        };
        let project = ProjectPaths::new(
            &self.config.store.path,
            format!("{}_{}", prefix, sanitize_name(&generator_name)),
        );
        if host.with(|conn| PartitionStore::new(conn).generator_name_exists(project.name()))? {
            return Err(Error::InvalidArgument(format!(
                "loom project {} is already in use",
                project.name()
            )));
        }
        fs::create_dir_all(project.store())?;

        let staging = tempfile::tempdir()?;
        let rows_csv = staging.path().join("rows.csv");
        let mut writer = csv::Writer::from_path(&rows_csv)?;
        writer.write_record(variables.iter().map(|(_, name, _)| name.as_str()))?;
        for row in &rows {
            writer.write_record(row.iter().map(|value| value.to_field()))?;
        }
        writer.flush()?;

        let schema_json = staging.path().join("schema.json");
        let schema: BTreeMap<&str, &str> = variables
            .iter()
            .map(|(_, name, stattype)| (name.as_str(), stattype.engine_model()))
            .collect();
        fs::write(&schema_json, serde_json::to_vec(&schema)?)?;

        info!(
            "Creating loom project {} for generator {} ({} rows, {} columns)",
            project.name(),
            generator,
            rows.len(),
            variables.len()
        );
        self.runner
            .ingest(project.store(), project.name(), &rows_csv, &schema_json)
            .map_err(|e| e.in_generator(generator))?;

        let encoding_path = project.encoding();
        let encoding = artifact::read_encoding(&encoding_path).map_err(|e| {
            Error::engine(
                generator,
                format!("reading {}: {}", encoding_path.display(), e),
            )
        })?;
        let order = encoding_order(generator, &encoding, &variables)?;

        let record = GeneratorRecord {
            generator_id: generator,
            name: project.name().to_string(),
            project_path: project.root(),
        };
        host.transaction(|tx| {
            let store = PartitionStore::new(tx);
            store.insert_generator(&record)?;
            for (entry, colno) in encoding.iter().zip(&order) {
                if let Some(symbols) = &entry.symbols {
                    store.insert_encoding(generator, *colno, symbols)?;
                }
            }
            store.insert_order(generator, &order)
        })?;
        debug!("Generator {} bound to population {}", generator, population);
        Ok(record)
    }

    /// Record how many models the generator has.
    pub fn initialize_models(&self, host: &HostConnection, generator: GeneratorId, modelnos: &[ModelNo]) -> Result<()> {
        host.transaction(|tx| {
            self.context(tx, generator)?;
            PartitionStore::new(tx).set_model_count(generator, modelnos.len())
        })?;
        self.cache.invalidate_generator(generator);
        info!("Initialized {} models for generator {}", modelnos.len(), generator);
        Ok(())
    }

    /// Train the requested models (all when `None`) and rebuild their partitions.
    ///
    /// The engine trains models `0..n`, so a subset run retrains every model
    /// up to the highest one requested. All of them are re-extracted, keeping
    /// stored partitions in step with the artifacts servers will read.
    pub fn analyze_models(
        &self,
        host: &HostConnection,
        generator: GeneratorId,
        modelnos: Option<&[ModelNo]>,
    ) -> Result<()> {
        let (context, sample_count, order, num_rows) = host.with(|conn| {
            let context = self.context(conn, generator)?;
            let store = PartitionStore::new(conn);
            let count = store.model_count(generator)?;
            let sample_count = match modelnos {
                None => count,
                Some(modelnos) => {
                    if let Some(bad) = modelnos.iter().find(|m| m.0 < 0 || m.0 as usize >= count) {
                        return Err(Error::MissingModel {
                            generator,
                            modelno: *bad,
                        });
                    }
                    modelnos.iter().map(|m| m.0 as usize + 1).max().unwrap_or(0)
                }
            };
            let order = store.order(generator)?;
            let num_rows = self.catalog.row_count(conn, context.population)?;
            Ok((context, sample_count, order, num_rows))
        })?;
        if sample_count == 0 {
            return Err(Error::InvalidArgument(format!(
                "generator {generator} has no models to analyze"
            )));
        }

        let project = context.project();
        self.runner
            .infer(project.store(), project.name(), sample_count)
            .map_err(|e| e.in_generator(generator))?;

        let trained: Vec<ModelNo> = (0..sample_count as i64).map(ModelNo).collect();
        let partitions = PartitionExtractor::new(&project, generator, &order, num_rows).extract_all(&trained)?;
        host.transaction(|tx| {
            let store = PartitionStore::new(tx);
            for partition in &partitions {
                store.replace_partition(generator, partition)?;
            }
            Ok(())
        })?;
        self.cache.invalidate_generator(generator);
        info!(
            "Analyzed {} models of generator {} over {} rows",
            partitions.len(),
            generator,
            num_rows
        );
        Ok(())
    }

    /// Remove the partitions of the listed models, or of every model.
    pub fn drop_models(
        &self,
        host: &HostConnection,
        generator: GeneratorId,
        modelnos: Option<&[ModelNo]>,
    ) -> Result<()> {
        host.transaction(|tx| {
            self.context(tx, generator)?;
            PartitionStore::new(tx).delete_models(generator, modelnos)
        })?;
        self.cache.invalidate_generator(generator);
        info!("Dropped models {:?} of generator {}", modelnos, generator);
        Ok(())
    }

    /// Remove everything the adapter stores for the generator.
    pub fn drop_generator(&self, host: &HostConnection, generator: GeneratorId) -> Result<()> {
        host.transaction(|tx| {
            self.context(tx, generator)?;
            PartitionStore::new(tx).delete_generator(generator)
        })?;
        self.cache.invalidate_generator(generator);
        info!("Dropped generator {}", generator);
        Ok(())
    }

    /// Release every cached server bound to the connection.
    pub fn disconnect(&self, host: &HostConnection) {
        self.cache.forget_connection(host.id());
    }

    /// Host columns of the generator in engine rank order.
    pub fn column_order(&self, host: &HostConnection, generator: GeneratorId) -> Result<Vec<ColNo>> {
        host.with(|conn| {
            self.context(conn, generator)?;
            PartitionStore::new(conn).order(generator)
        })
    }

    /// Data matrix of the generator's rows in engine rank order, text
    /// columns replaced by their integer codes.
    pub fn load_ensemble_data(&self, host: &HostConnection, generator: GeneratorId) -> Result<EnsembleData> {
        host.with(|conn| {
            let context = self.context(conn, generator)?;
            let store = PartitionStore::new(conn);
            let order = store.order(generator)?;
            let rows = self.catalog.population_rows(conn, context.population, &order)?;

            let mut data = EnsembleData::default();
            for (rank, colno) in order.iter().enumerate() {
                let stattype = self.catalog.variable_stattype(conn, context.population, *colno)?;
                let values = rows.iter().map(|row| &row[rank]);
                if stattype.is_categorical() {
                    let symbols = store.encoding(generator, *colno)?;
                    let mut codes = Vec::with_capacity(rows.len());
                    for value in values {
                        if value.is_null() {
                            codes.push(None);
                            continue;
                        }
                        let field = value.to_field();
                        let code = symbols.get(&field).ok_or_else(|| Error::MissingEncoding {
                            generator,
                            colno: *colno,
                            value: field.clone(),
                        })?;
                        codes.push(Some(*code as f64));
                    }
                    data.push_categorical(codes, symbols.len());
                } else {
                    data.push_numeric(values.map(|value| value.as_f64()).collect());
                }
            }
            Ok(data)
        })
    }

    /// Stored partitions of the listed models, re-keyed by engine rank.
    pub fn rank_partitions(
        &self,
        host: &HostConnection,
        generator: GeneratorId,
        modelnos: &[ModelNo],
    ) -> Result<Vec<RankPartition>> {
        host.with(|conn| {
            self.context(conn, generator)?;
            let store = PartitionStore::new(conn);
            let order = store.order(generator)?;
            modelnos
                .iter()
                .map(|modelno| RankPartition::from_model(&store.load_partition(generator, *modelno)?, &order))
                .collect()
        })
    }

    /// Rewrite every ensemble member to the stored partition of the model
    /// with the same number.
    pub fn populate_ensemble(
        &self,
        host: &HostConnection,
        generator: GeneratorId,
        ensemble: &mut Ensemble,
    ) -> Result<()> {
        let modelnos: Vec<ModelNo> = (0..ensemble.num_members() as i64).map(ModelNo).collect();
        let partitions = self.rank_partitions(host, generator, &modelnos)?;
        ensemble::reconcile(ensemble, &partitions, &self.config.reconcile)
    }

    /// Resolve a generator the bridge created, as a schema error if unknown.
    pub(crate) fn context(&self, conn: &Connection, generator: GeneratorId) -> Result<GeneratorContext> {
        let store = PartitionStore::new(conn);
        store.ensure_registered()?;
        let record = store.generator(generator)?;
        let population = self.catalog.generator_population(conn, generator)?;
        Ok(GeneratorContext { record, population })
    }

    /// Model numbers a query covers: the given set, or every trained model.
    pub(crate) fn model_numbers(
        &self,
        conn: &Connection,
        generator: GeneratorId,
        modelnos: Option<&[ModelNo]>,
    ) -> Result<Vec<ModelNo>> {
        let modelnos = match modelnos {
            Some(modelnos) => modelnos.to_vec(),
            None => {
                let count = PartitionStore::new(conn).model_count(generator)?;
                (0..count as i64).map(ModelNo).collect()
            }
        };
        if modelnos.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "generator {generator} has no trained models"
            )));
        }
        Ok(modelnos)
    }

    fn server_factory(&self) -> Result<&Arc<dyn ServerFactory>> {
        self.servers.as_ref().ok_or(Error::ServersUnavailable)
    }

    pub(crate) fn query_server(
        &self,
        host: &HostConnection,
        context: &GeneratorContext,
    ) -> Result<Arc<dyn QueryServer>> {
        let generator = context.record.generator_id;
        if let Some(ServerHandle::Query(server)) = self.cache.get(host.id(), generator, ServerKey::Query) {
            return Ok(server);
        }
        let server: Arc<dyn QueryServer> = Arc::from(
            self.server_factory()?
                .open_query_server(&context.project())
                .map_err(|e| e.in_generator(generator))?,
        );
        self.cache.set(host.id(), generator, ServerHandle::Query(Arc::clone(&server)));
        Ok(server)
    }

    pub(crate) fn predict_server(
        &self,
        host: &HostConnection,
        context: &GeneratorContext,
    ) -> Result<Arc<dyn PredictServer>> {
        let generator = context.record.generator_id;
        if let Some(ServerHandle::Predict(server)) = self.cache.get(host.id(), generator, ServerKey::Predict) {
            return Ok(server);
        }
        let server: Arc<dyn PredictServer> = Arc::from(
            self.server_factory()?
                .open_predict_server(&context.project())
                .map_err(|e| e.in_generator(generator))?,
        );
        self.cache.set(host.id(), generator, ServerHandle::Predict(Arc::clone(&server)));
        Ok(server)
    }

    /// Tag a server failure with its generator and evict the failing handle,
    /// so the next query reopens the server.
    pub(crate) fn server_result<T>(
        &self,
        host: &HostConnection,
        generator: GeneratorId,
        key: ServerKey,
        result: Result<T>,
    ) -> Result<T> {
        result.map_err(|e| {
            self.cache.invalidate(host.id(), generator, Some(key));
            e.in_generator(generator)
        })
    }

    pub(crate) fn catalog(&self) -> &dyn HostCatalog {
        self.catalog.as_ref()
    }
}

/// Host column of each rank in the ingest encoding. The encoding must list
/// every population variable exactly once.
fn encoding_order(
    generator: GeneratorId,
    encoding: &[EncodingEntry],
    variables: &[(ColNo, String, StatType)],
) -> Result<Vec<ColNo>> {
    let by_name: HashMap<String, ColNo> = variables
        .iter()
        .map(|(colno, name, _)| (name.to_lowercase(), *colno))
        .collect();
    let mut seen = BTreeSet::new();
    let mut order = Vec::with_capacity(encoding.len());
    for entry in encoding {
        let colno = by_name.get(&entry.name.to_lowercase()).ok_or_else(|| {
            Error::engine(generator, format!("encoding names unknown column '{}'", entry.name))
        })?;
        if !seen.insert(*colno) {
            return Err(Error::engine(
                generator,
                format!("encoding lists column '{}' twice", entry.name),
            ));
        }
        order.push(*colno);
    }
    if order.len() != variables.len() {
        return Err(Error::engine(
            generator,
            format!("encoding covers {} of {} columns", order.len(), variables.len()),
        ));
    }
    Ok(order)
}
