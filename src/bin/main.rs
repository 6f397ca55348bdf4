//! Loombridge binary.
//!
//! Drives the bridge against a DuckDB database file: registering the adapter,
//! creating and training generators, and answering queries from the store or
//! from engine servers.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use loombridge_core::{
    config::Args as ConfigArgs,
    engine::{LoomCli, LoomServers},
    BridgeConfig, ColNo, GeneratorId, HostCatalog, HostConnection, LoomBridge, ModelNo, RowId,
    SqlCatalog, Value,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Host database file
    #[arg(long, global = true, default_value = "loom.duckdb")]
    pub db: PathBuf,

    /// Log filter directives
    #[arg(long, global = true)]
    pub log_filter: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Install the adapter and catalog tables
    Register,
    /// Ingest a generator's population into a new engine project
    CreateGenerator { generator: String },
    /// Train models and rebuild their partitions
    Analyze {
        generator: String,
        #[arg(long, default_value_t = 1)]
        models: usize,
    },
    /// Probability that two columns are modeled as dependent
    Dependence {
        generator: String,
        column0: String,
        column1: String,
    },
    /// Simulate joint draws of columns, one CSV line per draw
    Simulate {
        generator: String,
        #[arg(required = true)]
        columns: Vec<String>,
        /// Existing row to condition on; a hypothetical row when absent
        #[arg(long)]
        row: Option<i64>,
        /// Constraint as column=value, repeatable
        #[arg(long = "given", value_parser = parse_assignment)]
        given: Vec<(String, String)>,
        #[arg(long, default_value_t = 1)]
        samples: usize,
    },
    /// Log density of target values given constraints
    Logpdf {
        generator: String,
        /// Target as column=value, repeatable
        #[arg(long = "target", required = true, value_parser = parse_assignment)]
        targets: Vec<(String, String)>,
        /// Constraint as column=value, repeatable
        #[arg(long = "given", value_parser = parse_assignment)]
        given: Vec<(String, String)>,
    },
    /// Remove trained partitions, all of them unless models are listed
    DropModels {
        generator: String,
        #[arg(long, value_delimiter = ',')]
        models: Option<Vec<i64>>,
    },
    /// Remove everything stored for a generator
    DropGenerator { generator: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .parse_lossy(cli.log_filter.as_deref().unwrap_or("loombridge_core=info")),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let config = BridgeConfig::load(&cli.config)?;
    let catalog = SqlCatalog::new();
    let bridge = LoomBridge::new(
        config.clone(),
        Arc::new(catalog),
        Arc::new(LoomCli::new(&config.engine)),
    )
    .with_servers(Arc::new(LoomServers::new(&config.engine)));
    let host = HostConnection::open(&cli.db)
        .with_context(|| format!("opening {}", cli.db.display()))?;
    info!("Opened {} as {}", cli.db.display(), host.id());

    let generator_id = |name: &str| -> Result<GeneratorId> {
        Ok(host.with(|conn| catalog.generator_by_name(conn, name))?)
    };

    match cli.command {
        Commands::Register => {
            host.with(|conn| catalog.install(conn))?;
            let installed = bridge.register(&host)?;
            println!("{}", if installed { "registered" } else { "already registered" });
        }
        Commands::CreateGenerator { generator } => {
            let record = bridge.create_generator(&host, generator_id(&generator)?)?;
            println!("{}", record.project_path.display());
        }
        Commands::Analyze { generator, models } => {
            let generator = generator_id(&generator)?;
            let modelnos: Vec<ModelNo> = (0..models as i64).map(ModelNo).collect();
            bridge.initialize_models(&host, generator, &modelnos)?;
            bridge.analyze_models(&host, generator, None)?;
        }
        Commands::Dependence {
            generator,
            column0,
            column1,
        } => {
            let generator = generator_id(&generator)?;
            let (colno0, colno1) = host.with(|conn| {
                let population = catalog.generator_population(conn, generator)?;
                Ok((
                    catalog.variable_colno(conn, population, &column0)?,
                    catalog.variable_colno(conn, population, &column1)?,
                ))
            })?;
            let probability = bridge.column_dependence_probability(&host, generator, None, colno0, colno1)?;
            println!("{probability}");
        }
        Commands::Simulate {
            generator,
            columns,
            row,
            given,
            samples,
        } => {
            let generator = generator_id(&generator)?;
            let (rowid, targets, constraints) = host.with(|conn| {
                let population = catalog.generator_population(conn, generator)?;
                let rowid = match row {
                    Some(row) => RowId(row),
                    None => catalog.fresh_row_id(conn, population)?,
                };
                let targets = columns
                    .iter()
                    .map(|name| catalog.variable_colno(conn, population, name))
                    .collect::<loombridge_core::Result<Vec<ColNo>>>()?;
                let constraints = resolve(&catalog, conn, population, &given)?;
                Ok((rowid, targets, constraints))
            })?;
            let draws = bridge.simulate_joint(&host, generator, None, rowid, &targets, &constraints, samples)?;
            let mut writer = csv::Writer::from_writer(std::io::stdout());
            writer.write_record(&columns)?;
            for draw in draws {
                writer.write_record(draw.iter().map(Value::to_field))?;
            }
            writer.flush()?;
        }
        Commands::Logpdf {
            generator,
            targets,
            given,
        } => {
            let generator = generator_id(&generator)?;
            let (rowid, targets, constraints) = host.with(|conn| {
                let population = catalog.generator_population(conn, generator)?;
                Ok((
                    catalog.fresh_row_id(conn, population)?,
                    resolve(&catalog, conn, population, &targets)?,
                    resolve(&catalog, conn, population, &given)?,
                ))
            })?;
            let logpdf = bridge.logpdf_joint(&host, generator, None, rowid, &targets, &constraints)?;
            println!("{logpdf}");
        }
        Commands::DropModels { generator, models } => {
            let modelnos: Option<Vec<ModelNo>> = models.map(|m| m.into_iter().map(ModelNo).collect());
            bridge.drop_models(&host, generator_id(&generator)?, modelnos.as_deref())?;
        }
        Commands::DropGenerator { generator } => {
            let generator = generator_id(&generator)?;
            bridge.drop_generator(&host, generator)?;
            host.with(|conn| catalog.remove_generator(conn, generator))?;
        }
    }

    bridge.disconnect(&host);
    Ok(())
}

fn parse_assignment(s: &str) -> std::result::Result<(String, String), String> {
    let (column, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected column=value, got '{s}'"))?;
    Ok((column.trim().to_string(), value.to_string()))
}

/// Column numbers for named assignments; numeric text becomes a real.
fn resolve(
    catalog: &SqlCatalog,
    conn: &duckdb::Connection,
    population: loombridge_core::PopulationId,
    assignments: &[(String, String)],
) -> loombridge_core::Result<Vec<(ColNo, Value)>> {
    assignments
        .iter()
        .map(|(name, value)| {
            let colno = catalog.variable_colno(conn, population, name)?;
            let value = value.parse::<f64>().map(Value::Real).unwrap_or_else(|_| Value::from(value.as_str()));
            Ok((colno, value))
        })
        .collect()
}
