//! Error types for the bridge.

use std::path::PathBuf;
use std::result;

use crate::types::{ColNo, GeneratorId, KindId, ModelNo, PopulationId, RowId};

/// A specialized Result type for bridge operations.
pub type Result<T> = result::Result<T, Error>;

/// The error type for bridge operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The adapter schema has not been registered on this connection
    #[error("Metamodel '{0}' is not registered")]
    NotRegistered(String),

    /// No generator record exists for the id
    #[error("Unknown generator: {0}")]
    UnknownGenerator(GeneratorId),

    /// A model number with no stored partition
    #[error("Generator {generator} has no model {modelno}")]
    MissingModel { generator: GeneratorId, modelno: ModelNo },

    /// A column with no order or encoding entry
    #[error("Generator {generator} has no column {colno}")]
    MissingColumn { generator: GeneratorId, colno: ColNo },

    /// A row id that does not exist in the host table
    #[error("Population {population} has no row {rowid}")]
    MissingRow { population: PopulationId, rowid: RowId },

    /// A string value with no integer code in the column encoding
    #[error("No encoding for value '{value}' in column {colno} of generator {generator}")]
    MissingEncoding {
        generator: GeneratorId,
        colno: ColNo,
        value: String,
    },

    /// A row with no partition in the given kind
    #[error("Generator {generator} model {modelno} has no partition for row {rowid} in kind {kind}")]
    MissingPartition {
        generator: GeneratorId,
        modelno: ModelNo,
        kind: KindId,
        rowid: RowId,
    },

    /// Host catalog lookup failure
    #[error("Catalog error: {0}")]
    Catalog(String),

    /// Constraint and target disagree on a column
    #[error("Conflict between constraints and target row on column {colno}")]
    ConstraintConflict { colno: ColNo },

    /// Two request columns collapse to the same engine header
    #[error("Duplicate engine column header: {0}")]
    DuplicateHeader(String),

    /// Missing or malformed per-model artifact
    #[error("Artifact error for generator {generator} model {modelno} at {path:?}: {message}")]
    Artifact {
        generator: GeneratorId,
        modelno: ModelNo,
        path: PathBuf,
        message: String,
    },

    /// Engine process or server failure
    #[error("Engine error for generator {generator}: {message}")]
    Engine { generator: GeneratorId, message: String },

    /// Engine task process failure, before it is attributed to a generator
    #[error("Engine task failed: {0}")]
    Task(String),

    /// No server factory was configured on the bridge
    #[error("No query servers are configured")]
    ServersUnavailable,

    /// A partition that violates its structural invariants
    #[error("Invalid partition: {0}")]
    InvalidPartition(String),

    /// Invalid caller-supplied argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Database error: {0}")]
    Database(#[from] duckdb::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl Error {
    /// Lookup failures against stored schema, never silently defaulted.
    pub fn is_schema_error(&self) -> bool {
        matches!(
            self,
            Error::NotRegistered(_)
                | Error::UnknownGenerator(_)
                | Error::MissingModel { .. }
                | Error::MissingColumn { .. }
                | Error::MissingRow { .. }
                | Error::MissingEncoding { .. }
                | Error::MissingPartition { .. }
                | Error::Catalog(_)
        )
    }

    pub fn engine(generator: GeneratorId, message: impl Into<String>) -> Self {
        Error::Engine {
            generator,
            message: message.into(),
        }
    }

    /// Attribute a task failure to the generator it ran for.
    pub fn in_generator(self, generator: GeneratorId) -> Self {
        match self {
            Error::Task(message) => Error::Engine { generator, message },
            other => other,
        }
    }

    pub fn artifact(
        generator: GeneratorId,
        modelno: ModelNo,
        path: impl Into<PathBuf>,
        message: impl Into<String>,
    ) -> Self {
        Error::Artifact {
            generator,
            modelno,
            path: path.into(),
            message: message.into(),
        }
    }
}
