//! Shared constants for the bridge
//!
//! Centralizes the metamodel identity, engine file layout and query
//! defaults so the store, extractor and translator agree on them.

/// Metamodel registration
pub mod metamodel {
    /// Name the adapter registers under in the host's metamodel registry
    pub const NAME: &str = "loom";

    /// Current version of the adapter's table layout
    pub const SCHEMA_VERSION: i64 = 1;
}

/// Engine project layout, relative to a project directory
pub mod layout {
    /// Directory holding ingestion outputs
    pub const INGEST_DIR: &str = "ingest";

    /// Gzipped JSON column encoding written by ingestion
    pub const ENCODING_FILE: &str = "encoding.json.gz";

    /// Directory holding one subdirectory per trained model
    pub const SAMPLES_DIR: &str = "samples";

    /// Prefix of each per-model directory (`sample.<modelno>`)
    pub const SAMPLE_PREFIX: &str = "sample.";

    /// Column-kind structure of a model
    pub const MODEL_FILE: &str = "model.pb.gz";

    /// Row assignment stream of a model
    pub const ASSIGN_FILE: &str = "assign.pbs.gz";

    /// Environment variable the engine reads its store root from
    pub const STORE_ENV: &str = "LOOM_STORE";
}

/// Query defaults
pub mod defaults {
    /// Draws used by confidence-scored prediction when none are requested
    pub const PREDICT_SAMPLES: usize = 2;

    /// Samples the engine uses to estimate mutual information
    pub const MUTUAL_INFORMATION_SAMPLES: usize = 1000;

    /// Timestamp format for generated project names
    pub const PROJECT_TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S%.6f";
}
