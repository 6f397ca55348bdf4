pub mod bridge;
pub mod config;
pub mod connection;
pub mod constants;
pub mod engine;
pub mod ensemble;
pub mod error;
pub mod extract;
pub mod partition;
pub mod server_cache;
pub mod storage;
pub mod types;

// Re-export commonly used types
pub use bridge::LoomBridge;
pub use config::{Args, BridgeConfig};
pub use connection::{ConnectionId, HostConnection};
pub use error::{Error, Result};
pub use partition::ModelPartition;
pub use storage::{HostCatalog, PartitionStore, SqlCatalog};
pub use types::{ColNo, GeneratorId, ModelNo, PopulationId, RowId, StatType, Value};
