//! Durable state kept inside the host database.
//!
//! - `schema`: DDL for the metamodel registry and the adapter tables
//! - `store`: column encodings, column order and per-model partitions
//! - `catalog`: the host catalog the bridge reads populations and rows from

pub mod catalog;
pub mod schema;
pub mod store;

pub use catalog::{HostCatalog, SqlCatalog};
pub use store::{GeneratorRecord, PartitionStore};

/// Utility functions for SQL text
pub struct StorageUtils;

impl StorageUtils {
    /// Quote an identifier for interpolation into SQL
    pub fn quote_identifier(name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    /// Generate SQL for inserting a full row into a table
    pub fn generate_insert_sql(table_name: &str, column_count: usize) -> String {
        let placeholders = vec!["?"; column_count].join(", ");
        format!(
            "INSERT INTO {} VALUES ({})",
            Self::quote_identifier(table_name),
            placeholders
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_identifier() {
        assert_eq!(StorageUtils::quote_identifier("size"), "\"size\"");
        assert_eq!(StorageUtils::quote_identifier("a\"b"), "\"a\"\"b\"");
        assert_eq!(
            StorageUtils::generate_insert_sql("t", 3),
            "INSERT INTO \"t\" VALUES (?, ?, ?)"
        );
    }
}
