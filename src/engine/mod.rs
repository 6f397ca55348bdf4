//! Contracts of the external inference engine.
//!
//! The engine trains and serves models out of a project directory inside its
//! store. The bridge drives training through an [`EngineRunner`] and answers
//! queries through servers opened by a [`ServerFactory`].

pub mod artifact;
pub mod paths;
pub mod process;

use serde::Serialize;
use std::path::Path;

use crate::error::Result;

pub use paths::ProjectPaths;
pub use process::{LoomCli, LoomServers};

/// A value in the engine's encoded row representation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EngineValue {
    /// Real-affinity columns.
    Real(f64),
    /// Text-affinity columns, as the column encoding's integer code.
    Code(i64),
}

/// A single-row tabular request for the prediction server.
///
/// `header` holds lower-cased column names; `values` the matching string
/// fields, with the empty string marking a column to be simulated.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PredictRequest {
    pub header: Vec<String>,
    pub values: Vec<String>,
}

impl PredictRequest {
    /// Render the request as CSV text, header first.
    pub fn to_csv(&self) -> Result<String> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(&self.header)?;
        writer.write_record(&self.values)?;
        let bytes = writer
            .into_inner()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Training entry points of the engine.
pub trait EngineRunner: Send + Sync {
    /// Ingest `rows_csv` under the column-type `schema` file, creating the
    /// project `name` inside `store`.
    fn ingest(&self, store: &Path, name: &str, rows_csv: &Path, schema: &Path) -> Result<()>;

    /// Train `sample_count` models for project `name`, writing one artifact
    /// directory per model number.
    fn infer(&self, store: &Path, name: &str, sample_count: usize) -> Result<()>;
}

/// Scoring primitives bound to one trained project.
pub trait QueryServer: Send + Sync {
    /// Log density of a full-width, rank-ordered row; `None` marks unset columns.
    fn score(&self, row: &[Option<EngineValue>]) -> Result<f64>;

    /// Estimated mutual information between two column-name sets.
    fn mutual_information(&self, names0: &[String], names1: &[String], sample_count: usize) -> Result<f64>;
}

/// Prediction primitives bound to one trained project.
pub trait PredictServer: Send + Sync {
    /// Simulate `count` rows for the request, returned as CSV text whose header
    /// repeats the request header.
    fn predict(&self, request: &PredictRequest, count: usize) -> Result<String>;

    /// Similarity in [0, 1] between two dense rank-ordered rows.
    fn similar(&self, row: &[Option<String>], target: &[Option<String>]) -> Result<f64>;
}

/// Opens servers over a trained project.
pub trait ServerFactory: Send + Sync {
    fn open_query_server(&self, project: &ProjectPaths) -> Result<Box<dyn QueryServer>>;

    fn open_predict_server(&self, project: &ProjectPaths) -> Result<Box<dyn PredictServer>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predict_request_csv() {
        let request = PredictRequest {
            header: vec!["color".into(), "size".into()],
            values: vec!["".into(), "2.5".into()],
        };
        assert_eq!(request.to_csv().unwrap(), "color,size\n,2.5\n");
    }
}
