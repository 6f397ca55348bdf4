//! Readers for the engine's serialized project files.
//!
//! Only the fields the bridge consumes are declared; everything else in the
//! engine's messages is skipped by the decoder. The writers exist so fakes
//! and fixtures can produce byte-compatible projects.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use prost::Message;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

/// Column-kind structure of one trained model.
#[derive(Clone, PartialEq, Message)]
pub struct CrossCat {
    #[prost(message, repeated, tag = "1")]
    pub kinds: Vec<Kind>,
}

/// One kind: the engine ranks of the columns it owns.
#[derive(Clone, PartialEq, Message)]
pub struct Kind {
    #[prost(uint32, repeated, tag = "2")]
    pub featureids: Vec<u32>,
}

/// Cluster assignment of one row, one group id per kind.
#[derive(Clone, PartialEq, Message)]
pub struct Assignment {
    #[prost(uint64, tag = "1")]
    pub rowid: u64,
    #[prost(uint32, repeated, tag = "2")]
    pub groupids: Vec<u32>,
}

/// One column of the ingest encoding, listed in rank order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodingEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbols: Option<BTreeMap<String, i64>>,
}

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Truncated stream: {0}")]
    Truncated(String),
}

pub type ArtifactResult<T> = std::result::Result<T, ArtifactError>;

fn read_gz(path: &Path) -> ArtifactResult<Vec<u8>> {
    let mut bytes = Vec::new();
    GzDecoder::new(File::open(path)?).read_to_end(&mut bytes)?;
    Ok(bytes)
}

fn write_gz(path: &Path, bytes: &[u8]) -> ArtifactResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut encoder = GzEncoder::new(File::create(path)?, Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()?;
    Ok(())
}

pub fn read_model(path: &Path) -> ArtifactResult<CrossCat> {
    Ok(CrossCat::decode(read_gz(path)?.as_slice())?)
}

/// Read a stream of little-endian `u32` length-prefixed assignments.
pub fn read_assignments(path: &Path) -> ArtifactResult<Vec<Assignment>> {
    let bytes = read_gz(path)?;
    let mut assignments = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let Some(prefix) = bytes.get(offset..offset + 4) else {
            return Err(ArtifactError::Truncated(format!(
                "length prefix at byte {offset}"
            )));
        };
        let len = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        offset += 4;
        let Some(message) = bytes.get(offset..offset + len) else {
            return Err(ArtifactError::Truncated(format!(
                "message of {len} bytes at byte {offset}"
            )));
        };
        assignments.push(Assignment::decode(message)?);
        offset += len;
    }
    Ok(assignments)
}

pub fn read_encoding(path: &Path) -> ArtifactResult<Vec<EncodingEntry>> {
    Ok(serde_json::from_slice(&read_gz(path)?)?)
}

pub fn write_model(path: &Path, model: &CrossCat) -> ArtifactResult<()> {
    write_gz(path, &model.encode_to_vec())
}

pub fn write_assignments(path: &Path, assignments: &[Assignment]) -> ArtifactResult<()> {
    let mut bytes = Vec::new();
    for assignment in assignments {
        let message = assignment.encode_to_vec();
        bytes.extend_from_slice(&(message.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&message);
    }
    write_gz(path, &bytes)
}

pub fn write_encoding(path: &Path, entries: &[EncodingEntry]) -> ArtifactResult<()> {
    write_gz(path, &serde_json::to_vec(entries)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_assignment_stream() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("samples/sample.0/assign.pbs.gz");
        let assignments = vec![
            Assignment { rowid: 7, groupids: vec![0, 1] },
            Assignment { rowid: 3, groupids: vec![2, 0] },
        ];
        write_assignments(&path, &assignments).unwrap();
        assert_eq!(read_assignments(&path).unwrap(), assignments);
    }

    #[test]
    fn test_truncated_stream_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("assign.pbs.gz");
        write_gz(&path, &[9, 0, 0, 0, 1, 2]).unwrap();
        assert!(matches!(read_assignments(&path), Err(ArtifactError::Truncated(_))));
    }

    #[test]
    fn test_missing_model_file() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            read_model(&dir.path().join("model.pb.gz")),
            Err(ArtifactError::Io(_))
        ));
    }

    #[test]
    fn test_encoding_symbols_optional() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("encoding.json.gz");
        write_gz(&path, br#"[{"name":"size"},{"name":"color","symbols":{"red":0,"blue":1}}]"#).unwrap();
        let entries = read_encoding(&path).unwrap();
        assert_eq!(entries[0].name, "size");
        assert!(entries[0].symbols.is_none());
        assert_eq!(entries[1].symbols.as_ref().unwrap()["blue"], 1);
    }
}
