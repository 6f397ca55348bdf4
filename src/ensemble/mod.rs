//! In-process CrossCat ensemble and its reconciliation with trained partitions.
//!
//! Columns are addressed by engine rank throughout this module. Each member
//! state groups columns into views and, within each view, rows into
//! clusters. [`reconcile`] rewrites every member to match externally trained
//! partitions while keeping each column's hyperparameters.

mod reconcile;
mod refine;
mod state;

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::partition::ModelPartition;
use crate::types::{ColNo, KindId};

pub use reconcile::{member_seed, reconcile, refine_passes};
pub use state::{ColumnHypers, EnsembleState, SuffStats, View};

/// Value domain of one data column.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ColumnKind {
    Numeric,
    /// Integer codes `0..num_categories`.
    Categorical { num_categories: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnData {
    pub kind: ColumnKind,
    pub values: Vec<Option<f64>>,
}

/// Read-only data matrix shared by every member, columns in rank order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnsembleData {
    columns: Vec<ColumnData>,
}

impl EnsembleData {
    pub fn push_numeric(&mut self, values: Vec<Option<f64>>) {
        self.columns.push(ColumnData {
            kind: ColumnKind::Numeric,
            values,
        });
    }

    pub fn push_categorical(&mut self, values: Vec<Option<f64>>, num_categories: usize) {
        let observed = values
            .iter()
            .flatten()
            .map(|v| *v as usize + 1)
            .max()
            .unwrap_or(0);
        self.columns.push(ColumnData {
            kind: ColumnKind::Categorical {
                num_categories: num_categories.max(observed).max(1),
            },
            values,
        });
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn num_rows(&self) -> usize {
        self.columns.first().map_or(0, |c| c.values.len())
    }

    pub fn column(&self, rank: usize) -> &ColumnData {
        &self.columns[rank]
    }

    pub fn columns(&self) -> &[ColumnData] {
        &self.columns
    }
}

/// A trained partition re-keyed by engine rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankPartition {
    /// Kind index of each rank.
    pub column_kinds: Vec<usize>,
    /// Cluster of each row, per kind index.
    pub row_clusters: Vec<Vec<usize>>,
}

impl RankPartition {
    /// Translate a stored partition; `order[rank]` is the host column of `rank`.
    pub fn from_model(partition: &ModelPartition, order: &[ColNo]) -> Result<Self> {
        let mut column_kinds = Vec::with_capacity(order.len());
        for colno in order {
            let kind = partition.kind_of(*colno).ok_or_else(|| {
                Error::InvalidPartition(format!("model {} has no kind for column {}", partition.modelno, colno))
            })?;
            column_kinds.push(to_index(kind.0)?);
        }
        let mut row_clusters = Vec::with_capacity(partition.row_partitions.len());
        for (expected, (kind, rows)) in partition.row_partitions.iter().enumerate() {
            if *kind != KindId(expected as i64) {
                return Err(Error::InvalidPartition(format!(
                    "model {} kind ids are not dense at {}",
                    partition.modelno, kind
                )));
            }
            row_clusters.push(rows.iter().map(|p| to_index(p.0)).collect::<Result<Vec<_>>>()?);
        }
        Ok(Self {
            column_kinds,
            row_clusters,
        })
    }
}

fn to_index(id: i64) -> Result<usize> {
    usize::try_from(id).map_err(|_| Error::InvalidPartition(format!("negative id {id}")))
}

/// A set of independently trained member states over one data matrix.
#[derive(Debug, Clone)]
pub struct Ensemble {
    data: Arc<EnsembleData>,
    members: Vec<EnsembleState>,
}

impl Ensemble {
    /// `num_members` states, each with every column in one view and every
    /// row in one cluster.
    pub fn new(data: EnsembleData, num_members: usize) -> Self {
        let data = Arc::new(data);
        let members = (0..num_members)
            .map(|_| EnsembleState::singleton(Arc::clone(&data)))
            .collect();
        Self { data, members }
    }

    pub fn data(&self) -> &Arc<EnsembleData> {
        &self.data
    }

    pub fn members(&self) -> &[EnsembleState] {
        &self.members
    }

    pub fn num_members(&self) -> usize {
        self.members.len()
    }

    /// Replace every member at once.
    pub(crate) fn replace_members(&mut self, members: Vec<EnsembleState>) {
        self.members = members;
    }
}
