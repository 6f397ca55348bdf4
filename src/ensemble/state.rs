//! One member of the ensemble: views, row clusters and column statistics.

use std::collections::{BTreeMap, BTreeSet};
use std::f64::consts::PI;
use std::sync::Arc;

use super::{ColumnKind, EnsembleData};
use crate::error::{Error, Result};

/// Per-column hyperparameters.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnHypers {
    /// Normal observations with variance `s`; Normal prior on the cluster
    /// mean with the given mean and variance.
    Numeric { mean: f64, prior_variance: f64, s: f64 },
    /// Symmetric Dirichlet concentration.
    Categorical { beta: f64 },
}

impl ColumnHypers {
    /// Starting hyperparameters fitted to the column's observed values.
    pub fn from_column(kind: ColumnKind, values: &[Option<f64>]) -> Self {
        match kind {
            ColumnKind::Categorical { .. } => ColumnHypers::Categorical { beta: 1.0 },
            ColumnKind::Numeric => {
                let observed: Vec<f64> = values.iter().flatten().copied().collect();
                let n = observed.len() as f64;
                let mean = if observed.is_empty() { 0.0 } else { observed.iter().sum::<f64>() / n };
                let variance = if observed.len() < 2 {
                    1.0
                } else {
                    observed.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0)
                };
                let variance = variance.max(1e-6);
                ColumnHypers::Numeric {
                    mean,
                    prior_variance: variance,
                    s: variance,
                }
            }
        }
    }
}

/// Sufficient statistics of one column within one cluster.
#[derive(Debug, Clone, PartialEq)]
pub enum SuffStats {
    Numeric { n: usize, sum: f64, sum_sq: f64 },
    Categorical { n: usize, counts: Vec<usize> },
}

impl SuffStats {
    pub fn empty(kind: ColumnKind) -> Self {
        match kind {
            ColumnKind::Numeric => SuffStats::Numeric {
                n: 0,
                sum: 0.0,
                sum_sq: 0.0,
            },
            ColumnKind::Categorical { num_categories } => SuffStats::Categorical {
                n: 0,
                counts: vec![0; num_categories],
            },
        }
    }

    pub fn observe(&mut self, x: f64) {
        match self {
            SuffStats::Numeric { n, sum, sum_sq } => {
                *n += 1;
                *sum += x;
                *sum_sq += x * x;
            }
            SuffStats::Categorical { n, counts } => {
                let code = x as usize;
                if code >= counts.len() {
                    counts.resize(code + 1, 0);
                }
                counts[code] += 1;
                *n += 1;
            }
        }
    }

    pub fn count(&self) -> usize {
        match self {
            SuffStats::Numeric { n, .. } | SuffStats::Categorical { n, .. } => *n,
        }
    }

    /// Log marginal likelihood of the cluster's observations.
    pub fn log_marginal(&self, hypers: &ColumnHypers) -> f64 {
        match (self, hypers) {
            (SuffStats::Numeric { n, sum, sum_sq }, ColumnHypers::Numeric { mean, prior_variance, s }) => {
                if *n == 0 {
                    return 0.0;
                }
                let n = *n as f64;
                let t = *prior_variance;
                let xbar = sum / n;
                0.5 * s.ln() - 0.5 * n * (2.0 * PI * s).ln() - 0.5 * (n * t + s).ln() - sum_sq / (2.0 * s)
                    - mean * mean / (2.0 * t)
                    + (t * n * n * xbar * xbar / s + s * mean * mean / t + 2.0 * n * xbar * mean)
                        / (2.0 * (n * t + s))
            }
            (SuffStats::Categorical { n, counts }, ColumnHypers::Categorical { beta }) => {
                let k = counts.len() as f64;
                counts.iter().map(|c| ln_rising(*beta, *c)).sum::<f64>() - ln_rising(k * beta, *n)
            }
            _ => f64::NEG_INFINITY,
        }
    }
}

/// log of a(a+1)...(a+m-1).
pub(crate) fn ln_rising(a: f64, m: usize) -> f64 {
    (0..m).map(|i| (a + i as f64).ln()).sum()
}

/// CRP log probability of `sizes` under concentration `alpha`, up to terms
/// constant in `alpha`.
pub(crate) fn crp_log_alpha(alpha: f64, num_tables: usize, num_customers: usize) -> f64 {
    num_tables as f64 * alpha.ln() - ln_rising(alpha, num_customers)
}

/// A view: a CRP concentration and the row clustering shared by its columns.
#[derive(Debug, Clone, PartialEq)]
pub struct View {
    pub alpha: f64,
    /// Cluster of each row.
    pub assignments: Vec<usize>,
}

impl View {
    pub fn num_clusters(&self) -> usize {
        self.assignments.iter().collect::<BTreeSet<_>>().len()
    }
}

#[derive(Debug, Clone)]
pub struct EnsembleState {
    data: Arc<EnsembleData>,
    pub(crate) alpha: f64,
    pub(crate) views: BTreeMap<usize, View>,
    /// View id of each column.
    pub(crate) column_views: Vec<usize>,
    pub(crate) hypers: Vec<ColumnHypers>,
    /// Per column, statistics of each cluster of its view.
    pub(crate) stats: Vec<BTreeMap<usize, SuffStats>>,
}

impl EnsembleState {
    /// Every column in view 0, every row in cluster 0.
    pub fn singleton(data: Arc<EnsembleData>) -> Self {
        let mut views = BTreeMap::new();
        views.insert(
            0,
            View {
                alpha: 1.0,
                assignments: vec![0; data.num_rows()],
            },
        );
        let column_views = vec![0; data.num_columns()];
        let hypers = data
            .columns()
            .iter()
            .map(|c| ColumnHypers::from_column(c.kind, &c.values))
            .collect();
        Self::from_parts(data, 1.0, views, column_views, hypers)
    }

    /// Assemble a state and derive its statistics from the data.
    pub(crate) fn from_parts(
        data: Arc<EnsembleData>,
        alpha: f64,
        views: BTreeMap<usize, View>,
        column_views: Vec<usize>,
        hypers: Vec<ColumnHypers>,
    ) -> Self {
        let mut state = Self {
            data,
            alpha,
            views,
            column_views,
            hypers,
            stats: Vec::new(),
        };
        state.recompute_stats();
        state
    }

    pub(crate) fn recompute_stats(&mut self) {
        let mut stats = Vec::with_capacity(self.column_views.len());
        for (rank, view_id) in self.column_views.iter().enumerate() {
            let column = self.data.column(rank);
            let mut clusters: BTreeMap<usize, SuffStats> = BTreeMap::new();
            if let Some(view) = self.views.get(view_id) {
                for (row, cluster) in view.assignments.iter().enumerate() {
                    let entry = clusters
                        .entry(*cluster)
                        .or_insert_with(|| SuffStats::empty(column.kind));
                    if let Some(Some(x)) = column.values.get(row) {
                        entry.observe(*x);
                    }
                }
            }
            stats.push(clusters);
        }
        self.stats = stats;
    }

    pub fn data(&self) -> &Arc<EnsembleData> {
        &self.data
    }

    /// Outer CRP concentration over views.
    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn views(&self) -> &BTreeMap<usize, View> {
        &self.views
    }

    pub fn view_of(&self, rank: usize) -> Option<usize> {
        self.column_views.get(rank).copied()
    }

    pub fn hypers(&self, rank: usize) -> Option<&ColumnHypers> {
        self.hypers.get(rank)
    }

    pub fn stats(&self, rank: usize) -> Option<&BTreeMap<usize, SuffStats>> {
        self.stats.get(rank)
    }

    pub fn num_outputs(&self) -> usize {
        self.column_views.len()
    }

    /// Columns of one view, ascending.
    pub fn view_columns(&self, view_id: usize) -> Vec<usize> {
        self.column_views
            .iter()
            .enumerate()
            .filter(|(_, v)| **v == view_id)
            .map(|(rank, _)| rank)
            .collect()
    }

    /// Log marginal likelihood of one column under its current clustering.
    pub fn column_log_likelihood(&self, rank: usize) -> f64 {
        let hypers = &self.hypers[rank];
        self.stats[rank].values().map(|s| s.log_marginal(hypers)).sum()
    }

    /// Check that every column sits in exactly one existing, row-complete view.
    pub fn validate(&self) -> Result<()> {
        let num_columns = self.data.num_columns();
        let num_rows = self.data.num_rows();
        if self.column_views.len() != num_columns
            || self.hypers.len() != num_columns
            || self.stats.len() != num_columns
        {
            return Err(Error::InvalidPartition(format!(
                "state covers {} columns, data has {}",
                self.column_views.len(),
                num_columns
            )));
        }
        for (rank, view_id) in self.column_views.iter().enumerate() {
            if !self.views.contains_key(view_id) {
                return Err(Error::InvalidPartition(format!(
                    "column {rank} assigned to missing view {view_id}"
                )));
            }
        }
        let used: BTreeSet<usize> = self.column_views.iter().copied().collect();
        for (view_id, view) in &self.views {
            if !used.contains(view_id) {
                return Err(Error::InvalidPartition(format!("view {view_id} has no columns")));
            }
            if view.assignments.len() != num_rows {
                return Err(Error::InvalidPartition(format!(
                    "view {} clusters {} rows, data has {}",
                    view_id,
                    view.assignments.len(),
                    num_rows
                )));
            }
        }
        for (rank, clusters) in self.stats.iter().enumerate() {
            let observed = self.data.column(rank).values.iter().flatten().count();
            let counted: usize = clusters.values().map(SuffStats::count).sum();
            if observed != counted {
                return Err(Error::InvalidPartition(format!(
                    "column {rank} statistics count {counted} of {observed} values"
                )));
            }
        }
        Ok(())
    }
}
