//! Fold trained partitions into the in-process ensemble.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

use super::state::{EnsembleState, View};
use super::{Ensemble, RankPartition};
use crate::config::ReconcileSettings;
use crate::error::{Error, Result};

/// Refinement passes after migration: the configured count, or the square
/// root of the number of outputs.
pub fn refine_passes(num_outputs: usize, configured: Option<usize>) -> usize {
    configured.unwrap_or_else(|| (num_outputs as f64).sqrt() as usize)
}

/// Seed of one member's random source.
pub fn member_seed(seed: u64, member: usize) -> u64 {
    seed ^ (member as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

/// Build a member state whose views match `partition`, carrying over the
/// member's column hyperparameters.
fn rebuild(state: &EnsembleState, partition: &RankPartition) -> Result<EnsembleState> {
    let data = state.data();
    if partition.column_kinds.len() != data.num_columns() {
        return Err(Error::InvalidPartition(format!(
            "partition covers {} columns, ensemble has {}",
            partition.column_kinds.len(),
            data.num_columns()
        )));
    }
    for (kind, rows) in partition.row_clusters.iter().enumerate() {
        if rows.len() != data.num_rows() {
            return Err(Error::InvalidPartition(format!(
                "kind {} clusters {} rows, ensemble has {}",
                kind,
                rows.len(),
                data.num_rows()
            )));
        }
    }

    let starting_id = state.views().keys().next_back().map_or(0, |id| id + 1);
    let occupied: BTreeSet<usize> = partition.column_kinds.iter().copied().collect();
    let mut views = BTreeMap::new();
    for kind in occupied {
        let rows = partition.row_clusters.get(kind).ok_or_else(|| {
            Error::InvalidPartition(format!("no row clustering for kind {kind}"))
        })?;
        // Seed the concentration from the view that held the kind's first column.
        let alpha = partition
            .column_kinds
            .iter()
            .position(|k| *k == kind)
            .and_then(|rank| state.view_of(rank))
            .and_then(|view_id| state.views().get(&view_id))
            .map_or(1.0, |view| view.alpha);
        views.insert(
            starting_id + kind,
            View {
                alpha,
                assignments: rows.clone(),
            },
        );
    }
    let column_views = partition
        .column_kinds
        .iter()
        .map(|kind| starting_id + kind)
        .collect();

    let next = EnsembleState::from_parts(
        Arc::clone(data),
        state.alpha(),
        views,
        column_views,
        state.hypers.clone(),
    );
    next.validate()?;
    Ok(next)
}

/// Rewrite every member to match its partition, member `i` taking
/// `partitions[i]`. Members are rebuilt and refined in parallel and swapped
/// in together only if all of them succeed.
pub fn reconcile(ensemble: &mut Ensemble, partitions: &[RankPartition], settings: &ReconcileSettings) -> Result<()> {
    if partitions.len() != ensemble.num_members() {
        return Err(Error::InvalidArgument(format!(
            "{} partitions for {} ensemble members",
            partitions.len(),
            ensemble.num_members()
        )));
    }
    let passes = refine_passes(ensemble.data().num_columns(), settings.refine_passes);
    let members = ensemble.members();

    let work = || {
        members
            .par_iter()
            .zip(partitions.par_iter())
            .enumerate()
            .map(|(member, (state, partition))| {
                let mut rng = StdRng::seed_from_u64(member_seed(settings.seed, member));
                let mut next = rebuild(state, partition)?;
                next.refine(passes, &mut rng);
                next.validate()?;
                debug!(
                    "Rebuilt ensemble member {} with {} views, log likelihood {:.3}",
                    member,
                    next.views().len(),
                    (0..next.num_outputs())
                        .map(|rank| next.column_log_likelihood(rank))
                        .sum::<f64>()
                );
                Ok(next)
            })
            .collect::<Result<Vec<_>>>()
    };
    let rebuilt = match settings.threads {
        Some(threads) => rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .map_err(|e| Error::InvalidArgument(format!("reconcile thread pool: {e}")))?
            .install(work)?,
        None => work()?,
    };

    ensemble.replace_members(rebuilt);
    info!(
        "Reconciled {} ensemble members with {} refinement passes",
        partitions.len(),
        passes
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensemble::EnsembleData;

    fn ensemble(members: usize) -> Ensemble {
        let mut data = EnsembleData::default();
        data.push_numeric(vec![Some(0.1), Some(0.2), Some(5.0), Some(5.1)]);
        data.push_numeric(vec![Some(1.0), None, Some(1.5), Some(0.5)]);
        data.push_categorical(vec![Some(0.0), Some(0.0), Some(1.0), Some(1.0)], 2);
        Ensemble::new(data, members)
    }

    fn partition() -> RankPartition {
        RankPartition {
            column_kinds: vec![0, 1, 0],
            row_clusters: vec![vec![0, 0, 1, 1], vec![0, 0, 0, 0]],
        }
    }

    #[test]
    fn test_refine_pass_schedule() {
        assert_eq!(refine_passes(9, None), 3);
        assert_eq!(refine_passes(10, None), 3);
        assert_eq!(refine_passes(10, Some(1)), 1);
        assert_eq!(refine_passes(0, None), 0);
    }

    #[test]
    fn test_rebuild_uses_fresh_view_ids() {
        let ensemble = ensemble(1);
        let rebuilt = rebuild(&ensemble.members()[0], &partition()).unwrap();
        assert_eq!(rebuilt.views().keys().copied().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(rebuilt.view_of(0), Some(1));
        assert_eq!(rebuilt.view_of(1), Some(2));
        assert_eq!(rebuilt.view_of(2), Some(1));
        assert_eq!(rebuilt.views()[&1].assignments, vec![0, 0, 1, 1]);
        assert_eq!(rebuilt.hypers(0), ensemble.members()[0].hypers(0));
        assert_eq!(rebuilt.stats(2).unwrap().len(), 2);
    }

    #[test]
    fn test_empty_kinds_are_skipped() {
        let ensemble = ensemble(1);
        let mut partition = partition();
        partition.column_kinds = vec![0, 0, 0];
        let rebuilt = rebuild(&ensemble.members()[0], &partition).unwrap();
        assert_eq!(rebuilt.views().len(), 1);
    }

    #[test]
    fn test_reconcile_all_or_nothing() {
        let mut ensemble = ensemble(2);
        let mut bad = partition();
        bad.row_clusters[1].pop();
        let settings = ReconcileSettings::default();

        assert!(reconcile(&mut ensemble, &[partition(), bad], &settings).is_err());
        assert!(ensemble.members().iter().all(|m| m.views().len() == 1));

        reconcile(&mut ensemble, &[partition(), partition()], &settings).unwrap();
        for member in ensemble.members() {
            member.validate().unwrap();
            assert_eq!(member.views().len(), 2);
        }
    }

    #[test]
    fn test_reconcile_is_reproducible() {
        let settings = ReconcileSettings {
            refine_passes: Some(4),
            seed: 11,
            threads: Some(2),
        };
        let mut a = ensemble(3);
        let mut b = ensemble(3);
        let partitions = vec![partition(); 3];
        reconcile(&mut a, &partitions, &settings).unwrap();
        reconcile(&mut b, &partitions, &settings).unwrap();
        for (x, y) in a.members().iter().zip(b.members()) {
            assert_eq!(x.alpha(), y.alpha());
            assert_eq!(x.hypers(0), y.hypers(0));
        }
    }
}
