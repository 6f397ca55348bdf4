//! Rebuild model partitions from the engine's per-model artifacts.
//!
//! Extraction only reads files. Every requested model is loaded and
//! validated before the caller writes anything, so a bad artifact leaves
//! the store untouched.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{debug, warn};

use crate::engine::artifact::{self, Assignment, CrossCat};
use crate::engine::ProjectPaths;
use crate::error::{Error, Result};
use crate::partition::ModelPartition;
use crate::types::{ColNo, GeneratorId, KindId, ModelNo, PartitionId};

pub struct PartitionExtractor<'a> {
    paths: &'a ProjectPaths,
    generator: GeneratorId,
    /// Host column of each engine rank.
    order: &'a [ColNo],
    num_rows: usize,
}

impl<'a> PartitionExtractor<'a> {
    pub fn new(paths: &'a ProjectPaths, generator: GeneratorId, order: &'a [ColNo], num_rows: usize) -> Self {
        Self {
            paths,
            generator,
            order,
            num_rows,
        }
    }

    /// Load every listed model, failing on the first bad artifact.
    pub fn extract_all(&self, modelnos: &[ModelNo]) -> Result<Vec<ModelPartition>> {
        modelnos.iter().map(|modelno| self.extract(*modelno)).collect()
    }

    pub fn extract(&self, modelno: ModelNo) -> Result<ModelPartition> {
        let model_path = self.paths.model(modelno);
        let model = artifact::read_model(&model_path)
            .map_err(|e| self.artifact_error(modelno, &model_path, e.to_string()))?;
        let assign_path = self.paths.assignments(modelno);
        let assignments = artifact::read_assignments(&assign_path)
            .map_err(|e| self.artifact_error(modelno, &assign_path, e.to_string()))?;

        let empty = model.kinds.iter().filter(|kind| kind.featureids.is_empty()).count();
        if empty > 0 {
            warn!(
                "Generator {} model {} has {} kinds without columns",
                self.generator, modelno, empty
            );
        }

        let mut partition = ModelPartition::new(modelno);
        partition.column_kinds = self
            .column_kinds(&model)
            .map_err(|message| self.artifact_error(modelno, &model_path, message))?;
        partition.row_partitions = self
            .row_partitions(model.kinds.len(), assignments)
            .map_err(|message| self.artifact_error(modelno, &assign_path, message))?;

        let columns: BTreeSet<ColNo> = self.order.iter().copied().collect();
        partition
            .validate(&columns, self.num_rows)
            .map_err(|e| self.artifact_error(modelno, &model_path, e.to_string()))?;

        debug!(
            "Extracted generator {} model {}: {} kinds over {} rows",
            self.generator,
            modelno,
            model.kinds.len(),
            self.num_rows
        );
        Ok(partition)
    }

    /// Map every rank to its kind, then re-key by host column.
    fn column_kinds(&self, model: &CrossCat) -> std::result::Result<BTreeMap<ColNo, KindId>, String> {
        let mut column_kinds = BTreeMap::new();
        for (kind, entry) in model.kinds.iter().enumerate() {
            for featureid in &entry.featureids {
                let rank = *featureid as usize;
                let colno = self
                    .order
                    .get(rank)
                    .ok_or_else(|| format!("rank {rank} outside {} columns", self.order.len()))?;
                if column_kinds.insert(*colno, KindId(kind as i64)).is_some() {
                    return Err(format!("rank {rank} assigned to more than one kind"));
                }
            }
        }
        if column_kinds.len() != self.order.len() {
            return Err(format!(
                "{} of {} ranks assigned to a kind",
                column_kinds.len(),
                self.order.len()
            ));
        }
        Ok(column_kinds)
    }

    /// Collect each kind's cluster ids, host row `i + 1` taking the `i`th
    /// assignment in engine row id order.
    fn row_partitions(
        &self,
        num_kinds: usize,
        mut assignments: Vec<Assignment>,
    ) -> std::result::Result<BTreeMap<KindId, Vec<PartitionId>>, String> {
        if assignments.len() != self.num_rows {
            return Err(format!(
                "{} row assignments for {} rows",
                assignments.len(),
                self.num_rows
            ));
        }
        assignments.sort_by_key(|assignment| assignment.rowid);

        let mut row_partitions: BTreeMap<KindId, Vec<PartitionId>> = (0..num_kinds)
            .map(|kind| (KindId(kind as i64), Vec::with_capacity(self.num_rows)))
            .collect();
        for assignment in &assignments {
            if assignment.groupids.len() != num_kinds {
                return Err(format!(
                    "row {} has {} group ids for {} kinds",
                    assignment.rowid,
                    assignment.groupids.len(),
                    num_kinds
                ));
            }
            for (kind, groupid) in assignment.groupids.iter().enumerate() {
                if let Some(rows) = row_partitions.get_mut(&KindId(kind as i64)) {
                    rows.push(PartitionId(i64::from(*groupid)));
                }
            }
        }
        Ok(row_partitions)
    }

    fn artifact_error(&self, modelno: ModelNo, path: &Path, message: String) -> Error {
        Error::artifact(self.generator, modelno, path, message)
    }
}
