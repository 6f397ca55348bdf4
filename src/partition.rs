//! Per-model partition values in host id space.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};
use crate::types::{ColNo, KindId, ModelNo, PartitionId, RowId};

/// Column-kind and row-cluster partition of one trained model.
///
/// Row partitions are dense: position `i` of a kind's vector belongs to
/// host row `i + 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelPartition {
    pub modelno: ModelNo,
    pub column_kinds: BTreeMap<ColNo, KindId>,
    pub row_partitions: BTreeMap<KindId, Vec<PartitionId>>,
}

impl ModelPartition {
    pub fn new(modelno: ModelNo) -> Self {
        Self {
            modelno,
            column_kinds: BTreeMap::new(),
            row_partitions: BTreeMap::new(),
        }
    }

    pub fn kind_of(&self, colno: ColNo) -> Option<KindId> {
        self.column_kinds.get(&colno).copied()
    }

    pub fn partition_of(&self, kind: KindId, rowid: RowId) -> Option<PartitionId> {
        let index = usize::try_from(rowid.0.checked_sub(1)?).ok()?;
        self.row_partitions.get(&kind)?.get(index).copied()
    }

    pub fn num_rows(&self) -> usize {
        self.row_partitions.values().next().map_or(0, Vec::len)
    }

    /// Kinds that own at least one column, in ascending order.
    pub fn occupied_kinds(&self) -> BTreeSet<KindId> {
        self.column_kinds.values().copied().collect()
    }

    /// Check the partition against the population it claims to cover.
    pub fn validate(&self, columns: &BTreeSet<ColNo>, num_rows: usize) -> Result<()> {
        let covered: BTreeSet<ColNo> = self.column_kinds.keys().copied().collect();
        if &covered != columns {
            return Err(Error::InvalidPartition(format!(
                "model {} assigns columns {:?}, population has {:?}",
                self.modelno, covered, columns
            )));
        }
        for (expected, kind) in self.row_partitions.keys().enumerate() {
            if kind.0 != expected as i64 {
                return Err(Error::InvalidPartition(format!(
                    "model {} kind ids are not dense at {}",
                    self.modelno, kind
                )));
            }
        }
        for kind in self.occupied_kinds() {
            if !self.row_partitions.contains_key(&kind) {
                return Err(Error::InvalidPartition(format!(
                    "model {} has no row partition for kind {}",
                    self.modelno, kind
                )));
            }
        }
        for (kind, rows) in &self.row_partitions {
            if rows.len() != num_rows {
                return Err(Error::InvalidPartition(format!(
                    "model {} kind {} partitions {} rows, expected {}",
                    self.modelno,
                    kind,
                    rows.len(),
                    num_rows
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ModelPartition {
        let mut partition = ModelPartition::new(ModelNo(0));
        partition.column_kinds.insert(ColNo(0), KindId(0));
        partition.column_kinds.insert(ColNo(1), KindId(1));
        partition
            .row_partitions
            .insert(KindId(0), vec![PartitionId(0), PartitionId(1), PartitionId(0)]);
        partition
            .row_partitions
            .insert(KindId(1), vec![PartitionId(0), PartitionId(0), PartitionId(0)]);
        partition
    }

    #[test]
    fn test_lookup_is_one_based() {
        let partition = sample();
        assert_eq!(partition.partition_of(KindId(0), RowId(2)), Some(PartitionId(1)));
        assert_eq!(partition.partition_of(KindId(0), RowId(0)), None);
        assert_eq!(partition.partition_of(KindId(0), RowId(4)), None);
    }

    #[test]
    fn test_validate() {
        let partition = sample();
        let columns: BTreeSet<ColNo> = [ColNo(0), ColNo(1)].into_iter().collect();
        partition.validate(&columns, 3).unwrap();
        assert!(partition.validate(&columns, 4).is_err());

        let fewer: BTreeSet<ColNo> = [ColNo(0)].into_iter().collect();
        assert!(partition.validate(&fewer, 3).is_err());

        let mut sparse = sample();
        let rows = sparse.row_partitions.remove(&KindId(1)).unwrap();
        sparse.row_partitions.insert(KindId(5), rows);
        assert!(sparse.validate(&columns, 3).is_err());
    }
}
