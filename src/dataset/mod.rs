pub mod cache;

use std::{ops::Range, sync::Arc};

/// The rows partition `index` receives when `total` rows are dealt out to `count`
/// partitions, the first `total % count` partitions taking one extra row.
///
/// A `count` of zero deals everything to a single partition, an `index` past the last
/// partition gets an empty range at the end.
pub fn partition_range(total: usize, index: usize, count: usize) -> Range<usize> {
    let count = count.max(1);
    let boundary = |i: usize| {
        let i = i.min(count);
        i * (total / count) + i.min(total % count)
    };

    boundary(index)..boundary(index.saturating_add(1))
}

/// An independent, separately schedulable slice of a dataset.
#[derive(Debug)]
pub struct Partition<R> {
    index: usize,
    rows: Arc<[R]>,
}

impl<R> Clone for Partition<R> {
    fn clone(&self) -> Self {
        Self {
            index: self.index,
            rows: Arc::clone(&self.rows),
        }
    }
}

impl<R> Partition<R> {
    /// Position of the partition inside its dataset.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn rows(&self) -> &[R] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// A dataset already split into partitions.
#[derive(Debug)]
pub struct PartitionedDataset<R> {
    partitions: Vec<Partition<R>>,
}

impl<R> Clone for PartitionedDataset<R> {
    fn clone(&self) -> Self {
        Self {
            partitions: self.partitions.clone(),
        }
    }
}

impl<R: Clone> PartitionedDataset<R> {
    /// Splits `rows` into `count` balanced partitions, `count` is clamped to at least 1.
    pub fn from_rows(rows: Vec<R>, count: usize) -> Self {
        let count = count.max(1);
        let total = rows.len();

        let partitions = (0..count)
            .map(|index| Partition {
                index,
                rows: rows[partition_range(total, index, count)].into(),
            })
            .collect();

        Self { partitions }
    }

    /// Redistributes every row into `count` balanced partitions, keeping row order.
    pub fn repartition(&self, count: usize) -> Self {
        let rows = self
            .partitions
            .iter()
            .flat_map(|partition| partition.rows().iter().cloned())
            .collect();

        Self::from_rows(rows, count)
    }
}

impl<R> PartitionedDataset<R> {
    /// Builds a dataset out of ready made partitions, renumbering them in the given order.
    pub fn from_partitions(partitions: Vec<Vec<R>>) -> Self {
        let partitions = partitions
            .into_iter()
            .enumerate()
            .map(|(index, rows)| Partition {
                index,
                rows: rows.into(),
            })
            .collect();

        Self { partitions }
    }

    pub fn partitions(&self) -> &[Partition<R>] {
        &self.partitions
    }

    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    /// Total amount of rows across partitions.
    pub fn num_rows(&self) -> usize {
        self.partitions.iter().map(Partition::len).sum()
    }
}

impl<R> IntoIterator for PartitionedDataset<R> {
    type Item = Partition<R>;
    type IntoIter = std::vec::IntoIter<Partition<R>>;

    fn into_iter(self) -> Self::IntoIter {
        self.partitions.into_iter()
    }
}
