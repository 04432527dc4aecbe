//! Shard partitioning across worker clusters

use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Identifier of one worker process, `0..cluster_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(pub u32);

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ClusterId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// The shards one cluster is responsible for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardAssignment {
    pub cluster_id: ClusterId,
    pub total_shards: u32,
    /// Ordered, contiguous shard indices
    pub shards: Vec<u32>,
}

impl ShardAssignment {
    /// The shard indices as a half-open range.
    pub fn range(&self) -> Range<u32> {
        match (self.shards.first(), self.shards.last()) {
            (Some(first), Some(last)) => *first..last + 1,
            _ => 0..0,
        }
    }

    /// Comma separated shard list, as passed on the worker command line.
    pub fn shard_list(&self) -> String {
        self.shards
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Number of clusters needed to cover `shard_count` shards.
pub fn cluster_count(shard_count: u32, shards_per_cluster: u32) -> Result<u32> {
    if shard_count == 0 || shards_per_cluster == 0 {
        return Err(CoreError::InvalidShardLayout {
            shard_count,
            shards_per_cluster,
        });
    }
    Ok(shard_count.div_ceil(shards_per_cluster))
}

/// Split `0..shard_count` into contiguous per-cluster ranges.
///
/// Every cluster gets exactly `shards_per_cluster` shards except the last,
/// which takes whatever remains.
pub fn partition_shards(shard_count: u32, shards_per_cluster: u32) -> Result<Vec<ShardAssignment>> {
    let clusters = cluster_count(shard_count, shards_per_cluster)?;

    Ok((0..clusters)
        .map(|cluster| {
            let start = cluster * shards_per_cluster;
            let end = (start + shards_per_cluster).min(shard_count);
            ShardAssignment {
                cluster_id: ClusterId(cluster),
                total_shards: shard_count,
                shards: (start..end).collect(),
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn ten_shards_four_per_cluster() {
        let clusters = partition_shards(10, 4).unwrap();
        let shards: Vec<Vec<u32>> = clusters.iter().map(|c| c.shards.clone()).collect();
        assert_eq!(shards, vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7], vec![8, 9]]);
        assert_eq!(clusters[2].cluster_id, ClusterId(2));
        assert_eq!(clusters[2].range(), 8..10);
        assert!(clusters.iter().all(|c| c.total_shards == 10));
    }

    #[test]
    fn partition_covers_every_shard_once() {
        for shard_count in 1..=64 {
            for per_cluster in 1..=shard_count + 2 {
                let clusters = partition_shards(shard_count, per_cluster).unwrap();
                let flattened: Vec<u32> =
                    clusters.iter().flat_map(|c| c.shards.iter().copied()).collect();
                assert_eq!(flattened, (0..shard_count).collect::<Vec<_>>());

                let (last, rest) = clusters.split_last().unwrap();
                assert!(rest.iter().all(|c| c.shards.len() == per_cluster as usize));
                assert!(!last.shards.is_empty());
                assert!(last.shards.len() <= per_cluster as usize);
            }
        }
    }

    #[test]
    fn zero_values_are_rejected() {
        assert!(partition_shards(0, 4).is_err());
        assert!(partition_shards(4, 0).is_err());
    }

    #[test]
    fn shard_list_is_comma_separated() {
        let clusters = partition_shards(3, 2).unwrap();
        assert_eq!(clusters[0].shard_list(), "0,1");
        assert_eq!(clusters[1].shard_list(), "2");
    }
}
