//! What this worker knows about itself, as reported over the bus

use std::sync::Arc;

use chorus_core::{ClusterId, ShardAssignment};
use dashmap::DashSet;

use crate::bus_client::WorkerInfo;
use crate::error::{Result, WorkerError};
use crate::registry::GuildPlaybackRegistry;

/// Build this worker's assignment from its command line.
///
/// `raw` is the comma separated shard list the launcher passes; it must be a
/// non-empty, ascending, contiguous run inside `0..shard_count`.
pub fn parse_assignment(cluster_id: ClusterId, shard_count: u32, raw: &str) -> Result<ShardAssignment> {
    let invalid = || WorkerError::InvalidShards {
        raw: raw.to_string(),
    };

    let shards = raw
        .split(',')
        .map(|s| s.trim().parse::<u32>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| invalid())?;

    let contiguous = shards.windows(2).all(|pair| pair[1] == pair[0] + 1);
    let in_range = shards.last().is_some_and(|last| *last < shard_count);
    if !contiguous || !in_range {
        return Err(invalid());
    }

    Ok(ShardAssignment {
        cluster_id,
        total_shards: shard_count,
        shards,
    })
}

pub struct ClusterState {
    assignment: ShardAssignment,
    support_guild_id: Option<u64>,
    guilds: DashSet<u64>,
    registry: Arc<GuildPlaybackRegistry>,
}

impl ClusterState {
    pub fn new(
        assignment: ShardAssignment,
        support_guild_id: Option<u64>,
        registry: Arc<GuildPlaybackRegistry>,
    ) -> Self {
        Self {
            assignment,
            support_guild_id,
            guilds: DashSet::new(),
            registry,
        }
    }

    pub fn assignment(&self) -> &ShardAssignment {
        &self.assignment
    }

    pub fn guild_available(&self, guild_id: u64) {
        self.guilds.insert(guild_id);
    }

    pub fn guild_removed(&self, guild_id: u64) {
        self.guilds.remove(&guild_id);
    }
}

impl WorkerInfo for ClusterState {
    fn guild_count(&self) -> usize {
        self.guilds.len()
    }

    fn voice_count(&self) -> usize {
        self.registry.len()
    }

    fn has_support(&self) -> bool {
        self.support_guild_id
            .is_some_and(|guild_id| self.guilds.contains(&guild_id))
    }

    fn shards(&self) -> Vec<u32> {
        self.assignment.shards.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus_client::answer;
    use crate::testing::{SilentSink, queue_for};
    use chorus_core::InfoKind;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn parses_contiguous_shard_lists() {
        let assignment = parse_assignment(ClusterId(1), 10, "4, 5,6,7").unwrap();
        assert_eq!(assignment.shards, vec![4, 5, 6, 7]);
        assert_eq!(assignment.range(), 4..8);
        assert_eq!(assignment.total_shards, 10);
    }

    #[test]
    fn rejects_bad_shard_lists() {
        for raw in ["", "1,x", "1,3", "3,2", "8,9,10"] {
            assert!(
                matches!(
                    parse_assignment(ClusterId(0), 10, raw),
                    Err(WorkerError::InvalidShards { .. })
                ),
                "{raw} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn reports_guilds_voice_and_support() {
        let registry = Arc::new(GuildPlaybackRegistry::new());
        let state = ClusterState::new(
            ShardAssignment {
                cluster_id: ClusterId(1),
                total_shards: 4,
                shards: vec![2, 3],
            },
            Some(99),
            Arc::clone(&registry),
        );

        state.guild_available(10);
        state.guild_available(11);
        registry.insert(queue_for(10, SilentSink::new()));
        assert!(!state.has_support());

        state.guild_available(99);
        state.guild_removed(11);

        let data = answer(
            &state,
            &[
                InfoKind::GuildCount,
                InfoKind::VoiceCount,
                InfoKind::HasSupport,
                InfoKind::Shards,
            ],
        );
        assert_eq!(
            data,
            json!({ "guild_count": 2, "voice_count": 1, "has_support": true, "shards": [2, 3] })
        );
    }
}
