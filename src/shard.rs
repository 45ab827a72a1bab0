// Copyright (c) The stagerunner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Support for sharding test runs across several machines.
//!
//! The shardable test set is split into `total` contiguous windows of
//! near-equal size; this run keeps the groups whose first test falls into
//! the window of `current`. Groups marked `run = always` are present in
//! every shard and do not advance the window counter.

use crate::{
    config::RunMode,
    errors::ShardParseError,
    grouping::TestGroup,
    suite::{SuiteTree, TestId},
};
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, str::FromStr};
use tracing::debug;

/// One shard of a distributed run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ShardConfig {
    /// The shard this run is in, counting up from 1.
    pub current: usize,
    /// The total number of shards.
    pub total: usize,
}

impl FromStr for ShardConfig {
    type Err = ShardParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const EXPECTED_FORMAT: &str = "M/N";
        let mut split = s.splitn(2, '/');
        // First "next" always returns a value.
        let current_str = split.next().expect("split should have at least 1 element");
        let total_str = split.next().ok_or_else(|| {
            ShardParseError::new(
                Some(EXPECTED_FORMAT),
                format!("expected input '{s}' to be in the format M/N"),
            )
        })?;

        let current: usize = current_str.parse().map_err(|err| {
            ShardParseError::new(
                Some(EXPECTED_FORMAT),
                format!("failed to parse shard '{current_str}': {err}"),
            )
        })?;
        let total: usize = total_str.parse().map_err(|err| {
            ShardParseError::new(
                Some(EXPECTED_FORMAT),
                format!("failed to parse total shards '{total_str}': {err}"),
            )
        })?;

        if !(1..=total).contains(&current) {
            return Err(ShardParseError::new(
                Some(EXPECTED_FORMAT),
                format!(
                    "shard {current} must be a number between 1 and total shards {total}, inclusive"
                ),
            ));
        }

        Ok(ShardConfig { current, total })
    }
}

/// The half-open `[from, to)` window of shardable test indexes this shard
/// retains.
pub(crate) fn shard_window(shardable_total: usize, shard: ShardConfig) -> (usize, usize) {
    let total = shard.total.max(1);
    let shard_size = shardable_total / total;
    let extra_one = shardable_total - shard_size * total;
    let k = shard.current - 1;
    let from = shard_size * k + k.min(extra_one);
    let to = from + shard_size + usize::from(k < extra_one);
    (from, to)
}

/// Retains only the groups belonging to `shard`, walking stages in order
/// with a global counter of shardable tests. Always-run groups are kept in
/// every shard. Stages left empty are dropped and the suite tree is pruned
/// to the retained tests.
pub(crate) fn filter_stages_for_shard(
    shard: ShardConfig,
    tree: &mut SuiteTree,
    stages: &mut Vec<Vec<TestGroup>>,
) {
    let root = tree.root();
    let shardable_total: usize = tree
        .suite(root)
        .entries()
        .iter()
        .filter_map(|entry| match entry {
            crate::suite::Entry::Suite(project_suite) => Some(*project_suite),
            crate::suite::Entry::Test(_) => None,
        })
        .filter(|&project_suite| {
            tree.suite(project_suite)
                .project
                .as_ref()
                .is_none_or(|p| p.run != RunMode::Always)
        })
        .map(|project_suite| tree.test_count(project_suite))
        .sum();

    let (from, to) = shard_window(shardable_total, shard);
    debug!(
        current = shard.current,
        total = shard.total,
        shardable_total,
        from,
        to,
        "applying shard window"
    );

    let mut counter = 0usize;
    let mut retained: HashSet<TestId> = HashSet::new();
    for stage in stages.iter_mut() {
        stage.retain(|group| {
            if group.run == RunMode::Always {
                retained.extend(group.tests.iter().copied());
                return true;
            }
            let keep = counter >= from && counter < to;
            counter += group.tests.len();
            if keep {
                retained.extend(group.tests.iter().copied());
            }
            keep
        });
    }
    stages.retain(|stage| !stage.is_empty());
    tree.filter_tests(root, &mut |id, _| retained.contains(&id));
}
