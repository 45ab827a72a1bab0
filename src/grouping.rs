// Copyright (c) The stagerunner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test grouping.
//!
//! Partitions the filtered project suites into the minimal [`TestGroup`]s
//! that can share a worker process. Tests bucket by `(worker_hash,
//! require_file)`; within a bucket, ordering-sensitive tests stay together,
//! pure-parallel tests run in isolation, and parallel tests under
//! `beforeAll`/`afterAll` hooks are chunked across workers to amortize hook
//! cost.

use crate::{
    config::RunMode,
    suite::{ParallelMode, SuiteId, SuiteTree, TestId},
};
use camino::Utf8PathBuf;
use indexmap::IndexMap;
use tracing::debug;

/// The unit submitted to the dispatcher: an ordered, non-empty list of tests
/// that run in a single worker session.
#[derive(Clone, Debug, PartialEq)]
pub struct TestGroup {
    /// Worker-fixture hash shared by every test in the group.
    pub worker_hash: String,
    /// Source file shared by every test in the group.
    pub require_file: Utf8PathBuf,
    /// Repeat-each index shared by every test in the group.
    pub repeat_each_index: usize,
    /// Owning project id shared by every test in the group.
    pub project_id: String,
    /// Run mode inherited from the project.
    pub run: RunMode,
    /// Ordered tests.
    pub tests: Vec<TestId>,
    /// Whether the dispatcher should keep the worker alive for re-runs.
    pub watch_mode: bool,
}

/// Key of the inner parallel map: either the outermost enclosing serial
/// suite, or the test itself when no serial wrapper applies.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
enum ParallelKey {
    SerialSuite(SuiteId),
    Test(TestId),
}

#[derive(Default)]
struct Bucket {
    general: Vec<TestId>,
    parallel: IndexMap<ParallelKey, Vec<TestId>>,
    parallel_with_hooks: Vec<TestId>,
}

/// Produces the flat group list for one stage's project suites.
pub(crate) fn create_test_groups(
    tree: &SuiteTree,
    project_suites: &[SuiteId],
    workers: usize,
) -> Vec<TestGroup> {
    let workers = workers.max(1);
    let mut groups: Vec<TestGroup> = Vec::new();

    for &project_suite in project_suites {
        let run = tree
            .suite(project_suite)
            .project
            .as_ref()
            .map(|p| p.run)
            .unwrap_or_default();

        let mut buckets: IndexMap<String, IndexMap<Utf8PathBuf, Bucket>> = IndexMap::new();
        for test_id in tree.all_tests(project_suite) {
            let test = tree.test(test_id);
            let (inside_parallel, outermost_serial, has_all_hooks) = placement(tree, test_id);
            let bucket = buckets
                .entry(test.worker_hash.clone())
                .or_default()
                .entry(test.require_file.clone())
                .or_default();
            if !inside_parallel {
                bucket.general.push(test_id);
            } else if has_all_hooks && outermost_serial.is_none() {
                bucket.parallel_with_hooks.push(test_id);
            } else {
                let key = match outermost_serial {
                    Some(suite) => ParallelKey::SerialSuite(suite),
                    None => ParallelKey::Test(test_id),
                };
                bucket.parallel.entry(key).or_default().push(test_id);
            }
        }

        for (worker_hash, by_file) in buckets {
            for (require_file, bucket) in by_file {
                let template = |tests: Vec<TestId>| {
                    let first = tree.test(tests[0]);
                    TestGroup {
                        worker_hash: worker_hash.clone(),
                        require_file: require_file.clone(),
                        repeat_each_index: first.repeat_each_index,
                        project_id: first.project_id.clone(),
                        run,
                        tests,
                        watch_mode: false,
                    }
                };
                if !bucket.general.is_empty() {
                    groups.push(template(bucket.general));
                }
                for (_, tests) in bucket.parallel {
                    groups.push(template(tests));
                }
                if !bucket.parallel_with_hooks.is_empty() {
                    let chunk_size = bucket.parallel_with_hooks.len().div_ceil(workers);
                    for chunk in bucket.parallel_with_hooks.chunks(chunk_size) {
                        groups.push(template(chunk.to_vec()));
                    }
                }
            }
        }
    }

    debug!(groups = groups.len(), "created test groups");
    groups
}

/// Walks a test's ancestor chain and computes whether it sits inside a
/// parallel suite, its outermost serial wrapper, and whether any ancestor
/// carries a suite-scoped hook.
fn placement(tree: &SuiteTree, test_id: TestId) -> (bool, Option<SuiteId>, bool) {
    let mut inside_parallel = false;
    let mut outermost_serial = None;
    let mut has_all_hooks = false;
    for suite_id in tree.ancestors(tree.test(test_id).parent) {
        let suite = tree.suite(suite_id);
        match suite.parallel_mode {
            ParallelMode::Serial => outermost_serial = Some(suite_id),
            ParallelMode::Parallel => inside_parallel = true,
            ParallelMode::Default => {}
        }
        if suite.hooks.iter().any(|h| h.is_all_scoped()) {
            has_all_hooks = true;
        }
    }
    (inside_parallel, outermost_serial, has_all_hooks)
}
