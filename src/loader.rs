// Copyright (c) The stagerunner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Suite construction and filtering.
//!
//! Test file compilation is external: a [`TestFileLoader`] turns a file path
//! into a [`SuiteDecl`] subtree. This module drives it: per stage, each
//! unique file is loaded once into a preprocess root, the preprocess filters
//! run (duplicate titles, focused lines, `forbid_only`, focus semantics),
//! and the surviving file suites are cloned per project and repeat index
//! with grep admission applied to every clone.

use crate::{
    config::{
        partition_into_stages, worker_hash, Config, Project, RunOptions, TestFileFilter,
    },
    errors::TestError,
    grouping::{create_test_groups, TestGroup},
    shard::filter_stages_for_shard,
    suite::{
        Entry, HookKind, Location, ParallelMode, Suite, SuiteId, SuiteKind, SuiteTree, TestCase,
    },
    walker::{cli_pattern_matches, collect_project_files},
};
use camino::{Utf8Path, Utf8PathBuf};
use futures::future::BoxFuture;
use indexmap::IndexMap;
use itertools::Itertools;
use std::{collections::HashSet, sync::Arc};
use tracing::debug;

/// Compiles a test file into a suite subtree.
///
/// Implemented by the embedding framework; this crate never executes test
/// code itself.
pub trait TestFileLoader: Send {
    /// Loads `path` and returns its declaration tree. The declaration's
    /// title and file path are ignored; the collector names file suites
    /// itself.
    fn load_file<'a>(&'a mut self, path: &'a Utf8Path)
        -> BoxFuture<'a, Result<SuiteDecl, TestError>>;
}

/// A declared suite, as produced by the loader.
#[derive(Clone, Debug, Default)]
pub struct SuiteDecl {
    pub title: String,
    pub location: Option<Location>,
    pub parallel_mode: ParallelMode,
    pub only: bool,
    pub hooks: Vec<HookKind>,
    pub entries: Vec<DeclEntry>,
}

impl SuiteDecl {
    /// Creates an empty suite declaration.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }
}

/// A declared test.
#[derive(Clone, Debug)]
pub struct TestDecl {
    pub title: String,
    pub location: Location,
    pub only: bool,
}

impl TestDecl {
    /// Creates a test declaration.
    pub fn new(title: impl Into<String>, location: Location) -> Self {
        Self {
            title: title.into(),
            location,
            only: false,
        }
    }
}

/// An ordered child of a [`SuiteDecl`].
#[derive(Clone, Debug)]
pub enum DeclEntry {
    Suite(SuiteDecl),
    Test(TestDecl),
}

/// Everything the dispatch loop needs, produced by [`collect_run`].
pub(crate) struct RunCollection {
    pub(crate) tree: SuiteTree,
    /// Test groups per stage, in ascending stage-ordinal order.
    pub(crate) stages: Vec<Vec<TestGroup>>,
    /// Fatal errors accumulated during collection. When non-empty the run
    /// reports them after `on_begin` and finishes as failed without
    /// dispatching.
    pub(crate) fatal_errors: Vec<TestError>,
    pub(crate) max_concurrent_test_groups: usize,
}

/// Builds the suite tree and stage groups for the selected projects.
pub(crate) async fn collect_run(
    config: &Config,
    selected: &[Arc<Project>],
    options: &RunOptions,
    loader: &mut dyn TestFileLoader,
) -> RunCollection {
    let mut tree = SuiteTree::new();
    let mut fatal_errors = Vec::new();
    // Each unique file is loaded exactly once per run.
    let mut decl_cache: IndexMap<Utf8PathBuf, Option<SuiteDecl>> = IndexMap::new();
    let staged = partition_into_stages(selected);
    let mut stage_suites: Vec<Vec<SuiteId>> = Vec::new();

    for (ordinal, stage_projects) in &staged {
        let mut project_files: Vec<(Arc<Project>, Vec<Utf8PathBuf>)> = Vec::new();
        for project in stage_projects {
            match collect_project_files(project, &options.test_file_filters) {
                Ok(files) => project_files.push((project.clone(), files)),
                Err(error) => {
                    fatal_errors.push(error);
                    project_files.push((project.clone(), Vec::new()));
                }
            }
        }

        for (_, files) in &project_files {
            for file in files {
                if decl_cache.contains_key(file) {
                    continue;
                }
                let decl = match loader.load_file(file).await {
                    Ok(decl) => Some(decl),
                    Err(error) => {
                        fatal_errors.push(error);
                        None
                    }
                };
                decl_cache.insert(file.clone(), decl);
            }
        }

        // Preprocess root: one file suite per unique file of this stage.
        let pre_root = tree.add_detached_suite(Suite::new(SuiteKind::Root, ""));
        let mut file_suites: IndexMap<Utf8PathBuf, SuiteId> = IndexMap::new();
        for (_, files) in &project_files {
            for file in files {
                if file_suites.contains_key(file) {
                    continue;
                }
                if let Some(Some(decl)) = decl_cache.get(file) {
                    let decl = decl.clone();
                    let id = ingest_file_suite(&mut tree, pre_root, file, &decl);
                    file_suites.insert(file.clone(), id);
                }
            }
        }
        debug!(
            stage = ordinal,
            files = file_suites.len(),
            "loaded stage files"
        );

        for (file, &file_suite) in &file_suites {
            if let Some(error) = check_duplicate_titles(&tree, file_suite, file) {
                fatal_errors.push(error);
            }
        }
        apply_focused_line_filter(&mut tree, pre_root, &options.test_file_filters);
        if config.forbid_only {
            if let Some(error) = check_forbid_only(&tree, pre_root) {
                fatal_errors.push(error);
            }
        }
        if !options.list_only {
            tree.filter_only(pre_root);
        }

        let mut suites_of_stage = Vec::new();
        for (project, files) in &project_files {
            let project_suite = tree.add_suite(tree.root(), {
                let mut suite = Suite::new(SuiteKind::Project, project.name.clone());
                suite.project = Some(project.clone());
                suite
            });
            for file in files {
                let Some(&file_suite) = file_suites.get(file) else {
                    continue;
                };
                if tree.test_count(file_suite) == 0 {
                    continue;
                }
                for repeat_index in 0..project.repeat_each.max(1) {
                    clone_file_suite_for_project(
                        &mut tree,
                        project_suite,
                        file_suite,
                        file,
                        project,
                        repeat_index,
                        config.fully_parallel,
                        options,
                    );
                }
            }
            suites_of_stage.push(project_suite);
        }
        stage_suites.push(suites_of_stage);
    }

    if tree.test_count(tree.root()) == 0 && !options.pass_with_no_tests {
        fatal_errors.push(TestError::new("No tests found."));
    }

    let mut stages: Vec<Vec<TestGroup>> = stage_suites
        .iter()
        .map(|suites| create_test_groups(&tree, suites, config.workers))
        .collect();
    if let Some(shard) = config.shard {
        filter_stages_for_shard(shard, &mut tree, &mut stages);
    }
    let max_concurrent_test_groups = stages.iter().map(Vec::len).max().unwrap_or(0);

    RunCollection {
        tree,
        stages,
        fatal_errors,
        max_concurrent_test_groups,
    }
}

#[expect(clippy::too_many_arguments)]
fn clone_file_suite_for_project(
    tree: &mut SuiteTree,
    project_suite: SuiteId,
    file_suite: SuiteId,
    file: &Utf8Path,
    project: &Arc<Project>,
    repeat_index: usize,
    fully_parallel: bool,
    options: &RunOptions,
) {
    let clone = tree.clone_subtree(file_suite, Some(project_suite));
    {
        let suite = tree.suite_mut(clone);
        suite.title = file
            .strip_prefix(&project.test_dir)
            .unwrap_or(file)
            .to_string();
        if project.fully_parallel || fully_parallel {
            suite.parallel_mode = ParallelMode::Parallel;
        }
    }
    let hash = worker_hash(project, repeat_index);
    for test_id in tree.all_tests(clone) {
        let test = tree.test_mut(test_id);
        test.worker_hash = hash.clone();
        test.repeat_each_index = repeat_index;
        test.project_id = project.id.clone();
    }

    // Grep and title admission runs against the full space-joined title,
    // which includes the project name and file title.
    let mut admitted = HashSet::new();
    for test_id in tree.all_tests(clone) {
        let full_title = tree.title_path(test_id).join(" ");
        let grep_ok = project
            .grep
            .as_ref()
            .is_none_or(|grep| grep.is_match(&full_title));
        let invert_ok = project
            .grep_invert
            .as_ref()
            .is_none_or(|grep| !grep.is_match(&full_title));
        if grep_ok && invert_ok && options.title_matches(&full_title) {
            admitted.insert(test_id);
        }
    }
    if !tree.filter_tests(clone, &mut |id, _| admitted.contains(&id)) {
        tree.suite_mut(project_suite)
            .entries
            .retain(|entry| *entry != Entry::Suite(clone));
    }
}

fn ingest_file_suite(
    tree: &mut SuiteTree,
    parent: SuiteId,
    path: &Utf8Path,
    decl: &SuiteDecl,
) -> SuiteId {
    let mut suite = Suite::new(SuiteKind::File, path.as_str());
    suite.location = decl.location.clone();
    suite.parallel_mode = decl.parallel_mode;
    suite.hooks = decl.hooks.clone();
    suite.only = decl.only;
    suite.file_path = Some(path.to_owned());
    let id = tree.add_suite(parent, suite);
    ingest_entries(tree, id, &decl.entries, path);
    id
}

fn ingest_entries(tree: &mut SuiteTree, parent: SuiteId, entries: &[DeclEntry], path: &Utf8Path) {
    for entry in entries {
        match entry {
            DeclEntry::Suite(decl) => {
                let mut suite = Suite::new(SuiteKind::Describe, decl.title.clone());
                suite.location = decl.location.clone();
                suite.parallel_mode = decl.parallel_mode;
                suite.hooks = decl.hooks.clone();
                suite.only = decl.only;
                let id = tree.add_suite(parent, suite);
                ingest_entries(tree, id, &decl.entries, path);
            }
            DeclEntry::Test(decl) => {
                tree.add_test(
                    parent,
                    TestCase {
                        title: decl.title.clone(),
                        location: decl.location.clone(),
                        only: decl.only,
                        worker_hash: String::new(),
                        require_file: path.to_owned(),
                        repeat_each_index: 0,
                        project_id: String::new(),
                        results: Vec::new(),
                        parent,
                    },
                );
            }
        }
    }
}

/// The full path `title₁ › title₂ › … › titleₙ` below the file suite must be
/// unique within each file.
fn check_duplicate_titles(
    tree: &SuiteTree,
    file_suite: SuiteId,
    file: &Utf8Path,
) -> Option<TestError> {
    let mut by_path: IndexMap<String, Vec<Location>> = IndexMap::new();
    for test_id in tree.all_tests(file_suite) {
        by_path
            .entry(tree.path_in_file(test_id).join(" › "))
            .or_default()
            .push(tree.test(test_id).location.clone());
    }
    let duplicates: Vec<String> = by_path
        .iter()
        .filter(|(_, locations)| locations.len() > 1)
        .map(|(path, locations)| {
            format!(
                " - {path} ({})",
                locations
                    .iter()
                    .map(|l| format!("{}:{}", l.line, l.column))
                    .join(", ")
            )
        })
        .collect();
    (!duplicates.is_empty()).then(|| {
        TestError::new(format!(
            "duplicate test titles are not allowed in {file}:\n{}",
            duplicates.join("\n")
        ))
    })
}

/// When any CLI file filter focuses a line or column, only suites and tests
/// declared at a matching location (in a matching file) are retained.
fn apply_focused_line_filter(
    tree: &mut SuiteTree,
    pre_root: SuiteId,
    filters: &[TestFileFilter],
) {
    if !filters
        .iter()
        .any(|f| f.line.is_some() || f.column.is_some())
    {
        return;
    }
    let location_matches = |location: &Location| {
        filters.iter().any(|filter| {
            let line_ok = filter.line.is_none_or(|line| line == location.line);
            let column_ok = filter.column.is_none_or(|column| column == location.column);
            line_ok && column_ok && cli_pattern_matches(&filter.pattern, &location.file)
        })
    };
    tree.filter_suite(
        pre_root,
        &mut |_, suite| {
            suite
                .location
                .as_ref()
                .is_some_and(|location| location_matches(location))
        },
        &mut |_, test| location_matches(&test.location),
    );
}

fn check_forbid_only(tree: &SuiteTree, pre_root: SuiteId) -> Option<TestError> {
    let offenders = tree.only_items(pre_root);
    if offenders.is_empty() {
        return None;
    }
    let lines = offenders
        .iter()
        .map(|(path, location)| match location {
            Some(location) => format!(" - {location} › {}", path.join(" › ")),
            None => format!(" - {}", path.join(" › ")),
        })
        .join("\n");
    Some(TestError::new(format!(
        "focused items are not allowed when forbid_only is set:\n{lines}"
    )))
}
