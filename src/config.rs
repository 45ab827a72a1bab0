// Copyright (c) The stagerunner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Run configuration.
//!
//! The configuration loader (out of scope for this crate) produces a
//! validated [`Config`]; the CLI layers [`ConfigCliOverrides`] and
//! [`RunOptions`] on top. This module also owns project selection, the
//! stage partition, and worker-hash derivation.

use crate::{
    errors::{ConfigResolveError, ProjectNotFound},
    plugin::{GlobalSetup, GlobalTeardown, Plugin},
    shard::ShardConfig,
};
use camino::{Utf8Path, Utf8PathBuf};
use debug_ignore::DebugIgnore;
use indexmap::IndexMap;
use itertools::Itertools;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, collections::HashMap, fmt::Write as _, io, sync::Arc, time::Duration};
use xxhash_rust::xxh64::xxh64;

/// Config file names searched, in order, when the config location is a
/// directory.
pub const CONFIG_FILE_NAMES: &[&str] = &[
    "stagerunner.config.ts",
    "stagerunner.config.js",
    "stagerunner.config.mjs",
];

/// File extensions eligible as test files.
pub const TEST_FILE_EXTENSIONS: &[&str] = &["js", "ts", "mjs", "tsx", "jsx"];

/// Whether a project's groups run in every shard and survive prior-stage
/// failures.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Sharded and skipped on cascade like everything else.
    #[default]
    Default,
    /// Present in every shard; still runs after earlier stages fail.
    Always,
}

/// Snapshot update policy, passed through to workers.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateSnapshots {
    All,
    None,
    #[default]
    Missing,
}

/// A configured project: an independent test suite with its own directory,
/// matchers, worker parameters, and staging ordinal.
#[derive(Clone, Debug)]
pub struct Project {
    /// Display name; also the key for `--project` filtering.
    pub name: String,
    /// Stable identifier derived from the name, unique across the config.
    pub id: String,
    /// Root directory searched for test files.
    pub test_dir: Utf8PathBuf,
    /// Globs a test file must match.
    pub test_match: Vec<String>,
    /// Globs that exclude test files.
    pub test_ignore: Vec<String>,
    /// Regex a test's full title must match to be admitted.
    pub grep: Option<Regex>,
    /// Regex that excludes tests by full title.
    pub grep_invert: Option<Regex>,
    /// Number of times each file suite is cloned for this project.
    pub repeat_each: usize,
    /// Retry budget passed through to workers.
    pub retries: usize,
    /// Per-test timeout passed through to workers.
    pub timeout: Option<Duration>,
    /// Run mode inherited by every group of this project.
    pub run: RunMode,
    /// Stage ordinal; stages run serially in ascending order.
    pub stage: i32,
    /// When set, every file suite of this project runs fully parallel.
    pub fully_parallel: bool,
    /// Directory removed before dispatch and handed to workers for output.
    pub output_dir: Utf8PathBuf,
    /// Whether the file collector honors `.gitignore` files under
    /// `test_dir`.
    pub respect_git_ignore: bool,
    /// Worker-scoped fixture parameters; part of the worker hash.
    pub fixture_params: IndexMap<String, serde_json::Value>,
}

impl Project {
    /// Creates a project with the default matchers and parameters.
    pub fn new(name: impl Into<String>, test_dir: impl Into<Utf8PathBuf>) -> Self {
        let test_dir = test_dir.into();
        let output_dir = test_dir.join("test-results");
        Self {
            name: name.into(),
            id: String::new(),
            test_dir,
            test_match: vec![
                "**/*.test.{js,ts,mjs,jsx,tsx}".to_owned(),
                "**/*.spec.{js,ts,mjs,jsx,tsx}".to_owned(),
            ],
            test_ignore: Vec::new(),
            grep: None,
            grep_invert: None,
            repeat_each: 1,
            retries: 0,
            timeout: None,
            run: RunMode::Default,
            stage: 0,
            fully_parallel: false,
            output_dir,
            respect_git_ignore: true,
            fixture_params: IndexMap::new(),
        }
    }
}

/// The validated run configuration.
#[derive(Debug)]
pub struct Config {
    /// Configured projects, in declaration order.
    pub projects: Vec<Arc<Project>>,
    /// Fail the run if any `only` marker survives collection.
    pub forbid_only: bool,
    /// Force every file suite into parallel mode.
    pub fully_parallel: bool,
    /// Deadline for the whole run.
    pub global_timeout: Option<Duration>,
    /// Stop dispatching after this many failures; 0 means unlimited.
    /// Honored by the dispatcher.
    pub max_failures: usize,
    /// Suppress worker stdio in reporters that honor it.
    pub quiet: bool,
    /// Configured reporter names. Empty means pick a default based on `CI`.
    pub reporters: Vec<String>,
    /// Shard selection, if this run is one partition of a distributed run.
    pub shard: Option<ShardConfig>,
    /// Number of worker processes.
    pub workers: usize,
    /// Skip snapshot comparisons; passed through to workers.
    pub ignore_snapshots: bool,
    /// Snapshot update policy; passed through to workers.
    pub update_snapshots: UpdateSnapshots,
    /// Plugins registered during config load. Set up before dispatch, torn
    /// down in reverse on every exit path.
    pub plugins: DebugIgnore<Vec<Box<dyn Plugin>>>,
    /// User global setup hook.
    pub global_setup: DebugIgnore<Option<Box<dyn GlobalSetup>>>,
    /// User global teardown hook.
    pub global_teardown: DebugIgnore<Option<Box<dyn GlobalTeardown>>>,
    pub(crate) max_concurrent_test_groups: usize,
}

impl Config {
    /// Creates a config around the given projects, assigning project ids.
    pub fn new(mut projects: Vec<Project>) -> Self {
        assign_project_ids(&mut projects);
        let workers = std::thread::available_parallelism()
            .map(|n| (n.get() / 2).max(1))
            .unwrap_or(1);
        Self {
            projects: projects.into_iter().map(Arc::new).collect(),
            forbid_only: false,
            fully_parallel: false,
            global_timeout: None,
            max_failures: 0,
            quiet: false,
            reporters: Vec::new(),
            shard: None,
            workers,
            ignore_snapshots: false,
            update_snapshots: UpdateSnapshots::default(),
            plugins: DebugIgnore(Vec::new()),
            global_setup: DebugIgnore(None),
            global_teardown: DebugIgnore(None),
            max_concurrent_test_groups: 0,
        }
    }

    /// The maximum number of test groups eligible to run concurrently in any
    /// stage of this run. Computed after shard filtering (always-run groups
    /// included) and exposed to reporters via `on_begin`.
    pub fn max_concurrent_test_groups(&self) -> usize {
        self.max_concurrent_test_groups
    }
}

/// CLI-originated overrides applied on top of a loaded [`Config`].
#[derive(Debug, Default)]
pub struct ConfigCliOverrides {
    pub forbid_only: Option<bool>,
    pub fully_parallel: Option<bool>,
    pub global_timeout: Option<Duration>,
    pub max_failures: Option<usize>,
    pub output_dir: Option<Utf8PathBuf>,
    pub quiet: Option<bool>,
    pub repeat_each: Option<usize>,
    pub retries: Option<usize>,
    pub reporter: Option<Vec<String>>,
    pub shard: Option<ShardConfig>,
    pub timeout: Option<Duration>,
    pub ignore_snapshots: Option<bool>,
    pub update_snapshots: Option<UpdateSnapshots>,
    pub workers: Option<usize>,
    /// Per-project fixture overrides, matched by name case-insensitively.
    pub projects: Option<Vec<ProjectOverride>>,
    /// Fixture overrides merged into every project.
    pub fixture_params: Option<IndexMap<String, serde_json::Value>>,
}

/// Fixture overrides for a single named project.
#[derive(Clone, Debug)]
pub struct ProjectOverride {
    pub name: String,
    pub fixture_params: IndexMap<String, serde_json::Value>,
}

impl ConfigCliOverrides {
    /// Applies these overrides to `config`, mutating shared project records
    /// in place.
    pub fn apply(self, config: &mut Config) {
        if let Some(v) = self.forbid_only {
            config.forbid_only = v;
        }
        if let Some(v) = self.fully_parallel {
            config.fully_parallel = v;
        }
        if let Some(v) = self.global_timeout {
            config.global_timeout = Some(v);
        }
        if let Some(v) = self.max_failures {
            config.max_failures = v;
        }
        if let Some(v) = self.quiet {
            config.quiet = v;
        }
        if let Some(v) = self.reporter {
            config.reporters = v;
        }
        if let Some(v) = self.shard {
            config.shard = Some(v);
        }
        if let Some(v) = self.ignore_snapshots {
            config.ignore_snapshots = v;
        }
        if let Some(v) = self.update_snapshots {
            config.update_snapshots = v;
        }
        if let Some(v) = self.workers {
            config.workers = v;
        }
        for project in &mut config.projects {
            let project = Arc::make_mut(project);
            if let Some(v) = self.repeat_each {
                project.repeat_each = v;
            }
            if let Some(v) = self.retries {
                project.retries = v;
            }
            if let Some(v) = self.timeout {
                project.timeout = Some(v);
            }
            if let Some(dir) = &self.output_dir {
                project.output_dir = dir.clone();
            }
            if let Some(params) = &self.fixture_params {
                project
                    .fixture_params
                    .extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            if let Some(overrides) = &self.projects {
                for o in overrides {
                    if o.name.eq_ignore_ascii_case(&project.name) {
                        project
                            .fixture_params
                            .extend(o.fixture_params.iter().map(|(k, v)| (k.clone(), v.clone())));
                    }
                }
            }
        }
    }
}

/// A CLI file filter: a file pattern with an optional focused line and
/// column.
#[derive(Clone, Debug)]
pub struct TestFileFilter {
    /// Glob or substring matched against the test file path.
    pub pattern: String,
    /// 1-based line the focused test must be declared on.
    pub line: Option<u32>,
    /// 1-based column the focused test must be declared on.
    pub column: Option<u32>,
}

/// Predicate over a test's full space-joined title.
pub type TitleMatcher = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// Per-invocation options.
#[derive(Debug, Default)]
pub struct RunOptions {
    /// Skip dispatch and produce a listing.
    pub list_only: bool,
    /// CLI file filters.
    pub test_file_filters: Vec<TestFileFilter>,
    /// CLI title matcher.
    pub test_title_matcher: Option<DebugIgnore<TitleMatcher>>,
    /// Project names to run, case-insensitive. `None` runs every project.
    pub project_filter: Option<Vec<String>>,
    /// When false, an empty test selection is a fatal error.
    pub pass_with_no_tests: bool,
}

impl RunOptions {
    pub(crate) fn title_matches(&self, full_title: &str) -> bool {
        match &self.test_title_matcher {
            Some(matcher) => (matcher.0)(full_title),
            None => true,
        }
    }
}

/// A resolved configuration location.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConfigLocation {
    /// A config file to load.
    File(Utf8PathBuf),
    /// A directory to treat as the testing root, with no config file.
    TestingRoot(Utf8PathBuf),
}

/// Resolves a user-supplied path to a config file or testing root.
pub fn resolve_config_location(path: &Utf8Path) -> Result<ConfigLocation, ConfigResolveError> {
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == io::ErrorKind::NotFound => {
            return Err(ConfigResolveError::NotFound(path.to_owned()));
        }
        Err(error) => {
            return Err(ConfigResolveError::Io {
                path: path.to_owned(),
                error,
            });
        }
    };
    if metadata.is_file() {
        return Ok(ConfigLocation::File(path.to_owned()));
    }
    for name in CONFIG_FILE_NAMES {
        let candidate = path.join(name);
        if candidate.is_file() {
            return Ok(ConfigLocation::File(candidate));
        }
    }
    Ok(ConfigLocation::TestingRoot(path.to_owned()))
}

/// Selects the projects matching `filter` (case-insensitive), in config
/// order. Unknown names are an error.
pub(crate) fn select_projects(
    projects: &[Arc<Project>],
    filter: Option<&[String]>,
) -> Result<Vec<Arc<Project>>, ProjectNotFound> {
    let Some(filter) = filter else {
        return Ok(projects.to_vec());
    };
    let missing: Vec<&String> = filter
        .iter()
        .filter(|name| !projects.iter().any(|p| p.name.eq_ignore_ascii_case(name)))
        .collect();
    if !missing.is_empty() {
        return Err(ProjectNotFound::new(
            missing.into_iter().map(String::as_str),
            projects.iter().map(|p| p.name.as_str()),
        ));
    }
    Ok(projects
        .iter()
        .filter(|p| filter.iter().any(|name| p.name.eq_ignore_ascii_case(name)))
        .cloned()
        .collect())
}

/// Partitions projects into stages by ascending stage ordinal, preserving
/// config order within each stage.
pub(crate) fn partition_into_stages(projects: &[Arc<Project>]) -> Vec<(i32, Vec<Arc<Project>>)> {
    let mut stages: BTreeMap<i32, Vec<Arc<Project>>> = BTreeMap::new();
    for project in projects {
        stages.entry(project.stage).or_default().push(project.clone());
    }
    stages.into_iter().collect()
}

/// Derives the worker hash for one repeat-each clone of a project: a stable
/// token over the project id and the worker-scoped fixture parameters.
pub(crate) fn worker_hash(project: &Project, repeat_each_index: usize) -> String {
    let mut digest_input = format!("{}#{}", project.id, repeat_each_index);
    for (key, value) in project
        .fixture_params
        .iter()
        .sorted_by(|a, b| a.0.cmp(b.0))
    {
        let _ = write!(digest_input, ";{key}={value}");
    }
    format!("{:016x}", xxh64(digest_input.as_bytes(), 0))
}

fn assign_project_ids(projects: &mut [Project]) {
    let mut seen: HashMap<String, usize> = HashMap::new();
    for project in projects {
        let base = sanitize_id(&project.name);
        let count = seen.entry(base.clone()).or_insert(0);
        project.id = if *count == 0 {
            base
        } else {
            format!("{base}-{count}")
        };
        *count += 1;
    }
}

fn sanitize_id(name: &str) -> String {
    let id: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let id = id.trim_matches('-').to_owned();
    if id.is_empty() { "project".to_owned() } else { id }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    fn projects(names: &[&str]) -> Vec<Arc<Project>> {
        let config = Config::new(names.iter().map(|n| Project::new(*n, "/tests")).collect());
        config.projects
    }

    #[test]
    fn select_projects_is_case_insensitive() {
        let all = projects(&["Chromium", "api"]);
        let selected = select_projects(&all, Some(&["CHROMIUM".to_owned()])).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].name, "Chromium");
    }

    #[test]
    fn select_projects_reports_unknown_names() {
        let all = projects(&["chromium", "api"]);
        let err = select_projects(&all, Some(&["mobile".to_owned()])).unwrap_err();
        assert_eq!(
            err.to_string(),
            "project(s) 'mobile' not found (known projects: api, chromium)"
        );
    }

    #[test]
    fn select_projects_without_filter_keeps_order() {
        let all = projects(&["b", "a"]);
        let selected = select_projects(&all, None).unwrap();
        let names: Vec<_> = selected.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["b", "a"]);
    }

    #[test_case("My Project", "my-project")]
    #[test_case("API (v2)", "api--v2")]
    #[test_case("---", "project")]
    fn sanitize_id_cases(name: &str, expected: &str) {
        assert_eq!(sanitize_id(name), expected);
    }

    #[test]
    fn duplicate_names_get_distinct_ids() {
        let all = projects(&["app", "app", "App"]);
        let ids: Vec<_> = all.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, ["app", "app-1", "app-2"]);
    }

    #[test]
    fn worker_hash_is_stable_and_sensitive() {
        let all = projects(&["app"]);
        let base = worker_hash(&all[0], 0);
        assert_eq!(base, worker_hash(&all[0], 0), "hash is deterministic");
        assert_ne!(base, worker_hash(&all[0], 1), "repeat index is hashed");

        let mut fixture = (*all[0]).clone();
        fixture
            .fixture_params
            .insert("browser".to_owned(), serde_json::json!("firefox"));
        assert_ne!(base, worker_hash(&fixture, 0), "fixtures are hashed");
    }

    #[test]
    fn stage_partition_is_ordered_by_ordinal() {
        let mut raw: Vec<Project> = vec![
            Project::new("late", "/tests"),
            Project::new("early", "/tests"),
            Project::new("also-late", "/tests"),
        ];
        raw[0].stage = 5;
        raw[1].stage = -1;
        raw[2].stage = 5;
        let config = Config::new(raw);
        let stages = partition_into_stages(&config.projects);
        let summary: Vec<(i32, Vec<&str>)> = stages
            .iter()
            .map(|(ordinal, ps)| (*ordinal, ps.iter().map(|p| p.name.as_str()).collect()))
            .collect();
        assert_eq!(
            summary,
            vec![(-1, vec!["early"]), (5, vec!["late", "also-late"])]
        );
    }

    #[test]
    fn overrides_apply_to_config_and_projects() {
        let mut config = Config::new(vec![Project::new("app", "/tests")]);
        let overrides = ConfigCliOverrides {
            forbid_only: Some(true),
            retries: Some(2),
            repeat_each: Some(3),
            workers: Some(7),
            output_dir: Some("/tmp/out".into()),
            ..ConfigCliOverrides::default()
        };
        overrides.apply(&mut config);
        assert!(config.forbid_only);
        assert_eq!(config.workers, 7);
        assert_eq!(config.projects[0].retries, 2);
        assert_eq!(config.projects[0].repeat_each, 3);
        assert_eq!(config.projects[0].output_dir, "/tmp/out");
    }

    #[test]
    fn resolve_config_location_searches_known_names() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();

        assert_eq!(
            resolve_config_location(&root).unwrap(),
            ConfigLocation::TestingRoot(root.clone()),
            "bare directory is a testing root"
        );

        let config_file = root.join("stagerunner.config.ts");
        std::fs::write(&config_file, "export default {};").unwrap();
        assert_eq!(
            resolve_config_location(&root).unwrap(),
            ConfigLocation::File(config_file.clone()),
        );
        assert_eq!(
            resolve_config_location(&config_file).unwrap(),
            ConfigLocation::File(config_file),
            "explicit file wins"
        );

        let missing = root.join("nope");
        assert!(matches!(
            resolve_config_location(&missing),
            Err(crate::errors::ConfigResolveError::NotFound(_))
        ));
    }
}
