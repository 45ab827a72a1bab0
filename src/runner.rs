// Copyright (c) The stagerunner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The run orchestrator.
//!
//! [`Runner`] wires collection, grouping, sharding, and the staged dispatch
//! loop together. Stages run strictly in order; a failing stage cascades by
//! skipping every non-always group of later stages. Interrupts drain the
//! current stage and skip the rest; the global timeout aborts the wait but
//! leaves teardown to complete.

use crate::{
    config::{select_projects, Config, Project, RunOptions},
    dispatch::{DispatchContext, DispatcherFactory},
    errors::{ConfigError, TestError},
    grouping::TestGroup,
    loader::{collect_run, RunCollection, TestFileLoader},
    plugin::{run_and_report_error, GlobalSetup, GlobalTeardown, Plugin},
    reporter::{FullResult, FullStatus, Reporter, ReporterRegistry, RunStats, REPORTER_ENV},
    signal::{SignalHandlerKind, SignalWatcher},
    suite::{SuiteTree, TestResult},
    walker::collect_project_files,
};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::Local;
use serde::Serialize;
use std::{
    collections::HashSet,
    fs,
    io::{self, Write as _},
    sync::Arc,
    time::Instant,
};
use tracing::{debug, warn};

/// Environment variable reported as-is in the list-files report.
pub const DOCKER_ENV: &str = "STAGERUNNER_DOCKER";

/// Orchestrates one or more runs over a loaded [`Config`].
pub struct Runner {
    config: Config,
    loader: Box<dyn TestFileLoader>,
    dispatcher_factory: Box<dyn DispatcherFactory>,
    plugins: Vec<Box<dyn Plugin>>,
    global_setup: Option<Box<dyn GlobalSetup>>,
    global_teardown: Option<Box<dyn GlobalTeardown>>,
    registry: ReporterRegistry,
    signal_handler: SignalHandlerKind,
}

#[derive(Default)]
struct LifecycleState {
    /// Number of plugins whose setup ran to completion; exactly these are
    /// torn down, in reverse.
    plugins_set_up: usize,
    /// Teardown handle returned from the user global setup hook. Runs
    /// before `global_teardown` during shutdown.
    global_setup_teardown: Option<Box<dyn GlobalTeardown>>,
}

enum SetupOutcome {
    Ok,
    Failed,
    Interrupted,
}

impl Runner {
    /// Creates a runner, taking ownership of the config's plugins and global
    /// hooks.
    pub fn new(
        mut config: Config,
        loader: Box<dyn TestFileLoader>,
        dispatcher_factory: Box<dyn DispatcherFactory>,
    ) -> Self {
        let plugins = std::mem::take(&mut config.plugins.0);
        let global_setup = config.global_setup.0.take();
        let global_teardown = config.global_teardown.0.take();
        Self {
            config,
            loader,
            dispatcher_factory,
            plugins,
            global_setup,
            global_teardown,
            registry: ReporterRegistry::new(),
            signal_handler: SignalHandlerKind::Standard,
        }
    }

    /// The run configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The reporter registry, for registering framework reporters.
    pub fn reporter_registry_mut(&mut self) -> &mut ReporterRegistry {
        &mut self.registry
    }

    /// Overrides the signal handling kind. Tests use
    /// [`SignalHandlerKind::Noop`].
    pub fn set_signal_handler(&mut self, kind: SignalHandlerKind) {
        self.signal_handler = kind;
    }

    /// Runs (or lists) tests per `options` and returns the full result.
    ///
    /// Configuration errors (unknown projects, unbuildable reporters) are
    /// returned before any reporting; everything else flows through the
    /// reporter and the returned status.
    pub async fn run_tests(&mut self, options: RunOptions) -> Result<FullResult, ConfigError> {
        let start_time = Local::now();
        let started = Instant::now();

        let selected = select_projects(&self.config.projects, options.project_filter.as_deref())?;
        let ci = std::env::var_os("CI").is_some_and(|value| !value.is_empty());
        let env_extra = std::env::var(REPORTER_ENV).ok();
        let mut reporter =
            self.registry
                .build_multiplexer(&self.config, options.list_only, env_extra, ci)?;

        let global_timeout = self.config.global_timeout;
        let mut lifecycle = LifecycleState::default();
        let mut run_stats = RunStats::default();
        let mut timed_out = false;
        let mut status = {
            let phases = self.run_phases(
                selected,
                &options,
                &mut reporter,
                &mut lifecycle,
                &mut run_stats,
            );
            tokio::pin!(phases);
            match global_timeout {
                Some(limit) => {
                    tokio::select! {
                        status = &mut phases => status,
                        _ = tokio::time::sleep(limit) => {
                            timed_out = true;
                            FullStatus::TimedOut
                        }
                    }
                }
                None => phases.await,
            }
        };
        if timed_out {
            let seconds = global_timeout
                .expect("timed out implies a deadline")
                .as_secs_f64();
            reporter.on_error(&TestError::stackless(format!(
                "Timed out waiting {seconds}s for the entire test run"
            )));
        }

        let mut teardown_failed = false;
        self.teardown_global(&mut reporter, &mut lifecycle, &mut teardown_failed)
            .await;
        if teardown_failed && status == FullStatus::Passed {
            status = FullStatus::Failed;
        }

        let result = FullResult {
            status,
            stats: run_stats,
            start_time,
            duration: started.elapsed(),
        };
        reporter.on_end(&result);
        let _ = io::stdout().flush();
        let _ = io::stderr().flush();
        reporter.on_exit();
        Ok(result)
    }

    /// Collects every selected project's test files and produces the
    /// list-files report.
    pub fn list_test_files(
        &self,
        project_filter: Option<&[String]>,
    ) -> Result<ListFilesReport, ConfigError> {
        let selected = select_projects(&self.config.projects, project_filter)?;
        let docker = std::env::var(DOCKER_ENV).ok();
        let mut projects = Vec::with_capacity(selected.len());
        for project in &selected {
            let files =
                collect_project_files(project, &[]).map_err(ConfigError::FileCollection)?;
            projects.push(ProjectFiles {
                docker: docker.clone(),
                name: project.name.clone(),
                test_dir: project.test_dir.clone(),
                files,
            });
        }
        Ok(ListFilesReport { projects })
    }

    async fn run_phases(
        &mut self,
        selected: Vec<Arc<Project>>,
        options: &RunOptions,
        reporter: &mut dyn Reporter,
        lifecycle: &mut LifecycleState,
        run_stats: &mut RunStats,
    ) -> FullStatus {
        let collection = collect_run(&self.config, &selected, options, &mut *self.loader).await;
        let RunCollection {
            mut tree,
            stages,
            fatal_errors,
            max_concurrent_test_groups,
        } = collection;
        self.config.max_concurrent_test_groups = max_concurrent_test_groups;
        run_stats.initial_run_count = stages
            .iter()
            .flatten()
            .map(|group| group.tests.len())
            .sum();

        reporter.on_begin(&self.config, &tree);
        if !fatal_errors.is_empty() {
            for error in &fatal_errors {
                reporter.on_error(error);
            }
            return FullStatus::Failed;
        }
        if options.list_only {
            return FullStatus::Passed;
        }
        if let Err(error) = remove_output_dirs(&selected) {
            reporter.on_error(&error);
            return FullStatus::Failed;
        }

        match self.setup_global(reporter, lifecycle).await {
            SetupOutcome::Interrupted => return FullStatus::Interrupted,
            SetupOutcome::Failed => return FullStatus::Failed,
            SetupOutcome::Ok => {}
        }

        let mut previous_stage_failed = false;
        let mut worker_errors = false;
        let mut interrupted = false;
        for (index, stage) in stages.iter().enumerate() {
            let mut groups = stage.clone();
            if previous_stage_failed {
                groups = skip_non_always_groups(&mut tree, reporter, groups);
            }
            if groups.is_empty() {
                debug!(stage = index, "stage has no groups, skipping");
            } else {
                debug!(stage = index, groups = groups.len(), "dispatching stage");

                let mut dispatcher = self.dispatcher_factory.create_dispatcher(groups.clone());
                let mut watcher = SignalWatcher::install(self.signal_handler);
                {
                    let cx = DispatchContext {
                        config: &self.config,
                        tree: &mut tree,
                        reporter: &mut *reporter,
                    };
                    tokio::select! {
                        _ = dispatcher.run(cx) => {}
                        _ = watcher.wait() => {}
                    }
                }
                if !watcher.had_signal() {
                    watcher.disarm();
                }
                dispatcher.stop().await;

                worker_errors = dispatcher.has_worker_errors();
                interrupted = watcher.had_signal();
            }

            // The stage tally covers both dispatched groups and the skip
            // path's synthetic results.
            let mut stage_stats = RunStats::default();
            for group in stage {
                for &test in &group.tests {
                    stage_stats.record(tree.test(test));
                }
            }
            run_stats.merge(stage_stats);

            if worker_errors || interrupted {
                break;
            }
            previous_stage_failed = previous_stage_failed || stage_stats.has_failures();
        }

        if interrupted {
            FullStatus::Interrupted
        } else if worker_errors || run_stats.has_failures() {
            FullStatus::Failed
        } else {
            FullStatus::Passed
        }
    }

    async fn setup_global(
        &mut self,
        reporter: &mut dyn Reporter,
        lifecycle: &mut LifecycleState,
    ) -> SetupOutcome {
        for plugin in &mut self.plugins {
            let mut watcher = SignalWatcher::install(self.signal_handler);
            let setup_result = tokio::select! {
                result = plugin.setup(&self.config, &mut *reporter) => Some(result),
                _ = watcher.wait() => None,
            };
            match setup_result {
                None => return SetupOutcome::Interrupted,
                Some(result) => {
                    lifecycle.plugins_set_up += 1;
                    if let Err(error) = result {
                        reporter.on_error(&error);
                        return SetupOutcome::Failed;
                    }
                }
            }
            watcher.disarm();
        }

        if let Some(setup) = &mut self.global_setup {
            let mut watcher = SignalWatcher::install(self.signal_handler);
            let setup_result = tokio::select! {
                result = setup.run(&self.config) => Some(result),
                _ = watcher.wait() => None,
            };
            match setup_result {
                None => return SetupOutcome::Interrupted,
                Some(Ok(teardown)) => lifecycle.global_setup_teardown = teardown,
                Some(Err(error)) => {
                    reporter.on_error(&error);
                    return SetupOutcome::Failed;
                }
            }
            watcher.disarm();
        }
        SetupOutcome::Ok
    }

    /// Runs every teardown step in reverse setup order: the handle returned
    /// from global setup, then the global teardown hook, then plugins.
    /// Failures are reported without short-circuiting.
    async fn teardown_global(
        &mut self,
        reporter: &mut dyn Reporter,
        lifecycle: &mut LifecycleState,
        failed: &mut bool,
    ) {
        if let Some(mut teardown) = lifecycle.global_setup_teardown.take() {
            run_and_report_error(teardown.run(&self.config), reporter, failed).await;
        }
        if let Some(teardown) = &mut self.global_teardown {
            run_and_report_error(teardown.run(&self.config), reporter, failed).await;
        }
        let set_up = lifecycle.plugins_set_up.min(self.plugins.len());
        for plugin in self.plugins[..set_up].iter_mut().rev() {
            run_and_report_error(plugin.teardown(), reporter, failed).await;
        }
    }
}

/// Emits synthetic skipped events for every test of the non-always groups
/// and returns the groups that still run.
fn skip_non_always_groups(
    tree: &mut SuiteTree,
    reporter: &mut dyn Reporter,
    groups: Vec<TestGroup>,
) -> Vec<TestGroup> {
    use crate::config::RunMode;

    let mut remaining = Vec::new();
    for group in groups {
        if group.run == RunMode::Always {
            remaining.push(group);
            continue;
        }
        for &test_id in &group.tests {
            let result = TestResult::skipped();
            tree.test_mut(test_id).results.push(result.clone());
            reporter.on_test_begin(tree.test(test_id));
            reporter.on_test_end(tree.test(test_id), &result);
        }
    }
    remaining
}

/// Best-effort removal of the selected projects' output directories. Busy
/// directories (mounted volumes) have their children removed instead; any
/// other failure fails the run.
fn remove_output_dirs(projects: &[Arc<Project>]) -> Result<(), TestError> {
    let mut seen = HashSet::new();
    for project in projects {
        if !seen.insert(project.output_dir.clone()) {
            continue;
        }
        remove_dir_recursive(&project.output_dir)?;
    }
    Ok(())
}

fn remove_dir_recursive(dir: &Utf8Path) -> Result<(), TestError> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(error) if error.kind() == io::ErrorKind::ResourceBusy => {
            warn!(directory = %dir, "output directory is busy, removing its children");
            let entries = dir.read_dir_utf8().map_err(|e| cleanup_error(dir, &e))?;
            for entry in entries {
                let entry = entry.map_err(|e| cleanup_error(dir, &e))?;
                let path = entry.path();
                let file_type = entry.file_type().map_err(|e| cleanup_error(path, &e))?;
                let removed = if file_type.is_dir() {
                    fs::remove_dir_all(path)
                } else {
                    fs::remove_file(path)
                };
                removed.map_err(|e| cleanup_error(path, &e))?;
            }
            Ok(())
        }
        Err(error) => Err(cleanup_error(dir, &error)),
    }
}

fn cleanup_error(path: &Utf8Path, error: &io::Error) -> TestError {
    TestError::new(format!("failed to remove output directory {path}: {error}"))
}

/// The list-files report, serialized as JSON for tooling.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFilesReport {
    pub projects: Vec<ProjectFiles>,
}

/// One project's entry in the list-files report.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectFiles {
    /// Value of [`DOCKER_ENV`], reported as-is.
    pub docker: Option<String>,
    pub name: String,
    /// Absolute test directory.
    pub test_dir: Utf8PathBuf,
    pub files: Vec<Utf8PathBuf>,
}
