// Copyright (c) The stagerunner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end orchestration scenarios against mock loader and dispatcher
//! seams: stage cascades, always-run survival, list mode, the global
//! timeout, and teardown ordering.

use camino::{Utf8Path, Utf8PathBuf};
use futures::future::BoxFuture;
use pretty_assertions::assert_eq;
use stagerunner::{
    config::{Config, Project, RunMode, RunOptions},
    dispatch::{DispatchContext, Dispatcher, DispatcherFactory},
    errors::{ConfigError, TestError},
    grouping::TestGroup,
    loader::{DeclEntry, SuiteDecl, TestDecl, TestFileLoader},
    plugin::{GlobalSetup, GlobalTeardown, Plugin},
    reporter::{FullResult, FullStatus, Reporter},
    signal::SignalHandlerKind,
    suite::{Location, SuiteTree, TestCase, TestResult, TestStatus},
    Runner,
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

// ---
// Harness
// ---

/// Shared event log; the recording reporter, hooks, and plugins all append
/// to it so ordering across the whole lifecycle can be asserted.
type EventLog = Arc<Mutex<Vec<String>>>;

fn push(log: &EventLog, event: impl Into<String>) {
    log.lock().unwrap().push(event.into());
}

#[derive(Clone, Default)]
struct RecordingReporter {
    events: EventLog,
}

impl Reporter for RecordingReporter {
    fn on_begin(&mut self, _config: &Config, _tree: &SuiteTree) {
        push(&self.events, "begin");
    }

    fn on_test_begin(&mut self, test: &TestCase) {
        push(&self.events, format!("test-begin:{}", test.title));
    }

    fn on_test_end(&mut self, test: &TestCase, result: &TestResult) {
        push(
            &self.events,
            format!("test-end:{}:{:?}", test.title, result.status),
        );
    }

    fn on_error(&mut self, error: &TestError) {
        push(&self.events, format!("error:{}", error.message));
    }

    fn on_end(&mut self, result: &FullResult) {
        push(&self.events, format!("end:{:?}", result.status));
    }

    fn on_exit(&mut self) {
        push(&self.events, "exit");
    }
}

struct MapLoader {
    files: HashMap<Utf8PathBuf, SuiteDecl>,
}

impl TestFileLoader for MapLoader {
    fn load_file<'a>(
        &'a mut self,
        path: &'a Utf8Path,
    ) -> BoxFuture<'a, Result<SuiteDecl, TestError>> {
        let result = self
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| TestError::new(format!("cannot compile {path}")));
        Box::pin(async move { result })
    }
}

/// Runs every group to completion, with per-title outcomes.
struct MockDispatcherFactory {
    outcomes: HashMap<String, TestStatus>,
    batches: Arc<Mutex<Vec<Vec<TestGroup>>>>,
    worker_errors: bool,
}

impl MockDispatcherFactory {
    fn new() -> Self {
        Self {
            outcomes: HashMap::new(),
            batches: Arc::new(Mutex::new(Vec::new())),
            worker_errors: false,
        }
    }

    fn failing(titles: &[&str]) -> Self {
        let mut factory = Self::new();
        for title in titles {
            factory
                .outcomes
                .insert((*title).to_owned(), TestStatus::Failed);
        }
        factory
    }

    fn batches(&self) -> Arc<Mutex<Vec<Vec<TestGroup>>>> {
        self.batches.clone()
    }
}

impl DispatcherFactory for MockDispatcherFactory {
    fn create_dispatcher(&mut self, groups: Vec<TestGroup>) -> Box<dyn Dispatcher> {
        self.batches.lock().unwrap().push(groups.clone());
        Box::new(MockDispatcher {
            groups,
            outcomes: self.outcomes.clone(),
            worker_errors: self.worker_errors,
        })
    }
}

struct MockDispatcher {
    groups: Vec<TestGroup>,
    outcomes: HashMap<String, TestStatus>,
    worker_errors: bool,
}

impl Dispatcher for MockDispatcher {
    fn run<'a>(&'a mut self, cx: DispatchContext<'a>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let DispatchContext { tree, reporter, .. } = cx;
            for group in &self.groups {
                for &test_id in &group.tests {
                    let status = self
                        .outcomes
                        .get(&tree.test(test_id).title)
                        .copied()
                        .unwrap_or(TestStatus::Passed);
                    let result = TestResult {
                        status,
                        error: (status == TestStatus::Failed)
                            .then(|| TestError::new("assertion failed")),
                        duration: Duration::ZERO,
                    };
                    reporter.on_test_begin(tree.test(test_id));
                    tree.test_mut(test_id).results.push(result.clone());
                    reporter.on_test_end(tree.test(test_id), &result);
                }
            }
        })
    }

    fn stop(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }

    fn has_worker_errors(&self) -> bool {
        self.worker_errors
    }
}

struct Harness {
    _guard: tempfile::TempDir,
    root: Utf8PathBuf,
    files: HashMap<Utf8PathBuf, SuiteDecl>,
}

impl Harness {
    fn new() -> Self {
        let guard = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(guard.path().to_path_buf()).unwrap();
        Self {
            _guard: guard,
            root,
            files: HashMap::new(),
        }
    }

    /// Writes an (empty) test file and registers its declaration with the
    /// mock loader.
    fn add_file(&mut self, relative: &str, titles: &[&str]) {
        let full = self.root.join(relative);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(&full, "// test file").unwrap();
        let mut decl = SuiteDecl::new("");
        for (index, title) in titles.iter().enumerate() {
            decl.entries.push(DeclEntry::Test(TestDecl::new(
                *title,
                Location::new(full.clone(), index as u32 + 1, 1),
            )));
        }
        self.files.insert(full, decl);
    }

    fn project(&self, name: &str, subdir: &str, stage: i32) -> Project {
        let mut project = Project::new(name, self.root.join(subdir));
        project.stage = stage;
        project
    }

    fn runner(&self, mut config: Config, factory: MockDispatcherFactory) -> (Runner, EventLog) {
        config.reporters = vec!["record".to_owned()];
        let mut runner = Runner::new(
            config,
            Box::new(MapLoader {
                files: self.files.clone(),
            }),
            Box::new(factory),
        );
        runner.set_signal_handler(SignalHandlerKind::Noop);
        let recorder = RecordingReporter::default();
        let events = recorder.events.clone();
        runner.reporter_registry_mut().register(
            "record",
            Box::new(move |_| -> Box<dyn Reporter> { Box::new(recorder.clone()) }),
        );
        (runner, events)
    }
}

fn events_of(log: &EventLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

// ---
// Scenarios
// ---

#[tokio::test]
async fn passing_run_reports_in_lifecycle_order() {
    let mut harness = Harness::new();
    harness.add_file("app/a.test.ts", &["one", "two"]);
    let config = Config::new(vec![harness.project("app", "app", 0)]);
    let (mut runner, log) = harness.runner(config, MockDispatcherFactory::new());

    let result = runner.run_tests(RunOptions::default()).await.unwrap();
    assert_eq!(result.status, FullStatus::Passed);
    assert_eq!(result.stats.initial_run_count, 2);
    assert_eq!(result.stats.finished_count, 2);
    assert_eq!(result.stats.passed, 2);
    assert!(result.stats.is_success());
    assert_eq!(
        events_of(&log),
        [
            "begin",
            "test-begin:one",
            "test-end:one:Passed",
            "test-begin:two",
            "test-end:two:Passed",
            "end:Passed",
            "exit",
        ]
    );
}

#[tokio::test]
async fn failing_stage_cascades_skips_to_later_stages() {
    let mut harness = Harness::new();
    harness.add_file("a/x.test.ts", &["p1", "f1", "f2"]);
    harness.add_file("b/y.test.ts", &["b1", "b2"]);
    let config = Config::new(vec![
        harness.project("A", "a", 0),
        harness.project("B", "b", 1),
    ]);
    let factory = MockDispatcherFactory::failing(&["f1", "f2"]);
    let batches = factory.batches();
    let (mut runner, log) = harness.runner(config, factory);

    let result = runner.run_tests(RunOptions::default()).await.unwrap();
    assert_eq!(result.status, FullStatus::Failed);
    assert_eq!(
        batches.lock().unwrap().len(),
        1,
        "stage 1 never reaches the dispatcher"
    );
    assert_eq!(result.stats.initial_run_count, 5);
    assert_eq!(result.stats.finished_count, 5);
    assert_eq!(result.stats.passed, 1);
    assert_eq!(result.stats.failed, 2);
    assert_eq!(result.stats.skipped, 2, "cascade skips are tallied");
    assert!(result.stats.has_failures());
    let events = events_of(&log);
    assert!(events.contains(&"test-end:f2:Failed".to_owned()));
    assert!(events.contains(&"test-end:b1:Skipped".to_owned()));
    assert!(events.contains(&"test-end:b2:Skipped".to_owned()));
}

#[tokio::test]
async fn always_run_group_survives_cascade() {
    let mut harness = Harness::new();
    harness.add_file("a/x.test.ts", &["fails"]);
    harness.add_file("b/default.test.ts", &["regular"]);
    harness.add_file("c/smoke.test.ts", &["smoke"]);
    let mut always = harness.project("smoke", "c", 1);
    always.run = RunMode::Always;
    let config = Config::new(vec![
        harness.project("A", "a", 0),
        harness.project("B", "b", 1),
        always,
    ]);
    let factory = MockDispatcherFactory::failing(&["fails"]);
    let batches = factory.batches();
    let (mut runner, log) = harness.runner(config, factory);

    let result = runner.run_tests(RunOptions::default()).await.unwrap();
    assert_eq!(result.status, FullStatus::Failed);
    assert_eq!(result.stats.failed, 1);
    assert_eq!(result.stats.skipped, 1);
    assert_eq!(result.stats.passed, 1, "the always group still ran");

    let batches = batches.lock().unwrap();
    assert_eq!(batches.len(), 2);
    assert!(
        batches[1].iter().all(|g| g.run == RunMode::Always),
        "only the always group reaches the stage-1 dispatcher"
    );
    let events = events_of(&log);
    assert!(events.contains(&"test-end:regular:Skipped".to_owned()));
    assert!(events.contains(&"test-end:smoke:Passed".to_owned()));
}

#[tokio::test]
async fn list_mode_produces_no_test_events() {
    let mut harness = Harness::new();
    harness.add_file("app/a.test.ts", &["one"]);
    let config = Config::new(vec![harness.project("app", "app", 0)]);
    let factory = MockDispatcherFactory::new();
    let batches = factory.batches();
    let (mut runner, log) = harness.runner(config, factory);

    let result = runner
        .run_tests(RunOptions {
            list_only: true,
            ..RunOptions::default()
        })
        .await
        .unwrap();
    assert_eq!(result.status, FullStatus::Passed);
    assert!(batches.lock().unwrap().is_empty(), "nothing is dispatched");
    assert_eq!(events_of(&log), ["begin", "end:Passed", "exit"]);
}

#[tokio::test]
async fn collection_errors_abort_before_dispatch() {
    let mut harness = Harness::new();
    harness.add_file("app/a.test.ts", &["same", "same"]);
    let config = Config::new(vec![harness.project("app", "app", 0)]);
    let factory = MockDispatcherFactory::new();
    let batches = factory.batches();
    let (mut runner, log) = harness.runner(config, factory);

    let result = runner.run_tests(RunOptions::default()).await.unwrap();
    assert_eq!(result.status, FullStatus::Failed);
    assert!(batches.lock().unwrap().is_empty());
    let events = events_of(&log);
    assert_eq!(events[0], "begin");
    assert!(events[1].starts_with("error:duplicate test titles"));
    assert_eq!(events[events.len() - 2], "end:Failed");
    assert_eq!(events[events.len() - 1], "exit");
}

#[tokio::test]
async fn unknown_project_filter_errors_before_reporting() {
    let mut harness = Harness::new();
    harness.add_file("app/a.test.ts", &["one"]);
    let config = Config::new(vec![harness.project("app", "app", 0)]);
    let (mut runner, log) = harness.runner(config, MockDispatcherFactory::new());

    let error = runner
        .run_tests(RunOptions {
            project_filter: Some(vec!["mobile".to_owned()]),
            ..RunOptions::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(error, ConfigError::ProjectNotFound(_)));
    assert!(events_of(&log).is_empty(), "no reporting happened");
}

#[tokio::test]
async fn worker_errors_fail_the_run_and_stop_the_stage_loop() {
    let mut harness = Harness::new();
    harness.add_file("a/x.test.ts", &["one"]);
    harness.add_file("b/y.test.ts", &["two"]);
    let config = Config::new(vec![
        harness.project("A", "a", 0),
        harness.project("B", "b", 1),
    ]);
    let mut factory = MockDispatcherFactory::new();
    factory.worker_errors = true;
    let batches = factory.batches();
    let (mut runner, _log) = harness.runner(config, factory);

    let result = runner.run_tests(RunOptions::default()).await.unwrap();
    assert_eq!(result.status, FullStatus::Failed);
    assert_eq!(batches.lock().unwrap().len(), 1, "stage loop exits early");
}

// ---
// Global lifecycle
// ---

struct LoggingPlugin {
    name: String,
    log: EventLog,
}

impl Plugin for LoggingPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn setup<'a>(
        &'a mut self,
        _config: &'a Config,
        _reporter: &'a mut dyn Reporter,
    ) -> BoxFuture<'a, Result<(), TestError>> {
        push(&self.log, format!("{}-up", self.name));
        Box::pin(std::future::ready(Ok(())))
    }

    fn teardown(&mut self) -> BoxFuture<'_, Result<(), TestError>> {
        push(&self.log, format!("{}-down", self.name));
        Box::pin(std::future::ready(Ok(())))
    }
}

struct BlockingPlugin;

impl Plugin for BlockingPlugin {
    fn setup<'a>(
        &'a mut self,
        _config: &'a Config,
        _reporter: &'a mut dyn Reporter,
    ) -> BoxFuture<'a, Result<(), TestError>> {
        Box::pin(async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
    }
}

struct LoggingSetup {
    log: EventLog,
}

impl GlobalSetup for LoggingSetup {
    fn run<'a>(
        &'a mut self,
        _config: &'a Config,
    ) -> BoxFuture<'a, Result<Option<Box<dyn GlobalTeardown>>, TestError>> {
        push(&self.log, "global-setup");
        let log = self.log.clone();
        Box::pin(async move {
            Ok(Some(Box::new(LoggingTeardown {
                label: "setup-teardown".to_owned(),
                log,
            }) as Box<dyn GlobalTeardown>))
        })
    }
}

struct LoggingTeardown {
    label: String,
    log: EventLog,
}

impl GlobalTeardown for LoggingTeardown {
    fn run<'a>(&'a mut self, _config: &'a Config) -> BoxFuture<'a, Result<(), TestError>> {
        push(&self.log, self.label.clone());
        Box::pin(std::future::ready(Ok(())))
    }
}

#[tokio::test]
async fn teardown_runs_in_reverse_order_on_every_exit_path() {
    let mut harness = Harness::new();
    harness.add_file("app/a.test.ts", &["one"]);
    let mut config = Config::new(vec![harness.project("app", "app", 0)]);

    let lifecycle_log: EventLog = Arc::default();
    config.plugins.0 = vec![
        Box::new(LoggingPlugin {
            name: "web-server".to_owned(),
            log: lifecycle_log.clone(),
        }),
        Box::new(LoggingPlugin {
            name: "container".to_owned(),
            log: lifecycle_log.clone(),
        }),
    ];
    config.global_setup.0 = Some(Box::new(LoggingSetup {
        log: lifecycle_log.clone(),
    }));
    config.global_teardown.0 = Some(Box::new(LoggingTeardown {
        label: "global-teardown".to_owned(),
        log: lifecycle_log.clone(),
    }));

    let (mut runner, _log) = harness.runner(config, MockDispatcherFactory::new());
    let result = runner.run_tests(RunOptions::default()).await.unwrap();
    assert_eq!(result.status, FullStatus::Passed);
    assert_eq!(
        events_of(&lifecycle_log),
        [
            "web-server-up",
            "container-up",
            "global-setup",
            "setup-teardown",
            "global-teardown",
            "container-down",
            "web-server-down",
        ]
    );
}

#[tokio::test]
async fn global_timeout_aborts_the_wait_but_teardown_completes() {
    let mut harness = Harness::new();
    harness.add_file("app/a.test.ts", &["one"]);
    let mut config = Config::new(vec![harness.project("app", "app", 0)]);
    config.global_timeout = Some(Duration::from_millis(100));

    let lifecycle_log: EventLog = Arc::default();
    config.plugins.0 = vec![Box::new(BlockingPlugin)];
    config.global_teardown.0 = Some(Box::new(LoggingTeardown {
        label: "global-teardown".to_owned(),
        log: lifecycle_log.clone(),
    }));

    let factory = MockDispatcherFactory::new();
    let batches = factory.batches();
    let (mut runner, log) = harness.runner(config, factory);

    let result = runner.run_tests(RunOptions::default()).await.unwrap();
    assert_eq!(result.status, FullStatus::TimedOut);
    assert!(batches.lock().unwrap().is_empty(), "dispatch never started");
    assert_eq!(result.stats.finished_count, 0);
    assert!(!result.stats.is_success(), "the expected test never ran");
    assert_eq!(
        events_of(&lifecycle_log),
        ["global-teardown"],
        "teardown still ran; the half-set-up plugin did not"
    );
    let events = events_of(&log);
    assert!(events
        .iter()
        .any(|e| e.starts_with("error:Timed out waiting 0.1s")));
    assert!(events.contains(&"end:TimedOut".to_owned()));
}

struct FailingSetup;

impl GlobalSetup for FailingSetup {
    fn run<'a>(
        &'a mut self,
        _config: &'a Config,
    ) -> BoxFuture<'a, Result<Option<Box<dyn GlobalTeardown>>, TestError>> {
        Box::pin(std::future::ready(Err(TestError::new(
            "global setup exploded",
        ))))
    }
}

#[tokio::test]
async fn setup_failure_skips_dispatch_but_still_tears_down() {
    let mut harness = Harness::new();
    harness.add_file("app/a.test.ts", &["one"]);
    let mut config = Config::new(vec![harness.project("app", "app", 0)]);

    let lifecycle_log: EventLog = Arc::default();
    config.plugins.0 = vec![Box::new(LoggingPlugin {
        name: "web-server".to_owned(),
        log: lifecycle_log.clone(),
    })];
    config.global_setup.0 = Some(Box::new(FailingSetup));

    let factory = MockDispatcherFactory::new();
    let batches = factory.batches();
    let (mut runner, log) = harness.runner(config, factory);

    let result = runner.run_tests(RunOptions::default()).await.unwrap();
    assert_eq!(result.status, FullStatus::Failed);
    assert!(batches.lock().unwrap().is_empty());
    assert!(events_of(&log).contains(&"error:global setup exploded".to_owned()));
    assert_eq!(
        events_of(&lifecycle_log),
        ["web-server-up", "web-server-down"],
        "the set-up plugin is torn down"
    );
}

#[tokio::test]
async fn list_test_files_reports_per_project() {
    let mut harness = Harness::new();
    harness.add_file("app/a.test.ts", &["one"]);
    harness.add_file("app/b.spec.ts", &["two"]);
    let config = Config::new(vec![harness.project("app", "app", 0)]);
    let (runner, _log) = harness.runner(config, MockDispatcherFactory::new());

    let report = runner.list_test_files(None).unwrap();
    assert_eq!(report.projects.len(), 1);
    let entry = &report.projects[0];
    assert_eq!(entry.name, "app");
    assert_eq!(entry.test_dir, harness.root.join("app"));
    let names: Vec<_> = entry
        .files
        .iter()
        .map(|f| f.file_name().unwrap().to_owned())
        .collect();
    assert_eq!(names, ["a.test.ts", "b.spec.ts"]);

    let json = serde_json::to_value(report).unwrap();
    assert!(json["projects"][0]["testDir"].is_string());
}
