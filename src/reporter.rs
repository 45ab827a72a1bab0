// Copyright (c) The stagerunner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The reporter seam.
//!
//! Reporter implementations live in the embedding framework and are
//! registered by name in a [`ReporterRegistry`]; the runner fans lifecycle
//! events out to them through a [`Multiplexer`]. This module also carries
//! the minimal list-mode reporter that replaces `list`/`line`/`dot` when
//! listing.

use crate::{
    config::Config,
    errors::{ReporterBuildError, TestError},
    suite::{SuiteKind, SuiteTree, TestCase, TestResult, TestStatus},
};
use chrono::{DateTime, Local};
use indexmap::IndexMap;
use owo_colors::{OwoColorize, Style};
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, time::Duration};
use tracing::warn;

/// Built-in reporter names recognized in configuration.
pub const BUILTIN_REPORTERS: &[&str] = &[
    "list", "line", "dot", "json", "junit", "null", "github", "html",
];

/// Names replaced by the minimal list-mode reporter when listing.
const STDIO_REPORTERS: &[&str] = &["list", "line", "dot"];

/// Environment variable naming an extra reporter appended to the configured
/// list.
pub const REPORTER_ENV: &str = "STAGERUNNER_REPORTER";

/// The overall outcome of a run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FullStatus {
    Passed,
    Failed,
    TimedOut,
    Interrupted,
}

/// Statistics for a test run, tallied from attempt results.
///
/// Accumulated stage by stage; a stage's tally decides whether the failure
/// cascade latches, and the run-level tally decides the final status.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct RunStats {
    /// The number of tests expected to run when dispatch began.
    ///
    /// If the run is cut short, this will be more than `finished_count`.
    pub initial_run_count: usize,

    /// The number of tests with a recorded outcome, skips included.
    pub finished_count: usize,

    /// Tests whose final attempt passed. Includes `flaky`.
    pub passed: usize,

    /// Tests that passed only after retries.
    pub flaky: usize,

    /// Tests whose final attempt failed.
    pub failed: usize,

    /// Tests whose final attempt timed out.
    pub timed_out: usize,

    /// Tests interrupted mid-attempt.
    pub interrupted: usize,

    /// Tests that were skipped, cascade skips included.
    pub skipped: usize,
}

impl RunStats {
    /// Returns true if any recorded outcome counts as a failure.
    pub fn has_failures(&self) -> bool {
        self.failed > 0 || self.timed_out > 0 || self.interrupted > 0
    }

    /// Returns true if this run is considered a success: every expected
    /// test finished (skips count as finished) and none failed.
    pub fn is_success(&self) -> bool {
        !self.has_failures() && self.finished_count == self.initial_run_count
    }

    /// Tallies a test's outcome from its last attempt. Tests that never ran
    /// are not counted.
    pub(crate) fn record(&mut self, test: &TestCase) {
        let Some(result) = test.results.last() else {
            return;
        };
        self.finished_count += 1;
        match result.status {
            TestStatus::Passed => {
                self.passed += 1;
                if test.results.len() > 1 {
                    self.flaky += 1;
                }
            }
            TestStatus::Failed => self.failed += 1,
            TestStatus::TimedOut => self.timed_out += 1,
            TestStatus::Interrupted => self.interrupted += 1,
            TestStatus::Skipped => self.skipped += 1,
        }
    }

    /// Folds a stage tally into the run tally. `initial_run_count` is set
    /// once up front and never merged.
    pub(crate) fn merge(&mut self, other: RunStats) {
        self.finished_count += other.finished_count;
        self.passed += other.passed;
        self.flaky += other.flaky;
        self.failed += other.failed;
        self.timed_out += other.timed_out;
        self.interrupted += other.interrupted;
        self.skipped += other.skipped;
    }
}

/// The record handed to `on_end`.
#[derive(Clone, Debug, Serialize)]
pub struct FullResult {
    /// Overall outcome.
    pub status: FullStatus,
    /// Outcome tally across all stages.
    pub stats: RunStats,
    /// When the run started.
    pub start_time: DateTime<Local>,
    /// Wall-clock duration of the run.
    pub duration: Duration,
}

/// Lifecycle event consumer.
///
/// `on_begin` precedes any test event, `on_end` follows all of them, and
/// `on_exit` is last. Events for a given test are emitted by a single
/// producer and never interleave.
pub trait Reporter: Send {
    fn on_begin(&mut self, _config: &Config, _tree: &SuiteTree) {}
    fn on_test_begin(&mut self, _test: &TestCase) {}
    fn on_test_end(&mut self, _test: &TestCase, _result: &TestResult) {}
    fn on_error(&mut self, _error: &TestError) {}
    fn on_std_out(&mut self, _chunk: &str) {}
    fn on_end(&mut self, _result: &FullResult) {}
    fn on_exit(&mut self) {}
    fn prints_to_stdio(&self) -> bool {
        true
    }
}

/// Fans every event out to the configured reporters, in order.
pub struct Multiplexer {
    reporters: Vec<Box<dyn Reporter>>,
}

impl Multiplexer {
    /// Creates a multiplexer over the given reporters.
    pub fn new(reporters: Vec<Box<dyn Reporter>>) -> Self {
        Self { reporters }
    }
}

impl Reporter for Multiplexer {
    fn on_begin(&mut self, config: &Config, tree: &SuiteTree) {
        for reporter in &mut self.reporters {
            reporter.on_begin(config, tree);
        }
    }

    fn on_test_begin(&mut self, test: &TestCase) {
        for reporter in &mut self.reporters {
            reporter.on_test_begin(test);
        }
    }

    fn on_test_end(&mut self, test: &TestCase, result: &TestResult) {
        for reporter in &mut self.reporters {
            reporter.on_test_end(test, result);
        }
    }

    fn on_error(&mut self, error: &TestError) {
        for reporter in &mut self.reporters {
            reporter.on_error(error);
        }
    }

    fn on_std_out(&mut self, chunk: &str) {
        for reporter in &mut self.reporters {
            reporter.on_std_out(chunk);
        }
    }

    fn on_end(&mut self, result: &FullResult) {
        for reporter in &mut self.reporters {
            reporter.on_end(result);
        }
    }

    fn on_exit(&mut self) {
        for reporter in &mut self.reporters {
            reporter.on_exit();
        }
    }

    fn prints_to_stdio(&self) -> bool {
        self.reporters.iter().any(|r| r.prints_to_stdio())
    }
}

/// A reporter that swallows every event.
#[derive(Debug, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn prints_to_stdio(&self) -> bool {
        false
    }
}

/// Prints the test listing instead of running anything. Substituted for
/// `list`, `line`, and `dot` in list mode.
#[derive(Debug, Default)]
pub struct ListModeReporter {
    styles: Styles,
}

impl ListModeReporter {
    /// Creates an uncolored list-mode reporter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Colorizes output.
    pub fn colorize(&mut self) {
        self.styles.colorize();
    }
}

impl Reporter for ListModeReporter {
    fn on_begin(&mut self, _config: &Config, tree: &SuiteTree) {
        println!("Listing tests:");
        let mut files = HashSet::new();
        let tests = tree.all_tests(tree.root());
        for &test_id in &tests {
            let test = tree.test(test_id);
            let mut project_title = String::new();
            let mut file_title = String::new();
            for ancestor in tree.ancestors(test.parent()) {
                let suite = tree.suite(ancestor);
                match suite.kind {
                    SuiteKind::File => file_title = suite.title.clone(),
                    SuiteKind::Project => project_title = suite.title.clone(),
                    _ => {}
                }
            }
            files.insert((test.project_id.clone(), test.require_file.clone()));
            println!(
                "  [{project_title}] › {file_title}:{}:{} › {}",
                test.location.line,
                test.location.column,
                tree.path_in_file(test_id).join(" › "),
            );
        }
        let summary = format!("Total: {} tests in {} files", tests.len(), files.len());
        println!("{}", summary.style(self.styles.count));
    }

    fn prints_to_stdio(&self) -> bool {
        true
    }
}

#[derive(Clone, Debug, Default)]
struct Styles {
    count: Style,
}

impl Styles {
    fn colorize(&mut self) {
        self.count = Style::new().bold();
    }
}

/// Constructor for a named reporter.
pub type ReporterFactory = Box<dyn Fn(&Config) -> Box<dyn Reporter> + Send + Sync>;

/// Named reporter constructors.
///
/// There is no dynamic code loading here: the embedding framework registers
/// each reporter it ships, and configuration refers to them by name.
pub struct ReporterRegistry {
    factories: IndexMap<String, ReporterFactory>,
}

impl Default for ReporterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ReporterRegistry {
    /// Creates a registry with the `null` reporter pre-registered.
    pub fn new() -> Self {
        let mut registry = Self {
            factories: IndexMap::new(),
        };
        registry.register(
            "null",
            Box::new(|_| -> Box<dyn Reporter> { Box::new(NullReporter) }),
        );
        registry
    }

    /// Registers (or replaces) a reporter constructor under `name`.
    pub fn register(&mut self, name: impl Into<String>, factory: ReporterFactory) {
        self.factories.insert(name.into(), factory);
    }

    /// Builds the reporter for `name`. Unregistered built-in names fall back
    /// to the null reporter; unknown names are an error.
    pub(crate) fn create(
        &self,
        name: &str,
        config: &Config,
    ) -> Result<Box<dyn Reporter>, ReporterBuildError> {
        if let Some(factory) = self.factories.get(name) {
            return Ok(factory(config));
        }
        if BUILTIN_REPORTERS.contains(&name) {
            warn!(
                reporter = name,
                "built-in reporter is not registered, substituting the null reporter"
            );
            return Ok(Box::new(NullReporter));
        }
        Err(ReporterBuildError::new(
            name,
            self.factories.keys().map(String::as_str),
        ))
    }

    /// Builds the multiplexed reporter for a run.
    pub(crate) fn build_multiplexer(
        &self,
        config: &Config,
        list_mode: bool,
        env_extra: Option<String>,
        ci: bool,
    ) -> Result<Multiplexer, ReporterBuildError> {
        let names = resolve_reporter_names(&config.reporters, env_extra, ci);
        let mut reporters: Vec<Box<dyn Reporter>> = Vec::with_capacity(names.len());
        for name in &names {
            if list_mode && STDIO_REPORTERS.contains(&name.as_str()) {
                reporters.push(Box::new(ListModeReporter::new()));
            } else {
                reporters.push(self.create(name, config)?);
            }
        }
        Ok(Multiplexer::new(reporters))
    }
}

/// The reporter names for a run: the configured list, or a CI-dependent
/// default, plus the environment-provided extra.
pub(crate) fn resolve_reporter_names(
    configured: &[String],
    env_extra: Option<String>,
    ci: bool,
) -> Vec<String> {
    let mut names: Vec<String> = if configured.is_empty() {
        let default = if ci { "dot" } else { "list" };
        vec![default.to_owned()]
    } else {
        configured.to_vec()
    };
    if let Some(extra) = env_extra {
        if !extra.is_empty() {
            names.push(extra);
        }
    }
    names
}
