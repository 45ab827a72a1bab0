// Copyright (c) The stagerunner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The suite tree model.
//!
//! Suites and tests live in a [`SuiteTree`] arena. Children are owned
//! (ordered [`Entry`] lists), parents are non-owning id back-references, so
//! cloning a file subtree per project and repeat index is a straight node
//! copy with refreshed parent pointers.

use crate::{config::Project, errors::TestError};
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc, time::Duration};

/// A source location.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Absolute path of the source file.
    pub file: Utf8PathBuf,
    /// 1-based line.
    pub line: u32,
    /// 1-based column.
    pub column: u32,
}

impl Location {
    /// Creates a new location.
    pub fn new(file: impl Into<Utf8PathBuf>, line: u32, column: u32) -> Self {
        Self {
            file: file.into(),
            line,
            column,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// The kind of a suite node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SuiteKind {
    /// The root of the whole run.
    Root,
    /// A per-project suite directly under the root.
    Project,
    /// A per-file suite.
    File,
    /// A `describe` block.
    Describe,
}

/// How tests inside a suite may be distributed across workers.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ParallelMode {
    /// Inherit from the enclosing suite.
    #[default]
    Default,
    /// Tests may run in parallel workers.
    Parallel,
    /// Tests run in declaration order in a single worker.
    Serial,
}

/// The kind of a registered hook.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HookKind {
    BeforeAll,
    AfterAll,
    BeforeEach,
    AfterEach,
}

impl HookKind {
    /// Returns true for hooks scoped to the whole suite rather than to each
    /// test.
    pub fn is_all_scoped(self) -> bool {
        matches!(self, HookKind::BeforeAll | HookKind::AfterAll)
    }
}

/// Identifier of a suite node within a [`SuiteTree`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SuiteId(pub(crate) u32);

/// Identifier of a test case within a [`SuiteTree`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TestId(pub(crate) u32);

/// An ordered child of a suite: declaration order is preserved through every
/// filter operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Entry {
    Suite(SuiteId),
    Test(TestId),
}

/// A suite node.
#[derive(Clone, Debug)]
pub struct Suite {
    /// Node kind.
    pub kind: SuiteKind,
    /// Title: project name for project suites, relative file path for file
    /// suites, describe title otherwise.
    pub title: String,
    /// Declaration location, if any.
    pub location: Option<Location>,
    /// Parallelism of direct children.
    pub parallel_mode: ParallelMode,
    /// Hooks registered directly on this suite.
    pub hooks: Vec<HookKind>,
    /// Focus marker.
    pub only: bool,
    /// The project attached to a project suite.
    pub project: Option<Arc<Project>>,
    /// The source file attached to a file suite.
    pub file_path: Option<Utf8PathBuf>,
    pub(crate) parent: Option<SuiteId>,
    pub(crate) entries: Vec<Entry>,
}

impl Suite {
    /// Creates a bare suite of the given kind.
    pub fn new(kind: SuiteKind, title: impl Into<String>) -> Self {
        Self {
            kind,
            title: title.into(),
            location: None,
            parallel_mode: ParallelMode::Default,
            hooks: Vec::new(),
            only: false,
            project: None,
            file_path: None,
            parent: None,
            entries: Vec::new(),
        }
    }

    /// The ordered children of this suite.
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// The parent suite, if any.
    pub fn parent(&self) -> Option<SuiteId> {
        self.parent
    }
}

/// The terminal status of one test attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TestStatus {
    Passed,
    Failed,
    TimedOut,
    Skipped,
    Interrupted,
}

/// The result of one attempt at running a test.
#[derive(Clone, Debug, Serialize)]
pub struct TestResult {
    /// Attempt outcome.
    pub status: TestStatus,
    /// The error, for failing attempts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TestError>,
    /// Wall-clock duration of the attempt.
    #[serde(skip)]
    pub duration: Duration,
}

impl TestResult {
    /// A passing attempt.
    pub fn passed() -> Self {
        Self {
            status: TestStatus::Passed,
            error: None,
            duration: Duration::ZERO,
        }
    }

    /// A failing attempt.
    pub fn failed(error: TestError) -> Self {
        Self {
            status: TestStatus::Failed,
            error: Some(error),
            duration: Duration::ZERO,
        }
    }

    /// A skipped attempt.
    pub fn skipped() -> Self {
        Self {
            status: TestStatus::Skipped,
            error: None,
            duration: Duration::ZERO,
        }
    }
}

/// A test case leaf.
#[derive(Clone, Debug)]
pub struct TestCase {
    /// Title as declared.
    pub title: String,
    /// Declaration location.
    pub location: Location,
    /// Focus marker.
    pub only: bool,
    /// Stable identifier for the set of worker-scoped fixtures: two tests may
    /// share a worker process iff their hashes match.
    pub worker_hash: String,
    /// The source file declaring this test.
    pub require_file: Utf8PathBuf,
    /// Index within the project's `repeat_each` expansion.
    pub repeat_each_index: usize,
    /// Identifier of the owning project.
    pub project_id: String,
    /// Attempt results, appended as the run progresses.
    pub results: Vec<TestResult>,
    pub(crate) parent: SuiteId,
}

impl TestCase {
    /// The parent suite.
    pub fn parent(&self) -> SuiteId {
        self.parent
    }

    /// Returns true unless the last attempt failed, timed out, or was
    /// interrupted. A test with no attempts is considered ok.
    pub fn ok(&self) -> bool {
        match self.results.last() {
            None => true,
            Some(result) => {
                matches!(result.status, TestStatus::Passed | TestStatus::Skipped)
            }
        }
    }
}

/// Arena of suites and tests for one run.
#[derive(Clone, Debug)]
pub struct SuiteTree {
    suites: Vec<Suite>,
    tests: Vec<TestCase>,
    root: SuiteId,
}

impl Default for SuiteTree {
    fn default() -> Self {
        Self::new()
    }
}

impl SuiteTree {
    /// Creates a tree containing only an empty root suite.
    pub fn new() -> Self {
        let root_suite = Suite::new(SuiteKind::Root, "");
        Self {
            suites: vec![root_suite],
            tests: Vec::new(),
            root: SuiteId(0),
        }
    }

    /// The root suite of the run.
    pub fn root(&self) -> SuiteId {
        self.root
    }

    /// Borrows a suite node.
    pub fn suite(&self, id: SuiteId) -> &Suite {
        &self.suites[id.0 as usize]
    }

    /// Mutably borrows a suite node.
    pub fn suite_mut(&mut self, id: SuiteId) -> &mut Suite {
        &mut self.suites[id.0 as usize]
    }

    /// Borrows a test case.
    pub fn test(&self, id: TestId) -> &TestCase {
        &self.tests[id.0 as usize]
    }

    /// Mutably borrows a test case.
    pub fn test_mut(&mut self, id: TestId) -> &mut TestCase {
        &mut self.tests[id.0 as usize]
    }

    /// Adds a suite under `parent`, appending it to the parent's entries.
    pub fn add_suite(&mut self, parent: SuiteId, mut suite: Suite) -> SuiteId {
        suite.parent = Some(parent);
        let id = SuiteId(self.suites.len() as u32);
        self.suites.push(suite);
        self.suite_mut(parent).entries.push(Entry::Suite(id));
        id
    }

    /// Adds a suite with no parent. Used for per-stage preprocess roots.
    pub(crate) fn add_detached_suite(&mut self, mut suite: Suite) -> SuiteId {
        suite.parent = None;
        let id = SuiteId(self.suites.len() as u32);
        self.suites.push(suite);
        id
    }

    /// Adds a test under `parent`, appending it to the parent's entries.
    pub fn add_test(&mut self, parent: SuiteId, mut test: TestCase) -> TestId {
        test.parent = parent;
        let id = TestId(self.tests.len() as u32);
        self.tests.push(test);
        self.suite_mut(parent).entries.push(Entry::Test(id));
        id
    }

    /// Iterates over a suite's ancestor chain, starting with the suite
    /// itself.
    pub fn ancestors(&self, suite: SuiteId) -> impl Iterator<Item = SuiteId> + '_ {
        let mut current = Some(suite);
        std::iter::from_fn(move || {
            let id = current?;
            current = self.suite(id).parent;
            Some(id)
        })
    }

    /// All test ids under `suite`, in declaration (preorder) order.
    pub fn all_tests(&self, suite: SuiteId) -> Vec<TestId> {
        let mut out = Vec::new();
        self.collect_tests(suite, &mut out);
        out
    }

    fn collect_tests(&self, suite: SuiteId, out: &mut Vec<TestId>) {
        for entry in &self.suite(suite).entries {
            match *entry {
                Entry::Suite(child) => self.collect_tests(child, out),
                Entry::Test(test) => out.push(test),
            }
        }
    }

    /// The number of tests under `suite`.
    pub fn test_count(&self, suite: SuiteId) -> usize {
        self.all_tests(suite).len()
    }

    /// Titles from the outermost named ancestor down to the test itself,
    /// skipping untitled suites. Joined with spaces this is the "full title"
    /// that grep and title matchers run against.
    pub fn title_path(&self, test: TestId) -> Vec<String> {
        let test_case = self.test(test);
        let mut titles: Vec<String> = self
            .ancestors(test_case.parent)
            .filter_map(|id| {
                let suite = self.suite(id);
                (!suite.title.is_empty()).then(|| suite.title.clone())
            })
            .collect();
        titles.reverse();
        titles.push(test_case.title.clone());
        titles
    }

    /// Titles strictly below the enclosing file suite (describe chain plus
    /// the test title). This is the path that must be unique within a file.
    pub(crate) fn path_in_file(&self, test: TestId) -> Vec<String> {
        let test_case = self.test(test);
        let mut titles: Vec<String> = self
            .ancestors(test_case.parent)
            .take_while(|&id| self.suite(id).kind == SuiteKind::Describe)
            .map(|id| self.suite(id).title.clone())
            .collect();
        titles.reverse();
        titles.push(test_case.title.clone());
        titles
    }

    /// Deep-copies the subtree rooted at `src`. The copy is appended to
    /// `new_parent`'s entries when given, detached otherwise. Test results
    /// are not carried over.
    pub(crate) fn clone_subtree(&mut self, src: SuiteId, new_parent: Option<SuiteId>) -> SuiteId {
        let mut suite = self.suite(src).clone();
        suite.entries = Vec::new();
        let copy = match new_parent {
            Some(parent) => self.add_suite(parent, suite),
            None => self.add_detached_suite(suite),
        };
        let entries = self.suite(src).entries.clone();
        for entry in entries {
            match entry {
                Entry::Suite(child) => {
                    self.clone_subtree(child, Some(copy));
                }
                Entry::Test(test) => {
                    let mut test_case = self.test(test).clone();
                    test_case.results = Vec::new();
                    self.add_test(copy, test_case);
                }
            }
        }
        copy
    }

    /// Retains tests matching `test_pred` and suites matching `suite_pred`
    /// (kept wholesale, without recursing). Emptied suites are kept; entry
    /// order is preserved.
    pub(crate) fn filter_suite(
        &mut self,
        suite: SuiteId,
        suite_pred: &mut dyn FnMut(SuiteId, &Suite) -> bool,
        test_pred: &mut dyn FnMut(TestId, &TestCase) -> bool,
    ) {
        let entries = self.suite(suite).entries.clone();
        let mut kept = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry {
                Entry::Suite(child) => {
                    if !suite_pred(child, self.suite(child)) {
                        self.filter_suite(child, suite_pred, test_pred);
                    }
                    kept.push(entry);
                }
                Entry::Test(test) => {
                    if test_pred(test, self.test(test)) {
                        kept.push(entry);
                    }
                }
            }
        }
        self.suite_mut(suite).entries = kept;
    }

    /// Retains tests matching `test_pred`, removing suites left empty.
    /// Returns true if the suite still has entries. Entry order is
    /// preserved.
    pub(crate) fn filter_tests(
        &mut self,
        suite: SuiteId,
        test_pred: &mut dyn FnMut(TestId, &TestCase) -> bool,
    ) -> bool {
        let entries = self.suite(suite).entries.clone();
        let mut kept = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry {
                Entry::Suite(child) => {
                    if self.filter_tests(child, test_pred) {
                        kept.push(entry);
                    }
                }
                Entry::Test(test) => {
                    if test_pred(test, self.test(test)) {
                        kept.push(entry);
                    }
                }
            }
        }
        let keep_self = !kept.is_empty();
        self.suite_mut(suite).entries = kept;
        keep_self
    }

    /// Applies focus semantics: if any `only` marker exists under `suite`,
    /// prunes every sibling of a focused item while retaining the focused
    /// items' ancestor chains. A suite that is itself focused is kept
    /// wholesale. No-op when nothing is focused.
    pub(crate) fn filter_only(&mut self, suite: SuiteId) {
        if self.only_items(suite).is_empty() {
            return;
        }
        self.filter_only_inner(suite);
    }

    fn filter_only_inner(&mut self, suite: SuiteId) -> bool {
        let entries = self.suite(suite).entries.clone();
        let mut kept = Vec::new();
        for entry in entries {
            match entry {
                Entry::Suite(child) => {
                    // Recurse first: a focused descendant prunes the child's
                    // siblings even when the child itself is also focused.
                    let has_focused_descendant = self.filter_only_inner(child);
                    if has_focused_descendant || self.suite(child).only {
                        kept.push(entry);
                    }
                }
                Entry::Test(test) => {
                    if self.test(test).only {
                        kept.push(entry);
                    }
                }
            }
        }
        if kept.is_empty() {
            false
        } else {
            self.suite_mut(suite).entries = kept;
            true
        }
    }

    /// Collects every focused suite and test under `suite` as
    /// `(title path, location)` pairs, in declaration order.
    pub(crate) fn only_items(&self, suite: SuiteId) -> Vec<(Vec<String>, Option<Location>)> {
        let mut out = Vec::new();
        self.collect_only_items(suite, &mut out);
        out
    }

    fn collect_only_items(&self, suite: SuiteId, out: &mut Vec<(Vec<String>, Option<Location>)>) {
        for entry in &self.suite(suite).entries {
            match *entry {
                Entry::Suite(child) => {
                    let child_suite = self.suite(child);
                    if child_suite.only {
                        let mut path: Vec<String> = self
                            .ancestors(child)
                            .filter_map(|id| {
                                let s = self.suite(id);
                                (!s.title.is_empty()).then(|| s.title.clone())
                            })
                            .collect();
                        path.reverse();
                        out.push((path, child_suite.location.clone()));
                    }
                    self.collect_only_items(child, out);
                }
                Entry::Test(test) => {
                    let test_case = self.test(test);
                    if test_case.only {
                        out.push((self.title_path(test), Some(test_case.location.clone())));
                    }
                }
            }
        }
    }
}
