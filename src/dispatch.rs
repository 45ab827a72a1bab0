// Copyright (c) The stagerunner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The worker dispatcher seam.
//!
//! The orchestrator hands each stage's groups to a [`Dispatcher`] built by
//! the embedding framework's [`DispatcherFactory`]. The dispatcher runs the
//! groups in worker processes, appends attempt results to the tests it was
//! given, and emits test events through the reporter. It is the single
//! producer of events for the tests it runs.

use crate::{config::Config, grouping::TestGroup, reporter::Reporter, suite::SuiteTree};
use futures::future::BoxFuture;

/// Mutable run state lent to the dispatcher for the duration of a stage.
pub struct DispatchContext<'a> {
    /// The run configuration.
    pub config: &'a Config,
    /// The suite tree; the dispatcher records attempt results here.
    pub tree: &'a mut SuiteTree,
    /// The multiplexed reporter.
    pub reporter: &'a mut dyn Reporter,
}

/// Runs test groups in worker processes.
pub trait Dispatcher: Send {
    /// Runs all groups to completion. Raced against the signal watcher; when
    /// the race is lost this future is dropped and [`stop`](Self::stop) is
    /// called to drain.
    fn run<'a>(&'a mut self, cx: DispatchContext<'a>) -> BoxFuture<'a, ()>;

    /// Stops workers and drains in-flight work.
    fn stop(&mut self) -> BoxFuture<'_, ()>;

    /// Whether any worker process failed outside of normal test failures.
    fn has_worker_errors(&self) -> bool;
}

/// Builds a [`Dispatcher`] per stage.
pub trait DispatcherFactory: Send {
    /// Creates a dispatcher for one stage's groups.
    fn create_dispatcher(&mut self, groups: Vec<TestGroup>) -> Box<dyn Dispatcher>;
}
