// Copyright (c) The stagerunner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Orchestration for staged, sharded end-to-end test runs.
//!
//! Given a declarative [`Config`](config::Config) of projects, the
//! [`Runner`](runner::Runner) discovers test files, compiles them into a
//! hierarchical suite tree, partitions tests into groups that can share a
//! worker process, applies the sharding policy, and dispatches groups to
//! workers in strict stage order while honoring interrupt, timeout, and
//! cascading-failure semantics.
//!
//! Test execution itself lives behind the [`Dispatcher`](dispatch::Dispatcher)
//! seam; test file compilation lives behind
//! [`TestFileLoader`](loader::TestFileLoader). This crate never runs user test
//! code in its own thread of control.

pub mod config;
pub mod dispatch;
pub mod errors;
pub mod grouping;
pub mod loader;
pub mod plugin;
pub mod reporter;
pub mod runner;
pub mod shard;
pub mod signal;
pub mod suite;
mod walker;

pub use runner::Runner;
