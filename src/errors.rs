// Copyright (c) The stagerunner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by stagerunner.

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::{error, fmt, io};
use thiserror::Error;

/// A serializable error record carried through the reporter channel.
///
/// Collection failures, setup failures, and worker errors all surface as
/// `TestError` values via [`Reporter::on_error`](crate::reporter::Reporter::on_error).
/// Synthetic errors such as the global-timeout notice are stackless and
/// marked non-fatal so reporters can filter them.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TestError {
    /// Human-readable message.
    pub message: String,

    /// Stack trace, if one was captured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,

    /// Whether this error is fatal to the run. Reporter-filtering marker
    /// only; the runner's status handling does not consult it.
    pub fatal: bool,
}

impl TestError {
    /// Creates a fatal error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
            fatal: true,
        }
    }

    /// Creates a synthetic, stackless, non-fatal error.
    pub fn stackless(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
            fatal: false,
        }
    }

    /// Attaches a stack trace.
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Converts a standard error into a `TestError`, flattening its source
    /// chain into the message.
    pub fn from_error(err: &dyn error::Error) -> Self {
        let mut message = err.to_string();
        let mut source = err.source();
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        Self::new(message)
    }
}

impl fmt::Display for TestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// An error which indicates that projects were requested but not known to
/// the configuration.
#[derive(Clone, Debug)]
pub struct ProjectNotFound {
    missing: Vec<String>,
    all_projects: Vec<String>,
}

impl ProjectNotFound {
    pub(crate) fn new(
        missing: impl IntoIterator<Item = impl Into<String>>,
        all_projects: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let missing: Vec<_> = missing.into_iter().map(|s| s.into()).collect();
        let mut all_projects: Vec<_> = all_projects.into_iter().map(|s| s.into()).collect();
        all_projects.sort_unstable();
        Self {
            missing,
            all_projects,
        }
    }
}

impl fmt::Display for ProjectNotFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "project(s) '{}' not found (known projects: {})",
            self.missing.join("', '"),
            self.all_projects.join(", ")
        )
    }
}

impl error::Error for ProjectNotFound {}

/// An error returned when a named reporter cannot be constructed.
#[derive(Clone, Debug)]
pub struct ReporterBuildError {
    name: String,
    registered: Vec<String>,
}

impl ReporterBuildError {
    pub(crate) fn new(
        name: impl Into<String>,
        registered: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let mut registered: Vec<_> = registered.into_iter().map(|s| s.into()).collect();
        registered.sort_unstable();
        Self {
            name: name.into(),
            registered,
        }
    }
}

impl fmt::Display for ReporterBuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown reporter '{}' (registered reporters: {})",
            self.name,
            self.registered.join(", ")
        )
    }
}

impl error::Error for ReporterBuildError {}

/// An error raised while resolving the configuration file location.
#[derive(Debug, Error)]
pub enum ConfigResolveError {
    /// The given path does not exist.
    #[error("config location `{0}` does not exist")]
    NotFound(Utf8PathBuf),

    /// The given path could not be inspected.
    #[error("failed to inspect config location `{path}`")]
    Io {
        /// The path that failed.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },
}

/// A configuration-level error: raised before any reporting happens.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Unknown projects were named in the project filter.
    #[error(transparent)]
    ProjectNotFound(#[from] ProjectNotFound),

    /// A configured reporter could not be built.
    #[error(transparent)]
    ReporterBuild(#[from] ReporterBuildError),

    /// Test file collection failed while producing a listing.
    #[error("{0}")]
    FileCollection(TestError),
}

/// An error returned while parsing a [`ShardConfig`](crate::shard::ShardConfig)
/// value from a string.
#[derive(Clone, Debug)]
pub struct ShardParseError {
    expected_format: Option<&'static str>,
    message: String,
}

impl ShardParseError {
    pub(crate) fn new(expected_format: Option<&'static str>, message: impl Into<String>) -> Self {
        Self {
            expected_format,
            message: message.into(),
        }
    }
}

impl fmt::Display for ShardParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(format) = self.expected_format {
            write!(f, "(expected format: {format}) ")?;
        }
        write!(f, "{}", self.message)
    }
}

impl error::Error for ShardParseError {}
