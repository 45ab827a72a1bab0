// Copyright (c) The stagerunner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Plugins and the user global setup/teardown hooks.
//!
//! Plugins (web servers, container runtimes) arrive pre-built inside the
//! [`Config`]; the runner sets them up in order before dispatch and tears
//! down, in reverse, whichever completed setup. Every teardown step runs
//! through [`run_and_report_error`], which converts failures into reporter
//! errors without short-circuiting the remaining steps.

use crate::{config::Config, errors::TestError, reporter::Reporter};
use futures::future::BoxFuture;
use std::future::Future;

/// A setup/teardown pair wrapped around the whole run.
pub trait Plugin: Send {
    /// Name used in diagnostics.
    fn name(&self) -> &str {
        "plugin"
    }

    /// Called before dispatch, in registration order. Raced against the
    /// signal watcher: when interrupted the future is dropped.
    fn setup<'a>(
        &'a mut self,
        _config: &'a Config,
        _reporter: &'a mut dyn Reporter,
    ) -> BoxFuture<'a, Result<(), TestError>> {
        Box::pin(std::future::ready(Ok(())))
    }

    /// Called on every exit path, in reverse setup order.
    fn teardown(&mut self) -> BoxFuture<'_, Result<(), TestError>> {
        Box::pin(std::future::ready(Ok(())))
    }
}

/// The user `global_setup` hook. May return a teardown handle, which runs
/// before `global_teardown` during shutdown.
pub trait GlobalSetup: Send {
    fn run<'a>(
        &'a mut self,
        config: &'a Config,
    ) -> BoxFuture<'a, Result<Option<Box<dyn GlobalTeardown>>, TestError>>;
}

/// A teardown step: either the user `global_teardown` hook or the handle
/// returned from `global_setup`.
pub trait GlobalTeardown: Send {
    fn run<'a>(&'a mut self, config: &'a Config) -> BoxFuture<'a, Result<(), TestError>>;
}

/// Awaits `step`; on failure reports the error and sets `failed` instead of
/// propagating, so later teardown steps still run.
pub(crate) async fn run_and_report_error<F>(
    step: F,
    reporter: &mut dyn Reporter,
    failed: &mut bool,
) where
    F: Future<Output = Result<(), TestError>>,
{
    if let Err(error) = step.await {
        *failed = true;
        reporter.on_error(&error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::test_support::RecordingReporter;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn run_and_report_error_reports_without_propagating() {
        let mut reporter = RecordingReporter::default();
        let mut failed = false;

        run_and_report_error(async { Ok(()) }, &mut reporter, &mut failed).await;
        assert!(!failed);

        run_and_report_error(
            async { Err(TestError::new("teardown broke")) },
            &mut reporter,
            &mut failed,
        )
        .await;
        assert!(failed);
        assert_eq!(reporter.events(), ["error:teardown broke"]);
    }
}
