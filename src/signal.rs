// Copyright (c) The stagerunner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Support for handling the interrupt signal.
//!
//! A [`SignalWatcher`] is a scoped resource: it installs a handler on
//! construction, resolves [`wait`](SignalWatcher::wait) on the first
//! interrupt, and detaches on [`disarm`](SignalWatcher::disarm) or drop.
//! Long operations race against `wait` so interrupts surface as an orderly
//! `interrupted` status instead of abrupt termination.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::watch;
use tracing::warn;

/// The kind of signal handling to set up for a run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SignalHandlerKind {
    /// Observe the process interrupt signal.
    #[default]
    Standard,

    /// A no-op watcher that never fires. Useful for tests.
    Noop,
}

#[derive(Debug)]
pub(crate) struct SignalWatcher {
    had_signal: Arc<AtomicBool>,
    rx: watch::Receiver<bool>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl SignalWatcher {
    /// Installs the handler. Must be called from within a tokio runtime.
    pub(crate) fn install(kind: SignalHandlerKind) -> Self {
        let (tx, rx) = watch::channel(false);
        let had_signal = Arc::new(AtomicBool::new(false));
        let task = match kind {
            SignalHandlerKind::Standard => {
                let flag = had_signal.clone();
                Some(tokio::spawn(async move {
                    match tokio::signal::ctrl_c().await {
                        Ok(()) => {
                            flag.store(true, Ordering::SeqCst);
                            let _ = tx.send(true);
                        }
                        Err(error) => {
                            warn!(%error, "failed to install interrupt handler");
                            // tx drops here; wait() pends forever.
                        }
                    }
                }))
            }
            SignalHandlerKind::Noop => None,
        };
        Self {
            had_signal,
            rx,
            task,
        }
    }

    /// Resolves when the interrupt arrives; pends forever on a noop or
    /// disarmed watcher.
    pub(crate) async fn wait(&mut self) {
        if self.rx.wait_for(|fired| *fired).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Whether the interrupt was observed.
    pub(crate) fn had_signal(&self) -> bool {
        self.had_signal.load(Ordering::SeqCst)
    }

    /// Detaches the handler.
    pub(crate) fn disarm(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for SignalWatcher {
    fn drop(&mut self) {
        self.disarm();
    }
}
