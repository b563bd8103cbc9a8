//! Long-running loops of the federation engine.
//!
//! Each loop runs one tick at a time, then sleeps for its interval or until
//! cancelled. Transport failures abort the current tick and are retried on the
//! next one; an [`HubError::Auth`] failure ends the loop because only a new
//! enrollment can recover from it.

mod federated;
mod local;
mod rotator;

use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use federated::FederatedSynchronizer;
pub use local::LocalSynchronizer;
pub use rotator::TokenRotator;

use crate::bundle::document::DocumentError;
use crate::hub::HubError;
use crate::integrity::SigningError;
use crate::spire::UpstreamError;

/// Maximum number of consecutive identical errors logged at WARN before
/// further occurrences are downgraded to DEBUG.
pub(crate) const MAX_CONSECUTIVE_SAME_ERROR: u32 = 3;

/// Why a loop stopped.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TaskError {
    /// The loop observed cancellation.
    #[error("task cancelled")]
    Cancelled,

    /// The loop hit an error it cannot recover from.
    #[error("{task} stopped: {source}")]
    Fatal {
        /// Name of the loop.
        task: &'static str,
        /// The error that stopped it.
        #[source]
        source: HubError,
    },
}

/// Failure of a single tick.
#[derive(Debug, Error)]
pub(crate) enum TickError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error(transparent)]
    Hub(#[from] HubError),
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Signing(#[from] SigningError),
}

impl TickError {
    fn key(&self) -> ErrorKey {
        match self {
            TickError::Upstream(_) => ErrorKey::Upstream,
            TickError::Hub(_) => ErrorKey::Hub,
            TickError::Document(_) => ErrorKey::Document,
            TickError::Signing(_) => ErrorKey::Signing,
        }
    }

    /// Converts errors that must end the loop.
    fn into_fatal(self, task: &'static str) -> Result<Self, TaskError> {
        match self {
            TickError::Hub(source @ HubError::Auth(_)) => Err(TaskError::Fatal { task, source }),
            other => Ok(other),
        }
    }
}

/// Allocation-free key type for error tracking categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ErrorKey {
    /// Identity server calls.
    Upstream,
    /// Hub calls.
    Hub,
    /// Bundle document conversion.
    Document,
    /// Bundle signing.
    Signing,
}

/// Helper for tracking repeated errors to suppress log noise.
///
/// For the first N consecutive occurrences of an error kind, logs are
/// emitted at WARN level. After that, logs are downgraded to DEBUG level.
/// When a different error kind occurs or errors stop, the counter resets.
#[derive(Debug)]
pub(crate) struct ErrorTracker {
    last_error_kind: Option<ErrorKey>,
    consecutive_same_error: u32,
    max_consecutive: u32,
}

impl ErrorTracker {
    pub(crate) fn new(max_consecutive: u32) -> Self {
        Self {
            last_error_kind: None,
            consecutive_same_error: 0,
            max_consecutive,
        }
    }

    pub(crate) fn record_error(&mut self, error_kind: ErrorKey) -> bool {
        let should_warn = self.last_error_kind != Some(error_kind)
            || self.consecutive_same_error < self.max_consecutive;

        if self.last_error_kind == Some(error_kind) {
            self.consecutive_same_error += 1;
        } else {
            self.consecutive_same_error = 1;
            self.last_error_kind = Some(error_kind);
        }

        should_warn
    }

    pub(crate) fn reset(&mut self) {
        self.consecutive_same_error = 0;
        self.last_error_kind = None;
    }

    pub(crate) fn consecutive_count(&self) -> u32 {
        self.consecutive_same_error
    }
}

/// Handles the outcome of one tick: logs and swallows retryable errors,
/// surfaces fatal ones.
pub(crate) fn settle_tick(
    task: &'static str,
    outcome: Result<(), TickError>,
    error_tracker: &mut ErrorTracker,
) -> Result<(), TaskError> {
    match outcome {
        Ok(()) => {
            if error_tracker.consecutive_count() > 0 {
                debug!(
                    task,
                    failures = error_tracker.consecutive_count(),
                    "Recovered after consecutive failures"
                );
            }
            error_tracker.reset();
            Ok(())
        }
        Err(e) => {
            let e = e.into_fatal(task)?;
            if error_tracker.record_error(e.key()) {
                warn!(task, error = %e, "Tick failed; will retry");
            } else {
                debug!(
                    task,
                    error = %e,
                    consecutive = error_tracker.consecutive_count(),
                    "Tick failed; will retry (repeated)"
                );
            }
            Ok(())
        }
    }
}

/// Sleeps for `dur`, returning `true` if cancelled first.
pub(crate) async fn sleep_or_cancel(token: &CancellationToken, dur: Duration) -> bool {
    tokio::select! {
        () = token.cancelled() => true,
        () = sleep(dur) => false,
    }
}

#[cfg(test)]
pub(crate) mod fakes;
