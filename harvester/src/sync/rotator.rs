use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    settle_tick, sleep_or_cancel, ErrorTracker, TaskError, TickError, MAX_CONSECUTIVE_SAME_ERROR,
};
use crate::hub::Hub;

const TASK: &str = "token_rotator";

/// Periodically exchanges the hub bearer token for a fresh one.
pub struct TokenRotator {
    hub: Arc<dyn Hub>,
    interval: Duration,
}

impl std::fmt::Debug for TokenRotator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenRotator")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl TokenRotator {
    /// Creates a rotator that refreshes the token every `interval`.
    pub fn new(hub: Arc<dyn Hub>, interval: Duration) -> Self {
        Self { hub, interval }
    }

    /// Rotates the token once per interval, starting one interval after the
    /// call.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Cancelled`] on cancellation and
    /// [`TaskError::Fatal`] when the hub refuses the current token.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), TaskError> {
        debug!(interval = ?self.interval, "Starting token rotator");
        let mut error_tracker = ErrorTracker::new(MAX_CONSECUTIVE_SAME_ERROR);

        loop {
            if sleep_or_cancel(&cancel, self.interval).await {
                debug!("Cancellation signal received; stopping token rotator");
                return Err(TaskError::Cancelled);
            }

            let outcome = tokio::select! {
                () = cancel.cancelled() => return Err(TaskError::Cancelled),
                outcome = self.hub.rotate_token() => outcome.map_err(TickError::Hub),
            };
            if outcome.is_ok() {
                debug!("Rotated hub token");
            }
            settle_tick(TASK, outcome, &mut error_tracker)?;
        }
    }
}
