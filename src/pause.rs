//! Cooperative pause gate for the run loop.
//!
//! Pausing is not preemptive: an in-flight agent call always finishes, and
//! the orchestrator honors the pause at the next milestone or QA boundary
//! by awaiting [`PauseController::wait_if_paused`]. The gate is a
//! `tokio::sync::watch` channel, so any number of concurrent waiters (the
//! run loop, a UI control path) are all released by a single `resume()`.

use tokio::sync::watch;

pub struct PauseController {
    paused: watch::Sender<bool>,
}

impl PauseController {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self { paused }
    }

    /// Transition to paused. Idempotent.
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    /// Transition to running, releasing every task suspended in
    /// [`Self::wait_if_paused`]. Idempotent.
    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    /// Force the running state unconditionally. Used to recycle the
    /// controller across independent runs when no waiters exist.
    pub fn reset(&self) {
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Suspend until the controller is running. Returns immediately when
    /// not paused.
    pub async fn wait_if_paused(&self) {
        let mut rx = self.paused.subscribe();
        // The sender lives in self, so the channel cannot close while we wait.
        let _ = rx.wait_for(|paused| !paused).await;
    }
}

impl Default for PauseController {
    fn default() -> Self {
        Self::new()
    }
}
