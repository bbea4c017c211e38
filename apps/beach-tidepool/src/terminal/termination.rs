use super::session::Session;
use super::timer::OneShot;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_KILL_GRACE: Duration = Duration::from_millis(1000);

/// Graceful-then-forced shutdown of a session's process.
#[derive(Clone, Copy, Debug)]
pub struct TerminationSequencer {
    grace: Duration,
}

impl Default for TerminationSequencer {
    fn default() -> Self {
        Self::new(DEFAULT_KILL_GRACE)
    }
}

impl TerminationSequencer {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Signals the process to exit now and arms `on_deadline` to run after
    /// the grace period. The follow-up lives inside the session, so a normal
    /// exit (which closes the session) cancels it.
    pub fn begin<F>(&self, session: &Arc<Session>, on_deadline: F)
    where
        F: FnOnce() + Send + 'static,
    {
        session.cancel_timers();
        if let Err(err) = session.terminate() {
            warn!(
                target = "tidepool::termination",
                session_id = %session.id(),
                error = %err,
                "graceful termination signal failed"
            );
        }
        let timer = OneShot::start(self.grace, move |_| on_deadline());
        if session.arm_termination(timer) {
            debug!(
                target = "tidepool::termination",
                session_id = %session.id(),
                grace_ms = self.grace.as_millis() as u64,
                "forced kill scheduled"
            );
        }
    }
}
