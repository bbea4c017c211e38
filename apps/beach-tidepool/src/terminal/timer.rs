use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::AbortHandle;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Identifies one arming of a timer. Never reused for the life of the process,
/// so a callback can tell whether it still owns the state it was armed for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerToken(u64);

impl TimerToken {
    fn next() -> Self {
        Self(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed))
    }
}

/// A single-shot timer. Dropping it cancels the pending callback.
#[derive(Debug)]
pub struct OneShot {
    token: TimerToken,
    handle: AbortHandle,
}

impl OneShot {
    /// Runs `fire` once after `delay` on the current tokio runtime.
    pub fn start<F>(delay: Duration, fire: F) -> Self
    where
        F: FnOnce(TimerToken) + Send + 'static,
    {
        let token = TimerToken::next();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fire(token);
        });
        Self {
            token,
            handle: task.abort_handle(),
        }
    }

    pub fn token(&self) -> TimerToken {
        self.token
    }
}

impl Drop for OneShot {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
