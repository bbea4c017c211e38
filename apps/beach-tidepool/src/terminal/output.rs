use super::timer::{OneShot, TimerToken};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{trace, warn};

pub const DEFAULT_SCROLLBACK_CHARS: usize = 50_000;
pub const DEFAULT_THROTTLE: Duration = Duration::from_millis(4);
pub const DEFAULT_BATCH_CHARS: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutputSettings {
    /// Scrollback ceiling in characters.
    pub scrollback_limit: usize,
    pub throttle: Duration,
    /// Maximum characters delivered per flush.
    pub batch_size: usize,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            scrollback_limit: DEFAULT_SCROLLBACK_CHARS,
            throttle: DEFAULT_THROTTLE,
            batch_size: DEFAULT_BATCH_CHARS,
        }
    }
}

/// Everything a bound viewer can receive from a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    Data(String),
    Exit { exit_code: i32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// Bounded history of a session's output. Oldest characters go first.
#[derive(Debug, Default)]
pub struct Scrollback {
    text: String,
    chars: usize,
    limit: usize,
}

impl Scrollback {
    pub fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            chars: 0,
            limit,
        }
    }

    pub fn push(&mut self, chunk: &str) {
        self.text.push_str(chunk);
        self.chars += chunk.chars().count();
        if self.chars > self.limit {
            let excess = self.chars - self.limit;
            let cut = self
                .text
                .char_indices()
                .nth(excess)
                .map(|(offset, _)| offset)
                .unwrap_or(self.text.len());
            self.text.drain(..cut);
            self.chars -= excess;
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn char_len(&self) -> usize {
        self.chars
    }
}

enum FlushState {
    Idle,
    Scheduled(OneShot),
}

struct Subscriber {
    id: SubscriberId,
    tx: mpsc::Sender<SessionEvent>,
}

/// Scrollback plus throttled, batched fan-out of live output for one session.
///
/// The pipeline never arms timers itself: the owning session creates the
/// flush timer and hands it over through [`OutputPipeline::arm_flush`], then
/// calls back into [`OutputPipeline::claim_flush`] when it fires.
pub struct OutputPipeline {
    settings: OutputSettings,
    scrollback: Scrollback,
    pending: String,
    flush: FlushState,
    subscribers: Vec<Subscriber>,
    next_subscriber: u64,
}

impl OutputPipeline {
    pub fn new(settings: OutputSettings) -> Self {
        Self {
            settings,
            scrollback: Scrollback::new(settings.scrollback_limit),
            pending: String::new(),
            flush: FlushState::Idle,
            subscribers: Vec::new(),
            next_subscriber: 0,
        }
    }

    pub fn settings(&self) -> OutputSettings {
        self.settings
    }

    /// Records a chunk of process output. Returns true when a flush needs to
    /// be armed.
    pub fn append(&mut self, chunk: &str) -> bool {
        if chunk.is_empty() {
            return false;
        }
        self.scrollback.push(chunk);
        self.pending.push_str(chunk);
        matches!(self.flush, FlushState::Idle)
    }

    pub fn arm_flush(&mut self, timer: OneShot) {
        self.flush = FlushState::Scheduled(timer);
    }

    pub fn is_flush_scheduled(&self) -> bool {
        matches!(self.flush, FlushState::Scheduled(_))
    }

    /// Accepts a fired flush timer if it is the one currently armed.
    pub fn claim_flush(&mut self, token: TimerToken) -> bool {
        match &self.flush {
            FlushState::Scheduled(timer) if timer.token() == token => {
                self.flush = FlushState::Idle;
                true
            }
            _ => false,
        }
    }

    /// Delivers one batch of pending output. Returns true if more remains
    /// and another flush should be armed.
    pub fn flush_batch(&mut self) -> bool {
        if self.pending.is_empty() {
            return false;
        }
        let batch = take_chars(&mut self.pending, self.settings.batch_size);
        trace!(
            target = "tidepool::output",
            chars = batch.chars().count(),
            subscribers = self.subscribers.len(),
            "flushing output batch"
        );
        self.broadcast(SessionEvent::Data(batch));
        !self.pending.is_empty()
    }

    pub fn cancel_flush(&mut self) {
        self.flush = FlushState::Idle;
    }

    /// Delivers everything pending right away, batch by batch.
    pub fn drain_pending(&mut self) {
        while self.flush_batch() {}
    }

    /// Called once per new bind, before the new subscriber is registered.
    /// Pending output owed to already-bound subscribers is delivered to them
    /// first; the scheduled flush is cancelled and pending cleared, so the
    /// new subscriber sees those bytes only inside the returned scrollback.
    pub fn scrollback_and_clear_pending(&mut self) -> String {
        if !self.subscribers.is_empty() {
            self.drain_pending();
        }
        self.pending.clear();
        self.cancel_flush();
        self.scrollback.as_str().to_owned()
    }

    pub fn scrollback(&self) -> &Scrollback {
        &self.scrollback
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn subscribe(&mut self, capacity: usize) -> (SubscriberId, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = SubscriberId(self.next_subscriber);
        self.next_subscriber += 1;
        self.subscribers.push(Subscriber { id, tx });
        (id, rx)
    }

    pub fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|subscriber| subscriber.id != id);
        self.subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Fans an event out without waiting on anyone. A subscriber whose queue
    /// is full is dropped; its receiver then drains and ends.
    pub fn broadcast(&mut self, event: SessionEvent) {
        self.subscribers.retain(|subscriber| {
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        target = "tidepool::output",
                        subscriber = subscriber.id.0,
                        "subscriber fell behind; dropping it from fan-out"
                    );
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Sends the exit notification and releases every subscriber.
    pub fn close_subscribers(&mut self, exit_code: i32) {
        self.broadcast(SessionEvent::Exit { exit_code });
        self.subscribers.clear();
    }
}

/// Splits off at most `max` characters from the front of `buffer`.
fn take_chars(buffer: &mut String, max: usize) -> String {
    let cut = buffer
        .char_indices()
        .nth(max)
        .map(|(offset, _)| offset)
        .unwrap_or(buffer.len());
    let rest = buffer.split_off(cut);
    std::mem::replace(buffer, rest)
}
