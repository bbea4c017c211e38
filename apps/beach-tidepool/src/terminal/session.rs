use super::output::{OutputPipeline, OutputSettings, SessionEvent, SubscriberId};
use super::pty::PtyHandle;
use super::resize::{ResizeCoordinator, ResizeIgnored, ResizeOutcome, ResizeSettings};
use super::timer::{OneShot, TimerToken};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

pub type SessionId = String;

/// Events a single connection may have queued before it is considered lagging.
pub const CONNECTION_QUEUE_DEPTH: usize = 1024;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionSettings {
    pub output: OutputSettings,
    pub resize: ResizeSettings,
}

/// Lightweight view of a session for listings. Never carries the process.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: SessionId,
    pub cwd: PathBuf,
    pub created_at: DateTime<Utc>,
    pub shell: String,
}

/// What a freshly bound viewer starts from: the replay and its live feed.
#[derive(Debug)]
pub struct Attachment {
    pub subscriber: SubscriberId,
    pub scrollback: String,
    pub events: mpsc::Receiver<SessionEvent>,
}

struct SessionState {
    output: OutputPipeline,
    resize: ResizeCoordinator,
    termination: Option<OneShot>,
    closed: bool,
}

/// One live shell process and everything it owns.
pub struct Session {
    id: SessionId,
    shell: String,
    cwd: PathBuf,
    created_at: DateTime<Utc>,
    process: Box<dyn PtyHandle>,
    state: Mutex<SessionState>,
    this: Weak<Session>,
}

impl Session {
    pub fn new(
        id: SessionId,
        shell: String,
        cwd: PathBuf,
        process: Box<dyn PtyHandle>,
        settings: SessionSettings,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            id,
            shell,
            cwd,
            created_at: Utc::now(),
            process,
            state: Mutex::new(SessionState {
                output: OutputPipeline::new(settings.output),
                resize: ResizeCoordinator::new(settings.resize),
                termination: None,
                closed: false,
            }),
            this: this.clone(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            cwd: self.cwd.clone(),
            created_at: self.created_at,
            shell: self.shell.clone(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Feeds process output into the pipeline. Output that arrives while a
    /// resize is settling is dropped on purpose: it is almost always the
    /// shell redrawing its prompt.
    pub fn on_process_data(&self, chunk: &str) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        if state.resize.is_suppressing() {
            trace!(
                target = "tidepool::session",
                session_id = %self.id,
                chars = chunk.chars().count(),
                "dropping output during resize settle"
            );
            return;
        }
        if state.output.append(chunk) {
            let timer = self.flush_timer(state.output.settings());
            state.output.arm_flush(timer);
        }
    }

    fn flush_timer(&self, settings: OutputSettings) -> OneShot {
        let session = self.this.clone();
        OneShot::start(settings.throttle, move |token| {
            if let Some(session) = session.upgrade() {
                session.flush_fired(token);
            }
        })
    }

    fn flush_fired(&self, token: TimerToken) {
        let mut state = self.state.lock();
        if state.closed || !state.output.claim_flush(token) {
            return;
        }
        if state.output.flush_batch() {
            let timer = self.flush_timer(state.output.settings());
            state.output.arm_flush(timer);
        }
    }

    /// Binds a new viewer. Scrollback is captured and the subscriber
    /// registered under one lock, so nothing can fall between the replay and
    /// the live feed. `None` once the session has closed.
    pub fn attach(&self, queue_depth: usize) -> Option<Attachment> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        let scrollback = state.output.scrollback_and_clear_pending();
        let (subscriber, events) = state.output.subscribe(queue_depth);
        debug!(
            target = "tidepool::session",
            session_id = %self.id,
            subscriber = ?subscriber,
            scrollback_chars = state.output.scrollback().char_len(),
            "viewer attached"
        );
        Some(Attachment {
            subscriber,
            scrollback,
            events,
        })
    }

    /// Live-only tap on the output stream, without scrollback.
    pub fn subscribe(&self, queue_depth: usize) -> Option<(SubscriberId, mpsc::Receiver<SessionEvent>)> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        Some(state.output.subscribe(queue_depth))
    }

    pub fn detach(&self, subscriber: SubscriberId) -> bool {
        let detached = self.state.lock().output.unsubscribe(subscriber);
        if detached {
            debug!(
                target = "tidepool::session",
                session_id = %self.id,
                subscriber = ?subscriber,
                "viewer detached"
            );
        }
        detached
    }

    pub fn write(&self, data: &[u8]) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.process.write(data) {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    target = "tidepool::session",
                    session_id = %self.id,
                    error = %err,
                    "failed to write to PTY"
                );
                false
            }
        }
    }

    pub fn resize(&self, cols: i64, rows: i64, suppress_output: bool) -> ResizeOutcome {
        let mut state = self.state.lock();
        if state.closed {
            return ResizeOutcome::Ignored(ResizeIgnored::Closed);
        }
        let now = Instant::now();
        let plan = match state.resize.plan(cols, rows, suppress_output, now) {
            Ok(plan) => plan,
            Err(reason) => {
                trace!(
                    target = "tidepool::resize",
                    session_id = %self.id,
                    cols,
                    rows,
                    ?reason,
                    "resize ignored"
                );
                return ResizeOutcome::Ignored(reason);
            }
        };

        if plan.suppress {
            let timer = self.settle_timer(state.resize.settings().settle);
            state.resize.begin_suppression(timer);
        }
        let dims = plan.dimensions;
        match self.process.resize(dims.cols, dims.rows) {
            Ok(()) => {
                state.resize.record_applied(dims, now);
                debug!(
                    target = "tidepool::resize",
                    session_id = %self.id,
                    cols = dims.cols,
                    rows = dims.rows,
                    suppressed = plan.suppress,
                    "resize applied"
                );
                ResizeOutcome::Applied {
                    suppressed: plan.suppress,
                }
            }
            Err(err) => {
                state.resize.end_suppression();
                warn!(
                    target = "tidepool::resize",
                    session_id = %self.id,
                    cols = dims.cols,
                    rows = dims.rows,
                    error = %err,
                    "failed to resize PTY"
                );
                ResizeOutcome::Failed
            }
        }
    }

    fn settle_timer(&self, settle: std::time::Duration) -> OneShot {
        let session = self.this.clone();
        OneShot::start(settle, move |token| {
            if let Some(session) = session.upgrade() {
                if session.state.lock().resize.settle_fired(token) {
                    trace!(
                        target = "tidepool::resize",
                        session_id = %session.id,
                        "resize settled"
                    );
                }
            }
        })
    }

    pub fn is_suppressing_output(&self) -> bool {
        self.state.lock().resize.is_suppressing()
    }

    /// Cancels the flush and settle timers.
    pub fn cancel_timers(&self) {
        let mut state = self.state.lock();
        state.output.cancel_flush();
        state.resize.end_suppression();
    }

    /// Keeps the first armed termination follow-up; later ones are dropped
    /// (and so cancelled), as is any armed after close.
    pub fn arm_termination(&self, timer: OneShot) -> bool {
        let mut state = self.state.lock();
        if state.closed || state.termination.is_some() {
            return false;
        }
        state.termination = Some(timer);
        true
    }

    pub fn terminate(&self) -> anyhow::Result<()> {
        self.process.terminate()
    }

    pub fn force_kill(&self) -> anyhow::Result<()> {
        self.process.kill()
    }

    /// Final delivery: flushes what is pending, cancels every timer, sends
    /// `Exit` and releases all viewers. Idempotent.
    pub fn close(&self, exit_code: i32) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        state.output.drain_pending();
        state.output.cancel_flush();
        state.resize.end_suppression();
        state.termination = None;
        state.output.close_subscribers(exit_code);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("shell", &self.shell)
            .field("cwd", &self.cwd)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}
