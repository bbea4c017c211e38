use super::timer::{OneShot, TimerToken};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::time::Duration;
use tokio::time::Instant;

pub const COLS_RANGE: RangeInclusive<i64> = 1..=1000;
pub const ROWS_RANGE: RangeInclusive<i64> = 1..=500;
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_SETTLE: Duration = Duration::from_millis(150);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub cols: u16,
    pub rows: u16,
}

impl Dimensions {
    pub const DEFAULT: Dimensions = Dimensions { cols: 80, rows: 24 };

    /// `None` unless both values fall inside the accepted terminal bounds.
    pub fn checked(cols: i64, rows: i64) -> Option<Self> {
        if !COLS_RANGE.contains(&cols) || !ROWS_RANGE.contains(&rows) {
            return None;
        }
        Some(Self {
            cols: u16::try_from(cols).ok()?,
            rows: u16::try_from(rows).ok()?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResizeSettings {
    pub min_interval: Duration,
    pub settle: Duration,
}

impl Default for ResizeSettings {
    fn default() -> Self {
        Self {
            min_interval: DEFAULT_MIN_INTERVAL,
            settle: DEFAULT_SETTLE,
        }
    }
}

/// Why a resize request was not applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ResizeIgnored {
    OutOfBounds,
    RateLimited,
    Unchanged,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResizeOutcome {
    Applied { suppressed: bool },
    Ignored(ResizeIgnored),
    Failed,
}

impl ResizeOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ResizeOutcome::Applied { .. })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResizePlan {
    pub dimensions: Dimensions,
    pub suppress: bool,
}

enum ResizePhase {
    Idle,
    Suppressing(OneShot),
}

/// Per-session resize bookkeeping: last applied size and time, and the
/// output-suppression window that follows a suppressed resize.
pub struct ResizeCoordinator {
    settings: ResizeSettings,
    last: Option<Dimensions>,
    last_applied_at: Option<Instant>,
    phase: ResizePhase,
}

impl ResizeCoordinator {
    pub fn new(settings: ResizeSettings) -> Self {
        Self {
            settings,
            last: None,
            last_applied_at: None,
            phase: ResizePhase::Idle,
        }
    }

    pub fn settings(&self) -> ResizeSettings {
        self.settings
    }

    pub fn last_applied(&self) -> Option<Dimensions> {
        self.last
    }

    /// Decides whether a request goes through. Bounds are checked first, then
    /// the rate limit, then equality with the last applied size. The first
    /// resize of a session is never suppressed.
    pub fn plan(
        &self,
        cols: i64,
        rows: i64,
        suppress: bool,
        now: Instant,
    ) -> Result<ResizePlan, ResizeIgnored> {
        let dimensions = Dimensions::checked(cols, rows).ok_or(ResizeIgnored::OutOfBounds)?;
        if let Some(at) = self.last_applied_at {
            if now.saturating_duration_since(at) < self.settings.min_interval {
                return Err(ResizeIgnored::RateLimited);
            }
        }
        if self.last == Some(dimensions) {
            return Err(ResizeIgnored::Unchanged);
        }
        Ok(ResizePlan {
            dimensions,
            suppress: suppress && self.last.is_some(),
        })
    }

    pub fn record_applied(&mut self, dimensions: Dimensions, at: Instant) {
        self.last = Some(dimensions);
        self.last_applied_at = Some(at);
    }

    /// Enters (or restarts) the suppression window. Any previous settle timer
    /// is cancelled when it is replaced.
    pub fn begin_suppression(&mut self, settle_timer: OneShot) {
        self.phase = ResizePhase::Suppressing(settle_timer);
    }

    /// Ends suppression if `token` belongs to the current settle timer.
    pub fn settle_fired(&mut self, token: TimerToken) -> bool {
        match &self.phase {
            ResizePhase::Suppressing(timer) if timer.token() == token => {
                self.phase = ResizePhase::Idle;
                true
            }
            _ => false,
        }
    }

    pub fn end_suppression(&mut self) {
        self.phase = ResizePhase::Idle;
    }

    pub fn is_suppressing(&self) -> bool {
        matches!(self.phase, ResizePhase::Suppressing(_))
    }
}
