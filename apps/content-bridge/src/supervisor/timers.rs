//! Deadline bookkeeping for the supervisor's timers.
//!
//! Nothing here sleeps. The table records at most one deadline per timer
//! kind; whoever drives the supervisor asks for the next deadline, waits for
//! it, and feeds due timers back in one at a time.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerKind {
    Reconnect,
    Heartbeat,
    HealthCheck,
    RecoverySafety,
    RecoveryRetry,
    RecoverySettle,
}

impl fmt::Display for TimerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TimerKind::Reconnect => "reconnect",
            TimerKind::Heartbeat => "heartbeat",
            TimerKind::HealthCheck => "health_check",
            TimerKind::RecoverySafety => "recovery_safety",
            TimerKind::RecoveryRetry => "recovery_retry",
            TimerKind::RecoverySettle => "recovery_settle",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Default)]
pub struct TimerTable {
    deadlines: BTreeMap<TimerKind, Instant>,
}

impl TimerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms `kind`, replacing any deadline it already had. Returns whether a
    /// previous deadline was cancelled.
    pub fn arm(&mut self, kind: TimerKind, at: Instant) -> bool {
        self.deadlines.insert(kind, at).is_some()
    }

    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        self.deadlines.remove(&kind).is_some()
    }

    pub fn cancel_all(&mut self) {
        self.deadlines.clear();
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.deadlines.contains_key(&kind)
    }

    pub fn deadline(&self, kind: TimerKind) -> Option<Instant> {
        self.deadlines.get(&kind).copied()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Removes and returns the earliest timer due at `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<TimerKind> {
        let kind = self
            .deadlines
            .iter()
            .filter(|(_, at)| **at <= now)
            .min_by_key(|(kind, at)| (**at, **kind))
            .map(|(kind, _)| *kind)?;
        self.deadlines.remove(&kind);
        Some(kind)
    }

    pub fn armed(&self) -> Vec<TimerKind> {
        self.deadlines.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}
