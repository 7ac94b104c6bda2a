use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use bridge_transport::{Channel, ChannelId};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Recovering,
    Destroyed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Phase::Disconnected => "disconnected",
            Phase::Connecting => "connecting",
            Phase::Connected => "connected",
            Phase::Reconnecting => "reconnecting",
            Phase::Recovering => "recovering",
            Phase::Destroyed => "destroyed",
        };
        f.write_str(label)
    }
}

/// Connection bookkeeping. Only the supervisor mutates it.
///
/// `is_reconnecting` and a live `channel` never hold at the same time, and
/// `reconnect_attempts` stays within `max_reconnect_attempts`.
pub struct ConnectionState {
    pub phase: Phase,
    pub channel: Option<Arc<dyn Channel>>,
    pub is_reconnecting: bool,
    pub reconnect_attempts: u32,
    pub max_reconnect_attempts: u32,
    pub recovery_attempts: u32,
    pub is_in_recovery: bool,
    pub is_destroyed: bool,
    pub last_disconnect: Option<Instant>,
    pub last_heartbeat_ack: Option<u64>,
}

impl ConnectionState {
    pub fn new(max_reconnect_attempts: u32) -> Self {
        Self {
            phase: Phase::Disconnected,
            channel: None,
            is_reconnecting: false,
            reconnect_attempts: 0,
            max_reconnect_attempts,
            recovery_attempts: 0,
            is_in_recovery: false,
            is_destroyed: false,
            last_disconnect: None,
            last_heartbeat_ack: None,
        }
    }

    pub fn channel_id(&self) -> Option<ChannelId> {
        self.channel.as_ref().map(|channel| channel.id())
    }

    pub fn has_live_channel(&self) -> bool {
        self.channel.as_ref().is_some_and(|channel| channel.is_open())
    }

    pub fn budget_exhausted(&self) -> bool {
        self.reconnect_attempts >= self.max_reconnect_attempts
    }
}

/// Counters for inbound message handling.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MessageCounters {
    pub forwarded: u64,
    pub suppressed: u64,
    pub duplicates: u64,
    pub malformed: u64,
    pub handler_errors: u64,
    pub stale_events: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SupervisorStatus {
    pub phase: Phase,
    pub channel: Option<String>,
    pub reconnect_attempts: u32,
    pub recovery_attempts: u32,
    pub in_recovery: bool,
    pub destroyed: bool,
    pub last_heartbeat_ack: Option<u64>,
    pub messages: MessageCounters,
    pub dispatcher: crate::dispatcher::DispatcherStats,
}
