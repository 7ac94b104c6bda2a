use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bridge_proto::OutboundMessage;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod sim;

pub use sim::SimulatedBackground;

/// Error text the extension runtime reports when posting to a port that was
/// already disconnected.
pub const DISCONNECTED_PORT_ERROR: &str = "Attempting to use a disconnected port object";

/// Identifies one opened channel. Ids are never reused within an
/// [`EventSender`] family, so events from a replaced channel can be told
/// apart from events for the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port-{}", self.0)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("extension runtime unavailable")]
    RuntimeUnavailable,
    #[error("channel closed")]
    Closed,
    #[error("{0}")]
    Runtime(String),
}

impl ChannelError {
    /// Raw error text as the runtime would report it, if there is one.
    pub fn message(&self) -> Option<&str> {
        match self {
            ChannelError::RuntimeUnavailable => None,
            ChannelError::Closed => Some(DISCONNECTED_PORT_ERROR),
            ChannelError::Runtime(text) => Some(text),
        }
    }
}

pub type ChannelResult<T> = Result<T, ChannelError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Message {
        channel: ChannelId,
        text: String,
    },
    Disconnected {
        channel: ChannelId,
        error: Option<String>,
    },
}

impl ChannelEvent {
    pub fn channel(&self) -> ChannelId {
        match self {
            ChannelEvent::Message { channel, .. } | ChannelEvent::Disconnected { channel, .. } => {
                *channel
            }
        }
    }
}

pub type EventReceiver = mpsc::UnboundedReceiver<ChannelEvent>;

/// Producer side of the channel event stream. Cloning shares both the
/// underlying queue and the channel id counter.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<ChannelEvent>,
    next_id: Arc<AtomicU64>,
}

pub fn event_stream() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        EventSender {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
        },
        rx,
    )
}

impl EventSender {
    /// Allocates an id for a channel about to be opened and returns the
    /// sink it reports through.
    pub fn for_new_channel(&self) -> ChannelEvents {
        let id = ChannelId(self.next_id.fetch_add(1, Ordering::Relaxed));
        ChannelEvents {
            id,
            tx: self.tx.clone(),
        }
    }
}

/// Registered `onMessage` / `onDisconnect` handlers of a single channel.
#[derive(Debug, Clone)]
pub struct ChannelEvents {
    id: ChannelId,
    tx: mpsc::UnboundedSender<ChannelEvent>,
}

impl ChannelEvents {
    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn message(&self, text: impl Into<String>) {
        let _ = self.tx.send(ChannelEvent::Message {
            channel: self.id,
            text: text.into(),
        });
    }

    pub fn disconnected(&self, error: Option<String>) {
        let _ = self.tx.send(ChannelEvent::Disconnected {
            channel: self.id,
            error,
        });
    }
}

/// A single duplex connection to the background process.
pub trait Channel: Send + Sync {
    fn id(&self) -> ChannelId;

    /// Fails when the channel was closed underneath the caller; treat that
    /// the same as a disconnect.
    fn send(&self, message: &OutboundMessage) -> ChannelResult<()>;

    /// Idempotent. Never reports errors.
    fn close(&self);

    fn is_open(&self) -> bool;
}

/// Opens channels to the background process.
pub trait Connector: Send + Sync {
    fn open(&self, events: ChannelEvents) -> ChannelResult<Arc<dyn Channel>>;
}

/// Synchronous probe of the host extension runtime.
pub trait RuntimeProbe: Send + Sync {
    /// The extension id, when the runtime still resolves it.
    fn runtime_id(&self) -> Option<String>;

    fn is_available(&self) -> bool {
        self.runtime_id().is_some()
    }
}
