//! In-memory background process for tests and the simulator binary.
//!
//! It behaves like the extension side of a runtime port: opening fails while
//! the runtime is gone, `close()` from the content side is silent, and
//! disconnects initiated by the background are reported through the
//! channel's event sink.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bridge_proto::{InboundEnvelope, InboundMessage, OutboundMessage};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    Channel, ChannelError, ChannelEvents, ChannelId, ChannelResult, Connector, RuntimeProbe,
};

pub const DEFAULT_RUNTIME_ID: &str = "bridge-sim-extension";

struct SimState {
    runtime_id: Option<String>,
    open_failures: VecDeque<ChannelError>,
    send_failure: Option<String>,
    auto_heartbeat: bool,
    opens: usize,
    current: Option<Arc<SimChannel>>,
    delivered: Vec<(ChannelId, OutboundMessage)>,
}

pub struct SimulatedBackground {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedBackground {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(Mutex::new(SimState {
                runtime_id: Some(DEFAULT_RUNTIME_ID.to_string()),
                open_failures: VecDeque::new(),
                send_failure: None,
                auto_heartbeat: true,
                opens: 0,
                current: None,
                delivered: Vec::new(),
            })),
        })
    }

    /// Answer heartbeat pings with a `heartbeatResponse` (on by default).
    pub fn set_auto_heartbeat(&self, enabled: bool) {
        self.state.lock().auto_heartbeat = enabled;
    }

    /// Queue an error for the next `open()` call.
    pub fn fail_next_open(&self, error: ChannelError) {
        self.state.lock().open_failures.push_back(error);
    }

    /// Make every send fail with the given runtime text until cleared.
    pub fn fail_sends(&self, error: Option<&str>) {
        self.state.lock().send_failure = error.map(str::to_string);
    }

    /// Drop the runtime: the id stops resolving and the open port is
    /// disconnected without an error message.
    pub fn invalidate_context(&self) {
        self.state.lock().runtime_id = None;
        self.disconnect(None);
    }

    pub fn restore_context(&self) {
        self.state.lock().runtime_id = Some(DEFAULT_RUNTIME_ID.to_string());
    }

    pub fn set_runtime_available(&self, available: bool) {
        self.state.lock().runtime_id = available.then(|| DEFAULT_RUNTIME_ID.to_string());
    }

    /// Background-initiated disconnect of the current port.
    pub fn disconnect(&self, error: Option<&str>) -> Option<ChannelId> {
        let channel = self.state.lock().current.take()?;
        channel.open.store(false, Ordering::SeqCst);
        debug!(target: "bridge.transport", channel = %channel.events.id(), error = ?error, "simulated disconnect");
        channel.events.disconnected(error.map(str::to_string));
        Some(channel.events.id())
    }

    /// Close the current port without telling the content side, as happens
    /// when the background worker is evicted mid-flight.
    pub fn sever(&self) -> Option<ChannelId> {
        let channel = self.state.lock().current.take()?;
        channel.open.store(false, Ordering::SeqCst);
        Some(channel.events.id())
    }

    pub fn push(&self, envelope: &InboundEnvelope) -> bool {
        match envelope.encode() {
            Ok(text) => self.push_raw(text),
            Err(err) => {
                warn!(target: "bridge.transport", error = %err, "failed to encode simulated message");
                false
            }
        }
    }

    pub fn push_raw(&self, text: impl Into<String>) -> bool {
        let current = self.state.lock().current.clone();
        match current {
            Some(channel) if channel.is_open() => {
                channel.events.message(text);
                true
            }
            _ => false,
        }
    }

    pub fn current_channel(&self) -> Option<ChannelId> {
        self.state
            .lock()
            .current
            .as_ref()
            .map(|channel| channel.events.id())
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().opens
    }

    pub fn delivered(&self) -> Vec<OutboundMessage> {
        self.state
            .lock()
            .delivered
            .iter()
            .map(|(_, message)| message.clone())
            .collect()
    }

    /// Delivered messages minus heartbeat pings.
    pub fn delivered_business(&self) -> Vec<OutboundMessage> {
        self.delivered()
            .into_iter()
            .filter(|message| !message.is_heartbeat())
            .collect()
    }

    pub fn clear_delivered(&self) {
        self.state.lock().delivered.clear();
    }
}

impl Connector for SimulatedBackground {
    fn open(&self, events: ChannelEvents) -> ChannelResult<Arc<dyn Channel>> {
        let mut state = self.state.lock();
        if state.runtime_id.is_none() {
            return Err(ChannelError::RuntimeUnavailable);
        }
        if let Some(error) = state.open_failures.pop_front() {
            return Err(error);
        }
        state.opens += 1;
        let channel = Arc::new(SimChannel {
            events,
            open: AtomicBool::new(true),
            state: Arc::downgrade(&self.state),
        });
        if let Some(previous) = state.current.replace(Arc::clone(&channel)) {
            previous.open.store(false, Ordering::SeqCst);
        }
        debug!(target: "bridge.transport", channel = %channel.events.id(), "simulated port opened");
        Ok(channel)
    }
}

impl RuntimeProbe for SimulatedBackground {
    fn runtime_id(&self) -> Option<String> {
        self.state.lock().runtime_id.clone()
    }
}

struct SimChannel {
    events: ChannelEvents,
    open: AtomicBool,
    state: Weak<Mutex<SimState>>,
}

impl Channel for SimChannel {
    fn id(&self) -> ChannelId {
        self.events.id()
    }

    fn send(&self, message: &OutboundMessage) -> ChannelResult<()> {
        if !self.is_open() {
            return Err(ChannelError::Closed);
        }
        let Some(shared) = self.state.upgrade() else {
            return Err(ChannelError::Closed);
        };
        let mut state = shared.lock();
        if let Some(error) = &state.send_failure {
            return Err(ChannelError::Runtime(error.clone()));
        }
        state.delivered.push((self.events.id(), message.clone()));
        if let OutboundMessage::Heartbeat { timestamp } = message {
            if state.auto_heartbeat {
                let reply = InboundEnvelope::new(InboundMessage::HeartbeatResponse {
                    timestamp: *timestamp,
                });
                if let Ok(text) = reply.encode() {
                    self.events.message(text);
                }
            }
        }
        Ok(())
    }

    fn close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(shared) = self.state.upgrade() {
            let mut state = shared.lock();
            let is_current = state
                .current
                .as_ref()
                .is_some_and(|current| current.events.id() == self.events.id());
            if is_current {
                state.current = None;
            }
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
