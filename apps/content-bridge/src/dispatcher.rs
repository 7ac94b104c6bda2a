//! Decouples message producers from channel availability.
//!
//! Outbound messages go straight to the current channel when there is one
//! and into a bounded FIFO otherwise. The queue is flushed in order whenever a
//! new channel is handed over. Any send failure parks the message, drops the
//! channel reference and raises the [`ReconnectSignal`] for the supervisor.

use std::collections::VecDeque;
use std::sync::Arc;

use bridge_proto::OutboundMessage;
use bridge_transport::Channel;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Snapshot used by health checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub queued_messages: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    pub queued: usize,
    pub dropped: u64,
    pub flushed: u64,
    pub send_failures: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Queued,
}

/// Bounded FIFO that evicts its oldest entry once full.
#[derive(Debug)]
pub struct OutboundQueue {
    items: VecDeque<OutboundMessage>,
    cap: usize,
    dropped: u64,
}

impl OutboundQueue {
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            items: VecDeque::with_capacity(cap.min(64)),
            cap,
            dropped: 0,
        }
    }

    /// Returns the evicted message, if the cap forced one out.
    pub fn push(&mut self, message: OutboundMessage) -> Option<OutboundMessage> {
        let evicted = if self.items.len() >= self.cap {
            self.dropped += 1;
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(message);
        evicted
    }

    pub fn front(&self) -> Option<&OutboundMessage> {
        self.items.front()
    }

    pub fn pop_front(&mut self) -> Option<OutboundMessage> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectRequest {
    /// Runtime error text of the failed send, if any.
    pub error: Option<String>,
}

/// Latch the dispatcher raises when it wants a reconnect. Raising twice
/// before the supervisor looks keeps a single request, preferring one that
/// carries error text.
#[derive(Debug, Default)]
pub struct ReconnectSignal {
    pending: Mutex<Option<ReconnectRequest>>,
    notify: Notify,
}

impl ReconnectSignal {
    pub fn raise(&self, error: Option<String>) {
        {
            let mut pending = self.pending.lock();
            match pending.as_mut() {
                Some(existing) if existing.error.is_some() => {}
                Some(existing) => existing.error = error,
                None => *pending = Some(ReconnectRequest { error }),
            }
        }
        self.notify.notify_one();
    }

    pub fn take(&self) -> Option<ReconnectRequest> {
        self.pending.lock().take()
    }

    pub fn is_raised(&self) -> bool {
        self.pending.lock().is_some()
    }

    /// Resolves after the next `raise`, or immediately if one is pending.
    pub async fn raised(&self) {
        self.notify.notified().await;
    }
}

struct DispatcherInner {
    channel: Option<Arc<dyn Channel>>,
    queue: OutboundQueue,
    flushed: u64,
    send_failures: u64,
}

pub struct MessageDispatcher {
    inner: Mutex<DispatcherInner>,
    signal: Arc<ReconnectSignal>,
}

impl MessageDispatcher {
    pub fn new(queue_cap: usize, signal: Arc<ReconnectSignal>) -> Self {
        Self {
            inner: Mutex::new(DispatcherInner {
                channel: None,
                queue: OutboundQueue::new(queue_cap),
                flushed: 0,
                send_failures: 0,
            }),
            signal,
        }
    }

    pub fn send_message(&self, message: OutboundMessage) -> SendOutcome {
        let mut inner = self.inner.lock();
        let Some(channel) = inner.channel.clone() else {
            Self::enqueue(&mut inner, message);
            drop(inner);
            self.signal.raise(None);
            return SendOutcome::Queued;
        };

        if !inner.queue.is_empty() {
            // Keep FIFO order behind anything still parked.
            Self::enqueue(&mut inner, message);
            let failure = Self::flush(&mut inner, &channel);
            drop(inner);
            if let Some(error) = failure {
                self.signal.raise(error);
            }
            return SendOutcome::Queued;
        }

        match channel.send(&message) {
            Ok(()) => SendOutcome::Sent,
            Err(err) => {
                warn!(
                    target: "bridge.dispatcher",
                    channel = %channel.id(),
                    kind = message.kind(),
                    error = %err,
                    "send failed, queueing"
                );
                inner.channel = None;
                inner.send_failures += 1;
                Self::enqueue(&mut inner, message);
                drop(inner);
                self.signal.raise(err.message().map(str::to_string));
                SendOutcome::Queued
            }
        }
    }

    /// Swaps the active channel and flushes the queue through the new one.
    /// Returns how many queued messages were delivered.
    pub fn update_channel(&self, channel: Option<Arc<dyn Channel>>) -> usize {
        let mut inner = self.inner.lock();
        inner.channel = channel.clone();
        let Some(channel) = channel else {
            return 0;
        };
        let before = inner.flushed;
        let failure = Self::flush(&mut inner, &channel);
        let delivered = (inner.flushed - before) as usize;
        let remaining = inner.queue.len();
        drop(inner);
        if delivered > 0 || remaining > 0 {
            debug!(target: "bridge.dispatcher", channel = %channel.id(), delivered, remaining, "flushed outbound queue");
        }
        if let Some(error) = failure {
            self.signal.raise(error);
        }
        delivered
    }

    pub fn detach(&self) {
        self.inner.lock().channel = None;
    }

    pub fn get_connection_status(&self) -> ConnectionStatus {
        let inner = self.inner.lock();
        ConnectionStatus {
            connected: inner.channel.as_ref().is_some_and(|channel| channel.is_open()),
            queued_messages: inner.queue.len(),
        }
    }

    pub fn stats(&self) -> DispatcherStats {
        let inner = self.inner.lock();
        DispatcherStats {
            queued: inner.queue.len(),
            dropped: inner.queue.dropped(),
            flushed: inner.flushed,
            send_failures: inner.send_failures,
        }
    }

    fn enqueue(inner: &mut DispatcherInner, message: OutboundMessage) {
        if let Some(evicted) = inner.queue.push(message) {
            warn!(
                target: "bridge.dispatcher",
                kind = evicted.kind(),
                dropped = inner.queue.dropped(),
                "outbound queue full, dropped oldest message"
            );
        }
    }

    /// Sends queued messages in order. Stops at the first failure, leaving
    /// the failed message at the head, and returns `Some(error text)`.
    fn flush(inner: &mut DispatcherInner, channel: &Arc<dyn Channel>) -> Option<Option<String>> {
        while let Some(message) = inner.queue.front() {
            if let Err(err) = channel.send(message) {
                warn!(
                    target: "bridge.dispatcher",
                    channel = %channel.id(),
                    remaining = inner.queue.len(),
                    error = %err,
                    "flush halted"
                );
                inner.channel = None;
                inner.send_failures += 1;
                return Some(err.message().map(str::to_string));
            }
            inner.queue.pop_front();
            inner.flushed += 1;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_transport::{event_stream, Connector, SimulatedBackground};
    use serde_json::json;

    fn dispatcher(cap: usize) -> (MessageDispatcher, Arc<ReconnectSignal>) {
        let signal = Arc::new(ReconnectSignal::default());
        (MessageDispatcher::new(cap, Arc::clone(&signal)), signal)
    }

    fn business(n: u32) -> OutboundMessage {
        OutboundMessage::Business {
            kind: "pushFile".into(),
            message_id: format!("m-{n}"),
            payload: json!({ "n": n }),
        }
    }

    #[test]
    fn queues_while_disconnected_and_flushes_in_order() {
        let (dispatcher, signal) = dispatcher(16);
        for n in 0..5 {
            assert_eq!(dispatcher.send_message(business(n)), SendOutcome::Queued);
        }
        assert!(signal.take().is_some());
        assert_eq!(
            dispatcher.get_connection_status(),
            ConnectionStatus {
                connected: false,
                queued_messages: 5
            }
        );

        let background = SimulatedBackground::new();
        let (sender, _rx) = event_stream();
        let channel = background.open(sender.for_new_channel()).unwrap();
        assert_eq!(dispatcher.update_channel(Some(channel)), 5);

        let delivered = background.delivered();
        assert_eq!(delivered, (0..5).map(business).collect::<Vec<_>>());
        assert_eq!(dispatcher.get_connection_status().queued_messages, 0);
        assert!(signal.take().is_none());
    }

    #[test]
    fn flush_failure_keeps_remaining_messages_queued() {
        let (dispatcher, signal) = dispatcher(16);
        for n in 0..3 {
            dispatcher.send_message(business(n));
        }
        signal.take();

        let background = SimulatedBackground::new();
        let (sender, _rx) = event_stream();
        let channel = background.open(sender.for_new_channel()).unwrap();
        background.fail_sends(Some("Could not establish connection. Receiving end does not exist."));

        assert_eq!(dispatcher.update_channel(Some(channel)), 0);
        let status = dispatcher.get_connection_status();
        assert!(!status.connected);
        assert_eq!(status.queued_messages, 3);
        let request = signal.take().expect("reconnect requested");
        assert!(request.error.unwrap().contains("Receiving end does not exist"));

        background.fail_sends(None);
        let channel = background.open(sender.for_new_channel()).unwrap();
        assert_eq!(dispatcher.update_channel(Some(channel)), 3);
        assert_eq!(background.delivered(), (0..3).map(business).collect::<Vec<_>>());
    }

    #[test]
    fn failed_immediate_send_is_parked() {
        let (dispatcher, signal) = dispatcher(16);
        let background = SimulatedBackground::new();
        let (sender, _rx) = event_stream();
        let channel = background.open(sender.for_new_channel()).unwrap();
        dispatcher.update_channel(Some(channel));
        assert_eq!(dispatcher.send_message(business(1)), SendOutcome::Sent);

        background.sever();
        assert_eq!(dispatcher.send_message(business(2)), SendOutcome::Queued);
        assert_eq!(dispatcher.stats().send_failures, 1);
        assert_eq!(
            signal.take().and_then(|request| request.error).as_deref(),
            Some(bridge_transport::DISCONNECTED_PORT_ERROR)
        );
        // Channel reference was dropped, so the next send queues directly.
        assert_eq!(dispatcher.send_message(business(3)), SendOutcome::Queued);
        assert_eq!(dispatcher.stats().send_failures, 1);
        assert_eq!(dispatcher.get_connection_status().queued_messages, 2);
    }

    #[test]
    fn queue_cap_drops_oldest_and_counts() {
        let (dispatcher, _signal) = dispatcher(3);
        for n in 0..5 {
            dispatcher.send_message(business(n));
        }
        let stats = dispatcher.stats();
        assert_eq!(stats.queued, 3);
        assert_eq!(stats.dropped, 2);

        let background = SimulatedBackground::new();
        let (sender, _rx) = event_stream();
        dispatcher.update_channel(Some(background.open(sender.for_new_channel()).unwrap()));
        assert_eq!(background.delivered(), (2..5).map(business).collect::<Vec<_>>());
    }

    #[test]
    fn signal_prefers_requests_with_error_text() {
        let signal = ReconnectSignal::default();
        signal.raise(None);
        signal.raise(Some("Extension context invalidated.".into()));
        signal.raise(None);
        assert_eq!(
            signal.take(),
            Some(ReconnectRequest {
                error: Some("Extension context invalidated.".into())
            })
        );
        assert!(!signal.is_raised());
    }

    #[tokio::test]
    async fn raised_resolves_for_pending_request() {
        let signal = ReconnectSignal::default();
        signal.raise(None);
        tokio::time::timeout(std::time::Duration::from_millis(50), signal.raised())
            .await
            .expect("notified");
    }
}
