//! Connection supervisor: owns the channel lifecycle and the
//! reconnect/recovery state machine.
//!
//! The supervisor is synchronous. Every stimulus (channel events, timer
//! expiry, dispatcher reconnect requests, page triggers) enters through
//! [`Supervisor::advance`]. Timers are deadlines in a [`TimerTable`]; the
//! async driver or a test decides when they are due.

mod backoff;
mod classify;
mod dedup;
mod recovery;
mod state;
mod timers;

use std::sync::Arc;
use std::time::Duration;

use bridge_proto::{InboundEnvelope, InboundMessage, OutboundMessage};
use bridge_transport::{
    Channel, ChannelError, ChannelEvent, Connector, EventReceiver, EventSender, RuntimeProbe,
};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::dispatcher::{MessageDispatcher, ReconnectRequest, ReconnectSignal, SendOutcome};
use crate::error::{BridgeError, BridgeResult};
use crate::ui::{FallbackNotice, NoticeKind, UiFactory, UiSlot};

pub use backoff::Backoff;
pub use classify::{
    classify_disconnect, Classification, TRANSIENT_PATTERNS, UNRECOVERABLE_PATTERNS,
};
pub use dedup::DedupCache;
pub use state::{ConnectionState, MessageCounters, Phase, SupervisorStatus};
pub use timers::{TimerKind, TimerTable};

pub const CONNECTION_ERROR_NOTICE: &str =
    "Connection to the extension was lost. Retrying did not help; check the extension and try again.";
pub const RELOAD_NOTICE: &str =
    "The extension was updated or reloaded. If pushing stops working, refresh this page.";
pub const REFRESH_REQUIRED_NOTICE: &str =
    "The extension can no longer reach this page. Please refresh the page to continue.";

/// Everything outside the state machine the supervisor talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub connector: Arc<dyn Connector>,
    pub probe: Arc<dyn RuntimeProbe>,
    pub ui: Arc<dyn UiFactory>,
    pub fallback: Arc<dyn FallbackNotice>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Channel(ChannelEvent),
    Timer(TimerKind),
    ReconnectRequested(ReconnectRequest),
    /// Window focus regained or the page became visible again.
    FocusGained,
    /// The extension runtime announced it is reachable again.
    RuntimeReconnect,
    Reinitialize,
    Destroy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShortcutAction {
    ShowChangedFiles,
    PushNow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CleanupMode {
    /// Part of a recovery sequence; the recovery flag and its timers survive.
    Recovery,
    Full,
}

pub struct Supervisor {
    config: Arc<Config>,
    collaborators: Collaborators,
    events: EventSender,
    signal: Arc<ReconnectSignal>,
    dispatcher: Arc<MessageDispatcher>,
    ui: UiSlot,
    state: ConnectionState,
    timers: TimerTable,
    dedup: DedupCache,
    backoff: Backoff,
    counters: MessageCounters,
    page_url: Option<String>,
}

impl Supervisor {
    pub fn new(
        config: Arc<Config>,
        collaborators: Collaborators,
        events: EventSender,
        signal: Arc<ReconnectSignal>,
        page_url: Option<String>,
    ) -> Self {
        let dispatcher = Arc::new(MessageDispatcher::new(
            config.outbound_queue_cap,
            Arc::clone(&signal),
        ));
        Self {
            ui: UiSlot::new(Arc::clone(&collaborators.ui)),
            state: ConnectionState::new(config.max_reconnect_attempts),
            timers: TimerTable::new(),
            dedup: DedupCache::new(config.dedup_window),
            backoff: Backoff::new(
                config.reconnect_base_delay,
                config.reconnect_min_delay,
                config.max_reconnect_attempts,
            ),
            counters: MessageCounters::default(),
            config,
            collaborators,
            events,
            signal,
            dispatcher,
            page_url,
        }
    }

    /// Builds the UI and opens the first channel.
    ///
    /// An open failure that looks like a lost extension context starts
    /// recovery and is not an error. Any other open failure leaves the
    /// supervisor `Disconnected` and is returned.
    pub fn start(&mut self) -> BridgeResult<()> {
        if self.state.is_destroyed {
            return Err(BridgeError::Destroyed);
        }
        if let Err(err) = self.ui.get_instance(&self.dispatcher) {
            warn!(target: "bridge.supervisor", error = %err, "ui unavailable at start");
            self.collaborators.fallback.show_persistent(CONNECTION_ERROR_NOTICE);
            return Err(err.into());
        }
        self.connect_initial()
    }

    /// Single entry point for every stimulus.
    pub fn advance(&mut self, input: Input) {
        if self.state.is_destroyed && input != Input::Destroy {
            debug!(target: "bridge.supervisor", ?input, "ignoring input after destroy");
            return;
        }
        match input {
            Input::Channel(ChannelEvent::Message { channel, text }) => {
                if self.state.channel_id() != Some(channel) {
                    self.counters.stale_events += 1;
                    debug!(target: "bridge.supervisor", %channel, "dropping message from stale channel");
                    return;
                }
                self.handle_inbound(&text);
            }
            Input::Channel(ChannelEvent::Disconnected { channel, error }) => {
                if self.state.channel_id() != Some(channel) {
                    self.counters.stale_events += 1;
                    debug!(target: "bridge.supervisor", %channel, "ignoring disconnect from stale channel");
                    return;
                }
                self.handle_disconnect(error);
            }
            Input::Timer(kind) => self.on_timer(kind),
            Input::ReconnectRequested(request) => self.on_reconnect_requested(request),
            Input::FocusGained | Input::RuntimeReconnect => self.reconnect(),
            Input::Reinitialize => {
                if let Err(err) = self.reinitialize() {
                    warn!(target: "bridge.supervisor", error = %err, "reinitialize failed");
                }
            }
            Input::Destroy => self.destroy(),
        }
    }

    /// Feeds every queued channel event and pending dispatcher request
    /// through [`advance`](Self::advance). Returns how many inputs ran.
    pub fn pump(&mut self, events: &mut EventReceiver) -> usize {
        let mut handled = 0;
        loop {
            if let Ok(event) = events.try_recv() {
                self.advance(Input::Channel(event));
            } else if let Some(request) = self.signal.take() {
                self.advance(Input::ReconnectRequested(request));
            } else {
                return handled;
            }
            handled += 1;
        }
    }

    /// Fires every timer whose deadline has passed, earliest first.
    pub fn fire_due_timers(&mut self) -> usize {
        let mut fired = 0;
        while let Some(kind) = self.timers.pop_due(self.collaborators.clock.now()) {
            self.advance(Input::Timer(kind));
            fired += 1;
        }
        fired
    }

    pub fn next_deadline(&self) -> Option<std::time::Instant> {
        self.timers.next_deadline()
    }

    pub fn armed_timers(&self) -> Vec<TimerKind> {
        self.timers.armed()
    }

    /// External reconnect trigger. Resets an exhausted budget and starts a
    /// fresh cycle from `Connecting`.
    pub fn reconnect(&mut self) {
        if self.state.is_destroyed || self.state.has_live_channel() {
            return;
        }
        if self.state.phase == Phase::Recovering {
            debug!(target: "bridge.supervisor", "reconnect ignored while recovering");
            return;
        }
        info!(
            target: "bridge.supervisor",
            attempts = self.state.reconnect_attempts,
            "external reconnect trigger"
        );
        self.timers.cancel(TimerKind::Reconnect);
        self.state.reconnect_attempts = 0;
        self.state.is_reconnecting = false;
        self.try_connect();
    }

    /// Full teardown followed by a fresh start, keeping this supervisor.
    pub fn reinitialize(&mut self) -> BridgeResult<()> {
        if self.state.is_destroyed {
            return Err(BridgeError::Destroyed);
        }
        info!(target: "bridge.supervisor", "reinitializing");
        self.cleanup(CleanupMode::Full);
        self.state.reconnect_attempts = 0;
        self.state.recovery_attempts = 0;
        self.set_phase(Phase::Disconnected);
        self.ui.initialize(&self.dispatcher)?;
        self.connect_initial()
    }

    /// Idempotent teardown.
    pub fn destroy(&mut self) {
        if !self.state.is_destroyed {
            self.state.is_destroyed = true;
            self.set_phase(Phase::Destroyed);
        }
        self.cleanup(CleanupMode::Full);
    }

    pub fn send_message(&self, message: OutboundMessage) -> SendOutcome {
        self.dispatcher.send_message(message)
    }

    pub fn handle_shortcut(&mut self, action: ShortcutAction) {
        if self.state.is_destroyed {
            return;
        }
        match action {
            ShortcutAction::ShowChangedFiles => {
                if self.state.is_in_recovery {
                    debug!(target: "bridge.supervisor", "shortcut ignored while recovering");
                    return;
                }
                let result = self
                    .ui
                    .get_instance(&self.dispatcher)
                    .and_then(|ui| ui.handle_show_changed_files());
                if let Err(err) = result {
                    self.counters.handler_errors += 1;
                    warn!(target: "bridge.supervisor", error = %err, "show changed files failed");
                }
            }
            ShortcutAction::PushNow => {
                let outcome = self.dispatcher.send_message(OutboundMessage::business(
                    "pushNow",
                    json!({ "url": self.page_url }),
                ));
                debug!(target: "bridge.supervisor", ?outcome, "push requested from shortcut");
            }
        }
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.is_destroyed
    }

    pub fn is_in_recovery(&self) -> bool {
        self.state.is_in_recovery
    }

    pub fn dispatcher(&self) -> &Arc<MessageDispatcher> {
        &self.dispatcher
    }

    pub fn status(&self) -> SupervisorStatus {
        SupervisorStatus {
            phase: self.state.phase,
            channel: self.state.channel_id().map(|id| id.to_string()),
            reconnect_attempts: self.state.reconnect_attempts,
            recovery_attempts: self.state.recovery_attempts,
            in_recovery: self.state.is_in_recovery,
            destroyed: self.state.is_destroyed,
            last_heartbeat_ack: self.state.last_heartbeat_ack,
            messages: self.counters,
            dispatcher: self.dispatcher.stats(),
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.state.phase != phase {
            debug!(target: "bridge.supervisor", from = %self.state.phase, to = %phase, "phase change");
            self.state.phase = phase;
        }
    }

    fn open_channel(&self) -> Result<Arc<dyn Channel>, ChannelError> {
        self.collaborators
            .connector
            .open(self.events.for_new_channel())
    }

    fn classify_open_failure(&self, err: &ChannelError) -> Classification {
        classify_disconnect(
            err.message(),
            self.collaborators.probe.is_available(),
            None,
            self.config.flap_window,
        )
    }

    /// `Connecting` on construction or reinitialize; fast-fails to the caller.
    fn connect_initial(&mut self) -> BridgeResult<()> {
        self.set_phase(Phase::Connecting);
        match self.open_channel() {
            Ok(channel) => {
                self.on_connected(channel);
                Ok(())
            }
            Err(err) => {
                let cause = self.classify_open_failure(&err);
                if cause.is_context_invalidated() {
                    info!(target: "bridge.supervisor", error = %err, ?cause, "initial connect hit invalidated context");
                    self.enter_recovery(cause);
                    return Ok(());
                }
                warn!(target: "bridge.supervisor", error = %err, ?cause, "initial connect failed");
                self.set_phase(Phase::Disconnected);
                self.notify(NoticeKind::Error, CONNECTION_ERROR_NOTICE);
                Err(err.into())
            }
        }
    }

    /// Connect attempt driven by a timer or trigger; failures stay local.
    fn try_connect(&mut self) {
        self.set_phase(Phase::Connecting);
        match self.open_channel() {
            Ok(channel) => self.on_connected(channel),
            Err(err) => {
                let cause = self.classify_open_failure(&err);
                debug!(
                    target: "bridge.supervisor",
                    error = %err,
                    ?cause,
                    attempt = self.state.reconnect_attempts,
                    "connect attempt failed"
                );
                if cause.is_context_invalidated() {
                    self.enter_recovery(cause);
                } else {
                    self.schedule_reconnect();
                }
            }
        }
    }

    fn on_connected(&mut self, channel: Arc<dyn Channel>) {
        let now = self.collaborators.clock.now();
        info!(
            target: "bridge.supervisor",
            channel = %channel.id(),
            after_attempts = self.state.reconnect_attempts,
            "connected"
        );
        self.state.channel = Some(Arc::clone(&channel));
        self.state.is_reconnecting = false;
        self.state.reconnect_attempts = 0;
        self.timers.cancel(TimerKind::Reconnect);
        self.set_phase(Phase::Connected);

        self.timers
            .arm(TimerKind::Heartbeat, now + self.config.heartbeat_interval);
        if !self.timers.is_armed(TimerKind::HealthCheck) {
            self.timers
                .arm(TimerKind::HealthCheck, now + self.config.health_check_interval);
        }

        self.dispatcher.update_channel(Some(channel));
        self.dispatcher.send_message(OutboundMessage::ContentReady {
            url: self.page_url.clone(),
        });
    }

    /// Drops the current channel and routes by classified cause.
    fn handle_disconnect(&mut self, error: Option<String>) {
        let now = self.collaborators.clock.now();
        let since_previous = self
            .state
            .last_disconnect
            .map(|at| now.saturating_duration_since(at));
        self.state.last_disconnect = Some(now);

        if let Some(channel) = self.state.channel.take() {
            channel.close();
        }
        self.dispatcher.detach();
        self.timers.cancel(TimerKind::Heartbeat);

        let cause = classify_disconnect(
            error.as_deref(),
            self.collaborators.probe.is_available(),
            since_previous,
            self.config.flap_window,
        );
        info!(
            target: "bridge.supervisor",
            error = error.as_deref().unwrap_or(""),
            ?cause,
            since_previous_ms = since_previous.map(|gap| gap.as_millis() as u64),
            "disconnected"
        );
        if self.state.phase == Phase::Recovering {
            self.recovery_channel_lost();
            return;
        }
        if cause.is_context_invalidated() {
            self.enter_recovery(cause);
        } else {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(&mut self) {
        if self.state.is_destroyed || self.state.has_live_channel() {
            return;
        }
        if self.timers.is_armed(TimerKind::Reconnect) {
            return;
        }
        if self.backoff.is_exhausted(self.state.reconnect_attempts) {
            warn!(
                target: "bridge.supervisor",
                attempts = self.state.reconnect_attempts,
                "reconnect budget exhausted, waiting for an external trigger"
            );
            self.state.is_reconnecting = false;
            self.timers.cancel(TimerKind::HealthCheck);
            self.set_phase(Phase::Disconnected);
            self.notify(NoticeKind::Error, CONNECTION_ERROR_NOTICE);
            return;
        }
        self.state.reconnect_attempts += 1;
        let delay = self.backoff.delay_for(self.state.reconnect_attempts);
        self.timers
            .arm(TimerKind::Reconnect, self.collaborators.clock.now() + delay);
        self.state.is_reconnecting = true;
        self.set_phase(Phase::Reconnecting);
        debug!(
            target: "bridge.supervisor",
            attempt = self.state.reconnect_attempts,
            max = self.backoff.max_attempts(),
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        );
    }

    fn on_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::Reconnect => {
                if self.state.has_live_channel() {
                    self.state.is_reconnecting = false;
                    return;
                }
                self.try_connect();
            }
            TimerKind::Heartbeat => self.on_heartbeat(),
            TimerKind::HealthCheck => self.on_health_check(),
            TimerKind::RecoverySafety => self.on_recovery_safety_timeout(),
            TimerKind::RecoveryRetry => {
                if self.state.phase == Phase::Recovering {
                    self.attempt_recovery();
                }
            }
            TimerKind::RecoverySettle => {
                if self.state.phase == Phase::Recovering {
                    self.finish_recovery();
                }
            }
        }
    }

    fn on_heartbeat(&mut self) {
        let Some(channel) = self.state.channel.clone() else {
            debug!(target: "bridge.heartbeat", "no channel at heartbeat");
            self.schedule_reconnect();
            return;
        };
        let message = OutboundMessage::Heartbeat {
            timestamp: self.collaborators.clock.epoch_millis(),
        };
        match channel.send(&message) {
            Ok(()) => {
                self.timers.arm(
                    TimerKind::Heartbeat,
                    self.collaborators.clock.now() + self.config.heartbeat_interval,
                );
            }
            Err(err) => {
                warn!(target: "bridge.heartbeat", channel = %channel.id(), error = %err, "heartbeat send failed");
                self.handle_disconnect(err.message().map(str::to_string));
            }
        }
    }

    fn on_health_check(&mut self) {
        self.timers.arm(
            TimerKind::HealthCheck,
            self.collaborators.clock.now() + self.config.health_check_interval,
        );
        let status = self.dispatcher.get_connection_status();
        if status.connected || status.queued_messages == 0 || self.state.is_in_recovery {
            return;
        }
        debug!(
            target: "bridge.heartbeat",
            queued = status.queued_messages,
            "health check found queued messages without a channel"
        );
        if self.state.channel.is_some() {
            // Dispatcher lost the channel before the supervisor heard about it.
            self.handle_disconnect(None);
        } else {
            self.schedule_reconnect();
        }
    }

    fn on_reconnect_requested(&mut self, request: ReconnectRequest) {
        if self.state.phase == Phase::Recovering {
            // The dispatcher stays detached until recovery completes.
            return;
        }
        if self.state.channel.is_some() {
            self.handle_disconnect(request.error);
            return;
        }
        if self.state.is_reconnecting || self.state.budget_exhausted() {
            return;
        }
        self.schedule_reconnect();
    }

    fn handle_inbound(&mut self, text: &str) {
        let envelope = match InboundEnvelope::decode(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                self.counters.malformed += 1;
                warn!(target: "bridge.supervisor", error = %err, "dropping undecodable message");
                return;
            }
        };
        let kind = envelope.message.kind().to_string();

        if self.state.is_in_recovery && envelope.message.requires_ui() {
            self.counters.suppressed += 1;
            debug!(target: "bridge.recovery", kind = %kind, "suppressed while recovering");
            return;
        }
        if let Some(id) = &envelope.message_id {
            if !self.dedup.observe(id, self.collaborators.clock.now()) {
                self.counters.duplicates += 1;
                debug!(target: "bridge.supervisor", kind = %kind, message_id = %id, "duplicate message acknowledged");
                return;
            }
        }

        let result = match envelope.message {
            InboundMessage::HeartbeatResponse { timestamp } => {
                self.state.last_heartbeat_ack = Some(timestamp);
                debug!(target: "bridge.heartbeat", timestamp, "heartbeat acknowledged");
                Ok(())
            }
            message => self.ui.get_instance(&self.dispatcher).and_then(|ui| match message {
                InboundMessage::StatusUpdate { status } => ui.update_upload_status(&status),
                InboundMessage::SettingsChanged { valid } => ui.update_button_state(valid),
                InboundMessage::PushTrigger => ui.handle_show_changed_files(),
                InboundMessage::Other { kind, payload } => ui.handle_message(&kind, &payload),
                InboundMessage::HeartbeatResponse { .. } => Ok(()),
            }),
        };
        match result {
            Ok(()) => self.counters.forwarded += 1,
            Err(err) => {
                self.counters.handler_errors += 1;
                warn!(target: "bridge.supervisor", kind = %kind, error = %err, "message handler failed");
            }
        }
    }

    /// Shows a notice through the live UI, if there is one.
    fn notify(&mut self, kind: NoticeKind, text: &str) {
        let duration = self.config.notice_duration;
        self.notify_for(kind, text, duration);
    }

    fn notify_for(&mut self, kind: NoticeKind, text: &str, duration: Duration) -> bool {
        match self.ui.current() {
            Some(ui) => match ui.show_notification(kind, text, duration) {
                Ok(()) => true,
                Err(err) => {
                    warn!(target: "bridge.ui", error = %err, "notification failed");
                    false
                }
            },
            None => false,
        }
    }

    /// Stops timers, closes the channel, clears the dedup cache and releases
    /// the UI. Safe to call repeatedly.
    fn cleanup(&mut self, mode: CleanupMode) {
        self.timers.cancel(TimerKind::Reconnect);
        self.timers.cancel(TimerKind::Heartbeat);
        self.timers.cancel(TimerKind::HealthCheck);
        if mode == CleanupMode::Full {
            self.timers.cancel_all();
            self.state.is_in_recovery = false;
        }
        if let Some(channel) = self.state.channel.take() {
            channel.close();
            debug!(target: "bridge.supervisor", channel = %channel.id(), ?mode, "channel closed");
        }
        self.dispatcher.detach();
        self.dedup.clear();
        self.ui.reset_instance();
        self.state.is_reconnecting = false;
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.destroy();
    }
}
