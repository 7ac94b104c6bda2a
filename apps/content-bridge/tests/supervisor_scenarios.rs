use std::sync::Arc;
use std::time::Duration;

use bridge_proto::{InboundEnvelope, InboundMessage, OutboundMessage, UploadState, UploadStatus};
use bridge_transport::{event_stream, ChannelError, ChannelEvent, EventReceiver, SimulatedBackground};
use content_bridge::clock::ManualClock;
use content_bridge::config::Config;
use content_bridge::dispatcher::{ReconnectSignal, SendOutcome};
use content_bridge::supervisor::{
    Collaborators, Input, Phase, Supervisor, SupervisorStatus, TimerKind,
    CONNECTION_ERROR_NOTICE, REFRESH_REQUIRED_NOTICE, RELOAD_NOTICE,
};
use content_bridge::testing::{RecordingFallback, RecordingUiFactory, UiCall};
use content_bridge::ui::NoticeKind;
use content_bridge::BridgeError;
use serde_json::json;

const PAGE: &str = "https://leetcode.com/problems/two-sum/";
const RECEIVING_END: &str = "Could not establish connection. Receiving end does not exist.";
const INVALIDATED: &str = "Extension context invalidated.";

struct Harness {
    supervisor: Supervisor,
    background: Arc<SimulatedBackground>,
    ui: Arc<RecordingUiFactory>,
    fallback: Arc<RecordingFallback>,
    clock: Arc<ManualClock>,
    events: EventReceiver,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(Config::default())
    }

    fn with_config(config: Config) -> Self {
        let background = SimulatedBackground::new();
        let ui = RecordingUiFactory::new();
        let fallback = RecordingFallback::new();
        let clock = ManualClock::new();
        let (sender, events) = event_stream();
        let collaborators = Collaborators {
            connector: background.clone(),
            probe: background.clone(),
            ui: ui.clone(),
            fallback: fallback.clone(),
            clock: clock.clone(),
        };
        let supervisor = Supervisor::new(
            Arc::new(config),
            collaborators,
            sender,
            Arc::new(ReconnectSignal::default()),
            Some(PAGE.to_string()),
        );
        Self {
            supervisor,
            background,
            ui,
            fallback,
            clock,
            events,
        }
    }

    fn started() -> Self {
        let mut harness = Self::new();
        harness.supervisor.start().expect("start");
        harness.pump();
        harness
    }

    fn pump(&mut self) {
        self.supervisor.pump(&mut self.events);
    }

    fn elapse(&mut self, by: Duration) {
        self.clock.advance(by);
        self.supervisor.fire_due_timers();
        self.pump();
    }

    fn disconnect(&mut self, error: Option<&str>) {
        assert!(self.background.disconnect(error).is_some(), "no open channel");
        self.pump();
    }

    fn push(&mut self, envelope: InboundEnvelope) {
        assert!(self.background.push(&envelope), "no open channel");
        self.pump();
    }

    fn phase(&self) -> Phase {
        self.supervisor.phase()
    }

    fn status(&self) -> SupervisorStatus {
        self.supervisor.status()
    }

    fn upload_calls(&self) -> usize {
        self.ui
            .calls()
            .iter()
            .filter(|call| matches!(call, UiCall::UploadStatus(_)))
            .count()
    }
}

fn status_update(id: &str) -> InboundEnvelope {
    InboundEnvelope::new(InboundMessage::StatusUpdate {
        status: UploadStatus {
            state: UploadState::Uploading,
            message: None,
            file_count: Some(2),
        },
    })
    .with_id(id)
}

#[test]
fn transient_disconnects_spaced_apart_only_reconnect() {
    let mut h = Harness::started();
    for round in 0..4 {
        h.disconnect(Some(RECEIVING_END));
        assert_eq!(h.phase(), Phase::Reconnecting, "round {round}");
        assert!(!h.status().in_recovery);

        h.elapse(Duration::from_secs(2));
        assert_eq!(h.phase(), Phase::Connected, "round {round}");
    }
    assert_eq!(h.background.open_count(), 5);
    assert!(!h
        .ui
        .notifications()
        .iter()
        .any(|(_, text)| text == RELOAD_NOTICE));
}

#[test]
fn disconnects_inside_flap_window_enter_recovery_whatever_the_text() {
    for second_error in [Some(RECEIVING_END), None, Some("unexpected port failure")] {
        let mut h = Harness::started();
        h.disconnect(Some(RECEIVING_END));
        assert_eq!(h.phase(), Phase::Reconnecting);

        h.supervisor.advance(Input::FocusGained);
        assert_eq!(h.phase(), Phase::Connected);

        h.elapse(Duration::from_millis(300));
        h.disconnect(second_error);
        assert_eq!(h.phase(), Phase::Recovering, "error {second_error:?}");
        assert!(h.status().in_recovery);
        assert!(h
            .ui
            .notifications()
            .contains(&(NoticeKind::Warning, RELOAD_NOTICE.to_string())));

        h.elapse(Duration::from_millis(500));
        assert_eq!(h.phase(), Phase::Connected);
        assert!(!h.status().in_recovery);
        assert_eq!(h.ui.live_instances(), 1);
    }
}

#[test]
fn reconnect_budget_caps_at_five_until_focus_returns() {
    let mut h = Harness::started();
    for _ in 0..5 {
        h.background
            .fail_next_open(ChannelError::Runtime(RECEIVING_END.to_string()));
    }
    h.disconnect(Some(RECEIVING_END));

    let mut delay = Duration::from_secs(2);
    for attempt in 1..=5 {
        assert_eq!(h.phase(), Phase::Reconnecting);
        assert_eq!(h.status().reconnect_attempts, attempt);
        h.elapse(delay);
        assert!(h.status().reconnect_attempts <= 5);
        delay *= 2;
    }

    assert_eq!(h.phase(), Phase::Disconnected);
    assert_eq!(h.status().reconnect_attempts, 5);
    assert!(h.supervisor.next_deadline().is_none(), "no sixth timer");
    assert_eq!(
        h.ui.notifications(),
        vec![(NoticeKind::Error, CONNECTION_ERROR_NOTICE.to_string())]
    );

    h.elapse(Duration::from_secs(600));
    assert_eq!(h.background.open_count(), 1);

    h.supervisor.advance(Input::FocusGained);
    h.pump();
    assert_eq!(h.phase(), Phase::Connected);
    assert_eq!(h.status().reconnect_attempts, 0);
    assert_eq!(h.background.open_count(), 2);
}

#[test]
fn repeated_teardown_is_idempotent() {
    let mut h = Harness::started();
    h.disconnect(Some(RECEIVING_END));
    assert!(h.supervisor.armed_timers().contains(&TimerKind::Reconnect));

    for _ in 0..3 {
        h.supervisor.destroy();
    }
    h.supervisor.advance(Input::Destroy);

    assert_eq!(h.phase(), Phase::Destroyed);
    assert!(h.supervisor.armed_timers().is_empty());
    assert_eq!(h.ui.live_instances(), 0);
    let cleanups = h
        .ui
        .calls()
        .into_iter()
        .filter(|call| *call == UiCall::Cleanup)
        .count();
    assert_eq!(cleanups, 1);

    h.elapse(Duration::from_secs(120));
    assert_eq!(h.background.open_count(), 1);
    assert!(matches!(h.supervisor.start(), Err(BridgeError::Destroyed)));
}

#[test]
fn destroy_closes_the_live_channel_once() {
    let mut h = Harness::started();
    assert!(h.background.current_channel().is_some());
    h.supervisor.destroy();
    h.supervisor.destroy();
    assert!(h.background.current_channel().is_none());
    assert!(h.supervisor.next_deadline().is_none());
}

#[test]
fn messages_queued_while_disconnected_flush_in_order() {
    let mut h = Harness::started();
    h.background.clear_delivered();
    h.disconnect(Some(RECEIVING_END));

    let messages: Vec<_> = (0..3)
        .map(|n| OutboundMessage::business("pushFile", json!({ "n": n })))
        .collect();
    for message in &messages {
        assert_eq!(h.supervisor.send_message(message.clone()), SendOutcome::Queued);
    }
    h.pump();
    assert_eq!(h.status().dispatcher.queued, 3);
    assert_eq!(h.phase(), Phase::Reconnecting);

    h.elapse(Duration::from_secs(2));
    let delivered = h.background.delivered_business();
    assert_eq!(&delivered[..3], &messages[..]);
    assert!(matches!(delivered[3], OutboundMessage::ContentReady { .. }));
    assert_eq!(h.status().dispatcher.queued, 0);
}

#[test]
fn duplicate_ids_inside_window_forward_once() {
    let mut h = Harness::started();
    h.push(status_update("status-1"));
    h.elapse(Duration::from_secs(1));
    h.push(status_update("status-1"));

    assert_eq!(h.upload_calls(), 1);
    assert_eq!(h.status().messages.duplicates, 1);

    h.elapse(Duration::from_secs(5));
    h.push(status_update("status-1"));
    assert_eq!(h.upload_calls(), 2);
}

#[test]
fn recovery_suppresses_ui_messages_but_not_heartbeat_responses() {
    let mut h = Harness::with_config(Config {
        recovery_settle_delay: Duration::from_secs(5),
        ..Config::default()
    });
    h.supervisor.start().expect("start");
    h.disconnect(Some(INVALIDATED));
    assert_eq!(h.phase(), Phase::Recovering);
    assert!(h.status().in_recovery);
    h.ui.clear_calls();

    h.push(status_update("s-1"));
    h.push(InboundEnvelope::new(InboundMessage::SettingsChanged { valid: true }));
    h.push(InboundEnvelope::new(InboundMessage::PushTrigger));
    h.push(InboundEnvelope::new(InboundMessage::Other {
        kind: "premiumStatus".into(),
        payload: json!({ "active": true }),
    }));
    assert!(h.ui.calls().is_empty());
    assert_eq!(h.status().messages.suppressed, 4);

    h.push(InboundEnvelope::new(InboundMessage::HeartbeatResponse { timestamp: 42 }));
    assert_eq!(h.status().last_heartbeat_ack, Some(42));

    h.elapse(Duration::from_secs(5));
    assert_eq!(h.phase(), Phase::Connected);

    // The suppressed id was never recorded, so its redelivery goes through.
    h.push(status_update("s-1"));
    assert_eq!(h.upload_calls(), 1);
}

#[test]
fn runtime_unavailable_at_start_recovers_with_one_notice() {
    let mut h = Harness::new();
    h.background.set_runtime_available(false);

    assert!(h.supervisor.start().is_ok());
    assert_eq!(h.phase(), Phase::Recovering);
    assert!(h.status().in_recovery);
    assert_eq!(
        h.ui.notifications(),
        vec![(NoticeKind::Warning, RELOAD_NOTICE.to_string())]
    );
    assert!(h.supervisor.armed_timers().contains(&TimerKind::RecoveryRetry));

    h.background.set_runtime_available(true);
    h.elapse(Duration::from_secs(2));
    assert_eq!(h.phase(), Phase::Recovering);
    h.elapse(Duration::from_millis(500));
    assert_eq!(h.phase(), Phase::Connected);
    assert!(h
        .background
        .delivered()
        .iter()
        .any(|message| matches!(message, OutboundMessage::ContentReady { .. })));
}

#[test]
fn recovery_exhaustion_destroys_with_persistent_notice() {
    let mut h = Harness::new();
    h.background.set_runtime_available(false);
    h.supervisor.start().expect("start");

    h.elapse(Duration::from_secs(2));
    assert_eq!(h.status().recovery_attempts, 2);
    h.elapse(Duration::from_secs(2));

    assert_eq!(h.phase(), Phase::Destroyed);
    assert!(h.supervisor.next_deadline().is_none());
    assert!(h
        .ui
        .notifications()
        .contains(&(NoticeKind::Error, REFRESH_REQUIRED_NOTICE.to_string())));
    assert!(h.fallback.notices().is_empty());

    // Terminal: focus does not bring it back.
    h.background.set_runtime_available(true);
    h.supervisor.advance(Input::FocusGained);
    assert_eq!(h.phase(), Phase::Destroyed);
    assert_eq!(h.background.open_count(), 0);

    h.supervisor.destroy();
    assert_eq!(h.ui.live_instances(), 0);
}

#[test]
fn refresh_notice_falls_back_when_ui_cannot_be_built() {
    let mut h = Harness::new();
    h.background.set_runtime_available(false);
    h.supervisor.start().expect("start");
    h.ui.fail_builds(1);

    h.elapse(Duration::from_secs(2));
    h.elapse(Duration::from_secs(2));

    assert_eq!(h.phase(), Phase::Destroyed);
    assert_eq!(h.fallback.notices(), vec![REFRESH_REQUIRED_NOTICE.to_string()]);
}

#[test]
fn receiving_end_send_failure_with_runtime_reconnects() {
    let mut h = Harness::started();
    h.background.fail_sends(Some(RECEIVING_END));

    let outcome = h
        .supervisor
        .send_message(OutboundMessage::business("pushFile", json!({})));
    assert_eq!(outcome, SendOutcome::Queued);
    h.pump();

    assert_eq!(h.phase(), Phase::Reconnecting);
    assert!(!h.status().in_recovery);

    h.background.fail_sends(None);
    h.elapse(Duration::from_secs(2));
    assert_eq!(h.phase(), Phase::Connected);
    assert_eq!(h.status().dispatcher.queued, 0);
}

#[test]
fn heartbeat_failure_with_invalidated_context_starts_recovery() {
    let mut h = Harness::started();
    h.background.fail_sends(Some(INVALIDATED));

    h.elapse(Duration::from_secs(30));
    assert_eq!(h.phase(), Phase::Recovering);

    h.background.fail_sends(None);
    h.elapse(Duration::from_secs(2));
    h.elapse(Duration::from_millis(500));
    assert_eq!(h.phase(), Phase::Connected);
}

#[test]
fn heartbeat_responses_update_liveness() {
    let mut h = Harness::started();
    h.elapse(Duration::from_secs(30));
    assert_eq!(h.status().last_heartbeat_ack, Some(1_700_000_030_000));
    assert_eq!(h.upload_calls(), 0);
}

#[test]
fn safety_timeout_alone_lifts_suppression() {
    let mut h = Harness::with_config(Config {
        recovery_settle_delay: Duration::from_secs(120),
        ..Config::default()
    });
    h.supervisor.start().expect("start");
    h.disconnect(Some(INVALIDATED));
    assert!(h.status().in_recovery);

    h.elapse(Duration::from_secs(29));
    assert!(h.status().in_recovery);

    h.elapse(Duration::from_secs(1));
    assert!(!h.status().in_recovery);
    assert_eq!(h.phase(), Phase::Recovering);
    assert!(h.supervisor.armed_timers().contains(&TimerKind::RecoverySettle));

    h.push(status_update("late"));
    assert_eq!(h.upload_calls(), 1);
}

#[test]
fn health_check_reconnects_when_messages_pile_up() {
    let mut h = Harness::started();
    // Evicted silently: no disconnect event reaches the content side.
    h.background.sever();
    h.supervisor
        .send_message(OutboundMessage::business("pushFile", json!({})));

    h.elapse(Duration::from_secs(10));
    assert_eq!(h.phase(), Phase::Reconnecting);

    h.elapse(Duration::from_secs(2));
    assert_eq!(h.phase(), Phase::Connected);
    assert_eq!(h.status().dispatcher.queued, 0);
}

#[test]
fn events_from_replaced_channels_are_ignored() {
    let mut h = Harness::started();
    let stale = h.background.current_channel().expect("channel");
    h.disconnect(Some(RECEIVING_END));
    h.elapse(Duration::from_secs(2));
    assert_eq!(h.phase(), Phase::Connected);

    h.supervisor.advance(Input::Channel(ChannelEvent::Disconnected {
        channel: stale,
        error: None,
    }));
    assert_eq!(h.phase(), Phase::Connected);
    assert_eq!(h.status().messages.stale_events, 1);
}

#[test]
fn handler_errors_and_garbage_do_not_disconnect() {
    let mut h = Harness::started();
    let channel = h.background.current_channel();

    h.ui.fail_handlers(true);
    h.push(status_update("s-9"));
    assert!(h.background.push_raw("not json"));
    h.pump();

    let status = h.status();
    assert_eq!(status.messages.handler_errors, 1);
    assert_eq!(status.messages.malformed, 1);
    assert_eq!(h.phase(), Phase::Connected);
    assert_eq!(h.background.current_channel(), channel);
}

#[test]
fn reconnect_is_a_no_op_while_connected() {
    let mut h = Harness::started();
    h.supervisor.advance(Input::FocusGained);
    h.supervisor.advance(Input::RuntimeReconnect);
    assert_eq!(h.background.open_count(), 1);
    assert!(!h.supervisor.armed_timers().contains(&TimerKind::Reconnect));
}

#[test]
fn initial_fast_fail_is_reported_to_the_caller() {
    let mut h = Harness::new();
    h.background
        .fail_next_open(ChannelError::Runtime("Unexpected failure".into()));

    assert!(matches!(h.supervisor.start(), Err(BridgeError::Connect(_))));
    assert_eq!(h.phase(), Phase::Disconnected);
    assert_eq!(
        h.ui.notifications(),
        vec![(NoticeKind::Error, CONNECTION_ERROR_NOTICE.to_string())]
    );

    h.supervisor.advance(Input::FocusGained);
    assert_eq!(h.phase(), Phase::Connected);
}

#[test]
fn reinitialize_rebuilds_ui_and_channel() {
    let mut h = Harness::started();
    h.supervisor.advance(Input::Reinitialize);
    h.pump();

    assert_eq!(h.phase(), Phase::Connected);
    assert_eq!(h.background.open_count(), 2);
    assert_eq!(h.ui.instances_built(), 2);
    assert_eq!(h.ui.live_instances(), 1);
}
