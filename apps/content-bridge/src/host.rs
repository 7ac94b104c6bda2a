//! Page-level glue. Owns at most one supervisor and routes page events
//! (DOM ready, focus, unload, keyboard shortcuts) to it.

use std::sync::Arc;

use bridge_transport::{ChannelEvent, EventSender, RuntimeProbe};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::Config;
use crate::dispatcher::ReconnectSignal;
use crate::error::BridgeResult;
use crate::storage::{discard_stale_state, Storage};
use crate::supervisor::{Collaborators, Input, ShortcutAction, Supervisor, SupervisorStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    DomReady,
    FocusGained,
    VisibilityVisible,
    /// The extension runtime signalled that it is reachable again.
    RuntimeReconnect,
    Unload,
    Shortcut(ShortcutAction),
}

pub struct BridgeHost {
    config: Arc<Config>,
    collaborators: Collaborators,
    storage: Arc<dyn Storage>,
    events: EventSender,
    signal: Arc<ReconnectSignal>,
    page_url: Url,
    supervisor: Option<Supervisor>,
    last_status: Option<SupervisorStatus>,
    starts: u64,
}

impl BridgeHost {
    pub fn new(
        config: Arc<Config>,
        collaborators: Collaborators,
        storage: Arc<dyn Storage>,
        events: EventSender,
        page_url: Url,
    ) -> Self {
        Self {
            config,
            collaborators,
            storage,
            events,
            signal: Arc::new(ReconnectSignal::default()),
            page_url,
            supervisor: None,
            last_status: None,
            starts: 0,
        }
    }

    pub fn is_target_page(&self) -> bool {
        self.page_url
            .host_str()
            .is_some_and(|host| self.config.is_target_host(host))
    }

    /// Creates and starts a supervisor unless a live one already exists.
    /// Returns whether a new supervisor was started.
    pub async fn start(&mut self) -> BridgeResult<bool> {
        if self.supervisor.as_ref().is_some_and(|sup| !sup.is_destroyed()) {
            return Ok(false);
        }
        if !self.is_target_page() {
            debug!(target: "bridge.host", url = %self.page_url, "not a target page, staying idle");
            return Ok(false);
        }
        if !self.collaborators.probe.is_available() {
            info!(target: "bridge.host", "extension runtime unavailable, deferring start");
            return Ok(false);
        }

        discard_stale_state(self.storage.as_ref()).await;

        self.starts += 1;
        let mut supervisor = Supervisor::new(
            Arc::clone(&self.config),
            self.collaborators.clone(),
            self.events.clone(),
            Arc::clone(&self.signal),
            Some(self.page_url.to_string()),
        );
        let result = supervisor.start();
        // Kept even on failure so a later focus event can retry.
        self.supervisor = Some(supervisor);
        info!(target: "bridge.host", generation = self.starts, ok = result.is_ok(), "supervisor started");
        result.map(|()| true)
    }

    pub fn stop(&mut self) {
        if let Some(mut supervisor) = self.supervisor.take() {
            self.last_status = Some(supervisor.status());
            supervisor.destroy();
            info!(target: "bridge.host", "supervisor stopped");
        }
    }

    pub async fn restart(&mut self) -> BridgeResult<bool> {
        self.stop();
        self.start().await
    }

    pub async fn handle(&mut self, event: HostEvent) {
        debug!(target: "bridge.host", ?event, "host event");
        match event {
            HostEvent::DomReady => self.start_logged().await,
            HostEvent::FocusGained | HostEvent::VisibilityVisible => match self.supervisor.as_mut() {
                Some(supervisor) => supervisor.advance(Input::FocusGained),
                None => self.start_logged().await,
            },
            HostEvent::RuntimeReconnect => match self.supervisor.as_mut() {
                Some(supervisor) if !supervisor.is_destroyed() => {
                    supervisor.advance(Input::RuntimeReconnect)
                }
                _ => {
                    if let Err(err) = self.restart().await {
                        warn!(target: "bridge.host", error = %err, "restart after runtime reconnect failed");
                    }
                }
            },
            HostEvent::Unload => self.stop(),
            HostEvent::Shortcut(action) => match self.supervisor.as_mut() {
                Some(supervisor) => supervisor.handle_shortcut(action),
                None => debug!(target: "bridge.host", ?action, "shortcut without supervisor"),
            },
        }
    }

    async fn start_logged(&mut self) {
        if let Err(err) = self.start().await {
            warn!(target: "bridge.host", error = %err, "failed to start supervisor");
        }
    }

    pub fn on_channel_event(&mut self, event: ChannelEvent) {
        if let Some(supervisor) = self.supervisor.as_mut() {
            supervisor.advance(Input::Channel(event));
        }
    }

    pub fn on_reconnect_signal(&mut self) {
        let Some(request) = self.signal.take() else {
            return;
        };
        if let Some(supervisor) = self.supervisor.as_mut() {
            supervisor.advance(Input::ReconnectRequested(request));
        }
    }

    pub fn fire_due_timers(&mut self) -> usize {
        self.supervisor
            .as_mut()
            .map_or(0, |supervisor| supervisor.fire_due_timers())
    }

    pub fn next_deadline(&self) -> Option<std::time::Instant> {
        self.supervisor
            .as_ref()
            .and_then(|supervisor| supervisor.next_deadline())
    }

    pub fn signal(&self) -> Arc<ReconnectSignal> {
        Arc::clone(&self.signal)
    }

    pub fn supervisor(&self) -> Option<&Supervisor> {
        self.supervisor.as_ref()
    }

    pub fn supervisor_mut(&mut self) -> Option<&mut Supervisor> {
        self.supervisor.as_mut()
    }

    pub fn status(&self) -> Option<SupervisorStatus> {
        self.supervisor.as_ref().map(Supervisor::status)
    }

    /// Status of the most recently stopped supervisor.
    pub fn last_status(&self) -> Option<&SupervisorStatus> {
        self.last_status.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.starts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::InMemoryStorage;
    use crate::supervisor::Phase;
    use crate::testing::{RecordingFallback, RecordingUiFactory};
    use bridge_transport::{event_stream, SimulatedBackground};
    use serde_json::json;

    struct Fixture {
        host: BridgeHost,
        background: Arc<SimulatedBackground>,
        storage: Arc<InMemoryStorage>,
    }

    fn fixture(url: &str) -> Fixture {
        let background = SimulatedBackground::new();
        let storage = InMemoryStorage::new();
        let (sender, _receiver) = event_stream();
        let collaborators = Collaborators {
            connector: background.clone(),
            probe: background.clone(),
            ui: RecordingUiFactory::new(),
            fallback: RecordingFallback::new(),
            clock: ManualClock::new(),
        };
        let host = BridgeHost::new(
            Arc::new(Config::default()),
            collaborators,
            storage.clone(),
            sender,
            Url::parse(url).unwrap(),
        );
        Fixture {
            host,
            background,
            storage,
        }
    }

    #[tokio::test]
    async fn dom_ready_starts_on_target_page_and_discards_stale_state() {
        let mut fx = fixture("https://leetcode.com/problems/two-sum/");
        fx.storage.set("pendingPushState", json!(true)).await;

        fx.host.handle(HostEvent::DomReady).await;

        assert_eq!(fx.host.status().unwrap().phase, Phase::Connected);
        assert_eq!(fx.background.open_count(), 1);
        assert!(!fx.storage.contains("pendingPushState").await);

        // A second DomReady does not create another supervisor.
        fx.host.handle(HostEvent::DomReady).await;
        assert_eq!(fx.host.generation(), 1);
    }

    #[tokio::test]
    async fn other_sites_stay_idle() {
        let mut fx = fixture("https://example.com/");
        assert!(!fx.host.start().await.unwrap());
        assert!(fx.host.supervisor().is_none());
        assert_eq!(fx.background.open_count(), 0);
    }

    #[tokio::test]
    async fn start_waits_for_runtime_then_focus_starts_it() {
        let mut fx = fixture("https://leetcode.com/problems/");
        fx.background.set_runtime_available(false);
        fx.host.handle(HostEvent::DomReady).await;
        assert!(fx.host.supervisor().is_none());

        fx.background.set_runtime_available(true);
        fx.host.handle(HostEvent::FocusGained).await;
        assert_eq!(fx.host.status().unwrap().phase, Phase::Connected);
    }

    #[tokio::test]
    async fn unload_destroys_and_restart_builds_a_new_supervisor() {
        let mut fx = fixture("https://leetcode.com/");
        fx.host.start().await.unwrap();
        let first = fx.background.current_channel();

        assert!(fx.host.restart().await.unwrap());
        assert_eq!(fx.host.generation(), 2);
        assert_ne!(fx.background.current_channel(), first);

        fx.host.handle(HostEvent::Unload).await;
        assert!(fx.host.supervisor().is_none());
        assert!(fx.host.next_deadline().is_none());
    }

    #[tokio::test]
    async fn push_shortcut_is_sent_as_business_message() {
        let mut fx = fixture("https://leetcode.com/problems/two-sum/");
        fx.host.start().await.unwrap();
        fx.background.clear_delivered();

        fx.host
            .handle(HostEvent::Shortcut(ShortcutAction::PushNow))
            .await;

        let delivered = fx.background.delivered_business();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].kind(), "pushNow");
    }
}
