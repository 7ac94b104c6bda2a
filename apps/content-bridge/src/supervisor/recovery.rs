//! Recovery after the extension context is invalidated: tear everything
//! down, then rebuild the channel and UI under a small retry budget.

use std::time::Duration;

use bridge_proto::OutboundMessage;
use bridge_transport::{Channel, RuntimeProbe};
use tracing::{debug, info, warn};

use super::{
    CleanupMode, Classification, Phase, Supervisor, TimerKind, REFRESH_REQUIRED_NOTICE,
    RELOAD_NOTICE,
};
use crate::ui::NoticeKind;

impl Supervisor {
    pub(super) fn enter_recovery(&mut self, cause: Classification) {
        if self.state.is_destroyed {
            return;
        }
        if self.state.phase == Phase::Recovering {
            debug!(target: "bridge.recovery", ?cause, "already recovering");
            return;
        }
        warn!(target: "bridge.recovery", ?cause, "extension context invalidated, entering recovery");

        self.state.is_in_recovery = true;
        self.state.recovery_attempts = 0;
        self.state.is_reconnecting = false;
        self.set_phase(Phase::Recovering);
        self.timers.arm(
            TimerKind::RecoverySafety,
            self.collaborators.clock.now() + self.config.recovery_safety_timeout,
        );

        // Last chance to reach the user through the current UI.
        self.notify(NoticeKind::Warning, RELOAD_NOTICE);
        self.cleanup(CleanupMode::Recovery);

        self.attempt_recovery();
    }

    /// Reopens the channel and probes it with a heartbeat. The UI is
    /// rebuilt once [`TimerKind::RecoverySettle`] fires; until then the
    /// channel is live but UI-bound messages are still suppressed.
    pub(super) fn attempt_recovery(&mut self) {
        if self.state.is_destroyed {
            return;
        }
        self.timers.cancel(TimerKind::RecoveryRetry);
        self.timers.cancel(TimerKind::RecoverySettle);
        self.state.recovery_attempts += 1;

        if !self.collaborators.probe.is_available() {
            self.recovery_attempt_failed("extension runtime unavailable");
            return;
        }
        let channel = match self.open_channel() {
            Ok(channel) => channel,
            Err(err) => {
                self.recovery_attempt_failed(&err.to_string());
                return;
            }
        };
        let probe = OutboundMessage::Heartbeat {
            timestamp: self.collaborators.clock.epoch_millis(),
        };
        if let Err(err) = channel.send(&probe) {
            channel.close();
            self.recovery_attempt_failed(&err.to_string());
            return;
        }
        debug!(
            target: "bridge.recovery",
            attempt = self.state.recovery_attempts,
            channel = %channel.id(),
            "channel reopened, waiting to rebuild ui"
        );
        self.state.channel = Some(channel);
        self.timers.arm(
            TimerKind::RecoverySettle,
            self.collaborators.clock.now() + self.config.recovery_settle_delay,
        );
    }

    pub(super) fn finish_recovery(&mut self) {
        let channel = match self.state.channel.take() {
            Some(channel) if channel.is_open() => channel,
            _ => {
                self.recovery_attempt_failed("channel lost before ui rebuild");
                return;
            }
        };
        if let Err(err) = self.ui.initialize(&self.dispatcher).map(|_| ()) {
            channel.close();
            self.recovery_attempt_failed(&err.to_string());
            return;
        }

        info!(
            target: "bridge.recovery",
            attempt = self.state.recovery_attempts,
            channel = %channel.id(),
            "recovery complete"
        );
        self.state.is_in_recovery = false;
        self.state.recovery_attempts = 0;
        self.timers.cancel(TimerKind::RecoverySafety);
        self.on_connected(channel);
    }

    /// The reopened channel dropped before the UI was rebuilt.
    pub(super) fn recovery_channel_lost(&mut self) {
        self.timers.cancel(TimerKind::RecoverySettle);
        self.recovery_attempt_failed("channel lost before ui rebuild");
    }

    fn recovery_attempt_failed(&mut self, reason: &str) {
        let attempt = self.state.recovery_attempts;
        if attempt >= self.config.max_recovery_attempts {
            self.fail_recovery(reason);
            return;
        }
        let delay = self.config.recovery_retry_delay;
        self.timers
            .arm(TimerKind::RecoveryRetry, self.collaborators.clock.now() + delay);
        debug!(
            target: "bridge.recovery",
            attempt,
            max = self.config.max_recovery_attempts,
            retry_in_ms = delay.as_millis() as u64,
            reason,
            "recovery attempt failed"
        );
    }

    /// Terminal: stop everything and ask the user to refresh.
    fn fail_recovery(&mut self, reason: &str) {
        warn!(
            target: "bridge.recovery",
            attempts = self.state.recovery_attempts,
            runtime_available = self.collaborators.probe.is_available(),
            reason,
            "recovery exhausted, giving up"
        );
        self.state.is_destroyed = true;
        self.state.is_in_recovery = false;
        self.state.is_reconnecting = false;
        self.set_phase(Phase::Destroyed);
        self.timers.cancel_all();
        if let Some(channel) = self.state.channel.take() {
            channel.close();
        }
        self.dispatcher.detach();
        self.dedup.clear();
        self.show_refresh_required();
    }

    /// The notice stays until dismissed. The UI built to host it lives
    /// until `destroy` releases it.
    fn show_refresh_required(&mut self) {
        let shown = match self.ui.get_instance(&self.dispatcher) {
            Ok(ui) => match ui.show_notification(
                NoticeKind::Error,
                REFRESH_REQUIRED_NOTICE,
                Duration::ZERO,
            ) {
                Ok(()) => true,
                Err(err) => {
                    warn!(target: "bridge.ui", error = %err, "refresh notice failed");
                    false
                }
            },
            Err(err) => {
                warn!(target: "bridge.ui", error = %err, "ui unavailable for refresh notice");
                false
            }
        };
        if !shown {
            self.collaborators
                .fallback
                .show_persistent(REFRESH_REQUIRED_NOTICE);
        }
    }

    pub(super) fn on_recovery_safety_timeout(&mut self) {
        if self.state.is_in_recovery {
            warn!(
                target: "bridge.recovery",
                attempts = self.state.recovery_attempts,
                "recovery safety timeout elapsed, lifting message suppression"
            );
            self.state.is_in_recovery = false;
        }
    }
}
