//! Tokio event loop around a [`BridgeHost`].
//!
//! The host and its supervisor stay synchronous; this loop only waits for
//! the next stimulus and hands it over.

use bridge_transport::EventReceiver;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

use crate::host::{BridgeHost, HostEvent};

/// Runs until an [`HostEvent::Unload`] is handled or the host event stream
/// closes, then returns the host.
pub async fn run(
    mut host: BridgeHost,
    mut channel_events: EventReceiver,
    mut host_events: mpsc::Receiver<HostEvent>,
) -> BridgeHost {
    let signal = host.signal();
    loop {
        let wake = host.next_deadline().map(Instant::from_std);
        tokio::select! {
            event = host_events.recv() => {
                let Some(event) = event else {
                    debug!(target: "bridge.host", "host event stream closed");
                    host.stop();
                    break;
                };
                let unload = event == HostEvent::Unload;
                host.handle(event).await;
                if unload {
                    break;
                }
            }
            Some(event) = channel_events.recv() => {
                host.on_channel_event(event);
            }
            _ = signal.raised() => {
                host.on_reconnect_signal();
            }
            _ = sleep_until(wake.unwrap_or_else(Instant::now)), if wake.is_some() => {
                host.fire_due_timers();
            }
        }
    }
    info!(target: "bridge.host", generation = host.generation(), "driver stopped");
    host
}
