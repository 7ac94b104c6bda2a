mod cli;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bridge_proto::{InboundEnvelope, InboundMessage, UploadState, UploadStatus};
use bridge_transport::{event_stream, SimulatedBackground, DISCONNECTED_PORT_ERROR};
use clap::Parser;
use content_bridge::clock::TokioClock;
use content_bridge::config::Config;
use content_bridge::driver;
use content_bridge::host::{BridgeHost, HostEvent};
use content_bridge::storage::InMemoryStorage;
use content_bridge::supervisor::{Collaborators, ShortcutAction};
use content_bridge::telemetry::init_tracing;
use content_bridge::ui::{LoggingFallbackNotice, LoggingUiFactory};
use tokio::sync::mpsc;
use tracing::info;
use url::Url;

use crate::cli::Cli;

const EVICTION_ERROR: &str = "Could not establish connection. Receiving end does not exist.";

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::from_env();
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }
    init_tracing(&config.log_level);

    let page_url = Url::parse(&cli.url).context("invalid --url")?;
    let background = SimulatedBackground::new();
    let (sender, receiver) = event_stream();
    let collaborators = Collaborators {
        connector: background.clone(),
        probe: background.clone(),
        ui: Arc::new(LoggingUiFactory),
        fallback: Arc::new(LoggingFallbackNotice),
        clock: Arc::new(TokioClock),
    };
    let host = BridgeHost::new(
        Arc::new(config),
        collaborators,
        InMemoryStorage::new(),
        sender,
        page_url,
    );

    let (host_tx, host_rx) = mpsc::channel(32);
    let driver = tokio::spawn(driver::run(host, receiver, host_rx));

    host_tx
        .send(HostEvent::DomReady)
        .await
        .context("driver exited early")?;
    run_script(&cli, &background, &host_tx).await?;
    host_tx
        .send(HostEvent::Unload)
        .await
        .context("driver exited early")?;

    let host = driver.await.context("driver task failed")?;
    info!(
        opens = background.open_count(),
        delivered = background.delivered().len(),
        "simulation finished"
    );
    let summary = serde_json::to_string_pretty(&host.last_status())?;
    println!("{summary}");
    Ok(())
}

/// Plays the scripted background behaviour, one step per simulated second.
async fn run_script(
    cli: &Cli,
    background: &SimulatedBackground,
    host_tx: &mpsc::Sender<HostEvent>,
) -> Result<()> {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.tick().await;
    let mut restore_at = None;

    for second in 1..=cli.duration {
        ticker.tick().await;

        if cli.evict_every > 0 && second % cli.evict_every == 0 {
            info!(second, "evicting background worker");
            background.disconnect(Some(EVICTION_ERROR));
        }
        if cli.invalidate_at == Some(second) {
            info!(second, "invalidating extension context");
            background.invalidate_context();
            restore_at = Some(second + cli.restore_after);
        }
        if restore_at == Some(second) {
            info!(second, "extension runtime restored");
            background.restore_context();
            host_tx.send(HostEvent::RuntimeReconnect).await?;
            restore_at = None;
        }
        if cli.flaky_sends {
            match second % 7 {
                3 => background.fail_sends(Some(DISCONNECTED_PORT_ERROR)),
                4 => background.fail_sends(None),
                _ => {}
            }
        }

        let status = InboundEnvelope::new(InboundMessage::StatusUpdate {
            status: UploadStatus {
                state: UploadState::Uploading,
                message: Some(format!("tick {second}")),
                file_count: None,
            },
        })
        .with_id(format!("status-{second}"));
        background.push(&status);
        if second % 4 == 0 {
            // Redelivery of the same logical message.
            background.push(&status);
        }
        if second % 5 == 0 {
            host_tx
                .send(HostEvent::Shortcut(ShortcutAction::PushNow))
                .await?;
        }
        if second % 15 == 0 {
            host_tx.send(HostEvent::FocusGained).await?;
        }
    }
    Ok(())
}
