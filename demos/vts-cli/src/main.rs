//! Command-line demo client.
//!
//! Run with: cargo run -p vts-cli [config.json]
//!
//! Listens for running host instances, connects to the configured port
//! (or the first active one discovered), prints host statistics and echoes
//! `TestEvent`s until Ctrl-C.

use std::cell::Cell;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vts_core::requests::{StatisticsRequest, TestEvent, TestEventConfig};
use vts_core::{ClientConfig, PortDirectory};
use vts_session::storage::{FileTokenStore, MemoryTokenStore};
use vts_session::{ConnectionState, Session};
use vts_transport::{PortDiscovery, WebSocketTransport};

const TICK: Duration = Duration::from_millis(16);
const DISCOVERY_WAIT: Duration = Duration::from_secs(2);

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => ClientConfig::load_from_path(&PathBuf::from(path))?,
        None => ClientConfig::from_env()?,
    };

    let discovery = PortDiscovery::start(&config.discovery).context("starting port discovery")?;
    tokio::time::sleep(DISCOVERY_WAIT).await;
    for endpoint in discovery.ports() {
        tracing::info!(
            port = endpoint.port,
            active = endpoint.active,
            window = %endpoint.window_title,
            "host instance"
        );
    }

    let token_store = config
        .token_path
        .clone()
        .map(FileTokenStore::new)
        .or_else(|| FileTokenStore::default_for(&config.plugin));
    match token_store {
        Some(store) => run(config, store, &discovery).await,
        None => run(config, MemoryTokenStore::new(), &discovery).await,
    }
}

async fn run<S>(config: ClientConfig, token_store: S, discovery: &PortDiscovery) -> anyhow::Result<()>
where
    S: vts_core::TokenStore,
{
    let mut session = Session::new(WebSocketTransport::new(), token_store, config)
        .with_directory(Arc::new(discovery.table()));

    if !discovery.contains(session.config().port) {
        if let Some(endpoint) = session.get_ports().into_iter().find(|e| e.active) {
            session.set_port(endpoint.port)?;
        }
    }

    let connected = Rc::new(Cell::new(false));
    let on_connect = Rc::clone(&connected);
    session.connect(
        move || on_connect.set(true),
        || tracing::info!("disconnected"),
        |error| tracing::warn!(%error, "session error"),
    )?;

    let mut interval = tokio::time::interval(TICK);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut last = Instant::now();
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = &mut ctrl_c => break,
        }
        let now = Instant::now();
        session.tick(now - last);
        last = now;

        if connected.replace(false) {
            on_open(&mut session)?;
        }
        if session.state() == ConnectionState::Disconnected {
            tracing::info!("session ended");
            return Ok(());
        }
    }

    session.disconnect();
    Ok(())
}

fn on_open<S: vts_core::TokenStore>(session: &mut Session<WebSocketTransport, S>) -> anyhow::Result<()> {
    session.send(
        &StatisticsRequest::default(),
        |stats| {
            tracing::info!(
                version = %stats.v_tube_studio_version,
                framerate = stats.framerate,
                uptime_ms = stats.uptime,
                plugins = stats.connected_plugins,
                "host statistics"
            );
        },
        |error| tracing::warn!(%error, "statistics request failed"),
    )?;

    if !session.active_subscriptions().iter().any(|name| name == "TestEvent") {
        session.subscribe(
            &TestEventConfig {
                test_message_for_event: Some("hello from vts-cli".into()),
            },
            |event: TestEvent| {
                tracing::info!(counter = event.counter, message = %event.your_test_message, "test event");
            },
            |response| tracing::info!(events = ?response.subscribed_events, "subscribed"),
            |error| tracing::warn!(%error, "subscription rejected"),
        )?;
    }
    Ok(())
}
