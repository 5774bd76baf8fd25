//! UDP port discovery.
//!
//! Running host instances broadcast a state packet on a fixed UDP port about
//! once a second. [`PortDiscovery`] listens on a background thread and keeps
//! the latest announcement per API port in a concurrent map that any thread
//! can read.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Deserialize;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use vts_core::{DiscoveredEndpoint, DiscoveryConfig, PortDirectory, RawEnvelope};

/// `messageType` of discovery broadcasts.
pub const STATE_BROADCAST: &str = "VTubeStudioAPIStateBroadcast";

const MAX_PACKET: usize = 4096;

/// Discovery error.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Failed to bind discovery socket: {0}")]
    Bind(std::io::Error),
    #[error("Failed to start discovery thread: {0}")]
    Spawn(std::io::Error),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct Announcement {
    port: Option<u16>,
    #[serde(rename = "instanceID")]
    instance_id: Option<String>,
    window_title: Option<String>,
    active: Option<bool>,
}

#[derive(Debug, Clone)]
struct Record {
    endpoint: DiscoveredEndpoint,
    last_seen: Instant,
}

/// Announced endpoints keyed by API port.
///
/// Cheap to clone; clones share the same map.
#[derive(Debug, Clone)]
pub struct EndpointTable {
    entries: Arc<DashMap<u16, Record>>,
    stale_after: Duration,
}

impl EndpointTable {
    /// Entries not announced within `stale_after` are forgotten.
    /// A zero window keeps entries forever.
    #[must_use]
    pub fn new(stale_after: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            stale_after,
        }
    }

    /// Apply one raw discovery packet. Returns false if it was ignored.
    ///
    /// Fields missing from the packet keep their previous value.
    pub fn ingest(&self, packet: &[u8]) -> bool {
        let Ok(envelope) = serde_json::from_slice::<RawEnvelope>(packet) else {
            return false;
        };
        if !envelope.message_type.is_empty() && envelope.message_type != STATE_BROADCAST {
            return false;
        }
        let Ok(announcement) = serde_json::from_value::<Announcement>(envelope.data) else {
            return false;
        };
        let Some(port) = announcement.port.filter(|p| *p != 0) else {
            return false;
        };

        let now = Instant::now();
        match self.entries.entry(port) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                if let Some(instance_id) = announcement.instance_id {
                    record.endpoint.instance_id = instance_id;
                }
                if let Some(window_title) = announcement.window_title {
                    record.endpoint.window_title = window_title;
                }
                if let Some(active) = announcement.active {
                    record.endpoint.active = active;
                }
                record.last_seen = now;
            }
            Entry::Vacant(entry) => {
                info!(port, "discovered host instance");
                entry.insert(Record {
                    endpoint: DiscoveredEndpoint {
                        port,
                        instance_id: announcement.instance_id.unwrap_or_default(),
                        window_title: announcement.window_title.unwrap_or_default(),
                        active: announcement.active.unwrap_or_default(),
                    },
                    last_seen: now,
                });
            }
        }
        true
    }

    fn prune(&self) {
        if self.stale_after.is_zero() {
            return;
        }
        let now = Instant::now();
        self.entries.retain(|port, record| {
            let fresh = now.duration_since(record.last_seen) < self.stale_after;
            if !fresh {
                debug!(port, "forgetting stale host instance");
            }
            fresh
        });
    }
}

impl PortDirectory for EndpointTable {
    fn ports(&self) -> Vec<DiscoveredEndpoint> {
        self.prune();
        let mut ports: Vec<DiscoveredEndpoint> = self
            .entries
            .iter()
            .map(|r| r.value().endpoint.clone())
            .collect();
        ports.sort_by_key(|e| e.port);
        ports
    }
}

/// Background listener for discovery broadcasts.
pub struct PortDiscovery {
    table: EndpointTable,
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl PortDiscovery {
    /// Bind the discovery port and start listening.
    ///
    /// The socket allows address reuse so several clients on one machine can
    /// listen at once.
    ///
    /// # Errors
    /// Returns error if the socket cannot be bound or the thread cannot start.
    pub fn start(config: &DiscoveryConfig) -> Result<Self, DiscoveryError> {
        let socket = bind_shared(config.port).map_err(DiscoveryError::Bind)?;
        let local_addr = socket.local_addr().map_err(DiscoveryError::Bind)?;
        let table = EndpointTable::new(Duration::from_millis(config.stale_after_ms));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let listener_table = table.clone();
        let thread = std::thread::Builder::new()
            .name("vts-discovery".into())
            .spawn(move || {
                match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime.block_on(listen(socket, listener_table, shutdown_rx)),
                    Err(e) => warn!(error = %e, "failed to start discovery runtime"),
                }
            })
            .map_err(DiscoveryError::Spawn)?;

        info!(%local_addr, "listening for host instances");
        Ok(Self {
            table,
            local_addr,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    /// Shared handle to the endpoint map, usable as a session directory.
    #[must_use]
    pub fn table(&self) -> EndpointTable {
        self.table.clone()
    }

    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop listening and release the socket.
    pub fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("discovery thread panicked");
            }
        }
    }
}

impl PortDirectory for PortDiscovery {
    fn ports(&self) -> Vec<DiscoveredEndpoint> {
        self.table.ports()
    }
}

impl Drop for PortDiscovery {
    fn drop(&mut self) {
        self.stop();
    }
}

fn bind_shared(port: u16) -> std::io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    socket.set_broadcast(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

async fn listen(
    socket: std::net::UdpSocket,
    table: EndpointTable,
    mut shutdown: oneshot::Receiver<()>,
) {
    let socket = match UdpSocket::from_std(socket) {
        Ok(socket) => socket,
        Err(e) => {
            warn!(error = %e, "failed to register discovery socket");
            return;
        }
    };
    let mut buf = vec![0u8; MAX_PACKET];

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, from)) => {
                    if !table.ingest(&buf[..len]) {
                        debug!(%from, len, "ignoring malformed discovery packet");
                    }
                }
                Err(e) => debug!(error = %e, "discovery receive failed"),
            }
        }
    }
    debug!("discovery listener stopped");
}
