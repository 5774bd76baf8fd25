//! WebSocket transport.
//!
//! Each connection runs on its own thread with a current-thread Tokio
//! runtime. Outbound frames and inbound events cross over unbounded
//! channels, so the session's `tick` never blocks on the network.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, warn};
use vts_core::{Transport, TransportError, TransportEvent};

/// Longest wait for the close frame to be written on shutdown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

struct Connection {
    outbound: mpsc::UnboundedSender<String>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

/// [`Transport`] over `tokio-tungstenite`.
pub struct WebSocketTransport {
    connection: Option<Connection>,
    open: Arc<AtomicBool>,
}

impl WebSocketTransport {
    #[must_use]
    pub fn new() -> Self {
        Self {
            connection: None,
            open: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for WebSocketTransport {
    fn start(&mut self, url: &str) -> Result<(), TransportError> {
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(TransportError::InvalidUrl(url.to_string()));
        }
        self.stop();

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let open = Arc::clone(&self.open);
        let url = url.to_string();

        let thread = std::thread::Builder::new()
            .name("vts-websocket".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = events_tx.send(TransportEvent::Error(e.to_string()));
                        return;
                    }
                };
                runtime.block_on(run_connection(url, outbound_rx, events_tx, shutdown_rx, open));
            })?;

        self.connection = Some(Connection {
            outbound: outbound_tx,
            events: events_rx,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        });
        Ok(())
    }

    fn stop(&mut self) {
        let Some(mut connection) = self.connection.take() else {
            return;
        };
        if let Some(shutdown) = connection.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = connection.thread.take() {
            if thread.join().is_err() {
                warn!("websocket thread panicked");
            }
        }
        self.open.store(false, Ordering::SeqCst);
    }

    fn send(&mut self, text: String) -> Result<(), TransportError> {
        let connection = self.connection.as_ref().ok_or(TransportError::NotOpen)?;
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::NotOpen);
        }
        connection
            .outbound
            .send(text)
            .map_err(|_| TransportError::NotOpen)
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        self.connection.as_mut()?.events.try_recv().ok()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_connection(
    url: String,
    mut outbound: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<TransportEvent>,
    mut shutdown: oneshot::Receiver<()>,
    open: Arc<AtomicBool>,
) {
    let connected = tokio::select! {
        result = connect_async(url.as_str()) => result,
        _ = &mut shutdown => return,
    };
    let ws = match connected {
        Ok((ws, _)) => ws,
        Err(e) => {
            debug!(%url, error = %e, "websocket connect failed");
            let _ = events.send(TransportEvent::Error(e.to_string()));
            return;
        }
    };

    debug!(%url, "websocket connected");
    open.store(true, Ordering::SeqCst);
    let _ = events.send(TransportEvent::Opened);

    let (mut sink, mut stream) = ws.split();
    let last = loop {
        tokio::select! {
            _ = &mut shutdown => {
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: "client disconnect".into(),
                };
                let close = sink.send(Message::Close(Some(frame)));
                if tokio::time::timeout(CLOSE_TIMEOUT, close).await.is_err() {
                    debug!("peer not reading, dropping connection without close");
                }
                break None;
            }
            text = outbound.recv() => {
                let Some(text) = text else { break None };
                // A peer that stops reading must not hold up shutdown.
                tokio::select! {
                    sent = sink.send(Message::Text(text.into())) => {
                        if let Err(e) = sent {
                            break Some(TransportEvent::Error(e.to_string()));
                        }
                    }
                    _ = &mut shutdown => break None,
                }
            }
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(TransportEvent::Message(text.to_string()));
                }
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => {
                        let _ = events.send(TransportEvent::Message(text));
                    }
                    Err(_) => debug!("dropping non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    let (clean, reason) = frame.map_or_else(
                        || (false, "closed without status".to_string()),
                        |f| (f.code == CloseCode::Normal, f.reason.to_string()),
                    );
                    break Some(TransportEvent::Closed { clean, reason });
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break Some(TransportEvent::Error(e.to_string())),
                None => break Some(TransportEvent::Closed {
                    clean: false,
                    reason: "stream ended".into(),
                }),
            }
        }
    };

    open.store(false, Ordering::SeqCst);
    if let Some(event) = last {
        debug!(?event, "websocket closed");
        let _ = events.send(event);
    }
}
