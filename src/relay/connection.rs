//! Resilient WebSocket client to a single relay.
//!
//! Each connection owns one socket driven by a spawned task. The task
//! serializes reads, writes, and reconnect timing; the [`RelayConnection`]
//! handle exposes `start`/`stop`/`send` plus a state signal. Transport
//! faults are absorbed here: the machine reports them through status
//! events and self-heals after a fixed reconnect delay unless `stop()` was
//! called. Frames sent while not connected are dropped silently — callers
//! gate on `state()`.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::protocol::{RelayInbound, RelayOutbound};

/// Read frames are bounded; anything larger than this kills the read.
pub const MAX_FRAME_BYTES: usize = 1 << 20;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayConnectionState {
    Stopped,
    Connecting,
    Connected,
}

impl RelayConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UriError {
    #[error("relay URI must start with ws://")]
    UnsupportedScheme,
    #[error("wss:// relays are not supported, terminate TLS externally")]
    TlsUnsupported,
    #[error("relay URI is missing a host")]
    MissingHost,
    #[error("relay URI has an invalid port")]
    InvalidPort,
}

/// A parsed `ws://host[:port]/path` relay endpoint. `wss://` is rejected
/// outright; TLS termination lives outside this server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayUri {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl RelayUri {
    pub fn parse(uri: &str) -> Result<Self, UriError> {
        if uri.starts_with("wss://") {
            return Err(UriError::TlsUnsupported);
        }
        let Some(rest) = uri.strip_prefix("ws://") else {
            return Err(UriError::UnsupportedScheme);
        };

        let (host_port, path) = match rest.find('/') {
            Some(index) => (&rest[..index], rest[index..].to_string()),
            None => (rest, "/".to_string()),
        };

        let (host, port) = match host_port.split_once(':') {
            Some((host, port)) => {
                let port: u16 = port.parse().map_err(|_| UriError::InvalidPort)?;
                if port == 0 {
                    return Err(UriError::InvalidPort);
                }
                (host, port)
            }
            None => (host_port, 80),
        };
        if host.is_empty() {
            return Err(UriError::MissingHost);
        }

        Ok(Self {
            host: host.to_string(),
            port,
            path,
        })
    }

    pub fn endpoint(&self) -> String {
        format!("ws://{}:{}{}", self.host, self.port, self.path)
    }
}

#[derive(Debug, Clone)]
pub struct RelayConnectionOptions {
    pub relay_id: String,
    pub uri: RelayUri,
    pub reconnect_delay: Duration,
}

/// Events fanned in to the owning manager from every connection task.
#[derive(Debug)]
pub enum ConnectionEvent {
    Status {
        relay_id: String,
        state: RelayConnectionState,
        detail: String,
    },
    Frame {
        relay_id: String,
        inbound: RelayInbound,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Start,
    Stop,
}

/// Handle to one relay connection task.
pub struct RelayConnection {
    relay_id: String,
    outbound_tx: mpsc::UnboundedSender<String>,
    control_tx: mpsc::UnboundedSender<Control>,
    state_rx: watch::Receiver<RelayConnectionState>,
}

impl RelayConnection {
    /// Spawn the connection task. The task stays idle until `start()`.
    pub fn spawn(
        options: RelayConnectionOptions,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(RelayConnectionState::Stopped);
        let relay_id = options.relay_id.clone();

        let task = ConnectionTask {
            options,
            events,
            outbound_rx,
            control_rx,
            state_tx,
        };
        tokio::spawn(task.run());

        Self {
            relay_id,
            outbound_tx,
            control_tx,
            state_rx,
        }
    }

    pub fn relay_id(&self) -> &str {
        &self.relay_id
    }

    pub fn state(&self) -> RelayConnectionState {
        *self.state_rx.borrow()
    }

    /// Begin connecting. Idempotent; a no-op while connecting or connected.
    pub fn start(&self) {
        let _ = self.control_tx.send(Control::Start);
    }

    /// Close the socket and stop reconnecting.
    pub fn stop(&self) {
        let _ = self.control_tx.send(Control::Stop);
    }

    /// Enqueue one frame. Dropped silently when not connected.
    pub fn send(&self, frame: &RelayOutbound) {
        if self.state() != RelayConnectionState::Connected {
            debug!(
                target: "control_server::relay",
                relay_id = %self.relay_id,
                "dropping outbound frame while not connected"
            );
            return;
        }
        match serde_json::to_string(frame) {
            Ok(text) => {
                let _ = self.outbound_tx.send(text);
            }
            Err(err) => warn!(
                target: "control_server::relay",
                relay_id = %self.relay_id,
                error = %err,
                "failed to encode outbound frame"
            ),
        }
    }
}

enum SessionEnd {
    /// `stop()` was called; return to idle.
    Stop,
    /// Transport fault or remote close; reconnect after the delay.
    Retry(String),
    /// The handle is gone; the task exits.
    HandleDropped,
}

struct ConnectionTask {
    options: RelayConnectionOptions,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    outbound_rx: mpsc::UnboundedReceiver<String>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    state_tx: watch::Sender<RelayConnectionState>,
}

impl ConnectionTask {
    async fn run(mut self) {
        loop {
            // Idle until started.
            match self.control_rx.recv().await {
                Some(Control::Start) => {}
                Some(Control::Stop) => continue,
                None => return,
            }
            self.drain_outbound();
            if matches!(self.active_loop().await, SessionEnd::HandleDropped) {
                return;
            }
        }
    }

    /// Connect, serve, reconnect. Returns on `stop()` or handle drop.
    async fn active_loop(&mut self) -> SessionEnd {
        loop {
            self.set_state(RelayConnectionState::Connecting, "connecting");

            let connect = connect_async_with_config(
                self.options.uri.endpoint(),
                Some(ws_config()),
                false,
            );
            tokio::pin!(connect);
            let result = tokio::select! {
                result = &mut connect => result,
                end = wait_for_stop(&mut self.control_rx) => {
                    self.set_state(RelayConnectionState::Stopped, "stopped");
                    return end;
                }
            };

            let end = match result {
                Ok((stream, _response)) => {
                    self.drain_outbound();
                    self.set_state(RelayConnectionState::Connected, "connected");
                    self.session(stream).await
                }
                Err(err) => SessionEnd::Retry(format!("connect error: {err}")),
            };

            match end {
                SessionEnd::Stop => {
                    self.drain_outbound();
                    self.set_state(RelayConnectionState::Stopped, "stopped");
                    return SessionEnd::Stop;
                }
                SessionEnd::HandleDropped => {
                    self.set_state(RelayConnectionState::Stopped, "stopped");
                    return SessionEnd::HandleDropped;
                }
                SessionEnd::Retry(detail) => {
                    self.set_state(RelayConnectionState::Stopped, &detail);
                    let delay = tokio::time::sleep(self.options.reconnect_delay);
                    tokio::pin!(delay);
                    tokio::select! {
                        _ = &mut delay => {}
                        end = wait_for_stop(&mut self.control_rx) => {
                            self.set_state(RelayConnectionState::Stopped, "stopped");
                            return end;
                        }
                    }
                }
            }
        }
    }

    /// One connected socket. Writes drain the queue one frame at a time; a
    /// new write starts only after the previous one completed.
    async fn session(&mut self, stream: WsStream) -> SessionEnd {
        let (mut write, mut read) = stream.split();
        loop {
            tokio::select! {
                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => self.handle_text(&text),
                    Some(Ok(Message::Close(_))) | None => {
                        return SessionEnd::Retry("closed by remote".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        return SessionEnd::Retry(format!("read error: {err}"));
                    }
                },
                frame = self.outbound_rx.recv() => match frame {
                    Some(text) => {
                        if let Err(err) = write.send(Message::Text(text)).await {
                            return SessionEnd::Retry(format!("write error: {err}"));
                        }
                    }
                    None => return SessionEnd::HandleDropped,
                },
                control = self.control_rx.recv() => match control {
                    Some(Control::Stop) => {
                        let _ = write.send(Message::Close(None)).await;
                        return SessionEnd::Stop;
                    }
                    Some(Control::Start) => {}
                    None => return SessionEnd::HandleDropped,
                },
            }
        }
    }

    fn handle_text(&self, text: &str) {
        match serde_json::from_str::<RelayInbound>(text) {
            Ok(inbound) => {
                let _ = self.events.send(ConnectionEvent::Frame {
                    relay_id: self.options.relay_id.clone(),
                    inbound,
                });
            }
            Err(err) => warn!(
                target: "control_server::relay",
                relay_id = %self.options.relay_id,
                error = %err,
                "failed to parse relay JSON, dropping frame"
            ),
        }
    }

    fn set_state(&self, state: RelayConnectionState, detail: &str) {
        let _ = self.state_tx.send(state);
        let _ = self.events.send(ConnectionEvent::Status {
            relay_id: self.options.relay_id.clone(),
            state,
            detail: detail.to_string(),
        });
    }

    fn drain_outbound(&mut self) {
        while self.outbound_rx.try_recv().is_ok() {}
    }
}

async fn wait_for_stop(control_rx: &mut mpsc::UnboundedReceiver<Control>) -> SessionEnd {
    loop {
        match control_rx.recv().await {
            Some(Control::Stop) => return SessionEnd::Stop,
            Some(Control::Start) => {}
            None => return SessionEnd::HandleDropped,
        }
    }
}

fn ws_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(MAX_FRAME_BYTES);
    config.max_frame_size = Some(MAX_FRAME_BYTES);
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_uri() {
        let uri = RelayUri::parse("ws://192.168.1.10:9000/ws").unwrap();
        assert_eq!(uri.host, "192.168.1.10");
        assert_eq!(uri.port, 9000);
        assert_eq!(uri.path, "/ws");
        assert_eq!(uri.endpoint(), "ws://192.168.1.10:9000/ws");
    }

    #[test]
    fn missing_port_defaults_to_80() {
        let uri = RelayUri::parse("ws://relay.local/ws").unwrap();
        assert_eq!(uri.port, 80);
    }

    #[test]
    fn missing_path_defaults_to_root() {
        let uri = RelayUri::parse("ws://relay.local:9000").unwrap();
        assert_eq!(uri.path, "/");
    }

    #[test]
    fn rejects_wss() {
        assert_eq!(
            RelayUri::parse("wss://relay.local:9000/ws"),
            Err(UriError::TlsUnsupported)
        );
    }

    #[test]
    fn rejects_other_schemes() {
        assert_eq!(
            RelayUri::parse("http://relay.local/ws"),
            Err(UriError::UnsupportedScheme)
        );
        assert_eq!(RelayUri::parse("relay.local"), Err(UriError::UnsupportedScheme));
    }

    #[test]
    fn rejects_bad_ports() {
        assert_eq!(
            RelayUri::parse("ws://relay.local:meow/ws"),
            Err(UriError::InvalidPort)
        );
        assert_eq!(
            RelayUri::parse("ws://relay.local:0/ws"),
            Err(UriError::InvalidPort)
        );
        assert_eq!(
            RelayUri::parse("ws://relay.local:70000/ws"),
            Err(UriError::InvalidPort)
        );
    }

    #[test]
    fn rejects_empty_host() {
        assert_eq!(RelayUri::parse("ws://:9000/ws"), Err(UriError::MissingHost));
    }

    #[tokio::test]
    async fn stays_stopped_until_started() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let connection = RelayConnection::spawn(
            RelayConnectionOptions {
                relay_id: "r1".to_string(),
                uri: RelayUri::parse("ws://127.0.0.1:1/ws").unwrap(),
                reconnect_delay: Duration::from_secs(60),
            },
            events_tx,
        );
        assert_eq!(connection.state(), RelayConnectionState::Stopped);
        // Frames before start are dropped without panicking.
        connection.send(&RelayOutbound::connect("abc"));
        assert!(events_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_connect_reports_connecting_then_stopped() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        // Nothing listens on this port; the connect fails fast on loopback.
        let connection = RelayConnection::spawn(
            RelayConnectionOptions {
                relay_id: "r1".to_string(),
                uri: RelayUri::parse("ws://127.0.0.1:1/ws").unwrap(),
                reconnect_delay: Duration::from_secs(60),
            },
            events_tx,
        );
        connection.start();

        let first = events_rx.recv().await.unwrap();
        let ConnectionEvent::Status { state, .. } = first else {
            panic!("expected status event");
        };
        assert_eq!(state, RelayConnectionState::Connecting);

        let second = events_rx.recv().await.unwrap();
        let ConnectionEvent::Status { state, detail, .. } = second else {
            panic!("expected status event");
        };
        assert_eq!(state, RelayConnectionState::Stopped);
        assert!(detail.contains("connect error"), "detail: {detail}");

        connection.stop();
    }
}
