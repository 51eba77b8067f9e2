//! Session transport: axum upgrade handling plus the per-session read and
//! write loops. Each session writes through its own queue so one slow peer
//! cannot stall another.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};
use uuid::Uuid;

use super::UiGateway;

/// Path the UI protocol is served on.
pub const UI_WS_PATH: &str = "/ws/ui";
/// Optional subprotocol offered to clients.
pub const UI_SUBPROTOCOL: &str = "toio-ui.v1";

const PING_INTERVAL: Duration = Duration::from_secs(30);

pub(super) fn router(gateway: UiGateway) -> Router {
    Router::new()
        .route(UI_WS_PATH, get(handle_upgrade))
        .with_state(gateway)
}

async fn handle_upgrade(
    State(gateway): State<UiGateway>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.protocols([UI_SUBPROTOCOL])
        .on_upgrade(move |socket| run_session(gateway, socket))
}

async fn run_session(gateway: UiGateway, socket: WebSocket) {
    let session_id = Uuid::new_v4();
    info!(target: "control_server::gateway", %session_id, "UI session connected");

    let outbound_rx = gateway.register_session(session_id);
    let (sink, mut stream) = socket.split();
    // The write loop ends on its own once the session record (and with it
    // the sender) is dropped.
    tokio::spawn(write_loop(sink, outbound_rx));

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => gateway.handle_request(session_id, text.as_str()),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(
                    target: "control_server::gateway",
                    %session_id,
                    error = %err,
                    "UI session read failed"
                );
                break;
            }
        }
    }

    gateway.unregister_session(session_id);
    info!(target: "control_server::gateway", %session_id, "UI session disconnected");
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
) {
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            frame = outbound_rx.recv() => match frame {
                Some(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = ping.tick() => {
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }
}
