// WebSocket glue: upgrades /ws and shuttles frames between the socket
// and a ClientSession. All subscription logic lives in skydeck-core;
// this module only serializes.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tracing::debug;

use skydeck_core::{ClientSession, ConnectionRegistry, TopicBroker};

#[derive(Clone)]
struct AppState {
    broker: TopicBroker,
    registry: ConnectionRegistry,
}

pub fn router(broker: TopicBroker, registry: ConnectionRegistry) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(AppState { broker, registry })
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut session, mut out_rx) = ClientSession::new(state.broker, state.registry);
    let session_id = session.id();
    debug!(%session_id, "browser session connected");

    let (mut ws_write, mut ws_read) = socket.split();

    // Write loop: session frames → socket.
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            match serde_json::to_string(&frame) {
                Ok(json) => {
                    if ws_write.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(%session_id, error = %e, "failed to serialize frame");
                }
            }
        }
    });

    // Read loop: control messages → session.
    while let Some(result) = ws_read.next().await {
        match result {
            Ok(Message::Text(text)) => session.handle_control(&text),
            Ok(Message::Close(_)) => break,
            Ok(_) => {
                // Ping/pong handled by axum; binary ignored.
            }
            Err(e) => {
                debug!(%session_id, error = %e, "websocket read error");
                break;
            }
        }
    }

    // Dropping the session releases every subscription and supervisor
    // reference before the writer is reaped.
    drop(session);
    writer.abort();
    debug!(%session_id, "browser session disconnected");
}
