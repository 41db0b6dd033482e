//! WebSocket endpoints.
//!
//! `/autoguider_socket` pushes the full property set whenever the guider
//! finishes an analysis round; `/telescope_socket` relays GOTO requests
//! decoded by the Stellarium server so the UI can confirm them.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use serde_json::json;
use tracing::debug;

use crate::routes::properties_json;
use crate::state::AppState;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub async fn autoguider_socket(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| autoguider_loop(socket, state))
}

async fn autoguider_loop(mut socket: WebSocket, state: Arc<AppState>) {
    loop {
        if state.guider.take_data_ready() {
            let payload = properties_json(&state).to_string();
            if socket.send(Message::Text(payload)).await.is_err() {
                break;
            }
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    debug!("autoguider socket disconnected");
}

pub async fn telescope_socket(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| telescope_loop(socket, state))
}

async fn telescope_loop(mut socket: WebSocket, state: Arc<AppState>) {
    let mut slew_requests = state.slew_requests.subscribe();
    while let Ok(request) = slew_requests.recv().await {
        let payload = json!({
            "function": "slew_request",
            "ra": request.ra,
            "dec": request.dec,
        })
        .to_string();
        if socket.send(Message::Text(payload)).await.is_err() {
            break;
        }
    }
    debug!("telescope socket disconnected");
}
