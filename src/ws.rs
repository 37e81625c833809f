use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use tokio::sync::broadcast::error::RecvError;

use crate::app::{app_state, current_timestamp};
use crate::AppEvent;

pub async fn events_ws(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(handle_socket)
}

async fn handle_socket(mut socket: WebSocket) {
    let state = app_state();
    // 先订阅再取快照，避免漏掉两者之间的状态变化
    let mut rx = state.events_tx.subscribe();

    let status_event = AppEvent::KernelStatusChanged {
        status: state.kernel.status(),
        timestamp: current_timestamp(),
    };
    if send_event(&mut socket, &status_event).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    // 客户端消息只当作心跳
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::debug!("websocket receive error: {err}");
                        break;
                    }
                }
            }
            event = rx.recv() => {
                match event {
                    Ok(ev) => {
                        if send_event(&mut socket, &ev).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!("websocket client lagged, {skipped} events skipped");
                    }
                    Err(RecvError::Closed) => {
                        tracing::debug!("event channel closed");
                        break;
                    }
                }
            }
            _ = state.shutdown.cancelled() => break,
        }
    }
}

async fn send_event(socket: &mut WebSocket, event: &AppEvent) -> Result<(), ()> {
    let text = match serde_json::to_string(event) {
        Ok(t) => t,
        Err(err) => {
            tracing::error!("failed to serialize AppEvent for websocket: {err}");
            return Ok(());
        }
    };

    socket.send(Message::Text(text)).await.map_err(|_| ())
}
