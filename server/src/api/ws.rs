use axum::{
    extract::{
        ws::{Message, WebSocket},
        ws::WebSocketUpgrade,
        ConnectInfo, State as AxumState,
    },
    http::{header::ORIGIN, HeaderMap, StatusCode},
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use typerace_types::api::{ClientEvent, ServerEvent};
use typerace_types::{ConnectionId, LobbyError};

use crate::gateway::OutboundSender;
use crate::{env_flag, env_parse, Server, WsConnectionGuard, WsConnectionRejection};

fn ws_send_timeout() -> Duration {
    let parsed = env_parse::<u64>("WS_SEND_TIMEOUT_MS").filter(|value| *value > 0);
    Duration::from_millis(parsed.unwrap_or(2_000))
}

enum OutboundSendError {
    Closed,
    Full,
}

/// Validates the WebSocket Origin header against `ALLOWED_WS_ORIGINS`.
///
/// Without the variable every origin is accepted. A missing Origin header is accepted
/// unless `ALLOW_WS_NO_ORIGIN` is set to a false value.
fn validate_origin(headers: &HeaderMap) -> bool {
    let allowed = std::env::var("ALLOWED_WS_ORIGINS").ok();
    let deny_no_origin = env_flag("ALLOW_WS_NO_ORIGIN") == Some(false);
    origin_allowed(headers, allowed.as_deref(), deny_no_origin)
}

fn origin_allowed(headers: &HeaderMap, allowed: Option<&str>, deny_no_origin: bool) -> bool {
    let origin = match headers.get(ORIGIN) {
        Some(o) => match o.to_str() {
            Ok(s) => s,
            Err(_) => {
                tracing::warn!("Invalid Origin header encoding");
                return false;
            }
        },
        None => {
            if deny_no_origin {
                tracing::warn!("WebSocket connection rejected: no Origin header and ALLOW_WS_NO_ORIGIN=false");
                return false;
            }
            return true;
        }
    };

    let Some(allowed) = allowed else {
        return true;
    };

    let allowed_list: Vec<&str> = allowed
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect();
    if allowed_list.is_empty() || allowed_list.contains(&"*") || allowed_list.contains(&origin) {
        return true;
    }

    tracing::warn!("WebSocket origin rejected: {} (allowed: {})", origin, allowed);
    false
}

pub(super) async fn lobby_ws(
    AxumState(server): AxumState<Arc<Server>>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<std::net::SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if !validate_origin(&headers) {
        return (StatusCode::FORBIDDEN, "Origin not allowed").into_response();
    }

    let guard = match server.try_acquire_ws_connection(addr.ip()) {
        Ok(guard) => guard,
        Err(reason) => {
            let message = match reason {
                WsConnectionRejection::GlobalLimit => "WebSocket connection limit reached",
                WsConnectionRejection::PerIpLimit => "WebSocket per-IP limit reached",
            };
            return (StatusCode::TOO_MANY_REQUESTS, message).into_response();
        }
    };

    let max_message_bytes = server.config.ws_max_message_bytes();
    ws.max_message_size(max_message_bytes)
        .max_frame_size(max_message_bytes)
        .on_upgrade(move |socket| handle_lobby_ws(socket, server, guard))
        .into_response()
}

async fn handle_lobby_ws(socket: WebSocket, server: Arc<Server>, _guard: WsConnectionGuard) {
    let id = ConnectionId::new();
    tracing::info!(connection = %id, "lobby WebSocket connected");
    let (mut sender, mut receiver) = socket.split();

    let (out_tx, mut out_rx) = mpsc::channel(server.config.ws_outbound_capacity());
    let writer_server = server.clone();
    let writer_handle = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            match timeout(ws_send_timeout(), sender.send(msg)).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    writer_server.ws_metrics().inc_send_error();
                    tracing::warn!(connection = %id, "failed to send event, client disconnected");
                    break;
                }
                Err(_) => {
                    writer_server.ws_metrics().inc_send_timeout();
                    tracing::warn!(connection = %id, "WebSocket send timed out, closing connection");
                    break;
                }
            }
        }
        let _ = sender.close().await;
    });

    server.gateway().register(id, out_tx.clone());
    let coordinator = server.coordinator().clone();
    coordinator.connect(id);

    loop {
        let frame = match receiver.next().await {
            Some(Ok(Message::Text(text))) => text.into_bytes(),
            Some(Ok(Message::Binary(bytes))) => bytes,
            Some(Ok(Message::Ping(data))) => {
                if enqueue_message(&out_tx, Message::Pong(data), &server).is_err() {
                    tracing::warn!(connection = %id, "failed to enqueue pong, closing connection");
                    break;
                }
                continue;
            }
            Some(Ok(Message::Close(_))) => {
                tracing::info!(connection = %id, "client closed WebSocket connection");
                break;
            }
            Some(Ok(Message::Pong(_))) => continue,
            Some(Err(e)) => {
                tracing::warn!(connection = %id, "WebSocket error: {:?}", e);
                break;
            }
            None => {
                tracing::info!(connection = %id, "WebSocket stream ended");
                break;
            }
        };

        match serde_json::from_slice::<ClientEvent>(&frame) {
            Ok(event) => coordinator.handle_and_report(id, event).await,
            Err(err) => {
                server.ws_metrics().inc_parse_error();
                tracing::debug!(connection = %id, %err, "unparseable frame");
                coordinator.notify(
                    id,
                    ServerEvent::action_error("unknown", &LobbyError::invalid(err.to_string())),
                );
            }
        }
    }

    coordinator.disconnect(id).await;
    server.gateway().unregister(&id);
    tracing::info!(connection = %id, "lobby WebSocket handler exiting");
    drop(out_tx);
    let _ = writer_handle.await;
}

fn enqueue_message(
    sender: &OutboundSender,
    message: Message,
    server: &Server,
) -> Result<(), OutboundSendError> {
    match sender.try_send(message) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Full(_)) => {
            server.ws_metrics().inc_queue_full();
            Err(OutboundSendError::Full)
        }
        Err(mpsc::error::TrySendError::Closed(_)) => Err(OutboundSendError::Closed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn with_origin(origin: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ORIGIN, HeaderValue::from_static(origin));
        headers
    }

    #[test]
    fn origin_rules() {
        let none = HeaderMap::new();
        assert!(origin_allowed(&none, None, false));
        assert!(!origin_allowed(&none, None, true));

        let site = with_origin("https://typerace.example");
        assert!(origin_allowed(&site, None, false));
        assert!(origin_allowed(
            &site,
            Some("https://other.example, https://typerace.example"),
            false
        ));
        assert!(!origin_allowed(&site, Some("https://other.example"), false));
        assert!(origin_allowed(&site, Some("*"), false));
    }
}
