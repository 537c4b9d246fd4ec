use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use at_driver_proto::{ErrorKind, Response, SUB_PROTOCOL};
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use futures_util::{Sink, SinkExt, StreamExt};
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::envelope::parse_request;
use super::{AppState, ClientRegistry, ConnectionContext, ConnectionId, DeliveryError};
use super::registry::OUTBOUND_QUEUE_DEPTH;
use crate::modules::CommandModule;

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

pub(super) async fn ws_handler<M: CommandModule>(
    State(state): State<Arc<AppState<M>>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> axum::response::Response {
    if !offers_sub_protocol(&headers) {
        warn!("rejecting websocket handshake without the driver sub-protocol");
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("Unsupported WebSocket sub-protocol; expected \"{SUB_PROTOCOL}\""),
        )
            .into_response();
    }
    ws.protocols([SUB_PROTOCOL])
        .on_upgrade(move |socket| handle_socket(socket, state))
        .into_response()
}

fn offers_sub_protocol(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|protocol| protocol.trim() == SUB_PROTOCOL)
}

async fn handle_socket<M: CommandModule>(socket: WebSocket, state: Arc<AppState<M>>) {
    let (ws_tx, mut ws_rx) = socket.split();
    let (tx, rx) = mpsc::channel::<String>(OUTBOUND_QUEUE_DEPTH);
    let connection_id = state.clients.register(tx.clone());
    info!(connection_id = %connection_id, "command connection established");

    let mut writer = tokio::spawn(run_writer(ws_tx, rx, state.clients.clone(), connection_id));

    while let Some(message) = ws_rx.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    warn!(connection_id = %connection_id, "ignoring non-UTF-8 binary frame");
                    continue;
                }
            },
            Ok(Message::Close(frame)) => {
                info!(
                    connection_id = %connection_id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                break;
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => continue,
            Err(err) => {
                warn!(
                    connection_id = %connection_id,
                    error = %err,
                    "error receiving message"
                );
                break;
            }
        };

        let response = answer(&state, connection_id, &text).await;
        match serde_json::to_string(&response) {
            Ok(encoded) => {
                if tx.send(encoded).await.is_err() {
                    break;
                }
            }
            Err(err) => warn!(connection_id = %connection_id, error = %err, "failed to encode response"),
        }
    }

    state.clients.unregister(connection_id);
    drop(tx);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }
    info!(connection_id = %connection_id, "command connection closed");
}

/// Drain `outbound` onto the socket. A failed write drops the connection
/// from the registry so later broadcasts skip it.
async fn run_writer<S>(
    mut sink: S,
    mut outbound: mpsc::Receiver<String>,
    clients: ClientRegistry,
    connection_id: ConnectionId,
) where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    while let Some(text) = outbound.recv().await {
        if let Err(err) = sink.send(Message::Text(text)).await {
            clients.unregister(connection_id);
            clients.report_failure(DeliveryError {
                connection_id,
                reason: format!("socket write failed: {err}"),
            });
            break;
        }
    }
    debug!(connection_id = %connection_id, "writer task finished");
}

async fn answer<M: CommandModule>(
    state: &AppState<M>,
    connection_id: ConnectionId,
    raw: &str,
) -> Response {
    let envelope = match parse_request(raw) {
        Ok(envelope) => envelope,
        Err(response) => {
            warn!(connection_id = %connection_id, message = raw, "rejected command");
            counter!("at_driver_commands_total", 1, "method" => "none", "outcome" => "rejected");
            return response;
        }
    };

    let method = envelope.method;
    debug!(connection_id = %connection_id, %method, id = %envelope.id, "dispatching command");
    let ctx = ConnectionContext::new(connection_id, &state.clients);
    match state.commands.dispatch(&ctx, method, envelope.params).await {
        Ok(result) => {
            counter!("at_driver_commands_total", 1, "method" => method.as_str(), "outcome" => "ok");
            Response::success(envelope.id, result)
        }
        Err(err) => {
            warn!(connection_id = %connection_id, %method, error = %err, "command failed");
            counter!("at_driver_commands_total", 1, "method" => method.as_str(), "outcome" => "error");
            Response::failure(Some(envelope.id), ErrorKind::UnknownError, err.to_string())
        }
    }
}
