use axum::extract::ws::{Message as WsFrame, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use kafka_ui_store::{Filters, Message};

use super::AppState;
use crate::protocol::{self, ClientRequest};

const REQUEST_BUFFER: usize = 8;

// ═══════════════════════════════════════════════════════════════
//  WebSocket: /ws
// ═══════════════════════════════════════════════════════════════

pub(crate) async fn handle_ws(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(socket, state))
}

/// Store output → WS writer.
enum Outbound {
    Message(Message),
    Topic(Message),
}

impl Outbound {
    fn encode(&self) -> Result<String, serde_json::Error> {
        match self {
            Outbound::Message(message) => protocol::message_frame(message),
            Outbound::Topic(message) => protocol::topic_frame(&message.topic),
        }
    }
}

/// Input side of the two store subscriptions a connection may hold. Each
/// is opened on the first request of its kind and reused afterwards.
struct Subscriptions {
    cancel: CancellationToken,
    outbound: mpsc::Sender<Outbound>,
    topics: Option<mpsc::Sender<()>>,
    messages: Option<mpsc::Sender<Filters>>,
}

// ═══════════════════════════════════════════════════════════════
//  Connection handler
// ═══════════════════════════════════════════════════════════════

async fn ws_connection(mut socket: WebSocket, state: AppState) {
    // Cancelled when this function returns, which ends every store task the
    // connection started.
    let cancel = state.shutdown.child_token();
    let _guard = cancel.clone().drop_guard();

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(state.ws_buffer);
    let mut subs = Subscriptions {
        cancel: cancel.clone(),
        outbound: outbound_tx,
        topics: None,
        messages: None,
    };
    tracing::debug!("ws connection opened");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            msg = socket.recv() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    _ => break,
                };

                let text = match msg {
                    WsFrame::Text(t) => t,
                    WsFrame::Close(_) => break,
                    _ => continue,
                };

                let request: ClientRequest = match serde_json::from_str(&text) {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(error = %e, "parse request");
                        let _ = socket
                            .send(WsFrame::Text(protocol::error_frame(format!("parse: {e}")).into()))
                            .await;
                        continue;
                    }
                };

                if let Err(reason) = handle_request(&state, &mut subs, request) {
                    let _ = socket
                        .send(WsFrame::Text(protocol::error_frame(reason).into()))
                        .await;
                }
            }

            out = outbound_rx.recv() => {
                let Some(out) = out else { break };
                let json = match out.encode() {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::warn!(error = %e, "encode frame");
                        continue;
                    }
                };
                if socket.send(WsFrame::Text(json.into())).await.is_err() {
                    break;
                }
            }
        }
    }

    tracing::debug!("ws connection closed");
}

/// Route a request to its subscription. Never waits on the store, so the
/// connection keeps draining outbound frames while a query runs.
fn handle_request(
    state: &AppState,
    subs: &mut Subscriptions,
    request: ClientRequest,
) -> Result<(), &'static str> {
    let Subscriptions {
        cancel,
        outbound,
        topics,
        messages,
    } = subs;

    match request {
        ClientRequest::Topics => {
            let trigger = topics.get_or_insert_with(|| {
                let (tx, rx) = mpsc::channel(REQUEST_BUFFER);
                let stream = state.store.topics(cancel.child_token(), rx);
                tokio::spawn(forward(stream, outbound.clone(), Outbound::Topic));
                tx
            });
            match trigger.try_send(()) {
                // A replay is already queued.
                Ok(()) | Err(TrySendError::Full(())) => Ok(()),
                Err(TrySendError::Closed(())) => {
                    tracing::warn!("topics subscription is gone");
                    *topics = None;
                    Err("topics subscription closed")
                }
            }
        }
        ClientRequest::Messages(request) => {
            let filters = request.to_filters();
            tracing::debug!(topic = %filters.topic, predicates = filters.filters.len(), size = filters.size, "messages request");
            let updates = messages.get_or_insert_with(|| {
                let (tx, rx) = mpsc::channel(REQUEST_BUFFER);
                let stream = state.store.messages(cancel.child_token(), rx);
                tokio::spawn(forward(stream, outbound.clone(), Outbound::Message));
                tx
            });
            match updates.try_send(filters) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => {
                    tracing::warn!("messages subscription is busy, request dropped");
                    Err("busy, retry the request")
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::warn!("messages subscription is gone");
                    *messages = None;
                    Err("messages subscription closed")
                }
            }
        }
    }
}

async fn forward(
    mut stream: mpsc::Receiver<Message>,
    outbound: mpsc::Sender<Outbound>,
    wrap: fn(Message) -> Outbound,
) {
    while let Some(message) = stream.recv().await {
        if outbound.send(wrap(message)).await.is_err() {
            break;
        }
    }
}
