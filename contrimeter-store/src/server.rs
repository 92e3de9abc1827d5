//! Store server: shared state, WebSocket handler and the call-token
//! endpoint.
//!
//! Each WebSocket connection speaks the postcard-encoded store protocol:
//! the client sends [`ClientFrame`]s, the server answers every frame with a
//! [`ServerFrame::Reply`] carrying the same id and pushes
//! [`ServerFrame::Snapshot`]s for live subscriptions.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::ws::{Message, WebSocket};
use axum::http::StatusCode;
use contrimeter_proto::call::{CallTokenRequest, CallTokenResponse};
use contrimeter_proto::store::{
    self, ClientFrame, Reply, Request, ServerFrame, StoreFailure,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::database::Database;
use crate::live::LiveQuery;
use crate::token::{TokenError, TokenMinter};

/// Default maximum inbound frame size in bytes (8 MiB).
const DEFAULT_MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Shared server state.
pub struct ServerState {
    /// The document database.
    pub db: Arc<Database>,
    /// Call token minter.
    pub minter: TokenMinter,
    /// Maximum inbound frame size in bytes.
    max_frame_size: usize,
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new(Arc::new(Database::new()), TokenMinter::new(None))
    }
}

impl ServerState {
    /// Creates server state with the default frame size limit.
    #[must_use]
    pub const fn new(db: Arc<Database>, minter: TokenMinter) -> Self {
        Self {
            db,
            minter,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Overrides the inbound frame size limit.
    #[must_use]
    pub const fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }
}

/// Live subscriptions of one connection, keyed by client-chosen id.
type Subscriptions = HashMap<u64, LiveQuery>;

/// Handles an upgraded WebSocket connection.
///
/// The connection lifecycle:
/// 1. Spawn a writer task draining the outbound channel.
/// 2. Decode client frames and answer each one.
/// 3. On disconnect, drop every live subscription of the connection.
pub async fn handle_socket(socket: WebSocket, state: Arc<ServerState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!("WebSocket write failed");
                break;
            }
        }
    });

    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        let mut subscriptions = Subscriptions::new();
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Binary(data) => {
                    handle_binary_message(&data, &reader_state, &mut subscriptions, &tx);
                }
                Message::Close(_) => {
                    tracing::debug!("received close frame");
                    break;
                }
                _ => {
                    // Ignore text, ping, pong frames.
                }
            }
        }
        tracing::debug!(
            subscriptions = subscriptions.len(),
            "connection closed, dropping subscriptions"
        );
    });

    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }
}

/// Decodes one binary frame and dispatches its request.
fn handle_binary_message(
    data: &[u8],
    state: &Arc<ServerState>,
    subscriptions: &mut Subscriptions,
    tx: &mpsc::UnboundedSender<Message>,
) {
    if data.len() > state.max_frame_size {
        tracing::warn!(
            size = data.len(),
            max = state.max_frame_size,
            "frame exceeds size limit"
        );
        send_frame(
            tx,
            &ServerFrame::Error {
                reason: format!(
                    "frame too large: {} bytes (max {})",
                    data.len(),
                    state.max_frame_size
                ),
            },
        );
        return;
    }

    let frame = match store::decode_client(data) {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(error = %e, "failed to decode client frame");
            send_frame(tx, &ServerFrame::Error { reason: e });
            return;
        }
    };

    let ClientFrame { id, request } = frame;
    let result = match request {
        Request::Commit(batch) => state.db.commit(&batch).map(|()| Reply::Committed),
        Request::Query(query) => Ok(Reply::Snapshot(state.db.query(&query))),
        Request::Subscribe {
            subscription,
            query,
        } => {
            if subscriptions.contains_key(&subscription) {
                Err(StoreFailure::Conflict(format!(
                    "subscription {subscription} already active"
                )))
            } else {
                // The reply goes out before the live query's first snapshot.
                send_frame(
                    tx,
                    &ServerFrame::Reply {
                        id,
                        result: Ok(Reply::Subscribed),
                    },
                );
                let sink_tx = tx.clone();
                let live = LiveQuery::spawn(Arc::clone(&state.db), query, move |snapshot| {
                    send_frame(
                        &sink_tx,
                        &ServerFrame::Snapshot {
                            subscription,
                            snapshot,
                        },
                    )
                });
                subscriptions.insert(subscription, live);
                return;
            }
        }
        Request::Unsubscribe { subscription } => subscriptions
            .remove(&subscription)
            .map(|_| Reply::Unsubscribed)
            .ok_or_else(|| {
                StoreFailure::NotFound(format!("subscription {subscription}"))
            }),
        Request::CallToken(req) => state
            .minter
            .mint(&req)
            .map(Reply::CallToken)
            .map_err(token_failure),
    };

    if let Err(e) = &result {
        tracing::debug!(request_id = id, error = %e, "request refused");
    }
    send_frame(tx, &ServerFrame::Reply { id, result });
}

fn token_failure(err: TokenError) -> StoreFailure {
    match err {
        TokenError::MissingFields => StoreFailure::Invalid(err.to_string()),
        TokenError::NotConfigured => StoreFailure::Unavailable(err.to_string()),
        TokenError::Sign(e) => {
            tracing::error!(error = %e, "call token signing failed");
            StoreFailure::Unavailable("token signing failed".to_string())
        }
    }
}

/// Encodes a server frame onto the connection's outbound channel.
///
/// Returns `false` once the connection's writer is gone.
fn send_frame(tx: &mpsc::UnboundedSender<Message>, frame: &ServerFrame) -> bool {
    match store::encode_server(frame) {
        Ok(bytes) => tx.send(Message::Binary(bytes.into())).is_ok(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode server frame");
            true
        }
    }
}

/// axum handler for `POST /api/livekit/token`.
async fn token_handler(
    axum::extract::State(state): axum::extract::State<Arc<ServerState>>,
    Json(request): Json<CallTokenRequest>,
) -> Result<Json<CallTokenResponse>, (StatusCode, Json<serde_json::Value>)> {
    state.minter.mint(&request).map(Json).map_err(|err| {
        let status = match err {
            TokenError::MissingFields => StatusCode::BAD_REQUEST,
            TokenError::NotConfigured | TokenError::Sign(_) => {
                tracing::error!(error = %err, "call token request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let message = match err {
            TokenError::Sign(_) => "Failed to generate token".to_string(),
            other => other.to_string(),
        };
        (status, Json(serde_json::json!({ "error": message })))
    })
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<ServerState>>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Builds the axum router for the given state.
pub fn router(state: Arc<ServerState>) -> axum::Router {
    axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .route("/api/livekit/token", axum::routing::post(token_handler))
        .with_state(state)
}

/// Starts the store server on the given address with an empty database and
/// no call credentials.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(ServerState::default())).await
}

/// Starts the store server with a pre-configured [`ServerState`].
///
/// Returns the bound address (useful with port `0`) and the server task.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<ServerState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "store server error");
        }
    });
    Ok((bound_addr, handle))
}
