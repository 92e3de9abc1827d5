//! WebSocket client for a `contrimeter-store` server.
//!
//! Implements the [`DocumentStore`] trait over one WebSocket connection.
//! Requests are correlated with replies by id; live-query snapshots are
//! routed to their [`Subscription`] by subscription id.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use contrimeter_proto::call::{CallTokenRequest, CallTokenResponse};
use contrimeter_proto::store::{
    self, ClientFrame, Query, Reply, Request, ServerFrame, Snapshot, StoreFailure, WriteBatch,
};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::{DocumentStore, StoreError, Subscription};

/// Type alias for the read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Default timeout for connecting to the store server.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for a single request/reply round trip.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

type PendingReplies = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Reply, StoreFailure>>>>>;
type LiveSubscriptions = Arc<Mutex<HashMap<u64, mpsc::UnboundedSender<Snapshot>>>>;

/// Remote document store over WebSocket.
///
/// Created via [`RemoteStore::connect`], which establishes the connection
/// and spawns a background writer and reader.
pub struct RemoteStore {
    /// Store server URL (ws:// or wss://).
    url: String,
    /// Outbound frames, drained by the writer task.
    outbound: mpsc::UnboundedSender<Message>,
    /// Requests awaiting a reply, by request id.
    pending: PendingReplies,
    /// Active live queries, by subscription id.
    subscriptions: LiveSubscriptions,
    /// Source of request and subscription ids.
    next_id: Arc<AtomicU64>,
    /// Whether the connection is still up.
    connected: Arc<AtomicBool>,
    /// Round-trip timeout.
    request_timeout: Duration,
    _writer_handle: tokio::task::JoinHandle<()>,
    _reader_handle: tokio::task::JoinHandle<()>,
}

impl RemoteStore {
    /// Connect to a store server with the default timeouts.
    ///
    /// # Errors
    ///
    /// See [`RemoteStore::connect_with`].
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        Self::connect_with(url, CONNECT_TIMEOUT, REQUEST_TIMEOUT).await
    }

    /// Connect to a store server.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Unreachable`] if the URL is invalid or the server
    ///   refuses the connection.
    /// - [`StoreError::Timeout`] if the connection is not established within
    ///   `connect_timeout`.
    pub async fn connect_with(
        url: &str,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let parsed = url::Url::parse(url).map_err(|e| StoreError::Unreachable {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(StoreError::Unreachable {
                url: url.to_string(),
                reason: format!("unsupported scheme {:?}", parsed.scheme()),
            });
        }

        let (ws_stream, _response) = tokio::time::timeout(connect_timeout, connect_async(url))
            .await
            .map_err(|_| {
                tracing::warn!(url, "store WebSocket connect timed out");
                StoreError::Timeout
            })?
            .map_err(|e| {
                tracing::warn!(url, err = %e, "store WebSocket connect failed");
                StoreError::Unreachable {
                    url: url.to_string(),
                    reason: e.to_string(),
                }
            })?;

        let (mut ws_sender, ws_reader) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let pending = PendingReplies::default();
        let subscriptions = LiveSubscriptions::default();
        let connected = Arc::new(AtomicBool::new(true));

        let writer_connected = Arc::clone(&connected);
        let writer_handle = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if let Err(e) = ws_sender.send(msg).await {
                    tracing::warn!(err = %e, "store WebSocket write failed");
                    break;
                }
            }
            writer_connected.store(false, Ordering::Relaxed);
        });

        let reader_handle = tokio::spawn(reader_loop(
            ws_reader,
            Arc::clone(&pending),
            Arc::clone(&subscriptions),
            Arc::clone(&connected),
        ));

        tracing::info!(url, "connected to store");

        Ok(Self {
            url: url.to_string(),
            outbound,
            pending,
            subscriptions,
            next_id: Arc::new(AtomicU64::new(1)),
            connected,
            request_timeout,
            _writer_handle: writer_handle,
            _reader_handle: reader_handle,
        })
    }

    /// Return the store URL this client is connected to.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether the connection is still up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Sends a request and waits for its reply.
    async fn request(&self, request: Request) -> Result<Reply, StoreError> {
        if !self.is_connected() {
            return Err(StoreError::ConnectionClosed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        if let Err(e) = send_frame(&self.outbound, &ClientFrame { id, request }) {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Err(_) => {
                self.pending.lock().remove(&id);
                tracing::warn!(request_id = id, "store request timed out");
                Err(StoreError::Timeout)
            }
            Ok(Err(_)) => Err(StoreError::ConnectionClosed),
            Ok(Ok(result)) => result.map_err(StoreError::from),
        }
    }

    /// Asks the server to mint a video-call token.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Rejected`] if the server refuses (missing
    /// fields, no credentials configured) or a connection error.
    pub async fn call_token(
        &self,
        request: CallTokenRequest,
    ) -> Result<CallTokenResponse, StoreError> {
        match self.request(Request::CallToken(request)).await? {
            Reply::CallToken(response) => Ok(response),
            other => Err(unexpected_reply("call token", &other)),
        }
    }
}

impl DocumentStore for RemoteStore {
    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        match self.request(Request::Commit(batch)).await? {
            Reply::Committed => Ok(()),
            other => Err(unexpected_reply("committed", &other)),
        }
    }

    async fn query(&self, query: Query) -> Result<Snapshot, StoreError> {
        match self.request(Request::Query(query)).await? {
            Reply::Snapshot(snapshot) => Ok(snapshot),
            other => Err(unexpected_reply("snapshot", &other)),
        }
    }

    async fn subscribe(&self, query: Query) -> Result<Subscription, StoreError> {
        let subscription = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        // Registered before the request so the first snapshot is routed.
        self.subscriptions.lock().insert(subscription, tx);

        match self
            .request(Request::Subscribe {
                subscription,
                query,
            })
            .await
        {
            Ok(Reply::Subscribed) => {}
            Ok(other) => {
                self.subscriptions.lock().remove(&subscription);
                return Err(unexpected_reply("subscribed", &other));
            }
            Err(e) => {
                self.subscriptions.lock().remove(&subscription);
                return Err(e);
            }
        }

        let subscriptions = Arc::clone(&self.subscriptions);
        let outbound = self.outbound.clone();
        let next_id = Arc::clone(&self.next_id);
        Ok(Subscription::new(rx, move || {
            subscriptions.lock().remove(&subscription);
            let frame = ClientFrame {
                id: next_id.fetch_add(1, Ordering::Relaxed),
                request: Request::Unsubscribe { subscription },
            };
            // Best effort: the connection may already be gone.
            let _ = send_frame(&outbound, &frame);
        }))
    }
}

fn unexpected_reply(expected: &'static str, got: &Reply) -> StoreError {
    let got = match got {
        Reply::Committed => "committed",
        Reply::Snapshot(_) => "snapshot",
        Reply::Subscribed => "subscribed",
        Reply::Unsubscribed => "unsubscribed",
        Reply::CallToken(_) => "call token",
    };
    StoreError::UnexpectedReply {
        expected,
        got: got.to_string(),
    }
}

fn send_frame(
    outbound: &mpsc::UnboundedSender<Message>,
    frame: &ClientFrame,
) -> Result<(), StoreError> {
    let bytes = store::encode_client(frame).map_err(StoreError::Io)?;
    outbound
        .send(Message::Binary(bytes.into()))
        .map_err(|_| StoreError::ConnectionClosed)
}

/// Background task that reads server frames and dispatches them.
///
/// Replies complete their pending request; snapshots go to their
/// subscription. Malformed frames are logged and skipped. When the
/// connection ends every pending request fails with
/// [`StoreError::ConnectionClosed`] and every subscription ends.
async fn reader_loop(
    mut ws_reader: WsReader,
    pending: PendingReplies,
    subscriptions: LiveSubscriptions,
    connected: Arc<AtomicBool>,
) {
    while let Some(msg_result) = ws_reader.next().await {
        match msg_result {
            Ok(Message::Binary(data)) => match store::decode_server(&data) {
                Ok(ServerFrame::Reply { id, result }) => {
                    let waiter = pending.lock().remove(&id);
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(result);
                        }
                        None => tracing::debug!(request_id = id, "reply without waiter"),
                    }
                }
                Ok(ServerFrame::Snapshot {
                    subscription,
                    snapshot,
                }) => {
                    let mut subs = subscriptions.lock();
                    let delivered = subs
                        .get(&subscription)
                        .is_some_and(|tx| tx.send(snapshot).is_ok());
                    if !delivered {
                        subs.remove(&subscription);
                    }
                }
                Ok(ServerFrame::Error { reason }) => {
                    tracing::warn!(reason = %reason, "store server error");
                }
                Err(e) => {
                    tracing::warn!(err = %e, "malformed store frame, skipping");
                }
            },
            Ok(Message::Close(_)) => {
                tracing::info!("store WebSocket closed by server");
                break;
            }
            Ok(_) => {
                // Ignore ping/pong/text/raw frames.
            }
            Err(e) => {
                tracing::warn!(err = %e, "store WebSocket read error");
                break;
            }
        }
    }
    connected.store(false, Ordering::Relaxed);
    pending.lock().clear();
    subscriptions.lock().clear();
    tracing::info!("store reader task exiting");
}
