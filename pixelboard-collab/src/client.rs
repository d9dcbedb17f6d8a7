//! Canvas client: push channel, board fetch, and pixel writes.
//!
//! The push channel and snapshot fetches both feed one inbound queue. A
//! single task owns the [`ClientReconciler`] and drains that queue, so
//! pushes and snapshots are applied in the order they arrived:
//!
//! ```text
//!  WebSocket reader ──Push──────┐
//!  connect()/resync() ─Snapshot─┤
//!  resync worker ─────Snapshot──┼──► inbound queue ──► reconciler task
//!  view()/stats() ────Inspect───┘         ▲               │      │
//!                                         │   overflow    │      ▼
//!                                         └── trigger ◄───┘  CanvasEvent channel
//! ```
//!
//! When the reconciler's buffer overflows, the reconciler task starts a
//! resync on the spot and wakes the resync worker, which fetches the board
//! and queues the snapshot like any other.

use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use pixelboard_core::{
    BoardDimensions, BoardSnapshot, ClientReconciler, Color, PixelChange, ReconcileOutcome,
    ReconcilerStats, RenderedView,
};

use crate::auth::{Credential, Identity};
use crate::protocol::{
    decode_push, BoardResponse, ErrorBody, TokenRequest, TokenResponse, UpdatePixelRequest,
    UpdatePixelResponse,
};

const INBOUND_CAPACITY: usize = 1024;
const EVENT_CAPACITY: usize = 256;
const RESYNC_ATTEMPTS: u32 = 3;
const RESYNC_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the canvas client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CanvasEvent {
    Connected,
    Disconnected,
    /// A snapshot was installed and the buffered pushes replayed on top.
    SnapshotApplied { replayed: usize, ignored: usize },
    /// A live push was painted onto the view.
    PixelChanged(PixelChange),
    /// Buffered pushes were lost; a fresh snapshot has been requested.
    ResyncRequired,
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
    #[error("Server returned {status}: {detail}")]
    Server { status: u16, detail: String },
    #[error("No session, call login first")]
    NotAuthenticated,
    #[error("Not connected")]
    NotConnected,
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("WebSocket error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
}

struct Inspection {
    view: RenderedView,
    stats: ReconcilerStats,
    live: bool,
}

enum Inbound {
    Push(PixelChange),
    Snapshot(RenderedView),
    BeginResync,
    AbandonResync,
    Inspect(oneshot::Sender<Inspection>),
}

#[derive(Clone)]
struct Session {
    identity: Identity,
    credential: Credential,
}

/// `GET /board` with a fixed credential, shareable with background tasks.
#[derive(Clone)]
struct BoardFetcher {
    http: reqwest::Client,
    base_url: String,
    dims: BoardDimensions,
    credential: Credential,
}

impl BoardFetcher {
    async fn fetch(&self) -> Result<BoardSnapshot, ClientError> {
        let response = self
            .http
            .get(format!("{}/board", self.base_url))
            .bearer_auth(self.credential.token())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        let body: BoardResponse = response.json().await?;
        Ok(body.into_snapshot(self.dims))
    }
}

/// The canvas client.
pub struct CanvasClient {
    /// `http://host:port`
    base_url: String,
    http: reqwest::Client,
    dims: BoardDimensions,
    buffer_limit: usize,
    session: Option<Session>,
    state: Arc<RwLock<ConnectionState>>,
    /// Sender side of the reconciler's queue, present while connected
    inbound_tx: Option<mpsc::Sender<Inbound>>,
    tasks: Vec<JoinHandle<()>>,
    event_tx: mpsc::Sender<CanvasEvent>,
    event_rx: Option<mpsc::Receiver<CanvasEvent>>,
}

impl CanvasClient {
    pub fn new(base_url: impl Into<String>, dims: BoardDimensions) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            dims,
            buffer_limit: 4096,
            session: None,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            inbound_tx: None,
            tasks: Vec::new(),
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Bound on pushes held while waiting for a snapshot.
    pub fn with_buffer_limit(mut self, limit: usize) -> Self {
        self.buffer_limit = limit;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<CanvasEvent>> {
        self.event_rx.take()
    }

    /// Obtain a session from `POST /token`.
    pub async fn login(&mut self, username: &str) -> Result<Identity, ClientError> {
        let response = self
            .http
            .post(format!("{}/token", self.base_url))
            .json(&TokenRequest {
                username: username.to_string(),
            })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        let token: TokenResponse = response.json().await?;
        let identity = Identity {
            user_id: token.user_id,
            username: username.to_string(),
        };
        self.set_session(identity.clone(), Credential::bearer(token.access_token));
        Ok(identity)
    }

    /// Use a session obtained elsewhere.
    pub fn set_session(&mut self, identity: Identity, credential: Credential) {
        self.session = Some(Session {
            identity,
            credential,
        });
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.session.as_ref().map(|s| &s.identity)
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Open the push channel, then fetch the board.
    ///
    /// Pushes arriving before the board response are buffered by the
    /// reconciler and replayed on top of it.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        let session = self.session.clone().ok_or(ClientError::NotAuthenticated)?;
        self.disconnect().await;
        *self.state.write().await = ConnectionState::Connecting;

        let url = format!(
            "{}/ws?token={}",
            websocket_base(&self.base_url),
            session.credential.token()
        );
        let ws_stream = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(e.into());
            }
        };

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (resync_tx, resync_rx) = mpsc::channel(1);
        let fetcher = self.fetcher(&session);
        let reconciler = ClientReconciler::with_buffer_limit(self.buffer_limit);
        self.tasks.push(tokio::spawn(reconcile_loop(
            reconciler,
            inbound_rx,
            self.event_tx.clone(),
            resync_tx,
        )));
        self.tasks.push(tokio::spawn(resync_worker(
            resync_rx,
            inbound_tx.downgrade(),
            fetcher,
        )));

        // Reader task: forward push frames into the reconciler queue.
        let pushes = inbound_tx.clone();
        let state = self.state.clone();
        let event_tx = self.event_tx.clone();
        self.tasks.push(tokio::spawn(async move {
            let mut ws_stream = ws_stream;
            while let Some(frame) = ws_stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => match decode_push(text.as_str()) {
                        Ok(change) => {
                            if pushes.send(Inbound::Push(change)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Discarding malformed push frame: {e}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Err(e) => {
                        log::warn!("Push channel error: {e}");
                        break;
                    }
                    _ => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.try_send(CanvasEvent::Disconnected);
        }));
        self.inbound_tx = Some(inbound_tx);

        if let Err(e) = self.load_snapshot().await {
            self.disconnect().await;
            return Err(e);
        }

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.try_send(CanvasEvent::Connected);
        log::info!("Connected to {} as {}", self.base_url, session.identity.username);
        Ok(())
    }

    /// Replace the view with a fresh snapshot. The current view stays visible
    /// and keeps receiving pushes until the snapshot lands.
    pub async fn resync(&self) -> Result<(), ClientError> {
        self.enqueue(Inbound::BeginResync).await?;
        if let Err(e) = self.load_snapshot().await {
            let _ = self.enqueue(Inbound::AbandonResync).await;
            return Err(e);
        }
        Ok(())
    }

    async fn load_snapshot(&self) -> Result<(), ClientError> {
        let snapshot = self.fetch_board().await?;
        self.enqueue(Inbound::Snapshot(RenderedView::from_snapshot(&snapshot)))
            .await
    }

    /// `GET /board`.
    pub async fn fetch_board(&self) -> Result<BoardSnapshot, ClientError> {
        let session = self.session.as_ref().ok_or(ClientError::NotAuthenticated)?;
        self.fetcher(session).fetch().await
    }

    fn fetcher(&self, session: &Session) -> BoardFetcher {
        BoardFetcher {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            dims: self.dims,
            credential: session.credential.clone(),
        }
    }

    /// `POST /update_pixel` as the logged-in user.
    pub async fn update_pixel(
        &self,
        x: i64,
        y: i64,
        color: Color,
    ) -> Result<UpdatePixelResponse, ClientError> {
        let session = self.session.as_ref().ok_or(ClientError::NotAuthenticated)?;
        let body = UpdatePixelRequest {
            x,
            y,
            color: color.as_str().to_string(),
            user_id: session.identity.user_id.clone(),
            username: session.identity.username.clone(),
        };
        let response = self
            .http
            .post(format!("{}/update_pixel", self.base_url))
            .bearer_auth(session.credential.token())
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(response.json().await?)
    }

    /// The cells currently displayed.
    pub async fn view(&self) -> Result<RenderedView, ClientError> {
        Ok(self.inspect().await?.view)
    }

    pub async fn reconciler_stats(&self) -> Result<ReconcilerStats, ClientError> {
        Ok(self.inspect().await?.stats)
    }

    /// Whether a snapshot has been applied and no resync is in flight.
    pub async fn is_live(&self) -> Result<bool, ClientError> {
        Ok(self.inspect().await?.live)
    }

    async fn inspect(&self) -> Result<Inspection, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(Inbound::Inspect(tx)).await?;
        rx.await.map_err(|_| ClientError::NotConnected)
    }

    async fn enqueue(&self, item: Inbound) -> Result<(), ClientError> {
        let tx = self.inbound_tx.as_ref().ok_or(ClientError::NotConnected)?;
        tx.send(item).await.map_err(|_| ClientError::NotConnected)
    }

    /// Close the push channel and stop the reconciler.
    pub async fn disconnect(&mut self) {
        self.inbound_tx = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        *self.state.write().await = ConnectionState::Disconnected;
    }
}

impl Drop for CanvasClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn reconcile_loop(
    mut reconciler: ClientReconciler,
    mut inbound: mpsc::Receiver<Inbound>,
    events: mpsc::Sender<CanvasEvent>,
    resync: mpsc::Sender<()>,
) {
    while let Some(item) = inbound.recv().await {
        let event = match item {
            Inbound::Push(change) => match reconciler.apply_push(change) {
                ReconcileOutcome::Applied => Some(CanvasEvent::PixelChanged(change)),
                ReconcileOutcome::Overflowed => {
                    // A full trigger slot means a fetch is already queued
                    // behind this push; it covers the loss too.
                    if resync.try_send(()).is_ok() {
                        reconciler.begin_resync();
                    }
                    Some(CanvasEvent::ResyncRequired)
                }
                _ => None,
            },
            Inbound::Snapshot(view) => match reconciler.apply_snapshot(view) {
                ReconcileOutcome::SnapshotApplied { replayed, ignored } => {
                    Some(CanvasEvent::SnapshotApplied { replayed, ignored })
                }
                _ => None,
            },
            Inbound::BeginResync => {
                reconciler.begin_resync();
                None
            }
            Inbound::AbandonResync => {
                reconciler.abandon_resync();
                None
            }
            Inbound::Inspect(reply) => {
                let _ = reply.send(Inspection {
                    view: reconciler.view().clone(),
                    stats: reconciler.stats().clone(),
                    live: reconciler.is_live(),
                });
                None
            }
        };
        // Never stall the reconciler on a consumer that stopped reading.
        if let Some(event) = event {
            let _ = events.try_send(event);
        }
    }
}

/// Fetch a snapshot for every trigger and queue it for the reconciler. Holds
/// only a weak handle on the queue so it never keeps the reconciler alive.
async fn resync_worker(
    mut triggers: mpsc::Receiver<()>,
    inbound: mpsc::WeakSender<Inbound>,
    fetcher: BoardFetcher,
) {
    while triggers.recv().await.is_some() {
        let item = match fetch_with_retry(&fetcher).await {
            Ok(snapshot) => Inbound::Snapshot(RenderedView::from_snapshot(&snapshot)),
            Err(e) => {
                log::error!("Resync failed, keeping current view: {e}");
                Inbound::AbandonResync
            }
        };
        let Some(inbound) = inbound.upgrade() else {
            break;
        };
        if inbound.send(item).await.is_err() {
            break;
        }
    }
}

async fn fetch_with_retry(fetcher: &BoardFetcher) -> Result<BoardSnapshot, ClientError> {
    let mut attempt = 1;
    loop {
        match fetcher.fetch().await {
            Ok(snapshot) => return Ok(snapshot),
            Err(e) if attempt < RESYNC_ATTEMPTS => {
                log::warn!("Resync fetch attempt {attempt} failed: {e}");
                attempt += 1;
                tokio::time::sleep(RESYNC_RETRY_DELAY).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn websocket_base(base_url: &str) -> String {
    if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base_url.to_string()
    }
}

async fn error_from_response(response: reqwest::Response) -> ClientError {
    let status = response.status();
    let body: Option<ErrorBody> = response.json().await.ok();
    let detail = body
        .as_ref()
        .map(|b| b.detail.clone())
        .unwrap_or_else(|| status.to_string());
    match status.as_u16() {
        400 | 422 => ClientError::InvalidRequest(detail),
        401 => ClientError::Unauthorized(detail),
        403 => ClientError::Forbidden(detail),
        429 => {
            let secs = body.and_then(|b| b.retry_after).unwrap_or(0.0);
            ClientError::RateLimited {
                retry_after: Duration::try_from_secs_f64(secs).unwrap_or_default(),
            }
        }
        code => ClientError::Server {
            status: code,
            detail,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_base() {
        assert_eq!(websocket_base("http://127.0.0.1:8000"), "ws://127.0.0.1:8000");
        assert_eq!(websocket_base("https://canvas.example"), "wss://canvas.example");
        assert_eq!(websocket_base("ws://already"), "ws://already");
    }

    #[tokio::test]
    async fn test_client_starts_disconnected() {
        let mut client = CanvasClient::new("http://127.0.0.1:1/", BoardDimensions::default());
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert!(client.identity().is_none());
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_operations_require_session() {
        let mut client = CanvasClient::new("http://127.0.0.1:1", BoardDimensions::default());
        assert!(matches!(
            client.update_pixel(0, 0, Color::Red).await,
            Err(ClientError::NotAuthenticated)
        ));
        assert!(matches!(client.connect().await, Err(ClientError::NotAuthenticated)));
        assert!(matches!(client.view().await, Err(ClientError::NotConnected)));
    }

    #[tokio::test]
    async fn test_reconcile_loop_orders_push_before_snapshot() {
        let (tx, rx) = mpsc::channel(16);
        let (event_tx, mut events) = mpsc::channel(16);
        let (resync_tx, _resync_rx) = mpsc::channel(1);
        let task = tokio::spawn(reconcile_loop(ClientReconciler::new(), rx, event_tx, resync_tx));

        let dims = BoardDimensions::new(4, 4);
        let cell = dims.cell(1, 1).unwrap();
        tx.send(Inbound::Push(PixelChange::new(cell, Color::Red))).await.unwrap();
        let snapshot = BoardSnapshot::blank(dims);
        tx.send(Inbound::Snapshot(RenderedView::from_snapshot(&snapshot)))
            .await
            .unwrap();

        let (reply, answer) = oneshot::channel();
        tx.send(Inbound::Inspect(reply)).await.unwrap();
        let inspection = answer.await.unwrap();
        assert!(inspection.live);
        assert_eq!(inspection.view.get(cell), Some(Color::Red));
        assert_eq!(
            events.recv().await,
            Some(CanvasEvent::SnapshotApplied {
                replayed: 1,
                ignored: 0
            })
        );

        drop(tx);
        task.await.unwrap();
    }

    async fn inspect_loop(tx: &mpsc::Sender<Inbound>) -> Inspection {
        let (reply, answer) = oneshot::channel();
        tx.send(Inbound::Inspect(reply)).await.unwrap();
        answer.await.unwrap()
    }

    #[tokio::test]
    async fn test_overflow_triggers_single_resync() {
        let (tx, rx) = mpsc::channel(16);
        let (event_tx, mut events) = mpsc::channel(16);
        let (resync_tx, mut resync_rx) = mpsc::channel(1);
        let reconciler = ClientReconciler::with_buffer_limit(1);
        let task = tokio::spawn(reconcile_loop(reconciler, rx, event_tx, resync_tx));

        let dims = BoardDimensions::new(4, 4);
        for x in 0..3 {
            let cell = dims.cell(x, 0).unwrap();
            tx.send(Inbound::Push(PixelChange::new(cell, Color::Red))).await.unwrap();
        }
        let inspection = inspect_loop(&tx).await;
        assert_eq!(inspection.stats.buffer_overflows, 2);
        assert_eq!(events.recv().await, Some(CanvasEvent::ResyncRequired));
        assert_eq!(events.recv().await, Some(CanvasEvent::ResyncRequired));

        // Both overflows share the one queued fetch.
        assert_eq!(resync_rx.try_recv(), Ok(()));
        assert!(resync_rx.try_recv().is_err());

        // Connect-time snapshot, then the resync snapshot.
        let blank = RenderedView::from_snapshot(&BoardSnapshot::blank(dims));
        tx.send(Inbound::Snapshot(blank.clone())).await.unwrap();
        assert!(!inspect_loop(&tx).await.live);
        tx.send(Inbound::Snapshot(blank)).await.unwrap();
        let inspection = inspect_loop(&tx).await;
        assert!(inspection.live);
        assert_eq!(inspection.view.get(dims.cell(2, 0).unwrap()), Some(Color::Red));

        drop(tx);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_resync_worker_abandons_after_retries() {
        let (inbound_tx, mut inbound_rx) = mpsc::channel(4);
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let fetcher = BoardFetcher {
            http: reqwest::Client::new(),
            base_url: "http://127.0.0.1:1".to_string(),
            dims: BoardDimensions::new(4, 4),
            credential: Credential::bearer("t"),
        };
        let worker = tokio::spawn(resync_worker(trigger_rx, inbound_tx.downgrade(), fetcher));

        trigger_tx.send(()).await.unwrap();
        assert!(matches!(inbound_rx.recv().await, Some(Inbound::AbandonResync)));

        drop(trigger_tx);
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_resync_worker_queues_fresh_board() {
        use crate::server::{CanvasServer, ServerConfig};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(CanvasServer::new(ServerConfig {
            bind_addr: addr.to_string(),
            ..ServerConfig::default()
        }));
        let running = server.clone();
        tokio::spawn(async move { running.serve(listener).await.unwrap() });
        let (credential, _) = server.sessions().unwrap().issue("dora");

        let (inbound_tx, mut inbound_rx) = mpsc::channel(4);
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let dims = BoardDimensions::default();
        let fetcher = BoardFetcher {
            http: reqwest::Client::new(),
            base_url: format!("http://{addr}"),
            dims,
            credential,
        };
        tokio::spawn(resync_worker(trigger_rx, inbound_tx.downgrade(), fetcher));

        trigger_tx.send(()).await.unwrap();
        match inbound_rx.recv().await {
            Some(Inbound::Snapshot(view)) => assert_eq!(view.len(), dims.cell_count()),
            _ => panic!("expected a snapshot"),
        }
    }
}
