//! Push-channel connections.
//!
//! ```text
//! upgrade request ──► ConnectionManager::subscribe (own bounded queue)
//!                  │ handshake completes, socket handed over
//!                  ▼ ConnectionManager::serve
//!            ┌── select! ──────────────────────────────┐
//!            │ queue.recv()  → text frame {x, y, color} │
//!            │ socket.next() → close / error ends loop  │
//!            │ heartbeat     → ping                     │
//!            └──────────────────────────────────────────┘
//!                  │ on exit: unsubscribe, drop queued messages
//! ```

use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::auth::Identity;
use crate::broadcast::{BroadcastHub, Subscription};
use crate::protocol::encode_push;

/// Bookkeeping for one live viewer.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub subscriber_id: Uuid,
    /// `None` for anonymous viewers.
    pub viewer: Option<Identity>,
    pub connected_at: Instant,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub total_connections: u64,
    pub active_connections: usize,
    pub frames_sent: u64,
}

pub struct ConnectionManager {
    hub: Arc<BroadcastHub>,
    live: DashMap<Uuid, ConnectionInfo>,
    queue_capacity: usize,
    heartbeat_interval: Duration,
    total_connections: AtomicU64,
    frames_sent: AtomicU64,
}

impl ConnectionManager {
    pub fn new(hub: Arc<BroadcastHub>, queue_capacity: usize, heartbeat_interval: Duration) -> Self {
        Self {
            hub,
            live: DashMap::new(),
            queue_capacity,
            heartbeat_interval,
            total_connections: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
        }
    }

    /// Register a viewer queue. Called before the upgrade response is sent,
    /// so a client that has finished its handshake is already receiving.
    pub fn subscribe(&self) -> Subscription {
        self.hub.subscribe_with_capacity(self.queue_capacity)
    }

    /// Drive one viewer's push channel until it disconnects.
    pub async fn serve(
        &self,
        socket: WebSocket,
        mut subscription: Subscription,
        viewer: Option<Identity>,
    ) {
        let id = subscription.id();
        let who = viewer
            .as_ref()
            .map_or_else(|| "anonymous".to_string(), |v| v.username.clone());

        self.live.insert(
            id,
            ConnectionInfo {
                subscriber_id: id,
                viewer,
                connected_at: Instant::now(),
            },
        );
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        log::info!("Viewer {who} connected ({id}), {} live", self.live.len());

        let (mut ws_sender, mut ws_receiver) = socket.split();
        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + self.heartbeat_interval,
            self.heartbeat_interval,
        );

        loop {
            tokio::select! {
                incoming = ws_receiver.next() => {
                    match incoming {
                        Some(Ok(Message::Close(_))) | None => {
                            log::debug!("Viewer {id} closed the connection");
                            break;
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error from viewer {id}: {e}");
                            break;
                        }
                        // Pings are answered by the transport; client payloads carry nothing.
                        Some(Ok(_)) => {}
                    }
                }

                queued = subscription.recv() => {
                    let Some(msg) = queued else {
                        log::debug!("Viewer {id} dropped by the hub");
                        break;
                    };
                    let text = match encode_push(&msg) {
                        Ok(text) => text,
                        Err(e) => {
                            log::warn!("Skipping unencodable push for {id}: {e}");
                            continue;
                        }
                    };
                    if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                        log::warn!("Push to viewer {id} failed: {e}");
                        break;
                    }
                    self.frames_sent.fetch_add(1, Ordering::Relaxed);
                }

                _ = heartbeat.tick() => {
                    if ws_sender.send(Message::Ping(Default::default())).await.is_err() {
                        log::debug!("Heartbeat to viewer {id} failed");
                        break;
                    }
                }
            }
        }

        self.hub.unsubscribe(&id);
        self.live.remove(&id);
        log::info!("Viewer {who} disconnected ({id}), {} live", self.live.len());
    }

    pub fn active_connections(&self) -> usize {
        self.live.len()
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.live.iter().map(|e| e.value().clone()).collect()
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.live.len(),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
        }
    }
}
