//! # pixelboard-collab: Networked layer of the shared canvas
//!
//! HTTP endpoints for reading and writing the board, a WebSocket push
//! channel that fans accepted updates out to every viewer, and a client
//! that keeps a local view consistent with both.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   POST /update_pixel   ┌──────────────┐
//! │ CanvasClient │ ─────────────────────► │ CanvasServer │
//! │ (per viewer) │   GET /board           │  (central)   │
//! │              │ ◄───────────────────── │              │
//! │              │   WS /ws  {x,y,color}  │              │
//! │              │ ◄───────────────────── │              │
//! └──────┬───────┘                        └──────┬───────┘
//!        │                                       │
//!        ▼                                       ▼
//! ┌──────────────┐                   ┌──────────────────────┐
//! │ Reconciler   │                   │ UpdateService        │
//! │ (one queue)  │                   │  → CooldownTracker   │
//! └──────────────┘                   │  → BoardStore        │
//!                                    │  → BroadcastHub      │
//!                                    └──────────┬───────────┘
//!                                               │ per-viewer queues
//!                                    ┌──────────┴───────────┐
//!                                    │ ConnectionManager    │
//!                                    └──────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON bodies and push frames
//! - [`auth`]: credential → identity seam and the in-memory session registry
//! - [`broadcast`]: fan-out with bounded per-subscriber queues
//! - [`service`]: update and snapshot services
//! - [`connection`]: one task per push-channel viewer
//! - [`server`]: axum router, error mapping, configuration
//! - [`client`]: push channel + HTTP client with reconciliation

pub mod auth;
pub mod broadcast;
pub mod client;
pub mod connection;
pub mod protocol;
pub mod server;
pub mod service;

// Re-exports for convenience
pub use auth::{AuthError, Authenticator, Credential, Identity, SessionRegistry};
pub use broadcast::{BroadcastHub, BroadcastStats, Subscription};
pub use client::{CanvasClient, CanvasEvent, ClientError, ConnectionState};
pub use connection::{ConnectionInfo, ConnectionManager, ConnectionStats};
pub use protocol::{
    BoardResponse, ErrorBody, PixelMessage, ProtocolError, TokenRequest, TokenResponse,
    UpdatePixelRequest, UpdatePixelResponse,
};
pub use server::{ApiError, CanvasServer, ServerConfig, ServerError, ServerStats};
pub use service::{AppliedUpdate, ServiceError, SnapshotService, UpdateRequest, UpdateService};
