//! # pixelboard-core: Shared canvas model
//!
//! Synchronous building blocks of the pixel canvas. Nothing in this crate
//! touches an async runtime; the networking layer lives in
//! `pixelboard-collab`.
//!
//! ## Architecture
//!
//! ```text
//!   UpdateService (collab)
//!        │
//!        ├──► CooldownTracker   per-user check-and-record (DashMap entry lock)
//!        │
//!        └──► BoardStore        one AtomicU8 per cell, no grid lock
//!                  │
//!                  ▼
//!             BoardSnapshot ──► GET /board ──► ClientReconciler ◄── push stream
//! ```
//!
//! ## Modules
//!
//! - [`color`]: closed palette and its wire names
//! - [`board`]: dimensions, cells, the authoritative store and snapshots
//! - [`cooldown`]: per-user rate limiter
//! - [`reconcile`]: client-side merge of snapshot + push stream

pub mod board;
pub mod color;
pub mod cooldown;
pub mod reconcile;

pub use board::{BoardDimensions, BoardSnapshot, BoardStore, Cell, PixelChange};
pub use color::Color;
pub use cooldown::{CooldownDecision, CooldownPermit, CooldownTracker};
pub use reconcile::{ClientReconciler, ReconcileOutcome, ReconcilerStats, RenderedView};

use thiserror::Error;

/// Errors raised by the core model.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Unknown color: {0}")]
    UnknownColor(String),
    #[error("Coordinates ({x}, {y}) outside {width}x{height} board")]
    OutOfBounds {
        x: i64,
        y: i64,
        width: u32,
        height: u32,
    },
    #[error("Snapshot has {actual} cells, expected {expected}")]
    SnapshotSize { expected: usize, actual: usize },
}
