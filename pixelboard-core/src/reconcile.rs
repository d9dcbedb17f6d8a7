//! Client-side reconciliation of the board snapshot with the push stream.
//!
//! ```text
//!   push ──┐
//!          ▼
//!   AwaitingSnapshot ──(snapshot)──► Live ──(begin_resync)──► Resyncing
//!     buffer pushes        replay buffer   apply pushes   keep old view,
//!                                                         buffer pushes
//!                                          ◄──(snapshot)──┘
//! ```
//!
//! The reconciler is driven from exactly one event queue, so it needs no
//! locking. A push received before the snapshot it races with is replayed
//! on top of that snapshot in arrival order.
//!
//! The buffer is bounded. When it overflows the oldest push is lost, the
//! push reports [`ReconcileOutcome::Overflowed`] and
//! [`ClientReconciler::resync_required`] stays set until the owner calls
//! [`ClientReconciler::begin_resync`] and fetches a fresh snapshot. Every
//! `begin_resync` adds one expected snapshot; pushes stay buffered and are
//! replayed onto each snapshot until the last expected one lands.

use std::collections::{HashMap, VecDeque};

use crate::board::{BoardSnapshot, Cell, PixelChange};
use crate::color::Color;

const DEFAULT_BUFFER_LIMIT: usize = 4096;

/// The cells a client currently displays.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderedView {
    cells: HashMap<Cell, Color>,
}

impl RenderedView {
    pub fn from_snapshot(snapshot: &BoardSnapshot) -> Self {
        Self {
            cells: snapshot.iter().collect(),
        }
    }

    pub fn from_cells(cells: impl IntoIterator<Item = (Cell, Color)>) -> Self {
        Self {
            cells: cells.into_iter().collect(),
        }
    }

    pub fn get(&self, cell: Cell) -> Option<Color> {
        self.cells.get(&cell).copied()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Overwrite one represented cell. Unknown cells are left alone.
    fn paint(&mut self, change: &PixelChange) -> bool {
        match self.cells.get_mut(&change.cell()) {
            Some(slot) => {
                *slot = change.color;
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingSnapshot,
    Live,
    Resyncing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Held until the next snapshot.
    Buffered,
    /// Held, but the buffer was full and its oldest push was discarded. The
    /// view can no longer be trusted without a fresh snapshot.
    Overflowed,
    /// Painted onto the live view.
    Applied,
    /// Named a cell the view does not represent.
    Ignored,
    SnapshotApplied { replayed: usize, ignored: usize },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilerStats {
    pub snapshots_applied: u64,
    pub pushes_applied: u64,
    pub pushes_buffered: u64,
    pub pushes_ignored: u64,
    pub buffer_overflows: u64,
}

pub struct ClientReconciler {
    phase: Phase,
    view: RenderedView,
    pending: VecDeque<PixelChange>,
    buffer_limit: usize,
    /// Snapshots still expected before going live.
    awaited: usize,
    resync_required: bool,
    stats: ReconcilerStats,
}

impl Default for ClientReconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientReconciler {
    pub fn new() -> Self {
        Self::with_buffer_limit(DEFAULT_BUFFER_LIMIT)
    }

    pub fn with_buffer_limit(buffer_limit: usize) -> Self {
        Self {
            phase: Phase::AwaitingSnapshot,
            view: RenderedView::default(),
            pending: VecDeque::new(),
            buffer_limit: buffer_limit.max(1),
            awaited: 1,
            resync_required: false,
            stats: ReconcilerStats::default(),
        }
    }

    /// Handle one push message.
    pub fn apply_push(&mut self, change: PixelChange) -> ReconcileOutcome {
        match self.phase {
            Phase::AwaitingSnapshot => self.buffer(change),
            Phase::Resyncing => {
                // The stale view keeps moving; the replay re-applies it later.
                self.view.paint(&change);
                self.buffer(change)
            }
            Phase::Live => {
                if self.view.paint(&change) {
                    self.stats.pushes_applied += 1;
                    ReconcileOutcome::Applied
                } else {
                    log::debug!("Ignoring push for unrendered cell {}", change.cell());
                    self.stats.pushes_ignored += 1;
                    ReconcileOutcome::Ignored
                }
            }
        }
    }

    /// Install a snapshot, then replay every buffered push in arrival order.
    /// The buffer is released only once no further snapshot is expected.
    pub fn apply_snapshot(&mut self, view: RenderedView) -> ReconcileOutcome {
        self.view = view;
        self.stats.snapshots_applied += 1;
        self.awaited = self.awaited.saturating_sub(1);

        let mut replayed = 0;
        let mut ignored = 0;
        for change in &self.pending {
            if self.view.paint(change) {
                replayed += 1;
            } else {
                ignored += 1;
            }
        }
        if self.awaited == 0 {
            self.pending.clear();
            self.phase = Phase::Live;
        } else {
            self.phase = Phase::Resyncing;
        }
        self.stats.pushes_applied += replayed as u64;
        self.stats.pushes_ignored += ignored as u64;

        if replayed + ignored > 0 {
            log::debug!("Snapshot applied, replayed {replayed} buffered pushes ({ignored} ignored)");
        }
        ReconcileOutcome::SnapshotApplied { replayed, ignored }
    }

    /// Start buffering again ahead of a fresh snapshot, keeping the current
    /// view on screen meanwhile. The caller must follow up with exactly one
    /// [`apply_snapshot`](Self::apply_snapshot) or
    /// [`abandon_resync`](Self::abandon_resync).
    pub fn begin_resync(&mut self) {
        self.awaited += 1;
        self.resync_required = false;
        if self.phase == Phase::Live {
            self.phase = Phase::Resyncing;
        }
    }

    /// Withdraw a resync whose snapshot could not be fetched. The current
    /// view, which has kept receiving pushes, becomes live again.
    pub fn abandon_resync(&mut self) {
        if self.phase != Phase::Resyncing || self.awaited == 0 {
            return;
        }
        self.awaited -= 1;
        if self.awaited == 0 {
            self.pending.clear();
            self.phase = Phase::Live;
        }
    }

    fn buffer(&mut self, change: PixelChange) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::Buffered;
        if self.pending.len() >= self.buffer_limit {
            self.pending.pop_front();
            self.stats.buffer_overflows += 1;
            self.resync_required = true;
            outcome = ReconcileOutcome::Overflowed;
            log::warn!("Reconciler buffer full, discarding oldest pending push");
        }
        self.pending.push_back(change);
        self.stats.pushes_buffered += 1;
        outcome
    }

    pub fn is_live(&self) -> bool {
        self.phase == Phase::Live
    }

    /// A buffered push was lost since the last [`begin_resync`](Self::begin_resync).
    pub fn resync_required(&self) -> bool {
        self.resync_required
    }

    pub fn view(&self) -> &RenderedView {
        &self.view
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> &ReconcilerStats {
        &self.stats
    }
}
