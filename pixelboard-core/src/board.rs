//! Board geometry, the authoritative cell store, and snapshots.
//!
//! The store keeps one `AtomicU8` per cell, laid out row-major. A write is a
//! single atomic swap, so concurrent writers to the same cell serialize with
//! last-writer-wins and writers to different cells never touch shared state.
//! A snapshot loads every cell in turn: it may interleave with writes (cells
//! can come from different moments) but each cell is a value that was
//! actually stored.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::color::Color;
use crate::CoreError;

/// Fixed board size, shared by server and clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardDimensions {
    pub width: u32,
    pub height: u32,
}

impl Default for BoardDimensions {
    fn default() -> Self {
        Self {
            width: 100,
            height: 100,
        }
    }
}

impl BoardDimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn cell_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Whether `(x, y)` lies in `[0, width) × [0, height)`.
    pub fn contains(&self, x: i64, y: i64) -> bool {
        (0..self.width as i64).contains(&x) && (0..self.height as i64).contains(&y)
    }

    /// Validate raw coordinates into a [`Cell`].
    pub fn cell(&self, x: i64, y: i64) -> Result<Cell, CoreError> {
        if !self.contains(x, y) {
            return Err(CoreError::OutOfBounds {
                x,
                y,
                width: self.width,
                height: self.height,
            });
        }
        Ok(Cell {
            x: x as u32,
            y: y as u32,
        })
    }

    /// Row-major index of a cell.
    pub fn index(&self, cell: Cell) -> usize {
        cell.y as usize * self.width as usize + cell.x as usize
    }

    /// Row-major index, or `None` for a cell outside this board.
    pub fn checked_index(&self, cell: Cell) -> Option<usize> {
        (cell.x < self.width && cell.y < self.height).then(|| self.index(cell))
    }

    fn out_of_bounds(&self, cell: Cell) -> CoreError {
        CoreError::OutOfBounds {
            x: cell.x.into(),
            y: cell.y.into(),
            width: self.width,
            height: self.height,
        }
    }

    fn cell_at(&self, index: usize) -> Cell {
        let width = self.width as usize;
        Cell {
            x: (index % width) as u32,
            y: (index / width) as u32,
        }
    }

    /// Iterate all cells in row-major order.
    pub fn cells(&self) -> impl Iterator<Item = Cell> + '_ {
        (0..self.cell_count()).map(move |i| self.cell_at(i))
    }
}

/// A coordinate that has been checked against a [`BoardDimensions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cell {
    pub x: u32,
    pub y: u32,
}

impl Cell {
    /// Wire key, `"x,y"`.
    pub fn key(&self) -> String {
        format!("{},{}", self.x, self.y)
    }

    /// Parse a `"x,y"` key. Bounds are not checked here.
    pub fn parse_key(key: &str) -> Option<(i64, i64)> {
        let (x, y) = key.split_once(',')?;
        Some((x.trim().parse().ok()?, y.trim().parse().ok()?))
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// One accepted change, as fanned out to viewers: `{"x":5,"y":5,"color":"red"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelChange {
    pub x: u32,
    pub y: u32,
    pub color: Color,
}

impl PixelChange {
    pub fn new(cell: Cell, color: Color) -> Self {
        Self {
            x: cell.x,
            y: cell.y,
            color,
        }
    }

    pub fn cell(&self) -> Cell {
        Cell {
            x: self.x,
            y: self.y,
        }
    }
}

/// Authoritative grid state.
pub struct BoardStore {
    dims: BoardDimensions,
    cells: Vec<AtomicU8>,
}

impl BoardStore {
    /// Create a board with every cell set to the default color.
    pub fn new(dims: BoardDimensions) -> Self {
        let fill = Color::default().to_u8();
        let cells = (0..dims.cell_count()).map(|_| AtomicU8::new(fill)).collect();
        log::debug!("Board store initialized at {}x{}", dims.width, dims.height);
        Self { dims, cells }
    }

    pub fn dimensions(&self) -> BoardDimensions {
        self.dims
    }

    /// Current color of `cell`, `None` if the cell is not on this board.
    pub fn get(&self, cell: Cell) -> Option<Color> {
        let idx = self.dims.checked_index(cell)?;
        Some(decode(self.cells[idx].load(Ordering::Acquire)))
    }

    /// Store `color` at `cell`, returning the color it replaced.
    pub fn set(&self, cell: Cell, color: Color) -> Result<Color, CoreError> {
        let idx = self
            .dims
            .checked_index(cell)
            .ok_or_else(|| self.dims.out_of_bounds(cell))?;
        let prev = self.cells[idx].swap(color.to_u8(), Ordering::AcqRel);
        Ok(decode(prev))
    }

    /// Read every cell. Not a single point-in-time view across cells.
    pub fn snapshot(&self) -> BoardSnapshot {
        let cells = self
            .cells
            .iter()
            .map(|c| decode(c.load(Ordering::Acquire)))
            .collect();
        BoardSnapshot {
            dims: self.dims,
            cells,
        }
    }
}

// Only palette bytes are ever stored.
fn decode(raw: u8) -> Color {
    Color::from_u8(raw).unwrap_or_default()
}

/// Full read of the board, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardSnapshot {
    dims: BoardDimensions,
    cells: Vec<Color>,
}

impl BoardSnapshot {
    /// A board where every cell holds the default color.
    pub fn blank(dims: BoardDimensions) -> Self {
        Self {
            dims,
            cells: vec![Color::default(); dims.cell_count()],
        }
    }

    pub fn from_cells(dims: BoardDimensions, cells: Vec<Color>) -> Result<Self, CoreError> {
        if cells.len() != dims.cell_count() {
            return Err(CoreError::SnapshotSize {
                expected: dims.cell_count(),
                actual: cells.len(),
            });
        }
        Ok(Self { dims, cells })
    }

    pub fn dimensions(&self) -> BoardDimensions {
        self.dims
    }

    pub fn get(&self, cell: Cell) -> Option<Color> {
        self.dims.checked_index(cell).map(|idx| self.cells[idx])
    }

    pub fn iter(&self) -> impl Iterator<Item = (Cell, Color)> + '_ {
        self.dims.cells().zip(self.cells.iter().copied())
    }

    /// Encode as the `{"x,y": color}` map served by `GET /board`.
    pub fn to_wire_map(&self) -> BTreeMap<String, Color> {
        self.iter().map(|(cell, color)| (cell.key(), color)).collect()
    }

    /// Decode a wire map. Cells missing from the map keep the default color;
    /// malformed or out-of-range keys are skipped.
    pub fn from_wire_map<'a, I>(dims: BoardDimensions, entries: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a Color)>,
    {
        let mut snapshot = Self::blank(dims);
        for (key, color) in entries {
            let cell = Cell::parse_key(key).and_then(|(x, y)| dims.cell(x, y).ok());
            match cell {
                Some(cell) => {
                    let idx = dims.index(cell);
                    snapshot.cells[idx] = *color;
                }
                None => log::warn!("Skipping malformed board key {key:?}"),
            }
        }
        snapshot
    }
}
