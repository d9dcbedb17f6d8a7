//! Closed color palette.
//!
//! Colors travel as lowercase names (`"red"`) and are stored as their `u8`
//! discriminant so a cell fits in one atomic byte.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Color {
    #[default]
    White = 0,
    Red = 1,
    Blue = 2,
    Green = 3,
    Yellow = 4,
    Black = 5,
}

impl Color {
    /// Every color a client may place, in palette order.
    pub const ALL: [Color; 6] = [
        Color::White,
        Color::Red,
        Color::Blue,
        Color::Green,
        Color::Yellow,
        Color::Black,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Color::White => "white",
            Color::Red => "red",
            Color::Blue => "blue",
            Color::Green => "green",
            Color::Yellow => "yellow",
            Color::Black => "black",
        }
    }

    /// Packed `0xRRGGBB` value.
    pub fn rgb(&self) -> u32 {
        match self {
            Color::White => 0xFF_FF_FF,
            Color::Red => 0xFF_00_00,
            Color::Blue => 0x00_00_FF,
            Color::Green => 0x00_80_00,
            Color::Yellow => 0xFF_FF_00,
            Color::Black => 0x00_00_00,
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Inverse of [`Color::to_u8`]. `None` for bytes outside the palette.
    pub fn from_u8(raw: u8) -> Option<Self> {
        Self::ALL.get(raw as usize).copied()
    }
}

impl FromStr for Color {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| CoreError::UnknownColor(s.to_string()))
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
