//! Common types used across stripelog.

use std::fmt;
use std::ops::{BitAnd, BitOr, Not};

use serde::{Deserialize, Serialize};

/// Logical or physical block address.
pub type Lba = u64;

/// Number of blocks.
pub type BlockCount = u64;

/// Index of a member disk within a RAID group.
pub type Position = usize;

/// Maximum number of member disks in a RAID group that carries a journal.
pub const MAX_WIDTH: usize = 16;

/// Bytes of user data in one block.
pub const BLOCK_DATA_SIZE: usize = 512;

/// Bytes of per-block metadata trailing the data (checksum and stamps).
pub const BLOCK_METADATA_SIZE: usize = 8;

/// Bytes in one on-disk block, data plus metadata.
pub const BLOCK_SIZE: usize = BLOCK_DATA_SIZE + BLOCK_METADATA_SIZE;

/// A set of disk positions, one bit per position.
///
/// Bit `n` represents position `n`. The width is fixed to [`MAX_WIDTH`] bits so
/// the bitmap can be stored verbatim in an on-disk journal header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PositionBitmap(u16);

impl PositionBitmap {
    /// The empty set.
    pub const EMPTY: Self = Self(0);

    /// Creates a bitmap from raw bits.
    #[must_use]
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    /// Returns a bitmap with every position in `0..width` set.
    #[must_use]
    pub const fn all(width: usize) -> Self {
        if width >= MAX_WIDTH {
            Self(u16::MAX)
        } else {
            Self(((1u32 << width) - 1) as u16)
        }
    }

    /// Returns a bitmap holding a single position.
    ///
    /// Positions at or beyond [`MAX_WIDTH`] yield the empty set.
    #[must_use]
    pub const fn single(position: Position) -> Self {
        if position < MAX_WIDTH {
            Self(1 << position)
        } else {
            Self::EMPTY
        }
    }

    /// Returns the raw bits.
    #[must_use]
    pub const fn bits(&self) -> u16 {
        self.0
    }

    /// Returns true if `position` is in the set.
    #[must_use]
    pub const fn is_set(&self, position: Position) -> bool {
        position < MAX_WIDTH && (self.0 >> position) & 1 == 1
    }

    /// Adds `position` to the set. Out-of-range positions are ignored.
    pub fn set(&mut self, position: Position) {
        self.0 |= Self::single(position).0;
    }

    /// Removes `position` from the set.
    pub fn clear(&mut self, position: Position) {
        self.0 &= !Self::single(position).0;
    }

    /// Returns a copy with `position` removed.
    #[must_use]
    pub const fn without(self, position: Position) -> Self {
        Self(self.0 & !Self::single(position).0)
    }

    /// Number of positions in the set.
    #[must_use]
    pub const fn popcount(&self) -> u32 {
        self.0.count_ones()
    }

    /// Returns true if no position is set.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Iterates the set positions in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = Position> + '_ {
        (0..MAX_WIDTH).filter(move |&pos| self.is_set(pos))
    }
}

impl fmt::Display for PositionBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

impl BitOr for PositionBitmap {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for PositionBitmap {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl Not for PositionBitmap {
    type Output = Self;

    fn not(self) -> Self {
        Self(!self.0)
    }
}

impl FromIterator<Position> for PositionBitmap {
    fn from_iter<I: IntoIterator<Item = Position>>(iter: I) -> Self {
        let mut bitmap = Self::EMPTY;
        for pos in iter {
            bitmap.set(pos);
        }
        bitmap
    }
}

/// The positions of a RAID group that are currently unavailable.
///
/// A parity RAID group can be missing at most two members (RAID-6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeadPositions {
    first: Option<Position>,
    second: Option<Position>,
}

impl DeadPositions {
    /// No dead positions.
    #[must_use]
    pub const fn none() -> Self {
        Self { first: None, second: None }
    }

    /// One dead position.
    #[must_use]
    pub const fn one(position: Position) -> Self {
        Self { first: Some(position), second: None }
    }

    /// Two dead positions.
    #[must_use]
    pub const fn two(first: Position, second: Position) -> Self {
        Self { first: Some(first), second: Some(second) }
    }

    /// Returns the first dead position.
    #[must_use]
    pub const fn first(&self) -> Option<Position> {
        self.first
    }

    /// Returns the second dead position.
    #[must_use]
    pub const fn second(&self) -> Option<Position> {
        self.second
    }

    /// Returns true if `position` is dead.
    #[must_use]
    pub fn contains(&self, position: Position) -> bool {
        self.first == Some(position) || self.second == Some(position)
    }

    /// Returns true if at least one position is dead.
    #[must_use]
    pub const fn is_degraded(&self) -> bool {
        self.first.is_some() || self.second.is_some()
    }

    /// Returns the dead positions as a bitmap.
    #[must_use]
    pub fn bitmap(&self) -> PositionBitmap {
        self.first.into_iter().chain(self.second).collect()
    }
}

impl fmt::Display for DeadPositions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.first, self.second) {
            (None, None) => write!(f, "none"),
            (Some(a), None) | (None, Some(a)) => write!(f, "{a}"),
            (Some(a), Some(b)) => write!(f, "{a},{b}"),
        }
    }
}

/// One of the two redundant storage controllers sharing a RAID group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerId {
    /// Controller A, owner of the lower half of the journal.
    A,
    /// Controller B, owner of the upper half of the journal.
    B,
}

impl ControllerId {
    /// Returns the other controller.
    #[must_use]
    pub const fn peer(&self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

impl fmt::Display for ControllerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::A => write!(f, "A"),
            Self::B => write!(f, "B"),
        }
    }
}

/// Block operation carried by a host write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Opcode {
    /// Cache-buffered write.
    Write,
    /// Cache-buffered write followed by a verify.
    VerifyWrite,
    /// Write-through write that bypasses the cache.
    WriteNonCached,
    /// Re-encryption write issued by the background rekey monitor.
    RekeyWrite,
    /// Zero fill.
    Zero,
}

impl Opcode {
    /// Returns true for writes whose data the cache still holds after completion.
    #[must_use]
    pub const fn is_cached(&self) -> bool {
        matches!(self, Self::Write | Self::VerifyWrite)
    }
}

/// Parity update algorithm chosen for a stripe write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteAlgorithm {
    /// Multi-region read-modify-write that restamps several positions.
    Mr3,
    /// Small read-modify-write touching one data position and parity.
    Small468,
    /// Reconstruct write.
    Rcw,
}
