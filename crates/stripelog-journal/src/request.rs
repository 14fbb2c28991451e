//! Request-side types the journal reads and rewrites.
//!
//! The surrounding I/O engine owns buffers and drive requests. The journal
//! only sees the addressing of each per-position descriptor plus the stored
//! per-block checksums of the data it carries.

use std::fmt;

use stripelog_core::{BlockCount, DeadPositions, Lba, Position};

use crate::error::{JournalError, Result};
use crate::header::{HeaderBlock, SlotHeader};
use crate::pool::SlotId;

/// Opaque handle of an in-flight request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// The part of a stripe write (or recovery flush) that the journal reads and writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalRequest {
    /// Request handle.
    pub id: RequestId,
    /// Logical address of the original I/O.
    pub start_lba: Lba,
    /// Logical length of the original I/O.
    pub xfer_count: BlockCount,
    /// First physical block of the stripe range.
    pub parity_start: Lba,
    /// Physical blocks of the stripe range.
    pub parity_count: BlockCount,
    /// Positions that are currently unavailable.
    pub dead: DeadPositions,
    /// Journal slot assigned to the request.
    pub slot: Option<SlotId>,
}

impl JournalRequest {
    /// Creates a request with no dead positions and no slot.
    #[must_use]
    pub fn new(
        id: RequestId,
        start_lba: Lba,
        xfer_count: BlockCount,
        parity_start: Lba,
        parity_count: BlockCount,
    ) -> Self {
        Self {
            id,
            start_lba,
            xfer_count,
            parity_start,
            parity_count,
            dead: DeadPositions::none(),
            slot: None,
        }
    }

    /// Creates a recovery request for `slot`. Its addressing is filled in from
    /// the reconciled header.
    #[must_use]
    pub fn for_slot(id: RequestId, slot: SlotId, dead: DeadPositions) -> Self {
        Self { dead, slot: Some(slot), ..Self::new(id, 0, 0, 0, 0) }
    }

    /// Sets the dead positions.
    #[must_use]
    pub fn with_dead(mut self, dead: DeadPositions) -> Self {
        self.dead = dead;
        self
    }

    /// Sets the journal slot.
    #[must_use]
    pub fn with_slot(mut self, slot: SlotId) -> Self {
        self.slot = Some(slot);
        self
    }

    /// Returns the assigned slot.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::InvalidSlot`] if no slot is assigned.
    pub fn require_slot(&self) -> Result<SlotId> {
        self.slot.ok_or(JournalError::InvalidSlot)
    }

    /// Copies the addressing recorded in a header into this request.
    pub fn adopt(&mut self, header: &SlotHeader) {
        self.start_lba = header.start_lba;
        self.xfer_count = BlockCount::from(header.xfer_count);
        self.parity_start = header.parity_start;
        self.parity_count = BlockCount::from(header.parity_count);
    }
}

/// Where the old-data region of a write descriptor comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrereadSource {
    /// All-zero buffer; journal slots never preserve prior content.
    Zero,
    /// Read from the live stripe.
    LiveStripe,
}

/// Old-data region that widens a write to the physical alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preread {
    /// First block of the aligned region.
    pub lba: Lba,
    /// Blocks in the aligned region.
    pub blocks: BlockCount,
    /// Source of the region's contents.
    pub source: PrereadSource,
}

/// One position's outbound write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteDescriptor {
    /// Disk position.
    pub position: Position,
    /// Target physical address.
    pub lba: Lba,
    /// Blocks written.
    pub blocks: BlockCount,
    /// Stored checksum of every data block, in order.
    pub block_checksums: Vec<u16>,
    /// Old-data region, if any.
    pub preread: Option<Preread>,
}

impl WriteDescriptor {
    /// Creates a descriptor for `blocks` blocks whose stored checksums are
    /// `block_checksums`.
    #[must_use]
    pub fn new(position: Position, lba: Lba, block_checksums: Vec<u16>) -> Self {
        let blocks = block_checksums.len() as BlockCount;
        Self { position, lba, blocks, block_checksums, preread: None }
    }
}

/// Kind of drive operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveOpKind {
    /// Read blocks.
    Read,
    /// Write blocks.
    Write,
    /// Degraded position, nothing is issued.
    Nop,
}

/// A drive operation planned by the recovery path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveOp {
    /// Disk position.
    pub position: Position,
    /// Operation kind.
    pub kind: DriveOpKind,
    /// Physical address.
    pub lba: Lba,
    /// Blocks transferred.
    pub blocks: BlockCount,
    /// Old-data region for writes that must be widened to the alignment.
    pub preread: Option<Preread>,
    /// Header blocks carried by header writes.
    pub header: Vec<HeaderBlock>,
}

impl DriveOp {
    /// A read of `blocks` blocks.
    #[must_use]
    pub fn read(position: Position, lba: Lba, blocks: BlockCount) -> Self {
        Self { position, kind: DriveOpKind::Read, lba, blocks, preread: None, header: Vec::new() }
    }

    /// A write of `blocks` blocks.
    #[must_use]
    pub fn write(position: Position, lba: Lba, blocks: BlockCount) -> Self {
        Self { position, kind: DriveOpKind::Write, lba, blocks, preread: None, header: Vec::new() }
    }

    /// A no-op standing in for a dead position.
    #[must_use]
    pub fn nop(position: Position) -> Self {
        Self { position, kind: DriveOpKind::Nop, lba: 0, blocks: 0, preread: None, header: Vec::new() }
    }

    /// Returns true if nothing is issued for this operation.
    #[must_use]
    pub fn is_nop(&self) -> bool {
        matches!(self.kind, DriveOpKind::Nop)
    }
}
