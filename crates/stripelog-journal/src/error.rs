//! Error types for journal operations.

use stripelog_core::{BlockCount, Position, PositionBitmap};
use thiserror::Error;

use crate::pool::{SlotId, SlotState};

/// Result type for journal operations.
pub type Result<T> = std::result::Result<T, JournalError>;

/// Errors surfaced by the journal.
///
/// Every variant is an integrity defect in the caller or in on-disk data.
/// Recoverable data-path failures are not errors; recovery resolves them into
/// a flush decision instead.
#[derive(Debug, Error)]
pub enum JournalError {
    /// Slot index beyond the pool.
    #[error("Slot {slot} out of range (slot count {slot_count})")]
    SlotOutOfRange {
        /// Offending slot index.
        slot: SlotId,
        /// Number of slots in the pool.
        slot_count: usize,
    },

    /// The slot is not in a state that permits the operation.
    #[error("Slot {slot} is not allocated (state {state:?})")]
    SlotNotAllocated {
        /// Offending slot index.
        slot: SlotId,
        /// State the slot was found in.
        state: SlotState,
    },

    /// The request carries no journal slot.
    #[error("Request has no journal slot")]
    InvalidSlot,

    /// A descriptor's block count disagrees with the header that describes it.
    #[error("Block count mismatch at position {position}: header {header}, descriptor {descriptor}")]
    BlockCountMismatch {
        /// Disk position.
        position: Position,
        /// Count recorded in the header.
        header: BlockCount,
        /// Count carried by the descriptor.
        descriptor: BlockCount,
    },

    /// Two valid headers carry the same timestamp but different contents.
    #[error("Mirror headers of slot {slot} differ at one timestamp")]
    MirrorMismatch {
        /// Slot being validated.
        slot: SlotId,
    },

    /// A current header was read from a position its own bitmap excludes.
    #[error("Position {position} missing from write bitmap {bitmap} in slot {slot}")]
    PositionNotInBitmap {
        /// Slot being validated.
        slot: SlotId,
        /// Position the header came from.
        position: Position,
        /// The header's write bitmap.
        bitmap: PositionBitmap,
    },

    /// A valid header claims a position participated with no data.
    #[error("Valid header in slot {slot} has zero block count for position {position}")]
    ZeroBlockCount {
        /// Slot being flushed.
        slot: SlotId,
        /// Participating position.
        position: Position,
    },

    /// Header bytes could not be decoded.
    #[error("Header decode failed: {0}")]
    HeaderDecode(String),

    /// A value does not fit its on-disk header field.
    #[error("Field {field} value {value} does not fit the header format")]
    FieldOverflow {
        /// Header field name.
        field: &'static str,
        /// Value that did not fit.
        value: u64,
    },

    /// Disk position outside the RAID group.
    #[error("Invalid disk position {position} (width {width})")]
    InvalidPosition {
        /// Offending position.
        position: Position,
        /// Width of the RAID group.
        width: usize,
    },

    /// No descriptor exists for a position the plan covers.
    #[error("No descriptor for position {0}")]
    MissingDescriptor(Position),

    /// A descriptor changed after the plan targeting it was built.
    #[error("Descriptor for position {0} changed since the plan was built")]
    StaleDescriptor(Position),

    /// A flush step needs the reconciled model header and none exists.
    #[error("No model header available for slot {slot}")]
    MissingModelHeader {
        /// Slot being flushed.
        slot: SlotId,
    },

    /// Error from the core crate.
    #[error(transparent)]
    Core(#[from] stripelog_core::Error),
}

impl JournalError {
    /// Short machine-readable name of the error, used as a metric label.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SlotOutOfRange { .. } => "slot_out_of_range",
            Self::SlotNotAllocated { .. } => "slot_not_allocated",
            Self::InvalidSlot => "invalid_slot",
            Self::BlockCountMismatch { .. } => "block_count_mismatch",
            Self::MirrorMismatch { .. } => "mirror_mismatch",
            Self::PositionNotInBitmap { .. } => "position_not_in_bitmap",
            Self::ZeroBlockCount { .. } => "zero_block_count",
            Self::HeaderDecode(_) => "header_decode",
            Self::FieldOverflow { .. } => "field_overflow",
            Self::InvalidPosition { .. } => "invalid_position",
            Self::MissingDescriptor(_) => "missing_descriptor",
            Self::StaleDescriptor(_) => "stale_descriptor",
            Self::MissingModelHeader { .. } => "missing_model_header",
            Self::Core(_) => "core",
        }
    }

    /// Returns true if the current header copies of a slot contradict each
    /// other. Such a slot can only be discarded.
    #[must_use]
    pub const fn is_header_conflict(&self) -> bool {
        matches!(self, Self::MirrorMismatch { .. } | Self::PositionNotInBitmap { .. })
    }
}
