//! Placement of journal slots on the member disks.

use std::ops::Range;

use serde::Serialize;
use stripelog_core::{BlockCount, ControllerId, JournalConfig, Lba};

use crate::error::{JournalError, Result};
use crate::pool::SlotId;

/// Fixed on-disk layout of the journal region.
///
/// Slot `n` starts at `start_lba + n * slot_size` on every member disk. Its
/// first `header_blocks` blocks hold the header copy, the rest hold data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlotLayout {
    start_lba: Lba,
    slot_size: BlockCount,
    slot_count: usize,
    header_blocks: BlockCount,
}

impl SlotLayout {
    /// Creates a layout. The caller is expected to have validated the sizes.
    #[must_use]
    pub const fn new(
        start_lba: Lba,
        slot_size: BlockCount,
        slot_count: usize,
        header_blocks: BlockCount,
    ) -> Self {
        Self { start_lba, slot_size, slot_count, header_blocks }
    }

    /// Layout described by a journal configuration.
    #[must_use]
    pub const fn from_config(config: &JournalConfig) -> Self {
        Self::new(config.start_lba, config.slot_size, config.slot_count, config.header_blocks)
    }

    /// First block of the journal region.
    #[must_use]
    pub const fn start_lba(&self) -> Lba {
        self.start_lba
    }

    /// Blocks per slot.
    #[must_use]
    pub const fn slot_size(&self) -> BlockCount {
        self.slot_size
    }

    /// Number of slots.
    #[must_use]
    pub const fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// Blocks of header at the start of each slot.
    #[must_use]
    pub const fn header_blocks(&self) -> BlockCount {
        self.header_blocks
    }

    /// Data blocks available per slot. Zero if the header does not fit.
    #[must_use]
    pub const fn data_blocks(&self) -> BlockCount {
        self.slot_size.saturating_sub(self.header_blocks)
    }

    /// Base address of `slot`.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::SlotOutOfRange`] if `slot` is beyond the pool.
    pub fn slot_lba(&self, slot: SlotId) -> Result<Lba> {
        self.check(slot)?;
        Ok(self.start_lba + slot as Lba * self.slot_size)
    }

    /// Address of the first data block of `slot`.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::SlotOutOfRange`] if `slot` is beyond the pool.
    pub fn data_lba(&self, slot: SlotId) -> Result<Lba> {
        Ok(self.slot_lba(slot)? + self.header_blocks)
    }

    /// Slots owned by `controller`.
    #[must_use]
    pub const fn half(&self, controller: ControllerId) -> Range<SlotId> {
        let mid = self.slot_count / 2;
        match controller {
            ControllerId::A => 0..mid,
            ControllerId::B => mid..self.slot_count,
        }
    }

    /// Every slot.
    #[must_use]
    pub const fn all(&self) -> Range<SlotId> {
        0..self.slot_count
    }

    /// Returns an error if `slot` is beyond the pool.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::SlotOutOfRange`].
    pub fn check(&self, slot: SlotId) -> Result<()> {
        if slot >= self.slot_count {
            return Err(JournalError::SlotOutOfRange { slot, slot_count: self.slot_count });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_addresses() {
        let layout = SlotLayout::new(0x10000, 129, 508, 1);
        assert_eq!(layout.slot_lba(0).unwrap(), 0x10000);
        assert_eq!(layout.slot_lba(3).unwrap(), 0x10000 + 3 * 129);
        assert_eq!(layout.data_lba(3).unwrap(), 0x10000 + 3 * 129 + 1);
        assert_eq!(layout.data_blocks(), 128);
        assert!(matches!(
            layout.slot_lba(508),
            Err(JournalError::SlotOutOfRange { slot: 508, slot_count: 508 })
        ));
    }

    #[test]
    fn test_data_blocks_without_room() {
        assert_eq!(SlotLayout::new(0, 1, 4, 1).data_blocks(), 0);
        assert_eq!(SlotLayout::new(0, 1, 4, 2).data_blocks(), 0);
    }

    #[test]
    fn test_halves() {
        let layout = SlotLayout::new(0, 9, 4, 1);
        assert_eq!(layout.half(ControllerId::A), 0..2);
        assert_eq!(layout.half(ControllerId::B), 2..4);
        assert_eq!(layout.all(), 0..4);
    }

    #[test]
    fn test_from_config() {
        let layout = SlotLayout::from_config(&JournalConfig::default());
        assert_eq!(layout.slot_size(), 129);
        assert_eq!(layout.slot_count(), 508);
        assert_eq!(layout.header_blocks(), 1);
    }
}
