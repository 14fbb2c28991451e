//! Parity RAID group geometry.

use crate::error::{Error, Result};
use crate::types::{BlockCount, Lba, MAX_WIDTH};

/// Shape of a parity RAID group as seen by the write journal.
///
/// Logical addresses are laid out element by element across the data
/// positions of a stripe, so a stripe covers `data_disks * element_size`
/// logical blocks. Physical addresses on a member disk advance by
/// `element_size` blocks per stripe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaidGeometry {
    width: usize,
    parity_disks: usize,
    element_size: BlockCount,
    alignment: BlockCount,
}

impl RaidGeometry {
    /// Creates a new geometry.
    ///
    /// # Arguments
    ///
    /// * `width` - Number of member disks (parity included), at most 16
    /// * `parity_disks` - 1 for RAID-5, 2 for RAID-6
    /// * `element_size` - Blocks per position per stripe
    /// * `alignment` - Physical I/O alignment in blocks (1 when unconstrained)
    ///
    /// # Errors
    ///
    /// Returns an error if the width leaves no data position, exceeds
    /// [`MAX_WIDTH`], or if any size is zero.
    pub fn new(
        width: usize,
        parity_disks: usize,
        element_size: BlockCount,
        alignment: BlockCount,
    ) -> Result<Self> {
        if !(1..=2).contains(&parity_disks) {
            return Err(Error::geometry(format!("parity_disks must be 1 or 2, got {parity_disks}")));
        }
        if width <= parity_disks {
            return Err(Error::geometry(format!(
                "width {width} leaves no data positions with {parity_disks} parity disks"
            )));
        }
        if width > MAX_WIDTH {
            return Err(Error::geometry(format!("width {width} exceeds {MAX_WIDTH}")));
        }
        if element_size == 0 {
            return Err(Error::geometry("element_size must be at least 1"));
        }
        if alignment == 0 {
            return Err(Error::geometry("alignment must be at least 1"));
        }

        Ok(Self { width, parity_disks, element_size, alignment })
    }

    /// Number of member disks.
    #[must_use]
    pub const fn width(&self) -> usize {
        self.width
    }

    /// Number of parity positions per stripe.
    #[must_use]
    pub const fn parity_disks(&self) -> usize {
        self.parity_disks
    }

    /// Number of data positions per stripe.
    #[must_use]
    pub const fn data_disks(&self) -> usize {
        self.width - self.parity_disks
    }

    /// Blocks per position per stripe.
    #[must_use]
    pub const fn element_size(&self) -> BlockCount {
        self.element_size
    }

    /// Physical alignment in blocks.
    #[must_use]
    pub const fn alignment(&self) -> BlockCount {
        self.alignment
    }

    /// Logical blocks covered by one full stripe.
    #[must_use]
    pub const fn stripe_size(&self) -> BlockCount {
        self.data_disks() as BlockCount * self.element_size
    }

    /// Returns true if physical I/O must be rounded to the alignment.
    #[must_use]
    pub const fn needs_alignment(&self) -> bool {
        self.alignment > 1
    }

    /// Returns true if the logical range covers whole stripes only.
    #[must_use]
    pub fn is_stripe_aligned(&self, lba: Lba, blocks: BlockCount) -> bool {
        let stripe = self.stripe_size();
        blocks > 0 && lba % stripe == 0 && blocks % stripe == 0
    }

    /// Returns true if the logical range falls inside one element, i.e. it
    /// touches a single data position.
    #[must_use]
    pub fn is_single_position(&self, lba: Lba, blocks: BlockCount) -> bool {
        blocks > 0 && lba / self.element_size == (lba + blocks - 1) / self.element_size
    }

    /// Returns true if the physical range starts and ends on the alignment.
    #[must_use]
    pub fn is_aligned(&self, lba: Lba, blocks: BlockCount) -> bool {
        lba % self.alignment == 0 && (lba + blocks) % self.alignment == 0
    }

    /// Widens a physical range outward to the alignment.
    ///
    /// Returns the aligned start and block count. Ranges that are already
    /// aligned come back unchanged.
    #[must_use]
    pub fn align_io(&self, lba: Lba, blocks: BlockCount) -> (Lba, BlockCount) {
        if !self.needs_alignment() {
            return (lba, blocks);
        }
        let start = lba - lba % self.alignment;
        let end = (lba + blocks).div_ceil(self.alignment) * self.alignment;
        (start, end - start)
    }
}
