//! Journal write path.
//!
//! A journaled write is planned first and applied second. The plan holds the
//! header, its stamped blocks and one edit per participating descriptor; it is
//! applied to the descriptors only after every edit has been checked, so a
//! failure leaves the request untouched.

use stripelog_core::{BlockCount, Lba, Position, RaidGeometry};

use crate::error::{JournalError, Result};
use crate::header::{checksum_of_checksums, header_region, HeaderBlock, SlotHeader, Timestamp};
use crate::layout::SlotLayout;
use crate::metrics::integrity_error;
use crate::request::{JournalRequest, Preread, PrereadSource, WriteDescriptor};

/// Addressing of a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorTarget {
    /// Target physical address.
    pub lba: Lba,
    /// Blocks written.
    pub blocks: BlockCount,
    /// Old-data region.
    pub preread: Option<Preread>,
}

impl DescriptorTarget {
    fn of(desc: &WriteDescriptor) -> Self {
        Self { lba: desc.lba, blocks: desc.blocks, preread: desc.preread }
    }

    fn apply_to(&self, desc: &mut WriteDescriptor) {
        desc.lba = self.lba;
        desc.blocks = self.blocks;
        desc.preread = self.preread;
    }
}

/// Change to one descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorEdit {
    /// Disk position of the descriptor.
    pub position: Position,
    /// Addressing before the edit.
    pub before: DescriptorTarget,
    /// Addressing after the edit.
    pub after: DescriptorTarget,
}

/// A journaled write, ready to be applied to the request's descriptors.
#[derive(Debug, Clone)]
pub struct JournalWritePlan {
    header: SlotHeader,
    header_region: Vec<HeaderBlock>,
    edits: Vec<DescriptorEdit>,
}

impl JournalWritePlan {
    /// The header written to every participating position.
    #[must_use]
    pub const fn header(&self) -> &SlotHeader {
        &self.header
    }

    /// Stamped header blocks prepended to every participating descriptor.
    #[must_use]
    pub fn header_region(&self) -> &[HeaderBlock] {
        &self.header_region
    }

    /// Planned descriptor edits, one per participating position.
    #[must_use]
    pub fn edits(&self) -> &[DescriptorEdit] {
        &self.edits
    }

    /// Redirects the descriptors into the journal slot.
    ///
    /// # Errors
    ///
    /// Returns an error, without changing any descriptor, if a planned
    /// descriptor is missing or no longer matches the plan.
    pub fn apply(&self, descriptors: &mut [WriteDescriptor]) -> Result<()> {
        self.transition(descriptors, |edit| (&edit.before, &edit.after))
    }

    /// Undoes [`apply`](Self::apply).
    ///
    /// # Errors
    ///
    /// Returns an error, without changing any descriptor, if a planned
    /// descriptor is missing or was changed after the plan was applied.
    pub fn rollback(&self, descriptors: &mut [WriteDescriptor]) -> Result<()> {
        self.transition(descriptors, |edit| (&edit.after, &edit.before))
    }

    fn transition<F>(&self, descriptors: &mut [WriteDescriptor], pick: F) -> Result<()>
    where
        F: Fn(&DescriptorEdit) -> (&DescriptorTarget, &DescriptorTarget),
    {
        let mut indices = Vec::with_capacity(self.edits.len());
        for edit in &self.edits {
            let (from, _) = pick(edit);
            let index = descriptors
                .iter()
                .position(|d| d.position == edit.position)
                .ok_or_else(|| integrity_error(JournalError::MissingDescriptor(edit.position)))?;
            if DescriptorTarget::of(&descriptors[index]) != *from {
                tracing::error!(position = edit.position, "Descriptor changed under a journal plan");
                return Err(integrity_error(JournalError::StaleDescriptor(edit.position)));
            }
            indices.push(index);
        }

        for (edit, index) in self.edits.iter().zip(indices) {
            let (_, to) = pick(edit);
            to.apply_to(&mut descriptors[index]);
        }
        Ok(())
    }
}

/// Plans the journaled form of a degraded write.
///
/// The header is built from the request, each participating position's
/// checksum-of-checksums is recorded in it, and every participating descriptor
/// is planned to target the slot base with the header blocks prepended and a
/// zero-filled old-data region. Dead positions are left out.
///
/// # Errors
///
/// Returns an error if the request has no slot, the header cannot be built,
/// or a descriptor does not fit the slot.
pub fn prepare_journal_write(
    request: &JournalRequest,
    descriptors: &[WriteDescriptor],
    layout: &SlotLayout,
    geometry: &RaidGeometry,
    timestamp: Timestamp,
) -> Result<JournalWritePlan> {
    let slot = request.require_slot().map_err(integrity_error)?;
    let slot_lba = layout.slot_lba(slot).map_err(integrity_error)?;
    let header_blocks = layout.header_blocks();

    let mut header = SlotHeader::build(request, descriptors, geometry, timestamp)?;
    let mut edits = Vec::new();
    for desc in descriptors {
        if !header.write_bitmap.is_set(desc.position) {
            continue;
        }
        if desc.blocks > layout.data_blocks() {
            return Err(JournalError::FieldOverflow { field: "slot_data_blocks", value: desc.blocks });
        }
        header.checksum_of_checksums[desc.position] =
            checksum_of_checksums(desc.block_checksums.iter().copied());

        let blocks = desc.blocks + header_blocks;
        let (preread_lba, preread_blocks) = geometry.align_io(slot_lba, blocks);
        edits.push(DescriptorEdit {
            position: desc.position,
            before: DescriptorTarget::of(desc),
            after: DescriptorTarget {
                lba: slot_lba,
                blocks,
                preread: Some(Preread {
                    lba: preread_lba,
                    blocks: preread_blocks,
                    source: PrereadSource::Zero,
                }),
            },
        });
    }

    let header_region = header_region(&header, slot_lba, header_blocks);
    tracing::debug!(
        slot,
        slot_lba,
        request = %request.id,
        bitmap = %header.write_bitmap,
        timestamp = %header.timestamp,
        "Journal header stamped"
    );

    Ok(JournalWritePlan { header, header_region, edits })
}

/// Points the descriptors of a completed journal write back at the live stripe.
///
/// # Errors
///
/// Returns an error, without changing any descriptor, if a participating
/// descriptor's block count no longer matches the header.
pub fn restore_journal_write(
    request: &JournalRequest,
    header: &SlotHeader,
    descriptors: &mut [WriteDescriptor],
    layout: &SlotLayout,
    geometry: &RaidGeometry,
) -> Result<()> {
    let header_blocks = layout.header_blocks();
    let mut targets = Vec::new();

    for (index, desc) in descriptors.iter().enumerate() {
        if !header.write_bitmap.is_set(desc.position) || request.dead.contains(desc.position) {
            continue;
        }
        let recorded = header.block_count(desc.position);
        let blocks = desc.blocks.saturating_sub(header_blocks);
        if recorded != blocks {
            tracing::error!(
                position = desc.position,
                header = recorded,
                descriptor = blocks,
                "Journal header block count mismatch"
            );
            return Err(integrity_error(JournalError::BlockCountMismatch {
                position: desc.position,
                header: recorded,
                descriptor: blocks,
            }));
        }

        let lba = header.live_lba(desc.position);
        let (preread_lba, preread_blocks) = geometry.align_io(lba, blocks);
        targets.push((
            index,
            DescriptorTarget {
                lba,
                blocks,
                preread: Some(Preread {
                    lba: preread_lba,
                    blocks: preread_blocks,
                    source: PrereadSource::LiveStripe,
                }),
            },
        ));
    }

    for (index, target) in targets {
        target.apply_to(&mut descriptors[index]);
    }
    Ok(())
}
