//! Flush and invalidate planning.

use metrics::counter;
use stripelog_core::{DeadPositions, Position, PositionBitmap};

use super::{FlushDecision, JournalRecovery, Reconciliation};
use crate::error::{JournalError, Result};
use crate::events::{AbandonCause, FlushPhase};
use crate::header::{checksum_of_checksums, header_region, HeaderState, SlotHeader};
use crate::metrics::{integrity_error, FLUSHES, HEADERS_INVALIDATED};
use crate::request::{DriveOp, JournalRequest, Preread, PrereadSource};

/// Stored per-block checksums read back from one position's journaled data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataReadback {
    /// Disk position.
    pub position: Position,
    /// Checksum field of every data block, in order.
    pub block_checksums: Vec<u16>,
}

/// Returns the positions whose read-back data does not match the header's
/// checksum-of-checksums. A participating position with no read-back data
/// counts as a mismatch.
#[must_use]
pub fn verify_checksums(
    header: &SlotHeader,
    data: &[DataReadback],
    dead: DeadPositions,
) -> PositionBitmap {
    header
        .write_bitmap
        .iter()
        .filter(|&position| !dead.contains(position))
        .filter(|&position| {
            data.iter().find(|d| d.position == position).map_or(true, |d| {
                checksum_of_checksums(d.block_checksums.iter().copied())
                    != header.checksum_of_checksums[position]
            })
        })
        .collect()
}

impl JournalRecovery {
    /// Plans the reads of the journaled data of an authorized flush.
    ///
    /// Every participating surviving position is read past the header
    /// blocks. Positions whose live-stripe range is not aligned also get a
    /// pre-read of the aligned live range.
    ///
    /// # Errors
    ///
    /// Returns an error if there is no model header or a participating
    /// position records no data.
    pub fn generate_flush_reads(
        &self,
        request: &JournalRequest,
        recon: &Reconciliation,
    ) -> Result<Vec<DriveOp>> {
        let model = recon.model_or_err()?;
        let data_lba = self.layout.data_lba(recon.slot).map_err(integrity_error)?;

        let mut reads = Vec::with_capacity(recon.num_drive_ops);
        for position in model.write_bitmap.iter() {
            if request.dead.contains(position) {
                continue;
            }
            let blocks = model.block_count(position);
            if blocks == 0 {
                tracing::error!(slot = recon.slot, position, "Valid journal header with no data");
                return Err(integrity_error(JournalError::ZeroBlockCount {
                    slot: recon.slot,
                    position,
                }));
            }

            let mut op = DriveOp::read(position, data_lba, blocks);
            let live_lba = model.live_lba(position);
            if !self.geometry.is_aligned(live_lba, blocks) {
                let (lba, aligned) = self.geometry.align_io(live_lba, blocks);
                op.preread = Some(Preread { lba, blocks: aligned, source: PrereadSource::LiveStripe });
            }
            reads.push(op);
        }
        Ok(reads)
    }

    /// Checks the journaled data read back for a full flush.
    ///
    /// Block checksum or address stamp errors abandon the flush and report
    /// it. A checksum-of-checksums mismatch means the journal write itself
    /// was torn before the live stripe was touched, so the slot is only
    /// invalidated.
    ///
    /// # Errors
    ///
    /// Returns an error if there is no model header.
    pub fn evaluate_flush_data(
        &self,
        request: &JournalRequest,
        recon: &mut Reconciliation,
        error_bitmap: PositionBitmap,
        data: &[DataReadback],
    ) -> Result<FlushDecision> {
        let model = recon.model_or_err()?;

        let decision = if !error_bitmap.is_empty() {
            self.report_abandoned(
                request,
                recon,
                error_bitmap,
                FlushPhase::FullFlush,
                AbandonCause::DataReadError,
            );
            FlushDecision::Abandon
        } else {
            let torn = verify_checksums(model, data, request.dead);
            if torn.is_empty() {
                FlushDecision::Flush
            } else {
                tracing::warn!(slot = recon.slot, positions = %torn, "Journal checksum mismatch, write was torn");
                FlushDecision::Invalidate
            }
        };

        recon.decision = decision;
        Ok(decision)
    }

    /// Re-issues the buffers read by [`generate_flush_reads`](Self::generate_flush_reads)
    /// as writes to the live stripe. Dead positions get a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if there is no model header, a read is missing, or a
    /// read's block count differs from the model.
    pub fn generate_flush_writes(
        &self,
        request: &JournalRequest,
        recon: &Reconciliation,
        reads: &[DriveOp],
    ) -> Result<Vec<DriveOp>> {
        let model = recon.model_or_err()?;

        let mut writes = Vec::with_capacity(self.geometry.width());
        for position in 0..self.geometry.width() {
            if request.dead.contains(position) {
                writes.push(DriveOp::nop(position));
                continue;
            }
            if !model.write_bitmap.is_set(position) {
                continue;
            }

            let read = reads
                .iter()
                .find(|op| op.position == position)
                .ok_or_else(|| integrity_error(JournalError::MissingDescriptor(position)))?;
            let recorded = model.block_count(position);
            if read.blocks != recorded {
                tracing::error!(
                    slot = recon.slot,
                    position,
                    header = recorded,
                    descriptor = read.blocks,
                    "Journal flush block count mismatch"
                );
                return Err(integrity_error(JournalError::BlockCountMismatch {
                    position,
                    header: recorded,
                    descriptor: read.blocks,
                }));
            }

            let mut op = DriveOp::write(position, model.live_lba(position), recorded);
            op.preread = read.preread;
            writes.push(op);
        }

        counter!(FLUSHES).increment(1);
        tracing::info!(
            slot = recon.slot,
            start_lba = model.start_lba,
            parity_start = model.parity_start,
            bitmap = %model.write_bitmap,
            "Flushing journal slot to live stripe"
        );
        Ok(writes)
    }

    /// Plans the header writes that invalidate every mirror copy of the slot.
    ///
    /// During a full flush every position is written the model header marked
    /// invalid. Without a model, and during a header-only pass, each
    /// position's in-memory copy is invalidated in place. Either way the
    /// timestamp, bitmap and addressing survive on disk. `NeedsRemap` is
    /// stamped instead of `Invalid` when a remap is needed.
    ///
    /// Dead positions get a no-op, as do unreadable positions when no model
    /// exists to regenerate their copy.
    ///
    /// # Errors
    ///
    /// Returns an error if the slot is out of range.
    pub fn generate_invalidate_writes(
        &self,
        request: &JournalRequest,
        recon: &mut Reconciliation,
        phase: FlushPhase,
    ) -> Result<Vec<DriveOp>> {
        let slot_lba = self.layout.slot_lba(recon.slot).map_err(integrity_error)?;
        let header_blocks = self.layout.header_blocks();

        let mut writes = Vec::with_capacity(self.geometry.width());
        for position in 0..self.geometry.width() {
            let unreadable = recon.model.is_none() && recon.failed_bitmap.is_set(position);
            if request.dead.contains(position) || unreadable {
                writes.push(DriveOp::nop(position));
                continue;
            }

            let mut header = match (phase, &recon.model) {
                (FlushPhase::FullFlush, Some(model)) => model.clone(),
                _ => recon.headers[position].take().unwrap_or_default(),
            };
            header.set_invalid();
            if recon.remap_needed {
                header.header_state = HeaderState::NeedsRemap;
            }

            let mut op = DriveOp::write(position, slot_lba, header_blocks);
            op.header = header_region(&header, slot_lba, header_blocks);
            recon.headers[position] = Some(header);
            writes.push(op);
        }

        let invalidated = writes.iter().filter(|op| !op.is_nop()).count();
        counter!(HEADERS_INVALIDATED).increment(invalidated as u64);
        tracing::info!(
            slot = recon.slot,
            invalidated,
            remap = recon.remap_needed,
            "Journal slot headers invalidated"
        );
        Ok(writes)
    }
}
