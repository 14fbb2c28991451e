//! Recovery driver.
//!
//! Walks the slots the pool marked for flushing or remapping and runs each
//! through the recovery steps against a [`SlotDevice`]. Every slot taken from
//! the pool is released again, whatever its outcome.

use serde::Serialize;
use stripelog_core::{DeadPositions, PositionBitmap};

use super::{DataReadback, FlushDecision, HeaderRead, JournalRecovery, Reconciliation};
use crate::error::Result;
use crate::events::FlushPhase;
use crate::pool::{InvalidateReason, JournalPool, SlotId};
use crate::request::{DriveOp, JournalRequest, RequestId};

/// Data read back for a flush.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataRead {
    /// Positions whose blocks failed their checksum or address stamps.
    pub error_bitmap: PositionBitmap,
    /// Stored block checksums per position.
    pub data: Vec<DataReadback>,
}

/// Completion of a batch of writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Positions whose write hit a media error.
    pub media_errors: PositionBitmap,
}

/// Block access to the member disks of the RAID group.
pub trait SlotDevice {
    /// Executes header reads, one result per operation.
    fn read_headers(&self, ops: &[DriveOp]) -> Vec<HeaderRead>;

    /// Executes journal data reads.
    fn read_data(&self, ops: &[DriveOp]) -> DataRead;

    /// Executes writes. No-op operations are skipped.
    fn write(&self, ops: &[DriveOp]) -> WriteOutcome;
}

/// Statistics from a recovery pass.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryStats {
    /// Slots taken from the pool.
    pub slots_processed: usize,
    /// Slots flushed to the live stripe.
    pub flushed: usize,
    /// Slots discarded and invalidated.
    pub invalidated: usize,
    /// Slots abandoned and reported.
    pub abandoned: usize,
    /// Slots that held nothing.
    pub clean: usize,
    /// Slots left needing a remap check.
    pub remaps: usize,
    /// Slots whose recovery failed with an integrity error.
    pub errors: usize,
}

impl RecoveryStats {
    fn record(&mut self, decision: FlushDecision) {
        match decision {
            FlushDecision::Flush => self.flushed += 1,
            FlushDecision::Invalidate | FlushDecision::Incomplete => self.invalidated += 1,
            FlushDecision::Abandon => self.abandoned += 1,
            FlushDecision::Clean => self.clean += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Flush,
    Remap,
}

impl JournalRecovery {
    /// Recovers every slot marked for flushing.
    ///
    /// Slots that end up needing a remap check raise the pool's remap flag,
    /// to be served by [`recover_remaps`](Self::recover_remaps).
    pub fn recover_all(
        &self,
        pool: &JournalPool,
        device: &dyn SlotDevice,
        dead: DeadPositions,
    ) -> RecoveryStats {
        let mut stats = RecoveryStats::default();

        while let Some(slot) = pool.next_for_flush() {
            stats.slots_processed += 1;
            match self.run_slot(device, slot, dead, Pass::Flush) {
                Ok(recon) => {
                    stats.record(recon.decision);
                    if recon.remap_needed {
                        stats.remaps += 1;
                        if let Err(err) = pool.set_invalidate_state(slot, InvalidateReason::NeedsRemap) {
                            tracing::warn!(slot, error = %err, "Could not record remap reason");
                        }
                        pool.set_needs_remap();
                    }
                }
                Err(err) => {
                    tracing::error!(slot, error = %err, "Journal slot recovery failed");
                    stats.errors += 1;
                }
            }
            if let Err(err) = pool.release(slot) {
                tracing::error!(slot, error = %err, "Could not release recovered journal slot");
                stats.errors += 1;
            }
        }

        tracing::info!(?stats, "Journal recovery complete");
        stats
    }

    /// Re-runs recovery on the slots marked for a remap check.
    ///
    /// Header copies left in `NeedsRemap` are rewritten as `Invalid`. A slot
    /// that hits a media error again keeps its `NeedsRemap` headers but does
    /// not raise the pool flag a second time.
    pub fn recover_remaps(
        &self,
        pool: &JournalPool,
        device: &dyn SlotDevice,
        dead: DeadPositions,
        both_halves: bool,
    ) -> RecoveryStats {
        let mut stats = RecoveryStats::default();

        while let Some(slot) = pool.next_for_remap(both_halves) {
            stats.slots_processed += 1;
            match self.run_slot(device, slot, dead, Pass::Remap) {
                Ok(recon) => {
                    stats.record(recon.decision);
                    if recon.remap_needed {
                        stats.remaps += 1;
                    }
                }
                Err(err) => {
                    tracing::error!(slot, error = %err, "Journal slot remap failed");
                    stats.errors += 1;
                }
            }
            if let Err(err) = pool.release_remap_slot(slot) {
                tracing::error!(slot, error = %err, "Could not release remapped journal slot");
                stats.errors += 1;
            }
        }

        tracing::info!(?stats, "Journal remap pass complete");
        stats
    }

    fn run_slot(
        &self,
        device: &dyn SlotDevice,
        slot: SlotId,
        dead: DeadPositions,
        pass: Pass,
    ) -> Result<Reconciliation> {
        let mut request = JournalRequest::for_slot(RequestId(slot as u64), slot, dead);
        let plan = self.header_read_plan(slot, dead)?;
        let reads = device.read_headers(&plan);
        let mut recon = match self.validate_headers(&mut request, &reads, FlushPhase::FullFlush) {
            Ok(recon) => recon,
            Err(err) if err.is_header_conflict() => {
                tracing::error!(slot, error = %err, "Discarding journal slot with conflicting headers");
                self.discard_conflicting(&request, &reads)?
            }
            Err(err) => return Err(err),
        };

        let found_remap = recon.remap_needed;
        if pass == Pass::Remap {
            recon.remap_needed = false;
        }

        if recon.decision == FlushDecision::Flush {
            let data_reads = self.generate_flush_reads(&request, &recon)?;
            let data = device.read_data(&data_reads);
            let verdict =
                self.evaluate_flush_data(&request, &mut recon, data.error_bitmap, &data.data)?;
            if verdict == FlushDecision::Flush {
                let writes = self.generate_flush_writes(&request, &recon, &data_reads)?;
                let outcome = device.write(&writes);
                if !outcome.media_errors.is_empty() {
                    tracing::warn!(slot, positions = %outcome.media_errors, "Media error during journal flush");
                    recon.note_media_error();
                }
            }
        }

        let stale_remap = pass == Pass::Remap && found_remap;
        if recon.decision != FlushDecision::Clean || stale_remap {
            let writes = self.generate_invalidate_writes(&request, &mut recon, FlushPhase::FullFlush)?;
            let outcome = device.write(&writes);
            if !outcome.media_errors.is_empty() {
                tracing::warn!(slot, positions = %outcome.media_errors, "Media error invalidating journal headers");
            }
        }

        Ok(recon)
    }
}
