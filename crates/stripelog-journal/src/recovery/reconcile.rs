//! Reconciliation of mirrored header copies.

use stripelog_core::{Position, PositionBitmap};

use super::{FlushDecision, HeaderRead, JournalRecovery, Reconciliation};
use crate::error::{JournalError, Result};
use crate::events::{AbandonCause, FlushPhase};
use crate::header::{HeaderState, SlotHeader, Timestamp, HEADER_VERSION};
use crate::metrics::integrity_error;
use crate::request::JournalRequest;

impl JournalRecovery {
    /// Reconciles the header copies read from a slot.
    ///
    /// Copies of another format version are invalidated in memory; an
    /// all-zero copy is an untouched slot and is invalidated silently. Among
    /// the valid copies the latest timestamp wins: its copies must be exact
    /// mirrors and form the model, older copies are invalidated. Failed reads
    /// of positions the model covers are regenerated from the model. Without a
    /// model, any failed read invalidates the slot on the readable positions.
    ///
    /// If every required position then holds the model, the flush is
    /// authorized and the model's addressing is copied into `request`. A
    /// full flush that falls short abandons the slot and reports it.
    ///
    /// # Errors
    ///
    /// Returns an error if the request has no valid slot, a read comes from
    /// outside the RAID group, copies at the latest timestamp differ, or a
    /// current copy comes from a position its own bitmap excludes.
    pub fn validate_headers(
        &self,
        request: &mut JournalRequest,
        reads: &[HeaderRead],
        phase: FlushPhase,
    ) -> Result<Reconciliation> {
        let slot = request.require_slot().map_err(integrity_error)?;
        self.layout.check(slot).map_err(integrity_error)?;

        let width = self.geometry.width();
        let mut recon = Reconciliation::new(slot, width);
        let latest = self.collect_headers(&mut recon, reads)?;

        if !latest.is_zero() {
            self.select_model(&mut recon, latest)?;
        }

        let Some(model) = recon.model.clone() else {
            let failed = recon.failed_bitmap.popcount();
            if failed >= self.alert_threshold {
                self.report_abandoned(
                    request,
                    &recon,
                    recon.failed_bitmap,
                    FlushPhase::HeaderRead,
                    AbandonCause::FailedHeaderReads,
                );
            }
            recon.decision = if recon.invalidated || !recon.failed_bitmap.is_empty() {
                FlushDecision::Invalidate
            } else {
                FlushDecision::Clean
            };
            tracing::info!(slot, failed, decision = ?recon.decision, "No valid journal header generation");
            return Ok(recon);
        };

        let failed: Vec<Position> = recon.failed_bitmap.iter().collect();
        for position in failed {
            if model.write_bitmap.is_set(position) && !request.dead.contains(position) {
                tracing::debug!(slot, position, "Regenerating journal header from model");
                recon.headers[position] = Some(model.clone());
                recon.valid_bitmap.set(position);
                recon.num_drive_ops += 1;
            }
        }

        recon.required_bitmap = model.write_bitmap & !request.dead.bitmap();
        if recon.required_bitmap == recon.valid_bitmap {
            request.adopt(&model);
            recon.decision = FlushDecision::Flush;
        } else if phase == FlushPhase::FullFlush {
            recon.decision = FlushDecision::Abandon;
            let missing = recon.required_bitmap & !recon.valid_bitmap;
            self.report_abandoned(request, &recon, missing, phase, AbandonCause::IncompleteWrite);
        } else {
            recon.decision = FlushDecision::Incomplete;
        }

        tracing::info!(
            slot,
            timestamp = %model.timestamp,
            required = %recon.required_bitmap,
            valid = %recon.valid_bitmap,
            drive_ops = recon.num_drive_ops,
            decision = ?recon.decision,
            "Journal headers reconciled"
        );
        Ok(recon)
    }

    /// Discards a slot whose current header copies contradict each other.
    ///
    /// Every readable copy is invalidated in memory and keeps its own fields.
    /// The loss is reported against the positions that held a valid copy.
    ///
    /// # Errors
    ///
    /// Returns an error if the request has no valid slot or a read comes from
    /// outside the RAID group.
    pub fn discard_conflicting(
        &self,
        request: &JournalRequest,
        reads: &[HeaderRead],
    ) -> Result<Reconciliation> {
        let slot = request.require_slot().map_err(integrity_error)?;
        self.layout.check(slot).map_err(integrity_error)?;

        let mut recon = Reconciliation::new(slot, self.geometry.width());
        self.collect_headers(&mut recon, reads)?;

        let mut conflicting = PositionBitmap::EMPTY;
        for (position, header) in recon.headers.iter_mut().enumerate() {
            let Some(header) = header.as_mut() else { continue };
            if header.is_valid() {
                conflicting.set(position);
                header.set_invalid();
            }
        }
        recon.invalidated = true;
        recon.decision = FlushDecision::Abandon;
        self.report_abandoned(
            request,
            &recon,
            conflicting,
            FlushPhase::FullFlush,
            AbandonCause::HeaderConflict,
        );
        Ok(recon)
    }

    /// Decodes every read into `recon.headers` and returns the latest valid
    /// timestamp.
    fn collect_headers(&self, recon: &mut Reconciliation, reads: &[HeaderRead]) -> Result<Timestamp> {
        let slot = recon.slot;
        let width = self.geometry.width();
        let mut latest = Timestamp::default();

        for read in reads {
            let position = read.position;
            if position >= width {
                return Err(integrity_error(JournalError::InvalidPosition { position, width }));
            }
            let Some(block) = &read.block else {
                tracing::debug!(slot, position, "Journal header read failed");
                recon.failed_bitmap.set(position);
                continue;
            };

            let mut header = match block.header() {
                Ok(header) => header,
                Err(err) => {
                    tracing::warn!(slot, position, error = %err, "Undecodable journal header");
                    let mut header = SlotHeader::default();
                    header.set_invalid();
                    recon.headers[position] = Some(header);
                    recon.invalidated = true;
                    continue;
                }
            };

            if header.header_version == HEADER_VERSION {
                if header.header_state == HeaderState::NeedsRemap {
                    recon.remap_needed = true;
                }
                if header.is_valid() && header.timestamp > latest {
                    latest = header.timestamp;
                }
            } else {
                if !header.is_zeroed() {
                    tracing::warn!(
                        slot,
                        position,
                        version = header.header_version,
                        "Journal header version mismatch"
                    );
                    header.timestamp = Timestamp::default();
                    recon.invalidated = true;
                }
                header.set_invalid();
            }
            recon.headers[position] = Some(header);
        }
        Ok(latest)
    }

    /// Picks the model among the copies at `latest` and invalidates older ones.
    fn select_model(&self, recon: &mut Reconciliation, latest: Timestamp) -> Result<()> {
        let slot = recon.slot;
        for position in 0..recon.headers.len() {
            let Some(header) = recon.headers[position].as_mut() else { continue };
            if !header.is_valid() {
                continue;
            }

            if header.timestamp < latest {
                tracing::debug!(slot, position, timestamp = %header.timestamp, "Stale journal header");
                header.set_invalid();
                recon.invalidated = true;
                continue;
            }

            match &recon.model {
                None => recon.model = Some(header.clone()),
                Some(model) if model != header => {
                    tracing::error!(slot, position, "Journal mirror headers differ");
                    return Err(integrity_error(JournalError::MirrorMismatch { slot }));
                }
                Some(_) => {}
            }
            if !header.write_bitmap.is_set(position) {
                tracing::error!(slot, position, bitmap = %header.write_bitmap, "Journal header from unlisted position");
                return Err(integrity_error(JournalError::PositionNotInBitmap {
                    slot,
                    position,
                    bitmap: header.write_bitmap,
                }));
            }
            recon.valid_bitmap.set(position);
            recon.num_drive_ops += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use stripelog_core::{DeadPositions, PositionBitmap, RaidGeometry};

    use super::*;
    use crate::events::CollectingEventSink;
    use crate::header::{DiskInfo, HeaderBlock};
    use crate::layout::SlotLayout;
    use crate::request::RequestId;

    fn recovery(events: Arc<CollectingEventSink>) -> JournalRecovery {
        JournalRecovery::new(SlotLayout::new(0, 17, 8, 1), RaidGeometry::new(5, 1, 16, 1).unwrap())
            .with_group_id(4)
            .with_events(events)
    }

    fn header(timestamp: Timestamp, bitmap: u16) -> SlotHeader {
        let mut header = SlotHeader {
            header_version: HEADER_VERSION,
            header_state: HeaderState::Valid,
            timestamp,
            start_lba: 0x5000,
            xfer_count: 40,
            parity_start: 0x200,
            parity_count: 16,
            write_bitmap: PositionBitmap::from_bits(bitmap),
            ..SlotHeader::default()
        };
        for position in header.write_bitmap.iter().collect::<Vec<_>>() {
            header.disk_info[position] = DiskInfo { offset: 0, block_count: 16 };
        }
        header
    }

    fn read(position: Position, header: &SlotHeader) -> HeaderRead {
        HeaderRead::ok(position, HeaderBlock::from_header(header))
    }

    fn request(dead: DeadPositions) -> JournalRequest {
        JournalRequest::for_slot(RequestId(1), 2, dead)
    }

    #[test]
    fn test_latest_generation_wins() {
        let events = Arc::new(CollectingEventSink::new());
        let current = header(Timestamp::new(100, 500_000), 0b11110);
        let stale = header(Timestamp::new(90, 0), 0b11111);
        let mut reads = vec![read(0, &stale)];
        reads.extend((1..5).map(|pos| read(pos, &current)));

        let mut request = request(DeadPositions::none());
        let recon = recovery(events.clone())
            .validate_headers(&mut request, &reads, FlushPhase::FullFlush)
            .unwrap();

        assert_eq!(recon.decision, FlushDecision::Flush);
        assert_eq!(recon.model.as_ref(), Some(&current));
        assert_eq!(recon.num_drive_ops, 4);
        assert!(recon.invalidated);
        assert_eq!(recon.headers[0].as_ref().unwrap().header_state, HeaderState::Invalid);
        assert_eq!(request.start_lba, 0x5000);
        assert_eq!(request.parity_count, 16);
        assert!(events.is_empty());
    }

    #[test]
    fn test_failed_read_regenerated_from_model() {
        let current = header(Timestamp::new(100, 500_000), 0b11110);
        let reads = vec![
            read(0, &header(Timestamp::new(90, 0), 0b11111)),
            read(1, &current),
            HeaderRead::failed(2),
            read(3, &current),
            read(4, &current),
        ];
        let mut request = request(DeadPositions::none());
        let recon = recovery(Arc::default())
            .validate_headers(&mut request, &reads, FlushPhase::FullFlush)
            .unwrap();

        assert_eq!(recon.decision, FlushDecision::Flush);
        assert_eq!(recon.num_drive_ops, 4);
        assert_eq!(recon.failed_bitmap.bits(), 0b00100);
        assert_eq!(recon.headers[2].as_ref(), Some(&current));
    }

    #[test]
    fn test_untouched_slot_is_clean() {
        let zero = SlotHeader::default();
        let reads: Vec<_> = (0..5).map(|pos| read(pos, &zero)).collect();
        let recon = recovery(Arc::default())
            .validate_headers(&mut request(DeadPositions::none()), &reads, FlushPhase::FullFlush)
            .unwrap();
        assert_eq!(recon.decision, FlushDecision::Clean);
        assert!(!recon.invalidated);
        assert!(recon.headers.iter().flatten().all(|h| h.header_state == HeaderState::Invalid));
    }

    #[test]
    fn test_foreign_version_is_invalidated() {
        let mut foreign = header(Timestamp::new(100, 0), 0b11111);
        foreign.header_version = 9;
        let reads: Vec<_> = (0..5).map(|pos| read(pos, &foreign)).collect();
        let recon = recovery(Arc::default())
            .validate_headers(&mut request(DeadPositions::none()), &reads, FlushPhase::FullFlush)
            .unwrap();
        assert_eq!(recon.decision, FlushDecision::Invalidate);
        let first = recon.headers[0].as_ref().unwrap();
        assert_eq!(first.header_version, HEADER_VERSION);
        assert!(first.timestamp.is_zero());
    }

    #[test]
    fn test_failed_reads_alert_threshold() {
        let events = Arc::new(CollectingEventSink::new());
        let zero = SlotHeader::default();
        let mut reads: Vec<_> = (0..3).map(|pos| read(pos, &zero)).collect();
        reads.push(HeaderRead::failed(3));

        let recon = recovery(events.clone())
            .validate_headers(&mut request(DeadPositions::none()), &reads, FlushPhase::FullFlush)
            .unwrap();
        assert!(events.is_empty());
        assert_eq!(recon.decision, FlushDecision::Invalidate);

        reads.push(HeaderRead::failed(4));
        let recon = recovery(events.clone())
            .validate_headers(&mut request(DeadPositions::none()), &reads, FlushPhase::FullFlush)
            .unwrap();
        assert_eq!(recon.decision, FlushDecision::Invalidate);
        let emitted = events.events();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].positions().bits(), 0b11000);
        assert_eq!(emitted[0].group_id(), 4);
        assert!(matches!(
            emitted[0],
            crate::events::JournalEvent::FlushAbandoned {
                phase: FlushPhase::HeaderRead,
                timestamp: None,
                ..
            }
        ));
    }

    #[test]
    fn test_incomplete_write_is_abandoned() {
        let events = Arc::new(CollectingEventSink::new());
        let current = header(Timestamp::new(100, 0), 0b01111);
        let reads = vec![
            read(0, &header(Timestamp::new(50, 0), 0b01111)),
            read(1, &current),
            read(2, &current),
            read(3, &current),
        ];
        let mut request = request(DeadPositions::one(4));
        let recon = recovery(events.clone())
            .validate_headers(&mut request, &reads, FlushPhase::FullFlush)
            .unwrap();

        assert_eq!(recon.required_bitmap.bits(), 0b1111);
        assert_eq!(recon.valid_bitmap.bits(), 0b1110);
        assert_eq!(recon.decision, FlushDecision::Abandon);
        assert_eq!(request.start_lba, 0);
        assert_eq!(events.len(), 1);
        assert_eq!(events.events()[0].positions().bits(), 0b0001);

        // A header-only pass leaves the decision to the full flush.
        let recon = recovery(Arc::default())
            .validate_headers(&mut request.clone(), &reads, FlushPhase::HeaderRead)
            .unwrap();
        assert_eq!(recon.decision, FlushDecision::Incomplete);
    }

    #[test]
    fn test_mirror_mismatch_is_an_error() {
        let current = header(Timestamp::new(100, 0), 0b00011);
        let mut other = current.clone();
        other.start_lba += 1;
        let reads = vec![read(0, &current), read(1, &other)];
        let err = recovery(Arc::default())
            .validate_headers(&mut request(DeadPositions::none()), &reads, FlushPhase::FullFlush)
            .unwrap_err();
        assert!(matches!(err, JournalError::MirrorMismatch { slot: 2 }));
    }

    #[test]
    fn test_conflicting_copies_are_discarded() {
        let events = Arc::new(CollectingEventSink::new());
        let current = header(Timestamp::new(100, 0), 0b00111);
        let mut other = current.clone();
        other.start_lba += 1;
        let reads = vec![read(0, &current), read(1, &other), HeaderRead::failed(2)];

        let recon = recovery(events.clone())
            .discard_conflicting(&request(DeadPositions::none()), &reads)
            .unwrap();
        assert_eq!(recon.decision, FlushDecision::Abandon);
        assert!(recon.model.is_none());
        assert_eq!(recon.failed_bitmap.bits(), 0b100);
        let kept = recon.headers[1].as_ref().unwrap();
        assert_eq!(kept.header_state, HeaderState::Invalid);
        assert_eq!(kept.start_lba, 0x5001);

        let emitted = events.events();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].positions().bits(), 0b011);
        assert!(matches!(
            emitted[0],
            crate::events::JournalEvent::FlushAbandoned {
                error_info: AbandonCause::HeaderConflict,
                ..
            }
        ));
    }

    #[test]
    fn test_position_not_in_bitmap_is_an_error() {
        let current = header(Timestamp::new(100, 0), 0b00011);
        let reads = vec![read(0, &current), read(2, &current)];
        let err = recovery(Arc::default())
            .validate_headers(&mut request(DeadPositions::none()), &reads, FlushPhase::FullFlush)
            .unwrap_err();
        assert!(matches!(err, JournalError::PositionNotInBitmap { slot: 2, position: 2, .. }));
    }

    #[test]
    fn test_remap_state_is_reported() {
        let mut remap = header(Timestamp::new(100, 0), 0b11111);
        remap.header_state = HeaderState::NeedsRemap;
        let reads: Vec<_> = (0..5).map(|pos| read(pos, &remap)).collect();
        let recon = recovery(Arc::default())
            .validate_headers(&mut request(DeadPositions::none()), &reads, FlushPhase::FullFlush)
            .unwrap();
        assert!(recon.remap_needed);
        assert_eq!(recon.decision, FlushDecision::Clean);
    }

    #[test]
    fn test_requires_slot() {
        let mut request = JournalRequest::new(RequestId(1), 0, 0, 0, 0);
        let err = recovery(Arc::default())
            .validate_headers(&mut request, &[], FlushPhase::FullFlush)
            .unwrap_err();
        assert!(matches!(err, JournalError::InvalidSlot));
    }
}
