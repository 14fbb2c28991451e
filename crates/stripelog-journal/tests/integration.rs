//! Integration tests for the write-hole journal.
//!
//! The end-to-end tests drive a journaled write into an in-memory set of
//! member disks and then run crash recovery over it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use proptest::prelude::*;
use stripelog_core::{
    ControllerId, DeadPositions, Lba, Opcode, Position, PositionBitmap, RaidGeometry,
    WriteAlgorithm,
};
use stripelog_journal::{
    checksum_of_checksums, compare_timestamp, needs_logging, prepare_journal_write,
    AbandonCause, Allocation, CollectingEventSink, DataRead, DataReadback, DiskInfo, DriveOp,
    FlushDecision, FlushPhase, HeaderBlock, HeaderRead, HeaderState, JournalEvent, JournalPool,
    JournalRecovery, JournalRequest, LoggingPolicy, RequestId, SlotDevice, SlotGrant, SlotHeader,
    SlotLayout, SlotState, Timestamp, WriteDescriptor, WriteOutcome, WriteShape, HEADER_VERSION,
};

const WIDTH: usize = 5;
const BLOCKS: usize = 8;
const PARITY_START: Lba = 0x800;

fn geometry() -> RaidGeometry {
    RaidGeometry::new(WIDTH, 1, 128, 1).unwrap()
}

/// Four slots, two per controller.
fn layout() -> SlotLayout {
    SlotLayout::new(0x10000, 17, 4, 1)
}

fn block_checksums(position: Position) -> Vec<u16> {
    (0..BLOCKS).map(|i| 0x1000 + (position as u16) * 0x100 + i as u16).collect()
}

/// Member disks kept in memory, with injectable faults.
#[derive(Default)]
struct MemoryDevice {
    headers: Mutex<HashMap<(Position, Lba), HeaderBlock>>,
    data: Mutex<HashMap<(Position, Lba), Vec<u16>>>,
    failed_header_reads: Mutex<PositionBitmap>,
    data_errors: Mutex<PositionBitmap>,
    media_errors: Mutex<PositionBitmap>,
    live_writes: Mutex<Vec<DriveOp>>,
}

impl MemoryDevice {
    /// Lands a prepared journal write on disk, as the stripe write would.
    fn journal_write(&self, slot: usize, dead: DeadPositions) -> SlotHeader {
        let layout = layout();
        let request = JournalRequest::new(RequestId(100 + slot as u64), 0x2000, 32, PARITY_START, 8)
            .with_dead(dead)
            .with_slot(slot);
        let mut descriptors: Vec<_> = (0..WIDTH)
            .map(|pos| WriteDescriptor::new(pos, PARITY_START, block_checksums(pos)))
            .collect();

        let plan =
            prepare_journal_write(&request, &descriptors, &layout, &geometry(), Timestamp::now())
                .unwrap();
        plan.apply(&mut descriptors).unwrap();

        for edit in plan.edits() {
            let desc = descriptors.iter().find(|d| d.position == edit.position).unwrap();
            self.headers
                .lock()
                .insert((edit.position, edit.after.lba), plan.header_region()[0].clone());
            self.data.lock().insert(
                (edit.position, edit.after.lba + layout.header_blocks()),
                desc.block_checksums.clone(),
            );
        }
        plan.header().clone()
    }

    fn stored_header(&self, position: Position, lba: Lba) -> Option<SlotHeader> {
        self.headers.lock().get(&(position, lba)).map(|block| block.header().unwrap())
    }

    fn wipe_header(&self, position: Position, lba: Lba) {
        self.headers.lock().insert((position, lba), HeaderBlock::zeroed());
    }
}

impl SlotDevice for MemoryDevice {
    fn read_headers(&self, ops: &[DriveOp]) -> Vec<HeaderRead> {
        let failed = *self.failed_header_reads.lock();
        let headers = self.headers.lock();
        ops.iter()
            .map(|op| {
                if failed.is_set(op.position) {
                    HeaderRead::failed(op.position)
                } else {
                    let block = headers
                        .get(&(op.position, op.lba))
                        .cloned()
                        .unwrap_or_else(HeaderBlock::zeroed);
                    HeaderRead::ok(op.position, block)
                }
            })
            .collect()
    }

    fn read_data(&self, ops: &[DriveOp]) -> DataRead {
        let data = self.data.lock();
        DataRead {
            error_bitmap: *self.data_errors.lock(),
            data: ops
                .iter()
                .filter_map(|op| {
                    data.get(&(op.position, op.lba)).map(|checksums| DataReadback {
                        position: op.position,
                        block_checksums: checksums.clone(),
                    })
                })
                .collect(),
        }
    }

    fn write(&self, ops: &[DriveOp]) -> WriteOutcome {
        let mut media_errors = PositionBitmap::EMPTY;
        for op in ops.iter().filter(|op| !op.is_nop()) {
            if let Some(block) = op.header.first() {
                self.headers.lock().insert((op.position, op.lba), block.clone());
            } else {
                self.live_writes.lock().push(op.clone());
                if self.media_errors.lock().is_set(op.position) {
                    media_errors.set(op.position);
                }
            }
        }
        WriteOutcome { media_errors }
    }
}

fn recovery(events: Arc<CollectingEventSink>) -> JournalRecovery {
    JournalRecovery::new(layout(), geometry()).with_group_id(7).with_events(events)
}

fn model_header(timestamp: Timestamp, bits: u16) -> SlotHeader {
    let mut header = SlotHeader {
        header_version: HEADER_VERSION,
        header_state: HeaderState::Valid,
        timestamp,
        start_lba: 0x2000,
        xfer_count: 32,
        parity_start: PARITY_START,
        parity_count: 8,
        write_bitmap: PositionBitmap::from_bits(bits),
        ..SlotHeader::default()
    };
    for position in header.write_bitmap.iter().collect::<Vec<_>>() {
        header.disk_info[position] = DiskInfo { offset: 0, block_count: BLOCKS as u16 };
    }
    header
}

fn read(position: Position, header: &SlotHeader) -> HeaderRead {
    HeaderRead::ok(position, HeaderBlock::from_header(header))
}

// =============================================================================
// Scenarios
// =============================================================================

#[test]
fn test_waiter_receives_released_slot() {
    let pool = JournalPool::new(layout(), ControllerId::A);

    assert_eq!(pool.allocate(RequestId(1)).granted(), Some(0));
    assert_eq!(pool.allocate(RequestId(2)).granted(), Some(1));
    let Allocation::Pending(mut pending) = pool.allocate(RequestId(3)) else {
        panic!("third allocation should queue");
    };
    assert_eq!(pending.try_take(), None);

    assert_eq!(pool.release(0).unwrap(), Some(RequestId(3)));
    assert_eq!(pool.slot_state(0).unwrap(), SlotState::Allocated);
    assert_eq!(pool.owner(0).unwrap(), Some(RequestId(3)));
    assert_eq!(pending.try_take(), Some(SlotGrant::Granted(0)));
    assert_eq!(pool.waiting(), 0);
}

#[test]
fn test_build_leaves_dead_position_out() {
    let request = JournalRequest::new(RequestId(1), 0x2000, 32, PARITY_START, 8)
        .with_dead(DeadPositions::one(2))
        .with_slot(0);
    let descriptors: Vec<_> = (0..WIDTH)
        .map(|pos| WriteDescriptor::new(pos, PARITY_START, block_checksums(pos)))
        .collect();

    let header =
        SlotHeader::build(&request, &descriptors, &geometry(), Timestamp::new(5, 0)).unwrap();
    assert_eq!(header.write_bitmap, PositionBitmap::from_bits(0b11011));
    assert_eq!(header.disk_info[2], DiskInfo::default());
    assert_eq!(header.disk_info[3].block_count, BLOCKS as u16);
}

#[test]
fn test_latest_generation_becomes_model() {
    let recovery = recovery(Arc::new(CollectingEventSink::new()));
    let current = model_header(Timestamp::new(100, 500_000), 0b11110);
    let stale = model_header(Timestamp::new(90, 0), 0b00001);

    let reads: Vec<_> = std::iter::once(read(0, &stale))
        .chain((1..WIDTH).map(|pos| read(pos, &current)))
        .collect();
    let mut request = JournalRequest::for_slot(RequestId(1), 0, DeadPositions::none());
    let recon = recovery.validate_headers(&mut request, &reads, FlushPhase::FullFlush).unwrap();

    assert_eq!(recon.model.as_ref(), Some(&current));
    assert!(!recon.headers[0].as_ref().unwrap().is_valid());
    assert_eq!(recon.num_drive_ops, 4);
    assert_eq!(recon.decision, FlushDecision::Flush);
    assert_eq!(request.start_lba, 0x2000);
}

#[test]
fn test_failed_read_is_regenerated() {
    let recovery = recovery(Arc::new(CollectingEventSink::new()));
    let current = model_header(Timestamp::new(100, 500_000), 0b11110);
    let stale = model_header(Timestamp::new(90, 0), 0b00001);

    let reads = vec![
        read(0, &stale),
        read(1, &current),
        HeaderRead::failed(2),
        read(3, &current),
        read(4, &current),
    ];
    let mut request = JournalRequest::for_slot(RequestId(1), 0, DeadPositions::none());
    let recon = recovery.validate_headers(&mut request, &reads, FlushPhase::FullFlush).unwrap();

    assert!(recon.is_flush_authorized());
    assert_eq!(recon.num_drive_ops, 4);
    assert_eq!(recon.headers[2].as_ref(), Some(&current));
    assert_eq!(recon.failed_bitmap, PositionBitmap::single(2));
    assert_eq!(recon.valid_bitmap, PositionBitmap::from_bits(0b11110));
}

#[test]
fn test_missing_required_header_abandons_flush() {
    let events = Arc::new(CollectingEventSink::new());
    let recovery = recovery(Arc::clone(&events));
    let current = model_header(Timestamp::new(100, 0), 0b01111);

    let reads = vec![
        HeaderRead::ok(0, HeaderBlock::zeroed()),
        read(1, &current),
        read(2, &current),
        read(3, &current),
    ];
    let mut request = JournalRequest::for_slot(RequestId(1), 1, DeadPositions::one(4));
    let mut recon =
        recovery.validate_headers(&mut request, &reads, FlushPhase::FullFlush).unwrap();

    assert_eq!(recon.required_bitmap, PositionBitmap::from_bits(0b1111));
    assert_eq!(recon.valid_bitmap, PositionBitmap::from_bits(0b1110));
    assert_eq!(recon.decision, FlushDecision::Abandon);

    let writes = recovery
        .generate_invalidate_writes(&request, &mut recon, FlushPhase::FullFlush)
        .unwrap();
    assert_eq!(writes.iter().filter(|op| !op.is_nop()).count(), 4);
    assert!(writes[4].is_nop());

    let recorded = events.events();
    assert_eq!(recorded.len(), 1);
    let JournalEvent::FlushAbandoned { positions, slot, error_info, phase, .. } = &recorded[0];
    assert_eq!(*positions, PositionBitmap::single(0));
    assert_eq!(*slot, 1);
    assert_eq!(*error_info, AbandonCause::IncompleteWrite);
    assert_eq!(*phase, FlushPhase::FullFlush);
}

#[test]
fn test_logging_policy_decisions() {
    let policy = LoggingPolicy::default();
    let geometry = geometry();

    let aligned = WriteShape::new(0, 512, WriteAlgorithm::Rcw);
    assert!(!needs_logging(&policy, &aligned, &geometry));

    for opcode in [Opcode::Write, Opcode::WriteNonCached] {
        let unaligned = WriteShape::new(3, 20, WriteAlgorithm::Mr3)
            .with_opcode(opcode)
            .with_dead(DeadPositions::one(1))
            .with_positions(4, 0);
        assert!(needs_logging(&policy, &unaligned, &geometry), "{opcode:?}");
    }
}

// =============================================================================
// End-to-end recovery
// =============================================================================

#[test]
fn test_recovery_flushes_interrupted_write() {
    let device = MemoryDevice::default();
    let dead = DeadPositions::one(2);
    device.journal_write(0, dead);

    let events = Arc::new(CollectingEventSink::new());
    let recovery = recovery(Arc::clone(&events));
    let pool = JournalPool::new(layout(), ControllerId::A);
    pool.mark_all_for_flush(true);

    let stats = recovery.recover_all(&pool, &device, dead);
    assert_eq!(stats.slots_processed, 4);
    assert_eq!(stats.flushed, 1);
    assert_eq!(stats.clean, 3);
    assert_eq!(stats.errors, 0);
    assert!(events.is_empty());

    let live = device.live_writes.lock();
    let positions: Vec<_> = live.iter().map(|op| op.position).collect();
    assert_eq!(positions, vec![0, 1, 3, 4]);
    assert!(live.iter().all(|op| op.lba == PARITY_START && op.blocks == BLOCKS as u64));
    drop(live);

    let slot_lba = layout().slot_lba(0).unwrap();
    for position in [0, 1, 3, 4] {
        let header = device.stored_header(position, slot_lba).unwrap();
        assert_eq!(header.header_state, HeaderState::Invalid);
    }
    assert!(pool.info().slots.iter().all(|s| s.state == SlotState::Free));
}

#[test]
fn test_recovery_drops_torn_journal_write() {
    let device = MemoryDevice::default();
    let dead = DeadPositions::one(2);
    device.journal_write(1, dead);

    let data_lba = layout().data_lba(1).unwrap();
    device.data.lock().insert((3, data_lba), vec![0; BLOCKS]);

    let events = Arc::new(CollectingEventSink::new());
    let recovery = recovery(Arc::clone(&events));
    let pool = JournalPool::new(layout(), ControllerId::A);
    pool.mark_all_for_flush(true);

    let stats = recovery.recover_all(&pool, &device, dead);
    assert_eq!(stats.invalidated, 1);
    assert_eq!(stats.flushed, 0);
    assert!(device.live_writes.lock().is_empty());
    assert!(events.is_empty());

    let header = device.stored_header(0, layout().slot_lba(1).unwrap()).unwrap();
    assert!(!header.is_valid());
}

#[test]
fn test_recovery_reports_partial_header_write() {
    let device = MemoryDevice::default();
    let dead = DeadPositions::one(2);
    device.journal_write(0, dead);
    device.wipe_header(3, layout().slot_lba(0).unwrap());

    let events = Arc::new(CollectingEventSink::new());
    let recovery = recovery(Arc::clone(&events));
    let pool = JournalPool::new(layout(), ControllerId::A);
    pool.mark_all_for_flush(true);

    let stats = recovery.recover_all(&pool, &device, dead);
    assert_eq!(stats.abandoned, 1);
    assert!(device.live_writes.lock().is_empty());

    let recorded = events.events();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].group_id(), 7);
    assert_eq!(recorded[0].positions(), PositionBitmap::single(3));
    assert_eq!(recorded[0].event_type(), "FlushAbandoned");
}

#[test]
fn test_recovery_abandons_on_data_read_error() {
    let device = MemoryDevice::default();
    let dead = DeadPositions::one(2);
    device.journal_write(0, dead);
    *device.data_errors.lock() = PositionBitmap::single(1);

    let events = Arc::new(CollectingEventSink::new());
    let recovery = recovery(Arc::clone(&events));
    let pool = JournalPool::new(layout(), ControllerId::A);
    pool.mark_all_for_flush(true);

    let stats = recovery.recover_all(&pool, &device, dead);
    assert_eq!(stats.abandoned, 1);
    assert!(device.live_writes.lock().is_empty());
    let recorded = events.events();
    assert_eq!(recorded.len(), 1);
    let JournalEvent::FlushAbandoned { error_info, timestamp, .. } = &recorded[0];
    assert_eq!(*error_info, AbandonCause::DataReadError);
    assert!(timestamp.is_some());
}

#[test]
fn test_media_error_leads_to_remap_pass() {
    let device = MemoryDevice::default();
    let dead = DeadPositions::one(2);
    device.journal_write(0, dead);
    *device.media_errors.lock() = PositionBitmap::single(4);

    let recovery = recovery(Arc::new(CollectingEventSink::new()));
    let pool = JournalPool::new(layout(), ControllerId::A);
    pool.mark_all_for_flush(true);

    let stats = recovery.recover_all(&pool, &device, dead);
    assert_eq!(stats.flushed, 1);
    assert_eq!(stats.remaps, 1);
    assert!(pool.needs_remap());

    let slot_lba = layout().slot_lba(0).unwrap();
    let header = device.stored_header(0, slot_lba).unwrap();
    assert_eq!(header.header_state, HeaderState::NeedsRemap);

    let stats = recovery.recover_remaps(&pool, &device, dead, false);
    assert_eq!(stats.slots_processed, 2);
    assert_eq!(stats.remaps, 0);
    assert_eq!(stats.errors, 0);
    assert!(!pool.needs_remap());

    let header = device.stored_header(0, slot_lba).unwrap();
    assert_eq!(header.header_state, HeaderState::Invalid);
    assert!(pool.info().slots.iter().all(|s| s.state == SlotState::Free));
}

#[test]
fn test_recovery_survives_failed_header_read() {
    let device = MemoryDevice::default();
    let dead = DeadPositions::one(2);
    device.journal_write(0, dead);
    *device.failed_header_reads.lock() = PositionBitmap::single(3);

    let events = Arc::new(CollectingEventSink::new());
    let recovery = recovery(Arc::clone(&events));
    let pool = JournalPool::new(layout(), ControllerId::A);
    pool.mark_for_flush(0).unwrap();

    let stats = recovery.recover_all(&pool, &device, dead);
    assert_eq!(stats.slots_processed, 1);
    assert_eq!(stats.flushed, 1);
    assert_eq!(device.live_writes.lock().len(), 4);
    // The failed copy is regenerated from the model.
    assert!(events.is_empty());
}

#[test]
fn test_recovery_invalidates_with_model_audit_trail() {
    let device = MemoryDevice::default();
    let dead = DeadPositions::one(2);
    let written = device.journal_write(0, dead);

    let recovery = recovery(Arc::new(CollectingEventSink::new()));
    let pool = JournalPool::new(layout(), ControllerId::A);
    pool.mark_for_flush(0).unwrap();
    recovery.recover_all(&pool, &device, dead);

    let slot_lba = layout().slot_lba(0).unwrap();
    for position in [0, 1, 3, 4] {
        let header = device.stored_header(position, slot_lba).unwrap();
        assert_eq!(header.header_state, HeaderState::Invalid);
        assert_eq!(header.timestamp, written.timestamp);
        assert_eq!(header.write_bitmap, written.write_bitmap);
        assert_eq!(header.start_lba, written.start_lba);
        assert_eq!(header.parity_start, written.parity_start);
    }
}

#[test]
fn test_recovery_discards_conflicting_mirrors() {
    let device = MemoryDevice::default();
    let dead = DeadPositions::one(2);
    let written = device.journal_write(0, dead);

    let slot_lba = layout().slot_lba(0).unwrap();
    let mut forged = written.clone();
    forged.start_lba += 0x100;
    for position in [1, 3] {
        device.headers.lock().insert((position, slot_lba), HeaderBlock::from_header(&forged));
    }

    let events = Arc::new(CollectingEventSink::new());
    let recovery = recovery(Arc::clone(&events));
    let pool = JournalPool::new(layout(), ControllerId::A);
    pool.mark_for_flush(0).unwrap();

    let stats = recovery.recover_all(&pool, &device, dead);
    assert_eq!(stats.abandoned, 1);
    assert_eq!(stats.errors, 0);
    assert!(device.live_writes.lock().is_empty());

    let recorded = events.events();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].positions().bits(), 0b11011);
    let JournalEvent::FlushAbandoned { error_info, .. } = &recorded[0];
    assert_eq!(*error_info, AbandonCause::HeaderConflict);

    for position in [0, 1, 3, 4] {
        let header = device.stored_header(position, slot_lba).unwrap();
        assert_eq!(header.header_state, HeaderState::Invalid);
        assert_eq!(header.timestamp, written.timestamp);
    }
    assert_eq!(device.stored_header(1, slot_lba).unwrap().start_lba, forged.start_lba);

    // A second pass finds nothing left to do.
    pool.mark_for_flush(0).unwrap();
    let stats = recovery.recover_all(&pool, &device, dead);
    assert_eq!(stats.abandoned, 0);
    assert_eq!(stats.clean, 1);
    assert_eq!(events.len(), 1);
}

#[test]
fn test_unreadable_untouched_slots_alert() {
    let device = MemoryDevice::default();
    *device.failed_header_reads.lock() = PositionBitmap::from_bits(0b00011);

    let events = Arc::new(CollectingEventSink::new());
    let recovery = recovery(Arc::clone(&events));
    let pool = JournalPool::new(layout(), ControllerId::A);
    pool.mark_all_for_flush(true);

    let stats = recovery.recover_all(&pool, &device, DeadPositions::none());
    assert_eq!(stats.invalidated, 4);
    assert_eq!(stats.clean, 0);
    assert!(device.live_writes.lock().is_empty());
    for slot in 0..4 {
        let slot_lba = layout().slot_lba(slot).unwrap();
        for position in [0, 1] {
            assert!(device.stored_header(position, slot_lba).is_none());
        }
        for position in [2, 3, 4] {
            let header = device.stored_header(position, slot_lba).unwrap();
            assert_eq!(header.header_state, HeaderState::Invalid);
        }
    }
    let recorded = events.events();
    assert_eq!(recorded.len(), 4);
    for event in &recorded {
        let JournalEvent::FlushAbandoned { phase, error_info, timestamp, .. } = event;
        assert_eq!(*phase, FlushPhase::HeaderRead);
        assert_eq!(*error_info, AbandonCause::FailedHeaderReads);
        assert!(timestamp.is_none());
    }
}

#[test]
fn test_clean_pool_writes_nothing() {
    let device = MemoryDevice::default();
    let recovery = recovery(Arc::new(CollectingEventSink::new()));
    let pool = JournalPool::new(layout(), ControllerId::B);
    pool.mark_all_for_flush(true);

    let stats = recovery.recover_all(&pool, &device, DeadPositions::none());
    assert_eq!(stats.clean, 4);
    assert!(device.headers.lock().is_empty());
    assert!(device.live_writes.lock().is_empty());
}

#[test]
fn test_peer_half_recovery_leaves_local_slots() {
    let device = MemoryDevice::default();
    let dead = DeadPositions::one(0);
    device.journal_write(2, dead);

    let recovery = recovery(Arc::new(CollectingEventSink::new()));
    let pool = JournalPool::new(layout(), ControllerId::A);
    assert_eq!(pool.allocate(RequestId(1)).granted(), Some(0));
    pool.mark_all_for_flush(false);

    let stats = recovery.recover_all(&pool, &device, dead);
    assert_eq!(stats.slots_processed, 2);
    assert_eq!(stats.flushed, 1);
    assert_eq!(pool.slot_state(0).unwrap(), SlotState::Allocated);
}

#[tokio::test]
async fn test_quiesce_wakes_waiters() {
    let pool = JournalPool::new(layout(), ControllerId::B);
    assert!(pool.allocate(RequestId(1)).granted().is_some());
    assert!(pool.allocate(RequestId(2)).granted().is_some());
    let Allocation::Pending(pending) = pool.allocate(RequestId(3)) else {
        panic!("allocation should queue");
    };

    let waiter = tokio::spawn(pending.wait());
    assert_eq!(pool.quiesce(), 1);
    assert_eq!(waiter.await.unwrap(), SlotGrant::Quiesced);
    assert!(matches!(pool.allocate(RequestId(4)), Allocation::Quiesced));
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    /// Every slot has at most one owner and waiters are served in arrival order.
    #[test]
    fn prop_single_owner_fifo(ops in prop::collection::vec(any::<bool>(), 1..64)) {
        let pool = JournalPool::new(layout(), ControllerId::A);
        let mut held: Vec<(RequestId, usize)> = Vec::new();
        let mut pending = VecDeque::new();

        for (i, allocate) in ops.into_iter().enumerate() {
            if allocate {
                let request = RequestId(i as u64);
                match pool.allocate(request) {
                    Allocation::Granted(slot) => {
                        prop_assert!(held.iter().all(|&(_, s)| s != slot));
                        held.push((request, slot));
                    }
                    Allocation::Pending(grant) => pending.push_back(grant),
                    Allocation::Quiesced => prop_assert!(false, "pool is not quiesced"),
                }
            } else if !held.is_empty() {
                let (_, slot) = held.remove(0);
                match pool.release(slot).unwrap() {
                    Some(next) => {
                        let mut grant = pending.pop_front().unwrap();
                        prop_assert_eq!(grant.request(), next);
                        prop_assert_eq!(grant.try_take(), Some(SlotGrant::Granted(slot)));
                        held.push((next, slot));
                    }
                    None => prop_assert!(pending.is_empty()),
                }
            }

            for &(request, slot) in &held {
                prop_assert_eq!(pool.owner(slot).unwrap(), Some(request));
            }
        }
    }

    /// Timestamp comparison is antisymmetric and agrees with ordering.
    #[test]
    fn prop_timestamp_antisymmetry(
        a_sec in 0u64..1000, a_usec in 0u64..1_000_000,
        b_sec in 0u64..1000, b_usec in 0u64..1_000_000,
    ) {
        let a = Timestamp::new(a_sec, a_usec);
        let b = Timestamp::new(b_sec, b_usec);
        prop_assert_eq!(compare_timestamp(&a, &b), -compare_timestamp(&b, &a));
        prop_assert_eq!(compare_timestamp(&a, &b), a.cmp(&b) as i32);
    }

    /// Changing any one block checksum changes the checksum-of-checksums.
    #[test]
    fn prop_checksum_of_checksums_detects_change(
        checksums in prop::collection::vec(any::<u16>(), 1..64),
        index in any::<prop::sample::Index>(),
        flip in 1u16..=u16::MAX,
    ) {
        let original = checksum_of_checksums(checksums.iter().copied());
        let mut changed = checksums.clone();
        let i = index.index(changed.len());
        changed[i] ^= flip;
        prop_assert_ne!(original, checksum_of_checksums(changed.iter().copied()));
    }

    /// Quiesce drains every waiter once; a repeat drains nothing.
    #[test]
    fn prop_quiesce_is_idempotent(waiters in 0usize..16) {
        let pool = JournalPool::new(layout(), ControllerId::A);
        prop_assert!(pool.allocate(RequestId(0)).granted().is_some());
        prop_assert!(pool.allocate(RequestId(1)).granted().is_some());
        let mut grants: Vec<_> = (0..waiters)
            .filter_map(|i| match pool.allocate(RequestId(10 + i as u64)) {
                Allocation::Pending(grant) => Some(grant),
                _ => None,
            })
            .collect();
        prop_assert_eq!(grants.len(), waiters);

        prop_assert_eq!(pool.quiesce(), waiters);
        prop_assert_eq!(pool.quiesce(), 0);
        for grant in &mut grants {
            prop_assert_eq!(grant.try_take(), Some(SlotGrant::Quiesced));
        }
    }
}
