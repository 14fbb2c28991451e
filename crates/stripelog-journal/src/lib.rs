//! Write-hole journal for degraded parity RAID writes.
//!
//! A stripe write that proceeds while one or two member disks are missing can
//! leave the stripe inconsistent if it is interrupted. This crate journals
//! such writes: the data and a self-describing header go to a reserved slot
//! on every surviving disk first, and only then to the live stripe. After a
//! crash the mirrored headers decide whether the slot is flushed or dropped.
//!
//! # Components
//!
//! - [`SlotHeader`]: the on-disk header and its checksums
//! - [`JournalPool`]: slot allocation with a FIFO wait queue, split between
//!   the two controllers
//! - [`LoggingPolicy`]: whether a degraded write needs the journal at all
//! - [`prepare_journal_write`] / [`restore_journal_write`]: the write path
//! - [`JournalRecovery`]: header reconciliation, flush and invalidation
//!
//! # Example
//!
//! ```
//! use stripelog_core::{ControllerId, DeadPositions, RaidGeometry};
//! use stripelog_journal::{
//!     prepare_journal_write, restore_journal_write, Allocation, JournalPool, JournalRequest,
//!     RequestId, SlotLayout, Timestamp, WriteDescriptor,
//! };
//!
//! let geometry = RaidGeometry::new(5, 1, 128, 1).unwrap();
//! let layout = SlotLayout::new(0x10000, 129, 8, 1);
//! let pool = JournalPool::new(layout, ControllerId::A);
//!
//! // Position 2 is missing, so the write is journaled.
//! let Allocation::Granted(slot) = pool.allocate(RequestId(1)) else { unreachable!() };
//! let request = JournalRequest::new(RequestId(1), 0x2000, 16, 0x800, 16)
//!     .with_dead(DeadPositions::one(2))
//!     .with_slot(slot);
//! let mut descriptors: Vec<_> =
//!     (0..5).map(|pos| WriteDescriptor::new(pos, 0x800, vec![0xA5; 16])).collect();
//!
//! let plan = prepare_journal_write(&request, &descriptors, &layout, &geometry, Timestamp::now())
//!     .unwrap();
//! plan.apply(&mut descriptors).unwrap();
//! assert_eq!(descriptors[0].lba, layout.slot_lba(slot).unwrap());
//!
//! // Once the journal write is durable, point the write back at the live stripe.
//! restore_journal_write(&request, plan.header(), &mut descriptors, &layout, &geometry).unwrap();
//! assert_eq!(descriptors[0].lba, 0x800);
//!
//! pool.release(slot).unwrap();
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod events;
pub mod metrics;

mod error;
mod header;
mod layout;
mod policy;
mod pool;
mod recovery;
mod request;
mod write;

pub use error::{JournalError, Result};
pub use events::{
    AbandonCause, CollectingEventSink, EventSink, FlushPhase, JournalEvent, NoOpEventSink,
    TracingEventSink,
};
pub use header::{
    block_checksum, checksum_of_checksums, compare_timestamp, header_region, lba_stamp, BlockMeta,
    DiskInfo, HeaderBlock, HeaderState, SlotHeader, Timestamp, BLOCK_CHECKSUM_SEED,
    CSUM_OF_CSUMS_SEED, ENCODED_HEADER_LEN, HEADER_VERSION,
};
pub use layout::SlotLayout;
pub use crate::metrics::init_journal_metrics;
pub use policy::{needs_logging, LogReason, LoggingDecision, LoggingPolicy, SkipReason, WriteShape};
pub use pool::{
    Allocation, InvalidateReason, JournalInfo, JournalPool, PendingGrant, SlotGrant, SlotId,
    SlotInfo, SlotState,
};
pub use recovery::{
    verify_checksums, DataRead, DataReadback, FlushDecision, HeaderRead, JournalRecovery,
    Reconciliation, RecoveryStats, SlotDevice, WriteOutcome, DEFAULT_ALERT_THRESHOLD,
};
pub use request::{
    DriveOp, DriveOpKind, JournalRequest, Preread, PrereadSource, RequestId, WriteDescriptor,
};
pub use write::{
    prepare_journal_write, restore_journal_write, DescriptorEdit, DescriptorTarget,
    JournalWritePlan,
};
