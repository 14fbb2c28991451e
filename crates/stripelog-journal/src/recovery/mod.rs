//! Journal recovery and flush.
//!
//! Recovery runs per slot marked for flushing:
//! 1. Read the header copy from every surviving position ([`JournalRecovery::header_read_plan`])
//! 2. Reconcile the copies into one model header ([`JournalRecovery::validate_headers`])
//! 3. Read the journaled data and check it ([`JournalRecovery::evaluate_flush_data`])
//! 4. Flush it to the live stripe ([`JournalRecovery::generate_flush_writes`])
//! 5. Invalidate every header copy ([`JournalRecovery::generate_invalidate_writes`])
//!
//! Reconciliation failures that leave no trustworthy data are not errors. They
//! resolve into a [`FlushDecision`] that discards the slot, so every slot
//! reaches a terminal state.

mod driver;
mod flush;
mod reconcile;

use std::fmt;
use std::sync::Arc;

use metrics::counter;
use serde::Serialize;
use stripelog_core::{Config, DeadPositions, Position, PositionBitmap, RaidGeometry};

pub use driver::{DataRead, RecoveryStats, SlotDevice, WriteOutcome};
pub use flush::{verify_checksums, DataReadback};

use crate::error::{JournalError, Result};
use crate::events::{AbandonCause, EventSink, FlushPhase, JournalEvent, NoOpEventSink};
use crate::header::{HeaderBlock, SlotHeader};
use crate::layout::SlotLayout;
use crate::metrics::{integrity_error, FLUSH_ABANDONED};
use crate::pool::SlotId;
use crate::request::{DriveOp, JournalRequest};

/// Failed header reads needed, without a surviving header generation, before
/// an abandoned flush is reported.
pub const DEFAULT_ALERT_THRESHOLD: u32 = 2;

/// Result of one position's header read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderRead {
    /// Disk position.
    pub position: Position,
    /// The header block, or `None` if the read failed.
    pub block: Option<HeaderBlock>,
}

impl HeaderRead {
    /// A successful read.
    #[must_use]
    pub const fn ok(position: Position, block: HeaderBlock) -> Self {
        Self { position, block: Some(block) }
    }

    /// A failed read.
    #[must_use]
    pub const fn failed(position: Position) -> Self {
        Self { position, block: None }
    }
}

/// What recovery does with a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushDecision {
    /// Every required header is valid; flush the data to the live stripe.
    Flush,
    /// Discard the slot's content and invalidate its headers.
    Invalidate,
    /// Discard the slot's content, invalidate, and report the loss.
    Abandon,
    /// A header-only pass found required headers missing; a full flush pass
    /// has to decide.
    Incomplete,
    /// The slot holds nothing to flush or invalidate.
    Clean,
}

/// Outcome of reconciling a slot's header copies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// Slot reconciled.
    pub slot: SlotId,
    /// In-memory header of every position after reconciliation. `None` for
    /// positions not read or whose read failed without regeneration.
    pub headers: Vec<Option<SlotHeader>>,
    /// The authoritative header, if a valid generation was found.
    pub model: Option<SlotHeader>,
    /// Positions holding a valid copy of the model, read or regenerated.
    pub valid_bitmap: PositionBitmap,
    /// Positions whose header read failed.
    pub failed_bitmap: PositionBitmap,
    /// Model write bitmap minus the dead positions.
    pub required_bitmap: PositionBitmap,
    /// Positions that take part in the flush.
    pub num_drive_ops: usize,
    /// At least one header copy was invalidated in memory.
    pub invalidated: bool,
    /// A header asked for a remap check, or the flush hit a media error.
    pub remap_needed: bool,
    /// Decision reached.
    pub decision: FlushDecision,
}

impl Reconciliation {
    fn new(slot: SlotId, width: usize) -> Self {
        Self {
            slot,
            headers: vec![None; width],
            model: None,
            valid_bitmap: PositionBitmap::EMPTY,
            failed_bitmap: PositionBitmap::EMPTY,
            required_bitmap: PositionBitmap::EMPTY,
            num_drive_ops: 0,
            invalidated: false,
            remap_needed: false,
            decision: FlushDecision::Clean,
        }
    }

    /// Returns true if the slot's data may be flushed.
    #[must_use]
    pub fn is_flush_authorized(&self) -> bool {
        self.decision == FlushDecision::Flush
    }

    /// Records a media error seen while flushing. The invalidated headers will
    /// carry `NeedsRemap`.
    pub fn note_media_error(&mut self) {
        self.remap_needed = true;
    }

    fn model_or_err(&self) -> Result<&SlotHeader> {
        self.model
            .as_ref()
            .ok_or_else(|| integrity_error(JournalError::MissingModelHeader { slot: self.slot }))
    }
}

/// Recovery and flush planning for one RAID group's journal.
pub struct JournalRecovery {
    layout: SlotLayout,
    geometry: RaidGeometry,
    group_id: u32,
    alert_threshold: u32,
    events: Arc<dyn EventSink>,
}

impl fmt::Debug for JournalRecovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JournalRecovery")
            .field("layout", &self.layout)
            .field("geometry", &self.geometry)
            .field("group_id", &self.group_id)
            .field("alert_threshold", &self.alert_threshold)
            .finish_non_exhaustive()
    }
}

impl JournalRecovery {
    /// Creates a recovery planner that discards events.
    #[must_use]
    pub fn new(layout: SlotLayout, geometry: RaidGeometry) -> Self {
        Self {
            layout,
            geometry,
            group_id: 0,
            alert_threshold: DEFAULT_ALERT_THRESHOLD,
            events: Arc::new(NoOpEventSink),
        }
    }

    /// Creates a recovery planner from the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured geometry is invalid.
    pub fn from_config(config: &Config, events: Arc<dyn EventSink>) -> Result<Self> {
        let geometry = config.geometry.to_geometry()?;
        Ok(Self::new(SlotLayout::from_config(&config.journal), geometry)
            .with_group_id(config.journal.group_id)
            .with_alert_threshold(config.journal.abandon_alert_threshold)
            .with_events(events))
    }

    /// Sets the RAID group reported in events.
    #[must_use]
    pub fn with_group_id(mut self, group_id: u32) -> Self {
        self.group_id = group_id;
        self
    }

    /// Sets the failed-read alert threshold.
    #[must_use]
    pub fn with_alert_threshold(mut self, threshold: u32) -> Self {
        self.alert_threshold = threshold;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Slot placement.
    #[must_use]
    pub const fn layout(&self) -> &SlotLayout {
        &self.layout
    }

    /// RAID geometry.
    #[must_use]
    pub const fn geometry(&self) -> &RaidGeometry {
        &self.geometry
    }

    /// Plans the header reads of `slot`: one read of the header blocks at the
    /// slot base on every surviving position.
    ///
    /// # Errors
    ///
    /// Returns an error if the slot is out of range.
    pub fn header_read_plan(&self, slot: SlotId, dead: DeadPositions) -> Result<Vec<DriveOp>> {
        let slot_lba = self.layout.slot_lba(slot).map_err(integrity_error)?;
        Ok((0..self.geometry.width())
            .filter(|&position| !dead.contains(position))
            .map(|position| DriveOp::read(position, slot_lba, self.layout.header_blocks()))
            .collect())
    }

    fn report_abandoned(
        &self,
        request: &JournalRequest,
        recon: &Reconciliation,
        positions: PositionBitmap,
        phase: FlushPhase,
        cause: AbandonCause,
    ) {
        let (start_lba, xfer_count, timestamp) = match &recon.model {
            Some(model) => {
                (model.start_lba, u64::from(model.xfer_count), Some(model.timestamp))
            }
            None => (request.start_lba, request.xfer_count, None),
        };
        counter!(FLUSH_ABANDONED).increment(1);
        tracing::warn!(
            slot = recon.slot,
            %positions,
            ?phase,
            ?cause,
            "Journal flush abandoned"
        );
        self.events.emit(JournalEvent::FlushAbandoned {
            group_id: self.group_id,
            positions,
            start_lba,
            xfer_count,
            phase,
            slot: recon.slot,
            timestamp,
            error_info: cause,
        });
    }
}
