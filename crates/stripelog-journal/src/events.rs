//! Journal telemetry events.
//!
//! Recovery reports flushes it had to give up on. Sinks receive the events
//! synchronously from the recovery path and must not block.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use stripelog_journal::events::{EventSink, JournalEvent};
//!
//! let sink: Arc<dyn EventSink> = Arc::new(|event: JournalEvent| {
//!     eprintln!("journal event in slot {}", event.slot());
//! });
//! # let _ = sink;
//! ```

use parking_lot::Mutex;
use serde::Serialize;
use stripelog_core::{BlockCount, Lba, PositionBitmap};

use crate::header::Timestamp;
use crate::pool::SlotId;

/// Recovery pass a slot was in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushPhase {
    /// Only the headers are being read and reconciled.
    HeaderRead,
    /// Headers and data are read and the data flushed to the live stripe.
    FullFlush,
}

/// Why a flush was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbandonCause {
    /// Header reads failed and no valid header generation survived.
    FailedHeaderReads,
    /// Positions the model header requires have no valid copy.
    IncompleteWrite,
    /// Journaled data failed its checksum or address stamps on read-back.
    DataReadError,
    /// Current header copies of the slot contradict each other.
    HeaderConflict,
}

/// A journal telemetry event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JournalEvent {
    /// A slot's content was discarded instead of flushed.
    FlushAbandoned {
        /// RAID group identifier.
        group_id: u32,
        /// Positions affected.
        positions: PositionBitmap,
        /// Logical address of the original write, if known.
        start_lba: Lba,
        /// Logical length of the original write, if known.
        xfer_count: BlockCount,
        /// Recovery pass.
        phase: FlushPhase,
        /// Journal slot.
        slot: SlotId,
        /// Timestamp of the model header, if one was found.
        timestamp: Option<Timestamp>,
        /// What went wrong.
        error_info: AbandonCause,
    },
}

impl JournalEvent {
    /// Returns the RAID group of this event.
    #[must_use]
    pub fn group_id(&self) -> u32 {
        match self {
            Self::FlushAbandoned { group_id, .. } => *group_id,
        }
    }

    /// Returns the journal slot of this event.
    #[must_use]
    pub fn slot(&self) -> SlotId {
        match self {
            Self::FlushAbandoned { slot, .. } => *slot,
        }
    }

    /// Returns the affected positions.
    #[must_use]
    pub fn positions(&self) -> PositionBitmap {
        match self {
            Self::FlushAbandoned { positions, .. } => *positions,
        }
    }

    /// Returns a short description of the event type.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::FlushAbandoned { .. } => "FlushAbandoned",
        }
    }
}

/// Receiver of journal events.
pub trait EventSink: Send + Sync {
    /// Delivers one event.
    fn emit(&self, event: JournalEvent);
}

impl<F> EventSink for F
where
    F: Fn(JournalEvent) + Send + Sync,
{
    fn emit(&self, event: JournalEvent) {
        self(event);
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

impl EventSink for NoOpEventSink {
    fn emit(&self, _event: JournalEvent) {}
}

/// Logs every event at warn level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: JournalEvent) {
        match &event {
            JournalEvent::FlushAbandoned {
                group_id,
                positions,
                start_lba,
                xfer_count,
                phase,
                slot,
                timestamp,
                error_info,
            } => tracing::warn!(
                group_id,
                %positions,
                start_lba,
                xfer_count,
                ?phase,
                slot,
                timestamp = ?timestamp,
                ?error_info,
                "Journal flush abandoned"
            ),
        }
    }
}

/// Collects events, for tests and buffering.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: Mutex<Vec<JournalEvent>>,
}

impl CollectingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<JournalEvent> {
        self.events.lock().clone()
    }

    /// Clears all collected events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl EventSink for CollectingEventSink {
    fn emit(&self, event: JournalEvent) {
        self.events.lock().push(event);
    }
}
