//! Journal slot pool.
//!
//! The pool owns every slot of the journal region for the lifetime of the
//! RAID group. Each controller allocates from its own half of the slots;
//! recovery may walk the other half when the peer is unreachable.
//!
//! Requests that find their half exhausted are parked on a FIFO queue and
//! resumed by [`JournalPool::release`]. A parked request holds a
//! [`PendingGrant`]; the releasing side hands the slot over through it and
//! the waiting task is woken on its own executor.

use std::collections::VecDeque;
use std::ops::Range;

use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::Serialize;
use stripelog_core::{BlockCount, ControllerId, Lba};
use tokio::sync::oneshot;

use crate::error::{JournalError, Result};
use crate::layout::SlotLayout;
use crate::metrics::{integrity_error, QUIESCE_DRAINED, SLOTS_ALLOCATED, SLOTS_IN_USE, SLOT_WAITS};
use crate::request::RequestId;

/// Index of a journal slot.
pub type SlotId = usize;

/// Allocation state of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    /// Available for allocation.
    Free,
    /// Held by a write request.
    Allocated,
    /// Being flushed by recovery.
    Flushing,
    /// Waiting for recovery to validate and flush it.
    AllocatedForFlush,
    /// Waiting for a remap check.
    AllocatedForRemap,
    /// Being remapped by recovery.
    Remapping,
}

impl SlotState {
    /// Returns true while a single request owns the slot.
    #[must_use]
    pub const fn is_owned(&self) -> bool {
        matches!(self, Self::Allocated | Self::Flushing)
    }
}

/// How a slot was last invalidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidateReason {
    /// The slot was flushed or discarded cleanly.
    #[default]
    Success,
    /// A flush write hit a media error; the slot needs a remap check.
    NeedsRemap,
}

/// Outcome of a wait for a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotGrant {
    /// The slot now belongs to the request.
    Granted(SlotId),
    /// The wait was drained. The request should go idle and ask again later.
    Quiesced,
}

/// Outcome of [`JournalPool::allocate`].
#[derive(Debug)]
pub enum Allocation {
    /// A free slot was found and bound to the request.
    Granted(SlotId),
    /// The request was queued; the grant arrives through the handle.
    Pending(PendingGrant),
    /// The pool is quiesced. The request must not journal now and was not queued.
    Quiesced,
}

impl Allocation {
    /// Returns the slot if it was granted immediately.
    #[must_use]
    pub fn granted(&self) -> Option<SlotId> {
        match self {
            Self::Granted(slot) => Some(*slot),
            _ => None,
        }
    }
}

/// Handle of a request parked on the wait queue.
#[derive(Debug)]
pub struct PendingGrant {
    request: RequestId,
    rx: oneshot::Receiver<SlotGrant>,
}

impl PendingGrant {
    /// The parked request.
    #[must_use]
    pub const fn request(&self) -> RequestId {
        self.request
    }

    /// Waits until the request is granted a slot or drained.
    ///
    /// A pool torn down underneath the waiter counts as a drain.
    pub async fn wait(self) -> SlotGrant {
        self.rx.await.unwrap_or(SlotGrant::Quiesced)
    }

    /// Returns the outcome if it has already been decided.
    pub fn try_take(&mut self) -> Option<SlotGrant> {
        match self.rx.try_recv() {
            Ok(grant) => Some(grant),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(SlotGrant::Quiesced),
        }
    }
}

/// State and invalidate reason of one slot, as reported by [`JournalPool::info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlotInfo {
    /// Allocation state.
    pub state: SlotState,
    /// Last invalidate reason.
    pub invalidate_reason: InvalidateReason,
}

/// Snapshot of the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JournalInfo {
    /// First block of the journal region.
    pub start_lba: Lba,
    /// Blocks per slot.
    pub slot_size: BlockCount,
    /// Number of slots.
    pub slot_count: usize,
    /// Header blocks per slot.
    pub header_blocks: BlockCount,
    /// True if no request is waiting for a slot.
    pub queue_empty: bool,
    /// Quiesce flag.
    pub quiesced: bool,
    /// Pool-wide remap flag.
    pub needs_remap: bool,
    /// Every slot, by index.
    pub slots: Vec<SlotInfo>,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    state: SlotState,
    reason: InvalidateReason,
    owner: Option<RequestId>,
}

impl Slot {
    const FREE: Self = Self { state: SlotState::Free, reason: InvalidateReason::Success, owner: None };
}

#[derive(Debug)]
struct Waiter {
    request: RequestId,
    tx: oneshot::Sender<SlotGrant>,
}

#[derive(Debug)]
struct PoolInner {
    slots: Vec<Slot>,
    waiters: VecDeque<Waiter>,
    quiesced: bool,
    needs_remap: bool,
}

impl PoolInner {
    fn slot(&self, slot: SlotId) -> Result<&Slot> {
        self.slots.get(slot).ok_or_else(|| {
            integrity_error(JournalError::SlotOutOfRange { slot, slot_count: self.slots.len() })
        })
    }

    fn slot_mut(&mut self, slot: SlotId) -> Result<&mut Slot> {
        let slot_count = self.slots.len();
        self.slots
            .get_mut(slot)
            .ok_or_else(|| integrity_error(JournalError::SlotOutOfRange { slot, slot_count }))
    }

    fn mark_range(&mut self, range: Range<SlotId>, state: SlotState) {
        for slot in &mut self.slots[range] {
            slot.state = state;
            slot.owner = None;
        }
    }

    /// Hands `slot` to the first waiter still listening, or frees it.
    fn hand_off(&mut self, slot: SlotId) -> Option<RequestId> {
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.tx.send(SlotGrant::Granted(slot)).is_ok() {
                self.slots[slot] = Slot {
                    state: SlotState::Allocated,
                    reason: InvalidateReason::Success,
                    owner: Some(waiter.request),
                };
                counter!(SLOTS_ALLOCATED).increment(1);
                return Some(waiter.request);
            }
            tracing::debug!(slot, request = %waiter.request, "Slot waiter went away, skipping");
        }
        self.slots[slot] = Slot::FREE;
        None
    }

    /// Drains every waiter as quiesced.
    fn drain(&mut self) -> usize {
        let drained = self.waiters.len();
        for waiter in self.waiters.drain(..) {
            // A waiter that went away needs no wakeup.
            let _ = waiter.tx.send(SlotGrant::Quiesced);
        }
        if drained > 0 {
            counter!(QUIESCE_DRAINED).increment(drained as u64);
        }
        drained
    }

    fn publish_in_use(&self) {
        let in_use = self.slots.iter().filter(|s| s.state == SlotState::Allocated).count();
        gauge!(SLOTS_IN_USE).set(in_use as f64);
    }
}

/// The journal slot pool of one RAID group.
#[derive(Debug)]
pub struct JournalPool {
    layout: SlotLayout,
    controller: ControllerId,
    inner: Mutex<PoolInner>,
}

impl JournalPool {
    /// Creates a pool with every slot free.
    #[must_use]
    pub fn new(layout: SlotLayout, controller: ControllerId) -> Self {
        let inner = PoolInner {
            slots: vec![Slot::FREE; layout.slot_count()],
            waiters: VecDeque::new(),
            quiesced: false,
            needs_remap: false,
        };
        tracing::info!(
            slot_count = layout.slot_count(),
            slot_size = layout.slot_size(),
            start_lba = layout.start_lba(),
            %controller,
            "Journal pool initialized"
        );
        Self { layout, controller, inner: Mutex::new(inner) }
    }

    /// Slot placement.
    #[must_use]
    pub const fn layout(&self) -> &SlotLayout {
        &self.layout
    }

    /// The local controller.
    #[must_use]
    pub const fn controller(&self) -> ControllerId {
        self.controller
    }

    /// Grants the first free slot of the local half to `request`, or queues it.
    pub fn allocate(&self, request: RequestId) -> Allocation {
        let mut inner = self.inner.lock();
        if inner.quiesced {
            tracing::debug!(%request, "Journal quiesced, not allocating");
            return Allocation::Quiesced;
        }

        let free = self
            .layout
            .half(self.controller)
            .find(|&slot| inner.slots[slot].state == SlotState::Free);
        if let Some(slot) = free {
            inner.slots[slot] = Slot {
                state: SlotState::Allocated,
                reason: InvalidateReason::Success,
                owner: Some(request),
            };
            inner.publish_in_use();
            counter!(SLOTS_ALLOCATED).increment(1);
            tracing::trace!(slot, %request, "Journal slot allocated");
            return Allocation::Granted(slot);
        }

        let (tx, rx) = oneshot::channel();
        inner.waiters.push_back(Waiter { request, tx });
        counter!(SLOT_WAITS).increment(1);
        tracing::debug!(%request, waiting = inner.waiters.len(), "No free journal slot, queued");
        Allocation::Pending(PendingGrant { request, rx })
    }

    /// Releases a slot held by a write or flush.
    ///
    /// The slot passes straight to the oldest waiter if there is one.
    /// Returns the request that received it.
    ///
    /// # Errors
    ///
    /// Returns an error if the slot is out of range or not allocated.
    pub fn release(&self, slot: SlotId) -> Result<Option<RequestId>> {
        let mut inner = self.inner.lock();
        let state = inner.slot(slot)?.state;
        if !state.is_owned() {
            tracing::error!(slot, ?state, "Release of a slot that is not allocated");
            return Err(integrity_error(JournalError::SlotNotAllocated { slot, state }));
        }

        let next = inner.hand_off(slot);
        inner.publish_in_use();
        match next {
            Some(request) => tracing::trace!(slot, %request, "Journal slot handed to waiter"),
            None => tracing::trace!(slot, "Journal slot freed"),
        }
        Ok(next)
    }

    /// Stops granting slots and drains the wait queue. Returns the number of
    /// requests drained; a second call drains nothing.
    pub fn quiesce(&self) -> usize {
        let mut inner = self.inner.lock();
        if inner.quiesced {
            return 0;
        }
        inner.quiesced = true;
        let drained = inner.drain();
        tracing::info!(drained, "Journal quiesced");
        drained
    }

    /// Resumes granting slots.
    pub fn unquiesce(&self) {
        self.inner.lock().quiesced = false;
        tracing::info!("Journal unquiesced");
    }

    /// Drains the wait queue without changing the quiesce flag.
    pub fn abort(&self) -> usize {
        let drained = self.inner.lock().drain();
        tracing::info!(drained, "Journal waiters aborted");
        drained
    }

    /// Returns true while quiesced.
    #[must_use]
    pub fn is_quiesced(&self) -> bool {
        self.inner.lock().quiesced
    }

    /// Number of parked requests.
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    /// State of `slot`.
    ///
    /// # Errors
    ///
    /// Returns an error if the slot is out of range.
    pub fn slot_state(&self, slot: SlotId) -> Result<SlotState> {
        Ok(self.inner.lock().slot(slot)?.state)
    }

    /// Request currently owning `slot`.
    ///
    /// # Errors
    ///
    /// Returns an error if the slot is out of range.
    pub fn owner(&self, slot: SlotId) -> Result<Option<RequestId>> {
        Ok(self.inner.lock().slot(slot)?.owner)
    }

    /// Records how the slot is being invalidated.
    ///
    /// # Errors
    ///
    /// Returns an error if the slot is out of range or not allocated.
    pub fn set_invalidate_state(&self, slot: SlotId, reason: InvalidateReason) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner.slot_mut(slot)?;
        if !entry.state.is_owned() {
            let state = entry.state;
            tracing::error!(slot, ?state, "Invalidate state set on a slot that is not allocated");
            return Err(integrity_error(JournalError::SlotNotAllocated { slot, state }));
        }
        entry.reason = reason;
        Ok(())
    }

    /// How the slot is being invalidated.
    ///
    /// # Errors
    ///
    /// Returns an error if the slot is out of range or not allocated.
    pub fn invalidate_state(&self, slot: SlotId) -> Result<InvalidateReason> {
        let inner = self.inner.lock();
        let entry = inner.slot(slot)?;
        if !entry.state.is_owned() {
            return Err(integrity_error(JournalError::SlotNotAllocated { slot, state: entry.state }));
        }
        Ok(entry.reason)
    }

    /// Marks slots for recovery.
    ///
    /// With `both_halves` every slot is marked, the queue is reset and the
    /// quiesce flag cleared; this is the activation path. Otherwise only the
    /// peer's half is marked, for a peer that became unreachable.
    ///
    /// Resetting the queue completes every queued waiter with
    /// [`SlotGrant::Quiesced`] instead of dropping it silently.
    pub fn mark_all_for_flush(&self, both_halves: bool) {
        let mut inner = self.inner.lock();
        let range = if both_halves {
            self.layout.all()
        } else {
            self.layout.half(self.controller.peer())
        };
        let marked = range.len();
        inner.mark_range(range, SlotState::AllocatedForFlush);
        if both_halves {
            inner.drain();
            inner.quiesced = false;
        }
        inner.publish_in_use();
        tracing::info!(marked, both_halves, "Journal slots marked for flush");
    }

    /// Frees the local half, or every slot plus the queue and quiesce flag.
    pub fn mark_all_free(&self, both_halves: bool) {
        let mut inner = self.inner.lock();
        let range =
            if both_halves { self.layout.all() } else { self.layout.half(self.controller) };
        for slot in &mut inner.slots[range] {
            *slot = Slot::FREE;
        }
        if both_halves {
            inner.drain();
            inner.quiesced = false;
        }
        inner.publish_in_use();
    }

    /// Marks one slot for flushing.
    ///
    /// # Errors
    ///
    /// Returns an error if the slot is out of range.
    pub fn mark_for_flush(&self, slot: SlotId) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner.slot_mut(slot)?;
        entry.state = SlotState::AllocatedForFlush;
        entry.owner = None;
        Ok(())
    }

    /// Marks one slot for a remap check.
    ///
    /// # Errors
    ///
    /// Returns an error if the slot is out of range.
    pub fn mark_for_remap(&self, slot: SlotId) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner.slot_mut(slot)?;
        entry.state = SlotState::AllocatedForRemap;
        entry.owner = None;
        Ok(())
    }

    /// Raises the pool-wide remap flag.
    pub fn set_needs_remap(&self) {
        self.inner.lock().needs_remap = true;
        tracing::warn!("Journal needs remap");
    }

    /// Returns the pool-wide remap flag.
    #[must_use]
    pub fn needs_remap(&self) -> bool {
        self.inner.lock().needs_remap
    }

    /// Takes the next slot waiting for a flush and marks it `Flushing`.
    pub fn next_for_flush(&self) -> Option<SlotId> {
        let mut inner = self.inner.lock();
        let slot = inner.slots.iter().position(|s| s.state == SlotState::AllocatedForFlush)?;
        inner.slots[slot].state = SlotState::Flushing;
        tracing::debug!(slot, "Journal slot selected for flush");
        Some(slot)
    }

    /// Takes the next slot waiting for a remap check and marks it `Remapping`.
    ///
    /// A raised remap flag is first turned into a bulk marking of the local
    /// half (or every slot) and cleared.
    pub fn next_for_remap(&self, both_halves: bool) -> Option<SlotId> {
        let mut inner = self.inner.lock();
        let range =
            if both_halves { self.layout.all() } else { self.layout.half(self.controller) };

        if inner.needs_remap {
            for slot in &mut inner.slots[range.clone()] {
                slot.state = SlotState::AllocatedForRemap;
                slot.reason = InvalidateReason::Success;
                slot.owner = None;
            }
            inner.needs_remap = false;
            tracing::info!(slots = range.len(), "Journal slots marked for remap");
        }

        let slot = range.clone().find(|&s| inner.slots[s].state == SlotState::AllocatedForRemap)?;
        inner.slots[slot].state = SlotState::Remapping;
        Some(slot)
    }

    /// Releases a slot after its remap check.
    ///
    /// # Errors
    ///
    /// Returns an error if the slot is out of range or not being remapped.
    pub fn release_remap_slot(&self, slot: SlotId) -> Result<Option<RequestId>> {
        let mut inner = self.inner.lock();
        let state = inner.slot(slot)?.state;
        if !matches!(state, SlotState::Remapping | SlotState::AllocatedForRemap) {
            tracing::error!(slot, ?state, "Remap release of a slot that is not being remapped");
            return Err(integrity_error(JournalError::SlotNotAllocated { slot, state }));
        }
        let next = inner.hand_off(slot);
        inner.publish_in_use();
        Ok(next)
    }

    /// Snapshot of the pool.
    #[must_use]
    pub fn info(&self) -> JournalInfo {
        let inner = self.inner.lock();
        JournalInfo {
            start_lba: self.layout.start_lba(),
            slot_size: self.layout.slot_size(),
            slot_count: self.layout.slot_count(),
            header_blocks: self.layout.header_blocks(),
            queue_empty: inner.waiters.is_empty(),
            quiesced: inner.quiesced,
            needs_remap: inner.needs_remap,
            slots: inner
                .slots
                .iter()
                .map(|s| SlotInfo { state: s.state, invalidate_reason: s.reason })
                .collect(),
        }
    }

    /// Tears the pool down at RAID-group deactivation. Remaining waiters are
    /// drained and every slot is freed.
    pub fn destroy(&self) {
        let mut inner = self.inner.lock();
        let drained = inner.drain();
        for slot in &mut inner.slots {
            *slot = Slot::FREE;
        }
        inner.quiesced = false;
        inner.needs_remap = false;
        inner.publish_in_use();
        tracing::info!(drained, "Journal pool destroyed");
    }
}
