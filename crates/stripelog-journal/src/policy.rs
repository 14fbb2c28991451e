//! Write-logging policy.
//!
//! Decides, from the shape of a write and the RAID geometry alone, whether a
//! degraded write must go through the journal.

use std::fmt;

use metrics::counter;
use serde::Serialize;
use stripelog_core::{
    BlockCount, DeadPositions, JournalConfig, Lba, Opcode, Position, RaidGeometry, WriteAlgorithm,
};

use crate::metrics::LOGGING_SKIPPED;

/// What the policy looks at in a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteShape {
    /// Logical start of the write.
    pub start_lba: Lba,
    /// Logical length of the write.
    pub xfer_count: BlockCount,
    /// Block operation.
    pub opcode: Opcode,
    /// Parity update algorithm.
    pub algorithm: WriteAlgorithm,
    /// Positions currently unavailable.
    pub dead: DeadPositions,
    /// Parity position of the stripe. On RAID-6 the second parity follows it.
    pub parity_pos: Position,
    /// First data position the write touches.
    pub start_pos: Position,
    /// Write of RAID-internal metadata rather than user data.
    pub metadata: bool,
}

impl WriteShape {
    /// A user-data `Write` with no dead positions.
    #[must_use]
    pub const fn new(start_lba: Lba, xfer_count: BlockCount, algorithm: WriteAlgorithm) -> Self {
        Self {
            start_lba,
            xfer_count,
            opcode: Opcode::Write,
            algorithm,
            dead: DeadPositions::none(),
            parity_pos: 0,
            start_pos: 0,
            metadata: false,
        }
    }

    /// Sets the opcode.
    #[must_use]
    pub const fn with_opcode(mut self, opcode: Opcode) -> Self {
        self.opcode = opcode;
        self
    }

    /// Sets the dead positions.
    #[must_use]
    pub const fn with_dead(mut self, dead: DeadPositions) -> Self {
        self.dead = dead;
        self
    }

    /// Sets the parity and first data positions.
    #[must_use]
    pub const fn with_positions(mut self, parity_pos: Position, start_pos: Position) -> Self {
        self.parity_pos = parity_pos;
        self.start_pos = start_pos;
        self
    }

    /// Marks the write as RAID metadata.
    #[must_use]
    pub const fn as_metadata(mut self) -> Self {
        self.metadata = true;
        self
    }
}

/// Why a write may skip the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// RAID metadata is regenerated rather than replayed.
    Metadata,
    /// Logging is disabled for the group.
    Disabled,
    /// No position is dead.
    NotDegraded,
    /// Stripe-aligned cached write; the cache replays it.
    CachedAligned,
    /// Stripe-aligned non-cached write; the host reissues it.
    NonCachedAligned,
    /// Stripe-aligned rekey write; the rekey monitor replays it.
    RekeyAligned,
    /// Every parity position is dead, so no parity can go stale.
    ParityDead,
    /// Only one disk is actually written.
    SingleLivePosition,
}

impl SkipReason {
    /// Metric label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Metadata => "metadata",
            Self::Disabled => "disabled",
            Self::NotDegraded => "not_degraded",
            Self::CachedAligned => "cached_aligned",
            Self::NonCachedAligned => "non_cached_aligned",
            Self::RekeyAligned => "rekey_aligned",
            Self::ParityDead => "parity_dead",
            Self::SingleLivePosition => "single_live_position",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a write must be journaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogReason {
    /// Skipping is disabled by configuration.
    SkipDisabled,
    /// Unaligned multi-region update restamps several positions.
    UnalignedMr3,
    /// Degraded write with no applicable skip rule.
    Degraded,
}

/// Outcome of the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoggingDecision {
    /// Journal the write.
    Required(LogReason),
    /// Write directly.
    Skip(SkipReason),
}

impl LoggingDecision {
    /// Returns true if the write must be journaled.
    #[must_use]
    pub const fn is_required(&self) -> bool {
        matches!(self, Self::Required(_))
    }
}

/// Policy knobs taken from the journal configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoggingPolicy {
    /// Logging enabled for the group.
    pub enabled: bool,
    /// Skip stripe-aligned non-cached writes.
    pub skip_aligned_noncached: bool,
    /// Journal every degraded write.
    pub disable_skip: bool,
}

impl Default for LoggingPolicy {
    fn default() -> Self {
        Self::from_config(&JournalConfig::default())
    }
}

impl LoggingPolicy {
    /// Policy described by a journal configuration.
    #[must_use]
    pub const fn from_config(config: &JournalConfig) -> Self {
        Self {
            enabled: config.enabled,
            skip_aligned_noncached: config.skip_aligned_noncached,
            disable_skip: config.disable_skip,
        }
    }

    /// Decides whether `shape` must be journaled. Pure.
    #[must_use]
    pub fn decide(&self, shape: &WriteShape, geometry: &RaidGeometry) -> LoggingDecision {
        use LoggingDecision::{Required, Skip};

        if shape.metadata {
            return Skip(SkipReason::Metadata);
        }
        if !self.enabled {
            return Skip(SkipReason::Disabled);
        }
        if !shape.dead.is_degraded() {
            return Skip(SkipReason::NotDegraded);
        }
        if self.disable_skip {
            return Required(LogReason::SkipDisabled);
        }

        let aligned = geometry.is_stripe_aligned(shape.start_lba, shape.xfer_count);
        match shape.opcode {
            Opcode::Write | Opcode::VerifyWrite if aligned => {
                return Skip(SkipReason::CachedAligned);
            }
            Opcode::WriteNonCached if aligned && self.skip_aligned_noncached => {
                return Skip(SkipReason::NonCachedAligned);
            }
            Opcode::RekeyWrite if aligned => return Skip(SkipReason::RekeyAligned),
            _ => {}
        }

        let dead_parity = dead_parity_count(shape, geometry);
        if dead_parity == geometry.parity_disks() {
            return Skip(SkipReason::ParityDead);
        }

        if shape.algorithm == WriteAlgorithm::Mr3 && !aligned {
            return Required(LogReason::UnalignedMr3);
        }

        if geometry.is_single_position(shape.start_lba, shape.xfer_count)
            && shape.dead.contains(shape.start_pos)
            && dead_parity + 1 == geometry.parity_disks()
        {
            return Skip(SkipReason::SingleLivePosition);
        }

        Required(LogReason::Degraded)
    }

    /// Decides and records the outcome in metrics and traces.
    pub fn evaluate(&self, shape: &WriteShape, geometry: &RaidGeometry) -> LoggingDecision {
        let decision = self.decide(shape, geometry);
        match decision {
            LoggingDecision::Skip(reason) => {
                if shape.dead.is_degraded() {
                    counter!(LOGGING_SKIPPED, "reason" => reason.as_str()).increment(1);
                }
                tracing::trace!(start_lba = shape.start_lba, %reason, "Write logging skipped");
            }
            LoggingDecision::Required(reason) => {
                tracing::trace!(start_lba = shape.start_lba, ?reason, "Write logging required");
            }
        }
        decision
    }
}

/// Returns true if a degraded write of `shape` must be journaled.
#[must_use]
pub fn needs_logging(policy: &LoggingPolicy, shape: &WriteShape, geometry: &RaidGeometry) -> bool {
    policy.decide(shape, geometry).is_required()
}

fn dead_parity_count(shape: &WriteShape, geometry: &RaidGeometry) -> usize {
    let mut count = usize::from(shape.dead.contains(shape.parity_pos));
    if geometry.parity_disks() == 2 {
        let second = (shape.parity_pos + 1) % geometry.width();
        count += usize::from(shape.dead.contains(second));
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r5() -> RaidGeometry {
        RaidGeometry::new(5, 1, 128, 1).unwrap()
    }

    fn r6() -> RaidGeometry {
        RaidGeometry::new(6, 2, 128, 1).unwrap()
    }

    fn unaligned(algorithm: WriteAlgorithm) -> WriteShape {
        WriteShape::new(10, 300, algorithm).with_dead(DeadPositions::one(2)).with_positions(4, 0)
    }

    #[test]
    fn test_short_circuits() {
        let policy = LoggingPolicy::default();
        let shape = unaligned(WriteAlgorithm::Mr3);

        assert_eq!(policy.decide(&shape.as_metadata(), &r5()), LoggingDecision::Skip(SkipReason::Metadata));
        let disabled = LoggingPolicy { enabled: false, ..policy };
        assert_eq!(disabled.decide(&shape, &r5()), LoggingDecision::Skip(SkipReason::Disabled));
        let healthy = shape.with_dead(DeadPositions::none());
        assert_eq!(policy.decide(&healthy, &r5()), LoggingDecision::Skip(SkipReason::NotDegraded));
    }

    #[test]
    fn test_aligned_non_degraded_write_skips() {
        let shape = WriteShape::new(0, 512, WriteAlgorithm::Rcw);
        assert!(!needs_logging(&LoggingPolicy::default(), &shape, &r5()));
    }

    #[test]
    fn test_unaligned_mr3_logs_regardless_of_caching() {
        let policy = LoggingPolicy::default();
        for opcode in [Opcode::Write, Opcode::WriteNonCached, Opcode::VerifyWrite] {
            let shape = unaligned(WriteAlgorithm::Mr3).with_opcode(opcode);
            assert_eq!(policy.decide(&shape, &r5()), LoggingDecision::Required(LogReason::UnalignedMr3));
        }
    }

    #[test]
    fn test_aligned_skip_rules() {
        let policy = LoggingPolicy::default();
        let aligned = WriteShape::new(512, 1024, WriteAlgorithm::Rcw)
            .with_dead(DeadPositions::one(1))
            .with_positions(4, 0);

        assert_eq!(policy.decide(&aligned, &r5()), LoggingDecision::Skip(SkipReason::CachedAligned));
        assert_eq!(
            policy.decide(&aligned.with_opcode(Opcode::VerifyWrite), &r5()),
            LoggingDecision::Skip(SkipReason::CachedAligned)
        );
        assert_eq!(
            policy.decide(&aligned.with_opcode(Opcode::WriteNonCached), &r5()),
            LoggingDecision::Skip(SkipReason::NonCachedAligned)
        );
        assert_eq!(
            policy.decide(&aligned.with_opcode(Opcode::RekeyWrite), &r5()),
            LoggingDecision::Skip(SkipReason::RekeyAligned)
        );
        assert!(policy.decide(&aligned.with_opcode(Opcode::Zero), &r5()).is_required());
    }

    #[test]
    fn test_noncached_skip_is_configurable() {
        let policy = LoggingPolicy { skip_aligned_noncached: false, ..LoggingPolicy::default() };
        let shape = WriteShape::new(0, 512, WriteAlgorithm::Rcw)
            .with_opcode(Opcode::WriteNonCached)
            .with_dead(DeadPositions::one(1))
            .with_positions(4, 0);
        assert!(needs_logging(&policy, &shape, &r5()));
    }

    #[test]
    fn test_disable_skip_forces_logging() {
        let policy = LoggingPolicy { disable_skip: true, ..LoggingPolicy::default() };
        let shape =
            WriteShape::new(0, 512, WriteAlgorithm::Rcw).with_dead(DeadPositions::one(1));
        assert_eq!(policy.decide(&shape, &r5()), LoggingDecision::Required(LogReason::SkipDisabled));
    }

    #[test]
    fn test_all_parity_dead_skips() {
        let policy = LoggingPolicy::default();
        let r5_shape = unaligned(WriteAlgorithm::Mr3).with_dead(DeadPositions::one(4));
        assert_eq!(policy.decide(&r5_shape, &r5()), LoggingDecision::Skip(SkipReason::ParityDead));

        // RAID-6 second parity wraps to position 0.
        let r6_shape = unaligned(WriteAlgorithm::Mr3)
            .with_dead(DeadPositions::two(5, 0))
            .with_positions(5, 1);
        assert_eq!(policy.decide(&r6_shape, &r6()), LoggingDecision::Skip(SkipReason::ParityDead));

        let one_parity = r6_shape.with_dead(DeadPositions::one(5));
        assert!(policy.decide(&one_parity, &r6()).is_required());
    }

    #[test]
    fn test_single_live_position_skips() {
        let policy = LoggingPolicy::default();
        // R5: the one data position written is dead, only parity is updated.
        let shape = WriteShape::new(130, 10, WriteAlgorithm::Small468)
            .with_dead(DeadPositions::one(1))
            .with_positions(4, 1);
        assert_eq!(policy.decide(&shape, &r5()), LoggingDecision::Skip(SkipReason::SingleLivePosition));

        // R6 with one parity already gone behaves the same way.
        let r6_shape = shape.with_dead(DeadPositions::two(1, 4)).with_positions(4, 1);
        assert_eq!(
            policy.decide(&r6_shape, &r6()),
            LoggingDecision::Skip(SkipReason::SingleLivePosition)
        );

        // A live data position is really written.
        let live = shape.with_dead(DeadPositions::one(2));
        assert_eq!(policy.decide(&live, &r5()), LoggingDecision::Required(LogReason::Degraded));
    }

    #[test]
    fn test_decide_is_deterministic() {
        let policy = LoggingPolicy::default();
        let shape = unaligned(WriteAlgorithm::Rcw);
        let first = policy.decide(&shape, &r5());
        for _ in 0..10 {
            assert_eq!(policy.decide(&shape, &r5()), first);
        }
        assert_eq!(policy.evaluate(&shape, &r5()), first);
    }
}
