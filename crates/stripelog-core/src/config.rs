//! Configuration management for stripelog.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::geometry::RaidGeometry;
use crate::types::BlockCount;

/// Blocks per position per stripe in a default parity RAID group.
pub const DEFAULT_ELEMENT_SIZE: BlockCount = 128;

/// Blocks in one RAID chunk.
pub const DEFAULT_CHUNK_SIZE: BlockCount = 2048;

/// Size of the reserved journal region in chunks.
pub const JOURNAL_CHUNKS: BlockCount = 32;

/// Blocks reserved for the journal region on every member disk.
pub const JOURNAL_REGION_BLOCKS: BlockCount = JOURNAL_CHUNKS * DEFAULT_CHUNK_SIZE;

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Journal configuration.
    pub journal: JournalConfig,
    /// RAID group geometry.
    pub geometry: GeometryConfig,
    /// Logging configuration.
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails validation.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(Error::Io)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed or fails validation.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that the journal fits the geometry.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first inconsistency found.
    pub fn validate(&self) -> Result<()> {
        let geometry = self.geometry.to_geometry()?;
        self.journal.validate()?;

        let data_blocks = self.journal.slot_size - self.journal.header_blocks;
        if data_blocks < geometry.element_size() {
            return Err(Error::config(format!(
                "slot_size {} cannot hold an element of {} blocks after {} header blocks",
                self.journal.slot_size,
                geometry.element_size(),
                self.journal.header_blocks
            )));
        }
        Ok(())
    }
}

/// Degraded-write journal configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    /// Enable write logging for degraded writes.
    pub enabled: bool,
    /// Identifier of the RAID group, reported in journal events.
    pub group_id: u32,
    /// First physical block of the journal region on every member disk.
    pub start_lba: u64,
    /// Blocks per slot on each position, header blocks included.
    pub slot_size: BlockCount,
    /// Number of slots. The lower half belongs to controller A, the upper to B.
    pub slot_count: usize,
    /// Blocks occupied by the slot header at the start of each position's slot.
    pub header_blocks: BlockCount,
    /// Minimum number of failed header reads that raises a flush-abandoned
    /// event when no valid header generation survives.
    pub abandon_alert_threshold: u32,
    /// Skip logging for stripe-aligned non-cached writes. The host reissues
    /// them on failure, at the cost of a possible uncorrectable on replay.
    pub skip_aligned_noncached: bool,
    /// Log every degraded write, ignoring all skip rules.
    pub disable_skip: bool,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self::for_element_size(DEFAULT_ELEMENT_SIZE)
    }
}

impl JournalConfig {
    /// Sizes the journal for a given element size: one element plus one
    /// header block per slot, as many slots as fit the journal region.
    #[must_use]
    pub fn for_element_size(element_size: BlockCount) -> Self {
        let header_blocks = 1;
        let slot_size = element_size + header_blocks;
        Self {
            enabled: true,
            group_id: 0,
            start_lba: 0,
            slot_size,
            slot_count: default_slot_count(slot_size),
            header_blocks,
            abandon_alert_threshold: 2,
            skip_aligned_noncached: true,
            disable_skip: false,
        }
    }

    /// Configuration with write logging disabled.
    #[must_use]
    pub fn disabled() -> Self {
        Self { enabled: false, ..Default::default() }
    }

    /// Total blocks spanned by the journal on each position.
    #[must_use]
    pub fn journal_blocks(&self) -> BlockCount {
        self.slot_size * self.slot_count as BlockCount
    }

    /// Checks the slot layout.
    ///
    /// # Errors
    ///
    /// Returns an error if the slot count is odd or zero, or the slot has no
    /// room for data after the header.
    pub fn validate(&self) -> Result<()> {
        if self.slot_count < 2 || self.slot_count % 2 != 0 {
            return Err(Error::config(format!(
                "slot_count must be a non-zero even number, got {}",
                self.slot_count
            )));
        }
        if self.header_blocks == 0 {
            return Err(Error::config("header_blocks must be at least 1"));
        }
        if self.slot_size <= self.header_blocks {
            return Err(Error::config(format!(
                "slot_size {} must exceed header_blocks {}",
                self.slot_size, self.header_blocks
            )));
        }
        if self.abandon_alert_threshold == 0 {
            return Err(Error::config("abandon_alert_threshold must be at least 1"));
        }
        Ok(())
    }
}

/// Number of slots of `slot_size` blocks that fit the journal region,
/// rounded down to an even count so both controllers get equal halves.
#[must_use]
pub fn default_slot_count(slot_size: BlockCount) -> usize {
    if slot_size == 0 {
        return 0;
    }
    let count = (JOURNAL_REGION_BLOCKS / slot_size) as usize;
    count & !1
}

/// RAID group geometry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeometryConfig {
    /// Member disks, parity included.
    pub width: usize,
    /// Parity positions per stripe (1 or 2).
    pub parity_disks: usize,
    /// Blocks per position per stripe.
    pub element_size: BlockCount,
    /// Physical I/O alignment in blocks.
    pub alignment: BlockCount,
}

impl Default for GeometryConfig {
    fn default() -> Self {
        Self { width: 5, parity_disks: 1, element_size: DEFAULT_ELEMENT_SIZE, alignment: 1 }
    }
}

impl GeometryConfig {
    /// Builds the validated geometry.
    ///
    /// # Errors
    ///
    /// Returns an error if the geometry is not a valid parity RAID layout.
    pub fn to_geometry(&self) -> Result<RaidGeometry> {
        RaidGeometry::new(self.width, self.parity_disks, self.element_size, self.alignment)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: String,
    /// Log output format.
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: LogFormat::Pretty }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable output.
    #[default]
    Pretty,
    /// JSON lines.
    Json,
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.journal.enabled);
        assert_eq!(config.journal.slot_size, 129);
        assert_eq!(config.journal.slot_count, 508);
        assert_eq!(config.journal.header_blocks, 1);
        assert_eq!(config.journal.abandon_alert_threshold, 2);
        assert!(config.journal.skip_aligned_noncached);
        assert!(!config.journal.disable_skip);
        assert_eq!(config.geometry.width, 5);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_slot_count_is_even() {
        assert_eq!(default_slot_count(129), 508);
        assert_eq!(default_slot_count(1025), 62);
        assert_eq!(default_slot_count(0), 0);
        for size in 2..600 {
            assert_eq!(default_slot_count(size) % 2, 0);
        }
    }

    #[test]
    fn test_parse_partial_config() {
        let config = Config::parse(
            r#"
            [journal]
            group_id = 7
            start_lba = 4096
            abandon_alert_threshold = 3

            [geometry]
            width = 6
            parity_disks = 2
            alignment = 8

            [logging]
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.journal.group_id, 7);
        assert_eq!(config.journal.start_lba, 4096);
        assert_eq!(config.journal.abandon_alert_threshold, 3);
        assert_eq!(config.journal.slot_count, 508);
        assert_eq!(config.geometry.parity_disks, 2);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_rejects_odd_slot_count() {
        let err = Config::parse("[journal]\nslot_count = 5\n").unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_rejects_slot_smaller_than_element() {
        let err = Config::parse("[journal]\nslot_size = 64\n").unwrap_err();
        assert!(err.to_string().contains("cannot hold an element"));
    }

    #[test]
    fn test_rejects_bad_geometry() {
        let err = Config::parse("[geometry]\nwidth = 1\n").unwrap_err();
        assert!(matches!(err, Error::InvalidGeometry(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[journal]\nenabled = false").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert!(!config.journal.enabled);
    }

    #[test]
    fn test_from_missing_file() {
        let err = Config::from_file(std::path::Path::new("/nonexistent/stripelog.toml"));
        assert!(matches!(err, Err(Error::Io(_))));
    }

    #[test]
    fn test_journal_blocks() {
        let journal = JournalConfig::default();
        assert_eq!(journal.journal_blocks(), 129 * 508);
        assert!(journal.journal_blocks() <= JOURNAL_REGION_BLOCKS);
        assert!(!JournalConfig::disabled().enabled);
    }
}
