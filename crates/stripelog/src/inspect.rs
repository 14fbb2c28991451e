//! Header decoding and journal layout reports.

use std::fmt::Write as _;
use std::ops::Range;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use stripelog_core::{
    BlockCount, Config, ControllerId, Lba, BLOCK_DATA_SIZE, BLOCK_METADATA_SIZE, BLOCK_SIZE,
};
use stripelog_journal::{block_checksum, BlockMeta, HeaderBlock, SlotHeader, SlotLayout};

/// A decoded header block.
#[derive(Debug, Serialize)]
pub struct DecodedBlock {
    /// The header.
    pub header: SlotHeader,
    /// Whether the block checksum matches, if the image carries metadata.
    pub checksum_ok: Option<bool>,
    /// Whether checksum and address stamps match the given address.
    pub stamps_valid: Option<bool>,
}

/// Reads and decodes a header block image.
pub fn decode_file(path: &Path, lba: Option<Lba>) -> Result<DecodedBlock> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read header image {}", path.display()))?;
    decode_block(&bytes, lba)
}

/// Decodes a header block image of either the data area alone or a full block.
pub fn decode_block(bytes: &[u8], lba: Option<Lba>) -> Result<DecodedBlock> {
    let (data, meta) = match bytes.len() {
        BLOCK_DATA_SIZE => (bytes, None),
        BLOCK_SIZE => {
            let (data, meta) = bytes.split_at(BLOCK_DATA_SIZE);
            (data, Some(parse_meta(meta)))
        }
        len => bail!(
            "header image must be {BLOCK_DATA_SIZE} or {BLOCK_SIZE} bytes, got {len}"
        ),
    };

    let block = HeaderBlock::from_parts(data.to_vec(), meta.unwrap_or_default())?;
    let header = block.header().context("Failed to decode journal header")?;
    Ok(DecodedBlock {
        header,
        checksum_ok: meta.map(|m| m.checksum == block_checksum(block.data())),
        stamps_valid: meta.and(lba).map(|lba| block.stamps_valid(lba)),
    })
}

fn parse_meta(bytes: &[u8]) -> BlockMeta {
    debug_assert_eq!(bytes.len(), BLOCK_METADATA_SIZE);
    let field = |i: usize| u16::from_le_bytes([bytes[i], bytes[i + 1]]);
    BlockMeta { checksum: field(0), lba_stamp: field(2), write_stamp: field(4), time_stamp: field(6) }
}

/// Renders a decoded block for humans.
pub fn render_block(decoded: &DecodedBlock) -> String {
    let h = &decoded.header;
    let mut out = String::new();
    let _ = writeln!(out, "Version:        {}", h.header_version);
    let _ = writeln!(out, "State:          {:?}", h.header_state);
    let _ = writeln!(out, "Timestamp:      {}", h.timestamp);
    let _ = writeln!(out, "Start LBA:      {:#x}", h.start_lba);
    let _ = writeln!(out, "Transfer:       {} blocks", h.xfer_count);
    let _ = writeln!(out, "Parity range:   {:#x} +{}", h.parity_start, h.parity_count);
    let _ = writeln!(out, "Write bitmap:   {}", h.write_bitmap);
    for position in h.write_bitmap.iter() {
        let info = h.disk_info[position];
        let _ = writeln!(
            out,
            "  pos {position:2}: offset {:5} blocks {:4} csum {:#06x}",
            info.offset, info.block_count, h.checksum_of_checksums[position]
        );
    }
    if let Some(ok) = decoded.checksum_ok {
        let _ = writeln!(out, "Block checksum: {}", if ok { "ok" } else { "MISMATCH" });
    }
    if let Some(ok) = decoded.stamps_valid {
        let _ = writeln!(out, "Stamps:         {}", if ok { "ok" } else { "MISMATCH" });
    }
    out
}

/// The journal layout derived from a configuration.
#[derive(Debug, Serialize)]
pub struct JournalReport {
    /// RAID group.
    pub group_id: u32,
    /// Whether degraded writes are journaled.
    pub enabled: bool,
    /// Member disks.
    pub width: usize,
    /// Parity positions.
    pub parity_disks: usize,
    /// Blocks per position per stripe.
    pub element_size: BlockCount,
    /// Logical blocks per stripe.
    pub stripe_size: BlockCount,
    /// Physical I/O alignment.
    pub alignment: BlockCount,
    /// First block of the journal region.
    pub start_lba: Lba,
    /// Blocks per slot.
    pub slot_size: BlockCount,
    /// Header blocks per slot.
    pub header_blocks: BlockCount,
    /// Data blocks per slot.
    pub data_blocks: BlockCount,
    /// Slots in the journal.
    pub slot_count: usize,
    /// Slots of controller A.
    pub controller_a: Range<usize>,
    /// Slots of controller B.
    pub controller_b: Range<usize>,
    /// Whether aligned non-cached writes skip the journal.
    pub skip_aligned_noncached: bool,
    /// Whether every skip rule is disabled.
    pub disable_skip: bool,
    /// Failed header reads that raise an abandoned-flush alert.
    pub abandon_alert_threshold: u32,
}

impl JournalReport {
    /// Builds the report.
    pub fn from_config(config: &Config) -> Result<Self> {
        let geometry = config.geometry.to_geometry().context("Invalid RAID geometry")?;
        let layout = SlotLayout::from_config(&config.journal);
        Ok(Self {
            group_id: config.journal.group_id,
            enabled: config.journal.enabled,
            width: geometry.width(),
            parity_disks: geometry.parity_disks(),
            element_size: geometry.element_size(),
            stripe_size: geometry.stripe_size(),
            alignment: geometry.alignment(),
            start_lba: layout.start_lba(),
            slot_size: layout.slot_size(),
            header_blocks: layout.header_blocks(),
            data_blocks: layout.data_blocks(),
            slot_count: layout.slot_count(),
            controller_a: layout.half(ControllerId::A),
            controller_b: layout.half(ControllerId::B),
            skip_aligned_noncached: config.journal.skip_aligned_noncached,
            disable_skip: config.journal.disable_skip,
            abandon_alert_threshold: config.journal.abandon_alert_threshold,
        })
    }

    /// Renders the report for humans.
    pub fn render(&self) -> String {
        format!(
            "RAID group {group}: {width} disks, {parity} parity, element {element}, alignment {align}\n\
             Journal:        {state}\n\
             Region start:   {start:#x}\n\
             Slots:          {count} x {size} blocks ({header} header, {data} data)\n\
             Controller A:   slots {a_start}..{a_end}\n\
             Controller B:   slots {b_start}..{b_end}\n\
             Skip policy:    aligned non-cached {skip}, overrides {overrides}\n\
             Alert after:    {threshold} failed header reads\n",
            group = self.group_id,
            width = self.width,
            parity = self.parity_disks,
            element = self.element_size,
            align = self.alignment,
            state = if self.enabled { "enabled" } else { "disabled" },
            start = self.start_lba,
            count = self.slot_count,
            size = self.slot_size,
            header = self.header_blocks,
            data = self.data_blocks,
            a_start = self.controller_a.start,
            a_end = self.controller_a.end,
            b_start = self.controller_b.start,
            b_end = self.controller_b.end,
            skip = if self.skip_aligned_noncached { "skipped" } else { "journaled" },
            overrides = if self.disable_skip { "disabled" } else { "active" },
            threshold = self.abandon_alert_threshold,
        )
    }
}
