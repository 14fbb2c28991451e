//! Journal slot header codec.
//!
//! Every position that takes part in a journaled write stores an identical
//! copy of the slot header in the first block of its part of the slot.
//! The header is encoded field by field in little-endian order so the on-disk
//! format does not depend on in-memory layout:
//!
//! ```text
//! offset  size  field
//!      0     4  header_version
//!      4     4  header_state
//!      8     8  timestamp.sec
//!     16     8  timestamp.usec
//!     24     8  start_lba
//!     32     4  xfer_count
//!     36     8  parity_start
//!     44     4  parity_count
//!     48     2  write_bitmap
//!     50    64  disk_info[16] { offset u16, block_count u16 }
//!    114    32  checksum_of_checksums[16]
//! ```
//!
//! The rest of the header block is zero.

use std::cmp::Ordering;
use std::fmt;

use chrono::Utc;
use serde::Serialize;
use stripelog_core::{
    BlockCount, Lba, PositionBitmap, RaidGeometry, BLOCK_DATA_SIZE, MAX_WIDTH,
};

use crate::error::{JournalError, Result};
use crate::request::{JournalRequest, WriteDescriptor};

/// Current header format version.
pub const HEADER_VERSION: u32 = 1;

/// Seed folded into every checksum-of-checksums.
pub const CSUM_OF_CSUMS_SEED: u16 = 0x5EED;

/// Seed of the header block checksum.
pub const BLOCK_CHECKSUM_SEED: u32 = 0x0000_AF76;

/// Encoded length of a header record in bytes.
pub const ENCODED_HEADER_LEN: usize = 146;

/// State of a header copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderState {
    /// The slot holds no live write.
    Invalid,
    /// The slot holds a journaled write that may need flushing.
    Valid,
    /// The slot was invalidated after a flush hit a media error.
    NeedsRemap,
}

impl HeaderState {
    const fn to_raw(self) -> u32 {
        match self {
            Self::Invalid => 0,
            Self::Valid => 1,
            Self::NeedsRemap => 2,
        }
    }

    fn from_raw(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(Self::Invalid),
            1 => Ok(Self::Valid),
            2 => Ok(Self::NeedsRemap),
            other => Err(JournalError::HeaderDecode(format!("unknown header state {other}"))),
        }
    }
}

/// Wall-clock time a header was built.
///
/// Ordered by seconds, then microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize)]
pub struct Timestamp {
    /// Seconds since the Unix epoch.
    pub sec: u64,
    /// Microseconds within the second.
    pub usec: u64,
}

impl Timestamp {
    /// Creates a timestamp.
    #[must_use]
    pub const fn new(sec: u64, usec: u64) -> Self {
        Self { sec, usec }
    }

    /// Current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        let now = Utc::now();
        Self {
            sec: u64::try_from(now.timestamp()).unwrap_or(0),
            usec: u64::from(now.timestamp_subsec_micros()),
        }
    }

    /// Returns true for the all-zero timestamp of a never-written header.
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.sec == 0 && self.usec == 0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.sec, self.usec)
    }
}

/// Compares two timestamps, returning -1, 0 or 1.
#[must_use]
pub fn compare_timestamp(a: &Timestamp, b: &Timestamp) -> i32 {
    match a.cmp(b) {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    }
}

/// Where one position's data sits relative to the stripe range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct DiskInfo {
    /// Offset of the position's write from `parity_start`.
    pub offset: u16,
    /// Blocks journaled for the position.
    pub block_count: u16,
}

/// The journal slot header.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SlotHeader {
    /// Format version.
    pub header_version: u32,
    /// Header state.
    pub header_state: HeaderState,
    /// When the header was built.
    pub timestamp: Timestamp,
    /// Logical address of the original I/O.
    pub start_lba: Lba,
    /// Logical length of the original I/O.
    pub xfer_count: u32,
    /// First physical block of the aligned stripe range.
    pub parity_start: Lba,
    /// Physical blocks in the aligned stripe range.
    pub parity_count: u32,
    /// Positions that hold journaled data.
    pub write_bitmap: PositionBitmap,
    /// Per-position placement.
    pub disk_info: [DiskInfo; MAX_WIDTH],
    /// Per-position checksum-of-checksums.
    pub checksum_of_checksums: [u16; MAX_WIDTH],
}

impl Default for SlotHeader {
    /// The all-zero header of a never-written slot.
    fn default() -> Self {
        Self {
            header_version: 0,
            header_state: HeaderState::Invalid,
            timestamp: Timestamp::default(),
            start_lba: 0,
            xfer_count: 0,
            parity_start: 0,
            parity_count: 0,
            write_bitmap: PositionBitmap::EMPTY,
            disk_info: [DiskInfo::default(); MAX_WIDTH],
            checksum_of_checksums: [0; MAX_WIDTH],
        }
    }
}

impl SlotHeader {
    /// Builds the header for a journaled write.
    ///
    /// The stripe range is widened to the geometry's alignment. Every
    /// descriptor whose position is not dead is recorded in `disk_info` and
    /// `write_bitmap`; dead positions stay zeroed.
    ///
    /// # Errors
    ///
    /// Returns an error if a descriptor lies outside the RAID group or before
    /// the stripe range, or a value does not fit its header field.
    pub fn build(
        request: &JournalRequest,
        descriptors: &[WriteDescriptor],
        geometry: &RaidGeometry,
        timestamp: Timestamp,
    ) -> Result<Self> {
        let (parity_start, parity_count) =
            geometry.align_io(request.parity_start, request.parity_count);

        let mut header = Self {
            header_version: HEADER_VERSION,
            header_state: HeaderState::Valid,
            timestamp,
            start_lba: request.start_lba,
            xfer_count: narrow_u32("xfer_count", request.xfer_count)?,
            parity_start,
            parity_count: narrow_u32("parity_count", parity_count)?,
            ..Self::default()
        };

        for desc in descriptors {
            if desc.position >= geometry.width() {
                return Err(JournalError::InvalidPosition {
                    position: desc.position,
                    width: geometry.width(),
                });
            }
            if request.dead.contains(desc.position) {
                continue;
            }
            let offset = desc
                .lba
                .checked_sub(parity_start)
                .ok_or(JournalError::FieldOverflow { field: "offset", value: desc.lba })?;
            header.disk_info[desc.position] = DiskInfo {
                offset: narrow_u16("offset", offset)?,
                block_count: narrow_u16("block_count", desc.blocks)?,
            };
            header.write_bitmap.set(desc.position);
        }

        Ok(header)
    }

    /// Returns true if the header is of the current version and `Valid`.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.header_version == HEADER_VERSION && self.header_state == HeaderState::Valid
    }

    /// Marks the header invalid. Every other field is kept as an audit trail.
    pub fn set_invalid(&mut self) {
        self.header_version = HEADER_VERSION;
        self.header_state = HeaderState::Invalid;
    }

    /// Returns true if the header equals the never-written pattern.
    #[must_use]
    pub fn is_zeroed(&self) -> bool {
        *self == Self::default()
    }

    /// Blocks recorded for `position`.
    #[must_use]
    pub fn block_count(&self, position: usize) -> BlockCount {
        self.disk_info.get(position).map_or(0, |info| BlockCount::from(info.block_count))
    }

    /// Live-stripe address of `position`'s data.
    #[must_use]
    pub fn live_lba(&self, position: usize) -> Lba {
        self.parity_start + self.disk_info.get(position).map_or(0, |info| Lba::from(info.offset))
    }

    /// Encodes the header.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ENCODED_HEADER_LEN);
        buf.extend_from_slice(&self.header_version.to_le_bytes());
        buf.extend_from_slice(&self.header_state.to_raw().to_le_bytes());
        buf.extend_from_slice(&self.timestamp.sec.to_le_bytes());
        buf.extend_from_slice(&self.timestamp.usec.to_le_bytes());
        buf.extend_from_slice(&self.start_lba.to_le_bytes());
        buf.extend_from_slice(&self.xfer_count.to_le_bytes());
        buf.extend_from_slice(&self.parity_start.to_le_bytes());
        buf.extend_from_slice(&self.parity_count.to_le_bytes());
        buf.extend_from_slice(&self.write_bitmap.bits().to_le_bytes());
        for info in &self.disk_info {
            buf.extend_from_slice(&info.offset.to_le_bytes());
            buf.extend_from_slice(&info.block_count.to_le_bytes());
        }
        for csum in &self.checksum_of_checksums {
            buf.extend_from_slice(&csum.to_le_bytes());
        }
        buf
    }

    /// Decodes a header from the start of `bytes`.
    ///
    /// # Errors
    ///
    /// Returns an error if `bytes` is shorter than a header or the state
    /// field holds an unknown value.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < ENCODED_HEADER_LEN {
            return Err(JournalError::HeaderDecode(format!(
                "need {ENCODED_HEADER_LEN} bytes, got {}",
                bytes.len()
            )));
        }

        let mut reader = FieldReader { buf: bytes, pos: 0 };
        let header_version = reader.u32();
        let header_state = HeaderState::from_raw(reader.u32())?;
        let timestamp = Timestamp { sec: reader.u64(), usec: reader.u64() };
        let start_lba = reader.u64();
        let xfer_count = reader.u32();
        let parity_start = reader.u64();
        let parity_count = reader.u32();
        let write_bitmap = PositionBitmap::from_bits(reader.u16());

        let mut disk_info = [DiskInfo::default(); MAX_WIDTH];
        for info in &mut disk_info {
            info.offset = reader.u16();
            info.block_count = reader.u16();
        }
        let mut checksum_of_checksums = [0u16; MAX_WIDTH];
        for csum in &mut checksum_of_checksums {
            *csum = reader.u16();
        }

        Ok(Self {
            header_version,
            header_state,
            timestamp,
            start_lba,
            xfer_count,
            parity_start,
            parity_count,
            write_bitmap,
            disk_info,
            checksum_of_checksums,
        })
    }
}

/// Sequential little-endian reader over a buffer whose length was checked.
struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl FieldReader<'_> {
    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        bytes
    }

    fn u16(&mut self) -> u16 {
        u16::from_le_bytes(self.take())
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take())
    }

    fn u64(&mut self) -> u64 {
        u64::from_le_bytes(self.take())
    }
}

fn narrow_u16(field: &'static str, value: u64) -> Result<u16> {
    u16::try_from(value).map_err(|_| JournalError::FieldOverflow { field, value })
}

fn narrow_u32(field: &'static str, value: u64) -> Result<u32> {
    u32::try_from(value).map_err(|_| JournalError::FieldOverflow { field, value })
}

/// Folds the stored per-block checksums of one position into a single value.
#[must_use]
pub fn checksum_of_checksums<I>(block_checksums: I) -> u16
where
    I: IntoIterator<Item = u16>,
{
    block_checksums.into_iter().fold(0u16, |acc, crc| acc ^ crc) ^ CSUM_OF_CSUMS_SEED
}

/// Checksum of a block's data area.
#[must_use]
pub fn block_checksum(data: &[u8]) -> u16 {
    let mut sum = BLOCK_CHECKSUM_SEED;
    for chunk in data.chunks(4) {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        sum = (sum ^ u32::from_le_bytes(word)).rotate_left(1);
    }
    ((sum >> 16) ^ (sum & 0xffff)) as u16
}

/// Physical address stamp of a block.
#[must_use]
pub fn lba_stamp(lba: Lba) -> u16 {
    ((lba >> 48) ^ (lba >> 32) ^ (lba >> 16) ^ lba) as u16
}

/// Metadata trailing the data area of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct BlockMeta {
    /// Checksum of the data area.
    pub checksum: u16,
    /// Physical address stamp.
    pub lba_stamp: u16,
    /// Write stamp.
    pub write_stamp: u16,
    /// Time stamp.
    pub time_stamp: u16,
}

/// One header block: the encoded header padded to a full block, plus metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HeaderBlock {
    data: Vec<u8>,
    meta: BlockMeta,
}

impl HeaderBlock {
    /// An all-zero block.
    #[must_use]
    pub fn zeroed() -> Self {
        Self { data: vec![0; BLOCK_DATA_SIZE], meta: BlockMeta::default() }
    }

    /// A block holding `header`, unstamped.
    #[must_use]
    pub fn from_header(header: &SlotHeader) -> Self {
        let mut block = Self::zeroed();
        block.data[..ENCODED_HEADER_LEN].copy_from_slice(&header.encode());
        block
    }

    /// A block read back from disk.
    ///
    /// # Errors
    ///
    /// Returns an error unless `data` is exactly one block's data area.
    pub fn from_parts(data: Vec<u8>, meta: BlockMeta) -> Result<Self> {
        if data.len() != BLOCK_DATA_SIZE {
            return Err(JournalError::HeaderDecode(format!(
                "header block must be {BLOCK_DATA_SIZE} bytes, got {}",
                data.len()
            )));
        }
        Ok(Self { data, meta })
    }

    /// The block's data area.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The block's metadata.
    #[must_use]
    pub const fn meta(&self) -> BlockMeta {
        self.meta
    }

    /// Decodes the header held by the block.
    ///
    /// # Errors
    ///
    /// See [`SlotHeader::decode`].
    pub fn header(&self) -> Result<SlotHeader> {
        SlotHeader::decode(&self.data)
    }

    /// Returns true if the header area is bit-for-bit zero.
    #[must_use]
    pub fn is_zeroed(&self) -> bool {
        self.data[..ENCODED_HEADER_LEN].iter().all(|&b| b == 0)
    }

    /// Sets checksum and address stamps for a block written at `lba`.
    pub fn stamp(&mut self, lba: Lba) {
        self.meta = BlockMeta {
            checksum: block_checksum(&self.data),
            lba_stamp: lba_stamp(lba),
            write_stamp: 0,
            time_stamp: 0,
        };
    }

    /// Returns true if the stamps match a block written at `lba`.
    #[must_use]
    pub fn stamps_valid(&self, lba: Lba) -> bool {
        self.meta.checksum == block_checksum(&self.data) && self.meta.lba_stamp == lba_stamp(lba)
    }
}

/// Builds the stamped header region of one position's slot: the header in the
/// first block, zero blocks after it.
#[must_use]
pub fn header_region(header: &SlotHeader, slot_lba: Lba, header_blocks: BlockCount) -> Vec<HeaderBlock> {
    (0..header_blocks)
        .map(|i| {
            let mut block =
                if i == 0 { HeaderBlock::from_header(header) } else { HeaderBlock::zeroed() };
            block.stamp(slot_lba + i);
            block
        })
        .collect()
}
