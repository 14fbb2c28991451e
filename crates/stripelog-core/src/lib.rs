//! Core types and configuration for the stripelog degraded-write journal.
//!
//! This crate provides the building blocks shared by the journal and its tooling:
//! - Configuration management (TOML)
//! - Error types
//! - Disk positions, position bitmaps and controller identity
//! - Parity RAID group geometry

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod geometry;
pub mod types;

pub use config::{Config, GeometryConfig, JournalConfig, LogFormat, LoggingConfig};
pub use error::{Error, Result};
pub use geometry::RaidGeometry;
pub use types::{
    BlockCount, ControllerId, DeadPositions, Lba, Opcode, Position, PositionBitmap,
    WriteAlgorithm, BLOCK_DATA_SIZE, BLOCK_METADATA_SIZE, BLOCK_SIZE, MAX_WIDTH,
};
