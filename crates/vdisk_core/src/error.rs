//! Error taxonomy for the provisioning engine
//!
//! Every failure is terminal and reported to the caller unchanged; nothing
//! below this layer retries, except the device pool trying other slots.

use std::io;
use std::path::PathBuf;

use vdisk_hal::HalError;

use crate::table::{PartitionType, TableKind};

/// Result type for all vdisk operations
pub type DiskResult<T> = Result<T, DiskError>;

#[derive(Debug, thiserror::Error)]
pub enum DiskError {
    #[error("no free transport device available")]
    NoFreeDeviceAvailable,

    #[error("image {0} is connected")]
    ImageConnectedError(PathBuf),

    #[error("image {0} has mounted partitions")]
    ImageMountedError(PathBuf),

    #[error("image {0} is not connected")]
    ImageNotConnected(PathBuf),

    #[error("{0} is not mounted")]
    ImageNotMountedError(PathBuf),

    #[error("partition not found: {0}")]
    PartitionMissingError(String),

    #[error("partition type {partition_type:?} has no {kind} encoding")]
    UnsupportedPartitionType {
        partition_type: PartitionType,
        kind: TableKind,
    },

    #[error("invalid size specification '{0}'")]
    InvalidSizeSpec(String),

    #[error("requested {requested} bytes exceeds the {available} bytes available")]
    SizeExceedsExtents { requested: u64, available: u64 },

    #[error("sectors {start}..={end} overlap an existing partition or reserved region")]
    OverlappingPartition { start: u64, end: u64 },

    #[error("{tool} failed: {output}")]
    ToolExecutionFailed { tool: String, output: String },

    #[error("invalid image {path}: {reason}")]
    InvalidImage { path: PathBuf, reason: String },

    #[error("cannot resize from {current} to {requested} bytes: new size must be larger")]
    InvalidResize { current: u64, requested: u64 },

    #[error("image {0} has no partition table")]
    PartitionTableMissing(PathBuf),

    #[error("{kind} partition table is full ({max} entries)")]
    TableFull { kind: TableKind, max: usize },

    #[error("wipe verification failed at byte {offset}: expected {expected:#04x}, found {found}")]
    WipeVerificationFailed {
        offset: u64,
        expected: u8,
        found: String,
    },

    #[error("partition table codec error: {0}")]
    Codec(String),

    #[error("cannot parse image information: {0}")]
    Probe(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("device pool lock poisoned")]
    PoolPoisoned,

    #[error(transparent)]
    Hal(#[from] HalError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DiskError {
    pub fn tool_failed(tool: impl Into<String>, output: impl Into<String>) -> Self {
        DiskError::ToolExecutionFailed {
            tool: tool.into(),
            output: output.into(),
        }
    }

    pub fn invalid_image(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        DiskError::InvalidImage {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
