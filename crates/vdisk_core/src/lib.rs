//! vdisk provisioning engine
//!
//! Builds virtual machine disk images from the host side: creates and
//! resizes image files, binds them to NBD devices, lays out GPT or MBR
//! partition tables, creates filesystems, mounts partitions and securely
//! wipes them.
//!
//! The engine is organised around a few collaborators:
//! - [`DevicePool`] hands out transport devices, one image per device
//! - [`Toolbox`] wraps every external program behind a `CommandRunner`
//! - [`TableCodec`] reads and writes partition tables on a device
//! - [`BlockImage`] drives the image lifecycle on top of all three

pub mod allocator;
pub mod codec;
pub mod config;
pub mod error;
pub mod filesystem;
pub mod image;
pub mod logging;
pub mod partition;
pub mod pool;
pub mod size;
pub mod table;
pub mod tools;
pub mod wipe;

pub use error::{DiskError, DiskResult};

pub use allocator::{Geometry, Placement};
pub use codec::{SfdiskCodec, TableCodec};
pub use config::{DiskConfig, ImageConfig, MkfsConfig, PoolConfig, ToolConfig};
pub use filesystem::FilesystemKind;
pub use image::{BlockImage, ImageContext, ImageState, EFI_PARTITION_NAME};
pub use logging::{LogFormat, LoggingConfig};
pub use partition::{MountPoint, Partition};
pub use pool::{DevicePool, DeviceSlot};
pub use size::SizeSpec;
pub use table::{PartitionRecord, PartitionTable, PartitionType, SectorRange, TableKind};
pub use tools::{ImageInfo, Toolbox};
pub use wipe::{WipePattern, WipePolicy, WipeTarget};

/// Load configuration from `path` (defaults if `None`), start logging and
/// build the image context for the real host.
pub fn initialize(path: Option<&std::path::Path>) -> DiskResult<(DiskConfig, ImageContext)> {
    let config = match path {
        Some(path) => DiskConfig::load(path)?,
        None => DiskConfig::default(),
    };
    logging::init(&config.logging)?;
    let context = ImageContext::from_config(&config)?;
    Ok((config, context))
}
