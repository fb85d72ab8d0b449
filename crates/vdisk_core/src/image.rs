//! Block image lifecycle
//!
//! A [`BlockImage`] is one disk image file. It is probed as soon as it is
//! created or loaded, and moves through
//!
//! ```text
//! Probed -> connected (TableAbsent | TableLoaded) -> Mounted
//! ```
//!
//! Connecting binds it to a device pool slot, takes ownership of the device
//! node and reads whatever partition table is there. The partition list is
//! only live while connected; disconnecting drops it.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};
use vdisk_hal::{current_owner, owner_of, Ownership, SystemRunner};

use crate::allocator::{self, Geometry, Placement};
use crate::codec::{SfdiskCodec, TableCodec};
use crate::config::{DiskConfig, ImageConfig};
use crate::error::{DiskError, DiskResult};
use crate::filesystem::FilesystemKind;
use crate::partition::Partition;
use crate::pool::DevicePool;
use crate::size::SizeSpec;
use crate::table::{
    PartitionRecord, PartitionTable, PartitionType, SectorRange, TableKind, EFI_SYSTEM_BYTES,
    HEAD_SECTORS,
};
use crate::tools::{ImageInfo, Toolbox};
use crate::wipe::{wipe_range, WipePolicy};

/// Name of the EFI System partition created with every GPT table.
pub const EFI_PARTITION_NAME: &str = "EFI System";

/// Collaborators shared by every image in the process.
#[derive(Clone)]
pub struct ImageContext {
    pub tools: Arc<Toolbox>,
    pub pool: Arc<DevicePool>,
    pub codec: Arc<dyn TableCodec>,
    pub image: ImageConfig,
}

impl std::fmt::Debug for ImageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageContext")
            .field("tools", &self.tools)
            .field("pool", &self.pool)
            .field("image", &self.image)
            .finish()
    }
}

impl ImageContext {
    pub fn new(
        tools: Arc<Toolbox>,
        pool: Arc<DevicePool>,
        codec: Arc<dyn TableCodec>,
        image: ImageConfig,
    ) -> Self {
        Self {
            tools,
            pool,
            codec,
            image,
        }
    }

    /// Real host: system runner, discovered NBD devices, sfdisk codec.
    pub fn from_config(config: &DiskConfig) -> DiskResult<Self> {
        config.validate()?;
        let runner = match config.tools.command_timeout() {
            Some(limit) => SystemRunner::with_timeout(limit),
            None => SystemRunner::new(),
        };
        let tools = Arc::new(Toolbox::new(
            Arc::new(runner),
            config.tools.clone(),
            config.image.format.clone(),
        ));
        let missing = tools.missing_tools();
        if !missing.is_empty() {
            warn!(?missing, "some configured tools are not on PATH");
        }
        let pool = Arc::new(DevicePool::discover(tools.clone(), &config.pool)?);
        let codec = Arc::new(SfdiskCodec::new(tools.clone()));
        Ok(Self::new(tools, pool, codec, config.image.clone()))
    }
}

/// Where an image is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageState {
    Probed,
    TableAbsent,
    TableLoaded,
    Mounted,
}

#[derive(Debug)]
struct Connection {
    device: PathBuf,
    handle: File,
    prior_owner: Ownership,
}

#[derive(Debug)]
pub struct BlockImage {
    ctx: ImageContext,
    path: PathBuf,
    info: ImageInfo,
    connection: Option<Connection>,
    table: Option<PartitionTable>,
    table_dirty: bool,
    partitions: Vec<Partition>,
}

impl BlockImage {
    /// Create a new image file of `size_bytes` and probe it.
    pub fn create<P: AsRef<Path>>(ctx: &ImageContext, path: P, size_bytes: u64) -> DiskResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Err(DiskError::invalid_image(path, "already exists"));
        }
        if size_bytes == 0 {
            return Err(DiskError::invalid_image(path, "size must be non-zero"));
        }
        ctx.tools.image_create(path, size_bytes)?;
        info!(path = %path.display(), size_bytes, "created image");
        Self::probed(ctx, path)
    }

    /// Open an existing image file (or raw block device) and probe it.
    pub fn load<P: AsRef<Path>>(ctx: &ImageContext, path: P) -> DiskResult<Self> {
        let path = path.as_ref();
        let metadata = match fs::metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DiskError::invalid_image(path, "does not exist"));
            }
            Err(e) => return Err(e.into()),
        };
        if metadata.is_dir() {
            return Err(DiskError::invalid_image(path, "is a directory"));
        }
        if !metadata.is_file() && !is_block_device(&metadata) {
            return Err(DiskError::invalid_image(
                path,
                "not a regular file or block device",
            ));
        }
        Self::probed(ctx, path)
    }

    fn probed(ctx: &ImageContext, path: &Path) -> DiskResult<Self> {
        let info = ctx.tools.image_info(path)?;
        debug!(path = %path.display(), ?info, "probed image");
        Ok(Self {
            ctx: ctx.clone(),
            path: path.to_path_buf(),
            info,
            connection: None,
            table: None,
            table_dirty: false,
            partitions: Vec::new(),
        })
    }

    /// Re-read format metadata.
    pub fn probe(&mut self) -> DiskResult<()> {
        self.info = self.ctx.tools.image_info(&self.path)?;
        debug!(path = %self.path.display(), info = ?self.info, "probed image");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self) -> ImageInfo {
        self.info
    }

    pub fn virtual_size(&self) -> u64 {
        self.info.virtual_size
    }

    pub fn actual_size(&self) -> u64 {
        self.info.actual_size
    }

    pub fn cluster_size(&self) -> u64 {
        self.info.cluster_size
    }

    /// The image format's own dirty flag (unclean shutdown), not the table's.
    pub fn is_dirty(&self) -> bool {
        self.info.dirty
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn device_path(&self) -> Option<&Path> {
        self.connection.as_ref().map(|c| c.device.as_path())
    }

    pub fn table(&self) -> Option<&PartitionTable> {
        self.table.as_ref()
    }

    pub fn table_kind(&self) -> Option<TableKind> {
        self.table.as_ref().map(|t| t.kind)
    }

    /// A table of either kind has been read or written.
    pub fn is_initialized(&self) -> bool {
        self.table.is_some()
    }

    pub fn is_table_dirty(&self) -> bool {
        self.table_dirty
    }

    pub fn is_mounted(&self) -> bool {
        self.partitions.iter().any(Partition::is_mounted)
    }

    /// First active mount point of any partition.
    pub fn mount_point(&self) -> Option<&Path> {
        self.partitions
            .iter()
            .flat_map(|p| p.mounts())
            .find(|m| m.mounted)
            .map(|m| m.path.as_path())
    }

    pub fn state(&self) -> ImageState {
        if !self.is_connected() {
            ImageState::Probed
        } else if self.is_mounted() {
            ImageState::Mounted
        } else if self.table.is_some() {
            ImageState::TableLoaded
        } else {
            ImageState::TableAbsent
        }
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn partition(&self, index: usize) -> DiskResult<&Partition> {
        self.partitions
            .get(index)
            .ok_or_else(|| DiskError::PartitionMissingError(format!("index {index}")))
    }

    pub fn partition_mut(&mut self, index: usize) -> DiskResult<&mut Partition> {
        self.partitions
            .get_mut(index)
            .ok_or_else(|| DiskError::PartitionMissingError(format!("index {index}")))
    }

    pub fn partition_by_name(&self, name: &str) -> DiskResult<&Partition> {
        self.partitions
            .iter()
            .find(|p| p.name() == name)
            .ok_or_else(|| DiskError::PartitionMissingError(format!("name '{name}'")))
    }

    pub fn partition_by_name_mut(&mut self, name: &str) -> DiskResult<&mut Partition> {
        self.partitions
            .iter_mut()
            .find(|p| p.name() == name)
            .ok_or_else(|| DiskError::PartitionMissingError(format!("name '{name}'")))
    }

    fn require_connected(&self) -> DiskResult<&Connection> {
        self.connection
            .as_ref()
            .ok_or_else(|| DiskError::ImageNotConnected(self.path.clone()))
    }

    fn require_unmounted(&self) -> DiskResult<()> {
        if self.is_mounted() {
            return Err(DiskError::ImageMountedError(self.path.clone()));
        }
        Ok(())
    }

    fn require_table(&self) -> DiskResult<&PartitionTable> {
        self.table
            .as_ref()
            .ok_or_else(|| DiskError::PartitionTableMissing(self.path.clone()))
    }

    fn sector_size(&self) -> u64 {
        self.table
            .as_ref()
            .map(|t| t.logical_sector_size)
            .unwrap_or(self.ctx.image.logical_sector_size)
    }

    /// Disk shape the allocator works against.
    pub fn geometry(&self) -> DiskResult<Geometry> {
        let table = self.require_table()?;
        let block_size = if self.info.cluster_size > 0 {
            self.info.cluster_size
        } else {
            table.logical_sector_size
        };
        Ok(Geometry {
            kind: table.kind,
            sector_size: table.logical_sector_size,
            virtual_size: self.info.virtual_size,
            block_size,
        })
    }

    /// Bind to a device, take ownership of it and read its table. A device
    /// without a recognisable table is not an error.
    pub fn connect(&mut self) -> DiskResult<()> {
        if self.is_connected() {
            return Ok(());
        }

        let device = self.ctx.pool.connect(&self.path)?;
        let connection = match self.take_device(&device) {
            Ok(c) => c,
            Err(e) => {
                if let Err(release) = self.ctx.pool.disconnect(&device) {
                    warn!(device = %device.display(), error = %release, "could not release device");
                }
                return Err(e);
            }
        };
        self.connection = Some(connection);
        info!(path = %self.path.display(), device = %device.display(), "connected");

        self.table = self.ctx.codec.read(
            &device,
            self.ctx.image.logical_sector_size,
            self.ctx.image.physical_sector_size,
        )?;
        self.table_dirty = false;
        self.reload_partitions();
        Ok(())
    }

    fn take_device(&self, device: &Path) -> DiskResult<Connection> {
        let prior_owner = owner_of(device)?;
        let me = current_owner()?;
        if prior_owner != me {
            self.ctx.tools.chown(device, me, false)?;
        }
        let handle = OpenOptions::new().read(true).write(true).open(device)?;
        Ok(Connection {
            device: device.to_path_buf(),
            handle,
            prior_owner,
        })
    }

    fn reload_partitions(&mut self) {
        let sector_size = self.sector_size();
        let device = self.connection.as_ref().map(|c| c.device.clone());
        let records = self
            .table
            .as_ref()
            .map(|t| t.records.clone())
            .unwrap_or_default();

        self.partitions = records
            .into_iter()
            .enumerate()
            .map(|(index, record)| {
                let mut partition = Partition::new(index, record, sector_size, self.ctx.tools.clone());
                if let Some(device) = &device {
                    partition.attach(device);
                }
                partition
            })
            .collect();
        debug!(path = %self.path.display(), count = self.partitions.len(), "loaded partitions");
    }

    /// Close the device, hand it back to its previous owner and free the slot.
    /// If the device cannot be released the image stays connected.
    pub fn disconnect(&mut self) -> DiskResult<()> {
        let connection = self.require_connected()?;
        let device = connection.device.clone();
        let prior_owner = connection.prior_owner;
        self.require_unmounted()?;

        if let Some(connection) = &self.connection {
            if let Err(e) = connection.handle.sync_all() {
                warn!(device = %device.display(), error = %e, "flush before disconnect failed");
            }
        }
        self.ctx.pool.disconnect(&device)?;

        if self.table_dirty {
            warn!(path = %self.path.display(), "discarding unwritten partition changes");
        }
        self.connection = None;
        self.table = None;
        self.table_dirty = false;
        self.partitions.clear();
        info!(path = %self.path.display(), device = %device.display(), "disconnected");

        match current_owner() {
            Ok(me) if me == prior_owner => Ok(()),
            _ => self.ctx.tools.chown(&device, prior_owner, false),
        }
    }

    pub fn make_gpt(&mut self) -> DiskResult<()> {
        self.make_table(TableKind::Gpt)
    }

    pub fn make_mbr(&mut self) -> DiskResult<()> {
        self.make_table(TableKind::Mbr)
    }

    fn make_table(&mut self, kind: TableKind) -> DiskResult<()> {
        self.require_connected()?;
        self.require_unmounted()?;

        let previous_table = self.table.replace(PartitionTable::new(
            kind,
            self.ctx.image.logical_sector_size,
            self.ctx.image.physical_sector_size,
        ));
        let previous_partitions = std::mem::take(&mut self.partitions);
        let previous_dirty = std::mem::replace(&mut self.table_dirty, true);

        let expected = match self.add_boot_partition(kind).and_then(|()| self.commit_table()) {
            Ok(expected) => expected,
            Err(e) => {
                self.table = previous_table;
                self.partitions = previous_partitions;
                self.table_dirty = previous_dirty;
                warn!(path = %self.path.display(), %kind, error = %e, "new partition table not written");
                return Err(e);
            }
        };
        info!(path = %self.path.display(), %kind, "new partition table");
        self.reload_after_write(&expected)?;

        if kind == TableKind::Gpt {
            let label = self.ctx.image.efi_label.clone();
            self.partition(0)?
                .make_filesystem(FilesystemKind::Fat32, &label)?;
        }
        Ok(())
    }

    fn add_boot_partition(&mut self, kind: TableKind) -> DiskResult<()> {
        if kind != TableKind::Gpt {
            return Ok(());
        }
        let start = HEAD_SECTORS * self.ctx.image.logical_sector_size;
        self.create_partition_at(
            EFI_PARTITION_NAME,
            start,
            start + EFI_SYSTEM_BYTES,
            PartitionType::EfiSystem,
            false,
        )?;
        Ok(())
    }

    fn check_request(&self, partition_type: PartitionType) -> DiskResult<()> {
        let table = self.require_table()?;
        partition_type.code_for(table.kind)?;
        if let Some(max) = table.kind.max_partitions() {
            if self.partitions.len() >= max {
                return Err(DiskError::TableFull {
                    kind: table.kind,
                    max,
                });
            }
        }
        Ok(())
    }

    /// Allocate a partition of `size_spec` in the first free gap. Returns its
    /// index. The table is dirty until [`write_table`](Self::write_table).
    pub fn create_partition(
        &mut self,
        name: &str,
        size_spec: &str,
        partition_type: PartitionType,
        bootable: bool,
    ) -> DiskResult<usize> {
        self.check_request(partition_type)?;
        let geometry = self.geometry()?;
        let bytes = SizeSpec::parse(size_spec)?.resolve(
            geometry.virtual_size,
            geometry.reserved_bytes(),
            geometry.block_size,
        )?;
        let placement = allocator::place(&geometry, &self.ranges(), bytes)?;
        Ok(self.insert_partition(placement, name, partition_type, bootable))
    }

    /// Add a partition covering `[start_byte, end_byte)`, which must be
    /// sector aligned and free.
    pub fn create_partition_at(
        &mut self,
        name: &str,
        start_byte: u64,
        end_byte: u64,
        partition_type: PartitionType,
        bootable: bool,
    ) -> DiskResult<usize> {
        self.check_request(partition_type)?;
        let geometry = self.geometry()?;
        let ss = geometry.sector_size;
        if end_byte <= start_byte || start_byte % ss != 0 || end_byte % ss != 0 {
            return Err(DiskError::InvalidSizeSpec(format!(
                "{start_byte}..{end_byte} is not a sector-aligned range"
            )));
        }
        let range = SectorRange::new(start_byte / ss, end_byte / ss - 1);
        let placement = allocator::place_at(&geometry, &self.ranges(), range)?;
        Ok(self.insert_partition(placement, name, partition_type, bootable))
    }

    fn ranges(&self) -> Vec<SectorRange> {
        self.partitions.iter().map(Partition::range).collect()
    }

    fn insert_partition(
        &mut self,
        placement: Placement,
        name: &str,
        partition_type: PartitionType,
        bootable: bool,
    ) -> usize {
        let record = PartitionRecord {
            start_sector: placement.range.start,
            end_sector: placement.range.end,
            partition_type,
            name: name.to_string(),
            bootable,
        };
        let partition = Partition::new(
            placement.position,
            record,
            self.sector_size(),
            self.ctx.tools.clone(),
        );
        self.partitions.insert(placement.position, partition);
        for (index, partition) in self.partitions.iter_mut().enumerate() {
            partition.set_index(index);
        }
        self.table_dirty = true;
        info!(
            path = %self.path.display(),
            name,
            index = placement.position,
            start = placement.range.start,
            end = placement.range.end,
            "allocated partition"
        );
        placement.position
    }

    /// Write the in-memory partition list to the device, then reconnect so
    /// the kernel sees the new layout.
    pub fn write_table(&mut self) -> DiskResult<()> {
        if !self.table_dirty {
            return Ok(());
        }
        self.require_connected()?;
        self.require_unmounted()?;
        let expected = self.commit_table()?;
        self.reload_after_write(&expected)
    }

    /// Encode the partition list onto the device. Nothing in memory changes
    /// unless the write succeeds.
    fn commit_table(&mut self) -> DiskResult<PartitionTable> {
        let device = self.require_connected()?.device.clone();
        let mut expected = self.require_table()?.clone();
        expected.records = self.partitions.iter().map(|p| p.record().clone()).collect();

        self.ctx
            .codec
            .write(&device, &expected, self.info.virtual_size)?;
        self.table = Some(expected.clone());
        self.table_dirty = false;
        Ok(expected)
    }

    fn reload_after_write(&mut self, expected: &PartitionTable) -> DiskResult<()> {
        self.disconnect()?;
        self.connect()?;

        if let Some(device) = self.device_path().map(Path::to_path_buf) {
            if let Err(e) = self.ctx.tools.rescan(&device) {
                warn!(device = %device.display(), error = %e, "partition rescan failed");
            }
        }

        match &self.table {
            Some(read_back) if read_back.kind == expected.kind => Ok(()),
            Some(read_back) => Err(DiskError::Codec(format!(
                "wrote a {} table but read back {}",
                expected.kind, read_back.kind
            ))),
            None => Err(DiskError::Codec(
                "partition table not found after write".to_string(),
            )),
        }
    }

    /// Grow the image. Only allowed while disconnected.
    pub fn resize(&mut self, new_size: u64) -> DiskResult<()> {
        self.require_unmounted()?;
        if self.is_connected() {
            return Err(DiskError::ImageConnectedError(self.path.clone()));
        }
        if new_size <= self.info.virtual_size {
            return Err(DiskError::InvalidResize {
                current: self.info.virtual_size,
                requested: new_size,
            });
        }
        self.ctx.tools.image_resize(&self.path, new_size)?;
        info!(path = %self.path.display(), from = self.info.virtual_size, to = new_size, "resized image");
        self.probe()
    }

    /// Delete the backing file. A connected image is left as it is.
    pub fn destroy(&mut self) -> DiskResult<()> {
        if self.is_connected() {
            return Err(DiskError::ImageConnectedError(self.path.clone()));
        }
        fs::remove_file(&self.path)?;
        info!(path = %self.path.display(), "destroyed image");
        Ok(())
    }

    /// Overwrite and verify the whole virtual extent.
    pub fn secure_wipe(&mut self, policy: &WipePolicy) -> DiskResult<()> {
        self.require_connected()?;
        self.require_unmounted()?;
        let len = self.info.virtual_size;
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| DiskError::ImageNotConnected(self.path.clone()))?;
        wipe_range(&mut connection.handle, 0, len, policy)?;
        if self.table.is_some() {
            // the table on the device is gone now
            self.table_dirty = true;
        }
        Ok(())
    }

    /// Overwrite and verify one partition's byte range.
    pub fn wipe_partition(&mut self, index: usize, policy: &WipePolicy) -> DiskResult<()> {
        self.require_connected()?;
        let partition = self
            .partitions
            .get(index)
            .ok_or_else(|| DiskError::PartitionMissingError(format!("index {index}")))?;
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| DiskError::ImageNotConnected(self.path.clone()))?;
        partition.secure_wipe(&mut connection.handle, policy)
    }
}

impl Drop for BlockImage {
    fn drop(&mut self) {
        if self.is_connected() && !self.is_mounted() {
            if let Err(e) = self.disconnect() {
                warn!(path = %self.path.display(), error = %e, "disconnect on drop failed");
            }
        }
    }
}

#[cfg(unix)]
fn is_block_device(metadata: &fs::Metadata) -> bool {
    use std::os::unix::fs::FileTypeExt;
    metadata.file_type().is_block_device()
}

#[cfg(not(unix))]
fn is_block_device(_metadata: &fs::Metadata) -> bool {
    false
}
