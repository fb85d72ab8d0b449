//! A single partition of a block image.
//!
//! Partitions are created in memory by the allocator and only become
//! addressable (get a device node) once the image has written its table and
//! reconnected. A partition can be mounted at several paths at once; every
//! mount point is tracked on its own.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{DiskError, DiskResult};
use crate::filesystem::FilesystemKind;
use crate::table::{PartitionRecord, PartitionType, SectorRange};
use crate::tools::Toolbox;
use crate::wipe::{wipe_range, WipePolicy, WipeTarget};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    pub path: PathBuf,
    pub mounted: bool,
    /// Created by [`Partition::mount`] and removed again on unmount.
    pub temporary: bool,
}

#[derive(Debug)]
pub struct Partition {
    index: usize,
    record: PartitionRecord,
    sector_size: u64,
    device_node: Option<PathBuf>,
    mounts: Vec<MountPoint>,
    mount_count: usize,
    tools: Arc<Toolbox>,
}

/// Device node of partition `index` (zero-based) on `device`.
pub fn device_node_for(device: &Path, index: usize) -> PathBuf {
    let mut node = device.as_os_str().to_os_string();
    node.push(format!("p{}", index + 1));
    PathBuf::from(node)
}

impl Partition {
    pub(crate) fn new(index: usize, record: PartitionRecord, sector_size: u64, tools: Arc<Toolbox>) -> Self {
        Self {
            index,
            record,
            sector_size,
            device_node: None,
            mounts: Vec::new(),
            mount_count: 0,
            tools,
        }
    }

    pub(crate) fn set_index(&mut self, index: usize) {
        self.index = index;
    }

    pub(crate) fn attach(&mut self, device: &Path) {
        self.device_node = Some(device_node_for(device, self.index));
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn record(&self) -> &PartitionRecord {
        &self.record
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn partition_type(&self) -> PartitionType {
        self.record.partition_type
    }

    pub fn is_bootable(&self) -> bool {
        self.record.bootable
    }

    pub fn start_sector(&self) -> u64 {
        self.record.start_sector
    }

    pub fn end_sector(&self) -> u64 {
        self.record.end_sector
    }

    pub fn range(&self) -> SectorRange {
        self.record.range()
    }

    pub fn byte_size(&self) -> u64 {
        self.range().sectors() * self.sector_size
    }

    pub fn start_byte(&self) -> u64 {
        self.record.start_sector * self.sector_size
    }

    pub fn device_node(&self) -> Option<&Path> {
        self.device_node.as_deref()
    }

    pub fn mounts(&self) -> &[MountPoint] {
        &self.mounts
    }

    pub fn mount_count(&self) -> usize {
        self.mount_count
    }

    pub fn is_mounted(&self) -> bool {
        self.mount_count > 0
    }

    pub fn is_mounted_at(&self, path: &Path) -> bool {
        self.mounts.iter().any(|m| m.mounted && m.path == path)
    }

    fn require_node(&self) -> DiskResult<PathBuf> {
        self.device_node.clone().ok_or_else(|| {
            DiskError::PartitionMissingError(format!(
                "partition {} ('{}') has not been written to the device",
                self.index, self.record.name
            ))
        })
    }

    pub fn make_filesystem(&self, kind: FilesystemKind, label: &str) -> DiskResult<()> {
        let node = self.require_node()?;
        if self.is_mounted() {
            return Err(DiskError::ImageMountedError(node));
        }
        self.tools.make_filesystem(kind, label, &node)?;
        info!(node = %node.display(), fs = %kind, label, "created filesystem");
        Ok(())
    }

    /// Mount at a fresh temporary directory and return it.
    pub fn mount(&mut self) -> DiskResult<PathBuf> {
        self.require_node()?;
        let dir = std::env::temp_dir().join(format!("vdisk-mnt-{}", Uuid::new_v4()));
        fs::create_dir(&dir)?;

        if let Err(e) = self.mount_inner(&dir, true) {
            let _ = fs::remove_dir(&dir);
            return Err(e);
        }
        Ok(dir)
    }

    pub fn mount_at<P: AsRef<Path>>(&mut self, path: P) -> DiskResult<()> {
        self.mount_inner(path.as_ref(), false)
    }

    fn mount_inner(&mut self, path: &Path, temporary: bool) -> DiskResult<()> {
        let node = self.require_node()?;
        if self.is_mounted_at(path) {
            return Err(DiskError::ImageMountedError(path.to_path_buf()));
        }

        self.tools.mount(&node, path)?;

        match self.mounts.iter_mut().find(|m| m.path == path) {
            Some(entry) => {
                entry.mounted = true;
                entry.temporary = temporary;
            }
            None => self.mounts.push(MountPoint {
                path: path.to_path_buf(),
                mounted: true,
                temporary,
            }),
        }
        self.mount_count += 1;
        info!(node = %node.display(), path = %path.display(), "mounted");
        Ok(())
    }

    pub fn unmount_at<P: AsRef<Path>>(&mut self, path: P) -> DiskResult<()> {
        let path = path.as_ref();
        let position = self
            .mounts
            .iter()
            .position(|m| m.mounted && m.path == path)
            .ok_or_else(|| DiskError::ImageNotMountedError(path.to_path_buf()))?;

        self.tools.unmount(path)?;

        let entry = self.mounts.remove(position);
        self.mount_count -= 1;
        if entry.temporary {
            if let Err(e) = fs::remove_dir(&entry.path) {
                warn!(path = %entry.path.display(), error = %e, "could not remove mount directory");
            }
        }
        info!(path = %path.display(), "unmounted");
        Ok(())
    }

    /// Unmount every active mount point.
    pub fn unmount(&mut self) -> DiskResult<()> {
        let active: Vec<PathBuf> = self
            .mounts
            .iter()
            .filter(|m| m.mounted)
            .map(|m| m.path.clone())
            .collect();
        if active.is_empty() {
            let target = self
                .device_node
                .clone()
                .unwrap_or_else(|| PathBuf::from(&self.record.name));
            return Err(DiskError::ImageNotMountedError(target));
        }
        for path in active {
            self.unmount_at(&path)?;
        }
        Ok(())
    }

    /// Overwrite and verify this partition's byte range on `device`.
    pub fn secure_wipe<D: WipeTarget>(&self, device: &mut D, policy: &WipePolicy) -> DiskResult<()> {
        if self.is_mounted() {
            let target = self
                .device_node
                .clone()
                .unwrap_or_else(|| PathBuf::from(&self.record.name));
            return Err(DiskError::ImageMountedError(target));
        }
        wipe_range(device, self.start_byte(), self.byte_size(), policy)
    }
}
