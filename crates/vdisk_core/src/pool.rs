//! Transport device pool
//!
//! A fixed set of NBD slots shared by every image in the process. The slot
//! table is an arena indexed by position; one mutex guards the whole
//! scan-and-bind sequence and every release, so two callers can never race
//! onto the same slot between the free check and the bind.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};
use vdisk_hal::{enumerate_block_devices, module_loaded};

use crate::config::PoolConfig;
use crate::error::{DiskError, DiskResult};
use crate::tools::Toolbox;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSlot {
    pub path: PathBuf,
    /// Path of the image bound to this slot.
    pub bound_image: Option<PathBuf>,
}

impl DeviceSlot {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            bound_image: None,
        }
    }

    pub fn is_free(&self) -> bool {
        self.bound_image.is_none()
    }
}

#[derive(Debug)]
pub struct DevicePool {
    tools: Arc<Toolbox>,
    slots: Mutex<Vec<DeviceSlot>>,
}

impl DevicePool {
    /// Pool over an explicit list of device nodes.
    pub fn with_devices(tools: Arc<Toolbox>, devices: Vec<PathBuf>) -> Self {
        Self {
            tools,
            slots: Mutex::new(devices.into_iter().map(DeviceSlot::new).collect()),
        }
    }

    /// Pool over the transport devices the host exposes, loading the kernel
    /// module first if none are present.
    pub fn discover(tools: Arc<Toolbox>, config: &PoolConfig) -> DiskResult<Self> {
        let mut devices = Self::enumerate(config)?;

        if devices.is_empty() {
            if module_loaded(&config.kernel_module) {
                debug!(module = %config.kernel_module, "module loaded but no devices found");
            } else {
                info!(module = %config.kernel_module, "loading kernel module");
                tools.load_module(&config.kernel_module, &config.module_params)?;
            }
            devices = Self::enumerate(config)?;
        }

        if devices.is_empty() {
            return Err(DiskError::NoFreeDeviceAvailable);
        }
        info!(count = devices.len(), "device pool ready");
        Ok(Self::with_devices(tools, devices))
    }

    fn enumerate(config: &PoolConfig) -> DiskResult<Vec<PathBuf>> {
        let mut devices = enumerate_block_devices(&config.device_dir, &config.device_prefix)?;
        if let Some(max) = config.max_devices {
            devices.truncate(max);
        }
        Ok(devices)
    }

    fn lock(&self) -> DiskResult<MutexGuard<'_, Vec<DeviceSlot>>> {
        self.slots.lock().map_err(|_| DiskError::PoolPoisoned)
    }

    /// Bind `image` to the first slot that accepts it and return the device.
    pub fn connect(&self, image: &Path) -> DiskResult<PathBuf> {
        let mut slots = self.lock()?;

        if slots
            .iter()
            .any(|slot| slot.bound_image.as_deref() == Some(image))
        {
            return Err(DiskError::ImageConnectedError(image.to_path_buf()));
        }

        for slot in slots.iter_mut().filter(|slot| slot.is_free()) {
            match self.tools.bind(image, &slot.path) {
                Ok(()) => {
                    slot.bound_image = Some(image.to_path_buf());
                    info!(image = %image.display(), device = %slot.path.display(), "bound image");
                    return Ok(slot.path.clone());
                }
                Err(e) => {
                    warn!(device = %slot.path.display(), error = %e, "bind failed, trying next device");
                }
            }
        }

        Err(DiskError::NoFreeDeviceAvailable)
    }

    /// Unbind whatever is bound to `device` and free the slot.
    pub fn disconnect(&self, device: &Path) -> DiskResult<()> {
        let mut slots = self.lock()?;

        let slot = slots
            .iter_mut()
            .find(|slot| slot.path == device)
            .filter(|slot| !slot.is_free())
            .ok_or_else(|| DiskError::ImageNotConnected(device.to_path_buf()))?;

        self.tools.unbind(device)?;
        let image = slot.bound_image.take();
        info!(device = %device.display(), image = ?image, "released device");
        Ok(())
    }

    /// Device `image` is currently bound to.
    pub fn bound_device(&self, image: &Path) -> DiskResult<Option<PathBuf>> {
        let slots = self.lock()?;
        Ok(slots
            .iter()
            .find(|slot| slot.bound_image.as_deref() == Some(image))
            .map(|slot| slot.path.clone()))
    }

    pub fn free_slots(&self) -> DiskResult<usize> {
        Ok(self.lock()?.iter().filter(|slot| slot.is_free()).count())
    }

    pub fn len(&self) -> usize {
        self.slots.lock().map(|slots| slots.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the slot table.
    pub fn snapshot(&self) -> DiskResult<Vec<DeviceSlot>> {
        Ok(self.lock()?.clone())
    }
}
