//! Kernel-facing host queries
//!
//! Enumerating transport block devices and checking whether the kernel
//! facility that provides them is loaded.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{HalError, HalResult};

const PROC_MODULES: &str = "/proc/modules";
const SYS_MODULE: &str = "/sys/module";

/// Whether kernel module `name` is loaded (or built in).
pub fn module_loaded(name: &str) -> bool {
    if Path::new(SYS_MODULE).join(name).is_dir() {
        return true;
    }
    fs::read_to_string(PROC_MODULES)
        .map(|modules| modules_list_contains(&modules, name))
        .unwrap_or(false)
}

fn modules_list_contains(modules: &str, name: &str) -> bool {
    modules
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .any(|module| module == name)
}

/// Block device nodes named `<prefix><N>` directly under `dir`, ordered by
/// `N`. Partition nodes such as `nbd0p1` are skipped.
pub fn enumerate_block_devices<P: AsRef<Path>>(dir: P, prefix: &str) -> HalResult<Vec<PathBuf>> {
    let dir = dir.as_ref();
    let entries = fs::read_dir(dir)
        .map_err(|e| HalError::io_error("read_dir", Some(&dir.to_string_lossy()), e))?;

    let mut devices: Vec<(u32, PathBuf)> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name();
            let number = device_number(&name.to_string_lossy(), prefix)?;
            Some((number, entry.path()))
        })
        .collect();

    devices.sort_by_key(|(number, _)| *number);
    Ok(devices.into_iter().map(|(_, path)| path).collect())
}

fn device_number(name: &str, prefix: &str) -> Option<u32> {
    let suffix = name.strip_prefix(prefix)?;
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}
