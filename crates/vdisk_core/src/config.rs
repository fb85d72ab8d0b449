//! Configuration
//!
//! Everything the engine needs to know about the host: which programs to
//! run, where transport devices live, how images are formatted. All fields
//! have defaults so an empty file is a valid configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DiskError, DiskResult};
use crate::filesystem::FilesystemKind;
use crate::logging::LoggingConfig;
use crate::wipe::WipePolicy;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskConfig {
    pub tools: ToolConfig,
    pub pool: PoolConfig,
    pub image: ImageConfig,
    pub wipe: WipePolicy,
    pub logging: LoggingConfig,
}

/// Program names (or absolute paths) for every external tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    pub qemu_img: String,
    pub qemu_nbd: String,
    pub sfdisk: String,
    pub mount: String,
    pub umount: String,
    pub chown: String,
    pub partprobe: String,
    pub modprobe: String,
    /// Prefix for every invocation, e.g. `sudo`.
    pub privilege_helper: Option<String>,
    /// Kill tools that run longer than this.
    pub command_timeout_secs: Option<u64>,
    pub mkfs: MkfsConfig,
}

/// Formatting program per filesystem kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MkfsConfig {
    pub ext4: String,
    pub exfat: String,
    pub fat32: String,
    pub ntfs: String,
    pub xfs: String,
    pub btrfs: String,
}

impl Default for MkfsConfig {
    fn default() -> Self {
        Self {
            ext4: FilesystemKind::Ext4.default_tool().to_string(),
            exfat: FilesystemKind::Exfat.default_tool().to_string(),
            fat32: FilesystemKind::Fat32.default_tool().to_string(),
            ntfs: FilesystemKind::Ntfs.default_tool().to_string(),
            xfs: FilesystemKind::Xfs.default_tool().to_string(),
            btrfs: FilesystemKind::Btrfs.default_tool().to_string(),
        }
    }
}

impl MkfsConfig {
    pub fn program(&self, kind: FilesystemKind) -> &str {
        match kind {
            FilesystemKind::Ext4 => &self.ext4,
            FilesystemKind::Exfat => &self.exfat,
            FilesystemKind::Fat32 => &self.fat32,
            FilesystemKind::Ntfs => &self.ntfs,
            FilesystemKind::Xfs => &self.xfs,
            FilesystemKind::Btrfs => &self.btrfs,
        }
    }
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            qemu_img: "qemu-img".to_string(),
            qemu_nbd: "qemu-nbd".to_string(),
            sfdisk: "sfdisk".to_string(),
            mount: "mount".to_string(),
            umount: "umount".to_string(),
            chown: "chown".to_string(),
            partprobe: "partprobe".to_string(),
            modprobe: "modprobe".to_string(),
            privilege_helper: None,
            command_timeout_secs: None,
            mkfs: MkfsConfig::default(),
        }
    }
}

impl ToolConfig {
    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub device_dir: PathBuf,
    pub device_prefix: String,
    pub max_devices: Option<usize>,
    pub kernel_module: String,
    pub module_params: Vec<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            device_dir: PathBuf::from("/dev"),
            device_prefix: "nbd".to_string(),
            max_devices: None,
            kernel_module: "nbd".to_string(),
            module_params: vec!["max_part=16".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// Image format passed to the image and bind tools.
    pub format: String,
    pub logical_sector_size: u64,
    pub physical_sector_size: u64,
    /// Filesystem label of the EFI System partition GPT images start with.
    pub efi_label: String,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            format: "qcow2".to_string(),
            logical_sector_size: 512,
            physical_sector_size: 512,
            efi_label: "EFI".to_string(),
        }
    }
}

impl DiskConfig {
    pub fn from_toml_str(content: &str) -> DiskResult<Self> {
        let config: DiskConfig =
            toml::from_str(content).map_err(|e| DiskError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> DiskResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| DiskError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> DiskResult<()> {
        let image = &self.image;
        for (name, size) in [
            ("logical_sector_size", image.logical_sector_size),
            ("physical_sector_size", image.physical_sector_size),
        ] {
            if size < 512 || !size.is_power_of_two() {
                return Err(DiskError::Config(format!(
                    "{name} must be a power of two of at least 512, got {size}"
                )));
            }
        }
        if image.physical_sector_size < image.logical_sector_size {
            return Err(DiskError::Config(
                "physical_sector_size must not be smaller than logical_sector_size".into(),
            ));
        }
        if image.format.trim().is_empty() {
            return Err(DiskError::Config("image format must not be empty".into()));
        }
        if self.pool.device_prefix.is_empty() {
            return Err(DiskError::Config("pool device_prefix must not be empty".into()));
        }
        if self.wipe.chunk_size == 0 {
            return Err(DiskError::Config("wipe chunk_size must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::LogFormat;
    use crate::wipe::WipePattern;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = DiskConfig::from_toml_str("").unwrap();
        assert_eq!(config, DiskConfig::default());
        assert_eq!(config.tools.qemu_nbd, "qemu-nbd");
        assert_eq!(config.pool.device_dir, PathBuf::from("/dev"));
        assert_eq!(config.image.logical_sector_size, 512);
    }

    #[test]
    fn test_partial_sections() {
        let config = DiskConfig::from_toml_str(
            r#"
            [tools]
            privilege_helper = "sudo"
            command_timeout_secs = 30

            [pool]
            max_devices = 4

            [wipe]
            pattern = { kind = "fill", byte = 90 }

            [logging]
            level = "debug"
            format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.tools.privilege_helper.as_deref(), Some("sudo"));
        assert_eq!(config.tools.command_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.tools.qemu_img, "qemu-img");
        assert_eq!(config.pool.max_devices, Some(4));
        assert_eq!(config.pool.device_prefix, "nbd");
        assert_eq!(config.wipe.pattern, WipePattern::Fill(90));
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_mkfs_programs_override_per_kind() {
        let config = DiskConfig::from_toml_str(
            r#"
            [tools.mkfs]
            fat32 = "mkfs.fat"
            btrfs = "/usr/local/sbin/mkfs.btrfs"
            "#,
        )
        .unwrap();
        let mkfs = &config.tools.mkfs;
        assert_eq!(mkfs.program(FilesystemKind::Fat32), "mkfs.fat");
        assert_eq!(mkfs.program(FilesystemKind::Btrfs), "/usr/local/sbin/mkfs.btrfs");
        assert_eq!(mkfs.program(FilesystemKind::Ext4), "mkfs.ext4");
        assert_eq!(config.tools.qemu_img, "qemu-img");
    }

    #[test]
    fn test_rejects_bad_sector_size() {
        let err = DiskConfig::from_toml_str("[image]\nlogical_sector_size = 1000\n").unwrap_err();
        assert!(matches!(err, DiskError::Config(_)));
    }

    #[test]
    fn test_rejects_malformed_toml() {
        assert!(matches!(
            DiskConfig::from_toml_str("[tools\n"),
            Err(DiskError::Config(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().expect("Failed to create temp file");
        writeln!(file, "[image]\nformat = \"raw\"").unwrap();
        let config = DiskConfig::load(file.path()).unwrap();
        assert_eq!(config.image.format, "raw");
    }
}
