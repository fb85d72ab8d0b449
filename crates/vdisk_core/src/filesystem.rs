//! Supported filesystem kinds and the tools that create them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DiskError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilesystemKind {
    Ext4,
    Exfat,
    Fat32,
    Ntfs,
    Xfs,
    Btrfs,
}

impl FilesystemKind {
    pub const ALL: [FilesystemKind; 6] = [
        FilesystemKind::Ext4,
        FilesystemKind::Exfat,
        FilesystemKind::Fat32,
        FilesystemKind::Ntfs,
        FilesystemKind::Xfs,
        FilesystemKind::Btrfs,
    ];

    /// Program that formats this kind unless configured otherwise.
    pub fn default_tool(self) -> &'static str {
        match self {
            FilesystemKind::Ext4 => "mkfs.ext4",
            FilesystemKind::Exfat => "mkfs.exfat",
            FilesystemKind::Fat32 => "mkfs.vfat",
            FilesystemKind::Ntfs => "mkfs.ntfs",
            FilesystemKind::Xfs => "mkfs.xfs",
            FilesystemKind::Btrfs => "mkfs.btrfs",
        }
    }

    /// Arguments for labelling and formatting `device_node` without prompts.
    pub fn args(self, label: &str, device_node: &str) -> Vec<String> {
        let mut args: Vec<String> = match self {
            FilesystemKind::Ext4 => vec!["-F".into(), "-L".into(), label.into()],
            FilesystemKind::Exfat => vec!["-n".into(), label.into()],
            // FAT labels are upper-case and at most 11 characters
            FilesystemKind::Fat32 => vec![
                "-F".into(),
                "32".into(),
                "-n".into(),
                label.to_ascii_uppercase().chars().take(11).collect(),
            ],
            FilesystemKind::Ntfs => vec!["-f".into(), "-L".into(), label.into()],
            FilesystemKind::Xfs => vec!["-f".into(), "-L".into(), label.chars().take(12).collect()],
            FilesystemKind::Btrfs => vec!["-f".into(), "-L".into(), label.into()],
        };
        args.push(device_node.to_string());
        args
    }
}

impl fmt::Display for FilesystemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FilesystemKind::Ext4 => "ext4",
            FilesystemKind::Exfat => "exfat",
            FilesystemKind::Fat32 => "fat32",
            FilesystemKind::Ntfs => "ntfs",
            FilesystemKind::Xfs => "xfs",
            FilesystemKind::Btrfs => "btrfs",
        };
        f.write_str(name)
    }
}

impl FromStr for FilesystemKind {
    type Err = DiskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ext4" => Ok(FilesystemKind::Ext4),
            "exfat" => Ok(FilesystemKind::Exfat),
            "fat32" | "vfat" | "fat" => Ok(FilesystemKind::Fat32),
            "ntfs" => Ok(FilesystemKind::Ntfs),
            "xfs" => Ok(FilesystemKind::Xfs),
            "btrfs" => Ok(FilesystemKind::Btrfs),
            other => Err(DiskError::Config(format!("unknown filesystem '{other}'"))),
        }
    }
}
