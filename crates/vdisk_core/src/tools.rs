//! External tool invocations
//!
//! [`Toolbox`] turns each host operation the engine needs into one call on a
//! [`CommandRunner`]. A non-zero exit becomes
//! [`DiskError::ToolExecutionFailed`] carrying the tool name and whatever the
//! tool printed.

use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;
use vdisk_hal::{command_exists, CommandResult, CommandRunner, Ownership};

use crate::config::ToolConfig;
use crate::error::{DiskError, DiskResult};
use crate::filesystem::FilesystemKind;

/// Metadata reported by the image info tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub virtual_size: u64,
    pub actual_size: u64,
    pub cluster_size: u64,
    pub dirty: bool,
}

#[derive(Debug, Deserialize)]
struct RawImageInfo {
    #[serde(rename = "virtual-size")]
    virtual_size: u64,
    #[serde(rename = "actual-size", default)]
    actual_size: u64,
    #[serde(rename = "cluster-size", default)]
    cluster_size: u64,
    #[serde(rename = "dirty-flag", default)]
    dirty_flag: bool,
}

/// Parse `qemu-img info --output=json` output.
pub fn parse_image_info(json: &str) -> DiskResult<ImageInfo> {
    let raw: RawImageInfo =
        serde_json::from_str(json).map_err(|e| DiskError::Probe(e.to_string()))?;
    Ok(ImageInfo {
        virtual_size: raw.virtual_size,
        actual_size: raw.actual_size,
        cluster_size: raw.cluster_size,
        dirty: raw.dirty_flag,
    })
}

pub struct Toolbox {
    runner: Arc<dyn CommandRunner>,
    config: ToolConfig,
    image_format: String,
}

impl std::fmt::Debug for Toolbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Toolbox")
            .field("config", &self.config)
            .field("image_format", &self.image_format)
            .finish()
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

impl Toolbox {
    pub fn new(runner: Arc<dyn CommandRunner>, config: ToolConfig, image_format: impl Into<String>) -> Self {
        Self {
            runner,
            config,
            image_format: image_format.into(),
        }
    }

    pub fn config(&self) -> &ToolConfig {
        &self.config
    }

    pub fn image_format(&self) -> &str {
        &self.image_format
    }

    /// Configured programs that are not on PATH.
    pub fn missing_tools(&self) -> Vec<String> {
        let c = &self.config;
        let mut programs: Vec<&str> = [
            &c.qemu_img, &c.qemu_nbd, &c.sfdisk, &c.mount, &c.umount, &c.chown, &c.partprobe,
            &c.modprobe,
        ]
        .into_iter()
        .map(String::as_str)
        .collect();
        programs.extend(FilesystemKind::ALL.iter().map(|kind| c.mkfs.program(*kind)));
        if let Some(helper) = &c.privilege_helper {
            programs.push(helper);
        }
        programs
            .into_iter()
            .filter(|p| !command_exists(p))
            .map(str::to_string)
            .collect()
    }

    fn command_line(&self, tool: &str, args: Vec<String>) -> (String, Vec<String>) {
        match &self.config.privilege_helper {
            Some(helper) => {
                let mut full = Vec::with_capacity(args.len() + 1);
                full.push(tool.to_string());
                full.extend(args);
                (helper.clone(), full)
            }
            None => (tool.to_string(), args),
        }
    }

    /// Run `tool`, returning its result whatever the exit status.
    pub fn run_unchecked(&self, tool: &str, args: Vec<String>) -> DiskResult<CommandResult> {
        let (program, args) = self.command_line(tool, args);
        debug!(tool, ?args, "running tool");
        Ok(self.runner.run(&program, &args)?)
    }

    /// Run `tool` and fail on a non-zero exit.
    pub fn run(&self, tool: &str, args: Vec<String>) -> DiskResult<CommandResult> {
        let result = self.run_unchecked(tool, args)?;
        check(tool, result)
    }

    pub fn run_with_input(&self, tool: &str, args: Vec<String>, input: &[u8]) -> DiskResult<CommandResult> {
        let (program, args) = self.command_line(tool, args);
        debug!(tool, ?args, bytes = input.len(), "running tool with input");
        let result = self.runner.run_with_input(&program, &args, input)?;
        check(tool, result)
    }

    pub fn image_create(&self, path: &Path, size_bytes: u64) -> DiskResult<()> {
        self.run(
            &self.config.qemu_img,
            vec![
                "create".into(),
                "-f".into(),
                self.image_format.clone(),
                path_arg(path),
                size_bytes.to_string(),
            ],
        )?;
        Ok(())
    }

    pub fn image_info(&self, path: &Path) -> DiskResult<ImageInfo> {
        let result = self.run(
            &self.config.qemu_img,
            vec!["info".into(), "--output=json".into(), path_arg(path)],
        )?;
        parse_image_info(&result.stdout_lossy())
    }

    pub fn image_resize(&self, path: &Path, size_bytes: u64) -> DiskResult<()> {
        self.run(
            &self.config.qemu_img,
            vec![
                "resize".into(),
                "-f".into(),
                self.image_format.clone(),
                path_arg(path),
                size_bytes.to_string(),
            ],
        )?;
        Ok(())
    }

    pub fn bind(&self, image: &Path, device: &Path) -> DiskResult<()> {
        self.run(
            &self.config.qemu_nbd,
            vec![
                format!("--connect={}", device.display()),
                "-f".into(),
                self.image_format.clone(),
                path_arg(image),
            ],
        )?;
        Ok(())
    }

    pub fn unbind(&self, device: &Path) -> DiskResult<()> {
        self.run(&self.config.qemu_nbd, vec!["--disconnect".into(), path_arg(device)])?;
        Ok(())
    }

    pub fn make_filesystem(&self, kind: FilesystemKind, label: &str, device_node: &Path) -> DiskResult<()> {
        self.run(
            self.config.mkfs.program(kind),
            kind.args(label, &device_node.to_string_lossy()),
        )?;
        Ok(())
    }

    pub fn mount(&self, device_node: &Path, target: &Path) -> DiskResult<()> {
        self.run(&self.config.mount, vec![path_arg(device_node), path_arg(target)])?;
        Ok(())
    }

    pub fn unmount(&self, target: &Path) -> DiskResult<()> {
        self.run(&self.config.umount, vec![path_arg(target)])?;
        Ok(())
    }

    pub fn chown(&self, path: &Path, owner: Ownership, recursive: bool) -> DiskResult<()> {
        let mut args = Vec::new();
        if recursive {
            args.push("-R".to_string());
        }
        args.push(owner.spec());
        args.push(path_arg(path));
        self.run(&self.config.chown, args)?;
        Ok(())
    }

    /// Ask the kernel to re-read the partition table of `device`.
    pub fn rescan(&self, device: &Path) -> DiskResult<()> {
        self.run(&self.config.partprobe, vec![path_arg(device)])?;
        Ok(())
    }

    pub fn load_module(&self, module: &str, params: &[String]) -> DiskResult<()> {
        let mut args = vec![module.to_string()];
        args.extend(params.iter().cloned());
        self.run(&self.config.modprobe, args)?;
        Ok(())
    }
}

fn check(tool: &str, result: CommandResult) -> DiskResult<CommandResult> {
    if result.success() {
        Ok(result)
    } else {
        Err(DiskError::tool_failed(tool, result.combined_output()))
    }
}
