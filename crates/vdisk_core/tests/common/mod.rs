//! Test host for integration tests
//!
//! `FakeHost` stands in for the external tools and the table codec. Images
//! are plain sparse files; binding an image makes the device path a symlink
//! to it, so reads and writes through the device land in the image and
//! survive reconnects. Tables are kept per image in memory.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;
use vdisk_core::codec::render_sfdisk_script;
use vdisk_core::{
    BlockImage, DevicePool, DiskError, DiskResult, ImageConfig, ImageContext, PartitionTable,
    TableCodec, ToolConfig, Toolbox,
};
use vdisk_hal::{CommandResult, CommandRunner, HalResult};

pub const MIB: u64 = 1024 * 1024;
pub const CLUSTER_SIZE: u64 = 65536;

#[derive(Default)]
pub struct FakeHost {
    /// device -> image
    bindings: Mutex<HashMap<PathBuf, PathBuf>>,
    /// image -> table
    tables: Mutex<HashMap<PathBuf, PartitionTable>>,
    calls: Mutex<Vec<(String, Vec<String>)>>,
    failing: Mutex<HashSet<String>>,
}

fn outcome(result: io::Result<()>) -> CommandResult {
    match result {
        Ok(()) => CommandResult::default(),
        Err(e) => CommandResult::failure(1, e.to_string()),
    }
}

fn size_arg(arg: &str) -> io::Result<u64> {
    arg.parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("bad size {arg}")))
}

impl FakeHost {
    /// Make every later invocation of `program` exit non-zero.
    pub fn fail(&self, program: &str) {
        self.failing.lock().unwrap().insert(program.to_string());
    }

    /// Undo [`fail`](Self::fail).
    pub fn recover(&self, program: &str) {
        self.failing.lock().unwrap().remove(program);
    }

    fn is_failing(&self, program: &str) -> bool {
        self.failing.lock().unwrap().contains(program)
    }

    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, program: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|(p, _)| p == program)
            .map(|(_, args)| args)
            .collect()
    }

    pub fn stored_table(&self, image: &Path) -> Option<PartitionTable> {
        self.tables.lock().unwrap().get(image).cloned()
    }

    fn qemu_img(&self, args: &[String]) -> CommandResult {
        match args.first().map(String::as_str) {
            Some("create") => outcome(
                size_arg(&args[4]).and_then(|size| File::create(&args[3])?.set_len(size)),
            ),
            Some("info") => match fs::metadata(&args[2]) {
                Ok(meta) => CommandResult::success_with_output(format!(
                    r#"{{"virtual-size": {}, "filename": "{}", "cluster-size": {}, "format": "qcow2", "actual-size": 4096, "dirty-flag": false}}"#,
                    meta.len(),
                    args[2],
                    CLUSTER_SIZE
                )),
                Err(e) => CommandResult::failure(1, e.to_string()),
            },
            Some("resize") => outcome(size_arg(&args[4]).and_then(|size| {
                fs::OpenOptions::new()
                    .write(true)
                    .open(&args[3])?
                    .set_len(size)
            })),
            _ => CommandResult::failure(1, "unknown qemu-img subcommand"),
        }
    }

    fn qemu_nbd(&self, args: &[String]) -> CommandResult {
        let mut bindings = self.bindings.lock().unwrap();
        if let Some(device) = args[0].strip_prefix("--connect=") {
            let device = PathBuf::from(device);
            if bindings.contains_key(&device) {
                return CommandResult::failure(1, "device is busy");
            }
            let image = PathBuf::from(&args[3]);
            if let Err(e) = symlink(&image, &device) {
                return CommandResult::failure(1, e.to_string());
            }
            bindings.insert(device, image);
            CommandResult::default()
        } else if args[0] == "--disconnect" {
            let device = PathBuf::from(&args[1]);
            bindings.remove(&device);
            outcome(fs::remove_file(&device))
        } else {
            CommandResult::failure(1, "unknown qemu-nbd invocation")
        }
    }

    fn image_behind(&self, device: &Path) -> DiskResult<PathBuf> {
        self.bindings
            .lock()
            .unwrap()
            .get(device)
            .cloned()
            .ok_or_else(|| DiskError::Codec(format!("{} is not bound", device.display())))
    }
}

impl CommandRunner for FakeHost {
    fn run(&self, program: &str, args: &[String]) -> HalResult<CommandResult> {
        self.calls
            .lock()
            .unwrap()
            .push((program.to_string(), args.to_vec()));

        if self.is_failing(program) {
            return Ok(CommandResult::failure(1, format!("{program}: simulated failure")));
        }

        Ok(match program {
            "qemu-img" => self.qemu_img(args),
            "qemu-nbd" => self.qemu_nbd(args),
            _ => CommandResult::default(),
        })
    }

    fn run_with_input(&self, program: &str, args: &[String], _input: &[u8]) -> HalResult<CommandResult> {
        self.run(program, args)
    }
}

impl TableCodec for FakeHost {
    fn read(
        &self,
        device: &Path,
        _logical_sector_size: u64,
        _physical_sector_size: u64,
    ) -> DiskResult<Option<PartitionTable>> {
        let image = self.image_behind(device)?;
        Ok(self.stored_table(&image))
    }

    fn write(&self, device: &Path, table: &PartitionTable, total_bytes: u64) -> DiskResult<()> {
        // same validation the real codec applies before touching the device
        render_sfdisk_script(table, total_bytes)?;
        if self.is_failing("sfdisk") {
            return Err(DiskError::Codec("sfdisk: simulated failure".to_string()));
        }
        let image = self.image_behind(device)?;
        self.tables.lock().unwrap().insert(image, table.clone());
        Ok(())
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub host: Arc<FakeHost>,
    pub ctx: ImageContext,
}

impl Harness {
    pub fn new(devices: usize) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let dev_dir = dir.path().join("dev");
        fs::create_dir(&dev_dir).expect("Failed to create device dir");

        let host = Arc::new(FakeHost::default());
        let tools = Arc::new(Toolbox::new(host.clone(), ToolConfig::default(), "qcow2"));
        let slots = (0..devices).map(|i| dev_dir.join(format!("nbd{i}"))).collect();
        let pool = Arc::new(DevicePool::with_devices(tools.clone(), slots));
        let ctx = ImageContext::new(tools, pool, host.clone(), ImageConfig::default());

        Self { dir, host, ctx }
    }

    pub fn image_path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn create(&self, name: &str, size: u64) -> BlockImage {
        BlockImage::create(&self.ctx, self.image_path(name), size).expect("Failed to create image")
    }
}
