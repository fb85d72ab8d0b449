//! Partition table codec
//!
//! The engine never encodes GPT or MBR itself. [`TableCodec`] is the seam to
//! whatever does; [`SfdiskCodec`] drives util-linux `sfdisk`, reading with
//! `--json` and writing by piping a script on stdin.

use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info};

use crate::allocator::GPT_BACKUP_SECTORS;
use crate::error::{DiskError, DiskResult};
use crate::table::{PartitionRecord, PartitionTable, PartitionType, TableKind, TypeCode};
use crate::tools::Toolbox;

pub trait TableCodec: Send + Sync {
    /// Table currently on `device`, or `None` if it has no recognisable one.
    fn read(
        &self,
        device: &Path,
        logical_sector_size: u64,
        physical_sector_size: u64,
    ) -> DiskResult<Option<PartitionTable>>;

    /// Replace the table on `device`, a disk of `total_bytes`.
    fn write(&self, device: &Path, table: &PartitionTable, total_bytes: u64) -> DiskResult<()>;
}

const NO_TABLE_MARKER: &str = "does not contain a recognized partition table";
const LEGACY_BOOTABLE_ATTR: &str = "LegacyBIOSBootable";

#[derive(Debug, Deserialize)]
struct SfdiskDump {
    partitiontable: SfdiskTable,
}

#[derive(Debug, Deserialize)]
struct SfdiskTable {
    label: String,
    #[serde(default)]
    sectorsize: Option<u64>,
    #[serde(default)]
    partitions: Vec<SfdiskPartition>,
}

#[derive(Debug, Deserialize)]
struct SfdiskPartition {
    start: u64,
    size: u64,
    #[serde(rename = "type")]
    type_code: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    bootable: bool,
    #[serde(default)]
    attrs: Option<String>,
}

/// Decode `sfdisk --json` output.
pub fn parse_sfdisk_json(
    json: &str,
    logical_sector_size: u64,
    physical_sector_size: u64,
) -> DiskResult<PartitionTable> {
    let dump: SfdiskDump =
        serde_json::from_str(json).map_err(|e| DiskError::Codec(e.to_string()))?;
    let kind = match dump.partitiontable.label.as_str() {
        "gpt" => TableKind::Gpt,
        "dos" => TableKind::Mbr,
        other => return Err(DiskError::Codec(format!("unsupported table label '{other}'"))),
    };
    let logical = dump.partitiontable.sectorsize.unwrap_or(logical_sector_size);

    let mut table = PartitionTable::new(kind, logical, physical_sector_size.max(logical));
    for part in dump.partitiontable.partitions {
        if part.size == 0 {
            continue;
        }
        let (partition_type, bootable) = match kind {
            TableKind::Gpt => (
                PartitionType::from_gpt_guid(&part.type_code),
                part.attrs
                    .as_deref()
                    .map_or(false, |a| a.contains(LEGACY_BOOTABLE_ATTR)),
            ),
            TableKind::Mbr => {
                let byte = u8::from_str_radix(part.type_code.trim_start_matches("0x"), 16)
                    .map_err(|_| DiskError::Codec(format!("bad MBR type '{}'", part.type_code)))?;
                (PartitionType::from_mbr_byte(byte), part.bootable)
            }
        };
        table.records.push(PartitionRecord {
            start_sector: part.start,
            end_sector: part.start + part.size - 1,
            partition_type,
            name: part.name.unwrap_or_default(),
            bootable,
        });
    }
    table.normalize()?;
    Ok(table)
}

/// Encode `table` as an sfdisk input script for a disk of `total_bytes`.
pub fn render_sfdisk_script(table: &PartitionTable, total_bytes: u64) -> DiskResult<String> {
    table.check_encodable()?;

    let mut script = String::new();
    let label = match table.kind {
        TableKind::Gpt => "gpt",
        TableKind::Mbr => "dos",
    };
    // writing to a String cannot fail
    let _ = writeln!(script, "label: {label}");
    let _ = writeln!(script, "unit: sectors");
    let _ = writeln!(script, "sector-size: {}", table.logical_sector_size);
    if table.kind == TableKind::Gpt {
        let total_sectors = total_bytes / table.logical_sector_size;
        let last_lba = total_sectors.saturating_sub(GPT_BACKUP_SECTORS + 1);
        let _ = writeln!(script, "last-lba: {last_lba}");
    }
    script.push('\n');

    for record in &table.records {
        let size = record.end_sector - record.start_sector + 1;
        let _ = write!(script, "start={}, size={}", record.start_sector, size);
        match record.partition_type.code_for(table.kind)? {
            TypeCode::Guid(guid) => {
                let _ = write!(script, ", type={guid}");
                if !record.name.is_empty() {
                    let _ = write!(script, ", name=\"{}\"", record.name.replace('"', "'"));
                }
                if record.bootable {
                    let _ = write!(script, ", attrs=\"{LEGACY_BOOTABLE_ATTR}\"");
                }
            }
            TypeCode::Byte(byte) => {
                let _ = write!(script, ", type={byte:x}");
                if record.bootable {
                    script.push_str(", bootable");
                }
            }
        }
        script.push('\n');
    }
    Ok(script)
}

/// Codec backed by the `sfdisk` program.
#[derive(Debug)]
pub struct SfdiskCodec {
    tools: Arc<Toolbox>,
}

impl SfdiskCodec {
    pub fn new(tools: Arc<Toolbox>) -> Self {
        Self { tools }
    }
}

impl TableCodec for SfdiskCodec {
    fn read(
        &self,
        device: &Path,
        logical_sector_size: u64,
        physical_sector_size: u64,
    ) -> DiskResult<Option<PartitionTable>> {
        let sfdisk = &self.tools.config().sfdisk;
        let result = self
            .tools
            .run_unchecked(sfdisk, vec!["--json".into(), device.to_string_lossy().into_owned()])?;

        if !result.success() {
            let output = result.combined_output();
            if output.contains(NO_TABLE_MARKER) {
                debug!(device = %device.display(), "no partition table");
                return Ok(None);
            }
            return Err(DiskError::tool_failed(sfdisk.as_str(), output));
        }
        if result.stdout.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }

        let table = parse_sfdisk_json(&result.stdout_lossy(), logical_sector_size, physical_sector_size)?;
        debug!(device = %device.display(), kind = %table.kind, partitions = table.records.len(), "read partition table");
        Ok(Some(table))
    }

    fn write(&self, device: &Path, table: &PartitionTable, total_bytes: u64) -> DiskResult<()> {
        let script = render_sfdisk_script(table, total_bytes)?;
        let sfdisk = self.tools.config().sfdisk.clone();
        self.tools.run_with_input(
            &sfdisk,
            vec![
                "--no-reread".into(),
                "--no-tell-kernel".into(),
                device.to_string_lossy().into_owned(),
            ],
            script.as_bytes(),
        )?;
        info!(device = %device.display(), kind = %table.kind, partitions = table.records.len(), "wrote partition table");
        Ok(())
    }
}
