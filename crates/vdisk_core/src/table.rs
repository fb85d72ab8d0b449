//! In-memory partition table model
//!
//! A [`PartitionTable`] is what the codec reads from and writes to a device:
//! its kind, sector sizes and the raw records, sorted by start sector.
//! [`PartitionType`] is the unified type value shared by both table kinds;
//! its GPT and MBR encodings live in one lookup table so that every call
//! site resolves them the same way.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DiskError, DiskResult};

/// Sectors at the start of every disk that never hold a partition.
pub const HEAD_SECTORS: u64 = 2048;

/// Size of the EFI System Partition region GPT images reserve after the head.
pub const EFI_SYSTEM_BYTES: u64 = 100 * 1024 * 1024;

/// Primary entries an MBR can hold.
pub const MBR_MAX_PARTITIONS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableKind {
    Gpt,
    Mbr,
}

impl TableKind {
    /// First sector a user partition may occupy.
    pub fn reserved_sectors(self, sector_size: u64) -> u64 {
        match self {
            TableKind::Mbr => HEAD_SECTORS,
            TableKind::Gpt => HEAD_SECTORS + EFI_SYSTEM_BYTES / sector_size,
        }
    }

    pub fn max_partitions(self) -> Option<usize> {
        match self {
            TableKind::Mbr => Some(MBR_MAX_PARTITIONS),
            TableKind::Gpt => None,
        }
    }
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableKind::Gpt => f.write_str("GPT"),
            TableKind::Mbr => f.write_str("MBR"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartitionType {
    EfiSystem,
    BiosBoot,
    LinuxFilesystem,
    LinuxSwap,
    LinuxLvm,
    LinuxRaid,
    LinuxRootX86_64,
    MicrosoftBasicData,
    Fat32Lba,
    Extended,
    /// Read from a device but not recognised; never written back.
    Unknown,
}

struct TypeEncoding {
    partition_type: PartitionType,
    gpt: Option<&'static str>,
    mbr: Option<u8>,
}

const TYPE_ENCODINGS: &[TypeEncoding] = &[
    TypeEncoding {
        partition_type: PartitionType::EfiSystem,
        gpt: Some("C12A7328-F81F-11D2-BA4B-00A0C93EC93B"),
        mbr: Some(0xEF),
    },
    TypeEncoding {
        partition_type: PartitionType::BiosBoot,
        gpt: Some("21686148-6449-6E6F-744E-656564454649"),
        mbr: None,
    },
    TypeEncoding {
        partition_type: PartitionType::LinuxFilesystem,
        gpt: Some("0FC63DAF-8483-4772-8E79-3D69D8477DE4"),
        mbr: Some(0x83),
    },
    TypeEncoding {
        partition_type: PartitionType::LinuxSwap,
        gpt: Some("0657FD6D-A4AB-43C4-84E5-0933C84B4F4F"),
        mbr: Some(0x82),
    },
    TypeEncoding {
        partition_type: PartitionType::LinuxLvm,
        gpt: Some("E6D6D379-F507-44C2-A23C-238F2A3DF928"),
        mbr: Some(0x8E),
    },
    TypeEncoding {
        partition_type: PartitionType::LinuxRaid,
        gpt: Some("A19D880F-05FC-4D3B-A006-743F0F84911E"),
        mbr: Some(0xFD),
    },
    TypeEncoding {
        partition_type: PartitionType::LinuxRootX86_64,
        gpt: Some("4F68BCE3-E8CD-4DB1-96E7-FBCAF984B709"),
        mbr: None,
    },
    TypeEncoding {
        partition_type: PartitionType::MicrosoftBasicData,
        gpt: Some("EBD0A0A2-B9E5-4433-87C0-68B6B72699C7"),
        mbr: Some(0x07),
    },
    TypeEncoding {
        partition_type: PartitionType::Fat32Lba,
        gpt: None,
        mbr: Some(0x0C),
    },
    TypeEncoding {
        partition_type: PartitionType::Extended,
        gpt: None,
        mbr: Some(0x05),
    },
];

/// A partition type resolved for one table kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCode {
    Guid(&'static str),
    Byte(u8),
}

impl PartitionType {
    fn encoding(self) -> Option<&'static TypeEncoding> {
        TYPE_ENCODINGS.iter().find(|e| e.partition_type == self)
    }

    pub fn gpt_guid(self) -> Option<&'static str> {
        self.encoding().and_then(|e| e.gpt)
    }

    pub fn mbr_byte(self) -> Option<u8> {
        self.encoding().and_then(|e| e.mbr)
    }

    /// Encoding for `kind`, or `UnsupportedPartitionType` if it has none.
    pub fn code_for(self, kind: TableKind) -> DiskResult<TypeCode> {
        let code = match kind {
            TableKind::Gpt => self.gpt_guid().map(TypeCode::Guid),
            TableKind::Mbr => self.mbr_byte().map(TypeCode::Byte),
        };
        code.ok_or(DiskError::UnsupportedPartitionType {
            partition_type: self,
            kind,
        })
    }

    pub fn from_gpt_guid(guid: &str) -> Self {
        TYPE_ENCODINGS
            .iter()
            .find(|e| e.gpt.map_or(false, |g| g.eq_ignore_ascii_case(guid)))
            .map(|e| e.partition_type)
            .unwrap_or(PartitionType::Unknown)
    }

    pub fn from_mbr_byte(byte: u8) -> Self {
        TYPE_ENCODINGS
            .iter()
            .find(|e| e.mbr == Some(byte))
            .map(|e| e.partition_type)
            .unwrap_or(PartitionType::Unknown)
    }
}

/// Inclusive sector range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SectorRange {
    pub start: u64,
    pub end: u64,
}

impl SectorRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn sectors(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn overlaps(&self, other: &SectorRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// One raw entry as stored in the on-device table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionRecord {
    pub start_sector: u64,
    pub end_sector: u64,
    pub partition_type: PartitionType,
    pub name: String,
    pub bootable: bool,
}

impl PartitionRecord {
    pub fn range(&self) -> SectorRange {
        SectorRange::new(self.start_sector, self.end_sector)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTable {
    pub kind: TableKind,
    pub logical_sector_size: u64,
    pub physical_sector_size: u64,
    pub records: Vec<PartitionRecord>,
}

impl PartitionTable {
    pub fn new(kind: TableKind, logical_sector_size: u64, physical_sector_size: u64) -> Self {
        Self {
            kind,
            logical_sector_size,
            physical_sector_size,
            records: Vec::new(),
        }
    }

    /// Sort records by start sector and reject overlaps. Codecs call this on
    /// whatever they read so the rest of the engine can rely on the order.
    pub fn normalize(&mut self) -> DiskResult<()> {
        self.records.sort_by_key(|r| r.start_sector);
        for pair in self.records.windows(2) {
            if pair[0].range().overlaps(&pair[1].range()) {
                return Err(DiskError::OverlappingPartition {
                    start: pair[1].start_sector,
                    end: pair[1].end_sector,
                });
            }
        }
        Ok(())
    }

    /// Every record has an encoding for this table kind.
    pub fn check_encodable(&self) -> DiskResult<()> {
        for record in &self.records {
            record.partition_type.code_for(self.kind)?;
        }
        if let Some(max) = self.kind.max_partitions() {
            if self.records.len() > max {
                return Err(DiskError::TableFull {
                    kind: self.kind,
                    max,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(start: u64, end: u64) -> PartitionRecord {
        PartitionRecord {
            start_sector: start,
            end_sector: end,
            partition_type: PartitionType::LinuxFilesystem,
            name: String::new(),
            bootable: false,
        }
    }

    #[test]
    fn test_reserved_sectors() {
        assert_eq!(TableKind::Mbr.reserved_sectors(512), 2048);
        assert_eq!(TableKind::Gpt.reserved_sectors(512), 206848);
        assert_eq!(TableKind::Gpt.reserved_sectors(4096), 2048 + 25600);
    }

    #[test]
    fn test_type_lookup_both_ways() {
        assert_eq!(
            PartitionType::LinuxFilesystem.code_for(TableKind::Mbr).unwrap(),
            TypeCode::Byte(0x83)
        );
        assert_eq!(
            PartitionType::from_gpt_guid("c12a7328-f81f-11d2-ba4b-00a0c93ec93b"),
            PartitionType::EfiSystem
        );
        assert_eq!(PartitionType::from_mbr_byte(0x0C), PartitionType::Fat32Lba);
        assert_eq!(PartitionType::from_mbr_byte(0x42), PartitionType::Unknown);
    }

    #[test]
    fn test_missing_encoding_is_unsupported() {
        let err = PartitionType::BiosBoot.code_for(TableKind::Mbr).unwrap_err();
        assert!(matches!(
            err,
            DiskError::UnsupportedPartitionType {
                partition_type: PartitionType::BiosBoot,
                kind: TableKind::Mbr
            }
        ));
        assert!(PartitionType::Extended.code_for(TableKind::Gpt).is_err());
        assert!(PartitionType::Unknown.code_for(TableKind::Gpt).is_err());
    }

    #[test]
    fn test_every_known_type_has_some_encoding() {
        for encoding in TYPE_ENCODINGS {
            assert!(encoding.gpt.is_some() || encoding.mbr.is_some());
        }
    }

    #[test]
    fn test_range_overlap() {
        let a = SectorRange::new(10, 20);
        assert!(a.overlaps(&SectorRange::new(20, 30)));
        assert!(a.overlaps(&SectorRange::new(0, 10)));
        assert!(!a.overlaps(&SectorRange::new(21, 30)));
        assert_eq!(a.sectors(), 11);
    }

    #[test]
    fn test_normalize_sorts_and_rejects_overlap() {
        let mut table = PartitionTable::new(TableKind::Gpt, 512, 512);
        table.records = vec![record(5000, 6000), record(2048, 4999)];
        table.normalize().unwrap();
        assert_eq!(table.records[0].start_sector, 2048);

        table.records.push(record(5500, 7000));
        assert!(matches!(
            table.normalize(),
            Err(DiskError::OverlappingPartition { .. })
        ));
    }

    #[test]
    fn test_mbr_table_full() {
        let mut table = PartitionTable::new(TableKind::Mbr, 512, 512);
        table.records = (0..5).map(|i| record(2048 + i * 100, 2048 + i * 100 + 99)).collect();
        assert!(matches!(
            table.check_encodable(),
            Err(DiskError::TableFull { max: 4, .. })
        ));
    }
}
