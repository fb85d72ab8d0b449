//! Partition placement
//!
//! First-fit search over the sorted partition list of one image. The
//! allocator only computes where a partition goes; inserting it and
//! renumbering the list is done by the image.

use crate::error::{DiskError, DiskResult};
use crate::table::{SectorRange, TableKind, HEAD_SECTORS};

/// Sectors at the end of a GPT disk holding the backup header and entries.
pub const GPT_BACKUP_SECTORS: u64 = 33;

/// Shape of the disk a partition is being placed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub kind: TableKind,
    pub sector_size: u64,
    pub virtual_size: u64,
    /// Rounding unit for percentage sizes.
    pub block_size: u64,
}

impl Geometry {
    pub fn total_sectors(&self) -> u64 {
        self.virtual_size / self.sector_size
    }

    pub fn reserved_sectors(&self) -> u64 {
        self.kind.reserved_sectors(self.sector_size)
    }

    pub fn reserved_bytes(&self) -> u64 {
        self.reserved_sectors() * self.sector_size
    }

    /// Last sector a partition may end on.
    pub fn last_usable_sector(&self) -> u64 {
        let tail = match self.kind {
            TableKind::Gpt => GPT_BACKUP_SECTORS,
            TableKind::Mbr => 0,
        };
        self.total_sectors().saturating_sub(tail + 1)
    }

    pub fn sectors_for(&self, bytes: u64) -> u64 {
        (bytes + self.sector_size - 1) / self.sector_size
    }
}

/// Where a new partition goes: its range and its position in the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub position: usize,
    pub range: SectorRange,
}

/// First free range of `size_bytes` at or after the reserved boundary.
///
/// `existing` must be sorted by start sector and non-overlapping.
pub fn place(geometry: &Geometry, existing: &[SectorRange], size_bytes: u64) -> DiskResult<Placement> {
    let size = geometry.sectors_for(size_bytes).max(1);
    let mut start = geometry.reserved_sectors();
    let mut position = existing.len();

    for (i, range) in existing.iter().enumerate() {
        let candidate = SectorRange::new(start, start + size - 1);
        if range.end < candidate.start {
            continue;
        }
        if candidate.overlaps(range) {
            start = range.end + 1;
            continue;
        }
        position = i;
        break;
    }

    let mut end = start + size - 1;
    if end == geometry.total_sectors() {
        end -= 1;
    }

    if end > geometry.last_usable_sector() || (end + 1) * geometry.sector_size > geometry.virtual_size {
        return Err(DiskError::SizeExceedsExtents {
            requested: size_bytes,
            available: geometry
                .last_usable_sector()
                .saturating_sub(start)
                .saturating_add(1)
                * geometry.sector_size,
        });
    }

    Ok(Placement {
        position,
        range: SectorRange::new(start, end),
    })
}

/// Validate a caller-chosen range; no searching.
pub fn place_at(geometry: &Geometry, existing: &[SectorRange], range: SectorRange) -> DiskResult<Placement> {
    if range.end < range.start || range.start < HEAD_SECTORS {
        return Err(DiskError::OverlappingPartition {
            start: range.start,
            end: range.end,
        });
    }
    if range.end > geometry.last_usable_sector() {
        return Err(DiskError::SizeExceedsExtents {
            requested: range.sectors() * geometry.sector_size,
            available: geometry
                .last_usable_sector()
                .saturating_sub(range.start)
                .saturating_add(1)
                * geometry.sector_size,
        });
    }
    if existing.iter().any(|r| r.overlaps(&range)) {
        return Err(DiskError::OverlappingPartition {
            start: range.start,
            end: range.end,
        });
    }

    let position = existing.iter().take_while(|r| r.start < range.start).count();
    Ok(Placement { position, range })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MIB: u64 = 1024 * 1024;

    fn gpt_400() -> Geometry {
        Geometry {
            kind: TableKind::Gpt,
            sector_size: 512,
            virtual_size: 400 * MIB,
            block_size: 65536,
        }
    }

    fn mbr_400() -> Geometry {
        Geometry {
            kind: TableKind::Mbr,
            ..gpt_400()
        }
    }

    #[test]
    fn test_first_partition_starts_at_reserved_boundary() {
        let geometry = gpt_400();
        let placement = place(&geometry, &[], 10 * MIB).unwrap();
        assert_eq!(placement.position, 0);
        assert_eq!(placement.range.start, 206848);
        assert_eq!(placement.range.sectors(), 10 * MIB / 512);
    }

    #[test]
    fn test_skips_partition_below_boundary() {
        let geometry = gpt_400();
        let efi = SectorRange::new(2048, 206847);
        let placement = place(&geometry, &[efi], MIB).unwrap();
        assert_eq!(placement.position, 1);
        assert_eq!(placement.range.start, 206848);
    }

    #[test]
    fn test_fills_gap_between_partitions() {
        let geometry = mbr_400();
        let first = SectorRange::new(2048, 4095);
        let last = SectorRange::new(10240, 20479);
        let placement = place(&geometry, &[first, last], 2 * MIB).unwrap();
        assert_eq!(placement.position, 1);
        assert_eq!(placement.range, SectorRange::new(4096, 8191));
    }

    #[test]
    fn test_skips_gap_that_is_too_small() {
        let geometry = mbr_400();
        let first = SectorRange::new(2048, 4095);
        let last = SectorRange::new(5000, 20479);
        let placement = place(&geometry, &[first, last], 2 * MIB).unwrap();
        assert_eq!(placement.position, 2);
        assert_eq!(placement.range.start, 20480);
    }

    #[test]
    fn test_rejects_when_no_room_left() {
        let geometry = mbr_400();
        let big = SectorRange::new(2048, geometry.total_sectors() - 100);
        assert!(matches!(
            place(&geometry, &[big], MIB),
            Err(DiskError::SizeExceedsExtents { .. })
        ));
    }

    #[test]
    fn test_end_equal_to_total_is_shrunk() {
        let geometry = mbr_400();
        let total = geometry.total_sectors();
        // ask for exactly one sector more than what fits from the boundary
        let bytes = (total - 2048 + 1) * 512;
        let placement = place(&geometry, &[], bytes).unwrap();
        assert_eq!(placement.range.end, total - 1);
    }

    #[test]
    fn test_place_at_rejects_overlap_without_search() {
        let geometry = gpt_400();
        let existing = [SectorRange::new(206848, 300000)];
        let err = place_at(&geometry, &existing, SectorRange::new(299000, 310000)).unwrap_err();
        assert!(matches!(err, DiskError::OverlappingPartition { .. }));
    }

    #[test]
    fn test_place_at_rejects_head_region() {
        let geometry = mbr_400();
        let err = place_at(&geometry, &[], SectorRange::new(0, 4095)).unwrap_err();
        assert!(matches!(err, DiskError::OverlappingPartition { .. }));
    }

    #[test]
    fn test_place_at_rejects_gpt_backup_area() {
        let geometry = gpt_400();
        let total = geometry.total_sectors();
        let err = place_at(&geometry, &[], SectorRange::new(206848, total - 1)).unwrap_err();
        assert!(matches!(err, DiskError::SizeExceedsExtents { .. }));
    }

    #[test]
    fn test_place_at_position() {
        let geometry = gpt_400();
        let existing = [SectorRange::new(2048, 206847), SectorRange::new(400000, 500000)];
        let placement = place_at(&geometry, &existing, SectorRange::new(206848, 300000)).unwrap();
        assert_eq!(placement.position, 1);
    }

    proptest! {
        #[test]
        fn prop_placements_never_overlap(sizes in proptest::collection::vec(1u64..64, 1..12)) {
            let geometry = gpt_400();
            let mut ranges: Vec<SectorRange> = Vec::new();
            for mib in sizes {
                match place(&geometry, &ranges, mib * MIB) {
                    Ok(p) => {
                        prop_assert!(ranges.iter().all(|r| !r.overlaps(&p.range)));
                        prop_assert!(p.range.start >= geometry.reserved_sectors());
                        prop_assert!(p.range.end <= geometry.last_usable_sector());
                        ranges.insert(p.position, p.range);
                        prop_assert!(ranges.windows(2).all(|w| w[0].end < w[1].start));
                    }
                    Err(DiskError::SizeExceedsExtents { .. }) => {}
                    Err(other) => prop_assert!(false, "unexpected error {other}"),
                }
            }
        }
    }
}
