//! exFAT boot-sector validation and geometry.

use crate::error::{FsError, Result};
use crate::layout::{read_bytes, read_u8, read_u16, read_u32, read_u64};

/// Volume geometry as the boot sector describes it. Offsets are in sectors,
/// the way the on-disk format counts them.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ExFatGeometry {
    pub bytes_per_sector: u32,
    pub sectors_per_cluster: u32,
    pub fat_offset: u32,
    pub fat_length: u32,
    pub cluster_heap_offset: u32,
    pub cluster_count: u32,
    pub root_cluster: u32,
    pub volume_length: u64,
}

impl ExFatGeometry {
    /// Validates the boot sector and extracts the geometry.
    pub(crate) fn parse(sector: &[u8]) -> Result<Self> {
        if read_bytes(sector, 3, 8)? != b"EXFAT   " {
            return Err(FsError::Corrupt("missing exFAT OEM signature"));
        }
        // The packed FAT BPB region must be zero, or a FAT driver might
        // claim this volume.
        if read_bytes(sector, 11, 53)?.iter().any(|&b| b != 0) {
            return Err(FsError::Corrupt("must-be-zero region is not zero"));
        }
        if read_u16(sector, 510)? != 0xaa55 {
            return Err(FsError::Corrupt("missing boot signature"));
        }

        let bytes_per_sector_shift = read_u8(sector, 108)?;
        if !(9..=12).contains(&bytes_per_sector_shift) {
            return Err(FsError::Corrupt("bytes per sector shift out of range"));
        }
        let sectors_per_cluster_shift = read_u8(sector, 109)?;
        if sectors_per_cluster_shift > 25 - bytes_per_sector_shift {
            return Err(FsError::Corrupt("sectors per cluster shift out of range"));
        }
        let number_of_fats = read_u8(sector, 110)?;
        if number_of_fats != 1 && number_of_fats != 2 {
            return Err(FsError::Corrupt("number of FATs"));
        }

        let fat_offset = read_u32(sector, 80)?;
        if fat_offset < 24 {
            return Err(FsError::Corrupt("FAT overlaps the boot region"));
        }
        let fat_length = read_u32(sector, 84)?;
        let cluster_heap_offset = read_u32(sector, 88)?;
        if (cluster_heap_offset as u64)
            < fat_offset as u64 + fat_length as u64 * number_of_fats as u64
        {
            return Err(FsError::Corrupt("cluster heap overlaps the FAT region"));
        }
        let cluster_count = read_u32(sector, 92)?;
        // 2^32 - 11 is the most clusters a FAT can describe.
        if cluster_count >= 0xffff_fff5 {
            return Err(FsError::Corrupt("cluster count out of range"));
        }
        let root_cluster = read_u32(sector, 96)?;
        if root_cluster < 2 || root_cluster > cluster_count + 1 {
            return Err(FsError::Corrupt("root directory cluster out of range"));
        }

        Ok(Self {
            bytes_per_sector: 1 << bytes_per_sector_shift,
            sectors_per_cluster: 1 << sectors_per_cluster_shift,
            fat_offset,
            fat_length,
            cluster_heap_offset,
            cluster_count,
            root_cluster,
            volume_length: read_u64(sector, 72)?,
        })
    }

    pub(crate) fn bytes_per_cluster(&self) -> u64 {
        self.bytes_per_sector as u64 * self.sectors_per_cluster as u64
    }

    /// First sector of a data cluster. Cluster 2 is the first cluster of
    /// the heap.
    pub(crate) fn cluster_sector(&self, cluster: u32) -> u64 {
        self.cluster_heap_offset as u64
            + (cluster as u64 - 2) * self.sectors_per_cluster as u64
    }

    /// A cluster index is addressable iff it lies inside the heap.
    pub(crate) fn cluster_in_range(&self, cluster: u32) -> bool {
        cluster >= 2 && cluster < self.cluster_count + 2
    }
}
