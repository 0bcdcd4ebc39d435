//! FAT32 on-disk structures the formatter emits.
//!
//! These are written, never parsed: the layouts are fixed by construction
//! and serialized with `bytemuck`. All multi-byte fields are stored
//! little-endian.

use bytemuck::{Pod, Zeroable};

use crate::fat32::Fat32Geometry;

pub(crate) const BOOT_SIGNATURE: u16 = 0xaa55;
pub(crate) const EXT_BOOT_SIGNATURE: u8 = 0x29;
pub(crate) const MEDIA_FIXED: u8 = 0xf8;
pub(crate) const BACKUP_BOOT_SECTOR: u16 = 6;
pub(crate) const FS_INFO_SECTOR: u16 = 1;
pub(crate) const ROOT_CLUSTER: u32 = 2;

pub(crate) const FS_INFO_LEAD_SIGNATURE: u32 = 0x4161_5252;
pub(crate) const FS_INFO_STRUCT_SIGNATURE: u32 = 0x6141_7272;
pub(crate) const FS_INFO_TRAIL_SIGNATURE: u32 = 0xaa55_0000;

/// FAT32 end-of-chain marker written for allocated tails.
pub(crate) const FAT32_EOC: u32 = 0x0fff_ffff;
/// Media-descriptor echo stored in FAT[0].
pub(crate) const FAT32_MEDIA_ENTRY: u32 = 0x0fff_fff8;

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct Fat32BootSector {
    pub jump: [u8; 3],
    pub oem: [u8; 8],
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub num_fats: u8,
    pub root_entries: u16,
    pub total_sectors_16: u16,
    pub media: u8,
    pub fat_size_16: u16,
    pub sectors_per_track: u16,
    pub num_heads: u16,
    pub hidden_sectors: u32,
    pub total_sectors_32: u32,
    pub fat_size_32: u32,
    pub ext_flags: u16,
    pub fs_version: u16,
    pub root_cluster: u32,
    pub fs_info_sector: u16,
    pub backup_boot_sector: u16,
    pub reserved: [u8; 12],
    pub drive_number: u8,
    pub reserved1: u8,
    pub ext_boot_signature: u8,
    pub volume_id: u32,
    pub volume_label: [u8; 11],
    pub fs_type: [u8; 8],
    pub boot_code: [u8; 420],
    pub boot_signature: u16,
}

impl Fat32BootSector {
    pub(crate) fn new(geo: &Fat32Geometry, label: [u8; 11], volume_id: u32) -> Self {
        Self {
            jump: [0xeb, 0x58, 0x90],
            oem: *b"SURVIVAL",
            bytes_per_sector: (geo.bytes_per_sector as u16).to_le(),
            sectors_per_cluster: geo.sectors_per_cluster as u8,
            reserved_sectors: (geo.reserved_sectors as u16).to_le(),
            num_fats: 2,
            root_entries: 0,
            total_sectors_16: 0,
            media: MEDIA_FIXED,
            fat_size_16: 0,
            sectors_per_track: 63u16.to_le(),
            num_heads: 255u16.to_le(),
            hidden_sectors: 0,
            total_sectors_32: geo.total_sectors.to_le(),
            fat_size_32: geo.fat_size_sectors.to_le(),
            ext_flags: 0,
            fs_version: 0,
            root_cluster: ROOT_CLUSTER.to_le(),
            fs_info_sector: FS_INFO_SECTOR.to_le(),
            backup_boot_sector: BACKUP_BOOT_SECTOR.to_le(),
            reserved: [0; 12],
            drive_number: 0x80,
            reserved1: 0,
            ext_boot_signature: EXT_BOOT_SIGNATURE,
            volume_id: volume_id.to_le(),
            volume_label: label,
            fs_type: *b"FAT32   ",
            boot_code: [0; 420],
            boot_signature: BOOT_SIGNATURE.to_le(),
        }
    }
}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct FsInfoSector {
    pub lead_signature: u32,
    pub reserved: [u8; 480],
    pub struct_signature: u32,
    pub free_count: u32,
    pub next_free: u32,
    pub reserved2: [u8; 12],
    pub trail_signature: u32,
}

impl FsInfoSector {
    pub(crate) fn new(free_count: u32, next_free: u32) -> Self {
        Self {
            lead_signature: FS_INFO_LEAD_SIGNATURE.to_le(),
            reserved: [0; 480],
            struct_signature: FS_INFO_STRUCT_SIGNATURE.to_le(),
            free_count: free_count.to_le(),
            next_free: next_free.to_le(),
            reserved2: [0; 12],
            trail_signature: FS_INFO_TRAIL_SIGNATURE.to_le(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structures_are_sector_sized() {
        assert_eq!(size_of::<Fat32BootSector>(), 512);
        assert_eq!(size_of::<FsInfoSector>(), 512);
    }

    #[test]
    fn boot_sector_fields_land_at_fixed_offsets() {
        let geo = Fat32Geometry {
            bytes_per_sector: 512,
            total_sectors: 262144,
            sectors_per_cluster: 8,
            reserved_sectors: 32,
            fat_size_sectors: 256,
            cluster_count: 65525,
        };
        let boot = Fat32BootSector::new(&geo, *b"SURVIVAL   ", 0x1234_5678);
        let raw = bytemuck::bytes_of(&boot);
        assert_eq!(&raw[3..11], b"SURVIVAL");
        assert_eq!(u16::from_le_bytes([raw[11], raw[12]]), 512);
        assert_eq!(raw[13], 8);
        assert_eq!(u16::from_le_bytes([raw[14], raw[15]]), 32);
        assert_eq!(raw[16], 2);
        assert_eq!(raw[21], 0xf8);
        assert_eq!(u32::from_le_bytes(raw[44..48].try_into().unwrap()), 2);
        assert_eq!(u16::from_le_bytes([raw[48], raw[49]]), 1);
        assert_eq!(u16::from_le_bytes([raw[50], raw[51]]), 6);
        assert_eq!(raw[66], 0x29);
        assert_eq!(&raw[71..82], b"SURVIVAL   ");
        assert_eq!(&raw[82..90], b"FAT32   ");
        assert_eq!(u16::from_le_bytes([raw[510], raw[511]]), 0xaa55);
    }
}
