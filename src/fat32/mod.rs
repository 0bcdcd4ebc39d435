//! FAT32 formatter: lays a fresh bootable filesystem onto a block device
//! and supports streaming file writes into the freshly formatted volume.
//!
//! All geometry lives in the formatter context; there is no module state.

use bytemuck::bytes_of;
use checked_num::CheckedU64;
use derive_builder::Builder;
use log::debug;

use crate::device::{BlockDevice, SectorAdapter};
use crate::error::{FsError, Result, try_zeroed_buffer};
use crate::fat32::boot::{
    BACKUP_BOOT_SECTOR, FAT32_EOC, FAT32_MEDIA_ENTRY, FS_INFO_SECTOR, Fat32BootSector,
    FsInfoSector, ROOT_CLUSTER,
};
use crate::layout::{put_u32, read_u32};

pub(crate) mod boot;
pub(crate) mod dir;

/// FAT32 requires this many data clusters, or other drivers will treat the
/// volume as FAT16.
const MIN_CLUSTERS: u64 = 65525;
/// Fixed reserved region, in sectors.
const RESERVED_SECTORS: u32 = 32;
/// Bulk zeroing writes this many bytes per transfer.
const ZERO_CHUNK: usize = 64 * 1024;

/// Formatting options. The defaults produce the workstation's standard
/// rescue volume.
#[derive(Builder, Copy, Clone, Debug)]
#[builder(build_fn(validate = "Self::validate"))]
pub struct Fat32FormatOptions {
    /// Logical sector size. Must be a power of two between 512 and 4096.
    #[builder(default = 512)]
    bytes_per_sector: u16,
    /// Space-padded 11-byte volume label.
    #[builder(default = *b"SURVIVAL   ")]
    volume_label: [u8; 11],
    /// Fixed volume serial; reproducible images beat unique ones here.
    #[builder(default = 0x5355_5256)]
    volume_id: u32,
}

impl Fat32FormatOptionsBuilder {
    fn validate(&self) -> core::result::Result<(), String> {
        if let Some(bps) = self.bytes_per_sector {
            if !bps.is_power_of_two() || !(512..=4096).contains(&bps) {
                return Err(
                    "bytes per sector must be a power of two between 512 and 4096".to_string(),
                );
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Fat32Geometry {
    pub bytes_per_sector: u32,
    pub total_sectors: u32,
    pub sectors_per_cluster: u32,
    pub reserved_sectors: u32,
    pub fat_size_sectors: u32,
    pub cluster_count: u32,
}

impl Fat32Geometry {
    /// Picks the largest cluster size in {8,4,2,1} sectors that still
    /// yields a FAT32-sized cluster count, then settles the FAT size.
    fn select(total_sectors: u64, bytes_per_sector: u32) -> Result<Self> {
        for sectors_per_cluster in [8u64, 4, 2, 1] {
            let approx_clusters =
                total_sectors.saturating_sub(RESERVED_SECTORS as u64) / sectors_per_cluster;
            let fat_bytes = (CheckedU64::new(approx_clusters) + 2) * 4;
            let fat_size = fat_bytes
                .ok_or(FsError::InvalidArgument("volume too large"))?
                .div_ceil(bytes_per_sector as u64);
            let data_sectors = total_sectors
                .saturating_sub(RESERVED_SECTORS as u64)
                .saturating_sub(2 * fat_size);
            let cluster_count = data_sectors / sectors_per_cluster;
            if cluster_count >= MIN_CLUSTERS {
                return Ok(Self {
                    bytes_per_sector,
                    total_sectors: total_sectors
                        .try_into()
                        .map_err(|_| FsError::InvalidArgument("volume too large"))?,
                    sectors_per_cluster: sectors_per_cluster as u32,
                    reserved_sectors: RESERVED_SECTORS,
                    fat_size_sectors: fat_size as u32,
                    cluster_count: cluster_count as u32,
                });
            }
        }
        Err(FsError::InvalidArgument("volume too small for FAT32"))
    }

    pub(crate) fn bytes_per_cluster(&self) -> usize {
        self.bytes_per_sector as usize * self.sectors_per_cluster as usize
    }

    fn data_start(&self) -> u32 {
        self.reserved_sectors + 2 * self.fat_size_sectors
    }

    pub(crate) fn cluster_sector(&self, cluster: u32) -> u64 {
        self.data_start() as u64 + (cluster as u64 - 2) * self.sectors_per_cluster as u64
    }
}

/// Formatter context: device adapter, settled geometry, and the next-free
/// cluster counter that backs sequential allocation.
pub struct Fat32Formatter<D: BlockDevice> {
    adapter: SectorAdapter<D>,
    geo: Fat32Geometry,
    opts: Fat32FormatOptions,
    next_free: u32,
}

impl<D: BlockDevice> Fat32Formatter<D> {
    pub fn new(device: D, opts: Fat32FormatOptions) -> Result<Self> {
        let adapter = SectorAdapter::new(device, opts.bytes_per_sector as u32)?;
        let geo = Fat32Geometry::select(adapter.total_sectors(), opts.bytes_per_sector as u32)?;
        debug!(
            "fat32: {} sectors, {} per cluster, {} clusters, fat {} sectors",
            geo.total_sectors, geo.sectors_per_cluster, geo.cluster_count, geo.fat_size_sectors
        );
        Ok(Self {
            adapter,
            geo,
            opts,
            next_free: 3,
        })
    }

    /// Writes the complete filesystem skeleton: reserved region, BPB and
    /// its backup, FSInfo, both FATs, and a root directory holding only the
    /// volume label entry.
    pub fn format(&mut self) -> Result<()> {
        self.zero_sectors(0, RESERVED_SECTORS as u64)?;

        let boot = Fat32BootSector::new(&self.geo, self.opts.volume_label, self.opts.volume_id);
        self.write_boot_struct(0, bytes_of(&boot))?;
        self.write_boot_struct(BACKUP_BOOT_SECTOR as u64, bytes_of(&boot))?;

        let fs_info = FsInfoSector::new(self.geo.cluster_count - 1, 3);
        self.write_boot_struct(FS_INFO_SECTOR as u64, bytes_of(&fs_info))?;

        // Both FAT copies, zeroed in bulk.
        let fat_sectors = self.geo.fat_size_sectors as u64;
        self.zero_sectors(self.geo.reserved_sectors as u64, 2 * fat_sectors)?;
        self.fat_set(0, FAT32_MEDIA_ENTRY)?;
        self.fat_set(1, FAT32_EOC)?;
        // Root directory chain: a single cluster, terminated.
        self.fat_set(ROOT_CLUSTER, FAT32_MEDIA_ENTRY)?;

        self.zero_sectors(
            self.geo.cluster_sector(ROOT_CLUSTER),
            self.geo.sectors_per_cluster as u64,
        )?;
        let label = dir::volume_label_entry(self.opts.volume_label);
        self.write_dir_slot(self.geo.cluster_sector(ROOT_CLUSTER), 0, &label)?;

        self.next_free = 3;
        Ok(())
    }

    pub fn into_device(self) -> D {
        self.adapter.into_inner()
    }

    /// Boot structures are 512 bytes; on a larger logical sector they sit
    /// at the front of a zero-padded sector.
    fn write_boot_struct(&mut self, sector: u64, bytes: &[u8]) -> Result<()> {
        let bps = self.geo.bytes_per_sector as usize;
        if bytes.len() == bps {
            return self.adapter.write_sectors(sector, bytes);
        }
        let mut buf = try_zeroed_buffer(bps)?;
        buf[..bytes.len()].copy_from_slice(bytes);
        self.adapter.write_sectors(sector, &buf)
    }

    /// Updates one FAT entry in both copies.
    pub(crate) fn fat_set(&mut self, index: u32, value: u32) -> Result<()> {
        let bps = self.geo.bytes_per_sector as u64;
        let byte = index as u64 * 4;
        for copy in 0..2u64 {
            let sector = self.geo.reserved_sectors as u64
                + copy * self.geo.fat_size_sectors as u64
                + byte / bps;
            let mut buf = try_zeroed_buffer(bps as usize)?;
            self.adapter.read_sectors(sector, &mut buf)?;
            put_u32(&mut buf, (byte % bps) as usize, value);
            self.adapter.write_sectors(sector, &buf)?;
        }
        Ok(())
    }

    pub(crate) fn fat_get(&mut self, index: u32) -> Result<u32> {
        let bps = self.geo.bytes_per_sector as u64;
        let byte = index as u64 * 4;
        let sector = self.geo.reserved_sectors as u64 + byte / bps;
        let mut buf = try_zeroed_buffer(bps as usize)?;
        self.adapter.read_sectors(sector, &mut buf)?;
        read_u32(&buf, (byte % bps) as usize)
    }

    /// Sequential cluster allocation off the next-free counter. The chain
    /// is linked forward in the FAT and terminated.
    pub(crate) fn alloc_chain(&mut self, count: u32) -> Result<u32> {
        debug_assert!(count > 0);
        let first = self.next_free;
        let last = first
            .checked_add(count - 1)
            .ok_or(FsError::NoSpace)?;
        if last >= self.geo.cluster_count + 2 {
            return Err(FsError::NoSpace);
        }
        for cluster in first..last {
            self.fat_set(cluster, cluster + 1)?;
        }
        self.fat_set(last, FAT32_EOC)?;
        self.next_free = last + 1;
        Ok(first)
    }

    pub(crate) fn zero_sectors(&mut self, first_sector: u64, count: u64) -> Result<()> {
        let bps = self.geo.bytes_per_sector as usize;
        let chunk_sectors = (ZERO_CHUNK / bps).max(1) as u64;
        let zeroes = try_zeroed_buffer(chunk_sectors as usize * bps)?;
        let mut sector = first_sector;
        let mut remaining = count;
        while remaining > 0 {
            let n = remaining.min(chunk_sectors);
            self.adapter
                .write_sectors(sector, &zeroes[..n as usize * bps])?;
            sector += n;
            remaining -= n;
        }
        Ok(())
    }

    /// Writes one 32-byte directory entry at `slot` within the sector run
    /// starting at `first_sector`.
    pub(crate) fn write_dir_slot(
        &mut self,
        first_sector: u64,
        slot: usize,
        entry: &[u8; 32],
    ) -> Result<()> {
        let bps = self.geo.bytes_per_sector as usize;
        let sector = first_sector + (slot * 32 / bps) as u64;
        let offset = (slot * 32) % bps;
        let mut buf = try_zeroed_buffer(bps)?;
        self.adapter.read_sectors(sector, &mut buf)?;
        buf[offset..offset + 32].copy_from_slice(entry);
        self.adapter.write_sectors(sector, &buf)
    }

    pub(crate) fn read_dir_sector(&mut self, sector: u64) -> Result<Vec<u8>> {
        let mut buf = try_zeroed_buffer(self.geo.bytes_per_sector as usize)?;
        self.adapter.read_sectors(sector, &mut buf)?;
        Ok(buf)
    }

    pub(crate) fn write_sectors_raw(&mut self, sector: u64, buf: &[u8]) -> Result<()> {
        self.adapter.write_sectors(sector, buf)
    }

    pub(crate) fn geometry(&self) -> &Fat32Geometry {
        &self.geo
    }
}
