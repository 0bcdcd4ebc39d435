//! FAT chain access for the exFAT driver.
//!
//! The FAT holds one 32-bit entry per cluster; chained files link forward
//! through it, NoFatChain files never touch it. Entry reads and writes go
//! through the sector cache, one entry at a time.

use crate::device::BlockDevice;
use crate::error::{FsError, Result};
use crate::exfat::ExFatVolume;
use crate::layout::{put_u32, read_u32};

pub(crate) const FAT_FREE: u32 = 0x0000_0000;
pub(crate) const FAT_BAD: u32 = 0xffff_fff7;
pub(crate) const FAT_EOC: u32 = 0xffff_ffff;

impl<D: BlockDevice> ExFatVolume<D> {
    fn fat_entry_location(&self, cluster: u32) -> (u64, usize) {
        let byte = self.geo.fat_offset as u64 * self.geo.bytes_per_sector as u64
            + cluster as u64 * 4;
        (
            byte / self.geo.bytes_per_sector as u64,
            (byte % self.geo.bytes_per_sector as u64) as usize,
        )
    }

    pub(crate) fn fat_get(&mut self, cluster: u32) -> Result<u32> {
        if !self.geo.cluster_in_range(cluster) {
            return Err(FsError::Corrupt("FAT lookup outside the cluster heap"));
        }
        let (sector, offset) = self.fat_entry_location(cluster);
        read_u32(self.cache.read(sector)?, offset)
    }

    pub(crate) fn fat_set(&mut self, cluster: u32, value: u32) -> Result<()> {
        if !self.geo.cluster_in_range(cluster) {
            return Err(FsError::Corrupt("FAT update outside the cluster heap"));
        }
        let (sector, offset) = self.fat_entry_location(cluster);
        put_u32(self.cache.read_mut(sector)?, offset, value);
        Ok(())
    }

    /// Collects the clusters of an allocation in chain order. NoFatChain
    /// allocations are consecutive runs sized by `data_length`; chained ones
    /// follow the FAT to end-of-chain. The walk is bounded by the heap size
    /// so a corrupt cyclic chain cannot spin forever.
    pub(crate) fn collect_chain(
        &mut self,
        first_cluster: u32,
        no_fat_chain: bool,
        data_length: u64,
    ) -> Result<Vec<u32>> {
        if first_cluster == 0 {
            return Ok(Vec::new());
        }
        if !self.geo.cluster_in_range(first_cluster) {
            return Err(FsError::Corrupt("allocation starts outside the heap"));
        }

        if no_fat_chain {
            let count = data_length.div_ceil(self.geo.bytes_per_cluster()).max(1) as u32;
            if !self.geo.cluster_in_range(first_cluster + count - 1) {
                return Err(FsError::Corrupt("contiguous run leaves the heap"));
            }
            return Ok((first_cluster..first_cluster + count).collect());
        }

        let mut chain = Vec::new();
        let mut cluster = first_cluster;
        loop {
            chain.push(cluster);
            if chain.len() as u64 > self.geo.cluster_count as u64 {
                return Err(FsError::Corrupt("cluster chain loops"));
            }
            let next = self.fat_get(cluster)?;
            if next == FAT_EOC {
                return Ok(chain);
            }
            if next == FAT_FREE || next == FAT_BAD || !self.geo.cluster_in_range(next) {
                return Err(FsError::Corrupt("cluster chain is broken"));
            }
            cluster = next;
        }
    }
}
