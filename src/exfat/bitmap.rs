//! exFAT allocation bitmap: one bit per data cluster, bit 0 = cluster 2.
//!
//! The whole bitmap is held in memory for the volume's lifetime and written
//! back through its own cluster chain after every allocation change.

use crate::device::BlockDevice;
use crate::error::{FsError, Result, try_zeroed_buffer};
use crate::exfat::ExFatVolume;
use crate::exfat::fat::{FAT_EOC, FAT_FREE};

#[derive(Default)]
pub(crate) struct AllocBitmap {
    /// Bitmap bytes, padded out to whole clusters for I/O.
    bytes: Vec<u8>,
    /// Clusters storing the bitmap on disk, in chain order.
    chain: Vec<u32>,
    /// Number of meaningful bits.
    cluster_count: u32,
}

impl AllocBitmap {
    pub(crate) fn is_set(&self, cluster: u32) -> bool {
        let bit = (cluster - 2) as usize;
        self.bytes[bit / 8] & (1 << (bit % 8)) != 0
    }

    fn set(&mut self, cluster: u32) {
        let bit = (cluster - 2) as usize;
        self.bytes[bit / 8] |= 1 << (bit % 8);
    }

    fn clear(&mut self, cluster: u32) {
        let bit = (cluster - 2) as usize;
        self.bytes[bit / 8] &= !(1 << (bit % 8));
    }

    /// First clear bit at or above `from`, as a cluster index.
    fn first_free(&self, from: u32) -> Option<u32> {
        (from..self.cluster_count + 2).find(|&c| !self.is_set(c))
    }

    pub(crate) fn free_clusters(&self) -> u64 {
        let mut free = 0u64;
        for cluster in 2..self.cluster_count + 2 {
            if !self.is_set(cluster) {
                free += 1;
            }
        }
        free
    }
}

impl<D: BlockDevice> ExFatVolume<D> {
    /// Loads the bitmap by following its cluster chain, as located by the
    /// root directory's bitmap entry.
    pub(crate) fn load_bitmap(&mut self, first_cluster: u32, data_length: u64) -> Result<()> {
        let needed = (self.geo.cluster_count as u64).div_ceil(8);
        if data_length < needed {
            return Err(FsError::Corrupt("allocation bitmap is too short"));
        }

        let chain = self.collect_chain(first_cluster, false, data_length)?;
        let cluster_bytes = self.geo.bytes_per_cluster() as usize;
        if chain.len() as u64 * (cluster_bytes as u64) < needed {
            return Err(FsError::Corrupt("bitmap chain shorter than the bitmap"));
        }

        let mut bytes = try_zeroed_buffer(chain.len() * cluster_bytes)?;
        for (i, &cluster) in chain.iter().enumerate() {
            let sector = self.geo.cluster_sector(cluster);
            self.cache
                .read_direct(sector, &mut bytes[i * cluster_bytes..(i + 1) * cluster_bytes])?;
        }

        self.bitmap = AllocBitmap {
            bytes,
            chain,
            cluster_count: self.geo.cluster_count,
        };
        Ok(())
    }

    /// Writes the in-memory bitmap back through its cluster chain.
    pub(crate) fn flush_bitmap(&mut self) -> Result<()> {
        let cluster_bytes = self.geo.bytes_per_cluster() as usize;
        let bytes = core::mem::take(&mut self.bitmap.bytes);
        let chain = core::mem::take(&mut self.bitmap.chain);
        let mut result = Ok(());
        for (i, &cluster) in chain.iter().enumerate() {
            let sector = self.geo.cluster_sector(cluster);
            let slice = &bytes[i * cluster_bytes..(i + 1) * cluster_bytes];
            if let Err(err) = self.cache.write_direct(sector, slice) {
                result = Err(err);
                break;
            }
        }
        self.bitmap.bytes = bytes;
        self.bitmap.chain = chain;
        result
    }

    /// Allocates the first free cluster, marks it, and terminates its FAT
    /// entry. When `previous` is given the new cluster is chained after it.
    pub(crate) fn alloc_cluster(&mut self, previous: Option<u32>) -> Result<u32> {
        let cluster = self.bitmap.first_free(2).ok_or(FsError::NoSpace)?;
        self.bitmap.set(cluster);
        self.fat_set(cluster, FAT_EOC)?;
        if let Some(prev) = previous {
            self.fat_set(prev, cluster)?;
        }
        Ok(cluster)
    }

    /// Allocates a FAT-chained run of `count` clusters, rolling back on
    /// failure so the bitmap stays consistent with the FAT.
    pub(crate) fn alloc_chain(&mut self, count: u64) -> Result<u32> {
        debug_assert!(count > 0);
        let first = self.alloc_cluster(None)?;
        let mut tail = first;
        for _ in 1..count {
            match self.alloc_cluster(Some(tail)) {
                Ok(next) => tail = next,
                Err(err) => {
                    self.free_chain(first, false, 0)?;
                    return Err(err);
                }
            }
        }
        Ok(first)
    }

    /// Frees an allocation: clears each cluster's bit, and for FAT-chained
    /// allocations resets the FAT entries to free.
    pub(crate) fn free_chain(
        &mut self,
        first_cluster: u32,
        no_fat_chain: bool,
        data_length: u64,
    ) -> Result<()> {
        let chain = self.collect_chain(first_cluster, no_fat_chain, data_length)?;
        for cluster in chain {
            self.bitmap.clear(cluster);
            if !no_fat_chain {
                self.fat_set(cluster, FAT_FREE)?;
            }
        }
        Ok(())
    }
}
