//! Fixed-capacity sector cache with write-back.
//!
//! Each mounted volume owns one cache; there is no global pool. Entries are
//! keyed by the derived device LBA of their unit (see
//! [`SectorAdapter::unit_for`]), so logical sectors that share a device block
//! also share a cache entry and write-back can never resurrect a stale
//! neighbor.
//!
//! Eviction is a plain round-robin clock hand, not true LRU: a workload that
//! cycles through more hot sectors than the pool holds will thrash. That is
//! acceptable for a single-user interactive filesystem.

use log::warn;

use crate::device::{BlockDevice, SectorAdapter};
use crate::error::{Result, try_zeroed_buffer};

struct CacheEntry {
    lba: u64,
    buf: Vec<u8>,
    valid: bool,
    dirty: bool,
}

pub(crate) struct SectorCache<D> {
    adapter: SectorAdapter<D>,
    entries: Vec<CacheEntry>,
    hand: usize,
}

impl<D: BlockDevice> SectorCache<D> {
    /// Builds a cache of `capacity` unit buffers. Fails with `OutOfMemory`
    /// if the buffers cannot be allocated.
    pub(crate) fn new(adapter: SectorAdapter<D>, capacity: usize) -> Result<Self> {
        let unit = adapter.unit_bytes();
        let mut entries = Vec::new();
        entries.try_reserve_exact(capacity)?;
        for _ in 0..capacity {
            entries.push(CacheEntry {
                lba: 0,
                buf: try_zeroed_buffer(unit)?,
                valid: false,
                dirty: false,
            });
        }
        Ok(Self {
            adapter,
            entries,
            hand: 0,
        })
    }

    pub(crate) fn sector_size(&self) -> u32 {
        self.adapter.sector_size()
    }

    /// Finds or loads the unit holding `sector`, returning the entry index
    /// and the sector's byte offset within the unit.
    fn slot_for(&mut self, sector: u64) -> Result<(usize, usize)> {
        let (lba, offset) = self.adapter.unit_for(sector);
        if let Some(i) = self
            .entries
            .iter()
            .position(|e| e.valid && e.lba == lba)
        {
            return Ok((i, offset));
        }

        let victim = match self.entries.iter().position(|e| !e.valid) {
            Some(free) => free,
            None => {
                let v = self.hand;
                self.hand = (self.hand + 1) % self.entries.len();
                v
            }
        };

        if self.entries[victim].valid && self.entries[victim].dirty {
            let e = &self.entries[victim];
            self.adapter.write_unit(e.lba, &e.buf)?;
            self.entries[victim].dirty = false;
        }
        self.entries[victim].valid = false;
        self.adapter.read_unit(lba, &mut self.entries[victim].buf)?;
        self.entries[victim].lba = lba;
        self.entries[victim].valid = true;
        self.entries[victim].dirty = false;
        Ok((victim, offset))
    }

    /// Borrow of one cached logical sector. The borrow ties to `&mut self`,
    /// so it cannot be held across the next cache operation.
    pub(crate) fn read(&mut self, sector: u64) -> Result<&[u8]> {
        let size = self.sector_size() as usize;
        let (i, offset) = self.slot_for(sector)?;
        Ok(&self.entries[i].buf[offset..offset + size])
    }

    /// Mutable borrow of one cached logical sector; the entry is marked
    /// dirty.
    pub(crate) fn read_mut(&mut self, sector: u64) -> Result<&mut [u8]> {
        let size = self.sector_size() as usize;
        let (i, offset) = self.slot_for(sector)?;
        self.entries[i].dirty = true;
        Ok(&mut self.entries[i].buf[offset..offset + size])
    }

    pub(crate) fn mark_dirty(&mut self, sector: u64) {
        let (lba, _) = self.adapter.unit_for(sector);
        if let Some(e) = self.entries.iter_mut().find(|e| e.valid && e.lba == lba) {
            e.dirty = true;
        }
    }

    /// Writes every dirty entry back to the device.
    pub(crate) fn flush_all(&mut self) -> Result<()> {
        for i in 0..self.entries.len() {
            if self.entries[i].valid && self.entries[i].dirty {
                let e = &self.entries[i];
                self.adapter.write_unit(e.lba, &e.buf)?;
                self.entries[i].dirty = false;
            }
        }
        Ok(())
    }

    /// Flushes and drops the entry holding `sector`, if cached.
    pub(crate) fn invalidate(&mut self, sector: u64) -> Result<()> {
        let (lba, _) = self.adapter.unit_for(sector);
        self.drop_range(lba, lba)
    }

    pub(crate) fn invalidate_all(&mut self) -> Result<()> {
        self.flush_all()?;
        for e in &mut self.entries {
            e.valid = false;
        }
        Ok(())
    }

    /// Flushes and drops every entry whose unit overlaps the given LBA
    /// range, keeping the pool coherent with bulk I/O.
    fn drop_range(&mut self, first_lba: u64, last_lba: u64) -> Result<()> {
        for i in 0..self.entries.len() {
            let e = &self.entries[i];
            if e.valid && e.lba >= first_lba && e.lba <= last_lba {
                if e.dirty {
                    self.adapter.write_unit(e.lba, &e.buf)?;
                }
                self.entries[i].valid = false;
                self.entries[i].dirty = false;
            }
        }
        Ok(())
    }

    fn drop_overlapping(&mut self, first_sector: u64, sector_count: u64) -> Result<()> {
        if sector_count == 0 {
            return Ok(());
        }
        let (first_lba, _) = self.adapter.unit_for(first_sector);
        let (last_lba, _) = self.adapter.unit_for(first_sector + sector_count - 1);
        self.drop_range(first_lba, last_lba)
    }

    /// Bulk read bypassing the pool. Overlapping cached units are flushed
    /// and dropped first.
    pub(crate) fn read_direct(&mut self, first_sector: u64, buf: &mut [u8]) -> Result<()> {
        let count = (buf.len() / self.sector_size() as usize) as u64;
        self.drop_overlapping(first_sector, count)?;
        self.adapter.read_sectors(first_sector, buf)
    }

    /// Bulk write bypassing the pool. Overlapping cached units are flushed
    /// and dropped first.
    pub(crate) fn write_direct(&mut self, first_sector: u64, buf: &[u8]) -> Result<()> {
        let count = (buf.len() / self.sector_size() as usize) as u64;
        self.drop_overlapping(first_sector, count)?;
        self.adapter.write_sectors(first_sector, buf)
    }

    /// Zero-fills a run of logical sectors in bounded chunks.
    pub(crate) fn zero_direct(&mut self, first_sector: u64, sector_count: u64) -> Result<()> {
        let size = self.sector_size() as usize;
        let chunk_sectors = (32 * 1024 / size).max(1) as u64;
        let zeroes = try_zeroed_buffer(chunk_sectors as usize * size)?;
        let mut sector = first_sector;
        let mut remaining = sector_count;
        while remaining > 0 {
            let n = remaining.min(chunk_sectors);
            self.write_direct(sector, &zeroes[..n as usize * size])?;
            sector += n;
            remaining -= n;
        }
        Ok(())
    }

    /// Final flush on unmount; failures are logged, not reported.
    pub(crate) fn flush_on_unmount(&mut self) {
        if let Err(err) = self.flush_all() {
            warn!("cache flush on unmount failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testdisk::RamDisk;

    fn cache_with(capacity: usize) -> SectorCache<RamDisk> {
        let mut bytes = vec![0u8; 64 * 512];
        for sector in 0..64 {
            bytes[sector * 512] = sector as u8;
        }
        let adapter = SectorAdapter::new(RamDisk::from_bytes(bytes, 512), 512).unwrap();
        SectorCache::new(adapter, capacity).unwrap()
    }

    #[test]
    fn hit_returns_cached_contents() {
        let mut cache = cache_with(2);
        assert_eq!(cache.read(5).unwrap()[0], 5);
        assert_eq!(cache.read(5).unwrap()[0], 5);
    }

    #[test]
    fn eviction_writes_back_dirty_entries() {
        let mut cache = cache_with(2);
        cache.read_mut(1).unwrap()[0] = 0xaa;
        // Two more sectors force sector 1 out through the clock hand.
        cache.read(2).unwrap();
        cache.read(3).unwrap();
        cache.read(4).unwrap();
        // Re-reading must observe the written-back byte.
        assert_eq!(cache.read(1).unwrap()[0], 0xaa);
    }

    #[test]
    fn flush_all_clears_dirty_state() {
        let mut cache = cache_with(4);
        cache.read_mut(7).unwrap()[0] = 0x77;
        cache.flush_all().unwrap();
        let mut raw = [0u8; 512];
        cache.read_direct(7, &mut raw).unwrap();
        assert_eq!(raw[0], 0x77);
    }

    #[test]
    fn direct_write_invalidates_cached_copy() {
        let mut cache = cache_with(4);
        assert_eq!(cache.read(9).unwrap()[0], 9);
        let mut sector = [0u8; 512];
        sector[0] = 0x42;
        cache.write_direct(9, &sector).unwrap();
        assert_eq!(cache.read(9).unwrap()[0], 0x42);
    }

    #[test]
    fn direct_read_sees_dirty_data() {
        let mut cache = cache_with(4);
        cache.read_mut(3).unwrap()[0] = 0x33;
        let mut raw = [0u8; 512];
        cache.read_direct(3, &mut raw).unwrap();
        assert_eq!(raw[0], 0x33);
    }

    #[test]
    fn invalidate_drops_entry() {
        let mut cache = cache_with(2);
        cache.read_mut(2).unwrap()[0] = 0x99;
        cache.invalidate(2).unwrap();
        // The write-back happened, and the next read reloads from disk.
        assert_eq!(cache.read(2).unwrap()[0], 0x99);
    }

    #[test]
    fn mark_dirty_forces_write_back() {
        let mut cache = cache_with(4);
        // Mutate the buffer through a shared read, then mark the sector.
        let _ = cache.read(5).unwrap();
        cache.mark_dirty(5);
        cache.invalidate_all().unwrap();
        assert_eq!(cache.read(5).unwrap()[0], 5);
    }

    #[test]
    fn zero_direct_clears_run() {
        let mut cache = cache_with(2);
        cache.zero_direct(1, 3).unwrap();
        assert_eq!(cache.read(1).unwrap()[0], 0);
        assert_eq!(cache.read(2).unwrap()[0], 0);
        assert_eq!(cache.read(3).unwrap()[0], 0);
        assert_eq!(cache.read(4).unwrap()[0], 4);
    }
}
