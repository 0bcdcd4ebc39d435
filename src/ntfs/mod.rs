//! Read-only NTFS driver.
//!
//! Mount pins down the $MFT self-map (the extent list of the MFT's own
//! $DATA attribute, merged across $ATTRIBUTE_LIST extensions); every later
//! record read goes through that map. Directory listing walks $INDEX_ROOT
//! and the INDX blocks of $INDEX_ALLOCATION; free space comes from counting
//! zero bits in $Bitmap. Every mutating operation answers `ReadOnly`.

use log::{debug, warn};

use crate::cache::SectorCache;
use crate::device::{BlockDevice, SectorAdapter};
use crate::error::{FsError, Result, try_zeroed_buffer};
use crate::layout::{read_i8, read_u8, read_u16, read_u64, read_utf16, utf16_to_ascii};
use crate::ntfs::fixup::apply_fixups;
use crate::ntfs::record::{
    ATTR_ATTRIBUTE_LIST, ATTR_DATA, ATTR_VOLUME_NAME, AttrStream, MAX_EXTENTS, find_attr,
    is_nonresident, resident_value, run_bytes,
};
use crate::ntfs::runs::{Extent, decode_runs};
use crate::path;
use crate::volume::{DirEntryInfo, VolumeInfo};

pub(crate) mod fixup;
pub(crate) mod index;
pub(crate) mod record;
pub(crate) mod runs;

/// Well-known MFT record numbers.
const MFT_RECORD_MFT: u64 = 0;
const MFT_RECORD_VOLUME: u64 = 3;
const MFT_RECORD_ROOT: u64 = 5;
const MFT_RECORD_BITMAP: u64 = 6;

/// Number of cached sectors; NTFS touches more metadata per operation than
/// exFAT does.
const CACHE_CAPACITY: usize = 16;

/// Free-space counting reads $Bitmap in chunks of this many bytes.
const BITMAP_CHUNK: usize = 64 * 1024;

pub struct NtfsVolume<D: BlockDevice> {
    pub(crate) cache: SectorCache<D>,
    pub(crate) bytes_per_sector: u32,
    pub(crate) sectors_per_cluster: u32,
    total_clusters: u64,
    pub(crate) mft_record_size: u32,
    pub(crate) index_block_size: u32,
    /// The $MFT self-map: plain data, consulted by every record read.
    pub(crate) mft_map: Vec<Extent>,
    label: String,
}

/// `clusters_per_*` boot fields are signed: positive counts clusters,
/// negative is a log2 of the byte size.
fn size_from_clusters(raw: i8, cluster_bytes: u64) -> Result<u64> {
    if raw > 0 {
        Ok(raw as u64 * cluster_bytes)
    } else if (-raw as u32) < 32 {
        Ok(1u64 << (-raw as u32))
    } else {
        Err(FsError::Corrupt("record size exponent out of range"))
    }
}

impl<D: BlockDevice> NtfsVolume<D> {
    pub fn mount(device: D) -> Result<Self> {
        let mut adapter = SectorAdapter::new(device, 512)?;
        let mut sector0 = [0u8; 512];
        adapter.read_sectors(0, &mut sector0)?;

        if &sector0[3..11] != b"NTFS    " {
            return Err(FsError::Corrupt("missing NTFS OEM signature"));
        }
        let bytes_per_sector = read_u16(&sector0, 11)? as u32;
        if !bytes_per_sector.is_power_of_two() || !(512..=4096).contains(&bytes_per_sector) {
            return Err(FsError::Corrupt("illegal bytes per sector"));
        }
        let sectors_per_cluster = read_u8(&sector0, 13)? as u32;
        if sectors_per_cluster == 0 || !sectors_per_cluster.is_power_of_two() {
            return Err(FsError::Corrupt("illegal sectors per cluster"));
        }
        let total_sectors = read_u64(&sector0, 40)?;
        let mft_cluster = read_u64(&sector0, 48)?;
        let cluster_bytes = bytes_per_sector as u64 * sectors_per_cluster as u64;

        let mft_record_size = size_from_clusters(read_i8(&sector0, 64)?, cluster_bytes)?;
        if mft_record_size > 4096
            || mft_record_size < bytes_per_sector as u64
            || mft_record_size % bytes_per_sector as u64 != 0
        {
            return Err(FsError::Corrupt("implausible MFT record size"));
        }
        let index_block_size = size_from_clusters(read_i8(&sector0, 68)?, cluster_bytes)?;
        if index_block_size > 65536 || index_block_size < bytes_per_sector as u64 {
            return Err(FsError::Corrupt("implausible index block size"));
        }

        if adapter.sector_size() != bytes_per_sector {
            adapter = SectorAdapter::new(adapter.into_inner(), bytes_per_sector)?;
        }
        let cache = SectorCache::new(adapter, CACHE_CAPACITY)?;

        let mut vol = Self {
            cache,
            bytes_per_sector,
            sectors_per_cluster,
            total_clusters: total_sectors / sectors_per_cluster as u64,
            mft_record_size: mft_record_size as u32,
            index_block_size: index_block_size as u32,
            mft_map: Vec::new(),
            label: String::new(),
        };

        // Record 0 describes the MFT itself; the boot sector pins its first
        // cluster, which breaks the circle.
        let record0 = vol.read_pinned_record(mft_cluster)?;
        let data = find_attr(&record0, ATTR_DATA, None)?
            .ok_or(FsError::Corrupt("$MFT has no data attribute"))?;
        if !is_nonresident(data)? {
            return Err(FsError::Corrupt("$MFT data attribute must be non-resident"));
        }
        vol.mft_map = decode_runs(run_bytes(data)?, MAX_EXTENTS)?;

        if find_attr(&record0, ATTR_ATTRIBUTE_LIST, None)?.is_some() {
            if let Some(AttrStream::NonResident { extents, .. }) =
                vol.attr_stream(&record0, MFT_RECORD_MFT, ATTR_DATA, None)?
            {
                vol.mft_map = extents;
            }
        }
        debug!(
            "ntfs: {} clusters of {} bytes, mft record {} bytes, {} mft extents",
            vol.total_clusters,
            cluster_bytes,
            vol.mft_record_size,
            vol.mft_map.len()
        );

        vol.load_label();
        Ok(vol)
    }

    fn read_pinned_record(&mut self, mft_cluster: u64) -> Result<Vec<u8>> {
        let first_sector = mft_cluster * self.sectors_per_cluster as u64;
        let mut buf = try_zeroed_buffer(self.mft_record_size as usize)?;
        self.cache.read_direct(first_sector, &mut buf)?;
        if &buf[0..4] != b"FILE" {
            return Err(FsError::Corrupt("MFT record signature"));
        }
        apply_fixups(&mut buf, self.bytes_per_sector as usize)?;
        Ok(buf)
    }

    /// The volume label lives in $Volume's $VOLUME_NAME attribute; a volume
    /// without one simply has no label.
    fn load_label(&mut self) {
        let record = match self.read_record(MFT_RECORD_VOLUME) {
            Ok(r) => r,
            Err(err) => {
                warn!("ntfs: cannot read $Volume: {err}");
                return;
            }
        };
        let attr = match find_attr(&record, ATTR_VOLUME_NAME, None) {
            Ok(Some(a)) => a,
            _ => return,
        };
        if let (Ok(false), Ok(value)) = (is_nonresident(attr), resident_value(attr)) {
            if let Ok(units) = read_utf16(value, 0, value.len() / 2) {
                let mut label = utf16_to_ascii(&units);
                label.truncate(48);
                self.label = label;
            }
        }
    }

    /// Resolves a path to `(record number, is_dir)`.
    fn resolve(&mut self, p: &str) -> Result<(u64, bool)> {
        let components = path::split(p)?;
        let mut record = MFT_RECORD_ROOT;
        let mut is_dir = true;
        for component in components {
            if !is_dir {
                return Err(FsError::NotADirectory);
            }
            let entry = self
                .lookup_in_dir(record, component)?
                .ok_or(FsError::NotFound)?;
            record = entry.mft_ref;
            is_dir = entry.is_dir;
        }
        Ok((record, is_dir))
    }

    pub fn readdir(&mut self, p: &str) -> Result<Vec<DirEntryInfo>> {
        let (record, is_dir) = self.resolve(p)?;
        if !is_dir {
            return Err(FsError::NotADirectory);
        }
        self.list_dir(record)
    }

    pub fn readfile(&mut self, p: &str) -> Result<Vec<u8>> {
        let (number, is_dir) = self.resolve(p)?;
        if is_dir {
            return Err(FsError::NotAFile);
        }
        let record = self.read_record(number)?;
        let stream = self
            .attr_stream(&record, number, ATTR_DATA, None)?
            .ok_or(FsError::Corrupt("file record has no data attribute"))?;
        self.read_attr_data(&stream)
    }

    pub fn file_size(&mut self, p: &str) -> Result<u64> {
        let (number, is_dir) = self.resolve(p)?;
        if is_dir {
            return Ok(0);
        }
        let record = self.read_record(number)?;
        Ok(self
            .attr_stream(&record, number, ATTR_DATA, None)?
            .map(|s| s.size())
            .unwrap_or(0))
    }

    pub fn exists(&mut self, p: &str) -> bool {
        self.resolve(p).is_ok()
    }

    pub fn writefile(&mut self, _p: &str, _data: &[u8]) -> Result<()> {
        Err(FsError::ReadOnly)
    }

    pub fn mkdir(&mut self, _p: &str) -> Result<()> {
        Err(FsError::ReadOnly)
    }

    pub fn rename(&mut self, _p: &str, _new_name: &str) -> Result<()> {
        Err(FsError::ReadOnly)
    }

    pub fn delete(&mut self, _p: &str) -> Result<()> {
        Err(FsError::ReadOnly)
    }

    pub fn volume_info(&mut self) -> Result<VolumeInfo> {
        let cluster_bytes = self.sectors_per_cluster as u64 * self.bytes_per_sector as u64;
        Ok(VolumeInfo {
            total_bytes: self.total_clusters * cluster_bytes,
            free_bytes: self.count_free_clusters()? * cluster_bytes,
        })
    }

    /// Counts zero bits in $Bitmap up to the cluster count. Large bitmaps
    /// stream through in bounded chunks; sparse extents read as zeros and so
    /// count as all-free.
    fn count_free_clusters(&mut self) -> Result<u64> {
        let record = self.read_record(MFT_RECORD_BITMAP)?;
        let stream = self
            .attr_stream(&record, MFT_RECORD_BITMAP, ATTR_DATA, None)?
            .ok_or(FsError::Corrupt("$Bitmap has no data attribute"))?;

        let mut free = 0u64;
        let mut bit = 0u64;
        match stream {
            AttrStream::Resident(bytes) => {
                count_zero_bits(&bytes, &mut bit, self.total_clusters, &mut free);
            }
            AttrStream::NonResident { extents, size } => {
                let mut offset = 0u64;
                let mut chunk = try_zeroed_buffer(BITMAP_CHUNK)?;
                while offset < size && bit < self.total_clusters {
                    let n = (size - offset).min(BITMAP_CHUNK as u64) as usize;
                    Self::read_stream(
                        &mut self.cache,
                        self.sectors_per_cluster,
                        &extents,
                        offset,
                        &mut chunk[..n],
                    )?;
                    count_zero_bits(&chunk[..n], &mut bit, self.total_clusters, &mut free);
                    offset += n as u64;
                }
            }
        }
        // Clusters beyond the end of a short bitmap stay free.
        free += self.total_clusters.saturating_sub(bit);
        Ok(free)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn unmount(mut self) {
        self.cache.flush_on_unmount();
    }
}

fn count_zero_bits(bytes: &[u8], bit: &mut u64, limit: u64, free: &mut u64) {
    for &b in bytes {
        if *bit >= limit {
            return;
        }
        let bits = (limit - *bit).min(8) as u32;
        let mask = if bits == 8 { 0xff } else { (1u8 << bits) - 1 };
        *free += (bits - (b & mask).count_ones()) as u64;
        *bit += bits as u64;
    }
}
