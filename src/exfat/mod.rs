//! exFAT driver: mount, directory CRUD, file read/write, free-space
//! accounting.
//!
//! The volume handle owns the sector cache, the parsed geometry and the
//! in-memory allocation bitmap; everything is released on unmount. Writes
//! follow the format's delete-and-recreate discipline: an existing file's
//! chain is freed and its entry set retired before the new data and a fresh
//! set go in.

use log::{debug, warn};

use crate::cache::SectorCache;
use crate::device::{BlockDevice, SectorAdapter};
use crate::error::{FsError, Result, try_zeroed_buffer};
use crate::exfat::bitmap::AllocBitmap;
use crate::exfat::boot::ExFatGeometry;
use crate::exfat::dir::{
    DirRef, ET_BITMAP, ET_END, ET_FILE, ET_LABEL, ET_UPCASE, FileAttributes, build_entry_set,
};
use crate::layout::{read_u16, read_u32, read_u64, utf16_to_ascii};
use crate::path;
use crate::volume::{DirEntryInfo, VolumeInfo, sort_entries};
use crate::MAX_NAME_LEN;

pub(crate) mod bitmap;
pub(crate) mod boot;
pub(crate) mod dir;
pub(crate) mod fat;

/// Number of cached sectors for an exFAT volume.
const CACHE_CAPACITY: usize = 8;

pub struct ExFatVolume<D: BlockDevice> {
    pub(crate) cache: SectorCache<D>,
    pub(crate) geo: ExFatGeometry,
    pub(crate) bitmap: AllocBitmap,
    label: String,
}

impl<D: BlockDevice> ExFatVolume<D> {
    pub fn mount(device: D) -> Result<Self> {
        let mut adapter = SectorAdapter::new(device, 512)?;
        let mut sector0 = [0u8; 512];
        adapter.read_sectors(0, &mut sector0)?;
        let geo = ExFatGeometry::parse(&sector0)?;

        if adapter.sector_size() != geo.bytes_per_sector {
            adapter = SectorAdapter::new(adapter.into_inner(), geo.bytes_per_sector)?;
        }
        let cache = SectorCache::new(adapter, CACHE_CAPACITY)?;

        let mut vol = Self {
            cache,
            geo,
            bitmap: AllocBitmap::default(),
            label: String::new(),
        };
        vol.scan_root_metadata()?;
        debug!(
            "exfat: {} sectors, {} clusters of {} bytes, fat at {}+{}, root at {}, label {:?}",
            geo.volume_length,
            geo.cluster_count,
            geo.bytes_per_cluster(),
            geo.fat_offset,
            geo.fat_length,
            geo.root_cluster,
            vol.label
        );
        Ok(vol)
    }

    fn root_dir(&self) -> DirRef {
        DirRef {
            first_cluster: self.geo.root_cluster,
            no_fat_chain: false,
            size: 0,
        }
    }

    /// Scans the root directory for the first allocation bitmap entry
    /// (mandatory) and the volume label (optional), then loads the bitmap.
    fn scan_root_metadata(&mut self) -> Result<()> {
        let root = self.root_dir();
        let mut bitmap_loc: Option<(u32, u64)> = None;
        let mut label = String::new();

        let mut cur = self.dir_cursor(&root);
        while let Some((entry, _)) = self.next_dir_entry(&mut cur)? {
            match entry[0] {
                ET_END => break,
                ET_BITMAP => {
                    // Flag bit 0 selects which bitmap the entry describes;
                    // only the first one matters here.
                    if entry[1] & 0x01 == 0 && bitmap_loc.is_none() {
                        bitmap_loc = Some((read_u32(&entry, 20)?, read_u64(&entry, 24)?));
                    }
                }
                ET_LABEL => {
                    let count = (entry[1] as usize).min(11);
                    let mut units = Vec::with_capacity(count);
                    for i in 0..count {
                        units.push(read_u16(&entry, 2 + i * 2)?);
                    }
                    label = utf16_to_ascii(&units);
                }
                // The up-case table is not consulted; comparisons fold case
                // in the ASCII range only.
                ET_UPCASE => {}
                _ => {}
            }
        }

        let (first_cluster, data_length) =
            bitmap_loc.ok_or(FsError::Corrupt("root has no allocation bitmap entry"))?;
        self.load_bitmap(first_cluster, data_length)?;
        self.label = label;
        Ok(())
    }

    /// Descends a list of directory components from the root.
    fn resolve_components(&mut self, components: &[&str]) -> Result<DirRef> {
        let mut dir = self.root_dir();
        for component in components {
            let set = self
                .find_entry(&dir, component)?
                .ok_or(FsError::NotFound)?;
            if !set.is_dir() {
                return Err(FsError::NotADirectory);
            }
            dir = DirRef {
                first_cluster: set.first_cluster,
                no_fat_chain: set.no_fat_chain,
                size: set.data_length,
            };
        }
        Ok(dir)
    }

    pub fn readdir(&mut self, p: &str) -> Result<Vec<DirEntryInfo>> {
        let components = path::split(p)?;
        let dir = self.resolve_components(&components)?;

        let mut out = Vec::new();
        let mut cur = self.dir_cursor(&dir);
        while let Some((entry, pos)) = self.next_dir_entry(&mut cur)? {
            match entry[0] {
                ET_END => break,
                ET_FILE => {
                    if let Some(set) = self.read_entry_set(&mut cur, entry, pos)? {
                        let mut name = set.name;
                        name.truncate(MAX_NAME_LEN);
                        out.push(DirEntryInfo {
                            size: if set.attributes.contains(FileAttributes::DIRECTORY) {
                                0
                            } else {
                                set.data_length
                            },
                            is_dir: set.attributes.contains(FileAttributes::DIRECTORY),
                            name,
                        });
                    }
                }
                _ => {}
            }
        }
        sort_entries(&mut out);
        Ok(out)
    }

    pub fn readfile(&mut self, p: &str) -> Result<Vec<u8>> {
        let (parent_components, leaf) = path::parent_and_leaf(p)?;
        let parent = self.resolve_components(&parent_components)?;
        let set = self.find_entry(&parent, leaf)?.ok_or(FsError::NotFound)?;
        if set.is_dir() {
            return Err(FsError::NotAFile);
        }
        self.read_file_data(&set)
    }

    fn read_file_data(&mut self, set: &dir::EntrySet) -> Result<Vec<u8>> {
        let length = set.data_length as usize;
        let mut buf = try_zeroed_buffer(length)?;
        // Bytes past the valid data length read as zeros.
        let valid = set.valid_data_length.min(set.data_length) as usize;
        if valid == 0 || set.first_cluster == 0 {
            return Ok(buf);
        }

        let chain = self.collect_chain(set.first_cluster, set.no_fat_chain, set.data_length)?;
        let cluster_bytes = self.geo.bytes_per_cluster() as usize;
        let bytes_per_sector = self.geo.bytes_per_sector as usize;
        let mut offset = 0usize;
        for &cluster in &chain {
            if offset >= valid {
                break;
            }
            let first_sector = self.geo.cluster_sector(cluster);
            let take = (valid - offset).min(cluster_bytes);
            let full_sectors = take / bytes_per_sector;
            if full_sectors > 0 {
                self.cache.read_direct(
                    first_sector,
                    &mut buf[offset..offset + full_sectors * bytes_per_sector],
                )?;
            }
            let tail = take % bytes_per_sector;
            if tail > 0 {
                let sector = self.cache.read(first_sector + full_sectors as u64)?;
                buf[offset + full_sectors * bytes_per_sector..offset + take]
                    .copy_from_slice(&sector[..tail]);
            }
            offset += take;
        }
        Ok(buf)
    }

    pub fn writefile(&mut self, p: &str, data: &[u8]) -> Result<()> {
        let (parent_components, leaf) = path::parent_and_leaf(p)?;
        let parent = self.resolve_components(&parent_components)?;

        if let Some(existing) = self.find_entry(&parent, leaf)? {
            if existing.is_dir() {
                return Err(FsError::NotAFile);
            }
            if existing.first_cluster != 0 {
                self.free_chain(
                    existing.first_cluster,
                    existing.no_fat_chain,
                    existing.data_length,
                )?;
            }
            self.mark_set_deleted(&existing)?;
        }

        let cluster_bytes = self.geo.bytes_per_cluster() as usize;
        let clusters = data.len().div_ceil(cluster_bytes);
        // New chains always go through the FAT, never NoFatChain.
        let first_cluster = if clusters == 0 {
            0
        } else {
            let first = self.alloc_chain(clusters as u64)?;
            self.write_chain_data(first, data)?;
            first
        };

        let set = build_entry_set(
            leaf,
            FileAttributes::ARCHIVE,
            first_cluster,
            data.len() as u64,
            data.len() as u64,
            false,
        )?;
        self.insert_entry_set(&parent, &set)?;
        self.flush_bitmap()?;
        self.cache.flush_all()
    }

    fn write_chain_data(&mut self, first_cluster: u32, data: &[u8]) -> Result<()> {
        let chain = self.collect_chain(first_cluster, false, data.len() as u64)?;
        let cluster_bytes = self.geo.bytes_per_cluster() as usize;
        let bytes_per_sector = self.geo.bytes_per_sector as usize;
        let sectors_per_cluster = self.geo.sectors_per_cluster as u64;

        let mut offset = 0usize;
        for &cluster in &chain {
            let first_sector = self.geo.cluster_sector(cluster);
            let take = (data.len() - offset).min(cluster_bytes);
            let full_sectors = take / bytes_per_sector;
            if full_sectors > 0 {
                self.cache.write_direct(
                    first_sector,
                    &data[offset..offset + full_sectors * bytes_per_sector],
                )?;
            }
            let tail = take % bytes_per_sector;
            if tail > 0 {
                // Final partial sector goes read-modify-write through the
                // cache, with the remainder zeroed.
                let sector = self.cache.read_mut(first_sector + full_sectors as u64)?;
                sector[..tail].copy_from_slice(&data[offset + full_sectors * bytes_per_sector
                    ..offset + take]);
                sector[tail..].fill(0);
            }
            let used_sectors = take.div_ceil(bytes_per_sector) as u64;
            if used_sectors < sectors_per_cluster {
                self.cache
                    .zero_direct(first_sector + used_sectors, sectors_per_cluster - used_sectors)?;
            }
            offset += take;
        }
        Ok(())
    }

    /// Creates the directory path, making missing components along the way.
    /// A component that already exists as a directory is fine; one that
    /// exists as a file is not.
    pub fn mkdir(&mut self, p: &str) -> Result<()> {
        let components = path::split(p)?;
        let mut dir = self.root_dir();
        let mut changed = false;
        for component in components {
            match self.find_entry(&dir, component)? {
                Some(set) => {
                    if !set.is_dir() {
                        return Err(FsError::NotADirectory);
                    }
                    dir = DirRef {
                        first_cluster: set.first_cluster,
                        no_fat_chain: set.no_fat_chain,
                        size: set.data_length,
                    };
                }
                None => {
                    let cluster = self.alloc_cluster(None)?;
                    // An empty directory is one zeroed cluster.
                    self.cache.zero_direct(
                        self.geo.cluster_sector(cluster),
                        self.geo.sectors_per_cluster as u64,
                    )?;
                    let cluster_bytes = self.geo.bytes_per_cluster();
                    let set = build_entry_set(
                        component,
                        FileAttributes::DIRECTORY,
                        cluster,
                        cluster_bytes,
                        cluster_bytes,
                        false,
                    )?;
                    self.insert_entry_set(&dir, &set)?;
                    dir = DirRef {
                        first_cluster: cluster,
                        no_fat_chain: false,
                        size: cluster_bytes,
                    };
                    changed = true;
                }
            }
        }
        if changed {
            self.flush_bitmap()?;
            self.cache.flush_all()?;
        }
        Ok(())
    }

    /// Renames the leaf of `p` to `new_name` within the same directory: the
    /// old entry set is retired and a new one, pointing at the same
    /// allocation, goes in.
    pub fn rename(&mut self, p: &str, new_name: &str) -> Result<()> {
        path::check_name(new_name)?;
        let (parent_components, leaf) = path::parent_and_leaf(p)?;
        let parent = self.resolve_components(&parent_components)?;
        let set = self.find_entry(&parent, leaf)?.ok_or(FsError::NotFound)?;
        if path::eq_fold(leaf, new_name) {
            return Ok(());
        }
        if self.find_entry(&parent, new_name)?.is_some() {
            return Err(FsError::AlreadyExists);
        }

        let new_set = build_entry_set(
            new_name,
            set.attributes,
            set.first_cluster,
            set.data_length,
            set.valid_data_length,
            set.no_fat_chain,
        )?;
        self.mark_set_deleted(&set)?;
        self.insert_entry_set(&parent, &new_set)?;
        self.flush_bitmap()?;
        self.cache.flush_all()
    }

    pub fn delete(&mut self, p: &str) -> Result<()> {
        let (parent_components, leaf) = path::parent_and_leaf(p)?;
        let parent = self.resolve_components(&parent_components)?;
        let set = self.find_entry(&parent, leaf)?.ok_or(FsError::NotFound)?;

        if set.is_dir() {
            let dir = DirRef {
                first_cluster: set.first_cluster,
                no_fat_chain: set.no_fat_chain,
                size: set.data_length,
            };
            if self.dir_has_live_entries(&dir)? {
                return Err(FsError::NotEmpty);
            }
        }
        if set.first_cluster != 0 {
            self.free_chain(set.first_cluster, set.no_fat_chain, set.data_length)?;
        }
        self.mark_set_deleted(&set)?;
        self.flush_bitmap()?;
        self.cache.flush_all()
    }

    /// A directory is deletable only when no in-use File entry remains.
    fn dir_has_live_entries(&mut self, dir: &DirRef) -> Result<bool> {
        let mut cur = self.dir_cursor(dir);
        while let Some((entry, _)) = self.next_dir_entry(&mut cur)? {
            match entry[0] {
                ET_END => break,
                ET_FILE => return Ok(true),
                _ => {}
            }
        }
        Ok(false)
    }

    pub fn exists(&mut self, p: &str) -> bool {
        match path::parent_and_leaf(p) {
            Ok((parent_components, leaf)) => self
                .resolve_components(&parent_components)
                .and_then(|parent| self.find_entry(&parent, leaf))
                .map(|found| found.is_some())
                .unwrap_or(false),
            // The root always exists.
            Err(_) => path::split(p).map(|c| c.is_empty()).unwrap_or(false),
        }
    }

    pub fn file_size(&mut self, p: &str) -> Result<u64> {
        let (parent_components, leaf) = path::parent_and_leaf(p)?;
        let parent = self.resolve_components(&parent_components)?;
        let set = self.find_entry(&parent, leaf)?.ok_or(FsError::NotFound)?;
        Ok(if set.is_dir() { 0 } else { set.data_length })
    }

    pub fn volume_info(&mut self) -> Result<VolumeInfo> {
        let cluster_bytes = self.geo.bytes_per_cluster();
        Ok(VolumeInfo {
            total_bytes: self.geo.cluster_count as u64 * cluster_bytes,
            free_bytes: self.bitmap.free_clusters() * cluster_bytes,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Flushes the bitmap and the cache; failures are logged because there
    /// is nobody left to report them to.
    pub fn unmount(mut self) {
        if let Err(err) = self.flush_bitmap() {
            warn!("exfat: bitmap flush on unmount failed: {err}");
        }
        self.cache.flush_on_unmount();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::device::testdisk::RamDisk;
    use crate::layout::{put_u16, put_u32, put_u64};

    /// Minimal exFAT image builder: boot sector, one FAT, allocation
    /// bitmap, up-case table entry and an empty root directory.
    pub(crate) fn mkfs_exfat(total_bytes: usize) -> RamDisk {
        let bps = 512usize;
        let spc = 8usize;
        let cluster_bytes = bps * spc;
        let volume_length = (total_bytes / bps) as u64;
        let fat_offset = 24u32;
        let approx_clusters = ((volume_length - fat_offset as u64) / spc as u64) as u32;
        let fat_length =
            (((approx_clusters as u64 + 2) * 4).div_ceil(bps as u64)) as u32;
        let heap_offset = fat_offset + fat_length;
        let cluster_count = ((volume_length - heap_offset as u64) / spc as u64) as u32;

        let bitmap_bytes = cluster_count.div_ceil(8);
        let bitmap_clusters = (bitmap_bytes as usize).div_ceil(cluster_bytes) as u32;
        let upcase_cluster = 2 + bitmap_clusters;
        let root_cluster = upcase_cluster + 1;

        let mut data = vec![0u8; total_bytes];
        let img: &mut [u8] = &mut data;

        img[0..3].copy_from_slice(&[0xeb, 0x76, 0x90]);
        img[3..11].copy_from_slice(b"EXFAT   ");
        put_u64(img, 72, volume_length);
        put_u32(img, 80, fat_offset);
        put_u32(img, 84, fat_length);
        put_u32(img, 88, heap_offset);
        put_u32(img, 92, cluster_count);
        put_u32(img, 96, root_cluster);
        put_u32(img, 100, 0x1991_0521);
        put_u16(img, 104, 0x0100);
        img[108] = 9;
        img[109] = 3;
        img[110] = 1;
        img[111] = 0x80;
        img[112] = 0xff;
        put_u16(img, 510, 0xaa55);

        // FAT: media, reserved, then EOC-terminated chains for the bitmap,
        // up-case table and root directory.
        let fat_base = fat_offset as usize * bps;
        put_u32(img, fat_base, 0xffff_fff8);
        put_u32(img, fat_base + 4, 0xffff_ffff);
        for i in 0..bitmap_clusters {
            let cluster = 2 + i;
            let next = if i + 1 == bitmap_clusters {
                0xffff_ffff
            } else {
                cluster + 1
            };
            put_u32(img, fat_base + cluster as usize * 4, next);
        }
        put_u32(img, fat_base + upcase_cluster as usize * 4, 0xffff_ffff);
        put_u32(img, fat_base + root_cluster as usize * 4, 0xffff_ffff);

        // Bitmap: the metadata clusters themselves are allocated.
        let heap_byte = heap_offset as usize * bps;
        for cluster in 2..=root_cluster {
            let bit = (cluster - 2) as usize;
            img[heap_byte + bit / 8] |= 1 << (bit % 8);
        }

        // Root directory: volume label, bitmap entry, up-case entry.
        let root_byte = heap_byte + (root_cluster as usize - 2) * cluster_bytes;
        img[root_byte] = 0x83;
        img[root_byte + 1] = 8;
        for (i, c) in "SURVIVAL".chars().enumerate() {
            put_u16(img, root_byte + 2 + i * 2, c as u16);
        }
        let bm = root_byte + 32;
        img[bm] = 0x81;
        put_u32(img, bm + 20, 2);
        put_u64(img, bm + 24, bitmap_bytes as u64);
        let up = root_byte + 64;
        img[up] = 0x82;
        put_u32(img, up + 20, upcase_cluster);
        put_u64(img, up + 24, 128);

        RamDisk::from_bytes(data, bps)
    }

    fn mounted() -> ExFatVolume<RamDisk> {
        ExFatVolume::mount(mkfs_exfat(64 * 1024 * 1024)).unwrap()
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 253) as u8).collect()
    }

    #[test]
    fn mounts_with_label_and_free_space() {
        let mut vol = mounted();
        assert_eq!(vol.label(), "SURVIVAL");
        let info = vol.volume_info().unwrap();
        // Everything except the three metadata clusters is free.
        assert_eq!(
            info.free_bytes,
            info.total_bytes - 3 * vol.geo.bytes_per_cluster()
        );
    }

    #[test]
    fn create_and_read_back() {
        let mut vol = mounted();
        vol.writefile("/hello.txt", b"Hello, world!\n").unwrap();
        assert_eq!(vol.readfile("/hello.txt").unwrap(), b"Hello, world!\n");
        assert_eq!(vol.file_size("/hello.txt").unwrap(), 14);
        assert!(vol.exists("/hello.txt"));
        assert!(vol.exists("/HELLO.TXT"));
        assert!(!vol.exists("/other.txt"));
    }

    #[test]
    fn large_file_spans_clusters_and_accounts_free_space() {
        let mut vol = mounted();
        let before = vol.volume_info().unwrap().free_bytes;
        let data = pattern(10_000);
        vol.writefile("/big.bin", &data).unwrap();
        assert_eq!(vol.readfile("/big.bin").unwrap(), data);
        // 10 000 bytes in 4 KiB clusters: exactly three clusters.
        let after = vol.volume_info().unwrap().free_bytes;
        assert_eq!(before - after, 3 * 4096);
    }

    #[test]
    fn delete_restores_free_space() {
        let mut vol = mounted();
        let before = vol.volume_info().unwrap().free_bytes;
        vol.writefile("/big.bin", &pattern(10_000)).unwrap();
        vol.delete("/big.bin").unwrap();
        assert_eq!(vol.volume_info().unwrap().free_bytes, before);
        assert!(!vol.exists("/big.bin"));
        assert!(matches!(vol.delete("/big.bin"), Err(FsError::NotFound)));
    }

    #[test]
    fn mkdir_nests_and_lists() {
        let mut vol = mounted();
        vol.mkdir("/a/b/c").unwrap();

        let a = vol.readdir("/a").unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].name, "b");
        assert!(a[0].is_dir);
        assert_eq!(a[0].size, 0);

        let b = vol.readdir("/a/b").unwrap();
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].name, "c");

        assert!(vol.readdir("/a/b/c").unwrap().is_empty());
    }

    #[test]
    fn mkdir_is_idempotent_but_files_block_it() {
        let mut vol = mounted();
        vol.mkdir("/a/b").unwrap();
        vol.mkdir("/a/b").unwrap();
        assert_eq!(vol.readdir("/a").unwrap().len(), 1);

        vol.writefile("/a/file", b"x").unwrap();
        assert!(matches!(vol.mkdir("/a/file"), Err(FsError::NotADirectory)));
        assert!(matches!(
            vol.mkdir("/a/file/sub"),
            Err(FsError::NotADirectory)
        ));
    }

    #[test]
    fn overwrite_replaces_contents_and_chain() {
        let mut vol = mounted();
        let before = vol.volume_info().unwrap().free_bytes;
        vol.writefile("/f.bin", &pattern(9_000)).unwrap();
        vol.writefile("/f.bin", b"tiny").unwrap();
        assert_eq!(vol.readfile("/f.bin").unwrap(), b"tiny");
        // Only the one-cluster chain of the second write remains allocated.
        assert_eq!(vol.volume_info().unwrap().free_bytes, before - 4096);
        // The listing shows the file once.
        let root = vol.readdir("/").unwrap();
        assert_eq!(root.iter().filter(|e| e.name == "f.bin").count(), 1);
    }

    #[test]
    fn empty_file_has_no_allocation() {
        let mut vol = mounted();
        let before = vol.volume_info().unwrap().free_bytes;
        vol.writefile("/empty", b"").unwrap();
        assert_eq!(vol.volume_info().unwrap().free_bytes, before);
        assert_eq!(vol.readfile("/empty").unwrap(), Vec::<u8>::new());
        assert_eq!(vol.file_size("/empty").unwrap(), 0);
    }

    #[test]
    fn long_names_round_trip() {
        let mut vol = mounted();
        let name = "/a-very-long-filename-used-for-testing-name-entries.txt";
        vol.writefile(name, b"long").unwrap();
        assert_eq!(vol.readfile(name).unwrap(), b"long");
        let root = vol.readdir("/").unwrap();
        assert_eq!(root[0].name, name.trim_start_matches('/'));
    }

    #[test]
    fn rename_moves_the_entry_not_the_data() {
        let mut vol = mounted();
        let data = pattern(5_000);
        vol.writefile("/old.bin", &data).unwrap();
        let free = vol.volume_info().unwrap().free_bytes;

        vol.rename("/old.bin", "new.bin").unwrap();
        assert!(!vol.exists("/old.bin"));
        assert_eq!(vol.readfile("/new.bin").unwrap(), data);
        assert_eq!(vol.volume_info().unwrap().free_bytes, free);

        vol.writefile("/taken", b"t").unwrap();
        assert!(matches!(
            vol.rename("/new.bin", "taken"),
            Err(FsError::AlreadyExists)
        ));
        assert!(matches!(
            vol.rename("/absent", "x"),
            Err(FsError::NotFound)
        ));
    }

    #[test]
    fn non_empty_directories_refuse_deletion() {
        let mut vol = mounted();
        vol.mkdir("/d").unwrap();
        vol.writefile("/d/f", b"1").unwrap();
        assert!(matches!(vol.delete("/d"), Err(FsError::NotEmpty)));
        vol.delete("/d/f").unwrap();
        vol.delete("/d").unwrap();
        assert!(!vol.exists("/d"));
    }

    #[test]
    fn directory_grows_past_one_cluster() {
        let mut vol = mounted();
        vol.mkdir("/many").unwrap();
        // 4 KiB of 32-byte entries is 128 slots; 50 files at three entries
        // each need a second cluster.
        for i in 0..50 {
            vol.writefile(&format!("/many/file-{i:02}"), &[i as u8])
                .unwrap();
        }
        let listing = vol.readdir("/many").unwrap();
        assert_eq!(listing.len(), 50);
        assert_eq!(vol.readfile("/many/file-49").unwrap(), vec![49u8]);
    }

    #[test]
    fn writefile_on_directory_is_rejected() {
        let mut vol = mounted();
        vol.mkdir("/d").unwrap();
        assert!(matches!(vol.writefile("/d", b"x"), Err(FsError::NotAFile)));
        assert!(matches!(vol.readfile("/d"), Err(FsError::NotAFile)));
    }

    #[test]
    fn no_space_is_reported() {
        // A 2 MiB volume holds well under 3 MiB.
        let mut vol = ExFatVolume::mount(mkfs_exfat(2 * 1024 * 1024)).unwrap();
        let huge = vec![0u8; 3 * 1024 * 1024];
        assert!(matches!(
            vol.writefile("/huge", &huge),
            Err(FsError::NoSpace)
        ));
    }

    /// §Bitmap consistency: the set bits must equal the clusters reachable
    /// from the root by chain-following.
    #[test]
    fn bitmap_matches_reachable_clusters() {
        let mut vol = mounted();
        vol.mkdir("/x/y").unwrap();
        vol.writefile("/x/a.bin", &pattern(5_000)).unwrap();
        vol.writefile("/x/y/b.bin", &pattern(12_288)).unwrap();
        vol.writefile("/top", b"t").unwrap();
        vol.delete("/x/a.bin").unwrap();
        vol.rename("/top", "renamed").unwrap();

        let mut reachable: Vec<u32> = Vec::new();
        // Root chain plus the chains named by root metadata entries.
        let root = vol.root_dir();
        reachable.extend(vol.collect_chain(root.first_cluster, false, 0).unwrap());
        let mut cur = vol.dir_cursor(&root);
        let mut meta: Vec<(u32, u64)> = Vec::new();
        while let Some((entry, _)) = vol.next_dir_entry(&mut cur).unwrap() {
            match entry[0] {
                ET_END => break,
                ET_BITMAP | ET_UPCASE => meta.push((
                    read_u32(&entry, 20).unwrap(),
                    read_u64(&entry, 24).unwrap(),
                )),
                _ => {}
            }
        }
        for (first, len) in meta {
            reachable.extend(vol.collect_chain(first, false, len).unwrap());
        }
        // Walk the tree.
        let mut stack = vec![root];
        while let Some(d) = stack.pop() {
            for info in vol.readdir_sets(&d) {
                if info.first_cluster != 0 {
                    reachable.extend(
                        vol.collect_chain(info.first_cluster, info.no_fat_chain, info.data_length)
                            .unwrap(),
                    );
                }
                if info.is_dir() {
                    stack.push(DirRef {
                        first_cluster: info.first_cluster,
                        no_fat_chain: info.no_fat_chain,
                        size: info.data_length,
                    });
                }
            }
        }

        reachable.sort_unstable();
        let allocated: Vec<u32> = (2..vol.geo.cluster_count + 2)
            .filter(|&c| vol.bitmap.is_set(c))
            .collect();
        assert_eq!(reachable, allocated);
    }

    impl ExFatVolume<RamDisk> {
        /// Test helper: the parsed entry sets of a directory.
        fn readdir_sets(&mut self, dir: &DirRef) -> Vec<dir::EntrySet> {
            let mut out = Vec::new();
            let mut cur = self.dir_cursor(dir);
            while let Some((entry, pos)) = self.next_dir_entry(&mut cur).unwrap() {
                match entry[0] {
                    ET_END => break,
                    ET_FILE => {
                        if let Some(set) = self.read_entry_set(&mut cur, entry, pos).unwrap() {
                            out.push(set);
                        }
                    }
                    _ => {}
                }
            }
            out
        }
    }

    #[test]
    fn remount_sees_persisted_state() {
        let disk = mkfs_exfat(64 * 1024 * 1024);
        let mut vol = ExFatVolume::mount(disk.share()).unwrap();
        vol.writefile("/persist.txt", b"still here").unwrap();
        vol.mkdir("/kept").unwrap();
        let free = vol.volume_info().unwrap().free_bytes;
        vol.unmount();

        let mut again = ExFatVolume::mount(disk).unwrap();
        assert_eq!(again.readfile("/persist.txt").unwrap(), b"still here");
        assert!(again.exists("/kept"));
        assert_eq!(again.volume_info().unwrap().free_bytes, free);
    }
}
