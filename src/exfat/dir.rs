//! exFAT directories: 32-byte entry iteration over a cluster chain, entry
//! sets (File + Stream Extension + File Name), the name hash and set
//! checksum, and building/inserting/retiring sets.

use bitflags::bitflags;
use log::warn;

use crate::device::BlockDevice;
use crate::error::{FsError, Result};
use crate::exfat::ExFatVolume;
use crate::exfat::fat::FAT_EOC;
use crate::layout::{put_u16, put_u32, put_u64, read_u16, read_u32, read_u64, utf16_to_ascii};

pub(crate) const ENTRY_SIZE: usize = 32;

/// Entry types. Bit 7 is the InUse bit; clearing it retires an entry.
pub(crate) const ET_END: u8 = 0x00;
pub(crate) const ET_BITMAP: u8 = 0x81;
pub(crate) const ET_UPCASE: u8 = 0x82;
pub(crate) const ET_LABEL: u8 = 0x83;
pub(crate) const ET_FILE: u8 = 0x85;
pub(crate) const ET_STREAM: u8 = 0xc0;
pub(crate) const ET_NAME: u8 = 0xc1;
pub(crate) const IN_USE: u8 = 0x80;

/// Stream-extension flag: allocation is contiguous, FAT not consulted.
const FLAG_NO_FAT_CHAIN: u8 = 0x02;
/// Stream-extension flag: an allocation is possible for this entry.
const FLAG_ALLOC_POSSIBLE: u8 = 0x01;

/// UTF-16 code units per File Name entry.
const NAME_UNITS_PER_ENTRY: usize = 15;

/// Fixed creation stamp written into new entry sets: 2024-01-01 00:00:00.
/// Timestamps beyond this are out of scope for the workstation.
const CREATION_STAMP: u32 = (44 << 25) | (1 << 21) | (1 << 16);

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub(crate) struct FileAttributes: u16 {
        const READ_ONLY = 0x0001;
        const HIDDEN = 0x0002;
        const SYSTEM = 0x0004;
        const DIRECTORY = 0x0010;
        const ARCHIVE = 0x0020;
    }
}

/// A directory to iterate: where it starts and how its clusters chain.
#[derive(Clone, Copy, Debug)]
pub(crate) struct DirRef {
    pub first_cluster: u32,
    pub no_fat_chain: bool,
    /// Allocation size; bounds the walk for NoFatChain directories.
    pub size: u64,
}

/// Position of one 32-byte entry on disk, kept so rename/delete can rewrite
/// the entry in place.
#[derive(Clone, Copy, Debug)]
pub(crate) struct EntryPos {
    pub sector: u64,
    pub offset: usize,
}

/// Stateful cursor over a directory's 32-byte entries.
pub(crate) struct DirCursor {
    cluster: u32,
    sector_in_cluster: u32,
    entry_in_sector: usize,
    walked: u32,
    no_fat_chain: bool,
    cluster_limit: u32,
    done: bool,
}

/// A parsed entry set: the external view of one file or directory.
#[derive(Clone, Debug)]
pub(crate) struct EntrySet {
    pub name: String,
    pub attributes: FileAttributes,
    pub first_cluster: u32,
    pub data_length: u64,
    pub valid_data_length: u64,
    pub no_fat_chain: bool,
    pub positions: Vec<EntryPos>,
}

impl EntrySet {
    pub(crate) fn is_dir(&self) -> bool {
        self.attributes.contains(FileAttributes::DIRECTORY)
    }
}

/// Rolling 16-bit hash shared by the name hash and the set checksum:
/// rotate right one bit, add the next byte.
fn rotate_add(sum: u16, byte: u8) -> u16 {
    sum.rotate_right(1).wrapping_add(byte as u16)
}

/// Checksum over every byte of every entry in a set, except the checksum
/// field itself (bytes 2 and 3 of the File entry).
pub(crate) fn entry_set_checksum(entries: &[[u8; ENTRY_SIZE]]) -> u16 {
    let mut sum = 0u16;
    for (i, entry) in entries.iter().enumerate() {
        for (j, &byte) in entry.iter().enumerate() {
            if i == 0 && (j == 2 || j == 3) {
                continue;
            }
            sum = rotate_add(sum, byte);
        }
    }
    sum
}

fn upcase_unit(unit: u16) -> u16 {
    if (0x61..=0x7a).contains(&unit) {
        unit - 0x20
    } else {
        unit
    }
}

/// Hash of the up-cased name, low byte of each code unit first.
pub(crate) fn name_hash(name: &[u16]) -> u16 {
    let mut sum = 0u16;
    for &unit in name {
        let up = upcase_unit(unit);
        sum = rotate_add(sum, up as u8);
        sum = rotate_add(sum, (up >> 8) as u8);
    }
    sum
}

impl<D: BlockDevice> ExFatVolume<D> {
    pub(crate) fn dir_cursor(&self, dir: &DirRef) -> DirCursor {
        let cluster_limit = if dir.no_fat_chain {
            dir.size.div_ceil(self.geo.bytes_per_cluster()).max(1) as u32
        } else {
            u32::MAX
        };
        DirCursor {
            cluster: dir.first_cluster,
            sector_in_cluster: 0,
            entry_in_sector: 0,
            walked: 0,
            no_fat_chain: dir.no_fat_chain,
            cluster_limit,
            done: dir.first_cluster < 2,
        }
    }

    /// Yields the next raw 32-byte entry and its on-disk position, reading
    /// one sector at a time through the cache. Returns `None` at the end of
    /// the chain; the caller decides what an end-of-directory marker means.
    pub(crate) fn next_dir_entry(
        &mut self,
        cur: &mut DirCursor,
    ) -> Result<Option<([u8; ENTRY_SIZE], EntryPos)>> {
        if cur.done {
            return Ok(None);
        }
        let entries_per_sector = self.geo.bytes_per_sector as usize / ENTRY_SIZE;
        let sector = self.geo.cluster_sector(cur.cluster) + cur.sector_in_cluster as u64;
        let offset = cur.entry_in_sector * ENTRY_SIZE;

        let mut entry = [0u8; ENTRY_SIZE];
        entry.copy_from_slice(&self.cache.read(sector)?[offset..offset + ENTRY_SIZE]);
        let pos = EntryPos { sector, offset };

        cur.entry_in_sector += 1;
        if cur.entry_in_sector == entries_per_sector {
            cur.entry_in_sector = 0;
            cur.sector_in_cluster += 1;
            if cur.sector_in_cluster == self.geo.sectors_per_cluster {
                cur.sector_in_cluster = 0;
                cur.walked += 1;
                if cur.walked >= cur.cluster_limit {
                    cur.done = true;
                } else if cur.no_fat_chain {
                    cur.cluster += 1;
                    if !self.geo.cluster_in_range(cur.cluster) {
                        cur.done = true;
                    }
                } else {
                    if cur.walked > self.geo.cluster_count {
                        return Err(FsError::Corrupt("directory chain loops"));
                    }
                    match self.fat_get(cur.cluster)? {
                        FAT_EOC => cur.done = true,
                        next if self.geo.cluster_in_range(next) => cur.cluster = next,
                        _ => return Err(FsError::Corrupt("directory chain is broken")),
                    }
                }
            }
        }
        Ok(Some((entry, pos)))
    }

    /// Consumes the secondaries of a File entry and assembles the set.
    /// Sets that fail structural checks or the checksum are skipped, as the
    /// format specifies, and reported as `None`.
    pub(crate) fn read_entry_set(
        &mut self,
        cur: &mut DirCursor,
        file_entry: [u8; ENTRY_SIZE],
        file_pos: EntryPos,
    ) -> Result<Option<EntrySet>> {
        let secondary_count = file_entry[1] as usize;
        if secondary_count < 2 {
            warn!("exfat: file entry with {secondary_count} secondaries; skipped");
            return Ok(None);
        }

        let mut entries = vec![file_entry];
        let mut positions = vec![file_pos];
        for _ in 0..secondary_count {
            match self.next_dir_entry(cur)? {
                Some((entry, pos)) => {
                    entries.push(entry);
                    positions.push(pos);
                }
                None => {
                    warn!("exfat: truncated entry set; skipped");
                    return Ok(None);
                }
            }
        }

        let stored = read_u16(&entries[0], 2)?;
        if entry_set_checksum(&entries) != stored {
            warn!("exfat: entry set checksum mismatch; skipped");
            return Ok(None);
        }

        let stream = entries[1];
        if stream[0] != ET_STREAM {
            warn!("exfat: file entry not followed by a stream extension; skipped");
            return Ok(None);
        }
        if entries[2..].iter().any(|e| e[0] != ET_NAME) {
            warn!("exfat: malformed file-name entries; skipped");
            return Ok(None);
        }

        let name_length = stream[3] as usize;
        if entries.len() - 2 < name_length.div_ceil(NAME_UNITS_PER_ENTRY) {
            warn!("exfat: name length exceeds name entries; skipped");
            return Ok(None);
        }
        let mut units = Vec::with_capacity(name_length);
        'name: for entry in &entries[2..] {
            for i in 0..NAME_UNITS_PER_ENTRY {
                if units.len() == name_length {
                    break 'name;
                }
                units.push(read_u16(entry, 2 + i * 2)?);
            }
        }

        Ok(Some(EntrySet {
            name: utf16_to_ascii(&units),
            attributes: FileAttributes::from_bits_truncate(read_u16(&entries[0], 4)?),
            first_cluster: read_u32(&stream, 20)?,
            data_length: read_u64(&stream, 24)?,
            valid_data_length: read_u64(&stream, 8)?,
            no_fat_chain: stream[1] & FLAG_NO_FAT_CHAIN != 0,
            positions,
        }))
    }

    /// Iterates the entry sets of a directory, ASCII-case-insensitively
    /// looking for `name`.
    pub(crate) fn find_entry(&mut self, dir: &DirRef, name: &str) -> Result<Option<EntrySet>> {
        let mut cur = self.dir_cursor(dir);
        while let Some((entry, pos)) = self.next_dir_entry(&mut cur)? {
            match entry[0] {
                ET_END => break,
                ET_FILE => {
                    if let Some(set) = self.read_entry_set(&mut cur, entry, pos)? {
                        if crate::path::eq_fold(&set.name, name) {
                            return Ok(Some(set));
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(None)
    }

    /// Writes a built entry set into the first run of free slots, extending
    /// the directory by a cluster when no run is long enough.
    pub(crate) fn insert_entry_set(
        &mut self,
        dir: &DirRef,
        entries: &[[u8; ENTRY_SIZE]],
    ) -> Result<()> {
        let need = entries.len();
        let mut run: Vec<EntryPos> = Vec::new();
        let mut cur = self.dir_cursor(dir);
        while let Some((entry, pos)) = self.next_dir_entry(&mut cur)? {
            if entry[0] & IN_USE == 0 {
                run.push(pos);
                if run.len() == need {
                    return self.write_entries_at(&run, entries);
                }
            } else {
                run.clear();
            }
        }

        if dir.no_fat_chain {
            // A contiguous directory cannot grow in place.
            return Err(FsError::NoSpace);
        }
        let chain = self.collect_chain(dir.first_cluster, false, 0)?;
        let mut tail = *chain
            .last()
            .ok_or(FsError::Corrupt("directory has no clusters"))?;
        let bytes_per_sector = self.geo.bytes_per_sector as usize;
        let entries_per_cluster = (self.geo.bytes_per_cluster() as usize) / ENTRY_SIZE;
        loop {
            let cluster = self.alloc_cluster(Some(tail))?;
            self.cache.zero_direct(
                self.geo.cluster_sector(cluster),
                self.geo.sectors_per_cluster as u64,
            )?;
            for i in 0..entries_per_cluster {
                run.push(EntryPos {
                    sector: self.geo.cluster_sector(cluster)
                        + (i * ENTRY_SIZE / bytes_per_sector) as u64,
                    offset: (i * ENTRY_SIZE) % bytes_per_sector,
                });
                if run.len() == need {
                    return self.write_entries_at(&run, entries);
                }
            }
            tail = cluster;
        }
    }

    fn write_entries_at(
        &mut self,
        positions: &[EntryPos],
        entries: &[[u8; ENTRY_SIZE]],
    ) -> Result<()> {
        for (pos, entry) in positions.iter().zip(entries) {
            let sector = self.cache.read_mut(pos.sector)?;
            sector[pos.offset..pos.offset + ENTRY_SIZE].copy_from_slice(entry);
        }
        Ok(())
    }

    /// Retires a set by clearing the InUse bit of every entry in it.
    pub(crate) fn mark_set_deleted(&mut self, set: &EntrySet) -> Result<()> {
        for pos in &set.positions {
            let sector = self.cache.read_mut(pos.sector)?;
            sector[pos.offset] &= !IN_USE;
        }
        Ok(())
    }
}

/// Builds the on-disk entries of a set: File, Stream Extension, and as many
/// File Name entries as the name needs, checksummed.
pub(crate) fn build_entry_set(
    name: &str,
    attributes: FileAttributes,
    first_cluster: u32,
    data_length: u64,
    valid_data_length: u64,
    no_fat_chain: bool,
) -> Result<Vec<[u8; ENTRY_SIZE]>> {
    crate::path::check_name(name)?;
    let units: Vec<u16> = name.bytes().map(u16::from).collect();
    let name_entries = units.len().div_ceil(NAME_UNITS_PER_ENTRY);

    let mut file = [0u8; ENTRY_SIZE];
    file[0] = ET_FILE;
    file[1] = (1 + name_entries) as u8;
    put_u16(&mut file, 4, attributes.bits());
    put_u32(&mut file, 8, CREATION_STAMP);
    put_u32(&mut file, 12, CREATION_STAMP);
    put_u32(&mut file, 16, CREATION_STAMP);

    let mut stream = [0u8; ENTRY_SIZE];
    stream[0] = ET_STREAM;
    stream[1] = FLAG_ALLOC_POSSIBLE | if no_fat_chain { FLAG_NO_FAT_CHAIN } else { 0 };
    stream[3] = units.len() as u8;
    put_u16(&mut stream, 4, name_hash(&units));
    put_u64(&mut stream, 8, valid_data_length);
    put_u32(&mut stream, 20, first_cluster);
    put_u64(&mut stream, 24, data_length);

    let mut entries = vec![file, stream];
    for chunk in units.chunks(NAME_UNITS_PER_ENTRY) {
        let mut entry = [0u8; ENTRY_SIZE];
        entry[0] = ET_NAME;
        for (i, &unit) in chunk.iter().enumerate() {
            put_u16(&mut entry, 2 + i * 2, unit);
        }
        entries.push(entry);
    }

    let checksum = entry_set_checksum(&entries);
    put_u16(&mut entries[0], 2, checksum);
    Ok(entries)
}
