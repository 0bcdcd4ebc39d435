//! FAT32 directory entries for the formatter: 8.3 short names, VFAT long
//! names, lookup-or-create directories, and streaming file writes into a
//! freshly formatted volume.

use crate::device::BlockDevice;
use crate::error::{FsError, Result};
use crate::fat32::Fat32Formatter;
use crate::fat32::boot::ROOT_CLUSTER;
use crate::layout::{put_u16, put_u32};
use crate::path;

pub(crate) const ATTR_VOLUME_ID: u8 = 0x08;
pub(crate) const ATTR_DIRECTORY: u8 = 0x10;
pub(crate) const ATTR_ARCHIVE: u8 = 0x20;
pub(crate) const ATTR_LONG_NAME: u8 = 0x0f;

const ENTRY_FREE: u8 = 0xe5;
/// Marks the first physical (last logical) entry of an LFN chain.
const LAST_LONG_ENTRY: u8 = 0x40;
/// UTF-16 code units per LFN entry: 5 + 6 + 2.
const LFN_UNITS: usize = 13;

/// Fixed creation stamp: 2024-01-01, midnight.
const CREATION_DATE: u16 = (44 << 9) | (1 << 5) | 1;
const CREATION_TIME: u16 = 0;

/// Direct 8.3 conversion: uppercase, space-padded, or `None` when the name
/// needs a long-name chain.
pub(crate) fn short_name_for(name: &str) -> Option<[u8; 11]> {
    let upper = name.to_ascii_uppercase();
    let (stem, ext) = match upper.rsplit_once('.') {
        Some((stem, ext)) => (stem, ext),
        None => (upper.as_str(), ""),
    };
    if stem.is_empty() || stem.len() > 8 || ext.len() > 3 {
        return None;
    }
    if !stem.bytes().all(short_char_ok) || !ext.bytes().all(short_char_ok) {
        return None;
    }
    let mut out = [b' '; 11];
    out[..stem.len()].copy_from_slice(stem.as_bytes());
    out[8..8 + ext.len()].copy_from_slice(ext.as_bytes());
    Some(out)
}

fn short_char_ok(c: u8) -> bool {
    matches!(c,
        b'A'..=b'Z' | b'0'..=b'9'
        | b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'(' | b')'
        | b'-' | b'@' | b'^' | b'_' | b'`' | b'{' | b'}' | b'~')
}

/// `NAME~n` short name generated for a long-name entry.
fn generated_short(name: &str, n: u32) -> [u8; 11] {
    let upper = name.to_ascii_uppercase();
    let (stem, ext) = match upper.rsplit_once('.') {
        Some((stem, ext)) => (stem, ext),
        None => (upper.as_str(), ""),
    };
    let base: Vec<u8> = stem.bytes().filter(|&c| short_char_ok(c)).collect();
    let ext: Vec<u8> = ext.bytes().filter(|&c| short_char_ok(c)).take(3).collect();

    let tail = format!("~{n}");
    let keep = (8 - tail.len()).min(base.len());
    let mut out = [b' '; 11];
    out[..keep].copy_from_slice(&base[..keep]);
    out[keep..keep + tail.len()].copy_from_slice(tail.as_bytes());
    out[8..8 + ext.len()].copy_from_slice(&ext);
    out
}

/// Short-name checksum linking LFN entries to their 8.3 entry.
pub(crate) fn lfn_checksum(short: &[u8; 11]) -> u8 {
    short.iter().fold(0u8, |sum, &b| {
        ((sum & 1) << 7).wrapping_add(sum >> 1).wrapping_add(b)
    })
}

/// The LFN chain for `name`, in physical (reversed) order, ready to be
/// written directly before the 8.3 entry.
fn lfn_entries(name: &str, checksum: u8) -> Vec<[u8; 32]> {
    let mut units: Vec<u16> = name.bytes().map(u16::from).collect();
    let count = units.len().div_ceil(LFN_UNITS);
    if units.len() < count * LFN_UNITS {
        units.push(0);
        units.resize(count * LFN_UNITS, 0xffff);
    }

    let mut entries = Vec::with_capacity(count);
    for logical in (0..count).rev() {
        let chunk = &units[logical * LFN_UNITS..(logical + 1) * LFN_UNITS];
        let mut e = [0u8; 32];
        e[0] = (logical + 1) as u8;
        if logical + 1 == count {
            e[0] |= LAST_LONG_ENTRY;
        }
        for (i, &u) in chunk[..5].iter().enumerate() {
            put_u16(&mut e, 1 + i * 2, u);
        }
        e[11] = ATTR_LONG_NAME;
        e[13] = checksum;
        for (i, &u) in chunk[5..11].iter().enumerate() {
            put_u16(&mut e, 14 + i * 2, u);
        }
        for (i, &u) in chunk[11..13].iter().enumerate() {
            put_u16(&mut e, 28 + i * 2, u);
        }
        entries.push(e);
    }
    entries
}

/// One 8.3 directory entry with the fixed creation stamp.
pub(crate) fn dir_entry_83(
    short: [u8; 11],
    attributes: u8,
    first_cluster: u32,
    size: u32,
) -> [u8; 32] {
    let mut e = [0u8; 32];
    e[..11].copy_from_slice(&short);
    e[11] = attributes;
    put_u16(&mut e, 14, CREATION_TIME);
    put_u16(&mut e, 16, CREATION_DATE);
    put_u16(&mut e, 18, CREATION_DATE);
    put_u16(&mut e, 20, (first_cluster >> 16) as u16);
    put_u16(&mut e, 22, CREATION_TIME);
    put_u16(&mut e, 24, CREATION_DATE);
    put_u16(&mut e, 26, first_cluster as u16);
    put_u32(&mut e, 28, size);
    e
}

pub(crate) fn volume_label_entry(label: [u8; 11]) -> [u8; 32] {
    let mut e = [0u8; 32];
    e[..11].copy_from_slice(&label);
    e[11] = ATTR_VOLUME_ID;
    e
}

fn decode_short(raw: &[u8]) -> String {
    let stem = core::str::from_utf8(&raw[0..8]).unwrap_or("").trim_end();
    let ext = core::str::from_utf8(&raw[8..11]).unwrap_or("").trim_end();
    if ext.is_empty() {
        stem.to_string()
    } else {
        format!("{stem}.{ext}")
    }
}

fn lfn_units_of(entry: &[u8]) -> [u16; LFN_UNITS] {
    let mut units = [0u16; LFN_UNITS];
    for i in 0..5 {
        units[i] = u16::from_le_bytes([entry[1 + i * 2], entry[2 + i * 2]]);
    }
    for i in 0..6 {
        units[5 + i] = u16::from_le_bytes([entry[14 + i * 2], entry[15 + i * 2]]);
    }
    for i in 0..2 {
        units[11 + i] = u16::from_le_bytes([entry[28 + i * 2], entry[29 + i * 2]]);
    }
    units
}

fn lfn_to_string(units: &[u16]) -> String {
    units
        .iter()
        .take_while(|&&u| u != 0 && u != 0xffff)
        .map(|&u| if u < 0x80 { u as u8 as char } else { '?' })
        .collect()
}

impl<D: BlockDevice> Fat32Formatter<D> {
    /// Writes `data` at `file_path`, creating missing directories along the
    /// way. Only valid after `format`; existing names are not overwritten.
    pub fn write_file(&mut self, file_path: &str, data: &[u8]) -> Result<()> {
        let (parents, leaf) = path::parent_and_leaf(file_path)?;
        let mut dir = ROOT_CLUSTER;
        for component in parents {
            dir = self.ensure_dir(dir, component)?;
        }
        if self.lookup(dir, leaf)?.is_some() {
            return Err(FsError::AlreadyExists);
        }

        let cluster_bytes = self.geometry().bytes_per_cluster();
        let count = data.len().div_ceil(cluster_bytes);
        let first_cluster = if count == 0 {
            0
        } else {
            let first = self.alloc_chain(count as u32)?;
            for i in 0..count {
                let chunk = &data[i * cluster_bytes..data.len().min((i + 1) * cluster_bytes)];
                self.write_cluster(first + i as u32, chunk)?;
            }
            first
        };

        let size = u32::try_from(data.len())
            .map_err(|_| FsError::InvalidArgument("file too large for FAT32"))?;
        self.add_dir_entry(dir, leaf, first_cluster, size, ATTR_ARCHIVE)
    }

    /// Writes one cluster of file data, zero-padding the partial final
    /// sector and zeroing any unused sectors.
    fn write_cluster(&mut self, cluster: u32, chunk: &[u8]) -> Result<()> {
        let geo = *self.geometry();
        let bps = geo.bytes_per_sector as usize;
        let first_sector = geo.cluster_sector(cluster);

        let full_sectors = chunk.len() / bps;
        if full_sectors > 0 {
            self.write_sectors_raw(first_sector, &chunk[..full_sectors * bps])?;
        }
        let tail = chunk.len() % bps;
        let mut used_sectors = full_sectors as u64;
        if tail > 0 {
            let mut last = vec![0u8; bps];
            last[..tail].copy_from_slice(&chunk[full_sectors * bps..]);
            self.write_sectors_raw(first_sector + full_sectors as u64, &last)?;
            used_sectors += 1;
        }
        if used_sectors < geo.sectors_per_cluster as u64 {
            self.zero_sectors(
                first_sector + used_sectors,
                geo.sectors_per_cluster as u64 - used_sectors,
            )?;
        }
        Ok(())
    }

    /// Looks `name` up in a directory, reconstructing long names from their
    /// LFN chains. Returns `(first_cluster, attributes, size)`.
    pub(crate) fn lookup(
        &mut self,
        dir_cluster: u32,
        name: &str,
    ) -> Result<Option<(u32, u8, u32)>> {
        let geo = *self.geometry();
        let mut cluster = dir_cluster;
        let mut lfn: Vec<u16> = Vec::new();
        loop {
            for s in 0..geo.sectors_per_cluster as u64 {
                let buf = self.read_dir_sector(geo.cluster_sector(cluster) + s)?;
                for entry in buf.chunks_exact(32) {
                    match entry[0] {
                        0x00 => return Ok(None),
                        ENTRY_FREE => {
                            lfn.clear();
                            continue;
                        }
                        _ => {}
                    }
                    if entry[11] == ATTR_LONG_NAME {
                        let logical = (entry[0] & 0x1f) as usize;
                        if logical == 0 {
                            lfn.clear();
                            continue;
                        }
                        if lfn.len() < logical * LFN_UNITS {
                            lfn.resize(logical * LFN_UNITS, 0xffff);
                        }
                        lfn[(logical - 1) * LFN_UNITS..logical * LFN_UNITS]
                            .copy_from_slice(&lfn_units_of(entry));
                        continue;
                    }
                    if entry[11] & ATTR_VOLUME_ID != 0 {
                        lfn.clear();
                        continue;
                    }

                    let long = if lfn.is_empty() {
                        String::new()
                    } else {
                        lfn_to_string(&lfn)
                    };
                    lfn.clear();
                    let short = decode_short(&entry[0..11]);
                    if path::eq_fold(name, &short)
                        || (!long.is_empty() && path::eq_fold(name, &long))
                    {
                        let first = (u16::from_le_bytes([entry[20], entry[21]]) as u32) << 16
                            | u16::from_le_bytes([entry[26], entry[27]]) as u32;
                        let size = u32::from_le_bytes(entry[28..32].try_into().unwrap());
                        return Ok(Some((first, entry[11], size)));
                    }
                }
            }
            match self.fat_get(cluster)? {
                next if next >= 0x0fff_fff8 || next < 2 => return Ok(None),
                next => cluster = next,
            }
        }
    }

    /// Lookup-or-create for one path component.
    pub(crate) fn ensure_dir(&mut self, parent: u32, name: &str) -> Result<u32> {
        if let Some((cluster, attributes, _)) = self.lookup(parent, name)? {
            if attributes & ATTR_DIRECTORY != 0 {
                return Ok(cluster);
            }
            return Err(FsError::NotADirectory);
        }

        let geo = *self.geometry();
        let cluster = self.alloc_chain(1)?;
        self.zero_sectors(geo.cluster_sector(cluster), geo.sectors_per_cluster as u64)?;
        // Dot entries, with `..` pointing at 0 for the root as the format
        // prescribes.
        let dot = dir_entry_83(*b".          ", ATTR_DIRECTORY, cluster, 0);
        let dotdot_cluster = if parent == ROOT_CLUSTER { 0 } else { parent };
        let dotdot = dir_entry_83(*b"..         ", ATTR_DIRECTORY, dotdot_cluster, 0);
        self.write_dir_slot(geo.cluster_sector(cluster), 0, &dot)?;
        self.write_dir_slot(geo.cluster_sector(cluster), 1, &dotdot)?;

        self.add_dir_entry(parent, name, cluster, 0, ATTR_DIRECTORY)?;
        Ok(cluster)
    }

    /// Appends a (possibly LFN-chained) directory entry to a directory,
    /// extending its cluster chain when the end marker region runs out.
    pub(crate) fn add_dir_entry(
        &mut self,
        dir_cluster: u32,
        name: &str,
        first_cluster: u32,
        size: u32,
        attributes: u8,
    ) -> Result<()> {
        let entries: Vec<[u8; 32]> = match short_name_for(name) {
            Some(short) => vec![dir_entry_83(short, attributes, first_cluster, size)],
            None => {
                let short = self.unique_short(dir_cluster, name)?;
                let mut chain = lfn_entries(name, lfn_checksum(&short));
                chain.push(dir_entry_83(short, attributes, first_cluster, size));
                chain
            }
        };

        let geo = *self.geometry();
        let per_cluster = geo.bytes_per_cluster() / 32;

        // Find the end-marker slot, then make sure the chain has room for
        // the whole entry run.
        let mut chain = vec![dir_cluster];
        loop {
            let last = *chain.last().unwrap();
            match self.fat_get(last)? {
                next if next >= 0x0fff_fff8 || next < 2 => break,
                next => chain.push(next),
            }
        }
        let mut free_at = chain.len() * per_cluster;
        'scan: for (ci, &cluster) in chain.iter().enumerate() {
            for s in 0..geo.sectors_per_cluster as u64 {
                let buf = self.read_dir_sector(geo.cluster_sector(cluster) + s)?;
                for (ei, entry) in buf.chunks_exact(32).enumerate() {
                    if entry[0] == 0x00 {
                        free_at = ci * per_cluster
                            + s as usize * (geo.bytes_per_sector as usize / 32)
                            + ei;
                        break 'scan;
                    }
                }
            }
        }
        while free_at + entries.len() > chain.len() * per_cluster {
            let tail = *chain.last().unwrap();
            let new = self.alloc_chain(1)?;
            self.fat_set(tail, new)?;
            self.zero_sectors(geo.cluster_sector(new), geo.sectors_per_cluster as u64)?;
            chain.push(new);
        }

        for (k, entry) in entries.iter().enumerate() {
            let slot = free_at + k;
            let cluster = chain[slot / per_cluster];
            self.write_dir_slot(geo.cluster_sector(cluster), slot % per_cluster, entry)?;
        }
        Ok(())
    }

    /// Picks a `NAME~n` short name that is free in the directory.
    fn unique_short(&mut self, dir_cluster: u32, name: &str) -> Result<[u8; 11]> {
        for n in 1..100 {
            let candidate = generated_short(name, n);
            if !self.short_exists(dir_cluster, &candidate)? {
                return Ok(candidate);
            }
        }
        Err(FsError::AlreadyExists)
    }

    fn short_exists(&mut self, dir_cluster: u32, short: &[u8; 11]) -> Result<bool> {
        let geo = *self.geometry();
        let mut cluster = dir_cluster;
        loop {
            for s in 0..geo.sectors_per_cluster as u64 {
                let buf = self.read_dir_sector(geo.cluster_sector(cluster) + s)?;
                for entry in buf.chunks_exact(32) {
                    if entry[0] == 0x00 {
                        return Ok(false);
                    }
                    if entry[0] != ENTRY_FREE
                        && entry[11] != ATTR_LONG_NAME
                        && &entry[0..11] == short
                    {
                        return Ok(true);
                    }
                }
            }
            match self.fat_get(cluster)? {
                next if next >= 0x0fff_fff8 || next < 2 => return Ok(false),
                next => cluster = next,
            }
        }
    }
}
