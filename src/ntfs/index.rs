//! Directory index traversal: $INDEX_ROOT plus the INDX blocks of
//! $INDEX_ALLOCATION for large directories.

use crate::device::BlockDevice;
use crate::error::{FsError, Result, try_zeroed_buffer};
use crate::layout::{read_bytes, read_u8, read_u16, read_u32, read_u64, read_utf16, utf16_to_ascii};
use crate::ntfs::NtfsVolume;
use crate::ntfs::fixup::apply_fixups;
use crate::ntfs::record::{
    ATTR_INDEX_ALLOCATION, ATTR_INDEX_ROOT, AttrStream, MFT_REF_MASK, RECORD_IN_USE,
    RECORD_IS_DIRECTORY, find_attr, is_nonresident, resident_value,
};
use crate::path;
use crate::volume::DirEntryInfo;

/// FILE_NAME attribute flag marking a directory.
const FILE_ATTR_DIRECTORY: u32 = 0x1000_0000;

/// Index-entry flags.
const ENTRY_LAST: u8 = 0x02;

/// The DOS filename namespace. Win32 and Win32+DOS names beat pure DOS
/// names when the same record shows up under both.
const NS_DOS: u8 = 2;

/// One filename candidate pulled out of an index node.
pub(crate) struct RawDirEntry {
    pub mft_ref: u64,
    pub name: String,
    pub namespace: u8,
    pub is_dir: bool,
    pub size: u64,
}

/// Walks the entries of one index node. `header_at` is the offset of the
/// index-node header within `node` (16 for an INDEX_ROOT value, 24 for an
/// INDX block). Returns `false` if the visitor stopped the walk.
fn walk_node(
    node: &[u8],
    header_at: usize,
    visit: &mut impl FnMut(RawDirEntry) -> bool,
) -> Result<bool> {
    let entries_offset = read_u32(node, header_at)? as usize;
    let index_length = read_u32(node, header_at + 4)? as usize;
    let end = (header_at + index_length).min(node.len());

    let mut offset = header_at + entries_offset;
    loop {
        let entry_length = read_u16(node, offset + 8)? as usize;
        if entry_length < 16 {
            return Err(FsError::Corrupt("index entry length"));
        }
        if read_u8(node, offset + 12)? & ENTRY_LAST != 0 {
            return Ok(true);
        }

        let stream_length = read_u16(node, offset + 10)? as usize;
        // 66 bytes is the smallest FILE_NAME stream that can hold a name.
        if stream_length >= 66 {
            let stream = read_bytes(node, offset + 16, stream_length)?;
            let name_len = read_u8(stream, 64)? as usize;
            if 66 + name_len * 2 <= stream_length {
                let units = read_utf16(stream, 66, name_len)?;
                let name = utf16_to_ascii(&units);
                if name != "." && name != ".." {
                    let flags = read_u32(stream, 56)?;
                    let is_dir = flags & FILE_ATTR_DIRECTORY != 0;
                    let entry = RawDirEntry {
                        mft_ref: read_u64(node, offset)? & MFT_REF_MASK,
                        name,
                        namespace: read_u8(stream, 65)?,
                        is_dir,
                        size: if is_dir { 0 } else { read_u64(stream, 48)? },
                    };
                    if !visit(entry) {
                        return Ok(false);
                    }
                }
            }
        }

        offset += entry_length;
        if offset >= end {
            return Ok(true);
        }
    }
}

impl<D: BlockDevice> NtfsVolume<D> {
    /// Feeds every filename candidate of a directory to `visit`, first from
    /// the resident INDEX_ROOT, then from each INDX block referenced by
    /// INDEX_ALLOCATION. The visitor returns `false` to stop early.
    pub(crate) fn walk_dir(
        &mut self,
        record_number: u64,
        visit: &mut impl FnMut(RawDirEntry) -> bool,
    ) -> Result<()> {
        let record = self.read_record(record_number)?;
        let flags = read_u16(&record, 22)?;
        if flags & RECORD_IN_USE == 0 {
            return Err(FsError::NotFound);
        }
        if flags & RECORD_IS_DIRECTORY == 0 {
            return Err(FsError::NotADirectory);
        }

        let root_attr = find_attr(&record, ATTR_INDEX_ROOT, Some("$I30"))?
            .ok_or(FsError::Corrupt("directory has no index root"))?;
        if is_nonresident(root_attr)? {
            return Err(FsError::Corrupt("index root must be resident"));
        }
        let root = resident_value(root_attr)?;
        let has_children = read_u8(root, 16 + 12)? & 0x01 != 0;
        if !walk_node(root, 16, visit)? {
            return Ok(());
        }
        if !has_children {
            return Ok(());
        }

        let stream = self
            .attr_stream(&record, record_number, ATTR_INDEX_ALLOCATION, Some("$I30"))?
            .ok_or(FsError::Corrupt("index allocation attribute missing"))?;
        let AttrStream::NonResident { extents, size } = stream else {
            return Err(FsError::Corrupt("index allocation must be non-resident"));
        };

        let block = self.index_block_size as usize;
        let mut buf = try_zeroed_buffer(block)?;
        let mut offset = 0u64;
        while offset + block as u64 <= size {
            Self::read_stream(
                &mut self.cache,
                self.sectors_per_cluster,
                &extents,
                offset,
                &mut buf,
            )?;
            // Blocks the index never initialized carry no signature; skip
            // them rather than fail the listing.
            if &buf[0..4] == b"INDX" {
                apply_fixups(&mut buf, self.bytes_per_sector as usize)?;
                if !walk_node(&buf, 24, visit)? {
                    return Ok(());
                }
            }
            offset += block as u64;
        }
        Ok(())
    }

    /// Lists a directory with the namespace dedup rule applied: a record
    /// indexed under both a DOS short name and a Win32 long name is reported
    /// once, under the Win32 name.
    pub(crate) fn list_dir(&mut self, record_number: u64) -> Result<Vec<DirEntryInfo>> {
        let mut raw: Vec<RawDirEntry> = Vec::new();
        self.walk_dir(record_number, &mut |entry| {
            match raw.iter().position(|e| e.mft_ref == entry.mft_ref) {
                Some(i) => {
                    if raw[i].namespace == NS_DOS && entry.namespace != NS_DOS {
                        raw[i] = entry;
                    }
                }
                None => raw.push(entry),
            }
            true
        })?;

        let mut entries: Vec<DirEntryInfo> = raw
            .into_iter()
            .map(|e| {
                let mut name = e.name;
                name.truncate(crate::MAX_NAME_LEN);
                DirEntryInfo {
                    name,
                    size: e.size,
                    is_dir: e.is_dir,
                }
            })
            .collect();
        crate::volume::sort_entries(&mut entries);
        Ok(entries)
    }

    /// Indexed lookup: the listing walk, short-circuited on the first
    /// ASCII-case-insensitive match.
    pub(crate) fn lookup_in_dir(&mut self, dir: u64, name: &str) -> Result<Option<RawDirEntry>> {
        let mut found = None;
        self.walk_dir(dir, &mut |entry| {
            if path::eq_fold(&entry.name, name) {
                found = Some(entry);
                false
            } else {
                true
            }
        })?;
        Ok(found)
    }
}
