//! MFT record access and attribute plumbing.
//!
//! Records are located through the $MFT self-map held in the volume handle
//! (decoded once at mount), never by recursing through the filesystem.
//! Attribute search walks the typed records inside an MFT record buffer;
//! values are read either from the resident payload or by decoding data runs
//! and streaming the referenced clusters.

use log::warn;

use crate::cache::SectorCache;
use crate::device::BlockDevice;
use crate::error::{FsError, Result, try_zeroed_buffer};
use crate::layout::{read_bytes, read_u8, read_u16, read_u32, read_u64, read_utf16, utf16_to_ascii};
use crate::ntfs::NtfsVolume;
use crate::ntfs::fixup::apply_fixups;
use crate::ntfs::runs::{Extent, decode_runs};
use crate::path;

pub(crate) const ATTR_ATTRIBUTE_LIST: u32 = 0x20;
pub(crate) const ATTR_VOLUME_NAME: u32 = 0x60;
pub(crate) const ATTR_DATA: u32 = 0x80;
pub(crate) const ATTR_INDEX_ROOT: u32 = 0x90;
pub(crate) const ATTR_INDEX_ALLOCATION: u32 = 0xa0;
const ATTR_END: u32 = 0xffff_ffff;

/// Low 48 bits of an MFT reference are the record number; the rest is a
/// sequence count.
pub(crate) const MFT_REF_MASK: u64 = 0x0000_ffff_ffff_ffff;

/// Upper bound on extents decoded from a single attribute.
pub(crate) const MAX_EXTENTS: usize = 512;

/// Record header flag: record is in use.
pub(crate) const RECORD_IN_USE: u16 = 0x0001;
/// Record header flag: record describes a directory.
pub(crate) const RECORD_IS_DIRECTORY: u16 = 0x0002;

/// An attribute's value, however it is stored.
pub(crate) enum AttrStream {
    Resident(Vec<u8>),
    NonResident { extents: Vec<Extent>, size: u64 },
}

impl AttrStream {
    pub(crate) fn size(&self) -> u64 {
        match self {
            AttrStream::Resident(v) => v.len() as u64,
            AttrStream::NonResident { size, .. } => *size,
        }
    }
}

/// Finds an attribute by type and (optional) name, returning the attribute
/// record as a subslice of the MFT record buffer.
pub(crate) fn find_attr<'r>(
    record: &'r [u8],
    attr_type: u32,
    name: Option<&str>,
) -> Result<Option<&'r [u8]>> {
    let first = read_u16(record, 20)? as usize;
    let used = read_u32(record, 24)? as usize;
    if used > record.len() || first > used {
        return Err(FsError::Corrupt("MFT record sizes out of range"));
    }
    let mut offset = first;
    while offset + 4 <= used {
        let ty = read_u32(record, offset)?;
        if ty == ATTR_END {
            break;
        }
        let length = read_u32(record, offset + 4)? as usize;
        if length < 16 || offset + length > used {
            return Err(FsError::Corrupt("attribute length out of range"));
        }
        let attr = &record[offset..offset + length];
        if ty == attr_type && attr_name_matches(attr, name)? {
            return Ok(Some(attr));
        }
        offset += length;
    }
    Ok(None)
}

fn attr_name_matches(attr: &[u8], want: Option<&str>) -> Result<bool> {
    let name_len = read_u8(attr, 9)? as usize;
    match want {
        None => Ok(name_len == 0),
        Some(want) => {
            if name_len == 0 {
                return Ok(false);
            }
            let name_offset = read_u16(attr, 10)? as usize;
            let units = read_utf16(attr, name_offset, name_len)?;
            Ok(path::eq_fold(&utf16_to_ascii(&units), want))
        }
    }
}

pub(crate) fn is_nonresident(attr: &[u8]) -> Result<bool> {
    Ok(read_u8(attr, 8)? != 0)
}

pub(crate) fn resident_value(attr: &[u8]) -> Result<&[u8]> {
    let length = read_u32(attr, 16)? as usize;
    let offset = read_u16(attr, 20)? as usize;
    read_bytes(attr, offset, length)
}

/// Raw run-list bytes of a non-resident attribute.
pub(crate) fn run_bytes(attr: &[u8]) -> Result<&[u8]> {
    let offset = read_u16(attr, 32)? as usize;
    if offset > attr.len() {
        return Err(FsError::Corrupt("run list offset out of range"));
    }
    Ok(&attr[offset..])
}

pub(crate) fn nonresident_real_size(attr: &[u8]) -> Result<u64> {
    read_u64(attr, 48)
}

/// Resolves an attribute held entirely in one record.
fn local_stream(attr: &[u8]) -> Result<AttrStream> {
    if is_nonresident(attr)? {
        Ok(AttrStream::NonResident {
            extents: decode_runs(run_bytes(attr)?, MAX_EXTENTS)?,
            size: nonresident_real_size(attr)?,
        })
    } else {
        Ok(AttrStream::Resident(resident_value(attr)?.to_vec()))
    }
}

impl<D: BlockDevice> NtfsVolume<D> {
    /// Reads and validates MFT record `number` through the self-map,
    /// handling records that span an extent transition.
    pub(crate) fn read_record(&mut self, number: u64) -> Result<Vec<u8>> {
        let size = self.mft_record_size as usize;
        let mut buf = try_zeroed_buffer(size)?;
        let offset = number
            .checked_mul(size as u64)
            .ok_or(FsError::Corrupt("MFT record number out of range"))?;
        let map = core::mem::take(&mut self.mft_map);
        let read = Self::read_stream(
            &mut self.cache,
            self.sectors_per_cluster,
            &map,
            offset,
            &mut buf,
        );
        self.mft_map = map;
        read?;

        if &buf[0..4] != b"FILE" {
            return Err(FsError::Corrupt("MFT record signature"));
        }
        apply_fixups(&mut buf, self.bytes_per_sector as usize)?;
        Ok(buf)
    }

    /// Streams bytes out of an extent list, batching at most 64 clusters
    /// per device transfer and zero-filling sparse extents.
    pub(crate) fn read_stream(
        cache: &mut SectorCache<D>,
        sectors_per_cluster: u32,
        extents: &[Extent],
        mut offset: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        let sector_size = cache.sector_size() as u64;
        let cluster_bytes = sectors_per_cluster as u64 * sector_size;
        let mut pos = 0usize;

        while pos < buf.len() {
            let vcn = offset / cluster_bytes;
            let in_cluster = offset % cluster_bytes;
            let extent = extents
                .iter()
                .find(|e| vcn >= e.vcn && vcn < e.vcn + e.length)
                .ok_or(FsError::Corrupt("VCN not covered by extent list"))?;

            let bytes_left_in_extent =
                (extent.vcn + extent.length - vcn) * cluster_bytes - in_cluster;
            let chunk = ((buf.len() - pos) as u64)
                .min(bytes_left_in_extent)
                .min(64 * cluster_bytes) as usize;
            let dest = &mut buf[pos..pos + chunk];

            if extent.is_sparse() {
                dest.fill(0);
            } else {
                let disk_byte =
                    (extent.lcn + (vcn - extent.vcn)) * cluster_bytes + in_cluster;
                let first_sector = disk_byte / sector_size;
                let head = (disk_byte % sector_size) as usize;
                if head == 0
                    && chunk % sector_size as usize == 0
                    && chunk > 8 * sector_size as usize
                {
                    cache.read_direct(first_sector, dest)?;
                } else {
                    // Small and unaligned reads go sector-by-sector through
                    // the cache pool, keeping record and index traffic hot.
                    let mut copied = 0usize;
                    let mut sector = first_sector;
                    let mut skip = head;
                    while copied < chunk {
                        let cached = cache.read(sector)?;
                        let take = (chunk - copied).min(cached.len() - skip);
                        dest[copied..copied + take]
                            .copy_from_slice(&cached[skip..skip + take]);
                        copied += take;
                        skip = 0;
                        sector += 1;
                    }
                }
            }
            pos += chunk;
            offset += chunk as u64;
        }
        Ok(())
    }

    /// Reads an attribute's complete value out of a single record.
    fn read_attr_value(&mut self, attr: &[u8]) -> Result<Vec<u8>> {
        match local_stream(attr)? {
            AttrStream::Resident(v) => Ok(v),
            stream => self.read_attr_data(&stream),
        }
    }

    /// Materializes a whole attribute stream.
    pub(crate) fn read_attr_data(&mut self, stream: &AttrStream) -> Result<Vec<u8>> {
        match stream {
            AttrStream::Resident(v) => Ok(v.clone()),
            AttrStream::NonResident { extents, size } => {
                let mut buf = try_zeroed_buffer(*size as usize)?;
                Self::read_stream(
                    &mut self.cache,
                    self.sectors_per_cluster,
                    extents,
                    0,
                    &mut buf,
                )?;
                Ok(buf)
            }
        }
    }

    /// Finds an attribute of `base`, expanding $ATTRIBUTE_LIST when the
    /// record alone does not describe the whole value. Extension extents are
    /// shifted by the list entry's starting VCN and the merged list is
    /// sorted by VCN.
    pub(crate) fn attr_stream(
        &mut self,
        base: &[u8],
        base_number: u64,
        attr_type: u32,
        name: Option<&str>,
    ) -> Result<Option<AttrStream>> {
        let Some(list_attr) = find_attr(base, ATTR_ATTRIBUTE_LIST, None)? else {
            return match find_attr(base, attr_type, name)? {
                Some(attr) => Ok(Some(local_stream(attr)?)),
                None => Ok(None),
            };
        };

        let list = self.read_attr_value(list_attr)?;
        let mut extents: Vec<Extent> = Vec::new();
        let mut size: Option<u64> = None;
        let mut resident: Option<Vec<u8>> = None;
        let mut found = false;

        let mut offset = 0usize;
        while offset + 26 <= list.len() {
            let ty = read_u32(&list, offset)?;
            if ty == 0 {
                break;
            }
            let entry_len = read_u16(&list, offset + 4)? as usize;
            if entry_len < 26 {
                return Err(FsError::Corrupt("attribute-list entry length"));
            }
            if offset + entry_len > list.len() {
                break;
            }

            if ty == attr_type && list_name_matches(&list, offset, name)? {
                found = true;
                let starting_vcn = read_u64(&list, offset + 8)?;
                let reference = read_u64(&list, offset + 16)? & MFT_REF_MASK;

                let holder;
                let record: &[u8] = if reference == base_number {
                    base
                } else {
                    holder = self.read_record(reference)?;
                    &holder
                };
                let attr = find_attr(record, attr_type, name)?.ok_or(FsError::Corrupt(
                    "attribute-list entry points at a record without the attribute",
                ))?;
                if !is_nonresident(attr)? {
                    resident = Some(resident_value(attr)?.to_vec());
                } else {
                    // Run lists are expressed relative to the instance's own
                    // start, which the list entry's starting VCN names.
                    let mut piece = decode_runs(run_bytes(attr)?, MAX_EXTENTS)?;
                    for e in &mut piece {
                        e.vcn += starting_vcn;
                    }
                    if starting_vcn == 0 {
                        size = Some(nonresident_real_size(attr)?);
                    }
                    extents.extend(piece);
                }
            }
            offset += entry_len;
        }

        if !found {
            return Ok(None);
        }
        if let Some(value) = resident {
            return Ok(Some(AttrStream::Resident(value)));
        }
        extents.sort_by_key(|e| e.vcn);
        let cluster_bytes = self.sectors_per_cluster as u64 * self.bytes_per_sector as u64;
        let covered: u64 = extents.iter().map(|e| e.length).sum::<u64>() * cluster_bytes;
        let size = size.unwrap_or_else(|| {
            warn!("attribute list without a VCN-0 instance; sizing from extents");
            covered
        });
        Ok(Some(AttrStream::NonResident { extents, size }))
    }
}

fn list_name_matches(list: &[u8], entry: usize, want: Option<&str>) -> Result<bool> {
    let name_len = read_u8(list, entry + 6)? as usize;
    match want {
        None => Ok(name_len == 0),
        Some(want) => {
            if name_len == 0 {
                return Ok(false);
            }
            let name_offset = read_u8(list, entry + 7)? as usize;
            let units = read_utf16(list, entry + name_offset, name_len)?;
            Ok(path::eq_fold(&utf16_to_ascii(&units), want))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a bare MFT record buffer (no fixup encoding) holding the given
    /// attribute records.
    pub(crate) fn record_with_attrs(attrs: &[Vec<u8>]) -> Vec<u8> {
        let mut rec = vec![0u8; 1024];
        rec[0..4].copy_from_slice(b"FILE");
        crate::layout::put_u16(&mut rec, 20, 56);
        let mut offset = 56;
        for attr in attrs {
            rec[offset..offset + attr.len()].copy_from_slice(attr);
            offset += attr.len();
        }
        rec[offset..offset + 4].copy_from_slice(&ATTR_END.to_le_bytes());
        crate::layout::put_u32(&mut rec, 24, (offset + 8) as u32);
        rec
    }

    pub(crate) fn resident_attr(ty: u32, name: Option<&str>, value: &[u8]) -> Vec<u8> {
        let name_units = name.map(|n| n.len()).unwrap_or(0);
        let value_offset = (24 + name_units * 2).next_multiple_of(8);
        let length = (value_offset + value.len()).next_multiple_of(8);
        let mut attr = vec![0u8; length];
        crate::layout::put_u32(&mut attr, 0, ty);
        crate::layout::put_u32(&mut attr, 4, length as u32);
        attr[8] = 0;
        attr[9] = name_units as u8;
        crate::layout::put_u16(&mut attr, 10, 24);
        if let Some(n) = name {
            for (i, c) in n.chars().enumerate() {
                crate::layout::put_u16(&mut attr, 24 + i * 2, c as u16);
            }
        }
        crate::layout::put_u32(&mut attr, 16, value.len() as u32);
        crate::layout::put_u16(&mut attr, 20, value_offset as u16);
        attr[value_offset..value_offset + value.len()].copy_from_slice(value);
        attr
    }

    #[test]
    fn finds_attrs_by_type_and_name() {
        let rec = record_with_attrs(&[
            resident_attr(0x30, None, b"fn"),
            resident_attr(0x90, Some("$I30"), b"idx"),
            resident_attr(0x80, None, b"payload"),
        ]);
        let data = find_attr(&rec, 0x80, None).unwrap().unwrap();
        assert_eq!(resident_value(data).unwrap(), b"payload");
        let idx = find_attr(&rec, 0x90, Some("$I30")).unwrap().unwrap();
        assert_eq!(resident_value(idx).unwrap(), b"idx");
        assert!(find_attr(&rec, 0x90, Some("$J")).unwrap().is_none());
        assert!(find_attr(&rec, 0xb0, None).unwrap().is_none());
    }

    #[test]
    fn named_attr_does_not_match_unnamed_search() {
        let rec = record_with_attrs(&[resident_attr(0x80, Some("$Bad"), b"x")]);
        assert!(find_attr(&rec, 0x80, None).unwrap().is_none());
    }

    #[test]
    fn bogus_attr_length_is_corrupt() {
        let mut rec = record_with_attrs(&[resident_attr(0x80, None, b"x")]);
        crate::layout::put_u32(&mut rec, 56 + 4, 8);
        assert!(matches!(
            find_attr(&rec, 0x80, None),
            Err(FsError::Corrupt(_))
        ));
    }
}
