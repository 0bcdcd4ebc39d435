//! The uniform volume interface.
//!
//! One mounted volume at a time, tagged by filesystem. The set of drivers
//! is closed, so a sum type carries the dispatch; each public operation
//! routes to the active driver or answers for tags without one.

use crate::device::BlockDevice;
use crate::error::{FsError, Result, try_zeroed_buffer};
use crate::exfat::ExFatVolume;
use crate::ntfs::NtfsVolume;

/// External view of one directory entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntryInfo {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VolumeInfo {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

/// Listing order: directories first, then case-insensitive ASCII ascending.
pub(crate) fn sort_entries(entries: &mut [DirEntryInfo]) {
    entries.sort_by(|a, b| {
        b.is_dir.cmp(&a.is_dir).then_with(|| {
            a.name
                .bytes()
                .map(|c| c.to_ascii_lowercase())
                .cmp(b.name.bytes().map(|c| c.to_ascii_lowercase()))
        })
    });
}

/// A mounted volume. `SimpleFs` stands for the firmware's own filesystem,
/// which the boot wrapper serves directly; the drivers here never touch it.
pub enum Volume<D: BlockDevice> {
    SimpleFs,
    ExFat(ExFatVolume<D>),
    Ntfs(NtfsVolume<D>),
}

impl<D: BlockDevice> Volume<D> {
    /// Probes the boot sector and mounts with the matching driver.
    pub fn mount(mut device: D) -> Result<Self> {
        let block_size = device.block_size();
        let blocks = 512usize.div_ceil(block_size).max(1);
        let mut sector0 = try_zeroed_buffer(blocks * block_size)?;
        device.read_blocks(0, &mut sector0)?;

        match &sector0[3..11] {
            b"EXFAT   " => Ok(Volume::ExFat(ExFatVolume::mount(device)?)),
            b"NTFS    " => Ok(Volume::Ntfs(NtfsVolume::mount(device)?)),
            _ => Err(FsError::Corrupt("unrecognized filesystem signature")),
        }
    }

    /// Flushes everything and releases the volume. Never fails observably.
    pub fn unmount(self) {
        match self {
            Volume::SimpleFs => {}
            Volume::ExFat(vol) => vol.unmount(),
            Volume::Ntfs(vol) => vol.unmount(),
        }
    }

    pub fn readdir(&mut self, path: &str) -> Result<Vec<DirEntryInfo>> {
        match self {
            Volume::SimpleFs => Err(FsError::Unsupported),
            Volume::ExFat(vol) => vol.readdir(path),
            Volume::Ntfs(vol) => vol.readdir(path),
        }
    }

    pub fn readfile(&mut self, path: &str) -> Result<Vec<u8>> {
        match self {
            Volume::SimpleFs => Err(FsError::Unsupported),
            Volume::ExFat(vol) => vol.readfile(path),
            Volume::Ntfs(vol) => vol.readfile(path),
        }
    }

    pub fn writefile(&mut self, path: &str, data: &[u8]) -> Result<()> {
        match self {
            Volume::SimpleFs => Err(FsError::Unsupported),
            Volume::ExFat(vol) => vol.writefile(path, data),
            Volume::Ntfs(vol) => vol.writefile(path, data),
        }
    }

    pub fn mkdir(&mut self, path: &str) -> Result<()> {
        match self {
            Volume::SimpleFs => Err(FsError::Unsupported),
            Volume::ExFat(vol) => vol.mkdir(path),
            Volume::Ntfs(vol) => vol.mkdir(path),
        }
    }

    pub fn rename(&mut self, path: &str, new_name: &str) -> Result<()> {
        match self {
            Volume::SimpleFs => Err(FsError::Unsupported),
            Volume::ExFat(vol) => vol.rename(path, new_name),
            Volume::Ntfs(vol) => vol.rename(path, new_name),
        }
    }

    pub fn delete(&mut self, path: &str) -> Result<()> {
        match self {
            Volume::SimpleFs => Err(FsError::Unsupported),
            Volume::ExFat(vol) => vol.delete(path),
            Volume::Ntfs(vol) => vol.delete(path),
        }
    }

    /// Existence check; never fails.
    pub fn exists(&mut self, path: &str) -> bool {
        match self {
            Volume::SimpleFs => false,
            Volume::ExFat(vol) => vol.exists(path),
            Volume::Ntfs(vol) => vol.exists(path),
        }
    }

    /// File size; 0 for directories and missing paths, never fails.
    pub fn file_size(&mut self, path: &str) -> u64 {
        let size = match self {
            Volume::SimpleFs => return 0,
            Volume::ExFat(vol) => vol.file_size(path),
            Volume::Ntfs(vol) => vol.file_size(path),
        };
        size.unwrap_or(0)
    }

    pub fn volume_info(&mut self) -> Result<VolumeInfo> {
        match self {
            Volume::SimpleFs => Err(FsError::Unsupported),
            Volume::ExFat(vol) => vol.volume_info(),
            Volume::Ntfs(vol) => vol.volume_info(),
        }
    }

    /// Volume label; empty when the volume has none.
    pub fn label(&self) -> &str {
        match self {
            Volume::SimpleFs => "",
            Volume::ExFat(vol) => vol.label(),
            Volume::Ntfs(vol) => vol.label(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testdisk::RamDisk;
    use crate::exfat::tests::mkfs_exfat;

    #[test]
    fn sorts_directories_first_then_names() {
        let mut entries = vec![
            DirEntryInfo {
                name: "zeta.txt".into(),
                size: 1,
                is_dir: false,
            },
            DirEntryInfo {
                name: "Alpha.txt".into(),
                size: 1,
                is_dir: false,
            },
            DirEntryInfo {
                name: "music".into(),
                size: 0,
                is_dir: true,
            },
            DirEntryInfo {
                name: "beta".into(),
                size: 0,
                is_dir: true,
            },
        ];
        sort_entries(&mut entries);
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["beta", "music", "Alpha.txt", "zeta.txt"]);
    }

    #[test]
    fn probes_and_dispatches_exfat() {
        let mut vol = Volume::mount(mkfs_exfat(64 * 1024 * 1024)).unwrap();
        assert!(matches!(vol, Volume::ExFat(_)));
        assert_eq!(vol.label(), "SURVIVAL");

        vol.mkdir("/notes").unwrap();
        vol.writefile("/notes/hello.txt", b"Hello, world!\n").unwrap();
        assert_eq!(vol.readfile("/notes/hello.txt").unwrap(), b"Hello, world!\n");
        assert_eq!(vol.file_size("/notes/hello.txt"), 14);
        assert_eq!(vol.file_size("/notes"), 0);
        assert_eq!(vol.file_size("/missing"), 0);
        assert!(vol.exists("/NOTES/HELLO.TXT"));

        let listing = vol.readdir("/").unwrap();
        assert_eq!(listing[0].name, "notes");
        assert!(listing[0].is_dir);
        vol.unmount();
    }

    #[test]
    fn probes_and_dispatches_ntfs() {
        let mut vol = Volume::mount(crate::ntfs::tests::build_image()).unwrap();
        assert!(matches!(vol, Volume::Ntfs(_)));
        assert!(matches!(
            vol.writefile("/docs/new.txt", b"x"),
            Err(FsError::ReadOnly)
        ));
        assert_eq!(vol.readfile("/docs/readme.txt").unwrap().len(), 512);
        vol.unmount();
    }

    #[test]
    fn unknown_signatures_do_not_mount() {
        let disk = RamDisk::new(1024 * 1024, 512);
        assert!(matches!(
            Volume::mount(disk),
            Err(FsError::Corrupt(_))
        ));
    }

    #[test]
    fn simple_fs_tag_reports_unsupported() {
        let mut vol: Volume<RamDisk> = Volume::SimpleFs;
        assert!(matches!(vol.readdir("/"), Err(FsError::Unsupported)));
        assert!(matches!(vol.writefile("/x", b""), Err(FsError::Unsupported)));
        assert!(!vol.exists("/x"));
        assert_eq!(vol.file_size("/x"), 0);
        assert_eq!(vol.label(), "");
        vol.unmount();
    }
}
