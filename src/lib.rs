//! # survival-fs
//!
//! Portable filesystem driver layer for the survival workstation: exFAT
//! (read/write), NTFS (read-only) and a FAT32 formatter, all speaking to the
//! outside world through a block-device trait and a uniform volume interface.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use survival_fs::{BlockDevice, Volume};
//!
//! let mut vol = Volume::mount(device)?;
//! vol.writefile("/notes/hello.txt", b"Hello, world!\n")?;
//! for entry in vol.readdir("/notes")? {
//!     println!("{} {}", entry.name, entry.size);
//! }
//! vol.unmount();
//! ```
//!
//! The crate never allocates global state: every mounted volume owns its
//! sector cache, geometry and (for exFAT) allocation bitmap, and all of it is
//! released by `unmount`.

/// Sector cache with clock eviction and write-back.
pub(crate) mod cache;
/// Block-device trait and logical-sector adapter.
pub mod device;
pub mod error;
/// FAT32 formatting and post-format file writes.
pub mod fat32;
/// Bounds-checked little-endian field access.
pub(crate) mod layout;
/// Path validation, splitting and boundary conversion.
pub mod path;
/// Uniform volume dispatcher.
pub mod volume;

/// exFAT driver (read/write).
pub mod exfat;
/// NTFS driver (read-only).
pub mod ntfs;

pub use device::BlockDevice;
pub use error::{FsError, Result};
pub use volume::{DirEntryInfo, Volume, VolumeInfo};

pub const GB: u32 = 1024 * 1024 * 1024;
pub const MB: u32 = 1024 * 1024;
pub const KB: u16 = 1024;

/// Longest name reported through the uniform interface, in bytes.
pub const MAX_NAME_LEN: usize = 127;
/// Longest path accepted by the uniform interface, in bytes.
pub const MAX_PATH_LEN: usize = 512;
