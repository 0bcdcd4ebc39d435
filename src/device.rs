//! Block-device abstraction and the logical-sector adapter.
//!
//! The UEFI wrapper hands the drivers a block device; filesystems think in
//! their own logical sectors. [`SectorAdapter`] owns the device and performs
//! the translation between the two, whatever the size ratio (1:n, n:1, 1:1).

use crate::error::{FsError, Result, try_zeroed_buffer};

/// A device addressable in fixed-size blocks.
///
/// This is the only way the filesystem core touches hardware. Reads and
/// writes may block while the underlying SPI/SD, USB or NVMe transfer
/// completes; the buffer length must be a multiple of [`block_size`].
///
/// [`block_size`]: BlockDevice::block_size
pub trait BlockDevice {
    /// Device block size in bytes, typically 512.
    fn block_size(&self) -> usize;

    /// Total number of blocks on the device.
    fn block_count(&self) -> u64;

    fn read_blocks(&mut self, lba: u64, buf: &mut [u8]) -> Result<()>;

    fn write_blocks(&mut self, lba: u64, buf: &[u8]) -> Result<()>;
}

/// Translates logical volume sectors to device blocks.
///
/// A cache *unit* is the larger of one logical sector and one device block;
/// units are addressed by derived LBA so that, when several logical sectors
/// share one device block, they also share one unit.
pub(crate) struct SectorAdapter<D> {
    dev: D,
    block_size: u32,
    sector_size: u32,
}

impl<D: BlockDevice> SectorAdapter<D> {
    pub(crate) fn new(dev: D, sector_size: u32) -> Result<Self> {
        let block_size = dev.block_size() as u32;
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(FsError::InvalidArgument("device block size"));
        }
        if !sector_size.is_power_of_two() || !(512..=4096).contains(&sector_size) {
            return Err(FsError::Corrupt("illegal logical sector size"));
        }
        Ok(Self {
            dev,
            block_size,
            sector_size,
        })
    }

    pub(crate) fn into_inner(self) -> D {
        self.dev
    }

    pub(crate) fn sector_size(&self) -> u32 {
        self.sector_size
    }

    pub(crate) fn total_sectors(&self) -> u64 {
        self.dev.block_count() * self.block_size as u64 / self.sector_size as u64
    }

    /// Size of one cache unit: `max(sector_size, block_size)`.
    pub(crate) fn unit_bytes(&self) -> usize {
        self.sector_size.max(self.block_size) as usize
    }

    /// Derived LBA of the unit holding `sector`, and the byte offset of the
    /// sector within that unit.
    pub(crate) fn unit_for(&self, sector: u64) -> (u64, usize) {
        if self.sector_size >= self.block_size {
            (sector * (self.sector_size / self.block_size) as u64, 0)
        } else {
            let byte = sector * self.sector_size as u64;
            (
                byte / self.block_size as u64,
                (byte % self.block_size as u64) as usize,
            )
        }
    }

    pub(crate) fn read_unit(&mut self, lba: u64, buf: &mut [u8]) -> Result<()> {
        self.dev.read_blocks(lba, buf)
    }

    pub(crate) fn write_unit(&mut self, lba: u64, buf: &[u8]) -> Result<()> {
        self.dev.write_blocks(lba, buf)
    }

    /// Bulk read of whole logical sectors.
    pub(crate) fn read_sectors(&mut self, first_sector: u64, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len() % self.sector_size as usize, 0);
        let byte = first_sector * self.sector_size as u64;
        if self.sector_size >= self.block_size {
            return self.dev.read_blocks(byte / self.block_size as u64, buf);
        }
        let bs = self.block_size as u64;
        let first_lba = byte / bs;
        let end = byte + buf.len() as u64;
        let head = (byte % bs) as usize;
        if head == 0 && end % bs == 0 {
            return self.dev.read_blocks(first_lba, buf);
        }
        // Unaligned run on a large-block device: bounce through a covering
        // block buffer.
        let blocks = (end.div_ceil(bs) - first_lba) as usize;
        let mut tmp = try_zeroed_buffer(blocks * bs as usize)?;
        self.dev.read_blocks(first_lba, &mut tmp)?;
        buf.copy_from_slice(&tmp[head..head + buf.len()]);
        Ok(())
    }

    /// Bulk write of whole logical sectors. Unaligned edges on a large-block
    /// device are read-modify-written.
    pub(crate) fn write_sectors(&mut self, first_sector: u64, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len() % self.sector_size as usize, 0);
        let byte = first_sector * self.sector_size as u64;
        if self.sector_size >= self.block_size {
            return self.dev.write_blocks(byte / self.block_size as u64, buf);
        }
        let bs = self.block_size as u64;
        let first_lba = byte / bs;
        let end = byte + buf.len() as u64;
        let head = (byte % bs) as usize;
        if head == 0 && end % bs == 0 {
            return self.dev.write_blocks(first_lba, buf);
        }
        let blocks = (end.div_ceil(bs) - first_lba) as usize;
        let mut tmp = try_zeroed_buffer(blocks * bs as usize)?;
        self.dev.read_blocks(first_lba, &mut tmp)?;
        tmp[head..head + buf.len()].copy_from_slice(buf);
        self.dev.write_blocks(first_lba, &tmp)
    }
}

#[cfg(test)]
pub(crate) mod testdisk {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    /// In-memory block device used throughout the test suite. The backing
    /// store is shared between `share`d handles, so a test can unmount a
    /// volume and remount the same image.
    pub(crate) struct RamDisk {
        data: Rc<RefCell<Vec<u8>>>,
        block_size: usize,
    }

    impl RamDisk {
        pub(crate) fn new(bytes: usize, block_size: usize) -> Self {
            Self::from_bytes(vec![0; bytes], block_size)
        }

        pub(crate) fn from_bytes(data: Vec<u8>, block_size: usize) -> Self {
            assert_eq!(data.len() % block_size, 0);
            Self {
                data: Rc::new(RefCell::new(data)),
                block_size,
            }
        }

        /// Another handle onto the same backing store.
        pub(crate) fn share(&self) -> RamDisk {
            Self {
                data: Rc::clone(&self.data),
                block_size: self.block_size,
            }
        }

        pub(crate) fn snapshot(&self) -> Vec<u8> {
            self.data.borrow().clone()
        }
    }

    impl BlockDevice for RamDisk {
        fn block_size(&self) -> usize {
            self.block_size
        }

        fn block_count(&self) -> u64 {
            (self.data.borrow().len() / self.block_size) as u64
        }

        fn read_blocks(&mut self, lba: u64, buf: &mut [u8]) -> Result<()> {
            let data = self.data.borrow();
            let start = lba as usize * self.block_size;
            let end = start + buf.len();
            if buf.len() % self.block_size != 0 || end > data.len() {
                return Err(FsError::Io);
            }
            buf.copy_from_slice(&data[start..end]);
            Ok(())
        }

        fn write_blocks(&mut self, lba: u64, buf: &[u8]) -> Result<()> {
            let mut data = self.data.borrow_mut();
            let start = lba as usize * self.block_size;
            let end = start + buf.len();
            if buf.len() % self.block_size != 0 || end > data.len() {
                return Err(FsError::Io);
            }
            data[start..end].copy_from_slice(buf);
            Ok(())
        }
    }
}
