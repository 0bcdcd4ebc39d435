use core::alloc::Layout;

/// The closed error set reported through the uniform filesystem interface.
///
/// Every driver-internal failure maps onto one of these kinds before it
/// crosses a public boundary; nothing is silently swallowed except directory
/// entries with invalid checksums, which exFAT specifies are skipped during
/// iteration.
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("block device I/O failed")]
    Io,
    #[error("corrupt filesystem: {0}")]
    Corrupt(&'static str),
    #[error("out of memory")]
    OutOfMemory,
    #[error("no such file or directory")]
    NotFound,
    #[error("not a directory")]
    NotADirectory,
    #[error("not a file")]
    NotAFile,
    #[error("directory is not empty")]
    NotEmpty,
    #[error("name already exists")]
    AlreadyExists,
    #[error("no free space left on volume")]
    NoSpace,
    #[error("volume is read-only")]
    ReadOnly,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("operation not supported by this volume")]
    Unsupported,
}

pub type Result<T> = core::result::Result<T, FsError>;

impl From<std::collections::TryReserveError> for FsError {
    fn from(_: std::collections::TryReserveError) -> Self {
        FsError::OutOfMemory
    }
}

/// Allocates a zero-filled buffer, reporting allocation failure instead of
/// aborting.
pub(crate) fn try_zeroed_buffer(len: usize) -> Result<Vec<u8>> {
    // Guard the layout the allocator would see; a bogus on-disk size field
    // must not turn into a capacity overflow panic.
    if Layout::array::<u8>(len).is_err() {
        return Err(FsError::OutOfMemory);
    }
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)?;
    buf.resize(len, 0);
    Ok(buf)
}
