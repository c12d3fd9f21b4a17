//! `FS_IOC_FSGETXATTR`/`FS_IOC_FSSETXATTR` wrappers.
//!
//! The limiter binds a directory to an XFS project by writing the project id
//! into the directory's `fsxattr` record.  [`set_project_id`] always sets
//! `PROJECT_INHERIT` as well, so everything created below the directory
//! inherits the association.

use std::fs::File;
use std::os::fd::AsRawFd;

use nix::errno::Errno;

// Flag bits of `fsxattr.fsx_xflags` from <uapi/linux/fs.h>.
pub const FLAG_REALTIME: u32 = 0x0000_0001;
pub const FLAG_PREALLOCATED: u32 = 0x0000_0002;
pub const FLAG_IMMUTABLE: u32 = 0x0000_0008;
pub const FLAG_APPEND: u32 = 0x0000_0010;
pub const FLAG_SYNC: u32 = 0x0000_0020;
pub const FLAG_NOATIME: u32 = 0x0000_0040;
pub const FLAG_NODUMP: u32 = 0x0000_0080;
pub const FLAG_PROJECT_INHERIT: u32 = 0x0000_0200;
pub const FLAG_DAX: u32 = 0x0000_8000;
pub const FLAG_HAS_ATTRIBUTE: u32 = 0x8000_0000;

/// The kernel's `struct fsxattr` from `<uapi/linux/fs.h>`; layout must match
/// exactly.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FsXAttrs {
    pub flags: u32,
    pub extent_size: u32,
    pub extent_count: u32,
    pub project_id: u32,
    pub cow_extent_size: u32,
    padding: [u8; 8],
}

nix::ioctl_read!(fs_ioc_fsgetxattr, b'X', 31, FsXAttrs);
nix::ioctl_write_ptr!(fs_ioc_fssetxattr, b'X', 32, FsXAttrs);

/// Reads the extended attributes of an open file or directory.
pub fn get(file: &File) -> Result<FsXAttrs, Errno> {
    let mut attrs = FsXAttrs::default();
    unsafe { fs_ioc_fsgetxattr(file.as_raw_fd(), &mut attrs) }?;
    Ok(attrs)
}

/// Writes the extended attributes of an open file or directory.
pub fn set(file: &File, attrs: &FsXAttrs) -> Result<(), Errno> {
    unsafe { fs_ioc_fssetxattr(file.as_raw_fd(), attrs) }?;
    Ok(())
}

/// Returns the project id the file is accounted against.
pub fn get_project_id(file: &File) -> Result<u32, Errno> {
    Ok(get(file)?.project_id)
}

/// Binds the file to `project_id` with inheritance for new children.
pub fn set_project_id(file: &File, project_id: u32) -> Result<(), Errno> {
    let mut attrs = get(file)?;
    attrs.project_id = project_id;
    attrs.flags |= FLAG_PROJECT_INHERIT;
    set(file, &attrs)
}
