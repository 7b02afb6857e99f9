//! The storage stack: sector devices, the block cache and the ext2-style
//! volume, plus the kernel's handle to the mounted boot volume.

pub mod cache;
pub mod device;
pub mod ext2;
pub mod journal;

use crate::board::emmc::Emmc;
use crate::cell::InitCell;
use crate::kernel::syscall::SystemCallError;
use crate::process::resource::FileResource;
use crate::sync::SpinLock;
use device::{DeviceStatus, SectorDevice};
use ext2::{Ext2, Ext2Error};

/// The mounted boot volume. One lock serializes all filesystem work, which
/// also preserves the metadata write-back ordering during file creation.
static FILESYSTEM: InitCell<SpinLock<Ext2<Emmc>>> = InitCell::new();

/// Brings up the SD card and mounts the ext2 volume on it.
///
/// # Safety
///
/// Must only be called once, before anything performs file I/O
pub unsafe fn mount_boot_volume() {
    crate::call_once!();
    // SAFETY: This is the one place the controller handle is created
    let mut card = unsafe { Emmc::new() };
    match card.init() {
        DeviceStatus::Success => {}
        status => panic!("SD card initialization failed: {status}"),
    }
    let volume = Ext2::mount(card).unwrap_or_else(|err| panic!("Mounting the volume failed: {err}"));
    // SAFETY: Single initialization, per this function's contract
    unsafe {
        FILESYSTEM.set(SpinLock::new(volume));
    }
}

/// Runs `f` against the mounted volume
pub fn with_volume<R>(f: impl FnOnce(&mut Ext2<Emmc>) -> R) -> Option<R> {
    FILESYSTEM.get().map(|volume| f(&mut volume.lock()))
}

/// Opens the file at `path` (relative to the root directory), buffering its
/// whole body
pub fn open(path: &str) -> Result<FileResource, SystemCallError> {
    with_volume(|volume| {
        let inode = volume.lookup_path(path)?;
        if !inode.is_file() {
            return Err(Ext2Error::NotAFile);
        }
        volume.read_to_vec(&inode).map(FileResource::new)
    })
    .ok_or(SystemCallError::FileNotFound)?
    .map_err(|err| match err {
        Ext2Error::TooLarge => SystemCallError::DataOverflow,
        _ => SystemCallError::FileNotFound,
    })
}
