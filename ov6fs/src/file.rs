//! An open file or directory handle with a cursor, the same role
//! `file.rs` plays over `inode.rs` in the systems this crate is grounded
//! on.

use std::sync::atomic::{AtomicUsize, Ordering};

use fs_types::{InodeKind, SECTOR_SIZE};
use inode::InodeError;
use sector_cache::SectorDevice;

use crate::FileSystem;

/// An open inode together with a read/write cursor. Closing is explicit
/// (via [`File::close`]) so the caller observes the deferred-delete result;
/// dropping an unclosed handle still closes it, best-effort, so a forgotten
/// handle never leaks the open-inode table's ref-count.
pub struct File<'fs, Device>
where
    Device: SectorDevice<SECTOR_SIZE>,
{
    pub(crate) fs: &'fs FileSystem<Device>,
    pub(crate) handle: Option<inode::Handle>,
    offset: AtomicUsize,
}

impl<'fs, Device> File<'fs, Device>
where
    Device: SectorDevice<SECTOR_SIZE>,
{
    pub(crate) fn new(fs: &'fs FileSystem<Device>, handle: inode::Handle) -> Self {
        Self { fs, handle: Some(handle), offset: AtomicUsize::new(0) }
    }

    fn handle(&self) -> &inode::Handle {
        self.handle.as_ref().expect("file already closed")
    }

    #[must_use]
    pub fn inumber(&self) -> fs_types::SectorNo {
        inode::inumber(self.handle())
    }

    pub fn kind(&self) -> Result<InodeKind, InodeError<Device::Error>> {
        inode::kind(&self.fs.cache, self.handle())
    }

    pub fn length(&self) -> Result<u32, InodeError<Device::Error>> {
        inode::length(&self.fs.cache, self.handle())
    }

    /// Reads at the current cursor, advancing it by the number of bytes
    /// actually transferred.
    pub fn read(&self, dst: &mut [u8]) -> Result<usize, InodeError<Device::Error>> {
        let offset = self.offset.load(Ordering::Relaxed);
        let n = inode::read_at(&self.fs.cache, &self.fs.free_map, self.handle(), dst, offset)?;
        self.offset.fetch_add(n, Ordering::Relaxed);
        Ok(n)
    }

    /// Writes at the current cursor, advancing it by the number of bytes
    /// actually transferred.
    pub fn write(&self, src: &[u8]) -> Result<usize, InodeError<Device::Error>> {
        let offset = self.offset.load(Ordering::Relaxed);
        let n = inode::write_at(&self.fs.cache, &self.fs.free_map, self.handle(), src, offset)?;
        self.offset.fetch_add(n, Ordering::Relaxed);
        Ok(n)
    }

    pub fn seek(&self, offset: usize) {
        self.offset.store(offset, Ordering::Relaxed);
    }

    #[must_use]
    pub fn tell(&self) -> usize {
        self.offset.load(Ordering::Relaxed)
    }

    pub fn deny_write(&self) {
        inode::deny_write(self.handle());
    }

    pub fn allow_write(&self) {
        inode::allow_write(self.handle());
    }

    /// Closes the handle, returning `true` if this was the last open
    /// reference to a `remove`d file (so its sectors were just released).
    pub fn close(mut self) -> Result<bool, InodeError<Device::Error>> {
        let handle = self.handle.take().expect("file already closed");
        self.fs.table.close(handle, &self.fs.cache, &self.fs.free_map)
    }
}

impl<Device> Drop for File<'_, Device>
where
    Device: SectorDevice<SECTOR_SIZE>,
{
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.fs.table.close(handle, &self.fs.cache, &self.fs.free_map);
        }
    }
}
