//! `ov6fs`: a persistent, indexed-allocation filesystem core.
//!
//! [`FileSystem`] bundles the sector cache, free-sector allocator and
//! open-inode table that the rest of the workspace's crates leave generic,
//! into a single value created at mount time rather than a handful of
//! module-level globals, so two filesystems (or the same one mounted
//! twice in a test) can coexist in one process.

mod device;
mod file;

pub use device::{FileSectorDevice, MemSectorDevice};
pub use file::File;
pub use fs_types::{InodeKind, SectorNo, SECTOR_SIZE};
pub use inode::InodeError;
use sector_cache::SectorDevice;

/// A mounted filesystem: one sector cache, one free-sector allocator, one
/// open-inode table, generic over the block device underneath.
pub struct FileSystem<Device>
where
    Device: SectorDevice<SECTOR_SIZE>,
{
    cache: inode::Cache<Device>,
    free_map: inode::Allocator,
    table: inode::InodeTable,
}

impl<Device> FileSystem<Device>
where
    Device: SectorDevice<SECTOR_SIZE>,
{
    /// Mounts `device`, which must have exactly `total_sectors` sectors.
    /// If `format` is set, the device is treated as empty: a fresh free
    /// map is written (sectors 0 and 1 reserved for the bitmap and the
    /// root directory) and the root directory inode is created. Otherwise
    /// the free map is loaded back from sector 0.
    pub fn mount(device: Device, total_sectors: usize, format: bool) -> Result<Self, InodeError<Device::Error>> {
        let mut cache = inode::Cache::new(device);
        cache.init();
        let table = inode::InodeTable::init();

        let free_map = if format {
            let free_map = inode::Allocator::format(total_sectors, [SectorNo::FREE_MAP, SectorNo::ROOT_DIR]);
            namespace::format_root(&cache, &free_map, &table)?;
            free_map
        } else {
            let image = cache.read(SectorNo::FREE_MAP.as_index())?.bytes();
            inode::Allocator::from_sector(&image, total_sectors)
        };

        Ok(Self { cache, free_map, table })
    }

    /// Flushes the free map and every dirty cache line back to the device,
    /// writing the free map first. Callers should do this before dropping
    /// the `FileSystem` (or the device) to avoid losing writes — there is
    /// no automatic flush-on-drop, and crash consistency across a flush
    /// that is interrupted partway through is out of scope.
    pub fn shutdown(&self) -> Result<(), InodeError<Device::Error>> {
        if self.free_map.is_dirty() {
            let image = self.free_map.flush();
            self.cache.alloc(SectorNo::FREE_MAP.as_index())?.write_bytes(&image);
        }
        self.cache.flush(Some(SectorNo::FREE_MAP.as_index()))?;
        Ok(())
    }

    /// Creates a regular file at `path` with `initial_size` bytes (typically
    /// zero; sparse allocation means no data sectors are touched until
    /// written), relative to `proc`'s working directory if not absolute.
    /// `false` means the parent does not exist, is not a directory, or
    /// already has an entry with that name.
    pub fn create(&self, proc: &Process, path: &str, initial_size: u32) -> Result<bool, InodeError<Device::Error>> {
        namespace::create(&self.cache, &self.free_map, &self.table, proc.cwd, path, initial_size)
    }

    /// Creates a directory at `path` with its own `.`/`..` entries. `initial_size`
    /// is passed through to the new inode the same way [`Self::create`]
    /// passes it for a file.
    pub fn mkdir(&self, proc: &Process, path: &str, initial_size: u32) -> Result<bool, InodeError<Device::Error>> {
        namespace::mkdir(&self.cache, &self.free_map, &self.table, proc.cwd, path, initial_size)
    }

    /// Removes the entry at `path`. Refuses the root and non-empty
    /// directories.
    pub fn remove(&self, proc: &Process, path: &str) -> Result<bool, InodeError<Device::Error>> {
        namespace::remove(&self.cache, &self.free_map, &self.table, proc.cwd, path)
    }

    /// Changes `proc`'s working directory to `path` if it resolves to a
    /// directory. Leaves `proc` unchanged and returns `false` otherwise.
    pub fn chdir(&self, proc: &mut Process, path: &str) -> Result<bool, InodeError<Device::Error>> {
        match namespace::chdir(&self.cache, &self.free_map, &self.table, proc.cwd, path)? {
            Some(sector) => {
                proc.cwd = sector;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Opens `path`, file or directory, returning `None` if it does not
    /// resolve.
    pub fn open<'fs>(&'fs self, proc: &Process, path: &str) -> Result<Option<File<'fs, Device>>, InodeError<Device::Error>> {
        let handle = namespace::open(&self.cache, &self.free_map, &self.table, proc.cwd, path)?;
        Ok(handle.map(|h| File::new(self, h)))
    }
}

/// A caller's working-directory context. Every path resolution takes one
/// so that relative paths mean something without the filesystem itself
/// tracking "the current process" — there can be as many `Process`es as
/// callers need, unlike the single implicit current-process xv6 and the
/// original both assume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Process {
    cwd: SectorNo,
}

impl Process {
    #[must_use]
    pub fn at_root() -> Self {
        Self { cwd: SectorNo::ROOT_DIR }
    }

    #[must_use]
    pub fn cwd(&self) -> SectorNo {
        self.cwd
    }
}

impl Default for Process {
    fn default() -> Self {
        Self::at_root()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh(sectors: usize) -> FileSystem<MemSectorDevice> {
        FileSystem::mount(MemSectorDevice::new(sectors), sectors, true).unwrap()
    }

    #[test]
    fn mount_format_then_reopen_preserves_state() {
        let fs = fresh(256);
        let proc = Process::at_root();
        assert!(fs.create(&proc, "/a.txt", 0).unwrap());
        let f = fs.open(&proc, "/a.txt").unwrap().unwrap();
        assert_eq!(f.write(b"hello").unwrap(), 5);
        f.close().unwrap();
        fs.shutdown().unwrap();
    }

    #[test]
    fn write_then_seek_and_reread() {
        let fs = fresh(256);
        let proc = Process::at_root();
        fs.create(&proc, "/f", 0).unwrap();
        let f = fs.open(&proc, "/f").unwrap().unwrap();
        f.write(b"0123456789").unwrap();
        f.seek(0);
        let mut buf = [0u8; 4];
        assert_eq!(f.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"0123");
        assert_eq!(f.tell(), 4);
        f.close().unwrap();
    }

    #[test]
    fn two_handles_on_the_same_file_share_writes() {
        let fs = fresh(256);
        let proc = Process::at_root();
        fs.create(&proc, "/word.txt", 0).unwrap();
        let a = fs.open(&proc, "/word.txt").unwrap().unwrap();
        let b = fs.open(&proc, "/word.txt").unwrap().unwrap();
        a.write(b"abcd_efgh_ijkl_mnop_").unwrap();
        b.seek(0);
        let mut buf = [0u8; 20];
        assert_eq!(b.read(&mut buf).unwrap(), 20);
        assert_eq!(&buf, b"abcd_efgh_ijkl_mnop_");
        a.close().unwrap();
        b.close().unwrap();
    }
}
