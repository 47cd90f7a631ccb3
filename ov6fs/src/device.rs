//! [`sector_cache::SectorDevice`] implementations. Neither one depends on
//! the rest of the crate: a `FileSystem` is generic over any such device,
//! these two are just the ones this crate ships so it is runnable without
//! real block hardware.

use std::{
    convert::Infallible,
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::Path,
    sync::Mutex,
};

use fs_types::SECTOR_SIZE;
use sector_cache::SectorDevice;

fn poisoned<T>(guard: std::sync::LockResult<T>) -> T {
    guard.unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A disk backed by a plain in-memory buffer. Dropping it discards the
/// image; there is no durability beyond the process's own lifetime, useful
/// for tests and for running the filesystem without a real disk image.
pub struct MemSectorDevice {
    sectors: Mutex<Vec<[u8; SECTOR_SIZE]>>,
}

impl MemSectorDevice {
    #[must_use]
    pub fn new(sector_count: usize) -> Self {
        Self { sectors: Mutex::new(vec![[0; SECTOR_SIZE]; sector_count]) }
    }

    #[must_use]
    pub fn sector_count(&self) -> usize {
        poisoned(self.sectors.lock()).len()
    }
}

impl SectorDevice<SECTOR_SIZE> for MemSectorDevice {
    type Error = Infallible;

    fn read_sector(&self, sector: usize, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), Infallible> {
        *buf = poisoned(self.sectors.lock())[sector];
        Ok(())
    }

    fn write_sector(&self, sector: usize, buf: &[u8; SECTOR_SIZE]) -> Result<(), Infallible> {
        poisoned(self.sectors.lock())[sector] = *buf;
        Ok(())
    }
}

/// A disk backed by a real OS file, seeking to `sector * SECTOR_SIZE` for
/// every access.
pub struct FileSectorDevice {
    file: Mutex<File>,
}

impl FileSectorDevice {
    /// Opens an existing disk image.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file: Mutex::new(file) })
    }

    /// Creates a fresh, zero-filled disk image of `sector_count` sectors,
    /// truncating any existing file at `path`.
    pub fn create(path: impl AsRef<Path>, sector_count: usize) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(path)?;
        file.set_len((sector_count * SECTOR_SIZE) as u64)?;
        Ok(Self { file: Mutex::new(file) })
    }
}

impl SectorDevice<SECTOR_SIZE> for FileSectorDevice {
    type Error = io::Error;

    fn read_sector(&self, sector: usize, buf: &mut [u8; SECTOR_SIZE]) -> io::Result<()> {
        let mut file = poisoned(self.file.lock());
        file.seek(SeekFrom::Start((sector * SECTOR_SIZE) as u64))?;
        file.read_exact(buf)
    }

    fn write_sector(&self, sector: usize, buf: &[u8; SECTOR_SIZE]) -> io::Result<()> {
        let mut file = poisoned(self.file.lock());
        file.seek(SeekFrom::Start((sector * SECTOR_SIZE) as u64))?;
        file.write_all(buf)
    }
}
