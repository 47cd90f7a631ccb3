//! Free-sector bitmap allocator.
//!
//! This crate is deliberately small: it is an external collaborator of the
//! filesystem core, referenced only through `allocate`/`release`/`flush`.
//! It knows nothing about the sector cache or the block device — `ov6fs`
//! reads and writes the bitmap's serialized form into sector 0 itself.

use std::fmt;

use fs_types::SectorNo;
use mutex_api::Mutex;

/// Bits held in one 512-byte bitmap sector.
pub const BITS_PER_SECTOR: usize = fs_types::SECTOR_SIZE * 8;

#[derive(Debug)]
pub struct Bitmap {
    bits: Vec<bool>,
    dirty: bool,
}

impl Bitmap {
    fn empty(total_sectors: usize) -> Self {
        Self { bits: vec![false; total_sectors], dirty: true }
    }

    /// Loads a bitmap previously produced by [`FreeMap::snapshot`].
    #[must_use]
    pub fn from_sector(bytes: &[u8; fs_types::SECTOR_SIZE], total_sectors: usize) -> Self {
        assert!(total_sectors <= BITS_PER_SECTOR, "device too large for a single-sector free map");
        let mut bits = vec![false; total_sectors];
        for (i, bit) in bits.iter_mut().enumerate() {
            *bit = (bytes[i / 8] >> (i % 8)) & 1 != 0;
        }
        Self { bits, dirty: false }
    }

    fn contiguous_free_run(&self, count: usize) -> Option<usize> {
        if count == 0 {
            return None;
        }
        let mut run = 0;
        for (i, &used) in self.bits.iter().enumerate() {
            if used {
                run = 0;
                continue;
            }
            run += 1;
            if run == count {
                return Some(i + 1 - count);
            }
        }
        None
    }
}

/// A sector-bitmap allocator. Generic over the lock so `ov6fs` can share
/// the same [`mutex_api::Mutex`] seam every other layer uses.
pub struct FreeMap<BitsMutex>
where
    BitsMutex: Mutex<Data = Bitmap>,
{
    bits: BitsMutex,
}

impl<BitsMutex> FreeMap<BitsMutex>
where
    BitsMutex: Mutex<Data = Bitmap>,
{
    /// Formats a fresh, empty bitmap for a device of `total_sectors`
    /// sectors, with `reserved` already marked in use (typically sector 0,
    /// the bitmap itself, and sector 1, the root directory inode).
    pub fn format(total_sectors: usize, reserved: impl IntoIterator<Item = SectorNo>) -> Self {
        let mut bitmap = Bitmap::empty(total_sectors);
        for sector in reserved {
            bitmap.bits[sector.as_index()] = true;
        }
        Self { bits: BitsMutex::new(bitmap) }
    }

    /// Loads a bitmap from its on-disk sector image.
    pub fn from_sector(bytes: &[u8; fs_types::SECTOR_SIZE], total_sectors: usize) -> Self {
        Self { bits: BitsMutex::new(Bitmap::from_sector(bytes, total_sectors)) }
    }

    /// Allocates `count` contiguous sectors, returning the first one.
    pub fn allocate(&self, count: usize) -> Result<SectorNo, AllocError> {
        let mut bitmap = self.bits.lock();
        let start = bitmap.contiguous_free_run(count).ok_or(AllocError::OutOfSpace)?;
        for i in start..start + count {
            bitmap.bits[i] = true;
        }
        bitmap.dirty = true;
        Ok(SectorNo::new(u32::try_from(start).expect("sector index fits in u32")))
    }

    /// Releases `count` sectors starting at `first`.
    ///
    /// # Panics
    ///
    /// Panics if any sector in the range was not allocated — releasing a
    /// free sector is a bookkeeping bug in the caller, not a recoverable
    /// condition.
    pub fn release(&self, first: SectorNo, count: usize) {
        let mut bitmap = self.bits.lock();
        let start = first.as_index();
        for i in start..start + count {
            assert!(bitmap.bits[i], "double release of sector {i}");
            bitmap.bits[i] = false;
        }
        bitmap.dirty = true;
    }

    /// Serializes the bitmap into one sector-sized image, clearing the
    /// dirty flag. The caller is responsible for actually writing the
    /// returned bytes to sector 0.
    pub fn flush(&self) -> [u8; fs_types::SECTOR_SIZE] {
        let mut bitmap = self.bits.lock();
        let mut out = [0u8; fs_types::SECTOR_SIZE];
        for (i, &used) in bitmap.bits.iter().enumerate() {
            if used {
                out[i / 8] |= 1 << (i % 8);
            }
        }
        bitmap.dirty = false;
        out
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.bits.lock().dirty
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    OutOfSpace,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("free-sector allocator has no run of the requested length")
    }
}

impl std::error::Error for AllocError {}
