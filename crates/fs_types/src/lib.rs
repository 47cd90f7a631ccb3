//! On-disk data types for the `ov6fs` filesystem core.
//!
//! Every type here is [`dataview::Pod`] and is meant to be cast directly
//! over the bytes of a cached sector (see `sector_cache::SectorGuard::view`)
//! rather than copied in and out by hand.
//!
//! The address layout has 123 direct entries, one single-indirect slot and
//! one doubly-indirect slot (125 addresses total), large enough to hold a
//! multi-megabyte file from three levels of indirection without ever
//! growing the inode image itself past one sector.

use std::fmt;

use dataview::{Pod, PodMethods};

/// Size in bytes of one sector, and of every on-disk structure below.
pub const SECTOR_SIZE: usize = 512;

/// Maximum length, in bytes, of a single path component.
pub const NAME_MAX: usize = 14;

/// Number of direct data-sector addresses stored in an inode.
pub const DIRECT_COUNT: usize = 123;

/// Index of the single-indirect address slot.
pub const INDIRECT_SLOT: usize = DIRECT_COUNT;

/// Index of the doubly-indirect address slot.
pub const DINDIRECT_SLOT: usize = DIRECT_COUNT + 1;

/// Total number of address slots in an inode.
pub const ADDR_COUNT: usize = DIRECT_COUNT + 2;

/// Number of sector addresses held by one indirect block.
pub const ENTRIES_PER_INDIRECT: usize = SECTOR_SIZE / size_of::<u32>();

/// Largest file size representable by the address layout above.
pub const MAX_FILE: usize =
    (DIRECT_COUNT + ENTRIES_PER_INDIRECT + ENTRIES_PER_INDIRECT * ENTRIES_PER_INDIRECT)
        * SECTOR_SIZE;

/// Magic value stamped into every valid on-disk inode.
pub const INODE_MAGIC: u32 = 0x1020_3040;

/// Sector number on the backing device. `0` is reserved for the free-sector
/// bitmap and is therefore never a legal data or inode address; it doubles
/// as the "no address" sentinel for an unallocated slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Pod)]
#[repr(transparent)]
pub struct SectorNo(u32);

impl SectorNo {
    /// The free-sector bitmap's fixed sector.
    pub const FREE_MAP: Self = Self(0);
    /// The root directory inode's fixed sector.
    pub const ROOT_DIR: Self = Self(1);

    #[must_use]
    pub const fn new(n: u32) -> Self {
        Self(n)
    }

    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn as_index(self) -> usize {
        self.0 as usize
    }

    fn to_raw(addr: Option<Self>) -> u32 {
        match addr {
            Some(s) => {
                debug_assert_ne!(s.0, 0, "sector 0 is reserved and never a storable address");
                s.0
            }
            None => 0,
        }
    }

    fn from_raw(raw: u32) -> Option<Self> {
        if raw == 0 { None } else { Some(Self(raw)) }
    }
}

impl fmt::Display for SectorNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The type of file an inode represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeKind {
    File,
    Directory,
}

impl InodeKind {
    fn to_raw(self) -> u16 {
        match self {
            Self::File => 1,
            Self::Directory => 2,
        }
    }

    fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            1 => Some(Self::File),
            2 => Some(Self::Directory),
            _ => None,
        }
    }
}

/// The on-disk inode image, exactly [`SECTOR_SIZE`] bytes.
///
/// `addrs[0..DIRECT_COUNT]` are direct data-sector addresses,
/// `addrs[INDIRECT_SLOT]` is a single-indirect block, and
/// `addrs[DINDIRECT_SLOT]` is a doubly-indirect block.
#[derive(Pod, Clone, Copy)]
#[repr(C)]
pub struct RawInode {
    kind: u16,
    link_count: u16,
    size: u32,
    addrs: [u32; ADDR_COUNT],
    magic: u32,
}

const _: () = assert!(size_of::<RawInode>() == SECTOR_SIZE);

impl RawInode {
    /// Returns `true` if this sector does not hold a live inode.
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.kind == 0
    }

    /// Overwrites this sector with a freshly allocated inode of `kind` and
    /// `size` bytes, all addresses invalid.
    pub fn init(&mut self, kind: InodeKind, size: u32) {
        self.kind = kind.to_raw();
        self.link_count = 1;
        self.size = size;
        self.addrs = [0; ADDR_COUNT];
        self.magic = INODE_MAGIC;
    }

    /// Validates the magic number. A mismatch means the caller addressed a
    /// sector that does not hold an inode — an invariant violation, not a
    /// recoverable error.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.magic == INODE_MAGIC
    }

    #[must_use]
    pub fn kind(&self) -> InodeKind {
        debug_assert!(self.is_valid());
        InodeKind::from_raw(self.kind).expect("corrupt inode kind")
    }

    #[must_use]
    pub fn link_count(&self) -> u16 {
        self.link_count
    }

    pub fn set_link_count(&mut self, n: u16) {
        self.link_count = n;
    }

    #[must_use]
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn set_size(&mut self, size: u32) {
        self.size = size;
    }

    #[must_use]
    pub fn addr(&self, slot: usize) -> Option<SectorNo> {
        SectorNo::from_raw(self.addrs[slot])
    }

    pub fn set_addr(&mut self, slot: usize, addr: Option<SectorNo>) {
        self.addrs[slot] = SectorNo::to_raw(addr);
    }
}

/// An indirect block: [`ENTRIES_PER_INDIRECT`] sector addresses, exactly
/// one sector long.
#[derive(Pod, Clone, Copy)]
#[repr(transparent)]
pub struct IndirectBlock {
    entries: [u32; ENTRIES_PER_INDIRECT],
}

const _: () = assert!(size_of::<IndirectBlock>() == SECTOR_SIZE);

impl IndirectBlock {
    #[must_use]
    pub fn get(&self, i: usize) -> Option<SectorNo> {
        SectorNo::from_raw(self.entries[i])
    }

    pub fn set(&mut self, i: usize, addr: Option<SectorNo>) {
        self.entries[i] = SectorNo::to_raw(addr);
    }

    /// Iterates over every populated (non-invalid) entry.
    pub fn occupied(&self) -> impl Iterator<Item = SectorNo> + '_ {
        self.entries.iter().filter_map(|&raw| SectorNo::from_raw(raw))
    }
}

/// One directory entry. Directories are regular files whose data is a
/// packed sequence of these, read and written through the ordinary inode
/// byte-stream operations rather than any special directory block format.
#[derive(Pod, Clone, Copy)]
#[repr(C)]
pub struct DirEntry {
    in_use: u32,
    inode_sector: u32,
    name: [u8; NAME_MAX + 1],
    _pad: [u8; 1],
}

const _: () = assert!(size_of::<DirEntry>() % 4 == 0);

impl DirEntry {
    #[must_use]
    pub fn is_used(&self) -> bool {
        self.in_use != 0
    }

    #[must_use]
    pub fn inode_sector(&self) -> Option<SectorNo> {
        if self.is_used() { SectorNo::from_raw(self.inode_sector) } else { None }
    }

    /// Returns the entry's name, or `""` for an unused slot.
    #[must_use]
    pub fn name(&self) -> &str {
        if !self.is_used() {
            return "";
        }
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        std::str::from_utf8(&self.name[..len]).unwrap_or("")
    }

    /// Populates the slot. `name` must be at most [`NAME_MAX`] bytes;
    /// callers validate this earlier (name-too-long is a path-walk error,
    /// not a directory-entry error).
    pub fn set(&mut self, sector: SectorNo, name: &str) {
        debug_assert!(name.len() <= NAME_MAX);
        self.in_use = 1;
        self.inode_sector = sector.as_u32();
        self.name = [0; NAME_MAX + 1];
        self.name[..name.len()].copy_from_slice(name.as_bytes());
    }

    pub fn clear(&mut self) {
        *self = Self::zeroed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_file_is_at_least_8_mib() {
        assert!(MAX_FILE >= 8 * 1024 * 1024);
    }

    #[test]
    fn raw_inode_roundtrips_fields() {
        let mut ino = RawInode::zeroed();
        ino.init(InodeKind::Directory, 0);
        assert!(ino.is_valid());
        assert_eq!(ino.kind(), InodeKind::Directory);
        assert_eq!(ino.link_count(), 1);
        assert_eq!(ino.addr(0), None);
        ino.set_addr(0, Some(SectorNo::new(42)));
        assert_eq!(ino.addr(0), Some(SectorNo::new(42)));
        ino.set_size(123);
        assert_eq!(ino.size(), 123);
    }

    #[test]
    fn dir_entry_name_roundtrip() {
        let mut e = DirEntry::zeroed();
        assert!(!e.is_used());
        e.set(SectorNo::new(5), "a.txt");
        assert!(e.is_used());
        assert_eq!(e.name(), "a.txt");
        assert_eq!(e.inode_sector(), Some(SectorNo::new(5)));
        e.clear();
        assert!(!e.is_used());
        assert_eq!(e.name(), "");
    }

    #[test]
    fn name_max_boundary() {
        let ok = "a".repeat(NAME_MAX);
        let mut e = DirEntry::zeroed();
        e.set(SectorNo::new(1), &ok);
        assert_eq!(e.name(), ok);
    }
}
