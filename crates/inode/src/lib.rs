//! Byte-addressable files on top of [`sector_cache`], with lazy (sparse)
//! allocation and a registry of ref-counted in-memory inodes shared across
//! openers of the same on-disk sector.
//!
//! The registry owns the in-memory inodes outright (a `Vec<Arc<InMemoryInode>>`
//! behind one table mutex); a [`Handle`] is just another owner of that
//! `Arc`, so there is no cycle between the table and the inodes it hands
//! out — closing the last handle removes the registry's own reference and,
//! if the file was `remove`d, walks its address array to release every
//! sector it owns.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use fs_types::{DINDIRECT_SLOT, DIRECT_COUNT, ENTRIES_PER_INDIRECT, INDIRECT_SLOT, MAX_FILE, SECTOR_SIZE};
pub use fs_types::{InodeKind, RawInode, SectorNo};
use sector_cache::SectorDevice;

/// This crate commits to [`mutex_api::StdMutex`] throughout rather than
/// staying generic over the lock: unlike the bare-metal kernel the cache
/// and allocator crates were lifted from, `ov6fs` only ever runs hosted, so
/// there is no second lock implementation to stay generic over.
pub type Cache<Device> =
    sector_cache::SectorCache<Device, mutex_api::StdMutex<sector_cache::Pool>, mutex_api::StdMutex<[u8; SECTOR_SIZE]>, SECTOR_SIZE>;
pub type Allocator = free_map::FreeMap<mutex_api::StdMutex<free_map::Bitmap>>;

#[derive(Debug, thiserror::Error)]
pub enum InodeError<E> {
    #[error("sector device I/O failed")]
    Device(#[from] sector_cache::CacheError<E>),
    #[error("free-sector allocator is out of space")]
    OutOfSpace,
}

impl<E> From<free_map::AllocError> for InodeError<E> {
    fn from(_: free_map::AllocError) -> Self {
        Self::OutOfSpace
    }
}

struct InodeState {
    open_count: u32,
    removed: bool,
    deny_write_count: u32,
}

/// One entry in the open-inode registry. Does not cache the on-disk inode
/// image; every operation re-reads it through the sector cache, which is
/// the single source of truth for its current contents.
pub struct InMemoryInode {
    sector: SectorNo,
    state: StdMutex<InodeState>,
}

/// A shared reference to an open inode. Cloning it is the same operation as
/// [`InodeTable::reopen`] performed by hand; most callers should go through
/// `reopen` so the table's bookkeeping and the handle's ref-count agree.
pub type Handle = Arc<InMemoryInode>;

fn lock<T>(m: &StdMutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read_inode<Device>(cache: &Cache<Device>, sector: SectorNo) -> Result<RawInode, InodeError<Device::Error>>
where
    Device: SectorDevice<SECTOR_SIZE>,
{
    let guard = cache.read(sector.as_index())?;
    let raw: RawInode = guard.view();
    assert!(raw.is_valid(), "corrupt inode magic at sector {sector}");
    Ok(raw)
}

/// Writes a fresh on-disk inode image into `sector`, which the caller has
/// already reserved through the free-sector allocator.
pub fn create<Device>(
    cache: &Cache<Device>,
    sector: SectorNo,
    size: u32,
    kind: InodeKind,
) -> Result<(), InodeError<Device::Error>>
where
    Device: SectorDevice<SECTOR_SIZE>,
{
    let guard = cache.alloc(sector.as_index())?;
    guard.with_view_mut::<RawInode, _>(|ino| ino.init(kind, size));
    Ok(())
}

/// The open-inode registry: one entry per on-disk sector currently open
/// anywhere, each ref-counted across repeated opens of the same sector.
pub struct InodeTable {
    entries: StdMutex<Vec<Handle>>,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::init()
    }
}

impl InodeTable {
    #[must_use]
    pub fn init() -> Self {
        Self { entries: StdMutex::new(Vec::new()) }
    }

    /// Returns the shared in-memory inode for `sector`, creating it if this
    /// is the first opener. The table mutex is held for the whole lookup so
    /// two concurrent opens of the same sector are guaranteed to observe
    /// (and bump) the same entry rather than racing to create two.
    pub fn open(&self, sector: SectorNo) -> Handle {
        let mut entries = lock(&self.entries);
        if let Some(existing) = entries.iter().find(|h| h.sector == sector) {
            lock(&existing.state).open_count += 1;
            return Arc::clone(existing);
        }
        let handle: Handle = Arc::new(InMemoryInode {
            sector,
            state: StdMutex::new(InodeState { open_count: 1, removed: false, deny_write_count: 0 }),
        });
        entries.push(Arc::clone(&handle));
        handle
    }

    #[must_use]
    pub fn reopen(&self, handle: &Handle) -> Handle {
        lock(&handle.state).open_count += 1;
        Arc::clone(handle)
    }

    /// Closes `handle`. If it was the last open reference, removes the
    /// entry from the registry; if the inode had also been [`remove`]d,
    /// releases every sector it owns. Returns `true` if this call deleted
    /// the file.
    ///
    /// The table mutex is acquired first and the inode's own mutex nested
    /// inside it for the terminal decrement — the one place in this crate
    /// where that ordering is reversed from every other operation, which
    /// take the per-inode mutex alone.
    pub fn close<Device>(
        &self,
        handle: Handle,
        cache: &Cache<Device>,
        free_map: &Allocator,
    ) -> Result<bool, InodeError<Device::Error>>
    where
        Device: SectorDevice<SECTOR_SIZE>,
    {
        let mut entries = lock(&self.entries);
        let (last, removed) = {
            let mut state = lock(&handle.state);
            state.open_count -= 1;
            (state.open_count == 0, state.removed)
        };
        if last {
            entries.retain(|h| h.sector != handle.sector);
        }
        drop(entries);

        if last && removed {
            deallocate(cache, free_map, handle.sector)?;
            return Ok(true);
        }
        Ok(false)
    }
}

#[must_use]
pub fn inumber(handle: &Handle) -> SectorNo {
    handle.sector
}

pub fn kind<Device>(cache: &Cache<Device>, handle: &Handle) -> Result<InodeKind, InodeError<Device::Error>>
where
    Device: SectorDevice<SECTOR_SIZE>,
{
    let _state = lock(&handle.state);
    Ok(read_inode(cache, handle.sector)?.kind())
}

pub fn length<Device>(cache: &Cache<Device>, handle: &Handle) -> Result<u32, InodeError<Device::Error>>
where
    Device: SectorDevice<SECTOR_SIZE>,
{
    let _state = lock(&handle.state);
    Ok(read_inode(cache, handle.sector)?.size())
}

/// Marks the inode for deletion; sectors are actually released by
/// [`InodeTable::close`] once every handle has gone away.
pub fn remove(handle: &Handle) {
    lock(&handle.state).removed = true;
}

pub fn deny_write(handle: &Handle) {
    lock(&handle.state).deny_write_count += 1;
}

/// # Panics
///
/// Panics if called without a matching prior [`deny_write`].
pub fn allow_write(handle: &Handle) {
    let mut state = lock(&handle.state);
    assert!(state.deny_write_count > 0, "allow_write: no matching deny_write on this handle");
    state.deny_write_count -= 1;
}

/// Looks up (and, for a write, lazily allocates) the data sector slot or
/// indirect block that `offset` falls into. Returns the resolved sector and
/// whether it was just allocated (meaning its contents are whatever the
/// free-sector allocator last held, not necessarily zero, and must be
/// zeroed before use).
fn inode_slot<Device>(
    cache: &Cache<Device>,
    free_map: &Allocator,
    ino_sector: SectorNo,
    slot: usize,
    for_write: bool,
) -> Result<Option<(SectorNo, bool)>, InodeError<Device::Error>>
where
    Device: SectorDevice<SECTOR_SIZE>,
{
    let guard = if for_write { cache.write(ino_sector.as_index())? } else { cache.read(ino_sector.as_index())? };
    if let Some(existing) = guard.view::<RawInode>().addr(slot) {
        return Ok(Some((existing, false)));
    }
    if !for_write {
        return Ok(None);
    }
    let fresh = free_map.allocate(1)?;
    guard.with_view_mut::<RawInode, _>(|ino| ino.set_addr(slot, Some(fresh)));
    Ok(Some((fresh, true)))
}

fn indirect_slot<Device>(
    cache: &Cache<Device>,
    free_map: &Allocator,
    block_sector: SectorNo,
    slot: usize,
    for_write: bool,
) -> Result<Option<(SectorNo, bool)>, InodeError<Device::Error>>
where
    Device: SectorDevice<SECTOR_SIZE>,
{
    let guard = if for_write { cache.write(block_sector.as_index())? } else { cache.read(block_sector.as_index())? };
    if let Some(existing) = guard.view::<fs_types::IndirectBlock>().get(slot) {
        return Ok(Some((existing, false)));
    }
    if !for_write {
        return Ok(None);
    }
    let fresh = free_map.allocate(1)?;
    guard.with_view_mut::<fs_types::IndirectBlock, _>(|block| block.set(slot, Some(fresh)));
    Ok(Some((fresh, true)))
}

/// Zeroes a sector that was just allocated as an indirect or
/// doubly-indirect block, so its entries read back as "no address" rather
/// than whatever the allocator's last tenant left behind.
fn zero_fresh_block<Device>(cache: &Cache<Device>, sector: SectorNo) -> Result<(), InodeError<Device::Error>>
where
    Device: SectorDevice<SECTOR_SIZE>,
{
    drop(cache.alloc(sector.as_index())?);
    Ok(())
}

/// Translates a byte offset into the data sector that holds it, per the
/// direct / single-indirect / doubly-indirect layout in [`fs_types`].
/// Returns `None` past [`MAX_FILE`] or, on a read, past an unallocated
/// region (the caller treats that as a span of zeros). On a write, any
/// address slot traversed along the way is allocated as needed; the
/// returned `bool` says whether the final data sector is itself fresh.
fn data_sector<Device>(
    cache: &Cache<Device>,
    free_map: &Allocator,
    ino_sector: SectorNo,
    offset: usize,
    for_write: bool,
) -> Result<Option<(SectorNo, bool)>, InodeError<Device::Error>>
where
    Device: SectorDevice<SECTOR_SIZE>,
{
    if offset >= MAX_FILE {
        return Ok(None);
    }
    let mut index = offset / SECTOR_SIZE;

    if index < DIRECT_COUNT {
        return inode_slot(cache, free_map, ino_sector, index, for_write);
    }
    index -= DIRECT_COUNT;

    if index < ENTRIES_PER_INDIRECT {
        let Some((block, fresh)) = inode_slot(cache, free_map, ino_sector, INDIRECT_SLOT, for_write)? else {
            return Ok(None);
        };
        if fresh {
            zero_fresh_block(cache, block)?;
        }
        return indirect_slot(cache, free_map, block, index, for_write);
    }
    index -= ENTRIES_PER_INDIRECT;
    let outer = index / ENTRIES_PER_INDIRECT;
    let inner = index % ENTRIES_PER_INDIRECT;

    let Some((dindirect, fresh)) = inode_slot(cache, free_map, ino_sector, DINDIRECT_SLOT, for_write)? else {
        return Ok(None);
    };
    if fresh {
        zero_fresh_block(cache, dindirect)?;
    }
    let Some((indirect, fresh)) = indirect_slot(cache, free_map, dindirect, outer, for_write)? else {
        return Ok(None);
    };
    if fresh {
        zero_fresh_block(cache, indirect)?;
    }
    indirect_slot(cache, free_map, indirect, inner, for_write)
}

/// Copies up to `dst.len()` bytes starting at `offset` into `dst`, clamped
/// to the file's current length, and returns the number of bytes actually
/// transferred. Any span that falls inside an unallocated (sparse) region
/// reads back as zero.
pub fn read_at<Device>(
    cache: &Cache<Device>,
    free_map: &Allocator,
    handle: &Handle,
    dst: &mut [u8],
    offset: usize,
) -> Result<usize, InodeError<Device::Error>>
where
    Device: SectorDevice<SECTOR_SIZE>,
{
    let _state = lock(&handle.state);
    let length = read_inode(cache, handle.sector)?.size() as usize;

    let mut done = 0;
    let mut off = offset;
    while done < dst.len() && off < length {
        let in_sector = off % SECTOR_SIZE;
        let step = (SECTOR_SIZE - in_sector).min(dst.len() - done).min(length - off);

        match data_sector(cache, free_map, handle.sector, off, false)? {
            Some((sector, _)) => {
                let guard = cache.read(sector.as_index())?;
                let bytes = guard.bytes();
                dst[done..done + step].copy_from_slice(&bytes[in_sector..in_sector + step]);
            }
            None => dst[done..done + step].fill(0),
        }

        done += step;
        off += step;
    }
    Ok(done)
}

/// Writes `src` starting at `offset`, lazily allocating any sector the
/// write touches and growing the file's recorded length if the write
/// extends past it. Returns `0` without writing anything if the handle is
/// currently write-denied.
pub fn write_at<Device>(
    cache: &Cache<Device>,
    free_map: &Allocator,
    handle: &Handle,
    src: &[u8],
    offset: usize,
) -> Result<usize, InodeError<Device::Error>>
where
    Device: SectorDevice<SECTOR_SIZE>,
{
    let state = lock(&handle.state);
    if state.deny_write_count > 0 {
        return Ok(0);
    }
    drop(state);

    let mut done = 0;
    let mut off = offset;
    while done < src.len() {
        let Some((sector, fresh)) = data_sector(cache, free_map, handle.sector, off, true)? else {
            break;
        };
        let guard = if fresh { cache.alloc(sector.as_index())? } else { cache.write(sector.as_index())? };

        let in_sector = off % SECTOR_SIZE;
        let step = (SECTOR_SIZE - in_sector).min(src.len() - done);
        let mut bytes = guard.bytes();
        bytes[in_sector..in_sector + step].copy_from_slice(&src[done..done + step]);
        guard.write_bytes(&bytes);

        done += step;
        off += step;
    }

    if done > 0 {
        let new_len = off as u32;
        let guard = cache.read(handle.sector.as_index())?;
        let grew = guard.view::<RawInode>().size() < new_len;
        if grew {
            guard.with_view_mut::<RawInode, _>(|ino| ino.set_size(new_len));
        }
    }
    Ok(done)
}

/// Releases every sector a removed inode owns: its direct data sectors,
/// its single- and doubly-indirect blocks and their referents, and finally
/// the inode sector itself.
fn deallocate<Device>(
    cache: &Cache<Device>,
    free_map: &Allocator,
    sector: SectorNo,
) -> Result<(), InodeError<Device::Error>>
where
    Device: SectorDevice<SECTOR_SIZE>,
{
    let raw = read_inode(cache, sector)?;

    for slot in 0..DIRECT_COUNT {
        if let Some(data) = raw.addr(slot) {
            free_map.release(data, 1);
        }
    }
    if let Some(indirect) = raw.addr(INDIRECT_SLOT) {
        release_indirect_children(cache, free_map, indirect)?;
        free_map.release(indirect, 1);
    }
    if let Some(dindirect) = raw.addr(DINDIRECT_SLOT) {
        let guard = cache.read(dindirect.as_index())?;
        let block: fs_types::IndirectBlock = guard.view();
        drop(guard);
        for indirect in block.occupied() {
            release_indirect_children(cache, free_map, indirect)?;
            free_map.release(indirect, 1);
        }
        free_map.release(dindirect, 1);
    }
    free_map.release(sector, 1);
    Ok(())
}

fn release_indirect_children<Device>(
    cache: &Cache<Device>,
    free_map: &Allocator,
    block_sector: SectorNo,
) -> Result<(), InodeError<Device::Error>>
where
    Device: SectorDevice<SECTOR_SIZE>,
{
    let guard = cache.read(block_sector.as_index())?;
    let block: fs_types::IndirectBlock = guard.view();
    drop(guard);
    for data in block.occupied() {
        free_map.release(data, 1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{convert::Infallible, sync::Mutex as StdSyncMutex};

    use fs_types::SECTOR_SIZE;

    use super::*;

    struct MemDevice {
        sectors: StdSyncMutex<Vec<[u8; SECTOR_SIZE]>>,
    }

    impl MemDevice {
        fn new(count: usize) -> Self {
            Self { sectors: StdSyncMutex::new(vec![[0; SECTOR_SIZE]; count]) }
        }
    }

    impl SectorDevice<SECTOR_SIZE> for MemDevice {
        type Error = Infallible;

        fn read_sector(&self, sector: usize, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), Infallible> {
            *buf = self.sectors.lock().unwrap()[sector];
            Ok(())
        }

        fn write_sector(&self, sector: usize, buf: &[u8; SECTOR_SIZE]) -> Result<(), Infallible> {
            self.sectors.lock().unwrap()[sector] = *buf;
            Ok(())
        }
    }

    fn setup(sectors: usize) -> (Cache<MemDevice>, Allocator) {
        let mut cache = Cache::new(MemDevice::new(sectors));
        cache.init();
        let free_map = Allocator::format(sectors, [SectorNo::new(0), SectorNo::new(1)]);
        (cache, free_map)
    }

    #[test]
    fn create_then_read_back_an_empty_file() {
        let (cache, free_map) = setup(256);
        let sector = free_map.allocate(1).unwrap();
        create(&cache, sector, 0, InodeKind::File).unwrap();

        let table = InodeTable::init();
        let handle = table.open(sector);
        assert_eq!(length(&cache, &handle).unwrap(), 0);
        let mut buf = [0xffu8; 8];
        assert_eq!(read_at(&cache, &free_map, &handle, &mut buf, 0).unwrap(), 0);
    }

    #[test]
    fn write_then_read_within_direct_range() {
        let (cache, free_map) = setup(256);
        let sector = free_map.allocate(1).unwrap();
        create(&cache, sector, 0, InodeKind::File).unwrap();
        let table = InodeTable::init();
        let handle = table.open(sector);

        let written = write_at(&cache, &free_map, &handle, b"hello, ov6fs", 10).unwrap();
        assert_eq!(written, 12);
        assert_eq!(length(&cache, &handle).unwrap(), 22);

        let mut buf = [0u8; 12];
        read_at(&cache, &free_map, &handle, &mut buf, 10).unwrap();
        assert_eq!(&buf, b"hello, ov6fs");

        let mut prefix = [0xAAu8; 10];
        read_at(&cache, &free_map, &handle, &mut prefix, 0).unwrap();
        assert_eq!(prefix, [0; 10]);
    }

    #[test]
    fn sparse_write_past_indirect_boundary() {
        let (cache, free_map) = setup(1024);
        let sector = free_map.allocate(1).unwrap();
        create(&cache, sector, 0, InodeKind::File).unwrap();
        let table = InodeTable::init();
        let handle = table.open(sector);

        let offset = (DIRECT_COUNT + 5) * SECTOR_SIZE;
        write_at(&cache, &free_map, &handle, b"indirect", offset).unwrap();

        let mut buf = [0u8; 8];
        read_at(&cache, &free_map, &handle, &mut buf, offset).unwrap();
        assert_eq!(&buf, b"indirect");

        let mut gap = [0xAAu8; 8];
        read_at(&cache, &free_map, &handle, &mut gap, offset - 16).unwrap();
        assert_eq!(gap, [0; 8]);
    }

    #[test]
    fn deferred_delete_on_last_close() {
        let (cache, free_map) = setup(256);
        let sector = free_map.allocate(1).unwrap();
        create(&cache, sector, 0, InodeKind::File).unwrap();
        let table = InodeTable::init();

        let h1 = table.open(sector);
        let h2 = table.reopen(&h1);
        remove(&h1);

        write_at(&cache, &free_map, &h2, b"still alive", 0).unwrap();
        assert!(!table.close(h1, &cache, &free_map).unwrap());

        let mut buf = [0u8; 11];
        read_at(&cache, &free_map, &h2, &mut buf, 0).unwrap();
        assert_eq!(&buf, b"still alive");

        assert!(table.close(h2, &cache, &free_map).unwrap());
        assert_eq!(free_map.allocate(1).unwrap(), sector);
    }

    #[test]
    fn deny_write_blocks_write_at() {
        let (cache, free_map) = setup(256);
        let sector = free_map.allocate(1).unwrap();
        create(&cache, sector, 0, InodeKind::File).unwrap();
        let table = InodeTable::init();
        let handle = table.open(sector);

        deny_write(&handle);
        assert_eq!(write_at(&cache, &free_map, &handle, b"nope", 0).unwrap(), 0);
        allow_write(&handle);
        assert_eq!(write_at(&cache, &free_map, &handle, b"ok", 0).unwrap(), 2);
    }

    #[test]
    fn open_is_shared_across_callers() {
        let (_, free_map) = setup(256);
        let table = InodeTable::init();
        let sector = free_map.allocate(1).unwrap();
        let h1 = table.open(sector);
        let h2 = table.open(sector);
        assert!(Arc::ptr_eq(&h1, &h2));
    }
}
