//! Directories and path resolution on top of [`inode`].
//!
//! A directory is an ordinary inode whose byte stream is a packed sequence
//! of [`fs_types::DirEntry`] records — there is no separate directory block
//! format, so every directory operation here is built out of the same
//! `read_at`/`write_at` the inode layer already exposes to file data.
//!
//! `walk` and `leave` resolve a path one component at a time with a plain
//! loop rather than recursing: each step opens the current directory,
//! looks a component up, closes the directory, and moves on, so resolving
//! a ten-component path never grows the call stack and never needs a
//! scratch buffer sized to the deepest path the caller might pass.

use dataview::PodMethods as _;
use fs_types::DirEntry;
pub use fs_types::{InodeKind, SectorNo};
use inode::{Allocator, Cache, Handle, InodeError, InodeTable};
use sector_cache::SectorDevice;

const ENTRY_SIZE: usize = size_of::<DirEntry>();
const SECTOR_SIZE: usize = fs_types::SECTOR_SIZE;

fn encode_entry(sector: SectorNo, name: &str) -> [u8; ENTRY_SIZE] {
    let mut buf = [0u8; ENTRY_SIZE];
    buf.as_data_view_mut().get_mut::<DirEntry>(0).set(sector, name);
    buf
}

fn decode_entry(buf: &[u8; ENTRY_SIZE]) -> DirEntry {
    *buf.as_data_view().get(0)
}

/// Scans `dir`'s entries for `name`, returning the inode sector it names.
fn dir_lookup<Device>(
    cache: &Cache<Device>,
    free_map: &Allocator,
    dir: &Handle,
    name: &str,
) -> Result<Option<SectorNo>, InodeError<Device::Error>>
where
    Device: SectorDevice<SECTOR_SIZE>,
{
    let len = inode::length(cache, dir)? as usize;
    let mut off = 0;
    while off < len {
        let mut buf = [0u8; ENTRY_SIZE];
        inode::read_at(cache, free_map, dir, &mut buf, off)?;
        let entry = decode_entry(&buf);
        if entry.is_used() && entry.name() == name {
            return Ok(entry.inode_sector());
        }
        off += ENTRY_SIZE;
    }
    Ok(None)
}

/// Adds `(sector, name)` to `dir`, reusing the first unused slot if one
/// exists and appending otherwise. Returns `false` if the underlying write
/// came up short (only possible if the device itself is exhausted, since a
/// directory's length is not otherwise bounded).
fn dir_add<Device>(
    cache: &Cache<Device>,
    free_map: &Allocator,
    dir: &Handle,
    sector: SectorNo,
    name: &str,
) -> Result<bool, InodeError<Device::Error>>
where
    Device: SectorDevice<SECTOR_SIZE>,
{
    let len = inode::length(cache, dir)? as usize;
    let mut off = 0;
    while off < len {
        let mut buf = [0u8; ENTRY_SIZE];
        inode::read_at(cache, free_map, dir, &mut buf, off)?;
        if !decode_entry(&buf).is_used() {
            break;
        }
        off += ENTRY_SIZE;
    }
    let written = inode::write_at(cache, free_map, dir, &encode_entry(sector, name), off)?;
    Ok(written == ENTRY_SIZE)
}

/// Clears the entry named `name` in `dir`. Returns `false` if no such entry
/// existed.
fn dir_remove<Device>(
    cache: &Cache<Device>,
    free_map: &Allocator,
    dir: &Handle,
    name: &str,
) -> Result<bool, InodeError<Device::Error>>
where
    Device: SectorDevice<SECTOR_SIZE>,
{
    let len = inode::length(cache, dir)? as usize;
    let mut off = 0;
    while off < len {
        let mut buf = [0u8; ENTRY_SIZE];
        inode::read_at(cache, free_map, dir, &mut buf, off)?;
        if decode_entry(&buf).is_used() && decode_entry(&buf).name() == name {
            inode::write_at(cache, free_map, dir, &[0u8; ENTRY_SIZE], off)?;
            return Ok(true);
        }
        off += ENTRY_SIZE;
    }
    Ok(false)
}

/// `true` if `dir` holds nothing but its own `.`/`..` entries.
fn dir_is_empty<Device>(cache: &Cache<Device>, free_map: &Allocator, dir: &Handle) -> Result<bool, InodeError<Device::Error>>
where
    Device: SectorDevice<SECTOR_SIZE>,
{
    let len = inode::length(cache, dir)? as usize;
    let mut off = 0;
    while off < len {
        let mut buf = [0u8; ENTRY_SIZE];
        inode::read_at(cache, free_map, dir, &mut buf, off)?;
        let entry = decode_entry(&buf);
        if entry.is_used() && entry.name() != "." && entry.name() != ".." {
            return Ok(false);
        }
        off += ENTRY_SIZE;
    }
    Ok(true)
}

/// Splits `path` into its non-empty components, rejecting an empty path or
/// a component longer than [`fs_types::NAME_MAX`]. Consecutive and
/// trailing slashes collapse away, so `"/a//b/"` and `"/a/b"` split
/// identically.
fn split_components(path: &str) -> Option<Vec<&str>> {
    if path.is_empty() {
        return None;
    }
    let comps: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if comps.iter().any(|c| c.len() > fs_types::NAME_MAX) {
        return None;
    }
    Some(comps)
}

fn start_sector(path: &str, cwd: SectorNo) -> SectorNo {
    if path.starts_with('/') { SectorNo::ROOT_DIR } else { cwd }
}

/// Resolves `path` (absolute or relative to `cwd`) to the inode sector it
/// names. A functional failure — an unresolvable component, a non-existent
/// entry, a name that is too long — resolves to `Ok(None)`; only a device
/// I/O failure is `Err`.
pub fn walk<Device>(
    cache: &Cache<Device>,
    free_map: &Allocator,
    table: &InodeTable,
    cwd: SectorNo,
    path: &str,
) -> Result<Option<SectorNo>, InodeError<Device::Error>>
where
    Device: SectorDevice<SECTOR_SIZE>,
{
    let Some(comps) = split_components(path) else { return Ok(None) };
    let mut current = start_sector(path, cwd);
    for comp in comps {
        let dir = table.open(current);
        let is_dir = inode::kind(cache, &dir)? == InodeKind::Directory;
        let next = if is_dir { dir_lookup(cache, free_map, &dir, comp)? } else { None };
        table.close(dir, cache, free_map)?;
        match next {
            Some(sector) => current = sector,
            None => return Ok(None),
        }
    }
    Ok(Some(current))
}

/// Resolves every component of `path` except the last, returning the
/// sector of the directory that should hold it together with the final
/// component's name. Used by every operation that creates or removes a
/// directory entry rather than just reading through one.
pub fn leave<Device>(
    cache: &Cache<Device>,
    free_map: &Allocator,
    table: &InodeTable,
    cwd: SectorNo,
    path: &str,
) -> Result<Option<(SectorNo, String)>, InodeError<Device::Error>>
where
    Device: SectorDevice<SECTOR_SIZE>,
{
    let Some(comps) = split_components(path) else { return Ok(None) };
    let mut current = start_sector(path, cwd);
    let Some((last, init)) = comps.split_last() else {
        return Ok(Some((current, String::new())));
    };
    for comp in init {
        let dir = table.open(current);
        let is_dir = inode::kind(cache, &dir)? == InodeKind::Directory;
        let next = if is_dir { dir_lookup(cache, free_map, &dir, comp)? } else { None };
        table.close(dir, cache, free_map)?;
        match next {
            Some(sector) => current = sector,
            None => return Ok(None),
        }
    }
    Ok(Some((current, (*last).to_string())))
}

/// Formats the root directory on a freshly formatted device: creates its
/// inode at [`SectorNo::ROOT_DIR`] and seeds it with `.` and `..` entries
/// that both point back at itself.
pub fn format_root<Device>(cache: &Cache<Device>, free_map: &Allocator, table: &InodeTable) -> Result<(), InodeError<Device::Error>>
where
    Device: SectorDevice<SECTOR_SIZE>,
{
    inode::create(cache, SectorNo::ROOT_DIR, 0, InodeKind::Directory)?;
    let root = table.open(SectorNo::ROOT_DIR);
    dir_add(cache, free_map, &root, SectorNo::ROOT_DIR, ".")?;
    dir_add(cache, free_map, &root, SectorNo::ROOT_DIR, "..")?;
    table.close(root, cache, free_map)?;
    Ok(())
}

/// Creates a regular file at `path`. Returns `false` (rather than erroring)
/// if the parent does not exist, is not a directory, or already has an
/// entry with that name; any inode sector allocated along the way is
/// released before returning.
pub fn create<Device>(
    cache: &Cache<Device>,
    free_map: &Allocator,
    table: &InodeTable,
    cwd: SectorNo,
    path: &str,
    initial_size: u32,
) -> Result<bool, InodeError<Device::Error>>
where
    Device: SectorDevice<SECTOR_SIZE>,
{
    let Some((parent_sector, name)) = leave(cache, free_map, table, cwd, path)? else { return Ok(false) };
    if name.is_empty() {
        return Ok(false);
    }
    let parent = table.open(parent_sector);
    if inode::kind(cache, &parent)? != InodeKind::Directory {
        table.close(parent, cache, free_map)?;
        return Ok(false);
    }
    if dir_lookup(cache, free_map, &parent, &name)?.is_some() {
        table.close(parent, cache, free_map)?;
        return Ok(false);
    }

    let Ok(new_sector) = free_map.allocate(1) else {
        table.close(parent, cache, free_map)?;
        return Ok(false);
    };
    if let Err(e) = inode::create(cache, new_sector, initial_size, InodeKind::File) {
        free_map.release(new_sector, 1);
        table.close(parent, cache, free_map)?;
        return Err(e);
    }

    let added = dir_add(cache, free_map, &parent, new_sector, &name)?;
    table.close(parent, cache, free_map)?;
    if !added {
        free_map.release(new_sector, 1);
        return Ok(false);
    }
    Ok(true)
}

/// Creates a directory at `path`, adding its own `.`/`..` entries. If
/// either self-entry fails to write, the new directory is marked removed
/// (rather than left as an orphaned, entry-less inode) so the next close
/// reclaims it.
pub fn mkdir<Device>(
    cache: &Cache<Device>,
    free_map: &Allocator,
    table: &InodeTable,
    cwd: SectorNo,
    path: &str,
    initial_size: u32,
) -> Result<bool, InodeError<Device::Error>>
where
    Device: SectorDevice<SECTOR_SIZE>,
{
    let Some((parent_sector, name)) = leave(cache, free_map, table, cwd, path)? else { return Ok(false) };
    if name.is_empty() {
        return Ok(false);
    }
    let parent = table.open(parent_sector);
    if inode::kind(cache, &parent)? != InodeKind::Directory {
        table.close(parent, cache, free_map)?;
        return Ok(false);
    }
    if dir_lookup(cache, free_map, &parent, &name)?.is_some() {
        table.close(parent, cache, free_map)?;
        return Ok(false);
    }

    let Ok(new_sector) = free_map.allocate(1) else {
        table.close(parent, cache, free_map)?;
        return Ok(false);
    };
    if let Err(e) = inode::create(cache, new_sector, initial_size, InodeKind::Directory) {
        free_map.release(new_sector, 1);
        table.close(parent, cache, free_map)?;
        return Err(e);
    }

    let added = dir_add(cache, free_map, &parent, new_sector, &name)?;
    if !added {
        table.close(parent, cache, free_map)?;
        free_map.release(new_sector, 1);
        return Ok(false);
    }

    let new_dir = table.open(new_sector);
    let ok = dir_add(cache, free_map, &new_dir, new_sector, ".")? && dir_add(cache, free_map, &new_dir, parent_sector, "..")?;
    if !ok {
        inode::remove(&new_dir);
    }
    table.close(new_dir, cache, free_map)?;
    table.close(parent, cache, free_map)?;
    Ok(ok)
}

/// Removes the entry at `path`. Refuses to remove the root (which has no
/// parent to hold its entry) or a non-empty directory.
pub fn remove<Device>(
    cache: &Cache<Device>,
    free_map: &Allocator,
    table: &InodeTable,
    cwd: SectorNo,
    path: &str,
) -> Result<bool, InodeError<Device::Error>>
where
    Device: SectorDevice<SECTOR_SIZE>,
{
    let Some((parent_sector, name)) = leave(cache, free_map, table, cwd, path)? else { return Ok(false) };
    if name.is_empty() {
        return Ok(false);
    }
    let parent = table.open(parent_sector);
    let Some(target_sector) = dir_lookup(cache, free_map, &parent, &name)? else {
        table.close(parent, cache, free_map)?;
        return Ok(false);
    };

    let target = table.open(target_sector);
    if inode::kind(cache, &target)? == InodeKind::Directory && !dir_is_empty(cache, free_map, &target)? {
        table.close(target, cache, free_map)?;
        table.close(parent, cache, free_map)?;
        return Ok(false);
    }

    let removed = dir_remove(cache, free_map, &parent, &name)?;
    if removed {
        inode::remove(&target);
    }
    table.close(target, cache, free_map)?;
    table.close(parent, cache, free_map)?;
    Ok(removed)
}

/// Resolves `path` to a directory sector suitable for a process's new
/// working directory. Fails (returns `None`) if `path` does not resolve or
/// does not name a directory.
pub fn chdir<Device>(
    cache: &Cache<Device>,
    free_map: &Allocator,
    table: &InodeTable,
    cwd: SectorNo,
    path: &str,
) -> Result<Option<SectorNo>, InodeError<Device::Error>>
where
    Device: SectorDevice<SECTOR_SIZE>,
{
    let Some(target) = walk(cache, free_map, table, cwd, path)? else { return Ok(None) };
    let dir = table.open(target);
    let is_dir = inode::kind(cache, &dir)? == InodeKind::Directory;
    table.close(dir, cache, free_map)?;
    Ok(if is_dir { Some(target) } else { None })
}

/// Resolves `path` and opens a handle on whatever it names, file or
/// directory. The caller is responsible for closing the returned handle.
pub fn open<Device>(
    cache: &Cache<Device>,
    free_map: &Allocator,
    table: &InodeTable,
    cwd: SectorNo,
    path: &str,
) -> Result<Option<Handle>, InodeError<Device::Error>>
where
    Device: SectorDevice<SECTOR_SIZE>,
{
    let Some((parent_sector, name)) = leave(cache, free_map, table, cwd, path)? else { return Ok(None) };
    let target_sector = if name.is_empty() {
        Some(parent_sector)
    } else {
        let parent = table.open(parent_sector);
        let found = dir_lookup(cache, free_map, &parent, &name)?;
        table.close(parent, cache, free_map)?;
        found
    };
    Ok(target_sector.map(|sector| table.open(sector)))
}

#[cfg(test)]
mod tests {
    use std::{convert::Infallible, sync::Mutex as StdSyncMutex};

    use fs_types::SECTOR_SIZE;
    use inode::Handle;

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

    fn setup(sectors: usize) -> (Cache<MemDevice>, Allocator, InodeTable) {
        let mut cache = Cache::new(MemDevice::new(sectors));
        cache.init();
        let free_map = Allocator::format(sectors, [SectorNo::new(0), SectorNo::ROOT_DIR]);
        let table = InodeTable::init();
        format_root(&cache, &free_map, &table).unwrap();
        (cache, free_map, table)
    }

    fn close(cache: &Cache<MemDevice>, free_map: &Allocator, table: &InodeTable, h: Handle) {
        table.close(h, cache, free_map).unwrap();
    }

    #[test]
    fn root_resolves_and_has_dot_entries() {
        let (cache, free_map, table) = setup(256);
        let root = walk(&cache, &free_map, &table, SectorNo::ROOT_DIR, "/").unwrap().unwrap();
        assert_eq!(root, SectorNo::ROOT_DIR);

        let dot = walk(&cache, &free_map, &table, SectorNo::ROOT_DIR, "/.").unwrap().unwrap();
        let dotdot = walk(&cache, &free_map, &table, SectorNo::ROOT_DIR, "/..").unwrap().unwrap();
        assert_eq!(dot, SectorNo::ROOT_DIR);
        assert_eq!(dotdot, SectorNo::ROOT_DIR);
    }

    #[test]
    fn create_then_walk_finds_it() {
        let (cache, free_map, table) = setup(256);
        assert!(create(&cache, &free_map, &table, SectorNo::ROOT_DIR, "/a.txt", 0).unwrap());

        let found = walk(&cache, &free_map, &table, SectorNo::ROOT_DIR, "/a.txt").unwrap();
        assert!(found.is_some());
        assert!(!create(&cache, &free_map, &table, SectorNo::ROOT_DIR, "/a.txt", 0).unwrap());
    }

    #[test]
    fn mkdir_then_chdir_and_relative_lookup() {
        let (cache, free_map, table) = setup(256);
        assert!(mkdir(&cache, &free_map, &table, SectorNo::ROOT_DIR, "/d", 0).unwrap());

        let d = chdir(&cache, &free_map, &table, SectorNo::ROOT_DIR, "/d").unwrap().unwrap();
        assert!(create(&cache, &free_map, &table, d, "f", 0).unwrap());
        let found = walk(&cache, &free_map, &table, SectorNo::ROOT_DIR, "/d/f").unwrap();
        assert!(found.is_some());

        let up = walk(&cache, &free_map, &table, d, "..").unwrap().unwrap();
        assert_eq!(up, SectorNo::ROOT_DIR);
    }

    #[test]
    fn remove_refuses_nonempty_directory() {
        let (cache, free_map, table) = setup(256);
        assert!(mkdir(&cache, &free_map, &table, SectorNo::ROOT_DIR, "/d", 0).unwrap());
        assert!(create(&cache, &free_map, &table, SectorNo::ROOT_DIR, "/d/f", 0).unwrap());

        assert!(!remove(&cache, &free_map, &table, SectorNo::ROOT_DIR, "/d").unwrap());
        assert!(remove(&cache, &free_map, &table, SectorNo::ROOT_DIR, "/d/f").unwrap());
        assert!(remove(&cache, &free_map, &table, SectorNo::ROOT_DIR, "/d").unwrap());
    }

    #[test]
    fn create_remove_recreate_reuses_the_name() {
        let (cache, free_map, table) = setup(256);
        assert!(create(&cache, &free_map, &table, SectorNo::ROOT_DIR, "/nums.txt", 0).unwrap());
        let h = open(&cache, &free_map, &table, SectorNo::ROOT_DIR, "/nums.txt").unwrap().unwrap();
        close(&cache, &free_map, &table, h);

        assert!(remove(&cache, &free_map, &table, SectorNo::ROOT_DIR, "/nums.txt").unwrap());
        assert!(walk(&cache, &free_map, &table, SectorNo::ROOT_DIR, "/nums.txt").unwrap().is_none());
        assert!(create(&cache, &free_map, &table, SectorNo::ROOT_DIR, "/nums.txt", 0).unwrap());
    }

    #[test]
    fn name_too_long_fails_the_walk() {
        let (cache, free_map, table) = setup(256);
        let long_name = "a".repeat(fs_types::NAME_MAX + 1);
        let path = format!("/{long_name}");
        assert!(walk(&cache, &free_map, &table, SectorNo::ROOT_DIR, &path).unwrap().is_none());
        assert!(!create(&cache, &free_map, &table, SectorNo::ROOT_DIR, &path, 0).unwrap());
    }

    #[test]
    fn open_on_root_alone_returns_root_handle() {
        let (cache, free_map, table) = setup(256);
        let h = open(&cache, &free_map, &table, SectorNo::ROOT_DIR, "/").unwrap().unwrap();
        assert_eq!(inode::inumber(&h), SectorNo::ROOT_DIR);
        close(&cache, &free_map, &table, h);
    }
}
