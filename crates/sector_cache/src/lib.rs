//! Fixed-size pinned cache of 512-byte sectors.
//!
//! The cache holds exactly [`BIO_CACHE`] lines, each backed by its own
//! [`Mutex`] so that reading or writing one pinned line never contends with
//! another. A second, pool-wide mutex protects only the bookkeeping (which
//! sector a line holds, its pin count, dirty bit and access timestamp) —
//! finding or evicting a line is always a short, metadata-only critical
//! section. Eviction is not an MRU list: lines are a flat array and the
//! victim is chosen by a scan (prefer an empty line, else the unpinned
//! line with the smallest timestamp).
//!
//! A pin is not re-entrant bookkeeping hidden behind `Arc`: it is an
//! explicit `u32` on the line, incremented by [`SectorCache::read`],
//! [`SectorCache::alloc`], [`SectorCache::pin`] and
//! [`SectorCache::pin_by_pointer`], and decremented by dropping a
//! [`SectorGuard`], [`SectorCache::unpin`] or [`SectorCache::unpin_by_pointer`].
//! [`SectorCache::free_line`] is the one operation that expects the pin
//! count to fall to exactly zero as a result of releasing the caller's own
//! pin; if another pin is still outstanding that is a bug in the caller, not
//! a recoverable condition, and it panics.

use dataview::{Pod, PodMethods as _};
use mutex_api::Mutex;

/// Number of cache lines held by the cache, independent of how large the
/// backing device is.
pub const BIO_CACHE: usize = 48;

/// A block device addressed by flat sector number.
pub trait SectorDevice<const SECTOR_SIZE: usize> {
    type Error;

    fn read_sector(&self, sector: usize, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), Self::Error>;
    fn write_sector(&self, sector: usize, buf: &[u8; SECTOR_SIZE]) -> Result<(), Self::Error>;
}

/// Errors surfaced by cache operations that touch the device. Asking to pin
/// a sector it doesn't hold, or freeing a line someone else still has
/// pinned, is an invariant violation and panics instead. Pool exhaustion
/// (every line pinned) is fatal for [`SectorCache::read`] and
/// [`SectorCache::write`] — the caller cannot make progress and must not
/// silently drop data, so those panic too — but [`SectorCache::alloc`] is
/// the one entry point obligated to hand the failure back so a caller
/// allocating a fresh sector can roll back whatever it already committed.
#[derive(Debug, thiserror::Error)]
pub enum CacheError<E> {
    #[error("sector device I/O failed")]
    Device(#[source] E),
    #[error("sector cache exhausted: every line is pinned")]
    Exhausted,
}

struct LineMeta {
    sector: Option<usize>,
    pin_count: u32,
    dirty: bool,
    timestamp: u64,
}

impl LineMeta {
    const fn empty() -> Self {
        Self { sector: None, pin_count: 0, dirty: false, timestamp: 0 }
    }
}

/// Pool-wide bookkeeping: one [`LineMeta`] per cache line, plus a logical
/// clock used to stamp each access so the least-recently-used unpinned line
/// can be found without a linked list.
pub struct Pool {
    lines: Vec<LineMeta>,
    clock: u64,
}

impl Pool {
    const fn empty() -> Self {
        Self { lines: Vec::new(), clock: 0 }
    }

    fn tick(&mut self) -> u64 {
        let t = self.clock;
        self.clock += 1;
        t
    }

    fn find(&self, sector: usize) -> Option<usize> {
        self.lines.iter().position(|l| l.sector == Some(sector))
    }

    /// An empty line if one exists, else the unpinned line least recently
    /// touched. `None` if every line is pinned — the caller decides whether
    /// that is fatal.
    fn select_victim(&self) -> Option<usize> {
        if let Some(i) = self.lines.iter().position(|l| l.sector.is_none()) {
            return Some(i);
        }
        self.lines.iter().enumerate().filter(|(_, l)| l.pin_count == 0).min_by_key(|(_, l)| l.timestamp).map(|(i, _)| i)
    }
}

/// An opaque handle to a line a caller has already pinned, letting a later
/// `pin_by_pointer`/`unpin_by_pointer` skip the sector lookup that `pin`
/// and `unpin` need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorRef(usize);

/// The cache itself: a device, the line bookkeeping, and one payload buffer
/// per line.
pub struct SectorCache<Device, PoolMutex, BufMutex, const SECTOR_SIZE: usize>
where
    PoolMutex: Mutex<Data = Pool>,
    BufMutex: Mutex<Data = [u8; SECTOR_SIZE]>,
{
    device: Device,
    pool: PoolMutex,
    bufs: Vec<BufMutex>,
}

impl<Device, PoolMutex, BufMutex, const SECTOR_SIZE: usize>
    SectorCache<Device, PoolMutex, BufMutex, SECTOR_SIZE>
where
    PoolMutex: Mutex<Data = Pool>,
    BufMutex: Mutex<Data = [u8; SECTOR_SIZE]>,
{
    pub fn new(device: Device) -> Self {
        Self { device, pool: PoolMutex::new(Pool::empty()), bufs: Vec::new() }
    }

    /// Allocates the [`BIO_CACHE`] lines and their buffers.
    ///
    /// # Panics
    ///
    /// Panics if called more than once on the same cache.
    pub fn init(&mut self) {
        let mut pool = self.pool.lock();
        assert!(pool.lines.is_empty(), "sector cache already initialized");
        pool.lines = (0..BIO_CACHE).map(|_| LineMeta::empty()).collect();
        drop(pool);
        self.bufs = (0..BIO_CACHE).map(|_| BufMutex::new([0; SECTOR_SIZE])).collect();
    }

    /// Finds or evicts a line for `sector`. Returns the line index and
    /// whether its buffer still needs to be populated (from the device for
    /// a plain read, or left to the caller to zero for a fresh allocation).
    fn acquire(&self, sector: usize, fresh: bool) -> Result<(usize, bool), CacheError<Device::Error>>
    where
        Device: SectorDevice<SECTOR_SIZE>,
    {
        let mut pool = self.pool.lock();
        if let Some(i) = pool.find(sector) {
            pool.lines[i].pin_count += 1;
            let t = pool.tick();
            pool.lines[i].timestamp = t;
            return Ok((i, false));
        }

        let victim = pool.select_victim().ok_or(CacheError::Exhausted)?;
        let evicted = pool.lines[victim].sector;
        let was_dirty = pool.lines[victim].dirty;
        pool.lines[victim].sector = Some(sector);
        pool.lines[victim].pin_count = 1;
        pool.lines[victim].dirty = fresh;
        let t = pool.tick();
        pool.lines[victim].timestamp = t;
        drop(pool);

        if let (Some(old_sector), true) = (evicted, was_dirty) {
            let buf = self.bufs[victim].lock();
            self.device.write_sector(old_sector, &buf).map_err(CacheError::Device)?;
        }

        Ok((victim, !fresh))
    }

    /// Reads `sector`, pinning the line that holds it.
    ///
    /// # Panics
    ///
    /// Panics if every line is pinned: the caller cannot make progress
    /// without this sector and must not silently drop data, so this is
    /// fatal rather than a propagable error (unlike [`Self::alloc`]).
    pub fn read(
        &self,
        sector: usize,
    ) -> Result<SectorGuard<'_, Device, PoolMutex, BufMutex, SECTOR_SIZE>, CacheError<Device::Error>>
    where
        Device: SectorDevice<SECTOR_SIZE>,
    {
        let (line, needs_read) = match self.acquire(sector, false) {
            Err(CacheError::Exhausted) => panic!("sector cache exhausted: every line is pinned"),
            other => other?,
        };
        if needs_read {
            let mut buf = self.bufs[line].lock();
            self.device.read_sector(sector, &mut buf).map_err(CacheError::Device)?;
        }
        Ok(SectorGuard { cache: self, line, sector })
    }

    /// Brings `sector` into the cache like [`Self::read`], but marks the
    /// line dirty immediately rather than leaving dirty to be set lazily by
    /// a later [`SectorGuard::write_bytes`] or [`SectorGuard::with_view_mut`]
    /// call, for a caller that already knows it is about to mutate the
    /// sector.
    ///
    /// # Panics
    ///
    /// Panics if every line is pinned, for the same reason [`Self::read`]
    /// does.
    pub fn write(
        &self,
        sector: usize,
    ) -> Result<SectorGuard<'_, Device, PoolMutex, BufMutex, SECTOR_SIZE>, CacheError<Device::Error>>
    where
        Device: SectorDevice<SECTOR_SIZE>,
    {
        let (line, needs_read) = match self.acquire(sector, false) {
            Err(CacheError::Exhausted) => panic!("sector cache exhausted: every line is pinned"),
            other => other?,
        };
        if needs_read {
            let mut buf = self.bufs[line].lock();
            self.device.read_sector(sector, &mut buf).map_err(CacheError::Device)?;
        }
        self.pool.lock().lines[line].dirty = true;
        Ok(SectorGuard { cache: self, line, sector })
    }

    /// Allocates the line for `sector` without reading it from the device,
    /// for a sector the caller knows is about to be overwritten in full
    /// (e.g. a freshly allocated inode or data sector). The buffer starts
    /// zeroed and the line starts dirty.
    ///
    /// Unlike [`Self::read`] and [`Self::write`], a pool exhausted of
    /// unpinned lines is not fatal here: this is the one entry point a
    /// caller reaches while it may still be able to roll back a partial
    /// allocation (release a free-map sector, drop an indirect block), so
    /// exhaustion comes back as `Err(CacheError::Exhausted)` instead of a
    /// panic.
    pub fn alloc(
        &self,
        sector: usize,
    ) -> Result<SectorGuard<'_, Device, PoolMutex, BufMutex, SECTOR_SIZE>, CacheError<Device::Error>>
    where
        Device: SectorDevice<SECTOR_SIZE>,
    {
        // `acquire` only marks the line dirty when it had to evict a victim
        // for `sector`; a sector already resident (e.g. reallocated after a
        // prior release without having been evicted since) is otherwise
        // left with whatever dirty bit it last had, which would let a
        // zeroed-but-clean line get silently dropped by eviction while the
        // device still holds its previous tenant's bytes.
        let (line, _) = self.acquire(sector, true)?;
        self.bufs[line].lock().fill(0);
        self.pool.lock().lines[line].dirty = true;
        Ok(SectorGuard { cache: self, line, sector })
    }

    /// Pins an already-cached sector without going through [`read`](Self::read).
    ///
    /// # Panics
    ///
    /// Panics if `sector` is not currently cached.
    pub fn pin(&self, sector: usize) {
        let mut pool = self.pool.lock();
        let i = pool.find(sector).expect("pin: sector is not cached");
        pool.lines[i].pin_count += 1;
    }

    /// # Panics
    ///
    /// Panics if `sector` is not cached, or is not currently pinned.
    pub fn unpin(&self, sector: usize) {
        let mut pool = self.pool.lock();
        let i = pool.find(sector).expect("unpin: sector is not cached");
        assert!(pool.lines[i].pin_count > 0, "unpin: sector {sector} is not pinned");
        pool.lines[i].pin_count -= 1;
    }

    /// Pins the line identified by a [`SectorRef`] obtained earlier from a
    /// [`SectorGuard`], skipping the sector lookup `pin` needs.
    pub fn pin_by_pointer(&self, line: SectorRef) {
        self.pool.lock().lines[line.0].pin_count += 1;
    }

    /// # Panics
    ///
    /// Panics if the line is not currently pinned.
    pub fn unpin_by_pointer(&self, line: SectorRef) {
        let mut pool = self.pool.lock();
        assert!(pool.lines[line.0].pin_count > 0, "unpin_by_pointer: line is not pinned");
        pool.lines[line.0].pin_count -= 1;
    }

    /// Releases a guard's line back to the empty pool instead of merely
    /// unpinning it, for a sector whose underlying disk space the caller is
    /// also about to free.
    ///
    /// # Panics
    ///
    /// Panics if a pin other than the guard's own is still outstanding on
    /// the line.
    pub fn free_line(guard: SectorGuard<'_, Device, PoolMutex, BufMutex, SECTOR_SIZE>) {
        let mut pool = guard.cache.pool.lock();
        let pin = pool.lines[guard.line].pin_count;
        assert!(pin == 1, "free_line: line has {pin} pins outstanding, expected 1");
        pool.lines[guard.line].pin_count = 0;
        pool.lines[guard.line].sector = None;
        pool.lines[guard.line].dirty = false;
        drop(pool);
        std::mem::forget(guard);
    }

    /// Writes every dirty line back to the device. If `free_map_sector` is
    /// given and dirty, it is written before any other line.
    pub fn flush(&self, free_map_sector: Option<usize>) -> Result<(), CacheError<Device::Error>>
    where
        Device: SectorDevice<SECTOR_SIZE>,
    {
        let mut dirty: Vec<(usize, usize)> = {
            let pool = self.pool.lock();
            pool.lines
                .iter()
                .enumerate()
                .filter(|(_, l)| l.dirty)
                .filter_map(|(i, l)| l.sector.map(|s| (i, s)))
                .collect()
        };
        dirty.sort_by_key(|&(_, sector)| u8::from(Some(sector) != free_map_sector));

        for (line, sector) in dirty {
            let buf = self.bufs[line].lock();
            self.device.write_sector(sector, &buf).map_err(CacheError::Device)?;
            drop(buf);
            let mut pool = self.pool.lock();
            if pool.lines[line].sector == Some(sector) {
                pool.lines[line].dirty = false;
            }
        }
        Ok(())
    }
}

/// A pinned reference to one cached sector. Dropping it unpins the line;
/// call [`SectorCache::free_line`] instead to release the line entirely.
pub struct SectorGuard<'a, Device, PoolMutex, BufMutex, const SECTOR_SIZE: usize>
where
    PoolMutex: Mutex<Data = Pool>,
    BufMutex: Mutex<Data = [u8; SECTOR_SIZE]>,
{
    cache: &'a SectorCache<Device, PoolMutex, BufMutex, SECTOR_SIZE>,
    line: usize,
    sector: usize,
}

impl<Device, PoolMutex, BufMutex, const SECTOR_SIZE: usize>
    SectorGuard<'_, Device, PoolMutex, BufMutex, SECTOR_SIZE>
where
    PoolMutex: Mutex<Data = Pool>,
    BufMutex: Mutex<Data = [u8; SECTOR_SIZE]>,
{
    #[must_use]
    pub fn sector(&self) -> usize {
        self.sector
    }

    #[must_use]
    pub fn sector_ref(&self) -> SectorRef {
        SectorRef(self.line)
    }

    #[must_use]
    pub fn bytes(&self) -> [u8; SECTOR_SIZE] {
        *self.cache.bufs[self.line].lock()
    }

    pub fn write_bytes(&self, data: &[u8; SECTOR_SIZE]) {
        *self.cache.bufs[self.line].lock() = *data;
        self.cache.pool.lock().lines[self.line].dirty = true;
    }

    /// Copies out a [`Pod`] view of the sector's bytes.
    #[must_use]
    pub fn view<T: Pod + Copy>(&self) -> T {
        *self.cache.bufs[self.line].lock().as_data_view().get(0)
    }

    /// Runs `f` against a mutable [`Pod`] view of the sector, marking the
    /// line dirty afterward.
    pub fn with_view_mut<T: Pod, R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut buf = self.cache.bufs[self.line].lock();
        let result = f(buf.as_data_view_mut().get_mut(0));
        drop(buf);
        self.cache.pool.lock().lines[self.line].dirty = true;
        result
    }
}

impl<Device, PoolMutex, BufMutex, const SECTOR_SIZE: usize> Drop
    for SectorGuard<'_, Device, PoolMutex, BufMutex, SECTOR_SIZE>
where
    PoolMutex: Mutex<Data = Pool>,
    BufMutex: Mutex<Data = [u8; SECTOR_SIZE]>,
{
    fn drop(&mut self) {
        let mut pool = self.cache.pool.lock();
        let pin = &mut pool.lines[self.line].pin_count;
        debug_assert!(*pin > 0, "sector guard dropped with no pin on its line");
        *pin = pin.saturating_sub(1);
    }
}
