#![forbid(unsafe_code)]
//! 2Q page replacement engine.
//!
//! The resident set is split into a short-term admission queue (A1in) and a
//! frequency queue (Am); a non-resident ghost queue (A1out) remembers pages
//! recently evicted from A1in so a re-reference can skip admission and land
//! directly on Am. Page I/O goes through the [`PageStore`] seam in aligned,
//! full-page units, with dirty pages written back on eviction and on flush.

mod buf;
mod index;
mod list;

pub use buf::PageBuf;

use index::PageIndex;
use list::{Arena, Queue, SlotId};
use pagelab_error::{PagelabError, Result};
use pagelab_types::{PageNumber, PageSize};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, trace, warn};

/// Sanity ceiling on configured capacity, in pages.
pub const MAX_CAPACITY_PAGES: usize = 10_000_000;

/// Backing store seam: aligned, full-page reads and writes.
///
/// `read_page` returns the number of bytes actually read; 0 at or past EOF,
/// and a short count for the final partial page, both of which are normal.
/// `write_page` writes exactly one page and restores the store's logical
/// length afterwards, since a full-page write can extend the backing file
/// past it.
pub trait PageStore {
    fn page_size(&self) -> PageSize;

    /// Read up to one page at `page * P` into `buf` (`buf.len() == P`).
    fn read_page(&self, page: PageNumber, buf: &mut [u8]) -> Result<usize>;

    /// Write exactly one page at `page * P`.
    fn write_page(&self, page: PageNumber, buf: &[u8]) -> Result<()>;

    /// Flush store writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// Derived 2Q queue capacities for a configured resident-set size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TwoQParams {
    /// Resident-set capacity in pages.
    pub capacity: usize,
    /// A1in (admission queue) capacity.
    pub kin: usize,
    /// Am (frequency queue) capacity.
    pub am_cap: usize,
    /// A1out (ghost queue) capacity.
    pub kout: usize,
}

impl TwoQParams {
    pub const MIN_CAPACITY: usize = 4;

    /// Derive queue capacities from a requested resident-set size.
    ///
    /// `kin = clamp(C/4, 1, C/2)`, `am_cap = C - kin`, `kout = max(C/2, 1)`.
    #[must_use]
    pub fn for_capacity(requested: usize) -> Self {
        let capacity = requested.max(Self::MIN_CAPACITY);
        let kin = (capacity / 4).clamp(1, capacity / 2);
        let am_cap = capacity - kin;
        let kout = (capacity / 2).max(1);
        Self {
            capacity,
            kin,
            am_cap,
            kout,
        }
    }
}

/// Snapshot of engine counters and queue occupancy.
#[derive(Debug, Clone, Serialize)]
pub struct CacheMetrics {
    /// Lookups satisfied from the resident set.
    pub hits: u64,
    /// Lookups that required a store read (ghost hits included).
    pub misses: u64,
    /// Misses whose page number was found on the ghost queue.
    pub ghost_hits: u64,
    /// Resident pages displaced to make room.
    pub evictions: u64,
    /// Dirty pages written back (eviction and flush paths).
    pub flushes: u64,
    pub a1in_len: usize,
    pub am_len: usize,
    pub a1out_len: usize,
    pub dirty_pages: usize,
    pub capacity: usize,
    pub kin: usize,
    pub am_cap: usize,
    pub kout: usize,
}

impl CacheMetrics {
    /// Cache hit ratio in [0.0, 1.0]; 0.0 before any access.
    #[must_use]
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResidentQueue {
    A1in,
    Am,
}

/// A resident page: aligned data buffer, meaningful prefix length, dirty flag.
#[derive(Debug)]
pub struct CachedPage {
    page_no: PageNumber,
    data: PageBuf,
    valid_len: usize,
    dirty: bool,
    queue: ResidentQueue,
}

impl CachedPage {
    #[must_use]
    pub fn page_no(&self) -> PageNumber {
        self.page_no
    }

    /// Number of bytes from the buffer start that reflect real file
    /// contents; the suffix is zero-filled and not considered persisted.
    #[must_use]
    pub fn valid_len(&self) -> usize {
        self.valid_len
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Copy up to `out.len()` valid bytes starting at `in_page`.
    ///
    /// Returns the number of bytes copied; 0 means `in_page` is at or past
    /// the valid prefix (EOF inside this page).
    pub fn read_at(&self, in_page: usize, out: &mut [u8]) -> usize {
        if in_page >= self.valid_len {
            return 0;
        }
        let take = out.len().min(self.valid_len - in_page);
        out[..take].copy_from_slice(&self.data.as_slice()[in_page..in_page + take]);
        take
    }

    /// Extend the valid prefix to `span` without touching the buffer.
    ///
    /// Callers use this when the file's logical length has grown past a
    /// page cached before the growth: the bytes in between are a hole, and
    /// the buffer suffix is already zero, so only the prefix length moves.
    /// The page stays clean; the on-disk hole was produced by truncation.
    pub fn extend_valid_to(&mut self, span: usize) {
        debug_assert!(span <= self.data.len());
        if span > self.valid_len {
            self.valid_len = span;
        }
    }

    /// Copy `src` into the page at `in_page`, zero-filling any hole between
    /// the valid prefix and `in_page`, and mark the page dirty.
    pub fn write_at(&mut self, in_page: usize, src: &[u8]) {
        let end = in_page + src.len();
        debug_assert!(end <= self.data.len(), "write beyond page boundary");
        let slice = self.data.as_mut_slice();
        if in_page > self.valid_len {
            slice[self.valid_len..in_page].fill(0);
        }
        slice[in_page..end].copy_from_slice(src);
        self.valid_len = self.valid_len.max(end);
        self.dirty = true;
    }
}

#[derive(Debug)]
struct GhostEntry {
    page_no: PageNumber,
}

/// Per-handle 2Q replacement engine over a [`PageStore`].
#[derive(Debug)]
pub struct TwoQCache<S> {
    store: S,
    page_size: PageSize,
    params: TwoQParams,
    pages: Arena<CachedPage>,
    ghosts: Arena<GhostEntry>,
    a1in: Queue,
    am: Queue,
    a1out: Queue,
    resident: PageIndex,
    ghost_index: PageIndex,
    hits: u64,
    misses: u64,
    ghost_hits: u64,
    evictions: u64,
    flushes: u64,
}

impl<S: PageStore> TwoQCache<S> {
    /// Build an engine with the given resident capacity in pages.
    ///
    /// Capacities below [`TwoQParams::MIN_CAPACITY`] are raised to it; the
    /// index tables are sized once here and never rehash.
    pub fn new(store: S, capacity_pages: usize) -> Result<Self> {
        if capacity_pages >= MAX_CAPACITY_PAGES {
            return Err(PagelabError::InvalidArgument(format!(
                "cache capacity {capacity_pages} exceeds {MAX_CAPACITY_PAGES} pages"
            )));
        }
        let params = TwoQParams::for_capacity(capacity_pages);
        let page_size = store.page_size();

        let cache = Self {
            store,
            page_size,
            params,
            pages: Arena::with_capacity(params.capacity)?,
            // The ghost queue transiently holds kout + 1 entries between a
            // push and the trim that follows it.
            ghosts: Arena::with_capacity(params.kout + 1)?,
            a1in: Queue::new(),
            am: Queue::new(),
            a1out: Queue::new(),
            resident: PageIndex::with_population(params.capacity)?,
            ghost_index: PageIndex::with_population(params.kout)?,
            hits: 0,
            misses: 0,
            ghost_hits: 0,
            evictions: 0,
            flushes: 0,
        };
        debug!(
            target: "pagelab::cache",
            event = "cache_init",
            capacity = params.capacity,
            kin = params.kin,
            am_cap = params.am_cap,
            kout = params.kout,
            page_size = page_size.get()
        );
        Ok(cache)
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    #[must_use]
    pub fn page_size(&self) -> PageSize {
        self.page_size
    }

    #[must_use]
    pub fn params(&self) -> TwoQParams {
        self.params
    }

    #[must_use]
    pub fn is_resident(&self, page: PageNumber) -> bool {
        self.resident.get(page).is_some()
    }

    #[must_use]
    pub fn is_ghost(&self, page: PageNumber) -> bool {
        self.ghost_index.get(page).is_some()
    }

    /// Fetch a page, loading and caching it if necessary.
    ///
    /// Resident A1in hits promote to Am; ghost hits reload directly onto Am;
    /// cold misses are admitted through A1in. Any eviction forced by the
    /// fetch writes back the victim first, and a failed write-back restores
    /// the victim and surfaces the error.
    pub fn fetch(&mut self, page: PageNumber) -> Result<&mut CachedPage> {
        if let Some(slot) = self.resident.get(page) {
            self.hits += 1;
            match self.pages.get(slot).queue {
                ResidentQueue::A1in => {
                    // A1in is admission; a second touch is evidence of
                    // frequency, so promote rather than refresh in place.
                    self.a1in.remove(&mut self.pages, slot);
                    if let Err(err) = self.ensure_space_for_am() {
                        self.a1in.push_front(&mut self.pages, slot);
                        return Err(err);
                    }
                    self.pages.get_mut(slot).queue = ResidentQueue::Am;
                    self.am.push_front(&mut self.pages, slot);
                    trace!(
                        target: "pagelab::cache",
                        event = "queue_transition",
                        page = page.0,
                        from_queue = "a1in",
                        to_queue = "am"
                    );
                }
                ResidentQueue::Am => {
                    self.am.remove(&mut self.pages, slot);
                    self.am.push_front(&mut self.pages, slot);
                }
            }
            self.debug_check();
            return Ok(self.pages.get_mut(slot));
        }

        self.misses += 1;

        if let Some(ghost_slot) = self.ghost_index.remove(page) {
            // Ghost hit: this page already failed admission once and is
            // being re-referenced, so it skips A1in entirely.
            self.ghost_hits += 1;
            self.a1out.remove(&mut self.ghosts, ghost_slot);
            let _ = self.ghosts.remove(ghost_slot);

            self.ensure_space_for_am()?;
            let mut entry = self.load_page(page)?;
            entry.queue = ResidentQueue::Am;
            let slot = self.pages.insert(entry);
            self.am.push_front(&mut self.pages, slot);
            self.resident.insert(page, slot);
            trace!(
                target: "pagelab::cache",
                event = "queue_transition",
                page = page.0,
                from_queue = "a1out",
                to_queue = "am"
            );
            self.debug_check();
            return Ok(self.pages.get_mut(slot));
        }

        self.ensure_space_for_a1in()?;
        let entry = self.load_page(page)?;
        let slot = self.pages.insert(entry);
        self.a1in.push_front(&mut self.pages, slot);
        self.resident.insert(page, slot);
        trace!(
            target: "pagelab::cache",
            event = "queue_transition",
            page = page.0,
            from_queue = "none",
            to_queue = "a1in"
        );
        self.debug_check();
        Ok(self.pages.get_mut(slot))
    }

    /// Write back every dirty resident page, A1in first then Am.
    pub fn flush_all(&mut self) -> Result<()> {
        let mut slots = self.a1in.ids(&self.pages);
        slots.extend(self.am.ids(&self.pages));
        for slot in slots {
            self.flush_slot(slot)?;
        }
        self.debug_check();
        Ok(())
    }

    #[must_use]
    pub fn any_dirty(&self) -> bool {
        self.pages.iter().any(|(_, entry)| entry.dirty)
    }

    #[must_use]
    pub fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            hits: self.hits,
            misses: self.misses,
            ghost_hits: self.ghost_hits,
            evictions: self.evictions,
            flushes: self.flushes,
            a1in_len: self.a1in.len(),
            am_len: self.am.len(),
            a1out_len: self.a1out.len(),
            dirty_pages: self.pages.iter().filter(|(_, entry)| entry.dirty).count(),
            capacity: self.params.capacity,
            kin: self.params.kin,
            am_cap: self.params.am_cap,
            kout: self.params.kout,
        }
    }

    /// Assert every structural invariant of the engine.
    ///
    /// Queue occupancy against capacities, index/queue key agreement,
    /// resident/ghost disjointness, and the zero-filled suffix of every
    /// resident buffer.
    pub fn check_invariants(&self) {
        let p = self.params;
        assert!(self.a1in.len() <= p.kin, "a1in over kin");
        assert!(self.am.len() <= p.am_cap, "am over am_cap");
        assert!(
            self.a1in.len() + self.am.len() <= p.capacity,
            "resident set over capacity"
        );
        assert!(self.a1out.len() <= p.kout, "a1out over kout");

        assert_eq!(self.pages.len(), self.a1in.len() + self.am.len());
        assert_eq!(self.resident.len(), self.pages.len());
        assert_eq!(self.ghosts.len(), self.a1out.len());
        assert_eq!(self.ghost_index.len(), self.a1out.len());

        for (expected_queue, queue, arena_queue) in [
            (ResidentQueue::A1in, &self.a1in, "a1in"),
            (ResidentQueue::Am, &self.am, "am"),
        ] {
            for slot in queue.ids(&self.pages) {
                let entry = self.pages.get(slot);
                assert_eq!(entry.queue, expected_queue, "queue tag mismatch on {arena_queue}");
                assert_eq!(self.resident.get(entry.page_no), Some(slot));
                assert!(self.ghost_index.get(entry.page_no).is_none());
                assert!(entry.valid_len <= self.page_size.as_usize());
                assert!(
                    entry.data.as_slice()[entry.valid_len..].iter().all(|&b| b == 0),
                    "nonzero bytes past valid_len of page {}",
                    entry.page_no.0
                );
            }
        }

        for slot in self.a1out.ids(&self.ghosts) {
            let ghost = self.ghosts.get(slot);
            assert_eq!(self.ghost_index.get(ghost.page_no), Some(slot));
            assert!(self.resident.get(ghost.page_no).is_none());
        }
    }

    fn debug_check(&self) {
        #[cfg(debug_assertions)]
        self.check_invariants();
    }

    fn load_page(&mut self, page: PageNumber) -> Result<CachedPage> {
        let mut data = PageBuf::zeroed(self.page_size)?;
        let n = self.store.read_page(page, data.as_mut_slice())?;
        debug_assert!(n <= data.len());
        data.as_mut_slice()[n..].fill(0);
        Ok(CachedPage {
            page_no: page,
            data,
            valid_len: n,
            dirty: false,
            queue: ResidentQueue::A1in,
        })
    }

    fn flush_slot(&mut self, slot: SlotId) -> Result<()> {
        let entry = self.pages.get_mut(slot);
        if !entry.dirty {
            return Ok(());
        }
        self.store.write_page(entry.page_no, entry.data.as_slice())?;
        entry.dirty = false;
        self.flushes += 1;
        Ok(())
    }

    /// Evict the A1in tail: write back if dirty, then remember the page
    /// number on the ghost queue. On write-back failure the victim goes
    /// back to the A1in head and the error surfaces to the caller.
    fn evict_from_a1in(&mut self) -> Result<()> {
        let Some(slot) = self.a1in.pop_back(&mut self.pages) else {
            return Ok(());
        };
        let page_no = self.pages.get(slot).page_no;
        self.resident.remove(page_no);

        if let Err(err) = self.flush_slot(slot) {
            self.a1in.push_front(&mut self.pages, slot);
            self.resident.insert(page_no, slot);
            warn!(
                target: "pagelab::cache",
                event = "evict_flush_failed",
                queue = "a1in",
                page = page_no.0,
                error = %err
            );
            return Err(err);
        }

        let _ = self.pages.remove(slot);
        self.record_ghost(page_no);
        self.evictions += 1;
        trace!(
            target: "pagelab::cache",
            event = "evict",
            queue = "a1in",
            page = page_no.0
        );
        Ok(())
    }

    /// Evict the Am tail. Am victims are not remembered as ghosts: the
    /// ghost queue only tracks admissions that never reached Am.
    fn evict_from_am(&mut self) -> Result<()> {
        let Some(slot) = self.am.pop_back(&mut self.pages) else {
            return Ok(());
        };
        let page_no = self.pages.get(slot).page_no;
        self.resident.remove(page_no);

        if let Err(err) = self.flush_slot(slot) {
            self.am.push_front(&mut self.pages, slot);
            self.resident.insert(page_no, slot);
            warn!(
                target: "pagelab::cache",
                event = "evict_flush_failed",
                queue = "am",
                page = page_no.0,
                error = %err
            );
            return Err(err);
        }

        let _ = self.pages.remove(slot);
        self.evictions += 1;
        trace!(
            target: "pagelab::cache",
            event = "evict",
            queue = "am",
            page = page_no.0
        );
        Ok(())
    }

    fn record_ghost(&mut self, page_no: PageNumber) {
        debug_assert!(self.ghost_index.get(page_no).is_none());
        let slot = self.ghosts.insert(GhostEntry { page_no });
        self.a1out.push_front(&mut self.ghosts, slot);
        self.ghost_index.insert(page_no, slot);

        while self.a1out.len() > self.params.kout {
            let Some(old) = self.a1out.pop_back(&mut self.ghosts) else {
                break;
            };
            let old_no = self.ghosts.remove(old).page_no;
            self.ghost_index.remove(old_no);
        }
    }

    fn ensure_space_for_a1in(&mut self) -> Result<()> {
        if self.a1in.len() >= self.params.kin {
            return self.evict_from_a1in();
        }
        while self.a1in.len() + self.am.len() >= self.params.capacity {
            if self.am.is_empty() {
                self.evict_from_a1in()?;
            } else {
                self.evict_from_am()?;
            }
        }
        Ok(())
    }

    fn ensure_space_for_am(&mut self) -> Result<()> {
        while self.am.len() >= self.params.am_cap {
            self.evict_from_am()?;
        }
        while self.a1in.len() + self.am.len() >= self.params.capacity {
            if self.a1in.is_empty() {
                self.evict_from_am()?;
            } else {
                self.evict_from_a1in()?;
            }
        }
        Ok(())
    }
}

// ── In-memory store (tests and benchmarks) ─────────────────────────────────

/// In-memory [`PageStore`] backed by a byte vector.
///
/// Eliminates disk latency so engine behavior can be observed in isolation.
/// Writes can be made to fail on demand to exercise the eviction error path.
#[derive(Debug)]
pub struct MemPageStore {
    page_size: PageSize,
    bytes: Mutex<Vec<u8>>,
    reads: AtomicU64,
    writes: AtomicU64,
    syncs: AtomicU64,
    fail_writes: AtomicBool,
}

impl MemPageStore {
    #[must_use]
    pub fn new(page_size: PageSize, len_bytes: usize) -> Self {
        Self {
            page_size,
            bytes: Mutex::new(vec![0_u8; len_bytes]),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            syncs: AtomicU64::new(0),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Fill every page with its page number truncated to a byte, for tests
    /// that want distinguishable page contents.
    #[must_use]
    pub fn with_page_pattern(page_size: PageSize, pages: u64) -> Self {
        let ps = page_size.as_usize();
        let mut bytes = vec![0_u8; ps * usize::try_from(pages).expect("page count fits usize")];
        for page in 0..pages {
            let start = usize::try_from(page).expect("page fits usize") * ps;
            bytes[start..start + ps].fill(page as u8);
        }
        Self {
            page_size,
            bytes: Mutex::new(bytes),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            syncs: AtomicU64::new(0),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    #[must_use]
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn sync_count(&self) -> u64 {
        self.syncs.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn page_bytes(&self, page: PageNumber) -> Vec<u8> {
        let ps = self.page_size.as_usize();
        let start = usize::try_from(page.0).expect("page fits usize") * ps;
        let bytes = self.bytes.lock();
        bytes[start..start + ps].to_vec()
    }
}

impl PageStore for MemPageStore {
    fn page_size(&self) -> PageSize {
        self.page_size
    }

    fn read_page(&self, page: PageNumber, buf: &mut [u8]) -> Result<usize> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let ps = self.page_size.as_usize();
        debug_assert_eq!(buf.len(), ps);
        let start = usize::try_from(page.0)
            .ok()
            .and_then(|p| p.checked_mul(ps))
            .ok_or_else(|| {
                PagelabError::InvalidArgument(format!("page offset overflows: page {}", page.0))
            })?;
        let bytes = self.bytes.lock();
        if start >= bytes.len() {
            return Ok(0);
        }
        let take = ps.min(bytes.len() - start);
        buf[..take].copy_from_slice(&bytes[start..start + take]);
        Ok(take)
    }

    fn write_page(&self, page: PageNumber, buf: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PagelabError::Io(std::io::Error::other(
                "injected write failure",
            )));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        let ps = self.page_size.as_usize();
        debug_assert_eq!(buf.len(), ps);
        let start = usize::try_from(page.0)
            .ok()
            .and_then(|p| p.checked_mul(ps))
            .ok_or_else(|| {
                PagelabError::InvalidArgument(format!("page offset overflows: page {}", page.0))
            })?;
        let mut bytes = self.bytes.lock();
        if bytes.len() < start + ps {
            bytes.resize(start + ps, 0);
        }
        bytes[start..start + ps].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
