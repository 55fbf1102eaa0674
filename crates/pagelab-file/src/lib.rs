#![deny(unsafe_code)]
//! POSIX-style cached file handles.
//!
//! A [`PagedFile`] wraps a direct-I/O backing file behind a per-handle 2Q
//! replacement cache: reads and writes of arbitrary byte ranges are broken
//! into page fetches against the engine, with dirty pages written back on
//! eviction, sync, and close. The [`handles`] module layers a process-wide
//! fd-style table of small integer ids on top for consumers that want
//! descriptor-shaped handles.

pub mod handles;
mod store;

pub use store::FilePageStore;

use pagelab_cache::{CacheMetrics, CachedPage, PageStore, TwoQCache};
use pagelab_error::{PagelabError, Result};
use pagelab_types::{PageNumber, PageSize};
use std::io::SeekFrom;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, error, warn};

/// Cache capacity used when [`CACHE_PAGES_ENV`] is absent or unusable.
pub const DEFAULT_CACHE_PAGES: usize = 256;

/// Environment variable holding the per-handle cache capacity in pages.
///
/// Read once at first use; positive values below
/// [`pagelab_cache::MAX_CAPACITY_PAGES`] are accepted.
pub const CACHE_PAGES_ENV: &str = "PAGELAB_CACHE_PAGES";

/// Per-handle cache capacity in pages, from the environment or the default.
pub fn cache_capacity_pages() -> usize {
    static CACHE_PAGES: OnceLock<usize> = OnceLock::new();
    *CACHE_PAGES.get_or_init(|| match std::env::var(CACHE_PAGES_ENV) {
        Ok(raw) => match raw.trim().parse::<usize>() {
            Ok(value) if value > 0 && value < pagelab_cache::MAX_CAPACITY_PAGES => value,
            _ => {
                warn!(
                    target: "pagelab::file",
                    event = "cache_pages_env_ignored",
                    value = %raw,
                    default = DEFAULT_CACHE_PAGES
                );
                DEFAULT_CACHE_PAGES
            }
        },
        Err(_) => DEFAULT_CACHE_PAGES,
    })
}

/// The platform page size, falling back to 4096 when it cannot be queried
/// or is outside the supported range.
#[must_use]
pub fn system_page_size() -> PageSize {
    use nix::unistd::{SysconfVar, sysconf};
    sysconf(SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .and_then(|raw| u32::try_from(raw).ok())
        .and_then(|raw| PageSize::new(raw).ok())
        .unwrap_or_default()
}

/// Options controlling how a [`PagedFile`] is opened.
///
/// Mirrors `std::fs::OpenOptions`: configure with chained setters, then call
/// [`PagedFileOptions::open`].
#[derive(Debug, Clone, Default)]
pub struct PagedFileOptions {
    read: bool,
    write: bool,
    append: bool,
    create: bool,
    cache_pages: Option<usize>,
    page_size: Option<PageSize>,
}

impl PagedFileOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&mut self, read: bool) -> &mut Self {
        self.read = read;
        self
    }

    pub fn write(&mut self, write: bool) -> &mut Self {
        self.write = write;
        self
    }

    /// Snap the position to the end of file before every write.
    pub fn append(&mut self, append: bool) -> &mut Self {
        self.append = append;
        self
    }

    pub fn create(&mut self, create: bool) -> &mut Self {
        self.create = create;
        self
    }

    /// Override the configured cache capacity for this handle.
    pub fn cache_pages(&mut self, pages: usize) -> &mut Self {
        self.cache_pages = Some(pages);
        self
    }

    /// Override the system page size for this handle.
    pub fn page_size(&mut self, page_size: PageSize) -> &mut Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn open(&self, path: impl AsRef<Path>) -> Result<PagedFile> {
        PagedFile::from_options(self, path.as_ref())
    }
}

/// A cached file handle: position, size, access mode, and a 2Q engine.
///
/// Single-threaded by design; the handle owns its cache exclusively and the
/// only blocking points are backing-file I/O and allocation.
#[derive(Debug)]
pub struct PagedFile {
    cache: TwoQCache<FilePageStore>,
    pos: u64,
    readable: bool,
    writable: bool,
    append: bool,
}

impl PagedFile {
    /// Open an existing file read-only with default options.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::options().read(true).open(path)
    }

    #[must_use]
    pub fn options() -> PagedFileOptions {
        PagedFileOptions::new()
    }

    fn from_options(opts: &PagedFileOptions, path: &Path) -> Result<Self> {
        let readable = opts.read;
        let writable = opts.write || opts.append;
        if !readable && !writable {
            return Err(PagelabError::InvalidArgument(
                "handle must be opened for read, write, or append".to_owned(),
            ));
        }

        let page_size = opts.page_size.unwrap_or_else(system_page_size);
        let capacity = opts.cache_pages.unwrap_or_else(cache_capacity_pages);
        let store = FilePageStore::open(path, writable, opts.create, page_size)?;
        let cache = TwoQCache::new(store, capacity)?;
        debug!(
            target: "pagelab::file",
            event = "handle_open",
            path = %path.display(),
            readable,
            writable,
            append = opts.append,
            capacity
        );
        Ok(Self {
            cache,
            pos: 0,
            readable,
            writable,
            append: opts.append,
        })
    }

    /// Logical file length in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.cache.store().logical_len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current position in bytes.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Whether the backing file bypasses the OS page cache.
    #[must_use]
    pub fn is_direct(&self) -> bool {
        self.cache.store().is_direct()
    }

    #[must_use]
    pub fn metrics(&self) -> CacheMetrics {
        self.cache.metrics()
    }

    /// Fetch a page and refresh its valid prefix against the logical length.
    ///
    /// A page cached before the file grew past it keeps a short valid
    /// prefix; the gap is a hole of zeros (produced by the size-extending
    /// truncate), so the prefix is stretched to the page's span of the
    /// logical file before the caller looks at it.
    fn fetch_page(&mut self, page: PageNumber) -> Result<&mut CachedPage> {
        let logical = self.cache.store().logical_len();
        let ps = self.cache.page_size();
        let span = ps
            .page_to_byte(page)
            .map_or(0, |start| logical.saturating_sub(start.0).min(ps.as_u64()) as usize);
        let entry = self.cache.fetch(page)?;
        entry.extend_valid_to(span);
        Ok(entry)
    }

    /// Read up to `buf.len()` bytes at the current position.
    ///
    /// Returns the number of bytes read; 0 means end of file. A failure
    /// after some bytes were delivered returns the partial count, and a
    /// later call surfaces the underlying error.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.readable {
            return Err(PagelabError::BadHandle);
        }

        let ps = self.cache.page_size();
        let page_bytes = ps.as_usize();
        let mut total = 0_usize;

        while total < buf.len() {
            let page = ps.byte_to_page(self.pos);
            let in_page = ps.offset_in_page(self.pos);
            let want = (buf.len() - total).min(page_bytes - in_page);

            let entry = match self.fetch_page(page) {
                Ok(entry) => entry,
                Err(err) if total > 0 => {
                    warn!(
                        target: "pagelab::file",
                        event = "read_truncated",
                        delivered = total,
                        error = %err
                    );
                    return Ok(total);
                }
                Err(err) => return Err(err),
            };

            let take = entry.read_at(in_page, &mut buf[total..total + want]);
            if take == 0 {
                break; // EOF inside this page
            }
            total += take;
            self.pos += take as u64;
            if take < want {
                break; // partial final page
            }
        }
        Ok(total)
    }

    /// Write `buf` at the current position (end of file in append mode).
    ///
    /// Growing the file updates the logical length and truncates the backing
    /// file to it immediately, so the on-disk size tracks the logical size.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.writable {
            return Err(PagelabError::BadHandle);
        }
        if self.append {
            self.pos = self.cache.store().logical_len();
        }

        let ps = self.cache.page_size();
        let page_bytes = ps.as_usize();
        let mut total = 0_usize;

        while total < buf.len() {
            let page = ps.byte_to_page(self.pos);
            let in_page = ps.offset_in_page(self.pos);
            let chunk = (buf.len() - total).min(page_bytes - in_page);

            match self.fetch_page(page) {
                Ok(entry) => entry.write_at(in_page, &buf[total..total + chunk]),
                Err(err) if total > 0 => {
                    warn!(
                        target: "pagelab::file",
                        event = "write_truncated",
                        delivered = total,
                        error = %err
                    );
                    return Ok(total);
                }
                Err(err) => return Err(err),
            }

            total += chunk;
            self.pos += chunk as u64;

            if self.pos > self.cache.store().logical_len() {
                self.cache.store().set_logical_len(self.pos);
                if let Err(err) = self.cache.store().truncate_to_logical_len() {
                    if total > 0 {
                        return Ok(total);
                    }
                    return Err(err);
                }
            }
        }
        Ok(total)
    }

    /// Reposition the handle. The new position may exceed the file length;
    /// a later write extends the file.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
            SeekFrom::End(delta) => self.cache.store().logical_len().checked_add_signed(delta),
        }
        .ok_or_else(|| {
            PagelabError::InvalidArgument("seek to a negative or overflowing position".to_owned())
        })?;
        self.pos = new_pos;
        Ok(new_pos)
    }

    /// Write back all dirty pages, sync the backing file, and truncate it to
    /// the logical length. A second sync with no intervening write is a
    /// no-op apart from the backing fsync.
    pub fn sync(&mut self) -> Result<()> {
        self.cache.flush_all()?;
        self.cache.store().sync()?;
        self.cache.store().truncate_to_logical_len()?;
        Ok(())
    }

    /// Flush, sync, and release the handle.
    ///
    /// The backing descriptor is closed when the handle drops; any error
    /// from the OS-level close itself is not observable, so the first
    /// flush or sync error is what callers see. Resources are released
    /// either way.
    pub fn close(mut self) -> Result<()> {
        self.sync()
    }
}

impl Drop for PagedFile {
    fn drop(&mut self) {
        if !self.cache.any_dirty() {
            return;
        }
        if let Err(err) = self.cache.flush_all() {
            error!(target: "pagelab::file", event = "drop_flush_failed", error = %err);
            return;
        }
        if let Err(err) = self.cache.store().sync() {
            error!(target: "pagelab::file", event = "drop_sync_failed", error = %err);
            return;
        }
        if let Err(err) = self.cache.store().truncate_to_logical_len() {
            error!(target: "pagelab::file", event = "drop_truncate_failed", error = %err);
        }
    }
}
