//! Direct-I/O backing store.
//!
//! The backing file is opened with `O_DIRECT` when the filesystem supports
//! it, so cache misses are real device reads. When `O_DIRECT` is refused
//! with `EINVAL` the store falls back to buffered I/O and issues a
//! `POSIX_FADV_DONTNEED` advisory after every transfer to approximate the
//! intent. macOS has no `O_DIRECT`; there the store sets `F_NOCACHE` on
//! the descriptor instead. On platforms with neither facility the OS page
//! cache inflates measured hit rates; that is a measurement artifact, not
//! a correctness problem.

use pagelab_cache::PageStore;
use pagelab_error::{PagelabError, Result};
use pagelab_types::{PageNumber, PageSize};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::FileExt;
use std::path::Path;
use tracing::debug;

/// File-backed [`PageStore`] with page-aligned full-page I/O.
///
/// Tracks the logical file length separately from the on-disk length:
/// full-page writes can run past a mid-page logical end, so every page
/// write is followed by a truncate back to the logical length.
#[derive(Debug)]
pub struct FilePageStore {
    file: File,
    page_size: PageSize,
    direct: bool,
    logical_len: Mutex<u64>,
}

impl FilePageStore {
    /// Open a backing file, preferring `O_DIRECT` and falling back to
    /// buffered I/O with cache-drop advisories when the filesystem refuses
    /// it.
    pub fn open(path: &Path, writable: bool, create: bool, page_size: PageSize) -> Result<Self> {
        let mut base = OpenOptions::new();
        // The store always opens readable: partial-page writes need the
        // surrounding page contents even on write-only handles.
        base.read(true).write(writable).create(create && writable);

        let (file, direct) = open_direct_with_fallback(&base, path)?;
        let len = file.metadata()?.len();
        debug!(
            target: "pagelab::file",
            event = "store_open",
            path = %path.display(),
            direct,
            len,
            page_size = page_size.get()
        );
        Ok(Self {
            file,
            page_size,
            direct,
            logical_len: Mutex::new(len),
        })
    }

    /// Whether the backing file bypasses the OS page cache.
    #[must_use]
    pub fn is_direct(&self) -> bool {
        self.direct
    }

    /// Logical file length in bytes (the length callers observe).
    #[must_use]
    pub fn logical_len(&self) -> u64 {
        *self.logical_len.lock()
    }

    pub(crate) fn set_logical_len(&self, len: u64) {
        *self.logical_len.lock() = len;
    }

    pub(crate) fn truncate_to_logical_len(&self) -> Result<()> {
        self.file.set_len(self.logical_len())?;
        Ok(())
    }

    fn page_offset(&self, page: PageNumber) -> Result<u64> {
        self.page_size
            .page_to_byte(page)
            .map(|offset| offset.0)
            .ok_or_else(|| {
                PagelabError::InvalidArgument(format!("page {} offset overflows u64", page.0))
            })
    }

    #[cfg(target_os = "linux")]
    fn drop_os_cache(&self, offset: u64, len: usize) {
        use nix::fcntl::{PosixFadviseAdvice, posix_fadvise};
        use std::os::unix::io::AsRawFd;
        let (Ok(offset), Ok(len)) = (i64::try_from(offset), i64::try_from(len)) else {
            return;
        };
        // Advisory only; failures are ignored.
        let _ = posix_fadvise(
            self.file.as_raw_fd(),
            offset,
            len,
            PosixFadviseAdvice::POSIX_FADV_DONTNEED,
        );
    }

    #[cfg(not(target_os = "linux"))]
    fn drop_os_cache(&self, _offset: u64, _len: usize) {}
}

#[cfg(target_os = "linux")]
fn open_direct_with_fallback(base: &OpenOptions, path: &Path) -> Result<(File, bool)> {
    use std::os::unix::fs::OpenOptionsExt;

    let mut direct = base.clone();
    direct.custom_flags(libc::O_DIRECT);
    match direct.open(path) {
        Ok(file) => Ok((file, true)),
        Err(err) if err.raw_os_error() == Some(libc::EINVAL) => {
            debug!(
                target: "pagelab::file",
                event = "direct_io_unavailable",
                path = %path.display(),
                "falling back to buffered I/O with cache-drop advisories"
            );
            Ok((base.open(path)?, false))
        }
        Err(err) => Err(err.into()),
    }
}

/// macOS analog of `O_DIRECT`: `F_NOCACHE` turns off kernel data caching
/// for the descriptor and, unlike `O_DIRECT`, needs no buffer alignment.
#[cfg(target_os = "macos")]
fn open_direct_with_fallback(base: &OpenOptions, path: &Path) -> Result<(File, bool)> {
    let file = base.open(path)?;
    let direct = set_nocache(&file);
    if !direct {
        debug!(
            target: "pagelab::file",
            event = "direct_io_unavailable",
            path = %path.display(),
            "F_NOCACHE refused; hit rates include OS-cache effects"
        );
    }
    Ok((file, direct))
}

#[cfg(target_os = "macos")]
#[allow(unsafe_code)]
fn set_nocache(file: &File) -> bool {
    use std::os::unix::io::AsRawFd;
    // fcntl(F_NOCACHE) has no safe wrapper; the fd stays owned by `file`.
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_NOCACHE, 1) };
    rc != -1
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn open_direct_with_fallback(base: &OpenOptions, path: &Path) -> Result<(File, bool)> {
    Ok((base.open(path)?, false))
}

impl PageStore for FilePageStore {
    fn page_size(&self) -> PageSize {
        self.page_size
    }

    fn read_page(&self, page: PageNumber, buf: &mut [u8]) -> Result<usize> {
        debug_assert_eq!(buf.len(), self.page_size.as_usize());
        let offset = self.page_offset(page)?;

        let mut filled = 0_usize;
        while filled < buf.len() {
            match self.file.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }

        if !self.direct {
            self.drop_os_cache(offset, buf.len());
        }
        Ok(filled)
    }

    fn write_page(&self, page: PageNumber, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.page_size.as_usize());
        let offset = self.page_offset(page)?;

        self.file.write_all_at(buf, offset)?;
        if !self.direct {
            self.drop_os_cache(offset, buf.len());
        }
        // The full-page write may have run past the logical end.
        self.truncate_to_logical_len()?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}
