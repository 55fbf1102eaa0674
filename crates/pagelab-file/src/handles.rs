//! Process-wide fd-style handle table.
//!
//! A fixed table maps small integer ids to open [`PagedFile`]s for consumers
//! that want descriptor-shaped handles. Ids start at 3 so they cannot be
//! confused with the standard streams. Slots are checked out for the
//! duration of each operation, so the table lock is never held across
//! backing-file I/O; callers own handles exclusively per the concurrency
//! model, and a handle observed mid-operation reports as bad.

use crate::{PagedFile, PagedFileOptions};
use pagelab_cache::CacheMetrics;
use pagelab_error::{PagelabError, Result};
use parking_lot::Mutex;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::OnceLock;

/// Fixed size of the process-wide handle table.
pub const MAX_HANDLES: usize = 1024;

/// Ids below this are reserved for the standard streams.
const RESERVED_HANDLES: usize = 3;

/// Opaque id of an open file in the process-wide table, always >= 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(usize);

impl Handle {
    #[must_use]
    pub fn id(self) -> usize {
        self.0
    }
}

#[derive(Debug)]
enum HandleSlot {
    Free,
    /// Reserved by an open in progress or checked out by an operation.
    Busy,
    Open(Box<PagedFile>),
}

#[derive(Debug)]
struct HandleTable {
    slots: Vec<HandleSlot>,
}

impl HandleTable {
    fn with_capacity(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || HandleSlot::Free);
        Self { slots }
    }

    /// Claim the first free slot at or above the reserved range.
    fn reserve(&mut self) -> Result<Handle> {
        for id in RESERVED_HANDLES..self.slots.len() {
            if matches!(self.slots[id], HandleSlot::Free) {
                self.slots[id] = HandleSlot::Busy;
                return Ok(Handle(id));
            }
        }
        Err(PagelabError::TooManyOpenFiles)
    }

    fn take(&mut self, handle: Handle) -> Result<Box<PagedFile>> {
        let slot = self
            .slots
            .get_mut(handle.0)
            .ok_or(PagelabError::BadHandle)?;
        match std::mem::replace(slot, HandleSlot::Busy) {
            HandleSlot::Open(file) => Ok(file),
            other => {
                *slot = other;
                Err(PagelabError::BadHandle)
            }
        }
    }

    fn put_back(&mut self, handle: Handle, file: Box<PagedFile>) {
        self.slots[handle.0] = HandleSlot::Open(file);
    }

    fn release(&mut self, handle: Handle) {
        self.slots[handle.0] = HandleSlot::Free;
    }
}

fn table() -> &'static Mutex<HandleTable> {
    static TABLE: OnceLock<Mutex<HandleTable>> = OnceLock::new();
    TABLE.get_or_init(|| Mutex::new(HandleTable::with_capacity(MAX_HANDLES)))
}

fn with_file<T>(handle: Handle, op: impl FnOnce(&mut PagedFile) -> Result<T>) -> Result<T> {
    let mut file = table().lock().take(handle)?;
    let result = op(&mut file);
    table().lock().put_back(handle, file);
    result
}

/// Open a file and register it in the handle table.
pub fn open(path: impl AsRef<Path>, options: &PagedFileOptions) -> Result<Handle> {
    let handle = table().lock().reserve()?;
    match options.open(path) {
        Ok(file) => {
            table().lock().put_back(handle, Box::new(file));
            Ok(handle)
        }
        Err(err) => {
            table().lock().release(handle);
            Err(err)
        }
    }
}

/// Flush and close a handle, releasing its slot even when the flush fails.
pub fn close(handle: Handle) -> Result<()> {
    let file = table().lock().take(handle)?;
    let result = file.close();
    table().lock().release(handle);
    result
}

pub fn read(handle: Handle, buf: &mut [u8]) -> Result<usize> {
    with_file(handle, |file| file.read(buf))
}

pub fn write(handle: Handle, buf: &[u8]) -> Result<usize> {
    with_file(handle, |file| file.write(buf))
}

pub fn seek(handle: Handle, pos: SeekFrom) -> Result<u64> {
    with_file(handle, |file| file.seek(pos))
}

pub fn fsync(handle: Handle) -> Result<()> {
    with_file(handle, PagedFile::sync)
}

/// Cache metrics snapshot for an open handle.
pub fn metrics(handle: Handle) -> Result<CacheMetrics> {
    with_file(handle, |file| Ok(file.metrics()))
}

/// Whether the handle's backing file bypasses the OS page cache.
pub fn is_direct(handle: Handle) -> Result<bool> {
    with_file(handle, |file| Ok(file.is_direct()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_file() -> Box<PagedFile> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slot.bin");
        std::fs::write(&path, b"x").unwrap();
        Box::new(PagedFile::open(&path).unwrap())
    }

    #[test]
    fn reserve_starts_above_standard_streams() {
        let mut table = HandleTable::with_capacity(8);
        let handle = table.reserve().unwrap();
        assert_eq!(handle.id(), 3);
    }

    #[test]
    fn reserve_exhausts_with_too_many_open_files() {
        let mut table = HandleTable::with_capacity(5);
        assert_eq!(table.reserve().unwrap().id(), 3);
        assert_eq!(table.reserve().unwrap().id(), 4);
        assert!(matches!(
            table.reserve().unwrap_err(),
            PagelabError::TooManyOpenFiles
        ));
    }

    #[test]
    fn released_slots_are_reused() {
        let mut table = HandleTable::with_capacity(8);
        let first = table.reserve().unwrap();
        let _second = table.reserve().unwrap();
        table.release(first);
        let third = table.reserve().unwrap();
        assert_eq!(third, first);
    }

    #[test]
    fn take_of_free_or_busy_slot_is_bad_handle() {
        let mut table = HandleTable::with_capacity(8);
        assert!(matches!(
            table.take(Handle(3)).unwrap_err(),
            PagelabError::BadHandle
        ));

        let handle = table.reserve().unwrap(); // slot is Busy, not Open
        assert!(matches!(
            table.take(handle).unwrap_err(),
            PagelabError::BadHandle
        ));

        table.put_back(handle, dummy_file());
        assert!(table.take(handle).is_ok());
        // Now checked out: a second take must fail.
        assert!(matches!(
            table.take(handle).unwrap_err(),
            PagelabError::BadHandle
        ));
    }

    #[test]
    fn take_out_of_range_is_bad_handle() {
        let mut table = HandleTable::with_capacity(4);
        assert!(matches!(
            table.take(Handle(99)).unwrap_err(),
            PagelabError::BadHandle
        ));
    }
}
