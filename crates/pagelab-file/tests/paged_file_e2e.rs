#![forbid(unsafe_code)]
//! End-to-end scenarios for cached file handles on real backing files.

use pagelab_error::PagelabError;
use pagelab_file::{PagedFile, PagedFileOptions};
use pagelab_types::PageSize;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const PS: u64 = 4096;

fn page_size() -> PageSize {
    PageSize::new(4096).unwrap()
}

fn scratch(name: &str) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(name);
    (dir, path)
}

fn open_rw(path: &Path, cache_pages: usize) -> PagedFile {
    PagedFile::options()
        .read(true)
        .write(true)
        .create(true)
        .cache_pages(cache_pages)
        .page_size(page_size())
        .open(path)
        .unwrap()
}

#[test]
fn cold_read_miss_then_promote_on_second_read() {
    let (_dir, path) = scratch("cold_then_hit.bin");
    std::fs::write(&path, vec![0xAB_u8; 10 * PS as usize]).unwrap();

    let mut file = open_rw(&path, 8);
    let mut buf = vec![0_u8; PS as usize];

    assert_eq!(file.read(&mut buf).unwrap(), PS as usize);
    assert!(buf.iter().all(|&b| b == 0xAB));
    let m = file.metrics();
    assert_eq!((m.a1in_len, m.am_len), (1, 0));

    // Re-read the same page: the A1in hit promotes it to Am.
    file.seek(SeekFrom::Start(0)).unwrap();
    assert_eq!(file.read(&mut buf).unwrap(), PS as usize);
    assert!(buf.iter().all(|&b| b == 0xAB));
    let m = file.metrics();
    assert_eq!((m.a1in_len, m.am_len), (0, 1));
}

#[test]
fn write_back_and_truncate_keep_exact_size() {
    let (_dir, path) = scratch("writeback.bin");
    let payload: Vec<u8> = (0_u8..100).collect();

    let mut file = open_rw(&path, 8);
    assert_eq!(file.write(&payload).unwrap(), 100);
    assert_eq!(file.position(), 100);
    assert_eq!(file.len(), 100);
    // The post-write truncate keeps the on-disk size at the logical size.
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 100);

    let mut buf = vec![0_u8; 100];
    file.seek(SeekFrom::Start(0)).unwrap();
    assert_eq!(file.read(&mut buf).unwrap(), 100);
    assert_eq!(buf, payload);

    file.close().unwrap();
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 100);

    let mut reopened = open_rw(&path, 8);
    let mut buf = vec![0_u8; 100];
    assert_eq!(reopened.read(&mut buf).unwrap(), 100);
    assert_eq!(buf, payload);
    assert_eq!(reopened.len(), 100);
}

#[test]
fn write_past_eof_zero_fills_the_hole() {
    let (_dir, path) = scratch("sparse.bin");
    let payload = [0x5A_u8; 10];

    let mut file = open_rw(&path, 8);
    file.seek(SeekFrom::Start(4090)).unwrap();
    assert_eq!(file.write(&payload).unwrap(), 10);
    assert_eq!(file.position(), 4100);
    assert_eq!(file.len(), 4100);
    file.close().unwrap();

    let mut reopened = open_rw(&path, 8);
    let mut buf = vec![0xFF_u8; 4100];
    assert_eq!(reopened.read(&mut buf).unwrap(), 4100);
    assert!(buf[..4090].iter().all(|&b| b == 0));
    assert_eq!(&buf[4090..], &payload);
}

#[test]
fn append_mode_ignores_seek_position() {
    let (_dir, path) = scratch("append.bin");
    std::fs::write(&path, vec![0x11_u8; 64]).unwrap();

    let mut file = PagedFile::options()
        .read(true)
        .append(true)
        .cache_pages(8)
        .page_size(page_size())
        .open(&path)
        .unwrap();

    file.seek(SeekFrom::Start(0)).unwrap();
    assert_eq!(file.write(b"tail!").unwrap(), 5);
    assert_eq!(file.position(), 64 + 5);
    assert_eq!(file.len(), 69);

    let mut buf = vec![0_u8; 5];
    file.seek(SeekFrom::Start(64)).unwrap();
    assert_eq!(file.read(&mut buf).unwrap(), 5);
    assert_eq!(&buf, b"tail!");
}

#[test]
fn seek_to_end_reads_zero_bytes() {
    let (_dir, path) = scratch("eof.bin");
    std::fs::write(&path, vec![1_u8; 1000]).unwrap();

    let mut file = open_rw(&path, 8);
    assert_eq!(file.seek(SeekFrom::End(0)).unwrap(), 1000);
    let mut buf = [0_u8; 32];
    assert_eq!(file.read(&mut buf).unwrap(), 0);
}

#[test]
fn read_straddling_eof_returns_partial_count() {
    let (_dir, path) = scratch("partial.bin");
    std::fs::write(&path, vec![7_u8; 100]).unwrap();

    let mut file = open_rw(&path, 8);
    let mut buf = [0_u8; 256];
    assert_eq!(file.read(&mut buf).unwrap(), 100);
    assert!(buf[..100].iter().all(|&b| b == 7));
    // Position parked at EOF; the next read is a clean zero.
    assert_eq!(file.read(&mut buf).unwrap(), 0);
}

#[test]
fn seek_semantics() {
    let (_dir, path) = scratch("seek.bin");
    std::fs::write(&path, vec![0_u8; 500]).unwrap();

    let mut file = open_rw(&path, 8);
    assert_eq!(file.seek(SeekFrom::Start(10)).unwrap(), 10);
    assert_eq!(file.seek(SeekFrom::Current(5)).unwrap(), 15);
    assert_eq!(file.seek(SeekFrom::Current(-15)).unwrap(), 0);
    assert_eq!(file.seek(SeekFrom::End(-500)).unwrap(), 0);
    assert_eq!(file.seek(SeekFrom::End(100)).unwrap(), 600);

    let err = file.seek(SeekFrom::Current(-700)).unwrap_err();
    assert!(matches!(err, PagelabError::InvalidArgument(_)));
    // A failed seek leaves the position untouched.
    assert_eq!(file.position(), 600);
}

#[test]
fn access_mode_enforcement() {
    let (_dir, path) = scratch("modes.bin");
    std::fs::write(&path, vec![0_u8; 100]).unwrap();

    let mut write_only = PagedFile::options()
        .write(true)
        .page_size(page_size())
        .open(&path)
        .unwrap();
    let mut buf = [0_u8; 10];
    assert!(matches!(
        write_only.read(&mut buf).unwrap_err(),
        PagelabError::BadHandle
    ));
    // Zero-length reads succeed on any handle.
    assert_eq!(write_only.read(&mut []).unwrap(), 0);
    assert_eq!(write_only.write(&[1, 2, 3]).unwrap(), 3);

    let mut read_only = PagedFile::options()
        .read(true)
        .page_size(page_size())
        .open(&path)
        .unwrap();
    assert!(matches!(
        read_only.write(&[1]).unwrap_err(),
        PagelabError::BadHandle
    ));
    assert_eq!(read_only.write(&[]).unwrap(), 0);
    assert_eq!(read_only.read(&mut buf).unwrap(), 10);
}

#[test]
fn double_sync_is_idempotent() {
    let (_dir, path) = scratch("sync.bin");

    let mut file = open_rw(&path, 8);
    file.write(&[9_u8; 10]).unwrap();
    file.sync().unwrap();
    let flushes = file.metrics().flushes;

    // No intervening write: the second sync flushes nothing.
    file.sync().unwrap();
    assert_eq!(file.metrics().flushes, flushes);
    assert_eq!(file.len(), 10);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 10);
}

#[test]
fn eviction_heavy_workload_round_trips() {
    // A cache far smaller than the file: every page cycles through
    // admission, eviction with write-back, and reload.
    let (_dir, path) = scratch("evict_heavy.bin");
    let pages = 64_u64;

    let mut file = open_rw(&path, 4);
    for page in 0..pages {
        file.seek(SeekFrom::Start(page * PS)).unwrap();
        let payload = vec![page as u8; PS as usize];
        assert_eq!(file.write(&payload).unwrap(), PS as usize);
    }

    for page in (0..pages).rev() {
        file.seek(SeekFrom::Start(page * PS)).unwrap();
        let mut buf = vec![0_u8; PS as usize];
        assert_eq!(file.read(&mut buf).unwrap(), PS as usize);
        assert!(buf.iter().all(|&b| b == page as u8), "page {page}");
    }

    let m = file.metrics();
    assert!(m.evictions > 0, "workload never exercised eviction");
    file.close().unwrap();
    assert_eq!(std::fs::metadata(&path).unwrap().len(), pages * PS);
}

#[test]
fn scan_resistant_hot_pages_survive_on_disk_workload() {
    let (_dir, path) = scratch("scan.bin");
    std::fs::write(&path, vec![0xCD_u8; 128 * PS as usize]).unwrap();

    let mut file = open_rw(&path, 16);
    let mut buf = vec![0_u8; PS as usize];

    // Two hot pages, touched twice to reach the frequency queue.
    for _ in 0..2 {
        for page in [100_u64, 101] {
            file.seek(SeekFrom::Start(page * PS)).unwrap();
            file.read(&mut buf).unwrap();
        }
    }
    assert_eq!(file.metrics().am_len, 2);

    // A long single-touch scan.
    for page in 0_u64..100 {
        file.seek(SeekFrom::Start(page * PS)).unwrap();
        file.read(&mut buf).unwrap();
    }

    let hits_before = file.metrics().hits;
    for page in [100_u64, 101] {
        file.seek(SeekFrom::Start(page * PS)).unwrap();
        file.read(&mut buf).unwrap();
    }
    assert_eq!(file.metrics().hits, hits_before + 2);
}

#[test]
fn dirty_pages_flush_on_drop() {
    let (_dir, path) = scratch("drop.bin");
    {
        let mut file = open_rw(&path, 8);
        file.write(&[0x77_u8; 42]).unwrap();
        // No explicit sync or close: Drop must write back.
    }
    let on_disk = std::fs::read(&path).unwrap();
    assert_eq!(on_disk.len(), 42);
    assert!(on_disk.iter().all(|&b| b == 0x77));
}

#[test]
fn open_requires_an_access_mode() {
    let (_dir, path) = scratch("no_mode.bin");
    let err = PagedFileOptions::new().open(&path).unwrap_err();
    assert!(matches!(err, PagelabError::InvalidArgument(_)));
}

#[test]
fn growth_past_a_cached_page_reads_the_hole_as_zeros() {
    let (_dir, path) = scratch("hole.bin");

    let mut file = open_rw(&path, 8);
    // Page 0 enters the cache with a 100-byte valid prefix.
    file.write(&[0x33_u8; 100]).unwrap();

    // Grow the file through a later page; page 0 is now mid-file and the
    // bytes beyond its old prefix are a hole.
    file.seek(SeekFrom::Start(5000)).unwrap();
    file.write(&[0x44_u8; 10]).unwrap();
    assert_eq!(file.len(), 5010);

    file.seek(SeekFrom::Start(0)).unwrap();
    let mut buf = vec![0xFF_u8; 5010];
    assert_eq!(file.read(&mut buf).unwrap(), 5010);
    assert!(buf[..100].iter().all(|&b| b == 0x33));
    assert!(buf[100..5000].iter().all(|&b| b == 0));
    assert!(buf[5000..].iter().all(|&b| b == 0x44));
}

#[test]
fn overwrite_within_file_does_not_change_size() {
    let (_dir, path) = scratch("overwrite.bin");
    std::fs::write(&path, vec![0_u8; 8192]).unwrap();

    let mut file = open_rw(&path, 8);
    file.seek(SeekFrom::Start(1000)).unwrap();
    file.write(&[0xEE_u8; 100]).unwrap();
    file.sync().unwrap();

    assert_eq!(file.len(), 8192);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 8192);

    let on_disk = std::fs::read(&path).unwrap();
    assert!(on_disk[1000..1100].iter().all(|&b| b == 0xEE));
    assert!(on_disk[..1000].iter().all(|&b| b == 0));
}
