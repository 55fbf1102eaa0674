#![forbid(unsafe_code)]
//! Benchmark driver for the pagelab page cache.
//!
//! Pre-fills a target file, then runs a random page-access pattern over a
//! working set through either the cached handle API or raw direct-I/O page
//! reads, and reports throughput. The raw mode is the no-cache baseline the
//! replacement policy is measured against.

use anyhow::{Context, Result, ensure};
use clap::{Parser, ValueEnum};
use pagelab_cache::{CacheMetrics, PageBuf, PageStore};
use pagelab_file::{FilePageStore, PagedFileOptions, handles, system_page_size};
use pagelab_types::PageNumber;
use serde::Serialize;
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Raw direct-I/O page reads, no replacement cache.
    Raw,
    /// The cached handle API.
    Cached,
}

#[derive(Parser, Debug)]
#[command(
    name = "pagelab-bench",
    about = "pagelab — random page-access benchmark over a cached file handle"
)]
struct Cli {
    /// Target file; created and pre-filled if needed.
    file: PathBuf,

    /// Access path to benchmark.
    #[arg(long, value_enum, default_value_t = Mode::Cached)]
    mode: Mode,

    /// File size in pages.
    #[arg(long, default_value_t = 4096)]
    file_pages: u64,

    /// Working-set size in pages (clamped to the file size).
    #[arg(long, default_value_t = 256)]
    ws_pages: u64,

    /// Number of page accesses.
    #[arg(long, default_value_t = 500_000)]
    ops: u64,

    /// Percentage of accesses that are writes (cached mode only).
    #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=100))]
    write_ratio: u8,

    /// Xorshift seed for the access pattern.
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Cache capacity override in pages (default: PAGELAB_CACHE_PAGES or 256).
    #[arg(long)]
    cache_pages: Option<usize>,

    /// Emit the report as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
struct Report {
    mode: &'static str,
    file_pages: u64,
    ws_pages: u64,
    ops: u64,
    page_size: u32,
    write_ratio: u8,
    direct_io: bool,
    elapsed_secs: f64,
    ops_per_sec: f64,
    mib_per_sec: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache: Option<CacheMetrics>,
}

fn xorshift64(state: &mut u64) -> u64 {
    let mut x = *state;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    *state = x;
    x
}

/// Extend the target file to `file_pages` pages of 0xAB if it is shorter.
fn fill_file_if_needed(cli: &Cli, page_bytes: usize) -> Result<()> {
    let want = cli.file_pages * page_bytes as u64;
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&cli.file)
        .with_context(|| format!("open {} for fill", cli.file.display()))?;
    let have = file.metadata()?.len();
    if have >= want {
        return Ok(());
    }

    info!(
        event = "fill_start",
        path = %cli.file.display(),
        from_bytes = have,
        to_bytes = want
    );
    let pattern = vec![0xAB_u8; page_bytes];
    file.seek(SeekFrom::Start(have / page_bytes as u64 * page_bytes as u64))?;
    for _ in have / page_bytes as u64..cli.file_pages {
        file.write_all(&pattern)?;
    }
    file.set_len(want)?;
    file.sync_all()?;
    Ok(())
}

fn run_raw(cli: &Cli, ws_pages: u64) -> Result<Report> {
    let page_size = system_page_size();
    let writable = cli.write_ratio > 0;
    let store = FilePageStore::open(&cli.file, writable, false, page_size)?;
    let mut buf = PageBuf::zeroed(page_size)?;
    let mut seed = cli.seed;

    let start = Instant::now();
    for _ in 0..cli.ops {
        let r = xorshift64(&mut seed);
        let page = PageNumber(r % ws_pages);
        if writable && r % 100 < u64::from(cli.write_ratio) {
            buf.as_mut_slice().fill(r as u8);
            store.write_page(page, buf.as_slice())?;
        } else {
            let n = store.read_page(page, buf.as_mut_slice())?;
            ensure!(n == page_size.as_usize(), "short read of page {}", page.0);
        }
    }
    let elapsed = start.elapsed().as_secs_f64();

    Ok(report(cli, "raw", ws_pages, store.is_direct(), elapsed, None))
}

fn run_cached(cli: &Cli, ws_pages: u64) -> Result<Report> {
    let page_size = system_page_size();
    let page_bytes = page_size.as_usize();
    let writable = cli.write_ratio > 0;

    let mut options = PagedFileOptions::new();
    options.read(true).write(writable);
    if let Some(pages) = cli.cache_pages {
        options.cache_pages(pages);
    }
    let handle = handles::open(&cli.file, &options)?;

    let mut buf = vec![0_u8; page_bytes];
    let mut seed = cli.seed;

    let start = Instant::now();
    for _ in 0..cli.ops {
        let r = xorshift64(&mut seed);
        let page = r % ws_pages;
        handles::seek(handle, SeekFrom::Start(page * page_bytes as u64))?;
        if writable && r % 100 < u64::from(cli.write_ratio) {
            buf.fill(r as u8);
            ensure!(handles::write(handle, &buf)? == page_bytes);
        } else {
            let n = handles::read(handle, &mut buf)?;
            ensure!(n == page_bytes, "short read of page {page}");
        }
    }
    let elapsed = start.elapsed().as_secs_f64();

    let metrics = handles::metrics(handle)?;
    let direct = handles::is_direct(handle)?;
    handles::close(handle)?;
    Ok(report(cli, "cached", ws_pages, direct, elapsed, Some(metrics)))
}

fn report(
    cli: &Cli,
    mode: &'static str,
    ws_pages: u64,
    direct_io: bool,
    elapsed_secs: f64,
    cache: Option<CacheMetrics>,
) -> Report {
    let page_size = system_page_size();
    let total_bytes = cli.ops as f64 * page_size.as_usize() as f64;
    Report {
        mode,
        file_pages: cli.file_pages,
        ws_pages,
        ops: cli.ops,
        page_size: page_size.get(),
        write_ratio: cli.write_ratio,
        direct_io,
        elapsed_secs,
        ops_per_sec: cli.ops as f64 / elapsed_secs,
        mib_per_sec: total_bytes / (1024.0 * 1024.0) / elapsed_secs,
        cache,
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    ensure!(cli.file_pages > 0, "--file-pages must be positive");
    ensure!(cli.ops > 0, "--ops must be positive");
    ensure!(cli.ws_pages > 0, "--ws-pages must be positive");
    let ws_pages = cli.ws_pages.min(cli.file_pages);

    let page_size = system_page_size();
    fill_file_if_needed(&cli, page_size.as_usize())?;

    let report = match cli.mode {
        Mode::Raw => run_raw(&cli, ws_pages)?,
        Mode::Cached => run_cached(&cli, ws_pages)?,
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "mode={} file_pages={} ws_pages={} ops={} page_size={} write_ratio={}%",
            report.mode,
            report.file_pages,
            report.ws_pages,
            report.ops,
            report.page_size,
            report.write_ratio
        );
        println!(
            "time_sec={:.6} throughput_mib_s={:.2} ops_s={:.2} direct_io={}",
            report.elapsed_secs, report.mib_per_sec, report.ops_per_sec, report.direct_io
        );
        if let Some(cache) = &report.cache {
            println!(
                "hit_ratio={:.4} hits={} misses={} ghost_hits={} evictions={} flushes={}",
                cache.hit_ratio(),
                cache.hits,
                cache.misses,
                cache.ghost_hits,
                cache.evictions,
                cache.flushes
            );
        }
    }
    Ok(())
}
