//! Mixed writer/reader workload over a [`StorageEnv`].
//!
//! One writer commits page versions into scratch space while reader threads
//! resolve pages at their snapshots and decode compressed pages through the
//! decompression pool.

use std::error::Error;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use penumbra::logging::init_logging;
use penumbra::storage::{compress_page, CounterMetrics, PagePosition, StorageMetrics};
use penumbra::{PageId, PenumbraError, StorageEnv, StorageOptions};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rustc_hash::FxHashMap;

#[derive(Parser, Debug)]
struct Args {
    /// Write transactions to commit.
    #[arg(long, default_value_t = 2_000)]
    transactions: usize,

    /// Pages written by each transaction.
    #[arg(long, default_value_t = 8)]
    pages_per_tx: usize,

    /// Distinct logical pages the workload touches.
    #[arg(long, default_value_t = 512)]
    page_range: u64,

    /// Concurrent reader threads.
    #[arg(long, default_value_t = 4)]
    readers: usize,

    /// Flush the journal every N commits.
    #[arg(long, default_value_t = 64)]
    flush_every: usize,

    /// Back scratch space and the journal with files in a temporary directory.
    #[arg(long)]
    file_backed: bool,

    /// Page size in bytes.
    #[arg(long, default_value_t = 4096)]
    page_size: u32,

    /// RNG seed for repeatable runs.
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Log filter passed to the tracing subscriber.
    #[arg(long, env = "PENUMBRA_LOG", default_value = "warn")]
    log: String,
}

fn main() {
    if let Err(err) = try_main() {
        eprintln!("scratch-bench failed: {err}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_logging(&args.log)?;

    let tmpdir = tempfile::tempdir()?;
    let mut options = StorageOptions::default().page_size(args.page_size);
    if args.file_backed {
        options = options
            .scratch_dir(tmpdir.path().join("scratch"))
            .journal_path(tmpdir.path().join("journal.pnj"));
    }
    let metrics = Arc::new(CounterMetrics::default());
    let sink: Arc<dyn StorageMetrics> = metrics.clone();
    let env = Arc::new(StorageEnv::open(options)?.with_metrics(sink));

    let stop = Arc::new(AtomicBool::new(false));
    let reads = Arc::new(AtomicU64::new(0));
    let readers: Vec<_> = (0..args.readers)
        .map(|idx| {
            let env = Arc::clone(&env);
            let stop = Arc::clone(&stop);
            let reads = Arc::clone(&reads);
            let seed = args.seed.wrapping_add(idx as u64 + 1);
            let page_range = args.page_range;
            thread::spawn(move || run_reader(&env, &stop, &reads, seed, page_range))
        })
        .collect();

    let start = Instant::now();
    let write_result = run_writer(&env, &args);
    let write_time = start.elapsed();
    stop.store(true, Ordering::Release);
    for handle in readers {
        match handle.join() {
            Ok(result) => result?,
            Err(_) => return Err("reader thread panicked".into()),
        }
    }
    write_result?;

    let flushed = env.flush_journal()?;
    let disposed = env.cleanup();
    let stats = env.stats();

    println!("=== Penumbra Scratch Benchmark ===");
    println!("{:<28} {:>12}", "transactions", args.transactions);
    println!("{:<28} {:>12}", "write time", format_duration(write_time));
    println!(
        "{:<28} {:>12.0}",
        "commits/s",
        args.transactions as f64 / write_time.as_secs_f64().max(f64::EPSILON)
    );
    println!("{:<28} {:>12}", "reader lookups", reads.load(Ordering::Relaxed));
    println!(
        "{:<28} {:>12}",
        "resolve hits",
        metrics.resolve_hits.load(Ordering::Relaxed)
    );
    println!(
        "{:<28} {:>12}",
        "scratch pages allocated",
        metrics.scratch_pages_allocated.load(Ordering::Relaxed)
    );
    println!(
        "{:<28} {:>12}",
        "pending frees",
        metrics.scratch_pending_frees.load(Ordering::Relaxed)
    );
    println!("{:<28} {:>12}", "scratch files", stats.scratch.files.len());
    println!(
        "{:<28} {:>12}",
        "temp pages",
        metrics.temp_pages.load(Ordering::Relaxed)
    );
    println!(
        "{:<28} {:>12}",
        "pooled temp buffers", stats.decompression.pooled_buffers
    );
    println!("{:<28} {:>12}", "journal bytes", stats.journal_bytes);
    println!("{:<28} {:>12}", "final gc boundary", flushed.gc_boundary);
    println!("{:<28} {:>12}", "disposed on cleanup", disposed);
    Ok(())
}

fn run_writer(env: &StorageEnv, args: &Args) -> penumbra::Result<()> {
    let mut rng = ChaCha8Rng::seed_from_u64(args.seed);
    for idx in 0..args.transactions {
        let tx = env.begin_write()?;
        let mut items = FxHashMap::default();
        for _ in 0..args.pages_per_tx {
            let page = PageId(rng.gen_range(0..args.page_range));
            if items.contains_key(&page) {
                continue;
            }
            let allocation = env.allocate_scratch(&tx, 1)?;
            let mut span = env.page_mut(&allocation)?;
            if let Some(bytes) = span.page_mut(0) {
                rng.fill(&mut bytes[..64]);
                bytes[..8].copy_from_slice(&page.0.to_le_bytes());
            }
            drop(span);
            items.insert(page, PagePosition::from_allocation(&allocation, tx.id()));
        }
        env.commit_versions(tx, &items)?;
        if (idx + 1) % args.flush_every.max(1) == 0 {
            env.flush_journal()?;
            env.cleanup();
        }
    }
    Ok(())
}

fn run_reader(
    env: &StorageEnv,
    stop: &AtomicBool,
    reads: &AtomicU64,
    seed: u64,
    page_range: u64,
) -> penumbra::Result<()> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let page_size = env.page_size();
    let mut sample = vec![0u8; page_size];
    rng.fill(&mut sample[..page_size / 4]);
    let compressed = compress_page(&sample)?;

    while !stop.load(Ordering::Acquire) {
        let read = env.begin_read()?;
        for _ in 0..16 {
            let page = PageId(rng.gen_range(0..page_range));
            let seen = env.with_page(read.id(), page, |bytes| {
                let mut tag = [0u8; 8];
                tag.copy_from_slice(&bytes[..8]);
                u64::from_le_bytes(tag)
            })?;
            if seen.is_some_and(|tag| tag != page.0) {
                return Err(PenumbraError::Corruption("page resolved to foreign bytes"));
            }
            reads.fetch_add(1, Ordering::Relaxed);
        }
        let scope = env.decompress_page(read.context(), &compressed, page_size)?;
        if scope.to_vec()[..page_size] != sample[..] {
            return Err(PenumbraError::Corruption("decompressed page mismatch"));
        }
        drop(scope);
        drop(read);
        thread::sleep(Duration::from_micros(50));
    }
    Ok(())
}

fn format_duration(d: Duration) -> String {
    let micros = d.as_micros();
    if micros < 1_000 {
        format!("{} µs", micros)
    } else if micros < 1_000_000 {
        format!("{:.2} ms", micros as f64 / 1_000.0)
    } else {
        format!("{:.2} s", micros as f64 / 1_000_000.0)
    }
}
