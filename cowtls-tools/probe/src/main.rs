//! cowtls Probe Binary
//!
//! Run with: `cowtls-probe [COMMAND]`

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use cowtls_runtime::{page_size, trap, FaultMatch, TlsConfig, TlsSpace, ThreadKey};

#[derive(Parser)]
#[command(name = "cowtls-probe")]
#[command(about = "Exercise copy-on-write thread-local storage")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Number of registry index slots (default: COWTLS_INDEX_CAPACITY or 97)
    #[arg(long, global = true)]
    index_capacity: Option<usize>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Clone a region across two threads and show copy-on-write at work
    Cow {
        /// Region size in bytes
        #[arg(long, default_value_t = 8192)]
        size: usize,

        /// Offset written by the original owner after the clone
        #[arg(long, default_value_t = 4096)]
        offset: usize,

        /// Bytes to write
        #[arg(long, default_value = "data")]
        data: String,
    },

    /// Touch a TLS page through a raw pointer from a helper thread
    Fault {
        /// Byte offset into the first page to touch
        #[arg(long, default_value_t = 0)]
        offset: usize,

        /// Match faults anywhere inside a page, not only at its first byte
        #[arg(long)]
        containment: bool,
    },

    /// Run concurrent create/write/read/destroy round-trips
    Stress {
        /// Number of threads
        #[arg(short, long, default_value_t = 8)]
        threads: usize,

        /// Round-trips per thread
        #[arg(short, long, default_value_t = 1000)]
        iterations: usize,

        /// Region size in bytes
        #[arg(long, default_value_t = 3 * 4096)]
        size: usize,
    },

    /// Show page size, configuration and registry statistics
    Info,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    let mut config = TlsConfig::from_env();
    if let Some(capacity) = cli.index_capacity {
        config.index_capacity = capacity;
    }

    match cli.command {
        Commands::Cow { size, offset, data } => cmd_cow(config, size, offset, data.as_bytes()),
        Commands::Fault { offset, containment } => {
            if containment {
                config.trap.fault_match = FaultMatch::Containment;
            }
            cmd_fault(config, offset)
        }
        Commands::Stress { threads, iterations, size } => cmd_stress(config, threads, iterations, size),
        Commands::Info => cmd_info(config),
    }
}

fn new_space(config: TlsConfig) -> Result<Arc<TlsSpace>> {
    config.validate().context("invalid configuration")?;
    Ok(Arc::new(TlsSpace::new(config)))
}

fn cmd_cow(config: TlsConfig, size: usize, offset: usize, data: &[u8]) -> Result<()> {
    let space = new_space(config)?;
    space.create(size).context("create failed")?;
    let owner = ThreadKey::current();
    info!(%owner, size, pages = space.region_info()?.page_count(), "original region created");

    let (cloned_tx, cloned_rx) = mpsc::channel();
    let (written_tx, written_rx) = mpsc::channel::<()>();
    let clone_space = Arc::clone(&space);
    let len = data.len();
    let clone = thread::spawn(move || -> Result<(Vec<usize>, Vec<u8>)> {
        clone_space.clone_region(owner).context("clone failed")?;
        cloned_tx.send(clone_space.region_info()?.share_counts)?;
        written_rx.recv()?;

        let counts = clone_space.region_info()?.share_counts;
        let mut view = vec![0u8; len];
        clone_space.read(offset, &mut view)?;
        clone_space.destroy()?;
        Ok((counts, view))
    });

    let after_clone = cloned_rx.recv().context("clone thread exited early")?;
    println!("share counts after clone:  {after_clone:?}");

    space.write(offset, data).context("write failed")?;
    written_tx.send(())?;

    let mut mine = vec![0u8; len];
    space.read(offset, &mut mine)?;
    let counts = space.region_info()?.share_counts;

    let (clone_counts, clone_view) = match clone.join() {
        Ok(result) => result?,
        Err(_) => bail!("clone thread panicked"),
    };
    space.destroy()?;

    println!("share counts after write:  {counts:?} (clone: {clone_counts:?})");
    println!("original sees at {offset}: {:?}", String::from_utf8_lossy(&mine));
    println!("clone sees at {offset}:    {:?}", String::from_utf8_lossy(&clone_view));
    Ok(())
}

fn cmd_fault(config: TlsConfig, offset: usize) -> Result<()> {
    if offset >= page_size() {
        bail!("offset {offset} is outside the first page ({} bytes)", page_size());
    }
    let policy = config.trap.fault_match;
    let space = new_space(config)?;
    space.create(64)?;
    let target = space.page_bases()?[0] + offset;
    info!(policy = policy.as_str(), address = format_args!("{target:#x}"), "touching TLS page");
    if policy == FaultMatch::PageStart && offset != 0 {
        println!("warning: page-start matching will treat this fault as unrelated and abort");
    }

    let survived = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&survived);
    let before = trap::terminated_threads();
    // Never joined: the trap ends this thread without unwinding.
    let _helper = thread::spawn(move || {
        // SAFETY: deliberately illegal; demonstrates the fault trap.
        let byte = unsafe { std::ptr::read_volatile(target as *const u8) };
        std::hint::black_box(byte);
        flag.store(true, Ordering::SeqCst);
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    while trap::terminated_threads() == before && !survived.load(Ordering::SeqCst) {
        if Instant::now() > deadline {
            bail!("helper thread neither finished nor was terminated");
        }
        thread::sleep(Duration::from_millis(5));
    }

    if survived.load(Ordering::SeqCst) {
        bail!("helper thread read TLS memory without being stopped");
    }
    space.destroy()?;
    println!("helper thread terminated; process still running");
    Ok(())
}

fn cmd_stress(config: TlsConfig, threads: usize, iterations: usize, size: usize) -> Result<()> {
    let space = new_space(config)?;
    let start = Instant::now();

    let handles: Vec<_> = (0..threads)
        .map(|n| {
            let space = Arc::clone(&space);
            thread::spawn(move || -> Result<()> {
                let pattern: Vec<u8> = (0..size).map(|i| (i + n) as u8).collect();
                let mut back = vec![0u8; size];
                for _ in 0..iterations {
                    space.create(size)?;
                    space.write(0, &pattern)?;
                    space.read(0, &mut back)?;
                    if back != pattern {
                        bail!("thread {n} read back different bytes");
                    }
                    space.destroy()?;
                }
                Ok(())
            })
        })
        .collect();

    for handle in handles {
        match handle.join() {
            Ok(result) => result?,
            Err(_) => bail!("stress thread panicked"),
        }
    }

    let elapsed = start.elapsed();
    let rounds = threads * iterations;
    info!(rounds, ?elapsed, "stress run complete");
    println!(
        "{rounds} round-trips in {elapsed:?} ({:.0} per second)",
        rounds as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    Ok(())
}

fn cmd_info(config: TlsConfig) -> Result<()> {
    let space = new_space(config)?;
    let stats = space.stats();
    println!("cowtls-runtime {}", cowtls_runtime::VERSION);
    println!("page size:        {} bytes", page_size());
    println!("index capacity:   {}", stats.capacity);
    println!("fault trap:       {}", if space.config().trap.install { "on first create" } else { "disabled" });
    println!("fault matching:   {}", space.config().trap.fault_match.as_str());
    println!("lock spins:       {}", space.config().trap.lock_spins);
    println!("live regions:     {}", stats.live_regions);
    Ok(())
}
