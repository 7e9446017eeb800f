// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! balloon: the companion CPU-loading workload of the wattmask runtime.
//!
//! The balloon converts an integer level into a proportional amount of
//! CPU-bound work. It publishes its maximum level to a shared-memory file at
//! startup and then continuously polls a second file for the requested
//! level; the wattmask runtime writes that file, nothing else is exchanged
//! between the two processes.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use log::debug;
use log::info;
use rand::Rng;

/// Levels run 0..=MAX_LEVEL; two adjacent levels map to one intensity step.
const MAX_LEVEL: u32 = 20;

/// Grid side of the per-worker stencil kernel.
const GRID: usize = 500;

/// Per-step work schedule, indexed by level / 2: outer passes over the
/// grid, inner repetitions per cell, and the pause between rows in
/// nanoseconds. Higher steps do more work with shorter pauses.
const PASSES: [u32; 11] = [0, 1, 2, 4, 2, 1, 2, 1, 2, 2, 100];
const CELL_REPS: [u32; 11] = [0, 1, 1, 1, 4, 10, 9, 10, 4, 8, 100];
const ROW_PAUSE_NS: [u64; 11] = [0, 25000, 12000, 10000, 8000, 4000, 250, 200, 10, 0, 100];

/// balloon: synthetic CPU-bound workload whose intensity is set through a
/// shared-memory file.
///
/// Start it once per host with the worker count sized to the machine; the
/// wattmask runtime raises and lowers the level to add controllable watts
/// on top of the natural workload.
#[derive(Debug, Parser)]
struct Opts {
    /// Maximum number of worker threads.
    max_threads: usize,

    /// File the requested level is read from.
    #[clap(long, default_value = "/dev/shm/powerBalloon.txt")]
    level_file: PathBuf,

    /// File the maximum level is published to.
    #[clap(long, default_value = "/dev/shm/powerBalloonMax.txt")]
    max_file: PathBuf,

    /// Enable verbose output.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn worker(rank: usize, max_threads: usize, level: Arc<AtomicU32>, stop: Arc<AtomicBool>) {
    let mut rng = rand::thread_rng();
    let mut grid = vec![[0.0f64; GRID]; GRID];
    for row in grid.iter_mut() {
        for cell in row.iter_mut() {
            *cell = rng.gen_range(-1.0..1.0);
        }
    }

    while !stop.load(Ordering::Relaxed) {
        let level = level.load(Ordering::Relaxed).min(MAX_LEVEL);
        let step = (level / 2) as usize;
        let active = level as usize * (max_threads + 1) / MAX_LEVEL as usize;
        if step == 0 || rank >= active {
            std::thread::sleep(Duration::from_millis(10));
            continue;
        }

        for _ in 0..PASSES[step] {
            for i in 1..GRID - 1 {
                for j in 0..GRID {
                    for _ in 0..CELL_REPS[step] {
                        grid[i][j] = (grid[i - 1][j] + grid[i][j] + grid[i + 1][j]) * 0.333;
                    }
                }
                if ROW_PAUSE_NS[step] > 0 {
                    std::thread::sleep(Duration::from_nanos(ROW_PAUSE_NS[step] * 50));
                }
            }
        }
    }
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let llv = match opts.verbose {
        0 => simplelog::LevelFilter::Info,
        _ => simplelog::LevelFilter::Debug,
    };
    simplelog::TermLogger::init(
        llv,
        simplelog::Config::default(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    std::fs::write(&opts.max_file, format!("{}", MAX_LEVEL))
        .with_context(|| format!("Failed to publish max level to {:?}", opts.max_file))?;
    std::fs::write(&opts.level_file, "1")
        .with_context(|| format!("Failed to initialize {:?}", opts.level_file))?;

    let stop = Arc::new(AtomicBool::new(false));
    let stop_clone = stop.clone();
    ctrlc::set_handler(move || {
        stop_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    let level = Arc::new(AtomicU32::new(1));
    let mut workers = vec![];
    for rank in 0..opts.max_threads {
        let level = level.clone();
        let stop = stop.clone();
        let max_threads = opts.max_threads;
        workers.push(std::thread::spawn(move || {
            worker(rank, max_threads, level, stop)
        }));
    }
    info!(
        "balloon running with {} workers, level file {:?}",
        opts.max_threads, opts.level_file
    );

    while !stop.load(Ordering::Relaxed) {
        match std::fs::read_to_string(&opts.level_file) {
            Ok(text) => {
                if let Ok(new_level) = text.trim().parse::<i64>() {
                    let clamped = new_level.clamp(0, MAX_LEVEL as i64) as u32;
                    if clamped != level.load(Ordering::Relaxed) {
                        debug!("Level change: {}", clamped);
                        level.store(clamped, Ordering::Relaxed);
                    }
                }
            }
            Err(e) => debug!("Level read failed: {}", e),
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    for handle in workers {
        let _ = handle.join();
    }
    Ok(())
}
