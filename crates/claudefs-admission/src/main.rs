#![warn(missing_docs)]

//! Admission-control simulator: attaches a rate limiter to an in-memory zoned
//! device and runs writers, a flusher and a GC reclaimer against it.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use claudefs_admission::{
    status_line, AdmissionConfig, AdmissionError, ChannelGcTrigger, GcSignal, RateLimiter,
    ZonedBlockPool,
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "cfs-admission-sim")]
#[command(about = "ClaudeFS write admission and GC hysteresis simulator", long_about = None)]
struct Args {
    /// Configuration file (.toml or .json); built-in defaults when absent.
    #[arg(short, long, env = "CFS_ADMISSION_CONFIG")]
    config: Option<PathBuf>,

    /// Concurrent writer threads.
    #[arg(short, long, default_value = "4")]
    writers: usize,

    /// Slots reserved per write.
    #[arg(long, default_value = "64")]
    request_slots: u64,

    /// Percentage of every zone already allocated at attach.
    #[arg(long, default_value = "40")]
    used_pct: u8,

    /// Simulation length in seconds.
    #[arg(short, long, default_value = "5")]
    duration_secs: u64,

    /// Reclaimer tick in milliseconds.
    #[arg(long, default_value = "2")]
    gc_tick_ms: u64,

    /// Status report interval in milliseconds.
    #[arg(long, default_value = "500")]
    report_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => AdmissionConfig::from_file(path)?,
        None => AdmissionConfig::default(),
    };
    let geometry = config.geometry.clone();

    let used_pct = u64::from(args.used_pct.min(100));
    let used: Vec<u64> = (0..geometry.nr_zones)
        .map(|_| geometry.blocks_per_zone * used_pct / 100)
        .collect();
    let pool = Arc::new(ZonedBlockPool::new(&geometry, &used)?);

    let (trigger, mut gc_rx) = ChannelGcTrigger::new();
    let limiter = Arc::new(RateLimiter::attach(
        geometry.clone(),
        &config.limiter,
        &pool.free_block_counts(),
        Arc::new(trigger),
    )?);
    tracing::info!("{}", status_line(&limiter).trim_end());

    let stop = Arc::new(AtomicBool::new(false));
    let (flush_tx, flush_rx) = mpsc::channel::<u64>();

    let mut writers = Vec::with_capacity(args.writers);
    for id in 0..args.writers {
        let limiter = limiter.clone();
        let stop = stop.clone();
        let flush_tx = flush_tx.clone();
        let slots = args.request_slots;
        writers.push(tokio::task::spawn_blocking(move || {
            let mut writes = 0u64;
            while !stop.load(Ordering::Relaxed) {
                match limiter.reserve(slots) {
                    Ok(()) => {
                        writes += 1;
                        if flush_tx.send(slots).is_err() {
                            break;
                        }
                    }
                    Err(AdmissionError::ShutDown) => break,
                    Err(e) => {
                        tracing::error!(writer = id, error = %e, "reservation failed");
                        break;
                    }
                }
            }
            writes
        }));
    }
    drop(flush_tx);

    let flusher = {
        let limiter = limiter.clone();
        let pool = pool.clone();
        let stop = stop.clone();
        let nr_zones = geometry.nr_zones;
        tokio::task::spawn_blocking(move || -> Result<u64> {
            let mut next_zone = 0u32;
            let mut blocks = 0u64;
            for slots in flush_rx {
                // One erase block per staged write, round-robin over zones.
                let mut placed = false;
                while !placed && !stop.load(Ordering::Relaxed) {
                    for _ in 0..nr_zones {
                        let zone = next_zone;
                        next_zone = (next_zone + 1) % nr_zones;
                        if pool.allocate(zone, &limiter)?.is_some() {
                            placed = true;
                            blocks += 1;
                            break;
                        }
                    }
                    if !placed {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                }
                limiter.release(slots)?;
            }
            Ok(blocks)
        })
    };

    let reclaimer = {
        let limiter = limiter.clone();
        let pool = pool.clone();
        let nr_zones = geometry.nr_zones;
        let tick = Duration::from_millis(args.gc_tick_ms.max(1));
        tokio::spawn(async move {
            let mut active = false;
            let mut erased = 0u64;
            let mut ticker = tokio::time::interval(tick);
            loop {
                tokio::select! {
                    signal = gc_rx.recv() => match signal {
                        Some(signal) => {
                            active = signal == GcSignal::Start;
                            tracing::debug!(%signal, "reclaimer signalled");
                        }
                        None => break,
                    },
                    _ = ticker.tick() => {
                        if limiter.is_shut_down() {
                            break;
                        }
                        if !active {
                            continue;
                        }
                        let counts = limiter.zone_free_counts();
                        let victim_zone = (0..nr_zones)
                            .min_by_key(|z| counts[*z as usize])
                            .unwrap_or(0);
                        if let Ok(Some(addr)) = pool.oldest_used(victim_zone) {
                            if pool.erase(addr, &limiter).is_ok() {
                                erased += 1;
                            }
                        }
                    }
                }
            }
            erased
        })
    };

    let reporter = {
        let limiter = limiter.clone();
        let interval = Duration::from_millis(args.report_ms.max(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            while !limiter.is_shut_down() {
                ticker.tick().await;
                tracing::info!("{}", status_line(&limiter).trim_end());
            }
        })
    };

    tokio::time::sleep(Duration::from_secs(args.duration_secs)).await;
    stop.store(true, Ordering::Relaxed);
    limiter.shutdown();

    let mut writes = 0u64;
    for writer in writers {
        writes += writer.await?;
    }
    let blocks = flusher.await??;
    reporter.await?;
    let erased = reclaimer.await?;

    tracing::info!(writes, blocks, erased, "simulation finished");
    println!("{}", limiter.stats().to_json()?);
    Ok(())
}
