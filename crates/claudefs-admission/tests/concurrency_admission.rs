//! Threaded tests of the admission gate and ledger.
//!
//! Every blocking scenario waits on the limiter's own waiter count before
//! acting, and bounds each join with a generous timeout so a lost wakeup
//! shows up as a failure instead of a hang.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use claudefs_admission::{
    AdmissionError, ChannelGcTrigger, DeviceGeometry, GcSignal, RateLimiter, RateLimiterConfig,
    RecordingGcTrigger, ZonedBlockPool,
};

const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

// 2 zones x 1024 blocks, 4096 slots: full admission at 1024 free blocks,
// closed at 128, per-zone band 51..512, mid-band shift 4.
fn attach(zone_free: &[u64]) -> (Arc<RateLimiter>, Arc<RecordingGcTrigger>) {
    let trigger = Arc::new(RecordingGcTrigger::new());
    let limiter = RateLimiter::attach(
        DeviceGeometry::new(2, 1024, 4096),
        &RateLimiterConfig::default(),
        zone_free,
        trigger.clone(),
    )
    .unwrap();
    (Arc::new(limiter), trigger)
}

fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + JOIN_TIMEOUT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(1));
    }
}

fn spawn_reserve(
    limiter: &Arc<RateLimiter>,
    n: u64,
) -> mpsc::Receiver<Result<(), AdmissionError>> {
    let (tx, rx) = mpsc::channel();
    let limiter = limiter.clone();
    thread::spawn(move || {
        let _ = tx.send(limiter.reserve(n));
    });
    rx
}

#[test]
fn test_release_wakes_every_parked_waiter() {
    let (limiter, _) = attach(&[1024, 1024]);
    limiter.reserve(4096).unwrap();

    let waiters: Vec<_> = (0..3).map(|_| spawn_reserve(&limiter, 1024)).collect();
    wait_for("three waiters", || limiter.waiters() == 3);

    limiter.release(4096).unwrap();
    for rx in waiters {
        rx.recv_timeout(JOIN_TIMEOUT).unwrap().unwrap();
    }
    assert_eq!(limiter.reserved_count(), 3072);
    assert_eq!(limiter.waiters(), 0);
    assert_eq!(limiter.stats().counters.waited, 3);
}

#[test]
fn test_empty_device_blocks_until_ledger_raises_ceiling() {
    let (limiter, trigger) = attach(&[0, 0]);
    assert_eq!(limiter.admission_ceiling(), 0);
    assert_eq!(trigger.signals(), vec![GcSignal::Start]);

    let rx = spawn_reserve(&limiter, 1);
    wait_for("parked reservation", || limiter.waiters() == 1);
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

    // Erase completions up to the low threshold keep admission closed.
    for _ in 0..128 {
        limiter.increment_free(0).unwrap();
    }
    assert_eq!(limiter.admission_ceiling(), 0);
    assert!(rx.recv_timeout(Duration::from_millis(20)).is_err());

    // One more crosses into the scaling band: 129 >> 4 = 8 windows.
    limiter.increment_free(1).unwrap();
    assert_eq!(limiter.admission_ceiling(), 8 * 64);
    rx.recv_timeout(JOIN_TIMEOUT).unwrap().unwrap();
    assert_eq!(limiter.reserved_count(), 1);
}

#[test]
fn test_override_raise_wakes_waiter() {
    let (limiter, _) = attach(&[0, 0]);
    let rx = spawn_reserve(&limiter, 32);
    wait_for("parked reservation", || limiter.waiters() == 1);

    limiter.set_ceiling(64);
    rx.recv_timeout(JOIN_TIMEOUT).unwrap().unwrap();
    assert_eq!(limiter.reserved_count(), 32);
}

#[test]
fn test_waiters_are_served_in_arrival_order() {
    let (limiter, _) = attach(&[1024, 1024]);
    limiter.reserve(4096).unwrap();

    let first = spawn_reserve(&limiter, 2048);
    wait_for("first waiter", || limiter.waiters() == 1);
    let second = spawn_reserve(&limiter, 64);
    wait_for("second waiter", || limiter.waiters() == 2);

    // Enough room for the small request only: it must not overtake.
    limiter.release(64).unwrap();
    assert!(second.recv_timeout(Duration::from_millis(50)).is_err());
    assert_eq!(limiter.reserved_count(), 4032);
    assert_eq!(limiter.waiters(), 2);

    limiter.release(2048).unwrap();
    first.recv_timeout(JOIN_TIMEOUT).unwrap().unwrap();
    second.recv_timeout(JOIN_TIMEOUT).unwrap().unwrap();
    assert_eq!(limiter.reserved_count(), 4096);
}

#[test]
fn test_newcomer_does_not_jump_the_queue() {
    let (limiter, _) = attach(&[1024, 1024]);
    limiter.reserve(4000).unwrap();

    let head = spawn_reserve(&limiter, 200);
    wait_for("head waiter", || limiter.waiters() == 1);

    // 96 slots are free, but a waiter is queued.
    assert!(!limiter.try_reserve(64).unwrap());

    limiter.release(104).unwrap();
    head.recv_timeout(JOIN_TIMEOUT).unwrap().unwrap();
    assert_eq!(limiter.reserved_count(), 4096);
}

#[test]
fn test_timed_out_head_lets_followers_through() {
    let (limiter, _) = attach(&[1024, 1024]);
    limiter.reserve(4096).unwrap();

    let (tx, head) = mpsc::channel();
    {
        let limiter = limiter.clone();
        thread::spawn(move || {
            let _ = tx.send(limiter.reserve_timeout(4096, Duration::from_millis(200)));
        });
    }
    wait_for("head waiter", || limiter.waiters() == 1);
    let follower = spawn_reserve(&limiter, 64);
    wait_for("follower", || limiter.waiters() == 2);

    limiter.release(64).unwrap();

    let result = head.recv_timeout(JOIN_TIMEOUT).unwrap();
    assert!(matches!(result, Err(AdmissionError::Timeout { requested: 4096, .. })));
    follower.recv_timeout(JOIN_TIMEOUT).unwrap().unwrap();
    assert_eq!(limiter.reserved_count(), 4096);
    assert_eq!(limiter.stats().counters.timed_out, 1);
}

#[test]
fn test_shutdown_fails_parked_reservations() {
    let (limiter, _) = attach(&[0, 0]);
    let a = spawn_reserve(&limiter, 1);
    let b = spawn_reserve(&limiter, 64);
    wait_for("two waiters", || limiter.waiters() == 2);

    limiter.shutdown();
    assert!(matches!(
        a.recv_timeout(JOIN_TIMEOUT).unwrap(),
        Err(AdmissionError::ShutDown)
    ));
    assert!(matches!(
        b.recv_timeout(JOIN_TIMEOUT).unwrap(),
        Err(AdmissionError::ShutDown)
    ));
    assert_eq!(limiter.waiters(), 0);
    assert_eq!(limiter.reserved_count(), 0);
}

#[test]
fn test_starved_zone_starts_gc_despite_healthy_device() {
    let geometry = DeviceGeometry::new(2, 1024, 4096);
    let pool = ZonedBlockPool::new(&geometry, &[0, 0]).unwrap();
    let trigger = Arc::new(RecordingGcTrigger::new());
    let limiter = RateLimiter::attach(
        geometry,
        &RateLimiterConfig::default(),
        &pool.free_block_counts(),
        trigger.clone(),
    )
    .unwrap();
    assert_eq!(trigger.signals(), vec![GcSignal::Stop]);

    // Drain zone 0 to 50 free blocks, one below its low threshold.
    for _ in 0..974 {
        pool.allocate(0, &limiter).unwrap().unwrap();
    }
    assert_eq!(pool.free_block_count(0).unwrap(), 50);
    assert_eq!(limiter.free_blocks(), 1074);
    assert!(limiter.free_blocks() >= limiter.thresholds().high_blocks());
    assert_eq!(limiter.admission_ceiling(), 4096);
    assert_eq!(trigger.signals(), vec![GcSignal::Stop, GcSignal::Start]);

    // Reclaiming back into the zone band keeps GC running; reaching the
    // zone's high threshold stops it.
    while pool.free_block_count(0).unwrap() < 511 {
        let victim = pool.oldest_used(0).unwrap().unwrap();
        pool.erase(victim, &limiter).unwrap();
    }
    assert_eq!(trigger.last(), Some(GcSignal::Start));
    let victim = pool.oldest_used(0).unwrap().unwrap();
    pool.erase(victim, &limiter).unwrap();
    assert_eq!(
        trigger.signals(),
        vec![GcSignal::Stop, GcSignal::Start, GcSignal::Stop]
    );
}

#[test]
fn test_concurrent_reservations_never_exceed_ceiling() {
    let (limiter, _) = attach(&[300, 300]);
    let ceiling = limiter.admission_ceiling();
    assert_eq!(ceiling, 37 * 64);

    let workers: Vec<_> = (0..8u64)
        .map(|id| {
            let limiter = limiter.clone();
            thread::spawn(move || {
                for i in 0..200u64 {
                    let n = 1 + (id * 131 + i * 17) % 512;
                    limiter.reserve(n).unwrap();
                    let stats = limiter.stats();
                    assert!(stats.reserved_count <= stats.admission_ceiling);
                    limiter.release(n).unwrap();
                }
            })
        })
        .collect();

    let monitor = {
        let limiter = limiter.clone();
        thread::spawn(move || {
            for _ in 0..2000 {
                let stats = limiter.stats();
                assert!(stats.reserved_count <= stats.admission_ceiling);
                thread::yield_now();
            }
        })
    };

    for worker in workers {
        worker.join().unwrap();
    }
    monitor.join().unwrap();
    assert_eq!(limiter.reserved_count(), 0);
    assert_eq!(limiter.waiters(), 0);
    assert_eq!(limiter.stats().counters.admitted, 1600);
}

#[test]
fn test_concurrent_ledger_updates_stay_consistent() {
    let geometry = DeviceGeometry::new(4, 256, 1024);
    let pool = Arc::new(ZonedBlockPool::new(&geometry, &[128, 128, 128, 128]).unwrap());
    let trigger = Arc::new(RecordingGcTrigger::new());
    let limiter = Arc::new(
        RateLimiter::attach(
            geometry,
            &RateLimiterConfig::default(),
            &pool.free_block_counts(),
            trigger.clone(),
        )
        .unwrap(),
    );

    let workers: Vec<_> = (0..4u32)
        .map(|zone| {
            let pool = pool.clone();
            let limiter = limiter.clone();
            thread::spawn(move || {
                for round in 0..500u32 {
                    let target = (zone + round) % 4;
                    if round % 3 == 2 {
                        if let Some(victim) = pool.oldest_used(target).unwrap() {
                            // Another worker may erase the same victim first.
                            let _ = pool.erase(victim, &limiter);
                        }
                    } else {
                        pool.allocate(target, &limiter).unwrap();
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let zone_counts = limiter.zone_free_counts();
    assert_eq!(zone_counts, pool.free_block_counts());
    assert_eq!(limiter.free_blocks(), zone_counts.iter().sum::<u64>());
    assert_eq!(
        limiter.admission_ceiling(),
        limiter
            .thresholds()
            .ceiling_for(limiter.free_blocks(), 1024)
    );

    let signals = trigger.signals();
    assert!(signals.windows(2).all(|pair| pair[0] != pair[1]));
}

#[test]
fn test_racing_ledger_updates_in_one_zone() {
    // No pool lock here: erase completions and allocations of the same zone
    // reach the aggregate in whatever order the threads get there.
    let (limiter, trigger) = attach(&[0, 0]);

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let limiter = limiter.clone();
            thread::spawn(move || {
                for _ in 0..2000 {
                    limiter.increment_free(0).unwrap();
                    limiter.decrement_free(0).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(limiter.zone_free_counts(), vec![0, 0]);
    assert_eq!(limiter.free_blocks(), 0);
    assert_eq!(limiter.admission_ceiling(), 0);
    assert_eq!(trigger.last(), Some(GcSignal::Start));

    for _ in 0..3 {
        limiter.increment_free(1).unwrap();
    }
    assert_eq!(limiter.free_blocks(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_channel_trigger_drives_async_reclaimer() {
    let geometry = DeviceGeometry::new(2, 1024, 4096);
    let pool = Arc::new(ZonedBlockPool::new(&geometry, &[600, 600]).unwrap());
    let (trigger, mut gc_rx) = ChannelGcTrigger::new();
    let limiter = Arc::new(
        RateLimiter::attach(
            geometry,
            &RateLimiterConfig::default(),
            &pool.free_block_counts(),
            Arc::new(trigger),
        )
        .unwrap(),
    );
    assert_eq!(limiter.free_blocks(), 848);

    let reclaimer = {
        let pool = pool.clone();
        let limiter = limiter.clone();
        tokio::spawn(async move {
            let mut erased = 0u64;
            assert_eq!(gc_rx.recv().await, Some(GcSignal::Start));
            loop {
                if let Ok(signal) = gc_rx.try_recv() {
                    assert_eq!(signal, GcSignal::Stop);
                    return erased;
                }
                let counts = limiter.zone_free_counts();
                let zone = if counts[0] <= counts[1] { 0 } else { 1 };
                let victim = pool.oldest_used(zone).unwrap().unwrap();
                pool.erase(victim, &limiter).unwrap();
                erased += 1;
                tokio::task::yield_now().await;
            }
        })
    };

    let erased = tokio::time::timeout(JOIN_TIMEOUT, reclaimer)
        .await
        .unwrap()
        .unwrap();
    // Both zones climb from 424 to 512 free before GC is told to stop.
    assert_eq!(erased, 176);
    assert_eq!(limiter.free_blocks(), 1024);
    assert_eq!(limiter.admission_ceiling(), 4096);
    assert_eq!(limiter.stats().last_signal, Some(GcSignal::Stop));
}
