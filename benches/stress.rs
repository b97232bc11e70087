use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{NaiveDate, NaiveTime, TimeDelta};

use studiobook::auth::Actor;
use studiobook::clock::SystemClock;
use studiobook::engine::{ApprovalPolicy, BookingRequest, Engine};
use studiobook::model::{ResourceId, ResourceKind};
use studiobook::notify::NotifyHub;
use studiobook::store::{InMemoryStore, ReservationStore, WalStore};

const STUDIOS: ResourceId = 10;
const EQUIPMENT: ResourceId = 20;

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.3}ms, p50={:.3}ms, p95={:.3}ms, p99={:.3}ms, max={:.3}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

fn engine(store: Arc<dyn ReservationStore>) -> Arc<Engine> {
    let engine = Engine::new(store, Arc::new(NotifyHub::new()), Arc::new(SystemClock), ApprovalPolicy::default());
    for id in 0..STUDIOS {
        engine.register_resource(ResourceKind::Studio, id, None);
    }
    for id in 0..EQUIPMENT {
        engine.register_resource(ResourceKind::Equipment, id, None);
    }
    Arc::new(engine)
}

fn day(offset: u64) -> NaiveDate {
    NaiveDate::from_ymd_opt(2030, 1, 1).unwrap() + TimeDelta::days(offset as i64)
}

/// Hour-long slot `i` of a 24-slot day, as (day offset, start, end).
fn hour_slot(i: u64) -> (NaiveDate, NaiveTime, NaiveTime) {
    let hour = (i % 23) as u32;
    let start = NaiveTime::from_hms_opt(hour, 0, 0).unwrap();
    let end = NaiveTime::from_hms_opt(hour + 1, 0, 0).unwrap();
    (day(i / 23), start, end)
}

async fn phase1_sequential(engine: &Engine) {
    let n = 2000;
    let staff = Actor::staff(1);
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n as u64 {
        let (d, s, e) = hour_slot(i);
        let t = Instant::now();
        engine
            .book(&staff, BookingRequest::new(ResourceKind::Studio, 0, d, s, e))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("book latency", &mut latencies);
}

async fn phase2_concurrent(engine: &Arc<Engine>) {
    let n_tasks = STUDIOS - 1;
    let n_per_task = 500;

    let start = Instant::now();
    let mut handles = Vec::new();
    for task in 0..n_tasks {
        let engine = engine.clone();
        // Studio 0 belongs to phase 1.
        let studio = task + 1;
        handles.push(tokio::spawn(async move {
            let staff = Actor::staff(100 + task);
            for i in 0..n_per_task {
                let (d, s, e) = hour_slot(i);
                let eq = (task + i) % EQUIPMENT;
                let request = BookingRequest::new(ResourceKind::Studio, studio, d, s, e).with_equipment([eq]);
                // Equipment is shared between tasks, so some of these conflict.
                let _ = engine.book(&staff, request).await;
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {n_per_task} bookings = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase3_read_under_load(engine: &Arc<Engine>) {
    let stop = Arc::new(AtomicBool::new(false));
    let mut writers = Vec::new();
    for w in 0..4u64 {
        let engine = engine.clone();
        let stop = stop.clone();
        writers.push(tokio::spawn(async move {
            let staff = Actor::staff(200 + w);
            let mut i = 0u64;
            while !stop.load(Ordering::Relaxed) {
                let (d, s, e) = hour_slot(10_000 * (w + 1) + i);
                let _ = engine
                    .book(&staff, BookingRequest::new(ResourceKind::Studio, w + 1, d, s, e))
                    .await;
                i += 1;
            }
        }));
    }

    let n_readers = 10u64;
    let reads_per_reader = 1000;
    let mut readers = Vec::new();
    for r in 0..n_readers {
        let engine = engine.clone();
        readers.push(tokio::spawn(async move {
            let open = NaiveTime::from_hms_opt(0, 0, 0).unwrap();
            let close = NaiveTime::from_hms_opt(23, 59, 0).unwrap();
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for i in 0..reads_per_reader as u64 {
                let t = Instant::now();
                engine
                    .availability(ResourceKind::Studio, (r + i) % STUDIOS, day(i % 40), open, close, None)
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all = Vec::new();
    for h in readers {
        all.extend(h.await.unwrap());
    }
    stop.store(true, Ordering::Relaxed);
    for h in writers {
        let _ = h.await;
    }
    print_latency("availability query", &mut all);
}

async fn phase4_contention(engine: &Arc<Engine>) {
    let n_slots = 200u64;
    let contenders = 25u64;
    let wins = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let mut handles = Vec::new();
    for slot in 0..n_slots {
        for c in 0..contenders {
            let engine = engine.clone();
            let wins = wins.clone();
            handles.push(tokio::spawn(async move {
                let (d, s, e) = hour_slot(slot);
                let request = BookingRequest::new(ResourceKind::Equipment, slot % EQUIPMENT, day(1000) + (d - day(0)), s, e);
                if engine.book(&Actor::staff(1000 + c), request).await.is_ok() {
                    wins.fetch_add(1, Ordering::Relaxed);
                }
            }));
        }
    }
    for h in handles {
        let _ = h.await;
    }

    let won = wins.load(Ordering::Relaxed);
    println!(
        "  {} attempts on {n_slots} slots: {won} won in {:.2}s",
        n_slots * contenders,
        start.elapsed().as_secs_f64()
    );
    assert_eq!(won as u64, n_slots, "every slot must be won exactly once");
}

async fn run(label: &str, engine: Arc<Engine>) {
    println!("\n=== {label} ===");

    println!("\n[phase 1] sequential booking throughput");
    phase1_sequential(&engine).await;

    println!("\n[phase 2] concurrent bookings with shared equipment");
    phase2_concurrent(&engine).await;

    println!("\n[phase 3] availability latency under write load");
    phase3_read_under_load(&engine).await;

    println!("\n[phase 4] many bookers per slot");
    phase4_contention(&engine).await;
}

#[tokio::main]
async fn main() {
    println!("=== studiobook stress benchmark ===");

    run("in-memory store", engine(Arc::new(InMemoryStore::new()))).await;

    let dir = std::env::temp_dir().join(format!("studiobook_bench_{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let store = Arc::new(WalStore::open(&dir.join("reservations.wal")).unwrap());
    run("WAL store", engine(store)).await;
    let _ = std::fs::remove_dir_all(&dir);

    println!("\n=== benchmark complete ===");
}
