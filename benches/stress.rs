use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, NaiveTime};
use slotbook::clock::ManualClock;
use slotbook::engine::{BookingError, Engine, NewAppointment, NewSchedule};
use slotbook::model::Period;
use slotbook::notify::NotifyHub;
use ulid::Ulid;

fn bench_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("slotbook_bench");
    std::fs::create_dir_all(&dir).expect("create bench dir");
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

fn engine(name: &str) -> Arc<Engine> {
    let now = NaiveDate::from_ymd_opt(2026, 9, 1).unwrap().and_hms_opt(8, 0, 0).unwrap();
    let clock = Arc::new(ManualClock::new(now));
    Arc::new(Engine::new(bench_wal_path(name), Arc::new(NotifyHub::new()), clock).expect("open engine"))
}

async fn schedule(engine: &Engine, day: u32, period: Period, total_slots: u32) -> Ulid {
    engine
        .create_schedule(NewSchedule {
            doctor_id: Ulid::new(),
            department_id: Ulid::new(),
            date: NaiveDate::from_ymd_opt(2026, 9, day).unwrap(),
            period,
            start_time: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
            total_slots,
            enabled: true,
        })
        .await
        .expect("create schedule")
        .id
}

fn new_appointment() -> NewAppointment {
    NewAppointment {
        user_id: Ulid::new(),
        patient_id: Ulid::new(),
        symptom: None,
    }
}

async fn phase1_sequential() {
    let engine = engine("phase1.wal");
    let sid = schedule(&engine, 10, Period::Morning, 999).await;
    let n = 999;

    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for _ in 0..n {
        let t = Instant::now();
        engine.book(sid, new_appointment()).await.unwrap();
        latencies.push(t.elapsed());
    }
    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

async fn phase2_contended() {
    let engine = engine("phase2.wal");
    let capacities = [1u32, 1, 1, 1, 1, 5, 5, 5, 10, 10];
    let mut schedules = Vec::new();
    for (i, &cap) in capacities.iter().enumerate() {
        schedules.push((schedule(&engine, 2 + i as u32, Period::Afternoon, cap).await, cap));
    }
    let attempts_per_schedule = 50;

    let start = Instant::now();
    let mut handles = Vec::new();
    for &(sid, _) in &schedules {
        for _ in 0..attempts_per_schedule {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move { engine.book(sid, new_appointment()).await }));
        }
    }
    let mut ok = 0usize;
    let mut full = 0usize;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(BookingError::CapacityExhausted(_)) => full += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    let elapsed = start.elapsed();

    let capacity: u32 = capacities.iter().sum();
    assert_eq!(ok, capacity as usize, "over- or under-booked");
    for &(sid, _) in &schedules {
        assert_eq!(engine.get_schedule(sid).await.unwrap().schedule.available_slots, 0);
    }
    println!(
        "  {} attempts on {} schedules: {ok} booked, {full} refused in {:.2}s",
        schedules.len() * attempts_per_schedule,
        schedules.len(),
        elapsed.as_secs_f64()
    );
}

async fn phase3_read_under_load() {
    let engine = engine("phase3.wal");
    let mut sids = Vec::new();
    for day in 2..30 {
        for period in Period::ALL {
            sids.push(schedule(&engine, day, period, 20).await);
        }
    }

    let writer = {
        let engine = engine.clone();
        let sids = sids.clone();
        tokio::spawn(async move {
            for i in 0..500 {
                let _ = engine.book(sids[i % sids.len()], new_appointment()).await;
            }
        })
    };

    let from = NaiveDate::from_ymd_opt(2026, 9, 1).unwrap();
    let to = NaiveDate::from_ymd_opt(2026, 9, 30).unwrap();
    let mut latencies = Vec::new();
    while !writer.is_finished() {
        let t = Instant::now();
        let listed = engine.list_available_schedules(None, from, to).await;
        latencies.push(t.elapsed());
        assert!(listed.len() <= sids.len());
        tokio::task::yield_now().await;
    }
    writer.await.unwrap();
    print_latency("list_available_schedules latency", &mut latencies);
}

async fn phase4_cancel_churn() {
    let engine = engine("phase4.wal");
    let sid = schedule(&engine, 20, Period::Morning, 3).await;
    let rounds = 300;

    let start = Instant::now();
    for _ in 0..rounds {
        let req = new_appointment();
        let user = req.user_id;
        let a = engine.book(sid, req).await.unwrap();
        engine.cancel(user, a.id, "schedule conflict".into()).await.unwrap();
    }
    let elapsed = start.elapsed();
    let info = engine.get_schedule(sid).await.unwrap();
    assert_eq!(info.schedule.available_slots, 3);
    println!(
        "  {rounds} book+cancel rounds in {:.2}s, last slot number {}",
        elapsed.as_secs_f64(),
        engine.next_slot_number(sid).await.unwrap() - 1
    );

    let t = Instant::now();
    engine.compact_wal().await.unwrap();
    println!("  compaction after churn: {:.2}ms", t.elapsed().as_secs_f64() * 1000.0);
}

#[tokio::main]
async fn main() {
    println!("=== slotbook stress benchmark ===\n");

    println!("[phase 1] sequential booking throughput");
    phase1_sequential().await;

    println!("\n[phase 2] contended capacity");
    phase2_contended().await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load().await;

    println!("\n[phase 4] cancel churn and compaction");
    phase4_cancel_churn().await;

    println!("\n=== benchmark complete ===");
}
