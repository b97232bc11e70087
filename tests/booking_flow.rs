use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveTime, TimeDelta};

use studiobook::auth::Actor;
use studiobook::clock::ManualClock;
use studiobook::engine::{ApprovalPolicy, BookingRequest, Engine, EngineError};
use studiobook::model::{EventKind, ResourceKind};
use studiobook::notify::NotifyHub;
use studiobook::status::Status;
use studiobook::store::WalStore;
use studiobook::sweeper;

fn wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("studiobook_test_flow");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{name}.wal"));
    let _ = std::fs::remove_file(&path);
    path
}

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 6, 3).unwrap()
}

fn hm(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

fn open(path: &PathBuf, clock: Arc<ManualClock>) -> (Arc<Engine>, Arc<WalStore>, Arc<NotifyHub>) {
    let store = Arc::new(WalStore::open(path).unwrap());
    let hub = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::new(store.clone(), hub.clone(), clock, ApprovalPolicy::default()));
    engine.register_resource(ResourceKind::Studio, 1, Some("Studio A".into()));
    engine.register_resource(ResourceKind::Equipment, 7, Some("Boom mic".into()));
    (engine, store, hub)
}

#[tokio::test]
async fn reservations_survive_restart() {
    let path = wal_path("restart");
    let clock = Arc::new(ManualClock::new(day().and_time(hm(8, 0))));
    let staff = Actor::staff(100);
    let member = Actor::member(5);

    let (approved_id, pending_id, canceled_id) = {
        let (engine, store, _hub) = open(&path, clock.clone());
        let approved = engine
            .book(
                &staff,
                BookingRequest::new(ResourceKind::Studio, 1, day(), hm(10, 0), hm(12, 0)).with_equipment([7]),
            )
            .await
            .unwrap();
        let pending = engine
            .book(&member, BookingRequest::new(ResourceKind::Studio, 1, day(), hm(13, 0), hm(14, 0)))
            .await
            .unwrap();
        let canceled = engine
            .book(&member, BookingRequest::new(ResourceKind::Studio, 1, day(), hm(15, 0), hm(16, 0)))
            .await
            .unwrap();
        engine.cancel(&member, canceled.id).await.unwrap();
        store.compact().await.unwrap();
        engine.add_team_member(&member, pending.id, 6).await.unwrap();
        (approved.id, pending.id, canceled.id)
    };
    // Let the first writer task wind down.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let (engine, _store, _hub) = open(&path, clock.clone());
    assert_eq!(engine.reservation(approved_id).await.unwrap().status, Status::Approved);
    let pending = engine.reservation(pending_id).await.unwrap();
    assert_eq!(pending.status, Status::Pending);
    assert_eq!(pending.team, vec![6]);
    assert_eq!(engine.reservation(canceled_id).await.unwrap().status, Status::Canceled);

    // The rebuilt index blocks the studio and the mic.
    let mic = BookingRequest::new(ResourceKind::Equipment, 7, day(), hm(11, 0), hm(11, 30));
    match engine.book(&staff, mic).await {
        Err(EngineError::Conflict { with, .. }) => assert_eq!(with, approved_id),
        other => panic!("expected conflict, got {other:?}"),
    }
    let schedule = engine.day_schedule(ResourceKind::Studio, 1, day()).await.unwrap();
    assert_eq!(schedule.len(), 1);
    assert_eq!(schedule[0].reservation_id, approved_id);

    // The canceled slot is free again.
    engine
        .book(&staff, BookingRequest::new(ResourceKind::Studio, 1, day(), hm(15, 0), hm(16, 0)))
        .await
        .unwrap();

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn bookings_after_a_crashed_write_survive_the_next_restart() {
    use std::io::Write;

    let path = wal_path("torn_tail");
    let clock = Arc::new(ManualClock::new(day().and_time(hm(8, 0))));
    let staff = Actor::staff(100);

    let morning = {
        let (engine, _store, _hub) = open(&path, clock.clone());
        engine
            .book(&staff, BookingRequest::new(ResourceKind::Studio, 1, day(), hm(9, 0), hm(10, 0)))
            .await
            .unwrap()
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    // Half a frame, as left by a crash during a write.
    {
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[0x2a, 0, 0, 0, 1, 2]).unwrap();
    }

    let afternoon = {
        let (engine, _store, _hub) = open(&path, clock.clone());
        assert_eq!(engine.reservation(morning.id).await.unwrap().status, Status::Approved);
        engine
            .book(
                &staff,
                BookingRequest::new(ResourceKind::Studio, 1, day(), hm(14, 0), hm(15, 0)).with_equipment([7]),
            )
            .await
            .unwrap()
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let (engine, _store, _hub) = open(&path, clock.clone());
    assert_eq!(engine.reservation(afternoon.id).await.unwrap().status, Status::Approved);
    let ids: Vec<_> = engine
        .day_schedule(ResourceKind::Studio, 1, day())
        .await
        .unwrap()
        .iter()
        .map(|e| e.reservation_id)
        .collect();
    assert_eq!(ids, vec![morning.id, afternoon.id]);

    // Both slots are still held after the second restart.
    let overlap = BookingRequest::new(ResourceKind::Equipment, 7, day(), hm(14, 30), hm(15, 30));
    assert!(engine.book(&staff, overlap).await.unwrap_err().is_slot_unavailable());

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn resource_subscribers_see_the_lifecycle() {
    let path = wal_path("lifecycle");
    let clock = Arc::new(ManualClock::new(day().and_time(hm(8, 0))));
    let (engine, _store, hub) = open(&path, clock.clone());
    let mut studio_events = hub.subscribe(ResourceKind::Studio, 1);
    let mut mic_events = hub.subscribe(ResourceKind::Equipment, 7);

    let member = Actor::member(5);
    let r = engine
        .book(
            &member,
            BookingRequest::new(ResourceKind::Studio, 1, day(), hm(9, 0), hm(10, 0)).with_equipment([7]),
        )
        .await
        .unwrap();
    engine.approve(&Actor::staff(100), r.id).await.unwrap();

    clock.advance(TimeDelta::hours(3));
    let sweep = tokio::spawn(sweeper::run_sweeper(engine.clone(), Duration::from_millis(10)));

    let mut kinds = Vec::new();
    for _ in 0..3 {
        let event = tokio::time::timeout(Duration::from_secs(5), studio_events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.reservation.id, r.id);
        kinds.push(event.kind);
    }
    sweep.abort();
    assert_eq!(
        kinds,
        vec![EventKind::ReservationRequested, EventKind::ReservationApproved, EventKind::ReservationPassed]
    );
    assert_eq!(mic_events.recv().await.unwrap().kind, EventKind::ReservationRequested);

    let passed = engine.reservation(r.id).await.unwrap();
    assert_eq!(passed.status, Status::Passed);
    assert!(matches!(
        engine.cancel(&member, r.id).await,
        Err(EngineError::InvalidTransition { from: Status::Passed, to: Status::Canceled })
    ));

    let _ = std::fs::remove_file(&path);
}
