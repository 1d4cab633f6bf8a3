use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use ulid::Ulid;

use super::*;
use crate::error::{Error, ErrorKind, StorageError};
use crate::store::Store;

const H: Ms = 3_600_000; // 1 hour in ms
const M: Ms = 60_000; // 1 minute in ms

fn at(rfc3339: &str) -> Ms {
    chrono::DateTime::parse_from_rfc3339(rfc3339)
        .unwrap()
        .timestamp_millis()
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("roombook_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn user() -> ActingUser {
    ActingUser {
        id: Ulid::new(),
        role: Role::User,
    }
}

fn admin() -> ActingUser {
    ActingUser {
        id: Ulid::new(),
        role: Role::Admin,
    }
}

async fn engine_with_room(name: &str, config: EngineConfig) -> (Engine<Store>, Ulid) {
    let store = Arc::new(Store::open(test_wal_path(name)).unwrap());
    let room = store
        .insert_room(Room {
            id: Ulid::new(),
            name: "R1".into(),
            capacity: 10,
            resources: vec![],
            description: None,
            status: RoomStatus::Available,
        })
        .await
        .unwrap();
    (Engine::new(store, config), room.id)
}

fn inclusive() -> EngineConfig {
    EngineConfig::default()
}

fn half_open() -> EngineConfig {
    EngineConfig {
        policy: BoundaryPolicy::HalfOpen,
        ..EngineConfig::default()
    }
}

// ── Availability ─────────────────────────────────────────

#[tokio::test]
async fn empty_room_is_available() {
    let (engine, room) = engine_with_room("avail_empty.wal", inclusive()).await;
    assert!(engine.is_available(room, Span::new(0, H), None).await.unwrap());
}

#[tokio::test]
async fn availability_rejects_bad_interval() {
    let (engine, room) = engine_with_room("avail_bad_span.wal", inclusive()).await;
    let err = engine
        .is_available(room, Span { start: 2 * H, end: H }, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn availability_unknown_room_not_found() {
    let (engine, _) = engine_with_room("avail_unknown.wal", inclusive()).await;
    let err = engine
        .is_available(Ulid::new(), Span::new(0, H), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn availability_excluding_ignores_that_reservation() {
    let (engine, room) = engine_with_room("avail_excluding.wal", inclusive()).await;
    let me = user();
    let r = engine.create(room, me.id, Span::new(H, 2 * H), None).await.unwrap();

    let span = Span::new(H + 10 * M, H + 20 * M);
    assert!(!engine.is_available(room, span, None).await.unwrap());
    assert!(engine.is_available(room, span, Some(r.id)).await.unwrap());
}

// ── Create ───────────────────────────────────────────────

#[tokio::test]
async fn create_confirms_by_default() {
    let (engine, room) = engine_with_room("create_default.wal", inclusive()).await;
    let me = user();
    let r = engine
        .create(room, me.id, Span::new(H, 2 * H), Some("lecture".into()))
        .await
        .unwrap();
    assert_eq!(r.status, ReservationStatus::Confirmed);
    assert_eq!(r.user_id, me.id);
    assert_eq!(r.reason.as_deref(), Some("lecture"));
    assert_eq!(engine.store().get_reservation(r.id).await.unwrap(), Some(r));
}

#[tokio::test]
async fn non_overlapping_bookings_all_succeed() {
    let (engine, room) = engine_with_room("create_disjoint.wal", inclusive()).await;
    let me = user();
    for i in 0..5 {
        let start = i * 2 * H;
        engine
            .create(room, me.id, Span::new(start, start + H), None)
            .await
            .unwrap();
    }
    let active = engine
        .store()
        .list_active_reservations_for_room(room, None)
        .await
        .unwrap();
    assert_eq!(active.len(), 5);
}

#[tokio::test]
async fn overlap_is_rejected_without_writing() {
    let (engine, room) = engine_with_room("create_overlap.wal", half_open()).await;
    let me = user();
    let first = engine.create(room, me.id, Span::new(H, 3 * H), None).await.unwrap();

    let err = engine
        .create(room, me.id, Span::new(2 * H, 4 * H), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Overlap { existing, .. } if existing == first.id));
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(engine.store().reservation_count(room).await, Some(1));
}

#[tokio::test]
async fn create_validates_input() {
    let (engine, room) = engine_with_room("create_validate.wal", inclusive()).await;
    let me = user();

    let err = engine
        .create(room, me.id, Span { start: H, end: H }, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let long = "x".repeat(crate::limits::MAX_REASON_LEN + 1);
    let err = engine
        .create(room, me.id, Span::new(0, H), Some(long))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(engine.store().reservation_count(room).await, Some(0));
}

#[tokio::test]
async fn create_in_unknown_room_not_found() {
    let (engine, _) = engine_with_room("create_unknown.wal", inclusive()).await;
    let err = engine
        .create(Ulid::new(), Ulid::new(), Span::new(0, H), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

// ── Boundary semantics (R1, 10:00-11:00 booked) ──────────

async fn book_ten_to_eleven(engine: &Engine<Store>, room: Ulid) {
    engine
        .create(
            room,
            Ulid::new(),
            Span::new(at("2024-01-01T10:00:00Z"), at("2024-01-01T11:00:00Z")),
            None,
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn partial_overlap_rejected_under_both_policies() {
    for (name, config) in [("ex_partial_incl.wal", inclusive()), ("ex_partial_half.wal", half_open())] {
        let (engine, room) = engine_with_room(name, config).await;
        book_ten_to_eleven(&engine, room).await;

        let span = Span::new(at("2024-01-01T10:30:00Z"), at("2024-01-01T11:30:00Z"));
        let err = engine.create(room, Ulid::new(), span, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict, "{:?}", config.policy);
    }
}

#[tokio::test]
async fn back_to_back_rejected_under_inclusive_policy() {
    let (engine, room) = engine_with_room("ex_touch_incl.wal", inclusive()).await;
    book_ten_to_eleven(&engine, room).await;

    let span = Span::new(at("2024-01-01T11:00:00Z"), at("2024-01-01T12:00:00Z"));
    assert!(!engine.is_available(room, span, None).await.unwrap());
    let err = engine.create(room, Ulid::new(), span, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn back_to_back_accepted_under_half_open_policy() {
    let (engine, room) = engine_with_room("ex_touch_half.wal", half_open()).await;
    book_ten_to_eleven(&engine, room).await;

    let span = Span::new(at("2024-01-01T11:00:00Z"), at("2024-01-01T12:00:00Z"));
    assert!(engine.is_available(room, span, None).await.unwrap());
    let r = engine.create(room, Ulid::new(), span, None).await.unwrap();
    assert_eq!(r.status, ReservationStatus::Confirmed);
}

// ── Cancel ───────────────────────────────────────────────

#[tokio::test]
async fn cancel_frees_the_interval() {
    let (engine, room) = engine_with_room("cancel_frees.wal", inclusive()).await;
    let me = user();
    let span = Span::new(H, 2 * H);
    let r = engine.create(room, me.id, span, None).await.unwrap();
    assert!(engine.create(room, me.id, span, None).await.is_err());

    let cancelled = engine.cancel(r.id, &me).await.unwrap();
    assert_eq!(cancelled.status, ReservationStatus::Cancelled);
    assert!(engine.is_available(room, span, None).await.unwrap());
    engine.create(room, me.id, span, None).await.unwrap();
}

#[tokio::test]
async fn non_owner_cannot_cancel() {
    let (engine, room) = engine_with_room("cancel_forbidden.wal", inclusive()).await;
    let owner = user();
    let r = engine.create(room, owner.id, Span::new(0, H), None).await.unwrap();

    let err = engine.cancel(r.id, &user()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
    let stored = engine.store().get_reservation(r.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ReservationStatus::Confirmed);
}

#[tokio::test]
async fn admin_can_cancel_any_reservation() {
    let (engine, room) = engine_with_room("cancel_admin.wal", inclusive()).await;
    let r = engine.create(room, Ulid::new(), Span::new(0, H), None).await.unwrap();
    let cancelled = engine.cancel(r.id, &admin()).await.unwrap();
    assert_eq!(cancelled.status, ReservationStatus::Cancelled);
}

#[tokio::test]
async fn cancel_twice_is_a_noop() {
    let path = test_wal_path("cancel_twice.wal");
    let store = Arc::new(Store::open(path).unwrap());
    let room = store
        .insert_room(Room {
            id: Ulid::new(),
            name: "Twice".into(),
            capacity: 2,
            resources: vec![],
            description: None,
            status: RoomStatus::Available,
        })
        .await
        .unwrap();
    let engine = Engine::new(store.clone(), inclusive());
    let me = user();
    let r = engine.create(room.id, me.id, Span::new(0, H), None).await.unwrap();

    engine.cancel(r.id, &me).await.unwrap();
    let appends = store.wal_appends_since_compact().await;
    let again = engine.cancel(r.id, &me).await.unwrap();
    assert_eq!(again.status, ReservationStatus::Cancelled);
    assert_eq!(store.wal_appends_since_compact().await, appends);
}

#[tokio::test]
async fn cancel_unknown_reservation_not_found() {
    let (engine, _) = engine_with_room("cancel_unknown.wal", inclusive()).await;
    let err = engine.cancel(Ulid::new(), &admin()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

// ── Approval ─────────────────────────────────────────────

fn with_approval() -> EngineConfig {
    EngineConfig {
        require_approval: true,
        ..EngineConfig::default()
    }
}

#[tokio::test]
async fn approval_flow_pending_then_confirmed() {
    let (engine, room) = engine_with_room("approve_flow.wal", with_approval()).await;
    let me = user();
    let r = engine.create(room, me.id, Span::new(0, H), None).await.unwrap();
    assert_eq!(r.status, ReservationStatus::Pending);

    // Pending reservations already block the period.
    let err = engine.create(room, Ulid::new(), Span::new(0, H), None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let confirmed = engine.confirm(r.id, &admin()).await.unwrap();
    assert_eq!(confirmed.status, ReservationStatus::Confirmed);
}

#[tokio::test]
async fn only_admins_confirm() {
    let (engine, room) = engine_with_room("approve_forbidden.wal", with_approval()).await;
    let me = user();
    let r = engine.create(room, me.id, Span::new(0, H), None).await.unwrap();
    let err = engine.confirm(r.id, &me).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
}

#[tokio::test]
async fn confirm_requires_pending() {
    let (engine, room) = engine_with_room("approve_not_pending.wal", with_approval()).await;
    let me = user();
    let r = engine.create(room, me.id, Span::new(0, H), None).await.unwrap();
    engine.cancel(r.id, &me).await.unwrap();

    let err = engine.confirm(r.id, &admin()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let r = engine.create(room, me.id, Span::new(2 * H, 3 * H), None).await.unwrap();
    engine.confirm(r.id, &admin()).await.unwrap();
    let err = engine.confirm(r.id, &admin()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

// ── Concurrency ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn simultaneous_identical_requests_book_once() {
    let (engine, room) = engine_with_room("race_identical.wal", inclusive()).await;
    let engine = Arc::new(engine);
    let span = Span::new(H, 2 * H);

    let a = tokio::spawn({
        let engine = engine.clone();
        async move { engine.create(room, Ulid::new(), span, None).await }
    });
    let b = tokio::spawn({
        let engine = engine.clone();
        async move { engine.create(room, Ulid::new(), span, None).await }
    });
    let results = [a.await.unwrap(), b.await.unwrap()];

    let ok = results.iter().filter(|r| r.is_ok()).count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(Error::Overlap { .. })))
        .count();
    assert_eq!((ok, conflicts), (1, 1));
    let active = engine
        .store()
        .list_active_reservations_for_room(room, None)
        .await
        .unwrap();
    assert_eq!(active.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn many_overlapping_requests_never_double_book() {
    let (engine, room) = engine_with_room("race_many.wal", inclusive()).await;
    let engine = Arc::new(engine);

    let mut handles = Vec::new();
    for i in 0..32 {
        let engine = engine.clone();
        // Every request overlaps every other one around the 1h mark.
        let span = Span::new(H - (i + 1) * M, H + (i + 1) * M);
        handles.push(tokio::spawn(async move {
            engine.create(room, Ulid::new(), span, None).await
        }));
    }
    let mut ok = 0;
    for h in handles {
        if h.await.unwrap().is_ok() {
            ok += 1;
        }
    }
    assert_eq!(ok, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn different_rooms_book_independently() {
    let store = Arc::new(Store::open(test_wal_path("race_rooms.wal")).unwrap());
    let mut rooms = Vec::new();
    for i in 0..4 {
        let room = store
            .insert_room(Room {
                id: Ulid::new(),
                name: format!("Room {i}"),
                capacity: 1,
                resources: vec![],
                description: None,
                status: RoomStatus::Available,
            })
            .await
            .unwrap();
        rooms.push(room.id);
    }
    let engine = Arc::new(Engine::new(store, inclusive()));

    let mut handles = Vec::new();
    for room in rooms {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.create(room, Ulid::new(), Span::new(0, H), None).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
}

// ── Storage failures ─────────────────────────────────────

/// Store whose every call fails, counting the attempts.
struct FailingStore {
    calls: AtomicUsize,
}

#[async_trait]
impl ReservationStore for FailingStore {
    async fn list_active_reservations_for_room(
        &self,
        _room_id: Ulid,
        _excluding: Option<Ulid>,
    ) -> Result<Vec<Reservation>, StorageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(StorageError::Unavailable("connection refused".into()))
    }

    async fn insert_reservation(&self, _new: NewReservation) -> Result<Reservation, StorageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(StorageError::Wal("disk full".into()))
    }

    async fn update_reservation_status(
        &self,
        _id: Ulid,
        _status: ReservationStatus,
    ) -> Result<Option<Reservation>, StorageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(StorageError::Wal("disk full".into()))
    }

    async fn get_reservation(&self, _id: Ulid) -> Result<Option<Reservation>, StorageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(StorageError::Unavailable("connection refused".into()))
    }
}

#[tokio::test]
async fn storage_failures_surface_unchanged() {
    let store = Arc::new(FailingStore {
        calls: AtomicUsize::new(0),
    });
    let engine = Engine::new(store.clone(), inclusive());
    let room = Ulid::new();

    let err = engine.is_available(room, Span::new(0, H), None).await.unwrap_err();
    assert!(matches!(err, Error::Storage(StorageError::Unavailable(ref m)) if m == "connection refused"));

    let err = engine.create(room, Ulid::new(), Span::new(0, H), None).await.unwrap_err();
    assert!(matches!(err, Error::Storage(StorageError::Unavailable(_))));

    let err = engine.cancel(Ulid::new(), &admin()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Storage);

    // No retries: one store call per operation.
    assert_eq!(store.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn validation_happens_before_storage() {
    let store = Arc::new(FailingStore {
        calls: AtomicUsize::new(0),
    });
    let engine = Engine::new(store.clone(), inclusive());
    let err = engine
        .create(Ulid::new(), Ulid::new(), Span { start: H, end: 0 }, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(store.calls.load(Ordering::SeqCst), 0);
}
