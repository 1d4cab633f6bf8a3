mod reservations;
mod rooms;
mod users;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock, RwLockReadGuard, mpsc, oneshot};
use ulid::Ulid;

use crate::error::StorageError;
use crate::model::*;
use crate::wal::Wal;

pub type SharedRoomState = Arc<RwLock<RoomState>>;

/// Persistence contract consumed by the booking engine.
///
/// Every method may fail with a [`StorageError`]; implementations never
/// swallow backend failures.
#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// All non-cancelled reservations for `room_id`, optionally leaving one out.
    async fn list_active_reservations_for_room(
        &self,
        room_id: Ulid,
        excluding: Option<Ulid>,
    ) -> Result<Vec<Reservation>, StorageError>;

    async fn insert_reservation(&self, new: NewReservation) -> Result<Reservation, StorageError>;

    /// Returns `None` if no reservation has this id.
    async fn update_reservation_status(
        &self,
        id: Ulid,
        status: ReservationStatus,
    ) -> Result<Option<Reservation>, StorageError>;

    async fn get_reservation(&self, id: Ulid) -> Result<Option<Reservation>, StorageError>;
}

// ── Group-commit WAL channel ─────────────────────────────

pub(crate) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = (Event, oneshot::Sender<io::Result<()>>);

/// Background task owning the WAL. Appends that queue up while one batch is
/// being written share a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<Pending>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut append_err = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so a half-written batch never leaks
    // into the next one; every sender of this batch is told it failed.
    let flush_err = wal.flush_sync().err();
    let result = match append_err.or(flush_err) {
        Some(e) => Err(e),
        None => Ok(()),
    };

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// Durable store: in-memory indexes rebuilt from the WAL on open.
pub struct Store {
    rooms: DashMap<Ulid, SharedRoomState>,
    /// Normalized room name → room id.
    room_names: DashMap<String, Ulid>,
    /// Reverse lookup: reservation id → room id.
    reservation_room: DashMap<Ulid, Ulid>,
    users: DashMap<Ulid, User>,
    matriculas: DashMap<String, Ulid>,
    /// Lowercased email → user id.
    emails: DashMap<String, Ulid>,
    /// Serializes room and user writes so uniqueness checks and inserts are atomic.
    registry: Mutex<()>,
    /// Held shared by every mutation from WAL append to in-memory apply;
    /// compaction takes it exclusively. Always acquired before any room lock.
    commit_gate: RwLock<()>,
    wal_tx: mpsc::Sender<WalCommand>,
}

pub(crate) fn name_key(name: &str) -> String {
    name.trim().to_lowercase()
}

pub(crate) fn email_key(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

/// Apply a room-scoped event (caller holds the room lock).
fn apply_to_room(rs: &mut RoomState, event: &Event, reservation_room: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ReservationCreated { reservation } => {
            reservation_room.insert(reservation.id, reservation.room_id);
            rs.insert_reservation(reservation.clone());
        }
        Event::ReservationStatusChanged { id, status, .. } => {
            if let Some(r) = rs.reservation_mut(id) {
                r.status = *status;
            }
        }
        Event::RoomUpdated { room } => rs.room = room.clone(),
        // Room creation/deletion and user events are handled at the map level.
        Event::RoomCreated { .. }
        | Event::RoomDeleted { .. }
        | Event::UserRegistered { .. }
        | Event::PasswordChanged { .. } => {}
    }
}

impl Store {
    /// Replay the WAL at `path` and start the group-commit writer.
    /// Must be called from within a tokio runtime.
    pub fn open(path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&path)?;
        let wal = Wal::open(&path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Self {
            rooms: DashMap::new(),
            room_names: DashMap::new(),
            reservation_room: DashMap::new(),
            users: DashMap::new(),
            matriculas: DashMap::new(),
            emails: DashMap::new(),
            registry: Mutex::new(()),
            commit_gate: RwLock::new(()),
            wal_tx,
        };
        for event in &events {
            store.replay_event(event);
        }
        tracing::info!(
            events = events.len(),
            rooms = store.rooms.len(),
            users = store.users.len(),
            reservations = store.reservation_room.len(),
            "store replayed from {}",
            path.display()
        );
        Ok(store)
    }

    // We are the sole owner of every lock during replay, so try_read/try_write
    // always succeed. Blocking variants would panic inside the runtime.
    fn replay_event(&self, event: &Event) {
        match event {
            Event::UserRegistered { .. } | Event::PasswordChanged { .. } => self.apply_user(event),
            Event::RoomCreated { room } => self.index_new_room(room.clone()),
            Event::RoomDeleted { id } => self.drop_room(id),
            Event::RoomUpdated { room } => {
                if let Some(rs) = self.get_room_state(&room.id) {
                    let Ok(mut guard) = rs.try_write() else { return };
                    self.reindex_room_name(&guard.room.name, room);
                    apply_to_room(&mut guard, event, &self.reservation_room);
                }
            }
            Event::ReservationCreated { reservation } => {
                self.replay_room_event(reservation.room_id, event);
            }
            Event::ReservationStatusChanged { room_id, .. } => {
                self.replay_room_event(*room_id, event);
            }
        }
    }

    fn replay_room_event(&self, room_id: Ulid, event: &Event) {
        if let Some(rs) = self.get_room_state(&room_id)
            && let Ok(mut guard) = rs.try_write()
        {
            apply_to_room(&mut guard, event, &self.reservation_room);
        }
    }

    fn apply_user(&self, event: &Event) {
        match event {
            Event::UserRegistered {
                id,
                matricula,
                name,
                email,
                password_hash,
                role,
            } => {
                self.matriculas.insert(matricula.clone(), *id);
                self.emails.insert(email_key(email), *id);
                self.users.insert(
                    *id,
                    User {
                        id: *id,
                        matricula: matricula.clone(),
                        name: name.clone(),
                        email: email.clone(),
                        password_hash: password_hash.clone(),
                        role: *role,
                    },
                );
            }
            Event::PasswordChanged { id, password_hash } => {
                if let Some(mut user) = self.users.get_mut(id) {
                    user.password_hash = password_hash.clone();
                }
            }
            _ => {}
        }
    }

    fn index_new_room(&self, room: Room) {
        self.room_names.insert(name_key(&room.name), room.id);
        self.rooms
            .insert(room.id, Arc::new(RwLock::new(RoomState::new(room))));
    }

    fn reindex_room_name(&self, old_name: &str, room: &Room) {
        let old_key = name_key(old_name);
        let new_key = name_key(&room.name);
        if old_key != new_key {
            self.room_names.remove(&old_key);
            self.room_names.insert(new_key, room.id);
        }
    }

    fn drop_room(&self, id: &Ulid) {
        if let Some((_, rs)) = self.rooms.remove(id)
            && let Ok(guard) = rs.try_read()
        {
            self.unindex_room(&guard);
        }
    }

    fn unindex_room(&self, state: &RoomState) {
        self.room_names.remove(&name_key(&state.room.name));
        for r in &state.reservations {
            self.reservation_room.remove(&r.id);
        }
    }

    pub(crate) fn get_room_state(&self, id: &Ulid) -> Option<SharedRoomState> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    /// Snapshot of room handles; never hold a map reference across an await.
    fn room_states(&self) -> Vec<SharedRoomState> {
        self.rooms.iter().map(|e| e.value().clone()).collect()
    }

    pub(crate) async fn commit_guard(&self) -> RwLockReadGuard<'_, ()> {
        self.commit_gate.read().await
    }

    /// Write event to the WAL via the background group-commit writer.
    pub(crate) async fn wal_append(&self, event: &Event) -> Result<(), StorageError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StorageError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StorageError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StorageError::Wal(e.to_string()))
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Rewrite the WAL with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), StorageError> {
        let _exclusive = self.commit_gate.write().await;

        let mut events: Vec<Event> = self
            .users
            .iter()
            .map(|u| Event::UserRegistered {
                id: u.id,
                matricula: u.matricula.clone(),
                name: u.name.clone(),
                email: u.email.clone(),
                password_hash: u.password_hash.clone(),
                role: u.role,
            })
            .collect();

        for rs in self.room_states() {
            let guard = rs.read().await;
            events.push(Event::RoomCreated {
                room: guard.room.clone(),
            });
            events.extend(guard.reservations.iter().map(|r| Event::ReservationCreated {
                reservation: r.clone(),
            }));
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| StorageError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StorageError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StorageError::Wal(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
