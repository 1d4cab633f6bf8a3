mod availability;
mod mutations;
#[cfg(test)]
mod tests;

pub use availability::{find_collision, is_free};
pub(crate) use availability::{validate_reason, validate_span};

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use ulid::Ulid;

use crate::error::Result;
use crate::model::*;
use crate::store::ReservationStore;

/// Held booking gate of one room.
pub type RoomGate = OwnedMutexGuard<()>;

/// Engine settings that change booking outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineConfig {
    pub policy: BoundaryPolicy,
    /// New reservations start `pending` and wait for an administrator.
    pub require_approval: bool,
}

/// Availability checker and reservation state machine.
///
/// Check-then-insert runs under a per-room booking gate, so two requests
/// for the same room are decided one after the other. Requests for
/// different rooms never wait on each other.
pub struct Engine<S: ReservationStore> {
    store: Arc<S>,
    gates: DashMap<Ulid, Arc<Mutex<()>>>,
    config: EngineConfig,
}

impl<S: ReservationStore> Engine<S> {
    pub fn new(store: Arc<S>, config: EngineConfig) -> Self {
        Self {
            store,
            gates: DashMap::new(),
            config,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Status assigned to freshly created reservations.
    pub fn initial_status(&self) -> ReservationStatus {
        if self.config.require_approval {
            ReservationStatus::Pending
        } else {
            ReservationStatus::Confirmed
        }
    }

    /// Acquire the booking gate for `room_id`.
    ///
    /// Anything that must not interleave with a booking on this room
    /// (room updates and deletion, for instance) holds the returned guard.
    pub async fn gate(&self, room_id: Ulid) -> RoomGate {
        // Clone the Arc out so the map shard is released before awaiting.
        let gate = self.gates.entry(room_id).or_default().value().clone();
        gate.lock_owned().await
    }

    /// Forget the gate of a room that no longer exists.
    pub fn forget_room(&self, room_id: &Ulid) {
        self.gates.remove(room_id);
    }

    /// `true` when no active reservation on `room_id` collides with `span`.
    ///
    /// `excluding` leaves one reservation out of the comparison, for
    /// re-checking an existing booking against everything else.
    pub async fn is_available(
        &self,
        room_id: Ulid,
        span: Span,
        excluding: Option<Ulid>,
    ) -> Result<bool> {
        validate_span(&span)?;
        let existing = self
            .store
            .list_active_reservations_for_room(room_id, excluding)
            .await?;
        Ok(is_free(&existing, &span, self.config.policy))
    }
}
