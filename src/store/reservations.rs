use async_trait::async_trait;
use ulid::Ulid;

use crate::error::StorageError;
use crate::model::*;

use super::{ReservationStore, Store, apply_to_room};

fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait]
impl ReservationStore for Store {
    async fn list_active_reservations_for_room(
        &self,
        room_id: Ulid,
        excluding: Option<Ulid>,
    ) -> Result<Vec<Reservation>, StorageError> {
        let rs = self
            .get_room_state(&room_id)
            .ok_or(StorageError::UnknownRoom(room_id))?;
        let guard = rs.read().await;
        Ok(guard
            .active()
            .filter(|r| Some(r.id) != excluding)
            .cloned()
            .collect())
    }

    async fn insert_reservation(&self, new: NewReservation) -> Result<Reservation, StorageError> {
        let _commit = self.commit_guard().await;
        let rs = self
            .get_room_state(&new.room_id)
            .ok_or(StorageError::UnknownRoom(new.room_id))?;
        let mut guard = rs.write().await;

        let reservation = Reservation {
            id: Ulid::new(),
            room_id: new.room_id,
            user_id: new.user_id,
            span: new.span,
            reason: new.reason,
            status: new.status,
            created_at: now_ms(),
        };
        let event = Event::ReservationCreated {
            reservation: reservation.clone(),
        };
        self.wal_append(&event).await?;
        apply_to_room(&mut guard, &event, &self.reservation_room);
        Ok(reservation)
    }

    async fn update_reservation_status(
        &self,
        id: Ulid,
        status: ReservationStatus,
    ) -> Result<Option<Reservation>, StorageError> {
        let _commit = self.commit_guard().await;
        let Some(room_id) = self.reservation_room.get(&id).map(|e| *e.value()) else {
            return Ok(None);
        };
        let Some(rs) = self.get_room_state(&room_id) else {
            return Ok(None);
        };
        let mut guard = rs.write().await;
        if guard.reservation(&id).is_none() {
            return Ok(None);
        }

        let event = Event::ReservationStatusChanged {
            id,
            room_id,
            status,
        };
        self.wal_append(&event).await?;
        apply_to_room(&mut guard, &event, &self.reservation_room);
        Ok(guard.reservation(&id).cloned())
    }

    async fn get_reservation(&self, id: Ulid) -> Result<Option<Reservation>, StorageError> {
        let Some(room_id) = self.reservation_room.get(&id).map(|e| *e.value()) else {
            return Ok(None);
        };
        let Some(rs) = self.get_room_state(&room_id) else {
            return Ok(None);
        };
        let guard = rs.read().await;
        Ok(guard.reservation(&id).cloned())
    }
}

impl Store {
    /// Every reservation matching `filter`, in no particular order.
    async fn collect_reservations(&self, filter: impl Fn(&Reservation) -> bool) -> Vec<Reservation> {
        let mut out = Vec::new();
        for rs in self.room_states() {
            let guard = rs.read().await;
            out.extend(guard.reservations.iter().filter(|r| filter(r)).cloned());
        }
        out
    }

    pub async fn reservations_for_user(&self, user_id: Ulid) -> Vec<Reservation> {
        self.collect_reservations(|r| r.user_id == user_id).await
    }

    pub async fn all_reservations(&self) -> Vec<Reservation> {
        self.collect_reservations(|_| true).await
    }

    #[cfg(test)]
    pub(crate) async fn reservation_count(&self, room_id: Ulid) -> Option<usize> {
        let rs = self.get_room_state(&room_id)?;
        let guard = rs.read().await;
        Some(guard.reservations.len())
    }
}
