use tracing::{debug, info};
use ulid::Ulid;

use crate::error::{Error, Result};
use crate::limits::MAX_RESERVATIONS_PER_ROOM;
use crate::model::*;
use crate::observability;
use crate::store::ReservationStore;

use super::availability::find_collision;
use super::{Engine, RoomGate, validate_reason, validate_span};

impl<S: ReservationStore> Engine<S> {
    /// Book `span` on `room_id` for `user_id`.
    ///
    /// All-or-nothing: on overlap nothing is written and the caller gets
    /// [`Error::Overlap`] naming the reservation in the way.
    pub async fn create(
        &self,
        room_id: Ulid,
        user_id: Ulid,
        span: Span,
        reason: Option<String>,
    ) -> Result<Reservation> {
        let gate = self.gate(room_id).await;
        self.create_gated(&gate, room_id, user_id, span, reason).await
    }

    /// [`Engine::create`] for a caller already holding `room_id`'s gate,
    /// so it can check its own preconditions under the same gate.
    pub async fn create_gated(
        &self,
        _gate: &RoomGate,
        room_id: Ulid,
        user_id: Ulid,
        span: Span,
        reason: Option<String>,
    ) -> Result<Reservation> {
        validate_span(&span)?;
        validate_reason(reason.as_deref())?;

        let existing = self
            .store
            .list_active_reservations_for_room(room_id, None)
            .await?;
        if existing.len() >= MAX_RESERVATIONS_PER_ROOM {
            return Err(Error::validation("too many reservations on room"));
        }
        if let Some(blocker) = find_collision(&existing, &span, self.config.policy) {
            metrics::counter!(observability::RESERVATION_CONFLICTS_TOTAL).increment(1);
            debug!(%room_id, blocker = %blocker.id, "reservation rejected: period taken");
            return Err(Error::Overlap {
                room_id,
                existing: blocker.id,
            });
        }

        let status = self.initial_status();
        let reservation = self
            .store
            .insert_reservation(NewReservation {
                room_id,
                user_id,
                span,
                reason,
                status,
            })
            .await?;

        metrics::counter!(observability::RESERVATIONS_CREATED_TOTAL, "status" => status.as_str())
            .increment(1);
        info!(id = %reservation.id, %room_id, %user_id, status = status.as_str(), "reservation created");
        Ok(reservation)
    }

    /// Cancel a reservation on behalf of its owner or an administrator.
    ///
    /// Cancelling an already-cancelled reservation succeeds without writing.
    pub async fn cancel(&self, id: Ulid, acting: &ActingUser) -> Result<Reservation> {
        let found = self.load(id).await?;
        if !acting.is_admin() && acting.id != found.user_id {
            return Err(Error::Forbidden(
                "only the owner or an administrator can cancel this reservation".into(),
            ));
        }

        let _gate = self.gate(found.room_id).await;
        let reservation = self.load(id).await?;
        if reservation.status == ReservationStatus::Cancelled {
            return Ok(reservation);
        }

        let cancelled = self
            .store
            .update_reservation_status(id, ReservationStatus::Cancelled)
            .await?
            .ok_or_else(|| Error::not_found("reservation", id))?;
        metrics::counter!(observability::RESERVATIONS_CANCELLED_TOTAL).increment(1);
        info!(%id, by = %acting.id, "reservation cancelled");
        Ok(cancelled)
    }

    /// Approve a pending reservation. Administrators only.
    pub async fn confirm(&self, id: Ulid, acting: &ActingUser) -> Result<Reservation> {
        if !acting.is_admin() {
            return Err(Error::Forbidden(
                "only an administrator can confirm reservations".into(),
            ));
        }
        let found = self.load(id).await?;

        // Status transitions on one room are serialized with its bookings,
        // so the status read below cannot go stale before the write.
        let _gate = self.gate(found.room_id).await;
        let current = self.load(id).await?;
        if current.status != ReservationStatus::Pending {
            return Err(Error::validation(format!(
                "only pending reservations can be confirmed (status is {})",
                current.status.as_str()
            )));
        }

        let confirmed = self
            .store
            .update_reservation_status(id, ReservationStatus::Confirmed)
            .await?
            .ok_or_else(|| Error::not_found("reservation", id))?;
        info!(%id, by = %acting.id, "reservation confirmed");
        Ok(confirmed)
    }

    async fn load(&self, id: Ulid) -> Result<Reservation> {
        self.store
            .get_reservation(id)
            .await?
            .ok_or_else(|| Error::not_found("reservation", id))
    }
}
