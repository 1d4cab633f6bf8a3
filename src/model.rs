use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// A requested or booked period `[start, end]`.
///
/// Whether the end instant is part of the period is decided by the
/// [`BoundaryPolicy`] used when comparing two spans, not by the span itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Builds a span from untrusted input.
    pub fn checked(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Strict overlap: spans that only touch at a boundary do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Overlap where a shared boundary instant counts as a collision.
    pub fn touches_or_overlaps(&self, other: &Span) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// How two reservations sharing an exact boundary instant are classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryPolicy {
    /// Back-to-back bookings conflict (`a <= d && c <= b`).
    #[default]
    Inclusive,
    /// Back-to-back bookings are allowed (`a < d && c < b`).
    HalfOpen,
}

impl BoundaryPolicy {
    pub fn collides(self, a: &Span, b: &Span) -> bool {
        match self {
            BoundaryPolicy::Inclusive => a.touches_or_overlaps(b),
            BoundaryPolicy::HalfOpen => a.overlaps(b),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inclusive" => Some(BoundaryPolicy::Inclusive),
            "half_open" | "half-open" | "halfopen" => Some(BoundaryPolicy::HalfOpen),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    #[default]
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomStatus {
    #[default]
    Available,
    Maintenance,
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    #[default]
    Pending,
    Confirmed,
    Cancelled,
}

impl ReservationStatus {
    /// Active reservations take part in conflict detection.
    pub fn is_active(self) -> bool {
        !matches!(self, ReservationStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: Ulid,
    pub name: String,
    pub capacity: u32,
    pub resources: Vec<String>,
    pub description: Option<String>,
    pub status: RoomStatus,
}

/// Partial room update. `None` keeps the stored value; an empty
/// `description` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RoomPatch {
    pub name: Option<String>,
    pub capacity: Option<u32>,
    pub resources: Option<Vec<String>>,
    pub description: Option<String>,
    pub status: Option<RoomStatus>,
}

impl RoomPatch {
    pub fn apply_to(self, room: &Room) -> Room {
        Room {
            id: room.id,
            name: self.name.unwrap_or_else(|| room.name.clone()),
            capacity: self.capacity.unwrap_or(room.capacity),
            resources: self.resources.unwrap_or_else(|| room.resources.clone()),
            description: match self.description {
                Some(d) if d.is_empty() => None,
                Some(d) => Some(d),
                None => room.description.clone(),
            },
            status: self.status.unwrap_or(room.status),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub room_id: Ulid,
    pub user_id: Ulid,
    pub span: Span,
    pub reason: Option<String>,
    pub status: ReservationStatus,
    pub created_at: Ms,
}

impl Reservation {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

/// Insert payload for the reservation store. The store assigns id and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReservation {
    pub room_id: Ulid,
    pub user_id: Ulid,
    pub span: Span,
    pub reason: Option<String>,
    pub status: ReservationStatus,
}

/// Stored account. `password_hash` is a PHC string, never a plaintext password.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub matricula: String,
    pub name: String,
    pub email: String,
    pub password_hash: String,
    pub role: Role,
}

/// Identity on whose behalf an operation runs. Always passed explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActingUser {
    pub id: Ulid,
    pub role: Role,
}

impl ActingUser {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// A room with all of its reservations (active and cancelled), sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub room: Room,
    pub reservations: Vec<Reservation>,
}

impl RoomState {
    pub fn new(room: Room) -> Self {
        Self {
            room,
            reservations: Vec::new(),
        }
    }

    /// Insert reservation maintaining sort order by span.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&reservation.span.start, |r| r.span.start)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    pub fn reservation(&self, id: &Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == *id)
    }

    pub fn reservation_mut(&mut self, id: &Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == *id)
    }

    pub fn active(&self) -> impl Iterator<Item = &Reservation> {
        self.reservations.iter().filter(|r| r.is_active())
    }
}

/// The WAL record format: flat, one variant per mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserRegistered {
        id: Ulid,
        matricula: String,
        name: String,
        email: String,
        password_hash: String,
        role: Role,
    },
    PasswordChanged {
        id: Ulid,
        password_hash: String,
    },
    RoomCreated {
        room: Room,
    },
    RoomUpdated {
        room: Room,
    },
    RoomDeleted {
        id: Ulid,
    },
    ReservationCreated {
        reservation: Reservation,
    },
    ReservationStatusChanged {
        id: Ulid,
        room_id: Ulid,
        status: ReservationStatus,
    },
}
