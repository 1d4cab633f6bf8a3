//! JSON-lines request/response protocol.
//!
//! One request object per line, carrying an `op` tag, the operation's fields
//! and, for authenticated operations, a session `token`. Every request gets
//! exactly one response line:
//!
//! ```text
//! {"ok":true,"status":200,"data":...}
//! {"ok":false,"status":409,"error":{"kind":"conflict","message":"..."}}
//! ```

use std::collections::HashMap;
use std::time::Instant;

use chrono::{DateTime, NaiveDateTime, SecondsFormat};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

use crate::error::{Error, ErrorKind, Result};
use crate::model::*;
use crate::observability;
use crate::service::{Registration, RoomInput, Service};

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Register(Registration),
    Login {
        matricula: String,
        password: String,
    },
    RequestPasswordReset {
        matricula: String,
        email: String,
    },
    ResetPassword {
        reset_token: String,
        password: String,
    },
    Me,
    ListRooms,
    GetRoom {
        id: Ulid,
    },
    CreateRoom(RoomInput),
    /// Fields left out keep their stored values.
    UpdateRoom {
        id: Ulid,
        name: Option<String>,
        capacity: Option<u32>,
        resources: Option<Vec<String>>,
        description: Option<String>,
        status: Option<RoomStatus>,
    },
    DeleteRoom {
        id: Ulid,
    },
    CheckAvailability {
        room_id: Ulid,
        start: String,
        end: String,
        #[serde(default)]
        excluding: Option<Ulid>,
    },
    CreateReservation {
        room_id: Ulid,
        start: String,
        end: String,
        #[serde(default)]
        reason: Option<String>,
    },
    CancelReservation {
        id: Ulid,
    },
    ConfirmReservation {
        id: Ulid,
    },
    GetReservation {
        id: Ulid,
    },
    MyReservations,
    AllReservations,
}

impl Request {
    /// Short label for metrics and logs.
    pub fn op(&self) -> &'static str {
        match self {
            Request::Register(_) => "register",
            Request::Login { .. } => "login",
            Request::RequestPasswordReset { .. } => "request_password_reset",
            Request::ResetPassword { .. } => "reset_password",
            Request::Me => "me",
            Request::ListRooms => "list_rooms",
            Request::GetRoom { .. } => "get_room",
            Request::CreateRoom(_) => "create_room",
            Request::UpdateRoom { .. } => "update_room",
            Request::DeleteRoom { .. } => "delete_room",
            Request::CheckAvailability { .. } => "check_availability",
            Request::CreateReservation { .. } => "create_reservation",
            Request::CancelReservation { .. } => "cancel_reservation",
            Request::ConfirmReservation { .. } => "confirm_reservation",
            Request::GetReservation { .. } => "get_reservation",
            Request::MyReservations => "my_reservations",
            Request::AllReservations => "all_reservations",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn success(data: Value) -> Self {
        Self {
            ok: true,
            status: 200,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(err: &Error) -> Self {
        Self {
            ok: false,
            status: status_for(err.kind()),
            data: None,
            error: Some(ErrorBody {
                kind: err.kind().as_str().to_string(),
                message: err.to_string(),
            }),
        }
    }

    /// Serialized form, without the trailing newline.
    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                r#"{{"ok":false,"status":500,"error":{{"kind":"internal","message":"response encoding failed: {e}"}}}}"#
            )
        })
    }
}

pub fn status_for(kind: ErrorKind) -> u16 {
    match kind {
        ErrorKind::Validation => 400,
        ErrorKind::Unauthorized => 401,
        ErrorKind::Forbidden => 403,
        ErrorKind::NotFound => 404,
        ErrorKind::Conflict => 409,
        ErrorKind::Storage | ErrorKind::Internal => 500,
    }
}

// ── Views ────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct UserView {
    pub id: Ulid,
    pub matricula: String,
    pub name: String,
    pub email: String,
    pub role: Role,
}

impl From<&User> for UserView {
    fn from(u: &User) -> Self {
        Self {
            id: u.id,
            matricula: u.matricula.clone(),
            name: u.name.clone(),
            email: u.email.clone(),
            role: u.role,
        }
    }
}

/// A reservation with the room and requester names resolved.
#[derive(Debug, Serialize)]
pub struct ReservationView {
    pub id: Ulid,
    pub room_id: Ulid,
    pub room_name: Option<String>,
    pub user_id: Ulid,
    pub user_name: Option<String>,
    pub start: String,
    pub end: String,
    pub reason: Option<String>,
    pub status: ReservationStatus,
    pub created_at: String,
}

impl ReservationView {
    pub fn new(r: &Reservation, room_name: Option<String>, user_name: Option<String>) -> Self {
        Self {
            id: r.id,
            room_id: r.room_id,
            room_name,
            user_id: r.user_id,
            user_name,
            start: format_instant(r.span.start),
            end: format_instant(r.span.end),
            reason: r.reason.clone(),
            status: r.status,
            created_at: format_instant(r.created_at),
        }
    }
}

/// Build views, looking each room and user up once.
async fn reservation_views(service: &Service, reservations: &[Reservation]) -> Vec<ReservationView> {
    let mut room_names: HashMap<Ulid, Option<String>> = HashMap::new();
    let mut user_names: HashMap<Ulid, Option<String>> = HashMap::new();
    let mut views = Vec::with_capacity(reservations.len());
    for r in reservations {
        if !room_names.contains_key(&r.room_id) {
            let name = service.get_room(r.room_id).await.ok().map(|room| room.name);
            room_names.insert(r.room_id, name);
        }
        let user_name = user_names
            .entry(r.user_id)
            .or_insert_with(|| service.user(&r.user_id).ok().map(|u| u.name))
            .clone();
        views.push(ReservationView::new(r, room_names[&r.room_id].clone(), user_name));
    }
    views
}

#[derive(Debug, Serialize)]
struct SessionView {
    token: String,
    user: UserView,
}

#[derive(Debug, Serialize)]
struct AvailabilityView {
    room_id: Ulid,
    start: String,
    end: String,
    available: bool,
}

// ── Instants ─────────────────────────────────────────────

/// RFC 3339, or a naive `YYYY-MM-DDTHH:MM[:SS]` taken as UTC.
pub fn parse_instant(s: &str) -> Result<Ms> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp_millis());
    }
    ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc().timestamp_millis())
        .ok_or_else(|| Error::validation(format!("invalid instant {s:?}")))
}

pub fn format_instant(ms: Ms) -> String {
    DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(|| ms.to_string())
}

fn parse_span(start: &str, end: &str) -> Result<Span> {
    Span::checked(parse_instant(start)?, parse_instant(end)?)
        .ok_or_else(|| Error::validation("start must be before end"))
}

// ── Dispatch ─────────────────────────────────────────────

/// Split a request line into its session token and typed request.
pub fn parse_request(line: &str) -> Result<(Option<String>, Request)> {
    let mut value: Value = serde_json::from_str(line)
        .map_err(|e| Error::validation(format!("malformed request: {e}")))?;
    let token = match value.as_object_mut() {
        Some(obj) => match obj.remove("token") {
            Some(Value::String(t)) => Some(t),
            Some(Value::Null) | None => None,
            Some(_) => return Err(Error::validation("token must be a string")),
        },
        None => return Err(Error::validation("request must be a JSON object")),
    };
    let request = serde_json::from_value(value)
        .map_err(|e| Error::validation(format!("malformed request: {e}")))?;
    Ok((token, request))
}

/// Handle one request line end to end. Never fails: errors become responses.
pub async fn handle_line(service: &Service, line: &str) -> Response {
    let started = Instant::now();
    let (op, result) = match parse_request(line) {
        Ok((token, request)) => {
            let op = request.op();
            (op, execute(service, token.as_deref(), request).await)
        }
        Err(e) => ("invalid", Err(e)),
    };

    let response = match result {
        Ok(data) => Response::success(data),
        Err(e) => {
            match e.kind() {
                ErrorKind::Storage | ErrorKind::Internal => tracing::error!(op, "request failed: {e}"),
                _ => tracing::debug!(op, "request rejected: {e}"),
            }
            Response::failure(&e)
        }
    };
    metrics::counter!(observability::REQUESTS_TOTAL, "op" => op, "status" => response.status.to_string())
        .increment(1);
    metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());
    response
}

fn acting(service: &Service, token: Option<&str>) -> Result<ActingUser> {
    let token = token.ok_or_else(|| Error::Unauthorized("missing session token".into()))?;
    service.authenticate(token)
}

fn to_json(value: impl Serialize) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| Error::Internal(e.to_string()))
}

async fn reservations_json(service: &Service, reservations: &[Reservation]) -> Result<Value> {
    to_json(reservation_views(service, reservations).await)
}

async fn reservation_json(service: &Service, reservation: Reservation) -> Result<Value> {
    let mut views = reservation_views(service, std::slice::from_ref(&reservation)).await;
    to_json(views.pop())
}

async fn execute(service: &Service, token: Option<&str>, request: Request) -> Result<Value> {
    match request {
        Request::Register(reg) => {
            let user = service.register(reg).await?;
            to_json(UserView::from(&user))
        }
        Request::Login { matricula, password } => {
            let session = service.login(&matricula, &password).await?;
            to_json(SessionView {
                user: UserView::from(&session.user),
                token: session.token,
            })
        }
        Request::RequestPasswordReset { matricula, email } => {
            service.request_password_reset(&matricula, &email).await?;
            to_json(serde_json::json!({ "sent": true }))
        }
        Request::ResetPassword {
            reset_token,
            password,
        } => {
            service.reset_password(&reset_token, &password).await?;
            to_json(serde_json::json!({ "reset": true }))
        }
        Request::Me => {
            let acting = acting(service, token)?;
            to_json(UserView::from(&service.user(&acting.id)?))
        }
        Request::ListRooms => to_json(service.list_rooms().await),
        Request::GetRoom { id } => to_json(service.get_room(id).await?),
        Request::CreateRoom(input) => {
            let acting = acting(service, token)?;
            to_json(service.create_room(&acting, input).await?)
        }
        Request::UpdateRoom {
            id,
            name,
            capacity,
            resources,
            description,
            status,
        } => {
            let acting = acting(service, token)?;
            let patch = RoomPatch {
                name,
                capacity,
                resources,
                description,
                status,
            };
            to_json(service.update_room(&acting, id, patch).await?)
        }
        Request::DeleteRoom { id } => {
            let acting = acting(service, token)?;
            to_json(service.delete_room(&acting, id).await?)
        }
        Request::CheckAvailability {
            room_id,
            start,
            end,
            excluding,
        } => {
            let span = parse_span(&start, &end)?;
            let available = service.check_availability(room_id, span, excluding).await?;
            to_json(AvailabilityView {
                room_id,
                start: format_instant(span.start),
                end: format_instant(span.end),
                available,
            })
        }
        Request::CreateReservation {
            room_id,
            start,
            end,
            reason,
        } => {
            let acting = acting(service, token)?;
            let span = parse_span(&start, &end)?;
            let r = service.create_reservation(&acting, room_id, span, reason).await?;
            reservation_json(service, r).await
        }
        Request::CancelReservation { id } => {
            let acting = acting(service, token)?;
            let r = service.cancel_reservation(&acting, id).await?;
            reservation_json(service, r).await
        }
        Request::ConfirmReservation { id } => {
            let acting = acting(service, token)?;
            let r = service.confirm_reservation(&acting, id).await?;
            reservation_json(service, r).await
        }
        Request::GetReservation { id } => {
            let acting = acting(service, token)?;
            let r = service.get_reservation(&acting, id).await?;
            reservation_json(service, r).await
        }
        Request::MyReservations => {
            let acting = acting(service, token)?;
            reservations_json(service, &service.my_reservations(&acting).await).await
        }
        Request::AllReservations => {
            let acting = acting(service, token)?;
            reservations_json(service, &service.all_reservations(&acting).await?).await
        }
    }
}
