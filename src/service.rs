use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn};
use ulid::Ulid;

use crate::auth::{self, Purpose, TokenKeys};
use crate::config::{AdminBootstrap, Config};
use crate::engine::{Engine, EngineConfig};
use crate::error::{Error, Result};
use crate::limits::*;
use crate::mailer::{Mailer, OutgoingMail};
use crate::model::*;
use crate::observability;
use crate::store::{ReservationStore, Store};

#[derive(Debug, Clone, Deserialize)]
pub struct Registration {
    pub matricula: String,
    pub name: String,
    pub email: String,
    pub password: String,
}

/// Room fields accepted from administrators on create and update.
#[derive(Debug, Clone, Deserialize)]
pub struct RoomInput {
    pub name: String,
    pub capacity: u32,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: RoomStatus,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub user: User,
}

/// Accounts, room catalog and reservations, with authorization.
///
/// Every operation that acts on behalf of someone takes the [`ActingUser`]
/// explicitly; nothing here reads ambient session state.
pub struct Service {
    store: Arc<Store>,
    engine: Engine<Store>,
    tokens: TokenKeys,
    mailer: Arc<dyn Mailer>,
    base_url: String,
}

impl Service {
    pub fn new(
        store: Arc<Store>,
        engine_config: EngineConfig,
        tokens: TokenKeys,
        mailer: Arc<dyn Mailer>,
        base_url: String,
    ) -> Self {
        Self {
            engine: Engine::new(store.clone(), engine_config),
            store,
            tokens,
            mailer,
            base_url,
        }
    }

    pub fn from_config(store: Arc<Store>, config: &Config, mailer: Arc<dyn Mailer>) -> Self {
        let tokens = TokenKeys::new(
            config.jwt_secret.as_bytes(),
            config.session_ttl_secs,
            config.reset_ttl_secs,
        );
        let engine_config = EngineConfig {
            policy: config.boundary,
            require_approval: config.require_approval,
        };
        Self::new(store, engine_config, tokens, mailer, config.base_url.clone())
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    // ── Accounts ─────────────────────────────────────────

    pub async fn register(&self, reg: Registration) -> Result<User> {
        self.create_account(reg, Role::User).await
    }

    async fn create_account(&self, reg: Registration, role: Role) -> Result<User> {
        let matricula = required("matricula", &reg.matricula, MAX_MATRICULA_LEN)?;
        let name = required("name", &reg.name, MAX_NAME_LEN)?;
        let email = required("email", &reg.email, MAX_EMAIL_LEN)?;
        if !is_valid_email(&email) {
            return Err(Error::validation("email is not a valid address"));
        }
        auth::password::check_password_strength(&reg.password).map_err(Error::Validation)?;
        if self.store.user_by_matricula(&matricula).is_some()
            || self.store.user_by_email(&email).is_some()
        {
            return Err(Error::Conflict("matricula or email already registered".into()));
        }

        let password_hash = hash_blocking(reg.password).await?;
        let user = self
            .store
            .insert_user(User {
                id: Ulid::new(),
                matricula,
                name,
                email,
                password_hash,
                role,
            })
            .await?;
        info!(id = %user.id, matricula = %user.matricula, ?role, "account registered");
        Ok(user)
    }

    /// Unknown matricula and wrong password are indistinguishable to the caller.
    pub async fn login(&self, matricula: &str, password: &str) -> Result<Session> {
        let rejected = || {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL, "reason" => "login").increment(1);
            Error::Unauthorized("invalid matricula or password".into())
        };
        let Some(user) = self.store.user_by_matricula(matricula.trim()) else {
            return Err(rejected());
        };
        if !verify_blocking(password.to_string(), user.password_hash.clone()).await? {
            return Err(rejected());
        }

        let token = self.tokens.issue_session(&user).map_err(internal)?;
        info!(id = %user.id, "login");
        Ok(Session { token, user })
    }

    /// Resolve a session token to the acting user.
    ///
    /// The role comes from the stored account, not from the token, so a
    /// demoted or deleted account loses its rights immediately.
    pub fn authenticate(&self, token: &str) -> Result<ActingUser> {
        let claims = self.tokens.verify(token, Purpose::Session).map_err(|e| {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL, "reason" => "token").increment(1);
            Error::Unauthorized(format!("invalid session: {e}"))
        })?;
        let user = self
            .store
            .user(&claims.sub)
            .ok_or_else(|| Error::Unauthorized("account no longer exists".into()))?;
        Ok(ActingUser {
            id: user.id,
            role: user.role,
        })
    }

    pub fn user(&self, id: &Ulid) -> Result<User> {
        self.store.user(id).ok_or_else(|| Error::not_found("user", id))
    }

    /// Mail a single-use reset link. Matricula and email must belong to the same account.
    pub async fn request_password_reset(&self, matricula: &str, email: &str) -> Result<()> {
        let user = self
            .store
            .user_by_matricula(matricula.trim())
            .filter(|u| u.email.trim().eq_ignore_ascii_case(email.trim()))
            .ok_or_else(|| Error::not_found("user", matricula.trim()))?;

        let token = self.tokens.issue_reset(&user).map_err(internal)?;
        let link = format!("{}/reset-password?token={token}", self.base_url);
        self.mailer
            .send(OutgoingMail {
                to: user.email.clone(),
                subject: "Password reset".into(),
                body: format!(
                    "Hello {},\n\nA password reset was requested for your account. \
                     Open the link below to choose a new password:\n\n{link}\n\n\
                     The link expires in {} minutes. If you did not ask for this, ignore this message.\n",
                    user.name,
                    self.tokens.reset_ttl_secs() / 60,
                ),
            })
            .await
            .map_err(internal)?;
        info!(id = %user.id, "password reset requested");
        Ok(())
    }

    pub async fn reset_password(&self, token: &str, new_password: &str) -> Result<()> {
        let claims = self
            .tokens
            .verify(token, Purpose::Reset)
            .map_err(|e| Error::Unauthorized(format!("invalid reset link: {e}")))?;
        let user = self
            .store
            .user(&claims.sub)
            .ok_or_else(|| Error::Unauthorized("account no longer exists".into()))?;
        if claims.pwh != Some(auth::password_fingerprint(&user.password_hash)) {
            return Err(Error::Unauthorized("reset link already used".into()));
        }
        auth::password::check_password_strength(new_password).map_err(Error::Validation)?;

        let hash = hash_blocking(new_password.to_string()).await?;
        self.store.set_password_hash(user.id, hash).await?;
        info!(id = %user.id, "password reset");
        Ok(())
    }

    /// Create the configured administrator unless the matricula is taken.
    /// Returns whether an account was created.
    pub async fn bootstrap_admin(&self, admin: &AdminBootstrap) -> Result<bool> {
        if let Some(existing) = self.store.user_by_matricula(admin.matricula.trim()) {
            if existing.role != Role::Admin {
                warn!(matricula = %existing.matricula, "bootstrap admin matricula belongs to a regular user");
            }
            return Ok(false);
        }
        self.create_account(
            Registration {
                matricula: admin.matricula.clone(),
                name: admin.name.clone(),
                email: admin.email.clone(),
                password: admin.password.clone(),
            },
            Role::Admin,
        )
        .await?;
        Ok(true)
    }

    // ── Rooms ────────────────────────────────────────────

    pub async fn list_rooms(&self) -> Vec<Room> {
        self.store.list_rooms().await
    }

    pub async fn get_room(&self, id: Ulid) -> Result<Room> {
        self.store
            .room(id)
            .await
            .ok_or_else(|| Error::not_found("room", id))
    }

    pub async fn create_room(&self, acting: &ActingUser, input: RoomInput) -> Result<Room> {
        require_admin(acting, "manage rooms")?;
        let room = room_from_input(Ulid::new(), input)?;
        let room = self.store.insert_room(room).await?;
        info!(id = %room.id, name = %room.name, "room created");
        Ok(room)
    }

    /// Change the fields present in `patch`; the rest stay as stored.
    /// Holds the booking gate so a status change cannot interleave with a booking.
    pub async fn update_room(&self, acting: &ActingUser, id: Ulid, patch: RoomPatch) -> Result<Room> {
        require_admin(acting, "manage rooms")?;
        let patch = clean_patch(patch)?;
        self.get_room(id).await?;
        let _gate = self.engine.gate(id).await;
        let room = self.store.update_room(id, patch).await?;
        info!(%id, status = ?room.status, "room updated");
        Ok(room)
    }

    /// Refused while the room has active reservations.
    pub async fn delete_room(&self, acting: &ActingUser, id: Ulid) -> Result<Room> {
        require_admin(acting, "manage rooms")?;
        let _gate = self.engine.gate(id).await;
        let room = self.store.delete_room(id).await?;
        self.engine.forget_room(&id);
        info!(%id, name = %room.name, "room deleted");
        Ok(room)
    }

    // ── Reservations ─────────────────────────────────────

    pub async fn check_availability(
        &self,
        room_id: Ulid,
        span: Span,
        excluding: Option<Ulid>,
    ) -> Result<bool> {
        self.engine.is_available(room_id, span, excluding).await
    }

    /// Book on behalf of `acting`. Rooms in maintenance or marked unavailable
    /// take no new reservations; the status is read under the booking gate.
    pub async fn create_reservation(
        &self,
        acting: &ActingUser,
        room_id: Ulid,
        span: Span,
        reason: Option<String>,
    ) -> Result<Reservation> {
        self.get_room(room_id).await?;
        let reason = reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());

        let gate = self.engine.gate(room_id).await;
        let room = self.get_room(room_id).await?;
        if room.status != RoomStatus::Available {
            return Err(Error::validation(format!(
                "room {:?} is not open for reservations",
                room.name
            )));
        }
        self.engine
            .create_gated(&gate, room_id, acting.id, span, reason)
            .await
    }

    pub async fn cancel_reservation(&self, acting: &ActingUser, id: Ulid) -> Result<Reservation> {
        self.engine.cancel(id, acting).await
    }

    pub async fn confirm_reservation(&self, acting: &ActingUser, id: Ulid) -> Result<Reservation> {
        self.engine.confirm(id, acting).await
    }

    pub async fn get_reservation(&self, acting: &ActingUser, id: Ulid) -> Result<Reservation> {
        let reservation = self
            .store
            .get_reservation(id)
            .await?
            .ok_or_else(|| Error::not_found("reservation", id))?;
        if !acting.is_admin() && reservation.user_id != acting.id {
            return Err(Error::Forbidden("not your reservation".into()));
        }
        Ok(reservation)
    }

    /// The caller's reservations, latest start first.
    pub async fn my_reservations(&self, acting: &ActingUser) -> Vec<Reservation> {
        newest_first(self.store.reservations_for_user(acting.id).await)
    }

    pub async fn all_reservations(&self, acting: &ActingUser) -> Result<Vec<Reservation>> {
        require_admin(acting, "list every reservation")?;
        Ok(newest_first(self.store.all_reservations().await))
    }
}

fn newest_first(mut reservations: Vec<Reservation>) -> Vec<Reservation> {
    reservations.sort_by(|a, b| b.span.start.cmp(&a.span.start).then(b.id.cmp(&a.id)));
    reservations
}

fn require_admin(acting: &ActingUser, what: &str) -> Result<()> {
    if acting.is_admin() {
        Ok(())
    } else {
        Err(Error::Forbidden(format!("only administrators can {what}")))
    }
}

fn internal(e: impl std::fmt::Display) -> Error {
    Error::Internal(e.to_string())
}

/// Trimmed, non-empty, bounded.
fn required(field: &str, value: &str, max_len: usize) -> Result<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(Error::validation(format!("{field} is required")));
    }
    if value.len() > max_len {
        return Err(Error::validation(format!("{field} too long")));
    }
    Ok(value.to_string())
}

/// `local@domain.tld`, no whitespace.
fn is_valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && !email.chars().any(char::is_whitespace)
        && domain
            .split_once('.')
            .is_some_and(|(host, _)| !host.is_empty())
        && !domain.ends_with('.')
        && !domain.contains("..")
}

fn clean_resources(resources: Vec<String>) -> Result<Vec<String>> {
    let resources: Vec<String> = resources
        .iter()
        .map(|r| r.trim())
        .filter(|r| !r.is_empty())
        .map(str::to_string)
        .collect();
    if resources.len() > MAX_RESOURCES_PER_ROOM {
        return Err(Error::validation("too many resources"));
    }
    if resources.iter().any(|r| r.len() > MAX_RESOURCE_LEN) {
        return Err(Error::validation("resource name too long"));
    }
    Ok(resources)
}

/// Trimmed; an empty description comes back as `""`.
fn clean_description(description: String) -> Result<String> {
    let description = description.trim().to_string();
    if description.len() > MAX_DESCRIPTION_LEN {
        return Err(Error::validation("description too long"));
    }
    Ok(description)
}

fn clean_capacity(capacity: u32) -> Result<u32> {
    if capacity == 0 {
        return Err(Error::validation("capacity must be positive"));
    }
    Ok(capacity)
}

fn room_from_input(id: Ulid, input: RoomInput) -> Result<Room> {
    Ok(Room {
        id,
        name: required("name", &input.name, MAX_NAME_LEN)?,
        capacity: clean_capacity(input.capacity)?,
        resources: clean_resources(input.resources)?,
        description: input
            .description
            .map(clean_description)
            .transpose()?
            .filter(|d| !d.is_empty()),
        status: input.status,
    })
}

fn clean_patch(patch: RoomPatch) -> Result<RoomPatch> {
    Ok(RoomPatch {
        name: patch
            .name
            .map(|n| required("name", &n, MAX_NAME_LEN))
            .transpose()?,
        capacity: patch.capacity.map(clean_capacity).transpose()?,
        resources: patch.resources.map(clean_resources).transpose()?,
        description: patch.description.map(clean_description).transpose()?,
        status: patch.status,
    })
}

async fn hash_blocking(password: String) -> Result<String> {
    tokio::task::spawn_blocking(move || auth::hash_password(&password))
        .await
        .map_err(internal)?
        .map_err(internal)
}

async fn verify_blocking(password: String, hash: String) -> Result<bool> {
    tokio::task::spawn_blocking(move || auth::verify_password(&password, &hash))
        .await
        .map_err(internal)?
        .map_err(internal)
}
