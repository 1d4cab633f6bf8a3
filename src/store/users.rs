use ulid::Ulid;

use crate::error::{Error, Result};
use crate::model::*;

use super::{Store, email_key};

impl Store {
    /// Persist a new account. `user.password_hash` must already be hashed.
    pub async fn insert_user(&self, user: User) -> Result<User> {
        let _registry = self.registry.lock().await;
        if self.matriculas.contains_key(&user.matricula)
            || self.emails.contains_key(&email_key(&user.email))
        {
            return Err(Error::Conflict(
                "matricula or email already registered".into(),
            ));
        }

        let _commit = self.commit_guard().await;
        let event = Event::UserRegistered {
            id: user.id,
            matricula: user.matricula.clone(),
            name: user.name.clone(),
            email: user.email.clone(),
            password_hash: user.password_hash.clone(),
            role: user.role,
        };
        self.wal_append(&event).await?;
        self.apply_user(&event);
        Ok(user)
    }

    pub async fn set_password_hash(&self, id: Ulid, password_hash: String) -> Result<()> {
        let _registry = self.registry.lock().await;
        if !self.users.contains_key(&id) {
            return Err(Error::not_found("user", id));
        }

        let _commit = self.commit_guard().await;
        let event = Event::PasswordChanged { id, password_hash };
        self.wal_append(&event).await?;
        self.apply_user(&event);
        Ok(())
    }

    pub fn user(&self, id: &Ulid) -> Option<User> {
        self.users.get(id).map(|u| u.value().clone())
    }

    pub fn user_by_matricula(&self, matricula: &str) -> Option<User> {
        let id = *self.matriculas.get(matricula)?.value();
        self.user(&id)
    }

    pub fn user_by_email(&self, email: &str) -> Option<User> {
        let id = *self.emails.get(&email_key(email))?.value();
        self.user(&id)
    }
}
