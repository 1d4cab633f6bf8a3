use ulid::Ulid;

use crate::error::{Error, Result};
use crate::model::*;

use super::{Store, apply_to_room, name_key};

impl Store {
    /// Insert a new room. Names are unique case-insensitively.
    pub async fn insert_room(&self, room: Room) -> Result<Room> {
        let _registry = self.registry.lock().await;
        if self.room_names.contains_key(&name_key(&room.name)) {
            return Err(Error::Conflict(format!(
                "a room named {:?} already exists",
                room.name
            )));
        }
        if self.rooms.contains_key(&room.id) {
            return Err(Error::Conflict(format!("room {} already exists", room.id)));
        }

        let _commit = self.commit_guard().await;
        let event = Event::RoomCreated { room: room.clone() };
        self.wal_append(&event).await?;
        self.index_new_room(room.clone());
        Ok(room)
    }

    /// Merge `patch` onto the stored room. Omitted fields keep their values.
    pub async fn update_room(&self, id: Ulid, patch: RoomPatch) -> Result<Room> {
        let _registry = self.registry.lock().await;
        let rs = self
            .get_room_state(&id)
            .ok_or_else(|| Error::not_found("room", id))?;

        let _commit = self.commit_guard().await;
        let mut guard = rs.write().await;
        let room = patch.apply_to(&guard.room);
        if let Some(owner) = self.room_names.get(&name_key(&room.name))
            && *owner.value() != id
        {
            return Err(Error::Conflict(format!(
                "a room named {:?} already exists",
                room.name
            )));
        }

        let event = Event::RoomUpdated { room: room.clone() };
        self.wal_append(&event).await?;
        self.reindex_room_name(&guard.room.name, &room);
        apply_to_room(&mut guard, &event, &self.reservation_room);
        Ok(room)
    }

    /// Remove a room together with its reservation history.
    /// Refused while any reservation on the room is still active.
    pub async fn delete_room(&self, id: Ulid) -> Result<Room> {
        let _registry = self.registry.lock().await;
        let rs = self
            .get_room_state(&id)
            .ok_or_else(|| Error::not_found("room", id))?;

        let _commit = self.commit_guard().await;
        let guard = rs.write().await;
        let active = guard.active().count();
        if active > 0 {
            return Err(Error::Conflict(format!(
                "room {id} still has {active} active reservation(s)"
            )));
        }

        self.wal_append(&Event::RoomDeleted { id }).await?;
        self.rooms.remove(&id);
        self.unindex_room(&guard);
        Ok(guard.room.clone())
    }

    pub async fn room(&self, id: Ulid) -> Option<Room> {
        let rs = self.get_room_state(&id)?;
        let guard = rs.read().await;
        Some(guard.room.clone())
    }

    pub async fn list_rooms(&self) -> Vec<Room> {
        let mut rooms = Vec::with_capacity(self.rooms.len());
        for rs in self.room_states() {
            rooms.push(rs.read().await.room.clone());
        }
        rooms.sort_by(|a, b| name_key(&a.name).cmp(&name_key(&b.name)));
        rooms
    }
}
