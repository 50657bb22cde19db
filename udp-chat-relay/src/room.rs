//! Chat rooms and their membership.
//!
//! Rooms hold member ids only. Addresses are resolved against the
//! [`SessionRegistry`] at fan-out time, so a client that re-registers from a
//! new socket keeps receiving room traffic. The registry never touches the
//! network: every broadcast comes back as a [`Fanout`] for the router to send.

use std::net::SocketAddr;

use nanoid::nanoid;
use tracing::warn;

use crate::{
    error::RelayError,
    message::{ChatLine, RoomSummary},
    session::{ClientIdentity, SessionRegistry},
};

const ROOM_ID_LEN: usize = 6;
const ROOM_ID_ALPHABET: [char; 16] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f',
];

/// Random short hex id. Uniqueness is enforced by the registry, not here.
pub fn generate_room_id() -> String {
    nanoid!(ROOM_ID_LEN, &ROOM_ID_ALPHABET)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
    pub id: String,
    pub name: String,
    members: Vec<String>,
}

impl Room {
    /// Member ids in join order.
    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn is_member(&self, client_id: &str) -> bool {
        self.members.iter().any(|member| member == client_id)
    }
}

/// One line of room traffic and every address it must reach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fanout {
    pub room_id: String,
    pub recipients: Vec<SocketAddr>,
    pub line: ChatLine,
}

#[derive(Debug)]
pub struct RoomRegistry {
    rooms: Vec<Room>,
    capacity: usize,
}

impl RoomRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: Vec::new(),
            capacity,
        }
    }

    /// Fails when one more room would exceed the cap.
    pub fn ensure_capacity(&self) -> Result<(), RelayError> {
        if self.rooms.len() >= self.capacity {
            return Err(RelayError::ResourceExhausted {
                resource: "room",
                limit: self.capacity,
            });
        }
        Ok(())
    }

    /// Creates an empty room. The creator joins separately.
    pub fn create_room(&mut self, name: Option<&str>) -> Result<String, RelayError> {
        self.create_room_with(name, generate_room_id)
    }

    /// Like [`create_room`](Self::create_room) with a caller-chosen id source.
    /// Candidates are drawn until one differs from every existing room id.
    pub fn create_room_with<F>(
        &mut self,
        name: Option<&str>,
        mut next_id: F,
    ) -> Result<String, RelayError>
    where
        F: FnMut() -> String,
    {
        self.ensure_capacity()?;

        let id = loop {
            let candidate = next_id();
            if !self.exists(&candidate) {
                break candidate;
            }
        };

        let name = match name.map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!("room-{id}"),
        };

        self.rooms.push(Room {
            id: id.clone(),
            name,
            members: Vec::new(),
        });
        Ok(id)
    }

    /// Adds `client` to the room. Returns the join notice for the post-join
    /// member list, or `None` when the client was already a member.
    pub fn join(
        &mut self,
        room_id: &str,
        client: &ClientIdentity,
        sessions: &SessionRegistry,
    ) -> Result<Option<Fanout>, RelayError> {
        let room = self.room_mut(room_id)?;
        if room.is_member(&client.id) {
            return Ok(None);
        }
        room.members.push(client.id.clone());

        let line = ChatLine::system(format!("{} joined the room.", client.display_name));
        Ok(Some(fanout(room, line, sessions)))
    }

    /// Removes exactly the member whose id matches. Returns the leave notice
    /// for the remaining members, or `None` when `client_id` was not a member.
    pub fn leave(
        &mut self,
        room_id: &str,
        client_id: &str,
        sessions: &SessionRegistry,
    ) -> Result<Option<Fanout>, RelayError> {
        let room = self.room_mut(room_id)?;
        let Some(position) = room.members.iter().position(|member| member == client_id) else {
            return Ok(None);
        };
        room.members.remove(position);

        let display_name = sessions
            .lookup(client_id)
            .map(|client| client.display_name.clone())
            .unwrap_or_else(|_| client_id.to_string());
        let line = ChatLine::system(format!("{display_name} left the room."));
        Ok(Some(fanout(room, line, sessions)))
    }

    /// Addresses every current member of the room.
    pub fn broadcast(
        &self,
        room_id: &str,
        sender_label: &str,
        message: &str,
        sessions: &SessionRegistry,
    ) -> Result<Fanout, RelayError> {
        let room = self.room(room_id)?;
        let line = ChatLine {
            user: sender_label.to_string(),
            message: message.to_string(),
        };
        Ok(fanout(room, line, sessions))
    }

    pub fn exists(&self, room_id: &str) -> bool {
        self.rooms.iter().any(|room| room.id == room_id)
    }

    pub fn room(&self, room_id: &str) -> Result<&Room, RelayError> {
        self.rooms
            .iter()
            .find(|room| room.id == room_id)
            .ok_or_else(|| RelayError::RoomNotFound(room_id.to_string()))
    }

    fn room_mut(&mut self, room_id: &str) -> Result<&mut Room, RelayError> {
        self.rooms
            .iter_mut()
            .find(|room| room.id == room_id)
            .ok_or_else(|| RelayError::RoomNotFound(room_id.to_string()))
    }

    /// Rooms in creation order.
    pub fn list(&self) -> Vec<RoomSummary> {
        self.rooms
            .iter()
            .map(|room| RoomSummary {
                id: room.id.clone(),
                name: room.name.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    /// Total memberships across all rooms.
    pub fn membership_count(&self) -> usize {
        self.rooms.iter().map(|room| room.members.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

fn fanout(room: &Room, line: ChatLine, sessions: &SessionRegistry) -> Fanout {
    let recipients = room
        .members
        .iter()
        .filter_map(|member| match sessions.lookup(member) {
            Ok(client) => Some(client.address),
            Err(_) => {
                warn!(room_id = %room.id, member = %member, "room member has no session");
                None
            }
        })
        .collect();

    Fanout {
        room_id: room.id.clone(),
        recipients,
        line,
    }
}
