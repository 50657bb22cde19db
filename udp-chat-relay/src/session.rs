//! Known clients, keyed by their caller-supplied id.

use std::{collections::HashMap, net::SocketAddr};

use crate::{error::RelayError, message::UserSummary};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub id: String,
    pub display_name: String,
    pub address: SocketAddr,
}

/// Whether a `register` call created a session or refreshed an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Created,
    Updated,
}

/// Sessions in registration order.
///
/// Sessions are never removed, so positions in `clients` are stable and the
/// index can point straight into it. `refreshed[slot]` is the value of
/// `clock` at that session's latest `register`.
#[derive(Debug)]
pub struct SessionRegistry {
    clients: Vec<ClientIdentity>,
    refreshed: Vec<u64>,
    index: HashMap<String, usize>,
    clock: u64,
    capacity: usize,
}

impl SessionRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            clients: Vec::new(),
            refreshed: Vec::new(),
            index: HashMap::new(),
            clock: 0,
            capacity,
        }
    }

    /// Upserts a session. Re-registering an id overwrites its name and address,
    /// which is how a restarted client with a new socket is picked up again.
    pub fn register(
        &mut self,
        id: &str,
        display_name: &str,
        address: SocketAddr,
    ) -> Result<Registration, RelayError> {
        if let Some(&slot) = self.index.get(id) {
            let client = &mut self.clients[slot];
            client.display_name = display_name.to_string();
            client.address = address;
            self.clock += 1;
            self.refreshed[slot] = self.clock;
            return Ok(Registration::Updated);
        }

        if self.clients.len() >= self.capacity {
            return Err(RelayError::ResourceExhausted {
                resource: "session",
                limit: self.capacity,
            });
        }

        self.clock += 1;
        self.index.insert(id.to_string(), self.clients.len());
        self.refreshed.push(self.clock);
        self.clients.push(ClientIdentity {
            id: id.to_string(),
            display_name: display_name.to_string(),
            address,
        });
        Ok(Registration::Created)
    }

    pub fn lookup(&self, id: &str) -> Result<&ClientIdentity, RelayError> {
        self.index
            .get(id)
            .map(|&slot| &self.clients[slot])
            .ok_or_else(|| RelayError::UserNotFound(id.to_string()))
    }

    /// Session using `address` whose latest `register` came last, if any.
    pub fn find_by_address(&self, address: SocketAddr) -> Option<&ClientIdentity> {
        self.clients
            .iter()
            .zip(&self.refreshed)
            .filter(|(client, _)| client.address == address)
            .max_by_key(|&(_, &refreshed)| refreshed)
            .map(|(client, _)| client)
    }

    pub fn list(&self) -> Vec<UserSummary> {
        self.clients
            .iter()
            .map(|client| UserSummary {
                id: client.id.clone(),
                name: client.display_name.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
