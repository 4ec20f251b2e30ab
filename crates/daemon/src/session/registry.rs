//! Client registry mapping client ids to their connections.
//!
//! Each logical client owns at most one control connection and any number of
//! stream connections. Frames are spread across the stream connections
//! round-robin; a client with no stream connection receives frames on its
//! control connection instead.

use dashmap::DashMap;

use crate::network::{ConnectionHandle, ConnectionId};

/// Connections registered for one client.
pub struct ClientSession {
    client_id: String,
    control: Option<ConnectionHandle>,
    streams: Vec<ConnectionHandle>,
    /// Only its value modulo `streams.len()` is ever observed.
    cursor: u64,
}

impl ClientSession {
    fn new(client_id: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            control: None,
            streams: Vec::new(),
            cursor: 0,
        }
    }

    /// Returns the client id.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Returns the installed control connection.
    pub fn control(&self) -> Option<&ConnectionHandle> {
        self.control.as_ref()
    }

    /// Returns the stream connections in registration order.
    pub fn streams(&self) -> &[ConnectionHandle] {
        &self.streams
    }

    /// Whether the session holds no connection at all.
    pub fn is_empty(&self) -> bool {
        self.control.is_none() && self.streams.is_empty()
    }

    /// Selects the next frame target and advances the cursor.
    pub fn next_target(&mut self) -> Option<ConnectionHandle> {
        if self.streams.is_empty() {
            return self.control.clone();
        }

        let index = (self.cursor % self.streams.len() as u64) as usize;
        self.cursor = self.cursor.wrapping_add(1);
        Some(self.streams[index].clone())
    }

    fn remove_stream(&mut self, connection_id: ConnectionId) -> Option<ConnectionHandle> {
        let position = self.streams.iter().position(|c| c.id() == connection_id)?;
        Some(self.streams.remove(position))
    }

    fn into_connections(self) -> Vec<ConnectionHandle> {
        self.control.into_iter().chain(self.streams).collect()
    }
}

/// Thread-safe registry of client sessions.
///
/// Sessions live in a sharded map, so operations on different clients do not
/// contend on a single lock. Callers never lock directly.
pub struct ClientRegistry {
    sessions: DashMap<String, ClientSession>,
}

impl ClientRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Installs `connection` as the control connection of `client_id`.
    ///
    /// Returns the previously installed control connection if it is a
    /// different connection, so the caller can close it.
    pub fn set_control(
        &self,
        client_id: &str,
        connection: ConnectionHandle,
    ) -> Option<ConnectionHandle> {
        let new_id = connection.id();
        let previous = self
            .sessions
            .entry(client_id.to_string())
            .or_insert_with(|| ClientSession::new(client_id))
            .control
            .replace(connection);

        tracing::debug!(
            client_id = %client_id,
            connection_id = %new_id,
            replaced = previous.is_some(),
            "Control connection installed"
        );

        previous.filter(|old| old.id() != new_id)
    }

    /// Appends a stream connection for `client_id`.
    ///
    /// Adding a connection that is already registered has no effect.
    pub fn add_stream(&self, client_id: &str, connection: ConnectionHandle) {
        let mut session = self
            .sessions
            .entry(client_id.to_string())
            .or_insert_with(|| ClientSession::new(client_id));

        if session.streams.iter().any(|c| c.id() == connection.id()) {
            return;
        }

        tracing::debug!(
            client_id = %client_id,
            connection_id = %connection.id(),
            streams = session.streams.len() + 1,
            "Stream connection added"
        );
        session.streams.push(connection);
    }

    /// Removes a stream connection, preserving the order of the others.
    ///
    /// Returns the removed handle. The session is dropped once it holds no
    /// connection.
    pub fn remove_stream(
        &self,
        client_id: &str,
        connection_id: ConnectionId,
    ) -> Option<ConnectionHandle> {
        let (removed, now_empty) = {
            let mut session = self.sessions.get_mut(client_id)?;
            let removed = session.remove_stream(connection_id);
            (removed, session.is_empty())
        };

        if removed.is_some() {
            tracing::debug!(
                client_id = %client_id,
                connection_id = %connection_id,
                "Stream connection removed"
            );
        }
        if now_empty {
            self.drop_if_empty(client_id);
        }
        removed
    }

    /// Clears the control connection if `connection_id` is still the
    /// installed one. A superseded connection leaves its replacement alone.
    pub fn remove_control(
        &self,
        client_id: &str,
        connection_id: ConnectionId,
    ) -> Option<ConnectionHandle> {
        let (removed, now_empty) = {
            let mut session = self.sessions.get_mut(client_id)?;
            let is_current = session
                .control
                .as_ref()
                .is_some_and(|c| c.id() == connection_id);
            let removed = if is_current {
                session.control.take()
            } else {
                None
            };
            (removed, session.is_empty())
        };

        if removed.is_some() {
            tracing::debug!(
                client_id = %client_id,
                connection_id = %connection_id,
                "Control connection removed"
            );
        }
        if now_empty {
            self.drop_if_empty(client_id);
        }
        removed
    }

    /// Returns the connection the next frame for `client_id` goes to.
    pub fn next_target(&self, client_id: &str) -> Option<ConnectionHandle> {
        self.sessions.get_mut(client_id)?.next_target()
    }

    /// Calls `f` once per client id known at the time of the call.
    ///
    /// No registry lock is held while `f` runs, so it may call back into the
    /// registry.
    pub fn for_each_client<F>(&self, mut f: F)
    where
        F: FnMut(&str),
    {
        for client_id in self.client_ids() {
            f(&client_id);
        }
    }

    /// Snapshot of the registered client ids.
    pub fn client_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of registered clients.
    pub fn client_count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of stream connections of `client_id`.
    pub fn stream_count(&self, client_id: &str) -> usize {
        self.sessions
            .get(client_id)
            .map(|s| s.streams.len())
            .unwrap_or(0)
    }

    /// Whether `client_id` has a control connection.
    pub fn has_control(&self, client_id: &str) -> bool {
        self.sessions
            .get(client_id)
            .is_some_and(|s| s.control.is_some())
    }

    /// Removes a client and returns all of its connections for closing.
    pub fn remove_client(&self, client_id: &str) -> Vec<ConnectionHandle> {
        match self.sessions.remove(client_id) {
            Some((_, session)) => {
                tracing::info!(client_id = %client_id, "Client removed");
                session.into_connections()
            }
            None => Vec::new(),
        }
    }

    /// Removes every client and returns all connections for closing.
    pub fn drain(&self) -> Vec<ConnectionHandle> {
        self.client_ids()
            .iter()
            .flat_map(|id| self.remove_client(id))
            .collect()
    }

    fn drop_if_empty(&self, client_id: &str) {
        if self
            .sessions
            .remove_if(client_id, |_, session| session.is_empty())
            .is_some()
        {
            tracing::debug!(client_id = %client_id, "Client session dropped");
        }
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}
