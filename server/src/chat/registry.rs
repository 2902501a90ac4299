//! Connection registry: user -> {connection id -> connection} plus the
//! pong-wait set driven by the watchdog.
//!
//! A user can have multiple concurrent connections (multiple devices/tabs).
//! All reads hand out snapshots so callers may remove entries mid-iteration.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use dashmap::DashMap;
use thiserror::Error;

use crate::chat::connection::Connection;
use crate::chat::{ConnectionId, UserId, CLOSE_INACTIVE_CONNECTION};

#[derive(Debug, Error, PartialEq, Eq)]
#[error("no connections found for user {0}")]
pub struct ConnectionNotFound(pub UserId);

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<UserId, HashMap<ConnectionId, Connection>>,
    /// Connections pinged and still awaiting a pong before the next sweep.
    /// Invariant: every entry here is also present in `connections`.
    pong_wait: Mutex<HashMap<ConnectionId, Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connection. Idempotent on a duplicate connection id.
    pub fn add(&self, user_id: UserId, conn: Connection) {
        self.connections
            .entry(user_id)
            .or_default()
            .insert(conn.id(), conn);
    }

    /// Remove by the connection's own (user, id) pair.
    pub fn remove_connection(&self, conn: &Connection) {
        self.remove(conn.user_id(), conn.id());
    }

    /// Remove a specific connection; drops the user entry when it was the
    /// last one, and clears any pending pong-wait for the id.
    pub fn remove(&self, user_id: UserId, connection_id: ConnectionId) {
        if let Some(mut entry) = self.connections.get_mut(&user_id) {
            entry.remove(&connection_id);
            if entry.is_empty() {
                drop(entry);
                self.connections.remove_if(&user_id, |_, conns| conns.is_empty());
            }
        }
        self.pong_wait_lock().remove(&connection_id);
    }

    /// Snapshot of a user's connections, cheap clones of the handles.
    pub fn get(
        &self,
        user_id: UserId,
    ) -> Result<Vec<(ConnectionId, Connection)>, ConnectionNotFound> {
        let entry = self
            .connections
            .get(&user_id)
            .ok_or(ConnectionNotFound(user_id))?;
        if entry.is_empty() {
            return Err(ConnectionNotFound(user_id));
        }
        Ok(entry.iter().map(|(id, conn)| (*id, conn.clone())).collect())
    }

    pub fn size(&self, user_id: UserId) -> usize {
        self.connections
            .get(&user_id)
            .map(|conns| conns.len())
            .unwrap_or(0)
    }

    /// Whether a connection id is registered for any user.
    pub fn exists(&self, connection_id: ConnectionId) -> bool {
        self.connections
            .iter()
            .any(|entry| entry.value().contains_key(&connection_id))
    }

    /// Track a pinged connection until its pong arrives. Ignored for
    /// connections that already left the registry.
    pub fn mark_pong_wait(&self, conn: &Connection) {
        if !self.exists(conn.id()) {
            return;
        }
        self.pong_wait_lock().insert(conn.id(), conn.clone());
    }

    /// Clear the pong-wait entry for a connection. Returns whether it was
    /// actually pending.
    pub fn mark_pong_received(&self, conn: &Connection) -> bool {
        self.pong_wait_lock().remove(&conn.id()).is_some()
    }

    /// Close and remove every connection that never answered its ping.
    /// Clears the pong-wait set and returns the number disconnected.
    pub fn disconnect_without_pong(&self) -> usize {
        let waiting: Vec<Connection> = self
            .pong_wait_lock()
            .drain()
            .map(|(_, conn)| conn)
            .collect();

        let mut disconnected = 0;
        for conn in waiting {
            if !self.exists(conn.id()) {
                continue;
            }
            conn.send_close(CLOSE_INACTIVE_CONNECTION, "No pong received");
            self.remove(conn.user_id(), conn.id());
            disconnected += 1;
        }
        disconnected
    }

    /// Iterate over a snapshot of the whole registry. Callers may call
    /// `remove` from inside `f` without invalidating the iteration.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(UserId, &[(ConnectionId, Connection)]),
    {
        let snapshot: Vec<(UserId, Vec<(ConnectionId, Connection)>)> = self
            .connections
            .iter()
            .map(|entry| {
                (
                    *entry.key(),
                    entry
                        .value()
                        .iter()
                        .map(|(id, conn)| (*id, conn.clone()))
                        .collect(),
                )
            })
            .collect();

        for (user_id, conns) in snapshot {
            f(user_id, &conns);
        }
    }

    fn pong_wait_lock(&self) -> std::sync::MutexGuard<'_, HashMap<ConnectionId, Connection>> {
        self.pong_wait.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::connection::testing::connection;
    use crate::chat::connection::OutboundFrame;

    #[test]
    fn add_remove_size() {
        let registry = ConnectionRegistry::new();
        let (a, _) = connection(10, 1);
        let (b, _) = connection(10, 2);

        registry.add(10, a.clone());
        registry.add(10, b);
        assert_eq!(registry.size(10), 2);
        assert!(registry.exists(1));

        registry.remove_connection(&a);
        assert_eq!(registry.size(10), 1);
        assert!(!registry.exists(1));
        assert!(registry.exists(2));

        registry.remove(10, 2);
        assert_eq!(registry.size(10), 0);
        assert!(registry.get(10).is_err());
    }

    #[test]
    fn duplicate_add_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (a, _) = connection(10, 1);
        registry.add(10, a.clone());
        registry.add(10, a);
        assert_eq!(registry.size(10), 1);
    }

    #[test]
    fn get_unknown_user_fails() {
        let registry = ConnectionRegistry::new();
        assert_eq!(registry.get(99).unwrap_err(), ConnectionNotFound(99));
    }

    #[test]
    fn pong_wait_requires_registration() {
        let registry = ConnectionRegistry::new();
        let (stray, _) = connection(10, 1);

        // Never added: marking must not grow the set.
        registry.mark_pong_wait(&stray);
        assert!(!registry.mark_pong_received(&stray));

        registry.add(10, stray.clone());
        registry.mark_pong_wait(&stray);
        assert!(registry.mark_pong_received(&stray));
    }

    #[test]
    fn removing_a_connection_clears_its_pong_wait() {
        let registry = ConnectionRegistry::new();
        let (a, _) = connection(10, 1);
        registry.add(10, a.clone());
        registry.mark_pong_wait(&a);

        registry.remove(10, 1);
        assert_eq!(registry.disconnect_without_pong(), 0);
    }

    #[test]
    fn disconnect_without_pong_closes_and_clears() {
        let registry = ConnectionRegistry::new();
        let (a, sink_a) = connection(10, 1);
        let (b, _) = connection(20, 2);
        registry.add(10, a.clone());
        registry.add(20, b.clone());

        registry.mark_pong_wait(&a);
        registry.mark_pong_wait(&b);
        // b answers in time.
        registry.mark_pong_received(&b);

        assert_eq!(registry.disconnect_without_pong(), 1);
        assert_eq!(registry.size(10), 0);
        assert_eq!(registry.size(20), 1);
        assert!(matches!(
            sink_a.frames().as_slice(),
            [OutboundFrame::Close { code, .. }] if *code == CLOSE_INACTIVE_CONNECTION
        ));

        // Set is cleared: a second sweep disconnects nobody.
        assert_eq!(registry.disconnect_without_pong(), 0);
    }

    #[test]
    fn for_each_tolerates_removal_during_iteration() {
        let registry = ConnectionRegistry::new();
        let (a, _) = connection(10, 1);
        let (b, _) = connection(20, 2);
        registry.add(10, a);
        registry.add(20, b);

        let mut seen = 0;
        registry.for_each(|user_id, conns| {
            for (id, _) in conns {
                registry.remove(user_id, *id);
                seen += 1;
            }
        });
        assert_eq!(seen, 2);
        assert_eq!(registry.size(10), 0);
        assert_eq!(registry.size(20), 0);
    }
}
