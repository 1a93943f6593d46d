//! Session registry: logical names to live connections.
//!
//! A name usually has one connection, so the first one is stored inline. A
//! second connection under the same name promotes the slot to a list, and
//! removing down to one member demotes it again. Totals are kept alongside
//! the map and adjusted on every add and remove.
//!
//! The registry never holds its lock while closing a socket or awaiting I/O.
//! Mass operations collect the affected connections first and close them
//! after the lock is released.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use courier_core::Lifecycle;
use courier_proto::AuthCode;

use crate::session::ClientConnection;

enum Slot {
    Single(ClientConnection),
    Multi(Vec<ClientConnection>),
}

impl Slot {
    fn len(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Multi(members) => members.len(),
        }
    }

    fn members(&self) -> Vec<ClientConnection> {
        match self {
            Self::Single(member) => vec![member.clone()],
            Self::Multi(members) => members.clone(),
        }
    }

    fn contains(&self, client: &ClientConnection) -> bool {
        match self {
            Self::Single(member) => member == client,
            Self::Multi(members) => members.contains(client),
        }
    }

    fn push(&mut self, client: ClientConnection) {
        match self {
            Self::Single(first) => *self = Self::Multi(vec![first.clone(), client]),
            Self::Multi(members) => members.push(client),
        }
    }

    /// Remove `client`; returns whether it was present and whether the slot
    /// is now empty.
    fn remove(&mut self, client: &ClientConnection) -> (bool, bool) {
        match self {
            Self::Single(member) => {
                let hit = member == client;
                (hit, hit)
            },
            Self::Multi(members) => {
                let before = members.len();
                members.retain(|m| m != client);
                let hit = members.len() != before;
                match members.len() {
                    0 => (hit, true),
                    1 => {
                        if let Some(last) = members.pop() {
                            *self = Self::Single(last);
                        }
                        (hit, false)
                    },
                    _ => (hit, false),
                }
            },
        }
    }
}

struct Table {
    state: Lifecycle,
    users: HashMap<String, Slot>,
    total: usize,
}

impl Table {
    fn user_count(&self, name: &str) -> usize {
        self.users.get(name).map_or(0, Slot::len)
    }

    fn insert(&mut self, client: ClientConnection) -> bool {
        match self.users.get_mut(client.name()) {
            Some(slot) if slot.contains(&client) => return false,
            Some(slot) => slot.push(client),
            None => {
                let _ = self.users.insert(client.name().to_string(), Slot::Single(client));
            },
        }
        self.total += 1;
        true
    }

    fn drain(&mut self) -> Vec<ClientConnection> {
        self.total = 0;
        self.users.drain().flat_map(|(_, slot)| slot.members()).collect()
    }
}

/// Concurrent map of logical names to their live connections.
pub struct SessionRegistry {
    table: Mutex<Table>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self { table: Mutex::new(Table { state: Lifecycle::Open, users: HashMap::new(), total: 0 }) }
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a connection under its name without checking caps.
    ///
    /// Returns `false` if it is already registered or the registry is closed.
    pub fn add(&self, client: ClientConnection) -> bool {
        let mut table = self.lock();
        if table.state == Lifecycle::Closed {
            return false;
        }
        table.insert(client)
    }

    /// Add a connection if both caps leave room for it.
    ///
    /// Both caps are checked and the entry inserted under one lock, so
    /// concurrent handshakes cannot overshoot either cap.
    pub fn try_register(
        &self,
        client: ClientConnection,
        max_clients: usize,
        max_same_client: usize,
    ) -> Result<(), AuthCode> {
        let mut table = self.lock();
        if table.state == Lifecycle::Closed {
            return Err(AuthCode::InternalError);
        }
        if table.total >= max_clients {
            return Err(AuthCode::MaxGlobalClient);
        }
        if table.user_count(client.name()) >= max_same_client {
            return Err(AuthCode::MaxSameClient);
        }
        if table.insert(client) { Ok(()) } else { Err(AuthCode::InternalError) }
    }

    /// Remove one connection. Returns `false` if it was not registered.
    pub fn remove(&self, client: &ClientConnection) -> bool {
        let mut table = self.lock();
        let Some(slot) = table.users.get_mut(client.name()) else {
            return false;
        };

        let (removed, empty) = slot.remove(client);
        if empty {
            let _ = table.users.remove(client.name());
        }
        if removed {
            table.total -= 1;
        }
        removed
    }

    /// Remove every connection under `name` and return them, without closing.
    pub fn remove_name(&self, name: &str) -> Vec<ClientConnection> {
        let mut table = self.lock();
        let Some(slot) = table.users.remove(name) else {
            return Vec::new();
        };
        let members = slot.members();
        table.total -= members.len();
        members
    }

    /// Live connections under `name`; empty if none.
    pub fn get_user(&self, name: &str) -> Vec<ClientConnection> {
        self.lock().users.get(name).map(Slot::members).unwrap_or_default()
    }

    /// Every live connection.
    pub fn get_all_users(&self) -> Vec<ClientConnection> {
        self.lock().users.values().flat_map(Slot::members).collect()
    }

    /// Total number of registered connections.
    pub fn count(&self) -> usize {
        self.lock().total
    }

    /// Number of connections under `name`.
    pub fn user_count(&self, name: &str) -> usize {
        self.lock().user_count(name)
    }

    /// Whether at least one connection is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.lock().users.contains_key(name)
    }

    /// Registered names, in no particular order.
    pub fn names(&self) -> Vec<String> {
        self.lock().users.keys().cloned().collect()
    }

    /// Deregister and close every connection under `name`.
    pub fn disconnect(&self, name: &str) -> usize {
        let members = self.remove_name(name);
        for client in &members {
            let _ = client.close();
        }
        members.len()
    }

    /// Deregister and close every connection.
    pub fn disconnect_all(&self) -> usize {
        let members = self.lock().drain();
        for client in &members {
            let _ = client.close();
        }
        members.len()
    }

    /// Disconnect everyone and refuse further registrations.
    pub fn close(&self) -> usize {
        let members = {
            let mut table = self.lock();
            table.state = Lifecycle::Closed;
            table.drain()
        };
        for client in &members {
            let _ = client.close();
        }
        members.len()
    }

    /// Whether registrations are accepted.
    pub fn is_open(&self) -> bool {
        self.lock().state == Lifecycle::Open
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.lock();
        f.debug_struct("SessionRegistry")
            .field("state", &table.state)
            .field("names", &table.users.len())
            .field("total", &table.total)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use proptest::prelude::*;

    use super::*;
    use crate::session::tests::open_session;

    #[tokio::test]
    async fn second_connection_promotes_without_losing_first() {
        let registry = SessionRegistry::new();
        let (first, _p1) = open_session(1, "alice");
        let (second, _p2) = open_session(2, "alice");

        assert!(registry.add(first.clone()));
        assert_eq!(registry.get_user("alice"), vec![first.clone()]);

        assert!(registry.add(second.clone()));
        let users = registry.get_user("alice");
        assert_eq!(users.len(), 2);
        assert!(users.contains(&first) && users.contains(&second));
        assert_eq!(registry.user_count("alice"), 2);
        assert_eq!(registry.count(), 2);

        assert!(registry.remove(&first));
        assert_eq!(registry.get_user("alice"), vec![second.clone()]);
        assert_eq!(registry.count(), 1);

        assert!(registry.remove(&second));
        assert!(!registry.contains("alice"));
        assert!(registry.get_user("alice").is_empty());
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn duplicate_add_and_stray_remove_leave_counts_alone() {
        let registry = SessionRegistry::new();
        let (alice, _p1) = open_session(1, "alice");
        let (bob, _p2) = open_session(2, "bob");

        assert!(registry.add(alice.clone()));
        assert!(!registry.add(alice.clone()));
        assert!(!registry.remove(&bob));
        assert_eq!(registry.count(), 1);

        assert!(registry.remove(&alice));
        assert!(!registry.remove(&alice));
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn caps_allow_exactly_n() {
        let registry = SessionRegistry::new();
        let (a1, _p1) = open_session(1, "alice");
        let (a2, _p2) = open_session(2, "alice");
        let (a3, _p3) = open_session(3, "alice");
        let (bob, _p4) = open_session(4, "bob");
        let (carol, _p5) = open_session(5, "carol");

        assert_eq!(registry.try_register(a1, 3, 2), Ok(()));
        assert_eq!(registry.try_register(a2, 3, 2), Ok(()));
        assert_eq!(registry.try_register(a3, 3, 2), Err(AuthCode::MaxSameClient));
        assert_eq!(registry.try_register(bob, 3, 2), Ok(()));
        assert_eq!(registry.try_register(carol, 3, 2), Err(AuthCode::MaxGlobalClient));
        assert_eq!(registry.count(), 3);
    }

    #[tokio::test]
    async fn disconnect_closes_every_connection_under_a_name() {
        let registry = SessionRegistry::new();
        let (a1, _p1) = open_session(1, "alice");
        let (a2, _p2) = open_session(2, "alice");
        let (bob, _p3) = open_session(3, "bob");
        for client in [&a1, &a2, &bob] {
            assert!(registry.add(client.clone()));
        }

        assert_eq!(registry.disconnect("alice"), 2);
        assert!(!a1.is_open() && !a2.is_open());
        assert!(bob.is_open());
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.names(), vec!["bob".to_string()]);

        assert_eq!(registry.disconnect_all(), 1);
        assert!(!bob.is_open());
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn closed_registry_refuses_registration() {
        let registry = SessionRegistry::new();
        let (alice, _p1) = open_session(1, "alice");
        let (bob, _p2) = open_session(2, "bob");
        assert!(registry.add(alice.clone()));

        assert_eq!(registry.close(), 1);
        assert!(!alice.is_open());
        assert!(!registry.add(bob.clone()));
        assert_eq!(registry.try_register(bob, 10, 10), Err(AuthCode::InternalError));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_registration_respects_caps() {
        let registry = Arc::new(SessionRegistry::new());
        let mut tasks = Vec::new();
        let mut peers = Vec::new();

        for id in 0..40u64 {
            let (client, peer) = open_session(id, if id % 2 == 0 { "even" } else { "odd" });
            peers.push(peer);
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move { registry.try_register(client, 15, 10).is_ok() }));
        }

        let mut accepted = 0;
        for task in tasks {
            if task.await.unwrap() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 15);
        assert_eq!(registry.count(), 15);
        assert!(registry.user_count("even") <= 10);
        assert!(registry.user_count("odd") <= 10);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add(usize),
        Remove(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![(0..8usize).prop_map(Op::Add), (0..8usize).prop_map(Op::Remove)]
    }

    proptest! {
        #[test]
        fn counts_track_membership(ops in proptest::collection::vec(op(), 0..64)) {
            let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            runtime.block_on(async {
                let registry = SessionRegistry::new();
                let names = ["alice", "bob", "carol"];
                let pool: Vec<_> = (0..8u64).map(|id| open_session(id, names[id as usize % 3])).collect();
                let mut live = std::collections::HashSet::new();

                for op in ops {
                    match op {
                        Op::Add(i) => assert_eq!(registry.add(pool[i].0.clone()), live.insert(i)),
                        Op::Remove(i) => assert_eq!(registry.remove(&pool[i].0), live.remove(&i)),
                    }
                    assert_eq!(registry.count(), live.len());
                    for (n, name) in names.iter().enumerate() {
                        let expected = live.iter().filter(|i| **i % 3 == n).count();
                        assert_eq!(registry.user_count(name), expected);
                        assert_eq!(registry.get_user(name).len(), expected);
                    }
                }
            });
        }
    }
}
