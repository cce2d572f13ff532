//! Topic membership.
//!
//! One `RwLock` guards the whole topic map. It is only held while the map or
//! a member list is mutated or copied, never across socket I/O, so every
//! operation here is linearizable with respect to the others.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::RwLock;

use crate::connection::{Connection, ConnectionId};

pub struct Registry {
    topics: RwLock<HashMap<String, Vec<Arc<Connection>>>>,
    next_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> ConnectionId {
        ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Appends `conn` to `topic`, creating the topic on first use.
    ///
    /// Joining twice appends twice; the connection then receives every
    /// broadcast once per entry.
    pub fn join(&self, topic: &str, conn: Arc<Connection>) {
        let mut topics = self.topics.write();
        topics.entry(topic.to_string()).or_default().push(conn);
    }

    /// Removes the first entry for `id` under `topic`.
    ///
    /// Returns `false` when nothing matched. The topic entry stays in the map
    /// even when it becomes empty.
    pub fn leave(&self, topic: &str, id: ConnectionId) -> bool {
        let mut topics = self.topics.write();
        let Some(members) = topics.get_mut(topic) else {
            return false;
        };

        match members.iter().position(|conn| conn.id() == id) {
            Some(index) => {
                members.remove(index);
                true
            }
            None => false,
        }
    }

    /// Copy of the current members of `topic`, in join order.
    pub fn snapshot(&self, topic: &str) -> Vec<Arc<Connection>> {
        self.topics.read().get(topic).cloned().unwrap_or_default()
    }

    /// Every registered connection across all topics.
    pub fn all_members(&self) -> Vec<(String, Arc<Connection>)> {
        self.topics
            .read()
            .iter()
            .flat_map(|(topic, members)| {
                members
                    .iter()
                    .map(move |conn| (topic.clone(), Arc::clone(conn)))
            })
            .collect()
    }

    pub fn clear(&self) {
        self.topics.write().clear();
    }

    pub fn topic_count(&self) -> usize {
        self.topics.read().len()
    }

    pub fn member_count(&self, topic: &str) -> usize {
        self.topics.read().get(topic).map_or(0, Vec::len)
    }

    pub fn total_members(&self) -> usize {
        self.topics.read().values().map(Vec::len).sum()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
