//! Snapshot list of entities for broadcasts.

use std::sync::Arc;

use tracing::debug;

use crate::core::message::NetworkMessage;
use crate::error::DisconnectReason;
use crate::transport::entity::Entity;

/// An ordered set of entities, deduplicated by id.
///
/// The group holds strong references; entities that disconnect stay in the
/// group until removed, and sends to them simply fail.
#[derive(Debug, Clone, Default)]
pub struct ConnectionGroup {
    members: Vec<Arc<Entity>>,
}

impl ConnectionGroup {
    pub fn new(members: impl IntoIterator<Item = Arc<Entity>>) -> Self {
        members.into_iter().collect()
    }

    /// Members of `members` for which `predicate` holds.
    pub fn filtered<F>(members: impl IntoIterator<Item = Arc<Entity>>, predicate: F) -> Self
    where
        F: Fn(&Arc<Entity>) -> bool,
    {
        members.into_iter().filter(|entity| predicate(entity)).collect()
    }

    /// Add `entity`; returns `false` if an entity with the same id is present.
    pub fn add(&mut self, entity: Arc<Entity>) -> bool {
        if self.contains(entity.id()) {
            return false;
        }
        self.members.push(entity);
        true
    }

    pub fn remove(&mut self, id: u32) -> Option<Arc<Entity>> {
        let index = self.members.iter().position(|entity| entity.id() == id)?;
        Some(self.members.remove(index))
    }

    pub fn contains(&self, id: u32) -> bool {
        self.members.iter().any(|entity| entity.id() == id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Arc<Entity>> {
        self.members.iter()
    }

    /// Send to every member; returns how many sends succeeded.
    pub fn send_to_all<M: NetworkMessage>(&self, message: &M) -> usize {
        let sent = self
            .members
            .iter()
            .filter(|entity| entity.send(message).is_ok())
            .count();
        debug!(
            message = M::type_name(),
            sent,
            members = self.members.len(),
            "Group send"
        );
        sent
    }

    /// Disconnect every member with [`DisconnectReason::Manual`].
    pub fn disconnect_all(&self) {
        for entity in &self.members {
            entity.disconnect(DisconnectReason::Manual);
        }
    }
}

impl FromIterator<Arc<Entity>> for ConnectionGroup {
    fn from_iter<I: IntoIterator<Item = Arc<Entity>>>(iter: I) -> Self {
        let mut group = ConnectionGroup::default();
        for entity in iter {
            group.add(entity);
        }
        group
    }
}

impl IntoIterator for ConnectionGroup {
    type Item = Arc<Entity>;
    type IntoIter = std::vec::IntoIter<Arc<Entity>>;

    fn into_iter(self) -> Self::IntoIter {
        self.members.into_iter()
    }
}

impl<'a> IntoIterator for &'a ConnectionGroup {
    type Item = &'a Arc<Entity>;
    type IntoIter = std::slice::Iter<'a, Arc<Entity>>;

    fn into_iter(self) -> Self::IntoIter {
        self.members.iter()
    }
}
