use std::collections::HashMap;

use thiserror::Error;
use tracing::debug;

use huddle_shared::constants::MAX_MESH_PEERS;
use huddle_shared::types::ParticipantId;

use crate::peer_link::{LinkState, PeerLink};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerRegistryError {
    #[error("Peer link already present for {0}")]
    AlreadyPresent(ParticipantId),

    #[error("Max peers reached ({0})")]
    Full(usize),
}

/// Peer links of the current session, keyed by remote participant.
///
/// Holds exactly one entry per remote participant the local client is
/// currently connected to (or negotiating with).
pub struct PeerRegistry {
    links: HashMap<ParticipantId, PeerLink>,
    max_peers: usize,
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new(MAX_MESH_PEERS)
    }
}

impl PeerRegistry {
    pub fn new(max_peers: usize) -> Self {
        Self {
            links: HashMap::new(),
            max_peers,
        }
    }

    pub fn insert(&mut self, link: PeerLink) -> Result<(), PeerRegistryError> {
        let id = link.participant_id().clone();
        if self.links.contains_key(&id) {
            return Err(PeerRegistryError::AlreadyPresent(id));
        }
        if self.links.len() >= self.max_peers {
            return Err(PeerRegistryError::Full(self.max_peers));
        }
        debug!(peer = %id.short(), total = self.links.len() + 1, "Peer link registered");
        self.links.insert(id, link);
        Ok(())
    }

    pub fn remove(&mut self, id: &ParticipantId) -> Option<PeerLink> {
        self.links.remove(id)
    }

    pub fn get(&self, id: &ParticipantId) -> Option<&PeerLink> {
        self.links.get(id)
    }

    pub fn get_mut(&mut self, id: &ParticipantId) -> Option<&mut PeerLink> {
        self.links.get_mut(id)
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.links.contains_key(id)
    }

    /// Sorted, so callers iterate links in a stable order.
    pub fn ids(&self) -> Vec<ParticipantId> {
        let mut ids: Vec<_> = self.links.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn max_peers(&self) -> usize {
        self.max_peers
    }

    pub fn states(&self) -> Vec<(ParticipantId, LinkState)> {
        let mut states: Vec<_> = self
            .links
            .iter()
            .map(|(id, link)| (id.clone(), link.state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    pub fn drain(&mut self) -> Vec<PeerLink> {
        self.links.drain().map(|(_, link)| link).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtc::media_channel;
    use crate::testing::FakeFactory;

    async fn link(factory: &FakeFactory, id: &str) -> PeerLink {
        let (tx, _rx) = media_channel();
        PeerLink::open(ParticipantId::new(id), factory, tx)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicates() {
        let factory = FakeFactory::new();
        let mut registry = PeerRegistry::default();
        registry.insert(link(&factory, "p-a").await).unwrap();

        let err = registry.insert(link(&factory, "p-a").await).unwrap_err();
        assert_eq!(err, PeerRegistryError::AlreadyPresent(ParticipantId::new("p-a")));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_insert_respects_capacity() {
        let factory = FakeFactory::new();
        let mut registry = PeerRegistry::new(2);
        registry.insert(link(&factory, "p-a").await).unwrap();
        registry.insert(link(&factory, "p-b").await).unwrap();
        assert_eq!(
            registry.insert(link(&factory, "p-c").await),
            Err(PeerRegistryError::Full(2))
        );
    }

    #[tokio::test]
    async fn test_ids_sorted_and_drain() {
        let factory = FakeFactory::new();
        let mut registry = PeerRegistry::default();
        for id in ["p-c", "p-a", "p-b"] {
            registry.insert(link(&factory, id).await).unwrap();
        }
        let ids: Vec<_> = registry.ids().into_iter().map(|id| id.0).collect();
        assert_eq!(ids, vec!["p-a", "p-b", "p-c"]);

        assert!(registry.remove(&ParticipantId::new("p-b")).is_some());
        assert!(!registry.contains(&ParticipantId::new("p-b")));
        assert_eq!(registry.drain().len(), 2);
        assert!(registry.is_empty());
    }
}
