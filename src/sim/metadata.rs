//! In-memory metadata store
//!
//! `MetadataDirectory` plays the remote side: what each member currently
//! publishes. Each node's `InMemoryMetadataStore` fetches from it (failing for
//! unreachable or unpublished members) and keeps its own cache.
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use super::LocalNetwork;
use crate::error::Result;
use crate::member::Member;
use crate::metadata_error;
use crate::transport::MetadataStore;

#[derive(Clone, Debug, Default)]
pub struct MetadataDirectory {
    entries: Arc<RwLock<HashMap<String, Bytes>>>,
}

impl MetadataDirectory {
    pub fn publish(&self, member_id: &str, metadata: Bytes) -> Option<Bytes> {
        self.entries.write().insert(member_id.to_string(), metadata)
    }

    pub fn withdraw(&self, member_id: &str) -> Option<Bytes> {
        self.entries.write().remove(member_id)
    }

    pub fn get(&self, member_id: &str) -> Option<Bytes> {
        self.entries.read().get(member_id).cloned()
    }
}

#[derive(Debug)]
pub struct InMemoryMetadataStore {
    network: LocalNetwork,
    cache: Mutex<HashMap<Member, Bytes>>,
}

impl InMemoryMetadataStore {
    pub fn new(network: LocalNetwork) -> Self {
        Self {
            network,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn cached(&self, member: &Member) -> Option<Bytes> {
        self.cache.lock().get(member).cloned()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn fetch_metadata(&self, member: &Member) -> Result<Bytes> {
        if !self.network.is_reachable(member.address()) {
            return Err(metadata_error!("{} is unreachable", member));
        }
        self.network
            .metadata_directory()
            .get(member.id())
            .ok_or_else(|| metadata_error!("{} has not published metadata", member))
    }

    fn update_metadata(&self, member: &Member, metadata: Bytes) -> Option<Bytes> {
        self.cache.lock().insert(member.clone(), metadata)
    }

    fn remove_metadata(&self, member: &Member) -> Option<Bytes> {
        self.cache.lock().remove(member)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member() -> Member {
        Member::with_id("b2", "127.0.0.1:4802".parse().unwrap())
    }

    #[tokio::test]
    async fn test_fetch_follows_directory_and_reachability() {
        let network = LocalNetwork::new();
        let store = InMemoryMetadataStore::new(network.clone());
        assert!(store.fetch_metadata(&member()).await.is_err());

        network
            .metadata_directory()
            .publish("b2", Bytes::from_static(b"zone=a"));
        assert_eq!(
            store.fetch_metadata(&member()).await.unwrap(),
            Bytes::from_static(b"zone=a")
        );

        network.disconnect(member().address());
        assert!(store.fetch_metadata(&member()).await.is_err());
    }

    #[test]
    fn test_cache_returns_previous_values() {
        let store = InMemoryMetadataStore::new(LocalNetwork::new());
        assert_eq!(store.update_metadata(&member(), Bytes::from_static(b"v1")), None);
        assert_eq!(
            store.update_metadata(&member(), Bytes::from_static(b"v2")),
            Some(Bytes::from_static(b"v1"))
        );
        assert_eq!(store.remove_metadata(&member()), Some(Bytes::from_static(b"v2")));
        assert_eq!(store.cached(&member()), None);
    }
}
