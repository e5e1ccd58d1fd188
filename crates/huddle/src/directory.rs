use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::types::{Endpoint, EndpointId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub exists: bool,
    pub display_name: Option<String>,
    pub reachable: bool,
}

impl DirectoryEntry {
    pub fn unknown() -> Self {
        Self {
            exists: false,
            display_name: None,
            reachable: false,
        }
    }
}

/// Presence lookup provided by the surrounding application.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn lookup(&self, id: &EndpointId) -> DirectoryEntry;
}

/// Directory backed by a map. The relay server registers every endpoint that
/// says hello and flips `reachable` while the socket is open.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    entries: DashMap<EndpointId, (String, bool)>,
    accept_unknown: bool,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lookups for unregistered ids report an existing but unreachable
    /// endpoint instead of an unknown one.
    pub fn accepting_unknown() -> Self {
        Self {
            entries: DashMap::new(),
            accept_unknown: true,
        }
    }

    pub fn register(&self, endpoint: &Endpoint) {
        self.entries
            .insert(endpoint.id.clone(), (endpoint.display_name.clone(), true));
    }

    pub fn set_reachable(&self, id: &EndpointId, reachable: bool) {
        if let Some(mut entry) = self.entries.get_mut(id) {
            entry.1 = reachable;
        }
    }

    pub fn remove(&self, id: &EndpointId) {
        self.entries.remove(id);
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn lookup(&self, id: &EndpointId) -> DirectoryEntry {
        match self.entries.get(id) {
            Some(entry) => DirectoryEntry {
                exists: true,
                display_name: Some(entry.0.clone()),
                reachable: entry.1,
            },
            None if self.accept_unknown => DirectoryEntry {
                exists: true,
                display_name: None,
                reachable: false,
            },
            None => DirectoryEntry::unknown(),
        }
    }
}
