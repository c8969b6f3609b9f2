//! Durable server state.
//!
//! A store keeps, per resource, the latest [`ServerSnapshot`] and an
//! append-only audit trail. Saves are optimistic: the caller states the
//! version it loaded and the store refuses the write if anything else got
//! there first.

use crate::domain::Domain;
use crate::error::StoreError;
use crate::hub::ResourceId;
use crate::server::{RequestRecord, ServerSnapshot};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use tokio::sync::Mutex;

/// One audit record as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct AuditEntry<D: Domain> {
    pub resource: ResourceId,
    pub record: RequestRecord<D>,
    pub recorded_at: DateTime<Utc>,
}

impl<D: Domain> AuditEntry<D> {
    pub fn new(resource: ResourceId, record: RequestRecord<D>) -> Self {
        Self {
            resource,
            record,
            recorded_at: Utc::now(),
        }
    }
}

/// One guarded write of a multi-resource save.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotUpdate<D: Domain> {
    pub id: ResourceId,
    pub expected_version: u64,
    pub snapshot: ServerSnapshot<D>,
}

/// Storage for server snapshots and their audit trail.
#[async_trait]
pub trait ServerStore<D: Domain>: Send + Sync + 'static {
    /// Persist a brand-new resource.
    async fn create(&self, id: ResourceId, snapshot: &ServerSnapshot<D>) -> Result<(), StoreError>;

    async fn load(&self, id: ResourceId) -> Result<Option<ServerSnapshot<D>>, StoreError>;

    /// Replace the stored snapshot if it is still at `expected_version`.
    async fn save(
        &self,
        id: ResourceId,
        expected_version: u64,
        snapshot: &ServerSnapshot<D>,
    ) -> Result<(), StoreError>;

    /// Apply every update or none. The first resource found off its
    /// expected version fails the batch with [`StoreError::BatchConflict`].
    async fn save_many(&self, updates: &[SnapshotUpdate<D>]) -> Result<(), StoreError>;

    async fn append_audit(&self, entry: &AuditEntry<D>) -> Result<(), StoreError>;

    /// Audit entries for `id`, oldest first.
    async fn audit(&self, id: ResourceId) -> Result<Vec<AuditEntry<D>>, StoreError>;
}

struct StoredResource {
    version: u64,
    body: serde_json::Value,
}

/// Process-local store.
///
/// Values are kept as JSON, so everything crossing this store goes through
/// the same serde boundary a database-backed store would.
pub struct InMemoryStore<D: Domain> {
    resources: DashMap<ResourceId, StoredResource>,
    /// Held by every write so a batch is checked and applied as one step.
    writes: Mutex<()>,
    audit: DashMap<ResourceId, Vec<serde_json::Value>>,
    _domain: PhantomData<fn() -> D>,
}

impl<D: Domain> Default for InMemoryStore<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Domain> InMemoryStore<D> {
    pub fn new() -> Self {
        Self {
            resources: DashMap::new(),
            writes: Mutex::new(()),
            audit: DashMap::new(),
            _domain: PhantomData,
        }
    }

    /// Number of stored resources.
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

#[async_trait]
impl<D: Domain> ServerStore<D> for InMemoryStore<D> {
    async fn create(&self, id: ResourceId, snapshot: &ServerSnapshot<D>) -> Result<(), StoreError> {
        let body = serde_json::to_value(snapshot)?;
        match self.resources.entry(id) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(StoredResource {
                    version: snapshot.version(),
                    body,
                });
                Ok(())
            }
        }
    }

    async fn load(&self, id: ResourceId) -> Result<Option<ServerSnapshot<D>>, StoreError> {
        let Some(stored) = self.resources.get(&id) else {
            return Ok(None);
        };
        let snapshot = serde_json::from_value(stored.body.clone())?;
        Ok(Some(snapshot))
    }

    async fn save(
        &self,
        id: ResourceId,
        expected_version: u64,
        snapshot: &ServerSnapshot<D>,
    ) -> Result<(), StoreError> {
        let body = serde_json::to_value(snapshot)?;
        let _writes = self.writes.lock().await;
        let mut stored = self.resources.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if stored.version != expected_version {
            return Err(StoreError::VersionConflict {
                expected: expected_version,
                actual: stored.version,
            });
        }
        stored.version = snapshot.version();
        stored.body = body;
        Ok(())
    }

    async fn save_many(&self, updates: &[SnapshotUpdate<D>]) -> Result<(), StoreError> {
        let _writes = self.writes.lock().await;
        let mut bodies = Vec::with_capacity(updates.len());
        for update in updates {
            let stored = self
                .resources
                .get(&update.id)
                .ok_or(StoreError::NotFound(update.id))?;
            if stored.version != update.expected_version {
                return Err(StoreError::BatchConflict {
                    resource: update.id,
                    expected: update.expected_version,
                    actual: stored.version,
                });
            }
            bodies.push(serde_json::to_value(&update.snapshot)?);
        }
        for (update, body) in updates.iter().zip(bodies) {
            if let Some(mut stored) = self.resources.get_mut(&update.id) {
                stored.version = update.snapshot.version();
                stored.body = body;
            }
        }
        Ok(())
    }

    async fn append_audit(&self, entry: &AuditEntry<D>) -> Result<(), StoreError> {
        let value = serde_json::to_value(entry)?;
        self.audit.entry(entry.resource).or_default().push(value);
        Ok(())
    }

    async fn audit(&self, id: ResourceId) -> Result<Vec<AuditEntry<D>>, StoreError> {
        let Some(entries) = self.audit.get(&id) else {
            return Ok(Vec::new());
        };
        entries
            .iter()
            .map(|value| serde_json::from_value(value.clone()).map_err(StoreError::from))
            .collect()
    }
}
