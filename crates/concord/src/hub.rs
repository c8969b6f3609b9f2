//! Per-resource dispatch serialization.
//!
//! ```text
//! request(id, base, action)
//!     │
//!     ▼
//! slots[id] ── tokio Mutex ── cached ServerState (loaded from store on miss)
//!     │
//!     ├─► base > version ──────────────► InvalidBaseVersion
//!     │
//!     ├─► ServerState::dispatch ──► Reply
//!     │        │
//!     │        ├─► accepted: store.save(id, old_version, snapshot)
//!     │        │             lock lost ──► drop cache, Conflict
//!     │        │
//!     │        └─► store.append_audit(record)
//!     │
//!     └─► broadcast Snapshot to subscribers of id
//! ```
//!
//! Requests against the same resource run one at a time; different resources
//! never wait on each other.
//!
//! A multi-resource request ([`DispatchHub::dispatch_multi`]) locks every
//! resource it touches in ascending id order, so overlapping requests queue
//! up instead of deadlocking, and saves all changed resources in one
//! [`ServerStore::save_many`] batch.

use crate::config::HubConfig;
use crate::domain::Domain;
use crate::error::{HubError, StoreError};
use crate::multi::{self, MultiDomain, MultiReply};
use crate::persistence::{AuditEntry, ServerStore, SnapshotUpdate};
use crate::server::{Reply, ServerState};
use crate::transport::Snapshot;
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Identifies one replicated resource.
pub type ResourceId = Uuid;

type Slot<D> = Arc<Mutex<Option<ServerState<D>>>>;

pub struct DispatchHub<D: Domain, S: ServerStore<D>> {
    store: S,
    config: HubConfig,
    slots: DashMap<ResourceId, Slot<D>>,
    channels: DashMap<ResourceId, broadcast::Sender<Snapshot<D>>>,
}

impl<D: Domain, S: ServerStore<D>> DispatchHub<D, S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            config: HubConfig::default(),
            slots: DashMap::new(),
            channels: DashMap::new(),
        }
    }

    pub fn with_config(mut self, config: HubConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Create a resource at version 0 with the domain's initial model.
    pub async fn create(&self) -> Result<ResourceId, HubError> {
        let id = Uuid::new_v4();
        self.create_with_id(id).await?;
        Ok(id)
    }

    pub async fn create_with_id(&self, id: ResourceId) -> Result<(), HubError> {
        let slot = self.slot(id);
        let mut cached = slot.lock().await;
        let state = ServerState::<D>::new();
        self.store.create(id, &state.snapshot()).await?;
        info!(resource = %id, "resource created");
        *cached = Some(state);
        Ok(())
    }

    /// Current version and model.
    pub async fn snapshot(&self, id: ResourceId) -> Result<Snapshot<D>, HubError> {
        let slot = self.slot(id);
        let mut cached = slot.lock().await;
        let state = self.ensure_loaded(id, &mut cached).await?;
        Ok(Snapshot {
            version: state.version(),
            model: state.present().clone(),
        })
    }

    /// Run one client request against resource `id`.
    pub async fn dispatch(
        &self,
        id: ResourceId,
        base_version: u64,
        action: D::Action,
    ) -> Result<Reply<D>, HubError> {
        let slot = self.slot(id);
        let mut cached = slot.lock().await;
        let state = self.ensure_loaded(id, &mut cached).await?;

        let current = state.version();
        if base_version > current {
            warn!(resource = %id, base_version, version = current, "base version ahead of server");
            return Err(HubError::InvalidBaseVersion {
                base: base_version,
                current,
            });
        }

        let (next, reply) = state.dispatch(base_version, action);

        if reply.is_accepted() {
            match self.store.save(id, current, &next.snapshot()).await {
                Ok(()) => {}
                Err(StoreError::VersionConflict { expected, actual }) => {
                    warn!(resource = %id, expected, actual, "stored resource moved underneath hub");
                    *cached = None;
                    return Err(HubError::Conflict(id));
                }
                Err(err) => {
                    error!(resource = %id, error = %err, "failed to save resource");
                    return Err(err.into());
                }
            }
        }

        if let Some(record) = next.audit_log().last() {
            let entry = AuditEntry::new(id, record.clone());
            if let Err(err) = self.store.append_audit(&entry).await {
                error!(resource = %id, error = %err, "failed to append audit entry");
            }
        }

        match &reply {
            Reply::Accepted {
                new_version,
                no_change,
                ..
            } => {
                info!(resource = %id, base_version, version = new_version, no_change, "action accepted");
                self.publish(
                    id,
                    Snapshot {
                        version: *new_version,
                        model: next.present().clone(),
                    },
                );
            }
            Reply::Rejected { reason, .. } => {
                warn!(resource = %id, base_version, version = current, %reason, "action rejected");
            }
        }

        // The store holds the audit trail; the cache only needs what dispatch reads.
        *cached = Some(ServerState::from_snapshot(next.snapshot()));
        Ok(reply)
    }

    /// Current version and model of each of `ids`.
    pub async fn snapshots(
        &self,
        ids: &BTreeSet<ResourceId>,
    ) -> Result<BTreeMap<ResourceId, Snapshot<D>>, HubError> {
        let mut out = BTreeMap::new();
        for id in ids {
            out.insert(*id, self.snapshot(*id).await?);
        }
        Ok(out)
    }

    /// Persisted audit trail of `id`, oldest first.
    pub async fn audit_log(&self, id: ResourceId) -> Result<Vec<AuditEntry<D>>, HubError> {
        Ok(self.store.audit(id).await?)
    }

    /// Realtime pushes for `id`: one snapshot per accepted change.
    pub fn subscribe(&self, id: ResourceId) -> broadcast::Receiver<Snapshot<D>> {
        self.sender(id).subscribe()
    }

    /// Forget the cached state of `id`; the next request reloads it.
    pub async fn evict(&self, id: ResourceId) {
        let slot = self.slot(id);
        *slot.lock().await = None;
    }

    fn slot(&self, id: ResourceId) -> Slot<D> {
        self.slots
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    fn sender(&self, id: ResourceId) -> broadcast::Sender<Snapshot<D>> {
        self.channels
            .entry(id)
            .or_insert_with(|| broadcast::channel(self.config.broadcast_capacity.max(1)).0)
            .clone()
    }

    fn publish(&self, id: ResourceId, snapshot: Snapshot<D>) {
        let Some(sender) = self.channels.get(&id).map(|s| s.clone()) else {
            return;
        };
        // No receivers is fine.
        let _ = sender.send(snapshot);
    }

    async fn ensure_loaded<'a>(
        &self,
        id: ResourceId,
        cached: &'a mut Option<ServerState<D>>,
    ) -> Result<&'a ServerState<D>, HubError> {
        if cached.is_none() {
            let snapshot = self.store.load(id).await?.ok_or(HubError::NotFound(id))?;
            debug!(resource = %id, version = snapshot.version(), "resource loaded");
            *cached = Some(ServerState::from_snapshot(snapshot));
        }
        cached.as_ref().ok_or(HubError::NotFound(id))
    }
}

impl<D: MultiDomain, S: ServerStore<D>> DispatchHub<D, S> {
    /// Run one request spanning every resource `action` touches.
    ///
    /// `base_versions` holds the version the client last saw of each
    /// resource; a resource missing from it is taken as fully seen.
    pub async fn dispatch_multi(
        &self,
        base_versions: BTreeMap<ResourceId, u64>,
        action: D::MultiAction,
    ) -> Result<MultiReply<D>, HubError> {
        let touched = D::touched(&action);
        if touched.is_empty() {
            return Err(HubError::NothingTouched);
        }

        // BTreeSet iterates in ascending order: the global lock order.
        let mut guards: Vec<(ResourceId, OwnedMutexGuard<Option<ServerState<D>>>)> =
            Vec::with_capacity(touched.len());
        for id in &touched {
            guards.push((*id, self.slot(*id).lock_owned().await));
        }

        let mut states = BTreeMap::new();
        for (id, guard) in guards.iter_mut() {
            let state = self.ensure_loaded(*id, &mut **guard).await?;
            if let Some(base) = base_versions.get(id) {
                if *base > state.version() {
                    warn!(resource = %id, base_version = base, version = state.version(), "base version ahead of server");
                    return Err(HubError::InvalidBaseVersion {
                        base: *base,
                        current: state.version(),
                    });
                }
            }
            states.insert(*id, state.clone());
        }

        let (next, reply) = multi::dispatch_multi(&states, &base_versions, &action);

        let changed = match &reply {
            MultiReply::Accepted { changed, .. } => changed.clone(),
            MultiReply::Rejected { reason, .. } => {
                warn!(resources = ?touched, %reason, "multi-resource action rejected");
                return Ok(reply);
            }
        };

        let updates: Vec<SnapshotUpdate<D>> = changed
            .iter()
            .filter_map(|id| {
                Some(SnapshotUpdate {
                    id: *id,
                    expected_version: states.get(id)?.version(),
                    snapshot: next.get(id)?.snapshot(),
                })
            })
            .collect();
        if !updates.is_empty() {
            match self.store.save_many(&updates).await {
                Ok(()) => {}
                Err(StoreError::BatchConflict {
                    resource,
                    expected,
                    actual,
                }) => {
                    warn!(resource = %resource, expected, actual, "stored resource moved underneath hub");
                    for (_, guard) in guards.iter_mut() {
                        **guard = None;
                    }
                    return Err(HubError::Conflict(resource));
                }
                Err(err) => {
                    error!(resources = ?touched, error = %err, "failed to save resources");
                    return Err(err.into());
                }
            }
        }

        for id in &changed {
            let Some(state) = next.get(id) else {
                continue;
            };
            if let Some(record) = state.audit_log().last() {
                let entry = AuditEntry::new(*id, record.clone());
                if let Err(err) = self.store.append_audit(&entry).await {
                    error!(resource = %id, error = %err, "failed to append audit entry");
                }
            }
            self.publish(
                *id,
                Snapshot {
                    version: state.version(),
                    model: state.present().clone(),
                },
            );
        }
        info!(resources = ?touched, changed = changed.len(), "multi-resource action accepted");

        for (id, guard) in guards.iter_mut() {
            if let Some(state) = next.get(id) {
                **guard = Some(ServerState::from_snapshot(state.snapshot()));
            }
        }
        Ok(reply)
    }
}
