use async_trait::async_trait;
use concord_core::{
    DispatchHub, DispatchOutcome, Domain, HubError, MultiDispatchOutcome, MultiDomain,
    MultiTransport, ResourceId, ServerStore, Snapshot, Transport, TransportError,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Switches for misbehaving networks, shared between a test and its
/// transport.
#[derive(Debug, Default)]
pub struct Faults {
    offline: AtomicBool,
    conflicts: AtomicUsize,
    latency_ms: AtomicU64,
    requests: AtomicUsize,
}

impl Faults {
    /// Every request fails as unreachable while set.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Answer the next `n` dispatches with a storage conflict.
    pub fn inject_conflicts(&self, n: usize) {
        self.conflicts.store(n, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(ms, Ordering::SeqCst);
    }

    /// Dispatch requests seen so far, including failed ones.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    fn take_conflict(&self) -> bool {
        self.conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    async fn delay(&self) {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

/// In-process transport that talks straight to a [`DispatchHub`].
pub struct LoopbackTransport<D: Domain, S: ServerStore<D>> {
    hub: Arc<DispatchHub<D, S>>,
    resource: ResourceId,
    faults: Arc<Faults>,
}

impl<D: Domain, S: ServerStore<D>> LoopbackTransport<D, S> {
    pub fn new(hub: Arc<DispatchHub<D, S>>, resource: ResourceId) -> Self {
        Self {
            hub,
            resource,
            faults: Arc::new(Faults::default()),
        }
    }

    pub fn with_faults(mut self, faults: Arc<Faults>) -> Self {
        self.faults = faults;
        self
    }

    pub fn faults(&self) -> Arc<Faults> {
        self.faults.clone()
    }
}

#[async_trait]
impl<D: Domain, S: ServerStore<D>> Transport<D> for LoopbackTransport<D, S> {
    async fn dispatch(
        &self,
        base_version: u64,
        action: D::Action,
    ) -> Result<DispatchOutcome<D>, TransportError> {
        self.faults.requests.fetch_add(1, Ordering::SeqCst);
        self.faults.delay().await;
        if self.faults.is_offline() {
            return Err(TransportError::Unreachable);
        }
        if self.faults.take_conflict() {
            return Ok(DispatchOutcome::Conflict);
        }
        match self.hub.dispatch(self.resource, base_version, action).await {
            Ok(reply) => Ok(DispatchOutcome::Replied { reply }),
            Err(HubError::Conflict(_)) => Ok(DispatchOutcome::Conflict),
            Err(err @ HubError::InvalidBaseVersion { .. }) => {
                Err(TransportError::Refused(err.to_string()))
            }
            Err(err) => Err(TransportError::Other(err.into())),
        }
    }

    async fn fetch_state(&self) -> Result<Snapshot<D>, TransportError> {
        self.faults.delay().await;
        if self.faults.is_offline() {
            return Err(TransportError::Unreachable);
        }
        self.hub
            .snapshot(self.resource)
            .await
            .map_err(|err| TransportError::Other(err.into()))
    }
}

/// Loopback for multi-resource sessions. Shares [`Faults`] with the
/// single-resource transport so one switch can take a whole client offline.
pub struct MultiLoopbackTransport<D: MultiDomain, S: ServerStore<D>> {
    hub: Arc<DispatchHub<D, S>>,
    faults: Arc<Faults>,
}

impl<D: MultiDomain, S: ServerStore<D>> MultiLoopbackTransport<D, S> {
    pub fn new(hub: Arc<DispatchHub<D, S>>) -> Self {
        Self {
            hub,
            faults: Arc::new(Faults::default()),
        }
    }

    pub fn with_faults(mut self, faults: Arc<Faults>) -> Self {
        self.faults = faults;
        self
    }

    pub fn faults(&self) -> Arc<Faults> {
        self.faults.clone()
    }
}

#[async_trait]
impl<D: MultiDomain, S: ServerStore<D>> MultiTransport<D> for MultiLoopbackTransport<D, S> {
    async fn dispatch_multi(
        &self,
        base_versions: BTreeMap<ResourceId, u64>,
        action: D::MultiAction,
    ) -> Result<MultiDispatchOutcome<D>, TransportError> {
        self.faults.requests.fetch_add(1, Ordering::SeqCst);
        self.faults.delay().await;
        if self.faults.is_offline() {
            return Err(TransportError::Unreachable);
        }
        if self.faults.take_conflict() {
            return Ok(MultiDispatchOutcome::Conflict);
        }
        match self.hub.dispatch_multi(base_versions, action).await {
            Ok(reply) => Ok(MultiDispatchOutcome::Replied { reply }),
            Err(HubError::Conflict(_)) => Ok(MultiDispatchOutcome::Conflict),
            Err(err @ (HubError::InvalidBaseVersion { .. } | HubError::NothingTouched)) => {
                Err(TransportError::Refused(err.to_string()))
            }
            Err(err) => Err(TransportError::Other(err.into())),
        }
    }

    async fn fetch_states(
        &self,
        resources: &BTreeSet<ResourceId>,
    ) -> Result<BTreeMap<ResourceId, Snapshot<D>>, TransportError> {
        self.faults.delay().await;
        if self.faults.is_offline() {
            return Err(TransportError::Unreachable);
        }
        self.hub
            .snapshots(resources)
            .await
            .map_err(|err| TransportError::Other(err.into()))
    }
}
