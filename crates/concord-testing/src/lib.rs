//! Testing utilities for concord.
//!
//! [`TestClient::connect`] wires a session engine to a [`DispatchHub`]
//! through a [`LoopbackTransport`], forwards the hub's realtime pushes into
//! the session, and hands the test a [`Faults`] switchboard for simulating
//! outages and storage conflicts.
//!
//! Multi-resource sessions use [`MultiLoopbackTransport`] with the same
//! [`Faults`], and [`spawn_multi_bridge`] feeds one resource's pushes into a
//! [`MultiSession`].

mod loopback;

pub use loopback::{Faults, LoopbackTransport, MultiLoopbackTransport};

use concord_core::{
    Domain, DispatchHub, EngineBuilder, EngineConfig, EngineError, EngineHandle, HubError,
    MultiDomain, MultiSession, MultiTransport, ResourceId, ServerState, ServerStore, SessionView,
    Snapshot,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

/// Forward realtime pushes into `handle` until either side goes away.
pub fn spawn_realtime_bridge<D: Domain>(
    mut pushes: broadcast::Receiver<Snapshot<D>>,
    handle: EngineHandle<D>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match pushes.recv().await {
                Ok(snapshot) => {
                    if handle
                        .push_update(snapshot.version, snapshot.model)
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "realtime bridge lagged");
                }
                Err(RecvError::Closed) => return,
            }
        }
    })
}

/// Forward pushes for `resource` into a multi-resource session until the
/// hub drops the channel.
pub fn spawn_multi_bridge<D, T>(
    mut pushes: broadcast::Receiver<Snapshot<D>>,
    resource: ResourceId,
    session: Arc<MultiSession<D, T>>,
) -> JoinHandle<()>
where
    D: MultiDomain,
    T: MultiTransport<D>,
{
    tokio::spawn(async move {
        loop {
            match pushes.recv().await {
                Ok(snapshot) => {
                    session.push_update(resource, snapshot).await;
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(%resource, skipped, "multi bridge lagged");
                }
                Err(RecvError::Closed) => return,
            }
        }
    })
}

/// One simulated client session attached to a hub.
pub struct TestClient<D: Domain> {
    pub handle: EngineHandle<D>,
    pub faults: Arc<Faults>,
    bridge: JoinHandle<()>,
}

impl<D: Domain> TestClient<D> {
    /// Start a session on the current server state of `resource`.
    pub async fn connect<S: ServerStore<D>>(
        hub: &Arc<DispatchHub<D, S>>,
        resource: ResourceId,
        config: EngineConfig,
    ) -> Result<Self, HubError> {
        // Subscribe first so no push between the snapshot and the bridge is lost.
        let pushes = hub.subscribe(resource);
        let snapshot = hub.snapshot(resource).await?;
        let transport = LoopbackTransport::new(hub.clone(), resource);
        let faults = transport.faults();
        let handle = EngineBuilder::new(transport)
            .with_config(config)
            .with_initial(snapshot.version, snapshot.model)
            .build()
            .start();
        let bridge = spawn_realtime_bridge(pushes, handle.clone());
        Ok(Self {
            handle,
            faults,
            bridge,
        })
    }

    pub fn view(&self) -> SessionView<D> {
        self.handle.view()
    }

    /// Wait until the session is settled at `version`.
    pub async fn settled_at(
        &self,
        version: u64,
        timeout: Duration,
    ) -> Result<SessionView<D>, anyhow::Error> {
        let wait = self
            .handle
            .wait_for(|view| view.is_settled() && view.base_version == version);
        Ok(tokio::time::timeout(timeout, wait).await??)
    }

    pub async fn shutdown(self) -> Result<(), EngineError> {
        self.bridge.abort();
        self.handle.shutdown().await
    }
}

/// Wait until every client has settled on the hub's current version, and
/// check that they all show the hub's model.
pub async fn assert_converged<D: Domain, S: ServerStore<D>>(
    hub: &DispatchHub<D, S>,
    resource: ResourceId,
    clients: &[&TestClient<D>],
    timeout: Duration,
) -> Result<(), anyhow::Error> {
    let snapshot = hub.snapshot(resource).await?;
    let views = futures::future::try_join_all(
        clients
            .iter()
            .map(|client| client.settled_at(snapshot.version, timeout)),
    )
    .await?;
    for (i, view) in views.iter().enumerate() {
        anyhow::ensure!(
            view.present == snapshot.model,
            "client {i} diverged at version {}: {:?} != {:?}",
            snapshot.version,
            view.present,
            snapshot.model
        );
    }
    Ok(())
}

/// Check the server-side invariants of a state: the version is the log
/// length and the log replays to the present model.
pub fn assert_server_consistent<D: Domain>(server: &ServerState<D>) {
    assert_eq!(server.version(), server.applied_log().len() as u64);
    assert!(
        server.verify(),
        "applied log does not replay to the present model"
    );
}
