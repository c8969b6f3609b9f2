//! Async driver for a multi-resource session.
//!
//! Each call feeds one event through [`MultiEffectState::step`] and runs the
//! resulting commands against a [`MultiTransport`] until the reducer has
//! nothing left to send. The state lock is held across transport calls, so
//! events are handled one at a time and at most one dispatch is in flight.

use crate::hub::ResourceId;
use crate::multi::{MultiDomain, MultiReply};
use crate::multi_effect::{MultiEffectCommand, MultiEffectEvent, MultiEffectState};
use crate::transport::{MultiDispatchOutcome, MultiTransport, Snapshot};
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub struct MultiSession<D: MultiDomain, T: MultiTransport<D>> {
    transport: T,
    state: Mutex<MultiEffectState<D>>,
}

impl<D: MultiDomain, T: MultiTransport<D>> MultiSession<D, T> {
    /// A session tracking `bases`, online and idle.
    pub fn new(transport: T, bases: BTreeMap<ResourceId, Snapshot<D>>) -> Self {
        Self {
            transport,
            state: Mutex::new(MultiEffectState::init(bases)),
        }
    }

    /// Start offline; actions queue until [`MultiSession::go_online`].
    pub fn offline(transport: T, bases: BTreeMap<ResourceId, Snapshot<D>>) -> Self {
        let (state, _) = MultiEffectState::init(bases).step(MultiEffectEvent::ManualGoOffline);
        Self {
            transport,
            state: Mutex::new(state),
        }
    }

    /// Apply `action` locally and send whatever the queue allows.
    pub async fn dispatch(&self, action: D::MultiAction) -> MultiEffectState<D> {
        self.drive(MultiEffectEvent::UserAction { action }).await
    }

    pub async fn push_update(&self, resource: ResourceId, snapshot: Snapshot<D>) -> MultiEffectState<D> {
        self.drive(MultiEffectEvent::RealtimeUpdate { resource, snapshot })
            .await
    }

    pub async fn go_offline(&self) -> MultiEffectState<D> {
        self.drive(MultiEffectEvent::ManualGoOffline).await
    }

    pub async fn go_online(&self) -> MultiEffectState<D> {
        self.drive(MultiEffectEvent::ManualGoOnline).await
    }

    pub async fn tick(&self) -> MultiEffectState<D> {
        self.drive(MultiEffectEvent::Tick).await
    }

    pub async fn state(&self) -> MultiEffectState<D> {
        self.state.lock().await.clone()
    }

    async fn drive(&self, event: MultiEffectEvent<D>) -> MultiEffectState<D> {
        let mut state = self.state.lock().await;
        let mut next_event = Some(event);
        while let Some(event) = next_event.take() {
            let (next, command) = state.clone().step(event);
            *state = next;
            next_event = match command {
                MultiEffectCommand::NoOp => None,
                MultiEffectCommand::SendDispatch {
                    base_versions,
                    action,
                } => Some(execute_multi_dispatch(&self.transport, base_versions, action).await),
            };
        }
        state.clone()
    }
}

/// Run one dispatch and turn its outcome into the reducer's next event.
async fn execute_multi_dispatch<D: MultiDomain, T: MultiTransport<D>>(
    transport: &T,
    base_versions: BTreeMap<ResourceId, u64>,
    action: D::MultiAction,
) -> MultiEffectEvent<D> {
    let touched = D::touched(&action);
    let outcome = match transport.dispatch_multi(base_versions, action).await {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(resources = ?touched, error = %err, "multi dispatch failed");
            return MultiEffectEvent::NetworkError;
        }
    };

    let rejected = match outcome {
        MultiDispatchOutcome::Replied {
            reply: MultiReply::Accepted { states, .. },
        } => return MultiEffectEvent::DispatchAccepted { states },
        MultiDispatchOutcome::Replied {
            reply: MultiReply::Rejected { reason, .. },
        } => {
            warn!(resources = ?touched, %reason, "multi action rejected by server");
            true
        }
        MultiDispatchOutcome::Conflict => {
            debug!(resources = ?touched, "server reported conflict");
            false
        }
    };

    match transport.fetch_states(&touched).await {
        Ok(fresh) if rejected => MultiEffectEvent::DispatchRejected { fresh },
        Ok(fresh) => MultiEffectEvent::DispatchConflict { fresh },
        Err(err) => {
            warn!(resources = ?touched, error = %err, "fetching fresh state failed");
            MultiEffectEvent::NetworkError
        }
    }
}
