//! Effect / retry state machine for multi-resource sessions.
//!
//! The same shape as [`crate::EffectState`]: one dispatch in flight, FIFO
//! queue, at most [`MAX_RETRIES`] conflicts per head. Server state arrives
//! per resource and merges forward only, so realtime pushes are taken even
//! while a dispatch is outstanding.

use crate::effect::{EffectMode, NetworkStatus, MAX_RETRIES};
use crate::hub::ResourceId;
use crate::multi::{MultiClientState, MultiDomain};
use crate::transport::Snapshot;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", bound = "")]
pub enum MultiEffectEvent<D: MultiDomain> {
    UserAction {
        action: D::MultiAction,
    },
    DispatchAccepted {
        states: BTreeMap<ResourceId, Snapshot<D>>,
    },
    DispatchConflict {
        fresh: BTreeMap<ResourceId, Snapshot<D>>,
    },
    DispatchRejected {
        fresh: BTreeMap<ResourceId, Snapshot<D>>,
    },
    RealtimeUpdate {
        resource: ResourceId,
        snapshot: Snapshot<D>,
    },
    NetworkError,
    NetworkRestored,
    ManualGoOffline,
    ManualGoOnline,
    Tick,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", bound = "")]
pub enum MultiEffectCommand<D: MultiDomain> {
    NoOp,
    SendDispatch {
        base_versions: BTreeMap<ResourceId, u64>,
        action: D::MultiAction,
    },
}

impl<D: MultiDomain> MultiEffectCommand<D> {
    pub fn is_noop(&self) -> bool {
        matches!(self, MultiEffectCommand::NoOp)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct MultiEffectState<D: MultiDomain> {
    pub network: NetworkStatus,
    pub mode: EffectMode,
    pub client: MultiClientState<D>,
}

impl<D: MultiDomain> MultiEffectState<D> {
    pub fn init(bases: BTreeMap<ResourceId, Snapshot<D>>) -> Self {
        Self {
            network: NetworkStatus::Online,
            mode: EffectMode::Idle,
            client: MultiClientState::new(bases),
        }
    }

    pub fn is_online(&self) -> bool {
        self.network == NetworkStatus::Online
    }

    pub fn is_idle(&self) -> bool {
        self.mode == EffectMode::Idle
    }

    pub fn has_pending(&self) -> bool {
        self.client.pending_count() > 0
    }

    /// Online, idle and nothing left to send.
    pub fn is_settled(&self) -> bool {
        self.is_online() && self.is_idle() && !self.has_pending()
    }

    pub fn invariant(&self) -> bool {
        let retries_bounded = match self.mode {
            EffectMode::Idle => true,
            EffectMode::Dispatching { retries } => retries <= MAX_RETRIES,
        };
        (!self.mode.is_dispatching() || self.has_pending()) && retries_bounded
    }

    pub fn step(self, event: MultiEffectEvent<D>) -> (Self, MultiEffectCommand<D>) {
        match event {
            MultiEffectEvent::UserAction { action } => {
                let client = self.client.local_dispatch(action);
                Self { client, ..self }.start_if_possible()
            }

            MultiEffectEvent::DispatchAccepted { states: fresh }
            | MultiEffectEvent::DispatchRejected { fresh } => {
                if !self.mode.is_dispatching() {
                    return (self, MultiEffectCommand::NoOp);
                }
                let client = self.client.settle_head(&fresh);
                Self {
                    mode: EffectMode::Idle,
                    client,
                    ..self
                }
                .start_if_possible()
            }

            MultiEffectEvent::DispatchConflict { fresh } => {
                let EffectMode::Dispatching { retries } = self.mode else {
                    return (self, MultiEffectCommand::NoOp);
                };
                if retries >= MAX_RETRIES {
                    return (
                        Self {
                            mode: EffectMode::Idle,
                            ..self
                        },
                        MultiEffectCommand::NoOp,
                    );
                }
                let next = Self {
                    mode: EffectMode::Dispatching {
                        retries: retries + 1,
                    },
                    client: self.client.refresh(&fresh),
                    ..self
                };
                match next.client.head().cloned() {
                    Some(action) => {
                        let base_versions = next.client.base_versions_for(&action);
                        (
                            next,
                            MultiEffectCommand::SendDispatch {
                                base_versions,
                                action,
                            },
                        )
                    }
                    None => (
                        Self {
                            mode: EffectMode::Idle,
                            ..next
                        },
                        MultiEffectCommand::NoOp,
                    ),
                }
            }

            MultiEffectEvent::RealtimeUpdate { resource, snapshot } => {
                if !self.is_online() {
                    return (self, MultiEffectCommand::NoOp);
                }
                let client = self.client.handle_realtime_update(resource, snapshot);
                Self { client, ..self }.start_if_possible()
            }

            MultiEffectEvent::NetworkError | MultiEffectEvent::ManualGoOffline => (
                Self {
                    network: NetworkStatus::Offline,
                    mode: EffectMode::Idle,
                    ..self
                },
                MultiEffectCommand::NoOp,
            ),

            MultiEffectEvent::NetworkRestored | MultiEffectEvent::ManualGoOnline => Self {
                network: NetworkStatus::Online,
                ..self
            }
            .start_if_possible(),

            MultiEffectEvent::Tick => self.start_if_possible(),
        }
    }

    fn start_if_possible(self) -> (Self, MultiEffectCommand<D>) {
        if !self.is_online() || !self.is_idle() {
            return (self, MultiEffectCommand::NoOp);
        }
        match self.client.head().cloned() {
            Some(action) => {
                let base_versions = self.client.base_versions_for(&action);
                (
                    Self {
                        mode: EffectMode::Dispatching { retries: 0 },
                        ..self
                    },
                    MultiEffectCommand::SendDispatch {
                        base_versions,
                        action,
                    },
                )
            }
            None => (self, MultiEffectCommand::NoOp),
        }
    }
}
