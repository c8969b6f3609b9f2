//! Effect / retry state machine.
//!
//! A pure reducer over [`EffectState`]. Every external occurrence (a user
//! action, a dispatch reply, a connectivity change) is an [`EffectEvent`];
//! every side effect the session needs is an [`EffectCommand`] for a
//! transport to execute. At most one dispatch is in flight, pending actions
//! are sent in FIFO order, and retries after conflicts are bounded by
//! [`MAX_RETRIES`].
//!
//! Two invariants hold in every reachable state:
//!
//! - dispatching implies a non-empty pending queue ([`EffectState::mode_consistent`])
//! - retries never exceed [`MAX_RETRIES`] ([`EffectState::retries_bounded`])

use crate::client::ClientState;
use crate::domain::Domain;
use serde::{Deserialize, Serialize};

/// Conflicts tolerated for one pending head before giving up.
pub const MAX_RETRIES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EffectMode {
    Idle,
    Dispatching { retries: u32 },
}

impl EffectMode {
    pub fn is_dispatching(&self) -> bool {
        matches!(self, EffectMode::Dispatching { .. })
    }
}

/// Inputs to the reducer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", bound = "")]
pub enum EffectEvent<D: Domain> {
    UserAction { action: D::Action },
    DispatchAccepted { new_version: u64, new_model: D::Model },
    DispatchConflict { fresh_version: u64, fresh_model: D::Model },
    DispatchRejected { fresh_version: u64, fresh_model: D::Model },
    /// Pushed or polled server state outside of a dispatch reply.
    RealtimeUpdate { server_version: u64, server_model: D::Model },
    /// The user asked for a refresh from the server.
    ResyncRequested,
    NetworkError,
    NetworkRestored,
    ManualGoOffline,
    ManualGoOnline,
    Tick,
}

/// Outputs of the reducer, executed by a transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", bound = "")]
pub enum EffectCommand<D: Domain> {
    NoOp,
    SendDispatch { base_version: u64, action: D::Action },
    FetchFreshState,
}

impl<D: Domain> EffectCommand<D> {
    pub fn is_noop(&self) -> bool {
        matches!(self, EffectCommand::NoOp)
    }
}

/// Lexicographic progress measure `(dispatching, retry budget, pending)`.
///
/// Every server reply handled while dispatching makes it strictly smaller,
/// which bounds how long a session can go without new user input before
/// settling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressMeasure {
    pub dispatching: bool,
    pub retry_budget: u32,
    pub pending: usize,
}

impl ProgressMeasure {
    /// `self` is strictly closer to settled than `other`.
    pub fn precedes(&self, other: &ProgressMeasure) -> bool {
        self.pending < other.pending
            || (self.pending == other.pending && !self.dispatching && other.dispatching)
            || (self.pending == other.pending
                && self.dispatching == other.dispatching
                && self.retry_budget < other.retry_budget)
    }
}

/// The whole client session as seen by the reducer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct EffectState<D: Domain> {
    pub network: NetworkStatus,
    pub mode: EffectMode,
    pub client: ClientState<D>,
    pub server_version: u64,
}

impl<D: Domain> EffectState<D> {
    /// Session start: online, idle, nothing pending.
    pub fn init(version: u64, model: D::Model) -> Self {
        Self {
            network: NetworkStatus::Online,
            mode: EffectMode::Idle,
            client: ClientState::new(version, model),
            server_version: version,
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

    pub fn can_start_dispatch(&self) -> bool {
        self.is_online() && self.is_idle() && self.has_pending()
    }

    pub fn mode_consistent(&self) -> bool {
        !self.mode.is_dispatching() || self.has_pending()
    }

    pub fn retries_bounded(&self) -> bool {
        match self.mode {
            EffectMode::Idle => true,
            EffectMode::Dispatching { retries } => retries <= MAX_RETRIES,
        }
    }

    pub fn invariant(&self) -> bool {
        self.mode_consistent() && self.retries_bounded()
    }

    pub fn progress(&self) -> ProgressMeasure {
        let retry_budget = match self.mode {
            EffectMode::Dispatching { retries } if retries <= MAX_RETRIES => MAX_RETRIES - retries,
            _ => 0,
        };
        ProgressMeasure {
            dispatching: self.mode.is_dispatching(),
            retry_budget,
            pending: self.client.pending_count(),
        }
    }

    /// The transition function.
    pub fn step(self, event: EffectEvent<D>) -> (Self, EffectCommand<D>) {
        match event {
            EffectEvent::UserAction { action } => {
                let client = self.client.local_dispatch(action);
                Self { client, ..self }.start_if_possible()
            }

            EffectEvent::DispatchAccepted {
                new_version,
                new_model,
            } => {
                if !self.mode.is_dispatching() {
                    return (self, EffectCommand::NoOp);
                }
                let client = self.client.accept_reply(new_version, new_model);
                Self {
                    mode: EffectMode::Idle,
                    client,
                    server_version: self.server_version.max(new_version),
                    ..self
                }
                .start_if_possible()
            }

            EffectEvent::DispatchConflict {
                fresh_version,
                fresh_model,
            } => {
                let EffectMode::Dispatching { retries } = self.mode else {
                    return (self, EffectCommand::NoOp);
                };
                if retries >= MAX_RETRIES {
                    return (
                        Self {
                            mode: EffectMode::Idle,
                            ..self
                        },
                        EffectCommand::NoOp,
                    );
                }
                // A fetch older than the client's base leaves the base alone and
                // the head is resent against it. The base never moves backwards.
                let client = self.client.handle_realtime_update(fresh_version, fresh_model);
                let next = Self {
                    mode: EffectMode::Dispatching {
                        retries: retries + 1,
                    },
                    client,
                    server_version: self.server_version.max(fresh_version),
                    ..self
                };
                match next.client.head().cloned() {
                    Some(action) => {
                        let base_version = next.client.base_version();
                        (
                            next,
                            EffectCommand::SendDispatch {
                                base_version,
                                action,
                            },
                        )
                    }
                    None => (
                        Self {
                            mode: EffectMode::Idle,
                            ..next
                        },
                        EffectCommand::NoOp,
                    ),
                }
            }

            EffectEvent::DispatchRejected {
                fresh_version,
                fresh_model,
            } => {
                if !self.mode.is_dispatching() {
                    return (self, EffectCommand::NoOp);
                }
                let client = self.client.reject_reply(fresh_version, fresh_model);
                Self {
                    mode: EffectMode::Idle,
                    client,
                    server_version: self.server_version.max(fresh_version),
                    ..self
                }
                .start_if_possible()
            }

            EffectEvent::RealtimeUpdate {
                server_version,
                server_model,
            } => {
                if !self.is_online() || self.mode.is_dispatching() {
                    return (self, EffectCommand::NoOp);
                }
                let client = self.client.handle_realtime_update(server_version, server_model);
                Self {
                    server_version: self.server_version.max(server_version),
                    client,
                    ..self
                }
                .start_if_possible()
            }

            EffectEvent::ResyncRequested => {
                if self.is_online() && self.is_idle() {
                    (self, EffectCommand::FetchFreshState)
                } else {
                    (self, EffectCommand::NoOp)
                }
            }

            EffectEvent::NetworkError | EffectEvent::ManualGoOffline => (
                Self {
                    network: NetworkStatus::Offline,
                    mode: EffectMode::Idle,
                    ..self
                },
                EffectCommand::NoOp,
            ),

            EffectEvent::NetworkRestored | EffectEvent::ManualGoOnline => Self {
                network: NetworkStatus::Online,
                ..self
            }
            .start_if_possible(),

            EffectEvent::Tick => self.start_if_possible(),
        }
    }

    fn start_if_possible(self) -> (Self, EffectCommand<D>) {
        if !self.can_start_dispatch() {
            return (self, EffectCommand::NoOp);
        }
        match self.client.head().cloned() {
            Some(action) => {
                let base_version = self.client.base_version();
                (
                    Self {
                        mode: EffectMode::Dispatching { retries: 0 },
                        ..self
                    },
                    EffectCommand::SendDispatch {
                        base_version,
                        action,
                    },
                )
            }
            None => (self, EffectCommand::NoOp),
        }
    }
}
