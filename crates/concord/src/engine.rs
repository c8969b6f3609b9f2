//! Async session engine.
//!
//! The engine drives one client session: it owns the [`EffectState`], feeds
//! every event through [`Machine::decide`], and executes the resulting
//! commands against a [`Transport`]. Command outcomes come back as events
//! through the same channel, so the state machine only ever sees one event
//! at a time.
//!
//! ```text
//! EngineHandle ──(user / connectivity events)──┐
//!                                              ▼
//!                                       session task
//!                                              │
//!                                              ├─► EffectState.decide(event)
//!                                              │        │
//!                                              │        └─► Some(command)
//!                                              │                 │
//!                                              │                 ▼
//!                                              │          spawned execution
//!                                              │          Transport.dispatch / fetch_state
//!                                              │                 │
//!                                              │   completion ◄──┘ (tagged with epoch)
//!                                              │
//!                                              └─► watch<SessionView> ──► subscribers
//! ```
//!
//! Every `SendDispatch` opens a new epoch. A completion from an older epoch
//! belongs to a request the state machine already abandoned (it went offline
//! or started over) and is dropped.

use crate::config::EngineConfig;
use crate::domain::Domain;
use crate::effect::{EffectCommand, EffectEvent, EffectMode, EffectState, NetworkStatus, MAX_RETRIES};
use crate::error::EngineError;
use crate::machine::Machine;
use crate::server::Reply;
use crate::transport::{DispatchOutcome, Snapshot, Transport};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

// ============================================================================
// Session view
// ============================================================================

/// Coarse synchronization status for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncStatus {
    /// Nothing pending; the view matches the last known server state.
    Synced,
    /// Local changes are waiting for or being confirmed by the server.
    Pending,
    /// Disconnected; local changes are queued.
    Offline,
    /// The server kept conflicting and the session stopped retrying. The
    /// queue is kept and the next tick, reconnect or new action tries again.
    Exhausted,
}

/// Everything a UI needs to render one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct SessionView<D: Domain> {
    pub present: D::Model,
    pub base_version: u64,
    pub server_version: u64,
    pub pending: usize,
    pub network: NetworkStatus,
    pub mode: EffectMode,
    pub status: SyncStatus,
}

impl<D: Domain> SessionView<D> {
    fn of(state: &EffectState<D>, exhausted: bool) -> Self {
        let pending = state.client.pending_count();
        let status = if !state.is_online() {
            SyncStatus::Offline
        } else if exhausted {
            SyncStatus::Exhausted
        } else if pending > 0 {
            SyncStatus::Pending
        } else {
            SyncStatus::Synced
        };
        Self {
            present: state.client.present().clone(),
            base_version: state.client.base_version(),
            server_version: state.server_version,
            pending,
            network: state.network,
            mode: state.mode,
            status,
        }
    }

    /// Online, idle and with nothing pending.
    pub fn is_settled(&self) -> bool {
        self.status == SyncStatus::Synced && self.mode == EffectMode::Idle
    }
}

// ============================================================================
// Builder
// ============================================================================

pub struct EngineBuilder<D: Domain, T: Transport<D>> {
    transport: Arc<T>,
    config: EngineConfig,
    initial: Option<Snapshot<D>>,
}

impl<D: Domain, T: Transport<D>> EngineBuilder<D, T> {
    pub fn new(transport: T) -> Self {
        Self::from_shared(Arc::new(transport))
    }

    pub fn from_shared(transport: Arc<T>) -> Self {
        Self {
            transport,
            config: EngineConfig::default(),
            initial: None,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Start from a known server state instead of version 0.
    pub fn with_initial(mut self, version: u64, model: D::Model) -> Self {
        self.initial = Some(Snapshot { version, model });
        self
    }

    pub fn build(self) -> Engine<D, T> {
        let Snapshot { version, model } = self.initial.unwrap_or_else(|| Snapshot {
            version: 0,
            model: D::init(),
        });
        let mut state = EffectState::init(version, model);
        if self.config.start_offline {
            state.network = NetworkStatus::Offline;
        }
        Engine {
            transport: self.transport,
            config: self.config,
            state,
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

/// A configured session that has not started yet.
pub struct Engine<D: Domain, T: Transport<D>> {
    transport: Arc<T>,
    config: EngineConfig,
    state: EffectState<D>,
}

enum Input<D: Domain> {
    Event(EffectEvent<D>),
    /// Outcome of the dispatch opened in `epoch`.
    Completed { epoch: u64, event: EffectEvent<D> },
    Shutdown,
}

impl<D: Domain, T: Transport<D>> Engine<D, T> {
    /// Spawn the session task (and the ticker, if configured).
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self) -> EngineHandle<D> {
        let (tx, rx) = mpsc::channel(self.config.event_buffer.max(1));
        let (view_tx, view_rx) = watch::channel(SessionView::of(&self.state, false));

        if let Some(interval) = self.config.tick_interval() {
            tokio::spawn(run_ticker::<D>(tx.downgrade(), interval));
        }

        let session = Session {
            transport: self.transport,
            state: self.state,
            epoch: 0,
            exhausted: false,
            inbox: tx.downgrade(),
            view: view_tx,
        };
        tokio::spawn(session.run(rx));

        EngineHandle { tx, view: view_rx }
    }
}

async fn run_ticker<D: Domain>(inbox: mpsc::WeakSender<Input<D>>, interval: std::time::Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(tx) = inbox.upgrade() else {
            return;
        };
        if tx.send(Input::Event(EffectEvent::Tick)).await.is_err() {
            return;
        }
    }
}

// ============================================================================
// Session task
// ============================================================================

struct Session<D: Domain, T: Transport<D>> {
    transport: Arc<T>,
    state: EffectState<D>,
    epoch: u64,
    exhausted: bool,
    inbox: mpsc::WeakSender<Input<D>>,
    view: watch::Sender<SessionView<D>>,
}

impl<D: Domain, T: Transport<D>> Session<D, T> {
    async fn run(mut self, mut rx: mpsc::Receiver<Input<D>>) {
        debug!(base_version = self.state.client.base_version(), "session started");
        while let Some(input) = rx.recv().await {
            match input {
                Input::Event(event) => self.handle(event),
                Input::Completed { epoch, event } if epoch == self.epoch => self.handle(event),
                Input::Completed { epoch, .. } => {
                    debug!(epoch, current = self.epoch, "dropping completion of abandoned dispatch");
                }
                Input::Shutdown => break,
            }
        }
        debug!(pending = self.state.client.pending_count(), "session stopped");
    }

    fn handle(&mut self, event: EffectEvent<D>) {
        let gives_up = matches!(event, EffectEvent::DispatchConflict { .. })
            && self.state.mode == EffectMode::Dispatching { retries: MAX_RETRIES };
        let was_online = self.state.is_online();

        match self.state.decide(&event) {
            Some(EffectCommand::SendDispatch {
                base_version,
                action,
            }) => {
                self.exhausted = false;
                self.epoch += 1;
                self.spawn_dispatch(self.epoch, base_version, action);
            }
            Some(EffectCommand::FetchFreshState) => self.spawn_fetch(),
            Some(EffectCommand::NoOp) | None => {}
        }

        if gives_up {
            warn!(
                retries = MAX_RETRIES,
                pending = self.state.client.pending_count(),
                "giving up after repeated conflicts"
            );
            self.exhausted = true;
        }
        if !self.state.has_pending() {
            self.exhausted = false;
        }
        match (was_online, self.state.is_online()) {
            (true, false) => info!(pending = self.state.client.pending_count(), "session offline"),
            (false, true) => info!(pending = self.state.client.pending_count(), "session online"),
            _ => {}
        }

        self.view.send_replace(SessionView::of(&self.state, self.exhausted));
    }

    fn spawn_dispatch(&self, epoch: u64, base_version: u64, action: D::Action) {
        let transport = self.transport.clone();
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            let event = execute_dispatch(transport.as_ref(), base_version, action).await;
            if let Some(tx) = inbox.upgrade() {
                let _ = tx.send(Input::Completed { epoch, event }).await;
            }
        });
    }

    fn spawn_fetch(&self) {
        let transport = self.transport.clone();
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            let event = match transport.fetch_state().await {
                Ok(snapshot) => EffectEvent::RealtimeUpdate {
                    server_version: snapshot.version,
                    server_model: snapshot.model,
                },
                Err(err) => {
                    warn!(error = %err, "fetching fresh state failed");
                    EffectEvent::NetworkError
                }
            };
            if let Some(tx) = inbox.upgrade() {
                let _ = tx.send(Input::Event(event)).await;
            }
        });
    }
}

/// Run one dispatch round trip and translate it into the event the state
/// machine expects. Rejections and conflicts fetch fresh state first.
async fn execute_dispatch<D: Domain, T: Transport<D> + ?Sized>(
    transport: &T,
    base_version: u64,
    action: D::Action,
) -> EffectEvent<D> {
    let outcome = match transport.dispatch(base_version, action).await {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(base_version, error = %err, "dispatch failed");
            return EffectEvent::NetworkError;
        }
    };

    let rejected = match outcome {
        DispatchOutcome::Replied {
            reply:
                Reply::Accepted {
                    new_version,
                    new_present,
                    ..
                },
        } => {
            return EffectEvent::DispatchAccepted {
                new_version,
                new_model: new_present,
            }
        }
        DispatchOutcome::Replied {
            reply: Reply::Rejected { reason, .. },
        } => {
            warn!(base_version, %reason, "action rejected by server");
            true
        }
        DispatchOutcome::Conflict => {
            debug!(base_version, "server reported conflict");
            false
        }
    };

    match transport.fetch_state().await {
        Ok(Snapshot { version, model }) if rejected => EffectEvent::DispatchRejected {
            fresh_version: version,
            fresh_model: model,
        },
        Ok(Snapshot { version, model }) => EffectEvent::DispatchConflict {
            fresh_version: version,
            fresh_model: model,
        },
        Err(err) => {
            warn!(base_version, error = %err, "fetching fresh state failed");
            EffectEvent::NetworkError
        }
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Cloneable handle to a running session.
#[derive(Clone)]
pub struct EngineHandle<D: Domain> {
    tx: mpsc::Sender<Input<D>>,
    view: watch::Receiver<SessionView<D>>,
}

impl<D: Domain> EngineHandle<D> {
    /// Apply `action` locally and queue it for the server.
    pub async fn dispatch(&self, action: D::Action) -> Result<(), EngineError> {
        self.emit(EffectEvent::UserAction { action }).await
    }

    pub async fn go_offline(&self) -> Result<(), EngineError> {
        self.emit(EffectEvent::ManualGoOffline).await
    }

    pub async fn go_online(&self) -> Result<(), EngineError> {
        self.emit(EffectEvent::ManualGoOnline).await
    }

    /// Report a connectivity loss detected outside the engine.
    pub async fn network_lost(&self) -> Result<(), EngineError> {
        self.emit(EffectEvent::NetworkError).await
    }

    pub async fn network_restored(&self) -> Result<(), EngineError> {
        self.emit(EffectEvent::NetworkRestored).await
    }

    /// Deliver a realtime push from the server.
    pub async fn push_update(&self, version: u64, model: D::Model) -> Result<(), EngineError> {
        self.emit(EffectEvent::RealtimeUpdate {
            server_version: version,
            server_model: model,
        })
        .await
    }

    /// Ask the server for its current state.
    pub async fn resync(&self) -> Result<(), EngineError> {
        self.emit(EffectEvent::ResyncRequested).await
    }

    pub async fn tick(&self) -> Result<(), EngineError> {
        self.emit(EffectEvent::Tick).await
    }

    /// The latest published view.
    pub fn view(&self) -> SessionView<D> {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionView<D>> {
        self.view.clone()
    }

    /// Wait until the published view satisfies `predicate`.
    pub async fn wait_for<F>(&self, predicate: F) -> Result<SessionView<D>, EngineError>
    where
        F: FnMut(&SessionView<D>) -> bool,
    {
        let mut view = self.view.clone();
        let matched = view.wait_for(predicate).await.map_err(|_| EngineError::Closed)?;
        Ok(matched.clone())
    }

    /// Stop the session and wait for it to finish. Pending actions are
    /// dropped with it.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.tx
            .send(Input::Shutdown)
            .await
            .map_err(|_| EngineError::Closed)?;
        let mut view = self.view.clone();
        while view.changed().await.is_ok() {}
        Ok(())
    }

    async fn emit(&self, event: EffectEvent<D>) -> Result<(), EngineError> {
        self.tx
            .send(Input::Event(event))
            .await
            .map_err(|_| EngineError::Closed)
    }
}
