//! # Concord
//!
//! Optimistic multi-client collaboration over a single authoritative server.
//!
//! Clients apply actions locally right away and queue them. Each queued
//! action is sent with the server version the client last saw; the server
//! rebases it through everything applied since, tries a few fallback forms,
//! and either appends it to its log or rejects it. Clients then rebuild their
//! optimistic view from the server's answer.
//!
//! ## Core Concepts
//!
//! - [`Domain`] = the application model, plugged in through pure functions
//! - [`ServerState`] = authoritative model, applied log, audit trail
//! - [`ClientState`] = last server state plus pending actions folded on top
//! - [`EffectState`] = connectivity and retry state machine around a client
//! - [`MultiDomain`] = actions spanning resources, resolved into one log entry per changed resource
//!
//! ## Architecture
//!
//! ```text
//! EngineHandle ──► session task ──► EffectState::decide ──► EffectCommand
//!                        ▲                                       │
//!                        │                                       ▼
//!                        │                                  Transport
//!                        │                                       │
//!                        │                                       ▼
//!                        │                                 DispatchHub
//!                        │                                       │
//!                        │                        ┌──────────────┤
//!                        │                        ▼              ▼
//!                        │               ServerState::dispatch  ServerStore
//!                        │                        │
//!                        └──── Reply / push ◄─────┘
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Version is log length** - the server version equals the number of applied actions
//! 2. **Present is the fold of the log** - replaying the applied log reproduces the server model
//! 3. **FIFO confirmation** - every reply confirms or drops exactly the oldest pending action
//! 4. **Monotone base** - a client's base version never decreases
//! 5. **One flight** - a session has at most one dispatch outstanding
//! 6. **Bounded retries** - at most [`MAX_RETRIES`] conflicts per pending head
//!
//! ## Example
//!
//! ```ignore
//! use concord_core::{DispatchHub, EngineBuilder, InMemoryStore};
//!
//! let hub = Arc::new(DispatchHub::<TodoDomain, _>::new(InMemoryStore::new()));
//! let project = hub.create().await?;
//!
//! let handle = EngineBuilder::new(MyTransport::new(hub.clone(), project))
//!     .with_config(EngineConfig::default().with_tick_interval(Duration::from_secs(5)))
//!     .build()
//!     .start();
//!
//! handle.dispatch(TodoAction::AddList { name: "Inbox".into() }).await?;
//! let view = handle.wait_for(|v| v.is_settled()).await?;
//! ```

mod client;
mod config;
mod domain;
mod effect;
mod engine;
mod error;
mod hub;
mod machine;
mod multi;
mod multi_effect;
mod multi_session;
mod persistence;
mod server;
mod transport;

#[cfg(test)]
mod test_domain;

pub use client::{reapply_pending, ClientState};
pub use config::{EngineConfig, HubConfig};
pub use domain::{choose_candidate, rebase_through_suffix, replay, Candidates, Domain};
pub use effect::{
    EffectCommand, EffectEvent, EffectMode, EffectState, NetworkStatus, ProgressMeasure,
    MAX_RETRIES,
};
pub use engine::{Engine, EngineBuilder, EngineHandle, SessionView, SyncStatus};
pub use error::{EngineError, HubError, StoreError, TransportError};
pub use hub::{DispatchHub, ResourceId};
pub use machine::Machine;
pub use multi::{
    choose_multi_candidate, dispatch_multi, reapply_multi_pending, rebase_through_logs,
    try_multi_step, Effective, Models, MultiClientState, MultiDomain, MultiReply,
};
pub use multi_effect::{MultiEffectCommand, MultiEffectEvent, MultiEffectState};
pub use multi_session::MultiSession;
pub use persistence::{AuditEntry, InMemoryStore, ServerStore, SnapshotUpdate};
pub use server::{
    RejectReason, Reply, RequestOutcome, RequestRecord, ServerSnapshot, ServerState,
};
pub use transport::{
    DispatchOutcome, MultiDispatchOutcome, MultiTransport, Snapshot, Transport,
};

// Re-export commonly used external types
pub use async_trait::async_trait;
pub use smallvec::smallvec;
