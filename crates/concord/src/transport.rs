//! The client side of the wire.

use crate::domain::Domain;
use crate::error::TransportError;
use crate::hub::ResourceId;
use crate::multi::{MultiDomain, MultiReply};
use crate::server::Reply;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A server model at a known version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Snapshot<D: Domain> {
    pub version: u64,
    pub model: D::Model,
}

/// What came back from a dispatch request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", bound = "")]
pub enum DispatchOutcome<D: Domain> {
    /// The server ran the protocol and answered.
    Replied { reply: Reply<D> },
    /// The server's storage lost an optimistic-lock race; retry on fresh state.
    Conflict,
}

/// How a session reaches its server.
///
/// Implementations carry no protocol logic: they move requests and replies.
/// Every `Err` is treated as a connectivity failure.
#[async_trait]
pub trait Transport<D: Domain>: Send + Sync + 'static {
    async fn dispatch(
        &self,
        base_version: u64,
        action: D::Action,
    ) -> Result<DispatchOutcome<D>, TransportError>;

    async fn fetch_state(&self) -> Result<Snapshot<D>, TransportError>;
}

/// What came back from a multi-resource dispatch request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", bound = "")]
pub enum MultiDispatchOutcome<D: MultiDomain> {
    Replied { reply: MultiReply<D> },
    /// Some touched resource lost an optimistic-lock race.
    Conflict,
}

/// How a multi-resource session reaches its server.
#[async_trait]
pub trait MultiTransport<D: MultiDomain>: Send + Sync + 'static {
    async fn dispatch_multi(
        &self,
        base_versions: BTreeMap<ResourceId, u64>,
        action: D::MultiAction,
    ) -> Result<MultiDispatchOutcome<D>, TransportError>;

    async fn fetch_states(
        &self,
        resources: &BTreeSet<ResourceId>,
    ) -> Result<BTreeMap<ResourceId, Snapshot<D>>, TransportError>;
}
