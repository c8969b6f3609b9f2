//! Server dispatch engine.
//!
//! The server owns the authoritative model, the ordered log of every action
//! it has applied (whose length is the protocol version), and an audit trail
//! of every dispatch attempt. [`ServerState::dispatch`] is the whole protocol
//! surface:
//!
//! ```text
//! client ──(base_version, action)──► suffix = applied_log[base_version..]
//!                                    rebased = rebase_through_suffix(suffix, action)
//!                                    candidates = D::candidates(present, rebased)
//!                                    first candidate that try_steps ──► Accepted
//!                                    none                         ──► Rejected
//! ```
//!
//! Dispatch is pure and synchronous. Calls against one resource must be
//! serialized by the caller (see [`crate::DispatchHub`]).

use crate::domain::{choose_candidate, rebase_through_suffix, replay, Domain};
use serde::{Deserialize, Serialize};

/// Why the server refused an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectReason {
    /// No candidate form of the rebased action applies to the current model.
    DomainInvalid,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::DomainInvalid => f.write_str("no valid interpretation of action"),
        }
    }
}

/// The server's answer to one dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case", bound = "")]
pub enum Reply<D: Domain> {
    Accepted {
        new_version: u64,
        new_present: D::Model,
        applied: D::Action,
        /// The chosen candidate left the model unchanged (a harmless replay).
        no_change: bool,
    },
    Rejected {
        reason: RejectReason,
        rebased: D::Action,
    },
}

impl<D: Domain> Reply<D> {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Reply::Accepted { .. })
    }
}

/// Outcome half of an audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case", bound = "")]
pub enum RequestOutcome<D: Domain> {
    AuditAccepted { applied: D::Action, no_change: bool },
    AuditRejected { reason: RejectReason, rebased: D::Action },
}

/// One dispatch attempt, accepted or not. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct RequestRecord<D: Domain> {
    pub base_version: u64,
    pub orig: D::Action,
    pub rebased: D::Action,
    pub chosen: D::Action,
    pub outcome: RequestOutcome<D>,
}

/// The durable part of a server state: enough to continue dispatching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct ServerSnapshot<D: Domain> {
    pub present: D::Model,
    pub applied_log: im::Vector<D::Action>,
}

impl<D: Domain> ServerSnapshot<D> {
    pub fn version(&self) -> u64 {
        self.applied_log.len() as u64
    }
}

/// Authoritative state of one server-managed resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct ServerState<D: Domain> {
    present: D::Model,
    applied_log: im::Vector<D::Action>,
    audit_log: im::Vector<RequestRecord<D>>,
}

impl<D: Domain> Default for ServerState<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Domain> ServerState<D> {
    /// A fresh resource at version 0.
    pub fn new() -> Self {
        Self {
            present: D::init(),
            applied_log: im::Vector::new(),
            audit_log: im::Vector::new(),
        }
    }

    /// Resume from persisted state. The audit trail is not part of the
    /// snapshot and starts empty.
    pub fn from_snapshot(snapshot: ServerSnapshot<D>) -> Self {
        Self {
            present: snapshot.present,
            applied_log: snapshot.applied_log,
            audit_log: im::Vector::new(),
        }
    }

    pub fn snapshot(&self) -> ServerSnapshot<D> {
        ServerSnapshot {
            present: self.present.clone(),
            applied_log: self.applied_log.clone(),
        }
    }

    /// The protocol version: number of actions ever applied.
    pub fn version(&self) -> u64 {
        self.applied_log.len() as u64
    }

    pub fn present(&self) -> &D::Model {
        &self.present
    }

    pub fn applied_log(&self) -> &im::Vector<D::Action> {
        &self.applied_log
    }

    pub fn audit_log(&self) -> &im::Vector<RequestRecord<D>> {
        &self.audit_log
    }

    /// Check that `present` is the strict fold of `applied_log` over the
    /// domain's initial model.
    pub fn verify(&self) -> bool {
        matches!(replay::<D, _>(&D::init(), &self.applied_log), Ok(model) if model == self.present)
    }

    /// Apply one client request.
    ///
    /// A `base_version` beyond the current version has no unseen suffix and
    /// is rebased through nothing; callers that can refuse such requests
    /// should do so before dispatching.
    pub fn dispatch(&self, base_version: u64, orig: D::Action) -> (Self, Reply<D>) {
        let base = usize::try_from(base_version)
            .unwrap_or(usize::MAX)
            .min(self.applied_log.len());
        let suffix = self.applied_log.skip(base);
        let rebased = rebase_through_suffix::<D, _>(&suffix, &orig);
        let candidates = D::candidates(&self.present, &rebased);

        match choose_candidate::<D>(&self.present, &candidates) {
            Ok((next, chosen)) => {
                let no_change = next == self.present;
                let mut applied_log = self.applied_log.clone();
                applied_log.push_back(chosen.clone());
                let mut audit_log = self.audit_log.clone();
                audit_log.push_back(RequestRecord {
                    base_version,
                    orig,
                    rebased,
                    chosen: chosen.clone(),
                    outcome: RequestOutcome::AuditAccepted {
                        applied: chosen.clone(),
                        no_change,
                    },
                });
                let new_version = applied_log.len() as u64;
                let state = Self {
                    present: next.clone(),
                    applied_log,
                    audit_log,
                };
                let reply = Reply::Accepted {
                    new_version,
                    new_present: next,
                    applied: chosen,
                    no_change,
                };
                (state, reply)
            }
            Err(_) => {
                let reason = RejectReason::DomainInvalid;
                let mut audit_log = self.audit_log.clone();
                audit_log.push_back(RequestRecord {
                    base_version,
                    orig,
                    rebased: rebased.clone(),
                    chosen: rebased.clone(),
                    outcome: RequestOutcome::AuditRejected {
                        reason,
                        rebased: rebased.clone(),
                    },
                });
                let state = Self {
                    present: self.present.clone(),
                    applied_log: self.applied_log.clone(),
                    audit_log,
                };
                (state, Reply::Rejected { reason, rebased })
            }
        }
    }

    /// Append `effective`, already checked to step `present` to `next`.
    ///
    /// Used when the action was resolved outside [`ServerState::dispatch`],
    /// as one resource's share of a multi-resource request.
    pub(crate) fn commit(&self, base_version: u64, effective: D::Action, next: D::Model) -> Self {
        let no_change = next == self.present;
        let mut applied_log = self.applied_log.clone();
        applied_log.push_back(effective.clone());
        let mut audit_log = self.audit_log.clone();
        audit_log.push_back(RequestRecord {
            base_version,
            orig: effective.clone(),
            rebased: effective.clone(),
            chosen: effective.clone(),
            outcome: RequestOutcome::AuditAccepted {
                applied: effective,
                no_change,
            },
        });
        Self {
            present: next,
            applied_log,
            audit_log,
        }
    }
}
