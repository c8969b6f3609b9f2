//! Requests spanning several resources.
//!
//! A [`MultiDomain`] adds actions that read or write more than one resource
//! at once (moving a task between two projects, say). Every resource keeps
//! its own applied log: a multi-resource request is resolved into one
//! effective single-resource action per resource it changes, and that
//! action is what lands in the resource's log.
//!
//! ```text
//! (base_versions, action)
//!     │
//!     ├─► for each touched resource, in id order:
//!     │       rebase_multi through applied_log[base..], newest first
//!     │
//!     ├─► multi_candidates(models, rebased)
//!     │
//!     └─► first candidate that lowers and steps ──► Accepted
//!             │                                     changed resources get
//!             │                                     one log entry each
//!             └─► none ──► Rejected
//! ```

use crate::domain::{Candidates, Domain};
use crate::hub::ResourceId;
use crate::server::{RejectReason, ServerState};
use crate::transport::Snapshot;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;

/// Current model of each resource in play.
pub type Models<D> = BTreeMap<ResourceId, <D as Domain>::Model>;

/// One single-resource action per resource a request resolved to.
pub type Effective<D> = BTreeMap<ResourceId, <D as Domain>::Action>;

/// A domain whose actions can span resources.
///
/// Same purity rules as [`Domain`]. `lower` must only name resources that
/// `touched` reports, and a no-op form of a multi action (one that lowers to
/// actions changing nothing) must stay a no-op under `rebase_multi`.
pub trait MultiDomain: Domain {
    type MultiAction: Clone + PartialEq + Debug + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Every resource the action reads or writes.
    fn touched(action: &Self::MultiAction) -> BTreeSet<ResourceId>;

    /// Adjust `local` for `remote`, applied to `resource` after the sender's
    /// base version.
    fn rebase_multi(
        resource: ResourceId,
        remote: &Self::Action,
        local: &Self::MultiAction,
    ) -> Self::MultiAction;

    /// Forms of `action` to try against `models`, most faithful first.
    fn multi_candidates(
        models: &Models<Self>,
        action: &Self::MultiAction,
    ) -> Candidates<Self::MultiAction>;

    /// Resolve `action` into the single-resource actions that carry it out.
    fn lower(models: &Models<Self>, action: &Self::MultiAction) -> Result<Effective<Self>, Self::Err>;
}

/// Lower `action` and step every resource it resolves to.
///
/// Returns the updated models (untouched entries carried over) together with
/// the effective actions.
pub fn try_multi_step<D: MultiDomain>(
    models: &Models<D>,
    action: &D::MultiAction,
) -> Result<(Models<D>, Effective<D>), D::Err> {
    let effective = D::lower(models, action)?;
    let mut next = models.clone();
    for (id, single) in &effective {
        let model = models.get(id).ok_or_else(D::reject_err)?;
        next.insert(*id, D::try_step(model, single)?);
    }
    Ok((next, effective))
}

/// Try each candidate in order; the first one that steps wins.
pub fn choose_multi_candidate<D: MultiDomain>(
    models: &Models<D>,
    candidates: &[D::MultiAction],
) -> Result<(Models<D>, Effective<D>, D::MultiAction), D::Err> {
    candidates
        .iter()
        .find_map(|candidate| {
            try_multi_step::<D>(models, candidate)
                .ok()
                .map(|(next, effective)| (next, effective, candidate.clone()))
        })
        .ok_or_else(D::reject_err)
}

/// Rebase `action` through every resource's unseen log suffix.
///
/// Resources are visited in id order and each suffix newest first. A
/// resource missing from `base_versions` counts as fully seen.
pub fn rebase_through_logs<D: MultiDomain>(
    states: &BTreeMap<ResourceId, ServerState<D>>,
    base_versions: &BTreeMap<ResourceId, u64>,
    action: &D::MultiAction,
) -> D::MultiAction {
    states.iter().fold(action.clone(), |local, (id, state)| {
        let base = seen_version(state, base_versions.get(id));
        let suffix = state
            .applied_log()
            .skip(usize::try_from(base).unwrap_or(usize::MAX));
        suffix
            .iter()
            .rev()
            .fold(local, |acc, remote| D::rebase_multi(*id, remote, &acc))
    })
}

fn seen_version<D: Domain>(state: &ServerState<D>, base: Option<&u64>) -> u64 {
    base.copied().unwrap_or(u64::MAX).min(state.version())
}

/// The server's answer to one multi-resource dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case", bound = "")]
pub enum MultiReply<D: MultiDomain> {
    Accepted {
        /// Every touched resource after the request, changed or not.
        states: BTreeMap<ResourceId, Snapshot<D>>,
        applied: D::MultiAction,
        /// Resources whose log grew by one entry.
        changed: BTreeSet<ResourceId>,
    },
    Rejected {
        reason: RejectReason,
        rebased: D::MultiAction,
    },
}

impl<D: MultiDomain> MultiReply<D> {
    pub fn is_accepted(&self) -> bool {
        matches!(self, MultiReply::Accepted { .. })
    }
}

/// Apply one multi-resource request to the states of the resources it
/// touches.
///
/// Pure, like [`ServerState::dispatch`]; the caller holds every touched
/// resource and passes exactly those in `states`. Resources left unchanged
/// by the chosen candidate get no log entry.
pub fn dispatch_multi<D: MultiDomain>(
    states: &BTreeMap<ResourceId, ServerState<D>>,
    base_versions: &BTreeMap<ResourceId, u64>,
    orig: &D::MultiAction,
) -> (BTreeMap<ResourceId, ServerState<D>>, MultiReply<D>) {
    let rebased = rebase_through_logs(states, base_versions, orig);
    let models: Models<D> = states
        .iter()
        .map(|(id, state)| (*id, state.present().clone()))
        .collect();
    let candidates = D::multi_candidates(&models, &rebased);

    let Ok((next_models, effective, chosen)) = choose_multi_candidate::<D>(&models, &candidates)
    else {
        let reply = MultiReply::Rejected {
            reason: RejectReason::DomainInvalid,
            rebased,
        };
        return (states.clone(), reply);
    };

    let mut next = states.clone();
    let mut changed = BTreeSet::new();
    for (id, single) in effective {
        let (Some(state), Some(model)) = (states.get(&id), next_models.get(&id)) else {
            continue;
        };
        if model == state.present() {
            continue;
        }
        let base = seen_version(state, base_versions.get(&id));
        next.insert(id, state.commit(base, single, model.clone()));
        changed.insert(id);
    }

    let states = next
        .iter()
        .map(|(id, state)| {
            let snapshot = Snapshot {
                version: state.version(),
                model: state.present().clone(),
            };
            (*id, snapshot)
        })
        .collect();
    let reply = MultiReply::Accepted {
        states,
        applied: chosen,
        changed,
    };
    (next, reply)
}

/// Fold `pending` over `models`, skipping any action that no longer applies.
pub fn reapply_multi_pending<'a, D, I>(models: &Models<D>, pending: I) -> Models<D>
where
    D: MultiDomain,
    I: IntoIterator<Item = &'a D::MultiAction>,
{
    pending.into_iter().fold(models.clone(), |current, action| {
        match try_multi_step::<D>(&current, action) {
            Ok((next, _)) => next,
            Err(_) => current,
        }
    })
}

/// One client session's view of several resources.
///
/// Unlike [`crate::ClientState`], server states merge in per resource and
/// only ever forward, so replies and pushes can arrive in any order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct MultiClientState<D: MultiDomain> {
    bases: BTreeMap<ResourceId, Snapshot<D>>,
    present: Models<D>,
    pending: im::Vector<D::MultiAction>,
}

impl<D: MultiDomain> MultiClientState<D> {
    pub fn new(bases: BTreeMap<ResourceId, Snapshot<D>>) -> Self {
        let present = bases
            .iter()
            .map(|(id, snapshot)| (*id, snapshot.model.clone()))
            .collect();
        Self {
            bases,
            present,
            pending: im::Vector::new(),
        }
    }

    pub fn base_version(&self, resource: ResourceId) -> Option<u64> {
        self.bases.get(&resource).map(|snapshot| snapshot.version)
    }

    pub fn bases(&self) -> &BTreeMap<ResourceId, Snapshot<D>> {
        &self.bases
    }

    /// The optimistic models: bases with pending applied.
    pub fn present(&self) -> &Models<D> {
        &self.present
    }

    pub fn pending(&self) -> &im::Vector<D::MultiAction> {
        &self.pending
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn head(&self) -> Option<&D::MultiAction> {
        self.pending.front()
    }

    /// Base versions to send with `action`: the tracked ones it touches.
    pub fn base_versions_for(&self, action: &D::MultiAction) -> BTreeMap<ResourceId, u64> {
        D::touched(action)
            .into_iter()
            .filter_map(|id| Some((id, self.base_version(id)?)))
            .collect()
    }

    /// Apply `action` optimistically and queue it.
    pub fn local_dispatch(&self, action: D::MultiAction) -> Self {
        let present = match try_multi_step::<D>(&self.present, &action) {
            Ok((next, _)) => next,
            Err(_) => self.present.clone(),
        };
        let mut pending = self.pending.clone();
        pending.push_back(action);
        Self {
            bases: self.bases.clone(),
            present,
            pending,
        }
    }

    /// The head was settled, accepted or rejected; merge what the server
    /// sent and drop it.
    pub fn settle_head(&self, fresh: &BTreeMap<ResourceId, Snapshot<D>>) -> Self {
        let rest = self.pending.skip(1.min(self.pending.len()));
        self.merged(fresh, rest)
    }

    /// Merge fresh server state and keep the queue as is.
    pub fn refresh(&self, fresh: &BTreeMap<ResourceId, Snapshot<D>>) -> Self {
        self.merged(fresh, self.pending.clone())
    }

    /// Out-of-band push for one resource. Only ever moves it forward.
    pub fn handle_realtime_update(&self, resource: ResourceId, snapshot: Snapshot<D>) -> Self {
        self.refresh(&BTreeMap::from([(resource, snapshot)]))
    }

    fn merged(
        &self,
        fresh: &BTreeMap<ResourceId, Snapshot<D>>,
        pending: im::Vector<D::MultiAction>,
    ) -> Self {
        let mut bases = self.bases.clone();
        for (id, snapshot) in fresh {
            let newer = bases
                .get(id)
                .map_or(true, |known| snapshot.version > known.version);
            if newer {
                bases.insert(*id, snapshot.clone());
            }
        }
        let models = bases
            .iter()
            .map(|(id, snapshot)| (*id, snapshot.model.clone()))
            .collect();
        Self {
            present: reapply_multi_pending::<D, _>(&models, &pending),
            bases,
            pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_domain::{shelf, Shelf, ShelfAction, ShelfMove};
    use uuid::Uuid;

    fn two_shelves() -> (ResourceId, ResourceId) {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        if a < b {
            (a, b)
        } else {
            (b, a)
        }
    }

    fn server_with(actions: &[ShelfAction]) -> ServerState<Shelf> {
        actions
            .iter()
            .enumerate()
            .fold(ServerState::new(), |state, (i, action)| {
                state.dispatch(i as u64, action.clone()).0
            })
    }

    #[test]
    fn transfer_lands_once_in_each_log() {
        let (a, b) = two_shelves();
        let states = BTreeMap::from([
            (a, server_with(&[ShelfAction::Add(1), ShelfAction::Add(2)])),
            (b, server_with(&[ShelfAction::Add(9)])),
        ]);
        let bases = BTreeMap::from([(a, 2), (b, 1)]);

        let (next, reply) = dispatch_multi(
            &states,
            &bases,
            &ShelfMove::Transfer {
                item: 1,
                from: a,
                to: b,
            },
        );

        let MultiReply::Accepted { states: snapshots, changed, .. } = reply else {
            panic!("transfer rejected");
        };
        assert_eq!(changed, BTreeSet::from([a, b]));
        assert_eq!(snapshots[&a].version, 3);
        assert_eq!(snapshots[&a].model, shelf(&[2]));
        assert_eq!(snapshots[&b].model, shelf(&[9, 1]));
        assert_eq!(next[&a].applied_log().back(), Some(&ShelfAction::Take(1)));
        assert_eq!(next[&b].applied_log().back(), Some(&ShelfAction::Add(1)));
        assert!(next.values().all(ServerState::verify));
    }

    #[test]
    fn transfer_of_concurrently_taken_item_is_a_noop() {
        let (a, b) = two_shelves();
        let states = BTreeMap::from([
            (a, server_with(&[ShelfAction::Add(1), ShelfAction::Take(1)])),
            (b, ServerState::new()),
        ]);
        let bases = BTreeMap::from([(a, 1), (b, 0)]);

        let (next, reply) = dispatch_multi(
            &states,
            &bases,
            &ShelfMove::Transfer {
                item: 1,
                from: a,
                to: b,
            },
        );

        let MultiReply::Accepted { changed, applied, .. } = reply else {
            panic!("no-op rejected");
        };
        assert!(changed.is_empty());
        assert_eq!(applied, ShelfMove::On(a, ShelfAction::NoOp));
        assert_eq!(next, states);
    }

    #[test]
    fn failing_transfer_is_rejected_without_changes() {
        let (a, b) = two_shelves();
        let states = BTreeMap::from([
            (a, server_with(&[ShelfAction::Add(1)])),
            (b, server_with(&[ShelfAction::Add(1)])),
        ]);

        let (next, reply) = dispatch_multi(
            &states,
            &BTreeMap::new(),
            &ShelfMove::Transfer {
                item: 1,
                from: a,
                to: b,
            },
        );

        assert!(matches!(
            reply,
            MultiReply::Rejected {
                reason: RejectReason::DomainInvalid,
                ..
            }
        ));
        assert_eq!(next, states);
    }

    #[test]
    fn missing_base_version_means_nothing_unseen() {
        let (a, _) = two_shelves();
        let states = BTreeMap::from([(
            a,
            server_with(&[ShelfAction::Add(3), ShelfAction::Remove(3)]),
        )]);
        let local = ShelfMove::On(
            a,
            ShelfAction::Place {
                item: 1,
                after: Some(3),
            },
        );

        assert_eq!(rebase_through_logs(&states, &BTreeMap::new(), &local), local);
        assert_eq!(
            rebase_through_logs(&states, &BTreeMap::from([(a, 0)]), &local),
            ShelfMove::On(
                a,
                ShelfAction::Place {
                    item: 1,
                    after: None
                }
            )
        );
    }

    #[test]
    fn client_merges_forward_only_and_replays_pending() {
        let (a, b) = two_shelves();
        let client = MultiClientState::<Shelf>::new(BTreeMap::from([
            (a, Snapshot { version: 1, model: shelf(&[1]) }),
            (b, Snapshot { version: 0, model: shelf(&[]) }),
        ]));
        let client = client.local_dispatch(ShelfMove::Transfer {
            item: 1,
            from: a,
            to: b,
        });
        assert_eq!(client.present()[&b], shelf(&[1]));
        assert_eq!(client.base_versions_for(client.head().unwrap()), BTreeMap::from([(a, 1), (b, 0)]));

        let stale = client.handle_realtime_update(a, Snapshot { version: 0, model: shelf(&[]) });
        assert_eq!(stale, client);

        let pushed = client.handle_realtime_update(b, Snapshot { version: 1, model: shelf(&[5]) });
        assert_eq!(pushed.base_version(b), Some(1));
        assert_eq!(pushed.present()[&b], shelf(&[5, 1]));
        assert_eq!(pushed.pending_count(), 1);

        let settled = pushed.settle_head(&BTreeMap::from([
            (a, Snapshot { version: 2, model: shelf(&[]) }),
            (b, Snapshot { version: 2, model: shelf(&[5, 1]) }),
        ]));
        assert_eq!(settled.pending_count(), 0);
        assert_eq!(settled.present()[&a], shelf(&[]));
        assert_eq!(settled.present()[&b], shelf(&[5, 1]));
    }
}
