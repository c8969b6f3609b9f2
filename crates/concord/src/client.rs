//! Client reconciliation engine.
//!
//! A client keeps an optimistic copy of the model: the last server state it
//! synchronized against (`base_version`), with every locally-applied but
//! unconfirmed action (`pending`) folded on top. Replies and realtime pushes
//! move the base forward; the pending queue is replayed over the new base.

use crate::domain::Domain;
use crate::server::ServerState;
use serde::{Deserialize, Serialize};

/// Fold `pending` over `model`, skipping any action that no longer applies.
pub fn reapply_pending<'a, D, I>(model: &D::Model, pending: I) -> D::Model
where
    D: Domain,
    I: IntoIterator<Item = &'a D::Action>,
{
    pending
        .into_iter()
        .fold(model.clone(), |current, action| {
            D::try_step(&current, action).unwrap_or(current)
        })
}

/// One client session's view of a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct ClientState<D: Domain> {
    base_version: u64,
    present: D::Model,
    pending: im::Vector<D::Action>,
}

impl<D: Domain> ClientState<D> {
    /// A client synchronized at `version` with nothing pending.
    pub fn new(base_version: u64, model: D::Model) -> Self {
        Self {
            base_version,
            present: model,
            pending: im::Vector::new(),
        }
    }

    pub fn from_server(server: &ServerState<D>) -> Self {
        Self::new(server.version(), server.present().clone())
    }

    pub fn base_version(&self) -> u64 {
        self.base_version
    }

    /// The optimistic model: base with pending applied.
    pub fn present(&self) -> &D::Model {
        &self.present
    }

    pub fn pending(&self) -> &im::Vector<D::Action> {
        &self.pending
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// The next action to dispatch.
    pub fn head(&self) -> Option<&D::Action> {
        self.pending.front()
    }

    /// Apply `action` optimistically and queue it for the server.
    ///
    /// The action is queued even when it fails locally: the server's model
    /// may differ and accept it, and a genuine rejection resynchronizes the
    /// client anyway.
    pub fn local_dispatch(&self, action: D::Action) -> Self {
        let present = D::try_step(&self.present, &action).unwrap_or_else(|_| self.present.clone());
        let mut pending = self.pending.clone();
        pending.push_back(action);
        Self {
            base_version: self.base_version,
            present,
            pending,
        }
    }

    /// The pending head was accepted; rebuild on the server's new model.
    pub fn accept_reply(&self, new_version: u64, new_present: D::Model) -> Self {
        self.rebase_onto(new_version, new_present)
    }

    /// The pending head was rejected; rebuild on freshly fetched state.
    pub fn reject_reply(&self, fresh_version: u64, fresh_model: D::Model) -> Self {
        self.rebase_onto(fresh_version, fresh_model)
    }

    /// Out-of-band push. Only ever moves the client forward.
    pub fn handle_realtime_update(&self, server_version: u64, server_model: D::Model) -> Self {
        if server_version <= self.base_version {
            return self.clone();
        }
        Self {
            base_version: server_version,
            present: reapply_pending::<D, _>(&server_model, &self.pending),
            pending: self.pending.clone(),
        }
    }

    fn rebase_onto(&self, version: u64, model: D::Model) -> Self {
        let rest = self.pending.skip(1.min(self.pending.len()));
        Self {
            base_version: version,
            present: reapply_pending::<D, _>(&model, &rest),
            pending: rest,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Reply;
    use crate::test_domain::{shelf, Shelf, ShelfAction};

    #[test]
    fn local_dispatch_applies_and_queues() {
        let client = ClientState::<Shelf>::new(0, shelf(&[]));
        let client = client.local_dispatch(ShelfAction::Add(1));

        assert_eq!(client.present(), &shelf(&[1]));
        assert_eq!(client.pending_count(), 1);
        assert_eq!(client.head(), Some(&ShelfAction::Add(1)));
        assert_eq!(client.base_version(), 0);
    }

    #[test]
    fn failed_local_dispatch_still_queues() {
        let client = ClientState::<Shelf>::new(3, shelf(&[1]));
        let client = client.local_dispatch(ShelfAction::Take(9));

        assert_eq!(client.present(), &shelf(&[1]));
        assert_eq!(client.pending().iter().cloned().collect::<Vec<_>>(), vec![ShelfAction::Take(9)]);
    }

    #[test]
    fn reapply_skips_actions_that_no_longer_apply() {
        let pending = vec![ShelfAction::Add(1), ShelfAction::Take(5), ShelfAction::Add(2)];
        let model = reapply_pending::<Shelf, _>(&shelf(&[]), &pending);
        assert_eq!(model, shelf(&[1, 2]));
    }

    #[test]
    fn accept_reply_pops_head_and_reapplies_tail() {
        let client = ClientState::<Shelf>::new(0, shelf(&[]))
            .local_dispatch(ShelfAction::Add(1))
            .local_dispatch(ShelfAction::Add(2));

        // Server accepted Add(1) on top of someone else's Add(7).
        let client = client.accept_reply(2, shelf(&[7, 1]));

        assert_eq!(client.base_version(), 2);
        assert_eq!(client.present(), &shelf(&[7, 1, 2]));
        assert_eq!(client.pending().iter().cloned().collect::<Vec<_>>(), vec![ShelfAction::Add(2)]);
    }

    #[test]
    fn reject_reply_drops_head_unconditionally() {
        let client = ClientState::<Shelf>::new(1, shelf(&[1]))
            .local_dispatch(ShelfAction::Take(1))
            .local_dispatch(ShelfAction::Add(3));

        let client = client.reject_reply(2, shelf(&[2]));

        assert_eq!(client.base_version(), 2);
        assert_eq!(client.present(), &shelf(&[2, 3]));
        assert_eq!(client.pending_count(), 1);
    }

    #[test]
    fn reply_with_empty_pending_just_moves_base() {
        let client = ClientState::<Shelf>::new(0, shelf(&[]));
        let client = client.accept_reply(4, shelf(&[4]));
        assert_eq!(client, ClientState::new(4, shelf(&[4])));
    }

    #[test]
    fn realtime_update_never_moves_backward() {
        let client = ClientState::<Shelf>::new(5, shelf(&[1])).local_dispatch(ShelfAction::Add(2));

        let same = client.handle_realtime_update(5, shelf(&[]));
        assert_eq!(same, client);

        let older = client.handle_realtime_update(3, shelf(&[]));
        assert_eq!(older, client);

        let newer = client.handle_realtime_update(6, shelf(&[1, 9]));
        assert_eq!(newer.base_version(), 6);
        assert_eq!(newer.present(), &shelf(&[1, 9, 2]));
        assert_eq!(newer.pending(), client.pending());
    }

    /// Drive a client against a real server with random interleavings of
    /// local actions, replies and foreign writes.
    #[test]
    fn fifo_confirmation_and_monotone_base_under_random_traffic() {
        let mut rng = fastrand::Rng::with_seed(42);
        let mut server = ServerState::<Shelf>::new();
        let mut client = ClientState::from_server(&server);

        for _ in 0..400 {
            let item = rng.u32(0..6);
            let action = match rng.u8(0..3) {
                0 => ShelfAction::Add(item),
                1 => ShelfAction::Take(item),
                _ => ShelfAction::Place {
                    item,
                    after: Some(rng.u32(0..6)),
                },
            };

            match rng.u8(0..4) {
                0 => client = client.local_dispatch(action),
                1 => {
                    // Foreign writer up to date with the server.
                    let (next, _) = server.dispatch(server.version(), action);
                    server = next;
                }
                2 => {
                    let before = client.clone();
                    client = client.handle_realtime_update(server.version(), server.present().clone());
                    assert!(client.base_version() >= before.base_version());
                    assert_eq!(client.pending(), before.pending());
                }
                _ => {
                    let Some(head) = client.head().cloned() else {
                        continue;
                    };
                    let before = client.clone();
                    let (next, reply) = server.dispatch(client.base_version(), head);
                    server = next;
                    client = match reply {
                        Reply::Accepted {
                            new_version,
                            new_present,
                            ..
                        } => client.accept_reply(new_version, new_present),
                        Reply::Rejected { .. } => {
                            client.reject_reply(server.version(), server.present().clone())
                        }
                    };

                    let expected_pending = before.pending().skip(1);
                    assert_eq!(client.pending(), &expected_pending);
                    assert_eq!(
                        client.present(),
                        &reapply_pending::<Shelf, _>(server.present(), &expected_pending)
                    );
                    assert!(client.base_version() >= before.base_version());
                }
            }
        }
    }
}
