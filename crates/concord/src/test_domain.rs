//! A small ordered-shelf domain for unit tests.
//!
//! Items are integers kept in a sequence. `Remove` of a missing item is a
//! harmless no-op while `Take` of a missing item is an error, which gives the
//! tests both a "noChange" path and a rejection path. `Place` carries an
//! anchor that can vanish under a concurrent removal.

use crate::domain::{Candidates, Domain};
use crate::hub::ResourceId;
use crate::multi::{Effective, Models, MultiDomain};
use serde::{Deserialize, Serialize};
use smallvec::smallvec;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shelf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShelfAction {
    NoOp,
    Add(u32),
    Remove(u32),
    Take(u32),
    /// Move `item` right after `after`, or to the end when `after` is `None`.
    Place { item: u32, after: Option<u32> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShelfErr {
    Duplicate,
    Missing,
    BadAnchor,
    Rejected,
}

impl Domain for Shelf {
    type Model = im::Vector<u32>;
    type Action = ShelfAction;
    type Err = ShelfErr;

    fn init() -> Self::Model {
        im::Vector::new()
    }

    fn try_step(model: &Self::Model, action: &ShelfAction) -> Result<Self::Model, ShelfErr> {
        match action {
            ShelfAction::NoOp => Ok(model.clone()),
            ShelfAction::Add(item) => {
                if model.contains(item) {
                    return Err(ShelfErr::Duplicate);
                }
                let mut next = model.clone();
                next.push_back(*item);
                Ok(next)
            }
            ShelfAction::Remove(item) => Ok(without(model, *item)),
            ShelfAction::Take(item) => {
                if !model.contains(item) {
                    return Err(ShelfErr::Missing);
                }
                Ok(without(model, *item))
            }
            ShelfAction::Place { item, after } => {
                if !model.contains(item) {
                    return Err(ShelfErr::Missing);
                }
                let mut rest = without(model, *item);
                let at = match after {
                    None => rest.len(),
                    Some(anchor) => match rest.index_of(anchor) {
                        Some(i) => i + 1,
                        None => return Err(ShelfErr::BadAnchor),
                    },
                };
                rest.insert(at, *item);
                Ok(rest)
            }
        }
    }

    fn rebase(remote: &ShelfAction, local: &ShelfAction) -> ShelfAction {
        match (remote, local) {
            (ShelfAction::NoOp, _) => local.clone(),
            (_, ShelfAction::NoOp) => ShelfAction::NoOp,
            (
                ShelfAction::Remove(gone) | ShelfAction::Take(gone),
                ShelfAction::Place { item, after },
            ) => {
                if item == gone {
                    ShelfAction::NoOp
                } else if *after == Some(*gone) {
                    ShelfAction::Place {
                        item: *item,
                        after: None,
                    }
                } else {
                    local.clone()
                }
            }
            _ => local.clone(),
        }
    }

    fn candidates(_model: &Self::Model, action: &ShelfAction) -> Candidates<ShelfAction> {
        match action {
            ShelfAction::Place {
                item,
                after: Some(_),
            } => smallvec![
                action.clone(),
                ShelfAction::Place {
                    item: *item,
                    after: None
                }
            ],
            _ => smallvec![action.clone()],
        }
    }

    fn reject_err() -> ShelfErr {
        ShelfErr::Rejected
    }
}

/// Requests across shelves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShelfMove {
    On(ResourceId, ShelfAction),
    /// Take `item` off `from` and add it to `to`.
    Transfer {
        item: u32,
        from: ResourceId,
        to: ResourceId,
    },
}

impl MultiDomain for Shelf {
    type MultiAction = ShelfMove;

    fn touched(action: &ShelfMove) -> BTreeSet<ResourceId> {
        match action {
            ShelfMove::On(id, _) => BTreeSet::from([*id]),
            ShelfMove::Transfer { from, to, .. } => BTreeSet::from([*from, *to]),
        }
    }

    fn rebase_multi(resource: ResourceId, remote: &ShelfAction, local: &ShelfMove) -> ShelfMove {
        match local {
            ShelfMove::On(id, action) if *id == resource => {
                ShelfMove::On(*id, Shelf::rebase(remote, action))
            }
            ShelfMove::Transfer { item, from, .. }
                if *from == resource
                    && matches!(remote, ShelfAction::Remove(gone) | ShelfAction::Take(gone) if gone == item) =>
            {
                ShelfMove::On(*from, ShelfAction::NoOp)
            }
            _ => local.clone(),
        }
    }

    fn multi_candidates(_models: &Models<Shelf>, action: &ShelfMove) -> Candidates<ShelfMove> {
        smallvec![action.clone()]
    }

    fn lower(_models: &Models<Shelf>, action: &ShelfMove) -> Result<Effective<Shelf>, ShelfErr> {
        match action {
            ShelfMove::On(id, action) => Ok(BTreeMap::from([(*id, action.clone())])),
            ShelfMove::Transfer { from, to, .. } if from == to => Err(ShelfErr::Rejected),
            ShelfMove::Transfer { item, from, to } => Ok(BTreeMap::from([
                (*from, ShelfAction::Take(*item)),
                (*to, ShelfAction::Add(*item)),
            ])),
        }
    }
}

fn without(model: &im::Vector<u32>, item: u32) -> im::Vector<u32> {
    model.iter().copied().filter(|i| *i != item).collect()
}

/// Build a shelf model holding `items` in order.
pub fn shelf(items: &[u32]) -> im::Vector<u32> {
    items.iter().copied().collect()
}
