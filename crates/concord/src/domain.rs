//! The domain contract.
//!
//! A [`Domain`] is the concrete business model (a task tracker, say) plugged
//! into the generic protocol. The protocol never looks inside models or
//! actions beyond the operations of this trait.

use serde::de::DeserializeOwned;
use serde::Serialize;
use smallvec::SmallVec;
use std::fmt::Debug;

/// Fallback forms of a rebased action, most faithful first.
///
/// Only reordering actions usually produce more than one candidate, so the
/// common case stays inline.
pub type Candidates<A> = SmallVec<[A; 3]>;

/// A pluggable application model.
///
/// Implementors are marker types; every operation is an associated function
/// so the protocol types can be parameterized by the domain alone:
///
/// ```ignore
/// #[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// struct Counter;
///
/// impl Domain for Counter {
///     type Model = i64;
///     type Action = CounterAction;
///     type Err = CounterErr;
///
///     fn init() -> i64 { 0 }
///     fn try_step(m: &i64, a: &CounterAction) -> Result<i64, CounterErr> { /* ... */ }
///     fn rebase(_remote: &CounterAction, local: &CounterAction) -> CounterAction { local.clone() }
///     fn candidates(_m: &i64, a: &CounterAction) -> Candidates<CounterAction> { smallvec![a.clone()] }
///     fn reject_err() -> CounterErr { CounterErr::Rejected }
/// }
/// ```
///
/// All operations must be pure and deterministic. `rebase` must treat a
/// no-op `remote` as the identity and must map a no-op `local` to a no-op.
/// `candidates` must end with a form that is always satisfiable when the
/// action is satisfiable at all (e.g. "move to end").
pub trait Domain: Debug + Clone + Copy + PartialEq + Eq + Send + Sync + 'static {
    /// The replicated state.
    type Model: Clone + PartialEq + Debug + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// One intended mutation of the model.
    type Action: Clone + PartialEq + Debug + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Domain-local validation failure.
    type Err: Clone + PartialEq + Debug + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// The model every resource starts from.
    fn init() -> Self::Model;

    /// Attempt one action against a model.
    fn try_step(model: &Self::Model, action: &Self::Action) -> Result<Self::Model, Self::Err>;

    /// Adjust `local` so it keeps its intent after `remote` was applied first.
    fn rebase(remote: &Self::Action, local: &Self::Action) -> Self::Action;

    /// Forms of `action` to try against `model`, most faithful first.
    fn candidates(model: &Self::Model, action: &Self::Action) -> Candidates<Self::Action>;

    /// The error reported when no candidate applies.
    fn reject_err() -> Self::Err;
}

/// Rebase `action` through every action in `suffix`, newest first.
///
/// `suffix` is the slice of the applied log the sender has not seen. The
/// newest unseen action is folded in first, then each older one in turn.
pub fn rebase_through_suffix<'a, D, I>(suffix: I, action: &D::Action) -> D::Action
where
    D: Domain,
    I: IntoIterator<Item = &'a D::Action>,
    I::IntoIter: DoubleEndedIterator,
{
    suffix
        .into_iter()
        .rev()
        .fold(action.clone(), |local, remote| D::rebase(remote, &local))
}

/// Try each candidate in order; the first one that applies wins.
///
/// Returns the resulting model together with the candidate that produced
/// it, or [`Domain::reject_err`] when every candidate fails (including when
/// there are none).
pub fn choose_candidate<D: Domain>(
    model: &D::Model,
    candidates: &[D::Action],
) -> Result<(D::Model, D::Action), D::Err> {
    candidates
        .iter()
        .find_map(|candidate| {
            D::try_step(model, candidate)
                .ok()
                .map(|next| (next, candidate.clone()))
        })
        .ok_or_else(D::reject_err)
}

/// Strictly fold `actions` over `model`, stopping at the first failure.
pub fn replay<'a, D, I>(model: &D::Model, actions: I) -> Result<D::Model, D::Err>
where
    D: Domain,
    I: IntoIterator<Item = &'a D::Action>,
{
    actions
        .into_iter()
        .try_fold(model.clone(), |current, action| D::try_step(&current, action))
}
