//! The pure decision seam.

use crate::domain::Domain;
use crate::effect::{EffectCommand, EffectEvent, EffectState};

/// Pure decision logic: consume an event, update internal state, and
/// optionally ask for a command to be executed.
///
/// Machines never perform IO. Whatever runs them (the session engine, a
/// test harness) owns execution and feeds the outcome back as another event.
pub trait Machine: Send + 'static {
    type Event: Send + 'static;
    type Command: Send + 'static;

    fn decide(&mut self, event: &Self::Event) -> Option<Self::Command>;
}

impl<D: Domain> Machine for EffectState<D> {
    type Event = EffectEvent<D>;
    type Command = EffectCommand<D>;

    fn decide(&mut self, event: &EffectEvent<D>) -> Option<EffectCommand<D>> {
        let current = self.clone();
        let (next, command) = current.step(event.clone());
        tracing::debug!(
            network = ?next.network,
            mode = ?next.mode,
            pending = next.client.pending_count(),
            base_version = next.client.base_version(),
            command = ?command,
            "effect transition"
        );
        *self = next;
        match command {
            EffectCommand::NoOp => None,
            command => Some(command),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::EffectMode;
    use crate::test_domain::{shelf, Shelf, ShelfAction};

    #[test]
    fn decide_runs_step_in_place() {
        let mut machine = EffectState::<Shelf>::init(0, shelf(&[]));

        let cmd = machine.decide(&EffectEvent::UserAction {
            action: ShelfAction::Add(1),
        });
        assert_eq!(
            cmd,
            Some(EffectCommand::SendDispatch {
                base_version: 0,
                action: ShelfAction::Add(1),
            })
        );
        assert_eq!(machine.mode, EffectMode::Dispatching { retries: 0 });

        let cmd = machine.decide(&EffectEvent::Tick);
        assert_eq!(cmd, None);
    }
}
