//! A minimal generic state-transition guard, extracted from the pattern the
//! teacher repeats for every state machine it owns (`TaskStateMachine`,
//! `StepStateMachine`): validate a `(from, to)` pair against a static table
//! before applying it, and report a uniform `StateTransitionFailed` error on
//! an illegal jump. Each FSM in `bridge-core` defines its own state/event
//! enums and wires them through this guard rather than re-deriving the
//! validation logic.

use crate::errors::BridgeError;
use std::fmt::Debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition<S> {
    pub from: S,
    pub to: S,
}

/// A static table of legal `(from, to)` pairs for one state machine.
pub struct TransitionGuard<S> {
    allowed: Vec<Transition<S>>,
}

impl<S> TransitionGuard<S>
where
    S: Copy + Eq + Debug,
{
    pub fn new(allowed: Vec<Transition<S>>) -> Self {
        Self { allowed }
    }

    pub fn is_allowed(&self, from: S, to: S) -> bool {
        self.allowed.iter().any(|t| t.from == from && t.to == to)
    }

    pub fn check(
        &self,
        entity_type: &str,
        entity_id: impl ToString,
        from: S,
        to: S,
    ) -> Result<(), BridgeError> {
        if self.is_allowed(from, to) {
            Ok(())
        } else {
            Err(BridgeError::StateTransitionFailed {
                entity_type: entity_type.to_string(),
                entity_id: entity_id.to_string(),
                reason: format!("illegal transition {from:?} -> {to:?}"),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum S {
        A,
        B,
        C,
    }

    #[test]
    fn rejects_transitions_not_in_table() {
        let guard = TransitionGuard::new(vec![
            Transition { from: S::A, to: S::B },
            Transition { from: S::B, to: S::C },
        ]);

        assert!(guard.is_allowed(S::A, S::B));
        assert!(!guard.is_allowed(S::A, S::C));
        assert!(guard.check("Thing", "id-1", S::A, S::C).is_err());
        assert!(guard.check("Thing", "id-1", S::B, S::C).is_ok());
    }
}
