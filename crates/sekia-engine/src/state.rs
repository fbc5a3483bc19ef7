// SPDX-License-Identifier: MIT OR Apache-2.0
//! Workflow lifecycle state machine (§4.9).

use std::sync::Mutex;

/// A workflow's lifecycle state.
///
/// `Discovered → Loading → (Ready | Failed) → (Reloading → Ready | Failed)
/// → Draining → Terminated`. Transitions are driven exclusively by the
/// supervisor; external callers may only *request* `Reloading` or
/// `Draining`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WorkflowState {
    /// Found on disk, not yet loaded.
    Discovered,
    /// Sandbox being created and the script's top-level pass running.
    Loading,
    /// Loaded and dispatching.
    Ready,
    /// Load (or reload) failed; the given reason is the load error text.
    Failed {
        /// Why the load failed.
        reason: String,
    },
    /// A reload is in progress; the previous `Ready` sandbox still serves
    /// traffic until this settles.
    Reloading,
    /// Shutting down: no new messages are accepted, in-flight callbacks
    /// are draining.
    Draining,
    /// Fully stopped.
    Terminated,
}

impl WorkflowState {
    fn can_transition_to(&self, next: &WorkflowState) -> bool {
        use WorkflowState::{Discovered, Draining, Failed, Loading, Ready, Reloading, Terminated};
        matches!(
            (self, next),
            (Discovered, Loading)
                | (Loading, Ready)
                | (Loading, Failed { .. })
                | (Ready, Reloading)
                | (Failed { .. }, Reloading)
                | (Reloading, Ready)
                | (Reloading, Failed { .. })
                | (Ready, Draining)
                | (Failed { .. }, Draining)
                | (Draining, Terminated)
        )
    }
}

/// Invalid lifecycle transition was attempted.
#[derive(Debug, thiserror::Error)]
#[error("invalid workflow state transition: {from:?} -> {to:?}")]
pub struct InvalidTransition {
    /// State transitioned from.
    pub from: WorkflowState,
    /// State that was rejected.
    pub to: WorkflowState,
}

/// Thread-safe holder enforcing the transition table above.
pub struct StateMachine {
    state: Mutex<WorkflowState>,
}

impl StateMachine {
    /// Start a new machine in [`WorkflowState::Discovered`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(WorkflowState::Discovered),
        }
    }

    /// Current state (cloned out from under the lock).
    #[must_use]
    pub fn current(&self) -> WorkflowState {
        self.state.lock().unwrap().clone()
    }

    /// Attempt a transition, rejecting it if not permitted from the
    /// current state.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] if `next` isn't reachable from the
    /// current state.
    pub fn transition(&self, next: WorkflowState) -> Result<(), InvalidTransition> {
        let mut guard = self.state.lock().unwrap();
        if !guard.can_transition_to(&next) {
            return Err(InvalidTransition {
                from: guard.clone(),
                to: next,
            });
        }
        *guard = next;
        Ok(())
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_load_to_ready() {
        let sm = StateMachine::new();
        sm.transition(WorkflowState::Loading).unwrap();
        sm.transition(WorkflowState::Ready).unwrap();
        assert_eq!(sm.current(), WorkflowState::Ready);
    }

    #[test]
    fn cannot_skip_loading() {
        let sm = StateMachine::new();
        assert!(sm.transition(WorkflowState::Ready).is_err());
    }

    #[test]
    fn failed_workflow_can_still_be_reloaded() {
        let sm = StateMachine::new();
        sm.transition(WorkflowState::Loading).unwrap();
        sm.transition(WorkflowState::Failed { reason: "boom".into() }).unwrap();
        sm.transition(WorkflowState::Reloading).unwrap();
        sm.transition(WorkflowState::Ready).unwrap();
        assert_eq!(sm.current(), WorkflowState::Ready);
    }

    #[test]
    fn terminated_is_final() {
        let sm = StateMachine::new();
        sm.transition(WorkflowState::Loading).unwrap();
        sm.transition(WorkflowState::Ready).unwrap();
        sm.transition(WorkflowState::Draining).unwrap();
        sm.transition(WorkflowState::Terminated).unwrap();
        assert!(sm.transition(WorkflowState::Ready).is_err());
    }
}
