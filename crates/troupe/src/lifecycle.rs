//! Actor lifecycle states and system messages

use crate::error::ActorError;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Actor lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum LifecycleState {
    /// Constructed and registered, before-start hook not finished
    #[default]
    BeforeStart = 0,
    /// Accepting and handling messages
    Running = 1,
    /// Failed and waiting for its supervisor
    Suspended = 2,
    /// Being rebuilt from its definition
    Restarting = 3,
    /// Stop requested or claimed for eviction
    Stopping = 4,
    /// Stop hook has run; final
    Stopped = 5,
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LifecycleState::BeforeStart,
            1 => LifecycleState::Running,
            2 => LifecycleState::Suspended,
            3 => LifecycleState::Restarting,
            4 => LifecycleState::Stopping,
            _ => LifecycleState::Stopped,
        }
    }

    /// Whether moving from `self` to `next` is a legal transition
    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (BeforeStart, Running)
                | (BeforeStart, Stopping)
                | (Running, Suspended)
                | (Running, Stopping)
                | (Suspended, Running)
                | (Suspended, Restarting)
                | (Suspended, Stopping)
                | (Restarting, Running)
                | (Restarting, Stopping)
                | (Running, Restarting)
                | (Stopping, Running)
                | (Stopping, Stopped)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Stopping | LifecycleState::Stopped)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::BeforeStart => write!(f, "before_start"),
            LifecycleState::Running => write!(f, "running"),
            LifecycleState::Suspended => write!(f, "suspended"),
            LifecycleState::Restarting => write!(f, "restarting"),
            LifecycleState::Stopping => write!(f, "stopping"),
            LifecycleState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Lifecycle state stored in an atomic
#[derive(Debug, Default)]
pub struct AtomicLifecycle(AtomicU8);

impl AtomicLifecycle {
    pub fn new(state: LifecycleState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> LifecycleState {
        LifecycleState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn store(&self, state: LifecycleState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    /// Move from `current` to `next`; fails with the observed state
    pub fn transition(
        &self,
        current: LifecycleState,
        next: LifecycleState,
    ) -> Result<(), LifecycleState> {
        self.0
            .compare_exchange(current as u8, next as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(LifecycleState::from_u8)
    }
}

/// Runtime-internal messages, handled ahead of user messages
#[derive(Debug, Clone)]
pub enum SystemMessage {
    /// Rebuild the actor from its definition, keeping its mailbox
    Restart(ActorError),
    /// Resume user message delivery
    Resume,
    /// Run the stop hook, release state, and close the mailbox
    Stop,
}

impl fmt::Display for SystemMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SystemMessage::Restart(_) => write!(f, "restart"),
            SystemMessage::Resume => write!(f, "resume"),
            SystemMessage::Stop => write!(f, "stop"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        use LifecycleState::*;
        assert!(BeforeStart.can_transition_to(Running));
        assert!(Running.can_transition_to(Suspended));
        assert!(Suspended.can_transition_to(Restarting));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!BeforeStart.can_transition_to(Suspended));
    }

    #[test]
    fn test_atomic_transition() {
        let state = AtomicLifecycle::new(LifecycleState::Running);
        assert!(state
            .transition(LifecycleState::Running, LifecycleState::Stopping)
            .is_ok());
        assert_eq!(
            state.transition(LifecycleState::Running, LifecycleState::Stopping),
            Err(LifecycleState::Stopping)
        );
        assert_eq!(state.load(), LifecycleState::Stopping);
        assert!(state.load().is_terminal());
        assert_eq!(state.load().to_string(), "stopping");
    }
}
