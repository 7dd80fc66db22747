//! Supervision protocol
//!
//! When an actor's handler fails, the stage suspends the actor and hands a
//! [`Supervised`] view of it to the responsible [`Supervisor`]. The supervisor
//! decides between restart, resume, stop and escalate. Restarts are bounded by
//! a [`SupervisionStrategy`]: more than `intensity` failures within `period`
//! turn a restart into a stop.

use crate::{address::Address, error::ActorError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Which actors a supervision decision applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisionScope {
    /// Only the failing actor
    One,
    /// The failing actor and all of its siblings
    All,
}

/// Restart budget of a supervisor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisionStrategy {
    /// Failures tolerated within `period`; 0 never restarts, [`FOREVER`](Self::FOREVER) never gives up
    pub intensity: u32,
    /// Rolling failure window
    pub period: Duration,
    /// Actors affected by a decision
    pub scope: SupervisionScope,
}

impl SupervisionStrategy {
    /// Intensity that never exhausts
    pub const FOREVER: u32 = u32::MAX;

    pub fn new(intensity: u32, period: Duration, scope: SupervisionScope) -> Self {
        Self {
            intensity,
            period,
            scope,
        }
    }

    /// Restart on every failure, never stopping
    pub fn forever(scope: SupervisionScope) -> Self {
        Self::new(Self::FOREVER, Duration::from_secs(5), scope)
    }

    pub fn with_intensity(mut self, intensity: u32) -> Self {
        self.intensity = intensity;
        self
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub fn with_scope(mut self, scope: SupervisionScope) -> Self {
        self.scope = scope;
        self
    }
}

impl Default for SupervisionStrategy {
    fn default() -> Self {
        Self {
            intensity: 1,
            period: Duration::from_secs(5),
            scope: SupervisionScope::One,
        }
    }
}

/// Receives failure notifications for supervised actors
pub trait Supervisor: Send + Sync {
    /// Decide what happens to `supervised` after it failed with `cause`
    fn inform(&self, cause: &ActorError, supervised: &dyn Supervised);

    fn supervision_strategy(&self) -> SupervisionStrategy;
}

/// Failing actor as seen by its supervisor
pub trait Supervised {
    fn address(&self) -> &Address;

    fn cause(&self) -> &ActorError;

    /// Restart the scope unless it failed more than `intensity` times within `period`
    fn restart_within(&self, period: Duration, intensity: u32, scope: SupervisionScope);

    /// Resume message delivery with the current state
    fn resume(&self);

    fn stop(&self, scope: SupervisionScope);

    /// Stop the actor and fail its parent
    fn escalate(&self);

    fn suspend(&self);

    fn supervisor(&self) -> Arc<dyn Supervisor>;
}

/// Supervisor applying its strategy through [`Supervised::restart_within`]
#[derive(Debug, Clone, Default)]
pub struct DefaultSupervisor {
    strategy: SupervisionStrategy,
}

impl DefaultSupervisor {
    pub fn new(strategy: SupervisionStrategy) -> Self {
        Self { strategy }
    }
}

impl Supervisor for DefaultSupervisor {
    fn inform(&self, cause: &ActorError, supervised: &dyn Supervised) {
        debug!(
            address = %supervised.address(),
            cause = %cause,
            intensity = self.strategy.intensity,
            "Default supervision"
        );
        supervised.restart_within(
            self.strategy.period,
            self.strategy.intensity,
            self.strategy.scope,
        );
    }

    fn supervision_strategy(&self) -> SupervisionStrategy {
        self.strategy.clone()
    }
}

#[derive(Debug, Default)]
struct MarkState {
    start_of_period: Option<Instant>,
    failures: u64,
}

/// Rolling failure counter
#[derive(Debug, Default)]
pub struct FailureMark {
    state: Mutex<MarkState>,
}

impl FailureMark {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure; true once the count exceeds `intensity` within `period`.
    ///
    /// The mark resets after reporting excess or when the window has elapsed.
    pub fn failed_with_excessive_failures(&self, period: Duration, intensity: u32) -> bool {
        if intensity == 0 {
            return true;
        }
        if intensity == SupervisionStrategy::FOREVER {
            return false;
        }

        let now = Instant::now();
        let mut state = self.state.lock();
        match state.start_of_period {
            Some(start) if now.duration_since(start) <= period => state.failures += 1,
            _ => {
                state.start_of_period = Some(now);
                state.failures = 1;
            }
        }

        if state.failures > u64::from(intensity) {
            *state = MarkState::default();
            true
        } else {
            false
        }
    }

    /// Failures recorded in the current window
    pub fn failures(&self) -> u64 {
        self.state.lock().failures
    }

    pub fn reset(&self) {
        *self.state.lock() = MarkState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_default_strategy() {
        let strategy = SupervisionStrategy::default();
        assert_eq!(strategy.intensity, 1);
        assert_eq!(strategy.period, Duration::from_secs(5));
        assert_eq!(strategy.scope, SupervisionScope::One);

        let custom = strategy
            .with_intensity(5)
            .with_period(Duration::from_millis(2000))
            .with_scope(SupervisionScope::All);
        assert_eq!(custom.intensity, 5);
        assert_eq!(custom.scope, SupervisionScope::All);
    }

    #[test]
    fn test_failure_mark_exceeds_intensity() {
        let mark = FailureMark::new();
        let period = Duration::from_secs(2);
        for _ in 0..5 {
            assert!(!mark.failed_with_excessive_failures(period, 5));
        }
        assert!(mark.failed_with_excessive_failures(period, 5));
        assert_eq!(mark.failures(), 0);
    }

    #[test]
    fn test_failure_mark_window_resets() {
        let mark = FailureMark::new();
        let period = Duration::from_millis(20);
        for _ in 0..4 {
            assert!(!mark.failed_with_excessive_failures(period, 1));
            thread::sleep(Duration::from_millis(30));
        }
    }

    #[test]
    fn test_zero_and_forever_intensity() {
        let mark = FailureMark::new();
        assert!(mark.failed_with_excessive_failures(Duration::from_secs(1), 0));
        for _ in 0..1000 {
            assert!(!mark.failed_with_excessive_failures(
                Duration::from_secs(1),
                SupervisionStrategy::FOREVER
            ));
        }
    }

    #[test]
    fn test_strategy_toml_roundtrip_names() {
        let strategy: SupervisionStrategy =
            toml::from_str("intensity = 3\nscope = \"all\"").unwrap();
        assert_eq!(strategy.intensity, 3);
        assert_eq!(strategy.scope, SupervisionScope::All);
        assert_eq!(strategy.period, Duration::from_secs(5));
    }
}
