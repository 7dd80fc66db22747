//! Directory eviction
//!
//! A stage with eviction enabled runs a [`DirectoryEvictor`] actor that is
//! probed periodically by the scheduler. A probe only acts when the directory
//! is at or above its high-water mark; it then stops idle actors, least
//! recently used first, until occupancy drops below the mark.

use crate::{
    actor::{Actor, Context},
    config::{invalid, Validate},
    error::{ActorResult, ConfigError},
    stage::Stage,
};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

/// Eviction policy of a stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryEvictionConfiguration {
    /// Whether eviction runs
    pub enabled: bool,
    /// Stages that never evict, by name
    pub excluded_stage_names: Vec<String>,
    /// Time between probes
    pub lru_probe_interval: Duration,
    /// Minimum idle time before an actor may be evicted
    pub lru_threshold: Duration,
    /// Occupancy at which eviction starts
    pub full_ratio_high_mark: f64,
}

impl Default for DirectoryEvictionConfiguration {
    fn default() -> Self {
        Self {
            enabled: false,
            excluded_stage_names: Vec::new(),
            lru_probe_interval: Duration::from_secs(30),
            lru_threshold: Duration::from_secs(120),
            full_ratio_high_mark: 0.8,
        }
    }
}

impl DirectoryEvictionConfiguration {
    /// Configuration in effect given the stored one and a force flag.
    ///
    /// Force turns a stored configuration on, or supplies defaults when none
    /// is stored. Without either there is no eviction.
    pub fn effective(stored: Option<&Self>, force: bool) -> Option<Self> {
        match stored {
            Some(stored) => {
                let mut config = stored.clone();
                config.enabled = config.enabled || force;
                Some(config)
            }
            None if force => Some(Self {
                enabled: true,
                ..Self::default()
            }),
            None => None,
        }
    }

    pub fn is_excluded(&self, stage_name: &str) -> bool {
        self.excluded_stage_names
            .iter()
            .any(|excluded| excluded == stage_name)
    }
}

impl Validate for DirectoryEvictionConfiguration {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.lru_probe_interval.is_zero() {
            return Err(invalid("eviction.lru_probe_interval", "must be non-zero"));
        }
        if !(self.full_ratio_high_mark > 0.0 && self.full_ratio_high_mark <= 1.0) {
            return Err(invalid(
                "eviction.full_ratio_high_mark",
                "must be greater than 0 and at most 1",
            ));
        }
        Ok(())
    }
}

/// Probe message sent by the scheduler
#[derive(Debug, Clone, Copy)]
pub struct EvictionProbe;

/// Internal actor that reclaims idle actors when the directory is full
pub struct DirectoryEvictor {
    config: DirectoryEvictionConfiguration,
}

impl DirectoryEvictor {
    pub fn new(config: DirectoryEvictionConfiguration) -> Self {
        Self { config }
    }

    /// Run one probe; returns how many actors were evicted
    pub fn probe(&self, stage: &Stage) -> usize {
        let directory = stage.directory();
        let mark = self.config.full_ratio_high_mark;
        let occupancy = directory.occupancy();
        if occupancy < mark {
            trace!(stage = %stage.name(), occupancy, mark, "Eviction probe below high mark");
            return 0;
        }

        let now = Instant::now();
        let mut candidates: Vec<_> = directory
            .all()
            .into_iter()
            .filter(|entry| {
                entry.is_evictable()
                    && entry.pending() == 0
                    && !entry.is_stop_requested()
                    && now.saturating_duration_since(entry.last_active()) >= self.config.lru_threshold
            })
            .collect();
        candidates.sort_by_key(|entry| entry.last_active());

        let mut evicted = 0;
        for entry in candidates {
            if directory.occupancy() < mark {
                break;
            }
            if entry.try_claim_eviction() && stage.stop_entry(entry.clone()) {
                evicted += 1;
                stage.metrics().evictions.inc();
                debug!(address = %entry.address(), "Evicted idle actor");
            }
        }

        if evicted > 0 {
            info!(
                stage = %stage.name(),
                evicted,
                occupancy = directory.occupancy(),
                "Directory eviction completed"
            );
        }
        evicted
    }
}

impl Actor for DirectoryEvictor {
    type Protocol = EvictionProbe;

    fn receive(&mut self, _probe: EvictionProbe, ctx: &mut Context<'_, Self>) -> ActorResult<()> {
        self.probe(ctx.stage());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DirectoryEvictionConfiguration::default();
        assert!(!config.enabled);
        assert_eq!(config.lru_probe_interval, Duration::from_secs(30));
        assert_eq!(config.lru_threshold, Duration::from_secs(120));
        assert_eq!(config.full_ratio_high_mark, 0.8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_effective_merge_rule() {
        assert!(DirectoryEvictionConfiguration::effective(None, false).is_none());

        let forced = DirectoryEvictionConfiguration::effective(None, true).unwrap();
        assert!(forced.enabled);
        assert_eq!(forced.lru_threshold, Duration::from_secs(120));

        let stored = DirectoryEvictionConfiguration {
            lru_threshold: Duration::from_secs(1),
            ..Default::default()
        };
        let unforced = DirectoryEvictionConfiguration::effective(Some(&stored), false).unwrap();
        assert!(!unforced.enabled);
        let forced = DirectoryEvictionConfiguration::effective(Some(&stored), true).unwrap();
        assert!(forced.enabled);
        assert_eq!(forced.lru_threshold, Duration::from_secs(1));
    }

    #[test]
    fn test_excluded_stage_names() {
        let config = DirectoryEvictionConfiguration {
            excluded_stage_names: vec!["system".to_string()],
            ..Default::default()
        };
        assert!(config.is_excluded("system"));
        assert!(!config.is_excluded("users"));
    }

    #[test]
    fn test_invalid_high_mark() {
        let config = DirectoryEvictionConfiguration {
            full_ratio_high_mark: 0.0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError { .. })
        ));
    }

    #[test]
    fn test_high_mark_above_full_rejected() {
        for mark in [1.01, 2.0, f64::NAN] {
            let config = DirectoryEvictionConfiguration {
                full_ratio_high_mark: mark,
                ..Default::default()
            };
            assert!(config.validate().is_err(), "mark {mark} accepted");
        }
        let full = DirectoryEvictionConfiguration {
            full_ratio_high_mark: 1.0,
            ..Default::default()
        };
        assert!(full.validate().is_ok());
    }
}
