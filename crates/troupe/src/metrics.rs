//! Prometheus metrics of a stage
//!
//! Each stage owns its own [`Registry`] so that several stages in one process
//! (and in one test binary) never collide on metric names. Every metric
//! carries a constant `stage` label.

use crate::error::{ActorError, ActorResult};
use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, Encoder, IntCounter, IntCounterVec, IntGauge, Registry,
    TextEncoder,
};
use std::collections::HashMap;

/// Counters and gauges maintained by the runtime
#[derive(Clone)]
pub struct StageMetrics {
    registry: Registry,
    /// Actors successfully created
    pub actors_created: IntCounter,
    /// Actors whose stop hook has run
    pub actors_stopped: IntCounter,
    /// User messages handed to actor handlers
    pub messages_delivered: IntCounter,
    /// Handler failures by error category
    pub message_failures: IntCounterVec,
    /// Failures reported to supervisors
    pub supervision_informed: IntCounter,
    /// Actors rebuilt by supervision
    pub restarts: IntCounter,
    /// Actors reclaimed by the evictor
    pub evictions: IntCounter,
    /// Sends rejected for lack of capacity
    pub mailbox_overflows: IntCounter,
    /// User messages sent to stopped actors
    pub dead_letters: IntCounter,
    /// Live actors in the directory
    pub directory_size: IntGauge,
}

fn internal(e: prometheus::Error) -> ActorError {
    ActorError::Internal {
        reason: format!("metrics registration failed: {e}"),
    }
}

impl StageMetrics {
    pub fn new(stage: &str) -> ActorResult<Self> {
        let mut labels = HashMap::new();
        labels.insert("stage".to_string(), stage.to_string());
        let registry =
            Registry::new_custom(Some("troupe".to_string()), Some(labels)).map_err(internal)?;

        Ok(Self {
            actors_created: register_int_counter_with_registry!(
                "actors_created_total",
                "Total actors created",
                registry
            )
            .map_err(internal)?,
            actors_stopped: register_int_counter_with_registry!(
                "actors_stopped_total",
                "Total actors stopped",
                registry
            )
            .map_err(internal)?,
            messages_delivered: register_int_counter_with_registry!(
                "messages_delivered_total",
                "Total user messages delivered to actors",
                registry
            )
            .map_err(internal)?,
            message_failures: register_int_counter_vec_with_registry!(
                "message_failures_total",
                "Total handler failures",
                &["category"],
                registry
            )
            .map_err(internal)?,
            supervision_informed: register_int_counter_with_registry!(
                "supervision_informed_total",
                "Total failures reported to supervisors",
                registry
            )
            .map_err(internal)?,
            restarts: register_int_counter_with_registry!(
                "actor_restarts_total",
                "Total actor restarts",
                registry
            )
            .map_err(internal)?,
            evictions: register_int_counter_with_registry!(
                "actor_evictions_total",
                "Total actors evicted from the directory",
                registry
            )
            .map_err(internal)?,
            mailbox_overflows: register_int_counter_with_registry!(
                "mailbox_overflows_total",
                "Total sends rejected by backpressure",
                registry
            )
            .map_err(internal)?,
            dead_letters: register_int_counter_with_registry!(
                "dead_letters_total",
                "Total messages dropped at stopped actors",
                registry
            )
            .map_err(internal)?,
            directory_size: register_int_gauge_with_registry!(
                "directory_size",
                "Live actors registered in the directory",
                registry
            )
            .map_err(internal)?,
            registry,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_failure(&self, cause: &ActorError) {
        self.message_failures
            .with_label_values(&[cause.category()])
            .inc();
    }

    /// Render all metrics in the Prometheus text format
    pub fn gather_text(&self) -> ActorResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(internal)?;
        String::from_utf8(buffer).map_err(|e| ActorError::Internal {
            reason: e.to_string(),
        })
    }
}

impl std::fmt::Debug for StageMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageMetrics")
            .field("actors_created", &self.actors_created.get())
            .field("actors_stopped", &self.actors_stopped.get())
            .field("messages_delivered", &self.messages_delivered.get())
            .field("restarts", &self.restarts.get())
            .field("evictions", &self.evictions.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_independent_registries() {
        let a = StageMetrics::new("a").unwrap();
        let b = StageMetrics::new("b").unwrap();
        a.actors_created.inc();
        assert_eq!(a.actors_created.get(), 1);
        assert_eq!(b.actors_created.get(), 0);
    }

    #[test]
    fn test_failure_categories_and_export() {
        let metrics = StageMetrics::new("export").unwrap();
        metrics.record_failure(&ActorError::failed("x"));
        metrics.record_failure(&ActorError::Panicked {
            reason: "y".to_string(),
        });
        metrics.supervision_informed.inc();

        assert_eq!(
            metrics.message_failures.with_label_values(&["handler"]).get(),
            1
        );
        let text = metrics.gather_text().unwrap();
        assert!(text.contains("troupe_supervision_informed_total"));
        assert!(text.contains("stage=\"export\""));
    }
}
