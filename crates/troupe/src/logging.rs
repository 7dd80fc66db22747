//! Logger interface handed to actors and the stage

use std::error::Error;
use tracing::{debug, error, Level};

/// Narrow logging interface used by the runtime and by actors
pub trait Logger: Send + Sync {
    fn name(&self) -> &str;

    /// Whether debug output would be emitted
    fn is_enabled(&self) -> bool;

    fn debug(&self, message: &str);

    fn error(&self, message: &str, cause: Option<&dyn Error>);
}

/// Logger backed by `tracing` events
#[derive(Debug, Clone)]
pub struct TracingLogger {
    name: String,
}

impl TracingLogger {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Logger for TracingLogger {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_enabled(&self) -> bool {
        tracing::enabled!(Level::DEBUG)
    }

    fn debug(&self, message: &str) {
        debug!(logger = %self.name, "{}", message);
    }

    fn error(&self, message: &str, cause: Option<&dyn Error>) {
        match cause {
            Some(cause) => error!(logger = %self.name, error = %cause, "{}", message),
            None => error!(logger = %self.name, "{}", message),
        }
    }
}

/// Logger that discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpLogger;

impl Logger for NoOpLogger {
    fn name(&self) -> &str {
        "noop"
    }

    fn is_enabled(&self) -> bool {
        false
    }

    fn debug(&self, _message: &str) {}

    fn error(&self, _message: &str, _cause: Option<&dyn Error>) {}
}
