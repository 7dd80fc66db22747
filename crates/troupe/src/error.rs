//! Error types for the actor runtime

use crate::address::Address;
use std::any::Any;
use std::time::Duration;
use thiserror::Error;

/// Result type for actor operations
pub type ActorResult<T> = Result<T, ActorError>;

/// Actor runtime errors.
///
/// Infrastructure errors (directory races, overflow, a stopped stage) are
/// returned to the caller. Failures raised by an actor's own handler travel
/// through supervision instead and only show up here as the `cause` handed to
/// a [`Supervisor`](crate::supervision::Supervisor).
#[derive(Debug, Error, Clone)]
pub enum ActorError {
    /// A live actor is already registered at the address
    #[error("Address already registered: {address}")]
    AddressAlreadyRegistered { address: Address },

    /// The construction recipe or the before-start hook failed
    #[error("Actor creation failed at {address}: {reason}")]
    ActorCreationFailed { address: Address, reason: String },

    /// The shared dispatch queue is at capacity
    #[error("Mailbox overflow: {capacity} messages pending")]
    MailboxOverflow { capacity: usize },

    /// Creation attempted after the stage began stopping
    #[error("Stage stopped: {stage}")]
    StageStopped { stage: String },

    /// The dispatcher no longer accepts work
    #[error("Dispatcher closed")]
    DispatcherClosed,

    /// The target actor has stopped and its mailbox is closed
    #[error("Actor stopped: {address}")]
    ActorStopped { address: Address },

    /// The actor registered at an address speaks a different protocol
    #[error("Protocol mismatch at {address}: expected {expected}, found {found}")]
    ProtocolMismatch {
        address: Address,
        expected: &'static str,
        found: &'static str,
    },

    /// An actor handler reported a failure
    #[error("Message handling failed: {reason}")]
    HandlerFailed { reason: String },

    /// An actor handler or hook panicked
    #[error("Actor panicked: {reason}")]
    Panicked { reason: String },

    /// A child escalated its failure to this actor
    #[error("Failure escalated from {child}: {cause}")]
    Escalated { child: Address, cause: Box<ActorError> },

    /// An eventual result was dropped without an outcome
    #[error("Eventual result dropped without an outcome")]
    Unanswered,

    /// Timed out waiting for an outcome
    #[error("Operation timed out: {operation} after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    /// A router was asked to route with an empty pool
    #[error("Router has no routees")]
    NoRoutees,

    /// The scheduler was closed
    #[error("Scheduler closed")]
    SchedulerClosed,

    /// Configuration error
    #[error("Configuration error: {parameter} - {reason}")]
    ConfigurationError { parameter: String, reason: String },

    /// Internal error (should not happen in production)
    #[error("Internal error: {reason}")]
    Internal { reason: String },
}

impl ActorError {
    /// Shorthand for a handler failure with a reason
    pub fn failed(reason: impl Into<String>) -> Self {
        ActorError::HandlerFailed {
            reason: reason.into(),
        }
    }

    /// Convert a panic payload captured by `catch_unwind`
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let reason = if let Some(message) = payload.downcast_ref::<&'static str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "non-string panic payload".to_string()
        };
        ActorError::Panicked { reason }
    }

    /// Whether the caller can reasonably retry the operation
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ActorError::AddressAlreadyRegistered { .. }
                | ActorError::MailboxOverflow { .. }
                | ActorError::Timeout { .. }
        )
    }

    /// Get error category for metrics
    pub fn category(&self) -> &'static str {
        match self {
            ActorError::AddressAlreadyRegistered { .. } => "directory",
            ActorError::ActorCreationFailed { .. } => "actor_lifecycle",
            ActorError::ActorStopped { .. } => "actor_lifecycle",
            ActorError::StageStopped { .. } => "stage",
            ActorError::MailboxOverflow { .. } => "messaging",
            ActorError::DispatcherClosed => "messaging",
            ActorError::ProtocolMismatch { .. } => "messaging",
            ActorError::HandlerFailed { .. } => "handler",
            ActorError::Panicked { .. } => "panic",
            ActorError::Escalated { .. } => "supervision",
            ActorError::Unanswered => "completes",
            ActorError::Timeout { .. } => "performance",
            ActorError::NoRoutees => "routing",
            ActorError::SchedulerClosed => "scheduler",
            ActorError::ConfigurationError { .. } => "configuration",
            ActorError::Internal { .. } => "internal",
        }
    }
}

impl From<ConfigError> for ActorError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::ValidationError { field, reason } => ActorError::ConfigurationError {
                parameter: field,
                reason,
            },
            other => ActorError::ConfigurationError {
                parameter: "config".to_string(),
                reason: other.to_string(),
            },
        }
    }
}

/// Configuration errors
#[derive(Debug, Error, Clone)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("Configuration parse error: {reason}")]
    ParseError { reason: String },

    #[error("Configuration validation error: {field} - {reason}")]
    ValidationError { field: String, reason: String },

    #[error("Environment variable error: {var} - {reason}")]
    EnvVarError { var: String, reason: String },
}
