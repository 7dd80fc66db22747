//! Testing utilities
//!
//! Actors run on dispatcher threads, so tests observe them through shared
//! recorders and wait for effects with a timeout instead of sleeping.

use crate::logging::Logger;
use parking_lot::{Condvar, Mutex};
use std::error::Error;
use std::time::{Duration, Instant};

/// Thread-safe log of events with a wait-until-count latch
#[derive(Debug)]
pub struct Happenings<T = String> {
    events: Mutex<Vec<T>>,
    changed: Condvar,
}

impl<T> Default for Happenings<T> {
    fn default() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            changed: Condvar::new(),
        }
    }
}

impl<T: Clone> Happenings<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an event and wake waiters
    pub fn happened(&self, event: T) {
        self.events.lock().push(event);
        self.changed.notify_all();
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    /// Snapshot of recorded events in order
    pub fn events(&self) -> Vec<T> {
        self.events.lock().clone()
    }

    /// Wait until at least `count` events were recorded; false on timeout
    pub fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(|events| events.len() >= count, timeout)
    }

    /// Wait until `predicate` holds over the recorded events; false on timeout
    pub fn wait_until<F>(&self, predicate: F, timeout: Duration) -> bool
    where
        F: Fn(&[T]) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut events = self.events.lock();
        while !predicate(&events) {
            if self.changed.wait_until(&mut events, deadline).timed_out() {
                return predicate(&events);
            }
        }
        true
    }
}

/// Severity of a recorded log line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Error,
}

/// Logger capturing everything it is given
#[derive(Debug, Default)]
pub struct RecordingLogger {
    entries: Happenings<(LogLevel, String)>,
}

impl RecordingLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<(LogLevel, String)> {
        self.entries.events()
    }

    /// Recorded error lines
    pub fn errors(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|(level, _)| *level == LogLevel::Error)
            .map(|(_, line)| line)
            .collect()
    }

    /// Wait for at least `count` error lines
    pub fn wait_for_errors(&self, count: usize, timeout: Duration) -> bool {
        self.entries.wait_until(
            |entries| {
                entries
                    .iter()
                    .filter(|(level, _)| *level == LogLevel::Error)
                    .count()
                    >= count
            },
            timeout,
        )
    }
}

impl Logger for RecordingLogger {
    fn name(&self) -> &str {
        "recording"
    }

    fn is_enabled(&self) -> bool {
        true
    }

    fn debug(&self, message: &str) {
        self.entries.happened((LogLevel::Debug, message.to_string()));
    }

    fn error(&self, message: &str, cause: Option<&dyn Error>) {
        let line = match cause {
            Some(cause) => format!("{message}: {cause}"),
            None => message.to_string(),
        };
        self.entries.happened((LogLevel::Error, line));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_wait_for_events_from_other_threads() {
        let happenings: Arc<Happenings<u32>> = Arc::new(Happenings::new());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let happenings = happenings.clone();
                thread::spawn(move || happenings.happened(i))
            })
            .collect();
        assert!(happenings.wait_for(4, Duration::from_secs(2)));
        for handle in handles {
            handle.join().unwrap();
        }
        let mut events = happenings.events();
        events.sort();
        assert_eq!(events, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_wait_times_out() {
        let happenings: Happenings = Happenings::new();
        happenings.happened("one".to_string());
        assert!(!happenings.wait_for(2, Duration::from_millis(20)));
        assert_eq!(happenings.count(), 1);
    }

    #[test]
    fn test_recording_logger() {
        let logger = RecordingLogger::new();
        logger.debug("starting");
        logger.error("failed", Some(&crate::error::ActorError::DispatcherClosed));
        assert_eq!(logger.errors(), vec!["failed: Dispatcher closed".to_string()]);
        assert!(logger.wait_for_errors(1, Duration::from_millis(10)));
        assert_eq!(logger.entries().len(), 2);
    }
}
