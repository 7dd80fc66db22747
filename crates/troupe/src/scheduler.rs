//! Timer scheduler backed by a dedicated tokio runtime

use crate::error::{ActorError, ActorResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::debug;

/// Handle to a scheduled task
#[derive(Debug, Clone)]
pub struct Cancellable {
    cancelled: Arc<AtomicBool>,
    handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Cancellable {
    fn new(cancelled: Arc<AtomicBool>, handle: JoinHandle<()>) -> Self {
        Self {
            cancelled,
            handle: Arc::new(Mutex::new(Some(handle))),
        }
    }

    /// Prevent future firings; a firing already in progress completes.
    ///
    /// Returns false if the task was already cancelled.
    pub fn cancel(&self) -> bool {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Runs one-shot and recurring tasks off the dispatcher threads
pub struct Scheduler {
    runtime: Mutex<Option<Runtime>>,
}

impl Scheduler {
    pub fn new(name: &str) -> ActorResult<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name(format!("{name}-scheduler"))
            .enable_time()
            .build()
            .map_err(|e| ActorError::Internal {
                reason: format!("failed to start scheduler runtime: {e}"),
            })?;
        Ok(Self {
            runtime: Mutex::new(Some(runtime)),
        })
    }

    /// Run `task` once after `delay`
    pub fn schedule_once<F>(&self, task: F, delay: Duration) -> ActorResult<Cancellable>
    where
        F: FnOnce() + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let handle = self.spawn(async move {
            time::sleep(delay).await;
            if !flag.load(Ordering::Acquire) {
                task();
            }
        })?;
        Ok(Cancellable::new(cancelled, handle))
    }

    /// Run `task` after `initial_delay` and then every `interval`
    pub fn schedule_recurring<F>(
        &self,
        task: F,
        initial_delay: Duration,
        interval: Duration,
    ) -> ActorResult<Cancellable>
    where
        F: Fn() + Send + Sync + 'static,
    {
        if interval.is_zero() {
            return Err(ActorError::ConfigurationError {
                parameter: "interval".to_string(),
                reason: "recurring interval must be non-zero".to_string(),
            });
        }
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let handle = self.spawn(async move {
            let mut ticks = time::interval_at(time::Instant::now() + initial_delay, interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticks.tick().await;
                if flag.load(Ordering::Acquire) {
                    break;
                }
                task();
            }
        })?;
        Ok(Cancellable::new(cancelled, handle))
    }

    fn spawn<F>(&self, future: F) -> ActorResult<JoinHandle<()>>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let runtime = self.runtime.lock();
        match runtime.as_ref() {
            Some(runtime) => Ok(runtime.spawn(future)),
            None => Err(ActorError::SchedulerClosed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.runtime.lock().is_none()
    }

    /// Stop all timers; idempotent
    pub fn close(&self) {
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
            debug!("Scheduler closed");
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_schedule_once_fires() {
        let scheduler = Scheduler::new("once").unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        scheduler
            .schedule_once(
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
                Duration::from_millis(5),
            )
            .unwrap();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        scheduler.close();
    }

    #[test]
    fn test_recurring_until_cancelled() {
        let scheduler = Scheduler::new("recurring").unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let cancellable = scheduler
            .schedule_recurring(
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
                Duration::ZERO,
                Duration::from_millis(5),
            )
            .unwrap();
        thread::sleep(Duration::from_millis(60));
        assert!(cancellable.cancel());
        assert!(!cancellable.cancel());
        let after_cancel = fired.load(Ordering::SeqCst);
        assert!(after_cancel >= 2);
        thread::sleep(Duration::from_millis(40));
        assert!(fired.load(Ordering::SeqCst) <= after_cancel + 1);
        scheduler.close();
    }

    #[test]
    fn test_cancel_before_firing() {
        let scheduler = Scheduler::new("cancel").unwrap();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let cancellable = scheduler
            .schedule_once(move || flag.store(true, Ordering::SeqCst), Duration::from_millis(30))
            .unwrap();
        assert!(cancellable.cancel());
        assert!(cancellable.is_cancelled());
        thread::sleep(Duration::from_millis(60));
        assert!(!fired.load(Ordering::SeqCst));
        scheduler.close();
    }

    #[test]
    fn test_closed_scheduler_rejects() {
        let scheduler = Scheduler::new("closed").unwrap();
        scheduler.close();
        scheduler.close();
        assert!(scheduler.is_closed());
        assert!(matches!(
            scheduler.schedule_once(|| {}, Duration::ZERO),
            Err(ActorError::SchedulerClosed)
        ));
        assert!(matches!(
            scheduler.schedule_recurring(|| {}, Duration::ZERO, Duration::ZERO),
            Err(ActorError::ConfigurationError { .. })
        ));
    }
}
