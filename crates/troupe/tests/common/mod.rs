//! Shared helpers for stage integration tests

#![allow(dead_code)]

use std::sync::Once;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use troupe::{DispatcherConfig, Stage, StageConfig};

static INIT: Once = Once::new();

/// Timeout used when waiting for actor effects
pub const WAIT: Duration = Duration::from_secs(5);

/// Install a test subscriber once; `RUST_LOG` overrides the default filter
pub fn init_test_env() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Small stage configuration suited to tests
pub fn test_config() -> StageConfig {
    StageConfig {
        dispatcher: DispatcherConfig {
            pool_size: 4,
            queue_capacity: 4096,
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn test_stage(name: &str) -> Stage {
    init_test_env();
    Stage::new(name, test_config()).expect("stage should start")
}

/// Poll `condition` until it holds or the timeout passes
pub fn eventually<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}
