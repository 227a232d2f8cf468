//! Runtime for the command line front end.
//!
//! Dropping a tokio runtime waits for every `spawn_blocking` task, and a camera
//! init that hangs in the driver never finishes. The binary therefore runs on a
//! runtime whose shutdown gives blocking work a bounded grace period and then
//! abandons it.

use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::CameraResult;

/// How long shutdown waits for blocking work before abandoning it
pub const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Run `future` to completion on a new multi-threaded runtime, then shut the
/// runtime down, waiting at most `grace` for blocking tasks.
pub fn block_on_bounded<F: Future>(future: F, grace: Duration) -> CameraResult<F::Output> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let output = runtime.block_on(future);

    debug!(
        "Shutting down runtime, waiting up to {}ms for blocking tasks",
        grace.as_millis()
    );
    runtime.shutdown_timeout(grace);
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MemorySelectionStore, Settings};
    use crate::registry::start_device_registry;
    use crate::simulated::{HangGate, SimBehavior, SimulatedBackend};
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_returns_future_output() {
        let output = block_on_bounded(async { 40 + 2 }, Duration::from_millis(10))
            .expect("Test operation should succeed");
        assert_eq!(output, 42);
    }

    #[test]
    fn test_hung_init_does_not_hold_shutdown() {
        let gate = HangGate::new();
        let backend = Arc::new(SimulatedBackend::new().with_device(
            "Stuck Camera",
            "stuck",
            SimBehavior::Hang(gate.clone()),
        ));
        let settings = Settings {
            race_timeout_ms: 50,
            watchdog_timeout_ms: 100,
            ..Settings::default()
        };

        let started = Instant::now();
        let state = block_on_bounded(
            async move {
                let registry = start_device_registry(
                    backend,
                    Arc::new(MemorySelectionStore::default()),
                    &settings,
                )?;
                let state = registry
                    .load_and_wait("stuck", Duration::from_secs(2))
                    .await?;
                registry.shutdown().await?;
                CameraResult::Ok(state)
            },
            Duration::from_millis(100),
        )
        .expect("Test operation should succeed")
        .expect("Test operation should succeed");
        let elapsed = started.elapsed();
        gate.release();

        assert!(state.is_failed(), "{state:?}");
        assert!(
            elapsed < Duration::from_secs(5),
            "Shutdown waited on the hung init for {elapsed:?}"
        );
    }
}
