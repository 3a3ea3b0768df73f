//! Time abstraction layer for testable time-dependent operations
//!
//! This module provides a `TimeProvider` trait that allows for controlling
//! time in tests while using real time in production, without conditional
//! compilation. Leases, visibility delays and the auto-dispatch debounce all
//! read the clock through this seam.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};
use tokio::time::sleep as tokio_sleep;

/// Trait for providing time-related functionality
///
/// This allows for dependency injection of time behavior, enabling fast test
/// execution without real-time delays.
#[async_trait]
pub trait TimeProvider: Send + Sync + std::fmt::Debug {
    /// Sleep for the specified duration
    async fn sleep(&self, duration: Duration);

    /// Get the current system time
    #[must_use]
    fn now(&self) -> SystemTime;
}

/// Real time provider for production use
#[derive(Debug, Clone, Default)]
pub struct RealTimeProvider;

impl RealTimeProvider {
    /// Creates a new real time provider
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TimeProvider for RealTimeProvider {
    async fn sleep(&self, duration: Duration) {
        tokio_sleep(duration).await;
    }

    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Manually driven time provider for tests.
///
/// The clock only moves when a test calls [`ManualTimeProvider::advance`] or
/// [`ManualTimeProvider::set`]. Sleeps are capped at one millisecond of real
/// time so async machinery still gets a chance to yield.
#[derive(Debug)]
pub struct ManualTimeProvider {
    now: Mutex<SystemTime>,
}

impl Default for ManualTimeProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualTimeProvider {
    /// Creates a manual provider starting at the current wall clock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            now: Mutex::new(SystemTime::now()),
        }
    }

    /// Creates a manual provider starting at `start`.
    #[must_use]
    pub fn starting_at(start: SystemTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Moves the clock forward by `delta`.
    pub fn advance(&self, delta: Duration) {
        let mut now = self.now.lock().expect("time mutex poisoned");
        *now += delta;
    }

    /// Sets the clock to an absolute time.
    pub fn set(&self, to: SystemTime) {
        let mut now = self.now.lock().expect("time mutex poisoned");
        *now = to;
    }
}

#[async_trait]
impl TimeProvider for ManualTimeProvider {
    async fn sleep(&self, duration: Duration) {
        // Tests drive the clock by hand; never block for the full duration.
        if duration > Duration::from_millis(1) {
            tokio_sleep(Duration::from_millis(1)).await;
        }
    }

    fn now(&self) -> SystemTime {
        *self.now.lock().expect("time mutex poisoned")
    }
}

/// Type alias for shared time provider
pub type SharedTimeProvider = Arc<dyn TimeProvider>;

/// Create a production time provider
#[must_use]
pub fn production_time_provider() -> SharedTimeProvider {
    Arc::new(RealTimeProvider::new())
}

/// Create a manually driven time provider for tests
#[must_use]
pub fn manual_time_provider() -> Arc<ManualTimeProvider> {
    Arc::new(ManualTimeProvider::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn manual_provider_skips_long_sleeps() {
        let provider = ManualTimeProvider::new();
        let start = Instant::now();

        provider.sleep(Duration::from_secs(10)).await;

        let elapsed = start.elapsed();
        assert!(
            elapsed < Duration::from_millis(100),
            "manual sleep took too long: {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn manual_provider_only_moves_when_advanced() {
        let provider = ManualTimeProvider::new();
        let before = provider.now();

        provider.sleep(Duration::from_secs(5)).await;
        assert_eq!(provider.now(), before);

        provider.advance(Duration::from_secs(30));
        assert_eq!(before + Duration::from_secs(30), provider.now());
    }

    #[tokio::test]
    async fn real_provider_actually_sleeps() {
        let provider = RealTimeProvider::new();
        let start = Instant::now();

        provider.sleep(Duration::from_millis(50)).await;

        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_millis(50),
            "real sleep was too short: {elapsed:?}"
        );
    }
}
