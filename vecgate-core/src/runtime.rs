//! The runtime binds an engine to a configuration.
//!
//! Every constructor takes a [`Runtime`]; every handle keeps a clone of it.
//! Cloning is cheap (one `Arc`), and all clones share the engine, the
//! immutable [`EngineConfig`], and the pinned workers.

use std::fmt;
use std::sync::Arc;

use tracing::info;

use crate::batch::PinnedPool;
use crate::config::EngineConfig;
use crate::engine::{default_engine, MockEngine, NativeEngine};
use crate::error::{Error, Result};
use crate::gateway::Gateway;
use crate::metrics;

struct RuntimeInner {
    gateway: Gateway,
    config: EngineConfig,
    pinned: Option<PinnedPool>,
}

/// An engine plus its configuration.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// Validates `config`, applies its process-wide settings to the engine,
    /// and starts the pinned workers.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] for a rejected config, or
    /// [`Error::NativeFailure`] if the engine refuses the thread count.
    ///
    /// # Example
    ///
    /// ```
    /// use std::sync::Arc;
    /// use vecgate_core::{EngineConfig, MockEngine, Runtime};
    ///
    /// let runtime = Runtime::new(Arc::new(MockEngine::new()), EngineConfig::default()).unwrap();
    /// assert_eq!(runtime.engine_name(), "mock");
    /// ```
    pub fn new(engine: Arc<dyn NativeEngine>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let gateway = Gateway::new(engine);
        if let Some(threads) = config.num_threads {
            gateway.set_num_threads(threads)?;
        }
        if config.metrics {
            metrics::enable();
        }
        let pinned = match config.batch.pinned_workers {
            0 => None,
            workers => Some(PinnedPool::new(workers)?),
        };
        info!(
            engine = gateway.engine_name(),
            num_threads = ?config.num_threads,
            pinned_workers = config.batch.pinned_workers,
            metrics = config.metrics,
            "runtime initialized"
        );
        Ok(Self {
            inner: Arc::new(RuntimeInner {
                gateway,
                config,
                pinned,
            }),
        })
    }

    /// The compile-time default engine with `config` and environment
    /// overrides applied.
    pub fn from_env(config: EngineConfig) -> Result<Self> {
        Self::new(default_engine(), config.with_env_overrides()?)
    }

    /// An in-process engine with the default config.
    pub fn mock() -> Result<Self> {
        Self::new(Arc::new(MockEngine::new()), EngineConfig::default())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn engine_name(&self) -> &'static str {
        self.inner.gateway.engine_name()
    }

    /// Returns true if both runtimes drive the same engine instance.
    pub fn shares_engine(&self, other: &Runtime) -> bool {
        self.inner.gateway.same_engine(&other.inner.gateway)
    }

    pub(crate) fn gateway(&self) -> &Gateway {
        &self.inner.gateway
    }

    pub(crate) fn ensure_same_engine(&self, other: &Runtime) -> Result<()> {
        if self.shares_engine(other) {
            Ok(())
        } else {
            Err(Error::InvalidParameter(
                "handles belong to different engines".to_string(),
            ))
        }
    }

    /// Runs a call over `n` items, on a pinned worker when the batch policy
    /// says so.
    pub(crate) fn run_batch<R, F>(&self, n: usize, f: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        match &self.inner.pinned {
            Some(pool) if self.inner.config.batch.should_pin(n) => pool.run(f),
            _ => f(),
        }
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("engine", &self.engine_name())
            .field("config", &self.inner.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchConfig;
    use std::thread;

    #[test]
    fn test_applies_thread_count() {
        let engine = Arc::new(MockEngine::new());
        let config = EngineConfig::new().with_num_threads(3);
        let _runtime = Runtime::new(engine.clone(), config).unwrap();
        assert_eq!(engine.num_threads(), 3);
        assert_eq!(engine.calls("set_num_threads"), 1);
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = EngineConfig::new().with_batch(BatchConfig::default().with_add_batch_size(0));
        assert!(matches!(
            Runtime::new(Arc::new(MockEngine::new()), config),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_thread_count_failure_surfaces() {
        let engine = Arc::new(MockEngine::new());
        engine.fail_next("set_num_threads", -2);
        let result = Runtime::new(engine, EngineConfig::new().with_num_threads(2));
        assert!(matches!(result, Err(Error::NativeFailure { code: -2, .. })));
    }

    #[test]
    fn test_run_batch_pins_large_batches() {
        let config = EngineConfig::new().with_batch(
            BatchConfig::default()
                .with_pin_threshold(10)
                .with_pinned_workers(1),
        );
        let runtime = Runtime::new(Arc::new(MockEngine::new()), config).unwrap();
        let name = |n| runtime.run_batch(n, || thread::current().name().map(str::to_string));
        assert_eq!(name(11).as_deref(), Some("vecgate-pinned-0"));
        assert_ne!(name(10).as_deref(), Some("vecgate-pinned-0"));
    }

    #[test]
    fn test_shares_engine() {
        let a = Runtime::mock().unwrap();
        let b = Runtime::mock().unwrap();
        assert!(a.shares_engine(&a.clone()));
        assert!(!a.shares_engine(&b));
        assert!(a.ensure_same_engine(&b).is_err());
    }
}
