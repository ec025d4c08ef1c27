//! The user-supplied environment of the exchange layer.

use std::future::Future;
use std::sync::Arc;

use captains_log::filter::LogFilter;
use trunk_rpc_core::runtime::AsyncIO;

/// Plug point for the runtime and logging environment. Implement this once
/// per deployment; [ExchangeDefault] covers the common case.
pub trait ExchangeFacts: Send + Sync + Sized + 'static {
    /// The async runtime adapter, see [trunk_rpc_core::runtime].
    type IO: AsyncIO;

    /// Construct the log filter connection-scoped messages go through.
    fn new_logger(&self) -> Arc<LogFilter>;

    /// Spawn a detached task, on a global runtime or an owned executor.
    fn spawn_detach<F, R>(&self, f: F)
    where
        F: Future<Output = R> + Send + 'static,
        R: Send + 'static;
}

/// Facts with one shared log filter and an owned runtime handle.
pub struct ExchangeDefault<IO: AsyncIO> {
    pub logger: Arc<LogFilter>,
    rt: IO,
}

impl<IO: AsyncIO> ExchangeDefault<IO> {
    pub fn new(rt: IO) -> Arc<Self> {
        Arc::new(Self { logger: Arc::new(LogFilter::new()), rt })
    }

    #[inline]
    pub fn set_log_level(&self, level: log::Level) {
        self.logger.set_level(level);
    }
}

impl<IO: AsyncIO> ExchangeFacts for ExchangeDefault<IO> {
    type IO = IO;

    #[inline]
    fn new_logger(&self) -> Arc<LogFilter> {
        self.logger.clone()
    }

    #[inline]
    fn spawn_detach<F, R>(&self, f: F)
    where
        F: Future<Output = R> + Send + 'static,
        R: Send + 'static,
    {
        self.rt.spawn_detach(f)
    }
}
