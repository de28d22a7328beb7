//! Kernel pool (spec §4.2): a set of pre-started executors waiting to be
//! claimed, keyed by `(mode, language)`. Pool slots are never visible to
//! clients; `take` is the only fast path the kernel manager uses before
//! falling back to a synchronous cold start.

use std::collections::HashMap;

use engine_protocol::KernelMode;
use engine_protocol::Language;
use parking_lot::Mutex;
use tracing::debug;
use tracing::warn;

use crate::config::PoolConfig;
use crate::executor::Executor;
use crate::executor::spawn_executor;

type Key = (KernelMode, Language);

pub struct KernelPool {
    config: PoolConfig,
    idle: Mutex<HashMap<Key, Vec<Box<dyn Executor>>>>,
}

impl KernelPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            idle: Mutex::new(HashMap::new()),
        }
    }

    /// O(1), non-blocking: returns `None` immediately if the pool has no
    /// idle executor for `(mode, language)` rather than waiting for one.
    pub fn take(&self, mode: KernelMode, language: Language) -> Option<Box<dyn Executor>> {
        if !self.config.enabled {
            return None;
        }
        let executor = self.idle.lock().get_mut(&(mode, language))?.pop();
        if executor.is_some() {
            debug!(?mode, ?language, "took executor from pool");
        }
        executor
    }

    /// Taken executors are never returned to the pool; this only accepts
    /// freshly started executors produced by [`Self::refill`].
    fn insert_idle(&self, mode: KernelMode, language: Language, executor: Box<dyn Executor>) {
        let mut idle = self.idle.lock();
        let slot = idle.entry((mode, language)).or_default();
        if slot.len() < self.config.pool_size {
            slot.push(executor);
        }
    }

    pub fn idle_count(&self, mode: KernelMode, language: Language) -> usize {
        self.idle
            .lock()
            .get(&(mode, language))
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Best-effort top-up of every configured `(mode, language)` pair up to
    /// `poolSize`; failures here are logged, never surfaced to a caller.
    pub async fn refill(&self) {
        if !self.config.enabled || !self.config.auto_refill {
            return;
        }
        let mut targets = self.config.preload_configs.clone();
        targets.sort();
        targets.dedup();
        for (mode, language) in targets {
            let deficit = self
                .config
                .pool_size
                .saturating_sub(self.idle_count(mode, language));
            for _ in 0..deficit {
                let executor = spawn_executor(language);
                if let Err(err) = executor.start().await {
                    warn!(?mode, ?language, %err, "pool refill failed to start executor");
                    continue;
                }
                self.insert_idle(mode, language, executor);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn take_on_empty_pool_returns_none() {
        let pool = KernelPool::new(PoolConfig {
            enabled: true,
            pool_size: 2,
            auto_refill: false,
            preload_configs: Vec::new(),
        });
        assert!(pool.take(KernelMode::Worker, Language::Python).is_none());
    }

    #[test]
    fn disabled_pool_never_yields_executors() {
        let pool = KernelPool::new(PoolConfig {
            enabled: false,
            pool_size: 2,
            auto_refill: false,
            preload_configs: Vec::new(),
        });
        assert!(pool.take(KernelMode::Worker, Language::Python).is_none());
    }

    #[tokio::test]
    async fn refill_is_noop_when_auto_refill_disabled() {
        let pool = KernelPool::new(PoolConfig {
            enabled: true,
            pool_size: 2,
            auto_refill: false,
            preload_configs: vec![(KernelMode::Worker, Language::Python)],
        });
        pool.refill().await;
        assert_eq!(pool.idle_count(KernelMode::Worker, Language::Python), 0);
    }
}
