//! Execution context shared by indexes: memory budget for inverted-list
//! storage, worker pool for batch work, and the list growth policy.
//!
//! A `Resources` value is created once and handed to every index that should
//! draw from the same budget. Index operations receive it explicitly; nothing
//! here is global.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::ResourcesConfig;
use crate::error::{IvfSqError, Result};
use crate::index::ivf_sq::invlists::GrowthPolicy;

/// Byte budget charged by list allocations and credited by releases.
#[derive(Debug)]
pub struct MemoryBudget {
    limit: Option<usize>,
    allocated: AtomicUsize,
}

impl MemoryBudget {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            limit,
            allocated: AtomicUsize::new(0),
        }
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Bytes currently charged.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    /// Bytes that can still be charged.
    pub fn available(&self) -> usize {
        match self.limit {
            Some(limit) => limit.saturating_sub(self.allocated()),
            None => usize::MAX,
        }
    }

    /// Charge `bytes` or fail with `OutOfMemory` without charging anything.
    pub fn try_charge(&self, bytes: usize) -> Result<()> {
        if bytes == 0 {
            return Ok(());
        }
        let Some(limit) = self.limit else {
            self.allocated.fetch_add(bytes, Ordering::AcqRel);
            return Ok(());
        };
        let mut current = self.allocated.load(Ordering::Acquire);
        loop {
            let next = current.saturating_add(bytes);
            if next > limit {
                crate::metrics::ALLOCATION_FAILURES_TOTAL.inc();
                warn!(requested = bytes, allocated = current, limit, "memory budget exceeded");
                return Err(IvfSqError::OutOfMemory {
                    requested: bytes,
                    available: limit.saturating_sub(current),
                });
            }
            match self.allocated.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Return `bytes` to the budget.
    pub fn release(&self, bytes: usize) {
        if bytes == 0 {
            return;
        }
        let prev = self.allocated.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(prev >= bytes, "released more than was charged");
    }
}

/// Explicit execution context threaded through index operations.
#[derive(Debug)]
pub struct Resources {
    budget: MemoryBudget,
    pool: Option<rayon::ThreadPool>,
    growth_policy: GrowthPolicy,
}

impl Resources {
    /// Build a context from config. A dedicated pool is created when
    /// `num_threads > 0`; otherwise batch work runs on rayon's global pool.
    pub fn new(config: &ResourcesConfig) -> Result<Arc<Self>> {
        let pool = if config.num_threads > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(config.num_threads)
                .thread_name(|i| format!("ivfsq-worker-{i}"))
                .build()
                .map_err(|e| IvfSqError::Config(format!("failed to build worker pool: {e}")))?;
            Some(pool)
        } else {
            None
        };
        debug!(
            memory_limit = ?config.memory_limit_bytes,
            num_threads = config.num_threads,
            growth_policy = ?config.growth_policy,
            "resources initialised"
        );
        Ok(Arc::new(Self {
            budget: MemoryBudget::new(config.memory_limit_bytes),
            pool,
            growth_policy: config.growth_policy,
        }))
    }

    /// Unlimited memory, global rayon pool, doubling growth.
    pub fn unbounded() -> Arc<Self> {
        Arc::new(Self {
            budget: MemoryBudget::new(None),
            pool: None,
            growth_policy: GrowthPolicy::default(),
        })
    }

    /// Unbounded context except for a byte limit on list storage.
    pub fn with_memory_limit(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            budget: MemoryBudget::new(Some(limit)),
            pool: None,
            growth_policy: GrowthPolicy::default(),
        })
    }

    pub fn budget(&self) -> &MemoryBudget {
        &self.budget
    }

    pub fn growth_policy(&self) -> GrowthPolicy {
        self.growth_policy
    }

    /// Run `op` inside this context's worker pool.
    pub fn install<OP, R>(&self, op: OP) -> R
    where
        OP: FnOnce() -> R + Send,
        R: Send,
    {
        match &self.pool {
            Some(pool) => pool.install(op),
            None => op(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_charge_and_release() {
        let budget = MemoryBudget::new(Some(100));
        budget.try_charge(60).unwrap();
        assert_eq!(budget.available(), 40);
        let err = budget.try_charge(41).unwrap_err();
        assert!(matches!(
            err,
            IvfSqError::OutOfMemory {
                requested: 41,
                available: 40
            }
        ));
        // A refused charge leaves the budget untouched.
        assert_eq!(budget.allocated(), 60);
        budget.release(60);
        assert_eq!(budget.allocated(), 0);
    }

    #[test]
    fn test_unlimited_budget() {
        let budget = MemoryBudget::new(None);
        budget.try_charge(usize::MAX / 2).unwrap();
        assert_eq!(budget.available(), usize::MAX);
    }

    #[test]
    fn test_dedicated_pool() {
        let config = ResourcesConfig {
            memory_limit_bytes: None,
            num_threads: 2,
            growth_policy: GrowthPolicy::Doubling,
        };
        let res = Resources::new(&config).unwrap();
        let threads = res.install(rayon::current_num_threads);
        assert_eq!(threads, 2);
    }
}
