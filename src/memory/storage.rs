//! Per-model pool storage
//!
//! One [`BlockPool`] per element type, created lazily the first time an
//! allocation context asks for that type. Pools are scoped to a model id and
//! never shared between models.

use super::context::AllocationContext;
use super::element::{DataType, Element};
use super::pool::{BlockPool, PoolStats};
use crate::error::{ForgeResult, GraphForgeError};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// Type-erased view of a `BlockPool<T>`
trait ErasedPool: Send + Sync {
    fn stats(&self) -> PoolStats;
    fn clear(&self) -> usize;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Element> ErasedPool for BlockPool<T> {
    fn stats(&self) -> PoolStats {
        BlockPool::stats(self)
    }

    fn clear(&self) -> usize {
        BlockPool::clear(self)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Snapshot of a model's pools
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageStats {
    pub model_id: String,
    pub pooling: bool,
    pub per_type: BTreeMap<DataType, PoolStats>,
    pub total: PoolStats,
}

impl StorageStats {
    pub fn free_blocks(&self, data_type: DataType) -> usize {
        self.per_type
            .get(&data_type)
            .map(|s| s.free_blocks)
            .unwrap_or(0)
    }
}

impl fmt::Display for StorageStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "storage {} (pooling {}): {} free, {} fresh, {} reused",
            self.model_id,
            if self.pooling { "on" } else { "off" },
            self.total.free_blocks,
            self.total.fresh_blocks,
            self.total.reused_blocks
        )?;
        for (data_type, stats) in &self.per_type {
            writeln!(
                f,
                "  {:<8} free={:<6} fresh={:<6} reused={:<6} released={:<6} dropped={:<6} abandoned={}",
                data_type.name(),
                stats.free_blocks,
                stats.fresh_blocks,
                stats.reused_blocks,
                stats.released_blocks,
                stats.dropped_blocks,
                stats.abandoned_blocks
            )?;
        }
        Ok(())
    }
}

/// The set of pools owned by one model
pub struct ModelArrayStorage {
    model_id: String,
    pooling: bool,
    pools: RwLock<HashMap<DataType, Arc<dyn ErasedPool>>>,
    closed: AtomicBool,
}

impl fmt::Debug for ModelArrayStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelArrayStorage")
            .field("model_id", &self.model_id)
            .field("pooling", &self.pooling)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ModelArrayStorage {
    pub fn new(model_id: impl Into<String>, pooling: bool) -> Arc<Self> {
        Arc::new(ModelArrayStorage {
            model_id: model_id.into(),
            pooling,
            pools: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn pooling_enabled(&self) -> bool {
        self.pooling
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Pool for element type `T`, created on first use
    pub fn pool<T: Element>(&self) -> ForgeResult<Arc<BlockPool<T>>> {
        let existing = self.pools.read()?.get(&T::DATA_TYPE).cloned();
        let erased = match existing {
            Some(pool) => pool,
            None => {
                let mut pools = self.pools.write()?;
                Arc::clone(
                    pools
                        .entry(T::DATA_TYPE)
                        .or_insert_with(|| Arc::new(BlockPool::<T>::new()) as Arc<dyn ErasedPool>),
                )
            }
        };
        erased.into_any().downcast::<BlockPool<T>>().map_err(|_| {
            GraphForgeError::InternalError(format!(
                "pool registered for {} has the wrong element type",
                T::DATA_TYPE
            ))
        })
    }

    /// Open an allocation context drawing from these pools
    pub fn create_context(self: &Arc<Self>) -> ForgeResult<AllocationContext> {
        if self.is_closed() {
            return Err(GraphForgeError::ModelClosed(self.model_id.clone()));
        }
        Ok(AllocationContext::new(Arc::clone(self)))
    }

    /// Drop every pooled block of every element type.
    ///
    /// Arrays that are still alive are unaffected; only free-lists are emptied.
    pub fn clear_cache(&self) -> usize {
        let pools = match self.pools.read() {
            Ok(pools) => pools,
            Err(poisoned) => poisoned.into_inner(),
        };
        let cleared: usize = pools.values().map(|pool| pool.clear()).sum();
        tracing::debug!(model = %self.model_id, cleared, "cleared pooled blocks");
        cleared
    }

    pub fn stats(&self) -> StorageStats {
        let pools = match self.pools.read() {
            Ok(pools) => pools,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut stats = StorageStats {
            model_id: self.model_id.clone(),
            pooling: self.pooling,
            ..Default::default()
        };
        for (data_type, pool) in pools.iter() {
            let pool_stats = pool.stats();
            stats.total.merge(&pool_stats);
            stats.per_type.insert(*data_type, pool_stats);
        }
        stats
    }

    /// Drop all pools and refuse new contexts. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let cleared = self.clear_cache();
        match self.pools.write() {
            Ok(mut pools) => pools.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
        tracing::debug!(model = %self.model_id, cleared, "closed model storage");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_is_created_once_per_type() {
        let storage = ModelArrayStorage::new("m", true);
        let a = storage.pool::<f32>().unwrap();
        let b = storage.pool::<f32>().unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        storage.pool::<i64>().unwrap();
        let stats = storage.stats();
        assert_eq!(stats.per_type.len(), 2);
        assert!(stats.per_type.contains_key(&DataType::Int64));
    }

    #[test]
    fn test_clear_cache_empties_free_lists() {
        let storage = ModelArrayStorage::new("m", true);
        let pool = storage.pool::<f32>().unwrap();
        pool.release(pool.acquire(16, 4, false));
        assert_eq!(storage.stats().free_blocks(DataType::Float32), 4);

        assert_eq!(storage.clear_cache(), 4);
        assert_eq!(storage.stats().total.free_blocks, 0);
    }

    #[test]
    fn test_close_is_idempotent_and_refuses_contexts() {
        let storage = ModelArrayStorage::new("closing", true);
        storage.pool::<u8>().unwrap();
        storage.close();
        storage.close();
        assert!(storage.is_closed());
        assert!(storage.stats().per_type.is_empty());
        assert!(matches!(
            storage.create_context().unwrap_err(),
            GraphForgeError::ModelClosed(_)
        ));
    }

    #[test]
    fn test_stats_display_lists_types() {
        let storage = ModelArrayStorage::new("shown", false);
        storage.pool::<i32>().unwrap();
        let text = storage.stats().to_string();
        assert!(text.contains("pooling off"));
        assert!(text.contains("int32"));
    }
}
