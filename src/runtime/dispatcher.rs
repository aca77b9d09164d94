//! Process-wide budget of compute slots
//!
//! Every model invocation reserves one slot for its whole lifetime, so the
//! number of invocations running at once never exceeds the machine's cores
//! regardless of how many models are loaded.

use crate::error::{ForgeResult, GraphForgeError};
use once_cell::sync::Lazy;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

static GLOBAL_DISPATCHER: Lazy<ResourceDispatcher> =
    Lazy::new(|| ResourceDispatcher::new(available_cores()));

/// Number of cores reported by the OS, at least 1
pub fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Bounded pool of compute slots shared by all models
#[derive(Debug)]
pub struct ResourceDispatcher {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// One reserved slot. Released when dropped.
#[derive(Debug)]
pub struct CoreReservation {
    _permit: OwnedSemaphorePermit,
}

impl ResourceDispatcher {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        ResourceDispatcher {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// The shared dispatcher, sized to the available cores
    pub fn global() -> &'static ResourceDispatcher {
        &GLOBAL_DISPATCHER
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots not currently reserved
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait until a slot is free and reserve it.
    ///
    /// The dispatcher's semaphore is never closed, so this only returns an
    /// error if that invariant is broken.
    pub async fn reserve_core(&self) -> ForgeResult<CoreReservation> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| GraphForgeError::InternalError("resource dispatcher closed".to_string()))?;
        tracing::trace!(available = self.available(), "reserved core");
        Ok(CoreReservation { _permit: permit })
    }

    /// Reserve a slot only if one is free right now
    pub fn try_reserve_core(&self) -> Option<CoreReservation> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .ok()
            .map(|permit| CoreReservation { _permit: permit })
    }
}
