//! Bulkhead admission controller.
//!
//! Bounds how many calls of one guarded method execute at once. A call that
//! finds a free slot runs immediately. Otherwise an asynchronous call may
//! wait in a bounded FIFO queue; a synchronous call, or any call arriving
//! when the queue is full, is rejected straight away.
//!
//! ## Example
//!
//! ```rust,ignore
//! use rampart::BulkheadConfig;
//!
//! // 10 concurrent executions, 10 more asynchronous calls may wait.
//! let bulkhead = BulkheadConfig::new(10).queue_capacity(10);
//! ```

use super::PolicyEnv;
use crate::error::DefinitionError;
use crate::invocation::{ExecutionMode, InvocationContext};
use crate::outcome::Outcome;
use crate::policy::{Next, Policy, PolicyKind};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Bulkhead configuration.
///
/// A slot is released when the work behind it returns. Work abandoned by an
/// outer timeout still holds its slot, so retries of a timed-out call may be
/// rejected as `BulkheadFull` while it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkheadConfig {
    /// Maximum concurrent executions.
    pub max_concurrent: u32,
    /// Asynchronous calls allowed to wait for a slot.
    pub queue_capacity: u32,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            queue_capacity: 10,
        }
    }
}

impl BulkheadConfig {
    pub fn new(max_concurrent: u32) -> Self {
        Self {
            max_concurrent,
            ..Default::default()
        }
    }

    pub fn queue_capacity(mut self, capacity: u32) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.max_concurrent == 0 {
            return Err(DefinitionError::invalid(
                PolicyKind::Bulkhead,
                "value",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Shared admission state of one guarded method.
pub struct Bulkhead {
    name: String,
    config: BulkheadConfig,
    semaphore: Arc<Semaphore>,
    active_count: AtomicU32,
    queued_count: AtomicU32,
    total_calls: AtomicU64,
    total_rejections: AtomicU64,
}

impl Bulkhead {
    pub fn new(name: impl Into<String>, config: BulkheadConfig) -> Arc<Self> {
        let name = name.into();
        tracing::info!(
            name = %name,
            max_concurrent = config.max_concurrent,
            queue_capacity = config.queue_capacity,
            "Bulkhead initialized"
        );

        Arc::new(Self {
            name,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent as usize)),
            config,
            active_count: AtomicU32::new(0),
            queued_count: AtomicU32::new(0),
            total_calls: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BulkheadConfig {
        &self.config
    }

    /// Calls currently executing.
    pub fn active_count(&self) -> u32 {
        self.active_count.load(Ordering::SeqCst)
    }

    /// Calls currently waiting in the queue.
    pub fn queued_count(&self) -> u32 {
        self.queued_count.load(Ordering::SeqCst)
    }

    /// Admit without waiting.
    pub fn try_admit(self: &Arc<Self>) -> Option<BulkheadPermit> {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Some(self.activate(permit)),
            Err(_) => {
                self.reject();
                None
            }
        }
    }

    /// Admit, queueing if the call is asynchronous and the queue has room.
    pub async fn admit(self: &Arc<Self>, mode: ExecutionMode) -> Option<BulkheadPermit> {
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
            return Some(self.activate(permit));
        }

        if mode == ExecutionMode::Synchronous || !self.reserve_queue_slot() {
            self.reject();
            return None;
        }

        let slot = QueueSlot { bulkhead: self };
        debug!(name = %self.name, queued = self.queued_count(), "Bulkhead full, queueing call");
        // Tokio's semaphore is fair, so waiters are served in FIFO order.
        let acquired = self.semaphore.clone().acquire_owned().await;
        drop(slot);

        match acquired {
            Ok(permit) => Some(self.activate(permit)),
            Err(_) => {
                self.reject();
                None
            }
        }
    }

    fn reserve_queue_slot(&self) -> bool {
        let capacity = self.config.queue_capacity;
        self.queued_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |queued| {
                (queued < capacity).then_some(queued + 1)
            })
            .is_ok()
    }

    fn activate(self: &Arc<Self>, permit: OwnedSemaphorePermit) -> BulkheadPermit {
        self.active_count.fetch_add(1, Ordering::SeqCst);
        BulkheadPermit {
            bulkhead: self.clone(),
            _permit: permit,
        }
    }

    fn reject(&self) {
        self.total_rejections.fetch_add(1, Ordering::Relaxed);
        debug!(name = %self.name, "Bulkhead full, rejecting call");
    }

    pub fn stats(&self) -> BulkheadStats {
        BulkheadStats {
            max_concurrent: self.config.max_concurrent,
            queue_capacity: self.config.queue_capacity,
            active_count: self.active_count(),
            queued_count: self.queued_count(),
            available_permits: self.semaphore.available_permits() as u32,
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bulkhead")
            .field("name", &self.name)
            .field("active", &self.active_count())
            .field("queued", &self.queued_count())
            .finish()
    }
}

struct QueueSlot<'a> {
    bulkhead: &'a Bulkhead,
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.bulkhead.queued_count.fetch_sub(1, Ordering::SeqCst);
    }
}

/// An execution slot. Released when dropped.
pub struct BulkheadPermit {
    bulkhead: Arc<Bulkhead>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for BulkheadPermit {
    fn drop(&mut self) {
        self.bulkhead.active_count.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Bulkhead statistics.
#[derive(Debug, Clone, Serialize)]
pub struct BulkheadStats {
    pub max_concurrent: u32,
    pub queue_capacity: u32,
    pub active_count: u32,
    pub queued_count: u32,
    pub available_permits: u32,
    pub total_calls: u64,
    pub total_rejections: u64,
}

impl BulkheadStats {
    /// Calculate utilization (0.0 - 1.0).
    pub fn utilization(&self) -> f64 {
        self.active_count as f64 / self.max_concurrent as f64
    }
}

/// Stage gating the work with a shared [`Bulkhead`].
pub struct BulkheadPolicy {
    bulkhead: Arc<Bulkhead>,
    env: PolicyEnv,
}

impl BulkheadPolicy {
    pub fn new(bulkhead: Arc<Bulkhead>, env: PolicyEnv) -> Self {
        Self { bulkhead, env }
    }
}

#[async_trait]
impl<T: Send + 'static> Policy<T> for BulkheadPolicy {
    fn name(&self) -> &str {
        PolicyKind::Bulkhead.as_str()
    }

    async fn guard(&self, ctx: InvocationContext, next: Next<T>) -> Outcome<T> {
        let Some(permit) = self.bulkhead.admit(ctx.mode()).await else {
            debug!(method = %self.env.method, mode = ?ctx.mode(), "Bulkhead rejected call");
            return Outcome::BulkheadRejected;
        };

        let outcome = next.run(ctx).await;
        drop(permit);
        outcome
    }
}
