//! Shared rate budget bounding concurrent upstream calls.
//!
//! A single [`RateBudget`] is injected into every orchestrator instead of
//! living as ambient global state. Acquisition is an atomic
//! compare-and-decrement, so concurrent requests can never over-admit;
//! permits restore themselves on drop, including on cancellation and panic
//! unwind paths.
//!
//! Waiting is lock-free: an exhausted budget parks the caller on a
//! [`Notify`] until some in-flight call returns its permit. The wait is a
//! plain future, so the orchestrator can race it against cancellation.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Counter of upstream call slots shared across all in-flight requests.
#[derive(Debug)]
pub struct RateBudget {
    capacity: u32,
    available: AtomicU32,
    freed: Notify,
}

impl RateBudget {
    pub fn new(capacity: u32) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            available: AtomicU32::new(capacity),
            freed: Notify::new(),
        })
    }

    /// Take a permit without waiting. Returns `None` when exhausted.
    pub fn try_acquire(self: &Arc<Self>) -> Option<BudgetPermit> {
        let mut current = self.available.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return None;
            }
            match self.available.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(BudgetPermit {
                        budget: Arc::clone(self),
                    })
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Take a permit, waiting until one is free.
    ///
    /// Fair enough for this layer: wakeups race on the counter, so a late
    /// arrival can slip past a parked waiter, but no waiter can sleep
    /// through a free permit.
    pub async fn acquire(self: &Arc<Self>) -> BudgetPermit {
        loop {
            if let Some(permit) = self.try_acquire() {
                return permit;
            }
            let notified = self.freed.notified();
            tokio::pin!(notified);
            // Register interest before the re-check; a permit returned
            // between the failed try and the await would otherwise be missed.
            notified.as_mut().enable();
            if let Some(permit) = self.try_acquire() {
                return permit;
            }
            notified.await;
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Permits currently free. Diagnostic only; racy by nature.
    pub fn available(&self) -> u32 {
        self.available.load(Ordering::Acquire)
    }
}

/// An admitted call slot. Dropping it returns the slot and wakes one waiter.
#[derive(Debug)]
pub struct BudgetPermit {
    budget: Arc<RateBudget>,
}

impl Drop for BudgetPermit {
    fn drop(&mut self) {
        self.budget.available.fetch_add(1, Ordering::AcqRel);
        self.budget.freed.notify_one();
    }
}
