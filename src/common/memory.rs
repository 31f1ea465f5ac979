// Memory Accounting
//
// A byte-granular memory monitor with per-component accounts. Flows open
// one account for expression evaluation scratch space; it is cleared on every
// row handed to the terminal consumer and closed when the flow is cleaned up.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::warn;

use crate::exec::error::{FlowError, Result};

/// Tracks the total bytes reserved by all accounts opened against it
#[derive(Debug)]
pub struct MemoryMonitor {
    name: String,
    /// Maximum bytes the monitor hands out; `None` means unlimited
    budget: Option<u64>,
    used: AtomicU64,
}

impl MemoryMonitor {
    pub fn new(name: impl Into<String>, budget: Option<u64>) -> Arc<Self> {
        Arc::new(MemoryMonitor {
            name: name.into(),
            budget,
            used: AtomicU64::new(0),
        })
    }

    pub fn unlimited(name: impl Into<String>) -> Arc<Self> {
        Self::new(name, None)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bytes currently reserved across all accounts
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }

    fn reserve(&self, bytes: u64) -> Result<()> {
        let previous = self.used.fetch_add(bytes, Ordering::SeqCst);
        if let Some(budget) = self.budget {
            if previous + bytes > budget {
                self.used.fetch_sub(bytes, Ordering::SeqCst);
                return Err(FlowError::MemoryBudgetExceeded {
                    monitor: self.name.clone(),
                    requested: bytes,
                    budget,
                });
            }
        }
        Ok(())
    }

    fn release(&self, bytes: u64) {
        self.used.fetch_sub(bytes, Ordering::SeqCst);
    }

    /// Open a new, empty account against this monitor
    pub fn make_account(self: &Arc<Self>) -> Arc<BoundAccount> {
        Arc::new(BoundAccount {
            monitor: Arc::clone(self),
            used: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }
}

/// A slice of a monitor's budget owned by one component
#[derive(Debug)]
pub struct BoundAccount {
    monitor: Arc<MemoryMonitor>,
    used: AtomicU64,
    closed: AtomicBool,
}

impl BoundAccount {
    pub fn grow(&self, bytes: u64) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FlowError::Internal(format!(
                "grow on closed account of monitor {}",
                self.monitor.name
            )));
        }
        self.monitor.reserve(bytes)?;
        self.used.fetch_add(bytes, Ordering::SeqCst);
        Ok(())
    }

    pub fn shrink(&self, bytes: u64) {
        let mut current = self.used.load(Ordering::SeqCst);
        loop {
            let delta = bytes.min(current);
            match self.used.compare_exchange(current, current - delta, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => {
                    self.monitor.release(delta);
                    return;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Release everything this account holds, keeping it open
    pub fn clear(&self) {
        let held = self.used.swap(0, Ordering::SeqCst);
        if held > 0 {
            self.monitor.release(held);
        }
    }

    /// Release everything and refuse further growth
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            warn!("memory account of monitor {} closed twice", self.monitor.name);
            return;
        }
        self.clear();
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
