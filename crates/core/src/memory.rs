//! Device memory accounting and admission control.
//!
//! [`MemoryAccountant`] re-queries the accelerator on every call and
//! admits a generation only when `free - safety_margin >= required`.
//! When the check fails it runs one tiered cleanup pass (standard clear,
//! synchronize, aggressive multi-pass clear) and re-checks exactly once
//! before reporting [`CoreError::ResourceExhausted`]. Admission never
//! silently proceeds.
//!
//! The accountant does not free device memory itself. Backends own their
//! allocations; the accountant only gates, observes and keeps the peak
//! usage watermark.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

use crate::error::CoreError;

/// Number of clear passes in the aggressive cleanup tier.
pub const AGGRESSIVE_CLEAR_PASSES: u32 = 3;

// ---------------------------------------------------------------------------
// Device abstraction
// ---------------------------------------------------------------------------

/// Raw memory counters reported by a device, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceReading {
    pub total: u64,
    /// Memory held by the allocator (in use plus cached).
    pub reserved: u64,
    /// Memory backing live allocations.
    pub allocated: u64,
}

/// Cleanup stages, run in this order when admission fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupTier {
    Standard,
    Synchronize,
    Aggressive,
}

/// An accelerator whose memory can be queried and whose caches can be
/// released.
pub trait DeviceMemory: Send + Sync {
    /// Human-readable device name for logs.
    fn name(&self) -> &str;

    /// Read current counters from the device.
    fn query(&self) -> Result<DeviceReading, CoreError>;

    /// Release cached, unused allocator blocks.
    fn clear_cache(&self) {}

    /// Wait for in-flight device work to finish.
    fn synchronize(&self) {}
}

/// A device with a fixed capacity and manually tracked usage.
///
/// Used on hosts without a hardware probe and in tests.
#[derive(Debug)]
pub struct FixedDevice {
    total: u64,
    used: AtomicU64,
}

impl FixedDevice {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            used: AtomicU64::new(0),
        }
    }

    pub fn set_used(&self, used: u64) {
        self.used.store(used.min(self.total), Ordering::SeqCst);
    }
}

impl DeviceMemory for FixedDevice {
    fn name(&self) -> &str {
        "fixed"
    }

    fn query(&self) -> Result<DeviceReading, CoreError> {
        let used = self.used.load(Ordering::SeqCst);
        Ok(DeviceReading {
            total: self.total,
            reserved: used,
            allocated: used,
        })
    }
}

// ---------------------------------------------------------------------------
// Budget
// ---------------------------------------------------------------------------

/// Point-in-time view of device memory. Never cached across calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryBudget {
    pub allocated: u64,
    pub reserved: u64,
    /// Always `total - reserved`.
    pub free: u64,
    pub total: u64,
    pub safety_margin: u64,
}

impl MemoryBudget {
    fn from_reading(reading: DeviceReading, safety_margin: u64) -> Self {
        let reserved = reading.reserved.min(reading.total);
        Self {
            allocated: reading.allocated.min(reserved),
            reserved,
            free: reading.total - reserved,
            total: reading.total,
            safety_margin,
        }
    }

    /// Memory a new request may use after the safety margin.
    pub fn available(&self) -> u64 {
        self.free.saturating_sub(self.safety_margin)
    }

    pub fn can_admit(&self, required: u64) -> bool {
        self.available() >= required
    }
}

// ---------------------------------------------------------------------------
// Accountant
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct AccountantState {
    next_ticket: u64,
    /// Outstanding tickets and the bytes each was admitted for.
    outstanding: HashMap<u64, u64>,
    peak: u64,
    cleanup_runs: u64,
}

/// Gatekeeper for device memory.
pub struct MemoryAccountant {
    device: Arc<dyn DeviceMemory>,
    safety_margin: u64,
    state: Mutex<AccountantState>,
}

impl std::fmt::Debug for MemoryAccountant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryAccountant")
            .field("device", &self.device.name())
            .field("safety_margin", &self.safety_margin)
            .finish_non_exhaustive()
    }
}

impl MemoryAccountant {
    pub fn new(device: Arc<dyn DeviceMemory>, safety_margin: u64) -> Arc<Self> {
        Arc::new(Self {
            device,
            safety_margin,
            state: Mutex::new(AccountantState::default()),
        })
    }

    /// Query the device now.
    ///
    /// A failed query is reported as a zero-capacity device so admission
    /// fails instead of guessing.
    pub fn snapshot(&self) -> MemoryBudget {
        let reading = match self.device.query() {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(device = self.device.name(), error = %e, "Device memory query failed");
                DeviceReading::default()
            }
        };
        let budget = MemoryBudget::from_reading(reading, self.safety_margin);
        self.observe(budget.reserved);
        budget
    }

    /// Admit a request for `required` bytes, cleaning up once if needed.
    pub fn admit(self: &Arc<Self>, required: u64) -> Result<AdmissionTicket, CoreError> {
        let budget = self.snapshot();
        if budget.can_admit(required) {
            return Ok(self.issue(required, budget));
        }

        tracing::info!(
            device = self.device.name(),
            required,
            available = budget.available(),
            "Insufficient device memory, running tiered cleanup",
        );
        self.tiered_cleanup();

        let budget = self.snapshot();
        if budget.can_admit(required) {
            return Ok(self.issue(required, budget));
        }

        tracing::warn!(
            device = self.device.name(),
            required,
            available = budget.available(),
            "Admission refused after cleanup",
        );
        Err(CoreError::ResourceExhausted {
            required,
            available: budget.available(),
        })
    }

    /// Return a ticket. Calling this more than once for the same ticket is a no-op.
    pub fn release(&self, ticket: &AdmissionTicket) {
        self.release_id(ticket.id);
    }

    /// Highest observed device usage (reserved + admitted) since start or [`reset`](Self::reset).
    pub fn peak_usage(&self) -> u64 {
        self.lock().peak
    }

    /// Restart the peak watermark from the current device reading.
    pub fn reset(&self) {
        self.lock().peak = 0;
        self.snapshot();
    }

    /// Number of tickets currently held.
    pub fn outstanding(&self) -> usize {
        self.lock().outstanding.len()
    }

    /// Number of tiered cleanup passes run so far.
    pub fn cleanup_runs(&self) -> u64 {
        self.lock().cleanup_runs
    }

    // ---- private helpers ----

    fn lock(&self) -> MutexGuard<'_, AccountantState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn observe(&self, usage: u64) {
        let mut state = self.lock();
        state.peak = state.peak.max(usage);
    }

    fn issue(self: &Arc<Self>, required: u64, budget: MemoryBudget) -> AdmissionTicket {
        let id = {
            let mut state = self.lock();
            state.next_ticket += 1;
            let id = state.next_ticket;
            state.outstanding.insert(id, required);
            state.peak = state.peak.max(budget.reserved.saturating_add(required));
            id
        };
        tracing::debug!(ticket = id, required, free = budget.free, "Admission granted");
        AdmissionTicket {
            id,
            bytes: required,
            accountant: Arc::clone(self),
        }
    }

    fn release_id(&self, id: u64) {
        let removed = self.lock().outstanding.remove(&id);
        if removed.is_some() {
            // Peak bookkeeping picks up whatever the call left resident.
            self.snapshot();
            tracing::debug!(ticket = id, "Admission released");
        }
    }

    fn tiered_cleanup(&self) {
        self.lock().cleanup_runs += 1;

        tracing::debug!(tier = ?CleanupTier::Standard, "Clearing device cache");
        self.device.clear_cache();

        tracing::debug!(tier = ?CleanupTier::Synchronize, "Synchronizing device");
        self.device.synchronize();
        self.device.clear_cache();

        tracing::debug!(tier = ?CleanupTier::Aggressive, passes = AGGRESSIVE_CLEAR_PASSES, "Aggressive clear");
        for _ in 0..AGGRESSIVE_CLEAR_PASSES {
            self.device.synchronize();
            self.device.clear_cache();
        }
    }
}

/// Proof that device memory was admitted for one backend call.
///
/// Dropping the ticket releases it; explicit release is also allowed and
/// idempotent.
#[derive(Debug)]
pub struct AdmissionTicket {
    id: u64,
    bytes: u64,
    accountant: Arc<MemoryAccountant>,
}

impl AdmissionTicket {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        self.accountant.release_id(self.id);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
