//! Scoped resource acquisition with guaranteed, exactly-once cleanup.
//!
//! A [`Guard`] runs its cleanup function when released or dropped, on
//! normal exit, early return or unwind. Cleanup failures (errors or
//! panics) are logged and swallowed so they never mask the error that
//! caused the scope to exit.
//!
//! Every guard is tracked by the [`ResourceRegistry`] that issued it.
//! [`ResourceRegistry::cleanup_all`] releases everything still held in
//! reverse acquisition order, so a resource is always released before
//! the resources it was acquired on top of.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Cleanup action attached to a guard.
pub type CleanupFn = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

struct Slot {
    id: u64,
    name: String,
    cleanup: Mutex<Option<CleanupFn>>,
}

impl Slot {
    /// Run the cleanup if it has not run yet. Returns `true` if it ran now.
    fn run(&self) -> bool {
        let cleanup = self
            .cleanup
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(cleanup) = cleanup else {
            return false;
        };

        match catch_unwind(AssertUnwindSafe(cleanup)) {
            Ok(Ok(())) => {
                tracing::debug!(resource = %self.name, guard = self.id, "Resource released");
            }
            Ok(Err(e)) => {
                tracing::warn!(resource = %self.name, guard = self.id, error = %e, "Resource cleanup failed");
            }
            Err(_) => {
                tracing::error!(resource = %self.name, guard = self.id, "Resource cleanup panicked");
            }
        }
        true
    }
}

#[derive(Default)]
struct RegistryState {
    next_id: u64,
    /// Held guards in acquisition order.
    held: Vec<Arc<Slot>>,
}

/// Tracks every live guard for a pipeline run.
#[derive(Default)]
pub struct ResourceRegistry {
    state: Mutex<RegistryState>,
}

impl std::fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceRegistry")
            .field("held", &self.held_names())
            .finish()
    }
}

impl ResourceRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a resource and return the guard that owns its cleanup.
    pub fn acquire<F>(self: &Arc<Self>, name: impl Into<String>, cleanup: F) -> Guard
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let name = name.into();
        let slot = {
            let mut state = self.lock();
            state.next_id += 1;
            let slot = Arc::new(Slot {
                id: state.next_id,
                name,
                cleanup: Mutex::new(Some(Box::new(cleanup))),
            });
            state.held.push(Arc::clone(&slot));
            slot
        };
        tracing::debug!(resource = %slot.name, guard = slot.id, "Resource acquired");
        Guard {
            slot,
            registry: Arc::downgrade(self),
        }
    }

    /// Release every held resource, most recently acquired first.
    ///
    /// Returns the number of cleanups that ran.
    pub fn cleanup_all(&self) -> usize {
        let held = std::mem::take(&mut self.lock().held);
        if !held.is_empty() {
            tracing::info!(count = held.len(), "Releasing all held resources");
        }
        let mut released = 0;
        for slot in held.iter().rev() {
            if slot.run() {
                released += 1;
            }
        }
        released
    }

    /// Number of guards not yet released.
    pub fn held_count(&self) -> usize {
        self.lock().held.len()
    }

    /// Names of held resources in acquisition order.
    pub fn held_names(&self) -> Vec<String> {
        self.lock().held.iter().map(|s| s.name.clone()).collect()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn forget(&self, id: u64) {
        self.lock().held.retain(|s| s.id != id);
    }
}

/// Owner of one resource's cleanup.
pub struct Guard {
    slot: Arc<Slot>,
    registry: Weak<ResourceRegistry>,
}

impl std::fmt::Debug for Guard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Guard")
            .field("id", &self.slot.id)
            .field("name", &self.slot.name)
            .finish()
    }
}

impl Guard {
    pub fn name(&self) -> &str {
        &self.slot.name
    }

    /// Run the cleanup now. Later calls, drops and `cleanup_all` are no-ops.
    ///
    /// Returns `true` if this call ran the cleanup.
    pub fn release(&self) -> bool {
        if let Some(registry) = self.registry.upgrade() {
            registry.forget(self.slot.id);
        }
        self.slot.run()
    }

    /// Whether the cleanup has already run.
    pub fn is_released(&self) -> bool {
        self.slot
            .cleanup
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        self.release();
    }
}
