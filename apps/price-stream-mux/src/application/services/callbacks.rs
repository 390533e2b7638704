//! Callback Registry
//!
//! Ordered fan-out to consumer callbacks with explicit registration handles.
//!
//! - Callbacks run in registration order.
//! - Registering the same `Arc` twice returns a second handle that shares the
//!   first registration, so the callback is still invoked once per event and
//!   one component removing its handle does not unregister the other.
//! - A removal is visible to the very next invocation, including later
//!   invocations within a dispatch pass that is already running.
//! - A panicking callback is isolated; the remaining callbacks still run.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;

/// A consumer callback.
pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Opaque registration handle; pass it back to remove the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackHandle(u64);

struct Entry<T> {
    key: u64,
    callback: Callback<T>,
    live: AtomicBool,
}

struct Slots<T> {
    entries: Vec<Arc<Entry<T>>>,
    /// Handle id -> entry key.
    handles: HashMap<u64, u64>,
}

/// Outcome of one dispatch pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Callbacks that ran to completion.
    pub delivered: usize,
    /// Callbacks that panicked.
    pub panicked: usize,
}

/// Set of callbacks for one event type.
pub struct CallbackRegistry<T> {
    name: &'static str,
    slots: RwLock<Slots<T>>,
    next_id: AtomicU64,
}

impl<T> std::fmt::Debug for CallbackRegistry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("name", &self.name)
            .field("callbacks", &self.len())
            .finish()
    }
}

impl<T> CallbackRegistry<T> {
    /// Create an empty registry; `name` labels log lines.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slots: RwLock::new(Slots {
                entries: Vec::new(),
                handles: HashMap::new(),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a callback and return its handle.
    pub fn register(&self, callback: Callback<T>) -> CallbackHandle {
        let handle = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut slots = self.slots.write();

        let existing = slots
            .entries
            .iter()
            .find(|entry| Arc::ptr_eq(&entry.callback, &callback))
            .map(|entry| entry.key);

        let key = existing.unwrap_or_else(|| {
            slots.entries.push(Arc::new(Entry {
                key: handle,
                callback,
                live: AtomicBool::new(true),
            }));
            handle
        });

        slots.handles.insert(handle, key);
        CallbackHandle(handle)
    }

    /// Remove a registration.
    ///
    /// Returns `false` when the handle is unknown (already removed).
    pub fn remove(&self, handle: CallbackHandle) -> bool {
        let mut slots = self.slots.write();

        let Some(key) = slots.handles.remove(&handle.0) else {
            return false;
        };

        // Other handles still share this entry
        if slots.handles.values().any(|k| *k == key) {
            return true;
        }

        if let Some(index) = slots.entries.iter().position(|entry| entry.key == key) {
            let entry = slots.entries.remove(index);
            entry.live.store(false, Ordering::Release);
        }

        true
    }

    /// Invoke every live callback with `event`, in registration order.
    ///
    /// No lock is held while callbacks run, so callbacks may register or
    /// remove callbacks (including themselves).
    pub fn dispatch(&self, event: &T) -> DispatchOutcome {
        let snapshot: Vec<Arc<Entry<T>>> = self.slots.read().entries.clone();
        let mut outcome = DispatchOutcome::default();

        for entry in snapshot {
            // Removed earlier in this pass
            if !entry.live.load(Ordering::Acquire) {
                continue;
            }

            let callback = &entry.callback;
            match catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(()) => outcome.delivered += 1,
                Err(panic) => {
                    outcome.panicked += 1;
                    tracing::error!(
                        registry = self.name,
                        panic = panic_message(panic.as_ref()),
                        "Callback panicked; continuing dispatch"
                    );
                }
            }
        }

        outcome
    }

    /// Number of distinct registered callbacks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.read().entries.len()
    }

    /// Whether no callback is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.read().entries.is_empty()
    }

    /// Whether the handle is still registered.
    #[must_use]
    pub fn contains(&self, handle: CallbackHandle) -> bool {
        self.slots.read().handles.contains_key(&handle.0)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

// =============================================================================
// Tests
// =============================================================================
