/// Register change subscriptions
///
/// The application registers interest in single holding-register addresses.
/// After a protocol write has been fully applied, the dispatcher hands the
/// registry one [`RegisterChange`] per written address; subscribers whose
/// value actually changed are called back in ascending address order.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::debug;

use crate::error::{ServerError, ServerResult};

/// Handle returned by [`SubscriptionRegistry::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

/// Old and new value of one register after a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterChange {
    pub address: u16,
    pub before: u16,
    pub after: u16,
}

impl RegisterChange {
    pub fn is_changed(&self) -> bool {
        self.before != self.after
    }
}

/// Callback invoked with the change that triggered it
pub type ChangeCallback = Arc<dyn Fn(&RegisterChange) + Send + Sync>;

struct Subscription {
    address: u16,
    last_value: Option<u16>,
    callback: ChangeCallback,
}

/// Collection of register subscriptions with its own lock
///
/// The lock is never held while a callback runs, so callbacks may subscribe
/// or unsubscribe freely.
pub struct SubscriptionRegistry {
    next_id: AtomicU64,
    entries: Mutex<BTreeMap<SubscriptionId, Subscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(&self) -> ServerResult<std::sync::MutexGuard<'_, BTreeMap<SubscriptionId, Subscription>>> {
        self.entries
            .lock()
            .map_err(|_| ServerError::internal("Failed to lock subscription registry"))
    }

    /// Register `callback` for writes to holding register `address`
    pub fn subscribe<F>(&self, address: u16, callback: F) -> ServerResult<SubscriptionId>
    where
        F: Fn(&RegisterChange) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock()?.insert(
            id,
            Subscription {
                address,
                last_value: None,
                callback: Arc::new(callback),
            },
        );
        debug!("Added {} on register {}", id, address);
        Ok(id)
    }

    /// Remove a subscription; returns false if it did not exist
    pub fn unsubscribe(&self, id: SubscriptionId) -> ServerResult<bool> {
        let removed = self.lock()?.remove(&id).is_some();
        if removed {
            debug!("Removed {}", id);
        }
        Ok(removed)
    }

    /// Last value observed for a subscription, if any write has been seen
    pub fn last_value(&self, id: SubscriptionId) -> ServerResult<Option<u16>> {
        Ok(self.lock()?.get(&id).and_then(|s| s.last_value))
    }

    pub fn len(&self) -> usize {
        self.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver the changes of one completed write
    ///
    /// Every subscription on a written address records the new value.
    /// Callbacks fire only for changed values, sorted by address, after the
    /// registry lock has been released. Returns the number of callbacks run.
    pub fn notify(&self, changes: &[RegisterChange]) -> ServerResult<usize> {
        let mut ordered: Vec<&RegisterChange> = changes.iter().collect();
        ordered.sort_by_key(|change| change.address);

        let mut pending: Vec<(ChangeCallback, RegisterChange)> = Vec::new();
        {
            let mut entries = self.lock()?;
            for change in ordered {
                for subscription in entries.values_mut().filter(|s| s.address == change.address) {
                    subscription.last_value = Some(change.after);
                    if change.is_changed() {
                        pending.push((subscription.callback.clone(), *change));
                    }
                }
            }
        }

        for (callback, change) in &pending {
            callback(change);
        }
        Ok(pending.len())
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("subscriptions", &self.len())
            .finish()
    }
}
