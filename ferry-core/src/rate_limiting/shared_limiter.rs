use std::sync::{Arc, Mutex, MutexGuard};

use super::FerryRateLimiter;

/// Handle to one limiter shared by every stream of an engine (or of all
/// engines, for the global limit). Reconfiguration through the registry
/// is seen by all holders.
#[derive(Clone, Debug)]
pub struct SharedFerryRateLimiter {
    inner: Arc<Mutex<FerryRateLimiter>>,
}

impl SharedFerryRateLimiter {
    pub(crate) fn new(limiter: FerryRateLimiter) -> Self {
        Self {
            inner: Arc::new(Mutex::new(limiter)),
        }
    }

    /// The guard is `!Send`, so it cannot be held across an await in a
    /// spawned task.
    pub fn lock(&self) -> MutexGuard<'_, FerryRateLimiter> {
        #[allow(clippy::unwrap_used, reason = "panic on poison")]
        self.inner.lock().unwrap()
    }

    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
