use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use crate::{Notification, NotificationSink};

const NOTIFY_INTERVAL: Duration = Duration::from_millis(100);

/// Progress of one transfer. `start_offset < 0` marks the empty status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferStatus {
    /// `-1` if unknown
    pub total_size: i64,
    pub start_offset: i64,
    pub current_offset: i64,
    pub made_progress: bool,
    /// The transfer is a directory listing
    pub list: bool,
    pub started: Option<SystemTime>,
}

impl Default for TransferStatus {
    fn default() -> Self {
        Self {
            total_size: -1,
            start_offset: -1,
            current_offset: 0,
            made_progress: false,
            list: false,
            started: None,
        }
    }
}

impl TransferStatus {
    pub fn is_empty(&self) -> bool {
        self.start_offset < 0
    }

    pub fn transferred(&self) -> i64 {
        if self.is_empty() {
            return 0;
        }
        self.current_offset - self.start_offset
    }
}

#[derive(Default)]
struct Inner {
    status: TransferStatus,
    changed: bool,
    dirty: bool,
    last_notified: Option<Instant>,
}

/// Shared progress record of the transfer currently running on one
/// control socket. Notifications are coalesced to one per 100ms.
#[derive(Clone)]
pub struct TransferStatusManager {
    inner: Arc<Mutex<Inner>>,
    sink: Option<Arc<dyn NotificationSink>>,
}

impl TransferStatusManager {
    pub fn new(sink: Option<Arc<dyn NotificationSink>>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            sink,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        #[allow(clippy::unwrap_used, reason = "panic on poison")]
        self.inner.lock().unwrap()
    }

    fn post(&self, status: Option<TransferStatus>) {
        if let Some(sink) = &self.sink {
            sink.post(Notification::TransferStatus(status));
        }
    }

    pub fn init(&self, total_size: i64, start_offset: i64, list: bool) {
        let status = {
            let mut inner = self.lock();
            inner.status = TransferStatus {
                total_size,
                start_offset: start_offset.max(0),
                current_offset: start_offset.max(0),
                made_progress: false,
                list,
                started: None,
            };
            inner.changed = true;
            inner.dirty = false;
            inner.last_notified = Some(Instant::now());
            inner.status.clone()
        };
        self.post(Some(status));
    }

    pub fn reset(&self) {
        let was_active = {
            let mut inner = self.lock();
            let was_active = !inner.status.is_empty();
            inner.status = TransferStatus::default();
            inner.changed = true;
            inner.dirty = false;
            inner.last_notified = None;
            was_active
        };
        if was_active {
            self.post(None);
        }
    }

    pub fn set_start_time(&self) {
        let mut inner = self.lock();
        if inner.status.is_empty() {
            return;
        }
        inner.status.started = Some(SystemTime::now());
        inner.changed = true;
    }

    pub fn set_made_progress(&self) {
        let mut inner = self.lock();
        if inner.status.is_empty() {
            return;
        }
        inner.status.made_progress = true;
        inner.changed = true;
    }

    /// Moves the current offset, e.g. after a restart from zero.
    pub fn set_offset(&self, offset: i64) {
        let mut inner = self.lock();
        if inner.status.is_empty() {
            return;
        }
        inner.status.start_offset = offset;
        inner.status.current_offset = offset;
        inner.changed = true;
        inner.dirty = true;
    }

    pub fn update(&self, amount: i64) {
        let status = {
            let mut inner = self.lock();
            if inner.status.is_empty() {
                return;
            }
            inner.status.current_offset += amount;
            inner.changed = true;
            let due = inner
                .last_notified
                .map(|t| t.elapsed() >= NOTIFY_INTERVAL)
                .unwrap_or(true);
            if !due {
                inner.dirty = true;
                return;
            }
            inner.dirty = false;
            inner.last_notified = Some(Instant::now());
            inner.status.clone()
        };
        self.post(Some(status));
    }

    /// Emits the latest status if updates were held back by coalescing.
    pub fn flush(&self) {
        let status = {
            let mut inner = self.lock();
            if !inner.dirty || inner.status.is_empty() {
                return;
            }
            inner.dirty = false;
            inner.last_notified = Some(Instant::now());
            inner.status.clone()
        };
        self.post(Some(status));
    }

    /// Current status and whether it changed since the last call.
    pub fn get(&self) -> (TransferStatus, bool) {
        let mut inner = self.lock();
        let changed = std::mem::replace(&mut inner.changed, false);
        (inner.status.clone(), changed)
    }

    pub fn is_empty(&self) -> bool {
        self.lock().status.is_empty()
    }
}
