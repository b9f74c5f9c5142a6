use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use ferry_common::{ServerKey, ServerPath};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockReason {
    List,
    Mkdir,
    Transfer,
    Delete,
    RemoveDir,
    Rename,
    Chmod,
}

impl LockReason {
    fn conflicts_with(self, other: LockReason) -> bool {
        use LockReason::*;
        self == other
            || matches!(
                (self, other),
                (List, Delete | RemoveDir | Rename) | (Delete | RemoveDir | Rename, List)
            )
    }
}

/// Called with the lock id when a waiting lock is granted.
pub type LockWaker = Arc<dyn Fn(u64) + Send + Sync>;

struct LockEntry {
    id: u64,
    owner: u64,
    server: ServerKey,
    path: ServerPath,
    reason: LockReason,
    inclusive: bool,
    waiting: bool,
    waker: LockWaker,
}

impl LockEntry {
    fn overlaps(&self, other: &LockEntry) -> bool {
        if self.owner == other.owner
            || self.server != other.server
            || !self.reason.conflicts_with(other.reason)
        {
            return false;
        }
        self.path == other.path
            || (self.inclusive && other.path.is_subdir_of(&self.path))
            || (other.inclusive && self.path.is_subdir_of(&other.path))
    }
}

/// Advisory path locks shared by the control sockets of one engine
/// context. Conflicting requests are queued in arrival order.
#[derive(Default)]
pub struct OpLockManager {
    locks: Mutex<Vec<LockEntry>>,
    next_id: AtomicU64,
}

impl Debug for OpLockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpLockManager")
            .field("locks", &self.lock_count())
            .finish()
    }
}

impl OpLockManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn lock(
        self: &Arc<Self>,
        owner: u64,
        waker: &LockWaker,
        server: ServerKey,
        reason: LockReason,
        path: ServerPath,
        inclusive: bool,
    ) -> OpLock {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut entry = LockEntry {
            id,
            owner,
            server,
            path,
            reason,
            inclusive,
            waiting: false,
            waker: waker.clone(),
        };
        #[allow(clippy::unwrap_used, reason = "panic on poison")]
        let mut locks = self.locks.lock().unwrap();
        entry.waiting = locks.iter().any(|other| entry.overlaps(other));
        trace!(id, ?reason, path = %entry.path, waiting = entry.waiting, "Lock requested");
        locks.push(entry);
        OpLock {
            id,
            manager: Arc::downgrade(self),
        }
    }

    pub fn lock_count(&self) -> usize {
        #[allow(clippy::unwrap_used, reason = "panic on poison")]
        self.locks.lock().unwrap().len()
    }

    fn is_waiting(&self, id: u64) -> bool {
        #[allow(clippy::unwrap_used, reason = "panic on poison")]
        let locks = self.locks.lock().unwrap();
        locks.iter().any(|l| l.id == id && l.waiting)
    }

    fn release(&self, id: u64) {
        let granted = {
            #[allow(clippy::unwrap_used, reason = "panic on poison")]
            let mut locks = self.locks.lock().unwrap();
            locks.retain(|l| l.id != id);

            let mut granted = vec![];
            for i in 0..locks.len() {
                if !locks[i].waiting {
                    continue;
                }
                let blocked = locks[..i]
                    .iter()
                    .chain(locks[i + 1..].iter().filter(|l| !l.waiting))
                    .any(|other| locks[i].overlaps(other));
                if !blocked {
                    locks[i].waiting = false;
                    granted.push((locks[i].id, locks[i].waker.clone()));
                }
            }
            granted
        };
        for (id, waker) in granted {
            trace!(id, "Lock granted");
            waker(id);
        }
    }
}

/// Handle to a lock held or requested by an operation. Dropping it
/// releases the lock and may grant queued ones.
pub struct OpLock {
    id: u64,
    manager: Weak<OpLockManager>,
}

impl OpLock {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn waiting(&self) -> bool {
        self.manager
            .upgrade()
            .map(|m| m.is_waiting(self.id))
            .unwrap_or(false)
    }
}

impl Debug for OpLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpLock").field("id", &self.id).finish()
    }
}

impl Drop for OpLock {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.release(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use ferry_common::Protocol;

    use super::*;

    fn key() -> ServerKey {
        ferry_common::Server::new(Protocol::Ftp, "example.com", 21).key()
    }

    fn path(p: &str) -> ServerPath {
        ServerPath::parse(p).unwrap()
    }

    fn recorder() -> (LockWaker, Arc<StdMutex<Vec<u64>>>) {
        let granted = Arc::new(StdMutex::new(vec![]));
        let sink = granted.clone();
        (Arc::new(move |id| sink.lock().unwrap().push(id)), granted)
    }

    #[test]
    fn list_waits_for_delete_in_same_directory() {
        let manager = OpLockManager::new();
        let (waker, granted) = recorder();

        let delete = manager.lock(1, &waker, key(), LockReason::Delete, path("/a"), false);
        let list = manager.lock(2, &waker, key(), LockReason::List, path("/a"), false);
        let other = manager.lock(3, &waker, key(), LockReason::List, path("/b"), false);
        assert!(!delete.waiting());
        assert!(list.waiting());
        assert!(!other.waiting());

        let list_id = list.id();
        drop(delete);
        assert!(!list.waiting());
        assert_eq!(*granted.lock().unwrap(), vec![list_id]);
    }

    #[test]
    fn same_owner_never_conflicts() {
        let manager = OpLockManager::new();
        let (waker, _) = recorder();
        let _a = manager.lock(1, &waker, key(), LockReason::List, path("/a"), true);
        let b = manager.lock(1, &waker, key(), LockReason::List, path("/a/b"), false);
        assert!(!b.waiting());
    }

    #[test]
    fn inclusive_locks_cover_subdirectories() {
        let manager = OpLockManager::new();
        let (waker, _) = recorder();
        let _parent = manager.lock(1, &waker, key(), LockReason::RemoveDir, path("/a"), true);
        let child = manager.lock(2, &waker, key(), LockReason::RemoveDir, path("/a/b/c"), false);
        assert!(child.waiting());
    }

    #[test]
    fn queued_locks_are_granted_in_order() {
        let manager = OpLockManager::new();
        let (waker, granted) = recorder();
        let first = manager.lock(1, &waker, key(), LockReason::List, path("/a"), false);
        let second = manager.lock(2, &waker, key(), LockReason::List, path("/a"), false);
        let third = manager.lock(3, &waker, key(), LockReason::List, path("/a"), false);
        assert!(second.waiting() && third.waiting());

        let second_id = second.id();
        drop(first);
        assert!(!second.waiting());
        assert!(third.waiting());
        assert_eq!(*granted.lock().unwrap(), vec![second_id]);

        drop(second);
        drop(third);
        assert_eq!(manager.lock_count(), 0);
    }
}
