use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Host-level exclusion across job kinds. Backups of different databases on
/// one host may overlap (shared), a restore or import needs the host alone
/// (exclusive). Nothing waits: a busy host is reported to the caller.
#[derive(Clone, Default)]
pub struct HostLocks {
    inner: Arc<Mutex<HashMap<i64, Arc<RwLock<()>>>>>,
}

impl HostLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, host_id: i64) -> Arc<RwLock<()>> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(host_id).or_default().clone()
    }

    pub fn try_shared(&self, host_id: i64) -> Option<OwnedRwLockReadGuard<()>> {
        self.lock_for(host_id).try_read_owned().ok()
    }

    pub fn try_exclusive(&self, host_id: i64) -> Option<OwnedRwLockWriteGuard<()>> {
        self.lock_for(host_id).try_write_owned().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::HostLocks;

    #[test]
    fn exclusive_blocks_shared_and_vice_versa() {
        let locks = HostLocks::new();
        let a = locks.try_shared(1).expect("first backup");
        let b = locks.try_shared(1).expect("second backup on same host");
        assert!(locks.try_exclusive(1).is_none());
        assert!(locks.try_exclusive(2).is_some());
        drop((a, b));

        let restore = locks.try_exclusive(1).expect("restore once backups finish");
        assert!(locks.try_shared(1).is_none());
        drop(restore);
        assert!(locks.try_shared(1).is_some());
    }
}
