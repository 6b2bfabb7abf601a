use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

const NUM_BUCKETS: usize = 256;

#[derive(Debug, Default)]
struct LockState {
    readers: u32,
    writer: bool,
}

/// NameLocker provides per-object shared/exclusive locking without one
/// lock object per name: unames hash into a fixed array of buckets,
/// each a map of live lock states. A name with no holders occupies no
/// memory.
pub struct NameLocker {
    buckets: Vec<Mutex<HashMap<String, LockState>>>,
}

impl Default for NameLocker {
    fn default() -> Self {
        Self::new()
    }
}

impl NameLocker {
    pub fn new() -> Self {
        Self {
            buckets: (0..NUM_BUCKETS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn bucket(&self, uname: &str) -> &Mutex<HashMap<String, LockState>> {
        let h = hrw::digest(uname) as usize;
        &self.buckets[h % NUM_BUCKETS]
    }

    pub fn try_rlock(&self, uname: &str) -> bool {
        let mut map = self.bucket(uname).lock().unwrap();
        let state = map.entry(uname.to_string()).or_default();
        if state.writer {
            return false;
        }
        state.readers += 1;
        true
    }

    pub fn try_wlock(&self, uname: &str) -> bool {
        let mut map = self.bucket(uname).lock().unwrap();
        let state = map.entry(uname.to_string()).or_default();
        if state.writer || state.readers > 0 {
            return false;
        }
        state.writer = true;
        true
    }

    /// Acquire shared, spinning with a short sleep. Hold times are
    /// bounded by single-object I/O, so contention is short-lived.
    pub fn rlock(&self, uname: &str) {
        while !self.try_rlock(uname) {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn wlock(&self, uname: &str) {
        while !self.try_wlock(uname) {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn runlock(&self, uname: &str) {
        let mut map = self.bucket(uname).lock().unwrap();
        let remove = {
            let state = map.get_mut(uname).expect("runlock without rlock");
            debug_assert!(state.readers > 0);
            state.readers = state.readers.saturating_sub(1);
            state.readers == 0 && !state.writer
        };
        if remove {
            map.remove(uname);
        }
    }

    pub fn wunlock(&self, uname: &str) {
        let mut map = self.bucket(uname).lock().unwrap();
        let remove = {
            let state = map.get_mut(uname).expect("wunlock without wlock");
            debug_assert!(state.writer);
            state.writer = false;
            state.readers == 0
        };
        if remove {
            map.remove(uname);
        }
    }

    /// Downgrade exclusive to shared without a release window.
    pub fn downgrade(&self, uname: &str) {
        let mut map = self.bucket(uname).lock().unwrap();
        let state = map.get_mut(uname).expect("downgrade without wlock");
        debug_assert!(state.writer);
        state.writer = false;
        state.readers += 1;
    }
}

/// Lif (LOM-in-flight) carries just enough identity to release a lock
/// after the Lom struct itself has been returned to its pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lif {
    pub uname: String,
    pub exclusive: bool,
}

impl Lif {
    pub fn unlock(self, locker: &NameLocker) {
        if self.exclusive {
            locker.wunlock(&self.uname);
        } else {
            locker.runlock(&self.uname);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readers_share_writers_exclude() {
        let locker = NameLocker::new();
        assert!(locker.try_rlock("u"));
        assert!(locker.try_rlock("u"));
        assert!(!locker.try_wlock("u"));

        locker.runlock("u");
        assert!(!locker.try_wlock("u"));
        locker.runlock("u");

        assert!(locker.try_wlock("u"));
        assert!(!locker.try_rlock("u"));
        assert!(!locker.try_wlock("u"));
        locker.wunlock("u");
        assert!(locker.try_rlock("u"));
        locker.runlock("u");
    }

    #[test]
    fn distinct_names_do_not_interfere() {
        let locker = NameLocker::new();
        assert!(locker.try_wlock("a"));
        assert!(locker.try_wlock("b"));
        locker.wunlock("a");
        locker.wunlock("b");
    }

    #[test]
    fn downgrade_keeps_the_hold() {
        let locker = NameLocker::new();
        assert!(locker.try_wlock("u"));
        locker.downgrade("u");
        assert!(locker.try_rlock("u"));
        assert!(!locker.try_wlock("u"));
        locker.runlock("u");
        locker.runlock("u");
        assert!(locker.try_wlock("u"));
        locker.wunlock("u");
    }

    #[test]
    fn lif_releases_after_the_fact() {
        let locker = NameLocker::new();
        assert!(locker.try_wlock("u"));
        let lif = Lif {
            uname: "u".to_string(),
            exclusive: true,
        };
        lif.unlock(&locker);
        assert!(locker.try_wlock("u"));
        locker.wunlock("u");
    }
}
