//! Session store: one VM per browser tab.
//!
//! - Key: generated session id
//! - Value: the VM behind its own lock, plus bookkeeping
//! - LRU bounded (deterministic via monotonic `last_touch` + `seq`) + idle TTL eviction
//!
//! The store lock only guards the map. A VM is locked separately, so a long
//! batch on one session never holds up the others.

use hack_vm::Vm;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::info;

/// One session's VM, shared between the store and in-flight requests.
pub type SharedVm = Arc<Mutex<Vm>>;

struct Entry {
    vm: SharedVm,
    last_used: Instant,
    seq: u64,
    last_touch: u64,
}

struct Inner {
    entries: HashMap<String, Entry>,
    cap: usize,
    ttl: Duration,
    seq_ctr: u64,
    touch_ctr: u64,
}

impl Inner {
    #[inline]
    fn next_seq(&mut self) -> u64 {
        let n = self.seq_ctr;
        self.seq_ctr += 1;
        n
    }
    #[inline]
    fn next_touch(&mut self) -> u64 {
        let n = self.touch_ctr;
        self.touch_ctr += 1;
        n
    }

    fn sweep(&mut self, now: Instant) {
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries
            .retain(|_, e| now.duration_since(e.last_used) < ttl);
        let expired = before - self.entries.len();
        if expired > 0 {
            info!(expired, "expired idle sessions");
        }
    }

    fn evict_if_needed(&mut self) {
        while self.entries.len() > self.cap {
            let Some(victim) = self
                .entries
                .iter()
                .min_by_key(|(_, e)| (e.last_touch, e.seq))
                .map(|(k, _)| k.clone())
            else {
                return;
            };
            info!(session = %victim, "evicted least recently used session");
            self.entries.remove(&victim);
        }
    }
}

/// Locks one VM; a panic mid-step leaves a VM that `reset` can still recover.
pub fn lock_vm(vm: &SharedVm) -> MutexGuard<'_, Vm> {
    vm.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<Mutex<Inner>>,
}

impl SessionStore {
    pub fn new(cap: usize, ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                entries: HashMap::with_capacity(cap),
                cap: cap.max(1),
                ttl,
                seq_ctr: 0,
                touch_ctr: 0,
            })),
        }
    }

    pub fn from_env() -> Self {
        Self::new(
            *hack_config::MAX_SESSIONS,
            Duration::from_secs(*hack_config::SESSION_TTL_SECS),
        )
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves the map itself intact.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stores `vm` and returns its new id, evicting the least recently used session if full.
    pub fn insert(&self, vm: Vm) -> String {
        let mut inner = self.lock();
        let now = Instant::now();
        inner.sweep(now);
        let seq = inner.next_seq();
        let touch = inner.next_touch();
        let id = format!("vm-{seq:06x}");
        inner.entries.insert(
            id.clone(),
            Entry {
                vm: Arc::new(Mutex::new(vm)),
                last_used: now,
                seq,
                last_touch: touch,
            },
        );
        inner.evict_if_needed();
        id
    }

    /// The session's VM handle; marks the session as used. The store lock is released on return.
    pub fn get(&self, id: &str) -> Option<SharedVm> {
        let mut inner = self.lock();
        let now = Instant::now();
        inner.sweep(now);
        let touch = inner.next_touch();
        let entry = inner.entries.get_mut(id)?;
        entry.last_used = now;
        entry.last_touch = touch;
        Some(Arc::clone(&entry.vm))
    }

    /// Runs `f` against the session's VM, holding only that VM's lock.
    pub fn with<R>(&self, id: &str, f: impl FnOnce(&mut Vm) -> R) -> Option<R> {
        let vm = self.get(id)?;
        let mut guard = lock_vm(&vm);
        Some(f(&mut *guard))
    }

    pub fn remove(&self, id: &str) -> bool {
        self.lock().entries.remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
