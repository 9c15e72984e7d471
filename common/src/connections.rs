use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    task::Waker,
};

use tracing::debug;

pub type ConnectionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted {
        id: ConnectionId,
        evicted: Option<ConnectionId>,
    },
    /// Table full and LRU purge disabled.
    Rejected,
}

/// Open connections ordered by last activity on a logical clock.
#[derive(Debug)]
pub struct ConnectionTable {
    capacity: usize,
    lru_purge: bool,
    clock: u64,
    next_id: ConnectionId,
    last_active: HashMap<ConnectionId, u64>,
}

impl ConnectionTable {
    pub fn new(capacity: usize, lru_purge: bool) -> Self {
        Self {
            capacity: capacity.max(1),
            lru_purge,
            clock: 0,
            next_id: 1,
            last_active: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.last_active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_active.is_empty()
    }

    pub fn admit(&mut self) -> Admission {
        let mut evicted = None;
        if self.last_active.len() >= self.capacity {
            if !self.lru_purge {
                return Admission::Rejected;
            }
            evicted = self
                .last_active
                .iter()
                .min_by_key(|(_, active)| **active)
                .map(|(id, _)| *id);
            if let Some(id) = evicted {
                self.last_active.remove(&id);
            }
        }

        let id = self.next_id;
        self.next_id += 1;
        let now = self.tick();
        self.last_active.insert(id, now);
        Admission::Accepted { id, evicted }
    }

    pub fn touch(&mut self, id: ConnectionId) -> bool {
        let now = self.tick();
        match self.last_active.get_mut(&id) {
            Some(active) => {
                *active = now;
                true
            }
            None => false,
        }
    }

    pub fn release(&mut self, id: ConnectionId) -> bool {
        self.last_active.remove(&id).is_some()
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// Eviction signal for one connection; the I/O side parks its waker here.
#[derive(Debug, Default)]
pub struct Eviction {
    evicted: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

impl Eviction {
    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::Acquire)
    }

    pub fn register(&self, waker: &Waker) {
        let mut slot = self.waker.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            Some(existing) if existing.will_wake(waker) => {}
            _ => *slot = Some(waker.clone()),
        }
    }

    pub fn evict(&self) {
        self.evicted.store(true, Ordering::Release);
        let waker = self
            .waker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

#[derive(Debug)]
struct RegistryInner {
    table: ConnectionTable,
    signals: HashMap<ConnectionId, Arc<Eviction>>,
}

/// Thread-safe connection table that signals evicted connections.
#[derive(Debug, Clone)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl ConnectionRegistry {
    pub fn new(capacity: usize, lru_purge: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                table: ConnectionTable::new(capacity, lru_purge),
                signals: HashMap::new(),
            })),
        }
    }

    /// `None` when the table is full and purging is disabled.
    pub fn admit(&self) -> Option<(ConnectionId, Arc<Eviction>)> {
        let mut inner = self.lock();
        let Admission::Accepted { id, evicted } = inner.table.admit() else {
            return None;
        };

        if let Some(old) = evicted {
            if let Some(signal) = inner.signals.remove(&old) {
                debug!("evicting least recently active connection {old} for {id}");
                signal.evict();
            }
        }

        let signal = Arc::new(Eviction::default());
        inner.signals.insert(id, signal.clone());
        Some((id, signal))
    }

    pub fn touch(&self, id: ConnectionId) {
        self.lock().table.touch(id);
    }

    pub fn release(&self, id: ConnectionId) {
        let mut inner = self.lock();
        inner.table.release(id);
        inner.signals.remove(&id);
    }

    pub fn open_connections(&self) -> usize {
        self.lock().table.len()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn evicts_least_recently_active_when_full() {
        let mut table = ConnectionTable::new(2, true);

        let Admission::Accepted { id: first, .. } = table.admit() else {
            panic!("first connection rejected");
        };
        let Admission::Accepted { id: second, .. } = table.admit() else {
            panic!("second connection rejected");
        };
        assert!(table.touch(first));

        assert_eq!(
            table.admit(),
            Admission::Accepted {
                id: 3,
                evicted: Some(second)
            }
        );
        assert_eq!(table.len(), 2);
        assert!(!table.touch(second));
    }

    #[test]
    fn rejects_when_purge_disabled() {
        let mut table = ConnectionTable::new(1, false);

        assert!(matches!(table.admit(), Admission::Accepted { evicted: None, .. }));
        assert_eq!(table.admit(), Admission::Rejected);
    }

    #[test]
    fn release_frees_a_slot() {
        let mut table = ConnectionTable::new(1, false);
        let Admission::Accepted { id, .. } = table.admit() else {
            panic!("rejected");
        };

        assert!(table.release(id));
        assert!(table.is_empty());
        assert!(matches!(table.admit(), Admission::Accepted { evicted: None, .. }));
    }

    #[test]
    fn registry_signals_evicted_connection() {
        let registry = ConnectionRegistry::new(1, true);

        let (first, first_signal) = registry.admit().unwrap();
        let (second, second_signal) = registry.admit().unwrap();

        assert_ne!(first, second);
        assert!(first_signal.is_evicted());
        assert!(!second_signal.is_evicted());
        assert_eq!(registry.open_connections(), 1);

        registry.release(second);
        assert_eq!(registry.open_connections(), 0);
    }
}
