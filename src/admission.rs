//! Admission control for accepted connections.
//!
//! A fixed pool of permits caps how many connections are handled at once.
//! Acquisition never waits: when the pool is empty the caller is expected
//! to reject the connection on the spot rather than queue it.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounded counting permit pool.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl AdmissionGate {
    /// Create a gate admitting at most `capacity` concurrent connections.
    pub fn new(capacity: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Take a slot if one is free. Never blocks.
    pub fn try_acquire(&self) -> Option<AdmissionSlot> {
        self.permits
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| AdmissionSlot { _permit: permit })
    }

    /// Number of slots currently free.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// One held admission slot.
///
/// Released exactly once, when dropped. Holding it in the connection task
/// ties the release to every way that task can end.
#[derive(Debug)]
pub struct AdmissionSlot {
    _permit: OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_up_to_capacity() {
        let gate = AdmissionGate::new(2);

        let a = gate.try_acquire();
        let b = gate.try_acquire();
        assert!(a.is_some());
        assert!(b.is_some());
        assert_eq!(gate.available(), 0);

        // Full: rejected immediately, not queued
        assert!(gate.try_acquire().is_none());

        drop(a);
        assert_eq!(gate.available(), 1);
        assert!(gate.try_acquire().is_some());
    }

    #[test]
    fn test_release_on_drop_restores_capacity() {
        let gate = AdmissionGate::new(3);
        let slots: Vec<_> = (0..3).filter_map(|_| gate.try_acquire()).collect();
        assert_eq!(slots.len(), 3);
        assert_eq!(gate.available(), 0);

        drop(slots);
        assert_eq!(gate.available(), gate.capacity());
    }

    #[test]
    fn test_release_on_panic() {
        let gate = AdmissionGate::new(1);
        let gate_clone = gate.clone();

        let result = std::thread::spawn(move || {
            let _slot = gate_clone.try_acquire().unwrap();
            panic!("handler blew up");
        })
        .join();

        assert!(result.is_err());
        assert_eq!(gate.available(), 1);
    }

    #[test]
    fn test_concurrent_acquire_never_exceeds_capacity() {
        let gate = AdmissionGate::new(4);
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let gate = gate.clone();
                std::thread::spawn(move || gate.try_acquire())
            })
            .collect();

        let held: Vec<_> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();

        assert_eq!(held.len(), 4);
        assert_eq!(gate.available(), 0);
    }
}
