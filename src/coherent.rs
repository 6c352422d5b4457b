//! Guarded access to memory that may be shared between cores.
//!
//! Reaching the value requires an [`CoherentGuard`]. When the cell has been marked shared,
//! taking a guard counts a cache invalidate and dropping it counts a writeback, which is
//! what the hardware would do on a non-coherent DSP.

use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// A value whose cross-core visibility is tied to scoped acquire/release.
#[derive(Debug)]
pub struct Coherent<T> {
    value: Mutex<T>,
    shared: AtomicBool,
    invalidates: AtomicU64,
    writebacks: AtomicU64,
}

impl<T> Coherent<T> {
    /// Wrap a core-local value.
    pub fn new(value: T) -> Self {
        Self {
            value: Mutex::new(value),
            shared: AtomicBool::new(false),
            invalidates: AtomicU64::new(0),
            writebacks: AtomicU64::new(0),
        }
    }

    /// Acquire the value. Released when the guard drops.
    pub fn acquire(&self) -> CoherentGuard<'_, T> {
        let guard = self.value.lock();
        let shared = self.shared.load(Ordering::Acquire);
        if shared {
            self.invalidates.fetch_add(1, Ordering::Relaxed);
        }
        CoherentGuard {
            guard,
            owner: self,
            shared,
        }
    }

    /// Mark the value as accessed from more than one core.
    pub fn make_shared(&self) {
        self.shared.store(true, Ordering::Release);
    }

    /// Whether the value is shared.
    pub fn is_shared(&self) -> bool {
        self.shared.load(Ordering::Acquire)
    }

    /// Cache maintenance counters `(invalidates, writebacks)`.
    pub fn cache_ops(&self) -> (u64, u64) {
        (
            self.invalidates.load(Ordering::Relaxed),
            self.writebacks.load(Ordering::Relaxed),
        )
    }

    /// Consume the cell.
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

/// Scoped access to a [`Coherent`] value.
pub struct CoherentGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    owner: &'a Coherent<T>,
    shared: bool,
}

impl<T> std::ops::Deref for CoherentGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> std::ops::DerefMut for CoherentGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for CoherentGuard<'_, T> {
    fn drop(&mut self) {
        if self.shared {
            self.owner.writebacks.fetch_add(1, Ordering::Relaxed);
        }
    }
}
