//! System clock: a shared tick counter plus frequency-change notifications.
//!
//! The counter is simulated. Tests and the harness move it forward explicitly, which keeps
//! every scheduler decision reproducible.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Old and new rates carried by a frequency change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockChange {
    /// Ticks per millisecond before the change.
    pub old_ticks_per_msec: u64,
    /// Ticks per millisecond after the change.
    pub new_ticks_per_msec: u64,
}

/// Notification phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockEvent {
    /// Sent before the rate changes.
    Pre(ClockChange),
    /// Sent after the rate changed.
    Post(ClockChange),
}

/// Handle returned by [`SysClock::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(usize);

type Listener = Arc<dyn Fn(&ClockEvent) + Send + Sync>;

/// Platform timer counter.
pub struct SysClock {
    now: AtomicU64,
    ticks_per_msec: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_id: AtomicUsize,
}

impl std::fmt::Debug for SysClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SysClock")
            .field("now", &self.now())
            .field("ticks_per_msec", &self.ticks_per_msec())
            .finish()
    }
}

impl SysClock {
    /// Create a clock at tick 0.
    pub fn new(ticks_per_msec: u64) -> Arc<Self> {
        Arc::new(Self {
            now: AtomicU64::new(0),
            ticks_per_msec: AtomicU64::new(ticks_per_msec),
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        })
    }

    /// Current counter value.
    pub fn now(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }

    /// Jump the counter to `ticks`.
    pub fn set(&self, ticks: u64) {
        self.now.store(ticks, Ordering::Release);
    }

    /// Move the counter forward, wrapping at `u64::MAX`.
    pub fn advance(&self, ticks: u64) -> u64 {
        let prev = self
            .now
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(v.wrapping_add(ticks))
            })
            .unwrap_or_else(|v| v);
        prev.wrapping_add(ticks)
    }

    /// Current rate.
    pub fn ticks_per_msec(&self) -> u64 {
        self.ticks_per_msec.load(Ordering::Acquire)
    }

    /// Microseconds to ticks at the current rate.
    pub fn us_to_ticks(&self, us: u64) -> u64 {
        self.ticks_per_msec() * us / 1000
    }

    /// Milliseconds to ticks at the current rate.
    pub fn ms_to_ticks(&self, ms: u64) -> u64 {
        self.ticks_per_msec() * ms
    }

    /// Register a frequency-change listener.
    pub fn register<F>(&self, f: F) -> ListenerId
    where
        F: Fn(&ClockEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, Arc::new(f)));
        id
    }

    /// Remove a listener. Unknown ids are ignored.
    pub fn unregister(&self, id: ListenerId) {
        self.listeners.lock().retain(|(lid, _)| *lid != id);
    }

    /// Change the counter rate, notifying listeners before and after.
    ///
    /// Listeners run without the registry lock held so they may query the clock.
    pub fn set_frequency(&self, new_ticks_per_msec: u64) {
        let change = ClockChange {
            old_ticks_per_msec: self.ticks_per_msec(),
            new_ticks_per_msec,
        };
        let listeners: Vec<Listener> =
            self.listeners.lock().iter().map(|(_, l)| l.clone()).collect();

        tracing::debug!(
            old = change.old_ticks_per_msec,
            new = change.new_ticks_per_msec,
            "clock frequency change"
        );
        for l in &listeners {
            l(&ClockEvent::Pre(change));
        }
        self.ticks_per_msec
            .store(new_ticks_per_msec, Ordering::Release);
        for l in &listeners {
            l(&ClockEvent::Post(change));
        }
    }
}
