//! Per-core one-shot compare timer.
//!
//! A compare match is consumed when it fires; the handler re-arms if it wants another
//! interrupt. Handlers hold a `Weak` reference to their owner so a registered timer never
//! keeps a scheduler alive.

use parking_lot::Mutex;
use std::sync::Arc;

type Handler = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Default)]
struct TimerState {
    compare: Option<u64>,
    enabled: bool,
}

/// Simulated hardware timer.
pub struct SimTimer {
    core: usize,
    state: Mutex<TimerState>,
    handler: Mutex<Option<Handler>>,
}

impl std::fmt::Debug for SimTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("SimTimer")
            .field("core", &self.core)
            .field("compare", &st.compare)
            .field("enabled", &st.enabled)
            .finish()
    }
}

impl SimTimer {
    /// Create a disabled, unarmed timer for `core`.
    pub fn new(core: usize) -> Arc<Self> {
        Arc::new(Self {
            core,
            state: Mutex::new(TimerState::default()),
            handler: Mutex::new(None),
        })
    }

    /// Owning core.
    pub fn core(&self) -> usize {
        self.core
    }

    /// Install the interrupt handler.
    pub fn register<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.handler.lock() = Some(Arc::new(f));
    }

    /// Remove the interrupt handler.
    pub fn unregister(&self) {
        *self.handler.lock() = None;
    }

    /// Program the compare value.
    pub fn set(&self, ticks: u64) {
        self.state.lock().compare = Some(ticks);
    }

    /// Drop any pending compare value.
    pub fn clear(&self) {
        self.state.lock().compare = None;
    }

    /// Unmask the interrupt.
    pub fn enable(&self) {
        self.state.lock().enabled = true;
    }

    /// Mask the interrupt.
    pub fn disable(&self) {
        self.state.lock().enabled = false;
    }

    /// Programmed compare value.
    pub fn compare(&self) -> Option<u64> {
        self.state.lock().compare
    }

    /// Whether the interrupt is unmasked.
    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    /// Next time this timer will fire, if enabled and armed.
    pub fn next_fire(&self) -> Option<u64> {
        let st = self.state.lock();
        if st.enabled {
            st.compare
        } else {
            None
        }
    }

    /// Fire the handler if the compare value has been reached. Returns true if it fired.
    pub fn fire_if_due(&self, now: u64) -> bool {
        {
            let mut st = self.state.lock();
            match st.compare {
                Some(c) if st.enabled && c <= now => st.compare = None,
                _ => return false,
            }
        }
        let handler = self.handler.lock().clone();
        if let Some(h) = handler {
            tracing::trace!(core = self.core, now, "timer fired");
            h();
        }
        true
    }
}
