//! Simulated platform: a clock, per-core timers and schedulers, a DMA controller and a
//! module library, driven forward in time by the caller.
//!
//! Time only moves in [`SimPlatform::run_until`]. Every timer whose compare value is due
//! fires before the clock moves on, so all cores finish one LL tick before the next one.

use crate::clock::SysClock;
use crate::config::PlatformConfig;
use crate::control::{drain_notifications, new_notification_queue, Notification, NotificationRx};
use crate::dma::{DmaController, DmaDir};
use crate::error::Result;
use crate::heap::Heap;
use crate::module::LibraryManager;
use crate::schedule::{DpScheduler, EdfScheduler, LlScheduler, LlShared, Schedulers, TickObserver};
use crate::timer::SimTimer;
use std::sync::{Arc, Weak};

/// Interrupt rounds at one instant before the harness gives up on a timer storm.
const MAX_ROUNDS_PER_INSTANT: usize = 64;

/// A host-simulated DSP.
pub struct SimPlatform {
    config: PlatformConfig,
    clock: Arc<SysClock>,
    heap: Arc<Heap>,
    ll_shared: Arc<LlShared>,
    timers: Vec<Arc<SimTimer>>,
    schedulers: Schedulers,
    dma: Arc<DmaController>,
    library: Arc<LibraryManager>,
    edf_rx: Vec<NotificationRx>,
}

impl std::fmt::Debug for SimPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimPlatform")
            .field("cores", &self.config.cores)
            .field("now", &self.clock.now())
            .field("ll_work", &self.ll_shared.total_num_work())
            .finish()
    }
}

impl SimPlatform {
    /// Bring up every core described by `config`.
    pub fn new(config: PlatformConfig) -> Result<Self> {
        config.validate()?;
        let clock = SysClock::new(config.ticks_per_msec);
        let heap = Heap::from_config(&config);
        let ll_shared = LlShared::new(clock.clone(), config.cores, config.ll_period_us);

        let mut timers = Vec::with_capacity(config.cores * 2);
        let mut ll = Vec::with_capacity(config.cores);
        let mut edf = Vec::with_capacity(config.cores);
        let mut dp = Vec::with_capacity(config.cores);
        let mut edf_rx = Vec::with_capacity(config.cores);
        for core in 0..config.cores {
            let ll_timer = SimTimer::new(core);
            let l = LlScheduler::new(
                core,
                clock.clone(),
                ll_timer.clone(),
                ll_shared.clone(),
                heap.clone(),
                config.ll_window_us,
            );
            let edf_timer = SimTimer::new(core);
            let e = EdfScheduler::new(core, clock.clone(), edf_timer.clone(), heap.clone(), config.ll_period_us);
            let (tx, rx) = new_notification_queue();
            e.set_notifier(tx);
            let d = DpScheduler::new(core, clock.clone(), heap.clone(), config.ll_period_us, config.dp_wake);
            let observer: Weak<dyn TickObserver> = Arc::downgrade(&d) as Weak<dyn TickObserver>;
            l.register_tick_observer(observer);

            timers.push(ll_timer);
            timers.push(edf_timer);
            ll.push(l);
            edf.push(e);
            dp.push(d);
            edf_rx.push(rx);
        }

        let dma = DmaController::new(0, config.dma_channels, DmaDir::HMEM_TO_LMEM | DmaDir::LMEM_TO_HMEM);
        dma.probe()?;
        let library = Arc::new(LibraryManager::new(heap.clone()));
        tracing::info!(cores = config.cores, tpm = config.ticks_per_msec, "simulated platform up");
        Ok(Self {
            config,
            clock,
            heap,
            ll_shared,
            timers,
            schedulers: Schedulers::new(ll, edf, dp),
            dma,
            library,
            edf_rx,
        })
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<SysClock> {
        &self.clock
    }

    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    pub fn schedulers(&self) -> &Schedulers {
        &self.schedulers
    }

    pub fn ll(&self, core: usize) -> Result<&Arc<LlScheduler>> {
        self.schedulers.ll(core)
    }

    pub fn edf(&self, core: usize) -> Result<&Arc<EdfScheduler>> {
        self.schedulers.edf(core)
    }

    pub fn dp(&self, core: usize) -> Result<&Arc<DpScheduler>> {
        self.schedulers.dp(core)
    }

    pub fn ll_shared(&self) -> &Arc<LlShared> {
        &self.ll_shared
    }

    pub fn dma(&self) -> &Arc<DmaController> {
        &self.dma
    }

    pub fn library(&self) -> &Arc<LibraryManager> {
        &self.library
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// Change the clock rate; schedulers remap their queued work.
    pub fn set_frequency(&self, ticks_per_msec: u64) {
        self.clock.set_frequency(ticks_per_msec);
    }

    /// Earliest armed timer.
    pub fn next_event(&self) -> Option<u64> {
        self.timers.iter().filter_map(|t| t.next_fire()).min()
    }

    /// Fire every timer due at the current time until none is. Returns interrupts fired.
    pub fn fire_due(&self) -> usize {
        let now = self.clock.now();
        let mut fired = 0;
        for _ in 0..MAX_ROUNDS_PER_INSTANT {
            let round = self.timers.iter().filter(|t| t.fire_if_due(now)).count();
            if round == 0 {
                return fired;
            }
            fired += round;
        }
        tracing::warn!(now, "timers keep firing at the same instant");
        fired
    }

    /// Advance to `target` ticks, serving every interrupt on the way. Returns interrupts
    /// fired.
    pub fn run_until(&self, target: u64) -> usize {
        let mut fired = self.fire_due();
        while let Some(next) = self.next_event() {
            if next > target {
                break;
            }
            if next > self.clock.now() {
                self.clock.set(next);
            }
            let n = self.fire_due();
            if n == 0 {
                break;
            }
            fired += n;
        }
        if target > self.clock.now() {
            self.clock.set(target);
        }
        fired
    }

    /// Advance by `us` microseconds.
    pub fn run_for_us(&self, us: u64) -> usize {
        let target = self.clock.now() + self.clock.us_to_ticks(us);
        self.run_until(target)
    }

    /// Advance by `n` LL periods.
    pub fn run_periods(&self, n: u64) -> usize {
        self.run_for_us(n * self.config.ll_period_us)
    }

    /// Cancellations posted by the EDF schedulers of every core.
    pub fn drain_edf_notifications(&mut self) -> Vec<Notification> {
        self.edf_rx.iter_mut().flat_map(drain_notifications).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::TaskScheduler;
    use crate::task::{ScheduleFlags, SchedulerKind, Task, TaskPriority, TaskRun};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn ll_task_runs_once_per_period() {
        let p = SimPlatform::new(PlatformConfig::default()).unwrap();
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        let task = Task::new("tick", SchedulerKind::Ll, 0, TaskPriority::MED, move || {
            h.fetch_add(1, Ordering::Relaxed);
            TaskRun::Reschedule(1000)
        });
        let ll = p.ll(0).unwrap();
        ll.schedule_task_init(&task, ScheduleFlags::SYNC).unwrap();
        ll.schedule_task(&task, 0, 1000, ScheduleFlags::SYNC).unwrap();
        p.run_until(4_500);
        assert_eq!(hits.load(Ordering::Relaxed), 5);
        assert_eq!(p.now(), 4_500);
    }

    #[test]
    fn idle_platform_only_moves_the_clock() {
        let p = SimPlatform::new(PlatformConfig::default().with_cores(2)).unwrap();
        assert_eq!(p.run_periods(3), 0);
        assert_eq!(p.now(), 3_000);
        assert!(p.ll(2).is_err());
    }

    #[test]
    fn bad_config_is_refused() {
        assert!(SimPlatform::new(PlatformConfig::default().with_cores(0)).is_err());
    }
}
