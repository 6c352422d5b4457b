//! Low-latency scheduler.
//!
//! Runs periodic tasks once per timer tick. Each core owns an [`LlScheduler`] with its own
//! timer; [`LlShared`] holds the state every core agrees on: the last tick timestamp, the
//! total amount of queued work, and the number of timer clients still running this tick.
//! The last client to finish re-arms every registered timer for the next tick.

use super::TaskScheduler;
use crate::clock::{ClockEvent, ListenerId, SysClock};
use crate::error::{Error, Result};
use crate::heap::{Heap, Zone, ZoneAlloc};
use crate::task::{SchedPdata, ScheduleFlags, SchedulerKind, Task, TaskPriority, TaskRun, TaskState};
use crate::timer::SimTimer;
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// LL private data attached to a task.
#[derive(Debug)]
pub struct LlPdata {
    pub(crate) flags: ScheduleFlags,
    _charge: ZoneAlloc,
}

/// Receives the tick timestamp after each LL pass.
pub trait TickObserver: Send + Sync {
    /// Called once per tick, after every LL task on the core ran.
    fn on_ll_tick(&self, tick: u64);
}

/// LL state shared by every core.
pub struct LlShared {
    clock: Arc<SysClock>,
    period_us: u64,
    total_num_work: AtomicU32,
    timer_clients: AtomicU32,
    last_tick: AtomicU64,
    timers: Mutex<Vec<Option<Arc<SimTimer>>>>,
}

impl std::fmt::Debug for LlShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlShared")
            .field("period_us", &self.period_us)
            .field("total_num_work", &self.total_num_work())
            .field("timer_clients", &self.timer_clients())
            .field("last_tick", &self.last_tick())
            .finish()
    }
}

impl LlShared {
    /// Shared state for `cores` cores ticking every `period_us`.
    pub fn new(clock: Arc<SysClock>, cores: usize, period_us: u64) -> Arc<Self> {
        Arc::new(Self {
            clock,
            period_us,
            total_num_work: AtomicU32::new(0),
            timer_clients: AtomicU32::new(0),
            last_tick: AtomicU64::new(0),
            timers: Mutex::new(vec![None; cores]),
        })
    }

    /// Timestamp of the current (or next armed) tick.
    pub fn last_tick(&self) -> u64 {
        self.last_tick.load(Ordering::Acquire)
    }

    /// Tasks queued across all cores.
    pub fn total_num_work(&self) -> u32 {
        self.total_num_work.load(Ordering::Acquire)
    }

    /// Timers armed for the current tick and not yet finished.
    pub fn timer_clients(&self) -> u32 {
        self.timer_clients.load(Ordering::Acquire)
    }

    /// Tick period in ticks at the current clock rate.
    pub fn period_ticks(&self) -> u64 {
        self.clock.us_to_ticks(self.period_us)
    }

    fn register_timer(&self, core: usize, timer: &Arc<SimTimer>) {
        if let Some(slot) = self.timers.lock().get_mut(core) {
            *slot = Some(timer.clone());
        }
    }

    fn unregister_timer(&self, core: usize) {
        if let Some(slot) = self.timers.lock().get_mut(core) {
            *slot = None;
        }
    }

    fn add_client(&self) {
        self.timer_clients.fetch_add(1, Ordering::AcqRel);
    }

    /// One timer client finished. The last one re-arms every registered timer one period
    /// after the tick it served, if any work remains.
    fn client_done(&self) {
        let prev = self
            .timer_clients
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some(c.saturating_sub(1)))
            .unwrap_or(0);
        if prev > 1 || self.total_num_work() == 0 {
            return;
        }
        let next = self.last_tick().wrapping_add(self.period_ticks());
        self.last_tick.store(next, Ordering::Release);
        let timers = self.timers.lock();
        for timer in timers.iter().flatten() {
            timer.set(next);
            self.add_client();
            timer.enable();
        }
        tracing::trace!(next, clients = self.timer_clients(), "ll timers re-armed");
    }
}

struct LlQueue {
    levels: Vec<VecDeque<Arc<Task>>>,
    ticks_per_msec: u64,
    window_ticks: u64,
}

impl LlQueue {
    fn find(&self, task: &Arc<Task>) -> Option<(usize, usize)> {
        let level = task.priority().level();
        self.levels[level]
            .iter()
            .position(|t| Arc::ptr_eq(t, task))
            .map(|pos| (level, pos))
    }

    fn len(&self) -> usize {
        self.levels.iter().map(VecDeque::len).sum()
    }
}

/// Start inside `[now - window, now]`, with the window allowed to straddle counter wrap.
fn in_window(start: u64, now: u64, window: u64) -> bool {
    if now >= window {
        start >= now - window && start <= now
    } else {
        start <= now || start >= now.wrapping_sub(window)
    }
}

/// Per-core LL scheduler.
pub struct LlScheduler {
    core: usize,
    clock: Arc<SysClock>,
    timer: Arc<SimTimer>,
    shared: Arc<LlShared>,
    heap: Arc<Heap>,
    window_us: u64,
    queue: Mutex<LlQueue>,
    num_ll: AtomicU32,
    observers: Mutex<Vec<Weak<dyn TickObserver>>>,
    listener: Mutex<Option<ListenerId>>,
}

impl std::fmt::Debug for LlScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlScheduler")
            .field("core", &self.core)
            .field("num_ll", &self.num_ll.load(Ordering::Relaxed))
            .field("queued", &self.queued())
            .finish()
    }
}

impl LlScheduler {
    /// Create the scheduler for `core` and hook it to its timer and the clock notifier.
    pub fn new(
        core: usize,
        clock: Arc<SysClock>,
        timer: Arc<SimTimer>,
        shared: Arc<LlShared>,
        heap: Arc<Heap>,
        window_us: u64,
    ) -> Arc<Self> {
        let tpm = clock.ticks_per_msec();
        let levels = (0..TaskPriority::LEVELS)
            .map(|_| VecDeque::with_capacity(8))
            .collect();
        let sched = Arc::new(Self {
            core,
            clock: clock.clone(),
            timer: timer.clone(),
            shared,
            heap,
            window_us,
            queue: Mutex::new(LlQueue {
                levels,
                ticks_per_msec: tpm,
                window_ticks: tpm * window_us / 1000,
            }),
            num_ll: AtomicU32::new(0),
            observers: Mutex::new(Vec::new()),
            listener: Mutex::new(None),
        });

        let weak = Arc::downgrade(&sched);
        timer.register(move || {
            if let Some(s) = weak.upgrade() {
                s.queue_run();
            }
        });
        let weak = Arc::downgrade(&sched);
        let id = clock.register(move |ev| {
            if let Some(s) = weak.upgrade() {
                s.on_clock_event(ev);
            }
        });
        *sched.listener.lock() = Some(id);
        tracing::debug!(core, window_us, "ll scheduler up");
        sched
    }

    /// Owning core.
    pub fn core(&self) -> usize {
        self.core
    }

    /// Shared cross-core state.
    pub fn shared(&self) -> &Arc<LlShared> {
        &self.shared
    }

    /// Tasks queued on this core.
    pub fn num_tasks(&self) -> u32 {
        self.num_ll.load(Ordering::Acquire)
    }

    /// Length of all priority lists together.
    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    /// Whether `task` sits in a list on this core.
    pub fn contains(&self, task: &Arc<Task>) -> bool {
        self.queue.lock().find(task).is_some()
    }

    /// Pending window in ticks at the current rate.
    pub fn window_ticks(&self) -> u64 {
        self.queue.lock().window_ticks
    }

    /// Receive each tick's timestamp after the LL pass.
    pub fn register_tick_observer(&self, observer: Weak<dyn TickObserver>) {
        self.observers.lock().push(observer);
    }

    /// Attach LL private data to `task`.
    pub fn schedule_task_init(&self, task: &Arc<Task>, flags: ScheduleFlags) -> Result<()> {
        task.check_owner(SchedulerKind::Ll, self.core)?;
        let mut ctl = task.ctl();
        if ctl.pdata.is_some() {
            return Err(Error::Exists);
        }
        let charge = self.heap.alloc_for::<LlPdata>(Zone::Runtime)?;
        ctl.pdata = Some(SchedPdata::Ll(LlPdata {
            flags,
            _charge: charge,
        }));
        ctl.state = TaskState::Init;
        Ok(())
    }

    fn set_timer(&self) {
        let first_on_core = self.num_ll.fetch_add(1, Ordering::AcqRel) == 0;
        if first_on_core {
            self.shared.register_timer(self.core, &self.timer);
        }
        if self.shared.total_num_work.fetch_add(1, Ordering::AcqRel) == 0 {
            let now = self.clock.now();
            self.shared.last_tick.store(now, Ordering::Release);
            self.timer.set(now);
            self.shared.add_client();
            self.timer.enable();
            tracing::debug!(core = self.core, now, "ll timer armed");
        } else if first_on_core && !self.timer.is_enabled() {
            // join the tick already in flight on another core
            self.timer.set(self.shared.last_tick());
            self.shared.add_client();
            self.timer.enable();
        }
    }

    fn release_slot(&self) {
        self.shared.total_num_work.fetch_sub(1, Ordering::AcqRel);
        if self.num_ll.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.unregister_timer(self.core);
            if self.timer.is_enabled() {
                self.timer.disable();
                self.timer.clear();
                self.shared.client_done();
            }
            tracing::debug!(core = self.core, "ll core idle");
        }
    }

    fn insert(&self, q: &mut LlQueue, task: &Arc<Task>, start_us: u64, flags: ScheduleFlags) -> Result<()> {
        let mut ctl = task.ctl();
        let pflags = ctl.ll()?.flags | flags;
        self.set_timer();
        let ticks = q.ticks_per_msec * start_us / 1000;
        ctl.start = if pflags.contains(ScheduleFlags::SYNC) {
            self.shared.last_tick().wrapping_add(ticks)
        } else {
            self.clock.now().wrapping_add(ticks)
        };
        ctl.state = TaskState::Queued;
        q.levels[task.priority().level()].push_front(task.clone());
        tracing::trace!(core = self.core, task = task.name(), start = ctl.start, "ll task queued");
        Ok(())
    }

    /// Tick handler: run every due task, highest priority level first.
    pub fn queue_run(&self) {
        self.timer.disable();
        let tick = self.shared.last_tick();
        let now = self.clock.now();

        let mut q = self.queue.lock();
        let window = q.window_ticks;
        for level in &q.levels {
            for task in level {
                let mut ctl = task.ctl();
                if ctl.state == TaskState::Queued && in_window(ctl.start, now, window) {
                    ctl.state = TaskState::Pending;
                }
            }
        }

        for prio in 0..TaskPriority::LEVELS {
            loop {
                let next = q.levels[prio]
                    .iter()
                    .find(|t| t.ctl().state == TaskState::Pending)
                    .cloned();
                let Some(task) = next else { break };
                task.ctl().state = TaskState::Running;

                let res = MutexGuard::unlocked(&mut q, || task.run());

                let Some((_, pos)) = q.find(&task) else {
                    // cancelled while running
                    continue;
                };
                let tpm = q.ticks_per_msec;
                let mut ctl = task.ctl();
                if ctl.state != TaskState::Running {
                    continue;
                }
                match res {
                    TaskRun::Reschedule(us) if us > 0 => {
                        let ticks = tpm * us / 1000;
                        let sync = ctl
                            .ll()
                            .map(|p| p.flags.contains(ScheduleFlags::SYNC))
                            .unwrap_or(false);
                        ctl.start = if sync {
                            ctl.start.wrapping_add(ticks)
                        } else {
                            tick.wrapping_add(ticks)
                        };
                        ctl.state = TaskState::Queued;
                    }
                    res => {
                        ctl.state = match res {
                            TaskRun::Cancel => TaskState::Cancel,
                            TaskRun::Failed(e) => {
                                tracing::error!(core = self.core, task = task.name(), errno = e.errno(), "ll task failed");
                                TaskState::Cancel
                            }
                            _ => TaskState::Completed,
                        };
                        drop(ctl);
                        q.levels[prio].remove(pos);
                        self.release_slot();
                    }
                }
            }
        }
        drop(q);

        self.shared.client_done();

        let observers = self.observers.lock();
        for obs in observers.iter() {
            if let Some(o) = obs.upgrade() {
                o.on_ll_tick(tick);
            }
        }
    }

    fn on_clock_event(&self, ev: &ClockEvent) {
        let ClockEvent::Post(change) = ev else {
            return;
        };
        let old = change.old_ticks_per_msec.max(1);
        let new = change.new_ticks_per_msec;
        let now = self.clock.now();
        let mut q = self.queue.lock();
        q.ticks_per_msec = new;
        q.window_ticks = new * self.window_us / 1000;
        for level in &q.levels {
            for task in level {
                let mut ctl = task.ctl();
                let remapped = if ctl.start > now {
                    let delta = (ctl.start - now) as u128 * new as u128 / old as u128;
                    now.wrapping_add(delta as u64)
                } else {
                    now
                };
                ctl.start = if remapped <= now {
                    now.wrapping_add(new / 8)
                } else {
                    remapped
                };
            }
        }
        tracing::debug!(core = self.core, old, new, "ll tasks remapped");
    }
}

impl TaskScheduler for LlScheduler {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Ll
    }

    fn core(&self) -> usize {
        self.core
    }

    fn schedule_task(
        &self,
        task: &Arc<Task>,
        start_us: u64,
        _deadline_us: u64,
        flags: ScheduleFlags,
    ) -> Result<()> {
        task.check_owner(SchedulerKind::Ll, self.core)?;
        let mut q = self.queue.lock();
        if q.find(task).is_some() {
            return Ok(());
        }
        self.insert(&mut q, task, start_us, flags)
    }

    fn reschedule_task(&self, task: &Arc<Task>, start_us: u64) -> Result<()> {
        task.check_owner(SchedulerKind::Ll, self.core)?;
        let mut q = self.queue.lock();
        if q.find(task).is_none() {
            return self.insert(&mut q, task, start_us, ScheduleFlags::NONE);
        }
        let ticks = q.ticks_per_msec * start_us / 1000;
        task.ctl().start = self.clock.now().wrapping_add(ticks);
        Ok(())
    }

    fn schedule_task_cancel(&self, task: &Arc<Task>) -> Result<()> {
        let mut q = self.queue.lock();
        if let Some((level, pos)) = q.find(task) {
            q.levels[level].remove(pos);
            task.ctl().state = TaskState::Cancel;
            self.release_slot();
            tracing::debug!(core = self.core, task = task.name(), "ll task cancelled");
        }
        Ok(())
    }

    fn schedule_task_free(&self, task: &Arc<Task>) -> Result<()> {
        self.schedule_task_cancel(task)?;
        let mut ctl = task.ctl();
        ctl.state = TaskState::Free;
        ctl.pdata = None;
        Ok(())
    }
}

impl Drop for LlScheduler {
    fn drop(&mut self) {
        if let Some(id) = self.listener.lock().take() {
            self.clock.unregister(id);
        }
        self.timer.unregister();
    }
}
