//! Deferred-processing scheduler.
//!
//! Each DP task owns an OS thread that sleeps on a wake primitive. After every LL tick the
//! scheduler reconciles its tasks under its own lock: ready tasks are released to their
//! thread and every running task gets an absolute deadline derived from the last tick.
//! Only tasks of the local core are reconciled.

use super::ll::TickObserver;
use super::TaskScheduler;
use crate::clock::SysClock;
use crate::config::DpWake;
use crate::error::{Error, Result};
use crate::heap::{Heap, Zone, ZoneAlloc};
use crate::task::{SchedPdata, ScheduleFlags, SchedulerKind, Task, TaskRun, TaskState};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

/// Start value asking for the task to run without waiting for a tick.
pub const RUN_IMMEDIATELY: u64 = u64::MAX;

/// What the DP scheduler needs to know about the module behind a task.
pub trait DpModule: Send + Sync {
    /// Enough input and output space to run.
    fn is_ready(&self) -> bool;

    /// Time budget until output is due, if the module can compute one.
    fn deadline_us(&self) -> Option<u64>;

    /// Longest processing time, used before a deadline is known.
    fn lpt_us(&self) -> u64;
}

/// Binary wake signal in either semaphore or event-bits flavour.
#[derive(Debug)]
pub struct WakeSignal {
    kind: DpWake,
    pending: Mutex<u32>,
    cv: Condvar,
}

impl WakeSignal {
    fn new(kind: DpWake) -> Self {
        Self {
            kind,
            pending: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    /// Post the signal.
    pub fn give(&self) {
        let mut p = self.pending.lock();
        *p = match self.kind {
            DpWake::Semaphore => (*p + 1).min(1),
            DpWake::Event => *p | 1,
        };
        self.cv.notify_one();
    }

    /// Block until posted, then consume.
    pub fn wait(&self) {
        let mut p = self.pending.lock();
        while *p == 0 {
            self.cv.wait(&mut p);
        }
        *p = match self.kind {
            DpWake::Semaphore => *p - 1,
            DpWake::Event => 0,
        };
    }
}

/// DP private data attached to a task.
pub struct DpPdata {
    hooks: Arc<dyn DpModule>,
    wake: WakeSignal,
    os_deadline: AtomicU64,
    ll_cycles_to_start: AtomicU32,
    startup_delay: AtomicBool,
    stop: AtomicBool,
    alive: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
    _charge: ZoneAlloc,
}

impl std::fmt::Debug for DpPdata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DpPdata")
            .field("os_deadline", &self.os_deadline.load(Ordering::Relaxed))
            .field("ll_cycles_to_start", &self.ll_cycles_to_start.load(Ordering::Relaxed))
            .field("startup_delay", &self.startup_delay.load(Ordering::Relaxed))
            .finish()
    }
}

impl DpPdata {
    /// Absolute thread deadline in ticks, 0 until first computed.
    pub fn os_deadline(&self) -> u64 {
        self.os_deadline.load(Ordering::Acquire)
    }

    /// Whether the module is still inside its startup delay.
    pub fn in_startup_delay(&self) -> bool {
        self.startup_delay.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default)]
struct DpState {
    tasks: Vec<Arc<Task>>,
    last_ll_tick: u64,
}

/// Per-core DP scheduler.
pub struct DpScheduler {
    core: usize,
    clock: Arc<SysClock>,
    heap: Arc<Heap>,
    ll_period_us: u64,
    wake_kind: DpWake,
    state: Mutex<DpState>,
    me: Weak<DpScheduler>,
}

impl std::fmt::Debug for DpScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DpScheduler")
            .field("core", &self.core)
            .field("tasks", &self.state.lock().tasks.len())
            .finish()
    }
}

impl DpScheduler {
    /// Create the scheduler for `core`.
    pub fn new(
        core: usize,
        clock: Arc<SysClock>,
        heap: Arc<Heap>,
        ll_period_us: u64,
        wake_kind: DpWake,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            core,
            clock,
            heap,
            ll_period_us: ll_period_us.max(1),
            wake_kind,
            state: Mutex::new(DpState::default()),
            me: me.clone(),
        })
    }

    /// Tasks in the list.
    pub fn queued(&self) -> usize {
        self.state.lock().tasks.len()
    }

    /// Timestamp of the last LL tick seen.
    pub fn last_ll_tick(&self) -> u64 {
        self.state.lock().last_ll_tick
    }

    /// Private data of `task`, if it is a DP task.
    pub fn pdata(task: &Task) -> Option<Arc<DpPdata>> {
        task.ctl().dp().ok()
    }

    /// Attach DP private data to `task` and start its thread.
    pub fn schedule_task_init(&self, task: &Arc<Task>, hooks: Arc<dyn DpModule>) -> Result<()> {
        task.check_owner(SchedulerKind::Dp, self.core)?;
        let pdata = {
            let mut ctl = task.ctl();
            if ctl.pdata.is_some() {
                return Err(Error::Exists);
            }
            let charge = self.heap.alloc_for::<DpPdata>(Zone::Runtime)?;
            let pdata = Arc::new(DpPdata {
                hooks,
                wake: WakeSignal::new(self.wake_kind),
                os_deadline: AtomicU64::new(0),
                ll_cycles_to_start: AtomicU32::new(0),
                startup_delay: AtomicBool::new(true),
                stop: AtomicBool::new(false),
                alive: AtomicBool::new(false),
                thread: Mutex::new(None),
                _charge: charge,
            });
            ctl.pdata = Some(SchedPdata::Dp(pdata.clone()));
            ctl.state = TaskState::Init;
            pdata
        };
        if let Err(e) = self.spawn(task, &pdata) {
            task.ctl().pdata = None;
            return Err(e);
        }
        Ok(())
    }

    fn spawn(&self, task: &Arc<Task>, pdata: &Arc<DpPdata>) -> Result<()> {
        let mut slot = pdata.thread.lock();
        if pdata.alive.load(Ordering::Acquire) {
            return Ok(());
        }
        if let Some(old) = slot.take() {
            if old.thread().id() != std::thread::current().id() {
                if old.join().is_err() {
                    tracing::warn!(core = self.core, task = task.name(), "dp thread panicked");
                }
            }
        }
        pdata.stop.store(false, Ordering::Release);
        pdata.alive.store(true, Ordering::Release);
        let sched = self.me.clone();
        let t = task.clone();
        let p = pdata.clone();
        let handle = std::thread::Builder::new()
            .name(format!("dp-{}-{}", self.core, task.name()))
            .spawn(move || dp_thread(sched, t, p))
            .map_err(|e| {
                pdata.alive.store(false, Ordering::Release);
                tracing::error!(core = self.core, "dp thread spawn failed: {e}");
                Error::NoMemory {
                    zone: Zone::System.name(),
                }
            })?;
        *slot = Some(handle);
        tracing::debug!(core = self.core, task = task.name(), "dp thread started");
        Ok(())
    }

    /// Reconcile every task with the latest LL tick.
    pub fn recalculate(&self, is_ll_post_run: bool) {
        let st = self.state.lock();
        self.recalculate_locked(&st, is_ll_post_run);
    }

    fn recalculate_locked(&self, st: &DpState, is_ll_post_run: bool) {
        let tpm = self.clock.ticks_per_msec();
        for task in &st.tasks {
            let mut ctl = task.ctl();
            let Ok(pd) = ctl.dp() else { continue };

            if is_ll_post_run
                && pd.startup_delay.load(Ordering::Acquire)
                && pd.ll_cycles_to_start.load(Ordering::Acquire) > 0
                && pd.ll_cycles_to_start.fetch_sub(1, Ordering::AcqRel) == 1
            {
                pd.startup_delay.store(false, Ordering::Release);
            }

            let mut trigger = false;
            if ctl.state == TaskState::Queued && pd.hooks.is_ready() {
                ctl.state = TaskState::Running;
                trigger = true;
                if pd.startup_delay.load(Ordering::Acquire)
                    && pd.ll_cycles_to_start.load(Ordering::Acquire) == 0
                {
                    let cycles = (pd.hooks.lpt_us() / self.ll_period_us).max(1);
                    pd.ll_cycles_to_start.store(cycles as u32, Ordering::Release);
                }
                pd.wake.give();
            }

            if ctl.state == TaskState::Running {
                let deadline_us = match pd.hooks.deadline_us() {
                    Some(d) => Some(d),
                    None if trigger => Some(pd.hooks.lpt_us()),
                    None => None,
                };
                if let Some(us) = deadline_us {
                    let ticks = (us / 1000) * tpm;
                    let abs = st.last_ll_tick.wrapping_add(ticks);
                    pd.os_deadline.store(abs, Ordering::Release);
                    tracing::trace!(core = self.core, task = task.name(), deadline = abs, "dp deadline");
                }
            }
        }
    }

    fn finish_run(&self, task: &Arc<Task>, pdata: &DpPdata, res: TaskRun) -> bool {
        let mut st = self.state.lock();
        let exit = {
            let mut ctl = task.ctl();
            if ctl.state != TaskState::Running {
                !matches!(ctl.state, TaskState::Queued)
            } else {
                match res {
                    TaskRun::Reschedule(_) => {
                        ctl.state = TaskState::Queued;
                        false
                    }
                    other => {
                        ctl.state = match other {
                            TaskRun::Complete => TaskState::Completed,
                            TaskRun::Failed(e) => {
                                tracing::error!(core = self.core, task = task.name(), errno = e.errno(), "dp task failed");
                                TaskState::Cancel
                            }
                            _ => TaskState::Cancel,
                        };
                        true
                    }
                }
            }
        };
        if exit {
            st.tasks.retain(|t| !Arc::ptr_eq(t, task));
            pdata.alive.store(false, Ordering::Release);
        }
        self.recalculate_locked(&st, false);
        exit
    }
}

fn dp_thread(sched: Weak<DpScheduler>, task: Arc<Task>, pdata: Arc<DpPdata>) {
    loop {
        pdata.wake.wait();
        if pdata.stop.load(Ordering::Acquire) {
            break;
        }
        let Some(s) = sched.upgrade() else { break };
        if task.state() != TaskState::Running {
            continue;
        }
        let res = task.run();
        if s.finish_run(&task, &pdata, res) {
            break;
        }
    }
    pdata.alive.store(false, Ordering::Release);
    tracing::debug!(task = task.name(), "dp thread exit");
}

impl TickObserver for DpScheduler {
    fn on_ll_tick(&self, tick: u64) {
        let mut st = self.state.lock();
        st.last_ll_tick = tick;
        self.recalculate_locked(&st, true);
    }
}

impl TaskScheduler for DpScheduler {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Dp
    }

    fn core(&self) -> usize {
        self.core
    }

    fn schedule_task(
        &self,
        task: &Arc<Task>,
        start_us: u64,
        _period_us: u64,
        _flags: ScheduleFlags,
    ) -> Result<()> {
        task.check_owner(SchedulerKind::Dp, self.core)?;
        let mut st = self.state.lock();
        let pdata = {
            let ctl = task.ctl();
            if !matches!(
                ctl.state,
                TaskState::Init | TaskState::Cancel | TaskState::Completed
            ) {
                return Err(Error::Invalid("dp task already scheduled"));
            }
            ctl.dp()?
        };
        self.spawn(task, &pdata)?;
        st.tasks.insert(0, task.clone());
        let mut ctl = task.ctl();
        if start_us == RUN_IMMEDIATELY {
            ctl.state = TaskState::Running;
            pdata.wake.give();
        } else {
            ctl.state = TaskState::Queued;
        }
        tracing::debug!(core = self.core, task = task.name(), state = ?ctl.state, "dp task scheduled");
        Ok(())
    }

    fn reschedule_task(&self, _task: &Arc<Task>, _start_us: u64) -> Result<()> {
        Err(Error::NotSupported)
    }

    fn schedule_task_cancel(&self, task: &Arc<Task>) -> Result<()> {
        let pdata = {
            let mut st = self.state.lock();
            let mut ctl = task.ctl();
            let pdata = ctl.dp()?;
            ctl.state = TaskState::Cancel;
            drop(ctl);
            st.tasks.retain(|t| !Arc::ptr_eq(t, task));
            pdata
        };
        pdata.stop.store(true, Ordering::Release);
        pdata.wake.give();
        let handle = pdata.thread.lock().take();
        if let Some(h) = handle {
            if h.thread().id() != std::thread::current().id() {
                if h.join().is_err() {
                    tracing::warn!(core = self.core, task = task.name(), "dp thread panicked");
                }
            }
        }
        tracing::debug!(core = self.core, task = task.name(), "dp task cancelled");
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskPriority;
    use std::time::{Duration, Instant};

    struct Hooks {
        ready: AtomicBool,
        deadline: Option<u64>,
        lpt: u64,
    }

    impl DpModule for Hooks {
        fn is_ready(&self) -> bool {
            self.ready.load(Ordering::Acquire)
        }
        fn deadline_us(&self) -> Option<u64> {
            self.deadline
        }
        fn lpt_us(&self) -> u64 {
            self.lpt
        }
    }

    fn hooks(deadline: Option<u64>) -> Arc<Hooks> {
        Arc::new(Hooks {
            ready: AtomicBool::new(true),
            deadline,
            lpt: 3000,
        })
    }

    fn wait_for(mut f: impl FnMut() -> bool) -> bool {
        let end = Instant::now() + Duration::from_secs(5);
        while Instant::now() < end {
            if f() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        false
    }

    fn sched() -> Arc<DpScheduler> {
        DpScheduler::new(0, SysClock::new(1000), Heap::unbounded(), 1000, DpWake::Semaphore)
    }

    #[test]
    fn schedule_from_running_is_einval() {
        let s = sched();
        let t = Task::new("dp", SchedulerKind::Dp, 0, TaskPriority::MED, || TaskRun::Reschedule(0));
        s.schedule_task_init(&t, hooks(Some(1000))).unwrap();
        s.schedule_task(&t, 0, 1000, ScheduleFlags::NONE).unwrap();
        assert_eq!(t.state(), TaskState::Queued);
        assert!(matches!(
            s.schedule_task(&t, 0, 1000, ScheduleFlags::NONE),
            Err(Error::Invalid(_))
        ));
        s.schedule_task_free(&t).unwrap();
    }

    #[test]
    fn tick_releases_ready_task_to_thread() {
        let s = sched();
        let runs = Arc::new(AtomicU32::new(0));
        let r = runs.clone();
        let h = hooks(Some(2000));
        let h2 = h.clone();
        let t = Task::new("dp", SchedulerKind::Dp, 0, TaskPriority::MED, move || {
            r.fetch_add(1, Ordering::AcqRel);
            h2.ready.store(false, Ordering::Release);
            TaskRun::Reschedule(0)
        });
        s.schedule_task_init(&t, h).unwrap();
        s.schedule_task(&t, 0, 1000, ScheduleFlags::NONE).unwrap();
        s.on_ll_tick(7000);
        assert!(wait_for(|| runs.load(Ordering::Acquire) == 1));
        assert!(wait_for(|| t.state() == TaskState::Queued));
        let pd = DpScheduler::pdata(&t).unwrap();
        assert_eq!(pd.os_deadline(), 7000 + 2000);
        s.schedule_task_free(&t).unwrap();
        assert_eq!(t.state(), TaskState::Free);
    }

    fn startup_task(lpt: u64) -> (Arc<DpScheduler>, Arc<Task>, Arc<AtomicU32>) {
        let s = sched();
        let runs = Arc::new(AtomicU32::new(0));
        let r = runs.clone();
        let h = Arc::new(Hooks {
            ready: AtomicBool::new(true),
            deadline: Some(1000),
            lpt,
        });
        let h2 = h.clone();
        let t = Task::new("dp", SchedulerKind::Dp, 0, TaskPriority::MED, move || {
            r.fetch_add(1, Ordering::AcqRel);
            h2.ready.store(false, Ordering::Release);
            TaskRun::Reschedule(0)
        });
        s.schedule_task_init(&t, h).unwrap();
        s.schedule_task(&t, 0, 1000, ScheduleFlags::NONE).unwrap();
        (s, t, runs)
    }

    #[test]
    fn startup_delay_lasts_lpt_in_ll_periods() {
        let (s, t, runs) = startup_task(3000);
        let pd = DpScheduler::pdata(&t).unwrap();
        assert!(pd.in_startup_delay());

        s.on_ll_tick(1000);
        assert!(wait_for(|| runs.load(Ordering::Acquire) >= 1));
        assert!(pd.in_startup_delay());
        s.on_ll_tick(2000);
        s.on_ll_tick(3000);
        assert!(pd.in_startup_delay());
        s.on_ll_tick(4000);
        assert!(!pd.in_startup_delay());

        // Never re-armed once over.
        s.on_ll_tick(5000);
        assert!(!pd.in_startup_delay());
        s.schedule_task_free(&t).unwrap();
    }

    #[test]
    fn short_lpt_still_delays_one_period() {
        let (s, t, runs) = startup_task(400);
        let pd = DpScheduler::pdata(&t).unwrap();

        s.on_ll_tick(1000);
        assert!(wait_for(|| runs.load(Ordering::Acquire) >= 1));
        assert!(pd.in_startup_delay());
        s.on_ll_tick(2000);
        assert!(!pd.in_startup_delay());
        s.schedule_task_free(&t).unwrap();
    }

    #[test]
    fn complete_removes_and_allows_reschedule() {
        let s = sched();
        let t = Task::new("dp", SchedulerKind::Dp, 0, TaskPriority::MED, || TaskRun::Complete);
        s.schedule_task_init(&t, hooks(None)).unwrap();
        s.schedule_task(&t, RUN_IMMEDIATELY, 0, ScheduleFlags::NONE).unwrap();
        assert!(wait_for(|| t.state() == TaskState::Completed));
        assert_eq!(s.queued(), 0);
        s.schedule_task(&t, RUN_IMMEDIATELY, 0, ScheduleFlags::NONE).unwrap();
        assert!(wait_for(|| t.state() == TaskState::Completed));
        s.schedule_task_free(&t).unwrap();
    }

    #[test]
    fn unknown_deadline_uses_lpt_on_trigger() {
        let s = sched();
        let t = Task::new("dp", SchedulerKind::Dp, 0, TaskPriority::MED, || TaskRun::Reschedule(0));
        s.schedule_task_init(&t, hooks(None)).unwrap();
        s.schedule_task(&t, 0, 0, ScheduleFlags::NONE).unwrap();
        s.on_ll_tick(100);
        let pd = DpScheduler::pdata(&t).unwrap();
        assert_eq!(pd.os_deadline(), 100 + 3000);
        s.schedule_task_cancel(&t).unwrap();
        assert_eq!(t.state(), TaskState::Cancel);
        assert_eq!(s.queued(), 0);
    }

    #[test]
    fn event_wake_coalesces() {
        let w = WakeSignal::new(DpWake::Event);
        w.give();
        w.give();
        w.wait();
        assert_eq!(*w.pending.lock(), 0);
    }
}
