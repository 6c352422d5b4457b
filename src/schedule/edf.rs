//! Earliest-deadline-first scheduler.
//!
//! Each task carries a `(start, deadline)` window. A dispatch pass runs every task whose
//! start has been reached, picking by static priority and then nearest deadline, and arms a
//! one-shot timer for the first task still in the future. A task that misses its deadline
//! is moved to a later slot once; missing again before it gets to run cancels it.

use super::TaskScheduler;
use crate::clock::SysClock;
use crate::control::{notify, Notification, NotificationTx};
use crate::error::{Error, Result};
use crate::heap::{Heap, Zone, ZoneAlloc};
use crate::task::{SchedPdata, ScheduleFlags, SchedulerKind, Task, TaskRun, TaskState};
use crate::timer::SimTimer;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Attempts to align a missed task with a later slot before falling back to `now`.
pub const SLOT_ALIGN_TRIES: usize = 10;

/// EDF private data attached to a task.
#[derive(Debug)]
pub struct EdfPdata {
    pub(crate) deadline: u64,
    missed: bool,
    cancel_pending: bool,
    _charge: ZoneAlloc,
}

/// Move a missed task forward by whole windows. Returns the new `(start, deadline)`.
fn edf_reschedule(start: u64, deadline: u64, now: u64) -> (u64, u64) {
    let delta = deadline.wrapping_sub(start) << 1;
    let mut start = start;
    for _ in 0..SLOT_ALIGN_TRIES {
        start = start.wrapping_add(delta);
        if start > now.wrapping_add(delta) {
            return (start, start.wrapping_add(delta));
        }
    }
    let start = now.wrapping_add(delta);
    (start, start.wrapping_add(delta))
}

/// Per-core EDF scheduler.
pub struct EdfScheduler {
    core: usize,
    clock: Arc<SysClock>,
    timer: Arc<SimTimer>,
    heap: Arc<Heap>,
    retry_us: u64,
    list: Mutex<Vec<Arc<Task>>>,
    in_dispatch: AtomicBool,
    rerun: AtomicBool,
    notify: Mutex<Option<NotificationTx>>,
}

impl std::fmt::Debug for EdfScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdfScheduler")
            .field("core", &self.core)
            .field("queued", &self.list.lock().len())
            .finish()
    }
}

impl EdfScheduler {
    /// Create the scheduler for `core`. A failed task is retried `retry_us` later.
    pub fn new(
        core: usize,
        clock: Arc<SysClock>,
        timer: Arc<SimTimer>,
        heap: Arc<Heap>,
        retry_us: u64,
    ) -> Arc<Self> {
        let sched = Arc::new(Self {
            core,
            clock,
            timer: timer.clone(),
            heap,
            retry_us,
            list: Mutex::new(Vec::new()),
            in_dispatch: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
            notify: Mutex::new(None),
        });
        let weak = Arc::downgrade(&sched);
        timer.register(move || {
            if let Some(s) = weak.upgrade() {
                s.run();
            }
        });
        sched
    }

    /// Send cancellations caused by deadline misses to `tx`.
    pub fn set_notifier(&self, tx: NotificationTx) {
        *self.notify.lock() = Some(tx);
    }

    /// Number of tasks in the list.
    pub fn queued(&self) -> usize {
        self.list.lock().len()
    }

    /// Whether `task` is in the list.
    pub fn contains(&self, task: &Arc<Task>) -> bool {
        self.list.lock().iter().any(|t| Arc::ptr_eq(t, task))
    }

    /// Attach EDF private data to `task`.
    pub fn schedule_task_init(&self, task: &Arc<Task>) -> Result<()> {
        task.check_owner(SchedulerKind::Edf, self.core)?;
        let mut ctl = task.ctl();
        if ctl.pdata.is_some() {
            return Err(Error::Exists);
        }
        let charge = self.heap.alloc_for::<EdfPdata>(Zone::Runtime)?;
        ctl.pdata = Some(SchedPdata::Edf(EdfPdata {
            deadline: 0,
            missed: false,
            cancel_pending: false,
            _charge: charge,
        }));
        ctl.state = TaskState::Init;
        Ok(())
    }

    fn notify_cancel(&self, task: &Task) {
        if let Some(tx) = self.notify.lock().as_mut() {
            if !notify(tx, Notification::TaskCancelled { task: task.id() }) {
                tracing::warn!(core = self.core, task = task.name(), "notification queue full");
            }
        }
    }

    /// Pick the next task: lowest priority value first, then nearest deadline.
    ///
    /// A missed task is moved to a later slot and competes with its new window; a task that
    /// misses again without having run in between is removed and cancelled.
    fn get_next(&self, list: &mut Vec<Arc<Task>>, now: u64) -> Option<usize> {
        let mut best: Option<(usize, u8, u64)> = None;
        let mut i = 0;
        while i < list.len() {
            let task = list[i].clone();
            let mut ctl = task.ctl();
            if ctl.state != TaskState::Queued {
                i += 1;
                continue;
            }
            let start = ctl.start;
            let Ok(pd) = ctl.edf() else {
                i += 1;
                continue;
            };
            let mut rescheduled_start = None;
            if pd.deadline < now {
                if pd.missed {
                    ctl.state = TaskState::Cancel;
                    drop(ctl);
                    list.remove(i);
                    tracing::warn!(core = self.core, task = task.name(), "edf task missed twice, cancelled");
                    self.notify_cancel(&task);
                    continue;
                }
                let (new_start, new_deadline) = edf_reschedule(start, pd.deadline, now);
                pd.deadline = new_deadline;
                pd.missed = true;
                rescheduled_start = Some(new_start);
                tracing::debug!(core = self.core, task = task.name(), new_start, "edf deadline missed");
            }
            let deadline = pd.deadline;
            if let Some(new_start) = rescheduled_start {
                ctl.start = new_start;
            }
            let prio = task.priority().0;
            let better = match best {
                None => true,
                Some((_, bp, bd)) => prio < bp || (prio == bp && deadline < bd),
            };
            if better {
                best = Some((i, prio, deadline));
            }
            i += 1;
        }
        best.map(|(i, _, _)| i)
    }

    /// Dispatch: run every due task. Returns the tick the timer was armed for, if any.
    ///
    /// A call made while a pass is already in progress only requests another pass.
    pub fn run(&self) -> Option<u64> {
        if self.in_dispatch.swap(true, Ordering::AcqRel) {
            self.rerun.store(true, Ordering::Release);
            return None;
        }
        loop {
            self.rerun.store(false, Ordering::Release);
            let armed = self.dispatch_pass();
            if !self.rerun.swap(false, Ordering::AcqRel) {
                self.in_dispatch.store(false, Ordering::Release);
                return armed;
            }
        }
    }

    fn dispatch_pass(&self) -> Option<u64> {
        loop {
            let now = self.clock.now();
            let mut list = self.list.lock();
            let Some(idx) = self.get_next(&mut list, now) else {
                self.timer.disable();
                self.timer.clear();
                return None;
            };
            let task = list[idx].clone();
            let start = task.start();
            if start > now {
                self.timer.set(start);
                self.timer.enable();
                return Some(start);
            }
            task.ctl().state = TaskState::Pending;
            list.remove(idx);
            task.ctl().state = TaskState::Running;
            drop(list);

            let res = task.run();

            let mut list = self.list.lock();
            let mut ctl = task.ctl();
            if ctl.state != TaskState::Running {
                // re-queued from inside its own work
                continue;
            }
            let Ok(pd) = ctl.edf() else {
                continue;
            };
            if pd.cancel_pending {
                pd.cancel_pending = false;
                ctl.state = TaskState::Cancel;
                tracing::debug!(core = self.core, task = task.name(), "edf deferred cancel applied");
                continue;
            }
            pd.missed = false;
            match res {
                TaskRun::Complete => ctl.state = TaskState::Completed,
                TaskRun::Cancel => ctl.state = TaskState::Cancel,
                TaskRun::Reschedule(us) => {
                    let window = pd.deadline.wrapping_sub(start);
                    let next = start.wrapping_add(self.clock.us_to_ticks(us));
                    pd.deadline = next.wrapping_add(window);
                    ctl.start = next;
                    ctl.state = TaskState::Queued;
                    drop(ctl);
                    list.push(task);
                }
                TaskRun::Failed(e) => {
                    tracing::error!(core = self.core, task = task.name(), errno = e.errno(), "edf task failed, pass aborted");
                    ctl.state = TaskState::Queued;
                    drop(ctl);
                    list.push(task);
                    let retry = now.wrapping_add(self.clock.us_to_ticks(self.retry_us));
                    self.timer.set(retry);
                    self.timer.enable();
                    return Some(retry);
                }
            }
        }
    }
}

impl TaskScheduler for EdfScheduler {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Edf
    }

    fn core(&self) -> usize {
        self.core
    }

    fn schedule_task(
        &self,
        task: &Arc<Task>,
        start_us: u64,
        deadline_us: u64,
        flags: ScheduleFlags,
    ) -> Result<()> {
        task.check_owner(SchedulerKind::Edf, self.core)?;
        {
            let mut list = self.list.lock();
            let mut ctl = task.ctl();
            if matches!(ctl.state, TaskState::Queued | TaskState::Pending) {
                return Ok(());
            }
            let now = self.clock.now();
            let start = if start_us == 0 {
                now
            } else {
                ctl.start.wrapping_add(self.clock.us_to_ticks(start_us))
            };
            let deadline = start.wrapping_add(self.clock.us_to_ticks(deadline_us));
            let pd = ctl.edf()?;
            pd.deadline = deadline;
            pd.missed = false;
            pd.cancel_pending = false;
            ctl.start = start;
            ctl.state = TaskState::Queued;
            drop(ctl);
            list.push(task.clone());
            tracing::trace!(core = self.core, task = task.name(), start, deadline, "edf task queued");
        }
        if !flags.contains(ScheduleFlags::IDLE) {
            self.run();
        }
        Ok(())
    }

    fn reschedule_task(&self, task: &Arc<Task>, start_us: u64) -> Result<()> {
        task.check_owner(SchedulerKind::Edf, self.core)?;
        let mut list = self.list.lock();
        let mut ctl = task.ctl();
        let now = self.clock.now();
        let start = now.wrapping_add(self.clock.us_to_ticks(start_us));
        let old_start = ctl.start;
        let pd = ctl.edf()?;
        let window = pd.deadline.wrapping_sub(old_start);
        pd.deadline = start.wrapping_add(window);
        pd.missed = false;
        ctl.start = start;
        if ctl.state != TaskState::Queued {
            ctl.state = TaskState::Queued;
            drop(ctl);
            if !list.iter().any(|t| Arc::ptr_eq(t, task)) {
                list.push(task.clone());
            }
        }
        Ok(())
    }

    fn schedule_task_cancel(&self, task: &Arc<Task>) -> Result<()> {
        let mut list = self.list.lock();
        let mut ctl = task.ctl();
        match ctl.state {
            TaskState::Queued | TaskState::Pending => {
                ctl.state = TaskState::Cancel;
                drop(ctl);
                list.retain(|t| !Arc::ptr_eq(t, task));
                tracing::debug!(core = self.core, task = task.name(), "edf task cancelled");
            }
            TaskState::Running => {
                ctl.edf()?.cancel_pending = true;
            }
            _ => {}
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

impl Drop for EdfScheduler {
    fn drop(&mut self) {
        self.timer.unregister();
    }
}
