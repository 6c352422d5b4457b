//! Scheduler family and the common scheduling surface.

pub mod dp;
pub mod edf;
pub mod ll;

use crate::error::{Error, Result};
use crate::task::{ScheduleFlags, SchedulerKind, Task};
use std::sync::Arc;

pub use dp::{DpModule, DpScheduler, RUN_IMMEDIATELY};
pub use edf::EdfScheduler;
pub use ll::{LlScheduler, LlShared, TickObserver};

/// Operations every scheduler kind supports.
pub trait TaskScheduler: Send + Sync {
    /// Scheduler kind.
    fn kind(&self) -> SchedulerKind;

    /// Core the scheduler runs on.
    fn core(&self) -> usize;

    /// Queue `task`. Start and deadline are relative microseconds.
    fn schedule_task(
        &self,
        task: &Arc<Task>,
        start_us: u64,
        deadline_us: u64,
        flags: ScheduleFlags,
    ) -> Result<()>;

    /// Move the start of a queued task.
    fn reschedule_task(&self, task: &Arc<Task>, start_us: u64) -> Result<()>;

    /// Remove `task`. A running invocation is never interrupted.
    fn schedule_task_cancel(&self, task: &Arc<Task>) -> Result<()>;

    /// Cancel and release private data.
    fn schedule_task_free(&self, task: &Arc<Task>) -> Result<()>;
}

/// Every scheduler instance in the system, by kind and core.
#[derive(Debug, Default, Clone)]
pub struct Schedulers {
    ll: Vec<Arc<LlScheduler>>,
    edf: Vec<Arc<EdfScheduler>>,
    dp: Vec<Arc<DpScheduler>>,
}

impl Schedulers {
    /// Registry over per-core scheduler instances, indexed by core.
    pub fn new(
        ll: Vec<Arc<LlScheduler>>,
        edf: Vec<Arc<EdfScheduler>>,
        dp: Vec<Arc<DpScheduler>>,
    ) -> Self {
        Self { ll, edf, dp }
    }

    /// LL scheduler of `core`.
    pub fn ll(&self, core: usize) -> Result<&Arc<LlScheduler>> {
        self.ll.get(core).ok_or(Error::NoDevice)
    }

    /// EDF scheduler of `core`.
    pub fn edf(&self, core: usize) -> Result<&Arc<EdfScheduler>> {
        self.edf.get(core).ok_or(Error::NoDevice)
    }

    /// DP scheduler of `core`.
    pub fn dp(&self, core: usize) -> Result<&Arc<DpScheduler>> {
        self.dp.get(core).ok_or(Error::NoDevice)
    }

    /// The scheduler owning `task`.
    pub fn for_task(&self, task: &Task) -> Result<&dyn TaskScheduler> {
        let core = task.core();
        let sched: &dyn TaskScheduler = match task.kind() {
            SchedulerKind::Ll => &**self.ll(core)?,
            SchedulerKind::Edf => &**self.edf(core)?,
            SchedulerKind::Dp => &**self.dp(core)?,
        };
        Ok(sched)
    }

    /// Attach LL private data.
    pub fn schedule_task_init_ll(&self, task: &Arc<Task>, flags: ScheduleFlags) -> Result<()> {
        self.ll(task.core())?.schedule_task_init(task, flags)
    }

    /// Attach EDF private data.
    pub fn schedule_task_init_edf(&self, task: &Arc<Task>) -> Result<()> {
        self.edf(task.core())?.schedule_task_init(task)
    }

    /// Attach DP private data and start the task thread.
    pub fn schedule_task_init_dp(&self, task: &Arc<Task>, hooks: Arc<dyn DpModule>) -> Result<()> {
        self.dp(task.core())?.schedule_task_init(task, hooks)
    }

    /// Queue `task` on its scheduler.
    pub fn schedule_task(
        &self,
        task: &Arc<Task>,
        start_us: u64,
        deadline_us: u64,
        flags: ScheduleFlags,
    ) -> Result<()> {
        self.for_task(task)?
            .schedule_task(task, start_us, deadline_us, flags)
    }

    /// Move the start of `task`.
    pub fn reschedule_task(&self, task: &Arc<Task>, start_us: u64) -> Result<()> {
        self.for_task(task)?.reschedule_task(task, start_us)
    }

    /// Cancel `task`.
    pub fn schedule_task_cancel(&self, task: &Arc<Task>) -> Result<()> {
        self.for_task(task)?.schedule_task_cancel(task)
    }

    /// Free `task`.
    pub fn schedule_task_free(&self, task: &Arc<Task>) -> Result<()> {
        self.for_task(task)?.schedule_task_free(task)
    }
}
