//! Tasks: units of periodic or deadline-bound work.

use crate::error::{Error, Result};
use crate::schedule::dp::DpPdata;
use crate::schedule::edf::EdfPdata;
use crate::schedule::ll::LlPdata;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Task priority. Lower values are more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskPriority(pub u8);

impl TaskPriority {
    /// Number of distinct levels.
    pub const LEVELS: usize = 20;
    /// Most urgent.
    pub const HIGH: Self = Self(0);
    /// Default for pipelines.
    pub const MED: Self = Self(4);
    /// Background work.
    pub const LOW: Self = Self(9);
    /// Only when nothing else is ready.
    pub const IDLE: Self = Self(19);

    /// Level index, clamped to the valid range.
    pub fn level(self) -> usize {
        (self.0 as usize).min(Self::LEVELS - 1)
    }
}

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Created, not queued.
    Init,
    /// Waiting in a scheduler list.
    Queued,
    /// Selected to run on this pass.
    Pending,
    /// Work closure executing.
    Running,
    /// Asked to run again.
    Reschedule,
    /// Finished.
    Completed,
    /// Cancelled.
    Cancel,
    /// Released.
    Free,
}

/// Scheduling flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScheduleFlags(u32);

impl ScheduleFlags {
    /// No flags.
    pub const NONE: Self = Self(0);
    /// Phase-lock to the tick boundary.
    pub const SYNC: Self = Self(1 << 0);
    /// Enqueue without forcing a scheduler pass.
    pub const IDLE: Self = Self(1 << 1);

    /// Whether every bit of `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for ScheduleFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Which scheduler owns a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedulerKind {
    /// Tick-driven low latency.
    Ll,
    /// Earliest deadline first.
    Edf,
    /// Deferred processing thread.
    Dp,
}

/// What a work closure asks of its scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskRun {
    /// Done; remove from the scheduler.
    Complete,
    /// Run again after this many microseconds.
    Reschedule(u64),
    /// Remove without completing.
    Cancel,
    /// The work failed.
    Failed(Error),
}

/// Work closure.
pub type TaskFn = Box<dyn FnMut() -> TaskRun + Send>;

/// Task identifier, unique for the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Scheduler private data, one variant per scheduler kind.
#[derive(Debug)]
pub(crate) enum SchedPdata {
    Ll(LlPdata),
    Edf(EdfPdata),
    Dp(Arc<DpPdata>),
}

#[derive(Debug)]
pub(crate) struct TaskCtl {
    pub(crate) state: TaskState,
    pub(crate) start: u64,
    pub(crate) pdata: Option<SchedPdata>,
}

impl TaskCtl {
    pub(crate) fn ll(&mut self) -> Result<&mut LlPdata> {
        match self.pdata.as_mut() {
            Some(SchedPdata::Ll(p)) => Ok(p),
            _ => Err(Error::Invalid("task has no LL data")),
        }
    }

    pub(crate) fn edf(&mut self) -> Result<&mut EdfPdata> {
        match self.pdata.as_mut() {
            Some(SchedPdata::Edf(p)) => Ok(p),
            _ => Err(Error::Invalid("task has no EDF data")),
        }
    }

    pub(crate) fn dp(&self) -> Result<Arc<DpPdata>> {
        match self.pdata.as_ref() {
            Some(SchedPdata::Dp(p)) => Ok(p.clone()),
            _ => Err(Error::Invalid("task has no DP data")),
        }
    }
}

/// A schedulable unit of work.
///
/// Lock order is scheduler list first, then the task control block. The work closure is
/// never invoked with a scheduler lock held.
pub struct Task {
    id: TaskId,
    name: String,
    core: usize,
    priority: TaskPriority,
    kind: SchedulerKind,
    ctl: Mutex<TaskCtl>,
    func: Mutex<TaskFn>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("core", &self.core)
            .field("priority", &self.priority)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish()
    }
}

impl Task {
    /// Create a task in the INIT state.
    pub fn new<F>(
        name: impl Into<String>,
        kind: SchedulerKind,
        core: usize,
        priority: TaskPriority,
        func: F,
    ) -> Arc<Self>
    where
        F: FnMut() -> TaskRun + Send + 'static,
    {
        Arc::new(Self {
            id: TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed)),
            name: name.into(),
            core,
            priority,
            kind,
            ctl: Mutex::new(TaskCtl {
                state: TaskState::Init,
                start: 0,
                pdata: None,
            }),
            func: Mutex::new(Box::new(func)),
        })
    }

    /// Task id.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Task name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owning core.
    pub fn core(&self) -> usize {
        self.core
    }

    /// Static priority.
    pub fn priority(&self) -> TaskPriority {
        self.priority
    }

    /// Owning scheduler kind.
    pub fn kind(&self) -> SchedulerKind {
        self.kind
    }

    /// Current state.
    pub fn state(&self) -> TaskState {
        self.ctl.lock().state
    }

    /// Absolute start, in clock ticks.
    pub fn start(&self) -> u64 {
        self.ctl.lock().start
    }

    /// Absolute EDF deadline in ticks, if the task has EDF data.
    pub fn deadline(&self) -> Option<u64> {
        match self.ctl.lock().pdata.as_ref() {
            Some(SchedPdata::Edf(p)) => Some(p.deadline),
            _ => None,
        }
    }

    /// Whether scheduler private data is attached.
    pub fn is_initialized(&self) -> bool {
        self.ctl.lock().pdata.is_some()
    }

    pub(crate) fn ctl(&self) -> MutexGuard<'_, TaskCtl> {
        self.ctl.lock()
    }

    pub(crate) fn run(&self) -> TaskRun {
        let mut func = self.func.lock();
        (*func)()
    }

    pub(crate) fn check_owner(&self, kind: SchedulerKind, core: usize) -> Result<()> {
        if self.kind != kind {
            return Err(Error::Invalid("task belongs to another scheduler"));
        }
        if self.core != core {
            return Err(Error::Invalid("task belongs to another core"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_combine() {
        let f = ScheduleFlags::SYNC | ScheduleFlags::IDLE;
        assert!(f.contains(ScheduleFlags::SYNC));
        assert!(f.contains(ScheduleFlags::IDLE));
        assert!(!ScheduleFlags::NONE.contains(ScheduleFlags::SYNC));
    }

    #[test]
    fn new_task_is_init() {
        let t = Task::new("t", SchedulerKind::Ll, 0, TaskPriority::MED, || TaskRun::Complete);
        assert_eq!(t.state(), TaskState::Init);
        assert!(!t.is_initialized());
        assert_eq!(t.run(), TaskRun::Complete);
        assert_eq!(TaskPriority(200).level(), TaskPriority::LEVELS - 1);
    }

    #[test]
    fn ids_are_unique() {
        let a = Task::new("a", SchedulerKind::Edf, 0, TaskPriority::LOW, || TaskRun::Complete);
        let b = Task::new("b", SchedulerKind::Edf, 0, TaskPriority::LOW, || TaskRun::Complete);
        assert_ne!(a.id(), b.id());
    }
}
