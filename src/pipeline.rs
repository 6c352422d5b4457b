//! Pipelines: a component graph, its copy plan and the LL task that drives it.
//!
//! The copy walk visits components producers first. Trigger commands propagate
//! downstream-first (sink side before source side) for START, RELEASE, PRE_START,
//! PRE_RELEASE and PREPARE and upstream-first for the rest. A component answering
//! [`PathStatus::Stop`] ends the walk along its branch: a component is skipped once every
//! neighbour it would be reached from has stopped. The first error halts the walk.
//!
//! Nothing on the copy or task path allocates; walk scratch is sized when the pipeline
//! is built.

// IMPORTANT: no assert_invariant on the task path; use invariant_rt signals.

use crate::buffer::StreamParams;
use crate::component::{comp_set_state, CompDev, CompState, PathStatus, Position, StateChange, TriggerCmd};
use crate::control::{notify, Notification, NotificationTx, PipelineId};
use crate::error::{Error, Result};
use crate::graph::{Graph, NodeId};
use crate::invariant_ppt::{assert_invariant, PIPELINE_ENDPOINTS, PIPELINE_SCHEDULED};
use crate::invariant_rt::{
    signal_invariant, SignalTx, INV_COPY_COMPLETE, INV_PIPELINE_FAILED, INV_TRIGGER_APPLIED,
    INV_TRIGGER_DELAYED, INV_XRUN_RECOVERED,
};
use crate::plan::CopyPlan;
use crate::schedule::{LlScheduler, TaskScheduler};
use crate::task::{ScheduleFlags, SchedulerKind, Task, TaskPriority, TaskRun};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

/// What paces the pipeline task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeDomain {
    /// The LL timer tick.
    #[default]
    Timer,
    /// Completion interrupts of the scheduling component's DMA.
    Dma,
}

/// Scheduling parameters of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleConfig {
    pub core: usize,
    pub period_us: u64,
    pub priority: TaskPriority,
    pub time_domain: TimeDomain,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            core: 0,
            period_us: 1000,
            priority: TaskPriority::MED,
            time_domain: TimeDomain::Timer,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingTrigger {
    cmd: TriggerCmd,
    delay: u32,
}

#[derive(Debug, Clone)]
struct SchedBinding {
    sched: Arc<LlScheduler>,
    task: Arc<Task>,
}

/// Visit every live node once, in plan order or reversed, honouring branch stops.
fn walk<F>(
    plan: &CopyPlan,
    graph: &mut Graph,
    blocked: &mut [bool],
    downstream_first: bool,
    mut op: F,
) -> std::result::Result<(), (NodeId, Error)>
where
    F: FnMut(&mut CompDev) -> Result<PathStatus>,
{
    blocked.fill(false);
    let order = plan.order();
    for i in 0..order.len() {
        let id = if downstream_first {
            order[order.len() - 1 - i]
        } else {
            order[i]
        };
        let reached_from = if downstream_first {
            plan.downstream(id)
        } else {
            plan.upstream(id)
        };
        if !reached_from.is_empty() && reached_from.iter().all(|n| blocked[n.0]) {
            blocked[id.0] = true;
            continue;
        }
        let Some(dev) = graph.node_mut(id) else {
            continue;
        };
        match op(dev) {
            Ok(PathStatus::Continue) => {}
            Ok(PathStatus::Stop) => blocked[id.0] = true,
            Err(e) => return Err((id, e)),
        }
    }
    Ok(())
}

/// A pipeline.
pub struct Pipeline {
    id: PipelineId,
    graph: Graph,
    plan: CopyPlan,
    source: NodeId,
    sink: NodeId,
    sched_comp: NodeId,
    config: ScheduleConfig,
    status: CompState,
    pending: Option<PendingTrigger>,
    recovering: bool,
    blocked: Vec<bool>,
    notifier: Option<NotificationTx>,
    signals: Option<SignalTx>,
    binding: Option<SchedBinding>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("components", &self.graph.len())
            .field("config", &self.config)
            .field("scheduled", &self.binding.is_some())
            .finish()
    }
}

impl Pipeline {
    /// Build a pipeline over `graph`. The first planned source and last planned sink
    /// become the endpoints; the source also paces the pipeline.
    pub fn new(id: PipelineId, graph: Graph) -> Result<Self> {
        let plan = CopyPlan::compile(&graph)?;
        let source = plan.sources().next().ok_or(Error::Invalid("pipeline has no source"))?;
        let sink = plan.sinks().last().ok_or(Error::Invalid("pipeline has no sink"))?;
        assert_invariant(
            PIPELINE_ENDPOINTS,
            graph.node(source).is_some() && graph.node(sink).is_some(),
            "pipeline endpoints exist",
            Some("new"),
        );
        let blocked = vec![false; plan.slots()];
        tracing::info!(pipeline = id.0, components = graph.len(), "pipeline created");
        Ok(Self {
            id,
            graph,
            plan,
            source,
            sink,
            sched_comp: source,
            config: ScheduleConfig::default(),
            status: CompState::Ready,
            pending: None,
            recovering: false,
            blocked,
            notifier: None,
            signals: None,
            binding: None,
        })
    }

    /// Override the endpoint and scheduling components.
    pub fn with_endpoints(mut self, source: NodeId, sink: NodeId, sched_comp: NodeId) -> Result<Self> {
        for n in [source, sink, sched_comp] {
            if self.graph.node(n).is_none() {
                return Err(Error::NoDevice);
            }
        }
        self.source = source;
        self.sink = sink;
        self.sched_comp = sched_comp;
        Ok(self)
    }

    /// Where xrun, error and position messages go.
    pub fn set_notifier(&mut self, tx: NotificationTx) {
        self.notifier = Some(tx);
    }

    /// Where task path invariant signals go.
    pub fn set_signal_queue(&mut self, tx: SignalTx) {
        self.signals = Some(tx);
    }

    pub fn id(&self) -> PipelineId {
        self.id
    }

    pub fn status(&self) -> CompState {
        self.status
    }

    pub fn config(&self) -> &ScheduleConfig {
        &self.config
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn plan(&self) -> &CopyPlan {
        &self.plan
    }

    pub fn source(&self) -> NodeId {
        self.source
    }

    pub fn sink(&self) -> NodeId {
        self.sink
    }

    pub fn sched_comp(&self) -> NodeId {
        self.sched_comp
    }

    pub fn component(&self, id: NodeId) -> Option<&CompDev> {
        self.graph.node(id)
    }

    pub fn component_mut(&mut self, id: NodeId) -> Option<&mut CompDev> {
        self.graph.node_mut(id)
    }

    /// The LL task, once scheduling is configured.
    pub fn task(&self) -> Option<&Arc<Task>> {
        self.binding.as_ref().map(|b| &b.task)
    }

    /// Whether a deferred trigger is waiting for the task.
    pub fn trigger_pending(&self) -> bool {
        self.pending.is_some()
    }

    fn signal(&mut self, id: u8) {
        if let Some(tx) = self.signals.as_mut() {
            signal_invariant(tx, id);
        }
    }

    fn post(&mut self, msg: Notification) {
        if let Some(tx) = self.notifier.as_mut() {
            if !notify(tx, msg) {
                tracing::warn!(pipeline = self.id.0, "notification queue full");
            }
        }
    }

    /// Hand `params` to every component.
    pub fn params(&mut self, params: &StreamParams) -> Result<()> {
        let id = self.id;
        walk(&self.plan, &mut self.graph, &mut self.blocked, true, |dev| {
            dev.params(params)?;
            Ok(PathStatus::Continue)
        })
        .map_err(|(node, e)| {
            tracing::error!(pipeline = id.0, node = node.0, errno = e.errno(), "params failed");
            e
        })
    }

    /// READY → PREPARE on every component, sink side first.
    pub fn prepare(&mut self) -> Result<()> {
        let prev = self.status;
        if comp_set_state(&mut self.status, TriggerCmd::Prepare)? == StateChange::AlreadySet {
            return Ok(());
        }
        let id = self.id;
        let res = walk(&self.plan, &mut self.graph, &mut self.blocked, true, |dev| dev.prepare());
        if let Err((node, e)) = res {
            self.status = prev;
            tracing::error!(pipeline = id.0, node = node.0, errno = e.errno(), "prepare failed");
            return Err(e);
        }
        tracing::debug!(pipeline = id.0, "pipeline prepared");
        Ok(())
    }

    /// Propagate `cmd` through the components without touching the pipeline task.
    pub fn trigger(&mut self, cmd: TriggerCmd) -> Result<()> {
        let prev = self.status;
        if comp_set_state(&mut self.status, cmd)? == StateChange::AlreadySet {
            return Ok(());
        }
        let id = self.id;
        let res = walk(
            &self.plan,
            &mut self.graph,
            &mut self.blocked,
            cmd.is_downstream_first(),
            |dev| dev.trigger(cmd),
        );
        if let Err((node, e)) = res {
            self.status = prev;
            tracing::error!(pipeline = id.0, node = node.0, ?cmd, errno = e.errno(), "trigger failed");
            return Err(e);
        }
        tracing::debug!(pipeline = id.0, ?cmd, status = ?self.status, "pipeline triggered");
        Ok(())
    }

    /// Reset every component, source side first.
    pub fn reset(&mut self) -> Result<()> {
        let res = walk(&self.plan, &mut self.graph, &mut self.blocked, false, |dev| {
            dev.reset()?;
            Ok(PathStatus::Continue)
        });
        self.pending = None;
        self.recovering = false;
        res.map_err(|(_, e)| e)?;
        self.status = CompState::Ready;
        Ok(())
    }

    /// One copy walk. Inactive components stop their branch; deferred ones are left to
    /// their own thread.
    pub fn copy(&mut self) -> Result<()> {
        let res = walk(&self.plan, &mut self.graph, &mut self.blocked, false, |dev| {
            if dev.state() != CompState::Active {
                return Ok(PathStatus::Stop);
            }
            if dev.is_deferred() {
                return Ok(PathStatus::Continue);
            }
            dev.copy()
        });
        match res {
            Ok(()) => {
                self.signal(INV_COPY_COMPLETE);
                Ok(())
            }
            Err((node, e)) => {
                tracing::trace!(pipeline = self.id.0, node = node.0, errno = e.errno(), "copy failed");
                if e == Error::Pipe {
                    let bytes = self
                        .graph
                        .node_mut(node)
                        .and_then(|d| d.endpoint().map(|ep| ep.xrun_bytes()))
                        .unwrap_or(0);
                    let comp = self.graph.node(node).map(|d| d.id());
                    if let Some(comp) = comp {
                        self.post(Notification::Xrun {
                            pipeline: self.id,
                            comp,
                            bytes,
                        });
                    }
                }
                Err(e)
            }
        }
    }

    /// Position of the source endpoint, if it is one.
    pub fn position(&mut self) -> Option<Result<Position>> {
        let source = self.source;
        self.graph.node_mut(source).and_then(|d| d.position())
    }

    /// Report the source endpoint position, stamped `now`.
    pub fn post_position(&mut self, now: u64) -> Result<()> {
        let pos = self.position().ok_or(Error::NotSupported)??;
        self.post(Notification::PositionUpdate {
            pipeline: self.id,
            host_bytes: pos.host_bytes,
            timestamp: now,
        });
        Ok(())
    }

    /// Queue `cmd` for the pipeline task, to run after `delay` further ticks.
    pub fn set_pending_trigger(&mut self, cmd: TriggerCmd, delay: u32) -> Result<()> {
        if self.pending.is_some() {
            return Err(Error::Busy);
        }
        self.pending = Some(PendingTrigger { cmd, delay });
        Ok(())
    }

    /// Stop, reset, prepare and restart every component.
    fn recover(&mut self) -> Result<()> {
        let cmds = [TriggerCmd::PreStart, TriggerCmd::Start];
        walk(&self.plan, &mut self.graph, &mut self.blocked, false, |dev| {
            dev.trigger(TriggerCmd::Xrun)?;
            dev.reset()?;
            Ok(PathStatus::Continue)
        })
        .map_err(|(_, e)| e)?;
        walk(&self.plan, &mut self.graph, &mut self.blocked, true, |dev| dev.prepare())
            .map_err(|(_, e)| e)?;
        for cmd in cmds {
            walk(&self.plan, &mut self.graph, &mut self.blocked, true, |dev| dev.trigger(cmd))
                .map_err(|(_, e)| e)?;
        }
        self.status = CompState::Active;
        Ok(())
    }

    /// Give up: stop what still runs and tell the host.
    fn fail(&mut self, e: Error) -> TaskRun {
        tracing::error!(pipeline = self.id.0, errno = e.errno(), "pipeline stopped on error");
        for id in self.plan.order() {
            if let Some(dev) = self.graph.node_mut(*id) {
                if let Err(te) = dev.trigger(TriggerCmd::Stop) {
                    tracing::warn!(pipeline = self.id.0, node = id.0, errno = te.errno(), "stop after failure refused");
                }
            }
        }
        if let Err(se) = comp_set_state(&mut self.status, TriggerCmd::Stop) {
            tracing::warn!(pipeline = self.id.0, status = ?self.status, errno = se.errno(), "pipeline status not stopped");
        }
        self.recovering = false;
        self.signal(INV_PIPELINE_FAILED);
        self.post(Notification::PipelineError {
            pipeline: self.id,
            errno: e.errno(),
        });
        TaskRun::Complete
    }

    /// Body of the pipeline task: apply a due trigger, then copy.
    pub fn run_task(&mut self) -> TaskRun {
        let period = self.config.period_us;
        if let Some(p) = self.pending.as_mut() {
            if p.delay > 0 {
                p.delay -= 1;
                self.signal(INV_TRIGGER_DELAYED);
            } else {
                let cmd = p.cmd;
                self.pending = None;
                if let Err(e) = self.trigger(cmd) {
                    return self.fail(e);
                }
                self.signal(INV_TRIGGER_APPLIED);
                if matches!(
                    cmd,
                    TriggerCmd::Stop | TriggerCmd::Pause | TriggerCmd::Reset | TriggerCmd::Xrun
                ) {
                    return TaskRun::Complete;
                }
            }
        }
        if self.status != CompState::Active {
            return TaskRun::Reschedule(period);
        }
        match self.copy() {
            Ok(()) => {
                self.recovering = false;
                TaskRun::Reschedule(period)
            }
            Err(e) if self.recovering => self.fail(e),
            Err(e) => {
                tracing::warn!(pipeline = self.id.0, errno = e.errno(), "copy failed, recovering");
                self.recovering = true;
                match self.recover() {
                    Ok(()) => {
                        self.signal(INV_XRUN_RECOVERED);
                        TaskRun::Reschedule(period)
                    }
                    Err(re) => self.fail(re),
                }
            }
        }
    }

    /// Release every component.
    pub fn free(&mut self) {
        let ids: Vec<NodeId> = self.plan.order().to_vec();
        for id in ids {
            if let Some(dev) = self.graph.node_mut(id) {
                dev.free();
            }
        }
        tracing::info!(pipeline = self.id.0, "pipeline freed");
    }
}

/// Shared handle to a pipeline, owning its scheduling.
#[derive(Debug, Clone)]
pub struct PipelineHandle(Arc<Mutex<Pipeline>>);

impl PipelineHandle {
    pub fn new(pipeline: Pipeline) -> Self {
        Self(Arc::new(Mutex::new(pipeline)))
    }

    pub fn lock(&self) -> MutexGuard<'_, Pipeline> {
        self.0.lock()
    }

    /// Create the pipeline's LL task on `sched` with `cfg`. Replaces any earlier task.
    pub fn schedule_config(&self, sched: Arc<LlScheduler>, cfg: ScheduleConfig) -> Result<()> {
        if sched.core() != cfg.core {
            return Err(Error::Invalid("scheduler runs on another core"));
        }
        if cfg.period_us == 0 {
            return Err(Error::Invalid("zero pipeline period"));
        }
        let (id, old) = {
            let mut p = self.lock();
            if cfg.time_domain == TimeDomain::Dma {
                let sched_comp = p.sched_comp;
                let ep = p
                    .graph
                    .node_mut(sched_comp)
                    .and_then(CompDev::endpoint)
                    .ok_or(Error::Invalid("dma time domain needs an endpoint scheduling component"))?;
                ep.set_scheduling_source(true)?;
            }
            p.config = cfg;
            (p.id, p.binding.take())
        };
        if let Some(old) = old {
            old.sched.schedule_task_free(&old.task)?;
        }
        let weak = Arc::downgrade(&self.0);
        let task = Task::new(
            format!("pipe-{}", id.0),
            SchedulerKind::Ll,
            cfg.core,
            cfg.priority,
            move || match weak.upgrade() {
                Some(p) => p.lock().run_task(),
                None => TaskRun::Complete,
            },
        );
        sched.schedule_task_init(&task, ScheduleFlags::SYNC)?;
        tracing::debug!(pipeline = id.0, core = cfg.core, period_us = cfg.period_us, domain = ?cfg.time_domain, "pipeline scheduling configured");
        let mut p = self.lock();
        p.binding = Some(SchedBinding { sched, task });
        assert_invariant(PIPELINE_SCHEDULED, p.binding.is_some(), "pipeline task created", Some("schedule_config"));
        Ok(())
    }

    fn binding(&self) -> Option<(SchedBinding, u64)> {
        let p = self.lock();
        p.binding.clone().map(|b| (b, p.config.period_us))
    }

    /// Trigger now. START/RELEASE queue the pipeline task; STOP/PAUSE/RESET/XRUN cancel it.
    pub fn trigger(&self, cmd: TriggerCmd) -> Result<()> {
        self.lock().trigger(cmd)?;
        let Some((b, period)) = self.binding() else {
            return Ok(());
        };
        match cmd {
            TriggerCmd::Start | TriggerCmd::Release => {
                b.sched.schedule_task(&b.task, 0, period, ScheduleFlags::SYNC)
            }
            TriggerCmd::Stop | TriggerCmd::Pause | TriggerCmd::Reset | TriggerCmd::Xrun => {
                b.sched.schedule_task_cancel(&b.task)
            }
            _ => Ok(()),
        }
    }

    /// Hand `cmd` to the pipeline task, to run `delay_ticks` ticks after the next one.
    pub fn trigger_deferred(&self, cmd: TriggerCmd, delay_ticks: u32) -> Result<()> {
        let (b, period) = self
            .binding()
            .ok_or(Error::Invalid("pipeline has no task"))?;
        self.lock().set_pending_trigger(cmd, delay_ticks)?;
        b.sched.schedule_task(&b.task, 0, period, ScheduleFlags::SYNC)
    }

    /// Release the task and every component.
    pub fn free(&self) -> Result<()> {
        let binding = self.lock().binding.take();
        if let Some(b) = binding {
            b.sched.schedule_task_free(&b.task)?;
        }
        self.lock().free();
        Ok(())
    }
}
