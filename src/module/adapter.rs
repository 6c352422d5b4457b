//! Module adapter: runs any [`ModuleInterface`] as a pipeline component.
//!
//! Source/sink modules work directly on the bound buffers. Stream and raw modules get
//! linear staging: the adapter copies up to `ibs` bytes per source into an input block,
//! lets the module fill an output block, and drains that through a local ring into the
//! real sink. When `ibs` is not a whole number of periods the local ring has to fill up
//! before real output flows, so the sink is fed silence until then (deep buffering).
//!
//! DP-domain modules are not copied by the pipeline; the adapter creates a DP task at
//! prepare time and the task thread calls `process` whenever the module is ready.

use super::config::{ConfigAssembler, ConfigReader, FragmentPosition};
use super::library::LibraryManager;
use super::{
    default_ready, InputStreamBuffer, ModuleConfig, ModuleInterface, ModuleProcessingData,
    ModuleState, OutputStreamBuffer, ProcDomain, ProcType, ProcessingMode, Sinks, Sources,
    MODULE_MAX_SOURCES,
};
use crate::buffer::{copy_limits, CompBuffer, StreamParams};
use crate::component::{BindDir, CompDriver, DevCtx, PathStatus, TriggerCmd};
use crate::error::{Error, Result};
use crate::heap::{Heap, Zone, ZoneAlloc, ZoneVec};
use crate::ring::RingBuf;
use crate::schedule::{DpModule, DpScheduler, TaskScheduler};
use crate::task::{ScheduleFlags, SchedulerKind, Task, TaskPriority, TaskRun};
use parking_lot::Mutex;
use std::sync::Arc;

/// Module instance plus everything the adapter keeps about it.
pub struct ProcessingModule {
    module: Box<dyn ModuleInterface>,
    state: ModuleState,
    proc_type: ProcType,
    mode: ProcessingMode,
    cfg: ModuleConfig,
    mpd: ModuleProcessingData,
    assembler: ConfigAssembler,
    reader: ConfigReader,
}

impl ProcessingModule {
    fn is_ready(&self, sources: &Sources<'_>, sinks: &Sinks<'_>) -> bool {
        self.module
            .is_ready_to_process(sources, sinks)
            .unwrap_or_else(|| default_ready(sources, sinks, self.cfg.ibs, self.cfg.obs))
    }

    fn begin(&mut self) -> Result<()> {
        if self.state != ModuleState::Idle {
            tracing::error!(state = ?self.state, "module not idle");
            return Err(Error::Invalid("module not prepared"));
        }
        self.state = ModuleState::Processing;
        Ok(())
    }

    /// ENOSPC and ENODATA mean nothing was done this time.
    fn finish(&mut self, res: Result<()>) -> Result<()> {
        self.state = ModuleState::Idle;
        match res {
            Err(Error::NoSpace | Error::NoData) => Ok(()),
            other => other,
        }
    }

    fn process_source_sink(&mut self, sources: &Sources<'_>, sinks: &Sinks<'_>) -> Result<()> {
        self.begin()?;
        let res = self.module.process(sources, sinks);
        self.finish(res)
    }

    fn prepare(&mut self, sources: &Sources<'_>, sinks: &Sinks<'_>) -> Result<()> {
        match self.state {
            ModuleState::Idle => return Ok(()),
            ModuleState::Disabled => return Err(Error::Invalid("module not initialized")),
            _ => {}
        }
        self.module.prepare(sources, sinks)?;
        self.state = ModuleState::Idle;
        Ok(())
    }
}

/// Shared view of an adapter's module, usable after the adapter was boxed into a device.
#[derive(Clone)]
pub struct ModuleHandle(Arc<Mutex<ProcessingModule>>);

impl std::fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pm = self.0.lock();
        f.debug_struct("ModuleHandle")
            .field("state", &pm.state)
            .field("proc_type", &pm.proc_type)
            .field("mode", &pm.mode)
            .finish()
    }
}

impl ModuleHandle {
    pub fn state(&self) -> ModuleState {
        self.0.lock().state
    }

    pub fn proc_type(&self) -> ProcType {
        self.0.lock().proc_type
    }

    pub fn processing_mode(&self) -> ProcessingMode {
        self.0.lock().mode
    }

    /// Switch between normal processing and bypass. The module may refuse.
    pub fn set_processing_mode(&self, mode: ProcessingMode) -> Result<()> {
        let mut pm = self.0.lock();
        pm.module.set_processing_mode(mode)?;
        tracing::debug!(?mode, "processing mode changed");
        pm.mode = mode;
        Ok(())
    }

    pub fn processing_data(&self) -> ModuleProcessingData {
        self.0.lock().mpd
    }
}

struct LocalRing {
    ring: RingBuf,
    _charge: ZoneAlloc,
}

/// Staging for stream and raw modules.
struct Staging {
    inputs: Vec<ZoneVec>,
    outputs: Vec<ZoneVec>,
    locals: Vec<LocalRing>,
    staged: [usize; MODULE_MAX_SOURCES],
}

impl Staging {
    /// Allocate every block. A failure releases what was taken, newest first.
    fn alloc(
        heap: &Heap,
        n_in: usize,
        n_out: usize,
        in_bytes: usize,
        out_bytes: usize,
        local_bytes: usize,
    ) -> Result<Self> {
        let mut st = Staging {
            inputs: Vec::with_capacity(n_in),
            outputs: Vec::with_capacity(n_out),
            locals: Vec::with_capacity(n_out),
            staged: [0; MODULE_MAX_SOURCES],
        };
        for _ in 0..n_in {
            st.inputs.push(heap.alloc_bytes(Zone::Buffer, in_bytes)?);
        }
        for _ in 0..n_out {
            st.outputs.push(heap.alloc_bytes(Zone::Buffer, out_bytes)?);
        }
        for _ in 0..n_out {
            let charge = heap.alloc(Zone::Buffer, local_bytes)?;
            st.locals.push(LocalRing {
                ring: RingBuf::new(local_bytes),
                _charge: charge,
            });
        }
        Ok(st)
    }
}

impl Drop for Staging {
    fn drop(&mut self) {
        while self.locals.pop().is_some() {}
        while self.outputs.pop().is_some() {}
        while self.inputs.pop().is_some() {}
    }
}

/// Periods of `unit` needed to hold `block`, with one period of slack.
fn buffer_periods(block: usize, unit: usize) -> usize {
    let (big, small) = if block > unit { (block, unit) } else { (unit, block) };
    if big % small != 0 {
        big / small + 2
    } else {
        big / small + 1
    }
}

struct DpHooks {
    pm: Arc<Mutex<ProcessingModule>>,
    sources: Vec<Arc<CompBuffer>>,
    sinks: Vec<Arc<CompBuffer>>,
}

impl DpModule for DpHooks {
    fn is_ready(&self) -> bool {
        self.pm
            .lock()
            .is_ready(&Sources::new(&self.sources), &Sinks::new(&self.sinks))
    }

    fn deadline_us(&self) -> Option<u64> {
        self.pm.lock().module.deadline_us()
    }

    fn lpt_us(&self) -> u64 {
        self.pm.lock().module.lpt_us()
    }
}

fn dp_process(hooks: &DpHooks) -> TaskRun {
    let sources = Sources::new(&hooks.sources);
    let sinks = Sinks::new(&hooks.sinks);
    let mut pm = hooks.pm.lock();
    if !pm.is_ready(&sources, &sinks) {
        return TaskRun::Reschedule(0);
    }
    match pm.process_source_sink(&sources, &sinks) {
        Ok(()) => TaskRun::Reschedule(0),
        Err(e) => {
            tracing::error!(errno = e.errno(), "dp module processing failed");
            TaskRun::Failed(e)
        }
    }
}

/// The component driver wrapping a processing module.
pub struct ModuleAdapter {
    name: &'static str,
    heap: Arc<Heap>,
    pm: Arc<Mutex<ProcessingModule>>,
    staging: Option<Staging>,
    period_bytes: usize,
    deep_buff_bytes: usize,
    dp_sched: Option<Arc<DpScheduler>>,
    dp_task: Option<Arc<Task>>,
    _charge: ZoneAlloc,
}

impl std::fmt::Debug for ModuleAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleAdapter")
            .field("name", &self.name)
            .field("period_bytes", &self.period_bytes)
            .field("deep_buff_bytes", &self.deep_buff_bytes)
            .finish()
    }
}

impl ModuleAdapter {
    /// Wrap `module` and run its `init`.
    pub fn create(
        name: &'static str,
        heap: Arc<Heap>,
        cfg: ModuleConfig,
        mut module: Box<dyn ModuleInterface>,
    ) -> Result<Self> {
        let charge = heap.alloc_for::<ProcessingModule>(Zone::Runtime)?;
        let proc_type = module.proc_type();
        module.init(&cfg).inspect_err(|e| {
            tracing::error!(name, errno = e.errno(), "module init failed");
        })?;
        let assembler = ConfigAssembler::new(heap.clone(), cfg.max_config_blob);
        tracing::debug!(name, ?proc_type, domain = ?cfg.domain, "module adapter created");
        Ok(Self {
            name,
            heap,
            pm: Arc::new(Mutex::new(ProcessingModule {
                module,
                state: ModuleState::Initialized,
                proc_type,
                mode: ProcessingMode::Normal,
                cfg,
                mpd: ModuleProcessingData::default(),
                assembler,
                reader: ConfigReader::default(),
            })),
            staging: None,
            period_bytes: 0,
            deep_buff_bytes: 0,
            dp_sched: None,
            dp_task: None,
            _charge: charge,
        })
    }

    /// Instantiate registered image `module_id` and wrap it.
    pub fn from_library(
        name: &'static str,
        heap: Arc<Heap>,
        cfg: ModuleConfig,
        lib: &LibraryManager,
        module_id: u32,
    ) -> Result<Self> {
        let module = lib.load(module_id)?;
        Self::create(name, heap, cfg, Box::new(module))
    }

    /// Scheduler for a DP-domain module.
    pub fn with_dp_scheduler(mut self, sched: Arc<DpScheduler>) -> Self {
        self.dp_sched = Some(sched);
        self
    }

    pub fn handle(&self) -> ModuleHandle {
        ModuleHandle(self.pm.clone())
    }

    /// Bytes still to gather before processed output reaches the sink.
    pub fn deep_buff_bytes(&self) -> usize {
        self.deep_buff_bytes
    }

    /// DP task created at prepare, if any.
    pub fn dp_task(&self) -> Option<&Arc<Task>> {
        self.dp_task.as_ref()
    }

    fn is_dp(&self) -> bool {
        self.pm.lock().cfg.domain == ProcDomain::Dp
    }

    fn prepare_staging(&mut self, ctx: &DevCtx, in_size: usize, out_size: usize) -> Result<()> {
        let period = self.period_bytes;
        let in_periods = buffer_periods(in_size, period);
        self.deep_buff_bytes = if in_size != period {
            period.min(in_size) * in_periods
        } else {
            0
        };
        let out_periods = buffer_periods(out_size, period);
        let local_bytes = period.max(out_size) * out_periods;
        let in_bytes = self.deep_buff_bytes.max(period).max(in_size);
        self.staging = Some(Staging::alloc(
            &self.heap,
            ctx.sources().len(),
            ctx.sinks().len(),
            in_bytes,
            out_size,
            local_bytes,
        )?);
        tracing::debug!(
            comp = ctx.id.0,
            deep_buff_bytes = self.deep_buff_bytes,
            local_bytes,
            "module staging allocated"
        );
        Ok(())
    }

    fn prepare_dp(&mut self, ctx: &DevCtx) -> Result<()> {
        if self.dp_task.is_some() {
            return Ok(());
        }
        let sched = self
            .dp_sched
            .clone()
            .ok_or(Error::Invalid("dp module without a dp scheduler"))?;
        let hooks = Arc::new(DpHooks {
            pm: self.pm.clone(),
            sources: ctx.sources().to_vec(),
            sinks: ctx.sinks().to_vec(),
        });
        let run_hooks = hooks.clone();
        let task = Task::new(
            format!("{}-{}", self.name, ctx.id.0),
            SchedulerKind::Dp,
            ctx.core,
            TaskPriority::LOW,
            move || dp_process(&run_hooks),
        );
        sched.schedule_task_init(&task, hooks)?;
        self.dp_task = Some(task);
        Ok(())
    }

    fn release_dp(&mut self) {
        if let (Some(sched), Some(task)) = (self.dp_sched.as_ref(), self.dp_task.take()) {
            if let Err(e) = sched.schedule_task_free(&task) {
                tracing::warn!(errno = e.errno(), "dp task free failed");
            }
        }
    }

    fn bypass(&self, ctx: &DevCtx) -> Result<()> {
        for (src, snk) in ctx.sources().iter().zip(ctx.sinks()) {
            let mut s = src.stream().acquire();
            let mut d = snk.stream().acquire();
            if s.params() != d.params() {
                tracing::trace!(comp = ctx.id.0, "bypass skipped, formats differ");
                continue;
            }
            let lim = copy_limits(&s, &d);
            s.copy_to(&mut d, lim.source_bytes)?;
        }
        Ok(())
    }

    fn stream_copy(&mut self, pm: &mut ProcessingModule, ctx: &DevCtx) -> Result<()> {
        let period_bytes = self.period_bytes;
        let st = self
            .staging
            .as_mut()
            .ok_or(Error::Invalid("module not prepared"))?;
        let sources = ctx.sources();
        let sinks = ctx.sinks();
        let n_in = sources.len().min(st.inputs.len());
        let n_out = sinks.len().min(st.outputs.len());

        let mut min_free_frames = usize::MAX;
        for (local, snk) in st.locals.iter().zip(sinks) {
            let fb = snk.stream().acquire().frame_bytes().max(1);
            min_free_frames = min_free_frames.min(local.ring.free() / fb);
        }

        let mut params = [StreamParams::default(); MODULE_MAX_SOURCES];
        let mut eos = [false; MODULE_MAX_SOURCES];
        for i in 0..n_in {
            let s = sources[i].stream().acquire();
            let fb = s.frame_bytes().max(1);
            let frames = min_free_frames.min(s.avail_frames());
            let bytes = (frames * fb).min(pm.mpd.in_buff_size);
            s.peek_into(&mut st.inputs[i][..bytes])?;
            st.staged[i] = bytes;
            params[i] = *s.params();
            eos[i] = s.end_of_stream();
        }

        let stream = pm.proc_type == ProcType::Stream;
        let mut consumed = [0usize; MODULE_MAX_SOURCES];
        let mut produced = [0usize; MODULE_MAX_SOURCES];
        pm.begin()?;
        let res = {
            let inputs = &st.inputs;
            let staged = &st.staged;
            let mut ins: [InputStreamBuffer<'_>; MODULE_MAX_SOURCES] = std::array::from_fn(|i| {
                let bytes = if i < n_in { staged[i] } else { 0 };
                let data: &[u8] = if i < n_in { &inputs[i][..bytes] } else { &[] };
                InputStreamBuffer {
                    data,
                    size: if stream {
                        bytes / params[i].frame_bytes().max(1)
                    } else {
                        bytes
                    },
                    consumed: 0,
                    end_of_stream: eos[i],
                    params: params[i],
                }
            });
            let mut out_blocks = st.outputs.iter_mut();
            let mut outs: [OutputStreamBuffer<'_>; MODULE_MAX_SOURCES] =
                std::array::from_fn(|_| OutputStreamBuffer {
                    data: out_blocks.next().map(|b| &mut b[..]).unwrap_or_default(),
                    size: 0,
                });
            let res = match pm.proc_type {
                ProcType::Stream => pm
                    .module
                    .process_audio_stream(&mut ins[..n_in], &mut outs[..n_out]),
                ProcType::Raw => pm
                    .module
                    .process_raw_data(&mut ins[..n_in], &mut outs[..n_out]),
                ProcType::SourceSink => Err(Error::NotSupported),
            };
            for (c, d) in consumed.iter_mut().zip(&ins[..n_in]) {
                *c = d.consumed;
            }
            for (p, d) in produced.iter_mut().zip(&outs[..n_out]) {
                *p = d.size;
            }
            res
        };
        pm.finish(res)?;

        for i in 0..n_in {
            if consumed[i] > st.staged[i] {
                return Err(Error::Invalid("module consumed more than staged"));
            }
        }
        for &p in &produced[..n_out] {
            if p > pm.mpd.out_buff_size {
                return Err(Error::Invalid("module produced more than its output block"));
            }
        }

        for i in 0..n_in {
            sources[i].stream().acquire().consume(consumed[i])?;
            pm.mpd.consumed += consumed[i] as u64;
            let staged = st.staged[i];
            st.inputs[i][..staged].fill(0);
            st.staged[i] = 0;
        }

        for i in 0..n_out {
            let local = &mut st.locals[i].ring;
            if produced[i] > 0 {
                local.write_from(&st.outputs[i][..produced[i]])?;
                pm.mpd.produced += produced[i] as u64;
            }
            let mut snk = sinks[i].stream().acquire();
            let fb = snk.frame_bytes().max(1);
            if self.deep_buff_bytes > 0 {
                if self.deep_buff_bytes >= local.avail() {
                    let n = period_bytes.min(snk.free());
                    snk.write_silence(n - n % fb)?;
                    continue;
                }
                tracing::debug!(comp = ctx.id.0, gathered = local.avail(), "deep buffering ended");
                self.deep_buff_bytes = 0;
            } else if produced[i] == 0 && local.avail() < period_bytes {
                continue;
            }
            let bytes = (local.avail() / fb).min(snk.free_frames()) * fb;
            if bytes > 0 {
                local.transfer_to(snk.ring_mut(), bytes)?;
            }
        }
        Ok(())
    }
}

impl CompDriver for ModuleAdapter {
    fn name(&self) -> &'static str {
        self.name
    }

    fn params(&mut self, _ctx: &mut DevCtx, params: &StreamParams) -> Result<()> {
        self.pm.lock().cfg.params = *params;
        Ok(())
    }

    fn prepare(&mut self, ctx: &mut DevCtx) -> Result<()> {
        let first = ctx.sinks().first().or(ctx.sources().first());
        let Some(buf) = first else {
            tracing::error!(comp = ctx.id.0, "no source and sink buffers connected");
            return Err(Error::Invalid("no buffers connected"));
        };
        self.period_bytes = buf.stream().acquire().params().period_bytes(ctx.period_us);
        let (proc_type, in_size, out_size, dp) = {
            let mut pm = self.pm.lock();
            pm.prepare(&Sources::new(ctx.sources()), &Sinks::new(ctx.sinks()))?;
            let in_size = if pm.cfg.ibs > 0 { pm.cfg.ibs } else { self.period_bytes };
            let out_size = if pm.cfg.obs > 0 { pm.cfg.obs } else { self.period_bytes };
            pm.mpd = ModuleProcessingData {
                in_buff_size: in_size,
                out_buff_size: out_size,
                produced: 0,
                consumed: 0,
            };
            (pm.proc_type, in_size, out_size, pm.cfg.domain == ProcDomain::Dp)
        };
        if self.period_bytes == 0 {
            return Err(Error::Invalid("zero period"));
        }
        self.deep_buff_bytes = 0;
        match (proc_type, dp) {
            (ProcType::SourceSink, true) => self.prepare_dp(ctx),
            (ProcType::SourceSink, false) => Ok(()),
            (_, true) => Err(Error::Invalid("dp modules must use source/sink processing")),
            (_, false) => self.prepare_staging(ctx, in_size, out_size),
        }
    }

    fn copy(&mut self, ctx: &mut DevCtx) -> Result<PathStatus> {
        let pm_arc = self.pm.clone();
        let mut pm = pm_arc.lock();
        if pm.cfg.domain == ProcDomain::Dp {
            return Ok(PathStatus::Continue);
        }
        let sources = Sources::new(ctx.sources());
        let sinks = Sinks::new(ctx.sinks());
        if !pm.is_ready(&sources, &sinks) {
            tracing::trace!(comp = ctx.id.0, "module not ready");
            return Ok(PathStatus::Continue);
        }
        if pm.mode == ProcessingMode::Bypass {
            self.bypass(ctx)?;
            return Ok(PathStatus::Continue);
        }
        let res = match pm.proc_type {
            ProcType::SourceSink => pm.process_source_sink(&sources, &sinks),
            ProcType::Stream | ProcType::Raw => self.stream_copy(&mut pm, ctx),
        };
        res.inspect_err(|e| {
            tracing::error!(comp = ctx.id.0, errno = e.errno(), "module processing failed");
        })?;
        Ok(PathStatus::Continue)
    }

    fn trigger(&mut self, ctx: &mut DevCtx, cmd: TriggerCmd) -> Result<PathStatus> {
        let (Some(sched), Some(task)) = (self.dp_sched.as_ref(), self.dp_task.as_ref()) else {
            return Ok(PathStatus::Continue);
        };
        match cmd {
            TriggerCmd::Start | TriggerCmd::Release => {
                sched.schedule_task(task, 0, ctx.period_us, ScheduleFlags::NONE)?
            }
            TriggerCmd::Stop | TriggerCmd::Pause | TriggerCmd::Xrun => {
                sched.schedule_task_cancel(task)?
            }
            _ => {}
        }
        Ok(PathStatus::Continue)
    }

    fn reset(&mut self, ctx: &mut DevCtx) -> Result<()> {
        self.release_dp();
        {
            let mut pm = self.pm.lock();
            if pm.state >= ModuleState::Idle {
                pm.module.reset()?;
                pm.state = ModuleState::Initialized;
            }
            pm.assembler.abort();
            pm.mpd = ModuleProcessingData::default();
        }
        self.staging = None;
        self.deep_buff_bytes = 0;
        tracing::debug!(comp = ctx.id.0, "module reset");
        Ok(())
    }

    fn free(&mut self, ctx: &mut DevCtx) {
        self.release_dp();
        self.staging = None;
        let mut pm = self.pm.lock();
        if let Err(e) = pm.module.free() {
            tracing::warn!(comp = ctx.id.0, errno = e.errno(), "module free failed");
        }
        pm.assembler.abort();
        pm.state = ModuleState::Disabled;
    }

    fn set_large_config(
        &mut self,
        ctx: &mut DevCtx,
        config_id: u32,
        first: bool,
        last: bool,
        data_offset_size: u32,
        data: &[u8],
    ) -> Result<()> {
        let pos = FragmentPosition::from_flags(first, last);
        let mut pm = self.pm.lock();
        let Some(blob) = pm
            .assembler
            .push(config_id, pos, data_offset_size as usize, data)?
        else {
            return Ok(());
        };
        tracing::debug!(comp = ctx.id.0, config_id, bytes = blob.len(), "config assembled");
        pm.module
            .set_configuration(config_id, FragmentPosition::Single, blob.len(), &blob, &mut [])
    }

    fn get_large_config(
        &mut self,
        _ctx: &mut DevCtx,
        config_id: u32,
        first: bool,
        _last: bool,
        data_offset_size: &mut u32,
        out: &mut [u8],
    ) -> Result<usize> {
        let mut pm = self.pm.lock();
        let ProcessingModule { module, reader, .. } = &mut *pm;
        reader.read(config_id, first, data_offset_size, out, |blob| {
            module.get_configuration(config_id, blob)
        })
    }

    fn bind(&mut self, ctx: &mut DevCtx, dir: BindDir, pin: usize) -> Result<()> {
        if self.staging.is_some() || self.dp_task.is_some() {
            tracing::warn!(comp = ctx.id.0, ?dir, pin, "bind on a prepared module");
            return Err(Error::Busy);
        }
        Ok(())
    }

    fn is_deferred(&self) -> bool {
        self.is_dp()
    }
}

impl Drop for ModuleAdapter {
    fn drop(&mut self) {
        self.release_dp();
    }
}
