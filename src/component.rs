//! Component devices: the state machine, the driver contract and buffer pins.
//!
//! A [`CompDev`] pairs the generic device context ([`DevCtx`]) with a driver. Pipelines
//! only ever talk to devices; drivers see the context they are attached to.

use crate::buffer::{CompBuffer, CompId, StreamParams};
use crate::control::PipelineId;
use crate::error::{Error, Result};
use std::sync::Arc;

/// Most buffers one device can bind on either side.
pub const MAX_PINS: usize = 8;

/// Component lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompState {
    /// Created, not yet configured.
    Init,
    /// Configured, stream not prepared.
    Ready,
    /// Suspended by power management.
    Suspend,
    /// Prepared for streaming.
    Prepare,
    /// Paused mid-stream.
    Paused,
    /// Streaming.
    Active,
    /// Between PRE_START/PRE_RELEASE and START/RELEASE.
    PreActive,
}

/// Trigger commands propagated through a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerCmd {
    Stop,
    Start,
    Pause,
    Release,
    Reset,
    Prepare,
    Xrun,
    PreStart,
    PreRelease,
}

impl TriggerCmd {
    /// State a device ends up in after `self`.
    pub fn requested_state(self) -> CompState {
        match self {
            TriggerCmd::Start | TriggerCmd::Release => CompState::Active,
            TriggerCmd::Prepare | TriggerCmd::Stop => CompState::Prepare,
            TriggerCmd::Pause => CompState::Paused,
            TriggerCmd::Xrun | TriggerCmd::Reset => CompState::Ready,
            TriggerCmd::PreStart | TriggerCmd::PreRelease => CompState::PreActive,
        }
    }

    /// Whether the command is applied to sinks before their producers.
    pub fn is_downstream_first(self) -> bool {
        matches!(
            self,
            TriggerCmd::Start
                | TriggerCmd::Release
                | TriggerCmd::PreStart
                | TriggerCmd::PreRelease
                | TriggerCmd::Prepare
        )
    }
}

/// Outcome of a successful [`comp_set_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChange {
    Changed,
    AlreadySet,
}

/// Apply `cmd` to `state`.
///
/// Illegal transitions are EINVAL and leave `state` untouched. Reaching the state the
/// device is already in is reported as [`StateChange::AlreadySet`].
pub fn comp_set_state(state: &mut CompState, cmd: TriggerCmd) -> Result<StateChange> {
    let requested = cmd.requested_state();
    if *state == requested {
        return Ok(StateChange::AlreadySet);
    }
    let legal = match cmd {
        TriggerCmd::Start | TriggerCmd::Release => *state == CompState::PreActive,
        TriggerCmd::Stop => matches!(*state, CompState::Active | CompState::Paused),
        TriggerCmd::Pause => *state == CompState::Active,
        TriggerCmd::Prepare => *state == CompState::Ready,
        TriggerCmd::PreStart => *state == CompState::Prepare,
        TriggerCmd::PreRelease => *state == CompState::Paused,
        TriggerCmd::Reset => {
            if *state == CompState::Active {
                tracing::warn!(?state, "reset while active");
            }
            true
        }
        TriggerCmd::Xrun => true,
    };
    if !legal {
        tracing::error!(?state, ?cmd, "illegal state transition");
        return Err(Error::Invalid("illegal component state transition"));
    }
    *state = requested;
    Ok(StateChange::Changed)
}

/// Whether a walk continues past a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStatus {
    Continue,
    /// Stop walking this branch. Not an error.
    Stop,
}

/// Side of a device a buffer is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindDir {
    /// The device reads from the buffer.
    Source,
    /// The device writes to the buffer.
    Sink,
}

/// Generic device context handed to drivers.
#[derive(Debug)]
pub struct DevCtx {
    pub id: CompId,
    pub pipeline: PipelineId,
    pub core: usize,
    pub state: CompState,
    /// Period of the owning pipeline in microseconds.
    pub period_us: u64,
    pub params: StreamParams,
    source_pins: [Option<Arc<CompBuffer>>; MAX_PINS],
    sink_pins: [Option<Arc<CompBuffer>>; MAX_PINS],
    sources: Vec<Arc<CompBuffer>>,
    sinks: Vec<Arc<CompBuffer>>,
}

impl DevCtx {
    /// Context for a fresh device in READY state.
    pub fn new(id: CompId, pipeline: PipelineId, core: usize, period_us: u64) -> Self {
        Self {
            id,
            pipeline,
            core,
            state: CompState::Ready,
            period_us,
            params: StreamParams::default(),
            source_pins: Default::default(),
            sink_pins: Default::default(),
            sources: Vec::with_capacity(MAX_PINS),
            sinks: Vec::with_capacity(MAX_PINS),
        }
    }

    /// Bound source buffers, in pin order.
    pub fn sources(&self) -> &[Arc<CompBuffer>] {
        &self.sources
    }

    /// Bound sink buffers, in pin order.
    pub fn sinks(&self) -> &[Arc<CompBuffer>] {
        &self.sinks
    }

    /// Buffer bound at `pin`, if any.
    pub fn pin(&self, dir: BindDir, pin: usize) -> Option<&Arc<CompBuffer>> {
        self.pins(dir).get(pin).and_then(|p| p.as_ref())
    }

    fn pins(&self, dir: BindDir) -> &[Option<Arc<CompBuffer>>; MAX_PINS] {
        match dir {
            BindDir::Source => &self.source_pins,
            BindDir::Sink => &self.sink_pins,
        }
    }

    fn rebuild(&mut self) {
        self.sources.clear();
        self.sources.extend(self.source_pins.iter().flatten().cloned());
        self.sinks.clear();
        self.sinks.extend(self.sink_pins.iter().flatten().cloned());
    }

    /// Attach `buf` at `pin`. EINVAL past [`MAX_PINS`], EEXIST for an occupied pin.
    pub fn bind(&mut self, dir: BindDir, pin: usize, buf: Arc<CompBuffer>) -> Result<()> {
        if pin >= MAX_PINS {
            return Err(Error::Invalid("pin out of range"));
        }
        let id = self.id;
        let slot = match dir {
            BindDir::Source => &mut self.source_pins[pin],
            BindDir::Sink => &mut self.sink_pins[pin],
        };
        if slot.is_some() {
            return Err(Error::Exists);
        }
        match dir {
            BindDir::Source => buf.connect_consumer(id)?,
            BindDir::Sink => buf.connect_producer(id)?,
        }
        tracing::debug!(comp = id.0, buffer = buf.id().0, ?dir, pin, "buffer bound");
        *slot = Some(buf);
        self.rebuild();
        Ok(())
    }

    /// Detach the buffer at `pin`. EINVAL for an empty or out-of-range pin.
    pub fn unbind(&mut self, dir: BindDir, pin: usize) -> Result<Arc<CompBuffer>> {
        let id = self.id;
        let slot = match dir {
            BindDir::Source => self.source_pins.get_mut(pin),
            BindDir::Sink => self.sink_pins.get_mut(pin),
        };
        let buf = slot
            .and_then(Option::take)
            .ok_or(Error::Invalid("no buffer bound at pin"))?;
        buf.disconnect(id);
        tracing::debug!(comp = id.0, buffer = buf.id().0, ?dir, pin, "buffer unbound");
        self.rebuild();
        Ok(buf)
    }
}

/// Stream position reported by an endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Position {
    /// Bytes moved on the host side since start.
    pub host_bytes: u64,
    /// Bytes moved on the pipeline side since start.
    pub local_bytes: u64,
    /// Clock ticks when sampled.
    pub wallclock: u64,
}

/// Timestamp pair captured by an endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timestamp {
    pub sample: u64,
    pub wallclock: u64,
}

/// Extra operations of endpoint devices (gateways).
pub trait EndpointOps {
    /// Bytes moved so far on stream `stream_no`, input or output side.
    fn get_total_data_processed(&self, stream_no: u32, input: bool) -> u64;

    fn position(&self, ctx: &DevCtx) -> Result<Position>;

    fn dai_ts_config(&mut self) -> Result<()> {
        Err(Error::NotSupported)
    }

    fn dai_ts_start(&mut self, _now: u64) -> Result<()> {
        Err(Error::NotSupported)
    }

    fn dai_ts_stop(&mut self) -> Result<()> {
        Err(Error::NotSupported)
    }

    fn dai_ts_get(&self, _now: u64) -> Result<Timestamp> {
        Err(Error::NotSupported)
    }

    /// Parameters the far side of the endpoint runs at.
    fn dai_get_hw_params(&self, ctx: &DevCtx) -> Result<StreamParams> {
        Ok(ctx.params)
    }

    /// Bytes missing or dropped in the last xrun.
    fn xrun_bytes(&self) -> usize {
        0
    }

    /// Let the endpoint's DMA pace the pipeline.
    fn set_scheduling_source(&mut self, _enable: bool) -> Result<()> {
        Err(Error::NotSupported)
    }
}

/// Driver operations of a component.
///
/// State bookkeeping is done by [`CompDev`]; drivers only react to it.
pub trait CompDriver: Send {
    /// Driver name for logs.
    fn name(&self) -> &'static str;

    fn params(&mut self, _ctx: &mut DevCtx, _params: &StreamParams) -> Result<()> {
        Ok(())
    }

    fn prepare(&mut self, _ctx: &mut DevCtx) -> Result<()> {
        Ok(())
    }

    /// Move one period of data. Called once per tick while ACTIVE.
    fn copy(&mut self, ctx: &mut DevCtx) -> Result<PathStatus>;

    /// Driver specific command with an in/out payload. Returns the reply length.
    fn cmd(&mut self, _ctx: &mut DevCtx, _cmd: u32, _data: &mut [u8]) -> Result<usize> {
        Err(Error::NotSupported)
    }

    /// React to a trigger after the state has changed.
    fn trigger(&mut self, _ctx: &mut DevCtx, _cmd: TriggerCmd) -> Result<PathStatus> {
        Ok(PathStatus::Continue)
    }

    fn reset(&mut self, _ctx: &mut DevCtx) -> Result<()> {
        Ok(())
    }

    fn free(&mut self, _ctx: &mut DevCtx) {}

    /// Receive one configuration fragment.
    fn set_large_config(
        &mut self,
        _ctx: &mut DevCtx,
        _config_id: u32,
        _first: bool,
        _last: bool,
        _data_offset_size: u32,
        _data: &[u8],
    ) -> Result<()> {
        Err(Error::NotSupported)
    }

    /// Produce one configuration fragment into `out`. Returns bytes written.
    fn get_large_config(
        &mut self,
        _ctx: &mut DevCtx,
        _config_id: u32,
        _first: bool,
        _last: bool,
        _data_offset_size: &mut u32,
        _out: &mut [u8],
    ) -> Result<usize> {
        Err(Error::NotSupported)
    }

    /// Notified after a buffer was bound.
    fn bind(&mut self, _ctx: &mut DevCtx, _dir: BindDir, _pin: usize) -> Result<()> {
        Ok(())
    }

    /// Notified before a buffer is unbound.
    fn unbind(&mut self, _ctx: &mut DevCtx, _dir: BindDir, _pin: usize) -> Result<()> {
        Ok(())
    }

    fn endpoint(&mut self) -> Option<&mut dyn EndpointOps> {
        None
    }

    /// Whether the device runs in the DP domain and is skipped by the LL copy walk.
    fn is_deferred(&self) -> bool {
        false
    }
}

/// A component device.
pub struct CompDev {
    ctx: DevCtx,
    driver: Box<dyn CompDriver>,
}

impl std::fmt::Debug for CompDev {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompDev")
            .field("driver", &self.driver.name())
            .field("ctx", &self.ctx)
            .finish()
    }
}

impl CompDev {
    pub fn new(ctx: DevCtx, driver: Box<dyn CompDriver>) -> Self {
        Self { ctx, driver }
    }

    pub fn id(&self) -> CompId {
        self.ctx.id
    }

    pub fn state(&self) -> CompState {
        self.ctx.state
    }

    pub fn name(&self) -> &'static str {
        self.driver.name()
    }

    pub fn ctx(&self) -> &DevCtx {
        &self.ctx
    }

    pub fn ctx_mut(&mut self) -> &mut DevCtx {
        &mut self.ctx
    }

    pub fn is_deferred(&self) -> bool {
        self.driver.is_deferred()
    }

    /// Negotiate stream parameters. Only legal before PREPARE.
    pub fn params(&mut self, params: &StreamParams) -> Result<()> {
        if !matches!(self.ctx.state, CompState::Ready | CompState::Init) {
            return Err(Error::Invalid("params after prepare"));
        }
        self.driver.params(&mut self.ctx, params)?;
        self.ctx.params = *params;
        Ok(())
    }

    /// READY → PREPARE. An already prepared device stops the walk.
    pub fn prepare(&mut self) -> Result<PathStatus> {
        let prev = self.ctx.state;
        if comp_set_state(&mut self.ctx.state, TriggerCmd::Prepare)? == StateChange::AlreadySet {
            return Ok(PathStatus::Stop);
        }
        if let Err(e) = self.driver.prepare(&mut self.ctx) {
            self.ctx.state = prev;
            return Err(e);
        }
        Ok(PathStatus::Continue)
    }

    #[inline]
    pub fn copy(&mut self) -> Result<PathStatus> {
        self.driver.copy(&mut self.ctx)
    }

    /// Apply `cmd`. On driver failure the previous state is restored.
    pub fn trigger(&mut self, cmd: TriggerCmd) -> Result<PathStatus> {
        let prev = self.ctx.state;
        if comp_set_state(&mut self.ctx.state, cmd)? == StateChange::AlreadySet {
            return Ok(PathStatus::Stop);
        }
        match self.driver.trigger(&mut self.ctx, cmd) {
            Ok(status) => Ok(status),
            Err(e) => {
                self.ctx.state = prev;
                Err(e)
            }
        }
    }

    /// Back to READY.
    pub fn reset(&mut self) -> Result<()> {
        self.driver.reset(&mut self.ctx)?;
        self.ctx.state = CompState::Ready;
        Ok(())
    }

    pub fn cmd(&mut self, cmd: u32, data: &mut [u8]) -> Result<usize> {
        self.driver.cmd(&mut self.ctx, cmd, data)
    }

    pub fn set_large_config(
        &mut self,
        config_id: u32,
        first: bool,
        last: bool,
        data_offset_size: u32,
        data: &[u8],
    ) -> Result<()> {
        self.driver
            .set_large_config(&mut self.ctx, config_id, first, last, data_offset_size, data)
    }

    pub fn get_large_config(
        &mut self,
        config_id: u32,
        first: bool,
        last: bool,
        data_offset_size: &mut u32,
        out: &mut [u8],
    ) -> Result<usize> {
        self.driver
            .get_large_config(&mut self.ctx, config_id, first, last, data_offset_size, out)
    }

    /// Bind `buf` and tell the driver. The pin is released again if the driver refuses.
    pub fn bind(&mut self, dir: BindDir, pin: usize, buf: Arc<CompBuffer>) -> Result<()> {
        self.ctx.bind(dir, pin, buf)?;
        if let Err(e) = self.driver.bind(&mut self.ctx, dir, pin) {
            self.ctx.unbind(dir, pin)?;
            return Err(e);
        }
        Ok(())
    }

    pub fn unbind(&mut self, dir: BindDir, pin: usize) -> Result<Arc<CompBuffer>> {
        if self.ctx.pin(dir, pin).is_none() {
            return Err(Error::Invalid("no buffer bound at pin"));
        }
        self.driver.unbind(&mut self.ctx, dir, pin)?;
        self.ctx.unbind(dir, pin)
    }

    pub fn endpoint(&mut self) -> Option<&mut dyn EndpointOps> {
        self.driver.endpoint()
    }

    /// Endpoint position, if the device is an endpoint.
    pub fn position(&mut self) -> Option<Result<Position>> {
        let ctx = &self.ctx;
        self.driver.endpoint().map(|ep| ep.position(ctx))
    }

    /// Release driver resources and unbind every buffer.
    pub fn free(&mut self) {
        self.driver.free(&mut self.ctx);
        for pin in 0..MAX_PINS {
            let _ = self.ctx.unbind(BindDir::Source, pin);
            let _ = self.ctx.unbind(BindDir::Sink, pin);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferId;
    use crate::heap::Heap;

    #[test]
    fn start_sequence() {
        let mut s = CompState::Ready;
        assert_eq!(comp_set_state(&mut s, TriggerCmd::Prepare), Ok(StateChange::Changed));
        assert_eq!(comp_set_state(&mut s, TriggerCmd::PreStart), Ok(StateChange::Changed));
        assert_eq!(s, CompState::PreActive);
        assert_eq!(comp_set_state(&mut s, TriggerCmd::Start), Ok(StateChange::Changed));
        assert_eq!(s, CompState::Active);
        assert_eq!(comp_set_state(&mut s, TriggerCmd::Release), Ok(StateChange::AlreadySet));
    }

    #[test]
    fn illegal_transitions_leave_state() {
        let mut s = CompState::Ready;
        assert!(comp_set_state(&mut s, TriggerCmd::Start).is_err());
        assert!(comp_set_state(&mut s, TriggerCmd::Pause).is_err());
        assert_eq!(s, CompState::Ready);
        let mut s = CompState::Prepare;
        assert!(comp_set_state(&mut s, TriggerCmd::PreRelease).is_err());
        assert_eq!(s, CompState::Prepare);
    }

    #[test]
    fn pause_release_stop() {
        let mut s = CompState::Active;
        comp_set_state(&mut s, TriggerCmd::Pause).unwrap();
        comp_set_state(&mut s, TriggerCmd::PreRelease).unwrap();
        comp_set_state(&mut s, TriggerCmd::Release).unwrap();
        assert_eq!(s, CompState::Active);
        comp_set_state(&mut s, TriggerCmd::Stop).unwrap();
        assert_eq!(s, CompState::Prepare);
        comp_set_state(&mut s, TriggerCmd::Reset).unwrap();
        assert_eq!(s, CompState::Ready);
    }

    #[test]
    fn propagation_direction() {
        assert!(TriggerCmd::Start.is_downstream_first());
        assert!(TriggerCmd::Prepare.is_downstream_first());
        assert!(!TriggerCmd::Stop.is_downstream_first());
        assert!(!TriggerCmd::Reset.is_downstream_first());
    }

    #[test]
    fn pins() {
        let heap = Heap::unbounded();
        let mut ctx = DevCtx::new(CompId(1), PipelineId(0), 0, 1000);
        let a = CompBuffer::new(&heap, BufferId(1), 64, StreamParams::default()).unwrap();
        let b = CompBuffer::new(&heap, BufferId(2), 64, StreamParams::default()).unwrap();
        ctx.bind(BindDir::Source, 2, a.clone()).unwrap();
        assert_eq!(ctx.bind(BindDir::Source, 2, b.clone()), Err(Error::Exists));
        assert!(ctx.bind(BindDir::Sink, MAX_PINS, b.clone()).is_err());
        ctx.bind(BindDir::Sink, 0, b.clone()).unwrap();
        assert_eq!(a.consumer(), Some(CompId(1)));
        assert_eq!(b.producer(), Some(CompId(1)));
        assert_eq!(ctx.sources().len(), 1);
        assert!(ctx.unbind(BindDir::Source, 0).is_err());
        ctx.unbind(BindDir::Source, 2).unwrap();
        assert!(ctx.sources().is_empty());
        assert_eq!(a.consumer(), None);
    }
}
