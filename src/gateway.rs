//! Host gateway: the endpoint component between host memory and a pipeline.
//!
//! Playback gateways (`HMEM_TO_LMEM`) are pipeline sources and move one period per copy
//! from their DMA channel into the first sink buffer. Capture gateways (`LMEM_TO_HMEM`)
//! are pipeline sinks and drain one period from their source buffer into the channel.
//! A channel that cannot supply or absorb the period is an xrun and fails the copy with
//! EPIPE; the missing byte count is kept for the notification.

use crate::buffer::StreamParams;
use crate::clock::SysClock;
use crate::component::{CompDriver, DevCtx, EndpointOps, PathStatus, Position, Timestamp, TriggerCmd};
use crate::dma::{DmaChannel, DmaConfig, DmaController, DmaDir, HostPort};
use crate::error::{Error, Result};
use std::sync::Arc;

/// FIFO size of a gateway channel, in periods.
pub const GATEWAY_FIFO_PERIODS: usize = 4;

#[derive(Debug, Clone, Copy, Default)]
struct TsState {
    configured: bool,
    start: Option<u64>,
    base_bytes: u64,
}

/// Endpoint moving audio through one DMA channel.
#[derive(Debug)]
pub struct HostGateway {
    channel: Option<DmaChannel>,
    port: HostPort,
    direction: DmaDir,
    clock: Arc<SysClock>,
    period_bytes: usize,
    frame_bytes: usize,
    local_bytes: u64,
    xrun_bytes: usize,
    ts: TsState,
}

impl HostGateway {
    /// Take channel `index` of `dma` for a gateway moving data in `direction`.
    pub fn new(dma: &Arc<DmaController>, index: usize, direction: DmaDir, clock: Arc<SysClock>) -> Result<Self> {
        if direction != DmaDir::HMEM_TO_LMEM && direction != DmaDir::LMEM_TO_HMEM {
            return Err(Error::Invalid("gateway direction must be host playback or capture"));
        }
        let channel = dma.channel_get(index)?;
        let port = channel.host_port();
        Ok(Self {
            channel: Some(channel),
            port,
            direction,
            clock,
            period_bytes: 0,
            frame_bytes: 0,
            local_bytes: 0,
            xrun_bytes: 0,
            ts: TsState::default(),
        })
    }

    /// Host memory access, for feeding playback or collecting capture.
    pub fn host_port(&self) -> HostPort {
        self.port.clone()
    }

    pub fn is_playback(&self) -> bool {
        self.direction.is_inbound()
    }

    fn channel(&self) -> Result<&DmaChannel> {
        self.channel.as_ref().ok_or(Error::NoDevice)
    }

    fn xrun(&mut self, missing: usize) -> Result<PathStatus> {
        self.xrun_bytes = missing;
        tracing::warn!(missing, playback = self.is_playback(), "gateway xrun");
        Err(Error::Pipe)
    }

    fn copy_playback(&mut self, ctx: &mut DevCtx) -> Result<PathStatus> {
        let sink = ctx.sinks().first().ok_or(Error::Invalid("playback gateway has no sink"))?;
        let channel = self.channel.as_ref().ok_or(Error::NoDevice)?;
        let mut stream = sink.stream().acquire();
        let bytes = self.period_bytes.min(stream.free());
        let bytes = bytes - bytes % self.frame_bytes.max(1);
        if bytes == 0 {
            return Ok(PathStatus::Continue);
        }
        let (avail, _) = channel.get_data_size()?;
        if avail < bytes {
            drop(stream);
            return self.xrun(bytes - avail);
        }
        channel.copy(&mut stream, bytes)?;
        self.local_bytes += bytes as u64;
        tracing::trace!(bytes, "gateway playback copy");
        Ok(PathStatus::Continue)
    }

    fn copy_capture(&mut self, ctx: &mut DevCtx) -> Result<PathStatus> {
        let source = ctx.sources().first().ok_or(Error::Invalid("capture gateway has no source"))?;
        let channel = self.channel.as_ref().ok_or(Error::NoDevice)?;
        let mut stream = source.stream().acquire();
        let bytes = self.period_bytes.min(stream.avail());
        let bytes = bytes - bytes % self.frame_bytes.max(1);
        if bytes == 0 {
            return Ok(PathStatus::Continue);
        }
        let (_, free) = channel.get_data_size()?;
        if free < bytes {
            drop(stream);
            return self.xrun(bytes - free);
        }
        channel.copy(&mut stream, bytes)?;
        self.local_bytes += bytes as u64;
        tracing::trace!(bytes, "gateway capture copy");
        Ok(PathStatus::Continue)
    }
}

impl CompDriver for HostGateway {
    fn name(&self) -> &'static str {
        "host-gateway"
    }

    fn prepare(&mut self, ctx: &mut DevCtx) -> Result<()> {
        let period_bytes = ctx.params.period_bytes(ctx.period_us);
        if period_bytes == 0 {
            return Err(Error::Invalid("gateway period is empty"));
        }
        let frame_bytes = ctx.params.frame_bytes();
        self.channel()?.set_config(DmaConfig {
            direction: self.direction,
            fifo_bytes: period_bytes * GATEWAY_FIFO_PERIODS,
            period_bytes,
            copy_align: frame_bytes,
        })?;
        self.period_bytes = period_bytes;
        self.frame_bytes = frame_bytes;
        tracing::debug!(comp = ctx.id.0, period_bytes, playback = self.is_playback(), "gateway prepared");
        Ok(())
    }

    fn copy(&mut self, ctx: &mut DevCtx) -> Result<PathStatus> {
        if self.is_playback() {
            self.copy_playback(ctx)
        } else {
            self.copy_capture(ctx)
        }
    }

    fn trigger(&mut self, ctx: &mut DevCtx, cmd: TriggerCmd) -> Result<PathStatus> {
        let channel = self.channel()?;
        match cmd {
            TriggerCmd::Start => channel.start()?,
            TriggerCmd::Release => channel.release()?,
            TriggerCmd::Pause => channel.pause()?,
            TriggerCmd::Stop | TriggerCmd::Xrun | TriggerCmd::Reset => channel.stop()?,
            TriggerCmd::Prepare | TriggerCmd::PreStart | TriggerCmd::PreRelease => {}
        }
        tracing::debug!(comp = ctx.id.0, ?cmd, "gateway trigger");
        Ok(PathStatus::Continue)
    }

    fn reset(&mut self, _ctx: &mut DevCtx) -> Result<()> {
        if let Some(ch) = self.channel.as_ref() {
            ch.stop()?;
        }
        self.local_bytes = 0;
        self.ts = TsState::default();
        Ok(())
    }

    fn free(&mut self, ctx: &mut DevCtx) {
        let Some(ch) = self.channel.take() else {
            return;
        };
        if let Err(e) = ch.stop() {
            tracing::warn!(comp = ctx.id.0, errno = e.errno(), "gateway channel stop failed");
        }
        if let Err((e, ch)) = ch.put() {
            tracing::error!(comp = ctx.id.0, errno = e.errno(), "gateway channel not released");
            self.channel = Some(ch);
        }
    }

    fn endpoint(&mut self) -> Option<&mut dyn EndpointOps> {
        Some(self)
    }
}

impl EndpointOps for HostGateway {
    fn get_total_data_processed(&self, stream_no: u32, input: bool) -> u64 {
        if stream_no != 0 || input != self.is_playback() {
            return 0;
        }
        self.local_bytes
    }

    fn position(&self, _ctx: &DevCtx) -> Result<Position> {
        let status = self.channel()?.status()?;
        Ok(Position {
            host_bytes: status.total_bytes,
            local_bytes: self.local_bytes,
            wallclock: self.clock.now(),
        })
    }

    fn dai_ts_config(&mut self) -> Result<()> {
        self.ts.configured = true;
        Ok(())
    }

    fn dai_ts_start(&mut self, now: u64) -> Result<()> {
        if !self.ts.configured {
            return Err(Error::Invalid("timestamping not configured"));
        }
        self.ts.start = Some(now);
        self.ts.base_bytes = self.local_bytes;
        Ok(())
    }

    fn dai_ts_stop(&mut self) -> Result<()> {
        self.ts.start = None;
        Ok(())
    }

    fn dai_ts_get(&self, now: u64) -> Result<Timestamp> {
        if self.ts.start.is_none() {
            return Err(Error::Invalid("timestamping not started"));
        }
        let frames = (self.local_bytes - self.ts.base_bytes) / self.frame_bytes.max(1) as u64;
        Ok(Timestamp {
            sample: frames,
            wallclock: now,
        })
    }

    fn dai_get_hw_params(&self, ctx: &DevCtx) -> Result<StreamParams> {
        Ok(ctx.params)
    }

    fn xrun_bytes(&self) -> usize {
        self.xrun_bytes
    }

    fn set_scheduling_source(&mut self, enable: bool) -> Result<()> {
        self.channel()?.set_scheduling_source(enable)
    }
}
