//! Software DMA controller.
//!
//! Each channel owns a byte FIFO standing in for the transfer engine. The far side (host
//! memory) talks to the FIFO through `host_write`/`host_read`; the pipeline side moves bytes
//! between the FIFO and an [`AudioStream`] with [`DmaChannel::copy`].
//!
//! Channel slots, their status and the controller reference count share one lock that is
//! never held across anything that can block.

use crate::buffer::AudioStream;
use crate::error::{Error, Result};
use crate::ring::RingBuf;
use parking_lot::Mutex;
use std::sync::Arc;

/// Transfer direction bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DmaDir(u32);

impl DmaDir {
    pub const MEM_TO_MEM: DmaDir = DmaDir(1 << 0);
    /// Host memory into local memory (playback).
    pub const HMEM_TO_LMEM: DmaDir = DmaDir(1 << 1);
    /// Local memory into host memory (capture).
    pub const LMEM_TO_HMEM: DmaDir = DmaDir(1 << 2);
    pub const MEM_TO_DEV: DmaDir = DmaDir(1 << 3);
    pub const DEV_TO_MEM: DmaDir = DmaDir(1 << 4);

    /// Whether every bit of `other` is set.
    pub const fn contains(self, other: DmaDir) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether data flows towards the pipeline.
    pub const fn is_inbound(self) -> bool {
        self.0 & (Self::HMEM_TO_LMEM.0 | Self::DEV_TO_MEM.0) != 0
    }
}

impl std::ops::BitOr for DmaDir {
    type Output = DmaDir;
    fn bitor(self, rhs: DmaDir) -> DmaDir {
        DmaDir(self.0 | rhs.0)
    }
}

/// Channel status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaStatus {
    /// Not held by anyone.
    Init,
    /// Held, not configured.
    Ready,
    /// Configured, stopped.
    Prepare,
    Paused,
    Active,
}

/// Channel configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaConfig {
    pub direction: DmaDir,
    /// FIFO size in bytes.
    pub fifo_bytes: usize,
    /// Bytes per interrupt.
    pub period_bytes: usize,
    /// Transfers are multiples of this many bytes.
    pub copy_align: usize,
}

/// Queryable controller attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaAttr {
    BufferAlignment,
    CopyAlignment,
    BufferAddressAlignment,
    BufferPeriodCount,
}

/// Interrupt requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqCmd {
    /// Pending interrupt count.
    Status,
    Clear,
    Mask,
    Unmask,
}

/// Snapshot of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStatus {
    pub state: DmaStatus,
    /// Bytes moved since the channel was configured.
    pub total_bytes: u64,
    pub scheduling_source: bool,
}

#[derive(Debug)]
struct Slot {
    status: DmaStatus,
    config: Option<DmaConfig>,
    fifo: RingBuf,
    total: u64,
    since_irq: usize,
    irq_pending: u32,
    irq_masked: bool,
    stop_pending: bool,
    scheduling_source: bool,
}

impl Slot {
    fn new() -> Self {
        Self {
            status: DmaStatus::Init,
            config: None,
            fifo: RingBuf::new(0),
            total: 0,
            since_irq: 0,
            irq_pending: 0,
            irq_masked: false,
            stop_pending: false,
            scheduling_source: false,
        }
    }

    fn is_running(&self) -> bool {
        matches!(self.status, DmaStatus::Active | DmaStatus::Paused)
    }

    fn account(&mut self, bytes: usize) {
        self.total += bytes as u64;
        let Some(cfg) = self.config else { return };
        if cfg.period_bytes == 0 {
            return;
        }
        self.since_irq += bytes;
        while self.since_irq >= cfg.period_bytes {
            self.since_irq -= cfg.period_bytes;
            if !self.irq_masked {
                self.irq_pending += 1;
            }
        }
    }
}

#[derive(Debug)]
struct Inner {
    refs: usize,
    slots: Vec<Slot>,
}

/// A DMA controller with a fixed set of channels.
#[derive(Debug)]
pub struct DmaController {
    id: u32,
    caps: DmaDir,
    channels: usize,
    inner: Mutex<Inner>,
}

impl DmaController {
    /// Controller `id` with `channels` channels supporting directions `caps`.
    pub fn new(id: u32, channels: usize, caps: DmaDir) -> Arc<Self> {
        Arc::new(Self {
            id,
            caps,
            channels,
            inner: Mutex::new(Inner {
                refs: 0,
                slots: Vec::new(),
            }),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn channel_count(&self) -> usize {
        self.channels
    }

    /// Take a reference on the controller; the first one brings the channels up.
    pub fn probe(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.refs == 0 {
            inner.slots = (0..self.channels).map(|_| Slot::new()).collect();
            tracing::debug!(dma = self.id, channels = self.channels, "dma probed");
        }
        inner.refs += 1;
        Ok(())
    }

    /// Drop a reference. The last one requires every channel to be released (EBUSY).
    pub fn remove(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.refs {
            0 => Err(Error::Invalid("dma not probed")),
            1 => {
                if inner.slots.iter().any(|s| s.status != DmaStatus::Init) {
                    return Err(Error::Busy);
                }
                inner.refs = 0;
                inner.slots.clear();
                tracing::debug!(dma = self.id, "dma removed");
                Ok(())
            }
            _ => {
                inner.refs -= 1;
                Ok(())
            }
        }
    }

    /// Controller reference count.
    pub fn refs(&self) -> usize {
        self.inner.lock().refs
    }

    /// Acquire channel `index`. ENODEV out of range or unprobed, EBUSY when already held.
    pub fn channel_get(self: &Arc<Self>, index: usize) -> Result<DmaChannel> {
        let mut inner = self.inner.lock();
        let slot = inner.slots.get_mut(index).ok_or(Error::NoDevice)?;
        if slot.status != DmaStatus::Init {
            return Err(Error::Busy);
        }
        *slot = Slot::new();
        slot.status = DmaStatus::Ready;
        tracing::debug!(dma = self.id, channel = index, "channel acquired");
        Ok(DmaChannel {
            ctrl: self.clone(),
            index,
        })
    }

    /// Controller attribute.
    pub fn get_attribute(&self, attr: DmaAttr) -> Result<u32> {
        Ok(match attr {
            DmaAttr::BufferAlignment | DmaAttr::BufferAddressAlignment => 64,
            DmaAttr::CopyAlignment => 4,
            DmaAttr::BufferPeriodCount => 2,
        })
    }

    fn with_slot<R>(&self, index: usize, f: impl FnOnce(&mut Slot) -> Result<R>) -> Result<R> {
        let mut inner = self.inner.lock();
        let slot = inner.slots.get_mut(index).ok_or(Error::NoDevice)?;
        if slot.status == DmaStatus::Init {
            return Err(Error::Invalid("channel not held"));
        }
        f(slot)
    }
}

/// A held channel.
#[derive(Debug)]
pub struct DmaChannel {
    ctrl: Arc<DmaController>,
    index: usize,
}

impl DmaChannel {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn controller(&self) -> &Arc<DmaController> {
        &self.ctrl
    }

    /// Release the channel. EBUSY unless stopped; the handle is returned on failure.
    pub fn put(self) -> std::result::Result<(), (Error, DmaChannel)> {
        let res = self.ctrl.with_slot(self.index, |s| {
            if s.is_running() || s.stop_pending {
                return Err(Error::Busy);
            }
            *s = Slot::new();
            Ok(())
        });
        match res {
            Ok(()) => {
                tracing::debug!(dma = self.ctrl.id, channel = self.index, "channel released");
                Ok(())
            }
            Err(e) => Err((e, self)),
        }
    }

    /// Apply `config`. EINVAL for an unsupported direction or empty FIFO, EBUSY while running.
    pub fn set_config(&self, config: DmaConfig) -> Result<()> {
        if !self.ctrl.caps.contains(config.direction) {
            return Err(Error::Invalid("direction not supported by controller"));
        }
        if config.fifo_bytes == 0 {
            return Err(Error::Invalid("zero sized dma fifo"));
        }
        self.ctrl.with_slot(self.index, |s| {
            if s.is_running() {
                return Err(Error::Busy);
            }
            s.fifo = RingBuf::new(config.fifo_bytes);
            s.config = Some(config);
            s.total = 0;
            s.since_irq = 0;
            s.status = DmaStatus::Prepare;
            Ok(())
        })
    }

    /// PREPARE → ACTIVE.
    pub fn start(&self) -> Result<()> {
        self.transition(DmaStatus::Prepare, DmaStatus::Active)
    }

    /// ACTIVE → PAUSED.
    pub fn pause(&self) -> Result<()> {
        self.transition(DmaStatus::Active, DmaStatus::Paused)
    }

    /// PAUSED → ACTIVE.
    pub fn release(&self) -> Result<()> {
        self.transition(DmaStatus::Paused, DmaStatus::Active)
    }

    fn transition(&self, from: DmaStatus, to: DmaStatus) -> Result<()> {
        self.ctrl.with_slot(self.index, |s| {
            if s.status != from {
                tracing::warn!(channel = self.index, status = ?s.status, ?to, "illegal dma transition");
                return Err(Error::Invalid("illegal dma channel transition"));
            }
            s.status = to;
            Ok(())
        })
    }

    /// Stop now. Stopping a stopped channel is a no-op.
    pub fn stop(&self) -> Result<()> {
        self.ctrl.with_slot(self.index, |s| {
            if s.is_running() {
                s.status = DmaStatus::Prepare;
            }
            s.stop_pending = false;
            Ok(())
        })
    }

    /// Stop after the next transfer. A paused channel stops at once.
    pub fn stop_delayed(&self) -> Result<()> {
        self.ctrl.with_slot(self.index, |s| {
            match s.status {
                DmaStatus::Active => s.stop_pending = true,
                DmaStatus::Paused => s.status = DmaStatus::Prepare,
                _ => {}
            }
            Ok(())
        })
    }

    /// `(avail, free)` in the FIFO.
    pub fn get_data_size(&self) -> Result<(usize, usize)> {
        self.ctrl
            .with_slot(self.index, |s| Ok((s.fifo.avail(), s.fifo.free())))
    }

    pub fn status(&self) -> Result<ChannelStatus> {
        self.ctrl.with_slot(self.index, |s| {
            Ok(ChannelStatus {
                state: s.status,
                total_bytes: s.total,
                scheduling_source: s.scheduling_source,
            })
        })
    }

    /// Move `bytes` between the FIFO and `stream` in the configured direction.
    ///
    /// EINVAL unless active or when either side cannot take the amount; nothing moves then.
    pub fn copy(&self, stream: &mut AudioStream, bytes: usize) -> Result<()> {
        self.ctrl.with_slot(self.index, |s| {
            if s.status != DmaStatus::Active {
                return Err(Error::Invalid("dma channel not active"));
            }
            let cfg = s.config.ok_or(Error::Invalid("dma channel not configured"))?;
            if cfg.copy_align > 1 && bytes % cfg.copy_align != 0 {
                return Err(Error::Invalid("unaligned dma copy"));
            }
            if cfg.direction.is_inbound() {
                s.fifo.transfer_to(stream.ring_mut(), bytes)?;
            } else {
                stream.ring_mut().transfer_to(&mut s.fifo, bytes)?;
            }
            s.account(bytes);
            if s.stop_pending {
                s.stop_pending = false;
                s.status = DmaStatus::Prepare;
            }
            tracing::trace!(channel = self.index, bytes, "dma copy");
            Ok(())
        })
    }

    /// Far side pushes into an inbound channel. Returns bytes accepted.
    pub fn host_write(&self, data: &[u8]) -> Result<usize> {
        host_write(&self.ctrl, self.index, data)
    }

    /// Far side pulls from an outbound channel. Returns bytes read.
    pub fn host_read(&self, out: &mut [u8]) -> Result<usize> {
        host_read(&self.ctrl, self.index, out)
    }

    /// Far side access that outlives moving the channel into a component.
    pub fn host_port(&self) -> HostPort {
        HostPort {
            ctrl: self.ctrl.clone(),
            index: self.index,
        }
    }

    /// Interrupt control. `Status` returns the pending count; other commands return 0.
    pub fn interrupt(&self, cmd: IrqCmd) -> Result<u32> {
        self.ctrl.with_slot(self.index, |s| {
            Ok(match cmd {
                IrqCmd::Status => s.irq_pending,
                IrqCmd::Clear => {
                    s.irq_pending = 0;
                    0
                }
                IrqCmd::Mask => {
                    s.irq_masked = true;
                    0
                }
                IrqCmd::Unmask => {
                    s.irq_masked = false;
                    0
                }
            })
        })
    }

    /// Make this the controller's scheduling source, clearing the flag on every other
    /// channel.
    pub fn set_scheduling_source(&self, enable: bool) -> Result<()> {
        let mut inner = self.ctrl.inner.lock();
        if inner.slots.get(self.index).map(|s| s.status) == Some(DmaStatus::Init) {
            return Err(Error::Invalid("channel not held"));
        }
        for (i, slot) in inner.slots.iter_mut().enumerate() {
            if i == self.index {
                slot.scheduling_source = enable;
            } else if enable {
                slot.scheduling_source = false;
            }
        }
        Ok(())
    }
}

fn host_write(ctrl: &DmaController, index: usize, data: &[u8]) -> Result<usize> {
    ctrl.with_slot(index, |s| {
        let n = data.len().min(s.fifo.free());
        s.fifo.write_from(&data[..n])?;
        Ok(n)
    })
}

fn host_read(ctrl: &DmaController, index: usize, out: &mut [u8]) -> Result<usize> {
    ctrl.with_slot(index, |s| {
        let n = out.len().min(s.fifo.avail());
        s.fifo.read_into(&mut out[..n])?;
        Ok(n)
    })
}

/// Host memory side of a channel.
#[derive(Debug, Clone)]
pub struct HostPort {
    ctrl: Arc<DmaController>,
    index: usize,
}

impl HostPort {
    /// Queue playback data. Returns bytes accepted.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        host_write(&self.ctrl, self.index, data)
    }

    /// Collect capture data. Returns bytes read.
    pub fn read(&self, out: &mut [u8]) -> Result<usize> {
        host_read(&self.ctrl, self.index, out)
    }

    /// `(avail, free)` in the channel FIFO.
    pub fn data_size(&self) -> Result<(usize, usize)> {
        self.ctrl
            .with_slot(self.index, |s| Ok((s.fifo.avail(), s.fifo.free())))
    }
}
