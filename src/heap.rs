//! Memory zones.
//!
//! Each zone is a byte budget. Allocations hand back an RAII charge that returns its bytes
//! when dropped, so unwinding a half-finished init releases memory in reverse order simply
//! by dropping locals.

use crate::config::PlatformConfig;
use crate::error::{Error, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Allocation zones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zone {
    /// Long-lived platform structures.
    System,
    /// Task private data and module state.
    Runtime,
    /// Audio buffers and staging areas.
    Buffer,
}

impl Zone {
    /// Zone name used in errors and logs.
    pub const fn name(self) -> &'static str {
        match self {
            Zone::System => "system",
            Zone::Runtime => "runtime",
            Zone::Buffer => "buffer",
        }
    }
}

#[derive(Debug)]
struct ZoneBudget {
    zone: Zone,
    capacity: usize,
    used: AtomicUsize,
    peak: AtomicUsize,
}

impl ZoneBudget {
    fn new(zone: Zone, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            zone,
            capacity,
            used: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }
}

/// Bytes charged against a zone. Returned on drop.
#[derive(Debug)]
pub struct ZoneAlloc {
    budget: Arc<ZoneBudget>,
    bytes: usize,
}

impl ZoneAlloc {
    /// Size of this charge.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Zone charged.
    pub fn zone(&self) -> Zone {
        self.budget.zone
    }
}

impl Drop for ZoneAlloc {
    fn drop(&mut self) {
        self.budget.used.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}

/// A zero-filled byte block charged against a zone.
#[derive(Debug)]
pub struct ZoneVec {
    data: Vec<u8>,
    _charge: ZoneAlloc,
}

impl std::ops::Deref for ZoneVec {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl std::ops::DerefMut for ZoneVec {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// The platform heap: one budget per zone.
#[derive(Debug)]
pub struct Heap {
    system: Arc<ZoneBudget>,
    runtime: Arc<ZoneBudget>,
    buffer: Arc<ZoneBudget>,
}

impl Heap {
    /// Heap with explicit zone sizes.
    pub fn new(system: usize, runtime: usize, buffer: usize) -> Arc<Self> {
        Arc::new(Self {
            system: ZoneBudget::new(Zone::System, system),
            runtime: ZoneBudget::new(Zone::Runtime, runtime),
            buffer: ZoneBudget::new(Zone::Buffer, buffer),
        })
    }

    /// Heap sized from platform configuration.
    pub fn from_config(cfg: &PlatformConfig) -> Arc<Self> {
        Self::new(cfg.system_zone, cfg.runtime_zone, cfg.buffer_zone)
    }

    /// Effectively unlimited heap for tests and tools.
    pub fn unbounded() -> Arc<Self> {
        Self::new(usize::MAX / 4, usize::MAX / 4, usize::MAX / 4)
    }

    fn budget(&self, zone: Zone) -> &Arc<ZoneBudget> {
        match zone {
            Zone::System => &self.system,
            Zone::Runtime => &self.runtime,
            Zone::Buffer => &self.buffer,
        }
    }

    /// Charge `bytes` against `zone`.
    pub fn alloc(&self, zone: Zone, bytes: usize) -> Result<ZoneAlloc> {
        let budget = self.budget(zone);
        let res = budget
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|n| *n <= budget.capacity)
            });
        match res {
            Ok(prev) => {
                budget.peak.fetch_max(prev + bytes, Ordering::Relaxed);
                Ok(ZoneAlloc {
                    budget: budget.clone(),
                    bytes,
                })
            }
            Err(used) => {
                tracing::warn!(zone = zone.name(), used, bytes, "zone exhausted");
                Err(Error::NoMemory { zone: zone.name() })
            }
        }
    }

    /// Charge `size_of::<T>()` bytes, for private data blocks.
    pub fn alloc_for<T>(&self, zone: Zone) -> Result<ZoneAlloc> {
        self.alloc(zone, std::mem::size_of::<T>().max(1))
    }

    /// Allocate a zero-filled byte block.
    pub fn alloc_bytes(&self, zone: Zone, bytes: usize) -> Result<ZoneVec> {
        let charge = self.alloc(zone, bytes)?;
        Ok(ZoneVec {
            data: vec![0; bytes],
            _charge: charge,
        })
    }

    /// Bytes currently charged to `zone`.
    pub fn used(&self, zone: Zone) -> usize {
        self.budget(zone).used.load(Ordering::Acquire)
    }

    /// Highest charge seen on `zone`.
    pub fn peak(&self, zone: Zone) -> usize {
        self.budget(zone).peak.load(Ordering::Relaxed)
    }
}
