//! Processing module interface.
//!
//! A module is an algorithm behind [`ModuleInterface`]. It declares one of three
//! processing types and implements the matching entry point; the adapter
//! ([`adapter::ModuleAdapter`]) turns it into a pipeline component.

pub mod adapter;
pub mod config;
pub mod library;

use crate::buffer::{AudioStream, CompBuffer, StreamParams};
use crate::coherent::CoherentGuard;
use crate::component::MAX_PINS;
use crate::error::{Error, Result};
use std::sync::Arc;

pub use adapter::ModuleAdapter;
pub use config::{ConfigAssembler, FragmentPosition};
pub use library::{ApiVersion, BuildInfo, LibraryManager, LoadableImage, LoadedModule};

/// Most sources (and sinks) a module can see.
pub const MODULE_MAX_SOURCES: usize = MAX_PINS;

/// Entry point a module implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcType {
    /// `process` over source/sink views of the real buffers.
    SourceSink,
    /// `process_audio_stream` over staged frames.
    Stream,
    /// `process_raw_data` over staged bytes.
    Raw,
}

/// Processing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessingMode {
    #[default]
    Normal,
    /// Input is passed to output unchanged.
    Bypass,
}

/// Module lifecycle, ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ModuleState {
    Disabled,
    Initialized,
    Idle,
    Processing,
}

/// Where a module runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcDomain {
    /// Inline in the LL pipeline copy.
    #[default]
    Ll,
    /// On its own DP thread.
    Dp,
}

/// Creation-time configuration of a module.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleConfig {
    /// Input bytes consumed per process call.
    pub ibs: usize,
    /// Output bytes produced per process call.
    pub obs: usize,
    pub params: StreamParams,
    pub domain: ProcDomain,
    /// Largest assembled configuration blob.
    pub max_config_blob: usize,
    /// Module specific initial configuration.
    pub init_data: Vec<u8>,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            ibs: 0,
            obs: 0,
            params: StreamParams::default(),
            domain: ProcDomain::Ll,
            max_config_blob: 4096,
            init_data: Vec::new(),
        }
    }
}

/// Staging counters of one adapter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModuleProcessingData {
    pub in_buff_size: usize,
    pub out_buff_size: usize,
    /// Bytes produced since prepare.
    pub produced: u64,
    /// Bytes consumed since prepare.
    pub consumed: u64,
}

/// Staged input handed to `process_audio_stream` / `process_raw_data`.
#[derive(Debug)]
pub struct InputStreamBuffer<'a> {
    pub data: &'a [u8],
    /// Frames for [`ProcType::Stream`], bytes for [`ProcType::Raw`].
    pub size: usize,
    /// Bytes the module used. Set by the module.
    pub consumed: usize,
    pub end_of_stream: bool,
    pub params: StreamParams,
}

/// Staged output filled by the module.
#[derive(Debug)]
pub struct OutputStreamBuffer<'a> {
    pub data: &'a mut [u8],
    /// Bytes the module produced. Set by the module.
    pub size: usize,
}

/// Source buffers of a module.
#[derive(Debug, Clone, Copy)]
pub struct Sources<'a> {
    bufs: &'a [Arc<CompBuffer>],
}

impl<'a> Sources<'a> {
    pub fn new(bufs: &'a [Arc<CompBuffer>]) -> Self {
        Self { bufs }
    }

    pub fn len(&self) -> usize {
        self.bufs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bufs.is_empty()
    }

    /// Source `i`.
    pub fn get(&self, i: usize) -> Option<Source<'a>> {
        self.bufs.get(i).map(|b| Source { buf: b })
    }

    pub fn iter(&self) -> impl Iterator<Item = Source<'a>> + 'a {
        self.bufs.iter().map(|b| Source { buf: b })
    }
}

/// Sink buffers of a module.
#[derive(Debug, Clone, Copy)]
pub struct Sinks<'a> {
    bufs: &'a [Arc<CompBuffer>],
}

impl<'a> Sinks<'a> {
    pub fn new(bufs: &'a [Arc<CompBuffer>]) -> Self {
        Self { bufs }
    }

    pub fn len(&self) -> usize {
        self.bufs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bufs.is_empty()
    }

    /// Sink `i`.
    pub fn get(&self, i: usize) -> Option<Sink<'a>> {
        self.bufs.get(i).map(|b| Sink { buf: b })
    }

    pub fn iter(&self) -> impl Iterator<Item = Sink<'a>> + 'a {
        self.bufs.iter().map(|b| Sink { buf: b })
    }
}

/// Read side of one buffer.
#[derive(Debug, Clone, Copy)]
pub struct Source<'a> {
    buf: &'a CompBuffer,
}

impl<'a> Source<'a> {
    /// Readable bytes.
    pub fn avail(&self) -> usize {
        self.buf.avail()
    }

    /// Start a read transaction.
    pub fn acquire(&self) -> SourceAccess<'a> {
        SourceAccess {
            stream: self.buf.stream().acquire(),
        }
    }
}

/// Write side of one buffer.
#[derive(Debug, Clone, Copy)]
pub struct Sink<'a> {
    buf: &'a CompBuffer,
}

impl<'a> Sink<'a> {
    /// Writable bytes.
    pub fn free(&self) -> usize {
        self.buf.free()
    }

    /// Start a write transaction.
    pub fn acquire(&self) -> SinkAccess<'a> {
        SinkAccess {
            stream: self.buf.stream().acquire(),
        }
    }
}

/// Exclusive read access to a source until dropped.
pub struct SourceAccess<'a> {
    stream: CoherentGuard<'a, AudioStream>,
}

impl SourceAccess<'_> {
    pub fn avail(&self) -> usize {
        self.stream.avail()
    }

    pub fn params(&self) -> StreamParams {
        *self.stream.params()
    }

    pub fn frame_bytes(&self) -> usize {
        self.stream.frame_bytes()
    }

    pub fn end_of_stream(&self) -> bool {
        self.stream.end_of_stream()
    }

    /// `n` readable bytes as up to two slices. ENODATA if fewer are available.
    pub fn get_data(&self, n: usize) -> Result<(&[u8], &[u8])> {
        if n > self.stream.avail() {
            return Err(Error::NoData);
        }
        self.stream.read_slices(n)
    }

    /// Mark `n` bytes as consumed.
    pub fn release_data(&mut self, n: usize) -> Result<()> {
        self.stream.consume(n)
    }
}

/// Exclusive write access to a sink until dropped.
pub struct SinkAccess<'a> {
    stream: CoherentGuard<'a, AudioStream>,
}

impl SinkAccess<'_> {
    pub fn free(&self) -> usize {
        self.stream.free()
    }

    pub fn params(&self) -> StreamParams {
        *self.stream.params()
    }

    pub fn frame_bytes(&self) -> usize {
        self.stream.frame_bytes()
    }

    /// `n` writable bytes as up to two slices. ENOSPC if less space is free.
    pub fn get_buffer(&mut self, n: usize) -> Result<(&mut [u8], &mut [u8])> {
        if n > self.stream.free() {
            return Err(Error::NoSpace);
        }
        self.stream.write_slices(n)
    }

    /// Mark `n` bytes as written.
    pub fn commit_buffer(&mut self, n: usize) -> Result<()> {
        self.stream.produce(n)
    }
}

/// An audio processing algorithm.
///
/// Only the entry point matching [`ModuleInterface::proc_type`] is called; the others
/// default to EOPNOTSUPP.
pub trait ModuleInterface: Send {
    /// Declared processing type.
    fn proc_type(&self) -> ProcType;

    fn init(&mut self, _cfg: &ModuleConfig) -> Result<()> {
        Ok(())
    }

    fn prepare(&mut self, _sources: &Sources<'_>, _sinks: &Sinks<'_>) -> Result<()> {
        Ok(())
    }

    fn process(&mut self, _sources: &Sources<'_>, _sinks: &Sinks<'_>) -> Result<()> {
        Err(Error::NotSupported)
    }

    fn process_audio_stream(
        &mut self,
        _input: &mut [InputStreamBuffer<'_>],
        _output: &mut [OutputStreamBuffer<'_>],
    ) -> Result<()> {
        Err(Error::NotSupported)
    }

    fn process_raw_data(
        &mut self,
        _input: &mut [InputStreamBuffer<'_>],
        _output: &mut [OutputStreamBuffer<'_>],
    ) -> Result<()> {
        Err(Error::NotSupported)
    }

    /// Apply configuration `config_id`. The adapter delivers whole blobs as
    /// [`FragmentPosition::Single`].
    fn set_configuration(
        &mut self,
        _config_id: u32,
        _pos: FragmentPosition,
        _data_offset_size: usize,
        _fragment: &[u8],
        _response: &mut [u8],
    ) -> Result<()> {
        Err(Error::NotSupported)
    }

    /// Current configuration `config_id`, whole.
    fn get_configuration(&mut self, _config_id: u32, _out: &mut Vec<u8>) -> Result<()> {
        Err(Error::NotSupported)
    }

    /// Accept or refuse a mode change.
    fn set_processing_mode(&mut self, _mode: ProcessingMode) -> Result<()> {
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        Ok(())
    }

    fn free(&mut self) -> Result<()> {
        Ok(())
    }

    /// Readiness override. `None` keeps the adapter's ibs/obs rule.
    fn is_ready_to_process(&self, _sources: &Sources<'_>, _sinks: &Sinks<'_>) -> Option<bool> {
        None
    }

    /// Time budget until output is due, for DP modules.
    fn deadline_us(&self) -> Option<u64> {
        None
    }

    /// Longest processing time, for DP modules.
    fn lpt_us(&self) -> u64 {
        0
    }
}

/// The adapter's default readiness rule.
pub fn default_ready(sources: &Sources<'_>, sinks: &Sinks<'_>, ibs: usize, obs: usize) -> bool {
    sources.iter().all(|s| s.avail() >= ibs) && sinks.iter().all(|s| s.free() >= obs)
}
