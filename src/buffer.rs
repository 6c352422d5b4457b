//! Audio streams and the buffers that connect components.

use crate::coherent::Coherent;
use crate::error::{Error, Result};
use crate::heap::{Heap, Zone, ZoneAlloc};
use crate::ring::RingBuf;
use parking_lot::Mutex;
use std::sync::Arc;

/// Sample container formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameFormat {
    /// 16-bit signed little endian.
    S16Le,
    /// 24-bit signed in a 32-bit container.
    S24In32Le,
    /// 32-bit signed little endian.
    S32Le,
    /// 32-bit IEEE float.
    Float,
}

impl FrameFormat {
    /// Bytes per sample.
    pub const fn sample_bytes(self) -> usize {
        match self {
            FrameFormat::S16Le => 2,
            FrameFormat::S24In32Le | FrameFormat::S32Le | FrameFormat::Float => 4,
        }
    }
}

/// Stream parameters negotiated at `params` time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamParams {
    /// Sample format.
    pub format: FrameFormat,
    /// Interleaved channels per frame.
    pub channels: u32,
    /// Frames per second.
    pub rate: u32,
}

impl StreamParams {
    /// Build a parameter set.
    pub const fn new(format: FrameFormat, channels: u32, rate: u32) -> Self {
        Self {
            format,
            channels,
            rate,
        }
    }

    /// Bytes per interleaved frame.
    pub const fn frame_bytes(&self) -> usize {
        self.format.sample_bytes() * self.channels as usize
    }

    /// Bytes in one period of `period_us`.
    pub fn period_bytes(&self, period_us: u64) -> usize {
        (self.rate as u64 * period_us / 1_000_000) as usize * self.frame_bytes()
    }
}

impl Default for StreamParams {
    fn default() -> Self {
        Self::new(FrameFormat::S32Le, 2, 48_000)
    }
}

/// A ring of interleaved frames.
#[derive(Debug, Clone)]
pub struct AudioStream {
    ring: RingBuf,
    params: StreamParams,
    frame_align: usize,
    end_of_stream: bool,
}

impl AudioStream {
    /// Empty stream of `size` bytes.
    pub fn new(size: usize, params: StreamParams) -> Self {
        Self {
            ring: RingBuf::new(size),
            params,
            frame_align: 1,
            end_of_stream: false,
        }
    }

    /// Stream parameters.
    pub fn params(&self) -> &StreamParams {
        &self.params
    }

    /// Replace the stream parameters. The ring is emptied.
    pub fn set_params(&mut self, params: StreamParams) {
        self.params = params;
        self.ring.reset();
    }

    /// Round frame counts down to multiples of `frames`.
    pub fn set_frame_align(&mut self, frames: usize) {
        self.frame_align = frames.max(1);
    }

    /// Frame alignment.
    pub fn frame_align(&self) -> usize {
        self.frame_align
    }

    /// Bytes per frame.
    pub fn frame_bytes(&self) -> usize {
        self.params.frame_bytes()
    }

    /// Capacity in bytes.
    pub fn size(&self) -> usize {
        self.ring.size()
    }

    /// Readable bytes.
    pub fn avail(&self) -> usize {
        self.ring.avail()
    }

    /// Writable bytes.
    pub fn free(&self) -> usize {
        self.ring.free()
    }

    /// Whole readable frames.
    pub fn avail_frames(&self) -> usize {
        self.avail() / self.frame_bytes().max(1)
    }

    /// Whole writable frames.
    pub fn free_frames(&self) -> usize {
        self.free() / self.frame_bytes().max(1)
    }

    /// Whether the producer has signalled end of stream.
    pub fn end_of_stream(&self) -> bool {
        self.end_of_stream
    }

    /// Mark or clear end of stream.
    pub fn set_end_of_stream(&mut self, eos: bool) {
        self.end_of_stream = eos;
    }

    /// Advance the read position by `bytes`.
    pub fn consume(&mut self, bytes: usize) -> Result<()> {
        self.ring.consume(bytes)
    }

    /// Advance the write position by `bytes`.
    pub fn produce(&mut self, bytes: usize) -> Result<()> {
        self.ring.produce(bytes)
    }

    /// Readable region of `bytes` as up to two slices.
    pub fn read_slices(&self, bytes: usize) -> Result<(&[u8], &[u8])> {
        self.ring.read_slices(bytes)
    }

    /// Writable region of `bytes` as up to two slices.
    pub fn write_slices(&mut self, bytes: usize) -> Result<(&mut [u8], &mut [u8])> {
        self.ring.write_slices(bytes)
    }

    /// Copy `src` in.
    pub fn write_from(&mut self, src: &[u8]) -> Result<()> {
        self.ring.write_from(src)
    }

    /// Copy out and consume `dst.len()` bytes.
    pub fn read_into(&mut self, dst: &mut [u8]) -> Result<()> {
        self.ring.read_into(dst)
    }

    /// Copy out without consuming.
    pub fn peek_into(&self, dst: &mut [u8]) -> Result<()> {
        self.ring.peek_into(dst)
    }

    /// Produce `bytes` of silence.
    pub fn write_silence(&mut self, bytes: usize) -> Result<()> {
        self.ring.write_zeros(bytes)
    }

    /// Move `bytes` into `dst`.
    pub fn copy_to(&mut self, dst: &mut AudioStream, bytes: usize) -> Result<()> {
        self.ring.transfer_to(&mut dst.ring, bytes)
    }

    pub(crate) fn ring_mut(&mut self) -> &mut RingBuf {
        &mut self.ring
    }

    /// Empty the ring and clear end of stream.
    pub fn reset(&mut self) {
        self.ring.reset();
        self.end_of_stream = false;
    }
}

/// Frames and bytes that one copy may move between a source and a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CopyLimits {
    /// Whole frames both sides can take.
    pub frames: usize,
    /// Bytes to consume from the source.
    pub source_bytes: usize,
    /// Bytes to produce into the sink.
    pub sink_bytes: usize,
    /// Source frame size.
    pub source_frame_bytes: usize,
    /// Sink frame size.
    pub sink_frame_bytes: usize,
}

/// Largest whole-frame transfer that fits both what `source` holds and what `sink` can take.
pub fn copy_limits(source: &AudioStream, sink: &AudioStream) -> CopyLimits {
    let frames = source.avail_frames().min(sink.free_frames());
    limits_for(source, sink, frames)
}

/// As [`copy_limits`], rounded down to the coarser frame alignment of the two streams.
pub fn copy_limits_frame_aligned(source: &AudioStream, sink: &AudioStream) -> CopyLimits {
    let align = source.frame_align().max(sink.frame_align());
    let frames = source.avail_frames().min(sink.free_frames());
    limits_for(source, sink, frames - frames % align)
}

fn limits_for(source: &AudioStream, sink: &AudioStream, frames: usize) -> CopyLimits {
    let source_frame_bytes = source.frame_bytes();
    let sink_frame_bytes = sink.frame_bytes();
    CopyLimits {
        frames,
        source_bytes: frames * source_frame_bytes,
        sink_bytes: frames * sink_frame_bytes,
        source_frame_bytes,
        sink_frame_bytes,
    }
}

/// Identifier of a component device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompId(pub u32);

/// Identifier of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u32);

#[derive(Debug, Default)]
struct Endpoints {
    producer: Option<CompId>,
    consumer: Option<CompId>,
}

/// A buffer between exactly one producing and one consuming component.
#[derive(Debug)]
pub struct CompBuffer {
    id: BufferId,
    stream: Coherent<AudioStream>,
    endpoints: Mutex<Endpoints>,
    _charge: ZoneAlloc,
}

impl CompBuffer {
    /// Allocate a buffer of `size` bytes from the buffer zone.
    pub fn new(heap: &Heap, id: BufferId, size: usize, params: StreamParams) -> Result<Arc<Self>> {
        if size == 0 {
            return Err(Error::Invalid("zero sized buffer"));
        }
        let charge = heap.alloc(Zone::Buffer, size)?;
        tracing::debug!(buffer = id.0, size, "buffer allocated");
        Ok(Arc::new(Self {
            id,
            stream: Coherent::new(AudioStream::new(size, params)),
            endpoints: Mutex::new(Endpoints::default()),
            _charge: charge,
        }))
    }

    /// Allocate `periods` periods of `period_us` each.
    pub fn with_periods(
        heap: &Heap,
        id: BufferId,
        params: StreamParams,
        period_us: u64,
        periods: usize,
    ) -> Result<Arc<Self>> {
        Self::new(heap, id, params.period_bytes(period_us) * periods, params)
    }

    /// Buffer id.
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// The stream, shared-memory aware.
    pub fn stream(&self) -> &Coherent<AudioStream> {
        &self.stream
    }

    /// Mark the buffer as crossing cores.
    pub fn make_shared(&self) {
        self.stream.make_shared();
    }

    /// Producing component.
    pub fn producer(&self) -> Option<CompId> {
        self.endpoints.lock().producer
    }

    /// Consuming component.
    pub fn consumer(&self) -> Option<CompId> {
        self.endpoints.lock().consumer
    }

    /// Attach the producing side. EBUSY if one is already attached.
    pub fn connect_producer(&self, comp: CompId) -> Result<()> {
        let mut ep = self.endpoints.lock();
        if ep.producer.is_some() {
            return Err(Error::Busy);
        }
        ep.producer = Some(comp);
        Ok(())
    }

    /// Attach the consuming side. EBUSY if one is already attached.
    pub fn connect_consumer(&self, comp: CompId) -> Result<()> {
        let mut ep = self.endpoints.lock();
        if ep.consumer.is_some() {
            return Err(Error::Busy);
        }
        ep.consumer = Some(comp);
        Ok(())
    }

    /// Detach `comp` from whichever side it holds.
    pub fn disconnect(&self, comp: CompId) {
        let mut ep = self.endpoints.lock();
        if ep.producer == Some(comp) {
            ep.producer = None;
        }
        if ep.consumer == Some(comp) {
            ep.consumer = None;
        }
    }

    /// Readable bytes.
    pub fn avail(&self) -> usize {
        self.stream.acquire().avail()
    }

    /// Writable bytes.
    pub fn free(&self) -> usize {
        self.stream.acquire().free()
    }

    /// Limits for a copy from `source` into `sink`.
    pub fn copy_limits(source: &CompBuffer, sink: &CompBuffer) -> CopyLimits {
        let src = source.stream.acquire();
        let snk = sink.stream.acquire();
        copy_limits(&src, &snk)
    }
}
