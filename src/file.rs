//! WAV file endpoints for host-side test benches.
//!
//! [`WavSource`] plays a file into a pipeline, [`WavSink`] records one. Both handle 16-bit
//! and 32-bit integer PCM and 32-bit float. Sample scratch is sized at prepare so the copy
//! path only touches the file.

use crate::buffer::{FrameFormat, StreamParams};
use crate::component::{CompDriver, DevCtx, EndpointOps, PathStatus, Position};
use crate::error::{Error, Result};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

fn params_from_spec(spec: &WavSpec) -> Result<StreamParams> {
    let format = match (spec.sample_format, spec.bits_per_sample) {
        (SampleFormat::Int, 16) => FrameFormat::S16Le,
        (SampleFormat::Int, 32) => FrameFormat::S32Le,
        (SampleFormat::Float, 32) => FrameFormat::Float,
        _ => return Err(Error::NotSupported),
    };
    Ok(StreamParams::new(format, spec.channels as u32, spec.sample_rate))
}

fn spec_from_params(params: &StreamParams) -> Result<WavSpec> {
    let (bits_per_sample, sample_format) = match params.format {
        FrameFormat::S16Le => (16, SampleFormat::Int),
        FrameFormat::S32Le => (32, SampleFormat::Int),
        FrameFormat::Float => (32, SampleFormat::Float),
        FrameFormat::S24In32Le => return Err(Error::NotSupported),
    };
    Ok(WavSpec {
        channels: params.channels as u16,
        sample_rate: params.rate,
        bits_per_sample,
        sample_format,
    })
}

/// Plays a WAV file, one period per copy. Sets end of stream on its sink when the file
/// runs out.
pub struct WavSource {
    reader: WavReader<BufReader<File>>,
    params: StreamParams,
    scratch: Vec<u8>,
    period_bytes: usize,
    bytes_read: u64,
    done: bool,
}

impl std::fmt::Debug for WavSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WavSource")
            .field("params", &self.params)
            .field("bytes_read", &self.bytes_read)
            .field("done", &self.done)
            .finish()
    }
}

impl WavSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let reader = WavReader::open(path)?;
        let params = params_from_spec(&reader.spec())?;
        tracing::debug!(?params, frames = reader.duration(), "wav source opened");
        Ok(Self {
            reader,
            params,
            scratch: Vec::new(),
            period_bytes: 0,
            bytes_read: 0,
            done: false,
        })
    }

    /// Stream parameters of the file.
    pub fn params(&self) -> StreamParams {
        self.params
    }

    /// Fill `scratch[..bytes]` from the file. Returns bytes filled, short at the end.
    fn read_samples(&mut self, bytes: usize) -> Result<usize> {
        let sample_bytes = self.params.format.sample_bytes();
        let out = &mut self.scratch[..bytes];
        let mut n = 0;
        match self.params.format {
            FrameFormat::S16Le => {
                for s in self.reader.samples::<i16>().take(bytes / sample_bytes) {
                    out[n..n + 2].copy_from_slice(&s?.to_le_bytes());
                    n += 2;
                }
            }
            FrameFormat::Float => {
                for s in self.reader.samples::<f32>().take(bytes / sample_bytes) {
                    out[n..n + 4].copy_from_slice(&s?.to_le_bytes());
                    n += 4;
                }
            }
            FrameFormat::S32Le | FrameFormat::S24In32Le => {
                for s in self.reader.samples::<i32>().take(bytes / sample_bytes) {
                    out[n..n + 4].copy_from_slice(&s?.to_le_bytes());
                    n += 4;
                }
            }
        }
        Ok(n)
    }
}

impl CompDriver for WavSource {
    fn name(&self) -> &'static str {
        "wav-source"
    }

    fn params(&mut self, _ctx: &mut DevCtx, params: &StreamParams) -> Result<()> {
        if *params != self.params {
            return Err(Error::Invalid("parameters differ from the wav file"));
        }
        Ok(())
    }

    fn prepare(&mut self, ctx: &mut DevCtx) -> Result<()> {
        ctx.params = self.params;
        self.period_bytes = self.params.period_bytes(ctx.period_us);
        self.scratch = vec![0; self.period_bytes];
        Ok(())
    }

    fn copy(&mut self, ctx: &mut DevCtx) -> Result<PathStatus> {
        let sink = ctx.sinks().first().ok_or(Error::Invalid("wav source has no sink"))?;
        if self.done {
            return Ok(PathStatus::Stop);
        }
        let frame_bytes = self.params.frame_bytes();
        let free = sink.free();
        let bytes = self.period_bytes.min(free - free % frame_bytes);
        if bytes == 0 {
            return Ok(PathStatus::Continue);
        }
        let n = self.read_samples(bytes)?;
        let mut stream = sink.stream().acquire();
        stream.write_from(&self.scratch[..n])?;
        self.bytes_read += n as u64;
        if n < bytes {
            self.done = true;
            stream.set_end_of_stream(true);
            tracing::debug!(bytes = self.bytes_read, "wav source finished");
        }
        Ok(PathStatus::Continue)
    }

    fn reset(&mut self, _ctx: &mut DevCtx) -> Result<()> {
        self.reader.seek(0)?;
        self.bytes_read = 0;
        self.done = false;
        Ok(())
    }

    fn endpoint(&mut self) -> Option<&mut dyn EndpointOps> {
        Some(self)
    }
}

impl EndpointOps for WavSource {
    fn get_total_data_processed(&self, stream_no: u32, input: bool) -> u64 {
        if stream_no == 0 && input {
            self.bytes_read
        } else {
            0
        }
    }

    fn position(&self, _ctx: &DevCtx) -> Result<Position> {
        Ok(Position {
            host_bytes: self.bytes_read,
            local_bytes: self.bytes_read,
            wallclock: 0,
        })
    }

    fn dai_get_hw_params(&self, _ctx: &DevCtx) -> Result<StreamParams> {
        Ok(self.params)
    }
}

/// Records everything it receives into a WAV file. The file is finalized on `free`.
pub struct WavSink {
    writer: Option<WavWriter<BufWriter<File>>>,
    params: StreamParams,
    scratch: Vec<u8>,
    period_bytes: usize,
    bytes_written: u64,
}

impl std::fmt::Debug for WavSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WavSink")
            .field("params", &self.params)
            .field("bytes_written", &self.bytes_written)
            .field("open", &self.writer.is_some())
            .finish()
    }
}

impl WavSink {
    pub fn create(path: impl AsRef<Path>, params: StreamParams) -> Result<Self> {
        let writer = WavWriter::create(path, spec_from_params(&params)?)?;
        Ok(Self {
            writer: Some(writer),
            params,
            scratch: Vec::new(),
            period_bytes: 0,
            bytes_written: 0,
        })
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Write the header and close the file. Later copies fail with ENODEV.
    pub fn finalize(&mut self) -> Result<()> {
        if let Some(w) = self.writer.take() {
            w.finalize()?;
            tracing::debug!(bytes = self.bytes_written, "wav sink finalized");
        }
        Ok(())
    }

    fn write_samples(&mut self, bytes: usize) -> Result<()> {
        let writer = self.writer.as_mut().ok_or(Error::NoDevice)?;
        let data = &self.scratch[..bytes];
        match self.params.format {
            FrameFormat::S16Le => {
                for c in data.chunks_exact(2) {
                    writer.write_sample(i16::from_le_bytes([c[0], c[1]]))?;
                }
            }
            FrameFormat::Float => {
                for c in data.chunks_exact(4) {
                    writer.write_sample(f32::from_le_bytes([c[0], c[1], c[2], c[3]]))?;
                }
            }
            FrameFormat::S32Le | FrameFormat::S24In32Le => {
                for c in data.chunks_exact(4) {
                    writer.write_sample(i32::from_le_bytes([c[0], c[1], c[2], c[3]]))?;
                }
            }
        }
        Ok(())
    }
}

impl CompDriver for WavSink {
    fn name(&self) -> &'static str {
        "wav-sink"
    }

    fn params(&mut self, _ctx: &mut DevCtx, params: &StreamParams) -> Result<()> {
        if *params != self.params {
            return Err(Error::Invalid("parameters differ from the wav file"));
        }
        Ok(())
    }

    fn prepare(&mut self, ctx: &mut DevCtx) -> Result<()> {
        ctx.params = self.params;
        self.period_bytes = self.params.period_bytes(ctx.period_us);
        self.scratch = vec![0; self.period_bytes];
        Ok(())
    }

    fn copy(&mut self, ctx: &mut DevCtx) -> Result<PathStatus> {
        let source = ctx.sources().first().ok_or(Error::Invalid("wav sink has no source"))?;
        let frame_bytes = self.params.frame_bytes();
        let avail = source.avail();
        let bytes = self.period_bytes.min(avail - avail % frame_bytes);
        if bytes == 0 {
            return Ok(PathStatus::Continue);
        }
        source.stream().acquire().read_into(&mut self.scratch[..bytes])?;
        self.write_samples(bytes)?;
        self.bytes_written += bytes as u64;
        Ok(PathStatus::Continue)
    }

    fn free(&mut self, ctx: &mut DevCtx) {
        if let Err(e) = self.finalize() {
            tracing::error!(comp = ctx.id.0, errno = e.errno(), "wav sink finalize failed");
        }
    }

    fn endpoint(&mut self) -> Option<&mut dyn EndpointOps> {
        Some(self)
    }
}

impl EndpointOps for WavSink {
    fn get_total_data_processed(&self, stream_no: u32, input: bool) -> u64 {
        if stream_no == 0 && !input {
            self.bytes_written
        } else {
            0
        }
    }

    fn position(&self, _ctx: &DevCtx) -> Result<Position> {
        Ok(Position {
            host_bytes: self.bytes_written,
            local_bytes: self.bytes_written,
            wallclock: 0,
        })
    }

    fn dai_get_hw_params(&self, _ctx: &DevCtx) -> Result<StreamParams> {
        Ok(self.params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferId, CompBuffer, CompId};
    use crate::component::{BindDir, CompDev, TriggerCmd};
    use crate::control::PipelineId;
    use crate::heap::Heap;
    use std::sync::Arc;

    fn params() -> StreamParams {
        StreamParams::new(FrameFormat::S16Le, 1, 8_000)
    }

    fn started(driver: Box<dyn CompDriver>, dir: BindDir, buf: Arc<CompBuffer>) -> CompDev {
        let mut dev = CompDev::new(DevCtx::new(CompId(1), PipelineId(1), 0, 1000), driver);
        dev.bind(dir, 0, buf).unwrap();
        dev.prepare().unwrap();
        dev.trigger(TriggerCmd::PreStart).unwrap();
        dev.trigger(TriggerCmd::Start).unwrap();
        dev
    }

    #[test]
    fn recorded_file_plays_back_identically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ramp.wav");
        let heap = Heap::unbounded();

        let rec_buf = CompBuffer::new(&heap, BufferId(1), 64, params()).unwrap();
        let mut rec = started(
            Box::new(WavSink::create(&path, params()).unwrap()),
            BindDir::Source,
            rec_buf.clone(),
        );
        let ramp: Vec<u8> = (0..20i16).flat_map(|s| (s * 100).to_le_bytes()).collect();
        for chunk in ramp.chunks(16) {
            rec_buf.stream().acquire().write_from(chunk).unwrap();
            rec.copy().unwrap();
        }
        assert_eq!(rec.endpoint().unwrap().get_total_data_processed(0, false), 40);
        rec.free();

        let source = WavSource::open(&path).unwrap();
        assert_eq!(source.params(), params());
        let play_buf = CompBuffer::new(&heap, BufferId(2), 64, params()).unwrap();
        let mut play = started(Box::new(source), BindDir::Sink, play_buf.clone());
        for _ in 0..3 {
            play.copy().unwrap();
        }
        let mut out = vec![0u8; play_buf.avail()];
        play_buf.stream().acquire().read_into(&mut out).unwrap();
        assert_eq!(out, ramp);
        assert!(play_buf.stream().acquire().end_of_stream());
        assert_eq!(play.copy(), Ok(PathStatus::Stop));
    }

    #[test]
    fn mismatched_params_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = WavSink::create(dir.path().join("x.wav"), params()).unwrap();
        let mut ctx = DevCtx::new(CompId(1), PipelineId(1), 0, 1000);
        let other = StreamParams::new(FrameFormat::S16Le, 2, 8_000);
        assert!(sink.params(&mut ctx, &other).is_err());
        assert!(WavSink::create(dir.path().join("y.wav"), StreamParams::new(FrameFormat::S24In32Le, 1, 8_000)).is_err());
    }
}
