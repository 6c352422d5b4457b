//! Helpers shared by the integration tests.

#![allow(dead_code)]

use dspflow::buffer::{CompId, FrameFormat, StreamParams};
use dspflow::clock::SysClock;
use dspflow::config::PlatformConfig;
use dspflow::control::PipelineId;
use dspflow::dma::{DmaController, DmaDir, HostPort};
use dspflow::dsl::PipelineBuilder;
use dspflow::gateway::HostGateway;
use dspflow::harness::SimPlatform;
use dspflow::heap::Heap;
use dspflow::module::{InputStreamBuffer, ModuleAdapter, ModuleConfig, ModuleInterface, OutputStreamBuffer, ProcType};
use dspflow::pipeline::Pipeline;

/// Install a fmt subscriber once; `RUST_LOG` picks the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Single core, 1000 ticks per ms, 1 ms LL period.
pub fn platform() -> SimPlatform {
    init_tracing();
    match SimPlatform::new(PlatformConfig::default()) {
        Ok(p) => p,
        Err(e) => panic!("platform bring-up failed: {e}"),
    }
}

/// 48 kHz stereo S16: 192 bytes per 1 ms period.
pub fn s16_stereo() -> StreamParams {
    StreamParams::new(FrameFormat::S16Le, 2, 48_000)
}

/// 48 kHz mono S16: 96 bytes per 1 ms period.
pub fn s16_mono() -> StreamParams {
    StreamParams::new(FrameFormat::S16Le, 1, 48_000)
}

/// Raw module copying its input block to its output block.
pub struct Passthrough;

impl ModuleInterface for Passthrough {
    fn proc_type(&self) -> ProcType {
        ProcType::Raw
    }

    fn process_raw_data(
        &mut self,
        input: &mut [InputStreamBuffer<'_>],
        output: &mut [OutputStreamBuffer<'_>],
    ) -> dspflow::Result<()> {
        for (i, o) in input.iter_mut().zip(output.iter_mut()) {
            let n = i.size.min(o.data.len());
            o.data[..n].copy_from_slice(&i.data[..n]);
            i.consumed = n;
            o.size = n;
        }
        Ok(())
    }
}

/// Playback gateway -> pass-through module -> capture gateway, on DMA channels 0 and 1.
pub struct Loopback {
    pub pipeline: Pipeline,
    pub playback: HostPort,
    pub capture: HostPort,
}

/// One stereo S16 period in bytes.
pub const LOOPBACK_PERIOD: usize = 192;

/// Build and prepare a loopback pipeline. Not started.
pub fn loopback() -> Loopback {
    let heap = Heap::unbounded();
    let clock = SysClock::new(1000);
    let dma = DmaController::new(0, 2, DmaDir::HMEM_TO_LMEM | DmaDir::LMEM_TO_HMEM);
    dma.probe().unwrap();
    let play = HostGateway::new(&dma, 0, DmaDir::HMEM_TO_LMEM, clock.clone()).unwrap();
    let cap = HostGateway::new(&dma, 1, DmaDir::LMEM_TO_HMEM, clock).unwrap();
    let (playback, capture) = (play.host_port(), cap.host_port());
    let cfg = ModuleConfig {
        ibs: LOOPBACK_PERIOD,
        obs: LOOPBACK_PERIOD,
        params: s16_stereo(),
        ..ModuleConfig::default()
    };
    let adapter = ModuleAdapter::create("pass", heap.clone(), cfg, Box::new(Passthrough)).unwrap();

    let mut b = PipelineBuilder::new(heap, PipelineId(1), 0, 1000);
    b.component("play", CompId(1), Box::new(play)).unwrap();
    b.component("pass", CompId(2), Box::new(adapter)).unwrap();
    b.component("cap", CompId(3), Box::new(cap)).unwrap();
    for name in ["play", "pass", "cap"] {
        b.ctx_mut(name).unwrap().params = s16_stereo();
    }
    b.connect("play", "pass", 2).unwrap();
    b.connect("pass", "cap", 2).unwrap();
    let mut pipeline = b.build().unwrap();
    pipeline.prepare().unwrap();
    Loopback {
        pipeline,
        playback,
        capture,
    }
}
