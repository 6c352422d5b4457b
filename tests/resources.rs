mod common;

use dspflow::buffer::CompId;
use dspflow::component::{CompDriver, DevCtx, PathStatus};
use dspflow::config::PlatformConfig;
use dspflow::control::PipelineId;
use dspflow::dma::{DmaConfig, DmaDir, DmaStatus};
use dspflow::dsl::{DslError, PipelineBuilder};
use dspflow::harness::SimPlatform;
use dspflow::heap::{Heap, Zone};
use dspflow::module::{ApiVersion, BuildInfo, LibraryManager, LoadableImage, ModuleInterface, ProcType};
use dspflow::Error;
use std::sync::Arc;

struct Null;

impl CompDriver for Null {
    fn name(&self) -> &'static str {
        "null"
    }

    fn copy(&mut self, _ctx: &mut DevCtx) -> dspflow::Result<PathStatus> {
        Ok(PathStatus::Continue)
    }
}

struct Idle;

impl ModuleInterface for Idle {
    fn proc_type(&self) -> ProcType {
        ProcType::SourceSink
    }
}

#[test]
fn running_channel_cannot_be_released() {
    let p = common::platform();
    let ch = p.dma().channel_get(0).unwrap();
    assert_eq!(p.dma().channel_get(0).unwrap_err(), Error::Busy);
    ch.set_config(DmaConfig {
        direction: DmaDir::HMEM_TO_LMEM,
        fifo_bytes: 384,
        period_bytes: 192,
        copy_align: 4,
    })
    .unwrap();
    ch.start().unwrap();

    let (err, ch) = ch.put().unwrap_err();
    assert_eq!(err, Error::Busy);
    assert_eq!(err.errno(), -16);
    assert_eq!(ch.status().unwrap().state, DmaStatus::Active);

    ch.stop().unwrap();
    ch.put().unwrap();
    p.dma().channel_get(0).unwrap().put().unwrap();
}

#[test]
fn exhausted_buffer_zone_fails_cleanly() {
    let p = SimPlatform::new(PlatformConfig::default().with_buffer_zone(500)).unwrap();
    let heap = p.heap().clone();
    let mut b = PipelineBuilder::new(heap.clone(), PipelineId(2), 0, 1000);
    for (n, name) in ["a", "b", "c"].iter().enumerate() {
        b.component(name, CompId(n as u32), Box::new(Null)).unwrap();
        b.ctx_mut(name).unwrap().params = common::s16_stereo();
    }
    b.connect("a", "b", 2).unwrap();
    assert_eq!(heap.used(Zone::Buffer), 384);

    let err = b.connect("b", "c", 2).unwrap_err();
    assert!(matches!(err, DslError::Alloc(Error::NoMemory { zone: "buffer" })));
    assert_eq!(Error::from(err).errno(), -12);
    assert_eq!(heap.used(Zone::Buffer), 384);

    drop(b);
    assert_eq!(heap.used(Zone::Buffer), 0);
    assert_eq!(heap.peak(Zone::Buffer), 384);
}

#[test]
fn module_instances_are_charged_to_the_runtime_zone() {
    let heap = Heap::new(1 << 16, 0, 1 << 16);
    let lib = LibraryManager::new(heap.clone());
    lib.register(LoadableImage {
        module_id: 7,
        name: "idle".into(),
        build_info: BuildInfo {
            format: 1,
            api_version: ApiVersion::new(5, 1, 0),
        },
        entry: Arc::new(|| Box::new(Idle) as Box<dyn ModuleInterface>),
    })
    .unwrap();
    assert!(matches!(lib.load(7), Err(Error::NoMemory { .. })));
    assert_eq!(lib.instances(7), 0);
    assert_eq!(heap.used(Zone::Runtime), 0);

    let roomy = Heap::unbounded();
    let lib = LibraryManager::new(roomy.clone());
    lib.register(LoadableImage {
        module_id: 7,
        name: "idle".into(),
        build_info: BuildInfo {
            format: 1,
            api_version: ApiVersion::new(5, 1, 0),
        },
        entry: Arc::new(|| Box::new(Idle) as Box<dyn ModuleInterface>),
    })
    .unwrap();
    let m = lib.load(7).unwrap();
    assert!(roomy.used(Zone::Runtime) > 0);
    assert_eq!(lib.unregister(7), Err(Error::Busy));
    drop(m);
    assert_eq!(roomy.used(Zone::Runtime), 0);
    lib.unregister(7).unwrap();
}
