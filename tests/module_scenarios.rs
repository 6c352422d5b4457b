mod common;

use dspflow::buffer::{BufferId, CompBuffer, CompId};
use dspflow::component::{BindDir, CompDev, DevCtx, PathStatus};
use dspflow::control::PipelineId;
use dspflow::heap::Heap;
use dspflow::module::library::NATIVE_API_MAJOR;
use dspflow::module::{
    ApiVersion, BuildInfo, ConfigAssembler, FragmentPosition, InputStreamBuffer,
    LoadableImage, ModuleAdapter, ModuleConfig, ModuleInterface, ModuleState, OutputStreamBuffer,
    ProcType, Sinks, Sources,
};
use dspflow::Error;
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

const PERIOD: usize = 96;

fn native() -> BuildInfo {
    BuildInfo {
        format: 1,
        api_version: ApiVersion::new(NATIVE_API_MAJOR, 0, 0),
    }
}

fn period_cfg() -> ModuleConfig {
    ModuleConfig {
        ibs: PERIOD,
        obs: PERIOD,
        params: common::s16_mono(),
        ..ModuleConfig::default()
    }
}

/// Declares the stream entry point but only implements the source/sink one.
struct Mislabelled {
    calls: Arc<AtomicUsize>,
}

impl ModuleInterface for Mislabelled {
    fn proc_type(&self) -> ProcType {
        ProcType::Stream
    }

    fn process(&mut self, _sources: &Sources<'_>, _sinks: &Sinks<'_>) -> dspflow::Result<()> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Raw pass-through that also honors an external gate.
struct Gated {
    open: Arc<AtomicBool>,
    calls: Arc<AtomicUsize>,
}

impl ModuleInterface for Gated {
    fn proc_type(&self) -> ProcType {
        ProcType::Raw
    }

    fn process_raw_data(
        &mut self,
        input: &mut [InputStreamBuffer<'_>],
        output: &mut [OutputStreamBuffer<'_>],
    ) -> dspflow::Result<()> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        for (i, o) in input.iter_mut().zip(output.iter_mut()) {
            let n = i.size.min(o.data.len());
            o.data[..n].copy_from_slice(&i.data[..n]);
            i.consumed = n;
            o.size = n;
        }
        Ok(())
    }

    fn is_ready_to_process(&self, _sources: &Sources<'_>, _sinks: &Sinks<'_>) -> Option<bool> {
        Some(self.open.load(Ordering::Relaxed))
    }
}

/// Keeps every configuration blob it receives.
struct Recorder {
    blobs: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl ModuleInterface for Recorder {
    fn proc_type(&self) -> ProcType {
        ProcType::Raw
    }

    fn set_configuration(
        &mut self,
        _config_id: u32,
        pos: FragmentPosition,
        _data_offset_size: usize,
        fragment: &[u8],
        _response: &mut [u8],
    ) -> dspflow::Result<()> {
        assert_eq!(pos, FragmentPosition::Single);
        self.blobs.lock().push(fragment.to_vec());
        Ok(())
    }
}

struct Rig {
    dev: CompDev,
    src: Arc<CompBuffer>,
    snk: Arc<CompBuffer>,
}

fn rig(heap: &Arc<Heap>, adapter: ModuleAdapter) -> Rig {
    let mut dev = CompDev::new(DevCtx::new(CompId(3), PipelineId(1), 0, 1000), Box::new(adapter));
    let src = CompBuffer::new(heap, BufferId(1), PERIOD * 4, common::s16_mono()).unwrap();
    let snk = CompBuffer::new(heap, BufferId(2), PERIOD * 4, common::s16_mono()).unwrap();
    dev.bind(BindDir::Source, 0, src.clone()).unwrap();
    dev.bind(BindDir::Sink, 0, snk.clone()).unwrap();
    Rig { dev, src, snk }
}

#[test]
fn mislabelled_stream_module_only_answers_on_its_implemented_entry() {
    common::init_tracing();
    let p = common::platform();
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    p.library()
        .register(LoadableImage {
            module_id: 0x40,
            name: "mislabelled".into(),
            build_info: native(),
            entry: Arc::new(move || Box::new(Mislabelled { calls: c.clone() }) as Box<dyn ModuleInterface>),
        })
        .unwrap();

    let mut m = p.library().load(0x40).unwrap();
    assert_eq!(p.library().instances(0x40), 1);
    let err = m.modules_process_audio_stream(&mut [], &mut []).unwrap_err();
    assert_eq!(err, Error::NotSupported);
    assert_eq!(err.errno(), -95);
    m.modules_process(&Sources::new(&[]), &Sinks::new(&[])).unwrap();
    assert_eq!(calls.load(Ordering::Relaxed), 1);
    drop(m);
    assert_eq!(p.library().instances(0x40), 0);

    // The adapter dispatches on the declared type and reports the same error.
    let adapter =
        ModuleAdapter::from_library("mislabelled", p.heap().clone(), period_cfg(), p.library(), 0x40).unwrap();
    let handle = adapter.handle();
    let mut r = rig(p.heap(), adapter);
    r.dev.prepare().unwrap();
    r.src.stream().acquire().write_from(&[1; PERIOD]).unwrap();
    assert_eq!(r.dev.copy(), Err(Error::NotSupported));
    assert_eq!(handle.state(), ModuleState::Idle);
    assert_eq!(calls.load(Ordering::Relaxed), 1);
    assert_eq!(r.snk.avail(), 0);
}

#[test]
fn legacy_images_are_not_loaded() {
    let p = common::platform();
    p.library()
        .register(LoadableImage {
            module_id: 0x41,
            name: "old".into(),
            build_info: BuildInfo {
                format: 1,
                api_version: ApiVersion::new(NATIVE_API_MAJOR - 1, 9, 0),
            },
            entry: Arc::new(|| {
                Box::new(Mislabelled {
                    calls: Arc::default(),
                }) as Box<dyn ModuleInterface>
            }),
        })
        .unwrap();
    assert_eq!(p.library().load(0x41).unwrap_err(), Error::NotSupported);
    assert_eq!(p.library().instances(0x41), 0);
    assert!(matches!(p.library().load(0x99), Err(Error::Invalid(_))));
}

#[test]
fn module_gate_holds_back_a_full_period() {
    common::init_tracing();
    let heap = Heap::unbounded();
    let open = Arc::new(AtomicBool::new(false));
    let calls = Arc::new(AtomicUsize::new(0));
    let module = Gated {
        open: open.clone(),
        calls: calls.clone(),
    };
    let adapter = ModuleAdapter::create("gated", heap.clone(), period_cfg(), Box::new(module)).unwrap();
    let mut r = rig(&heap, adapter);
    r.dev.prepare().unwrap();

    r.src.stream().acquire().write_from(&[7; PERIOD]).unwrap();
    for _ in 0..3 {
        assert_eq!(r.dev.copy(), Ok(PathStatus::Continue));
    }
    assert_eq!(calls.load(Ordering::Relaxed), 0);
    assert_eq!(r.src.avail(), PERIOD);
    assert_eq!(r.snk.avail(), 0);

    open.store(true, Ordering::Relaxed);
    r.dev.copy().unwrap();
    assert_eq!(calls.load(Ordering::Relaxed), 1);
    assert_eq!(r.src.avail(), 0);
    assert_eq!(r.snk.avail(), PERIOD);
}

#[test]
fn fragments_out_of_order_are_refused() {
    let heap = Heap::unbounded();
    let mut asm = ConfigAssembler::new(heap, 64);
    assert!(matches!(
        asm.push(1, FragmentPosition::Middle, 0, &[1]),
        Err(Error::Invalid(_))
    ));
    assert!(asm.push(1, FragmentPosition::First, 4, &[1, 2]).unwrap().is_none());
    assert_eq!(asm.push(1, FragmentPosition::First, 4, &[1, 2]).unwrap_err(), Error::Busy);
    assert!(asm.is_busy());
    assert!(matches!(
        asm.push(1, FragmentPosition::Last, 3, &[3, 4]),
        Err(Error::Invalid(_))
    ));
    assert!(!asm.is_busy());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn split_delivery_matches_single_delivery(
        blob in proptest::collection::vec(any::<u8>(), 3..200),
        a in 0.0f64..1.0,
        b in 0.0f64..1.0,
    ) {
        let heap = Heap::unbounded();
        let blobs = Arc::new(Mutex::new(Vec::new()));
        let module = Recorder { blobs: blobs.clone() };
        let adapter = ModuleAdapter::create("cfg", heap.clone(), period_cfg(), Box::new(module)).unwrap();
        let mut r = rig(&heap, adapter);

        let len = blob.len();
        let mut cuts = [1 + (a * (len - 2) as f64) as usize, 1 + (b * (len - 2) as f64) as usize];
        cuts.sort_unstable();
        let (x, y) = (cuts[0], cuts[1].max(cuts[0]));
        let total = len as u32;

        r.dev.set_large_config(9, true, false, total, &blob[..x]).unwrap();
        r.dev.set_large_config(9, false, false, x as u32, &blob[x..y]).unwrap();
        prop_assert!(blobs.lock().is_empty());
        r.dev.set_large_config(9, false, true, y as u32, &blob[y..]).unwrap();
        r.dev.set_large_config(9, true, true, total, &blob).unwrap();

        let got = blobs.lock();
        prop_assert_eq!(got.len(), 2);
        prop_assert_eq!(&got[0], &blob);
        prop_assert_eq!(&got[1], &blob);
    }
}
