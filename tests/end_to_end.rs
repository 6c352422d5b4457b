//! Host playback through a processing module into a WAV recording, paced by the LL
//! scheduler of the simulated platform.

mod common;

use dspflow::buffer::CompId;
use dspflow::component::{CompState, TriggerCmd};
use dspflow::control::{drain_notifications, new_notification_queue, Notification, PipelineId};
use dspflow::dma::{DmaDir, HostPort};
use dspflow::dsl::PipelineBuilder;
use dspflow::file::WavSink;
use dspflow::gateway::HostGateway;
use dspflow::harness::SimPlatform;
use dspflow::module::{InputStreamBuffer, ModuleAdapter, ModuleConfig, ModuleInterface, OutputStreamBuffer, ProcType};
use dspflow::pipeline::{PipelineHandle, ScheduleConfig};
use std::path::Path;

const PERIOD: usize = 192;

/// Halves every S16 sample.
struct Halve;

impl ModuleInterface for Halve {
    fn proc_type(&self) -> ProcType {
        ProcType::Raw
    }

    fn process_raw_data(
        &mut self,
        input: &mut [InputStreamBuffer<'_>],
        output: &mut [OutputStreamBuffer<'_>],
    ) -> dspflow::Result<()> {
        for (i, o) in input.iter_mut().zip(output.iter_mut()) {
            let n = i.size.min(o.data.len()) & !1;
            for (src, dst) in i.data[..n].chunks_exact(2).zip(o.data[..n].chunks_exact_mut(2)) {
                let s = i16::from_le_bytes([src[0], src[1]]) / 2;
                dst.copy_from_slice(&s.to_le_bytes());
            }
            i.consumed = n;
            o.size = n;
        }
        Ok(())
    }
}

struct Playback {
    handle: PipelineHandle,
    port: HostPort,
    rx: dspflow::control::NotificationRx,
}

fn playback(p: &SimPlatform, wav: &Path) -> Playback {
    let params = common::s16_stereo();
    let gw = HostGateway::new(p.dma(), 0, DmaDir::HMEM_TO_LMEM, p.clock().clone()).unwrap();
    let port = gw.host_port();
    let cfg = ModuleConfig {
        ibs: PERIOD,
        obs: PERIOD,
        params,
        ..ModuleConfig::default()
    };
    let adapter = ModuleAdapter::create("halve", p.heap().clone(), cfg, Box::new(Halve)).unwrap();

    let mut b = PipelineBuilder::new(p.heap().clone(), PipelineId(1), 0, 1000);
    b.component("host", CompId(1), Box::new(gw)).unwrap();
    b.component("halve", CompId(2), Box::new(adapter)).unwrap();
    b.component("rec", CompId(3), Box::new(WavSink::create(wav, params).unwrap()))
        .unwrap();
    b.ctx_mut("host").unwrap().params = params;
    b.ctx_mut("halve").unwrap().params = params;
    b.connect("host", "halve", 2).unwrap();
    b.connect("halve", "rec", 2).unwrap();
    b.endpoints("host", "rec");
    let mut pipeline = b.build().unwrap();
    let (tx, rx) = new_notification_queue();
    pipeline.set_notifier(tx);

    let handle = PipelineHandle::new(pipeline);
    handle.lock().prepare().unwrap();
    handle
        .schedule_config(p.ll(0).unwrap().clone(), ScheduleConfig::default())
        .unwrap();
    Playback { handle, port, rx }
}

fn host_periods(sample: i16, periods: usize) -> Vec<u8> {
    std::iter::repeat(sample.to_le_bytes())
        .take(PERIOD / 2 * periods)
        .flatten()
        .collect()
}

#[test]
fn host_audio_is_processed_and_recorded() {
    let p = common::platform();
    let dir = tempfile::tempdir().unwrap();
    let wav = dir.path().join("out.wav");
    let mut pb = playback(&p, &wav);

    assert_eq!(pb.port.write(&host_periods(1000, 4)).unwrap(), PERIOD * 4);
    pb.handle.trigger(TriggerCmd::PreStart).unwrap();
    pb.handle.trigger(TriggerCmd::Start).unwrap();
    p.run_periods(3);

    pb.handle.trigger(TriggerCmd::Stop).unwrap();
    let host_bytes = pb.handle.lock().position().unwrap().unwrap().host_bytes;
    pb.handle.free().unwrap();
    assert!(drain_notifications(&mut pb.rx).is_empty());
    assert_eq!(p.ll_shared().total_num_work(), 0);

    let reader = hound::WavReader::open(&wav).unwrap();
    assert_eq!(reader.spec().channels, 2);
    let samples: Vec<i16> = reader.into_samples::<i16>().map(|s| s.unwrap()).collect();
    assert!(samples.len() >= 3 * PERIOD / 2);
    assert_eq!(samples.len() as u64 * 2, host_bytes);
    assert!(samples.iter().all(|&s| s == 500));

    // The gateway handed its channel back.
    let ch = p.dma().channel_get(0).unwrap();
    ch.put().unwrap();
}

#[test]
fn starved_playback_recovers_once_then_stops() {
    let p = common::platform();
    let dir = tempfile::tempdir().unwrap();
    let mut pb = playback(&p, &dir.path().join("short.wav"));

    pb.port.write(&host_periods(-8, 1)).unwrap();
    pb.handle.trigger(TriggerCmd::PreStart).unwrap();
    pb.handle.trigger(TriggerCmd::Start).unwrap();
    p.run_periods(5);

    let msgs = drain_notifications(&mut pb.rx);
    assert!(matches!(
        msgs.first(),
        Some(Notification::Xrun {
            pipeline: PipelineId(1),
            comp: CompId(1),
            bytes: 192,
        })
    ));
    assert!(matches!(
        msgs.last(),
        Some(Notification::PipelineError { pipeline: PipelineId(1), .. })
    ));
    assert_eq!(p.ll_shared().total_num_work(), 0);
    pb.handle.free().unwrap();
}

#[test]
fn deferred_stop_ends_the_task_after_its_delay() {
    let p = common::platform();
    let dir = tempfile::tempdir().unwrap();
    let mut pb = playback(&p, &dir.path().join("deferred.wav"));

    pb.port.write(&host_periods(64, 8)).unwrap();
    pb.handle.trigger(TriggerCmd::PreStart).unwrap();
    pb.handle.trigger(TriggerCmd::Start).unwrap();
    p.run_periods(2);

    pb.handle.trigger_deferred(TriggerCmd::Stop, 1).unwrap();
    assert!(pb.handle.lock().trigger_pending());
    assert_eq!(pb.handle.trigger_deferred(TriggerCmd::Stop, 0), Err(dspflow::Error::Busy));
    p.run_periods(1);
    assert_eq!(pb.handle.lock().status(), CompState::Active);

    p.run_periods(2);
    assert!(!pb.handle.lock().trigger_pending());
    assert_eq!(pb.handle.lock().status(), CompState::Prepare);
    assert_eq!(p.ll_shared().total_num_work(), 0);

    pb.handle.lock().post_position(p.now()).unwrap();
    let msgs = drain_notifications(&mut pb.rx);
    assert!(matches!(
        msgs.as_slice(),
        [Notification::PositionUpdate { pipeline: PipelineId(1), host_bytes, .. }] if *host_bytes > 0
    ));
    pb.handle.free().unwrap();
}
