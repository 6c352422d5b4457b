mod common;

use dspflow::schedule::{DpModule, DpScheduler, TaskScheduler};
use dspflow::task::{ScheduleFlags, SchedulerKind, Task, TaskPriority, TaskRun, TaskState};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[test]
fn ll_task_stays_phase_locked_despite_overhead() {
    let p = common::platform();
    let clock = p.clock().clone();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    let task = Task::new("phase", SchedulerKind::Ll, 0, TaskPriority::MED, move || {
        s.lock().push(clock.now());
        // work takes a while
        clock.advance(37);
        TaskRun::Reschedule(1000)
    });
    let ll = p.ll(0).unwrap();
    ll.schedule_task_init(&task, ScheduleFlags::NONE).unwrap();
    ll.schedule_task(&task, 0, 1000, ScheduleFlags::NONE).unwrap();

    p.run_until(4_500);
    assert_eq!(*seen.lock(), vec![0, 1000, 2000, 3000, 4000]);
    assert_eq!(task.start(), 5000);
    assert_eq!(task.state(), TaskState::Queued);
}

#[test]
fn scheduling_a_queued_task_twice_is_a_no_op() {
    let p = common::platform();
    let ll = p.ll(0).unwrap();
    let t = Task::new("once", SchedulerKind::Ll, 0, TaskPriority::MED, || TaskRun::Reschedule(1000));
    ll.schedule_task_init(&t, ScheduleFlags::NONE).unwrap();
    ll.schedule_task(&t, 0, 1000, ScheduleFlags::NONE).unwrap();
    let before = ll.queued();
    ll.schedule_task(&t, 0, 1000, ScheduleFlags::NONE).unwrap();
    assert_eq!(ll.queued(), before);
    assert_eq!(p.ll_shared().total_num_work(), 1);
}

#[test]
fn completed_ll_work_stops_the_tick() {
    let p = common::platform();
    let ll = p.ll(0).unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let r = runs.clone();
    let t = Task::new("three", SchedulerKind::Ll, 0, TaskPriority::MED, move || {
        if r.fetch_add(1, Ordering::Relaxed) == 2 {
            TaskRun::Complete
        } else {
            TaskRun::Reschedule(1000)
        }
    });
    ll.schedule_task_init(&t, ScheduleFlags::NONE).unwrap();
    ll.schedule_task(&t, 0, 1000, ScheduleFlags::NONE).unwrap();
    p.run_periods(10);
    assert_eq!(runs.load(Ordering::Relaxed), 3);
    assert_eq!(t.state(), TaskState::Completed);
    assert_eq!(p.ll_shared().total_num_work(), 0);
    assert_eq!(p.next_event(), None);
}

#[test]
fn frequency_change_keeps_queued_ll_work_in_the_future() {
    let p = common::platform();
    let ll = p.ll(0).unwrap();
    let t = Task::new("remap", SchedulerKind::Ll, 0, TaskPriority::MED, || TaskRun::Reschedule(1000));
    ll.schedule_task_init(&t, ScheduleFlags::NONE).unwrap();
    ll.schedule_task(&t, 0, 1000, ScheduleFlags::NONE).unwrap();
    p.run_until(2_500);
    assert_eq!(t.start(), 3000);

    p.set_frequency(2000);
    assert!(t.start() > p.now());
    assert_eq!(t.start(), 3500);
    assert_eq!(ll.window_ticks(), 4000);
}

struct Hooks {
    ready: AtomicBool,
    deadline_us: u64,
}

impl DpModule for Hooks {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn deadline_us(&self) -> Option<u64> {
        Some(self.deadline_us)
    }

    fn lpt_us(&self) -> u64 {
        1000
    }
}

fn dp_task(name: &str, hooks: &Arc<Hooks>) -> Arc<Task> {
    let h = hooks.clone();
    Task::new(name, SchedulerKind::Dp, 0, TaskPriority::MED, move || {
        h.ready.store(false, Ordering::Release);
        TaskRun::Reschedule(0)
    })
}

#[test]
fn dp_tasks_ready_on_one_tick_get_deadlines_in_deadline_order() {
    let p = common::platform();
    let ll = p.ll(0).unwrap();
    let pacer = Task::new("pacer", SchedulerKind::Ll, 0, TaskPriority::HIGH, || TaskRun::Reschedule(1000));
    ll.schedule_task_init(&pacer, ScheduleFlags::NONE).unwrap();
    ll.schedule_task(&pacer, 0, 1000, ScheduleFlags::NONE).unwrap();
    p.run_until(3_500);

    let dp = p.dp(0).unwrap();
    let ha = Arc::new(Hooks {
        ready: AtomicBool::new(true),
        deadline_us: 5000,
    });
    let hb = Arc::new(Hooks {
        ready: AtomicBool::new(true),
        deadline_us: 2000,
    });
    let a = dp_task("a", &ha);
    let b = dp_task("b", &hb);
    dp.schedule_task_init(&a, ha.clone()).unwrap();
    dp.schedule_task_init(&b, hb.clone()).unwrap();
    dp.schedule_task(&a, 0, 0, ScheduleFlags::NONE).unwrap();
    dp.schedule_task(&b, 0, 0, ScheduleFlags::NONE).unwrap();

    p.run_until(4_000);
    assert_eq!(dp.last_ll_tick(), 4000);
    let da = DpScheduler::pdata(&a).unwrap().os_deadline();
    let db = DpScheduler::pdata(&b).unwrap().os_deadline();
    assert_eq!(da, 4000 + 5000);
    assert_eq!(db, 4000 + 2000);
    assert!(db < da);

    dp.schedule_task_free(&a).unwrap();
    dp.schedule_task_free(&b).unwrap();
}

#[test]
fn cancelled_edf_task_never_runs() {
    let p = common::platform();
    let edf = p.edf(0).unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let r = runs.clone();
    let t = Task::new("later", SchedulerKind::Edf, 0, TaskPriority::MED, move || {
        r.fetch_add(1, Ordering::Relaxed);
        TaskRun::Complete
    });
    edf.schedule_task_init(&t).unwrap();
    edf.schedule_task(&t, 2000, 1000, ScheduleFlags::NONE).unwrap();
    assert_eq!(p.next_event(), Some(2000));

    p.run_until(1000);
    edf.schedule_task_cancel(&t).unwrap();
    assert_eq!(edf.queued(), 0);
    assert_eq!(t.state(), TaskState::Cancel);

    p.run_until(5000);
    assert_eq!(runs.load(Ordering::Relaxed), 0);
}

#[test]
fn edf_task_pushed_past_its_deadline_gets_one_more_window() {
    let mut p = common::platform();
    let clock = p.clock().clone();
    let edf = p.edf(0).unwrap().clone();
    let order = Arc::new(Mutex::new(Vec::new()));

    let o = order.clone();
    let hog = Task::new("hog", SchedulerKind::Edf, 0, TaskPriority::HIGH, move || {
        o.lock().push(("hog", clock.now()));
        clock.advance(3000);
        TaskRun::Complete
    });
    let o = order.clone();
    let c = p.clock().clone();
    let victim = Task::new("victim", SchedulerKind::Edf, 0, TaskPriority::LOW, move || {
        o.lock().push(("victim", c.now()));
        TaskRun::Complete
    });
    for (t, deadline) in [(&hog, 500), (&victim, 1000)] {
        edf.schedule_task_init(t).unwrap();
        edf.schedule_task(t, 0, deadline, ScheduleFlags::IDLE).unwrap();
    }
    assert_eq!(edf.run(), Some(6000));
    assert_eq!(victim.start(), 6000);

    p.run_until(10_000);
    assert_eq!(*order.lock(), vec![("hog", 0), ("victim", 6000)]);
    assert_eq!(victim.state(), TaskState::Completed);
    assert!(p.drain_edf_notifications().is_empty());
}
