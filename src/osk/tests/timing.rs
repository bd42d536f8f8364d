//! Alarms and schedule tables driven tick by tick.
use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc, Mutex,
};

use osk::{Action, AlarmDef, Cfg, CounterDef, Kernel, ScheduleTableDef, TableStatus, TaskDef, Tick};

type Trace = Arc<Mutex<Vec<Tick>>>;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn one_shot_alarm_fires_at_its_offset() {
    init();
    let fired: Trace = Arc::new(Mutex::new(Vec::new()));
    let mut cfg = Cfg::new();
    let c = CounterDef::new("c", 999).finish(&mut cfg);

    let fired2 = Arc::clone(&fired);
    let handler = TaskDef::new("handler", 5, move |kernel| {
        fired2.lock().unwrap().push(kernel.counter_value(c).unwrap());
        kernel.terminate_task().unwrap();
    })
    .max_activations(8)
    .finish(&mut cfg);

    let a = AlarmDef::new("a", c, Action::ActivateTask(handler)).finish(&mut cfg);

    TaskDef::new("driver", 1, move |kernel| {
        kernel.set_rel_alarm(a, 3, 0).unwrap();
        for _ in 0..6 {
            kernel.increment_counter(c).unwrap();
        }
        kernel.shutdown(Ok(()));
    })
    .auto_start()
    .finish(&mut cfg);

    let kernel = Kernel::new(cfg).unwrap();
    kernel.start().unwrap();
    assert_eq!(*fired.lock().unwrap(), [3]);
}

#[test]
fn cyclic_alarm_fires_each_period_until_canceled() {
    init();
    let fired: Trace = Arc::new(Mutex::new(Vec::new()));
    let mut cfg = Cfg::new();
    let c = CounterDef::new("c", 999).finish(&mut cfg);

    let fired2 = Arc::clone(&fired);
    let handler = TaskDef::new("handler", 5, move |kernel| {
        fired2.lock().unwrap().push(kernel.counter_value(c).unwrap());
        kernel.terminate_task().unwrap();
    })
    .max_activations(8)
    .finish(&mut cfg);

    let a = AlarmDef::new("a", c, Action::ActivateTask(handler)).finish(&mut cfg);

    TaskDef::new("driver", 1, move |kernel| {
        kernel.set_rel_alarm(a, 2, 3).unwrap();
        for _ in 0..9 {
            kernel.increment_counter(c).unwrap();
        }
        kernel.cancel_alarm(a).unwrap();
        for _ in 0..6 {
            kernel.increment_counter(c).unwrap();
        }
        kernel.shutdown(Ok(()));
    })
    .auto_start()
    .finish(&mut cfg);

    let kernel = Kernel::new(cfg).unwrap();
    kernel.start().unwrap();
    assert_eq!(*fired.lock().unwrap(), [2, 5, 8]);
}

#[test]
fn autostarted_alarm_needs_no_service_call() {
    init();
    let count = Arc::new(AtomicU32::new(0));
    let mut cfg = Cfg::new();
    let c = CounterDef::new("c", 999).finish(&mut cfg);

    let count2 = Arc::clone(&count);
    let handler = TaskDef::new("handler", 5, move |kernel| {
        count2.fetch_add(1, Ordering::Relaxed);
        kernel.terminate_task().unwrap();
    })
    .max_activations(8)
    .finish(&mut cfg);

    AlarmDef::new("a", c, Action::ActivateTask(handler))
        .auto_start_rel(2, 2)
        .finish(&mut cfg);

    TaskDef::new("driver", 1, move |kernel| {
        for _ in 0..6 {
            kernel.increment_counter(c).unwrap();
        }
        kernel.shutdown(Ok(()));
    })
    .auto_start()
    .finish(&mut cfg);

    let kernel = Kernel::new(cfg).unwrap();
    kernel.start().unwrap();
    // Fired at 2, 4 and 6
    assert_eq!(count.load(Ordering::Relaxed), 3);
}

#[test]
fn schedule_table_rounds_follow_the_counter() {
    init();
    let a_fired: Trace = Arc::new(Mutex::new(Vec::new()));
    let b_fired: Trace = Arc::new(Mutex::new(Vec::new()));
    let mut cfg = Cfg::new();
    let c = CounterDef::new("c", 999).finish(&mut cfg);

    let trace = Arc::clone(&a_fired);
    let a = TaskDef::new("a", 5, move |kernel| {
        trace.lock().unwrap().push(kernel.counter_value(c).unwrap());
        kernel.terminate_task().unwrap();
    })
    .max_activations(8)
    .finish(&mut cfg);

    let trace = Arc::clone(&b_fired);
    let b = TaskDef::new("b", 6, move |kernel| {
        trace.lock().unwrap().push(kernel.counter_value(c).unwrap());
        kernel.terminate_task().unwrap();
    })
    .max_activations(8)
    .finish(&mut cfg);

    let st = ScheduleTableDef::new("st", c, 5)
        .entry(2, Action::ActivateTask(a))
        .entry(4, Action::ActivateTask(b))
        .repeating()
        .finish(&mut cfg);

    TaskDef::new("driver", 1, move |kernel| {
        kernel.start_table_rel(st, 1).unwrap();
        assert_eq!(kernel.table_status(st), Ok(TableStatus::Waiting));
        for _ in 0..12 {
            kernel.increment_counter(c).unwrap();
        }
        assert_eq!(kernel.table_status(st), Ok(TableStatus::Running));
        kernel.stop_table(st).unwrap();
        assert_eq!(kernel.table_status(st), Ok(TableStatus::Stopped));
        kernel.shutdown(Ok(()));
    })
    .auto_start()
    .finish(&mut cfg);

    let kernel = Kernel::new(cfg).unwrap();
    kernel.start().unwrap();
    // Base 1: entry offsets 2 and 4 land on 3/5, then 8/10 in the next round.
    assert_eq!(*a_fired.lock().unwrap(), [3, 8]);
    assert_eq!(*b_fired.lock().unwrap(), [5, 10]);
}

#[test]
fn synchronized_table_fires_every_offset_of_the_round() {
    init();
    let count = Arc::new(AtomicU32::new(0));
    let mut cfg = Cfg::new();
    let c = CounterDef::new("c", 999).finish(&mut cfg);

    let count2 = Arc::clone(&count);
    let x = TaskDef::new("x", 5, move |kernel| {
        count2.fetch_add(1, Ordering::Relaxed);
        kernel.terminate_task().unwrap();
    })
    .max_activations(4)
    .finish(&mut cfg);

    let st = ScheduleTableDef::new("st", c, 3)
        .entry(1, Action::ActivateTask(x))
        .entry(2, Action::ActivateTask(x))
        .entry(3, Action::ActivateTask(x))
        .repeating()
        .finish(&mut cfg);

    let count2 = Arc::clone(&count);
    TaskDef::new("driver", 1, move |kernel| {
        kernel.start_table_sync(st).unwrap();
        assert_eq!(kernel.table_status(st), Ok(TableStatus::Waiting));
        kernel.sync_table(st, 0).unwrap();
        for _ in 0..3 {
            kernel.increment_counter(c).unwrap();
            assert_eq!(kernel.table_status(st), Ok(TableStatus::RunningSynchronous));
        }
        assert_eq!(count2.load(Ordering::Relaxed), 3);
        kernel.shutdown(Ok(()));
    })
    .auto_start()
    .finish(&mut cfg);

    let kernel = Kernel::new(cfg).unwrap();
    kernel.start().unwrap();
    assert_eq!(count.load(Ordering::Relaxed), 3);
}

#[test]
fn a_callback_may_cancel_a_sibling_point_due_on_the_same_tick() {
    init();
    let count = Arc::new(AtomicU32::new(0));
    let mut cfg = Cfg::new();
    let c = CounterDef::new("c", 999).finish(&mut cfg);

    let count2 = Arc::clone(&count);
    let handler = TaskDef::new("handler", 5, move |kernel| {
        count2.fetch_add(1, Ordering::Relaxed);
        kernel.terminate_task().unwrap();
    })
    .max_activations(8)
    .finish(&mut cfg);

    let victim = AlarmDef::new("victim", c, Action::ActivateTask(handler)).finish(&mut cfg);
    let canceler = AlarmDef::new(
        "canceler",
        c,
        Action::Callback(Arc::new(move |kernel| {
            kernel.cancel_alarm(victim).unwrap();
        })),
    )
    .finish(&mut cfg);

    TaskDef::new("driver", 1, move |kernel| {
        // Armed first, so the canceler fires first on the shared tick.
        kernel.set_rel_alarm(canceler, 2, 0).unwrap();
        kernel.set_rel_alarm(victim, 2, 0).unwrap();
        for _ in 0..4 {
            kernel.increment_counter(c).unwrap();
        }
        kernel.shutdown(Ok(()));
    })
    .auto_start()
    .finish(&mut cfg);

    let kernel = Kernel::new(cfg).unwrap();
    kernel.start().unwrap();
    assert_eq!(count.load(Ordering::Relaxed), 0);
}

#[test]
fn callback_and_counter_chaining_actions() {
    init();
    let fired: Trace = Arc::new(Mutex::new(Vec::new()));
    let cb_count = Arc::new(AtomicU32::new(0));
    let mut cfg = Cfg::new();
    let c1 = CounterDef::new("c1", 999).finish(&mut cfg);
    let c2 = CounterDef::new("c2", 999).finish(&mut cfg);

    let fired2 = Arc::clone(&fired);
    let handler = TaskDef::new("handler", 5, move |kernel| {
        fired2.lock().unwrap().push(kernel.counter_value(c1).unwrap());
        kernel.terminate_task().unwrap();
    })
    .max_activations(8)
    .finish(&mut cfg);

    // a1 forwards every second tick of c1 into c2, a2 reacts on c2.
    let a1 = AlarmDef::new("a1", c1, Action::IncrementCounter(c2)).finish(&mut cfg);
    let a2 = AlarmDef::new("a2", c2, Action::ActivateTask(handler)).finish(&mut cfg);
    let cb_count2 = Arc::clone(&cb_count);
    let a3 = AlarmDef::new(
        "a3",
        c1,
        Action::Callback(Arc::new(move |_| {
            cb_count2.fetch_add(1, Ordering::Relaxed);
        })),
    )
    .finish(&mut cfg);

    TaskDef::new("driver", 1, move |kernel| {
        kernel.set_rel_alarm(a1, 2, 2).unwrap();
        kernel.set_rel_alarm(a2, 1, 0).unwrap();
        kernel.set_rel_alarm(a3, 3, 0).unwrap();
        for _ in 0..4 {
            kernel.increment_counter(c1).unwrap();
        }
        assert_eq!(kernel.counter_value(c2), Ok(2));
        kernel.shutdown(Ok(()));
    })
    .auto_start()
    .finish(&mut cfg);

    let kernel = Kernel::new(cfg).unwrap();
    kernel.start().unwrap();
    // c2 reached 1 inside the expiry pass of c1's second tick.
    assert_eq!(*fired.lock().unwrap(), [2]);
    assert_eq!(cb_count.load(Ordering::Relaxed), 1);
}
