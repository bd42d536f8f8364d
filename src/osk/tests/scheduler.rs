//! End-to-end scheduling behavior on a running kernel.
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
};

use osk::{Cfg, Error, Kernel, ResourceDef, TaskDef, TaskState};

type Log = Arc<Mutex<Vec<&'static str>>>;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn new_log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

#[test]
fn higher_priority_autostart_runs_first() {
    init();
    let log = new_log();
    let mut cfg = Cfg::new();

    let log2 = Arc::clone(&log);
    TaskDef::new("lo", 2, move |kernel| {
        log2.lock().unwrap().push("lo");
        kernel.shutdown(Ok(()));
    })
    .auto_start()
    .finish(&mut cfg);

    let log2 = Arc::clone(&log);
    TaskDef::new("hi", 5, move |kernel| {
        log2.lock().unwrap().push("hi");
        kernel.terminate_task().unwrap();
    })
    .auto_start()
    .finish(&mut cfg);

    let kernel = Kernel::new(cfg).unwrap();
    kernel.start().unwrap();
    assert_eq!(*log.lock().unwrap(), ["hi", "lo"]);
}

#[test]
fn activation_preempts_a_lower_priority_caller() {
    init();
    let log = new_log();
    let mut cfg = Cfg::new();

    let log2 = Arc::clone(&log);
    let hi = TaskDef::new("hi", 5, move |kernel| {
        log2.lock().unwrap().push("hi");
        kernel.terminate_task().unwrap();
    })
    .finish(&mut cfg);

    let log2 = Arc::clone(&log);
    TaskDef::new("lo", 2, move |kernel| {
        log2.lock().unwrap().push("lo:begin");
        kernel.activate_task(hi).unwrap();
        log2.lock().unwrap().push("lo:end");
        kernel.shutdown(Ok(()));
    })
    .auto_start()
    .finish(&mut cfg);

    let kernel = Kernel::new(cfg).unwrap();
    kernel.start().unwrap();
    assert_eq!(*log.lock().unwrap(), ["lo:begin", "hi", "lo:end"]);
}

#[test]
fn equal_priority_runs_in_activation_order() {
    init();
    let log = new_log();
    let mut cfg = Cfg::new();

    let log2 = Arc::clone(&log);
    TaskDef::new("a", 3, move |kernel| {
        log2.lock().unwrap().push("a");
        kernel.terminate_task().unwrap();
    })
    .auto_start()
    .finish(&mut cfg);

    let log2 = Arc::clone(&log);
    TaskDef::new("b", 3, move |kernel| {
        log2.lock().unwrap().push("b");
        kernel.shutdown(Ok(()));
    })
    .auto_start()
    .finish(&mut cfg);

    let kernel = Kernel::new(cfg).unwrap();
    kernel.start().unwrap();
    assert_eq!(*log.lock().unwrap(), ["a", "b"]);
}

#[test]
fn chain_task_hands_over() {
    init();
    let log = new_log();
    let mut cfg = Cfg::new();

    let log2 = Arc::clone(&log);
    let b = TaskDef::new("b", 3, move |kernel| {
        log2.lock().unwrap().push("b");
        kernel.shutdown(Ok(()));
    })
    .finish(&mut cfg);

    let log2 = Arc::clone(&log);
    TaskDef::new("a", 3, move |kernel| {
        log2.lock().unwrap().push("a");
        let _ = kernel.chain_task(b);
    })
    .auto_start()
    .finish(&mut cfg);

    let kernel = Kernel::new(cfg).unwrap();
    kernel.start().unwrap();
    assert_eq!(*log.lock().unwrap(), ["a", "b"]);
}

#[test]
fn activations_queue_up_to_the_limit() {
    init();
    let runs = Arc::new(AtomicU32::new(0));
    let mut cfg = Cfg::new();

    let runs2 = Arc::clone(&runs);
    TaskDef::new("t", 3, move |kernel| {
        let me = kernel.current_task().unwrap();
        if runs2.fetch_add(1, Ordering::Relaxed) == 0 {
            // One more activation fits; the next exceeds the limit.
            kernel.activate_task(me).unwrap();
            assert_eq!(kernel.activate_task(me), Err(Error::Limit));
            kernel.terminate_task().unwrap();
        } else {
            kernel.shutdown(Ok(()));
        }
    })
    .max_activations(2)
    .auto_start()
    .finish(&mut cfg);

    let kernel = Kernel::new(cfg).unwrap();
    kernel.start().unwrap();
    assert_eq!(runs.load(Ordering::Relaxed), 2);
}

#[test]
fn resource_ceiling_defers_preemption() {
    init();
    let log = new_log();
    let mut cfg = Cfg::new();
    let r = ResourceDef::new("r").finish(&mut cfg);

    let log2 = Arc::clone(&log);
    let hi = TaskDef::new("hi", 5, move |kernel| {
        log2.lock().unwrap().push("hi");
        kernel.terminate_task().unwrap();
    })
    .resource(r)
    .finish(&mut cfg);

    let log2 = Arc::clone(&log);
    TaskDef::new("lo", 2, move |kernel| {
        kernel.get_resource(r).unwrap();
        log2.lock().unwrap().push("lo:locked");
        // The ceiling keeps the activation from taking effect yet.
        kernel.activate_task(hi).unwrap();
        assert_eq!(kernel.get_task_state(hi), Ok(TaskState::Ready));
        log2.lock().unwrap().push("lo:still");
        kernel.release_resource(r).unwrap();
        log2.lock().unwrap().push("lo:end");
        kernel.shutdown(Ok(()));
    })
    .resource(r)
    .auto_start()
    .finish(&mut cfg);

    let kernel = Kernel::new(cfg).unwrap();
    kernel.start().unwrap();
    assert_eq!(
        *log.lock().unwrap(),
        ["lo:locked", "lo:still", "hi", "lo:end"]
    );
}

#[test]
fn returning_without_terminating_is_fatal() {
    init();
    let mut cfg = Cfg::new();
    TaskDef::new("t", 3, |_| {}).auto_start().finish(&mut cfg);
    let kernel = Kernel::new(cfg).unwrap();
    assert_eq!(kernel.start(), Err(Error::MissingEnd));
}

#[test]
fn panic_in_a_task_reaches_the_start_caller() {
    init();
    let mut cfg = Cfg::new();
    TaskDef::new("t", 3, |_| panic!("boom"))
        .auto_start()
        .finish(&mut cfg);
    let kernel = Kernel::new(cfg).unwrap();

    let result = catch_unwind(AssertUnwindSafe(|| kernel.start()));
    let payload = result.expect_err("the panic should propagate");
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"boom"));
}
