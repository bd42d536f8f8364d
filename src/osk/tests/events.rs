//! Task event services on a running kernel.
use std::sync::{Arc, Mutex};

use osk::{Cfg, Error, Kernel, ResourceDef, TaskDef};

type Log = Arc<Mutex<Vec<&'static str>>>;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn waiting_task_is_woken_by_set_event() {
    init();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let mut cfg = Cfg::new();

    let log2 = Arc::clone(&log);
    let waiter = TaskDef::new("waiter", 5, move |kernel| {
        log2.lock().unwrap().push("wait");
        kernel.wait_event(0b1).unwrap();
        assert_eq!(kernel.get_event(kernel.current_task().unwrap()), Ok(0b1));
        log2.lock().unwrap().push("woken");
        kernel.terminate_task().unwrap();
    })
    .auto_start()
    .finish(&mut cfg);

    let log2 = Arc::clone(&log);
    TaskDef::new("setter", 2, move |kernel| {
        log2.lock().unwrap().push("set");
        kernel.set_event(waiter, 0b1).unwrap();
        log2.lock().unwrap().push("done");
        kernel.shutdown(Ok(()));
    })
    .auto_start()
    .finish(&mut cfg);

    let kernel = Kernel::new(cfg).unwrap();
    kernel.start().unwrap();
    assert_eq!(*log.lock().unwrap(), ["wait", "set", "woken", "done"]);
}

#[test]
fn wait_returns_immediately_when_already_set() {
    init();
    let mut cfg = Cfg::new();
    TaskDef::new("t", 3, |kernel| {
        let me = kernel.current_task().unwrap();
        kernel.set_event(me, 0b10).unwrap();
        kernel.wait_event(0b110).unwrap();
        assert_eq!(kernel.get_event(me), Ok(0b10));
        kernel.clear_event(0b10).unwrap();
        assert_eq!(kernel.get_event(me), Ok(0));
        kernel.shutdown(Ok(()));
    })
    .auto_start()
    .finish(&mut cfg);

    let kernel = Kernel::new(cfg).unwrap();
    kernel.start().unwrap();
}

#[test]
fn set_event_on_a_suspended_task_is_a_state_error() {
    init();
    let mut cfg = Cfg::new();
    let t = TaskDef::new("t", 3, |_| {}).finish(&mut cfg);
    let kernel = Kernel::new(cfg).unwrap();
    assert_eq!(kernel.set_event(t, 0b1), Err(Error::State));
}

#[test]
fn waiting_is_rejected_with_a_resource_held_or_an_empty_mask() {
    init();
    let mut cfg = Cfg::new();
    let r = ResourceDef::new("r").finish(&mut cfg);
    TaskDef::new("t", 3, move |kernel| {
        assert_eq!(kernel.wait_event(0), Err(Error::Value));
        kernel.get_resource(r).unwrap();
        assert_eq!(kernel.wait_event(0b1), Err(Error::Resource));
        kernel.release_resource(r).unwrap();
        kernel.shutdown(Ok(()));
    })
    .resource(r)
    .auto_start()
    .finish(&mut cfg);

    let kernel = Kernel::new(cfg).unwrap();
    kernel.start().unwrap();
}
