//! Accept-mutex behaviour: an overloaded worker sits out of contention,
//! decrementing its overload counter once per loop iteration, while an
//! idle worker acquires the mutex and takes the connections.

mod common;

use std::io::Read;

use common::{basic_config, temp_root};
use server_core::{Hooks, Runtime, Worker};

fn mutex_runtime(root: &str) -> std::sync::Arc<Runtime> {
    let mut config = basic_config(root, vec![]);
    // More than one worker arms the accept mutex.
    config.worker_threads = 2;
    config.events.accept_mutex = true;
    config.events.accept_mutex_delay_ms = 10;
    Runtime::build_with(config, Hooks::default()).expect("runtime builds")
}

#[test]
fn overloaded_worker_decrements_once_per_iteration() {
    let root = temp_root("mutex-overload");
    let rt = mutex_runtime(root.to_str().unwrap());
    let mut worker = Worker::new(std::sync::Arc::clone(&rt), 0).expect("worker");

    worker.accept_disabled = 3;
    for expected in [2i64, 1, 0] {
        worker.process_events_and_timers().expect("iteration");
        assert_eq!(
            worker.accept_disabled, expected,
            "exactly one decrement per loop iteration"
        );
        assert!(
            !rt.accept_mutex.is_locked(),
            "an overloaded worker never contends for the mutex"
        );
    }
    rt.shutdown();
}

#[test]
fn idle_worker_acquires_and_accepts() {
    let root = temp_root("mutex-idle");
    std::fs::write(root.join("ok.txt"), "accepted").unwrap();
    let rt = mutex_runtime(root.to_str().unwrap());
    let addr = rt.listeners[0].bound.local_addr();

    // A sibling holds positive overload: it must not take the listener.
    let mut busy = Worker::new(std::sync::Arc::clone(&rt), 1).expect("busy worker");
    busy.accept_disabled = 1_000;

    let rt_clone = std::sync::Arc::clone(&rt);
    let handle = std::thread::spawn(move || {
        let mut idle = Worker::new(rt_clone, 0).expect("idle worker");
        while !idle.rt.stopping() {
            idle.process_events_and_timers().expect("iteration");
        }
    });
    std::thread::sleep(std::time::Duration::from_millis(200));

    let mut client = common::Client::connect(&addr);
    client.send("GET /ok.txt HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    let mut response = Vec::new();
    let _ = client.stream.read_to_end(&mut response);
    let response = String::from_utf8_lossy(&response);
    assert!(response.contains("accepted"), "idle worker served: {response}");

    // The busy worker only ever burned its overload counter.
    busy.process_events_and_timers().expect("iteration");
    assert_eq!(busy.accept_disabled, 999);

    rt.shutdown();
    handle.join().expect("idle worker exits");
}
