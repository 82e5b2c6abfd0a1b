//! End-to-end tests driving a real worker child process.
//!
//! These spawn the bundled `taskutil-worker` binary and exercise the full
//! round trip: spawn, connect, evaluate, fail, crash, close.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use taskutil::test_utils::init_test_logging;
use taskutil::worker::{Worker, WorkerErrorKind, WorkerOptions};
use taskutil::{test_complete, test_phase};

fn init_test(name: &str) {
    init_test_logging();
    test_phase!(name);
}

fn worker_options() -> WorkerOptions {
    WorkerOptions::new(env!("CARGO_BIN_EXE_taskutil-worker"))
        .connect_timeout(Duration::from_secs(30))
}

fn spawn_worker() -> Worker {
    worker_options().spawn().expect("spawn worker")
}

#[test]
fn round_trip_evaluates_expressions() {
    init_test("round_trip_evaluates_expressions");
    let worker = spawn_worker();

    let value = worker.remote_fetch("Main", "1+2").expect("eval 1+2");
    assert_eq!(value, json!(3));

    let value = worker.remote_fetch("Main", "(6 - 2) * 10").expect("eval nested");
    assert_eq!(value, json!(40));

    worker.close();
    assert!(worker.is_terminated());
    test_complete!("round_trip_evaluates_expressions");
}

#[test]
fn child_errors_carry_message_and_backtrace() {
    init_test("child_errors_carry_message_and_backtrace");
    let worker = spawn_worker();

    let err = worker
        .remote_fetch("Main", r#"error("oops")"#)
        .expect_err("error() must fail");
    assert_eq!(err.kind(), WorkerErrorKind::Eval);

    let eval_err = err.eval_error().expect("eval error payload missing");
    assert_eq!(eval_err.message(), "oops");
    assert!(
        !eval_err.backtrace().is_empty(),
        "child-side backtrace must travel with the error"
    );

    // The worker survives evaluation failures.
    assert_eq!(worker.remote_fetch("Main", "2+2").expect("eval after error"), json!(4));
    worker.close();
    test_complete!("child_errors_carry_message_and_backtrace");
}

#[test]
fn concurrent_evaluations_pair_by_id() {
    init_test("concurrent_evaluations_pair_by_id");
    let worker = Arc::new(spawn_worker());

    let handles: Vec<_> = (0_i64..8)
        .map(|i| {
            let worker = Arc::clone(&worker);
            std::thread::spawn(move || {
                let value = worker
                    .remote_fetch("Main", &format!("{i} * {i}"))
                    .expect("concurrent eval");
                assert_eq!(value, json!(i * i));
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("eval thread panicked");
    }

    worker.close();
    test_complete!("concurrent_evaluations_pair_by_id");
}

#[test]
fn multiple_in_flight_requests_each_get_their_answer() {
    init_test("multiple_in_flight_requests_each_get_their_answer");
    let worker = spawn_worker();

    // Two requests in flight at once; each future is paired with its own
    // response by id.
    let slow = worker.remote_eval("Main", "sleep(150)");
    let fast = worker.remote_eval("Main", "5+5");

    assert_eq!(fast.fetch().expect("fast eval"), json!(10));
    assert_eq!(slow.fetch().expect("slow eval"), serde_json::Value::Null);

    worker.close();
    test_complete!("multiple_in_flight_requests_each_get_their_answer");
}

#[test]
fn child_crash_cancels_in_flight_futures() {
    init_test("child_crash_cancels_in_flight_futures");
    let worker = spawn_worker();

    let doomed = worker.remote_eval("Main", "abort()");
    let err = doomed.fetch().expect_err("abort must cancel the future");
    assert!(err.is_terminated(), "expected Terminated, got {err}");

    worker.wait();
    assert!(worker.is_terminated());

    // Evaluations after the crash fail fast.
    let late = worker
        .remote_fetch("Main", "1+1")
        .expect_err("worker is gone");
    assert!(late.is_terminated());
    test_complete!("child_crash_cancels_in_flight_futures");
}

#[test]
fn terminate_cancels_pending_work() {
    init_test("terminate_cancels_pending_work");
    let worker = spawn_worker();

    let pending = worker.remote_eval("Main", "sleep(10000)");
    // Give the request time to reach the child.
    std::thread::sleep(Duration::from_millis(50));

    assert!(worker.terminate(), "first terminate wins the flag");
    assert!(!worker.terminate(), "second terminate is a no-op");
    assert!(worker.is_terminated());

    let err = pending.fetch().expect_err("pending future must be cancelled");
    assert!(err.is_terminated());

    worker.wait();
    test_complete!("terminate_cancels_pending_work");
}

#[test]
fn child_output_reaches_the_sink() {
    init_test("child_output_reaches_the_sink");

    let lines = Arc::new(Mutex::new(Vec::<String>::new()));
    let worker = {
        let lines = Arc::clone(&lines);
        worker_options()
            .output_sink(move |line| lines.lock().unwrap().push(line.to_string()))
            .spawn()
            .expect("spawn worker")
    };

    assert_eq!(worker.remote_fetch("Main", "1+1").expect("eval"), json!(2));
    worker.close();

    // close() joins the redirector threads, so everything the child logged
    // has been forwarded by now.
    let lines = lines.lock().unwrap();
    assert!(
        lines.iter().any(|line| line.contains("connected")),
        "expected the child's startup log line, got {lines:?}"
    );
    test_complete!("child_output_reaches_the_sink");
}

#[test]
fn dropping_a_live_worker_terminates_the_child() {
    init_test("dropping_a_live_worker_terminates_the_child");
    let worker = spawn_worker();
    assert_eq!(worker.remote_fetch("Main", "3*3").expect("eval"), json!(9));
    // No close, no terminate: drop alone must tear the worker down without
    // hanging this test or leaving the child behind.
    drop(worker);
    test_complete!("dropping_a_live_worker_terminates_the_child");
}
