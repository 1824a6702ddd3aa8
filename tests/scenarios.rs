//! End-to-end scenarios driven entirely through the public syscall surface
//! (`kipc::syscall::sys_*`) rather than white-box engine internals,
//! exercising the system the way a userspace caller would.

use std::thread;
use std::time::{Duration, Instant};

use kipc::syscall::*;
use kipc::Process;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Scenario 1: pipe contiguous writes.
#[test]
fn scenario_pipe_contiguous_writes() {
    init_logging();
    let process = Process::new();

    let mut ids = (0, 0);
    assert_eq!(sys_pipe(&process, &mut ids), 0);
    let (reader, writer) = ids;

    assert_eq!(sys_write(&process, writer, b"HELLO "), 6);
    assert_eq!(sys_write(&process, writer, b"WORLD"), 5);

    let mut buf = [0u8; 11];
    assert_eq!(sys_read(&process, reader, &mut buf), 11);
    assert_eq!(&buf, b"HELLO WORLD");
}

/// Scenario 2: pipe blocking until the reader drains a byte.
#[test]
fn scenario_pipe_blocking() {
    init_logging();
    let process = Process::new();

    let mut ids = (0, 0);
    assert_eq!(sys_pipe(&process, &mut ids), 0);
    let (reader, writer) = ids;

    let capacity = kipc::PIPE_BUFFER_SIZE;
    let full = vec![b'A'; capacity];
    assert_eq!(sys_write(&process, writer, &full), capacity as i32);

    let writer_process = process.clone();
    let blocked_write = thread::spawn(move || sys_write(&writer_process, writer, b"B"));

    thread::sleep(Duration::from_millis(50));

    let mut one = [0u8; 1];
    assert_eq!(sys_read(&process, reader, &mut one), 1);
    assert_eq!(one[0], b'A');

    assert_eq!(blocked_write.join().unwrap(), 1);

    let mut rest = vec![0u8; capacity];
    assert_eq!(sys_read(&process, reader, &mut rest), capacity as i32);
    assert!(rest[..capacity - 1].iter().all(|&b| b == b'A'));
    assert_eq!(rest[capacity - 1], b'B');
}

/// Scenario 3: pipe EOF and destruction on double close.
#[test]
fn scenario_pipe_eof() {
    init_logging();
    let process = Process::new();

    let mut ids = (0, 0);
    assert_eq!(sys_pipe(&process, &mut ids), 0);
    let (reader, writer) = ids;

    assert_eq!(sys_write(&process, writer, b"xyz"), 3);
    assert_eq!(sys_close(&process, writer), 0);

    let mut buf = [0u8; 10];
    assert_eq!(sys_read(&process, reader, &mut buf), 3);
    assert_eq!(&buf[..3], b"xyz");
    assert_eq!(sys_read(&process, reader, &mut buf), 0);

    assert_eq!(sys_close(&process, reader), 0);
}

/// Scenario 4: socket connect/accept rendezvous, then a full duplex
/// exchange in both directions.
#[test]
fn scenario_socket_rendezvous() {
    init_logging();
    let process = Process::new();

    let listener = sys_socket(&process, 10);
    assert!(listener >= 0);
    assert_eq!(sys_listen(&process, listener), 0);

    let connector_process = process.clone();
    let connector = thread::spawn(move || {
        let t = sys_socket(&connector_process, kipc::NOPORT);
        assert!(t >= 0);
        assert_eq!(sys_connect(&connector_process, t, 10, -1), 0);
        t
    });

    // Give the connector a moment to enqueue its request before we accept.
    thread::sleep(Duration::from_millis(20));
    let c = sys_accept(&process, listener);
    assert!(c >= 0);
    let t = connector.join().unwrap();

    assert_eq!(sys_write(&process, c, b"ping"), 4);
    let mut buf = [0u8; 4];
    assert_eq!(sys_read(&process, t, &mut buf), 4);
    assert_eq!(&buf, b"ping");

    assert_eq!(sys_write(&process, t, b"pong"), 4);
    let mut buf2 = [0u8; 4];
    assert_eq!(sys_read(&process, c, &mut buf2), 4);
    assert_eq!(&buf2, b"pong");
}

/// Scenario 5: `Connect` against a listener that never accepts times out
/// after roughly the requested duration.
#[test]
fn scenario_connect_timeout() {
    init_logging();
    let process = Process::new();

    let listener = sys_socket(&process, 10);
    assert_eq!(sys_listen(&process, listener), 0);

    let t = sys_socket(&process, kipc::NOPORT);
    let start = Instant::now();
    assert_eq!(sys_connect(&process, t, 10, 100), -1);
    assert!(start.elapsed() >= Duration::from_millis(100));
}

/// Scenario 6: joining a thread returns its exit value; the tid is gone
/// from the process once the join that drained its refcount completes.
#[test]
fn scenario_thread_join() {
    init_logging();
    let process = Process::new();

    let tid = sys_create_thread(
        &process,
        Box::new(|_arg| {
            thread::sleep(Duration::from_millis(20));
            42
        }),
        Vec::new(),
    );
    assert_ne!(tid, 0);

    let mut exitval = 0;
    assert_eq!(sys_thread_join(&process, tid, &mut exitval), 0);
    assert_eq!(exitval, 42);

    // The PTCB was freed once the join released the last reference; the
    // tid no longer resolves.
    let mut exitval2 = 0;
    assert_eq!(sys_thread_join(&process, tid, &mut exitval2), -1);
}

/// Scenario 7: detach races join in both directions.
#[test]
fn scenario_detach_before_join_fails_fast() {
    init_logging();
    let process = Process::new();

    let tid = sys_create_thread(
        &process,
        Box::new(|_arg| {
            thread::sleep(Duration::from_millis(100));
            7
        }),
        Vec::new(),
    );

    assert_eq!(sys_thread_detach(&process, tid), 0);

    let mut exitval = 0;
    assert_eq!(sys_thread_join(&process, tid, &mut exitval), -1);
}

#[test]
fn scenario_detach_during_join_releases_the_joiner() {
    init_logging();
    let process = Process::new();

    let tid = sys_create_thread(
        &process,
        Box::new(|_arg| {
            thread::sleep(Duration::from_millis(150));
            7
        }),
        Vec::new(),
    );

    let joiner_process = process.clone();
    let joiner = thread::spawn(move || {
        let mut exitval = 0;
        sys_thread_join(&joiner_process, tid, &mut exitval)
    });

    thread::sleep(Duration::from_millis(30));
    assert_eq!(sys_thread_detach(&process, tid), 0);

    assert_eq!(joiner.join().unwrap(), -1);
}
