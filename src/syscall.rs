//! The literal system-call surface: every operation here takes the inputs
//! and returns the 0/-1/id contract documented for the external
//! interfaces, translating the internal `KResult<T>` engine calls at the
//! boundary. Nothing above this module ever sees a raw integer error code.

use std::sync::Arc;
use std::time::Duration;

use crate::fcb::NOFILE;
use crate::ipc::socket::ShutdownHow;
use crate::process::{Process, ThreadFn};

/// `Pipe(pipe_pair)`: writes the two descriptor IDs through `out` and
/// returns 0, or returns -1 on exhaustion without touching `out`.
pub fn sys_pipe(process: &Process, out: &mut (i32, i32)) -> i32 {
    match process.pipe() {
        Ok(ids) => {
            *out = ids;
            0
        }
        Err(e) => {
            log::warn!("Pipe failed: {e}");
            -1
        }
    }
}

/// `Socket(port)`.
pub fn sys_socket(process: &Arc<Process>, port: u16) -> i32 {
    process.socket(port).unwrap_or_else(|e| {
        log::warn!("Socket({port}) failed: {e}");
        NOFILE
    })
}

/// `Listen(id)`.
pub fn sys_listen(process: &Process, id: i32) -> i32 {
    ok_or_fail(process.listen(id))
}

/// `Accept(id)`.
pub fn sys_accept(process: &Arc<Process>, id: i32) -> i32 {
    process.accept(id).unwrap_or_else(|e| {
        log::warn!("Accept({id}) failed: {e}");
        NOFILE
    })
}

/// `Connect(id, port, timeout_ms)`. A negative `timeout_ms` means
/// unbounded, matching the contract's `timeout < 0`.
pub fn sys_connect(process: &Process, id: i32, port: u16, timeout_ms: i64) -> i32 {
    let timeout = if timeout_ms < 0 {
        None
    } else {
        Some(Duration::from_millis(timeout_ms as u64))
    };
    ok_or_fail(process.connect(id, port, timeout))
}

/// `ShutDown(id, how)`. `how`: 0 = READ, 1 = WRITE, 2 = BOTH.
pub fn sys_shutdown(process: &Process, id: i32, how: i32) -> i32 {
    let how = match how {
        0 => ShutdownHow::Read,
        1 => ShutdownHow::Write,
        2 => ShutdownHow::Both,
        _ => {
            log::warn!("ShutDown({id}, {how}) rejected: illegal direction");
            return -1;
        }
    };
    ok_or_fail(process.shutdown(id, how))
}

/// `Read(id, buf, n)`.
pub fn sys_read(process: &Process, id: i32, buf: &mut [u8]) -> i32 {
    match process.read(id, buf) {
        Ok(n) => n as i32,
        Err(e) => {
            log::warn!("Read({id}) failed: {e}");
            -1
        }
    }
}

/// `Write(id, buf, n)`.
pub fn sys_write(process: &Process, id: i32, buf: &[u8]) -> i32 {
    match process.write(id, buf) {
        Ok(n) => n as i32,
        Err(e) => {
            log::warn!("Write({id}) failed: {e}");
            -1
        }
    }
}

/// `Close(id)`.
pub fn sys_close(process: &Process, id: i32) -> i32 {
    ok_or_fail(process.close(id))
}

/// `CreateThread(task, argl, args)`. Returns the tid, or 0 on resource
/// failure — `create_thread` never fails in this implementation since host
/// thread spawn failure is treated as fatal (mirrors the contract's "0 on
/// resource failure" without a distinct resource-exhaustion path of its
/// own to report).
pub fn sys_create_thread(process: &Arc<Process>, task: ThreadFn, arg: Vec<u8>) -> u64 {
    process.create_thread(task, arg)
}

/// `ThreadSelf()`.
pub fn sys_thread_self(process: &Process) -> u64 {
    process.thread_self()
}

/// `ThreadJoin(tid, &exitval)`.
pub fn sys_thread_join(process: &Process, tid: u64, out_exitval: &mut i32) -> i32 {
    match process.thread_join(tid) {
        Ok(v) => {
            *out_exitval = v;
            0
        }
        Err(e) => {
            log::warn!("ThreadJoin({tid}) failed: {e}");
            -1
        }
    }
}

/// `ThreadDetach(tid)`.
pub fn sys_thread_detach(process: &Process, tid: u64) -> i32 {
    ok_or_fail(process.thread_detach(tid))
}

fn ok_or_fail<E: std::fmt::Display>(result: Result<(), E>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            log::warn!("syscall failed: {e}");
            -1
        }
    }
}
