//! A process: one stream descriptor table, one port table, and the list of
//! user threads running inside it. Everything above the scheduler
//! interface — process creation, the parent/child reaping tree — is an
//! external collaborator this crate does not model; `Process` only carries
//! the state `CreateThread`/`ThreadJoin`/`ThreadDetach`/`ThreadExit` and the
//! IPC calls actually touch.

use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::error::{IpcError, KResult};
use crate::fcb::StreamTable;
use crate::ipc::pipe;
use crate::ipc::socket::{self, PortTable, ShutdownHow};
use crate::task::ptcb::Ptcb;

/// A task's argument blob plus its entry point, the idiomatic stand-in for
/// the contract's `(task function, argument-length, argument pointer)`
/// triple — a `Vec<u8>` already carries its own length.
pub type ThreadFn = Box<dyn FnOnce(Vec<u8>) -> i32 + Send + 'static>;

struct ThreadContext {
    process: Arc<Process>,
    ptcb: Arc<Ptcb>,
}

thread_local! {
    static CURRENT: RefCell<Option<ThreadContext>> = const { RefCell::new(None) };
}

pub struct Process {
    pub(crate) streams: StreamTable,
    pub(crate) ports: Arc<PortTable>,
    threads: Mutex<Vec<Arc<Ptcb>>>,
    thread_count: AtomicUsize,
}

impl Process {
    pub fn new() -> Arc<Self> {
        Arc::new(Process {
            streams: StreamTable::new(),
            ports: Arc::new(PortTable::new()),
            threads: Mutex::new(Vec::new()),
            thread_count: AtomicUsize::new(0),
        })
    }

    // ---- stream descriptors -------------------------------------------

    pub fn pipe(&self) -> KResult<(i32, i32)> {
        pipe::make_pipe(&self.streams)
    }

    pub fn read(&self, id: i32, buf: &mut [u8]) -> KResult<usize> {
        self.streams.get(id)?.ops().read(buf)
    }

    pub fn write(&self, id: i32, buf: &[u8]) -> KResult<usize> {
        self.streams.get(id)?.ops().write(buf)
    }

    pub fn close(&self, id: i32) -> KResult<()> {
        self.streams.close(id)
    }

    // ---- sockets --------------------------------------------------------

    pub fn socket(self: &Arc<Self>, port: u16) -> KResult<i32> {
        socket::socket(&self.streams, &self.ports, port)
    }

    pub fn listen(&self, id: i32) -> KResult<()> {
        socket::listen(&self.streams, &self.ports, id)
    }

    pub fn accept(self: &Arc<Self>, id: i32) -> KResult<i32> {
        socket::accept(&self.streams, &self.ports, id)
    }

    pub fn connect(&self, id: i32, port: u16, timeout: Option<Duration>) -> KResult<()> {
        socket::connect(&self.streams, &self.ports, id, port, timeout)
    }

    pub fn shutdown(&self, id: i32, how: ShutdownHow) -> KResult<()> {
        socket::shutdown(&self.streams, id, how)
    }

    // ---- user threads ---------------------------------------------------

    /// `CreateThread(task, argl, args)`.
    pub fn create_thread(self: &Arc<Self>, task: ThreadFn, arg: Vec<u8>) -> u64 {
        let ptcb = Arc::new(Ptcb::new());
        let tid = ptcb.tid;

        self.threads.lock().unwrap().push(ptcb.clone());
        self.thread_count.fetch_add(1, Ordering::AcqRel);

        let process = self.clone();
        let ptcb_for_thread = ptcb.clone();
        thread::Builder::new()
            .name(format!("utid-{tid}"))
            .spawn(move || {
                CURRENT.with(|c| {
                    *c.borrow_mut() = Some(ThreadContext {
                        process: process.clone(),
                        ptcb: ptcb_for_thread,
                    })
                });
                let exitval = task(arg);
                process.thread_exit(exitval);
            })
            .expect("failed to spawn a host OS thread for a user thread");

        tid
    }

    /// `ThreadSelf()`. A caller running outside any thread `create_thread`
    /// spawned (the process's own entry thread) is identified as tid 0,
    /// which `allocate_tid` never hands out to a real PTCB.
    pub fn thread_self(&self) -> u64 {
        CURRENT.with(|c| c.borrow().as_ref().map(|ctx| ctx.ptcb.tid).unwrap_or(0))
    }

    fn find(&self, tid: u64) -> Option<Arc<Ptcb>> {
        self.threads.lock().unwrap().iter().find(|p| p.tid == tid).cloned()
    }

    /// `ThreadJoin(tid, &exitval)`.
    pub fn thread_join(&self, tid: u64) -> KResult<i32> {
        if tid == 0 || tid == self.thread_self() {
            return Err(IpcError::BadArgument);
        }
        let target = self.find(tid).ok_or(IpcError::BadArgument)?;
        if target.exited.load(Ordering::Acquire) || target.detached.load(Ordering::Acquire) {
            return Err(IpcError::WrongState);
        }

        target.refcount.fetch_add(1, Ordering::AcqRel);

        let mut guard = target.exitval.lock().unwrap();
        while !target.exited.load(Ordering::Acquire) && !target.detached.load(Ordering::Acquire) {
            guard = target.exit_cv.wait(guard, crate::sched::Cause::Join);
        }
        let exited = target.exited.load(Ordering::Acquire);
        let exitval = *guard;
        drop(guard);

        let remaining = target.refcount.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 && exited {
            self.threads.lock().unwrap().retain(|p| p.tid != tid);
        }

        if exited {
            Ok(exitval)
        } else {
            Err(IpcError::WrongState)
        }
    }

    /// `ThreadDetach(tid)`.
    pub fn thread_detach(&self, tid: u64) -> KResult<()> {
        let target = self.find(tid).ok_or(IpcError::BadArgument)?;
        if target.exited.load(Ordering::Acquire) {
            return Err(IpcError::WrongState);
        }
        let guard = target.exitval.lock().unwrap();
        target.detached.store(true, Ordering::Release);
        target.exit_cv.broadcast();
        drop(guard);
        Ok(())
    }

    /// `ThreadExit(exitval)`. Called automatically by the trampoline
    /// `create_thread` installs; never invoked directly by a caller.
    fn thread_exit(self: Arc<Self>, exitval: i32) {
        let ptcb = CURRENT.with(|c| c.borrow().as_ref().unwrap().ptcb.clone());

        self.thread_count.fetch_sub(1, Ordering::AcqRel);

        {
            let mut guard = ptcb.exitval.lock().unwrap();
            *guard = exitval;
            ptcb.exited.store(true, Ordering::Release);
            ptcb.exit_cv.broadcast();
        }

        let remaining = ptcb.refcount.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 {
            self.threads.lock().unwrap().retain(|p| p.tid != ptcb.tid);
        }

        if self.thread_count.load(Ordering::Acquire) == 0 {
            log::debug!("last thread of process exited, releasing its stream table");
            self.streams.close_all();
        }
    }
}
