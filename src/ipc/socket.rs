//! Socket engine: a connection-oriented rendezvous layer over a fixed-size
//! port table. `Connect` and `Accept` meet through a FIFO queue of
//! connection requests owned by the listener; a successful rendezvous
//! produces a pair of sockets wired to a pair of pipes so each side reads
//! the other's writes.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use spin::Mutex as SpinMutex;

use crate::error::{IpcError, KResult};
use crate::fcb::{StreamOps, StreamTable};
use crate::ipc::pipe::{make_pipe_core, PipeCorePublic};
use crate::sched::{Cause, Cv};

/// Highest legal port number. Ports live in `[1, MAX_PORT]`; `NOPORT` (0) is
/// reserved for "unbound".
pub const MAX_PORT: u16 = 1024;

/// `NOPORT` sentinel from the external-interface table.
pub const NOPORT: u16 = 0;

/// Direction argument to `ShutDown`.
pub enum ShutdownHow {
    Read,
    Write,
    Both,
}

/// A queued handshake between a connector and a listener. Held by `Arc`
/// shared between the listener's request queue and the connector's stack
/// frame; it is freed once both the acceptor (which signals) and the
/// connector (which observes) have dropped their clone — the 2-count
/// lifetime the contract calls for falls out of ordinary `Arc` ownership.
struct ConnRequest {
    requester: Arc<SocketCore>,
    admitted: Mutex<bool>,
    connected_cv: Cv,
}

enum SocketState {
    Unbound { port: u16 },
    Listener { port: u16 },
    Peer {
        read_pipe: Option<Arc<PipeCorePublic>>,
        write_pipe: Option<Arc<PipeCorePublic>>,
    },
}

/// The socket control block. `refcount` mirrors the contract's explicit
/// "increment while an Accept/Connect is in flight against this listener"
/// bookkeeping; it is a pure observability counter here since the object's
/// actual lifetime is already governed by `Arc`'s own strong count.
///
/// `queue` is always present but only ever pushed to while `state` is
/// `Listener`; a lock-free MPSC-friendly queue is the natural fit for a
/// FIFO handed between an arbitrary number of concurrent connectors and one
/// accepting thread.
struct SocketCore {
    state: Mutex<SocketState>,
    queue: SegQueue<Arc<ConnRequest>>,
    req_available: Cv,
    refcount: AtomicUsize,
    closed: AtomicBool,
}

impl SocketCore {
    fn new_unbound(port: u16) -> Arc<Self> {
        Arc::new(SocketCore {
            state: Mutex::new(SocketState::Unbound { port }),
            queue: SegQueue::new(),
            req_available: Cv::new(),
            refcount: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }
}

/// Per-process port table: a fixed-size array of listener slots. Pure
/// bookkeeping with no waits performed while it's held, so a spinlock
/// guards it rather than a parking mutex.
pub(crate) struct PortTable {
    slots: SpinMutex<Vec<Option<Arc<SocketCore>>>>,
}

impl PortTable {
    pub(crate) fn new() -> Self {
        PortTable {
            slots: SpinMutex::new(vec![None; MAX_PORT as usize + 1]),
        }
    }

    fn install(&self, port: u16, core: Arc<SocketCore>) -> KResult<()> {
        let mut slots = self.slots.lock();
        let idx = port as usize;
        if idx == 0 || idx >= slots.len() || slots[idx].is_some() {
            return Err(IpcError::BadArgument);
        }
        slots[idx] = Some(core);
        Ok(())
    }

    fn uninstall(&self, port: u16) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(port as usize) {
            *slot = None;
        }
    }

    fn lookup(&self, port: u16) -> Option<Arc<SocketCore>> {
        self.slots.lock().get(port as usize).and_then(|s| s.clone())
    }
}

impl Default for PortTable {
    fn default() -> Self {
        Self::new()
    }
}

/// The stream object installed behind an FCB for every socket descriptor,
/// whatever variant its control block currently holds.
pub(crate) struct SocketStream {
    core: Arc<SocketCore>,
    ports: Arc<PortTable>,
}

impl StreamOps for SocketStream {
    fn read(&self, buf: &mut [u8]) -> KResult<usize> {
        let pipe = {
            let state = self.core.state.lock().unwrap();
            match &*state {
                SocketState::Peer { read_pipe: Some(p), .. } => p.clone(),
                SocketState::Peer { read_pipe: None, .. } => return Err(IpcError::PeerClosed),
                _ => return Err(IpcError::WrongState),
            }
        };
        pipe.read_bytes(buf)
    }

    fn write(&self, buf: &[u8]) -> KResult<usize> {
        let pipe = {
            let state = self.core.state.lock().unwrap();
            match &*state {
                SocketState::Peer { write_pipe: Some(p), .. } => p.clone(),
                SocketState::Peer { write_pipe: None, .. } => return Err(IpcError::PeerClosed),
                _ => return Err(IpcError::WrongState),
            }
        };
        pipe.write_bytes(buf)
    }

    fn close(&self) {
        let mut state = self.core.state.lock().unwrap();
        match &mut *state {
            SocketState::Unbound { .. } => {}
            SocketState::Listener { port, .. } => {
                let port = *port;
                self.core.closed.store(true, Ordering::Release);
                drop(state);
                self.ports.uninstall(port);
                self.core.req_available.broadcast();
            }
            SocketState::Peer { read_pipe, write_pipe } => {
                if let Some(w) = write_pipe.take() {
                    let _ = w.shutdown_write();
                }
                if let Some(r) = read_pipe.take() {
                    let _ = r.shutdown_read();
                }
            }
        }
    }

    fn as_socket(&self) -> Option<&SocketStream> {
        Some(self)
    }
}

fn get_socket_core(table: &StreamTable, id: i32) -> KResult<Arc<SocketCore>> {
    let fcb = table.get(id)?;
    fcb.ops()
        .as_socket()
        .map(|s| s.core.clone())
        .ok_or(IpcError::WrongState)
}

/// `Socket(port)`.
pub(crate) fn socket(table: &StreamTable, ports: &Arc<PortTable>, port: u16) -> KResult<i32> {
    if port as usize > MAX_PORT as usize {
        return Err(IpcError::BadArgument);
    }
    let core = SocketCore::new_unbound(port);
    let stream: Arc<dyn StreamOps> = Arc::new(SocketStream { core, ports: ports.clone() });
    let ids = table.reserve(vec![stream])?;
    Ok(ids[0])
}

/// `Listen(id)`.
pub(crate) fn listen(table: &StreamTable, ports: &PortTable, id: i32) -> KResult<()> {
    let core = get_socket_core(table, id)?;
    let port = {
        let state = core.state.lock().unwrap();
        match &*state {
            SocketState::Unbound { port } if *port != NOPORT => *port,
            _ => return Err(IpcError::WrongState),
        }
    };
    ports.install(port, core.clone())?;
    *core.state.lock().unwrap() = SocketState::Listener { port };
    Ok(())
}

/// `Connect(id, port, timeout)`.
pub(crate) fn connect(
    table: &StreamTable,
    ports: &PortTable,
    id: i32,
    port: u16,
    timeout: Option<Duration>,
) -> KResult<()> {
    if port == NOPORT || port as usize >= MAX_PORT as usize {
        return Err(IpcError::BadArgument);
    }
    let requester = get_socket_core(table, id)?;
    {
        let state = requester.state.lock().unwrap();
        if !matches!(&*state, SocketState::Unbound { .. }) {
            return Err(IpcError::WrongState);
        }
    }

    let listener = ports.lookup(port).ok_or(IpcError::WrongState)?;
    {
        let state = listener.state.lock().unwrap();
        if !matches!(&*state, SocketState::Listener { .. }) {
            return Err(IpcError::WrongState);
        }
    }

    listener.refcount.fetch_add(1, Ordering::AcqRel);

    let request = Arc::new(ConnRequest {
        requester: requester.clone(),
        admitted: Mutex::new(false),
        connected_cv: Cv::new(),
    });

    {
        let state = listener.state.lock().unwrap();
        if !matches!(&*state, SocketState::Listener { .. }) {
            listener.refcount.fetch_sub(1, Ordering::AcqRel);
            return Err(IpcError::WrongState);
        }
        listener.queue.push(request.clone());
    }
    listener.req_available.signal();

    let deadline = timeout.map(|t| Instant::now() + t);
    let mut guard = request.admitted.lock().unwrap();
    let mut admitted = *guard;
    let mut timed_out = false;
    while !admitted && !timed_out {
        let remaining = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    timed_out = true;
                    break;
                }
                Some(deadline - now)
            }
            None => None,
        };
        let (g, to) = request.connected_cv.timed_wait(guard, Cause::Connect, remaining);
        guard = g;
        timed_out = to;
        admitted = *guard;
    }
    drop(guard);

    listener.refcount.fetch_sub(1, Ordering::AcqRel);

    if admitted {
        Ok(())
    } else if timed_out {
        Err(IpcError::TimedOut)
    } else {
        Err(IpcError::WrongState)
    }
}

/// `Accept(listener_id)`.
pub(crate) fn accept(table: &StreamTable, ports: &Arc<PortTable>, id: i32) -> KResult<i32> {
    let listener = get_socket_core(table, id)?;
    {
        let state = listener.state.lock().unwrap();
        if !matches!(&*state, SocketState::Listener { .. }) {
            return Err(IpcError::WrongState);
        }
    }

    listener.refcount.fetch_add(1, Ordering::AcqRel);

    let mut guard = listener.state.lock().unwrap();
    let request = loop {
        if listener.closed.load(Ordering::Acquire) {
            listener.refcount.fetch_sub(1, Ordering::AcqRel);
            return Err(IpcError::WrongState);
        }
        if !matches!(&*guard, SocketState::Listener { .. }) {
            listener.refcount.fetch_sub(1, Ordering::AcqRel);
            return Err(IpcError::WrongState);
        }
        if let Some(request) = listener.queue.pop() {
            break request;
        }
        guard = listener.req_available.wait(guard, Cause::Accept);
    };
    let port = match &*guard {
        SocketState::Listener { port, .. } => *port,
        _ => unreachable!("accept only pops requests while the socket is a listener"),
    };
    drop(guard);

    *request.admitted.lock().unwrap() = true;

    let local = SocketCore::new_unbound(port);
    let stream: Arc<dyn StreamOps> = Arc::new(SocketStream {
        core: local.clone(),
        ports: ports.clone(),
    });
    let new_id = match table.reserve(vec![stream]) {
        Ok(ids) => ids[0],
        Err(e) => {
            listener.refcount.fetch_sub(1, Ordering::AcqRel);
            return Err(e);
        }
    };

    let remote = request.requester.clone();
    let pipe_x = make_pipe_core();
    let pipe_y = make_pipe_core();
    *local.state.lock().unwrap() = SocketState::Peer {
        write_pipe: Some(pipe_x.clone()),
        read_pipe: Some(pipe_y.clone()),
    };
    *remote.state.lock().unwrap() = SocketState::Peer {
        write_pipe: Some(pipe_y),
        read_pipe: Some(pipe_x),
    };

    request.connected_cv.signal();
    listener.refcount.fetch_sub(1, Ordering::AcqRel);
    Ok(new_id)
}

/// `ShutDown(id, how)`.
pub(crate) fn shutdown(table: &StreamTable, id: i32, how: ShutdownHow) -> KResult<()> {
    let core = get_socket_core(table, id)?;
    let mut state = core.state.lock().unwrap();
    match &mut *state {
        SocketState::Peer { read_pipe, write_pipe } => match how {
            ShutdownHow::Read => match read_pipe.take() {
                Some(p) => p.shutdown_read(),
                None => Err(IpcError::BadArgument),
            },
            ShutdownHow::Write => match write_pipe.take() {
                Some(p) => p.shutdown_write(),
                None => Err(IpcError::BadArgument),
            },
            ShutdownHow::Both => match (read_pipe.take(), write_pipe.take()) {
                (Some(r), Some(w)) => {
                    r.shutdown_read()?;
                    w.shutdown_write()
                }
                _ => Err(IpcError::BadArgument),
            },
        },
        _ => Err(IpcError::WrongState),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn fixture() -> (StreamTable, Arc<PortTable>) {
        (StreamTable::new(), Arc::new(PortTable::new()))
    }

    #[test]
    fn connect_accept_rendezvous_exchanges_bytes() {
        let (table, ports) = fixture();
        let table = Arc::new(table);

        let listener_id = socket(&table, &ports, 10).unwrap();
        listen(&table, &ports, listener_id).unwrap();

        let t2 = table.clone();
        let p2 = ports.clone();
        let connector = thread::spawn(move || {
            let t = socket(&t2, &p2, NOPORT).unwrap();
            connect(&t2, &p2, t, 10, None).unwrap();
            t
        });

        // Give the connector a moment to enqueue its request.
        thread::sleep(Duration::from_millis(20));
        let c = accept(&table, &ports, listener_id).unwrap();
        let t = connector.join().unwrap();

        let c_fcb = table.get(c).unwrap();
        let t_fcb = table.get(t).unwrap();

        assert_eq!(c_fcb.ops().write(b"ping").unwrap(), 4);
        let mut buf = [0u8; 4];
        assert_eq!(t_fcb.ops().read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"ping");

        assert_eq!(t_fcb.ops().write(b"pong").unwrap(), 4);
        let mut buf2 = [0u8; 4];
        assert_eq!(c_fcb.ops().read(&mut buf2).unwrap(), 4);
        assert_eq!(&buf2, b"pong");
    }

    #[test]
    fn connect_without_accept_times_out() {
        let (table, ports) = fixture();
        let listener_id = socket(&table, &ports, 10).unwrap();
        listen(&table, &ports, listener_id).unwrap();

        let t = socket(&table, &ports, NOPORT).unwrap();
        let start = std::time::Instant::now();
        let result = connect(&table, &ports, t, 10, Some(Duration::from_millis(100)));
        assert_eq!(result, Err(IpcError::TimedOut));
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn listen_rejects_second_listener_on_same_port() {
        let (table, ports) = fixture();
        let a = socket(&table, &ports, 42).unwrap();
        let b = socket(&table, &ports, 42).unwrap();
        listen(&table, &ports, a).unwrap();
        assert_eq!(listen(&table, &ports, b), Err(IpcError::BadArgument));
    }

    #[test]
    fn accept_fails_once_listener_closed_while_waiting() {
        let (table, ports) = fixture();
        let table = Arc::new(table);
        let listener_id = socket(&table, &ports, 7).unwrap();
        listen(&table, &ports, listener_id).unwrap();

        let t2 = table.clone();
        let closer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            t2.close(listener_id).unwrap();
        });

        let result = accept(&table, &ports, listener_id);
        assert_eq!(result, Err(IpcError::WrongState));
        closer.join().unwrap();
    }

    #[test]
    fn shutdown_both_is_equivalent_to_read_then_write() {
        let (table, ports) = fixture();
        let table = Arc::new(table);
        let listener_id = socket(&table, &ports, 11).unwrap();
        listen(&table, &ports, listener_id).unwrap();

        let t2 = table.clone();
        let p2 = ports.clone();
        let connector = thread::spawn(move || {
            let t = socket(&t2, &p2, NOPORT).unwrap();
            connect(&t2, &p2, t, 11, None).unwrap();
            t
        });
        thread::sleep(Duration::from_millis(20));
        let c = accept(&table, &ports, listener_id).unwrap();
        connector.join().unwrap();

        assert!(shutdown(&table, c, ShutdownHow::Both).is_ok());
        assert_eq!(shutdown(&table, c, ShutdownHow::Read), Err(IpcError::BadArgument));
        assert_eq!(shutdown(&table, c, ShutdownHow::Write), Err(IpcError::BadArgument));
    }
}
