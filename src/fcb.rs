//! Stream descriptor table: a per-process array mapping small integer ids
//! to live streams.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use spin::Mutex;

use crate::error::{IpcError, KResult};

/// Upper bound on live descriptor ids per process.
pub const MAX_FILEID: usize = 256;

/// Sentinel returned in place of a descriptor id on failure.
pub const NOFILE: i32 = -1;

/// The `{read, write, close}` dispatch table every stream kind implements.
/// Default `read`/`write` fail with `WrongState` — a reader-only or
/// writer-only endpoint treats the other direction as a no-op error.
pub trait StreamOps: Send + Sync {
    fn read(&self, _buf: &mut [u8]) -> KResult<usize> {
        Err(IpcError::WrongState)
    }
    fn write(&self, _buf: &[u8]) -> KResult<usize> {
        Err(IpcError::WrongState)
    }
    fn close(&self);

    /// Downcast hook for the socket-only operations (`Listen`, `Accept`,
    /// `Connect`, `ShutDown`) that sit outside the common read/write/close
    /// capability. Every stream kind but `SocketStream` keeps the default.
    fn as_socket(&self) -> Option<&crate::ipc::socket::SocketStream> {
        None
    }
}

/// A kernel-side stream descriptor. `suppress_close` backs
/// `StreamTable::unreserve`: rolling back a partially constructed stream
/// (e.g. the second endpoint of a pipe failed to allocate) must release the
/// slot without invoking the stream's `close`, since the stream object may
/// not yet be fully wired.
pub(crate) struct Fcb {
    ops: Arc<dyn StreamOps>,
    suppress_close: AtomicBool,
}

impl Fcb {
    pub(crate) fn ops(&self) -> &Arc<dyn StreamOps> {
        &self.ops
    }
}

impl Drop for Fcb {
    fn drop(&mut self) {
        if !self.suppress_close.load(Ordering::Acquire) {
            self.ops.close();
        }
    }
}

/// A live handle to an FCB. Cloning this is the descriptor table's own
/// `incref`: the reference count is realized directly as `Arc`'s strong
/// count rather than a separately tracked integer.
pub(crate) type FcbHandle = Arc<Fcb>;

/// Per-process table mapping small integer ids to FCBs.
pub(crate) struct StreamTable {
    slots: Mutex<Vec<Option<FcbHandle>>>,
}

impl StreamTable {
    pub(crate) fn new() -> Self {
        StreamTable {
            slots: Mutex::new(Vec::new()),
        }
    }

    /// Atomically allocate `n` fresh ids, each backed by the corresponding
    /// entry of `ops`. On any failure nothing changes: if fewer than `n`
    /// ids are free, the table is left untouched and the call fails.
    pub(crate) fn reserve(&self, ops: Vec<Arc<dyn StreamOps>>) -> KResult<Vec<i32>> {
        let n = ops.len();
        let mut slots = self.slots.lock();

        let mut free_ids: Vec<usize> = Vec::with_capacity(n);
        for (id, slot) in slots.iter().enumerate() {
            if slot.is_none() {
                free_ids.push(id);
                if free_ids.len() == n {
                    break;
                }
            }
        }
        while free_ids.len() < n && slots.len() < MAX_FILEID {
            free_ids.push(slots.len());
            slots.push(None);
        }
        if free_ids.len() < n {
            log::warn!("StreamTable::reserve: exhausted, need {n}, have {}", free_ids.len());
            return Err(IpcError::Exhausted);
        }

        let mut ids = Vec::with_capacity(n);
        for (id, op) in free_ids.into_iter().zip(ops) {
            slots[id] = Some(Arc::new(Fcb {
                ops: op,
                suppress_close: AtomicBool::new(false),
            }));
            ids.push(id as i32);
        }
        Ok(ids)
    }

    /// Look up the FCB behind a descriptor id, or fail if the id is out of
    /// range or unbound.
    pub(crate) fn get(&self, id: i32) -> KResult<FcbHandle> {
        if id < 0 {
            return Err(IpcError::BadArgument);
        }
        let slots = self.slots.lock();
        slots
            .get(id as usize)
            .and_then(|s| s.clone())
            .ok_or(IpcError::BadArgument)
    }

    /// Release the table's own reference to each id without running `close`
    /// on the backing streams: used to roll back a partially constructed
    /// multi-descriptor object such as a pipe whose second endpoint failed
    /// to allocate.
    pub(crate) fn unreserve(&self, ids: &[i32]) {
        let mut slots = self.slots.lock();
        for &id in ids {
            if let Some(Some(fcb)) = slots.get(id as usize) {
                fcb.suppress_close.store(true, Ordering::Release);
            }
            if let Some(slot) = slots.get_mut(id as usize) {
                *slot = None;
            }
        }
    }

    /// Release the table's reference to `id`, running the stream's `close`
    /// once that was the last reference.
    pub(crate) fn close(&self, id: i32) -> KResult<()> {
        if id < 0 {
            return Err(IpcError::BadArgument);
        }
        let mut slots = self.slots.lock();
        match slots.get_mut(id as usize) {
            Some(slot @ Some(_)) => {
                *slot = None;
                Ok(())
            }
            _ => Err(IpcError::BadArgument),
        }
    }

    /// Decrement-refcount every live FCB in the table, releasing whichever
    /// ones that drops to 0. Run once a process's last thread exits.
    pub(crate) fn close_all(&self) {
        let mut slots = self.slots.lock();
        for slot in slots.iter_mut() {
            *slot = None;
        }
    }
}

impl Default for StreamTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingStream {
        closed: Arc<AtomicUsize>,
    }
    impl StreamOps for CountingStream {
        fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn close_runs_exactly_once() {
        let table = StreamTable::new();
        let closed = Arc::new(AtomicUsize::new(0));
        let ids = table
            .reserve(vec![Arc::new(CountingStream { closed: closed.clone() })])
            .unwrap();
        table.close(ids[0]).unwrap();
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(table.close(ids[0]), Err(IpcError::BadArgument));
    }

    #[test]
    fn unreserve_skips_close() {
        let table = StreamTable::new();
        let closed = Arc::new(AtomicUsize::new(0));
        let ids = table
            .reserve(vec![Arc::new(CountingStream { closed: closed.clone() })])
            .unwrap();
        table.unreserve(&ids);
        assert_eq!(closed.load(Ordering::SeqCst), 0);
        assert!(table.get(ids[0]).is_err());
    }

    #[test]
    fn reserve_rolls_back_on_partial_exhaustion() {
        let table = StreamTable::new();
        // Fill every slot but one.
        let mut filler_ids = Vec::new();
        for _ in 0..MAX_FILEID - 1 {
            let closed = Arc::new(AtomicUsize::new(0));
            filler_ids.extend(table.reserve(vec![Arc::new(CountingStream { closed })]).unwrap());
        }
        let closed = Arc::new(AtomicUsize::new(0));
        let result = table.reserve(vec![
            Arc::new(CountingStream { closed: closed.clone() }),
            Arc::new(CountingStream { closed }),
        ]);
        assert_eq!(result, Err(IpcError::Exhausted));
        // The single remaining free slot must still be free.
        let closed2 = Arc::new(AtomicUsize::new(0));
        assert!(table.reserve(vec![Arc::new(CountingStream { closed: closed2 })]).is_ok());
    }
}
