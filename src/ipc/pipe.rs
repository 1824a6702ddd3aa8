//! Pipe engine: a bounded ring buffer shared between a single reader
//! endpoint and a single writer endpoint, with blocking read/write and
//! half-close semantics.

use std::sync::{Arc, Mutex};

use crate::error::{IpcError, KResult};
use crate::fcb::{FcbHandle, StreamOps, StreamTable};
use crate::sched::{Cause, Cv};

/// Pipe ring buffer capacity. 8 KiB sits comfortably inside the 4-16 KiB
/// range a cooperative kernel's page-sized buffers typically use. See
/// DESIGN.md.
pub const PIPE_BUFFER_SIZE: usize = 8192;

struct PipeState {
    buffer: Box<[u8; PIPE_BUFFER_SIZE]>,
    r_pos: usize,
    w_pos: usize,
    count: usize,
    reader_open: bool,
    writer_open: bool,
}

/// The pipe control block. Held behind an `Arc` shared by exactly two FCBs
/// (the reader and writer endpoints); it is reclaimed the moment both are
/// dropped, so "destroyed once both endpoints are gone" falls out of Rust's
/// own drop semantics rather than needing an explicit destroy call.
struct PipeCore {
    state: Mutex<PipeState>,
    has_space: Cv,
    has_data: Cv,
}

impl PipeCore {
    fn new() -> Arc<Self> {
        Arc::new(PipeCore {
            state: Mutex::new(PipeState {
                buffer: Box::new([0u8; PIPE_BUFFER_SIZE]),
                r_pos: 0,
                w_pos: 0,
                count: 0,
                reader_open: true,
                writer_open: true,
            }),
            has_space: Cv::new(),
            has_data: Cv::new(),
        })
    }

    fn write(&self, buf: &[u8]) -> KResult<usize> {
        let mut state = self.state.lock().unwrap();
        if !state.writer_open || !state.reader_open {
            return Err(IpcError::PeerClosed);
        }

        while state.count == PIPE_BUFFER_SIZE && state.reader_open {
            state = self.has_space.wait(state, Cause::Pipe);
        }
        if !state.reader_open {
            return Err(IpcError::PeerClosed);
        }

        let k = buf.len().min(PIPE_BUFFER_SIZE - state.count);
        for i in 0..k {
            let idx = (state.w_pos + i) % PIPE_BUFFER_SIZE;
            state.buffer[idx] = buf[i];
        }
        state.w_pos = (state.w_pos + k) % PIPE_BUFFER_SIZE;
        state.count += k;

        self.has_data.broadcast();
        Ok(k)
    }

    fn read(&self, buf: &mut [u8]) -> KResult<usize> {
        let mut state = self.state.lock().unwrap();
        if !state.reader_open {
            return Err(IpcError::BadArgument);
        }
        if !state.writer_open && state.count == 0 {
            return Ok(0);
        }

        while state.count == 0 && state.writer_open {
            state = self.has_data.wait(state, Cause::Pipe);
        }
        if !state.writer_open && state.count == 0 {
            return Ok(0);
        }

        let k = buf.len().min(state.count);
        for i in 0..k {
            let idx = (state.r_pos + i) % PIPE_BUFFER_SIZE;
            buf[i] = state.buffer[idx];
        }
        state.r_pos = (state.r_pos + k) % PIPE_BUFFER_SIZE;
        state.count -= k;

        self.has_space.broadcast();
        Ok(k)
    }

    fn close_writer(&self) -> KResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.writer_open {
            return Err(IpcError::BadArgument);
        }
        state.writer_open = false;
        self.has_data.broadcast();
        Ok(())
    }

    fn close_reader(&self) -> KResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.reader_open {
            return Err(IpcError::BadArgument);
        }
        state.reader_open = false;
        self.has_space.broadcast();
        Ok(())
    }
}

/// The reader-end stream object installed behind an FCB by `make_pipe`.
pub(crate) struct PipeReader(Arc<PipeCore>);

impl StreamOps for PipeReader {
    fn read(&self, buf: &mut [u8]) -> KResult<usize> {
        self.0.read(buf)
    }
    fn close(&self) {
        let _ = self.0.close_reader();
    }
}

/// The writer-end stream object installed behind an FCB by `make_pipe`.
pub(crate) struct PipeWriter(Arc<PipeCore>);

impl StreamOps for PipeWriter {
    fn write(&self, buf: &[u8]) -> KResult<usize> {
        self.0.write(buf)
    }
    fn close(&self) {
        let _ = self.0.close_writer();
    }
}

/// Reserve two descriptors, a reader configured with read-only dispatch and
/// a writer configured with write-only dispatch, both pointing at the same
/// fresh ring buffer.
pub(crate) fn make_pipe(table: &StreamTable) -> KResult<(i32, i32)> {
    let core = PipeCore::new();
    let reader: Arc<dyn StreamOps> = Arc::new(PipeReader(core.clone()));
    let writer: Arc<dyn StreamOps> = Arc::new(PipeWriter(core));
    let ids = table.reserve(vec![reader, writer])?;
    Ok((ids[0], ids[1]))
}

/// Used by the socket engine: construct a bare pipe core without
/// registering descriptors, so `Accept` can cross-wire two pipes between a
/// pair of peer sockets directly.
pub(crate) fn make_pipe_core() -> Arc<PipeCorePublic> {
    PipeCore::new()
}

/// Re-exported under a clearer name for `socket.rs`, which only needs the
/// read/write/close operations, not the descriptor-table wiring.
pub(crate) type PipeCorePublic = PipeCore;

impl PipeCorePublic {
    pub(crate) fn write_bytes(&self, buf: &[u8]) -> KResult<usize> {
        self.write(buf)
    }
    pub(crate) fn read_bytes(&self, buf: &mut [u8]) -> KResult<usize> {
        self.read(buf)
    }
    pub(crate) fn shutdown_write(&self) -> KResult<()> {
        self.close_writer()
    }
    pub(crate) fn shutdown_read(&self) -> KResult<()> {
        self.close_reader()
    }
}
