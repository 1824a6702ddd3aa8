//! Error taxonomy for the IPC core.
//!
//! A typed enum rather than bare integers so engine-level code can compose
//! with `?` instead of threading raw errno values by hand. The `syscall`
//! module is the only place that flattens these back down to a 0/-1
//! contract.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    /// Argument domain: illegal descriptor id, illegal port, illegal `how`.
    BadArgument,
    /// Resource exhaustion: no free descriptor ids or FCBs.
    Exhausted,
    /// State mismatch: operation on the wrong socket variant, wrong stream
    /// direction, wrong process, etc.
    WrongState,
    /// Peer closure observed by a writer (reader gone) or an acceptor
    /// (listener closed while waiting).
    PeerClosed,
    /// A blocking call timed out before it could complete.
    TimedOut,
}

impl fmt::Display for IpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            IpcError::BadArgument => "bad argument",
            IpcError::Exhausted => "resource exhausted",
            IpcError::WrongState => "wrong state",
            IpcError::PeerClosed => "peer closed",
            IpcError::TimedOut => "timed out",
        };
        f.write_str(msg)
    }
}

pub type KResult<T> = Result<T, IpcError>;
