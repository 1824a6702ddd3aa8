//! The per-user-thread control block itself. Lifecycle orchestration
//! (`CreateThread`/`ThreadJoin`/`ThreadDetach`/`ThreadExit`) lives in
//! `crate::process`, which owns the thread list this block is linked into.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::sched::Cv;

static NEXT_TID: AtomicU64 = AtomicU64::new(1);

fn allocate_tid() -> u64 {
    NEXT_TID.fetch_add(1, Ordering::SeqCst)
}

/// Fields mirror the contract's PTCB data model: `exited`, `exitval`,
/// `detached`, a refcount starting at 1 for the thread's own hold, and an
/// `exit_cv` joiners wait on.
pub(crate) struct Ptcb {
    pub(crate) tid: u64,
    pub(crate) exited: AtomicBool,
    pub(crate) exitval: Mutex<i32>,
    pub(crate) detached: AtomicBool,
    pub(crate) refcount: AtomicUsize,
    pub(crate) exit_cv: Cv,
}

impl Ptcb {
    pub(crate) fn new() -> Self {
        Ptcb {
            tid: allocate_tid(),
            exited: AtomicBool::new(false),
            exitval: Mutex::new(0),
            detached: AtomicBool::new(false),
            refcount: AtomicUsize::new(1),
            exit_cv: Cv::new(),
        }
    }
}
