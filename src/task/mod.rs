//! User-thread control blocks: join/detach/exit lifecycle layered over a
//! real OS thread per user thread.

pub(crate) mod ptcb;
