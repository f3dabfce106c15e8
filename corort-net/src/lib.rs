//! TCP dispatch fabric built on [`corort`].
//!
//! A [`Server`] owns a listening socket on the calling ("main") thread and a
//! fixed pool of worker threads, each driving its own `corort::Runtime`. The
//! main thread accepts connections directly (it parks on the listening
//! socket's readiness exactly like any other coroutine would — see the
//! module docs on [`dispatcher`] for why that's safe here) and round-robins
//! each accepted connection to the next worker over a dedicated pipe. Each
//! worker reads one connection descriptor at a time and spawns a serving
//! coroutine on its own runtime to handle it; the serving coroutine runs to
//! completion independently of every other connection on that worker.
//!
//! ```text
//! dispatcher -> Server, Client, the listener/worker loops, the pipe handoff
//! shutdown   -> the cross-thread flag and signal plumbing that drains it all
//! ```

mod dispatcher;
mod shutdown;

pub use dispatcher::{AcceptStatus, Client, DispatcherConfig, Server, ServeFn};
pub use shutdown::{request_shutdown, shutdown_requested};
