//! Reactor loop, timers and the worker pool that runs blocking operations
//! off the script thread.

pub mod event_loop;
pub mod reactor;
pub mod timer;
pub mod worker;

pub use event_loop::{EventLoop, IoHandler, LoopContext, LoopState, run, run_once};
pub use reactor::{Notifier, Poller};
pub use timer::{TimerHandler, TimerId, Timers};
pub use worker::{PoolStats, RequestId, WorkError, WorkerPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interest {
    Readable,
    Writable,
}

/// Identifies a registration with the [`Poller`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub usize);
