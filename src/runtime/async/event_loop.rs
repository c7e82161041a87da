//! The reactor loop.
//!
//! [`EventLoop`] owns the poller, the timers, the I/O watchers and the worker
//! pool. It lives inside its context `C` (the runtime), and handlers receive
//! `&mut C`, so dispatch is written as free functions over the context: a
//! handler is taken out of the loop, run, and put back.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::reactor::{Notifier, Poller};
use super::timer::{TimerHandler, TimerId, Timers};
use super::worker::{Finished, Job, Payload, RequestId, WorkError, WorkerPool};
use super::{Interest, Token};
use crate::config::RuntimeConfig;
use crate::runtime::wrap::WrapId;

/// Poller token of the completion notifier. Watchers start at 1.
const NOTIFY_TOKEN: Token = Token(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Nothing pending: not yet run, or the last pass left no work.
    Idle,
    /// Waiting for events.
    Running,
    /// Running callbacks.
    Dispatching,
    /// `run` returned.
    Stopped,
}

/// What the loop needs from its owner.
pub trait LoopContext: Sized {
    fn event_loop(&mut self) -> &mut EventLoop<Self>;

    /// Release the handle a finished work request kept alive.
    fn release_origin(&mut self, origin: WrapId);

    /// Called once per loop pass, after dispatch.
    fn safe_point(&mut self) {}

    /// Stop dispatching as soon as possible, e.g. after a fatal error.
    fn should_exit(&self) -> bool {
        false
    }
}

type DoneHandler<C> = Box<dyn FnOnce(&mut C, Result<Payload, WorkError>)>;
pub type IoHandler<C> = Box<dyn FnMut(&mut C, Interest)>;

struct PendingWork<C> {
    origin: Option<WrapId>,
    done: DoneHandler<C>,
}

struct Watcher<C> {
    fd: RawFd,
    /// Taken out while the handler runs.
    handler: Option<IoHandler<C>>,
}

pub struct EventLoop<C> {
    poller: Poller,
    notifier: Arc<Notifier>,
    pool: WorkerPool,
    timers: Timers<C>,
    watchers: HashMap<Token, Watcher<C>>,
    pending: HashMap<RequestId, PendingWork<C>>,
    next_request: u64,
    next_token: usize,
    armed: bool,
    state: LoopState,
    stop_requested: bool,
}

impl<C: LoopContext> EventLoop<C> {
    pub fn new(config: &RuntimeConfig) -> io::Result<Self> {
        let notifier = Arc::new(Notifier::new()?);
        let pool = WorkerPool::new(config.worker_threads, notifier.clone(), config.worker_park_timeout)?;
        Ok(Self {
            poller: Poller::new(config.max_events)?,
            notifier,
            pool,
            timers: Timers::new(),
            watchers: HashMap::new(),
            pending: HashMap::new(),
            next_request: 1,
            next_token: NOTIFY_TOKEN.0 + 1,
            armed: false,
            state: LoopState::Idle,
            stop_requested: false,
        })
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Whether the completion notifier is registered with the poller.
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Outstanding work requests whose callback has not run yet.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    pub fn is_alive(&self) -> bool {
        !self.watchers.is_empty() || !self.timers.is_empty() || !self.pending.is_empty()
    }

    /// Register the completion notifier. Idempotent.
    pub fn warm_up(&mut self) -> io::Result<()> {
        if !self.armed {
            self.poller
                .register(self.notifier.as_raw_fd(), NOTIFY_TOKEN, Interest::Readable)?;
            self.armed = true;
            tracing::debug!("completion notifier armed");
        }
        Ok(())
    }

    fn disarm(&mut self) -> io::Result<()> {
        if self.armed {
            self.poller.deregister(self.notifier.as_raw_fd())?;
            self.armed = false;
            tracing::debug!("completion notifier disarmed");
        }
        Ok(())
    }

    /// Queue `work` on the pool. `done` runs later on the loop thread with
    /// the result, after which `origin` (if any) is released.
    pub fn submit<T, W, D>(&mut self, origin: Option<WrapId>, work: W, done: D) -> io::Result<RequestId>
    where
        T: Send + 'static,
        W: FnOnce() -> Result<T, WorkError> + Send + 'static,
        D: FnOnce(&mut C, Result<T, WorkError>) + 'static,
    {
        // A submit after a disarm must be able to wake the loop again.
        self.warm_up()?;

        let id = RequestId::new(self.next_request);
        self.next_request += 1;

        let job: Job = Box::new(move || work().map(|value| Box::new(value) as Payload));
        let done: DoneHandler<C> = Box::new(move |cx: &mut C, outcome: Result<Payload, WorkError>| {
            let result = outcome.and_then(|payload| match payload.downcast::<T>() {
                Ok(value) => Ok(*value),
                Err(_) => {
                    tracing::error!(?id, "work request returned an unexpected payload");
                    Err(WorkError::Panicked)
                }
            });
            done(cx, result)
        });

        self.pending.insert(id, PendingWork { origin, done });
        if let Err(e) = self.pool.submit(id, job) {
            self.pending.remove(&id);
            return Err(io::Error::other(e));
        }
        Ok(id)
    }

    pub fn watch_io(&mut self, fd: RawFd, interest: Interest, handler: IoHandler<C>) -> io::Result<Token> {
        let token = Token(self.next_token);
        self.poller.register(fd, token, interest)?;
        self.next_token += 1;
        self.watchers.insert(
            token,
            Watcher {
                fd,
                handler: Some(handler),
            },
        );
        Ok(token)
    }

    pub fn unwatch(&mut self, token: Token) -> io::Result<()> {
        match self.watchers.remove(&token) {
            Some(watcher) => self.poller.deregister(watcher.fd),
            None => Ok(()),
        }
    }

    pub fn add_timer(&mut self, after: Duration, repeat: Option<Duration>, handler: TimerHandler<C>) -> TimerId {
        self.timers.insert(after, repeat, handler)
    }

    pub fn cancel_timer(&mut self, id: TimerId) -> bool {
        self.timers.cancel(id)
    }

    /// Make `run` return after the current pass.
    pub fn stop(&mut self) {
        self.stop_requested = true;
    }

    fn wait_timeout(&mut self, block: bool) -> Option<Duration> {
        if !block || !self.is_alive() {
            return Some(Duration::ZERO);
        }
        self.timers
            .next_deadline()
            .map(|at| at.saturating_duration_since(Instant::now()))
    }
}

/// Run until nothing keeps the loop alive, `stop` is called, or the context
/// asks to exit.
pub fn run<C: LoopContext>(cx: &mut C) -> io::Result<()> {
    cx.event_loop().stop_requested = false;
    tracing::debug!("event loop started");

    let result = run_until_done(cx);

    let event_loop = cx.event_loop();
    event_loop.state = LoopState::Stopped;
    event_loop.stop_requested = false;
    tracing::debug!("event loop stopped");
    result
}

fn run_until_done<C: LoopContext>(cx: &mut C) -> io::Result<()> {
    while cx.event_loop().is_alive() && !cx.should_exit() {
        if !run_once(cx, true)? {
            break;
        }
    }
    Ok(())
}

/// One wait and dispatch pass. With `block` unset the wait only collects
/// what is ready now. Returns whether another pass is warranted.
pub fn run_once<C: LoopContext>(cx: &mut C, block: bool) -> io::Result<bool> {
    let event_loop = cx.event_loop();
    event_loop.state = LoopState::Running;
    let timeout = event_loop.wait_timeout(block);
    let ready = event_loop.poller.wait(timeout)?;

    cx.event_loop().state = LoopState::Dispatching;
    for (token, interest) in ready {
        if cx.should_exit() {
            break;
        }
        if token == NOTIFY_TOKEN {
            drain_completions(cx)?;
        } else {
            dispatch_watcher(cx, token, interest);
        }
    }
    fire_timers(cx);
    cx.safe_point();

    let event_loop = cx.event_loop();
    let alive = event_loop.is_alive();
    event_loop.state = if alive { LoopState::Running } else { LoopState::Idle };
    let keep_going = alive && !event_loop.stop_requested;
    Ok(keep_going && !cx.should_exit())
}

fn drain_completions<C: LoopContext>(cx: &mut C) -> io::Result<()> {
    let event_loop = cx.event_loop();
    // Drain before polling: a completion pushed after the poll re-signals.
    event_loop.notifier.drain()?;
    let (finished, stats) = event_loop.pool.poll();

    for Finished { id, outcome } in finished {
        if cx.should_exit() {
            break;
        }
        let Some(work) = cx.event_loop().pending.remove(&id) else {
            tracing::warn!(?id, "completion for unknown work request");
            continue;
        };
        (work.done)(cx, outcome);
        if let Some(origin) = work.origin {
            cx.release_origin(origin);
        }
    }

    let event_loop = cx.event_loop();
    if stats.is_idle() && event_loop.pending.is_empty() {
        event_loop.disarm()?;
    }
    Ok(())
}

fn dispatch_watcher<C: LoopContext>(cx: &mut C, token: Token, interest: Interest) {
    let Some(mut handler) = cx
        .event_loop()
        .watchers
        .get_mut(&token)
        .and_then(|w| w.handler.take())
    else {
        return;
    };
    handler(cx, interest);
    // The handler may have unwatched itself.
    if let Some(watcher) = cx.event_loop().watchers.get_mut(&token) {
        watcher.handler = Some(handler);
    }
}

fn fire_timers<C: LoopContext>(cx: &mut C) {
    let now = Instant::now();
    while !cx.should_exit() {
        let Some((id, mut handler)) = cx.event_loop().timers.pop_due(now) else {
            break;
        };
        handler(cx);
        cx.event_loop().timers.finish(id, handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;
    use std::sync::{Condvar, Mutex};
    use std::thread::{self, ThreadId};

    struct TestContext {
        event_loop: EventLoop<TestContext>,
        released: Vec<WrapId>,
        completions: Vec<(u32, ThreadId)>,
        log: Vec<String>,
        interval: Option<TimerId>,
        watch: Option<Token>,
    }

    impl LoopContext for TestContext {
        fn event_loop(&mut self) -> &mut EventLoop<Self> {
            &mut self.event_loop
        }

        fn release_origin(&mut self, origin: WrapId) {
            self.released.push(origin);
        }
    }

    fn context(workers: usize) -> TestContext {
        let config = RuntimeConfig {
            worker_threads: workers,
            worker_park_timeout: Duration::from_millis(2),
            ..RuntimeConfig::default()
        };
        TestContext {
            event_loop: EventLoop::new(&config).unwrap(),
            released: Vec::new(),
            completions: Vec::new(),
            log: Vec::new(),
            interval: None,
            watch: None,
        }
    }

    #[test]
    fn test_each_request_completes_once_on_loop_thread() {
        let mut cx = context(4);
        for i in 0..20u32 {
            cx.event_loop
                .submit(
                    Some(WrapId::dangling(i)),
                    move || Ok(i * 2),
                    move |cx: &mut TestContext, result| {
                        let value = result.unwrap();
                        assert_eq!(value, i * 2);
                        cx.completions.push((i, thread::current().id()));
                    },
                )
                .unwrap();
        }
        assert_eq!(cx.event_loop.pending_requests(), 20);

        run(&mut cx).unwrap();

        let mut seen: Vec<u32> = cx.completions.iter().map(|(i, _)| *i).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
        assert!(cx.completions.iter().all(|(_, t)| *t == thread::current().id()));

        // one release per request, after its callback
        assert_eq!(cx.released.len(), 20);
        assert!((0..20).all(|i| cx.released.contains(&WrapId::dangling(i))));
        assert_eq!(cx.event_loop.pending_requests(), 0);
        assert_eq!(cx.event_loop.state(), LoopState::Stopped);
    }

    #[test]
    fn test_completions_follow_finish_order() {
        let mut cx = context(3);
        let gate = Arc::new((Mutex::new(false), Condvar::new()));

        for i in [1u32, 2, 3] {
            let (work_gate, done_gate) = (gate.clone(), gate.clone());
            cx.event_loop
                .submit(
                    None,
                    move || {
                        if i != 2 {
                            let (open, cond) = &*work_gate;
                            let mut open = open.lock().unwrap();
                            while !*open {
                                open = cond.wait(open).unwrap();
                            }
                        }
                        Ok(i)
                    },
                    move |cx: &mut TestContext, result: Result<u32, WorkError>| {
                        let value = result.unwrap();
                        cx.log.push(value.to_string());
                        if value == 2 {
                            let (open, cond) = &*done_gate;
                            *open.lock().unwrap() = true;
                            cond.notify_all();
                        }
                    },
                )
                .unwrap();
        }

        run(&mut cx).unwrap();
        assert_eq!(cx.log.len(), 3);
        assert_eq!(cx.log[0], "2");
    }

    #[test]
    fn test_submit_after_disarm_rearms() {
        let mut cx = context(1);
        assert!(!cx.event_loop.is_armed());

        let record = |cx: &mut TestContext, result: Result<&'static str, WorkError>| {
            cx.log.push(result.unwrap().to_string());
        };
        cx.event_loop.submit(None, || Ok("first"), record).unwrap();
        assert!(cx.event_loop.is_armed());
        run(&mut cx).unwrap();
        assert!(!cx.event_loop.is_armed());

        cx.event_loop.submit(None, || Ok("second"), record).unwrap();
        assert!(cx.event_loop.is_armed());
        run(&mut cx).unwrap();
        assert_eq!(cx.log, vec!["first", "second"]);
    }

    #[test]
    fn test_failed_and_panicking_requests_reach_callback() {
        let mut cx = context(1);
        cx.event_loop
            .submit(
                None,
                || -> Result<u32, WorkError> { panic!("worker job failure") },
                |cx: &mut TestContext, result| cx.log.push(format!("{:?}", result)),
            )
            .unwrap();
        cx.event_loop
            .submit(
                None,
                || -> Result<u32, WorkError> { Err(io::Error::from_raw_os_error(libc::ENOENT).into()) },
                |cx: &mut TestContext, result| cx.log.push(format!("{:?}", result.map_err(|e| e.code()))),
            )
            .unwrap();
        run(&mut cx).unwrap();

        cx.log.sort();
        assert_eq!(cx.log, vec!["Err(Panicked)".to_string(), format!("Err(Some({}))", libc::ENOENT)]);
    }

    #[test]
    fn test_timers_fire_in_deadline_order() {
        let mut cx = context(1);
        for (ms, tag) in [(30, "c"), (10, "a"), (20, "b")] {
            cx.event_loop.add_timer(
                Duration::from_millis(ms),
                None,
                Box::new(move |cx: &mut TestContext| cx.log.push(tag.to_string())),
            );
        }
        let id = cx.event_loop.add_timer(
            Duration::from_millis(5),
            Some(Duration::from_millis(5)),
            Box::new(|cx: &mut TestContext| {
                cx.log.push("tick".to_string());
                let ticks = cx.log.iter().filter(|l| *l == "tick").count();
                if ticks == 3 {
                    let id = cx.interval.unwrap();
                    cx.event_loop.cancel_timer(id);
                }
            }),
        );
        cx.interval = Some(id);

        run(&mut cx).unwrap();
        let order: Vec<&str> = cx.log.iter().map(String::as_str).filter(|l| *l != "tick").collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert_eq!(cx.log.iter().filter(|l| *l == "tick").count(), 3);
    }

    #[test]
    fn test_io_watcher_runs_inline() {
        let mut cx = context(1);
        let (mut writer, reader) = UnixStream::pair().unwrap();
        reader.set_nonblocking(true).unwrap();
        let fd = reader.as_raw_fd();

        let token = cx
            .event_loop
            .watch_io(
                fd,
                Interest::Readable,
                Box::new(move |cx: &mut TestContext, interest| {
                    assert_eq!(interest, Interest::Readable);
                    let mut buf = [0u8; 16];
                    let n = (&reader).read(&mut buf).unwrap();
                    cx.log.push(String::from_utf8_lossy(&buf[..n]).into_owned());
                    let token = cx.watch.unwrap();
                    cx.event_loop.unwatch(token).unwrap();
                }),
            )
            .unwrap();
        cx.watch = Some(token);
        writer.write_all(b"ping").unwrap();

        run(&mut cx).unwrap();
        assert_eq!(cx.log, vec!["ping"]);
        assert!(!cx.event_loop.is_alive());
    }

    #[test]
    fn test_stop_leaves_timers_in_place() {
        let mut cx = context(1);
        assert_eq!(cx.event_loop.state(), LoopState::Idle);
        cx.event_loop.add_timer(
            Duration::ZERO,
            Some(Duration::from_millis(1)),
            Box::new(|cx: &mut TestContext| {
                cx.log.push("tick".to_string());
                cx.event_loop.stop();
            }),
        );

        run(&mut cx).unwrap();
        assert_eq!(cx.log, vec!["tick"]);
        assert!(cx.event_loop.is_alive());
        assert_eq!(cx.event_loop.state(), LoopState::Stopped);
    }

    #[test]
    fn test_run_once_without_blocking() {
        let mut cx = context(1);
        assert!(!run_once(&mut cx, false).unwrap());
        cx.event_loop.add_timer(
            Duration::from_secs(60),
            None,
            Box::new(|cx: &mut TestContext| cx.log.push("late".to_string())),
        );
        assert!(run_once(&mut cx, false).unwrap());
        assert!(cx.log.is_empty());
        assert_eq!(cx.event_loop.state(), LoopState::Running);
    }

    #[test]
    fn test_pass_without_work_goes_idle() {
        let mut cx = context(1);
        cx.event_loop.add_timer(
            Duration::ZERO,
            None,
            Box::new(|cx: &mut TestContext| cx.log.push("once".to_string())),
        );
        assert!(!run_once(&mut cx, true).unwrap());
        assert_eq!(cx.log, vec!["once"]);
        assert_eq!(cx.event_loop.state(), LoopState::Idle);
    }
}
