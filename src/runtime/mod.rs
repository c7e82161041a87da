//! Script execution context.
//!
//! A [`Runtime`] ties the engine, the native handle registry and the event
//! loop together on one thread. It compiles and runs scripts, runs the
//! bootstrap sequence, drives the loop, and decides what is fatal:
//!
//! - compile errors and uncaught exceptions anywhere (main script, bootstrap
//!   script, loop callback) end the process with status 1;
//! - `node.exit(code)` ends it with `code`;
//! - failures of the loop itself are engine errors.
//!
//! Binding errors and failed work requests are never fatal; the former are
//! logged, the latter reach script as callback arguments.

pub mod r#async;
pub mod wrap;

use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;

use crate::config::RuntimeConfig;
use crate::vm::interp;
use crate::vm::value::JsValue;
use crate::vm::{Abrupt, CompileError, CompiledScript, EngineError, ErrorKind, Exception, ScriptError, VM};
use r#async::{EventLoop, LoopContext, WorkError};
use wrap::{WrapId, WrapRegistry};

/// Why a runtime stopped running script.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Fatal {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Script(#[from] ScriptError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("exit requested with status {0}")]
    Exit(i32),
}

impl Fatal {
    /// Process status for this outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            Fatal::Exit(code) => *code,
            _ => 1,
        }
    }
}

pub struct Runtime {
    pub vm: VM,
    pub wraps: WrapRegistry,
    pub(crate) event_loop: EventLoop<Runtime>,
    config: RuntimeConfig,
    argv: Vec<String>,
    /// First fatal outcome raised where it could not be returned directly.
    fatal: Option<Fatal>,
    stdout: Box<dyn Write>,
    stderr: Box<dyn Write>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> io::Result<Self> {
        let event_loop = EventLoop::new(&config)?;
        Ok(Self {
            vm: VM::new(&config),
            wraps: WrapRegistry::new(),
            event_loop,
            config,
            argv: Vec::new(),
            fatal: None,
            stdout: Box::new(io::stdout()),
            stderr: Box::new(io::stderr()),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Replace the sink for `node.print`.
    pub fn set_stdout(&mut self, out: Box<dyn Write>) {
        self.stdout = out;
    }

    /// Replace the sink for `node.debug` and diagnostics.
    pub fn set_stderr(&mut self, out: Box<dyn Write>) {
        self.stderr = out;
    }

    pub fn stdout(&mut self) -> &mut dyn Write {
        &mut *self.stdout
    }

    pub fn stderr(&mut self) -> &mut dyn Write {
        &mut *self.stderr
    }

    /// Process arguments exposed to script as `ARGV`. Takes effect at
    /// bootstrap.
    pub fn set_argv(&mut self, argv: Vec<String>) {
        self.argv = argv;
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn compile(&mut self, source: &str, resource: &str) -> Result<CompiledScript, CompileError> {
        self.vm.compile(source, resource)
    }

    /// Run a compiled unit to completion. Pending loop work is not run.
    pub fn run(&mut self, script: &CompiledScript) -> Result<JsValue, Fatal> {
        tracing::debug!(resource = script.resource(), unit = script.unit(), "running script");
        match interp::run_script(self, script) {
            Ok(value) => Ok(value),
            Err(Abrupt::Throw(exception)) => Err(Fatal::Script(self.script_error(*exception))),
            Err(Abrupt::Exit(code)) => Err(self.fatal.take().unwrap_or(Fatal::Exit(code))),
        }
    }

    pub fn execute_string(&mut self, source: &str, resource: &str) -> Result<JsValue, Fatal> {
        let script = self.compile(source, resource)?;
        self.run(&script)
    }

    /// Install the native bindings, then run the bootstrap scripts in order.
    pub fn bootstrap(&mut self) -> Result<(), Fatal> {
        self.bootstrap_with(crate::bootstrap::BOOTSTRAP_SCRIPTS)
    }

    /// [`bootstrap`](Self::bootstrap) with an explicit script sequence of
    /// `(resource, source)` pairs. Stops at the first failure.
    pub fn bootstrap_with(&mut self, scripts: &[(&str, &str)]) -> Result<(), Fatal> {
        crate::stdlib::install(self);
        for (resource, source) in scripts {
            tracing::debug!(resource, "bootstrap script");
            self.execute_string(source, resource)?;
        }
        Ok(())
    }

    /// Drive the event loop until it has nothing left to do or a fatal
    /// outcome is recorded.
    pub fn run_loop(&mut self) -> Result<(), Fatal> {
        if let Err(e) = r#async::run(self) {
            self.record_fatal(Fatal::Engine(EngineError::new("EventLoop::run", e.to_string())));
        }
        match self.fatal.take() {
            Some(fatal) => Err(fatal),
            None => Ok(()),
        }
    }

    /// Write the diagnostic block for `fatal` to the diagnostic sink.
    pub fn report(&mut self, fatal: &Fatal) {
        let out = &mut *self.stderr;
        let result = match fatal {
            Fatal::Compile(e) => e.report(out),
            Fatal::Script(e) => e.report(out),
            Fatal::Engine(e) => e.report(out),
            Fatal::Exit(_) => Ok(()),
        };
        if let Err(e) = result.and_then(|()| out.flush()) {
            tracing::error!(error = %e, "failed to write diagnostics");
        }
    }

    /// Remember `fatal` (the first one wins) and stop the loop.
    pub fn record_fatal(&mut self, fatal: Fatal) {
        tracing::error!(%fatal, "fatal error");
        if self.fatal.is_none() {
            self.fatal = Some(fatal);
        }
        self.event_loop.stop();
    }

    /// Queue blocking `work` on the pool. `origin` stays attached until
    /// `done` has run. Failing to queue is an engine error.
    pub fn submit_work<T, W, D>(&mut self, origin: Option<WrapId>, work: W, done: D) -> Result<(), Abrupt>
    where
        T: Send + 'static,
        W: FnOnce() -> Result<T, WorkError> + Send + 'static,
        D: FnOnce(&mut Runtime, Result<T, WorkError>) + 'static,
    {
        if let Some(id) = origin
            && let Err(e) = self.wraps.attach(id)
        {
            return Err(self.vm.throw(ErrorKind::Error, e.to_string()));
        }

        match self.event_loop.submit(origin, work, done) {
            Ok(_) => Ok(()),
            Err(e) => {
                if let Some(id) = origin {
                    self.release_origin(id);
                }
                self.record_fatal(Fatal::Engine(EngineError::new("Runtime::submit_work", e.to_string())));
                Err(Abrupt::Exit(1))
            }
        }
    }

    /// Call back into script from the loop. An uncaught exception or an exit
    /// request is recorded as fatal and yields `None`.
    pub fn invoke_callback(&mut self, callback: &JsValue, this: JsValue, args: Vec<JsValue>) -> Option<JsValue> {
        if self.should_exit() {
            return None;
        }
        match interp::call_function(self, callback, this, args) {
            Ok(value) => Some(value),
            Err(Abrupt::Throw(exception)) => {
                let err = self.script_error(*exception);
                self.record_fatal(Fatal::Script(err));
                None
            }
            Err(Abrupt::Exit(code)) => {
                let fatal = self.fatal.take().unwrap_or(Fatal::Exit(code));
                self.record_fatal(fatal);
                None
            }
        }
    }

    /// Detach an uncaught exception from engine values.
    pub fn script_error(&self, exception: Exception) -> ScriptError {
        ScriptError {
            message: exception.value.to_js_string(),
            location: self.vm.locate(exception.span),
            stack: exception.stack,
        }
    }

    /// Run collections until no new object is found unreachable. Returns the
    /// number of native handles destroyed.
    pub fn collect_garbage(&mut self) -> usize {
        let mut destroyed = 0;
        loop {
            let released = self.vm.collect_garbage();
            if released.is_empty() {
                break;
            }
            for id in released {
                if self.wraps.on_weak(id, &mut self.vm) {
                    destroyed += 1;
                }
            }
        }
        if destroyed > 0 {
            tracing::debug!(destroyed, "collected native handles");
        }
        destroyed
    }

    /// Destroy every native handle. Also done on drop.
    pub fn teardown(&mut self) {
        let destroyed = self.wraps.destroy_all(&mut self.vm);
        if destroyed > 0 {
            tracing::debug!(destroyed, "destroyed native handles at teardown");
        }
    }
}

impl LoopContext for Runtime {
    fn event_loop(&mut self) -> &mut EventLoop<Self> {
        &mut self.event_loop
    }

    fn release_origin(&mut self, origin: WrapId) {
        if let Err(e) = self.wraps.detach(origin, &mut self.vm) {
            tracing::warn!(%origin, "release failed: {}", e);
        }
    }

    fn safe_point(&mut self) {
        self.collect_garbage();
    }

    fn should_exit(&self) -> bool {
        self.fatal.is_some()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Clonable in-memory sink, for capturing script output.
#[derive(Clone, Default)]
pub struct SharedOutput(Rc<RefCell<Vec<u8>>>);

impl SharedOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

impl Write for SharedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
