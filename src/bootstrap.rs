//! Process contract: bootstrap the runtime, run the main script named by
//! `ARGV[1]`, drive the loop, report, and produce an exit status.

use std::fs;
use std::io::{self, Write};
use std::thread;

use crate::config::RuntimeConfig;
use crate::runtime::{Fatal, Runtime};
use crate::vm::EngineError;

/// Scripts run at startup, lowest level first.
pub const BOOTSTRAP_SCRIPTS: &[(&str, &str)] = &[
    ("timers.js", include_str!("../lib/timers.js")),
    ("fs.js", include_str!("../lib/fs.js")),
    ("node.js", include_str!("../lib/node.js")),
];

/// Stack of the script thread. The interpreter recurses per script call.
const SCRIPT_STACK_SIZE: usize = 64 * 1024 * 1024;

/// Run `argv` on a dedicated script thread and return the exit status.
pub fn start(config: RuntimeConfig, argv: Vec<String>) -> i32 {
    let spawned = thread::Builder::new()
        .name("node-main".to_string())
        .stack_size(SCRIPT_STACK_SIZE)
        .spawn(move || start_with_output(config, argv, Box::new(io::stdout()), Box::new(io::stderr())));

    match spawned {
        Ok(handle) => handle.join().unwrap_or_else(|_| {
            tracing::error!("script thread panicked");
            1
        }),
        Err(e) => {
            let err = EngineError::new("thread::spawn", e.to_string());
            let _ = err.report(&mut io::stderr());
            1
        }
    }
}

/// [`start`] on the current thread with explicit output sinks.
pub fn start_with_output(
    config: RuntimeConfig,
    argv: Vec<String>,
    stdout: Box<dyn Write>,
    mut stderr: Box<dyn Write>,
) -> i32 {
    let mut rt = match Runtime::new(config) {
        Ok(rt) => rt,
        Err(e) => {
            let err = EngineError::new("Runtime::new", e.to_string());
            let _ = err.report(&mut *stderr);
            return 1;
        }
    };
    rt.set_stdout(stdout);
    rt.set_stderr(stderr);
    rt.set_argv(argv);

    let status = match run_main(&mut rt) {
        Ok(()) => 0,
        Err(fatal) => {
            rt.report(&fatal);
            fatal.exit_code()
        }
    };
    if let Err(e) = rt.stdout().flush() {
        tracing::warn!(error = %e, "failed to flush stdout");
    }
    tracing::debug!(status, "exiting");
    status
}

fn run_main(rt: &mut Runtime) -> Result<(), Fatal> {
    rt.bootstrap()?;

    let Some(path) = rt.argv().get(1).cloned() else {
        let _ = writeln!(rt.stderr(), "No script was specified.");
        return Err(Fatal::Exit(1));
    };
    let source = match fs::read_to_string(&path) {
        Ok(source) => source,
        Err(e) => {
            let _ = writeln!(rt.stderr(), "Error reading '{}': {}", path, e);
            return Err(Fatal::Exit(1));
        }
    };

    tracing::info!(script = %path, "running main script");
    rt.execute_string(&source, &path)?;
    rt.run_loop()
}
