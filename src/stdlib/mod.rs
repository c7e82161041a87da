//! Native bindings exposed to script through the global `node` object.

pub mod fs;
pub mod timer;

use crate::runtime::r#async::WorkError;
use crate::runtime::wrap::{BindingError, NativeResource, WrapId};
use crate::runtime::{Fatal, Runtime};
use crate::vm::builtins::arg;
use crate::vm::interp;
use crate::vm::value::{JsObject, JsValue, NativeFn};
use crate::vm::{Abrupt, ErrorKind, VM};

/// Error numbers known by name, in `node.constants` and in error objects.
const ERRNO: [(&str, i32); 15] = [
    ("EPERM", libc::EPERM),
    ("ENOENT", libc::ENOENT),
    ("EIO", libc::EIO),
    ("ENOMEM", libc::ENOMEM),
    ("EBADF", libc::EBADF),
    ("EAGAIN", libc::EAGAIN),
    ("EACCES", libc::EACCES),
    ("EEXIST", libc::EEXIST),
    ("ENOTDIR", libc::ENOTDIR),
    ("EISDIR", libc::EISDIR),
    ("EINVAL", libc::EINVAL),
    ("EMFILE", libc::EMFILE),
    ("ENOSPC", libc::ENOSPC),
    ("EPIPE", libc::EPIPE),
    ("ENOTEMPTY", libc::ENOTEMPTY),
];

const OPEN_FLAGS: [(&str, i32); 8] = [
    ("O_RDONLY", libc::O_RDONLY),
    ("O_WRONLY", libc::O_WRONLY),
    ("O_RDWR", libc::O_RDWR),
    ("O_CREAT", libc::O_CREAT),
    ("O_EXCL", libc::O_EXCL),
    ("O_TRUNC", libc::O_TRUNC),
    ("O_APPEND", libc::O_APPEND),
    ("O_SYNC", libc::O_SYNC),
];

const FILE_MODES: [(&str, u32); 4] = [
    ("S_IFMT", libc::S_IFMT),
    ("S_IFREG", libc::S_IFREG),
    ("S_IFDIR", libc::S_IFDIR),
    ("S_IFLNK", libc::S_IFLNK),
];

/// Create the `node` object and `ARGV`.
pub fn install(rt: &mut Runtime) {
    let vm = &rt.vm;
    let node = vm.new_object();

    let natives: [(&'static str, NativeFn); 5] = [
        ("compile", native_compile),
        ("debug", native_debug),
        ("print", native_print),
        ("exit", native_exit),
        ("gc", native_gc),
    ];
    for (name, func) in natives {
        node.set(name, JsValue::from(vm.new_native(name, func)));
    }
    node.set("constants", JsValue::from(constants(vm)));
    node.set("Timer", JsValue::from(timer::constructor(vm)));
    node.set("fs", JsValue::from(fs::module(vm)));
    vm.set_global("node", JsValue::from(node));

    let argv = rt.argv().iter().map(JsValue::string).collect();
    vm.set_global("ARGV", JsValue::from(vm.new_array(argv)));
    tracing::debug!(argc = rt.argv().len(), "installed native bindings");
}

fn constants(vm: &VM) -> JsObject {
    let constants = vm.new_object();
    for (name, value) in ERRNO.iter().chain(OPEN_FLAGS.iter()) {
        constants.set(name, JsValue::Number(f64::from(*value)));
    }
    for (name, value) in FILE_MODES {
        constants.set(name, JsValue::Number(f64::from(value)));
    }
    constants
}

fn errno_name(code: i32) -> Option<&'static str> {
    ERRNO.iter().find(|(_, n)| *n == code).map(|(name, _)| *name)
}

/// Error object handed to a callback for a failed work request. Carries
/// `errno`, `code` and `syscall` the way script code expects.
pub(crate) fn work_error(rt: &Runtime, err: &WorkError, syscall: &str, path: Option<&str>) -> JsValue {
    let code = err.code();
    let name = code.and_then(errno_name);
    let mut message = match name {
        Some(name) => format!("{}, {}", name, syscall),
        None => format!("{}, {}", err, syscall),
    };
    if let Some(path) = path {
        message.push_str(&format!(" '{}'", path));
    }

    let error = rt.vm.new_error(ErrorKind::Error, message);
    if let Some(code) = code {
        error.set("errno", JsValue::Number(f64::from(code)));
    }
    if let Some(name) = name {
        error.set("code", JsValue::from(name));
    }
    error.set("syscall", JsValue::from(syscall));
    JsValue::from(error)
}

/// The handle bound to `this`. Binding failures are logged and the calling
/// method returns `undefined`.
pub(crate) fn this_handle(rt: &Runtime, this: &JsValue) -> Option<WrapId> {
    rt.wraps.unwrap(this)
}

/// Bind `resource` to a freshly constructed `this`.
pub(crate) fn wrap_this(rt: &mut Runtime, this: &JsValue, resource: Box<dyn NativeResource>) -> Option<WrapId> {
    let Some(object) = this.as_object() else {
        tracing::warn!("wrap failed: {}", BindingError::EmptyHandle);
        return None;
    };
    match rt.wraps.wrap(&mut rt.vm, object, resource) {
        Ok(id) => Some(id),
        Err(err) => {
            tracing::warn!("wrap failed: {}", err);
            None
        }
    }
}

/// `node.compile(source, resource)`: compile and run a unit. Any failure in
/// it is fatal.
fn native_compile(rt: &mut Runtime, _this: &JsValue, args: Vec<JsValue>) -> Result<JsValue, Abrupt> {
    let source = arg(&args, 0).to_js_string();
    let resource = match arg(&args, 1) {
        JsValue::Undefined => "<compile>".to_string(),
        other => other.to_js_string(),
    };

    let script = match rt.compile(&source, &resource) {
        Ok(script) => script,
        Err(err) => {
            rt.record_fatal(Fatal::Compile(err));
            return Err(Abrupt::Exit(1));
        }
    };
    match interp::run_script(rt, &script) {
        Err(Abrupt::Throw(exception)) => {
            let err = rt.script_error(*exception);
            rt.record_fatal(Fatal::Script(err));
            Err(Abrupt::Exit(1))
        }
        other => other,
    }
}

/// `node.debug(message)`
fn native_debug(rt: &mut Runtime, _this: &JsValue, args: Vec<JsValue>) -> Result<JsValue, Abrupt> {
    let message = arg(&args, 0).to_js_string();
    let out = rt.stderr();
    let written = writeln!(out, "DEBUG: {}", message).and_then(|()| out.flush());
    written.map_err(|e| rt.vm.throw(ErrorKind::Error, e.to_string()))?;
    Ok(JsValue::Undefined)
}

/// `node.print(text)`, no newline added.
fn native_print(rt: &mut Runtime, _this: &JsValue, args: Vec<JsValue>) -> Result<JsValue, Abrupt> {
    let text = arg(&args, 0).to_js_string();
    let out = rt.stdout();
    let written = out.write_all(text.as_bytes()).and_then(|()| out.flush());
    written.map_err(|e| rt.vm.throw(ErrorKind::Error, e.to_string()))?;
    Ok(JsValue::Undefined)
}

/// `node.exit([code])`
fn native_exit(_rt: &mut Runtime, _this: &JsValue, args: Vec<JsValue>) -> Result<JsValue, Abrupt> {
    let code = match arg(&args, 0) {
        JsValue::Undefined => 0,
        other => other.to_number() as i32,
    };
    tracing::debug!(code, "exit requested");
    Err(Abrupt::Exit(code))
}

/// `node.gc()`
fn native_gc(rt: &mut Runtime, _this: &JsValue, _args: Vec<JsValue>) -> Result<JsValue, Abrupt> {
    let destroyed = rt.collect_garbage();
    Ok(JsValue::Number(destroyed as f64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::SharedOutput;

    fn runtime() -> (Runtime, SharedOutput, SharedOutput) {
        let mut rt = Runtime::new(RuntimeConfig {
            worker_threads: 1,
            ..RuntimeConfig::default()
        })
        .unwrap();
        let (out, err) = (SharedOutput::new(), SharedOutput::new());
        rt.set_stdout(Box::new(out.clone()));
        rt.set_stderr(Box::new(err.clone()));
        rt.set_argv(vec!["node-core".into(), "main.js".into()]);
        rt.bootstrap_with(&[]).unwrap();
        (rt, out, err)
    }

    #[test]
    fn test_print_and_debug_sinks() {
        let (mut rt, out, err) = runtime();
        rt.execute_string("node.print('a'); node.print(1 + 1); node.debug('x');", "io.js")
            .unwrap();
        assert_eq!(out.contents(), "a2");
        assert_eq!(err.contents(), "DEBUG: x\n");
    }

    #[test]
    fn test_argv_and_constants() {
        let (mut rt, _, _) = runtime();
        let value = rt
            .execute_string("ARGV.length + ':' + ARGV[1] + ':' + node.constants.ENOENT", "argv.js")
            .unwrap();
        assert_eq!(value.to_js_string(), format!("2:main.js:{}", libc::ENOENT));
    }

    #[test]
    fn test_compile_runs_in_global_scope() {
        let (mut rt, _, _) = runtime();
        let source = "node.compile('var shared = 40; shared + 1;', 'unit.js') + shared;";
        assert_eq!(rt.execute_string(source, "main.js").unwrap().to_js_string(), "81");
    }

    #[test]
    fn test_uncaught_throw_inside_compile_is_fatal() {
        let (mut rt, out, _) = runtime();
        let source = "try { node.compile('throw new Error(\"inner\");', 'unit.js'); } catch (e) { node.print('caught'); }";
        let Err(Fatal::Script(err)) = rt.execute_string(source, "main.js") else {
            panic!("expected a script error");
        };
        assert_eq!(err.message, "Error: inner");
        assert_eq!(err.location.unwrap().resource, "unit.js");
        assert_eq!(out.contents(), "");
    }

    #[test]
    fn test_work_error_shape() {
        let (rt, _, _) = runtime();
        let err = WorkError::from(std::io::Error::from_raw_os_error(libc::ENOENT));
        let value = work_error(&rt, &err, "open", Some("/missing"));
        let object = value.as_object().unwrap();
        assert_eq!(object.get("message").to_js_string(), "ENOENT, open '/missing'");
        assert_eq!(object.get("code").to_js_string(), "ENOENT");
        assert_eq!(object.get("errno").as_number(), Some(f64::from(libc::ENOENT)));

        let value = work_error(&rt, &WorkError::Panicked, "read", None);
        let object = value.as_object().unwrap();
        assert_eq!(object.get("message").to_js_string(), "work request panicked, read");
        assert!(matches!(object.get("errno"), JsValue::Undefined));
    }
}
