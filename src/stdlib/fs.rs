//! `node.fs`: file operations on the worker pool.
//!
//! Every operation returns immediately. The blocking call runs on a worker
//! and its callback runs later on the loop thread, with an error object as
//! the first argument on failure and `null` on success. A `File` object stays
//! attached while any of its operations is in flight.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::mem;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::sync::Arc;

use super::{this_handle, work_error, wrap_this};
use crate::runtime::Runtime;
use crate::runtime::r#async::WorkError;
use crate::runtime::wrap::{HasExternalSize, WrapId};
use crate::vm::builtins::arg;
use crate::vm::value::{JsObject, JsValue, NativeFn};
use crate::vm::{Abrupt, VM};

/// An open file, shared with in-flight jobs.
#[derive(Default)]
pub struct FileResource {
    file: Option<Arc<File>>,
    path: String,
}

impl HasExternalSize for FileResource {
    fn external_size(&self) -> usize {
        mem::size_of::<Self>() + self.path.capacity()
    }
}

pub(crate) fn module(vm: &VM) -> JsObject {
    let fs = vm.new_object();
    let methods: [(&'static str, NativeFn); 4] = [
        ("open", native_file_open),
        ("read", native_file_read),
        ("write", native_file_write),
        ("close", native_file_close),
    ];
    fs.set("File", JsValue::from(vm.new_constructor("File", native_file_new, 1, &methods)));
    fs.set("unlink", JsValue::from(vm.new_native("unlink", native_unlink)));
    fs
}

fn open_options(flags: i32, mode: u32) -> OpenOptions {
    let mut options = OpenOptions::new();
    match flags & libc::O_ACCMODE {
        libc::O_WRONLY => options.write(true),
        libc::O_RDWR => options.read(true).write(true),
        _ => options.read(true),
    };
    if flags & libc::O_CREAT != 0 {
        if flags & libc::O_EXCL != 0 {
            options.create_new(true);
        } else {
            options.create(true);
        }
    }
    options
        .truncate(flags & libc::O_TRUNC != 0)
        .append(flags & libc::O_APPEND != 0)
        .custom_flags(flags & libc::O_SYNC)
        .mode(mode);
    options
}

/// Optional file offset; anything but a non-negative number means "current
/// position".
fn position(value: &JsValue) -> Option<u64> {
    value.as_number().filter(|n| *n >= 0.0).map(|n| n as u64)
}

fn callback_arg(args: &[JsValue], index: usize) -> Option<JsValue> {
    Some(arg(args, index)).filter(JsValue::is_callable)
}

/// Call `callback` with `this` bound to the file object, if it is still
/// around.
fn complete(rt: &mut Runtime, id: WrapId, callback: Option<JsValue>, args: Vec<JsValue>) {
    let Some(callback) = callback else {
        return;
    };
    let this = rt.wraps.handle(id).map_or(JsValue::Undefined, JsValue::from);
    rt.invoke_callback(&callback, this, args);
}

/// The `File` bound to `this` with its descriptor and path.
fn this_file(rt: &Runtime, this: &JsValue) -> Option<(WrapId, Option<Arc<File>>, String)> {
    let id = this_handle(rt, this)?;
    match rt.wraps.resource::<FileResource>(id) {
        Some(resource) => Some((id, resource.file.clone(), resource.path.clone())),
        None => {
            tracing::warn!(%id, "handle is not a file");
            None
        }
    }
}

fn bad_descriptor() -> WorkError {
    WorkError::Io {
        code: Some(libc::EBADF),
        message: "file is not open".to_string(),
    }
}

/// `new node.fs.File()`
fn native_file_new(rt: &mut Runtime, this: &JsValue, _args: Vec<JsValue>) -> Result<JsValue, Abrupt> {
    wrap_this(rt, this, Box::new(FileResource::default()));
    Ok(JsValue::Undefined)
}

/// `file.open(path, flags, mode, callback)`
fn native_file_open(rt: &mut Runtime, this: &JsValue, args: Vec<JsValue>) -> Result<JsValue, Abrupt> {
    let Some((id, _, _)) = this_file(rt, this) else {
        return Ok(JsValue::Undefined);
    };
    let path = arg(&args, 0).to_js_string();
    let flags = arg(&args, 1).as_number().unwrap_or(0.0) as i32;
    let mode = arg(&args, 2).as_number().unwrap_or(f64::from(0o666)) as u32;
    let callback = callback_arg(&args, 3);

    if let Some(resource) = rt.wraps.resource_mut::<FileResource>(id) {
        resource.path = path.clone();
    }
    let work_path = path.clone();
    rt.submit_work(
        Some(id),
        move || Ok(open_options(flags, mode).open(&work_path)?),
        move |rt: &mut Runtime, result: Result<File, WorkError>| match result {
            Ok(file) => {
                if let Some(resource) = rt.wraps.resource_mut::<FileResource>(id) {
                    resource.file = Some(Arc::new(file));
                }
                complete(rt, id, callback, vec![JsValue::Null]);
            }
            Err(err) => {
                let error = work_error(rt, &err, "open", Some(&path));
                complete(rt, id, callback, vec![error]);
            }
        },
    )?;
    Ok(JsValue::Undefined)
}

/// Largest single read. Bigger requests fail with `EINVAL` instead of
/// allocating.
const MAX_READ_LENGTH: usize = 1 << 30;

/// How `read` hands bytes to script.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Encoding {
    Utf8,
    Ascii,
    /// An array of byte values.
    Raw,
}

impl Encoding {
    /// A missing encoding reads text; anything else that is not a known name
    /// reads raw bytes.
    fn parse(value: &JsValue) -> Self {
        match value {
            JsValue::Undefined => Encoding::Utf8,
            JsValue::String(name) if name.eq_ignore_ascii_case("utf8") => Encoding::Utf8,
            JsValue::String(name) if name.eq_ignore_ascii_case("ascii") => Encoding::Ascii,
            _ => Encoding::Raw,
        }
    }

    fn decode(self, vm: &VM, buf: &[u8]) -> JsValue {
        match self {
            Encoding::Utf8 => JsValue::string(String::from_utf8_lossy(buf)),
            Encoding::Ascii => JsValue::string(buf.iter().map(|b| char::from(b & 0x7f)).collect::<String>()),
            Encoding::Raw => {
                let bytes = buf.iter().map(|b| JsValue::Number(f64::from(*b))).collect();
                JsValue::from(vm.new_array(bytes))
            }
        }
    }
}

/// Length of `buf` without a trailing incomplete UTF-8 sequence.
fn utf8_boundary(buf: &[u8]) -> usize {
    let len = buf.len();
    for back in 1..=len.min(3) {
        let byte = buf[len - back];
        if byte & 0xc0 == 0x80 {
            continue;
        }
        let width = match byte {
            0xc0..=0xdf => 2,
            0xe0..=0xef => 3,
            0xf0..=0xf7 => 4,
            _ => 1,
        };
        return if width > back { len - back } else { len };
    }
    len
}

fn read_buffer(length: f64) -> Result<Vec<u8>, WorkError> {
    if length.is_nan() || length <= 0.0 {
        return Ok(Vec::new());
    }
    if length > MAX_READ_LENGTH as f64 {
        return Err(WorkError::Io {
            code: Some(libc::EINVAL),
            message: format!("read length {} is too large", length),
        });
    }
    let length = length as usize;
    let mut buf = Vec::new();
    buf.try_reserve_exact(length).map_err(|e| WorkError::Io {
        code: Some(libc::ENOMEM),
        message: e.to_string(),
    })?;
    buf.resize(length, 0);
    Ok(buf)
}

/// `file.read(length, position, [encoding,] callback)`. The callback
/// receives `(error, data, bytesRead)`; `data` is empty at end of file.
///
/// Text reads stop before a character split by the end of the buffer, so
/// `bytesRead` may be short of what the file had; the next read picks the
/// character up whole.
fn native_file_read(rt: &mut Runtime, this: &JsValue, args: Vec<JsValue>) -> Result<JsValue, Abrupt> {
    let Some((id, file, path)) = this_file(rt, this) else {
        return Ok(JsValue::Undefined);
    };
    let length = arg(&args, 0).as_number().unwrap_or(0.0);
    let offset = position(&arg(&args, 1));
    let (encoding, callback) = match callback_arg(&args, 2) {
        Some(callback) => (Encoding::Utf8, Some(callback)),
        None => (Encoding::parse(&arg(&args, 2)), callback_arg(&args, 3)),
    };

    rt.submit_work(
        Some(id),
        move || {
            let file = file.ok_or_else(bad_descriptor)?;
            let mut buf = read_buffer(length)?;
            let n = match offset {
                Some(offset) => file.read_at(&mut buf, offset)?,
                None => (&*file).read(&mut buf)?,
            };
            buf.truncate(n);
            if encoding == Encoding::Utf8 {
                let boundary = utf8_boundary(&buf);
                let tail = buf.len() - boundary;
                if tail > 0 && boundary > 0 {
                    // an unpositioned read has to give the tail back to the cursor
                    let rewound = offset.is_some() || (&*file).seek(SeekFrom::Current(-(tail as i64))).is_ok();
                    if rewound {
                        buf.truncate(boundary);
                    }
                }
            }
            Ok(buf)
        },
        move |rt: &mut Runtime, result: Result<Vec<u8>, WorkError>| {
            let args = match result {
                Ok(buf) => vec![
                    JsValue::Null,
                    encoding.decode(&rt.vm, &buf),
                    JsValue::Number(buf.len() as f64),
                ],
                Err(err) => vec![work_error(rt, &err, "read", Some(&path))],
            };
            complete(rt, id, callback, args);
        },
    )?;
    Ok(JsValue::Undefined)
}

/// `file.write(data, position, callback)`. The callback receives
/// `(error, bytesWritten)`.
fn native_file_write(rt: &mut Runtime, this: &JsValue, args: Vec<JsValue>) -> Result<JsValue, Abrupt> {
    let Some((id, file, path)) = this_file(rt, this) else {
        return Ok(JsValue::Undefined);
    };
    let data = arg(&args, 0).to_js_string().into_bytes();
    let offset = position(&arg(&args, 1));
    let callback = callback_arg(&args, 2);

    rt.submit_work(
        Some(id),
        move || {
            let file = file.ok_or_else(bad_descriptor)?;
            match offset {
                Some(offset) => file.write_all_at(&data, offset)?,
                None => (&*file).write_all(&data)?,
            }
            Ok(data.len())
        },
        move |rt: &mut Runtime, result: Result<usize, WorkError>| {
            let args = match result {
                Ok(written) => vec![JsValue::Null, JsValue::Number(written as f64)],
                Err(err) => vec![work_error(rt, &err, "write", Some(&path))],
            };
            complete(rt, id, callback, args);
        },
    )?;
    Ok(JsValue::Undefined)
}

/// `file.close([callback])`. The descriptor closes once the last in-flight
/// operation on it finishes.
fn native_file_close(rt: &mut Runtime, this: &JsValue, args: Vec<JsValue>) -> Result<JsValue, Abrupt> {
    let Some((id, _, path)) = this_file(rt, this) else {
        return Ok(JsValue::Undefined);
    };
    let callback = callback_arg(&args, 0);
    let file = rt
        .wraps
        .resource_mut::<FileResource>(id)
        .and_then(|resource| resource.file.take());

    rt.submit_work(
        Some(id),
        move || file.ok_or_else(bad_descriptor).map(drop),
        move |rt: &mut Runtime, result: Result<(), WorkError>| {
            let args = match result {
                Ok(()) => vec![JsValue::Null],
                Err(err) => vec![work_error(rt, &err, "close", Some(&path))],
            };
            complete(rt, id, callback, args);
        },
    )?;
    Ok(JsValue::Undefined)
}

/// `node.fs.unlink(path, callback)`
fn native_unlink(rt: &mut Runtime, _this: &JsValue, args: Vec<JsValue>) -> Result<JsValue, Abrupt> {
    let path = arg(&args, 0).to_js_string();
    let callback = callback_arg(&args, 1);
    let work_path = path.clone();

    rt.submit_work(
        None,
        move || Ok(fs::remove_file(&work_path)?),
        move |rt: &mut Runtime, result: Result<(), WorkError>| {
            let Some(callback) = callback else {
                return;
            };
            let args = match result {
                Ok(()) => vec![JsValue::Null],
                Err(err) => vec![work_error(rt, &err, "unlink", Some(&path))],
            };
            rt.invoke_callback(&callback, JsValue::Undefined, args);
        },
    )?;
    Ok(JsValue::Undefined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::SharedOutput;
    use crate::runtime::wrap::AttachState;
    use std::path::PathBuf;

    fn runtime() -> (Runtime, SharedOutput) {
        let mut rt = Runtime::new(RuntimeConfig {
            worker_threads: 2,
            ..RuntimeConfig::default()
        })
        .unwrap();
        let out = SharedOutput::new();
        rt.set_stdout(Box::new(out.clone()));
        rt.bootstrap_with(&[]).unwrap();
        (rt, out)
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("node-core-fs-{}-{}", std::process::id(), name))
    }

    #[test]
    fn test_write_then_read_back() {
        let (mut rt, out) = runtime();
        let path = temp_path("roundtrip");
        let source = format!(
            r#"
            var C = node.constants;
            var f = new node.fs.File();
            f.open({path:?}, C.O_WRONLY | C.O_CREAT | C.O_TRUNC, 420, function (err) {{
                if (err) throw err;
                this.write("hello world", null, function (err, written) {{
                    node.print("wrote " + written + ";");
                    this.close(function () {{
                        var r = new node.fs.File();
                        r.open({path:?}, C.O_RDONLY, 0, function (err) {{
                            this.read(5, 6, function (err, data, n) {{
                                node.print(data + ":" + n);
                                this.close();
                            }});
                        }});
                    }});
                }});
            }});
            "#,
            path = path.display().to_string()
        );
        rt.execute_string(&source, "rw.js").unwrap();
        // nothing has completed yet, the File is held by the open request
        let id = rt.wraps.unwrap(&rt.vm.global().get("f")).unwrap();
        assert_eq!(rt.wraps.state(id).unwrap().state().count(), 1);

        rt.run_loop().unwrap();
        assert_eq!(out.contents(), "wrote 11;world:5");
        assert_eq!(rt.wraps.state(id).unwrap().state(), AttachState::Detachable);
        assert_eq!(rt.event_loop.pending_requests(), 0);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_open_missing_file_reports_errno() {
        let (mut rt, out) = runtime();
        let path = temp_path("missing");
        let source = format!(
            r#"
            new node.fs.File().open({:?}, node.constants.O_RDONLY, 0, function (err) {{
                node.print(err.code + " " + (err.errno === node.constants.ENOENT));
            }});
            "#,
            path.display().to_string()
        );
        rt.execute_string(&source, "missing.js").unwrap();
        rt.run_loop().unwrap();
        assert_eq!(out.contents(), "ENOENT true");
    }

    #[test]
    fn test_in_flight_file_survives_collection() {
        let (mut rt, out) = runtime();
        let path = temp_path("survive");
        fs::write(&path, "kept").unwrap();
        let source = format!(
            r#"
            (function () {{
                var f = new node.fs.File();
                f.open({:?}, node.constants.O_RDONLY, 0, function (err) {{
                    this.read(16, 0, function (err, data) {{ node.print(data); }});
                }});
            }})();
            node.gc();
            "#,
            path.display().to_string()
        );
        rt.execute_string(&source, "survive.js").unwrap();
        assert_eq!(rt.wraps.live(), 1);

        rt.run_loop().unwrap();
        assert_eq!(out.contents(), "kept");
        // collectable once the last callback holding it is gone
        assert_eq!(rt.wraps.live(), 0);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_read_on_closed_file_is_ebadf() {
        let (mut rt, out) = runtime();
        rt.execute_string(
            "new node.fs.File().read(4, 0, function (err) { node.print(err.code); });",
            "closed.js",
        )
        .unwrap();
        rt.run_loop().unwrap();
        assert_eq!(out.contents(), "EBADF");
    }

    #[test]
    fn test_oversized_read_is_einval() {
        let (mut rt, out) = runtime();
        let source = r#"
            new node.fs.File().open("/dev/zero", node.constants.O_RDONLY, 0, function (err) {
                this.read(1e18, 0, function (err, data) {
                    node.print(err.code + " " + typeof data);
                    this.close();
                });
            });
        "#;
        rt.execute_string(source, "huge.js").unwrap();
        rt.run_loop().unwrap();
        assert_eq!(out.contents(), "EINVAL undefined");
    }

    #[test]
    fn test_read_encodings() {
        let (mut rt, out) = runtime();
        let path = temp_path("encodings");
        fs::write(&path, "aé!").unwrap();
        let source = format!(
            r#"
            new node.fs.File().open({:?}, node.constants.O_RDONLY, 0, function (err) {{
                var file = this;
                file.read(2, 0, function (err, text, n) {{
                    node.print(text + n + ";");
                    file.read(4, 0, "raw", function (err, bytes, n) {{
                        node.print(bytes.join(" ") + ";");
                        file.read(1, 3, "ascii", function (err, text) {{
                            node.print(text);
                            file.close();
                        }});
                    }});
                }});
            }});
            "#,
            path.display().to_string()
        );
        rt.execute_string(&source, "encodings.js").unwrap();
        rt.run_loop().unwrap();
        // the split character is left for the next read
        assert_eq!(out.contents(), "a1;97 195 169 33;!");
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_utf8_boundary() {
        assert_eq!(utf8_boundary(b""), 0);
        assert_eq!(utf8_boundary(b"abc"), 3);
        assert_eq!(utf8_boundary("aé".as_bytes()), 3);
        assert_eq!(utf8_boundary(&"aé".as_bytes()[..2]), 1);
        assert_eq!(utf8_boundary(&"a€".as_bytes()[..3]), 1);
        assert_eq!(utf8_boundary(&"€".as_bytes()[..1]), 0);
    }

    #[test]
    fn test_unlink() {
        let (mut rt, out) = runtime();
        let path = temp_path("unlink");
        fs::write(&path, "x").unwrap();
        let source = format!(
            "node.fs.unlink({p:?}, function (err) {{ node.print(err === null); \
             node.fs.unlink({p:?}, function (err) {{ node.print(' ' + err.code); }}); }});",
            p = path.display().to_string()
        );
        rt.execute_string(&source, "unlink.js").unwrap();
        rt.run_loop().unwrap();
        assert_eq!(out.contents(), "true ENOENT");
        assert!(!path.exists());
    }
}
