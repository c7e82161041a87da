pub mod builtins;
pub mod error;
pub mod interp;
pub mod value;

pub use error::{Abrupt, CompileError, EngineError, ErrorLocation, Exception, ScriptError, StackFrame};

use std::collections::HashMap;
use std::rc::Rc;

use swc_common::{DUMMY_SP, FileName, SourceMap, Span, Spanned, sync::Lrc};
use swc_ecma_ast::Script;
use swc_ecma_parser::{Parser, StringInput, Syntax, lexer::Lexer};

use crate::config::RuntimeConfig;
use crate::runtime::wrap::WrapId;
use value::{Callable, FunctionCode, JsObject, JsValue, NativeFn, NativeFunction, ObjectData, ObjectKind};

/// A parsed unit ready to run.
#[derive(Clone)]
pub struct CompiledScript {
    unit: usize,
    resource: Rc<str>,
    script: Rc<Script>,
}

impl CompiledScript {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub(crate) fn script(&self) -> &Script {
        &self.script
    }

    pub(crate) fn unit(&self) -> usize {
        self.unit
    }
}

/// Source text of one compiled unit, kept for diagnostics.
struct Unit {
    resource: Rc<str>,
    start: u32,
    text: Rc<str>,
    line_starts: Vec<usize>,
}

impl Unit {
    fn new(resource: Rc<str>, start: u32, text: &str) -> Self {
        let mut line_starts = vec![0];
        line_starts.extend(text.match_indices('\n').map(|(i, _)| i + 1));
        Self {
            resource,
            start,
            text: Rc::from(text),
            line_starts,
        }
    }

    fn contains(&self, pos: u32) -> bool {
        pos >= self.start && pos <= self.start + self.text.len() as u32
    }
}

/// A script function activation, for stack traces and the depth limit.
pub(crate) struct Frame {
    pub function: Rc<str>,
    /// Where the caller invoked this frame.
    pub call_site: Span,
}

/// Engine-side strong reference to a wrapped object.
struct Persistent {
    object: JsObject,
    /// Set once the object was found reachable only through this handle.
    near_death: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Error,
    TypeError,
    RangeError,
    ReferenceError,
    SyntaxError,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 5] = [
        ErrorKind::Error,
        ErrorKind::TypeError,
        ErrorKind::RangeError,
        ErrorKind::ReferenceError,
        ErrorKind::SyntaxError,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::Error => "Error",
            ErrorKind::TypeError => "TypeError",
            ErrorKind::RangeError => "RangeError",
            ErrorKind::ReferenceError => "ReferenceError",
            ErrorKind::SyntaxError => "SyntaxError",
        }
    }
}

/// Intrinsic prototypes.
pub struct Realm {
    pub object_proto: JsObject,
    pub function_proto: JsObject,
    pub array_proto: JsObject,
    pub string_proto: JsObject,
    error_protos: Vec<JsObject>,
}

impl Realm {
    fn new() -> Self {
        let object_proto = JsObject::plain(None);
        let function_proto = JsObject::plain(Some(object_proto.clone()));
        let array_proto = JsObject::plain(Some(object_proto.clone()));
        let string_proto = JsObject::plain(Some(object_proto.clone()));

        let base = JsObject::plain(Some(object_proto.clone()));
        let error_protos = ErrorKind::ALL
            .iter()
            .map(|kind| {
                let proto = match kind {
                    ErrorKind::Error => base.clone(),
                    _ => JsObject::plain(Some(base.clone())),
                };
                proto.set("name", JsValue::from(kind.name()));
                proto.set("message", JsValue::from(""));
                proto
            })
            .collect();

        Self {
            object_proto,
            function_proto,
            array_proto,
            string_proto,
            error_protos,
        }
    }

    pub fn error_proto(&self, kind: ErrorKind) -> &JsObject {
        &self.error_protos[kind as usize]
    }
}

pub struct VM {
    source_map: Lrc<SourceMap>,
    units: Vec<Unit>,
    realm: Realm,
    global: JsObject,
    functions: HashMap<(u32, u32), Rc<FunctionCode>>,
    persistents: HashMap<WrapId, Persistent>,
    external_memory: i64,
    external_since_gc: i64,
    gc_threshold: i64,
    gc_requested: bool,
    pub(crate) frames: Vec<Frame>,
    pub(crate) max_call_depth: usize,
}

impl VM {
    pub fn new(config: &RuntimeConfig) -> Self {
        let realm = Realm::new();
        let global = JsObject::plain(Some(realm.object_proto.clone()));
        let mut vm = Self {
            source_map: Default::default(),
            units: Vec::new(),
            realm,
            global,
            functions: HashMap::new(),
            persistents: HashMap::new(),
            external_memory: 0,
            external_since_gc: 0,
            gc_threshold: config.gc_external_threshold,
            gc_requested: false,
            frames: Vec::new(),
            max_call_depth: config.max_call_depth,
        };
        builtins::setup_builtins(&mut vm);
        vm
    }

    pub fn global(&self) -> &JsObject {
        &self.global
    }

    pub fn realm(&self) -> &Realm {
        &self.realm
    }

    /// Parse `source` as a classic script. `resource` names the unit in
    /// diagnostics.
    pub fn compile(&mut self, source: &str, resource: &str) -> Result<CompiledScript, CompileError> {
        let fm = self
            .source_map
            .new_source_file(FileName::Custom(resource.to_string()).into(), source.to_string());

        let resource: Rc<str> = Rc::from(resource);
        let unit = self.units.len();
        self.units.push(Unit::new(resource.clone(), fm.start_pos.0, source));

        let lexer = Lexer::new(
            Syntax::Es(Default::default()),
            Default::default(),
            StringInput::from(&*fm),
            None,
        );
        let mut parser = Parser::new_from(lexer);
        let parsed = parser.parse_script();
        let recovered = parser.take_errors();

        let script = match parsed {
            Ok(script) => script,
            Err(err) => return Err(self.compile_error(&resource, err.span(), err.kind().msg().to_string())),
        };
        if let Some(err) = recovered.into_iter().next() {
            return Err(self.compile_error(&resource, err.span(), err.kind().msg().to_string()));
        }

        tracing::debug!(resource = %resource, unit, "compiled script");
        Ok(CompiledScript {
            unit,
            resource,
            script: Rc::new(script),
        })
    }

    fn compile_error(&self, resource: &str, span: Span, message: String) -> CompileError {
        let location = self.locate(span).unwrap_or_else(|| ErrorLocation {
            resource: resource.to_string(),
            line: 1,
            start_column: 0,
            end_column: 0,
            source_line: String::new(),
        });
        CompileError { message, location }
    }

    /// Map a span back to its unit, line and columns.
    pub fn locate(&self, span: Span) -> Option<ErrorLocation> {
        if span.is_dummy() {
            return None;
        }
        let lo = span.lo.0;
        let unit = self.units.iter().rev().find(|u| u.contains(lo))?;
        let text = &*unit.text;
        let offset = (lo - unit.start) as usize;

        let line_index = match unit.line_starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i.saturating_sub(1),
        };
        let line_start = unit.line_starts[line_index];
        let line_end = text[line_start..]
            .find('\n')
            .map_or(text.len(), |n| line_start + n);

        let hi = (span.hi.0.saturating_sub(unit.start) as usize).clamp(offset, line_end);
        let start_column = text.get(line_start..offset).map_or(0, |s| s.chars().count());
        let width = text.get(offset..hi).map_or(1, |s| s.chars().count());

        Some(ErrorLocation {
            resource: unit.resource.to_string(),
            line: line_index + 1,
            start_column,
            end_column: start_column + width,
            source_line: text[line_start..line_end].trim_end_matches('\r').to_string(),
        })
    }

    /// Stack snapshot for an error raised at `span`, innermost frame first.
    pub fn capture_stack(&self, span: Span) -> Vec<StackFrame> {
        let mut stack = Vec::new();
        let mut position = span;
        for frame in self.frames.iter().rev() {
            if let Some(location) = self.locate(position) {
                stack.push(StackFrame {
                    function: frame.function.to_string(),
                    resource: location.resource,
                    line: location.line,
                    column: location.start_column + 1,
                });
            }
            position = frame.call_site;
        }
        stack
    }

    pub(crate) fn function_code(
        &mut self,
        span: Span,
        build: impl FnOnce() -> FunctionCode,
    ) -> Rc<FunctionCode> {
        self.functions
            .entry((span.lo.0, span.hi.0))
            .or_insert_with(|| Rc::new(build()))
            .clone()
    }

    // Persistent handles and collection

    pub fn make_weak(&mut self, id: WrapId, object: JsObject) {
        self.persistents.insert(
            id,
            Persistent {
                object,
                near_death: false,
            },
        );
    }

    pub fn persistent(&self, id: WrapId) -> Option<&JsObject> {
        self.persistents.get(&id).map(|p| &p.object)
    }

    pub fn dispose(&mut self, id: WrapId) {
        self.persistents.remove(&id);
    }

    /// Ids of wrapped objects that became reachable only through their
    /// persistent handle since the last collection. Each id is reported once;
    /// the object stays alive until the handle is disposed.
    pub fn collect_garbage(&mut self) -> Vec<WrapId> {
        self.gc_requested = false;
        self.external_since_gc = 0;
        self.persistents
            .iter_mut()
            .filter_map(|(id, p)| {
                if !p.near_death && p.object.strong_count() == 1 {
                    p.near_death = true;
                    Some(*id)
                } else {
                    None
                }
            })
            .collect()
    }

    /// Record `delta` bytes of native memory held by script objects.
    pub fn adjust_external_memory(&mut self, delta: i64) -> i64 {
        self.external_memory += delta;
        if delta > 0 {
            self.external_since_gc += delta;
            if self.external_since_gc >= self.gc_threshold {
                self.gc_requested = true;
            }
        }
        self.external_memory
    }

    pub fn external_memory(&self) -> i64 {
        self.external_memory
    }

    pub fn request_gc(&mut self) {
        self.gc_requested = true;
    }

    pub fn gc_requested(&self) -> bool {
        self.gc_requested
    }

    // Object factories

    pub fn new_object(&self) -> JsObject {
        JsObject::plain(Some(self.realm.object_proto.clone()))
    }

    pub fn new_array(&self, items: Vec<JsValue>) -> JsObject {
        JsObject::new(ObjectData::new(
            ObjectKind::Array(items),
            Some(self.realm.array_proto.clone()),
        ))
    }

    pub fn new_function(&self, callable: Callable) -> JsObject {
        JsObject::new(ObjectData::new(
            ObjectKind::Function(callable),
            Some(self.realm.function_proto.clone()),
        ))
    }

    pub fn new_native(&self, name: &'static str, func: NativeFn) -> JsObject {
        self.new_function(Callable::Native(NativeFunction {
            name,
            func,
            internal_fields: 0,
        }))
    }

    /// A native constructor whose instances carry `internal_fields` slots
    /// and inherit `methods`.
    pub fn new_constructor(
        &self,
        name: &'static str,
        func: NativeFn,
        internal_fields: usize,
        methods: &[(&'static str, NativeFn)],
    ) -> JsObject {
        let ctor = self.new_function(Callable::Native(NativeFunction {
            name,
            func,
            internal_fields,
        }));
        let proto = self.new_object();
        for (method, f) in methods {
            proto.set(method, JsValue::from(self.new_native(method, *f)));
        }
        proto.set("constructor", JsValue::from(ctor.clone()));
        ctor.set("prototype", JsValue::from(proto));
        ctor
    }

    pub fn new_error(&self, kind: ErrorKind, message: impl AsRef<str>) -> JsObject {
        let error = JsObject::new(ObjectData::new(
            ObjectKind::Error,
            Some(self.realm.error_proto(kind).clone()),
        ));
        error.set("message", JsValue::string(message));
        error
    }

    /// An engine-raised exception. The interpreter fills in the throw site
    /// from the nearest call expression.
    pub fn throw(&self, kind: ErrorKind, message: impl AsRef<str>) -> Abrupt {
        Abrupt::throw(JsValue::from(self.new_error(kind, message)), DUMMY_SP, Vec::new())
    }

    pub fn set_global(&self, name: &str, value: JsValue) {
        self.global.set(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm() -> VM {
        VM::new(&RuntimeConfig::default())
    }

    #[test]
    fn test_compile_error_location() {
        let mut vm = vm();
        let err = vm.compile("var a = 1;\nvar = 2;\n", "bad.js").err().unwrap();
        assert_eq!(err.location.resource, "bad.js");
        assert_eq!(err.location.line, 2);
        assert_eq!(err.location.source_line, "var = 2;");
    }

    #[test]
    fn test_locate_across_units() {
        use swc_common::Spanned;

        let mut vm = vm();
        let first = vm.compile("1;", "first.js").unwrap();
        let second = vm.compile("\n\n  boom;", "second.js").unwrap();

        let span = second.script().body[0].span();
        let location = vm.locate(span).unwrap();
        assert_eq!(location.resource, "second.js");
        assert_eq!(location.line, 3);
        assert_eq!(location.start_column, 2);
        assert_eq!(location.source_line, "  boom;");

        let span = first.script().body[0].span();
        assert_eq!(vm.locate(span).unwrap().resource, "first.js");
    }

    #[test]
    fn test_external_memory_requests_gc() {
        let mut vm = VM::new(&RuntimeConfig {
            gc_external_threshold: 100,
            ..RuntimeConfig::default()
        });
        vm.adjust_external_memory(60);
        assert!(!vm.gc_requested());
        vm.adjust_external_memory(60);
        assert!(vm.gc_requested());
        vm.collect_garbage();
        assert!(!vm.gc_requested());
        assert_eq!(vm.adjust_external_memory(-120), 0);
    }

    #[test]
    fn test_error_objects_inherit_name() {
        let vm = vm();
        let err = vm.new_error(ErrorKind::TypeError, "bad");
        assert_eq!(err.to_js_string(), "TypeError: bad");
        assert_eq!(vm.new_error(ErrorKind::Error, "").to_js_string(), "Error");
    }
}
