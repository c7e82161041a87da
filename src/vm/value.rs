// Memory representation. Script objects are reference counted; a wrapped
// object additionally carries internal fields that point back into the
// native handle registry.
use std::cell::{Ref, RefCell, RefMut};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use swc_common::Span;
use swc_ecma_ast::{BlockStmt, Expr};

use super::error::Abrupt;
use crate::runtime::Runtime;
use crate::runtime::wrap::WrapId;

/// Signature of every native binding: runtime, `this`, arguments.
pub type NativeFn = fn(&mut Runtime, &JsValue, Vec<JsValue>) -> Result<JsValue, Abrupt>;

#[derive(Clone, Default)]
pub enum JsValue {
    #[default]
    Undefined,
    Null,
    Boolean(bool),
    Number(f64),
    String(Rc<str>),
    Object(JsObject),
}

impl JsValue {
    pub fn string(s: impl AsRef<str>) -> Self {
        JsValue::String(Rc::from(s.as_ref()))
    }

    pub fn as_object(&self) -> Option<&JsObject> {
        match self {
            JsValue::Object(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            JsValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, JsValue::Undefined | JsValue::Null)
    }

    pub fn is_callable(&self) -> bool {
        self.as_object().is_some_and(|o| o.is_callable())
    }

    pub fn truthy(&self) -> bool {
        match self {
            JsValue::Undefined | JsValue::Null => false,
            JsValue::Boolean(b) => *b,
            JsValue::Number(n) => *n != 0.0 && !n.is_nan(),
            JsValue::String(s) => !s.is_empty(),
            JsValue::Object(_) => true,
        }
    }

    pub fn type_of(&self) -> &'static str {
        match self {
            JsValue::Undefined => "undefined",
            JsValue::Null => "object",
            JsValue::Boolean(_) => "boolean",
            JsValue::Number(_) => "number",
            JsValue::String(_) => "string",
            JsValue::Object(obj) if obj.is_callable() => "function",
            JsValue::Object(_) => "object",
        }
    }

    pub fn to_number(&self) -> f64 {
        match self {
            JsValue::Undefined => f64::NAN,
            JsValue::Null => 0.0,
            JsValue::Boolean(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            JsValue::Number(n) => *n,
            JsValue::String(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    0.0
                } else {
                    trimmed.parse::<f64>().unwrap_or(f64::NAN)
                }
            }
            JsValue::Object(_) => f64::NAN,
        }
    }

    /// String conversion as used by `+`, template literals and diagnostics.
    pub fn to_js_string(&self) -> String {
        match self {
            JsValue::Undefined => "undefined".to_string(),
            JsValue::Null => "null".to_string(),
            JsValue::Boolean(b) => b.to_string(),
            JsValue::Number(n) => number_to_string(*n),
            JsValue::String(s) => s.to_string(),
            JsValue::Object(obj) => obj.to_js_string(),
        }
    }

    pub fn strict_equals(&self, other: &JsValue) -> bool {
        match (self, other) {
            (JsValue::Undefined, JsValue::Undefined) | (JsValue::Null, JsValue::Null) => true,
            (JsValue::Boolean(a), JsValue::Boolean(b)) => a == b,
            (JsValue::Number(a), JsValue::Number(b)) => a == b,
            (JsValue::String(a), JsValue::String(b)) => a == b,
            (JsValue::Object(a), JsValue::Object(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    pub fn loose_equals(&self, other: &JsValue) -> bool {
        match (self, other) {
            (a, b) if a.is_nullish() && b.is_nullish() => true,
            (a, b) if a.is_nullish() || b.is_nullish() => false,
            (JsValue::Object(a), JsValue::Object(b)) => a.ptr_eq(b),
            (JsValue::Object(_), _) | (_, JsValue::Object(_)) => {
                self.to_js_string() == other.to_js_string()
            }
            (JsValue::String(a), JsValue::String(b)) => a == b,
            _ => self.to_number() == other.to_number(),
        }
    }
}

impl fmt::Debug for JsValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JsValue::String(s) => write!(f, "{:?}", s),
            JsValue::Object(obj) => write!(f, "Object({:p})", Rc::as_ptr(&obj.0)),
            other => f.write_str(&other.to_js_string()),
        }
    }
}

impl From<f64> for JsValue {
    fn from(n: f64) -> Self {
        JsValue::Number(n)
    }
}

impl From<bool> for JsValue {
    fn from(b: bool) -> Self {
        JsValue::Boolean(b)
    }
}

impl From<&str> for JsValue {
    fn from(s: &str) -> Self {
        JsValue::string(s)
    }
}

impl From<String> for JsValue {
    fn from(s: String) -> Self {
        JsValue::String(Rc::from(s))
    }
}

impl From<JsObject> for JsValue {
    fn from(obj: JsObject) -> Self {
        JsValue::Object(obj)
    }
}

pub fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        (if n > 0.0 { "Infinity" } else { "-Infinity" }).to_string()
    } else if n == n.trunc() && n.abs() < 1e21 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// What kind of object sits behind a [`JsObject`].
pub enum ObjectKind {
    Plain,
    Array(Vec<JsValue>),
    Function(Callable),
    Error,
}

pub struct ObjectData {
    /// Own properties in insertion order.
    pub properties: Vec<(String, JsValue)>,
    pub prototype: Option<JsObject>,
    /// Native-pointer storage. Only objects created by a native constructor
    /// have any.
    pub internal_fields: Vec<Option<WrapId>>,
    pub kind: ObjectKind,
}

impl ObjectData {
    pub fn new(kind: ObjectKind, prototype: Option<JsObject>) -> Self {
        Self {
            properties: Vec::new(),
            prototype,
            internal_fields: Vec::new(),
            kind,
        }
    }
}

#[derive(Clone)]
pub struct JsObject(Rc<RefCell<ObjectData>>);

/// Non-owning reference to a script object.
#[derive(Clone)]
pub struct WeakObject(Weak<RefCell<ObjectData>>);

impl WeakObject {
    pub fn upgrade(&self) -> Option<JsObject> {
        self.0.upgrade().map(JsObject)
    }
}

/// Upper bound on prototype chain walks.
const MAX_PROTO_DEPTH: usize = 100;

/// How far past its end a dense array may grow in one store. Indices
/// beyond that are kept as ordinary properties.
const MAX_ARRAY_GAP: usize = 1 << 16;

impl JsObject {
    pub fn new(data: ObjectData) -> Self {
        JsObject(Rc::new(RefCell::new(data)))
    }

    pub fn plain(prototype: Option<JsObject>) -> Self {
        Self::new(ObjectData::new(ObjectKind::Plain, prototype))
    }

    pub fn borrow(&self) -> Ref<'_, ObjectData> {
        self.0.borrow()
    }

    pub fn borrow_mut(&self) -> RefMut<'_, ObjectData> {
        self.0.borrow_mut()
    }

    pub fn ptr_eq(&self, other: &JsObject) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Number of strong references, the engine's own persistent included.
    pub fn strong_count(&self) -> usize {
        Rc::strong_count(&self.0)
    }

    pub fn downgrade(&self) -> WeakObject {
        WeakObject(Rc::downgrade(&self.0))
    }

    pub fn is_callable(&self) -> bool {
        matches!(self.borrow().kind, ObjectKind::Function(_))
    }

    pub fn callable(&self) -> Option<Callable> {
        match &self.borrow().kind {
            ObjectKind::Function(c) => Some(c.clone()),
            _ => None,
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self.borrow().kind, ObjectKind::Array(_))
    }

    pub fn get_own(&self, key: &str) -> Option<JsValue> {
        let data = self.borrow();
        if let ObjectKind::Array(items) = &data.kind {
            if key == "length" {
                return Some(JsValue::Number(items.len() as f64));
            }
            if let Ok(index) = key.parse::<usize>()
                && let Some(item) = items.get(index)
            {
                return Some(item.clone());
            }
        }
        data.properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    /// Property lookup walking the prototype chain.
    pub fn get(&self, key: &str) -> JsValue {
        let mut current = Some(self.clone());
        let mut depth = 0;
        while let Some(obj) = current {
            if depth > MAX_PROTO_DEPTH {
                break;
            }
            depth += 1;
            if let Some(value) = obj.get_own(key) {
                return value;
            }
            current = obj.borrow().prototype.clone();
        }
        JsValue::Undefined
    }

    pub fn set(&self, key: &str, value: JsValue) {
        let mut data = self.borrow_mut();
        if let ObjectKind::Array(items) = &mut data.kind
            && let Ok(index) = key.parse::<usize>()
            && index <= items.len().saturating_add(MAX_ARRAY_GAP)
        {
            if index >= items.len() {
                items.resize(index + 1, JsValue::Undefined);
            }
            items[index] = value;
            return;
        }
        match data.properties.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value,
            None => data.properties.push((key.to_string(), value)),
        }
    }

    /// Whether `key` resolves anywhere on the prototype chain.
    pub fn has(&self, key: &str) -> bool {
        let mut current = Some(self.clone());
        let mut depth = 0;
        while let Some(obj) = current {
            if depth > MAX_PROTO_DEPTH {
                break;
            }
            depth += 1;
            if obj.get_own(key).is_some() {
                return true;
            }
            current = obj.borrow().prototype.clone();
        }
        false
    }

    pub fn inherits_from(&self, proto: &JsObject) -> bool {
        let mut current = self.borrow().prototype.clone();
        let mut depth = 0;
        while let Some(obj) = current {
            if depth > MAX_PROTO_DEPTH {
                break;
            }
            depth += 1;
            if obj.ptr_eq(proto) {
                return true;
            }
            current = obj.borrow().prototype.clone();
        }
        false
    }

    pub fn remove(&self, key: &str) -> bool {
        let mut data = self.borrow_mut();
        let before = data.properties.len();
        data.properties.retain(|(k, _)| k != key);
        before != data.properties.len()
    }

    pub fn keys(&self) -> Vec<String> {
        let data = self.borrow();
        let mut keys = Vec::new();
        if let ObjectKind::Array(items) = &data.kind {
            keys.extend((0..items.len()).map(|i| i.to_string()));
        }
        keys.extend(data.properties.iter().map(|(k, _)| k.clone()));
        keys
    }

    pub fn internal_field_count(&self) -> usize {
        self.borrow().internal_fields.len()
    }

    pub fn internal_field(&self, index: usize) -> Option<WrapId> {
        self.borrow().internal_fields.get(index).copied().flatten()
    }

    /// Returns false when the object has no field at `index`.
    pub fn set_internal_field(&self, index: usize, value: Option<WrapId>) -> bool {
        match self.borrow_mut().internal_fields.get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn to_js_string(&self) -> String {
        {
            let data = self.borrow();
            match &data.kind {
                ObjectKind::Array(items) => {
                    return items
                        .iter()
                        .map(|v| if v.is_nullish() { String::new() } else { v.to_js_string() })
                        .collect::<Vec<_>>()
                        .join(",");
                }
                ObjectKind::Function(Callable::Native(native)) => {
                    return format!("function {}() {{ [native code] }}", native.name);
                }
                ObjectKind::Function(Callable::Script(closure)) => {
                    return format!("function {}() {{ ... }}", closure.code.name);
                }
                ObjectKind::Error | ObjectKind::Plain => {}
            }
        }
        match (self.get("name"), self.get("message")) {
            (JsValue::String(name), JsValue::String(message)) if message.is_empty() => {
                name.to_string()
            }
            (JsValue::String(name), JsValue::String(message)) => format!("{}: {}", name, message),
            _ => "[object Object]".to_string(),
        }
    }
}

/// Something that can be invoked from script.
#[derive(Clone)]
pub enum Callable {
    Script(Rc<Closure>),
    Native(NativeFunction),
}

#[derive(Clone, Copy)]
pub struct NativeFunction {
    pub name: &'static str,
    pub func: NativeFn,
    /// Internal field count of objects created by `new` on this function.
    pub internal_fields: usize,
}

pub struct Closure {
    pub code: Rc<FunctionCode>,
    pub scope: Option<Scope>,
    /// Captured `this` for arrow functions.
    pub lexical_this: Option<JsValue>,
}

pub struct FunctionCode {
    pub name: String,
    pub params: Vec<String>,
    pub body: FunctionBody,
    pub is_arrow: bool,
    pub span: Span,
}

pub enum FunctionBody {
    Block(BlockStmt),
    Expr(Box<Expr>),
}

pub type Scope = Rc<RefCell<ScopeData>>;

/// One lexical environment. The chain ends at the global object.
#[derive(Default)]
pub struct ScopeData {
    pub vars: HashMap<String, JsValue>,
    pub parent: Option<Scope>,
    /// Function bodies receive `var` declarations; blocks do not.
    pub function: bool,
}

impl ScopeData {
    pub fn child(parent: Option<Scope>) -> Scope {
        Rc::new(RefCell::new(ScopeData {
            vars: HashMap::new(),
            parent,
            function: false,
        }))
    }

    pub fn function(parent: Option<Scope>) -> Scope {
        Rc::new(RefCell::new(ScopeData {
            vars: HashMap::new(),
            parent,
            function: true,
        }))
    }
}
