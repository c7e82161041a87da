//! Language builtins installed into every fresh VM.
//!
//! Only what the bootstrap scripts and ordinary glue code need: error
//! constructors, `JSON.stringify`, the `String`/`Number` conversions,
//! `Object.keys` and a handful of array and function methods.

use serde_json::{Map, Number, Value};

use super::interp;
use super::value::{JsObject, JsValue, NativeFn, ObjectKind};
use super::{Abrupt, ErrorKind, VM};
use crate::runtime::Runtime;

pub fn setup_builtins(vm: &mut VM) {
    setup_globals(vm);
    setup_errors(vm);
    setup_json(vm);
    setup_conversions(vm);
    setup_object(vm);
    setup_array(vm);
    setup_function(vm);
}

/// Argument `index`, or `undefined` when absent.
pub(crate) fn arg(args: &[JsValue], index: usize) -> JsValue {
    args.get(index).cloned().unwrap_or_default()
}

fn setup_globals(vm: &mut VM) {
    vm.set_global("undefined", JsValue::Undefined);
    vm.set_global("NaN", JsValue::Number(f64::NAN));
    vm.set_global("Infinity", JsValue::Number(f64::INFINITY));
}

fn setup_errors(vm: &mut VM) {
    let constructors: [(ErrorKind, NativeFn); 5] = [
        (ErrorKind::Error, |rt, _, args| new_error(rt, ErrorKind::Error, &args)),
        (ErrorKind::TypeError, |rt, _, args| new_error(rt, ErrorKind::TypeError, &args)),
        (ErrorKind::RangeError, |rt, _, args| new_error(rt, ErrorKind::RangeError, &args)),
        (ErrorKind::ReferenceError, |rt, _, args| {
            new_error(rt, ErrorKind::ReferenceError, &args)
        }),
        (ErrorKind::SyntaxError, |rt, _, args| new_error(rt, ErrorKind::SyntaxError, &args)),
    ];

    for (kind, func) in constructors {
        let ctor = vm.new_native(kind.name(), func);
        let proto = vm.realm().error_proto(kind).clone();
        proto.set("constructor", JsValue::from(ctor.clone()));
        ctor.set("prototype", JsValue::from(proto));
        vm.set_global(kind.name(), JsValue::from(ctor));
    }
}

/// Shared body of the error constructors; works with and without `new`.
fn new_error(rt: &mut Runtime, kind: ErrorKind, args: &[JsValue]) -> Result<JsValue, Abrupt> {
    let message = match arg(args, 0) {
        JsValue::Undefined => String::new(),
        other => other.to_js_string(),
    };
    Ok(JsValue::from(rt.vm.new_error(kind, message)))
}

// JSON

fn setup_json(vm: &mut VM) {
    let json = vm.new_object();
    json.set("stringify", JsValue::from(vm.new_native("stringify", json_stringify)));
    vm.set_global("JSON", JsValue::from(json));
}

/// `JSON.stringify(value[, replacer[, space]])`. The replacer is ignored;
/// any truthy `space` selects the pretty layout.
fn json_stringify(rt: &mut Runtime, _this: &JsValue, args: Vec<JsValue>) -> Result<JsValue, Abrupt> {
    let mut seen = Vec::new();
    let value = match to_json(&arg(&args, 0), &mut seen) {
        Ok(Some(value)) => value,
        Ok(None) => return Ok(JsValue::Undefined),
        Err(message) => return Err(rt.vm.throw(ErrorKind::TypeError, message)),
    };

    let text = if arg(&args, 2).truthy() {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    };
    text.map(JsValue::from)
        .map_err(|e| rt.vm.throw(ErrorKind::Error, e.to_string()))
}

/// Convert to a JSON tree. `None` means "not serialisable" (functions and
/// `undefined`), which drops object members and becomes `null` in arrays.
fn to_json(value: &JsValue, seen: &mut Vec<JsObject>) -> Result<Option<Value>, &'static str> {
    Ok(Some(match value {
        JsValue::Undefined => return Ok(None),
        JsValue::Null => Value::Null,
        JsValue::Boolean(b) => Value::Bool(*b),
        JsValue::Number(n) => json_number(*n),
        JsValue::String(s) => Value::String(s.to_string()),
        JsValue::Object(object) if object.is_callable() => return Ok(None),
        JsValue::Object(object) => {
            if seen.iter().any(|o| o.ptr_eq(object)) {
                return Err("Converting circular structure to JSON");
            }
            seen.push(object.clone());
            let result = object_to_json(object, seen);
            seen.pop();
            result?
        }
    }))
}

fn object_to_json(object: &JsObject, seen: &mut Vec<JsObject>) -> Result<Value, &'static str> {
    let items = match &object.borrow().kind {
        ObjectKind::Array(items) => Some(items.clone()),
        _ => None,
    };
    if let Some(items) = items {
        let mut array = Vec::with_capacity(items.len());
        for item in &items {
            array.push(to_json(item, seen)?.unwrap_or(Value::Null));
        }
        return Ok(Value::Array(array));
    }

    let mut map = Map::new();
    for key in object.keys() {
        if let Some(value) = to_json(&object.get(&key), seen)? {
            map.insert(key, value);
        }
    }
    Ok(Value::Object(map))
}

fn json_number(n: f64) -> Value {
    if n.is_finite() && n == n.trunc() && n.abs() < 9.007_199_254_740_992e15 {
        Value::from(n as i64)
    } else {
        Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

// Conversions

fn setup_conversions(vm: &mut VM) {
    let string = vm.new_native("String", |_, _, args| {
        Ok(match args.first() {
            Some(value) => JsValue::from(value.to_js_string()),
            None => JsValue::from(""),
        })
    });
    string.set("prototype", JsValue::from(vm.realm().string_proto.clone()));
    vm.set_global("String", JsValue::from(string));

    let number = vm.new_native("Number", |_, _, args| {
        Ok(JsValue::Number(args.first().map_or(0.0, JsValue::to_number)))
    });
    vm.set_global("Number", JsValue::from(number));
}

fn setup_object(vm: &mut VM) {
    let object = vm.new_native("Object", |rt, _, args| match arg(&args, 0) {
        value @ JsValue::Object(_) => Ok(value),
        _ => Ok(JsValue::from(rt.vm.new_object())),
    });
    object.set(
        "keys",
        JsValue::from(vm.new_native("keys", |rt, _, args| {
            let keys = match arg(&args, 0) {
                JsValue::Object(object) => object.keys().into_iter().map(JsValue::from).collect(),
                _ => Vec::new(),
            };
            Ok(JsValue::from(rt.vm.new_array(keys)))
        })),
    );
    object.set("prototype", JsValue::from(vm.realm().object_proto.clone()));
    vm.set_global("Object", JsValue::from(object));
}

fn setup_array(vm: &mut VM) {
    let proto = vm.realm().array_proto.clone();
    proto.set("push", JsValue::from(vm.new_native("push", array_push)));
    proto.set("join", JsValue::from(vm.new_native("join", array_join)));

    let array = vm.new_native("Array", |rt, _, args| Ok(JsValue::from(rt.vm.new_array(args))));
    array.set(
        "isArray",
        JsValue::from(vm.new_native("isArray", |_, _, args| {
            Ok(JsValue::Boolean(arg(&args, 0).as_object().is_some_and(|o| o.is_array())))
        })),
    );
    array.set("prototype", JsValue::from(proto));
    vm.set_global("Array", JsValue::from(array));
}

fn array_push(rt: &mut Runtime, this: &JsValue, args: Vec<JsValue>) -> Result<JsValue, Abrupt> {
    let Some(object) = this.as_object() else {
        return Err(rt.vm.throw(ErrorKind::TypeError, "Array.prototype.push called on non-object"));
    };
    let mut data = object.borrow_mut();
    let ObjectKind::Array(items) = &mut data.kind else {
        return Err(rt.vm.throw(ErrorKind::TypeError, "Array.prototype.push called on non-array"));
    };
    items.extend(args);
    Ok(JsValue::Number(items.len() as f64))
}

fn array_join(rt: &mut Runtime, this: &JsValue, args: Vec<JsValue>) -> Result<JsValue, Abrupt> {
    let separator = match arg(&args, 0) {
        JsValue::Undefined => ",".to_string(),
        other => other.to_js_string(),
    };
    let items = match this.as_object().map(|o| o.borrow()) {
        Some(data) => match &data.kind {
            ObjectKind::Array(items) => items.clone(),
            _ => Vec::new(),
        },
        None => {
            return Err(rt.vm.throw(ErrorKind::TypeError, "Array.prototype.join called on non-object"));
        }
    };
    let parts: Vec<String> = items
        .iter()
        .map(|v| if v.is_nullish() { String::new() } else { v.to_js_string() })
        .collect();
    Ok(JsValue::from(parts.join(separator.as_str())))
}

fn setup_function(vm: &mut VM) {
    let proto = vm.realm().function_proto.clone();
    proto.set(
        "call",
        JsValue::from(vm.new_native("call", |rt, this, mut args| {
            let receiver = if args.is_empty() { JsValue::Undefined } else { args.remove(0) };
            interp::call_function(rt, this, receiver, args)
        })),
    );
    proto.set(
        "apply",
        JsValue::from(vm.new_native("apply", |rt, this, args| {
            let list = match arg(&args, 1).as_object().map(|o| o.borrow()) {
                Some(data) => match &data.kind {
                    ObjectKind::Array(items) => items.clone(),
                    _ => Vec::new(),
                },
                None => Vec::new(),
            };
            interp::call_function(rt, this, arg(&args, 0), list)
        })),
    );
}

#[cfg(test)]
mod tests {
    use crate::config::RuntimeConfig;
    use crate::runtime::{Fatal, Runtime};

    fn eval(source: &str) -> String {
        let mut rt = Runtime::new(RuntimeConfig {
            worker_threads: 1,
            ..RuntimeConfig::default()
        })
        .unwrap();
        rt.execute_string(source, "builtins.js").unwrap().to_js_string()
    }

    #[test]
    fn test_json_stringify() {
        assert_eq!(
            eval(r#"JSON.stringify({ b: 1, a: [1.5, "x", null, undefined], f: function () {}, n: NaN })"#),
            r#"{"b":1,"a":[1.5,"x",null,null],"n":null}"#
        );
        assert_eq!(eval("JSON.stringify('q')"), r#""q""#);
        assert_eq!(eval("typeof JSON.stringify(undefined)"), "undefined");
        assert_eq!(eval("JSON.stringify({ a: 1 }, null, 2)"), "{\n  \"a\": 1\n}");
    }

    #[test]
    fn test_json_stringify_rejects_cycles() {
        let mut rt = Runtime::new(RuntimeConfig::default()).unwrap();
        let result = rt.execute_string("var o = {}; o.self = o; JSON.stringify(o);", "cycle.js");
        let Err(Fatal::Script(err)) = result else {
            panic!("expected a script error");
        };
        assert_eq!(err.message, "TypeError: Converting circular structure to JSON");
    }

    #[test]
    fn test_conversions_and_arrays() {
        assert_eq!(eval("String(12) + Number('3')"), "123");
        assert_eq!(eval("Object.keys({ x: 1, y: 2 }).join('|')"), "x|y");
        assert_eq!(eval("var a = [1]; a.push(2, 3); a.join('-') + ':' + a.length"), "1-2-3:3");
        assert_eq!(eval("Array.isArray([]) && !Array.isArray({})"), "true");
    }

    #[test]
    fn test_error_constructors() {
        assert_eq!(eval("var e = RangeError('r'); e.name + ':' + e.message"), "RangeError:r");
        assert_eq!(eval("String(new Error())"), "Error");
        assert_eq!(eval("new TypeError('t') instanceof Error"), "true");
    }

    #[test]
    fn test_call_and_apply() {
        assert_eq!(
            eval("function f(a, b) { return this.base + a + b; } f.call({ base: 1 }, 2, 3) + f.apply({ base: 10 }, [20, 30])"),
            "66"
        );
    }
}
