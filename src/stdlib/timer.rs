//! `node.Timer`: a loop timer bound to a script object.
//!
//! A started timer keeps its handle attached, so the object survives
//! collection while it can still fire. `stop`, or the end of a one-shot
//! timer, releases it again.

use std::mem;
use std::time::Duration;

use super::{this_handle, wrap_this};
use crate::runtime::Runtime;
use crate::runtime::r#async::{LoopContext, TimerId};
use crate::runtime::wrap::{HasExternalSize, WrapId};
use crate::vm::builtins::arg;
use crate::vm::value::{JsObject, JsValue};
use crate::vm::{Abrupt, VM};

pub struct TimerResource {
    after: Duration,
    repeat: Option<Duration>,
    active: Option<TimerId>,
}

impl HasExternalSize for TimerResource {
    fn external_size(&self) -> usize {
        mem::size_of::<Self>()
    }
}

/// Milliseconds from a script value; negative and NaN become zero.
fn millis(value: &JsValue) -> Duration {
    let ms = value.to_number();
    if ms.is_finite() && ms > 0.0 {
        Duration::from_secs_f64(ms / 1000.0)
    } else {
        Duration::ZERO
    }
}

pub(crate) fn constructor(vm: &VM) -> JsObject {
    vm.new_constructor(
        "Timer",
        native_timer_new,
        1,
        &[("start", native_timer_start), ("stop", native_timer_stop)],
    )
}

/// `new node.Timer(callback, after, repeat)`
fn native_timer_new(rt: &mut Runtime, this: &JsValue, args: Vec<JsValue>) -> Result<JsValue, Abrupt> {
    let repeat = millis(&arg(&args, 2));
    let resource = TimerResource {
        after: millis(&arg(&args, 1)),
        repeat: (repeat > Duration::ZERO).then_some(repeat),
        active: None,
    };
    if wrap_this(rt, this, Box::new(resource)).is_some()
        && let Some(object) = this.as_object()
    {
        object.set("callback", arg(&args, 0));
    }
    Ok(JsValue::Undefined)
}

/// `timer.start([after[, repeat]])`. Restarting an armed timer re-arms it
/// without a second attachment.
fn native_timer_start(rt: &mut Runtime, this: &JsValue, args: Vec<JsValue>) -> Result<JsValue, Abrupt> {
    let Some(id) = this_handle(rt, this) else {
        return Ok(JsValue::Undefined);
    };
    let Some(timer) = rt.wraps.resource_mut::<TimerResource>(id) else {
        tracing::warn!(%id, "start called on a handle that is not a timer");
        return Ok(JsValue::Undefined);
    };
    if !args.is_empty() {
        timer.after = millis(&args[0]);
    }
    if args.len() > 1 {
        let repeat = millis(&args[1]);
        timer.repeat = (repeat > Duration::ZERO).then_some(repeat);
    }
    let (after, repeat) = (timer.after, timer.repeat);
    let previous = timer.active.take();

    match previous {
        Some(previous) => {
            rt.event_loop.cancel_timer(previous);
        }
        None => {
            if let Err(e) = rt.wraps.attach(id) {
                tracing::warn!("attach failed: {}", e);
                return Ok(JsValue::Undefined);
            }
        }
    }
    let timer_id = rt
        .event_loop
        .add_timer(after, repeat, Box::new(move |rt: &mut Runtime| timer_fired(rt, id)));
    if let Some(timer) = rt.wraps.resource_mut::<TimerResource>(id) {
        timer.active = Some(timer_id);
    }
    tracing::trace!(%id, %timer_id, ?after, ?repeat, "timer started");
    Ok(JsValue::Undefined)
}

/// `timer.stop()`. Stopping an idle timer does nothing.
fn native_timer_stop(rt: &mut Runtime, this: &JsValue, _args: Vec<JsValue>) -> Result<JsValue, Abrupt> {
    let Some(id) = this_handle(rt, this) else {
        return Ok(JsValue::Undefined);
    };
    let active = rt
        .wraps
        .resource_mut::<TimerResource>(id)
        .and_then(|timer| timer.active.take());
    if let Some(timer_id) = active {
        rt.event_loop.cancel_timer(timer_id);
        rt.release_origin(id);
        tracing::trace!(%id, %timer_id, "timer stopped");
    }
    Ok(JsValue::Undefined)
}

fn timer_fired(rt: &mut Runtime, id: WrapId) {
    let Some(object) = rt.wraps.handle(id) else {
        return;
    };
    let Some(timer) = rt.wraps.resource_mut::<TimerResource>(id) else {
        return;
    };
    let one_shot = timer.repeat.is_none();
    if one_shot {
        timer.active = None;
    }

    let callback = object.get("callback");
    if callback.is_callable() {
        rt.invoke_callback(&callback, JsValue::from(object), Vec::new());
    } else {
        tracing::warn!(%id, "timer fired without a callback");
    }

    if one_shot {
        rt.release_origin(id);
    }
}
