//! Native lifetime bridge.
//!
//! Every native resource exposed to script lives in a [`NativeHandle`] owned
//! by the [`WrapRegistry`]. Two authorities decide when it may go away: the
//! engine, which reports the script object as weakly reachable, and the event
//! loop, which attaches the handle while an operation is in flight. The
//! handle is destroyed at the edge where the second of the two releases
//! happens, in [`WrapRegistry::maybe_destroy`], and nowhere else.

use std::any::Any;
use std::fmt;
use std::num::NonZeroUsize;

use crate::vm::VM;
use crate::vm::value::{JsObject, JsValue, WeakObject};

/// Internal field slot holding the [`WrapId`] of a wrapped object.
pub const WRAP_FIELD: usize = 0;

/// Bytes of native memory a resource keeps alive outside the engine heap.
pub trait HasExternalSize {
    fn external_size(&self) -> usize;
}

/// A native resource that can be bound to a script object.
pub trait NativeResource: HasExternalSize + Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: HasExternalSize + Any> NativeResource for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BindingError {
    #[error("empty handle")]
    EmptyHandle,
    #[error("object has no internal field for a native pointer")]
    NoInternalField,
    #[error("internal field is empty")]
    EmptyInternalField,
    #[error("object is already bound to a native resource")]
    AlreadyWrapped,
    #[error("native handle {0} has been destroyed")]
    StaleHandle(WrapId),
    #[error("native resource has an unexpected type")]
    TypeMismatch,
}

/// Generational index of a native handle.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct WrapId {
    index: u32,
    generation: u32,
}

impl WrapId {
    #[cfg(test)]
    pub(crate) fn dangling(index: u32) -> Self {
        WrapId {
            index,
            generation: u32::MAX,
        }
    }
}

impl fmt::Debug for WrapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WrapId({}v{})", self.index, self.generation)
    }
}

impl fmt::Display for WrapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachState {
    /// Kept alive by `n` in-flight operations.
    Attached(NonZeroUsize),
    /// No operation holds the handle; the engine alone decides.
    Detachable,
}

impl AttachState {
    pub fn count(&self) -> usize {
        match self {
            AttachState::Attached(n) => n.get(),
            AttachState::Detachable => 0,
        }
    }
}

pub struct NativeHandle {
    resource: Box<dyn NativeResource>,
    object: WeakObject,
    state: AttachState,
    engine_released: bool,
    reported_size: usize,
}

impl NativeHandle {
    pub fn state(&self) -> AttachState {
        self.state
    }

    pub fn engine_released(&self) -> bool {
        self.engine_released
    }

    pub fn reported_size(&self) -> usize {
        self.reported_size
    }
}

struct Entry {
    generation: u32,
    handle: Option<NativeHandle>,
}

/// Owner of every live [`NativeHandle`].
#[derive(Default)]
pub struct WrapRegistry {
    entries: Vec<Entry>,
    free: Vec<u32>,
    live: usize,
}

impl WrapRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live handles.
    pub fn live(&self) -> usize {
        self.live
    }

    pub fn is_live(&self, id: WrapId) -> bool {
        self.get(id).is_some()
    }

    /// Bind `resource` to `object`, which must have an empty internal field.
    pub fn wrap(
        &mut self,
        vm: &mut VM,
        object: &JsObject,
        resource: Box<dyn NativeResource>,
    ) -> Result<WrapId, BindingError> {
        if object.internal_field_count() <= WRAP_FIELD {
            return Err(BindingError::NoInternalField);
        }
        if object.internal_field(WRAP_FIELD).is_some() {
            return Err(BindingError::AlreadyWrapped);
        }

        let size = resource.external_size();
        let handle = NativeHandle {
            resource,
            object: object.downgrade(),
            state: AttachState::Detachable,
            engine_released: false,
            reported_size: size,
        };

        let id = match self.free.pop() {
            Some(index) => {
                let entry = &mut self.entries[index as usize];
                entry.handle = Some(handle);
                WrapId {
                    index,
                    generation: entry.generation,
                }
            }
            None => {
                let index = self.entries.len() as u32;
                self.entries.push(Entry {
                    generation: 0,
                    handle: Some(handle),
                });
                WrapId {
                    index,
                    generation: 0,
                }
            }
        };
        self.live += 1;

        object.set_internal_field(WRAP_FIELD, Some(id));
        vm.make_weak(id, object.clone());
        vm.adjust_external_memory(size as i64);

        tracing::trace!(%id, size, "wrapped native resource");
        Ok(id)
    }

    /// The handle bound to `value`, if any. Malformed handles are reported
    /// and yield `None`.
    pub fn unwrap(&self, value: &JsValue) -> Option<WrapId> {
        match self.try_unwrap(value) {
            Ok(id) => Some(id),
            Err(err) => {
                tracing::warn!("unwrap failed: {}", err);
                None
            }
        }
    }

    pub fn try_unwrap(&self, value: &JsValue) -> Result<WrapId, BindingError> {
        let object = value.as_object().ok_or(BindingError::EmptyHandle)?;
        if object.internal_field_count() <= WRAP_FIELD {
            return Err(BindingError::NoInternalField);
        }
        let id = object
            .internal_field(WRAP_FIELD)
            .ok_or(BindingError::EmptyInternalField)?;
        if !self.is_live(id) {
            return Err(BindingError::StaleHandle(id));
        }
        Ok(id)
    }

    pub fn resource<T: Any>(&self, id: WrapId) -> Option<&T> {
        self.get(id)?.resource.as_any().downcast_ref::<T>()
    }

    pub fn resource_mut<T: Any>(&mut self, id: WrapId) -> Option<&mut T> {
        self.get_mut(id)?.resource.as_any_mut().downcast_mut::<T>()
    }

    /// The script object of a live handle.
    pub fn handle(&self, id: WrapId) -> Option<JsObject> {
        self.get(id)?.object.upgrade()
    }

    pub fn state(&self, id: WrapId) -> Option<&NativeHandle> {
        self.get(id)
    }

    /// Keep the handle alive across an asynchronous operation.
    pub fn attach(&mut self, id: WrapId) -> Result<(), BindingError> {
        let handle = self.get_mut(id).ok_or(BindingError::StaleHandle(id))?;
        handle.state = match handle.state {
            AttachState::Attached(n) => AttachState::Attached(n.saturating_add(1)),
            AttachState::Detachable => AttachState::Attached(NonZeroUsize::MIN),
        };
        tracing::trace!(%id, count = handle.state.count(), "attach");
        Ok(())
    }

    /// Release one attachment. Returns true when this destroyed the handle;
    /// the id must not be used afterwards in that case.
    pub fn detach(&mut self, id: WrapId, vm: &mut VM) -> Result<bool, BindingError> {
        let handle = self.get_mut(id).ok_or(BindingError::StaleHandle(id))?;
        handle.state = match handle.state {
            AttachState::Attached(n) => match NonZeroUsize::new(n.get() - 1) {
                Some(n) => AttachState::Attached(n),
                None => AttachState::Detachable,
            },
            AttachState::Detachable => AttachState::Detachable,
        };
        tracing::trace!(%id, count = handle.state.count(), "detach");
        Ok(self.maybe_destroy(id, vm))
    }

    /// Weak callback, invoked by the runtime when the engine finds the object
    /// reachable only through its persistent handle.
    pub fn on_weak(&mut self, id: WrapId, vm: &mut VM) -> bool {
        let Some(handle) = self.get_mut(id) else {
            return false;
        };
        handle.engine_released = true;
        tracing::trace!(%id, count = handle.state.count(), "engine released object");
        self.maybe_destroy(id, vm)
    }

    /// Destroys the handle iff the engine has released the object and no
    /// operation is attached.
    fn maybe_destroy(&mut self, id: WrapId, vm: &mut VM) -> bool {
        match self.get(id) {
            Some(handle) if handle.engine_released && handle.state == AttachState::Detachable => {
                self.destroy(id, vm);
                true
            }
            _ => false,
        }
    }

    fn destroy(&mut self, id: WrapId, vm: &mut VM) {
        let entry = &mut self.entries[id.index as usize];
        let Some(handle) = entry.handle.take() else {
            return;
        };
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;

        if let Some(object) = handle.object.upgrade() {
            object.set_internal_field(WRAP_FIELD, None);
        }
        vm.dispose(id);
        vm.adjust_external_memory(-(handle.reported_size as i64));
        tracing::trace!(%id, size = handle.reported_size, "destroyed native resource");
        drop(handle.resource);
    }

    /// Destroy every live handle regardless of state. Used at teardown.
    pub fn destroy_all(&mut self, vm: &mut VM) -> usize {
        let ids: Vec<WrapId> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.handle.is_some())
            .map(|(index, e)| WrapId {
                index: index as u32,
                generation: e.generation,
            })
            .collect();
        for id in &ids {
            self.destroy(*id, vm);
        }
        ids.len()
    }

    fn get(&self, id: WrapId) -> Option<&NativeHandle> {
        self.entries
            .get(id.index as usize)
            .filter(|e| e.generation == id.generation)?
            .handle
            .as_ref()
    }

    fn get_mut(&mut self, id: WrapId) -> Option<&mut NativeHandle> {
        self.entries
            .get_mut(id.index as usize)
            .filter(|e| e.generation == id.generation)?
            .handle
            .as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::vm::value::{ObjectData, ObjectKind};
    use std::cell::Cell;
    use std::rc::Rc;

    struct Counted {
        size: usize,
        drops: Rc<Cell<usize>>,
    }

    impl HasExternalSize for Counted {
        fn external_size(&self) -> usize {
            self.size
        }
    }

    impl Drop for Counted {
        fn drop(&mut self) {
            self.drops.set(self.drops.get() + 1);
        }
    }

    fn wrappable() -> JsObject {
        let mut data = ObjectData::new(ObjectKind::Plain, None);
        data.internal_fields = vec![None];
        JsObject::new(data)
    }

    fn setup(size: usize) -> (VM, WrapRegistry, JsObject, WrapId, Rc<Cell<usize>>) {
        let mut vm = VM::new(&RuntimeConfig::default());
        let mut wraps = WrapRegistry::new();
        let object = wrappable();
        let drops = Rc::new(Cell::new(0));
        let counted = Counted {
            size,
            drops: drops.clone(),
        };
        let id = wraps.wrap(&mut vm, &object, Box::new(counted)).unwrap();
        (vm, wraps, object, id, drops)
    }

    #[test]
    fn test_attached_handle_survives_weak_callback() {
        let (mut vm, mut wraps, _object, id, drops) = setup(64);
        wraps.attach(id).unwrap();

        assert!(!wraps.on_weak(id, &mut vm));
        assert_eq!(drops.get(), 0);
        assert!(wraps.is_live(id));

        assert!(wraps.detach(id, &mut vm).unwrap());
        assert_eq!(drops.get(), 1);
        assert!(!wraps.is_live(id));
    }

    #[test]
    fn test_weak_callback_destroys_detached_handle() {
        let (mut vm, mut wraps, object, id, drops) = setup(64);

        assert!(wraps.on_weak(id, &mut vm));
        assert_eq!(drops.get(), 1);
        assert_eq!(vm.external_memory(), 0);
        assert!(object.internal_field(WRAP_FIELD).is_none());
        assert_eq!(wraps.unwrap(&JsValue::from(object)), None);
    }

    #[test]
    fn test_detach_without_release_keeps_handle() {
        let (mut vm, mut wraps, _object, id, drops) = setup(8);
        wraps.attach(id).unwrap();
        wraps.attach(id).unwrap();
        assert!(!wraps.detach(id, &mut vm).unwrap());
        assert!(!wraps.detach(id, &mut vm).unwrap());
        // floor at zero
        assert!(!wraps.detach(id, &mut vm).unwrap());
        assert_eq!(wraps.state(id).unwrap().state(), AttachState::Detachable);
        assert_eq!(drops.get(), 0);
    }

    #[test]
    fn test_random_interleavings_destroy_exactly_once() {
        for seed in 0..200 {
            let mut rng = fastrand::Rng::with_seed(seed);
            let (mut vm, mut wraps, _object, id, drops) = setup(128);
            let mut count = 0usize;
            let mut weak = false;
            let mut destroyed = false;

            for _ in 0..32 {
                match rng.u8(..3) {
                    0 if !destroyed => {
                        wraps.attach(id).unwrap();
                        count += 1;
                    }
                    1 if !destroyed => {
                        let fired = wraps.detach(id, &mut vm).unwrap();
                        count = count.saturating_sub(1);
                        assert_eq!(fired, weak && count == 0, "seed {}", seed);
                        destroyed |= fired;
                    }
                    2 if !destroyed && !weak => {
                        weak = true;
                        let fired = wraps.on_weak(id, &mut vm);
                        assert_eq!(fired, count == 0, "seed {}", seed);
                        destroyed |= fired;
                    }
                    _ => {}
                }
                assert_eq!(drops.get(), destroyed as usize, "seed {}", seed);
            }

            if !destroyed {
                if !weak {
                    wraps.on_weak(id, &mut vm);
                }
                while wraps.is_live(id) {
                    wraps.detach(id, &mut vm).unwrap();
                }
            }
            assert_eq!(drops.get(), 1, "seed {}", seed);
            assert_eq!(vm.external_memory(), 0, "seed {}", seed);
        }
    }

    #[test]
    fn test_external_memory_nets_to_zero() {
        let (mut vm, mut wraps, _object, id, _drops) = setup(4096);
        assert_eq!(vm.external_memory(), 4096);
        assert_eq!(wraps.state(id).unwrap().reported_size(), 4096);
        wraps.on_weak(id, &mut vm);
        assert_eq!(vm.external_memory(), 0);
    }

    #[test]
    fn test_unwrap_rejects_malformed_handles() {
        let (_vm, wraps, object, id, _drops) = setup(1);

        assert_eq!(wraps.try_unwrap(&JsValue::Undefined), Err(BindingError::EmptyHandle));
        assert_eq!(
            wraps.try_unwrap(&JsValue::from(JsObject::plain(None))),
            Err(BindingError::NoInternalField)
        );
        assert_eq!(
            wraps.try_unwrap(&JsValue::from(wrappable())),
            Err(BindingError::EmptyInternalField)
        );
        assert_eq!(wraps.unwrap(&JsValue::Null), None);
        assert_eq!(wraps.unwrap(&JsValue::from(object)), Some(id));
    }

    #[test]
    fn test_wrap_requires_free_internal_field() {
        let (mut vm, mut wraps, object, _id, _drops) = setup(1);
        let drops = Rc::new(Cell::new(0));

        let err = wraps
            .wrap(&mut vm, &object, Box::new(Counted { size: 1, drops: drops.clone() }))
            .unwrap_err();
        assert_eq!(err, BindingError::AlreadyWrapped);

        let err = wraps
            .wrap(&mut vm, &JsObject::plain(None), Box::new(Counted { size: 1, drops: drops.clone() }))
            .unwrap_err();
        assert_eq!(err, BindingError::NoInternalField);

        // rejected resources are dropped without touching the accounting
        assert_eq!(drops.get(), 2);
        assert_eq!(vm.external_memory(), 1);
    }

    #[test]
    fn test_stale_id_after_destruction() {
        let (mut vm, mut wraps, _object, id, _drops) = setup(1);
        wraps.on_weak(id, &mut vm);

        assert!(wraps.resource::<Counted>(id).is_none());
        assert!(wraps.handle(id).is_none());
        assert_eq!(wraps.attach(id), Err(BindingError::StaleHandle(id)));
        assert!(!wraps.on_weak(id, &mut vm));

        // slot reuse must not resurrect the old id
        let other = wrappable();
        let drops = Rc::new(Cell::new(0));
        let fresh = wraps.wrap(&mut vm, &other, Box::new(Counted { size: 1, drops })).unwrap();
        assert_ne!(fresh, id);
        assert!(wraps.resource::<Counted>(id).is_none());
        assert!(wraps.resource::<Counted>(fresh).is_some());
    }

    #[test]
    fn test_garbage_collection_reports_unreferenced_object() {
        let (mut vm, mut wraps, object, id, drops) = setup(16);
        assert!(vm.collect_garbage().is_empty());

        drop(object);
        let weak = vm.collect_garbage();
        assert_eq!(weak, vec![id]);
        // near-death objects are reported once
        assert!(vm.collect_garbage().is_empty());

        assert!(wraps.on_weak(id, &mut vm));
        assert_eq!(drops.get(), 1);
        assert!(vm.persistent(id).is_none());
    }

    #[test]
    fn test_destroy_all_releases_everything() {
        let (mut vm, mut wraps, _object, id, drops) = setup(32);
        wraps.attach(id).unwrap();
        assert_eq!(wraps.destroy_all(&mut vm), 1);
        assert_eq!(drops.get(), 1);
        assert_eq!(wraps.live(), 0);
        assert_eq!(vm.external_memory(), 0);
    }
}
