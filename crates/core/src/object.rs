//! Heap object representation.
//!
//! Every heap value is an [`Obj`]: a small header (allocation link, GC mark
//! bit, traversal bit, payload size) followed by an [`ObjBody`] describing
//! the variant. Objects are allocated by the heap in `memory` and threaded
//! into a single intrusive list; only the sweep phase ever frees one.
//!
//! [`ObjRef`] is the handle the rest of the runtime passes around: a thin
//! non-null pointer with identity equality. Dereferencing one is only sound
//! while the object is reachable, which is the central contract of the
//! collector (see `memory`).

use std::any::Any;
use std::ptr::NonNull;

use crate::chunk::Chunk;
use crate::table::Table;
use crate::value::Value;
use crate::vm::Vm;

/// Signature of a native (built-in) function.
///
/// `base` indexes the receiver slot on the VM value stack; arguments occupy
/// `base + 1 ..= base + num_args`. On success the native writes its result
/// into the receiver slot, pops the arguments (`Vm::native_return` does
/// both) and returns `true`. On failure it calls `Vm::runtime_error` and
/// returns `false`.
pub type NativeFn = fn(vm: &mut Vm, base: usize, num_args: usize) -> bool;

/// A heap-allocated object: GC header plus variant payload.
pub struct Obj {
    /// Next object in the heap's allocation list.
    pub(crate) next: *mut Obj,
    /// Set during the mark phase, cleared by the sweep.
    pub(crate) marked: bool,
    /// Reentrancy guard for prototype-chain walks (`hasAncestor`).
    pub(crate) visited: bool,
    /// Heap bytes owned by the payload at allocation time.
    pub(crate) size: usize,
    pub body: ObjBody,
}

/// The variant payload of a heap object.
pub enum ObjBody {
    String(ObjString),
    Function(ObjFunction),
    Closure(ObjClosure),
    Upvalue(ObjUpvalue),
    Object(ObjObject),
    Native(ObjNative),
}

/// An immutable, interned string with its cached FNV-1a hash.
pub struct ObjString {
    pub hash: u32,
    pub chars: Box<str>,
}

/// A compiled function: bytecode plus calling metadata.
pub struct ObjFunction {
    pub arity: u8,
    pub upvalue_count: usize,
    /// Interned name, if the function was bound to one at compile time.
    pub name: Option<ObjRef>,
    pub chunk: Chunk,
}

/// A function paired with its captured upvalues.
///
/// `upvalues` is pushed to incrementally while the CLOSURE instruction
/// executes; the collector traces however many have been captured so far.
pub struct ObjClosure {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

/// A captured variable.
///
/// Open upvalues point at a live value-stack slot and are threaded into the
/// VM's open-upvalue list, ordered by descending slot. Closing copies the
/// slot into the upvalue itself; the transition is one-way.
pub struct ObjUpvalue {
    pub state: UpvalueState,
}

pub enum UpvalueState {
    Open { slot: usize, next: Option<ObjRef> },
    Closed(Value),
}

/// A user-visible object: a prototype and a slot table.
pub struct ObjObject {
    pub proto: Value,
    pub slots: Table,
}

/// A built-in function, optionally carrying an opaque extension context.
///
/// The context is dropped when the object is swept, which is how extension
/// modules get their teardown hook.
pub struct ObjNative {
    pub function: NativeFn,
    pub ctx: Option<Box<dyn Any>>,
}

impl ObjBody {
    /// Heap bytes owned by this payload beyond the `Obj` allocation itself.
    pub(crate) fn byte_size(&self) -> usize {
        match self {
            ObjBody::String(s) => s.chars.len(),
            ObjBody::Function(f) => {
                f.chunk.code.capacity()
                    + f.chunk.lines.capacity() * size_of::<u32>()
                    + f.chunk.constants.capacity() * size_of::<Value>()
            }
            ObjBody::Closure(c) => c.upvalues.capacity() * size_of::<ObjRef>(),
            ObjBody::Upvalue(_) => 0,
            ObjBody::Object(o) => o.slots.byte_size(),
            ObjBody::Native(_) => 0,
        }
    }

    /// Human-readable variant name, for diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            ObjBody::String(_) => "string",
            ObjBody::Function(_) => "function",
            ObjBody::Closure(_) => "closure",
            ObjBody::Upvalue(_) => "upvalue",
            ObjBody::Object(_) => "object",
            ObjBody::Native(_) => "native",
        }
    }
}

/// Handle to a live heap object. Copyable; equality is pointer identity.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ObjRef(NonNull<Obj>);

impl ObjRef {
    pub(crate) fn from_raw(ptr: *mut Obj) -> ObjRef {
        debug_assert!(!ptr.is_null());
        // Safety: allocation never returns null; OOM aborts in the heap.
        ObjRef(unsafe { NonNull::new_unchecked(ptr) })
    }

    pub(crate) fn as_ptr(self) -> *mut Obj {
        self.0.as_ptr()
    }

    /// Borrow the object.
    ///
    /// # Safety
    /// The object must still be live: reachable from a GC root, or no
    /// collection may run for the duration of the borrow. The returned
    /// lifetime is chosen by the caller and must not outlive either bound.
    #[inline]
    pub unsafe fn as_ref<'a>(self) -> &'a Obj {
        unsafe { &*self.0.as_ptr() }
    }

    /// Mutably borrow the object.
    ///
    /// # Safety
    /// Same liveness requirement as [`ObjRef::as_ref`], and the caller must
    /// not hold any other borrow of the same object.
    #[inline]
    pub unsafe fn as_mut<'a>(self) -> &'a mut Obj {
        unsafe { &mut *self.0.as_ptr() }
    }

    /// # Safety
    /// Liveness as for [`ObjRef::as_ref`]; the object must be a string.
    #[inline]
    pub unsafe fn string<'a>(self) -> &'a ObjString {
        match unsafe { &self.as_ref().body } {
            ObjBody::String(s) => s,
            other => panic!("expected string, got {}", other.kind_name()),
        }
    }

    /// # Safety
    /// Liveness as for [`ObjRef::as_ref`]; the object must be a function.
    #[inline]
    pub unsafe fn function<'a>(self) -> &'a ObjFunction {
        match unsafe { &self.as_ref().body } {
            ObjBody::Function(f) => f,
            other => panic!("expected function, got {}", other.kind_name()),
        }
    }

    /// # Safety
    /// Liveness as for [`ObjRef::as_ref`]; the object must be a closure.
    #[inline]
    pub unsafe fn closure<'a>(self) -> &'a ObjClosure {
        match unsafe { &self.as_ref().body } {
            ObjBody::Closure(c) => c,
            other => panic!("expected closure, got {}", other.kind_name()),
        }
    }

    /// # Safety
    /// Liveness and exclusivity as for [`ObjRef::as_mut`]; must be a closure.
    #[inline]
    pub unsafe fn closure_mut<'a>(self) -> &'a mut ObjClosure {
        match unsafe { &mut self.as_mut().body } {
            ObjBody::Closure(c) => c,
            other => panic!("expected closure, got {}", other.kind_name()),
        }
    }

    /// # Safety
    /// Liveness as for [`ObjRef::as_ref`]; the object must be an upvalue.
    #[inline]
    pub unsafe fn upvalue<'a>(self) -> &'a ObjUpvalue {
        match unsafe { &self.as_ref().body } {
            ObjBody::Upvalue(u) => u,
            other => panic!("expected upvalue, got {}", other.kind_name()),
        }
    }

    /// # Safety
    /// Liveness and exclusivity as for [`ObjRef::as_mut`]; must be an upvalue.
    #[inline]
    pub unsafe fn upvalue_mut<'a>(self) -> &'a mut ObjUpvalue {
        match unsafe { &mut self.as_mut().body } {
            ObjBody::Upvalue(u) => u,
            other => panic!("expected upvalue, got {}", other.kind_name()),
        }
    }

    /// # Safety
    /// Liveness as for [`ObjRef::as_ref`]; the object must be a slot object.
    #[inline]
    pub unsafe fn object<'a>(self) -> &'a ObjObject {
        match unsafe { &self.as_ref().body } {
            ObjBody::Object(o) => o,
            other => panic!("expected object, got {}", other.kind_name()),
        }
    }

    /// # Safety
    /// Liveness and exclusivity as for [`ObjRef::as_mut`]; must be a slot
    /// object.
    #[inline]
    pub unsafe fn object_mut<'a>(self) -> &'a mut ObjObject {
        match unsafe { &mut self.as_mut().body } {
            ObjBody::Object(o) => o,
            other => panic!("expected object, got {}", other.kind_name()),
        }
    }

    /// # Safety
    /// Liveness as for [`ObjRef::as_ref`]; the object must be a native.
    #[inline]
    pub unsafe fn native<'a>(self) -> &'a ObjNative {
        match unsafe { &self.as_ref().body } {
            ObjBody::Native(n) => n,
            other => panic!("expected native, got {}", other.kind_name()),
        }
    }

    /// # Safety
    /// Liveness as for [`ObjRef::as_ref`].
    #[inline]
    pub unsafe fn is_string(self) -> bool {
        matches!(unsafe { &self.as_ref().body }, ObjBody::String(_))
    }

    /// # Safety
    /// Liveness as for [`ObjRef::as_ref`].
    #[inline]
    pub unsafe fn is_closure(self) -> bool {
        matches!(unsafe { &self.as_ref().body }, ObjBody::Closure(_))
    }

    /// # Safety
    /// Liveness as for [`ObjRef::as_ref`].
    #[inline]
    pub unsafe fn is_object(self) -> bool {
        matches!(unsafe { &self.as_ref().body }, ObjBody::Object(_))
    }

    /// # Safety
    /// Liveness as for [`ObjRef::as_ref`].
    #[inline]
    pub unsafe fn is_native(self) -> bool {
        matches!(unsafe { &self.as_ref().body }, ObjBody::Native(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_size_counts_string_bytes() {
        let body = ObjBody::String(ObjString {
            hash: 0,
            chars: "hello".into(),
        });
        assert_eq!(body.byte_size(), 5);
    }

    #[test]
    fn byte_size_counts_upvalue_as_inline() {
        let body = ObjBody::Upvalue(ObjUpvalue {
            state: UpvalueState::Closed(Value::Nil),
        });
        assert_eq!(body.byte_size(), 0);
    }

    #[test]
    fn kind_names() {
        let body = ObjBody::Object(ObjObject {
            proto: Value::Nil,
            slots: Table::new(),
        });
        assert_eq!(body.kind_name(), "object");
    }
}
