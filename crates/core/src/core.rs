//! Core bindings: the builtin prototypes and their native methods.
//!
//! Everything a program can do - arithmetic included - is a slot send, so
//! this module is where the language actually gets its behavior: it builds
//! the Object/Fn/Native/Number/Boolean/String prototypes, installs the
//! native methods on them, and registers the prototypes as globals.

use crate::memory;
use crate::object::{ObjBody, ObjObject, ObjRef};
use crate::table::Table;
use crate::value::Value;
use crate::vm::Vm;

/// Called once from `Vm::with_config`. Allocation order matters only in
/// that each prototype is stored into its VM register (making it a root)
/// before the next allocation can trigger a collection.
pub(crate) fn bootstrap(vm: &mut Vm) {
    vm.cached.get_slot = vm.intern("getSlot");
    vm.cached.set_slot = vm.intern("setSlot");
    vm.cached.eq = vm.intern("==");
    vm.cached.neq = vm.intern("!=");
    vm.cached.not = vm.intern("!");

    let object_proto = new_object(vm, Value::Nil);
    vm.protos.object = Value::Obj(object_proto);
    vm.add_native(object_proto, "proto", obj_proto);
    vm.add_native(object_proto, "setProto", obj_set_proto);
    vm.add_native(object_proto, "rawGetSlot", obj_raw_get_slot);
    vm.add_native(object_proto, "rawSetSlot", obj_raw_set_slot);
    vm.add_native(object_proto, "hasSlot", obj_has_slot);
    vm.add_native(object_proto, "getOwnSlot", obj_get_own_slot);
    vm.add_native(object_proto, "setOwnSlot", obj_set_own_slot);
    vm.add_native(object_proto, "hasOwnSlot", obj_has_own_slot);
    vm.add_native(object_proto, "deleteSlot", obj_delete_slot);
    vm.add_native(object_proto, "same", obj_same);
    vm.add_native(object_proto, "==", obj_equal);
    vm.add_native(object_proto, "!=", obj_not_equal);
    vm.add_native(object_proto, "!", obj_not);
    vm.add_native(object_proto, "clone", obj_clone);
    vm.add_native(object_proto, "hasAncestor", obj_has_ancestor);

    let fn_proto = new_object(vm, vm.protos.object);
    vm.protos.function = Value::Obj(fn_proto);
    vm.add_native(fn_proto, "new", fn_new);
    vm.add_native(fn_proto, "call", fn_call);
    vm.add_native(fn_proto, "callWithThis", fn_call_with_this);

    let native_proto = new_object(vm, vm.protos.object);
    vm.protos.native = Value::Obj(native_proto);
    vm.add_native(native_proto, "call", native_call);
    vm.add_native(native_proto, "callWithThis", native_call_with_this);

    let number_proto = new_object(vm, vm.protos.object);
    vm.protos.number = Value::Obj(number_proto);
    vm.add_native(number_proto, "+", num_plus);
    vm.add_native(number_proto, "-", num_minus);
    vm.add_native(number_proto, "*", num_multiply);
    vm.add_native(number_proto, "/", num_divide);
    vm.add_native(number_proto, "<", num_lt);
    vm.add_native(number_proto, ">", num_gt);
    vm.add_native(number_proto, "<=", num_leq);
    vm.add_native(number_proto, ">=", num_geq);
    vm.add_native(number_proto, "neg", num_negate);

    let boolean_proto = new_object(vm, vm.protos.object);
    vm.protos.boolean = Value::Obj(boolean_proto);

    let string_proto = new_object(vm, vm.protos.object);
    vm.protos.string = Value::Obj(string_proto);
    vm.add_native(string_proto, "+", str_plus);

    vm.add_global("Object", vm.protos.object);
    vm.add_global("Fn", vm.protos.function);
    vm.add_global("Native", vm.protos.native);
    vm.add_global("Number", vm.protos.number);
    vm.add_global("Boolean", vm.protos.boolean);
    vm.add_global("String", vm.protos.string);
}

fn new_object(vm: &mut Vm, proto: Value) -> ObjRef {
    memory::allocate(
        vm,
        ObjBody::Object(ObjObject {
            proto,
            slots: Table::new(),
        }),
    )
}

fn fail(vm: &mut Vm, message: &str) -> bool {
    vm.runtime_error(message);
    false
}

/// The receiver as a slot object, if it is one.
fn as_object(value: Value) -> Option<ObjRef> {
    // Safety: natives only see rooted stack values.
    value.as_obj().filter(|r| unsafe { r.is_object() })
}

// ----------------------------------------------------------------------
// Object prototype
// ----------------------------------------------------------------------

fn obj_proto(vm: &mut Vm, base: usize, _num_args: usize) -> bool {
    let proto = vm.prototype_of(vm.arg(base, 0));
    vm.native_return(base, proto);
    true
}

fn obj_set_proto(vm: &mut Vm, base: usize, num_args: usize) -> bool {
    if num_args == 0 {
        return fail(vm, "setProto expects an argument.");
    }
    let Some(receiver) = as_object(vm.arg(base, 0)) else {
        return fail(vm, "setProto called on a non-object.");
    };
    let proto = vm.arg(base, 1);
    // Safety: the receiver sits on the stack, a root.
    let object = unsafe { receiver.object_mut() };
    object.proto = proto;
    vm.native_return(base, Value::Nil);
    true
}

fn obj_raw_get_slot(vm: &mut Vm, base: usize, num_args: usize) -> bool {
    if num_args == 0 {
        return fail(vm, "rawGetSlot expects an argument.");
    }
    let value = vm
        .get_slot_value(vm.arg(base, 0), vm.arg(base, 1))
        .unwrap_or(Value::Nil);
    vm.native_return(base, value);
    true
}

fn obj_raw_set_slot(vm: &mut Vm, base: usize, num_args: usize) -> bool {
    if num_args < 2 {
        return fail(vm, "rawSetSlot expects 2 arguments.");
    }
    let Some(receiver) = as_object(vm.arg(base, 0)) else {
        return fail(vm, "rawSetSlot called on a non-object.");
    };
    let key = vm.arg(base, 1);
    let value = vm.arg(base, 2);
    // Safety: the receiver sits on the stack, a root.
    let object = unsafe { receiver.object_mut() };
    object.slots.set(&mut vm.heap, key, value);
    vm.native_return(base, Value::Nil);
    true
}

fn obj_has_slot(vm: &mut Vm, base: usize, num_args: usize) -> bool {
    if num_args == 0 {
        return fail(vm, "hasSlot expects an argument.");
    }
    let found = vm
        .get_slot_value(vm.arg(base, 0), vm.arg(base, 1))
        .is_some();
    vm.native_return(base, Value::bool(found));
    true
}

fn obj_get_own_slot(vm: &mut Vm, base: usize, num_args: usize) -> bool {
    if num_args == 0 {
        return fail(vm, "getOwnSlot expects an argument.");
    }
    let Some(receiver) = as_object(vm.arg(base, 0)) else {
        vm.native_return(base, Value::Nil);
        return true;
    };
    // Safety: the receiver sits on the stack, a root.
    let value = unsafe { receiver.object() }
        .slots
        .get(vm.arg(base, 1))
        .unwrap_or(Value::Nil);
    vm.native_return(base, value);
    true
}

fn obj_set_own_slot(vm: &mut Vm, base: usize, num_args: usize) -> bool {
    if num_args != 2 {
        return fail(vm, "setOwnSlot expects 2 arguments.");
    }
    let Some(receiver) = as_object(vm.arg(base, 0)) else {
        vm.native_return(base, Value::Nil);
        return true;
    };
    let key = vm.arg(base, 1);
    let value = vm.arg(base, 2);
    // Safety: the receiver sits on the stack, a root.
    let object = unsafe { receiver.object_mut() };
    object.slots.set(&mut vm.heap, key, value);
    vm.native_return(base, value);
    true
}

fn obj_has_own_slot(vm: &mut Vm, base: usize, num_args: usize) -> bool {
    if num_args == 0 {
        return fail(vm, "hasOwnSlot expects an argument.");
    }
    let Some(receiver) = as_object(vm.arg(base, 0)) else {
        vm.native_return(base, Value::False);
        return true;
    };
    // Safety: the receiver sits on the stack, a root.
    let found = unsafe { receiver.object() }.slots.get(vm.arg(base, 1)).is_some();
    vm.native_return(base, Value::bool(found));
    true
}

/// Returns whether the slot existed before the delete. Only errors on a
/// non-object receiver.
fn obj_delete_slot(vm: &mut Vm, base: usize, num_args: usize) -> bool {
    if num_args == 0 {
        return fail(vm, "deleteSlot expects an argument.");
    }
    let Some(receiver) = as_object(vm.arg(base, 0)) else {
        return fail(vm, "deleteSlot called on a non-object.");
    };
    let key = vm.arg(base, 1);
    // Safety: the receiver sits on the stack, a root.
    let existed = unsafe { receiver.object_mut() }.slots.delete(key);
    vm.native_return(base, Value::bool(existed));
    true
}

fn obj_same(vm: &mut Vm, base: usize, num_args: usize) -> bool {
    if num_args < 2 {
        return fail(vm, "same expects 2 arguments.");
    }
    let result = Value::bool(vm.arg(base, 1) == vm.arg(base, 2));
    vm.native_return(base, result);
    true
}

fn obj_equal(vm: &mut Vm, base: usize, num_args: usize) -> bool {
    if num_args == 0 {
        return fail(vm, "== expects an argument.");
    }
    let result = Value::bool(vm.arg(base, 0) == vm.arg(base, 1));
    vm.native_return(base, result);
    true
}

fn obj_not_equal(vm: &mut Vm, base: usize, num_args: usize) -> bool {
    if num_args == 0 {
        return fail(vm, "!= expects an argument.");
    }
    let result = Value::bool(vm.arg(base, 0) != vm.arg(base, 1));
    vm.native_return(base, result);
    true
}

fn obj_not(vm: &mut Vm, base: usize, _num_args: usize) -> bool {
    let result = Value::bool(!vm.arg(base, 0).truthy());
    vm.native_return(base, result);
    true
}

fn obj_clone(vm: &mut Vm, base: usize, _num_args: usize) -> bool {
    let proto = vm.arg(base, 0);
    let object = new_object(vm, proto);
    vm.native_return(base, Value::Obj(object));
    true
}

fn obj_has_ancestor(vm: &mut Vm, base: usize, num_args: usize) -> bool {
    if num_args == 0 {
        return fail(vm, "hasAncestor expects an argument.");
    }
    let result = Value::bool(vm.has_ancestor(vm.arg(base, 0), vm.arg(base, 1)));
    vm.native_return(base, result);
    true
}

// ----------------------------------------------------------------------
// Fn and Native prototypes
// ----------------------------------------------------------------------

fn closure_receiver(vm: &mut Vm, base: usize, what: &str) -> Option<ObjRef> {
    let receiver = vm.arg(base, 0);
    // Safety: natives only see rooted stack values.
    match receiver.as_obj().filter(|r| unsafe { r.is_closure() }) {
        Some(r) => Some(r),
        None => {
            vm.runtime_error(&format!("{} called on a non-closure.", what));
            None
        }
    }
}

fn fn_new(vm: &mut Vm, base: usize, num_args: usize) -> bool {
    if num_args == 0 {
        return fail(vm, "Fn.new expects a function.");
    }
    let value = vm.arg(base, 1);
    // Safety: the argument sits on the stack, a root.
    if value.as_obj().filter(|r| unsafe { r.is_closure() }).is_none() {
        return fail(vm, "Fn.new called with a non-function.");
    }
    vm.native_return(base, value);
    true
}

fn fn_call(vm: &mut Vm, base: usize, num_args: usize) -> bool {
    let Some(closure) = closure_receiver(vm, base, "call") else {
        return false;
    };
    vm.push_frame(closure, num_args)
}

fn fn_call_with_this(vm: &mut Vm, base: usize, num_args: usize) -> bool {
    let Some(closure) = closure_receiver(vm, base, "callWithThis") else {
        return false;
    };
    if num_args == 0 {
        return fail(vm, "callWithThis expects a receiver argument.");
    }
    // Shift the arguments down one slot so the explicit receiver replaces
    // the implicit one:  [fn, this', a1, ..] -> [this', a1, ..]
    for i in 0..num_args {
        let value = vm.arg(base, i + 1);
        vm.set_arg(base, i, value);
    }
    vm.pop();
    vm.push_frame(closure, num_args - 1)
}

fn native_receiver(vm: &mut Vm, base: usize, what: &str) -> Option<ObjRef> {
    let receiver = vm.arg(base, 0);
    // Safety: natives only see rooted stack values.
    match receiver.as_obj().filter(|r| unsafe { r.is_native() }) {
        Some(r) => Some(r),
        None => {
            vm.runtime_error(&format!("{} called on a non-native.", what));
            None
        }
    }
}

fn native_call(vm: &mut Vm, base: usize, num_args: usize) -> bool {
    let Some(native) = native_receiver(vm, base, "call") else {
        return false;
    };
    // Safety: the receiver sits on the stack, a root.
    let function = unsafe { native.native() }.function;
    function(vm, base, num_args)
}

fn native_call_with_this(vm: &mut Vm, base: usize, num_args: usize) -> bool {
    let Some(native) = native_receiver(vm, base, "callWithThis") else {
        return false;
    };
    if num_args == 0 {
        return fail(vm, "callWithThis expects a receiver argument.");
    }
    // Safety: the receiver sits on the stack, a root.
    let function = unsafe { native.native() }.function;
    for i in 0..num_args {
        let value = vm.arg(base, i + 1);
        vm.set_arg(base, i, value);
    }
    vm.pop();
    function(vm, base, num_args - 1)
}

// ----------------------------------------------------------------------
// Number prototype
// ----------------------------------------------------------------------

fn number_operands(vm: &mut Vm, base: usize, num_args: usize, op: &str) -> Option<(f64, f64)> {
    let Some(a) = vm.arg(base, 0).as_number() else {
        vm.runtime_error(&format!("'{}' expects to be called on a number.", op));
        return None;
    };
    if num_args == 0 {
        vm.runtime_error(&format!("'{}' expects an argument.", op));
        return None;
    }
    let Some(b) = vm.arg(base, 1).as_number() else {
        vm.runtime_error(&format!("'{}' called with a non-number.", op));
        return None;
    };
    Some((a, b))
}

macro_rules! number_method {
    ($name:ident, $op:tt, $wrap:expr) => {
        fn $name(vm: &mut Vm, base: usize, num_args: usize) -> bool {
            match number_operands(vm, base, num_args, stringify!($op)) {
                Some((a, b)) => {
                    let result = $wrap(a $op b);
                    vm.native_return(base, result);
                    true
                }
                None => false,
            }
        }
    };
}

number_method!(num_plus, +, Value::Number);
number_method!(num_minus, -, Value::Number);
number_method!(num_multiply, *, Value::Number);
number_method!(num_divide, /, Value::Number);
number_method!(num_lt, <, Value::bool);
number_method!(num_gt, >, Value::bool);
number_method!(num_leq, <=, Value::bool);
number_method!(num_geq, >=, Value::bool);

fn num_negate(vm: &mut Vm, base: usize, _num_args: usize) -> bool {
    let Some(n) = vm.arg(base, 0).as_number() else {
        return fail(vm, "'neg' expects to be called on a number.");
    };
    vm.native_return(base, Value::Number(-n));
    true
}

// ----------------------------------------------------------------------
// String prototype
// ----------------------------------------------------------------------

fn str_plus(vm: &mut Vm, base: usize, num_args: usize) -> bool {
    // Safety: both operands sit on the stack, roots for the concat below.
    let Some(a) = (unsafe { vm.arg(base, 0).as_string() }) else {
        return fail(vm, "'+' expects to be called on a string.");
    };
    if num_args == 0 {
        return fail(vm, "'+' expects an argument.");
    }
    let Some(b) = (unsafe { vm.arg(base, 1).as_string() }) else {
        return fail(vm, "'+' called with a non-string.");
    };
    let result = vm.concat_strings(a, b);
    vm.native_return(base, Value::Obj(result));
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_registers_prototype_globals() {
        let mut vm = Vm::new();
        for name in ["Object", "Fn", "Native", "Number", "Boolean", "String"] {
            let key = vm.intern(name);
            assert!(vm.globals.get(key).is_some(), "missing global {}", name);
        }
    }

    #[test]
    fn scalar_prototypes_chain_to_object() {
        let vm = Vm::new();
        assert!(vm.has_ancestor(Value::Number(1.0), vm.protos.object));
        assert!(vm.has_ancestor(Value::True, vm.protos.object));
        assert!(vm.has_ancestor(Value::Nil, vm.protos.object));
    }

    #[test]
    fn native_context_roundtrip() {
        let mut vm = Vm::new();
        let Value::Obj(object_proto) = vm.protos.object else {
            panic!("no object proto");
        };
        fn stub(vm: &mut Vm, base: usize, _num_args: usize) -> bool {
            vm.native_return(base, Value::Nil);
            true
        }
        vm.add_native_with_context(object_proto, "stub", stub, Some(Box::new(42u32)));
        let key = vm.intern("stub");
        let native = vm.get_slot_value(vm.protos.object, key).unwrap();
        assert_eq!(vm.native_context::<u32>(native), Some(&42));
        assert_eq!(vm.native_context::<String>(native), None);
    }
}
