//! Heap and garbage collector.
//!
//! All heap objects flow through [`allocate`], the single allocation
//! primitive. Every call to it is a potential collection point: any value
//! the caller still needs must already be reachable from a root (the value
//! stack, the globals, or the temporary root register) before calling.
//! Violating that is the classic use-after-free in this design, so natives
//! bracket allocation sequences with `Vm::push_root`/`Vm::pop_root`.
//!
//! The collector is a precise, stop-the-world tri-color mark-sweep:
//! mark roots, drain the gray stack, weak-sweep the string intern table,
//! then sweep the allocation list and free everything unmarked.

use std::ptr;

use tracing::debug;

use crate::object::{Obj, ObjBody, ObjRef, UpvalueState};
use crate::table::Table;
use crate::value::Value;
use crate::vm::Vm;

/// Collector tuning knobs.
#[derive(Clone, Copy, Debug)]
pub struct GcConfig {
    /// Allocated-byte threshold for the first collection.
    pub initial_threshold: usize,
    /// Floor for the post-collection threshold.
    pub min_threshold: usize,
    /// `next_gc = live_bytes * growth_factor` after each cycle.
    pub growth_factor: usize,
    /// Collect on every allocation. Miserably slow, catches every missing
    /// root immediately; used by tests.
    pub stress: bool,
}

impl Default for GcConfig {
    fn default() -> GcConfig {
        GcConfig {
            initial_threshold: 1024 * 1024,
            min_threshold: 1024 * 1024,
            growth_factor: 2,
            stress: false,
        }
    }
}

/// Owns every heap object, threaded through an intrusive list.
pub struct Heap {
    objects: *mut Obj,
    bytes_allocated: usize,
    next_gc: usize,
    gray: Vec<ObjRef>,
    temp_roots: Vec<Value>,
    config: GcConfig,
}

impl Heap {
    pub fn new(config: GcConfig) -> Heap {
        Heap {
            objects: ptr::null_mut(),
            bytes_allocated: 0,
            next_gc: config.initial_threshold,
            gray: Vec::new(),
            temp_roots: Vec::new(),
            config,
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn next_gc(&self) -> usize {
        self.next_gc
    }

    /// Number of live objects on the allocation list.
    pub fn object_count(&self) -> usize {
        let mut n = 0;
        let mut cur = self.objects;
        while !cur.is_null() {
            n += 1;
            // Safety: the list only contains live allocations.
            cur = unsafe { (*cur).next };
        }
        n
    }

    /// Account for in-place growth of a buffer owned by a live object (or
    /// by the VM's own tables). Never a collection point.
    pub(crate) fn record_growth(&mut self, bytes: usize) {
        self.bytes_allocated += bytes;
    }

    pub(crate) fn push_root(&mut self, value: Value) {
        self.temp_roots.push(value);
    }

    pub(crate) fn pop_root(&mut self) {
        debug_assert!(!self.temp_roots.is_empty(), "root stack underflow");
        self.temp_roots.pop();
    }

    /// Link a freshly built object into the allocation list. Callers go
    /// through [`allocate`], which handles the collection trigger first.
    fn alloc_raw(&mut self, body: ObjBody, payload: usize) -> ObjRef {
        self.bytes_allocated += size_of::<Obj>() + payload;
        let obj = Box::new(Obj {
            next: self.objects,
            marked: false,
            visited: false,
            size: payload,
            body,
        });
        let ptr = Box::into_raw(obj);
        self.objects = ptr;
        ObjRef::from_raw(ptr)
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let mut cur = self.objects;
        while !cur.is_null() {
            // Safety: the list owns these allocations; each is freed once.
            unsafe {
                let next = (*cur).next;
                drop(Box::from_raw(cur));
                cur = next;
            }
        }
        self.objects = ptr::null_mut();
    }
}

/// The single allocation primitive. May collect before returning, so every
/// heap value inside `body`, and anything else the caller holds, must be
/// reachable from a root.
pub(crate) fn allocate(vm: &mut Vm, body: ObjBody) -> ObjRef {
    let payload = body.byte_size();
    let projected = vm.heap.bytes_allocated + size_of::<Obj>() + payload;
    if vm.heap.config.stress || projected > vm.heap.next_gc {
        collect_garbage(vm);
    }
    vm.heap.alloc_raw(body, payload)
}

/// Run a full collection cycle.
pub fn collect_garbage(vm: &mut Vm) {
    let before = vm.heap.bytes_allocated;

    mark_roots(vm);
    trace_references(&mut vm.heap);
    // Intern entries are weak: drop the ones whose string died, before the
    // sweep frees the strings themselves.
    vm.strings.remove_white();
    sweep(&mut vm.heap);

    vm.heap.next_gc = (vm.heap.bytes_allocated * vm.heap.config.growth_factor)
        .max(vm.heap.config.min_threshold);
    debug!(
        freed = before - vm.heap.bytes_allocated,
        live = vm.heap.bytes_allocated,
        next_gc = vm.heap.next_gc,
        "gc cycle"
    );
}

fn mark_roots(vm: &mut Vm) {
    for i in 0..vm.stack_top {
        mark_value(&mut vm.heap.gray, vm.stack[i]);
    }

    for frame in &vm.frames {
        mark_object(&mut vm.heap.gray, frame.closure);
    }

    let mut upvalue = vm.open_upvalues;
    while let Some(u) = upvalue {
        mark_object(&mut vm.heap.gray, u);
        // Safety: the open-upvalue list holds live upvalues.
        upvalue = match unsafe { &u.upvalue().state } {
            UpvalueState::Open { next, .. } => *next,
            UpvalueState::Closed(_) => None,
        };
    }

    for proto in [
        vm.protos.object,
        vm.protos.function,
        vm.protos.native,
        vm.protos.number,
        vm.protos.boolean,
        vm.protos.string,
    ] {
        mark_value(&mut vm.heap.gray, proto);
    }
    for key in [
        vm.cached.get_slot,
        vm.cached.set_slot,
        vm.cached.eq,
        vm.cached.neq,
        vm.cached.not,
    ] {
        mark_value(&mut vm.heap.gray, key);
    }

    mark_table(&mut vm.heap.gray, &vm.globals);

    for i in 0..vm.compiler_roots.len() {
        mark_value(&mut vm.heap.gray, vm.compiler_roots[i]);
    }

    for i in 0..vm.heap.temp_roots.len() {
        let v = vm.heap.temp_roots[i];
        mark_value(&mut vm.heap.gray, v);
    }
}

#[inline]
fn mark_value(gray: &mut Vec<ObjRef>, value: Value) {
    if let Value::Obj(r) = value {
        mark_object(gray, r);
    }
}

fn mark_object(gray: &mut Vec<ObjRef>, r: ObjRef) {
    // Safety: marking only touches live objects; the mutator is stopped.
    let obj = unsafe { r.as_mut() };
    if obj.marked {
        return;
    }
    obj.marked = true;
    gray.push(r);
}

fn mark_table(gray: &mut Vec<ObjRef>, table: &Table) {
    for entry in table.entries() {
        mark_value(gray, entry.key);
        mark_value(gray, entry.value);
    }
}

fn trace_references(heap: &mut Heap) {
    while let Some(r) = heap.gray.pop() {
        blacken(heap, r);
    }
}

/// Enqueue the children of a marked object. Strings and natives have none;
/// an open upvalue's referent lives on the value stack, which is a root.
fn blacken(heap: &mut Heap, r: ObjRef) {
    // Safety: `r` came off the gray stack, so it is marked and live.
    match unsafe { &r.as_ref().body } {
        ObjBody::String(_) | ObjBody::Native(_) => {}
        ObjBody::Function(f) => {
            for &constant in &f.chunk.constants {
                mark_value(&mut heap.gray, constant);
            }
            if let Some(name) = f.name {
                mark_object(&mut heap.gray, name);
            }
        }
        ObjBody::Closure(c) => {
            mark_object(&mut heap.gray, c.function);
            for &upvalue in &c.upvalues {
                mark_object(&mut heap.gray, upvalue);
            }
        }
        ObjBody::Upvalue(u) => {
            if let UpvalueState::Closed(value) = u.state {
                mark_value(&mut heap.gray, value);
            }
        }
        ObjBody::Object(o) => {
            mark_value(&mut heap.gray, o.proto);
            mark_table(&mut heap.gray, &o.slots);
        }
    }
}

fn sweep(heap: &mut Heap) {
    let mut prev: *mut Obj = ptr::null_mut();
    let mut cur = heap.objects;
    while !cur.is_null() {
        // Safety: walking the allocation list during stop-the-world sweep;
        // each node is either unlinked-and-freed exactly once or retained.
        unsafe {
            if (*cur).marked {
                (*cur).marked = false;
                prev = cur;
                cur = (*cur).next;
            } else {
                let dead = cur;
                cur = (*cur).next;
                if prev.is_null() {
                    heap.objects = cur;
                } else {
                    (*prev).next = cur;
                }
                let obj = Box::from_raw(dead);
                // Post-allocation growth was recorded separately, so the
                // current payload size (never less than the size stamped at
                // allocation) is exactly what this object contributed.
                let payload = obj.body.byte_size().max(obj.size);
                heap.bytes_allocated -= size_of::<Obj>() + payload;
                // Dropping runs the variant destructor: string bytes,
                // function chunks, slot tables, native contexts.
                drop(obj);
            }
        }
    }
}
