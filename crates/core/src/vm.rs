//! The virtual machine: value stack, call frames, dispatch loop, and the
//! prototype send protocol.
//!
//! A single [`Vm`] owns everything: both stacks, the globals and intern
//! tables, the six builtin prototypes, the heap, and the temporary root
//! register. All mutator operations run synchronously on one thread; the
//! collector runs to completion inside the allocation primitive.

use std::any::Any;

use tracing::trace;

use crate::chunk::{Chunk, OpCode};
use crate::compiler;
use crate::core;
use crate::debug;
use crate::memory::{self, GcConfig, Heap};
use crate::object::{NativeFn, ObjBody, ObjClosure, ObjNative, ObjObject, ObjRef, ObjString,
                    ObjUpvalue, UpvalueState};
use crate::table::Table;
use crate::value::{Value, hash_bytes};

pub const FRAMES_MAX: usize = 64;
pub const STACK_MAX: usize = 256 * FRAMES_MAX;

/// Bound on prototype-chain walks; longer chains (cycles included) read as
/// "not found".
const MAX_PROTO_CHAIN: usize = 128;

/// Outcome of interpreting a top-level program.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InterpretResult {
    Ok,
    CompileError,
    RuntimeError,
}

pub(crate) struct CallFrame {
    pub closure: ObjRef,
    pub ip: usize,
    pub base: usize,
}

/// The six builtin prototype registers. Nil until `core::bootstrap` runs,
/// and GC roots from then on.
pub(crate) struct Protos {
    pub object: Value,
    pub function: Value,
    pub native: Value,
    pub number: Value,
    pub boolean: Value,
    pub string: Value,
}

impl Default for Protos {
    fn default() -> Protos {
        Protos {
            object: Value::Nil,
            function: Value::Nil,
            native: Value::Nil,
            number: Value::Nil,
            boolean: Value::Nil,
            string: Value::Nil,
        }
    }
}

/// Key strings the dispatcher and compiler consult on every send; cached
/// once at bootstrap so they are interned exactly once and marked as roots.
pub(crate) struct CachedKeys {
    pub get_slot: Value,
    pub set_slot: Value,
    pub eq: Value,
    pub neq: Value,
    pub not: Value,
}

impl Default for CachedKeys {
    fn default() -> CachedKeys {
        CachedKeys {
            get_slot: Value::Nil,
            set_slot: Value::Nil,
            eq: Value::Nil,
            neq: Value::Nil,
            not: Value::Nil,
        }
    }
}

pub struct Vm {
    pub(crate) stack: Box<[Value]>,
    pub(crate) stack_top: usize,
    pub(crate) frames: Vec<CallFrame>,

    /// Open upvalues, ordered by descending stack slot. The head captures
    /// the topmost slot, so a frame return closes a suffix in one pass.
    pub(crate) open_upvalues: Option<ObjRef>,

    pub(crate) globals: Table,
    /// String intern table. Weak: the collector prunes entries whose string
    /// died before sweeping.
    pub(crate) strings: Table,

    pub(crate) protos: Protos,
    pub(crate) cached: CachedKeys,

    /// Heap values created by an in-progress compile. The compiler parks
    /// every constant and finished function here so a collection triggered
    /// mid-compile can see them.
    pub(crate) compiler_roots: Vec<Value>,

    pub(crate) heap: Heap,
}

impl Default for Vm {
    fn default() -> Vm {
        Vm::new()
    }
}

impl Vm {
    pub fn new() -> Vm {
        Vm::with_config(GcConfig::default())
    }

    pub fn with_config(config: GcConfig) -> Vm {
        let mut vm = Vm {
            stack: vec![Value::Undefined; STACK_MAX].into_boxed_slice(),
            stack_top: 0,
            frames: Vec::with_capacity(FRAMES_MAX),
            open_upvalues: None,
            globals: Table::new(),
            strings: Table::new(),
            protos: Protos::default(),
            cached: CachedKeys::default(),
            compiler_roots: Vec::new(),
            heap: Heap::new(config),
        };
        core::bootstrap(&mut vm);
        vm
    }

    /// Compile and execute a top-level program.
    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        let Some(function) = compiler::compile(self, source) else {
            return InterpretResult::CompileError;
        };
        self.reset_stack();
        self.push(Value::Obj(function));
        let closure = memory::allocate(
            self,
            ObjBody::Closure(ObjClosure {
                function,
                upvalues: Vec::new(),
            }),
        );
        self.pop();
        self.push(Value::Obj(closure));
        // The compiled program is rooted through the frame now; the
        // compiler's root buffer has done its job.
        self.compiler_roots.clear();
        if !self.push_frame(closure, 0) {
            self.reset_stack();
            return InterpretResult::RuntimeError;
        }
        let result = self.run();
        self.reset_stack();
        result
    }

    // ------------------------------------------------------------------
    // Embedding surface
    // ------------------------------------------------------------------

    /// Anchor a value for the collector across upcoming allocations.
    /// Strictly LIFO with [`Vm::pop_root`].
    pub fn push_root(&mut self, value: Value) {
        self.heap.push_root(value);
    }

    pub fn pop_root(&mut self) {
        self.heap.pop_root();
    }

    /// Intern `text`, returning the canonical string value.
    pub fn intern(&mut self, text: &str) -> Value {
        Value::Obj(self.intern_ref(text))
    }

    /// Read a global binding back out, e.g. after an `interpret` call.
    pub fn get_global(&mut self, name: &str) -> Option<Value> {
        let key = self.intern(name);
        self.globals.get(key)
    }

    /// Define (or overwrite) a global binding.
    pub fn add_global(&mut self, name: &str, value: Value) {
        self.push_root(value);
        let key = self.intern(name);
        self.globals.set(&mut self.heap, key, value);
        self.pop_root();
    }

    /// Install a native method on `target`'s slot table. `target` must be
    /// rooted by the caller (the builtin prototypes always are).
    pub fn add_native(&mut self, target: ObjRef, name: &str, function: NativeFn) {
        self.add_native_with_context(target, name, function, None);
    }

    /// As [`Vm::add_native`], attaching an opaque extension context. The
    /// context is dropped when the native is swept.
    pub fn add_native_with_context(
        &mut self,
        target: ObjRef,
        name: &str,
        function: NativeFn,
        ctx: Option<Box<dyn Any>>,
    ) {
        let native = memory::allocate(self, ObjBody::Native(ObjNative { function, ctx }));
        self.push_root(Value::Obj(native));
        let key = self.intern(name);
        // Safety: `target` is rooted by the caller and must be an object.
        let object = unsafe { target.object_mut() };
        object.slots.set(&mut self.heap, key, Value::Obj(native));
        self.pop_root();
    }

    /// Downcast the extension context of a native value.
    pub fn native_context<T: 'static>(&self, native: Value) -> Option<&T> {
        let r = native.as_obj()?;
        // Safety: the caller hands us a value it holds live.
        let n = unsafe {
            if !r.is_native() {
                return None;
            }
            r.native()
        };
        n.ctx.as_ref()?.downcast_ref::<T>()
    }

    /// Force a full collection cycle.
    pub fn collect(&mut self) {
        memory::collect_garbage(self);
    }

    pub fn bytes_allocated(&self) -> usize {
        self.heap.bytes_allocated()
    }

    pub fn object_count(&self) -> usize {
        self.heap.object_count()
    }

    // ------------------------------------------------------------------
    // Value stack
    // ------------------------------------------------------------------

    #[inline]
    pub(crate) fn push(&mut self, value: Value) {
        debug_assert!(self.stack_top < STACK_MAX, "value stack overflow");
        self.stack[self.stack_top] = value;
        self.stack_top += 1;
    }

    #[inline]
    pub fn pop(&mut self) -> Value {
        debug_assert!(self.stack_top > 0, "value stack underflow");
        self.stack_top -= 1;
        self.stack[self.stack_top]
    }

    #[inline]
    pub(crate) fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack_top - 1 - distance]
    }

    /// Argument accessor for natives: `index` 0 is the receiver.
    #[inline]
    pub fn arg(&self, base: usize, index: usize) -> Value {
        self.stack[base + index]
    }

    /// Mutate an argument slot in place (used by `callWithThis` shifting).
    #[inline]
    pub fn set_arg(&mut self, base: usize, index: usize, value: Value) {
        self.stack[base + index] = value;
    }

    /// Native success protocol: result replaces the receiver slot and the
    /// arguments are popped.
    #[inline]
    pub fn native_return(&mut self, base: usize, value: Value) {
        self.stack[base] = value;
        self.stack_top = base + 1;
    }

    fn reset_stack(&mut self) {
        self.stack_top = 0;
        self.frames.clear();
        self.open_upvalues = None;
    }

    // ------------------------------------------------------------------
    // Errors
    // ------------------------------------------------------------------

    /// Report a runtime error. The dispatch loop unwinds afterwards and
    /// `interpret` resets both stacks.
    pub fn runtime_error(&mut self, message: &str) {
        eprintln!("{}", message);
        if let Some(frame) = self.frames.last() {
            // Safety: frame closures are GC roots.
            let chunk = unsafe { &frame.closure.closure().function.function().chunk };
            let instruction = frame.ip.saturating_sub(1);
            if instruction < chunk.lines.len() {
                eprintln!("[line {}] in script", chunk.line_at(instruction));
            }
        }
    }

    // ------------------------------------------------------------------
    // Strings
    // ------------------------------------------------------------------

    pub(crate) fn intern_ref(&mut self, text: &str) -> ObjRef {
        let hash = hash_bytes(text.as_bytes());
        if let Some(existing) = self.strings.find_string(text, hash) {
            return existing;
        }
        let string = memory::allocate(
            self,
            ObjBody::String(ObjString {
                hash,
                chars: text.into(),
            }),
        );
        self.strings.set(&mut self.heap, Value::Obj(string), Value::Nil);
        string
    }

    /// Concatenate two strings, funneling the result through the intern
    /// table. Both operands must be rooted (on the stack, during sends).
    pub(crate) fn concat_strings(&mut self, a: ObjRef, b: ObjRef) -> ObjRef {
        // Safety: both operands are rooted by the caller.
        let combined = unsafe { format!("{}{}", a.string().chars, b.string().chars) };
        self.intern_ref(&combined)
    }

    // ------------------------------------------------------------------
    // Prototypes and slot lookup
    // ------------------------------------------------------------------

    /// The prototype of any value. Nil terminates the chain.
    pub fn prototype_of(&self, value: Value) -> Value {
        match value {
            // Safety: callers only ask about live values.
            Value::Obj(r) => match unsafe { &r.as_ref().body } {
                ObjBody::Object(o) => o.proto,
                ObjBody::Closure(_) => self.protos.function,
                ObjBody::Native(_) => self.protos.native,
                ObjBody::String(_) => self.protos.string,
                ObjBody::Function(_) | ObjBody::Upvalue(_) => Value::Nil,
            },
            Value::Number(_) => self.protos.number,
            Value::True | Value::False => self.protos.boolean,
            Value::Nil => self.protos.object,
            Value::Undefined => Value::Nil,
        }
    }

    /// Resolve `key` along `receiver`'s prototype chain. The walk is
    /// bounded, so cyclic chains read as a miss.
    pub fn get_slot_value(&self, receiver: Value, key: Value) -> Option<Value> {
        let mut current = receiver;
        for _ in 0..MAX_PROTO_CHAIN {
            if let Value::Obj(r) = current {
                // Safety: chain members are reachable from the receiver.
                if let ObjBody::Object(o) = unsafe { &r.as_ref().body } {
                    if let Some(value) = o.slots.get(key) {
                        return Some(value);
                    }
                }
            }
            current = self.prototype_of(current);
            if current.is_nil() {
                return None;
            }
        }
        None
    }

    /// True when `target` appears anywhere on `src`'s prototype chain,
    /// `src` itself included. Cycles are broken with the per-object
    /// `visited` bit, cleared on unwind.
    pub fn has_ancestor(&self, src: Value, target: Value) -> bool {
        if src == target {
            return true;
        }
        if let Some(r) = src.as_obj() {
            // Safety: chain members are live; the bit is cleared below.
            let obj = unsafe { r.as_mut() };
            if obj.visited {
                return false;
            }
            obj.visited = true;
        }
        let result = self.has_ancestor(self.prototype_of(src), target);
        if let Some(r) = src.as_obj() {
            let obj = unsafe { r.as_mut() };
            obj.visited = false;
        }
        result
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    /// Begin executing `closure` with `num_args` arguments already on the
    /// stack above its receiver slot. Errors on arity mismatch or frame
    /// exhaustion.
    pub fn push_frame(&mut self, closure: ObjRef, num_args: usize) -> bool {
        // Safety: the closure came from a live slot or the interpret entry.
        let arity = unsafe { closure.closure().function.function() }.arity as usize;
        if num_args != arity {
            self.runtime_error(&format!(
                "Expected {} arguments but got {}.",
                arity, num_args
            ));
            return false;
        }
        if self.frames.len() == FRAMES_MAX {
            self.runtime_error("Stack overflow.");
            return false;
        }
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            base: self.stack_top - num_args - 1,
        });
        true
    }

    /// Dispatch a resolved callable per the send protocol.
    pub(crate) fn call_value(&mut self, callee: Value, num_args: usize) -> bool {
        if let Value::Obj(r) = callee {
            // Safety: the callee was just resolved from a live slot.
            match unsafe { &r.as_ref().body } {
                ObjBody::Closure(_) => return self.push_frame(r, num_args),
                ObjBody::Native(n) => {
                    let function = n.function;
                    let base = self.stack_top - num_args - 1;
                    return function(self, base, num_args);
                }
                _ => {}
            }
        }
        self.runtime_error(&format!("'{}' is not callable.", callee));
        false
    }

    /// The INVOKE protocol: resolve `key` on the receiver and call it.
    /// Unresolved `getSlot`/`setSlot` sends fall back to the builtin slot
    /// protocol, which is how dot access works unless an object overrides
    /// those slots.
    fn invoke(&mut self, key: Value, num_args: usize) -> bool {
        let base = self.stack_top - num_args - 1;
        let receiver = self.stack[base];

        if let Some(callee) = self.get_slot_value(receiver, key) {
            return self.call_value(callee, num_args);
        }

        if key == self.cached.get_slot && num_args == 1 {
            let slot_key = self.stack[base + 1];
            return match self.get_slot_value(receiver, slot_key) {
                Some(value) => {
                    self.native_return(base, value);
                    true
                }
                None => {
                    self.runtime_error(&format!("Object has no slot '{}'.", slot_key));
                    false
                }
            };
        }

        if key == self.cached.set_slot && num_args == 2 {
            let slot_key = self.stack[base + 1];
            let value = self.stack[base + 2];
            // Safety: the receiver sits on the stack, a root.
            let target = receiver.as_obj().filter(|r| unsafe { r.is_object() });
            let Some(r) = target else {
                self.runtime_error("Can only set slots on an object.");
                return false;
            };
            let object = unsafe { r.object_mut() };
            object.slots.set(&mut self.heap, slot_key, value);
            self.native_return(base, value);
            return true;
        }

        self.runtime_error(&format!("Object has no slot '{}'.", key));
        false
    }

    // ------------------------------------------------------------------
    // Upvalues
    // ------------------------------------------------------------------

    /// Find or create the open upvalue for a stack slot, keeping the list
    /// sorted by descending slot.
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let mut prev: Option<ObjRef> = None;
        let mut current = self.open_upvalues;
        while let Some(u) = current {
            // Safety: open-list members are live roots.
            let (existing_slot, next) = match unsafe { &u.upvalue().state } {
                UpvalueState::Open { slot, next } => (*slot, *next),
                UpvalueState::Closed(_) => panic!("closed upvalue on open list"),
            };
            if existing_slot <= slot {
                if existing_slot == slot {
                    return u;
                }
                break;
            }
            prev = Some(u);
            current = next;
        }

        let created = memory::allocate(
            self,
            ObjBody::Upvalue(ObjUpvalue {
                state: UpvalueState::Open {
                    slot,
                    next: current,
                },
            }),
        );
        match prev {
            None => self.open_upvalues = Some(created),
            Some(p) => {
                // Safety: `p` is on the open list, a root.
                let previous = unsafe { p.upvalue_mut() };
                if let UpvalueState::Open { next, .. } = &mut previous.state {
                    *next = Some(created);
                }
            }
        }
        created
    }

    /// Close every open upvalue whose slot is at or above `from_slot`.
    fn close_upvalues(&mut self, from_slot: usize) {
        while let Some(u) = self.open_upvalues {
            // Safety: open-list members are live roots.
            let state = unsafe { &mut u.upvalue_mut().state };
            let (slot, next) = match *state {
                UpvalueState::Open { slot, next } => (slot, next),
                UpvalueState::Closed(_) => break,
            };
            if slot < from_slot {
                break;
            }
            *state = UpvalueState::Closed(self.stack[slot]);
            self.open_upvalues = next;
        }
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    #[inline]
    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("no active frame")
    }

    #[inline]
    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("no active frame")
    }

    #[inline]
    fn current_chunk(&self) -> &Chunk {
        // Safety: the current frame's closure is a GC root.
        unsafe { &self.frame().closure.closure().function.function().chunk }
    }

    #[inline]
    fn read_byte(&mut self) -> u8 {
        let ip = self.frame().ip;
        let byte = self.current_chunk().code[ip];
        self.frame_mut().ip = ip + 1;
        byte
    }

    #[inline]
    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte() as u16;
        let lo = self.read_byte() as u16;
        (hi << 8) | lo
    }

    #[inline]
    fn read_constant(&mut self) -> Value {
        let index = self.read_u16() as usize;
        self.current_chunk().constants[index]
    }

    fn run(&mut self) -> InterpretResult {
        loop {
            if tracing::enabled!(tracing::Level::TRACE) {
                let ip = self.frame().ip;
                let (text, _) = debug::disassemble_instruction(self.current_chunk(), ip);
                trace!(target: "sable::exec", depth = self.frames.len(), "{}", text);
            }

            let byte = self.read_byte();
            let Some(op) = OpCode::from_byte(byte) else {
                self.runtime_error("Unknown opcode.");
                return InterpretResult::RuntimeError;
            };

            match op {
                OpCode::Constant => {
                    let value = self.read_constant();
                    self.push(value);
                }
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::True => self.push(Value::True),
                OpCode::False => self.push(Value::False),
                OpCode::Nil => self.push(Value::Nil),
                OpCode::Eq => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::bool(a == b));
                }
                OpCode::Neq => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::bool(a != b));
                }
                OpCode::Not => {
                    let a = self.pop();
                    self.push(Value::bool(!a.truthy()));
                }
                OpCode::DefGlobal => {
                    let key = self.read_constant();
                    let value = self.peek(0);
                    self.globals.set(&mut self.heap, key, value);
                    self.pop();
                }
                OpCode::GetGlobal => {
                    let key = self.read_constant();
                    match self.globals.get(key) {
                        Some(value) => self.push(value),
                        None => {
                            self.runtime_error(&format!("Undefined variable '{}'.", key));
                            return InterpretResult::RuntimeError;
                        }
                    }
                }
                OpCode::SetGlobal => {
                    let key = self.read_constant();
                    let value = self.peek(0);
                    if self.globals.set(&mut self.heap, key, value) {
                        // No implicit creation: undo and report.
                        self.globals.delete(key);
                        self.runtime_error(&format!("Undefined variable '{}'.", key));
                        return InterpretResult::RuntimeError;
                    }
                }
                OpCode::Assert => {
                    let value = self.pop();
                    if !value.truthy() {
                        self.runtime_error("Assertion failed.");
                        return InterpretResult::RuntimeError;
                    }
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().base;
                    let value = self.stack[base + slot];
                    self.push(value);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().base;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetUpvalue => {
                    let index = self.read_byte() as usize;
                    let closure = self.frame().closure;
                    // Safety: the current closure is a root.
                    let upvalue = unsafe { closure.closure() }.upvalues[index];
                    let value = match unsafe { &upvalue.upvalue().state } {
                        UpvalueState::Open { slot, .. } => self.stack[*slot],
                        UpvalueState::Closed(value) => *value,
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let index = self.read_byte() as usize;
                    let value = self.peek(0);
                    let closure = self.frame().closure;
                    // Safety: the current closure is a root.
                    let upvalue = unsafe { closure.closure() }.upvalues[index];
                    match unsafe { &mut upvalue.upvalue_mut().state } {
                        UpvalueState::Open { slot, .. } => {
                            let slot = *slot;
                            self.stack[slot] = value;
                        }
                        UpvalueState::Closed(cell) => *cell = value,
                    }
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack_top - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::Jump => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip += offset;
                }
                OpCode::JumpIfTrue => {
                    let offset = self.read_u16() as usize;
                    if self.peek(0).truthy() {
                        self.frame_mut().ip += offset;
                    }
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16() as usize;
                    if !self.peek(0).truthy() {
                        self.frame_mut().ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip -= offset;
                }
                OpCode::Object => {
                    let proto = self.protos.object;
                    let object = memory::allocate(
                        self,
                        ObjBody::Object(ObjObject {
                            proto,
                            slots: Table::new(),
                        }),
                    );
                    self.push(Value::Obj(object));
                }
                OpCode::ObjectSet => {
                    let key = self.read_constant();
                    let value = self.peek(0);
                    let target = self.peek(1);
                    // Safety: the target sits on the stack, a root.
                    let object = target.as_obj().filter(|r| unsafe { r.is_object() });
                    let Some(r) = object else {
                        self.runtime_error("Can only set slots on an object.");
                        return InterpretResult::RuntimeError;
                    };
                    let target = unsafe { r.object_mut() };
                    target.slots.set(&mut self.heap, key, value);
                    self.pop();
                }
                OpCode::ObjLitSet => {
                    let value = self.peek(0);
                    let key = self.peek(1);
                    let target = self.peek(2);
                    // Safety: the target sits on the stack, a root.
                    let object = target.as_obj().filter(|r| unsafe { r.is_object() });
                    let Some(r) = object else {
                        self.runtime_error("Can only set slots on an object.");
                        return InterpretResult::RuntimeError;
                    };
                    let target = unsafe { r.object_mut() };
                    target.slots.set(&mut self.heap, key, value);
                    self.pop();
                    self.pop();
                }
                OpCode::Closure => {
                    let function = self
                        .read_constant()
                        .as_obj()
                        .expect("closure operand must be a function");
                    // Safety: the function is a constant of the running
                    // chunk, reachable through the current frame.
                    let count = unsafe { function.function() }.upvalue_count;
                    let closure = memory::allocate(
                        self,
                        ObjBody::Closure(ObjClosure {
                            function,
                            upvalues: Vec::with_capacity(count),
                        }),
                    );
                    self.push(Value::Obj(closure));
                    for _ in 0..count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        let upvalue = if is_local {
                            let base = self.frame().base;
                            self.capture_upvalue(base + index)
                        } else {
                            let enclosing = self.frame().closure;
                            let upvalues = unsafe { &enclosing.closure().upvalues };
                            upvalues[index]
                        };
                        let fill = unsafe { closure.closure_mut() };
                        fill.upvalues.push(upvalue);
                    }
                }
                OpCode::Invoke => {
                    let key = self.read_constant();
                    let num_args = self.read_byte() as usize;
                    if !self.invoke(key, num_args) {
                        return InterpretResult::RuntimeError;
                    }
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("no active frame");
                    self.close_upvalues(frame.base);
                    self.stack_top = frame.base;
                    self.push(result);
                    if self.frames.is_empty() {
                        return InterpretResult::Ok;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjFunction;

    /// Hand-assemble `chunk` into a zero-arity function, wrap it in a
    /// closure, and run it on a fresh frame.
    fn run_chunk(vm: &mut Vm, chunk: Chunk) -> InterpretResult {
        let function = memory::allocate(
            vm,
            ObjBody::Function(ObjFunction {
                arity: 0,
                upvalue_count: 0,
                name: None,
                chunk,
            }),
        );
        vm.push(Value::Obj(function));
        let closure = memory::allocate(
            vm,
            ObjBody::Closure(ObjClosure {
                function,
                upvalues: Vec::new(),
            }),
        );
        vm.pop();
        vm.push(Value::Obj(closure));
        assert!(vm.push_frame(closure, 0));
        vm.run()
    }

    fn constant(chunk: &mut Chunk, value: Value) -> u16 {
        chunk.add_constant(value) as u16
    }

    #[test]
    fn eq_neq_not_opcodes() {
        let mut vm = Vm::new();
        let mut chunk = Chunk::new();
        let one = constant(&mut chunk, Value::Number(1.0));
        let two = constant(&mut chunk, Value::Number(2.0));

        // 1 == 1, asserted; 1 != 2, asserted; !nil, asserted.
        chunk.write_op(OpCode::Constant, 1);
        chunk.write_u16(one, 1);
        chunk.write_op(OpCode::Constant, 1);
        chunk.write_u16(one, 1);
        chunk.write_op(OpCode::Eq, 1);
        chunk.write_op(OpCode::Assert, 1);

        chunk.write_op(OpCode::Constant, 2);
        chunk.write_u16(one, 2);
        chunk.write_op(OpCode::Constant, 2);
        chunk.write_u16(two, 2);
        chunk.write_op(OpCode::Neq, 2);
        chunk.write_op(OpCode::Assert, 2);

        chunk.write_op(OpCode::Nil, 3);
        chunk.write_op(OpCode::Not, 3);
        chunk.write_op(OpCode::Assert, 3);

        chunk.write_op(OpCode::Nil, 4);
        chunk.write_op(OpCode::Return, 4);

        assert_eq!(run_chunk(&mut vm, chunk), InterpretResult::Ok);
    }

    #[test]
    fn conditional_jumps_do_not_pop() {
        let mut vm = Vm::new();
        let mut chunk = Chunk::new();

        // TRUE; JUMP_IF_TRUE over a NIL;  the condition value must still be
        // on the stack for the ASSERT that follows.
        chunk.write_op(OpCode::True, 1);
        chunk.write_op(OpCode::JumpIfTrue, 1);
        chunk.write_u16(1, 1);
        chunk.write_op(OpCode::Nil, 1);
        chunk.write_op(OpCode::Assert, 1);

        chunk.write_op(OpCode::Nil, 2);
        chunk.write_op(OpCode::Return, 2);

        assert_eq!(run_chunk(&mut vm, chunk), InterpretResult::Ok);
    }

    #[test]
    fn assert_failure_is_runtime_error() {
        let mut vm = Vm::new();
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::False, 1);
        chunk.write_op(OpCode::Assert, 1);
        chunk.write_op(OpCode::Nil, 1);
        chunk.write_op(OpCode::Return, 1);
        assert_eq!(run_chunk(&mut vm, chunk), InterpretResult::RuntimeError);
    }

    #[test]
    fn prototype_of_scalars() {
        let vm = Vm::new();
        assert_eq!(vm.prototype_of(Value::Number(1.0)), vm.protos.number);
        assert_eq!(vm.prototype_of(Value::True), vm.protos.boolean);
        assert_eq!(vm.prototype_of(Value::False), vm.protos.boolean);
        assert_eq!(vm.prototype_of(Value::Nil), vm.protos.object);
        assert_eq!(vm.prototype_of(Value::Undefined), Value::Nil);
    }

    #[test]
    fn interned_strings_are_pointer_equal() {
        let mut vm = Vm::new();
        let a = vm.intern("hello");
        let b = vm.intern("hello");
        let c = vm.intern("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
