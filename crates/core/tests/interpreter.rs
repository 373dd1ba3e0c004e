//! End-to-end interpreter scenarios: source in, observable effects out,
//! with `assert` statements carrying the expectations.

use sable_core::{InterpretResult, Value, Vm};

fn run(source: &str) -> InterpretResult {
    let mut vm = Vm::new();
    vm.interpret(source)
}

#[test]
fn operator_precedence_and_number_dispatch() {
    assert_eq!(run("let x = 1 + 2 * 3; assert x == 7;"), InterpretResult::Ok);
    assert_eq!(run("assert (1 + 2) * 3 == 9;"), InterpretResult::Ok);
    assert_eq!(run("assert 10 / 4 == 2.5;"), InterpretResult::Ok);
    assert_eq!(run("assert -3 + 5 == 2;"), InterpretResult::Ok);
    assert_eq!(
        run("assert 1 < 2 and 2 <= 2 and 3 > 2 and 3 >= 3;"),
        InterpretResult::Ok
    );
}

#[test]
fn string_concat_returns_an_interned_string() {
    assert_eq!(
        run("let s = \"foo\" + \"bar\"; assert s == \"foobar\";"),
        InterpretResult::Ok
    );
    // Pointer equality is string equality: concat twice, compare results.
    assert_eq!(
        run("let a = \"x\" + \"y\"; let b = \"x\" + \"y\"; assert a.same(a, b);"),
        InterpretResult::Ok
    );
}

#[test]
fn closures_capture_and_mutate_upvalues_across_returns() {
    let source = "
        let counter = fn() {
            let n = 0;
            fn() { n = n + 1; n }
        };
        let c = counter();
        assert c() == 1;
        assert c() == 2;
        assert c() == 3;
        let d = counter();
        assert d() == 1;
        assert c() == 4;
    ";
    assert_eq!(run(source), InterpretResult::Ok);
}

#[test]
fn object_literals_slot_sets_and_own_slot_predicates() {
    let source = "
        let o = { a: 1, b: 2 };
        o.c = 3;
        assert o.a + o.b + o.c == 6;
        assert o.hasOwnSlot(\"a\");
        assert !o.hasOwnSlot(\"d\");
        assert o.deleteSlot(\"a\");
        assert !o.hasOwnSlot(\"a\");
        assert !o.deleteSlot(\"a\");
    ";
    assert_eq!(run(source), InterpretResult::Ok);
}

#[test]
fn literal_keys_use_the_stack_keyed_form() {
    let source = "
        let o = { \"first\": 1, 2: \"second\" };
        assert o.hasOwnSlot(\"first\");
        assert o.rawGetSlot(\"first\") == 1;
    ";
    assert_eq!(run(source), InterpretResult::Ok);
}

#[test]
fn prototype_delegation_and_ancestry() {
    let source = "
        let p = { greet: fn() { \"hi\" } };
        let q = { };
        q.setProto(p);
        assert q.greet() == \"hi\";
        assert q.hasAncestor(p);
        assert q.hasAncestor(q);
        assert !p.hasAncestor(q);
    ";
    assert_eq!(run(source), InterpretResult::Ok);
}

#[test]
fn method_receiver_is_bound_to_this() {
    let source = "
        let p = { n: 41, bump: fn() { this.n = this.n + 1; this.n } };
        let q = { };
        q.setProto(p);
        q.n = 10;
        assert q.bump() == 11;
        assert p.n == 41;
    ";
    assert_eq!(run(source), InterpretResult::Ok);
}

#[test]
fn super_reaches_the_prototype() {
    let source = "
        let p = { label: \"parent\" };
        let q = { probe: fn() { super.label } };
        q.setProto(p);
        assert q.probe() == \"parent\";
    ";
    assert_eq!(run(source), InterpretResult::Ok);
}

#[test]
fn fn_call_with_this_rebinds_the_receiver() {
    let source = "
        let getter = fn() { this.v };
        let o = { v: 99 };
        assert getter.callWithThis(o) == 99;
    ";
    assert_eq!(run(source), InterpretResult::Ok);
}

#[test]
fn control_flow_and_logic_operators() {
    let source = "
        let n = 0;
        if true { n = 1; } else { n = 2; }
        assert n == 1;
        if false { n = 3; } else if nil { n = 4; } else { n = 5; }
        assert n == 5;
        assert (false or \"x\") == \"x\";
        assert (nil and 1) == nil;
    ";
    assert_eq!(run(source), InterpretResult::Ok);
}

#[test]
fn while_loops_terminate_and_accumulate() {
    let source = "
        let i = 0;
        let total = 0;
        while i < 10 {
            total = total + i;
            i = i + 1;
        }
        assert total == 45;
    ";
    assert_eq!(run(source), InterpretResult::Ok);
}

/// A linked list of 100000 objects, each holding only its predecessor via
/// a slot. Live-through-slots objects must survive the collections this
/// provokes, and the chain length proves none were lost.
#[test]
fn allocation_stress_keeps_slot_reachable_objects_alive() {
    let source = "
        let head = nil;
        let i = 0;
        while i < 100000 {
            let node = { };
            node.prev = head;
            head = node;
            i = i + 1;
        }
        let n = 0;
        let cur = head;
        while cur != nil {
            n = n + 1;
            cur = cur.prev;
        }
        assert n == 100000;
    ";
    let mut vm = Vm::new();
    assert_eq!(vm.interpret(source), InterpretResult::Ok);
}

#[test]
fn globals_persist_across_interpret_calls() {
    let mut vm = Vm::new();
    assert_eq!(vm.interpret("let x = 41;"), InterpretResult::Ok);
    assert_eq!(vm.interpret("x = x + 1;"), InterpretResult::Ok);
    assert_eq!(vm.interpret("assert x == 42;"), InterpretResult::Ok);
    assert_eq!(vm.get_global("x"), Some(Value::Number(42.0)));
}

// ----------------------------------------------------------------------
// Runtime errors: all end in RuntimeError with the stacks reset.
// ----------------------------------------------------------------------

#[test]
fn undefined_global_is_a_runtime_error() {
    assert_eq!(run("undefined_var;"), InterpretResult::RuntimeError);
    assert_eq!(run("undefined_var = 1;"), InterpretResult::RuntimeError);
}

#[test]
fn missing_slot_on_a_number_is_a_runtime_error() {
    assert_eq!(run("(1).foo();"), InterpretResult::RuntimeError);
}

#[test]
fn adding_a_string_to_a_number_is_a_runtime_error() {
    assert_eq!(run("1 + \"x\";"), InterpretResult::RuntimeError);
}

#[test]
fn failed_assertion_is_a_runtime_error() {
    assert_eq!(run("assert false;"), InterpretResult::RuntimeError);
}

#[test]
fn arity_mismatch_is_a_runtime_error() {
    assert_eq!(
        run("let f = fn(a, b) { a + b }; f(1);"),
        InterpretResult::RuntimeError
    );
}

#[test]
fn calling_a_non_callable_is_a_runtime_error() {
    assert_eq!(
        run("let o = { x: 1 }; o.x();"),
        InterpretResult::RuntimeError
    );
}

#[test]
fn unbounded_recursion_overflows_the_frame_stack() {
    assert_eq!(
        run("let f = fn() { f() }; f();"),
        InterpretResult::RuntimeError
    );
}

#[test]
fn cyclic_prototype_chains_do_not_hang_lookups() {
    let mut vm = Vm::new();
    assert_eq!(
        vm.interpret("let a = { }; let b = { }; a.setProto(b); b.setProto(a);"),
        InterpretResult::Ok
    );
    // A send on the cyclic chain misses within the chain bound.
    assert_eq!(vm.interpret("a.missing;"), InterpretResult::RuntimeError);

    // Ancestry queries use the visited bit and terminate cleanly.
    let a = vm.get_global("a").unwrap();
    let b = vm.get_global("b").unwrap();
    assert!(vm.has_ancestor(a, b));
    assert!(vm.has_ancestor(a, a));
    assert!(!vm.has_ancestor(a, Value::Number(1.0)));
}

#[test]
fn vm_stays_usable_after_a_runtime_error() {
    let mut vm = Vm::new();
    assert_eq!(vm.interpret("assert false;"), InterpretResult::RuntimeError);
    assert_eq!(vm.interpret("assert true;"), InterpretResult::Ok);
    assert_eq!(vm.interpret("let x = 1; assert x == 1;"), InterpretResult::Ok);
}
