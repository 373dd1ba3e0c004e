//! Collector behavior: reachability, the weak intern table, the temporary
//! root register, and whole-program runs under allocation stress.

use sable_core::{GcConfig, InterpretResult, Vm};

fn stress_vm() -> Vm {
    Vm::with_config(GcConfig {
        stress: true,
        ..GcConfig::default()
    })
}

#[test]
fn collection_is_idempotent_on_a_quiet_heap() {
    let mut vm = Vm::new();
    vm.collect();
    let count = vm.object_count();
    let bytes = vm.bytes_allocated();
    vm.collect();
    assert_eq!(vm.object_count(), count);
    assert_eq!(vm.bytes_allocated(), bytes);
}

#[test]
fn unreferenced_strings_are_swept_from_the_intern_table() {
    let mut vm = Vm::new();
    vm.collect();
    let baseline = vm.object_count();

    // Interned but never rooted anywhere.
    vm.intern("ephemeral-string-nobody-holds");
    assert_eq!(vm.object_count(), baseline + 1);

    vm.collect();
    assert_eq!(vm.object_count(), baseline);
}

#[test]
fn rooted_strings_survive_and_stay_canonical() {
    let mut vm = Vm::new();
    let s = vm.intern("durable");
    vm.push_root(s);
    vm.collect();
    // Still the interned instance: a fresh lookup returns the same object.
    let again = vm.intern("durable");
    assert_eq!(again, s);
    vm.pop_root();
}

#[test]
fn push_root_protects_values_across_allocations() {
    let mut vm = stress_vm();
    let keep = vm.intern("keep-me-alive");
    vm.push_root(keep);
    // Every one of these interns collects first (stress mode), so a
    // missing root would free "keep-me-alive" long before the loop ends.
    for i in 0..64 {
        vm.intern(&format!("garbage-{}", i));
    }
    vm.pop_root();
    let again = vm.intern("keep-me-alive");
    assert_eq!(again, keep);
}

#[test]
fn globals_keep_object_graphs_alive_across_collections() {
    let mut vm = Vm::new();
    assert_eq!(
        vm.interpret("let o = { a: 1, inner: { b: 2 } };"),
        InterpretResult::Ok
    );
    vm.collect();
    vm.collect();
    assert_eq!(
        vm.interpret("assert o.a == 1; assert o.inner.b == 2;"),
        InterpretResult::Ok
    );
}

#[test]
fn garbage_object_graphs_are_reclaimed() {
    let mut vm = Vm::new();
    vm.collect();
    let baseline = vm.bytes_allocated();

    // Build a large transient structure, then drop the only reference.
    assert_eq!(
        vm.interpret(
            "
            let head = nil;
            let i = 0;
            while i < 1000 {
                let node = { };
                node.prev = head;
                head = node;
                i = i + 1;
            }
            head = nil;
            "
        ),
        InterpretResult::Ok
    );
    vm.collect();
    // Everything but a couple of interned identifier strings is gone.
    assert!(vm.bytes_allocated() < baseline + 4096);
}

/// The full closure scenario with a collection before every allocation:
/// any value the compiler or interpreter fails to root gets freed out
/// from under it immediately.
#[test]
fn closures_survive_stress_collection() {
    let mut vm = stress_vm();
    let source = "
        let counter = fn() {
            let n = 0;
            fn() { n = n + 1; n }
        };
        let c = counter();
        assert c() == 1;
        assert c() == 2;
        assert c() == 3;
    ";
    assert_eq!(vm.interpret(source), InterpretResult::Ok);
}

#[test]
fn object_literals_and_sends_survive_stress_collection() {
    let mut vm = stress_vm();
    let source = "
        let p = { greet: fn() { \"hi\" + \"!\" } };
        let q = { };
        q.setProto(p);
        assert q.greet() == \"hi!\";
    ";
    assert_eq!(vm.interpret(source), InterpretResult::Ok);
}

#[test]
fn bytes_accounting_returns_to_baseline_after_interpret() {
    let mut vm = Vm::new();
    vm.collect();
    let baseline = vm.object_count();
    assert_eq!(
        vm.interpret("let t = { x: 1 }; t = nil;"),
        InterpretResult::Ok
    );
    vm.collect();
    // The object died; only interned identifier strings ("t", "x") and
    // nothing else may remain beyond the baseline.
    assert!(vm.object_count() <= baseline + 2);
}
