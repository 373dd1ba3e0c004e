//! Randomized hash-table property tests: long set/delete/get sequences
//! checked against a model map, with the structural invariants asserted
//! after every operation.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use sable_core::memory::{GcConfig, Heap};
use sable_core::{Table, Value};

fn check_invariants(table: &Table, model: &HashMap<u64, f64>) {
    // `valid` tracks live keys exactly; tombstones only ever inflate
    // `count`.
    assert_eq!(table.len(), model.len());
    assert!(table.count() >= table.len());

    let capacity = table.capacity();
    if capacity == 0 {
        assert_eq!(table.count(), 0);
    } else {
        assert!(capacity.is_power_of_two() && capacity >= 8);
        assert!(table.count() * 4 <= capacity * 3);
    }
}

#[test]
fn randomized_sequences_match_a_model_map() {
    for seed in 0..6u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut heap = Heap::new(GcConfig::default());
        let mut table = Table::new();
        let mut model: HashMap<u64, f64> = HashMap::new();

        for step in 0..4000u32 {
            let raw_key = rng.gen_range(0..256u64);
            let key = Value::Number(raw_key as f64);
            match rng.gen_range(0..10u32) {
                0..=5 => {
                    let value = f64::from(step);
                    let was_new = table.set(&mut heap, key, Value::Number(value));
                    assert_eq!(was_new, !model.contains_key(&raw_key));
                    model.insert(raw_key, value);
                }
                6..=7 => {
                    let existed = table.delete(key);
                    assert_eq!(existed, model.remove(&raw_key).is_some());
                }
                _ => {
                    let expected = model.get(&raw_key).map(|&v| Value::Number(v));
                    assert_eq!(table.get(key), expected);
                }
            }
            check_invariants(&table, &model);
        }

        for (&raw_key, &value) in &model {
            assert_eq!(
                table.get(Value::Number(raw_key as f64)),
                Some(Value::Number(value))
            );
        }
    }
}

#[test]
fn deleted_keys_stay_deleted_until_reinserted() {
    let mut heap = Heap::new(GcConfig::default());
    let mut table = Table::new();
    for i in 0..64 {
        table.set(&mut heap, Value::Number(i as f64), Value::True);
    }
    for i in 0..64 {
        assert!(table.delete(Value::Number(i as f64)));
        assert_eq!(table.get(Value::Number(i as f64)), None);
    }
    for i in 0..64 {
        assert!(table.set(&mut heap, Value::Number(i as f64), Value::False));
        assert_eq!(table.get(Value::Number(i as f64)), Some(Value::False));
    }
}

#[test]
fn insertion_order_does_not_affect_lookups_after_growth() {
    let mut heap = Heap::new(GcConfig::default());
    let mut forward = Table::new();
    let mut backward = Table::new();
    for i in 0..300 {
        forward.set(&mut heap, Value::Number(i as f64), Value::Number(i as f64));
    }
    for i in (0..300).rev() {
        backward.set(&mut heap, Value::Number(i as f64), Value::Number(i as f64));
    }
    for i in 0..300 {
        let key = Value::Number(i as f64);
        assert_eq!(forward.get(key), backward.get(key));
    }
    assert_eq!(forward.len(), backward.len());
}

#[test]
fn singleton_keys_are_distinct() {
    let mut heap = Heap::new(GcConfig::default());
    let mut table = Table::new();
    table.set(&mut heap, Value::Nil, Value::Number(1.0));
    table.set(&mut heap, Value::True, Value::Number(2.0));
    table.set(&mut heap, Value::False, Value::Number(3.0));
    assert_eq!(table.get(Value::Nil), Some(Value::Number(1.0)));
    assert_eq!(table.get(Value::True), Some(Value::Number(2.0)));
    assert_eq!(table.get(Value::False), Some(Value::Number(3.0)));
    assert_eq!(table.len(), 3);
}
