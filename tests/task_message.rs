//! End-to-end coverage for the message wire format (spec §5, §8's
//! pack-then-unpack round-trip law). `spawn`/`send`/`recv`/`join`
//! themselves are exercised in `src/task.rs`'s own `#[cfg(test)]`
//! module, which (unlike this file) can reach `TaskHandle::new()` to
//! give the test's own thread an inbox to receive into.

use vela::value::{VArray, VString, Value};
use vela::vm::Vm;

/// `send`/`recv` deliver a structurally-equal value across the task
/// boundary by packing and unpacking it, not by sharing a `Ref` into
/// the sender's heap (spec §5, §8's message round-trip law).
#[test]
fn pack_unpack_round_trip_preserves_structure() {
    let mut vm = Vm::new();
    let one = vm.alloc(vm.core.int, Value::Int(1));
    let two = vm.alloc(vm.core.int, Value::Int(2));
    let s = vm.alloc(vm.core.str_, Value::Str(VString::new(b"hi".to_vec())));
    let arr = vm.alloc(vm.core.array, Value::Array(VArray::with_items(vec![one, two, s])));

    let packed = vela::message::pack(&vm, arr).unwrap();
    let unpacked = vela::message::unpack(&mut vm, &packed).unwrap();

    match vm.heap.get(unpacked) {
        Value::Array(a) => {
            assert_eq!(a.items.len(), 3);
            assert!(matches!(vm.heap.get(a.items[0]), Value::Int(1)));
            assert!(matches!(vm.heap.get(a.items[1]), Value::Int(2)));
            assert!(matches!(vm.heap.get(a.items[2]), Value::Str(s) if s.data == b"hi"));
        }
        _ => panic!("expected an array"),
    }
}

/// A closure cannot be packed across a task boundary (spec §5 "what
/// may not be sent") -- a captured `Var` cell belongs to the sending
/// task's heap and has no meaning in the receiver's.
#[test]
fn packing_a_class_value_is_rejected() {
    let mut vm = Vm::new();
    let class_ref = vm.core.int;
    assert!(vela::message::pack(&vm, class_ref).is_err());
}
