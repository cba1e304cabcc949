//! Named native methods on `array` and `hash` (SPEC_FULL.md §C, grounded
//! on `original_source/libnim/array.c` and `hash.c`): `push`/`pop`/
//! `size`/`remove_at`/`map` for arrays, `get`/`set`/`size`/`keys` for
//! hashes. These are ordinary methods in each class's method table, not
//! operator slots -- reached through the same `GETATTR`-then-`CALL` path
//! as a user-defined method (spec §4.1).

use crate::class::MethodObj;
use crate::error::RuntimeError;
use crate::value::{Ref, VArray, VHash, Value};
use crate::vm::{CoreClasses, Vm};

fn wrap_index(len: i64, idx: i64) -> Option<i64> {
    let real = if idx < 0 { len + idx } else { idx };
    if real < 0 || real >= len {
        None
    } else {
        Some(real)
    }
}

fn array_push(vm: &mut Vm, self_: Ref, args: &[Ref]) -> Result<Ref, RuntimeError> {
    let item = *args.first().ok_or_else(|| RuntimeError::new("push expects one argument"))?;
    match vm.heap.get_mut(self_) {
        Value::Array(a) => a.push(item),
        _ => return Err(RuntimeError::new("expected an array")),
    }
    Ok(vm.nil_ref)
}

fn array_pop(vm: &mut Vm, self_: Ref, _args: &[Ref]) -> Result<Ref, RuntimeError> {
    let popped = match vm.heap.get_mut(self_) {
        Value::Array(a) => a.pop(),
        _ => return Err(RuntimeError::new("expected an array")),
    };
    Ok(popped.unwrap_or(vm.nil_ref))
}

fn array_size(vm: &mut Vm, self_: Ref, _args: &[Ref]) -> Result<Ref, RuntimeError> {
    let len = match vm.heap.get(self_) {
        Value::Array(a) => a.len(),
        _ => return Err(RuntimeError::new("expected an array")),
    };
    Ok(vm.alloc(vm.core.int, Value::Int(len as i64)))
}

/// Negative indices wrap from the end (spec §8), matching `getitem`'s
/// indexing so the two agree.
fn array_remove_at(vm: &mut Vm, self_: Ref, args: &[Ref]) -> Result<Ref, RuntimeError> {
    let idx = match args.first().map(|r| vm.heap.get(*r)) {
        Some(Value::Int(i)) => *i,
        _ => return Err(RuntimeError::new("remove_at expects an int index")),
    };
    let (items_len, removed) = match vm.heap.get_mut(self_) {
        Value::Array(a) => {
            let len = a.items.len() as i64;
            match wrap_index(len, idx) {
                Some(real) => (len, Some(a.items.remove(real as usize))),
                None => (len, None),
            }
        }
        _ => return Err(RuntimeError::new("expected an array")),
    };
    removed.ok_or_else(|| RuntimeError::new(format!("remove_at index {idx} out of range for length {items_len}")))
}

fn array_map(vm: &mut Vm, self_: Ref, args: &[Ref]) -> Result<Ref, RuntimeError> {
    let f = *args.first().ok_or_else(|| RuntimeError::new("map expects one argument"))?;
    let items = match vm.heap.get(self_) {
        Value::Array(a) => a.items.clone(),
        _ => return Err(RuntimeError::new("expected an array")),
    };
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        out.push(vm.call_value(f, &[item])?);
    }
    Ok(vm.alloc(vm.core.array, Value::Array(VArray::with_items(out))))
}

fn values_equal(vm: &mut Vm, a: Ref, b: Ref) -> Result<bool, RuntimeError> {
    let class = vm.heap.class_of(a);
    let slot = match vm.heap.get(class) {
        Value::Class(c) => c.slots.cmp,
        _ => None,
    };
    match slot {
        Some(f) => Ok(f(vm, a, b)? == crate::class::CmpResult::Equal),
        None => Ok(false),
    }
}

fn hash_get(vm: &mut Vm, self_: Ref, args: &[Ref]) -> Result<Ref, RuntimeError> {
    let key = *args.first().ok_or_else(|| RuntimeError::new("get expects one argument"))?;
    let pairs = match vm.heap.get(self_) {
        Value::Hash(h) => h.pairs.clone(),
        _ => return Err(RuntimeError::new("expected a hash")),
    };
    for (k, v) in pairs {
        if values_equal(vm, k, key)? {
            return Ok(v);
        }
    }
    Ok(vm.nil_ref)
}

fn hash_set(vm: &mut Vm, self_: Ref, args: &[Ref]) -> Result<Ref, RuntimeError> {
    let key = *args.first().ok_or_else(|| RuntimeError::new("set expects a key and a value"))?;
    let value = *args.get(1).ok_or_else(|| RuntimeError::new("set expects a key and a value"))?;
    let pairs = match vm.heap.get(self_) {
        Value::Hash(h) => h.pairs.clone(),
        _ => return Err(RuntimeError::new("expected a hash")),
    };
    let mut replaced = false;
    let mut new_pairs = Vec::with_capacity(pairs.len() + 1);
    for (k, v) in pairs {
        if !replaced && values_equal(vm, k, key)? {
            new_pairs.push((k, value));
            replaced = true;
        } else {
            new_pairs.push((k, v));
        }
    }
    if !replaced {
        new_pairs.push((key, value));
    }
    if let Value::Hash(h) = vm.heap.get_mut(self_) {
        h.pairs = new_pairs;
    }
    Ok(vm.nil_ref)
}

fn hash_size(vm: &mut Vm, self_: Ref, _args: &[Ref]) -> Result<Ref, RuntimeError> {
    let len = match vm.heap.get(self_) {
        Value::Hash(h) => h.pairs.len(),
        _ => return Err(RuntimeError::new("expected a hash")),
    };
    Ok(vm.alloc(vm.core.int, Value::Int(len as i64)))
}

fn hash_keys(vm: &mut Vm, self_: Ref, _args: &[Ref]) -> Result<Ref, RuntimeError> {
    let keys = match vm.heap.get(self_) {
        Value::Hash(h) => h.pairs.iter().map(|(k, _)| *k).collect(),
        _ => return Err(RuntimeError::new("expected a hash")),
    };
    Ok(vm.alloc(vm.core.array, Value::Array(VArray::with_items(keys))))
}

pub fn install(heap: &mut crate::gc::Heap, core: &CoreClasses) {
    let mut add = |class: Ref, name: &str, f: crate::class::NativeFn| {
        let m = heap.alloc(core.method, Value::Method(MethodObj::native(f)), &[]);
        if let Value::Class(c) = heap.get_mut(class) {
            c.methods.insert(name.to_string(), m);
        }
    };
    add(core.array, "push", array_push);
    add(core.array, "pop", array_pop);
    add(core.array, "size", array_size);
    add(core.array, "remove_at", array_remove_at);
    add(core.array, "map", array_map);
    add(core.hash, "get", hash_get);
    add(core.hash, "set", hash_set);
    add(core.hash, "size", hash_size);
    add(core.hash, "keys", hash_keys);
}
