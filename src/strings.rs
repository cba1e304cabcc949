//! Named native methods on `str` (SPEC_FULL.md §C): `split`/`join`,
//! grounded on `original_source/libnim/str.c`'s byte-oriented string
//! helpers. `split(sep)` and `sep.join(pieces)` are inverse operations
//! (spec §8's round-trip law: `sep.join(s.split(sep)) == s` whenever `s`
//! contains no leading/trailing empty pieces ambiguity).

use crate::class::MethodObj;
use crate::error::RuntimeError;
use crate::value::{Ref, VArray, VString, Value};
use crate::vm::{CoreClasses, Vm};

fn bytes_of(vm: &Vm, r: Ref) -> Result<Vec<u8>, RuntimeError> {
    match vm.heap.get(r) {
        Value::Str(s) => Ok(s.data.clone()),
        _ => Err(RuntimeError::new("expected a str")),
    }
}

fn str_split(vm: &mut Vm, self_: Ref, args: &[Ref]) -> Result<Ref, RuntimeError> {
    let haystack = bytes_of(vm, self_)?;
    let sep = bytes_of(vm, *args.first().ok_or_else(|| RuntimeError::new("split expects one argument"))?)?;
    let pieces: Vec<Vec<u8>> = if sep.is_empty() { vec![haystack] } else { split_bytes(&haystack, &sep) };
    let mut items = Vec::with_capacity(pieces.len());
    for piece in pieces {
        items.push(vm.alloc(vm.core.str_, Value::Str(VString::new(piece))));
    }
    Ok(vm.alloc(vm.core.array, Value::Array(VArray::with_items(items))))
}

fn split_bytes(haystack: &[u8], sep: &[u8]) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let mut start = 0usize;
    let mut i = 0usize;
    while i + sep.len() <= haystack.len() {
        if &haystack[i..i + sep.len()] == sep {
            out.push(haystack[start..i].to_vec());
            i += sep.len();
            start = i;
        } else {
            i += 1;
        }
    }
    out.push(haystack[start..].to_vec());
    out
}

fn str_join(vm: &mut Vm, self_: Ref, args: &[Ref]) -> Result<Ref, RuntimeError> {
    let sep = bytes_of(vm, self_)?;
    let pieces_ref = *args.first().ok_or_else(|| RuntimeError::new("join expects one argument"))?;
    let items = match vm.heap.get(pieces_ref) {
        Value::Array(a) => a.items.clone(),
        _ => return Err(RuntimeError::new("join expects an array of str")),
    };
    let mut out = Vec::new();
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.extend_from_slice(&sep);
        }
        out.extend(bytes_of(vm, *item)?);
    }
    Ok(vm.alloc(vm.core.str_, Value::Str(VString::new(out))))
}

fn str_size(vm: &mut Vm, self_: Ref, _args: &[Ref]) -> Result<Ref, RuntimeError> {
    let len = bytes_of(vm, self_)?.len();
    Ok(vm.alloc(vm.core.int, Value::Int(len as i64)))
}

pub fn install(heap: &mut crate::gc::Heap, core: &CoreClasses) {
    let mut add = |name: &str, f: crate::class::NativeFn| {
        let m = heap.alloc(core.method, Value::Method(MethodObj::native(f)), &[]);
        if let Value::Class(c) = heap.get_mut(core.str_) {
            c.methods.insert(name.to_string(), m);
        }
    };
    add("split", str_split);
    add("join", str_join);
    add("size", str_size);
}
