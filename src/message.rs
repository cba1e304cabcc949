//! Inter-task message wire format (spec §5, §6.2). Grounded on
//! `original_source/libnim/msg.c`'s two-pass size-then-encode packer,
//! reinterpreted for a Rust runtime where each task owns an independent
//! `Heap`: a `Ref` from one task's heap is meaningless in another's, so
//! packing produces an owned, heap-independent `Packed` value rather
//! than a byte buffer, and unpacking rebuilds real `Ref`s in the
//! receiving task's own heap.
//!
//! NIL/BOOL/INT/FLOAT/STR/ARRAY/HASH are copied by value, recursively.
//! MODULE and (non-closure) METHOD values are the spec's "shared rather
//! than copied" exception, realized as content-addressed identity (a
//! module name, or a code object shared via `Arc`) rather than a pointer
//! -- see `class.rs`'s `MethodKind` doc. TASK values carry their handle
//! across with an `Arc` clone (a refcount bump, matching the source's
//! task refcounting). Closures, classes, instances, and frames cannot
//! cross a task boundary (spec §5 "what may not be sent").

use crate::class::MethodObj;
use crate::code::CodeObject;
use crate::error::RuntimeError;
use crate::task::TaskHandle;
use crate::value::{Ref, VArray, VHash, VString, Value};
use crate::vm::Vm;
use std::sync::Arc;

#[derive(Clone)]
pub enum Packed {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Vec<u8>),
    Array(Vec<Packed>),
    Hash(Vec<(Packed, Packed)>),
    Module(String),
    Method { code: Arc<CodeObject>, module: String },
    Task(TaskHandle),
}

pub fn pack(vm: &Vm, r: Ref) -> Result<Packed, RuntimeError> {
    match vm.heap.get(r) {
        Value::Nil => Ok(Packed::Nil),
        Value::Bool(b) => Ok(Packed::Bool(*b)),
        Value::Int(i) => Ok(Packed::Int(*i)),
        Value::Float(f) => Ok(Packed::Float(*f)),
        Value::Str(s) => Ok(Packed::Str(s.data.clone())),
        Value::Array(a) => {
            let items = a.items.clone();
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(pack(vm, item)?);
            }
            Ok(Packed::Array(out))
        }
        Value::Hash(h) => {
            let pairs = h.pairs.clone();
            let mut out = Vec::with_capacity(pairs.len());
            for (k, v) in pairs {
                out.push((pack(vm, k)?, pack(vm, v)?));
            }
            Ok(Packed::Hash(out))
        }
        Value::Module(m) => Ok(Packed::Module(m.name.clone())),
        Value::Method(m) => match &m.kind {
            crate::class::MethodKind::Closure { .. } => {
                Err(RuntimeError::new("a closure cannot be sent across a task boundary"))
            }
            crate::class::MethodKind::Bytecode { code, module } => {
                Ok(Packed::Method { code: code.clone(), module: module.clone() })
            }
            crate::class::MethodKind::Native(_) => {
                Err(RuntimeError::new("a native method cannot be sent across a task boundary"))
            }
        },
        Value::Task(t) => Ok(Packed::Task(t.internal.clone())),
        Value::Class(_) | Value::Instance(_) | Value::Frame(_) | Value::Var(_) => {
            Err(RuntimeError::new(format!("a {} value cannot be sent across a task boundary", vm.heap.get(r).type_name())))
        }
    }
}

pub fn unpack(vm: &mut Vm, p: &Packed) -> Result<Ref, RuntimeError> {
    match p {
        Packed::Nil => Ok(vm.nil_ref),
        Packed::Bool(b) => Ok(vm.bool_ref(*b)),
        Packed::Int(i) => Ok(vm.alloc(vm.core.int, Value::Int(*i))),
        Packed::Float(f) => Ok(vm.alloc(vm.core.float, Value::Float(*f))),
        Packed::Str(bytes) => Ok(vm.alloc(vm.core.str_, Value::Str(VString::new(bytes.clone())))),
        Packed::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(unpack(vm, item)?);
            }
            Ok(vm.alloc(vm.core.array, Value::Array(VArray::with_items(out))))
        }
        Packed::Hash(pairs) => {
            let mut out = Vec::with_capacity(pairs.len());
            for (k, v) in pairs {
                out.push((unpack(vm, k)?, unpack(vm, v)?));
            }
            Ok(vm.alloc(vm.core.hash, Value::Hash(VHash { pairs: out })))
        }
        Packed::Module(name) => vm
            .modules
            .get(name)
            .copied()
            .ok_or_else(|| RuntimeError::new(format!("module '{name}' is not loaded in the receiving task"))),
        Packed::Method { code, module } => {
            Ok(vm.alloc(vm.core.method, Value::Method(MethodObj::bytecode(code.clone(), module.clone()))))
        }
        Packed::Task(handle) => {
            Ok(vm.alloc(vm.core.task, Value::Task(crate::value::TaskHandleObj { internal: handle.clone(), local: false })))
        }
    }
}
