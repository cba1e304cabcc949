//! The universal value representation (spec §3.1, §3.3).
//!
//! Every runtime value is a `Ref`: an opaque handle into the owning task's
//! GC heap. The handle never changes meaning across a collection -- the
//! mark-sweep collector in `gc.rs` never moves cells, so `Ref` is simply a
//! stable index plus a generation-free identity (cells are never reused
//! while referenced, since a reference is either a root or reachable from
//! one).
//!
//! `Value` is the tagged union backing every concrete class (spec §9
//! "Heterogeneous value payload": "model as a tagged union over the
//! built-in kinds plus a boxed instance variant"). Class metaobjects are
//! one variant of the same sum, closing the reflexive loop required by
//! spec §3.1's invariant.

use std::collections::HashMap;

use smallvec::SmallVec;

use crate::class::{ClassObj, MethodObj};

/// A handle to a heap-allocated object. Two refs are the same object iff
/// their indices are equal -- there is no separate generation counter
/// because cells are only recycled once provably unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ref(pub u32);

impl Ref {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for Ref {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Growable byte-string payload backing the `str` concrete class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VString {
    pub data: Vec<u8>,
}

impl VString {
    pub fn new(s: impl Into<Vec<u8>>) -> Self {
        VString { data: s.into() }
    }

    pub fn as_str_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }
}

/// Growable sequence of refs backing the `array` concrete class. Capacity
/// management mirrors spec §3.3: initial capacity 10, grow factor 1.8,
/// rather than relying on `Vec`'s own (unspecified) growth policy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VArray {
    pub items: Vec<Ref>,
}

pub const ARRAY_INITIAL_CAPACITY: usize = 10;
pub const ARRAY_GROWTH_FACTOR: f64 = 1.8;

impl VArray {
    pub fn new() -> Self {
        VArray { items: Vec::with_capacity(ARRAY_INITIAL_CAPACITY) }
    }

    pub fn with_items(items: Vec<Ref>) -> Self {
        VArray { items }
    }

    /// Reserve capacity following spec §3.3's growth factor, so that
    /// `capacity()` observably grows 10 -> 18 -> 32 -> ... rather than
    /// whatever `Vec::push`'s doubling would give.
    pub fn push(&mut self, item: Ref) {
        if self.items.len() == self.items.capacity() {
            let next = ((self.items.capacity().max(1) as f64) * ARRAY_GROWTH_FACTOR).ceil() as usize;
            self.items.reserve_exact(next.max(ARRAY_INITIAL_CAPACITY) - self.items.len());
        }
        self.items.push(item);
    }

    pub fn pop(&mut self) -> Option<Ref> {
        self.items.pop()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Insertion-ordered key/value sequence backing the `hash` concrete class.
/// Lookup is a linear scan, as spec §3.3 specifies, rather than a real
/// hash table -- equality is value equality (via the `cmp` operator
/// protocol), which a `HashMap` can't express directly without wrapping
/// keys, so the spec's own "ordered sequence, linear scan" design is kept
/// verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VHash {
    pub pairs: Vec<(Ref, Ref)>,
}

impl VHash {
    pub fn new() -> Self {
        VHash::default()
    }
}

/// Heap-visible mirror of an activation record (spec §3.3 lists `frame`
/// among the concrete leaf classes). No opcode in spec §4.3's table
/// creates one -- the VM's hot-path call frames live in `frame::Frame`,
/// off the GC heap, for the same reason the design notes (§9) prefer
/// precise roots over conservative scanning: frames are never first-class
/// values in this instruction set. This variant exists so the data model
/// is complete and introspection hooks have somewhere to land, per
/// DESIGN.md's Open Question on this point.
#[derive(Debug, Clone)]
pub struct FrameObj {
    pub method: Ref,
    pub pc: usize,
}

/// A one-slot mutable cell (spec GLOSSARY "var cell"). Local bindings are
/// always stored through a `Var`, not directly as a raw value, so that
/// `MAKECLOSURE` can capture the cell itself and have the closure's future
/// `STORENAME`s observed by the enclosing frame (spec §4.4).
#[derive(Debug, Clone, Copy)]
pub struct VarObj {
    pub value: Ref,
}

/// A loaded module: a name plus its locals hash (spec §3.3).
#[derive(Debug, Clone)]
pub struct ModuleObj {
    pub name: String,
    pub locals: HashMap<String, Ref>,
}

/// An instance of a language-level (or builtin) class: the field map.
/// The class pointer itself lives on the owning `Cell`, not here, per the
/// spec §3.1 invariant that every ref carries a class pointer uniformly.
#[derive(Debug, Clone, Default)]
pub struct InstanceObj {
    pub fields: HashMap<String, Ref>,
}

/// Non-local and local task handles share a representation distinguished
/// by the `local` flag (spec §4.5 "Task handle").
#[derive(Debug, Clone)]
pub struct TaskHandleObj {
    pub internal: crate::task::TaskHandle,
    pub local: bool,
}

/// The tagged union every `Ref` ultimately resolves to.
#[derive(Debug, Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(VString),
    Array(VArray),
    Hash(VHash),
    Class(ClassObj),
    Method(MethodObj),
    Module(ModuleObj),
    Frame(FrameObj),
    Var(VarObj),
    Instance(InstanceObj),
    Task(TaskHandleObj),
}

impl Value {
    /// Enumerate the refs directly owned by this value, for GC marking.
    /// This realizes the spec's per-class `mark` slot (§3.2, §4.2): since
    /// `Value` is a closed enum rather than a trait-object hierarchy, a
    /// match arm per variant *is* the vtable (spec §9 design note: "a
    /// trait/interface with a fixed set of methods is the natural
    /// mapping... inheriting copies the vtable" -- here every concrete
    /// class's "vtable entry" is simply its match arm, and `Instance`
    /// inherits nothing to override because field layout, not dispatch,
    /// is what varies between instances of different classes).
    pub fn mark_children(&self) -> SmallVec<[Ref; 4]> {
        let mut out = SmallVec::new();
        match self {
            Value::Nil | Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::Str(_) => {}
            Value::Array(a) => out.extend(a.items.iter().copied()),
            Value::Hash(h) => {
                for (k, v) in &h.pairs {
                    out.push(*k);
                    out.push(*v);
                }
            }
            Value::Class(c) => {
                out.push(c.name);
                if let Some(s) = c.super_ {
                    out.push(s);
                }
                out.extend(c.methods.values().copied());
            }
            Value::Method(m) => {
                if let Some(s) = m.bound_self {
                    out.push(s);
                }
                // `code` is an `Arc<CodeObject>` holding no task-local
                // refs (see class.rs), and `module` is resolved by name,
                // so only a closure's captured bindings need tracing.
                if let crate::class::MethodKind::Closure { bindings, .. } = &m.kind {
                    out.extend(bindings.values().copied());
                }
            }
            Value::Module(m) => out.extend(m.locals.values().copied()),
            Value::Frame(f) => out.push(f.method),
            Value::Var(v) => out.push(v.value),
            Value::Instance(i) => out.extend(i.fields.values().copied()),
            Value::Task(_) => {}
        }
        out
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Array(_) => "array",
            Value::Hash(_) => "hash",
            Value::Class(_) => "class",
            Value::Method(_) => "method",
            Value::Module(_) => "module",
            Value::Frame(_) => "frame",
            Value::Var(_) => "var",
            Value::Instance(_) => "instance",
            Value::Task(_) => "task",
        }
    }
}
