//! Class metaobjects, method kinds, and the operation-slot protocol
//! (spec §3.2, §4.1). Grounded on `original_source/libnim/class.c`
//! (`nim_class_new`'s slot-copy-from-super, `nim_class_call`'s dual path
//! for the root `class` vs. ordinary classes).

use std::collections::HashMap;
use std::sync::Arc;

use crate::code::CodeObject;
use crate::error::RuntimeError;
use crate::value::Ref;
use crate::vm::Vm;

/// A host function implementing a method body: `(self, args)`, matching
/// spec §3.2's native method kind exactly.
pub type NativeFn = fn(&mut Vm, Ref, &[Ref]) -> Result<Ref, RuntimeError>;

/// Binary operator / comparison slot signature.
pub type BinOp = fn(&mut Vm, Ref, Ref) -> Result<Ref, RuntimeError>;

/// `cmp` returns one of {less, equal, greater, not-implemented}; a
/// distinct `Err` variant is used for comparisons that are themselves
/// runtime errors (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpResult {
    Less,
    Equal,
    Greater,
    NotImplemented,
}

pub type CmpFn = fn(&mut Vm, Ref, Ref) -> Result<CmpResult, RuntimeError>;
pub type GetAttrFn = fn(&mut Vm, Ref, &str) -> Result<Option<Ref>, RuntimeError>;
pub type GetItemFn = fn(&mut Vm, Ref, Ref) -> Result<Ref, RuntimeError>;
pub type NonzeroFn = fn(&mut Vm, Ref) -> Result<bool, RuntimeError>;
pub type StrFn = fn(&mut Vm, Ref) -> Result<Ref, RuntimeError>;
/// `dtor` fires during sweep for side effects beyond what `Drop`-on-reuse
/// already does to the cell's owned buffers (spec §4.2).
pub type DtorFn = fn(&mut Vm, Ref);

/// Operation slot table (spec §3.2). Every slot is either absent
/// (`None`, meaning "inherit from super" -- already resolved by the copy
/// that happens at class-creation time, so by the time a slot is read
/// here "absent" really does mean "nobody up the chain defined it") or a
/// direct function pointer into the runtime.
#[derive(Clone, Copy, Default)]
pub struct Slots {
    pub init: Option<NativeFn>,
    pub dtor: Option<DtorFn>,
    pub str_: Option<StrFn>,
    pub call: Option<NativeFn>,
    pub cmp: Option<CmpFn>,
    pub getattr: Option<GetAttrFn>,
    pub getitem: Option<GetItemFn>,
    pub nonzero: Option<NonzeroFn>,
    pub add: Option<BinOp>,
    pub sub: Option<BinOp>,
    pub mul: Option<BinOp>,
    pub div: Option<BinOp>,
}

/// A class metaobject: name, optional super, method table, slot table
/// (spec §3.2).
#[derive(Clone)]
pub struct ClassObj {
    pub name: Ref,
    pub super_: Option<Ref>,
    pub methods: HashMap<String, Ref>,
    pub slots: Slots,
    /// Set once, during construction, then read-only (spec §3.5
    /// invariant). Enforced by convention (no public mutator once a
    /// class leaves the compiler's unit stack) rather than a borrow-level
    /// lock, matching how `libnim` treats it -- mutable during `compile`,
    /// frozen by the time the VM can see it.
    pub sealed: bool,
}

impl ClassObj {
    pub fn new(name: Ref, super_slots: Slots, super_ref: Option<Ref>) -> Self {
        ClassObj {
            name,
            super_: super_ref,
            methods: HashMap::new(),
            slots: super_slots,
            sealed: false,
        }
    }
}

/// The three method kinds (spec §3.2): a host function; a bytecode body
/// plus its owning module; or a bytecode body plus a captured-binding
/// map (a closure). `MAKECLOSURE` is only ever emitted for the latter
/// (spec §3.5 invariant).
///
/// `code` is an `Arc<CodeObject>` rather than a heap `Ref`: code objects
/// are immutable once the compiler hands them off (spec §3.5) and never
/// contain task-local refs (see `code.rs`'s `Constant`), so they can be
/// shared across task boundaries by the usual Rust `Arc` rather than by
/// aliasing GC cells across independently-owned heaps. `module` is named
/// rather than ref'd for the same reason: this is the Rust-safe
/// realization of spec §5's module/method pass-by-reference exception,
/// and of design note §9's suggestion to make that transfer "a
/// content-addressed identity, not a pointer" -- the owning module is
/// resolved by name, per-task, against that task's own loaded-modules
/// table at call time (spec §4.4 PUSHNAME step 2).
#[derive(Clone)]
pub enum MethodKind {
    Native(NativeFn),
    Bytecode { code: Arc<CodeObject>, module: String },
    Closure { code: Arc<CodeObject>, module: String, bindings: HashMap<String, Ref> },
}

/// A method value. `bound_self` is set when attribute access on an
/// instance bound this method to it (spec §3.2 "bound method").
#[derive(Clone)]
pub struct MethodObj {
    pub kind: MethodKind,
    pub bound_self: Option<Ref>,
}

impl MethodObj {
    pub fn native(f: NativeFn) -> Self {
        MethodObj { kind: MethodKind::Native(f), bound_self: None }
    }

    pub fn bytecode(code: Arc<CodeObject>, module: String) -> Self {
        MethodObj { kind: MethodKind::Bytecode { code, module }, bound_self: None }
    }

    pub fn closure(code: Arc<CodeObject>, module: String, bindings: HashMap<String, Ref>) -> Self {
        MethodObj { kind: MethodKind::Closure { code, module, bindings }, bound_self: None }
    }

    /// `true` iff this method has any captured bindings -- used by the
    /// compiler's invariant (spec §3.5: `MAKECLOSURE` iff freevars
    /// non-empty) and by the message subsystem's pack-time rejection of
    /// closures (spec §5).
    pub fn is_closure(&self) -> bool {
        matches!(self.kind, MethodKind::Closure { .. })
    }

    pub fn bind(&self, self_ref: Ref) -> MethodObj {
        let mut m = self.clone();
        m.bound_self = Some(self_ref);
        m
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_default_to_none() {
        let s = Slots::default();
        assert!(s.add.is_none());
        assert!(s.init.is_none());
    }

    #[test]
    fn new_class_inherits_super_slots() {
        let mut super_slots = Slots::default();
        fn dummy_add(_vm: &mut Vm, a: Ref, _b: Ref) -> Result<Ref, RuntimeError> {
            Ok(a)
        }
        super_slots.add = Some(dummy_add);
        let c = ClassObj::new(Ref(0), super_slots, Some(Ref(1)));
        assert!(c.slots.add.is_some());
        assert_eq!(c.super_, Some(Ref(1)));
    }
}
