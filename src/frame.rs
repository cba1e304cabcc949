//! The VM's hot-path activation record (spec §3.4 "Frame"). Deliberately
//! off the GC heap -- see `value::FrameObj`'s doc comment and the module
//! doc on `gc.rs` for why precise, explicit roots replace a conservative
//! stack scan here.

use std::collections::HashMap;
use std::sync::Arc;

use crate::code::CodeObject;
use crate::value::Ref;

/// One call's locals map plus program counter. `locals` maps a declared
/// or free variable name to the `Ref` of its `Var` cell on the heap --
/// never to a bare value -- so `MAKECLOSURE` can capture the cell and
/// have later `STORENAME`s in either frame observe each other (spec
/// §4.4).
pub struct Frame {
    pub code: Arc<CodeObject>,
    /// Name of the module this method was declared in; module-level
    /// fallback lookups (`PUSHNAME` step 2) go through
    /// `vm.modules[&self.module]` (spec §4.4).
    pub module: String,
    pub locals: HashMap<String, Ref>,
    pub pc: usize,
    /// `self` for a bound method call; absent for a free function.
    pub bound_self: Option<Ref>,
}

impl Frame {
    pub fn new(code: Arc<CodeObject>, module: String, bound_self: Option<Ref>) -> Self {
        Frame { code, module, locals: HashMap::new(), pc: 0, bound_self }
    }

    pub fn local_cell(&self, name: &str) -> Option<Ref> {
        self.locals.get(name).copied()
    }

    pub fn bind_local(&mut self, name: &str, cell: Ref) {
        self.locals.insert(name.to_string(), cell);
    }

    pub fn fetch(&self) -> Option<crate::code::Instr> {
        self.code.instructions.get(self.pc).copied()
    }
}
