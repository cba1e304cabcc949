//! The stack virtual machine (spec §3.4, §4.4). Grounded on
//! `original_source/libnim/vm.c`'s fetch-decode-execute loop and on the
//! teacher's `invoke.rs` for the general shape of "one frame, one
//! dispatch loop, calls recurse" -- though every opcode's semantics here
//! follow the spec's instruction table, not the teacher's toy ISA.

use std::collections::HashMap;
use std::sync::Arc;

use log::trace;

use crate::class::{CmpResult, MethodKind, MethodObj};
use crate::code::{Constant, Opcode};
use crate::error::RuntimeError;
use crate::frame::Frame;
use crate::gc::Heap;
use crate::value::{Ref, VArray, VHash, Value};

/// Refs to the builtin concrete classes, allocated once at VM
/// construction (spec §3.2's closed set of concrete classes).
#[derive(Clone, Copy)]
pub struct CoreClasses {
    pub object: Ref,
    pub nil: Ref,
    pub bool_: Ref,
    pub int: Ref,
    pub float: Ref,
    pub str_: Ref,
    pub array: Ref,
    pub hash: Ref,
    pub class: Ref,
    pub method: Ref,
    pub module: Ref,
    pub task: Ref,
    pub error: Ref,
}

pub struct Vm {
    pub heap: Heap,
    pub frames: Vec<Frame>,
    pub stack: Vec<Ref>,
    pub modules: HashMap<String, Ref>,
    pub builtins: HashMap<String, Ref>,
    pub core: CoreClasses,
    pub nil_ref: Ref,
    pub true_ref: Ref,
    pub false_ref: Ref,
    pub current_task: Option<crate::task::TaskHandle>,
    /// Where `print` writes (spec SPEC_FULL.md §C); swappable in tests.
    pub stdout: Box<dyn std::io::Write + Send>,
    /// ASTs handed in by the (out-of-scope) parser/lexer, keyed by module
    /// name -- the boundary described in `ast.rs`'s module doc comment.
    pub module_sources: HashMap<String, crate::ast::Module>,
}

impl Vm {
    pub fn new() -> Self {
        let mut heap = Heap::new();
        let core = crate::builtins::bootstrap_core_classes(&mut heap);
        let nil_ref = heap.alloc(core.nil, Value::Nil, &[]);
        let true_ref = heap.alloc(core.bool_, Value::Bool(true), &[]);
        let false_ref = heap.alloc(core.bool_, Value::Bool(false), &[]);
        heap.make_root(nil_ref);
        heap.make_root(true_ref);
        heap.make_root(false_ref);
        let mut vm = Vm {
            heap,
            frames: Vec::new(),
            stack: Vec::new(),
            modules: HashMap::new(),
            builtins: HashMap::new(),
            core,
            nil_ref,
            true_ref,
            false_ref,
            current_task: None,
            stdout: Box::new(std::io::stdout()),
            module_sources: HashMap::new(),
        };
        crate::builtins::install_builtin_functions(&mut vm);
        vm
    }

    pub fn bool_ref(&self, b: bool) -> Ref {
        if b { self.true_ref } else { self.false_ref }
    }

    /// Root set the GC consults in addition to its own explicit roots
    /// (spec §4.2's conceptual "stack, frame locals, globals, self").
    fn enumerable_roots(&self) -> Vec<Ref> {
        let mut roots: Vec<Ref> = self.stack.clone();
        for f in &self.frames {
            roots.extend(f.locals.values().copied());
            if let Some(s) = f.bound_self {
                roots.push(s);
            }
        }
        roots.extend(self.modules.values().copied());
        roots.extend(self.builtins.values().copied());
        roots
    }

    pub fn alloc(&mut self, class: Ref, value: Value) -> Ref {
        let roots = self.enumerable_roots();
        self.heap.alloc(class, value, &roots)
    }

    fn push(&mut self, r: Ref) {
        self.stack.push(r);
    }

    fn pop(&mut self) -> Result<Ref, RuntimeError> {
        self.stack.pop().ok_or_else(|| RuntimeError::new("operand stack underflow"))
    }

    /// Walk `target`'s class chain for a method named `name` (spec §3.2
    /// operator slots are also reachable this way: a user-defined class
    /// overrides an operator by defining an ordinarily-named method --
    /// `init`, `str`, `cmp`, `add`, `nonzero`, etc -- since `Slots`' bare
    /// function pointers can only hold native code, not a bytecode/
    /// closure `Ref`). Builtin concrete classes have no such method
    /// entries and fall through to their native `Slots` function instead.
    pub fn find_method(&mut self, target: Ref, name: &str) -> Option<Ref> {
        let mut class = self.heap.class_of(target);
        loop {
            let (found, super_) = match self.heap.get(class) {
                Value::Class(c) => (c.methods.get(name).copied(), c.super_),
                _ => return None,
            };
            if let Some(m) = found {
                if let Value::Method(mo) = self.heap.get(m) {
                    let bound = mo.bind(target);
                    return Some(self.alloc(self.core.method, Value::Method(bound)));
                }
            }
            match super_ {
                Some(s) => class = s,
                None => return None,
            }
        }
    }

    /// `nonzero` truthiness test: a user `nonzero` method if the class
    /// defines one, else the class slot protocol (spec §4.1).
    pub fn is_truthy(&mut self, r: Ref) -> Result<bool, RuntimeError> {
        if let Some(m) = self.find_method(r, "nonzero") {
            let result = self.call_value(m, &[])?;
            return match self.heap.get(result) {
                Value::Bool(b) => Ok(*b),
                _ => Err(RuntimeError::new("nonzero must return a bool")),
            };
        }
        let class = self.heap.class_of(r);
        let slot = match self.heap.get(class) {
            Value::Class(c) => c.slots.nonzero,
            _ => return Err(RuntimeError::new("class pointer does not resolve to a class")),
        };
        match slot {
            Some(f) => f(self, r),
            None => Err(RuntimeError::new("value does not support truthiness")),
        }
    }

    fn materialize_constant(&mut self, c: &Constant) -> Ref {
        match c {
            Constant::Nil => self.nil_ref,
            Constant::Bool(b) => self.bool_ref(*b),
            Constant::Int(i) => self.alloc(self.core.int, Value::Int(*i)),
            Constant::Float(f) => self.alloc(self.core.float, Value::Float(*f)),
            Constant::Str(s) => {
                let v = Value::Str(crate::value::VString::new(s.as_bytes().to_vec()));
                self.alloc(self.core.str_, v)
            }
            Constant::Method(code) => {
                let module = self.frames.last().map(|f| f.module.clone()).unwrap_or_default();
                let v = Value::Method(MethodObj::bytecode(code.clone(), module));
                self.alloc(self.core.method, v)
            }
        }
    }

    /// `PUSHNAME` resolution order (spec §4.4): current frame's locals,
    /// then the owning module's locals, then the builtin table.
    fn resolve_name(&mut self, name: &str) -> Result<Ref, RuntimeError> {
        if let Some(frame) = self.frames.last() {
            if let Some(cell) = frame.local_cell(name) {
                if let Value::Var(v) = self.heap.get(cell) {
                    return Ok(v.value);
                }
            }
            let module_name = frame.module.clone();
            if let Some(module_ref) = self.modules.get(&module_name).copied() {
                if let Value::Module(m) = self.heap.get(module_ref) {
                    if let Some(v) = m.locals.get(name) {
                        return Ok(*v);
                    }
                }
            }
        }
        if let Some(v) = self.builtins.get(name) {
            return Ok(*v);
        }
        Err(RuntimeError::new(format!("name '{name}' is not defined")))
    }

    fn store_name(&mut self, name: &str, value: Ref) {
        let existing = self.frames.last().and_then(|f| f.local_cell(name));
        if let Some(cell) = existing {
            if let Value::Var(v) = self.heap.get_mut(cell) {
                v.value = value;
            }
        } else {
            let cell = self.alloc(self.core.object, Value::Var(crate::value::VarObj { value }));
            self.frames.last_mut().expect("STORENAME outside a frame").bind_local(name, cell);
        }
    }

    /// Attribute lookup (spec §4.1 `getattr`): bound-method resolution
    /// through the class/super chain first, falling back to the class's
    /// custom `getattr` slot, then to instance fields.
    pub fn get_attr(&mut self, target: Ref, name: &str) -> Result<Ref, RuntimeError> {
        let mut class = self.heap.class_of(target);
        loop {
            let (method, super_, getattr_slot) = match self.heap.get(class) {
                Value::Class(c) => (c.methods.get(name).copied(), c.super_, c.slots.getattr),
                _ => return Err(RuntimeError::new("corrupt class pointer")),
            };
            if let Some(m) = method {
                if let Value::Method(mo) = self.heap.get(m) {
                    let bound = mo.bind(target);
                    return Ok(self.alloc(self.core.method, Value::Method(bound)));
                }
            }
            if class == self.heap.class_of(target) {
                if let Some(f) = getattr_slot {
                    if let Some(r) = f(self, target, name)? {
                        return Ok(r);
                    }
                }
            }
            match super_ {
                Some(s) => class = s,
                None => break,
            }
        }
        if let Value::Instance(inst) = self.heap.get(target) {
            if let Some(r) = inst.fields.get(name) {
                return Ok(*r);
            }
        }
        Err(RuntimeError::new(format!("no attribute '{name}'")))
    }

    fn get_item(&mut self, target: Ref, key: Ref) -> Result<Ref, RuntimeError> {
        let class = self.heap.class_of(target);
        let slot = match self.heap.get(class) {
            Value::Class(c) => c.slots.getitem,
            _ => None,
        };
        match slot {
            Some(f) => f(self, target, key),
            None => Err(RuntimeError::new("value is not subscriptable")),
        }
    }

    /// Call convention (spec §4.4): native targets are invoked directly;
    /// bytecode/closure targets push a frame and recurse; a class target
    /// constructs an instance.
    pub fn call_value(&mut self, callee: Ref, args: &[Ref]) -> Result<Ref, RuntimeError> {
        match self.heap.get(callee).clone_shallow_tag() {
            ShallowTag::Method => self.call_method(callee, args),
            ShallowTag::Class => self.call_class(callee, args),
            ShallowTag::Other => {
                let class = self.heap.class_of(callee);
                let slot = match self.heap.get(class) {
                    Value::Class(c) => c.slots.call,
                    _ => None,
                };
                match slot {
                    Some(f) => f(self, callee, args),
                    None => Err(RuntimeError::new("value is not callable")),
                }
            }
        }
    }

    fn call_method(&mut self, method_ref: Ref, args: &[Ref]) -> Result<Ref, RuntimeError> {
        let (kind, bound_self) = match self.heap.get(method_ref) {
            Value::Method(m) => (m.kind.clone(), m.bound_self),
            _ => return Err(RuntimeError::new("not a method")),
        };
        match kind {
            MethodKind::Native(f) => f(self, bound_self.unwrap_or(self.nil_ref), args),
            MethodKind::Bytecode { code, module } => self.run_bytecode_call(code, module, bound_self, &HashMap::new(), args),
            MethodKind::Closure { code, module, bindings } => self.run_bytecode_call(code, module, bound_self, &bindings, args),
        }
    }

    fn run_bytecode_call(
        &mut self,
        code: Arc<crate::code::CodeObject>,
        module: String,
        bound_self: Option<Ref>,
        bindings: &HashMap<String, Ref>,
        args: &[Ref],
    ) -> Result<Ref, RuntimeError> {
        let mut frame = Frame::new(code.clone(), module, bound_self);
        for (name, cell) in bindings {
            frame.bind_local(name, *cell);
        }
        if let Some(s) = bound_self {
            let cell = self.alloc(self.core.object, Value::Var(crate::value::VarObj { value: s }));
            frame.bind_local("self", cell);
        }
        for (i, vname) in code.vars.iter().enumerate() {
            if frame.local_cell(vname).is_some() {
                continue; // already bound (e.g. freevar shadowing, "self")
            }
            let value = args.get(i).copied().unwrap_or(self.nil_ref);
            let cell = self.alloc(self.core.object, Value::Var(crate::value::VarObj { value }));
            frame.bind_local(vname, cell);
        }
        self.frames.push(frame);
        let result = self.run_loop();
        self.frames.pop();
        result
    }

    /// Execute a module's top-level code once, in the current task, and
    /// register the resulting `ModuleObj` (spec §4.4 "loading a module").
    /// Each task runs a module's top level independently -- the shared,
    /// expensive part is compilation (see `module.rs`'s process-global
    /// code cache), not this per-task execution.
    pub fn run_module(&mut self, code: Arc<crate::code::CodeObject>, name: &str) -> Result<Ref, RuntimeError> {
        let frame = Frame::new(code, name.to_string(), None);
        self.frames.push(frame);
        let result = self.run_loop();
        let frame = self.frames.pop().expect("module frame vanished");
        result?;
        let mut locals = HashMap::new();
        for (var_name, cell) in &frame.locals {
            if let Value::Var(v) = self.heap.get(*cell) {
                locals.insert(var_name.clone(), v.value);
            }
        }
        let module_ref = self.alloc(self.core.module, Value::Module(crate::value::ModuleObj { name: name.to_string(), locals }));
        self.modules.insert(name.to_string(), module_ref);
        Ok(module_ref)
    }

    /// Calling a class constructs an instance (spec §4.1); calling the
    /// `class` metaclass itself constructs a new *class* instead, the
    /// runtime counterpart of a `class` declaration (spec §6.1) --
    /// see `builtins::create_user_class`.
    fn call_class(&mut self, class_ref: Ref, args: &[Ref]) -> Result<Ref, RuntimeError> {
        if class_ref == self.core.class {
            return crate::builtins::create_user_class(self, args);
        }
        if !matches!(self.heap.get(class_ref), Value::Class(_)) {
            return Err(RuntimeError::new("not a class"));
        }
        let instance = self.alloc(class_ref, Value::Instance(crate::value::InstanceObj::default()));
        if let Some(m) = self.find_method(instance, "init") {
            self.call_value(m, args)?;
        } else {
            let init = match self.heap.get(class_ref) {
                Value::Class(c) => c.slots.init,
                _ => None,
            };
            if let Some(f) = init {
                f(self, instance, args)?;
            }
        }
        Ok(instance)
    }

    /// Run the current top frame until `RET`. Frame push/pop is the
    /// caller's responsibility (`run_bytecode_call`).
    fn run_loop(&mut self) -> Result<Ref, RuntimeError> {
        loop {
            let frame_idx = self.frames.len() - 1;
            let instr = match self.frames[frame_idx].fetch() {
                Some(i) => i,
                None => return Err(RuntimeError::new("fell off the end of a method body")),
            };
            let op = instr.opcode();
            let arg = instr.arg();
            trace!("vm: {op} {arg}");
            let mut advance = true;

            match op {
                Opcode::PUSHCONST => {
                    let c = self.frames[frame_idx].code.constants[arg as usize].clone();
                    let r = self.materialize_constant(&c);
                    self.push(r);
                }
                Opcode::PUSHNAME => {
                    let name = self.frames[frame_idx].code.names[arg as usize].clone();
                    let r = self.resolve_name(&name)?;
                    self.push(r);
                }
                Opcode::PUSHNIL => self.push(self.nil_ref),
                Opcode::STORENAME => {
                    let name = self.frames[frame_idx].code.names[arg as usize].clone();
                    let v = self.pop()?;
                    self.store_name(&name, v);
                }
                Opcode::GETCLASS => {
                    let v = self.pop()?;
                    self.push(self.heap.class_of(v));
                }
                Opcode::GETATTR => {
                    let name = self.frames[frame_idx].code.names[arg as usize].clone();
                    let target = self.pop()?;
                    let r = self.get_attr(target, &name)?;
                    self.push(r);
                }
                Opcode::GETITEM => {
                    let key = self.pop()?;
                    let target = self.pop()?;
                    let r = self.get_item(target, key)?;
                    self.push(r);
                }
                Opcode::CALL => {
                    let argc = arg as usize;
                    let mut call_args = Vec::with_capacity(argc);
                    for _ in 0..argc {
                        call_args.push(self.pop()?);
                    }
                    call_args.reverse();
                    let callee = self.pop()?;
                    let result = self.call_value(callee, &call_args)?;
                    self.push(result);
                }
                Opcode::RET => {
                    let v = self.pop()?;
                    return Ok(v);
                }
                Opcode::SPAWN => {
                    let argc = arg as usize;
                    let mut call_args = Vec::with_capacity(argc);
                    for _ in 0..argc {
                        call_args.push(self.pop()?);
                    }
                    call_args.reverse();
                    let callee = self.pop()?;
                    let r = crate::task::spawn_task(self, callee, call_args)?;
                    self.push(r);
                }
                Opcode::NOT => {
                    let v = self.pop()?;
                    let t = self.is_truthy(v)?;
                    self.push(self.bool_ref(!t));
                }
                Opcode::DUP => {
                    let top = *self.stack.last().ok_or_else(|| RuntimeError::new("operand stack underflow"))?;
                    self.push(top);
                }
                Opcode::MAKEARRAY => {
                    let count = arg as usize;
                    let mut items = Vec::with_capacity(count);
                    for _ in 0..count {
                        items.push(self.pop()?);
                    }
                    items.reverse();
                    let r = self.alloc(self.core.array, Value::Array(VArray::with_items(items)));
                    self.push(r);
                }
                Opcode::MAKEHASH => {
                    let count = arg as usize;
                    let mut flat = Vec::with_capacity(count * 2);
                    for _ in 0..count * 2 {
                        flat.push(self.pop()?);
                    }
                    flat.reverse();
                    let pairs = flat.chunks(2).map(|kv| (kv[0], kv[1])).collect();
                    let r = self.alloc(self.core.hash, Value::Hash(VHash { pairs }));
                    self.push(r);
                }
                Opcode::MAKECLOSURE => {
                    let placeholder = self.pop()?;
                    let (code, module) = match self.heap.get(placeholder) {
                        Value::Method(m) => match &m.kind {
                            MethodKind::Bytecode { code, module } => (code.clone(), module.clone()),
                            _ => return Err(RuntimeError::new("MAKECLOSURE target is already a closure")),
                        },
                        _ => return Err(RuntimeError::new("MAKECLOSURE target is not a method")),
                    };
                    let mut bindings = HashMap::new();
                    for freevar in code.freevars.clone() {
                        let cell = self
                            .frames
                            .iter()
                            .rev()
                            .find_map(|f| f.local_cell(&freevar))
                            .ok_or_else(|| RuntimeError::new(format!("free variable '{freevar}' not found in any enclosing frame")))?;
                        bindings.insert(freevar, cell);
                    }
                    let r = self.alloc(self.core.method, Value::Method(MethodObj::closure(code, module, bindings)));
                    self.push(r);
                }
                Opcode::JUMP => {
                    self.frames[frame_idx].pc = arg as usize;
                    advance = false;
                }
                Opcode::JUMPIFTRUE => {
                    let v = self.pop()?;
                    if self.is_truthy(v)? {
                        self.frames[frame_idx].pc = arg as usize;
                        advance = false;
                    }
                }
                Opcode::JUMPIFFALSE => {
                    let v = self.pop()?;
                    if !self.is_truthy(v)? {
                        self.frames[frame_idx].pc = arg as usize;
                        advance = false;
                    }
                }
                Opcode::CMPEQ | Opcode::CMPNEQ | Opcode::CMPGT | Opcode::CMPGTE | Opcode::CMPLT | Opcode::CMPLTE => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let result = self.compare(a, b, op)?;
                    self.push(self.bool_ref(result));
                }
                Opcode::ADD | Opcode::SUB | Opcode::MUL | Opcode::DIV => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let r = self.binop(a, b, op)?;
                    self.push(r);
                }
                Opcode::POP => {
                    self.pop()?;
                }
            }

            if advance {
                self.frames[frame_idx].pc += 1;
            }
        }
    }

    /// User `cmp` methods return an int by convention: negative/zero/
    /// positive for less/equal/greater, `nil` for not-implemented (spec
    /// §3.2's four-way `cmp` result, expressed in bytecode-callable form
    /// since `CmpResult` itself isn't a runtime value).
    fn compare(&mut self, a: Ref, b: Ref, op: Opcode) -> Result<bool, RuntimeError> {
        let result = if let Some(m) = self.find_method(a, "cmp") {
            let r = self.call_value(m, &[b])?;
            match self.heap.get(r) {
                Value::Int(i) if *i < 0 => CmpResult::Less,
                Value::Int(i) if *i > 0 => CmpResult::Greater,
                Value::Int(_) => CmpResult::Equal,
                Value::Nil => CmpResult::NotImplemented,
                _ => return Err(RuntimeError::new("cmp must return an int or nil")),
            }
        } else {
            let class = self.heap.class_of(a);
            let slot = match self.heap.get(class) {
                Value::Class(c) => c.slots.cmp,
                _ => None,
            };
            let f = slot.ok_or_else(|| RuntimeError::new("value does not support comparison"))?;
            f(self, a, b)?
        };
        if result == CmpResult::NotImplemented {
            // Equality-consuming sites treat not-implemented as "not
            // equal"; ordering sites have no sensible default, so they
            // raise (spec §4.1).
            return match op {
                Opcode::CMPEQ => Ok(false),
                Opcode::CMPNEQ => Ok(true),
                _ => Err(RuntimeError::new("values are not comparable")),
            };
        }
        Ok(match op {
            Opcode::CMPEQ => result == CmpResult::Equal,
            Opcode::CMPNEQ => result != CmpResult::Equal,
            Opcode::CMPGT => result == CmpResult::Greater,
            Opcode::CMPGTE => result == CmpResult::Greater || result == CmpResult::Equal,
            Opcode::CMPLT => result == CmpResult::Less,
            Opcode::CMPLTE => result == CmpResult::Less || result == CmpResult::Equal,
            _ => unreachable!(),
        })
    }

    fn binop(&mut self, a: Ref, b: Ref, op: Opcode) -> Result<Ref, RuntimeError> {
        let name = match op {
            Opcode::ADD => "add",
            Opcode::SUB => "sub",
            Opcode::MUL => "mul",
            Opcode::DIV => "div",
            _ => unreachable!(),
        };
        if let Some(m) = self.find_method(a, name) {
            return self.call_value(m, &[b]);
        }
        let class = self.heap.class_of(a);
        let slot = match self.heap.get(class) {
            Value::Class(c) => match op {
                Opcode::ADD => c.slots.add,
                Opcode::SUB => c.slots.sub,
                Opcode::MUL => c.slots.mul,
                Opcode::DIV => c.slots.div,
                _ => unreachable!(),
            },
            _ => None,
        };
        let f = slot.ok_or_else(|| RuntimeError::new("unsupported operand type"))?;
        f(self, a, b)
    }
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new()
    }
}

/// A minimal discriminant used only to route `call_value` without
/// cloning the whole `Value`.
enum ShallowTag {
    Method,
    Class,
    Other,
}

trait ShallowTagged {
    fn clone_shallow_tag(&self) -> ShallowTag;
}

impl ShallowTagged for Value {
    fn clone_shallow_tag(&self) -> ShallowTag {
        match self {
            Value::Method(_) => ShallowTag::Method,
            Value::Class(_) => ShallowTag::Class,
            _ => ShallowTag::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{CodeObject, Instr};

    #[test]
    fn pushconst_ret_returns_value() {
        let mut vm = Vm::new();
        let mut code = CodeObject::new("main");
        let idx = code.intern_constant(Constant::Int(42));
        code.emit(Opcode::PUSHCONST, idx);
        code.emit(Opcode::RET, 0);
        let code = Arc::new(code);
        let method = vm.alloc(vm.core.method, Value::Method(MethodObj::bytecode(code, "test".into())));
        let result = vm.call_value(method, &[]).unwrap();
        assert!(matches!(vm.heap.get(result), Value::Int(42)));
    }

    #[test]
    fn store_then_push_roundtrips() {
        let mut vm = Vm::new();
        let mut code = CodeObject::new("main");
        let c = code.intern_constant(Constant::Int(7));
        let n = code.intern_name("x");
        code.emit(Opcode::PUSHCONST, c);
        code.emit(Opcode::STORENAME, n);
        code.emit(Opcode::PUSHNAME, n);
        code.emit(Opcode::RET, 0);
        let code = Arc::new(code);
        let method = vm.alloc(vm.core.method, Value::Method(MethodObj::bytecode(code, "test".into())));
        let result = vm.call_value(method, &[]).unwrap();
        assert!(matches!(vm.heap.get(result), Value::Int(7)));
    }
}
