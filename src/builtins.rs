//! Builtin classes and free functions (spec §6.3). Grounded on
//! `original_source/libnim/class.c`'s bootstrap sequence (metaclass-of-
//! itself trick, slot wiring by hand for the builtin concrete classes)
//! and on `libnim/builtin.c` for which free functions are exposed.
//! `print`'s injectable sink and the container/string native methods are
//! the SPEC_FULL.md §C supplement, grounded the same way the rest of
//! this module is.

use std::collections::HashSet;
use std::io::Write as _;

use crate::class::{ClassObj, CmpResult, MethodObj, Slots};
use crate::error::RuntimeError;
use crate::numeric::Numeric;
use crate::value::{Ref, VString, Value};
use crate::vm::{CoreClasses, Vm};

fn value_to_numeric(vm: &Vm, r: Ref) -> Result<Numeric, RuntimeError> {
    match vm.heap.get(r) {
        Value::Int(i) => Ok(Numeric::Int(*i)),
        Value::Float(f) => Ok(Numeric::Float(*f)),
        _ => Err(RuntimeError::new("expected a number")),
    }
}

fn alloc_numeric(vm: &mut Vm, n: Numeric) -> Ref {
    match n {
        Numeric::Int(i) => vm.alloc(vm.core.int, Value::Int(i)),
        Numeric::Float(f) => vm.alloc(vm.core.float, Value::Float(f)),
    }
}

fn num_add(vm: &mut Vm, a: Ref, b: Ref) -> Result<Ref, RuntimeError> {
    let (na, nb) = Numeric::promote_pair(value_to_numeric(vm, a)?, value_to_numeric(vm, b)?);
    Ok(alloc_numeric(vm, na.add(nb)))
}
fn num_sub(vm: &mut Vm, a: Ref, b: Ref) -> Result<Ref, RuntimeError> {
    let (na, nb) = Numeric::promote_pair(value_to_numeric(vm, a)?, value_to_numeric(vm, b)?);
    Ok(alloc_numeric(vm, na.sub(nb)))
}
fn num_mul(vm: &mut Vm, a: Ref, b: Ref) -> Result<Ref, RuntimeError> {
    let (na, nb) = Numeric::promote_pair(value_to_numeric(vm, a)?, value_to_numeric(vm, b)?);
    Ok(alloc_numeric(vm, na.mul(nb)))
}
fn num_div(vm: &mut Vm, a: Ref, b: Ref) -> Result<Ref, RuntimeError> {
    let (na, nb) = Numeric::promote_pair(value_to_numeric(vm, a)?, value_to_numeric(vm, b)?);
    let result = na.div(nb)?;
    Ok(alloc_numeric(vm, result))
}
fn num_cmp(vm: &mut Vm, a: Ref, b: Ref) -> Result<CmpResult, RuntimeError> {
    let nb = match vm.heap.get(b) {
        Value::Int(i) => Numeric::Int(*i),
        Value::Float(f) => Numeric::Float(*f),
        _ => return Ok(CmpResult::NotImplemented),
    };
    let na = value_to_numeric(vm, a)?;
    let (na, nb) = Numeric::promote_pair(na, nb);
    Ok(match na.compare(nb) {
        std::cmp::Ordering::Less => CmpResult::Less,
        std::cmp::Ordering::Equal => CmpResult::Equal,
        std::cmp::Ordering::Greater => CmpResult::Greater,
    })
}
fn num_nonzero(vm: &mut Vm, r: Ref) -> Result<bool, RuntimeError> {
    Ok(match value_to_numeric(vm, r)? {
        Numeric::Int(i) => i != 0,
        Numeric::Float(f) => f != 0.0,
    })
}
fn num_str(vm: &mut Vm, r: Ref) -> Result<Ref, RuntimeError> {
    let s = match vm.heap.get(r) {
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        _ => return Err(RuntimeError::new("expected a number")),
    };
    Ok(vm.alloc(vm.core.str_, Value::Str(VString::new(s.into_bytes()))))
}

fn str_bytes(vm: &Vm, r: Ref) -> Result<Vec<u8>, RuntimeError> {
    match vm.heap.get(r) {
        Value::Str(s) => Ok(s.data.clone()),
        _ => Err(RuntimeError::new("expected a str")),
    }
}
fn str_add(vm: &mut Vm, a: Ref, b: Ref) -> Result<Ref, RuntimeError> {
    let mut bytes = str_bytes(vm, a)?;
    bytes.extend(str_bytes(vm, b)?);
    Ok(vm.alloc(vm.core.str_, Value::Str(VString::new(bytes))))
}
fn str_cmp(vm: &mut Vm, a: Ref, b: Ref) -> Result<CmpResult, RuntimeError> {
    if !matches!(vm.heap.get(b), Value::Str(_)) {
        return Ok(CmpResult::NotImplemented);
    }
    let (sa, sb) = (str_bytes(vm, a)?, str_bytes(vm, b)?);
    Ok(match sa.cmp(&sb) {
        std::cmp::Ordering::Less => CmpResult::Less,
        std::cmp::Ordering::Equal => CmpResult::Equal,
        std::cmp::Ordering::Greater => CmpResult::Greater,
    })
}
fn str_nonzero(vm: &mut Vm, r: Ref) -> Result<bool, RuntimeError> {
    Ok(!str_bytes(vm, r)?.is_empty())
}
fn str_str(_vm: &mut Vm, r: Ref) -> Result<Ref, RuntimeError> {
    Ok(r) // str's `str` slot is the identity
}
/// Single-character indexing, per DESIGN.md's Open Question resolution:
/// `str` `getitem` yields a length-1 `str`, or a runtime error if the
/// index is out of range. Negative indices wrap from the end.
fn str_getitem(vm: &mut Vm, target: Ref, key: Ref) -> Result<Ref, RuntimeError> {
    let bytes = str_bytes(vm, target)?;
    let idx = match vm.heap.get(key) {
        Value::Int(i) => *i,
        _ => return Err(RuntimeError::new("str index must be an int")),
    };
    let len = bytes.len() as i64;
    let real = if idx < 0 { len + idx } else { idx };
    if real < 0 || real >= len {
        return Err(RuntimeError::new("str index out of range"));
    }
    Ok(vm.alloc(vm.core.str_, Value::Str(VString::new(vec![bytes[real as usize]]))))
}

fn array_nonzero(vm: &mut Vm, r: Ref) -> Result<bool, RuntimeError> {
    match vm.heap.get(r) {
        Value::Array(a) => Ok(!a.is_empty()),
        _ => Err(RuntimeError::new("expected an array")),
    }
}
fn array_str(vm: &mut Vm, r: Ref) -> Result<Ref, RuntimeError> {
    let items = match vm.heap.get(r) {
        Value::Array(a) => a.items.clone(),
        _ => return Err(RuntimeError::new("expected an array")),
    };
    let mut out = String::from("[");
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(&display_value(vm, *item)?);
    }
    out.push(']');
    Ok(vm.alloc(vm.core.str_, Value::Str(VString::new(out.into_bytes()))))
}
/// Supports negative-index wraparound (spec §8), matching `remove_at`'s
/// documented behavior so `getitem` and `remove_at` agree on indexing.
fn array_getitem(vm: &mut Vm, target: Ref, key: Ref) -> Result<Ref, RuntimeError> {
    let items = match vm.heap.get(target) {
        Value::Array(a) => a.items.clone(),
        _ => return Err(RuntimeError::new("expected an array")),
    };
    let idx = match vm.heap.get(key) {
        Value::Int(i) => *i,
        _ => return Err(RuntimeError::new("array index must be an int")),
    };
    let len = items.len() as i64;
    let real = if idx < 0 { len + idx } else { idx };
    if real < 0 || real >= len {
        return Err(RuntimeError::new("array index out of range"));
    }
    Ok(items[real as usize])
}

fn hash_nonzero(vm: &mut Vm, r: Ref) -> Result<bool, RuntimeError> {
    match vm.heap.get(r) {
        Value::Hash(h) => Ok(!h.pairs.is_empty()),
        _ => Err(RuntimeError::new("expected a hash")),
    }
}
/// Linear-scan lookup by value equality, since keys are compared via the
/// `cmp` slot protocol rather than `Hash`/`Eq` (value.rs's `VHash` doc).
fn hash_getitem(vm: &mut Vm, target: Ref, key: Ref) -> Result<Ref, RuntimeError> {
    let pairs = match vm.heap.get(target) {
        Value::Hash(h) => h.pairs.clone(),
        _ => return Err(RuntimeError::new("expected a hash")),
    };
    for (k, v) in pairs {
        if values_equal(vm, k, key)? {
            return Ok(v);
        }
    }
    Err(RuntimeError::new("key not found"))
}

fn values_equal(vm: &mut Vm, a: Ref, b: Ref) -> Result<bool, RuntimeError> {
    let class = vm.heap.class_of(a);
    let slot = match vm.heap.get(class) {
        Value::Class(c) => c.slots.cmp,
        _ => None,
    };
    match slot {
        Some(f) => Ok(f(vm, a, b)? == CmpResult::Equal),
        None => Ok(false),
    }
}

fn display_value(vm: &mut Vm, r: Ref) -> Result<String, RuntimeError> {
    let shown = if let Some(m) = vm.find_method(r, "str") {
        vm.call_value(m, &[])?
    } else {
        let class = vm.heap.class_of(r);
        let slot = match vm.heap.get(class) {
            Value::Class(c) => c.slots.str_,
            _ => None,
        };
        match slot {
            Some(f) => f(vm, r)?,
            None => return Ok(format!("<{}>", vm.heap.get(r).type_name())),
        }
    };
    Ok(str_bytes(vm, shown)?.into_iter().map(|b| b as char).collect())
}

fn bool_nonzero(vm: &mut Vm, r: Ref) -> Result<bool, RuntimeError> {
    match vm.heap.get(r) {
        Value::Bool(b) => Ok(*b),
        _ => Err(RuntimeError::new("expected a bool")),
    }
}
fn bool_cmp(vm: &mut Vm, a: Ref, b: Ref) -> Result<CmpResult, RuntimeError> {
    match (vm.heap.get(a), vm.heap.get(b)) {
        (Value::Bool(x), Value::Bool(y)) => Ok(if x == y { CmpResult::Equal } else { CmpResult::NotImplemented }),
        _ => Ok(CmpResult::NotImplemented),
    }
}
fn nil_nonzero(_vm: &mut Vm, _r: Ref) -> Result<bool, RuntimeError> {
    Ok(false)
}
fn nil_cmp(vm: &mut Vm, _a: Ref, b: Ref) -> Result<CmpResult, RuntimeError> {
    Ok(if matches!(vm.heap.get(b), Value::Nil) { CmpResult::Equal } else { CmpResult::NotImplemented })
}

/// Classes compare by identity: two `Ref`s to the same class cell are
/// equal, anything else (including another class) is not-implemented
/// rather than an error -- lets `GETCLASS` results feed `CMPEQ`/`CMPNEQ`
/// directly, which the compiler's pattern-match class guards rely on.
fn class_identity_cmp(_vm: &mut Vm, a: Ref, b: Ref) -> Result<CmpResult, RuntimeError> {
    Ok(if a == b { CmpResult::Equal } else { CmpResult::NotImplemented })
}

/// A loaded module exposes its locals as attributes (spec §3.3: modules
/// are "Module objects... whose attributes are its top-level names").
fn module_getattr(vm: &mut Vm, target: Ref, name: &str) -> Result<Option<Ref>, RuntimeError> {
    match vm.heap.get(target) {
        Value::Module(m) => Ok(m.locals.get(name).copied()),
        _ => Err(RuntimeError::new("expected a module")),
    }
}

fn alloc_class(heap: &mut crate::gc::Heap) -> Ref {
    heap.alloc(Ref(0), Value::Class(ClassObj::new(Ref(0), Slots::default(), None)), &[])
}

/// Bootstrap the closed set of builtin concrete classes (spec §3.2). Uses
/// the classic "a class's class is the `class` metaclass, including
/// `class` itself" bootstrap: allocate bare cells first, then patch every
/// cell's own class pointer and name in two later passes.
pub fn bootstrap_core_classes(heap: &mut crate::gc::Heap) -> CoreClasses {
    let object = alloc_class(heap);
    let nil = alloc_class(heap);
    let bool_ = alloc_class(heap);
    let int = alloc_class(heap);
    let float = alloc_class(heap);
    let str_ = alloc_class(heap);
    let array = alloc_class(heap);
    let hash = alloc_class(heap);
    let class = alloc_class(heap);
    let method = alloc_class(heap);
    let module = alloc_class(heap);
    let task = alloc_class(heap);
    let error = alloc_class(heap);

    for c in [object, nil, bool_, int, float, str_, array, hash, class, method, module, task, error] {
        heap.set_class(c, class);
        heap.make_root(c);
        if let Value::Class(co) = heap.get_mut(c) {
            co.super_ = Some(object);
            co.sealed = true;
        }
    }
    if let Value::Class(co) = heap.get_mut(object) {
        co.super_ = None;
    }

    macro_rules! wire {
        ($c:expr, $($field:ident = $f:expr),* $(,)?) => {
            if let Value::Class(co) = heap.get_mut($c) {
                $(co.slots.$field = Some($f);)*
            }
        };
    }
    wire!(int, add = num_add, sub = num_sub, mul = num_mul, div = num_div, cmp = num_cmp, nonzero = num_nonzero, str_ = num_str);
    wire!(float, add = num_add, sub = num_sub, mul = num_mul, div = num_div, cmp = num_cmp, nonzero = num_nonzero, str_ = num_str);
    wire!(str_, add = str_add, cmp = str_cmp, nonzero = str_nonzero, str_ = str_str, getitem = str_getitem);
    wire!(array, nonzero = array_nonzero, str_ = array_str, getitem = array_getitem);
    wire!(hash, nonzero = hash_nonzero, getitem = hash_getitem);
    wire!(bool_, nonzero = bool_nonzero, cmp = bool_cmp);
    wire!(nil, nonzero = nil_nonzero, cmp = nil_cmp);
    wire!(module, getattr = module_getattr);
    wire!(task, getattr = crate::task::task_getattr);
    wire!(class, cmp = class_identity_cmp);

    // name strings, allocated now that `str_` itself is a real class
    for (c, label) in [
        (object, "object"),
        (nil, "nil"),
        (bool_, "bool"),
        (int, "int"),
        (float, "float"),
        (str_, "str"),
        (array, "array"),
        (hash, "hash"),
        (class, "class"),
        (method, "method"),
        (module, "module"),
        (task, "task"),
        (error, "error"),
    ] {
        let name_ref = heap.alloc(str_, Value::Str(VString::new(label.as_bytes().to_vec())), &[]);
        heap.make_root(name_ref);
        if let Value::Class(co) = heap.get_mut(c) {
            co.name = name_ref;
        }
    }

    let core = CoreClasses { object, nil, bool_, int, float, str_, array, hash, class, method, module, task, error };
    crate::container::install(heap, &core);
    crate::strings::install(heap, &core);
    core
}

fn native_print(vm: &mut Vm, _self_: Ref, args: &[Ref]) -> Result<Ref, RuntimeError> {
    let mut parts = Vec::with_capacity(args.len());
    for a in args {
        parts.push(display_value(vm, *a)?);
    }
    let line = parts.join(" ");
    writeln!(vm.stdout, "{line}").map_err(|e| RuntimeError::new(format!("print: {e}")))?;
    Ok(vm.nil_ref)
}

fn native_recv(vm: &mut Vm, _self_: Ref, _args: &[Ref]) -> Result<Ref, RuntimeError> {
    crate::task::recv_current(vm)
}

fn native_self(vm: &mut Vm, _self_: Ref, _args: &[Ref]) -> Result<Ref, RuntimeError> {
    crate::task::self_handle(vm)
}

fn native_range(vm: &mut Vm, _self_: Ref, args: &[Ref]) -> Result<Ref, RuntimeError> {
    let (lo, hi) = match args {
        [hi] => (0i64, match vm.heap.get(*hi) { Value::Int(i) => *i, _ => return Err(RuntimeError::new("range bound must be an int")) }),
        [lo, hi] => {
            let lo = match vm.heap.get(*lo) { Value::Int(i) => *i, _ => return Err(RuntimeError::new("range bound must be an int")) };
            let hi = match vm.heap.get(*hi) { Value::Int(i) => *i, _ => return Err(RuntimeError::new("range bound must be an int")) };
            (lo, hi)
        }
        _ => return Err(RuntimeError::new("range expects 1 or 2 arguments")),
    };
    let mut items = Vec::new();
    for i in lo..hi {
        items.push(vm.alloc(vm.core.int, Value::Int(i)));
    }
    Ok(vm.alloc(vm.core.array, Value::Array(crate::value::VArray::with_items(items))))
}

/// Reached when a `match` statement falls through every arm without a
/// match (spec §4.3: match compiles to a test chain, not an opcode, so
/// the "no arm matched" case is a call to this hidden native rather than
/// a dedicated `RAISE`-style instruction).
fn native_match_fail(_vm: &mut Vm, _self_: Ref, _args: &[Ref]) -> Result<Ref, RuntimeError> {
    Err(RuntimeError::new("no pattern matched"))
}

fn native_compile(vm: &mut Vm, _self_: Ref, args: &[Ref]) -> Result<Ref, RuntimeError> {
    let name = match args.first().map(|r| vm.heap.get(*r)) {
        Some(Value::Str(s)) => s.as_str_lossy().into_owned(),
        _ => return Err(RuntimeError::new("compile expects a module name string")),
    };
    crate::module::load_module(vm, &name).map_err(|e| RuntimeError::new(e.message))
}

/// Calling the `class` metaclass mints a new class: `class(name, base,
/// methods)`, the runtime realization of a `class` declaration (spec
/// §6.1). `base` is `nil` (inherits from `object`) or an existing class;
/// `methods` is a `hash` from method name (`str`) to `method`. Slots
/// inherit from `base` by copy (`original_source/libnim/class.c`'s
/// `nim_class_new`); a method named like an operator slot (`init`,
/// `str`, `cmp`, `add`, ...) is resolved dynamically through the method
/// table at call time rather than patched into `Slots` (see
/// `Vm::find_method`'s doc comment), so no slot patching happens here.
pub fn create_user_class(vm: &mut Vm, args: &[Ref]) -> Result<Ref, RuntimeError> {
    let name_ref = *args.first().ok_or_else(|| RuntimeError::new("class() expects a name"))?;
    let base_ref = match args.get(1).map(|r| vm.heap.get(*r)) {
        Some(Value::Nil) | None => vm.core.object,
        Some(Value::Class(_)) => *args.get(1).unwrap(),
        _ => return Err(RuntimeError::new("class() base must be a class or nil")),
    };
    let methods_ref = *args.get(2).ok_or_else(|| RuntimeError::new("class() expects a methods hash"))?;
    let method_pairs = match vm.heap.get(methods_ref) {
        Value::Hash(h) => h.pairs.clone(),
        _ => return Err(RuntimeError::new("class() methods must be a hash")),
    };

    let base_slots = match vm.heap.get(base_ref) {
        Value::Class(c) => c.slots,
        _ => return Err(RuntimeError::new("class() base must be a class")),
    };
    let mut class_obj = ClassObj::new(name_ref, base_slots, Some(base_ref));
    for (k, v) in method_pairs {
        let name = match vm.heap.get(k) {
            Value::Str(s) => s.as_str_lossy().into_owned(),
            _ => return Err(RuntimeError::new("method table keys must be str")),
        };
        class_obj.methods.insert(name, v);
    }
    class_obj.sealed = true;
    Ok(vm.alloc(vm.core.class, Value::Class(class_obj)))
}

pub fn install_builtin_functions(vm: &mut Vm) {
    let entries: &[(&str, crate::class::NativeFn)] = &[
        ("print", native_print),
        ("recv", native_recv),
        ("self", native_self),
        ("range", native_range),
        ("compile", native_compile),
        ("__match_fail", native_match_fail),
    ];
    for (name, f) in entries {
        let m = vm.alloc(vm.core.method, Value::Method(MethodObj::native(*f)));
        vm.builtins.insert((*name).to_string(), m);
    }
    let classes: &[(&str, Ref)] = &[
        ("object", vm.core.object),
        ("nil", vm.core.nil),
        ("bool", vm.core.bool_),
        ("int", vm.core.int),
        ("float", vm.core.float),
        ("str", vm.core.str_),
        ("array", vm.core.array),
        ("hash", vm.core.hash),
        ("class", vm.core.class),
        ("method", vm.core.method),
        ("module", vm.core.module),
        ("task", vm.core.task),
        ("error", vm.core.error),
    ];
    for (name, r) in classes {
        vm.builtins.insert((*name).to_string(), *r);
    }
}

/// The static builtin name set the symbol table pass checks undeclared
/// names against (spec §4.3 "builtin" flag).
pub fn builtin_names() -> HashSet<String> {
    [
        "print", "recv", "self", "range", "compile", "__match_fail", "object", "nil", "bool", "int", "float", "str", "array", "hash",
        "class", "method", "module", "task", "error",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
