//! An embeddable runtime for a small dynamic, object-oriented language:
//! a uniform object/class kernel, a mark-sweep garbage-collected heap,
//! a bytecode compiler, a stack-based virtual machine, and an
//! OS-thread-backed task/message-passing subsystem.
//!
//! Module map, roughly bottom-up:
//!
//! - [`error`] -- compile/runtime/fatal error types (spec §7).
//! - [`numeric`] -- int/float promotion rules shared by the arithmetic
//!   opcodes and the numeric native slots.
//! - [`value`] -- the `Ref`/`Value` representation every heap cell shares.
//! - [`class`] -- class metaobjects, method tables, and the native
//!   operator `Slots` every core type wires.
//! - [`gc`] -- the slab-allocated, mark-sweep, precisely-rooted heap.
//! - [`code`] -- the packed instruction format and `CodeObject`.
//! - [`ast`] -- the tree shape the compiler consumes (no parser here;
//!   building that tree is out of this crate's scope).
//! - [`symtab`] -- the per-unit declared/free/builtin symbol pass that
//!   runs immediately before the compiler emits each unit.
//! - [`compiler`] -- AST-to-bytecode lowering, including pattern-match
//!   and closure-capture compilation.
//! - [`frame`] -- one call frame: code, locals, program counter.
//! - [`vm`] -- the fetch/decode/execute loop and its dispatch helpers
//!   (attribute/item access, calling convention, operator dispatch).
//! - [`builtins`] -- the bootstrapped core classes and native functions.
//! - [`container`], [`strings`] -- native methods on `array`/`hash`/`str`.
//! - [`message`], [`task`] -- the pack/unpack wire format and the
//!   OS-thread task runtime built on it.
//! - [`config`] -- module search path resolution.
//! - [`module`] -- module loading and the process-wide compile cache.
//!
//! Opcodes (spec §4.3, authoritative list in [`code::Opcode`]): PUSHCONST,
//! PUSHNAME, PUSHNIL, STORENAME, GETCLASS, GETATTR, GETITEM, CALL, RET,
//! SPAWN, NOT, DUP, MAKEARRAY, MAKEHASH, MAKECLOSURE, JUMP, JUMPIFTRUE,
//! JUMPIFFALSE, CMPEQ/NEQ/GT/GTE/LT/LTE, ADD/SUB/MUL/DIV, POP. There is no
//! opcode for constructing a class: the `class` metaclass is itself
//! callable (`builtins::create_user_class`), so `class(name, base,
//! methods)` lowers to an ordinary `CALL` against an existing core value.

pub mod ast;
pub mod builtins;
pub mod class;
pub mod code;
pub mod compiler;
pub mod config;
pub mod container;
pub mod error;
pub mod frame;
pub mod gc;
pub mod message;
pub mod module;
pub mod numeric;
pub mod strings;
pub mod symtab;
pub mod task;
pub mod value;
pub mod vm;

pub use error::{CompileError, FatalError, RuntimeError};
pub use value::{Ref, Value};
pub use vm::Vm;
