//! Error handling design (spec §7): compile errors, runtime errors, and
//! fatal/bug conditions. Native methods and VM dispatch propagate the first
//! two as `Result`; the third aborts the process after logging, since it
//! signals a broken invariant rather than a user-correctable condition.

use std::fmt;

/// Source location, used to annotate compile/runtime errors where the AST
/// or code object carries one (spec §6.1's `first_line`/`first_column`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Loc {
    pub line: u32,
    pub column: u32,
}

impl fmt::Display for Loc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// A malformed AST, an undefined symbol, or a structural rule violation
/// (class nested in a function, closure crossing a task boundary, a
/// pattern arm with too many bindings). Reported to stderr via `log::error!`
/// by the caller; compilation returns `Err` rather than throwing.
#[derive(Debug, thiserror::Error)]
#[error("compile error{}: {message}", loc.map(|l| format!(" at {l}")).unwrap_or_default())]
pub struct CompileError {
    pub message: String,
    pub loc: Option<Loc>,
}

impl CompileError {
    pub fn new(message: impl Into<String>) -> Self {
        CompileError { message: message.into(), loc: None }
    }

    pub fn at(message: impl Into<String>, loc: Loc) -> Self {
        CompileError { message: message.into(), loc: Some(loc) }
    }
}

/// Missing name, non-callable target, operator type mismatch, invalid
/// index, unsupported truthiness, wildcard outside a match, `break`
/// outside a loop. Propagates as a distinguished `Err` up the dispatch
/// loop; the owning task terminates without a return value (spec §7.2).
#[derive(Debug, thiserror::Error)]
#[error("runtime error{}: {message}", loc.map(|l| format!(" at {l}")).unwrap_or_default())]
pub struct RuntimeError {
    pub message: String,
    pub loc: Option<Loc>,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>) -> Self {
        RuntimeError { message: message.into(), loc: None }
    }

    pub fn at(message: impl Into<String>, loc: Loc) -> Self {
        RuntimeError { message: message.into(), loc: Some(loc) }
    }
}

/// Internal invariant violation: a class metaobject missing a required
/// slot, a corrupt label list, a cross-heap destructor call. These are
/// bugs in the runtime itself, not in the program it is running.
#[derive(Debug, thiserror::Error)]
#[error("fatal runtime bug: {0}")]
pub struct FatalError(pub String);

/// Log a diagnostic and abort the process. Used only for the invariant
/// violations spec §7.3 calls "fatal/bug conditions" -- never for errors a
/// running program can trigger through ordinary misuse.
#[macro_export]
macro_rules! bug {
    ($($arg:tt)*) => {{
        let msg = format!($($arg)*);
        log::error!("bug: {}", msg);
        std::process::abort();
    }};
}
