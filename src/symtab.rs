//! The pre-compile symbol table pass (spec §4.3 "Symbol table").
//! Grounded on `original_source/libnim/symtable.c`'s declared/free/
//! builtin/special classification, run once per unit immediately before
//! the compiler emits that unit's bytecode (rather than as one
//! whole-program pre-pass) -- the compiler already walks each unit's
//! body once to emit it, and walking it twice (analyze, then emit) is
//! cheap and keeps this module free of any bytecode-emission concerns.
//!
//! Resolution order (spec): innermost declaring scope wins; crossing a
//! *function* boundary marks a name free in the referencing function
//! (class scopes are transparent -- methods don't close over class-level
//! state the way nested functions close over enclosing locals); reaching
//! the module without a match checks the builtin table, then the two
//! special compile-time names, and only then errors.

use std::collections::HashSet;

use crate::ast::{BinOp, Decl, Expr, ExprKind, Node, PatternStmt, Stmt, VarDecl};
use crate::error::CompileError;

pub const MAX_BIND_PATH_DEPTH: usize = 16;
pub const MAX_BOUND_VARS_PER_ARM: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Module,
    Function,
    Class,
}

/// One ancestor scope's already-computed declared-name set, consulted
/// when resolving a name that isn't locally declared.
pub struct EnclosingScope<'a> {
    pub kind: ScopeKind,
    pub declared: &'a HashSet<String>,
}

/// The two compile-time-foldable special names (spec §4.3).
pub fn is_special(name: &str) -> bool {
    name == "__file__" || name == "__line__"
}

/// Everything the compiler needs about one function unit: its locals
/// (spec §8: "exactly the set of names flagged *declared*") and its
/// free variables (spec §8: "exactly the set flagged *free*").
#[derive(Debug, Clone, Default)]
pub struct UnitSymbols {
    pub vars: Vec<String>,
    pub freevars: Vec<String>,
}

struct Analyzer<'a> {
    declared: HashSet<String>,
    declared_order: Vec<String>,
    free: Vec<String>,
    free_set: HashSet<String>,
    enclosing: &'a [EnclosingScope<'a>],
    builtins: &'a HashSet<String>,
}

impl<'a> Analyzer<'a> {
    fn declare(&mut self, name: &str) {
        if self.declared.insert(name.to_string()) {
            self.declared_order.push(name.to_string());
        }
    }

    /// Collect declared names (params already seeded) from a function
    /// body without descending into nested function/class units -- those
    /// get their own `Analyzer` when the compiler reaches them.
    fn collect_declared(&mut self, body: &[Node]) -> Result<(), CompileError> {
        for node in body {
            match node {
                Node::Decl(Decl::Var { name, .. }) => self.declare(name),
                Node::Decl(Decl::Func { name, .. }) => self.declare(name),
                Node::Decl(Decl::Class { .. }) => {
                    return Err(CompileError::new(
                        "a class cannot be declared inside a function body",
                    ));
                }
                Node::Decl(Decl::Use { name }) => self.declare(name),
                Node::Stmt(Stmt::If { body, orelse, .. }) => {
                    self.collect_declared(body)?;
                    if let Some(orelse) = orelse {
                        self.collect_declared(orelse)?;
                    }
                }
                Node::Stmt(Stmt::While { body, .. }) => self.collect_declared(body)?,
                Node::Stmt(Stmt::Match { arms, .. }) => {
                    for arm in arms {
                        let mut binds = Vec::new();
                        collect_pattern_binds(&arm.test, &mut binds)?;
                        for b in &binds {
                            self.declare(b);
                        }
                        self.collect_declared(&arm.body)?;
                    }
                }
                Node::Stmt(Stmt::Expr(_))
                | Node::Stmt(Stmt::Assign { .. })
                | Node::Stmt(Stmt::Ret(_))
                | Node::Stmt(Stmt::Break) => {}
            }
        }
        Ok(())
    }

    fn resolve_name(&mut self, name: &str) -> Result<(), CompileError> {
        if self.declared.contains(name) {
            return Ok(());
        }
        for scope in self.enclosing.iter().rev() {
            if scope.kind == ScopeKind::Class {
                continue; // class scopes are transparent to name lookup
            }
            if scope.declared.contains(name) {
                if scope.kind == ScopeKind::Function && !self.free_set.contains(name) {
                    self.free_set.insert(name.to_string());
                    self.free.push(name.to_string());
                }
                return Ok(());
            }
        }
        if self.builtins.contains(name) || is_special(name) {
            return Ok(());
        }
        Err(CompileError::new(format!("undefined name '{name}'")))
    }

    fn walk_expr(&mut self, expr: &Expr) -> Result<(), CompileError> {
        match &expr.kind {
            ExprKind::Ident(name) => self.resolve_name(name)?,
            ExprKind::Call { target, args } => {
                self.walk_expr(target)?;
                for a in args {
                    self.walk_expr(a)?;
                }
            }
            ExprKind::GetAttr { target, .. } => self.walk_expr(target)?,
            ExprKind::GetItem { target, key } => {
                self.walk_expr(target)?;
                self.walk_expr(key)?;
            }
            ExprKind::Array(items) => {
                for i in items {
                    self.walk_expr(i)?;
                }
            }
            ExprKind::Hash(pairs) => {
                for (k, v) in pairs {
                    self.walk_expr(k)?;
                    self.walk_expr(v)?;
                }
            }
            ExprKind::BinOp { left, right, .. } => {
                self.walk_expr(left)?;
                self.walk_expr(right)?;
            }
            ExprKind::Not(e) => self.walk_expr(e)?,
            ExprKind::Spawn { target, args } => {
                self.walk_expr(target)?;
                for a in args {
                    self.walk_expr(a)?;
                }
            }
            ExprKind::Str(_)
            | ExprKind::Bool(_)
            | ExprKind::Nil
            | ExprKind::Int(_)
            | ExprKind::Float(_)
            | ExprKind::Wildcard => {}
            // nested fn literals are analyzed independently by the
            // compiler when it compiles them as their own unit.
            ExprKind::Fn { .. } => {}
        }
        Ok(())
    }

    fn walk_body(&mut self, body: &[Node]) -> Result<(), CompileError> {
        for node in body {
            match node {
                Node::Decl(Decl::Var { value: Some(v), .. }) => self.walk_expr(v)?,
                Node::Decl(Decl::Var { value: None, .. }) => {}
                Node::Decl(Decl::Func { .. }) | Node::Decl(Decl::Class { .. }) | Node::Decl(Decl::Use { .. }) => {}
                Node::Stmt(Stmt::Expr(e)) => self.walk_expr(e)?,
                Node::Stmt(Stmt::Assign { target, value }) => {
                    self.walk_expr(value)?;
                    self.resolve_name(target)?;
                }
                Node::Stmt(Stmt::If { cond, body, orelse }) => {
                    self.walk_expr(cond)?;
                    self.walk_body(body)?;
                    if let Some(orelse) = orelse {
                        self.walk_body(orelse)?;
                    }
                }
                Node::Stmt(Stmt::While { cond, body }) => {
                    self.walk_expr(cond)?;
                    self.walk_body(body)?;
                }
                Node::Stmt(Stmt::Match { expr, arms }) => {
                    self.walk_expr(expr)?;
                    for arm in arms {
                        self.walk_pattern_test(&arm.test)?;
                        self.walk_body(&arm.body)?;
                    }
                }
                Node::Stmt(Stmt::Ret(Some(e))) => self.walk_expr(e)?,
                Node::Stmt(Stmt::Ret(None)) | Node::Stmt(Stmt::Break) => {}
            }
        }
        Ok(())
    }

    /// Walk a pattern test for expression references -- literal patterns
    /// reference the compared constant (which is inert), array/hash
    /// patterns recurse structurally; identifier patterns are binds (no
    /// reference), so nothing to resolve there.
    fn walk_pattern_test(&mut self, test: &Expr) -> Result<(), CompileError> {
        match &test.kind {
            ExprKind::Array(items) => {
                for i in items {
                    self.walk_pattern_test(i)?;
                }
            }
            ExprKind::Hash(pairs) => {
                for (k, v) in pairs {
                    self.walk_expr(k)?; // literal hash keys are real exprs
                    self.walk_pattern_test(v)?;
                }
            }
            ExprKind::Ident(_) | ExprKind::Wildcard => {}
            _ => self.walk_expr(test)?,
        }
        Ok(())
    }
}

/// Collect identifier-pattern bind names from a pattern test, enforcing
/// the bind-path/bound-variable limits (spec §4.3 "Bind limits").
pub fn collect_pattern_binds(test: &Expr, out: &mut Vec<String>) -> Result<(), CompileError> {
    fn walk(test: &Expr, out: &mut Vec<String>, depth: usize) -> Result<(), CompileError> {
        if depth > MAX_BIND_PATH_DEPTH {
            return Err(CompileError::new("pattern nests more than 16 path items deep"));
        }
        match &test.kind {
            ExprKind::Ident(name) => {
                out.push(name.clone());
                if out.len() > MAX_BOUND_VARS_PER_ARM {
                    return Err(CompileError::new("pattern arm binds more than 16 variables"));
                }
            }
            ExprKind::Array(items) => {
                for i in items {
                    walk(i, out, depth + 1)?;
                }
            }
            ExprKind::Hash(pairs) => {
                for (_, v) in pairs {
                    walk(v, out, depth + 1)?;
                }
            }
            ExprKind::Wildcard
            | ExprKind::Str(_)
            | ExprKind::Bool(_)
            | ExprKind::Nil
            | ExprKind::Int(_)
            | ExprKind::Float(_) => {}
            _ => {}
        }
        Ok(())
    }
    walk(test, out, 0)
}

/// Analyze one function unit. `params` are pre-declared; `body` is
/// walked both for further declarations (nested `var`s, match binds) and
/// for free-variable references against `enclosing`.
pub fn analyze_function(
    params: &[VarDecl],
    body: &[Node],
    enclosing: &[EnclosingScope],
    builtins: &HashSet<String>,
) -> Result<UnitSymbols, CompileError> {
    let mut a = Analyzer {
        declared: HashSet::new(),
        declared_order: Vec::new(),
        free: Vec::new(),
        free_set: HashSet::new(),
        enclosing,
        builtins,
    };
    for p in params {
        a.declare(&p.name);
    }
    a.collect_declared(body)?;
    a.walk_body(body)?;
    Ok(UnitSymbols { vars: a.declared_order, freevars: a.free })
}

/// Analyze the module's top-level body: declares every top-level
/// `use`/`var`/`func`/`class` name, and resolves `var` initializers
/// (functions/classes are compiled as their own units and validated
/// there).
pub fn analyze_module(
    uses: &[Decl],
    body: &[Decl],
    builtins: &HashSet<String>,
) -> Result<UnitSymbols, CompileError> {
    let mut a = Analyzer {
        declared: HashSet::new(),
        declared_order: Vec::new(),
        free: Vec::new(),
        free_set: HashSet::new(),
        enclosing: &[],
        builtins,
    };
    for d in uses.iter().chain(body.iter()) {
        match d {
            Decl::Func { name, .. } | Decl::Class { name, .. } | Decl::Use { name } => a.declare(name),
            Decl::Var { name, .. } => a.declare(name),
        }
    }
    for d in body {
        if let Decl::Var { value: Some(v), .. } = d {
            a.walk_expr(v)?;
        }
    }
    Ok(UnitSymbols { vars: a.declared_order, freevars: Vec::new() })
}

#[allow(dead_code)]
fn unused_binop_silencer(_: BinOp) {}
#[allow(dead_code)]
fn unused_pattern_silencer(_: &PatternStmt) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Span, VarDecl};

    fn ident(name: &str) -> Expr {
        Expr::new(ExprKind::Ident(name.to_string()), Span::default())
    }

    #[test]
    fn declared_local_is_not_free() {
        let body = vec![Node::Stmt(Stmt::Ret(Some(ident("x"))))];
        let params = vec![VarDecl { name: "x".to_string() }];
        let builtins = HashSet::new();
        let syms = analyze_function(&params, &body, &[], &builtins).unwrap();
        assert_eq!(syms.vars, vec!["x".to_string()]);
        assert!(syms.freevars.is_empty());
    }

    #[test]
    fn outer_function_local_becomes_free_in_inner() {
        let outer_declared: HashSet<String> = ["n".to_string()].into_iter().collect();
        let enclosing = [EnclosingScope { kind: ScopeKind::Function, declared: &outer_declared }];
        let body = vec![Node::Stmt(Stmt::Ret(Some(ident("n"))))];
        let builtins = HashSet::new();
        let syms = analyze_function(&[], &body, &enclosing, &builtins).unwrap();
        assert_eq!(syms.freevars, vec!["n".to_string()]);
    }

    #[test]
    fn module_global_does_not_become_free() {
        let module_declared: HashSet<String> = ["g".to_string()].into_iter().collect();
        let enclosing = [EnclosingScope { kind: ScopeKind::Module, declared: &module_declared }];
        let body = vec![Node::Stmt(Stmt::Ret(Some(ident("g"))))];
        let builtins = HashSet::new();
        let syms = analyze_function(&[], &body, &enclosing, &builtins).unwrap();
        assert!(syms.freevars.is_empty());
    }

    #[test]
    fn undefined_name_is_compile_error() {
        let body = vec![Node::Stmt(Stmt::Ret(Some(ident("ghost"))))];
        let builtins = HashSet::new();
        assert!(analyze_function(&[], &body, &[], &builtins).is_err());
    }

    #[test]
    fn class_nested_in_function_is_rejected() {
        let body = vec![Node::Decl(Decl::Class {
            name: "Bad".to_string(),
            base: vec![],
            body: vec![],
        })];
        let builtins = HashSet::new();
        assert!(analyze_function(&[], &body, &[], &builtins).is_err());
    }
}
