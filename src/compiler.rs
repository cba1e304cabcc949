//! The bytecode compiler (spec §4.3). Grounded on
//! `original_source/libnim/compile.c`'s unit stack (one `CodeObject`
//! under construction per module/class/function nesting level) and
//! label-patching helper; emission targets the opcode set in `code.rs`.
//!
//! Pattern matching (spec §4.3 "Pattern compilation") compiles to a
//! chain of per-arm tests against a hidden `$subject` local rather than
//! a dedicated instruction -- there is no `MATCH` opcode, so a `match`
//! lowers entirely to `GETITEM`/`CMPEQ`/`JUMPIFFALSE` sequences already
//! in the table, the same way `and`/`or` lower to `DUP`/`JUMPIFTRUE`
//! rather than their own opcodes.

use std::collections::HashSet;
use std::sync::Arc;

use crate::ast::{BinOp, Decl, Expr, ExprKind, Module as AstModule, Node, PatternStmt, Stmt, VarDecl};
use crate::code::{CodeObject, Constant, Opcode};
use crate::error::CompileError;
use crate::symtab::{self, EnclosingScope, ScopeKind};

/// A jump target not yet known at emission time. Every `use_at` site is
/// recorded until `resolve` fixes the address, at which point every
/// recorded site is patched in one pass (spec §4.3 "Label patching").
#[derive(Default)]
struct Label {
    pending: Vec<usize>,
    resolved: Option<u32>,
}

impl Label {
    fn use_at(&mut self, code: &mut CodeObject, site: usize) {
        match self.resolved {
            Some(addr) => code.instructions[site].patch_arg(addr),
            None => self.pending.push(site),
        }
    }

    fn resolve(&mut self, code: &mut CodeObject, addr: usize) {
        for site in self.pending.drain(..) {
            code.instructions[site].patch_arg(addr as u32);
        }
        self.resolved = Some(addr as u32);
    }
}

type Chain = Vec<(ScopeKind, HashSet<String>)>;

struct UnitCompiler<'a> {
    code: CodeObject,
    module: String,
    chain: &'a Chain,
    builtins: &'a HashSet<String>,
    loop_ends: Vec<Label>,
}

const SUBJECT: &str = "$subject";

impl<'a> UnitCompiler<'a> {
    fn new(name: &str, module: &str, chain: &'a Chain, builtins: &'a HashSet<String>) -> Self {
        UnitCompiler { code: CodeObject::new(name), module: module.to_string(), chain, builtins, loop_ends: Vec::new() }
    }

    fn pushname(&mut self, name: &str) {
        let idx = self.code.intern_name(name);
        self.code.emit(Opcode::PUSHNAME, idx);
    }

    fn storename(&mut self, name: &str) {
        let idx = self.code.intern_name(name);
        self.code.emit(Opcode::STORENAME, idx);
    }

    fn push_const(&mut self, c: Constant) {
        let idx = self.code.intern_constant(c);
        self.code.emit(Opcode::PUSHCONST, idx);
    }

    fn emit_node_list(&mut self, body: &[Node]) -> Result<(), CompileError> {
        for n in body {
            self.emit_node(n)?;
        }
        Ok(())
    }

    fn emit_node(&mut self, n: &Node) -> Result<(), CompileError> {
        match n {
            Node::Stmt(s) => self.emit_stmt(s),
            Node::Decl(d) => self.emit_decl(d),
        }
    }

    fn emit_stmt(&mut self, s: &Stmt) -> Result<(), CompileError> {
        match s {
            Stmt::Expr(e) => {
                self.emit_expr(e)?;
                self.code.emit(Opcode::POP, 0);
            }
            Stmt::Assign { target, value } => {
                self.emit_expr(value)?;
                self.storename(target);
            }
            Stmt::If { cond, body, orelse } => {
                self.emit_expr(cond)?;
                let mut else_label = Label::default();
                let mut end_label = Label::default();
                let j = self.code.emit(Opcode::JUMPIFFALSE, 0);
                else_label.use_at(&mut self.code, j);
                self.emit_node_list(body)?;
                let j = self.code.emit(Opcode::JUMP, 0);
                end_label.use_at(&mut self.code, j);
                let here = self.code.here();
                else_label.resolve(&mut self.code, here);
                if let Some(orelse) = orelse {
                    self.emit_node_list(orelse)?;
                }
                let here = self.code.here();
                end_label.resolve(&mut self.code, here);
            }
            Stmt::While { cond, body } => {
                let start = self.code.here();
                self.emit_expr(cond)?;
                let mut end_label = Label::default();
                let j = self.code.emit(Opcode::JUMPIFFALSE, 0);
                end_label.use_at(&mut self.code, j);
                self.loop_ends.push(Label::default());
                self.emit_node_list(body)?;
                self.code.emit(Opcode::JUMP, start as u32);
                let mut finished = self.loop_ends.pop().unwrap();
                let here = self.code.here();
                end_label.resolve(&mut self.code, here);
                finished.resolve(&mut self.code, here);
            }
            Stmt::Match { expr, arms } => self.emit_match(expr, arms)?,
            Stmt::Ret(value) => {
                match value {
                    Some(e) => self.emit_expr(e)?,
                    None => {
                        self.code.emit(Opcode::PUSHNIL, 0);
                    }
                }
                self.code.emit(Opcode::RET, 0);
            }
            Stmt::Break => {
                let j = self.code.emit(Opcode::JUMP, 0);
                match self.loop_ends.last_mut() {
                    Some(label) => label.use_at(&mut self.code, j),
                    None => return Err(CompileError::new("break outside a loop")),
                }
            }
        }
        Ok(())
    }

    fn emit_decl(&mut self, d: &Decl) -> Result<(), CompileError> {
        match d {
            Decl::Var { name, value } => {
                match value {
                    Some(e) => self.emit_expr(e)?,
                    None => {
                        self.code.emit(Opcode::PUSHNIL, 0);
                    }
                }
                self.storename(name);
            }
            Decl::Func { name, args, body } => {
                let code = compile_function(name, &self.module, args, body, self.chain, self.builtins)?;
                let has_free = !code.freevars.is_empty();
                self.push_const(Constant::Method(Arc::new(code)));
                if has_free {
                    self.code.emit(Opcode::MAKECLOSURE, 0);
                }
                self.storename(name);
            }
            Decl::Class { name, base, body } => {
                self.emit_class(name, base, body)?;
            }
            Decl::Use { name } => {
                self.pushname("compile");
                self.push_const(Constant::Str(name.clone()));
                self.code.emit(Opcode::CALL, 1);
                self.storename(name);
            }
        }
        Ok(())
    }

    fn emit_class(&mut self, name: &str, base: &[String], body: &[Decl]) -> Result<(), CompileError> {
        self.pushname("class");
        self.push_const(Constant::Str(name.to_string()));
        match base.len() {
            0 => {
                self.code.emit(Opcode::PUSHNIL, 0);
            }
            1 => self.pushname(&base[0]),
            _ => return Err(CompileError::new("a class may declare at most one base class")),
        }
        let mut count = 0u32;
        for member in body {
            match member {
                Decl::Func { name: mname, args, body } => {
                    self.push_const(Constant::Str(mname.clone()));
                    let code = compile_function(mname, &self.module, args, body, self.chain, self.builtins)?;
                    let has_free = !code.freevars.is_empty();
                    self.push_const(Constant::Method(Arc::new(code)));
                    if has_free {
                        self.code.emit(Opcode::MAKECLOSURE, 0);
                    }
                    count += 1;
                }
                _ => return Err(CompileError::new("a class body may only contain method declarations")),
            }
        }
        self.code.emit(Opcode::MAKEHASH, count);
        self.code.emit(Opcode::CALL, 3);
        self.storename(name);
        Ok(())
    }

    fn emit_expr(&mut self, e: &Expr) -> Result<(), CompileError> {
        match &e.kind {
            ExprKind::Ident(name) if name == "__line__" => self.push_const(Constant::Int(e.span.first_line as i64)),
            ExprKind::Ident(name) if name == "__file__" => self.push_const(Constant::Str(self.module.clone())),
            ExprKind::Ident(name) => self.pushname(name),
            ExprKind::Str(s) => self.push_const(Constant::Str(s.clone())),
            ExprKind::Bool(b) => self.push_const(Constant::Bool(*b)),
            ExprKind::Nil => {
                self.code.emit(Opcode::PUSHNIL, 0);
            }
            ExprKind::Int(i) => self.push_const(Constant::Int(*i)),
            ExprKind::Float(f) => self.push_const(Constant::Float(*f)),
            ExprKind::Not(inner) => {
                self.emit_expr(inner)?;
                self.code.emit(Opcode::NOT, 0);
            }
            ExprKind::BinOp { op: BinOp::Or, left, right } => {
                self.emit_expr(left)?;
                self.code.emit(Opcode::DUP, 0);
                let mut end = Label::default();
                let j = self.code.emit(Opcode::JUMPIFTRUE, 0);
                end.use_at(&mut self.code, j);
                self.code.emit(Opcode::POP, 0);
                self.emit_expr(right)?;
                let here = self.code.here();
                end.resolve(&mut self.code, here);
            }
            ExprKind::BinOp { op: BinOp::And, left, right } => {
                self.emit_expr(left)?;
                self.code.emit(Opcode::DUP, 0);
                let mut end = Label::default();
                let j = self.code.emit(Opcode::JUMPIFFALSE, 0);
                end.use_at(&mut self.code, j);
                self.code.emit(Opcode::POP, 0);
                self.emit_expr(right)?;
                let here = self.code.here();
                end.resolve(&mut self.code, here);
            }
            ExprKind::BinOp { op, left, right } => {
                self.emit_expr(left)?;
                self.emit_expr(right)?;
                let opcode = match op {
                    BinOp::Eq => Opcode::CMPEQ,
                    BinOp::Neq => Opcode::CMPNEQ,
                    BinOp::Gt => Opcode::CMPGT,
                    BinOp::Gte => Opcode::CMPGTE,
                    BinOp::Lt => Opcode::CMPLT,
                    BinOp::Lte => Opcode::CMPLTE,
                    BinOp::Add => Opcode::ADD,
                    BinOp::Sub => Opcode::SUB,
                    BinOp::Mul => Opcode::MUL,
                    BinOp::Div => Opcode::DIV,
                    BinOp::Or | BinOp::And => unreachable!("handled above"),
                };
                self.code.emit(opcode, 0);
            }
            ExprKind::Call { target, args } => {
                self.emit_expr(target)?;
                for a in args {
                    self.emit_expr(a)?;
                }
                self.code.emit(Opcode::CALL, args.len() as u32);
            }
            ExprKind::GetAttr { target, name } => {
                self.emit_expr(target)?;
                let idx = self.code.intern_name(name);
                self.code.emit(Opcode::GETATTR, idx);
            }
            ExprKind::GetItem { target, key } => {
                self.emit_expr(target)?;
                self.emit_expr(key)?;
                self.code.emit(Opcode::GETITEM, 0);
            }
            ExprKind::Array(items) => {
                for i in items {
                    self.emit_expr(i)?;
                }
                self.code.emit(Opcode::MAKEARRAY, items.len() as u32);
            }
            ExprKind::Hash(pairs) => {
                for (k, v) in pairs {
                    self.emit_expr(k)?;
                    self.emit_expr(v)?;
                }
                self.code.emit(Opcode::MAKEHASH, pairs.len() as u32);
            }
            ExprKind::Fn { args, body } => {
                let code = compile_function("<anonymous>", &self.module, args, body, self.chain, self.builtins)?;
                let has_free = !code.freevars.is_empty();
                self.push_const(Constant::Method(Arc::new(code)));
                if has_free {
                    self.code.emit(Opcode::MAKECLOSURE, 0);
                }
            }
            ExprKind::Spawn { target, args } => {
                self.emit_expr(target)?;
                for a in args {
                    self.emit_expr(a)?;
                }
                self.code.emit(Opcode::SPAWN, args.len() as u32);
            }
            ExprKind::Wildcard => return Err(CompileError::new("`_` is only valid inside a pattern")),
        }
        Ok(())
    }

    fn emit_match(&mut self, subject: &Expr, arms: &[PatternStmt]) -> Result<(), CompileError> {
        self.emit_expr(subject)?;
        self.storename(SUBJECT);
        let mut end_label = Label::default();
        for arm in arms {
            let mut fail_label = Label::default();
            self.emit_pattern_test(&arm.test, &[], &mut fail_label)?;
            self.emit_pattern_binds(&arm.test, &[]);
            self.emit_node_list(&arm.body)?;
            let j = self.code.emit(Opcode::JUMP, 0);
            end_label.use_at(&mut self.code, j);
            let here = self.code.here();
            fail_label.resolve(&mut self.code, here);
        }
        self.pushname("__match_fail");
        self.code.emit(Opcode::CALL, 0);
        self.code.emit(Opcode::POP, 0);
        let here = self.code.here();
        end_label.resolve(&mut self.code, here);
        Ok(())
    }

    fn push_subject_at(&mut self, path: &[i64]) {
        self.pushname(SUBJECT);
        for idx in path {
            self.push_const(Constant::Int(*idx));
            self.code.emit(Opcode::GETITEM, 0);
        }
    }

    /// Jumps to `fail` unless the value at `path` is an instance of the
    /// builtin class named `class_name`. Precedes every scalar-literal
    /// pattern's equality test: a subject whose class has no `cmp` slot at
    /// all (an array, a hash, a user instance, ...) would otherwise make
    /// the literal's `CMPNEQ` raise instead of just failing that arm.
    fn emit_class_guard(&mut self, path: &[i64], class_name: &str, fail: &mut Label) {
        self.push_subject_at(path);
        self.code.emit(Opcode::GETCLASS, 0);
        self.pushname(class_name);
        self.code.emit(Opcode::CMPNEQ, 0);
        let j = self.code.emit(Opcode::JUMPIFTRUE, 0);
        fail.use_at(&mut self.code, j);
    }

    /// Emits a test that jumps to `fail` on mismatch, leaving nothing on
    /// the stack on the fall-through (match) path.
    fn emit_pattern_test(&mut self, pat: &Expr, path: &[i64], fail: &mut Label) -> Result<(), CompileError> {
        match &pat.kind {
            ExprKind::Wildcard | ExprKind::Ident(_) => Ok(()),
            ExprKind::Nil => {
                self.emit_class_guard(path, "nil", fail);
                self.push_subject_at(path);
                self.code.emit(Opcode::PUSHNIL, 0);
                self.code.emit(Opcode::CMPNEQ, 0);
                let j = self.code.emit(Opcode::JUMPIFTRUE, 0);
                fail.use_at(&mut self.code, j);
                Ok(())
            }
            ExprKind::Bool(b) => {
                self.emit_class_guard(path, "bool", fail);
                self.push_subject_at(path);
                self.push_const(Constant::Bool(*b));
                self.code.emit(Opcode::CMPNEQ, 0);
                let j = self.code.emit(Opcode::JUMPIFTRUE, 0);
                fail.use_at(&mut self.code, j);
                Ok(())
            }
            ExprKind::Int(i) => {
                self.emit_class_guard(path, "int", fail);
                self.push_subject_at(path);
                self.push_const(Constant::Int(*i));
                self.code.emit(Opcode::CMPNEQ, 0);
                let j = self.code.emit(Opcode::JUMPIFTRUE, 0);
                fail.use_at(&mut self.code, j);
                Ok(())
            }
            ExprKind::Float(f) => {
                self.emit_class_guard(path, "float", fail);
                self.push_subject_at(path);
                self.push_const(Constant::Float(*f));
                self.code.emit(Opcode::CMPNEQ, 0);
                let j = self.code.emit(Opcode::JUMPIFTRUE, 0);
                fail.use_at(&mut self.code, j);
                Ok(())
            }
            ExprKind::Str(s) => {
                self.emit_class_guard(path, "str", fail);
                self.push_subject_at(path);
                self.push_const(Constant::Str(s.clone()));
                self.code.emit(Opcode::CMPNEQ, 0);
                let j = self.code.emit(Opcode::JUMPIFTRUE, 0);
                fail.use_at(&mut self.code, j);
                Ok(())
            }
            ExprKind::Array(items) => {
                if items.len() > crate::symtab::MAX_BIND_PATH_DEPTH {
                    return Err(CompileError::new("pattern nests more than 16 path items deep"));
                }
                self.push_subject_at(path);
                let idx = self.code.intern_name("size");
                self.code.emit(Opcode::GETATTR, idx);
                self.code.emit(Opcode::CALL, 0);
                self.push_const(Constant::Int(items.len() as i64));
                self.code.emit(Opcode::CMPNEQ, 0);
                let j = self.code.emit(Opcode::JUMPIFTRUE, 0);
                fail.use_at(&mut self.code, j);
                for (i, item) in items.iter().enumerate() {
                    let mut subpath = path.to_vec();
                    subpath.push(i as i64);
                    self.emit_pattern_test(item, &subpath, fail)?;
                }
                Ok(())
            }
            ExprKind::Hash(_) => Err(CompileError::new("hash patterns are not supported")),
            _ => Err(CompileError::new("expression is not valid as a pattern")),
        }
    }

    fn emit_pattern_binds(&mut self, pat: &Expr, path: &[i64]) {
        match &pat.kind {
            ExprKind::Ident(name) => {
                self.push_subject_at(path);
                self.storename(name);
            }
            ExprKind::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    let mut subpath = path.to_vec();
                    subpath.push(i as i64);
                    self.emit_pattern_binds(item, &subpath);
                }
            }
            _ => {}
        }
    }
}

fn compile_function(
    name: &str,
    module: &str,
    params: &[VarDecl],
    body: &[Node],
    chain: &Chain,
    builtins: &HashSet<String>,
) -> Result<CodeObject, CompileError> {
    let borrowed: Vec<EnclosingScope> = chain.iter().map(|(k, d)| EnclosingScope { kind: *k, declared: d }).collect();
    let syms = symtab::analyze_function(params, body, &borrowed, builtins)?;

    let mut next_chain = chain.clone();
    next_chain.push((ScopeKind::Function, syms.vars.iter().cloned().collect()));

    let mut unit = UnitCompiler::new(name, module, &next_chain, builtins);
    unit.code.vars = syms.vars;
    unit.code.freevars = syms.freevars;
    unit.emit_node_list(body)?;
    unit.code.emit(Opcode::PUSHNIL, 0);
    unit.code.emit(Opcode::RET, 0);
    Ok(unit.code)
}

/// Compile a module's top level: `uses` first (each auto-loads and binds
/// its module by name), then `body` declarations in order, followed by
/// an implicit `nil` return (spec §4.4 "loading a module").
pub fn compile_module(name: &str, module: &AstModule) -> Result<CodeObject, CompileError> {
    let builtins = crate::builtins::builtin_names();
    let module_decls: HashSet<String> = module
        .uses
        .iter()
        .chain(module.body.iter())
        .map(|d| match d {
            Decl::Func { name, .. } | Decl::Class { name, .. } | Decl::Use { name } => name.clone(),
            Decl::Var { name, .. } => name.clone(),
        })
        .collect();
    let chain: Chain = vec![(ScopeKind::Module, module_decls)];

    let mut unit = UnitCompiler::new(name, name, &chain, &builtins);
    for use_decl in &module.uses {
        unit.emit_decl(use_decl)?;
    }
    for decl in &module.body {
        unit.emit_decl(decl)?;
    }
    unit.code.emit(Opcode::PUSHNIL, 0);
    unit.code.emit(Opcode::RET, 0);
    Ok(unit.code)
}
