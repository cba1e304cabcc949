//! End-to-end tests: hand-built `ast::Module` trees run through the
//! compiler and the VM, covering spec §8's worked scenarios. There is no
//! parser in this crate (see `ast.rs`'s module doc), so these trees
//! stand in for source text the way a snapshot of a parser's output
//! would.

use std::io::Write;
use std::sync::{Arc, Mutex};

use vela::ast::{BinOp, Decl, Expr, ExprKind, Module, Node, PatternStmt, Span, Stmt};
use vela::value::Value;
use vela::vm::Vm;

fn sp() -> Span {
    Span::default()
}
fn e(kind: ExprKind) -> Expr {
    Expr::new(kind, sp())
}
fn ident(name: &str) -> Expr {
    e(ExprKind::Ident(name.to_string()))
}
fn int(i: i64) -> Expr {
    e(ExprKind::Int(i))
}

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);
impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn run_main(module: Module) -> (Vm, vela::value::Ref) {
    let mut vm = Vm::new();
    vm.module_sources.insert("main".to_string(), module);
    let m = vela::module::load_module(&mut vm, "main").unwrap();
    (vm, m)
}

/// `1 + 2 * 3` respects precedence (the tree is already parenthesized the
/// way a real parser would produce it) and stays an int; mixing in a
/// float promotes the whole expression (spec §8).
#[test]
fn arithmetic_precedence_and_promotion() {
    let mul = e(ExprKind::BinOp { op: BinOp::Mul, left: Box::new(int(2)), right: Box::new(int(3)) });
    let add = e(ExprKind::BinOp { op: BinOp::Add, left: Box::new(int(1)), right: Box::new(mul) });
    let module = Module {
        uses: vec![],
        body: vec![Decl::Func { name: "main".to_string(), args: vec![], body: vec![Node::Stmt(Stmt::Ret(Some(add)))] }],
    };
    let (mut vm, m) = run_main(module);
    let main_fn = vm.get_attr(m, "main").unwrap();
    let result = vm.call_value(main_fn, &[]).unwrap();
    assert!(matches!(vm.heap.get(result), Value::Int(7)));

    let float_mix = e(ExprKind::BinOp { op: BinOp::Add, left: Box::new(int(1)), right: Box::new(e(ExprKind::Float(0.5))) });
    let module = Module {
        uses: vec![],
        body: vec![Decl::Func { name: "main".to_string(), args: vec![], body: vec![Node::Stmt(Stmt::Ret(Some(float_mix)))] }],
    };
    let (mut vm, m) = run_main(module);
    let main_fn = vm.get_attr(m, "main").unwrap();
    let result = vm.call_value(main_fn, &[]).unwrap();
    assert!(matches!(vm.heap.get(result), Value::Float(f) if (*f - 1.5).abs() < 1e-9));
}

/// A closure over a mutable outer local observes later mutations through
/// the shared `Var` cell (spec §4.4's var-cell-indirection invariant).
#[test]
fn closure_captures_mutable_cell() {
    // fn make() { var n = 1; fn bump() { n = n + 1; return n } return bump }
    let bump_body = vec![
        Node::Stmt(Stmt::Assign {
            target: "n".to_string(),
            value: e(ExprKind::BinOp { op: BinOp::Add, left: Box::new(ident("n")), right: Box::new(int(1)) }),
        }),
        Node::Stmt(Stmt::Ret(Some(ident("n")))),
    ];
    let make_body = vec![
        Node::Decl(Decl::Var { name: "n".to_string(), value: Some(int(1)) }),
        Node::Decl(Decl::Func { name: "bump".to_string(), args: vec![], body: bump_body }),
        Node::Stmt(Stmt::Ret(Some(ident("bump")))),
    ];
    let module = Module {
        uses: vec![],
        body: vec![Decl::Func { name: "make".to_string(), args: vec![], body: make_body }],
    };
    let (mut vm, m) = run_main(module);
    let make_fn = vm.get_attr(m, "make").unwrap();
    let bump = vm.call_value(make_fn, &[]).unwrap();
    let first = vm.call_value(bump, &[]).unwrap();
    let second = vm.call_value(bump, &[]).unwrap();
    assert!(matches!(vm.heap.get(first), Value::Int(2)));
    assert!(matches!(vm.heap.get(second), Value::Int(3)));
}

/// `and` short-circuits: the right side never runs once the left side is
/// falsy (spec §8).
#[test]
fn and_short_circuits() {
    let side_effect_body = vec![
        Node::Decl(Decl::Var { name: "hit".to_string(), value: Some(e(ExprKind::Bool(false))) }),
        Node::Stmt(Stmt::If {
            cond: e(ExprKind::BinOp {
                op: BinOp::And,
                left: Box::new(e(ExprKind::Bool(false))),
                right: Box::new(e(ExprKind::Bool(true))),
            }),
            body: vec![Node::Stmt(Stmt::Assign { target: "hit".to_string(), value: e(ExprKind::Bool(true)) })],
            orelse: None,
        }),
        Node::Stmt(Stmt::Ret(Some(ident("hit")))),
    ];
    let module = Module {
        uses: vec![],
        body: vec![Decl::Func { name: "main".to_string(), args: vec![], body: side_effect_body }],
    };
    let (mut vm, m) = run_main(module);
    let main_fn = vm.get_attr(m, "main").unwrap();
    let result = vm.call_value(main_fn, &[]).unwrap();
    assert!(matches!(vm.heap.get(result), Value::Bool(false)));
}

/// A `match` with an array pattern destructures by position and binds
/// names from the matched arm (spec §6.1 pattern matching).
#[test]
fn match_destructures_array_pattern() {
    let pattern = e(ExprKind::Array(vec![ident("a"), ident("b")]));
    let arm = PatternStmt { test: pattern, body: vec![Node::Stmt(Stmt::Ret(Some(e(ExprKind::BinOp {
        op: BinOp::Add,
        left: Box::new(ident("a")),
        right: Box::new(ident("b")),
    }))))] };
    let subject = e(ExprKind::Array(vec![int(10), int(32)]));
    let body = vec![Node::Stmt(Stmt::Match { expr: subject, arms: vec![arm] })];
    let module = Module {
        uses: vec![],
        body: vec![Decl::Func { name: "main".to_string(), args: vec![], body }],
    };
    let (mut vm, m) = run_main(module);
    let main_fn = vm.get_attr(m, "main").unwrap();
    let result = vm.call_value(main_fn, &[]).unwrap();
    assert!(matches!(vm.heap.get(result), Value::Int(42)));
}

/// A `match` that falls through every arm raises a runtime error rather
/// than silently returning `nil` (no opcode backs this directly -- it's
/// the hidden `__match_fail` builtin, see DESIGN.md).
#[test]
fn match_with_no_arm_matching_is_a_runtime_error() {
    let arm = PatternStmt { test: int(1), body: vec![Node::Stmt(Stmt::Ret(Some(int(0))))] };
    let body = vec![Node::Stmt(Stmt::Match { expr: int(2), arms: vec![arm] })];
    let module = Module {
        uses: vec![],
        body: vec![Decl::Func { name: "main".to_string(), args: vec![], body }],
    };
    let (mut vm, m) = run_main(module);
    let main_fn = vm.get_attr(m, "main").unwrap();
    assert!(vm.call_value(main_fn, &[]).is_err());
}

/// A literal pattern arm whose type doesn't match the subject's falls
/// through to the next arm instead of raising mid-`match` (the class
/// guard `compiler.rs`'s `emit_class_guard` inserts ahead of the
/// literal's equality test).
#[test]
fn match_falls_through_on_cross_type_literal_arm() {
    let int_arm = PatternStmt { test: int(1), body: vec![Node::Stmt(Stmt::Ret(Some(int(111))))] };
    let wildcard_arm =
        PatternStmt { test: e(ExprKind::Wildcard), body: vec![Node::Stmt(Stmt::Ret(Some(int(222))))] };
    let body = vec![Node::Stmt(Stmt::Match {
        expr: e(ExprKind::Str("x".to_string())),
        arms: vec![int_arm, wildcard_arm],
    })];
    let module = Module {
        uses: vec![],
        body: vec![Decl::Func { name: "main".to_string(), args: vec![], body }],
    };
    let (mut vm, m) = run_main(module);
    let main_fn = vm.get_attr(m, "main").unwrap();
    let result = vm.call_value(main_fn, &[]).unwrap();
    assert!(matches!(vm.heap.get(result), Value::Int(222)));
}

/// Loading the same module twice in one task reuses the cached `Module`
/// ref rather than re-running its top level (spec §8 invariant).
#[test]
fn loading_a_module_twice_is_idempotent() {
    let module = Module {
        uses: vec![],
        body: vec![Decl::Var { name: "count".to_string(), value: Some(int(1)) }],
    };
    let mut vm = Vm::new();
    vm.module_sources.insert("once".to_string(), module);
    let a = vela::module::load_module(&mut vm, "once").unwrap();
    let b = vela::module::load_module(&mut vm, "once").unwrap();
    assert_eq!(a, b);
}

/// `print` writes through the VM's injectable `stdout` sink.
#[test]
fn print_writes_to_injected_sink() {
    let body = vec![Node::Stmt(Stmt::Expr(e(ExprKind::Call {
        target: Box::new(ident("print")),
        args: vec![e(ExprKind::Str("hello".to_string()))],
    })))];
    let module = Module {
        uses: vec![],
        body: vec![Decl::Func { name: "main".to_string(), args: vec![], body }],
    };
    let mut vm = Vm::new();
    let buf = SharedBuf::default();
    vm.stdout = Box::new(buf.clone());
    vm.module_sources.insert("main".to_string(), module);
    let m = vela::module::load_module(&mut vm, "main").unwrap();
    let main_fn = vm.get_attr(m, "main").unwrap();
    vm.call_value(main_fn, &[]).unwrap();
    let out = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
    assert_eq!(out, "hello\n");
}
