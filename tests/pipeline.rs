//! Whole-pipeline integration scenarios (§8 testable properties), each one
//! driving `compile::expr`/`compile::stmt` the way `Compiler` does
//! internally, then running the resulting thunk against a real frame.

use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use gothunk::ast::{self, BinOp, CompositeElt, Expr, ExprKind, Lit, TypeExpr};
use gothunk::compile::stmt::compile_stmt;
use gothunk::compile::{expr::compile_expr, Ctx};
use gothunk::env::{Frame, PackageFrame};
use gothunk::error::Pos;
use gothunk::symtab::{BindingKind, ConstValue};
use gothunk::types::constant::Constant;
use gothunk::types::registry::{IntWidth, Registry};
use gothunk::types::value::{Handle, Prim, Value};

fn root_env(reg: &Registry) -> Rc<Frame> {
  Frame::new_package(PackageFrame::stdout("main"), 0, Value::new(reg.int(IntWidth::Int), Prim::Int(0)))
}

fn ident(name: &str) -> Expr { Expr { pos: Pos::NONE, kind: ExprKind::Ident(name.into()) } }
fn int_lit(n: i64) -> Expr { Expr { pos: Pos::NONE, kind: ExprKind::Lit(Lit::Int(num::BigInt::from(n))) } }
fn string_lit(s: &str) -> Expr { Expr { pos: Pos::NONE, kind: ExprKind::Lit(Lit::String(s.into())) } }

fn call(name: &str, args: Vec<Expr>, ellipsis: bool) -> Expr {
  Expr { pos: Pos::NONE, kind: ExprKind::Call { func: Box::new(ident(name)), args, ellipsis } }
}

fn slice_lit(elem: TypeExpr, elems: Vec<Expr>) -> Expr {
  Expr {
    pos: Pos::NONE,
    kind: ExprKind::CompositeLit {
      ty: Some(TypeExpr::Slice(Box::new(elem))),
      elements: elems.into_iter().map(|value| CompositeElt { key: None, value }).collect(),
    },
  }
}

#[test]
fn iota_group_numbering() {
  let reg = Registry::new();
  let mut ctx = Ctx::new(&reg);
  let spec = |name: &str| ast::ConstSpec { pos: Pos::NONE, names: vec![name.into()], ty: None, values: vec![ident("iota")] };
  let decl = ast::Stmt { pos: Pos::NONE, label: None, kind: ast::StmtKind::ConstDecl(vec![spec("a"), spec("b"), spec("c")]) };
  let _ = compile_stmt(&mut ctx, &decl);
  assert!(ctx.errors.is_empty(), "unexpected errors: {:?}", ctx.errors);

  for (name, want) in [("a", 0), ("b", 1), ("c", 2)] {
    let (binding, _depth) = ctx.sym.resolve(name).unwrap_or_else(|| panic!("{name} not declared"));
    let BindingKind::Const(ConstValue::Untyped(Constant::Int(n))) = &binding.kind else {
      panic!("{name} is not an untyped int constant: {:?}", binding.kind)
    };
    assert_eq!(*n, num::BigInt::from(want));
  }
}

#[test]
fn append_grows_past_capacity_without_aliasing_the_original() {
  let reg = Registry::new();
  let mut ctx = Ctx::new(&reg);
  let env = root_env(&reg);

  let base = slice_lit(TypeExpr::Named("int".into()), vec![int_lit(1), int_lit(2)]);
  let appended = call("append", vec![base, int_lit(3), int_lit(4)], false);
  let compiled = compile_expr(&mut ctx, &appended).expect("append compiles");
  assert!(ctx.errors.is_empty());

  let v = compiled.fun.eval(&compiled.ty, &env);
  let Prim::Handle(Handle::Slice(s)) = v.prim else { panic!("append did not produce a slice") };
  assert_eq!(s.len, 4);
  let want: Vec<i64> = vec![1, 2, 3, 4];
  let got: Vec<i64> = s.as_slice().iter().map(|v| match v.prim { Prim::Int(n) => n, _ => panic!("non-int element") }).collect();
  assert_eq!(got, want);
}

#[test]
fn map_insert_lookup_then_delete() {
  let reg = Registry::new();
  let mut ctx = Ctx::new(&reg);
  let env = root_env(&reg);

  let map_lit = Expr {
    pos: Pos::NONE,
    kind: ExprKind::CompositeLit {
      ty: Some(TypeExpr::Map(Box::new(TypeExpr::Named("string".into())), Box::new(TypeExpr::Named("int".into())))),
      elements: vec![CompositeElt { key: Some(string_lit("x")), value: int_lit(42) }],
    },
  };

  // m := map[string]int{"x": 42}
  let decl = ast::Stmt { pos: Pos::NONE, label: None, kind: ast::StmtKind::ShortVarDecl { names: vec!["m".into()], rhs: vec![map_lit] } };
  let decl_thunk = compile_stmt(&mut ctx, &decl);
  assert!(ctx.errors.is_empty(), "unexpected errors: {:?}", ctx.errors);
  decl_thunk(&env);

  let lookup = Expr { pos: Pos::NONE, kind: ExprKind::Index { x: Box::new(ident("m")), index: Box::new(string_lit("x")) } };
  let lookup_compiled = compile_expr(&mut ctx, &lookup).expect("map index compiles");
  let v = lookup_compiled.fun.eval(&lookup_compiled.ty, &env);
  assert!(matches!(v.prim, Prim::Int(42)));

  let delete = call("delete", vec![ident("m"), string_lit("x")], false);
  let delete_compiled = compile_expr(&mut ctx, &delete).expect("delete compiles");
  delete_compiled.fun.eval(&delete_compiled.ty, &env);

  let v2 = lookup_compiled.fun.eval(&lookup_compiled.ty, &env);
  assert!(matches!(v2.prim, Prim::Int(0)), "key should be gone after delete");
}

#[test]
fn copy_truncates_to_the_shorter_length() {
  let reg = Registry::new();
  let mut ctx = Ctx::new(&reg);
  let env = root_env(&reg);

  let dst_lit = slice_lit(TypeExpr::Named("byte".into()), vec![int_lit(0), int_lit(0), int_lit(0), int_lit(0), int_lit(0)]);
  let decl = ast::Stmt { pos: Pos::NONE, label: None, kind: ast::StmtKind::ShortVarDecl { names: vec!["dst".into()], rhs: vec![dst_lit] } };
  let decl_thunk = compile_stmt(&mut ctx, &decl);
  assert!(ctx.errors.is_empty(), "unexpected errors: {:?}", ctx.errors);
  decl_thunk(&env);

  let n = call("copy", vec![ident("dst"), string_lit("hi")], false);
  let compiled = compile_expr(&mut ctx, &n).expect("copy compiles");
  let count = compiled.fun.eval(&compiled.ty, &env);
  assert!(matches!(count.prim, Prim::Int(2)));

  let dst_read = compile_expr(&mut ctx, &ident("dst")).expect("dst resolves");
  let v = dst_read.fun.eval(&dst_read.ty, &env);
  let Prim::Handle(Handle::Slice(s)) = v.prim else { panic!("dst is not a slice") };
  let bytes: Vec<u8> = s.as_slice().iter().map(|v| match v.prim { Prim::U8(b) => b, _ => panic!("non-byte element") }).collect();
  assert_eq!(bytes, vec![b'h', b'i', 0, 0, 0]);
}

#[test]
fn complex_literal_constant_folds() {
  let reg = Registry::new();
  let mut ctx = Ctx::new(&reg);
  let env = root_env(&reg);

  let e = call("complex", vec![int_lit(3), int_lit(4)], false);
  let compiled = compile_expr(&mut ctx, &e).expect("complex compiles");
  assert!(compiled.is_const, "complex(3, 4) of two constants should fold at compile time");
  assert!(matches!(compiled.const_value, Some(Constant::Complex(..))));

  let v = compiled.fun.eval(&compiled.ty, &env);
  assert!(matches!(v.prim, Prim::C128(re, im) if re == 3.0 && im == 4.0));
}

#[test]
fn division_by_zero_is_a_compile_error_for_constants() {
  let reg = Registry::new();
  let mut ctx = Ctx::new(&reg);

  let e = Expr { pos: Pos::NONE, kind: ExprKind::Binary { op: BinOp::Div, x: Box::new(int_lit(10)), y: Box::new(int_lit(0)) } };
  let result = compile_expr(&mut ctx, &e);
  assert!(result.is_err());
  assert!(ctx.errors.iter().any(|e| matches!(e, gothunk::error::CompileError::DivisionByZero { .. })), "errors were: {:?}", ctx.errors);
}

#[test]
fn division_by_zero_is_a_runtime_panic_for_variables() {
  let reg = Registry::new();
  let mut ctx = Ctx::new(&reg);
  let env = root_env(&reg);

  let decl = ast::Stmt { pos: Pos::NONE, label: None, kind: ast::StmtKind::ShortVarDecl { names: vec!["zero".into()], rhs: vec![int_lit(0)] } };
  let decl_thunk = compile_stmt(&mut ctx, &decl);
  assert!(ctx.errors.is_empty(), "unexpected errors: {:?}", ctx.errors);
  decl_thunk(&env);

  let e = Expr { pos: Pos::NONE, kind: ExprKind::Binary { op: BinOp::Div, x: Box::new(int_lit(10)), y: Box::new(ident("zero")) } };
  let compiled = compile_expr(&mut ctx, &e).expect("dividing by a variable is allowed at compile time");
  assert!(ctx.errors.is_empty());

  let env_for_panic = env.clone();
  let result = panic::catch_unwind(AssertUnwindSafe(|| compiled.fun.eval(&compiled.ty, &env_for_panic)));
  assert!(result.is_err(), "dividing by a runtime zero should panic with RuntimeError::DivisionByZero");
}
