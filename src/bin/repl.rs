//! A small driver that exercises [`gothunk::Compiler`] end to end.
//!
//! This crate has no source-level parser of its own (§1, §6: lexing, parsing
//! and macro expansion are external collaborators that translate into the
//! `ast` module) so this binary does not read Go-like source text from
//! stdin. Instead it builds a tiny demonstration package directly from the
//! `ast` types, compiles it, and calls into it the way an embedder would,
//! reporting `CompileError`s the same way a real frontend's diagnostics
//! would surface them.

use std::io::{self, Write};
use std::rc::Rc;

use gothunk::ast::{self, BinOp, Block, Expr, ExprKind, FuncDecl, FuncSig, Lit, ParamDecl, Stmt, StmtKind, TypeExpr};
use gothunk::error::Pos;
use gothunk::types::registry::IntWidth;
use gothunk::types::value::{Prim, Value};
use gothunk::{Compiler, Config};
use num::BigInt;

#[cfg(feature = "cli-logging")]
fn install_logger() {
  use simplelog::{ColorChoice, Config as LogConfig, LevelFilter, TermLogger, TerminalMode};
  // Falls back to no logging at all if stderr isn't a real terminal;
  // `log::warn!`/`log::debug!` calls throughout the compiler then become
  // silent rather than panicking on a failed logger install.
  let _ = TermLogger::init(LevelFilter::Debug, LogConfig::default(), TerminalMode::Stderr, ColorChoice::Auto);
}

#[cfg(not(feature = "cli-logging"))]
fn install_logger() {
  // No `log::Log` installed: the `log` crate's default no-op backend
  // discards every record. Build with `--features cli-logging` to see
  // the compiler's `log::debug!`/`log::warn!` trail on stderr.
}

fn ident(name: &str) -> Expr { Expr { pos: Pos::NONE, kind: ExprKind::Ident(name.into()) } }
fn int_lit(n: i64) -> Expr { Expr { pos: Pos::NONE, kind: ExprKind::Lit(Lit::Int(BigInt::from(n))) } }
fn int_ty() -> TypeExpr { TypeExpr::Named("int".into()) }

fn param(name: &str) -> ParamDecl { ParamDecl { name: Some(name.into()), ty: int_ty() } }
fn result() -> ParamDecl { ParamDecl { name: None, ty: int_ty() } }

fn ret(e: Expr) -> Stmt { Stmt { pos: Pos::NONE, label: None, kind: StmtKind::Return(vec![e]) } }

fn binary(op: BinOp, x: Expr, y: Expr) -> Expr {
  Expr { pos: Pos::NONE, kind: ExprKind::Binary { op, x: Box::new(x), y: Box::new(y) } }
}

fn call(func: &str, args: Vec<Expr>) -> Expr {
  Expr { pos: Pos::NONE, kind: ExprKind::Call { func: Box::new(ident(func)), args, ellipsis: false } }
}

/// `func fib(n int) int { if n < 2 { return n }; return fib(n-1) + fib(n-2) }`
fn fib_decl() -> Stmt {
  let sig = Rc::new(FuncSig { params: vec![param("n")], results: vec![result()], variadic: false });
  let body: Block = vec![
    Stmt {
      pos: Pos::NONE,
      label: None,
      kind: StmtKind::If { init: None, cond: binary(BinOp::Lt, ident("n"), int_lit(2)), then: vec![ret(ident("n"))], els: None },
    },
    ret(binary(
      BinOp::Add,
      call("fib", vec![binary(BinOp::Sub, ident("n"), int_lit(1))]),
      call("fib", vec![binary(BinOp::Sub, ident("n"), int_lit(2))]),
    )),
  ];
  Stmt { pos: Pos::NONE, label: None, kind: StmtKind::FuncDecl(Rc::new(FuncDecl { pos: Pos::NONE, name: "fib".into(), receiver: None, sig, body: Some(body) })) }
}

fn main() -> io::Result<()> {
  install_logger();

  let compiler = Compiler::new(Config::default());
  let decls = vec![fib_decl()];
  match compiler.compile_package(&decls, Box::new(io::stdout())) {
    Ok(pkg) => {
      let reg = compiler.registry();
      for n in 0..10i64 {
        let arg = Value::new(reg.int(IntWidth::Int), Prim::Int(n));
        match pkg.call("fib", &[arg]) {
          Ok(result) => {
            if let Prim::Int(v) = result[0].prim {
              println!("fib({n}) = {v}");
            }
          }
          Err(e) => eprintln!("call error: {e}"),
        }
      }
      Ok(())
    }
    Err(errors) => {
      let mut stderr = io::stderr();
      for e in &errors {
        writeln!(stderr, "{e}")?;
      }
      std::process::exit(1);
    }
  }
}
