//! `gothunk`: an interpreter core for a statically-typed C-family language
//! with Lisp-style macros (§1). This crate owns type registration, symbol
//! resolution, the expression/statement compiler, and the lexical
//! environment the compiled thunks run against; a surface parser and macro
//! expander are external collaborators (§1, §6) that translate into the
//! `ast` module this crate consumes.
//!
//! [`Compiler`] is the crate's package-level entry point: it seeds a fresh
//! compilation unit with the bridged host packages (`reflect`), compiles
//! every top-level declaration in two passes so forward references and
//! mutual recursion among top-level functions resolve (§4.4 `FuncState`),
//! and materializes the result as a [`CompiledPackage`] ready to call into.

pub mod ast;
pub mod compile;
pub mod env;
pub mod error;
pub mod reflect;
pub mod symtab;
pub mod types;

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use hashbrown::HashMap;

use crate::compile::{Ctx, FuncState, MethodInfo};
use crate::env::{Frame, PackageFrame, SlotAddr};
use crate::error::CompileError;
use crate::reflect::PackageRegistry;
use crate::types::registry::{Kind, Registry, Type};
use crate::types::value::{FuncResult, Handle, Prim, Value};

/// Embedder-facing knobs a host swaps without touching the compiler
/// itself (§1 "a small `Config`").
pub struct Config {
  /// If `false` (the default), a constant expression that overflows its
  /// target type is demoted from a compile error to a logged warning and
  /// the overflowing value is kept; if `true`, it surfaces in the returned
  /// error list like any other `CompileError` (§7 policy is otherwise
  /// silent on this, left to the embedder).
  pub overflow_is_fatal: bool,
  /// Import search path the host's package loader would consult; this
  /// crate has no file-system package loader of its own (§6 "Package
  /// registry" is populated programmatically via [`Compiler::packages`]),
  /// so this is carried only as a stub an embedder can read back.
  pub search_path: Vec<String>,
}

impl Default for Config {
  fn default() -> Self { Self { overflow_is_fatal: false, search_path: Vec::new() } }
}

/// One package's compiled state: its root frame (§4.6 "the package frame")
/// and the slot each top-level function landed in.
pub struct CompiledPackage {
  pub frame: Rc<Frame>,
  pub funcs: HashMap<Rc<str>, SlotAddr>,
}

impl CompiledPackage {
  #[must_use] pub fn get_func(&self, name: &str) -> Option<Value> {
    self.funcs.get(name).map(|addr| self.frame.get(*addr))
  }

  /// Looks up a top-level function by name and invokes it directly,
  /// bypassing the expression compiler (for embedders driving the package
  /// from host code rather than from compiled interpreted call sites).
  pub fn call(&self, name: &str, args: &[Value]) -> Result<FuncResult, String> {
    let v = self.get_func(name).ok_or_else(|| format!("no top-level function named {name}"))?;
    match v.prim {
      Prim::Handle(Handle::Func(f)) => Ok((f.call)(args)),
      _ => Err(format!("{name} is not a function")),
    }
  }
}

/// Owns the type registry and the bridged package registry for one
/// interpreter instance (§1, §4.7). Cheap to construct; expensive state
/// (interned types, bridged packages) lives for the `Compiler`'s lifetime
/// so repeated `compile_package` calls share one type universe.
pub struct Compiler {
  reg: Registry,
  packages: PackageRegistry,
  config: Config,
}

impl Compiler {
  #[must_use] pub fn new(config: Config) -> Self {
    let reg = Registry::new();
    let packages = reflect::default_registry(&reg);
    Self { reg, packages, config }
  }

  #[must_use] pub fn registry(&self) -> &Registry { &self.reg }
  #[must_use] pub fn packages(&self) -> &PackageRegistry { &self.packages }
  #[must_use] pub fn config(&self) -> &Config { &self.config }

  /// Compiles one package's top-level declarations and runs its
  /// initializers, producing a [`CompiledPackage`] whose functions are
  /// ready to call. `decls` holds only declaration-kind statements
  /// (`ConstDecl`/`VarDecl`/`TypeDecl`/`FuncDecl`) — anything else is a
  /// caller error since the source grammar never nests other statement
  /// kinds at package scope.
  pub fn compile_package(&self, decls: &[ast::Stmt], writer: Box<dyn Write>) -> Result<CompiledPackage, Vec<CompileError>> {
    let mut ctx = Ctx::new(&self.reg);
    for path in self.packages.paths() {
      if let Some(pkg) = self.packages.get(&path) {
        for (key, info) in &pkg.methods {
          ctx.methods.insert(key.clone(), info.clone());
        }
        ctx.imports.insert(path, pkg);
      }
    }

    let mut func_decls: Vec<Rc<ast::FuncDecl>> = Vec::new();
    let mut type_decls: Vec<&ast::Stmt> = Vec::new();
    let mut prelude: Vec<&ast::Stmt> = Vec::new();
    for s in decls {
      match &s.kind {
        ast::StmtKind::FuncDecl(fd) => func_decls.push(fd.clone()),
        ast::StmtKind::TypeDecl(_) => type_decls.push(s),
        _ => prelude.push(s),
      }
    }

    // Named types are declared before anything that might reference them
    // by name — a function signature, a receiver, or a `var`/`const`
    // type annotation — regardless of where in the file they appear.
    // `compile::stmt`'s `TypeDecl` arm performs its registry/symbol-table
    // side effects immediately, so nothing further needs running here.
    for s in &type_decls {
      compile::stmt::compile_stmt(&mut ctx, s);
    }

    // Pass 1 (§4.4 FuncState::PendingSignature): every function's
    // signature is resolved and its name bound — to a package-scope slot
    // for a plain function, to `ctx.methods` for one with a receiver —
    // before any body is compiled, so a later declaration can call an
    // earlier one and vice versa.
    let mut plain: Vec<(Rc<ast::FuncDecl>, Type, SlotAddr)> = Vec::new();
    type MethodCell = Rc<RefCell<Option<Rc<dyn Fn(&[Value]) -> FuncResult>>>>;
    let mut methods: Vec<(Rc<ast::FuncDecl>, Rc<ast::FuncSig>, MethodCell)> = Vec::new();
    let mut states: HashMap<Rc<str>, FuncState> = HashMap::new();

    for fd in &func_decls {
      states.insert(fd.name.clone(), FuncState::PendingSignature);
      if let Some(recv) = &fd.receiver {
        let Ok(recv_ty) = compile::expr::resolve_type(&mut ctx, &recv.ty) else { continue };
        let Some(uid) = compile::expr::named_uid(&recv_ty) else {
          let _ = ctx.err::<()>(CompileError::UndeclaredIdent { pos: fd.pos, name: fd.name.to_string() });
          continue;
        };
        let mut recv_sig = (*fd.sig).clone();
        recv_sig.params.insert(0, recv.clone());
        let recv_sig = Rc::new(recv_sig);
        let Ok(fn_sig) = compile::expr::resolve_func_sig(&mut ctx, &recv_sig) else { continue };
        let fn_ty = self.reg.intern(Kind::Function(fn_sig));
        let cell: MethodCell = Rc::new(RefCell::new(None));
        let trampoline = cell.clone();
        let info = Rc::new(MethodInfo {
          sig: fn_ty,
          call: Rc::new(move |args: &[Value]| {
            (trampoline.borrow().as_ref().expect("method body not yet materialized (compiler bug)"))(args)
          }),
        });
        ctx.methods.insert((uid, fd.name.clone()), info);
        methods.push((fd.clone(), recv_sig, cell));
      } else {
        let Ok(fn_sig) = compile::expr::resolve_func_sig(&mut ctx, &fd.sig) else { continue };
        let fn_ty = self.reg.intern(Kind::Function(fn_sig));
        let Ok(addr) = ctx.ok(ctx.sym.declare_func(fd.pos, fd.name.clone(), fn_ty.clone())) else { continue };
        plain.push((fd.clone(), fn_ty, addr));
      }
    }

    // Top-level const/var/type declarations, compiled in source order; a
    // `var` initializer that calls a function declared later in the file
    // still resolves, since pass 1 already bound every function's slot.
    let mut prelude_thunks = Vec::with_capacity(prelude.len());
    for s in &prelude {
      prelude_thunks.push(compile::stmt::compile_stmt(&mut ctx, s));
    }

    // Pass 2 (BodyCompiling -> Complete): compile each body now that every
    // top-level name is resolvable, whichever order the declarations were
    // written in.
    let mut plain_thunks = Vec::with_capacity(plain.len());
    for (fd, fn_ty, addr) in &plain {
      states.insert(fd.name.clone(), FuncState::BodyCompiling);
      let Some(body) = &fd.body else {
        let _ = ctx.err::<()>(CompileError::UndeclaredIdent { pos: fd.pos, name: fd.name.to_string() });
        continue;
      };
      if let Ok(compiled) = compile::expr::compile_func_lit(&mut ctx, &fd.sig, body) {
        plain_thunks.push((*addr, fn_ty.clone(), compiled.fun));
        states.insert(fd.name.clone(), FuncState::Complete);
      }
    }

    let mut method_thunks = Vec::with_capacity(methods.len());
    for (fd, recv_sig, cell) in &methods {
      states.insert(fd.name.clone(), FuncState::BodyCompiling);
      let Some(body) = &fd.body else {
        let _ = ctx.err::<()>(CompileError::UndeclaredIdent { pos: fd.pos, name: fd.name.to_string() });
        continue;
      };
      if let Ok(compiled) = compile::expr::compile_func_lit(&mut ctx, recv_sig, body) {
        method_thunks.push((cell.clone(), compiled.fun));
        states.insert(fd.name.clone(), FuncState::Complete);
      }
    }
    log::debug!("compiled {} top-level function(s), {} still pending after errors", states.values().filter(|s| **s == FuncState::Complete).count(), states.values().filter(|s| **s != FuncState::Complete).count());

    let mut errors = ctx.errors;
    if !self.config.overflow_is_fatal {
      errors.retain(|e| {
        if matches!(e, CompileError::ConstantOverflow { .. }) {
          log::warn!("treating as non-fatal per Config::overflow_is_fatal=false: {e}");
          false
        } else {
          true
        }
      });
    }
    if !errors.is_empty() {
      return Err(errors);
    }

    let nslots = ctx.sym.current_scope_slots();
    let zero = Value::new(self.reg.bool(), Prim::Bool(false));
    let package_frame = PackageFrame::new("main", writer);
    let frame = Frame::new_package(package_frame, nslots as usize, zero);

    let mut funcs = HashMap::new();
    for (addr, fn_ty, fun) in plain_thunks {
      let handle = match fun {
        compile::Thunk::Handle(f) => f(&frame),
        _ => unreachable!("a function literal always compiles to Thunk::Handle"),
      };
      frame.set(addr, Value::new(fn_ty, Prim::Handle(handle)));
    }
    for (fd, _fn_ty, addr) in &plain {
      funcs.insert(fd.name.clone(), *addr);
    }
    for (cell, fun) in method_thunks {
      let handle = match fun {
        compile::Thunk::Handle(f) => f(&frame),
        _ => unreachable!("a function literal always compiles to Thunk::Handle"),
      };
      let Handle::Func(data) = handle else { unreachable!("method literal always compiles to Handle::Func") };
      *cell.borrow_mut() = Some(Rc::new(move |args: &[Value]| (data.call)(args)));
    }

    for thunk in &prelude_thunks {
      let _ = thunk(&frame);
    }

    Ok(CompiledPackage { frame, funcs })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::Pos;
  use crate::types::registry::IntWidth;
  use num::BigInt;

  fn ident(name: &str) -> ast::Expr { ast::Expr { pos: Pos::NONE, kind: ast::ExprKind::Ident(name.into()) } }
  fn int_lit(n: i64) -> ast::Expr {
    ast::Expr { pos: Pos::NONE, kind: ast::ExprKind::Lit(ast::Lit::Int(BigInt::from(n))) }
  }
  fn int_ty() -> ast::TypeExpr { ast::TypeExpr::Named("int".into()) }

  fn func_decl(name: &str, params: Vec<&str>, results: Vec<&str>, body: ast::Block) -> ast::Stmt {
    let sig = Rc::new(ast::FuncSig {
      params: params.into_iter().map(|n| ast::ParamDecl { name: Some(n.into()), ty: int_ty() }).collect(),
      results: results.into_iter().map(|_| ast::ParamDecl { name: None, ty: int_ty() }).collect(),
      variadic: false,
    });
    ast::Stmt {
      pos: Pos::NONE,
      label: None,
      kind: ast::StmtKind::FuncDecl(Rc::new(ast::FuncDecl { pos: Pos::NONE, name: name.into(), receiver: None, sig, body: Some(body) })),
    }
  }

  fn ret(e: ast::Expr) -> ast::Stmt { ast::Stmt { pos: Pos::NONE, label: None, kind: ast::StmtKind::Return(vec![e]) } }

  #[test]
  fn mutually_recursive_top_level_functions_resolve() {
    // func isEven(n int) int { if n == 0 { return 1 }; return isOdd(n - 1) }
    // func isOdd(n int) int { if n == 0 { return 0 }; return isEven(n - 1) }
    let zero_check = |call_other: &str| -> ast::Block {
      vec![
        ast::Stmt {
          pos: Pos::NONE,
          label: None,
          kind: ast::StmtKind::If {
            init: None,
            cond: ast::Expr { pos: Pos::NONE, kind: ast::ExprKind::Binary { op: ast::BinOp::Eq, x: Box::new(ident("n")), y: Box::new(int_lit(0)) } },
            then: vec![ret(int_lit(1))],
            els: None,
          },
        },
        ret(ast::Expr {
          pos: Pos::NONE,
          kind: ast::ExprKind::Call {
            func: Box::new(ident(call_other)),
            args: vec![ast::Expr { pos: Pos::NONE, kind: ast::ExprKind::Binary { op: ast::BinOp::Sub, x: Box::new(ident("n")), y: Box::new(int_lit(1)) } }],
            ellipsis: false,
          },
        }),
      ]
    };

    let decls = vec![func_decl("isEven", vec!["n"], vec!["_"], zero_check("isOdd")), func_decl("isOdd", vec!["n"], vec!["_"], zero_check("isEven"))];

    let compiler = Compiler::new(Config::default());
    let pkg = compiler.compile_package(&decls, Box::new(std::io::sink())).expect("package compiles");
    let reg = compiler.registry();
    let four = Value::new(reg.int(IntWidth::Int), Prim::Int(4));
    let result = pkg.call("isEven", &[four]).expect("isEven is callable");
    assert!(matches!(result[0].prim, Prim::Int(1)));
  }

  #[test]
  fn forward_reference_to_a_later_declaration_resolves() {
    let decls = vec![
      func_decl("callsLater", vec![], vec!["_"], vec![ret(ast::Expr { pos: Pos::NONE, kind: ast::ExprKind::Call { func: Box::new(ident("later")), args: vec![], ellipsis: false } })]),
      func_decl("later", vec![], vec!["_"], vec![ret(int_lit(9))]),
    ];
    let compiler = Compiler::new(Config::default());
    let pkg = compiler.compile_package(&decls, Box::new(std::io::sink())).expect("package compiles");
    let result = pkg.call("callsLater", &[]).expect("callable");
    assert!(matches!(result[0].prim, Prim::Int(9)));
  }
}
