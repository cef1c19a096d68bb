//! The statement compiler (§4.5): lowers AST statements to thunks that
//! return a control-flow token instead of raising exceptions, so `defer`
//! and `recover` can be layered on top as ordinary function-call teardown
//! (§9 "Control flow").

use std::cell::RefCell;
use std::rc::Rc;

use crate::ast::{self, AssignOp, BinOp, Block, Stmt, StmtKind};
use crate::compile::expr::compile_expr;
use crate::compile::{Compiled, Ctx, Thunk};
use crate::env::{Frame, SlotAddr};
use crate::error::{CompileError, Pos, RuntimeError};
use crate::types::registry::Type;
use crate::types::value::{FuncResult, Handle, Prim, Value};

/// The control-flow token a compiled statement thunk returns (§4.5). The
/// enclosing block, loop, switch or function-call thunk inspects this
/// instead of unwinding an exception for ordinary control flow; only a
/// `panic` still unwinds the host stack, caught at the deferred-call
/// boundary (`run_function_body`).
#[derive(Clone)]
pub enum Flow {
  FallThrough,
  Break(Option<Rc<str>>),
  Continue(Option<Rc<str>>),
  Return(FuncResult),
  Goto(Rc<str>),
}

/// A compiled statement: a thunk from frame pointer to [`Flow`].
pub type StmtThunk = Rc<dyn Fn(&Rc<Frame>) -> Flow>;

/// Per-function label table (§4.5): records where each label was declared
/// so forward `goto`s can be fixed up once the function finishes
/// compiling. Unresolved labels fail with `UndeclaredLabel`.
#[derive(Default)]
pub struct LabelTable {
  declared: std::collections::HashSet<Rc<str>>,
  referenced: Vec<(Pos, Rc<str>)>,
}

impl LabelTable {
  /// Resets bookkeeping at the start of each function body (labels do not
  /// cross function boundaries).
  pub fn reset(&mut self) {
    self.declared.clear();
    self.referenced.clear();
  }

  pub fn declare(&mut self, name: Rc<str>) {
    self.declared.insert(name);
  }

  pub fn reference(&mut self, pos: Pos, name: Rc<str>) {
    self.referenced.push((pos, name));
  }

  /// Called when a function body finishes compiling.
  pub fn finish(&mut self) -> Result<(), CompileError> {
    for (pos, name) in &self.referenced {
      if !self.declared.contains(name) {
        return Err(CompileError::UndeclaredLabel { pos: *pos, name: name.to_string() });
      }
    }
    Ok(())
  }
}

/// Compiles one statement. Failures are accumulated into `ctx.errors` and a
/// no-op [`Flow::FallThrough`] thunk is substituted, so one broken
/// statement does not abort compilation of the rest of the block (§7
/// policy) unless `ctx.fatal` got set, which block/function compilation
/// checks between statements.
pub fn compile_stmt(ctx: &mut Ctx, s: &Stmt) -> StmtThunk {
  if let Some(label) = &s.label {
    ctx.labels.declare(label.clone());
  }
  match compile_stmt_inner(ctx, s) {
    Ok(t) => t,
    Err(()) => Rc::new(|_| Flow::FallThrough),
  }
}

fn compile_stmt_inner(ctx: &mut Ctx, s: &Stmt) -> Result<StmtThunk, ()> {
  let label = s.label.clone();
  match &s.kind {
    StmtKind::Empty => Ok(Rc::new(|_| Flow::FallThrough)),

    StmtKind::Expr(e) => {
      let c = compile_expr(ctx, e)?;
      Ok(expr_as_effect(c))
    }

    StmtKind::Assign { lhs, op, rhs } => compile_assign(ctx, s.pos, lhs, *op, rhs),

    StmtKind::ShortVarDecl { names, rhs } => compile_short_var_decl(ctx, s.pos, names, rhs),

    StmtKind::ConstDecl(specs) => {
      compile_const_decl(ctx, specs)?;
      Ok(Rc::new(|_| Flow::FallThrough))
    }

    StmtKind::VarDecl(specs) => compile_var_decl(ctx, specs),

    StmtKind::TypeDecl(specs) => {
      for spec in specs {
        let ty = super::expr::resolve_type(ctx, &spec.ty)?;
        let named = ctx.reg.declare_named(spec.name.clone(), ty, Rc::from(vec![]));
        ctx.ok(ctx.sym.declare_type(spec.pos, spec.name.clone(), named))?;
      }
      Ok(Rc::new(|_| Flow::FallThrough))
    }

    StmtKind::FuncDecl(_) => {
      // Locally-nested named function declarations are not part of this
      // compiler's AST surface; a function value is always introduced via
      // `ExprKind::FuncLit` bound through `:=`/`var` instead.
      ctx.err(CompileError::UnsupportedOperator { pos: s.pos, op: "func".into(), kind: "nested named func decl".into() })
    }

    StmtKind::Block(body) => compile_block(ctx, body),

    StmtKind::If { init, cond, then, els } => compile_if(ctx, init.as_deref(), cond, then, els.as_deref()),

    StmtKind::For { init, cond, post, body } => compile_for(ctx, label, init.as_deref(), cond.as_ref(), post.as_deref(), body),

    StmtKind::ForRange { key, value, define, x, body } =>
      compile_for_range(ctx, s.pos, label, key.as_ref(), value.as_ref(), *define, x, body),

    StmtKind::Return(exprs) => compile_return(ctx, s.pos, exprs),

    StmtKind::Break(l) => Ok(Rc::new({ let l = l.clone(); move |_| Flow::Break(l.clone()) })),
    StmtKind::Continue(l) => Ok(Rc::new({ let l = l.clone(); move |_| Flow::Continue(l.clone()) })),

    StmtKind::Goto(name) => {
      ctx.labels.reference(s.pos, name.clone());
      Ok(Rc::new({ let name = name.clone(); move |_| Flow::Goto(name.clone()) }))
    }

    StmtKind::Send { chan, value } => compile_send(ctx, s.pos, chan, value),

    StmtKind::Switch { init, tag, cases } => compile_switch(ctx, label, init.as_deref(), tag.as_ref(), cases),

    StmtKind::TypeSwitch { init, bind, x, cases } => compile_type_switch(ctx, label, init.as_deref(), bind.as_ref(), x, cases),

    StmtKind::Select { cases } => compile_select(ctx, label, cases),

    StmtKind::Defer(call) => compile_defer(ctx, s.pos, call),

    StmtKind::Go(call) => compile_go(ctx, call),
  }
}

/// An expression in statement position is compiled purely for effect; its
/// result (if any) is discarded.
fn expr_as_effect(c: Compiled) -> StmtThunk {
  macro_rules! drive { ($f:expr) => {{ let f = $f; Rc::new(move |env: &Rc<Frame>| { let _ = f(env); Flow::FallThrough }) }} }
  match c.fun {
    Thunk::None(f) => Rc::new(move |env| { f(env); Flow::FallThrough }),
    Thunk::Multi(f) => drive!(f),
    Thunk::Handle(f) => drive!(f),
    Thunk::Bool(f) => drive!(f),
    Thunk::I8(f) => drive!(f), Thunk::I16(f) => drive!(f), Thunk::I32(f) => drive!(f), Thunk::I64(f) => drive!(f), Thunk::Int(f) => drive!(f),
    Thunk::U8(f) => drive!(f), Thunk::U16(f) => drive!(f), Thunk::U32(f) => drive!(f), Thunk::U64(f) => drive!(f),
    Thunk::Uint(f) => drive!(f), Thunk::Uintptr(f) => drive!(f),
    Thunk::F32(f) => drive!(f), Thunk::F64(f) => drive!(f),
    Thunk::C64(f) => drive!(f), Thunk::C128(f) => drive!(f),
    Thunk::String(f) => drive!(f),
  }
}

/// The zero filler used to pre-size a freshly-allocated frame's slot
/// vector; every slot is overwritten by its declaring statement before any
/// read reaches it (declarations precede uses within the scope that owns
/// them, enforced by the symbol table).
fn filler(ctx: &Ctx) -> Value { Value::new(ctx.reg.bool(), Prim::Bool(false)) }

/// Always opens a fresh runtime frame for a compiled scope, so the number
/// of `Frame` hops at runtime matches `symtab`'s scope-nesting depth
/// exactly — including scopes that end up declaring zero slots. Skipping
/// frame allocation for empty scopes would desynchronize compile-time
/// `depth` from the actual parent-link chain (§4.6).
fn open_scope(parent: &Rc<Frame>, nslots: u32, zero: Value) -> Rc<Frame> {
  Frame::new_child(parent, nslots as usize, None, zero)
}

/// `x = y`, `x += y`, `x++`/`x--`.
fn compile_assign(ctx: &mut Ctx, pos: Pos, lhs: &[ast::Expr], op: AssignOp, rhs: &[ast::Expr]) -> Result<StmtThunk, ()> {
  match op {
    AssignOp::Inc | AssignOp::Dec => {
      let binop = if op == AssignOp::Inc { BinOp::Add } else { BinOp::Sub };
      let one = one_literal(lhs[0].pos);
      return compile_compound_assign(ctx, pos, &lhs[0], binop, &one);
    }
    AssignOp::Compound(binop) => {
      return compile_compound_assign(ctx, pos, &lhs[0], binop, &rhs[0]);
    }
    AssignOp::Plain => {}
  }
  if lhs.len() == 1 && rhs.len() == 1 {
    let value = compile_expr(ctx, &rhs[0])?;
    let place = compile_place(ctx, &lhs[0])?;
    return Ok(store(place, value));
  }
  if rhs.len() == lhs.len() {
    let mut pairs = Vec::with_capacity(lhs.len());
    for (l, r) in lhs.iter().zip(rhs.iter()) {
      let value = compile_expr(ctx, r)?;
      let place = compile_place(ctx, l)?;
      pairs.push((place, value));
    }
    // Every RHS is evaluated (in program order) before any LHS write, so
    // `a, b = b, a` swaps rather than clobbering.
    return Ok(Rc::new(move |env| {
      let pending: Vec<(Place, Value)> = pairs.iter()
        .map(|(place, value)| (place.clone(), value.fun.eval(&value.ty, env)))
        .collect();
      for (place, v) in pending { (place.set)(env, v); }
      Flow::FallThrough
    }));
  }
  if rhs.len() == 1 {
    let call = compile_expr(ctx, &rhs[0])?;
    let Thunk::Multi(callf) = call.fun else {
      return ctx.err(CompileError::ArgCount { pos, builtin: "assignment".into(), min: lhs.len(), max: Some(lhs.len()), got: 1 });
    };
    let places: Result<Vec<_>, ()> = lhs.iter().map(|l| compile_place(ctx, l)).collect();
    let places = places?;
    return Ok(Rc::new(move |env| {
      let results = callf(env);
      for (place, v) in places.iter().zip(results.into_iter()) { (place.set)(env, v); }
      Flow::FallThrough
    }));
  }
  ctx.err(CompileError::ArgCount { pos, builtin: "assignment".into(), min: lhs.len(), max: Some(lhs.len()), got: rhs.len() })
}

/// A synthetic integer literal `1`, letting `x++`/`x--` reuse the ordinary
/// compound-assignment path.
fn one_literal(at: Pos) -> ast::Expr {
  ast::Expr { pos: at, kind: ast::ExprKind::Lit(ast::Lit::Int(num::BigInt::from(1))) }
}

fn compile_compound_assign(ctx: &mut Ctx, pos: Pos, target: &ast::Expr, op: BinOp, rhs: &ast::Expr) -> Result<StmtThunk, ()> {
  let x = compile_expr(ctx, target)?;
  let y = compile_expr(ctx, rhs)?;
  let combined = ctx.ok(crate::compile::op::compile_binary(ctx.reg, pos, op, x, y))?;
  let place = compile_place(ctx, target)?;
  Ok(store(place, combined))
}

/// An assignable place: a `set` closure writing through the target's
/// address. Cloning a `Place` is cheap (an `Rc` bump) and is needed for
/// multi-assignment, where every place is resolved before any write runs.
#[derive(Clone)]
struct Place {
  set: Rc<dyn Fn(&Rc<Frame>, Value)>,
}

/// Reads an index/map-key operand's underlying integer, regardless of which
/// width the expression compiler chose to represent it as. Shared with
/// `compile::builtin`'s `make`/`append`/`copy` length and capacity handling.
pub(crate) fn index_to_i64(v: &Value) -> i64 {
  match v.prim {
    Prim::I8(n) => i64::from(n), Prim::I16(n) => i64::from(n), Prim::I32(n) => i64::from(n),
    Prim::I64(n) | Prim::Int(n) => n,
    Prim::U8(n) => i64::from(n), Prim::U16(n) => i64::from(n), Prim::U32(n) => i64::from(n),
    Prim::U64(n) | Prim::Uint(n) | Prim::Uintptr(n) => n as i64,
    _ => unreachable!("non-integer index (rejected at compile time)"),
  }
}

/// `s[i] = v`, `a[i] = v`, `m[k] = v`: Slice/Array/Map indexing can all be
/// written through without going via `Compiled::addr`, because each already
/// carries its own interior mutability (§3 "Indexing into a map never yields
/// an addressable value" — but it is still a valid assignment target, so
/// this is handled separately from the generic addressable-expression path
/// below).
fn compile_index_place(ctx: &mut Ctx, pos: Pos, x: &ast::Expr, index: &ast::Expr) -> Result<Place, ()> {
  use crate::types::registry::Kind;
  let base = compile_expr(ctx, x)?;
  let base_ty = base.ty.clone();
  let base_fun = base.fun;
  match ctx.reg.underlying(&base.ty).kind().clone() {
    Kind::Slice(_) => {
      let idx = compile_expr(ctx, index)?;
      let (idx_ty, idx_fun) = (idx.ty, idx.fun);
      Ok(Place {
        set: Rc::new(move |env, v| {
          let Prim::Handle(Handle::Slice(s)) = base_fun.eval(&base_ty, env).prim else {
            crate::error::raise(RuntimeError::NilDereference);
          };
          let i = index_to_i64(&idx_fun.eval(&idx_ty, env));
          if i < 0 || !s.set(i as usize, v) {
            crate::error::raise(RuntimeError::IndexOutOfRange { index: i, len: s.len });
          }
        }),
      })
    }
    Kind::Array(_, _) => {
      let idx = compile_expr(ctx, index)?;
      let (idx_ty, idx_fun) = (idx.ty, idx.fun);
      Ok(Place {
        set: Rc::new(move |env, v| {
          let Prim::Handle(Handle::Array(a)) = base_fun.eval(&base_ty, env).prim else {
            crate::error::raise(RuntimeError::NilDereference);
          };
          let i = index_to_i64(&idx_fun.eval(&idx_ty, env));
          let mut a = a.borrow_mut();
          if i < 0 || i as usize >= a.len() {
            crate::error::raise(RuntimeError::IndexOutOfRange { index: i, len: a.len() });
          }
          a[i as usize] = v;
        }),
      })
    }
    Kind::Map(_key_ty, _val_ty) => {
      let key = compile_expr(ctx, index)?;
      let (key_cty, key_fun) = (key.ty, key.fun);
      Ok(Place {
        set: Rc::new(move |env, v| {
          let Prim::Handle(Handle::Map(m)) = base_fun.eval(&base_ty, env).prim else {
            crate::error::raise(RuntimeError::NilDereference);
          };
          let kv = key_fun.eval(&key_cty, env);
          let mk = crate::types::value::MapKey::from_value(&kv);
          m.borrow_mut().entries.insert(mk, (kv, v));
        }),
      })
    }
    _ => ctx.err(CompileError::NotAddressable { pos }),
  }
}

/// `s.Field = v`: struct fields have no dedicated slot cell the way a
/// local variable does (`compile::expr`'s `compile_field_access` never
/// sets `Compiled::addr`), so assignment is resolved here the same way
/// index writes are — by locating the owning `StructData` and mutating
/// its field vector directly, rather than through an aliasing pointer.
fn compile_selector_place(ctx: &mut Ctx, pos: Pos, x: &ast::Expr, field: &str) -> Result<Place, ()> {
  use crate::types::registry::Kind;
  let xc = compile_expr(ctx, x)?;
  let (base_ty, deref) = match ctx.reg.underlying(&xc.ty).kind().clone() {
    Kind::Pointer(inner) => (inner, true),
    _ => (xc.ty.clone(), false),
  };
  let Kind::Struct(fields) = ctx.reg.underlying(&base_ty).kind().clone() else {
    return ctx.err(CompileError::UndeclaredIdent { pos, name: field.to_string() });
  };
  let Some((path, _field_ty)) = super::expr::find_field(&fields, field, ctx.reg) else {
    return ctx.err(CompileError::UndeclaredIdent { pos, name: field.to_string() });
  };
  let (xty, xfun) = (xc.ty, xc.fun);
  Ok(Place {
    set: Rc::new(move |env, v| {
      let root = super::expr::get_struct_handle(&xty, &xfun, deref, env);
      let (owner, idx) = super::expr::descend(root, &path);
      owner.borrow_mut().fields[idx] = v;
    }),
  })
}

fn compile_place(ctx: &mut Ctx, e: &ast::Expr) -> Result<Place, ()> {
  if let ast::ExprKind::Ident(name) = &e.kind {
    if name.as_ref() == "_" {
      return Ok(Place { set: Rc::new(|_, _| {}) });
    }
    let Some(addr) = ctx.sym.resolve_slot(name) else {
      return ctx.err(CompileError::UndeclaredIdent { pos: e.pos, name: name.to_string() });
    };
    return Ok(Place { set: Rc::new(move |env, v| env.set(addr, v)) });
  }
  if let ast::ExprKind::Index { x, index } = &e.kind {
    return compile_index_place(ctx, e.pos, x, index);
  }
  if let ast::ExprKind::Selector { x, field } = &e.kind {
    return compile_selector_place(ctx, e.pos, x, field);
  }
  let c = compile_expr(ctx, e)?;
  let Some(addr_fn) = c.addr else {
    return ctx.err(CompileError::NotAddressable { pos: e.pos });
  };
  Ok(Place {
    set: Rc::new(move |env, v| {
      let Handle::Pointer(cell) = addr_fn(env) else {
        crate::error::raise(RuntimeError::NilDereference);
      };
      *cell.borrow_mut() = v;
    }),
  })
}

fn store(place: Place, value: Compiled) -> StmtThunk {
  if let Thunk::None(_) = value.fun {
    return Rc::new(|_| Flow::FallThrough);
  }
  let ty = value.ty.clone();
  let fun = value.fun;
  Rc::new(move |env| { (place.set)(env, fun.eval(&ty, env)); Flow::FallThrough })
}

fn compile_short_var_decl(ctx: &mut Ctx, pos: Pos, names: &[ast::Ident], rhs: &[ast::Expr]) -> Result<StmtThunk, ()> {
  if names.len() == rhs.len() {
    let mut inits = Vec::with_capacity(names.len());
    for (name, r) in names.iter().zip(rhs.iter()) {
      let value = compile_expr(ctx, r)?;
      let addr = if name.as_ref() == "_" { None } else { Some(ctx.ok(ctx.sym.declare_var(pos, name.clone(), value.ty.clone()))?.index) };
      inits.push((addr, value));
    }
    return Ok(Rc::new(move |env| {
      for (addr, value) in &inits {
        let v = value.fun.eval(&value.ty, env);
        if let Some(idx) = addr { env.set(SlotAddr::new(0, *idx), v); }
      }
      Flow::FallThrough
    }));
  }
  if rhs.len() == 1 {
    let call = compile_expr(ctx, &rhs[0])?;
    let Thunk::Multi(callf) = call.fun else {
      return ctx.err(CompileError::ArgCount { pos, builtin: ":=".into(), min: names.len(), max: Some(names.len()), got: 1 });
    };
    let result_types = call.result_types.clone().unwrap_or_else(|| Rc::from(vec![ctx.reg.bool(); names.len()]));
    let mut indices = Vec::with_capacity(names.len());
    for (name, ty) in names.iter().zip(result_types.iter()) {
      if name.as_ref() == "_" { indices.push(None); continue; }
      let addr = ctx.ok(ctx.sym.declare_var(pos, name.clone(), ty.clone()))?;
      indices.push(Some(addr.index));
    }
    return Ok(Rc::new(move |env| {
      let results = callf(env);
      for (idx, v) in indices.iter().zip(results.into_iter()) {
        if let Some(idx) = idx { env.set(SlotAddr::new(0, *idx), v); }
      }
      Flow::FallThrough
    }));
  }
  ctx.err(CompileError::ArgCount { pos, builtin: ":=".into(), min: names.len(), max: Some(names.len()), got: rhs.len() })
}

fn compile_const_decl(ctx: &mut Ctx, specs: &[ast::ConstSpec]) -> Result<(), ()> {
  for (i, spec) in specs.iter().enumerate() {
    ctx.sym.set_iota(i as i64);
    for (name, value_expr) in spec.names.iter().zip(spec.values.iter()) {
      let c = compile_expr(ctx, value_expr)?;
      if !c.is_const {
        return ctx.err(CompileError::NotAssignable { pos: spec.pos, src: c.ty.clone(), dst: c.ty });
      }
      let cv = if let Some(ty_expr) = &spec.ty {
        let ty = super::expr::resolve_type(ctx, ty_expr)?;
        let v = ctx.ok(crate::types::constant::convert_untyped(spec.pos, c.const_value.as_ref().unwrap(), &ty, ctx.reg))?;
        crate::symtab::ConstValue::Typed(v)
      } else {
        crate::symtab::ConstValue::Untyped(c.const_value.clone().unwrap())
      };
      ctx.ok(ctx.sym.declare_const(spec.pos, name.clone(), cv))?;
    }
  }
  ctx.sym.clear_iota();
  Ok(())
}

fn compile_var_decl(ctx: &mut Ctx, specs: &[ast::VarSpec]) -> Result<StmtThunk, ()> {
  let mut inits: Vec<(Option<u32>, Compiled)> = Vec::new();
  for spec in specs {
    if !spec.values.is_empty() && spec.values.len() == spec.names.len() {
      for (name, value_expr) in spec.names.iter().zip(spec.values.iter()) {
        let value = compile_expr(ctx, value_expr)?;
        let ty = if let Some(te) = &spec.ty { super::expr::resolve_type(ctx, te)? } else { value.ty.clone() };
        let value = if value.is_const && value.ty != ty {
          let v = ctx.ok(crate::types::constant::convert_untyped(spec.pos, value.const_value.as_ref().unwrap(), &ty, ctx.reg))?;
          Compiled { ty: ty.clone(), is_const: true, const_value: value.const_value, fun: crate::compile::op::const_thunk(v), addr: None, result_types: None }
        } else { value };
        let idx = if name.as_ref() == "_" { None } else { Some(ctx.ok(ctx.sym.declare_var(spec.pos, name.clone(), ty))?.index) };
        inits.push((idx, value));
      }
    } else if spec.values.is_empty() {
      let Some(te) = &spec.ty else {
        return ctx.err(CompileError::ArgType { pos: spec.pos, builtin: "var".into(), message: "missing type and initializer".into() });
      };
      let ty = super::expr::resolve_type(ctx, te)?;
      for name in &spec.names {
        let idx = if name.as_ref() == "_" { None } else { Some(ctx.ok(ctx.sym.declare_var(spec.pos, name.clone(), ty.clone()))?.index) };
        inits.push((idx, Compiled {
          ty: ty.clone(), is_const: false, const_value: None,
          fun: crate::compile::op::const_thunk(Value::zero(&ty, ctx.reg)), addr: None, result_types: None,
        }));
      }
    } else if spec.values.len() == 1 {
      let call = compile_expr(ctx, &spec.values[0])?;
      let Thunk::Multi(callf) = call.fun else {
        return ctx.err(CompileError::ArgCount { pos: spec.pos, builtin: "var".into(), min: spec.names.len(), max: Some(spec.names.len()), got: 1 });
      };
      let result_types = call.result_types.clone().unwrap_or_else(|| Rc::from(vec![ctx.reg.bool(); spec.names.len()]));
      let mut indices = Vec::with_capacity(spec.names.len());
      for (name, ty) in spec.names.iter().zip(result_types.iter()) {
        let idx = if name.as_ref() == "_" { None } else { Some(ctx.ok(ctx.sym.declare_var(spec.pos, name.clone(), ty.clone()))?.index) };
        indices.push(idx);
      }
      return Ok(Rc::new(move |env| {
        let results = callf(env);
        for (idx, v) in indices.iter().zip(results.into_iter()) {
          if let Some(idx) = idx { env.set(SlotAddr::new(0, *idx), v); }
        }
        Flow::FallThrough
      }));
    } else {
      return ctx.err(CompileError::ArgCount { pos: spec.pos, builtin: "var".into(), min: spec.names.len(), max: Some(spec.names.len()), got: spec.values.len() });
    }
  }
  Ok(Rc::new(move |env| {
    for (idx, value) in &inits {
      let v = value.fun.eval(&value.ty, env);
      if let Some(idx) = idx { env.set(SlotAddr::new(0, *idx), v); }
    }
    Flow::FallThrough
  }))
}

/// Compiles the statements of a block *without* pushing/popping a scope —
/// used directly by function-literal compilation (§4.4 `FuncState`), whose
/// parameter scope and body share one lexical scope in the source
/// language. Ordinary nested blocks go through [`compile_block`] instead.
pub fn compile_stmts_in_current_scope(ctx: &mut Ctx, body: &Block) -> Vec<StmtThunk> {
  let mut stmts = Vec::with_capacity(body.len());
  for s in body {
    stmts.push(compile_stmt(ctx, s));
    if ctx.fatal { break; }
  }
  stmts
}

/// Compiles a block, opening its own scope for locals it declares and
/// allocating exactly one runtime frame per call, matching the one
/// `push_scope`/`pop_scope` pair this function performs.
fn compile_block(ctx: &mut Ctx, body: &Block) -> Result<StmtThunk, ()> {
  ctx.sym.push_scope();
  let stmts = compile_stmts_in_current_scope(ctx, body);
  let nslots = ctx.sym.current_scope_slots();
  let zero = filler(ctx);
  ctx.sym.pop_scope();
  Ok(run_sequence(stmts, Some((nslots, zero))))
}

/// Runs a sequence of statement thunks in order, stopping at the first
/// non-`FallThrough` flow and (optionally) opening a fresh child frame
/// first.
fn run_sequence(stmts: Vec<StmtThunk>, new_scope: Option<(u32, Value)>) -> StmtThunk {
  Rc::new(move |env| {
    let child = match &new_scope {
      Some((nslots, zero)) => open_scope(env, *nslots, zero.clone()),
      None => env.clone(),
    };
    for s in &stmts {
      match s(&child) {
        Flow::FallThrough => {}
        other => return other,
      }
    }
    Flow::FallThrough
  })
}

fn compile_if(ctx: &mut Ctx, init: Option<&Stmt>, cond: &ast::Expr, then: &Block, els: Option<&Stmt>) -> Result<StmtThunk, ()> {
  ctx.sym.push_scope();
  let init_thunk = init.map(|s| compile_stmt(ctx, s));
  let cond_c = compile_expr(ctx, cond)?;
  let Thunk::Bool(condf) = cond_c.fun else {
    return ctx.err(CompileError::TypeMismatch { pos: cond.pos, expected: ctx.reg.bool(), found: cond_c.ty });
  };
  let then_thunk = compile_block(ctx, then)?;
  let els_thunk = els.map(|s| compile_stmt(ctx, s));
  let nslots = ctx.sym.current_scope_slots();
  let zero = filler(ctx);
  ctx.sym.pop_scope();
  Ok(Rc::new(move |env| {
    let child = open_scope(env, nslots, zero.clone());
    if let Some(it) = &init_thunk {
      match it(&child) { Flow::FallThrough => {}, other => return other }
    }
    if condf(&child) {
      then_thunk(&child)
    } else if let Some(e) = &els_thunk {
      e(&child)
    } else {
      Flow::FallThrough
    }
  }))
}

/// Resolves whether `flow` is this loop's own `break`/`continue` (either
/// unlabeled, or labeled matching `my_label`): `Some(true)` = stop the
/// loop, `Some(false)` = skip to the next iteration, `None` = not ours,
/// propagate unchanged to the enclosing construct.
fn loop_signal(flow: &Flow, my_label: &Option<Rc<str>>) -> Option<bool> {
  match flow {
    Flow::Break(None) => Some(true),
    Flow::Continue(None) => Some(false),
    Flow::Break(Some(l)) if Some(l) == my_label.as_ref() => Some(true),
    Flow::Continue(Some(l)) if Some(l) == my_label.as_ref() => Some(false),
    _ => None,
  }
}

/// `break`/`continue` cannot target a `switch`/`select` by an unlabeled
/// `continue` (only loops accept that); an unlabeled `break` does,
/// matching Go's rule that `break` exits the innermost `for`/`switch`/
/// `select`, while plain `continue` only ever targets a `for`.
fn switch_signal(flow: Flow, my_label: &Option<Rc<str>>) -> Flow {
  match flow {
    Flow::Break(None) => Flow::FallThrough,
    Flow::Break(Some(l)) if Some(&l) == my_label.as_ref() => Flow::FallThrough,
    other => other,
  }
}

fn compile_for(
  ctx: &mut Ctx, label: Option<Rc<str>>, init: Option<&Stmt>, cond: Option<&ast::Expr>, post: Option<&Stmt>, body: &Block,
) -> Result<StmtThunk, ()> {
  ctx.sym.push_scope();
  let init_thunk = init.map(|s| compile_stmt(ctx, s));
  let cond_thunk = match cond {
    Some(c) => {
      let cc = compile_expr(ctx, c)?;
      let Thunk::Bool(f) = cc.fun else {
        return ctx.err(CompileError::TypeMismatch { pos: c.pos, expected: ctx.reg.bool(), found: cc.ty });
      };
      Some(f)
    }
    None => None,
  };
  let post_thunk = post.map(|s| compile_stmt(ctx, s));
  let body_thunk = compile_block(ctx, body)?;
  let nslots = ctx.sym.current_scope_slots();
  let zero = filler(ctx);
  ctx.sym.pop_scope();
  Ok(Rc::new(move |env| {
    let outer = open_scope(env, nslots, zero.clone());
    if let Some(it) = &init_thunk {
      match it(&outer) { Flow::FallThrough => {}, other => return other }
    }
    loop {
      if let Some(cf) = &cond_thunk {
        if !cf(&outer) { return Flow::FallThrough; }
      }
      match body_thunk(&outer) {
        Flow::FallThrough => {}
        other => match loop_signal(&other, &label) {
          Some(true) => return Flow::FallThrough,
          Some(false) => {}
          None => return other,
        },
      }
      if let Some(pt) = &post_thunk {
        match pt(&outer) { Flow::FallThrough => {}, other => return other }
      }
    }
  }))
}

fn compile_for_range(
  ctx: &mut Ctx, pos: Pos, label: Option<Rc<str>>, key: Option<&ast::Expr>, value: Option<&ast::Expr>,
  define: bool, x: &ast::Expr, body: &Block,
) -> Result<StmtThunk, ()> {
  use crate::types::registry::{IntWidth, Kind};
  let xc = compile_expr(ctx, x)?;
  ctx.sym.push_scope();
  enum RangeKind { Slice, Array, Map, String }
  let kind = match xc.ty.kind() {
    Kind::Slice(_) => RangeKind::Slice,
    Kind::Array(..) => RangeKind::Array,
    Kind::Map(..) => RangeKind::Map,
    Kind::String => RangeKind::String,
    _ => return ctx.err(CompileError::UnsupportedOperator { pos, op: "range".into(), kind: ctx.reg.display_name(&xc.ty) }),
  };
  let key_ty = match &kind {
    RangeKind::Slice | RangeKind::Array | RangeKind::String => ctx.reg.int(IntWidth::Int),
    RangeKind::Map => match xc.ty.kind() { Kind::Map(k, _) => k.clone(), _ => unreachable!() },
  };
  let val_ty = match &kind {
    RangeKind::Slice => match xc.ty.kind() { Kind::Slice(v) => v.clone(), _ => unreachable!() },
    RangeKind::Array => match xc.ty.kind() { Kind::Array(v, _) => v.clone(), _ => unreachable!() },
    RangeKind::Map => match xc.ty.kind() { Kind::Map(_, v) => v.clone(), _ => unreachable!() },
    RangeKind::String => ctx.reg.int(IntWidth::I32),
  };
  let key_idx = if define {
    key.and_then(|k| match &k.kind {
      ast::ExprKind::Ident(n) if n.as_ref() != "_" => Some(ctx.sym.declare_var(pos, n.clone(), key_ty.clone()).ok()?.index),
      _ => None,
    })
  } else { None };
  let value_idx = if define {
    value.and_then(|v| match &v.kind {
      ast::ExprKind::Ident(n) if n.as_ref() != "_" => Some(ctx.sym.declare_var(pos, n.clone(), val_ty.clone()).ok()?.index),
      _ => None,
    })
  } else { None };
  let key_place = if define { None } else { key.map(|k| compile_place(ctx, k)).transpose()? };
  let value_place = if define { None } else { value.map(|v| compile_place(ctx, v)).transpose()? };
  let body_thunk = compile_block(ctx, body)?;
  let nslots = ctx.sym.current_scope_slots();
  let zero = filler(ctx);
  ctx.sym.pop_scope();

  Ok(Rc::new(move |env| {
    let outer = open_scope(env, nslots, zero.clone());
    let xv = xc.fun.eval(&xc.ty, env);
    macro_rules! step {
      ($k:expr, $v:expr) => {{
        if let Some(idx) = key_idx { outer.set(SlotAddr::new(0, idx), $k.clone()); }
        if let Some(idx) = value_idx { outer.set(SlotAddr::new(0, idx), $v.clone()); }
        if let Some(p) = &key_place { (p.set)(&outer, $k); }
        if let Some(p) = &value_place { (p.set)(&outer, $v); }
        match body_thunk(&outer) {
          Flow::FallThrough => {}
          other => match loop_signal(&other, &label) {
            Some(true) => return Flow::FallThrough,
            Some(false) => continue,
            None => return other,
          },
        }
      }};
    }
    match &xv.prim {
      Prim::Handle(Handle::Slice(s)) => {
        for i in 0..s.len {
          let v = s.get(i).expect("index within len");
          step!(Value::new(key_ty.clone(), Prim::Int(i as i64)), v);
        }
      }
      Prim::Handle(Handle::Array(a)) => {
        let elems = a.borrow().clone();
        for (i, v) in elems.into_iter().enumerate() {
          step!(Value::new(key_ty.clone(), Prim::Int(i as i64)), v);
        }
      }
      Prim::Handle(Handle::Map(m)) => {
        let entries: Vec<_> = m.borrow().entries.values().cloned().collect();
        for (k, v) in entries {
          step!(k, v);
        }
      }
      Prim::String(s) => {
        for (i, ch) in s.char_indices() {
          step!(Value::new(key_ty.clone(), Prim::Int(i as i64)), Value::new(val_ty.clone(), Prim::I32(ch as i32)));
        }
      }
      Prim::Handle(Handle::Nil) => {}
      _ => unreachable!("range target kind checked at compile time"),
    }
    Flow::FallThrough
  }))
}

fn compile_return(ctx: &mut Ctx, pos: Pos, exprs: &[ast::Expr]) -> Result<StmtThunk, ()> {
  let want: Rc<[Type]> = ctx.return_types.last().cloned().unwrap_or_else(|| Rc::from(vec![]));
  if !exprs.is_empty() && exprs.len() != want.len() {
    return ctx.err(CompileError::ArgCount { pos, builtin: "return".into(), min: want.len(), max: Some(want.len()), got: exprs.len() });
  }
  if exprs.is_empty() {
    // Naked return: relies on named results, which this AST surface does
    // not model; zero declared results is the only representable case.
    return Ok(Rc::new(|_| Flow::Return(FuncResult::new())));
  }
  let mut compiled = Vec::with_capacity(exprs.len());
  for (e, ty) in exprs.iter().zip(want.iter()) {
    let mut c = compile_expr(ctx, e)?;
    if c.is_const && c.ty != *ty {
      let v = ctx.ok(crate::types::constant::convert_untyped(e.pos, c.const_value.as_ref().unwrap(), ty, ctx.reg))?;
      c = Compiled { ty: ty.clone(), is_const: true, const_value: c.const_value, fun: crate::compile::op::const_thunk(v), addr: None, result_types: None };
    }
    compiled.push(c);
  }
  Ok(Rc::new(move |env| {
    let mut results = FuncResult::new();
    for c in &compiled { results.push(c.fun.eval(&c.ty, env)); }
    Flow::Return(results)
  }))
}

fn compile_send(ctx: &mut Ctx, pos: Pos, chan: &ast::Expr, value: &ast::Expr) -> Result<StmtThunk, ()> {
  let chan_c = compile_expr(ctx, chan)?;
  let elem_ty = match chan_c.ty.kind() {
    crate::types::registry::Kind::Channel(_, e) => e.clone(),
    _ => return ctx.err(CompileError::UnsupportedOperator { pos, op: "<-".into(), kind: ctx.reg.display_name(&chan_c.ty) }),
  };
  let mut value_c = compile_expr(ctx, value)?;
  if value_c.is_const && value_c.ty != elem_ty {
    let v = ctx.ok(crate::types::constant::convert_untyped(pos, value_c.const_value.as_ref().unwrap(), &elem_ty, ctx.reg))?;
    value_c = Compiled { ty: elem_ty, is_const: true, const_value: value_c.const_value, fun: crate::compile::op::const_thunk(v), addr: None, result_types: None };
  }
  let Thunk::Handle(chanf) = chan_c.fun else { return ctx.err(CompileError::NotAddressable { pos }) };
  Ok(Rc::new(move |env| {
    let Handle::Chan(ch) = chanf(env) else { crate::error::raise(RuntimeError::NilDereference) };
    let v = value_c.fun.eval(&value_c.ty, env);
    if ch.try_send(v).is_err() { crate::error::raise(RuntimeError::SendOnClosed); }
    Flow::FallThrough
  }))
}

fn compile_switch(ctx: &mut Ctx, label: Option<Rc<str>>, init: Option<&Stmt>, tag: Option<&ast::Expr>, cases: &[ast::SwitchCase]) -> Result<StmtThunk, ()> {
  ctx.sym.push_scope();
  let init_thunk = init.map(|s| compile_stmt(ctx, s));
  let tag_c = match tag {
    Some(t) => compile_expr(ctx, t)?,
    None => Compiled {
      ty: ctx.reg.bool(), is_const: true, const_value: Some(crate::types::constant::Constant::Bool(true)),
      fun: crate::compile::op::const_thunk(Value::new(ctx.reg.bool(), Prim::Bool(true))), addr: None, result_types: None,
    },
  };
  let mut compiled_cases = Vec::with_capacity(cases.len());
  let mut default_body = None;
  for case in cases {
    if case.values.is_empty() {
      default_body = Some(compile_block(ctx, &case.body)?);
      continue;
    }
    let mut checks = Vec::with_capacity(case.values.len());
    for v in &case.values {
      let vc = compile_expr(ctx, v)?;
      let eq = ctx.ok(crate::compile::op::compile_binary(ctx.reg, v.pos, BinOp::Eq, tag_c.clone(), vc))?;
      let Thunk::Bool(f) = eq.fun else { unreachable!("compile_compare always yields bool") };
      checks.push(f);
    }
    let body = compile_block(ctx, &case.body)?;
    compiled_cases.push((checks, body));
  }
  let nslots = ctx.sym.current_scope_slots();
  let zero = filler(ctx);
  ctx.sym.pop_scope();
  Ok(Rc::new(move |env| {
    let outer = open_scope(env, nslots, zero.clone());
    if let Some(it) = &init_thunk {
      match it(&outer) { Flow::FallThrough => {}, other => return other }
    }
    for (checks, body) in &compiled_cases {
      if checks.iter().any(|c| c(&outer)) {
        return switch_signal(body(&outer), &label);
      }
    }
    if let Some(body) = &default_body {
      return switch_signal(body(&outer), &label);
    }
    Flow::FallThrough
  }))
}

fn compile_type_switch(
  ctx: &mut Ctx, label: Option<Rc<str>>, init: Option<&Stmt>, bind: Option<&ast::Ident>, x: &ast::Expr, cases: &[ast::TypeSwitchCase],
) -> Result<StmtThunk, ()> {
  ctx.sym.push_scope();
  let init_thunk = init.map(|s| compile_stmt(ctx, s));
  let xc = compile_expr(ctx, x)?;
  let is_interface = matches!(ctx.reg.underlying(&xc.ty).kind(), crate::types::registry::Kind::Interface(_));
  let mut compiled_cases = Vec::new();
  let mut default_body = None;
  for case in cases {
    let is_default = case.types.iter().all(Option::is_none);
    let candidate_types: Vec<Type> = case.types.iter().filter_map(|t| t.as_ref())
      .map(|te| super::expr::resolve_type(ctx, te)).collect::<Result<_, ()>>()?;
    if is_default {
      ctx.sym.push_scope();
      if let Some(b) = bind { let _ = ctx.sym.declare_var(x.pos, b.clone(), xc.ty.clone()); }
      let body = compile_block(ctx, &case.body)?;
      ctx.sym.pop_scope();
      default_body = Some(body);
      continue;
    }
    ctx.sym.push_scope();
    if let Some(b) = bind {
      let bound_ty = if candidate_types.len() == 1 { candidate_types[0].clone() } else { xc.ty.clone() };
      let _ = ctx.sym.declare_var(x.pos, b.clone(), bound_ty);
    }
    let body = compile_block(ctx, &case.body)?;
    ctx.sym.pop_scope();
    compiled_cases.push((candidate_types, body));
  }
  let nslots = ctx.sym.current_scope_slots();
  let zero = filler(ctx);
  ctx.sym.pop_scope();
  Ok(Rc::new(move |env| {
    let outer = open_scope(env, nslots, zero.clone());
    if let Some(it) = &init_thunk {
      match it(&outer) { Flow::FallThrough => {}, other => return other }
    }
    let xv = xc.fun.eval(&xc.ty, env);
    let dynamic_ty = if is_interface {
      match &xv.prim { Prim::Handle(Handle::Interface(b)) => b.0.clone(), _ => xc.ty.clone() }
    } else {
      xc.ty.clone()
    };
    for (candidates, body) in &compiled_cases {
      if candidates.iter().any(|t| *t == dynamic_ty) {
        return switch_signal(body(&outer), &label);
      }
    }
    if let Some(body) = &default_body {
      return switch_signal(body(&outer), &label);
    }
    Flow::FallThrough
  }))
}

/// `select` (§4.5 ambient addition). No real interpreter-level scheduler is
/// provided (§5 Non-goals: concurrency is the host's job), so this polls
/// every non-default case for readiness, spinning the host thread between
/// polls when nothing is ready and no `default` case exists — a documented
/// simplification over true multiplexed blocking select, recorded in
/// DESIGN.md.
fn compile_select(ctx: &mut Ctx, label: Option<Rc<str>>, cases: &[ast::SelectCase]) -> Result<StmtThunk, ()> {
  enum Case {
    Send { chan: Compiled, value: Compiled, body: StmtThunk },
    Recv { chan: Compiled, bind: RecvTarget, ok_bind: RecvTarget, nslots: u32, zero: Value, elem_zero: Value, bool_ty: Type, body: StmtThunk },
    Default(StmtThunk),
  }
  /// Where a `case v := <-ch:` (or plain `case v = <-ch:`) binds its result:
  /// a fresh slot in the case's own scope when `:=` introduces the name, or
  /// an existing [`Place`] when it assigns into a variable declared outside.
  enum RecvTarget {
    Unused,
    Slot(u32),
    Place(Place),
  }
  impl RecvTarget {
    fn store(&self, env: &Rc<Frame>, v: Value) {
      match self {
        RecvTarget::Unused => {}
        RecvTarget::Slot(idx) => env.set(SlotAddr::new(0, *idx), v),
        RecvTarget::Place(p) => (p.set)(env, v),
      }
    }
  }
  let mut compiled = Vec::with_capacity(cases.len());
  for case in cases {
    match case {
      ast::SelectCase::Send { chan, value, body } => {
        let chan_c = compile_expr(ctx, chan)?;
        let value_c = compile_expr(ctx, value)?;
        let body_t = compile_block(ctx, body)?;
        compiled.push(Case::Send { chan: chan_c, value: value_c, body: body_t });
      }
      ast::SelectCase::Recv { bind, ok_bind, define, chan, body } => {
        let chan_c = compile_expr(ctx, chan)?;
        let elem_ty = match chan_c.ty.kind() { crate::types::registry::Kind::Channel(_, e) => e.clone(), _ => ctx.reg.bool() };
        let elem_zero = Value::zero(&elem_ty, ctx.reg);
        ctx.sym.push_scope();
        let b = if *define {
          match bind.as_ref() {
            Some(n) if n.as_ref() != "_" => match ctx.sym.declare_var(Pos::NONE, n.clone(), elem_ty.clone()) {
              Ok(a) => RecvTarget::Slot(a.index),
              Err(_) => RecvTarget::Unused,
            },
            _ => RecvTarget::Unused,
          }
        } else {
          match bind.as_ref() {
            Some(n) if n.as_ref() != "_" =>
              RecvTarget::Place(compile_place(ctx, &ast::Expr { pos: Pos::NONE, kind: ast::ExprKind::Ident(n.clone()) })?),
            _ => RecvTarget::Unused,
          }
        };
        let ok = if *define {
          match ok_bind.as_ref() {
            Some(n) if n.as_ref() != "_" => match ctx.sym.declare_var(Pos::NONE, n.clone(), ctx.reg.bool()) {
              Ok(a) => RecvTarget::Slot(a.index),
              Err(_) => RecvTarget::Unused,
            },
            _ => RecvTarget::Unused,
          }
        } else {
          match ok_bind.as_ref() {
            Some(n) if n.as_ref() != "_" =>
              RecvTarget::Place(compile_place(ctx, &ast::Expr { pos: Pos::NONE, kind: ast::ExprKind::Ident(n.clone()) })?),
            _ => RecvTarget::Unused,
          }
        };
        let body_t = compile_block(ctx, body)?;
        let nslots = ctx.sym.current_scope_slots();
        let zero = filler(ctx);
        let bool_ty = ctx.reg.bool();
        ctx.sym.pop_scope();
        compiled.push(Case::Recv { chan: chan_c, bind: b, ok_bind: ok, nslots, zero, elem_zero, bool_ty, body: body_t });
      }
      ast::SelectCase::Default { body } => {
        let body_t = compile_block(ctx, body)?;
        compiled.push(Case::Default(body_t));
      }
    }
  }
  Ok(Rc::new(move |env| {
    loop {
      for c in &compiled {
        match c {
          Case::Send { chan, value, body } => {
            let cv = chan.fun.eval(&chan.ty, env);
            if let Prim::Handle(Handle::Chan(ch)) = cv.prim {
              if !ch.is_closed() {
                let v = value.fun.eval(&value.ty, env);
                if ch.try_send(v).is_ok() {
                  return switch_signal(body(env), &label);
                }
              }
            }
          }
          Case::Recv { chan, bind, ok_bind, nslots, zero, elem_zero, bool_ty, body } => {
            let cv = chan.fun.eval(&chan.ty, env);
            if let Prim::Handle(Handle::Chan(ch)) = cv.prim {
              let received = if let Some(v) = ch.try_pop() {
                Some((v, true))
              } else if ch.is_closed() {
                Some((elem_zero.clone(), false))
              } else {
                None
              };
              if let Some((v, ok)) = received {
                let inner = open_scope(env, *nslots, zero.clone());
                bind.store(&inner, v);
                ok_bind.store(&inner, Value::new(bool_ty.clone(), Prim::Bool(ok)));
                return switch_signal(body(&inner), &label);
              }
            }
          }
          Case::Default(body) => {
            return switch_signal(body(env), &label);
          }
        }
      }
      if compiled.iter().any(|c| matches!(c, Case::Default(_))) { return Flow::FallThrough; }
      std::thread::yield_now();
    }
  }))
}

/// What a suspended panic carries until something `recover()`s it or it
/// reaches the top of the call stack unhandled. `panic(v)` (`compile::builtin`)
/// keeps the original `Value` so `recover()` hands it back unchanged, the way
/// Go does; anything panicking from inside the interpreter itself (a failed
/// assertion, a nil dereference) only has a message to offer.
#[derive(Clone)]
pub(crate) enum PanicPayload {
  Value(Value),
  Message(String),
}

impl std::fmt::Display for PanicPayload {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Value(v) => write!(f, "{:?}", v.prim),
      Self::Message(m) => write!(f, "{m}"),
    }
  }
}

thread_local! {
  static DEFER_STACKS: RefCell<Vec<Rc<RefCell<Vec<Box<dyn FnOnce()>>>>>> = const { RefCell::new(Vec::new()) };
  static CURRENT_PANIC: RefCell<Option<PanicPayload>> = const { RefCell::new(None) };
}

fn compile_defer(ctx: &mut Ctx, pos: Pos, call: &ast::Expr) -> Result<StmtThunk, ()> {
  let ast::ExprKind::Call { func, args, .. } = &call.kind else {
    return ctx.err(CompileError::UnsupportedOperator { pos, op: "defer".into(), kind: "non-call".into() });
  };
  let func_c = compile_expr(ctx, func)?;
  let mut arg_cs = Vec::with_capacity(args.len());
  for a in args { arg_cs.push(compile_expr(ctx, a)?); }
  let Thunk::Handle(funcf) = func_c.fun else {
    return ctx.err(CompileError::UnsupportedOperator { pos, op: "defer".into(), kind: "non-function".into() });
  };
  Ok(Rc::new(move |env| {
    // `defer`'s arguments and the function value itself are evaluated
    // immediately; only the call is deferred (source-language semantics).
    let argv: Vec<Value> = arg_cs.iter().map(|c| c.fun.eval(&c.ty, env)).collect();
    let fv = funcf(env);
    DEFER_STACKS.with(|stacks| {
      let stacks = stacks.borrow();
      if let Some(frame) = stacks.last() {
        frame.borrow_mut().push(Box::new(move || {
          if let Handle::Func(fd) = fv { let _ = (fd.call)(&argv); }
        }));
      }
    });
    Flow::FallThrough
  }))
}

/// `go f(...)`. `env::Frame` is `Rc`-based (not `Send`), and per §5 the
/// interpreter provides no scheduler of its own — true goroutine spawning
/// belongs to the host via the reflection bridge's concurrency proxies.
/// This in-crate fallback runs the call inline, synchronously, which is
/// observably different from real concurrency but keeps `go` compilable
/// and testable without a host scheduler (documented in DESIGN.md).
fn compile_go(ctx: &mut Ctx, call: &ast::Expr) -> Result<StmtThunk, ()> {
  let c = compile_expr(ctx, call)?;
  Ok(expr_as_effect(c))
}

/// Runs a compiled function body with `defer`/`recover` wiring installed:
/// pushes a fresh defer stack, executes `body`, runs deferred calls in LIFO
/// order regardless of outcome, and either lets a `recover`-ed panic
/// subside into a normal (zero-results) return or re-raises it once defers
/// have run. Called from the function-call thunk `compile::expr` builds
/// for every `FuncLit`.
pub fn run_function_body(frame: &Rc<Frame>, body: &StmtThunk) -> Flow {
  DEFER_STACKS.with(|s| s.borrow_mut().push(Rc::new(RefCell::new(Vec::new()))));
  let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| body(frame)));
  // The panic is recorded *before* deferred calls run, not after: a
  // deferred `recover()` only has something to clear if it's already here
  // by the time its closure executes.
  let ok_flow = match result {
    Ok(flow) => Some(flow),
    Err(payload) => {
      CURRENT_PANIC.with(|p| *p.borrow_mut() = Some(extract_panic_payload(payload)));
      None
    }
  };
  let defers = DEFER_STACKS.with(|s| s.borrow_mut().pop().expect("pushed above"));
  let deferred_calls = std::mem::take(&mut *defers.borrow_mut());
  for d in deferred_calls.into_iter().rev() {
    let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(d));
  }
  match ok_flow {
    Some(flow) => flow,
    None => match CURRENT_PANIC.with(|p| p.borrow_mut().take()) {
      // A deferred call's `recover()` already took it: subsides into a
      // normal, zero-result return (§9 "a recovered panic behaves as if
      // the function had returned normally").
      None => Flow::Return(FuncResult::new()),
      Some(payload) => crate::error::raise(RuntimeError::Panic(Box::new(payload))),
    },
  }
}

/// Unwraps a `catch_unwind` payload down to the `PanicPayload` it carries.
/// Handles two shapes: a fresh `panic(v)` from `compile::builtin`, which
/// wraps the panicked `Value` directly, and a payload re-raised by an outer
/// `run_function_body` after its own defers declined to recover it, which
/// wraps the `PanicPayload` this function already produced once.
fn extract_panic_payload(payload: Box<dyn std::any::Any + Send>) -> PanicPayload {
  let Ok(err) = payload.downcast::<RuntimeError>() else {
    return PanicPayload::Message("panic".to_string());
  };
  match *err {
    RuntimeError::Panic(inner) => match inner.downcast::<PanicPayload>() {
      Ok(p) => *p,
      Err(inner) => match inner.downcast::<Value>() {
        Ok(v) => PanicPayload::Value(*v),
        Err(_) => PanicPayload::Message("panic".to_string()),
      },
    },
    other => PanicPayload::Message(other.to_string()),
  }
}

/// `recover()`: only meaningful when called from within a deferred
/// function; clears the in-flight panic so `run_function_body` treats it
/// as handled rather than re-raising once defers finish running.
#[must_use] pub fn recover(reg: &crate::types::registry::Registry) -> Value {
  let iface = reg.intern(crate::types::registry::Kind::Interface(Rc::from(vec![])));
  match recover_raw() {
    Some(PanicPayload::Value(v)) => Value::new(iface, Prim::Handle(Handle::Interface(Rc::new((v.ty.clone(), v))))),
    Some(PanicPayload::Message(m)) => {
      let s = Value::new(reg.string(), Prim::String(Rc::from(m)));
      Value::new(iface, Prim::Handle(Handle::Interface(Rc::new((reg.string(), s)))))
    }
    None => Value::new(iface, Prim::Handle(Handle::Nil)),
  }
}

/// The `recover_raw`/`PanicPayload` split lets `compile::builtin`'s
/// `recover()` thunk hand back a panicking `Value` exactly as `panic()`
/// received it, instead of round-tripping it through a string the way the
/// compile-time-only `recover(&Registry)` helper above must (it has no
/// runtime frame to source an interface value's dynamic type from).
pub(crate) fn recover_raw() -> Option<PanicPayload> {
  CURRENT_PANIC.with(|p| p.borrow_mut().take())
}

/// Combines a function literal's compiled statement thunks into the single
/// thunk `run_function_body` runs under its `defer`/`recover` wiring.
pub(crate) fn combine_stmts(stmts: Vec<StmtThunk>) -> StmtThunk {
  let stmts: Rc<[StmtThunk]> = Rc::from(stmts);
  Rc::new(move |env| {
    for s in stmts.iter() {
      match s(env) {
        Flow::FallThrough => {}
        other => return other,
      }
    }
    Flow::FallThrough
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::env::PackageFrame;
  use crate::types::registry::{IntWidth, Registry};

  fn env(reg: &Registry) -> Rc<Frame> {
    Frame::new_package(PackageFrame::stdout("main"), 0, Value::new(reg.int(IntWidth::Int), Prim::Int(0)))
  }

  #[test]
  fn run_sequence_opens_exactly_one_frame_per_scope() {
    let reg = Registry::new();
    let root = env(&reg);
    let hopped = Rc::new(std::cell::Cell::new(false));
    let hopped2 = hopped.clone();
    let stmts: Vec<StmtThunk> = vec![Rc::new(move |f: &Rc<Frame>| {
      let _ = f.ancestor(1);
      hopped2.set(true);
      Flow::FallThrough
    })];
    let thunk = run_sequence(stmts, Some((0, Value::new(reg.bool(), Prim::Bool(false)))));
    thunk(&root);
    assert!(hopped.get());
  }

  #[test]
  fn recover_without_panic_yields_nil() {
    let reg = Registry::new();
    let v = recover(&reg);
    assert!(matches!(v.prim, Prim::Handle(Handle::Nil)));
  }

  #[test]
  fn loop_signal_matches_own_label_only() {
    let mine: Option<Rc<str>> = Some(Rc::from("outer"));
    assert_eq!(loop_signal(&Flow::Break(Some(Rc::from("outer"))), &mine), Some(true));
    assert!(loop_signal(&Flow::Break(Some(Rc::from("other"))), &mine).is_none());
    assert_eq!(loop_signal(&Flow::Continue(None), &mine), Some(false));
  }

  #[test]
  fn switch_signal_absorbs_unlabeled_break() {
    let r = switch_signal(Flow::Break(None), &None);
    assert!(matches!(r, Flow::FallThrough));
  }
}
