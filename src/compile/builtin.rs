//! The built-in function set (§4.4 ambient addition): `len`, `cap`, `make`,
//! `new`, `append`, `copy`, `delete`, `close`, `complex`, `real`, `imag`,
//! `panic`, `print`, `println`, `recover`. These are not ordinary calls —
//! each has its own argument shape and, for several, a first argument that
//! is a type rather than a value (`ExprKind::Type`, mirroring how the
//! language's own grammar lets a type stand in for an expression in exactly
//! this position).

use std::cell::RefCell;
use std::rc::Rc;

use crate::ast;
use crate::compile::{Compiled, Ctx, Thunk};
use crate::env::Frame;
use crate::error::{CompileError, Pos, RuntimeError};
use crate::types::constant::Constant;
use crate::types::registry::{ComplexWidth, FloatWidth, IntWidth, Kind, Type};
use crate::types::value::{ChanData, Handle, MapData, MapKey, Prim, SliceData, Value};

const NAMES: &[&str] = &[
  "len", "cap", "make", "new", "append", "copy", "delete", "close",
  "complex", "real", "imag", "panic", "print", "println", "recover",
];

#[must_use] pub fn is_builtin_name(name: &str) -> bool { NAMES.contains(&name) }

/// No meaningful static type exists for a builtin invoked purely for effect
/// (`delete`, `close`, `panic`, `print`, `println`); the empty interface
/// stands in, matching how any value is assignable to it.
fn void_ty(ctx: &Ctx) -> Type { ctx.reg.intern(Kind::Interface(Rc::from(vec![]))) }

pub fn compile_builtin(ctx: &mut Ctx, pos: Pos, name: &str, args: &[ast::Expr], ellipsis: bool) -> Result<Compiled, ()> {
  match name {
    "len" => compile_len(ctx, pos, args),
    "cap" => compile_cap(ctx, pos, args),
    "make" => compile_make(ctx, pos, args),
    "new" => compile_new(ctx, pos, args),
    "append" => compile_append(ctx, pos, args, ellipsis),
    "copy" => compile_copy(ctx, pos, args),
    "delete" => compile_delete(ctx, pos, args),
    "close" => compile_close(ctx, pos, args),
    "complex" => compile_complex(ctx, pos, args),
    "real" => compile_real_imag(ctx, pos, args, true),
    "imag" => compile_real_imag(ctx, pos, args, false),
    "panic" => compile_panic(ctx, pos, args),
    "print" => compile_print(ctx, pos, args, false),
    "println" => compile_print(ctx, pos, args, true),
    "recover" => compile_recover(ctx, pos, args),
    _ => ctx.err(CompileError::UndeclaredIdent { pos, name: name.to_string() }),
  }
}

fn arity(ctx: &mut Ctx, pos: Pos, builtin: &str, args: &[ast::Expr], min: usize, max: Option<usize>) -> Result<(), ()> {
  let ok = args.len() >= min && max.is_none_or(|m| args.len() <= m);
  if ok { Ok(()) } else { ctx.err(CompileError::ArgCount { pos, builtin: builtin.into(), min, max, got: args.len() }) }
}

fn compile_len(ctx: &mut Ctx, pos: Pos, args: &[ast::Expr]) -> Result<Compiled, ()> {
  arity(ctx, pos, "len", args, 1, Some(1))?;
  let x = crate::compile::expr::compile_expr(ctx, &args[0])?;
  let int_ty = ctx.reg.int(IntWidth::Int);
  match ctx.reg.underlying(&x.ty).kind().clone() {
    Kind::Array(_, n) => Ok(Compiled {
      ty: int_ty.clone(), is_const: true, const_value: Some(Constant::Int(n.into())),
      fun: crate::compile::op::const_thunk(Value::new(int_ty, Prim::Int(n as i64))), addr: None, result_types: None,
    }),
    Kind::Slice(_) => {
      let (ty, fun) = (x.ty, x.fun);
      let f: Rc<dyn Fn(&Rc<Frame>) -> i64> = Rc::new(move |env| match fun.eval(&ty, env).prim {
        Prim::Handle(Handle::Slice(s)) => s.len as i64,
        Prim::Handle(Handle::Nil) => 0,
        _ => unreachable!("len argument kind checked at compile time"),
      });
      Ok(Compiled { ty: int_ty, is_const: false, const_value: None, fun: Thunk::Int(f), addr: None, result_types: None })
    }
    Kind::Map(..) => {
      let (ty, fun) = (x.ty, x.fun);
      let f: Rc<dyn Fn(&Rc<Frame>) -> i64> = Rc::new(move |env| match fun.eval(&ty, env).prim {
        Prim::Handle(Handle::Map(m)) => m.borrow().entries.len() as i64,
        Prim::Handle(Handle::Nil) => 0,
        _ => unreachable!(),
      });
      Ok(Compiled { ty: int_ty, is_const: false, const_value: None, fun: Thunk::Int(f), addr: None, result_types: None })
    }
    Kind::Channel(..) => {
      let (ty, fun) = (x.ty, x.fun);
      let f: Rc<dyn Fn(&Rc<Frame>) -> i64> = Rc::new(move |env| match fun.eval(&ty, env).prim {
        Prim::Handle(Handle::Chan(c)) => c.len() as i64,
        Prim::Handle(Handle::Nil) => 0,
        _ => unreachable!(),
      });
      Ok(Compiled { ty: int_ty, is_const: false, const_value: None, fun: Thunk::Int(f), addr: None, result_types: None })
    }
    Kind::String => {
      let (ty, fun) = (x.ty, x.fun);
      let f: Rc<dyn Fn(&Rc<Frame>) -> i64> = Rc::new(move |env| match fun.eval(&ty, env).prim {
        Prim::String(s) => s.len() as i64,
        _ => unreachable!(),
      });
      Ok(Compiled { ty: int_ty, is_const: false, const_value: None, fun: Thunk::Int(f), addr: None, result_types: None })
    }
    _ => ctx.err(CompileError::ArgType { pos, builtin: "len".into(), message: "argument must be array, slice, map, channel or string".into() }),
  }
}

fn compile_cap(ctx: &mut Ctx, pos: Pos, args: &[ast::Expr]) -> Result<Compiled, ()> {
  arity(ctx, pos, "cap", args, 1, Some(1))?;
  let x = crate::compile::expr::compile_expr(ctx, &args[0])?;
  let int_ty = ctx.reg.int(IntWidth::Int);
  match ctx.reg.underlying(&x.ty).kind().clone() {
    Kind::Array(_, n) => Ok(Compiled {
      ty: int_ty.clone(), is_const: true, const_value: Some(Constant::Int(n.into())),
      fun: crate::compile::op::const_thunk(Value::new(int_ty, Prim::Int(n as i64))), addr: None, result_types: None,
    }),
    Kind::Slice(_) => {
      let (ty, fun) = (x.ty, x.fun);
      let f: Rc<dyn Fn(&Rc<Frame>) -> i64> = Rc::new(move |env| match fun.eval(&ty, env).prim {
        Prim::Handle(Handle::Slice(s)) => s.cap as i64,
        Prim::Handle(Handle::Nil) => 0,
        _ => unreachable!(),
      });
      Ok(Compiled { ty: int_ty, is_const: false, const_value: None, fun: Thunk::Int(f), addr: None, result_types: None })
    }
    Kind::Channel(..) => {
      let (ty, fun) = (x.ty, x.fun);
      let f: Rc<dyn Fn(&Rc<Frame>) -> i64> = Rc::new(move |env| match fun.eval(&ty, env).prim {
        Prim::Handle(Handle::Chan(c)) => c.cap as i64,
        Prim::Handle(Handle::Nil) => 0,
        _ => unreachable!(),
      });
      Ok(Compiled { ty: int_ty, is_const: false, const_value: None, fun: Thunk::Int(f), addr: None, result_types: None })
    }
    _ => ctx.err(CompileError::ArgType { pos, builtin: "cap".into(), message: "argument must be array, slice or channel".into() }),
  }
}

/// Pulls the type argument out of `make(T, ...)`/`new(T)`: the parser
/// represents a bare type used where an expression is expected as
/// `ExprKind::Type`, the same trick the source language's own grammar uses.
fn type_arg<'a>(ctx: &mut Ctx, pos: Pos, builtin: &str, args: &'a [ast::Expr]) -> Result<&'a ast::TypeExpr, ()> {
  match args.first() {
    Some(ast::Expr { kind: ast::ExprKind::Type(te), .. }) => Ok(te),
    _ => ctx.err(CompileError::ArgType { pos, builtin: builtin.into(), message: "first argument must be a type".into() }),
  }
}

fn as_usize(v: &Value) -> usize {
  crate::compile::stmt::index_to_i64(v).max(0) as usize
}

fn compile_make(ctx: &mut Ctx, pos: Pos, args: &[ast::Expr]) -> Result<Compiled, ()> {
  arity(ctx, pos, "make", args, 1, Some(3))?;
  let te = type_arg(ctx, pos, "make", args)?;
  let ty = crate::compile::expr::resolve_type(ctx, te)?;
  match ctx.reg.underlying(&ty).kind().clone() {
    Kind::Slice(elem) => {
      arity(ctx, pos, "make", args, 2, Some(3))?;
      let len_c = crate::compile::expr::compile_expr(ctx, &args[1])?;
      let cap_c = if args.len() == 3 { Some(crate::compile::expr::compile_expr(ctx, &args[2])?) } else { None };
      let elem_zero = Value::zero(&elem, ctx.reg);
      let fun = Thunk::Handle(Rc::new(move |env| {
        let l = as_usize(&len_c.fun.eval(&len_c.ty, env));
        let c = cap_c.as_ref().map(|cc| as_usize(&cc.fun.eval(&cc.ty, env))).unwrap_or(l).max(l);
        let backing = vec![elem_zero.clone(); c];
        Handle::Slice(SliceData { backing: Rc::new(RefCell::new(backing)), offset: 0, len: l, cap: c })
      }));
      Ok(Compiled { ty, is_const: false, const_value: None, fun, addr: None, result_types: None })
    }
    Kind::Map(k, v) => {
      arity(ctx, pos, "make", args, 1, Some(2))?;
      let fun = Thunk::Handle(Rc::new(move |_env| Handle::Map(Rc::new(RefCell::new(MapData::new(k.clone(), v.clone()))))));
      Ok(Compiled { ty, is_const: false, const_value: None, fun, addr: None, result_types: None })
    }
    Kind::Channel(_, elem) => {
      arity(ctx, pos, "make", args, 1, Some(2))?;
      let cap_c = if args.len() == 2 { Some(crate::compile::expr::compile_expr(ctx, &args[1])?) } else { None };
      let fun = Thunk::Handle(Rc::new(move |env| {
        let cap = cap_c.as_ref().map(|cc| as_usize(&cc.fun.eval(&cc.ty, env))).unwrap_or(0);
        Handle::Chan(Rc::new(ChanData::new(elem.clone(), cap)))
      }));
      Ok(Compiled { ty, is_const: false, const_value: None, fun, addr: None, result_types: None })
    }
    _ => ctx.err(CompileError::ArgType { pos, builtin: "make".into(), message: "make works on slice, map or channel types only".into() }),
  }
}

fn compile_new(ctx: &mut Ctx, pos: Pos, args: &[ast::Expr]) -> Result<Compiled, ()> {
  arity(ctx, pos, "new", args, 1, Some(1))?;
  let te = type_arg(ctx, pos, "new", args)?;
  let ty = crate::compile::expr::resolve_type(ctx, te)?;
  let zero = Value::zero(&ty, ctx.reg);
  let fun = Thunk::Handle(Rc::new(move |_env| Handle::Pointer(Rc::new(RefCell::new(zero.clone())))));
  let ptr_ty = ctx.reg.intern(Kind::Pointer(ty));
  Ok(Compiled { ty: ptr_ty, is_const: false, const_value: None, fun, addr: None, result_types: None })
}

/// Grows (or reallocates) a slice's backing storage to append `extra`.
/// Slots `[len, cap)` of a `make`-allocated backing array already exist
/// (zero-filled), so the in-place branch never needs to resize the `Vec`.
fn append_elems(base: Handle, extra: Vec<Value>) -> Handle {
  match base {
    Handle::Slice(s) => {
      let needed = s.len + extra.len();
      if needed <= s.cap {
        {
          let mut backing = s.backing.borrow_mut();
          for (i, v) in extra.into_iter().enumerate() { backing[s.offset + s.len + i] = v; }
        }
        Handle::Slice(SliceData { backing: s.backing, offset: s.offset, len: needed, cap: s.cap })
      } else {
        let mut elems = s.as_slice();
        elems.extend(extra);
        Handle::Slice(SliceData::new(elems))
      }
    }
    Handle::Nil => Handle::Slice(SliceData::new(extra)),
    _ => unreachable!("append base kind checked at compile time"),
  }
}

fn compile_append(ctx: &mut Ctx, pos: Pos, args: &[ast::Expr], ellipsis: bool) -> Result<Compiled, ()> {
  arity(ctx, pos, "append", args, 1, None)?;
  let base = crate::compile::expr::compile_expr(ctx, &args[0])?;
  let elem_ty = match ctx.reg.underlying(&base.ty).kind() {
    Kind::Slice(e) => e.clone(),
    _ => return ctx.err(CompileError::ArgType { pos, builtin: "append".into(), message: "first argument must be a slice".into() }),
  };
  let (base_ty, base_fun) = (base.ty.clone(), base.fun);
  if ellipsis {
    arity(ctx, pos, "append", args, 2, Some(2))?;
    let other = crate::compile::expr::compile_expr(ctx, &args[1])?;
    let (other_ty, other_fun) = (other.ty.clone(), other.fun);
    let elem_ty2 = elem_ty.clone();
    let fun = Thunk::Handle(Rc::new(move |env| {
      let h = match base_fun.eval(&base_ty, env).prim { Prim::Handle(h) => h, _ => unreachable!() };
      let more = match other_fun.eval(&other_ty, env).prim {
        Prim::Handle(Handle::Slice(s)) => s.as_slice(),
        Prim::Handle(Handle::Nil) => vec![],
        Prim::String(s) => s.bytes().map(|b| Value::new(elem_ty2.clone(), Prim::U8(b))).collect(),
        _ => unreachable!("append ... source kind checked at compile time"),
      };
      append_elems(h, more)
    }));
    return Ok(Compiled { ty: base.ty, is_const: false, const_value: None, fun, addr: None, result_types: None });
  }
  let mut vals = Vec::with_capacity(args.len() - 1);
  for a in &args[1..] {
    let mut c = crate::compile::expr::compile_expr(ctx, a)?;
    if c.is_const && c.ty != elem_ty {
      let v = ctx.ok(crate::types::constant::convert_untyped(a.pos, c.const_value.as_ref().unwrap(), &elem_ty, ctx.reg))?;
      c = Compiled { ty: elem_ty.clone(), is_const: true, const_value: c.const_value, fun: crate::compile::op::const_thunk(v), addr: None, result_types: None };
    }
    vals.push(c);
  }
  let fun = Thunk::Handle(Rc::new(move |env| {
    let h = match base_fun.eval(&base_ty, env).prim { Prim::Handle(h) => h, _ => unreachable!() };
    let extra: Vec<Value> = vals.iter().map(|c| c.fun.eval(&c.ty, env)).collect();
    append_elems(h, extra)
  }));
  Ok(Compiled { ty: base.ty, is_const: false, const_value: None, fun, addr: None, result_types: None })
}

fn compile_copy(ctx: &mut Ctx, pos: Pos, args: &[ast::Expr]) -> Result<Compiled, ()> {
  arity(ctx, pos, "copy", args, 2, Some(2))?;
  let dst = crate::compile::expr::compile_expr(ctx, &args[0])?;
  let src = crate::compile::expr::compile_expr(ctx, &args[1])?;
  let elem_ty = match ctx.reg.underlying(&dst.ty).kind() {
    Kind::Slice(e) => e.clone(),
    _ => return ctx.err(CompileError::ArgType { pos, builtin: "copy".into(), message: "destination must be a slice".into() }),
  };
  let is_string_src = matches!(ctx.reg.underlying(&src.ty).kind(), Kind::String);
  if !is_string_src && !matches!(ctx.reg.underlying(&src.ty).kind(), Kind::Slice(_)) {
    return ctx.err(CompileError::ArgType { pos, builtin: "copy".into(), message: "source must be a slice or a string".into() });
  }
  let (dst_ty, dst_fun) = (dst.ty, dst.fun);
  let (src_ty, src_fun) = (src.ty, src.fun);
  let int_ty = ctx.reg.int(IntWidth::Int);
  let fun = Thunk::Int(Rc::new(move |env| {
    let Prim::Handle(Handle::Slice(d)) = dst_fun.eval(&dst_ty, env).prim else { return 0 };
    if is_string_src {
      let Prim::String(s) = src_fun.eval(&src_ty, env).prim else { unreachable!() };
      let bytes = s.as_bytes();
      let n = d.len.min(bytes.len());
      for (i, b) in bytes.iter().take(n).enumerate() { d.set(i, Value::new(elem_ty.clone(), Prim::U8(*b))); }
      n as i64
    } else {
      let sv = match src_fun.eval(&src_ty, env).prim {
        Prim::Handle(Handle::Slice(s)) => s.as_slice(),
        Prim::Handle(Handle::Nil) => vec![],
        _ => unreachable!(),
      };
      let n = d.len.min(sv.len());
      for (i, v) in sv.into_iter().take(n).enumerate() { d.set(i, v); }
      n as i64
    }
  }));
  Ok(Compiled { ty: int_ty, is_const: false, const_value: None, fun, addr: None, result_types: None })
}

fn compile_delete(ctx: &mut Ctx, pos: Pos, args: &[ast::Expr]) -> Result<Compiled, ()> {
  arity(ctx, pos, "delete", args, 2, Some(2))?;
  let m = crate::compile::expr::compile_expr(ctx, &args[0])?;
  if !matches!(ctx.reg.underlying(&m.ty).kind(), Kind::Map(..)) {
    return ctx.err(CompileError::ArgType { pos, builtin: "delete".into(), message: "first argument must be a map".into() });
  }
  let key = crate::compile::expr::compile_expr(ctx, &args[1])?;
  let (m_ty, m_fun) = (m.ty, m.fun);
  let (k_ty, k_fun) = (key.ty, key.fun);
  let out = Thunk::None(Rc::new(move |env| {
    if let Prim::Handle(Handle::Map(map)) = m_fun.eval(&m_ty, env).prim {
      let kv = k_fun.eval(&k_ty, env);
      map.borrow_mut().entries.remove(&MapKey::from_value(&kv));
    }
  }));
  Ok(Compiled { ty: void_ty(ctx), is_const: false, const_value: None, fun: out, addr: None, result_types: None })
}

fn compile_close(ctx: &mut Ctx, pos: Pos, args: &[ast::Expr]) -> Result<Compiled, ()> {
  arity(ctx, pos, "close", args, 1, Some(1))?;
  let c = crate::compile::expr::compile_expr(ctx, &args[0])?;
  if !matches!(ctx.reg.underlying(&c.ty).kind(), Kind::Channel(..)) {
    return ctx.err(CompileError::ArgType { pos, builtin: "close".into(), message: "argument must be a channel".into() });
  }
  let (ty, fun) = (c.ty, c.fun);
  let out = Thunk::None(Rc::new(move |env| {
    if let Prim::Handle(Handle::Chan(ch)) = fun.eval(&ty, env).prim { ch.close(); }
  }));
  Ok(Compiled { ty: void_ty(ctx), is_const: false, const_value: None, fun: out, addr: None, result_types: None })
}

fn compile_complex(ctx: &mut Ctx, pos: Pos, args: &[ast::Expr]) -> Result<Compiled, ()> {
  arity(ctx, pos, "complex", args, 2, Some(2))?;
  let re = crate::compile::expr::compile_expr(ctx, &args[0])?;
  let im = crate::compile::expr::compile_expr(ctx, &args[1])?;
  let (re, im, ty) = ctx.ok(crate::compile::op::to_same_func_type(ctx.reg, pos, re, im))?;
  if re.is_const && im.is_const {
    let to_ratio = |c: &Constant| -> Option<num::rational::BigRational> {
      match c {
        Constant::Int(i) | Constant::Rune(i) => Some(num::rational::BigRational::from_integer(i.clone())),
        Constant::Float(f) => Some(f.clone()),
        _ => None,
      }
    };
    let (Some(rr), Some(ri)) = (to_ratio(re.const_value.as_ref().unwrap()), to_ratio(im.const_value.as_ref().unwrap())) else {
      return ctx.err(CompileError::ArgType { pos, builtin: "complex".into(), message: "arguments must be numeric constants".into() });
    };
    let folded = Constant::Complex(rr, ri);
    let target = ctx.reg.complex(ComplexWidth::C128);
    let v = ctx.ok(crate::types::constant::convert_untyped(pos, &folded, &target, ctx.reg))?;
    return Ok(Compiled { ty: target, is_const: true, const_value: Some(folded), fun: crate::compile::op::const_thunk(v), addr: None, result_types: None });
  }
  match ty.kind() {
    Kind::Float(FloatWidth::F32) => {
      let Thunk::F32(ref_f) = re.fun else { unreachable!() };
      let Thunk::F32(imf) = im.fun else { unreachable!() };
      let cty = ctx.reg.complex(ComplexWidth::C64);
      let fun = Thunk::C64(Rc::new(move |e| (ref_f(e), imf(e))));
      Ok(Compiled { ty: cty, is_const: false, const_value: None, fun, addr: None, result_types: None })
    }
    Kind::Float(FloatWidth::F64) => {
      let Thunk::F64(ref_f) = re.fun else { unreachable!() };
      let Thunk::F64(imf) = im.fun else { unreachable!() };
      let cty = ctx.reg.complex(ComplexWidth::C128);
      let fun = Thunk::C128(Rc::new(move |e| (ref_f(e), imf(e))));
      Ok(Compiled { ty: cty, is_const: false, const_value: None, fun, addr: None, result_types: None })
    }
    _ => ctx.err(CompileError::ArgType { pos, builtin: "complex".into(), message: "arguments must both be float32 or both float64".into() }),
  }
}

fn compile_real_imag(ctx: &mut Ctx, pos: Pos, args: &[ast::Expr], want_real: bool) -> Result<Compiled, ()> {
  let name = if want_real { "real" } else { "imag" };
  arity(ctx, pos, name, args, 1, Some(1))?;
  let c = crate::compile::expr::compile_expr(ctx, &args[0])?;
  let width = match ctx.reg.underlying(&c.ty).kind() {
    Kind::Complex(w) => *w,
    _ => return ctx.err(CompileError::ArgType { pos, builtin: name.into(), message: "argument must be complex".into() }),
  };
  let float_ty = ctx.reg.float(match width { ComplexWidth::C64 => FloatWidth::F32, ComplexWidth::C128 => FloatWidth::F64 });
  if c.is_const {
    let Constant::Complex(re, im) = c.const_value.clone().unwrap() else {
      return ctx.err(CompileError::ArgType { pos, builtin: name.into(), message: "argument must be a complex constant".into() });
    };
    let folded = Constant::Float(if want_real { re } else { im });
    let v = ctx.ok(crate::types::constant::convert_untyped(pos, &folded, &float_ty, ctx.reg))?;
    return Ok(Compiled { ty: float_ty, is_const: true, const_value: Some(folded), fun: crate::compile::op::const_thunk(v), addr: None, result_types: None });
  }
  let fun = match (width, c.fun) {
    (ComplexWidth::C64, Thunk::C64(f)) => Thunk::F32(Rc::new(move |e| { let (re, im) = f(e); if want_real { re } else { im } })),
    (ComplexWidth::C128, Thunk::C128(f)) => Thunk::F64(Rc::new(move |e| { let (re, im) = f(e); if want_real { re } else { im } })),
    _ => unreachable!("width matched the complex kind above"),
  };
  Ok(Compiled { ty: float_ty, is_const: false, const_value: None, fun, addr: None, result_types: None })
}

fn compile_panic(ctx: &mut Ctx, pos: Pos, args: &[ast::Expr]) -> Result<Compiled, ()> {
  arity(ctx, pos, "panic", args, 1, Some(1))?;
  let v = crate::compile::expr::compile_expr(ctx, &args[0])?;
  let (ty, fun) = (v.ty, v.fun);
  let out = Thunk::None(Rc::new(move |env| {
    let val = fun.eval(&ty, env);
    crate::error::raise(RuntimeError::Panic(Box::new(val)));
  }));
  Ok(Compiled { ty: void_ty(ctx), is_const: false, const_value: None, fun: out, addr: None, result_types: None })
}

fn format_value(v: &Value) -> String {
  match &v.prim {
    Prim::Bool(b) => b.to_string(),
    Prim::I8(n) => n.to_string(), Prim::I16(n) => n.to_string(), Prim::I32(n) => n.to_string(),
    Prim::I64(n) | Prim::Int(n) => n.to_string(),
    Prim::U8(n) => n.to_string(), Prim::U16(n) => n.to_string(), Prim::U32(n) => n.to_string(),
    Prim::U64(n) | Prim::Uint(n) | Prim::Uintptr(n) => n.to_string(),
    Prim::F32(n) => n.to_string(), Prim::F64(n) => n.to_string(),
    Prim::C64(re, im) => format!("({re}+{im}i)"),
    Prim::C128(re, im) => format!("({re}+{im}i)"),
    Prim::String(s) => s.to_string(),
    Prim::Handle(h) => format!("{h:?}"),
  }
}

fn compile_print(ctx: &mut Ctx, pos: Pos, args: &[ast::Expr], newline: bool) -> Result<Compiled, ()> {
  let _ = pos;
  let mut cs = Vec::with_capacity(args.len());
  for a in args { cs.push(crate::compile::expr::compile_expr(ctx, a)?); }
  let out = Thunk::None(Rc::new(move |env| {
    let mut s = String::new();
    for (i, c) in cs.iter().enumerate() {
      if i > 0 { s.push(' '); }
      s.push_str(&format_value(&c.fun.eval(&c.ty, env)));
    }
    if newline { s.push('\n'); }
    env.package.write(&s);
  }));
  Ok(Compiled { ty: void_ty(ctx), is_const: false, const_value: None, fun: out, addr: None, result_types: None })
}

fn compile_recover(ctx: &mut Ctx, pos: Pos, args: &[ast::Expr]) -> Result<Compiled, ()> {
  arity(ctx, pos, "recover", args, 0, Some(0))?;
  let iface_ty = ctx.reg.intern(Kind::Interface(Rc::from(vec![])));
  let string_ty = ctx.reg.string();
  let fun = Thunk::Handle(Rc::new(move |_env| match crate::compile::stmt::recover_raw() {
    Some(crate::compile::stmt::PanicPayload::Value(v)) => Handle::Interface(Rc::new((v.ty.clone(), v))),
    Some(crate::compile::stmt::PanicPayload::Message(m)) =>
      Handle::Interface(Rc::new((string_ty.clone(), Value::new(string_ty.clone(), Prim::String(Rc::from(m)))))),
    None => Handle::Nil,
  }));
  Ok(Compiled { ty: iface_ty, is_const: false, const_value: None, fun, addr: None, result_types: None })
}
