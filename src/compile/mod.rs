//! The compiler: lowers AST expressions and statements to monomorphic
//! thunks (§4.4, §4.5).

pub mod builtin;
pub mod expr;
pub mod op;
pub mod stmt;

use std::rc::Rc;

use crate::env::Frame;
use crate::types::value::{FuncResult, Handle, Value};

/// Generates the `Thunk` enum with one variant per primitive result kind
/// the expression compiler can specialize for, in the same spirit as the
/// teacher's `make_prims!` — one macro invocation listing every width
/// instead of hand-writing ten near-identical variants.
macro_rules! thunk_kinds {
  ($($variant:ident($repr:ty)),+ $(,)?) => {
    /// A compiled, type-specialized closure over a frame pointer (§3
    /// "Thunk"). Selecting the exact variant at compile time means
    /// execution performs no runtime dispatch on primitive kind.
    #[derive(Clone)]
    pub enum Thunk {
      $(
        $variant(Rc<dyn Fn(&Rc<Frame>) -> $repr>),
      )+
      /// A composite or interface result, returned as an opaque handle.
      Handle(Rc<dyn Fn(&Rc<Frame>) -> Handle>),
      /// A multi-result expression (e.g. a call in a multi-value context).
      Multi(Rc<dyn Fn(&Rc<Frame>) -> FuncResult>),
      /// A statement-position expression compiled purely for effect.
      None(Rc<dyn Fn(&Rc<Frame>)>),
    }
  };
}

thunk_kinds! {
  Bool(bool),
  I8(i8), I16(i16), I32(i32), I64(i64), Int(i64),
  U8(u8), U16(u16), U32(u32), U64(u64), Uint(u64), Uintptr(u64),
  F32(f32), F64(f64),
  C64((f32, f32)), C128((f64, f64)),
  String(Rc<str>),
}

impl Thunk {
  /// Evaluates the thunk against `frame` and rewraps the primitive result
  /// as a uniform [`Value`] tagged with `ty`. Used at statement/call
  /// boundaries where a uniform representation is required (assignment
  /// targets, arguments, return values); the hot path inside a larger
  /// compiled expression matches on the concrete variant instead.
  pub fn eval(&self, ty: &crate::types::registry::Type, frame: &Rc<Frame>) -> Value {
    use crate::types::value::Prim;
    let prim = match self {
      Thunk::Bool(f) => Prim::Bool(f(frame)),
      Thunk::I8(f) => Prim::I8(f(frame)),
      Thunk::I16(f) => Prim::I16(f(frame)),
      Thunk::I32(f) => Prim::I32(f(frame)),
      Thunk::I64(f) => Prim::I64(f(frame)),
      Thunk::Int(f) => Prim::Int(f(frame)),
      Thunk::U8(f) => Prim::U8(f(frame)),
      Thunk::U16(f) => Prim::U16(f(frame)),
      Thunk::U32(f) => Prim::U32(f(frame)),
      Thunk::U64(f) => Prim::U64(f(frame)),
      Thunk::Uint(f) => Prim::Uint(f(frame)),
      Thunk::Uintptr(f) => Prim::Uintptr(f(frame)),
      Thunk::F32(f) => Prim::F32(f(frame)),
      Thunk::F64(f) => Prim::F64(f(frame)),
      Thunk::C64(f) => { let (re, im) = f(frame); Prim::C64(re, im) }
      Thunk::C128(f) => { let (re, im) = f(frame); Prim::C128(re, im) }
      Thunk::String(f) => Prim::String(f(frame)),
      Thunk::Handle(f) => Prim::Handle(f(frame)),
      Thunk::Multi(f) => {
        log::warn!("evaluating a multi-result thunk in single-value context, taking first result");
        return f(frame).into_iter().next().unwrap_or_else(|| Value::new(ty.clone(), Prim::Handle(Handle::Nil)));
      }
      Thunk::None(f) => { f(frame); Prim::Handle(Handle::Nil) }
    };
    Value::new(ty.clone(), prim)
  }
}

/// The record produced for every compiled AST expression (§4.4).
#[derive(Clone)]
pub struct Compiled {
  pub ty: crate::types::registry::Type,
  pub is_const: bool,
  pub const_value: Option<crate::types::constant::Constant>,
  pub fun: Thunk,
  /// Present iff the expression is addressable: an alternate thunk
  /// producing the pointer handle backing this expression (§3
  /// "addressable").
  pub addr: Option<Rc<dyn Fn(&Rc<Frame>) -> Handle>>,
  /// Present iff `fun` is `Thunk::Multi`: the declared type of each
  /// result, in order, letting `compile::stmt`'s `:=`/multi-assign forms
  /// declare correctly-typed locals instead of guessing.
  pub result_types: Option<Rc<[crate::types::registry::Type]>>,
}

impl Compiled {
  #[must_use] pub fn is_addressable(&self) -> bool { self.addr.is_some() }
}

/// States of a function literal under compilation (§4.4). The signature is
/// resolved and its parameters bound in the function's own scope before the
/// body is compiled; `Complete` marks that the literal's call thunk has
/// been materialized and installed into a `FuncData`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuncState {
  PendingSignature,
  BodyCompiling,
  Complete,
}

/// A compiled method, reached through `Ctx::methods` keyed by the receiver's
/// `NamedType` uid and the method name (§4.4 "methods are ordinary functions
/// with the receiver prepended"). Holds exactly what a call site needs: the
/// function's type (for argument checking) and the callable itself, already
/// closed over whatever frame its declaration captured.
pub struct MethodInfo {
  pub sig: crate::types::registry::Type,
  pub call: Rc<dyn Fn(&[crate::types::value::Value]) -> FuncResult>,
}

/// Threaded through every call into the expression/statement compiler: the
/// type registry, the symbol table, and the accumulated error list (§7
/// policy — "compile errors accumulate ... and surface as a list").
///
/// `fatal` is set once a [`crate::error::CompileError::is_fatal`] diagnostic
/// is recorded; `compile_unit` checks it between top-level declarations and
/// stops early, matching §7's "unless the error would destabilize
/// subsequent passes".
pub struct Ctx<'r> {
  pub reg: &'r crate::types::registry::Registry,
  pub sym: crate::symtab::SymbolTable,
  pub errors: Vec<crate::error::CompileError>,
  pub fatal: bool,
  pub labels: stmt::LabelTable,
  /// The enclosing function's declared result types, pushed by
  /// `compile::expr`'s `FuncLit` handling before compiling a body and
  /// popped after; `compile::stmt::compile_return` reads the top entry to
  /// coerce each returned expression to its declared result type.
  pub return_types: Vec<Rc<[crate::types::registry::Type]>>,
  /// Method sets keyed by `(receiver type uid, method name)`, populated
  /// while the package's top-level function declarations (those with a
  /// receiver) are compiled, and consulted by `compile::expr`'s selector/
  /// call handling to desugar `x.M(args)` into a plain call with `x`
  /// prepended as the first argument (§4.4 "method dispatch via function
  /// desugaring", a simplification recorded in DESIGN.md in place of a
  /// vtable).
  pub methods: hashbrown::HashMap<(u32, Rc<str>), Rc<MethodInfo>>,
  /// Packages reachable by import path, consulted by `compile::expr`'s
  /// selector/call handling to resolve `pkg.Name` (§4.7 reflection bridge).
  pub imports: hashbrown::HashMap<Rc<str>, Rc<crate::reflect::Package>>,
}

impl<'r> Ctx<'r> {
  #[must_use] pub fn new(reg: &'r crate::types::registry::Registry) -> Self {
    Self {
      reg, sym: crate::symtab::SymbolTable::new(), errors: Vec::new(), fatal: false,
      labels: stmt::LabelTable::default(), return_types: Vec::new(), methods: hashbrown::HashMap::new(),
      imports: hashbrown::HashMap::new(),
    }
  }

  /// Records `e` and returns the `Err(())` sentinel used throughout
  /// `compile::expr`/`compile::stmt` to abort just the current subtree
  /// without panicking or stopping the whole compilation unit.
  pub fn err<T>(&mut self, e: crate::error::CompileError) -> Result<T, ()> {
    log::warn!("{e}");
    self.fatal |= e.is_fatal();
    self.errors.push(e);
    Err(())
  }

  /// Adapts a `Result` from a free function (`compile::op`, `types::constant`)
  /// that reports failure as `CompileError` into this module's `Err(())`
  /// accumulation convention.
  pub fn ok<T>(&mut self, r: Result<T, crate::error::CompileError>) -> Result<T, ()> {
    match r {
      Ok(v) => Ok(v),
      Err(e) => self.err(e),
    }
  }
}
