//! The uniform value representation: a primitive payload tagged by kind, or
//! a reflective handle for composites, both carrying a type handle (§3
//! "Value"; §9 "Reflection bridge").

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use hashbrown::HashMap;

use crate::types::registry::{ChanDir, Type};

/// A primitive payload: one variant per intrinsically-sized kind the
/// expression compiler specializes a thunk for (§4.4 "Monomorphic thunk
/// signatures"), plus `Handle` for everything reflective.
#[derive(Clone)]
pub enum Prim {
  Bool(bool),
  I8(i8), I16(i16), I32(i32), I64(i64), Int(i64),
  U8(u8), U16(u16), U32(u32), U64(u64), Uint(u64), Uintptr(u64),
  F32(f32), F64(f64),
  C64(f32, f32), C128(f64, f64),
  String(Rc<str>),
  Handle(Handle),
}

impl fmt::Debug for Prim {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Prim::Bool(b) => write!(f, "{b}"),
      Prim::I8(v) => write!(f, "{v}"),
      Prim::I16(v) => write!(f, "{v}"),
      Prim::I32(v) => write!(f, "{v}"),
      Prim::I64(v) => write!(f, "{v}"),
      Prim::Int(v) => write!(f, "{v}"),
      Prim::U8(v) => write!(f, "{v}"),
      Prim::U16(v) => write!(f, "{v}"),
      Prim::U32(v) => write!(f, "{v}"),
      Prim::U64(v) => write!(f, "{v}"),
      Prim::Uint(v) => write!(f, "{v}"),
      Prim::Uintptr(v) => write!(f, "{v:#x}"),
      Prim::F32(v) => write!(f, "{v}"),
      Prim::F64(v) => write!(f, "{v}"),
      Prim::C64(re, im) => write!(f, "({re}+{im}i)"),
      Prim::C128(re, im) => write!(f, "({re}+{im}i)"),
      Prim::String(s) => write!(f, "{s:?}"),
      Prim::Handle(h) => h.fmt(f),
    }
  }
}

/// A value: a primitive or reflective payload plus its static type.
#[derive(Clone, Debug)]
pub struct Value {
  pub ty: Type,
  pub prim: Prim,
}

impl Value {
  #[must_use] pub fn new(ty: Type, prim: Prim) -> Self { Self { ty, prim } }

  /// The Go-shaped zero value for `ty`, used by `new(T)` and by every
  /// implicitly zero-initialized declaration (`var x T`).
  #[must_use] pub fn zero(ty: &Type, reg: &crate::types::registry::Registry) -> Self {
    use crate::types::registry::Kind;
    let prim = match reg.underlying(ty).kind() {
      Kind::Bool => Prim::Bool(false),
      Kind::Int(w) => crate::types::constant::zero_int(*w),
      Kind::Uint(w) => crate::types::constant::zero_uint(*w),
      Kind::Float(w) => crate::types::constant::zero_float(*w),
      Kind::Complex(w) => crate::types::constant::zero_complex(*w),
      Kind::String => Prim::String(Rc::from("")),
      Kind::Pointer(_) | Kind::Function(_) | Kind::Interface(_) | Kind::Channel(..) | Kind::Map(..) | Kind::Slice(_) =>
        Prim::Handle(Handle::Nil),
      Kind::Array(elem, n) => Prim::Handle(Handle::Array(Rc::new(RefCell::new(
        (0..*n).map(|_| Value::zero(elem, reg)).collect())))),
      Kind::Struct(fields) => Prim::Handle(Handle::Struct(Rc::new(RefCell::new(StructData {
        ty: ty.clone(),
        fields: fields.iter().map(|fld| Value::zero(&fld.ty, reg)).collect(),
      })))),
      Kind::Named(_) => unreachable!("underlying() peels Named"),
    };
    Value::new(ty.clone(), prim)
  }

  #[must_use] pub fn is_addressable_handle(&self) -> bool { matches!(self.prim, Prim::Handle(_)) }
}

/// The reflective handle for every composite kind (§9 design notes): slice,
/// map, channel, struct, function closure, pointer, array, plus `Nil` for
/// the zero value of any reference-like kind.
#[derive(Clone)]
pub enum Handle {
  Nil,
  Array(Rc<RefCell<Vec<Value>>>),
  Slice(SliceData),
  Map(Rc<RefCell<MapData>>),
  Chan(Rc<ChanData>),
  Struct(Rc<RefCell<StructData>>),
  Func(Rc<FuncData>),
  Pointer(Rc<RefCell<Value>>),
  /// A boxed interface value: the dynamic type plus its value.
  Interface(Rc<(Type, Value)>),
}

impl fmt::Debug for Handle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Handle::Nil => write!(f, "<nil>"),
      Handle::Array(a) => write!(f, "{:?}", a.borrow()),
      Handle::Slice(s) => write!(f, "{:?}", s.as_slice()),
      Handle::Map(m) => write!(f, "map[{} entries]", m.borrow().entries.len()),
      Handle::Chan(_) => write!(f, "<chan>"),
      Handle::Struct(s) => write!(f, "{:?}", s.borrow().fields),
      Handle::Func(_) => write!(f, "<func>"),
      Handle::Pointer(p) => write!(f, "&{:?}", p.borrow()),
      Handle::Interface(i) => write!(f, "{:?}", i.1),
    }
  }
}

/// A slice: a view (offset, len, cap) onto a shared, growable backing
/// array. Re-slicing and `append`-without-growth share the backing array,
/// matching the source language's aliasing semantics.
#[derive(Clone)]
pub struct SliceData {
  pub backing: Rc<RefCell<Vec<Value>>>,
  pub offset: usize,
  pub len: usize,
  pub cap: usize,
}

impl SliceData {
  #[must_use] pub fn new(elems: Vec<Value>) -> Self {
    let len = elems.len();
    Self { backing: Rc::new(RefCell::new(elems)), offset: 0, len, cap: len }
  }

  #[must_use] pub fn as_slice(&self) -> Vec<Value> {
    self.backing.borrow()[self.offset..self.offset + self.len].to_vec()
  }

  #[must_use] pub fn get(&self, i: usize) -> Option<Value> {
    if i >= self.len { return None; }
    Some(self.backing.borrow()[self.offset + i].clone())
  }

  pub fn set(&self, i: usize, v: Value) -> bool {
    if i >= self.len { return false; }
    self.backing.borrow_mut()[self.offset + i] = v;
    true
  }
}

/// A key used in `MapData`: a normalized, hashable/comparable projection of
/// a `Value`'s primitive payload. Floats compare by bit pattern (so `NaN`
/// keys are at least internally consistent, unlike IEEE comparison).
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum MapKey {
  Bool(bool),
  Int(i64),
  Uint(u64),
  FloatBits(u64),
  String(Rc<str>),
  Pointer(usize),
  Composite(Vec<MapKey>),
}

impl MapKey {
  #[must_use] pub fn from_value(v: &Value) -> Self {
    match &v.prim {
      Prim::Bool(b) => MapKey::Bool(*b),
      Prim::I8(v) => MapKey::Int(i64::from(*v)),
      Prim::I16(v) => MapKey::Int(i64::from(*v)),
      Prim::I32(v) => MapKey::Int(i64::from(*v)),
      Prim::I64(v) | Prim::Int(v) => MapKey::Int(*v),
      Prim::U8(v) => MapKey::Uint(u64::from(*v)),
      Prim::U16(v) => MapKey::Uint(u64::from(*v)),
      Prim::U32(v) => MapKey::Uint(u64::from(*v)),
      Prim::U64(v) | Prim::Uint(v) | Prim::Uintptr(v) => MapKey::Uint(*v),
      Prim::F32(v) => MapKey::FloatBits(u64::from(v.to_bits())),
      Prim::F64(v) => MapKey::FloatBits(v.to_bits()),
      Prim::C64(re, im) => MapKey::Composite(vec![MapKey::FloatBits(u64::from(re.to_bits())), MapKey::FloatBits(u64::from(im.to_bits()))]),
      Prim::C128(re, im) => MapKey::Composite(vec![MapKey::FloatBits(re.to_bits()), MapKey::FloatBits(im.to_bits())]),
      Prim::String(s) => MapKey::String(s.clone()),
      Prim::Handle(Handle::Pointer(p)) => MapKey::Pointer(Rc::as_ptr(p) as usize),
      Prim::Handle(Handle::Nil) => MapKey::Pointer(0),
      Prim::Handle(Handle::Struct(s)) => MapKey::Composite(s.borrow().fields.iter().map(MapKey::from_value).collect()),
      Prim::Handle(Handle::Array(a)) => MapKey::Composite(a.borrow().iter().map(MapKey::from_value).collect()),
      Prim::Handle(_) => unreachable!("non-comparable kind used as map key (rejected at compile time)"),
    }
  }
}

pub struct MapData {
  pub key_ty: Type,
  pub val_ty: Type,
  pub entries: HashMap<MapKey, (Value, Value)>,
}

impl MapData {
  #[must_use] pub fn new(key_ty: Type, val_ty: Type) -> Self {
    Self { key_ty, val_ty, entries: HashMap::new() }
  }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ChanDirRuntime { Send, Recv, Both }

impl From<ChanDir> for ChanDirRuntime {
  fn from(d: ChanDir) -> Self {
    match d { ChanDir::Send => Self::Send, ChanDir::Recv => Self::Recv, ChanDir::Both => Self::Both }
  }
}

/// A channel. Buffered with capacity `cap` (0 means unbuffered/synchronous,
/// approximated here with a bound of 1 plus rendezvous bookkeeping left to
/// the host reflection bridge's real `chan` proxy per §5 — this in-crate
/// implementation is the fallback used when interpreted code talks to
/// another interpreted goroutine without crossing into host code).
pub struct ChanData {
  pub elem_ty: Type,
  pub cap: usize,
  queue: RefCell<VecDeque<Value>>,
  closed: RefCell<bool>,
}

impl ChanData {
  #[must_use] pub fn new(elem_ty: Type, cap: usize) -> Self {
    Self { elem_ty, cap, queue: RefCell::new(VecDeque::new()), closed: RefCell::new(false) }
  }

  #[must_use] pub fn is_closed(&self) -> bool { *self.closed.borrow() }

  pub fn close(&self) { *self.closed.borrow_mut() = true; }

  #[must_use] pub fn len(&self) -> usize { self.queue.borrow().len() }
  #[must_use] pub fn is_empty(&self) -> bool { self.len() == 0 }

  /// Non-blocking send used by the fallback in-process channel; the real
  /// scheduling/blocking behavior lives on the host side of the reflection
  /// bridge (§5 "Suspension points").
  pub fn try_send(&self, v: Value) -> Result<(), crate::error::RuntimeError> {
    if self.is_closed() { return Err(crate::error::RuntimeError::SendOnClosed); }
    self.queue.borrow_mut().push_back(v);
    Ok(())
  }

  #[must_use] pub fn try_recv(&self, reg: &crate::types::registry::Registry) -> Option<(Value, bool)> {
    let mut q = self.queue.borrow_mut();
    if let Some(v) = q.pop_front() { return Some((v, true)); }
    if self.is_closed() { return Some((Value::zero(&self.elem_ty, reg), false)); }
    None
  }

  /// Non-blocking pop without the registry-dependent zero-value fallback
  /// `try_recv` needs for a closed, drained channel; `select` precomputes
  /// its own zero value at compile time and supplies it itself.
  #[must_use] pub fn try_pop(&self) -> Option<Value> {
    self.queue.borrow_mut().pop_front()
  }
}

#[derive(Clone)]
pub struct StructData {
  pub ty: Type,
  pub fields: Vec<Value>,
}

/// A function/closure value. The actual thunk is stored behind
/// `compile::Thunk`-shaped type erasure (`dyn Fn`) so that `types` does not
/// need to depend on `compile`.
pub struct FuncData {
  pub sig: Type,
  pub call: Box<dyn Fn(&[Value]) -> FuncResult>,
}

/// The result of invoking a function value: zero, one, or many results,
/// matching the multi-result thunk variant of §4.4.
pub type FuncResult = smallvec::SmallVec<[Value; 2]>;

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::registry::{IntWidth, Registry};

  #[test]
  fn zero_value_of_int_is_zero() {
    let reg = Registry::new();
    let ty = reg.int(IntWidth::Int);
    let v = Value::zero(&ty, &reg);
    assert!(matches!(v.prim, Prim::Int(0)));
  }

  #[test]
  fn slice_view_shares_backing_array() {
    let a = Value { ty: Registry::new().bool(), prim: Prim::Bool(true) };
    let b = Value { ty: a.ty.clone(), prim: Prim::Bool(false) };
    let s = SliceData::new(vec![a, b]);
    let s2 = s.clone();
    s.set(0, Value { ty: s.as_slice()[0].ty.clone(), prim: Prim::Bool(false) });
    assert!(matches!(s2.get(0).unwrap().prim, Prim::Bool(false)), "clone shares the backing Rc<RefCell<..>>");
  }

  #[test]
  fn map_key_equality_for_ints() {
    let a = Value { ty: Registry::new().int(IntWidth::Int), prim: Prim::Int(5) };
    let b = Value { ty: a.ty.clone(), prim: Prim::Int(5) };
    assert_eq!(MapKey::from_value(&a), MapKey::from_value(&b));
  }

  #[test]
  fn channel_send_then_receive() {
    let reg = Registry::new();
    let ch = ChanData::new(reg.int(IntWidth::Int), 4);
    ch.try_send(Value::new(reg.int(IntWidth::Int), Prim::Int(7))).unwrap();
    let (v, ok) = ch.try_recv(&reg).unwrap();
    assert!(ok);
    assert!(matches!(v.prim, Prim::Int(7)));
  }

  #[test]
  fn send_on_closed_channel_errors() {
    let reg = Registry::new();
    let ch = ChanData::new(reg.int(IntWidth::Int), 1);
    ch.close();
    let err = ch.try_send(Value::new(reg.int(IntWidth::Int), Prim::Int(1))).unwrap_err();
    assert!(matches!(err, crate::error::RuntimeError::SendOnClosed));
  }
}
