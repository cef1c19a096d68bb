//! Canonical type records: interning, kind classification and assignability.
//!
//! Types are reference-counted and interned process-wide (mirroring how the
//! teacher's mid-level IR represents its own `Ty` as an `Rc<TyKind>` built
//! up by `TranslateBase::make` in `build_mir.rs`): a handle is cheap to
//! clone, and structural equality of two handles is exactly pointer
//! equality of the `Rc`, matching §3: "Equality is identity of the
//! canonical record."

use std::cell::RefCell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use hashbrown::HashMap;

/// Canonical integer widths. `Int`/`Uint` are the platform-native ("machine
/// word") widths, distinct from the fixed ones even when they happen to
/// coincide numerically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntWidth { I8, I16, I32, I64, Int }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UintWidth { U8, U16, U32, U64, Uint, Uintptr }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FloatWidth { F32, F64 }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComplexWidth { C64, C128 }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChanDir { Send, Recv, Both }

#[derive(Debug)]
pub struct TypeData {
  pub kind: Kind,
}

/// A handle to a canonical type record.
#[derive(Clone)]
pub struct Type(Rc<TypeData>);

impl Type {
  #[must_use] pub fn kind(&self) -> &Kind { &self.0.kind }
}

impl PartialEq for Type {
  fn eq(&self, other: &Self) -> bool { Rc::ptr_eq(&self.0, &other.0) }
}
impl Eq for Type {}

impl Hash for Type {
  fn hash<H: Hasher>(&self, state: &mut H) {
    (Rc::as_ptr(&self.0) as usize).hash(state);
  }
}

impl fmt::Debug for Type {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { self.0.kind.fmt(f) }
}

impl std::ops::Deref for Type {
  type Target = TypeData;
  fn deref(&self) -> &TypeData { &self.0 }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Field {
  pub name: Rc<str>,
  pub ty: Type,
  /// An embedded (anonymous) field, promoting its methods and fields.
  pub embedded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodSig {
  pub name: Rc<str>,
  pub sig: Type,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionSig {
  pub params: Rc<[Type]>,
  pub results: Rc<[Type]>,
  pub variadic: bool,
}

/// A named (defined) type: `type Foo struct{...}`. Two `NamedType` records
/// are never structurally interned together even if `underlying` and
/// `methods` coincide — each declaration site gets its own fresh record,
/// matching Go's rule that distinct `type` declarations are distinct types.
#[derive(Debug, Clone)]
pub struct NamedType {
  pub name: Rc<str>,
  pub underlying: Type,
  pub methods: Rc<[MethodSig]>,
  /// A monotonic id distinguishing otherwise-identical declarations; never
  /// compared for anything but `Debug`.
  pub uid: u32,
}

impl PartialEq for NamedType {
  fn eq(&self, other: &Self) -> bool { self.uid == other.uid }
}
impl Eq for NamedType {}
impl Hash for NamedType {
  fn hash<H: Hasher>(&self, state: &mut H) { self.uid.hash(state) }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Kind {
  Bool,
  Int(IntWidth),
  Uint(UintWidth),
  Float(FloatWidth),
  Complex(ComplexWidth),
  String,
  Array(Type, u64),
  Slice(Type),
  Map(Type, Type),
  Channel(ChanDir, Type),
  Pointer(Type),
  Function(FunctionSig),
  Interface(Rc<[MethodSig]>),
  Struct(Rc<[Field]>),
  Named(NamedType),
}

/// The basis of "is this operand in the same class" checks for operators:
/// every signed integer width collapses to `Int`, every unsigned width to
/// `Uint`, every float width to `Float`, every complex width to `Complex`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KindCategory {
  Bool, Int, Uint, Float, Complex, String,
  Array, Slice, Map, Channel, Pointer, Function, Interface, Struct, Named,
}

#[derive(Default)]
pub struct Registry {
  interned: RefCell<HashMap<Kind, Type>>,
  next_uid: RefCell<u32>,
}

impl Registry {
  #[must_use] pub fn new() -> Self { Self::default() }

  /// Returns the canonical handle for a structural `kind`, allocating a
  /// fresh record only the first time this exact structural shape is seen.
  /// Do not call this with `Kind::Named` — use [`Self::declare_named`].
  pub fn intern(&self, kind: Kind) -> Type {
    debug_assert!(!matches!(kind, Kind::Named(_)), "named types are never structurally interned");
    if let Some(ty) = self.interned.borrow().get(&kind) {
      log::trace!("type registry: interned hit for {kind:?}");
      return ty.clone();
    }
    log::trace!("type registry: interning new type {kind:?}");
    let ty = Type(Rc::new(TypeData { kind: kind.clone() }));
    self.interned.borrow_mut().insert(kind, ty.clone());
    ty
  }

  /// Always allocates a fresh, uniquely-identified named type record.
  pub fn declare_named(&self, name: impl Into<Rc<str>>, underlying: Type, methods: Rc<[MethodSig]>) -> Type {
    let mut uid = self.next_uid.borrow_mut();
    let this_uid = *uid;
    *uid += 1;
    let named = NamedType { name: name.into(), underlying, methods, uid: this_uid };
    log::debug!("type registry: declared named type {} (uid {this_uid})", named.name);
    Type(Rc::new(TypeData { kind: Kind::Named(named) }))
  }

  #[must_use] pub fn bool(&self) -> Type { self.intern(Kind::Bool) }
  #[must_use] pub fn int(&self, w: IntWidth) -> Type { self.intern(Kind::Int(w)) }
  #[must_use] pub fn uint(&self, w: UintWidth) -> Type { self.intern(Kind::Uint(w)) }
  #[must_use] pub fn float(&self, w: FloatWidth) -> Type { self.intern(Kind::Float(w)) }
  #[must_use] pub fn complex(&self, w: ComplexWidth) -> Type { self.intern(Kind::Complex(w)) }
  #[must_use] pub fn string(&self) -> Type { self.intern(Kind::String) }

  /// Peels off `Named` wrappers to reach the underlying structural kind,
  /// the basis for every structural rule (assignability, operator
  /// applicability, method lookup on the underlying shape).
  #[must_use] pub fn underlying(&self, t: &Type) -> Type {
    let mut t = t.clone();
    while let Kind::Named(n) = t.kind() { t = n.underlying.clone(); }
    t
  }

  #[must_use] pub fn kind_category(&self, t: &Type) -> KindCategory {
    match self.underlying(t).kind() {
      Kind::Bool => KindCategory::Bool,
      Kind::Int(_) => KindCategory::Int,
      Kind::Uint(_) => KindCategory::Uint,
      Kind::Float(_) => KindCategory::Float,
      Kind::Complex(_) => KindCategory::Complex,
      Kind::String => KindCategory::String,
      Kind::Array(..) => KindCategory::Array,
      Kind::Slice(_) => KindCategory::Slice,
      Kind::Map(..) => KindCategory::Map,
      Kind::Channel(..) => KindCategory::Channel,
      Kind::Pointer(_) => KindCategory::Pointer,
      Kind::Function(_) => KindCategory::Function,
      Kind::Interface(_) => KindCategory::Interface,
      Kind::Struct(_) => KindCategory::Struct,
      Kind::Named(_) => unreachable!("underlying() peels all Named wrappers"),
    }
  }

  #[must_use] pub fn is_class(&self, t: &Type, cats: &[KindCategory]) -> bool {
    cats.contains(&self.kind_category(t))
  }

  /// Numeric classes only (used by the operator matrix, §4.4).
  #[must_use] pub fn is_numeric(&self, t: &Type) -> bool {
    self.is_class(t, &[KindCategory::Int, KindCategory::Uint, KindCategory::Float, KindCategory::Complex])
  }

  /// `assignable_to(src, dst)`: implements the language's assignability
  /// rule (§4.1). Untyped-constant representability is handled separately
  /// by `types::constant::convert_untyped`, not here — this function only
  /// covers typed-to-typed assignment.
  #[must_use] pub fn assignable_to(&self, src: &Type, dst: &Type) -> bool {
    if src == dst { return true; }
    // identical underlying types, and at most one of the two is named
    let (src_named, dst_named) = (matches!(src.kind(), Kind::Named(_)), matches!(dst.kind(), Kind::Named(_)));
    if !(src_named && dst_named) && self.underlying(src) == self.underlying(dst) {
      return true;
    }
    // interface satisfaction: dst is an interface and src implements every method
    if let Kind::Interface(methods) = self.underlying(dst).kind() {
      return self.implements(src, methods);
    }
    // bidirectional channel assignment: an unrestricted chan is assignable
    // to a directional chan of the same element type
    if let (Kind::Channel(ChanDir::Both, se), Kind::Channel(dd, de)) =
      (self.underlying(src).kind(), self.underlying(dst).kind())
    {
      if *dd != ChanDir::Both && se == de { return true; }
    }
    false
  }

  fn implements(&self, src: &Type, methods: &[MethodSig]) -> bool {
    let underlying = self.underlying(src);
    let src_methods: &[MethodSig] = match underlying.kind() {
      Kind::Interface(m) => m,
      Kind::Named(n) => &n.methods,
      _ => &[],
    };
    methods.iter().all(|want| src_methods.iter().any(|have| have.name == want.name && have.sig == want.sig))
  }

  /// A human-readable rendering for diagnostics; not meant to round-trip.
  #[must_use] pub fn display_name(&self, t: &Type) -> String {
    match t.kind() {
      Kind::Bool => "bool".into(),
      Kind::Int(IntWidth::Int) => "int".into(),
      Kind::Int(w) => format!("int{}", width_bits_int(*w)),
      Kind::Uint(UintWidth::Uint) => "uint".into(),
      Kind::Uint(UintWidth::Uintptr) => "uintptr".into(),
      Kind::Uint(w) => format!("uint{}", width_bits_uint(*w)),
      Kind::Float(FloatWidth::F32) => "float32".into(),
      Kind::Float(FloatWidth::F64) => "float64".into(),
      Kind::Complex(ComplexWidth::C64) => "complex64".into(),
      Kind::Complex(ComplexWidth::C128) => "complex128".into(),
      Kind::String => "string".into(),
      Kind::Array(elem, n) => format!("[{n}]{}", self.display_name(elem)),
      Kind::Slice(elem) => format!("[]{}", self.display_name(elem)),
      Kind::Map(k, v) => format!("map[{}]{}", self.display_name(k), self.display_name(v)),
      Kind::Channel(ChanDir::Both, e) => format!("chan {}", self.display_name(e)),
      Kind::Channel(ChanDir::Send, e) => format!("chan<- {}", self.display_name(e)),
      Kind::Channel(ChanDir::Recv, e) => format!("<-chan {}", self.display_name(e)),
      Kind::Pointer(e) => format!("*{}", self.display_name(e)),
      Kind::Function(sig) => {
        let params: Vec<_> = sig.params.iter().map(|p| self.display_name(p)).collect();
        let results: Vec<_> = sig.results.iter().map(|r| self.display_name(r)).collect();
        format!("func({}) ({})", params.join(", "), results.join(", "))
      }
      Kind::Interface(methods) => format!("interface {{ {} methods }}", methods.len()),
      Kind::Struct(fields) => format!("struct {{ {} fields }}", fields.len()),
      Kind::Named(n) => n.name.to_string(),
    }
  }
}

fn width_bits_int(w: IntWidth) -> u32 {
  match w { IntWidth::I8 => 8, IntWidth::I16 => 16, IntWidth::I32 => 32, IntWidth::I64 => 64, IntWidth::Int => 64 }
}
fn width_bits_uint(w: UintWidth) -> u32 {
  match w {
    UintWidth::U8 => 8, UintWidth::U16 => 16, UintWidth::U32 => 32, UintWidth::U64 => 64,
    UintWidth::Uint | UintWidth::Uintptr => 64,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn primitive_interning_is_identity() {
    let reg = Registry::new();
    let a = reg.int(IntWidth::I32);
    let b = reg.int(IntWidth::I32);
    assert_eq!(a, b);
  }

  #[test]
  fn distinct_kinds_are_distinct() {
    let reg = Registry::new();
    assert_ne!(reg.int(IntWidth::I32), reg.int(IntWidth::I64));
    assert_ne!(reg.int(IntWidth::I32), reg.uint(UintWidth::U32));
  }

  #[test]
  fn category_collapses_widths() {
    let reg = Registry::new();
    assert_eq!(reg.kind_category(&reg.int(IntWidth::I8)), KindCategory::Int);
    assert_eq!(reg.kind_category(&reg.int(IntWidth::I64)), KindCategory::Int);
    assert_eq!(reg.kind_category(&reg.uint(UintWidth::U16)), KindCategory::Uint);
    assert_eq!(reg.kind_category(&reg.float(FloatWidth::F32)), KindCategory::Float);
  }

  #[test]
  fn named_types_are_never_merged() {
    let reg = Registry::new();
    let underlying = reg.int(IntWidth::Int);
    let foo = reg.declare_named("Foo", underlying.clone(), Rc::from(vec![]));
    let bar = reg.declare_named("Foo", underlying, Rc::from(vec![]));
    assert_ne!(foo, bar, "two declarations of the same name are distinct types");
  }

  #[test]
  fn assignability_identical_underlying() {
    let reg = Registry::new();
    let int_t = reg.int(IntWidth::Int);
    let named = reg.declare_named("MyInt", int_t.clone(), Rc::from(vec![]));
    // named type is assignable from its underlying only when at most one side is named
    assert!(reg.assignable_to(&int_t, &named));
    assert!(reg.assignable_to(&named, &int_t));
  }

  #[test]
  fn two_named_types_not_mutually_assignable_even_same_underlying() {
    let reg = Registry::new();
    let int_t = reg.int(IntWidth::Int);
    let a = reg.declare_named("A", int_t.clone(), Rc::from(vec![]));
    let b = reg.declare_named("B", int_t, Rc::from(vec![]));
    assert!(!reg.assignable_to(&a, &b));
  }

  #[test]
  fn directional_channel_assignability() {
    let reg = Registry::new();
    let elem = reg.int(IntWidth::Int);
    let both = reg.intern(Kind::Channel(ChanDir::Both, elem.clone()));
    let send = reg.intern(Kind::Channel(ChanDir::Send, elem));
    assert!(reg.assignable_to(&both, &send));
    assert!(!reg.assignable_to(&send, &both));
  }

  #[test]
  fn interface_satisfaction() {
    let reg = Registry::new();
    let unit_fn = reg.intern(Kind::Function(FunctionSig { params: Rc::from(vec![]), results: Rc::from(vec![]), variadic: false }));
    let method = MethodSig { name: Rc::from("Foo"), sig: unit_fn };
    let iface = reg.intern(Kind::Interface(Rc::from(vec![method.clone()])));
    let named = reg.declare_named("Impl", reg.intern(Kind::Struct(Rc::from(vec![]))), Rc::from(vec![method]));
    assert!(reg.assignable_to(&named, &iface));
  }
}
