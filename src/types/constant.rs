//! The untyped-constant lattice: arbitrary-precision arithmetic over
//! {bool, rune, int, float, complex, string}, and the narrowing rules that
//! turn such a constant into a typed [`Value`](crate::types::value::Value)
//! when it meets a typed context.

use std::rc::Rc;

use num::bigint::BigInt;
use num::rational::BigRational;
use num::{ToPrimitive, Zero};

use crate::error::{CompileError, Pos};
use crate::types::registry::{ComplexWidth, FloatWidth, IntWidth, Kind, KindCategory, Registry, Type, UintWidth};
use crate::types::value::{Prim, Value};

/// An untyped constant. `Rune` is kept distinct from `Int` only so that
/// `default_type` can tell them apart (`rune`'s default type is `int32`,
/// an ordinary integer literal's default is `int`) — arithmetic otherwise
/// treats them identically.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
  Bool(bool),
  Rune(BigInt),
  Int(BigInt),
  Float(BigRational),
  Complex(BigRational, BigRational),
  String(Rc<str>),
}

/// The six kinds of the constant lattice, mirroring `Constant`'s variants
/// without the payload — used where only the classification matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstKind { Bool, Rune, Int, Float, Complex, String }

impl Constant {
  #[must_use] pub fn kind(&self) -> ConstKind {
    match self {
      Constant::Bool(_) => ConstKind::Bool,
      Constant::Rune(_) => ConstKind::Rune,
      Constant::Int(_) => ConstKind::Int,
      Constant::Float(_) => ConstKind::Float,
      Constant::Complex(..) => ConstKind::Complex,
      Constant::String(_) => ConstKind::String,
    }
  }

  /// Is this constant's int/rune value exactly zero? Used to recognize the
  /// literal-zero divisor that makes `/`/`%` a compile error, and the
  /// literal-one identity that a naive optimizer might be tempted to fold
  /// away (§4.4: the compiler must not do that when the other side is
  /// dynamic, since it may have side effects).
  #[must_use] pub fn is_zero(&self) -> bool {
    match self {
      Constant::Int(i) | Constant::Rune(i) => i.is_zero(),
      Constant::Float(f) => f.is_zero(),
      Constant::Complex(re, im) => re.is_zero() && im.is_zero(),
      _ => false,
    }
  }

  #[must_use] pub fn is_one(&self) -> bool {
    match self {
      Constant::Int(i) | Constant::Rune(i) => *i == BigInt::from(1),
      Constant::Float(f) => *f == BigRational::from_integer(1.into()),
      _ => false,
    }
  }

  fn as_float(&self) -> Option<BigRational> {
    match self {
      Constant::Int(i) | Constant::Rune(i) => Some(BigRational::from_integer(i.clone())),
      Constant::Float(f) => Some(f.clone()),
      _ => None,
    }
  }

  fn as_complex(&self) -> Option<(BigRational, BigRational)> {
    match self {
      Constant::Complex(re, im) => Some((re.clone(), im.clone())),
      _ => self.as_float().map(|f| (f, BigRational::from_integer(0.into()))),
    }
  }

  /// The rank used to decide which representation a mixed-kind binary
  /// operation is carried out in: bool/string never mix with numbers,
  /// among numbers complex > float > int/rune.
  fn numeric_rank(&self) -> u8 {
    match self {
      Constant::Int(_) | Constant::Rune(_) => 0,
      Constant::Float(_) => 1,
      Constant::Complex(..) => 2,
      Constant::Bool(_) | Constant::String(_) => u8::MAX,
    }
  }
}

/// Binary operators the constant evaluator understands. A subset of the
/// full operator matrix (§4.4): only the ones meaningful at compile time
/// on an untyped operand pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstBinOp { Add, Sub, Mul, Div, Rem, And, Or, Xor, AndNot, Shl, Shr, Eq, Ne, Lt, Le, Gt, Ge, LogAnd, LogOr }

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstUnOp { Pos, Neg, Not, Complement }

fn to_bigint(c: &Constant) -> Option<&BigInt> {
  match c { Constant::Int(i) | Constant::Rune(i) => Some(i), _ => None }
}

/// Evaluates a binary operator over two untyped constants (§4.2, §8
/// property 2: "constant folding fidelity").
pub fn eval_binary(pos: Pos, op: ConstBinOp, x: &Constant, y: &Constant) -> Result<Constant, CompileError> {
  use ConstBinOp as Op;
  match op {
    Op::Eq | Op::Ne | Op::Lt | Op::Le | Op::Gt | Op::Ge => return Ok(Constant::Bool(eval_compare(op, x, y)?)),
    Op::LogAnd | Op::LogOr => {
      let (Constant::Bool(a), Constant::Bool(b)) = (x, y) else {
        return Err(CompileError::UnsupportedOperator { pos, op: format!("{op:?}"), kind: "non-bool".into() });
      };
      return Ok(Constant::Bool(if op == Op::LogAnd { *a && *b } else { *a || *b }));
    }
    _ => {}
  }
  if matches!(op, Op::And | Op::Or | Op::Xor | Op::AndNot | Op::Shl | Op::Shr) {
    let (Some(a), Some(b)) = (to_bigint(x), to_bigint(y)) else {
      return Err(CompileError::UnsupportedOperator { pos, op: format!("{op:?}"), kind: "non-integer".into() });
    };
    let result = match op {
      Op::And => a & b,
      Op::Or => a | b,
      Op::Xor => a ^ b,
      Op::AndNot => a & !b,
      Op::Shl => {
        let n = b.to_u64().ok_or(CompileError::NegativeShift { pos })?;
        a << n
      }
      Op::Shr => {
        if b.sign() == num::bigint::Sign::Minus { return Err(CompileError::NegativeShift { pos }); }
        let n = b.to_u64().unwrap_or(u64::MAX);
        a >> n
      }
      _ => unreachable!(),
    };
    return Ok(Constant::Int(result));
  }
  if let (Constant::String(a), Constant::String(b)) = (x, y) {
    return match op {
      Op::Add => Ok(Constant::String(Rc::from(format!("{a}{b}")))),
      _ => Err(CompileError::UnsupportedOperator { pos, op: format!("{op:?}"), kind: "string".into() }),
    };
  }
  let rank = x.numeric_rank().max(y.numeric_rank());
  if rank == u8::MAX {
    return Err(CompileError::UnsupportedOperator { pos, op: format!("{op:?}"), kind: "non-numeric".into() });
  }
  if rank == 2 {
    let (ax, ay) = (x.as_complex().unwrap(), y.as_complex().unwrap());
    return eval_complex(pos, op, ax, ay);
  }
  if rank == 1 {
    let (ax, ay) = (x.as_float().unwrap(), y.as_float().unwrap());
    return eval_float(pos, op, ax, ay);
  }
  let (ax, ay) = (to_bigint(x).unwrap().clone(), to_bigint(y).unwrap().clone());
  eval_int(pos, op, ax, ay)
}

fn eval_int(pos: Pos, op: ConstBinOp, a: BigInt, b: BigInt) -> Result<Constant, CompileError> {
  use ConstBinOp as Op;
  Ok(Constant::Int(match op {
    Op::Add => a + b,
    Op::Sub => a - b,
    Op::Mul => a * b,
    Op::Div => {
      if b.is_zero() { return Err(CompileError::DivisionByZero { pos }); }
      a / b
    }
    Op::Rem => {
      if b.is_zero() { return Err(CompileError::DivisionByZero { pos }); }
      a % b
    }
    _ => return Err(CompileError::UnsupportedOperator { pos, op: format!("{op:?}"), kind: "int".into() }),
  }))
}

fn eval_float(pos: Pos, op: ConstBinOp, a: BigRational, b: BigRational) -> Result<Constant, CompileError> {
  use ConstBinOp as Op;
  Ok(Constant::Float(match op {
    Op::Add => a + b,
    Op::Sub => a - b,
    Op::Mul => a * b,
    Op::Div => {
      if b.is_zero() { return Err(CompileError::DivisionByZero { pos }); }
      a / b
    }
    _ => return Err(CompileError::UnsupportedOperator { pos, op: format!("{op:?}"), kind: "float".into() }),
  }))
}

fn eval_complex(pos: Pos, op: ConstBinOp, a: (BigRational, BigRational), b: (BigRational, BigRational)) -> Result<Constant, CompileError> {
  use ConstBinOp as Op;
  let (ar, ai) = a;
  let (br, bi) = b;
  Ok(match op {
    Op::Add => Constant::Complex(ar + br, ai + bi),
    Op::Sub => Constant::Complex(ar - br, ai - bi),
    Op::Mul => Constant::Complex(ar.clone() * br.clone() - ai.clone() * bi.clone(), ar * bi + ai * br),
    Op::Div => {
      let denom = br.clone() * br.clone() + bi.clone() * bi.clone();
      if denom.is_zero() { return Err(CompileError::DivisionByZero { pos }); }
      Constant::Complex(
        (ar.clone() * br.clone() + ai.clone() * bi.clone()) / denom.clone(),
        (ai * br - ar * bi) / denom,
      )
    }
    _ => return Err(CompileError::UnsupportedOperator { pos, op: format!("{op:?}"), kind: "complex".into() }),
  })
}

fn eval_compare(op: ConstBinOp, x: &Constant, y: &Constant) -> Result<bool, CompileError> {
  use ConstBinOp as Op;
  if let (Constant::Bool(a), Constant::Bool(b)) = (x, y) {
    return Ok(match op { Op::Eq => a == b, Op::Ne => a != b, _ => false });
  }
  if let (Constant::String(a), Constant::String(b)) = (x, y) {
    return Ok(match op {
      Op::Eq => a == b, Op::Ne => a != b,
      Op::Lt => a < b, Op::Le => a <= b, Op::Gt => a > b, Op::Ge => a >= b,
      _ => false,
    });
  }
  let rank = x.numeric_rank().max(y.numeric_rank());
  if rank == 2 {
    let (ar, ai) = x.as_complex().expect("numeric");
    let (br, bi) = y.as_complex().expect("numeric");
    return Ok(match op {
      Op::Eq => ar == br && ai == bi,
      Op::Ne => ar != br || ai != bi,
      _ => return Err(CompileError::UnsupportedOperator { pos: Pos::NONE, op: format!("{op:?}"), kind: "complex".into() }),
    });
  }
  let a = x.as_float().ok_or(CompileError::UnsupportedOperator { pos: Pos::NONE, op: format!("{op:?}"), kind: "non-numeric".into() })?;
  let b = y.as_float().ok_or(CompileError::UnsupportedOperator { pos: Pos::NONE, op: format!("{op:?}"), kind: "non-numeric".into() })?;
  Ok(match op {
    Op::Eq => a == b, Op::Ne => a != b,
    Op::Lt => a < b, Op::Le => a <= b, Op::Gt => a > b, Op::Ge => a >= b,
    _ => unreachable!(),
  })
}

/// Evaluates a unary operator over an untyped constant.
pub fn eval_unary(pos: Pos, op: ConstUnOp, x: &Constant) -> Result<Constant, CompileError> {
  Ok(match (op, x) {
    (ConstUnOp::Pos, _) => x.clone(),
    (ConstUnOp::Neg, Constant::Int(i)) => Constant::Int(-i.clone()),
    (ConstUnOp::Neg, Constant::Rune(i)) => Constant::Rune(-i.clone()),
    (ConstUnOp::Neg, Constant::Float(f)) => Constant::Float(-f.clone()),
    (ConstUnOp::Neg, Constant::Complex(re, im)) => Constant::Complex(-re.clone(), -im.clone()),
    (ConstUnOp::Not, Constant::Bool(b)) => Constant::Bool(!b),
    (ConstUnOp::Complement, Constant::Int(i)) => Constant::Int(!i.clone()),
    (ConstUnOp::Complement, Constant::Rune(i)) => Constant::Rune(!i.clone()),
    _ => return Err(CompileError::UnsupportedOperator { pos, op: format!("{op:?}"), kind: "unary".into() }),
  })
}

/// The implicit typed form used when the context is unconstrained
/// (§4.2 `default_type`).
pub fn default_type(c: &Constant, reg: &Registry) -> Type {
  match c {
    Constant::Bool(_) => reg.bool(),
    Constant::Rune(_) => reg.int(IntWidth::I32),
    Constant::Int(_) => reg.int(IntWidth::Int),
    Constant::Float(_) => reg.float(FloatWidth::F64),
    Constant::Complex(..) => reg.complex(ComplexWidth::C128),
    Constant::String(_) => reg.string(),
  }
}

/// Narrows an untyped constant to a typed value, failing with
/// `ConstantOverflow` if `target` cannot represent it (§4.2
/// `convert_untyped`).
pub fn convert_untyped(pos: Pos, c: &Constant, target: &Type, reg: &Registry) -> Result<Value, CompileError> {
  let underlying = reg.underlying(target);
  match (c, underlying.kind()) {
    (Constant::Bool(b), Kind::Bool) => Ok(Value::new(target.clone(), Prim::Bool(*b))),
    (Constant::String(s), Kind::String) => Ok(Value::new(target.clone(), Prim::String(s.clone()))),
    (Constant::Int(i) | Constant::Rune(i), Kind::Int(w)) => {
      let v = int_to_width(pos, i, *w)?;
      Ok(Value::new(target.clone(), v))
    }
    (Constant::Int(i) | Constant::Rune(i), Kind::Uint(w)) => {
      let v = uint_to_width(pos, i, *w)?;
      Ok(Value::new(target.clone(), v))
    }
    (Constant::Int(i) | Constant::Rune(i), Kind::Float(w)) => {
      let f = i.to_f64().ok_or_else(|| overflow(pos, "integer constant too large for float"))?;
      Ok(Value::new(target.clone(), float_to_width(f, *w)))
    }
    (Constant::Float(f), Kind::Float(w)) => {
      let f = f.to_f64().ok_or_else(|| overflow(pos, "float constant out of range"))?;
      Ok(Value::new(target.clone(), float_to_width(f, *w)))
    }
    (Constant::Float(f), Kind::Int(w)) => {
      if !f.is_integer() { return Err(overflow(pos, "float constant truncated")); }
      let v = int_to_width(pos, &f.to_integer(), *w)?;
      Ok(Value::new(target.clone(), v))
    }
    (Constant::Complex(re, im), Kind::Complex(w)) => {
      let (re, im) = (re.to_f64().ok_or_else(|| overflow(pos, "complex real part out of range"))?,
                      im.to_f64().ok_or_else(|| overflow(pos, "complex imaginary part out of range"))?);
      Ok(Value::new(target.clone(), complex_to_width(re, im, *w)))
    }
    (Constant::Int(i) | Constant::Rune(i), Kind::Complex(w)) => {
      let re = i.to_f64().ok_or_else(|| overflow(pos, "integer constant too large for complex"))?;
      Ok(Value::new(target.clone(), complex_to_width(re, 0.0, *w)))
    }
    (Constant::Float(f), Kind::Complex(w)) => {
      let re = f.to_f64().ok_or_else(|| overflow(pos, "float constant out of range"))?;
      Ok(Value::new(target.clone(), complex_to_width(re, 0.0, *w)))
    }
    _ => Err(CompileError::NotRepresentable { pos, target: target.clone(), constant_kind: format!("{:?}", c.kind()) }),
  }
}

fn overflow(pos: Pos, message: &str) -> CompileError {
  CompileError::ConstantOverflow { pos, message: message.to_string() }
}

fn int_to_width(pos: Pos, i: &BigInt, w: IntWidth) -> Result<Prim, CompileError> {
  macro_rules! narrow { ($t:ty, $ctor:expr) => {{
    let v: $t = i.to_i64().and_then(|v| <$t>::try_from(v).ok())
      .ok_or_else(|| overflow(pos, &format!("{i} does not fit in {}", stringify!($t))))?;
    Ok($ctor(v))
  }}}
  match w {
    IntWidth::I8 => narrow!(i8, Prim::I8),
    IntWidth::I16 => narrow!(i16, Prim::I16),
    IntWidth::I32 => narrow!(i32, Prim::I32),
    IntWidth::I64 => narrow!(i64, Prim::I64),
    IntWidth::Int => narrow!(i64, Prim::Int),
  }
}

fn uint_to_width(pos: Pos, i: &BigInt, w: UintWidth) -> Result<Prim, CompileError> {
  if i.sign() == num::bigint::Sign::Minus {
    return Err(overflow(pos, "negative constant cannot be represented by an unsigned type"));
  }
  macro_rules! narrow { ($t:ty, $ctor:expr) => {{
    let v: $t = i.to_u64().and_then(|v| <$t>::try_from(v).ok())
      .ok_or_else(|| overflow(pos, &format!("{i} does not fit in {}", stringify!($t))))?;
    Ok($ctor(v))
  }}}
  match w {
    UintWidth::U8 => narrow!(u8, Prim::U8),
    UintWidth::U16 => narrow!(u16, Prim::U16),
    UintWidth::U32 => narrow!(u32, Prim::U32),
    UintWidth::U64 => narrow!(u64, Prim::U64),
    UintWidth::Uint => narrow!(u64, Prim::Uint),
    UintWidth::Uintptr => narrow!(u64, Prim::Uintptr),
  }
}

fn float_to_width(f: f64, w: FloatWidth) -> Prim {
  match w { FloatWidth::F32 => Prim::F32(f as f32), FloatWidth::F64 => Prim::F64(f) }
}

fn complex_to_width(re: f64, im: f64, w: ComplexWidth) -> Prim {
  match w {
    ComplexWidth::C64 => Prim::C64(re as f32, im as f32),
    ComplexWidth::C128 => Prim::C128(re, im),
  }
}

/// Zero-value payload constructors, one per width, used by
/// `types::value::Value::zero` to build `var x T` / `new(T)` zero values
/// without threading a whole `Constant` through the narrowing path.
#[must_use] pub fn zero_int(w: IntWidth) -> Prim {
  match w {
    IntWidth::I8 => Prim::I8(0), IntWidth::I16 => Prim::I16(0), IntWidth::I32 => Prim::I32(0),
    IntWidth::I64 => Prim::I64(0), IntWidth::Int => Prim::Int(0),
  }
}
#[must_use] pub fn zero_uint(w: UintWidth) -> Prim {
  match w {
    UintWidth::U8 => Prim::U8(0), UintWidth::U16 => Prim::U16(0), UintWidth::U32 => Prim::U32(0),
    UintWidth::U64 => Prim::U64(0), UintWidth::Uint => Prim::Uint(0), UintWidth::Uintptr => Prim::Uintptr(0),
  }
}
#[must_use] pub fn zero_float(w: FloatWidth) -> Prim {
  match w { FloatWidth::F32 => Prim::F32(0.0), FloatWidth::F64 => Prim::F64(0.0) }
}
#[must_use] pub fn zero_complex(w: ComplexWidth) -> Prim {
  match w { ComplexWidth::C64 => Prim::C64(0.0, 0.0), ComplexWidth::C128 => Prim::C128(0.0, 0.0) }
}

/// `is_class`-style helper used by the compiler to decide if a constant's
/// *default* kind participates in a given operand-class set, without
/// needing a target type yet.
#[must_use] pub fn default_category(c: &Constant) -> KindCategory {
  match c {
    Constant::Bool(_) => KindCategory::Bool,
    Constant::Rune(_) | Constant::Int(_) => KindCategory::Int,
    Constant::Float(_) => KindCategory::Float,
    Constant::Complex(..) => KindCategory::Complex,
    Constant::String(_) => KindCategory::String,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use num::BigInt;

  fn int(n: i64) -> Constant { Constant::Int(BigInt::from(n)) }

  #[test]
  fn addition_folds() {
    let r = eval_binary(Pos::NONE, ConstBinOp::Add, &int(2), &int(3)).unwrap();
    assert_eq!(r, int(5));
  }

  #[test]
  fn division_by_zero_is_a_compile_error() {
    let err = eval_binary(Pos::NONE, ConstBinOp::Div, &int(1), &int(0)).unwrap_err();
    assert!(matches!(err, CompileError::DivisionByZero { .. }));
  }

  #[test]
  fn rem_by_zero_is_a_compile_error() {
    let err = eval_binary(Pos::NONE, ConstBinOp::Rem, &int(7), &int(0)).unwrap_err();
    assert!(matches!(err, CompileError::DivisionByZero { .. }));
  }

  #[test]
  fn complex_round_trips_through_add() {
    let a = Constant::Complex(BigRational::from_integer(1.into()), BigRational::from_integer(2.into()));
    let b = Constant::Complex(BigRational::from_integer(3.into()), BigRational::from_integer(4.into()));
    let r = eval_binary(Pos::NONE, ConstBinOp::Add, &a, &b).unwrap();
    assert_eq!(r, Constant::Complex(BigRational::from_integer(4.into()), BigRational::from_integer(6.into())));
  }

  #[test]
  fn narrowing_overflow_is_detected() {
    use crate::types::registry::Registry;
    let reg = Registry::new();
    let huge = Constant::Int(BigInt::from(1_000_000_000_000i64));
    let err = convert_untyped(Pos::NONE, &huge, &reg.int(IntWidth::I8), &reg).unwrap_err();
    assert!(matches!(err, CompileError::ConstantOverflow { .. }));
  }

  #[test]
  fn default_types_match_spec_table() {
    use crate::types::registry::Registry;
    let reg = Registry::new();
    assert_eq!(default_type(&int(1), &reg), reg.int(IntWidth::Int));
    assert_eq!(default_type(&Constant::Rune(BigInt::from(65)), &reg), reg.int(IntWidth::I32));
    assert_eq!(default_type(&Constant::Bool(true), &reg), reg.bool());
  }
}
