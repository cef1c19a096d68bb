//! Structured diagnostics for the compiler and the runtime.
//!
//! Mirrors the teacher's plain `#[derive(Debug)]` error enum style (see
//! `LowerErr` in the original `build_vcode.rs`) rather than reaching for
//! `thiserror`: every variant carries exactly the data a caller needs to
//! format a message and nothing more.

use std::fmt;

use crate::types::registry::Type;

/// A source position, threaded in from the AST. Line/column are 1-based;
/// `(0, 0)` is used for synthesized diagnostics that have no source span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, PartialOrd, Ord, Hash)]
pub struct Pos {
  pub line: u32,
  pub col: u32,
}

impl Pos {
  pub const NONE: Pos = Pos { line: 0, col: 0 };

  #[must_use] pub fn new(line: u32, col: u32) -> Self { Self { line, col } }
}

impl fmt::Display for Pos {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if *self == Self::NONE { write!(f, "<unknown>") } else { write!(f, "{}:{}", self.line, self.col) }
  }
}

/// Compile-time diagnostics (§7 *Type* and *Constant* taxonomy).
#[derive(Debug, Clone, PartialEq)]
pub enum CompileError {
  /// Forwarded unchanged from the (out of scope) parser collaborator.
  Parse { pos: Pos, message: String },
  TypeMismatch { pos: Pos, expected: Type, found: Type },
  NotAssignable { pos: Pos, src: Type, dst: Type },
  Redeclared { pos: Pos, name: String },
  UndeclaredIdent { pos: Pos, name: String },
  NotAddressable { pos: Pos },
  UnsupportedOperator { pos: Pos, op: String, kind: String },
  ArgCount { pos: Pos, builtin: String, min: usize, max: Option<usize>, got: usize },
  ArgType { pos: Pos, builtin: String, message: String },
  UndeclaredLabel { pos: Pos, name: String },
  ConstantOverflow { pos: Pos, message: String },
  NegativeShift { pos: Pos },
  DivisionByZero { pos: Pos },
  /// An untyped constant cannot be narrowed to the target type at all
  /// (wrong kind, e.g. a string constant converted to a numeric type).
  NotRepresentable { pos: Pos, target: Type, constant_kind: String },
}

impl CompileError {
  /// Errors after which continuing to compile the rest of the unit is
  /// unsafe, per §7: "unless the error would destabilize subsequent
  /// passes (e.g. an unresolvable identifier used as a type)".
  #[must_use] pub fn is_fatal(&self) -> bool {
    matches!(self, CompileError::UndeclaredIdent { .. })
  }

  #[must_use] pub fn pos(&self) -> Pos {
    match self {
      CompileError::Parse { pos, .. }
      | CompileError::TypeMismatch { pos, .. }
      | CompileError::NotAssignable { pos, .. }
      | CompileError::Redeclared { pos, .. }
      | CompileError::UndeclaredIdent { pos, .. }
      | CompileError::NotAddressable { pos }
      | CompileError::UnsupportedOperator { pos, .. }
      | CompileError::ArgCount { pos, .. }
      | CompileError::ArgType { pos, .. }
      | CompileError::UndeclaredLabel { pos, .. }
      | CompileError::ConstantOverflow { pos, .. }
      | CompileError::NegativeShift { pos }
      | CompileError::DivisionByZero { pos }
      | CompileError::NotRepresentable { pos, .. } => *pos,
    }
  }
}

impl fmt::Display for CompileError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let pos = self.pos();
    match self {
      CompileError::Parse { message, .. } => write!(f, "{pos}: parse error: {message}"),
      CompileError::TypeMismatch { expected, found, .. } =>
        write!(f, "{pos}: type mismatch: expected {expected:?}, found {found:?}"),
      CompileError::NotAssignable { src, dst, .. } =>
        write!(f, "{pos}: cannot assign {src:?} to {dst:?}"),
      CompileError::Redeclared { name, .. } => write!(f, "{pos}: {name} redeclared in this block"),
      CompileError::UndeclaredIdent { name, .. } => write!(f, "{pos}: undeclared identifier: {name}"),
      CompileError::NotAddressable { .. } => write!(f, "{pos}: cannot take address of expression"),
      CompileError::UnsupportedOperator { op, kind, .. } =>
        write!(f, "{pos}: operator {op} not supported on type {kind}"),
      CompileError::ArgCount { builtin, min, max, got, .. } => match max {
        Some(max) if max == min => write!(f, "{pos}: {builtin} expects {min} argument(s), got {got}"),
        Some(max) => write!(f, "{pos}: {builtin} expects {min}-{max} argument(s), got {got}"),
        None => write!(f, "{pos}: {builtin} expects at least {min} argument(s), got {got}"),
      },
      CompileError::ArgType { builtin, message, .. } => write!(f, "{pos}: {builtin}: {message}"),
      CompileError::UndeclaredLabel { name, .. } => write!(f, "{pos}: label {name} not declared"),
      CompileError::ConstantOverflow { message, .. } => write!(f, "{pos}: constant overflow: {message}"),
      CompileError::NegativeShift { .. } => write!(f, "{pos}: negative shift count"),
      CompileError::DivisionByZero { .. } => write!(f, "{pos}: division by zero"),
      CompileError::NotRepresentable { target, constant_kind, .. } =>
        write!(f, "{pos}: cannot convert {constant_kind} constant to type {target:?}"),
    }
  }
}

impl std::error::Error for CompileError {}

/// Runtime diagnostics (§7 *Runtime* taxonomy). Raised by panicking the
/// executing host thread with this payload; `recover` catches it via
/// `std::panic::catch_unwind` at the deferred-call boundary (see
/// `compile::stmt::run_deferred`).
#[derive(Debug, Clone)]
pub enum RuntimeError {
  DivisionByZero,
  NilDereference,
  IndexOutOfRange { index: i64, len: usize },
  AssertionFailed { want: String },
  SendOnClosed,
  NegativeShift,
  /// A user-level `panic(v)`. The payload is a `types::value::Value` in
  /// every real use, but the error module does not depend on `types::value`
  /// to avoid a cycle, so callers downcast via `Panic::value`.
  Panic(Box<dyn std::any::Any + Send>),
}

impl fmt::Display for RuntimeError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      RuntimeError::DivisionByZero => write!(f, "runtime error: integer divide by zero"),
      RuntimeError::NilDereference => write!(f, "runtime error: invalid memory address or nil pointer dereference"),
      RuntimeError::IndexOutOfRange { index, len } =>
        write!(f, "runtime error: index out of range [{index}] with length {len}"),
      RuntimeError::AssertionFailed { want } => write!(f, "interface conversion: assertion failed (wanted {want})"),
      RuntimeError::SendOnClosed => write!(f, "send on closed channel"),
      RuntimeError::NegativeShift => write!(f, "runtime error: negative shift amount"),
      RuntimeError::Panic(_) => write!(f, "panic"),
    }
  }
}

/// Abandons execution with a structured runtime error, the Rust analogue of
/// the source language's `panic`/unwind-to-`recover` mechanism.
pub fn raise(err: RuntimeError) -> ! {
  std::panic::panic_any(err)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn pos_display_unknown() {
    assert_eq!(Pos::NONE.to_string(), "<unknown>");
    assert_eq!(Pos::new(3, 7).to_string(), "3:7");
  }

  #[test]
  fn fatal_classification() {
    assert!(CompileError::UndeclaredIdent { pos: Pos::NONE, name: "x".into() }.is_fatal());
    assert!(!CompileError::Redeclared { pos: Pos::NONE, name: "x".into() }.is_fatal());
  }
}
