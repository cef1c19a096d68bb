//! The symbol table and binding resolver (§4.3): maps identifiers at compile
//! time to slot coordinates, constant values, types, macros or built-ins.

use std::rc::Rc;

use hashbrown::HashMap;

use crate::env::SlotAddr;
use crate::error::{CompileError, Pos};
use crate::types::constant::Constant;
use crate::types::registry::Type;
use crate::types::value::Value;

/// Either side of the untyped/typed constant divide a declared `const` can
/// land on (`const x = 5` vs `const x int = 5`).
#[derive(Debug, Clone)]
pub enum ConstValue {
  Untyped(Constant),
  Typed(Value),
}

#[derive(Debug, Clone)]
pub enum BindingKind {
  Const(ConstValue),
  /// `index` is the slot position within the frame this binding's *own*
  /// scope allocates; `resolve` combines it with the caller's scope-nesting
  /// distance to produce a full [`SlotAddr`].
  Var { index: u32, ty: Type },
  Func { index: u32, ty: Type },
  Type(Type),
  /// The macro expander is an external collaborator (§1); a symbol-table
  /// entry only records that the name is reserved and its declared arity,
  /// so ordinary identifier lookup can tell a macro use from a call.
  Macro { arity: Option<usize> },
  Builtin,
}

#[derive(Debug, Clone)]
pub struct Binding {
  pub name: Rc<str>,
  pub pos: Pos,
  pub kind: BindingKind,
}

struct Scope {
  bindings: HashMap<Rc<str>, Binding>,
  next_slot: u32,
}

impl Scope {
  fn new() -> Self { Self { bindings: HashMap::new(), next_slot: 0 } }
}

/// A stack of lexical scopes (§4.3). Scope 0 is the package scope and is
/// never popped. `iota` is installed and removed around each `const` group
/// (invariant (c)) by mutating the current scope directly, bypassing the
/// ordinary redeclaration check that applies to user names.
pub struct SymbolTable {
  scopes: Vec<Scope>,
}

impl Default for SymbolTable {
  fn default() -> Self { Self::new() }
}

impl SymbolTable {
  #[must_use] pub fn new() -> Self { Self { scopes: vec![Scope::new()] } }

  pub fn push_scope(&mut self) { self.scopes.push(Scope::new()); }

  pub fn pop_scope(&mut self) {
    assert!(self.scopes.len() > 1, "cannot pop the package scope");
    self.scopes.pop();
  }

  /// The depth a binding declared in the current (innermost) scope will be
  /// found at, from that same scope: always 0. Useful for assembling a
  /// `SlotAddr` right after a `declare_var`/`declare_func` call.
  #[must_use] pub fn current_depth(&self) -> u32 { 0 }

  /// How many slots the current (innermost) scope has handed out so far.
  /// The statement compiler reads this when a block or function body
  /// finishes compiling, to size the `env::Frame` it allocates.
  #[must_use] pub fn current_scope_slots(&self) -> u32 {
    self.scopes.last().expect("at least the package scope always exists").next_slot
  }

  /// How many scopes are currently open, package scope included. Used by
  /// the statement compiler to sanity-check `push_scope`/`pop_scope`
  /// pairing around blocks.
  #[must_use] pub fn depth(&self) -> usize { self.scopes.len() }

  fn declare(&mut self, pos: Pos, name: impl Into<Rc<str>>, kind: BindingKind) -> Result<(), CompileError> {
    let name = name.into();
    let scope = self.scopes.last_mut().expect("at least the package scope always exists");
    if scope.bindings.contains_key(&name) {
      return Err(CompileError::Redeclared { pos, name: name.to_string() });
    }
    scope.bindings.insert(name.clone(), Binding { name, pos, kind });
    Ok(())
  }

  pub fn declare_const(&mut self, pos: Pos, name: impl Into<Rc<str>>, value: ConstValue) -> Result<(), CompileError> {
    self.declare(pos, name, BindingKind::Const(value))
  }

  pub fn declare_type(&mut self, pos: Pos, name: impl Into<Rc<str>>, ty: Type) -> Result<(), CompileError> {
    self.declare(pos, name, BindingKind::Type(ty))
  }

  pub fn declare_macro(&mut self, pos: Pos, name: impl Into<Rc<str>>, arity: Option<usize>) -> Result<(), CompileError> {
    self.declare(pos, name, BindingKind::Macro { arity })
  }

  pub fn declare_builtin(&mut self, name: impl Into<Rc<str>>) -> Result<(), CompileError> {
    self.declare(Pos::NONE, name, BindingKind::Builtin)
  }

  /// Allocates the next free slot in the current scope and declares `name`
  /// as a variable there, returning the coordinate a thunk should close
  /// over (depth 0 relative to this scope; the expression compiler adds
  /// however many scopes separate the use site).
  pub fn declare_var(&mut self, pos: Pos, name: impl Into<Rc<str>>, ty: Type) -> Result<SlotAddr, CompileError> {
    let scope = self.scopes.last_mut().expect("at least the package scope always exists");
    let index = scope.next_slot;
    scope.next_slot += 1;
    self.declare(pos, name, BindingKind::Var { index, ty })?;
    Ok(SlotAddr::new(0, index))
  }

  pub fn declare_func(&mut self, pos: Pos, name: impl Into<Rc<str>>, ty: Type) -> Result<SlotAddr, CompileError> {
    let scope = self.scopes.last_mut().expect("at least the package scope always exists");
    let index = scope.next_slot;
    scope.next_slot += 1;
    self.declare(pos, name, BindingKind::Func { index, ty })?;
    Ok(SlotAddr::new(0, index))
  }

  /// Looks up `name` from the innermost scope outward, returning the
  /// binding and how many scopes separate the use site from its declaring
  /// scope (the `depth` half of a `SlotAddr`, for `Var`/`Func` bindings).
  #[must_use] pub fn resolve(&self, name: &str) -> Option<(&Binding, u32)> {
    let n = self.scopes.len();
    for (i, scope) in self.scopes.iter().enumerate().rev() {
      if let Some(b) = scope.bindings.get(name) {
        return Some((b, (n - 1 - i) as u32));
      }
    }
    None
  }

  /// Convenience over [`Self::resolve`] for the common case of reading a
  /// variable's full slot coordinate.
  #[must_use] pub fn resolve_slot(&self, name: &str) -> Option<SlotAddr> {
    let (binding, depth) = self.resolve(name)?;
    match binding.kind {
      BindingKind::Var { index, .. } | BindingKind::Func { index, .. } => Some(SlotAddr::new(depth, index)),
      _ => None,
    }
  }

  /// Installs `iota` bound to `n` in the current scope (§4.3, invariant
  /// (c)). Called once per `const` group, then once more per spec within
  /// the group with an incremented value.
  pub fn set_iota(&mut self, n: i64) {
    let scope = self.scopes.last_mut().expect("at least the package scope always exists");
    scope.bindings.insert(
      Rc::from("iota"),
      Binding { name: Rc::from("iota"), pos: Pos::NONE, kind: BindingKind::Const(ConstValue::Untyped(Constant::Int(n.into()))) },
    );
  }

  pub fn clear_iota(&mut self) {
    self.scopes.last_mut().expect("at least the package scope always exists").bindings.remove("iota");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::registry::{IntWidth, Registry};
  use num::BigInt;

  #[test]
  fn redeclaration_in_same_scope_fails() {
    let mut st = SymbolTable::new();
    let reg = Registry::new();
    st.declare_var(Pos::NONE, "x", reg.int(IntWidth::Int)).unwrap();
    let err = st.declare_var(Pos::NONE, "x", reg.int(IntWidth::Int)).unwrap_err();
    assert!(matches!(err, CompileError::Redeclared { .. }));
  }

  #[test]
  fn shadowing_in_inner_scope_is_allowed() {
    let mut st = SymbolTable::new();
    let reg = Registry::new();
    st.declare_var(Pos::NONE, "x", reg.int(IntWidth::Int)).unwrap();
    st.push_scope();
    st.declare_var(Pos::NONE, "x", reg.bool()).unwrap();
    let (binding, depth) = st.resolve("x").unwrap();
    assert_eq!(depth, 0);
    assert!(matches!(&binding.kind, BindingKind::Var { ty, .. } if *ty == reg.bool()));
    st.pop_scope();
    let (binding, depth) = st.resolve("x").unwrap();
    assert_eq!(depth, 0);
    assert!(matches!(&binding.kind, BindingKind::Var { ty, .. } if *ty == reg.int(IntWidth::Int)));
  }

  #[test]
  fn resolve_reports_scope_nesting_depth() {
    let mut st = SymbolTable::new();
    let reg = Registry::new();
    st.declare_var(Pos::NONE, "x", reg.int(IntWidth::Int)).unwrap();
    st.push_scope();
    st.push_scope();
    let (_, depth) = st.resolve("x").unwrap();
    assert_eq!(depth, 2);
  }

  #[test]
  fn iota_increments_across_a_const_group() {
    let mut st = SymbolTable::new();
    st.set_iota(0);
    let (b, _) = st.resolve("iota").unwrap();
    assert!(matches!(&b.kind, BindingKind::Const(ConstValue::Untyped(Constant::Int(n))) if *n == BigInt::from(0)));
    st.set_iota(1);
    let (b, _) = st.resolve("iota").unwrap();
    assert!(matches!(&b.kind, BindingKind::Const(ConstValue::Untyped(Constant::Int(n))) if *n == BigInt::from(1)));
    st.clear_iota();
    assert!(st.resolve("iota").is_none());
  }

  #[test]
  fn undeclared_identifier_resolves_to_none() {
    let st = SymbolTable::new();
    assert!(st.resolve("nope").is_none());
  }
}
