//! Lexical environment frames (§3 "Frame", §4.6).
//!
//! The original interpreter keeps one typed array per primitive kind plus a
//! parallel array of `reflect.Value` handles, to avoid boxing primitives
//! through Go's `interface{}`. Rust's `types::value::Value` is already a
//! tagged union with no such boxing cost, so this port collapses that
//! dual-array scheme into a single slot array per frame, one cell per slot
//! — a deliberate simplification recorded in DESIGN.md.

use std::cell::RefCell;
use std::fmt;
use std::io::Write;
use std::rc::Rc;

use crate::types::value::Value;

/// A slot coordinate assigned at compile time (§3 "Slot coordinate").
/// `depth` counts parent links from the frame active at evaluation time;
/// `index` is the dense position within that frame's slot array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotAddr {
  pub depth: u32,
  pub index: u32,
}

impl SlotAddr {
  #[must_use] pub fn new(depth: u32, index: u32) -> Self { Self { depth, index } }
}

/// Package-scope state shared by every frame descending from one package's
/// root frame: the output writer `print`/`println` resolve to (§6), and the
/// package's own name for diagnostics.
pub struct PackageFrame {
  pub name: Rc<str>,
  writer: RefCell<Box<dyn Write>>,
}

impl PackageFrame {
  #[must_use] pub fn new(name: impl Into<Rc<str>>, writer: Box<dyn Write>) -> Rc<Self> {
    Rc::new(Self { name: name.into(), writer: RefCell::new(writer) })
  }

  #[must_use] pub fn stdout(name: impl Into<Rc<str>>) -> Rc<Self> {
    Self::new(name, Box::new(std::io::stdout()))
  }

  /// Resolves `env → globals → stdout` (§6 "Output side-effects").
  pub fn write(&self, s: &str) {
    let mut w = self.writer.borrow_mut();
    let _ = w.write_all(s.as_bytes());
  }
}

/// A lexical activation record: a dense `Value` slot array, a parent link,
/// the owning function's name (for diagnostics and `return` bookkeeping),
/// and a back-reference to the package's shared state.
///
/// Frames are reference-counted (`Rc<Frame>`) rather than arena-allocated:
/// interpreted closures may escape the call that created their captured
/// frame (a function literal returned from its enclosing function), so a
/// frame's lifetime must be allowed to outlive its creating call. This
/// trades a refcount bump per frame access for not needing an escape
/// analysis pass (§9 "Closures over frames").
pub struct Frame {
  /// Each slot is boxed in its own cell (rather than one dense
  /// `RefCell<Vec<Value>>`) so `&localVar` can hand out a cloned `Rc`
  /// aliasing the same storage the declaring scope reads and writes,
  /// instead of a snapshot copy. See `compile::expr`'s `UnOp::Addr` for the
  /// consumer; DESIGN.md records why this stops short of giving slice
  /// elements and struct fields the same treatment.
  slots: RefCell<Vec<Rc<RefCell<Value>>>>,
  parent: Option<Rc<Frame>>,
  pub func_name: Option<Rc<str>>,
  pub package: Rc<PackageFrame>,
}

impl fmt::Debug for Frame {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Frame")
      .field("func_name", &self.func_name)
      .field("nslots", &self.slots.borrow().len())
      .field("has_parent", &self.parent.is_some())
      .finish()
  }
}

impl Frame {
  /// Creates the package's outermost frame (§3 "the outermost frame per
  /// package is the *package frame*; it persists for the interpreter's
  /// lifetime").
  #[must_use] pub fn new_package(package: Rc<PackageFrame>, nslots: usize, zero: Value) -> Rc<Self> {
    Rc::new(Self {
      slots: RefCell::new((0..nslots).map(|_| Rc::new(RefCell::new(zero.clone()))).collect()),
      parent: None,
      func_name: None,
      package,
    })
  }

  /// Allocates a per-call or per-block frame, parented to `parent`.
  /// Released (dropped) at return if nothing captured it.
  #[must_use] pub fn new_child(parent: &Rc<Frame>, nslots: usize, func_name: Option<Rc<str>>, zero: Value) -> Rc<Self> {
    Rc::new(Self {
      slots: RefCell::new((0..nslots).map(|_| Rc::new(RefCell::new(zero.clone()))).collect()),
      parent: Some(parent.clone()),
      func_name,
      package: parent.package.clone(),
    })
  }

  /// Walks `depth` parent links once. A thunk compiled at depth *d* calls
  /// this exactly once per access; no further symbol lookup happens at
  /// runtime (§4.6).
  #[must_use] pub fn ancestor(self: &Rc<Self>, depth: u32) -> &Rc<Self> {
    let mut f = self;
    for _ in 0..depth {
      f = f.parent.as_ref().expect("slot depth exceeds frame nesting (compiler bug)");
    }
    f
  }

  #[must_use] pub fn get(self: &Rc<Self>, addr: SlotAddr) -> Value {
    self.ancestor(addr.depth).slots.borrow()[addr.index as usize].borrow().clone()
  }

  pub fn set(self: &Rc<Self>, addr: SlotAddr, v: Value) {
    *self.ancestor(addr.depth).slots.borrow()[addr.index as usize].borrow_mut() = v;
  }

  /// The shared cell backing `addr`, cloned out as an `Rc` so a pointer
  /// value can alias this slot's storage (§3 "addressable"). Writes through
  /// the returned cell are visible to every other read/write of the same
  /// slot, including ones compiled before this call.
  #[must_use] pub fn cell(self: &Rc<Self>, addr: SlotAddr) -> Rc<RefCell<Value>> {
    self.ancestor(addr.depth).slots.borrow()[addr.index as usize].clone()
  }

  /// Grows the frame's own slot array to accommodate a newly-declared
  /// local (used by block statements that introduce bindings mid-block,
  /// e.g. `:=` inside an `if`'s body).
  pub fn push_slot(&self, v: Value) -> u32 {
    let mut slots = self.slots.borrow_mut();
    let idx = slots.len() as u32;
    slots.push(Rc::new(RefCell::new(v)));
    idx
  }

  #[must_use] pub fn len(&self) -> usize { self.slots.borrow().len() }
  #[must_use] pub fn is_empty(&self) -> bool { self.len() == 0 }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::registry::{IntWidth, Registry};
  use crate::types::value::Prim;

  fn dummy_zero() -> Value {
    let reg = Registry::new();
    Value::new(reg.int(IntWidth::Int), Prim::Int(0))
  }

  #[test]
  fn depth_zero_reads_own_slots() {
    let pkg = PackageFrame::stdout("main");
    let root = Frame::new_package(pkg, 1, dummy_zero());
    root.set(SlotAddr::new(0, 0), Value::new(Registry::new().int(IntWidth::Int), Prim::Int(42)));
    assert!(matches!(root.get(SlotAddr::new(0, 0)).prim, Prim::Int(42)));
  }

  #[test]
  fn depth_one_reads_parent_slots() {
    let pkg = PackageFrame::stdout("main");
    let root = Frame::new_package(pkg, 1, dummy_zero());
    root.set(SlotAddr::new(0, 0), Value::new(Registry::new().int(IntWidth::Int), Prim::Int(7)));
    let child = Frame::new_child(&root, 1, Some(Rc::from("f")), dummy_zero());
    assert!(matches!(child.get(SlotAddr::new(1, 0)).prim, Prim::Int(7)));
  }

  #[test]
  #[should_panic(expected = "slot depth exceeds frame nesting")]
  fn depth_beyond_root_panics() {
    let pkg = PackageFrame::stdout("main");
    let root = Frame::new_package(pkg, 1, dummy_zero());
    let _ = root.get(SlotAddr::new(1, 0));
  }

  #[test]
  fn writer_receives_print_output() {
    let buf: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    struct SharedWriter(Rc<RefCell<Vec<u8>>>);
    impl Write for SharedWriter {
      fn write(&mut self, b: &[u8]) -> std::io::Result<usize> { self.0.borrow_mut().extend_from_slice(b); Ok(b.len()) }
      fn flush(&mut self) -> std::io::Result<()> { Ok(()) }
    }
    let pkg = PackageFrame::new("main", Box::new(SharedWriter(buf.clone())));
    pkg.write("hello\n");
    assert_eq!(buf.borrow().as_slice(), b"hello\n");
  }
}
