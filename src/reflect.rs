//! The reflection bridge (§4.7, §5): a small set of hand-written package
//! tables standing in for the host-language reflection package the source
//! interpreter uses to import arbitrary compiled packages. A tree-walking
//! interpreter written in Rust has no equivalent of reflecting over an
//! arbitrary host binary, so each bridged package is authored by hand
//! instead of generated — grounded directly on `imports/sync.go` and
//! `imports/hash.go` (see DESIGN.md).
//!
//! A [`Package`] exposes the same three tables as the originals' `Binds`,
//! `Types`, and `Proxies` maps, plus a `methods` list: `compile::Ctx::methods`
//! doesn't distinguish an interpreted method from a bridged one, so a
//! package's method implementations are merged into it exactly like any
//! user-declared method would be (§4.4 "method dispatch via function
//! desugaring").

use std::cell::RefCell;
use std::rc::Rc;

use hashbrown::HashMap;
use std::sync::RwLock;

use crate::compile::MethodInfo;
use crate::types::registry::{Field, FunctionSig, IntWidth, Kind, MethodSig, Registry, Type, UintWidth};
use crate::types::value::{FuncResult, Handle, Prim, StructData, Value};

pub struct Package {
  pub name: Rc<str>,
  pub binds: HashMap<Rc<str>, Value>,
  pub types: HashMap<Rc<str>, Type>,
  pub proxies: HashMap<Rc<str>, Type>,
  /// Bridged method implementations, keyed the same way `Ctx::methods` is:
  /// `(receiver NamedType uid, method name)`.
  pub methods: Vec<((u32, Rc<str>), Rc<MethodInfo>)>,
}

impl Package {
  fn new(name: &str) -> Self {
    Self { name: name.into(), binds: HashMap::new(), types: HashMap::new(), proxies: HashMap::new(), methods: Vec::new() }
  }
}

/// Packages reachable by import path (§4.7). Behind a `RwLock` rather than
/// a plain `RefCell`: `compile::stmt::compile_go`'s fallback runs everything
/// on one thread today, but a host scheduler importing packages lazily from
/// more than one thread is an explicit open extension point (§5), and the
/// registry is the one piece of state such a scheduler would share.
pub struct PackageRegistry {
  inner: RwLock<HashMap<Rc<str>, Rc<Package>>>,
}

impl PackageRegistry {
  #[must_use] pub fn new() -> Self { Self { inner: RwLock::new(HashMap::new()) } }

  pub fn register(&self, pkg: Package) {
    let mut guard = self.inner.write().unwrap_or_else(std::sync::PoisonError::into_inner);
    guard.insert(pkg.name.clone(), Rc::new(pkg));
  }

  #[must_use] pub fn get(&self, path: &str) -> Option<Rc<Package>> {
    let guard = self.inner.read().unwrap_or_else(std::sync::PoisonError::into_inner);
    guard.get(path).cloned()
  }

  /// Every registered import path, consumed by the `Compiler`'s package
  /// search path stub (§1): the AST has no import declaration of its own
  /// (parsing is an external collaborator, §1), so every known package is
  /// pre-imported into a freshly created [`crate::compile::Ctx`].
  #[must_use] pub fn paths(&self) -> Vec<Rc<str>> {
    let guard = self.inner.read().unwrap_or_else(std::sync::PoisonError::into_inner);
    guard.keys().cloned().collect()
  }
}

impl Default for PackageRegistry {
  fn default() -> Self { Self::new() }
}

/// Builds the registry every `Compiler` seeds a compilation unit with:
/// `sync`, `hash`, and the `interp` pseudo-package (§6).
#[must_use] pub fn default_registry(reg: &Registry) -> PackageRegistry {
  let registry = PackageRegistry::new();
  registry.register(packages::sync(reg));
  registry.register(packages::hash(reg));
  registry.register(interp_package(reg));
  registry
}

fn func_sig(reg: &Registry, params: Vec<Type>, results: Vec<Type>) -> Type {
  reg.intern(Kind::Function(FunctionSig { params: Rc::from(params), results: Rc::from(results), variadic: false }))
}

fn func_value(sig: Type, call: impl Fn(&[Value]) -> FuncResult + 'static) -> Value {
  let data = crate::types::value::FuncData { sig: sig.clone(), call: Box::new(call) };
  Value::new(sig, Prim::Handle(Handle::Func(Rc::new(data))))
}

/// `interp` publishes a version string, the minimum §6 asks for — richer
/// `Eval`/`MacroExpand`/`Parse` hooks are an open question, left
/// unsynthesized (see DESIGN.md).
fn interp_package(reg: &Registry) -> Package {
  let mut pkg = Package::new("interp");
  pkg.binds.insert("Version".into(), Value::new(reg.string(), Prim::String("0.1.0".into())));
  pkg
}

fn field_value(v: &Value, idx: usize) -> Value {
  match &v.prim {
    Prim::Handle(Handle::Struct(s)) => s.borrow().fields[idx].clone(),
    _ => panic!("bridged host object is not a struct handle"),
  }
}

fn set_field_value(v: &Value, idx: usize, new: Value) {
  match &v.prim {
    Prim::Handle(Handle::Struct(s)) => s.borrow_mut().fields[idx] = new,
    _ => panic!("bridged host object is not a struct handle"),
  }
}

fn as_bool(v: &Value) -> bool { matches!(v.prim, Prim::Bool(true)) }
fn as_int(v: &Value) -> i64 {
  match v.prim { Prim::Int(n) | Prim::I64(n) => n, Prim::I32(n) => i64::from(n), _ => 0 }
}

fn method_info(sig: Type, call: impl Fn(&[Value]) -> FuncResult + 'static) -> Rc<MethodInfo> {
  Rc::new(MethodInfo { sig, call: Rc::new(call) })
}

/// Hand-written bridge for `sync` (§4.7), grounded on `imports/sync.go`.
/// `Mutex` and `RWMutex` collapse to the same locked-flag shape and `Lock`/
/// `RLock` behave identically, since the interpreter never actually blocks a
/// second goroutine on them — `go` runs its body inline and synchronously
/// (`compile::stmt::compile_go`), so there is nothing to contend with.
pub mod packages {
  use super::*;

  #[must_use] pub fn sync(reg: &Registry) -> Package {
    let mut pkg = Package::new("sync");
    let unit_fn = func_sig(reg, vec![], vec![]);
    let bool_ty = reg.bool();
    let int_ty = reg.int(IntWidth::Int);

    let locker_methods: Rc<[MethodSig]> = Rc::from(vec![
      MethodSig { name: "Lock".into(), sig: unit_fn.clone() },
      MethodSig { name: "Unlock".into(), sig: unit_fn.clone() },
    ]);
    let locker = reg.intern(Kind::Interface(locker_methods));
    pkg.types.insert("Locker".into(), locker.clone());
    pkg.proxies.insert("Locker".into(), locker.clone());

    for name in ["Mutex", "RWMutex"] {
      let underlying = reg.intern(Kind::Struct(Rc::from(vec![
        Field { name: "locked".into(), ty: bool_ty.clone(), embedded: false },
      ])));
      let lock_sig = MethodSig { name: "Lock".into(), sig: unit_fn.clone() };
      let unlock_sig = MethodSig { name: "Unlock".into(), sig: unit_fn.clone() };
      let named = reg.declare_named(format!("sync.{name}"), underlying, Rc::from(vec![lock_sig, unlock_sig]));
      let uid = match named.kind() { Kind::Named(n) => n.uid, _ => unreachable!() };

      pkg.methods.push(((uid, "Lock".into()), method_info(unit_fn.clone(), {
        let bool_ty = bool_ty.clone();
        move |args| { set_field_value(&args[0], 0, Value::new(bool_ty.clone(), Prim::Bool(true))); FuncResult::new() }
      })));
      pkg.methods.push(((uid, "Unlock".into()), method_info(unit_fn.clone(), {
        let bool_ty = bool_ty.clone();
        move |args| { set_field_value(&args[0], 0, Value::new(bool_ty.clone(), Prim::Bool(false))); FuncResult::new() }
      })));
      pkg.types.insert(name.into(), named);
    }

    let wg_underlying = reg.intern(Kind::Struct(Rc::from(vec![
      Field { name: "counter".into(), ty: int_ty.clone(), embedded: false },
    ])));
    let add_sig = func_sig(reg, vec![int_ty.clone()], vec![]);
    let wg_methods: Rc<[MethodSig]> = Rc::from(vec![
      MethodSig { name: "Add".into(), sig: add_sig.clone() },
      MethodSig { name: "Done".into(), sig: unit_fn.clone() },
      MethodSig { name: "Wait".into(), sig: unit_fn.clone() },
    ]);
    let wg = reg.declare_named("sync.WaitGroup", wg_underlying, wg_methods);
    let wg_uid = match wg.kind() { Kind::Named(n) => n.uid, _ => unreachable!() };
    pkg.methods.push(((wg_uid, "Add".into()), method_info(add_sig, {
      let int_ty = int_ty.clone();
      move |args| {
        let delta = as_int(&args[1]);
        let cur = as_int(&field_value(&args[0], 0));
        set_field_value(&args[0], 0, Value::new(int_ty.clone(), Prim::Int(cur + delta)));
        FuncResult::new()
      }
    })));
    pkg.methods.push(((wg_uid, "Done".into()), method_info(unit_fn.clone(), {
      let int_ty = int_ty.clone();
      move |args| {
        let cur = as_int(&field_value(&args[0], 0));
        set_field_value(&args[0], 0, Value::new(int_ty.clone(), Prim::Int(cur - 1)));
        FuncResult::new()
      }
    })));
    pkg.methods.push(((wg_uid, "Wait".into()), method_info(unit_fn.clone(), |args| {
      // The interpreter never actually runs two goroutines concurrently
      // (`compile::stmt::compile_go` executes inline), so by the time
      // `Wait` observes a call every `Done` it will ever see has already
      // run; a bounded poll rather than an unconditional spin just guards
      // against a program that forgot to call `Done` at all.
      for _ in 0..1024 {
        if as_int(&field_value(&args[0], 0)) <= 0 { break; }
        std::thread::yield_now();
      }
      FuncResult::new()
    })));
    pkg.types.insert("WaitGroup".into(), wg);

    let once_underlying = reg.intern(Kind::Struct(Rc::from(vec![
      Field { name: "done".into(), ty: bool_ty.clone(), embedded: false },
    ])));
    let func_iface = reg.intern(Kind::Interface(Rc::from(vec![])));
    let do_sig = func_sig(reg, vec![func_iface], vec![]);
    let once = reg.declare_named("sync.Once", once_underlying, Rc::from(vec![MethodSig { name: "Do".into(), sig: do_sig.clone() }]));
    let once_uid = match once.kind() { Kind::Named(n) => n.uid, _ => unreachable!() };
    pkg.methods.push(((once_uid, "Do".into()), method_info(do_sig, {
      let bool_ty = bool_ty.clone();
      move |args| {
        if !as_bool(&field_value(&args[0], 0)) {
          set_field_value(&args[0], 0, Value::new(bool_ty.clone(), Prim::Bool(true)));
          if let Prim::Handle(Handle::Func(f)) = &args[1].prim { (f.call)(&[]); }
        }
        FuncResult::new()
      }
    })));
    pkg.types.insert("Once".into(), once);

    let pool_underlying = reg.intern(Kind::Struct(Rc::from(vec![])));
    let pool = reg.declare_named("sync.Pool", pool_underlying, Rc::from(vec![]));
    pkg.types.insert("Pool".into(), pool);

    let cond_underlying = reg.intern(Kind::Struct(Rc::from(vec![
      Field { name: "L".into(), ty: locker.clone(), embedded: false },
    ])));
    let cond = reg.declare_named("sync.Cond", cond_underlying, Rc::from(vec![]));
    let cond_ptr = reg.intern(Kind::Pointer(cond.clone()));
    pkg.binds.insert("NewCond".into(), func_value(func_sig(reg, vec![locker], vec![cond_ptr.clone()]), {
      let cond = cond.clone();
      move |args| {
        let data = StructData { ty: cond.clone(), fields: vec![args[0].clone()] };
        let handle = Value::new(cond.clone(), Prim::Handle(Handle::Struct(Rc::new(RefCell::new(data)))));
        let mut out = FuncResult::new();
        out.push(Value::new(cond_ptr.clone(), Prim::Handle(Handle::Pointer(Rc::new(RefCell::new(handle))))));
        out
      }
    }));
    pkg.types.insert("Cond".into(), cond);

    pkg
  }

  /// `hash`/`hash32`/`hash64` are interface-only in the original too (no
  /// `Binds`): a concrete checksum algorithm is out of scope, only the
  /// shape interpreted code type-checks against.
  #[must_use] pub fn hash(reg: &Registry) -> Package {
    let mut pkg = Package::new("hash");
    let int_ty = reg.int(IntWidth::Int);
    let uint32_ty = reg.uint(UintWidth::U32);
    let uint64_ty = reg.uint(UintWidth::U64);
    let byte_slice = reg.intern(Kind::Slice(reg.uint(UintWidth::U8)));

    let base_methods = || vec![
      MethodSig { name: "Write".into(), sig: func_sig(reg, vec![byte_slice.clone()], vec![int_ty.clone()]) },
      MethodSig { name: "Sum".into(), sig: func_sig(reg, vec![byte_slice.clone()], vec![byte_slice.clone()]) },
      MethodSig { name: "Reset".into(), sig: func_sig(reg, vec![], vec![]) },
      MethodSig { name: "Size".into(), sig: func_sig(reg, vec![], vec![int_ty.clone()]) },
      MethodSig { name: "BlockSize".into(), sig: func_sig(reg, vec![], vec![int_ty.clone()]) },
    ];

    let hash_ty = reg.intern(Kind::Interface(Rc::from(base_methods())));
    pkg.types.insert("Hash".into(), hash_ty.clone());
    pkg.proxies.insert("Hash".into(), hash_ty);

    let mut hash32_methods = base_methods();
    hash32_methods.push(MethodSig { name: "Sum32".into(), sig: func_sig(reg, vec![], vec![uint32_ty]) });
    let hash32_ty = reg.intern(Kind::Interface(Rc::from(hash32_methods)));
    pkg.types.insert("Hash32".into(), hash32_ty.clone());
    pkg.proxies.insert("Hash32".into(), hash32_ty);

    let mut hash64_methods = base_methods();
    hash64_methods.push(MethodSig { name: "Sum64".into(), sig: func_sig(reg, vec![], vec![uint64_ty]) });
    let hash64_ty = reg.intern(Kind::Interface(Rc::from(hash64_methods)));
    pkg.types.insert("Hash64".into(), hash64_ty.clone());
    pkg.proxies.insert("Hash64".into(), hash64_ty);

    pkg
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn sync_mutex_lock_unlock_flip_the_hidden_field() {
    let reg = Registry::new();
    let pkg = packages::sync(&reg);
    let mutex_ty = pkg.types["Mutex"].clone();
    let uid = match mutex_ty.kind() { Kind::Named(n) => n.uid, _ => unreachable!() };
    let lock = pkg.methods.iter().find(|((u, n), _)| *u == uid && &**n == "Lock").unwrap().1.clone();
    let unlock = pkg.methods.iter().find(|((u, n), _)| *u == uid && &**n == "Unlock").unwrap().1.clone();
    let m = Value::zero(&mutex_ty, &reg);
    (lock.call)(&[m.clone()]);
    assert!(as_bool(&field_value(&m, 0)));
    (unlock.call)(&[m.clone()]);
    assert!(!as_bool(&field_value(&m, 0)));
  }

  #[test]
  fn wait_group_add_done_reaches_zero() {
    let reg = Registry::new();
    let pkg = packages::sync(&reg);
    let wg_ty = pkg.types["WaitGroup"].clone();
    let uid = match wg_ty.kind() { Kind::Named(n) => n.uid, _ => unreachable!() };
    let find = |name: &str| pkg.methods.iter().find(|((u, n), _)| *u == uid && &**n == name).unwrap().1.clone();
    let (add, done, wait) = (find("Add"), find("Done"), find("Wait"));
    let wg = Value::zero(&wg_ty, &reg);
    (add.call)(&[wg.clone(), Value::new(reg.int(IntWidth::Int), Prim::Int(2))]);
    (done.call)(&[wg.clone()]);
    (done.call)(&[wg.clone()]);
    (wait.call)(&[wg.clone()]);
    assert_eq!(as_int(&field_value(&wg, 0)), 0);
  }

  #[test]
  fn default_registry_exposes_sync_hash_and_interp() {
    let reg = Registry::new();
    let registry = default_registry(&reg);
    let mut paths = registry.paths();
    paths.sort();
    assert_eq!(paths, vec![Rc::<str>::from("hash"), Rc::<str>::from("interp"), Rc::<str>::from("sync")]);
    assert!(registry.get("interp").unwrap().binds.contains_key("Version"));
  }
}
