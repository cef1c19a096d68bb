//! The AST shape the compiler consumes (§6 "Input AST").
//!
//! The surface parser and macro expander are external collaborators (§1);
//! this module only fixes the node shapes those collaborators are assumed to
//! already produce, so `compile::expr` and `compile::stmt` have something
//! concrete to pattern-match on.

use std::rc::Rc;

use num::{BigInt, BigRational};

use crate::error::Pos;

pub type Ident = Rc<str>;

#[derive(Debug, Clone)]
pub enum Lit {
  Int(BigInt),
  Float(BigRational),
  Imaginary(BigRational),
  Char(BigInt),
  String(Rc<str>),
  Bool(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
  Add, Sub, Mul, Div, Rem,
  And, Or, Xor, AndNot, Shl, Shr,
  Eq, Ne, Lt, Le, Gt, Ge,
  LogAnd, LogOr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
  Pos, Neg, Not, Complement,
  /// `&x`
  Addr,
  /// `*x`
  Deref,
  /// `<-ch`
  Recv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
  /// `=`
  Plain,
  /// `+=`, `-=`, … — carries the corresponding `BinOp`.
  Compound(BinOp),
  /// `++`/`--`, modeled as a unary assignment target with a direction.
  Inc,
  Dec,
}

#[derive(Debug, Clone)]
pub struct Expr {
  pub pos: Pos,
  pub kind: ExprKind,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
  Ident(Ident),
  Lit(Lit),
  Binary { op: BinOp, x: Box<Expr>, y: Box<Expr> },
  Unary { op: UnOp, x: Box<Expr> },
  Call { func: Box<Expr>, args: Vec<Expr>, ellipsis: bool },
  FuncLit { sig: Rc<FuncSig>, body: Block },
  CompositeLit { ty: Option<TypeExpr>, elements: Vec<CompositeElt> },
  Index { x: Box<Expr>, index: Box<Expr> },
  Slice { x: Box<Expr>, low: Option<Box<Expr>>, high: Option<Box<Expr>>, max: Option<Box<Expr>> },
  Selector { x: Box<Expr>, field: Ident },
  TypeAssert { x: Box<Expr>, ty: Option<TypeExpr> },
  Conversion { ty: TypeExpr, x: Box<Expr> },
  Paren(Box<Expr>),
  /// A bare type occupying an expression position — only legal as the
  /// first argument to `make`/`new`, mirroring how the source grammar
  /// itself lets a type stand in for an expression there.
  Type(TypeExpr),
}

/// An unresolved type reference as written in source; the expression/
/// statement compiler resolves these against the symbol table and type
/// registry to produce a canonical `types::registry::Type`.
#[derive(Debug, Clone)]
pub enum TypeExpr {
  Named(Ident),
  Qualified(Ident, Ident),
  Pointer(Box<TypeExpr>),
  Array(Box<Expr>, Box<TypeExpr>),
  Slice(Box<TypeExpr>),
  Map(Box<TypeExpr>, Box<TypeExpr>),
  Channel(ChanDirExpr, Box<TypeExpr>),
  Func(Rc<FuncSig>),
  Struct(Vec<FieldDecl>),
  Interface(Vec<MethodDecl>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChanDirExpr { Send, Recv, Both }

#[derive(Debug, Clone)]
pub struct FieldDecl {
  pub name: Ident,
  pub ty: TypeExpr,
  pub embedded: bool,
}

#[derive(Debug, Clone)]
pub struct MethodDecl {
  pub name: Ident,
  pub sig: Rc<FuncSig>,
}

#[derive(Debug, Clone)]
pub struct ParamDecl {
  pub name: Option<Ident>,
  pub ty: TypeExpr,
}

#[derive(Debug, Clone)]
pub struct FuncSig {
  pub params: Vec<ParamDecl>,
  pub results: Vec<ParamDecl>,
  pub variadic: bool,
}

#[derive(Debug, Clone)]
pub struct CompositeElt {
  pub key: Option<Expr>,
  pub value: Expr,
}

pub type Block = Vec<Stmt>;

#[derive(Debug, Clone)]
pub struct Stmt {
  pub pos: Pos,
  pub label: Option<Ident>,
  pub kind: StmtKind,
}

#[derive(Debug, Clone)]
pub struct ConstSpec {
  pub pos: Pos,
  pub names: Vec<Ident>,
  pub ty: Option<TypeExpr>,
  pub values: Vec<Expr>,
}

#[derive(Debug, Clone)]
pub struct VarSpec {
  pub pos: Pos,
  pub names: Vec<Ident>,
  pub ty: Option<TypeExpr>,
  pub values: Vec<Expr>,
}

#[derive(Debug, Clone)]
pub struct TypeSpec {
  pub pos: Pos,
  pub name: Ident,
  pub ty: TypeExpr,
  pub alias: bool,
}

#[derive(Debug, Clone)]
pub struct FuncDecl {
  pub pos: Pos,
  pub name: Ident,
  pub receiver: Option<ParamDecl>,
  pub sig: Rc<FuncSig>,
  pub body: Option<Block>,
}

#[derive(Debug, Clone)]
pub struct SwitchCase {
  pub values: Vec<Expr>,
  pub body: Block,
}

#[derive(Debug, Clone)]
pub struct TypeSwitchCase {
  pub types: Vec<Option<TypeExpr>>,
  pub body: Block,
}

#[derive(Debug, Clone)]
pub enum SelectCase {
  Send { chan: Expr, value: Expr, body: Block },
  Recv { bind: Option<Ident>, ok_bind: Option<Ident>, define: bool, chan: Expr, body: Block },
  Default { body: Block },
}

#[derive(Debug, Clone)]
pub enum StmtKind {
  Expr(Expr),
  Send { chan: Expr, value: Expr },
  Assign { lhs: Vec<Expr>, op: AssignOp, rhs: Vec<Expr> },
  ShortVarDecl { names: Vec<Ident>, rhs: Vec<Expr> },
  ConstDecl(Vec<ConstSpec>),
  VarDecl(Vec<VarSpec>),
  TypeDecl(Vec<TypeSpec>),
  FuncDecl(Rc<FuncDecl>),
  Block(Block),
  If { init: Option<Box<Stmt>>, cond: Expr, then: Block, els: Option<Box<Stmt>> },
  For { init: Option<Box<Stmt>>, cond: Option<Expr>, post: Option<Box<Stmt>>, body: Block },
  ForRange { key: Option<Expr>, value: Option<Expr>, define: bool, x: Expr, body: Block },
  Switch { init: Option<Box<Stmt>>, tag: Option<Expr>, cases: Vec<SwitchCase> },
  TypeSwitch { init: Option<Box<Stmt>>, bind: Option<Ident>, x: Expr, cases: Vec<TypeSwitchCase> },
  Select { cases: Vec<SelectCase> },
  Return(Vec<Expr>),
  Break(Option<Ident>),
  Continue(Option<Ident>),
  Goto(Ident),
  Defer(Expr),
  Go(Expr),
  Empty,
}
