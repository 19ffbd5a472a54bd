//! Typed AST interface for the macro evaluator
//!
//! The Lumen type checker produces these structures; the macro evaluator
//! reads and synthesizes them through the typed-world bridge. Only the
//! shapes the bridge traffics in live here; inference and unification are
//! the type checker's business.
//!
//! Class, enum and monomorph references are reference-counted shared cells
//! because typed structures are routinely cyclic (a class's superclass can
//! mention the class itself through a type parameter). `ClassRef`/`EnumRef`
//! equality is reference identity for the same reason.

use source_map::Pos;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

pub use syntax::{BinaryOp, UnaryOp};

/// Shared, mutable reference to a class declaration
#[derive(Clone)]
pub struct ClassRef(pub Rc<RefCell<ClassDef>>);

// Debug prints the path only; class graphs are cyclic.
impl fmt::Debug for ClassRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClassRef({})", self.path())
    }
}

impl ClassRef {
    pub fn new(def: ClassDef) -> Self {
        Self(Rc::new(RefCell::new(def)))
    }

    pub fn borrow(&self) -> std::cell::Ref<'_, ClassDef> {
        self.0.borrow()
    }

    pub fn borrow_mut(&self) -> std::cell::RefMut<'_, ClassDef> {
        self.0.borrow_mut()
    }

    pub fn path(&self) -> String {
        self.0.borrow().path()
    }
}

impl PartialEq for ClassRef {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// Shared, mutable reference to an enum declaration
#[derive(Clone)]
pub struct EnumRef(pub Rc<RefCell<EnumDef>>);

impl fmt::Debug for EnumRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EnumRef({})", self.path())
    }
}

impl EnumRef {
    pub fn new(def: EnumDef) -> Self {
        Self(Rc::new(RefCell::new(def)))
    }

    pub fn borrow(&self) -> std::cell::Ref<'_, EnumDef> {
        self.0.borrow()
    }

    pub fn borrow_mut(&self) -> std::cell::RefMut<'_, EnumDef> {
        self.0.borrow_mut()
    }

    pub fn path(&self) -> String {
        self.0.borrow().path()
    }
}

impl PartialEq for EnumRef {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// An unknown type being inferred; `None` while unbound
#[derive(Debug, Clone)]
pub struct MonoRef(pub Rc<RefCell<Option<Type>>>);

impl MonoRef {
    pub fn unbound() -> Self {
        Self(Rc::new(RefCell::new(None)))
    }

    pub fn bound(ty: Type) -> Self {
        Self(Rc::new(RefCell::new(Some(ty))))
    }
}

impl PartialEq for MonoRef {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0) || *self.0.borrow() == *other.0.borrow()
    }
}

/// A resolved Lumen type
#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    /// Unknown type under inference
    Mono(MonoRef),
    /// Class instance with type arguments
    Inst(ClassRef, Vec<Type>),
    /// Enum instance with type arguments
    Enum(EnumRef, Vec<Type>),
    /// Function type
    Fun(Vec<FunArg>, Box<Type>),
    /// Anonymous structure
    Anon(Vec<AnonField>),
    /// The dynamic top type
    Dynamic,
}

impl Type {
    /// Follow bound monomorphs down to the underlying type
    pub fn follow(&self) -> Type {
        match self {
            Type::Mono(cell) => match &*cell.0.borrow() {
                Some(inner) => inner.follow(),
                None => self.clone(),
            },
            _ => self.clone(),
        }
    }
}

/// One argument of a function type
#[derive(Debug, Clone, PartialEq)]
pub struct FunArg {
    pub name: String,
    pub opt: bool,
    pub ty: Type,
}

/// One field of an anonymous structure type
#[derive(Debug, Clone, PartialEq)]
pub struct AnonField {
    pub name: String,
    pub ty: Type,
}

/// A class declaration as produced by the type checker
#[derive(Debug, Clone, PartialEq)]
pub struct ClassDef {
    pub pack: Vec<String>,
    pub name: String,
    pub params: Vec<String>,
    pub superclass: Option<(ClassRef, Vec<Type>)>,
    pub is_interface: bool,
    pub fields: Vec<ClassField>,
    pub statics: Vec<ClassField>,
    pub pos: Pos,
}

impl ClassDef {
    pub fn path(&self) -> String {
        if self.pack.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.pack.join("."), self.name)
        }
    }
}

/// A typed class member
#[derive(Debug, Clone, PartialEq)]
pub struct ClassField {
    pub name: String,
    pub ty: Type,
    pub public: bool,
    pub kind: FieldKind,
    /// Constant initializer, when the field has one the evaluator can use
    pub constant: Option<TConst>,
    pub pos: Pos,
}

/// Kinds of typed class members
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Var,
    Method,
}

/// An enum declaration as produced by the type checker
#[derive(Debug, Clone, PartialEq)]
pub struct EnumDef {
    pub pack: Vec<String>,
    pub name: String,
    pub params: Vec<String>,
    pub ctors: Vec<EnumCtor>,
    pub pos: Pos,
}

impl EnumDef {
    pub fn path(&self) -> String {
        if self.pack.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.pack.join("."), self.name)
        }
    }

    pub fn ctor(&self, name: &str) -> Option<&EnumCtor> {
        self.ctors.iter().find(|c| c.name == name)
    }
}

/// One enum constructor
#[derive(Debug, Clone, PartialEq)]
pub struct EnumCtor {
    pub name: String,
    pub index: u32,
    pub args: Vec<(String, Type)>,
}

/// A declaration handed to the evaluator by the type checker
#[derive(Debug, Clone, PartialEq)]
pub enum TypedDecl {
    Class(ClassRef),
    Enum(EnumRef),
}

impl TypedDecl {
    pub fn path(&self) -> String {
        match self {
            TypedDecl::Class(c) => c.path(),
            TypedDecl::Enum(e) => e.path(),
        }
    }

    /// Identity comparison (same underlying declaration cell)
    pub fn same_decl(&self, other: &TypedDecl) -> bool {
        match (self, other) {
            (TypedDecl::Class(a), TypedDecl::Class(b)) => a == b,
            (TypedDecl::Enum(a), TypedDecl::Enum(b)) => a == b,
            _ => false,
        }
    }
}

/// A typed expression
#[derive(Debug, Clone, PartialEq)]
pub struct TExpr {
    pub kind: TExprKind,
    pub ty: Type,
    pub pos: Pos,
}

impl TExpr {
    pub fn new(kind: TExprKind, ty: Type, pos: Pos) -> Self {
        Self { kind, ty, pos }
    }
}

/// Typed expression forms
#[derive(Debug, Clone, PartialEq)]
pub enum TExprKind {
    Const(TConst),
    Local(String),
    ArrayDecl(Vec<TExpr>),
    Binop(BinaryOp, Box<TExpr>, Box<TExpr>),
    Unop(UnaryOp, bool, Box<TExpr>),
    Field(Box<TExpr>, String),
    Call(Box<TExpr>, Vec<TExpr>),
    If(Box<TExpr>, Box<TExpr>, Option<Box<TExpr>>),
    Block(Vec<TExpr>),
    Var(String, Option<Box<TExpr>>),
    /// `normal_while` is false for do-while loops
    While(Box<TExpr>, Box<TExpr>, bool),
    Return(Option<Box<TExpr>>),
    Break,
    Continue,
    Throw(Box<TExpr>),
    Function(Vec<(String, Type)>, Box<TExpr>),
    New(ClassRef, Vec<Type>, Vec<TExpr>),
    ObjectDecl(Vec<(String, TExpr)>),
}

/// Typed constants
#[derive(Debug, Clone, PartialEq)]
pub enum TConst {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Null,
    This,
}

impl fmt::Display for TConst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TConst::Int(i) => write!(f, "{}", i),
            TConst::Float(x) => write!(f, "{}", x),
            TConst::Str(s) => write!(f, "{:?}", s),
            TConst::Bool(b) => write!(f, "{}", b),
            TConst::Null => write!(f, "null"),
            TConst::This => write!(f, "this"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class(name: &str) -> ClassRef {
        ClassRef::new(ClassDef {
            pack: vec!["test".to_string()],
            name: name.to_string(),
            params: Vec::new(),
            superclass: None,
            is_interface: false,
            fields: Vec::new(),
            statics: Vec::new(),
            pos: Pos::unknown(),
        })
    }

    #[test]
    fn test_class_path() {
        let c = class("Widget");
        assert_eq!(c.path(), "test.Widget");
    }

    #[test]
    fn test_class_ref_identity_equality() {
        let a = class("Widget");
        let b = class("Widget");
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }

    #[test]
    fn test_cyclic_superclass_is_expressible() {
        let node = class("Node");
        let parent = class("Container");
        parent.borrow_mut().superclass = Some((node.clone(), Vec::new()));
        node.borrow_mut().superclass =
            Some((parent.clone(), vec![Type::Inst(node.clone(), Vec::new())]));

        // The cycle resolves by identity, not by infinite traversal
        let sup = node.borrow().superclass.clone();
        let (sup_ref, sup_args) = sup.expect("superclass set");
        assert_eq!(sup_ref, parent);
        assert_eq!(sup_args, vec![Type::Inst(node.clone(), Vec::new())]);
    }

    #[test]
    fn test_mono_follow() {
        let inner = Type::Dynamic;
        let bound = Type::Mono(MonoRef::bound(inner.clone()));
        assert_eq!(bound.follow(), inner);

        let unbound = Type::Mono(MonoRef::unbound());
        assert!(matches!(unbound.follow(), Type::Mono(_)));
    }

    #[test]
    fn test_enum_ctor_lookup() {
        let e = EnumRef::new(EnumDef {
            pack: Vec::new(),
            name: "Color".to_string(),
            params: Vec::new(),
            ctors: vec![
                EnumCtor {
                    name: "Red".to_string(),
                    index: 0,
                    args: Vec::new(),
                },
                EnumCtor {
                    name: "Rgb".to_string(),
                    index: 1,
                    args: vec![("value".to_string(), Type::Dynamic)],
                },
            ],
            pos: Pos::unknown(),
        });
        assert_eq!(e.borrow().ctor("Rgb").map(|c| c.index), Some(1));
        assert!(e.borrow().ctor("Blue").is_none());
    }
}
