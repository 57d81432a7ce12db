//! Handles name every value known to a runtime.
//!
//! A handle is a small `Copy` value describing *where* in the value algebra a
//! piece of data sits (a blob, a tree, a deferred computation, a relation...)
//! together with the *name* of the data it refers to. Names are either inline
//! literals (at most [`LITERAL_MAX`] bytes), process-local counters handed out
//! before hashing, or canonical content hashes.
//!
//! In memory the algebra is a tower of enums (`Fix` at the top, `Blob` and the
//! tree names at the bottom). The packed 256-bit layout only exists at the
//! serialization boundary, see [`raw::RawHandle`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{FixError, Result};

pub mod raw;

pub use raw::RawHandle;

/// Maximum number of bytes stored inline in a literal blob
pub const LITERAL_MAX: usize = 30;

/// Sizes are packed into the low 48 bits of the last word
pub const SIZE_MASK: u64 = (1 << 48) - 1;

/// Number of digest bytes kept in a canonical name
pub const DIGEST_LEN: usize = 24;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Literal {
    len: u8,
    bytes: [u8; LITERAL_MAX],
}

impl Literal {
    /// Returns `None` if `data` is too long to be inlined
    pub fn new(data: &[u8]) -> Option<Self> {
        if data.len() > LITERAL_MAX {
            return None;
        }
        let mut bytes = [0; LITERAL_MAX];
        bytes[..data.len()].copy_from_slice(data);
        Some(Self {
            len: data.len() as u8,
            bytes,
        })
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lit:{}", hex::encode(self.as_bytes()))
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest(pub [u8; DIGEST_LEN]);

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// The name of out-of-line data
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Name {
    /// Content hash, comparable across runtimes and persistable
    Canonical { digest: Digest, size: u64 },
    /// Process-local counter, only meaningful inside the creating runtime
    Local { id: u64, size: u64 },
}

impl Name {
    #[inline]
    pub fn canonical(digest: Digest, size: u64) -> Self {
        Name::Canonical {
            digest,
            size: size & SIZE_MASK,
        }
    }

    #[inline]
    pub fn local(id: u64, size: u64) -> Self {
        Name::Local {
            id,
            size: size & SIZE_MASK,
        }
    }

    #[inline]
    pub fn size(&self) -> u64 {
        match self {
            Name::Canonical { size, .. } | Name::Local { size, .. } => *size,
        }
    }

    #[inline]
    pub fn is_local(&self) -> bool {
        matches!(self, Name::Local { .. })
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Name::Canonical { digest, size } => write!(f, "{digest:?}:{size}"),
            Name::Local { id, size } => write!(f, "local#{id}:{size}"),
        }
    }
}

/// A blob is an addressed byte sequence
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Blob {
    Literal(Literal),
    Named(Name),
}

impl Blob {
    #[inline]
    pub fn literal(data: &[u8]) -> Option<Self> {
        Literal::new(data).map(Blob::Literal)
    }

    /// Little-endian literal holding `n`
    #[inline]
    pub fn from_u64(n: u64) -> Self {
        Blob::Literal(Literal::new(&n.to_le_bytes()).expect("8 bytes always fit"))
    }

    /// Reads a little-endian integer out of a literal of at most 8 bytes
    pub fn to_u64(&self) -> Option<u64> {
        match self {
            Blob::Literal(l) if l.len() <= 8 => {
                let mut buf = [0; 8];
                buf[..l.len()].copy_from_slice(l.as_bytes());
                Some(u64::from_le_bytes(buf))
            }
            _ => None,
        }
    }

    #[inline]
    pub fn size(&self) -> u64 {
        match self {
            Blob::Literal(l) => l.len() as u64,
            Blob::Named(n) => n.size(),
        }
    }

    #[inline]
    pub fn is_literal(&self) -> bool {
        matches!(self, Blob::Literal(_))
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Blob::Literal(l) => l.fmt(f),
            Blob::Named(n) => n.fmt(f),
        }
    }
}

/// The name of a tree. Tags are trees minted by the runtime and carry their
/// own flag, which takes part in the content hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TreeName {
    name: Name,
    tag: bool,
}

impl TreeName {
    #[inline]
    pub fn new(name: Name, tag: bool) -> Self {
        Self { name, tag }
    }

    #[inline]
    pub fn name(&self) -> &Name {
        &self.name
    }

    /// Number of elements
    #[inline]
    pub fn size(&self) -> u64 {
        self.name.size()
    }

    #[inline]
    pub fn is_tag(&self) -> bool {
        self.tag
    }
}

impl fmt::Debug for TreeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.tag {
            write!(f, "tag:")?;
        }
        self.name.fmt(f)
    }
}

macro_rules! tree_kind {
    ($(#[$m:meta])* $name:ident) => {
        $(#[$m])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
        pub struct $name(pub TreeName);

        impl $name {
            #[inline]
            pub fn tree(&self) -> &TreeName {
                &self.0
            }

            #[inline]
            pub fn size(&self) -> u64 {
                self.0.size()
            }
        }
    };
}

tree_kind!(
    /// A tree whose elements are all `Value`s
    ValueTree
);
tree_kind!(
    /// A tree whose elements are all `Object`s
    ObjectTree
);
tree_kind!(
    /// A tree whose elements are arbitrary `Expression`s
    ExpressionTree
);
tree_kind!(
    /// A shallow view of a `ValueTree` whose data need not be resident
    ValueTreeRef
);

/// A shallow view of a `Blob` whose data need not be resident
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct BlobRef(pub Blob);

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum Value {
    Blob(Blob),
    ValueTree(ValueTree),
    BlobRef(BlobRef),
    ValueTreeRef(ValueTreeRef),
}

/// A deferred computation
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum Thunk {
    Application(ExpressionTree),
    Selection(ObjectTree),
    Identification(Value),
}

/// A thunk wrapped with the depth to which it must be evaluated
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum Encode {
    Strict(Thunk),
    Shallow(Thunk),
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum Object {
    Value(Value),
    Thunk(Thunk),
    ObjectTree(ObjectTree),
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum Expression {
    Object(Object),
    Encode(Encode),
    ExpressionTree(ExpressionTree),
}

/// A request for a result; the unit of memoization
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum Relation {
    Eval(Object),
    Apply(ObjectTree),
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum Fix {
    Expression(Expression),
    Relation(Relation),
}

/// What a handle ultimately points at
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Payload {
    Blob(Blob),
    Tree(TreeName),
}

impl Payload {
    #[inline]
    pub fn size(&self) -> u64 {
        match self {
            Payload::Blob(b) => b.size(),
            Payload::Tree(t) => t.size(),
        }
    }

    #[inline]
    fn blob(self) -> Option<Blob> {
        match self {
            Payload::Blob(b) => Some(b),
            Payload::Tree(_) => None,
        }
    }

    #[inline]
    fn tree(self) -> Option<TreeName> {
        match self {
            Payload::Tree(t) => Some(t),
            Payload::Blob(_) => None,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ContentKind {
    Blob,
    Tree,
    Thunk,
    Tag,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Laziness {
    Strict,
    Shallow,
    Lazy,
}

// Shape codes. Every layer numbers its variants contiguously, nesting the
// codes of the layer below at a fixed offset.

impl Value {
    pub const SHAPES: u8 = 4;

    #[inline]
    pub fn code(&self) -> u8 {
        match self {
            Value::Blob(_) => 0,
            Value::ValueTree(_) => 1,
            Value::BlobRef(_) => 2,
            Value::ValueTreeRef(_) => 3,
        }
    }

    fn from_code(code: u8, payload: Payload) -> Option<Self> {
        match code {
            0 => payload.blob().map(Value::Blob),
            1 => payload.tree().map(|t| Value::ValueTree(ValueTree(t))),
            2 => payload.blob().map(|b| Value::BlobRef(BlobRef(b))),
            3 => payload.tree().map(|t| Value::ValueTreeRef(ValueTreeRef(t))),
            _ => None,
        }
    }

    pub fn payload(&self) -> Payload {
        match self {
            Value::Blob(b) | Value::BlobRef(BlobRef(b)) => Payload::Blob(*b),
            Value::ValueTree(ValueTree(t)) | Value::ValueTreeRef(ValueTreeRef(t)) => {
                Payload::Tree(*t)
            }
        }
    }

    #[inline]
    pub fn is_ref(&self) -> bool {
        matches!(self, Value::BlobRef(_) | Value::ValueTreeRef(_))
    }
}

impl Thunk {
    pub const SHAPES: u8 = 2 + Value::SHAPES;

    pub fn code(&self) -> u8 {
        match self {
            Thunk::Application(_) => 0,
            Thunk::Selection(_) => 1,
            Thunk::Identification(v) => 2 + v.code(),
        }
    }

    fn from_code(code: u8, payload: Payload) -> Option<Self> {
        match code {
            0 => payload.tree().map(|t| Thunk::Application(ExpressionTree(t))),
            1 => payload.tree().map(|t| Thunk::Selection(ObjectTree(t))),
            c if c < Self::SHAPES => Value::from_code(c - 2, payload).map(Thunk::Identification),
            _ => None,
        }
    }

    pub fn payload(&self) -> Payload {
        match self {
            Thunk::Application(ExpressionTree(t)) | Thunk::Selection(ObjectTree(t)) => {
                Payload::Tree(*t)
            }
            Thunk::Identification(v) => v.payload(),
        }
    }
}

impl Object {
    pub const SHAPES: u8 = Value::SHAPES + Thunk::SHAPES + 1;

    pub fn code(&self) -> u8 {
        match self {
            Object::Value(v) => v.code(),
            Object::Thunk(t) => Value::SHAPES + t.code(),
            Object::ObjectTree(_) => Value::SHAPES + Thunk::SHAPES,
        }
    }

    fn from_code(code: u8, payload: Payload) -> Option<Self> {
        const THUNKS: u8 = Value::SHAPES + Thunk::SHAPES;
        match code {
            c if c < Value::SHAPES => Value::from_code(c, payload).map(Object::Value),
            c if c < THUNKS => Thunk::from_code(c - Value::SHAPES, payload).map(Object::Thunk),
            THUNKS => payload.tree().map(|t| Object::ObjectTree(ObjectTree(t))),
            _ => None,
        }
    }

    pub fn payload(&self) -> Payload {
        match self {
            Object::Value(v) => v.payload(),
            Object::Thunk(t) => t.payload(),
            Object::ObjectTree(ObjectTree(t)) => Payload::Tree(*t),
        }
    }
}

impl Encode {
    pub const SHAPES: u8 = 2 * Thunk::SHAPES;

    pub fn code(&self) -> u8 {
        match self {
            Encode::Strict(t) => t.code(),
            Encode::Shallow(t) => Thunk::SHAPES + t.code(),
        }
    }

    fn from_code(code: u8, payload: Payload) -> Option<Self> {
        match code {
            c if c < Thunk::SHAPES => Thunk::from_code(c, payload).map(Encode::Strict),
            c if c < Self::SHAPES => {
                Thunk::from_code(c - Thunk::SHAPES, payload).map(Encode::Shallow)
            }
            _ => None,
        }
    }

    #[inline]
    pub fn thunk(&self) -> &Thunk {
        match self {
            Encode::Strict(t) | Encode::Shallow(t) => t,
        }
    }
}

impl Expression {
    pub const SHAPES: u8 = Object::SHAPES + Encode::SHAPES + 1;

    pub fn code(&self) -> u8 {
        match self {
            Expression::Object(o) => o.code(),
            Expression::Encode(e) => Object::SHAPES + e.code(),
            Expression::ExpressionTree(_) => Object::SHAPES + Encode::SHAPES,
        }
    }

    fn from_code(code: u8, payload: Payload) -> Option<Self> {
        const TREE: u8 = Object::SHAPES + Encode::SHAPES;
        match code {
            c if c < Object::SHAPES => Object::from_code(c, payload).map(Expression::Object),
            c if c < TREE => {
                Encode::from_code(c - Object::SHAPES, payload).map(Expression::Encode)
            }
            TREE => payload
                .tree()
                .map(|t| Expression::ExpressionTree(ExpressionTree(t))),
            _ => None,
        }
    }

    pub fn payload(&self) -> Payload {
        match self {
            Expression::Object(o) => o.payload(),
            Expression::Encode(e) => e.thunk().payload(),
            Expression::ExpressionTree(ExpressionTree(t)) => Payload::Tree(*t),
        }
    }
}

impl Relation {
    pub const SHAPES: u8 = Object::SHAPES + 1;

    pub fn code(&self) -> u8 {
        match self {
            Relation::Eval(o) => o.code(),
            Relation::Apply(_) => Object::SHAPES,
        }
    }

    fn from_code(code: u8, payload: Payload) -> Option<Self> {
        match code {
            c if c < Object::SHAPES => Object::from_code(c, payload).map(Relation::Eval),
            c if c == Object::SHAPES => payload.tree().map(|t| Relation::Apply(ObjectTree(t))),
            _ => None,
        }
    }

    pub fn payload(&self) -> Payload {
        match self {
            Relation::Eval(o) => o.payload(),
            Relation::Apply(ObjectTree(t)) => Payload::Tree(*t),
        }
    }
}

impl Fix {
    pub const SHAPES: u8 = Expression::SHAPES + Relation::SHAPES;

    pub fn code(&self) -> u8 {
        match self {
            Fix::Expression(e) => e.code(),
            Fix::Relation(r) => Expression::SHAPES + r.code(),
        }
    }

    /// Rebuilds a handle from its shape code and payload, failing if the
    /// payload does not fit the shape (e.g. a blob under a tree shape)
    pub fn from_code(code: u8, payload: Payload) -> Option<Self> {
        match code {
            c if c < Expression::SHAPES => Expression::from_code(c, payload).map(Fix::Expression),
            c if c < Self::SHAPES => {
                Relation::from_code(c - Expression::SHAPES, payload).map(Fix::Relation)
            }
            _ => None,
        }
    }

    pub fn payload(&self) -> Payload {
        match self {
            Fix::Expression(e) => e.payload(),
            Fix::Relation(r) => r.payload(),
        }
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.payload().size()
    }

    #[inline]
    pub fn is_literal(&self) -> bool {
        matches!(self.payload(), Payload::Blob(Blob::Literal(_)))
    }

    #[inline]
    pub fn is_local(&self) -> bool {
        match self.payload() {
            Payload::Blob(Blob::Named(n)) => n.is_local(),
            Payload::Blob(Blob::Literal(_)) => false,
            Payload::Tree(t) => t.name().is_local(),
        }
    }

    /// Literals name themselves, so they count as canonical
    #[inline]
    pub fn is_canonical(&self) -> bool {
        !self.is_local()
    }

    #[inline]
    pub fn is_relation(&self) -> bool {
        matches!(self, Fix::Relation(_))
    }

    /// The kind of content this handle talks about. Relations report the
    /// kind of the handle they are asking about.
    pub fn content_kind(&self) -> ContentKind {
        let is_thunk = match self {
            Fix::Expression(Expression::Encode(_))
            | Fix::Expression(Expression::Object(Object::Thunk(_)))
            | Fix::Relation(Relation::Eval(Object::Thunk(_))) => true,
            Fix::Expression(_) | Fix::Relation(_) => false,
        };
        if is_thunk {
            return ContentKind::Thunk;
        }
        match self.payload() {
            Payload::Blob(_) => ContentKind::Blob,
            Payload::Tree(t) if t.is_tag() => ContentKind::Tag,
            Payload::Tree(_) => ContentKind::Tree,
        }
    }

    #[inline]
    pub fn is_blob(&self) -> bool {
        self.content_kind() == ContentKind::Blob
    }

    #[inline]
    pub fn is_tree(&self) -> bool {
        matches!(self.content_kind(), ContentKind::Tree | ContentKind::Tag)
    }

    #[inline]
    pub fn is_thunk(&self) -> bool {
        self.content_kind() == ContentKind::Thunk
    }

    #[inline]
    pub fn is_tag(&self) -> bool {
        self.content_kind() == ContentKind::Tag
    }

    pub fn laziness(&self) -> Laziness {
        match self {
            Fix::Expression(Expression::Encode(Encode::Strict(_))) => Laziness::Strict,
            Fix::Expression(Expression::Encode(Encode::Shallow(_))) => Laziness::Shallow,
            _ => Laziness::Lazy,
        }
    }

    #[inline]
    pub fn is_strict(&self) -> bool {
        self.laziness() == Laziness::Strict
    }

    #[inline]
    pub fn is_shallow(&self) -> bool {
        self.laziness() == Laziness::Shallow
    }

    #[inline]
    pub fn is_lazy(&self) -> bool {
        self.laziness() == Laziness::Lazy
    }

    /// Checked narrowing within the sum-type lattice
    #[inline]
    pub fn try_into_kind<T: Kind>(self) -> Option<T> {
        T::from_fix(self)
    }

    /// Like `try_into_kind`, reporting a mismatch as an error
    pub fn unwrap<T: Kind>(self) -> Result<T> {
        T::from_fix(self).ok_or(FixError::KindMismatch {
            expected: T::NAME,
            found: self,
        })
    }

    /// Content equality: same payload and shape, ignoring whether a value is
    /// held as a reference or eagerly
    pub fn content_eq(&self, other: &Fix) -> bool {
        fn strip(f: &Fix) -> u8 {
            match f.try_into_kind::<Value>() {
                Some(Value::BlobRef(_)) => 0,
                Some(Value::ValueTreeRef(_)) => 1,
                _ => f.code(),
            }
        }
        self.payload() == other.payload() && strip(self) == strip(other)
    }

    /// Human readable path of the shape, e.g. `Object/Thunk/Application`
    pub fn shape_name(&self) -> String {
        let mut parts = vec![];
        let leaf = |parts: &mut Vec<&'static str>, v: &Value| {
            parts.push(match v {
                Value::Blob(_) => "Blob",
                Value::ValueTree(_) => "ValueTree",
                Value::BlobRef(_) => "BlobRef",
                Value::ValueTreeRef(_) => "ValueTreeRef",
            })
        };
        let thunk = |parts: &mut Vec<&'static str>, t: &Thunk| match t {
            Thunk::Application(_) => parts.extend(["Thunk", "Application"]),
            Thunk::Selection(_) => parts.extend(["Thunk", "Selection"]),
            Thunk::Identification(v) => {
                parts.extend(["Thunk", "Identification"]);
                leaf(parts, v)
            }
        };
        let object = |parts: &mut Vec<&'static str>, o: &Object| match o {
            Object::Value(v) => leaf(parts, v),
            Object::Thunk(t) => thunk(parts, t),
            Object::ObjectTree(_) => parts.push("ObjectTree"),
        };
        match self {
            Fix::Expression(Expression::Object(o)) => object(&mut parts, o),
            Fix::Expression(Expression::Encode(Encode::Strict(t))) => {
                parts.push("Strict");
                thunk(&mut parts, t)
            }
            Fix::Expression(Expression::Encode(Encode::Shallow(t))) => {
                parts.push("Shallow");
                thunk(&mut parts, t)
            }
            Fix::Expression(Expression::ExpressionTree(_)) => parts.push("ExpressionTree"),
            Fix::Relation(Relation::Eval(o)) => {
                parts.push("Eval");
                object(&mut parts, o)
            }
            Fix::Relation(Relation::Apply(_)) => parts.extend(["Apply", "ObjectTree"]),
        }
        parts.join("/")
    }
}

impl fmt::Display for Fix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let payload = match self.payload() {
            Payload::Blob(b) => format!("{b:?}"),
            Payload::Tree(t) => format!("{t:?}"),
        };
        write!(f, "{}({payload})", self.shape_name())
    }
}

/// A position in the lattice that a `Fix` can be narrowed to
pub trait Kind: Copy + Into<Fix> {
    const NAME: &'static str;

    fn from_fix(fix: Fix) -> Option<Self>;
}

impl Kind for Fix {
    const NAME: &'static str = "Fix";

    #[inline]
    fn from_fix(fix: Fix) -> Option<Self> {
        Some(fix)
    }
}

macro_rules! lattice {
    ($child:ident => $parent:ident :: $variant:ident) => {
        impl From<$child> for $parent {
            #[inline]
            fn from(x: $child) -> Self {
                $parent::$variant(x)
            }
        }
    };
}

lattice!(Expression => Fix::Expression);
lattice!(Relation => Fix::Relation);
lattice!(Object => Expression::Object);
lattice!(Encode => Expression::Encode);
lattice!(ExpressionTree => Expression::ExpressionTree);
lattice!(Value => Object::Value);
lattice!(Thunk => Object::Thunk);
lattice!(ObjectTree => Object::ObjectTree);
lattice!(Blob => Value::Blob);
lattice!(ValueTree => Value::ValueTree);
lattice!(BlobRef => Value::BlobRef);
lattice!(ValueTreeRef => Value::ValueTreeRef);

macro_rules! into_fix {
    ($($t:ident via $via:ident),* $(,)?) => {
        $(
            impl From<$t> for Fix {
                #[inline]
                fn from(x: $t) -> Self {
                    Fix::from($via::from(x))
                }
            }
        )*
    };
}

into_fix!(
    Object via Expression,
    Encode via Expression,
    ExpressionTree via Expression,
    Value via Object,
    Thunk via Object,
    ObjectTree via Object,
    Blob via Value,
    ValueTree via Value,
    BlobRef via Value,
    ValueTreeRef via Value,
);

macro_rules! kind {
    ($t:ident, $name:literal, |$f:ident| $body:expr) => {
        impl Kind for $t {
            const NAME: &'static str = $name;

            #[inline]
            fn from_fix($f: Fix) -> Option<Self> {
                $body
            }
        }
    };
}

kind!(Expression, "Expression", |f| match f {
    Fix::Expression(e) => Some(e),
    Fix::Relation(_) => None,
});
kind!(Relation, "Relation", |f| match f {
    Fix::Relation(r) => Some(r),
    Fix::Expression(_) => None,
});
kind!(Object, "Object", |f| match Expression::from_fix(f)? {
    Expression::Object(o) => Some(o),
    _ => None,
});
kind!(Encode, "Encode", |f| match Expression::from_fix(f)? {
    Expression::Encode(e) => Some(e),
    _ => None,
});
kind!(ExpressionTree, "ExpressionTree", |f| match Expression::from_fix(f)? {
    Expression::ExpressionTree(t) => Some(t),
    _ => None,
});
kind!(Value, "Value", |f| match Object::from_fix(f)? {
    Object::Value(v) => Some(v),
    _ => None,
});
kind!(Thunk, "Thunk", |f| match Object::from_fix(f)? {
    Object::Thunk(t) => Some(t),
    _ => None,
});
kind!(ObjectTree, "ObjectTree", |f| match Object::from_fix(f)? {
    Object::ObjectTree(t) => Some(t),
    _ => None,
});
kind!(Blob, "Blob", |f| match Value::from_fix(f)? {
    Value::Blob(b) => Some(b),
    _ => None,
});
kind!(ValueTree, "ValueTree", |f| match Value::from_fix(f)? {
    Value::ValueTree(t) => Some(t),
    _ => None,
});
kind!(BlobRef, "BlobRef", |f| match Value::from_fix(f)? {
    Value::BlobRef(b) => Some(b),
    _ => None,
});
kind!(ValueTreeRef, "ValueTreeRef", |f| match Value::from_fix(f)? {
    Value::ValueTreeRef(t) => Some(t),
    _ => None,
});
