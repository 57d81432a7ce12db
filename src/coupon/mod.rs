//! Coupons are transient certificates of evaluation progress.
//!
//! Each coupon is an `{lhs, rhs}` pair asserting one fact about the
//! evaluation of `lhs`. They can only be minted by the `CouponCollector`,
//! which checks the fact against a `RuntimeStorage`, or derived from other
//! coupons by the pure functions in [`tagger`]. The scheduler saves them in its
//! continuation so that finished sub-evaluations are never walked twice.
//!
//! Coupons are never persisted.

use std::fmt;

use crate::handle::{Expression, Fix, Object, ObjectTree, Thunk, Value};

pub mod collector;
pub mod tagger;

pub use collector::CouponCollector;

macro_rules! coupon {
    ($(#[$doc:meta])* $name:ident, $lhs:ty => $rhs:ty) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name {
            lhs: $lhs,
            rhs: $rhs,
        }

        impl $name {
            #[inline]
            pub(crate) fn new(lhs: $lhs, rhs: $rhs) -> Self {
                Self { lhs, rhs }
            }

            #[inline]
            pub fn lhs(&self) -> $lhs {
                self.lhs
            }

            #[inline]
            pub fn rhs(&self) -> $rhs {
                self.rhs
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(
                    f,
                    "{}({} => {})",
                    stringify!($name),
                    Fix::from(self.lhs),
                    Fix::from(self.rhs)
                )
            }
        }
    };
}

coupon!(
    /// `lhs` and `rhs` name the same content
    EquivalenceTag, Fix => Fix
);
coupon!(
    /// `lhs` evaluates strictly to `rhs`
    EvalTag, Object => Value
);
coupon!(
    /// `lhs` evaluates one level deep to `rhs`
    ShallowTag, Object => Object
);
coupon!(
    /// `lhs` reduces to `rhs`
    ReduceTag, Expression => Object
);
coupon!(
    /// The combination `lhs` applies to `rhs`
    ApplyTag, ObjectTree => Object
);
coupon!(
    /// The thunk `lhs` forces to `rhs`
    ThinkTag, Thunk => Object
);

/// Any coupon, as stored in a scheduler continuation
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Coupon {
    Equivalence(EquivalenceTag),
    Eval(EvalTag),
    Shallow(ShallowTag),
    Reduce(ReduceTag),
    Apply(ApplyTag),
    Think(ThinkTag),
}

macro_rules! coupon_variant {
    ($($variant:ident($t:ident) => $getter:ident),* $(,)?) => {
        $(
            impl From<$t> for Coupon {
                #[inline]
                fn from(tag: $t) -> Self {
                    Coupon::$variant(tag)
                }
            }
        )*

        impl Coupon {
            $(
                #[inline]
                pub fn $getter(self) -> Option<$t> {
                    match self {
                        Coupon::$variant(tag) => Some(tag),
                        _ => None,
                    }
                }
            )*

            /// The handle this coupon is about
            pub fn lhs(&self) -> Fix {
                match self {
                    $(Coupon::$variant(tag) => tag.lhs().into(),)*
                }
            }

            /// The handle this coupon certifies `lhs` leads to
            pub fn rhs(&self) -> Fix {
                match self {
                    $(Coupon::$variant(tag) => tag.rhs().into(),)*
                }
            }
        }
    };
}

coupon_variant!(
    Equivalence(EquivalenceTag) => equivalence,
    Eval(EvalTag) => eval,
    Shallow(ShallowTag) => shallow,
    Reduce(ReduceTag) => reduce,
    Apply(ApplyTag) => apply,
    Think(ThinkTag) => think,
);

impl ReduceTag {
    /// Objects reduce to themselves
    #[inline]
    pub fn object(object: Object) -> Self {
        Self::new(Expression::Object(object), object)
    }
}

impl ShallowTag {
    /// A value evaluates shallowly to a reference to itself and an object
    /// tree to itself. Thunks need forcing first.
    pub fn immediate(object: Object) -> Option<Self> {
        match object {
            Object::Value(v) => Some(Self::new(object, Object::Value(crate::evaluator::lower(v)))),
            Object::ObjectTree(_) => Some(Self::new(object, object)),
            Object::Thunk(_) => None,
        }
    }
}

impl EvalTag {
    /// Whether `rhs` no longer depends on anything unevaluated
    pub fn is_normal(&self) -> bool {
        matches!(self.rhs, Value::Blob(_) | Value::ValueTree(_))
    }
}
