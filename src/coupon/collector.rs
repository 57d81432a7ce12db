use std::sync::Arc;

use super::{ApplyTag, EquivalenceTag, EvalTag, ReduceTag, ShallowTag, ThinkTag};
use crate::error::{FixError, Pending, Result};
use crate::evaluator::{parse_selection, ready, Evaluator, FixRuntime};
use crate::handle::{
    Blob, BlobRef, Expression, ExpressionTree, Fix, Object, ObjectTree, Relation, Thunk, TreeName,
    Value, ValueTree, ValueTreeRef,
};
use crate::storage::RuntimeStorage;

/// Mints coupons for facts that can be checked against a storage: resident
/// data, memoized relations and selections.
#[derive(Clone, Copy, Debug)]
pub struct CouponCollector<'a> {
    storage: &'a RuntimeStorage,
}

impl<'a> CouponCollector<'a> {
    pub fn new(storage: &'a RuntimeStorage) -> Self {
        Self { storage }
    }

    /// A local handle is equivalent to its canonical form
    pub fn canonical(&self, handle: Fix) -> Result<EquivalenceTag> {
        Ok(EquivalenceTag::new(handle, self.storage.canonicalize(handle)?))
    }

    /// A resident blob is its own strict value
    pub fn blob(&self, blob: Blob) -> Result<EvalTag> {
        self.storage.get_blob(&blob)?;
        let value = Value::Blob(blob);
        Ok(EvalTag::new(Object::Value(value), value))
    }

    /// Forcing an identification reveals the eager form of its value
    pub fn identify(&self, value: Value) -> Result<ThinkTag> {
        let eager = match value {
            Value::Blob(b) | Value::BlobRef(BlobRef(b)) => {
                self.storage.get_blob(&b)?;
                Value::Blob(b)
            }
            Value::ValueTree(ValueTree(t)) | Value::ValueTreeRef(ValueTreeRef(t)) => {
                self.storage.get_tree(&t)?;
                Value::ValueTree(ValueTree(t))
            }
        };
        Ok(ThinkTag::new(
            Thunk::Identification(value),
            Object::Value(eager),
        ))
    }

    pub fn apply(&self, combination: ObjectTree) -> Option<ApplyTag> {
        self.storage
            .get_result(&Relation::Apply(combination))
            .map(|result| ApplyTag::new(combination, result))
    }

    pub fn eval(&self, object: Object) -> Result<Option<EvalTag>> {
        self.storage
            .get_result(&Relation::Eval(object))
            .map(|result| -> Result<EvalTag> {
                Ok(EvalTag::new(object, Fix::from(result).unwrap::<Value>()?))
            })
            .transpose()
    }

    /// An expression tree whose elements are all objects reduces to the
    /// object tree with the same name
    pub fn retype(&self, tree: ExpressionTree) -> Result<Option<ReduceTag>> {
        let elements = self.storage.get_tree(tree.tree())?;
        let objects = elements
            .iter()
            .all(|e| e.try_into_kind::<Object>().is_some());
        Ok(objects.then(|| {
            ReduceTag::new(
                Expression::ExpressionTree(tree),
                Object::ObjectTree(ObjectTree(tree.0)),
            )
        }))
    }

    /// Performs a selection whose target has been evaluated shallowly
    pub fn select(&self, selection: ObjectTree, target: ShallowTag) -> Pending<ThinkTag> {
        let elements = self.storage.get_tree(selection.tree())?;
        let (lhs, range) = parse_selection(selection, &elements)?;
        if lhs != target.lhs() {
            return Err(FixError::KindMismatch {
                expected: "coupon for the selection target",
                found: target.lhs().into(),
            });
        }
        let result = ready!(Evaluator::new(self).select_from(target.rhs(), range));
        Ok(Some(ThinkTag::new(Thunk::Selection(selection), result)))
    }

    /// Records an eval coupon in the memo table. Returns the coupon for the
    /// stored result, which is the first one recorded.
    pub fn materialize(&self, tag: EvalTag) -> Result<EvalTag> {
        let stored = self
            .storage
            .create_result(Relation::Eval(tag.lhs()), Object::Value(tag.rhs()))?;
        Ok(EvalTag::new(tag.lhs(), Fix::from(stored).unwrap::<Value>()?))
    }
}

impl FixRuntime for CouponCollector<'_> {
    fn load_blob(&self, blob: Blob) -> Pending<Arc<[u8]>> {
        self.storage.get_blob(&blob).map(Some)
    }

    fn load_tree(&self, tree: TreeName) -> Pending<Arc<[Fix]>> {
        self.storage.get_tree(&tree).map(Some)
    }

    fn create_blob(&self, bytes: &[u8]) -> Result<Blob> {
        self.storage.create_blob(bytes)
    }

    fn create_tree(&self, elements: &[Fix], tag: bool) -> Result<TreeName> {
        self.storage.create_tree(elements, tag)
    }

    /// Only memoized applications are visible to coupons
    fn apply(&self, combination: ObjectTree) -> Pending<Object> {
        Ok(self.apply(combination).map(|tag| tag.rhs()))
    }
}
