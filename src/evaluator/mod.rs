//! The reduction semantics.
//!
//! `Evaluator` turns expressions into objects and objects into values. It is
//! written against the `FixRuntime` capability, which decides how data is
//! loaded, how applications are memoized and whether sub-goals are evaluated
//! inline or handed to somebody else. Every operation returns
//! `Ok(None)` when some dependency isn't available yet; callers retry later.
//!
//! The recursive structure is:
//!
//! * `reduce(Expression) -> Object`
//! * `force(Thunk) -> Object`
//! * `apply(ObjectTree) -> Object`, memoized by the runtime
//! * `select(ObjectTree) -> Object`
//! * `eval_strict(Object) -> Value`, `eval_shallow(Object) -> Object`
//! * `lift(Value) -> Value`, `lower(Value) -> Value`

use std::sync::Arc;

use tracing::trace;

use crate::error::{FixError, Pending, Result};
use crate::handle::{
    Blob, BlobRef, Encode, Expression, ExpressionTree, Fix, Object, ObjectTree, Relation, Thunk,
    TreeName, Value, ValueTree, ValueTreeRef,
};
use crate::runner::{invoke, Runner};
use crate::storage::RuntimeStorage;

pub mod sequential;

pub use sequential::SequentialRuntime;

/// Bails out of the enclosing function with `Ok(None)` if a pending result
/// isn't ready
macro_rules! ready {
    ($e:expr) => {
        match $e? {
            Some(x) => x,
            None => return Ok(None),
        }
    };
}
pub(crate) use ready;

/// The capabilities the evaluator needs from a runtime. The tree maps,
/// `force`, `select` and `reference` have inline defaults; `eval` and `apply`
/// are where a runtime memoizes or delegates.
pub trait FixRuntime: Sized {
    fn load_blob(&self, blob: Blob) -> Pending<Arc<[u8]>>;

    fn load_tree(&self, tree: TreeName) -> Pending<Arc<[Fix]>>;

    fn create_blob(&self, bytes: &[u8]) -> Result<Blob>;

    fn create_tree(&self, elements: &[Fix], tag: bool) -> Result<TreeName>;

    /// The result of `Apply(combination)`
    fn apply(&self, combination: ObjectTree) -> Pending<Object>;

    /// The result of `Eval(object)`
    fn eval(&self, object: Object) -> Pending<Value> {
        Evaluator::new(self).eval_strict(object)
    }

    fn force(&self, thunk: Thunk) -> Pending<Object> {
        Evaluator::new(self).force(thunk)
    }

    fn select(&self, selection: ObjectTree) -> Pending<Object> {
        Evaluator::new(self).select(selection)
    }

    fn map_reduce(&self, tree: ExpressionTree) -> Pending<ObjectTree> {
        Evaluator::new(self).map_reduce(tree)
    }

    fn map_eval(&self, tree: ObjectTree) -> Pending<ValueTree> {
        Evaluator::new(self).map_eval(tree)
    }

    fn map_lift(&self, tree: ValueTree) -> Pending<ValueTree> {
        Evaluator::new(self).map_lift(tree)
    }

    /// A shallow reference to `value`
    fn reference(&self, value: Value) -> Value {
        lower(value)
    }
}

/// Materializes only a reference to `value`
pub fn lower(value: Value) -> Value {
    match value {
        Value::Blob(b) => Value::BlobRef(BlobRef(b)),
        Value::ValueTree(t) => Value::ValueTreeRef(ValueTreeRef(t.0)),
        r @ (Value::BlobRef(_) | Value::ValueTreeRef(_)) => r,
    }
}

/// Looks up `Apply(combination)` in `storage`, running `runner` and recording
/// the result on a miss
pub fn apply_memoized(
    storage: &RuntimeStorage,
    runner: &dyn Runner,
    combination: ObjectTree,
) -> Result<Object> {
    let relation = Relation::Apply(combination);
    if let Some(result) = storage.get_result(&relation) {
        return Ok(result);
    }
    let result = invoke(runner, storage, combination)?;
    storage.create_result(relation, result)
}

/// A single index or a `begin..end` range
pub type SelectRange = (u64, Option<u64>);

/// Splits the elements of a selection into its target and range
pub fn parse_selection(selection: ObjectTree, elements: &[Fix]) -> Result<(Object, SelectRange)> {
    let (target, range) = match elements {
        [target, index] => (target, (index_of(index)?, None)),
        [target, begin, end] => (target, (index_of(begin)?, Some(index_of(end)?))),
        _ => {
            return Err(FixError::KindMismatch {
                expected: "selection [target, index] or [target, begin, end]",
                found: selection.into(),
            })
        }
    };
    Ok((target.unwrap::<Object>()?, range))
}

/// The `usize` span a selection covers, `None` if it can't be addressed
fn span((begin, end): SelectRange) -> Option<std::ops::Range<usize>> {
    let begin = usize::try_from(begin).ok()?;
    let end = match end {
        None => begin.checked_add(1)?,
        Some(end) => usize::try_from(end).ok()?,
    };
    Some(begin..end)
}

fn index_of(handle: &Fix) -> Result<u64> {
    handle
        .try_into_kind::<Blob>()
        .and_then(|b| b.to_u64())
        .ok_or(FixError::KindMismatch {
            expected: "u64 literal",
            found: *handle,
        })
}

pub struct Evaluator<'a, R> {
    rt: &'a R,
}

impl<'a, R: FixRuntime> Evaluator<'a, R> {
    #[inline]
    pub fn new(rt: &'a R) -> Self {
        Self { rt }
    }

    pub fn reduce(&self, expression: Expression) -> Pending<Object> {
        match expression {
            Expression::Object(o) => Ok(Some(o)),
            Expression::Encode(Encode::Strict(t)) => {
                Ok(self.rt.eval(Object::Thunk(t))?.map(Object::Value))
            }
            Expression::Encode(Encode::Shallow(t)) => {
                let forced = ready!(self.rt.force(t));
                self.eval_shallow(forced)
            }
            Expression::ExpressionTree(t) => Ok(self.objects(t)?.map(Object::ObjectTree)),
        }
    }

    /// Views an expression tree as an object tree, reducing its elements
    /// only if some of them aren't objects already
    fn objects(&self, tree: ExpressionTree) -> Pending<ObjectTree> {
        let elements = ready!(self.rt.load_tree(tree.0));
        if elements.iter().all(|e| e.try_into_kind::<Object>().is_some()) {
            return Ok(Some(ObjectTree(tree.0)));
        }
        self.rt.map_reduce(tree)
    }

    pub fn force(&self, thunk: Thunk) -> Pending<Object> {
        trace!("force {}", Fix::from(thunk));
        match thunk {
            Thunk::Identification(v) => Ok(self.load(v)?.map(Object::Value)),
            Thunk::Application(tree) => {
                let combination = ready!(self.objects(tree));
                self.rt.apply(combination)
            }
            Thunk::Selection(tree) => self.rt.select(tree),
        }
    }

    /// Makes the data behind `value` resident and returns its eager form
    fn load(&self, value: Value) -> Pending<Value> {
        match value {
            Value::Blob(b) | Value::BlobRef(BlobRef(b)) => {
                ready!(self.rt.load_blob(b));
                Ok(Some(Value::Blob(b)))
            }
            Value::ValueTree(ValueTree(t)) | Value::ValueTreeRef(ValueTreeRef(t)) => {
                ready!(self.rt.load_tree(t));
                Ok(Some(Value::ValueTree(ValueTree(t))))
            }
        }
    }

    /// `[target, index]` selects one element (one byte for blobs) and
    /// `[target, begin, end]` a sub-range of the target
    pub fn select(&self, selection: ObjectTree) -> Pending<Object> {
        let elements = ready!(self.rt.load_tree(selection.0));
        let (target, range) = parse_selection(selection, &elements)?;
        let target = ready!(self.eval_shallow(target));
        self.select_from(target, range)
    }

    /// Selection on a target that was already evaluated shallowly
    pub fn select_from(&self, target: Object, range: SelectRange) -> Pending<Object> {
        let out_of_range = |index| FixError::OutOfRange {
            handle: target.into(),
            index,
        };
        match target {
            Object::Value(Value::Blob(b)) | Object::Value(Value::BlobRef(BlobRef(b))) => {
                let bytes = ready!(self.rt.load_blob(b));
                let slice = span(range)
                    .and_then(|span| bytes.get(span))
                    .ok_or_else(|| out_of_range(range.1.unwrap_or(range.0)))?;
                let blob = self.rt.create_blob(slice)?;
                Ok(Some(Object::Value(Value::Blob(blob))))
            }
            Object::Value(Value::ValueTree(ValueTree(t)))
            | Object::Value(Value::ValueTreeRef(ValueTreeRef(t)))
            | Object::ObjectTree(ObjectTree(t)) => {
                let children = ready!(self.rt.load_tree(t));
                match range {
                    (i, None) => {
                        let child = usize::try_from(i)
                            .ok()
                            .and_then(|i| children.get(i))
                            .ok_or_else(|| out_of_range(i))?;
                        Ok(Some(child.unwrap::<Object>()?))
                    }
                    (_, Some(j)) => {
                        let slice = span(range)
                            .and_then(|span| children.get(span))
                            .ok_or_else(|| out_of_range(j))?;
                        let name = self.rt.create_tree(slice, false)?;
                        Ok(Some(match target {
                            Object::ObjectTree(_) => Object::ObjectTree(ObjectTree(name)),
                            _ => Object::Value(Value::ValueTree(ValueTree(name))),
                        }))
                    }
                }
            }
            Object::Thunk(_) => Err(FixError::KindMismatch {
                expected: "shallow target",
                found: target.into(),
            }),
        }
    }

    pub fn eval_strict(&self, object: Object) -> Pending<Value> {
        match object {
            Object::Value(v) => self.lift(v),
            Object::Thunk(t) => {
                let forced = ready!(self.rt.force(t));
                self.rt.eval(forced)
            }
            Object::ObjectTree(t) => Ok(self.rt.map_eval(t)?.map(Value::ValueTree)),
        }
    }

    pub fn eval_shallow(&self, object: Object) -> Pending<Object> {
        match object {
            Object::Value(v) => Ok(Some(Object::Value(self.rt.reference(v)))),
            Object::Thunk(t) => {
                let forced = ready!(self.rt.force(t));
                self.eval_shallow(forced)
            }
            tree @ Object::ObjectTree(_) => Ok(Some(tree)),
        }
    }

    /// Resolves references all the way down to resident data
    pub fn lift(&self, value: Value) -> Pending<Value> {
        match value {
            Value::Blob(_) | Value::BlobRef(_) => self.load(value),
            Value::ValueTree(t) => Ok(self.rt.map_lift(t)?.map(Value::ValueTree)),
            Value::ValueTreeRef(ValueTreeRef(t)) => {
                Ok(self.rt.map_lift(ValueTree(t))?.map(Value::ValueTree))
            }
        }
    }

    #[inline]
    pub fn lower(&self, value: Value) -> Value {
        lower(value)
    }

    /// Element-wise reduction; either every element is ready or none is
    /// reported
    pub fn map_reduce(&self, tree: ExpressionTree) -> Pending<ObjectTree> {
        let elements = ready!(self.rt.load_tree(tree.0));
        let mut objects = Vec::with_capacity(elements.len());
        let mut ready = true;
        for e in elements.iter() {
            match self.reduce(e.unwrap::<Expression>()?)? {
                Some(o) => objects.push(Fix::from(o)),
                None => ready = false,
            }
        }
        if !ready {
            return Ok(None);
        }
        let name = self.rt.create_tree(&objects, tree.0.is_tag())?;
        Ok(Some(ObjectTree(name)))
    }

    /// Element-wise strict evaluation. Evaluating a tag evaluates only its
    /// subject and yields a tag again, with author and type carried over.
    pub fn map_eval(&self, tree: ObjectTree) -> Pending<ValueTree> {
        let elements = ready!(self.rt.load_tree(tree.0));
        if let (true, [subject, author, ty]) = (tree.0.is_tag(), &elements[..]) {
            let subject = ready!(self.rt.eval(subject.unwrap::<Object>()?));
            let values = [
                Fix::from(subject),
                Fix::from(author.unwrap::<Value>()?),
                Fix::from(ty.unwrap::<Value>()?),
            ];
            let name = self.rt.create_tree(&values, true)?;
            return Ok(Some(ValueTree(name)));
        }
        let mut values = Vec::with_capacity(elements.len());
        let mut ready = true;
        for e in elements.iter() {
            match self.rt.eval(e.unwrap::<Object>()?)? {
                Some(v) => values.push(Fix::from(v)),
                None => ready = false,
            }
        }
        if !ready {
            return Ok(None);
        }
        let name = self.rt.create_tree(&values, tree.0.is_tag())?;
        Ok(Some(ValueTree(name)))
    }

    pub fn map_lift(&self, tree: ValueTree) -> Pending<ValueTree> {
        let elements = ready!(self.rt.load_tree(tree.0));
        let mut values = Vec::with_capacity(elements.len());
        let mut ready = true;
        for e in elements.iter() {
            match self.lift(e.unwrap::<Value>()?)? {
                Some(v) => values.push(Fix::from(v)),
                None => ready = false,
            }
        }
        if !ready {
            return Ok(None);
        }
        if values[..] == elements[..] {
            return Ok(Some(tree));
        }
        let name = self.rt.create_tree(&values, tree.0.is_tag())?;
        Ok(Some(ValueTree(name)))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::runner::NativeRunner;

    fn runtime() -> SequentialRuntime {
        SequentialRuntime::new(
            Arc::new(RuntimeStorage::new(1 << 10)),
            Arc::new(NativeRunner::with_builtins()),
        )
    }

    fn num(n: u64) -> Object {
        Object::Value(Value::Blob(Blob::from_u64(n)))
    }

    fn call(rt: &SequentialRuntime, procedure: &str, args: &[Object]) -> Object {
        let mut elements = vec![Expression::Object(Object::Value(Value::Blob(
            NativeRunner::procedure(procedure),
        )))];
        elements.extend(args.iter().map(|&a| Expression::Object(a)));
        let tree = rt.storage().create_expression_tree(&elements).unwrap();
        Object::Thunk(Thunk::Application(tree))
    }

    #[test]
    fn test_add() {
        let rt = runtime();
        let sum = call(&rt, "add", &[num(3), num(4)]);
        assert_eq!(rt.evaluate(sum).unwrap(), Value::Blob(Blob::from_u64(7)));
        // memoized
        assert_eq!(rt.evaluate(sum).unwrap(), Value::Blob(Blob::from_u64(7)));
        assert_eq!(rt.stats().applies(), 1);
    }

    #[test]
    fn test_fib_shares_subcomputations() {
        let rt = runtime();
        let fib = call(&rt, "fib", &[num(10)]);
        assert_eq!(rt.evaluate(fib).unwrap(), Value::Blob(Blob::from_u64(55)));
        // one reduction per `add(fib(n - 1), fib(n - 2))` for n in 2..=10
        assert_eq!(rt.stats().map_reduces(), 9);
        // fib(0..=10) and the nine additions
        assert_eq!(rt.stats().applies(), 20);
    }

    #[test]
    fn test_select_element() {
        let rt = runtime();
        let storage = rt.storage();
        let [a, b, c] = [1, 2, 3].map(|i| Value::Blob(storage.create_blob(&[i; 40]).unwrap()));
        let tree = storage.create_value_tree(&[a, b, c]).unwrap();
        let selection = storage
            .create_object_tree(&[Object::Value(Value::ValueTree(tree)), num(1)])
            .unwrap();
        let thunk = Object::Thunk(Thunk::Selection(selection));
        assert_eq!(rt.evaluate(thunk).unwrap(), b);

        let past_end = storage
            .create_object_tree(&[Object::Value(Value::ValueTree(tree)), num(5)])
            .unwrap();
        assert!(matches!(
            rt.evaluate(Object::Thunk(Thunk::Selection(past_end))),
            Err(FixError::OutOfRange { index: 5, .. })
        ));
    }

    #[test]
    fn test_select_blob_range() {
        let rt = runtime();
        let storage = rt.storage();
        let bytes: Vec<u8> = (0..100).collect();
        let blob = Object::Value(Value::Blob(storage.create_blob(&bytes).unwrap()));
        let selection = storage
            .create_object_tree(&[blob, num(10), num(20)])
            .unwrap();
        let Value::Blob(sub) = rt.evaluate(Object::Thunk(Thunk::Selection(selection))).unwrap()
        else {
            panic!("selecting from a blob yields a blob");
        };
        assert_eq!(&*storage.get_blob(&sub).unwrap(), &bytes[10..20]);
    }

    #[test]
    fn test_select_boundary_indices() {
        let rt = runtime();
        let storage = rt.storage();
        let bytes: Vec<u8> = (0..40).collect();
        let blob = Object::Value(Value::Blob(storage.create_blob(&bytes).unwrap()));
        let tree = Object::Value(Value::ValueTree(
            storage
                .create_value_tree(&[Value::Blob(Blob::from_u64(1)); 3])
                .unwrap(),
        ));
        let select = |elements: &[Object]| {
            let selection = storage.create_object_tree(elements).unwrap();
            rt.evaluate(Object::Thunk(Thunk::Selection(selection)))
        };

        assert_eq!(
            select(&[blob, num(39)]).unwrap(),
            Value::Blob(Blob::literal(&[39]).unwrap())
        );
        assert!(matches!(
            select(&[blob, num(40)]),
            Err(FixError::OutOfRange { index: 40, .. })
        ));
        assert!(matches!(
            select(&[blob, num(u64::MAX)]),
            Err(FixError::OutOfRange { index: u64::MAX, .. })
        ));
        assert!(matches!(
            select(&[blob, num(u64::MAX - 1), num(u64::MAX)]),
            Err(FixError::OutOfRange { index: u64::MAX, .. })
        ));
        assert!(matches!(
            select(&[blob, num(20), num(10)]),
            Err(FixError::OutOfRange { index: 10, .. })
        ));

        assert_eq!(select(&[tree, num(2)]).unwrap(), Value::Blob(Blob::from_u64(1)));
        assert!(matches!(
            select(&[tree, num(3)]),
            Err(FixError::OutOfRange { index: 3, .. })
        ));
        assert!(matches!(
            select(&[tree, num(u64::MAX)]),
            Err(FixError::OutOfRange { index: u64::MAX, .. })
        ));
    }

    #[test]
    fn test_shallow_yields_reference() {
        let rt = runtime();
        let blob = rt.storage().create_blob(&[8; 64]).unwrap();
        let shallow = Expression::Encode(Encode::Shallow(Thunk::Identification(Value::Blob(blob))));
        assert_eq!(
            Evaluator::new(&rt).reduce(shallow).unwrap(),
            Some(Object::Value(Value::BlobRef(BlobRef(blob))))
        );
    }

    #[test]
    fn test_lift_resolves_references() {
        let rt = runtime();
        let storage = rt.storage();
        let blob = storage.create_blob(&[4; 64]).unwrap();
        let inner = storage
            .create_value_tree(&[Value::BlobRef(BlobRef(blob))])
            .unwrap();
        let lifted = rt
            .evaluate(Object::Value(Value::ValueTreeRef(ValueTreeRef(inner.0))))
            .unwrap();
        let expected = storage.create_value_tree(&[Value::Blob(blob)]).unwrap();
        assert_eq!(lifted, Value::ValueTree(expected));
    }

    #[test]
    fn test_eval_tag_keeps_tag() {
        let rt = runtime();
        let storage = rt.storage();
        let author = NativeRunner::procedure("tag");
        let ty = Blob::literal(b"u64").unwrap();
        let tag = storage
            .create_tag(call(&rt, "add", &[num(1), num(2)]), author, ty)
            .unwrap();
        assert!(matches!(tag, Object::ObjectTree(_)));
        let Value::ValueTree(t) = rt.evaluate(tag).unwrap() else {
            panic!("evaluating a tag yields a value tree");
        };
        assert!(t.0.is_tag());
        let elements = storage.get_tree(&t.0).unwrap();
        assert_eq!(elements[0], Fix::from(Blob::from_u64(3)));
        assert_eq!(elements[1], Fix::from(author));
    }

    #[test]
    fn test_eval_tag_carries_author_and_type() {
        let rt = runtime();
        let storage = rt.storage();
        let author = storage.create_blob(&[1; 48]).unwrap();
        let ty = Value::BlobRef(BlobRef(Blob::literal(b"u64").unwrap()));
        let tree = storage
            .create_tree(
                &[
                    call(&rt, "add", &[num(2), num(2)]).into(),
                    Value::BlobRef(BlobRef(author)).into(),
                    ty.into(),
                ],
                true,
            )
            .unwrap();
        let Value::ValueTree(t) = rt.evaluate(Object::ObjectTree(ObjectTree(tree))).unwrap()
        else {
            panic!("evaluating a tag yields a value tree");
        };
        let elements = storage.get_tree(&t.0).unwrap();
        assert_eq!(elements[0], Fix::from(Blob::from_u64(4)));
        // references in the author and type stay references
        assert_eq!(elements[1], Fix::from(Value::BlobRef(BlobRef(author))));
        assert_eq!(elements[2], Fix::from(ty));

        let mut scheduler = crate::scheduler::LocalScheduler::new(
            storage.clone(),
            Arc::new(NativeRunner::with_builtins()),
        );
        let tag = scheduler
            .schedule(Object::ObjectTree(ObjectTree(tree)))
            .unwrap();
        assert_eq!(tag.rhs(), Value::ValueTree(t));
    }

    #[test]
    fn test_procedure_errors_propagate() {
        let rt = runtime();
        let bad = call(&rt, "add", &[num(1)]);
        assert!(matches!(rt.evaluate(bad), Err(FixError::Procedure(_))));
    }
}
