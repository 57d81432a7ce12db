use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, instrument};

use super::{apply_memoized, Evaluator, FixRuntime};
use crate::error::{FixError, Pending, Result};
use crate::handle::{Blob, ExpressionTree, Fix, Object, ObjectTree, Relation, TreeName, Value};
use crate::runner::Runner;
use crate::storage::RuntimeStorage;

/// Counters kept by the sequential runtime
#[derive(Debug, Default)]
pub struct Stats {
    applies: AtomicUsize,
    map_reduces: AtomicUsize,
}

impl Stats {
    /// Number of times the runner was invoked
    pub fn applies(&self) -> usize {
        self.applies.load(Ordering::Relaxed)
    }

    /// Number of expression trees that needed element-wise reduction
    pub fn map_reduces(&self) -> usize {
        self.map_reduces.load(Ordering::Relaxed)
    }
}

/// Evaluates everything on the calling thread, recursing through the
/// evaluator. All data must be resident in `storage`; a miss is an error
/// rather than a pending result.
#[derive(Debug)]
pub struct SequentialRuntime {
    storage: Arc<RuntimeStorage>,
    runner: Arc<dyn Runner>,
    stats: Stats,
}

impl SequentialRuntime {
    pub fn new(storage: Arc<RuntimeStorage>, runner: Arc<dyn Runner>) -> Self {
        Self {
            storage,
            runner,
            stats: Stats::default(),
        }
    }

    #[inline]
    pub fn storage(&self) -> &Arc<RuntimeStorage> {
        &self.storage
    }

    #[inline]
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    #[instrument(level = "debug", skip(self), fields(object = %Fix::from(object)))]
    pub fn evaluate(&self, object: Object) -> Result<Value> {
        let value = self
            .eval(object)?
            .ok_or_else(|| FixError::HandleNotFound(object.into()))?;
        debug!("evaluated to {}", Fix::from(value));
        Ok(value)
    }
}

impl FixRuntime for SequentialRuntime {
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

    fn apply(&self, combination: ObjectTree) -> Pending<Object> {
        if let Some(result) = self.storage.get_result(&Relation::Apply(combination)) {
            return Ok(Some(result));
        }
        self.stats.applies.fetch_add(1, Ordering::Relaxed);
        apply_memoized(&self.storage, self.runner.as_ref(), combination).map(Some)
    }

    fn eval(&self, object: Object) -> Pending<Value> {
        if let Object::Value(v) = object {
            return Evaluator::new(self).lift(v);
        }
        let relation = Relation::Eval(object);
        if let Some(result) = self.storage.get_result(&relation) {
            return Ok(Some(Fix::from(result).unwrap::<Value>()?));
        }
        let Some(value) = Evaluator::new(self).eval_strict(object)? else {
            return Ok(None);
        };
        let stored = self.storage.create_result(relation, Object::Value(value))?;
        Fix::from(stored).unwrap::<Value>().map(Some)
    }

    fn map_reduce(&self, tree: ExpressionTree) -> Pending<ObjectTree> {
        self.stats.map_reduces.fetch_add(1, Ordering::Relaxed);
        Evaluator::new(self).map_reduce(tree)
    }
}
