//! Bookkeeping for relations that are waiting on other handles.
//!
//! A relation that can't finish registers the handles it is missing (other
//! relations, or data that is being fetched) with `block`. When a handle is
//! settled, `settle` hands back every relation that has nothing left to wait
//! for, together with the watchers of the settled relation. Both run under
//! the same lock, so a settle can't slip between a blocked relation checking
//! a handle and registering on it.

use fxhash::{FxHashMap, FxHashSet};
use parking_lot::Mutex;

use crate::error::Result;
use crate::handle::{Fix, Object, Relation};

/// Called once with the outcome of a relation
pub type Watcher = Box<dyn FnOnce(Result<Object>) + Send>;

#[derive(Default)]
struct State {
    requested: FxHashSet<Relation>,
    waiting: FxHashMap<Fix, Vec<Relation>>,
    blockers: FxHashMap<Relation, usize>,
    watchers: FxHashMap<Relation, Vec<Watcher>>,
}

#[derive(Default)]
pub struct DependencyGraph {
    state: Mutex<State>,
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DependencyGraph")
            .field("requested", &state.requested.len())
            .field("waiting", &state.waiting.len())
            .field("blocked", &state.blockers.len())
            .finish()
    }
}

impl DependencyGraph {
    /// Records a request for `relation`. Returns `true` the first time only.
    pub fn request(&self, relation: Relation) -> bool {
        self.state.lock().requested.insert(relation)
    }

    /// Blocks `parent` on every handle in `dependencies` that isn't
    /// `settled` yet. Returns `true` if nothing is outstanding, in which case
    /// the caller must run `parent` again itself.
    pub fn block(
        &self,
        parent: Relation,
        dependencies: &[Fix],
        settled: impl Fn(&Fix) -> bool,
    ) -> bool {
        let mut state = self.state.lock();
        let mut added = 0;
        for dependency in dependencies {
            if settled(dependency) {
                continue;
            }
            let parents = state.waiting.entry(*dependency).or_default();
            if !parents.contains(&parent) {
                parents.push(parent);
                added += 1;
            }
        }
        if added == 0 {
            return !state.blockers.contains_key(&parent);
        }
        *state.blockers.entry(parent).or_default() += added;
        false
    }

    /// Marks `handle` as settled. Returns the relations that became runnable
    /// and, if `handle` is a relation, its watchers.
    pub fn settle(&self, handle: Fix) -> (Vec<Relation>, Vec<Watcher>) {
        let mut state = self.state.lock();
        let mut ready = vec![];
        for parent in state.waiting.remove(&handle).unwrap_or_default() {
            if let Some(count) = state.blockers.get_mut(&parent) {
                *count -= 1;
                if *count == 0 {
                    state.blockers.remove(&parent);
                    ready.push(parent);
                }
            }
        }
        let watchers = match handle {
            Fix::Relation(relation) => state.watchers.remove(&relation).unwrap_or_default(),
            Fix::Expression(_) => vec![],
        };
        (ready, watchers)
    }

    /// Registers `watcher` for `relation` unless `outcome` already knows the
    /// answer, in which case the watcher is handed back together with it.
    pub fn watch(
        &self,
        relation: Relation,
        watcher: Watcher,
        outcome: impl FnOnce() -> Option<Result<Object>>,
    ) -> Option<(Watcher, Result<Object>)> {
        let mut state = self.state.lock();
        match outcome() {
            Some(result) => Some((watcher, result)),
            None => {
                state.watchers.entry(relation).or_default().push(watcher);
                None
            }
        }
    }

    /// Number of relations currently blocked
    pub fn blocked(&self) -> usize {
        self.state.lock().blockers.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::handle::{Blob, ObjectTree, TreeName, Value};

    fn eval(n: u64) -> Relation {
        Relation::Eval(Object::Value(Value::Blob(Blob::from_u64(n))))
    }

    #[test]
    fn test_request_once() {
        let graph = DependencyGraph::default();
        assert!(graph.request(eval(1)));
        assert!(!graph.request(eval(1)));
        assert!(graph.request(eval(2)));
    }

    #[test]
    fn test_parent_ready_after_last_dependency() {
        let graph = DependencyGraph::default();
        let parent = eval(0);
        let deps = [Fix::from(eval(1)), Fix::from(eval(2))];
        assert!(!graph.block(parent, &deps, |_| false));
        assert_eq!(graph.blocked(), 1);
        assert_eq!(graph.settle(deps[0]).0, vec![]);
        assert_eq!(graph.settle(deps[1]).0, vec![parent]);
        assert_eq!(graph.blocked(), 0);
    }

    #[test]
    fn test_settled_dependencies_are_skipped() {
        let graph = DependencyGraph::default();
        let deps = [Fix::from(eval(1))];
        assert!(graph.block(eval(0), &deps, |_| true));
        assert_eq!(graph.blocked(), 0);
    }

    #[test]
    fn test_duplicate_block_counts_once() {
        let graph = DependencyGraph::default();
        let dep = Fix::from(eval(1));
        assert!(!graph.block(eval(0), &[dep, dep], |_| false));
        assert!(!graph.block(eval(0), &[dep], |_| false));
        assert_eq!(graph.settle(dep).0, vec![eval(0)]);
    }

    #[test]
    fn test_watchers_fire_on_settle() {
        let graph = DependencyGraph::default();
        let combination = ObjectTree(TreeName::new(crate::handle::Name::local(0, 1), false));
        let relation = Relation::Apply(combination);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let early = graph.watch(
            relation,
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            || None,
        );
        assert!(early.is_none());
        let (_, watchers) = graph.settle(relation.into());
        assert_eq!(watchers.len(), 1);
        for watcher in watchers {
            watcher(Ok(Object::Value(Value::Blob(Blob::from_u64(1)))));
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
