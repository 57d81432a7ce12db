//! A fixed pool of worker threads evaluating relations.
//!
//! Work items are relations, sent over a crossbeam channel. A worker runs
//! one relation through the `Evaluator` with a per-job `FixRuntime` whose
//! `eval` and `apply` answer from the memo table. A miss submits the missing
//! relation as a job of its own and reports "not ready"; the job then blocks
//! on everything it found missing and is sent back to the channel once the
//! last of those settles. Data that isn't resident is asked of the
//! `Upstream`, which may answer right away or later through `settle`.
//!
//! Applications are claimed before the runner is called, so a procedure runs
//! at most once per combination no matter how many jobs race for it.

use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, instrument, trace, warn};

use crate::error::{FixError, Pending, Result};
use crate::evaluator::{Evaluator, FixRuntime};
use crate::handle::{
    Blob, BlobRef, Fix, Object, ObjectTree, Relation, TreeName, Value, ValueTree,
};
use crate::runner::{invoke, Runner};
use crate::storage::table::FixTable;
use crate::storage::{Data, RuntimeStorage};

pub mod graph;

pub use graph::{DependencyGraph, Watcher};

/// Where the executor turns for data missing from local storage
pub trait Upstream: Send + Sync {
    /// `Ok(Some(_))` hands the data over now. `Ok(None)` promises that it
    /// will be delivered later through [`Executor::settle`] (or failed
    /// through [`Executor::fail`]).
    fn fetch(&self, handle: Fix) -> Result<Option<Data>>;
}

enum Message {
    Run(Relation),
    Stop,
}

struct Shared {
    storage: Arc<RuntimeStorage>,
    runner: Arc<dyn Runner>,
    upstream: Option<Arc<dyn Upstream>>,
    sender: Sender<Message>,
    graph: DependencyGraph,
    claims: FixTable<Relation, ()>,
    failures: DashMap<Fix, FixError>,
    runs: AtomicUsize,
}

pub struct Executor {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("threads", &self.workers.len())
            .field("graph", &self.shared.graph)
            .finish()
    }
}

impl Executor {
    pub fn new(
        storage: Arc<RuntimeStorage>,
        runner: Arc<dyn Runner>,
        threads: usize,
        upstream: Option<Arc<dyn Upstream>>,
    ) -> Result<Self> {
        let threads = threads.max(1);
        let (sender, receiver) = unbounded();
        let capacity = storage.capacity();
        let shared = Arc::new(Shared {
            storage,
            runner,
            upstream,
            sender,
            graph: DependencyGraph::default(),
            claims: FixTable::new("claims", capacity),
            failures: DashMap::new(),
            runs: AtomicUsize::new(0),
        });
        let workers = (0..threads)
            .map(|i| {
                let shared = shared.clone();
                let receiver: Receiver<Message> = receiver.clone();
                std::thread::Builder::new()
                    .name(format!("fix-worker-{i}"))
                    .spawn(move || {
                        for message in receiver.iter() {
                            match message {
                                Message::Run(relation) => shared.run(relation),
                                Message::Stop => break,
                            }
                        }
                    })
            })
            .collect::<std::io::Result<Vec<_>>>()?;
        info!("executor started with {threads} workers");
        Ok(Self { shared, workers })
    }

    #[inline]
    pub fn storage(&self) -> &Arc<RuntimeStorage> {
        &self.shared.storage
    }

    #[inline]
    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// Number of jobs run so far, including re-runs after a dependency settled
    pub fn runs(&self) -> usize {
        self.shared.runs.load(Ordering::Relaxed)
    }

    /// Queues `relation` unless it has been requested before
    pub fn submit(&self, relation: Relation) {
        self.shared.submit(relation)
    }

    /// Calls `watcher` once `relation` is memoized or has failed, right away
    /// if that has already happened
    pub fn watch(&self, relation: Relation, watcher: Watcher) {
        let shared = &self.shared;
        if let Some((watcher, outcome)) =
            shared.graph.watch(relation, watcher, || shared.outcome(relation))
        {
            watcher(outcome);
        }
    }

    /// Evaluates `relation` and blocks until it is memoized or has failed
    #[instrument(level = "debug", skip(self), fields(relation = %Fix::from(relation)))]
    pub fn execute(&self, relation: Relation) -> Result<Object> {
        self.submit(relation);
        self.wait(relation)
    }

    /// Blocks until `relation` is memoized or has failed, without asking for
    /// it to be computed here
    pub fn wait(&self, relation: Relation) -> Result<Object> {
        let slot = Arc::new((Mutex::new(None), Condvar::new()));
        let filled = slot.clone();
        self.watch(
            relation,
            Box::new(move |outcome| {
                let (lock, cvar) = &*filled;
                *lock.lock() = Some(outcome);
                cvar.notify_all();
            }),
        );
        let (lock, cvar) = &*slot;
        let mut outcome = lock.lock();
        loop {
            if let Some(outcome) = outcome.take() {
                return outcome;
            }
            cvar.wait(&mut outcome);
        }
    }

    /// Announces that `handle` has been stored, waking everything blocked
    /// on it
    pub fn settle(&self, handle: Fix) {
        self.shared.settle(handle)
    }

    /// Records that `handle` can't be produced, failing everything blocked
    /// on it
    pub fn fail(&self, handle: Fix, error: FixError) {
        self.shared.fail(handle, error)
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        for _ in &self.workers {
            let _ = self.shared.sender.send(Message::Stop);
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("executor worker panicked");
            }
        }
    }
}

impl Shared {
    fn submit(&self, relation: Relation) {
        if self.graph.request(relation) {
            self.send(relation);
        }
    }

    fn send(&self, relation: Relation) {
        if self.sender.send(Message::Run(relation)).is_err() {
            warn!("executor is shutting down, dropping {}", Fix::from(relation));
        }
    }

    fn is_settled(&self, handle: &Fix) -> bool {
        self.storage.contains(handle) || self.failures.contains_key(handle)
    }

    fn outcome(&self, relation: Relation) -> Option<Result<Object>> {
        if let Some(result) = self.storage.get_result(&relation) {
            return Some(Ok(result));
        }
        self.failures
            .get(&Fix::from(relation))
            .map(|e| Err(e.value().clone()))
    }

    fn settle(&self, handle: Fix) {
        let (ready, watchers) = self.graph.settle(handle);
        for parent in ready {
            self.send(parent);
        }
        if let Fix::Relation(relation) = handle {
            if let Some(outcome) = self.outcome(relation) {
                for watcher in watchers {
                    watcher(outcome.clone());
                }
            }
        }
    }

    fn fail(&self, handle: Fix, error: FixError) {
        debug!("{handle} failed: {error}");
        self.failures.entry(handle).or_insert(error);
        self.settle(handle);
    }

    #[instrument(level = "trace", skip(self), fields(relation = %Fix::from(relation)))]
    fn run(&self, relation: Relation) {
        if let Some(outcome) = self.outcome(relation) {
            if outcome.is_ok() {
                self.settle(relation.into());
            }
            return;
        }
        self.runs.fetch_add(1, Ordering::Relaxed);
        let job = Job {
            shared: self,
            relation,
            missing: RefCell::new(vec![]),
        };
        let outcome = match relation {
            Relation::Eval(object) => Evaluator::new(&job)
                .eval_strict(object)
                .map(|v| v.map(Object::Value)),
            Relation::Apply(combination) => job.run_apply(combination),
        };
        match outcome {
            Ok(Some(result)) => match self.storage.create_result(relation, result) {
                Ok(_) => self.settle(relation.into()),
                Err(e) => self.fail(relation.into(), e),
            },
            Ok(None) => {
                let missing = job.missing.into_inner();
                trace!("waiting on {} handles", missing.len());
                if self
                    .graph
                    .block(relation, &missing, |handle| self.is_settled(handle))
                {
                    self.send(relation);
                }
            }
            Err(e) => self.fail(relation.into(), e),
        }
    }
}

/// The runtime seen by one run of one relation
struct Job<'a> {
    shared: &'a Shared,
    relation: Relation,
    missing: RefCell<Vec<Fix>>,
}

impl Job<'_> {
    fn check_failed(&self, handle: &Fix) -> Result<()> {
        match self.shared.failures.get(handle) {
            Some(e) => Err(e.value().clone()),
            None => Ok(()),
        }
    }

    fn load(&self, handle: Fix) -> Pending<Data> {
        if let Some(data) = self.shared.storage.get(&handle) {
            return Ok(Some(data));
        }
        self.check_failed(&handle)?;
        let Some(upstream) = &self.shared.upstream else {
            return Err(FixError::HandleNotFound(handle));
        };
        match upstream.fetch(handle)? {
            Some(data) => {
                self.shared.storage.put(&handle, data.clone())?;
                // others may have blocked on the same fetch
                self.shared.settle(handle);
                Ok(Some(data))
            }
            None => {
                self.missing.borrow_mut().push(handle);
                Ok(None)
            }
        }
    }

    fn depend(&self, child: Relation) -> Pending<Object> {
        if let Some(result) = self.shared.storage.get_result(&child) {
            return Ok(Some(result));
        }
        self.check_failed(&child.into())?;
        self.shared.submit(child);
        self.missing.borrow_mut().push(child.into());
        Ok(None)
    }

    /// Makes sure the combination and its blob arguments are resident, then
    /// runs it if this job wins the claim
    fn run_apply(&self, combination: ObjectTree) -> Pending<Object> {
        let Some(elements) = self.load_tree(combination.0)? else {
            return Ok(None);
        };
        let mut ready = true;
        for element in elements.iter() {
            if let Some(Value::Blob(b) | Value::BlobRef(BlobRef(b))) =
                element.try_into_kind::<Value>()
            {
                ready &= self.load_blob(b)?.is_some();
            }
        }
        if !ready {
            return Ok(None);
        }
        let (_, fresh) = self.shared.claims.insert(self.relation, ())?;
        if !fresh {
            // whoever holds the claim settles the relation
            self.missing.borrow_mut().push(self.relation.into());
            return Ok(None);
        }
        debug!("applying {}", Fix::from(combination));
        invoke(self.shared.runner.as_ref(), &self.shared.storage, combination).map(Some)
    }
}

impl FixRuntime for Job<'_> {
    fn load_blob(&self, blob: Blob) -> Pending<Arc<[u8]>> {
        if blob.is_literal() {
            return self.shared.storage.get_blob(&blob).map(Some);
        }
        match self.load(Value::Blob(blob).into())? {
            Some(Data::Blob(bytes)) => Ok(Some(bytes)),
            Some(_) => Err(FixError::KindMismatch {
                expected: "Blob data",
                found: Value::Blob(blob).into(),
            }),
            None => Ok(None),
        }
    }

    fn load_tree(&self, tree: TreeName) -> Pending<Arc<[Fix]>> {
        let handle = Fix::from(Value::ValueTree(ValueTree(tree)));
        match self.load(handle)? {
            Some(Data::Tree(elements)) => Ok(Some(elements)),
            Some(_) => Err(FixError::KindMismatch {
                expected: "Tree data",
                found: handle,
            }),
            None => Ok(None),
        }
    }

    fn create_blob(&self, bytes: &[u8]) -> Result<Blob> {
        self.shared.storage.create_blob(bytes)
    }

    fn create_tree(&self, elements: &[Fix], tag: bool) -> Result<TreeName> {
        self.shared.storage.create_tree(elements, tag)
    }

    fn apply(&self, combination: ObjectTree) -> Pending<Object> {
        self.depend(Relation::Apply(combination))
    }

    fn eval(&self, object: Object) -> Pending<Value> {
        if let Object::Value(v) = object {
            return Evaluator::new(self).lift(v);
        }
        match self.depend(Relation::Eval(object))? {
            Some(result) => Fix::from(result).unwrap::<Value>().map(Some),
            None => Ok(None),
        }
    }
}
