//! The `Relater` ties one `Executor` to the world outside local storage: a
//! `Repository` on disk and any number of remote runtimes.
//!
//! Data missing from storage is looked up in the repository first, then
//! asked of every remote. Remotes answer later, by a `put` that stores the
//! data and wakes whatever was blocked on it. When every remote has said it
//! doesn't have the data, the relations waiting on it fail.
//!
//! Remotes live in a registry and are addressed by `RemoteId`, an index plus
//! a generation, so a stale id can never reach whoever took over its slot.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, info, instrument, trace, warn};

use crate::error::{FixError, Result};
use crate::executor::{Executor, Upstream};
use crate::handle::{Fix, Object, Relation, Value};
use crate::repository::Repository;
use crate::runner::Runner;
use crate::storage::{Data, RuntimeStorage};

pub mod remote;

pub use remote::{Message, Peer};

/// What a runtime reports about itself to its collaborators
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Info {
    /// Number of relations it can work on at once
    pub parallelism: usize,
    /// Bytes per second between it and the asker
    pub link_speed: f64,
}

/// The contract between collaborating runtimes
pub trait IRuntime: Send + Sync {
    /// Answers with the data if it is at hand. `Ok(None)` promises a later
    /// `put` to the asker, either of the data or of a miss.
    fn get(&self, handle: Fix) -> Result<Option<Data>>;

    /// Hands over data. Putting the same handle twice changes nothing.
    fn put(&self, handle: Fix, data: Data) -> Result<()>;

    /// Never answers `true` for something it doesn't have
    fn contains(&self, handle: Fix) -> bool;

    fn get_info(&self) -> Option<Info>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RemoteId {
    index: u32,
    generation: u32,
}

struct Slot {
    generation: u32,
    remote: Option<Arc<dyn IRuntime>>,
}

#[derive(Default)]
pub struct Registry {
    slots: Vec<Slot>,
}

impl Registry {
    pub fn connect(&mut self, remote: Arc<dyn IRuntime>) -> RemoteId {
        if let Some(index) = self.slots.iter().position(|s| s.remote.is_none()) {
            let slot = &mut self.slots[index];
            slot.generation += 1;
            slot.remote = Some(remote);
            return RemoteId {
                index: index as u32,
                generation: slot.generation,
            };
        }
        self.slots.push(Slot {
            generation: 0,
            remote: Some(remote),
        });
        RemoteId {
            index: (self.slots.len() - 1) as u32,
            generation: 0,
        }
    }

    /// Returns `false` if `id` was already gone
    pub fn disconnect(&mut self, id: RemoteId) -> bool {
        match self.slots.get_mut(id.index as usize) {
            Some(slot) if slot.generation == id.generation && slot.remote.is_some() => {
                slot.remote = None;
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: RemoteId) -> Option<&Arc<dyn IRuntime>> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.remote.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = (RemoteId, &Arc<dyn IRuntime>)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.remote.as_ref().map(|remote| {
                (
                    RemoteId {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    remote,
                )
            })
        })
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Finds data for the executor
struct Fetcher {
    repository: Option<Repository>,
    remotes: RwLock<Registry>,
    /// Handles asked of the remotes, with the number of answers still due
    outstanding: DashMap<Fix, usize>,
}

impl Upstream for Fetcher {
    #[instrument(level = "debug", skip(self), fields(handle = %handle))]
    fn fetch(&self, handle: Fix) -> Result<Option<Data>> {
        if let Some(repository) = &self.repository {
            if let Some(data) = repository.get(&handle)? {
                trace!("found in repository");
                return Ok(Some(data));
            }
        }
        let remotes: Vec<_> = self.remotes.read().iter().map(|(_, r)| r.clone()).collect();
        if remotes.is_empty() {
            return Err(FixError::HandleNotFound(handle));
        }
        match self.outstanding.entry(handle) {
            Entry::Occupied(_) => return Ok(None),
            Entry::Vacant(due) => {
                due.insert(remotes.len());
            }
        }
        for remote in remotes {
            match remote.get(handle) {
                Ok(Some(data)) => {
                    self.outstanding.remove(&handle);
                    return Ok(Some(data));
                }
                Ok(None) => (),
                Err(e) => {
                    warn!("remote failed: {e}");
                    if self.missed(handle) {
                        return Err(FixError::HandleNotFound(handle));
                    }
                }
            }
        }
        debug!("waiting on remotes");
        Ok(None)
    }
}

impl Fetcher {
    /// One remote doesn't have `handle`. Returns `true` once none has.
    fn missed(&self, handle: Fix) -> bool {
        let exhausted = match self.outstanding.get_mut(&handle) {
            Some(mut due) => {
                *due -= 1;
                *due == 0
            }
            None => false,
        };
        if exhausted {
            self.outstanding.remove(&handle);
        }
        exhausted
    }
}

struct Inner {
    executor: Executor,
    fetcher: Arc<Fetcher>,
}

impl Inner {
    fn storage(&self) -> &RuntimeStorage {
        self.executor.storage()
    }

    fn receive(&self, handle: Fix, data: Data) -> Result<()> {
        self.storage().put(&handle, data)?;
        self.fetcher.outstanding.remove(&handle);
        self.executor.settle(handle);
        Ok(())
    }

    /// Local data, or what the repository has
    fn lookup(&self, handle: Fix) -> Result<Option<Data>> {
        if let Some(data) = self.storage().get(&handle) {
            return Ok(Some(data));
        }
        match &self.fetcher.repository {
            Some(repository) => repository.get(&handle),
            None => Ok(None),
        }
    }

    fn handle(&self, message: Message) {
        match message {
            Message::Get { handle, reply } => self.serve(handle, reply),
            Message::Put { handle, data } => {
                if let Err(e) = self.receive(handle, data) {
                    warn!("dropping data for {handle}: {e}");
                    self.executor.fail(handle, e);
                }
            }
            Message::Missing { handle } => {
                if self.fetcher.missed(handle) {
                    self.executor.fail(handle, FixError::HandleNotFound(handle));
                }
            }
            Message::Failed { handle, error } => self.executor.fail(handle, error),
            Message::Contains { handle, reply } => {
                let _ = reply.send(self.storage().contains(&handle));
            }
            Message::Stop => (),
        }
    }

    /// Answers a remote's `get`: relations are computed and the result sent
    /// once known, data is sent if it's here
    fn serve(&self, handle: Fix, reply: Sender<Message>) {
        trace!("serving {handle}");
        if let Fix::Relation(relation) = handle {
            self.executor.watch(
                relation,
                Box::new(move |outcome| {
                    let message = match outcome {
                        Ok(result) => Message::Put {
                            handle,
                            data: Data::Object(result),
                        },
                        Err(error) => Message::Failed { handle, error },
                    };
                    let _ = reply.send(message);
                }),
            );
            self.executor.submit(relation);
            return;
        }
        let message = match self.lookup(handle) {
            Ok(Some(data)) => Message::Put { handle, data },
            Ok(None) => Message::Missing { handle },
            Err(error) => Message::Failed { handle, error },
        };
        let _ = reply.send(message);
    }
}

pub struct Relater {
    inner: Arc<Inner>,
    inbox: Sender<Message>,
    listener: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Relater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relater")
            .field("executor", &self.inner.executor)
            .field("repository", &self.inner.fetcher.repository)
            .field("remotes", &self.inner.fetcher.remotes.read().len())
            .finish()
    }
}

impl Relater {
    pub fn new(
        storage: Arc<RuntimeStorage>,
        runner: Arc<dyn Runner>,
        threads: usize,
        repository: Option<Repository>,
    ) -> Result<Self> {
        let fetcher = Arc::new(Fetcher {
            repository,
            remotes: RwLock::new(Registry::default()),
            outstanding: DashMap::new(),
        });
        let upstream: Arc<dyn Upstream> = fetcher.clone();
        let executor = Executor::new(storage, runner, threads, Some(upstream))?;
        let inner = Arc::new(Inner { executor, fetcher });
        let (inbox, receiver): (Sender<Message>, Receiver<Message>) = unbounded();
        let listening = inner.clone();
        let listener = std::thread::Builder::new()
            .name("fix-relater".into())
            .spawn(move || {
                for message in receiver.iter() {
                    if matches!(message, Message::Stop) {
                        break;
                    }
                    listening.handle(message);
                }
            })?;
        info!("relater started");
        Ok(Self {
            inner,
            inbox,
            listener: Some(listener),
        })
    }

    #[inline]
    pub fn storage(&self) -> &Arc<RuntimeStorage> {
        self.inner.executor.storage()
    }

    #[inline]
    pub fn executor(&self) -> &Executor {
        &self.inner.executor
    }

    #[inline]
    pub fn repository(&self) -> Option<&Repository> {
        self.inner.fetcher.repository.as_ref()
    }

    /// Where remotes send their messages for this relater
    pub(crate) fn inbox(&self) -> Sender<Message> {
        self.inbox.clone()
    }

    pub fn connect(&self, remote: Arc<dyn IRuntime>) -> RemoteId {
        let id = self.inner.fetcher.remotes.write().connect(remote);
        debug!("connected remote {id:?}");
        id
    }

    pub fn disconnect(&self, id: RemoteId) -> bool {
        self.inner.fetcher.remotes.write().disconnect(id)
    }

    pub fn remotes(&self) -> usize {
        self.inner.fetcher.remotes.read().len()
    }

    /// Computes `relation` here, blocking until it's done
    pub fn execute(&self, relation: Relation) -> Result<Object> {
        self.inner.executor.execute(relation)
    }

    /// Evaluates `object` strictly
    pub fn evaluate(&self, object: Object) -> Result<Value> {
        Fix::from(self.execute(Relation::Eval(object))?).unwrap::<Value>()
    }

    /// Asks the remote `id` to compute `relation` and waits for its answer
    #[instrument(level = "debug", skip(self), fields(relation = %Fix::from(relation)))]
    pub fn execute_on(&self, id: RemoteId, relation: Relation) -> Result<Object> {
        let remote = self
            .inner
            .fetcher
            .remotes
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| FixError::ReferenceNotFound(format!("{id:?}")))?;
        let handle = Fix::Relation(relation);
        if let Some(data) = remote.get(handle)? {
            self.inner.receive(handle, data)?;
        }
        self.inner.executor.wait(relation)
    }

    /// Writes `handle` and everything reachable from it to the repository
    pub fn persist(&self, handle: Fix) -> Result<Fix> {
        match self.repository() {
            Some(repository) => repository.persist(self.storage(), handle),
            None => Err(FixError::RepositoryNotFound(".".into())),
        }
    }
}

/// Used directly as a remote, a relater has no way to reach the asker later,
/// so it only ever answers right away: relations are computed before `get`
/// returns and data it doesn't hold is a miss.
impl IRuntime for Relater {
    fn get(&self, handle: Fix) -> Result<Option<Data>> {
        match handle {
            Fix::Relation(relation) => {
                let result = self.execute(relation)?;
                Ok(Some(Data::Object(result)))
            }
            Fix::Expression(_) => match self.inner.lookup(handle)? {
                Some(data) => Ok(Some(data)),
                None => Err(FixError::HandleNotFound(handle)),
            },
        }
    }

    fn put(&self, handle: Fix, data: Data) -> Result<()> {
        self.inner.receive(handle, data)
    }

    fn contains(&self, handle: Fix) -> bool {
        self.storage().contains(&handle)
            || self
                .repository()
                .is_some_and(|repository| repository.contains(&handle))
    }

    fn get_info(&self) -> Option<Info> {
        Some(Info {
            parallelism: self.inner.executor.threads(),
            link_speed: f64::INFINITY,
        })
    }
}

impl Drop for Relater {
    fn drop(&mut self) {
        let _ = self.inbox.send(Message::Stop);
        if let Some(listener) = self.listener.take() {
            if listener.join().is_err() {
                warn!("relater listener panicked");
            }
        }
    }
}
