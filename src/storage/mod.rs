//! `RuntimeStorage` holds everything a runtime knows: blob bytes, tree
//! elements and the memo table mapping relations to their results.
//!
//! All three maps are `FixTable`s, so entries are created exactly once and
//! never change afterwards. Data can be created under a canonical name
//! (hashed right away) or under a local name (a counter, hashed later by
//! `canonicalize`), mirroring the lazy hydration of content-addressed stores.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use elsa::sync::FrozenMap;
use rayon::prelude::*;
use sha2::{Digest as _, Sha256};
use tracing::trace;

use crate::error::{FixError, Result};
use crate::handle::{
    Blob, Digest, Expression, ExpressionTree, Fix, Name, Object, ObjectTree, Payload, Relation,
    TreeName, Value, ValueTree, DIGEST_LEN, LITERAL_MAX,
};

pub mod table;

use table::FixTable;

/// Default number of slots per table
pub const DEFAULT_CAPACITY: usize = 1 << 16;

const BLOB_DOMAIN: u8 = b'b';
const TREE_DOMAIN: u8 = b't';
const TAG_DOMAIN: u8 = b'g';

/// Owned data behind a handle, as exchanged with other runtimes
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Data {
    Blob(Arc<[u8]>),
    Tree(Arc<[Fix]>),
    /// The result of a relation
    Object(Object),
}

#[derive(Debug)]
pub struct RuntimeStorage {
    blobs: FixTable<Name, Arc<[u8]>>,
    trees: FixTable<TreeName, Arc<[Fix]>>,
    relations: FixTable<Relation, Object>,
    next_local: AtomicU64,
    canonical: FrozenMap<Name, Box<Name>>,
}

impl Default for RuntimeStorage {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

fn hash_parts<'a>(domain: u8, parts: impl IntoIterator<Item = &'a [u8]>) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update([domain]);
    for part in parts {
        hasher.update(part);
    }
    let mut digest = [0; DIGEST_LEN];
    digest.copy_from_slice(&hasher.finalize()[..DIGEST_LEN]);
    Digest(digest)
}

impl RuntimeStorage {
    pub fn new(capacity: usize) -> Self {
        Self {
            blobs: FixTable::new("blobs", capacity),
            trees: FixTable::new("trees", capacity),
            relations: FixTable::new("relations", capacity),
            next_local: AtomicU64::new(0),
            canonical: FrozenMap::new(),
        }
    }

    #[inline]
    fn fresh_local(&self, size: u64) -> Name {
        Name::local(self.next_local.fetch_add(1, Ordering::Relaxed), size)
    }

    /// Stores `bytes`, inlining them when they fit in a literal
    pub fn create_blob(&self, bytes: &[u8]) -> Result<Blob> {
        if let Some(blob) = Blob::literal(bytes) {
            return Ok(blob);
        }
        let name = Name::canonical(hash_parts(BLOB_DOMAIN, [bytes]), bytes.len() as u64);
        let (_, fresh) = self.blobs.insert_with(name, || Arc::from(bytes))?;
        if fresh {
            trace!("created blob {name:?}");
        }
        Ok(Blob::Named(name))
    }

    /// Stores `bytes` under a local name, postponing the hashing
    pub fn create_local_blob(&self, bytes: &[u8]) -> Result<Blob> {
        if bytes.len() <= LITERAL_MAX {
            return self.create_blob(bytes);
        }
        let name = self.fresh_local(bytes.len() as u64);
        self.blobs.insert(name, Arc::from(bytes))?;
        Ok(Blob::Named(name))
    }

    /// Stores a tree. Local elements are canonicalized first so that the
    /// tree's name only depends on content.
    pub fn create_tree(&self, elements: &[Fix], tag: bool) -> Result<TreeName> {
        let elements = self.canonicalize_all(elements)?;
        let raws: Vec<_> = elements.iter().map(Fix::to_raw).collect();
        let domain = if tag { TAG_DOMAIN } else { TREE_DOMAIN };
        let digest = hash_parts(domain, raws.iter().map(|r| &r.0[..]));
        let name = TreeName::new(Name::canonical(digest, elements.len() as u64), tag);
        let (_, fresh) = self.trees.insert_with(name, || Arc::from(elements))?;
        if fresh {
            trace!("created tree {name:?}");
        }
        Ok(name)
    }

    pub fn create_local_tree(&self, elements: &[Fix], tag: bool) -> Result<TreeName> {
        let name = TreeName::new(self.fresh_local(elements.len() as u64), tag);
        self.trees.insert(name, Arc::from(elements))?;
        Ok(name)
    }

    pub fn create_value_tree(&self, elements: &[Value]) -> Result<ValueTree> {
        let elements: Vec<Fix> = elements.iter().map(|&v| v.into()).collect();
        self.create_tree(&elements, false).map(ValueTree)
    }

    pub fn create_object_tree(&self, elements: &[Object]) -> Result<ObjectTree> {
        let elements: Vec<Fix> = elements.iter().map(|&o| o.into()).collect();
        self.create_tree(&elements, false).map(ObjectTree)
    }

    pub fn create_expression_tree(&self, elements: &[Expression]) -> Result<ExpressionTree> {
        let elements: Vec<Fix> = elements.iter().map(|&e| e.into()).collect();
        self.create_tree(&elements, false).map(ExpressionTree)
    }

    /// Mints a tag `[subject, author, type]`. Only the runtime creates tags;
    /// `author` is the procedure on whose behalf the tag is made.
    pub fn create_tag(&self, subject: Object, author: Blob, ty: Blob) -> Result<Object> {
        let name = self.create_tree(&[subject.into(), author.into(), ty.into()], true)?;
        Ok(match subject {
            Object::Value(_) => Object::Value(Value::ValueTree(ValueTree(name))),
            _ => Object::ObjectTree(ObjectTree(name)),
        })
    }

    pub fn get_blob(&self, blob: &Blob) -> Result<Arc<[u8]>> {
        match blob {
            Blob::Literal(l) => Ok(Arc::from(l.as_bytes())),
            Blob::Named(name) => self
                .blobs
                .get(name)
                .cloned()
                .ok_or(FixError::HandleNotFound((*blob).into())),
        }
    }

    pub fn get_tree(&self, tree: &TreeName) -> Result<Arc<[Fix]>> {
        self.trees
            .get(tree)
            .cloned()
            .ok_or_else(|| FixError::HandleNotFound(ValueTree(*tree).into()))
    }

    pub fn contains_payload(&self, payload: &Payload) -> bool {
        match payload {
            Payload::Blob(Blob::Literal(_)) => true,
            Payload::Blob(Blob::Named(name)) => self.blobs.contains(name),
            Payload::Tree(tree) => self.trees.contains(tree),
        }
    }

    /// Relations are answered from the memo table, everything else from the
    /// data maps. Never reports a false positive.
    pub fn contains(&self, handle: &Fix) -> bool {
        match handle {
            Fix::Relation(r) => self.relations.contains(r),
            Fix::Expression(e) => self.contains_payload(&e.payload()),
        }
    }

    /// Records `result` for `relation`. The first writer wins; the stored
    /// result is returned either way.
    pub fn create_result(&self, relation: Relation, result: Object) -> Result<Object> {
        let (stored, fresh) = self.relations.insert(relation, result)?;
        if fresh {
            trace!("memoized {} -> {}", Fix::from(relation), Fix::from(*stored));
        }
        Ok(*stored)
    }

    #[inline]
    pub fn get_result(&self, relation: &Relation) -> Option<Object> {
        self.relations.get(relation).copied()
    }

    /// Returns the data behind a handle if it's resident
    pub fn get(&self, handle: &Fix) -> Option<Data> {
        match handle {
            Fix::Relation(r) => self.get_result(r).map(Data::Object),
            Fix::Expression(e) => match e.payload() {
                Payload::Blob(b) => self.get_blob(&b).ok().map(Data::Blob),
                Payload::Tree(t) => self.get_tree(&t).ok().map(Data::Tree),
            },
        }
    }

    /// Stores data received for `handle` without re-deriving its name.
    /// Duplicate puts are no-ops.
    pub fn put(&self, handle: &Fix, data: Data) -> Result<()> {
        match (handle, data) {
            (Fix::Relation(r), Data::Object(o)) => {
                self.create_result(*r, o)?;
            }
            (Fix::Expression(e), Data::Blob(bytes)) => match e.payload() {
                Payload::Blob(Blob::Named(name)) => {
                    self.blobs.insert(name, bytes)?;
                }
                Payload::Blob(Blob::Literal(_)) => (),
                Payload::Tree(_) => return Err(mismatch("Blob", handle)),
            },
            (Fix::Expression(e), Data::Tree(elements)) => match e.payload() {
                Payload::Tree(name) => {
                    self.trees.insert(name, elements)?;
                }
                Payload::Blob(_) => return Err(mismatch("Tree", handle)),
            },
            (Fix::Relation(_), _) => return Err(mismatch("Object", handle)),
            (Fix::Expression(_), Data::Object(_)) => return Err(mismatch("Relation", handle)),
        }
        Ok(())
    }

    fn canonical_name(&self, name: &Name, make: impl FnOnce() -> Result<Name>) -> Result<Name> {
        if !name.is_local() {
            return Ok(*name);
        }
        if let Some(canonical) = self.canonical.get(name) {
            return Ok(*canonical);
        }
        let canonical = make()?;
        Ok(*self.canonical.insert(*name, Box::new(canonical)))
    }

    /// Replaces every local name reachable from `handle` by its content hash,
    /// keeping the handle's shape. Children of a tree are hashed in parallel.
    pub fn canonicalize(&self, handle: Fix) -> Result<Fix> {
        if handle.is_canonical() {
            return Ok(handle);
        }
        let payload = match handle.payload() {
            Payload::Blob(Blob::Named(name)) => {
                let canonical = self.canonical_name(&name, || {
                    let bytes = self.get_blob(&Blob::Named(name))?;
                    let created = self.create_blob(&bytes)?;
                    match created {
                        Blob::Named(n) => Ok(n),
                        Blob::Literal(_) => unreachable!("local blobs are never literal-sized"),
                    }
                })?;
                Payload::Blob(Blob::Named(canonical))
            }
            Payload::Tree(tree) => {
                let canonical = self.canonical_name(tree.name(), || {
                    let elements = self.get_tree(&tree)?;
                    Ok(*self.create_tree(&elements, tree.is_tag())?.name())
                })?;
                Payload::Tree(TreeName::new(canonical, tree.is_tag()))
            }
            Payload::Blob(Blob::Literal(_)) => return Ok(handle),
        };
        Fix::from_code(handle.code(), payload)
            .ok_or_else(|| FixError::MalformedHandle(format!("cannot re-home {handle}")))
    }

    fn canonicalize_all(&self, elements: &[Fix]) -> Result<Vec<Fix>> {
        if elements.iter().all(Fix::is_canonical) {
            return Ok(elements.to_vec());
        }
        elements
            .par_iter()
            .map(|e| self.canonicalize(*e))
            .collect()
    }

    /// Slots per table
    pub fn capacity(&self) -> usize {
        self.relations.capacity()
    }

    /// Number of (blobs, trees, relations) stored
    pub fn counts(&self) -> (usize, usize, usize) {
        (self.blobs.len(), self.trees.len(), self.relations.len())
    }

    /// Iterates over the memo table
    pub fn results(&self) -> impl Iterator<Item = (&Relation, &Object)> {
        self.relations.iter()
    }
}

fn mismatch(expected: &'static str, found: &Fix) -> FixError {
    FixError::KindMismatch {
        expected,
        found: *found,
    }
}
