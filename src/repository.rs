//! On-disk store for canonical data, memoized relations and labels.
//!
//! ```text
//! <root>/.fix/blobs/<hex>      raw bytes
//! <root>/.fix/trees/<hex>      bincode of the elements' raw handles
//! <root>/.fix/relations/<hex>  bincode of the result's raw handle
//! <root>/.fix/labels/<name>    hex of the labelled handle
//! ```
//!
//! File names are the hex of the raw handle. Blobs and trees are filed under
//! their strict value shape (`Blob`, `ValueTree`), so every shape that shares
//! the payload finds the same file.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, instrument, trace};

use crate::error::{FixError, Result};
use crate::handle::raw::RawHandle;
use crate::handle::{Blob, Fix, Object, Payload, Relation, Value, ValueTree};
use crate::storage::{Data, RuntimeStorage};

pub const REPOSITORY_DIR: &str = ".fix";

const BLOBS: &str = "blobs";
const TREES: &str = "trees";
const RELATIONS: &str = "relations";
const LABELS: &str = "labels";

#[derive(Clone, Debug)]
pub struct Repository {
    dir: Utf8PathBuf,
}

fn corrupt(path: &Utf8Path, why: impl std::fmt::Display) -> FixError {
    FixError::RepositoryCorrupt(format!("{path}: {why}"))
}

/// Literal blobs carry their own data and never need a file. A relation is
/// never self-contained, even when its subject is a literal.
fn is_self_contained(handle: &Fix) -> bool {
    matches!(handle, Fix::Expression(e) if matches!(e.payload(), Payload::Blob(Blob::Literal(_))))
}

/// The handle a payload is filed under
fn file_key(payload: Payload) -> Fix {
    match payload {
        Payload::Blob(b) => Value::Blob(b).into(),
        Payload::Tree(t) => Value::ValueTree(ValueTree(t)).into(),
    }
}

impl Repository {
    /// Creates `<root>/.fix` and its subdirectories. Opening an existing
    /// repository this way is fine.
    pub fn init(root: &Utf8Path) -> Result<Self> {
        let dir = root.join(REPOSITORY_DIR);
        for sub in [BLOBS, TREES, RELATIONS, LABELS] {
            fs::create_dir_all(dir.join(sub))?;
        }
        debug!("initialized repository at {dir}");
        Ok(Self { dir })
    }

    pub fn open(root: &Utf8Path) -> Result<Self> {
        let dir = root.join(REPOSITORY_DIR);
        if !dir.is_dir() {
            return Err(FixError::RepositoryNotFound(root.to_owned()));
        }
        Ok(Self { dir })
    }

    /// Opens the closest repository at or above `start`
    pub fn find(start: &Utf8Path) -> Result<Self> {
        start
            .ancestors()
            .find(|dir| dir.join(REPOSITORY_DIR).is_dir())
            .ok_or_else(|| FixError::RepositoryNotFound(start.to_owned()))
            .and_then(Self::open)
    }

    /// The `.fix` directory
    #[inline]
    pub fn path(&self) -> &Utf8Path {
        &self.dir
    }

    fn file(&self, handle: &Fix) -> Utf8PathBuf {
        let (sub, key) = match handle {
            Fix::Relation(_) => (RELATIONS, *handle),
            Fix::Expression(e) => match e.payload() {
                p @ Payload::Blob(_) => (BLOBS, file_key(p)),
                p @ Payload::Tree(_) => (TREES, file_key(p)),
            },
        };
        self.dir.join(sub).join(key.to_raw().to_hex())
    }

    pub fn contains(&self, handle: &Fix) -> bool {
        is_self_contained(handle) || self.file(handle).is_file()
    }

    /// Reads the data behind `handle`. Only canonical handles are ever
    /// found; literals need no file.
    #[instrument(level = "trace", skip(self), fields(handle = %handle))]
    pub fn get(&self, handle: &Fix) -> Result<Option<Data>> {
        if let Fix::Expression(e) = handle {
            if let Payload::Blob(Blob::Literal(l)) = e.payload() {
                return Ok(Some(Data::Blob(Arc::from(l.as_bytes()))));
            }
        }
        let path = self.file(handle);
        if !path.is_file() {
            return Ok(None);
        }
        let data = match handle {
            Fix::Relation(_) => {
                let raw: RawHandle = read_bincode(&path)?;
                let result = Fix::from_raw(&raw)
                    .and_then(|f| f.unwrap::<Object>())
                    .map_err(|e| corrupt(&path, e))?;
                Data::Object(result)
            }
            Fix::Expression(e) => match e.payload() {
                Payload::Blob(_) => Data::Blob(Arc::from(fs::read(&path)?)),
                Payload::Tree(t) => {
                    let raws: Vec<RawHandle> = read_bincode(&path)?;
                    if raws.len() as u64 != t.size() {
                        return Err(corrupt(&path, "tree size mismatch"));
                    }
                    let elements = raws
                        .iter()
                        .map(Fix::from_raw)
                        .collect::<Result<Vec<_>>>()
                        .map_err(|e| corrupt(&path, e))?;
                    Data::Tree(Arc::from(elements))
                }
            },
        };
        trace!("read {path}");
        Ok(Some(data))
    }

    /// Writes the data behind a canonical handle. Existing files are left
    /// alone since their content is fixed by their name.
    pub fn put(&self, handle: &Fix, data: &Data) -> Result<()> {
        if is_self_contained(handle) {
            return Ok(());
        }
        if handle.is_local() {
            return Err(FixError::MalformedHandle(format!(
                "refusing to store local handle {handle}"
            )));
        }
        let path = self.file(handle);
        if path.is_file() {
            return Ok(());
        }
        match data {
            Data::Blob(bytes) => fs::write(&path, bytes)?,
            Data::Tree(elements) => {
                let raws: Vec<RawHandle> = elements.iter().map(Fix::to_raw).collect();
                write_bincode(&path, &raws)?
            }
            Data::Object(result) => write_bincode(&path, &Fix::from(*result).to_raw())?,
        }
        trace!("wrote {path}");
        Ok(())
    }

    /// Canonicalizes `handle` and writes it, along with everything reachable
    /// from it that is resident in `storage`. Returns the canonical handle.
    #[instrument(level = "debug", skip(self, storage), fields(handle = %handle))]
    pub fn persist(&self, storage: &RuntimeStorage, handle: Fix) -> Result<Fix> {
        let canonical = storage.canonicalize(handle)?;
        let mut stack = vec![canonical];
        while let Some(next) = stack.pop() {
            if self.contains(&next) {
                continue;
            }
            let Some(data) = storage.get(&next) else {
                // not resident, leave it to whoever has it
                continue;
            };
            let data = match data {
                Data::Tree(elements) => {
                    stack.extend(elements.iter().copied());
                    Data::Tree(elements)
                }
                Data::Object(result) => {
                    if let Fix::Relation(r) = next {
                        stack.push(storage.canonicalize(subject(r))?);
                    }
                    let result = storage.canonicalize(result.into())?;
                    stack.push(result);
                    Data::Object(result.unwrap::<Object>()?)
                }
                blob @ Data::Blob(_) => blob,
            };
            self.put(&next, &data)?;
        }
        Ok(canonical)
    }

    /// Writes every memoized relation in `storage` whose handles are canonical
    pub fn persist_results(&self, storage: &RuntimeStorage) -> Result<usize> {
        let mut written = 0;
        for (relation, result) in storage.results() {
            let handle = Fix::Relation(*relation);
            if handle.is_local() || self.contains(&handle) {
                continue;
            }
            self.persist(storage, handle)?;
            written += 1;
        }
        debug!("persisted {written} relations");
        Ok(written)
    }

    fn label_path(&self, name: &str) -> Result<Utf8PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(FixError::LabelNotFound(name.to_owned()));
        }
        Ok(self.dir.join(LABELS).join(name))
    }

    pub fn label(&self, name: &str) -> Result<Fix> {
        let path = self.label_path(name)?;
        if !path.is_file() {
            return Err(FixError::LabelNotFound(name.to_owned()));
        }
        let hex = fs::read_to_string(&path)?;
        RawHandle::from_hex(hex.trim())
            .and_then(|raw| Fix::from_raw(&raw))
            .map_err(|e| corrupt(&path, e))
    }

    pub fn set_label(&self, name: &str, handle: Fix) -> Result<()> {
        let path = self.label_path(name)?;
        fs::write(&path, handle.to_raw().to_hex())?;
        debug!("labelled {handle} as {name}");
        Ok(())
    }

    /// All labels, sorted by name
    pub fn labels(&self) -> Result<Vec<(String, Fix)>> {
        let mut labels = vec![];
        for entry in self.dir.join(LABELS).read_dir_utf8()? {
            let entry = entry?;
            let name = entry.file_name().to_owned();
            let handle = self.label(&name)?;
            labels.push((name, handle));
        }
        labels.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(labels)
    }

    /// Resolves a label, the full hex of a raw handle, or a hex prefix that
    /// matches exactly one stored file
    pub fn resolve(&self, reference: &str) -> Result<Fix> {
        match self.label(reference) {
            Ok(handle) => return Ok(handle),
            Err(FixError::LabelNotFound(_)) => (),
            Err(e) => return Err(e),
        }
        if reference.len() == 64 {
            if let Ok(raw) = RawHandle::from_hex(reference) {
                return Fix::from_raw(&raw);
            }
        }
        if reference.is_empty() || !reference.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(FixError::ReferenceNotFound(reference.to_owned()));
        }
        let prefix = reference.to_ascii_lowercase();
        let mut found = None;
        for sub in [BLOBS, TREES, RELATIONS] {
            for entry in self.dir.join(sub).read_dir_utf8()? {
                let entry = entry?;
                if !entry.file_name().starts_with(&prefix) {
                    continue;
                }
                if found.is_some() {
                    return Err(FixError::AmbiguousReference(reference.to_owned()));
                }
                let raw = RawHandle::from_hex(entry.file_name())
                    .map_err(|e| corrupt(entry.path(), e))?;
                found = Some(Fix::from_raw(&raw).map_err(|e| corrupt(entry.path(), e))?);
            }
        }
        found.ok_or_else(|| FixError::ReferenceNotFound(reference.to_owned()))
    }
}

/// What a relation is about
fn subject(relation: Relation) -> Fix {
    match relation {
        Relation::Eval(o) => o.into(),
        Relation::Apply(c) => c.into(),
    }
}

fn read_bincode<T: serde::de::DeserializeOwned>(path: &Utf8Path) -> Result<T> {
    let reader = BufReader::new(File::open(path)?);
    bincode::deserialize_from(reader).map_err(|e| corrupt(path, e))
}

fn write_bincode<T: serde::Serialize>(path: &Utf8Path, value: &T) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    bincode::serialize_into(&mut writer, value).map_err(|e| corrupt(path, e))?;
    writer.flush()?;
    Ok(())
}
