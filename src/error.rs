use camino::Utf8PathBuf;
use thiserror::Error;

use crate::handle::Fix;

#[derive(Error, Debug, Clone)]
pub enum FixError {
    #[error("Handle not found: {0}")]
    HandleNotFound(Fix),
    #[error("Kind mismatch: expected {expected}, found {found}")]
    KindMismatch {
        expected: &'static str,
        found: Fix,
    },
    #[error("Malformed handle: {0}")]
    MalformedHandle(String),
    #[error("Table `{table}` is full ({capacity} slots)")]
    TableFull {
        table: &'static str,
        capacity: usize,
    },
    #[error("Index {index} out of range for {handle}")]
    OutOfRange { handle: Fix, index: u64 },
    #[error("Procedure error: {0}")]
    Procedure(String),
    #[error("Repository not found at {0}")]
    RepositoryNotFound(Utf8PathBuf),
    #[error("Repository corrupt: {0}")]
    RepositoryCorrupt(String),
    #[error("Label not found: {0}")]
    LabelNotFound(String),
    #[error("Reference not found: {0}")]
    ReferenceNotFound(String),
    #[error("Ambiguous reference: {0}")]
    AmbiguousReference(String),
    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for FixError {
    fn from(e: std::io::Error) -> Self {
        FixError::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FixError>;

/// Shorthand for the evaluation outcome: `Ok(None)` means some dependency is
/// still in flight and the caller must try again later.
pub type Pending<T> = Result<Option<T>>;
