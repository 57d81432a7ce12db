//! An in-process link between two relaters.
//!
//! Each relater listens on an inbox channel. A `Peer` held by one relater
//! sends to the other's inbox and names its own inbox as the place for
//! answers, so neither side keeps the other alive.

use crossbeam_channel::{bounded, Sender};
use tracing::trace;

use super::{IRuntime, Info, Relater, RemoteId};
use crate::error::{FixError, Result};
use crate::handle::Fix;
use crate::storage::Data;

/// What travels between relaters
#[derive(Debug)]
pub enum Message {
    /// Asks for data, or for a relation to be computed
    Get { handle: Fix, reply: Sender<Message> },
    Put { handle: Fix, data: Data },
    /// The sender doesn't have the data
    Missing { handle: Fix },
    Failed { handle: Fix, error: FixError },
    Contains { handle: Fix, reply: Sender<bool> },
    Stop,
}

#[derive(Debug)]
pub struct Peer {
    remote: Sender<Message>,
    local: Sender<Message>,
    info: Option<Info>,
}

impl Peer {
    /// A view of `remote` from `local`
    pub fn new(local: &Relater, remote: &Relater) -> Self {
        Self {
            remote: remote.inbox(),
            local: local.inbox(),
            info: remote.get_info(),
        }
    }

    fn send(&self, message: Message) -> Result<()> {
        self.remote
            .send(message)
            .map_err(|_| FixError::Io("peer disconnected".into()))
    }
}

impl IRuntime for Peer {
    fn get(&self, handle: Fix) -> Result<Option<Data>> {
        trace!("asking peer for {handle}");
        self.send(Message::Get {
            handle,
            reply: self.local.clone(),
        })?;
        Ok(None)
    }

    fn put(&self, handle: Fix, data: Data) -> Result<()> {
        self.send(Message::Put { handle, data })
    }

    fn contains(&self, handle: Fix) -> bool {
        let (reply, answer) = bounded(1);
        self.send(Message::Contains { handle, reply }).is_ok() && answer.recv().unwrap_or(false)
    }

    fn get_info(&self) -> Option<Info> {
        self.info
    }
}

/// Connects `a` and `b` both ways. Returns the id of `b` in `a` and of `a`
/// in `b`.
pub fn link(a: &Relater, b: &Relater) -> (RemoteId, RemoteId) {
    let to_b = a.connect(std::sync::Arc::new(Peer::new(a, b)));
    let to_a = b.connect(std::sync::Arc::new(Peer::new(b, a)));
    (to_b, to_a)
}
