use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{
    call::RpcResponse,
    wire::{Envelope, FrameKind},
};
use crate::{
    common::promise::Promise,
    error::Error,
    remoting::{Connection, ConnectionId, FrameHandler},
};

// Finished and abandoned entries are swept out once the table reaches
// this size.
const SWEEP_AT: usize = 256;

struct Pending {
    promise: Promise<RpcResponse>,
    // the connection the request went out on, once it has
    connection: Option<ConnectionId>,
}

/// Correlates request ids with the promises of their callers.
///
/// A request is tied to the connection it was written on, and losing that
/// connection fails it. Requests not yet written are left alone: they go
/// out on whatever connection comes next.
pub struct Exchange {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, Pending>>,
}

impl Default for Exchange {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }
}

impl Exchange {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Allocates a request id and the promise its response completes.
    pub fn open(&self) -> (u64, Promise<RpcResponse>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let promise = Promise::new();
        let mut pending = self.pending.lock();
        if pending.len() >= SWEEP_AT {
            // a caller that dropped its promise will never read the answer
            pending.retain(|_, entry| {
                !entry.promise.is_done() && entry.promise.is_shared()
            });
        }
        pending.insert(
            id,
            Pending {
                promise: promise.clone(),
                connection: None,
            },
        );
        (id, promise)
    }

    /// Records that request `id` is being written on `connection`. Returns
    /// false when the request is no longer pending.
    pub fn sent_on(&self, id: u64, connection: ConnectionId) -> bool {
        match self.pending.lock().get_mut(&id) {
            Some(entry) => {
                entry.connection = Some(connection);
                true
            }
            None => false,
        }
    }

    pub fn complete(&self, id: u64, response: RpcResponse) -> bool {
        match self.pending.lock().remove(&id) {
            Some(entry) => entry.promise.set_success(response),
            None => false,
        }
    }

    pub fn fail(&self, id: u64, error: Error) -> bool {
        match self.pending.lock().remove(&id) {
            Some(entry) => entry.promise.set_failure(error),
            None => false,
        }
    }

    /// Fails the requests written on `connection`.
    pub fn fail_connection(
        &self,
        connection: ConnectionId,
        error: Error,
    ) -> usize {
        let lost: Vec<_> = self
            .pending
            .lock()
            .extract_if(|_, entry| entry.connection == Some(connection))
            .collect();
        let failed = settle(lost, &error);
        if failed > 0 {
            debug!(
                connection,
                failed,
                %error,
                "failed requests of a lost connection"
            );
        }
        failed
    }

    /// Fails every outstanding request with `error`.
    pub fn fail_all(&self, error: Error) -> usize {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        let failed = settle(drained, &error);
        if failed > 0 {
            debug!(failed, %error, "failed outstanding requests");
        }
        failed
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }
}

fn settle(entries: Vec<(u64, Pending)>, error: &Error) -> usize {
    entries
        .into_iter()
        .filter(|(_, entry)| entry.promise.set_failure(error.clone()))
        .count()
}

impl FrameHandler for Exchange {
    fn received(&self, connection: &Arc<dyn Connection>, frame: Vec<u8>) {
        let envelope = match Envelope::decode(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    remote = %connection.remote(),
                    %e,
                    "dropping unreadable frame"
                );
                return;
            }
        };
        if envelope.kind != FrameKind::Response {
            warn!(
                remote = %connection.remote(),
                id = envelope.id,
                "unexpected request on a client connection"
            );
            return;
        }
        let response = RpcResponse {
            value: envelope.payload,
            error: envelope.error,
        };
        if !self.complete(envelope.id, response) {
            debug!(id = envelope.id, "response for a request nobody waits for");
        }
    }

    fn closed(&self, connection: ConnectionId) {
        self.fail_connection(connection, Error::ConnectionClosed);
    }
}
