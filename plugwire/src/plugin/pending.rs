//! Correlation table and the caller-side handle for an in-flight call.

use std::collections::HashMap;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;

use super::Inner;
use crate::bridge::protocol::Message;
use crate::codec::{JsonCodec, ValueCodec};
use crate::error::{Error, Result};
use crate::values::Values;

type Slot = oneshot::Sender<Result<Message>>;

#[derive(Default)]
struct Table {
    calls: HashMap<u64, Slot>,
    /// Set once the connection is gone; later registrations fail with it.
    closed: Option<Error>,
}

/// In-flight call id → one-shot delivery slot.
#[derive(Default)]
pub(crate) struct PendingTable {
    table: Mutex<Table>,
}

impl PendingTable {
    fn lock(&self) -> MutexGuard<'_, Table> {
        // Entries are plain senders; a panic mid-update leaves nothing half-written.
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(&self, id: u64) -> Result<oneshot::Receiver<Result<Message>>> {
        let mut table = self.lock();
        if let Some(err) = &table.closed {
            return Err(err.clone());
        }
        let (tx, rx) = oneshot::channel();
        table.calls.insert(id, tx);
        Ok(rx)
    }

    pub(crate) fn take(&self, id: u64) -> Option<Slot> {
        self.lock().calls.remove(&id)
    }

    pub(crate) fn remove(&self, id: u64) -> bool {
        self.lock().calls.remove(&id).is_some()
    }

    /// Fail every pending call with `err` and refuse new ones.
    ///
    /// The first close wins; later closes only drain stragglers.
    pub(crate) fn close(&self, err: Error) -> usize {
        let (err, drained) = {
            let mut table = self.lock();
            let err = table.closed.get_or_insert(err).clone();
            let drained: Vec<Slot> = table.calls.drain().map(|(_, slot)| slot).collect();
            (err, drained)
        };
        let count = drained.len();
        for slot in drained {
            let _ = slot.send(Err(err.clone()));
        }
        count
    }

    /// Why the table was closed; `ConnectionClosed` while it is still open.
    pub(crate) fn close_cause(&self) -> Error {
        self.lock().closed.clone().unwrap_or(Error::ConnectionClosed)
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().calls.len()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }
}

/// Handle to a call that has been queued for the peer.
///
/// Await it (or call [`PendingCall::wait`]) for the decoded results. Dropping
/// the handle abandons the call; a late response is then discarded.
#[must_use = "a pending call does nothing unless awaited"]
pub struct PendingCall<C: ValueCodec = JsonCodec> {
    id: u64,
    func_id: String,
    rx: oneshot::Receiver<Result<Message>>,
    inner: Arc<Inner<C>>,
    timeout: Option<Duration>,
}

impl<C: ValueCodec> PendingCall<C> {
    pub(crate) fn new(
        id: u64,
        func_id: String,
        rx: oneshot::Receiver<Result<Message>>,
        inner: Arc<Inner<C>>,
    ) -> Self {
        let timeout = inner.controller.config().call_timeout;
        Self {
            id,
            func_id,
            rx,
            inner,
            timeout,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn func_id(&self) -> &str {
        &self.func_id
    }

    /// Fail with [`Error::Timeout`] if no response arrives within `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn without_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }

    /// Abandon the call. Equivalent to dropping the handle.
    pub fn cancel(self) {
        tracing::debug!(id = self.id, func_id = %self.func_id, "Cancelling pending call");
    }

    pub async fn wait(mut self) -> Result<Values> {
        let outcome = match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, &mut self.rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::debug!(id = self.id, func_id = %self.func_id, ?timeout, "Call timed out");
                    return Err(Error::Timeout(timeout));
                }
            },
            None => (&mut self.rx).await,
        };

        let response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => return Err(err),
            Err(_) => return Err(Error::ConnectionClosed),
        };
        if let Some(message) = response.error {
            return Err(Error::Remote {
                func_id: self.func_id.clone(),
                message,
            });
        }
        self.inner.controller.decode_values(&response.values)
    }
}

impl<C: ValueCodec> Drop for PendingCall<C> {
    fn drop(&mut self) {
        if self.inner.pending.remove(self.id) {
            tracing::trace!(id = self.id, func_id = %self.func_id, "Removed abandoned call");
        }
    }
}

impl<C: ValueCodec> IntoFuture for PendingCall<C> {
    type Output = Result<Values>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}

impl<C: ValueCodec> std::fmt::Debug for PendingCall<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("id", &self.id)
            .field("func_id", &self.func_id)
            .field("timeout", &self.timeout)
            .finish()
    }
}
