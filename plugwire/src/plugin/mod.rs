//! The connection endpoint.
//!
//! A [`Plugin`] wraps an input and an output byte stream (a child's
//! stdout/stdin, this process's stdin/stdout, or any stream pair) and runs two
//! loops over them:
//!
//! ```text
//!   call() ──► calls queue ──┐                      ┌──► response → pending table → PendingCall
//!                            ├─► writer ══ wire ══ reader
//!   dispatch ─► results ─────┘                      └──► request → dispatch task (spawn_blocking)
//! ```
//!
//! Responses are matched to calls purely by correlation id. Inbound requests
//! are dispatched on their own tasks so a slow function never stalls the
//! reader.

mod io;
mod pending;
mod process;

pub use pending::PendingCall;

use std::process::ExitStatus;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::{OnceCell, mpsc};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::MessageCodec;
use crate::bridge::protocol::Message;
use crate::codec::{JsonCodec, ValueCodec};
use crate::controller::Controller;
use crate::error::{Error, Result};
use crate::values::Values;

use pending::PendingTable;

pub(crate) type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Reader and writer.
const LOOP_COUNT: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Created,
    Running,
    /// The peer closed its stream or a stop was requested; loops are winding down.
    Draining,
    Stopped,
}

/// What a not-yet-started connection will run over.
pub(crate) enum Endpoint {
    Process(Command),
    Streams { reader: BoxReader, writer: BoxWriter },
}

enum Lifecycle {
    Created(Endpoint),
    Running,
    Draining,
    Stopped,
}

impl Lifecycle {
    fn state(&self) -> ConnectionState {
        match self {
            Self::Created(_) => ConnectionState::Created,
            Self::Running => ConnectionState::Running,
            Self::Draining => ConnectionState::Draining,
            Self::Stopped => ConnectionState::Stopped,
        }
    }
}

pub(crate) struct Inner<C: ValueCodec> {
    pub(crate) controller: Arc<Controller<C>>,
    pub(crate) pending: PendingTable,
    lifecycle: Mutex<Lifecycle>,
    next_id: AtomicU64,
    calls_tx: mpsc::Sender<Message>,
    calls_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    child: Mutex<Option<Child>>,
    exit: OnceCell<Option<ExitStatus>>,
    /// First connection-fatal error, surfaced once by `wait()`.
    failure: Mutex<Option<Error>>,
    active: AtomicUsize,
    drained: CancellationToken,
    pub(crate) shutdown: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<C: ValueCodec> Inner<C> {
    fn set_state(&self, next: Lifecycle) {
        *lock(&self.lifecycle) = next;
    }

    /// Running → Draining; no-op in any other state.
    pub(crate) fn begin_draining(&self) {
        let mut lifecycle = lock(&self.lifecycle);
        if matches!(*lifecycle, Lifecycle::Running) {
            *lifecycle = Lifecycle::Draining;
        }
    }

    /// Record a connection-fatal error, fail every pending call with it and
    /// stop both loops.
    pub(crate) fn fail(&self, err: Error) {
        tracing::error!(error = %err, "Connection failed");
        lock(&self.failure).get_or_insert_with(|| err.clone());
        let failed = self.pending.close(err);
        if failed > 0 {
            tracing::warn!(failed, "Failed pending calls");
        }
        self.begin_draining();
        self.shutdown.cancel();
    }

    pub(crate) fn finish_loop(&self, name: &'static str) {
        let remaining = self.active.fetch_sub(1, Ordering::AcqRel) - 1;
        tracing::debug!(task = name, remaining, "Connection loop finished");
        if remaining == 0 {
            self.begin_draining();
            self.drained.cancel();
        }
    }

    /// Route a response to its waiting call.
    pub(crate) fn deliver(&self, response: Message) {
        let id = response.id;
        match self.pending.take(id) {
            Some(slot) => {
                if slot.send(Ok(response)).is_err() {
                    tracing::debug!(id, "Caller went away before the response arrived");
                }
            }
            None => {
                tracing::warn!(id, func_id = %response.func_id, "Dropping response with no pending call");
            }
        }
    }
}

/// A connection to a peer process. Cheap to clone; clones share the connection.
pub struct Plugin<C: ValueCodec = JsonCodec> {
    inner: Arc<Inner<C>>,
}

impl<C: ValueCodec> Clone for Plugin<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: ValueCodec> std::fmt::Debug for Plugin<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("state", &self.state())
            .field("pending", &self.inner.pending.len())
            .finish()
    }
}

impl<C: ValueCodec> Plugin<C> {
    pub(crate) fn new(controller: Arc<Controller<C>>, endpoint: Endpoint) -> Self {
        let (calls_tx, calls_rx) = mpsc::channel(controller.config().queue_capacity);
        Self {
            inner: Arc::new(Inner {
                controller,
                pending: PendingTable::default(),
                lifecycle: Mutex::new(Lifecycle::Created(endpoint)),
                next_id: AtomicU64::new(0),
                calls_tx,
                calls_rx: Mutex::new(Some(calls_rx)),
                child: Mutex::new(None),
                exit: OnceCell::new(),
                failure: Mutex::new(None),
                active: AtomicUsize::new(LOOP_COUNT),
                drained: CancellationToken::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn controller(&self) -> &Controller<C> {
        &self.inner.controller
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner.lifecycle).state()
    }

    /// Number of calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// True once the connection can no longer accept calls.
    pub fn is_closed(&self) -> bool {
        self.inner.pending.is_closed()
    }

    /// OS process id of the child, if this connection spawned one and it is
    /// still running.
    pub fn child_id(&self) -> Option<u32> {
        lock(&self.inner.child).as_ref().and_then(Child::id)
    }

    /// Spawn the child (if any) and launch the reader and writer loops.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let endpoint = {
            let mut lifecycle = lock(&self.inner.lifecycle);
            match std::mem::replace(&mut *lifecycle, Lifecycle::Running) {
                Lifecycle::Created(endpoint) => endpoint,
                other => {
                    *lifecycle = other;
                    return Err(Error::AlreadyStarted);
                }
            }
        };

        let (reader, writer) = match endpoint {
            Endpoint::Process(command) => match process::spawn(command) {
                Ok((child, reader, writer)) => {
                    tracing::info!(pid = ?child.id(), "Plugin process started");
                    *lock(&self.inner.child) = Some(child);
                    (reader, writer)
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to spawn plugin process");
                    self.inner.set_state(Lifecycle::Stopped);
                    self.inner.pending.close(Error::ConnectionClosed);
                    self.inner.drained.cancel();
                    return Err(e);
                }
            },
            Endpoint::Streams { reader, writer } => (reader, writer),
        };

        let Some(calls_rx) = lock(&self.inner.calls_rx).take() else {
            return Err(Error::AlreadyStarted);
        };
        let config = self.inner.controller.config();
        let (results_tx, results_rx) = mpsc::channel(config.queue_capacity);
        let codec =
            || MessageCodec::with_max_frame_length(config.frame_format, config.max_frame_length);
        let frames_in = FramedRead::new(reader, codec());
        let frames_out = FramedWrite::new(writer, codec());

        tracing::debug!(
            frame_format = %config.frame_format,
            codec = config.value_codec.name(),
            queue_capacity = config.queue_capacity,
            max_frame_length = config.max_frame_length,
            "Connection starting"
        );
        tokio::spawn(io::read_loop(Arc::clone(&self.inner), frames_in, results_tx));
        tokio::spawn(io::write_loop(
            Arc::clone(&self.inner),
            frames_out,
            results_rx,
            calls_rx,
        ));
        Ok(())
    }

    /// Send a call to the peer and return a handle to its eventual results.
    ///
    /// Waits while the outbound queue is full.
    pub async fn call(&self, func_id: &str, args: Values) -> Result<PendingCall<C>> {
        let controller = &self.inner.controller;
        let values = controller.encode_call(func_id, &args)?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let request = Message::request(id, func_id, values);
        // Refused here so an oversized call never reaches the writer.
        controller.check_frame(&request)?;

        let rx = self.inner.pending.register(id)?;
        // From here on, dropping the handle clears the table entry.
        let call = PendingCall::new(id, func_id.to_string(), rx, Arc::clone(&self.inner));

        tokio::select! {
            biased;

            _ = self.inner.shutdown.cancelled() => return Err(self.inner.pending.close_cause()),
            sent = self.inner.calls_tx.send(request) => {
                if sent.is_err() {
                    return Err(self.inner.pending.close_cause());
                }
            }
        }
        tracing::debug!(id, func_id, "Call queued");
        Ok(call)
    }

    /// [`Plugin::call`] and wait for the results.
    pub async fn invoke(&self, func_id: &str, args: Values) -> Result<Values> {
        self.call(func_id, args).await?.wait().await
    }

    /// Interrupt the child (or, without one, stop both loops), then [`Plugin::wait`].
    pub async fn stop(&self) -> Result<Option<ExitStatus>> {
        {
            let mut lifecycle = lock(&self.inner.lifecycle);
            if matches!(*lifecycle, Lifecycle::Created(_)) {
                *lifecycle = Lifecycle::Stopped;
                drop(lifecycle);
                self.inner.pending.close(Error::ConnectionClosed);
                self.inner.drained.cancel();
                return Ok(None);
            }
        }

        let interrupted = {
            let mut child = lock(&self.inner.child);
            match child.as_mut() {
                Some(child) => {
                    process::interrupt(child);
                    true
                }
                None => false,
            }
        };
        if !interrupted {
            tracing::debug!("Stopping stream connection");
            self.inner.begin_draining();
            self.inner.shutdown.cancel();
        }
        self.wait().await
    }

    /// Wait until both loops have finished, then reap the child.
    ///
    /// A connection failure is reported here once; later calls return the
    /// exit status.
    pub async fn wait(&self) -> Result<Option<ExitStatus>> {
        self.inner.drained.cancelled().await;

        let status = *self
            .inner
            .exit
            .get_or_try_init(|| async {
                let child = lock(&self.inner.child).take();
                match child {
                    Some(mut child) => {
                        let status = child.wait().await?;
                        tracing::info!(%status, "Plugin process exited");
                        Ok::<_, Error>(Some(status))
                    }
                    None => Ok(None),
                }
            })
            .await?;

        self.inner.set_state(Lifecycle::Stopped);
        if let Some(err) = lock(&self.inner.failure).take() {
            return Err(err);
        }
        Ok(status)
    }
}
