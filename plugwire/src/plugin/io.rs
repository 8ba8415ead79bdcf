//! Reader and writer loops.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::{BoxReader, BoxWriter, Inner};
use crate::bridge::codec::MessageCodec;
use crate::bridge::protocol::Message;
use crate::codec::ValueCodec;
use crate::error::Error;

/// Decode frames one at a time, routing responses to their callers and
/// requests to dispatch tasks.
///
/// Owns the last long-lived `results` sender: once this loop and every
/// dispatch it started are done, the writer sees the results queue close.
pub(super) async fn read_loop<C: ValueCodec>(
    inner: Arc<Inner<C>>,
    mut frames: FramedRead<BoxReader, MessageCodec>,
    results: mpsc::Sender<Message>,
) {
    loop {
        let frame = tokio::select! {
            biased;

            _ = inner.shutdown.cancelled() => {
                tracing::debug!("Reader stopping on shutdown");
                inner.pending.close(Error::ConnectionClosed);
                break;
            }
            frame = frames.next() => frame,
        };

        match frame {
            Some(Ok(message)) if message.is_response => {
                tracing::debug!(id = message.id, func_id = %message.func_id, "Response received");
                inner.deliver(message);
            }
            Some(Ok(message)) => {
                tracing::debug!(id = message.id, func_id = %message.func_id, "Request received");
                dispatch(&inner, message, &results);
            }
            Some(Err(e)) => {
                let err = if e.kind() == std::io::ErrorKind::InvalidData {
                    Error::Protocol(e.to_string())
                } else {
                    Error::Io(e.to_string())
                };
                inner.fail(err);
                break;
            }
            None => {
                tracing::debug!("Peer closed its stream");
                inner.begin_draining();
                let failed = inner.pending.close(Error::ConnectionClosed);
                if failed > 0 {
                    tracing::warn!(failed, "Peer closed with calls still pending");
                }
                break;
            }
        }
    }
    drop(results);
    inner.finish_loop("reader");
}

/// Invoke an inbound request off the reader.
///
/// Arguments are decoded here so malformed values are answered in order; the
/// function itself runs on the blocking pool and may call back into the peer.
/// Every request gets exactly one response, carrying the error on failure.
fn dispatch<C: ValueCodec>(inner: &Arc<Inner<C>>, request: Message, results: &mpsc::Sender<Message>) {
    let Message {
        id,
        func_id,
        values,
        ..
    } = request;
    let controller = Arc::clone(&inner.controller);
    let results = results.clone();
    let args = controller.decode_values(&values);

    tokio::spawn(async move {
        let outcome = match args {
            Ok(args) => {
                let invoked = Arc::clone(&controller);
                let name = func_id.clone();
                match tokio::task::spawn_blocking(move || invoked.invoke_local(&name, args)).await {
                    Ok(outcome) => outcome,
                    Err(e) if e.is_panic() => {
                        Err(Error::function_failed(&func_id, "function panicked"))
                    }
                    Err(_) => Err(Error::Cancelled),
                }
            }
            Err(e) => Err(e),
        };

        let response = outcome
            .and_then(|out| controller.encode_values(&out))
            .map(|values| Message::response(id, &func_id, values))
            .and_then(|response| controller.check_frame(&response).map(|()| response));
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(id, %func_id, error = %e, "Inbound call failed");
                Message::failure(id, &func_id, e.to_string())
            }
        };
        if results.send(response).await.is_err() {
            tracing::debug!(id, %func_id, "Writer gone, dropping response");
        }
    });
}

enum Outbound {
    Result(Option<Message>),
    Call(Option<Message>),
}

/// Write results and calls in strict round-robin order: after serving one
/// queue, the other is preferred for the next frame.
pub(super) async fn write_loop<C: ValueCodec>(
    inner: Arc<Inner<C>>,
    mut frames: FramedWrite<BoxWriter, MessageCodec>,
    mut results: mpsc::Receiver<Message>,
    mut calls: mpsc::Receiver<Message>,
) {
    let mut prefer_results = true;
    let mut calls_open = true;

    loop {
        let next = if prefer_results {
            tokio::select! {
                biased;

                _ = inner.shutdown.cancelled() => break,
                message = results.recv() => Outbound::Result(message),
                message = calls.recv(), if calls_open => Outbound::Call(message),
            }
        } else {
            tokio::select! {
                biased;

                _ = inner.shutdown.cancelled() => break,
                message = calls.recv(), if calls_open => Outbound::Call(message),
                message = results.recv() => Outbound::Result(message),
            }
        };

        let message = match next {
            Outbound::Result(Some(message)) => {
                prefer_results = false;
                message
            }
            Outbound::Call(Some(message)) => {
                prefer_results = true;
                message
            }
            Outbound::Result(None) => {
                tracing::debug!("Results queue closed, writer finishing");
                break;
            }
            Outbound::Call(None) => {
                calls_open = false;
                continue;
            }
        };

        let (id, is_response) = (message.id, message.is_response);
        // A peer that stops reading must not keep stop() from finishing.
        let written = tokio::select! {
            biased;

            _ = inner.shutdown.cancelled() => break,
            written = frames.send(message) => written,
        };
        if let Err(e) = written {
            inner.fail(Error::from(e));
            break;
        }
        tracing::trace!(id, is_response, "Frame written");
    }

    // Calls still queued can never be answered; their table entries were
    // failed when the reader finished.
    calls.close();
    inner.finish_loop("writer");
}
