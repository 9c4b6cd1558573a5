//! Message channels between the two bridge endpoints.
//!
//! A [`Link`] is one endpoint's view of the channel: a sender for outgoing
//! envelopes and a receiver for incoming ones. The channel delivers each
//! message at most once and gives no ordering guarantee the bridge relies on.

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use keybridge_error::BridgeError;

use crate::envelope::{CallKey, Envelope};
use crate::frame::{read_frame, write_message};
use crate::redact;

/// One endpoint of a message channel.
#[derive(Debug)]
pub struct Link {
    /// Envelopes to the other side.
    pub outbound: mpsc::UnboundedSender<Envelope>,
    /// Envelopes from the other side. Closes when the other side is gone.
    pub inbound: mpsc::UnboundedReceiver<Envelope>,
}

/// Two in-memory endpoints wired to each other.
pub fn duplex() -> (Link, Link) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        Link {
            outbound: a_tx,
            inbound: b_rx,
        },
        Link {
            outbound: b_tx,
            inbound: a_rx,
        },
    )
}

/// Serve a [`Link`] over a byte stream using length-delimited JSON frames.
///
/// A frame that is JSON but not a valid envelope is answered with a
/// `MALFORMED_ENVELOPE` error when it names a `correlationId` and `action`
/// and does not claim to be an answer or a signal itself; otherwise it is
/// logged and dropped. An IO error, an oversized frame or EOF closes the
/// link's inbound side. The returned handle completes once both directions
/// have stopped.
pub fn spawn_stream_link<R, W>(reader: R, writer: W, max_message_size: usize) -> (Link, JoinHandle<()>)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Envelope>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<Envelope>();

    let write_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(envelope) = out_rx.recv().await {
            if let Err(e) = write_message(&mut writer, &envelope).await {
                tracing::warn!(error = %e, "failed to write frame, closing link");
                break;
            }
        }
    });

    let reply_tx = out_tx.clone();
    let read_task = tokio::spawn(async move {
        let mut reader = reader;
        loop {
            let frame = match read_frame(&mut reader, max_message_size).await {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read frame, closing link");
                    break;
                }
            };
            let value = match serde_json::from_slice::<Value>(&frame) {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!(error = %e, bytes = frame.len(), "dropping frame that is not JSON");
                    continue;
                }
            };
            match serde_json::from_value::<Envelope>(value.clone()) {
                Ok(envelope) => {
                    if in_tx.send(envelope).is_err() {
                        break;
                    }
                }
                Err(e) => match malformed_reply(&value, &e) {
                    Some(reply) => {
                        tracing::warn!(error = %e, action = %reply.action, "answering malformed envelope");
                        let _ = reply_tx.send(reply);
                    }
                    None => {
                        tracing::warn!(error = %e, bytes = frame.len(), "dropping frame that is not an envelope");
                    }
                },
            }
        }
    });

    let handle = tokio::spawn(async move {
        let _ = read_task.await;
        // Inbound is gone; stop writing once the owner drops its sender.
        let _ = write_task.await;
    });

    (
        Link {
            outbound: out_tx,
            inbound: in_rx,
        },
        handle,
    )
}

/// The error envelope answering a frame that failed to decode, if the frame
/// identifies a call that expects an answer.
fn malformed_reply(frame: &Value, error: &serde_json::Error) -> Option<Envelope> {
    let correlation_id = frame.get("correlationId")?.as_str()?;
    let action = frame.get("action")?.as_str()?;
    if correlation_id.is_empty() || action.is_empty() {
        return None;
    }
    if matches!(
        frame.get("kind").and_then(Value::as_str),
        Some("response" | "error" | "signal")
    ) {
        return None;
    }
    let key = CallKey::new(correlation_id.into(), action);
    let err = BridgeError::MalformedEnvelope(error.to_string());
    Some(Envelope::error(
        &key,
        None,
        redact::error_payload(&err, Some(action), frame.get("payload")),
    ))
}
