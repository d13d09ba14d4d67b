//! Outbound queue and sender loop.
//!
//! All writes to the socket funnel through one unbounded MPSC channel
//! drained by a dedicated sender task; the task is the sole writer, so
//! message ordering is exactly queue-arrival ordering and no lock ever
//! guards the sink.
//!
//! ```text
//! caller 1 ─┐
//! caller 2 ─┼─► mpsc::UnboundedSender<Outbound> ─► sender loop ─► WebSocket sink
//! dispatch ─┘
//! ```
//!
//! A logical message travels as its pre-built fragment list (see
//! [`crate::protocol::encode_fragments`]): one binary WebSocket
//! message when it fits in a single fragment, otherwise raw data
//! frames with the `final` flag clear on all but the last. The
//! message-level sink always terminates a binary message itself, so
//! multi-fragment emission goes through the frame-level escape hatch.
//!
//! Request frames are counted into the connection's in-flight counter
//! *before* they enter the queue (see [`crate::connection`]); the
//! sender loop only accounts for responses, whose completion may be
//! the last piece of in-flight work holding a draining connection open.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::{CloseCode, Data as OpData, OpCode};
use tokio_tungstenite::tungstenite::protocol::frame::Frame as WsFrame;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace};

use crate::connection::{CloseKind, CloseReason, Shared};

/// What kind of logical message a frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameKind {
    /// Outbound request (uid allocated, counted in-flight at enqueue).
    Request,
    /// Response to an inbound request (counted out after sending).
    Response,
    /// Fire-and-forget request (never counted).
    Notification,
}

/// A message queued for the sender loop.
#[derive(Debug)]
pub(crate) enum Outbound {
    /// One logical message, pre-built as its wire fragments.
    Frame {
        fragments: Vec<Bytes>,
        kind: FrameKind,
    },
    /// Close the connection: send a close frame and stop writing.
    Close { code: CloseCode, reason: String },
    /// Keep-alive ping.
    Ping,
    /// Reply to a peer ping.
    Pong(Vec<u8>),
}

/// Drain the outbound queue into the socket sink.
///
/// Exits when the queue closes, when a close frame has been sent, or
/// when a write fails (which disposes the connection).
pub(crate) async fn sender_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    shared: Arc<Shared>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    while let Some(out) = rx.recv().await {
        match out {
            Outbound::Frame { fragments, kind } => {
                trace!(fragments = fragments.len(), ?kind, "sending frame");
                if let Err(e) = send_fragments(&mut sink, fragments).await {
                    debug!(error = %e, "socket write failed");
                    shared.atomic_dispose(CloseReason {
                        graceful: false,
                        description: format!("write failed: {}", e),
                        kind: CloseKind::Transport,
                    });
                    break;
                }

                // A sent response may have been the last outstanding
                // piece of work on a draining connection.
                if kind == FrameKind::Response && shared.complete_one() {
                    shared.on_work_drained();
                }
            }
            Outbound::Close { code, reason } => {
                debug!(%reason, "sending close frame");
                let frame = CloseFrame {
                    code,
                    reason: reason.into(),
                };
                if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                    debug!(error = %e, "close frame write failed");
                    shared.atomic_dispose(CloseReason {
                        graceful: false,
                        description: format!("write failed: {}", e),
                        kind: CloseKind::Transport,
                    });
                }
                // Nothing may follow a close frame.
                break;
            }
            Outbound::Ping => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            Outbound::Pong(data) => {
                if sink.send(Message::Pong(data)).await.is_err() {
                    break;
                }
            }
        }
    }
    trace!("sender loop finished");
}

/// Emit one logical message.
///
/// A single fragment goes out as an ordinary binary message. Multiple
/// fragments go out as raw data frames — binary first, continuations
/// after, `final` set only on the last — which the peer's WebSocket
/// layer reassembles into one binary message. No other data frame can
/// interleave: this task is the sink's only writer.
async fn send_fragments<S>(
    sink: &mut SplitSink<WebSocketStream<S>, Message>,
    fragments: Vec<Bytes>,
) -> std::result::Result<(), WsError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    if fragments.len() == 1 {
        return sink.send(Message::Binary(fragments[0].to_vec())).await;
    }

    let last = fragments.len() - 1;
    for (i, fragment) in fragments.into_iter().enumerate() {
        let opcode = if i == 0 {
            OpCode::Data(OpData::Binary)
        } else {
            OpCode::Data(OpData::Continue)
        };
        let frame = WsFrame::message(fragment.to_vec(), opcode, i == last);
        sink.send(Message::Frame(frame)).await?;
    }
    Ok(())
}
