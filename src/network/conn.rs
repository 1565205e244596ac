//! Per-connection read and write tasks.
//!
//! The read task turns wire lines into `Event::Message`s, preserving
//! arrival order; the write task drains the connection's outbound queue
//! until the event loop drops its [`SendHandle`](crate::event::SendHandle).
//! Any failure on either side surfaces as `Event::Dead` and the event loop
//! runs the quit path appropriate to the client's promotion state.

use futures_util::{SinkExt, StreamExt};
use mesh_proto::codec::MessageCodec;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::debug;

use crate::event::{Event, SendQueue};
use crate::network::IoStream;
use crate::state::ClientId;

/// Spawn the I/O pair for a registered connection.
pub fn spawn_io(
    stream: Box<dyn IoStream>,
    id: ClientId,
    queue: SendQueue,
    events_tx: mpsc::UnboundedSender<Event>,
) {
    let (read_half, write_half) = tokio::io::split(stream);

    {
        let events_tx = events_tx.clone();
        tokio::spawn(async move {
            let mut reader = FramedRead::new(read_half, MessageCodec::new());
            loop {
                match reader.next().await {
                    Some(Ok(msg)) => {
                        if events_tx.send(Event::Message(id, msg)).is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        debug!(client = id, error = %e, "Read task closing");
                        break;
                    }
                    None => break,
                }
            }
            let _ = events_tx.send(Event::Dead(id));
        });
    }

    tokio::spawn(async move {
        let mut queue = queue;
        let mut writer = FramedWrite::new(write_half, MessageCodec::new());
        while let Some(msg) = queue.recv().await {
            if let Err(e) = writer.send(msg).await {
                debug!(client = id, error = %e, "Write task closing");
                let _ = events_tx.send(Event::Dead(id));
                return;
            }
        }
        // Queue closed: the event loop dropped this connection. Flush what
        // was drained and let the socket close.
        let _ = writer.flush().await;
    });
}
