//! The daemon's event queue and per-connection outbound queues.
//!
//! Everything that happens to network state arrives here as an [`Event`];
//! the event loop in [`daemon`](crate::daemon) is the sole consumer. I/O
//! tasks never touch state: a read task turns bytes into
//! `Event::Message`s, a write task drains one [`SendHandle`] queue, and
//! both report failure as `Event::Dead`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use mesh_proto::Message;
use tokio::sync::mpsc;

use crate::network::IoStream;
use crate::state::ClientId;

/// Events consumed by the event loop.
pub enum Event {
    /// An accepted or successfully dialed connection.
    NewClient(NewClient),
    /// One parsed message from a live connection.
    Message(ClientId, Message),
    /// A connection's read or write task ended.
    Dead(ClientId),
    /// Once-per-second timer.
    Tick,
    /// SIGHUP: reload the mutable parts of the configuration.
    Rehash,
}

/// Registration payload for a new connection.
pub struct NewClient {
    pub id: ClientId,
    pub handle: SendHandle,
    /// The socket and the write-task half of its outbound queue. `None`
    /// in tests, which keep the queue and drive it directly.
    pub io: Option<(Box<dyn IoStream>, SendQueue)>,
    pub host: String,
    pub ip: String,
    pub tls: bool,
    /// Set when we dialed this connection out to a configured link;
    /// carries the link's name.
    pub link: Option<String>,
}

/// Sender half of a per-connection outbound queue.
///
/// The queue is unbounded so the event loop never blocks; backpressure is
/// a depth counter instead. The write task decrements it as messages reach
/// the socket, and the event loop terminates connections whose depth grows
/// past their sendq limit. Closing the queue is dropping the handle: the
/// write task drains what is left and exits.
#[derive(Clone)]
pub struct SendHandle {
    tx: mpsc::UnboundedSender<Message>,
    depth: Arc<AtomicUsize>,
}

/// Receiver half of a per-connection outbound queue.
pub struct SendQueue {
    pub rx: mpsc::UnboundedReceiver<Message>,
    pub depth: Arc<AtomicUsize>,
}

/// Create a connected queue pair.
pub fn send_queue() -> (SendHandle, SendQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    let depth = Arc::new(AtomicUsize::new(0));
    (
        SendHandle {
            tx,
            depth: depth.clone(),
        },
        SendQueue { rx, depth },
    )
}

impl std::fmt::Debug for SendHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendHandle")
            .field("depth", &self.depth())
            .finish()
    }
}

impl SendHandle {
    /// Enqueue a message; returns the queue depth after the enqueue.
    pub fn send(&self, msg: Message) -> usize {
        let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        if self.tx.send(msg).is_err() {
            // Write task already gone; the Dead event is in flight.
            self.depth.fetch_sub(1, Ordering::Relaxed);
        }
        depth
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }
}

impl SendQueue {
    /// Dequeue the next outbound message, maintaining the depth counter.
    pub async fn recv(&mut self) -> Option<Message> {
        let msg = self.rx.recv().await?;
        self.depth.fetch_sub(1, Ordering::Relaxed);
        Some(msg)
    }

    /// Non-blocking dequeue, used by tests to inspect traffic.
    pub fn try_recv(&mut self) -> Option<Message> {
        let msg = self.rx.try_recv().ok()?;
        self.depth.fetch_sub(1, Ordering::Relaxed);
        Some(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_tracks_enqueue_and_drain() {
        let (handle, mut queue) = send_queue();
        assert_eq!(handle.depth(), 0);

        handle.send(Message::new("PING", ["a"]));
        handle.send(Message::new("PING", ["b"]));
        assert_eq!(handle.depth(), 2);

        assert_eq!(queue.try_recv().unwrap().param(0), Some("a"));
        assert_eq!(handle.depth(), 1);
        assert_eq!(queue.try_recv().unwrap().param(0), Some("b"));
        assert_eq!(handle.depth(), 0);
        assert!(queue.try_recv().is_none());
    }

    #[test]
    fn send_after_receiver_drop_is_harmless() {
        let (handle, queue) = send_queue();
        drop(queue);
        handle.send(Message::new("PING", ["x"]));
        assert_eq!(handle.depth(), 0);
    }
}
