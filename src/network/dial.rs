//! Outbound link attempts.
//!
//! The tick loop decides *when* to dial; this module only performs the
//! connection and hands the socket to the event loop, which recognizes the
//! `link` field and opens the handshake.

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::LinkBlock;
use crate::event::{send_queue, Event, NewClient};
use crate::network::IoStream;
use crate::state::ClientIdAllocator;

pub fn spawn_dial(
    link: LinkBlock,
    ids: Arc<ClientIdAllocator>,
    events_tx: mpsc::UnboundedSender<Event>,
) {
    tokio::spawn(async move {
        info!(link = %link.name, host = %link.hostname, port = link.port, "Dialing link");

        let stream = match TcpStream::connect((link.hostname.as_str(), link.port)).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(link = %link.name, error = %e, "Link dial failed");
                return;
            }
        };

        let stream: Box<dyn IoStream> = if link.tls {
            match crate::network::tls::connect_client(stream, &link.hostname).await {
                Ok(tls_stream) => Box::new(tls_stream),
                Err(e) => {
                    warn!(link = %link.name, error = %e, "Link TLS handshake failed");
                    return;
                }
            }
        } else {
            Box::new(stream)
        };

        let (handle, queue) = send_queue();
        let _ = events_tx.send(Event::NewClient(NewClient {
            id: ids.next(),
            handle,
            io: Some((stream, queue)),
            host: link.hostname.clone(),
            ip: link.hostname.clone(),
            tls: link.tls,
            link: Some(link.name),
        }));
    });
}
