//! Listener binding and acceptor tasks.

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use crate::config::Config;
use crate::event::{send_queue, Event, NewClient};
use crate::network::IoStream;
use crate::state::ClientIdAllocator;

pub struct Listeners {
    plain: Option<TcpListener>,
    tls: Option<(TcpListener, TlsAcceptor)>,
}

/// Bind every configured listener. Failing to bind is a startup error.
pub async fn bind(conf: &Config) -> anyhow::Result<Listeners> {
    let plain = match conf.listen.port {
        Some(port) => {
            let addr = (conf.listen.host.as_str(), port);
            let listener = TcpListener::bind(addr).await?;
            info!(host = %conf.listen.host, port, "Listening (plaintext)");
            Some(listener)
        }
        None => None,
    };

    let tls = match conf.listen.tls_port {
        Some(port) => {
            let tls_conf = conf
                .tls
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("listen.tls_port set without [tls] section"))?;
            let acceptor = crate::network::tls::make_acceptor(tls_conf)?;
            let addr = (conf.listen.host.as_str(), port);
            let listener = TcpListener::bind(addr).await?;
            info!(host = %conf.listen.host, port, "Listening (TLS)");
            Some((listener, acceptor))
        }
        None => None,
    };

    Ok(Listeners { plain, tls })
}

/// Spawn one acceptor task per bound listener.
pub fn spawn_acceptors(
    listeners: Listeners,
    ids: Arc<ClientIdAllocator>,
    events_tx: mpsc::UnboundedSender<Event>,
    shutdown: watch::Receiver<bool>,
) {
    if let Some(listener) = listeners.plain {
        let ids = ids.clone();
        let events_tx = events_tx.clone();
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            announce(Box::new(stream), addr.ip().to_string(), false, &ids, &events_tx);
                        }
                        Err(e) => warn!(error = %e, "Accept failed"),
                    },
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    if let Some((listener, acceptor)) = listeners.tls {
        let mut shutdown = shutdown;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            spawn_tls_accept(stream, addr.ip().to_string(), acceptor.clone(), ids.clone(), events_tx.clone());
                        }
                        Err(e) => warn!(error = %e, "Accept failed"),
                    },
                    _ = shutdown.changed() => break,
                }
            }
        });
    }
}

/// TLS handshakes run per connection so a stalled handshake cannot block
/// the accept loop.
fn spawn_tls_accept(
    stream: TcpStream,
    ip: String,
    acceptor: TlsAcceptor,
    ids: Arc<ClientIdAllocator>,
    events_tx: mpsc::UnboundedSender<Event>,
) {
    tokio::spawn(async move {
        match acceptor.accept(stream).await {
            Ok(tls_stream) => announce(Box::new(tls_stream), ip, true, &ids, &events_tx),
            Err(e) => warn!(ip = %ip, error = %e, "TLS handshake failed"),
        }
    });
}

fn announce(
    stream: Box<dyn IoStream>,
    ip: String,
    tls: bool,
    ids: &ClientIdAllocator,
    events_tx: &mpsc::UnboundedSender<Event>,
) {
    let (handle, queue) = send_queue();
    let _ = events_tx.send(Event::NewClient(NewClient {
        id: ids.next(),
        handle,
        io: Some((stream, queue)),
        host: ip.clone(),
        ip,
        tls,
        link: None,
    }));
}
