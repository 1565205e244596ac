//! Local connections and their promotion states.
//!
//! Every accepted or dialed connection starts as a [`LocalClient`]. On
//! successful registration its id migrates to exactly one of the user or
//! server maps; the shared [`Conn`] record moves with it.

use std::collections::{HashSet, VecDeque};
use std::time::Instant;

use mesh_proto::Message;

use crate::event::SendHandle;
use crate::flood::TokenBucket;
use crate::state::ClientId;

/// The connection-level record shared by all promotion states.
#[derive(Debug)]
pub struct Conn {
    pub id: ClientId,
    pub handle: SendHandle,
    pub host: String,
    pub ip: String,
    pub tls: bool,
    pub last_activity: Instant,
    /// Set while a liveness PING is outstanding.
    pub ping_sent: bool,
    /// Outbound queue depth beyond which the next tick drops us.
    pub sendq_limit: usize,
    pub sendq_exceeded: bool,
}

impl Conn {
    pub fn new(id: ClientId, handle: SendHandle, host: String, ip: String, tls: bool) -> Self {
        Self {
            id,
            handle,
            host,
            ip,
            tls,
            last_activity: Instant::now(),
            ping_sent: false,
            sendq_limit: crate::config::DEFAULT_SENDQ,
            sendq_exceeded: false,
        }
    }

    /// Enqueue one outbound message, flagging the connection when its
    /// queue depth passes the limit.
    pub fn send(&mut self, msg: Message) {
        if self.handle.send(msg) > self.sendq_limit {
            self.sendq_exceeded = true;
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.ping_sent = false;
    }
}

/// A connection that has not yet registered as a user or a server.
#[derive(Debug)]
pub struct LocalClient {
    pub conn: Conn,
    pub created: Instant,

    // User path accumulation.
    pub nick: Option<String>,
    pub user: Option<(String, String)>,

    // Server path accumulation.
    pub pass: Option<(String, String)>,
    pub capabs: HashSet<String>,
    pub server_announced: Option<(String, String)>,
    /// We have sent our own PASS/CAPAB/SERVER (+SVINFO on the inbound
    /// side) to this peer.
    pub sent_credentials: bool,

    /// Name of the configured link we dialed, for outbound connections.
    pub link: Option<String>,
}

impl LocalClient {
    pub fn new(conn: Conn, link: Option<String>) -> Self {
        Self {
            conn,
            created: Instant::now(),
            nick: None,
            user: None,
            pass: None,
            capabs: HashSet::new(),
            server_announced: None,
            sent_credentials: false,
            link,
        }
    }
}

/// A registered local user's connection.
#[derive(Debug)]
pub struct LocalUser {
    pub conn: Conn,
    pub uid: String,
    pub bucket: TokenBucket,
    /// Messages deferred while the bucket was empty, in arrival order.
    pub queue: VecDeque<Message>,
    pub flood_exempt: bool,
}

/// A registered server link.
#[derive(Debug)]
pub struct LocalServer {
    pub conn: Conn,
    pub sid: String,
    pub name: String,
    /// True from promotion until the PING/PONG pair completes.
    pub bursting: bool,
    pub got_ping: bool,
    pub got_pong: bool,
    /// When the burst started, for the bursting-too-long check.
    pub burst_started: Instant,
    pub capabs: HashSet<String>,
}

impl LocalServer {
    pub fn has_capab(&self, capab: &str) -> bool {
        self.capabs.contains(capab)
    }
}
