//! Servers: ourselves, direct peers, and everything behind them.

use std::collections::HashSet;

use crate::state::ClientId;

/// One server on the mesh, local or remote.
#[derive(Debug, Clone)]
pub struct Server {
    pub sid: String,
    pub name: String,
    pub desc: String,
    /// Hops from us; 0 for ourselves, 1 for direct peers.
    pub hops: u32,
    /// SID of the neighbor this server was learned through; `None` for us.
    /// Following `link_to` chains always terminates at a direct peer or
    /// at ourselves.
    pub link_to: Option<String>,
    /// The directly linked peer connection through which traffic for this
    /// server is sent; `None` for ourselves.
    pub via: Option<ClientId>,
    pub capabs: HashSet<String>,
    /// A server may describe its capabilities (ENCAP GCAP) only once.
    pub gcap_seen: bool,
    /// Back-pointer into the local-server map when directly linked.
    pub local: Option<ClientId>,
}

impl Server {
    pub fn is_local(&self) -> bool {
        self.local.is_some()
    }
}
