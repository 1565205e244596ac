//! The event loop: sole owner and sole mutator of network state.
//!
//! Five kinds of event arrive on one queue (new connection, message,
//! dead connection, one-second tick, rehash) and are applied serially.
//! Handlers never block; they mutate state and enqueue outbound messages
//! through per-connection [`SendHandle`](crate::event::SendHandle)s.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mesh_proto::Message;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::{validate, Config};
use crate::event::{Event, NewClient};
use crate::flood::QUEUE_LIMIT;
use crate::state::{ClientId, ClientIdAllocator, Conn, KLine, LocalClient, Network, UidGenerator};

pub const VERSION: &str = concat!("meshircd-", env!("CARGO_PKG_VERSION"));

pub struct Daemon {
    pub net: Network,
    pub conf: Config,
    pub config_path: String,
    /// MOTD lines, re-read on rehash.
    pub motd: Option<Vec<String>>,
    pub uids: UidGenerator,
    pub ids: Arc<ClientIdAllocator>,
    /// Cloned into I/O and dial tasks spawned from the loop.
    pub events_tx: mpsc::UnboundedSender<Event>,
    /// Human-readable start time, for the welcome burst.
    pub started: String,
    /// Last outbound attempt per configured link name.
    last_link_attempt: HashMap<String, Instant>,
}

impl Daemon {
    pub fn new(
        conf: Config,
        config_path: String,
        ids: Arc<ClientIdAllocator>,
        events_tx: mpsc::UnboundedSender<Event>,
    ) -> Self {
        let net = Network::new(
            conf.server.sid.clone(),
            conf.server.name.clone(),
            conf.server.description.clone(),
        );
        let motd = conf.load_motd();
        Self {
            uids: UidGenerator::new(conf.server.sid.clone()),
            net,
            motd,
            conf,
            config_path,
            ids,
            events_tx,
            started: chrono::Utc::now().to_rfc2822(),
            last_link_attempt: HashMap::new(),
        }
    }

    /// Run until the event queue closes or shutdown is signalled.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<Event>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(server = %self.net.name, sid = %self.net.sid, "Event loop running");
        loop {
            tokio::select! {
                maybe = events.recv() => match maybe {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                _ = shutdown.changed() => {
                    self.shutdown();
                    break;
                }
            }
        }
    }

    /// Apply one event. Synchronous by design: every state change the
    /// daemon ever makes goes through here, one event at a time.
    pub fn handle_event(&mut self, event: Event) {
        match event {
            Event::NewClient(nc) => self.register_connection(nc),
            Event::Message(id, msg) => self.handle_message(id, msg),
            Event::Dead(id) => self.handle_dead(id),
            Event::Tick => self.tick(),
            Event::Rehash => self.rehash(),
        }
    }

    fn register_connection(&mut self, nc: NewClient) {
        let NewClient {
            id,
            handle,
            io,
            host,
            ip,
            tls,
            link,
        } = nc;

        let conn = Conn::new(id, handle, host, ip, tls);
        debug!(client = id, host = %conn.host, tls, "New connection");
        self.net
            .clients
            .insert(id, LocalClient::new(conn, link.clone()));

        if let Some((stream, queue)) = io {
            crate::network::conn::spawn_io(stream, id, queue, self.events_tx.clone());
        }

        // We dialed this link: open the handshake.
        if let Some(link_name) = link {
            let Some(block) = self.conf.links.iter().find(|l| l.name == link_name).cloned()
            else {
                warn!(link = %link_name, "Dialed link vanished from config");
                self.net.clients.remove(&id);
                return;
            };
            self.send_link_credentials(id, &block.password);
        }
    }

    fn handle_message(&mut self, id: ClientId, msg: Message) {
        match self.net.conn_mut(id) {
            Some(conn) => conn.touch(),
            None => return, // raced with removal
        }

        if self.net.clients.contains_key(&id) {
            self.preclient_message(id, msg);
        } else if self.net.local_users.contains_key(&id) {
            self.local_user_inbound(id, msg);
        } else if self.net.local_servers.contains_key(&id) {
            self.server_message(id, msg);
        }
    }

    /// Flood gate for local users: messages are handled while tokens
    /// remain and queue behind any backlog otherwise, so promotion to the
    /// queue never reorders traffic.
    fn local_user_inbound(&mut self, id: ClientId, msg: Message) {
        let (exempt, immediate) = match self.net.local_users.get(&id) {
            Some(lu) => (
                lu.flood_exempt,
                lu.bucket.has_tokens() && lu.queue.is_empty(),
            ),
            None => return,
        };

        if exempt || immediate {
            self.user_message(id, msg);
            if !exempt {
                if let Some(lu) = self.net.local_users.get_mut(&id) {
                    lu.bucket.consume();
                }
            }
            return;
        }

        let (len, oper) = {
            let lu = self.net.local_users.get_mut(&id).expect("checked above");
            lu.queue.push_back(msg);
            let oper = self.net.opers.contains(&lu.uid);
            (lu.queue.len(), oper)
        };
        if len >= QUEUE_LIMIT && !oper {
            self.disconnect_local_user(id, "Excess flood", true);
        }
    }

    fn handle_dead(&mut self, id: ClientId) {
        if self.net.clients.remove(&id).is_some() {
            debug!(client = id, "Unregistered connection closed");
        } else if self.net.local_users.contains_key(&id) {
            self.disconnect_local_user(id, "Connection closed", true);
        } else if self.net.local_servers.contains_key(&id) {
            self.drop_server_link(id, "Connection closed", None);
        }
    }

    /// Remove a local user. `propagate_quit` is false when a KILL already
    /// told the mesh.
    pub(crate) fn disconnect_local_user(
        &mut self,
        id: ClientId,
        reason: &str,
        propagate_quit: bool,
    ) {
        let Some(uid) = self.net.local_users.get(&id).map(|lu| lu.uid.clone()) else {
            return;
        };
        let Some(mask) = self.net.users.get(&uid).map(|u| u.nickmask()) else {
            self.net.local_users.remove(&id);
            return;
        };

        self.send_to(
            id,
            Message::new("ERROR", [format!("Closing Link: {reason}")]),
        );

        let quit = Message::new("QUIT", [reason]).with_prefix(mask);
        for observer in self.net.shared_channel_local_ids(&uid) {
            self.send_to(observer, quit.clone());
        }

        if propagate_quit {
            let wire = Message::new("QUIT", [reason]).with_prefix(uid.clone());
            self.propagate(None, &wire);
        }

        self.net.remove_user_entry(&uid);
        self.net.local_users.remove(&id);
        info!(uid = %uid, reason, "Local user disconnected");
    }

    // ------------------------------------------------------------------
    // K-lines
    // ------------------------------------------------------------------

    /// Record a K-line (deduplicated by mask pair) and disconnect every
    /// matching local user.
    pub(crate) fn add_kline(&mut self, kline: KLine, source: &str) {
        if self
            .net
            .klines
            .iter()
            .any(|k| k.same_mask(&kline.user, &kline.host))
        {
            return;
        }
        self.oper_notice(&format!(
            "K-line added for {}@{} by {} ({})",
            kline.user, kline.host, source, kline.reason
        ));
        self.net.klines.push(kline.clone());

        let matching: Vec<ClientId> = self
            .net
            .local_users
            .values()
            .filter_map(|lu| self.net.users.get(&lu.uid))
            .filter(|u| kline.matches(&u.username, &u.host))
            .filter_map(|u| u.local)
            .collect();
        for id in matching {
            self.disconnect_local_user(id, &format!("K-lined: {}", kline.reason), true);
        }
    }

    pub(crate) fn remove_kline(&mut self, user: &str, host: &str, source: &str) {
        let before = self.net.klines.len();
        self.net.klines.retain(|k| !k.same_mask(user, host));
        if self.net.klines.len() < before {
            self.oper_notice(&format!("K-line for {user}@{host} removed by {source}"));
        }
    }

    // ------------------------------------------------------------------
    // Tick
    // ------------------------------------------------------------------

    fn tick(&mut self) {
        self.check_and_ping_clients();
        self.connect_to_servers();
        self.flood_control();
    }

    fn check_and_ping_clients(&mut self) {
        let ping = Duration::from_secs(self.conf.timeouts.ping_time);
        let dead = Duration::from_secs(self.conf.timeouts.dead_time);

        // Registration deadline for pre-registration connections.
        let stale: Vec<ClientId> = self
            .net
            .clients
            .values()
            .filter(|c| c.created.elapsed() > ping)
            .map(|c| c.conn.id)
            .collect();
        for id in stale {
            self.fail_registration(id, "Registration timed out");
        }

        // Send-queue overflow is checked here rather than on enqueue so a
        // burst in progress cannot kill its own link mid-write.
        let overflowing: Vec<ClientId> = self
            .net
            .clients
            .values()
            .map(|c| &c.conn)
            .chain(self.net.local_users.values().map(|u| &u.conn))
            .chain(self.net.local_servers.values().map(|s| &s.conn))
            .filter(|conn| conn.sendq_exceeded || conn.handle.depth() > conn.sendq_limit)
            .map(|conn| conn.id)
            .collect();
        for id in overflowing {
            warn!(client = id, "Send queue exceeded");
            if self.net.clients.remove(&id).is_some() {
                continue;
            }
            if self.net.local_users.contains_key(&id) {
                self.disconnect_local_user(id, "SendQ exceeded", true);
            } else if self.net.local_servers.contains_key(&id) {
                self.drop_server_link(id, "SendQ exceeded", None);
            }
        }

        // Local users: ping the quiet, drop the silent.
        let users: Vec<(ClientId, Duration, bool)> = self
            .net
            .local_users
            .values()
            .map(|u| (u.conn.id, u.conn.last_activity.elapsed(), u.conn.ping_sent))
            .collect();
        for (id, idle, ping_sent) in users {
            if idle > dead {
                self.disconnect_local_user(id, "Ping timeout", true);
            } else if idle > ping && !ping_sent {
                let msg = Message::new("PING", [self.net.name.clone()])
                    .with_prefix(self.net.name.clone());
                self.send_to(id, msg);
                if let Some(lu) = self.net.local_users.get_mut(&id) {
                    lu.conn.ping_sent = true;
                }
            }
        }

        // Server links: burst deadline, then the same idle policy.
        let servers: Vec<(ClientId, String, Duration, bool, bool, Duration)> = self
            .net
            .local_servers
            .values()
            .map(|s| {
                (
                    s.conn.id,
                    s.sid.clone(),
                    s.conn.last_activity.elapsed(),
                    s.conn.ping_sent,
                    s.bursting,
                    s.burst_started.elapsed(),
                )
            })
            .collect();
        for (id, sid, idle, ping_sent, bursting, burst_age) in servers {
            if bursting && burst_age > ping {
                self.drop_server_link(id, "Bursting too long", Some("Bursting too long"));
            } else if idle > dead {
                self.drop_server_link(id, "Ping timeout", None);
            } else if idle > ping && !ping_sent {
                let msg = Message::new("PING", [self.net.name.clone(), sid])
                    .with_prefix(self.net.sid.clone());
                self.send_to(id, msg);
                if let Some(ls) = self.net.local_servers.get_mut(&id) {
                    ls.conn.ping_sent = true;
                }
            }
        }
    }

    fn connect_to_servers(&mut self) {
        let retry = Duration::from_secs(self.conf.timeouts.connect_attempt_time);
        let candidates: Vec<_> = self
            .conf
            .links
            .iter()
            .filter(|l| l.autoconnect)
            .cloned()
            .collect();

        for link in candidates {
            let connected = self.net.local_servers.values().any(|s| s.name == link.name)
                || self
                    .net
                    .clients
                    .values()
                    .any(|c| c.link.as_deref() == Some(link.name.as_str()));
            if connected {
                continue;
            }
            let due = self
                .last_link_attempt
                .get(&link.name)
                .map(|at| at.elapsed() >= retry)
                .unwrap_or(true);
            if !due {
                continue;
            }
            self.last_link_attempt
                .insert(link.name.clone(), Instant::now());
            crate::network::dial::spawn_dial(link, self.ids.clone(), self.events_tx.clone());
        }
    }

    /// Refill one token per user, then drain each backlog in order while
    /// tokens remain.
    fn flood_control(&mut self) {
        let ids: Vec<ClientId> = self.net.local_users.keys().copied().collect();
        for id in ids {
            if let Some(lu) = self.net.local_users.get_mut(&id) {
                lu.bucket.refill();
            }
            loop {
                let next = match self.net.local_users.get_mut(&id) {
                    Some(lu) if lu.bucket.has_tokens() => lu.queue.pop_front(),
                    _ => None,
                };
                let Some(msg) = next else { break };
                self.user_message(id, msg);
                if let Some(lu) = self.net.local_users.get_mut(&id) {
                    lu.bucket.consume();
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Rehash and shutdown
    // ------------------------------------------------------------------

    pub(crate) fn rehash(&mut self) {
        info!(path = %self.config_path, "Rehashing configuration");
        match Config::load(&self.config_path) {
            Ok(new) => {
                if let Err(errors) = validate(&new) {
                    for err in &errors {
                        error!(error = %err, "Rehash validation failed");
                    }
                    self.oper_notice("Rehash failed: configuration invalid");
                    return;
                }
                self.conf.rehash_from(new);
                self.motd = self.conf.load_motd();
                self.oper_notice("Rehash complete");
            }
            Err(e) => {
                error!(error = %e, "Rehash failed");
                self.oper_notice("Rehash failed: cannot read configuration");
            }
        }
    }

    fn shutdown(&mut self) {
        info!("Shutting down");
        let goodbye = Message::new("ERROR", ["Server shutting down"]);

        let ids: Vec<ClientId> = self
            .net
            .clients
            .keys()
            .chain(self.net.local_users.keys())
            .chain(self.net.local_servers.keys())
            .copied()
            .collect();
        for id in ids {
            self.send_to(id, goodbye.clone());
        }

        // Dropping the records closes every outbound queue; write tasks
        // drain the goodbye and exit.
        self.net.clients.clear();
        self.net.local_users.clear();
        self.net.local_servers.clear();
    }
}
