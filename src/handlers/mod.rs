//! Command handling for local connections, split by promotion state:
//! [`registration`] covers pre-registration clients (both promotion
//! paths), [`user`] covers registered local users. Server links are
//! handled in [`crate::sync`].
//!
//! This module carries the delivery helpers everything else leans on.

pub mod registration;
pub mod user;

use mesh_proto::Message;

use crate::daemon::Daemon;
use crate::state::ClientId;

impl Daemon {
    /// Enqueue a message to one local connection, whatever its state.
    pub(crate) fn send_to(&mut self, id: ClientId, msg: Message) {
        if let Some(conn) = self.net.conn_mut(id) {
            conn.send(msg);
        }
    }

    /// Send a numeric reply to a local connection. The recipient's nick is
    /// inserted as the first parameter, `*` before registration.
    pub(crate) fn send_numeric(&mut self, id: ClientId, code: &str, params: &[&str]) {
        let nick = if let Some(lu) = self.net.local_users.get(&id) {
            self.net
                .users
                .get(&lu.uid)
                .map(|u| u.nick.clone())
                .unwrap_or_else(|| "*".to_string())
        } else if let Some(client) = self.net.clients.get(&id) {
            client.nick.clone().unwrap_or_else(|| "*".to_string())
        } else {
            "*".to_string()
        };

        let mut full = vec![nick];
        full.extend(params.iter().map(|s| s.to_string()));
        let msg = Message::new(code, full).with_prefix(self.net.name.clone());
        self.send_to(id, msg);
    }

    /// Server-notice fan-out to every local operator.
    pub(crate) fn oper_notice(&mut self, text: &str) {
        self.notice_opers(text, false);
    }

    /// Notice to local operators carrying umode `C` (client-connect
    /// notices).
    pub(crate) fn conn_notice(&mut self, text: &str) {
        self.notice_opers(text, true);
    }

    fn notice_opers(&mut self, text: &str, require_conn_mode: bool) {
        let targets: Vec<(ClientId, String)> = self
            .net
            .opers
            .iter()
            .filter_map(|uid| self.net.users.get(uid))
            .filter(|u| !require_conn_mode || u.modes.conn_notices)
            .filter_map(|u| u.local.map(|id| (id, u.nick.clone())))
            .collect();

        for (id, nick) in targets {
            let line = format!("*** Notice -- {text}");
            let msg = Message::new("NOTICE", [nick.as_str(), line.as_str()])
                .with_prefix(self.net.name.clone());
            self.send_to(id, msg);
        }
    }

    /// Enqueue a message to every server link except the ingress
    /// (split-horizon). Pass `None` for self-originated traffic.
    pub(crate) fn propagate(&mut self, ingress: Option<ClientId>, msg: &Message) {
        for id in self.net.local_server_ids() {
            if Some(id) == ingress {
                continue;
            }
            self.send_to(id, msg.clone());
        }
    }

    /// Deliver a channel PRIVMSG/NOTICE: every local member hears it, and
    /// each peer link carrying remote members gets exactly one copy.
    pub(crate) fn route_channel_message(
        &mut self,
        key: &str,
        command: &str,
        text: &str,
        source_uid: &str,
        ingress: Option<ClientId>,
        skip_local: Option<ClientId>,
    ) {
        let Some(channel) = self.net.channels.get(key) else {
            return;
        };
        let display = channel.name.clone();

        let mut local_targets = Vec::new();
        let mut remote_links = Vec::new();
        for member in &channel.members {
            let Some(user) = self.net.users.get(member) else {
                continue;
            };
            if let Some(local) = user.local {
                if Some(local) != skip_local {
                    local_targets.push(local);
                }
            } else if let Some(link) = user.link {
                if Some(link) != ingress && !remote_links.contains(&link) {
                    remote_links.push(link);
                }
            }
        }

        let source_mask = self.display_source(source_uid);
        for target in local_targets {
            let msg = Message::new(command, [display.as_str(), text])
                .with_prefix(source_mask.clone());
            self.send_to(target, msg);
        }
        for link in remote_links {
            let msg = Message::new(command, [display.as_str(), text])
                .with_prefix(source_uid.to_string());
            self.send_to(link, msg);
        }
    }

    /// How a message source should read on a client connection: the
    /// nickmask for a UID, the server name for a SID, the raw prefix
    /// otherwise.
    pub(crate) fn display_source(&self, prefix: &str) -> String {
        if let Some(user) = self.net.users.get(prefix) {
            return user.nickmask();
        }
        if let Some(server) = self.net.servers.get(prefix) {
            return server.name.clone();
        }
        prefix.to_string()
    }
}
