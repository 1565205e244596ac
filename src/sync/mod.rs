//! The server-to-server protocol engine.
//!
//! Every message from a registered link lands in [`Daemon::server_message`]:
//! the missing prefix is filled in with the peer's SID, the command is
//! dispatched, and on success the handler has already propagated the
//! message to every other link (split-horizon). A [`LinkError`] is fatal:
//! the peer gets a closing `ERROR`, split cleanup runs, and the rest of
//! the mesh hears an SQUIT.
//!
//! Submodules: [`users`] (UID/NICK/QUIT/KILL and friends), [`channels`]
//! (SJOIN/JOIN/PART/TB/TOPIC/INVITE), [`burst`] (the post-handshake state
//! dump), [`split`] (losing a subtree).

pub mod burst;
pub mod channels;
pub mod split;
#[cfg(test)]
mod tests;
pub mod users;

use mesh_proto::response::*;
use mesh_proto::valid::is_valid_sid;
use mesh_proto::Message;
use tracing::{debug, info, warn};

use crate::daemon::Daemon;
use crate::error::LinkError;
use crate::state::{ClientId, KLine, Server};

impl Daemon {
    pub(crate) fn server_message(&mut self, id: ClientId, mut msg: Message) {
        let Some(peer_sid) = self.net.local_servers.get(&id).map(|s| s.sid.clone()) else {
            return;
        };
        if msg.prefix.is_none() {
            msg.prefix = Some(peer_sid);
        }

        let result = match msg.command_upper().as_str() {
            "PING" => self.s_ping(id, &msg),
            "PONG" => self.s_pong(id, &msg),
            "ERROR" => self.s_error(id, &msg),
            "SID" => self.s_sid(id, &msg),
            "UID" => self.s_uid(id, &msg),
            "NICK" => self.s_nick(id, &msg),
            "QUIT" => self.s_quit(id, &msg),
            "KILL" => self.s_kill(id, &msg),
            "MODE" => self.s_mode(id, &msg),
            "AWAY" => self.s_away(id, &msg),
            "WHOIS" => self.s_whois(id, &msg),
            "SJOIN" => self.s_sjoin(id, &msg),
            "JOIN" => self.s_join(id, &msg),
            "PART" => self.s_part(id, &msg),
            "TB" => self.s_tb(id, &msg),
            "TOPIC" => self.s_topic(id, &msg),
            "SQUIT" => self.s_squit(id, &msg),
            "ENCAP" => self.s_encap(id, &msg),
            "PRIVMSG" => self.s_privmsg(id, &msg, "PRIVMSG"),
            "NOTICE" => self.s_privmsg(id, &msg, "NOTICE"),
            "WALLOPS" => self.s_wallops(id, &msg, "WALLOPS"),
            "OPERWALL" => self.s_wallops(id, &msg, "OPERWALL"),
            "INVITE" => self.s_invite(id, &msg),
            "CLICONN" => {
                self.propagate(Some(id), &msg);
                Ok(())
            }
            _ if msg.is_numeric() => self.s_numeric(id, &msg),
            other => {
                debug!(command = other, "Unknown server command");
                let src = msg.prefix.clone().unwrap_or_default();
                self.server_numeric(
                    id,
                    ERR_UNKNOWNCOMMAND,
                    &[&src, other, "Unknown command"],
                );
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!(error = %e, "Fatal protocol error on server link");
            let text = e.to_string();
            self.drop_server_link(id, &text, Some(&text));
        }
    }

    /// Numeric addressed to a peer server, prefixed with our SID.
    pub(crate) fn server_numeric(&mut self, id: ClientId, code: &str, params: &[&str]) {
        let msg = Message::new(code, params.iter().map(|s| s.to_string()))
            .with_prefix(self.net.sid.clone());
        self.send_to(id, msg);
    }

    /// Reply 461 and report whether the message had enough parameters.
    fn check_params(&mut self, id: ClientId, msg: &Message, n: usize) -> bool {
        if msg.params.len() >= n {
            return true;
        }
        let src = msg.prefix.clone().unwrap_or_default();
        self.server_numeric(
            id,
            ERR_NEEDMOREPARAMS,
            &[&src, &msg.command, "Not enough parameters"],
        );
        false
    }

    /// Send a message on toward a (possibly remote) server.
    fn forward_to_server(&mut self, sid: &str, msg: &Message) {
        let Some(via) = self.net.servers.get(sid).and_then(|s| s.via) else {
            return;
        };
        self.send_to(via, msg.clone());
    }

    /// Resolve a prefix that must name a known user.
    fn source_user_uid(&self, msg: &Message) -> Result<String, LinkError> {
        let prefix = msg.prefix.as_deref().unwrap_or_default();
        if self.net.users.contains_key(prefix) {
            Ok(prefix.to_string())
        } else {
            Err(LinkError::UnknownSource(prefix.to_string()))
        }
    }

    /// Resolve a prefix that must name a known server, by SID or name.
    fn server_source_sid(&self, msg: &Message) -> Result<String, LinkError> {
        let prefix = msg.prefix.as_deref().unwrap_or_default();
        if self.net.servers.contains_key(prefix) {
            return Ok(prefix.to_string());
        }
        if let Some(server) = self.net.server_by_name(prefix) {
            return Ok(server.sid.clone());
        }
        Err(LinkError::UnknownSource(prefix.to_string()))
    }

    // ------------------------------------------------------------------
    // Liveness and burst completion
    // ------------------------------------------------------------------

    fn s_ping(&mut self, id: ClientId, msg: &Message) -> Result<(), LinkError> {
        if !self.check_params(id, msg, 1) {
            return Ok(());
        }
        let source = msg.prefix.clone().unwrap_or_default();
        let dest = msg.param(1).map(str::to_string);

        let to_us = match &dest {
            None => true,
            Some(d) => d == &self.net.sid || d == &self.net.name,
        };

        if to_us {
            let pong = Message::new("PONG", [self.net.name.clone(), source.clone()])
                .with_prefix(self.net.sid.clone());
            self.send_to(id, pong);

            // A PING sourced by the peer itself is its end-of-burst marker.
            let peer_sid = self.net.local_servers.get(&id).map(|s| s.sid.clone());
            if peer_sid.as_deref() == Some(source.as_str()) {
                if let Some(peer) = self.net.local_servers.get_mut(&id) {
                    if peer.bursting {
                        peer.got_ping = true;
                    }
                }
                self.maybe_burst_over(id);
            }
            return Ok(());
        }

        let dest = dest.expect("checked above");
        if self.net.servers.contains_key(&dest) {
            self.forward_to_server(&dest, msg);
        } else {
            self.server_numeric(id, ERR_NOSUCHSERVER, &[&source, &dest, "No such server"]);
        }
        Ok(())
    }

    fn s_pong(&mut self, id: ClientId, msg: &Message) -> Result<(), LinkError> {
        if !self.check_params(id, msg, 2) {
            return Ok(());
        }
        self.server_source_sid(msg)?;
        let dest = msg.param(1).unwrap_or_default().to_string();

        if dest == self.net.sid || dest == self.net.name {
            if let Some(peer) = self.net.local_servers.get_mut(&id) {
                if peer.bursting {
                    peer.got_pong = true;
                }
            }
            self.maybe_burst_over(id);
            return Ok(());
        }

        if self.net.servers.contains_key(&dest) {
            self.forward_to_server(&dest, msg);
        } else {
            debug!(dest = %dest, "Dropping PONG for unknown destination");
        }
        Ok(())
    }

    pub(crate) fn maybe_burst_over(&mut self, id: ClientId) {
        let Some(peer) = self.net.local_servers.get_mut(&id) else {
            return;
        };
        if peer.bursting && peer.got_ping && peer.got_pong {
            peer.bursting = false;
            let name = peer.name.clone();
            info!(peer = %name, "Burst complete");
            self.oper_notice(&format!("Burst with {name} over"));
        }
    }

    fn s_error(&mut self, id: ClientId, msg: &Message) -> Result<(), LinkError> {
        let text = msg.param(0).unwrap_or("");
        let name = self
            .net
            .local_servers
            .get(&id)
            .map(|s| s.name.clone())
            .unwrap_or_default();
        warn!(peer = %name, error = %text, "ERROR from peer");
        self.drop_server_link(id, "Bye", None);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Topology
    // ------------------------------------------------------------------

    fn s_sid(&mut self, id: ClientId, msg: &Message) -> Result<(), LinkError> {
        if !self.check_params(id, msg, 4) {
            return Ok(());
        }
        let origin = self.server_source_sid(msg)?;
        let name = msg.params[0].clone();
        let hops: u32 = msg.params[1]
            .parse()
            .map_err(|_| LinkError::Violation(format!("Bad hop count {}", msg.params[1])))?;
        let sid = msg.params[2].clone();
        let desc = msg.params[3].clone();

        if !is_valid_sid(&sid) {
            return Err(LinkError::InvalidId(sid));
        }
        if let Some(known) = self.net.servers.get(&sid) {
            if known.name == name {
                return Ok(()); // duplicate introduction
            }
            return Err(LinkError::SidClash(sid));
        }

        let origin_name = self
            .net
            .servers
            .get(&origin)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| origin.clone());

        self.net.servers.insert(
            sid.clone(),
            Server {
                sid: sid.clone(),
                name: name.clone(),
                desc,
                hops,
                link_to: Some(origin),
                via: Some(id),
                capabs: Default::default(),
                gcap_seen: false,
                local: None,
            },
        );

        info!(name = %name, sid = %sid, via = %origin_name, "Server introduced");
        self.oper_notice(&format!("Server {name} ({sid}) introduced via {origin_name}"));
        self.propagate(Some(id), msg);
        Ok(())
    }

    fn s_squit(&mut self, id: ClientId, msg: &Message) -> Result<(), LinkError> {
        if !self.check_params(id, msg, 1) {
            return Ok(());
        }
        let target = msg.params[0].clone();
        let comment = msg.param(1).unwrap_or("").to_string();

        if target == self.net.sid {
            return Err(LinkError::BadSquit(target));
        }
        let Some(server) = self.net.servers.get(&target) else {
            debug!(target = %target, "SQUIT for unknown server");
            return Ok(());
        };
        if server.is_local() {
            // Remote servers may not sever our own links.
            return Err(LinkError::BadSquit(target));
        }

        let lost_name = server.name.clone();
        let upstream_name = server
            .link_to
            .as_ref()
            .and_then(|up| self.net.servers.get(up))
            .map(|s| s.name.clone())
            .unwrap_or_else(|| self.net.name.clone());

        self.split_server(&target, &upstream_name, &lost_name);
        self.propagate(Some(id), msg);
        self.oper_notice(&format!("Server {lost_name} split: {comment}"));
        Ok(())
    }

    // ------------------------------------------------------------------
    // ENCAP
    // ------------------------------------------------------------------

    fn s_encap(&mut self, id: ClientId, msg: &Message) -> Result<(), LinkError> {
        if !self.check_params(id, msg, 2) {
            return Ok(());
        }
        // ENCAP always travels the whole mesh, whatever the sub-command.
        self.propagate(Some(id), msg);

        match msg.params[1].to_ascii_uppercase().as_str() {
            "KLINE" => self.encap_kline(msg),
            "UNKLINE" => self.encap_unkline(msg),
            "GCAP" => self.encap_gcap(msg),
            other => {
                debug!(sub = other, "Unhandled ENCAP sub-command");
                Ok(())
            }
        }
    }

    /// `ENCAP <mask> KLINE <duration> <user> <host> [reason]` - the
    /// duration is ignored; runtime K-lines are permanent.
    fn encap_kline(&mut self, msg: &Message) -> Result<(), LinkError> {
        let (Some(user), Some(host)) = (msg.param(3), msg.param(4)) else {
            return Ok(());
        };
        let reason = msg.param(5).unwrap_or("K-lined").to_string();
        let source = self.display_source(msg.prefix.as_deref().unwrap_or_default());
        self.add_kline(
            KLine {
                user: user.to_string(),
                host: host.to_string(),
                reason,
            },
            &source,
        );
        Ok(())
    }

    fn encap_unkline(&mut self, msg: &Message) -> Result<(), LinkError> {
        let (Some(user), Some(host)) = (msg.param(2), msg.param(3)) else {
            return Ok(());
        };
        let user = user.to_string();
        let host = host.to_string();
        let source = self.display_source(msg.prefix.as_deref().unwrap_or_default());
        self.remove_kline(&user, &host, &source);
        Ok(())
    }

    /// `:<sid> ENCAP * GCAP :<capabs>` describes the prefixed server's
    /// capability set, exactly once per server.
    fn encap_gcap(&mut self, msg: &Message) -> Result<(), LinkError> {
        let sid = self.server_source_sid(msg)?;
        let caps: std::collections::HashSet<String> = msg
            .param(2)
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_string)
            .collect();

        let server = self
            .net
            .servers
            .get_mut(&sid)
            .ok_or_else(|| LinkError::UnknownSource(sid.clone()))?;
        if server.gcap_seen {
            return Err(LinkError::DuplicateGcap(sid));
        }
        for required in crate::state::network::REQUIRED_CAPABS {
            if !caps.contains(required) {
                return Err(LinkError::MissingCapab(required.to_string()));
            }
        }
        server.capabs = caps;
        server.gcap_seen = true;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Broadcast chatter
    // ------------------------------------------------------------------

    fn s_wallops(&mut self, id: ClientId, msg: &Message, command: &str) -> Result<(), LinkError> {
        if !self.check_params(id, msg, 1) {
            return Ok(());
        }
        let text = msg.params[msg.params.len() - 1].clone();
        let source = self.display_source(msg.prefix.as_deref().unwrap_or_default());
        self.deliver_wallops(&source, command, &text);
        self.propagate(Some(id), msg);
        Ok(())
    }

    /// Numerics transit the mesh addressed to a UID; the hop that owns the
    /// user rewrites the target to the nick and delivers.
    fn s_numeric(&mut self, id: ClientId, msg: &Message) -> Result<(), LinkError> {
        let Some(target) = msg.param(0) else {
            return Ok(());
        };
        let Some(user) = self.net.users.get(target) else {
            debug!(target = %target, numeric = %msg.command, "Dropping numeric for unknown target");
            return Ok(());
        };

        if let Some(local) = user.local {
            let nick = user.nick.clone();
            let source = self.display_source(msg.prefix.as_deref().unwrap_or_default());
            let mut params = msg.params.clone();
            params[0] = nick;
            let deliver = Message::new(msg.command.clone(), params).with_prefix(source);
            self.send_to(local, deliver);
        } else if let Some(link) = user.link {
            if link != id {
                self.send_to(link, msg.clone());
            }
        }
        Ok(())
    }
}
