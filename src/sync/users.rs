//! Server-to-server user lifecycle: introduction, renames, removal,
//! kills, modes, and user-targeted traffic.
//!
//! Nick conflicts are settled by nick timestamp: the older nick survives,
//! the newer is killed, and on a tie both die. That asymmetry (lower
//! timestamp wins) is what makes the mesh converge after a split heals.

use mesh_proto::response::*;
use mesh_proto::valid::{is_valid_nick, is_valid_uid};
use mesh_proto::{irc_to_lower, Message};
use tracing::{debug, info};

use crate::daemon::Daemon;
use crate::error::LinkError;
use crate::state::{ClientId, User, UserModes};

/// What the timestamp comparison says to do with a colliding pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collision {
    /// The incumbent dies, the newcomer wins.
    ExistingLoses,
    /// Equal timestamps: both die.
    BothLose,
    /// The newcomer dies, the incumbent stays.
    IncomingLoses,
}

/// Resolve a nick collision from the timestamps alone.
pub fn resolve_collision(incoming_ts: i64, existing_ts: i64) -> Collision {
    match incoming_ts.cmp(&existing_ts) {
        std::cmp::Ordering::Less => Collision::ExistingLoses,
        std::cmp::Ordering::Equal => Collision::BothLose,
        std::cmp::Ordering::Greater => Collision::IncomingLoses,
    }
}

impl Daemon {
    /// `:<sid> UID <nick> <hops> <nickTS> <umodes> <user> <host> <ip>
    /// <uid> <real>`
    pub(crate) fn s_uid(&mut self, id: ClientId, msg: &Message) -> Result<(), LinkError> {
        if !self.check_params(id, msg, 9) {
            return Ok(());
        }
        let source_sid = {
            let prefix = msg.prefix.as_deref().unwrap_or_default();
            if !self.net.servers.contains_key(prefix) {
                return Err(LinkError::UnknownSource(prefix.to_string()));
            }
            prefix.to_string()
        };

        let nick = msg.params[0].clone();
        let hops: u32 = msg.params[1].parse().unwrap_or(1);
        let nick_ts: i64 = msg.params[2]
            .parse()
            .map_err(|_| LinkError::Violation(format!("Bad nick TS {}", msg.params[2])))?;
        let modes = UserModes::parse(&msg.params[3]);
        let username = msg.params[4].clone();
        let host = msg.params[5].clone();
        let ip = msg.params[6].clone();
        let uid = msg.params[7].clone();
        let realname = msg.params[8].clone();

        if !is_valid_uid(&uid) || !uid.starts_with(&source_sid) {
            return Err(LinkError::InvalidId(uid));
        }
        if !is_valid_nick(&nick, usize::MAX) {
            return Err(LinkError::InvalidId(nick));
        }
        if self.net.users.contains_key(&uid) {
            return Ok(()); // duplicate introduction
        }

        // Collision with whoever holds this nick now.
        if let Some(existing_uid) = self.net.nicks.get(&irc_to_lower(&nick)).cloned() {
            let existing_ts = self.net.users[&existing_uid].nick_ts;
            match resolve_collision(nick_ts, existing_ts) {
                Collision::ExistingLoses => {
                    self.issue_kill(&existing_uid, "Nick collision");
                }
                Collision::BothLose => {
                    // The losing UID is not propagated; only the kills
                    // travel.
                    info!(nick = %nick, "Nick collision, both killed");
                    self.issue_kill(&existing_uid, "Nick collision, both killed");
                    self.broadcast_kill(&uid, "Nick collision, both killed");
                    return Ok(());
                }
                Collision::IncomingLoses => {
                    self.broadcast_kill(&uid, "Nick collision");
                    return Ok(());
                }
            }
        }

        let bursting = self
            .net
            .local_servers
            .get(&id)
            .map(|s| s.bursting)
            .unwrap_or(false);

        let oper = modes.oper;
        self.net.nicks.insert(irc_to_lower(&nick), uid.clone());
        self.net.users.insert(
            uid.clone(),
            User {
                uid: uid.clone(),
                nick: nick.clone(),
                nick_ts,
                hops,
                username: username.clone(),
                host: host.clone(),
                ip: ip.clone(),
                realname,
                modes,
                away: None,
                channels: Default::default(),
                sid: source_sid.clone(),
                link: Some(id),
                local: None,
                tls: false,
                signon_ts: nick_ts,
            },
        );
        if oper {
            self.net.opers.insert(uid.clone());
        }

        if !bursting {
            let server_name = self
                .net
                .servers
                .get(&source_sid)
                .map(|s| s.name.clone())
                .unwrap_or(source_sid);
            self.conn_notice(&format!(
                "Client connecting: {nick} ({username}@{host}) [{ip}] on {server_name}"
            ));
        }

        self.propagate(Some(id), msg);
        Ok(())
    }

    /// `:<uid> NICK <new> <nickTS>`
    pub(crate) fn s_nick(&mut self, id: ClientId, msg: &Message) -> Result<(), LinkError> {
        if !self.check_params(id, msg, 2) {
            return Ok(());
        }
        let uid = self.source_user_uid(msg)?;
        let new = msg.params[0].clone();
        let nick_ts: i64 = msg.params[1]
            .parse()
            .map_err(|_| LinkError::Violation(format!("Bad nick TS {}", msg.params[1])))?;

        let old_fold = irc_to_lower(&self.net.users[&uid].nick);
        let new_fold = irc_to_lower(&new);

        if new_fold != old_fold {
            if let Some(existing_uid) = self.net.nicks.get(&new_fold).cloned() {
                let existing_ts = self.net.users[&existing_uid].nick_ts;
                match resolve_collision(nick_ts, existing_ts) {
                    Collision::ExistingLoses => {
                        self.issue_kill(&existing_uid, "Nick collision");
                    }
                    Collision::BothLose => {
                        info!(nick = %new, "Nick collision, both killed");
                        self.issue_kill(&existing_uid, "Nick collision, both killed");
                        self.issue_kill(&uid, "Nick collision, both killed");
                        return Ok(());
                    }
                    Collision::IncomingLoses => {
                        self.issue_kill(&uid, "Nick collision");
                        return Ok(());
                    }
                }
            }
        }

        let old_mask = self.net.users[&uid].nickmask();
        let notice = Message::new("NICK", [new.clone()]).with_prefix(old_mask);
        for observer in self.net.shared_channel_local_ids(&uid) {
            self.send_to(observer, notice.clone());
        }

        {
            let user = self.net.users.get_mut(&uid).expect("source is live");
            user.nick = new;
            user.nick_ts = nick_ts;
        }
        if self.net.nicks.get(&old_fold).map(String::as_str) == Some(uid.as_str()) {
            self.net.nicks.remove(&old_fold);
        }
        self.net.nicks.insert(new_fold, uid);

        self.propagate(Some(id), msg);
        Ok(())
    }

    /// `:<uid> QUIT [:reason]`
    pub(crate) fn s_quit(&mut self, id: ClientId, msg: &Message) -> Result<(), LinkError> {
        let uid = self.source_user_uid(msg)?;
        let reason = msg.param(0).unwrap_or("Client Quit").to_string();
        self.remove_remote_user(&uid, &reason);
        self.propagate(Some(id), msg);
        Ok(())
    }

    /// `:<source> KILL <uid> :<path>` - the source may be a user or a
    /// server.
    pub(crate) fn s_kill(&mut self, id: ClientId, msg: &Message) -> Result<(), LinkError> {
        if !self.check_params(id, msg, 1) {
            return Ok(());
        }
        let prefix = msg.prefix.clone().unwrap_or_default();
        let source_name = if let Some(user) = self.net.users.get(&prefix) {
            user.nick.clone()
        } else if let Some(server) = self.net.servers.get(&prefix) {
            server.name.clone()
        } else {
            return Err(LinkError::UnknownSource(prefix));
        };

        let target = msg.params[0].clone();
        let text = msg.param(1).unwrap_or("").to_string();
        let reason = format!("Killed ({source_name} ({text}))");

        self.propagate(Some(id), msg);

        let Some(user) = self.net.users.get(&target) else {
            debug!(target = %target, "KILL for unknown target");
            return Ok(());
        };
        if let Some(local_id) = user.local {
            // Local: the KILL broadcast already informed the mesh, so the
            // local removal must not send its own QUIT.
            self.disconnect_local_user(local_id, &reason, false);
        } else {
            self.remove_remote_user(&target, &reason);
        }
        self.oper_notice(&format!("Received KILL for {target} from {source_name}"));
        Ok(())
    }

    /// `:<uid> MODE <uid> <changes>` - user mode sync. Channel MODE is a
    /// deliberate no-op.
    pub(crate) fn s_mode(&mut self, id: ClientId, msg: &Message) -> Result<(), LinkError> {
        if !self.check_params(id, msg, 2) {
            return Ok(());
        }
        let target = msg.params[0].clone();
        if mesh_proto::valid::is_channel_name(&target) {
            return Ok(());
        }
        if msg.prefix.as_deref() != Some(target.as_str()) {
            debug!(target = %target, "MODE with mismatched source, dropping");
            return Ok(());
        }
        let Some(user) = self.net.users.get_mut(&target) else {
            return Err(LinkError::UnknownSource(target));
        };

        user.modes.apply(&msg.params[1]);
        let oper = user.modes.oper;
        if oper {
            self.net.opers.insert(target.clone());
        } else {
            self.net.opers.remove(&target);
        }

        self.propagate(Some(id), msg);
        Ok(())
    }

    /// `:<uid> AWAY [:message]`
    pub(crate) fn s_away(&mut self, id: ClientId, msg: &Message) -> Result<(), LinkError> {
        let uid = self.source_user_uid(msg)?;
        let away = msg.param(0).filter(|m| !m.is_empty()).map(str::to_string);
        if let Some(user) = self.net.users.get_mut(&uid) {
            user.away = away;
        }
        self.propagate(Some(id), msg);
        Ok(())
    }

    /// `:<requester-uid> WHOIS <target-uid> <target-nick>`
    pub(crate) fn s_whois(&mut self, id: ClientId, msg: &Message) -> Result<(), LinkError> {
        if !self.check_params(id, msg, 2) {
            return Ok(());
        }
        let requester = self.source_user_uid(msg)?;
        let target = msg.params[0].clone();

        let Some((target_local, target_link)) =
            self.net.users.get(&target).map(|u| (u.is_local(), u.link))
        else {
            let nick = msg.params[1].clone();
            let reply = Message::new(
                ERR_NOSUCHNICK,
                [requester.clone(), nick, "No such nick/channel".to_string()],
            )
            .with_prefix(self.net.sid.clone());
            self.send_to(id, reply);
            return Ok(());
        };

        if target_local {
            let lines = self.whois_lines(&target);
            let back = self.net.users[&requester].link.unwrap_or(id);
            for (code, params) in lines {
                let mut full = vec![requester.clone()];
                full.extend(params);
                let reply = Message::new(code, full).with_prefix(self.net.sid.clone());
                self.send_to(back, reply);
            }
        } else if let Some(link) = target_link {
            if link != id {
                self.send_to(link, msg.clone());
            }
        }
        Ok(())
    }

    /// PRIVMSG/NOTICE from the mesh, aimed at a UID or a channel.
    pub(crate) fn s_privmsg(
        &mut self,
        id: ClientId,
        msg: &Message,
        command: &str,
    ) -> Result<(), LinkError> {
        if !self.check_params(id, msg, 2) {
            return Ok(());
        }
        let prefix = msg.prefix.clone().unwrap_or_default();
        if !self.net.users.contains_key(&prefix) && !self.net.servers.contains_key(&prefix) {
            return Err(LinkError::UnknownSource(prefix));
        }
        let target = msg.params[0].clone();
        let text = msg.params[1].clone();

        if is_valid_uid(&target) {
            if let Some((local, link, nick)) = self
                .net
                .users
                .get(&target)
                .map(|u| (u.local, u.link, u.nick.clone()))
            {
                if let Some(local) = local {
                    let source = self.display_source(&prefix);
                    let deliver = Message::new(command, [nick, text]).with_prefix(source);
                    self.send_to(local, deliver);
                } else if let Some(link) = link {
                    if link != id {
                        self.send_to(link, msg.clone());
                    }
                }
                return Ok(());
            }
        }

        let key = crate::state::Network::channel_key(&target);
        if self.net.channels.contains_key(&key) {
            self.route_channel_message(&key, command, &text, &prefix, Some(id), None);
        } else {
            debug!(target = %target, "Dropping message for unknown target");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Removal primitives
    // ------------------------------------------------------------------

    /// Remove a remote user: every local user sharing a channel hears one
    /// QUIT, memberships unwind, and the user leaves all maps.
    pub(crate) fn remove_remote_user(&mut self, uid: &str, reason: &str) {
        let Some(user) = self.net.users.get(uid) else {
            return;
        };
        let mask = user.nickmask();

        let observers = self.net.shared_channel_local_ids(uid);
        let quit = Message::new("QUIT", [reason]).with_prefix(mask);
        for observer in observers {
            self.send_to(observer, quit.clone());
        }

        self.net.remove_user_entry(uid);
    }

    /// Broadcast a KILL to every server link, ingress included: kills we
    /// originate must reach the side that introduced the victim.
    pub(crate) fn broadcast_kill(&mut self, uid: &str, reason: &str) {
        let kill = Message::new("KILL", [uid, reason]).with_prefix(self.net.sid.clone());
        for link in self.net.local_server_ids() {
            self.send_to(link, kill.clone());
        }
    }

    /// Kill a user we know: broadcast the KILL and run the right local
    /// removal.
    pub(crate) fn issue_kill(&mut self, uid: &str, reason: &str) {
        self.broadcast_kill(uid, reason);
        let full_reason = format!("Killed ({} ({}))", self.net.name, reason);

        match self.net.users.get(uid).and_then(|u| u.local) {
            Some(local_id) => {
                // The KILL broadcast stands in for the QUIT.
                self.disconnect_local_user(local_id, &full_reason, false);
            }
            None => self.remove_remote_user(uid, &full_reason),
        }
    }
}
