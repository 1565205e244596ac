//! Commands from registered local users.
//!
//! Only the surface needed to drive the server-to-server semantics: the
//! channel and messaging basics, operator tooling, and the liveness
//! plumbing. Everything here runs inside the event loop and never blocks.

use chrono::Utc;
use mesh_proto::response::*;
use mesh_proto::valid::{is_channel_name, is_valid_nick};
use mesh_proto::{irc_to_lower, Message};
use tracing::info;

use crate::daemon::Daemon;
use crate::state::channel::CHANNEL_MODES;
use crate::state::{Channel, ClientId, KLine, Network};

impl Daemon {
    pub(crate) fn user_message(&mut self, id: ClientId, msg: Message) {
        let Some(uid) = self.net.local_users.get(&id).map(|lu| lu.uid.clone()) else {
            return;
        };

        match msg.command_upper().as_str() {
            "PING" => {
                let token = msg.param(0).unwrap_or("").to_string();
                let reply = Message::new("PONG", [self.net.name.clone(), token])
                    .with_prefix(self.net.name.clone());
                self.send_to(id, reply);
            }
            "PONG" => {}
            "NICK" => self.u_nick(id, &uid, &msg),
            "JOIN" => self.u_join(id, &uid, &msg),
            "PART" => self.u_part(id, &uid, &msg),
            "TOPIC" => self.u_topic(id, &uid, &msg),
            "PRIVMSG" => self.u_privmsg(id, &uid, &msg, "PRIVMSG"),
            "NOTICE" => self.u_privmsg(id, &uid, &msg, "NOTICE"),
            "AWAY" => self.u_away(id, &uid, &msg),
            "MODE" => self.u_mode(id, &uid, &msg),
            "WHOIS" => self.u_whois(id, &uid, &msg),
            "INVITE" => self.u_invite(id, &uid, &msg),
            "OPER" => self.u_oper(id, &uid, &msg),
            "KILL" => self.u_kill(id, &uid, &msg),
            "WALLOPS" => self.u_wallops(id, &uid, &msg, "WALLOPS"),
            "OPERWALL" => self.u_wallops(id, &uid, &msg, "OPERWALL"),
            "KLINE" => self.u_kline(id, &uid, &msg),
            "UNKLINE" => self.u_unkline(id, &uid, &msg),
            "REHASH" => self.u_rehash(id, &uid),
            "MOTD" => self.send_motd(id),
            "QUIT" => {
                let reason = msg
                    .param(0)
                    .map(|m| format!("Quit: {m}"))
                    .unwrap_or_else(|| "Client Quit".to_string());
                self.disconnect_local_user(id, &reason, true);
            }
            other => {
                self.send_numeric(id, ERR_UNKNOWNCOMMAND, &[other, "Unknown command"]);
            }
        }
    }

    fn is_oper(&self, uid: &str) -> bool {
        self.net.opers.contains(uid)
    }

    fn u_nick(&mut self, id: ClientId, uid: &str, msg: &Message) {
        let Some(new) = msg.param(0) else {
            self.send_numeric(id, ERR_NEEDMOREPARAMS, &["NICK", "Not enough parameters"]);
            return;
        };
        let new = new.to_string();

        if !is_valid_nick(&new, self.conf.server.max_nick_length) {
            self.send_numeric(id, ERR_ERRONEUSNICKNAME, &[&new, "Erroneous nickname"]);
            return;
        }

        let old_fold = irc_to_lower(&self.net.users[uid].nick);
        let new_fold = irc_to_lower(&new);
        if new_fold != old_fold && self.net.nicks.contains_key(&new_fold) {
            self.send_numeric(id, ERR_NICKNAMEINUSE, &[&new, "Nickname is already in use"]);
            return;
        }

        let now = Utc::now().timestamp();
        let old_mask = self.net.users[uid].nickmask();

        // The renamer and everyone sharing a channel hear it once.
        let notice = Message::new("NICK", [new.clone()]).with_prefix(old_mask);
        self.send_to(id, notice.clone());
        for observer in self.net.shared_channel_local_ids(uid) {
            self.send_to(observer, notice.clone());
        }

        {
            let user = self.net.users.get_mut(uid).expect("sender is live");
            user.nick = new.clone();
            user.nick_ts = now;
        }
        self.net.nicks.remove(&old_fold);
        self.net.nicks.insert(new_fold, uid.to_string());

        let wire = Message::new("NICK", [new, now.to_string()]).with_prefix(uid.to_string());
        self.propagate(None, &wire);
    }

    fn u_join(&mut self, id: ClientId, uid: &str, msg: &Message) {
        let Some(name) = msg.param(0) else {
            self.send_numeric(id, ERR_NEEDMOREPARAMS, &["JOIN", "Not enough parameters"]);
            return;
        };
        let name = name.to_string();
        if !is_channel_name(&name) {
            self.send_numeric(id, ERR_NOSUCHCHANNEL, &[&name, "No such channel"]);
            return;
        }

        let key = Network::channel_key(&name);
        let created = if self.net.channels.contains_key(&key) {
            false
        } else {
            self.net
                .channels
                .insert(key.clone(), Channel::new(name.clone(), Utc::now().timestamp()));
            true
        };
        if !self.net.add_member(&key, uid) {
            return; // already a member
        }

        let mask = self.net.users[uid].nickmask();
        let display = self.net.channels[&key].name.clone();
        let join = Message::new("JOIN", [display.clone()]).with_prefix(mask);
        for member in self.net.local_members(&key) {
            self.send_to(member, join.clone());
        }

        self.send_names(id, &key);
        if let Some(topic) = self.net.channels[&key].topic.clone() {
            self.send_numeric(id, RPL_TOPIC, &[&display, &topic.text]);
        }

        let ts = self.net.channels[&key].ts.to_string();
        let wire = if created {
            Message::new("SJOIN", [ts.as_str(), display.as_str(), CHANNEL_MODES, uid])
                .with_prefix(self.net.sid.clone())
        } else {
            Message::new("JOIN", [ts.as_str(), display.as_str(), "+"])
                .with_prefix(uid.to_string())
        };
        self.propagate(None, &wire);
    }

    fn send_names(&mut self, id: ClientId, key: &str) {
        let Some(channel) = self.net.channels.get(key) else {
            return;
        };
        let display = channel.name.clone();
        let nicks: Vec<String> = channel
            .members
            .iter()
            .filter_map(|m| self.net.users.get(m))
            .map(|u| u.nick.clone())
            .collect();
        self.send_numeric(id, RPL_NAMREPLY, &["=", &display, &nicks.join(" ")]);
        self.send_numeric(id, RPL_ENDOFNAMES, &[&display, "End of /NAMES list"]);
    }

    fn u_part(&mut self, id: ClientId, uid: &str, msg: &Message) {
        let Some(name) = msg.param(0) else {
            self.send_numeric(id, ERR_NEEDMOREPARAMS, &["PART", "Not enough parameters"]);
            return;
        };
        let name = name.to_string();
        let key = Network::channel_key(&name);

        if !self.net.users[uid].channels.contains(&key) {
            self.send_numeric(id, ERR_NOTONCHANNEL, &[&name, "You're not on that channel"]);
            return;
        }

        let display = self.net.channels[&key].name.clone();
        let mask = self.net.users[uid].nickmask();
        let mut params = vec![display.clone()];
        if let Some(reason) = msg.param(1) {
            params.push(reason.to_string());
        }
        let part = Message::new("PART", params.clone()).with_prefix(mask);
        for member in self.net.local_members(&key) {
            self.send_to(member, part.clone());
        }

        self.net.remove_member(&key, uid);

        let wire = Message::new("PART", params).with_prefix(uid.to_string());
        self.propagate(None, &wire);
    }

    fn u_topic(&mut self, id: ClientId, uid: &str, msg: &Message) {
        let Some(name) = msg.param(0) else {
            self.send_numeric(id, ERR_NEEDMOREPARAMS, &["TOPIC", "Not enough parameters"]);
            return;
        };
        let name = name.to_string();
        let key = Network::channel_key(&name);
        let Some(channel) = self.net.channels.get(&key) else {
            self.send_numeric(id, ERR_NOSUCHCHANNEL, &[&name, "No such channel"]);
            return;
        };
        let display = channel.name.clone();

        let Some(text) = msg.param(1) else {
            match channel.topic.clone() {
                Some(topic) => self.send_numeric(id, RPL_TOPIC, &[&display, &topic.text]),
                None => self.send_numeric(id, RPL_NOTOPIC, &[&display, "No topic is set"]),
            }
            return;
        };
        let text = text.to_string();

        if !self.net.users[uid].channels.contains(&key) {
            self.send_numeric(id, ERR_NOTONCHANNEL, &[&display, "You're not on that channel"]);
            return;
        }

        let mask = self.net.users[uid].nickmask();
        self.set_topic(&key, &text, &mask, Utc::now().timestamp(), &mask);

        let wire = Message::new("TOPIC", [display, text]).with_prefix(uid.to_string());
        self.propagate(None, &wire);
    }

    fn u_privmsg(&mut self, id: ClientId, uid: &str, msg: &Message, command: &str) {
        let (Some(target), Some(text)) = (msg.param(0), msg.param(1)) else {
            self.send_numeric(id, ERR_NEEDMOREPARAMS, &[command, "Not enough parameters"]);
            return;
        };
        let target = target.to_string();
        let text = text.to_string();

        if is_channel_name(&target) {
            let key = Network::channel_key(&target);
            if !self.net.channels.contains_key(&key) {
                self.send_numeric(id, ERR_NOSUCHCHANNEL, &[&target, "No such channel"]);
                return;
            }
            self.route_channel_message(&key, command, &text, uid, None, Some(id));
            return;
        }

        let Some(target_user) = self.net.user_by_nick(&target) else {
            self.send_numeric(id, ERR_NOSUCHNICK, &[&target, "No such nick/channel"]);
            return;
        };
        let target_uid = target_user.uid.clone();
        let target_nick = target_user.nick.clone();
        let away = target_user.away.clone();
        let local = target_user.local;
        let link = target_user.link;

        if let Some(local_id) = local {
            let mask = self.net.users[uid].nickmask();
            let deliver = Message::new(command, [target_nick.clone(), text]).with_prefix(mask);
            self.send_to(local_id, deliver);
        } else if let Some(link) = link {
            let wire =
                Message::new(command, [target_uid, text]).with_prefix(uid.to_string());
            self.send_to(link, wire);
        }

        if command == "PRIVMSG" {
            if let Some(away) = away {
                self.send_numeric(id, RPL_AWAY, &[&target_nick, &away]);
            }
        }
    }

    fn u_away(&mut self, id: ClientId, uid: &str, msg: &Message) {
        let away = msg.param(0).filter(|m| !m.is_empty()).map(str::to_string);
        let set = away.is_some();
        if let Some(user) = self.net.users.get_mut(uid) {
            user.away = away.clone();
        }

        if set {
            self.send_numeric(id, RPL_NOWAWAY, &["You have been marked as being away"]);
        } else {
            self.send_numeric(id, RPL_UNAWAY, &["You are no longer marked as being away"]);
        }

        let mut wire = Message::new("AWAY", away.into_iter().collect::<Vec<_>>());
        wire.prefix = Some(uid.to_string());
        self.propagate(None, &wire);
    }

    fn u_mode(&mut self, id: ClientId, uid: &str, msg: &Message) {
        let Some(target) = msg.param(0) else {
            self.send_numeric(id, ERR_NEEDMOREPARAMS, &["MODE", "Not enough parameters"]);
            return;
        };
        // Channel modes are fixed; only self umode changes exist.
        if is_channel_name(target) {
            return;
        }
        let own_nick = self.net.users[uid].nick.clone();
        if !mesh_proto::irc_eq(target, &own_nick) {
            return;
        }

        let Some(changes) = msg.param(1) else {
            let modes = self.net.users[uid].modes.to_string();
            self.send_numeric(id, RPL_UMODEIS, &[&modes]);
            return;
        };

        // Users cannot grant themselves oper, and +C is oper-only.
        let before = self.net.users[uid].modes;
        {
            let user = self.net.users.get_mut(uid).expect("sender is live");
            user.modes.apply(changes);
            if user.modes.oper && !before.oper {
                user.modes.oper = false;
            }
            if user.modes.conn_notices && !user.modes.oper {
                user.modes.conn_notices = false;
            }
        }
        let after = self.net.users[uid].modes;
        let delta = after.diff_from(&before);
        if delta.is_empty() {
            return;
        }

        if before.oper && !after.oper {
            self.net.opers.remove(uid);
        }

        let mask = self.net.users[uid].nickmask();
        let reply = Message::new("MODE", [own_nick, delta.clone()]).with_prefix(mask);
        self.send_to(id, reply);

        let wire = Message::new("MODE", [uid.to_string(), delta]).with_prefix(uid.to_string());
        self.propagate(None, &wire);
    }

    fn u_whois(&mut self, id: ClientId, uid: &str, msg: &Message) {
        let Some(target) = msg.param(0) else {
            self.send_numeric(id, ERR_NEEDMOREPARAMS, &["WHOIS", "Not enough parameters"]);
            return;
        };
        let Some(target_user) = self.net.user_by_nick(target) else {
            self.send_numeric(id, ERR_NOSUCHNICK, &[target, "No such nick/channel"]);
            return;
        };
        let target_uid = target_user.uid.clone();
        let target_nick = target_user.nick.clone();

        if target_user.is_local() {
            for (code, params) in self.whois_lines(&target_uid) {
                let refs: Vec<&str> = params.iter().map(String::as_str).collect();
                self.send_numeric(id, &code, &refs);
            }
        } else if let Some(link) = target_user.link {
            let wire = Message::new("WHOIS", [target_uid, target_nick])
                .with_prefix(uid.to_string());
            self.send_to(link, wire);
        }
    }

    /// The WHOIS reply set for a local target: (numeric, params after the
    /// recipient).
    pub(crate) fn whois_lines(&self, target_uid: &str) -> Vec<(String, Vec<String>)> {
        let Some(user) = self.net.users.get(target_uid) else {
            return Vec::new();
        };
        let nick = user.nick.clone();
        let mut lines = vec![
            (
                RPL_WHOISUSER.to_string(),
                vec![
                    nick.clone(),
                    user.username.clone(),
                    user.host.clone(),
                    "*".to_string(),
                    user.realname.clone(),
                ],
            ),
            (
                RPL_WHOISSERVER.to_string(),
                vec![nick.clone(), self.net.name.clone(), self.net.desc.clone()],
            ),
        ];
        if let Some(away) = &user.away {
            lines.push((RPL_AWAY.to_string(), vec![nick.clone(), away.clone()]));
        }
        if user.modes.oper {
            lines.push((
                RPL_WHOISOPERATOR.to_string(),
                vec![nick.clone(), "is an IRC operator".to_string()],
            ));
        }
        if user.tls {
            lines.push((
                RPL_WHOISSECURE.to_string(),
                vec![nick.clone(), "is using a secure connection".to_string()],
            ));
        }
        if let Some(local_id) = user.local {
            let idle = self
                .net
                .local_users
                .get(&local_id)
                .map(|lu| lu.conn.last_activity.elapsed().as_secs())
                .unwrap_or(0);
            lines.push((
                RPL_WHOISIDLE.to_string(),
                vec![
                    nick.clone(),
                    idle.to_string(),
                    user.signon_ts.to_string(),
                    "seconds idle, signon time".to_string(),
                ],
            ));
        }
        lines.push((
            RPL_ENDOFWHOIS.to_string(),
            vec![nick, "End of /WHOIS list".to_string()],
        ));
        lines
    }

    fn u_invite(&mut self, id: ClientId, uid: &str, msg: &Message) {
        let (Some(nick), Some(chan)) = (msg.param(0), msg.param(1)) else {
            self.send_numeric(id, ERR_NEEDMOREPARAMS, &["INVITE", "Not enough parameters"]);
            return;
        };
        let key = Network::channel_key(chan);
        let Some(channel) = self.net.channels.get(&key) else {
            self.send_numeric(id, ERR_NOSUCHCHANNEL, &[chan, "No such channel"]);
            return;
        };
        let display = channel.name.clone();
        let chan_ts = channel.ts;

        if !self.net.users[uid].channels.contains(&key) {
            self.send_numeric(id, ERR_NOTONCHANNEL, &[&display, "You're not on that channel"]);
            return;
        }
        let Some(target) = self.net.user_by_nick(nick) else {
            self.send_numeric(id, ERR_NOSUCHNICK, &[nick, "No such nick/channel"]);
            return;
        };
        let target_uid = target.uid.clone();
        let target_nick = target.nick.clone();
        let local = target.local;
        let link = target.link;

        self.send_numeric(id, RPL_INVITING, &[&target_nick, &display]);

        if let Some(local_id) = local {
            let mask = self.net.users[uid].nickmask();
            let invite =
                Message::new("INVITE", [target_nick, display]).with_prefix(mask);
            self.send_to(local_id, invite);
        } else if let Some(link) = link {
            let wire = Message::new(
                "INVITE",
                [target_uid, display, chan_ts.to_string()],
            )
            .with_prefix(uid.to_string());
            self.send_to(link, wire);
        }
    }

    fn u_oper(&mut self, id: ClientId, uid: &str, msg: &Message) {
        let (Some(name), Some(password)) = (msg.param(0), msg.param(1)) else {
            self.send_numeric(id, ERR_NEEDMOREPARAMS, &["OPER", "Not enough parameters"]);
            return;
        };

        let ok = self
            .conf
            .opers
            .iter()
            .any(|o| o.name == name && o.password == password);
        if !ok {
            self.send_numeric(id, ERR_PASSWDMISMATCH, &["Password incorrect"]);
            return;
        }

        let nick = {
            let user = self.net.users.get_mut(uid).expect("sender is live");
            user.modes.oper = true;
            user.nick.clone()
        };
        self.net.opers.insert(uid.to_string());

        self.send_numeric(id, RPL_YOUREOPER, &["You are now an IRC operator"]);
        info!(nick = %nick, "Operator authenticated");
        self.oper_notice(&format!("{nick} is now an operator"));

        let wire = Message::new("MODE", [uid.to_string(), "+o".to_string()])
            .with_prefix(uid.to_string());
        self.propagate(None, &wire);
    }

    fn u_kill(&mut self, id: ClientId, uid: &str, msg: &Message) {
        if !self.is_oper(uid) {
            self.send_numeric(id, ERR_NOPRIVILEGES, &["Permission Denied"]);
            return;
        }
        let Some(nick) = msg.param(0) else {
            self.send_numeric(id, ERR_NEEDMOREPARAMS, &["KILL", "Not enough parameters"]);
            return;
        };
        let reason = msg.param(1).unwrap_or("No reason").to_string();
        let Some(target) = self.net.user_by_nick(nick) else {
            self.send_numeric(id, ERR_NOSUCHNICK, &[nick, "No such nick/channel"]);
            return;
        };
        let target_uid = target.uid.clone();
        let target_nick = target.nick.clone();
        let oper_nick = self.net.users[uid].nick.clone();

        self.oper_notice(&format!(
            "{oper_nick} issued KILL for {target_nick} ({reason})"
        ));

        let wire = Message::new("KILL", [target_uid.clone(), reason.clone()])
            .with_prefix(uid.to_string());
        self.propagate(None, &wire);

        let full_reason = format!("Killed ({oper_nick} ({reason}))");
        if let Some(local_id) = self.net.users[&target_uid].local {
            self.disconnect_local_user(local_id, &full_reason, false);
        } else {
            self.remove_remote_user(&target_uid, &full_reason);
        }
    }

    fn u_wallops(&mut self, id: ClientId, uid: &str, msg: &Message, command: &str) {
        if !self.is_oper(uid) {
            self.send_numeric(id, ERR_NOPRIVILEGES, &["Permission Denied"]);
            return;
        }
        let Some(text) = msg.param(0) else {
            self.send_numeric(id, ERR_NEEDMOREPARAMS, &[command, "Not enough parameters"]);
            return;
        };
        let text = text.to_string();

        let mask = self.net.users[uid].nickmask();
        self.deliver_wallops(&mask, command, &text);

        let wire = Message::new(command, [text]).with_prefix(uid.to_string());
        self.propagate(None, &wire);
    }

    /// Hand a WALLOPS/OPERWALL line to every local operator.
    pub(crate) fn deliver_wallops(&mut self, source: &str, command: &str, text: &str) {
        let targets: Vec<ClientId> = self
            .net
            .opers
            .iter()
            .filter_map(|uid| self.net.users.get(uid))
            .filter_map(|u| u.local)
            .collect();
        for target in targets {
            let msg = Message::new(command, [text]).with_prefix(source.to_string());
            self.send_to(target, msg);
        }
    }

    fn u_kline(&mut self, id: ClientId, uid: &str, msg: &Message) {
        if !self.is_oper(uid) {
            self.send_numeric(id, ERR_NOPRIVILEGES, &["Permission Denied"]);
            return;
        }
        let (Some(user_mask), Some(host_mask)) = (msg.param(0), msg.param(1)) else {
            self.send_numeric(id, ERR_NEEDMOREPARAMS, &["KLINE", "Not enough parameters"]);
            return;
        };
        let user_mask = user_mask.to_string();
        let host_mask = host_mask.to_string();
        let reason = msg.param(2).unwrap_or("K-lined").to_string();
        let oper_nick = self.net.users[uid].nick.clone();

        self.add_kline(
            KLine {
                user: user_mask.clone(),
                host: host_mask.clone(),
                reason: reason.clone(),
            },
            &oper_nick,
        );

        let wire = Message::new(
            "ENCAP",
            [
                "*",
                "KLINE",
                "0",
                user_mask.as_str(),
                host_mask.as_str(),
                reason.as_str(),
            ],
        )
        .with_prefix(uid.to_string());
        self.propagate(None, &wire);
    }

    fn u_unkline(&mut self, id: ClientId, uid: &str, msg: &Message) {
        if !self.is_oper(uid) {
            self.send_numeric(id, ERR_NOPRIVILEGES, &["Permission Denied"]);
            return;
        }
        let (Some(user_mask), Some(host_mask)) = (msg.param(0), msg.param(1)) else {
            self.send_numeric(id, ERR_NEEDMOREPARAMS, &["UNKLINE", "Not enough parameters"]);
            return;
        };
        let user_mask = user_mask.to_string();
        let host_mask = host_mask.to_string();
        let oper_nick = self.net.users[uid].nick.clone();

        self.remove_kline(&user_mask, &host_mask, &oper_nick);

        let wire = Message::new(
            "ENCAP",
            ["*", "UNKLINE", user_mask.as_str(), host_mask.as_str()],
        )
        .with_prefix(uid.to_string());
        self.propagate(None, &wire);
    }

    fn u_rehash(&mut self, id: ClientId, uid: &str) {
        if !self.is_oper(uid) {
            self.send_numeric(id, ERR_NOPRIVILEGES, &["Permission Denied"]);
            return;
        }
        let path = self.config_path.clone();
        self.send_numeric(id, RPL_REHASHING, &[&path, "Rehashing"]);
        self.rehash();
    }
}
