//! Pre-registration handling.
//!
//! A fresh connection may become a user (NICK + USER) or a server link
//! (PASS + CAPAB + SERVER + SVINFO). Anything that breaks the server
//! handshake sequence closes the connection; stray client-protocol noise
//! (CAP negotiation and the like) is ignored.

use chrono::Utc;
use mesh_proto::response::*;
use mesh_proto::valid::{is_valid_nick, is_valid_sid};
use mesh_proto::{irc_to_lower, Message};
use tracing::{debug, info, warn};

use crate::daemon::{Daemon, VERSION};
use crate::state::network::{OUR_CAPABS, REQUIRED_CAPABS};
use crate::state::{ClientId, LocalServer, LocalUser, Server, User, UserModes};

impl Daemon {
    pub(crate) fn preclient_message(&mut self, id: ClientId, msg: Message) {
        match msg.command_upper().as_str() {
            "NICK" => self.pre_nick(id, &msg),
            "USER" => self.pre_user(id, &msg),
            "PASS" => self.pre_pass(id, &msg),
            "CAPAB" => self.pre_capab(id, &msg),
            "SERVER" => self.pre_server(id, &msg),
            "SVINFO" => self.pre_svinfo(id, &msg),
            "PING" => {
                let token = msg.param(0).unwrap_or("").to_string();
                let reply = Message::new("PONG", [self.net.name.clone(), token])
                    .with_prefix(self.net.name.clone());
                self.send_to(id, reply);
            }
            "QUIT" => {
                self.net.clients.remove(&id);
            }
            other => {
                // CAP and friends from ordinary clients; harmless.
                debug!(client = id, command = other, "Ignoring pre-registration command");
            }
        }
    }

    fn pre_nick(&mut self, id: ClientId, msg: &Message) {
        let Some(nick) = msg.param(0) else {
            self.send_numeric(id, ERR_NEEDMOREPARAMS, &["NICK", "Not enough parameters"]);
            return;
        };
        let nick = nick.to_string();

        if !is_valid_nick(&nick, self.conf.server.max_nick_length) {
            self.send_numeric(id, ERR_ERRONEUSNICKNAME, &[&nick, "Erroneous nickname"]);
            return;
        }
        if self.net.nicks.contains_key(&irc_to_lower(&nick)) {
            self.send_numeric(id, ERR_NICKNAMEINUSE, &[&nick, "Nickname is already in use"]);
            return;
        }

        if let Some(client) = self.net.clients.get_mut(&id) {
            client.nick = Some(nick);
        }
        self.try_register_user(id);
    }

    fn pre_user(&mut self, id: ClientId, msg: &Message) {
        if msg.params.len() < 4 {
            self.send_numeric(id, ERR_NEEDMOREPARAMS, &["USER", "Not enough parameters"]);
            return;
        }
        let username = msg.params[0].clone();
        let realname = msg.params[3].clone();

        if let Some(client) = self.net.clients.get_mut(&id) {
            if client.user.is_some() {
                self.send_numeric(id, ERR_ALREADYREGISTRED, &["You may not reregister"]);
                return;
            }
            client.user = Some((username, realname));
        }
        self.try_register_user(id);
    }

    fn try_register_user(&mut self, id: ClientId) {
        let Some(client) = self.net.clients.get(&id) else {
            return;
        };
        let (Some(nick), Some((username, realname))) = (client.nick.clone(), client.user.clone())
        else {
            return;
        };

        // The nick may have been taken while USER was still outstanding.
        if self.net.nicks.contains_key(&irc_to_lower(&nick)) {
            self.send_numeric(id, ERR_NICKNAMEINUSE, &[&nick, "Nickname is already in use"]);
            if let Some(client) = self.net.clients.get_mut(&id) {
                client.nick = None;
            }
            return;
        }

        let (host, ip, tls) = {
            let conn = &self.net.clients[&id].conn;
            (conn.host.clone(), conn.ip.clone(), conn.tls)
        };

        if let Some(kline) = self
            .net
            .klines
            .iter()
            .find(|k| k.matches(&username, &host))
            .cloned()
        {
            self.send_numeric(
                id,
                ERR_YOUREBANNEDCREEP,
                &[&format!("You are banned from this server: {}", kline.reason)],
            );
            self.send_to(id, Message::new("ERROR", ["Closing Link: K-lined"]));
            self.net.clients.remove(&id);
            info!(nick = %nick, host = %host, "Rejected K-lined connection");
            return;
        }

        let now = Utc::now().timestamp();
        let uid = self.uids.next();

        let mut client = self.net.clients.remove(&id).expect("checked above");
        if let Some(over) = self.conf.user_override(&username, &host) {
            if let Some(sendq) = over.sendq {
                client.conn.sendq_limit = sendq;
            }
        }
        let flood_exempt = self
            .conf
            .user_override(&username, &host)
            .map(|o| o.flood_exempt)
            .unwrap_or(false);

        let user = User {
            uid: uid.clone(),
            nick: nick.clone(),
            nick_ts: now,
            hops: 0,
            username: username.clone(),
            host: host.clone(),
            ip: ip.clone(),
            realname: realname.clone(),
            modes: UserModes {
                invisible: true,
                ..Default::default()
            },
            away: None,
            channels: Default::default(),
            sid: self.net.sid.clone(),
            link: None,
            local: Some(id),
            tls,
            signon_ts: now,
        };
        let modes_word = user.modes.to_string();

        self.net.nicks.insert(irc_to_lower(&nick), uid.clone());
        self.net.users.insert(uid.clone(), user);
        self.net.local_users.insert(
            id,
            LocalUser {
                conn: client.conn,
                uid: uid.clone(),
                bucket: Default::default(),
                queue: Default::default(),
                flood_exempt,
            },
        );

        self.send_welcome(id, &nick);
        info!(nick = %nick, uid = %uid, host = %host, "Client registered");

        // Introduce the new user to the mesh.
        let now_ts = now.to_string();
        let intro = Message::new(
            "UID",
            [
                nick.as_str(),
                "1",
                now_ts.as_str(),
                modes_word.as_str(),
                username.as_str(),
                host.as_str(),
                ip.as_str(),
                uid.as_str(),
                realname.as_str(),
            ],
        )
        .with_prefix(self.net.sid.clone());
        self.propagate(None, &intro);

        let cliconn = Message::new(
            "CLICONN",
            [
                nick.as_str(),
                username.as_str(),
                host.as_str(),
                ip.as_str(),
                realname.as_str(),
            ],
        )
        .with_prefix(self.net.sid.clone());
        self.propagate(None, &cliconn);

        self.conn_notice(&format!(
            "Client connecting: {} ({}@{}) [{}]",
            nick, username, host, ip
        ));
    }

    fn send_welcome(&mut self, id: ClientId, nick: &str) {
        let name = self.net.name.clone();
        self.send_numeric(
            id,
            RPL_WELCOME,
            &[&format!("Welcome to the Internet Relay Chat Network {nick}")],
        );
        self.send_numeric(
            id,
            RPL_YOURHOST,
            &[&format!("Your host is {name}, running version {VERSION}")],
        );
        self.send_numeric(
            id,
            RPL_CREATED,
            &[&format!("This server was created {}", self.started)],
        );
        self.send_numeric(id, RPL_MYINFO, &[&name, VERSION, "ioC", "ns"]);
        self.send_motd(id);
    }

    pub(crate) fn send_motd(&mut self, id: ClientId) {
        let name = self.net.name.clone();
        match self.motd.clone() {
            Some(lines) => {
                self.send_numeric(id, RPL_MOTDSTART, &[&format!("- {name} Message of the day -")]);
                for line in &lines {
                    self.send_numeric(id, RPL_MOTD, &[&format!("- {line}")]);
                }
                self.send_numeric(id, RPL_ENDOFMOTD, &["End of /MOTD command"]);
            }
            None => {
                self.send_numeric(id, ERR_NOMOTD, &["MOTD File is missing"]);
            }
        }
    }

    // ------------------------------------------------------------------
    // Server handshake
    // ------------------------------------------------------------------

    fn pre_pass(&mut self, id: ClientId, msg: &Message) {
        // TS6 form: PASS <password> TS 6 :<SID>
        if msg.params.len() >= 4
            && msg.params[1].eq_ignore_ascii_case("TS")
            && msg.params[2] == "6"
        {
            if let Some(client) = self.net.clients.get_mut(&id) {
                client.pass = Some((msg.params[0].clone(), msg.params[3].clone()));
            }
        }
        // A bare client PASS carries nothing we use.
    }

    fn pre_capab(&mut self, id: ClientId, msg: &Message) {
        let capabs: Vec<String> = msg
            .params
            .iter()
            .flat_map(|p| p.split_whitespace())
            .map(str::to_string)
            .collect();
        if let Some(client) = self.net.clients.get_mut(&id) {
            client.capabs.extend(capabs);
        }
    }

    fn pre_server(&mut self, id: ClientId, msg: &Message) {
        if msg.params.len() < 3 {
            self.fail_registration(id, "SERVER needs <name> <hops> <description>");
            return;
        }
        let name = msg.params[0].clone();
        let desc = msg.params[2].clone();

        let Some(client) = self.net.clients.get(&id) else {
            return;
        };
        let Some((pass, sid)) = client.pass.clone() else {
            self.fail_registration(id, "SERVER before PASS");
            return;
        };
        if client.server_announced.is_some() {
            self.fail_registration(id, "Duplicate SERVER");
            return;
        }
        let capabs = client.capabs.clone();
        let dialed = client.link.clone();
        let sent_credentials = client.sent_credentials;

        // The peer must be a configured link with the right password.
        let Some(link) = self.conf.links.iter().find(|l| l.name == name).cloned() else {
            warn!(name = %name, "Unknown server name on link attempt");
            self.fail_registration(id, "Unknown server name");
            return;
        };
        if link.password != pass {
            warn!(name = %name, "Bad link password");
            self.fail_registration(id, "Bad password");
            return;
        }
        if let Some(dialed_name) = &dialed {
            if dialed_name != &name {
                self.fail_registration(id, "Server name does not match link");
                return;
            }
        }
        if !is_valid_sid(&sid) {
            self.fail_registration(id, "Invalid SID");
            return;
        }
        if self.net.servers.contains_key(&sid) {
            warn!(sid = %sid, "SID clash on link attempt");
            self.fail_registration(id, "SID already in use");
            return;
        }
        if let Some(expected) = &link.sid {
            if expected != &sid {
                self.fail_registration(id, "Unexpected SID");
                return;
            }
        }
        for required in REQUIRED_CAPABS {
            if !capabs.contains(required) {
                self.fail_registration(id, &format!("Missing required capability {required}"));
                return;
            }
        }

        if let Some(client) = self.net.clients.get_mut(&id) {
            client.server_announced = Some((name, desc));
        }

        if !sent_credentials {
            self.send_link_credentials(id, &link.password);
        }
        let now_ts = Utc::now().timestamp().to_string();
        let svinfo = Message::new("SVINFO", ["6", "6", "0", now_ts.as_str()]);
        self.send_to(id, svinfo);
    }

    /// Our side of the handshake: PASS, CAPAB, SERVER.
    pub(crate) fn send_link_credentials(&mut self, id: ClientId, password: &str) {
        let sid = self.net.sid.clone();
        let pass = Message::new("PASS", [password, "TS", "6", sid.as_str()]);
        let capab = Message::new("CAPAB", [OUR_CAPABS.join(" ")]);
        let server = Message::new("SERVER", [self.net.name.clone(), "1".into(), self.net.desc.clone()]);
        self.send_to(id, pass);
        self.send_to(id, capab);
        self.send_to(id, server);
        if let Some(client) = self.net.clients.get_mut(&id) {
            client.sent_credentials = true;
        }
    }

    fn pre_svinfo(&mut self, id: ClientId, msg: &Message) {
        let Some(client) = self.net.clients.get(&id) else {
            return;
        };
        if client.server_announced.is_none() {
            self.fail_registration(id, "SVINFO before SERVER");
            return;
        }
        if msg.params.len() < 4 {
            self.fail_registration(id, "SVINFO needs four parameters");
            return;
        }

        let their_time: i64 = match msg.params[3].parse() {
            Ok(t) => t,
            Err(_) => {
                self.fail_registration(id, "Unparseable SVINFO time");
                return;
            }
        };
        let skew = (Utc::now().timestamp() - their_time).unsigned_abs();
        if skew > self.conf.timeouts.max_ts_skew {
            warn!(skew, "Rejecting link for TS skew");
            self.fail_registration(id, "TS skew too great");
            return;
        }

        self.promote_server(id);
    }

    fn promote_server(&mut self, id: ClientId) {
        let Some(client) = self.net.clients.remove(&id) else {
            return;
        };
        let (name, desc) = client.server_announced.expect("checked in pre_svinfo");
        let (_, sid) = client.pass.expect("checked in pre_server");
        let capabs = client.capabs;

        self.net.servers.insert(
            sid.clone(),
            Server {
                sid: sid.clone(),
                name: name.clone(),
                desc: desc.clone(),
                hops: 1,
                link_to: Some(self.net.sid.clone()),
                via: Some(id),
                capabs: capabs.clone(),
                gcap_seen: true,
                local: Some(id),
            },
        );
        self.net.local_servers.insert(
            id,
            LocalServer {
                conn: client.conn,
                sid: sid.clone(),
                name: name.clone(),
                bursting: true,
                got_ping: false,
                got_pong: false,
                burst_started: std::time::Instant::now(),
                capabs,
            },
        );

        info!(name = %name, sid = %sid, "Server link established");
        self.oper_notice(&format!("Link with {name} established"));

        // Tell the rest of the mesh about the new server.
        let intro = Message::new("SID", [name.as_str(), "2", sid.as_str(), desc.as_str()])
            .with_prefix(self.net.sid.clone());
        self.propagate(Some(id), &intro);
        let gcap_list = {
            let mut caps: Vec<&str> = self
                .net
                .servers[&sid]
                .capabs
                .iter()
                .map(String::as_str)
                .collect();
            caps.sort_unstable();
            caps.join(" ")
        };
        let gcap =
            Message::new("ENCAP", ["*", "GCAP", gcap_list.as_str()]).with_prefix(sid.clone());
        self.propagate(Some(id), &gcap);

        // Burst our view of the network, then open the completion
        // handshake.
        self.send_burst(id);
        let ping = Message::new("PING", [self.net.name.clone(), sid])
            .with_prefix(self.net.sid.clone());
        self.send_to(id, ping);
    }

    /// Close a pre-registration connection for a handshake failure.
    pub(crate) fn fail_registration(&mut self, id: ClientId, reason: &str) {
        self.send_to(
            id,
            Message::new("ERROR", [format!("Closing Link: {reason}")]),
        );
        self.net.clients.remove(&id);
        debug!(client = id, reason, "Registration failed");
    }
}
