//! The authoritative maps of the mesh, owned by the event loop.

use std::collections::{HashMap, HashSet};

use mesh_proto::irc_to_lower;

use crate::state::{Channel, ClientId, Conn, KLine, LocalClient, LocalServer, LocalUser, Server, User};

/// Capabilities we advertise on server links.
pub const OUR_CAPABS: [&str; 3] = ["QS", "ENCAP", "TB"];

/// Capabilities a peer must advertise to link at all.
pub const REQUIRED_CAPABS: [&str; 2] = ["QS", "ENCAP"];

#[derive(Debug)]
pub struct Network {
    /// Our own identity (also present in `servers`).
    pub sid: String,
    pub name: String,
    pub desc: String,

    /// Pre-registration connections.
    pub clients: HashMap<ClientId, LocalClient>,
    /// Registered local user connections.
    pub local_users: HashMap<ClientId, LocalUser>,
    /// Registered server links.
    pub local_servers: HashMap<ClientId, LocalServer>,

    /// Every live user on the mesh, by UID.
    pub users: HashMap<String, User>,
    /// Folded nick → UID.
    pub nicks: HashMap<String, String>,
    /// UIDs carrying umode `o`.
    pub opers: HashSet<String>,
    /// Every live server, by SID (including ourselves).
    pub servers: HashMap<String, Server>,
    /// Folded channel name → channel.
    pub channels: HashMap<String, Channel>,

    pub klines: Vec<KLine>,
}

impl Network {
    pub fn new(sid: impl Into<String>, name: impl Into<String>, desc: impl Into<String>) -> Self {
        let sid = sid.into();
        let name = name.into();
        let desc = desc.into();

        let mut servers = HashMap::new();
        servers.insert(
            sid.clone(),
            Server {
                sid: sid.clone(),
                name: name.clone(),
                desc: desc.clone(),
                hops: 0,
                link_to: None,
                via: None,
                capabs: OUR_CAPABS.iter().map(|s| s.to_string()).collect(),
                gcap_seen: true,
                local: None,
            },
        );

        Self {
            sid,
            name,
            desc,
            clients: HashMap::new(),
            local_users: HashMap::new(),
            local_servers: HashMap::new(),
            users: HashMap::new(),
            nicks: HashMap::new(),
            opers: HashSet::new(),
            servers,
            channels: HashMap::new(),
            klines: Vec::new(),
        }
    }

    /// Map key for a channel name.
    pub fn channel_key(name: &str) -> String {
        irc_to_lower(name)
    }

    /// The connection record for an id, whatever its promotion state.
    pub fn conn_mut(&mut self, id: ClientId) -> Option<&mut Conn> {
        if let Some(client) = self.clients.get_mut(&id) {
            return Some(&mut client.conn);
        }
        if let Some(user) = self.local_users.get_mut(&id) {
            return Some(&mut user.conn);
        }
        self.local_servers.get_mut(&id).map(|s| &mut s.conn)
    }

    pub fn user_by_nick(&self, nick: &str) -> Option<&User> {
        let uid = self.nicks.get(&irc_to_lower(nick))?;
        self.users.get(uid)
    }

    pub fn server_by_name(&self, name: &str) -> Option<&Server> {
        self.servers.values().find(|s| s.name == name)
    }

    /// All directly linked server connection ids.
    pub fn local_server_ids(&self) -> Vec<ClientId> {
        self.local_servers.keys().copied().collect()
    }

    /// Add `uid` to a channel, keeping both sides of the membership
    /// relation. Returns false when the user was already a member.
    pub fn add_member(&mut self, key: &str, uid: &str) -> bool {
        let Some(channel) = self.channels.get_mut(key) else {
            return false;
        };
        if !channel.members.insert(uid.to_string()) {
            return false;
        }
        if let Some(user) = self.users.get_mut(uid) {
            user.channels.insert(key.to_string());
        }
        true
    }

    /// Remove `uid` from a channel; destroys the channel when it empties.
    /// Returns true when the channel was destroyed.
    pub fn remove_member(&mut self, key: &str, uid: &str) -> bool {
        if let Some(user) = self.users.get_mut(uid) {
            user.channels.remove(key);
        }
        let Some(channel) = self.channels.get_mut(key) else {
            return false;
        };
        channel.members.remove(uid);
        if channel.members.is_empty() {
            self.channels.remove(key);
            return true;
        }
        false
    }

    /// Connection ids of the local members of a channel.
    pub fn local_members(&self, key: &str) -> Vec<ClientId> {
        let Some(channel) = self.channels.get(key) else {
            return Vec::new();
        };
        channel
            .members
            .iter()
            .filter_map(|uid| self.users.get(uid))
            .filter_map(|user| user.local)
            .collect()
    }

    /// Connection ids of local users sharing at least one channel with
    /// `uid`, each exactly once, excluding `uid` itself.
    pub fn shared_channel_local_ids(&self, uid: &str) -> Vec<ClientId> {
        let Some(user) = self.users.get(uid) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for key in &user.channels {
            if let Some(channel) = self.channels.get(key) {
                for member in &channel.members {
                    if member == uid {
                        continue;
                    }
                    if let Some(local) = self.users.get(member).and_then(|u| u.local) {
                        if seen.insert(local) {
                            out.push(local);
                        }
                    }
                }
            }
        }
        out
    }

    /// Delete a user from every authoritative map: users, nicks, opers,
    /// and all channel member sets (destroying emptied channels).
    pub fn remove_user_entry(&mut self, uid: &str) -> Option<User> {
        let user = self.users.remove(uid)?;

        let fold = irc_to_lower(&user.nick);
        if self.nicks.get(&fold).map(String::as_str) == Some(uid) {
            self.nicks.remove(&fold);
        }
        self.opers.remove(uid);

        for key in &user.channels {
            if let Some(channel) = self.channels.get_mut(key) {
                channel.members.remove(uid);
                if channel.members.is_empty() {
                    self.channels.remove(key);
                }
            }
        }

        Some(user)
    }

    /// The target SID plus every SID whose `link_to` chain passes through
    /// it. Used for split cleanup.
    pub fn downstream_sids(&self, target: &str) -> Vec<String> {
        let mut result = Vec::new();
        let mut work = vec![target.to_string()];
        let mut seen = HashSet::new();

        while let Some(current) = work.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            result.push(current.clone());

            for server in self.servers.values() {
                if server.link_to.as_deref() == Some(current.as_str())
                    && !seen.contains(&server.sid)
                {
                    work.push(server.sid.clone());
                }
            }
        }

        result
    }

    /// Check the structural invariants of the state. Test support; cheap
    /// enough to run after every scenario step.
    pub fn assert_coherent(&self) {
        for (fold, uid) in &self.nicks {
            let user = self.users.get(uid).expect("nick maps to a live user");
            assert_eq!(
                &irc_to_lower(&user.nick),
                fold,
                "nick map key is the fold of the display nick"
            );
        }
        for (uid, user) in &self.users {
            assert_eq!(&user.uid, uid);
            assert_eq!(
                self.nicks.get(&irc_to_lower(&user.nick)),
                Some(uid),
                "every user is reachable through the nick map"
            );
            assert_eq!(
                self.opers.contains(uid),
                user.modes.oper,
                "oper index mirrors umode o"
            );
            assert_eq!(
                user.is_local(),
                user.sid == self.sid,
                "local users belong to us"
            );
            for key in &user.channels {
                let channel = self.channels.get(key).expect("membership points at a live channel");
                assert!(channel.members.contains(uid));
            }
        }
        for (key, channel) in &self.channels {
            assert!(!channel.members.is_empty(), "no empty channels");
            assert_eq!(key, &Self::channel_key(&channel.name));
            for uid in &channel.members {
                let user = self.users.get(uid).expect("member is a live user");
                assert!(user.channels.contains(key));
            }
        }
        for server in self.servers.values() {
            assert_eq!(
                server.is_local(),
                server.local.map(|id| self.local_servers.contains_key(&id)) == Some(true),
                "local back-pointers are live"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network() -> Network {
        Network::new("8B4", "hub.example", "test hub")
    }

    fn insert_user(net: &mut Network, uid: &str, nick: &str) {
        net.users.insert(
            uid.to_string(),
            User {
                uid: uid.to_string(),
                nick: nick.to_string(),
                nick_ts: 1000,
                hops: 1,
                username: nick.to_string(),
                host: "host.example".into(),
                ip: "0".into(),
                realname: nick.to_string(),
                modes: Default::default(),
                away: None,
                channels: HashSet::new(),
                sid: uid[..3].to_string(),
                link: None,
                local: None,
                tls: false,
                signon_ts: 1000,
            },
        );
        net.nicks.insert(irc_to_lower(nick), uid.to_string());
    }

    #[test]
    fn membership_is_symmetric() {
        let mut net = network();
        insert_user(&mut net, "2AAAAAAAB", "alice");
        net.channels
            .insert("#x".into(), Channel::new("#x", 500));

        assert!(net.add_member("#x", "2AAAAAAAB"));
        assert!(!net.add_member("#x", "2AAAAAAAB"));
        assert!(net.users["2AAAAAAAB"].channels.contains("#x"));
        net.assert_coherent();

        assert!(net.remove_member("#x", "2AAAAAAAB"));
        assert!(!net.channels.contains_key("#x"));
        net.assert_coherent();
    }

    #[test]
    fn remove_user_entry_cleans_all_maps() {
        let mut net = network();
        insert_user(&mut net, "2AAAAAAAB", "alice");
        insert_user(&mut net, "2AAAAAAAC", "bob");
        net.channels.insert("#x".into(), Channel::new("#x", 500));
        net.add_member("#x", "2AAAAAAAB");
        net.add_member("#x", "2AAAAAAAC");

        let removed = net.remove_user_entry("2AAAAAAAB").unwrap();
        assert_eq!(removed.nick, "alice");
        assert!(!net.nicks.contains_key("alice"));
        assert!(net.channels.contains_key("#x"));
        net.assert_coherent();

        net.remove_user_entry("2AAAAAAAC");
        assert!(net.channels.is_empty());
        net.assert_coherent();
    }

    #[test]
    fn downstream_closure_follows_link_chains() {
        let mut net = network();
        for (sid, link_to) in [("1AA", Some("8B4")), ("2BB", Some("1AA")), ("3CC", Some("2BB")), ("4DD", Some("8B4"))] {
            net.servers.insert(
                sid.to_string(),
                Server {
                    sid: sid.to_string(),
                    name: format!("{sid}.example"),
                    desc: String::new(),
                    hops: 1,
                    link_to: link_to.map(str::to_string),
                    via: Some(7),
                    capabs: HashSet::new(),
                    gcap_seen: true,
                    local: None,
                },
            );
        }

        let mut lost = net.downstream_sids("1AA");
        lost.sort();
        assert_eq!(lost, vec!["1AA", "2BB", "3CC"]);
    }
}
