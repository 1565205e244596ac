//! Server-to-server channel state: SJOIN, JOIN, PART, topics, INVITE.
//!
//! Channel conflicts are settled the same way nick conflicts are: the
//! older timestamp wins. When both sides know a channel, the TS is
//! clamped down to the older of the two; member sets merge.

use mesh_proto::valid::is_channel_name;
use mesh_proto::Message;
use tracing::debug;

use crate::daemon::Daemon;
use crate::error::LinkError;
use crate::state::{Channel, ClientId, Network, Topic};

impl Daemon {
    /// Create a channel or clamp its TS down to an older incoming one.
    /// Returns the map key.
    fn create_or_clamp(&mut self, name: &str, incoming_ts: i64) -> String {
        let key = Network::channel_key(name);
        match self.net.channels.get_mut(&key) {
            Some(channel) => {
                if incoming_ts < channel.ts {
                    channel.ts = incoming_ts;
                }
            }
            None => {
                self.net
                    .channels
                    .insert(key.clone(), Channel::new(name, incoming_ts));
            }
        }
        key
    }

    /// `:<sid> SJOIN <chanTS> <name> <modes> [mode params] :<uids>`
    ///
    /// Status prefixes (`@`, `+`) on members are stripped; membership is
    /// flat. A member UID we have never heard of is skipped, not fatal -
    /// it may have just lost a collision we resolved first.
    pub(crate) fn s_sjoin(&mut self, id: ClientId, msg: &Message) -> Result<(), LinkError> {
        if !self.check_params(id, msg, 4) {
            return Ok(());
        }
        self.server_source_sid(msg)?;
        let ts: i64 = msg.params[0]
            .parse()
            .map_err(|_| LinkError::Violation(format!("Bad channel TS {}", msg.params[0])))?;
        let name = msg.params[1].clone();
        if !is_channel_name(&name) {
            debug!(name = %name, "SJOIN for invalid channel name");
            return Ok(());
        }

        let key = self.create_or_clamp(&name, ts);
        let member_list = msg.params[msg.params.len() - 1].clone();

        for raw in member_list.split_whitespace() {
            let uid = raw.trim_start_matches(['@', '+']);
            if !self.net.users.contains_key(uid) {
                debug!(uid = %uid, channel = %name, "SJOIN member unknown, skipping");
                continue;
            }
            self.join_and_inform(&key, uid);
        }

        // A merge may leave the channel empty of known members.
        if self
            .net
            .channels
            .get(&key)
            .map(|c| c.members.is_empty())
            .unwrap_or(false)
        {
            self.net.channels.remove(&key);
        }

        self.propagate(Some(id), msg);
        Ok(())
    }

    /// `:<uid> JOIN <chanTS> <channel> +`
    pub(crate) fn s_join(&mut self, id: ClientId, msg: &Message) -> Result<(), LinkError> {
        if !self.check_params(id, msg, 2) {
            return Ok(());
        }
        let uid = self.source_user_uid(msg)?;
        let ts: i64 = msg.params[0]
            .parse()
            .map_err(|_| LinkError::Violation(format!("Bad channel TS {}", msg.params[0])))?;
        let name = msg.params[1].clone();
        if !is_channel_name(&name) {
            debug!(name = %name, "JOIN for invalid channel name");
            return Ok(());
        }

        let key = self.create_or_clamp(&name, ts);
        self.join_and_inform(&key, &uid);

        self.propagate(Some(id), msg);
        Ok(())
    }

    /// Add a member and tell the local members about it.
    fn join_and_inform(&mut self, key: &str, uid: &str) {
        if !self.net.add_member(key, uid) {
            return;
        }
        let mask = self.net.users[uid].nickmask();
        let display = self.net.channels[key].name.clone();
        let join = Message::new("JOIN", [display]).with_prefix(mask);

        let joiner_local = self.net.users[uid].local;
        for member in self.net.local_members(key) {
            if Some(member) == joiner_local {
                continue;
            }
            self.send_to(member, join.clone());
        }
    }

    /// `:<uid> PART <channel> [:message]`
    pub(crate) fn s_part(&mut self, id: ClientId, msg: &Message) -> Result<(), LinkError> {
        if !self.check_params(id, msg, 1) {
            return Ok(());
        }
        let uid = self.source_user_uid(msg)?;
        let name = msg.params[0].clone();
        let key = Network::channel_key(&name);
        if !self.net.channels.contains_key(&key) {
            debug!(name = %name, "PART for unknown channel");
            return Ok(());
        }

        let mask = self.net.users[&uid].nickmask();
        let display = self.net.channels[&key].name.clone();
        let mut params = vec![display];
        if let Some(reason) = msg.param(1) {
            params.push(reason.to_string());
        }
        let part = Message::new("PART", params).with_prefix(mask);
        for member in self.net.local_members(&key) {
            self.send_to(member, part.clone());
        }

        self.net.remove_member(&key, &uid);
        self.propagate(Some(id), msg);
        Ok(())
    }

    /// `:<sid> TB <channel> <topicTS> [setter] :<topic>` - topic burst.
    /// Adopted only when we have no topic, or theirs is older.
    pub(crate) fn s_tb(&mut self, id: ClientId, msg: &Message) -> Result<(), LinkError> {
        if !self.check_params(id, msg, 3) {
            return Ok(());
        }
        let source_sid = self.server_source_sid(msg)?;
        let name = msg.params[0].clone();
        let key = Network::channel_key(&name);
        let Some(channel) = self.net.channels.get(&key) else {
            debug!(name = %name, "TB for unknown channel");
            return Ok(());
        };

        let topic_ts: i64 = msg.params[1]
            .parse()
            .map_err(|_| LinkError::Violation(format!("Bad topic TS {}", msg.params[1])))?;
        let source_name = self
            .net
            .servers
            .get(&source_sid)
            .map(|s| s.name.clone())
            .unwrap_or(source_sid);
        let (setter, text) = if msg.params.len() >= 4 {
            (msg.params[2].clone(), msg.params[3].clone())
        } else {
            (source_name.clone(), msg.params[2].clone())
        };

        let accept = match &channel.topic {
            None => true,
            Some(current) => topic_ts < current.set_at,
        };
        if accept {
            self.set_topic(&key, &text, &setter, topic_ts, &source_name);
        }

        self.propagate(Some(id), msg);
        Ok(())
    }

    /// `:<uid> TOPIC <channel> [:topic]` - a user-sourced topic change is
    /// trusted unconditionally.
    pub(crate) fn s_topic(&mut self, id: ClientId, msg: &Message) -> Result<(), LinkError> {
        if !self.check_params(id, msg, 1) {
            return Ok(());
        }
        let uid = self.source_user_uid(msg)?;
        let name = msg.params[0].clone();
        let key = Network::channel_key(&name);
        if !self.net.channels.contains_key(&key) {
            debug!(name = %name, "TOPIC for unknown channel");
            return Ok(());
        }

        let mask = self.net.users[&uid].nickmask();
        let text = msg.param(1).unwrap_or("").to_string();
        self.set_topic(&key, &text, &mask, chrono::Utc::now().timestamp(), &mask);

        self.propagate(Some(id), msg);
        Ok(())
    }

    /// Adopt a topic (empty text clears it) and inform local members.
    pub(crate) fn set_topic(
        &mut self,
        key: &str,
        text: &str,
        setter: &str,
        set_at: i64,
        notify_prefix: &str,
    ) {
        let Some(channel) = self.net.channels.get_mut(key) else {
            return;
        };
        let display = channel.name.clone();
        if text.is_empty() {
            channel.topic = None;
        } else {
            channel.topic = Some(Topic {
                text: text.to_string(),
                set_by: setter.to_string(),
                set_at,
            });
        }

        let notice = Message::new("TOPIC", [display.as_str(), text])
            .with_prefix(notify_prefix.to_string());
        for member in self.net.local_members(key) {
            self.send_to(member, notice.clone());
        }
    }

    /// `:<src-uid> INVITE <target-uid> <channel> [chanTS]`
    ///
    /// The TS, when present, sits at parameter index 2; an invite from a
    /// newer incarnation of the channel than ours is stale and dropped.
    pub(crate) fn s_invite(&mut self, id: ClientId, msg: &Message) -> Result<(), LinkError> {
        if !self.check_params(id, msg, 2) {
            return Ok(());
        }
        let src = self.source_user_uid(msg)?;
        let target = msg.params[0].clone();
        let name = msg.params[1].clone();
        let key = Network::channel_key(&name);
        let Some(channel) = self.net.channels.get(&key) else {
            debug!(name = %name, "INVITE for unknown channel");
            return Ok(());
        };

        if let Some(ts) = msg.param(2) {
            if let Ok(ts) = ts.parse::<i64>() {
                if ts > channel.ts {
                    debug!(name = %name, "Dropping INVITE from newer channel incarnation");
                    return Ok(());
                }
            }
        }
        let display = channel.name.clone();

        let Some((target_local, target_link, target_nick)) = self
            .net
            .users
            .get(&target)
            .map(|u| (u.local, u.link, u.nick.clone()))
        else {
            debug!(target = %target, "INVITE for unknown target");
            return Ok(());
        };

        if let Some(local) = target_local {
            let mask = self.net.users[&src].nickmask();
            let invite = Message::new("INVITE", [target_nick, display]).with_prefix(mask);
            self.send_to(local, invite);
        } else if let Some(link) = target_link {
            if link != id {
                self.send_to(link, msg.clone());
            }
        }
        Ok(())
    }
}
