//! Burst generation: the state dump sent to a freshly linked peer.
//!
//! Order matters. Servers go first, sorted by hop count so every
//! `link_to` reference precedes its dependents, each followed by the GCAP
//! carrying its capability set. Users follow (their servers are all known
//! by then), then channels as SJOINs packed up to the line limit, with a
//! TB when the peer can take topics.

use mesh_proto::Message;
use tracing::debug;

use crate::daemon::Daemon;
use crate::state::channel::CHANNEL_MODES;
use crate::state::ClientId;

impl Daemon {
    /// Send our complete view of the mesh to a just-promoted peer.
    pub(crate) fn send_burst(&mut self, peer_id: ClientId) {
        let Some(peer) = self.net.local_servers.get(&peer_id) else {
            return;
        };
        let peer_sid = peer.sid.clone();
        let peer_takes_tb = peer.has_capab("TB");

        let mut burst: Vec<Message> = Vec::new();

        // Servers, nearest first, skipping ourselves (the handshake's
        // SERVER already introduced us) and the peer's own entry.
        let mut servers: Vec<_> = self
            .net
            .servers
            .values()
            .filter(|s| s.sid != self.net.sid && s.sid != peer_sid)
            .collect();
        servers.sort_by_key(|s| s.hops);

        for server in &servers {
            let hops = (server.hops + 1).to_string();
            burst.push(
                Message::new(
                    "SID",
                    [
                        server.name.as_str(),
                        hops.as_str(),
                        server.sid.as_str(),
                        server.desc.as_str(),
                    ],
                )
                .with_prefix(self.net.sid.clone()),
            );
            let mut caps: Vec<&str> = server.capabs.iter().map(String::as_str).collect();
            caps.sort_unstable();
            let caps = caps.join(" ");
            burst.push(
                Message::new("ENCAP", ["*", "GCAP", caps.as_str()])
                    .with_prefix(server.sid.clone()),
            );
        }

        // Every known user, prefixed by its owning server.
        for user in self.net.users.values() {
            let hops = (user.hops + 1).to_string();
            let nick_ts = user.nick_ts.to_string();
            let modes = user.modes.to_string();
            burst.push(
                Message::new(
                    "UID",
                    [
                        user.nick.as_str(),
                        hops.as_str(),
                        nick_ts.as_str(),
                        modes.as_str(),
                        user.username.as_str(),
                        user.host.as_str(),
                        user.ip.as_str(),
                        user.uid.as_str(),
                        user.realname.as_str(),
                    ],
                )
                .with_prefix(user.sid.clone()),
            );
            if let Some(away) = &user.away {
                burst.push(
                    Message::new("AWAY", [away.clone()]).with_prefix(user.uid.clone()),
                );
            }
        }

        // Channels, membership packed to the line limit.
        for channel in self.net.channels.values() {
            burst.extend(pack_sjoin(
                &self.net.sid,
                &channel.name,
                channel.ts,
                channel.members.iter().map(String::as_str),
            ));
            if peer_takes_tb {
                if let Some(topic) = &channel.topic {
                    let set_at = topic.set_at.to_string();
                    burst.push(
                        Message::new(
                            "TB",
                            [
                                channel.name.as_str(),
                                set_at.as_str(),
                                topic.set_by.as_str(),
                                topic.text.as_str(),
                            ],
                        )
                        .with_prefix(self.net.sid.clone()),
                    );
                }
            }
        }

        debug!(peer = %peer_sid, lines = burst.len(), "Sending burst");
        for msg in burst {
            self.send_to(peer_id, msg);
        }
    }
}

/// Pack one channel's members into as few SJOIN frames as the line limit
/// permits. Each member appears exactly once; frame order is not
/// significant.
pub(crate) fn pack_sjoin<'a>(
    our_sid: &str,
    channel: &str,
    ts: i64,
    members: impl Iterator<Item = &'a str>,
) -> Vec<Message> {
    let ts = ts.to_string();
    let base = Message::new("SJOIN", [ts.as_str(), channel, CHANNEL_MODES, ""])
        .with_prefix(our_sid.to_string());
    let base_len = base.encoded_len();

    let mut frames = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_len = base_len;

    let flush = |frames: &mut Vec<Message>, current: &mut Vec<&str>| {
        if current.is_empty() {
            return;
        }
        let list = current.join(" ");
        frames.push(
            Message::new("SJOIN", [ts.as_str(), channel, CHANNEL_MODES, list.as_str()])
                .with_prefix(our_sid.to_string()),
        );
        current.clear();
    };

    for member in members {
        let extra = if current.is_empty() {
            member.len()
        } else {
            member.len() + 1
        };
        if current_len + extra > mesh_proto::MAX_LINE_LEN && !current.is_empty() {
            flush(&mut frames, &mut current);
            current_len = base_len;
        }
        current_len += if current.is_empty() {
            member.len()
        } else {
            member.len() + 1
        };
        current.push(member);
    }
    flush(&mut frames, &mut current);

    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_frame_when_it_fits() {
        let members = ["8B4AAAAAA", "8B4AAAAAB", "8B4AAAAAC"];
        let frames = pack_sjoin("8B4", "#x", 500, members.into_iter());
        assert_eq!(frames.len(), 1);
        assert!(frames[0].encoded_len() <= mesh_proto::MAX_LINE_LEN);
        let list = frames[0].params.last().unwrap();
        assert_eq!(list.split_whitespace().count(), 3);
    }

    #[test]
    fn packs_large_memberships_within_limit() {
        // 200 nine-byte UIDs ≈ 2000 bytes of members; at least 5 frames.
        let members: Vec<String> = (0..200).map(|i| format!("8B4A{:05}", i)).collect();
        let frames = pack_sjoin("8B4", "#c", 500, members.iter().map(String::as_str));

        assert!(frames.len() >= 5, "got {} frames", frames.len());
        for frame in &frames {
            assert!(frame.encoded_len() <= mesh_proto::MAX_LINE_LEN);
        }

        let mut seen: Vec<&str> = frames
            .iter()
            .flat_map(|f| f.params.last().unwrap().split_whitespace())
            .collect();
        seen.sort_unstable();
        let mut expected: Vec<&str> = members.iter().map(String::as_str).collect();
        expected.sort_unstable();
        assert_eq!(seen, expected, "every member exactly once");
    }

    #[test]
    fn empty_membership_produces_no_frames() {
        let frames = pack_sjoin("8B4", "#x", 500, std::iter::empty());
        assert!(frames.is_empty());
    }
}
