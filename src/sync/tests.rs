//! End-to-end scenarios for the server-to-server engine, driven through
//! the event loop with in-memory queues. No sockets: handlers are
//! synchronous, so every scenario is deterministic.

use std::sync::Arc;

use mesh_proto::Message;

use crate::config::Config;
use crate::daemon::Daemon;
use crate::event::{send_queue, Event, NewClient, SendQueue};
use crate::state::{ClientId, ClientIdAllocator};
use crate::sync::users::{resolve_collision, Collision};

fn test_config(name: &str, sid: &str) -> Config {
    let raw = format!(
        r#"
[server]
name = "{name}"
sid = "{sid}"
description = "test server"

[listen]
host = "127.0.0.1"
port = 6667

[[opers]]
name = "admin"
password = "operpass"

[[links]]
name = "peer1.example"
hostname = "127.0.0.1"
port = 7001
password = "linkpass"

[[links]]
name = "peer2.example"
hostname = "127.0.0.1"
port = 7002
password = "linkpass"

[[links]]
name = "hub.example"
hostname = "127.0.0.1"
port = 7003
password = "linkpass"
"#
    );
    toml::from_str(&raw).unwrap()
}

fn test_daemon() -> Daemon {
    test_daemon_named("hub.example", "8B4")
}

fn test_daemon_named(name: &str, sid: &str) -> Daemon {
    let (events_tx, _events_rx) = tokio::sync::mpsc::unbounded_channel();
    Daemon::new(
        test_config(name, sid),
        "/nonexistent/meshircd.toml".to_string(),
        Arc::new(ClientIdAllocator::new()),
        events_tx,
    )
}

/// Attach a connection with no socket; the test keeps the queue side.
fn attach(d: &mut Daemon) -> (ClientId, SendQueue) {
    let id = d.ids.next();
    let (handle, queue) = send_queue();
    d.handle_event(Event::NewClient(NewClient {
        id,
        handle,
        io: None,
        host: "host.example".to_string(),
        ip: "10.0.0.1".to_string(),
        tls: false,
        link: None,
    }));
    (id, queue)
}

fn feed(d: &mut Daemon, id: ClientId, raw: &str) {
    d.handle_event(Event::Message(id, raw.parse::<Message>().unwrap()));
}

fn drain(queue: &mut SendQueue) -> Vec<Message> {
    std::iter::from_fn(|| queue.try_recv()).collect()
}

fn commands<'a>(msgs: &'a [Message], command: &str) -> Vec<&'a Message> {
    msgs.iter().filter(|m| m.command == command).collect()
}

fn register_user(d: &mut Daemon, nick: &str) -> (ClientId, SendQueue, String) {
    let (id, mut queue) = attach(d);
    feed(d, id, &format!("NICK {nick}"));
    feed(d, id, &format!("USER {nick} 0 * :{nick} Real"));
    let uid = d.net.local_users[&id].uid.clone();
    drain(&mut queue);
    (id, queue, uid)
}

fn link_server(d: &mut Daemon, sid: &str, name: &str) -> (ClientId, SendQueue) {
    let (id, queue) = attach(d);
    feed(d, id, &format!("PASS linkpass TS 6 {sid}"));
    feed(d, id, "CAPAB :QS ENCAP TB");
    feed(d, id, &format!("SERVER {name} 1 :test peer"));
    feed(
        d,
        id,
        &format!("SVINFO 6 6 0 :{}", chrono::Utc::now().timestamp()),
    );
    assert!(
        d.net.local_servers.contains_key(&id),
        "link handshake should promote the connection"
    );
    (id, queue)
}

// ----------------------------------------------------------------------
// Registration and handshake
// ----------------------------------------------------------------------

#[test]
fn welcome_burst_on_registration() {
    let mut d = test_daemon();
    let (id, mut queue) = attach(&mut d);
    feed(&mut d, id, "NICK alice");
    feed(&mut d, id, "USER alice 0 * :Alice Real");

    let msgs = drain(&mut queue);
    let codes: Vec<&str> = msgs.iter().map(|m| m.command.as_str()).collect();
    assert_eq!(codes[..4], ["001", "002", "003", "004"]);
    assert!(codes.contains(&"422"), "no MOTD configured");
    assert!(d.net.local_users.contains_key(&id));
    d.net.assert_coherent();
}

#[test]
fn bad_link_password_is_refused() {
    let mut d = test_daemon();
    let (id, mut queue) = attach(&mut d);
    feed(&mut d, id, "PASS wrong TS 6 3CC");
    feed(&mut d, id, "CAPAB :QS ENCAP");
    feed(&mut d, id, "SERVER peer1.example 1 :test peer");

    let msgs = drain(&mut queue);
    assert_eq!(commands(&msgs, "ERROR").len(), 1);
    assert!(!d.net.clients.contains_key(&id));
    assert!(d.net.local_servers.is_empty());
}

#[test]
fn missing_capab_is_refused() {
    let mut d = test_daemon();
    let (id, mut queue) = attach(&mut d);
    feed(&mut d, id, "PASS linkpass TS 6 3CC");
    feed(&mut d, id, "CAPAB :QS");
    feed(&mut d, id, "SERVER peer1.example 1 :test peer");

    let msgs = drain(&mut queue);
    assert_eq!(commands(&msgs, "ERROR").len(), 1);
    assert!(d.net.local_servers.is_empty());
}

#[test]
fn burst_completion_needs_ping_and_pong() {
    let mut d = test_daemon();
    let (id, mut queue) = link_server(&mut d, "2AA", "peer1.example");
    drain(&mut queue);
    assert!(d.net.local_servers[&id].bursting);

    // Peer's end-of-burst PING; we reply PONG and mark got-PING.
    feed(&mut d, id, ":2AA PING peer1.example 8B4");
    assert!(d.net.local_servers[&id].bursting);
    let msgs = drain(&mut queue);
    assert_eq!(commands(&msgs, "PONG").len(), 1);

    // Peer answers our PING: burst over.
    feed(&mut d, id, ":2AA PONG peer1.example 8B4");
    assert!(!d.net.local_servers[&id].bursting);
}

// ----------------------------------------------------------------------
// S1: burst completeness
// ----------------------------------------------------------------------

#[test]
fn s1_burst_carries_users_channels_and_topics() {
    let mut d = test_daemon();
    let (aid, mut aq, alice_uid) = register_user(&mut d, "alice");
    feed(&mut d, aid, "JOIN #x");
    feed(&mut d, aid, "TOPIC #x :the topic");
    drain(&mut aq);
    {
        let chan = d.net.channels.get_mut("#x").unwrap();
        chan.ts = 500;
        chan.topic.as_mut().unwrap().set_at = 800;
    }

    let (_pid, mut pq) = link_server(&mut d, "2AA", "peer1.example");
    let burst = drain(&mut pq);

    // Our side of the handshake precedes the burst.
    assert_eq!(burst[0].command, "PASS");
    assert_eq!(burst[1].command, "CAPAB");
    assert_eq!(burst[2].command, "SERVER");
    assert_eq!(burst[3].command, "SVINFO");

    // No other servers exist, so no SID lines.
    assert!(commands(&burst, "SID").is_empty());

    let uids = commands(&burst, "UID");
    assert_eq!(uids.len(), 1);
    let uid_msg = uids[0];
    assert_eq!(uid_msg.prefix.as_deref(), Some("8B4"));
    assert_eq!(uid_msg.params[0], "alice");
    assert_eq!(uid_msg.params[1], "1");
    assert_eq!(uid_msg.params[7], alice_uid);

    let sjoins = commands(&burst, "SJOIN");
    assert_eq!(sjoins.len(), 1);
    assert_eq!(sjoins[0].params[0], "500");
    assert_eq!(sjoins[0].params[1], "#x");
    assert_eq!(sjoins[0].params[2], "+ns");
    assert_eq!(sjoins[0].params[3], alice_uid);

    // Peer advertised TB, channel has a topic.
    let tbs = commands(&burst, "TB");
    assert_eq!(tbs.len(), 1);
    assert_eq!(tbs[0].params[0], "#x");
    assert_eq!(tbs[0].params[1], "800");
    assert_eq!(tbs[0].params[3], "the topic");

    // Burst closes with our end-of-burst PING.
    assert_eq!(burst.last().unwrap().command, "PING");
    assert_eq!(burst.last().unwrap().params[1], "2AA");
}

// ----------------------------------------------------------------------
// Nick collisions (S3 and the truth table)
// ----------------------------------------------------------------------

#[test]
fn collision_truth_table() {
    assert_eq!(resolve_collision(50, 100), Collision::ExistingLoses);
    assert_eq!(resolve_collision(100, 100), Collision::BothLose);
    assert_eq!(resolve_collision(150, 100), Collision::IncomingLoses);
}

#[test]
fn s3_equal_timestamps_kill_both() {
    let mut d = test_daemon();
    let (p1, mut q1) = link_server(&mut d, "1AA", "peer1.example");
    let (p2, mut q2) = link_server(&mut d, "2AA", "peer2.example");
    let (vid, mut vq, _v) = register_user(&mut d, "vera");

    feed(&mut d, p1, ":1AA UID bob 1 100 +i bob host.remote 0 1AAAAAAAA :Bob");
    feed(&mut d, p1, ":1AA SJOIN 500 #r +ns :1AAAAAAAA");
    feed(&mut d, vid, "JOIN #r");
    drain(&mut q1);
    drain(&mut q2);
    drain(&mut vq);

    feed(&mut d, p2, ":2AA UID bob 1 100 +i bob host.remote 0 2AAAAAAAB :Bob");

    assert!(!d.net.users.contains_key("1AAAAAAAA"));
    assert!(!d.net.users.contains_key("2AAAAAAAB"));
    assert!(!d.net.nicks.contains_key("bob"));

    // Both links hear both kills; the losing UID itself is not relayed.
    for q in [&mut q1, &mut q2] {
        let msgs = drain(q);
        let kills = commands(&msgs, "KILL");
        let mut targets: Vec<&str> = kills.iter().map(|k| k.params[0].as_str()).collect();
        targets.sort_unstable();
        assert_eq!(targets, vec!["1AAAAAAAA", "2AAAAAAAB"]);
        assert!(kills.iter().all(|k| k.params[1].contains("both killed")));
        assert!(commands(&msgs, "UID").is_empty());
    }

    // The local observer sees the incumbent quit.
    let msgs = drain(&mut vq);
    let quits = commands(&msgs, "QUIT");
    assert_eq!(quits.len(), 1);
    assert!(quits[0].prefix.as_deref().unwrap().starts_with("bob!"));
    assert!(quits[0].params[0].starts_with("Killed ("));

    d.net.assert_coherent();
}

#[test]
fn older_incoming_nick_wins_collision() {
    let mut d = test_daemon();
    let (p1, mut q1) = link_server(&mut d, "1AA", "peer1.example");
    feed(&mut d, p1, ":1AA UID bob 1 200 +i bob host.remote 0 1AAAAAAAA :Bob");
    drain(&mut q1);

    let (p2, mut q2) = link_server(&mut d, "2AA", "peer2.example");
    drain(&mut q2);
    feed(&mut d, p2, ":2AA UID bob 1 100 +i bob host.remote 0 2AAAAAAAB :Bob");

    assert!(!d.net.users.contains_key("1AAAAAAAA"), "incumbent killed");
    assert_eq!(d.net.nicks["bob"], "2AAAAAAAB");
    d.net.assert_coherent();
}

#[test]
fn newer_incoming_nick_loses_collision() {
    let mut d = test_daemon();
    let (p1, mut q1) = link_server(&mut d, "1AA", "peer1.example");
    feed(&mut d, p1, ":1AA UID bob 1 100 +i bob host.remote 0 1AAAAAAAA :Bob");
    drain(&mut q1);

    let (p2, _q2) = link_server(&mut d, "2AA", "peer2.example");
    feed(&mut d, p2, ":2AA UID bob 1 200 +i bob host.remote 0 2AAAAAAAB :Bob");

    assert!(d.net.users.contains_key("1AAAAAAAA"), "incumbent survives");
    assert!(!d.net.users.contains_key("2AAAAAAAB"));
    assert_eq!(d.net.nicks["bob"], "1AAAAAAAA");

    // The origin of the loser is told to drop it.
    let msgs = drain(&mut q1);
    let kills = commands(&msgs, "KILL");
    assert_eq!(kills.len(), 1);
    assert_eq!(kills[0].params[0], "2AAAAAAAB");
    d.net.assert_coherent();
}

// ----------------------------------------------------------------------
// S4: split cleanup
// ----------------------------------------------------------------------

#[test]
fn s4_split_removes_subtree_and_quits_users() {
    let mut d = test_daemon();
    let (p1, mut q1) = link_server(&mut d, "1AA", "peer1.example");
    feed(&mut d, p1, ":1AA SID s2.example 2 2BB :server two");
    feed(&mut d, p1, ":2BB ENCAP * GCAP :QS ENCAP TB");
    feed(&mut d, p1, ":2BB UID u1 2 1000 +i u1 h1 0 2BBAAAAAA :U One");
    feed(&mut d, p1, ":2BB UID u2 2 1000 +i u2 h2 0 2BBAAAAAB :U Two");
    feed(&mut d, p1, ":1AA SJOIN 500 #r +ns :2BBAAAAAA 2BBAAAAAB");
    let (vid, mut vq, vera_uid) = register_user(&mut d, "vera");
    feed(&mut d, vid, "JOIN #r");
    drain(&mut vq);
    drain(&mut q1);

    feed(&mut d, p1, "ERROR :going down");

    assert!(!d.net.servers.contains_key("1AA"));
    assert!(!d.net.servers.contains_key("2BB"));
    assert!(d.net.local_servers.is_empty());
    assert!(!d.net.users.contains_key("2BBAAAAAA"));
    assert!(!d.net.users.contains_key("2BBAAAAAB"));

    // One QUIT per lost user, bodied "<upstream> <lost>".
    let msgs = drain(&mut vq);
    let quits = commands(&msgs, "QUIT");
    assert_eq!(quits.len(), 2);
    for quit in &quits {
        assert_eq!(quit.params[0], "hub.example peer1.example");
    }

    // The channel survives with just the local member.
    let chan = &d.net.channels["#r"];
    assert_eq!(chan.members.len(), 1);
    assert!(chan.members.contains(&vera_uid));
    d.net.assert_coherent();
}

// ----------------------------------------------------------------------
// S5: flood control
// ----------------------------------------------------------------------

#[test]
fn s5_token_bucket_defers_and_drains() {
    let mut d = test_daemon();
    let (aid, mut aq, _uid) = register_user(&mut d, "alice");

    for _ in 0..15 {
        feed(&mut d, aid, "PING x");
    }
    {
        let lu = &d.net.local_users[&aid];
        assert_eq!(lu.bucket.tokens(), 0);
        assert_eq!(lu.queue.len(), 5);
    }
    assert_eq!(commands(&drain(&mut aq), "PONG").len(), 10);

    d.handle_event(Event::Tick);
    {
        let lu = &d.net.local_users[&aid];
        assert_eq!(lu.bucket.tokens(), 0);
        assert_eq!(lu.queue.len(), 4);
    }
    assert_eq!(commands(&drain(&mut aq), "PONG").len(), 1);

    for _ in 0..4 {
        d.handle_event(Event::Tick);
    }
    assert!(d.net.local_users[&aid].queue.is_empty());
    assert_eq!(commands(&drain(&mut aq), "PONG").len(), 4);
}

#[test]
fn excess_flood_disconnects() {
    let mut d = test_daemon();
    let (aid, mut aq, _uid) = register_user(&mut d, "alice");

    for _ in 0..60 {
        feed(&mut d, aid, "PING x");
    }
    assert!(
        !d.net.local_users.contains_key(&aid),
        "user dropped for excess flood"
    );
    let msgs = drain(&mut aq);
    let errors = commands(&msgs, "ERROR");
    assert_eq!(errors.len(), 1);
    assert!(errors[0].params[0].contains("Excess flood"));
    d.net.assert_coherent();
}

// ----------------------------------------------------------------------
// S6: channel message routing
// ----------------------------------------------------------------------

#[test]
fn s6_channel_privmsg_fans_out_once_per_link() {
    let mut d = test_daemon();
    let (p1, mut q1) = link_server(&mut d, "1AA", "peer1.example");
    let (p2, mut q2) = link_server(&mut d, "2AA", "peer2.example");
    let (aid, mut aq, _a) = register_user(&mut d, "ann");
    let (sid, mut sq, src_uid) = register_user(&mut d, "src");

    feed(&mut d, p1, ":1AA UID rb 1 1000 +i rb h 0 1AAAAAAAB :R B");
    feed(&mut d, p1, ":1AA UID rd 1 1000 +i rd h 0 1AAAAAAAD :R D");
    feed(&mut d, p2, ":2AA UID rc 1 1000 +i rc h 0 2AAAAAAAC :R C");
    feed(&mut d, p1, ":1AA SJOIN 600 #m +ns :1AAAAAAAB 1AAAAAAAD");
    feed(&mut d, p2, ":2AAAAAAAC JOIN 600 #m +");
    feed(&mut d, aid, "JOIN #m");
    feed(&mut d, sid, "JOIN #m");
    drain(&mut q1);
    drain(&mut q2);
    drain(&mut aq);
    drain(&mut sq);

    feed(&mut d, sid, "PRIVMSG #m :hi");

    let to_ann = commands(&drain(&mut aq), "PRIVMSG")
        .into_iter()
        .cloned()
        .collect::<Vec<_>>();
    assert_eq!(to_ann.len(), 1);
    assert_eq!(to_ann[0].params, vec!["#m", "hi"]);
    assert!(to_ann[0].prefix.as_deref().unwrap().starts_with("src!"));

    assert!(
        commands(&drain(&mut sq), "PRIVMSG").is_empty(),
        "sender does not echo"
    );

    // Exactly one copy per link, UID-prefixed.
    for q in [&mut q1, &mut q2] {
        let msgs = drain(q);
        let relayed = commands(&msgs, "PRIVMSG");
        assert_eq!(relayed.len(), 1);
        assert_eq!(relayed[0].prefix.as_deref(), Some(src_uid.as_str()));
    }
}

// ----------------------------------------------------------------------
// TB accept/reject
// ----------------------------------------------------------------------

#[test]
fn tb_adopts_only_older_or_first_topics() {
    let mut d = test_daemon();
    let (p1, mut q1) = link_server(&mut d, "1AA", "peer1.example");
    feed(&mut d, p1, ":1AA UID bob 1 100 +i bob h 0 1AAAAAAAA :Bob");
    feed(&mut d, p1, ":1AA SJOIN 500 #x +ns :1AAAAAAAA");
    drain(&mut q1);

    // No topic yet: adopted.
    feed(&mut d, p1, ":1AA TB #x 800 setter!u@h :first");
    assert_eq!(d.net.channels["#x"].topic.as_ref().unwrap().text, "first");

    // Newer than ours: ignored.
    feed(&mut d, p1, ":1AA TB #x 900 setter!u@h :newer");
    assert_eq!(d.net.channels["#x"].topic.as_ref().unwrap().text, "first");

    // Older than ours: adopted.
    feed(&mut d, p1, ":1AA TB #x 700 setter!u@h :older");
    let topic = d.net.channels["#x"].topic.clone().unwrap();
    assert_eq!(topic.text, "older");
    assert_eq!(topic.set_at, 700);
}

// ----------------------------------------------------------------------
// Idempotent duplicate delivery
// ----------------------------------------------------------------------

#[test]
fn duplicate_uid_sid_and_sjoin_are_idempotent() {
    let mut d = test_daemon();
    let (p1, mut q1) = link_server(&mut d, "1AA", "peer1.example");

    let uid_line = ":1AA UID bob 1 100 +i bob h 0 1AAAAAAAA :Bob";
    let sid_line = ":1AA SID s2.example 2 2BB :server two";
    let sjoin_line = ":1AA SJOIN 500 #r +ns :1AAAAAAAA";
    for line in [uid_line, sid_line, sjoin_line] {
        feed(&mut d, p1, line);
    }
    drain(&mut q1);
    let users = d.net.users.len();
    let servers = d.net.servers.len();
    let members = d.net.channels["#r"].members.len();

    for line in [uid_line, sid_line, sjoin_line] {
        feed(&mut d, p1, line);
    }

    assert_eq!(d.net.users.len(), users);
    assert_eq!(d.net.servers.len(), servers);
    assert_eq!(d.net.channels["#r"].members.len(), members);
    assert!(
        commands(&drain(&mut q1), "KILL").is_empty(),
        "duplicates are not collisions"
    );
    d.net.assert_coherent();
}

// ----------------------------------------------------------------------
// Burst-then-reverse-burst convergence
// ----------------------------------------------------------------------

#[test]
fn burst_reverse_burst_converges() {
    let mut a = test_daemon();
    let (aid, mut aq, _alice) = register_user(&mut a, "alice");
    let (_bid2, mut bq2, _bob) = register_user(&mut a, "bob");
    feed(&mut a, aid, "JOIN #x");
    drain(&mut aq);
    drain(&mut bq2);

    let (_pid, mut pq) = link_server(&mut a, "9ZZ", "peer1.example");
    let burst = drain(&mut pq);

    // Replay A's burst into a fresh daemon B linked to A.
    let mut b = test_daemon_named("leaf.example", "9ZZ");
    let (link_id, mut lq) = link_server(&mut b, "8B4", "hub.example");
    drain(&mut lq);
    for msg in burst {
        if matches!(
            msg.command.as_str(),
            "UID" | "SJOIN" | "TB" | "AWAY" | "SID" | "ENCAP"
        ) {
            b.handle_event(Event::Message(link_id, msg));
        }
    }

    // B's reverse burst (already sent during its handshake) was empty, so
    // agreement means B adopted exactly A's users and memberships.
    for (uid, user) in &a.net.users {
        let mirrored = b.net.users.get(uid).expect("user survived the burst");
        assert_eq!(mirrored.nick, user.nick);
        assert_eq!(mirrored.nick_ts, user.nick_ts);
    }
    assert_eq!(a.net.users.len(), b.net.users.len());

    let a_chan = &a.net.channels["#x"];
    let b_chan = &b.net.channels["#x"];
    assert_eq!(a_chan.ts, b_chan.ts);
    assert_eq!(a_chan.members, b_chan.members);
    b.net.assert_coherent();
}

// ----------------------------------------------------------------------
// K-lines over ENCAP
// ----------------------------------------------------------------------

#[test]
fn encap_kline_applies_and_propagates() {
    let mut d = test_daemon();
    let (p1, mut q1) = link_server(&mut d, "1AA", "peer1.example");
    let (p2, mut q2) = link_server(&mut d, "2AA", "peer2.example");
    let (bid, mut bq, _b) = register_user(&mut d, "bad");
    drain(&mut q1);
    drain(&mut q2);

    feed(&mut d, p1, ":1AA ENCAP * KLINE 0 bad * :spam");

    assert_eq!(d.net.klines.len(), 1);
    assert!(!d.net.local_users.contains_key(&bid), "matching user dropped");
    let msgs = drain(&mut bq);
    assert!(commands(&msgs, "ERROR")[0].params[0].contains("K-lined"));

    // Split-horizon: the other link hears the ENCAP, the ingress does not.
    assert_eq!(commands(&drain(&mut q2), "ENCAP").len(), 1);
    assert!(commands(&drain(&mut q1), "ENCAP").is_empty());

    // Same masks again: deduplicated.
    feed(&mut d, p2, ":2AA ENCAP * KLINE 0 bad * :spam again");
    assert_eq!(d.net.klines.len(), 1);
}

// ----------------------------------------------------------------------
// Remote rename fan-out
// ----------------------------------------------------------------------

#[test]
fn remote_nick_change_notifies_channel_peers_once() {
    let mut d = test_daemon();
    let (p1, mut q1) = link_server(&mut d, "1AA", "peer1.example");
    feed(&mut d, p1, ":1AA UID bob 1 100 +i bob h 0 1AAAAAAAA :Bob");
    feed(&mut d, p1, ":1AA SJOIN 500 #a +ns :1AAAAAAAA");
    feed(&mut d, p1, ":1AA SJOIN 500 #b +ns :1AAAAAAAA");
    let (vid, mut vq, _v) = register_user(&mut d, "vera");
    feed(&mut d, vid, "JOIN #a");
    feed(&mut d, vid, "JOIN #b");
    drain(&mut vq);
    drain(&mut q1);

    feed(&mut d, p1, ":1AAAAAAAA NICK robert 150");

    assert_eq!(d.net.nicks["robert"], "1AAAAAAAA");
    assert!(!d.net.nicks.contains_key("bob"));

    // Two shared channels, one notification.
    let msgs = drain(&mut vq);
    let nicks = commands(&msgs, "NICK");
    assert_eq!(nicks.len(), 1);
    assert!(nicks[0].prefix.as_deref().unwrap().starts_with("bob!"));
    assert_eq!(nicks[0].params[0], "robert");
    d.net.assert_coherent();
}
