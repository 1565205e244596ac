//! Split cleanup: losing a server means losing everything behind it.
//!
//! Given a departing server, the transitive closure of servers whose
//! `link_to` chain passes through it is computed, every user owned by a
//! lost server is removed (local observers hear one synthesized QUIT per
//! lost user, bodied `<upstream-name> <lost-name>`), emptied channels are
//! destroyed, and the lost servers leave the maps. No server-to-server
//! traffic is emitted here; the caller announces the SQUIT.

use std::collections::HashSet;

use tracing::info;

use crate::daemon::Daemon;
use crate::state::ClientId;

impl Daemon {
    /// Remove `sid` and its whole subtree from the mesh.
    pub(crate) fn split_server(&mut self, sid: &str, upstream_name: &str, lost_name: &str) {
        let lost: HashSet<String> = self.net.downstream_sids(sid).into_iter().collect();
        if lost.is_empty() {
            return;
        }

        let reason = format!("{upstream_name} {lost_name}");
        let affected: Vec<String> = self
            .net
            .users
            .values()
            .filter(|u| lost.contains(&u.sid))
            .map(|u| u.uid.clone())
            .collect();

        for uid in &affected {
            self.remove_remote_user(uid, &reason);
        }

        for lost_sid in &lost {
            if lost_sid == &self.net.sid {
                continue;
            }
            if let Some(server) = self.net.servers.remove(lost_sid) {
                if let Some(local_id) = server.local {
                    self.net.local_servers.remove(&local_id);
                }
            }
        }

        info!(
            sid = %sid,
            users = affected.len(),
            servers = lost.len(),
            "Split cleanup complete"
        );
    }

    /// Tear down a direct link: optionally send a closing ERROR, run
    /// split cleanup, and announce the SQUIT to the survivors.
    pub(crate) fn drop_server_link(
        &mut self,
        id: ClientId,
        comment: &str,
        send_error: Option<&str>,
    ) {
        let Some((sid, name)) = self
            .net
            .local_servers
            .get(&id)
            .map(|s| (s.sid.clone(), s.name.clone()))
        else {
            return;
        };

        if let Some(text) = send_error {
            let msg = mesh_proto::Message::new("ERROR", [text]);
            self.send_to(id, msg);
        }

        // Dropping the record closes the outbound queue; the write task
        // drains what is left and exits.
        self.net.local_servers.remove(&id);

        let our_name = self.net.name.clone();
        self.split_server(&sid, &our_name, &name);

        let squit = mesh_proto::Message::new("SQUIT", [sid.as_str(), comment])
            .with_prefix(self.net.sid.clone());
        self.propagate(None, &squit);

        self.oper_notice(&format!("Link with {name} dropped: {comment}"));
    }
}
