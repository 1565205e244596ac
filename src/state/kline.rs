//! Runtime K-lines.
//!
//! K-lines live for the lifetime of the process only; there is no ban
//! database. Matching is the protocol-level wildcard match over the
//! user and host parts separately.

use mesh_proto::wildcard_match;

#[derive(Debug, Clone)]
pub struct KLine {
    pub user: String,
    pub host: String,
    pub reason: String,
}

impl KLine {
    pub fn matches(&self, username: &str, host: &str) -> bool {
        wildcard_match(&self.user, username) && wildcard_match(&self.host, host)
    }

    /// Two K-lines are the same ban when both masks agree.
    pub fn same_mask(&self, user: &str, host: &str) -> bool {
        self.user == user && self.host == host
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kline(user: &str, host: &str) -> KLine {
        KLine {
            user: user.into(),
            host: host.into(),
            reason: "spam".into(),
        }
    }

    #[test]
    fn matches_user_and_host_independently() {
        let k = kline("*bad*", "*.example.net");
        assert!(k.matches("baduser", "shell.example.net"));
        assert!(!k.matches("gooduser", "shell.example.net"));
        assert!(!k.matches("baduser", "shell.example.org"));
    }

    #[test]
    fn mask_identity() {
        let k = kline("bad", "host");
        assert!(k.same_mask("bad", "host"));
        assert!(!k.same_mask("bad", "other"));
    }
}
