//! Users: local and remote.

use std::collections::HashSet;
use std::fmt;

use crate::state::ClientId;

/// Tracked user modes. `i` and `o` are network-significant; `C` opts an
/// operator into client-connect notices and is only settable while `+o`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserModes {
    pub invisible: bool,
    pub oper: bool,
    pub conn_notices: bool,
}

impl UserModes {
    /// Parse a `+io`-style mode word, ignoring characters we do not track.
    pub fn parse(word: &str) -> Self {
        let mut modes = UserModes::default();
        modes.apply(word);
        modes
    }

    /// Apply a `+i-o` change string; returns true when anything changed.
    pub fn apply(&mut self, changes: &str) -> bool {
        let before = *self;
        let mut adding = true;
        for c in changes.chars() {
            match c {
                '+' => adding = true,
                '-' => adding = false,
                'i' => self.invisible = adding,
                'o' => self.oper = adding,
                'C' => self.conn_notices = adding,
                _ => {}
            }
        }
        *self != before
    }
}

impl UserModes {
    /// The `+x-y` change string taking `from` to `self`; empty when the
    /// sets are equal.
    pub fn diff_from(&self, from: &UserModes) -> String {
        let mut plus = String::new();
        let mut minus = String::new();
        for (now, before, c) in [
            (self.invisible, from.invisible, 'i'),
            (self.oper, from.oper, 'o'),
            (self.conn_notices, from.conn_notices, 'C'),
        ] {
            if now && !before {
                plus.push(c);
            }
            if !now && before {
                minus.push(c);
            }
        }
        let mut out = String::new();
        if !plus.is_empty() {
            out.push('+');
            out.push_str(&plus);
        }
        if !minus.is_empty() {
            out.push('-');
            out.push_str(&minus);
        }
        out
    }
}

impl fmt::Display for UserModes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("+")?;
        if self.invisible {
            f.write_str("i")?;
        }
        if self.oper {
            f.write_str("o")?;
        }
        if self.conn_notices {
            f.write_str("C")?;
        }
        Ok(())
    }
}

/// One live user anywhere on the mesh.
#[derive(Debug, Clone)]
pub struct User {
    pub uid: String,
    /// Display nick; the nick map is keyed on its RFC 1459 fold.
    pub nick: String,
    /// Seconds since epoch at the nick's last change.
    pub nick_ts: i64,
    /// Hops from us; 0 for our own users.
    pub hops: u32,
    pub username: String,
    pub host: String,
    pub ip: String,
    pub realname: String,
    pub modes: UserModes,
    pub away: Option<String>,
    /// Channel keys (folded names) this user is a member of.
    pub channels: HashSet<String>,
    /// SID of the owning server.
    pub sid: String,
    /// The directly linked peer through which this user is reached;
    /// `None` for our own users.
    pub link: Option<ClientId>,
    /// Back-pointer into the local-user map; `None` for remote users.
    pub local: Option<ClientId>,
    pub tls: bool,
    pub signon_ts: i64,
}

impl User {
    pub fn is_local(&self) -> bool {
        self.local.is_some()
    }

    /// `nick!user@host`, the client-facing source of this user's messages.
    pub fn nickmask(&self) -> String {
        format!("{}!{}@{}", self.nick, self.username, self.host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_word_roundtrip() {
        let modes = UserModes::parse("+io");
        assert!(modes.invisible && modes.oper && !modes.conn_notices);
        assert_eq!(modes.to_string(), "+io");

        assert_eq!(UserModes::default().to_string(), "+");
    }

    #[test]
    fn diff_reflects_effective_change() {
        let before = UserModes::parse("+io");
        let mut after = before;
        after.oper = false;
        after.invisible = true;
        assert_eq!(after.diff_from(&before), "-o");

        let mut gained = before;
        gained.conn_notices = true;
        assert_eq!(gained.diff_from(&before), "+C");

        assert_eq!(before.diff_from(&before), "");
    }

    #[test]
    fn apply_handles_mixed_changes() {
        let mut modes = UserModes::parse("+io");
        assert!(modes.apply("-o+C"));
        assert!(!modes.oper);
        assert!(modes.conn_notices);

        // Untracked characters are ignored; no change reported.
        assert!(!modes.apply("+wx"));
    }
}
