//! Configuration loading and rehash.
//!
//! The file is TOML, parsed once at startup and again on SIGHUP. Rehash
//! replaces only the mutable tables (MOTD, opers, links, per-user
//! overrides); listener addresses, the SID, the server name, and TLS
//! material are fixed for the process lifetime.

mod types;
mod validation;

pub use types::{
    Config, LinkBlock, ListenConfig, OperBlock, ServerConfig, TimeoutConfig, TlsConfig,
    UserOverride, DEFAULT_SENDQ,
};
pub use validation::validate;

use std::path::Path;

use crate::error::ConfigError;

impl Config {
    /// Read and parse the configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(toml::from_str(&raw)?)
    }

    /// Adopt the rehashable parts of a newly loaded configuration.
    pub fn rehash_from(&mut self, new: Config) {
        self.motd = new.motd;
        self.opers = new.opers;
        self.links = new.links;
        self.users = new.users;
    }

    /// Resolve the MOTD lines, if a MOTD file is configured and readable.
    pub fn load_motd(&self) -> Option<Vec<String>> {
        let path = self.motd.as_ref()?;
        match std::fs::read_to_string(path) {
            Ok(content) => Some(content.lines().map(str::to_string).collect()),
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "Failed to read MOTD file");
                None
            }
        }
    }

    /// The per-user override matching `user@host`, if any.
    pub fn user_override(&self, username: &str, host: &str) -> Option<&UserOverride> {
        let userhost = format!("{}@{}", username, host);
        self.users
            .iter()
            .find(|u| mesh_proto::wildcard_match(&u.mask, &userhost))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    const MINIMAL: &str = r#"
[server]
name = "irc.example.net"
sid = "8B4"
description = "example server"

[listen]
host = "127.0.0.1"
port = 6667
"#;

    #[test]
    fn loads_minimal_config() {
        let file = write_config(MINIMAL);
        let conf = Config::load(file.path()).unwrap();
        assert_eq!(conf.server.sid, "8B4");
        assert_eq!(conf.listen.port, Some(6667));
        assert!(conf.opers.is_empty());
        assert_eq!(conf.timeouts.ping_time, 120);
        validate(&conf).unwrap();
    }

    #[test]
    fn loads_tables() {
        let file = write_config(&format!(
            "{MINIMAL}
[[opers]]
name = \"admin\"
password = \"hunter2\"

[[links]]
name = \"peer.example.net\"
hostname = \"10.0.0.2\"
port = 7000
password = \"linkpass\"
autoconnect = true

[[users]]
mask = \"*@trusted.example\"
flood_exempt = true
"
        ));
        let conf = Config::load(file.path()).unwrap();
        assert_eq!(conf.opers[0].name, "admin");
        assert!(conf.links[0].autoconnect);
        assert!(conf
            .user_override("anyone", "trusted.example")
            .unwrap()
            .flood_exempt);
        assert!(conf.user_override("anyone", "elsewhere.example").is_none());
    }

    #[test]
    fn rehash_replaces_only_mutable_fields() {
        let file = write_config(MINIMAL);
        let mut conf = Config::load(file.path()).unwrap();

        let file2 = write_config(&MINIMAL.replace("8B4", "9ZZ").replace("6667", "7000"));
        let mut new = Config::load(file2.path()).unwrap();
        new.opers.push(OperBlock {
            name: "late".into(),
            password: "pw".into(),
        });

        conf.rehash_from(new);
        assert_eq!(conf.server.sid, "8B4");
        assert_eq!(conf.listen.port, Some(6667));
        assert_eq!(conf.opers.len(), 1);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(Config::load("/nonexistent/meshircd.toml").is_err());
    }
}
