//! Cross-field configuration validation, run before startup completes.

use mesh_proto::valid::is_valid_sid;

use super::types::Config;
use crate::error::ConfigError;

/// Validate a loaded configuration. All problems are reported at once.
pub fn validate(config: &Config) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();
    let mut invalid = |msg: String| errors.push(ConfigError::Invalid(msg));

    if !is_valid_sid(&config.server.sid) {
        invalid(format!(
            "server.sid {:?} is not a valid SID (three uppercase alphanumerics)",
            config.server.sid
        ));
    }

    if config.server.name.is_empty() || !config.server.name.contains('.') {
        invalid(format!(
            "server.name {:?} must be a fully qualified name",
            config.server.name
        ));
    }

    if config.listen.port.is_none() && config.listen.tls_port.is_none() {
        invalid("no listener configured: set listen.port and/or listen.tls_port".to_string());
    }

    if config.listen.tls_port.is_some() && config.tls.is_none() {
        invalid("listen.tls_port requires a [tls] section with cert_file and key_file".to_string());
    }

    for link in &config.links {
        if link.name.is_empty() || link.password.is_empty() {
            invalid(format!("link {:?} needs a name and a password", link.name));
        }
        if let Some(sid) = &link.sid {
            if !is_valid_sid(sid) {
                invalid(format!("link {:?} has invalid sid {:?}", link.name, sid));
            }
            if sid == &config.server.sid {
                invalid(format!("link {:?} reuses our own SID", link.name));
            }
        }
        if link.name == config.server.name {
            invalid(format!("link {:?} points at ourselves", link.name));
        }
    }

    for oper in &config.opers {
        if oper.name.is_empty() || oper.password.is_empty() {
            invalid("oper blocks need a name and a password".to_string());
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
