use std::fs;
use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// The session core's own slice of global settings.
///
/// This is deliberately narrow: it does not attempt to model the wider PBX
/// configuration file. ACL rules and device/line configuration remain
/// external collaborators reached through their own traits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    pub bind_addr: String,
    pub keepalive_secs: u64,
    pub tos: u8,
    pub cos: u8,
    pub token_backoff_ms: u64,
    /// Promoted from the source's hard-coded wireless-model special case
    /// (§9 design notes): extra percentage points of keepalive slack for
    /// device types [`sccp_collab::DeviceHandle::keepalive_slack_percent`]
    /// reports as non-zero, on top of the base 10%.
    pub wireless_keepalive_bonus_percent: u32,
    pub write_backoff_us: u64,
    pub session_device_cleanup_secs: u64,
    pub accept_retries: u32,
    pub accept_retry_wait_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:2000".to_owned(),
            keepalive_secs: 60,
            tos: 0xB8,
            cos: 4,
            token_backoff_ms: 60_000,
            wireless_keepalive_bonus_percent: 10,
            write_backoff_us: 500,
            session_device_cleanup_secs: 10,
            accept_retries: 5,
            accept_retry_wait_secs: 2,
        }
    }
}

impl SessionConfig {
    /// Load from a TOML file, falling back to [`Default`] for any field the
    /// file omits. A missing file is not an error; it yields the default
    /// configuration.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.display().to_string(),
                    source: e,
                });
            }
        };
        toml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            source: e,
        })
    }

    pub fn bind_socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.bind_addr
            .parse()
            .map_err(|_| ConfigError::BadBindAddr(self.bind_addr.clone()))
    }

    /// Listener sweep period: `5 x keepalive`, per §4.3.
    #[must_use]
    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.keepalive_secs * 5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_bind_addr_parses() {
        let cfg = SessionConfig::default();
        assert!(cfg.bind_socket_addr().is_ok());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = SessionConfig::load(Path::new("/nonexistent/path/sccp.toml")).unwrap();
        assert_eq!(cfg, SessionConfig::default());
    }

    #[test]
    fn partial_toml_overlays_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sccp.toml");
        fs::write(&path, "keepalive_secs = 30\n").unwrap();
        let cfg = SessionConfig::load(&path).unwrap();
        assert_eq!(cfg.keepalive_secs, 30);
        assert_eq!(cfg.tos, SessionConfig::default().tos);
    }

    #[test]
    fn malformed_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sccp.toml");
        fs::write(&path, "keepalive_secs = [this is not toml\n").unwrap();
        assert!(matches!(
            SessionConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
