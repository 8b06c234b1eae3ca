// Configuration schema for TEAP peer and server sessions.

use std::{
    env, fs,
    io::{self, Read},
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::Deserialize;
use thiserror::Error;

/// Error returned while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error when reading a configuration file from disk.
    #[error("failed to read config '{path}': {source}")]
    Io {
        /// Path that failed to read.
        path: PathBuf,
        /// Source IO error.
        #[source]
        source: io::Error,
    },
    /// Error when parsing the configuration contents.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    /// The configuration did not pass validation checks.
    #[error("invalid config: {0}")]
    Validation(String),
}

/// Which identity classes the server demands from the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IdentityPolicy {
    /// Accept whatever the peer offers.
    #[default]
    AllowAny,
    /// Require a user identity.
    User,
    /// Require a machine identity.
    Machine,
    /// Require a user round followed by a machine round.
    UserThenMachine,
    /// Ask for a user identity but accept a machine one.
    RequestUserAcceptAny,
}

/// PAC provisioning posture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningMode {
    /// Never provision.
    Disabled,
    /// Provision only inside a server-authenticated tunnel.
    #[default]
    Authenticated,
    /// Allow anonymous (DH-based) provisioning without a PAC.
    Anonymous,
}

/// Peer-side session configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Outer and inner identity presented to the server.
    pub identity: String,
    /// Password for Basic-Password-Auth requests; unset refuses them.
    pub password: Option<String>,
    pub provisioning: ProvisioningMode,
    /// Ask the server for a Tunnel PAC when none is held.
    pub request_tunnel_pac: bool,
    /// PAC store cap; oldest entries beyond it are evicted.
    pub pac_max_len: usize,
    /// Inner EAP types accepted, in preference order.
    pub allowed_inner_types: Vec<u8>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            identity: String::new(),
            password: None,
            provisioning: ProvisioningMode::default(),
            request_tunnel_pac: false,
            pac_max_len: 10,
            allowed_inner_types: vec![crate::inner::EAP_TYPE_MSCHAPV2],
        }
    }
}

impl PeerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.pac_max_len == 0 {
            return Err("pac_max_len must be at least 1".into());
        }
        Ok(())
    }
}

/// Server-side session configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Authority-ID advertised in the TEAP/Start outer TLV.
    pub authority_id: String,
    /// Human-readable authority description for PAC-Info.
    pub authority_id_info: String,
    pub identity_policy: IdentityPolicy,
    /// Force an extra final-result round after the last inner method.
    pub separate_final_result: bool,
    pub provisioning: ProvisioningMode,
    /// Lifetime of freshly provisioned PACs, in seconds.
    pub pac_lifetime_secs: u64,
    /// Remaining lifetime below which a refreshed PAC is pushed.
    pub pac_soft_refresh_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            authority_id: String::new(),
            authority_id_info: String::new(),
            identity_policy: IdentityPolicy::default(),
            separate_final_result: false,
            provisioning: ProvisioningMode::default(),
            pac_lifetime_secs: 7 * 24 * 3600,
            pac_soft_refresh_secs: 24 * 3600,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.authority_id.is_empty() {
            return Err("authority_id must be set".into());
        }
        if self.pac_soft_refresh_secs >= self.pac_lifetime_secs {
            return Err("pac_soft_refresh_secs must be below pac_lifetime_secs".into());
        }
        Ok(())
    }
}

/// Top-level configuration loaded at startup.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub peer: PeerConfig,
    pub server: ServerConfig,
}

impl Config {
    /// Loads configuration from `TEAPORT_CONFIG` if set, otherwise returns defaults.
    pub fn load() -> Result<Self, ConfigError> {
        match env::var("TEAPORT_CONFIG") {
            Ok(path) => Self::from_path(path),
            Err(_missing) => Ok(Self::default()),
        }
    }

    /// Loads a configuration file from the provided path.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref).map_err(|source| ConfigError::Io {
            path: path_ref.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Loads configuration from any reader implementing [`Read`].
    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self, ConfigError> {
        let mut buf = String::new();
        reader
            .read_to_string(&mut buf)
            .map_err(|source| ConfigError::Io {
                path: PathBuf::from("<reader>"),
                source,
            })?;
        Self::from_toml_str(&buf)
    }

    /// Loads configuration from a TOML string slice.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        <Self as FromStr>::from_str(input)
    }

    /// Validates both halves; the default server config is incomplete by
    /// design (no authority id) and only checked when actually used.
    pub fn validate_peer(&self) -> Result<(), ConfigError> {
        self.peer.validate().map_err(ConfigError::Validation)
    }

    pub fn validate_server(&self) -> Result<(), ConfigError> {
        self.server.validate().map_err(ConfigError::Validation)
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cfg: Self = toml::from_str(s)?;
        cfg.validate_peer()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid_for_peer() {
        let cfg = Config::default();
        cfg.validate_peer().expect("peer defaults");
    }

    #[test]
    fn parses_full_toml() {
        let cfg = Config::from_toml_str(
            r#"
            [peer]
            identity = "alice"
            password = "secret"
            provisioning = "anonymous"
            request_tunnel_pac = true
            pac_max_len = 4
            allowed_inner_types = [26, 52]

            [server]
            authority_id = "srv1"
            authority_id_info = "Example Server"
            identity_policy = "user_then_machine"
            pac_lifetime_secs = 3600
            pac_soft_refresh_secs = 600
            "#,
        )
        .expect("parse");
        assert_eq!(cfg.peer.identity, "alice");
        assert_eq!(cfg.peer.pac_max_len, 4);
        assert_eq!(cfg.peer.provisioning, ProvisioningMode::Anonymous);
        assert_eq!(cfg.server.identity_policy, IdentityPolicy::UserThenMachine);
        cfg.validate_server().expect("server config");
    }

    #[test]
    fn zero_pac_cap_rejected() {
        let result = Config::from_toml_str("[peer]\npac_max_len = 0\n");
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn soft_refresh_must_be_below_lifetime() {
        let cfg = Config::from_toml_str(
            "[server]\nauthority_id = \"srv\"\npac_lifetime_secs = 100\npac_soft_refresh_secs = 100\n",
        )
        .expect("parse");
        assert!(cfg.validate_server().is_err());
    }
}
