//! TOML configuration for an endpoint: identity, topology, transport
//! tuning, and credentials.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use midi2_core::topology::{DeviceIdentity, EndpointTopology, FunctionBlock};
use midi2_network::{AuthMethod, SessionConfig};

/// Application configuration loaded from config.toml.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Config {
    /// Name this endpoint announces in invitations and discovery.
    pub endpoint_name: String,
    /// Product instance id reported by discovery (default: empty).
    pub product_instance_id: Option<String>,
    /// UDP port to listen on when serving (default: ephemeral).
    pub listen_port: Option<u16>,
    /// Default group for MIDI1-shaped helpers (default: 0).
    pub group: Option<u8>,
    /// Shared secret for session authentication.
    pub shared_secret: Option<String>,
    /// Username:password credentials; both or neither.
    pub username: Option<String>,
    pub password: Option<String>,
    /// Outstanding command window (default 128, minimum 64).
    pub outstanding_window: Option<usize>,
    /// How many earlier commands ride along in each datagram (default 2).
    pub fec_depth: Option<usize>,
    #[serde(default)]
    pub device_identity: DeviceIdentity,
    #[serde(default)]
    pub function_blocks: Vec<FunctionBlock>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            endpoint_name: "midi2net".into(),
            product_instance_id: None,
            listen_port: None,
            group: None,
            shared_secret: None,
            username: None,
            password: None,
            outstanding_window: None,
            fec_depth: None,
            device_identity: DeviceIdentity::default(),
            function_blocks: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.as_ref().display()))?;
        let config: Config = toml::from_str(&content).context("parsing config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.username.is_some() != self.password.is_some() {
            anyhow::bail!("username and password must be configured together");
        }
        if self.shared_secret.is_some() && self.username.is_some() {
            anyhow::bail!("configure either shared_secret or username/password, not both");
        }
        if let Some(group) = self.group {
            if group > 15 {
                anyhow::bail!("group {group} out of range 0..=15");
            }
        }
        if let Some(window) = self.outstanding_window {
            if window < 64 {
                anyhow::bail!("outstanding_window {window} below the minimum of 64");
            }
        }
        self.topology()
            .validate()
            .map_err(|reason| anyhow::anyhow!("invalid topology: {reason}"))
    }

    pub fn auth(&self) -> Option<AuthMethod> {
        if let Some(secret) = &self.shared_secret {
            return Some(AuthMethod::SharedSecret(secret.clone()));
        }
        match (&self.username, &self.password) {
            (Some(user), Some(password)) => Some(AuthMethod::UserPassword {
                user: user.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }

    pub fn group(&self) -> u8 {
        self.group.unwrap_or(0)
    }

    pub fn session_config(&self) -> SessionConfig {
        let defaults = SessionConfig::default();
        SessionConfig {
            endpoint_name: self.endpoint_name.clone(),
            auth: self.auth(),
            outstanding_window: self.outstanding_window.unwrap_or(defaults.outstanding_window),
            fec_depth: self.fec_depth.unwrap_or(defaults.fec_depth),
            ..defaults
        }
    }

    /// The topology this endpoint serves to discovery queries.
    pub fn topology(&self) -> EndpointTopology {
        EndpointTopology {
            name: self.endpoint_name.clone(),
            product_instance_id: self.product_instance_id.clone().unwrap_or_default(),
            device_identity: self.device_identity.clone(),
            function_blocks: self.function_blocks.clone(),
            ..EndpointTopology::default()
        }
    }
}
