use std::collections::BTreeMap;
use std::path::Path;

use tracing::debug;

use crate::error::ConfigError;
use crate::raw::RawDeviceConfig;

// ── Validated configuration ───────────────────────────────────────────────────

/// A validated device configuration record.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub forge_url: String,
    /// Bearer token for all platform HTTP calls. In provisioning mode this is
    /// the provisioning token.
    pub token: String,
    pub mode: ConfigMode,
    /// Present when `brokerURL` was supplied; selects the broker transport.
    pub broker: Option<BrokerConfig>,
    pub http_node_auth: Option<HttpNodeAuth>,
}

#[derive(Debug, Clone)]
pub enum ConfigMode {
    /// One-time provisioning bootstrap. Non-credential keys are preserved so
    /// they can be merged into the post-provisioning device file.
    Provisioning {
        team: String,
        extras: BTreeMap<String, serde_yaml::Value>,
    },
    /// A fully configured device.
    Device {
        device_id: String,
        credential_secret: String,
    },
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub url: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct HttpNodeAuth {
    pub user: String,
    pub pass: String,
}

impl DeviceConfig {
    pub fn provisioning_mode(&self) -> bool {
        matches!(self.mode, ConfigMode::Provisioning { .. })
    }

    pub fn device_id(&self) -> Option<&str> {
        match &self.mode {
            ConfigMode::Device { device_id, .. } => Some(device_id),
            ConfigMode::Provisioning { .. } => None,
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

/// Read and validate the device credentials file.
pub fn load_device_config(path: &Path) -> Result<DeviceConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    parse_device_config(&content, path)
}

/// Validate device file content. Collects every missing key rather than
/// failing on the first.
pub fn parse_device_config(content: &str, path: &Path) -> Result<DeviceConfig, ConfigError> {
    if content.trim().is_empty() {
        return Err(ConfigError::Empty {
            path: path.display().to_string(),
        });
    }

    let raw: RawDeviceConfig =
        serde_yaml::from_str(content).map_err(|e| ConfigError::YamlParse {
            path: path.display().to_string(),
            source: e,
        })?;

    let mut missing: Vec<String> = Vec::new();
    let mut require = |key: &str, value: &Option<String>| -> String {
        match value {
            Some(v) if !v.is_empty() => v.clone(),
            _ => {
                missing.push(key.to_string());
                String::new()
            }
        }
    };

    let provisioning = raw.provisioning_token.is_some();
    let (forge_url, token, mode) = if provisioning {
        let forge_url = require("forgeURL", &raw.forge_url);
        let token = require("provisioningToken", &raw.provisioning_token);
        let team = require("provisioningTeam", &raw.provisioning_team);
        debug!("device file is in provisioning mode");
        (
            forge_url,
            token,
            ConfigMode::Provisioning {
                team,
                extras: raw.extras,
            },
        )
    } else {
        let forge_url = require("forgeURL", &raw.forge_url);
        let token = require("token", &raw.token);
        let device_id = require("deviceId", &raw.device_id);
        let credential_secret = require("credentialSecret", &raw.credential_secret);
        (
            forge_url,
            token,
            ConfigMode::Device {
                device_id,
                credential_secret,
            },
        )
    };

    let broker = match &raw.broker_url {
        Some(url) if !url.is_empty() => {
            let username = require("brokerUsername", &raw.broker_username);
            let password = require("brokerPassword", &raw.broker_password);
            Some(BrokerConfig {
                url: url.clone(),
                username,
                password,
            })
        }
        _ => None,
    };

    let http_node_auth = match raw.http_node_auth {
        Some(auth) => {
            let user = require("httpNodeAuth.user", &auth.user);
            let pass = require("httpNodeAuth.pass", &auth.pass);
            Some(HttpNodeAuth { user, pass })
        }
        None => None,
    };

    if !missing.is_empty() {
        return Err(ConfigError::Invalid {
            path: path.display().to_string(),
            missing,
        });
    }

    Ok(DeviceConfig {
        forge_url,
        token,
        mode,
        broker,
        http_node_auth,
    })
}
