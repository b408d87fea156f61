use serde::Deserialize;
use std::collections::BTreeMap;

/// Raw YAML representation of the device credentials file (`device.yml`).
///
/// Everything is optional here; which keys are required depends on the mode
/// the loader derives (provisioning vs. configured device, broker overlay).
/// Unknown keys land in `extras` so they survive the provisioning merge.
#[derive(Debug, Deserialize)]
pub struct RawDeviceConfig {
    #[serde(rename = "deviceId")]
    pub device_id: Option<String>,
    pub token: Option<String>,
    #[serde(rename = "credentialSecret")]
    pub credential_secret: Option<String>,
    #[serde(rename = "forgeURL")]
    pub forge_url: Option<String>,

    #[serde(rename = "provisioningToken")]
    pub provisioning_token: Option<String>,
    #[serde(rename = "provisioningTeam")]
    pub provisioning_team: Option<String>,

    #[serde(rename = "brokerURL")]
    pub broker_url: Option<String>,
    #[serde(rename = "brokerUsername")]
    pub broker_username: Option<String>,
    #[serde(rename = "brokerPassword")]
    pub broker_password: Option<String>,

    #[serde(rename = "httpNodeAuth")]
    pub http_node_auth: Option<RawHttpNodeAuth>,

    #[serde(flatten)]
    pub extras: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Deserialize)]
pub struct RawHttpNodeAuth {
    pub user: Option<String>,
    pub pass: Option<String>,
}
