use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ── Reserved snapshot environment keys ────────────────────────────────────────

pub const ENV_SNAPSHOT_ID: &str = "FF_SNAPSHOT_ID";
pub const ENV_SNAPSHOT_NAME: &str = "FF_SNAPSHOT_NAME";
pub const ENV_DEVICE_ID: &str = "FF_DEVICE_ID";
pub const ENV_DEVICE_NAME: &str = "FF_DEVICE_NAME";
pub const ENV_DEVICE_TYPE: &str = "FF_DEVICE_TYPE";
pub const ENV_APPLICATION_ID: &str = "FF_APPLICATION_ID";
pub const ENV_APPLICATION_NAME: &str = "FF_APPLICATION_NAME";

/// Snapshot id the platform uses for an application-owned device that has
/// never had a snapshot deployed ("starter" assignment).
pub const SENTINEL_SNAPSHOT_ID: &str = "0";

/// The platform-reserved environment keys for a device with the given owner.
///
/// The launcher's view and the platform's view of these keys must agree while
/// in autonomous mode; divergence in any of them marks the device for reload
/// (project-owned) or a silent copy (application-owned).
pub fn reserved_env_keys(owner: OwnerType) -> &'static [&'static str] {
    match owner {
        OwnerType::Application => &[
            ENV_SNAPSHOT_ID,
            ENV_SNAPSHOT_NAME,
            ENV_DEVICE_ID,
            ENV_DEVICE_NAME,
            ENV_DEVICE_TYPE,
            ENV_APPLICATION_ID,
            ENV_APPLICATION_NAME,
        ],
        _ => &[
            ENV_SNAPSHOT_ID,
            ENV_SNAPSHOT_NAME,
            ENV_DEVICE_ID,
            ENV_DEVICE_NAME,
            ENV_DEVICE_TYPE,
        ],
    }
}

// ── Enums ─────────────────────────────────────────────────────────────────────

/// Platform-side entity the device is assigned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OwnerType {
    #[default]
    None,
    Project,
    Application,
}

impl std::fmt::Display for OwnerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OwnerType::None => write!(f, "none"),
            OwnerType::Project => write!(f, "project"),
            OwnerType::Application => write!(f, "application"),
        }
    }
}

/// Operating mode. In autonomous mode the platform's view is authoritative;
/// in developer mode the platform refrains from pushing updates and the
/// editor tunnel may be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    #[default]
    Autonomous,
    Developer,
}

impl std::fmt::Display for AgentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentMode::Autonomous => write!(f, "autonomous"),
            AgentMode::Developer => write!(f, "developer"),
        }
    }
}

/// The run states the device honors across restarts.
///
/// Strictly a subset of [`RunState`]; transition states are never persisted
/// as targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TargetState {
    #[default]
    Running,
    Suspended,
}

impl std::fmt::Display for TargetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetState::Running => write!(f, "running"),
            TargetState::Suspended => write!(f, "suspended"),
        }
    }
}

impl From<TargetState> for RunState {
    fn from(t: TargetState) -> RunState {
        match t {
            TargetState::Running => RunState::Running,
            TargetState::Suspended => RunState::Suspended,
        }
    }
}

/// The observable state reported to the platform.
///
/// Transitions (simplified):
///   Stopped → Loading → Installing → Starting → Running
///   Running → Safe | Crashed (launcher supervision)
///   Running → Stopping → Stopped | Updating | Restarting
///   any → Error (fetch/launch failure)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    #[default]
    Unknown,
    Provisioning,
    Stopped,
    Loading,
    Installing,
    Starting,
    Running,
    Safe,
    Crashed,
    Stopping,
    Updating,
    Restarting,
    Suspended,
    Error,
}

impl RunState {
    /// Transition states pass through the reconciler but are never persisted
    /// as target states.
    pub fn is_transition(&self) -> bool {
        matches!(
            self,
            RunState::Provisioning
                | RunState::Loading
                | RunState::Installing
                | RunState::Starting
                | RunState::Stopping
                | RunState::Updating
                | RunState::Restarting
        )
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::Unknown => "unknown",
            RunState::Provisioning => "provisioning",
            RunState::Stopped => "stopped",
            RunState::Loading => "loading",
            RunState::Installing => "installing",
            RunState::Starting => "starting",
            RunState::Running => "running",
            RunState::Safe => "safe",
            RunState::Crashed => "crashed",
            RunState::Stopping => "stopping",
            RunState::Updating => "updating",
            RunState::Restarting => "restarting",
            RunState::Suspended => "suspended",
            RunState::Error => "error",
        };
        write!(f, "{}", s)
    }
}

// ── Snapshot & settings ───────────────────────────────────────────────────────

/// The deployable artifact fetched from `GET live/snapshot`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Snapshot {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Opaque flow payload; the agent only ever compares and forwards it.
    #[serde(default)]
    pub flows: serde_json::Value,
    /// Module name → version spec.
    #[serde(default)]
    pub modules: BTreeMap<String, String>,
    /// Environment values, including the platform-reserved `FF_*` keys.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Runtime configuration overlay fetched from `GET live/settings`,
/// identified by a stable content hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub hash: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assistant: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_node_auth: Option<serde_json::Value>,
    /// Platform-private settings the agent passes through untouched.
    #[serde(flatten)]
    pub rest: BTreeMap<String, serde_json::Value>,
}

// ── Assignment ────────────────────────────────────────────────────────────────

/// The desired and currently-materialized assignment of the device.
///
/// Owned by the reconciler, mutated only inside its serialized critical
/// section, persisted as the on-disk assignment record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Assignment {
    pub owner_type: OwnerType,
    pub project: Option<String>,
    pub application: Option<String>,
    pub snapshot: Option<Snapshot>,
    pub settings: Option<Settings>,
    pub mode: AgentMode,
    pub target_state: TargetState,
    /// Tri-state: `None` = unknown.
    pub licensed: Option<bool>,
    pub editor_token: Option<String>,
    pub editor_affinity: Option<String>,
}

impl Assignment {
    /// Infer a missing owner type: project wins over application, else none.
    pub fn infer_owner_type(project: Option<&str>, application: Option<&str>) -> OwnerType {
        if project.is_some() {
            OwnerType::Project
        } else if application.is_some() {
            OwnerType::Application
        } else {
            OwnerType::None
        }
    }

    pub fn snapshot_id(&self) -> Option<&str> {
        self.snapshot.as_ref().map(|s| s.id.as_str())
    }

    pub fn settings_hash(&self) -> Option<&str> {
        self.settings.as_ref().map(|s| s.hash.as_str())
    }

    pub fn owner_id(&self) -> Option<&str> {
        match self.owner_type {
            OwnerType::Project => self.project.as_deref(),
            OwnerType::Application => self.application.as_deref(),
            OwnerType::None => None,
        }
    }

    /// Tear down to the unassigned state: no owner, no snapshot, no settings,
    /// autonomous mode, editor session forgotten. Target state and licensing
    /// survive.
    pub fn clear(&mut self) {
        self.owner_type = OwnerType::None;
        self.project = None;
        self.application = None;
        self.snapshot = None;
        self.settings = None;
        self.mode = AgentMode::Autonomous;
        self.editor_token = None;
        self.editor_affinity = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_states_are_not_transitions() {
        assert!(!RunState::Running.is_transition());
        assert!(!RunState::Suspended.is_transition());
        assert!(RunState::Updating.is_transition());
        assert!(RunState::Restarting.is_transition());
        assert!(RunState::Provisioning.is_transition());
    }

    #[test]
    fn owner_type_inference_prefers_project() {
        assert_eq!(
            Assignment::infer_owner_type(Some("p"), Some("a")),
            OwnerType::Project
        );
        assert_eq!(
            Assignment::infer_owner_type(None, Some("a")),
            OwnerType::Application
        );
        assert_eq!(Assignment::infer_owner_type(None, None), OwnerType::None);
    }

    #[test]
    fn reserved_keys_include_application_pair_only_for_applications() {
        let proj = reserved_env_keys(OwnerType::Project);
        assert!(!proj.contains(&ENV_APPLICATION_ID));
        let app = reserved_env_keys(OwnerType::Application);
        assert!(app.contains(&ENV_APPLICATION_ID));
        assert!(app.contains(&ENV_APPLICATION_NAME));
    }

    #[test]
    fn clear_keeps_target_state_and_license() {
        let mut a = Assignment {
            owner_type: OwnerType::Project,
            project: Some("p1".into()),
            snapshot: Some(Snapshot { id: "s1".into(), ..Default::default() }),
            target_state: TargetState::Suspended,
            licensed: Some(true),
            editor_token: Some("tok".into()),
            ..Default::default()
        };
        a.clear();
        assert_eq!(a.owner_type, OwnerType::None);
        assert!(a.project.is_none() && a.snapshot.is_none());
        assert!(a.editor_token.is_none());
        assert_eq!(a.target_state, TargetState::Suspended);
        assert_eq!(a.licensed, Some(true));
    }

    #[test]
    fn run_state_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&RunState::Safe).unwrap(), "\"safe\"");
        assert_eq!(
            serde_json::to_string(&RunState::Provisioning).unwrap(),
            "\"provisioning\""
        );
    }
}
