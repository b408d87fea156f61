use serde::{Deserialize, Deserializer, Serialize};

use crate::types::{AgentMode, OwnerType, RunState, TargetState};

// ── Desired-state messages ────────────────────────────────────────────────────

/// What a transport delivers to the reconciler.
///
/// Tagged variants rather than field-presence pattern matching: the pending
/// slot's stickiness rules depend on the variant, not on payload contents.
#[derive(Debug, Clone, PartialEq)]
pub enum DesiredState {
    /// The platform holds no assignment for this device (401/404 or an
    /// explicit clear). In autonomous mode the agent stops and clears.
    Null,
    /// A desired-state document from a check-in response or broker `update`.
    Update(Box<DesiredUpdate>),
    /// A pure run-state change. Sticky in the pending slot.
    TargetState(TargetState),
}

impl DesiredState {
    /// Wrap an update payload, collapsing a document that carries nothing but
    /// a target state into the sticky variant.
    pub fn from_update(update: DesiredUpdate) -> DesiredState {
        match update.as_pure_target_state() {
            Some(ts) => DesiredState::TargetState(ts),
            None => DesiredState::Update(Box::new(update)),
        }
    }

    pub fn is_target_change(&self) -> bool {
        matches!(self, DesiredState::TargetState(_))
    }
}

/// A desired-state document as sent by the platform.
///
/// Field-level `Option<Option<_>>` distinguishes "key absent" (leave alone)
/// from "key null" (clear): `{"project": null}` is an unassignment, a message
/// without `project` says nothing about it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DesiredUpdate {
    #[serde(deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub project: Option<Option<String>>,
    #[serde(deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub application: Option<Option<String>>,
    /// Desired snapshot id. The full snapshot is fetched separately.
    #[serde(
        deserialize_with = "nullable_snapshot",
        skip_serializing_if = "Option::is_none"
    )]
    pub snapshot: Option<Option<String>>,
    /// Desired settings hash. The full settings are fetched separately.
    #[serde(
        deserialize_with = "nullable_settings",
        skip_serializing_if = "Option::is_none"
    )]
    pub settings: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<AgentMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub licensed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_state: Option<TargetState>,
}

impl DesiredUpdate {
    /// `Some(ts)` when this document carries a target state and nothing else.
    fn as_pure_target_state(&self) -> Option<TargetState> {
        let ts = self.target_state?;
        let empty = self.project.is_none()
            && self.application.is_none()
            && self.snapshot.is_none()
            && self.settings.is_none()
            && self.mode.is_none()
            && self.licensed.is_none();
        empty.then_some(ts)
    }

    /// Strip and return the embedded target state, leaving the document
    /// otherwise intact for diffing.
    pub fn take_target_state(&mut self) -> Option<TargetState> {
        self.target_state.take()
    }
}

/// Present-but-null vs absent: absent hits `default` (outer `None`), an
/// explicit `null` becomes `Some(None)`.
fn nullable<'de, T, D>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Deserialize::deserialize(de).map(Some)
}

/// The platform sends the snapshot either as a bare id string or as an
/// object carrying an `id` key. Both collapse to the id.
fn nullable_snapshot<'de, D>(de: D) -> Result<Option<Option<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Ref {
        Id(String),
        Object { id: Option<String> },
    }
    let v: Option<Ref> = Deserialize::deserialize(de)?;
    Ok(Some(v.and_then(|r| match r {
        Ref::Id(id) => Some(id),
        Ref::Object { id } => id,
    })))
}

/// Same shape tolerance for settings: bare hash string or `{hash: …}`.
fn nullable_settings<'de, D>(de: D) -> Result<Option<Option<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Ref {
        Hash(String),
        Object { hash: Option<String> },
    }
    let v: Option<Ref> = Deserialize::deserialize(de)?;
    Ok(Some(v.and_then(|r| match r {
        Ref::Hash(hash) => Some(hash),
        Ref::Object { hash } => hash,
    })))
}

// ── State reporting ───────────────────────────────────────────────────────────

/// Launcher health carried inside every state report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    /// Seconds since agent process start.
    pub uptime: u64,
    pub snapshot_restart_count: u32,
}

/// The check-in payload published to the status topic / POSTed to
/// `live/state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateReport {
    pub project: Option<String>,
    pub application: Option<String>,
    pub owner_type: OwnerType,
    /// Current snapshot id.
    pub snapshot: Option<String>,
    /// Current settings hash.
    pub settings: Option<String>,
    pub state: RunState,
    pub mode: AgentMode,
    pub target_state: TargetState,
    pub licensed: Option<bool>,
    pub agent_version: String,
    /// Runtime package version, when the launcher has exposed a package file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_version: Option<String>,
    pub health: Health,
}

/// A log record shipped to the platform log topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Milliseconds since the epoch.
    pub ts: i64,
    pub level: String,
    pub msg: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_and_null_are_distinguished() {
        let absent: DesiredUpdate = serde_json::from_str("{}").unwrap();
        assert_eq!(absent.project, None);

        let null: DesiredUpdate = serde_json::from_str(r#"{"project": null}"#).unwrap();
        assert_eq!(null.project, Some(None));

        let set: DesiredUpdate = serde_json::from_str(r#"{"project": "p1"}"#).unwrap();
        assert_eq!(set.project, Some(Some("p1".into())));
    }

    #[test]
    fn snapshot_accepts_id_string_or_object() {
        let s: DesiredUpdate = serde_json::from_str(r#"{"snapshot": "abc"}"#).unwrap();
        assert_eq!(s.snapshot, Some(Some("abc".into())));

        let o: DesiredUpdate = serde_json::from_str(r#"{"snapshot": {"id": "abc"}}"#).unwrap();
        assert_eq!(o.snapshot, Some(Some("abc".into())));

        let n: DesiredUpdate = serde_json::from_str(r#"{"snapshot": null}"#).unwrap();
        assert_eq!(n.snapshot, Some(None));
    }

    #[test]
    fn pure_target_state_collapses_to_sticky_variant() {
        let u: DesiredUpdate =
            serde_json::from_str(r#"{"targetState": "suspended"}"#).unwrap();
        assert_eq!(
            DesiredState::from_update(u),
            DesiredState::TargetState(TargetState::Suspended)
        );

        let mixed: DesiredUpdate =
            serde_json::from_str(r#"{"targetState": "running", "snapshot": "s1"}"#).unwrap();
        assert!(matches!(
            DesiredState::from_update(mixed),
            DesiredState::Update(_)
        ));
    }

    #[test]
    fn settings_accepts_hash_string_or_object() {
        let s: DesiredUpdate = serde_json::from_str(r#"{"settings": "h1"}"#).unwrap();
        assert_eq!(s.settings, Some(Some("h1".into())));

        let o: DesiredUpdate =
            serde_json::from_str(r#"{"settings": {"hash": "h1"}}"#).unwrap();
        assert_eq!(o.settings, Some(Some("h1".into())));
    }
}
