use async_trait::async_trait;
use edgeflow_domain::{DesiredState, DesiredUpdate, LogEntry, OwnerType, StateReport};

use crate::error::TransportError;

/// A targeted run-state command arriving over a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunAction {
    Start,
    Restart,
    Suspend,
}

impl RunAction {
    pub fn parse(s: &str) -> Option<RunAction> {
        match s {
            "start" => Some(RunAction::Start),
            "restart" => Some(RunAction::Restart),
            "suspend" => Some(RunAction::Suspend),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunAction::Start => "start",
            RunAction::Restart => "restart",
            RunAction::Suspend => "suspend",
        };
        write!(f, "{}", s)
    }
}

/// The consumer side the transports drive: implemented by the reconciler.
#[async_trait]
pub trait AgentHandle: Send + Sync + 'static {
    /// Deliver a desired-state message.
    async fn deliver(&self, state: DesiredState);

    /// Current state report. `None` while an update is in progress ("don't
    /// call home right now").
    async fn report(&self) -> Option<StateReport>;

    /// Perform a targeted run-state command. Returns success.
    async fn action(&self, action: RunAction) -> bool;

    /// Persist editor token/affinity when either changed; `None` clears.
    async fn save_editor_token(&self, token: Option<String>, affinity: Option<String>);
}

/// The producer side the reconciler drives. One shape for both transports;
/// they differ only in how desired-state messages are obtained.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn start(&self) -> Result<(), TransportError>;
    async fn stop(&self);

    /// Publish/POST the current state payload to the platform.
    async fn check_in(&self);

    /// Ship a log record. A no-op on transports without a log channel.
    async fn log(&self, entry: LogEntry);

    /// Owner changed: adjust owner-scoped subscriptions.
    async fn set_owner(&self, owner: OwnerType, id: Option<String>);
}

/// Turn the device's own report back into a desired-state document: the
/// "platform accepted it, no change" path (HTTP 2xx, broker initial
/// check-in timeout).
pub fn echo_update(report: &StateReport) -> DesiredState {
    DesiredState::Update(Box::new(DesiredUpdate {
        project: Some(report.project.clone()),
        application: Some(report.application.clone()),
        snapshot: Some(report.snapshot.clone()),
        settings: Some(report.settings.clone()),
        mode: Some(report.mode),
        licensed: report.licensed,
        target_state: None,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgeflow_domain::{AgentMode, Health, RunState, TargetState};

    #[test]
    fn run_action_parses_the_command_vocabulary() {
        assert_eq!(RunAction::parse("start"), Some(RunAction::Start));
        assert_eq!(RunAction::parse("restart"), Some(RunAction::Restart));
        assert_eq!(RunAction::parse("suspend"), Some(RunAction::Suspend));
        assert_eq!(RunAction::parse("reboot"), None);
    }

    #[test]
    fn echo_preserves_identity_but_not_target_state() {
        let report = StateReport {
            project: Some("p1".into()),
            application: None,
            owner_type: OwnerType::Project,
            snapshot: Some("s1".into()),
            settings: Some("h1".into()),
            state: RunState::Running,
            mode: AgentMode::Autonomous,
            target_state: TargetState::Suspended,
            licensed: Some(true),
            agent_version: "0.1.0".into(),
            runtime_version: None,
            health: Health::default(),
        };
        match echo_update(&report) {
            DesiredState::Update(u) => {
                assert_eq!(u.project, Some(Some("p1".into())));
                assert_eq!(u.snapshot, Some(Some("s1".into())));
                // the echo never re-states a target; the held one stands
                assert_eq!(u.target_state, None);
            }
            other => panic!("expected Update, got {other:?}"),
        }
    }
}
