use async_trait::async_trait;
use edgeflow_domain::{Assignment, LogEntry, RunState};
use tokio::sync::broadcast;

use crate::error::LaunchError;

/// Why the runtime is being stopped. `Shutdown` suppresses auto-restart and
/// is used by the supervisor so the transport can still transmit the final
/// status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Stopped,
    Shutdown,
    Updating,
    Restarting,
    Suspended,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StopReason::Stopped => "stopped",
            StopReason::Shutdown => "shutdown",
            StopReason::Updating => "updating",
            StopReason::Restarting => "restarting",
            StopReason::Suspended => "suspended",
        };
        write!(f, "{}", s)
    }
}

/// Child-process façade the reconciler drives.
///
/// Implementations materialize the assignment on disk, supervise the runtime
/// process, and expose the artifacts back for upload and divergence checks.
#[async_trait]
pub trait Launcher: Send + Sync + 'static {
    /// Materialize the assignment and start the runtime. Idempotent while
    /// the runtime is already running.
    async fn start(&self, assignment: &Assignment) -> Result<(), LaunchError>;

    /// Stop the runtime. `clean` additionally removes the materialized flow
    /// and credential files.
    async fn stop(&self, clean: bool, reason: StopReason) -> Result<(), LaunchError>;

    /// Write the runtime configuration files without starting the process
    /// (used when the target state is suspended).
    async fn write_configuration(&self, assignment: &Assignment) -> Result<(), LaunchError>;

    async fn read_flow(&self) -> Result<serde_json::Value, LaunchError>;
    async fn read_package(&self) -> Result<serde_json::Value, LaunchError>;
    async fn read_credentials(&self) -> Result<serde_json::Value, LaunchError>;

    async fn state(&self) -> RunState;
    async fn restart_count(&self) -> u32;

    /// Resolved runtime package version, when the launcher has one on disk.
    async fn runtime_version(&self) -> Option<String>;

    /// Live stream of runtime log records, consumed by the broker
    /// transport's log shipping.
    fn subscribe_logs(&self) -> broadcast::Receiver<LogEntry>;
}
