pub mod messages;
pub mod types;

pub use messages::{DesiredState, DesiredUpdate, Health, LogEntry, StateReport};
pub use types::{
    reserved_env_keys, AgentMode, Assignment, OwnerType, RunState, Settings, Snapshot,
    TargetState, ENV_APPLICATION_ID, ENV_APPLICATION_NAME, ENV_DEVICE_ID, ENV_DEVICE_NAME,
    ENV_DEVICE_TYPE, ENV_SNAPSHOT_ID, ENV_SNAPSHOT_NAME, SENTINEL_SNAPSHOT_ID,
};
