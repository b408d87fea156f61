pub mod error;
pub mod launcher;
pub mod process;

pub use error::LaunchError;
pub use launcher::{Launcher, StopReason};
pub use process::{LauncherConfig, ProcessLauncher};
