use clap::Parser;
use std::path::PathBuf;

/// Keeps a local flow runtime in sync with its FlowFuse platform
/// assignment.
#[derive(Parser, Debug)]
#[command(name = "edgeflow-agent", version)]
pub struct Cli {
    /// Device credentials file. Relative paths resolve inside the working
    /// directory.
    #[arg(short = 'c', long = "config", default_value = "device.yml")]
    pub config: PathBuf,

    /// Agent working directory: assignment record and runtime project live
    /// here.
    #[arg(short = 'd', long = "dir", default_value = "/opt/edgeflow-agent")]
    pub dir: PathBuf,

    /// HTTP polling interval in seconds (ignored with a broker transport).
    #[arg(short = 'i', long = "interval", default_value_t = 60)]
    pub interval: u64,

    /// Enable debug logging.
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

impl Cli {
    /// Absolute path of the device credentials file.
    pub fn config_path(&self) -> PathBuf {
        if self.config.is_absolute() {
            self.config.clone()
        } else {
            self.dir.join(&self.config)
        }
    }
}
