use std::sync::Arc;
use std::time::Duration;

use edgeflow_config::{load_device_config, ConfigError, ConfigMode, DeviceConfig};
use edgeflow_launcher::{Launcher, LauncherConfig, ProcessLauncher, StopReason};
use edgeflow_reconciler::Reconciler;
use edgeflow_store::AssignmentStore;
use edgeflow_transport::{
    AgentHandle, BrokerSettings, BrokerTransport, HttpPolling, PlatformClient, PollConfig,
    Transport,
};
use edgeflow_tunnel::EditorTunnel;
use thiserror::Error;
use tracing::{info, warn};

use crate::cli::Cli;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("working directory {path}: {source}")]
    WorkDir {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Setup(String),
}

impl StartupError {
    /// Process exit code: 2 unrecoverable setup, 9 invalid device config,
    /// 20 working-directory error.
    pub fn exit_code(&self) -> i32 {
        match self {
            StartupError::WorkDir { .. } => 20,
            StartupError::Config(_) => 9,
            StartupError::Setup(_) => 2,
        }
    }
}

/// Single-shot lifecycle: load config, pick the transport once, start the
/// reconciler, block on a termination signal, then shut down in an order
/// that lets the transport transmit the final status.
pub async fn run(cli: &Cli) -> Result<(), StartupError> {
    std::fs::create_dir_all(&cli.dir).map_err(|e| StartupError::WorkDir {
        path: cli.dir.display().to_string(),
        source: e,
    })?;

    let config = load_device_config(&cli.config_path())?;
    let device_id = match &config.mode {
        ConfigMode::Device { device_id, .. } => device_id.clone(),
        ConfigMode::Provisioning { .. } => {
            // the provisioning bootstrap lives outside the agent core
            return Err(StartupError::Setup(
                "device file is in provisioning mode; complete setup first".into(),
            ));
        }
    };
    info!(device = %device_id, forge = %config.forge_url, "agent starting");

    let client = Arc::new(
        PlatformClient::new(&config.forge_url, &device_id, &config.token)
            .map_err(|e| StartupError::Setup(e.to_string()))?,
    );

    let store = AssignmentStore::new(&cli.dir);
    let initial = match store.load().await {
        Ok(assignment) => assignment,
        Err(e) => {
            warn!(error = %e, "assignment record unreadable, starting unassigned");
            None
        }
    };
    let initial_owner = initial
        .as_ref()
        .map(|a| (a.owner_type, a.owner_id().map(String::from)));

    let launcher = Arc::new(ProcessLauncher::new(LauncherConfig::new(
        cli.dir.join("project"),
    )));
    let tunnel = Arc::new(EditorTunnel::new(&config.forge_url, &device_id));
    if let Some(affinity) = initial.as_ref().and_then(|a| a.editor_affinity.clone()) {
        tunnel.set_affinity(Some(affinity)).await;
    }

    let reconciler = Reconciler::new(
        client.clone(),
        launcher.clone(),
        tunnel.clone(),
        store,
        initial,
    );
    let agent: Arc<dyn AgentHandle> = Arc::new(reconciler.clone());

    // the transport is determined once at startup and stays fixed
    let transport: Arc<dyn Transport> = match &config.broker {
        Some(broker) => {
            info!(url = %broker.url, "using broker transport");
            let settings = BrokerSettings::from_credentials(
                &broker.url,
                &broker.username,
                &broker.password,
            )
            .map_err(|e| StartupError::Setup(e.to_string()))?;
            Arc::new(BrokerTransport::new(
                settings,
                agent.clone(),
                launcher.clone(),
                tunnel.clone(),
            ))
        }
        None => {
            info!(interval = cli.interval, "using http polling transport");
            let poll = PollConfig {
                interval: Duration::from_secs(cli.interval),
                ..PollConfig::default()
            };
            HttpPolling::new(client, agent.clone(), poll, None)
        }
    };

    reconciler.set_transport(transport.clone()).await;
    transport
        .start()
        .await
        .map_err(|e| StartupError::Setup(e.to_string()))?;
    if let Some((owner_type, owner_id)) = initial_owner {
        transport.set_owner(owner_type, owner_id).await;
    }

    wait_for_signal()
        .await
        .map_err(|e| StartupError::Setup(format!("signal handler: {e}")))?;

    info!("termination signal received, shutting down");
    reconciler.set_exiting();
    // launcher first, so the transport can still transmit the final status
    if let Err(e) = launcher.stop(false, StopReason::Shutdown).await {
        warn!(error = %e, "launcher shutdown failed");
    }
    transport.check_in().await;
    transport.stop().await;
    info!("agent stopped");
    Ok(())
}

async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;
    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
        _ = quit.recv() => {}
    }
    Ok(())
}

/// The config error the caller maps to an exit code. Split out so tests can
/// cover the mapping without a process exit.
pub fn classify(config: &DeviceConfig) -> &'static str {
    if config.provisioning_mode() {
        "provisioning"
    } else if config.broker.is_some() {
        "broker"
    } else {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgeflow_config::parse_device_config;
    use std::path::Path;

    #[test]
    fn exit_codes_follow_the_contract() {
        let workdir = StartupError::WorkDir {
            path: "/nope".into(),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        assert_eq!(workdir.exit_code(), 20);

        let config = StartupError::Config(ConfigError::Empty {
            path: "device.yml".into(),
        });
        assert_eq!(config.exit_code(), 9);

        let setup = StartupError::Setup("broker".into());
        assert_eq!(setup.exit_code(), 2);
    }

    #[test]
    fn transport_selection_is_broker_iff_credentials_present() {
        let http = parse_device_config(
            "deviceId: d\ntoken: t\ncredentialSecret: s\nforgeURL: https://f\n",
            Path::new("device.yml"),
        )
        .unwrap();
        assert_eq!(classify(&http), "http");

        let broker = parse_device_config(
            concat!(
                "deviceId: d\ntoken: t\ncredentialSecret: s\nforgeURL: https://f\n",
                "brokerURL: mqtts://b\nbrokerUsername: device:t:d\nbrokerPassword: p\n"
            ),
            Path::new("device.yml"),
        )
        .unwrap();
        assert_eq!(classify(&broker), "broker");
    }

    #[tokio::test]
    async fn missing_config_maps_to_invalid_config_exit() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli {
            config: "device.yml".into(),
            dir: dir.path().to_path_buf(),
            interval: 60,
            verbose: false,
        };
        let err = run(&cli).await.unwrap_err();
        assert_eq!(err.exit_code(), 9);
    }

    #[tokio::test]
    async fn provisioning_config_maps_to_setup_exit() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("device.yml"),
            "provisioningToken: p\nprovisioningTeam: t\nforgeURL: https://f\n",
        )
        .unwrap();
        let cli = Cli {
            config: "device.yml".into(),
            dir: dir.path().to_path_buf(),
            interval: 60,
            verbose: false,
        };
        let err = run(&cli).await.unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
