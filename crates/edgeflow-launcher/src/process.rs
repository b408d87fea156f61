use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use edgeflow_domain::{Assignment, LogEntry, RunState};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::LaunchError;
use crate::launcher::{Launcher, StopReason};

pub const FLOWS_FILE: &str = "flows.json";
pub const CREDENTIALS_FILE: &str = "flows_cred.json";
pub const PACKAGE_FILE: &str = "package.json";
pub const SETTINGS_FILE: &str = "settings.json";

/// SIGTERM grace before the child is killed outright.
const STOP_GRACE: Duration = Duration::from_secs(5);
/// A crash this soon after spawn counts toward the crash loop.
const RESTART_WINDOW: Duration = Duration::from_secs(30);
/// Quick crashes tolerated before the launcher gives up and enters safe mode.
const MAX_QUICK_RESTARTS: u32 = 3;

// ── Configuration ─────────────────────────────────────────────────────────────

/// Static configuration for the process launcher, injected at startup.
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    /// Directory the snapshot is materialized into; also the runtime cwd.
    pub project_dir: PathBuf,
    /// Runtime command and arguments.
    pub runtime: Vec<String>,
    /// Package-manager command used to install snapshot modules.
    pub installer: Vec<String>,
}

impl LauncherConfig {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            runtime: vec![
                "node-red".into(),
                "--userDir".into(),
                ".".into(),
                "--settings".into(),
                SETTINGS_FILE.into(),
            ],
            installer: vec![
                "npm".into(),
                "install".into(),
                "--omit=dev".into(),
                "--no-audit".into(),
                "--no-fund".into(),
            ],
        }
    }
}

// ── ProcessLauncher ───────────────────────────────────────────────────────────

struct Inner {
    state: RunState,
    restart_count: u32,
    quick_crashes: u32,
    stopping: bool,
    stop_token: Option<CancellationToken>,
    exit_rx: Option<oneshot::Receiver<()>>,
    child_env: BTreeMap<String, String>,
    last_spawn: Option<Instant>,
}

struct Shared {
    cfg: LauncherConfig,
    logs: broadcast::Sender<LogEntry>,
    inner: Mutex<Inner>,
}

/// Spawns and supervises the flow runtime as a child process.
///
/// Crash-loop policy: a crash inside [`RESTART_WINDOW`] counts as a quick
/// crash; after [`MAX_QUICK_RESTARTS`] of them in a row the launcher stops
/// restarting and reports [`RunState::Safe`].
#[derive(Clone)]
pub struct ProcessLauncher {
    shared: Arc<Shared>,
}

impl ProcessLauncher {
    pub fn new(cfg: LauncherConfig) -> Self {
        let (logs, _) = broadcast::channel(256);
        Self {
            shared: Arc::new(Shared {
                cfg,
                logs,
                inner: Mutex::new(Inner {
                    state: RunState::Stopped,
                    restart_count: 0,
                    quick_crashes: 0,
                    stopping: false,
                    stop_token: None,
                    exit_rx: None,
                    child_env: BTreeMap::new(),
                    last_spawn: None,
                }),
            }),
        }
    }

    async fn install_modules(&self) -> Result<(), LaunchError> {
        let cfg = &self.shared.cfg;
        let Some((cmd, args)) = cfg.installer.split_first() else {
            return Ok(());
        };
        info!(command = %cfg.installer.join(" "), "installing snapshot modules");

        let mut child = Command::new(cmd)
            .args(args)
            .current_dir(&cfg.project_dir)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| LaunchError::Spawn {
                command: cmd.clone(),
                source: e,
            })?;

        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");
        let out_task = forward_lines(stdout, self.shared.logs.clone(), "info");
        let err_task = forward_lines(stderr, self.shared.logs.clone(), "error");

        let status = child.wait().await.map_err(|e| LaunchError::Spawn {
            command: cmd.clone(),
            source: e,
        })?;
        out_task.await.ok();
        err_task.await.ok();

        if !status.success() {
            return Err(LaunchError::Install(format!(
                "{} exited with {}",
                cmd,
                status.code().map_or("signal".to_string(), |c| c.to_string())
            )));
        }
        Ok(())
    }

    /// Spawn the runtime and its monitor task. Caller must have placed the
    /// child environment in `inner.child_env`.
    fn spawn_runtime(
        shared: Arc<Shared>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), LaunchError>> + Send>> {
        Box::pin(Self::spawn_runtime_inner(shared))
    }

    async fn spawn_runtime_inner(shared: Arc<Shared>) -> Result<(), LaunchError> {
        let (command_line, env) = {
            let inner = shared.inner.lock().await;
            if inner.stopping {
                // a stop raced the respawn; stay down
                return Ok(());
            }
            (shared.cfg.runtime.clone(), inner.child_env.clone())
        };
        let Some((cmd, args)) = command_line.split_first() else {
            return Err(LaunchError::Config("empty runtime command".into()));
        };

        let mut child = Command::new(cmd)
            .args(args)
            .current_dir(&shared.cfg.project_dir)
            .envs(&env)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LaunchError::Spawn {
                command: cmd.clone(),
                source: e,
            })?;

        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");
        forward_lines(stdout, shared.logs.clone(), "info");
        forward_lines(stderr, shared.logs.clone(), "error");

        let stop_token = CancellationToken::new();
        let (exit_tx, exit_rx) = oneshot::channel();
        {
            let mut inner = shared.inner.lock().await;
            inner.stop_token = Some(stop_token.clone());
            inner.exit_rx = Some(exit_rx);
            inner.last_spawn = Some(Instant::now());
            inner.state = RunState::Running;
        }
        info!(pid = child.id(), "runtime started");

        let monitor_shared = shared.clone();
        tokio::spawn(async move {
            let natural_exit = tokio::select! {
                status = child.wait() => Some(status.ok().and_then(|s| s.code())),
                _ = stop_token.cancelled() => None,
            };
            match natural_exit {
                Some(code) => {
                    Self::handle_exit(monitor_shared, code).await;
                }
                None => {
                    if let Some(pid) = child.id() {
                        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
                    }
                    if tokio::time::timeout(STOP_GRACE, child.wait()).await.is_err() {
                        warn!("runtime ignored SIGTERM, killing");
                        let _ = child.kill().await;
                    }
                }
            }
            let _ = exit_tx.send(());
        });

        Ok(())
    }

    async fn handle_exit(shared: Arc<Shared>, code: Option<i32>) {
        let respawn = {
            let mut inner = shared.inner.lock().await;
            if inner.stopping {
                inner.state = RunState::Stopped;
                return;
            }

            inner.restart_count += 1;
            let quick = inner
                .last_spawn
                .is_some_and(|t| t.elapsed() < RESTART_WINDOW);
            if quick {
                inner.quick_crashes += 1;
            } else {
                inner.quick_crashes = 1;
            }

            if inner.quick_crashes > MAX_QUICK_RESTARTS {
                warn!(
                    exit_code = ?code,
                    crashes = inner.quick_crashes,
                    "runtime is crash-looping, entering safe mode"
                );
                inner.state = RunState::Safe;
                inner.stop_token = None;
                inner.exit_rx = None;
                false
            } else {
                warn!(
                    exit_code = ?code,
                    restart = inner.restart_count,
                    "runtime exited, restarting"
                );
                inner.state = RunState::Crashed;
                true
            }
        };

        if respawn {
            // boxed so the respawn cycle through the monitor task does not
            // produce an infinitely-sized future type
            let respawn = Self::spawn_runtime(shared.clone());
            if let Err(e) = respawn.await {
                warn!(error = %e, "runtime restart failed");
                let mut inner = shared.inner.lock().await;
                inner.state = RunState::Stopped;
            }
        }
    }

    fn file(&self, name: &str) -> PathBuf {
        self.shared.cfg.project_dir.join(name)
    }

    async fn read_json(&self, name: &str) -> Result<serde_json::Value, LaunchError> {
        let path = self.file(name);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(serde_json::Value::Null),
            Err(e) => Err(LaunchError::Io {
                path: path.display().to_string(),
                source: e,
            }),
        }
    }
}

/// Snapshot env overlaid on settings env; reserved `FF_*` keys arrive with
/// the snapshot and must win.
fn merged_env(assignment: &Assignment) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    if let Some(settings) = &assignment.settings {
        env.extend(settings.env.clone());
    }
    if let Some(snapshot) = &assignment.snapshot {
        env.extend(snapshot.env.clone());
    }
    env
}

fn forward_lines<R>(
    reader: R,
    logs: broadcast::Sender<LogEntry>,
    level: &'static str,
) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(level, line = %line, "runtime");
            let _ = logs.send(LogEntry {
                ts: chrono::Utc::now().timestamp_millis(),
                level: level.to_string(),
                msg: line,
            });
        }
    })
}

#[async_trait::async_trait]
impl Launcher for ProcessLauncher {
    async fn start(&self, assignment: &Assignment) -> Result<(), LaunchError> {
        {
            let mut inner = self.shared.inner.lock().await;
            if matches!(
                inner.state,
                RunState::Running | RunState::Starting | RunState::Installing | RunState::Loading
            ) {
                debug!("runtime already running, start is a no-op");
                return Ok(());
            }
            inner.state = RunState::Loading;
            inner.stopping = false;
            inner.quick_crashes = 0;
        }

        self.write_configuration(assignment).await?;

        let has_modules = assignment
            .snapshot
            .as_ref()
            .is_some_and(|s| !s.modules.is_empty());
        if has_modules {
            {
                self.shared.inner.lock().await.state = RunState::Installing;
            }
            if let Err(e) = self.install_modules().await {
                self.shared.inner.lock().await.state = RunState::Stopped;
                return Err(e);
            }
        }

        {
            let mut inner = self.shared.inner.lock().await;
            inner.state = RunState::Starting;
            inner.child_env = merged_env(assignment);
        }
        Self::spawn_runtime(self.shared.clone()).await
    }

    async fn stop(&self, clean: bool, reason: StopReason) -> Result<(), LaunchError> {
        let (token, exit_rx) = {
            let mut inner = self.shared.inner.lock().await;
            inner.stopping = true;
            let token = inner.stop_token.take();
            let rx = inner.exit_rx.take();
            if token.is_some() {
                inner.state = RunState::Stopping;
            }
            (token, rx)
        };

        if let Some(token) = token {
            info!(reason = %reason, clean, "stopping runtime");
            token.cancel();
            if let Some(rx) = exit_rx {
                let _ = rx.await;
            }
        }

        {
            let mut inner = self.shared.inner.lock().await;
            inner.state = match reason {
                StopReason::Suspended => RunState::Suspended,
                _ => RunState::Stopped,
            };
        }

        if clean {
            for name in [FLOWS_FILE, CREDENTIALS_FILE] {
                let _ = tokio::fs::remove_file(self.file(name)).await;
            }
        }
        Ok(())
    }

    async fn write_configuration(&self, assignment: &Assignment) -> Result<(), LaunchError> {
        let dir = &self.shared.cfg.project_dir;
        tokio::fs::create_dir_all(dir).await.map_err(|e| LaunchError::Io {
            path: dir.display().to_string(),
            source: e,
        })?;

        let snapshot = assignment
            .snapshot
            .as_ref()
            .ok_or_else(|| LaunchError::Config("no snapshot to materialize".into()))?;

        let write = |name: &str, content: Vec<u8>| {
            let path = dir.join(name);
            async move {
                tokio::fs::write(&path, content)
                    .await
                    .map_err(|e| LaunchError::Io {
                        path: path.display().to_string(),
                        source: e,
                    })
            }
        };

        write(FLOWS_FILE, serde_json::to_vec_pretty(&snapshot.flows)?).await?;

        let package = serde_json::json!({
            "name": "edgeflow-project",
            "description": "Managed by the edgeflow agent",
            "private": true,
            "version": "0.0.1",
            "dependencies": snapshot.modules,
        });
        write(PACKAGE_FILE, serde_json::to_vec_pretty(&package)?).await?;

        let mut runtime_settings = match &assignment.settings {
            Some(s) => serde_json::to_value(s)?,
            None => serde_json::json!({}),
        };
        if let Some(obj) = runtime_settings.as_object_mut() {
            obj.insert("env".into(), serde_json::to_value(merged_env(assignment))?);
        }
        write(SETTINGS_FILE, serde_json::to_vec_pretty(&runtime_settings)?).await?;

        debug!(dir = %dir.display(), snapshot = %snapshot.id, "configuration materialized");
        Ok(())
    }

    async fn read_flow(&self) -> Result<serde_json::Value, LaunchError> {
        self.read_json(FLOWS_FILE).await
    }

    async fn read_package(&self) -> Result<serde_json::Value, LaunchError> {
        self.read_json(PACKAGE_FILE).await
    }

    async fn read_credentials(&self) -> Result<serde_json::Value, LaunchError> {
        self.read_json(CREDENTIALS_FILE).await
    }

    async fn state(&self) -> RunState {
        self.shared.inner.lock().await.state
    }

    async fn restart_count(&self) -> u32 {
        self.shared.inner.lock().await.restart_count
    }

    async fn runtime_version(&self) -> Option<String> {
        let path = self
            .shared
            .cfg
            .project_dir
            .join("node_modules/node-red/package.json");
        let content = tokio::fs::read_to_string(path).await.ok()?;
        let pkg: serde_json::Value = serde_json::from_str(&content).ok()?;
        pkg.get("version")?.as_str().map(String::from)
    }

    fn subscribe_logs(&self) -> broadcast::Receiver<LogEntry> {
        self.shared.logs.subscribe()
    }
}
