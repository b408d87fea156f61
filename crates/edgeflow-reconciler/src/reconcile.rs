use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Instant;

use edgeflow_domain::{
    reserved_env_keys, AgentMode, Assignment, DesiredState, DesiredUpdate, Health, OwnerType,
    RunState, Snapshot, StateReport, TargetState, SENTINEL_SNAPSHOT_ID,
};
use edgeflow_launcher::{Launcher, StopReason};
use edgeflow_store::AssignmentStore;
use edgeflow_transport::{AgentHandle, PlatformClient, RunAction, Transport, TransportError};
use edgeflow_tunnel::Tunnel;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::ReconcileError;
use crate::retry::RetryTimer;

/// Snapshot module whose presence triggers the one-shot settings migration
/// for devices that predate assistant support.
const ASSISTANT_MODULE: &str = "@flowfuse/nr-assistant";

// ── Internal state ────────────────────────────────────────────────────────────

/// Serialization gate: at most one reconciliation runs at a time, with a
/// one-slot pending field drained when the current one finishes.
struct Gate {
    in_flight: bool,
    pending: Option<DesiredState>,
}

struct AgentState {
    assignment: Assignment,
    run_state: RunState,
    /// True while an update is being applied; `state_report` returns `None`
    /// so transports don't call home mid-update.
    updating: bool,
    /// One-shot latch for the assistant settings migration.
    assistant_migrated: bool,
}

struct Inner {
    client: Arc<PlatformClient>,
    launcher: Arc<dyn Launcher>,
    tunnel: Arc<dyn Tunnel>,
    store: AssignmentStore,
    started_at: Instant,
    transport: tokio::sync::RwLock<Option<Arc<dyn Transport>>>,
    exiting: AtomicBool,
    gate: StdMutex<Gate>,
    state: Mutex<AgentState>,
    retry: RetryTimer,
}

/// The reconciliation core: owns the in-memory [`Assignment`], consumes
/// desired-state messages from either transport, and drives the local
/// assignment and launcher toward them.
#[derive(Clone)]
pub struct Reconciler {
    inner: Arc<Inner>,
}

impl Reconciler {
    pub fn new(
        client: Arc<PlatformClient>,
        launcher: Arc<dyn Launcher>,
        tunnel: Arc<dyn Tunnel>,
        store: AssignmentStore,
        initial: Option<Assignment>,
    ) -> Self {
        let assignment = initial.unwrap_or_default();
        // a device suspended before restart must come back up suspended
        let run_state = match assignment.target_state {
            TargetState::Suspended => RunState::Suspended,
            TargetState::Running => RunState::Stopped,
        };

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let weak = weak.clone();
            let retry = RetryTimer::new(move |state: DesiredState| {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        Reconciler { inner }.set_state(state).await;
                    }
                }
            });
            Inner {
                client,
                launcher,
                tunnel,
                store,
                started_at: Instant::now(),
                transport: tokio::sync::RwLock::new(None),
                exiting: AtomicBool::new(false),
                gate: StdMutex::new(Gate {
                    in_flight: false,
                    pending: None,
                }),
                state: Mutex::new(AgentState {
                    assignment,
                    run_state,
                    updating: false,
                    assistant_migrated: false,
                }),
                retry,
            }
        });
        Self { inner }
    }

    /// The transport is chosen once at startup and fixed for the agent's
    /// lifetime; this wires it in after construction.
    pub async fn set_transport(&self, transport: Arc<dyn Transport>) {
        *self.inner.transport.write().await = Some(transport);
    }

    /// Entered on shutdown: short-circuits the pending-update drain.
    pub fn set_exiting(&self) {
        self.inner.exiting.store(true, Ordering::SeqCst);
    }

    // ── Serialized entry point ────────────────────────────────────────────────

    /// Deliver a desired-state message. At most one reconciliation runs at a
    /// time; a message arriving mid-run lands in the one-slot pending field,
    /// where a target-state change is sticky against non-target messages.
    pub async fn set_state(&self, incoming: DesiredState) {
        {
            let mut gate = self.inner.gate.lock().unwrap();
            if gate.in_flight {
                let sticky = gate
                    .pending
                    .as_ref()
                    .is_some_and(|p| p.is_target_change() && !incoming.is_target_change());
                if sticky {
                    debug!("pending target-state change is sticky, dropping message");
                } else {
                    gate.pending = Some(incoming);
                }
                return;
            }
            gate.in_flight = true;
        }

        let mut next = Some(incoming);
        while let Some(msg) = next.take() {
            if let Err(e) = self.reconcile(msg).await {
                warn!(error = %e, "reconciliation failed");
            }

            let mut gate = self.inner.gate.lock().unwrap();
            if self.inner.exiting.load(Ordering::SeqCst) {
                gate.pending = None;
                gate.in_flight = false;
                return;
            }
            match gate.pending.take() {
                Some(pending) => next = Some(pending),
                None => gate.in_flight = false,
            }
        }
    }

    async fn reconcile(&self, msg: DesiredState) -> Result<(), ReconcileError> {
        match msg {
            DesiredState::Null => self.handle_null().await,
            DesiredState::TargetState(ts) => self.handle_target_state(ts).await,
            DesiredState::Update(update) => self.handle_update(*update).await,
        }
    }

    // ── Null desired state ────────────────────────────────────────────────────

    async fn handle_null(&self) -> Result<(), ReconcileError> {
        {
            let st = self.inner.state.lock().await;
            if st.assignment.mode == AgentMode::Developer {
                // the device may carry locally-modified flows; leave it alone
                debug!("null desired state ignored in developer mode");
                return Ok(());
            }
        }

        info!("platform holds no assignment, stopping and clearing");
        if let Err(e) = self.inner.launcher.stop(false, StopReason::Stopped).await {
            warn!(error = %e, "launcher stop failed");
        }

        let assignment = {
            let mut st = self.inner.state.lock().await;
            st.assignment.clear();
            st.run_state = RunState::Stopped;
            st.assignment.clone()
        };
        self.persist(&assignment).await;
        self.sync_owner_subscription().await;
        self.check_in().await;
        Ok(())
    }

    // ── Target-state changes ──────────────────────────────────────────────────

    async fn handle_target_state(&self, target: TargetState) -> Result<(), ReconcileError> {
        let changed = {
            let mut st = self.inner.state.lock().await;
            let changed = st.assignment.target_state != target;
            st.assignment.target_state = target;
            changed
        };
        if changed {
            self.inner.retry.cancel();
        }

        match target {
            TargetState::Suspended => {
                if let Err(e) = self.inner.launcher.stop(false, StopReason::Suspended).await {
                    warn!(error = %e, "launcher stop for suspend failed");
                }
                self.inner.state.lock().await.run_state = RunState::Suspended;
            }
            TargetState::Running => {
                let (assignment, has_snapshot) = {
                    let mut st = self.inner.state.lock().await;
                    let has = st.assignment.snapshot.is_some();
                    st.run_state = if has { RunState::Starting } else { RunState::Stopped };
                    (st.assignment.clone(), has)
                };
                if has_snapshot {
                    match self.inner.launcher.start(&assignment).await {
                        Ok(()) => self.inner.state.lock().await.run_state = RunState::Running,
                        Err(e) => {
                            warn!(error = %e, "launcher start failed");
                            let _ = self.inner.launcher.stop(false, StopReason::Stopped).await;
                            self.inner.state.lock().await.run_state = RunState::Error;
                            self.inner.gate.lock().unwrap().pending = None;
                        }
                    }
                }
            }
        }

        let assignment = self.inner.state.lock().await.assignment.clone();
        self.persist(&assignment).await;
        self.check_in().await;
        Ok(())
    }

    // ── Update documents ──────────────────────────────────────────────────────

    async fn handle_update(&self, mut update: DesiredUpdate) -> Result<(), ReconcileError> {
        // embedded target state: persist, clear retries on transition, strip
        if let Some(target) = update.take_target_state() {
            let changed = {
                let mut st = self.inner.state.lock().await;
                let changed = st.assignment.target_state != target;
                st.assignment.target_state = target;
                changed
            };
            if changed {
                self.inner.retry.cancel();
            }
        }

        let (cur_mode, cur_owner, cur_project, cur_application, cur_snapshot_id, cur_settings_hash) = {
            let st = self.inner.state.lock().await;
            (
                st.assignment.mode,
                st.assignment.owner_type,
                st.assignment.project.clone(),
                st.assignment.application.clone(),
                st.assignment.snapshot_id().map(String::from),
                st.assignment.settings_hash().map(String::from),
            )
        };

        // normalization: a missing owner type is inferred, project wins
        let msg_project = update.project.clone().unwrap_or_else(|| cur_project.clone());
        let msg_application = update
            .application
            .clone()
            .unwrap_or_else(|| cur_application.clone());
        let msg_owner =
            Assignment::infer_owner_type(msg_project.as_deref(), msg_application.as_deref());
        let msg_mode = update.mode.unwrap_or(cur_mode);

        let mut force_reload = false;

        if cur_mode == AgentMode::Autonomous && msg_mode == AgentMode::Developer {
            // entering developer mode: persist, leave the launcher alone;
            // the editor token arrives later over the broker
            info!("entering developer mode");
            let assignment = {
                let mut st = self.inner.state.lock().await;
                st.assignment.mode = AgentMode::Developer;
                st.assignment.clone()
            };
            self.persist(&assignment).await;
            self.check_in().await;
            return Ok(());
        }

        if cur_mode == AgentMode::Developer && msg_mode == AgentMode::Autonomous {
            info!("leaving developer mode");
            // fetch before flipping the mode: a fetch failure retries this
            // message, which must re-enter the developer-exit path
            let platform = match self.inner.client.snapshot().await {
                Ok(snapshot) => snapshot,
                Err(e) => return self.fetch_failed(update, e).await,
            };

            {
                let mut st = self.inner.state.lock().await;
                st.assignment.mode = AgentMode::Autonomous;
                st.assignment.editor_token = None;
                st.assignment.editor_affinity = None;
            }
            self.inner.tunnel.close().await;

            force_reload = self.diverged_from(&platform).await?;
            if !force_reload {
                debug!("local state matches the platform, no reload needed");
                let assignment = self.inner.state.lock().await.assignment.clone();
                self.persist(&assignment).await;
                self.check_in().await;
                return Ok(());
            }
        } else if cur_mode == AgentMode::Developer {
            // steady developer mode with a materialized snapshot: the
            // platform refrains from pushing updates; only adopt bookkeeping
            let has_snapshot = cur_snapshot_id.is_some();
            if has_snapshot {
                if let Some(licensed) = update.licensed {
                    let assignment = {
                        let mut st = self.inner.state.lock().await;
                        st.assignment.licensed = Some(licensed);
                        st.assignment.clone()
                    };
                    self.persist(&assignment).await;
                }
                return Ok(());
            }
            // initial developer-mode adoption: nothing materialized yet,
            // fall through and take the platform state
        }

        // owner unassignment: an explicit null for the current owner
        let unassigned = (cur_owner == OwnerType::Application
            && update.application == Some(None))
            || (cur_owner == OwnerType::Project && update.project == Some(None));
        if unassigned {
            info!(owner = %cur_owner, "owner unassigned, tearing down");
            if let Err(e) = self.inner.launcher.stop(true, StopReason::Stopped).await {
                warn!(error = %e, "launcher stop failed");
            }

            let settings_changed = matches!(
                &update.settings,
                Some(Some(hash)) if Some(hash.as_str()) != cur_settings_hash.as_deref()
            );
            if settings_changed {
                match self.inner.client.settings().await {
                    Ok(settings) => {
                        self.inner.state.lock().await.assignment.settings = Some(settings)
                    }
                    Err(e) => warn!(error = %e, "settings refresh failed, keeping previous"),
                }
            }

            let assignment = {
                let mut st = self.inner.state.lock().await;
                st.assignment.owner_type = OwnerType::None;
                st.assignment.project = None;
                st.assignment.application = None;
                st.assignment.snapshot = None;
                st.run_state = RunState::Stopped;
                st.assignment.clone()
            };
            self.persist(&assignment).await;
            self.sync_owner_subscription().await;
            self.check_in().await;
            return Ok(());
        }

        // snapshot cleared with the owner retained
        if update.snapshot == Some(None) {
            info!("snapshot cleared, stopping");
            if let Err(e) = self.inner.launcher.stop(true, StopReason::Stopped).await {
                warn!(error = %e, "launcher stop failed");
            }
            let assignment = {
                let mut st = self.inner.state.lock().await;
                st.assignment.snapshot = None;
                st.assignment.project = msg_project.clone();
                st.assignment.application = msg_application.clone();
                st.assignment.owner_type = msg_owner;
                st.run_state = RunState::Stopped;
                st.assignment.clone()
            };
            self.persist(&assignment).await;
            self.sync_owner_subscription().await;
            self.check_in().await;
            return Ok(());
        }

        // ── Update decision ──────────────────────────────────────────────────

        let owner_changed = msg_owner != cur_owner
            || msg_project != cur_project
            || msg_application != cur_application;
        let msg_snapshot_id = match &update.snapshot {
            Some(Some(id)) => Some(id.clone()),
            Some(None) => None, // handled above
            None => cur_snapshot_id.clone(),
        };
        let msg_settings_hash = match &update.settings {
            Some(Some(hash)) => Some(hash.clone()),
            Some(None) => None,
            None => cur_settings_hash.clone(),
        };

        let mut fetch_snapshot = false;
        let mut fetch_settings = false;
        if owner_changed && msg_owner != OwnerType::None {
            fetch_snapshot = true;
            fetch_settings = true;
        }
        if msg_snapshot_id != cur_snapshot_id {
            // the snapshot env carries reserved keys settings depend on
            fetch_snapshot = true;
            fetch_settings = true;
        }
        if msg_settings_hash != cur_settings_hash {
            fetch_settings = true;
        }
        if force_reload {
            fetch_snapshot = true;
            fetch_settings = true;
        }
        {
            let mut st = self.inner.state.lock().await;
            let needs_assistant = !st.assistant_migrated
                && st
                    .assignment
                    .snapshot
                    .as_ref()
                    .is_some_and(|s| s.modules.contains_key(ASSISTANT_MODULE))
                && st
                    .assignment
                    .settings
                    .as_ref()
                    .is_some_and(|s| s.assistant.is_none());
            if needs_assistant {
                info!("snapshot uses the assistant, refreshing settings once");
                st.assistant_migrated = true;
                fetch_settings = true;
            }
        }

        if !fetch_snapshot && !fetch_settings {
            return self.ensure_run_state(&update).await;
        }

        // ── Apply ────────────────────────────────────────────────────────────

        {
            let mut st = self.inner.state.lock().await;
            st.updating = true;
            st.run_state = RunState::Updating;
        }

        let launcher_state = self.inner.launcher.state().await;
        if !matches!(
            launcher_state,
            RunState::Stopped | RunState::Suspended | RunState::Unknown
        ) {
            if let Err(e) = self.inner.launcher.stop(false, StopReason::Updating).await {
                warn!(error = %e, "launcher stop for update failed");
            }
        }

        {
            let mut st = self.inner.state.lock().await;
            st.assignment.project = msg_project;
            st.assignment.application = msg_application;
            st.assignment.owner_type = msg_owner;
            st.assignment.mode = msg_mode;
            if let Some(licensed) = update.licensed {
                st.assignment.licensed = Some(licensed);
            }
        }

        if fetch_snapshot {
            debug!(snapshot = ?msg_snapshot_id, "fetching snapshot");
            match self.inner.client.snapshot().await {
                Ok(snapshot) if !snapshot.id.is_empty() => {
                    self.inner.state.lock().await.assignment.snapshot = Some(snapshot);
                }
                Ok(_) => {
                    self.inner.state.lock().await.assignment.snapshot = None;
                }
                Err(e) => return self.fetch_failed(update, e).await,
            }
        }
        if fetch_settings {
            debug!(settings = ?msg_settings_hash, "fetching settings");
            match self.inner.client.settings().await {
                Ok(settings) => {
                    self.inner.state.lock().await.assignment.settings = Some(settings);
                }
                Err(e) => return self.fetch_failed(update, e).await,
            }
        }

        let (assignment, has_snapshot, target, mode, editor_token) = {
            let st = self.inner.state.lock().await;
            (
                st.assignment.clone(),
                st.assignment.snapshot.is_some(),
                st.assignment.target_state,
                st.assignment.mode,
                st.assignment.editor_token.clone(),
            )
        };

        if !has_snapshot {
            // snapshot == null ⇒ the launcher must not be running
            if let Err(e) = self.inner.launcher.stop(true, StopReason::Stopped).await {
                warn!(error = %e, "launcher stop failed");
            }
            {
                let mut st = self.inner.state.lock().await;
                st.run_state = RunState::Stopped;
                st.updating = false;
            }
            self.persist(&assignment).await;
            self.sync_owner_subscription().await;
            self.check_in().await;
            return Ok(());
        }

        self.persist(&assignment).await;

        if target == TargetState::Suspended {
            // materialize but honor the suspension
            if let Err(e) = self.inner.launcher.write_configuration(&assignment).await {
                warn!(error = %e, "configuration write failed");
            }
            let mut st = self.inner.state.lock().await;
            st.run_state = RunState::Suspended;
            st.updating = false;
        } else {
            self.inner.state.lock().await.run_state = RunState::Starting;
            match self.inner.launcher.start(&assignment).await {
                Ok(()) => {
                    let mut st = self.inner.state.lock().await;
                    st.run_state = RunState::Running;
                    st.updating = false;
                }
                Err(e) => {
                    warn!(error = %e, "launcher start failed");
                    let _ = self.inner.launcher.stop(false, StopReason::Stopped).await;
                    {
                        let mut st = self.inner.state.lock().await;
                        st.run_state = RunState::Error;
                        st.updating = false;
                    }
                    // no further queued updates after a hard error
                    self.inner.gate.lock().unwrap().pending = None;
                    self.check_in().await;
                    return Ok(());
                }
            }
        }

        self.inner.retry.cancel();
        self.sync_owner_subscription().await;

        if mode == AgentMode::Developer {
            if let Some(token) = editor_token {
                debug!("reopening editor tunnel with retained token");
                if let Err(e) = self.inner.tunnel.connect(&token).await {
                    warn!(error = %e, "editor tunnel reopen failed");
                }
            }
        }

        self.check_in().await;
        Ok(())
    }

    /// Nothing stale to fetch: adopt bookkeeping fields and make sure the
    /// launcher agrees with the target state. Deliberately quiet when there
    /// is nothing to do, since an echoed check-in must not trigger another
    /// check-in.
    async fn ensure_run_state(&self, update: &DesiredUpdate) -> Result<(), ReconcileError> {
        let (assignment, target, has_snapshot, mut changed) = {
            let mut st = self.inner.state.lock().await;
            let mut changed = false;
            if let Some(licensed) = update.licensed {
                if st.assignment.licensed != Some(licensed) {
                    st.assignment.licensed = Some(licensed);
                    changed = true;
                }
            }
            (
                st.assignment.clone(),
                st.assignment.target_state,
                st.assignment.snapshot.is_some(),
                changed,
            )
        };

        let launcher_state = self.inner.launcher.state().await;
        if target == TargetState::Running
            && has_snapshot
            && matches!(
                launcher_state,
                RunState::Stopped | RunState::Suspended | RunState::Unknown
            )
        {
            changed = true;
            self.inner.state.lock().await.run_state = RunState::Starting;
            match self.inner.launcher.start(&assignment).await {
                Ok(()) => self.inner.state.lock().await.run_state = RunState::Running,
                Err(e) => {
                    warn!(error = %e, "launcher start failed");
                    let _ = self.inner.launcher.stop(false, StopReason::Stopped).await;
                    self.inner.state.lock().await.run_state = RunState::Error;
                    self.inner.gate.lock().unwrap().pending = None;
                }
            }
        }

        if changed {
            self.persist(&assignment).await;
            self.check_in().await;
        }
        Ok(())
    }

    /// Divergence check when leaving developer mode. Returns true when the
    /// device must snap back to the platform view.
    async fn diverged_from(&self, platform: &Snapshot) -> Result<bool, ReconcileError> {
        let (owner_type, local_snapshot) = {
            let st = self.inner.state.lock().await;
            (st.assignment.owner_type, st.assignment.snapshot.clone())
        };
        let application_owned = owner_type == OwnerType::Application;

        let Some(local) = local_snapshot else {
            return Ok(true);
        };

        // 1. snapshot identity
        if platform.id != local.id {
            debug!(platform = %platform.id, local = %local.id, "snapshot id diverged");
            return Ok(true);
        }

        // 2. platform-reserved env keys
        let keys = reserved_env_keys(owner_type);
        let reserved_differ = keys
            .iter()
            .any(|key| platform.env.get(*key) != local.env.get(*key));
        if reserved_differ {
            if application_owned {
                // silently adopt the platform's reserved values, no reload
                debug!("adopting platform reserved env for application-owned device");
                let assignment = {
                    let mut st = self.inner.state.lock().await;
                    if let Some(snapshot) = st.assignment.snapshot.as_mut() {
                        for key in keys {
                            match platform.env.get(*key) {
                                Some(value) => {
                                    snapshot.env.insert((*key).to_string(), value.clone());
                                }
                                None => {
                                    snapshot.env.remove(*key);
                                }
                            }
                        }
                    }
                    st.assignment.clone()
                };
                self.persist(&assignment).await;
            } else {
                debug!("reserved env diverged on a project-owned device");
                return Ok(true);
            }
        }

        // 3. materialized content, except for the application starter sentinel
        if application_owned && platform.id == SENTINEL_SNAPSHOT_ID {
            return Ok(false);
        }

        let disk_flows = self
            .inner
            .launcher
            .read_flow()
            .await
            .unwrap_or(serde_json::Value::Null);
        if serde_json::to_string(&disk_flows).unwrap_or_default()
            != serde_json::to_string(&platform.flows).unwrap_or_default()
        {
            debug!("flows diverged from the platform snapshot");
            return Ok(true);
        }

        let disk_package = self
            .inner
            .launcher
            .read_package()
            .await
            .unwrap_or(serde_json::Value::Null);
        let disk_modules = disk_package
            .get("dependencies")
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}));
        let platform_modules =
            serde_json::to_value(&platform.modules).unwrap_or_else(|_| serde_json::json!({}));
        if disk_modules != platform_modules {
            debug!("modules diverged from the platform snapshot");
            return Ok(true);
        }

        Ok(false)
    }

    /// Transient snapshot/settings fetch failure: report `error`, discard
    /// any pending update, and hand the provoking document to the retry
    /// timer by value.
    async fn fetch_failed(
        &self,
        update: DesiredUpdate,
        err: TransportError,
    ) -> Result<(), ReconcileError> {
        warn!(error = %err, "platform fetch failed, scheduling retry");
        {
            let mut st = self.inner.state.lock().await;
            st.run_state = RunState::Error;
            st.updating = false;
        }
        self.inner.gate.lock().unwrap().pending = None;
        self.inner
            .retry
            .request(DesiredState::Update(Box::new(update)));
        self.check_in().await;
        Ok(())
    }

    // ── Run-state actions ─────────────────────────────────────────────────────

    pub async fn start_nr(&self) -> Result<(), ReconcileError> {
        self.inner.retry.cancel();
        self.set_state(DesiredState::TargetState(TargetState::Running))
            .await;
        Ok(())
    }

    /// Guarantees a running launcher is torn down and recreated from the
    /// same assignment.
    pub async fn restart_nr(&self) -> Result<(), ReconcileError> {
        self.inner.retry.cancel();
        self.inner.state.lock().await.run_state = RunState::Restarting;
        self.inner
            .launcher
            .stop(false, StopReason::Restarting)
            .await?;
        self.set_state(DesiredState::TargetState(TargetState::Running))
            .await;
        Ok(())
    }

    pub async fn suspend_nr(&self) -> Result<(), ReconcileError> {
        self.inner.retry.cancel();
        self.set_state(DesiredState::TargetState(TargetState::Suspended))
            .await;
        Ok(())
    }

    // ── Observation ───────────────────────────────────────────────────────────

    /// Snapshot of the current assignment for check-ins. `None` while an
    /// update is in progress.
    pub async fn state_report(&self) -> Option<StateReport> {
        let launcher_state = self.inner.launcher.state().await;
        let restart_count = self.inner.launcher.restart_count().await;
        let runtime_version = self.inner.launcher.runtime_version().await;

        let st = self.inner.state.lock().await;
        if st.updating {
            return None;
        }

        // once the launcher is up, its own view (running/safe/crashed) is
        // more truthful than the optimistic `starting`
        let state = match st.run_state {
            RunState::Starting | RunState::Running => match launcher_state {
                RunState::Running
                | RunState::Safe
                | RunState::Crashed
                | RunState::Loading
                | RunState::Installing
                | RunState::Starting => launcher_state,
                _ => st.run_state,
            },
            other => other,
        };

        Some(StateReport {
            project: st.assignment.project.clone(),
            application: st.assignment.application.clone(),
            owner_type: st.assignment.owner_type,
            snapshot: st.assignment.snapshot_id().map(String::from),
            settings: st.assignment.settings_hash().map(String::from),
            state,
            mode: st.assignment.mode,
            target_state: st.assignment.target_state,
            licensed: st.assignment.licensed,
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            runtime_version,
            health: Health {
                uptime: self.inner.started_at.elapsed().as_secs(),
                snapshot_restart_count: restart_count,
            },
        })
    }

    /// Persist the editor token/affinity when either changed.
    pub async fn save_editor_token(&self, token: Option<String>, affinity: Option<String>) {
        let changed = {
            let mut st = self.inner.state.lock().await;
            if st.assignment.editor_token != token || st.assignment.editor_affinity != affinity {
                st.assignment.editor_token = token;
                st.assignment.editor_affinity = affinity;
                true
            } else {
                false
            }
        };
        if changed {
            let assignment = self.inner.state.lock().await.assignment.clone();
            self.persist(&assignment).await;
        }
    }

    // ── Plumbing ──────────────────────────────────────────────────────────────

    /// Disk errors are logged; the reconciler continues with its in-memory
    /// state.
    async fn persist(&self, assignment: &Assignment) {
        if let Err(e) = self.inner.store.save(assignment).await {
            warn!(error = %e, "assignment persist failed, continuing in memory");
        }
    }

    async fn check_in(&self) {
        let transport = self.inner.transport.read().await.clone();
        let Some(transport) = transport else { return };
        // wait out a racing update for a few beats before giving up
        for _ in 0..3 {
            if self.state_report().await.is_some() {
                transport.check_in().await;
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        }
        debug!("check-in skipped, update still in progress");
    }

    async fn sync_owner_subscription(&self) {
        let (owner_type, owner_id) = {
            let st = self.inner.state.lock().await;
            (
                st.assignment.owner_type,
                st.assignment.owner_id().map(String::from),
            )
        };
        let transport = self.inner.transport.read().await.clone();
        if let Some(transport) = transport {
            transport.set_owner(owner_type, owner_id).await;
        }
    }

    #[cfg(test)]
    fn retry_scheduled(&self) -> bool {
        self.inner.retry.is_scheduled()
    }
}

#[async_trait::async_trait]
impl AgentHandle for Reconciler {
    async fn deliver(&self, state: DesiredState) {
        self.set_state(state).await;
    }

    async fn report(&self) -> Option<StateReport> {
        self.state_report().await
    }

    async fn action(&self, action: RunAction) -> bool {
        let result = match action {
            RunAction::Start => self.start_nr().await,
            RunAction::Restart => self.restart_nr().await,
            RunAction::Suspend => self.suspend_nr().await,
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(action = %action, error = %e, "run-state action failed");
                false
            }
        }
    }

    async fn save_editor_token(&self, token: Option<String>, affinity: Option<String>) {
        Reconciler::save_editor_token(self, token, affinity).await;
    }
}
