use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use edgeflow_domain::{
    DesiredState, DesiredUpdate, LogEntry, OwnerType, Settings, Snapshot, StateReport,
};
use edgeflow_timer::{JitteredTimer, TimerOptions, TimerSchedule};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::proxy::{proxy_for_url, ProxyEnv};
use crate::transport::{echo_update, AgentHandle, Transport};

/// Per-request timeout for all platform HTTP calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// ── PlatformClient ────────────────────────────────────────────────────────────

/// Outcome of a `POST live/state` check-in.
#[derive(Debug)]
pub enum CheckInResponse {
    /// 2xx: the platform accepted the reported state; no change.
    Accepted,
    /// 409: the platform disagrees; the body is the new desired state.
    NewState(DesiredUpdate),
    /// 404/401: the device or its credentials are unknown.
    Unknown,
}

/// Client for `forgeURL/api/v1/devices/<deviceId>/…`.
///
/// Used by the HTTP polling transport for check-ins and by the reconciler
/// for snapshot/settings fetches regardless of the active transport.
pub struct PlatformClient {
    http: reqwest::Client,
    base: String,
    device_id: String,
    token: String,
}

impl PlatformClient {
    pub fn new(
        forge_url: &str,
        device_id: &str,
        token: &str,
    ) -> Result<Self, TransportError> {
        let mut builder = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(format!("edgeflow-agent/{}", env!("CARGO_PKG_VERSION")));
        // explicit proxy wiring so no_proxy suffix rules apply uniformly
        builder = match proxy_for_url(forge_url, &ProxyEnv::from_env()) {
            Some(proxy) => builder.proxy(reqwest::Proxy::all(proxy.as_str())?),
            None => builder.no_proxy(),
        };
        let http = builder.build()?;
        Ok(Self {
            http,
            base: forge_url.trim_end_matches('/').to_string(),
            device_id: device_id.to_string(),
            token: token.to_string(),
        })
    }

    fn url(&self, tail: &str) -> String {
        format!("{}/api/v1/devices/{}/{}", self.base, self.device_id, tail)
    }

    pub async fn snapshot(&self) -> Result<Snapshot, TransportError> {
        let response = self
            .http
            .get(self.url("live/snapshot"))
            .bearer_auth(&self.token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(TransportError::UnexpectedStatus {
                status: response.status().as_u16(),
            });
        }
        Ok(response.json().await?)
    }

    pub async fn settings(&self) -> Result<Settings, TransportError> {
        let response = self
            .http
            .get(self.url("live/settings"))
            .bearer_auth(&self.token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(TransportError::UnexpectedStatus {
                status: response.status().as_u16(),
            });
        }
        Ok(response.json().await?)
    }

    pub async fn post_state(
        &self,
        report: &StateReport,
    ) -> Result<CheckInResponse, TransportError> {
        let response = self
            .http
            .post(self.url("live/state"))
            .bearer_auth(&self.token)
            .json(report)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(CheckInResponse::Accepted);
        }
        match status.as_u16() {
            409 => {
                let update: DesiredUpdate = response.json().await?;
                Ok(CheckInResponse::NewState(update))
            }
            404 | 401 => Ok(CheckInResponse::Unknown),
            other => Err(TransportError::UnexpectedStatus { status: other }),
        }
    }
}

// ── Provisioning seam ─────────────────────────────────────────────────────────

/// One-shot provisioning bootstrap, run on the first poll tick of a device
/// file still in provisioning mode. The bootstrap itself (device creation,
/// credential exchange, file rewrite) lives outside the agent core.
#[async_trait]
pub trait Provisioner: Send + Sync + 'static {
    async fn provision(&self) -> Result<(), TransportError>;
}

// ── HttpPolling ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PollConfig {
    pub interval: Duration,
    pub jitter: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            jitter: Duration::from_secs(10),
        }
    }
}

/// HTTP polling control plane: a jittered `POST live/state` loop whose
/// response doubles as the desired-state channel.
pub struct HttpPolling {
    client: Arc<PlatformClient>,
    agent: Arc<dyn AgentHandle>,
    poll: PollConfig,
    provisioner: Option<Arc<dyn Provisioner>>,
    timer: Mutex<Option<JitteredTimer>>,
}

impl HttpPolling {
    pub fn new(
        client: Arc<PlatformClient>,
        agent: Arc<dyn AgentHandle>,
        poll: PollConfig,
        provisioner: Option<Arc<dyn Provisioner>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            agent,
            poll,
            provisioner,
            timer: Mutex::new(None),
        })
    }

    async fn poll_once(self: &Arc<Self>) {
        if let Some(provisioner) = &self.provisioner {
            info!("device file is in provisioning mode, running provisioning once");
            if let Err(e) = provisioner.provision().await {
                warn!(error = %e, "provisioning failed");
            }
            self.stop().await;
            return;
        }

        let Some(report) = self.agent.report().await else {
            debug!("update in progress, skipping check-in");
            return;
        };

        match self.client.post_state(&report).await {
            Ok(CheckInResponse::Accepted) => {
                self.agent.deliver(echo_update(&report)).await;
            }
            Ok(CheckInResponse::NewState(update)) => {
                debug!("platform supplied a new desired state");
                self.agent.deliver(DesiredState::from_update(update)).await;
            }
            Ok(CheckInResponse::Unknown) => {
                warn!("device unknown to the platform or credentials rejected");
                self.agent.deliver(DesiredState::Null).await;
            }
            Err(e) => {
                // transient: the next poll retries
                warn!(error = %e, "check-in failed");
            }
        }
    }
}

#[async_trait]
impl Transport for HttpPolling {
    async fn start(&self) -> Result<(), TransportError> {
        // centre the poll on `interval`: base − jitter/2 + rand[0, jitter]
        let base = self.poll.interval.saturating_sub(self.poll.jitter / 2);
        let schedule = TimerSchedule::fixed(base, self.poll.jitter)
            .with_first(Duration::ZERO, Duration::from_millis(100));

        let this = Arc::new(self.clone_for_timer());
        let timer = JitteredTimer::spawn(schedule, TimerOptions::default(), move |_| {
            let this = this.clone();
            async move { this.poll_once().await }
        });
        *self.timer.lock().await = Some(timer);
        info!(interval = ?self.poll.interval, "http polling started");
        Ok(())
    }

    async fn stop(&self) {
        if let Some(timer) = self.timer.lock().await.take() {
            timer.stop();
        }
    }

    async fn check_in(&self) {
        let this = Arc::new(self.clone_for_timer());
        this.poll_once().await;
    }

    async fn log(&self, _entry: LogEntry) {
        // the polling transport has no log channel
    }

    async fn set_owner(&self, _owner: OwnerType, _id: Option<String>) {
        // owner scoping only affects broker subscriptions
    }
}

impl HttpPolling {
    /// Cheap structural clone sharing the client/agent, used to hand an
    /// owned handle to the timer callback.
    fn clone_for_timer(&self) -> HttpPolling {
        HttpPolling {
            client: self.client.clone(),
            agent: self.agent.clone(),
            poll: self.poll.clone(),
            provisioner: self.provisioner.clone(),
            timer: Mutex::new(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgeflow_domain::{AgentMode, Health, RunState, TargetState};
    use std::sync::Mutex as StdMutex;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn report() -> StateReport {
        StateReport {
            project: Some("p1".into()),
            application: None,
            owner_type: OwnerType::Project,
            snapshot: Some("s1".into()),
            settings: Some("h1".into()),
            state: RunState::Running,
            mode: AgentMode::Autonomous,
            target_state: TargetState::Running,
            licensed: None,
            agent_version: "test".into(),
            runtime_version: None,
            health: Health::default(),
        }
    }

    struct RecordingAgent {
        delivered: StdMutex<Vec<DesiredState>>,
    }

    impl RecordingAgent {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                delivered: StdMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl AgentHandle for RecordingAgent {
        async fn deliver(&self, state: DesiredState) {
            self.delivered.lock().unwrap().push(state);
        }
        async fn report(&self) -> Option<StateReport> {
            Some(report())
        }
        async fn action(&self, _action: crate::transport::RunAction) -> bool {
            true
        }
        async fn save_editor_token(&self, _token: Option<String>, _affinity: Option<String>) {}
    }

    async fn client(server: &MockServer) -> Arc<PlatformClient> {
        Arc::new(PlatformClient::new(&server.uri(), "dev-1", "tok").unwrap())
    }

    #[tokio::test]
    async fn snapshot_fetch_carries_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/devices/dev-1/live/snapshot"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "s1",
                "flows": [],
                "modules": {},
                "env": {}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let snapshot = client(&server).await.snapshot().await.unwrap();
        assert_eq!(snapshot.id, "s1");
    }

    #[tokio::test]
    async fn accepted_check_in_echoes_current_state() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/devices/dev-1/live/state"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let agent = RecordingAgent::new();
        let polling = HttpPolling::new(
            client(&server).await,
            agent.clone(),
            PollConfig::default(),
            None,
        );
        polling.check_in().await;

        let delivered = agent.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        match &delivered[0] {
            DesiredState::Update(u) => assert_eq!(u.snapshot, Some(Some("s1".into()))),
            other => panic!("expected echo update, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn conflict_delivers_the_body_as_desired_state() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/devices/dev-1/live/state"))
            .respond_with(ResponseTemplate::new(409).set_body_json(serde_json::json!({
                "project": "p2",
                "snapshot": "s2",
                "settings": "h2"
            })))
            .mount(&server)
            .await;

        let agent = RecordingAgent::new();
        let polling = HttpPolling::new(
            client(&server).await,
            agent.clone(),
            PollConfig::default(),
            None,
        );
        polling.check_in().await;

        let delivered = agent.delivered.lock().unwrap();
        match &delivered[0] {
            DesiredState::Update(u) => {
                assert_eq!(u.project, Some(Some("p2".into())));
                assert_eq!(u.snapshot, Some(Some("s2".into())));
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn auth_failures_deliver_null() {
        for status in [401, 404] {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/api/v1/devices/dev-1/live/state"))
                .respond_with(ResponseTemplate::new(status))
                .mount(&server)
                .await;

            let agent = RecordingAgent::new();
            let polling = HttpPolling::new(
                client(&server).await,
                agent.clone(),
                PollConfig::default(),
                None,
            );
            polling.check_in().await;

            let delivered = agent.delivered.lock().unwrap();
            assert_eq!(delivered.as_slice(), &[DesiredState::Null], "status {status}");
        }
    }

    #[tokio::test]
    async fn network_errors_deliver_nothing() {
        // no server listening on this port
        let dead = Arc::new(PlatformClient::new("http://127.0.0.1:1", "dev-1", "tok").unwrap());
        let agent = RecordingAgent::new();
        let polling = HttpPolling::new(dead, agent.clone(), PollConfig::default(), None);
        polling.check_in().await;
        assert!(agent.delivered.lock().unwrap().is_empty());
    }
}
