use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use edgeflow_domain::{DesiredState, DesiredUpdate, LogEntry, OwnerType};
use edgeflow_launcher::Launcher;
use edgeflow_timer::{JitteredTimer, TimerOptions, TimerSchedule};
use edgeflow_tunnel::Tunnel;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, Transport as MqttTransport};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::ring::LogRing;
use crate::transport::{echo_update, AgentHandle, RunAction, Transport};

/// Fixed reconnect period after a broker connection error.
const RECONNECT_PERIOD: Duration = Duration::from_secs(15);
/// Window the platform has to answer the initial check-in with an `update`
/// before the locally-held state is delivered so the device can progress.
const INITIAL_CHECKIN_TIMEOUT: Duration = Duration::from_secs(10);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);
const HEARTBEAT_JITTER: Duration = Duration::from_secs(5);
/// Log records retained for the `startLog` backfill.
const LOG_RING_CAPACITY: usize = 10;

// ── Settings & topics ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub url: String,
    pub username: String,
    pub password: String,
    pub team_id: String,
    pub device_id: String,
}

impl BrokerSettings {
    /// Derive the topic scope from the platform credential convention
    /// `device:<team>:<device>`.
    pub fn from_credentials(
        url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, TransportError> {
        let username = username.into();
        let mut parts = username.split(':');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some("device"), Some(team), Some(device), None) => Ok(Self {
                url: url.into(),
                team_id: team.to_string(),
                device_id: device.to_string(),
                username,
                password: password.into(),
            }),
            _ => Err(TransportError::Broker(format!(
                "broker username {username:?} is not of the form device:<team>:<device>"
            ))),
        }
    }
}

/// Topic construction under `ff/v1/<team>/`.
#[derive(Debug, Clone)]
struct Topics {
    team_id: String,
    device_id: String,
}

impl Topics {
    fn scoped(&self, scope: char, id: &str, tail: &str) -> String {
        format!("ff/v1/{}/{}/{}/{}", self.team_id, scope, id, tail)
    }

    fn device_command(&self) -> String {
        self.scoped('d', &self.device_id, "command")
    }

    fn owner_command(&self, owner: OwnerType, id: &str) -> Option<String> {
        match owner {
            OwnerType::Project => Some(self.scoped('p', id, "command")),
            OwnerType::Application => Some(self.scoped('a', id, "command")),
            OwnerType::None => None,
        }
    }

    fn status(&self) -> String {
        self.scoped('d', &self.device_id, "status")
    }

    fn logs(&self) -> String {
        self.scoped('d', &self.device_id, "logs")
    }

    fn response(&self) -> String {
        self.scoped('d', &self.device_id, "response")
    }
}

// ── Command envelope ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommandEnvelope {
    command: String,
    #[serde(default)]
    correlation_data: Option<serde_json::Value>,
    #[serde(default)]
    response_topic: Option<String>,
    #[serde(default)]
    payload: serde_json::Value,
}

// ── BrokerTransport ───────────────────────────────────────────────────────────

struct BrokerState {
    client: Option<AsyncClient>,
    owner_topic: Option<String>,
    heartbeat: Option<JitteredTimer>,
    initial_checkin: Option<tokio::task::JoinHandle<()>>,
    first_connect_done: bool,
    streaming: bool,
    ring: LogRing,
    cancel: Option<CancellationToken>,
    /// Everything handed to the broker client, observable without one.
    #[cfg(test)]
    published: Vec<(String, serde_json::Value)>,
}

struct Inner {
    settings: BrokerSettings,
    topics: Topics,
    agent: Arc<dyn AgentHandle>,
    launcher: Arc<dyn Launcher>,
    tunnel: Arc<dyn Tunnel>,
    state: Mutex<BrokerState>,
}

/// MQTT control plane: command subscriptions, status/log/response
/// publishing, heartbeats. Stays connected for the agent's lifetime;
/// connection errors re-poll the event loop on a fixed 15 s period.
#[derive(Clone)]
pub struct BrokerTransport {
    inner: Arc<Inner>,
}

impl BrokerTransport {
    pub fn new(
        settings: BrokerSettings,
        agent: Arc<dyn AgentHandle>,
        launcher: Arc<dyn Launcher>,
        tunnel: Arc<dyn Tunnel>,
    ) -> Self {
        let topics = Topics {
            team_id: settings.team_id.clone(),
            device_id: settings.device_id.clone(),
        };
        Self {
            inner: Arc::new(Inner {
                settings,
                topics,
                agent,
                launcher,
                tunnel,
                state: Mutex::new(BrokerState {
                    client: None,
                    owner_topic: None,
                    heartbeat: None,
                    initial_checkin: None,
                    first_connect_done: false,
                    streaming: false,
                    ring: LogRing::new(LOG_RING_CAPACITY),
                    cancel: None,
                    #[cfg(test)]
                    published: Vec::new(),
                }),
            }),
        }
    }

    async fn publish_json(&self, topic: String, payload: &serde_json::Value) {
        #[cfg(test)]
        self.inner
            .state
            .lock()
            .await
            .published
            .push((topic.clone(), payload.clone()));

        let client = self.inner.state.lock().await.client.clone();
        let Some(client) = client else { return };
        let bytes = match serde_json::to_vec(payload) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "unserializable broker payload");
                return;
            }
        };
        if let Err(e) = client.publish(&topic, QoS::AtMostOnce, false, bytes).await {
            warn!(topic, error = %e, "broker publish failed");
        }
    }

    async fn publish_status(&self) {
        let Some(report) = self.inner.agent.report().await else {
            debug!("update in progress, skipping status publish");
            return;
        };
        match serde_json::to_value(&report) {
            Ok(v) => self.publish_json(self.inner.topics.status(), &v).await,
            Err(e) => warn!(error = %e, "unserializable state report"),
        }
    }

    async fn on_connect(&self) {
        info!(device = %self.inner.settings.device_id, "broker connected");
        // status goes out before any subscription
        self.publish_status().await;

        let (client, owner_topic, first) = {
            let state = self.inner.state.lock().await;
            (
                state.client.clone(),
                state.owner_topic.clone(),
                !state.first_connect_done,
            )
        };
        let Some(client) = client else { return };

        let device_command = self.inner.topics.device_command();
        if let Err(e) = client.subscribe(&device_command, QoS::AtMostOnce).await {
            warn!(topic = %device_command, error = %e, "subscribe failed");
        }
        if let Some(topic) = owner_topic {
            if let Err(e) = client.subscribe(&topic, QoS::AtMostOnce).await {
                warn!(topic = %topic, error = %e, "owner subscribe failed");
            }
        }

        if first {
            let mut state = self.inner.state.lock().await;
            state.first_connect_done = true;
            let this = self.clone();
            state.initial_checkin = Some(tokio::spawn(async move {
                tokio::time::sleep(INITIAL_CHECKIN_TIMEOUT).await;
                info!("no update within the initial check-in window, proceeding with held state");
                if let Some(report) = this.inner.agent.report().await {
                    this.inner.agent.deliver(echo_update(&report)).await;
                }
            }));
        }
    }

    async fn on_message(&self, topic: &str, payload: &[u8]) {
        let envelope: CommandEnvelope = match serde_json::from_slice(payload) {
            Ok(e) => e,
            Err(e) => {
                debug!(topic, error = %e, "ignoring unparseable command");
                return;
            }
        };
        debug!(topic, command = %envelope.command, "broker command");
        self.handle_command(envelope).await;
    }

    async fn respond(&self, envelope: &CommandEnvelope, result: serde_json::Value) {
        // absent correlation data, no response
        let Some(correlation) = &envelope.correlation_data else {
            return;
        };
        let topic = envelope
            .response_topic
            .clone()
            .unwrap_or_else(|| self.inner.topics.response());
        let body = serde_json::json!({
            "command": envelope.command,
            "correlationData": correlation,
            "payload": result,
        });
        self.publish_json(topic, &body).await;
    }

    async fn handle_command(&self, envelope: CommandEnvelope) {
        match envelope.command.as_str() {
            "update" => {
                if let Some(handle) = self.inner.state.lock().await.initial_checkin.take() {
                    handle.abort();
                }
                let state = if envelope.payload.is_null() {
                    DesiredState::Null
                } else {
                    match serde_json::from_value::<DesiredUpdate>(envelope.payload.clone()) {
                        Ok(update) => DesiredState::from_update(update),
                        Err(e) => {
                            warn!(error = %e, "unparseable update payload");
                            return;
                        }
                    }
                };
                self.inner.agent.deliver(state).await;
            }
            "startLog" => {
                let backfill = {
                    let mut state = self.inner.state.lock().await;
                    state.streaming = true;
                    state.ring.snapshot()
                };
                for entry in backfill {
                    if let Ok(v) = serde_json::to_value(&entry) {
                        self.publish_json(self.inner.topics.logs(), &v).await;
                    }
                }
            }
            "stopLog" => {
                self.inner.state.lock().await.streaming = false;
            }
            "startEditor" => {
                let Some(token) = envelope.payload.get("token").and_then(|t| t.as_str()) else {
                    self.respond(&envelope, serde_json::json!({ "connected": false }))
                        .await;
                    return;
                };
                let connected = match self.inner.tunnel.connect(token).await {
                    Ok(ok) => ok,
                    Err(e) => {
                        warn!(error = %e, "editor tunnel connect failed");
                        false
                    }
                };
                let affinity = self.inner.tunnel.affinity().await;
                if connected {
                    self.inner
                        .agent
                        .save_editor_token(Some(token.to_string()), affinity.clone())
                        .await;
                }
                self.respond(
                    &envelope,
                    serde_json::json!({ "connected": connected, "affinity": affinity }),
                )
                .await;
            }
            "stopEditor" => {
                self.inner.tunnel.close().await;
                self.inner.agent.save_editor_token(None, None).await;
                self.respond(&envelope, serde_json::json!({ "success": true }))
                    .await;
            }
            "upload" => {
                let flows = self.inner.launcher.read_flow().await.unwrap_or_default();
                let credentials = self
                    .inner
                    .launcher
                    .read_credentials()
                    .await
                    .unwrap_or_default();
                let package = self.inner.launcher.read_package().await.unwrap_or_default();
                let state = self
                    .inner
                    .agent
                    .report()
                    .await
                    .and_then(|r| serde_json::to_value(r).ok())
                    .unwrap_or_default();
                self.respond(
                    &envelope,
                    serde_json::json!({
                        "flows": flows,
                        "credentials": credentials,
                        "package": package,
                        "state": state,
                    }),
                )
                .await;
            }
            "action" => {
                let action = envelope
                    .payload
                    .get("action")
                    .and_then(|a| a.as_str())
                    .and_then(RunAction::parse);
                let success = match action {
                    Some(action) => self.inner.agent.action(action).await,
                    None => {
                        warn!(payload = %envelope.payload, "unknown action");
                        false
                    }
                };
                self.respond(&envelope, serde_json::json!({ "success": success }))
                    .await;
            }
            other => {
                warn!(command = other, "unknown broker command");
            }
        }
    }

    /// Feed launcher logs into the retained ring, publishing live when a
    /// viewer has asked for the stream.
    fn spawn_log_feeder(&self, cancel: CancellationToken) {
        let this = self.clone();
        let mut rx = self.inner.launcher.subscribe_logs();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    entry = rx.recv() => match entry {
                        Ok(entry) => this.log_record(entry).await,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "log feeder lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
    }

    async fn log_record(&self, entry: LogEntry) {
        let streaming = {
            let mut state = self.inner.state.lock().await;
            state.ring.push(entry.clone());
            state.streaming
        };
        if streaming {
            if let Ok(v) = serde_json::to_value(&entry) {
                self.publish_json(self.inner.topics.logs(), &v).await;
            }
        }
    }
}

fn mqtt_options(settings: &BrokerSettings) -> Result<MqttOptions, TransportError> {
    let url = settings.url.as_str();
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| TransportError::BrokerUrl(url.to_string()))?;
    let authority = rest.split('/').next().unwrap_or(rest);
    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) => (
            h.to_string(),
            p.parse::<u16>()
                .map_err(|_| TransportError::BrokerUrl(url.to_string()))?,
        ),
        None => (authority.to_string(), 0),
    };

    let client_id = format!("edgeflow:{}", settings.device_id);
    let mut opts = match scheme {
        "mqtt" | "tcp" => MqttOptions::new(client_id, host, if port == 0 { 1883 } else { port }),
        "mqtts" | "ssl" => {
            let mut o = MqttOptions::new(client_id, host, if port == 0 { 8883 } else { port });
            o.set_transport(MqttTransport::tls_with_default_config());
            o
        }
        // websocket brokers take the full URL; proxy selection for these
        // maps ws(s) to http(s), see crate::proxy
        "ws" => {
            let mut o = MqttOptions::new(client_id, url, if port == 0 { 80 } else { port });
            o.set_transport(MqttTransport::Ws);
            o
        }
        "wss" => {
            let mut o = MqttOptions::new(client_id, url, if port == 0 { 443 } else { port });
            o.set_transport(MqttTransport::wss_with_default_config());
            o
        }
        other => {
            return Err(TransportError::BrokerUrl(format!(
                "unsupported broker scheme {other}"
            )))
        }
    };
    opts.set_credentials(&settings.username, &settings.password);
    opts.set_keep_alive(Duration::from_secs(30));
    opts.set_clean_session(true);
    Ok(opts)
}

#[async_trait]
impl Transport for BrokerTransport {
    async fn start(&self) -> Result<(), TransportError> {
        let opts = mqtt_options(&self.inner.settings)?;
        let (client, mut eventloop) = AsyncClient::new(opts, 32);
        let cancel = CancellationToken::new();

        {
            let mut state = self.inner.state.lock().await;
            state.client = Some(client);
            state.cancel = Some(cancel.clone());

            let this = self.clone();
            state.heartbeat = Some(JitteredTimer::spawn(
                TimerSchedule::fixed(HEARTBEAT_INTERVAL, HEARTBEAT_JITTER),
                // a slow status publish must not delay the next heartbeat
                TimerOptions { await_callback: false },
                move |_| {
                    let this = this.clone();
                    async move { this.publish_status().await }
                },
            ));
        }

        self.spawn_log_feeder(cancel.clone());

        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = eventloop.poll() => match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => this.on_connect().await,
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            this.on_message(&publish.topic, &publish.payload).await;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(error = %e, "broker connection error, reconnecting in 15s");
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                _ = tokio::time::sleep(RECONNECT_PERIOD) => {}
                            }
                        }
                    }
                }
            }
            debug!("broker event loop stopped");
        });

        info!(url = %self.inner.settings.url, "broker transport started");
        Ok(())
    }

    async fn stop(&self) {
        let mut state = self.inner.state.lock().await;
        if let Some(heartbeat) = state.heartbeat.take() {
            heartbeat.stop();
        }
        if let Some(handle) = state.initial_checkin.take() {
            handle.abort();
        }
        if let Some(cancel) = state.cancel.take() {
            cancel.cancel();
        }
        if let Some(client) = state.client.take() {
            let _ = client.disconnect().await;
        }
    }

    async fn check_in(&self) {
        self.publish_status().await;
    }

    async fn log(&self, entry: LogEntry) {
        self.log_record(entry).await;
    }

    async fn set_owner(&self, owner: OwnerType, id: Option<String>) {
        let new_topic = id.and_then(|id| self.inner.topics.owner_command(owner, &id));
        let (client, old_topic) = {
            let mut state = self.inner.state.lock().await;
            if state.owner_topic == new_topic {
                return;
            }
            let old = state.owner_topic.take();
            state.owner_topic = new_topic.clone();
            (state.client.clone(), old)
        };
        let Some(client) = client else { return };

        if let Some(old) = old_topic {
            debug!(topic = %old, "unsubscribing previous owner topic");
            let _ = client.unsubscribe(&old).await;
        }
        if let Some(new) = new_topic {
            info!(topic = %new, "subscribing owner topic");
            if let Err(e) = client.subscribe(&new, QoS::AtMostOnce).await {
                warn!(topic = %new, error = %e, "owner subscribe failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> BrokerSettings {
        BrokerSettings::from_credentials(
            "mqtts://broker.example.com:8883",
            "device:team-1:dev-1",
            "pw",
        )
        .unwrap()
    }

    #[test]
    fn credentials_derive_topic_scope() {
        let s = settings();
        assert_eq!(s.team_id, "team-1");
        assert_eq!(s.device_id, "dev-1");
    }

    #[test]
    fn malformed_credentials_are_rejected() {
        assert!(BrokerSettings::from_credentials("mqtt://b", "dev-1", "pw").is_err());
        assert!(BrokerSettings::from_credentials("mqtt://b", "device:only-team", "pw").is_err());
    }

    #[test]
    fn topics_follow_the_platform_scheme() {
        let t = Topics {
            team_id: "team-1".into(),
            device_id: "dev-1".into(),
        };
        assert_eq!(t.device_command(), "ff/v1/team-1/d/dev-1/command");
        assert_eq!(t.status(), "ff/v1/team-1/d/dev-1/status");
        assert_eq!(t.logs(), "ff/v1/team-1/d/dev-1/logs");
        assert_eq!(t.response(), "ff/v1/team-1/d/dev-1/response");
        assert_eq!(
            t.owner_command(OwnerType::Project, "p1").unwrap(),
            "ff/v1/team-1/p/p1/command"
        );
        assert_eq!(
            t.owner_command(OwnerType::Application, "a1").unwrap(),
            "ff/v1/team-1/a/a1/command"
        );
        assert!(t.owner_command(OwnerType::None, "x").is_none());
    }

    #[test]
    fn mqtt_url_schemes_resolve_host_and_port() {
        let s = settings();
        let opts = mqtt_options(&s).unwrap();
        assert_eq!(opts.broker_address(), ("broker.example.com".to_string(), 8883));

        let plain = BrokerSettings {
            url: "mqtt://broker.example.com".into(),
            ..s.clone()
        };
        let opts = mqtt_options(&plain).unwrap();
        assert_eq!(opts.broker_address().1, 1883);

        let bad = BrokerSettings {
            url: "broker.example.com".into(),
            ..s
        };
        assert!(mqtt_options(&bad).is_err());
    }

    #[test]
    fn command_envelope_tolerates_missing_fields() {
        let env: CommandEnvelope = serde_json::from_str(r#"{"command": "stopLog"}"#).unwrap();
        assert_eq!(env.command, "stopLog");
        assert!(env.correlation_data.is_none());
        assert!(env.payload.is_null());
    }

    // ── Command handling against fakes ────────────────────────────────────────

    use edgeflow_domain::{
        AgentMode, Assignment, DesiredState, Health, RunState, StateReport, TargetState,
    };
    use edgeflow_launcher::{LaunchError, StopReason};
    use edgeflow_tunnel::TunnelError;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};
    use tokio::sync::broadcast;

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

    #[derive(Default)]
    struct RecordingAgent {
        delivered: StdMutex<Vec<DesiredState>>,
        actions: StdMutex<Vec<RunAction>>,
        saved: StdMutex<Vec<(Option<String>, Option<String>)>>,
    }

    #[async_trait]
    impl AgentHandle for RecordingAgent {
        async fn deliver(&self, state: DesiredState) {
            self.delivered.lock().unwrap().push(state);
        }
        async fn report(&self) -> Option<StateReport> {
            Some(report())
        }
        async fn action(&self, action: RunAction) -> bool {
            self.actions.lock().unwrap().push(action);
            true
        }
        async fn save_editor_token(&self, token: Option<String>, affinity: Option<String>) {
            self.saved.lock().unwrap().push((token, affinity));
        }
    }

    struct FakeLauncher {
        flows: StdMutex<serde_json::Value>,
        package: StdMutex<serde_json::Value>,
        logs: broadcast::Sender<LogEntry>,
    }

    impl FakeLauncher {
        fn new() -> Self {
            let (logs, _) = broadcast::channel(16);
            Self {
                flows: StdMutex::new(serde_json::Value::Null),
                package: StdMutex::new(serde_json::Value::Null),
                logs,
            }
        }
    }

    #[async_trait]
    impl Launcher for FakeLauncher {
        async fn start(&self, _assignment: &Assignment) -> Result<(), LaunchError> {
            Ok(())
        }
        async fn stop(&self, _clean: bool, _reason: StopReason) -> Result<(), LaunchError> {
            Ok(())
        }
        async fn write_configuration(&self, _assignment: &Assignment) -> Result<(), LaunchError> {
            Ok(())
        }
        async fn read_flow(&self) -> Result<serde_json::Value, LaunchError> {
            Ok(self.flows.lock().unwrap().clone())
        }
        async fn read_package(&self) -> Result<serde_json::Value, LaunchError> {
            Ok(self.package.lock().unwrap().clone())
        }
        async fn read_credentials(&self) -> Result<serde_json::Value, LaunchError> {
            Ok(serde_json::Value::String("creds".into()))
        }
        async fn state(&self) -> RunState {
            RunState::Running
        }
        async fn restart_count(&self) -> u32 {
            0
        }
        async fn runtime_version(&self) -> Option<String> {
            None
        }
        fn subscribe_logs(&self) -> broadcast::Receiver<LogEntry> {
            self.logs.subscribe()
        }
    }

    struct FakeTunnel {
        accept: AtomicBool,
        connects: StdMutex<Vec<String>>,
        closes: AtomicU32,
    }

    impl FakeTunnel {
        fn new() -> Self {
            Self {
                accept: AtomicBool::new(true),
                connects: StdMutex::new(Vec::new()),
                closes: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Tunnel for FakeTunnel {
        async fn connect(&self, token: &str) -> Result<bool, TunnelError> {
            self.connects.lock().unwrap().push(token.to_string());
            Ok(self.accept.load(Ordering::SeqCst))
        }
        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
        async fn affinity(&self) -> Option<String> {
            Some("FFSESSION=aff".into())
        }
    }

    struct Fx {
        transport: BrokerTransport,
        agent: Arc<RecordingAgent>,
        launcher: Arc<FakeLauncher>,
        tunnel: Arc<FakeTunnel>,
    }

    fn fixture() -> Fx {
        let agent = Arc::new(RecordingAgent::default());
        let launcher = Arc::new(FakeLauncher::new());
        let tunnel = Arc::new(FakeTunnel::new());
        let transport = BrokerTransport::new(
            settings(),
            agent.clone(),
            launcher.clone(),
            tunnel.clone(),
        );
        Fx {
            transport,
            agent,
            launcher,
            tunnel,
        }
    }

    fn envelope(
        command: &str,
        payload: serde_json::Value,
        correlated: bool,
        response_topic: Option<&str>,
    ) -> CommandEnvelope {
        CommandEnvelope {
            command: command.into(),
            correlation_data: correlated.then(|| serde_json::json!("corr-1")),
            response_topic: response_topic.map(String::from),
            payload,
        }
    }

    fn entry(n: i64) -> LogEntry {
        LogEntry {
            ts: n,
            level: "info".into(),
            msg: format!("m{n}"),
        }
    }

    async fn published(transport: &BrokerTransport) -> Vec<(String, serde_json::Value)> {
        transport.inner.state.lock().await.published.clone()
    }

    #[tokio::test]
    async fn update_command_cancels_initial_checkin_and_delivers() {
        let fx = fixture();
        let fired = Arc::new(AtomicBool::new(false));
        {
            let fired = fired.clone();
            fx.transport.inner.state.lock().await.initial_checkin =
                Some(tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    fired.store(true, Ordering::SeqCst);
                }));
        }

        fx.transport
            .handle_command(envelope(
                "update",
                serde_json::json!({ "snapshot": "s2" }),
                false,
                None,
            ))
            .await;

        let delivered = fx.agent.delivered.lock().unwrap().clone();
        match &delivered[..] {
            [DesiredState::Update(update)] => {
                assert_eq!(update.snapshot, Some(Some("s2".into())));
            }
            other => panic!("expected one update, got {other:?}"),
        }
        assert!(fx.transport.inner.state.lock().await.initial_checkin.is_none());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(
            !fired.load(Ordering::SeqCst),
            "initial check-in timer should be aborted"
        );
    }

    #[tokio::test]
    async fn null_update_payload_delivers_null() {
        let fx = fixture();
        fx.transport
            .handle_command(envelope("update", serde_json::Value::Null, false, None))
            .await;
        assert_eq!(
            fx.agent.delivered.lock().unwrap().as_slice(),
            &[DesiredState::Null]
        );
    }

    #[tokio::test]
    async fn start_log_backfills_ring_before_streaming_live() {
        let fx = fixture();
        fx.transport.log(entry(1)).await;
        fx.transport.log(entry(2)).await;
        // retained only, nothing published while no viewer streams
        assert!(published(&fx.transport).await.is_empty());

        fx.transport
            .handle_command(envelope("startLog", serde_json::Value::Null, false, None))
            .await;
        let backfill = published(&fx.transport).await;
        assert_eq!(backfill.len(), 2);
        assert!(backfill
            .iter()
            .all(|(topic, _)| topic == "ff/v1/team-1/d/dev-1/logs"));
        assert_eq!(backfill[0].1["ts"], 1);
        assert_eq!(backfill[1].1["ts"], 2);

        fx.transport.log(entry(3)).await;
        assert_eq!(published(&fx.transport).await.len(), 3);

        fx.transport
            .handle_command(envelope("stopLog", serde_json::Value::Null, false, None))
            .await;
        fx.transport.log(entry(4)).await;
        assert_eq!(published(&fx.transport).await.len(), 3);
    }

    #[tokio::test]
    async fn start_editor_persists_token_on_success() {
        let fx = fixture();
        fx.transport
            .handle_command(envelope(
                "startEditor",
                serde_json::json!({ "token": "tok-1" }),
                true,
                None,
            ))
            .await;

        assert_eq!(fx.tunnel.connects.lock().unwrap().as_slice(), ["tok-1"]);
        assert_eq!(
            fx.agent.saved.lock().unwrap().as_slice(),
            &[(Some("tok-1".to_string()), Some("FFSESSION=aff".to_string()))]
        );

        let mut publishes = published(&fx.transport).await;
        let (topic, body) = publishes.pop().unwrap();
        assert_eq!(topic, "ff/v1/team-1/d/dev-1/response");
        assert_eq!(body["command"], "startEditor");
        assert_eq!(body["correlationData"], "corr-1");
        assert_eq!(body["payload"]["connected"], true);
        assert_eq!(body["payload"]["affinity"], "FFSESSION=aff");
    }

    #[tokio::test]
    async fn start_editor_failure_does_not_persist() {
        let fx = fixture();
        fx.tunnel.accept.store(false, Ordering::SeqCst);
        fx.transport
            .handle_command(envelope(
                "startEditor",
                serde_json::json!({ "token": "tok-1" }),
                true,
                None,
            ))
            .await;

        assert!(fx.agent.saved.lock().unwrap().is_empty());
        let mut publishes = published(&fx.transport).await;
        let (_, body) = publishes.pop().unwrap();
        assert_eq!(body["payload"]["connected"], false);
    }

    #[tokio::test]
    async fn stop_editor_closes_and_clears_token() {
        let fx = fixture();
        fx.transport
            .handle_command(envelope("stopEditor", serde_json::Value::Null, true, None))
            .await;

        assert!(fx.tunnel.closes.load(Ordering::SeqCst) >= 1);
        assert_eq!(fx.agent.saved.lock().unwrap().as_slice(), &[(None, None)]);
        let mut publishes = published(&fx.transport).await;
        let (_, body) = publishes.pop().unwrap();
        assert_eq!(body["payload"]["success"], true);
    }

    #[tokio::test]
    async fn upload_assembles_flows_credentials_package_and_state() {
        let fx = fixture();
        *fx.launcher.flows.lock().unwrap() = serde_json::json!([{ "id": "n1" }]);
        *fx.launcher.package.lock().unwrap() =
            serde_json::json!({ "dependencies": { "node-red": "4.x" } });

        fx.transport
            .handle_command(envelope(
                "upload",
                serde_json::Value::Null,
                true,
                Some("custom/reply"),
            ))
            .await;

        let mut publishes = published(&fx.transport).await;
        let (topic, body) = publishes.pop().unwrap();
        // the caller-supplied response topic wins over the device default
        assert_eq!(topic, "custom/reply");
        assert_eq!(body["payload"]["flows"][0]["id"], "n1");
        assert_eq!(body["payload"]["credentials"], "creds");
        assert_eq!(body["payload"]["package"]["dependencies"]["node-red"], "4.x");
        assert_eq!(body["payload"]["state"]["project"], "p1");
    }

    #[tokio::test]
    async fn action_dispatches_to_the_agent() {
        let fx = fixture();
        fx.transport
            .handle_command(envelope(
                "action",
                serde_json::json!({ "action": "restart" }),
                true,
                None,
            ))
            .await;
        assert_eq!(
            fx.agent.actions.lock().unwrap().as_slice(),
            &[RunAction::Restart]
        );
        let mut publishes = published(&fx.transport).await;
        assert_eq!(publishes.pop().unwrap().1["payload"]["success"], true);

        fx.transport
            .handle_command(envelope(
                "action",
                serde_json::json!({ "action": "reboot" }),
                true,
                None,
            ))
            .await;
        assert_eq!(fx.agent.actions.lock().unwrap().len(), 1);
        let mut publishes = published(&fx.transport).await;
        assert_eq!(publishes.pop().unwrap().1["payload"]["success"], false);
    }

    #[tokio::test]
    async fn commands_without_correlation_data_get_no_response() {
        let fx = fixture();
        fx.transport
            .handle_command(envelope("upload", serde_json::Value::Null, false, None))
            .await;
        assert!(published(&fx.transport).await.is_empty());
    }

    #[tokio::test]
    async fn set_owner_swaps_the_owner_topic() {
        let fx = fixture();
        fx.transport
            .set_owner(OwnerType::Project, Some("p1".into()))
            .await;
        assert_eq!(
            fx.transport.inner.state.lock().await.owner_topic.as_deref(),
            Some("ff/v1/team-1/p/p1/command")
        );

        fx.transport
            .set_owner(OwnerType::Application, Some("a1".into()))
            .await;
        assert_eq!(
            fx.transport.inner.state.lock().await.owner_topic.as_deref(),
            Some("ff/v1/team-1/a/a1/command")
        );

        fx.transport.set_owner(OwnerType::None, None).await;
        assert!(fx.transport.inner.state.lock().await.owner_topic.is_none());
    }

    #[tokio::test]
    async fn connect_publishes_status_before_subscribing_and_arms_checkin() {
        let fx = fixture();
        // an inert client: requests queue until an event loop polls them
        let (client, _eventloop) = AsyncClient::new(mqtt_options(&settings()).unwrap(), 32);
        fx.transport.inner.state.lock().await.client = Some(client);

        fx.transport.on_connect().await;

        let publishes = published(&fx.transport).await;
        assert_eq!(publishes[0].0, "ff/v1/team-1/d/dev-1/status");
        assert_eq!(publishes[0].1["state"], "running");

        let state = fx.transport.inner.state.lock().await;
        assert!(state.first_connect_done);
        assert!(
            state.initial_checkin.is_some(),
            "first connect arms the initial check-in window"
        );
    }
}
