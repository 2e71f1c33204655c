use crate::config::{Protocol, ServerSpec};
use crate::errors::ProxyError;
use crate::index::{ToolAnnotations, ToolEntry};
use crate::secrets::{EnvFilter, EnvWarning};
use crate::upstream::backoff::Backoff;
use crate::upstream::isolation::launch_plan;
use crate::upstream::oauth::OauthFlow;
use crate::upstream::state::{
    FailureClass, HealthLevel, Phase, UpstreamState, classify_failure, command_resolvable,
};
use anyhow::{Result, anyhow};
use rmcp::model::CallToolRequestParam;
use rmcp::service::{NotificationContext, Peer, RoleClient, RunningService};
use rmcp::transport::{SseClientTransport, StreamableHttpClientTransport, TokioChildProcess};
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use rmcp::{ClientHandler, ServiceExt};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::process::Stdio;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::process::Command;
use tokio::sync::{Notify, RwLock, Semaphore, watch};
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const READY_POLL: Duration = Duration::from_millis(100);

/// Callbacks the manager hands each client at construction. The client only
/// ever holds this narrow interface, never the manager itself.
pub trait UpstreamSink: Send + Sync + 'static {
    fn state_changed(&self, server: &str, state: &UpstreamState);
    fn tools_listed(&self, server: &str, tools: Vec<ToolEntry>);
    fn progress(&self, server: &str, progress: serde_json::Value);
    fn env_warnings(&self, server: &str, warnings: &[EnvWarning]);
    /// Persist a concrete protocol chosen by auto-detection.
    fn protocol_detected(&self, server: &str, protocol: Protocol);
    /// Persist a client id issued by dynamic registration.
    fn client_id_issued(&self, server: &str, client_id: &str);
}

/// Result of one upstream tool invocation. `is_error` mirrors the MCP
/// result flag; transport and protocol failures surface as `Err` instead.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub text: String,
    pub is_error: bool,
}

type Service = RunningService<RoleClient, NotificationAdapter>;

/// One per configured upstream: owns the transport session and the
/// connection state machine, supervised by its own task.
pub struct UpstreamClient {
    name: String,
    spec: StdRwLock<ServerSpec>,
    state: StdRwLock<UpstreamState>,
    peer: RwLock<Option<Peer<RoleClient>>>,
    sink: Arc<dyn UpstreamSink>,
    pub(crate) oauth: Arc<OauthFlow>,
    env_filter: Arc<EnvFilter>,
    call_timeout: Duration,
    connect_permits: Arc<Semaphore>,
    relist: Arc<Notify>,
    spec_changed: Notify,
    force_reconnect: Notify,
    shutdown_tx: watch::Sender<bool>,
}

impl UpstreamClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        spec: ServerSpec,
        sink: Arc<dyn UpstreamSink>,
        oauth: Arc<OauthFlow>,
        env_filter: Arc<EnvFilter>,
        call_timeout: Duration,
        connect_permits: Arc<Semaphore>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        let state = UpstreamState::default();
        Arc::new(Self {
            name: spec.name.clone(),
            spec: StdRwLock::new(spec),
            state: StdRwLock::new(state),
            peer: RwLock::new(None),
            sink,
            oauth,
            env_filter,
            call_timeout,
            connect_permits,
            relist: Arc::new(Notify::new()),
            spec_changed: Notify::new(),
            force_reconnect: Notify::new(),
            shutdown_tx,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> ServerSpec {
        self.spec
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn state(&self) -> UpstreamState {
        self.state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Cosmetic spec update (enabled/quarantined flags, metadata). Material
    /// transport changes go through manager teardown + recreate instead.
    pub fn update_spec(&self, spec: ServerSpec) {
        {
            let mut guard = self
                .spec
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            *guard = spec;
        }
        self.spec_changed.notify_one();
    }

    pub fn trigger_relist(&self) {
        self.relist.notify_one();
    }

    pub fn trigger_reconnect(&self) {
        self.force_reconnect.notify_one();
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.spec_changed.notify_one();
    }

    /// Spawn the supervisor task for this client.
    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            this.supervise().await;
        });
    }

    fn set_phase(&self, phase: Phase, error: Option<String>) {
        let state = {
            let mut guard = self
                .state
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.phase = phase;
            if phase == Phase::Ready {
                guard.last_error = None;
                guard.retry_count = 0;
                guard.health_level = HealthLevel::Healthy;
                guard.health_action = String::new();
                guard.should_retry = true;
            }
            if let Some(message) = error {
                guard.last_error = Some(message);
            }
            guard.clone()
        };
        self.sink.state_changed(&self.name, &state);
    }

    fn record_failure(&self, message: &str, class: &FailureClass) {
        let state = {
            let mut guard = self
                .state
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.last_error = Some(message.to_string());
            guard.retry_count = guard.retry_count.saturating_add(1);
            guard.last_retry_time = Some(chrono::Utc::now());
            guard.should_retry = class.should_retry();
            guard.health_level = class.health_level();
            guard.health_action = class.health_action().to_string();
            if matches!(class, FailureClass::AuthRequired) {
                guard.authenticated = false;
            }
            guard.clone()
        };
        self.sink.state_changed(&self.name, &state);
    }

    async fn supervise(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut backoff = Backoff::new();
        self.set_phase(Phase::StartingCore, None);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let spec = self.spec();
            if !spec.enabled {
                self.set_phase(Phase::Disabled, None);
                tokio::select! {
                    () = self.spec_changed.notified() => continue,
                    _ = shutdown.changed() => continue,
                }
            }

            self.set_phase(Phase::Connecting, None);
            let connected = {
                // Fleet-wide cap on concurrent (re)connects.
                let _permit = self.connect_permits.acquire().await.ok();
                self.connect_once(&spec).await
            };

            let service = match connected {
                Ok(service) => service,
                Err(e) => {
                    let message = format!("{:#}", e);
                    let class = classify_failure(&message);
                    warn!("upstream {} connect failed: {}", self.name, message);
                    self.record_failure(&message, &class);

                    match class {
                        FailureClass::AuthRequired => {
                            self.set_phase(Phase::PendingAuth, Some(message));
                            if self.try_authorize(&spec).await {
                                backoff.reset();
                                continue;
                            }
                            self.set_phase(Phase::AuthError, None);
                            // Retry only on user action (login, spec change).
                            tokio::select! {
                                () = self.spec_changed.notified() => {}
                                () = self.force_reconnect.notified() => {}
                                _ = shutdown.changed() => {}
                            }
                            continue;
                        }
                        FailureClass::Fatal { .. } | FailureClass::SecretMissing => {
                            self.set_phase(Phase::Failed, Some(message));
                            tokio::select! {
                                () = self.spec_changed.notified() => {}
                                () = self.force_reconnect.notified() => {}
                                _ = shutdown.changed() => {}
                            }
                            continue;
                        }
                        _ => {
                            let delay = backoff.next_delay();
                            debug!(
                                "upstream {} retrying in {:.1}s (attempt {})",
                                self.name,
                                delay.as_secs_f64(),
                                backoff.attempt()
                            );
                            tokio::select! {
                                () = tokio::time::sleep(delay) => {}
                                () = self.spec_changed.notified() => {}
                                _ = shutdown.changed() => {}
                            }
                            continue;
                        }
                    }
                }
            };

            backoff.reset();
            *self.peer.write().await = Some(service.peer().clone());
            self.set_phase(Phase::Connected, None);

            match self.refresh_tools().await {
                Ok(count) => {
                    {
                        let mut guard = self
                            .state
                            .write()
                            .unwrap_or_else(std::sync::PoisonError::into_inner);
                        guard.tool_count = count;
                        guard.authenticated = true;
                    }
                    self.set_phase(Phase::Ready, None);
                    info!("upstream {} ready with {} tools", self.name, count);
                }
                Err(e) => {
                    let message = format!("tool listing failed: {:#}", e);
                    let class = classify_failure(&message);
                    self.record_failure(&message, &class);
                    *self.peer.write().await = None;
                    drop(service);
                    let delay = backoff.next_delay();
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => {}
                    }
                    continue;
                }
            }

            // Connected wait loop: the session future resolves when the
            // transport dies; notifications re-list tools in place.
            let waiting = service.waiting();
            tokio::pin!(waiting);
            loop {
                tokio::select! {
                    quit = &mut waiting => {
                        debug!("upstream {} session ended: {:?}", self.name, quit);
                        break;
                    }
                    () = self.relist.notified() => {
                        match self.refresh_tools().await {
                            Ok(count) => {
                                let mut guard = self
                                    .state
                                    .write()
                                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                                guard.tool_count = count;
                            }
                            Err(e) => warn!("re-list for {} failed: {:#}", self.name, e),
                        }
                    }
                    () = self.force_reconnect.notified() => break,
                    () = self.spec_changed.notified() => {
                        if !self.spec().enabled {
                            break;
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            *self.peer.write().await = None;
            if *shutdown.borrow() {
                break;
            }
            // A disabled spec immediately overwrites this on the next turn.
            self.set_phase(Phase::Reconnecting, None);
        }

        *self.peer.write().await = None;
        self.set_phase(Phase::Disconnected, None);
        debug!("upstream {} supervisor stopped", self.name);
    }

    async fn try_authorize(&self, spec: &ServerSpec) -> bool {
        let Some(url) = spec.url.clone() else {
            return false;
        };
        let oauth_spec = spec.oauth.clone().unwrap_or_default();
        match self.oauth.authorize(oauth_spec, url).await {
            Ok(_) => {
                if let Some(tokens) = self.oauth.persisted() {
                    let configured = spec
                        .oauth
                        .as_ref()
                        .map(|o| o.client_id.clone())
                        .unwrap_or_default();
                    if configured.is_empty() && !tokens.client_id.is_empty() {
                        self.sink.client_id_issued(&self.name, &tokens.client_id);
                    }
                }
                true
            }
            Err(e) => {
                warn!("authorization for {} failed: {}", self.name, e);
                false
            }
        }
    }

    async fn connect_once(&self, spec: &ServerSpec) -> Result<Service> {
        if spec.is_stdio() {
            return self.connect_stdio(spec).await;
        }

        let url = spec
            .url
            .clone()
            .ok_or_else(|| anyhow!("server {} has neither command nor url", spec.name))?;

        let probes: Vec<Protocol> = match spec.protocol {
            Protocol::Auto => vec![Protocol::StreamableHttp, Protocol::Http, Protocol::Sse],
            concrete => vec![concrete],
        };

        let mut last_error = anyhow!("no protocol probe attempted");
        for protocol in probes {
            match self.connect_network(spec, &url, protocol).await {
                Ok(service) => {
                    if spec.protocol == Protocol::Auto {
                        info!("upstream {} detected protocol {}", spec.name, protocol.as_str());
                        self.sink.protocol_detected(&self.name, protocol);
                    }
                    return Ok(service);
                }
                Err(e) => {
                    debug!(
                        "upstream {} probe {} failed: {:#}",
                        spec.name,
                        protocol.as_str(),
                        e
                    );
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    async fn connect_stdio(&self, spec: &ServerSpec) -> Result<Service> {
        let parent: HashMap<String, String> = std::env::vars().collect();
        let (env, warnings) = self.env_filter.build_child_env(&parent, &spec.env);
        if !warnings.is_empty() {
            self.sink.env_warnings(&self.name, &warnings);
        }

        let plan = launch_plan(spec, env);
        if !command_resolvable(&plan.program) {
            return Err(anyhow!("executable not found: {}", plan.program));
        }

        let mut cmd = Command::new(&plan.program);
        cmd.args(&plan.args)
            .env_clear()
            .envs(&plan.env)
            .kill_on_drop(true)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped());
        if let Some(dir) = &plan.working_dir {
            cmd.current_dir(dir);
        }

        let (transport, stderr) = TokioChildProcess::builder(cmd)
            .stderr(Stdio::piped())
            .spawn()?;
        if let Some(stderr) = stderr {
            let server = self.name.clone();
            tokio::spawn(async move {
                let mut lines = tokio::io::BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("upstream {} stderr: {}", server, line);
                }
            });
        }

        let adapter = self.adapter();
        let service = tokio::time::timeout(CONNECT_TIMEOUT, adapter.serve(transport))
            .await
            .map_err(|_| anyhow!("handshake timed out"))?
            .map_err(|e| anyhow!("handshake failed: {}", e))?;
        Ok(service)
    }

    async fn connect_network(
        &self,
        spec: &ServerSpec,
        url: &str,
        protocol: Protocol,
    ) -> Result<Service> {
        let adapter = self.adapter();
        let service = match protocol {
            Protocol::Sse => {
                let transport = SseClientTransport::start(url.to_string())
                    .await
                    .map_err(|e| anyhow!("SSE connect failed: {}", e))?;
                tokio::time::timeout(CONNECT_TIMEOUT, adapter.serve(transport))
                    .await
                    .map_err(|_| anyhow!("handshake timed out"))?
                    .map_err(|e| anyhow!("handshake failed: {}", e))?
            }
            Protocol::Http | Protocol::StreamableHttp => {
                let bearer = self
                    .oauth
                    .fresh_tokens()
                    .await
                    .map(|tokens| tokens.access_token);
                let client = self.http_client(spec, bearer)?;
                let transport = StreamableHttpClientTransport::with_client(
                    client,
                    StreamableHttpClientTransportConfig::with_uri(url.to_string()),
                );
                tokio::time::timeout(CONNECT_TIMEOUT, adapter.serve(transport))
                    .await
                    .map_err(|_| anyhow!("handshake timed out"))?
                    .map_err(|e| anyhow!("handshake failed: {}", e))?
            }
            other => return Err(anyhow!("protocol {} is not network-connectable", other.as_str())),
        };
        Ok(service)
    }

    fn http_client(&self, spec: &ServerSpec, bearer: Option<String>) -> Result<reqwest::Client> {
        use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
        let mut headers = HeaderMap::new();
        for (key, value) in &spec.headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| anyhow!("invalid header name '{}': {}", key, e))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| anyhow!("invalid header value for '{}': {}", key, e))?;
            headers.insert(name, value);
        }
        if let Some(token) = bearer {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", token)) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        Ok(reqwest::Client::builder().default_headers(headers).build()?)
    }

    fn adapter(&self) -> NotificationAdapter {
        NotificationAdapter {
            server: self.name.clone(),
            sink: self.sink.clone(),
            relist: self.relist.clone(),
        }
    }

    async fn refresh_tools(&self) -> Result<usize> {
        let peer = self
            .peer
            .read()
            .await
            .clone()
            .ok_or_else(|| anyhow!("no active session"))?;
        let tools = peer
            .list_all_tools()
            .await
            .map_err(|e| anyhow!("tools/list failed: {}", e))?;

        let entries: Vec<ToolEntry> = tools
            .into_iter()
            .map(|tool| {
                let schema = serde_json::Value::Object((*tool.input_schema).clone());
                let mut entry = ToolEntry::new(
                    self.name.clone(),
                    tool.name.to_string(),
                    tool.description.as_deref().unwrap_or("").to_string(),
                    schema.to_string(),
                );
                if let Some(annotations) = &tool.annotations {
                    entry.annotations = ToolAnnotations {
                        read_only: annotations.read_only_hint,
                        destructive: annotations.destructive_hint,
                        idempotent: annotations.idempotent_hint,
                        open_world: annotations.open_world_hint,
                    };
                }
                entry
            })
            .collect();

        let count = entries.len();
        self.sink.tools_listed(&self.name, entries);
        Ok(count)
    }

    fn is_ready(&self) -> bool {
        self.state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .phase
            == Phase::Ready
    }

    async fn wait_for_ready(&self, deadline: Duration) -> bool {
        let start = tokio::time::Instant::now();
        while start.elapsed() < deadline {
            if self.is_ready() {
                return true;
            }
            tokio::time::sleep(READY_POLL).await;
        }
        self.is_ready()
    }

    /// Invoke one tool. Requires `Ready`; honors the caller's deadline when
    /// given, else the configured call timeout. A 401 mid-call runs the
    /// OAuth path once and retries the call exactly once.
    pub async fn call_tool(
        &self,
        tool: &str,
        args: serde_json::Value,
        deadline: Option<Duration>,
    ) -> Result<CallOutcome, ProxyError> {
        if !self.is_ready() {
            return Err(ProxyError::UpstreamNotReady {
                server: self.name.clone(),
            });
        }
        let timeout = deadline.unwrap_or(self.call_timeout);

        match self.call_once(tool, args.clone(), timeout).await {
            Ok(outcome) => Ok(outcome),
            Err(ProxyError::AuthRequired { .. }) => {
                self.set_phase(Phase::PendingAuth, Some("401 from upstream".to_string()));
                let spec = self.spec();
                if !self.try_authorize(&spec).await {
                    self.set_phase(Phase::AuthError, None);
                    return Err(ProxyError::AuthRequired {
                        server: self.name.clone(),
                    });
                }
                // Rebuild the session so the fresh token is on the wire.
                self.trigger_reconnect();
                if !self.wait_for_ready(timeout).await {
                    return Err(ProxyError::UpstreamNotReady {
                        server: self.name.clone(),
                    });
                }
                self.call_once(tool, args, timeout).await
            }
            Err(e) => Err(e),
        }
    }

    async fn call_once(
        &self,
        tool: &str,
        args: serde_json::Value,
        timeout: Duration,
    ) -> Result<CallOutcome, ProxyError> {
        let peer = self
            .peer
            .read()
            .await
            .clone()
            .ok_or_else(|| ProxyError::UpstreamNotReady {
                server: self.name.clone(),
            })?;

        let arguments = match args {
            serde_json::Value::Object(map) => Some(map),
            serde_json::Value::Null => None,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("input".to_string(), other);
                Some(map)
            }
        };

        let request = CallToolRequestParam {
            name: Cow::Owned(tool.to_string()),
            arguments,
        };

        let result = match tokio::time::timeout(timeout, peer.call_tool(request)).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                let message = e.to_string();
                // An unknown tool is a healthy server answering a bad
                // request; it never touches connection state.
                if is_tool_not_found(&message) {
                    return Err(ProxyError::NotFound(format!(
                        "tool '{}' on server '{}'",
                        tool, self.name
                    )));
                }
                let class = classify_failure(&message);
                return Err(match class {
                    FailureClass::AuthRequired => ProxyError::AuthRequired {
                        server: self.name.clone(),
                    },
                    FailureClass::Transient => {
                        // A dead stdio pipe surfaces here before the session
                        // future fires; nudge the supervisor along.
                        self.trigger_reconnect();
                        ProxyError::Transient(message)
                    }
                    _ => ProxyError::Upstream {
                        server: self.name.clone(),
                        message,
                    },
                });
            }
            Err(_) => {
                return Err(ProxyError::Transient(format!(
                    "tool call timed out after {:.0}s",
                    timeout.as_secs_f64()
                )));
            }
        };

        let is_error = result.is_error.unwrap_or(false);
        let mut output = String::new();
        for content in &result.content {
            use rmcp::model::RawContent;
            if !output.is_empty() {
                output.push('\n');
            }
            match &content.raw {
                RawContent::Text(text) => output.push_str(&text.text),
                RawContent::Image(img) => {
                    let _ = write!(output, "[Image: {} ({} bytes)]", img.mime_type, img.data.len());
                }
                RawContent::Audio(audio) => {
                    let _ = write!(
                        output,
                        "[Audio: {} ({} bytes)]",
                        audio.mime_type,
                        audio.data.len()
                    );
                }
                _ => output.push_str("[Unsupported MCP content type]"),
            }
        }
        if output.is_empty() {
            output = "(no output)".to_string();
        }

        Ok(CallOutcome { text: output, is_error })
    }
}

fn is_tool_not_found(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("-32601") || lower.contains("tool not found") || lower.contains("unknown tool")
}

/// rmcp client handler: routes server-initiated notifications back into the
/// supervisor (re-list) and onto the bus (progress).
#[derive(Clone)]
pub struct NotificationAdapter {
    server: String,
    sink: Arc<dyn UpstreamSink>,
    relist: Arc<Notify>,
}

impl ClientHandler for NotificationAdapter {
    fn get_info(&self) -> rmcp::model::ClientInfo {
        rmcp::model::ClientInfo::default()
    }

    async fn on_tool_list_changed(&self, _context: NotificationContext<RoleClient>) {
        debug!("upstream {} announced tools/list_changed", self.server);
        self.relist.notify_one();
    }

    async fn on_progress(
        &self,
        params: rmcp::model::ProgressNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) {
        self.sink.progress(
            &self.server,
            serde_json::to_value(&params).unwrap_or_default(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        states: Mutex<Vec<(String, Phase)>>,
        protocols: Mutex<Vec<Protocol>>,
    }

    impl UpstreamSink for RecordingSink {
        fn state_changed(&self, server: &str, state: &UpstreamState) {
            self.states
                .lock()
                .unwrap()
                .push((server.to_string(), state.phase));
        }
        fn tools_listed(&self, _server: &str, _tools: Vec<ToolEntry>) {}
        fn progress(&self, _server: &str, _progress: serde_json::Value) {}
        fn env_warnings(&self, _server: &str, _warnings: &[EnvWarning]) {}
        fn protocol_detected(&self, _server: &str, protocol: Protocol) {
            self.protocols.lock().unwrap().push(protocol);
        }
        fn client_id_issued(&self, _server: &str, _client_id: &str) {}
    }

    fn make_client(spec: ServerSpec, sink: Arc<RecordingSink>) -> Arc<UpstreamClient> {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(crate::store::Store::open(dir.path().join("db")).unwrap());
        std::mem::forget(dir); // keep the backing dir alive for the test
        let bus = crate::bus::EventBus::new();
        let oauth = Arc::new(OauthFlow::new(
            spec.name.clone(),
            store,
            bus,
            Duration::from_secs(3600),
        ));
        let env_filter = Arc::new(EnvFilter::new(&crate::config::EnvPolicyConfig::default()));
        UpstreamClient::new(
            spec,
            sink,
            oauth,
            env_filter,
            Duration::from_secs(5),
            Arc::new(Semaphore::new(4)),
        )
    }

    #[tokio::test]
    async fn call_requires_ready() {
        let sink = Arc::new(RecordingSink::default());
        let mut spec = ServerSpec::new("s");
        spec.command = Some("echo".into());
        let client = make_client(spec, sink);
        let err = client
            .call_tool("t", serde_json::json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamNotReady { .. }));
    }

    #[tokio::test]
    async fn missing_binary_parks_in_failed() {
        let sink = Arc::new(RecordingSink::default());
        let mut spec = ServerSpec::new("s");
        spec.command = Some("definitely-not-a-real-binary-xyz".into());
        let client = make_client(spec, sink.clone());
        client.start();

        // Wait for the supervisor to classify and park.
        let mut parked = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if client.state().phase == Phase::Failed {
                parked = true;
                break;
            }
        }
        assert!(parked, "client should reach Failed for a missing binary");
        let state = client.state();
        assert!(!state.should_retry);
        assert_eq!(state.health_level, HealthLevel::Unhealthy);
        assert_eq!(state.health_action, "configure");
        client.shutdown();
    }

    #[tokio::test]
    async fn disabled_spec_parks_in_disabled() {
        let sink = Arc::new(RecordingSink::default());
        let mut spec = ServerSpec::new("s");
        spec.command = Some("echo".into());
        spec.enabled = false;
        let client = make_client(spec, sink);
        client.start();
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if client.state().phase == Phase::Disabled {
                break;
            }
        }
        assert_eq!(client.state().phase, Phase::Disabled);
        client.shutdown();
    }

    #[test]
    fn tool_not_found_detection() {
        assert!(is_tool_not_found("RPC error -32601: method not found"));
        assert!(is_tool_not_found("Tool not found: frobnicate"));
        assert!(is_tool_not_found("unknown tool 'x'"));
        assert!(!is_tool_not_found("connection reset by peer"));
    }

    #[test]
    fn state_snapshot_is_detached() {
        let sink = Arc::new(RecordingSink::default());
        let mut spec = ServerSpec::new("s");
        spec.command = Some("echo".into());
        let client = make_client(spec, sink);
        let mut snapshot = client.state();
        snapshot.phase = Phase::Ready;
        assert_eq!(client.state().phase, Phase::Initializing);
    }
}
