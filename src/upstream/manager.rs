use crate::activity::{ActivityRecorder, InvocationRecord};
use crate::bus::{EventBus, FleetSummary, ProxyEvent, ServerHealthEvent};
use crate::config::{
    Config, Protocol, ServerSpec, check_reserved_oauth_params, merge_server_spec, save_config,
    validate_server,
};
use crate::errors::{ProxyError, ProxyResult};
use crate::index::{ToolEntry, ToolIndex};
use crate::secrets::{EnvFilter, EnvWarning};
use crate::store::{BUCKET_UPSTREAMS, Store};
use crate::upstream::client::{CallOutcome, UpstreamClient, UpstreamSink};
use crate::upstream::oauth::OauthFlow;
use crate::upstream::state::{Phase, UpstreamState};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock as StdRwLock, Weak};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{info, warn};

/// Snapshot of one server's spec and runtime state for external consumers.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ServerView {
    pub spec: ServerSpec,
    pub state: UpstreamState,
}

/// Fleet supervisor: owns every upstream client, drives lifecycle, and is
/// the single writer of server entries in the config file.
pub struct UpstreamManager {
    shared: Arc<ManagerShared>,
}

struct ManagerShared {
    clients: StdRwLock<HashMap<String, Arc<UpstreamClient>>>,
    config: StdRwLock<Config>,
    config_path: Option<PathBuf>,
    store: Arc<Store>,
    index: Arc<ToolIndex>,
    bus: EventBus,
    env_filter: Arc<EnvFilter>,
    recorder: Option<Arc<ActivityRecorder>>,
    connect_permits: Arc<Semaphore>,
}

impl UpstreamManager {
    pub fn new(
        config: Config,
        config_path: Option<PathBuf>,
        store: Arc<Store>,
        index: Arc<ToolIndex>,
        bus: EventBus,
        recorder: Option<Arc<ActivityRecorder>>,
    ) -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(4);
        let env_filter = Arc::new(EnvFilter::new(&config.environment));
        Self {
            shared: Arc::new(ManagerShared {
                clients: StdRwLock::new(HashMap::new()),
                config: StdRwLock::new(config),
                config_path,
                store,
                index,
                bus,
                env_filter,
                recorder,
                connect_permits: Arc::new(Semaphore::new(parallelism * 4)),
            }),
        }
    }

    /// Create and start one client per configured server.
    pub fn start(&self) {
        let specs = {
            let config = self.shared.config_read();
            config.mcp_servers.clone()
        };
        for spec in specs {
            self.shared.persist_upstream_record(&spec);
            ManagerShared::spawn_client(&self.shared, spec);
        }
        self.shared.publish_fleet();
    }

    pub fn bus(&self) -> EventBus {
        self.shared.bus.clone()
    }

    /// Snapshot of spec + state for every server.
    pub fn fleet(&self) -> Vec<ServerView> {
        let clients = self.shared.clients_read();
        let mut views: Vec<ServerView> = clients
            .values()
            .map(|client| ServerView {
                spec: client.spec(),
                state: client.state(),
            })
            .collect();
        views.sort_by(|a, b| a.spec.name.cmp(&b.spec.name));
        views
    }

    pub fn health_summary(&self) -> FleetSummary {
        self.shared.health_summary()
    }

    pub fn add_server(&self, mut spec: ServerSpec) -> ProxyResult<()> {
        if spec.created.is_none() {
            spec.created = Some(chrono::Utc::now());
        }
        spec.updated = Some(chrono::Utc::now());

        let issues = validate_server(&spec);
        if let Some(issue) = issues.first() {
            return Err(ProxyError::Validation(issue.to_string()));
        }
        {
            let config = self.shared.config_read();
            if config.find_server(&spec.name).is_some() {
                return Err(ProxyError::Validation(format!(
                    "server '{}' already exists",
                    spec.name
                )));
            }
        }

        self.shared.with_config(|config| {
            config.mcp_servers.push(spec.clone());
        })?;
        self.shared.persist_upstream_record(&spec);
        info!("added upstream server '{}'", spec.name);
        ManagerShared::spawn_client(&self.shared, spec);
        self.shared.publish_fleet();
        Ok(())
    }

    /// Deep-merge a patch into one server. Material transport changes tear
    /// the client down and build a fresh one; cosmetic changes apply in
    /// place.
    pub fn update_server(&self, name: &str, patch: &serde_json::Value) -> ProxyResult<()> {
        check_reserved_oauth_params(patch)?;
        let base = self
            .shared
            .client(name)
            .ok_or_else(|| ProxyError::NotFound(format!("server '{}'", name)))?
            .spec();

        let (merged, diff) = merge_server_spec(&base, patch)?;
        let issues = validate_server(&merged);
        if let Some(issue) = issues.first() {
            return Err(ProxyError::Validation(issue.to_string()));
        }

        self.shared.with_config(|config| {
            if let Some(slot) = config.find_server_mut(name) {
                *slot = merged.clone();
            }
        })?;
        self.shared.persist_upstream_record(&merged);

        let material = base.material_fields_differ(&merged);
        if material {
            info!("upstream '{}' changed materially; rebuilding connection", name);
            self.shared.teardown_client(name);
            ManagerShared::spawn_client(&self.shared, merged);
        } else if let Some(client) = self.shared.client(name) {
            client.update_spec(merged.clone());
            self.shared
                .index_policy_from_spec(&merged, client.state().authenticated);
        }
        if !diff.is_empty() {
            if let Some(recorder) = &self.shared.recorder {
                let mut record = InvocationRecord::server_event(
                    name,
                    format!("configuration updated: {} fields", diff.modified.len() + diff.added.len() + diff.removed.len()),
                );
                record.arguments_json =
                    serde_json::to_string(&diff).unwrap_or_default();
                recorder.record(record);
            }
        }
        self.shared.publish_fleet();
        Ok(())
    }

    pub fn delete_server(&self, name: &str) -> ProxyResult<()> {
        if self.shared.client(name).is_none() {
            return Err(ProxyError::NotFound(format!("server '{}'", name)));
        }
        self.shared.teardown_client(name);
        self.shared.with_config(|config| {
            config.mcp_servers.retain(|s| s.name != name);
        })?;
        if let Err(e) = self.shared.index.remove_server(name) {
            warn!("failed to drop index entries for '{}': {:#}", name, e);
        }
        let _ = self.shared.store.delete(BUCKET_UPSTREAMS, name);
        self.shared.bus.remove_server(name);
        info!("removed upstream server '{}'", name);
        self.shared.publish_fleet();
        Ok(())
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> ProxyResult<()> {
        self.patch_policy(name, |spec| spec.enabled = enabled)
    }

    pub fn set_quarantined(&self, name: &str, quarantined: bool) -> ProxyResult<()> {
        self.patch_policy(name, |spec| spec.quarantined = quarantined)
    }

    fn patch_policy(&self, name: &str, apply: impl Fn(&mut ServerSpec)) -> ProxyResult<()> {
        let client = self
            .shared
            .client(name)
            .ok_or_else(|| ProxyError::NotFound(format!("server '{}'", name)))?;
        let mut spec = client.spec();
        apply(&mut spec);
        spec.updated = Some(chrono::Utc::now());

        self.shared.with_config(|config| {
            if let Some(slot) = config.find_server_mut(name) {
                apply(slot);
                slot.updated = spec.updated;
            }
        })?;
        self.shared.persist_upstream_record(&spec);
        client.update_spec(spec.clone());
        self.shared
            .index_policy_from_spec(&spec, client.state().authenticated);
        self.shared.publish_fleet();
        Ok(())
    }

    /// Route one tool call. Quarantined servers are unreachable here; only
    /// the quarantine inspection path may look at them.
    pub async fn invoke_tool(
        &self,
        server: &str,
        tool: &str,
        args: serde_json::Value,
        deadline: Option<Duration>,
    ) -> Result<CallOutcome, ProxyError> {
        let client = self
            .shared
            .client(server)
            .ok_or_else(|| ProxyError::NotFound(format!("server '{}'", server)))?;
        let spec = client.spec();
        if spec.quarantined {
            return Err(ProxyError::Forbidden(format!(
                "server '{}' is quarantined",
                server
            )));
        }
        if !spec.enabled {
            return Err(ProxyError::Forbidden(format!(
                "server '{}' is disabled",
                server
            )));
        }
        client.call_tool(tool, args, deadline).await
    }

    /// Tools of one server regardless of routing eligibility; the
    /// quarantine inspection surface.
    pub fn tools_of(&self, server: &str) -> ProxyResult<Vec<ToolEntry>> {
        if self.shared.client(server).is_none() {
            return Err(ProxyError::NotFound(format!("server '{}'", server)));
        }
        Ok(self
            .shared
            .index
            .tools_for_server(server)
            .map_err(ProxyError::Internal)?)
    }

    /// Kick off an interactive login for one server (CLI `auth login`).
    pub async fn login(&self, name: &str) -> ProxyResult<()> {
        let client = self
            .shared
            .client(name)
            .ok_or_else(|| ProxyError::NotFound(format!("server '{}'", name)))?;
        let spec = client.spec();
        let url = spec.url.clone().ok_or_else(|| {
            ProxyError::Validation(format!("server '{}' is not a network server", name))
        })?;
        let oauth_spec = spec.oauth.clone().unwrap_or_default();
        client
            .oauth
            .authorize(oauth_spec, url)
            .await
            .map_err(|e| ProxyError::AuthRequired {
                server: format!("{} ({})", name, e),
            })?;
        client.trigger_reconnect();
        Ok(())
    }

    /// Apply an externally-edited config: diff the server set against the
    /// running fleet and add, rebuild, update, or drop clients to match.
    /// Does NOT write the config file; the file is the source here.
    pub fn reconcile(&self, new_config: &Config) {
        let desired: HashMap<String, ServerSpec> = new_config
            .mcp_servers
            .iter()
            .map(|spec| (spec.name.clone(), spec.clone()))
            .collect();
        let running: Vec<String> = self.shared.clients_read().keys().cloned().collect();

        for name in &running {
            if !desired.contains_key(name) {
                info!("config reload: removing server '{}'", name);
                self.shared.teardown_client(name);
                if let Err(e) = self.shared.index.remove_server(name) {
                    warn!("failed to drop index entries for '{}': {:#}", name, e);
                }
                let _ = self.shared.store.delete(BUCKET_UPSTREAMS, name);
                self.shared.bus.remove_server(name);
            }
        }

        for (name, spec) in desired {
            match self.shared.client(&name) {
                Some(client) => {
                    let current = client.spec();
                    if current.material_fields_differ(&spec) {
                        info!("config reload: rebuilding server '{}'", name);
                        self.shared.teardown_client(&name);
                        self.shared.persist_upstream_record(&spec);
                        ManagerShared::spawn_client(&self.shared, spec);
                    } else if current != spec {
                        client.update_spec(spec.clone());
                        self.shared
                            .index_policy_from_spec(&spec, client.state().authenticated);
                        self.shared.persist_upstream_record(&spec);
                    }
                }
                None => {
                    info!("config reload: adding server '{}'", name);
                    self.shared.persist_upstream_record(&spec);
                    ManagerShared::spawn_client(&self.shared, spec);
                }
            }
        }

        {
            let mut config = self
                .shared
                .config
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            *config = new_config.clone();
        }
        self.shared.publish_fleet();
    }

    /// Stop every client. Idempotent.
    pub fn shutdown(&self) {
        let clients: Vec<Arc<UpstreamClient>> =
            self.shared.clients_read().values().cloned().collect();
        for client in clients {
            client.shutdown();
        }
    }
}

impl ManagerShared {
    fn clients_read(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<UpstreamClient>>> {
        self.clients
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn config_read(&self) -> std::sync::RwLockReadGuard<'_, Config> {
        self.config
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn client(&self, name: &str) -> Option<Arc<UpstreamClient>> {
        self.clients_read().get(name).cloned()
    }

    /// Mutate the config under the lock and persist it atomically.
    fn with_config(&self, apply: impl FnOnce(&mut Config)) -> ProxyResult<()> {
        let snapshot = {
            let mut config = self
                .config
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            apply(&mut config);
            config.clone()
        };
        save_config(&snapshot, self.config_path.as_deref()).map_err(ProxyError::Internal)
    }

    fn persist_upstream_record(&self, spec: &ServerSpec) {
        if let Err(e) = self.store.put_json(BUCKET_UPSTREAMS, &spec.name, spec) {
            warn!("failed to persist upstream record '{}': {}", spec.name, e);
        }
    }

    fn spawn_client(shared: &Arc<Self>, spec: ServerSpec) {
        let call_timeout = Duration::from_secs(shared.config_read().call_tool_timeout);
        let oauth_warn =
            Duration::from_secs(shared.config_read().oauth_expiry_warning_hours * 3600);
        let sink: Arc<dyn UpstreamSink> = Arc::new(ManagerSink {
            shared: Arc::downgrade(shared),
        });
        let oauth = Arc::new(OauthFlow::new(
            spec.name.clone(),
            shared.store.clone(),
            shared.bus.clone(),
            oauth_warn,
        ));
        let client = UpstreamClient::new(
            spec.clone(),
            sink,
            oauth,
            shared.env_filter.clone(),
            call_timeout,
            shared.connect_permits.clone(),
        );
        shared.index_policy_from_spec(&spec, true);
        client.start();
        let mut clients = shared
            .clients
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        clients.insert(spec.name.clone(), client);
    }

    fn teardown_client(&self, name: &str) {
        let removed = {
            let mut clients = self
                .clients
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            clients.remove(name)
        };
        if let Some(client) = removed {
            client.shutdown();
        }
    }

    fn index_policy_from_spec(&self, spec: &ServerSpec, authenticated: bool) {
        if let Err(e) = self.index.set_server_policy(
            &spec.name,
            spec.enabled,
            spec.quarantined,
            authenticated,
        ) {
            warn!("failed to update index policy for '{}': {:#}", spec.name, e);
        }
    }

    fn health_summary(&self) -> FleetSummary {
        let clients = self.clients_read();
        let mut summary = FleetSummary {
            total: clients.len(),
            ..FleetSummary::default()
        };
        for client in clients.values() {
            let spec = client.spec();
            let state = client.state();
            if spec.enabled {
                summary.enabled += 1;
            } else {
                summary.disabled += 1;
            }
            if spec.quarantined {
                summary.quarantined += 1;
            }
            match state.phase {
                Phase::Ready | Phase::Connected => summary.connected += 1,
                Phase::Failed | Phase::AuthError => summary.errors += 1,
                _ => {
                    if state.last_error.is_some() {
                        summary.errors += 1;
                    }
                }
            }
        }
        summary
    }

    fn publish_fleet(&self) {
        self.bus.publish(ProxyEvent::FleetChanged {
            summary: self.health_summary(),
        });
    }
}

/// The narrow back-reference handed to clients. Weak: clients never keep
/// the manager alive.
struct ManagerSink {
    shared: Weak<ManagerShared>,
}

impl UpstreamSink for ManagerSink {
    fn state_changed(&self, server: &str, state: &UpstreamState) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        shared.bus.publish(ProxyEvent::StatusPhase {
            server_name: server.to_string(),
            phase: state.phase.as_str().to_string(),
            detail: state.last_error.clone(),
        });

        let spec = shared.client(server).map(|c| c.spec());
        let admin_state = match &spec {
            Some(s) if !s.enabled => "disabled",
            Some(s) if s.quarantined => "quarantined",
            _ => "enabled",
        };
        shared
            .bus
            .publish(ProxyEvent::ServerHealth(ServerHealthEvent {
                server_name: server.to_string(),
                level: state.health_level.as_str().to_string(),
                admin_state: admin_state.to_string(),
                action: state.health_action.clone(),
                summary: state.phase.as_str().to_string(),
                detail: state.last_error.clone(),
            }));

        if let Some(spec) = spec {
            shared.index_policy_from_spec(&spec, state.authenticated);
        }
        shared.publish_fleet();
    }

    fn tools_listed(&self, server: &str, tools: Vec<ToolEntry>) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        // Reconcile: upsert the new listing, drop tools that disappeared.
        let fresh: std::collections::HashSet<String> =
            tools.iter().map(|t| t.tool_name.clone()).collect();
        match shared.index.tools_for_server(server) {
            Ok(existing) => {
                for stale in existing.iter().filter(|t| !fresh.contains(&t.tool_name)) {
                    if let Err(e) = shared.index.remove(server, &stale.tool_name) {
                        warn!("failed to drop stale tool {}:{}: {:#}", server, stale.tool_name, e);
                    }
                }
            }
            Err(e) => warn!("could not reconcile tools for '{}': {:#}", server, e),
        }
        let mut changed = 0;
        for tool in &tools {
            match shared.index.upsert(tool) {
                Ok(true) => changed += 1,
                Ok(false) => {}
                Err(e) => warn!("failed to index {}:{}: {:#}", server, tool.tool_name, e),
            }
        }
        if let Some(spec) = shared.client(server).map(|c| c.spec()) {
            shared.index_policy_from_spec(&spec, true);
        }
        info!(
            "indexed {} tools for '{}' ({} changed)",
            tools.len(),
            server,
            changed
        );
    }

    fn progress(&self, server: &str, progress: serde_json::Value) {
        if let Some(shared) = self.shared.upgrade() {
            shared.bus.publish(ProxyEvent::Progress {
                server_name: server.to_string(),
                progress,
            });
        }
    }

    fn env_warnings(&self, server: &str, warnings: &[EnvWarning]) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        for warning in warnings {
            shared.bus.publish(ProxyEvent::EnvWarning {
                server_name: server.to_string(),
                variable: warning.variable.clone(),
                message: warning.message.clone(),
            });
        }
    }

    fn protocol_detected(&self, server: &str, protocol: Protocol) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let result = shared.with_config(|config| {
            if let Some(spec) = config.find_server_mut(server) {
                spec.protocol = protocol;
                spec.updated = Some(chrono::Utc::now());
            }
        });
        if let Err(e) = result {
            warn!("failed to persist detected protocol for '{}': {}", server, e);
        }
        if let Some(client) = shared.client(server) {
            let mut spec = client.spec();
            spec.protocol = protocol;
            client.update_spec(spec);
        }
    }

    fn client_id_issued(&self, server: &str, client_id: &str) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let result = shared.with_config(|config| {
            if let Some(spec) = config.find_server_mut(server) {
                let oauth = spec.oauth.get_or_insert_with(Default::default);
                oauth.client_id = client_id.to_string();
                spec.updated = Some(chrono::Utc::now());
            }
        });
        if let Err(e) = result {
            warn!("failed to persist issued client id for '{}': {}", server, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DB_FILE;

    fn manager_with(specs: Vec<ServerSpec>) -> (tempfile::TempDir, UpstreamManager) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join(DB_FILE)).unwrap());
        let index = Arc::new(ToolIndex::new(store.clone(), false).unwrap());
        let mut config = Config::default();
        config.mcp_servers = specs;
        let config_path = dir.path().join("mcp_config.json");
        save_config(&config, Some(&config_path)).unwrap();
        let manager = UpstreamManager::new(
            config,
            Some(config_path),
            store,
            index,
            EventBus::new(),
            None,
        );
        (dir, manager)
    }

    fn stdio_spec(name: &str) -> ServerSpec {
        let mut spec = ServerSpec::new(name);
        spec.command = Some("echo".into());
        spec.enabled = false; // keep supervisors parked during tests
        spec
    }

    #[tokio::test]
    async fn add_and_delete_server() {
        let (_dir, manager) = manager_with(vec![]);
        manager.start();
        manager.add_server(stdio_spec("alpha")).unwrap();
        assert_eq!(manager.fleet().len(), 1);

        let err = manager.add_server(stdio_spec("alpha")).unwrap_err();
        assert!(matches!(err, ProxyError::Validation(_)));

        manager.delete_server("alpha").unwrap();
        assert!(manager.fleet().is_empty());
        assert!(matches!(
            manager.delete_server("alpha"),
            Err(ProxyError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn add_rejects_invalid_spec() {
        let (_dir, manager) = manager_with(vec![]);
        let mut bad = ServerSpec::new("bad");
        bad.command = Some("echo".into());
        bad.url = Some("http://x".into());
        assert!(matches!(
            manager.add_server(bad),
            Err(ProxyError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn quarantined_server_unreachable() {
        let (_dir, manager) = manager_with(vec![stdio_spec("locked")]);
        manager.start();
        manager.set_quarantined("locked", true).unwrap();
        let err = manager
            .invoke_tool("locked", "run", serde_json::json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Forbidden(_)));
    }

    #[tokio::test]
    async fn unknown_server_not_found() {
        let (_dir, manager) = manager_with(vec![]);
        let err = manager
            .invoke_tool("ghost", "run", serde_json::json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::NotFound(_)));
    }

    #[tokio::test]
    async fn update_rejects_immutable_name() {
        let (_dir, manager) = manager_with(vec![stdio_spec("fixed")]);
        manager.start();
        let err = manager
            .update_server("fixed", &serde_json::json!({"name": "renamed"}))
            .unwrap_err();
        assert!(matches!(err, ProxyError::ImmutableField { .. }));
        assert_eq!(manager.fleet()[0].spec.name, "fixed");
    }

    #[tokio::test]
    async fn update_env_deep_merges() {
        let mut spec = stdio_spec("envy");
        spec.env.insert("A".into(), "1".into());
        spec.env.insert("B".into(), "2".into());
        let (_dir, manager) = manager_with(vec![spec]);
        manager.start();
        manager
            .update_server("envy", &serde_json::json!({"env": {"B": "9", "C": "3"}}))
            .unwrap();
        let spec = manager.fleet()[0].spec.clone();
        assert_eq!(spec.env.get("A").unwrap(), "1");
        assert_eq!(spec.env.get("B").unwrap(), "9");
        assert_eq!(spec.env.get("C").unwrap(), "3");
    }

    #[tokio::test]
    async fn update_reserved_oauth_param_rejected() {
        let (_dir, manager) = manager_with(vec![stdio_spec("s")]);
        manager.start();
        let err = manager
            .update_server(
                "s",
                &serde_json::json!({"oauth": {"extraParams": {"state": "x"}}}),
            )
            .unwrap_err();
        assert!(matches!(err, ProxyError::Validation(_)));
    }

    #[tokio::test]
    async fn health_summary_counts() {
        let (_dir, manager) = manager_with(vec![stdio_spec("a"), stdio_spec("b")]);
        manager.start();
        manager.set_quarantined("b", true).unwrap();
        let summary = manager.health_summary();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.disabled, 2);
        assert_eq!(summary.quarantined, 1);
    }

    #[tokio::test]
    async fn disabled_server_calls_forbidden() {
        let (_dir, manager) = manager_with(vec![stdio_spec("off")]);
        manager.start();
        let err = manager
            .invoke_tool("off", "t", serde_json::json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Forbidden(_)));
    }

    #[tokio::test]
    async fn reconcile_applies_adds_updates_and_removals() {
        let (_dir, manager) = manager_with(vec![stdio_spec("keep"), stdio_spec("drop")]);
        manager.start();
        assert_eq!(manager.fleet().len(), 2);

        let mut new_config = Config::default();
        let mut keep = stdio_spec("keep");
        keep.env.insert("NEW".into(), "1".into());
        new_config.mcp_servers.push(keep);
        new_config.mcp_servers.push(stdio_spec("fresh"));

        manager.reconcile(&new_config);
        let names: Vec<String> = manager
            .fleet()
            .into_iter()
            .map(|view| view.spec.name)
            .collect();
        assert_eq!(names, vec!["fresh".to_string(), "keep".to_string()]);
        let keep_view = manager
            .fleet()
            .into_iter()
            .find(|view| view.spec.name == "keep")
            .unwrap();
        assert_eq!(keep_view.spec.env.get("NEW").unwrap(), "1");
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let (_dir, manager) = manager_with(vec![stdio_spec("a")]);
        manager.start();
        manager.shutdown();
        manager.shutdown();
    }
}
