use crate::activity::{ActivityRecorder, RecorderSettings};
use crate::bus::EventBus;
use crate::config::import;
use crate::config::{Config, Protocol, ServerSpec, ensure_api_key, get_config_path};
use crate::errors::ProxyError;
use crate::facade::{HttpState, McpFacade, serve_http, serve_stdio};
use crate::index::ToolIndex;
use crate::router::{ProxyRouter, RouterSettings};
use crate::store::{DB_FILE, Store};
use crate::upstream::{Phase, UpstreamManager};
use crate::utils::data_dir;
use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

#[derive(Parser)]
#[command(name = "mcpproxy")]
#[command(about = "Trust-enforcing proxy in front of a fleet of MCP servers")]
#[command(version)]
pub struct Cli {
    /// Path to mcp_config.json (defaults to <dataDir>/mcp_config.json)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the proxy (façade + upstream supervisors)
    Run {
        /// Serve MCP on stdio instead of HTTP
        #[arg(long)]
        stdio: bool,
        /// Override the listen address, e.g. 127.0.0.1:8080
        #[arg(long)]
        listen: Option<String>,
    },
    /// Manage authentication against upstream servers
    Auth {
        #[command(subcommand)]
        cmd: AuthCommands,
    },
    /// Manage upstream server entries
    Server {
        #[command(subcommand)]
        cmd: ServerCommands,
    },
    /// Search and call tools across upstreams
    Tools {
        #[command(subcommand)]
        cmd: ToolsCommands,
    },
    /// Run system diagnostics
    Doctor,
}

#[derive(Subcommand)]
pub enum AuthCommands {
    /// Run the OAuth login flow for one server
    Login {
        #[arg(long)]
        server: String,
    },
}

#[derive(Subcommand)]
pub enum ServerCommands {
    /// List configured servers
    List,
    /// Add a server
    Add {
        name: String,
        /// Command for a stdio server
        #[arg(long)]
        command: Option<String>,
        /// Arguments for the stdio command
        #[arg(long, num_args = 0.., allow_hyphen_values = true)]
        args: Vec<String>,
        /// URL for a network server
        #[arg(long)]
        url: Option<String>,
        /// Transport protocol (stdio, http, sse, streamable-http, auto)
        #[arg(long, default_value = "auto")]
        protocol: String,
    },
    /// Remove a server
    Remove { name: String },
    /// Enable a server
    Enable { name: String },
    /// Disable a server
    Disable { name: String },
    /// Quarantine (or release with --release) a server
    Quarantine {
        name: String,
        #[arg(long)]
        release: bool,
    },
    /// Import servers from a Cursor-format mcp.json
    Import { file: PathBuf },
}

#[derive(Subcommand)]
pub enum ToolsCommands {
    /// Search the tool index
    Search {
        query: String,
        #[arg(long, default_value_t = 5)]
        top_k: i64,
    },
    /// Call a tool by its routed name '<serverName>:<toolName>'
    Call {
        name: String,
        #[arg(long, default_value = "{}")]
        args: String,
    },
}

/// Everything a running proxy needs, wired together once.
struct Runtime {
    config: Config,
    config_path: PathBuf,
    store: Arc<Store>,
    index: Arc<ToolIndex>,
    bus: EventBus,
    recorder: Arc<ActivityRecorder>,
    manager: Arc<UpstreamManager>,
    router: Arc<ProxyRouter>,
}

impl Runtime {
    fn build(config_path_override: Option<&PathBuf>) -> Result<Self, ProxyError> {
        let config_path = match config_path_override {
            Some(path) => path.clone(),
            None => get_config_path().map_err(ProxyError::Internal)?,
        };
        let mut config = crate::config::load_config(Some(&config_path))
            .map_err(|e| ProxyError::Validation(format!("{:#}", e)))?;
        if ensure_api_key(&mut config) {
            crate::config::save_config(&config, Some(&config_path))
                .map_err(ProxyError::Internal)?;
            info!("generated API key persisted to {}", config_path.display());
        }
        config.validate()?;

        let data = data_dir().map_err(ProxyError::Internal)?;
        // A database that cannot be opened or read is corruption, not
        // misconfiguration: refuse to start.
        let store = Arc::new(
            Store::open(data.join(DB_FILE))
                .map_err(|e| ProxyError::Corrupted(e.to_string()))?,
        );
        let index = Arc::new(
            ToolIndex::new(store.clone(), config.debug_search).map_err(ProxyError::Internal)?,
        );
        let bus = EventBus::new();
        let recorder = Arc::new(ActivityRecorder::new(
            store.clone(),
            bus.clone(),
            RecorderSettings::from_config(&config),
        ));
        let manager = Arc::new(UpstreamManager::new(
            config.clone(),
            Some(config_path.clone()),
            store.clone(),
            index.clone(),
            bus.clone(),
            Some(recorder.clone()),
        ));
        let router = Arc::new(ProxyRouter::new(
            manager.clone(),
            index.clone(),
            store.clone(),
            recorder.clone(),
            RouterSettings::from_config(&config),
        ));
        Ok(Self {
            config,
            config_path,
            store,
            index,
            bus,
            recorder,
            manager,
            router,
        })
    }

    fn start(&self) {
        self.recorder.start();
        self.manager.start();
    }

    fn stop(&self) {
        self.manager.shutdown();
        self.recorder.shutdown();
        self.store.close();
    }

    async fn wait_for_server(&self, name: &str, deadline: Duration) -> bool {
        let start = tokio::time::Instant::now();
        while start.elapsed() < deadline {
            if let Some(view) = self
                .manager
                .fleet()
                .into_iter()
                .find(|view| view.spec.name == name)
            {
                match view.state.phase {
                    Phase::Ready => return true,
                    Phase::Failed | Phase::AuthError | Phase::Disabled => return false,
                    _ => {}
                }
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        false
    }
}

pub async fn execute(cli: Cli) -> Result<(), ProxyError> {
    match cli.command {
        Commands::Run { stdio, listen } => run_proxy(cli.config.as_ref(), stdio, listen).await,
        Commands::Auth { cmd } => auth_command(cli.config.as_ref(), cmd).await,
        Commands::Server { cmd } => server_command(cli.config.as_ref(), cmd),
        Commands::Tools { cmd } => tools_command(cli.config.as_ref(), cmd).await,
        Commands::Doctor => super::doctor::run(cli.config.as_ref()).await,
    }
}

async fn run_proxy(
    config_path: Option<&PathBuf>,
    stdio: bool,
    listen_override: Option<String>,
) -> Result<(), ProxyError> {
    let runtime = Runtime::build(config_path)?;
    runtime.start();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    // Hot-reload: external edits to mcp_config.json reconcile the fleet.
    let watcher_handle = match crate::config::watcher::watch_config_file(&runtime.config_path) {
        Ok((mut updates, handle)) => {
            let manager = runtime.manager.clone();
            tokio::spawn(async move {
                while let Some(new_config) = updates.recv().await {
                    manager.reconcile(&new_config);
                }
            });
            Some(handle)
        }
        Err(e) => {
            tracing::warn!("config watcher unavailable: {:#}", e);
            None
        }
    };

    let facade = Arc::new(McpFacade::new(
        runtime.router.clone(),
        runtime.config.enable_prompts,
    ));

    let result = if stdio {
        serve_stdio(facade, shutdown_rx).await
    } else {
        let listen = listen_override.unwrap_or_else(|| runtime.config.listen.clone());
        let addr = parse_listen(&listen).map_err(config_error)?;
        let tls = if runtime.config.tls.enabled {
            let certs_dir = runtime
                .config
                .tls
                .certs_dir
                .clone()
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir().unwrap_or_default().join("certs"));
            Some(
                crate::facade::tls::load_rustls_config(
                    &certs_dir,
                    runtime.config.tls.require_client_cert,
                )
                .map_err(config_error)?,
            )
        } else {
            None
        };
        let socket_path = match &runtime.config.socket_path {
            Some(path) if !path.is_empty() => Some(PathBuf::from(path)),
            Some(_) => None,
            None => data_dir().ok().map(|dir| dir.join("mcpproxy.sock")),
        };
        let state = HttpState::new(
            facade,
            runtime.bus.clone(),
            runtime.config.api_key.clone(),
            runtime.config.tls.enabled,
        );
        serve_http(state, addr, socket_path, tls, shutdown_rx).await
    };

    if let Some(handle) = watcher_handle {
        handle.abort();
    }
    runtime.stop();
    result.map_err(ProxyError::Internal)
}

async fn auth_command(config_path: Option<&PathBuf>, cmd: AuthCommands) -> Result<(), ProxyError> {
    match cmd {
        AuthCommands::Login { server } => {
            let runtime = Runtime::build(config_path)?;
            runtime.start();
            let result = runtime.manager.login(&server).await;
            match &result {
                Ok(()) => println!("Authorization for '{}' completed.", server),
                Err(e) => eprintln!("Authorization failed: {}", e),
            }
            runtime.stop();
            result
        }
    }
}

fn server_command(config_path: Option<&PathBuf>, cmd: ServerCommands) -> Result<(), ProxyError> {
    let path = match config_path {
        Some(path) => path.clone(),
        None => get_config_path().map_err(ProxyError::Internal)?,
    };
    let mut config = crate::config::load_config(Some(&path)).map_err(config_error)?;

    match cmd {
        ServerCommands::List => {
            if config.mcp_servers.is_empty() {
                println!("No servers configured.");
                return Ok(());
            }
            for spec in &config.mcp_servers {
                let transport = spec
                    .command
                    .clone()
                    .or_else(|| spec.url.clone())
                    .unwrap_or_default();
                let mut flags = Vec::new();
                if !spec.enabled {
                    flags.push("disabled");
                }
                if spec.quarantined {
                    flags.push("quarantined");
                }
                let flags = if flags.is_empty() {
                    String::new()
                } else {
                    format!(" [{}]", flags.join(", "))
                };
                println!(
                    "{:<24} {:<16} {}{}",
                    spec.name,
                    spec.protocol.as_str(),
                    transport,
                    flags
                );
            }
            return Ok(());
        }
        ServerCommands::Add {
            name,
            command,
            args,
            url,
            protocol,
        } => {
            if config.find_server(&name).is_some() {
                return Err(ProxyError::Validation(format!(
                    "server '{}' already exists",
                    name
                )));
            }
            let mut spec = ServerSpec::new(name.clone());
            spec.command = command;
            spec.args = args;
            spec.url = url;
            spec.protocol = parse_protocol(&protocol)?;
            let issues = crate::config::validate_server(&spec);
            if let Some(issue) = issues.first() {
                return Err(ProxyError::Validation(issue.to_string()));
            }
            config.mcp_servers.push(spec);
            println!("Added server '{}'.", name);
        }
        ServerCommands::Remove { name } => {
            let before = config.mcp_servers.len();
            config.mcp_servers.retain(|s| s.name != name);
            if config.mcp_servers.len() == before {
                return Err(ProxyError::NotFound(format!("server '{}'", name)));
            }
            println!("Removed server '{}'.", name);
        }
        ServerCommands::Enable { name } => {
            set_flag(&mut config, &name, |s| s.enabled = true)?;
            println!("Enabled server '{}'.", name);
        }
        ServerCommands::Disable { name } => {
            set_flag(&mut config, &name, |s| s.enabled = false)?;
            println!("Disabled server '{}'.", name);
        }
        ServerCommands::Quarantine { name, release } => {
            set_flag(&mut config, &name, |s| s.quarantined = !release)?;
            if release {
                println!("Released server '{}' from quarantine.", name);
            } else {
                println!("Quarantined server '{}'.", name);
            }
        }
        ServerCommands::Import { file } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("cannot read {}", file.display()))
                .map_err(ProxyError::Internal)?;
            let imported = import::import_cursor(&content).map_err(config_error)?;
            let mut added = 0;
            for spec in imported {
                if config.find_server(&spec.name).is_none() {
                    config.mcp_servers.push(spec);
                    added += 1;
                }
            }
            println!("Imported {} servers from {}.", added, file.display());
        }
    }

    crate::config::save_config(&config, Some(&path)).map_err(ProxyError::Internal)
}

async fn tools_command(config_path: Option<&PathBuf>, cmd: ToolsCommands) -> Result<(), ProxyError> {
    match cmd {
        ToolsCommands::Search { query, top_k } => {
            let runtime = Runtime::build(config_path)?;
            let hits = runtime
                .index
                .search(&query, top_k.clamp(1, 100) as usize)
                .map_err(ProxyError::Internal)?;
            if hits.is_empty() {
                println!("No matching tools.");
            }
            for hit in hits {
                println!(
                    "{:<40} {:>8.3}  {}",
                    hit.entry.qualified_name(),
                    hit.score,
                    hit.entry.description
                );
            }
            runtime.store.close();
            Ok(())
        }
        ToolsCommands::Call { name, args } => {
            let (server, _tool) = name.split_once(':').ok_or_else(|| {
                ProxyError::Validation("tool name must be '<serverName>:<toolName>'".into())
            })?;
            let args: serde_json::Value = serde_json::from_str(&args)
                .map_err(|e| ProxyError::Validation(format!("--args is not valid JSON: {}", e)))?;

            let runtime = Runtime::build(config_path)?;
            runtime.start();
            if !runtime
                .wait_for_server(server, Duration::from_secs(30))
                .await
            {
                runtime.stop();
                return Err(ProxyError::UpstreamNotReady {
                    server: server.to_string(),
                });
            }
            let result = runtime
                .router
                .dispatch(
                    "call_tool",
                    serde_json::json!({"name": name, "args": args}),
                )
                .await;
            runtime.recorder.flush();
            runtime.stop();
            match result {
                Ok(response) => {
                    println!("{}", response.text);
                    if response.is_error {
                        Err(ProxyError::Upstream {
                            server: server.to_string(),
                            message: "tool reported an error".into(),
                        })
                    } else {
                        Ok(())
                    }
                }
                Err(e) => Err(e),
            }
        }
    }
}

fn set_flag(
    config: &mut Config,
    name: &str,
    apply: impl FnOnce(&mut ServerSpec),
) -> Result<(), ProxyError> {
    match config.find_server_mut(name) {
        Some(spec) => {
            apply(spec);
            spec.updated = Some(chrono::Utc::now());
            Ok(())
        }
        None => Err(ProxyError::NotFound(format!("server '{}'", name))),
    }
}

fn parse_protocol(raw: &str) -> Result<Protocol, ProxyError> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|_| ProxyError::Validation(format!("unknown protocol '{}'", raw)))
}

/// `(host)?:port` with an empty host meaning loopback.
pub fn parse_listen(listen: &str) -> Result<SocketAddr> {
    if let Some(port) = listen.strip_prefix(':') {
        return format!("127.0.0.1:{}", port)
            .parse()
            .with_context(|| format!("invalid listen address '{}'", listen));
    }
    listen
        .parse()
        .or_else(|_| {
            // hostnames: resolve via ToSocketAddrs, first match wins
            use std::net::ToSocketAddrs;
            listen
                .to_socket_addrs()
                .map_err(anyhow::Error::from)
                .and_then(|mut addrs| {
                    addrs
                        .next()
                        .ok_or_else(|| anyhow!("no address for '{}'", listen))
                })
        })
        .with_context(|| format!("invalid listen address '{}'", listen))
}

fn config_error(e: anyhow::Error) -> ProxyError {
    ProxyError::Validation(format!("{:#}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_listen_variants() {
        assert_eq!(
            parse_listen(":8080").unwrap(),
            "127.0.0.1:8080".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_listen("0.0.0.0:9000").unwrap(),
            "0.0.0.0:9000".parse::<SocketAddr>().unwrap()
        );
        assert!(parse_listen("not an address").is_err());
    }

    #[test]
    fn parse_protocol_accepts_kebab() {
        assert_eq!(
            parse_protocol("streamable-http").unwrap(),
            Protocol::StreamableHttp
        );
        assert_eq!(parse_protocol("stdio").unwrap(), Protocol::Stdio);
        assert!(parse_protocol("gopher").is_err());
    }

    #[test]
    fn cli_parses_core_surface() {
        Cli::try_parse_from(["mcpproxy", "run", "--stdio"]).unwrap();
        Cli::try_parse_from(["mcpproxy", "auth", "login", "--server", "gh"]).unwrap();
        Cli::try_parse_from([
            "mcpproxy", "server", "add", "files", "--command", "npx", "--args", "-y", "server",
        ])
        .unwrap();
        Cli::try_parse_from(["mcpproxy", "tools", "search", "weather"]).unwrap();
        Cli::try_parse_from([
            "mcpproxy",
            "tools",
            "call",
            "gh:create_issue",
            "--args",
            "{\"title\":\"x\"}",
        ])
        .unwrap();
        Cli::try_parse_from(["mcpproxy", "doctor"]).unwrap();
    }
}
