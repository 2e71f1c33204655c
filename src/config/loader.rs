use crate::config::schema::Config;
use crate::config::validate;
use crate::utils::data_dir;
use anyhow::{Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

pub const CONFIG_FILE: &str = "mcp_config.json";

/// A key found in the raw JSON that is known but no longer honored.
#[derive(Debug, Clone)]
pub struct Deprecation {
    pub key: String,
    pub message: String,
    pub replacement: Option<String>,
}

/// Deprecated top-level keys: (key, message, replacement).
const DEPRECATED_KEYS: &[(&str, &str, Option<&str>)] = &[
    (
        "toolResponseLimit",
        "renamed in 0.4",
        Some("tool_response_limit"),
    ),
    ("topK", "renamed in 0.4", Some("top_k")),
    ("servers", "renamed in 0.3", Some("mcpServers")),
    ("enableTray", "the tray reads the event stream now", None),
];

pub fn get_config_path() -> Result<PathBuf> {
    Ok(data_dir()?.join(CONFIG_FILE))
}

/// Load the config, returning any deprecation notices found in the raw file.
///
/// A missing, empty, or whitespace-only file (including `/dev/null`) means
/// "use defaults", never an error. Environment overrides are applied after
/// the file, and out-of-range knobs are normalized to their defaults.
pub fn load_config_with_warnings(
    config_path: Option<&Path>,
) -> Result<(Config, Vec<Deprecation>)> {
    let default_path = get_config_path().unwrap_or_else(|_| PathBuf::from(CONFIG_FILE));
    let path = config_path.unwrap_or(default_path.as_path());

    let mut deprecations = Vec::new();
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        if content.trim().is_empty() {
            Config::default()
        } else {
            let data: Value = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse config JSON from {}", path.display()))?;
            deprecations = scan_deprecated(&data);
            serde_json::from_value(data).with_context(|| "Failed to deserialize config")?
        }
    } else {
        Config::default()
    };

    apply_env_overrides(&mut config);
    validate::normalize(&mut config);
    Ok((config, deprecations))
}

/// Load the config and log deprecation notices.
pub fn load_config(config_path: Option<&Path>) -> Result<Config> {
    let (config, deprecations) = load_config_with_warnings(config_path)?;
    for dep in &deprecations {
        match &dep.replacement {
            Some(replacement) => warn!(
                "config key '{}' is deprecated ({}); use '{}'",
                dep.key, dep.message, replacement
            ),
            None => warn!("config key '{}' is deprecated ({})", dep.key, dep.message),
        }
    }
    Ok(config)
}

fn scan_deprecated(data: &Value) -> Vec<Deprecation> {
    let Value::Object(map) = data else {
        return Vec::new();
    };
    DEPRECATED_KEYS
        .iter()
        .filter(|(key, _, _)| map.contains_key(*key))
        .map(|(key, message, replacement)| Deprecation {
            key: (*key).to_string(),
            message: (*message).to_string(),
            replacement: replacement.map(ToString::to_string),
        })
        .collect()
}

/// Environment overrides, applied after the file so containers and CI can
/// inject settings without touching it. An explicitly-empty
/// `MCPPROXY_API_KEY` disables façade auth; unset leaves generation to
/// [`ensure_api_key`].
pub fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("MCPPROXY_API_KEY") {
        config.api_key = Some(val);
    }
    if let Ok(val) = std::env::var("MCPPROXY_LISTEN") {
        if !val.is_empty() {
            config.listen = val;
        }
    }
    if let Ok(val) = std::env::var("MCPPROXY_TLS_ENABLED") {
        if let Some(flag) = parse_bool(&val) {
            config.tls.enabled = flag;
        }
    }
    if let Ok(val) = std::env::var("MCPPROXY_TLS_REQUIRE_CLIENT_CERT") {
        if let Some(flag) = parse_bool(&val) {
            config.tls.require_client_cert = flag;
        }
    }
    if let Ok(val) = std::env::var("MCPPROXY_CERTS_DIR") {
        if !val.is_empty() {
            config.tls.certs_dir = Some(val);
        }
    }
    if let Ok(val) = std::env::var("MCPPROXY_DISABLE_AUTO_UPDATE") {
        if let Some(flag) = parse_bool(&val) {
            config.disable_auto_update = flag;
        }
    }
}

fn parse_bool(val: &str) -> Option<bool> {
    match val.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Fill in a generated API key when the config omits one entirely.
/// Returns true if a key was generated (callers should then save).
pub fn ensure_api_key(config: &mut Config) -> bool {
    if config.api_key.is_none() {
        config.api_key = Some(generate_api_key());
        debug!("generated façade API key");
        true
    } else {
        false
    }
}

/// 256-bit hex key derived from OS-entropy UUIDs.
fn generate_api_key() -> String {
    let mut hasher = Sha256::new();
    for _ in 0..4 {
        hasher.update(Uuid::new_v4().as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Persist the config atomically, mode 0600.
pub fn save_config(config: &Config, config_path: Option<&Path>) -> Result<()> {
    let default_path = get_config_path().unwrap_or_else(|_| PathBuf::from(CONFIG_FILE));
    let path = config_path.unwrap_or(default_path.as_path());

    let content = serde_json::to_string_pretty(config)?;
    persist_atomically(path, &content)
        .with_context(|| format!("Failed to write config to {}", path.display()))?;
    Ok(())
}

/// Write to a `<path>.tmp.<rand>` sibling, fsync, then rename over the
/// target; a rename on the same filesystem is atomic, so readers see the
/// old or the new contents and never a torn write. The file is created
/// 0600 so the API key is unreadable to other users from the first byte.
fn persist_atomically(path: &Path, content: &str) -> Result<()> {
    let parent = path.parent().context("config path has no parent directory")?;
    if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)?;
    }

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .context("config path has no filename")?;
    let staged = parent.join(format!("{}.tmp.{:08x}", file_name, fastrand::u32(..)));

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let result = options
        .open(&staged)
        .with_context(|| format!("cannot stage {}", staged.display()))
        .and_then(|mut file| {
            file.write_all(content.as_bytes())?;
            file.sync_all()?;
            Ok(())
        })
        .and_then(|()| {
            std::fs::rename(&staged, path)
                .with_context(|| format!("cannot replace {}", path.display()))
        });

    if result.is_err() {
        let _ = std::fs::remove_file(&staged);
    }
    result
}
