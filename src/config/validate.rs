use crate::config::schema::{Config, Protocol, RESERVED_OAUTH_PARAMS, ServerSpec};
use crate::errors::{ProxyError, ProxyResult};
use std::collections::HashSet;
use std::sync::OnceLock;

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn name_pattern() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^[A-Za-z0-9_-]+$").unwrap())
}

fn listen_pattern() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^[A-Za-z0-9_.\-]*:\d{1,5}$").unwrap())
}

impl Config {
    /// Strict validation: first issue becomes a `Validation` error.
    pub fn validate(&self) -> ProxyResult<()> {
        match self.validate_detailed().into_iter().next() {
            Some(issue) => Err(ProxyError::Validation(issue.to_string())),
            None => Ok(()),
        }
    }

    /// Full validation report. Values the loader silently normalizes (for
    /// example an out-of-range `top_k`) still show up here so admin surfaces
    /// can flag them.
    pub fn validate_detailed(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        if !(1..=100).contains(&self.top_k) {
            issues.push(issue("top_k", "must be between 1 and 100"));
        }
        if !(1..=1000).contains(&self.tools_limit) {
            issues.push(issue("tools_limit", "must be between 1 and 1000"));
        }
        if self.call_tool_timeout == 0 {
            issues.push(issue("callToolTimeout", "must be greater than zero"));
        }
        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            issues.push(issue(
                "logLevel",
                "must be one of trace, debug, info, warn, error",
            ));
        }
        if !listen_pattern().is_match(&self.listen) {
            issues.push(issue("listen", "must match (host)?:port"));
        }
        if self.tls.enabled && self.tls.certs_dir.as_deref().unwrap_or("").is_empty() {
            issues.push(issue("tls.certsDir", "required when tls.enabled"));
        }

        let mut seen = HashSet::new();
        for spec in &self.mcp_servers {
            if !seen.insert(spec.name.as_str()) {
                issues.push(issue(
                    "mcpServers",
                    &format!("duplicate server name '{}'", spec.name),
                ));
            }
            issues.extend(validate_server(spec));
        }

        issues
    }
}

pub fn validate_server(spec: &ServerSpec) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    let field = |f: &str| format!("mcpServers.{}.{}", spec.name, f);

    if !name_pattern().is_match(&spec.name) {
        issues.push(ValidationIssue {
            field: format!("mcpServers.{}", spec.name),
            message: "name must match [A-Za-z0-9_-]+".to_string(),
        });
    }

    match (spec.command.as_deref(), spec.url.as_deref()) {
        (Some(_), Some(_)) => issues.push(ValidationIssue {
            field: field("command"),
            message: "exactly one of command or url may be set".to_string(),
        }),
        (None, None) => issues.push(ValidationIssue {
            field: field("command"),
            message: "one of command or url is required".to_string(),
        }),
        _ => {}
    }

    match spec.protocol {
        Protocol::Stdio => {
            if spec.command.is_none() {
                issues.push(ValidationIssue {
                    field: field("protocol"),
                    message: "stdio requires a command".to_string(),
                });
            }
        }
        Protocol::Http | Protocol::Sse | Protocol::StreamableHttp => {
            if spec.url.is_none() {
                issues.push(ValidationIssue {
                    field: field("protocol"),
                    message: format!("{} requires a url", spec.protocol.as_str()),
                });
            }
        }
        Protocol::Auto => {}
    }

    if let Some(url) = spec.url.as_deref() {
        if url::Url::parse(url).is_err() {
            issues.push(ValidationIssue {
                field: field("url"),
                message: "not a valid URL".to_string(),
            });
        }
    }

    if let Some(dir) = spec.working_dir.as_deref() {
        if !std::path::Path::new(dir).is_dir() {
            issues.push(ValidationIssue {
                field: field("workingDir"),
                message: format!("directory does not exist: {}", dir),
            });
        }
    }

    if let Some(oauth) = &spec.oauth {
        for key in oauth.extra_params.keys() {
            if RESERVED_OAUTH_PARAMS.contains(&key.as_str()) {
                issues.push(ValidationIssue {
                    field: field("oauth.extraParams"),
                    message: format!("reserved OAuth parameter '{}' may not be overridden", key),
                });
            }
        }
    }

    issues
}

/// Clamp out-of-range knobs to their defaults. Runs on load, after env
/// overrides; `validate_detailed` on the raw values still reports them.
pub fn normalize(config: &mut Config) {
    if !(1..=100).contains(&config.top_k) {
        config.top_k = super::schema::default_top_k();
    }
    if !(1..=1000).contains(&config.tools_limit) {
        config.tools_limit = super::schema::default_tools_limit();
    }
    if config.call_tool_timeout == 0 {
        config.call_tool_timeout = 120;
    }
}

fn issue(field: &str, message: &str) -> ValidationIssue {
    ValidationIssue {
        field: field.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn top_k_out_of_range_reported() {
        let mut config = Config::default();
        config.top_k = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("top_k"));
        config.top_k = 101;
        assert!(config.validate().is_err());
    }

    #[test]
    fn normalize_defaults_bad_top_k() {
        let mut config = Config::default();
        config.top_k = -3;
        normalize(&mut config);
        assert_eq!(config.top_k, 5);
    }

    #[test]
    fn zero_timeout_rejected() {
        let mut config = Config::default();
        config.call_tool_timeout = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("callToolTimeout"));
    }

    #[test]
    fn bad_listen_rejected() {
        let mut config = Config::default();
        config.listen = "not an address".into();
        assert!(config.validate().is_err());
        config.listen = ":8080".into();
        assert!(config.validate().is_ok());
        config.listen = "0.0.0.0:9999".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn duplicate_server_names_rejected() {
        let mut config = Config::default();
        let mut a = ServerSpec::new("dup");
        a.command = Some("echo".into());
        config.mcp_servers.push(a.clone());
        config.mcp_servers.push(a);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn command_and_url_mutually_exclusive() {
        let mut spec = ServerSpec::new("s");
        spec.command = Some("echo".into());
        spec.url = Some("http://x".into());
        let issues = validate_server(&spec);
        assert!(issues.iter().any(|i| i.message.contains("exactly one")));

        let empty = ServerSpec::new("s");
        let issues = validate_server(&empty);
        assert!(issues.iter().any(|i| i.message.contains("required")));
    }

    #[test]
    fn bad_server_name_rejected() {
        let mut spec = ServerSpec::new("bad name!");
        spec.command = Some("echo".into());
        let issues = validate_server(&spec);
        assert!(issues.iter().any(|i| i.message.contains("[A-Za-z0-9_-]+")));
    }

    #[test]
    fn stdio_protocol_requires_command() {
        let mut spec = ServerSpec::new("s");
        spec.protocol = Protocol::Stdio;
        spec.url = Some("http://x".into());
        let issues = validate_server(&spec);
        assert!(issues.iter().any(|i| i.message.contains("stdio requires")));
    }

    #[test]
    fn reserved_oauth_param_reported() {
        let mut spec = ServerSpec::new("s");
        spec.url = Some("http://x".into());
        let mut oauth = crate::config::schema::OauthSpec::default();
        oauth
            .extra_params
            .insert("grant_type".into(), "implicit".into());
        spec.oauth = Some(oauth);
        let issues = validate_server(&spec);
        assert!(issues.iter().any(|i| i.message.contains("grant_type")));
    }

    #[test]
    fn missing_working_dir_reported() {
        let mut spec = ServerSpec::new("s");
        spec.command = Some("echo".into());
        spec.working_dir = Some("/definitely/not/a/real/dir".into());
        let issues = validate_server(&spec);
        assert!(issues.iter().any(|i| i.field.contains("workingDir")));
    }
}
