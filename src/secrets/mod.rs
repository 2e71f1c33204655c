use crate::config::EnvPolicyConfig;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::debug;

/// Variables forwarded from the parent environment by default. Everything
/// else must be allow-listed or set per-server.
const BASELINE_ALLOW: &[&str] = &[
    "PATH", "HOME", "USER", "LOGNAME", "SHELL", "TERM", "TMPDIR", "LANG",
];

/// Credential-shaped variable names that are never forwarded, not even when
/// a server sets them verbatim from the parent.
const DEFAULT_DENY_PATTERNS: &[&str] = &[
    r"(?i)TOKEN",
    r"(?i)SECRET",
    r"(?i)PASSWORD",
    r"(?i)PASSWD",
    r"(?i)API_?KEY",
    r"(?i)CREDENTIAL",
    r"(?i)PRIVATE_?KEY",
    r"(?i)^AWS_",
    r"(?i)^AZURE_",
    r"(?i)^GOOGLE_APPLICATION",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretRef<'a> {
    /// `keyring:<service>/<account>`, resolved from the OS keychain.
    Keyring { service: &'a str, account: &'a str },
    /// `env:<VAR>`, resolved from the parent environment.
    Env { var: &'a str },
    /// Anything else is used as-is.
    Plain(&'a str),
}

pub fn parse_secret_ref(value: &str) -> SecretRef<'_> {
    if let Some(rest) = value.strip_prefix("keyring:") {
        if let Some((service, account)) = rest.split_once('/') {
            if !service.is_empty() && !account.is_empty() {
                return SecretRef::Keyring { service, account };
            }
        }
    }
    if let Some(var) = value.strip_prefix("env:") {
        if !var.is_empty() {
            return SecretRef::Env { var };
        }
    }
    SecretRef::Plain(value)
}

#[derive(Debug, Clone)]
pub struct EnvWarning {
    pub variable: String,
    pub message: String,
}

pub struct EnvFilter {
    allow: Vec<String>,
    deny: Vec<Regex>,
}

fn default_deny() -> &'static Vec<Regex> {
    static DENY: OnceLock<Vec<Regex>> = OnceLock::new();
    DENY.get_or_init(|| {
        DEFAULT_DENY_PATTERNS
            .iter()
            .map(|p| Regex::new(p).expect("builtin deny pattern compiles"))
            .collect()
    })
}

impl EnvFilter {
    pub fn new(policy: &EnvPolicyConfig) -> Self {
        let mut deny = default_deny().clone();
        for pattern in &policy.deny {
            match Regex::new(pattern) {
                Ok(re) => deny.push(re),
                Err(e) => debug!("ignoring invalid env deny pattern '{}': {}", pattern, e),
            }
        }
        Self {
            allow: policy.allow.clone(),
            deny,
        }
    }

    fn denied(&self, name: &str) -> bool {
        self.deny.iter().any(|re| re.is_match(name))
    }

    fn allowed_from_parent(&self, name: &str) -> bool {
        BASELINE_ALLOW.contains(&name)
            || name.starts_with("LC_")
            || self.allow.iter().any(|a| a == name)
    }

    /// Construct the child environment for a stdio upstream.
    ///
    /// Deterministic and pure: inputs are the parent env snapshot and the
    /// server's own `env` map. Deny patterns always win. Secret references
    /// that fail to resolve drop the variable and produce a warning for the
    /// caller to emit; resolution failure is never fatal.
    pub fn build_child_env(
        &self,
        parent: &HashMap<String, String>,
        server_env: &HashMap<String, String>,
    ) -> (HashMap<String, String>, Vec<EnvWarning>) {
        let mut out = HashMap::new();
        let mut warnings = Vec::new();

        for (name, value) in parent {
            if self.allowed_from_parent(name) && !self.denied(name) {
                out.insert(name.clone(), value.clone());
            }
        }

        let mut names: Vec<_> = server_env.keys().collect();
        names.sort();
        for name in names {
            let value = &server_env[name];
            if self.denied(name) {
                warnings.push(EnvWarning {
                    variable: name.clone(),
                    message: "matches a deny pattern; not forwarded".to_string(),
                });
                continue;
            }
            match parse_secret_ref(value) {
                SecretRef::Plain(v) => {
                    out.insert(name.clone(), v.to_string());
                }
                SecretRef::Env { var } => match parent.get(var) {
                    Some(v) => {
                        out.insert(name.clone(), v.clone());
                    }
                    None => warnings.push(EnvWarning {
                        variable: name.clone(),
                        message: format!("env:{} is not set in the parent environment", var),
                    }),
                },
                SecretRef::Keyring { service, account } => {
                    match resolve_keyring(service, account) {
                        Some(secret) => {
                            out.insert(name.clone(), secret);
                        }
                        None => warnings.push(EnvWarning {
                            variable: name.clone(),
                            message: format!(
                                "keyring:{}/{} could not be resolved",
                                service, account
                            ),
                        }),
                    }
                }
            }
        }

        (out, warnings)
    }
}

#[cfg(feature = "keyring-store")]
fn resolve_keyring(service: &str, account: &str) -> Option<String> {
    keyring::Entry::new(service, account)
        .ok()
        .and_then(|entry| entry.get_password().ok())
        .filter(|secret| !secret.is_empty())
}

#[cfg(not(feature = "keyring-store"))]
fn resolve_keyring(_service: &str, _account: &str) -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> EnvFilter {
        EnvFilter::new(&EnvPolicyConfig::default())
    }

    fn parent() -> HashMap<String, String> {
        HashMap::from([
            ("PATH".to_string(), "/usr/bin".to_string()),
            ("HOME".to_string(), "/home/u".to_string()),
            ("LC_ALL".to_string(), "C".to_string()),
            ("AWS_SECRET_ACCESS_KEY".to_string(), "hush".to_string()),
            ("RANDOM_VAR".to_string(), "x".to_string()),
            ("UPSTREAM_URL".to_string(), "http://x".to_string()),
        ])
    }

    #[test]
    fn baseline_passthrough_only() {
        let (env, warnings) = filter().build_child_env(&parent(), &HashMap::new());
        assert_eq!(env.get("PATH").unwrap(), "/usr/bin");
        assert_eq!(env.get("LC_ALL").unwrap(), "C");
        assert!(!env.contains_key("RANDOM_VAR"));
        assert!(!env.contains_key("AWS_SECRET_ACCESS_KEY"));
        assert!(warnings.is_empty());
    }

    #[test]
    fn allowlist_extends_passthrough() {
        let policy = EnvPolicyConfig {
            allow: vec!["RANDOM_VAR".to_string()],
            deny: vec![],
        };
        let (env, _) = EnvFilter::new(&policy).build_child_env(&parent(), &HashMap::new());
        assert_eq!(env.get("RANDOM_VAR").unwrap(), "x");
    }

    #[test]
    fn deny_beats_allow() {
        let policy = EnvPolicyConfig {
            allow: vec!["AWS_SECRET_ACCESS_KEY".to_string()],
            deny: vec![],
        };
        let (env, _) = EnvFilter::new(&policy).build_child_env(&parent(), &HashMap::new());
        assert!(!env.contains_key("AWS_SECRET_ACCESS_KEY"));
    }

    #[test]
    fn server_env_plain_values_forwarded() {
        let server = HashMap::from([("DEBUG".to_string(), "1".to_string())]);
        let (env, warnings) = filter().build_child_env(&parent(), &server);
        assert_eq!(env.get("DEBUG").unwrap(), "1");
        assert!(warnings.is_empty());
    }

    #[test]
    fn server_env_denied_name_warns() {
        let server = HashMap::from([("MY_API_KEY".to_string(), "v".to_string())]);
        let (env, warnings) = filter().build_child_env(&parent(), &server);
        assert!(!env.contains_key("MY_API_KEY"));
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].variable, "MY_API_KEY");
    }

    #[test]
    fn env_ref_resolves_from_parent() {
        let server = HashMap::from([("TARGET".to_string(), "env:UPSTREAM_URL".to_string())]);
        let (env, warnings) = filter().build_child_env(&parent(), &server);
        assert_eq!(env.get("TARGET").unwrap(), "http://x");
        assert!(warnings.is_empty());
    }

    #[test]
    fn missing_env_ref_warns_and_omits() {
        let server = HashMap::from([("TARGET".to_string(), "env:NOPE".to_string())]);
        let (env, warnings) = filter().build_child_env(&parent(), &server);
        assert!(!env.contains_key("TARGET"));
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.contains("NOPE"));
    }

    #[test]
    fn secret_ref_parsing() {
        assert_eq!(
            parse_secret_ref("keyring:mcpproxy/github"),
            SecretRef::Keyring {
                service: "mcpproxy",
                account: "github"
            }
        );
        assert_eq!(parse_secret_ref("env:FOO"), SecretRef::Env { var: "FOO" });
        assert_eq!(parse_secret_ref("plain"), SecretRef::Plain("plain"));
        // malformed refs fall back to plain values
        assert_eq!(
            parse_secret_ref("keyring:noslash"),
            SecretRef::Plain("keyring:noslash")
        );
        assert_eq!(parse_secret_ref("env:"), SecretRef::Plain("env:"));
    }

    #[test]
    fn deterministic_for_same_inputs() {
        let server = HashMap::from([
            ("A".to_string(), "1".to_string()),
            ("B".to_string(), "env:UPSTREAM_URL".to_string()),
        ]);
        let f = filter();
        let (a, _) = f.build_child_env(&parent(), &server);
        let (b, _) = f.build_child_env(&parent(), &server);
        assert_eq!(a, b);
    }
}
