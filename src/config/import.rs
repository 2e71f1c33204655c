use crate::config::schema::{Protocol, ServerSpec};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Cursor IDE `mcp.json` shape: a map of server name to launch settings.
#[derive(Debug, Serialize, Deserialize)]
pub struct CursorFile {
    #[serde(rename = "mcpServers")]
    pub mcp_servers: BTreeMap<String, CursorServer>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CursorServer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

/// Import Cursor-format JSON into server specs. Every entry comes back
/// enabled, with the protocol inferred from the transport field.
pub fn import_cursor(content: &str) -> Result<Vec<ServerSpec>> {
    let file: CursorFile =
        serde_json::from_str(content).context("not a Cursor mcpServers document")?;

    let mut specs = Vec::with_capacity(file.mcp_servers.len());
    for (name, entry) in file.mcp_servers {
        let mut spec = ServerSpec::new(name);
        spec.protocol = if entry.command.is_some() {
            Protocol::Stdio
        } else {
            Protocol::Http
        };
        spec.command = entry.command;
        spec.args = entry.args;
        spec.env = entry.env;
        spec.url = entry.url;
        spec.headers = entry.headers;
        specs.push(spec);
    }
    Ok(specs)
}

/// Export server specs back to the Cursor shape.
pub fn export_cursor(specs: &[ServerSpec]) -> Result<String> {
    let mut servers = BTreeMap::new();
    for spec in specs {
        servers.insert(
            spec.name.clone(),
            CursorServer {
                command: spec.command.clone(),
                args: spec.args.clone(),
                env: spec.env.clone(),
                url: spec.url.clone(),
                headers: spec.headers.clone(),
            },
        );
    }
    Ok(serde_json::to_string_pretty(&CursorFile {
        mcp_servers: servers,
    })?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn import_stdio_entry() {
        let content = r#"{
            "mcpServers": {
                "filesystem": {
                    "command": "npx",
                    "args": ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"],
                    "env": {"DEBUG": "1"}
                }
            }
        }"#;
        let specs = import_cursor(content).unwrap();
        assert_eq!(specs.len(), 1);
        let spec = &specs[0];
        assert_eq!(spec.name, "filesystem");
        assert_eq!(spec.protocol, Protocol::Stdio);
        assert_eq!(spec.command.as_deref(), Some("npx"));
        assert_eq!(spec.args.len(), 3);
        assert!(spec.enabled);
    }

    #[test]
    fn import_url_entry_infers_http() {
        let content = r#"{"mcpServers": {"remote": {"url": "https://mcp.example/api", "headers": {"Authorization": "Bearer x"}}}}"#;
        let specs = import_cursor(content).unwrap();
        assert_eq!(specs[0].protocol, Protocol::Http);
        assert_eq!(specs[0].url.as_deref(), Some("https://mcp.example/api"));
        assert_eq!(specs[0].headers.get("Authorization").unwrap(), "Bearer x");
    }

    #[test]
    fn import_rejects_foreign_shapes() {
        assert!(import_cursor(r#"{"servers": []}"#).is_err());
    }

    #[test]
    fn export_then_import_preserves_fields() {
        let mut a = ServerSpec::new("a");
        a.command = Some("uvx".into());
        a.args = vec!["weather".into()];
        a.env.insert("API".into(), "x".into());
        a.protocol = Protocol::Stdio;
        let mut b = ServerSpec::new("b");
        b.url = Some("https://b.example/mcp".into());
        b.protocol = Protocol::Http;

        let exported = export_cursor(&[a.clone(), b.clone()]).unwrap();
        let back = import_cursor(&exported).unwrap();
        assert_eq!(back.len(), 2);
        let a2 = back.iter().find(|s| s.name == "a").unwrap();
        assert_eq!(a2.command, a.command);
        assert_eq!(a2.args, a.args);
        assert_eq!(a2.env, a.env);
        assert_eq!(a2.protocol, Protocol::Stdio);
        let b2 = back.iter().find(|s| s.name == "b").unwrap();
        assert_eq!(b2.url, b.url);
        assert_eq!(b2.protocol, Protocol::Http);
    }
}
