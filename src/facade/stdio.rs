use crate::facade::rpc::McpFacade;
use anyhow::Result;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

/// Serve MCP over line-delimited JSON-RPC on stdin/stdout. stderr stays
/// free for logs. Returns when stdin closes or shutdown is signalled.
pub async fn serve_stdio(
    facade: Arc<McpFacade>,
    shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<()> {
    serve_lines(facade, tokio::io::stdin(), tokio::io::stdout(), shutdown).await
}

/// The framing core, generic over the byte streams so tests can drive it
/// with in-memory pipes.
pub async fn serve_lines<R, W>(
    facade: Arc<McpFacade>,
    reader: R,
    mut writer: W,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };
        let Some(line) = line else {
            debug!("input closed; stdio façade exiting");
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<serde_json::Value>(line) {
            Ok(payload) => facade.handle_value(payload).await,
            Err(e) => {
                warn!("unparseable MCP frame: {}", e);
                Some(McpFacade::parse_error())
            }
        };

        if let Some(response) = response {
            let mut frame = serde_json::to_vec(&response)?;
            frame.push(b'\n');
            writer.write_all(&frame).await?;
            writer.flush().await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{ActivityRecorder, RecorderSettings};
    use crate::bus::EventBus;
    use crate::config::Config;
    use crate::index::ToolIndex;
    use crate::router::{ProxyRouter, RouterSettings};
    use crate::store::{DB_FILE, Store};
    use crate::upstream::UpstreamManager;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    fn facade() -> (tempfile::TempDir, Arc<McpFacade>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join(DB_FILE)).unwrap());
        let index = Arc::new(ToolIndex::new(store.clone(), false).unwrap());
        let bus = EventBus::new();
        let recorder = Arc::new(ActivityRecorder::new(
            store.clone(),
            bus.clone(),
            RecorderSettings {
                max_response_size: 4096,
                retention_days: 30,
                max_records: 1000,
                cleanup_interval: Duration::from_secs(3600),
                queue_capacity: 64,
            },
        ));
        let config_path = dir.path().join("mcp_config.json");
        crate::config::save_config(&Config::default(), Some(&config_path)).unwrap();
        let manager = Arc::new(UpstreamManager::new(
            Config::default(),
            Some(config_path),
            store.clone(),
            index.clone(),
            bus,
            Some(recorder.clone()),
        ));
        let router = Arc::new(ProxyRouter::new(
            manager,
            index,
            store,
            recorder,
            RouterSettings::from_config(&Config::default()),
        ));
        (dir, Arc::new(McpFacade::new(router, true)))
    }

    async fn drive(input: &str) -> Vec<serde_json::Value> {
        let (_dir, facade) = facade();
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        drop(shutdown_tx);

        let (mut client_side, server_side) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server_side);

        let server = tokio::spawn(serve_lines(facade, server_read, server_write, shutdown_rx));

        client_side.write_all(input.as_bytes()).await.unwrap();
        client_side.shutdown().await.unwrap();

        let mut output = String::new();
        client_side.read_to_string(&mut output).await.unwrap();
        server.await.unwrap().unwrap();

        output
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).expect("façade emitted invalid JSON"))
            .collect()
    }

    #[tokio::test]
    async fn initialize_then_list_over_lines() {
        let responses = drive(concat!(
            "{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"initialize\",\"params\":{}}\n",
            "{\"jsonrpc\":\"2.0\",\"method\":\"notifications/initialized\"}\n",
            "{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"tools/list\"}\n",
        ))
        .await;
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["id"], 1);
        assert_eq!(responses[0]["result"]["serverInfo"]["name"], "mcpproxy");
        assert_eq!(responses[1]["id"], 2);
        assert_eq!(
            responses[1]["result"]["tools"]
                .as_array()
                .unwrap()
                .len(),
            6
        );
    }

    #[tokio::test]
    async fn garbage_line_yields_parse_error() {
        let responses = drive("this is not json\n").await;
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["error"]["code"], -32700);
    }

    #[tokio::test]
    async fn blank_lines_are_ignored() {
        let responses = drive("\n\n{\"jsonrpc\":\"2.0\",\"id\":5,\"method\":\"ping\"}\n").await;
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["id"], 5);
    }
}
