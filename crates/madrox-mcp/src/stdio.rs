//! STDIO transport: newline-delimited JSON-RPC 2.0 on stdin/stdout.
//!
//! One request or notification per line; responses are written in request
//! order because the loop is strictly sequential. There is exactly one peer
//! for the life of the process, and EOF on stdin is a clean shutdown.

use crate::dispatcher::{handle_rpc, ERR_INVALID_REQUEST};
use madrox_orchestrator::InstanceManager;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

/// Serve the tool surface over stdin/stdout until EOF.
pub async fn serve(manager: Arc<InstanceManager>) -> std::io::Result<()> {
    info!("stdio transport ready");
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();
    serve_streams(manager, stdin, stdout).await
}

/// Transport loop over arbitrary streams, so tests can drive it with
/// in-memory pipes.
pub async fn serve_streams<R, W>(
    manager: Arc<InstanceManager>,
    reader: R,
    mut writer: W,
) -> std::io::Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Value>(trimmed) {
            Ok(request) => handle_rpc(&manager, &request).await,
            Err(e) => {
                warn!("unparseable JSON-RPC line: {e}");
                Some(json!({
                    "jsonrpc": "2.0",
                    "id": Value::Null,
                    "error": {"code": ERR_INVALID_REQUEST, "message": format!("invalid JSON: {e}")},
                }))
            }
        };
        if let Some(response) = response {
            write_line(&mut writer, &response.to_string()).await?;
        }
    }
    debug!("stdin closed, stdio transport exiting");
    Ok(())
}

/// Write one newline-delimited JSON message and flush.
async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, json: &str) -> std::io::Result<()> {
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use madrox_core::Config;
    use madrox_term::MockSession;

    fn manager() -> Arc<InstanceManager> {
        Arc::new(InstanceManager::new(
            Config::default(),
            Arc::new(MockSession::new()),
        ))
    }

    async fn roundtrip(input: &str) -> Vec<Value> {
        let mut out = Vec::new();
        serve_streams(manager(), input.as_bytes(), &mut out)
            .await
            .unwrap();
        String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn initialize_handshake() {
        let responses =
            roundtrip("{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"initialize\",\"params\":{}}\n")
                .await;
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["id"], 1);
        assert_eq!(responses[0]["result"]["serverInfo"]["name"], "madrox");
    }

    #[tokio::test]
    async fn tools_list_enumerates_all_tools() {
        let responses =
            roundtrip("{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"tools/list\"}\n").await;
        let tools = responses[0]["result"]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), crate::tools::TOOL_COUNT);
    }

    #[tokio::test]
    async fn notifications_get_no_response() {
        let responses = roundtrip(
            "{\"jsonrpc\":\"2.0\",\"method\":\"notifications/initialized\"}\n\
             {\"jsonrpc\":\"2.0\",\"id\":3,\"method\":\"tools/list\"}\n",
        )
        .await;
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["id"], 3);
    }

    #[tokio::test]
    async fn unknown_method_reports_method_not_found() {
        let responses =
            roundtrip("{\"jsonrpc\":\"2.0\",\"id\":4,\"method\":\"frobnicate\"}\n").await;
        assert_eq!(
            responses[0]["error"]["code"],
            crate::dispatcher::ERR_METHOD_NOT_FOUND
        );
    }

    #[tokio::test]
    async fn responses_preserve_request_order() {
        let input = "{\"jsonrpc\":\"2.0\",\"id\":10,\"method\":\"tools/list\"}\n\
                     {\"jsonrpc\":\"2.0\",\"id\":11,\"method\":\"ping\"}\n";
        let responses = roundtrip(input).await;
        assert_eq!(responses[0]["id"], 10);
        assert_eq!(responses[1]["id"], 11);
    }
}
