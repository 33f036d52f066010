use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::tools::{self, ToolRouter};

const PARSE_ERROR: i64 = -32700;
const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;

const PROTOCOL_VERSION_FALLBACK: &str = "2024-11-05";

/// Stdio JSON-RPC server exposing the dialog tools.
pub struct McpServer {
    router: Arc<ToolRouter>,
    max_message_bytes: usize,
}

impl McpServer {
    pub fn new(router: ToolRouter, max_message_bytes: usize) -> Self {
        Self {
            router: Arc::new(router),
            max_message_bytes,
        }
    }

    /// Serves requests from stdin until EOF or an explicit shutdown.
    /// Responses funnel through a single writer task so concurrent tool
    /// calls cannot interleave bytes on stdout.
    pub async fn serve(&self) -> Result<()> {
        let mut reader = BufReader::new(tokio::io::stdin());
        let (out_tx, mut out_rx) = mpsc::channel::<Value>(32);

        let writer = tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            while let Some(frame) = out_rx.recv().await {
                let mut payload = frame.to_string();
                payload.push('\n');
                if stdout.write_all(payload.as_bytes()).await.is_err() {
                    break;
                }
                if stdout.flush().await.is_err() {
                    break;
                }
            }
        });

        info!("listening on stdio");
        loop {
            match read_message(&mut reader, self.max_message_bytes).await? {
                Inbound::Eof => {
                    debug!("stdin closed");
                    break;
                }
                Inbound::Unparseable { detail } => {
                    warn!("dropping unparseable frame: {detail}");
                    let frame =
                        error_frame(Value::Null, PARSE_ERROR, &format!("parse error: {detail}"));
                    let _ = out_tx.send(frame).await;
                }
                Inbound::Oversized { declared } => {
                    warn!("dropping oversized frame of {declared} bytes");
                    let frame = error_frame(
                        Value::Null,
                        INVALID_REQUEST,
                        &format!(
                            "message of {declared} bytes exceeds limit of {} bytes",
                            self.max_message_bytes
                        ),
                    );
                    let _ = out_tx.send(frame).await;
                }
                Inbound::Message(message) => {
                    if !self.handle_message(message, &out_tx).await {
                        break;
                    }
                }
            }
        }

        // Writer drains once every sender, including in-flight tool calls,
        // is gone.
        drop(out_tx);
        let _ = writer.await;
        Ok(())
    }

    /// Handles one decoded frame. Returns false when the client asked the
    /// server to shut down.
    async fn handle_message(&self, message: Value, out_tx: &mpsc::Sender<Value>) -> bool {
        let id = message.get("id").cloned().unwrap_or(Value::Null);
        let has_id = !id.is_null();
        let method = message
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let params = message.get("params").cloned().unwrap_or_else(|| json!({}));

        match method.as_str() {
            "initialize" => {
                let protocol_version = params
                    .get("protocolVersion")
                    .and_then(Value::as_str)
                    .unwrap_or(PROTOCOL_VERSION_FALLBACK);
                let result = json!({
                    "protocolVersion": protocol_version,
                    "capabilities": { "tools": {} },
                    "serverInfo": {
                        "name": "ping-principal-rs",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                });
                let _ = out_tx.send(result_frame(id, result)).await;
            }
            "tools/list" => {
                let result = json!({ "tools": tools::tool_definitions() });
                let _ = out_tx.send(result_frame(id, result)).await;
            }
            "tools/call" => {
                // Each call runs on its own task so one open dialog never
                // blocks the read loop or other calls.
                let router = Arc::clone(&self.router);
                let out_tx = out_tx.clone();
                tokio::spawn(async move {
                    let name = params
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_owned();
                    let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
                    let response = router.dispatch(&name, arguments).await;
                    let payload = serde_json::to_value(&response)
                        .unwrap_or_else(|_| json!({ "content": [], "isError": true }));
                    let _ = out_tx.send(result_frame(id, payload)).await;
                });
            }
            "shutdown" => {
                info!("shutdown requested");
                let _ = out_tx.send(result_frame(id, Value::Null)).await;
                return false;
            }
            _ => {
                if has_id {
                    let frame = error_frame(
                        id,
                        METHOD_NOT_FOUND,
                        &format!("method not found: {method}"),
                    );
                    let _ = out_tx.send(frame).await;
                } else {
                    debug!("skipping notification: {method}");
                }
            }
        }
        true
    }
}

#[derive(Debug)]
enum Inbound {
    Eof,
    Message(Value),
    Oversized { declared: usize },
    Unparseable { detail: String },
}

/// Reads one inbound frame. Accepts both `Content-Length`-framed messages
/// and bare JSON documents delimited by newlines, since clients differ on
/// which transport framing they speak. Frames travel as raw bytes end to
/// end, so a non-UTF-8 frame is answered and skipped like any other
/// undecodable input instead of tearing the loop down.
async fn read_message<R>(reader: &mut R, max_bytes: usize) -> Result<Inbound>
where
    R: AsyncBufRead + Unpin,
{
    // One line buffers at most this many bytes; the floor leaves room for
    // header lines under a small frame limit.
    let cap = max_bytes.saturating_add(2).max(4096) as u64;
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = (&mut *reader)
            .take(cap)
            .read_until(b'\n', &mut line)
            .await
            .context("reading protocol frame")?;
        if read == 0 {
            return Ok(Inbound::Eof);
        }
        if read as u64 == cap && !line.ends_with(b"\n") {
            let drained = drain_line(reader).await?;
            return Ok(Inbound::Oversized {
                declared: read + drained,
            });
        }
        if !line.trim_ascii().is_empty() {
            break;
        }
    }

    let first_line = line.trim_ascii().to_owned();
    let header = String::from_utf8_lossy(&first_line).to_lowercase();
    if let Some(raw_length) = header.strip_prefix("content-length:") {
        let declared: usize = match raw_length.trim().parse() {
            Ok(length) => length,
            Err(err) => {
                return Ok(Inbound::Unparseable {
                    detail: format!("bad Content-Length header: {err}"),
                })
            }
        };
        // Skip the remaining headers up to the blank separator line.
        loop {
            line.clear();
            let read = reader
                .read_until(b'\n', &mut line)
                .await
                .context("reading protocol headers")?;
            if read == 0 {
                return Ok(Inbound::Eof);
            }
            if line.trim_ascii().is_empty() {
                break;
            }
        }
        if declared > max_bytes {
            drain_exact(reader, declared).await?;
            return Ok(Inbound::Oversized { declared });
        }
        let mut body = vec![0u8; declared];
        reader
            .read_exact(&mut body)
            .await
            .context("reading framed body")?;
        return Ok(match serde_json::from_slice(&body) {
            Ok(value) => Inbound::Message(value),
            Err(err) => Inbound::Unparseable {
                detail: err.to_string(),
            },
        });
    }

    if first_line.len() > max_bytes {
        return Ok(Inbound::Oversized {
            declared: first_line.len(),
        });
    }
    Ok(match serde_json::from_slice(&first_line) {
        Ok(value) => Inbound::Message(value),
        Err(err) => Inbound::Unparseable {
            detail: err.to_string(),
        },
    })
}

/// Discards the rest of an over-long line, returning how many bytes were
/// thrown away.
async fn drain_line<R>(reader: &mut R) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut scratch = Vec::new();
    let mut drained = 0;
    loop {
        scratch.clear();
        let read = (&mut *reader)
            .take(4096)
            .read_until(b'\n', &mut scratch)
            .await
            .context("draining oversized line")?;
        if read == 0 {
            return Ok(drained);
        }
        drained += read;
        if scratch.ends_with(b"\n") {
            return Ok(drained);
        }
    }
}

/// Consumes a declared body without buffering it, keeping the stream in
/// sync after an oversized frame.
async fn drain_exact<R>(reader: &mut R, mut remaining: usize) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut chunk = [0u8; 4096];
    while remaining > 0 {
        let take = remaining.min(chunk.len());
        let read = reader
            .read(&mut chunk[..take])
            .await
            .context("draining oversized frame")?;
        if read == 0 {
            break;
        }
        remaining -= read;
    }
    Ok(())
}

fn result_frame(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn error_frame(id: Value, code: i64, message: &str) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::applescript::{ScriptError, ScriptRunner};
    use crate::config::DialogConfig;
    use crate::dialog::DialogBridge;

    struct CannedRunner(Result<String, ScriptError>);

    #[async_trait]
    impl ScriptRunner for CannedRunner {
        async fn run(&self, _script: &str) -> Result<String, ScriptError> {
            self.0.clone()
        }
    }

    fn test_server(raw: &str) -> McpServer {
        let bridge = DialogBridge::new(
            DialogConfig::default(),
            Arc::new(CannedRunner(Ok(raw.to_owned()))),
        );
        McpServer::new(ToolRouter::new(bridge), 1024 * 1024)
    }

    #[tokio::test]
    async fn read_message_parses_content_length_frames() {
        let body = r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#;
        let framed = format!("Content-Length: {}\r\n\r\n{}", body.len(), body);
        let mut reader = BufReader::new(framed.as_bytes());

        let inbound = read_message(&mut reader, 1024).await.expect("read frame");

        match inbound {
            Inbound::Message(value) => assert_eq!(value["method"], "ping"),
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_message_parses_line_delimited_json() {
        let input = "\n\n{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"ping\"}\n";
        let mut reader = BufReader::new(input.as_bytes());

        let inbound = read_message(&mut reader, 1024).await.expect("read frame");

        match inbound {
            Inbound::Message(value) => assert_eq!(value["id"], 2),
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_message_reports_eof() {
        let mut reader = BufReader::new("".as_bytes());

        let inbound = read_message(&mut reader, 1024).await.expect("read frame");

        assert!(matches!(inbound, Inbound::Eof));
    }

    #[tokio::test]
    async fn read_message_flags_unparseable_lines() {
        let mut reader = BufReader::new("not json\n".as_bytes());

        let inbound = read_message(&mut reader, 1024).await.expect("read frame");

        assert!(matches!(inbound, Inbound::Unparseable { .. }));
    }

    #[tokio::test]
    async fn oversized_frame_is_skipped_and_stream_stays_in_sync() {
        let oversized_body = "x".repeat(64);
        let input = format!(
            "Content-Length: {}\r\n\r\n{}{}\n",
            oversized_body.len(),
            oversized_body,
            r#"{"jsonrpc":"2.0","id":3,"method":"ping"}"#
        );
        let mut reader = BufReader::new(input.as_bytes());

        let first = read_message(&mut reader, 16).await.expect("read frame");
        assert!(matches!(first, Inbound::Oversized { declared: 64 }));

        let second = read_message(&mut reader, 1024).await.expect("read frame");
        match second {
            Inbound::Message(value) => assert_eq!(value["id"], 3),
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_line_is_flagged() {
        let long_line = format!("{}\n", "y".repeat(100));
        let mut reader = BufReader::new(long_line.as_bytes());

        let inbound = read_message(&mut reader, 16).await.expect("read frame");

        assert!(matches!(inbound, Inbound::Oversized { declared: 100 }));
    }

    #[tokio::test]
    async fn line_overflowing_the_buffer_is_drained_and_flagged() {
        let input = format!(
            "{}\n{}\n",
            "y".repeat(5000),
            r#"{"jsonrpc":"2.0","id":4,"method":"ping"}"#
        );
        let mut reader = BufReader::new(input.as_bytes());

        let first = read_message(&mut reader, 16).await.expect("read frame");
        assert!(matches!(first, Inbound::Oversized { declared: 5001 }));

        let second = read_message(&mut reader, 1024).await.expect("read frame");
        match second {
            Inbound::Message(value) => assert_eq!(value["id"], 4),
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_utf8_frame_is_flagged_and_loop_recovers() {
        let mut input = Vec::from(&b"\xff\xfe{\"jsonrpc\":\"2.0\"}\n"[..]);
        input.extend_from_slice(b"{\"jsonrpc\":\"2.0\",\"id\":6,\"method\":\"ping\"}\n");
        let mut reader = BufReader::new(input.as_slice());

        let first = read_message(&mut reader, 1024).await.expect("read frame");
        assert!(matches!(first, Inbound::Unparseable { .. }));

        let second = read_message(&mut reader, 1024).await.expect("read frame");
        match second {
            Inbound::Message(value) => assert_eq!(value["id"], 6),
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn initialize_echoes_protocol_version() {
        let server = test_server("ok");
        let (tx, mut rx) = mpsc::channel(4);
        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": { "protocolVersion": "2025-03-26" },
        });

        let keep_going = server.handle_message(request, &tx).await;

        assert!(keep_going);
        let frame = rx.recv().await.expect("initialize response");
        assert_eq!(frame["id"], 1);
        assert_eq!(frame["result"]["protocolVersion"], "2025-03-26");
        assert_eq!(frame["result"]["serverInfo"]["name"], "ping-principal-rs");
    }

    #[tokio::test]
    async fn initialize_falls_back_to_known_protocol_version() {
        let server = test_server("ok");
        let (tx, mut rx) = mpsc::channel(4);
        let request = json!({ "jsonrpc": "2.0", "id": 7, "method": "initialize" });

        server.handle_message(request, &tx).await;

        let frame = rx.recv().await.expect("initialize response");
        assert_eq!(frame["result"]["protocolVersion"], PROTOCOL_VERSION_FALLBACK);
    }

    #[tokio::test]
    async fn tools_list_returns_both_tools() {
        let server = test_server("ok");
        let (tx, mut rx) = mpsc::channel(4);
        let request = json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list" });

        server.handle_message(request, &tx).await;

        let frame = rx.recv().await.expect("tools/list response");
        let tools = frame["result"]["tools"]
            .as_array()
            .expect("tools array");
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0]["name"], "ask_human");
        assert_eq!(tools[1]["name"], "notify_human");
    }

    #[tokio::test]
    async fn tools_call_routes_to_the_router() {
        let server = test_server("Yes");
        let (tx, mut rx) = mpsc::channel(4);
        let request = json!({
            "jsonrpc": "2.0",
            "id": 3,
            "method": "tools/call",
            "params": {
                "name": "ask_human",
                "arguments": { "type": "confirm", "question": "Proceed?" },
            },
        });

        server.handle_message(request, &tx).await;

        let frame = rx.recv().await.expect("tools/call response");
        assert_eq!(frame["id"], 3);
        assert_eq!(frame["result"]["isError"], false);
        let text = frame["result"]["content"][0]["text"]
            .as_str()
            .expect("text content");
        assert_eq!(text, "Question: Proceed?\n\nUser confirmed: Yes");
    }

    #[tokio::test]
    async fn unknown_method_with_id_gets_an_error() {
        let server = test_server("ok");
        let (tx, mut rx) = mpsc::channel(4);
        let request = json!({ "jsonrpc": "2.0", "id": 5, "method": "bogus/method" });

        server.handle_message(request, &tx).await;

        let frame = rx.recv().await.expect("error response");
        assert_eq!(frame["id"], 5);
        assert_eq!(frame["error"]["code"], METHOD_NOT_FOUND);
        assert_eq!(frame["error"]["message"], "method not found: bogus/method");
    }

    #[tokio::test]
    async fn notifications_without_id_are_skipped() {
        let server = test_server("ok");
        let (tx, mut rx) = mpsc::channel(4);
        let request = json!({ "jsonrpc": "2.0", "method": "notifications/initialized" });

        let keep_going = server.handle_message(request, &tx).await;

        assert!(keep_going);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn shutdown_acknowledges_and_stops_the_loop() {
        let server = test_server("ok");
        let (tx, mut rx) = mpsc::channel(4);
        let request = json!({ "jsonrpc": "2.0", "id": 9, "method": "shutdown" });

        let keep_going = server.handle_message(request, &tx).await;

        assert!(!keep_going);
        let frame = rx.recv().await.expect("shutdown response");
        assert_eq!(frame["id"], 9);
        assert_eq!(frame["result"], Value::Null);
    }
}
