//! Line-delimited JSON-RPC 2.0 over stdio, the way MCP clients launch tool
//! servers. stdout carries protocol messages only; logs go to stderr.
//!
//! Each `tools/call` runs on its own task so a long research query does not
//! block `ping` or cancellation notices for other calls.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::tools::ToolBox;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

const PARSE_ERROR: i64 = -32700;
const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Deserialize)]
struct Message {
    #[serde(default)]
    id: Option<Value>,
    method: Option<String>,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Deserialize)]
struct CallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelParams {
    request_id: Value,
    #[serde(default)]
    reason: Option<String>,
}

fn reply(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn failure(id: Value, code: i64, message: impl Into<String>) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message.into() }
    })
}

type InFlight = Arc<Mutex<HashMap<String, CancellationToken>>>;

struct Server {
    tools: Arc<ToolBox>,
    in_flight: InFlight,
    shutdown: CancellationToken,
    tasks: JoinSet<()>,
    out: mpsc::UnboundedSender<Value>,
}

impl Server {
    fn send(&self, message: Value) {
        if self.out.send(message).is_err() {
            warn!("stdout writer is gone, dropping message");
        }
    }

    fn handle_line(&mut self, line: &str) {
        let message: Message = match serde_json::from_str(line) {
            Ok(m) => m,
            Err(e) => {
                warn!("unparsable message: {e}");
                self.send(failure(Value::Null, PARSE_ERROR, format!("parse error: {e}")));
                return;
            }
        };

        let Some(method) = message.method else {
            // responses from the client are not expected
            if let Some(id) = message.id {
                self.send(failure(id, INVALID_REQUEST, "missing method"));
            }
            return;
        };
        debug!(%method, id = ?message.id, "rpc message");

        match (method.as_str(), message.id) {
            ("initialize", Some(id)) => self.send(reply(
                id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": { "tools": {} },
                    "serverInfo": {
                        "name": env!("CARGO_PKG_NAME"),
                        "version": env!("CARGO_PKG_VERSION"),
                    }
                }),
            )),
            ("ping", Some(id)) => self.send(reply(id, json!({}))),
            ("tools/list", Some(id)) => {
                self.send(reply(id, json!({ "tools": self.tools.list() })))
            }
            ("tools/call", Some(id)) => self.spawn_call(id, message.params),
            ("notifications/cancelled", None) => self.cancel(message.params),
            ("notifications/initialized", None) => info!("client initialized"),
            (_, Some(id)) => self.send(failure(id, METHOD_NOT_FOUND, format!("method not found: {method}"))),
            (_, None) => debug!(%method, "ignoring notification"),
        }
    }

    fn spawn_call(&mut self, id: Value, params: Value) {
        let params: CallParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => {
                self.send(failure(id, INVALID_PARAMS, format!("invalid tools/call params: {e}")));
                return;
            }
        };

        let key = id.to_string();
        let token = self.shutdown.child_token();
        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.insert(key.clone(), token.clone());
        }

        let tools = self.tools.clone();
        let in_flight = self.in_flight.clone();
        let out = self.out.clone();
        self.tasks.spawn(async move {
            // the call runs on its own task so a panic still gets an answer for `id`
            let call = tokio::spawn(async move {
                tools.call(&params.name, params.arguments, &token).await
            });
            let joined = call.await;
            if let Ok(mut in_flight) = in_flight.lock() {
                in_flight.remove(&key);
            }
            let message = match joined {
                Ok(response) => {
                    reply(id, serde_json::to_value(&response).unwrap_or_else(|_| json!({})))
                }
                Err(e) => {
                    warn!(request = %key, "tool call task failed: {e}");
                    failure(id, INTERNAL_ERROR, format!("tool call failed: {e}"))
                }
            };
            if out.send(message).is_err() {
                warn!("stdout writer is gone, dropping tool result");
            }
        });
    }

    fn cancel(&self, params: Value) {
        let params: CancelParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => {
                warn!("malformed cancellation: {e}");
                return;
            }
        };
        let key = params.request_id.to_string();
        let token = self
            .in_flight
            .lock()
            .ok()
            .and_then(|in_flight| in_flight.get(&key).cloned());
        match token {
            Some(token) => {
                info!(request = %key, reason = ?params.reason, "cancelling tool call");
                token.cancel();
            }
            None => debug!(request = %key, "cancellation for unknown or finished call"),
        }
    }
}

/// Serve requests from `input` until it closes or `shutdown` fires, writing
/// responses to `output`. Calls still running are awaited before returning;
/// on shutdown they are cancelled first, so their browser sessions are
/// released either way.
pub async fn serve<R, W>(
    tools: Arc<ToolBox>,
    input: R,
    mut output: W,
    shutdown: CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    let mut server = Server {
        tools,
        in_flight: Arc::new(Mutex::new(HashMap::new())),
        shutdown: shutdown.clone(),
        tasks: JoinSet::new(),
        out: tx,
    };

    let reading = async move {
        let mut lines = BufReader::new(input).lines();
        loop {
            let line = tokio::select! {
                _ = shutdown.cancelled() => break,
                line = lines.next_line() => line,
            };
            match line {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => server.handle_line(&line),
                Ok(None) => {
                    info!("stdin closed");
                    break;
                }
                Err(e) => {
                    warn!("reading stdin failed: {e}");
                    break;
                }
            }
        }

        if !server.tasks.is_empty() {
            info!(pending = server.tasks.len(), "waiting for in-flight tool calls");
        }
        while let Some(joined) = server.tasks.join_next().await {
            if let Err(e) = joined {
                warn!("tool call task failed: {e}");
            }
        }
        // dropping the server closes the channel and ends the writer
    };

    let writing = async {
        while let Some(message) = rx.recv().await {
            let mut line = serde_json::to_vec(&message).context("encoding response")?;
            line.push(b'\n');
            output.write_all(&line).await.context("writing response")?;
            output.flush().await.context("flushing response")?;
        }
        Ok::<_, anyhow::Error>(())
    };

    let ((), written) = tokio::join!(reading, writing);
    written
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::research::{ResearchSettings, Researcher};
    use crate::selectors::SelectorSet;
    use crate::session::SessionManager;
    use crate::testing::{answer_frame, CountingBackend, ScriptedPage};
    use std::time::Duration;

    fn toolbox() -> Arc<ToolBox> {
        let page = Arc::new(ScriptedPage::new(
            "<html><body><textarea></textarea></body></html>",
            vec![answer_frame("working on it", true)],
        ));
        let sessions = Arc::new(SessionManager::new(Arc::new(CountingBackend::new(page))));
        let researcher = Researcher::new(
            sessions,
            ResearchSettings::default(),
            Arc::new(SelectorSet::default()),
        );
        Arc::new(ToolBox::new(
            Arc::new(researcher),
            Duration::from_secs(120),
            Duration::from_secs(600),
        ))
    }

    async fn exchange(input: &str) -> Vec<Value> {
        let mut output = Vec::new();
        serve(toolbox(), input.as_bytes(), &mut output, CancellationToken::new())
            .await
            .unwrap();
        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn initialize_and_list() {
        let replies = exchange(concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#,
            "\n",
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#,
            "\n",
        ))
        .await;

        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0]["id"], 1);
        assert_eq!(replies[0]["result"]["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(replies[0]["result"]["serverInfo"]["name"], "comet-research");
        assert_eq!(replies[1]["result"]["tools"][1]["name"], "deep_research");
    }

    #[tokio::test]
    async fn protocol_errors() {
        let replies = exchange(concat!(
            "not json\n",
            r#"{"jsonrpc":"2.0","id":"a","method":"resources/list"}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":"b","method":"tools/call","params":{}}"#,
            "\n",
        ))
        .await;

        assert_eq!(replies[0]["error"]["code"], PARSE_ERROR);
        assert_eq!(replies[1]["error"]["code"], METHOD_NOT_FOUND);
        assert_eq!(replies[2]["error"]["code"], INVALID_PARAMS);
    }

    #[tokio::test]
    async fn unknown_tool_comes_back_as_error_envelope() {
        let replies = exchange(concat!(
            r#"{"jsonrpc":"2.0","id":7,"method":"tools/call","params":{"name":"nope","arguments":{}}}"#,
            "\n",
        ))
        .await;
        assert_eq!(replies[0]["id"], 7);
        assert_eq!(replies[0]["result"]["isError"], true);
        assert_eq!(replies[0]["result"]["content"][0]["type"], "text");
    }

    #[tokio::test]
    async fn out_of_range_budget_still_gets_a_reply() {
        let replies = exchange(concat!(
            r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"ask","arguments":{"query":"q","timeBudgetSeconds":1e20}}}"#,
            "\n",
        ))
        .await;
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0]["id"], 3);
        assert_eq!(replies[0]["result"]["isError"], true);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_notice_stops_the_call() {
        let replies = exchange(concat!(
            r#"{"jsonrpc":"2.0","id":9,"method":"tools/call","params":{"name":"ask","arguments":{"query":"slow"}}}"#,
            "\n",
            r#"{"jsonrpc":"2.0","method":"notifications/cancelled","params":{"requestId":9,"reason":"user"}}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":10,"method":"ping"}"#,
            "\n",
        ))
        .await;

        assert_eq!(replies.len(), 2);
        let ping = replies.iter().find(|r| r["id"] == 10).unwrap();
        assert_eq!(ping["result"], json!({}));
        let call = replies.iter().find(|r| r["id"] == 9).unwrap();
        assert_eq!(call["result"]["isError"], true);
        assert!(call["result"]["content"][0]["text"]
            .as_str()
            .unwrap()
            .contains("cancelled"));
    }
}
