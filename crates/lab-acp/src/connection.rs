// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Framed JSON-RPC 2.0 connection to an agent.
//!
//! One line = one envelope. The connection owns a background reader task
//! that demuxes everything the agent writes:
//!
//! - **responses** resolve the matching entry in the pending-request map;
//! - **agent-initiated requests** (`session/request_permission`, `fs/*`,
//!   `terminal/*`) are dispatched to the [`ClientHandler`] in their own task
//!   so a slow handler never stalls the stream;
//! - **notifications** are forwarded on the event channel in arrival order.
//!
//! The connection is generic over `AsyncRead`/`AsyncWrite`; production wires
//! it to child stdio, tests drive it over `tokio::io::duplex`.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{envelope, AcpError};

/// A JSON-RPC error reply produced by a local handler.
#[derive(Debug, Clone)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    /// Host-side failure (file IO, subprocess spawn, …).
    pub fn internal(message: impl Into<String>) -> Self {
        Self { code: -32603, message: message.into() }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self { code: -32601, message: format!("method not found: {method}") }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self { code: -32602, message: message.into() }
    }
}

/// Local answering side for requests the agent makes back to the gateway.
#[async_trait]
pub trait ClientHandler: Send + Sync {
    async fn handle(&self, method: &str, params: Value) -> Result<Value, RpcError>;
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, AcpError>>>>>;
type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// A live framed channel to one agent.
pub struct AcpConnection {
    writer: SharedWriter,
    pending: Pending,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    request_timeout: Duration,
    reader: JoinHandle<()>,
}

impl AcpConnection {
    /// Start the connection over an arbitrary byte pipe.
    ///
    /// `event_tx` receives every inbound notification in arrival order; the
    /// channel closing signals EOF to the consumer.
    pub fn start<R, W, H>(
        reader: R,
        writer: W,
        handler: Arc<H>,
        event_tx: mpsc::UnboundedSender<Value>,
        request_timeout: Duration,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
        H: ClientHandler + 'static,
    {
        let writer: SharedWriter = Arc::new(Mutex::new(Box::new(writer)));
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        let reader_task = tokio::spawn(read_loop(
            reader,
            writer.clone(),
            handler,
            pending.clone(),
            alive.clone(),
            event_tx,
        ));

        Self {
            writer,
            pending,
            next_id: AtomicU64::new(1),
            alive,
            request_timeout,
            reader: reader_task,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Send a request and await its response, bounded by the per-request
    /// timeout. Timing out removes the pending entry so a late reply is
    /// silently dropped rather than resolving a ghost.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, AcpError> {
        self.request_with_timeout(method, params, self.request_timeout).await
    }

    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, AcpError> {
        if !self.is_alive() {
            return Err(AcpError::ProcessExited);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let msg = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        if let Err(e) = write_line(&self.writer, &msg).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AcpError::ProcessExited),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(AcpError::Timeout { method: method.to_string(), secs: timeout.as_secs() })
            }
        }
    }

    /// Fire-and-forget notification.
    pub async fn notify(&self, method: &str, params: Value) -> Result<(), AcpError> {
        if !self.is_alive() {
            return Err(AcpError::ProcessExited);
        }
        let msg = json!({ "jsonrpc": "2.0", "method": method, "params": params });
        write_line(&self.writer, &msg).await
    }

    /// Flush and shut the write half down (the agent sees stdin EOF).
    pub async fn close_writer(&self) {
        let mut w = self.writer.lock().await;
        let _ = w.shutdown().await;
    }
}

impl Drop for AcpConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn write_line(writer: &SharedWriter, msg: &Value) -> Result<(), AcpError> {
    let mut line = serde_json::to_string(msg).map_err(|e| AcpError::InvalidReply(e.to_string()))?;
    line.push('\n');
    let mut w = writer.lock().await;
    w.write_all(line.as_bytes())
        .await
        .map_err(|_| AcpError::StdinUnavailable)?;
    w.flush().await.map_err(|_| AcpError::StdinUnavailable)
}

async fn read_loop<R, H>(
    reader: R,
    writer: SharedWriter,
    handler: Arc<H>,
    pending: Pending,
    alive: Arc<AtomicBool>,
    event_tx: mpsc::UnboundedSender<Value>,
) where
    R: AsyncRead + Send + Unpin + 'static,
    H: ClientHandler + 'static,
{
    let mut lines = BufReader::new(reader).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let msg: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => {
                // Agents occasionally write banners or stray prints to stdout.
                debug!(line = &line[..line.len().min(200)], "non-JSON agent stdout");
                continue;
            }
        };

        if envelope::is_response(&msg) {
            let Some(id) = envelope::request_id(&msg) else {
                debug!("response with non-integer id ignored");
                continue;
            };
            let slot = pending.lock().await.remove(&id);
            if let Some(tx) = slot {
                let outcome = match msg.get("error") {
                    Some(err) => Err(AcpError::Rpc {
                        code: err.get("code").and_then(Value::as_i64).unwrap_or(0),
                        message: err
                            .get("message")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown error")
                            .to_string(),
                    }),
                    None => Ok(msg.get("result").cloned().unwrap_or(Value::Null)),
                };
                let _ = tx.send(outcome);
            }
        } else if envelope::is_request(&msg) {
            // Agent-initiated request: answer from a separate task so e.g.
            // terminal/wait_for_exit can block without stalling the stream.
            let method = envelope::method(&msg).unwrap_or("").to_string();
            let id = msg.get("id").cloned().unwrap_or(Value::Null);
            let params = msg.get("params").cloned().unwrap_or(Value::Null);
            let handler = handler.clone();
            let writer = writer.clone();
            tokio::spawn(async move {
                let reply = match handler.handle(&method, params).await {
                    Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
                    Err(e) => json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": { "code": e.code, "message": e.message },
                    }),
                };
                if let Err(e) = write_line(&writer, &reply).await {
                    warn!(%method, "failed to answer agent request: {e}");
                }
            });
        } else if envelope::is_notification(&msg) {
            if event_tx.send(msg).is_err() {
                break;
            }
        } else {
            debug!("unclassifiable agent message ignored");
        }
    }

    // EOF: reject everything still in flight so callers fail fast instead of
    // sitting out their full timeout.
    alive.store(false, Ordering::SeqCst);
    for (_, tx) in pending.lock().await.drain() {
        let _ = tx.send(Err(AcpError::ProcessExited));
    }
    debug!("agent reader loop finished");
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader};

    use super::*;

    struct EchoHandler;

    #[async_trait]
    impl ClientHandler for EchoHandler {
        async fn handle(&self, method: &str, params: Value) -> Result<Value, RpcError> {
            match method {
                "echo" => Ok(params),
                other => Err(RpcError::method_not_found(other)),
            }
        }
    }

    /// Wire a connection to an in-memory "agent" and return the agent-side
    /// halves: a line reader for what the gateway writes and a writer for
    /// scripted replies.
    fn harness() -> (
        AcpConnection,
        mpsc::UnboundedReceiver<Value>,
        BufReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>,
        tokio::io::WriteHalf<tokio::io::DuplexStream>,
    ) {
        let (gateway_side, agent_side) = duplex(64 * 1024);
        let (gw_read, gw_write) = tokio::io::split(gateway_side);
        let (ag_read, ag_write) = tokio::io::split(agent_side);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let conn = AcpConnection::start(
            gw_read,
            gw_write,
            Arc::new(EchoHandler),
            event_tx,
            Duration::from_secs(5),
        );
        (conn, event_rx, BufReader::new(ag_read), ag_write)
    }

    async fn next_json(
        reader: &mut BufReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>,
    ) -> Value {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn request_resolves_on_matching_response() {
        let (conn, _events, mut agent_rx, mut agent_tx) = harness();

        let call = tokio::spawn(async move {
            conn.request("initialize", json!({"protocolVersion": 1})).await
        });

        let req = next_json(&mut agent_rx).await;
        assert_eq!(req["method"], "initialize");
        let id = req["id"].as_u64().unwrap();

        let reply = format!("{}\n", json!({"jsonrpc":"2.0","id":id,"result":{"ok":true}}));
        agent_tx.write_all(reply.as_bytes()).await.unwrap();

        let result = call.await.unwrap().unwrap();
        assert_eq!(result["ok"], true);
    }

    #[tokio::test]
    async fn rpc_error_response_is_surfaced() {
        let (conn, _events, mut agent_rx, mut agent_tx) = harness();

        let call = tokio::spawn(async move { conn.request("prompt", json!({})).await });
        let req = next_json(&mut agent_rx).await;
        let id = req["id"].as_u64().unwrap();

        let reply = format!(
            "{}\n",
            json!({"jsonrpc":"2.0","id":id,"error":{"code":-32000,"message":"busy"}})
        );
        agent_tx.write_all(reply.as_bytes()).await.unwrap();

        match call.await.unwrap() {
            Err(AcpError::Rpc { code, message }) => {
                assert_eq!(code, -32000);
                assert_eq!(message, "busy");
            }
            other => panic!("expected Rpc error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn request_times_out_and_clears_pending() {
        let (gateway_side, _agent_side) = duplex(1024);
        let (gw_read, gw_write) = tokio::io::split(gateway_side);
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let conn = AcpConnection::start(
            gw_read,
            gw_write,
            Arc::new(EchoHandler),
            event_tx,
            Duration::from_millis(50),
        );

        match conn.request("prompt", json!({})).await {
            Err(AcpError::Timeout { method, .. }) => assert_eq!(method, "prompt"),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(conn.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn notifications_are_forwarded_in_order() {
        let (_conn, mut events, _agent_rx, mut agent_tx) = harness();

        for i in 0..3 {
            let n = format!(
                "{}\n",
                json!({"jsonrpc":"2.0","method":"session/update","params":{"n":i}})
            );
            agent_tx.write_all(n.as_bytes()).await.unwrap();
        }

        for i in 0..3 {
            let ev = events.recv().await.unwrap();
            assert_eq!(ev["params"]["n"], i);
        }
    }

    #[tokio::test]
    async fn agent_request_is_answered_by_handler() {
        let (_conn, _events, mut agent_rx, mut agent_tx) = harness();

        let req = format!(
            "{}\n",
            json!({"jsonrpc":"2.0","id":7,"method":"echo","params":{"x":1}})
        );
        agent_tx.write_all(req.as_bytes()).await.unwrap();

        let reply = next_json(&mut agent_rx).await;
        assert_eq!(reply["id"], 7);
        assert_eq!(reply["result"]["x"], 1);
    }

    #[tokio::test]
    async fn unknown_agent_request_gets_method_not_found() {
        let (_conn, _events, mut agent_rx, mut agent_tx) = harness();

        let req = format!(
            "{}\n",
            json!({"jsonrpc":"2.0","id":8,"method":"no/such","params":{}})
        );
        agent_tx.write_all(req.as_bytes()).await.unwrap();

        let reply = next_json(&mut agent_rx).await;
        assert_eq!(reply["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn eof_rejects_pending_and_marks_dead() {
        let (conn, _events, _agent_rx, agent_tx) = harness();

        let call = tokio::spawn(async move { conn.request("prompt", json!({})).await });
        // Give the request a moment to register, then hang up.
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(agent_tx);
        drop(_agent_rx);

        match tokio::time::timeout(Duration::from_secs(1), call).await {
            Ok(Ok(Err(AcpError::ProcessExited))) => {}
            other => panic!("expected ProcessExited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_json_lines_are_skipped() {
        let (_conn, mut events, _agent_rx, mut agent_tx) = harness();

        agent_tx.write_all(b"starting agent v1.2...\n").await.unwrap();
        let n = format!(
            "{}\n",
            json!({"jsonrpc":"2.0","method":"session/update","params":{"ok":true}})
        );
        agent_tx.write_all(n.as_bytes()).await.unwrap();

        let ev = events.recv().await.unwrap();
        assert_eq!(ev["params"]["ok"], true);
    }
}
