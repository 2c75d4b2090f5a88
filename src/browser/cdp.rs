//! Minimal DevTools protocol client.
//!
//! Enough of the Chrome DevTools protocol to drive a kiosk: discover the
//! page target over the debugger's HTTP endpoint, hold one WebSocket
//! session, issue `Page.navigate` and `Runtime.evaluate`, and surface
//! console events. One command is outstanding at a time; the controller
//! above serializes callers anyway.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use crate::error::BrowserError;

/// Deadline for a single protocol command. Cancellation still interrupts
/// callers sooner via the controller loop.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(200);

type CommandResult = Result<Value, BrowserError>;

/// One entry from the debugger's `/json/list` endpoint.
#[derive(Debug, Deserialize)]
struct TargetInfo {
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "webSocketDebuggerUrl")]
    ws_url: Option<String>,
}

struct Command {
    method: &'static str,
    params: Value,
    reply: oneshot::Sender<CommandResult>,
}

struct Pending {
    id: u64,
    method: &'static str,
    reply: oneshot::Sender<CommandResult>,
}

/// Handle to a live DevTools session.
///
/// The WebSocket itself is owned by a worker task so that events keep
/// flowing while no command is in flight.
pub struct DevTools {
    commands: mpsc::Sender<Command>,
}

impl DevTools {
    /// Waits for the browser's debugger to expose a page target, connects,
    /// and enables the page and runtime domains.
    ///
    /// Must be called from the sandbox-entered thread: the debug port only
    /// exists on sandbox loopback.
    ///
    /// # Errors
    ///
    /// Returns [`BrowserError::DevToolsConnect`] if no target appears within
    /// `deadline` or the WebSocket handshake fails.
    pub async fn connect(
        port: u16,
        deadline: Duration,
        trace_events: bool,
    ) -> Result<Self, BrowserError> {
        let ws_url = discover_page_target(port, deadline).await?;
        debug!(%ws_url, "Connecting to DevTools target");

        let (ws, _response) =
            connect_async(ws_url.as_str())
                .await
                .map_err(|e| BrowserError::DevToolsConnect {
                    port,
                    reason: e.to_string(),
                })?;

        let (commands, command_rx) = mpsc::channel(1);
        tokio::spawn(io_loop(ws, command_rx, trace_events));

        let devtools = Self { commands };
        devtools.call("Page.enable", json!({})).await?;
        devtools.call("Runtime.enable", json!({})).await?;

        Ok(devtools)
    }

    /// Navigates the page. The URL is used as given; effective-URL rewriting
    /// happens in the controller.
    pub async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        let result = self.call("Page.navigate", json!({ "url": url })).await?;

        if let Some(text) = result.get("errorText").and_then(Value::as_str) {
            return Err(BrowserError::DevToolsCommand {
                method: String::from("Page.navigate"),
                message: text.to_owned(),
            });
        }
        Ok(())
    }

    /// Evaluates a script and returns its result as raw JSON bytes.
    pub async fn evaluate(&self, expression: &str) -> Result<Vec<u8>, BrowserError> {
        let result = self
            .call(
                "Runtime.evaluate",
                json!({ "expression": expression, "returnByValue": true }),
            )
            .await?;

        if let Some(exception) = result.get("exceptionDetails") {
            let message = exception
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or("script threw")
                .to_owned();
            return Err(BrowserError::DevToolsCommand {
                method: String::from("Runtime.evaluate"),
                message,
            });
        }

        let value = result
            .pointer("/result/value")
            .cloned()
            .unwrap_or(Value::Null);
        serde_json::to_vec(&value).map_err(BrowserError::Decode)
    }

    /// Issues one protocol command and awaits its response.
    async fn call(&self, method: &'static str, params: Value) -> CommandResult {
        let (reply, reply_rx) = oneshot::channel();
        self.commands
            .send(Command {
                method,
                params,
                reply,
            })
            .await
            .map_err(|_| BrowserError::DevToolsTransport(String::from("session closed")))?;

        match tokio::time::timeout(COMMAND_TIMEOUT, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BrowserError::DevToolsTransport(String::from(
                "session closed mid-command",
            ))),
            Err(_) => Err(BrowserError::DevToolsTimeout {
                method: String::from(method),
            }),
        }
    }
}

/// Polls `/json/list` until a debuggable page target shows up.
async fn discover_page_target(port: u16, deadline: Duration) -> Result<String, BrowserError> {
    let client = reqwest::Client::builder()
        .build()
        .map_err(|e| BrowserError::DevToolsConnect {
            port,
            reason: e.to_string(),
        })?;
    let list_url = format!("http://127.0.0.1:{port}/json/list");
    let started = tokio::time::Instant::now();

    loop {
        match client.get(&list_url).send().await {
            Ok(response) => match response.json::<Vec<TargetInfo>>().await {
                Ok(targets) => {
                    let page = targets
                        .into_iter()
                        .filter(|t| t.kind == "page")
                        .find_map(|t| t.ws_url);
                    if let Some(url) = page {
                        return Ok(url);
                    }
                    trace!("Debugger up, no page target yet");
                }
                Err(e) => trace!(error = %e, "Malformed target list"),
            },
            Err(e) => trace!(error = %e, "Debugger not accepting connections yet"),
        }

        if started.elapsed() > deadline {
            return Err(BrowserError::DevToolsConnect {
                port,
                reason: String::from("no debuggable page target appeared"),
            });
        }
        tokio::time::sleep(CONNECT_POLL_INTERVAL).await;
    }
}

/// Owns the WebSocket: writes commands, routes responses to the single
/// pending reply slot, and logs events as they arrive.
async fn io_loop(
    mut ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut commands: mpsc::Receiver<Command>,
    trace_events: bool,
) {
    let mut next_id: u64 = 0;
    let mut pending: Option<Pending> = None;

    loop {
        tokio::select! {
            command = commands.recv(), if pending.is_none() => {
                let Some(command) = command else { break };

                next_id += 1;
                let payload = json!({
                    "id": next_id,
                    "method": command.method,
                    "params": command.params,
                });

                if let Err(e) = ws.send(Message::text(payload.to_string())).await {
                    let _ = command
                        .reply
                        .send(Err(BrowserError::DevToolsTransport(e.to_string())));
                    break;
                }

                pending = Some(Pending {
                    id: next_id,
                    method: command.method,
                    reply: command.reply,
                });
            }

            message = ws.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        dispatch_message(&text, &mut pending, trace_events);
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        fail_pending(&mut pending, "debugger closed the session");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "DevTools socket error");
                        fail_pending(&mut pending, &e.to_string());
                        break;
                    }
                }
            }
        }
    }

    debug!("DevTools worker exited");
}

fn fail_pending(pending: &mut Option<Pending>, reason: &str) {
    if let Some(p) = pending.take() {
        let _ = p
            .reply
            .send(Err(BrowserError::DevToolsTransport(reason.to_owned())));
    }
}

fn dispatch_message(raw: &str, pending: &mut Option<Pending>, trace_events: bool) {
    let message: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => {
            trace!(error = %e, "Unparseable DevTools message");
            return;
        }
    };

    if let Some(id) = message.get("id").and_then(Value::as_u64) {
        match pending.take() {
            Some(p) if p.id == id => {
                let outcome = match message.get("error") {
                    Some(err) => Err(BrowserError::DevToolsCommand {
                        method: String::from(p.method),
                        message: err
                            .get("message")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown protocol error")
                            .to_owned(),
                    }),
                    None => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
                };
                let _ = p.reply.send(outcome);
            }
            other => {
                trace!(id, "Response for unknown command id");
                *pending = other;
            }
        }
        return;
    }

    handle_event(&message, trace_events);
}

fn handle_event(message: &Value, trace_events: bool) {
    if message.get("method").and_then(Value::as_str) == Some("Runtime.consoleAPICalled") {
        let kind = message
            .pointer("/params/type")
            .and_then(Value::as_str)
            .unwrap_or("log");

        let values: Vec<String> = message
            .pointer("/params/args")
            .and_then(Value::as_array)
            .map(|args| {
                args.iter()
                    .filter_map(|arg| arg.get("value"))
                    .filter(|value| !value.is_null())
                    .map(Value::to_string)
                    .collect()
            })
            .unwrap_or_default();

        if !values.is_empty() {
            info!("console {kind}: {}", values.join(" "));
        }
    }

    if trace_events {
        trace!(event = %message, "DevTools event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_list_deserializes() {
        let raw = r#"[
            {"type": "page", "webSocketDebuggerUrl": "ws://127.0.0.1:9222/devtools/page/AB12"},
            {"type": "service_worker"}
        ]"#;
        let targets: Vec<TargetInfo> = serde_json::from_str(raw).unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].kind, "page");
        assert!(targets[0].ws_url.as_deref().unwrap().starts_with("ws://"));
        assert!(targets[1].ws_url.is_none());
    }

    #[test]
    fn test_response_routing_matches_pending_id() {
        let (tx, mut rx) = oneshot::channel();
        let mut pending = Some(Pending {
            id: 7,
            method: "Page.navigate",
            reply: tx,
        });

        dispatch_message(r#"{"id":7,"result":{"frameId":"F"}}"#, &mut pending, false);

        assert!(pending.is_none());
        let outcome = rx.try_recv().unwrap().unwrap();
        assert_eq!(outcome.pointer("/frameId").unwrap(), "F");
    }

    #[test]
    fn test_protocol_error_becomes_command_error() {
        let (tx, mut rx) = oneshot::channel();
        let mut pending = Some(Pending {
            id: 3,
            method: "Runtime.evaluate",
            reply: tx,
        });

        dispatch_message(
            r#"{"id":3,"error":{"code":-32000,"message":"Cannot find context"}}"#,
            &mut pending,
            false,
        );

        let outcome = rx.try_recv().unwrap();
        match outcome {
            Err(BrowserError::DevToolsCommand { method, message }) => {
                assert_eq!(method, "Runtime.evaluate");
                assert_eq!(message, "Cannot find context");
            }
            other => panic!("expected command error, got {other:?}"),
        }
    }

    #[test]
    fn test_events_do_not_consume_the_pending_slot() {
        let (tx, _rx) = oneshot::channel();
        let mut pending = Some(Pending {
            id: 1,
            method: "Page.enable",
            reply: tx,
        });

        dispatch_message(
            r#"{"method":"Runtime.consoleAPICalled","params":{"type":"log","args":[{"value":"hi"}]}}"#,
            &mut pending,
            false,
        );

        assert!(pending.is_some());
    }
}
