//! Line-delimited JSON request/response transport over stdio.
//!
//! Each request is a single line `{id, tool, params}`; each response a
//! single line `{id, ok, result | error}`. Requests are served
//! concurrently so a long-polling get_status never blocks other calls;
//! responses are serialized through one writer.

use crate::error::Error;
use crate::tools::registry::ToolRegistry;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

/// One inbound request frame.
#[derive(Debug, Deserialize)]
pub struct Request {
    pub id: Value,
    pub tool: String,
    #[serde(default)]
    pub params: Value,
}

/// One outbound response frame.
#[derive(Debug, Serialize)]
pub struct Response {
    pub id: Value,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl Response {
    fn success(id: Value, result: Value) -> Self {
        Self {
            id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    fn failure(id: Value, error: &Error) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(structured_error(error)),
        }
    }
}

/// The structured error object the client sees; never a raw exception.
pub fn structured_error(error: &Error) -> Value {
    let mut object = serde_json::json!({
        "kind": error.kind(),
        "message": error.to_string(),
    });
    if let Error::InvalidInput { path, expected } = error {
        object["detail"] = serde_json::json!({"path": path, "expected": expected});
    }
    if let Error::QueryLimit { kind } = error {
        object["detail"] = serde_json::json!({"deadline": kind.to_string()});
    }
    object
}

/// Serve requests from `input` until EOF, writing responses to `output`.
pub async fn serve<R, W>(registry: Arc<ToolRegistry>, input: R, output: W) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<String>(64);

    let writer = tokio::spawn(async move {
        let mut output = output;
        while let Some(line) = rx.recv().await {
            if output.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if output.write_all(b"\n").await.is_err() {
                break;
            }
            let _ = output.flush().await;
        }
    });

    let mut lines = BufReader::new(input).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                let response = Response::failure(
                    Value::Null,
                    &Error::invalid_input("request", format!("a request frame ({})", e)),
                );
                let _ = tx.send(serde_json::to_string(&response).unwrap_or_default()).await;
                continue;
            }
        };

        // Each request runs on its own task so long-polls do not block
        // the read loop.
        let registry = registry.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let response = match registry.execute(&request.tool, request.params).await {
                Ok(result) => Response::success(request.id, result),
                Err(e) => Response::failure(request.id, &e),
            };
            let _ = tx
                .send(serde_json::to_string(&response).unwrap_or_default())
                .await;
        });
    }

    drop(tx);
    let _ = writer.await;
    Ok(())
}

/// Serve over the process stdio streams.
pub async fn serve_stdio(registry: Arc<ToolRegistry>) -> std::io::Result<()> {
    serve(registry, tokio::io::stdin(), tokio::io::stdout()).await
}
