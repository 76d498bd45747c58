//! Daemon mode – the method channel over a Unix socket, one JSON object per line.

use anyhow::Context;
use quickjs_bridge::types::*;
use quickjs_bridge::{get_config, ChannelResponse, MethodCall, MethodChannel};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

pub async fn run_daemon(socket_path: PathBuf, channel: Arc<MethodChannel>) -> anyhow::Result<()> {
    // Remove stale socket if it exists
    let _ = std::fs::remove_file(&socket_path);

    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("cannot bind socket {}", socket_path.display()))?;

    tracing::info!(
        socket = %socket_path.display(),
        channel = channel.name(),
        "qjsctl daemon listening"
    );

    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let channel = channel.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(stream, channel).await {
                        tracing::warn!(error = %e, "connection closed with error");
                    }
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept error");
            }
        }
    }
}

async fn serve_connection(stream: UnixStream, channel: Arc<MethodChannel>) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let channel = channel.clone();
        // Engine calls block on their worker, keep them off the reactor.
        let response = tokio::task::spawn_blocking(move || handle_request(&line, &channel))
            .await
            .unwrap_or_else(|e| DaemonResponse {
                id: "unknown".into(),
                result: None,
                error: Some(error_info(
                    ErrorCode::InternalError,
                    format!("request handler panicked: {}", e),
                )),
            });

        let mut resp_json = serde_json::to_string(&response).unwrap_or_else(|_| "{}".into());
        resp_json.push('\n');
        writer.write_all(resp_json.as_bytes()).await?;
    }
    Ok(())
}

fn handle_request(line: &str, channel: &MethodChannel) -> DaemonResponse {
    let req: DaemonRequest = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => {
            return DaemonResponse {
                id: "unknown".into(),
                result: None,
                error: Some(error_info(
                    ErrorCode::InvalidArgument,
                    format!("invalid JSON request: {}", e),
                )),
            };
        }
    };

    if req.method == "doctor" {
        let config = serde_json::to_value(get_config()).unwrap_or_default();
        let report = quickjs_bridge::doctor::run_doctor(channel, &config);
        return DaemonResponse {
            id: req.id,
            result: serde_json::to_value(report).ok(),
            error: None,
        };
    }

    match channel.handle(&MethodCall::new(req.method, req.arguments)) {
        ChannelResponse::Result(v) => DaemonResponse {
            id: req.id,
            result: Some(v),
            error: None,
        },
        ChannelResponse::Error(e) => DaemonResponse {
            id: req.id,
            result: None,
            error: Some(e),
        },
    }
}

fn error_info(code: ErrorCode, message: String) -> ErrorInfo {
    ErrorInfo {
        code,
        message,
        details: serde_json::Value::Null,
    }
}
