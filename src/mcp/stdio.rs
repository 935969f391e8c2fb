//! Stdio transport: one session for the life of the process.
//!
//! Line-delimited JSON-RPC on stdin/stdout. Dispatch responses and
//! session-originated notifications (progress, cancellation) are funnelled
//! through one writer task so output lines never interleave.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::mcp::server;
use crate::session::TransportKind;
use crate::state::AppState;
use crate::trace_context::TraceContext;

pub async fn run(state: AppState, shutdown: CancellationToken) -> anyhow::Result<()> {
    let session = state
        .sessions
        .create("stdio", TransportKind::Stdio)
        .await
        .map_err(|e| anyhow::anyhow!("stdio session: {e}"))?;
    tracing::info!(session_id = %session.id, "stdio transport ready");

    let (out_tx, mut out_rx) = mpsc::channel::<String>(256);

    // Single writer keeps stdout lines whole.
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err() {
                return;
            }
            if stdout.write_all(b"\n").await.is_err() {
                return;
            }
            let _ = stdout.flush().await;
        }
    });

    // Session notifications (progress etc.) ride the same writer.
    let mut events = session.subscribe();
    let notif_tx = out_tx.clone();
    let notif_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if notif_tx.send(event.payload.to_string()).await.is_err() {
                return;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            break; // EOF: peer went away
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let request: serde_json::Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                let _ = out_tx
                    .send(
                        serde_json::json!({
                            "jsonrpc": "2.0",
                            "id": null,
                            "error": { "code": -32700, "message": format!("Parse error: {e}") },
                        })
                        .to_string(),
                    )
                    .await;
                continue;
            }
        };

        let trace = TraceContext::new_root();
        if let Some(response) = server::dispatch(&state, &session, request, &trace).await {
            let _ = out_tx.send(response.to_string()).await;
        }
    }

    tracing::info!("stdio transport closing");
    state.sessions.remove(&session.id).await;
    state.tasks.remove_session(&session.id).await;
    state.capabilities.remove(&session.id).await;
    drop(out_tx);
    notif_task.abort();
    let _ = writer.await;
    Ok(())
}
