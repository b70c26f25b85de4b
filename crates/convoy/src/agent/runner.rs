//! Exchange streaming task.
//!
//! Owns one assistant process from launch to exit: forwards stdout chunks
//! verbatim, splits them into JSON records, captures the session token from
//! the first record that carries one, and commits the buffered records as a
//! single assistant message when the process exits normally. A stop request
//! escalates from SIGTERM to SIGKILL after the grace window; a stopped
//! exchange commits nothing.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::records::{self, LineDecoder, RecordKind};
use super::Orchestrator;
use crate::ws::WsEvent;

const READ_BUF_SIZE: usize = 8192;

pub(crate) async fn run_exchange(
    orchestrator: Arc<Orchestrator>,
    connection_id: String,
    conversation_id: String,
    exchange: u64,
    mut child: Child,
    mut stop_rx: mpsc::Receiver<()>,
    events: mpsc::Sender<WsEvent>,
) {
    let (Some(mut stdout), Some(mut stderr)) = (child.stdout.take(), child.stderr.take()) else {
        // Unreachable with piped stdio, but don't leave a stray process.
        let _ = child.kill().await;
        clear_active(&orchestrator, &connection_id, exchange);
        let _ = events
            .send(WsEvent::Error {
                message: "assistant process has no output streams".to_string(),
            })
            .await;
        return;
    };

    let mut decoder = LineDecoder::default();
    let mut buffered: Vec<Value> = Vec::new();
    let mut session_bound = false;
    let mut killed = false;
    let mut kill_deadline: Option<Instant> = None;
    let mut out_buf = vec![0u8; READ_BUF_SIZE];
    let mut err_buf = vec![0u8; READ_BUF_SIZE];
    let mut stdout_open = true;
    let mut stderr_open = true;

    while stdout_open || stderr_open {
        // Inactive unless a stop was requested.
        let deadline = kill_deadline
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(24 * 60 * 60));

        tokio::select! {
            Some(()) = stop_rx.recv(), if kill_deadline.is_none() => {
                killed = true;
                if let Some(pid) = child.id() {
                    terminate_process(pid);
                }
                kill_deadline = Some(Instant::now() + orchestrator.stop_grace());
            }

            _ = tokio::time::sleep_until(deadline), if kill_deadline.is_some() => {
                warn!("assistant process ignored SIGTERM, force-killing");
                if let Err(e) = child.kill().await {
                    warn!("force kill failed: {e}");
                }
                kill_deadline = None;
            }

            result = stdout.read(&mut out_buf), if stdout_open => match result {
                Ok(0) => stdout_open = false,
                Ok(n) => {
                    let chunk = String::from_utf8_lossy(&out_buf[..n]).into_owned();
                    let _ = events.send(WsEvent::Output { data: chunk.clone() }).await;
                    for record in decoder.push(&chunk) {
                        session_bound = bind_session(
                            &orchestrator,
                            &conversation_id,
                            &record,
                            session_bound,
                        )
                        .await;
                        if records::kind(&record) == RecordKind::Result {
                            debug!("result record for conversation {conversation_id}");
                        }
                        buffered.push(record);
                    }
                }
                Err(e) => {
                    warn!("assistant stdout read failed: {e}");
                    stdout_open = false;
                }
            },

            result = stderr.read(&mut err_buf), if stderr_open => match result {
                Ok(0) => stderr_open = false,
                Ok(n) => {
                    let chunk = String::from_utf8_lossy(&err_buf[..n]).into_owned();
                    warn!("assistant stderr: {}", chunk.trim_end());
                    // Stderr is surfaced but never aborts the exchange.
                    let _ = events.send(WsEvent::Error { message: chunk }).await;
                }
                Err(e) => {
                    warn!("assistant stderr read failed: {e}");
                    stderr_open = false;
                }
            },
        }
    }

    if let Some(record) = decoder.finish() {
        let _ = bind_session(&orchestrator, &conversation_id, &record, session_bound).await;
        buffered.push(record);
    }

    let status = match child.wait().await {
        Ok(status) => Some(status),
        Err(e) => {
            warn!("failed to reap assistant process: {e}");
            None
        }
    };
    let code = status.as_ref().and_then(|s| s.code());
    info!(
        "assistant process for conversation {conversation_id} exited with {:?}",
        code
    );

    clear_active(&orchestrator, &connection_id, exchange);

    if killed {
        // Partial output was shown live but is not persisted.
        info!(
            "exchange stopped by user, discarding {} buffered records",
            buffered.len()
        );
    } else if !buffered.is_empty() {
        if let Err(e) = orchestrator
            .conversations()
            .append_assistant(&conversation_id, buffered)
            .await
        {
            warn!("failed to commit assistant message for {conversation_id}: {e}");
        }
    }

    let _ = events.send(WsEvent::Complete { code }).await;
}

/// Bind the session token carried by a record, first-write-wins. Returns the
/// updated "already bound" flag.
async fn bind_session(
    orchestrator: &Orchestrator,
    conversation_id: &str,
    record: &Value,
    already_bound: bool,
) -> bool {
    if already_bound {
        return true;
    }
    let Some(session_id) = records::session_id(record) else {
        return false;
    };
    match orchestrator.sessions().bind(conversation_id, session_id).await {
        Ok(_) => true,
        Err(e) => {
            warn!("failed to persist session binding for {conversation_id}: {e}");
            // Still treated as bound for this exchange; later records must
            // not retry with a different token.
            true
        }
    }
}

/// Remove the connection's active entry, but only if it still belongs to
/// this exchange. A later exchange on the same connection must never be
/// evicted by an earlier one's exit.
fn clear_active(orchestrator: &Orchestrator, connection_id: &str, exchange: u64) {
    orchestrator
        .active
        .remove_if(connection_id, |_, process| process.exchange == exchange);
}

/// Ask a process to terminate with SIGTERM.
fn terminate_process(pid: u32) {
    match std::process::Command::new("kill").arg(pid.to_string()).status() {
        Ok(status) if status.success() => debug!("sent SIGTERM to {pid}"),
        Ok(status) => warn!("kill {pid} exited with {status}"),
        Err(e) => warn!("failed to run kill for {pid}: {e}"),
    }
}
