//! Local INDI driver started as a child process

use super::channel::{pump, ChannelLink, LinkEvent, EVENT_CHANNEL_CAPACITY, OUTGOING_CHANNEL_CAPACITY};
use crate::error::LinkError;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

/// Start `program` with piped stdio; the driver talks INDI on stdin/stdout.
///
/// The child is killed when the link is dropped.
pub fn spawn_driver(handle: &Handle, program: &str, args: &[String]) -> Result<ChannelLink, LinkError> {
    let spawn_error = |reason: String| LinkError::Spawn {
        program: program.to_string(),
        reason,
    };

    let _guard = handle.enter();
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| spawn_error(e.to_string()))?;

    let stdin = child.stdin.take().ok_or_else(|| spawn_error("stdin not piped".to_string()))?;
    let stdout = child.stdout.take().ok_or_else(|| spawn_error("stdout not piped".to_string()))?;
    let stderr = child.stderr.take().ok_or_else(|| spawn_error("stderr not piped".to_string()))?;
    tracing::info!("Started INDI driver {} (pid {:?})", program, child.id());

    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (out_tx, out_rx) = mpsc::channel(OUTGOING_CHANNEL_CAPACITY);

    let name = program.to_string();
    let log_task = handle.spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!("[{}] {}", name, line);
        }
    });

    let name = program.to_string();
    let io_task = handle.spawn(async move {
        if event_tx.send(LinkEvent::Connected).await.is_err() {
            return;
        }
        pump(stdout, stdin, event_tx, out_rx).await;
        match child.try_wait() {
            Ok(Some(status)) => tracing::info!("INDI driver {} exited: {}", name, status),
            _ => {
                if let Err(e) = child.kill().await {
                    tracing::warn!("Failed to stop INDI driver {}: {}", name, e);
                }
            }
        }
    });

    Ok(ChannelLink::new(
        format!("driver:{}", program),
        event_rx,
        out_tx,
        vec![io_task, log_task],
    ))
}
