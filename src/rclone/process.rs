//! One-shot rclone subprocess driver / rclone 子进程驱动
//!
//! The driver owns the child: it frames stdout and stderr concurrently, turns
//! lines into [`ProgressEvent`]s, and sends exactly one `Exited` event once both
//! pipes are closed and the child has been reaped.

use futures::StreamExt;
use std::io;
use std::process::Stdio;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::FramedRead;

use super::progress::{OutputLineCodec, ProgressExtractor, Stream};
use crate::task::ProgressEvent;

/// Termination handle for a spawned rclone process / 子进程终止句柄
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    terminate_tx: oneshot::Sender<()>,
}

impl ProcessHandle {
    pub fn new(pid: Option<u32>, terminate_tx: oneshot::Sender<()>) -> Self {
        Self { pid, terminate_tx }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ask the driver to signal the child / 请求终止子进程
    ///
    /// Returns `false` if the driver has already finished.
    pub fn terminate(self) -> bool {
        self.terminate_tx.send(()).is_ok()
    }
}

/// Spawn `binary args...` and start driving it / 启动 rclone 子进程
pub fn spawn_transfer(
    binary: &str,
    args: &[String],
    task_id: &str,
) -> io::Result<(ProcessHandle, mpsc::UnboundedReceiver<ProgressEvent>)> {
    let mut child = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let pid = child.id();
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "rclone stdout not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "rclone stderr not captured"))?;

    tracing::info!("Spawned rclone for task {} (pid {:?}): {} {}", task_id, pid, binary, args.join(" "));

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (terminate_tx, terminate_rx) = oneshot::channel();
    tokio::spawn(drive(child, stdout, stderr, task_id.to_string(), event_tx, terminate_rx));

    Ok((ProcessHandle::new(pid, terminate_tx), event_rx))
}

fn emit(tx: &mpsc::UnboundedSender<ProgressEvent>, event: Option<ProgressEvent>) {
    if let Some(event) = event {
        if event.is_error() {
            tracing::warn!("rclone [{}]: {:?}", event.task_id, event.kind);
        }
        // 接收端已关闭时直接丢弃
        let _ = tx.send(event);
    }
}

async fn drive(
    mut child: Child,
    stdout: ChildStdout,
    stderr: ChildStderr,
    task_id: String,
    tx: mpsc::UnboundedSender<ProgressEvent>,
    mut terminate_rx: oneshot::Receiver<()>,
) {
    let mut extractor = ProgressExtractor::new(task_id.clone());
    let mut out = FramedRead::new(stdout, OutputLineCodec::new());
    let mut err = FramedRead::new(stderr, OutputLineCodec::new());
    let mut out_open = true;
    let mut err_open = true;
    let mut signal_armed = true;

    while out_open || err_open {
        tokio::select! {
            line = out.next(), if out_open => match line {
                Some(Ok(line)) => emit(&tx, extractor.feed(Stream::Stdout, &line)),
                Some(Err(e)) => {
                    tracing::debug!("stdout read failed for task {}: {}", task_id, e);
                    out_open = false;
                }
                None => out_open = false,
            },
            line = err.next(), if err_open => match line {
                Some(Ok(line)) => emit(&tx, extractor.feed(Stream::Stderr, &line)),
                Some(Err(e)) => {
                    tracing::debug!("stderr read failed for task {}: {}", task_id, e);
                    err_open = false;
                }
                None => err_open = false,
            },
            signal = &mut terminate_rx, if signal_armed => {
                signal_armed = false;
                // 句柄被丢弃（Err）不代表取消
                if signal.is_ok() {
                    terminate_child(&mut child, &task_id);
                }
            }
        }
    }

    let (exit_code, message) = match child.wait().await {
        Ok(status) => (status.code(), None),
        Err(e) => (None, Some(format!("failed to wait for rclone: {}", e))),
    };
    tracing::debug!("rclone for task {} exited with {:?}", task_id, exit_code);
    let _ = tx.send(ProgressEvent::exited(task_id, exit_code, message));
}

/// SIGTERM first, hard kill as fallback / 终止子进程
fn terminate_child(child: &mut Child, task_id: &str) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc == 0 {
            tracing::info!("Sent SIGTERM to rclone pid {} (task {})", pid, task_id);
            return;
        }
    }

    match child.start_kill() {
        Ok(()) => tracing::info!("Killed rclone for task {}", task_id),
        Err(e) => tracing::warn!("Failed to kill rclone for task {}: {}", task_id, e),
    }
}
