//! Task state machine / 任务状态机
//!
//! ```text
//! pending ──start──▶ running ──exit 0──▶ completed
//!    │                │  ▲  ╲──exit≠0 / fatal──▶ failed
//!    │           pause│  │resume
//!    │                ▼  │
//!    └──cancel──▶ cancelled ◀──cancel── paused
//! ```
//!
//! All functions here are pure: the caller holds the per-task lock, applies a
//! transition to a draft copy and commits it only if persisting succeeded.

use chrono::{DateTime, Utc};

use super::models::Task;
use super::types::{ProgressEventKind, ProgressUpdate, TaskStatus};
use crate::error::{Result, TaskError};

/// Result of feeding one event into a task / 事件处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// Nothing changed (terminal task, paused task, ...)
    Ignored,
    /// Progress fields changed, status unchanged
    Progressed,
    /// An error-stream line was recorded, status unchanged
    Recorded,
    /// The task reached a terminal status
    Finished,
}

impl Task {
    fn conflict(&self, action: &'static str) -> TaskError {
        TaskError::Conflict { action, status: self.status }
    }

    /// pending → running
    pub fn mark_running(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status != TaskStatus::Pending {
            return Err(self.conflict("start"));
        }
        self.status = TaskStatus::Running;
        self.started_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Apply one progress event / 应用一条进度事件
    pub fn apply_event(&mut self, kind: &ProgressEventKind, now: DateTime<Utc>) -> Applied {
        if self.status.is_terminal() {
            return Applied::Ignored;
        }
        match kind {
            ProgressEventKind::Progress(update) => {
                if self.status != TaskStatus::Running {
                    return Applied::Ignored;
                }
                self.apply_progress(update);
                self.updated_at = now;
                Applied::Progressed
            }
            ProgressEventKind::Error { raw_line, fatal } => {
                self.last_output = Some(raw_line.clone());
                self.updated_at = now;
                if *fatal {
                    self.finish_failed(raw_line.clone(), now);
                    Applied::Finished
                } else {
                    Applied::Recorded
                }
            }
            ProgressEventKind::Exited { exit_code: Some(0), .. } => {
                self.finish_completed(now);
                Applied::Finished
            }
            ProgressEventKind::Exited { exit_code, message } => {
                let message = match (exit_code, message) {
                    (_, Some(message)) if !message.trim().is_empty() => message.clone(),
                    (Some(code), _) => match &self.last_output {
                        Some(line) => format!("rclone exited with code {}: {}", code, line),
                        None => format!("rclone exited with code {}", code),
                    },
                    (None, _) => "rclone terminated by signal".to_string(),
                };
                self.finish_failed(message, now);
                Applied::Finished
            }
        }
    }

    fn apply_progress(&mut self, update: &ProgressUpdate) {
        // 进度只增不减：乱序或异常的旧事件保留原值
        if update.transferred_bytes >= self.progress_bytes {
            self.progress_bytes = update.transferred_bytes;
        }
        if update.total_bytes > 0 {
            self.total_bytes = update.total_bytes.max(self.progress_bytes);
        } else if self.total_bytes > 0 && self.progress_bytes > self.total_bytes {
            self.total_bytes = self.progress_bytes;
        }
        if let Some(speed) = update.speed_bytes_per_sec {
            self.speed = speed;
        }
        self.eta_seconds = update.eta_seconds;
        if let Some(file) = &update.current_file {
            self.current_file = Some(file.clone());
        }
    }

    fn finish_completed(&mut self, now: DateTime<Utc>) {
        if self.total_bytes == 0 {
            self.total_bytes = self.progress_bytes;
        }
        self.progress_bytes = self.total_bytes;
        self.status = TaskStatus::Completed;
        self.speed = 0;
        self.eta_seconds = None;
        self.current_file = None;
        self.error_message = None;
        self.finished_at = Some(now);
        self.updated_at = now;
    }

    fn finish_failed(&mut self, message: String, now: DateTime<Utc>) {
        self.status = TaskStatus::Failed;
        self.error_message = Some(message);
        self.speed = 0;
        self.eta_seconds = None;
        self.finished_at = Some(now);
        self.updated_at = now;
    }

    /// Fail a task that never got a live handle (launch error) / 启动失败
    pub fn fail(&mut self, message: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        if self.status.is_terminal() {
            return Err(self.conflict("fail"));
        }
        let message = message.into();
        let message = if message.trim().is_empty() { "unknown error".to_string() } else { message };
        self.finish_failed(message, now);
        Ok(())
    }

    /// running → paused
    pub fn pause(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status != TaskStatus::Running {
            return Err(self.conflict("pause"));
        }
        self.status = TaskStatus::Paused;
        self.speed = 0;
        self.eta_seconds = None;
        self.updated_at = now;
        Ok(())
    }

    /// paused → running
    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status != TaskStatus::Paused {
            return Err(self.conflict("resume"));
        }
        self.status = TaskStatus::Running;
        self.updated_at = now;
        Ok(())
    }

    pub fn ensure_cancellable(&self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(self.conflict("cancel"));
        }
        Ok(())
    }

    /// pending | running | paused → cancelled
    pub fn cancel(&mut self, handle_was_running: bool, now: DateTime<Utc>) -> Result<()> {
        self.ensure_cancellable()?;
        self.status = TaskStatus::Cancelled;
        self.speed = 0;
        self.eta_seconds = None;
        self.error_message = Some(if handle_was_running {
            "cancelled by user; rclone process signalled".to_string()
        } else {
            "cancelled by user; no running process found".to_string()
        });
        self.finished_at = Some(now);
        self.updated_at = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::models::TaskOptions;
    use crate::task::types::{Executor, TaskKind};

    fn running_task() -> Task {
        let mut task = Task::new(
            TaskKind::Copy,
            "/a".into(),
            "remote:/b".into(),
            TaskOptions::default(),
            Executor::Process,
        );
        task.mark_running(Utc::now()).unwrap();
        task
    }

    fn progress(transferred: u64, total: u64, speed: u64) -> ProgressEventKind {
        ProgressEventKind::Progress(ProgressUpdate {
            transferred_bytes: transferred,
            total_bytes: total,
            speed_bytes_per_sec: Some(speed),
            eta_seconds: Some(3),
            current_file: None,
            raw_line: None,
        })
    }

    fn exited(code: Option<i32>) -> ProgressEventKind {
        ProgressEventKind::Exited { exit_code: code, message: None }
    }

    #[test]
    fn test_start_only_from_pending() {
        let mut task = running_task();
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.started_at.is_some());
        assert!(matches!(
            task.mark_running(Utc::now()),
            Err(TaskError::Conflict { action: "start", status: TaskStatus::Running })
        ));
    }

    #[test]
    fn test_progress_is_monotonic() {
        let mut task = running_task();
        assert_eq!(task.apply_event(&progress(50, 100, 10), Utc::now()), Applied::Progressed);
        assert_eq!(task.progress_bytes, 50);

        // 迟到的旧事件不能让进度倒退
        task.apply_event(&progress(30, 100, 7), Utc::now());
        assert_eq!(task.progress_bytes, 50);
        assert_eq!(task.speed, 7);

        task.apply_event(&progress(80, 100, 9), Utc::now());
        assert_eq!(task.progress_bytes, 80);
        assert_eq!(task.total_bytes, 100);
    }

    #[test]
    fn test_total_never_below_progress() {
        let mut task = running_task();
        task.apply_event(&progress(80, 100, 1), Utc::now());
        task.apply_event(&progress(70, 60, 1), Utc::now());
        assert_eq!(task.progress_bytes, 80);
        assert_eq!(task.total_bytes, 80);

        // total 未知 (0) 时保留已知总大小
        task.apply_event(&progress(90, 0, 1), Utc::now());
        assert_eq!(task.total_bytes, 90);
    }

    #[test]
    fn test_unknown_speed_keeps_previous_value() {
        let mut task = running_task();
        task.apply_event(&progress(10, 100, 42), Utc::now());
        let update = ProgressUpdate { transferred_bytes: 20, total_bytes: 100, ..Default::default() };
        task.apply_event(&ProgressEventKind::Progress(update), Utc::now());
        assert_eq!(task.speed, 42);
        assert_eq!(task.progress_bytes, 20);
    }

    #[test]
    fn test_exit_zero_completes() {
        let mut task = running_task();
        task.current_file = Some("x.bin".into());
        task.apply_event(&progress(65, 100, 12), Utc::now());
        assert_eq!(task.apply_event(&exited(Some(0)), Utc::now()), Applied::Finished);
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress_bytes, 100);
        assert_eq!(task.total_bytes, 100);
        assert_eq!(task.speed, 0);
        assert_eq!(task.current_file, None);
        assert!(task.finished_at.is_some());
    }

    #[test]
    fn test_exit_zero_with_unknown_total() {
        let mut task = running_task();
        task.apply_event(&progress(10, 0, 1), Utc::now());
        task.apply_event(&exited(Some(0)), Utc::now());
        assert_eq!(task.progress_bytes, 10);
        assert_eq!(task.total_bytes, 10);
    }

    #[test]
    fn test_nonzero_exit_fails_with_message() {
        let mut task = running_task();
        task.apply_event(
            &ProgressEventKind::Error { raw_line: "ERROR : x: permission denied".into(), fatal: false },
            Utc::now(),
        );
        assert_eq!(task.status, TaskStatus::Running);
        task.apply_event(&exited(Some(3)), Utc::now());
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(
            task.error_message.as_deref(),
            Some("rclone exited with code 3: ERROR : x: permission denied")
        );
        assert_eq!(task.speed, 0);

        let mut task = running_task();
        task.apply_event(&exited(None), Utc::now());
        assert_eq!(task.error_message.as_deref(), Some("rclone terminated by signal"));

        let mut task = running_task();
        task.apply_event(
            &ProgressEventKind::Exited { exit_code: Some(1), message: Some("directory not found".into()) },
            Utc::now(),
        );
        assert_eq!(task.error_message.as_deref(), Some("directory not found"));
    }

    #[test]
    fn test_fatal_error_line_fails() {
        let mut task = running_task();
        let applied = task.apply_event(
            &ProgressEventKind::Error { raw_line: "Fatal error: unknown remote".into(), fatal: true },
            Utc::now(),
        );
        assert_eq!(applied, Applied::Finished);
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error_message.as_deref(), Some("Fatal error: unknown remote"));
    }

    #[test]
    fn test_terminal_tasks_are_frozen() {
        let mut task = running_task();
        task.cancel(true, Utc::now()).unwrap();
        let before = task.clone();

        assert_eq!(task.apply_event(&exited(Some(1)), Utc::now()), Applied::Ignored);
        assert_eq!(task.apply_event(&progress(99, 100, 5), Utc::now()), Applied::Ignored);
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(task.error_message, before.error_message);
        assert_eq!(task.progress_bytes, before.progress_bytes);
    }

    #[test]
    fn test_cancel_twice_conflicts() {
        let mut task = running_task();
        task.cancel(true, Utc::now()).unwrap();
        assert_eq!(task.error_message.as_deref(), Some("cancelled by user; rclone process signalled"));
        assert!(matches!(
            task.cancel(false, Utc::now()),
            Err(TaskError::Conflict { action: "cancel", status: TaskStatus::Cancelled })
        ));
        assert_eq!(task.status, TaskStatus::Cancelled);
    }

    #[test]
    fn test_pause_resume() {
        let mut task = running_task();
        task.apply_event(&progress(10, 100, 5), Utc::now());
        task.pause(Utc::now()).unwrap();
        assert_eq!(task.status, TaskStatus::Paused);
        assert_eq!(task.speed, 0);

        // 暂停期间的进度事件被忽略，速度保持为 0
        assert_eq!(task.apply_event(&progress(20, 100, 5), Utc::now()), Applied::Ignored);
        assert_eq!(task.speed, 0);
        assert!(task.pause(Utc::now()).is_err());

        task.resume(Utc::now()).unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.resume(Utc::now()).is_err());

        task.cancel(false, Utc::now()).unwrap();
        assert!(matches!(task.pause(Utc::now()), Err(TaskError::Conflict { .. })));
        assert!(matches!(task.resume(Utc::now()), Err(TaskError::Conflict { .. })));
    }

    #[test]
    fn test_paused_task_can_still_finish() {
        let mut task = running_task();
        task.pause(Utc::now()).unwrap();
        task.apply_event(&exited(Some(0)), Utc::now());
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[test]
    fn test_launch_failure() {
        let mut task = Task::new(
            TaskKind::Sync,
            "/a".into(),
            "/b".into(),
            TaskOptions::default(),
            Executor::Process,
        );
        task.fail("No such file or directory (os error 2)", Utc::now()).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.fail("again", Utc::now()).is_err());
    }
}
