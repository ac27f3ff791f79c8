use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, OwnedMutexGuard};

use super::lifecycle::Applied;
use super::models::{CancelOutcome, ProgressSnapshot, Task, TaskOptions};
use super::poller::{ProgressSink, RcPoller};
use super::registry::{HandleInfo, RcJobHandle, RunningHandle, TaskRegistry};
use super::store::TaskStore;
use super::types::{Executor, ProgressEvent, ProgressEventKind, TaskEvent, TaskKind, TaskStatus};
use crate::config::{RcloneConfig, TaskConfig};
use crate::error::{Result, TaskError};
use crate::rclone::command::task_args;
use crate::rclone::process::spawn_transfer;
use crate::rclone::rc::RcApi;

/// Message stored on tasks orphaned by a restart
pub const INTERRUPTED_MESSAGE: &str = "interrupted by server restart";

/// 任务管理器（进度事件 → 状态收敛，支持SSE广播）
#[derive(Clone)]
pub struct TaskManager {
    store: Arc<TaskStore>,
    registry: TaskRegistry,
    poller: Arc<RcPoller>,
    rc: Arc<dyn RcApi>,
    rclone: Arc<RcloneConfig>,
    persist_interval: chrono::Duration,
    event_sender: broadcast::Sender<TaskEvent>,
    /// RC tasks whose `job/start` call is in flight
    starting: Arc<Mutex<HashSet<String>>>,
}

/// 启动中标记，离开作用域时释放
struct StartReservation {
    starting: Arc<Mutex<HashSet<String>>>,
    task_id: String,
}

impl Drop for StartReservation {
    fn drop(&mut self) {
        self.starting.lock().remove(&self.task_id);
    }
}

/// List filter / 列表过滤条件
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub kind: Option<TaskKind>,
}

impl TaskManager {
    pub fn new(db: sqlx::SqlitePool, rc: Arc<dyn RcApi>, rclone: RcloneConfig, tasks: &TaskConfig) -> Self {
        let (event_sender, _) = broadcast::channel(256);
        let poller = RcPoller::new(
            rc.clone(),
            Duration::from_millis(tasks.poll_interval_ms.max(10)),
            tasks.max_poll_failures,
        );
        Self {
            store: Arc::new(TaskStore::new(db)),
            registry: TaskRegistry::new(),
            poller: Arc::new(poller),
            rc,
            rclone: Arc::new(rclone),
            persist_interval: chrono::Duration::seconds(tasks.persist_interval_secs as i64),
            event_sender,
            starting: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Start the RC poller loop / 启动后台轮询
    pub fn start_background(&self) {
        self.poller.start(Arc::new(self.clone()));
    }

    pub fn shutdown(&self) {
        self.poller.shutdown();
    }

    /// 订阅任务事件
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.event_sender.subscribe()
    }

    /// 广播事件
    pub fn broadcast(&self, event: TaskEvent) {
        let _ = self.event_sender.send(event);
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Write the draft through and swap it in / 提交任务变更
    ///
    /// Progress-only changes (`force = false`) reach SQLite at most once per
    /// persist interval. On a failed write the live record is left untouched.
    async fn commit(&self, guard: &mut OwnedMutexGuard<Task>, mut draft: Task, force: bool) -> Result<()> {
        let now = Utc::now();
        let due = force
            || draft
                .last_saved
                .map_or(true, |saved| now.signed_duration_since(saved) >= self.persist_interval);
        if due {
            self.store.save(&draft).await?;
            draft.last_saved = Some(now);
        }
        **guard = draft;
        Ok(())
    }

    /// Load persisted tasks and fail the ones a previous run left open / 启动恢复
    pub async fn recover_on_startup(&self) -> Result<usize> {
        self.store.load().await?;

        let mut recovered = 0;
        for task in self.store.list().await {
            if task.status.is_terminal() {
                continue;
            }
            let mut guard = self.store.lock(&task.id).await?;
            let mut draft = guard.clone();
            draft.speed = 0;
            draft.fail(INTERRUPTED_MESSAGE, Utc::now())?;
            self.commit(&mut guard, draft, true).await?;
            tracing::info!("Task {} was {} before restart, marked failed", task.id, task.status);
            recovered += 1;
        }
        if recovered > 0 {
            tracing::info!("Recovered {} interrupted tasks", recovered);
        }
        Ok(recovered)
    }

    /// 创建任务（pending）
    pub async fn create_task(
        &self,
        kind: TaskKind,
        source: &str,
        destination: &str,
        options: TaskOptions,
        executor: Executor,
    ) -> Result<Task> {
        let source = source.trim();
        let destination = destination.trim();
        if source.is_empty() {
            return Err(TaskError::InvalidInput("source is required".to_string()));
        }
        if destination.is_empty() {
            return Err(TaskError::InvalidInput("destination is required".to_string()));
        }
        if source.starts_with('-') || destination.starts_with('-') {
            return Err(TaskError::InvalidInput("source and destination must not start with '-'".to_string()));
        }
        if options.checkers == Some(0) || options.transfers == Some(0) {
            return Err(TaskError::InvalidInput("checkers and transfers must be positive".to_string()));
        }

        let task = Task::new(kind, source.to_string(), destination.to_string(), options, executor);
        let task = self.store.insert(task).await?;

        tracing::info!(
            "Task created: {} ({} {} -> {}, executor: {})",
            task.id, task.kind, task.source, task.destination, task.executor.as_str()
        );
        self.broadcast(TaskEvent::TaskCreated { task: task.clone() });
        Ok(task)
    }

    /// Launch the task's process or RC job / 启动任务
    pub async fn start_task(&self, task_id: &str) -> Result<Task> {
        let guard = self.store.lock(task_id).await?;
        if guard.status != TaskStatus::Pending {
            return Err(TaskError::Conflict { action: "start", status: guard.status });
        }
        if self.registry.lookup(task_id).is_some() {
            return Err(TaskError::AlreadyRunning(task_id.to_string()));
        }

        match guard.executor {
            Executor::Process => {
                let args = task_args(&guard, &self.rclone.stats_interval);
                match spawn_transfer(&self.rclone.binary, &args, task_id) {
                    Ok((handle, events)) => self.begin(guard, RunningHandle::Process(handle), Some(events)).await,
                    Err(e) => {
                        let message = format!("failed to launch {}: {}", self.rclone.binary, e);
                        self.fail_launch(guard, message).await
                    }
                }
            }
            Executor::Rc => {
                let _reservation = self.reserve_start(task_id)?;
                let kind = guard.kind;
                let source = guard.source.clone();
                let destination = guard.destination.clone();
                let options = guard.options.clone();
                // HTTP 请求期间不持有任务锁
                drop(guard);

                let started = self.rc.start_job(kind, &source, &destination, &options).await;

                let guard = match self.store.lock(task_id).await {
                    Ok(guard) => guard,
                    Err(e) => {
                        if let Ok(job_id) = started {
                            self.abandon_job(task_id, job_id).await;
                        }
                        return Err(e);
                    }
                };
                // 请求期间任务可能已被取消
                if guard.status != TaskStatus::Pending {
                    let status = guard.status;
                    drop(guard);
                    if let Ok(job_id) = started {
                        self.abandon_job(task_id, job_id).await;
                    }
                    return Err(TaskError::Conflict { action: "start", status });
                }

                match started {
                    Ok(job_id) => {
                        let handle = RunningHandle::RcJob(RcJobHandle::new(job_id, self.rc.clone()));
                        self.begin(guard, handle, None).await
                    }
                    Err(e) => self.fail_launch(guard, format!("failed to start rc job: {}", e)).await,
                }
            }
        }
    }

    fn reserve_start(&self, task_id: &str) -> Result<StartReservation> {
        if !self.starting.lock().insert(task_id.to_string()) {
            return Err(TaskError::AlreadyRunning(task_id.to_string()));
        }
        Ok(StartReservation { starting: self.starting.clone(), task_id: task_id.to_string() })
    }

    /// Stop an RC job that no task will own / 停止无人认领的 RC 作业
    async fn abandon_job(&self, task_id: &str, job_id: i64) {
        tracing::warn!("Task {} left pending state during start, stopping rc job {}", task_id, job_id);
        let handle = RunningHandle::RcJob(RcJobHandle::new(job_id, self.rc.clone()));
        TaskRegistry::signal(task_id, handle).await;
    }

    async fn fail_launch(&self, mut guard: OwnedMutexGuard<Task>, message: String) -> Result<Task> {
        tracing::error!("Task {} failed to start: {}", guard.id, message);
        let mut draft = guard.clone();
        draft.fail(message.clone(), Utc::now())?;
        self.commit(&mut guard, draft, true).await?;
        self.broadcast(TaskEvent::for_task(&guard));
        Err(TaskError::ProcessLaunch(message))
    }

    /// Register the handle, mark running, then start consuming events / 登记句柄并转为运行
    ///
    /// The caller holds the task lock, so no event or cancel can observe the
    /// task between registration and the status write.
    async fn begin(
        &self,
        mut guard: OwnedMutexGuard<Task>,
        handle: RunningHandle,
        events: Option<mpsc::UnboundedReceiver<ProgressEvent>>,
    ) -> Result<Task> {
        let task_id = guard.id.clone();
        let info = handle.info();

        if let Err(rejected) = self.registry.register(&task_id, handle) {
            tracing::warn!("{}; terminating the duplicate", rejected);
            drop(guard);
            TaskRegistry::signal(&task_id, rejected.handle).await;
            return Err(TaskError::AlreadyRunning(task_id));
        }

        let mut draft = guard.clone();
        if let HandleInfo::RcJob { job_id } = info {
            draft.rc_job_id = Some(job_id);
        }
        let marked = draft.mark_running(Utc::now());
        let committed = match marked {
            Ok(()) => self.commit(&mut guard, draft, true).await,
            Err(e) => Err(e),
        };
        if let Err(e) = committed {
            drop(guard);
            self.registry.cancel(&task_id).await;
            return Err(e);
        }

        if let HandleInfo::RcJob { job_id } = info {
            self.poller.track(job_id, &task_id);
        }
        let task = guard.clone();
        drop(guard);

        if let Some(events) = events {
            tokio::spawn(self.clone().run_worker(task_id.clone(), events));
        }

        tracing::info!("Task {} running ({:?})", task_id, info);
        self.broadcast(TaskEvent::TaskUpdated { task: task.clone() });
        Ok(task)
    }

    /// Per-task worker: applies one process's events in arrival order / 单任务事件消费
    async fn run_worker(self, task_id: String, mut events: mpsc::UnboundedReceiver<ProgressEvent>) {
        while let Some(event) = events.recv().await {
            let terminal = event.is_terminal();
            self.apply_event(event).await;
            if terminal {
                break;
            }
        }
        self.registry.unregister(&task_id);
        tracing::debug!("Worker for task {} finished", task_id);
    }

    /// Reconcile one event into the store / 处理一条进度事件
    async fn apply_event(&self, event: ProgressEvent) {
        let mut guard = match self.store.lock(&event.task_id).await {
            Ok(guard) => guard,
            Err(_) => {
                tracing::debug!("Dropping event for unknown task {}", event.task_id);
                return;
            }
        };

        let mut draft = guard.clone();
        let applied = draft.apply_event(&event.kind, Utc::now());
        if applied == Applied::Ignored {
            return;
        }
        let finished = applied == Applied::Finished;

        if let Err(e) = self.commit(&mut guard, draft.clone(), finished).await {
            // 内存状态仍然前进，避免任务停留在运行中
            tracing::error!("Failed to persist task {}: {}", event.task_id, e);
            *guard = draft;
        }

        // 致命错误时进程可能仍在运行，释放任务锁后再终止
        let fatal = finished && matches!(event.kind, ProgressEventKind::Error { .. });
        if finished {
            if !fatal {
                self.registry.unregister(&event.task_id);
            }
            match guard.status {
                TaskStatus::Completed => tracing::info!(
                    "Task {} completed ({} bytes)", guard.id, guard.progress_bytes
                ),
                status => tracing::info!(
                    "Task {} {}: {}", guard.id, status, guard.error_message.as_deref().unwrap_or("")
                ),
            }
        }

        let task = guard.clone();
        drop(guard);
        if fatal {
            self.registry.cancel(&event.task_id).await;
        }
        self.broadcast(TaskEvent::for_task(&task));
    }

    /// 获取任务
    pub async fn get_task(&self, task_id: &str) -> Result<Task> {
        self.store
            .get(task_id)
            .await
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))
    }

    /// All tasks, newest first / 获取任务列表
    pub async fn list_tasks(&self, filter: TaskFilter) -> Vec<Task> {
        self.store
            .list()
            .await
            .into_iter()
            .filter(|t| filter.status.map_or(true, |s| t.status == s))
            .filter(|t| filter.kind.map_or(true, |k| t.kind == k))
            .collect()
    }

    /// 获取进度快照
    pub async fn get_task_progress(&self, task_id: &str) -> Result<ProgressSnapshot> {
        let task = self.get_task(task_id).await?;
        Ok(ProgressSnapshot::from(&task))
    }

    /// Cancel a non-terminal task / 取消任务
    ///
    /// The handle leaves the registry under the task lock; the termination
    /// signal is sent after the lock is released. A later exit event cannot
    /// overwrite `cancelled`.
    pub async fn cancel_task(&self, task_id: &str) -> Result<CancelOutcome> {
        let mut guard = self.store.lock(task_id).await?;
        guard.ensure_cancellable()?;

        if let Some(job_id) = guard.rc_job_id {
            self.poller.untrack(job_id);
        }
        let handle = self.registry.take(task_id);
        let handle_was_running = handle.is_some();

        let mut draft = guard.clone();
        if let Err(e) = draft.cancel(handle_was_running, Utc::now()) {
            if let Some(handle) = handle {
                let _ = self.registry.register(task_id, handle);
            }
            return Err(e);
        }
        if let Err(e) = self.commit(&mut guard, draft.clone(), true).await {
            tracing::error!("Failed to persist cancellation of task {}: {}", task_id, e);
            *guard = draft;
        }
        let task = guard.clone();
        drop(guard);

        if let Some(handle) = handle {
            TaskRegistry::signal(task_id, handle).await;
        }
        tracing::info!("Task {} cancelled (handle was running: {})", task_id, handle_was_running);
        self.broadcast(TaskEvent::for_task(&task));
        Ok(CancelOutcome { accepted: true, handle_was_running })
    }

    /// running → paused (status only) / 暂停任务
    pub async fn pause_task(&self, task_id: &str) -> Result<Task> {
        let mut guard = self.store.lock(task_id).await?;
        let mut draft = guard.clone();
        draft.pause(Utc::now())?;
        self.commit(&mut guard, draft, true).await?;

        tracing::info!("Task {} paused", task_id);
        self.broadcast(TaskEvent::for_task(&guard));
        Ok(guard.clone())
    }

    /// paused → running / 恢复任务
    pub async fn resume_task(&self, task_id: &str) -> Result<Task> {
        let mut guard = self.store.lock(task_id).await?;
        let mut draft = guard.clone();
        draft.resume(Utc::now())?;
        self.commit(&mut guard, draft, true).await?;

        tracing::info!("Task {} resumed", task_id);
        self.broadcast(TaskEvent::for_task(&guard));
        Ok(guard.clone())
    }

    /// Re-run a failed or cancelled task as a new task / 重试任务
    pub async fn retry_task(&self, task_id: &str) -> Result<Task> {
        let old = self.get_task(task_id).await?;
        if !matches!(old.status, TaskStatus::Failed | TaskStatus::Cancelled) {
            return Err(TaskError::Conflict { action: "retry", status: old.status });
        }

        let task = self
            .create_task(old.kind, &old.source, &old.destination, old.options.clone(), old.executor)
            .await?;
        tracing::info!("Task {} retried as {}", task_id, task.id);
        self.start_task(&task.id).await
    }

    /// Delete a terminal task / 删除任务
    pub async fn remove_task(&self, task_id: &str) -> Result<()> {
        let rc_job_id = {
            let guard = self.store.lock(task_id).await?;
            if !guard.status.is_terminal() {
                return Err(TaskError::Conflict { action: "remove", status: guard.status });
            }
            guard.rc_job_id
        };
        self.store.remove(task_id).await?;
        if let Some(job_id) = rc_job_id {
            self.poller.forget(job_id);
        }
        tracing::info!("Task {} removed", task_id);
        self.broadcast(TaskEvent::TaskRemoved { task_id: task_id.to_string() });
        Ok(())
    }

    /// 删除所有已结束的任务
    pub async fn clear_finished(&self) -> Result<usize> {
        let mut removed = 0;
        for task in self.store.list().await {
            if task.status.is_terminal() && self.store.remove(&task.id).await? {
                if let Some(job_id) = task.rc_job_id {
                    self.poller.forget(job_id);
                }
                self.broadcast(TaskEvent::TaskRemoved { task_id: task.id });
                removed += 1;
            }
        }
        tracing::info!("Cleared {} finished tasks", removed);
        Ok(removed)
    }
}

#[async_trait]
impl ProgressSink for TaskManager {
    async fn deliver(&self, event: ProgressEvent) {
        self.apply_event(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::rclone::process::ProcessHandle;
    use crate::rclone::rc::fake::FakeRc;
    use crate::task::ProgressUpdate;
    use tokio::sync::oneshot;

    struct Harness {
        manager: TaskManager,
        rc: Arc<FakeRc>,
    }

    async fn harness() -> Harness {
        harness_with(test_pool().await).await
    }

    async fn harness_with(pool: sqlx::SqlitePool) -> Harness {
        let rc = Arc::new(FakeRc::default());
        let rclone = RcloneConfig { binary: "/nonexistent/rclone".into(), ..RcloneConfig::default() };
        let manager = TaskManager::new(pool, rc.clone(), rclone, &TaskConfig::default());
        Harness { manager, rc }
    }

    /// Create a task and attach a fake process whose events the test controls
    async fn running_task(
        manager: &TaskManager,
    ) -> (Task, mpsc::UnboundedSender<ProgressEvent>, oneshot::Receiver<()>) {
        let task = manager
            .create_task(TaskKind::Copy, "/a", "remote:/b", TaskOptions::default(), Executor::Process)
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Pending);

        let (terminate_tx, terminate_rx) = oneshot::channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let guard = manager.store.lock(&task.id).await.unwrap();
        let handle = RunningHandle::Process(ProcessHandle::new(Some(4242), terminate_tx));
        let task = manager.begin(guard, handle, Some(event_rx)).await.unwrap();
        (task, event_tx, terminate_rx)
    }

    fn progress(task_id: &str, transferred: u64, total: u64) -> ProgressEvent {
        ProgressEvent::progress(
            task_id,
            ProgressUpdate {
                transferred_bytes: transferred,
                total_bytes: total,
                speed_bytes_per_sec: Some(1000),
                eta_seconds: Some(5),
                current_file: Some("a.bin".into()),
                raw_line: None,
            },
        )
    }

    async fn wait_for(manager: &TaskManager, task_id: &str, check: impl Fn(&Task) -> bool) -> Task {
        for _ in 0..200 {
            let task = manager.get_task(task_id).await.unwrap();
            if check(&task) {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached for task {}", task_id);
    }

    #[tokio::test]
    async fn test_copy_task_lifecycle() {
        let h = harness().await;
        let (task, events, _terminate) = running_task(&h.manager).await;
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.started_at.is_some());
        assert!(h.manager.registry().lookup(&task.id).is_some());

        events.send(progress(&task.id, 60, 100)).unwrap();
        // 乱序的旧事件不能让进度倒退
        events.send(progress(&task.id, 40, 100)).unwrap();
        let t = wait_for(&h.manager, &task.id, |t| t.eta_seconds == Some(5)).await;
        events.send(ProgressEvent::error(&task.id, "NOTICE: slow remote", false)).unwrap();
        wait_for(&h.manager, &task.id, |t| t.last_output.is_some()).await;
        assert_eq!(t.progress_bytes, 60);
        assert_eq!(h.manager.get_task_progress(&task.id).await.unwrap().progress_bytes, 60);

        events.send(ProgressEvent::exited(&task.id, Some(0), None)).unwrap();
        let done = wait_for(&h.manager, &task.id, |t| t.status.is_terminal()).await;
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.progress_bytes, done.total_bytes);
        assert_eq!(done.progress_bytes, 100);
        assert_eq!(done.speed, 0);
        assert_eq!(done.current_file, None);
        assert!(done.finished_at.is_some());

        for _ in 0..100 {
            if h.manager.registry().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(h.manager.registry().is_empty());

        // 终态已写入数据库
        let reloaded = TaskStore::new(h.manager.store.pool().clone());
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.get(&task.id).await.unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_failed_exit_keeps_last_output() {
        let h = harness().await;
        let (task, events, _terminate) = running_task(&h.manager).await;

        events.send(ProgressEvent::error(&task.id, "ERROR : a: permission denied", false)).unwrap();
        events.send(ProgressEvent::exited(&task.id, Some(3), None)).unwrap();
        let done = wait_for(&h.manager, &task.id, |t| t.status.is_terminal()).await;
        assert_eq!(done.status, TaskStatus::Failed);
        assert_eq!(
            done.error_message.as_deref(),
            Some("rclone exited with code 3: ERROR : a: permission denied")
        );
    }

    #[tokio::test]
    async fn test_fatal_error_signals_process() {
        let h = harness().await;
        let (task, events, mut terminate) = running_task(&h.manager).await;

        events.send(ProgressEvent::error(&task.id, "CRITICAL: config not found", true)).unwrap();
        let done = wait_for(&h.manager, &task.id, |t| t.status.is_terminal()).await;
        assert_eq!(done.status, TaskStatus::Failed);
        assert_eq!(done.error_message.as_deref(), Some("CRITICAL: config not found"));

        for _ in 0..100 {
            if terminate.try_recv().is_ok() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("process was not signalled");
    }

    #[tokio::test]
    async fn test_cancel_then_late_exit() {
        let h = harness().await;
        let (task, events, mut terminate) = running_task(&h.manager).await;

        let outcome = h.manager.cancel_task(&task.id).await.unwrap();
        assert_eq!(outcome, CancelOutcome { accepted: true, handle_was_running: true });
        assert_eq!(terminate.try_recv(), Ok(()));

        let cancelled = h.manager.get_task(&task.id).await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert_eq!(
            cancelled.error_message.as_deref(),
            Some("cancelled by user; rclone process signalled")
        );

        // 进程随后以非零码退出，状态保持取消
        events.send(ProgressEvent::exited(&task.id, Some(1), None)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let after = h.manager.get_task(&task.id).await.unwrap();
        assert_eq!(after.status, TaskStatus::Cancelled);
        assert_eq!(after.error_message, cancelled.error_message);

        // 第二次取消被拒绝
        let err = h.manager.cancel_task(&task.id).await.unwrap_err();
        assert!(matches!(err, TaskError::Conflict { action: "cancel", status: TaskStatus::Cancelled }));
    }

    #[tokio::test]
    async fn test_cancel_pending_task() {
        let h = harness().await;
        let task = h
            .manager
            .create_task(TaskKind::Sync, "/a", "remote:/b", TaskOptions::default(), Executor::Process)
            .await
            .unwrap();
        let outcome = h.manager.cancel_task(&task.id).await.unwrap();
        assert!(outcome.accepted);
        assert!(!outcome.handle_was_running);
        assert_eq!(
            h.manager.get_task(&task.id).await.unwrap().error_message.as_deref(),
            Some("cancelled by user; no running process found")
        );
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let h = harness().await;
        let (task, events, _terminate) = running_task(&h.manager).await;
        events.send(progress(&task.id, 10, 100)).unwrap();
        wait_for(&h.manager, &task.id, |t| t.progress_bytes == 10).await;

        let paused = h.manager.pause_task(&task.id).await.unwrap();
        assert_eq!(paused.status, TaskStatus::Paused);
        assert_eq!(paused.speed, 0);
        assert!(matches!(
            h.manager.pause_task(&task.id).await,
            Err(TaskError::Conflict { action: "pause", .. })
        ));

        let resumed = h.manager.resume_task(&task.id).await.unwrap();
        assert_eq!(resumed.status, TaskStatus::Running);
        assert!(matches!(
            h.manager.resume_task(&task.id).await,
            Err(TaskError::Conflict { action: "resume", .. })
        ));

        events.send(ProgressEvent::exited(&task.id, Some(0), None)).unwrap();
        wait_for(&h.manager, &task.id, |t| t.status == TaskStatus::Completed).await;
        assert!(matches!(
            h.manager.pause_task(&task.id).await,
            Err(TaskError::Conflict { action: "pause", status: TaskStatus::Completed })
        ));
    }

    #[tokio::test]
    async fn test_launch_failure_marks_failed() {
        let h = harness().await;
        let task = h
            .manager
            .create_task(TaskKind::Copy, "/a", "remote:/b", TaskOptions::default(), Executor::Process)
            .await
            .unwrap();

        let err = h.manager.start_task(&task.id).await.unwrap_err();
        assert!(matches!(err, TaskError::ProcessLaunch(_)));

        let failed = h.manager.get_task(&task.id).await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert!(failed.error_message.unwrap().starts_with("failed to launch /nonexistent/rclone"));
        assert!(h.manager.registry().is_empty());

        // 只能启动 pending 任务
        assert!(matches!(
            h.manager.start_task(&task.id).await,
            Err(TaskError::Conflict { action: "start", .. })
        ));
    }

    #[tokio::test]
    async fn test_rc_task_reconciled_once() {
        let h = harness().await;
        let task = h
            .manager
            .create_task(TaskKind::Copy, "/a", "remote:/b", TaskOptions::default(), Executor::Rc)
            .await
            .unwrap();
        let running = h.manager.start_task(&task.id).await.unwrap();
        assert_eq!(running.status, TaskStatus::Running);
        let job_id = running.rc_job_id.unwrap();

        h.rc.set_stats(job_id, 30, 90);
        h.manager.poller.poll_once(&h.manager).await;
        assert_eq!(h.manager.get_task(&task.id).await.unwrap().progress_bytes, 30);

        h.rc.finish(job_id, true, "");
        h.rc.set_stats(job_id, 90, 90);
        h.manager.poller.poll_once(&h.manager).await;
        let done = h.manager.get_task(&task.id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        let finished_at = done.finished_at;

        h.manager.poller.poll_once(&h.manager).await;
        let again = h.manager.get_task(&task.id).await.unwrap();
        assert_eq!(again.status, TaskStatus::Completed);
        assert_eq!(again.finished_at, finished_at);
        assert!(h.manager.registry().is_empty());

        // 删除任务后不再保留作业记录
        assert_eq!(h.manager.poller.reconciled_count(), 1);
        h.manager.remove_task(&task.id).await.unwrap();
        assert_eq!(h.manager.poller.reconciled_count(), 0);
    }

    #[tokio::test]
    async fn test_rc_cancel_stops_job() {
        let h = harness().await;
        let task = h
            .manager
            .create_task(TaskKind::Move, "/a", "remote:/b", TaskOptions::default(), Executor::Rc)
            .await
            .unwrap();
        let running = h.manager.start_task(&task.id).await.unwrap();
        let job_id = running.rc_job_id.unwrap();

        let outcome = h.manager.cancel_task(&task.id).await.unwrap();
        assert!(outcome.handle_was_running);
        assert_eq!(*h.rc.stopped.lock(), vec![job_id]);
        assert_eq!(h.manager.poller.tracked_count(), 0);
    }

    #[tokio::test]
    async fn test_rc_start_failure() {
        let h = harness().await;
        *h.rc.refuse_start.lock() = true;
        let task = h
            .manager
            .create_task(TaskKind::Copy, "/a", "nope:/b", TaskOptions::default(), Executor::Rc)
            .await
            .unwrap();
        assert!(matches!(h.manager.start_task(&task.id).await, Err(TaskError::ProcessLaunch(_))));
        let failed = h.manager.get_task(&task.id).await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert!(failed.error_message.unwrap().contains("didn't find section"));
    }

    #[tokio::test]
    async fn test_create_validation() {
        let h = harness().await;
        let err = h
            .manager
            .create_task(TaskKind::Copy, "  ", "remote:/b", TaskOptions::default(), Executor::Process)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::InvalidInput(_)));

        let options = TaskOptions { transfers: Some(0), ..Default::default() };
        assert!(h
            .manager
            .create_task(TaskKind::Copy, "/a", "remote:/b", options, Executor::Process)
            .await
            .is_err());
        assert!(matches!(h.manager.get_task("missing").await, Err(TaskError::NotFound(_))));

        // 以 - 开头的路径会被 rclone 当作参数
        let err = h
            .manager
            .create_task(TaskKind::Copy, "--password-command=id", "r:/b", TaskOptions::default(), Executor::Process)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::InvalidInput(_)));
        assert!(h
            .manager
            .create_task(TaskKind::Copy, "/a", "-r:/b", TaskOptions::default(), Executor::Rc)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_slow_rc_start_does_not_block_readers() {
        let h = harness().await;
        *h.rc.start_delay.lock() = Some(Duration::from_millis(500));
        let task = h
            .manager
            .create_task(TaskKind::Copy, "/a", "remote:/b", TaskOptions::default(), Executor::Rc)
            .await
            .unwrap();

        let manager = h.manager.clone();
        let id = task.id.clone();
        let starting = tokio::spawn(async move { manager.start_task(&id).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let quick = Duration::from_millis(200);
        let listed = tokio::time::timeout(quick, h.manager.list_tasks(TaskFilter::default()))
            .await
            .expect("list blocked by rc start");
        assert_eq!(listed[0].status, TaskStatus::Pending);
        tokio::time::timeout(quick, h.manager.get_task_progress(&task.id))
            .await
            .expect("progress blocked by rc start")
            .unwrap();

        // 启动中的任务不能重复启动
        assert!(matches!(
            h.manager.start_task(&task.id).await,
            Err(TaskError::AlreadyRunning(_))
        ));

        let running = starting.await.unwrap().unwrap();
        assert_eq!(running.status, TaskStatus::Running);
        assert!(running.rc_job_id.is_some());
    }

    #[tokio::test]
    async fn test_cancel_during_rc_start_stops_job() {
        let h = harness().await;
        *h.rc.start_delay.lock() = Some(Duration::from_millis(200));
        let task = h
            .manager
            .create_task(TaskKind::Copy, "/a", "remote:/b", TaskOptions::default(), Executor::Rc)
            .await
            .unwrap();

        let manager = h.manager.clone();
        let id = task.id.clone();
        let starting = tokio::spawn(async move { manager.start_task(&id).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let outcome = h.manager.cancel_task(&task.id).await.unwrap();
        assert!(!outcome.handle_was_running);

        let err = starting.await.unwrap().unwrap_err();
        assert!(matches!(err, TaskError::Conflict { action: "start", status: TaskStatus::Cancelled }));
        assert_eq!(h.rc.stopped.lock().len(), 1);
        assert_eq!(h.manager.get_task(&task.id).await.unwrap().status, TaskStatus::Cancelled);
        assert!(h.manager.registry().is_empty());
    }

    #[tokio::test]
    async fn test_slow_rc_stop_does_not_block_readers() {
        let h = harness().await;
        let task = h
            .manager
            .create_task(TaskKind::Copy, "/a", "remote:/b", TaskOptions::default(), Executor::Rc)
            .await
            .unwrap();
        let job_id = h.manager.start_task(&task.id).await.unwrap().rc_job_id.unwrap();
        *h.rc.stop_delay.lock() = Some(Duration::from_millis(500));

        let manager = h.manager.clone();
        let id = task.id.clone();
        let cancelling = tokio::spawn(async move { manager.cancel_task(&id).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let quick = Duration::from_millis(200);
        let listed = tokio::time::timeout(quick, h.manager.list_tasks(TaskFilter::default()))
            .await
            .expect("list blocked by rc stop");
        assert_eq!(listed[0].status, TaskStatus::Cancelled);

        let outcome = cancelling.await.unwrap().unwrap();
        assert!(outcome.handle_was_running);
        assert_eq!(*h.rc.stopped.lock(), vec![job_id]);
    }

    #[tokio::test]
    async fn test_transitions_survive_database_failure() {
        let h = harness().await;
        let (first, first_events, _first_terminate) = running_task(&h.manager).await;
        let (second, _second_events, mut second_terminate) = running_task(&h.manager).await;
        h.manager.store.pool().close().await;

        // 写库失败时内存状态仍然前进
        first_events.send(ProgressEvent::exited(&first.id, Some(0), None)).unwrap();
        let done = wait_for(&h.manager, &first.id, |t| t.status.is_terminal()).await;
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(done.finished_at.is_some());

        let outcome = h.manager.cancel_task(&second.id).await.unwrap();
        assert!(outcome.handle_was_running);
        assert_eq!(second_terminate.try_recv(), Ok(()));
        let cancelled = h.manager.get_task(&second.id).await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert!(cancelled.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let h = harness().await;
        let (running, _events, _terminate) = running_task(&h.manager).await;
        assert!(matches!(
            h.manager.remove_task(&running.id).await,
            Err(TaskError::Conflict { action: "remove", .. })
        ));

        let a = h
            .manager
            .create_task(TaskKind::Copy, "/x", "r:/x", TaskOptions::default(), Executor::Process)
            .await
            .unwrap();
        let b = h
            .manager
            .create_task(TaskKind::Copy, "/y", "r:/y", TaskOptions::default(), Executor::Process)
            .await
            .unwrap();
        h.manager.cancel_task(&a.id).await.unwrap();
        h.manager.cancel_task(&b.id).await.unwrap();

        h.manager.remove_task(&a.id).await.unwrap();
        assert!(matches!(h.manager.get_task(&a.id).await, Err(TaskError::NotFound(_))));

        assert_eq!(h.manager.clear_finished().await.unwrap(), 1);
        let remaining = h.manager.list_tasks(TaskFilter::default()).await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, running.id);
    }

    #[tokio::test]
    async fn test_list_filter() {
        let h = harness().await;
        h.manager
            .create_task(TaskKind::Copy, "/a", "r:/a", TaskOptions::default(), Executor::Process)
            .await
            .unwrap();
        let sync = h
            .manager
            .create_task(TaskKind::Sync, "/b", "r:/b", TaskOptions::default(), Executor::Process)
            .await
            .unwrap();
        h.manager.cancel_task(&sync.id).await.unwrap();

        let filter = TaskFilter { kind: Some(TaskKind::Sync), ..Default::default() };
        assert_eq!(h.manager.list_tasks(filter).await.len(), 1);
        let filter = TaskFilter { status: Some(TaskStatus::Pending), ..Default::default() };
        let pending = h.manager.list_tasks(filter).await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, TaskKind::Copy);
    }

    #[tokio::test]
    async fn test_retry_creates_new_task() {
        let h = harness().await;
        let task = h
            .manager
            .create_task(TaskKind::Copy, "/a", "remote:/b", TaskOptions::default(), Executor::Rc)
            .await
            .unwrap();
        assert!(matches!(
            h.manager.retry_task(&task.id).await,
            Err(TaskError::Conflict { action: "retry", .. })
        ));
        h.manager.cancel_task(&task.id).await.unwrap();

        let retried = h.manager.retry_task(&task.id).await.unwrap();
        assert_ne!(retried.id, task.id);
        assert_eq!(retried.status, TaskStatus::Running);
        assert_eq!(retried.source, "/a");
        assert_eq!(h.manager.get_task(&task.id).await.unwrap().status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_recover_on_startup() {
        let pool = test_pool().await;
        let first = harness_with(pool.clone()).await;
        let (task, _events, _terminate) = running_task(&first.manager).await;
        let done = first
            .manager
            .create_task(TaskKind::Copy, "/c", "r:/c", TaskOptions::default(), Executor::Process)
            .await
            .unwrap();
        first.manager.cancel_task(&done.id).await.unwrap();

        let second = harness_with(pool).await;
        assert_eq!(second.manager.recover_on_startup().await.unwrap(), 1);
        let recovered = second.manager.get_task(&task.id).await.unwrap();
        assert_eq!(recovered.status, TaskStatus::Failed);
        assert_eq!(recovered.error_message.as_deref(), Some(INTERRUPTED_MESSAGE));
        assert_eq!(
            second.manager.get_task(&done.id).await.unwrap().status,
            TaskStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_events_are_broadcast() {
        let h = harness().await;
        let mut rx = h.manager.subscribe();
        let task = h
            .manager
            .create_task(TaskKind::Copy, "/a", "remote:/b", TaskOptions::default(), Executor::Process)
            .await
            .unwrap();
        h.manager.cancel_task(&task.id).await.unwrap();

        match rx.recv().await.unwrap() {
            TaskEvent::TaskCreated { task: t } => assert_eq!(t.id, task.id),
            other => panic!("unexpected event {:?}", other),
        }
        match rx.recv().await.unwrap() {
            TaskEvent::TaskCancelled { task: t } => assert_eq!(t.status, TaskStatus::Cancelled),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
