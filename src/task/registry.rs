//! Task registry: which task currently owns a live rclone process or RC job
//! 任务注册表：记录每个任务当前持有的 rclone 进程或 RC 作业

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::rclone::process::ProcessHandle;
use crate::rclone::rc::RcApi;

/// Handle to a job running inside the rclone rc server / RC 作业句柄
pub struct RcJobHandle {
    pub job_id: i64,
    api: Arc<dyn RcApi>,
}

impl RcJobHandle {
    pub fn new(job_id: i64, api: Arc<dyn RcApi>) -> Self {
        Self { job_id, api }
    }
}

impl fmt::Debug for RcJobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RcJobHandle").field("job_id", &self.job_id).finish()
    }
}

/// Live process or RC job backing a running task / 运行中任务的句柄
#[derive(Debug)]
pub enum RunningHandle {
    Process(ProcessHandle),
    RcJob(RcJobHandle),
}

/// Serializable description of a handle / 句柄描述
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandleInfo {
    Process { pid: Option<u32> },
    RcJob { job_id: i64 },
}

impl RunningHandle {
    pub fn info(&self) -> HandleInfo {
        match self {
            RunningHandle::Process(handle) => HandleInfo::Process { pid: handle.pid() },
            RunningHandle::RcJob(handle) => HandleInfo::RcJob { job_id: handle.job_id },
        }
    }

    /// Send the termination signal, consuming the handle / 发送终止信号
    ///
    /// Returns whether the signal reached its target.
    pub async fn terminate(self) -> bool {
        match self {
            RunningHandle::Process(handle) => handle.terminate(),
            RunningHandle::RcJob(handle) => match handle.api.stop_job(handle.job_id).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!("Failed to stop rc job {}: {}", handle.job_id, e);
                    false
                }
            },
        }
    }
}

/// Duplicate registration; the rejected handle is returned to the caller
#[derive(Debug, Error)]
#[error("task {task_id} already has a running handle")]
pub struct AlreadyRunning {
    pub task_id: String,
    pub handle: RunningHandle,
}

/// 任务注册表（所有操作在同一把锁下串行化）
#[derive(Clone, Default)]
pub struct TaskRegistry {
    handles: Arc<Mutex<HashMap<String, RunningHandle>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle; fails if the task already owns one / 注册句柄
    pub fn register(&self, task_id: &str, handle: RunningHandle) -> Result<(), AlreadyRunning> {
        let mut handles = self.handles.lock();
        if handles.contains_key(task_id) {
            return Err(AlreadyRunning { task_id: task_id.to_string(), handle });
        }
        handles.insert(task_id.to_string(), handle);
        Ok(())
    }

    pub fn lookup(&self, task_id: &str) -> Option<HandleInfo> {
        self.handles.lock().get(task_id).map(RunningHandle::info)
    }

    /// Remove without signalling; returns whether a handle existed / 移除句柄
    pub fn unregister(&self, task_id: &str) -> bool {
        self.handles.lock().remove(task_id).is_some()
    }

    /// Take the handle out without signalling it / 取出句柄
    ///
    /// The handle leaves the map under the lock, so only one caller can ever
    /// own it.
    pub fn take(&self, task_id: &str) -> Option<RunningHandle> {
        self.handles.lock().remove(task_id)
    }

    /// Signal a handle that was taken out of the registry / 发送终止信号
    pub async fn signal(task_id: &str, handle: RunningHandle) {
        let info = handle.info();
        if !handle.terminate().await {
            tracing::warn!("Termination signal for task {} ({:?}) was not delivered", task_id, info);
        }
    }

    /// Take the handle out and signal it / 取出句柄并发送终止信号
    ///
    /// Returns whether a handle was registered.
    pub async fn cancel(&self, task_id: &str) -> bool {
        match self.take(task_id) {
            Some(handle) => {
                Self::signal(task_id, handle).await;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }
}
