//! RC job poller / RC 作业轮询器
//!
//! Jobs delegated to `rclone rcd` produce no output stream, so their progress is
//! pulled on a fixed tick and handed to a [`ProgressSink`] as ordinary events.

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{interval, MissedTickBehavior};

use super::types::ProgressEvent;
use crate::rclone::rc::{JobStatus, RcApi, RcError, TransferStats};

/// Consumer of progress events / 进度事件接收方
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn deliver(&self, event: ProgressEvent);
}

#[derive(Debug)]
struct Tracked {
    task_id: String,
    failures: u32,
}

/// RC 作业轮询器
pub struct RcPoller {
    api: Arc<dyn RcApi>,
    tracked: Mutex<HashMap<i64, Tracked>>,
    /// Jobs whose terminal event was already delivered
    reconciled: Mutex<HashSet<i64>>,
    interval: Duration,
    max_failures: u32,
    shutdown: Arc<Notify>,
}

impl RcPoller {
    pub fn new(api: Arc<dyn RcApi>, interval: Duration, max_failures: u32) -> Self {
        Self {
            api,
            tracked: Mutex::new(HashMap::new()),
            reconciled: Mutex::new(HashSet::new()),
            interval,
            max_failures: max_failures.max(1),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Start polling a job on behalf of a task / 开始跟踪作业
    ///
    /// Returns `false` if the job was already reconciled or is already tracked.
    pub fn track(&self, job_id: i64, task_id: &str) -> bool {
        if self.reconciled.lock().contains(&job_id) {
            return false;
        }
        let mut tracked = self.tracked.lock();
        if tracked.contains_key(&job_id) {
            return false;
        }
        tracked.insert(job_id, Tracked { task_id: task_id.to_string(), failures: 0 });
        tracing::debug!("Tracking rc job {} for task {}", job_id, task_id);
        true
    }

    /// Stop polling without delivering anything / 停止跟踪作业
    pub fn untrack(&self, job_id: i64) -> bool {
        self.tracked.lock().remove(&job_id).is_some()
    }

    /// Drop all memory of a job once its task is gone / 清除作业记录
    pub fn forget(&self, job_id: i64) {
        self.tracked.lock().remove(&job_id);
        self.reconciled.lock().remove(&job_id);
    }

    pub fn reconciled_count(&self) -> usize {
        self.reconciled.lock().len()
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.lock().len()
    }

    async fn poll_job(&self, job_id: i64) -> Result<(JobStatus, Option<TransferStats>), RcError> {
        let status = self.api.job_status(job_id).await?;
        let stats = match self.api.job_stats(job_id).await {
            Ok(stats) => Some(stats),
            Err(e) => {
                tracing::debug!("No stats for rc job {}: {}", job_id, e);
                None
            }
        };
        Ok((status, stats))
    }

    /// Mark a job reconciled; `false` if it already was / 标记为已收尾
    fn settle(&self, job_id: i64) -> bool {
        self.tracked.lock().remove(&job_id);
        self.reconciled.lock().insert(job_id)
    }

    /// One polling pass over every tracked job / 轮询一次
    ///
    /// Returns the number of events delivered.
    pub async fn poll_once(&self, sink: &dyn ProgressSink) -> usize {
        let jobs: Vec<(i64, String)> = self
            .tracked
            .lock()
            .iter()
            .map(|(job_id, t)| (*job_id, t.task_id.clone()))
            .collect();
        if jobs.is_empty() {
            return 0;
        }

        let results = join_all(jobs.iter().map(|(job_id, _)| self.poll_job(*job_id))).await;

        let mut delivered = 0;
        for ((job_id, task_id), result) in jobs.into_iter().zip(results) {
            match result {
                Ok((status, stats)) => {
                    if let Some(t) = self.tracked.lock().get_mut(&job_id) {
                        t.failures = 0;
                    }

                    if let Some(stats) = stats {
                        sink.deliver(ProgressEvent::progress(task_id.clone(), stats.to_update())).await;
                        delivered += 1;
                    }

                    if status.finished {
                        if !self.settle(job_id) {
                            continue;
                        }
                        let event = if status.success {
                            ProgressEvent::exited(task_id.clone(), Some(0), None)
                        } else {
                            let message = if status.error.trim().is_empty() {
                                format!("rc job {} failed", job_id)
                            } else {
                                status.error.clone()
                            };
                            ProgressEvent::exited(task_id.clone(), Some(1), Some(message))
                        };
                        tracing::info!(
                            "rc job {} for task {} finished (success: {}, {:.1}s)",
                            job_id, task_id, status.success, status.duration
                        );
                        sink.deliver(event).await;
                        delivered += 1;
                    }
                }
                Err(e) => {
                    let failures = match self.tracked.lock().get_mut(&job_id) {
                        Some(t) => {
                            t.failures += 1;
                            t.failures
                        }
                        None => continue,
                    };
                    tracing::warn!(
                        "Polling rc job {} failed ({}/{}): {}",
                        job_id, failures, self.max_failures, e
                    );
                    if failures >= self.max_failures && self.settle(job_id) {
                        let message = format!("lost contact with rclone rc server: {}", e);
                        sink.deliver(ProgressEvent::exited(task_id, None, Some(message))).await;
                        delivered += 1;
                    }
                }
            }
        }
        delivered
    }

    /// Spawn the polling loop / 启动轮询
    pub fn start(self: &Arc<Self>, sink: Arc<dyn ProgressSink>) {
        let poller = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(poller.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!("RC poller started ({:?} interval)", poller.interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        poller.poll_once(sink.as_ref()).await;
                    }
                    _ = poller.shutdown.notified() => {
                        break;
                    }
                }
            }
            tracing::info!("RC poller stopped");
        });
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rclone::rc::fake::FakeRc;
    use crate::task::ProgressEventKind;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<ProgressEvent>>,
    }

    #[async_trait]
    impl ProgressSink for RecordingSink {
        async fn deliver(&self, event: ProgressEvent) {
            self.events.lock().push(event);
        }
    }

    impl RecordingSink {
        fn exits(&self) -> Vec<ProgressEvent> {
            self.events.lock().iter().filter(|e| e.is_terminal()).cloned().collect()
        }
    }

    fn poller(api: Arc<FakeRc>, max_failures: u32) -> RcPoller {
        RcPoller::new(api, Duration::from_millis(10), max_failures)
    }

    #[tokio::test]
    async fn test_running_job_reports_progress() {
        let api = Arc::new(FakeRc::default());
        api.add_job(1);
        api.set_stats(1, 50, 100);
        let poller = poller(api.clone(), 3);
        let sink = RecordingSink::default();

        assert!(poller.track(1, "t1"));
        assert!(!poller.track(1, "t1"));
        assert_eq!(poller.poll_once(&sink).await, 1);

        let events = sink.events.lock().clone();
        assert_eq!(events.len(), 1);
        match &events[0].kind {
            ProgressEventKind::Progress(update) => {
                assert_eq!(update.transferred_bytes, 50);
                assert_eq!(update.total_bytes, 100);
                assert_eq!(update.speed_bytes_per_sec, Some(1024));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(poller.tracked_count(), 1);
    }

    #[tokio::test]
    async fn test_finished_job_reconciled_once() {
        let api = Arc::new(FakeRc::default());
        api.finish(7, true, "");
        let poller = poller(api.clone(), 3);
        let sink = RecordingSink::default();

        poller.track(7, "t1");
        poller.poll_once(&sink).await;
        poller.poll_once(&sink).await;

        let exits = sink.exits();
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].task_id, "t1");
        assert_eq!(exits[0].kind, ProgressEventKind::Exited { exit_code: Some(0), message: None });

        // 已收尾的作业不能再次跟踪
        assert!(!poller.track(7, "t1"));
        poller.poll_once(&sink).await;
        assert_eq!(sink.exits().len(), 1);
        assert_eq!(poller.tracked_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_job_carries_error() {
        let api = Arc::new(FakeRc::default());
        api.finish(3, false, "directory not found");
        let poller = poller(api, 3);
        let sink = RecordingSink::default();

        poller.track(3, "t1");
        poller.poll_once(&sink).await;

        assert_eq!(
            sink.exits()[0].kind,
            ProgressEventKind::Exited { exit_code: Some(1), message: Some("directory not found".into()) }
        );
    }

    #[tokio::test]
    async fn test_lost_contact_after_max_failures() {
        let api = Arc::new(FakeRc::default());
        api.add_job(5);
        *api.unreachable.lock() = true;
        let poller = poller(api.clone(), 3);
        let sink = RecordingSink::default();

        poller.track(5, "t1");
        poller.poll_once(&sink).await;
        poller.poll_once(&sink).await;
        assert!(sink.exits().is_empty());

        poller.poll_once(&sink).await;
        let exits = sink.exits();
        assert_eq!(exits.len(), 1);
        match &exits[0].kind {
            ProgressEventKind::Exited { exit_code: None, message: Some(message) } => {
                assert!(message.starts_with("lost contact with rclone rc server"));
            }
            other => panic!("unexpected event {:?}", other),
        }

        poller.poll_once(&sink).await;
        assert_eq!(sink.exits().len(), 1);
        assert_eq!(*api.status_calls.lock(), 3);
    }

    #[tokio::test]
    async fn test_transient_failure_resets() {
        let api = Arc::new(FakeRc::default());
        api.add_job(9);
        let poller = poller(api.clone(), 2);
        let sink = RecordingSink::default();
        poller.track(9, "t1");

        *api.unreachable.lock() = true;
        poller.poll_once(&sink).await;
        *api.unreachable.lock() = false;
        poller.poll_once(&sink).await;
        *api.unreachable.lock() = true;
        poller.poll_once(&sink).await;

        assert!(sink.exits().is_empty());
        assert_eq!(poller.tracked_count(), 1);
    }

    #[tokio::test]
    async fn test_untrack() {
        let api = Arc::new(FakeRc::default());
        api.finish(2, true, "");
        let poller = poller(api, 3);
        let sink = RecordingSink::default();

        poller.track(2, "t1");
        assert!(poller.untrack(2));
        assert!(!poller.untrack(2));
        assert_eq!(poller.poll_once(&sink).await, 0);
        assert!(sink.events.lock().is_empty());
    }

    #[tokio::test]
    async fn test_forget_releases_reconciled_job() {
        let api = Arc::new(FakeRc::default());
        api.finish(6, true, "");
        let poller = poller(api, 3);
        let sink = RecordingSink::default();

        poller.track(6, "t1");
        poller.poll_once(&sink).await;
        assert_eq!(poller.reconciled_count(), 1);

        poller.forget(6);
        assert_eq!(poller.reconciled_count(), 0);
        assert_eq!(poller.tracked_count(), 0);
    }

    #[tokio::test]
    async fn test_background_loop_and_shutdown() {
        let api = Arc::new(FakeRc::default());
        api.finish(4, true, "");
        let poller = Arc::new(poller(api, 3));
        let sink = Arc::new(RecordingSink::default());

        poller.track(4, "t1");
        poller.start(sink.clone());

        for _ in 0..100 {
            if !sink.exits().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        poller.shutdown();
        assert_eq!(sink.exits().len(), 1);
    }
}
