//! 离线队列 - 待推送到远端的持久化写操作
//!
//! - 存放在玩家命名空间下独立的 sled Tree 中，key 为单调递增的大端 u64，遍历顺序即入队顺序
//! - 值为 bincode 编码的 [`SyncOperation`]
//! - 每次入队 / 成功 / 失败后立即刷盘，崩溃最多丢失正在进行的那次网络调用
//! - 与同步协调器共用 [`SyncGate`]，忙碌时 `process_all` 直接返回

pub mod retry_policy;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::{IVec, Tree};
use tracing::{debug, error, info, instrument, warn};

use crate::error::{ErrorReporter, IntegrityIssue, Result, SyncError};
use crate::events::{now_millis, EventManager, SyncEvent};
use crate::storage::entities::{AchievementSet, CulturalProgress, GameRecordSet, PlayerProfile, Snapshot};
use crate::storage::kv::{keys, KvStore};
use crate::sync::gate::SyncGate;
use crate::sync::handler::OperationHandler;
use crate::sync::EntityType;

pub use retry_policy::{FailureReason, RetryPolicy};

/// 操作状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationStatus {
    /// 等待首次尝试
    Pending,
    /// 正在推送
    InFlight,
    /// 失败，等待重试
    Failed,
    /// 重试耗尽（终态）
    Abandoned,
}

/// 待推送的更新内容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncUpdate {
    ProfileUpdate(PlayerProfile),
    /// 只包含新产生的对局
    HistoryUpdate(GameRecordSet),
    CulturalProgressUpdate(CulturalProgress),
    AchievementUpdate(AchievementSet),
}

impl SyncUpdate {
    pub fn entity_type(&self) -> EntityType {
        match self {
            SyncUpdate::ProfileUpdate(_) => EntityType::Profile,
            SyncUpdate::HistoryUpdate(_) => EntityType::GameHistory,
            SyncUpdate::CulturalProgressUpdate(_) => EntityType::CulturalProgress,
            SyncUpdate::AchievementUpdate(_) => EntityType::Achievements,
        }
    }

    /// 实体键（玩家 ID）
    pub fn key(&self) -> &str {
        match self {
            SyncUpdate::ProfileUpdate(p) => p.key(),
            SyncUpdate::HistoryUpdate(h) => h.key(),
            SyncUpdate::CulturalProgressUpdate(c) => c.key(),
            SyncUpdate::AchievementUpdate(a) => a.key(),
        }
    }
}

/// 离线同步操作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    pub operation_id: String,
    pub entity_type: EntityType,
    pub update: SyncUpdate,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub status: OperationStatus,
    pub last_error: Option<String>,
}

impl SyncOperation {
    pub fn new(update: SyncUpdate) -> Self {
        Self {
            operation_id: uuid::Uuid::new_v4().to_string(),
            entity_type: update.entity_type(),
            update,
            created_at: Utc::now(),
            retry_count: 0,
            last_attempt_at: None,
            status: OperationStatus::Pending,
            last_error: None,
        }
    }
}

/// 一次 process_all 的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    /// gate 被占用或已有处理在进行
    Skipped,
    /// 队列已暂停
    Paused,
    Drained(DrainReport),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub succeeded: usize,
    pub retried: usize,
    pub abandoned: usize,
    /// 未到重试时间而跳过
    pub deferred: usize,
}

/// 队列统计信息
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub failed: usize,
    pub processed_total: u64,
    pub abandoned_total: u64,
}

pub struct OfflineQueue {
    tree: Tree,
    kv: Arc<KvStore>,
    handler: Arc<dyn OperationHandler>,
    policy: RetryPolicy,
    gate: SyncGate,
    paused: AtomicBool,
    events: Arc<EventManager>,
    reporter: Arc<dyn ErrorReporter>,
    processed_total: AtomicU64,
    abandoned_total: AtomicU64,
}

impl OfflineQueue {
    /// 打开当前玩家的队列；上次进程遗留的 InFlight 操作恢复为 Pending
    pub async fn open(
        kv: Arc<KvStore>,
        handler: Arc<dyn OperationHandler>,
        policy: RetryPolicy,
        gate: SyncGate,
        events: Arc<EventManager>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Result<Self> {
        let tree = kv.open_player_tree(keys::OFFLINE_QUEUE_TREE).await?;

        let queue = Self {
            tree,
            kv,
            handler,
            policy,
            gate,
            paused: AtomicBool::new(false),
            events,
            reporter,
            processed_total: AtomicU64::new(0),
            abandoned_total: AtomicU64::new(0),
        };

        let recovered = queue.recover_in_flight().await?;
        info!(
            "离线队列已打开: {} 条待处理 ({} 条从 InFlight 恢复)",
            queue.len(),
            recovered
        );
        Ok(queue)
    }

    async fn recover_in_flight(&self) -> Result<usize> {
        let mut recovered = 0;
        for (key, mut operation) in self.entries()? {
            if operation.status == OperationStatus::InFlight {
                operation.status = OperationStatus::Pending;
                self.store(&key, &operation)?;
                recovered += 1;
            }
        }
        if recovered > 0 {
            self.flush().await?;
        }
        Ok(recovered)
    }

    /// 入队并立即持久化，不等待任何网络 I/O
    pub async fn enqueue(&self, operation: SyncOperation) -> Result<()> {
        let sequence = self.kv.generate_id()?;
        let key = sequence.to_be_bytes();
        self.store(&key, &operation)?;
        self.flush().await?;

        debug!(
            "操作已入队: {} ({}) seq={}",
            operation.operation_id, operation.entity_type, sequence
        );
        self.events
            .emit(SyncEvent::OperationEnqueued {
                operation_id: operation.operation_id.clone(),
                entity_type: operation.entity_type,
                timestamp: now_millis(),
            })
            .await;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    /// 按入队顺序列出全部操作
    pub fn operations(&self) -> Result<Vec<SyncOperation>> {
        Ok(self.entries()?.into_iter().map(|(_, op)| op).collect())
    }

    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            info!("⏸️ 离线队列已暂停");
        }
    }

    /// 恢复处理；队列非空时立即处理一轮
    pub async fn resume(&self) -> Result<DrainOutcome> {
        if self.paused.swap(false, Ordering::SeqCst) {
            info!("▶️ 离线队列已恢复");
        }
        if self.is_empty() {
            return Ok(DrainOutcome::Drained(DrainReport::default()));
        }
        self.process_all().await
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> Result<QueueStats> {
        let mut stats = QueueStats {
            processed_total: self.processed_total.load(Ordering::SeqCst),
            abandoned_total: self.abandoned_total.load(Ordering::SeqCst),
            ..Default::default()
        };
        for (_, operation) in self.entries()? {
            match operation.status {
                OperationStatus::Failed => stats.failed += 1,
                _ => stats.pending += 1,
            }
        }
        Ok(stats)
    }

    /// 按入队顺序处理全部到期操作
    ///
    /// 已有处理在进行（或协调器正在同步）时立即返回 `Skipped`。
    #[instrument(skip(self), level = "debug")]
    pub async fn process_all(&self) -> Result<DrainOutcome> {
        if self.is_paused() {
            debug!("离线队列已暂停，跳过处理");
            return Ok(DrainOutcome::Paused);
        }
        let _guard = match self.gate.try_acquire("offline_queue") {
            Some(guard) => guard,
            None => return Ok(DrainOutcome::Skipped),
        };

        let mut report = DrainReport::default();

        for (key, mut operation) in self.entries()? {
            if self.is_paused() {
                info!("离线队列处理中途暂停，剩余操作保留");
                break;
            }
            if !self.policy.is_due(operation.last_attempt_at, Utc::now()) {
                report.deferred += 1;
                continue;
            }

            operation.status = OperationStatus::InFlight;
            self.store(&key, &operation)?;

            match self.handler.handle(&operation).await {
                Ok(()) => {
                    self.tree.remove(&key)?;
                    self.flush().await?;
                    self.processed_total.fetch_add(1, Ordering::SeqCst);
                    report.succeeded += 1;

                    debug!("✅ 操作推送成功: {}", operation.operation_id);
                    self.events
                        .emit(SyncEvent::OperationSucceeded {
                            operation_id: operation.operation_id.clone(),
                            entity_type: operation.entity_type,
                            timestamp: now_millis(),
                        })
                        .await;
                }
                Err(e) => {
                    if self.record_failure(&key, operation, e).await? {
                        report.retried += 1;
                    } else {
                        report.abandoned += 1;
                    }
                }
            }
        }

        info!(
            "离线队列处理完成: 成功 {} / 重试 {} / 丢弃 {} / 未到期 {}",
            report.succeeded, report.retried, report.abandoned, report.deferred
        );
        Ok(DrainOutcome::Drained(report))
    }

    /// 记录失败；返回 true 表示重新排队，false 表示已丢弃
    async fn record_failure(&self, key: &[u8], mut operation: SyncOperation, err: SyncError) -> Result<bool> {
        let reason = FailureReason::from(&err);
        operation.retry_count += 1;
        operation.last_attempt_at = Some(Utc::now());
        operation.last_error = Some(err.to_string());

        if self.policy.should_retry(operation.retry_count) {
            operation.status = OperationStatus::Failed;
            self.store(key, &operation)?;
            self.flush().await?;

            warn!(
                "操作失败，等待重试: {} ({}/{}) {:?}: {}",
                operation.operation_id, operation.retry_count, self.policy.max_retries, reason, err
            );
            self.events
                .emit(SyncEvent::OperationRetryScheduled {
                    operation_id: operation.operation_id,
                    entity_type: operation.entity_type,
                    retry_count: operation.retry_count,
                    error: err.to_string(),
                    timestamp: now_millis(),
                })
                .await;
            return Ok(true);
        }

        operation.status = OperationStatus::Abandoned;
        self.tree.remove(key)?;
        self.flush().await?;
        self.abandoned_total.fetch_add(1, Ordering::SeqCst);

        let exhausted = SyncError::OperationExhausted {
            operation_id: operation.operation_id.clone(),
            entity_type: operation.entity_type,
            attempts: operation.retry_count,
        };
        error!("❌ {}，最后错误: {}", exhausted, err);

        let issue = IntegrityIssue::new(
            Some(operation.entity_type),
            format!("{}，最后错误: {}", exhausted, err),
        );
        self.reporter.report(&issue);
        self.events
            .emit(SyncEvent::OperationAbandoned {
                operation_id: operation.operation_id,
                entity_type: operation.entity_type,
                attempts: operation.retry_count,
                error: err.to_string(),
                timestamp: now_millis(),
            })
            .await;
        self.events.emit(SyncEvent::IntegrityWarning(issue)).await;

        Ok(false)
    }

    /// 读取全部条目；无法解码的条目删除并上报
    fn entries(&self) -> Result<Vec<(IVec, SyncOperation)>> {
        let mut entries = Vec::new();
        for item in self.tree.iter() {
            let (key, value) = item?;
            match bincode::deserialize::<SyncOperation>(&value) {
                Ok(operation) => entries.push((key, operation)),
                Err(e) => {
                    self.tree.remove(&key)?;
                    self.reporter.report(&IntegrityIssue::new(
                        None,
                        format!("离线队列条目无法解码，已丢弃: {}", e),
                    ));
                }
            }
        }
        Ok(entries)
    }

    fn store(&self, key: &[u8], operation: &SyncOperation) -> Result<()> {
        let bytes = bincode::serialize(operation)?;
        self.tree.insert(key, bytes)?;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.tree.flush_async().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TracingErrorReporter;
    use crate::storage::entities::GameRecord;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::time::Duration;
    use tempfile::TempDir;

    /// 记录调用顺序，可按操作 ID 注入失败
    #[derive(Default)]
    struct ScriptedHandler {
        calls: Mutex<Vec<String>>,
        /// operation_id -> 剩余失败次数
        failures: Mutex<HashMap<String, u32>>,
    }

    impl ScriptedHandler {
        fn fail(&self, operation_id: &str, times: u32) {
            self.failures.lock().insert(operation_id.to_string(), times);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl OperationHandler for ScriptedHandler {
        async fn handle(&self, operation: &SyncOperation) -> Result<()> {
            self.calls.lock().push(operation.operation_id.clone());
            let mut failures = self.failures.lock();
            match failures.get_mut(&operation.operation_id) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    Err(SyncError::RemoteUnavailable("offline".into()))
                }
                _ => Ok(()),
            }
        }
    }

    fn instant_retry() -> RetryPolicy {
        RetryPolicy::new(3, Duration::ZERO)
    }

    async fn open_queue(
        temp_dir: &TempDir,
        handler: Arc<ScriptedHandler>,
        policy: RetryPolicy,
        gate: SyncGate,
    ) -> OfflineQueue {
        let kv = Arc::new(KvStore::new(temp_dir.path()).await.unwrap());
        kv.switch_player("p1").await.unwrap();
        OfflineQueue::open(
            kv,
            handler,
            policy,
            gate,
            Arc::new(EventManager::new(64)),
            Arc::new(TracingErrorReporter),
        )
        .await
        .unwrap()
    }

    fn achievement_op(id: &str) -> SyncOperation {
        let mut set = AchievementSet::new("p1");
        set.unlock(id, Utc::now());
        SyncOperation::new(SyncUpdate::AchievementUpdate(set))
    }

    fn history_op() -> SyncOperation {
        let set = GameRecordSet::from_records("p1", vec![GameRecord::new("p1", "normal", 11, 4, 200)]);
        SyncOperation::new(SyncUpdate::HistoryUpdate(set))
    }

    #[tokio::test]
    async fn test_operations_survive_restart() {
        let temp_dir = TempDir::new().unwrap();
        let handler = Arc::new(ScriptedHandler::default());
        let ops = vec![achievement_op("a"), history_op(), achievement_op("b")];

        {
            let queue = open_queue(&temp_dir, handler.clone(), instant_retry(), SyncGate::new()).await;
            for op in &ops {
                queue.enqueue(op.clone()).await.unwrap();
            }
        }

        let queue = open_queue(&temp_dir, handler, instant_retry(), SyncGate::new()).await;
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.operations().unwrap(), ops);
    }

    #[tokio::test]
    async fn test_processes_in_enqueue_order() {
        let temp_dir = TempDir::new().unwrap();
        let handler = Arc::new(ScriptedHandler::default());
        let queue = open_queue(&temp_dir, handler.clone(), instant_retry(), SyncGate::new()).await;

        let ops: Vec<_> = (0..5).map(|i| achievement_op(&format!("a{}", i))).collect();
        for op in &ops {
            queue.enqueue(op.clone()).await.unwrap();
        }

        queue.process_all().await.unwrap();

        let expected: Vec<_> = ops.iter().map(|op| op.operation_id.clone()).collect();
        assert_eq!(handler.calls(), expected);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_one_failure_then_success() {
        let temp_dir = TempDir::new().unwrap();
        let handler = Arc::new(ScriptedHandler::default());
        let queue = open_queue(&temp_dir, handler.clone(), instant_retry(), SyncGate::new()).await;

        let ops = vec![achievement_op("a"), history_op(), achievement_op("c")];
        handler.fail(&ops[1].operation_id, 1);
        for op in &ops {
            queue.enqueue(op.clone()).await.unwrap();
        }

        let first = queue.process_all().await.unwrap();
        assert_eq!(
            first,
            DrainOutcome::Drained(DrainReport { succeeded: 2, retried: 1, abandoned: 0, deferred: 0 })
        );
        let remaining = queue.operations().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].retry_count, 1);
        assert_eq!(remaining[0].status, OperationStatus::Failed);
        assert!(remaining[0].last_attempt_at.is_some());

        queue.process_all().await.unwrap();

        let stats = queue.stats().unwrap();
        assert_eq!(stats.processed_total, 3);
        assert_eq!(stats.abandoned_total, 0);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_retry_bound_abandons_exactly_once() {
        let temp_dir = TempDir::new().unwrap();
        let handler = Arc::new(ScriptedHandler::default());
        let queue = open_queue(&temp_dir, handler.clone(), instant_retry(), SyncGate::new()).await;

        let doomed = achievement_op("doomed");
        let healthy = achievement_op("healthy");
        handler.fail(&doomed.operation_id, u32::MAX);
        queue.enqueue(doomed.clone()).await.unwrap();

        for _ in 0..5 {
            queue.process_all().await.unwrap();
        }
        queue.enqueue(healthy).await.unwrap();
        queue.process_all().await.unwrap();

        let doomed_calls = handler
            .calls()
            .iter()
            .filter(|id| **id == doomed.operation_id)
            .count();
        assert_eq!(doomed_calls, 3);

        let stats = queue.stats().unwrap();
        assert_eq!(stats.abandoned_total, 1);
        assert_eq!(stats.processed_total, 1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_fixed_delay_defers_failed_operation() {
        let temp_dir = TempDir::new().unwrap();
        let handler = Arc::new(ScriptedHandler::default());
        let queue = open_queue(
            &temp_dir,
            handler.clone(),
            RetryPolicy::new(3, Duration::from_secs(30)),
            SyncGate::new(),
        )
        .await;

        let op = achievement_op("a");
        handler.fail(&op.operation_id, 1);
        queue.enqueue(op).await.unwrap();

        queue.process_all().await.unwrap();
        let second = queue.process_all().await.unwrap();
        assert_eq!(
            second,
            DrainOutcome::Drained(DrainReport { deferred: 1, ..Default::default() })
        );
        assert_eq!(handler.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_skipped_while_gate_busy() {
        let temp_dir = TempDir::new().unwrap();
        let handler = Arc::new(ScriptedHandler::default());
        let gate = SyncGate::new();
        let queue = open_queue(&temp_dir, handler.clone(), instant_retry(), gate.clone()).await;
        queue.enqueue(achievement_op("a")).await.unwrap();

        let guard = gate.try_acquire("coordinator").unwrap();
        assert_eq!(queue.process_all().await.unwrap(), DrainOutcome::Skipped);
        assert_eq!(queue.len(), 1);
        assert!(handler.calls().is_empty());

        drop(guard);
        queue.process_all().await.unwrap();
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let temp_dir = TempDir::new().unwrap();
        let handler = Arc::new(ScriptedHandler::default());
        let queue = open_queue(&temp_dir, handler.clone(), instant_retry(), SyncGate::new()).await;

        queue.pause();
        queue.enqueue(achievement_op("a")).await.unwrap();
        assert_eq!(queue.process_all().await.unwrap(), DrainOutcome::Paused);
        assert_eq!(queue.len(), 1);

        let outcome = queue.resume().await.unwrap();
        assert!(matches!(outcome, DrainOutcome::Drained(ref r) if r.succeeded == 1));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_in_flight_recovered_as_pending() {
        let temp_dir = TempDir::new().unwrap();
        let handler = Arc::new(ScriptedHandler::default());
        {
            let queue = open_queue(&temp_dir, handler.clone(), instant_retry(), SyncGate::new()).await;
            let mut op = achievement_op("a");
            op.status = OperationStatus::InFlight;
            queue.enqueue(op).await.unwrap();
        }

        let queue = open_queue(&temp_dir, handler, instant_retry(), SyncGate::new()).await;
        let ops = queue.operations().unwrap();
        assert_eq!(ops[0].status, OperationStatus::Pending);
        assert_eq!(queue.stats().unwrap().pending, 1);
    }
}
