//! 统一入口 - ProgressSync
//!
//! 分层架构设计：
//! ```text
//! ProgressSync (门面层)
//!   ├── ProgressRecorder (进度事件入口)
//!   ├── SyncScheduler (调度层)
//!   │     └── SyncCoordinator (四阶段同步)
//!   ├── OfflineQueue (离线队列)
//!   ├── LocalStore / KvStore (存储层)
//!   ├── RemoteRecordStore (远端适配层)
//!   ├── EventManager (事件系统层)
//!   └── NetworkMonitor (网络监控层)
//! ```
//!
//! 所有组件在 [`ProgressSync::initialize`] 中显式注入，没有全局单例。

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, RwLock};
use tracing::{debug, info, warn};

use crate::error::{ErrorReporter, Result, SyncError, TracingErrorReporter};
use crate::events::{EventFilter, EventManager, FilteredEventReceiver, SyncEvent};
use crate::lifecycle::{LifecycleManager, SyncLifecycleHook};
use crate::network::{NetworkMonitor, NetworkStatusListener};
use crate::progress::{ProgressEvent, ProgressRecorder};
use crate::remote::{HttpRecordStore, HttpRemoteConfig, RemoteRecordStore};
use crate::storage::entities::{AchievementSet, CulturalProgress, GameRecord, GameRecordSet, PlayerProfile, Snapshot};
use crate::storage::kv::KvStore;
use crate::storage::local_store::LocalStore;
use crate::storage::queue::{DrainOutcome, OfflineQueue, QueueStats, RetryPolicy};
use crate::sync::{
    ConflictResolver, ConflictSummary, Reconciler, RemoteOperationHandler, SyncCoordinator, SyncGate, SyncOutcome,
    SyncScheduler, SyncState,
};

/// 同步引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// 数据存储目录
    pub data_dir: PathBuf,
    /// 当前玩家
    pub player_id: String,
    /// 定时完整同步的间隔
    pub sync_interval: Duration,
    /// 离线队列重试策略
    pub retry: RetryPolicy,
    /// 服务端持续返回 RecordChanged 时的最大重新合并次数
    pub max_conflict_attempts: u32,
    /// 事件配置
    pub event_config: EventConfig,
    /// 保留的最近冲突条数（诊断用）
    pub conflict_history_limit: usize,
    /// HTTP 远端配置，使用 [`ProgressSync::initialize_http`] 时必填
    pub http: Option<HttpRemoteConfig>,
}

/// 事件配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    /// 事件缓冲区大小
    pub buffer_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: get_default_data_dir(),
            player_id: String::new(),
            sync_interval: Duration::from_secs(300),
            retry: RetryPolicy::default(),
            max_conflict_attempts: 3,
            event_config: EventConfig::default(),
            conflict_history_limit: 32,
            http: None,
        }
    }
}

impl Default for EventConfig {
    fn default() -> Self {
        Self { buffer_size: 256 }
    }
}

/// 获取默认数据目录 ~/.septica/
fn get_default_data_dir() -> PathBuf {
    if let Some(home_dir) = std::env::var("HOME").ok().map(PathBuf::from) {
        home_dir.join(".septica")
    } else if let Some(home_dir) = std::env::var("USERPROFILE").ok().map(PathBuf::from) {
        // Windows 支持
        home_dir.join(".septica")
    } else {
        PathBuf::from("./septica_data")
    }
}

impl SyncConfig {
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::new()
    }

    /// 验证配置
    pub fn validate(&self) -> Result<()> {
        if self.player_id.trim().is_empty() {
            return Err(SyncError::InvalidArgument("player_id 不能为空".to_string()));
        }
        if self.sync_interval.is_zero() {
            return Err(SyncError::InvalidArgument("同步间隔不能为0".to_string()));
        }
        if self.retry.max_retries == 0 {
            return Err(SyncError::InvalidArgument("max_retries 不能为0".to_string()));
        }
        if self.retry.retry_delay.is_zero() {
            return Err(SyncError::InvalidArgument("重试间隔不能为0".to_string()));
        }
        if self.data_dir.as_os_str().is_empty() {
            return Err(SyncError::InvalidArgument("数据目录不能为空".to_string()));
        }
        Ok(())
    }
}

/// 同步引擎配置构建器
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SyncConfig::default(),
        }
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn player_id<S: Into<String>>(mut self, player_id: S) -> Self {
        self.config.player_id = player_id.into();
        self
    }

    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.config.sync_interval = interval;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.config.retry.max_retries = max_retries;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry.retry_delay = delay;
        self
    }

    pub fn max_conflict_attempts(mut self, attempts: u32) -> Self {
        self.config.max_conflict_attempts = attempts;
        self
    }

    pub fn event_config(mut self, config: EventConfig) -> Self {
        self.config.event_config = config;
        self
    }

    pub fn conflict_history_limit(mut self, limit: usize) -> Self {
        self.config.conflict_history_limit = limit;
        self
    }

    /// 使用 HTTP 远端
    pub fn http_remote<S: Into<String>>(mut self, base_url: S) -> Self {
        self.config.http = Some(HttpRemoteConfig::new(base_url));
        self
    }

    pub fn http_config(mut self, config: HttpRemoteConfig) -> Self {
        self.config.http = Some(config);
        self
    }

    pub fn build(self) -> SyncConfig {
        self.config
    }
}

impl Default for SyncConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// 玩家进度同步引擎主入口
pub struct ProgressSync {
    config: SyncConfig,
    kv: Arc<KvStore>,
    local: Arc<LocalStore>,
    queue: Arc<OfflineQueue>,
    resolver: Arc<ConflictResolver>,
    coordinator: Arc<SyncCoordinator>,
    scheduler: Arc<SyncScheduler>,
    recorder: ProgressRecorder,
    network: Arc<NetworkMonitor>,
    event_manager: Arc<EventManager>,
    lifecycle_manager: RwLock<LifecycleManager>,
    shutting_down: AtomicBool,
}

impl ProgressSync {
    /// 初始化引擎（完整性问题写入 tracing 日志）
    pub async fn initialize(
        config: SyncConfig,
        remote: Arc<dyn RemoteRecordStore>,
        network_listener: Arc<dyn NetworkStatusListener>,
    ) -> Result<Arc<Self>> {
        Self::initialize_with_reporter(config, remote, network_listener, Arc::new(TracingErrorReporter)).await
    }

    /// 使用 `config.http` 构建 HTTP 远端后初始化
    pub async fn initialize_http(
        config: SyncConfig,
        network_listener: Arc<dyn NetworkStatusListener>,
    ) -> Result<Arc<Self>> {
        let http = config
            .http
            .as_ref()
            .ok_or_else(|| SyncError::InvalidArgument("未配置 HTTP 远端".to_string()))?;
        let remote = Arc::new(HttpRecordStore::new(http)?);
        Self::initialize(config, remote, network_listener).await
    }

    /// 分层初始化顺序：
    /// 1. 存储层 → 2. 事件层 → 3. 网络层 → 4. 同步层 → 5. 生命周期
    pub async fn initialize_with_reporter(
        config: SyncConfig,
        remote: Arc<dyn RemoteRecordStore>,
        network_listener: Arc<dyn NetworkStatusListener>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Result<Arc<Self>> {
        info!("正在初始化 ProgressSync...");
        config.validate()?;

        // === 第1层：存储 ===
        let kv = Arc::new(KvStore::new(&config.data_dir).await?);
        kv.switch_player(&config.player_id).await?;

        // === 第2层：事件管理器 ===
        let event_manager = Arc::new(EventManager::new(config.event_config.buffer_size));
        let local = Arc::new(LocalStore::new(kv.clone(), reporter.clone(), event_manager.clone()));

        // === 第3层：网络监控 ===
        let network = Arc::new(NetworkMonitor::new(network_listener));
        network.start().await?;

        // === 第4层：同步 ===
        let gate = SyncGate::new();
        let resolver = Arc::new(ConflictResolver::new(config.conflict_history_limit));
        let reconciler = Arc::new(Reconciler::new(
            local.clone(),
            remote.clone(),
            resolver.clone(),
            config.max_conflict_attempts,
        ));
        let handler = Arc::new(RemoteOperationHandler::new(reconciler.clone(), event_manager.clone()));
        let queue = Arc::new(
            OfflineQueue::open(
                kv.clone(),
                handler,
                config.retry.clone(),
                gate.clone(),
                event_manager.clone(),
                reporter,
            )
            .await?,
        );
        let coordinator = Arc::new(
            SyncCoordinator::new(
                config.player_id.clone(),
                reconciler,
                local.clone(),
                gate,
                event_manager.clone(),
            )
            .await?,
        );
        let scheduler = Arc::new(SyncScheduler::new(
            coordinator.clone(),
            queue.clone(),
            network.clone(),
            remote,
            config.sync_interval,
            config.retry.retry_delay,
        ));
        let recorder = ProgressRecorder::new(config.player_id.clone(), local.clone(), queue.clone(), network.clone());

        // === 第5层：生命周期 ===
        let mut lifecycle_manager = LifecycleManager::new();
        lifecycle_manager.register_hook(Arc::new(SyncLifecycleHook::new(
            coordinator.clone(),
            queue.clone(),
            scheduler.clone(),
            network.clone(),
        )));

        info!("✅ ProgressSync 初始化完成: player={}", config.player_id);
        Ok(Arc::new(Self {
            config,
            kv,
            local,
            queue,
            resolver,
            coordinator,
            scheduler,
            recorder,
            network,
            event_manager,
            lifecycle_manager: RwLock::new(lifecycle_manager),
            shutting_down: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn player_id(&self) -> &str {
        &self.config.player_id
    }

    fn check_running(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(SyncError::NotInitialized("ProgressSync 已关闭".to_string()));
        }
        Ok(())
    }

    /// 启动后台调度并请求一次同步
    pub async fn start(&self) -> Result<()> {
        self.check_running()?;
        self.scheduler.start().await?;
        self.scheduler.trigger_now();
        Ok(())
    }

    /// 停止调度、取消进行中的同步并落盘
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("正在关闭 ProgressSync...");

        self.scheduler.shutdown().await;
        self.network.stop().await;
        self.kv.flush().await?;

        info!("ProgressSync 关闭完成");
        Ok(())
    }

    /// 记录游戏进度事件，返回入队的操作数（不等待网络）
    pub async fn record_event(&self, event: ProgressEvent) -> Result<usize> {
        self.check_running()?;
        self.recorder.record(event).await
    }

    /// 立即执行一次完整同步（网络可用时先处理离线队列）
    pub async fn sync_now(&self) -> Result<SyncOutcome> {
        self.check_running()?;
        if self.network.is_online().await {
            match self.queue.process_all().await {
                Ok(outcome) => debug!("同步前处理离线队列: {:?}", outcome),
                Err(e) => warn!("同步前处理离线队列失败: {}", e),
            }
        }
        self.coordinator.sync_all().await
    }

    /// 立即处理离线队列
    pub async fn process_queue(&self) -> Result<DrainOutcome> {
        self.check_running()?;
        self.queue.process_all().await
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.event_manager.subscribe()
    }

    pub fn subscribe_events_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        self.event_manager.subscribe_filtered(filter)
    }

    pub fn event_manager(&self) -> &Arc<EventManager> {
        &self.event_manager
    }

    pub fn state(&self) -> SyncState {
        self.coordinator.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<SyncState> {
        self.coordinator.watch()
    }

    pub async fn profile(&self) -> Result<Option<PlayerProfile>> {
        self.read_local::<PlayerProfile>().await
    }

    /// 本地对局历史，按时间倒序
    pub async fn game_history(&self) -> Result<Vec<GameRecord>> {
        Ok(self
            .read_local::<GameRecordSet>()
            .await?
            .map(|set| set.records)
            .unwrap_or_default())
    }

    pub async fn cultural_progress(&self) -> Result<Option<CulturalProgress>> {
        self.read_local::<CulturalProgress>().await
    }

    pub async fn achievements(&self) -> Result<Option<AchievementSet>> {
        self.read_local::<AchievementSet>().await
    }

    async fn read_local<T: Snapshot>(&self) -> Result<Option<T>> {
        Ok(self.local.get::<T>(&self.config.player_id).await?.into_option())
    }

    pub fn queue_stats(&self) -> Result<QueueStats> {
        self.queue.stats()
    }

    /// 最近自动合并的冲突（诊断用）
    pub fn recent_conflicts(&self) -> Vec<ConflictSummary> {
        self.resolver.recent()
    }

    /// App 切到后台
    pub async fn on_background(&self) -> Result<()> {
        self.lifecycle_manager.read().await.notify_background().await
    }

    /// App 回到前台
    pub async fn on_foreground(&self) -> Result<()> {
        self.check_running()?;
        self.lifecycle_manager.read().await.notify_foreground().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{ManualNetworkListener, NetworkStatus};
    use crate::progress::CulturalMilestone;
    use crate::remote::{InMemoryRecordStore, RecordType};
    use crate::sync::{CategorySyncState, SyncStatus};
    use chrono::Utc;
    use tempfile::TempDir;

    fn config(temp_dir: &TempDir) -> SyncConfig {
        SyncConfig::builder()
            .data_dir(temp_dir.path())
            .player_id("p1")
            .sync_interval(Duration::from_secs(3600))
            .retry_delay(Duration::from_secs(3600))
            .build()
    }

    async fn device(
        temp_dir: &TempDir,
        remote: Arc<InMemoryRecordStore>,
        status: NetworkStatus,
    ) -> (Arc<ProgressSync>, Arc<ManualNetworkListener>) {
        let listener = Arc::new(ManualNetworkListener::new(status));
        let sync = ProgressSync::initialize(config(temp_dir), remote, listener.clone())
            .await
            .unwrap();
        (sync, listener)
    }

    /// 后台任务可能暂时占用 gate，重试到完成为止
    async fn sync_until_completed(sync: &ProgressSync) {
        for _ in 0..200 {
            if let Ok(SyncOutcome::Completed(_)) = sync.sync_now().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("sync never completed");
    }

    #[test]
    fn test_config_validation() {
        let temp_dir = TempDir::new().unwrap();
        assert!(config(&temp_dir).validate().is_ok());

        let no_player = SyncConfig::builder().data_dir(temp_dir.path()).build();
        assert!(matches!(no_player.validate(), Err(SyncError::InvalidArgument(_))));

        let zero_interval = SyncConfig::builder()
            .player_id("p1")
            .sync_interval(Duration::ZERO)
            .build();
        assert!(zero_interval.validate().is_err());

        let no_retries = SyncConfig::builder().player_id("p1").max_retries(0).build();
        assert!(no_retries.validate().is_err());

        let zero_retry_delay = SyncConfig::builder()
            .data_dir(temp_dir.path())
            .player_id("p1")
            .retry_delay(Duration::ZERO)
            .build();
        assert!(matches!(zero_retry_delay.validate(), Err(SyncError::InvalidArgument(_))));
    }

    #[test]
    fn test_config_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.sync_interval, Duration::from_secs(300));
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.retry_delay, Duration::from_secs(30));
        assert_eq!(config.max_conflict_attempts, 3);
        assert_eq!(config.event_config.buffer_size, 256);
        assert!(config.http.is_none());
    }

    #[tokio::test]
    async fn test_initialize_http_requires_config() {
        let temp_dir = TempDir::new().unwrap();
        let listener = Arc::new(ManualNetworkListener::default());
        let result = ProgressSync::initialize_http(config(&temp_dir), listener).await;
        assert!(matches!(result, Err(SyncError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_offline_play_then_reconnect() {
        let temp_dir = TempDir::new().unwrap();
        let remote = Arc::new(InMemoryRecordStore::new());
        remote.set_online(false);
        let (sync, network) = device(&temp_dir, remote.clone(), NetworkStatus::Offline).await;
        sync.start().await.unwrap();

        let game = GameRecord::new("p1", "normal", 11, 5, 240);
        assert_eq!(
            sync.record_event(ProgressEvent::GameCompleted { record: game.clone() })
                .await
                .unwrap(),
            2
        );

        // 离线时本地立即可读，远端没有任何写入
        assert_eq!(sync.profile().await.unwrap().unwrap().games_played, 1);
        assert_eq!(sync.game_history().await.unwrap(), vec![game]);
        assert_eq!(sync.queue_stats().unwrap().pending, 2);
        assert_eq!(remote.record_count(RecordType::GameRecord), 0);

        remote.set_online(true);
        network.go_online();

        let mut drained = false;
        for _ in 0..200 {
            if sync.queue_stats().unwrap().pending == 0 && sync.state().status == SyncStatus::Completed {
                drained = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(drained);
        assert_eq!(remote.record_count(RecordType::GameRecord), 1);
        assert!(remote.get(RecordType::PlayerProfile, "p1").is_some());

        sync.shutdown().await.unwrap();
        assert!(sync.record_event(ProgressEvent::CulturalMilestoneReached {
            milestone: CulturalMilestone::ItemLearned("hora".to_string()),
        })
        .await
        .is_err());
    }

    #[tokio::test]
    async fn test_two_devices_converge() {
        let remote = Arc::new(InMemoryRecordStore::new());
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let (device_a, _) = device(&dir_a, remote.clone(), NetworkStatus::Online).await;
        let (device_b, _) = device(&dir_b, remote.clone(), NetworkStatus::Online).await;

        let game_a = GameRecord::new("p1", "easy", 11, 2, 180);
        let game_b = GameRecord::new("p1", "hard", 8, 11, 420);
        device_a
            .record_event(ProgressEvent::GameCompleted { record: game_a.clone() })
            .await
            .unwrap();
        device_b
            .record_event(ProgressEvent::GameCompleted { record: game_b.clone() })
            .await
            .unwrap();
        device_b
            .record_event(ProgressEvent::AchievementUnlocked {
                achievement_id: "first_game".to_string(),
                unlocked_at: Utc::now(),
            })
            .await
            .unwrap();

        sync_until_completed(&device_a).await;
        sync_until_completed(&device_b).await;
        sync_until_completed(&device_a).await;

        let history_a = device_a.game_history().await.unwrap();
        let history_b = device_b.game_history().await.unwrap();
        assert_eq!(history_a.len(), 2);
        assert_eq!(history_a, history_b);
        assert_eq!(remote.record_count(RecordType::GameRecord), 2);

        let achievements = device_a.achievements().await.unwrap().unwrap();
        assert!(achievements.is_unlocked("first_game"));

        let state = device_a.state();
        assert!(state.last_sync_at.is_some());
        assert!(state.categories.values().all(|c| *c == CategorySyncState::Synced));
    }

    #[tokio::test]
    async fn test_background_pauses_queue() {
        let temp_dir = TempDir::new().unwrap();
        let remote = Arc::new(InMemoryRecordStore::new());
        let (sync, _) = device(&temp_dir, remote.clone(), NetworkStatus::Online).await;

        sync.on_background().await.unwrap();
        assert!(sync.scheduler.is_background());
        assert_eq!(sync.process_queue().await.unwrap(), DrainOutcome::Paused);

        sync.record_event(ProgressEvent::AchievementProgressed {
            achievement_id: "collector".to_string(),
            fraction: 0.5,
        })
        .await
        .unwrap();
        assert_eq!(sync.queue_stats().unwrap().pending, 1);

        sync.on_foreground().await.unwrap();
        assert!(!sync.scheduler.is_background());
        for _ in 0..200 {
            if sync.queue_stats().unwrap().pending == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(sync.queue_stats().unwrap().pending, 0);
        assert!(remote.get(RecordType::Achievements, "p1").is_some());
    }
}
