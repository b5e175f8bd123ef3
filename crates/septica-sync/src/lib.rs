//! Septica Sync - 离线优先的玩家进度同步引擎
//!
//! 本引擎为 Septica 纸牌游戏提供玩家进度的本地持久化与多设备同步，包括：
//! - 💾 本地快照存储：档案、对局历史、文化进度、成就
//! - 📮 离线队列：离线时持久化写入，重连后按序推送，有界重试
//! - 🧠 冲突合并：按字段策略合并，可交换、幂等
//! - 🔄 四阶段同步状态机：档案 → 历史 → 文化进度 → 成就
//! - ⏰ 调度：定时、网络重连、远端变更、手动触发
//! - ⚙️ 事件系统：统一的事件管理和订阅机制
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use septica_sync::{
//!     GameRecord, InMemoryRecordStore, ManualNetworkListener, ProgressEvent, ProgressSync, SyncConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SyncConfig::builder()
//!         .data_dir("/path/to/data")
//!         .player_id("player-1")
//!         .build();
//!
//!     let remote = Arc::new(InMemoryRecordStore::new());
//!     let network = Arc::new(ManualNetworkListener::default());
//!     let sync = ProgressSync::initialize(config, remote, network).await?;
//!     sync.start().await?;
//!
//!     // 记录一局对局（立即写入本地，不等待网络）
//!     let record = GameRecord::new("player-1", "normal", 11, 7, 300);
//!     sync.record_event(ProgressEvent::GameCompleted { record }).await?;
//!
//!     // 订阅同步状态
//!     let mut state = sync.watch_state();
//!     state.changed().await?;
//!     println!("同步状态: {:?}", state.borrow().status);
//!
//!     sync.shutdown().await?;
//!     Ok(())
//! }
//! ```

// 导出核心模块
pub mod error;
pub mod version;
pub mod storage;
pub mod remote;
pub mod network;
pub mod events;
pub mod sync;
pub mod progress;
pub mod lifecycle;
pub mod sdk;

// 重新导出核心类型，方便使用
pub use error::{ErrorReporter, IntegrityIssue, Result, SyncError, TracingErrorReporter};
pub use sdk::{EventConfig, ProgressSync, SyncConfig, SyncConfigBuilder};
pub use storage::{
    AchievementSet, CulturalProgress, DrainOutcome, GameRecord, GameRecordSet, OfflineQueue, OperationStatus,
    PlayerProfile, QueueStats, RetryPolicy, SyncOperation, SyncUpdate, UnlockedAchievement,
};
pub use remote::{
    HttpRecordStore, HttpRemoteConfig, InMemoryRecordStore, RawRecord, RecordQuery, RecordType, RemoteChange,
    RemoteRecordStore, RemoteRecordStoreExt,
};
pub use network::{ManualNetworkListener, NetworkMonitor, NetworkStatus, NetworkStatusEvent, NetworkStatusListener};
pub use events::{EventFilter, EventManager, SyncEvent};
pub use sync::{
    CategorySyncState, ConflictSummary, EntityType, SyncCoordinator, SyncOutcome, SyncReport, SyncScheduler,
    SyncState, SyncStatus,
};
pub use progress::{CulturalMilestone, ProgressEvent, ProgressRecorder};
pub use lifecycle::{LifecycleHook, LifecycleManager, SyncLifecycleHook};
pub use version::SDK_VERSION;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_reexports() {
        assert!(!SDK_VERSION.is_empty());
        assert_eq!(EntityType::SYNC_ORDER[0], EntityType::Profile);
        assert_eq!(SyncState::default().status, SyncStatus::Idle);
    }
}
