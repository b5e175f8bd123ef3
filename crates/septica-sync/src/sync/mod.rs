/// 同步模块
///
/// 职责：
/// - 四阶段同步状态机（档案 → 历史 → 文化进度 → 成就）
/// - 本地 / 远端快照的冲突合并
/// - 离线队列操作的远端推送
/// - 定时、重连、远端推送触发的调度

pub mod coordinator;
pub mod entity_type;
pub mod gate;
pub mod handler;
pub mod reconciler;
pub mod resolver;
pub mod scheduler;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use coordinator::{PhaseReport, SyncCoordinator, SyncOutcome, SyncReport};
pub use entity_type::EntityType;
pub use gate::{GateGuard, SyncGate};
pub use handler::{OperationHandler, RemoteOperationHandler};
pub use reconciler::{PhaseAction, PhaseOutcome, Reconciler};
pub use resolver::{ConflictRecord, ConflictResolver, ConflictSummary, FieldPolicy, Mergeable};
pub use scheduler::SyncScheduler;

/// 整体同步状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncStatus {
    Idle,
    /// 拉取远端快照
    Downloading,
    /// 持久化与推送
    Syncing,
    /// 合并本地与远端分歧
    ResolvingConflicts,
    Completed,
    Error(String),
}

impl SyncStatus {
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncStatus::Downloading | SyncStatus::Syncing | SyncStatus::ResolvingConflicts
        )
    }
}

/// 单个分类的同步状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CategorySyncState {
    Synced,
    Pending,
    Syncing,
    Conflict,
    Error,
}

/// 对外发布的同步状态快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub status: SyncStatus,
    /// 0.0 - 1.0
    pub progress: f64,
    /// 最后一次完整同步成功的时间（UTC 毫秒）
    pub last_sync_at: Option<i64>,
    pub current_phase: Option<EntityType>,
    pub categories: BTreeMap<EntityType, CategorySyncState>,
    /// 需要人工处理的冲突
    pub pending_conflicts: Vec<ConflictSummary>,
    pub last_error: Option<String>,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            status: SyncStatus::Idle,
            progress: 0.0,
            last_sync_at: None,
            current_phase: None,
            categories: EntityType::SYNC_ORDER
                .iter()
                .map(|entity_type| (*entity_type, CategorySyncState::Pending))
                .collect(),
            pending_conflicts: Vec::new(),
            last_error: None,
        }
    }
}
