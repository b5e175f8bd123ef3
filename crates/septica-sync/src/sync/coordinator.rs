//! 同步协调器 - 四阶段同步状态机
//!
//! 阶段固定顺序：档案(25%) → 历史(50%) → 文化进度(75%) → 成就(100%)。
//! 任一阶段失败即中止后续阶段并进入 Error，已完成阶段的本地写入不回滚。
//! 状态通过 watch 通道发布，状态迁移同时以 [`SyncEvent`] 广播。

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::error::{Result, SyncError};
use crate::events::{now_millis, EventManager, SyncEvent};
use crate::remote::RemoteChange;
use crate::storage::entities::{AchievementSet, CulturalProgress, PlayerProfile};
use crate::storage::local_store::LocalStore;
use crate::sync::gate::SyncGate;
use crate::sync::reconciler::{PhaseAction, PhaseOutcome, Reconciler};
use crate::sync::resolver::{ConflictSummary, Mergeable};
use crate::sync::{CategorySyncState, EntityType, SyncState, SyncStatus};

/// 单个阶段的结果
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseReport {
    pub entity_type: EntityType,
    pub action: PhaseAction,
    pub conflicts: Vec<ConflictSummary>,
}

/// 一次完整同步的报告
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub phases: Vec<PhaseReport>,
    pub completed_at: i64,
}

impl SyncReport {
    pub fn conflicts_resolved(&self) -> usize {
        self.phases.iter().map(|p| p.conflicts.len()).sum()
    }

    pub fn action_for(&self, entity_type: EntityType) -> Option<PhaseAction> {
        self.phases
            .iter()
            .find(|p| p.entity_type == entity_type)
            .map(|p| p.action)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// 已有同步或队列处理在进行
    Skipped,
}

pub struct SyncCoordinator {
    player_id: String,
    reconciler: Arc<Reconciler>,
    local: Arc<LocalStore>,
    gate: SyncGate,
    events: Arc<EventManager>,
    state_tx: watch::Sender<SyncState>,
    /// 当前周期的取消令牌
    cancel_token: Mutex<Option<CancellationToken>>,
}

impl SyncCoordinator {
    pub async fn new(
        player_id: impl Into<String>,
        reconciler: Arc<Reconciler>,
        local: Arc<LocalStore>,
        gate: SyncGate,
        events: Arc<EventManager>,
    ) -> Result<Self> {
        let state = SyncState {
            last_sync_at: local.last_sync_at().await?,
            ..SyncState::default()
        };
        let (state_tx, _) = watch::channel(state);

        Ok(Self {
            player_id: player_id.into(),
            reconciler,
            local,
            gate,
            events,
            state_tx,
            cancel_token: Mutex::new(None),
        })
    }

    pub fn state(&self) -> SyncState {
        self.state_tx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SyncState> {
        self.state_tx.subscribe()
    }

    pub fn is_syncing(&self) -> bool {
        self.state_tx.borrow().status.is_active()
    }

    /// 变更通知是否来自本设备的推送
    pub fn is_own_change(&self, change: &RemoteChange) -> bool {
        self.reconciler.is_own_change(change)
    }

    /// 取消正在进行的同步周期（下一个阶段开始前生效）
    pub fn cancel(&self) {
        if let Some(token) = self.cancel_token.lock().as_ref() {
            info!("🛑 取消同步周期");
            token.cancel();
        }
    }

    /// 执行一次完整同步
    ///
    /// gate 被占用时直接返回 `Skipped`，剩余工作交给下一次触发。
    #[instrument(skip(self), fields(player_id = %self.player_id))]
    pub async fn sync_all(&self) -> Result<SyncOutcome> {
        let _guard = match self.gate.try_acquire("coordinator") {
            Some(guard) => guard,
            None => {
                debug!("同步已在进行，跳过本次触发");
                return Ok(SyncOutcome::Skipped);
            }
        };

        let token = CancellationToken::new();
        *self.cancel_token.lock() = Some(token.clone());

        let result = self.run_cycle(&token).await;
        *self.cancel_token.lock() = None;
        result.map(SyncOutcome::Completed)
    }

    async fn run_cycle(&self, token: &CancellationToken) -> Result<SyncReport> {
        info!("🔄 开始完整同步");
        self.begin_cycle().await;

        let mut report = SyncReport::default();

        for entity_type in EntityType::SYNC_ORDER {
            if token.is_cancelled() {
                self.finish_cancelled(entity_type).await;
                return Err(SyncError::Cancelled);
            }

            self.enter_phase(entity_type).await;

            match self.run_phase(entity_type).await {
                Ok(outcome) => {
                    self.complete_phase(entity_type, &outcome).await;
                    report.phases.push(PhaseReport {
                        entity_type,
                        action: outcome.action,
                        conflicts: outcome.conflicts,
                    });
                }
                Err(e) => {
                    self.fail_cycle(Some(entity_type), &e).await;
                    return Err(e);
                }
            }
        }

        let completed_at = now_millis();
        if let Err(e) = self.local.set_last_sync_at(completed_at).await {
            self.fail_cycle(None, &e).await;
            return Err(e);
        }
        report.completed_at = completed_at;

        self.state_tx.send_modify(|state| {
            state.last_sync_at = Some(completed_at);
            state.current_phase = None;
        });
        self.set_status(SyncStatus::Completed).await;
        self.events
            .emit(SyncEvent::SyncCompleted {
                last_sync_at: completed_at,
                timestamp: now_millis(),
            })
            .await;

        info!(
            "✅ 完整同步完成: 解决冲突 {} 个",
            report.conflicts_resolved()
        );
        Ok(report)
    }

    async fn run_phase(&self, entity_type: EntityType) -> Result<PhaseOutcome> {
        match entity_type {
            EntityType::Profile => self.single_record_phase::<PlayerProfile>().await,
            EntityType::GameHistory => self.history_phase().await,
            EntityType::CulturalProgress => self.single_record_phase::<CulturalProgress>().await,
            EntityType::Achievements => self.single_record_phase::<AchievementSet>().await,
        }
    }

    async fn single_record_phase<T: Mergeable>(&self) -> Result<PhaseOutcome> {
        let pulled = self.reconciler.pull::<T>(&self.player_id).await?;
        if pulled.needs_merge() {
            self.set_status(SyncStatus::ResolvingConflicts).await;
        }
        self.set_status(SyncStatus::Syncing).await;
        self.reconciler.settle(pulled, None).await
    }

    async fn history_phase(&self) -> Result<PhaseOutcome> {
        let pulled = self.reconciler.pull_history(&self.player_id).await?;
        if pulled.needs_merge() {
            self.set_status(SyncStatus::ResolvingConflicts).await;
        }
        self.set_status(SyncStatus::Syncing).await;
        self.reconciler.settle_history(pulled).await
    }

    async fn begin_cycle(&self) {
        // 上一周期的终态先回到 Idle
        self.set_status(SyncStatus::Idle).await;
        self.state_tx.send_modify(|state| {
            state.progress = 0.0;
            state.last_error = None;
            state.current_phase = None;
            for category in state.categories.values_mut() {
                *category = CategorySyncState::Pending;
            }
        });
        self.emit_progress(None).await;
    }

    async fn enter_phase(&self, entity_type: EntityType) {
        debug!("进入阶段: {}", entity_type);
        self.state_tx.send_modify(|state| {
            state.current_phase = Some(entity_type);
        });
        self.set_category(entity_type, CategorySyncState::Syncing).await;
        self.set_status(SyncStatus::Downloading).await;
    }

    async fn complete_phase(&self, entity_type: EntityType, outcome: &PhaseOutcome) {
        for summary in &outcome.conflicts {
            let event = if summary.requires_attention {
                let pending = summary.clone();
                self.state_tx
                    .send_modify(|state| state.pending_conflicts.push(pending));
                SyncEvent::ConflictRequiresAttention(summary.clone())
            } else {
                SyncEvent::ConflictResolved(summary.clone())
            };
            self.events.emit(event).await;
        }

        let category = if outcome.conflicts.iter().any(|c| c.requires_attention) {
            CategorySyncState::Conflict
        } else {
            CategorySyncState::Synced
        };
        self.set_category(entity_type, category).await;

        self.state_tx.send_modify(|state| {
            state.progress = entity_type.phase_progress();
        });
        self.emit_progress(Some(entity_type)).await;

        info!("阶段完成: {} ({:?})", entity_type, outcome.action);
    }

    /// 周期失败：phase 为 None 表示全部阶段完成后的收尾失败
    async fn fail_cycle(&self, phase: Option<EntityType>, err: &SyncError) {
        match phase {
            Some(entity_type) => {
                error!("❌ 阶段 {} 失败: {}", entity_type, err);
                let category = if err.is_conflict() {
                    CategorySyncState::Conflict
                } else {
                    CategorySyncState::Error
                };
                self.set_category(entity_type, category).await;
            }
            None => error!("❌ 同步收尾失败: {}", err),
        }

        let message = err.to_string();
        self.state_tx.send_modify(|state| {
            state.last_error = Some(message.clone());
            if phase.is_none() {
                state.current_phase = None;
            }
        });
        self.set_status(SyncStatus::Error(message.clone())).await;
        self.events
            .emit(SyncEvent::SyncFailed {
                phase,
                error: message,
                timestamp: now_millis(),
            })
            .await;
    }

    async fn finish_cancelled(&self, next_phase: EntityType) {
        info!("同步在 {} 阶段前被取消", next_phase);
        self.state_tx.send_modify(|state| {
            state.current_phase = None;
        });
        self.set_status(SyncStatus::Idle).await;
        self.events
            .emit(SyncEvent::SyncCancelled {
                phase: Some(next_phase),
                timestamp: now_millis(),
            })
            .await;
    }

    async fn set_status(&self, new_status: SyncStatus) {
        let old_status = self.state_tx.borrow().status.clone();
        if old_status == new_status {
            return;
        }

        let status = new_status.clone();
        self.state_tx.send_modify(|state| state.status = status);
        self.events
            .emit(SyncEvent::StatusChanged {
                old_status,
                new_status,
                timestamp: now_millis(),
            })
            .await;
    }

    async fn set_category(&self, entity_type: EntityType, category: CategorySyncState) {
        self.state_tx.send_modify(|state| {
            state.categories.insert(entity_type, category);
        });
        self.events
            .emit(SyncEvent::CategoryStateChanged {
                entity_type,
                state: category,
                timestamp: now_millis(),
            })
            .await;
    }

    async fn emit_progress(&self, phase: Option<EntityType>) {
        let progress = self.state_tx.borrow().progress;
        self.events
            .emit(SyncEvent::ProgressUpdated {
                progress,
                phase,
                timestamp: now_millis(),
            })
            .await;
    }
}
