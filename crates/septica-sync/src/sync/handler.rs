//! 离线队列操作处理器

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;
use crate::events::{EventManager, SyncEvent};
use crate::storage::entities::{AchievementSet, CulturalProgress, PlayerProfile, Snapshot};
use crate::storage::queue::{SyncOperation, SyncUpdate};
use crate::sync::reconciler::{PhaseOutcome, Reconciler};
use crate::sync::resolver::Mergeable;

/// 把一条排队的操作应用到远端
#[async_trait]
pub trait OperationHandler: Send + Sync {
    async fn handle(&self, operation: &SyncOperation) -> Result<()>;
}

/// 默认处理器：与远端合并后推送
pub struct RemoteOperationHandler {
    reconciler: Arc<Reconciler>,
    events: Arc<EventManager>,
}

impl RemoteOperationHandler {
    pub fn new(reconciler: Arc<Reconciler>, events: Arc<EventManager>) -> Self {
        Self { reconciler, events }
    }

    async fn push<T: Mergeable>(&self, value: &T) -> Result<()> {
        let pulled = self.reconciler.pull::<T>(value.key()).await?;
        let outcome = self.reconciler.settle(pulled, Some(value)).await?;
        self.publish_conflicts(&outcome).await;
        Ok(())
    }

    async fn publish_conflicts(&self, outcome: &PhaseOutcome) {
        for summary in &outcome.conflicts {
            let event = if summary.requires_attention {
                SyncEvent::ConflictRequiresAttention(summary.clone())
            } else {
                SyncEvent::ConflictResolved(summary.clone())
            };
            self.events.emit(event).await;
        }
    }
}

#[async_trait]
impl OperationHandler for RemoteOperationHandler {
    async fn handle(&self, operation: &SyncOperation) -> Result<()> {
        debug!(
            "处理离线操作: {} ({}) 第 {} 次重试",
            operation.operation_id, operation.entity_type, operation.retry_count
        );

        match &operation.update {
            SyncUpdate::ProfileUpdate(profile) => self.push::<PlayerProfile>(profile).await,
            SyncUpdate::HistoryUpdate(history) => {
                self.reconciler.create_records(&history.records).await?;
                Ok(())
            }
            SyncUpdate::CulturalProgressUpdate(progress) => self.push::<CulturalProgress>(progress).await,
            SyncUpdate::AchievementUpdate(achievements) => self.push::<AchievementSet>(achievements).await,
        }
    }
}
