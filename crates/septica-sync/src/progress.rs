//! 游戏进度事件入口
//!
//! 把玩家在游戏中的行为写入本地快照，并为每个被修改的分类生成一条离线操作。
//! 写入本地后立即返回，网络可用时在后台处理队列。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::network::NetworkMonitor;
use crate::storage::entities::{AchievementSet, CulturalProgress, GameRecord, GameRecordSet, PlayerProfile};
use crate::storage::local_store::LocalStore;
use crate::storage::queue::{OfflineQueue, SyncOperation, SyncUpdate};

/// 文化学习相关的里程碑
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CulturalMilestone {
    ItemLearned(String),
    TrackListened(String),
    LessonCompleted(String),
    QuizScored { quiz_id: String, score: u32 },
    MilestoneReached(String),
    /// 0.0 - 1.0
    EngagementUpdated(f64),
}

/// 游戏侧上报的进度事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProgressEvent {
    GameCompleted {
        record: GameRecord,
    },
    AchievementUnlocked {
        achievement_id: String,
        unlocked_at: DateTime<Utc>,
    },
    AchievementProgressed {
        achievement_id: String,
        fraction: f64,
    },
    CulturalMilestoneReached {
        milestone: CulturalMilestone,
    },
}

pub struct ProgressRecorder {
    player_id: String,
    local: Arc<LocalStore>,
    queue: Arc<OfflineQueue>,
    network: Arc<NetworkMonitor>,
}

impl ProgressRecorder {
    pub fn new(
        player_id: impl Into<String>,
        local: Arc<LocalStore>,
        queue: Arc<OfflineQueue>,
        network: Arc<NetworkMonitor>,
    ) -> Self {
        Self {
            player_id: player_id.into(),
            local,
            queue,
            network,
        }
    }

    /// 记录一个进度事件，返回入队的操作数
    ///
    /// 重复的事件（同一局、已解锁的成就）不会产生新的操作。
    pub async fn record(&self, event: ProgressEvent) -> Result<usize> {
        let updates = match event {
            ProgressEvent::GameCompleted { record } => self.record_game(record).await?,
            ProgressEvent::AchievementUnlocked {
                achievement_id,
                unlocked_at,
            } => self.record_unlock(achievement_id, unlocked_at).await?,
            ProgressEvent::AchievementProgressed {
                achievement_id,
                fraction,
            } => self.record_achievement_progress(achievement_id, fraction).await?,
            ProgressEvent::CulturalMilestoneReached { milestone } => self.record_milestone(milestone).await?,
        };

        let enqueued = updates.len();
        for update in updates {
            self.queue.enqueue(SyncOperation::new(update)).await?;
        }

        if enqueued > 0 && self.network.is_online().await {
            self.spawn_drain();
        }
        Ok(enqueued)
    }

    fn spawn_drain(&self) {
        let queue = self.queue.clone();
        tokio::spawn(async move {
            match queue.process_all().await {
                Ok(outcome) => debug!("后台处理离线队列: {:?}", outcome),
                Err(e) => warn!("后台处理离线队列失败: {}", e),
            }
        });
    }

    async fn record_game(&self, record: GameRecord) -> Result<Vec<SyncUpdate>> {
        if record.player_id != self.player_id {
            return Err(SyncError::InvalidArgument(format!(
                "对局 {} 属于玩家 {}，当前玩家 {}",
                record.game_id, record.player_id, self.player_id
            )));
        }

        let mut is_new = false;
        self.local
            .update::<GameRecordSet, _>(&self.player_id, |history| {
                is_new = history.push(record.clone());
            })
            .await?;
        if !is_new {
            debug!("对局已记录，忽略: {}", record.game_id);
            return Ok(Vec::new());
        }

        let profile = self
            .local
            .update::<PlayerProfile, _>(&self.player_id, |profile| profile.apply_game(&record))
            .await?;

        info!(
            "🎮 对局完成: {} won={} 连胜={}",
            record.game_id, record.won, profile.current_streak
        );
        Ok(vec![
            SyncUpdate::HistoryUpdate(GameRecordSet::from_records(&self.player_id, vec![record])),
            SyncUpdate::ProfileUpdate(profile),
        ])
    }

    async fn record_unlock(&self, achievement_id: String, unlocked_at: DateTime<Utc>) -> Result<Vec<SyncUpdate>> {
        let mut newly = false;
        let achievements = self
            .local
            .update::<AchievementSet, _>(&self.player_id, |set| {
                newly = set.unlock(achievement_id.clone(), unlocked_at);
            })
            .await?;

        if !newly {
            return Ok(Vec::new());
        }
        info!("🏆 成就解锁: {}", achievement_id);
        Ok(vec![SyncUpdate::AchievementUpdate(achievements)])
    }

    async fn record_achievement_progress(&self, achievement_id: String, fraction: f64) -> Result<Vec<SyncUpdate>> {
        if !fraction.is_finite() {
            return Err(SyncError::InvalidArgument(format!("成就进度非法: {}", fraction)));
        }
        let fraction = fraction.clamp(0.0, 1.0);

        let mut changed = false;
        let achievements = self
            .local
            .update::<AchievementSet, _>(&self.player_id, |set| {
                let current = set.progress.entry(achievement_id.clone()).or_insert(0.0);
                if fraction > *current {
                    *current = fraction;
                    set.last_updated = Utc::now();
                    changed = true;
                }
            })
            .await?;

        Ok(if changed {
            vec![SyncUpdate::AchievementUpdate(achievements)]
        } else {
            Vec::new()
        })
    }

    async fn record_milestone(&self, milestone: CulturalMilestone) -> Result<Vec<SyncUpdate>> {
        if let CulturalMilestone::EngagementUpdated(level) = &milestone {
            if !level.is_finite() {
                return Err(SyncError::InvalidArgument(format!("参与度非法: {}", level)));
            }
        }

        let mut changed = false;
        let progress = self
            .local
            .update::<CulturalProgress, _>(&self.player_id, |progress| {
                changed = apply_milestone(progress, &milestone);
                if changed {
                    progress.last_updated = Utc::now();
                }
            })
            .await?;
        if !changed {
            return Ok(Vec::new());
        }

        let mut updates = vec![SyncUpdate::CulturalProgressUpdate(progress)];

        // 参与度同时体现在档案上
        if let CulturalMilestone::EngagementUpdated(level) = milestone {
            let level = level.clamp(0.0, 1.0);
            let mut raised = false;
            let profile = self
                .local
                .update::<PlayerProfile, _>(&self.player_id, |profile| {
                    if level > profile.heritage_engagement_level {
                        profile.heritage_engagement_level = level;
                        profile.updated_at = Utc::now();
                        raised = true;
                    }
                })
                .await?;
            if raised {
                updates.push(SyncUpdate::ProfileUpdate(profile));
            }
        }

        Ok(updates)
    }
}

/// 返回快照是否发生变化
fn apply_milestone(progress: &mut CulturalProgress, milestone: &CulturalMilestone) -> bool {
    match milestone {
        CulturalMilestone::ItemLearned(id) => progress.learned_items.insert(id.clone()),
        CulturalMilestone::TrackListened(id) => progress.listened_tracks.insert(id.clone()),
        CulturalMilestone::LessonCompleted(id) => progress.completed_lessons.insert(id.clone()),
        CulturalMilestone::MilestoneReached(id) => progress.milestones.insert(id.clone()),
        CulturalMilestone::QuizScored { quiz_id, score } => {
            let best = progress.quiz_scores.entry(quiz_id.clone()).or_insert(0);
            if *score <= *best {
                return false;
            }
            *best = *score;
            // 知识分 = 各测验最好成绩之和
            let total: u32 = progress.quiz_scores.values().sum();
            progress.knowledge_score = progress.knowledge_score.max(total);
            true
        }
        CulturalMilestone::EngagementUpdated(level) => {
            let level = level.clamp(0.0, 1.0);
            if level <= progress.heritage_engagement_level {
                return false;
            }
            progress.heritage_engagement_level = level;
            true
        }
    }
}
