//! 数据实体定义 - 玩家进度快照
//!
//! 这里定义了所有参与同步的快照结构体，用于：
//! - 本地持久化（JSON）
//! - 远端记录载荷
//! - 离线队列中的待推送操作
//!
//! 集合字段统一使用 BTreeSet / BTreeMap，保证序列化结果稳定、合并结果可比较。

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::sync::EntityType;

/// 可同步快照的公共契约
pub trait Snapshot:
    Clone + Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// 快照所属实体类型
    const ENTITY_TYPE: EntityType;

    /// 稳定键（玩家 ID）
    fn key(&self) -> &str;

    /// 最后修改时间
    fn last_modified(&self) -> DateTime<Utc>;

    /// 为指定玩家合成默认快照（本地损坏且远端缺失时使用）
    fn default_for(key: &str) -> Self;
}

/// 玩家档案 - 对应远端 PlayerProfile 容器
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerProfile {
    pub player_id: String,
    pub display_name: String,
    pub games_played: u32,
    pub games_won: u32,
    pub current_streak: u32,
    pub best_streak: u32,
    pub total_points: u64,
    /// 文化参与度综合分
    pub heritage_engagement_level: f64,
    pub badges: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub last_played_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PlayerProfile {
    pub fn new(player_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            player_id: player_id.into(),
            display_name: display_name.into(),
            games_played: 0,
            games_won: 0,
            current_streak: 0,
            best_streak: 0,
            total_points: 0,
            heritage_engagement_level: 0.0,
            badges: BTreeSet::new(),
            created_at: now,
            last_played_at: now,
            updated_at: now,
        }
    }

    /// 胜率（0.0 - 1.0）
    pub fn win_rate(&self) -> f64 {
        if self.games_played == 0 {
            0.0
        } else {
            self.games_won as f64 / self.games_played as f64
        }
    }

    /// 记录一局结束后的统计变化
    pub fn apply_game(&mut self, record: &GameRecord) {
        self.games_played += 1;
        if record.won {
            self.games_won += 1;
            self.current_streak += 1;
            self.best_streak = self.best_streak.max(self.current_streak);
        } else {
            self.current_streak = 0;
        }
        self.total_points += u64::from(record.player_score);
        if record.played_at > self.last_played_at {
            self.last_played_at = record.played_at;
        }
        self.updated_at = Utc::now();
    }
}

impl Snapshot for PlayerProfile {
    const ENTITY_TYPE: EntityType = EntityType::Profile;

    fn key(&self) -> &str {
        &self.player_id
    }

    fn last_modified(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn default_for(key: &str) -> Self {
        Self::new(key, "")
    }
}

/// 单局记录 - 创建后不可修改（仅追加）
///
/// 派生全序仅用于在同一 game_id 出现不同内容时做确定性选择。
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GameRecord {
    pub game_id: String,
    pub player_id: String,
    pub played_at: DateTime<Utc>,
    pub difficulty: String,
    pub player_score: u32,
    pub opponent_score: u32,
    pub won: bool,
    pub duration_secs: u32,
}

impl GameRecord {
    pub fn new(
        player_id: impl Into<String>,
        difficulty: impl Into<String>,
        player_score: u32,
        opponent_score: u32,
        duration_secs: u32,
    ) -> Self {
        Self {
            game_id: uuid::Uuid::new_v4().to_string(),
            player_id: player_id.into(),
            played_at: Utc::now(),
            difficulty: difficulty.into(),
            player_score,
            opponent_score,
            won: player_score > opponent_score,
            duration_secs,
        }
    }
}

/// 本地历史快照 - 某玩家的全部对局
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameRecordSet {
    pub player_id: String,
    /// 按 played_at 降序
    pub records: Vec<GameRecord>,
    pub updated_at: DateTime<Utc>,
}

impl GameRecordSet {
    pub fn new(player_id: impl Into<String>) -> Self {
        Self {
            player_id: player_id.into(),
            records: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn from_records(player_id: impl Into<String>, records: Vec<GameRecord>) -> Self {
        let mut set = Self::new(player_id);
        set.records = records;
        sort_records(&mut set.records);
        set
    }

    /// 追加一局；同 game_id 已存在时忽略
    pub fn push(&mut self, record: GameRecord) -> bool {
        if self.contains(&record.game_id) {
            return false;
        }
        self.records.push(record);
        sort_records(&mut self.records);
        self.updated_at = Utc::now();
        true
    }

    pub fn contains(&self, game_id: &str) -> bool {
        self.records.iter().any(|r| r.game_id == game_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// 历史记录排序：played_at 降序，同一时刻按 game_id 升序
pub(crate) fn sort_records(records: &mut [GameRecord]) {
    records.sort_by(|a, b| {
        b.played_at
            .cmp(&a.played_at)
            .then_with(|| a.game_id.cmp(&b.game_id))
    });
}

impl Snapshot for GameRecordSet {
    const ENTITY_TYPE: EntityType = EntityType::GameHistory;

    fn key(&self) -> &str {
        &self.player_id
    }

    fn last_modified(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn default_for(key: &str) -> Self {
        Self::new(key)
    }
}

/// 文化学习进度
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CulturalProgress {
    pub player_id: String,
    /// 已学习的文化条目（传统、牌面故事等）
    pub learned_items: BTreeSet<String>,
    /// 已收听的民乐曲目
    pub listened_tracks: BTreeSet<String>,
    pub completed_lessons: BTreeSet<String>,
    pub milestones: BTreeSet<String>,
    /// quiz_id -> 最高分
    pub quiz_scores: BTreeMap<String, u32>,
    pub knowledge_score: u32,
    pub heritage_engagement_level: f64,
    pub last_updated: DateTime<Utc>,
}

impl CulturalProgress {
    pub fn new(player_id: impl Into<String>) -> Self {
        Self {
            player_id: player_id.into(),
            learned_items: BTreeSet::new(),
            listened_tracks: BTreeSet::new(),
            completed_lessons: BTreeSet::new(),
            milestones: BTreeSet::new(),
            quiz_scores: BTreeMap::new(),
            knowledge_score: 0,
            heritage_engagement_level: 0.0,
            last_updated: Utc::now(),
        }
    }
}

impl Snapshot for CulturalProgress {
    const ENTITY_TYPE: EntityType = EntityType::CulturalProgress;

    fn key(&self) -> &str {
        &self.player_id
    }

    fn last_modified(&self) -> DateTime<Utc> {
        self.last_updated
    }

    fn default_for(key: &str) -> Self {
        Self::new(key)
    }
}

/// 已解锁成就
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnlockedAchievement {
    pub achievement_id: String,
    pub unlocked_at: DateTime<Utc>,
}

/// 成就集合
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AchievementSet {
    pub player_id: String,
    /// achievement_id -> 首次解锁时间
    pub unlocked: BTreeMap<String, DateTime<Utc>>,
    /// achievement_id -> 完成度（0.0 - 1.0）
    pub progress: BTreeMap<String, f64>,
    pub last_updated: DateTime<Utc>,
}

impl AchievementSet {
    pub fn new(player_id: impl Into<String>) -> Self {
        Self {
            player_id: player_id.into(),
            unlocked: BTreeMap::new(),
            progress: BTreeMap::new(),
            last_updated: Utc::now(),
        }
    }

    /// 解锁成就；已解锁时保留更早的时间，返回是否为新解锁
    pub fn unlock(&mut self, achievement_id: impl Into<String>, at: DateTime<Utc>) -> bool {
        let id = achievement_id.into();
        let newly = match self.unlocked.get(&id) {
            Some(existing) if *existing <= at => false,
            Some(_) => {
                self.unlocked.insert(id.clone(), at);
                false
            }
            None => {
                self.unlocked.insert(id.clone(), at);
                true
            }
        };
        self.progress.insert(id, 1.0);
        self.last_updated = Utc::now();
        newly
    }

    pub fn is_unlocked(&self, achievement_id: &str) -> bool {
        self.unlocked.contains_key(achievement_id)
    }

    pub fn ids(&self) -> BTreeSet<String> {
        self.unlocked.keys().cloned().collect()
    }

    pub fn list(&self) -> Vec<UnlockedAchievement> {
        self.unlocked
            .iter()
            .map(|(id, at)| UnlockedAchievement {
                achievement_id: id.clone(),
                unlocked_at: *at,
            })
            .collect()
    }
}

impl Snapshot for AchievementSet {
    const ENTITY_TYPE: EntityType = EntityType::Achievements;

    fn key(&self) -> &str {
        &self.player_id
    }

    fn last_modified(&self) -> DateTime<Utc> {
        self.last_updated
    }

    fn default_for(key: &str) -> Self {
        Self::new(key)
    }
}
