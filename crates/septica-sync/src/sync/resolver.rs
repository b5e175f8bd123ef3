//! 冲突解决器
//!
//! 给定同一实体的本地与远端快照，按字段策略计算合并结果，并报告出现分歧的字段。
//! 所有策略都满足交换律和幂等性：用任一输入再次合并已合并的结果，结果不变，
//! 因此协调器在部分失败后重跑是安全的。

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::storage::entities::{
    sort_records, AchievementSet, CulturalProgress, GameRecord, GameRecordSet, PlayerProfile, Snapshot,
};
use crate::sync::EntityType;

/// 字段合并策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldPolicy {
    /// 取较大值（单调计数、新鲜度时间戳）
    Max,
    /// 取较小值（创建时间）
    Min,
    /// 集合并集
    Union,
    /// 按键取较大值
    PerKeyMax,
    /// 并集，同一 ID 保留最早的时间
    UnionEarliest,
    /// 取 updated_at 较新的一方，相同时取字典序较大的值
    MostRecent,
    /// 只追加记录按 ID 求并集，按时间降序
    AppendOnlyUnion,
    /// 需要人工裁决（当前没有字段使用）
    Manual,
}

/// 合并过程中收集的分歧字段
#[derive(Debug, Default)]
pub struct FieldDiff {
    fields: Vec<&'static str>,
}

impl FieldDiff {
    pub fn compare<V: PartialEq + ?Sized>(&mut self, field: &'static str, local: &V, remote: &V) {
        if local != remote {
            self.fields.push(field);
        }
    }

    pub fn fields(&self) -> &[&'static str] {
        &self.fields
    }

    pub fn into_fields(self) -> Vec<&'static str> {
        self.fields
    }
}

/// 可合并的快照
pub trait Mergeable: Snapshot {
    /// 每个字段的合并策略
    const FIELD_POLICIES: &'static [(&'static str, FieldPolicy)];

    /// 合并两份快照，同时记录分歧字段
    fn merge_with(&self, other: &Self, diff: &mut FieldDiff) -> Self;

    fn merge(&self, other: &Self) -> Self {
        self.merge_with(other, &mut FieldDiff::default())
    }

    fn policy_for(field: &str) -> Option<FieldPolicy> {
        Self::FIELD_POLICIES
            .iter()
            .find(|(name, _)| *name == field)
            .map(|(_, policy)| *policy)
    }
}

fn union<T: Ord + Clone>(a: &BTreeSet<T>, b: &BTreeSet<T>) -> BTreeSet<T> {
    a.union(b).cloned().collect()
}

fn per_key_max<V: PartialOrd + Copy>(a: &BTreeMap<String, V>, b: &BTreeMap<String, V>) -> BTreeMap<String, V> {
    let mut merged = a.clone();
    for (key, value) in b {
        merged
            .entry(key.clone())
            .and_modify(|current| {
                if *value > *current {
                    *current = *value;
                }
            })
            .or_insert(*value);
    }
    merged
}

fn most_recent<'a>(
    local: &'a str,
    local_at: DateTime<Utc>,
    remote: &'a str,
    remote_at: DateTime<Utc>,
) -> &'a str {
    // 空名来自本地合成的默认档案，不参与比较
    match (local.is_empty(), remote.is_empty()) {
        (true, false) => return remote,
        (false, true) => return local,
        _ => {}
    }
    match local_at.cmp(&remote_at) {
        Ordering::Greater => local,
        Ordering::Less => remote,
        Ordering::Equal => local.max(remote),
    }
}

impl Mergeable for PlayerProfile {
    const FIELD_POLICIES: &'static [(&'static str, FieldPolicy)] = &[
        ("display_name", FieldPolicy::MostRecent),
        ("games_played", FieldPolicy::Max),
        ("games_won", FieldPolicy::Max),
        ("current_streak", FieldPolicy::Max),
        ("best_streak", FieldPolicy::Max),
        ("total_points", FieldPolicy::Max),
        ("heritage_engagement_level", FieldPolicy::Max),
        ("badges", FieldPolicy::Union),
        ("created_at", FieldPolicy::Min),
        ("last_played_at", FieldPolicy::Max),
        ("updated_at", FieldPolicy::Max),
    ];

    fn merge_with(&self, other: &Self, diff: &mut FieldDiff) -> Self {
        diff.compare("display_name", &self.display_name, &other.display_name);
        diff.compare("games_played", &self.games_played, &other.games_played);
        diff.compare("games_won", &self.games_won, &other.games_won);
        diff.compare("current_streak", &self.current_streak, &other.current_streak);
        diff.compare("best_streak", &self.best_streak, &other.best_streak);
        diff.compare("total_points", &self.total_points, &other.total_points);
        diff.compare(
            "heritage_engagement_level",
            &self.heritage_engagement_level,
            &other.heritage_engagement_level,
        );
        diff.compare("badges", &self.badges, &other.badges);
        diff.compare("created_at", &self.created_at, &other.created_at);
        diff.compare("last_played_at", &self.last_played_at, &other.last_played_at);
        diff.compare("updated_at", &self.updated_at, &other.updated_at);

        Self {
            player_id: self.player_id.clone(),
            display_name: most_recent(
                &self.display_name,
                self.updated_at,
                &other.display_name,
                other.updated_at,
            )
            .to_string(),
            games_played: self.games_played.max(other.games_played),
            games_won: self.games_won.max(other.games_won),
            current_streak: self.current_streak.max(other.current_streak),
            best_streak: self.best_streak.max(other.best_streak),
            total_points: self.total_points.max(other.total_points),
            heritage_engagement_level: self
                .heritage_engagement_level
                .max(other.heritage_engagement_level),
            badges: union(&self.badges, &other.badges),
            created_at: self.created_at.min(other.created_at),
            last_played_at: self.last_played_at.max(other.last_played_at),
            updated_at: self.updated_at.max(other.updated_at),
        }
    }
}

impl Mergeable for GameRecordSet {
    const FIELD_POLICIES: &'static [(&'static str, FieldPolicy)] = &[
        ("records", FieldPolicy::AppendOnlyUnion),
        ("updated_at", FieldPolicy::Max),
    ];

    fn merge_with(&self, other: &Self, diff: &mut FieldDiff) -> Self {
        let local: BTreeSet<&GameRecord> = self.records.iter().collect();
        let remote: BTreeSet<&GameRecord> = other.records.iter().collect();
        diff.compare("records", &local, &remote);
        diff.compare("updated_at", &self.updated_at, &other.updated_at);

        // 同一 game_id 内容不同时取全序较大者，保证确定性
        let mut by_id: BTreeMap<&str, &GameRecord> = BTreeMap::new();
        for record in self.records.iter().chain(other.records.iter()) {
            by_id
                .entry(record.game_id.as_str())
                .and_modify(|current| {
                    if record > *current {
                        *current = record;
                    }
                })
                .or_insert(record);
        }

        let mut records: Vec<GameRecord> = by_id.into_values().cloned().collect();
        sort_records(&mut records);

        Self {
            player_id: self.player_id.clone(),
            records,
            updated_at: self.updated_at.max(other.updated_at),
        }
    }
}

impl Mergeable for CulturalProgress {
    const FIELD_POLICIES: &'static [(&'static str, FieldPolicy)] = &[
        ("learned_items", FieldPolicy::Union),
        ("listened_tracks", FieldPolicy::Union),
        ("completed_lessons", FieldPolicy::Union),
        ("milestones", FieldPolicy::Union),
        ("quiz_scores", FieldPolicy::PerKeyMax),
        ("knowledge_score", FieldPolicy::Max),
        ("heritage_engagement_level", FieldPolicy::Max),
        ("last_updated", FieldPolicy::Max),
    ];

    fn merge_with(&self, other: &Self, diff: &mut FieldDiff) -> Self {
        diff.compare("learned_items", &self.learned_items, &other.learned_items);
        diff.compare("listened_tracks", &self.listened_tracks, &other.listened_tracks);
        diff.compare("completed_lessons", &self.completed_lessons, &other.completed_lessons);
        diff.compare("milestones", &self.milestones, &other.milestones);
        diff.compare("quiz_scores", &self.quiz_scores, &other.quiz_scores);
        diff.compare("knowledge_score", &self.knowledge_score, &other.knowledge_score);
        diff.compare(
            "heritage_engagement_level",
            &self.heritage_engagement_level,
            &other.heritage_engagement_level,
        );
        diff.compare("last_updated", &self.last_updated, &other.last_updated);

        Self {
            player_id: self.player_id.clone(),
            learned_items: union(&self.learned_items, &other.learned_items),
            listened_tracks: union(&self.listened_tracks, &other.listened_tracks),
            completed_lessons: union(&self.completed_lessons, &other.completed_lessons),
            milestones: union(&self.milestones, &other.milestones),
            quiz_scores: per_key_max(&self.quiz_scores, &other.quiz_scores),
            knowledge_score: self.knowledge_score.max(other.knowledge_score),
            heritage_engagement_level: self
                .heritage_engagement_level
                .max(other.heritage_engagement_level),
            last_updated: self.last_updated.max(other.last_updated),
        }
    }
}

impl Mergeable for AchievementSet {
    const FIELD_POLICIES: &'static [(&'static str, FieldPolicy)] = &[
        ("unlocked", FieldPolicy::UnionEarliest),
        ("progress", FieldPolicy::PerKeyMax),
        ("last_updated", FieldPolicy::Max),
    ];

    fn merge_with(&self, other: &Self, diff: &mut FieldDiff) -> Self {
        diff.compare("unlocked", &self.unlocked, &other.unlocked);
        diff.compare("progress", &self.progress, &other.progress);
        diff.compare("last_updated", &self.last_updated, &other.last_updated);

        let mut unlocked = self.unlocked.clone();
        for (id, at) in &other.unlocked {
            unlocked
                .entry(id.clone())
                .and_modify(|current| {
                    if *at < *current {
                        *current = *at;
                    }
                })
                .or_insert(*at);
        }

        Self {
            player_id: self.player_id.clone(),
            unlocked,
            progress: per_key_max(&self.progress, &other.progress),
            last_updated: self.last_updated.max(other.last_updated),
        }
    }
}

/// 一次冲突解决的完整记录（阶段内使用）
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictRecord<T> {
    pub entity_type: EntityType,
    pub key: String,
    pub local: T,
    pub remote: T,
    pub merged: T,
    pub diverged_fields: Vec<&'static str>,
    pub requires_attention: bool,
    pub resolved_at: DateTime<Utc>,
}

impl<T> ConflictRecord<T> {
    pub fn has_divergence(&self) -> bool {
        !self.diverged_fields.is_empty()
    }

    pub fn summary(&self) -> ConflictSummary {
        ConflictSummary {
            entity_type: self.entity_type,
            key: self.key.clone(),
            diverged_fields: self.diverged_fields.iter().map(|f| f.to_string()).collect(),
            requires_attention: self.requires_attention,
            resolved_at: self.resolved_at.timestamp_millis(),
        }
    }
}

/// 冲突摘要（用于事件与诊断）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictSummary {
    pub entity_type: EntityType,
    pub key: String,
    pub diverged_fields: Vec<String>,
    pub requires_attention: bool,
    /// UTC 毫秒
    pub resolved_at: i64,
}

/// 冲突解决器，保留最近的冲突摘要用于诊断
pub struct ConflictResolver {
    history: Mutex<VecDeque<ConflictSummary>>,
    history_limit: usize,
}

impl ConflictResolver {
    pub fn new(history_limit: usize) -> Self {
        Self {
            history: Mutex::new(VecDeque::with_capacity(history_limit)),
            history_limit,
        }
    }

    pub fn resolve<T: Mergeable>(&self, local: &T, remote: &T) -> ConflictRecord<T> {
        let mut diff = FieldDiff::default();
        let merged = local.merge_with(remote, &mut diff);
        let diverged_fields = diff.into_fields();
        let requires_attention = diverged_fields
            .iter()
            .any(|field| T::policy_for(field) == Some(FieldPolicy::Manual));

        let record = ConflictRecord {
            entity_type: T::ENTITY_TYPE,
            key: local.key().to_string(),
            local: local.clone(),
            remote: remote.clone(),
            merged,
            diverged_fields,
            requires_attention,
            resolved_at: Utc::now(),
        };

        if record.has_divergence() {
            if record.requires_attention {
                warn!(
                    "⚠️ 冲突需要人工处理: {}/{} 字段 {:?}",
                    record.entity_type, record.key, record.diverged_fields
                );
            } else {
                info!(
                    "🔀 冲突已自动合并: {}/{} 字段 {:?}",
                    record.entity_type, record.key, record.diverged_fields
                );
            }
            self.remember(record.summary());
        } else {
            debug!("本地与远端一致: {}/{}", record.entity_type, record.key);
        }

        record
    }

    fn remember(&self, summary: ConflictSummary) {
        if self.history_limit == 0 {
            return;
        }
        let mut history = self.history.lock();
        while history.len() >= self.history_limit {
            history.pop_front();
        }
        history.push_back(summary);
    }

    /// 最近的冲突摘要（旧的在前）
    pub fn recent(&self) -> Vec<ConflictSummary> {
        self.history.lock().iter().cloned().collect()
    }
}
