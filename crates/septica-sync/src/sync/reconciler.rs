//! 拉取 / 合并 / 落盘 / 推送的公共流程
//!
//! 同步阶段与离线队列处理共用这里的逻辑：
//! - 两端都有 → 合并 → 本地落盘 → 推送合并结果
//! - 只有远端 → 落盘（本地缺失时远端为准）
//! - 只有本地 → 推送（远端缺失时本地为准）
//!
//! 本地读改写在键锁内完成；远端 I/O 不持锁。

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::remote::{RecordQuery, RecordType, RemoteChange, RemoteRecord, RemoteRecordStore, RemoteRecordStoreExt};
use crate::storage::entities::{GameRecord, GameRecordSet, Snapshot};
use crate::storage::local_store::{LocalRead, LocalStore};
use crate::sync::resolver::{ConflictResolver, ConflictSummary, Mergeable};

/// 单个阶段对本地 / 远端做了什么
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PhaseAction {
    /// 两端合并
    Merged,
    /// 采用远端
    Pulled,
    /// 推送本地
    Pushed,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhaseOutcome {
    pub action: PhaseAction,
    pub conflicts: Vec<ConflictSummary>,
}

/// 拉取阶段的结果
#[derive(Debug, Clone)]
pub struct Pulled<T> {
    pub key: String,
    pub local: LocalRead<T>,
    pub remote: Option<RemoteRecord<T>>,
}

impl<T> Pulled<T> {
    /// 两端都有快照，需要冲突合并
    pub fn needs_merge(&self) -> bool {
        self.local.is_found() && self.remote.is_some()
    }
}

/// 历史阶段的拉取结果
#[derive(Debug, Clone)]
pub struct PulledHistory {
    pub player_id: String,
    pub local: LocalRead<GameRecordSet>,
    pub remote: Vec<GameRecord>,
}

impl PulledHistory {
    pub fn needs_merge(&self) -> bool {
        self.local.is_found() && !self.remote.is_empty()
    }
}

/// 记住的本设备推送 change tag 数量
const OWN_TAG_LIMIT: usize = 128;

pub struct Reconciler {
    local: Arc<LocalStore>,
    remote: Arc<dyn RemoteRecordStore>,
    resolver: Arc<ConflictResolver>,
    max_conflict_attempts: u32,
    /// 本设备最近写入远端产生的 change tag
    own_tags: Mutex<VecDeque<String>>,
}

impl Reconciler {
    pub fn new(
        local: Arc<LocalStore>,
        remote: Arc<dyn RemoteRecordStore>,
        resolver: Arc<ConflictResolver>,
        max_conflict_attempts: u32,
    ) -> Self {
        Self {
            local,
            remote,
            resolver,
            max_conflict_attempts: max_conflict_attempts.max(1),
            own_tags: Mutex::new(VecDeque::with_capacity(OWN_TAG_LIMIT)),
        }
    }

    fn remember_push(&self, change_tag: &str) {
        let mut tags = self.own_tags.lock();
        if tags.len() == OWN_TAG_LIMIT {
            tags.pop_front();
        }
        tags.push_back(change_tag.to_string());
    }

    /// 变更通知是否由本设备的写入产生
    pub fn is_own_change(&self, change: &RemoteChange) -> bool {
        match change.change_tag.as_deref() {
            Some(tag) => self.own_tags.lock().iter().any(|own| own == tag),
            None => false,
        }
    }

    pub fn resolver(&self) -> &Arc<ConflictResolver> {
        &self.resolver
    }

    /// 拉取远端快照并读取本地快照
    pub async fn pull<T: Mergeable>(&self, key: &str) -> Result<Pulled<T>> {
        let remote = self
            .remote
            .fetch_typed::<T>(T::ENTITY_TYPE.record_type(), key)
            .await?;
        let local = self.local.get::<T>(key).await?;

        debug!(
            "拉取 {}/{}: local={} remote={}",
            T::ENTITY_TYPE,
            key,
            local.is_found(),
            remote.is_some()
        );
        Ok(Pulled {
            key: key.to_string(),
            local,
            remote,
        })
    }

    /// 合并、落盘并推送
    ///
    /// `pending` 是离线队列中等待推送的本地值，会先并入本地快照。
    pub async fn settle<T: Mergeable>(&self, pulled: Pulled<T>, pending: Option<&T>) -> Result<PhaseOutcome> {
        let Pulled {
            key,
            local: observed,
            remote,
        } = pulled;
        let mut conflicts = Vec::new();

        let (action, push) = {
            let _guard = self.local.lock(T::ENTITY_TYPE, &key).await;

            // 锁内重新读取，避免覆盖拉取期间的本地写入
            let current = self.local.get::<T>(&key).await?;
            let corrupt = current.is_corrupt() || observed.is_corrupt();
            let stored = current.into_option();

            let candidate = match (stored.as_ref(), pending) {
                (Some(local), Some(pending)) => Some(local.merge(pending)),
                (Some(local), None) => Some(local.clone()),
                (None, Some(pending)) => Some(pending.clone()),
                (None, None) => None,
            };

            match (candidate, remote) {
                (Some(local), Some(remote)) => {
                    let record = self.resolver.resolve(&local, &remote.value);
                    if record.has_divergence() {
                        conflicts.push(record.summary());
                    }
                    let merged = record.merged;

                    if stored.as_ref() != Some(&merged) {
                        self.local.put(&merged).await?;
                    }
                    if merged == remote.value {
                        let action = if stored.as_ref() == Some(&merged) {
                            PhaseAction::Unchanged
                        } else {
                            PhaseAction::Merged
                        };
                        (action, None)
                    } else {
                        (PhaseAction::Merged, Some((merged, Some(remote.change_tag))))
                    }
                }
                (None, Some(remote)) => {
                    info!("本地缺失，采用远端快照: {}/{}", T::ENTITY_TYPE, key);
                    self.local.put(&remote.value).await?;
                    (PhaseAction::Pulled, None)
                }
                (Some(local), None) => {
                    if stored.as_ref() != Some(&local) {
                        self.local.put(&local).await?;
                    }
                    (PhaseAction::Pushed, Some((local, None)))
                }
                (None, None) if corrupt => {
                    warn!("本地快照损坏且远端缺失，使用默认值: {}/{}", T::ENTITY_TYPE, key);
                    let fallback = T::default_for(&key);
                    self.local.put(&fallback).await?;
                    (PhaseAction::Pushed, Some((fallback, None)))
                }
                (None, None) => (PhaseAction::Unchanged, None),
            }
        };

        if let Some((value, tag)) = push {
            self.push_with_retry(value, tag, &mut conflicts).await?;
        }

        Ok(PhaseOutcome { action, conflicts })
    }

    /// 携带 change tag 推送；遇到 RecordChanged 时与服务端记录重新合并后再推送
    async fn push_with_retry<T: Mergeable>(
        &self,
        mut value: T,
        mut tag: Option<String>,
        conflicts: &mut Vec<ConflictSummary>,
    ) -> Result<()> {
        let record_type = T::ENTITY_TYPE.record_type();
        let key = value.key().to_string();

        for attempt in 1..=self.max_conflict_attempts {
            match self
                .remote
                .save_typed(record_type, &key, &value, tag.as_deref())
                .await
            {
                Ok(saved) => {
                    self.remember_push(&saved.change_tag);
                    debug!("推送成功: {}/{} tag={}", record_type, key, saved.change_tag);
                    return Ok(());
                }
                Err(SyncError::RecordChanged { server_record, .. }) => {
                    warn!(
                        "远端记录已变更，重新合并 ({}/{}): {}/{}",
                        attempt, self.max_conflict_attempts, record_type, key
                    );
                    let server: T = server_record.decode()?;

                    let _guard = self.local.lock(T::ENTITY_TYPE, &key).await;
                    let stored = self.local.get::<T>(&key).await?.into_option();
                    let base = match stored.as_ref() {
                        Some(local) => local.merge(&value),
                        None => value.clone(),
                    };

                    let record = self.resolver.resolve(&base, &server);
                    if record.has_divergence() {
                        conflicts.push(record.summary());
                    }
                    if stored.as_ref() != Some(&record.merged) {
                        self.local.put(&record.merged).await?;
                    }
                    if record.merged == server {
                        return Ok(());
                    }

                    value = record.merged;
                    tag = Some(server_record.change_tag);
                }
                Err(e) => return Err(e),
            }
        }

        Err(SyncError::RecordConflict(format!(
            "{}/{} 在 {} 次重新合并后仍冲突",
            record_type, key, self.max_conflict_attempts
        )))
    }

    /// 拉取远端对局记录并读取本地历史
    pub async fn pull_history(&self, player_id: &str) -> Result<PulledHistory> {
        let remote = self
            .remote
            .query_typed::<GameRecord>(RecordType::GameRecord, &RecordQuery::by_player(player_id))
            .await?
            .into_iter()
            .map(|record| record.value)
            .collect();
        let local = self.local.get::<GameRecordSet>(player_id).await?;

        Ok(PulledHistory {
            player_id: player_id.to_string(),
            local,
            remote,
        })
    }

    /// 合并历史并在远端补齐缺失的对局
    pub async fn settle_history(&self, pulled: PulledHistory) -> Result<PhaseOutcome> {
        let PulledHistory {
            player_id,
            local: observed,
            remote,
        } = pulled;
        let mut conflicts = Vec::new();

        let (action, to_create) = {
            let _guard = self.local.lock(GameRecordSet::ENTITY_TYPE, &player_id).await;
            let current = self.local.get::<GameRecordSet>(&player_id).await?;
            let corrupt = current.is_corrupt() || observed.is_corrupt();

            match current.into_option() {
                Some(local) if remote.is_empty() => {
                    let action = if local.is_empty() {
                        PhaseAction::Unchanged
                    } else {
                        PhaseAction::Pushed
                    };
                    (action, local.records)
                }
                Some(local) => {
                    let mut remote_set = GameRecordSet::from_records(&player_id, remote);
                    // 远端没有容器级时间戳，沿用本地值
                    remote_set.updated_at = local.updated_at;

                    let record = self.resolver.resolve(&local, &remote_set);
                    if record.has_divergence() {
                        conflicts.push(record.summary());
                    }
                    let merged = record.merged;
                    if merged != local {
                        self.local.put(&merged).await?;
                    }

                    let missing: Vec<GameRecord> = merged
                        .records
                        .iter()
                        .filter(|r| !remote_set.contains(&r.game_id))
                        .cloned()
                        .collect();
                    let action = if missing.is_empty() && merged == local {
                        PhaseAction::Unchanged
                    } else {
                        PhaseAction::Merged
                    };
                    (action, missing)
                }
                None if !remote.is_empty() => {
                    info!("本地历史缺失，采用远端 {} 局记录", remote.len());
                    self.local
                        .put(&GameRecordSet::from_records(&player_id, remote))
                        .await?;
                    (PhaseAction::Pulled, Vec::new())
                }
                None => {
                    if corrupt {
                        self.local.put(&GameRecordSet::default_for(&player_id)).await?;
                    }
                    (PhaseAction::Unchanged, Vec::new())
                }
            }
        };

        let created = self.create_records(&to_create).await?;
        if created > 0 {
            info!("远端补齐 {} 局对局记录", created);
        }

        Ok(PhaseOutcome { action, conflicts })
    }

    /// 在远端创建对局记录；记录不可变，已存在的直接跳过
    pub async fn create_records(&self, records: &[GameRecord]) -> Result<usize> {
        let mut created = 0;
        for record in records {
            match self
                .remote
                .save_typed(RecordType::GameRecord, &record.game_id, record, None)
                .await
            {
                Ok(saved) => {
                    self.remember_push(&saved.change_tag);
                    created += 1;
                }
                Err(SyncError::RecordChanged { .. }) => {
                    debug!("对局记录已存在于远端: {}", record.game_id);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(created)
    }
}
