//! 远端记录存储适配层
//!
//! 远端是一个按记录类型划分容器的记录数据库，每条记录带服务端分配的 change tag。
//! 写入时携带调用方最后看到的 tag；服务端 tag 不一致时返回 `SyncError::RecordChanged`，
//! 并附带服务端当前记录，这是唯一的冲突检测信号。

pub mod http;
pub mod memory;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::{Result, SyncError};

pub use http::{HttpRecordStore, HttpRemoteConfig};
pub use memory::InMemoryRecordStore;

/// 远端记录容器类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RecordType {
    PlayerProfile,
    GameRecord,
    CulturalProgress,
    Achievements,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::PlayerProfile => "PlayerProfile",
            RecordType::GameRecord => "GameRecord",
            RecordType::CulturalProgress => "CulturalProgress",
            RecordType::Achievements => "Achievements",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 远端原始记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub record_type: RecordType,
    pub key: String,
    pub payload: serde_json::Value,
    /// 服务端版本标记
    pub change_tag: String,
    pub modified_at: DateTime<Utc>,
}

impl RawRecord {
    /// 将载荷解码为具体类型
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            SyncError::Serialization(format!(
                "解码远端记录失败 {}/{}: {}",
                self.record_type, self.key, e
            ))
        })
    }
}

/// 记录查询条件
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordQuery {
    /// 按载荷中的 player_id 过滤
    pub player_id: Option<String>,
    /// 只返回该时间之后修改的记录
    pub modified_since: Option<DateTime<Utc>>,
}

impl RecordQuery {
    pub fn by_player(player_id: impl Into<String>) -> Self {
        Self {
            player_id: Some(player_id.into()),
            modified_since: None,
        }
    }

    pub fn modified_since(mut self, since: DateTime<Utc>) -> Self {
        self.modified_since = Some(since);
        self
    }

    /// 判断记录是否满足查询条件
    pub fn matches(&self, record: &RawRecord) -> bool {
        if let Some(ref player_id) = self.player_id {
            let owner = record.payload.get("player_id").and_then(|v| v.as_str());
            if owner != Some(player_id.as_str()) {
                return false;
            }
        }
        if let Some(since) = self.modified_since {
            if record.modified_at <= since {
                return false;
            }
        }
        true
    }
}

/// 带外的远端变更通知（推送触发同步）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteChange {
    pub record_type: RecordType,
    pub key: String,
    /// 写入后的 change tag；为空时无法判断来源
    #[serde(default)]
    pub change_tag: Option<String>,
}

/// 远端记录存储
///
/// `expected_tag` 为 `None` 表示创建：记录已存在时返回 `RecordChanged`。
#[async_trait]
pub trait RemoteRecordStore: Send + Sync {
    /// 读取单条记录，不存在时返回 None
    async fn fetch(&self, record_type: RecordType, key: &str) -> Result<Option<RawRecord>>;

    /// 写入记录，返回带新 change tag 的记录
    async fn save(
        &self,
        record_type: RecordType,
        key: &str,
        payload: serde_json::Value,
        expected_tag: Option<&str>,
    ) -> Result<RawRecord>;

    /// 按条件查询某一类型的记录
    async fn query(&self, record_type: RecordType, query: &RecordQuery) -> Result<Vec<RawRecord>>;

    /// 订阅远端变更
    fn subscribe(&self) -> broadcast::Receiver<RemoteChange>;
}

/// 已解码的远端记录
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRecord<T> {
    pub value: T,
    pub change_tag: String,
}

impl<T: DeserializeOwned> RemoteRecord<T> {
    pub fn from_raw(raw: &RawRecord) -> Result<Self> {
        Ok(Self {
            value: raw.decode()?,
            change_tag: raw.change_tag.clone(),
        })
    }
}

/// 类型安全的远端读写扩展
#[async_trait]
pub trait RemoteRecordStoreExt {
    async fn fetch_typed<T>(&self, record_type: RecordType, key: &str) -> Result<Option<RemoteRecord<T>>>
    where
        T: DeserializeOwned + Send;

    async fn save_typed<T>(
        &self,
        record_type: RecordType,
        key: &str,
        value: &T,
        expected_tag: Option<&str>,
    ) -> Result<RemoteRecord<T>>
    where
        T: Serialize + DeserializeOwned + Send + Sync;

    async fn query_typed<T>(&self, record_type: RecordType, query: &RecordQuery) -> Result<Vec<RemoteRecord<T>>>
    where
        T: DeserializeOwned + Send;
}

#[async_trait]
impl<S> RemoteRecordStoreExt for S
where
    S: RemoteRecordStore + ?Sized,
{
    async fn fetch_typed<T>(&self, record_type: RecordType, key: &str) -> Result<Option<RemoteRecord<T>>>
    where
        T: DeserializeOwned + Send,
    {
        match self.fetch(record_type, key).await? {
            Some(raw) => Ok(Some(RemoteRecord::from_raw(&raw)?)),
            None => Ok(None),
        }
    }

    async fn save_typed<T>(
        &self,
        record_type: RecordType,
        key: &str,
        value: &T,
        expected_tag: Option<&str>,
    ) -> Result<RemoteRecord<T>>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
    {
        let payload = serde_json::to_value(value)?;
        let saved = self.save(record_type, key, payload, expected_tag).await?;
        RemoteRecord::from_raw(&saved)
    }

    async fn query_typed<T>(&self, record_type: RecordType, query: &RecordQuery) -> Result<Vec<RemoteRecord<T>>>
    where
        T: DeserializeOwned + Send,
    {
        self.query(record_type, query)
            .await?
            .iter()
            .map(RemoteRecord::from_raw)
            .collect()
    }
}

#[cfg(test)]
pub mod test_helpers {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use parking_lot::Mutex;

    type FetchHook = Box<dyn Fn() + Send + Sync>;

    /// 测试用：按记录类型注入 RemoteUnavailable 的包装存储
    pub struct FlakyRecordStore {
        inner: Arc<dyn RemoteRecordStore>,
        /// 记录类型 -> 剩余失败次数（u32::MAX 表示一直失败）
        failures: Mutex<HashMap<RecordType, u32>>,
        save_calls: AtomicUsize,
        /// fetch/query 访问过的记录类型（按调用顺序）
        reads: Mutex<Vec<RecordType>>,
        fetch_hooks: Mutex<HashMap<RecordType, FetchHook>>,
    }

    impl FlakyRecordStore {
        pub fn new(inner: Arc<dyn RemoteRecordStore>) -> Self {
            Self {
                inner,
                failures: Mutex::new(HashMap::new()),
                save_calls: AtomicUsize::new(0),
                reads: Mutex::new(Vec::new()),
                fetch_hooks: Mutex::new(HashMap::new()),
            }
        }

        /// 该类型的 fetch 返回前调用 hook
        pub fn on_fetch(&self, record_type: RecordType, hook: impl Fn() + Send + Sync + 'static) {
            self.fetch_hooks.lock().insert(record_type, Box::new(hook));
        }

        pub fn reads(&self) -> Vec<RecordType> {
            self.reads.lock().clone()
        }

        /// 接下来 n 次该类型的调用失败
        pub fn fail_next(&self, record_type: RecordType, n: u32) {
            self.failures.lock().insert(record_type, n);
        }

        pub fn fail_always(&self, record_type: RecordType) {
            self.fail_next(record_type, u32::MAX);
        }

        pub fn heal(&self, record_type: RecordType) {
            self.failures.lock().remove(&record_type);
        }

        pub fn save_calls(&self) -> usize {
            self.save_calls.load(Ordering::SeqCst)
        }

        fn check(&self, record_type: RecordType) -> Result<()> {
            let mut failures = self.failures.lock();
            match failures.get_mut(&record_type) {
                Some(0) | None => Ok(()),
                Some(remaining) => {
                    if *remaining != u32::MAX {
                        *remaining -= 1;
                    }
                    Err(SyncError::RemoteUnavailable(format!(
                        "injected failure for {}",
                        record_type
                    )))
                }
            }
        }
    }

    #[async_trait]
    impl RemoteRecordStore for FlakyRecordStore {
        async fn fetch(&self, record_type: RecordType, key: &str) -> Result<Option<RawRecord>> {
            self.reads.lock().push(record_type);
            self.check(record_type)?;
            let fetched = self.inner.fetch(record_type, key).await;
            if let Some(hook) = self.fetch_hooks.lock().get(&record_type) {
                hook();
            }
            fetched
        }

        async fn save(
            &self,
            record_type: RecordType,
            key: &str,
            payload: serde_json::Value,
            expected_tag: Option<&str>,
        ) -> Result<RawRecord> {
            self.save_calls.fetch_add(1, Ordering::SeqCst);
            self.check(record_type)?;
            self.inner.save(record_type, key, payload, expected_tag).await
        }

        async fn query(&self, record_type: RecordType, query: &RecordQuery) -> Result<Vec<RawRecord>> {
            self.reads.lock().push(record_type);
            self.check(record_type)?;
            self.inner.query(record_type, query).await
        }

        fn subscribe(&self) -> broadcast::Receiver<RemoteChange> {
            self.inner.subscribe()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(payload: serde_json::Value) -> RawRecord {
        RawRecord {
            record_type: RecordType::GameRecord,
            key: "g1".to_string(),
            payload,
            change_tag: "t1".to_string(),
            modified_at: Utc::now(),
        }
    }

    #[test]
    fn test_query_matches_player_and_time() {
        let raw = record(json!({ "player_id": "p1" }));

        assert!(RecordQuery::default().matches(&raw));
        assert!(RecordQuery::by_player("p1").matches(&raw));
        assert!(!RecordQuery::by_player("p2").matches(&raw));

        let later = raw.modified_at + chrono::Duration::seconds(1);
        assert!(!RecordQuery::by_player("p1").modified_since(later).matches(&raw));
    }

    #[test]
    fn test_decode_failure_is_serialization_error() {
        let raw = record(json!({ "player_id": 42 }));
        let result: Result<crate::storage::entities::GameRecordSet> = raw.decode();
        assert!(matches!(result, Err(SyncError::Serialization(_))));
    }

    #[tokio::test]
    async fn test_typed_helpers_round_through_store() {
        let store = InMemoryRecordStore::new();
        let profile = crate::storage::entities::PlayerProfile::new("p1", "Ana");

        let saved = store
            .save_typed(RecordType::PlayerProfile, "p1", &profile, None)
            .await
            .unwrap();
        assert_eq!(saved.value, profile);

        let fetched = store
            .fetch_typed::<crate::storage::entities::PlayerProfile>(RecordType::PlayerProfile, "p1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.change_tag, saved.change_tag);
    }
}
