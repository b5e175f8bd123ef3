//! 进程内远端记录存储
//!
//! 用于演示、离线测试以及多设备模拟。行为与真实服务端一致：
//! 每次写入生成新的 change tag，过期 tag 写入返回 `RecordChanged`。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use tracing::debug;

use super::{RawRecord, RecordQuery, RecordType, RemoteChange, RemoteRecordStore};
use crate::error::{Result, SyncError};

pub struct InMemoryRecordStore {
    records: Mutex<HashMap<(RecordType, String), RawRecord>>,
    revision: AtomicU64,
    online: AtomicBool,
    changes: broadcast::Sender<RemoteChange>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            records: Mutex::new(HashMap::new()),
            revision: AtomicU64::new(0),
            online: AtomicBool::new(true),
            changes,
        }
    }

    /// 模拟断网 / 恢复
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// 直接读取记录（不受在线状态影响）
    pub fn get(&self, record_type: RecordType, key: &str) -> Option<RawRecord> {
        self.records
            .lock()
            .get(&(record_type, key.to_string()))
            .cloned()
    }

    pub fn record_count(&self, record_type: RecordType) -> usize {
        self.records
            .lock()
            .keys()
            .filter(|(rt, _)| *rt == record_type)
            .count()
    }

    fn ensure_online(&self) -> Result<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(SyncError::RemoteUnavailable("远端存储离线".to_string()))
        }
    }

    fn change_tag(payload: &serde_json::Value, revision: u64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(payload.to_string().as_bytes());
        hasher.update(revision.to_be_bytes());
        let digest = hex::encode(hasher.finalize());
        digest[..16].to_string()
    }
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteRecordStore for InMemoryRecordStore {
    async fn fetch(&self, record_type: RecordType, key: &str) -> Result<Option<RawRecord>> {
        self.ensure_online()?;
        Ok(self.get(record_type, key))
    }

    async fn save(
        &self,
        record_type: RecordType,
        key: &str,
        payload: serde_json::Value,
        expected_tag: Option<&str>,
    ) -> Result<RawRecord> {
        self.ensure_online()?;

        let saved = {
            let mut records = self.records.lock();
            let slot = (record_type, key.to_string());

            if let Some(current) = records.get(&slot) {
                if expected_tag != Some(current.change_tag.as_str()) {
                    debug!(
                        "change tag 过期: {}/{} expected={:?} current={}",
                        record_type, key, expected_tag, current.change_tag
                    );
                    return Err(SyncError::RecordChanged {
                        record_type,
                        key: key.to_string(),
                        server_record: Box::new(current.clone()),
                    });
                }
            }

            let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
            let record = RawRecord {
                record_type,
                key: key.to_string(),
                change_tag: Self::change_tag(&payload, revision),
                payload,
                modified_at: Utc::now(),
            };
            records.insert(slot, record.clone());
            record
        };

        let _ = self.changes.send(RemoteChange {
            record_type,
            key: key.to_string(),
            change_tag: Some(saved.change_tag.clone()),
        });

        Ok(saved)
    }

    async fn query(&self, record_type: RecordType, query: &RecordQuery) -> Result<Vec<RawRecord>> {
        self.ensure_online()?;

        let mut results: Vec<RawRecord> = self
            .records
            .lock()
            .values()
            .filter(|r| r.record_type == record_type && query.matches(r))
            .cloned()
            .collect();
        results.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(results)
    }

    fn subscribe(&self) -> broadcast::Receiver<RemoteChange> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_stale_tag_returns_server_record() {
        let store = InMemoryRecordStore::new();

        let first = store
            .save(RecordType::PlayerProfile, "p1", json!({ "games_won": 1 }), None)
            .await
            .unwrap();
        let second = store
            .save(
                RecordType::PlayerProfile,
                "p1",
                json!({ "games_won": 2 }),
                Some(&first.change_tag),
            )
            .await
            .unwrap();
        assert_ne!(first.change_tag, second.change_tag);

        let err = store
            .save(
                RecordType::PlayerProfile,
                "p1",
                json!({ "games_won": 3 }),
                Some(&first.change_tag),
            )
            .await
            .unwrap_err();
        match err {
            SyncError::RecordChanged { server_record, .. } => {
                assert_eq!(server_record.payload, json!({ "games_won": 2 }));
                assert_eq!(server_record.change_tag, second.change_tag);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_create_on_existing_key_conflicts() {
        let store = InMemoryRecordStore::new();
        store
            .save(RecordType::GameRecord, "g1", json!({ "player_id": "p1" }), None)
            .await
            .unwrap();

        let result = store
            .save(RecordType::GameRecord, "g1", json!({ "player_id": "p1" }), None)
            .await;
        assert!(matches!(result, Err(SyncError::RecordChanged { .. })));
        assert_eq!(store.record_count(RecordType::GameRecord), 1);
    }

    #[tokio::test]
    async fn test_offline_and_subscription() {
        let store = InMemoryRecordStore::new();
        let mut changes = store.subscribe();

        store.set_online(false);
        let result = store.fetch(RecordType::Achievements, "p1").await;
        assert!(matches!(result, Err(SyncError::RemoteUnavailable(_))));

        store.set_online(true);
        store
            .save(RecordType::Achievements, "p1", json!({ "player_id": "p1" }), None)
            .await
            .unwrap();

        let change = changes.recv().await.unwrap();
        assert_eq!(change.record_type, RecordType::Achievements);
        assert_eq!(change.key, "p1");
    }

    #[tokio::test]
    async fn test_query_filters_by_player() {
        let store = InMemoryRecordStore::new();
        for (key, player) in [("g1", "p1"), ("g2", "p2"), ("g3", "p1")] {
            store
                .save(RecordType::GameRecord, key, json!({ "player_id": player }), None)
                .await
                .unwrap();
        }

        let results = store
            .query(RecordType::GameRecord, &RecordQuery::by_player("p1"))
            .await
            .unwrap();
        let keys: Vec<_> = results.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["g1", "g3"]);
    }
}
