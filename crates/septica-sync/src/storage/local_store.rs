//! 本地快照存储
//!
//! 每个 (实体类型, key) 只有一份快照，存放在 `"{local_key}:{key}"` 下。
//! 单键写入由 sled 保证原子性；读改写序列通过 [`LocalStore::lock`] 按键串行化。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::error::{ErrorReporter, IntegrityIssue, Result, SyncError};
use crate::events::{EventManager, SyncEvent};
use crate::storage::entities::Snapshot;
use crate::storage::kv::{keys, KvStore};
use crate::sync::EntityType;

/// 本地读取结果
#[derive(Debug, Clone, PartialEq)]
pub enum LocalRead<T> {
    Found(T),
    Missing,
    /// 值已损坏，已被丢弃并上报
    Corrupt,
}

impl<T> LocalRead<T> {
    pub fn into_option(self) -> Option<T> {
        match self {
            LocalRead::Found(value) => Some(value),
            LocalRead::Missing | LocalRead::Corrupt => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, LocalRead::Found(_))
    }

    pub fn is_corrupt(&self) -> bool {
        matches!(self, LocalRead::Corrupt)
    }
}

pub struct LocalStore {
    kv: Arc<KvStore>,
    /// 按键的写锁（与 sync_locks 同样的按需创建方式）
    key_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    reporter: Arc<dyn ErrorReporter>,
    events: Arc<EventManager>,
    #[cfg(test)]
    fail_meta_writes: std::sync::atomic::AtomicBool,
}

impl LocalStore {
    pub fn new(kv: Arc<KvStore>, reporter: Arc<dyn ErrorReporter>, events: Arc<EventManager>) -> Self {
        Self {
            kv,
            key_locks: Mutex::new(HashMap::new()),
            reporter,
            events,
            #[cfg(test)]
            fail_meta_writes: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn kv(&self) -> &Arc<KvStore> {
        &self.kv
    }

    fn storage_key(entity_type: EntityType, key: &str) -> String {
        format!("{}:{}", entity_type.local_key(), key)
    }

    /// 获取某个键的写锁，持有期间其他读改写序列等待
    pub async fn lock(&self, entity_type: EntityType, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.key_locks.lock().await;
            locks
                .entry(Self::storage_key(entity_type, key))
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// 读取快照；无法解码的值会被删除并作为完整性问题上报
    pub async fn get<T: Snapshot>(&self, key: &str) -> Result<LocalRead<T>> {
        let storage_key = Self::storage_key(T::ENTITY_TYPE, key);

        match self.kv.get::<_, T>(&storage_key).await {
            Ok(Some(value)) => Ok(LocalRead::Found(value)),
            Ok(None) => Ok(LocalRead::Missing),
            Err(SyncError::Serialization(reason)) => {
                warn!("本地快照损坏，已丢弃: {} ({})", storage_key, reason);
                self.kv.delete(&storage_key).await?;

                let issue = IntegrityIssue::new(
                    Some(T::ENTITY_TYPE),
                    format!("本地快照 {} 无法解码，已丢弃并以远端为准: {}", storage_key, reason),
                );
                self.reporter.report(&issue);
                self.events.emit(SyncEvent::IntegrityWarning(issue)).await;

                Ok(LocalRead::Corrupt)
            }
            Err(e) => Err(e),
        }
    }

    /// 原子覆盖写入
    pub async fn put<T: Snapshot>(&self, snapshot: &T) -> Result<()> {
        let storage_key = Self::storage_key(T::ENTITY_TYPE, snapshot.key());
        self.kv.set(&storage_key, snapshot).await?;
        self.kv.flush().await?;
        debug!("本地快照已写入: {}", storage_key);
        Ok(())
    }

    /// 在键锁内读改写；快照不存在时从默认值开始
    pub async fn update<T, F>(&self, key: &str, mutate: F) -> Result<T>
    where
        T: Snapshot,
        F: FnOnce(&mut T),
    {
        let _guard = self.lock(T::ENTITY_TYPE, key).await;

        let mut snapshot = self
            .get::<T>(key)
            .await?
            .into_option()
            .unwrap_or_else(|| T::default_for(key));
        mutate(&mut snapshot);
        self.put(&snapshot).await?;

        Ok(snapshot)
    }

    /// 最后一次完整同步成功的时间（UTC 毫秒）
    pub async fn last_sync_at(&self) -> Result<Option<i64>> {
        self.kv.get(keys::LAST_SYNC_AT).await
    }

    pub async fn set_last_sync_at(&self, timestamp: i64) -> Result<()> {
        self.check_meta_write()?;
        self.kv.set(keys::LAST_SYNC_AT, &timestamp).await?;
        self.kv.flush().await
    }
}

#[cfg(not(test))]
impl LocalStore {
    #[inline]
    fn check_meta_write(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
impl LocalStore {
    /// 让后续的同步元数据写入失败
    pub(crate) fn fail_meta_writes(&self) {
        self.fail_meta_writes
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    fn check_meta_write(&self) -> Result<()> {
        if self.fail_meta_writes.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(SyncError::KvStore("同步元数据写入失败".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TracingErrorReporter;
    use crate::storage::entities::{AchievementSet, PlayerProfile};
    use tempfile::TempDir;

    async fn store(temp_dir: &TempDir) -> (LocalStore, Arc<EventManager>) {
        let kv = Arc::new(KvStore::new(temp_dir.path()).await.unwrap());
        kv.switch_player("p1").await.unwrap();
        let events = Arc::new(EventManager::new(16));
        let store = LocalStore::new(kv, Arc::new(TracingErrorReporter), events.clone());
        (store, events)
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let temp_dir = TempDir::new().unwrap();
        let (store, _) = store(&temp_dir).await;

        assert_eq!(store.get::<PlayerProfile>("p1").await.unwrap(), LocalRead::Missing);

        let profile = PlayerProfile::new("p1", "Ana");
        store.put(&profile).await.unwrap();
        assert_eq!(
            store.get::<PlayerProfile>("p1").await.unwrap(),
            LocalRead::Found(profile)
        );

        // 不同实体类型互不影响
        assert_eq!(store.get::<AchievementSet>("p1").await.unwrap(), LocalRead::Missing);
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let profile = PlayerProfile::new("p1", "Ana");
        {
            let (store, _) = store(&temp_dir).await;
            store.put(&profile).await.unwrap();
        }

        let (store, _) = store(&temp_dir).await;
        assert_eq!(
            store.get::<PlayerProfile>("p1").await.unwrap(),
            LocalRead::Found(profile)
        );
    }

    #[tokio::test]
    async fn test_corrupt_value_discarded_and_reported() {
        let temp_dir = TempDir::new().unwrap();
        let (store, events) = store(&temp_dir).await;
        let mut receiver = events.subscribe();

        store
            .kv()
            .set_raw("local_player_profile:p1", b"\x00garbage")
            .await
            .unwrap();

        assert_eq!(store.get::<PlayerProfile>("p1").await.unwrap(), LocalRead::Corrupt);
        // 已被删除
        assert_eq!(store.get::<PlayerProfile>("p1").await.unwrap(), LocalRead::Missing);

        let event = receiver.recv().await.unwrap();
        assert_eq!(event.event_type(), "integrity_warning");
        assert_eq!(event.entity_type(), Some(EntityType::Profile));
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_serialized() {
        let temp_dir = TempDir::new().unwrap();
        let (store, _) = store(&temp_dir).await;
        let store = Arc::new(store);

        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update::<PlayerProfile, _>("p1", |p| p.games_played += 1)
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let profile = store.get::<PlayerProfile>("p1").await.unwrap().into_option().unwrap();
        assert_eq!(profile.games_played, 10);
    }

    #[tokio::test]
    async fn test_last_sync_at() {
        let temp_dir = TempDir::new().unwrap();
        let (store, _) = store(&temp_dir).await;

        assert_eq!(store.last_sync_at().await.unwrap(), None);
        store.set_last_sync_at(1_700_000_000_000).await.unwrap();
        assert_eq!(store.last_sync_at().await.unwrap(), Some(1_700_000_000_000));
    }
}
