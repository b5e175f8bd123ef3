//! KV 存储模块 - 基于 sled 的键值存储
//!
//! 本模块提供：
//! - 玩家隔离的命名空间（每个玩家一个 Tree）
//! - JSON 值的原子读写（单键 insert 天然原子，读者不会看到半写入的值）
//! - 附属 Tree（如离线队列）与单调递增 ID

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use tokio::sync::RwLock;

use crate::error::{Result, SyncError};

/// KV 存储组件
#[derive(Debug)]
pub struct KvStore {
    /// 主数据库实例
    db: Arc<Db>,
    /// 玩家专属的 Tree 实例
    player_trees: Arc<RwLock<HashMap<String, Tree>>>,
    /// 当前玩家ID
    current_player: Arc<RwLock<Option<String>>>,
}

impl KvStore {
    /// 创建新的 KV 存储实例
    pub async fn new(base_path: &Path) -> Result<Self> {
        let kv_path = base_path.join("kv");

        tokio::fs::create_dir_all(&kv_path)
            .await
            .map_err(|e| SyncError::IO(format!("创建 KV 存储目录失败: {}", e)))?;

        // 进程重启时旧实例可能刚释放文件锁，重试多次带退避
        const MAX_OPEN_RETRIES: u32 = 6;
        const RETRY_DELAY_MS: u64 = 100;
        let mut last_err: Option<sled::Error> = None;
        let mut db_opt: Option<Db> = None;
        for attempt in 0..MAX_OPEN_RETRIES {
            match sled::open(&kv_path) {
                Ok(d) => {
                    db_opt = Some(d);
                    break;
                }
                Err(e) => {
                    let msg = e.to_string();
                    last_err = Some(e);
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    if is_lock && attempt + 1 < MAX_OPEN_RETRIES {
                        let delay_ms = RETRY_DELAY_MS * (1 << attempt);
                        tracing::warn!("sled 数据库被占用，{}ms 后重试 ({}/{})", delay_ms, attempt + 1, MAX_OPEN_RETRIES);
                        tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                    } else {
                        break;
                    }
                }
            }
        }
        let db = db_opt.ok_or_else(|| {
            SyncError::KvStore(
                last_err
                    .map(|e| format!("打开 sled 数据库失败: {}", e))
                    .unwrap_or_else(|| "打开 sled 数据库失败".to_string()),
            )
        })?;

        Ok(Self {
            db: Arc::new(db),
            player_trees: Arc::new(RwLock::new(HashMap::new())),
            current_player: Arc::new(RwLock::new(None)),
        })
    }

    fn tree_name(player_id: &str) -> String {
        format!("player_{}", player_id)
    }

    /// 初始化玩家 Tree
    pub async fn init_player_tree(&self, player_id: &str) -> Result<()> {
        let tree = self
            .db
            .open_tree(Self::tree_name(player_id))
            .map_err(|e| SyncError::KvStore(format!("打开玩家 Tree 失败: {}", e)))?;

        let mut trees = self.player_trees.write().await;
        trees.insert(player_id.to_string(), tree);

        tracing::info!("玩家 KV Tree 初始化完成: {}", player_id);
        Ok(())
    }

    /// 切换当前玩家
    pub async fn switch_player(&self, player_id: &str) -> Result<()> {
        let known = self.player_trees.read().await.contains_key(player_id);
        if !known {
            self.init_player_tree(player_id).await?;
        }

        *self.current_player.write().await = Some(player_id.to_string());
        Ok(())
    }

    async fn current_tree(&self) -> Result<Tree> {
        let current = self.current_player.read().await;
        let player_id = current
            .as_ref()
            .ok_or_else(|| SyncError::NotInitialized("未选择当前玩家".to_string()))?;

        let trees = self.player_trees.read().await;
        let tree = trees
            .get(player_id)
            .ok_or_else(|| SyncError::KvStore("玩家 Tree 不存在".to_string()))?;

        Ok(tree.clone())
    }

    /// 打开当前玩家名下的附属 Tree（例如离线队列）
    pub async fn open_player_tree(&self, name: &str) -> Result<Tree> {
        let current = self.current_player.read().await;
        let player_id = current
            .as_ref()
            .ok_or_else(|| SyncError::NotInitialized("未选择当前玩家".to_string()))?;

        self.db
            .open_tree(format!("{}:{}", Self::tree_name(player_id), name))
            .map_err(|e| SyncError::KvStore(format!("打开附属 Tree 失败: {}", e)))
    }

    /// 单调递增 ID（跨重启保持递增）
    pub fn generate_id(&self) -> Result<u64> {
        self.db
            .generate_id()
            .map_err(|e| SyncError::KvStore(format!("生成 ID 失败: {}", e)))
    }

    /// 设置键值对（JSON）
    pub async fn set<K, V>(&self, key: K, value: &V) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: Serialize,
    {
        let tree = self.current_tree().await?;
        let value_bytes = serde_json::to_vec(value)
            .map_err(|e| SyncError::Serialization(format!("序列化值失败: {}", e)))?;

        tree.insert(key, value_bytes)
            .map_err(|e| SyncError::KvStore(format!("设置键值对失败: {}", e)))?;

        Ok(())
    }

    /// 获取键值对（JSON）；值无法解码时返回 Serialization 错误
    pub async fn get<K, V>(&self, key: K) -> Result<Option<V>>
    where
        K: AsRef<[u8]>,
        V: for<'de> Deserialize<'de>,
    {
        match self.get_raw(key).await? {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| SyncError::Serialization(format!("反序列化值失败: {}", e)))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// 写入原始字节
    pub async fn set_raw<K>(&self, key: K, bytes: &[u8]) -> Result<()>
    where
        K: AsRef<[u8]>,
    {
        let tree = self.current_tree().await?;
        tree.insert(key, bytes)
            .map_err(|e| SyncError::KvStore(format!("设置键值对失败: {}", e)))?;
        Ok(())
    }

    /// 读取原始字节
    pub async fn get_raw<K>(&self, key: K) -> Result<Option<Vec<u8>>>
    where
        K: AsRef<[u8]>,
    {
        let tree = self.current_tree().await?;
        let result = tree
            .get(key)
            .map_err(|e| SyncError::KvStore(format!("获取键值对失败: {}", e)))?;
        Ok(result.map(|v| v.to_vec()))
    }

    /// 删除键值对
    pub async fn delete<K>(&self, key: K) -> Result<Option<Vec<u8>>>
    where
        K: AsRef<[u8]>,
    {
        let tree = self.current_tree().await?;

        let result = tree
            .remove(key)
            .map_err(|e| SyncError::KvStore(format!("删除键值对失败: {}", e)))?;

        Ok(result.map(|v| v.to_vec()))
    }

    /// 刷盘
    pub async fn flush(&self) -> Result<()> {
        self.db
            .flush_async()
            .await
            .map_err(|e| SyncError::KvStore(format!("刷盘失败: {}", e)))?;
        Ok(())
    }
}

/// 常用的键前缀常量
pub mod keys {
    /// 最后一次成功同步时间
    pub const LAST_SYNC_AT: &str = "sync_meta:last_sync_at";
    /// 离线队列 Tree 名称
    pub const OFFLINE_QUEUE_TREE: &str = "offline_queue";
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_kv_store_basic_operations() {
        let temp_dir = TempDir::new().unwrap();
        let store = KvStore::new(temp_dir.path()).await.unwrap();

        store.switch_player("player_a").await.unwrap();

        let test_data = json!({
            "name": "test",
            "value": 123
        });

        store.set("test_key", &test_data).await.unwrap();
        let retrieved: serde_json::Value = store.get("test_key").await.unwrap().unwrap();
        assert_eq!(retrieved, test_data);

        let missing: Option<serde_json::Value> = store.get("non_existent_key").await.unwrap();
        assert!(missing.is_none());

        store.delete("test_key").await.unwrap();
        let deleted: Option<serde_json::Value> = store.get("test_key").await.unwrap();
        assert!(deleted.is_none());
    }

    #[tokio::test]
    async fn test_players_are_isolated() {
        let temp_dir = TempDir::new().unwrap();
        let store = KvStore::new(temp_dir.path()).await.unwrap();

        store.switch_player("player_a").await.unwrap();
        store.set("k", &json!(1)).await.unwrap();

        store.switch_player("player_b").await.unwrap();
        let missing: Option<serde_json::Value> = store.get("k").await.unwrap();
        assert!(missing.is_none());

        store.switch_player("player_a").await.unwrap();
        let found: serde_json::Value = store.get("k").await.unwrap().unwrap();
        assert_eq!(found, json!(1));
    }

    #[tokio::test]
    async fn test_corrupt_value_is_serialization_error() {
        let temp_dir = TempDir::new().unwrap();
        let store = KvStore::new(temp_dir.path()).await.unwrap();
        store.switch_player("player_a").await.unwrap();

        store.set_raw("broken", b"{not json").await.unwrap();
        let result: Result<Option<serde_json::Value>> = store.get("broken").await;
        assert!(matches!(result, Err(SyncError::Serialization(_))));
    }

    #[tokio::test]
    async fn test_requires_current_player() {
        let temp_dir = TempDir::new().unwrap();
        let store = KvStore::new(temp_dir.path()).await.unwrap();

        let result = store.set("k", &json!(1)).await;
        assert!(matches!(result, Err(SyncError::NotInitialized(_))));
    }

    #[tokio::test]
    async fn test_generate_id_is_monotonic() {
        let temp_dir = TempDir::new().unwrap();
        let store = KvStore::new(temp_dir.path()).await.unwrap();

        let first = store.generate_id().unwrap();
        let second = store.generate_id().unwrap();
        assert!(second > first);
    }
}
