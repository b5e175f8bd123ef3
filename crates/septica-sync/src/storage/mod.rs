//! 存储模块 - 离线优先的本地持久化层
//!
//! 采用分层架构设计：
//! - KvStore: sled 之上的按玩家隔离的 KV 存储
//! - Entities: 各类进度快照的数据定义
//! - LocalStore: 快照读写、损坏检测、按键加锁
//! - Queue: 持久化的离线操作队列

pub mod entities;
pub mod kv;
pub mod local_store;
pub mod queue;

pub use entities::*;
pub use kv::KvStore;
pub use local_store::{LocalRead, LocalStore};
pub use queue::{
    DrainOutcome, DrainReport, OfflineQueue, OperationStatus, QueueStats, RetryPolicy, SyncOperation, SyncUpdate,
};
