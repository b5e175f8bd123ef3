//! 错误类型与完整性问题上报
//!
//! 错误分三类处理：
//! - 瞬时错误（RemoteUnavailable）：操作留在队列，稍后重试，不打扰用户
//! - 冲突错误（RecordChanged / RecordConflict）：自动交给冲突解决器
//! - 完整性错误（OperationExhausted / Serialization）：通过 ErrorReporter 上报，永不致命

use thiserror::Error;
use tracing::error;

use crate::remote::{RawRecord, RecordType};
use crate::sync::EntityType;

#[derive(Debug, Error)]
pub enum SyncError {
    /// 无网络或远端服务不可用
    #[error("Remote unavailable: {0}")]
    RemoteUnavailable(String),

    /// 乐观并发冲突：写入携带的 change tag 已过期，附带服务端当前记录
    #[error("Record changed on server: {record_type}/{key}")]
    RecordChanged {
        record_type: RecordType,
        key: String,
        server_record: Box<RawRecord>,
    },

    /// 有限次数的重新合并后仍然冲突
    #[error("Record conflict: {0}")]
    RecordConflict(String),

    /// 重试次数耗尽，操作已被丢弃
    #[error("Operation {operation_id} ({entity_type}) abandoned after {attempts} attempts")]
    OperationExhausted {
        operation_id: String,
        entity_type: EntityType,
        attempts: u32,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("KV store error: {0}")]
    KvStore(String),

    #[error("IO error: {0}")]
    IO(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not initialized: {0}")]
    NotInitialized(String),

    /// 同步周期被取消（App 进入后台等）
    #[error("Sync cancelled")]
    Cancelled,

    #[error("Other error: {0}")]
    Other(String),
}

impl From<sled::Error> for SyncError {
    fn from(error: sled::Error) -> Self {
        SyncError::KvStore(error.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(error: serde_json::Error) -> Self {
        SyncError::Serialization(error.to_string())
    }
}

impl From<bincode::Error> for SyncError {
    fn from(error: bincode::Error) -> Self {
        SyncError::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(error: std::io::Error) -> Self {
        SyncError::IO(error.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_connect() || error.is_timeout() {
            SyncError::RemoteUnavailable(error.to_string())
        } else if error.is_decode() {
            SyncError::Serialization(error.to_string())
        } else {
            SyncError::Http(error.to_string())
        }
    }
}

impl SyncError {
    /// 瞬时错误：保留操作，稍后重试
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::RemoteUnavailable(_))
    }

    /// 冲突错误：交给冲突解决器
    pub fn is_conflict(&self) -> bool {
        matches!(self, SyncError::RecordChanged { .. } | SyncError::RecordConflict(_))
    }

    /// 完整性错误：无法静默恢复，需要上报
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            SyncError::OperationExhausted { .. } | SyncError::Serialization(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// 完整性问题（重试耗尽、本地快照损坏）
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct IntegrityIssue {
    /// 相关实体类型
    pub entity_type: Option<EntityType>,
    /// 面向人的描述
    pub description: String,
    /// UTC 毫秒时间戳
    pub timestamp: i64,
}

impl IntegrityIssue {
    pub fn new(entity_type: Option<EntityType>, description: impl Into<String>) -> Self {
        Self {
            entity_type,
            description: description.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// 错误上报协作者（由宿主 App 实现，例如接入崩溃/诊断平台）
pub trait ErrorReporter: Send + Sync {
    fn report(&self, issue: &IntegrityIssue);
}

/// 默认实现：只写 error 级日志
#[derive(Debug, Default)]
pub struct TracingErrorReporter;

impl ErrorReporter for TracingErrorReporter {
    fn report(&self, issue: &IntegrityIssue) {
        match issue.entity_type {
            Some(entity_type) => error!("⚠️ 数据完整性问题 [{}]: {}", entity_type, issue.description),
            None => error!("⚠️ 数据完整性问题: {}", issue.description),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(SyncError::RemoteUnavailable("offline".into()).is_transient());
        assert!(!SyncError::RemoteUnavailable("offline".into()).is_integrity());

        assert!(SyncError::RecordConflict("profile".into()).is_conflict());

        let exhausted = SyncError::OperationExhausted {
            operation_id: "op-1".into(),
            entity_type: EntityType::Achievements,
            attempts: 3,
        };
        assert!(exhausted.is_integrity());
        assert!(!exhausted.is_transient());
        assert!(exhausted.to_string().contains("op-1"));

        assert!(SyncError::Serialization("bad json".into()).is_integrity());
        assert!(!SyncError::Cancelled.is_conflict());
    }

    #[test]
    fn test_json_error_maps_to_serialization() {
        let err = serde_json::from_str::<u32>("not-a-number").unwrap_err();
        let sync_err: SyncError = err.into();
        assert!(matches!(sync_err, SyncError::Serialization(_)));
    }
}
