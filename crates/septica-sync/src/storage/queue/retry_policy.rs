use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// 失败原因分类（写入 last_error 与日志）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FailureReason {
    /// 网络不可用 / 服务端故障
    RemoteUnavailable,
    /// 重新合并后仍冲突
    Conflict,
    /// 载荷无法编解码
    Serialization,
    Other(String),
}

impl From<&SyncError> for FailureReason {
    fn from(error: &SyncError) -> Self {
        match error {
            SyncError::RemoteUnavailable(_) => FailureReason::RemoteUnavailable,
            e if e.is_conflict() => FailureReason::Conflict,
            SyncError::Serialization(_) => FailureReason::Serialization,
            other => FailureReason::Other(other.to_string()),
        }
    }
}

/// 固定间隔的有界重试策略
///
/// 每次失败 retry_count 加一；retry_count < max_retries 时重新排队，否则丢弃。
/// 重试之间等待固定的 retry_delay（不做指数退避）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// 最大尝试次数
    pub max_retries: u32,
    /// 两次尝试之间的固定间隔
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            max_retries,
            retry_delay,
        }
    }

    /// 失败后（retry_count 已递增）是否还应重新排队
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// 下一次允许尝试的时间；从未尝试过的操作立即可执行
    pub fn next_attempt_at(&self, last_attempt_at: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        let last = last_attempt_at?;
        let delay = chrono::Duration::from_std(self.retry_delay).unwrap_or_else(|_| chrono::Duration::zero());
        Some(last + delay)
    }

    /// 检查操作当前是否到期可重试
    pub fn is_due(&self, last_attempt_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match self.next_attempt_at(last_attempt_at) {
            Some(next) => now >= next,
            None => true,
        }
    }
}
