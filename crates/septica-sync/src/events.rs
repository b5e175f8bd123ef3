//! 事件系统模块 - 同步引擎对外发布的强类型事件
//!
//! 功能包括：
//! - 同步状态 / 进度 / 分类状态变更
//! - 冲突解决与待处理冲突
//! - 离线队列操作的生命周期
//! - 数据完整性告警
//! - 事件广播、过滤订阅与回调监听

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::IntegrityIssue;
use crate::sync::{CategorySyncState, ConflictSummary, EntityType, SyncStatus};

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// 同步事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncEvent {
    /// 整体同步状态变更
    StatusChanged {
        old_status: SyncStatus,
        new_status: SyncStatus,
        timestamp: i64,
    },
    /// 整体进度（0.0 - 1.0）
    ProgressUpdated {
        progress: f64,
        phase: Option<EntityType>,
        timestamp: i64,
    },
    /// 单个分类的同步状态变更
    CategoryStateChanged {
        entity_type: EntityType,
        state: CategorySyncState,
        timestamp: i64,
    },
    /// 冲突已自动解决
    ConflictResolved(ConflictSummary),
    /// 冲突需要人工处理
    ConflictRequiresAttention(ConflictSummary),
    /// 完整同步成功
    SyncCompleted {
        last_sync_at: i64,
        timestamp: i64,
    },
    /// 同步失败（已完成的阶段不回滚）
    SyncFailed {
        phase: Option<EntityType>,
        error: String,
        timestamp: i64,
    },
    /// 同步被取消
    SyncCancelled {
        phase: Option<EntityType>,
        timestamp: i64,
    },
    /// 操作已入队
    OperationEnqueued {
        operation_id: String,
        entity_type: EntityType,
        timestamp: i64,
    },
    /// 操作推送成功并出队
    OperationSucceeded {
        operation_id: String,
        entity_type: EntityType,
        timestamp: i64,
    },
    /// 操作失败，等待重试
    OperationRetryScheduled {
        operation_id: String,
        entity_type: EntityType,
        retry_count: u32,
        error: String,
        timestamp: i64,
    },
    /// 操作重试耗尽，已丢弃
    OperationAbandoned {
        operation_id: String,
        entity_type: EntityType,
        attempts: u32,
        error: String,
        timestamp: i64,
    },
    /// 数据完整性告警
    IntegrityWarning(IntegrityIssue),
}

impl SyncEvent {
    /// 获取事件类型字符串
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::StatusChanged { .. } => "status_changed",
            SyncEvent::ProgressUpdated { .. } => "progress_updated",
            SyncEvent::CategoryStateChanged { .. } => "category_state_changed",
            SyncEvent::ConflictResolved(_) => "conflict_resolved",
            SyncEvent::ConflictRequiresAttention(_) => "conflict_requires_attention",
            SyncEvent::SyncCompleted { .. } => "sync_completed",
            SyncEvent::SyncFailed { .. } => "sync_failed",
            SyncEvent::SyncCancelled { .. } => "sync_cancelled",
            SyncEvent::OperationEnqueued { .. } => "operation_enqueued",
            SyncEvent::OperationSucceeded { .. } => "operation_succeeded",
            SyncEvent::OperationRetryScheduled { .. } => "operation_retry_scheduled",
            SyncEvent::OperationAbandoned { .. } => "operation_abandoned",
            SyncEvent::IntegrityWarning(_) => "integrity_warning",
        }
    }

    /// 获取事件关联的实体类型
    pub fn entity_type(&self) -> Option<EntityType> {
        match self {
            SyncEvent::ProgressUpdated { phase, .. } => *phase,
            SyncEvent::CategoryStateChanged { entity_type, .. } => Some(*entity_type),
            SyncEvent::ConflictResolved(c) | SyncEvent::ConflictRequiresAttention(c) => {
                Some(c.entity_type)
            }
            SyncEvent::SyncFailed { phase, .. } | SyncEvent::SyncCancelled { phase, .. } => *phase,
            SyncEvent::OperationEnqueued { entity_type, .. }
            | SyncEvent::OperationSucceeded { entity_type, .. }
            | SyncEvent::OperationRetryScheduled { entity_type, .. }
            | SyncEvent::OperationAbandoned { entity_type, .. } => Some(*entity_type),
            SyncEvent::IntegrityWarning(issue) => issue.entity_type,
            SyncEvent::StatusChanged { .. } | SyncEvent::SyncCompleted { .. } => None,
        }
    }

    /// 获取事件时间戳（UTC 毫秒）
    pub fn timestamp(&self) -> i64 {
        match self {
            SyncEvent::StatusChanged { timestamp, .. }
            | SyncEvent::ProgressUpdated { timestamp, .. }
            | SyncEvent::CategoryStateChanged { timestamp, .. }
            | SyncEvent::SyncCompleted { timestamp, .. }
            | SyncEvent::SyncFailed { timestamp, .. }
            | SyncEvent::SyncCancelled { timestamp, .. }
            | SyncEvent::OperationEnqueued { timestamp, .. }
            | SyncEvent::OperationSucceeded { timestamp, .. }
            | SyncEvent::OperationRetryScheduled { timestamp, .. }
            | SyncEvent::OperationAbandoned { timestamp, .. } => *timestamp,
            SyncEvent::ConflictResolved(c) | SyncEvent::ConflictRequiresAttention(c) => {
                c.resolved_at
            }
            SyncEvent::IntegrityWarning(issue) => issue.timestamp,
        }
    }
}

/// 事件过滤器
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    /// 事件类型过滤
    pub event_types: Option<Vec<String>>,
    /// 实体类型过滤
    pub entity_types: Option<Vec<EntityType>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    pub fn with_entity_types(mut self, entity_types: Vec<EntityType>) -> Self {
        self.entity_types = Some(entity_types);
        self
    }

    /// 检查事件是否匹配过滤器
    pub fn matches(&self, event: &SyncEvent) -> bool {
        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }

        if let Some(ref entity_types) = self.entity_types {
            match event.entity_type() {
                Some(entity_type) if entity_types.contains(&entity_type) => {}
                // 事件没有实体类型但过滤器要求有
                _ => return false,
            }
        }

        true
    }
}

/// 事件监听器类型
pub type EventListener = Box<dyn Fn(&SyncEvent) + Send + Sync>;

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    pub total_events: u64,
    pub events_by_type: HashMap<String, u64>,
    pub listener_count: usize,
    pub last_event_time: Option<i64>,
}

/// 事件管理器
pub struct EventManager {
    sender: broadcast::Sender<SyncEvent>,
    /// 事件类型 -> 监听器；"*" 表示全部事件
    listeners: Arc<tokio::sync::RwLock<HashMap<String, Vec<EventListener>>>>,
    stats: Arc<tokio::sync::RwLock<EventStats>>,
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));

        Self {
            sender,
            listeners: Arc::new(tokio::sync::RwLock::new(HashMap::new())),
            stats: Arc::new(tokio::sync::RwLock::new(EventStats::default())),
        }
    }

    /// 发布事件
    pub async fn emit(&self, event: SyncEvent) {
        debug!("Emitting event: {}", event.event_type());

        {
            let mut stats = self.stats.write().await;
            stats.total_events += 1;
            *stats
                .events_by_type
                .entry(event.event_type().to_string())
                .or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
        }

        // 无订阅者时 send 会失败，属正常场景（无 UI 的后台进程），仅打 debug
        if let Err(e) = self.sender.send(event.clone()) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }

        let listeners = self.listeners.read().await;
        if let Some(event_listeners) = listeners.get(event.event_type()) {
            for listener in event_listeners {
                listener(&event);
            }
        }
        if let Some(general_listeners) = listeners.get("*") {
            for listener in general_listeners {
                listener(&event);
            }
        }
    }

    /// 订阅全部事件
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// 订阅过滤后的事件
    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        FilteredEventReceiver::new(self.sender.subscribe(), filter)
    }

    /// 添加事件监听器；event_type 为 "*" 时监听全部事件
    pub async fn add_listener<F>(&self, event_type: &str, listener: F)
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.write().await;
        listeners
            .entry(event_type.to_string())
            .or_insert_with(Vec::new)
            .push(Box::new(listener));

        let mut stats = self.stats.write().await;
        stats.listener_count = listeners.values().map(|v| v.len()).sum();

        info!("Added listener for event type: {}", event_type);
    }

    pub async fn clear_listeners(&self) {
        self.listeners.write().await.clear();
        self.stats.write().await.listener_count = 0;
    }

    pub async fn get_stats(&self) -> EventStats {
        self.stats.read().await.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl std::fmt::Debug for EventManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventManager")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

/// 过滤事件接收器
pub struct FilteredEventReceiver {
    receiver: broadcast::Receiver<SyncEvent>,
    filter: EventFilter,
}

impl FilteredEventReceiver {
    pub fn new(receiver: broadcast::Receiver<SyncEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// 接收下一个匹配的事件
    pub async fn recv(&mut self) -> Result<SyncEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// 尝试接收事件（非阻塞）
    pub fn try_recv(&mut self) -> Result<SyncEvent, broadcast::error::TryRecvError> {
        loop {
            let event = self.receiver.try_recv()?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}
