use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::Result;
use crate::events::now_millis;

/// 网络状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NetworkStatus {
    /// 在线
    Online,
    /// 离线
    Offline,
    /// 连接中
    Connecting,
    /// 网络受限
    Limited,
}

impl NetworkStatus {
    /// 远端是否可能可达
    pub fn is_reachable(&self) -> bool {
        matches!(self, NetworkStatus::Online | NetworkStatus::Limited)
    }
}

/// 网络状态变化事件
#[derive(Debug, Clone)]
pub struct NetworkStatusEvent {
    pub old_status: NetworkStatus,
    pub new_status: NetworkStatus,
    /// UTC 毫秒
    pub timestamp: i64,
}

impl NetworkStatusEvent {
    pub fn new(old_status: NetworkStatus, new_status: NetworkStatus) -> Self {
        Self {
            old_status,
            new_status,
            timestamp: now_millis(),
        }
    }

    /// 不可达 → 可达
    pub fn is_reconnect(&self) -> bool {
        !self.old_status.is_reachable() && self.new_status.is_reachable()
    }

    /// 可达 → 不可达
    pub fn is_disconnect(&self) -> bool {
        self.old_status.is_reachable() && !self.new_status.is_reachable()
    }
}

/// 网络状态监听器trait（由平台层实现，如 Android/iOS）
#[async_trait]
pub trait NetworkStatusListener: Send + Sync + std::fmt::Debug {
    /// 获取当前网络状态
    async fn get_current_status(&self) -> NetworkStatus;

    /// 开始监听网络状态变化
    async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatusEvent>>;

    /// 停止监听
    async fn stop_monitoring(&self);
}

/// 网络监控管理器
#[derive(Debug)]
pub struct NetworkMonitor {
    listener: Arc<dyn NetworkStatusListener>,
    status_sender: broadcast::Sender<NetworkStatusEvent>,
    current_status: Arc<tokio::sync::RwLock<NetworkStatus>>,
}

impl NetworkMonitor {
    pub fn new(listener: Arc<dyn NetworkStatusListener>) -> Self {
        let (status_sender, _) = broadcast::channel(100);

        Self {
            listener,
            status_sender,
            current_status: Arc::new(tokio::sync::RwLock::new(NetworkStatus::Offline)),
        }
    }

    /// 启动网络监控
    pub async fn start(&self) -> Result<()> {
        *self.current_status.write().await = self.listener.get_current_status().await;

        let mut receiver = self.listener.start_monitoring().await?;
        let status_sender = self.status_sender.clone();
        let current_status = self.current_status.clone();

        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        *current_status.write().await = event.new_status.clone();
                        debug!("网络状态变化: {:?} -> {:?}", event.old_status, event.new_status);
                        let _ = status_sender.send(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(())
    }

    pub async fn stop(&self) {
        self.listener.stop_monitoring().await;
    }

    /// 获取当前网络状态
    pub async fn get_status(&self) -> NetworkStatus {
        self.current_status.read().await.clone()
    }

    /// 手动设置网络状态（例如一次远端调用成功后）
    pub async fn set_status(&self, new_status: NetworkStatus) {
        let old_status = {
            let mut status = self.current_status.write().await;
            std::mem::replace(&mut *status, new_status.clone())
        };

        if old_status != new_status {
            let _ = self
                .status_sender
                .send(NetworkStatusEvent::new(old_status, new_status));
        }
    }

    /// 订阅网络状态变化
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkStatusEvent> {
        self.status_sender.subscribe()
    }

    pub async fn is_online(&self) -> bool {
        self.get_status().await.is_reachable()
    }
}

/// 由宿主手动驱动的监听器
///
/// 平台层把系统网络回调转成 [`ManualNetworkListener::set_status`] 调用即可。
#[derive(Debug)]
pub struct ManualNetworkListener {
    status: parking_lot::RwLock<NetworkStatus>,
    sender: broadcast::Sender<NetworkStatusEvent>,
}

impl ManualNetworkListener {
    pub fn new(initial: NetworkStatus) -> Self {
        let (sender, _) = broadcast::channel(16);
        Self {
            status: parking_lot::RwLock::new(initial),
            sender,
        }
    }

    pub fn set_status(&self, new_status: NetworkStatus) {
        let old_status = std::mem::replace(&mut *self.status.write(), new_status.clone());
        if old_status != new_status {
            let _ = self.sender.send(NetworkStatusEvent::new(old_status, new_status));
        }
    }

    pub fn go_online(&self) {
        self.set_status(NetworkStatus::Online);
    }

    pub fn go_offline(&self) {
        self.set_status(NetworkStatus::Offline);
    }
}

impl Default for ManualNetworkListener {
    fn default() -> Self {
        Self::new(NetworkStatus::Online)
    }
}

#[async_trait]
impl NetworkStatusListener for ManualNetworkListener {
    async fn get_current_status(&self) -> NetworkStatus {
        self.status.read().clone()
    }

    async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatusEvent>> {
        Ok(self.sender.subscribe())
    }

    async fn stop_monitoring(&self) {}
}
