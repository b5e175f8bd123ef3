//! 同步引擎生命周期 Hook
//! 
//! 切到后台：调度器停止发起同步，取消正在进行的同步周期，暂停离线队列。
//! 回到前台：网络可用时恢复队列，并请求一次同步。

use crate::error::Result;
use crate::lifecycle::LifecycleHook;
use crate::network::NetworkMonitor;
use crate::storage::queue::OfflineQueue;
use crate::sync::{SyncCoordinator, SyncScheduler};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

pub struct SyncLifecycleHook {
    coordinator: Arc<SyncCoordinator>,
    queue: Arc<OfflineQueue>,
    scheduler: Arc<SyncScheduler>,
    network: Arc<NetworkMonitor>,
}

impl SyncLifecycleHook {
    pub fn new(
        coordinator: Arc<SyncCoordinator>,
        queue: Arc<OfflineQueue>,
        scheduler: Arc<SyncScheduler>,
        network: Arc<NetworkMonitor>,
    ) -> Self {
        Self {
            coordinator,
            queue,
            scheduler,
            network,
        }
    }
}

#[async_trait]
impl LifecycleHook for SyncLifecycleHook {
    async fn on_background(&self) -> Result<()> {
        info!("[Sync Hook] App 切换到后台，取消同步并暂停离线队列");
        self.scheduler.set_background(true);
        self.coordinator.cancel();
        self.queue.pause();
        Ok(())
    }

    async fn on_foreground(&self) -> Result<()> {
        self.scheduler.set_background(false);
        if !self.network.is_online().await {
            // 离线时保持暂停，重连由调度器处理
            info!("[Sync Hook] App 回到前台，但网络不可用");
            return Ok(());
        }

        info!("[Sync Hook] App 回到前台，恢复离线队列并请求同步");
        let outcome = self.queue.resume().await?;
        debug!("[Sync Hook] 队列处理结果: {:?}", outcome);
        self.scheduler.trigger_now();
        Ok(())
    }
}
