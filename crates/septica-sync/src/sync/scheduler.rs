//! 同步调度器
//!
//! 后台任务，在以下时机触发：
//! - 定时器（sync_interval）
//! - 重试定时器（retry_delay，仅在队列非空时处理队列）
//! - 网络重连 / 断开
//! - 远端变更通知
//! - 手动触发
//!
//! 网络不可用时只处理队列暂停，不访问远端。
//! App 在后台时忽略定时、远端变更和手动触发，回到前台后由生命周期 Hook 恢复。
//! 本设备推送产生的远端变更通知直接忽略。
//! 并发的触发统一经由 [`SyncGate`](crate::sync::SyncGate) 串行化，忙时直接跳过。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, SyncError};
use crate::network::NetworkMonitor;
use crate::remote::RemoteRecordStore;
use crate::storage::queue::{DrainOutcome, OfflineQueue};
use crate::sync::coordinator::{SyncCoordinator, SyncOutcome};

/// 定时器的最小周期（tokio interval 不接受 0）
const MIN_TICK: Duration = Duration::from_millis(100);

pub struct SyncScheduler {
    coordinator: Arc<SyncCoordinator>,
    queue: Arc<OfflineQueue>,
    network: Arc<NetworkMonitor>,
    remote: Arc<dyn RemoteRecordStore>,
    interval: Duration,
    retry_delay: Duration,
    trigger: Notify,
    background: AtomicBool,
    shutdown: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SyncScheduler {
    pub fn new(
        coordinator: Arc<SyncCoordinator>,
        queue: Arc<OfflineQueue>,
        network: Arc<NetworkMonitor>,
        remote: Arc<dyn RemoteRecordStore>,
        interval: Duration,
        retry_delay: Duration,
    ) -> Self {
        Self {
            coordinator,
            queue,
            network,
            remote,
            interval: interval.max(MIN_TICK),
            retry_delay: retry_delay.max(MIN_TICK),
            trigger: Notify::new(),
            background: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    /// 启动后台调度任务（重复调用无效果）
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(SyncError::NotInitialized("调度器已关闭".to_string()));
        }
        if self.is_running() {
            return Ok(());
        }

        if !self.network.is_online().await {
            self.queue.pause();
        }

        // 先订阅再启动，启动期间的事件不会丢
        let network_rx = self.network.subscribe();
        let remote_rx = self.remote.subscribe();

        let scheduler = self.clone();
        let handle = tokio::spawn(async move {
            scheduler.run(network_rx, remote_rx).await;
        });

        let mut slot = self.handle.lock();
        if slot.is_some() {
            // 并发 start 时保留先启动的任务
            handle.abort();
        } else {
            *slot = Some(handle);
        }
        drop(slot);

        info!(
            "⏰ 同步调度器已启动: interval={:?}, retry_delay={:?}",
            self.interval, self.retry_delay
        );
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// App 前后台切换；后台期间不发起同步
    pub fn set_background(&self, background: bool) {
        self.background.store(background, Ordering::SeqCst);
    }

    pub fn is_background(&self) -> bool {
        self.background.load(Ordering::SeqCst)
    }

    /// 请求一次同步（调度器忙时合并为一次）
    pub fn trigger_now(&self) {
        debug!("收到手动同步请求");
        self.trigger.notify_one();
    }

    /// 停止调度任务并等待其退出
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.coordinator.cancel();

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("调度任务退出异常: {}", e);
            }
        }
        info!("同步调度器已停止");
    }

    #[instrument(skip_all, name = "sync_scheduler")]
    async fn run(
        &self,
        mut network_rx: broadcast::Receiver<crate::network::NetworkStatusEvent>,
        mut remote_rx: broadcast::Receiver<crate::remote::RemoteChange>,
    ) {
        let mut sync_tick = interval_at(Instant::now() + self.interval, self.interval);
        sync_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut retry_tick = interval_at(Instant::now() + self.retry_delay, self.retry_delay);
        retry_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut network_open = true;
        let mut remote_open = true;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,

                _ = sync_tick.tick() => {
                    if self.is_background() {
                        continue;
                    }
                    self.drain_queue().await;
                    if self.network.is_online().await {
                        self.run_sync("interval").await;
                    }
                }

                _ = retry_tick.tick() => {
                    if !self.queue.is_empty() {
                        self.drain_queue().await;
                    }
                }

                _ = self.trigger.notified() => {
                    if self.is_background() {
                        debug!("App 在后台，忽略手动同步请求");
                    } else if self.network.is_online().await {
                        self.drain_queue().await;
                        self.run_sync("manual").await;
                    } else {
                        debug!("网络不可用，忽略手动同步请求");
                    }
                }

                event = network_rx.recv(), if network_open => match event {
                    Ok(event) if event.is_disconnect() => {
                        info!("📴 网络断开，暂停离线队列");
                        self.coordinator.cancel();
                        self.queue.pause();
                    }
                    Ok(event) if event.is_reconnect() && self.is_background() => {
                        debug!("网络恢复，App 在后台，等待回到前台");
                    }
                    Ok(event) if event.is_reconnect() => {
                        info!("📶 网络恢复，处理离线队列并同步");
                        match self.queue.resume().await {
                            Ok(outcome) => debug!("重连后队列处理结果: {:?}", outcome),
                            Err(e) => warn!("重连后处理离线队列失败: {}", e),
                        }
                        self.run_sync("reconnect").await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("网络事件积压，跳过 {} 条", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => network_open = false,
                },

                change = remote_rx.recv(), if remote_open => match change {
                    Ok(change) if self.coordinator.is_own_change(&change) => {
                        debug!("忽略本设备产生的远端变更: {}/{}", change.record_type, change.key);
                    }
                    Ok(change) => {
                        debug!("远端变更通知: {}/{}", change.record_type, change.key);
                        self.sync_on_remote_change().await;
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        self.sync_on_remote_change().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => remote_open = false,
                },
            }
        }

        debug!("调度循环退出");
    }

    async fn sync_on_remote_change(&self) {
        if self.is_background() {
            debug!("App 在后台，暂不处理远端变更");
        } else if self.network.is_online().await {
            self.run_sync("remote_change").await;
        }
    }

    async fn drain_queue(&self) {
        match self.queue.process_all().await {
            Ok(DrainOutcome::Drained(report)) => {
                if report != Default::default() {
                    debug!("离线队列处理结果: {:?}", report);
                }
            }
            Ok(outcome) => debug!("离线队列未处理: {:?}", outcome),
            Err(e) => warn!("处理离线队列失败: {}", e),
        }
    }

    async fn run_sync(&self, reason: &'static str) {
        debug!("触发同步: {}", reason);
        match self.coordinator.sync_all().await {
            Ok(SyncOutcome::Completed(report)) => {
                debug!("同步完成 ({}): {} 个阶段", reason, report.phases.len());
            }
            Ok(SyncOutcome::Skipped) => debug!("同步进行中，忽略触发: {}", reason),
            Err(SyncError::Cancelled) => debug!("同步被取消: {}", reason),
            Err(e) => warn!("同步失败 ({}): {}", reason, e),
        }
    }
}
