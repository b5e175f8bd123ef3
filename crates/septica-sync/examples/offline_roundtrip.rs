//! 离线往返演示
//! 
//! 两台设备共享同一个内存远端：
//! 设备 A 离线打完一局，设备 B 在线解锁成就，A 重连后两边进度收敛。

use septica_sync::{
    GameRecord, InMemoryRecordStore, ManualNetworkListener, NetworkStatus, ProgressEvent, ProgressSync,
    RecordType, SyncConfig, SyncEvent, SyncStatus,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const PLAYER: &str = "demo-player";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("\n==============================================");
    println!("🃏 Septica 进度同步：离线往返演示");
    println!("==============================================\n");

    let remote = Arc::new(InMemoryRecordStore::new());
    let dir_a = TempDir::new()?;
    let dir_b = TempDir::new()?;

    // 设备 A 从离线开始
    let network_a = Arc::new(ManualNetworkListener::new(NetworkStatus::Offline));
    let device_a = ProgressSync::initialize(config(&dir_a), remote.clone(), network_a.clone()).await?;
    let network_b = Arc::new(ManualNetworkListener::new(NetworkStatus::Online));
    let device_b = ProgressSync::initialize(config(&dir_b), remote.clone(), network_b).await?;

    let mut events = device_a.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SyncEvent::ProgressUpdated { progress, phase: Some(phase), .. } => {
                    println!("  [A] 阶段 {} 完成，进度 {:.0}%", phase, progress * 100.0);
                }
                SyncEvent::ConflictResolved(summary) => {
                    println!("  [A] 合并 {} 冲突字段: {:?}", summary.entity_type, summary.diverged_fields);
                }
                SyncEvent::SyncCompleted { .. } => println!("  [A] ✅ 同步完成"),
                _ => {}
            }
        }
    });

    device_a.start().await?;
    device_b.start().await?;

    println!("📴 设备 A 离线打一局");
    let game = GameRecord::new(PLAYER, "normal", 11, 6, 310);
    let queued = device_a.record_event(ProgressEvent::GameCompleted { record: game }).await?;
    println!("  本地立即可见: {} 局，排队操作 {} 条", device_a.game_history().await?.len(), queued);
    println!("  远端对局数: {}\n", remote.record_count(RecordType::GameRecord));

    println!("📶 设备 B 在线解锁成就");
    device_b
        .record_event(ProgressEvent::AchievementUnlocked {
            achievement_id: "first_septica".to_string(),
            unlocked_at: chrono::Utc::now(),
        })
        .await?;
    device_b.sync_now().await?;

    println!("\n📶 设备 A 恢复网络");
    network_a.go_online();

    let mut state = device_a.watch_state();
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let done = {
                let current = state.borrow();
                current.status == SyncStatus::Completed && device_a.queue_stats().map(|s| s.pending == 0).unwrap_or(false)
            };
            if done || state.changed().await.is_err() {
                break;
            }
        }
    })
    .await;
    if waited.is_err() {
        println!("⚠️ 等待同步超时");
    }

    let achievements = device_a.achievements().await?;
    println!("\n📊 结果");
    println!("  远端对局数: {}", remote.record_count(RecordType::GameRecord));
    println!(
        "  A 已解锁成就: {:?}",
        achievements.map(|a| a.ids()).unwrap_or_default()
    );
    println!("  A 队列: {:?}", device_a.queue_stats()?);

    device_a.shutdown().await?;
    device_b.shutdown().await?;

    println!("\n==============================================");
    println!("✅ 演示完成");
    println!("==============================================\n");
    Ok(())
}

fn config(dir: &TempDir) -> SyncConfig {
    SyncConfig::builder()
        .data_dir(dir.path())
        .player_id(PLAYER)
        .sync_interval(Duration::from_secs(60))
        .retry_delay(Duration::from_secs(5))
        .build()
}
