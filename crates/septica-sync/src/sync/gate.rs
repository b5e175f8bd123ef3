//! 进程内共享的"忙碌"标志
//!
//! 同步协调器与离线队列共用同一个 gate：任一方持有时，另一方的触发直接成为空操作，
//! 剩余工作交给下一次触发处理。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct SyncGate {
    busy: Arc<AtomicBool>,
    holder: Arc<Mutex<Option<&'static str>>>,
}

impl SyncGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// 尝试占用；已被占用时返回 None
    pub fn try_acquire(&self, holder: &'static str) -> Option<GateGuard> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("gate 被 {:?} 占用，{} 跳过", self.holder(), holder);
            return None;
        }

        *self.holder.lock() = Some(holder);
        Some(GateGuard { gate: self.clone() })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn holder(&self) -> Option<&'static str> {
        *self.holder.lock()
    }
}

/// 释放时自动归还 gate
#[derive(Debug)]
pub struct GateGuard {
    gate: SyncGate,
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        *self.gate.holder.lock() = None;
        self.gate.busy.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_is_exclusive_and_released_on_drop() {
        let gate = SyncGate::new();
        let shared = gate.clone();

        let guard = gate.try_acquire("coordinator").unwrap();
        assert!(shared.is_busy());
        assert_eq!(shared.holder(), Some("coordinator"));
        assert!(shared.try_acquire("queue").is_none());

        drop(guard);
        assert!(!gate.is_busy());
        assert!(shared.try_acquire("queue").is_some());
    }

    #[test]
    fn test_guard_held_across_await() {
        let gate = SyncGate::new();
        tokio_test::block_on(async {
            let _guard = gate.try_acquire("offline_queue").unwrap();
            tokio::task::yield_now().await;
            assert!(gate.is_busy());
        });
        assert!(!gate.is_busy());
    }
}
