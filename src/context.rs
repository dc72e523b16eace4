//! Process-scoped engine state, passed to every task instead of living in globals: the
//!  interrupt flag, the flow table, and the live-traffic-task counter the listener uses
//!  to serialize single-client mode.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::flow_table::FlowTable;

#[derive(Default)]
pub struct EngineContext {
    interrupted: AtomicBool,
    traffic_tasks: AtomicUsize,
    pub flow_table: FlowTable,
}
impl EngineContext {
    pub fn new() -> Arc<EngineContext> {
        Arc::new(EngineContext::default())
    }

    /// Observed at the top of every loop iteration; loops exit promptly and run their
    ///  protocol teardown.
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Relaxed)
    }

    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Relaxed);
    }

    /// Wire ctrl-c to the interrupt flag. Runs until the first signal.
    pub async fn interrupt_on_ctrl_c(self: Arc<Self>) {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping flows");
            self.interrupt();
        }
    }

    pub fn live_traffic_tasks(&self) -> usize {
        self.traffic_tasks.load(Ordering::Acquire)
    }

    /// Count a traffic task for its lifetime; the guard decrements on drop, even on an
    ///  errored exit path.
    pub fn traffic_task_guard(self: &Arc<Self>) -> TrafficTaskGuard {
        self.traffic_tasks.fetch_add(1, Ordering::AcqRel);
        TrafficTaskGuard { ctx: self.clone() }
    }
}

pub struct TrafficTaskGuard {
    ctx: Arc<EngineContext>,
}
impl Drop for TrafficTaskGuard {
    fn drop(&mut self) {
        self.ctx.traffic_tasks.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn test_interrupt_flag() {
        let ctx = EngineContext::new();
        assert!(!ctx.is_interrupted());
        ctx.interrupt();
        assert!(ctx.is_interrupted());
    }

    #[rstest]
    fn test_traffic_task_guard_counts() {
        let ctx = EngineContext::new();
        assert_eq!(ctx.live_traffic_tasks(), 0);
        {
            let _a = ctx.traffic_task_guard();
            let _b = ctx.traffic_task_guard();
            assert_eq!(ctx.live_traffic_tasks(), 2);
        }
        assert_eq!(ctx.live_traffic_tasks(), 0);
    }
}
