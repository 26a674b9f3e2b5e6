// src/scheduler.rs
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::coordinator::PushService;

/// Spawn the in-process scheduler: one cycle per tick, awaited to completion
/// before the next tick is honored, so cycles never overlap from this task.
/// External cron setups skip this and POST /admin/push-cycle instead.
pub fn spawn_push_ticker(service: Arc<PushService>, interval_secs: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        loop {
            ticker.tick().await;
            let result = service.trigger_cycle().await;
            tracing::info!(
                cycle_id = %result.cycle_id,
                success = result.overall_success,
                blocks = result.total_blocks,
                "scheduled push cycle finished"
            );
        }
    })
}
