//! Idle-session reaper (§4.1 supplement): periodically sweeps sessions whose
//! last update is older than the idle TTL, mirroring the teacher's
//! WebSocket-pool idle-connection eviction loop.

use commerce_core::Orchestrator;
use std::sync::Arc;
use std::time::Duration;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const SESSION_IDLE_TTL: Duration = Duration::from_secs(30 * 60);

pub async fn run(orchestrator: Arc<Orchestrator>) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        interval.tick().await;
        let removed = orchestrator.reap_idle(SESSION_IDLE_TTL);
        if removed > 0 {
            tracing::info!(removed, "reaped idle sessions");
        }
    }
}
