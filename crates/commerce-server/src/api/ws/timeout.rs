//! WebSocket heartbeat/idle constants (§4.10, §6): a 25s heartbeat and a 5m
//! idle-socket close.

use std::time::Duration;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
