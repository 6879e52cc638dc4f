//! Output relay tick.
//!
//! Decouples "a fragment arrived" from "a fragment was sent to clients":
//! a fixed-interval ticker tells the registry actor to flush, and the actor
//! drains every session's pending buffer into one coalesced observation per
//! session. No fragments since the last tick means no message (leading edge
//! suppressed); fragments arriving faster than the tick are batched into
//! the next flush (trailing edge guaranteed). All sessions share one
//! cadence.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::registry::RegistryHandle;

/// Spawns the relay ticker.
///
/// Runs until the cancellation token fires or the registry actor goes away.
pub fn spawn_relay_task(
    registry: RegistryHandle,
    period: Duration,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    debug!("output relay stopping");
                    break;
                }

                _ = ticker.tick() => {
                    if !registry.flush().await {
                        debug!("output relay stopping: registry channel closed");
                        break;
                    }
                }
            }
        }
    })
}
