//! Periodic provider tasks
//!
//! Heartbeat and disconnect tracking run at independent rates and stop when
//! the provider signals shutdown or is dropped.

use std::{sync::Weak, time::Duration};

use tokio::{
    sync::watch,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, info, instrument};

use crate::provider::NodeServerProvider;

#[instrument(skip_all, fields(interval_ms = period.as_millis() as u64))]
pub(crate) async fn run_heartbeat(
    provider: Weak<NodeServerProvider>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!("Starting heartbeat task");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(provider) = provider.upgrade() else {
                    break;
                };
                let peers = provider.publish_local_snapshot();
                debug!(peers, "Published local snapshot");
            }
            _ = shutdown_rx.changed() => {
                info!("Heartbeat task received shutdown signal");
                break;
            }
        }
    }
}

#[instrument(skip_all, fields(interval_ms = period.as_millis() as u64))]
pub(crate) async fn run_disconnect_tracker(
    provider: Weak<NodeServerProvider>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately, peers get a full period first
    ticker.tick().await;
    info!("Starting disconnect tracker");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(provider) = provider.upgrade() else {
                    break;
                };
                let closed = provider.close_unresponsive_nodes();
                if closed > 0 {
                    info!(closed, "Closed unresponsive nodes");
                }
            }
            _ = shutdown_rx.changed() => {
                info!("Disconnect tracker received shutdown signal");
                break;
            }
        }
    }
}
