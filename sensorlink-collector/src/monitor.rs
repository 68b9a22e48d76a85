use crate::hub::SharedHub;
use crate::registry::{LivenessPolicy, Moment};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Une passe : lecture et mutation sous le même verrou
pub fn run_sweep(hub: &SharedHub, policy: &LivenessPolicy) -> usize {
    let timed_out = hub.lock().sweep(Moment::now(), policy);
    if timed_out > 0 {
        info!(timed_out, "liveness sweep marked clients offline");
    }
    timed_out
}

/// Surveille périodiquement les clients online et déclare les timeouts.
/// Never touches the transport: silence alone is enough to go offline.
pub fn spawn_liveness_monitor(
    hub: SharedHub,
    policy: LivenessPolicy,
    sweep_interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    info!(
        sweep_ms = sweep_interval.as_millis() as u64,
        grace_ms = policy.grace.as_millis() as u64,
        max_missed = policy.max_missed,
        "starting liveness monitor"
    );

    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + sweep_interval, sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    run_sweep(&hub, &policy);
                }
            }
        }
        debug!("liveness monitor stopped");
    })
}
