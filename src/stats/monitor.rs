use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::StatsSampler;
use crate::events::{EventBus, SessionEvent};
use crate::peer::PeerTransport;
use crate::utils::LogThrottler;

/// Periodic statistics sampling for one connection
///
/// Owned by the session; dropping it stops the sampling task.
pub struct StatsMonitor {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl StatsMonitor {
    /// Start sampling `peer` every `interval`
    pub fn start(
        peer: Arc<dyn PeerTransport>,
        events: Arc<EventBus>,
        stream_id: String,
        interval: Duration,
        token: CancellationToken,
    ) -> Self {
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            let start = Instant::now();
            let mut sampler = StatsSampler::new(start);
            let throttler = LogThrottler::with_secs(10);
            let mut ticker = interval_at(start + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!("Stats monitor started for {} (every {:?})", stream_id, interval);
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                match peer.get_stats().await {
                    Ok(report) => {
                        throttler.clear("stats");
                        let stats = sampler.sample(&report, Instant::now());
                        debug!(
                            "Stats {}: sent={}B recv={}B lost={} avg={:.0}bps",
                            stream_id,
                            stats.bytes_sent,
                            stats.bytes_received,
                            stats.packets_lost,
                            stats.avg_bitrate_bps
                        );
                        events.emit(SessionEvent::StatsUpdate {
                            stream_id: stream_id.clone(),
                            stats,
                        });
                    }
                    Err(e) => {
                        if let Some(suppressed) = throttler.check("stats") {
                            warn!(
                                "Stats sampling failed for {}: {} ({} similar suppressed)",
                                stream_id, e, suppressed
                            );
                            events.emit(SessionEvent::StreamingError {
                                stream_id: Some(stream_id.clone()),
                                kind: "stats".to_string(),
                                message: e.to_string(),
                            });
                        }
                    }
                }
            }
            debug!("Stats monitor stopped for {}", stream_id);
        });

        Self { token, handle }
    }

    pub fn stop(&self) {
        self.token.cancel();
        self.handle.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for StatsMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
