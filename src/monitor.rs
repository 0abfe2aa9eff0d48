//! Background sampler of live cgroup memory.
//!
//! `memory.peak` can lag or miss usage around process exit, so the monitor
//! polls `memory.current` of both groups and keeps a running maximum.

use crate::cgroup::CgroupHandle;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Highest `memory.current` seen per sandbox, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampledPeaks {
    pub judge: u64,
    pub player: u64,
}

#[derive(Debug, Default)]
struct PeakMemory {
    judge: AtomicU64,
    player: AtomicU64,
}

impl PeakMemory {
    fn record(slot: &AtomicU64, name: &str, value: u64) {
        let previous = slot.fetch_max(value, Ordering::AcqRel);
        if value > previous {
            debug!(sandbox = name, bytes = value, "New memory peak");
        }
    }

    fn snapshot(&self) -> SampledPeaks {
        SampledPeaks {
            judge: self.judge.load(Ordering::Acquire),
            player: self.player.load(Ordering::Acquire),
        }
    }
}

/// Handle to the running sampler task.
pub struct ResourceMonitor {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
    peaks: Arc<PeakMemory>,
}

impl ResourceMonitor {
    /// Start sampling both groups every `interval`.
    pub fn start(judge: &CgroupHandle, player: &CgroupHandle, interval: Duration) -> Self {
        let peaks = Arc::new(PeakMemory::default());
        let (stop, mut stopped) = oneshot::channel();
        let judge = judge.clone();
        let player = player.clone();
        let sampled = Arc::clone(&peaks);

        let task = tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = ticker.tick() => {
                        if let Some(bytes) = judge.memory_current() {
                            PeakMemory::record(&sampled.judge, judge.name(), bytes);
                        }
                        if let Some(bytes) = player.memory_current() {
                            PeakMemory::record(&sampled.player, player.name(), bytes);
                        }
                    }
                }
            }
        });

        info!(interval_ms = interval.as_millis() as u64, "Resource monitor started");
        Self { stop, task, peaks }
    }

    /// Signal the sampler and wait until it has exited. The peaks returned
    /// include every sample taken, with no sample still in flight.
    pub async fn stop(self) -> SampledPeaks {
        let _ = self.stop.send(());
        if let Err(e) = self.task.await {
            warn!(error = %e, "Resource monitor task failed");
        }
        let peaks = self.peaks.snapshot();
        info!(judge_bytes = peaks.judge, player_bytes = peaks.player, "Resource monitor stopped");
        peaks
    }
}
