use crate::engine::TickOutcome;
use std::future::Future;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::error;

/// Runs an operation every `period` on the current task. A tick runs to
/// completion before the next one is considered, so ticks never overlap.
#[derive(Debug, Clone, Copy)]
pub struct Scheduler {
    period: Duration,
}

impl Scheduler {
    pub fn new(period: Duration) -> Self {
        Self { period }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Call `tick` once per period until `shutdown` resolves, returning the
    /// number of ticks run. The first tick fires one period after the start.
    /// Faulted ticks are logged and do not stop the schedule.
    pub async fn run<F, S>(&self, mut tick: F, shutdown: S) -> u64
    where
        F: FnMut() -> TickOutcome,
        S: Future<Output = ()>,
    {
        let mut timer = interval_at(Instant::now() + self.period, self.period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        let mut ticks = 0u64;
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = timer.tick() => {
                    ticks += 1;
                    if let TickOutcome::Faulted(e) = tick() {
                        error!(tick = ticks, "Error updating consumption: {e}");
                    }
                }
            }
        }
        ticks
    }
}
