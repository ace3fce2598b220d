//! Event-loop-lag measurement: the worker-side self sampler and the
//! master-side per-worker probe state.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Drift below this is measurement noise and reports as zero.
const LAG_THRESHOLD_MS: u64 = 2;

/// Worker-side lag sampler: schedules a fixed-interval tick and records how
/// late each tick actually ran. Lag is a proxy for how busy this process's
/// event loop is.
pub struct LagSampler {
    delay_ms: Arc<AtomicI64>,
    handle: JoinHandle<()>,
}

impl LagSampler {
    pub fn start(interval_ms: u64) -> Self {
        let delay_ms = Arc::new(AtomicI64::new(0));
        let cell = Arc::clone(&delay_ms);
        let period = Duration::from_millis(interval_ms);

        let handle = tokio::spawn(async move {
            let mut expected = Instant::now() + period;
            loop {
                tokio::time::sleep_until(expected).await;
                let now = Instant::now();
                let drift = now.saturating_duration_since(expected).as_millis() as i64;
                let reported = if drift > LAG_THRESHOLD_MS as i64 { drift } else { 0 };
                cell.store(reported, Ordering::Relaxed);
                // re-anchor on the actual wake-up so one long stall is not
                // counted again on every following tick
                expected = now + period;
            }
        });

        Self { delay_ms, handle }
    }

    /// Latest sampled lag in milliseconds.
    pub fn current(&self) -> i64 {
        self.delay_ms.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for LagSampler {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Master-side probe state for one worker slot.
///
/// Each poll cycle the master reads the delay the worker last reported and
/// then asks for a fresh sample. A worker that has stopped answering ages:
/// its effective delay grows with the time since its last answer, so a stuck
/// worker steadily loses the "fastest" selection.
#[derive(Debug)]
pub struct LagProbe {
    last_delay: i64,
    last_answer: Instant,
}

impl LagProbe {
    pub fn new() -> Self {
        Self {
            last_delay: 0,
            last_answer: Instant::now(),
        }
    }

    /// Fold one poll observation in. `reported` is the worker's last pushed
    /// delay, or -1 when it has not answered since the previous poll.
    pub fn observe(&mut self, reported: i64, now: Instant) -> i64 {
        if reported > -1 {
            self.last_delay = reported;
            self.last_answer = now;
        } else {
            self.last_delay = now.saturating_duration_since(self.last_answer).as_millis() as i64;
        }
        self.last_delay
    }

    pub fn current(&self) -> i64 {
        self.last_delay
    }
}

impl Default for LagProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sampler_reports_near_zero_when_idle() {
        let sampler = LagSampler::start(20);
        tokio::time::sleep(Duration::from_millis(90)).await;
        // idle event loop: drift stays under the noise threshold
        assert_eq!(sampler.current(), 0);
        sampler.stop();
    }

    #[tokio::test]
    async fn probe_takes_reported_value_and_ages_silence() {
        let mut probe = LagProbe::new();
        let t0 = Instant::now();

        assert_eq!(probe.observe(12, t0), 12);

        // no answer for a second: effective delay is the silence duration
        let t1 = t0 + Duration::from_millis(1000);
        assert_eq!(probe.observe(-1, t1), 1000);

        // an answer resets both delay and the aging anchor
        assert_eq!(probe.observe(3, t1), 3);
        let t2 = t1 + Duration::from_millis(250);
        assert_eq!(probe.observe(-1, t2), 250);
    }
}
