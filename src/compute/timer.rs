use rand::Rng;
use tokio::time::{Duration, Instant, Interval, MissedTickBehavior};

/// Random offset in `[0, max_ms]` so that nodes started together do not tick
/// in lockstep.
pub fn random_jitter(max_ms: u64) -> Duration {
    let mut rng = rand::thread_rng();
    Duration::from_millis(rng.gen_range(0..=max_ms))
}

/// Discovery ticker: first tick after `period + jitter`, then every `period`.
pub fn discovery_ticker(period: Duration, max_jitter_ms: u64) -> Interval {
    let start = Instant::now() + period + random_jitter(max_jitter_ms);
    let mut ticker = tokio::time::interval_at(start, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}
