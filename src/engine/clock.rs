use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, Utc};
use tokio::time::Instant;

/// Wall-clock source in exchange-local time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<FixedOffset>;
}

/// Real time at a fixed UTC offset
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    offset: FixedOffset,
}

impl SystemClock {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        Utc::now().with_timezone(&self.offset)
    }
}

/// Wall clock derived from tokio's timer
///
/// Starts at `start` and advances with `tokio::time::Instant`, so with a
/// paused runtime (tests) a whole trading day passes in milliseconds and
/// still lines up with `interval` ticks. `accelerated` runs it `speed`
/// times faster than the timer for rehearsals on a real runtime.
#[derive(Debug, Clone)]
pub struct TokioClock {
    start: DateTime<FixedOffset>,
    origin: Instant,
    speed: f64,
}

impl TokioClock {
    pub fn starting_at(start: DateTime<FixedOffset>) -> Self {
        Self::accelerated(start, 1.0)
    }

    pub fn accelerated(start: DateTime<FixedOffset>, speed: f64) -> Self {
        Self {
            start,
            origin: Instant::now(),
            speed: speed.max(0.0),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<FixedOffset> {
        let elapsed = self.origin.elapsed().mul_f64(self.speed);
        self.start + ChronoDuration::from_std(elapsed).unwrap_or(ChronoDuration::zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_follows_paused_time() {
        let ist = FixedOffset::east_opt(330 * 60).unwrap();
        let start = ist.with_ymd_and_hms(2026, 10, 15, 10, 0, 0).unwrap();
        let clock = TokioClock::starting_at(start);

        assert_eq!(clock.now(), start);
        tokio::time::sleep(std::time::Duration::from_secs(90 * 60)).await;
        assert_eq!(clock.now(), ist.with_ymd_and_hms(2026, 10, 15, 11, 30, 0).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_accelerated_clock() {
        let ist = FixedOffset::east_opt(330 * 60).unwrap();
        let start = ist.with_ymd_and_hms(2026, 10, 15, 10, 30, 0).unwrap();
        let clock = TokioClock::accelerated(start, 60.0);

        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        assert_eq!(clock.now(), ist.with_ymd_and_hms(2026, 10, 15, 10, 35, 0).unwrap());
    }

    #[test]
    fn test_system_clock_uses_offset() {
        let ist = FixedOffset::east_opt(330 * 60).unwrap();
        assert_eq!(SystemClock::new(ist).now().offset(), &ist);
    }
}
