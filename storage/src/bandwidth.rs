//! Token-bucket bandwidth shaping with scheduled configurations.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{Datelike, Local, NaiveTime, Timelike, Weekday};
use tokio::time::Instant;
use tracing::debug;

/// One bandwidth configuration:
/// a sustained rate and a burst capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateConfig {
    pub bytes_per_second: u64,
    pub burst_bytes: u64,
}

#[derive(Debug)]
struct Bucket {
    config: RateConfig,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill);
        self.last_refill = now;
        let refilled = elapsed.as_secs_f64() * self.config.bytes_per_second as f64;
        self.tokens = (self.tokens + refilled).min(self.config.burst_bytes as f64);
    }
}

/// An asynchronous token bucket.
///
/// The bucket holds at most `burst_bytes` tokens
/// and refills at `bytes_per_second`.
/// Acquiring more than is available consumes what is there
/// and sleeps for the deficit.
#[derive(Debug)]
pub struct BandwidthLimiter {
    bucket: Mutex<Bucket>,
}

impl BandwidthLimiter {
    pub fn new(config: RateConfig) -> Self {
        BandwidthLimiter {
            bucket: Mutex::new(Bucket {
                config,
                tokens: config.burst_bytes as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Replace the configuration,
    /// re-seeding the bucket with the new capacity.
    pub fn reconfigure(&self, config: RateConfig) {
        let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
        bucket.config = config;
        bucket.tokens = config.burst_bytes as f64;
        bucket.last_refill = Instant::now();
    }

    /// The currently active configuration.
    pub fn config(&self) -> RateConfig {
        self.bucket.lock().unwrap_or_else(|e| e.into_inner()).config
    }

    /// Take `n` tokens without waiting.
    /// Returns whether the bucket held enough.
    pub fn try_acquire(&self, n: u64) -> bool {
        let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
        bucket.refill(Instant::now());
        if bucket.tokens >= n as f64 {
            bucket.tokens -= n as f64;
            true
        } else {
            false
        }
    }

    /// Take `n` tokens, sleeping for the deficit as needed.
    /// Returns the total time spent waiting.
    pub async fn acquire(&self, n: u64) -> Duration {
        let mut needed = n as f64;
        let mut waited = Duration::ZERO;
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
                bucket.refill(Instant::now());
                if bucket.tokens >= needed {
                    bucket.tokens -= needed;
                    return waited;
                }
                // drain what is available now, wait for the rest
                needed -= bucket.tokens;
                bucket.tokens = 0.0;
                Duration::from_secs_f64(needed / bucket.config.bytes_per_second as f64)
            };
            debug!(?wait, "bandwidth limit reached, shaping");
            tokio::time::sleep(wait).await;
            waited += wait;
        }
    }
}

/// A time-of-day window during which a specific rate applies.
///
/// Windows crossing midnight are handled as the disjunction
/// of the evening part (on the listed days)
/// and the morning part (on the following days).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulePeriod {
    pub start: NaiveTime,
    pub end: NaiveTime,
    /// days of the week on which the window starts;
    /// `None` means every day
    pub days: Option<Vec<Weekday>>,
    pub rate: RateConfig,
}

impl SchedulePeriod {
    fn day_matches(&self, weekday: Weekday) -> bool {
        match &self.days {
            None => true,
            Some(days) => days.contains(&weekday),
        }
    }

    /// Whether the window is active at the given weekday and time.
    pub fn contains(&self, weekday: Weekday, time: NaiveTime) -> bool {
        if self.start <= self.end {
            self.day_matches(weekday) && time >= self.start && time < self.end
        } else {
            // crosses midnight: evening part on the listed day,
            // morning part on the day after
            (self.day_matches(weekday) && time >= self.start)
                || (self.day_matches(weekday.pred()) && time < self.end)
        }
    }
}

/// A bandwidth limiter whose configuration
/// follows a time-of-day schedule.
#[derive(Debug)]
pub struct ScheduledLimiter {
    limiter: BandwidthLimiter,
    default_rate: RateConfig,
    periods: Vec<SchedulePeriod>,
}

impl ScheduledLimiter {
    pub fn new(default_rate: RateConfig, periods: Vec<SchedulePeriod>) -> Self {
        ScheduledLimiter {
            limiter: BandwidthLimiter::new(default_rate),
            default_rate,
            periods,
        }
    }

    /// The rate which applies at the given weekday and time:
    /// the first matching period, or the default.
    pub fn rate_at(&self, weekday: Weekday, time: NaiveTime) -> RateConfig {
        self.periods
            .iter()
            .find(|period| period.contains(weekday, time))
            .map(|period| period.rate)
            .unwrap_or(self.default_rate)
    }

    fn refresh(&self) {
        let now = Local::now();
        let weekday = now.weekday();
        let time = NaiveTime::from_hms_opt(now.hour(), now.minute(), now.second())
            .unwrap_or(NaiveTime::MIN);
        let rate = self.rate_at(weekday, time);
        if rate != self.limiter.config() {
            debug!(?rate, "bandwidth schedule changed, re-seeding limiter");
            self.limiter.reconfigure(rate);
        }
    }

    /// Take `n` tokens under the currently scheduled rate.
    pub async fn acquire(&self, n: u64) -> Duration {
        self.refresh();
        self.limiter.acquire(n).await
    }

    /// Take `n` tokens without waiting,
    /// under the currently scheduled rate.
    pub fn try_acquire(&self, n: u64) -> bool {
        self.refresh();
        self.limiter.try_acquire(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn try_acquire_respects_capacity() {
        let limiter = BandwidthLimiter::new(RateConfig {
            bytes_per_second: 1_000,
            burst_bytes: 4_096,
        });
        assert!(limiter.try_acquire(4_096));
        assert!(!limiter.try_acquire(1));
    }

    #[test]
    fn reconfigure_reseeds_the_bucket() {
        let limiter = BandwidthLimiter::new(RateConfig {
            bytes_per_second: 1_000,
            burst_bytes: 1_024,
        });
        assert!(limiter.try_acquire(1_024));
        limiter.reconfigure(RateConfig {
            bytes_per_second: 2_000,
            burst_bytes: 8_192,
        });
        assert!(limiter.try_acquire(8_192));
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_sleeps_for_the_deficit() {
        let limiter = BandwidthLimiter::new(RateConfig {
            bytes_per_second: 1_000,
            burst_bytes: 1_000,
        });
        // the burst goes through immediately
        assert_eq!(limiter.acquire(1_000).await, Duration::ZERO);
        // the next kilobyte costs about a second of waiting
        let waited = limiter.acquire(1_000).await;
        assert!(waited >= Duration::from_millis(900), "waited {:?}", waited);
    }

    #[test]
    fn period_within_one_day() {
        let period = SchedulePeriod {
            start: at(8, 0),
            end: at(18, 0),
            days: None,
            rate: RateConfig {
                bytes_per_second: 100,
                burst_bytes: 100,
            },
        };
        assert!(period.contains(Weekday::Mon, at(8, 0)));
        assert!(period.contains(Weekday::Sun, at(12, 30)));
        assert!(!period.contains(Weekday::Mon, at(18, 0)));
        assert!(!period.contains(Weekday::Mon, at(7, 59)));
    }

    #[test]
    fn period_crossing_midnight_is_a_disjunction() {
        let period = SchedulePeriod {
            start: at(22, 0),
            end: at(6, 0),
            days: Some(vec![Weekday::Fri]),
            rate: RateConfig {
                bytes_per_second: 100,
                burst_bytes: 100,
            },
        };
        // evening part on friday
        assert!(period.contains(Weekday::Fri, at(23, 0)));
        // morning part spills into saturday
        assert!(period.contains(Weekday::Sat, at(5, 0)));
        assert!(!period.contains(Weekday::Sat, at(6, 0)));
        assert!(!period.contains(Weekday::Fri, at(5, 0)));
        assert!(!period.contains(Weekday::Sun, at(23, 0)));
    }

    #[test]
    fn scheduled_limiter_picks_the_first_matching_period() {
        let off_peak = RateConfig {
            bytes_per_second: 10_000_000,
            burst_bytes: 1_000_000,
        };
        let business_hours = RateConfig {
            bytes_per_second: 1_000_000,
            burst_bytes: 100_000,
        };
        let limiter = ScheduledLimiter::new(
            off_peak,
            vec![SchedulePeriod {
                start: at(8, 0),
                end: at(18, 0),
                days: Some(vec![
                    Weekday::Mon,
                    Weekday::Tue,
                    Weekday::Wed,
                    Weekday::Thu,
                    Weekday::Fri,
                ]),
                rate: business_hours,
            }],
        );

        assert_eq!(limiter.rate_at(Weekday::Wed, at(10, 0)), business_hours);
        assert_eq!(limiter.rate_at(Weekday::Wed, at(20, 0)), off_peak);
        assert_eq!(limiter.rate_at(Weekday::Sat, at(10, 0)), off_peak);
    }
}
