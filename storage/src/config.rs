//! The configuration surface of the storage stack.
//!
//! Configuration is collected from the embedded defaults,
//! an optional `config.yaml` next to the executable,
//! and `DICOMNET`-prefixed environment variables,
//! in that order of precedence.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{NaiveTime, Weekday};
use serde::Deserialize;
use snafu::{ensure, OptionExt, Snafu};

use crate::bandwidth::{RateConfig, SchedulePeriod};
use crate::coordinator::ClientOptions;
use crate::pool::SelectionStrategy;
use crate::retry::RetryPolicy;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ValidationError {
    /// circuit breaker threshold must be at least 1
    BreakerThresholdTooLow,

    #[snafu(display("circuit breaker reset timeout {}s is below the 5s minimum", seconds))]
    BreakerResetTooShort { seconds: u64 },

    #[snafu(display("retry multiplier {} is below 1", multiplier))]
    MultiplierTooLow { multiplier: f64 },

    #[snafu(display("retry jitter {} is outside [0, 1]", jitter))]
    JitterOutOfRange { jitter: f64 },

    #[snafu(display("server `{}` has non-positive weight {}", host, weight))]
    NonPositiveWeight { host: String, weight: f64 },

    #[snafu(display("invalid schedule time {:02}:{:02}", hour, minute))]
    InvalidScheduleTime { hour: u8, minute: u8 },

    #[snafu(display("unknown weekday `{}`", value))]
    UnknownWeekday { value: String },

    #[snafu(display("bandwidth rate must be positive"))]
    NonPositiveRate,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StorageConfig {
    pub calling_ae_title: String,
    pub max_pdu_length: u32,
    #[serde(default)]
    pub strategy: SelectionStrategy,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    /// per-SOP-class retry overrides
    #[serde(default)]
    pub retry_overrides: Vec<RetryOverrideConfig>,
    #[serde(default)]
    pub circuit_breaker: BreakerConfig,
    #[serde(default)]
    pub bandwidth: Option<BandwidthConfig>,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    #[serde(default)]
    pub queue: Option<QueueSettings>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TimeoutConfig {
    pub connect_seconds: Option<u64>,
    pub read_seconds: Option<u64>,
    pub write_seconds: Option<u64>,
    /// total time budget for a single operation
    pub operation_seconds: Option<u64>,
    /// the association (ARTIM) timeout
    pub association_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        TimeoutConfig {
            connect_seconds: Some(10),
            read_seconds: Some(30),
            write_seconds: Some(30),
            operation_seconds: None,
            association_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
            jitter: self.jitter,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RetryOverrideConfig {
    pub sop_class_uid: String,
    #[serde(flatten)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout_seconds: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        BreakerConfig {
            failure_threshold: 5,
            reset_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BandwidthConfig {
    pub bytes_per_second: u64,
    pub burst_bytes: u64,
    #[serde(default)]
    pub schedule: Vec<ScheduleConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ScheduleConfig {
    pub start_hour: u8,
    #[serde(default)]
    pub start_minute: u8,
    pub end_hour: u8,
    #[serde(default)]
    pub end_minute: u8,
    /// days of the week on which the window starts;
    /// absent means every day
    #[serde(default)]
    pub days: Option<Vec<String>>,
    pub bytes_per_second: u64,
    pub burst_bytes: u64,
}

impl ScheduleConfig {
    pub fn to_period(&self) -> Result<SchedulePeriod, ValidationError> {
        let start = NaiveTime::from_hms_opt(self.start_hour.into(), self.start_minute.into(), 0)
            .context(InvalidScheduleTimeSnafu {
                hour: self.start_hour,
                minute: self.start_minute,
            })?;
        let end = NaiveTime::from_hms_opt(self.end_hour.into(), self.end_minute.into(), 0)
            .context(InvalidScheduleTimeSnafu {
                hour: self.end_hour,
                minute: self.end_minute,
            })?;
        let days = match &self.days {
            None => None,
            Some(days) => Some(
                days.iter()
                    .map(|day| parse_weekday(day))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
        };
        ensure!(self.bytes_per_second > 0, NonPositiveRateSnafu);
        Ok(SchedulePeriod {
            start,
            end,
            days,
            rate: RateConfig {
                bytes_per_second: self.bytes_per_second,
                burst_bytes: self.burst_bytes,
            },
        })
    }
}

fn parse_weekday(value: &str) -> Result<Weekday, ValidationError> {
    match value.to_ascii_lowercase().as_str() {
        "mon" | "monday" => Ok(Weekday::Mon),
        "tue" | "tuesday" => Ok(Weekday::Tue),
        "wed" | "wednesday" => Ok(Weekday::Wed),
        "thu" | "thursday" => Ok(Weekday::Thu),
        "fri" | "friday" => Ok(Weekday::Fri),
        "sat" | "saturday" => Ok(Weekday::Sat),
        "sun" | "sunday" => Ok(Weekday::Sun),
        other => UnknownWeekdaySnafu { value: other }.fail(),
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub called_ae_title: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "ServerConfig::default_weight")]
    pub weight: f64,
    #[serde(default = "ServerConfig::default_enabled")]
    pub enabled: bool,
    pub max_pdu_length: Option<u32>,
    /// per-operation time budget for this server, in seconds
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub identity: Option<IdentityConfig>,
}

impl ServerConfig {
    const fn default_weight() -> f64 {
        1.0
    }
    const fn default_enabled() -> bool {
        true
    }

    /// The pool entry equivalent of this configuration.
    pub fn to_spec(&self, default_max_pdu_length: u32) -> crate::pool::ServerSpec {
        let mut spec =
            crate::pool::ServerSpec::new(self.host.clone(), self.port, self.called_ae_title.clone())
                .priority(self.priority)
                .weight(self.weight)
                .enabled(self.enabled);
        spec.max_pdu_length = self.max_pdu_length.unwrap_or(default_max_pdu_length);
        spec.timeout = self.timeout_seconds.map(Duration::from_secs);
        spec.user_identity = self.identity.as_ref().map(|identity| {
            match &identity.password {
                Some(password) => dicomnet_ul::pdu::UserIdentity::username_password(
                    identity.username.as_bytes().to_vec(),
                    password.as_bytes().to_vec(),
                ),
                None => dicomnet_ul::pdu::UserIdentity::username(
                    identity.username.as_bytes().to_vec(),
                ),
            }
        });
        spec
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct IdentityConfig {
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct QueueSettings {
    pub directory: PathBuf,
    #[serde(default = "QueueSettings::default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "QueueSettings::default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,
}

impl QueueSettings {
    const fn default_max_attempts() -> u32 {
        5
    }
    const fn default_poll_interval_seconds() -> u64 {
        30
    }
}

impl StorageConfig {
    /// Loads the configuration from the following sources:
    /// 1. Defaults (defined in `defaults.yaml`)
    /// 2. `config.yaml` in the working directory
    /// 3. Environment variables, prefixed with `DICOMNET`
    ///
    /// # Errors
    /// Returns a [`config::ConfigError`] if source collection fails.
    pub fn load() -> Result<Self, config::ConfigError> {
        use config::{Config, Environment, File, FileFormat};
        Config::builder()
            .add_source(File::from_str(
                include_str!("defaults.yaml"),
                FileFormat::Yaml,
            ))
            .add_source(File::with_name("config.yaml").required(false))
            .add_source(Environment::with_prefix("DICOMNET").separator("_"))
            .build()?
            .try_deserialize()
    }

    /// Check the invariants the runtime relies on.
    pub fn validate(&self) -> Result<(), ValidationError> {
        ensure!(
            self.circuit_breaker.failure_threshold >= 1,
            BreakerThresholdTooLowSnafu
        );
        ensure!(
            self.circuit_breaker.reset_timeout_seconds >= 5,
            BreakerResetTooShortSnafu {
                seconds: self.circuit_breaker.reset_timeout_seconds
            }
        );
        for retry in std::iter::once(&self.retry)
            .chain(self.retry_overrides.iter().map(|o| &o.retry))
        {
            ensure!(
                retry.multiplier >= 1.0,
                MultiplierTooLowSnafu {
                    multiplier: retry.multiplier
                }
            );
            ensure!(
                (0.0..=1.0).contains(&retry.jitter),
                JitterOutOfRangeSnafu {
                    jitter: retry.jitter
                }
            );
        }
        for server in &self.servers {
            ensure!(
                server.weight > 0.0,
                NonPositiveWeightSnafu {
                    host: server.host.clone(),
                    weight: server.weight
                }
            );
        }
        if let Some(bandwidth) = &self.bandwidth {
            ensure!(bandwidth.bytes_per_second > 0, NonPositiveRateSnafu);
            for period in &bandwidth.schedule {
                period.to_period()?;
            }
        }
        Ok(())
    }

    /// The client options equivalent of this configuration.
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            calling_ae_title: self.calling_ae_title.clone(),
            connect_timeout: self.timeouts.connect_seconds.map(Duration::from_secs),
            read_timeout: self.timeouts.read_seconds.map(Duration::from_secs),
            write_timeout: self.timeouts.write_seconds.map(Duration::from_secs),
            operation_timeout: self.timeouts.operation_seconds.map(Duration::from_secs),
            association_timeout: Duration::from_secs(self.timeouts.association_seconds),
            max_pdu_length: self.max_pdu_length,
        }
    }

    /// The per-SOP-class retry policies of this configuration.
    pub fn retry_policies(&self) -> (RetryPolicy, HashMap<String, RetryPolicy>) {
        let overrides = self
            .retry_overrides
            .iter()
            .map(|o| (o.sop_class_uid.clone(), o.retry.to_policy()))
            .collect();
        (self.retry.to_policy(), overrides)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> StorageConfig {
        config::Config::builder()
            .add_source(config::File::from_str(
                include_str!("defaults.yaml"),
                config::FileFormat::Yaml,
            ))
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn defaults_are_valid() {
        let config = parse("");
        config.validate().unwrap();
        assert_eq!(config.calling_ae_title, "DICOMNET-SCU");
        assert_eq!(config.max_pdu_length, 16_384);
        assert_eq!(config.strategy, SelectionStrategy::Priority);
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.servers.is_empty());
        assert!(config.queue.is_none());
    }

    #[test]
    fn parses_servers_and_strategy() {
        let config = parse(
            r#"
strategy: weighted-round-robin
servers:
  - host: pacs1.example.com
    port: 104
    called-ae-title: PACS1
    priority: 10
    weight: 3.0
  - host: pacs2.example.com
    port: 11112
    called-ae-title: PACS2
    enabled: false
"#,
        );
        config.validate().unwrap();
        assert_eq!(config.strategy, SelectionStrategy::WeightedRoundRobin);
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers[0].priority, 10);
        assert_eq!(config.servers[1].weight, 1.0);
        assert!(!config.servers[1].enabled);
    }

    #[test]
    fn validation_rejects_bad_breaker_and_retry() {
        let mut config = parse("");
        config.circuit_breaker.reset_timeout_seconds = 2;
        assert!(matches!(
            config.validate(),
            Err(ValidationError::BreakerResetTooShort { seconds: 2 })
        ));

        let mut config = parse("");
        config.retry.jitter = 1.5;
        assert!(matches!(
            config.validate(),
            Err(ValidationError::JitterOutOfRange { .. })
        ));
    }

    #[test]
    fn schedule_windows_convert_to_periods() {
        let config = parse(
            r#"
bandwidth:
  bytes-per-second: 1000000
  burst-bytes: 100000
  schedule:
    - start-hour: 22
      end-hour: 6
      days: [fri, sat]
      bytes-per-second: 10000000
      burst-bytes: 1000000
"#,
        );
        config.validate().unwrap();
        let bandwidth = config.bandwidth.unwrap();
        let period = bandwidth.schedule[0].to_period().unwrap();
        assert_eq!(period.days.as_deref(), Some(&[Weekday::Fri, Weekday::Sat][..]));
        assert!(period.start > period.end);
    }

    #[test]
    fn retry_overrides_map_per_sop_class() {
        let config = parse(
            r#"
retry-overrides:
  - sop-class-uid: 1.2.840.10008.5.1.4.1.1.2
    max-attempts: 7
    initial-delay-ms: 500
    max-delay-ms: 5000
    multiplier: 1.5
    jitter: 0.2
"#,
        );
        config.validate().unwrap();
        let (default_policy, overrides) = config.retry_policies();
        assert_eq!(default_policy.max_attempts, 3);
        let ct = overrides.get("1.2.840.10008.5.1.4.1.1.2").unwrap();
        assert_eq!(ct.max_attempts, 7);
        assert_eq!(ct.initial_delay, Duration::from_millis(500));
    }
}
