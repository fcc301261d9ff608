use crate::serial_link::DEFAULT_READ_TIMEOUT;
use std::time::Duration;

pub const DEFAULT_BAUD_RATE: u32 = 115_200;
pub const DEFAULT_SAMPLES_PER_POINT: usize = 10;
pub const DEFAULT_CALIBRATION_POINTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Baud rate must be greater than zero")]
    ZeroBaudRate,

    #[error("At least one sensor channel is required")]
    NoChannels,

    #[error("At least one reading per calibration point is required")]
    ZeroSamplesPerPoint,

    #[error("A calibration line needs at least 2 points, got {points}")]
    TooFewCalibrationPoints { points: usize },

    #[error("Expected {expected} channel names, got {actual}")]
    ChannelNameCount { expected: usize, actual: usize },

    #[error("Retry policy must allow at least one attempt")]
    NoAttempts,
}

/// Retry budget for malformed frames.
///
/// After failed attempt `n` (1-based) the reader sleeps `n * backoff_step`,
/// never longer than `backoff_ceiling`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_step: Duration,
    pub backoff_ceiling: Duration,
}

impl RetryPolicy {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
    pub const DEFAULT_BACKOFF_STEP: Duration = Duration::from_millis(50);
    pub const DEFAULT_BACKOFF_CEILING: Duration = Duration::from_secs(1);

    pub fn new(max_attempts: u32, backoff_step: Duration, backoff_ceiling: Duration) -> Self {
        Self {
            max_attempts,
            backoff_step,
            backoff_ceiling,
        }
    }

    /// Same attempt budget, no sleeping between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO, Duration::ZERO)
    }

    pub fn backoff_after(&self, attempt: u32) -> Duration {
        self.backoff_step
            .saturating_mul(attempt)
            .min(self.backoff_ceiling)
    }

    /// Upper bound on time spent sleeping by one exhausted read.
    pub fn worst_case_backoff(&self) -> Duration {
        (1..self.max_attempts)
            .map(|attempt| self.backoff_after(attempt))
            .sum()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            Self::DEFAULT_MAX_ATTEMPTS,
            Self::DEFAULT_BACKOFF_STEP,
            Self::DEFAULT_BACKOFF_CEILING,
        )
    }
}

/// Everything a calibration session needs to know up front.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub port: String,
    pub baud_rate: u32,
    pub num_channels: usize,
    pub samples_per_point: usize,
    pub calibration_points: usize,
    pub session_name: String,
    pub channel_names: Vec<String>,
    pub retry: RetryPolicy,
    pub read_timeout: Duration,
}

impl SessionConfig {
    pub fn builder(port: &str, num_channels: usize) -> SessionConfigBuilder {
        SessionConfigBuilder {
            port: port.to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            num_channels,
            samples_per_point: DEFAULT_SAMPLES_PER_POINT,
            calibration_points: DEFAULT_CALIBRATION_POINTS,
            session_name: String::from("calibration"),
            channel_names: None,
            retry: RetryPolicy::default(),
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    pub fn channel_name(&self, channel: usize) -> Option<&str> {
        self.channel_names.get(channel).map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfigBuilder {
    port: String,
    baud_rate: u32,
    num_channels: usize,
    samples_per_point: usize,
    calibration_points: usize,
    session_name: String,
    channel_names: Option<Vec<String>>,
    retry: RetryPolicy,
    read_timeout: Duration,
}

impl SessionConfigBuilder {
    pub fn baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn samples_per_point(mut self, samples: usize) -> Self {
        self.samples_per_point = samples;
        self
    }

    pub fn calibration_points(mut self, points: usize) -> Self {
        self.calibration_points = points;
        self
    }

    pub fn session_name(mut self, name: &str) -> Self {
        self.session_name = name.to_string();
        self
    }

    /// Name each channel. Unnamed channels are called `PT1`, `PT2`, ...
    pub fn channel_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.channel_names = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<SessionConfig, ConfigError> {
        if self.baud_rate == 0 {
            return Err(ConfigError::ZeroBaudRate);
        }
        if self.num_channels == 0 {
            return Err(ConfigError::NoChannels);
        }
        if self.calibration_points < 2 {
            return Err(ConfigError::TooFewCalibrationPoints {
                points: self.calibration_points,
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::NoAttempts);
        }

        let channel_names = match self.channel_names {
            Some(names) if names.len() != self.num_channels => {
                return Err(ConfigError::ChannelNameCount {
                    expected: self.num_channels,
                    actual: names.len(),
                });
            }
            Some(names) => names,
            None => (1..=self.num_channels).map(|i| format!("PT{}", i)).collect(),
        };

        Ok(SessionConfig {
            port: self.port,
            baud_rate: self.baud_rate,
            num_channels: self.num_channels,
            samples_per_point: self.samples_per_point,
            calibration_points: self.calibration_points,
            session_name: self.session_name,
            channel_names,
            retry: self.retry,
            read_timeout: self.read_timeout,
        })
    }
}
