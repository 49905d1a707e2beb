use crate::core::{Result, TxError};
use regex::Regex;
use serde::Deserialize;
use std::num::NonZeroU32;
use std::time::Duration;

pub const DEFAULT_MAX_ATTEMPTS: NonZeroU32 = NonZeroU32::new(10_000).unwrap();
pub const DEFAULT_MAX_TIME_MS: u64 = 5_000;

/// Limits for a single `retry()` call.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    /// Total invocations allowed, the first one included
    pub max_attempts: NonZeroU32,

    /// Wall-clock budget measured from the first invocation
    pub max_time: Duration,

    /// When set, failures whose chain matches none of these abort at once
    pub allowed_failures: Option<Vec<Regex>>,

    /// Emit one trace line per failure, timeout and sleep
    pub verbose: bool,
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryBudget {
    pub fn new() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_time: Duration::from_millis(DEFAULT_MAX_TIME_MS),
            allowed_failures: None,
            verbose: false,
        }
    }

    /// Set the attempt budget. Zero is clamped to one attempt.
    pub fn max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = NonZeroU32::new(max).unwrap_or(NonZeroU32::MIN);
        self
    }

    pub fn max_time(mut self, max: Duration) -> Self {
        self.max_time = max;
        self
    }

    pub fn max_time_ms(self, ms: u64) -> Self {
        self.max_time(Duration::from_millis(ms))
    }

    /// Only retry failures whose message chain matches one of `patterns`
    pub fn allow_failures(mut self, patterns: impl IntoIterator<Item = Regex>) -> Self {
        self.allowed_failures = Some(patterns.into_iter().collect());
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Whether a failure chain may be retried under this budget.
    pub fn permits(&self, chain: &str) -> bool {
        match &self.allowed_failures {
            Some(patterns) => patterns.iter().any(|pattern| pattern.is_match(chain)),
            None => true,
        }
    }
}

/// Deserializable form of [`RetryBudget`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub max_time_ms: u64,
    pub allowed_failure_patterns: Option<Vec<String>>,
    pub verbose: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS.get(),
            max_time_ms: DEFAULT_MAX_TIME_MS,
            allowed_failure_patterns: None,
            verbose: false,
        }
    }
}

impl RetryConfig {
    /// Validate and compile into a budget
    pub fn into_budget(self) -> Result<RetryBudget> {
        let max_attempts = NonZeroU32::new(self.max_attempts)
            .ok_or_else(|| TxError::Config("max_attempts must be > 0".into()))?;

        let allowed_failures = self
            .allowed_failure_patterns
            .map(|patterns| {
                patterns
                    .iter()
                    .map(|pattern| {
                        Regex::new(pattern).map_err(|e| {
                            TxError::Config(format!("invalid failure pattern '{}': {}", pattern, e))
                        })
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?;

        Ok(RetryBudget {
            max_attempts,
            max_time: Duration::from_millis(self.max_time_ms),
            allowed_failures,
            verbose: self.verbose,
        })
    }
}
