use crate::backoff::RetryBudget;
use crate::core::{Result, TxError};
use regex::Regex;
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Failure texts a manual-framing backend reports under contention.
pub const CONTENTION_PATTERNS: [&str; 2] = [
    "database is locked",
    "cannot start a transaction within a transaction",
];

pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Locking behaviour requested on `BEGIN`.
///
/// Only meaningful for manual-framing backends; trusted backends ignore it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockingMode {
    #[default]
    None,
    Deferred,
    Immediate,
    Exclusive,
}

impl LockingMode {
    pub fn keyword(&self) -> &'static str {
        match self {
            LockingMode::None => "",
            LockingMode::Deferred => "DEFERRED",
            LockingMode::Immediate => "IMMEDIATE",
            LockingMode::Exclusive => "EXCLUSIVE",
        }
    }

    /// `BEGIN`, or `BEGIN <MODE>`
    pub fn begin_statement(&self) -> String {
        match self {
            LockingMode::None => "BEGIN".to_string(),
            mode => format!("BEGIN {}", mode.keyword()),
        }
    }
}

/// Which transaction capability a backend offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum BackendKind {
    /// Native transactions already isolate correctly
    Trusted,
    /// Needs explicit BEGIN/COMMIT/ROLLBACK plus serialization
    Manual,
}

impl FromStr for BackendKind {
    type Err = TxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trusted" | "native" | "pg" | "postgres" | "postgresql" => Ok(BackendKind::Trusted),
            "manual" | "framed" | "sqlite" => Ok(BackendKind::Manual),
            _ => Err(TxError::UnknownBackendKind(s.to_string())),
        }
    }
}

impl TryFrom<String> for BackendKind {
    type Error = TxError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Trusted => write!(f, "trusted"),
            BackendKind::Manual => write!(f, "manual"),
        }
    }
}

/// Per-coordinator transaction settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TransactionOptions {
    /// Wall-clock budget for retrying one logical transaction
    pub busy_timeout_ms: u64,

    /// Mode keyword appended to `BEGIN`
    pub locking_mode: LockingMode,

    /// Skip the admission queue and run attempts directly.
    ///
    /// Reduced safety: without the queue nothing prevents two transactions
    /// from interleaving on a backend whose own framing cannot be trusted.
    /// Meant for exercising real contention in tests, not for production
    /// load against a manual-framing backend.
    pub bypass_admission_queue: bool,

    /// Forward retry traces to the installed `tracing` subscriber
    pub verbose: bool,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            locking_mode: LockingMode::None,
            bypass_admission_queue: false,
            verbose: false,
        }
    }
}

impl TransactionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn busy_timeout_ms(mut self, ms: u64) -> Self {
        self.busy_timeout_ms = ms;
        self
    }

    pub fn locking_mode(mut self, mode: LockingMode) -> Self {
        self.locking_mode = mode;
        self
    }

    pub fn bypass_admission_queue(mut self, bypass: bool) -> Self {
        self.bypass_admission_queue = bypass;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Budget used for each framed transaction: the busy timeout bounds the
    /// time, and only the contention patterns are retried.
    pub fn retry_budget(&self) -> Result<RetryBudget> {
        let patterns = CONTENTION_PATTERNS
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| TxError::Config(format!("{}: {}", pattern, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(RetryBudget::new()
            .max_time(self.busy_timeout())
            .allow_failures(patterns)
            .verbose(self.verbose))
    }

    /// Validate options
    pub fn validate(&self) -> Result<()> {
        // A timeout of zero is allowed: it means "try once, never wait"
        if self.busy_timeout_ms > u64::from(u32::MAX) {
            return Err(TxError::Config(format!(
                "busy_timeout_ms {} is out of range",
                self.busy_timeout_ms
            )));
        }
        Ok(())
    }
}

/// Coordinator selection plus its options, as loaded from configuration.
///
/// ```json
/// { "backend": "sqlite", "transaction": { "busy_timeout_ms": 2000, "locking_mode": "immediate" } }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CoordinatorConfig {
    pub backend: BackendKind,

    #[serde(default)]
    pub transaction: TransactionOptions,
}

impl CoordinatorConfig {
    pub fn new(backend: BackendKind) -> Self {
        Self {
            backend,
            transaction: TransactionOptions::default(),
        }
    }

    pub fn transaction(mut self, options: TransactionOptions) -> Self {
        self.transaction = options;
        self
    }

    /// Parse and validate a JSON document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_json_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        self.transaction.validate()
    }
}
