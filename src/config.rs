use crate::core::Result;
use crate::transaction::RetryPolicy;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Which write path DML statements take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WritePreference {
    /// Always send DML.
    NeverMutate,
    /// Buffer mutations only in transactions the driver manages itself.
    MutateOnlyImplicit,
    /// Buffer mutations whenever the statement can be translated.
    AlwaysMutate,
}

impl std::str::FromStr for WritePreference {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "never_mutate" | "never" => Ok(Self::NeverMutate),
            "mutate_only_implicit" | "implicit" => Ok(Self::MutateOnlyImplicit),
            "always_mutate" | "always" => Ok(Self::AlwaysMutate),
            other => Err(format!("unknown write preference '{other}'")),
        }
    }
}

/// Driver configuration, threaded into every logical transaction.
#[derive(Debug, Clone, Deserialize)]
pub struct DriverConfig {
    #[serde(default = "default_version_column")]
    pub version_column: String,
    #[serde(default = "default_write_preference")]
    pub write_preference: WritePreference,
    #[serde(default = "default_verify_replay")]
    pub verify_replay: bool,
    #[serde(default)]
    pub statement_timeout_ms: Option<u64>,
    #[serde(default)]
    pub transaction_timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_version_column() -> String { "Version".to_string() }
const fn default_write_preference() -> WritePreference { WritePreference::MutateOnlyImplicit }
const fn default_verify_replay() -> bool { true }

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            version_column: default_version_column(),
            write_preference: default_write_preference(),
            verify_replay: default_verify_replay(),
            statement_timeout_ms: None,
            transaction_timeout_ms: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl DriverConfig {
    /// Load configuration with priority: ENV > config file > defaults.
    ///
    /// Environment variables use the `TXREPLAY_` prefix and `__` between
    /// nested keys, e.g. `TXREPLAY_RETRY__MAX_RETRIES=3`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("TXREPLAY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        Ok(builder.build()?.try_deserialize::<Self>()?)
    }

    #[must_use]
    pub fn statement_timeout(&self) -> Option<Duration> {
        self.statement_timeout_ms.map(Duration::from_millis)
    }

    #[must_use]
    pub fn transaction_timeout(&self) -> Option<Duration> {
        self.transaction_timeout_ms.map(Duration::from_millis)
    }

    #[must_use]
    pub fn with_write_preference(mut self, preference: WritePreference) -> Self {
        self.write_preference = preference;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub const fn with_statement_timeout_ms(mut self, ms: u64) -> Self {
        self.statement_timeout_ms = Some(ms);
        self
    }

    #[must_use]
    pub const fn with_transaction_timeout_ms(mut self, ms: u64) -> Self {
        self.transaction_timeout_ms = Some(ms);
        self
    }
}
