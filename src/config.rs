use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Option name holding the requested log verbosity.
pub const LOG_LEVEL_KEY: &str = "log-level";

/// The option mapping delivered by the hosting runtime for a single
/// reconcile pass.
///
/// A [`Config`] has no mutating methods: a pass reads it, never writes it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Config(BTreeMap<String, String>);

impl Config {
    /// Raw value of option `key`, if set.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// All options in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Parses the `log-level` option. Other options are not inspected.
    pub fn log_level(&self) -> Result<LogLevel, Error> {
        self.get(LOG_LEVEL_KEY)
            .ok_or(Error::MissingLogLevel)?
            .parse()
    }
}

impl From<BTreeMap<String, String>> for Config {
    fn from(options: BTreeMap<String, String>) -> Self {
        Self(options)
    }
}

impl<K, V> FromIterator<(K, V)> for Config
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Accepted values of the `log-level` option.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Debug,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub const ALL: [LogLevel; 5] = [
        LogLevel::Info,
        LogLevel::Debug,
        LogLevel::Warning,
        LogLevel::Error,
        LogLevel::Critical,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Critical => "critical",
        }
    }

    /// The `tracing` filter directive for this level. `tracing` has no
    /// level above `ERROR`, so `critical` shares it.
    pub fn directive(self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Warning => "warn",
            LogLevel::Error | LogLevel::Critical => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LogLevel::ALL
            .into_iter()
            .find(|level| level.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::InvalidLogLevel(s.to_string()))
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static settings of the operator itself, as opposed to the per-pass
/// [`Config`] handed over by the hosting runtime.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Settings {
    /// Name of the managed service and its container.
    pub service: String,
    /// Command the workload is launched with.
    pub command: String,
    /// Prefix of every environment variable derived from [`Config`].
    pub env_prefix: String,
    /// Integrations that must have relation data before the workload is
    /// declared.
    pub required_relations: BTreeSet<String>,
    /// Upper bound for each call on the workload, in seconds. Values below
    /// [`MIN_CONNECT_TIMEOUT_SECS`] are raised to it.
    pub connect_timeout_secs: u64,
}

/// Shortest bound applied to a workload call.
pub const MIN_CONNECT_TIMEOUT_SECS: u64 = 1;

impl Settings {
    /// The configured workload call bound, never shorter than
    /// [`MIN_CONNECT_TIMEOUT_SECS`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(MIN_CONNECT_TIMEOUT_SECS))
    }

    /// Option prefix of framework-owned options, e.g. `django-` for the
    /// `DJANGO_` environment prefix.
    pub(crate) fn option_prefix(&self) -> String {
        let mut prefix = self
            .env_prefix
            .trim_end_matches('_')
            .to_ascii_lowercase()
            .replace('_', "-");
        prefix.push('-');
        prefix
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            service: "django".to_string(),
            command: "/bin/python3 -m gunicorn -c /django/gunicorn.conf.py django_app.wsgi:application"
                .to_string(),
            env_prefix: "DJANGO_".to_string(),
            required_relations: BTreeSet::new(),
            connect_timeout_secs: 5,
        }
    }
}
