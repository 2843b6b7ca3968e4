//! Check definitions.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CheckError, CheckResult};

/// Default probe timeout for HTTP checks.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for script checks.
pub const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(30);

/// How a check decides its status. Exactly one of `ttl`, `script` or
/// `http` must be usable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckType {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<Duration>,
}

/// A validated [`CheckType`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckKind {
    Ttl {
        ttl: Duration,
    },
    Script {
        script: String,
        interval: Duration,
        timeout: Duration,
    },
    Http {
        url: String,
        interval: Duration,
        timeout: Duration,
    },
}

impl CheckType {
    pub fn is_ttl(&self) -> bool {
        self.ttl.is_some_and(|t| !t.is_zero())
    }

    pub fn is_monitor(&self) -> bool {
        self.script.as_deref().is_some_and(|s| !s.is_empty()) && self.has_interval()
    }

    pub fn is_http(&self) -> bool {
        self.http.as_deref().is_some_and(|s| !s.is_empty()) && self.has_interval()
    }

    pub fn valid(&self) -> bool {
        self.is_ttl() || self.is_monitor() || self.is_http()
    }

    fn has_interval(&self) -> bool {
        self.interval.is_some_and(|i| !i.is_zero())
    }

    /// Resolve which probe this definition describes. TTL wins over
    /// script, script over HTTP.
    pub fn validate(&self) -> CheckResult<CheckKind> {
        if let Some(ttl) = self.ttl.filter(|t| !t.is_zero()) {
            return Ok(CheckKind::Ttl { ttl });
        }
        let interval = self.interval.filter(|i| !i.is_zero());
        match (&self.script, &self.http, interval) {
            (Some(script), _, Some(interval)) if !script.is_empty() => Ok(CheckKind::Script {
                script: script.clone(),
                interval,
                timeout: self.timeout.unwrap_or(DEFAULT_SCRIPT_TIMEOUT),
            }),
            (_, Some(url), Some(interval)) if !url.is_empty() => {
                // Never wait longer than the interval for a single probe.
                let timeout = self
                    .timeout
                    .unwrap_or_else(|| DEFAULT_HTTP_TIMEOUT.min(interval));
                Ok(CheckKind::Http {
                    url: url.clone(),
                    interval,
                    timeout,
                })
            }
            (Some(_), _, None) | (_, Some(_), None) => {
                Err(CheckError::Invalid("interval checks need a non-zero interval".to_string()))
            }
            _ => Err(CheckError::Invalid(
                "one of ttl, script+interval or http+interval is required".to_string(),
            )),
        }
    }
}

/// Parse a duration string like "5s", "500ms", "2m" or a plain number of
/// seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim().parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.trim().parse::<u64>().ok().map(|h| Duration::from_secs(h * 3600))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
