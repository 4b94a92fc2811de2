//! Retry and ignore rules from the `errors` block.
//!
//! After a failed engine invocation the stderr is matched against the unit's
//! rules. Retry rules are consulted first after every failed attempt; ignore
//! rules are evaluated only once retries are exhausted.

use std::collections::BTreeMap;
use std::time::Duration;

use regex::Regex;
use serde_json::Value as JsonValue;

use crate::config::model::{ErrorsConfig, IgnoreRule, RetryRule};
use crate::error::{Error, Result};

/// Default retryable error patterns, matching the reference orchestrator's
/// built-in list of transient provider and transport failures. Exposed in
/// configuration through `get_default_retryable_errors()`.
pub const DEFAULT_RETRYABLE_ERRORS: &[&str] = &[
    "(?s).*Failed to load state.*tcp.*timeout.*",
    "(?s).*Failed to load backend.*TLS handshake timeout.*",
    "(?s).*Creating metric alarm failed.*request to update this alarm is in progress.*",
    "(?s).*Error installing provider.*TLS handshake timeout.*",
    "(?s).*Error configuring the backend.*TLS handshake timeout.*",
    "(?s).*Error installing provider.*tcp.*timeout.*",
    "(?s).*Error installing provider.*tcp.*connection reset by peer.*",
    "NoSuchBucket: The specified bucket does not exist",
    "(?s).*Error creating SSM parameter: TooManyUpdates:.*",
    "(?s).*app\\.terraform\\.io.*: 429 Too Many Requests.*",
    "(?s).*ssh_exchange_identification.*Connection closed by remote host.*",
    "(?s).*Client\\.Timeout exceeded while awaiting headers.*",
    "(?s).*Could not download module.*The requested URL returned error: 429.*",
];

/// What to do with a unit after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureDisposition {
    Retry {
        rule: String,
        sleep: Duration,
    },
    Ignore {
        rule: String,
        message: Option<String>,
        signals: BTreeMap<String, JsonValue>,
    },
    Fail,
}

/// Match a pattern list with `!` negation: at least one positive pattern must
/// match and no negated pattern may match.
fn rule_matches(patterns: &[String], stderr: &str) -> Result<bool> {
    let mut positive_hit = false;
    let mut has_positive = false;
    for pattern in patterns {
        let (negated, raw) = match pattern.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, pattern.as_str()),
        };
        let re = Regex::new(raw)
            .map_err(|e| Error::Other(format!("invalid error pattern {pattern:?}: {e}")))?;
        if negated {
            if re.is_match(stderr) {
                return Ok(false);
            }
        } else {
            has_positive = true;
            if re.is_match(stderr) {
                positive_hit = true;
            }
        }
    }
    Ok(has_positive && positive_hit)
}

fn matching_retry<'a>(rules: &'a [RetryRule], stderr: &str) -> Result<Option<&'a RetryRule>> {
    for rule in rules {
        if rule_matches(&rule.retryable_errors, stderr)? {
            return Ok(Some(rule));
        }
    }
    Ok(None)
}

fn matching_ignore<'a>(rules: &'a [IgnoreRule], stderr: &str) -> Result<Option<&'a IgnoreRule>> {
    for rule in rules {
        if rule_matches(&rule.ignorable_errors, stderr)? {
            return Ok(Some(rule));
        }
    }
    Ok(None)
}

/// Decide the disposition of attempt number `attempt` (1-based) that failed
/// with the given stderr.
pub fn classify_failure(
    errors: &ErrorsConfig,
    stderr: &str,
    attempt: u32,
) -> Result<FailureDisposition> {
    if let Some(rule) = matching_retry(&errors.retries, stderr)? {
        if attempt < rule.max_attempts {
            return Ok(FailureDisposition::Retry {
                rule: rule.label.clone(),
                sleep: Duration::from_secs(rule.sleep_interval_sec),
            });
        }
    }
    if let Some(rule) = matching_ignore(&errors.ignores, stderr)? {
        return Ok(FailureDisposition::Ignore {
            rule: rule.label.clone(),
            message: rule.message.clone(),
            signals: rule.signals.clone(),
        });
    }
    Ok(FailureDisposition::Fail)
}
