//! Backend configuration.

use crate::error::Result;
use crate::idl::DEFAULT_MAX_IDS;
use crate::limits::{Limits, StaticLimitsPolicy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Retry policy for deadlock and lock-not-granted conditions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), doubling up to the cap.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_backoff_ms: 1,
            max_backoff_ms: 50,
        }
    }
}

/// Persistent search configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PsearchConfig {
    /// DNs treated as administrative identities.
    pub admin_dns: Vec<String>,

    /// Limits for non-administrative identities.
    pub limits: Limits,

    /// Per-identity limit overrides keyed by DN.
    pub identity_limits: HashMap<String, Limits>,

    /// Referral URLs returned when the base has no existing ancestor.
    pub default_referrals: Vec<String>,

    /// Bound on explicit candidate lists before they degrade to a range.
    /// Default: 65536
    pub max_candidate_ids: usize,

    pub retry: RetryPolicy,

    /// Per-connection notification buffer.
    /// Default: 1000
    pub notification_buffer: usize,
}

impl Default for PsearchConfig {
    fn default() -> Self {
        Self {
            admin_dns: Vec::new(),
            limits: Limits::default(),
            identity_limits: HashMap::new(),
            default_referrals: Vec::new(),
            max_candidate_ids: DEFAULT_MAX_IDS,
            retry: RetryPolicy::default(),
            notification_buffer: 1000,
        }
    }
}

impl PsearchConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }

    /// Build the limits policy described by this configuration.
    pub fn limits_policy(&self) -> StaticLimitsPolicy {
        let policy = self
            .admin_dns
            .iter()
            .fold(StaticLimitsPolicy::new(self.limits), |p, dn| {
                p.with_admin(dn.as_str())
            });
        self.identity_limits
            .iter()
            .fold(policy, |p, (dn, limits)| p.with_override(dn.as_str(), *limits))
    }
}
