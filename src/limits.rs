//! Size and time limits.
//!
//! Policy values follow the directory server convention: `-1` means
//! unlimited, and a hard limit of `0` means "no hard limit, use the soft
//! one".

use crate::types::Dn;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Soft/hard limit policy for one identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Seconds.
    pub time_soft: i64,
    pub time_hard: i64,
    pub size_soft: i64,
    pub size_hard: i64,
    /// Largest candidate set a non-administrative search may examine.
    pub size_unchecked: i64,
}

impl Limits {
    pub fn unlimited() -> Self {
        Self {
            time_soft: -1,
            time_hard: -1,
            size_soft: -1,
            size_hard: -1,
            size_unchecked: -1,
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            time_soft: 3600,
            time_hard: 0,
            size_soft: 500,
            size_hard: 0,
            size_unchecked: -1,
        }
    }
}

/// Identity and limits policy collaborator.
pub trait LimitsPolicy: Send + Sync {
    /// Administrative identities are not subject to policy limits.
    fn is_admin(&self, requester: &Dn) -> bool;

    fn limits_for(&self, requester: &Dn) -> Limits;
}

/// Policy backed by a fixed administrator list and per-identity overrides.
#[derive(Clone, Debug, Default)]
pub struct StaticLimitsPolicy {
    admins: Vec<Dn>,
    defaults: Limits,
    overrides: HashMap<Dn, Limits>,
}

impl StaticLimitsPolicy {
    pub fn new(defaults: Limits) -> Self {
        Self {
            admins: Vec::new(),
            defaults,
            overrides: HashMap::new(),
        }
    }

    pub fn with_admin(mut self, dn: impl Into<Dn>) -> Self {
        self.admins.push(dn.into());
        self
    }

    pub fn with_override(mut self, dn: impl Into<Dn>, limits: Limits) -> Self {
        self.overrides.insert(dn.into(), limits);
        self
    }
}

impl LimitsPolicy for StaticLimitsPolicy {
    fn is_admin(&self, requester: &Dn) -> bool {
        !requester.is_root() && self.admins.iter().any(|a| a == requester)
    }

    fn limits_for(&self, requester: &Dn) -> Limits {
        self.overrides
            .get(requester)
            .copied()
            .unwrap_or(self.defaults)
    }
}

/// The requested limit exceeds a positive hard limit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnwillingToPerform;

/// Limits in force for one dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResolvedLimits {
    pub admin: bool,
    /// Total notifications the subscription may receive; `None` is unlimited.
    pub size: Option<u64>,
    /// Absolute deadline; `None` is unlimited.
    pub deadline: Option<Instant>,
    /// Candidate set ceiling; `None` is unchecked.
    pub unchecked: Option<u64>,
}

impl ResolvedLimits {
    pub fn unlimited() -> Self {
        Self {
            admin: true,
            size: None,
            deadline: None,
            unchecked: None,
        }
    }

    pub fn expired(&self, now: Instant) -> bool {
        self.deadline.map_or(false, |d| now > d)
    }

    /// Resolve requested limits for `requester`, starting the clock at `start`.
    pub fn resolve(
        policy: &dyn LimitsPolicy,
        requester: &Dn,
        size_requested: i64,
        time_requested: i64,
        start: Instant,
    ) -> Result<Self, UnwillingToPerform> {
        if policy.is_admin(requester) {
            return Ok(Self {
                admin: true,
                size: positive(size_requested),
                deadline: positive(time_requested).map(|secs| start + Duration::from_secs(secs)),
                unchecked: None,
            });
        }

        let limits = policy.limits_for(requester);
        let time = clamp(time_requested, limits.time_soft, limits.time_hard)?;
        let size = clamp(size_requested, limits.size_soft, limits.size_hard)?;

        Ok(Self {
            admin: false,
            size: bounded(size),
            deadline: bounded(time).map(|secs| start + Duration::from_secs(secs)),
            unchecked: bounded(limits.size_unchecked),
        })
    }
}

fn clamp(requested: i64, soft: i64, hard: i64) -> Result<i64, UnwillingToPerform> {
    if requested <= 0 {
        return Ok(soft);
    }
    if requested > hard {
        if hard == 0 && requested > soft {
            return Ok(soft);
        }
        if hard > 0 {
            return Err(UnwillingToPerform);
        }
    }
    Ok(requested)
}

fn positive(value: i64) -> Option<u64> {
    (value > 0).then_some(value as u64)
}

fn bounded(value: i64) -> Option<u64> {
    (value >= 0).then_some(value as u64)
}
