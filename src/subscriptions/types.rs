//! Subscription types for persistent searches.

use crate::error::{PsearchError, Result};
use crate::filter::Filter;
use crate::types::{attr, Attribute, ConnectionId, Csn, DerefPolicy, Dn, Entry, MessageId, Scope};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Attributes maintained by the server rather than the client.
const OPERATIONAL: &[&str] = &[
    "entryCSN",
    "entryUUID",
    "createTimestamp",
    "modifyTimestamp",
    "creatorsName",
    "modifiersName",
    "subschemaSubentry",
    "hasSubordinates",
];

fn is_operational(name: &str) -> bool {
    OPERATIONAL.iter().any(|o| o.eq_ignore_ascii_case(name))
}

/// Which attributes to return with an entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeSelection {
    all_user: bool,
    all_operational: bool,
    names: Vec<String>,
}

/// No attribute list requested: all user attributes.
impl Default for AttributeSelection {
    fn default() -> Self {
        Self::from_requested(Vec::<String>::new())
    }
}

impl AttributeSelection {
    /// Interpret a requested attribute list: empty or `*` selects all user
    /// attributes, `+` all operational ones, `1.1` alone selects nothing.
    pub fn from_requested<I, S>(requested: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let requested: Vec<String> = requested.into_iter().map(Into::into).collect();
        let mut selection = Self {
            all_user: requested.is_empty(),
            all_operational: false,
            names: Vec::new(),
        };
        for name in requested {
            match name.as_str() {
                "*" => selection.all_user = true,
                "+" => selection.all_operational = true,
                "1.1" => {}
                _ => selection.names.push(name),
            }
        }
        selection
    }

    /// Just the entry's unique identifier.
    pub fn uuid_only() -> Self {
        Self {
            all_user: false,
            all_operational: false,
            names: vec![attr::ENTRY_UUID.to_string()],
        }
    }

    pub fn includes(&self, name: &str) -> bool {
        if self.names.iter().any(|n| n.eq_ignore_ascii_case(name)) {
            return true;
        }
        if is_operational(name) {
            self.all_operational
        } else {
            self.all_user
        }
    }

    /// Attributes of `entry` covered by this selection.
    pub fn project(&self, entry: &Entry, attrs_only: bool) -> Vec<Attribute> {
        entry
            .attributes
            .iter()
            .filter(|a| self.includes(&a.name))
            .map(|a| Attribute {
                name: a.name.clone(),
                values: if attrs_only { Vec::new() } else { a.values.clone() },
            })
            .collect()
    }
}

/// Identity of a subscription: the connection and the request's message id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionKey {
    pub conn: ConnectionId,
    pub msg_id: MessageId,
}

impl SubscriptionKey {
    pub fn new(conn: ConnectionId, msg_id: MessageId) -> Self {
        Self { conn, msg_id }
    }
}

impl fmt::Debug for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sub({}/{})", self.conn, self.msg_id)
    }
}

/// Client update (LCUP) state carried by the request.
#[derive(Clone, Debug)]
pub struct ClientUpdate {
    /// CSN the client already has; `None` means no prior state.
    pub baseline: Option<Csn>,
    /// Send a cookie every `interval` notifications.
    pub interval: NonZeroU32,
    /// Criticality of the update control.
    pub critical: bool,
}

impl ClientUpdate {
    pub fn new(baseline: Option<Csn>, interval: u32, critical: bool) -> Result<Self> {
        let interval = NonZeroU32::new(interval).ok_or(PsearchError::InvalidInterval(interval))?;
        Ok(Self {
            baseline,
            interval,
            critical,
        })
    }
}

impl Default for ClientUpdate {
    fn default() -> Self {
        Self {
            baseline: None,
            interval: NonZeroU32::MIN,
            critical: false,
        }
    }
}

/// Request-level context of the persistent search operation.
#[derive(Clone, Debug)]
pub struct OperationContext {
    pub msg_id: MessageId,
    /// Normalized DN of the bound identity.
    pub requester: Dn,
    /// ManageDsaIT control: referrals are ordinary entries.
    pub manage_dsa_it: bool,
    /// Subentries control: `None` if absent, else its visibility value.
    pub subentries: Option<bool>,
    pub client_update: ClientUpdate,
}

impl OperationContext {
    pub fn new(msg_id: MessageId, requester: impl Into<Dn>) -> Self {
        Self {
            msg_id,
            requester: requester.into(),
            manage_dsa_it: false,
            subentries: None,
            client_update: ClientUpdate::default(),
        }
    }

    /// Only subentries are visible.
    pub fn subentries_visible(&self) -> bool {
        self.subentries == Some(true)
    }
}

/// Everything needed to admit a persistent search.
#[derive(Clone, Debug)]
pub struct SubscriptionSpec {
    pub conn: ConnectionId,
    pub op: OperationContext,
    pub base: Dn,
    pub scope: Scope,
    pub deref: DerefPolicy,
    pub size_limit: i64,
    pub time_limit: i64,
    pub filter: Filter,
    pub filter_str: String,
    pub attrs: AttributeSelection,
    pub attrs_only: bool,
}

impl SubscriptionSpec {
    /// A spec with default limits, all attributes and no deref.
    pub fn new(
        conn: ConnectionId,
        op: OperationContext,
        base: impl Into<Dn>,
        scope: Scope,
        filter: Filter,
    ) -> Self {
        let filter_str = filter.to_string();
        Self {
            conn,
            op,
            base: base.into(),
            scope,
            deref: DerefPolicy::Never,
            size_limit: 0,
            time_limit: 0,
            filter,
            filter_str,
            attrs: AttributeSelection::default(),
            attrs_only: false,
        }
    }
}

/// Mutable delivery state of one subscription.
#[derive(Clone, Debug, Default)]
pub struct DeliveryState {
    /// Notifications delivered so far.
    pub entry_count: u64,
    /// Highest CSN observed in delivered entries.
    pub latest_csn: Option<Csn>,
}

/// A live persistent search.
pub struct Subscription {
    pub key: SubscriptionKey,
    pub op: OperationContext,
    pub base: Dn,
    pub scope: Scope,
    pub deref: DerefPolicy,
    pub size_limit: i64,
    pub time_limit: i64,
    pub filter: Filter,
    pub filter_str: String,
    pub attrs: AttributeSelection,
    pub attrs_only: bool,
    abandoned: AtomicBool,
    state: Mutex<DeliveryState>,
}

impl Subscription {
    pub(crate) fn from_spec(spec: SubscriptionSpec) -> Self {
        Self {
            key: SubscriptionKey::new(spec.conn, spec.op.msg_id),
            op: spec.op,
            base: spec.base,
            scope: spec.scope,
            deref: spec.deref,
            size_limit: spec.size_limit,
            time_limit: spec.time_limit,
            filter: spec.filter,
            filter_str: spec.filter_str,
            attrs: spec.attrs,
            attrs_only: spec.attrs_only,
            abandoned: AtomicBool::new(false),
            state: Mutex::new(DeliveryState::default()),
        }
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::Acquire)
    }

    pub(crate) fn mark_abandoned(&self) {
        self.abandoned.store(true, Ordering::Release);
    }

    pub fn baseline(&self) -> Option<&Csn> {
        self.op.client_update.baseline.as_ref()
    }

    pub fn cookie_interval(&self) -> NonZeroU32 {
        self.op.client_update.interval
    }

    pub fn entry_count(&self) -> u64 {
        self.state.lock().entry_count
    }

    pub fn latest_csn(&self) -> Option<Csn> {
        self.state.lock().latest_csn.clone()
    }

    /// Snapshot of the delivery state.
    pub fn delivery_state(&self) -> DeliveryState {
        self.state.lock().clone()
    }

    pub(crate) fn state(&self) -> &Mutex<DeliveryState> {
        &self.state
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("base", &self.base)
            .field("scope", &self.scope)
            .field("filter", &self.filter_str)
            .field("abandoned", &self.is_abandoned())
            .finish()
    }
}

/// Shared handle to a registered subscription.
pub type SubscriptionHandle = Arc<Subscription>;
