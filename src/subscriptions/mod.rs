//! Live persistent search subscriptions.
//!
//! A subscription is created when a persistent search is admitted and lives
//! in the [`SubscriptionRegistry`] until it is abandoned or its connection
//! closes. Its request parameters are immutable; the delivered-entry counter,
//! cookie high-water mark and abandon flag are synchronized per subscription.
//!
//! # Example
//!
//! ```ignore
//! let registry = SubscriptionRegistry::new();
//! let op = OperationContext::new(MessageId(2), "cn=reader,dc=example");
//! let spec = SubscriptionSpec::new(
//!     ConnectionId(1),
//!     op,
//!     "dc=example",
//!     Scope::Subtree,
//!     Filter::parse("(objectClass=person)")?,
//! );
//! let sub = registry.register_spec(spec);
//!
//! // Later, from the write path:
//! for sub in registry.iterate() {
//!     dispatcher.dispatch(&write, &sub, &entry, ChangeKind::Add);
//! }
//!
//! registry.abandon(ConnectionId(1), MessageId(2));
//! ```

mod manager;
mod types;

pub use manager::{AbandonResult, SubscriptionRegistry};
pub use types::{
    AttributeSelection, ClientUpdate, DeliveryState, OperationContext, Subscription,
    SubscriptionHandle, SubscriptionKey, SubscriptionSpec,
};
