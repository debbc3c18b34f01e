//! # Persistent Search
//!
//! A directory-server backend for persistent searches: a client issues a
//! search once and keeps receiving notifications as matching entries are
//! added, deleted, modified, or leave scope.
//!
//! ## Core Concepts
//!
//! - **Registry**: live subscriptions keyed by connection and message id
//! - **Candidate sets**: index-derived sets of entry ids, explicit or ranged
//! - **Dispatcher**: decides delivery for one subscription and one change
//! - **Collaborators**: storage, index compiler, delivery sink, limits policy,
//!   value ordering and referral rewriting are traits; [`MemoryDirectory`]
//!   and [`ChannelSink`] are in-process implementations
//!
//! ## Example
//!
//! ```ignore
//! use psearch::*;
//! use std::sync::Arc;
//!
//! let directory = Arc::new(MemoryDirectory::new("dc=example"));
//! let sink = Arc::new(ChannelSink::new(1000));
//! let dispatcher = Dispatcher::new(
//!     directory.clone(),
//!     directory.clone(),
//!     sink.clone(),
//!     PsearchConfig::default(),
//! );
//!
//! let registry = SubscriptionRegistry::new();
//! let conn = sink.connect(ConnectionId(1));
//! registry.register_spec(SubscriptionSpec::new(
//!     ConnectionId(1),
//!     OperationContext::new(MessageId(2), "cn=admin,dc=example"),
//!     "dc=example",
//!     Scope::Subtree,
//!     Filter::parse("(objectClass=person)")?,
//! ));
//!
//! let entry = directory.add(person)?;
//! dispatcher.fan_out(&registry, &WriteOperation::new(), &entry, ChangeKind::Add);
//! let notification = conn.recv()?;
//! ```

pub mod candidates;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod filter;
pub mod idl;
pub mod index;
pub mod limits;
pub mod matching;
pub mod memory;
pub mod referral;
pub mod sink;
pub mod staging;
pub mod storage;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use candidates::{CandidateBuilder, CandidateOptions};
pub use config::{PsearchConfig, RetryPolicy};
pub use dispatch::{DispatchOutcome, Dispatcher, SuppressReason};
pub use error::{PsearchError, Result};
pub use filter::{Filter, FilterParseError, FilterResult};
pub use idl::{CandidateSet, ScratchStack};
pub use index::{IndexCompiler, IndexError};
pub use limits::{Limits, LimitsPolicy, ResolvedLimits, StaticLimitsPolicy};
pub use matching::{DefaultOrdering, MatchError, ValueOrdering};
pub use memory::MemoryDirectory;
pub use referral::{DefaultReferralRewriter, ReferralRewriter};
pub use sink::{ChannelSink, ConnectionHandle, EntryUpdate, Notification, ResultSink, SendStatus};
pub use staging::WriteOperation;
pub use storage::{AliasTarget, Directory, DnLookup, Locker, LockerPool, StorageError};
pub use subscriptions::{
    AbandonResult, AttributeSelection, ClientUpdate, OperationContext, Subscription,
    SubscriptionHandle, SubscriptionKey, SubscriptionRegistry, SubscriptionSpec,
};
pub use types::{
    Attribute, ChangeKind, ConnectionId, Csn, DerefPolicy, Dn, Entry, EntryId, MessageId, Scope,
};
