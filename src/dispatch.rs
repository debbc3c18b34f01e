//! Change dispatcher.
//!
//! One [`Dispatcher::dispatch`] call decides, for one subscription and one
//! committed change, whether a notification is delivered. The pipeline is:
//!
//! 1. pick the attribute selection (entry UUID only for removals)
//! 2. take a locker, retrying deadlocks with backoff
//! 3. resolve the base entry, stopping on referrals
//! 4. resolve size and time limits
//! 5. build the candidate set
//! 6. stop unless the changed entry is a candidate
//! 7. enforce the unchecked-candidates ceiling
//! 8. guard the filter with the subscriber's CSN baseline
//! 9. check the abandon flag and the deadline
//! 10. apply subentry, alias and referral rules
//! 11. evaluate the filter
//! 12. deliver (or stage, for PreModify)
//!
//! The locker is an RAII guard and every other resource is owned by the
//! call frame, so each early return releases everything.

use crate::candidates::{CandidateBuilder, CandidateOptions};
use crate::config::PsearchConfig;
use crate::filter::Filter;
use crate::index::{IndexCompiler, IndexError};
use crate::limits::{LimitsPolicy, ResolvedLimits};
use crate::matching::{DefaultOrdering, ValueOrdering};
use crate::referral::{DefaultReferralRewriter, ReferralRewriter};
use crate::sink::{EntryUpdate, ResultSink, SendStatus};
use crate::staging::WriteOperation;
use crate::storage::{AliasTarget, Directory, ErrorClass, Locker, StorageError};
use crate::subscriptions::{
    AttributeSelection, DeliveryState, Subscription, SubscriptionKey, SubscriptionRegistry,
};
use crate::types::{attr, ChangeKind, Dn, Entry, Scope};
use std::borrow::Cow;
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{debug, error, trace, warn};

/// Why a dispatch ended without delivering anything.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SuppressReason {
    /// The entry is not in the subscription's candidate set.
    NotCandidate,
    Abandoned,
    /// Subentry visibility hides the entry.
    HiddenSubentry,
    /// The alias target does not exist.
    AliasUnresolved,
    AliasLoop,
    OutOfScope,
    FilterMismatch,
    /// A continuation reference was sent in place of the entry.
    ContinuationSent,
    /// The sink dropped the notification.
    NotSent,
}

/// Result of dispatching one change to one subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Delivered; carries the subscription's delivered-entry count.
    Delivered(u64),
    /// A PreModify record was staged for the coming Modify.
    Staged,
    Suppressed(SuppressReason),
    /// The base is a referral or lies below one.
    Referral { matched: Option<Dn>, urls: Vec<String> },
    /// The base does not exist and no referral applies.
    NoSuchObject { matched: Option<Dn> },
    Busy,
    InternalError,
    TimeLimitExceeded,
    SizeLimitExceeded,
    AdminLimitExceeded,
    UnwillingToPerform,
    /// Lock conflicts persisted through every retry.
    RetryExhausted { attempts: u32 },
}

impl DispatchOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DispatchOutcome::Delivered(_))
    }

    /// No-op outcomes: nothing was sent and nothing went wrong.
    pub fn is_suppressed(&self) -> bool {
        matches!(self, DispatchOutcome::Suppressed(_))
    }

    /// The outcome is a final result for the search operation; the
    /// subscription should not receive further changes.
    pub fn ends_subscription(&self) -> bool {
        matches!(
            self,
            DispatchOutcome::Referral { .. }
                | DispatchOutcome::NoSuchObject { .. }
                | DispatchOutcome::InternalError
                | DispatchOutcome::TimeLimitExceeded
                | DispatchOutcome::SizeLimitExceeded
                | DispatchOutcome::AdminLimitExceeded
                | DispatchOutcome::UnwillingToPerform
        )
    }
}

/// Early exits inside one dispatch attempt.
enum Stop {
    /// Retry the attempt if the storage error is retryable.
    Storage(StorageError),
    Done(DispatchOutcome),
}

impl From<StorageError> for Stop {
    fn from(e: StorageError) -> Self {
        Stop::Storage(e)
    }
}

impl From<DispatchOutcome> for Stop {
    fn from(outcome: DispatchOutcome) -> Self {
        Stop::Done(outcome)
    }
}

type Step<T> = std::result::Result<T, Stop>;

/// Decides delivery of committed changes to persistent searches.
pub struct Dispatcher {
    directory: Arc<dyn Directory>,
    compiler: Arc<dyn IndexCompiler>,
    sink: Arc<dyn ResultSink>,
    policy: Arc<dyn LimitsPolicy>,
    ordering: Arc<dyn ValueOrdering>,
    rewriter: Arc<dyn ReferralRewriter>,
    config: PsearchConfig,
}

impl Dispatcher {
    /// Limits come from `config`; ordering and referral rewriting use the
    /// defaults.
    pub fn new(
        directory: Arc<dyn Directory>,
        compiler: Arc<dyn IndexCompiler>,
        sink: Arc<dyn ResultSink>,
        config: PsearchConfig,
    ) -> Self {
        Self {
            directory,
            compiler,
            sink,
            policy: Arc::new(config.limits_policy()),
            ordering: Arc::new(DefaultOrdering),
            rewriter: Arc::new(DefaultReferralRewriter),
            config,
        }
    }

    pub fn with_limits_policy(mut self, policy: Arc<dyn LimitsPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_ordering(mut self, ordering: Arc<dyn ValueOrdering>) -> Self {
        self.ordering = ordering;
        self
    }

    pub fn with_rewriter(mut self, rewriter: Arc<dyn ReferralRewriter>) -> Self {
        self.rewriter = rewriter;
        self
    }

    pub fn config(&self) -> &PsearchConfig {
        &self.config
    }

    /// Dispatch one change to every live subscription.
    ///
    /// Subscriptions whose outcome ends the search are abandoned.
    pub fn fan_out(
        &self,
        registry: &SubscriptionRegistry,
        write: &WriteOperation,
        entry: &Entry,
        kind: ChangeKind,
    ) -> Vec<(SubscriptionKey, DispatchOutcome)> {
        registry
            .iterate()
            .into_iter()
            .map(|sub| {
                let outcome = self.dispatch(write, &sub, entry, kind);
                if outcome.ends_subscription() {
                    debug!(
                        conn = %sub.key.conn,
                        msg_id = %sub.key.msg_id,
                        ?outcome,
                        "Persistent search ended"
                    );
                    registry.abandon(sub.key.conn, sub.key.msg_id);
                }
                (sub.key, outcome)
            })
            .collect()
    }

    /// Dispatch one change to one subscription.
    pub fn dispatch(
        &self,
        write: &WriteOperation,
        sub: &Subscription,
        entry: &Entry,
        kind: ChangeKind,
    ) -> DispatchOutcome {
        let started = Instant::now();
        let retry = self.config.retry;
        let max_attempts = retry.max_attempts.max(1);

        let mut attempt = 1;
        let outcome = loop {
            match self.attempt(write, sub, entry, kind, started) {
                Ok(outcome) | Err(Stop::Done(outcome)) => break outcome,
                Err(Stop::Storage(e)) => match e.class() {
                    ErrorClass::Retryable if attempt < max_attempts => {
                        let delay = retry.backoff(attempt);
                        debug!(
                            conn = %sub.key.conn,
                            msg_id = %sub.key.msg_id,
                            attempt,
                            ?delay,
                            error = %e,
                            "Lock conflict, retrying"
                        );
                        thread::sleep(delay);
                        attempt += 1;
                    }
                    ErrorClass::Retryable => {
                        warn!(
                            conn = %sub.key.conn,
                            msg_id = %sub.key.msg_id,
                            attempts = attempt,
                            "Lock conflicts persisted, giving up"
                        );
                        break DispatchOutcome::RetryExhausted { attempts: attempt };
                    }
                    ErrorClass::Busy => break DispatchOutcome::Busy,
                    ErrorClass::Fatal => {
                        error!(
                            conn = %sub.key.conn,
                            msg_id = %sub.key.msg_id,
                            error = %e,
                            "Storage failure during dispatch"
                        );
                        break DispatchOutcome::InternalError;
                    }
                },
            }
        };

        trace!(
            conn = %sub.key.conn,
            msg_id = %sub.key.msg_id,
            entry = %entry.id,
            %kind,
            ?outcome,
            "Dispatch finished"
        );
        outcome
    }

    fn attempt(
        &self,
        write: &WriteOperation,
        sub: &Subscription,
        entry: &Entry,
        kind: ChangeKind,
        started: Instant,
    ) -> Step<DispatchOutcome> {
        let attrs = if kind.is_removal() {
            Cow::Owned(AttributeSelection::uuid_only())
        } else {
            Cow::Borrowed(&sub.attrs)
        };

        let locker = self.directory.acquire_locker()?;
        let base = self.resolve_base(&locker, sub)?;

        let limits = ResolvedLimits::resolve(
            self.policy.as_ref(),
            &sub.op.requester,
            sub.size_limit,
            sub.time_limit,
            started,
        )
        .map_err(|_| DispatchOutcome::UnwillingToPerform)?;

        let options = CandidateOptions {
            manage_dsa_it: sub.op.manage_dsa_it,
            deref: sub.deref,
            subentries_visible: sub.op.subentries_visible(),
        };
        let candidates = CandidateBuilder::new(self.compiler.as_ref())
            .build(&base, sub.scope, &sub.filter, &options)
            .map_err(|e| match e {
                IndexError::Storage(e) => Stop::Storage(e),
                e => {
                    error!(
                        conn = %sub.key.conn,
                        msg_id = %sub.key.msg_id,
                        error = %e,
                        "Candidate evaluation failed"
                    );
                    Stop::Done(DispatchOutcome::InternalError)
                }
            })?;

        if !candidates.contains(entry.id) {
            return Ok(DispatchOutcome::Suppressed(SuppressReason::NotCandidate));
        }

        if !limits.admin {
            if let Some(ceiling) = limits.unchecked {
                if candidates.len() > ceiling {
                    debug!(candidates = candidates.len(), ceiling, "Unchecked limit exceeded");
                    return Ok(DispatchOutcome::AdminLimitExceeded);
                }
            }
        }

        let filter = baseline_filter(sub);

        if sub.is_abandoned() {
            return Ok(DispatchOutcome::Suppressed(SuppressReason::Abandoned));
        }
        if limits.expired(Instant::now()) {
            return Ok(DispatchOutcome::TimeLimitExceeded);
        }

        if hidden_by_subentry_rules(sub, entry) {
            return Ok(DispatchOutcome::Suppressed(SuppressReason::HiddenSubentry));
        }

        let resolved: Arc<Entry>;
        let mut target = entry;
        if !sub.op.manage_dsa_it && sub.deref.searching() && entry.is_alias() {
            match self.directory.deref_alias(&locker, entry)? {
                AliasTarget::Resolved(t) if t.id == entry.id => {
                    return Ok(DispatchOutcome::Suppressed(SuppressReason::AliasLoop));
                }
                AliasTarget::Resolved(t) => {
                    if !self.in_scope(sub, &t.dn) {
                        return Ok(DispatchOutcome::Suppressed(SuppressReason::OutOfScope));
                    }
                    resolved = t;
                    target = &*resolved;
                }
                AliasTarget::Missing { .. } => {
                    return Ok(DispatchOutcome::Suppressed(SuppressReason::AliasUnresolved));
                }
                AliasTarget::Loop => {
                    return Ok(DispatchOutcome::Suppressed(SuppressReason::AliasLoop));
                }
            }
        }

        if !sub.op.manage_dsa_it && sub.scope != Scope::Base && target.is_referral() {
            return Ok(self.send_continuation(sub, target));
        }

        let matched = kind == ChangeKind::ScopeOut
            || filter.evaluate(target, self.ordering.as_ref()).is_true();
        if !matched {
            return Ok(DispatchOutcome::Suppressed(SuppressReason::FilterMismatch));
        }

        if !self.in_scope(sub, &target.dn) {
            return Ok(DispatchOutcome::Suppressed(SuppressReason::OutOfScope));
        }

        if kind == ChangeKind::PreModify {
            if quota_exhausted(&limits, &sub.delivery_state()) {
                return Ok(DispatchOutcome::SizeLimitExceeded);
            }
            write.stage(sub.key, entry.id);
            trace!(conn = %sub.key.conn, msg_id = %sub.key.msg_id, entry = %entry.id, "Staged PreModify");
            return Ok(DispatchOutcome::Staged);
        }

        let outcome = self.deliver(sub, target, kind, &attrs, &limits);
        if kind == ChangeKind::Modify && outcome != DispatchOutcome::SizeLimitExceeded {
            if write.take(sub.key).is_none() {
                trace!(conn = %sub.key.conn, msg_id = %sub.key.msg_id, "No staged PreModify");
            }
        }
        drop(locker);
        Ok(outcome)
    }

    /// Resolve the subscription base to an entry; referral and not-found
    /// conditions end the dispatch.
    fn resolve_base(&self, locker: &Locker, sub: &Subscription) -> Step<Arc<Entry>> {
        if sub.base.is_root() {
            return Ok(Arc::new(Entry::root()));
        }

        let lookup = self.directory.entry_by_dn(locker, &sub.base)?;
        let Some(base) = lookup.entry else {
            let matched = lookup.matched;
            let outcome = match &matched {
                Some(m) if m.is_referral() => DispatchOutcome::Referral {
                    matched: Some(m.dn.clone()),
                    urls: self.rewriter.rewrite(
                        &m.referrals(),
                        Some(&m.dn),
                        Some(&sub.base),
                        sub.scope,
                    ),
                },
                None if !self.config.default_referrals.is_empty() => DispatchOutcome::Referral {
                    matched: None,
                    urls: self.rewriter.rewrite(
                        &self.config.default_referrals,
                        None,
                        Some(&sub.base),
                        sub.scope,
                    ),
                },
                _ => DispatchOutcome::NoSuchObject {
                    matched: matched.as_ref().map(|m| m.dn.clone()),
                },
            };
            debug!(base = %sub.base, ?outcome, "Base not found");
            return Err(outcome.into());
        };

        if !sub.op.manage_dsa_it && base.is_referral() {
            let urls = self
                .rewriter
                .rewrite(&base.referrals(), Some(&base.dn), Some(&sub.base), sub.scope);
            debug!(base = %sub.base, "Base is a referral");
            return Err(DispatchOutcome::Referral {
                matched: Some(base.dn.clone()),
                urls,
            }
            .into());
        }

        if !sub.op.manage_dsa_it && sub.deref.finding() && base.is_alias() {
            return match self.directory.deref_alias(locker, &base)? {
                AliasTarget::Resolved(target) => Ok(target),
                AliasTarget::Missing { matched } => Err(DispatchOutcome::NoSuchObject {
                    matched: matched.map(|m| m.dn.clone()),
                }
                .into()),
                AliasTarget::Loop => {
                    Err(DispatchOutcome::Suppressed(SuppressReason::AliasLoop).into())
                }
            };
        }

        Ok(base)
    }

    /// Scope containment of a DN. Base scope admits whatever the candidate
    /// set admitted.
    fn in_scope(&self, sub: &Subscription, dn: &Dn) -> bool {
        match sub.scope {
            Scope::Base => true,
            Scope::OneLevel if self.directory.is_suffix(dn) => sub.base.is_root(),
            Scope::OneLevel => dn.is_child_of(&sub.base),
            Scope::Subtree => dn.is_descendant_or_self(&sub.base),
        }
    }

    fn send_continuation(&self, sub: &Subscription, target: &Entry) -> DispatchOutcome {
        if !self.in_scope(sub, &target.dn) {
            return DispatchOutcome::Suppressed(SuppressReason::OutOfScope);
        }
        let scope = match sub.scope {
            Scope::Subtree => Scope::Subtree,
            _ => Scope::Base,
        };
        let urls = self
            .rewriter
            .rewrite(&target.referrals(), Some(&target.dn), None, scope);
        match self.sink.send_reference(sub.key, target, &urls) {
            SendStatus::Sent => DispatchOutcome::Suppressed(SuppressReason::ContinuationSent),
            SendStatus::NotSent => DispatchOutcome::Suppressed(SuppressReason::NotSent),
            SendStatus::ConnectionGone => {
                error!(conn = %sub.key.conn, msg_id = %sub.key.msg_id, "Connection gone");
                DispatchOutcome::InternalError
            }
        }
    }

    /// Count, attach a cookie when due, and send.
    ///
    /// The delivery state stays locked across the send so notifications of
    /// one subscription leave in counter order.
    fn deliver(
        &self,
        sub: &Subscription,
        target: &Entry,
        kind: ChangeKind,
        attrs: &AttributeSelection,
        limits: &ResolvedLimits,
    ) -> DispatchOutcome {
        let mut state = sub.state().lock();
        if quota_exhausted(limits, &state) {
            debug!(conn = %sub.key.conn, msg_id = %sub.key.msg_id, "Size limit exceeded");
            return DispatchOutcome::SizeLimitExceeded;
        }

        state.entry_count += 1;
        self.track_csn(&mut state, target);

        let interval = u64::from(sub.cookie_interval().get());
        let cookie = if state.entry_count % interval == 0 {
            state.latest_csn.clone()
        } else {
            None
        };
        let control = EntryUpdate {
            state_update: false,
            entry_deleted: kind.is_removal(),
            cookie,
            critical: sub.op.client_update.critical,
        };

        let status = self
            .sink
            .send_entry(sub.key, target, attrs, sub.attrs_only, &control);
        let count = state.entry_count;
        drop(state);

        match status {
            SendStatus::Sent => {
                debug!(
                    conn = %sub.key.conn,
                    msg_id = %sub.key.msg_id,
                    entry = %target.dn,
                    %kind,
                    count,
                    cookie = control.cookie.is_some(),
                    "Delivered"
                );
                DispatchOutcome::Delivered(count)
            }
            SendStatus::NotSent => DispatchOutcome::Suppressed(SuppressReason::NotSent),
            SendStatus::ConnectionGone => {
                error!(conn = %sub.key.conn, msg_id = %sub.key.msg_id, "Connection gone");
                DispatchOutcome::InternalError
            }
        }
    }

    /// Raise the subscription's CSN high-water mark from `entry`. Values
    /// the ordering rule cannot compare leave it unchanged.
    fn track_csn(&self, state: &mut DeliveryState, entry: &Entry) {
        for csn in entry.csns() {
            let newer = match &state.latest_csn {
                None => self
                    .ordering
                    .equal(attr::ENTRY_CSN, csn.as_str(), csn.as_str())
                    .unwrap_or(false),
                Some(current) => {
                    match self
                        .ordering
                        .compare(attr::ENTRY_CSN, csn.as_str(), current.as_str())
                    {
                        Ok(order) => order.is_gt(),
                        Err(e) => {
                            trace!(error = %e, "CSN not comparable");
                            false
                        }
                    }
                }
            };
            if newer {
                state.latest_csn = Some(csn);
            }
        }
    }
}

fn quota_exhausted(limits: &ResolvedLimits, state: &DeliveryState) -> bool {
    limits.size.map_or(false, |limit| state.entry_count >= limit)
}

/// The user filter guarded so only entries changed after the baseline match.
fn baseline_filter(sub: &Subscription) -> Cow<'_, Filter> {
    let Some(baseline) = sub.baseline() else {
        return Cow::Borrowed(&sub.filter);
    };
    Cow::Owned(Filter::And(vec![
        Filter::Not(Box::new(Filter::equality(attr::ENTRY_CSN, baseline.as_str()))),
        Filter::And(vec![
            Filter::GreaterOrEqual {
                attr: attr::ENTRY_CSN.to_string(),
                value: baseline.as_str().to_string(),
            },
            sub.filter.clone(),
        ]),
    ]))
}

fn hidden_by_subentry_rules(sub: &Subscription, entry: &Entry) -> bool {
    let visible = sub.op.subentries_visible();
    if entry.is_subentry() {
        if sub.scope == Scope::Base {
            sub.op.subentries.is_some() && !visible
        } else {
            !visible
        }
    } else {
        visible
    }
}
