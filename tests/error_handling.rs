//! Error and limit outcomes of the dispatcher.

use parking_lot::Mutex;
use psearch::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Directory wrapper that injects storage failures.
struct FlakyDirectory {
    inner: Arc<MemoryDirectory>,
    lock_failures: AtomicU32,
    lock_error: StorageError,
    lookup_error: Mutex<Option<StorageError>>,
    delay: Duration,
}

impl FlakyDirectory {
    fn new(inner: Arc<MemoryDirectory>) -> Self {
        Self {
            inner,
            lock_failures: AtomicU32::new(0),
            lock_error: StorageError::Deadlock,
            lookup_error: Mutex::new(None),
            delay: Duration::ZERO,
        }
    }
}

impl Directory for FlakyDirectory {
    fn acquire_locker(&self) -> std::result::Result<Locker, StorageError> {
        std::thread::sleep(self.delay);
        let remaining = self.lock_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.lock_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(self.lock_error.clone());
        }
        self.inner.acquire_locker()
    }

    fn entry_by_dn(
        &self,
        locker: &Locker,
        dn: &Dn,
    ) -> std::result::Result<DnLookup, StorageError> {
        if let Some(e) = self.lookup_error.lock().clone() {
            return Err(e);
        }
        self.inner.entry_by_dn(locker, dn)
    }

    fn deref_alias(
        &self,
        locker: &Locker,
        alias: &Entry,
    ) -> std::result::Result<AliasTarget, StorageError> {
        self.inner.deref_alias(locker, alias)
    }

    fn is_suffix(&self, dn: &Dn) -> bool {
        self.inner.is_suffix(dn)
    }
}

fn populated(lockers: usize) -> Arc<MemoryDirectory> {
    let dir = Arc::new(MemoryDirectory::with_options(
        vec![Dn::new("dc=example")],
        lockers,
        1 << 16,
    ));
    dir.add(Entry::new(EntryId(0), "dc=example").with_attr("objectClass", ["domain"]))
        .unwrap();
    dir.add(
        Entry::new(EntryId(0), "ou=People,dc=example")
            .with_attr("objectClass", ["organizationalUnit"]),
    )
    .unwrap();
    dir
}

fn person(dir: &MemoryDirectory, name: &str) -> Arc<Entry> {
    dir.add(
        Entry::new(EntryId(0), format!("cn={},ou=People,dc=example", name))
            .with_attr("objectClass", ["person"])
            .with_attr("cn", [name])
            .with_attr("entryCSN", ["20240101000000Z#000001#00#000000"]),
    )
    .unwrap()
}

fn subscription(requester: &str, filter: &str) -> SubscriptionHandle {
    SubscriptionRegistry::new().register_spec(SubscriptionSpec::new(
        ConnectionId(1),
        OperationContext::new(MessageId(1), requester),
        "dc=example",
        Scope::Subtree,
        Filter::parse(filter).unwrap(),
    ))
}

fn dispatcher(
    directory: Arc<dyn Directory>,
    dir: &Arc<MemoryDirectory>,
    sink: Arc<ChannelSink>,
    config: PsearchConfig,
) -> Dispatcher {
    Dispatcher::new(directory, dir.clone(), sink, config)
}

fn fast_retry(max_attempts: u32) -> PsearchConfig {
    PsearchConfig {
        retry: RetryPolicy {
            max_attempts,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        },
        ..Default::default()
    }
}

#[test]
fn test_deadlock_is_retried() {
    let dir = populated(4);
    let flaky = Arc::new(FlakyDirectory::new(dir.clone()));
    flaky.lock_failures.store(2, Ordering::SeqCst);
    let sink = Arc::new(ChannelSink::new(8));
    let _conn = sink.connect(ConnectionId(1));
    let d = dispatcher(flaky.clone(), &dir, sink, fast_retry(5));

    let entry = person(&dir, "alice");
    let sub = subscription("cn=reader,dc=example", "(objectClass=person)");
    assert_eq!(
        d.dispatch(&WriteOperation::new(), &sub, &entry, ChangeKind::Add),
        DispatchOutcome::Delivered(1)
    );
    assert_eq!(flaky.lock_failures.load(Ordering::SeqCst), 0);
    assert_eq!(dir.lockers().in_use(), 0);
}

#[test]
fn test_retry_exhaustion() {
    let dir = populated(4);
    let flaky = Arc::new(FlakyDirectory::new(dir.clone()));
    flaky.lock_failures.store(100, Ordering::SeqCst);
    let d = dispatcher(flaky.clone(), &dir, Arc::new(ChannelSink::new(8)), fast_retry(3));

    let entry = person(&dir, "alice");
    let sub = subscription("cn=reader,dc=example", "(objectClass=person)");
    let outcome = d.dispatch(&WriteOperation::new(), &sub, &entry, ChangeKind::Add);
    assert_eq!(outcome, DispatchOutcome::RetryExhausted { attempts: 3 });
    assert!(!outcome.ends_subscription());
    assert_eq!(flaky.lock_failures.load(Ordering::SeqCst), 97);
}

#[test]
fn test_lookup_deadlock_retries_whole_attempt() {
    let dir = populated(4);
    let flaky = Arc::new(FlakyDirectory::new(dir.clone()));
    *flaky.lookup_error.lock() = Some(StorageError::LockNotGranted);
    let d = dispatcher(flaky.clone(), &dir, Arc::new(ChannelSink::new(8)), fast_retry(4));

    let entry = person(&dir, "alice");
    let sub = subscription("cn=reader,dc=example", "(objectClass=person)");
    assert_eq!(
        d.dispatch(&WriteOperation::new(), &sub, &entry, ChangeKind::Add),
        DispatchOutcome::RetryExhausted { attempts: 4 }
    );
    assert_eq!(dir.lockers().in_use(), 0);
}

#[test]
fn test_exhausted_pool_is_busy() {
    let dir = populated(1);
    let sink = Arc::new(ChannelSink::new(8));
    let d = dispatcher(dir.clone(), &dir, sink, PsearchConfig::default());
    let entry = person(&dir, "alice");
    let sub = subscription("cn=reader,dc=example", "(objectClass=person)");

    let held = dir.lockers().acquire().unwrap();
    assert_eq!(
        d.dispatch(&WriteOperation::new(), &sub, &entry, ChangeKind::Add),
        DispatchOutcome::Busy
    );
    drop(held);
    assert_eq!(dir.lockers().in_use(), 0);
}

#[test]
fn test_fatal_storage_error_is_internal() {
    let dir = populated(4);
    let flaky = Arc::new(FlakyDirectory::new(dir.clone()));
    *flaky.lookup_error.lock() = Some(StorageError::Other("page checksum".into()));
    let d = dispatcher(flaky, &dir, Arc::new(ChannelSink::new(8)), PsearchConfig::default());

    let entry = person(&dir, "alice");
    let sub = subscription("cn=reader,dc=example", "(objectClass=person)");
    assert_eq!(
        d.dispatch(&WriteOperation::new(), &sub, &entry, ChangeKind::Add),
        DispatchOutcome::InternalError
    );
    assert_eq!(dir.lockers().in_use(), 0);
}

#[test]
fn test_undefined_attribute_is_internal_error() {
    let dir = populated(4);
    let d = dispatcher(dir.clone(), &dir, Arc::new(ChannelSink::new(8)), PsearchConfig::default());
    let entry = person(&dir, "alice");
    let sub = subscription("cn=reader,dc=example", "(shoeSize=42)");

    assert_eq!(
        d.dispatch(&WriteOperation::new(), &sub, &entry, ChangeKind::Add),
        DispatchOutcome::InternalError
    );
    assert_eq!(dir.lockers().in_use(), 0);
}

#[test]
fn test_connection_gone_is_internal_error() {
    let dir = populated(4);
    let sink = Arc::new(ChannelSink::new(8));
    let d = dispatcher(dir.clone(), &dir, sink.clone(), PsearchConfig::default());
    let entry = person(&dir, "alice");
    let sub = subscription("cn=reader,dc=example", "(objectClass=person)");

    assert_eq!(
        d.dispatch(&WriteOperation::new(), &sub, &entry, ChangeKind::Add),
        DispatchOutcome::InternalError
    );
    assert_eq!(dir.lockers().in_use(), 0);
}

#[test]
fn test_full_buffer_is_not_fatal() {
    let dir = populated(4);
    let sink = Arc::new(ChannelSink::new(1));
    let conn = sink.connect(ConnectionId(1));
    let d = dispatcher(dir.clone(), &dir, sink, PsearchConfig::default());
    let sub = subscription("cn=reader,dc=example", "(objectClass=person)");

    let a = person(&dir, "a");
    let b = person(&dir, "b");
    assert!(d
        .dispatch(&WriteOperation::new(), &sub, &a, ChangeKind::Add)
        .is_delivered());
    assert_eq!(
        d.dispatch(&WriteOperation::new(), &sub, &b, ChangeKind::Add),
        DispatchOutcome::Suppressed(SuppressReason::NotSent)
    );
    assert_eq!(conn.drain().len(), 1);
}

#[test]
fn test_time_limit_exceeded() {
    let dir = populated(4);
    let mut flaky = FlakyDirectory::new(dir.clone());
    flaky.delay = Duration::from_millis(5);
    let config = PsearchConfig {
        limits: Limits {
            time_soft: 0,
            ..Limits::default()
        },
        ..Default::default()
    };
    let d = dispatcher(Arc::new(flaky), &dir, Arc::new(ChannelSink::new(8)), config);
    let entry = person(&dir, "alice");
    let sub = subscription("cn=reader,dc=example", "(objectClass=person)");

    assert_eq!(
        d.dispatch(&WriteOperation::new(), &sub, &entry, ChangeKind::Add),
        DispatchOutcome::TimeLimitExceeded
    );
    assert_eq!(dir.lockers().in_use(), 0);
}

#[test]
fn test_unchecked_limit_applies_to_non_admins() {
    let dir = populated(4);
    let sink = Arc::new(ChannelSink::new(8));
    let _conn = sink.connect(ConnectionId(1));
    let config = PsearchConfig {
        admin_dns: vec!["cn=admin,dc=example".to_string()],
        limits: Limits {
            size_unchecked: 1,
            ..Limits::default()
        },
        ..Default::default()
    };
    let d = dispatcher(dir.clone(), &dir, sink, config);
    let entry = person(&dir, "alice");
    person(&dir, "bob");

    let user = subscription("cn=reader,dc=example", "(objectClass=*)");
    assert_eq!(
        d.dispatch(&WriteOperation::new(), &user, &entry, ChangeKind::Add),
        DispatchOutcome::AdminLimitExceeded
    );

    let admin = subscription("cn=Admin,dc=example", "(objectClass=*)");
    assert!(d
        .dispatch(&WriteOperation::new(), &admin, &entry, ChangeKind::Add)
        .is_delivered());
}

#[test]
fn test_request_above_hard_limit_is_unwilling() {
    let dir = populated(4);
    let config = PsearchConfig {
        limits: Limits {
            size_soft: 5,
            size_hard: 10,
            ..Limits::default()
        },
        ..Default::default()
    };
    let d = dispatcher(dir.clone(), &dir, Arc::new(ChannelSink::new(8)), config);
    let entry = person(&dir, "alice");

    let registry = SubscriptionRegistry::new();
    let mut spec = SubscriptionSpec::new(
        ConnectionId(1),
        OperationContext::new(MessageId(1), "cn=reader,dc=example"),
        "dc=example",
        Scope::Subtree,
        Filter::parse("(objectClass=person)").unwrap(),
    );
    spec.size_limit = 20;
    let sub = registry.register_spec(spec);

    assert_eq!(
        d.dispatch(&WriteOperation::new(), &sub, &entry, ChangeKind::Add),
        DispatchOutcome::UnwillingToPerform
    );
}

#[test]
fn test_malformed_csn_degrades() {
    let dir = populated(4);
    let sink = Arc::new(ChannelSink::new(8));
    let conn = sink.connect(ConnectionId(1));
    let d = dispatcher(dir.clone(), &dir, sink, PsearchConfig::default());

    let good = person(&dir, "good");
    let bad = dir
        .add(
            Entry::new(EntryId(0), "cn=bad,ou=People,dc=example")
                .with_attr("objectClass", ["person"])
                .with_attr("entryCSN", ["not-a-csn"]),
        )
        .unwrap();

    let registry = SubscriptionRegistry::new();
    let mut op = OperationContext::new(MessageId(1), "cn=reader,dc=example");
    op.client_update = ClientUpdate::new(
        Some(Csn::new("20230101000000Z#000001#00#000000")),
        1,
        false,
    )
    .unwrap();
    let sub = registry.register_spec(SubscriptionSpec::new(
        ConnectionId(1),
        op,
        "dc=example",
        Scope::Subtree,
        Filter::parse("(objectClass=person)").unwrap(),
    ));

    assert_eq!(
        d.dispatch(&WriteOperation::new(), &sub, &bad, ChangeKind::Add),
        DispatchOutcome::Suppressed(SuppressReason::FilterMismatch)
    );
    assert_eq!(
        d.dispatch(&WriteOperation::new(), &sub, &good, ChangeKind::Add),
        DispatchOutcome::Delivered(1)
    );
    assert_eq!(conn.drain().len(), 1);
}

#[test]
fn test_invalid_config_and_interval() {
    assert!(matches!(
        PsearchConfig::from_json_str("[1, 2]"),
        Err(PsearchError::Config(_))
    ));
    assert!(matches!(
        PsearchConfig::from_json_file("/nonexistent/psearch.json"),
        Err(PsearchError::Io(_))
    ));
    assert!(matches!(
        ClientUpdate::new(None, 0, true),
        Err(PsearchError::InvalidInterval(0))
    ));
}
