//! Referral, alias and subentry handling during dispatch.

use psearch::*;
use std::sync::Arc;

const REMOTE_REF: &str = "ldap://east.example.com/ou=Remote,o=East";

struct Fixture {
    dir: Arc<MemoryDirectory>,
    dispatcher: Dispatcher,
    registry: SubscriptionRegistry,
    conn: ConnectionHandle,
}

fn fixture(config: PsearchConfig) -> Fixture {
    let dir = Arc::new(MemoryDirectory::new("dc=example"));
    let add = |dn: &str, classes: &[&str]| {
        dir.add(Entry::new(EntryId(0), dn).with_attr("objectClass", classes.iter().copied()))
            .unwrap()
    };
    add("dc=example", &["domain"]);
    add("ou=People,dc=example", &["organizationalUnit"]);
    add("ou=Groups,dc=example", &["organizationalUnit"]);
    dir.add(
        Entry::new(EntryId(0), "ou=Remote,dc=example")
            .with_attr("objectClass", ["referral", "extensibleObject"])
            .with_attr("ref", [REMOTE_REF]),
    )
    .unwrap();
    add("cn=bob,ou=People,dc=example", &["person"]);
    add("cn=staff,ou=Groups,dc=example", &["person"]);

    let sink = Arc::new(ChannelSink::new(16));
    let conn = sink.connect(ConnectionId(1));
    Fixture {
        dispatcher: Dispatcher::new(dir.clone(), dir.clone(), sink, config),
        dir,
        registry: SubscriptionRegistry::new(),
        conn,
    }
}

fn subscribe(
    f: &Fixture,
    base: &str,
    scope: Scope,
    filter: &str,
    customize: impl FnOnce(&mut SubscriptionSpec),
) -> SubscriptionHandle {
    let mut spec = SubscriptionSpec::new(
        ConnectionId(1),
        OperationContext::new(MessageId(1), "cn=reader,dc=example"),
        base,
        scope,
        Filter::parse(filter).unwrap(),
    );
    customize(&mut spec);
    f.registry.register_spec(spec)
}

fn dispatch(f: &Fixture, sub: &Subscription, entry: &Entry) -> DispatchOutcome {
    f.dispatcher
        .dispatch(&WriteOperation::new(), sub, entry, ChangeKind::Add)
}

fn add_alias(f: &Fixture, dn: &str, target: &str) -> Arc<Entry> {
    f.dir
        .add(
            Entry::new(EntryId(0), dn)
                .with_attr("objectClass", ["alias", "extensibleObject"])
                .with_attr("aliasedObjectName", [target]),
        )
        .unwrap()
}

#[test]
fn test_base_below_referral() {
    let f = fixture(PsearchConfig::default());
    let sub = subscribe(&f, "cn=Someone,ou=Remote,dc=example", Scope::Subtree, "(objectClass=*)", |_| {});
    let bob = f.dir.get_by_dn(&Dn::new("cn=bob,ou=People,dc=example")).unwrap();

    assert_eq!(
        dispatch(&f, &sub, &bob),
        DispatchOutcome::Referral {
            matched: Some(Dn::new("ou=Remote,dc=example")),
            urls: vec!["ldap://east.example.com/cn=Someone,ou=Remote,o=East??sub".to_string()],
        }
    );
    assert_eq!(f.dir.lockers().in_use(), 0);
}

#[test]
fn test_base_is_referral() {
    let f = fixture(PsearchConfig::default());
    let sub = subscribe(&f, "ou=Remote,dc=example", Scope::OneLevel, "(objectClass=*)", |_| {});
    let bob = f.dir.get_by_dn(&Dn::new("cn=bob,ou=People,dc=example")).unwrap();

    let outcome = dispatch(&f, &sub, &bob);
    assert_eq!(
        outcome,
        DispatchOutcome::Referral {
            matched: Some(Dn::new("ou=Remote,dc=example")),
            urls: vec![format!("{}??one", REMOTE_REF)],
        }
    );
    assert!(outcome.ends_subscription());
}

#[test]
fn test_manage_dsa_it_treats_referral_base_as_entry() {
    let f = fixture(PsearchConfig::default());
    let sub = subscribe(&f, "ou=Remote,dc=example", Scope::Base, "(objectClass=*)", |spec| {
        spec.op.manage_dsa_it = true;
    });
    let remote = f.dir.get_by_dn(&Dn::new("ou=Remote,dc=example")).unwrap();
    assert_eq!(dispatch(&f, &sub, &remote), DispatchOutcome::Delivered(1));
}

#[test]
fn test_missing_base() {
    let f = fixture(PsearchConfig::default());
    let bob = f.dir.get_by_dn(&Dn::new("cn=bob,ou=People,dc=example")).unwrap();

    let sub = subscribe(&f, "cn=ghost,ou=People,dc=example", Scope::Subtree, "(objectClass=*)", |_| {});
    assert_eq!(
        dispatch(&f, &sub, &bob),
        DispatchOutcome::NoSuchObject {
            matched: Some(Dn::new("ou=People,dc=example"))
        }
    );

    let sub = subscribe(&f, "dc=other", Scope::Subtree, "(objectClass=*)", |_| {});
    assert_eq!(
        dispatch(&f, &sub, &bob),
        DispatchOutcome::NoSuchObject { matched: None }
    );
}

#[test]
fn test_default_referrals_for_unknown_naming_context() {
    let config = PsearchConfig {
        default_referrals: vec!["ldap://default.example.com/".to_string()],
        ..Default::default()
    };
    let f = fixture(config);
    let bob = f.dir.get_by_dn(&Dn::new("cn=bob,ou=People,dc=example")).unwrap();
    let sub = subscribe(&f, "dc=other", Scope::Subtree, "(objectClass=*)", |_| {});

    assert_eq!(
        dispatch(&f, &sub, &bob),
        DispatchOutcome::Referral {
            matched: None,
            urls: vec!["ldap://default.example.com/dc=other??sub".to_string()],
        }
    );
}

#[test]
fn test_referral_in_scope_sends_continuation() {
    let f = fixture(PsearchConfig::default());
    let sub = subscribe(&f, "dc=example", Scope::Subtree, "(objectClass=person)", |_| {});
    let remote = f.dir.get_by_dn(&Dn::new("ou=Remote,dc=example")).unwrap();

    assert_eq!(
        dispatch(&f, &sub, &remote),
        DispatchOutcome::Suppressed(SuppressReason::ContinuationSent)
    );
    match f.conn.try_recv().unwrap() {
        Notification::Reference { msg_id, urls } => {
            assert_eq!(msg_id, MessageId(1));
            assert_eq!(urls, vec![format!("{}??sub", REMOTE_REF)]);
        }
        other => panic!("Expected reference, got {:?}", other),
    }
    assert_eq!(sub.entry_count(), 0);
}

#[test]
fn test_onelevel_continuation_uses_base_scope() {
    let f = fixture(PsearchConfig::default());
    let sub = subscribe(&f, "dc=example", Scope::OneLevel, "(objectClass=person)", |_| {});
    let remote = f.dir.get_by_dn(&Dn::new("ou=Remote,dc=example")).unwrap();

    assert_eq!(
        dispatch(&f, &sub, &remote),
        DispatchOutcome::Suppressed(SuppressReason::ContinuationSent)
    );
    match f.conn.try_recv().unwrap() {
        Notification::Reference { urls, .. } => {
            assert_eq!(urls, vec![format!("{}??base", REMOTE_REF)])
        }
        other => panic!("Expected reference, got {:?}", other),
    }
}

#[test]
fn test_alias_delivers_target() {
    let f = fixture(PsearchConfig::default());
    let sub = subscribe(&f, "ou=People,dc=example", Scope::Subtree, "(objectClass=person)", |spec| {
        spec.deref = DerefPolicy::Always;
    });
    let alias = add_alias(&f, "cn=robert,ou=People,dc=example", "cn=bob,ou=People,dc=example");

    assert_eq!(dispatch(&f, &sub, &alias), DispatchOutcome::Delivered(1));
    match f.conn.try_recv().unwrap() {
        Notification::Entry { dn, .. } => assert_eq!(dn, "cn=bob,ou=People,dc=example"),
        other => panic!("Expected entry, got {:?}", other),
    }
}

#[test]
fn test_alias_failures() {
    let f = fixture(PsearchConfig::default());
    let sub = subscribe(&f, "ou=People,dc=example", Scope::Subtree, "(objectClass=person)", |spec| {
        spec.deref = DerefPolicy::Searching;
    });

    let outside = add_alias(&f, "cn=out,ou=People,dc=example", "cn=staff,ou=Groups,dc=example");
    assert_eq!(
        dispatch(&f, &sub, &outside),
        DispatchOutcome::Suppressed(SuppressReason::OutOfScope)
    );

    let dangling = add_alias(&f, "cn=gone,ou=People,dc=example", "cn=nobody,ou=People,dc=example");
    assert_eq!(
        dispatch(&f, &sub, &dangling),
        DispatchOutcome::Suppressed(SuppressReason::AliasUnresolved)
    );

    let own = add_alias(&f, "cn=self,ou=People,dc=example", "cn=self,ou=People,dc=example");
    assert_eq!(
        dispatch(&f, &sub, &own),
        DispatchOutcome::Suppressed(SuppressReason::AliasLoop)
    );

    assert!(f.conn.try_recv().is_err());
    assert_eq!(f.dir.lockers().in_use(), 0);
}

#[test]
fn test_aliases_ignored_without_deref() {
    let f = fixture(PsearchConfig::default());
    let sub = subscribe(&f, "ou=People,dc=example", Scope::Subtree, "(objectClass=person)", |_| {});
    let alias = add_alias(&f, "cn=robert,ou=People,dc=example", "cn=bob,ou=People,dc=example");
    assert_eq!(
        dispatch(&f, &sub, &alias),
        DispatchOutcome::Suppressed(SuppressReason::NotCandidate)
    );
}

#[test]
fn test_subentry_visibility() {
    let f = fixture(PsearchConfig::default());
    let subentry = f
        .dir
        .add(
            Entry::new(EntryId(0), "cn=policy,dc=example")
                .with_attr("objectClass", ["subentry", "top"]),
        )
        .unwrap();
    let bob = f.dir.get_by_dn(&Dn::new("cn=bob,ou=People,dc=example")).unwrap();

    let plain = subscribe(&f, "dc=example", Scope::Subtree, "(objectClass=*)", |_| {});
    assert_eq!(
        dispatch(&f, &plain, &subentry),
        DispatchOutcome::Suppressed(SuppressReason::HiddenSubentry)
    );
    assert!(dispatch(&f, &plain, &bob).is_delivered());

    let only_subentries = f.registry.register_spec({
        let mut op = OperationContext::new(MessageId(2), "cn=reader,dc=example");
        op.subentries = Some(true);
        SubscriptionSpec::new(
            ConnectionId(1),
            op,
            "dc=example",
            Scope::Subtree,
            Filter::parse("(objectClass=*)").unwrap(),
        )
    });
    assert!(dispatch(&f, &only_subentries, &subentry).is_delivered());
    assert_eq!(
        dispatch(&f, &only_subentries, &bob),
        DispatchOutcome::Suppressed(SuppressReason::NotCandidate)
    );
}

#[test]
fn test_subentry_rules_apply_to_alias_not_target() {
    let f = fixture(PsearchConfig::default());
    f.dir
        .add(
            Entry::new(EntryId(0), "cn=policy,dc=example")
                .with_attr("objectClass", ["subentry", "top"]),
        )
        .unwrap();
    let sub = subscribe(&f, "dc=example", Scope::Subtree, "(objectClass=*)", |spec| {
        spec.deref = DerefPolicy::Always;
    });
    let alias = add_alias(&f, "cn=rules,ou=People,dc=example", "cn=policy,dc=example");

    assert_eq!(dispatch(&f, &sub, &alias), DispatchOutcome::Delivered(1));
    match f.conn.try_recv().unwrap() {
        Notification::Entry { dn, .. } => assert_eq!(dn, "cn=policy,dc=example"),
        other => panic!("Expected entry, got {:?}", other),
    }
}
