//! Core types for the persistent search backend.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Well-known attribute names.
pub mod attr {
    pub const OBJECT_CLASS: &str = "objectClass";
    pub const ENTRY_CSN: &str = "entryCSN";
    pub const ENTRY_UUID: &str = "entryUUID";
    pub const REF: &str = "ref";
    pub const ALIASED_OBJECT_NAME: &str = "aliasedObjectName";
}

/// Well-known object classes that change traversal and visibility.
pub mod oc {
    pub const REFERRAL: &str = "referral";
    pub const ALIAS: &str = "alias";
    pub const SUBENTRY: &str = "subentry";
}

/// Backend identifier of a directory entry.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct EntryId(pub u64);

impl EntryId {
    /// Identifier reserved for the synthetic root entry.
    pub const ROOT: EntryId = EntryId(0);
}

impl fmt::Debug for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryId({})", self.0)
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client connection identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Conn({})", self.0)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// LDAP message id of the persistent search request.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(pub i32);

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Msg({})", self.0)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Search scope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Base,
    OneLevel,
    Subtree,
}

impl Scope {
    /// Scope keyword as it appears in LDAP URLs.
    pub fn as_url_str(self) -> &'static str {
        match self {
            Scope::Base => "base",
            Scope::OneLevel => "one",
            Scope::Subtree => "sub",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_url_str())
    }
}

/// Alias dereferencing policy requested by the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DerefPolicy {
    #[default]
    Never,
    Searching,
    Finding,
    Always,
}

impl DerefPolicy {
    /// Dereference aliases found while searching below the base.
    pub fn searching(self) -> bool {
        matches!(self, DerefPolicy::Searching | DerefPolicy::Always)
    }

    /// Dereference aliases while locating the base.
    pub fn finding(self) -> bool {
        matches!(self, DerefPolicy::Finding | DerefPolicy::Always)
    }
}

/// Kind of committed change that triggers a dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Add,
    Delete,
    Modify,
    PreModify,
    ScopeOut,
}

impl ChangeKind {
    /// The entry is gone from the subscriber's view; only its identity is sent.
    pub fn is_removal(self) -> bool {
        matches!(self, ChangeKind::Delete | ChangeKind::ScopeOut)
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeKind::Add => "add",
            ChangeKind::Delete => "delete",
            ChangeKind::Modify => "modify",
            ChangeKind::PreModify => "premodify",
            ChangeKind::ScopeOut => "scopeout",
        };
        f.write_str(s)
    }
}

/// A distinguished name in both its raw and normalized forms.
///
/// Normalization lowercases attribute types and values and strips
/// insignificant whitespace around separators. The empty DN is the root.
#[derive(Clone, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Dn {
    raw: String,
    norm: String,
}

impl Dn {
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let norm = normalize_dn(&raw);
        Self { raw, norm }
    }

    /// Build from a raw form and an already normalized form.
    pub fn with_normalized(raw: impl Into<String>, norm: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            norm: norm.into(),
        }
    }

    pub fn root() -> Self {
        Self {
            raw: String::new(),
            norm: String::new(),
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn normalized(&self) -> &str {
        &self.norm
    }

    pub fn is_root(&self) -> bool {
        self.norm.is_empty()
    }

    /// Parent DN. The parent of a single-RDN name is the root; the root has none.
    pub fn parent(&self) -> Option<Dn> {
        if self.is_root() {
            return None;
        }
        let raw_parent = split_first_rdn(&self.raw).1;
        let norm_parent = split_first_rdn(&self.norm).1;
        Some(Dn::with_normalized(raw_parent, norm_parent))
    }

    /// True if `self` equals `base` or lies below it.
    pub fn is_descendant_or_self(&self, base: &Dn) -> bool {
        if base.is_root() || self.norm == base.norm {
            return true;
        }
        let own = split_rdns(&self.norm);
        let above = split_rdns(&base.norm);
        own.len() > above.len() && own[own.len() - above.len()..] == above[..]
    }

    /// Raw RDNs of `self` above `ancestor`, `None` unless a descendant.
    pub fn relative_to(&self, ancestor: &Dn) -> Option<String> {
        if !self.is_descendant_or_self(ancestor) {
            return None;
        }
        if self.is_root() {
            return Some(String::new());
        }
        let own = split_rdns(self.raw.trim());
        let dropped = if ancestor.is_root() {
            0
        } else {
            split_rdns(&ancestor.norm).len()
        };
        let keep = own.len().saturating_sub(dropped);
        Some(
            own[..keep]
                .iter()
                .map(|rdn| rdn.trim())
                .collect::<Vec<_>>()
                .join(","),
        )
    }

    /// True if `self` is an immediate child of `base`.
    pub fn is_child_of(&self, base: &Dn) -> bool {
        self.parent().map_or(false, |p| p.norm == base.norm)
    }
}

impl PartialEq for Dn {
    fn eq(&self, other: &Self) -> bool {
        self.norm == other.norm
    }
}

impl Eq for Dn {}

impl std::hash::Hash for Dn {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.norm.hash(state);
    }
}

impl fmt::Debug for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dn({:?})", self.raw)
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl From<String> for Dn {
    fn from(raw: String) -> Self {
        Dn::new(raw)
    }
}

impl From<&str> for Dn {
    fn from(raw: &str) -> Self {
        Dn::new(raw)
    }
}

impl From<Dn> for String {
    fn from(dn: Dn) -> Self {
        dn.raw
    }
}

/// Split a DN into its RDNs, honoring backslash escapes.
fn split_rdns(dn: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (i, b) in dn.bytes().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' => escaped = true,
            b',' | b';' => {
                parts.push(&dn[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&dn[start..]);
    parts
}

fn split_first_rdn(dn: &str) -> (&str, &str) {
    let mut escaped = false;
    for (i, b) in dn.bytes().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' => escaped = true,
            b',' | b';' => return (&dn[..i], dn[i + 1..].trim_start()),
            _ => {}
        }
    }
    (dn, "")
}

fn normalize_dn(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    split_rdns(trimmed)
        .into_iter()
        .map(|rdn| {
            rdn.split('+')
                .map(|ava| match ava.split_once('=') {
                    Some((ty, value)) => format!(
                        "{}={}",
                        ty.trim().to_ascii_lowercase(),
                        collapse_spaces(value.trim()).to_lowercase()
                    ),
                    None => ava.trim().to_lowercase(),
                })
                .collect::<Vec<_>>()
                .join("+")
        })
        .collect::<Vec<_>>()
        .join(",")
}

pub(crate) fn collapse_spaces(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Change sequence number: a per-entry marker of its most recent modification.
///
/// Form: `YYYYmmddHHMMSS[.ffffff]Z#counter#sid#mod`, counter/sid/mod in hex.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Csn(String);

impl Csn {
    pub fn new(value: impl Into<String>) -> Self {
        Csn(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse into comparable components, `None` if malformed.
    pub(crate) fn components(&self) -> Option<CsnParts> {
        CsnParts::parse(&self.0)
    }

    pub fn is_well_formed(&self) -> bool {
        self.components().is_some()
    }

    /// Total order over well-formed CSNs, `None` if either side is malformed.
    pub fn try_cmp(&self, other: &Csn) -> Option<Ordering> {
        Some(self.components()?.cmp(&other.components()?))
    }
}

impl fmt::Debug for Csn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Csn({})", self.0)
    }
}

impl fmt::Display for Csn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct CsnParts {
    seconds: String,
    micros: u32,
    counter: u64,
    sid: u64,
    modifier: u64,
}

impl CsnParts {
    fn parse(s: &str) -> Option<Self> {
        let mut fields = s.trim().split('#');
        let time = fields.next()?.strip_suffix('Z')?;
        let counter = u64::from_str_radix(fields.next()?, 16).ok()?;
        let sid = u64::from_str_radix(fields.next()?, 16).ok()?;
        let modifier = u64::from_str_radix(fields.next()?, 16).ok()?;
        if fields.next().is_some() {
            return None;
        }

        let (seconds, fraction) = match time.split_once('.') {
            Some((secs, frac)) => (secs, frac),
            None => (time, ""),
        };
        if seconds.len() != 14 || !seconds.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        if fraction.len() > 6 || !fraction.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let micros = if fraction.is_empty() {
            0
        } else {
            format!("{:0<6}", fraction).parse().ok()?
        };

        Some(Self {
            seconds: seconds.to_string(),
            micros,
            counter,
            sid,
            modifier,
        })
    }
}

/// A single attribute of an entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub values: Vec<String>,
}

impl Attribute {
    pub fn new(name: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// A directory entry as seen by the dispatcher.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: EntryId,
    pub dn: Dn,
    pub attributes: Vec<Attribute>,
}

impl Entry {
    pub fn new(id: EntryId, dn: impl Into<Dn>) -> Self {
        Self {
            id,
            dn: dn.into(),
            attributes: Vec::new(),
        }
    }

    /// The synthetic entry standing for the root of the DIT.
    pub fn root() -> Self {
        Self {
            id: EntryId::ROOT,
            dn: Dn::root(),
            attributes: Vec::new(),
        }
    }

    /// Add values to an attribute, creating it if absent.
    pub fn with_attr<I, S>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values: Vec<String> = values.into_iter().map(Into::into).collect();
        match self.attributes.iter_mut().find(|a| a.is(name)) {
            Some(existing) => existing.values.extend(values),
            None => self.attributes.push(Attribute::new(name, values)),
        }
        self
    }

    /// Replace all values of an attribute.
    pub fn set_attr<I, S>(&mut self, name: &str, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values: Vec<String> = values.into_iter().map(Into::into).collect();
        match self.attributes.iter_mut().find(|a| a.is(name)) {
            Some(existing) => existing.values = values,
            None => self.attributes.push(Attribute::new(name, values)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.is(name))
    }

    pub fn values(&self, name: &str) -> &[String] {
        self.get(name).map(|a| a.values.as_slice()).unwrap_or(&[])
    }

    pub fn has_object_class(&self, class: &str) -> bool {
        self.values(attr::OBJECT_CLASS)
            .iter()
            .any(|v| v.eq_ignore_ascii_case(class))
    }

    pub fn is_referral(&self) -> bool {
        self.has_object_class(oc::REFERRAL)
    }

    pub fn is_alias(&self) -> bool {
        self.has_object_class(oc::ALIAS)
    }

    pub fn is_subentry(&self) -> bool {
        self.has_object_class(oc::SUBENTRY)
    }

    /// Referral URLs carried by a referral entry.
    pub fn referrals(&self) -> Vec<String> {
        self.values(attr::REF).to_vec()
    }

    /// Target of an alias entry.
    pub fn aliased_dn(&self) -> Option<Dn> {
        self.values(attr::ALIASED_OBJECT_NAME).first().map(|v| Dn::new(v.as_str()))
    }

    /// All change sequence numbers recorded on the entry.
    pub fn csns(&self) -> impl Iterator<Item = Csn> + '_ {
        self.values(attr::ENTRY_CSN).iter().map(|v| Csn::new(v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dn_normalization() {
        let dn = Dn::new("CN=John  Smith , OU=People,DC=Example");
        assert_eq!(dn.normalized(), "cn=john smith,ou=people,dc=example");
        assert_eq!(dn.raw(), "CN=John  Smith , OU=People,DC=Example");
        assert_eq!(dn, Dn::new("cn=john smith,ou=people,dc=example"));
    }

    #[test]
    fn test_dn_parent_and_suffix() {
        let base = Dn::new("dc=example");
        let child = Dn::new("ou=People,dc=example");
        let grandchild = Dn::new("cn=a,ou=People,dc=example");
        let lookalike = Dn::new("dc=notexample");

        assert_eq!(child.parent(), Some(base.clone()));
        assert_eq!(base.parent(), Some(Dn::root()));
        assert_eq!(Dn::root().parent(), None);

        assert!(grandchild.is_descendant_or_self(&base));
        assert!(base.is_descendant_or_self(&base));
        assert!(!lookalike.is_descendant_or_self(&base));
        assert!(child.is_child_of(&base));
        assert!(!grandchild.is_child_of(&base));
        assert!(base.is_child_of(&Dn::root()));
    }

    #[test]
    fn test_dn_escaped_comma() {
        let dn = Dn::new("cn=Smith\\, John,dc=example");
        assert_eq!(dn.parent(), Some(Dn::new("dc=example")));
        assert!(dn.is_descendant_or_self(&Dn::new("dc=example")));

        let single = Dn::new("cn=a\\,dc=example");
        assert_eq!(single.parent(), Some(Dn::root()));
        assert!(!single.is_descendant_or_self(&Dn::new("dc=example")));
        assert!(single.is_descendant_or_self(&Dn::root()));
        assert_eq!(single.relative_to(&Dn::new("dc=example")), None);
    }

    #[test]
    fn test_csn_ordering() {
        let a = Csn::new("20020101120000Z#000001#00#000000");
        let b = Csn::new("20020101120000Z#000002#00#000000");
        let c = Csn::new("20020101120001Z#000000#00#000000");
        let fractional = Csn::new("20020101120000.5Z#000000#00#000000");

        assert_eq!(a.try_cmp(&b), Some(Ordering::Less));
        assert_eq!(c.try_cmp(&b), Some(Ordering::Greater));
        assert_eq!(a.try_cmp(&a), Some(Ordering::Equal));
        assert_eq!(fractional.try_cmp(&c), Some(Ordering::Less));
        assert_eq!(fractional.try_cmp(&a), Some(Ordering::Greater));
    }

    #[test]
    fn test_csn_malformed() {
        let good = Csn::new("20020101120000Z#000001#00#000000");
        let bad = Csn::new("yesterday");
        assert!(!bad.is_well_formed());
        assert_eq!(good.try_cmp(&bad), None);
        assert!(!Csn::new("2002010112Z#1#0#0").is_well_formed());
    }

    #[test]
    fn test_entry_classes() {
        let entry = Entry::new(EntryId(3), "cn=ref,dc=example")
            .with_attr(attr::OBJECT_CLASS, ["top", "Referral"])
            .with_attr(attr::REF, ["ldap://other/dc=example"]);

        assert!(entry.is_referral());
        assert!(!entry.is_alias());
        assert_eq!(entry.referrals(), vec!["ldap://other/dc=example".to_string()]);
        assert_eq!(entry.values("objectclass").len(), 2);
    }

    #[test]
    fn test_dn_serde_roundtrip_keeps_raw() {
        let dn = Dn::new("CN=A,DC=Example");
        let json = serde_json::to_string(&dn).unwrap();
        assert_eq!(json, "\"CN=A,DC=Example\"");
        let back: Dn = serde_json::from_str(&json).unwrap();
        assert_eq!(back.normalized(), "cn=a,dc=example");
    }
}
