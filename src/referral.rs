//! Referral URL rewriting.

use crate::types::{Dn, Scope};

/// Rewrites referral URLs so they point at what the client asked for.
pub trait ReferralRewriter: Send + Sync {
    /// `matched` is the DN of the entry holding the referral; `target` the
    /// DN the client was looking for, if any.
    fn rewrite(
        &self,
        urls: &[String],
        matched: Option<&Dn>,
        target: Option<&Dn>,
        scope: Scope,
    ) -> Vec<String>;
}

/// Rewrites `ldap://host/dn?attrs?scope?...` URLs.
///
/// The DN part becomes the target DN with the matched suffix replaced by the
/// URL's DN; an empty DN part becomes the target (or matched) DN. The scope
/// part is replaced with the search scope. Non-LDAP URLs pass through.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultReferralRewriter;

impl ReferralRewriter for DefaultReferralRewriter {
    fn rewrite(
        &self,
        urls: &[String],
        matched: Option<&Dn>,
        target: Option<&Dn>,
        scope: Scope,
    ) -> Vec<String> {
        urls.iter()
            .filter_map(|url| rewrite_one(url, matched, target, scope))
            .collect()
    }
}

fn rewrite_one(url: &str, matched: Option<&Dn>, target: Option<&Dn>, scope: Scope) -> Option<String> {
    let url = url.trim();
    if url.is_empty() {
        return None;
    }
    let Some(scheme_end) = url.find("://") else {
        return Some(url.to_string());
    };
    let scheme = &url[..scheme_end];
    if !scheme.eq_ignore_ascii_case("ldap") && !scheme.eq_ignore_ascii_case("ldaps") {
        return Some(url.to_string());
    }

    let rest = &url[scheme_end + 3..];
    let (hostport, path) = match rest.find('/') {
        Some(pos) => (&rest[..pos], &rest[pos + 1..]),
        None => (rest, ""),
    };
    let mut fields: Vec<&str> = path.split('?').collect();
    let url_dn = decode(fields.first().copied().unwrap_or(""));

    let dn = if url_dn.is_empty() {
        target.or(matched).map(|d| d.raw().to_string()).unwrap_or_default()
    } else {
        match (matched, target) {
            (Some(matched), Some(target)) => match target.relative_to(matched) {
                Some(prefix) if !prefix.is_empty() => format!("{},{}", prefix, url_dn),
                _ => url_dn,
            },
            _ => url_dn,
        }
    };

    while fields.len() < 3 {
        fields.push("");
    }
    let encoded = encode(&dn);
    fields[0] = &encoded;
    fields[2] = scope.as_url_str();

    let mut tail = fields.join("?");
    while tail.ends_with('?') {
        tail.pop();
    }
    Some(format!("{}://{}/{}", scheme, hostport, tail))
}

fn decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(b) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            ' ' => out.push_str("%20"),
            '?' => out.push_str("%3F"),
            '%' => out.push_str("%25"),
            c => out.push(c),
        }
    }
    out
}
