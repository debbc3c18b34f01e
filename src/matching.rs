//! Attribute-value ordering comparison.

use crate::types::{attr, collapse_spaces, Csn};
use std::cmp::Ordering;
use thiserror::Error;

/// A comparison could not be carried out.
///
/// Callers degrade on this error (non-match, or no cookie update) instead of
/// propagating it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MatchError {
    #[error("Malformed value for {attr}: {value:?}")]
    Malformed { attr: String, value: String },

    #[error("No ordering rule for attribute {0}")]
    NoOrderingRule(String),
}

/// Matching-rule collaborator consulted by filter evaluation and cookie tracking.
pub trait ValueOrdering: Send + Sync {
    /// Order `value` (held by the entry) relative to `asserted`.
    fn compare(&self, attr: &str, value: &str, asserted: &str) -> Result<Ordering, MatchError>;

    /// Equality match.
    fn equal(&self, attr: &str, value: &str, asserted: &str) -> Result<bool, MatchError> {
        self.compare(attr, value, asserted).map(|o| o == Ordering::Equal)
    }

    /// Substring match against the normalized value.
    fn substrings(
        &self,
        _attr: &str,
        value: &str,
        initial: Option<&str>,
        any: &[String],
        final_: Option<&str>,
    ) -> Result<bool, MatchError> {
        let value = fold(value);
        let mut rest = value.as_str();

        if let Some(initial) = initial {
            let initial = fold(initial);
            match rest.strip_prefix(initial.as_str()) {
                Some(r) => rest = r,
                None => return Ok(false),
            }
        }
        for piece in any {
            let piece = fold(piece);
            match rest.find(piece.as_str()) {
                Some(pos) => rest = &rest[pos + piece.len()..],
                None => return Ok(false),
            }
        }
        if let Some(final_) = final_ {
            return Ok(rest.ends_with(fold(final_).as_str()));
        }
        Ok(true)
    }
}

/// Case-ignore ordering for ordinary attributes, CSN ordering for `entryCSN`.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultOrdering;

impl ValueOrdering for DefaultOrdering {
    fn compare(&self, attr_name: &str, value: &str, asserted: &str) -> Result<Ordering, MatchError> {
        if attr_name.eq_ignore_ascii_case(attr::ENTRY_CSN) {
            let left = Csn::new(value);
            let right = Csn::new(asserted);
            return left.try_cmp(&right).ok_or_else(|| MatchError::Malformed {
                attr: attr_name.to_string(),
                value: if left.is_well_formed() {
                    asserted.to_string()
                } else {
                    value.to_string()
                },
            });
        }
        Ok(fold(value).cmp(&fold(asserted)))
    }
}

fn fold(s: &str) -> String {
    collapse_spaces(s).to_lowercase()
}
