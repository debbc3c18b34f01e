//! Candidate set builder.
//!
//! Rewrites a subscription's base/scope/filter into the synthetic tree
//!
//! ```text
//! (&(scope=base)[(objectClass=subentry)](|[(objectClass=referral)][(objectClass=alias)](user-filter)))
//! ```
//!
//! and hands it to the index compiler. The OR wrapper is only added when at
//! least one extra disjunct applies.

use crate::filter::Filter;
use crate::idl::{CandidateSet, ScratchStack};
use crate::index::{IndexCompiler, IndexError};
use crate::types::{attr, oc, DerefPolicy, Entry, Scope};
use tracing::{debug, trace, warn};

/// Request properties that change the shape of the synthetic filter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CandidateOptions {
    /// Referral entries are treated as ordinary entries.
    pub manage_dsa_it: bool,
    pub deref: DerefPolicy,
    /// Only subentries are visible.
    pub subentries_visible: bool,
}

/// Builds candidate sets through an [`IndexCompiler`].
pub struct CandidateBuilder<'a> {
    compiler: &'a dyn IndexCompiler,
}

impl<'a> CandidateBuilder<'a> {
    pub fn new(compiler: &'a dyn IndexCompiler) -> Self {
        Self { compiler }
    }

    /// Candidate identifiers for a search rooted at `base`.
    ///
    /// Base scope short-circuits to `{base}`. Compiler failures are returned
    /// as errors, never as an empty set.
    pub fn build(
        &self,
        base: &Entry,
        scope: Scope,
        filter: &Filter,
        options: &CandidateOptions,
    ) -> Result<CandidateSet, IndexError> {
        if scope == Scope::Base {
            trace!(base = %base.dn, id = %base.id, "base candidate");
            return Ok(CandidateSet::singleton(base.id));
        }

        let synthetic = synthesize(base, scope, filter, options);
        let depth = synthetic.nesting_depth();
        let mut scratch = ScratchStack::with_depth(depth + 1);

        debug!(
            base = %base.dn,
            id = %base.id,
            %scope,
            depth,
            filter = %synthetic,
            "evaluating candidates"
        );

        let result = self.compiler.filter_candidates(&synthetic, &mut scratch);
        if scratch.peak() > scratch.reserved() {
            warn!(
                peak = scratch.peak(),
                reserved = scratch.reserved(),
                "scratch stack grew past computed filter depth"
            );
        }

        match &result {
            Ok(set) => debug!(
                count = set.len(),
                first = ?set.first(),
                last = ?set.last(),
                "candidates computed"
            ),
            Err(e) => debug!(error = %e, "candidate evaluation failed"),
        }
        result
    }
}

/// Assemble the synthetic filter for a non-base search.
pub fn synthesize(base: &Entry, scope: Scope, filter: &Filter, options: &CandidateOptions) -> Filter {
    let mut disjuncts = Vec::new();
    if !filter.tests_object_class_presence() && !options.subentries_visible {
        if !options.manage_dsa_it {
            disjuncts.push(Filter::equality(attr::OBJECT_CLASS, oc::REFERRAL));
        }
        if options.deref.searching() {
            disjuncts.push(Filter::equality(attr::OBJECT_CLASS, oc::ALIAS));
        }
    }

    let matched = if disjuncts.is_empty() {
        filter.clone()
    } else {
        disjuncts.push(filter.clone());
        Filter::Or(disjuncts)
    };

    let scope_clause = match scope {
        Scope::Subtree => Filter::DnSubtree(base.dn.clone()),
        _ => Filter::DnOneLevel(base.dn.clone()),
    };

    let mut conjuncts = vec![scope_clause];
    if options.subentries_visible {
        conjuncts.push(Filter::equality(attr::OBJECT_CLASS, oc::SUBENTRY));
    }
    conjuncts.push(matched);
    Filter::And(conjuncts)
}
