//! In-memory directory backend.
//!
//! Implements both the storage ([`Directory`]) and index ([`IndexCompiler`])
//! collaborators over a set of in-memory tables. Useful for embedding and
//! for exercising the dispatcher without a transactional store.

use crate::config::PsearchConfig;
use crate::filter::Filter;
use crate::idl::{CandidateSet, ScratchStack, DEFAULT_MAX_IDS};
use crate::index::{IndexCompiler, IndexError};
use crate::storage::{AliasTarget, Directory, DnLookup, Locker, LockerPool, StorageError};
use crate::types::{attr, collapse_spaces, Dn, Entry, EntryId};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// Default number of lockers in the pool.
pub const DEFAULT_LOCKERS: usize = 64;

/// Longest alias chain followed before giving up.
const MAX_ALIAS_HOPS: usize = 16;

/// Attribute types known to the backend out of the box.
const BUILTIN_ATTRIBUTES: &[&str] = &[
    "objectClass",
    "entryCSN",
    "entryUUID",
    "ref",
    "aliasedObjectName",
    "cn",
    "sn",
    "givenName",
    "uid",
    "mail",
    "ou",
    "o",
    "dc",
    "description",
    "member",
    "telephoneNumber",
    "title",
];

#[derive(Default)]
struct Tables {
    /// All entries by ID.
    entries: BTreeMap<EntryId, Arc<Entry>>,

    /// Normalized DN to ID.
    dn_to_id: HashMap<String, EntryId>,

    /// Normalized parent DN to child IDs.
    children: HashMap<String, BTreeSet<EntryId>>,

    /// Attribute (lowercase) -> folded value -> IDs.
    equality: HashMap<String, HashMap<String, BTreeSet<EntryId>>>,

    /// Attribute types known to the schema (lowercase).
    schema: HashSet<String>,

    /// Naming contexts.
    suffixes: Vec<Dn>,

    next_id: u64,
}

impl Tables {
    fn all(&self) -> CandidateSet {
        match (self.entries.keys().next(), self.entries.keys().next_back()) {
            (Some(&first), Some(&last)) => CandidateSet::range(first, last),
            _ => CandidateSet::empty(),
        }
    }

    fn index_entry(&mut self, entry: &Entry) {
        for attribute in &entry.attributes {
            let key = attribute.name.to_ascii_lowercase();
            if let Some(values) = self.equality.get_mut(&key) {
                for value in &attribute.values {
                    values.entry(fold(value)).or_default().insert(entry.id);
                }
            }
        }
    }

    fn unindex_entry(&mut self, entry: &Entry) {
        for attribute in &entry.attributes {
            let key = attribute.name.to_ascii_lowercase();
            if let Some(values) = self.equality.get_mut(&key) {
                for value in &attribute.values {
                    let folded = fold(value);
                    if let Some(ids) = values.get_mut(&folded) {
                        ids.remove(&entry.id);
                        if ids.is_empty() {
                            values.remove(&folded);
                        }
                    }
                }
            }
        }
    }

    fn lookup(&self, dn: &Dn) -> Option<Arc<Entry>> {
        self.dn_to_id
            .get(dn.normalized())
            .and_then(|id| self.entries.get(id))
            .cloned()
    }

    /// Closest existing ancestor of `dn`.
    fn matched(&self, dn: &Dn) -> Option<Arc<Entry>> {
        let mut current = dn.parent();
        while let Some(candidate) = current {
            if candidate.is_root() {
                return None;
            }
            if let Some(found) = self.lookup(&candidate) {
                return Some(found);
            }
            current = candidate.parent();
        }
        None
    }

    fn is_defined(&self, name: &str) -> bool {
        self.schema.contains(&name.to_ascii_lowercase())
    }

    fn subtree(&self, dn: &Dn) -> BTreeSet<EntryId> {
        let mut out = BTreeSet::new();
        let Some(root) = self.lookup(dn) else {
            return out;
        };
        let mut pending = vec![root];
        while let Some(entry) = pending.pop() {
            out.insert(entry.id);
            if let Some(kids) = self.children.get(entry.dn.normalized()) {
                pending.extend(kids.iter().filter_map(|id| self.entries.get(id).cloned()));
            }
        }
        out
    }
}

/// In-memory directory with DN, scope and equality indices.
pub struct MemoryDirectory {
    tables: RwLock<Tables>,
    lockers: Arc<LockerPool>,
    max_ids: usize,
}

impl MemoryDirectory {
    /// Create an empty directory serving one naming context.
    pub fn new(suffix: impl Into<Dn>) -> Self {
        Self::with_options(vec![suffix.into()], DEFAULT_LOCKERS, DEFAULT_MAX_IDS)
    }

    /// Create a directory bounded by `config.max_candidate_ids`.
    pub fn from_config(suffix: impl Into<Dn>, config: &PsearchConfig) -> Self {
        Self::with_options(vec![suffix.into()], DEFAULT_LOCKERS, config.max_candidate_ids)
    }

    pub fn with_options(suffixes: Vec<Dn>, lockers: usize, max_ids: usize) -> Self {
        let mut tables = Tables {
            suffixes,
            next_id: 1,
            ..Default::default()
        };
        tables.schema = BUILTIN_ATTRIBUTES
            .iter()
            .map(|a| a.to_ascii_lowercase())
            .collect();
        tables
            .equality
            .insert(attr::OBJECT_CLASS.to_ascii_lowercase(), HashMap::new());

        Self {
            tables: RwLock::new(tables),
            lockers: LockerPool::new(lockers),
            max_ids,
        }
    }

    pub fn lockers(&self) -> &Arc<LockerPool> {
        &self.lockers
    }

    pub fn max_ids(&self) -> usize {
        self.max_ids
    }

    /// Add an attribute type to the schema.
    pub fn define_attribute(&self, name: &str) {
        self.tables.write().schema.insert(name.to_ascii_lowercase());
    }

    /// Maintain an equality index for an attribute, indexing existing entries.
    pub fn index_attribute(&self, name: &str) {
        let mut tables = self.tables.write();
        let key = name.to_ascii_lowercase();
        tables.schema.insert(key.clone());
        if tables.equality.contains_key(&key) {
            return;
        }
        tables.equality.insert(key, HashMap::new());
        let entries: Vec<Arc<Entry>> = tables.entries.values().cloned().collect();
        for entry in entries {
            tables.index_entry(&entry);
        }
    }

    /// Store a new entry, assigning its ID. The parent must exist unless the
    /// entry is a naming context.
    pub fn add(&self, mut entry: Entry) -> Result<Arc<Entry>, StorageError> {
        let mut tables = self.tables.write();
        let norm = entry.dn.normalized().to_string();
        if tables.dn_to_id.contains_key(&norm) {
            return Err(StorageError::Other(format!("entry already exists: {}", entry.dn)));
        }

        let parent = entry.dn.parent().unwrap_or_else(Dn::root);
        let is_suffix = tables.suffixes.iter().any(|s| *s == entry.dn);
        if !is_suffix && tables.lookup(&parent).is_none() {
            return Err(StorageError::Other(format!("parent of {} not found", entry.dn)));
        }

        entry.id = EntryId(tables.next_id);
        tables.next_id += 1;
        let entry = Arc::new(entry);

        tables.dn_to_id.insert(norm, entry.id);
        tables
            .children
            .entry(parent.normalized().to_string())
            .or_default()
            .insert(entry.id);
        tables.index_entry(&entry);
        tables.entries.insert(entry.id, Arc::clone(&entry));
        Ok(entry)
    }

    /// Apply a modification to an entry in place. The DN may not change.
    pub fn modify<F>(&self, id: EntryId, change: F) -> Result<Arc<Entry>, StorageError>
    where
        F: FnOnce(&mut Entry),
    {
        let mut tables = self.tables.write();
        let current = tables
            .entries
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::Other(format!("no such entry: {}", id)))?;

        let mut updated = (*current).clone();
        change(&mut updated);
        if updated.dn != current.dn || updated.id != current.id {
            return Err(StorageError::Other("modify may not rename an entry".into()));
        }

        tables.unindex_entry(&current);
        let updated = Arc::new(updated);
        tables.index_entry(&updated);
        tables.entries.insert(id, Arc::clone(&updated));
        Ok(updated)
    }

    /// Remove a leaf entry.
    pub fn delete(&self, id: EntryId) -> Result<Arc<Entry>, StorageError> {
        let mut tables = self.tables.write();
        let entry = tables
            .entries
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::Other(format!("no such entry: {}", id)))?;
        if tables
            .children
            .get(entry.dn.normalized())
            .map_or(false, |kids| !kids.is_empty())
        {
            return Err(StorageError::Other(format!("{} has children", entry.dn)));
        }

        tables.unindex_entry(&entry);
        tables.entries.remove(&id);
        tables.dn_to_id.remove(entry.dn.normalized());
        let parent = entry.dn.parent().unwrap_or_else(Dn::root);
        if let Some(kids) = tables.children.get_mut(parent.normalized()) {
            kids.remove(&id);
        }
        Ok(entry)
    }

    pub fn get(&self, id: EntryId) -> Option<Arc<Entry>> {
        self.tables.read().entries.get(&id).cloned()
    }

    pub fn get_by_dn(&self, dn: &Dn) -> Option<Arc<Entry>> {
        self.tables.read().lookup(dn)
    }

    pub fn len(&self) -> usize {
        self.tables.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evaluate(
        &self,
        tables: &Tables,
        filter: &Filter,
        scratch: &mut ScratchStack,
    ) -> Result<CandidateSet, IndexError> {
        match filter {
            Filter::And(children) => {
                scratch.push(tables.all());
                for child in children {
                    let set = match self.evaluate(tables, child, scratch) {
                        Ok(set) => set,
                        Err(e) => {
                            scratch.pop();
                            return Err(e);
                        }
                    };
                    if let Some(top) = scratch.top_mut() {
                        *top = top.intersection(&set);
                        if top.is_empty() {
                            break;
                        }
                    }
                }
                Ok(scratch.pop().unwrap_or_else(CandidateSet::empty))
            }
            Filter::Or(children) => {
                scratch.push(CandidateSet::empty());
                for child in children {
                    let set = match self.evaluate(tables, child, scratch) {
                        Ok(set) => set,
                        Err(e) => {
                            scratch.pop();
                            return Err(e);
                        }
                    };
                    if let Some(top) = scratch.top_mut() {
                        *top = top.union(&set, self.max_ids);
                    }
                }
                Ok(scratch.pop().unwrap_or_else(CandidateSet::empty))
            }
            // Negation cannot be answered from an index.
            Filter::Not(_) => Ok(tables.all()),
            Filter::Equality { attr, value } => {
                ensure_defined(tables, attr)?;
                match tables.equality.get(&attr.to_ascii_lowercase()) {
                    Some(values) => Ok(values
                        .get(&fold(value))
                        .map(|ids| CandidateSet::from_ids(ids.iter().copied(), self.max_ids))
                        .unwrap_or_else(CandidateSet::empty)),
                    None => Ok(tables.all()),
                }
            }
            Filter::Present(attr_name) => {
                ensure_defined(tables, attr_name)?;
                if attr_name.eq_ignore_ascii_case(attr::OBJECT_CLASS) {
                    return Ok(tables.all());
                }
                match tables.equality.get(&attr_name.to_ascii_lowercase()) {
                    Some(values) => Ok(CandidateSet::from_ids(
                        values.values().flat_map(|ids| ids.iter().copied()),
                        self.max_ids,
                    )),
                    None => Ok(tables.all()),
                }
            }
            Filter::GreaterOrEqual { attr, .. }
            | Filter::LessOrEqual { attr, .. }
            | Filter::Substrings { attr, .. } => {
                ensure_defined(tables, attr)?;
                Ok(tables.all())
            }
            Filter::DnOneLevel(dn) => Ok(tables
                .children
                .get(dn.normalized())
                .map(|ids| CandidateSet::from_ids(ids.iter().copied(), self.max_ids))
                .unwrap_or_else(CandidateSet::empty)),
            Filter::DnSubtree(dn) => {
                if dn.is_root() {
                    return Ok(tables.all());
                }
                Ok(CandidateSet::from_ids(tables.subtree(dn), self.max_ids))
            }
        }
    }
}

fn ensure_defined(tables: &Tables, name: &str) -> Result<(), IndexError> {
    if tables.is_defined(name) {
        Ok(())
    } else {
        Err(IndexError::UndefinedAttribute(name.to_string()))
    }
}

fn fold(value: &str) -> String {
    collapse_spaces(value).to_lowercase()
}

impl Directory for MemoryDirectory {
    fn acquire_locker(&self) -> Result<Locker, StorageError> {
        self.lockers.acquire()
    }

    fn entry_by_dn(&self, _locker: &Locker, dn: &Dn) -> Result<DnLookup, StorageError> {
        let tables = self.tables.read();
        match tables.lookup(dn) {
            Some(entry) => Ok(DnLookup {
                entry: Some(entry),
                matched: None,
            }),
            None => Ok(DnLookup {
                entry: None,
                matched: tables.matched(dn),
            }),
        }
    }

    fn deref_alias(&self, _locker: &Locker, alias: &Entry) -> Result<AliasTarget, StorageError> {
        let tables = self.tables.read();
        let mut visited = HashSet::new();
        visited.insert(alias.id);
        let mut current_target = alias.aliased_dn();

        for _ in 0..MAX_ALIAS_HOPS {
            let Some(target_dn) = current_target else {
                return Ok(AliasTarget::Missing { matched: None });
            };
            let Some(target) = tables.lookup(&target_dn) else {
                return Ok(AliasTarget::Missing {
                    matched: tables.matched(&target_dn),
                });
            };
            if !visited.insert(target.id) {
                return Ok(AliasTarget::Loop);
            }
            if !target.is_alias() {
                return Ok(AliasTarget::Resolved(target));
            }
            current_target = target.aliased_dn();
        }
        Ok(AliasTarget::Loop)
    }

    fn is_suffix(&self, dn: &Dn) -> bool {
        self.tables.read().suffixes.iter().any(|s| s == dn)
    }
}

impl IndexCompiler for MemoryDirectory {
    fn filter_candidates(
        &self,
        filter: &Filter,
        scratch: &mut ScratchStack,
    ) -> Result<CandidateSet, IndexError> {
        let tables = self.tables.read();
        self.evaluate(&tables, filter, scratch)
    }
}
