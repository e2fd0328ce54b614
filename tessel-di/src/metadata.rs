//! Metadata registry for explicit, annotation-free wiring
//!
//! Metadata entries are key/value pairs attached to a class, one of its
//! members, or one of its constructor parameters. Entries are written once
//! during static wiring and read by the injector and by any other consumer
//! (schema generators, route tables) that needs to inspect a class.
//!
//! Lookups can optionally walk the supertype chain recorded with
//! [`MetadataRegistry::define_supertype`]; the nearest ancestor wins.

use parking_lot::RwLock;
use std::any::{type_name, Any};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::trace;

use crate::error::{DiError, DiResult};
use crate::value::{downcast, Value};

/// Identifier distinguishing one kind of annotation from another
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetadataKey(Arc<str>);

impl MetadataKey {
    pub fn new(name: &str) -> Self {
        MetadataKey(Arc::from(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MetadataKey {
    fn from(name: &str) -> Self {
        MetadataKey::new(name)
    }
}

impl fmt::Debug for MetadataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MetadataKey({})", self.0)
    }
}

impl fmt::Display for MetadataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name-based identity of a class
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(Arc<str>);

impl ClassId {
    pub fn new(name: &str) -> Self {
        ClassId(Arc::from(name))
    }

    /// Identity derived from a Rust type name
    pub fn of<T: ?Sized>() -> Self {
        ClassId::new(type_name::<T>())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClassId({})", self.0)
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a metadata entry is attached to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MetadataTarget {
    /// The class itself
    Class(ClassId),
    /// A named instance member (property or method)
    Member(ClassId, String),
    /// A constructor parameter by position
    Parameter(ClassId, usize),
}

impl MetadataTarget {
    pub fn class(&self) -> &ClassId {
        match self {
            MetadataTarget::Class(class)
            | MetadataTarget::Member(class, _)
            | MetadataTarget::Parameter(class, _) => class,
        }
    }

    /// The same target on another class
    fn rebased(&self, class: &ClassId) -> MetadataTarget {
        match self {
            MetadataTarget::Class(_) => MetadataTarget::Class(class.clone()),
            MetadataTarget::Member(_, name) => MetadataTarget::Member(class.clone(), name.clone()),
            MetadataTarget::Parameter(_, index) => MetadataTarget::Parameter(class.clone(), *index),
        }
    }
}

impl fmt::Display for MetadataTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataTarget::Class(class) => write!(f, "{}", class),
            MetadataTarget::Member(class, name) => write!(f, "{}.{}", class, name),
            MetadataTarget::Parameter(class, index) => write!(f, "{}#{}", class, index),
        }
    }
}

/// Lookup mode for metadata reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetadataMode {
    /// Only entries attached directly to the target
    #[default]
    Own,
    /// Fall back to the supertype chain, most-derived first
    Inherited,
}

/// Registry of metadata entries
#[derive(Default)]
pub struct MetadataRegistry {
    entries: RwLock<HashMap<MetadataTarget, HashMap<MetadataKey, Value>>>,
    supertypes: RwLock<HashMap<ClassId, ClassId>>,
}

impl MetadataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `value` under `key`, replacing any prior entry for the pair
    pub fn define<T: Any + Send + Sync>(
        &self,
        key: &MetadataKey,
        target: MetadataTarget,
        value: T,
    ) -> Option<Value> {
        self.define_value(key, target, Arc::new(value))
    }

    /// Attach an already type-erased value
    pub fn define_value(
        &self,
        key: &MetadataKey,
        target: MetadataTarget,
        value: Value,
    ) -> Option<Value> {
        trace!("Defining metadata {} on {}", key, target);
        self.entries
            .write()
            .entry(target)
            .or_default()
            .insert(key.clone(), value)
    }

    /// Remove one entry
    pub fn remove(&self, key: &MetadataKey, target: &MetadataTarget) -> Option<Value> {
        let mut entries = self.entries.write();
        let per_target = entries.get_mut(target)?;
        let removed = per_target.remove(key);
        if per_target.is_empty() {
            entries.remove(target);
        }
        removed
    }

    /// Untyped read
    pub fn get_value(
        &self,
        key: &MetadataKey,
        target: &MetadataTarget,
        mode: MetadataMode,
    ) -> Option<Value> {
        let entries = self.entries.read();
        let lookup = |target: &MetadataTarget| {
            entries
                .get(target)
                .and_then(|per_target| per_target.get(key))
                .cloned()
        };

        match mode {
            MetadataMode::Own => lookup(target),
            MetadataMode::Inherited => self
                .supertype_chain(target.class())
                .iter()
                .find_map(|class| lookup(&target.rebased(class))),
        }
    }

    /// Typed read; `Ok(None)` when no entry exists
    pub fn get<T: Any + Send + Sync>(
        &self,
        key: &MetadataKey,
        target: &MetadataTarget,
        mode: MetadataMode,
    ) -> DiResult<Option<Arc<T>>> {
        match self.get_value(key, target, mode) {
            Some(value) => downcast::<T>(&format!("{} on {}", key, target), value).map(Some),
            None => Ok(None),
        }
    }

    /// Whether an entry exists
    pub fn contains(&self, key: &MetadataKey, target: &MetadataTarget, mode: MetadataMode) -> bool {
        self.get_value(key, target, mode).is_some()
    }

    /// Keys attached directly to a target
    pub fn keys(&self, target: &MetadataTarget) -> Vec<MetadataKey> {
        let mut keys: Vec<_> = self
            .entries
            .read()
            .get(target)
            .map(|per_target| per_target.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Record `parent` as the direct supertype of `class`
    pub fn define_supertype(&self, class: ClassId, parent: ClassId) -> DiResult<()> {
        if self.supertype_chain(&parent).contains(&class) {
            return Err(DiError::Other(format!(
                "Supertype cycle: {} cannot extend {}",
                class, parent
            )));
        }
        self.supertypes.write().insert(class, parent);
        Ok(())
    }

    /// The class followed by its ancestors, nearest first
    pub fn supertype_chain(&self, class: &ClassId) -> Vec<ClassId> {
        let supertypes = self.supertypes.read();
        let mut chain = vec![class.clone()];
        let mut current = class;
        while let Some(parent) = supertypes.get(current) {
            chain.push(parent.clone());
            current = parent;
        }
        chain
    }

    /// Parameter entries of a class for `key`, ordered by position
    pub fn parameters(&self, key: &MetadataKey, class: &ClassId) -> Vec<(usize, Value)> {
        let entries = self.entries.read();
        let mut found: Vec<(usize, Value)> = entries
            .iter()
            .filter_map(|(target, per_target)| match target {
                MetadataTarget::Parameter(owner, index) if owner == class => {
                    per_target.get(key).map(|value| (*index, value.clone()))
                }
                _ => None,
            })
            .collect();
        found.sort_by_key(|(index, _)| *index);
        found
    }

    /// Member entries of a class for `key`, ordered by member name.
    ///
    /// In inherited mode a member declared on a subclass hides the same
    /// member declared on an ancestor.
    pub fn members(
        &self,
        key: &MetadataKey,
        class: &ClassId,
        mode: MetadataMode,
    ) -> Vec<(String, Value)> {
        let classes = match mode {
            MetadataMode::Own => vec![class.clone()],
            MetadataMode::Inherited => self.supertype_chain(class),
        };

        let entries = self.entries.read();
        let mut found: BTreeMap<String, Value> = BTreeMap::new();
        // Ancestors first so that subclasses overwrite them
        for current in classes.iter().rev() {
            for (target, per_target) in entries.iter() {
                if let MetadataTarget::Member(owner, name) = target {
                    if owner == current {
                        if let Some(value) = per_target.get(key) {
                            found.insert(name.clone(), value.clone());
                        }
                    }
                }
            }
        }
        found.into_iter().collect()
    }
}

impl fmt::Debug for MetadataRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetadataRegistry")
            .field("targets", &self.entries.read().len())
            .field("supertypes", &self.supertypes.read().len())
            .finish()
    }
}
