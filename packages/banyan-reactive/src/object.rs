//! Arena storage for composite objects.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use indexmap::{IndexMap, IndexSet};
use slotmap::new_key_type;
use smallvec::SmallVec;

use crate::effect::EffectId;
use crate::value::{Key, MapKey, Value};

new_key_type! {
    /// Stable identity of a composite object within its root.
    pub struct ObjectId;
}

/// The four composite kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectKind {
    /// String-keyed fields with an optional prototype.
    Record,
    /// An ordered sequence.
    List,
    /// A keyed mapping.
    Map,
    /// A set of members.
    Set,
}

/// A record field: either plain data or an accessor pair.
pub(crate) enum Slot {
    Data(Value),
    Accessor {
        get: Rc<dyn Fn() -> Value>,
        set: Option<Rc<dyn Fn(Value)>>,
    },
}

/// The kind-specific payload of an object.
pub(crate) enum Storage {
    Record {
        fields: IndexMap<Rc<str>, Slot>,
        proto: Option<ObjectId>,
    },
    List(Vec<Value>),
    Map(IndexMap<MapKey, Value>),
    Set(IndexSet<MapKey>),
}

/// One composite object in the arena.
///
/// Besides the raw storage this carries the forward half of the dependency
/// registry (per-key watcher sets), the parent back-references used by deep
/// watching, and the classification bookkeeping.
pub(crate) struct ObjectData {
    pub storage: Storage,
    /// Effects depending on each key of this object.
    pub watchers: HashMap<Key, SmallVec<[EffectId; 2]>>,
    /// `(parent, key)` pairs naming every composite slot currently holding
    /// this object. Only maintained while the parent is deep-watched.
    pub back_refs: SmallVec<[(ObjectId, Key); 2]>,
    /// Deep-watch effects registered on this object.
    pub deep_watchers: SmallVec<[EffectId; 1]>,
    /// Whether this object is, or lies under, a deep-watch target.
    pub has_deep_watchers: bool,
    /// The user marked this object as forever non-reactive.
    pub non_reactive_mark: bool,
    /// Cached classification decision; `None` until first consulted.
    pub reactivity_cache: Option<bool>,
    /// Keys excluded from tracking on this object.
    pub unreactive_keys: HashSet<Key>,
}

impl ObjectData {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            watchers: HashMap::new(),
            back_refs: SmallVec::new(),
            deep_watchers: SmallVec::new(),
            has_deep_watchers: false,
            non_reactive_mark: false,
            reactivity_cache: None,
            unreactive_keys: HashSet::new(),
        }
    }

    pub fn kind(&self) -> ObjectKind {
        match &self.storage {
            Storage::Record { .. } => ObjectKind::Record,
            Storage::List(_) => ObjectKind::List,
            Storage::Map(_) => ObjectKind::Map,
            Storage::Set(_) => ObjectKind::Set,
        }
    }

    pub fn proto(&self) -> Option<ObjectId> {
        match &self.storage {
            Storage::Record { proto, .. } => *proto,
            _ => None,
        }
    }

    /// Registers `effect` as a watcher of `key`. Idempotent.
    pub fn add_watcher(&mut self, key: Key, effect: EffectId) {
        let set = self.watchers.entry(key).or_default();
        if !set.contains(&effect) {
            set.push(effect);
        }
    }

    /// Removes every watcher entry referencing `effect`.
    pub fn remove_watcher(&mut self, effect: EffectId) {
        self.watchers.retain(|_, set| {
            set.retain(|&mut e| e != effect);
            !set.is_empty()
        });
    }

    /// Snapshots the watchers registered for any of `keys`, in registration
    /// order, without duplicates.
    pub fn watchers_for(&self, keys: &[Key], out: &mut Vec<EffectId>) {
        for key in keys {
            if let Some(set) = self.watchers.get(key) {
                for &effect in set {
                    if !out.contains(&effect) {
                        out.push(effect);
                    }
                }
            }
        }
    }

    /// Records that `parent.key` currently holds this object.
    pub fn add_back_ref(&mut self, parent: ObjectId, key: Key) {
        if !self.back_refs.contains(&(parent, key.clone())) {
            self.back_refs.push((parent, key));
        }
    }

    /// Drops the back-reference for `parent.key`, if present.
    pub fn remove_back_ref(&mut self, parent: ObjectId, key: &Key) {
        self.back_refs
            .retain(|(p, k)| !(*p == parent && k == key));
    }

    /// Registers a deep watcher. Idempotent.
    pub fn add_deep_watcher(&mut self, effect: EffectId) {
        if !self.deep_watchers.contains(&effect) {
            self.deep_watchers.push(effect);
        }
        self.has_deep_watchers = true;
    }

    /// Unregisters a deep watcher; clears the flag when the set empties.
    pub fn remove_deep_watcher(&mut self, effect: EffectId) {
        self.deep_watchers.retain(|&mut e| e != effect);
        if self.deep_watchers.is_empty() {
            self.has_deep_watchers = false;
        }
    }
}
