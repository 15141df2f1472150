//! Reactive views over composite objects: tracked reads, notifying writes,
//! and non-reactive classification.

use std::rc::Rc;

use indexmap::{IndexMap, IndexSet};

use crate::error::{Error, Result};
use crate::object::{ObjectData, ObjectId, ObjectKind, Slot, Storage};
use crate::root::Root;
use crate::value::{Evolution, Key, MapKey, Value};

/// A handle to a composite object.
///
/// A handle is either a **view** (reads register dependencies, writes notify)
/// or **raw** (fully transparent). Both flavors address the same underlying
/// object: the identity is the [`ObjectId`], so [`reactive`] and [`unwrap`]
/// are trivially stable bijections.
#[derive(Clone, Copy)]
pub struct Obj {
    id: ObjectId,
    root: &'static Root,
    view: bool,
}

/// Handles compare by object identity, regardless of flavor.
impl PartialEq for Obj {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Obj {}
impl std::hash::Hash for Obj {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
impl std::fmt::Debug for Obj {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = self.kind();
        let flavor = if self.view { "view" } else { "raw" };
        write!(f, "{kind:?}({flavor} {:?})", self.id)
    }
}

fn alloc(storage: Storage) -> Obj {
    let root = Root::global();
    let id = root.objects.borrow_mut().insert(ObjectData::new(storage));
    Obj {
        id,
        root,
        view: false,
    }
}

/// Creates an empty raw record.
pub fn create_record() -> Obj {
    alloc(Storage::Record {
        fields: IndexMap::new(),
        proto: None,
    })
}

/// Creates an empty raw record whose key lookups fall back to `proto`.
pub fn create_record_with_proto(proto: Obj) -> Obj {
    alloc(Storage::Record {
        fields: IndexMap::new(),
        proto: Some(proto.id),
    })
}

/// Creates an empty raw list.
pub fn create_list() -> Obj {
    alloc(Storage::List(Vec::new()))
}

/// Creates an empty raw map.
pub fn create_map() -> Obj {
    alloc(Storage::Map(IndexMap::new()))
}

/// Creates an empty raw set.
pub fn create_set() -> Obj {
    alloc(Storage::Set(IndexSet::new()))
}

/// Returns the reactive rendition of `value`.
///
/// Primitives, opaques, and composites classified non-reactive come back
/// unchanged; composites come back as their stable view. Two calls for the
/// same object yield the same view, and `reactive(reactive(x)) == reactive(x)`.
pub fn reactive(value: Value) -> Value {
    match value {
        Value::Obj(o) => Value::Obj(reactive_obj(o)),
        other => other,
    }
}

/// [`reactive`] specialized to composite handles.
pub fn reactive_obj(o: Obj) -> Obj {
    if is_non_reactive_id(o.root, o.id) {
        o
    } else {
        Obj { view: true, ..o }
    }
}

/// Returns the underlying raw rendition of `value`: the inverse of
/// [`reactive`]. Non-composites pass through unchanged.
pub fn unwrap(value: Value) -> Value {
    match value {
        Value::Obj(o) => Value::Obj(Obj { view: false, ..o }),
        other => other,
    }
}

/// Whether `value` is a reactive view.
pub fn is_reactive(value: &Value) -> bool {
    matches!(value, Value::Obj(o) if o.view)
}

/// Marks each object as forever non-reactive: [`reactive`] returns it
/// unchanged and writes to it never trigger any effect.
pub fn non_reactive(objects: impl IntoIterator<Item = Obj>) {
    let root = Root::global();
    let mut store = root.objects.borrow_mut();
    for o in objects {
        if let Some(data) = store.get_mut(o.id) {
            data.non_reactive_mark = true;
        }
    }
    drop(store);
    invalidate_classification(root);
}

/// Marks every record whose prototype chain contains one of `protos` as
/// non-reactive. This is the class-level analogue of [`non_reactive`].
pub fn non_reactive_proto(protos: impl IntoIterator<Item = Obj>) {
    let root = Root::global();
    root.non_reactive_protos
        .borrow_mut()
        .extend(protos.into_iter().map(|o| o.id));
    invalidate_classification(root);
}

/// Registers a custom non-reactive classification predicate.
pub fn non_reactive_when(pred: impl Fn(Obj) -> bool + 'static) {
    let root = Root::global();
    root.non_reactive_predicates.borrow_mut().push(Rc::new(pred));
    invalidate_classification(root);
}

/// Excludes `keys` from tracking on `obj`: reads of them never register
/// dependencies and writes never notify. Applies to the object's own reads;
/// records inherit the exclusions of their prototypes.
pub fn mark_unreactive_keys(obj: Obj, keys: impl IntoIterator<Item = Key>) {
    let mut store = obj.root.objects.borrow_mut();
    if let Some(data) = store.get_mut(obj.id) {
        data.unreactive_keys.extend(keys);
    }
}

/// Classification marks changed; cached decisions are stale.
fn invalidate_classification(root: &Root) {
    for (_, data) in root.objects.borrow_mut().iter_mut() {
        data.reactivity_cache = None;
    }
}

/// The cached non-reactive classification of an object. Walks the user mark,
/// the prototype chain against the class-level registry, and the custom
/// predicates, in that order.
pub(crate) fn is_non_reactive_id(root: &'static Root, id: ObjectId) -> bool {
    {
        let store = root.objects.borrow();
        match store.get(id) {
            Some(data) => {
                if let Some(cached) = data.reactivity_cache {
                    return cached;
                }
                if data.non_reactive_mark {
                    drop(store);
                    cache_classification(root, id, true);
                    return true;
                }
            }
            None => return true,
        }
    }
    let mut result = {
        let store = root.objects.borrow();
        let protos = root.non_reactive_protos.borrow();
        let mut cur = store.get(id).and_then(|d| d.proto());
        let mut hit = false;
        let mut hops = 0usize;
        while let Some(p) = cur {
            if protos.contains(&p) {
                hit = true;
                break;
            }
            cur = store.get(p).and_then(|d| d.proto());
            hops += 1;
            if hops > 64 {
                break; // defend against prototype cycles
            }
        }
        hit
    };
    if !result {
        let predicates: Vec<_> = root.non_reactive_predicates.borrow().clone();
        let handle = Obj {
            id,
            root,
            view: false,
        };
        result = predicates.iter().any(|pred| pred(handle));
    }
    cache_classification(root, id, result);
    result
}

fn cache_classification(root: &Root, id: ObjectId, result: bool) {
    if let Some(data) = root.objects.borrow_mut().get_mut(id) {
        data.reactivity_cache = Some(result);
    }
}

/// Outcome of resolving a record key without running user code.
enum Resolved {
    Data(Value),
    Accessor(Rc<dyn Fn() -> Value>),
    Missing,
}

impl Obj {
    pub(crate) fn from_raw(root: &'static Root, id: ObjectId) -> Obj {
        Obj {
            id,
            root,
            view: false,
        }
    }

    /// The stable identity of the underlying object.
    pub fn id(self) -> ObjectId {
        self.id
    }

    /// Whether this handle is the reactive view flavor.
    pub fn is_view(self) -> bool {
        self.view
    }

    /// The raw flavor of this handle.
    pub fn as_raw(self) -> Obj {
        Obj { view: false, ..self }
    }

    /// The composite kind of the underlying object.
    pub fn kind(self) -> ObjectKind {
        self.root
            .objects
            .borrow()
            .get(self.id)
            .map(|d| d.kind())
            .unwrap_or(ObjectKind::Record)
    }

    /// Whether the key is excluded from tracking on this object, via the
    /// symbolic-key rule or the per-object/prototype unreactive sets.
    fn is_unreactive_key(self, key: &Key) -> bool {
        if key.is_symbolic() {
            return true;
        }
        let store = self.root.objects.borrow();
        let mut cur = Some(self.id);
        let mut hops = 0usize;
        while let Some(id) = cur {
            let Some(data) = store.get(id) else { break };
            if data.unreactive_keys.contains(key) {
                return true;
            }
            cur = data.proto();
            hops += 1;
            if hops > 64 {
                break;
            }
        }
        false
    }

    /// Reads a key. On a view this registers the dependency and returns
    /// composite children as views; on a raw handle it is fully transparent.
    ///
    /// Records resolve through their prototype chain; lists accept indices
    /// and the `length` pseudo-property; maps accept [`Key::Entry`] keys.
    /// Missing keys read as [`Value::Unit`].
    pub fn get(self, key: impl Into<Key>) -> Value {
        let key = key.into();
        self.get_key(&key)
    }

    /// Non-generic form of [`get`](Obj::get).
    pub fn get_key(self, key: &Key) -> Value {
        let (resolved, inherited) = self.resolve(key);
        let track = self.view
            && !self.is_unreactive_key(key)
            && !is_non_reactive_id(self.root, self.id)
            && {
                let options = self.root.options.borrow();
                !(inherited && options.instance_members)
                    && !(matches!(resolved, Resolved::Accessor(_)) && options.ignore_accessors)
            };
        if track {
            self.root.depend(self.id, key.clone());
        }
        let value = match resolved {
            Resolved::Data(v) => v,
            // User code: runs after every engine borrow has been released.
            // Reads inside the accessor body track normally.
            Resolved::Accessor(get) => get(),
            Resolved::Missing => Value::Unit,
        };
        self.wrap_child(key, value)
    }

    /// Locates the slot for `key` without executing user code.
    fn resolve(self, key: &Key) -> (Resolved, bool) {
        let store = self.root.objects.borrow();
        let Some(data) = store.get(self.id) else {
            return (Resolved::Missing, false);
        };
        match (&data.storage, key) {
            (Storage::Record { .. }, Key::Prop(name)) => {
                let mut cur = self.id;
                let mut inherited = false;
                let mut hops = 0usize;
                loop {
                    let Some(data) = store.get(cur) else { break };
                    let Storage::Record { fields, proto } = &data.storage else {
                        break;
                    };
                    if let Some(slot) = fields.get(name) {
                        let resolved = match slot {
                            Slot::Data(v) => Resolved::Data(v.clone()),
                            Slot::Accessor { get, .. } => Resolved::Accessor(Rc::clone(get)),
                        };
                        return (resolved, inherited);
                    }
                    match proto {
                        Some(p) => {
                            cur = *p;
                            inherited = true;
                        }
                        None => break,
                    }
                    hops += 1;
                    if hops > 64 {
                        break;
                    }
                }
                (Resolved::Missing, false)
            }
            (Storage::List(items), Key::Index(i)) => match items.get(*i) {
                Some(v) => (Resolved::Data(v.clone()), false),
                None => (Resolved::Missing, false),
            },
            (Storage::List(items), Key::Prop(name)) if &**name == "length" => {
                (Resolved::Data(Value::Int(items.len() as i64)), false)
            }
            (Storage::Map(entries), Key::Entry(k)) => match entries.get(k) {
                Some(v) => (Resolved::Data(v.clone()), false),
                None => (Resolved::Missing, false),
            },
            _ => (Resolved::Missing, false),
        }
    }

    /// View reads hand composite children back as views, and record the
    /// parent back-reference while this object is deep-watched.
    fn wrap_child(self, key: &Key, value: Value) -> Value {
        if !self.view {
            return value;
        }
        let Some(child) = value.as_obj() else {
            return value;
        };
        if is_non_reactive_id(self.root, child.id) {
            return value;
        }
        let deep_watched = {
            let store = self.root.objects.borrow();
            store
                .get(self.id)
                .is_some_and(|data| data.has_deep_watchers)
        };
        if deep_watched {
            let mut store = self.root.objects.borrow_mut();
            if let Some(child_data) = store.get_mut(child.id) {
                child_data.add_back_ref(self.id, key.clone());
            }
        }
        Value::Obj(Obj { view: true, ..child })
    }

    /// Writes a key. Raw handles, unreactive keys, and non-reactive objects
    /// write silently; views notify the affected effects.
    ///
    /// Assigning a previously absent record key emits an add; writing past a
    /// list's end emits an add followed by a `length` touch; writing a list's
    /// `length` pseudo-key truncates or extends (and is a no-op when equal).
    ///
    /// # Panics
    /// Panics when called on a set; members are added and removed, not
    /// assigned.
    pub fn set(self, key: impl Into<Key>, value: Value) -> Result<()> {
        let key = key.into();
        if !self.view
            || self.is_unreactive_key(&key)
            || is_non_reactive_id(self.root, self.id)
        {
            self.write_silent(&key, value);
            return Ok(());
        }
        self.guard_computed()?;
        match self.kind() {
            ObjectKind::Record => self.record_set(key, value),
            ObjectKind::List => self.list_set(key, value),
            ObjectKind::Map => match key {
                Key::Entry(k) => self.insert(k, value),
                _ => Ok(()),
            },
            ObjectKind::Set => panic!("cannot assign into a set; use add/remove_entry"),
        }
    }

    /// Refuses writes issued while a computed-only effect is running.
    fn guard_computed(self) -> Result<()> {
        let running = self.root.current_running.get();
        let effects = self.root.effects.borrow();
        match effects.get(running) {
            Some(node) if node.computed => Err(Error::WriteInComputed),
            _ => Ok(()),
        }
    }

    fn record_set(self, key: Key, value: Value) -> Result<()> {
        let Key::Prop(name) = &key else {
            return Ok(());
        };
        enum OwnSlot {
            Data(Value),
            Accessor(Option<Rc<dyn Fn(Value)>>, Rc<dyn Fn() -> Value>),
            Missing,
        }
        let own = {
            let store = self.root.objects.borrow();
            let Some(data) = store.get(self.id) else {
                return Ok(());
            };
            let Storage::Record { fields, .. } = &data.storage else {
                return Ok(());
            };
            match fields.get(name) {
                Some(Slot::Data(v)) => OwnSlot::Data(v.clone()),
                Some(Slot::Accessor { get, set }) => {
                    OwnSlot::Accessor(set.clone(), Rc::clone(get))
                }
                None => OwnSlot::Missing,
            }
        };
        match own {
            OwnSlot::Accessor(None, _) => {
                self.root.warn("write to a getter-only property ignored");
                Ok(())
            }
            // The old value is read in an untracked sub-context so a
            // getter-backed property cannot register a stray dependency.
            OwnSlot::Accessor(Some(setter), getter) => {
                let old = crate::root::untrack(|| getter());
                crate::root::untrack(|| setter(value));
                let new = crate::root::untrack(|| getter());
                if old == new {
                    return Ok(());
                }
                crate::notify::notify_property_change(self.root, self.id, key, &old, &new, true)
            }
            own => {
                let (had_key, old) = match own {
                    OwnSlot::Data(old) => (true, old),
                    // An absent own key may still shadow an inherited value;
                    // that value is what observers saw before this write.
                    _ => (
                        false,
                        crate::root::untrack(|| self.as_raw().get_key(&key)),
                    ),
                };
                if had_key && old == value {
                    return Ok(());
                }
                self.maintain_back_refs(&key, &old, &value);
                {
                    let mut store = self.root.objects.borrow_mut();
                    let Storage::Record { fields, .. } = &mut store[self.id].storage else {
                        return Ok(());
                    };
                    fields.insert(Rc::clone(name), Slot::Data(value.clone()));
                }
                crate::notify::notify_property_change(
                    self.root, self.id, key, &old, &value, had_key,
                )
            }
        }
    }

    fn list_set(self, key: Key, value: Value) -> Result<()> {
        match &key {
            Key::Index(i) => {
                let i = *i;
                let (len, old) = {
                    let store = self.root.objects.borrow();
                    let Storage::List(items) = &store[self.id].storage else {
                        return Ok(());
                    };
                    (items.len(), items.get(i).cloned())
                };
                if i < len {
                    let old = old.unwrap_or_default();
                    if old == value {
                        return Ok(());
                    }
                    self.maintain_back_refs(&key, &old, &value);
                    {
                        let mut store = self.root.objects.borrow_mut();
                        let Storage::List(items) = &mut store[self.id].storage else {
                            return Ok(());
                        };
                        items[i] = value.clone();
                    }
                    crate::notify::notify_property_change(
                        self.root, self.id, key, &old, &value, true,
                    )
                } else {
                    self.maintain_back_refs(&key, &Value::Unit, &value);
                    {
                        let mut store = self.root.objects.borrow_mut();
                        let Storage::List(items) = &mut store[self.id].storage else {
                            return Ok(());
                        };
                        items.resize(i, Value::Unit);
                        items.push(value.clone());
                    }
                    crate::batch::grouped(self.root, || {
                        let _ = crate::notify::touched(self.root, self.id, Evolution::Add(key), None);
                        let _ = crate::notify::touched(
                            self.root,
                            self.id,
                            Evolution::Set(Key::length()),
                            None,
                        );
                    })
                }
            }
            Key::Prop(name) if &**name == "length" => {
                let new_len = match value.as_int() {
                    Some(n) if n >= 0 => n as usize,
                    _ => return Ok(()),
                };
                let old_len = {
                    let store = self.root.objects.borrow();
                    let Storage::List(items) = &store[self.id].storage else {
                        return Ok(());
                    };
                    items.len()
                };
                // Redundant length writes short-circuit.
                if new_len == old_len {
                    return Ok(());
                }
                let removed: Vec<(usize, Value)> = if new_len < old_len {
                    let mut store = self.root.objects.borrow_mut();
                    let Storage::List(items) = &mut store[self.id].storage else {
                        return Ok(());
                    };
                    items.drain(new_len..).enumerate().map(|(off, v)| (new_len + off, v)).collect()
                } else {
                    let mut store = self.root.objects.borrow_mut();
                    let Storage::List(items) = &mut store[self.id].storage else {
                        return Ok(());
                    };
                    items.resize(new_len, Value::Unit);
                    Vec::new()
                };
                for (i, old) in &removed {
                    self.maintain_back_refs(&Key::Index(*i), old, &Value::Unit);
                }
                crate::batch::grouped(self.root, || {
                    for (i, _) in &removed {
                        let _ = crate::notify::touched(
                            self.root,
                            self.id,
                            Evolution::Del(Key::Index(*i)),
                            None,
                        );
                    }
                    let _ =
                        crate::notify::touched(self.root, self.id, Evolution::Set(Key::length()), None);
                })
            }
            _ => Ok(()),
        }
    }

    /// Removes `key`. Returns whether it existed. Views emit the deletion;
    /// raw handles remove silently.
    pub fn delete(self, key: impl Into<Key>) -> Result<bool> {
        let key = key.into();
        let notify = self.view
            && !self.is_unreactive_key(&key)
            && !is_non_reactive_id(self.root, self.id);
        if notify {
            self.guard_computed()?;
        }
        let old = {
            let mut store = self.root.objects.borrow_mut();
            let Some(data) = store.get_mut(self.id) else {
                return Ok(false);
            };
            match (&mut data.storage, &key) {
                (Storage::Record { fields, .. }, Key::Prop(name)) => match fields.shift_remove(name)
                {
                    Some(Slot::Data(v)) => Some(v),
                    Some(Slot::Accessor { .. }) => Some(Value::Unit),
                    None => None,
                },
                (Storage::List(items), Key::Index(i)) => {
                    // Deleting a list slot leaves a hole, like the source
                    // semantics; it does not shift the tail.
                    match items.get_mut(*i) {
                        Some(slot) if !matches!(slot, Value::Unit) => {
                            Some(std::mem::replace(slot, Value::Unit))
                        }
                        _ => None,
                    }
                }
                (Storage::Map(entries), Key::Entry(k)) => entries.shift_remove(k),
                (Storage::Set(members), Key::Entry(k)) => members
                    .shift_remove(k)
                    .then_some(Value::Unit),
                _ => None,
            }
        };
        let Some(old) = old else {
            return Ok(false);
        };
        self.maintain_back_refs(&key, &old, &Value::Unit);
        if notify {
            crate::batch::grouped(self.root, || {
                let _ = crate::notify::touched(self.root, self.id, Evolution::Del(key), None);
            })?;
        }
        Ok(true)
    }

    /// Whether `key` exists, registering a dependency on the key set.
    ///
    /// Records walk their prototype chain; a cyclic chain re-entering the
    /// same check fails with [`Error::CycleDetected`].
    pub fn has(self, key: impl Into<Key>) -> Result<bool> {
        let key = key.into();
        if self.view && !self.is_unreactive_key(&key) && !is_non_reactive_id(self.root, self.id) {
            self.root.depend(self.id, Key::Keys);
        }
        has_inner(self.root, self.id, &key)
    }

    /// Snapshot of the record's own keys, registering a key-set dependency.
    pub fn keys(self) -> Vec<Rc<str>> {
        if self.view && !is_non_reactive_id(self.root, self.id) {
            self.root.depend(self.id, Key::Keys);
        }
        let store = self.root.objects.borrow();
        match store.get(self.id).map(|d| &d.storage) {
            Some(Storage::Record { fields, .. }) => fields.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// The number of elements, entries, members, or own fields. Lists
    /// register a `length` dependency, everything else a key-set dependency.
    pub fn len(self) -> usize {
        if self.view && !is_non_reactive_id(self.root, self.id) {
            match self.kind() {
                ObjectKind::List => self.root.depend(self.id, Key::length()),
                _ => self.root.depend(self.id, Key::Keys),
            }
        }
        let store = self.root.objects.borrow();
        match store.get(self.id).map(|d| &d.storage) {
            Some(Storage::Record { fields, .. }) => fields.len(),
            Some(Storage::List(items)) => items.len(),
            Some(Storage::Map(entries)) => entries.len(),
            Some(Storage::Set(members)) => members.len(),
            None => 0,
        }
    }

    /// Whether the object is empty.
    pub fn is_empty(self) -> bool {
        self.len() == 0
    }

    /// Snapshot of `(key, value)` pairs, registering a whole-object
    /// dependency. Accessor fields are skipped (their getters are not run).
    pub fn entries(self) -> Vec<(Key, Value)> {
        if self.view && !is_non_reactive_id(self.root, self.id) {
            self.root.depend(self.id, Key::All);
        }
        let snapshot: Vec<(Key, Value)> = {
            let store = self.root.objects.borrow();
            match store.get(self.id).map(|d| &d.storage) {
                Some(Storage::Record { fields, .. }) => fields
                    .iter()
                    .filter_map(|(name, slot)| match slot {
                        Slot::Data(v) => Some((Key::Prop(Rc::clone(name)), v.clone())),
                        Slot::Accessor { .. } => None,
                    })
                    .collect(),
                Some(Storage::List(items)) => items
                    .iter()
                    .enumerate()
                    .map(|(i, v)| (Key::Index(i), v.clone()))
                    .collect(),
                Some(Storage::Map(entries)) => entries
                    .iter()
                    .map(|(k, v)| (Key::Entry(k.clone()), v.clone()))
                    .collect(),
                Some(Storage::Set(members)) => members
                    .iter()
                    .map(|k| (Key::Entry(k.clone()), mapkey_value(self.root, k)))
                    .collect(),
                None => Vec::new(),
            }
        };
        snapshot
            .into_iter()
            .map(|(key, value)| {
                let wrapped = self.wrap_child(&key, value);
                (key, wrapped)
            })
            .collect()
    }

    /// Snapshot of the values, registering a whole-object dependency.
    pub fn values(self) -> Vec<Value> {
        self.entries().into_iter().map(|(_, v)| v).collect()
    }

    /// Silent write: updates the raw slot without tracking, notification, or
    /// back-reference maintenance, regardless of handle flavor.
    pub fn set_silent(self, key: impl Into<Key>, value: Value) {
        self.write_silent(&key.into(), value);
    }

    fn write_silent(self, key: &Key, value: Value) {
        let mut store = self.root.objects.borrow_mut();
        let Some(data) = store.get_mut(self.id) else {
            return;
        };
        match (&mut data.storage, key) {
            (Storage::Record { fields, .. }, Key::Prop(name)) => {
                fields.insert(Rc::clone(name), Slot::Data(value));
            }
            (Storage::List(items), Key::Index(i)) => {
                if *i >= items.len() {
                    items.resize(*i + 1, Value::Unit);
                }
                items[*i] = value;
            }
            (Storage::Map(entries), Key::Entry(k)) => {
                entries.insert(k.clone(), value);
            }
            _ => {}
        }
    }

    /// Silently appends to a list.
    pub fn push_silent(self, value: Value) {
        let mut store = self.root.objects.borrow_mut();
        if let Some(data) = store.get_mut(self.id) {
            if let Storage::List(items) = &mut data.storage {
                items.push(value);
            }
        }
    }

    /// Defines an accessor-backed record field. Definition itself does not
    /// notify. The getter body is free to perform reactive reads; whether the
    /// *outer* read of this field tracks is governed by the
    /// `ignore_accessors` option.
    pub fn define_accessor(
        self,
        name: &str,
        get: impl Fn() -> Value + 'static,
        set: Option<Box<dyn Fn(Value)>>,
    ) {
        let mut store = self.root.objects.borrow_mut();
        if let Some(data) = store.get_mut(self.id) {
            if let Storage::Record { fields, .. } = &mut data.storage {
                fields.insert(
                    Rc::from(name),
                    Slot::Accessor {
                        get: Rc::new(get),
                        set: set.map(|f| Rc::from(f) as Rc<dyn Fn(Value)>),
                    },
                );
            }
        }
    }

    // --- list operations ---

    /// Appends to a list, notifying the new index and the length.
    pub fn push(self, value: Value) -> Result<()> {
        if !self.view || is_non_reactive_id(self.root, self.id) {
            self.push_silent(value);
            return Ok(());
        }
        let len = {
            let store = self.root.objects.borrow();
            match store.get(self.id).map(|d| &d.storage) {
                Some(Storage::List(items)) => items.len(),
                _ => return Ok(()),
            }
        };
        self.set(Key::Index(len), value)
    }

    /// Removes and returns the last element, notifying the removed index and
    /// the length.
    pub fn pop(self) -> Result<Option<Value>> {
        self.guard_computed()?;
        let popped = {
            let mut store = self.root.objects.borrow_mut();
            match store.get_mut(self.id).map(|d| &mut d.storage) {
                Some(Storage::List(items)) => items.pop().map(|v| (items.len(), v)),
                _ => None,
            }
        };
        let Some((index, value)) = popped else {
            return Ok(None);
        };
        self.maintain_back_refs(&Key::Index(index), &value, &Value::Unit);
        if self.view && !is_non_reactive_id(self.root, self.id) {
            crate::batch::grouped(self.root, || {
                let _ =
                    crate::notify::touched(self.root, self.id, Evolution::Del(Key::Index(index)), None);
                let _ = crate::notify::touched(self.root, self.id, Evolution::Set(Key::length()), None);
            })?;
        }
        Ok(Some(self.wrap_child(&Key::Index(index), value)))
    }

    /// Reverses a list in place, notifying with a single bulk evolution.
    pub fn reverse(self) -> Result<()> {
        self.bulk("reverse", |items| items.reverse())
    }

    /// Sorts a list in place with the given comparator, notifying with a
    /// single bulk evolution.
    pub fn sort_by(
        self,
        mut cmp: impl FnMut(&Value, &Value) -> std::cmp::Ordering,
    ) -> Result<()> {
        self.bulk("sort", move |items| items.sort_by(&mut cmp))
    }

    fn bulk(self, method: &'static str, f: impl FnOnce(&mut Vec<Value>)) -> Result<()> {
        self.guard_computed()?;
        {
            let mut store = self.root.objects.borrow_mut();
            match store.get_mut(self.id).map(|d| &mut d.storage) {
                Some(Storage::List(items)) => f(items),
                _ => return Ok(()),
            }
        }
        if self.view && !is_non_reactive_id(self.root, self.id) {
            crate::batch::grouped(self.root, || {
                let _ = crate::notify::touched(self.root, self.id, Evolution::Bunch(method), None);
            })?;
        }
        Ok(())
    }

    // --- map and set operations ---

    /// Reads a map entry, registering a dependency on that entry.
    pub fn entry(self, key: &MapKey) -> Value {
        self.get_key(&Key::Entry(key.clone()))
    }

    /// Inserts a map entry, notifying an add or a set.
    pub fn insert(self, key: MapKey, value: Value) -> Result<()> {
        if !self.view || is_non_reactive_id(self.root, self.id) {
            self.write_silent(&Key::Entry(key), value);
            return Ok(());
        }
        self.guard_computed()?;
        let wire = Key::Entry(key.clone());
        let old = {
            let mut store = self.root.objects.borrow_mut();
            match store.get_mut(self.id).map(|d| &mut d.storage) {
                Some(Storage::Map(entries)) => entries.insert(key, value.clone()),
                _ => return Ok(()),
            }
        };
        let had_key = old.is_some();
        let old = old.unwrap_or_default();
        if had_key && old == value {
            return Ok(());
        }
        self.maintain_back_refs(&wire, &old, &value);
        crate::notify::notify_property_change(self.root, self.id, wire, &old, &value, had_key)
    }

    /// Adds a set member. Returns whether it was newly added.
    pub fn add(self, member: MapKey) -> Result<bool> {
        self.guard_computed()?;
        let added = {
            let mut store = self.root.objects.borrow_mut();
            match store.get_mut(self.id).map(|d| &mut d.storage) {
                Some(Storage::Set(members)) => members.insert(member.clone()),
                _ => false,
            }
        };
        if added && self.view && !is_non_reactive_id(self.root, self.id) {
            crate::batch::grouped(self.root, || {
                let _ =
                    crate::notify::touched(self.root, self.id, Evolution::Add(Key::Entry(member)), None);
            })?;
        }
        Ok(added)
    }

    /// Removes a map entry or set member. Returns whether it existed.
    pub fn remove_entry(self, key: &MapKey) -> Result<bool> {
        self.delete(Key::Entry(key.clone()))
    }

    /// Notifies the watchers of `key` that its cached interpretation must be
    /// discarded, without a corresponding raw mutation. Container types
    /// layered on the engine use this for state the engine cannot see.
    pub fn invalidate(self, key: impl Into<Key>) -> Result<()> {
        let key = key.into();
        if !self.view || self.is_unreactive_key(&key) || is_non_reactive_id(self.root, self.id) {
            return Ok(());
        }
        crate::batch::grouped(self.root, || {
            let _ = crate::notify::touched(self.root, self.id, Evolution::Invalidate(key), None);
        })
    }

    /// Whether a map entry or set member exists, registering a key-set
    /// dependency.
    pub fn contains(self, key: &MapKey) -> bool {
        if self.view && !is_non_reactive_id(self.root, self.id) {
            self.root.depend(self.id, Key::Keys);
        }
        let store = self.root.objects.borrow();
        match store.get(self.id).map(|d| &d.storage) {
            Some(Storage::Map(entries)) => entries.contains_key(key),
            Some(Storage::Set(members)) => members.contains(key),
            _ => false,
        }
    }

    /// Keeps child back-references in sync across a write, while this object
    /// is deep-watched.
    fn maintain_back_refs(self, key: &Key, old: &Value, new: &Value) {
        let deep_watched = {
            let store = self.root.objects.borrow();
            store
                .get(self.id)
                .is_some_and(|data| data.has_deep_watchers)
        };
        if !deep_watched {
            return;
        }
        let mut store = self.root.objects.borrow_mut();
        if let Some(old_child) = old.as_obj() {
            if let Some(data) = store.get_mut(old_child.id) {
                data.remove_back_ref(self.id, key);
            }
        }
        if let Some(new_child) = new.as_obj() {
            if let Some(data) = store.get_mut(new_child.id) {
                data.add_back_ref(self.id, key.clone());
            }
        }
    }
}

/// Turns a set member back into a value.
pub(crate) fn mapkey_value(root: &'static Root, key: &MapKey) -> Value {
    match key {
        MapKey::Unit => Value::Unit,
        MapKey::Bool(b) => Value::Bool(*b),
        MapKey::Int(n) => Value::Int(*n),
        MapKey::Str(s) => Value::Str(Rc::clone(s)),
        MapKey::Obj(id) => Value::Obj(Obj::from_raw(root, *id)),
    }
}

/// Existence check shared by `has` and prototype-chain recursion, protected
/// against re-entry on the same `(object, key)`.
fn has_inner(root: &'static Root, id: ObjectId, key: &Key) -> Result<bool> {
    {
        let mut guard = root.has_guard.borrow_mut();
        if guard.contains(&(id, key.clone())) {
            return Err(Error::CycleDetected {
                cycle: vec![format!("has {key} on {id:?}")],
            });
        }
        guard.push((id, key.clone()));
    }
    struct HasGuard<'a>(&'a Root);
    impl Drop for HasGuard<'_> {
        fn drop(&mut self) {
            self.0.has_guard.borrow_mut().pop();
        }
    }
    let _guard = HasGuard(root);

    let (found, proto) = {
        let store = root.objects.borrow();
        let Some(data) = store.get(id) else {
            return Ok(false);
        };
        match (&data.storage, key) {
            (Storage::Record { fields, proto }, Key::Prop(name)) => {
                (fields.contains_key(name), *proto)
            }
            (Storage::List(items), Key::Index(i)) => (*i < items.len(), None),
            (Storage::List(_), Key::Prop(name)) if &**name == "length" => (true, None),
            (Storage::Map(entries), Key::Entry(k)) => (entries.contains_key(k), None),
            (Storage::Set(members), Key::Entry(k)) => (members.contains(k), None),
            _ => (false, None),
        }
    };
    if found {
        return Ok(true);
    }
    match proto {
        Some(p) => has_inner(root, p, key),
        None => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use crate::*;

    #[test]
    fn reactive_is_idempotent_and_unwrap_inverts() {
        let _ = create_root(|| {
            let raw = record! { a: 1 };
            let view = reactive(raw.into());
            assert!(is_reactive(&view));
            assert_eq!(reactive(view.clone()), view);
            let back = unwrap(view.clone());
            assert!(!is_reactive(&back));
            assert_eq!(back.as_obj().unwrap().id(), raw.id());
            // Primitives pass through untouched.
            assert_eq!(reactive(5.into()), Value::Int(5));
        });
    }

    #[test]
    fn non_reactive_marks_are_transparent() {
        let _ = create_root(|| {
            let raw = record! { a: 1 };
            non_reactive([raw]);
            let still_raw = reactive_obj(raw);
            assert!(!still_raw.is_view());

            // Writes through it never trigger effects.
            let runs = Rc::new(Cell::new(0));
            let seen = runs.clone();
            effect(move |_| {
                seen.set(seen.get() + 1);
                let _ = still_raw.get("a");
            });
            still_raw.set("a", 2.into()).unwrap();
            assert_eq!(runs.get(), 1);
        });
    }

    #[test]
    fn non_reactive_proto_classifies_instances() {
        let _ = create_root(|| {
            let proto = record! { kind: "widget" };
            non_reactive_proto([proto]);
            let instance = create_record_with_proto(proto);
            assert!(!reactive_obj(instance).is_view());
            let plain = record! {};
            assert!(reactive_obj(plain).is_view());
        });
    }

    #[test]
    fn non_reactive_predicate_applies() {
        let _ = create_root(|| {
            let flagged = record! { frozen: true };
            let normal = record! {};
            non_reactive_when(|o| {
                crate::untrack(|| o.get("frozen")).is_truthy()
            });
            assert!(!reactive_obj(flagged).is_view());
            assert!(reactive_obj(normal).is_view());
        });
    }

    #[test]
    fn children_come_back_wrapped_through_views_only() {
        let _ = create_root(|| {
            let inner = record! { x: 1 };
            let outer = record! { inner: inner };
            let view = reactive_obj(outer);
            let through_view = view.get("inner");
            assert!(is_reactive(&through_view));
            let through_raw = outer.get("inner");
            assert!(!is_reactive(&through_raw));
        });
    }

    #[test]
    fn raw_writes_are_silent() {
        let _ = create_root(|| {
            let state = record! { a: 0 };
            let view = reactive_obj(state);
            let runs = Rc::new(Cell::new(0));
            let seen = runs.clone();
            effect(move |_| {
                seen.set(seen.get() + 1);
                let _ = view.get("a");
            });
            state.set("a", 1.into()).unwrap(); // raw handle: silent
            assert_eq!(runs.get(), 1);
            view.set("a", 2.into()).unwrap();
            assert_eq!(runs.get(), 2);
        });
    }

    #[test]
    fn equal_writes_do_not_notify() {
        let _ = create_root(|| {
            let state = reactive_obj(record! { a: 1 });
            let runs = Rc::new(Cell::new(0));
            let seen = runs.clone();
            effect(move |_| {
                seen.set(seen.get() + 1);
                let _ = state.get("a");
            });
            state.set("a", 1.into()).unwrap();
            assert_eq!(runs.get(), 1);
        });
    }

    #[test]
    fn absent_key_writes_notify_key_enumerators() {
        let _ = create_root(|| {
            let state = reactive_obj(record! { a: 1 });
            let key_reads = Rc::new(Cell::new(0));
            let seen = key_reads.clone();
            effect(move |_| {
                seen.set(seen.get() + 1);
                let _ = state.keys();
            });
            assert_eq!(key_reads.get(), 1);
            state.set("b", 2.into()).unwrap(); // Add: key set changed
            assert_eq!(key_reads.get(), 2);
            state.set("b", 3.into()).unwrap(); // Set: key set unchanged
            assert_eq!(key_reads.get(), 2);
            state.delete("b").unwrap(); // Del: key set changed
            assert_eq!(key_reads.get(), 3);
        });
    }

    #[test]
    fn list_writes_track_indices_and_length() {
        let _ = create_root(|| {
            let list = reactive_obj(list![1, 2, 3]);
            let len_reads = Rc::new(Cell::new(0));
            let seen = len_reads.clone();
            effect(move |_| {
                seen.set(seen.get() + 1);
                let _ = list.len();
            });
            assert_eq!(len_reads.get(), 1);
            list.push(4.into()).unwrap();
            assert_eq!(len_reads.get(), 2);
            list.set(1usize, 20.into()).unwrap(); // in-range: length untouched
            assert_eq!(len_reads.get(), 2);
            list.set(Key::length(), 4.into()).unwrap(); // redundant: short-circuits
            assert_eq!(len_reads.get(), 2);
            list.set(Key::length(), 2.into()).unwrap();
            assert_eq!(len_reads.get(), 3);
            assert_eq!(list.len(), 2);
        });
    }

    #[test]
    fn bulk_operations_notify_iterators_once() {
        let _ = create_root(|| {
            let list = reactive_obj(list![3, 1, 2]);
            let snapshots = Rc::new(Cell::new(0));
            let seen = snapshots.clone();
            effect(move |_| {
                seen.set(seen.get() + 1);
                let _ = list.values();
            });
            assert_eq!(snapshots.get(), 1);
            list.sort_by(|a, b| {
                a.as_int().unwrap_or(0).cmp(&b.as_int().unwrap_or(0))
            })
            .unwrap();
            assert_eq!(snapshots.get(), 2);
            assert_eq!(list.get(0usize), Value::Int(1));
            list.reverse().unwrap();
            assert_eq!(snapshots.get(), 3);
            assert_eq!(list.get(0usize), Value::Int(3));
        });
    }

    #[test]
    fn map_entries_track_individually() {
        let _ = create_root(|| {
            let map = reactive_obj(create_map());
            map.insert("a".into(), 1.into()).unwrap();
            let a_reads = Rc::new(Cell::new(0));
            let seen = a_reads.clone();
            effect(move |_| {
                seen.set(seen.get() + 1);
                let _ = map.entry(&"a".into());
            });
            assert_eq!(a_reads.get(), 1);
            map.insert("b".into(), 2.into()).unwrap(); // other entry
            assert_eq!(a_reads.get(), 1);
            map.insert("a".into(), 10.into()).unwrap();
            assert_eq!(a_reads.get(), 2);
            assert!(map.remove_entry(&"a".into()).unwrap());
            assert_eq!(a_reads.get(), 3);
        });
    }

    #[test]
    fn set_membership_tracks_the_key_set() {
        let _ = create_root(|| {
            let set = reactive_obj(create_set());
            let checks = Rc::new(Cell::new(0));
            let seen = checks.clone();
            effect(move |_| {
                seen.set(seen.get() + 1);
                let _ = set.contains(&"x".into());
            });
            assert_eq!(checks.get(), 1);
            assert!(set.add("x".into()).unwrap());
            assert_eq!(checks.get(), 2);
            assert!(!set.add("x".into()).unwrap()); // already present: silent
            assert_eq!(checks.get(), 2);
            assert!(set.remove_entry(&"x".into()).unwrap());
            assert_eq!(checks.get(), 3);
        });
    }

    #[test]
    fn accessor_outer_read_is_untracked_but_body_reads_track() {
        let _ = create_root(|| {
            let backing = reactive_obj(record! { celsius: 0 });
            let state = reactive_obj(record! {});
            state.define_accessor(
                "fahrenheit",
                move || {
                    let c = backing.get("celsius").as_int().unwrap_or(0);
                    Value::Int(c * 9 / 5 + 32)
                },
                Some(Box::new(move |v: Value| {
                    let f = v.as_int().unwrap_or(32);
                    backing.set_silent("celsius", Value::Int((f - 32) * 5 / 9));
                })),
            );
            let runs = Rc::new(Cell::new(0));
            let seen = runs.clone();
            effect(move |_| {
                seen.set(seen.get() + 1);
                let _ = state.get("fahrenheit");
            });
            assert_eq!(runs.get(), 1);
            // The accessor body read `celsius` reactively, so the effect
            // re-runs on it even though the outer key was not tracked.
            backing.set("celsius", 100.into()).unwrap();
            assert_eq!(runs.get(), 2);
            // Writing the outer key itself does not schedule the effect when
            // accessors are ignored for tracking.
            state.set("fahrenheit", 212.into()).unwrap();
            assert_eq!(runs.get(), 2);
        });
    }

    #[test]
    fn accessor_outer_read_tracks_when_option_disabled() {
        let _ = create_root(|| {
            configure(|options| options.ignore_accessors = false);
            let state = reactive_obj(record! {});
            let value = Rc::new(Cell::new(0));
            let stored = value.clone();
            state.define_accessor(
                "n",
                move || Value::Int(stored.get()),
                Some(Box::new({
                    let stored = value.clone();
                    move |v: Value| stored.set(v.as_int().unwrap_or(0))
                })),
            );
            let runs = Rc::new(Cell::new(0));
            let seen = runs.clone();
            effect(move |_| {
                seen.set(seen.get() + 1);
                let _ = state.get("n");
            });
            assert_eq!(runs.get(), 1);
            state.set("n", 42.into()).unwrap();
            assert_eq!(runs.get(), 2);
        });
    }

    #[test]
    fn inherited_members_skip_tracking_by_default() {
        let _ = create_root(|| {
            let proto = record! { greeting: "hi" };
            let instance = reactive_obj(create_record_with_proto(proto));
            let runs = Rc::new(Cell::new(0));
            let seen = runs.clone();
            effect(move |_| {
                seen.set(seen.get() + 1);
                let _ = instance.get("greeting");
            });
            assert_eq!(runs.get(), 1);
            // Shadowing the inherited member is an Add on the instance; the
            // effect never tracked the inherited read, so it stays quiet.
            instance.set_silent("greeting", "hello".into());
            assert_eq!(runs.get(), 1);
            assert_eq!(instance.get("greeting"), Value::str("hello"));
        });
    }

    #[test]
    fn unreactive_keys_read_and_write_transparently() {
        let _ = create_root(|| {
            let state = reactive_obj(record! { tracked: 0, scratch: 0 });
            mark_unreactive_keys(state, [Key::prop("scratch")]);
            let runs = Rc::new(Cell::new(0));
            let seen = runs.clone();
            effect(move |_| {
                seen.set(seen.get() + 1);
                let _ = state.get("tracked");
                let _ = state.get("scratch");
            });
            state.set("scratch", 99.into()).unwrap();
            assert_eq!(runs.get(), 1);
            state.set("tracked", 1.into()).unwrap();
            assert_eq!(runs.get(), 2);
        });
    }

    #[test]
    fn has_walks_the_prototype_chain_and_guards_cycles() {
        let _ = create_root(|| {
            let base = record! { shared: 1 };
            let derived = reactive_obj(create_record_with_proto(base));
            assert!(derived.has("shared").unwrap());
            assert!(!derived.has("missing").unwrap());

            let key_reads = Rc::new(Cell::new(0));
            let seen = key_reads.clone();
            effect(move |_| {
                seen.set(seen.get() + 1);
                let _ = derived.has("own");
            });
            derived.set("own", 1.into()).unwrap();
            assert_eq!(key_reads.get(), 2);
        });
    }

    #[test]
    fn invalidation_notifies_without_a_mutation() {
        let _ = create_root(|| {
            let state = reactive_obj(record! { cached: 1 });
            let runs = Rc::new(Cell::new(0));
            let seen = runs.clone();
            effect(move |_| {
                seen.set(seen.get() + 1);
                let _ = state.get("cached");
            });
            state.invalidate("cached").unwrap();
            assert_eq!(runs.get(), 2);
            assert_eq!(state.get("cached"), Value::Int(1)); // value untouched
        });
    }

    #[test]
    fn deleting_a_missing_key_reports_false() {
        let _ = create_root(|| {
            let state = reactive_obj(record! { a: 1 });
            assert!(!state.delete("zzz").unwrap());
            assert!(state.delete("a").unwrap());
            assert_eq!(state.get("a"), Value::Unit);
        });
    }
}
