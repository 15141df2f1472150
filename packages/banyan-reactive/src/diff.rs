//! Recursive diffing of replaced subtrees ("deep touch"), with origin-based
//! filtering of the resulting notifications.

use std::collections::HashSet;
use std::rc::Rc;

use indexmap::IndexMap;
use slotmap::Key as _;

use crate::error::Result;
use crate::object::{ObjectId, ObjectKind, Slot, Storage};
use crate::reactive::is_non_reactive_id;
use crate::root::Root;
use crate::value::{Evolution, Key, Value};

/// One notification produced by a diff, always addressed at the *old*
/// subtree: that is where the existing dependency edges live.
pub(crate) struct PendingTouch {
    pub obj: ObjectId,
    pub evolution: Evolution,
}

/// Whether replacing `old` by `new` qualifies for a recursive diff: both
/// reactive-eligible composites sharing a prototype token. The token is the
/// prototype object's identity; two lists always share one.
pub(crate) fn eligible(
    root: &'static Root,
    old: &Value,
    new: &Value,
) -> Option<(ObjectId, ObjectId)> {
    let (a, b) = (old.as_obj()?, new.as_obj()?);
    if a.id() == b.id() {
        return None;
    }
    if is_non_reactive_id(root, a.id()) || is_non_reactive_id(root, b.id()) {
        return None;
    }
    let store = root.objects.borrow();
    let (da, db) = (store.get(a.id())?, store.get(b.id())?);
    match (da.kind(), db.kind()) {
        (ObjectKind::List, ObjectKind::List) => Some((a.id(), b.id())),
        (ObjectKind::Record, ObjectKind::Record) if da.proto() == db.proto() => {
            Some((a.id(), b.id()))
        }
        _ => None,
    }
}

/// Produces the pending notifications for replacing `old_id` by `new_id`.
pub(crate) fn diff(root: &'static Root, old_id: ObjectId, new_id: ObjectId) -> Vec<PendingTouch> {
    let mut pending = Vec::new();
    let mut visited = HashSet::new();
    diff_into(root, old_id, new_id, &mut visited, &mut pending);
    pending
}

fn diff_into(
    root: &'static Root,
    old_id: ObjectId,
    new_id: ObjectId,
    visited: &mut HashSet<(ObjectId, ObjectId)>,
    pending: &mut Vec<PendingTouch>,
) {
    // Cyclic object graphs terminate here.
    if !visited.insert((old_id, new_id)) {
        return;
    }
    let kinds = {
        let store = root.objects.borrow();
        match (store.get(old_id), store.get(new_id)) {
            (Some(a), Some(b)) => (a.kind(), b.kind()),
            _ => return,
        }
    };
    match kinds {
        (ObjectKind::List, ObjectKind::List) => {
            let (old_items, new_items) = {
                let store = root.objects.borrow();
                let a = match &store[old_id].storage {
                    Storage::List(items) => items.clone(),
                    _ => return,
                };
                let b = match &store[new_id].storage {
                    Storage::List(items) => items.clone(),
                    _ => return,
                };
                (a, b)
            };
            let (no, nn) = (old_items.len(), new_items.len());
            for i in 0..no.max(nn) {
                if i < no && i >= nn {
                    pending.push(PendingTouch {
                        obj: old_id,
                        evolution: Evolution::Del(Key::Index(i)),
                    });
                } else if i < nn && i >= no {
                    pending.push(PendingTouch {
                        obj: old_id,
                        evolution: Evolution::Add(Key::Index(i)),
                    });
                } else if old_items[i] != new_items[i] {
                    match eligible(root, &old_items[i], &new_items[i]) {
                        Some((o, n)) => diff_into(root, o, n, visited, pending),
                        None => pending.push(PendingTouch {
                            obj: old_id,
                            evolution: Evolution::Set(Key::Index(i)),
                        }),
                    }
                }
            }
            if no != nn {
                pending.push(PendingTouch {
                    obj: old_id,
                    evolution: Evolution::Set(Key::length()),
                });
            }
        }
        (ObjectKind::Record, ObjectKind::Record) => {
            let old_fields = record_snapshot(root, old_id);
            let new_fields = record_snapshot(root, new_id);
            for key in old_fields.keys() {
                if !new_fields.contains_key(key) {
                    pending.push(PendingTouch {
                        obj: old_id,
                        evolution: Evolution::Del(Key::Prop(Rc::clone(key))),
                    });
                }
            }
            for (key, new_value) in &new_fields {
                match old_fields.get(key) {
                    None => pending.push(PendingTouch {
                        obj: old_id,
                        evolution: Evolution::Add(Key::Prop(Rc::clone(key))),
                    }),
                    Some(old_value) if old_value != new_value => {
                        match eligible(root, old_value, new_value) {
                            Some((o, n)) => diff_into(root, o, n, visited, pending),
                            None => pending.push(PendingTouch {
                                obj: old_id,
                                evolution: Evolution::Set(Key::Prop(Rc::clone(key))),
                            }),
                        }
                    }
                    Some(_) => {}
                }
            }
        }
        _ => {}
    }
}

/// The data fields of a record, together with those of its data prototypes:
/// the chain is walked up to, but not including, the first prototype that
/// owns a `constructor` key. Accessor slots are not materialized.
pub(crate) fn record_snapshot(root: &Root, id: ObjectId) -> IndexMap<Rc<str>, Value> {
    let store = root.objects.borrow();
    let mut out = IndexMap::new();
    let mut cur = Some(id);
    let mut hops = 0usize;
    while let Some(c) = cur {
        let Some(data) = store.get(c) else { break };
        let Storage::Record { fields, proto } = &data.storage else {
            break;
        };
        if c != id && fields.contains_key("constructor") {
            break;
        }
        for (key, slot) in fields {
            if let Slot::Data(value) = slot {
                out.entry(Rc::clone(key)).or_insert_with(|| value.clone());
            }
        }
        cur = *proto;
        hops += 1;
        if hops > 64 {
            break;
        }
    }
    out
}

/// Dispatches the pending notifications of a diff, filtered by the origin.
///
/// Only effects that depend on the origin property itself (or on the whole
/// origin object), or that have an ancestor in the effect tree which does,
/// are retained. When nothing depends on the origin, the entire dispatch is
/// skipped: readers of the parent reference alone must not re-run for a
/// replacement that did not change what they saw.
pub(crate) fn dispatch_notifications(
    root: &'static Root,
    pending: Vec<PendingTouch>,
    origin: (ObjectId, Key),
) -> Result<()> {
    let allowed: HashSet<_> = root
        .watchers_of(origin.0, &[Key::All, origin.1.clone()])
        .into_iter()
        .collect();
    if allowed.is_empty() {
        return Ok(());
    }

    let mut targets = Vec::new();
    for touch in &pending {
        crate::notify::announce(root, touch.obj, &touch.evolution);
        if let Some(key) = touch.evolution.key() {
            crate::batch::note_write(root, touch.obj, key);
        }
        let keys = crate::notify::inspect_keys(&touch.evolution, None);
        let mut found = Vec::new();
        root.collect(touch.obj, &touch.evolution, &keys, &mut found);
        for effect in found {
            if allowed_or_ancestor_allowed(root, &allowed, effect) && !targets.contains(&effect) {
                targets.push(effect);
            }
        }
    }
    crate::batch::enqueue(root, targets, false)
}

/// The origin permission propagates down the effect hierarchy: an effect is
/// retained when it, or any ancestor, depends on the origin.
fn allowed_or_ancestor_allowed(
    root: &Root,
    allowed: &HashSet<crate::effect::EffectId>,
    effect: crate::effect::EffectId,
) -> bool {
    let effects = root.effects.borrow();
    let mut cur = effect;
    loop {
        if allowed.contains(&cur) {
            return true;
        }
        match effects.get(cur) {
            Some(node) if !node.parent.is_null() => cur = node.parent,
            _ => return false,
        }
    }
}
