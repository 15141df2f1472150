//! The change notifier: translating a single mutation into scheduled
//! effects.

use crate::error::Result;
use crate::object::ObjectId;
use crate::reactive::Obj;
use crate::root::Root;
use crate::value::{Evolution, Key, Value};

/// The key list inspected for an evolution: the whole-object key, the
/// affected key itself, and the key-set key when the change adds or removes
/// keys.
pub(crate) fn inspect_keys(evolution: &Evolution, affected: Option<&[Key]>) -> Vec<Key> {
    let mut keys = vec![Key::All];
    match affected {
        Some(list) => keys.extend(list.iter().cloned()),
        None => {
            if let Some(key) = evolution.key() {
                keys.push(key.clone());
            }
        }
    }
    if evolution.changes_keys() {
        keys.push(Key::Keys);
    }
    keys
}

/// Records a change on `obj`, collects the affected effects, bubbles through
/// the deep-watch graph, and submits everything to the scheduler.
pub(crate) fn touched(
    root: &'static Root,
    obj: ObjectId,
    evolution: Evolution,
    affected_keys: Option<&[Key]>,
) -> Result<()> {
    announce(root, obj, &evolution);
    if let Some(key) = evolution.key() {
        crate::batch::note_write(root, obj, key);
    }

    let keys = inspect_keys(&evolution, affected_keys);
    let mut targets = Vec::new();
    root.collect(obj, &evolution, &keys, &mut targets);

    let deep_watched = {
        let store = root.objects.borrow();
        store.get(obj).is_some_and(|data| data.has_deep_watchers)
    };
    if deep_watched {
        crate::deep::bubble_up(root, obj, &mut targets);
    }
    crate::batch::enqueue(root, targets, false)
}

/// Notifies only the effects marked *opaque*: those that must observe
/// object-identity changes even when a recursive diff suppresses the plain
/// notification.
pub(crate) fn touched_opaque(
    root: &'static Root,
    obj: ObjectId,
    evolution: Evolution,
    key: &Key,
) -> Result<()> {
    let mut found = Vec::new();
    root.collect(obj, &evolution, &[Key::All, key.clone()], &mut found);
    let targets = {
        let effects = root.effects.borrow();
        found
            .into_iter()
            .filter(|&id| effects.get(id).is_some_and(|node| node.opaque))
            .collect()
    };
    crate::batch::enqueue(root, targets, false)
}

/// The write path's notification dispatcher.
///
/// When recursive touching is on and the old and new values are composites
/// of the same prototype token, the replacement is translated into a
/// recursive diff filtered by the origin `(obj, key)`; identity-sensitive
/// (opaque) listeners are additionally notified of the replacement itself.
/// Otherwise this is a plain add/set touch.
pub(crate) fn notify_property_change(
    root: &'static Root,
    obj: ObjectId,
    key: Key,
    old: &Value,
    new: &Value,
    had_key: bool,
) -> Result<()> {
    let recursive = root.options.borrow().recursive_touching;
    if recursive {
        if let Some((old_id, new_id)) = crate::diff::eligible(root, old, new) {
            let pending = crate::diff::diff(root, old_id, new_id);
            return crate::batch::grouped(root, || {
                let _ = crate::diff::dispatch_notifications(root, pending, (obj, key.clone()));
                let _ = touched_opaque(root, obj, Evolution::Set(key.clone()), &key);
            });
        }
    }
    let evolution = if had_key {
        Evolution::Set(key)
    } else {
        Evolution::Add(key)
    };
    touched(root, obj, evolution, None)
}

/// Fires the `touched` hook and the introspection history for one change.
pub(crate) fn announce(root: &'static Root, obj: ObjectId, evolution: &Evolution) {
    root.record_touch(obj, evolution);
    let hooks = root.hook_set();
    if let Some(hook) = &hooks.touched {
        hook(Obj::from_raw(root, obj), evolution);
    }
}
