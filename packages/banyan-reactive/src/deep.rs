//! Deep watching: subtree traversal, parent back-references, and upward
//! bubbling of changes.

use std::collections::HashSet;

use crate::effect::{effect, EffectHandle, EffectId};
use crate::error::{Error, Result};
use crate::object::{ObjectId, ObjectKind};
use crate::reactive::{is_non_reactive_id, reactive_obj, Obj};
use crate::root::Root;
use crate::value::{Key, Value};

/// Options accepted by [`deep_watch`].
#[derive(Clone, Copy, Default)]
pub struct DeepWatchOptions {
    /// Also invoke the callback on the initial run, not only on reactions.
    pub immediate: bool,
}

/// Watches an entire subtree: `cb` fires on any change anywhere under
/// `target`, bubbled through parent back-references.
///
/// The watcher re-traverses the subtree on every reaction, so composites
/// attached after setup are picked up. Traversal refuses to cross
/// non-reactive objects, and descends at most `max_deep_watch_depth` levels.
///
/// Fails with [`Error::BadTarget`] when `target` is not a reactive-eligible
/// composite.
///
/// # Example
/// ```
/// # use banyan_reactive::*;
/// # use std::cell::Cell;
/// # use std::rc::Rc;
/// # let _ = create_root(|| {
/// let o = reactive_obj(record! { user: record! { profile: record! { age: 30 } } });
/// let hits = Rc::new(Cell::new(0));
/// let seen = hits.clone();
/// deep_watch(&o.into(), move |_| seen.set(seen.get() + 1), Default::default()).unwrap();
/// let profile = o
///     .get("user")
///     .as_obj()
///     .unwrap()
///     .get("profile")
///     .as_obj()
///     .unwrap();
/// profile.set("age", 31.into()).unwrap();
/// assert_eq!(hits.get(), 1);
/// # });
/// ```
pub fn deep_watch(
    target: &Value,
    mut cb: impl FnMut(Obj) + 'static,
    options: DeepWatchOptions,
) -> Result<EffectHandle> {
    let root = Root::global();
    let obj = target
        .as_obj()
        .filter(|o| !is_non_reactive_id(root, o.id()))
        .ok_or(Error::BadTarget)?;
    let view = reactive_obj(obj);
    let immediate = options.immediate;
    Ok(effect(move |scope| {
        let root = Root::global();
        traverse_and_mark(root, scope.id(), view.id());
        if scope.reaction() || immediate {
            cb(view);
        }
    }))
}

/// Walks the subtree under `start`, marking every visited object as
/// deep-watched by `effect` and reading every present key so the host effect
/// subscribes to it. Reads go through view handles, which also installs the
/// child-to-parent back-references.
///
/// Iteration rules: records contribute their own keys and the keys of data
/// prototypes (up to the first `constructor`-owning one); lists contribute
/// the length and every index; maps and sets contribute values only.
pub(crate) fn traverse_and_mark(root: &'static Root, effect: EffectId, start: ObjectId) {
    let max_depth = root.options.borrow().max_deep_watch_depth;
    let mut visited = HashSet::new();
    let mut stack = vec![(start, 0usize)];
    while let Some((id, depth)) = stack.pop() {
        if !visited.insert(id) {
            continue;
        }
        if is_non_reactive_id(root, id) {
            continue;
        }
        {
            let mut store = root.objects.borrow_mut();
            match store.get_mut(id) {
                Some(data) => data.add_deep_watcher(effect),
                None => continue,
            }
        }
        {
            let mut effects = root.effects.borrow_mut();
            if let Some(node) = effects.get_mut(effect) {
                if !node.deep_targets.contains(&id) {
                    node.deep_targets.push(id);
                }
            }
        }

        let view = reactive_obj(Obj::from_raw(root, id));
        let mut descend = |value: &Value, stack: &mut Vec<(ObjectId, usize)>| {
            if let Some(child) = value.as_obj() {
                if depth < max_depth {
                    stack.push((child.id(), depth + 1));
                }
            }
        };
        match view.kind() {
            ObjectKind::Record => {
                let _ = view.keys();
                let keys = crate::diff::record_snapshot(root, id);
                for key in keys.keys() {
                    let value = view.get(Key::Prop(std::rc::Rc::clone(key)));
                    descend(&value, &mut stack);
                }
            }
            ObjectKind::List => {
                let len = view.len();
                for i in 0..len {
                    let value = view.get(i);
                    descend(&value, &mut stack);
                }
            }
            ObjectKind::Map | ObjectKind::Set => {
                for (_, value) in view.entries() {
                    descend(&value, &mut stack);
                }
            }
        }
    }
}

/// Drops every deep-watch registration held by `effect`, clearing each
/// object's flag when its watcher set empties. Called before a re-traversal
/// and when the effect stops.
pub(crate) fn clear_deep_marks(root: &Root, effect: EffectId) {
    let targets = {
        let mut effects = root.effects.borrow_mut();
        match effects.get_mut(effect) {
            Some(node) => std::mem::take(&mut node.deep_targets),
            None => return,
        }
    };
    let mut store = root.objects.borrow_mut();
    for target in targets {
        if let Some(data) = store.get_mut(target) {
            data.remove_deep_watcher(effect);
        }
    }
}

/// Walks the parent back-references from `changed`, scheduling the deep
/// watchers of every ancestor. A per-walk visited set keeps cyclic parent
/// graphs terminating.
pub(crate) fn bubble_up(root: &'static Root, changed: ObjectId, out: &mut Vec<EffectId>) {
    let mut visited = HashSet::new();
    let mut stack = vec![changed];
    while let Some(cur) = stack.pop() {
        if !visited.insert(cur) {
            continue;
        }
        let (watchers, parents) = {
            let store = root.objects.borrow();
            match store.get(cur) {
                Some(data) => (
                    data.deep_watchers.to_vec(),
                    data.back_refs
                        .iter()
                        .map(|(parent, _)| *parent)
                        .collect::<Vec<_>>(),
                ),
                None => continue,
            }
        };
        for watcher in watchers {
            if !out.contains(&watcher) {
                out.push(watcher);
            }
        }
        stack.extend(parents);
    }
}
