//! The batch scheduler: queueing, ordering, caps, and cycle policies.

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};

use slotmap::Key as _;

use crate::effect::{effect_label, EffectHandle, EffectId};
use crate::error::{Error, Result};
use crate::object::ObjectId;
use crate::root::{CycleHandling, MaxEffectReaction, Root};
use crate::value::Key;

/// One scheduler invocation: the pending queue and its bookkeeping.
pub(crate) struct BatchState {
    /// Pending effects, in submission order.
    pub queue: VecDeque<EffectId>,
    /// Effects currently sitting in `queue`, for deduplication.
    pub queued: HashSet<EffectId>,
    /// Effects currently being executed; re-entrant triggers of these are
    /// skipped.
    pub running: HashSet<EffectId>,
    /// How many times each effect has been submitted during this batch.
    pub trigger_counts: HashMap<EffectId, usize>,
    /// Total effect runs so far.
    pub steps: usize,
    /// `A -> B` whenever running `A` triggered `B`. Only maintained when the
    /// cycle policy is not [`CycleHandling::None`].
    pub edges: HashMap<EffectId, Vec<EffectId>>,
    /// Which effect wrote each `(object, key)` during this batch. Only
    /// maintained under [`CycleHandling::Strict`].
    pub writes: HashMap<(ObjectId, Key), EffectId>,
    /// Callbacks to run after the queue has drained.
    pub cleanups: Vec<Box<dyn FnOnce()>>,
    /// Nesting depth of `batch()` calls sharing this state.
    pub depth: usize,
}

impl BatchState {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            queued: HashSet::new(),
            running: HashSet::new(),
            trigger_counts: HashMap::new(),
            steps: 0,
            edges: HashMap::new(),
            writes: HashMap::new(),
            cleanups: Vec::new(),
            depth: 0,
        }
    }
}

/// Opens a batch if none is open. Returns whether this call opened it.
pub(crate) fn open_if_needed(root: &'static Root) -> bool {
    let mut batch = root.batch.borrow_mut();
    if batch.is_some() {
        return false;
    }
    *batch = Some(BatchState::new());
    drop(batch);
    let hooks = root.hook_set();
    if let Some(hook) = &hooks.begin_chain {
        hook();
    }
    true
}

/// Batch updates from related writes together and only run the affected
/// effects once the closure returns.
///
/// Nested calls share the outermost batch. Errors raised while draining the
/// queue (cycle detection, cap violations, broken effects) surface as the
/// `Err` of the outermost call.
///
/// # Example
/// ```
/// # use banyan_reactive::*;
/// # use std::cell::Cell;
/// # use std::rc::Rc;
/// # let _ = create_root(|| {
/// let state = reactive_obj(record! { a: 0, b: 0 });
/// let runs = Rc::new(Cell::new(0));
/// let seen = runs.clone();
/// effect(move |_| {
///     seen.set(seen.get() + 1);
///     let _ = (state.get("a"), state.get("b"));
/// });
/// batch(|| {
///     state.set("a", 1.into()).unwrap();
///     state.set("b", 2.into()).unwrap();
/// })
/// .unwrap();
/// assert_eq!(runs.get(), 2); // one initial run, one batched re-run
/// # });
/// ```
pub fn batch<T>(f: impl FnOnce() -> T) -> Result<T> {
    let root = Root::global();
    let opened = open_if_needed(root);
    if let Some(state) = root.batch.borrow_mut().as_mut() {
        state.depth += 1;
    }

    // Unwind guard: a panic inside `f` must not leave a half-open batch
    // behind.
    struct BatchGuard {
        root: &'static Root,
        armed: bool,
    }
    impl Drop for BatchGuard {
        fn drop(&mut self) {
            if self.armed {
                let _ = self.root.batch.take();
                let _ = self.root.take_error();
            }
        }
    }
    let mut guard = BatchGuard { root, armed: true };

    let ret = f();
    guard.armed = false;

    if let Some(state) = root.batch.borrow_mut().as_mut() {
        state.depth -= 1;
    }
    if opened {
        drain_and_close(root)?;
    }
    Ok(ret)
}

/// Submits a set of effects to the scheduler, the way a write does.
///
/// With `immediate`, each newly merged effect is additionally executed once
/// inline; re-entrant triggers of it are still deduplicated.
pub fn batch_effects(effects: &[EffectHandle], immediate: bool) -> Result<()> {
    let root = Root::global();
    enqueue(root, effects.iter().map(|h| h.id()).collect(), immediate)
}

/// Core submission path. Opens a batch when none is open, merges the targets,
/// and drains to exhaustion if this call opened the batch.
pub(crate) fn enqueue(root: &'static Root, targets: Vec<EffectId>, immediate: bool) -> Result<()> {
    let caller = root.current_running.get();
    let hooks = root.hook_set();
    if let Some(hook) = &hooks.chain {
        let handles: Vec<EffectHandle> = targets
            .iter()
            .map(|&id| EffectHandle::from_raw(id, root))
            .collect();
        let caller_handle = (!caller.is_null()).then(|| EffectHandle::from_raw(caller, root));
        hook(&handles, caller_handle);
    }

    let opened = open_if_needed(root);
    for target in targets {
        merge(root, target, caller, immediate);
        if root.pending_error.borrow().is_some() {
            break;
        }
    }
    if opened {
        drain_and_close(root)
    } else {
        Ok(())
    }
}

/// Merges one trigger into the open batch, honoring dedup, the per-effect
/// trigger cap, and the cycle policy.
fn merge(root: &'static Root, target: EffectId, caller: EffectId, immediate: bool) {
    {
        let effects = root.effects.borrow();
        match effects.get(target) {
            Some(node) if !node.stopped => {}
            _ => return,
        }
    }
    let (policy, max_triggers, reaction) = {
        let options = root.options.borrow();
        (
            options.cycle_handling,
            options.max_trigger_per_batch,
            options.max_effect_reaction,
        )
    };

    // Record the effect-to-effect edge and apply the cycle policy.
    if policy != CycleHandling::None && !caller.is_null() && caller != target {
        let cycle = {
            let mut batch = root.batch.borrow_mut();
            let state = batch.as_mut().expect("merge without open batch");
            let closes_cycle = path_exists(&state.edges, target, caller);
            let edge = state.edges.entry(caller).or_default();
            if !edge.contains(&target) {
                edge.push(target);
            }
            if closes_cycle {
                Some(cycle_labels(root, &state.edges, target, caller))
            } else {
                None
            }
        };
        if let Some(cycle) = cycle {
            match policy {
                CycleHandling::Throw | CycleHandling::Strict => {
                    root.fail(Error::CycleDetected { cycle });
                    return;
                }
                CycleHandling::Warn => root.warn("cyclic effect dependency detected"),
                CycleHandling::Break => return,
                CycleHandling::None => unreachable!(),
            }
        }
    }

    enum Merged {
        Queued,
        RunInline,
        OverCap,
        Skipped,
    }
    let merged = {
        let mut batch = root.batch.borrow_mut();
        let state = batch.as_mut().expect("merge without open batch");
        if state.running.contains(&target) {
            Merged::Skipped
        } else {
            let count = state.trigger_counts.entry(target).or_insert(0);
            *count += 1;
            if *count > max_triggers {
                Merged::OverCap
            } else if immediate {
                Merged::RunInline
            } else {
                if !state.queued.contains(&target) {
                    state.queue.push_back(target);
                    state.queued.insert(target);
                }
                Merged::Queued
            }
        }
    };

    match merged {
        Merged::Queued | Merged::Skipped => {}
        Merged::RunInline => run_one(root, target),
        Merged::OverCap => match reaction {
            MaxEffectReaction::Throw => {
                root.fail(Error::MaxReactionExceeded {
                    limit: max_triggers,
                });
            }
            MaxEffectReaction::Debug | MaxEffectReaction::Warn => {
                root.warn("effect exceeded its per-batch trigger cap; dropping re-trigger");
                debug_assert!(
                    reaction != MaxEffectReaction::Debug,
                    "effect exceeded its per-batch trigger cap"
                );
            }
        },
    }
}

/// Pops the next effect to run: FIFO under [`CycleHandling::None`], otherwise
/// the first queued effect with no incoming edge from another queued effect.
fn next(root: &'static Root) -> Option<EffectId> {
    let policy = root.options.borrow().cycle_handling;
    let mut batch = root.batch.borrow_mut();
    let state = batch.as_mut()?;
    if state.queue.is_empty() {
        return None;
    }
    let pos = if policy == CycleHandling::None {
        0
    } else {
        (0..state.queue.len())
            .find(|&i| {
                let candidate = state.queue[i];
                !state.queue.iter().enumerate().any(|(j, &other)| {
                    j != i
                        && state
                            .edges
                            .get(&other)
                            .is_some_and(|targets| targets.contains(&candidate))
                })
            })
            .unwrap_or(0)
    };
    let id = state.queue.remove(pos)?;
    state.queued.remove(&id);
    Some(id)
}

/// Runs the queue to exhaustion and closes the batch, executing post-batch
/// cleanups regardless of the outcome.
pub(crate) fn drain_and_close(root: &'static Root) -> Result<()> {
    let (max_chain, reaction) = {
        let options = root.options.borrow();
        (options.max_effect_chain, options.max_effect_reaction)
    };

    while let Some(id) = next(root) {
        {
            let effects = root.effects.borrow();
            match effects.get(id) {
                Some(node) if !node.stopped => {}
                _ => continue,
            }
        }
        let steps = {
            let mut batch = root.batch.borrow_mut();
            let state = batch.as_mut().expect("drain without open batch");
            state.steps += 1;
            state.steps
        };
        if steps > max_chain {
            match reaction {
                MaxEffectReaction::Throw => {
                    root.fail(Error::MaxDepthExceeded { limit: max_chain });
                }
                MaxEffectReaction::Debug | MaxEffectReaction::Warn => {
                    root.warn("effect chain cap exceeded; discarding the remaining queue");
                    debug_assert!(
                        reaction != MaxEffectReaction::Debug,
                        "effect chain cap exceeded"
                    );
                }
            }
            clear_queue(root);
            break;
        }

        run_one(root, id);

        if root.pending_error.borrow().is_some() {
            clear_queue(root);
            break;
        }
    }

    // Post-batch cleanups run even when the batch is unwinding with an error.
    let cleanups = {
        let mut batch = root.batch.borrow_mut();
        match batch.as_mut() {
            Some(state) => std::mem::take(&mut state.cleanups),
            None => Vec::new(),
        }
    };
    for cleanup in cleanups {
        crate::root::untrack(cleanup);
    }

    let _ = root.batch.take();
    let hooks = root.hook_set();
    if let Some(hook) = &hooks.end_chain {
        hook();
    }
    match root.take_error() {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

/// Executes one effect under the running set, converting a panic into
/// [`Error::BrokenEffects`].
fn run_one(root: &'static Root, id: EffectId) {
    {
        let mut batch = root.batch.borrow_mut();
        if let Some(state) = batch.as_mut() {
            state.running.insert(id);
        }
    }
    let outcome = catch_unwind(AssertUnwindSafe(|| crate::effect::run_effect(root, id)));
    {
        let mut batch = root.batch.borrow_mut();
        if let Some(state) = batch.as_mut() {
            state.running.remove(&id);
        }
    }
    if let Err(payload) = outcome {
        let message = payload
            .downcast_ref::<String>()
            .cloned()
            .or_else(|| payload.downcast_ref::<&str>().map(|s| s.to_string()))
            .unwrap_or_else(|| "effect panicked".to_string());
        root.fail(Error::BrokenEffects(message));
    }
}

fn clear_queue(root: &Root) {
    let mut batch = root.batch.borrow_mut();
    if let Some(state) = batch.as_mut() {
        state.queue.clear();
        state.queued.clear();
    }
}

/// Removes `effect` from the pending queue, if a batch is open. Used by
/// `stop` and by the bi-directional binding's circular-suppression rule.
pub(crate) fn dequeue(root: &Root, effect: EffectId) {
    let mut batch = root.batch.borrow_mut();
    if let Some(state) = batch.as_mut() {
        if state.queued.remove(&effect) {
            state.queue.retain(|&id| id != effect);
        }
    }
}

/// Groups the touches emitted by `f` into one batch, the way multi-key
/// operations (list splices, length writes) need.
pub(crate) fn grouped(root: &'static Root, f: impl FnOnce()) -> Result<()> {
    let opened = open_if_needed(root);
    f();
    if opened {
        drain_and_close(root)
    } else {
        Ok(())
    }
}

/// Registers a callback to run once the current batch has drained. Outside a
/// batch the callback runs immediately.
pub(crate) fn post_batch_cleanup(root: &Root, f: impl FnOnce() + 'static) {
    let mut batch = root.batch.borrow_mut();
    match batch.as_mut() {
        Some(state) => state.cleanups.push(Box::new(f)),
        None => {
            drop(batch);
            f();
        }
    }
}

/// Strict-policy hook called when `effect` registers a dependency on
/// `(obj, key)`: if another effect wrote that slot during this batch and the
/// new edge would close a cycle, the registration fails.
pub(crate) fn note_dependency(root: &'static Root, effect: EffectId, obj: ObjectId, key: &Key) {
    if root.options.borrow().cycle_handling != CycleHandling::Strict {
        return;
    }
    let cycle = {
        let mut batch = root.batch.borrow_mut();
        let Some(state) = batch.as_mut() else {
            return;
        };
        let Some(&writer) = state.writes.get(&(obj, key.clone())) else {
            return;
        };
        if writer == effect {
            return;
        }
        let closes_cycle = path_exists(&state.edges, effect, writer);
        let edge = state.edges.entry(writer).or_default();
        if !edge.contains(&effect) {
            edge.push(effect);
        }
        if !closes_cycle {
            return;
        }
        cycle_labels(root, &state.edges, effect, writer)
    };
    root.fail(Error::CycleDetected { cycle });
}

/// Records that the currently running effect wrote `(obj, key)`. Only
/// consulted under [`CycleHandling::Strict`].
pub(crate) fn note_write(root: &'static Root, obj: ObjectId, key: &Key) {
    if root.options.borrow().cycle_handling != CycleHandling::Strict {
        return;
    }
    let writer = root.current_running.get();
    if writer.is_null() {
        return;
    }
    let mut batch = root.batch.borrow_mut();
    if let Some(state) = batch.as_mut() {
        state.writes.insert((obj, key.clone()), writer);
    }
}

/// Whether `to` is reachable from `from` over the effect edges.
fn path_exists(edges: &HashMap<EffectId, Vec<EffectId>>, from: EffectId, to: EffectId) -> bool {
    let mut visited = HashSet::new();
    let mut stack = vec![from];
    while let Some(current) = stack.pop() {
        if current == to {
            return true;
        }
        if !visited.insert(current) {
            continue;
        }
        if let Some(targets) = edges.get(&current) {
            stack.extend(targets.iter().copied());
        }
    }
    false
}

/// Labels of the effects along the cycle `from -> ... -> to -> from`.
fn cycle_labels(
    root: &'static Root,
    edges: &HashMap<EffectId, Vec<EffectId>>,
    from: EffectId,
    to: EffectId,
) -> Vec<String> {
    fn dfs(
        edges: &HashMap<EffectId, Vec<EffectId>>,
        current: EffectId,
        to: EffectId,
        visited: &mut HashSet<EffectId>,
        path: &mut Vec<EffectId>,
    ) -> bool {
        path.push(current);
        if current == to {
            return true;
        }
        if visited.insert(current) {
            if let Some(targets) = edges.get(&current) {
                for &next in targets {
                    if dfs(edges, next, to, visited, path) {
                        return true;
                    }
                }
            }
        }
        path.pop();
        false
    }

    let mut path = Vec::new();
    let mut visited = HashSet::new();
    dfs(edges, from, to, &mut visited, &mut path);
    path.iter().map(|&id| effect_label(root, id)).collect()
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use crate::*;

    #[test]
    fn batch_coalesces_writes() {
        let _ = create_root(|| {
            let state = reactive_obj(record! { a: 1, b: 2 });
            let runs = Rc::new(Cell::new(0));
            let seen = runs.clone();
            effect(move |_| {
                seen.set(seen.get() + 1);
                let _ = (state.get("a"), state.get("b"));
            });
            assert_eq!(runs.get(), 1);
            state.set("a", 10.into()).unwrap();
            state.set("b", 20.into()).unwrap();
            assert_eq!(runs.get(), 3);
            batch(|| {
                state.set("a", 100.into()).unwrap();
                state.set("b", 200.into()).unwrap();
            })
            .unwrap();
            assert_eq!(runs.get(), 4);
        });
    }

    #[test]
    fn nested_batches_share_the_outer_queue() {
        let _ = create_root(|| {
            let state = reactive_obj(record! { a: 0 });
            let runs = Rc::new(Cell::new(0));
            let seen = runs.clone();
            effect(move |_| {
                seen.set(seen.get() + 1);
                let _ = state.get("a");
            });
            batch(|| {
                state.set("a", 1.into()).unwrap();
                batch(|| {
                    state.set("a", 2.into()).unwrap();
                })
                .unwrap();
                assert_eq!(runs.get(), 1); // nothing flushed yet
            })
            .unwrap();
            assert_eq!(runs.get(), 2);
        });
    }

    #[test]
    fn ping_pong_effects_hit_the_trigger_cap() {
        let _ = create_root(|| {
            let state = reactive_obj(record! { a: 0, b: 0 });
            let armed = Rc::new(Cell::new(false));

            let armed1 = armed.clone();
            effect(move |_| {
                let a = state.get("a");
                if armed1.get() {
                    let next = a.as_int().unwrap_or(0) + 1;
                    let _ = state.set("b", next.into());
                }
            });
            let armed2 = armed.clone();
            effect(move |_| {
                let b = state.get("b");
                if armed2.get() {
                    let next = b.as_int().unwrap_or(0) + 1;
                    let _ = state.set("a", next.into());
                }
            });

            armed.set(true);
            let result = state.set("a", 1.into());
            assert!(matches!(
                result,
                Err(Error::MaxReactionExceeded { .. }) | Err(Error::MaxDepthExceeded { .. })
            ));
            // The engine stays usable afterwards.
            armed.set(false);
            assert!(state.set("a", 5.into()).is_ok());
        });
    }

    #[test]
    fn throw_policy_reports_the_cycle() {
        let _ = create_root(|| {
            configure(|options| options.cycle_handling = CycleHandling::Throw);
            let state = reactive_obj(record! { a: 0, b: 0 });
            let armed = Rc::new(Cell::new(false));

            let armed1 = armed.clone();
            effect(move |_| {
                let a = state.get("a");
                if armed1.get() {
                    let next = a.as_int().unwrap_or(0) + 1;
                    let _ = state.set("b", next.into());
                }
            });
            let armed2 = armed.clone();
            effect(move |_| {
                let b = state.get("b");
                if armed2.get() {
                    let next = b.as_int().unwrap_or(0) + 1;
                    let _ = state.set("a", next.into());
                }
            });

            armed.set(true);
            let result = state.set("a", 1.into());
            match result {
                Err(Error::CycleDetected { cycle }) => assert!(!cycle.is_empty()),
                other => panic!("expected CycleDetected, got {other:?}"),
            }
        });
    }

    #[test]
    fn break_policy_drops_the_offending_retrigger() {
        let _ = create_root(|| {
            configure(|options| options.cycle_handling = CycleHandling::Break);
            let state = reactive_obj(record! { a: 0, b: 0 });
            let armed = Rc::new(Cell::new(false));

            let armed1 = armed.clone();
            effect(move |_| {
                let a = state.get("a");
                if armed1.get() {
                    let next = a.as_int().unwrap_or(0) + 1;
                    let _ = state.set("b", next.into());
                }
            });
            let armed2 = armed.clone();
            effect(move |_| {
                let b = state.get("b");
                if armed2.get() {
                    let next = b.as_int().unwrap_or(0) + 1;
                    let _ = state.set("a", next.into());
                }
            });

            armed.set(true);
            assert!(state.set("a", 1.into()).is_ok());
        });
    }

    #[test]
    fn panicking_effect_becomes_broken_effects() {
        let _ = create_root(|| {
            let state = reactive_obj(record! { a: 0 });
            let armed = Rc::new(Cell::new(false));
            let armed2 = armed.clone();
            effect(move |_| {
                let _ = state.get("a");
                if armed2.get() {
                    panic!("boom");
                }
            });
            armed.set(true);
            match state.set("a", 1.into()) {
                Err(Error::BrokenEffects(message)) => assert!(message.contains("boom")),
                other => panic!("expected BrokenEffects, got {other:?}"),
            }
            // The queue was discarded; later writes work again.
            armed.set(false);
            assert!(state.set("a", 2.into()).is_ok());
        });
    }

    #[test]
    fn batch_effects_runs_immediately_when_asked() {
        let _ = create_root(|| {
            let runs = Rc::new(Cell::new(0));
            let seen = runs.clone();
            let handle = effect(move |_| {
                seen.set(seen.get() + 1);
            });
            assert_eq!(runs.get(), 1);
            batch_effects(&[handle], true).unwrap();
            assert_eq!(runs.get(), 2);
        });
    }
}
