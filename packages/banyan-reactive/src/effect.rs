//! The effect engine: creation, execution, cleanup, parent/child lifetime,
//! and cooperative async runs.

use std::cell::RefCell;
use std::future::Future;
#[cfg(debug_assertions)]
use std::panic::Location;
use std::rc::Rc;

use futures::future::AbortHandle;
use slotmap::{new_key_type, Key as _};

use crate::error::{Error, Result};
use crate::object::ObjectId;
use crate::reactive::Obj;
use crate::root::{AsyncMode, Root, TriggerRecord};
use crate::value::Evolution;

new_key_type! {
    /// Stable identity of an effect within its root.
    pub struct EffectId;
}

/// Upper bound on the per-effect trigger lineage kept for diagnostics.
const MAX_LINEAGE: usize = 32;

/// What an effect run hands back to the engine.
///
/// Closures passed to [`effect`] return anything convertible into this:
/// `()` for plain effects, [`cleanup`] to register a disposal thunk, or
/// [`spawn`] to hand the engine an async continuation governed by the
/// effect's [`AsyncMode`].
pub enum EffectResult {
    /// Nothing to keep.
    Unit,
    /// Run this before the next run, and when the effect stops.
    Cleanup(Box<dyn FnOnce()>),
    /// The run continues asynchronously.
    Future(std::pin::Pin<Box<dyn Future<Output = ()>>>),
}

/// Conversion into [`EffectResult`], so effect closures can return `()`
/// naturally.
pub trait IntoEffectResult {
    /// Performs the conversion.
    fn into_effect_result(self) -> EffectResult;
}

impl IntoEffectResult for () {
    fn into_effect_result(self) -> EffectResult {
        EffectResult::Unit
    }
}
impl IntoEffectResult for EffectResult {
    fn into_effect_result(self) -> EffectResult {
        self
    }
}

/// Wraps a disposal thunk to return from an effect closure.
///
/// The thunk runs (untracked) before the effect's next run, and when the
/// effect stops.
pub fn cleanup(f: impl FnOnce() + 'static) -> EffectResult {
    EffectResult::Cleanup(Box::new(f))
}

/// Wraps an async continuation to return from an effect closure.
///
/// The future is spawned on the root's executor and governed by the effect's
/// [`AsyncMode`]. The active effect is not preserved across `await` points;
/// use [`EffectScope::tracked`] inside the future to restore it.
pub fn spawn(fut: impl Future<Output = ()> + 'static) -> EffectResult {
    EffectResult::Future(Box::pin(fut))
}

/// One effect in the arena.
pub(crate) struct EffectNode {
    /// The user computation. Shared so it can be invoked without holding a
    /// borrow on the arena.
    pub callback: Rc<RefCell<dyn FnMut(EffectScope) -> EffectResult>>,
    /// The creation-time active effect, or null.
    pub parent: EffectId,
    /// Effects created during this effect's runs.
    pub children: Vec<EffectId>,
    /// Set once, by `stop`. A stopped effect never runs again and acquires
    /// no new dependency edges.
    pub stopped: bool,
    /// The cleanup thunk returned by the last run.
    pub cleanup: Option<Box<dyn FnOnce()>>,
    /// Objects this effect holds dependency edges on.
    pub watches: Vec<ObjectId>,
    /// Objects this effect deep-watches (it appears in their watcher sets).
    pub deep_targets: Vec<ObjectId>,
    /// `false` until the first run has completed.
    pub reaction: bool,
    /// Notified on identity changes even when a recursive diff would
    /// otherwise suppress them.
    pub opaque: bool,
    /// Writes are refused while this effect is running.
    pub computed: bool,
    /// Per-effect async policy; falls back to the process-wide option.
    pub async_mode: Option<AsyncMode>,
    /// Diagnostic label.
    pub label: Option<Rc<str>>,
    /// The effect stack captured at creation, for [`EffectScope::ascend`].
    pub creation_stack: Vec<EffectId>,
    /// One-shot callbacks delivered on the next trigger.
    pub trigger_trackers: Vec<Box<dyn FnOnce(Obj, Evolution)>>,
    /// Recent trigger lineage, when introspection gathers it.
    pub last_triggers: Vec<TriggerRecord>,
    /// The most recent engine-raised error concerning this effect.
    pub last_error: Option<Error>,
    /// Abort handle of the in-flight async run.
    pub abort: Option<AbortHandle>,
    /// Whether an async run is in flight.
    pub in_flight: bool,
    /// A coalesced follow-up run is pending settlement (`AsyncMode::Queue`).
    pub queued_rerun: bool,
    /// Distinguishes settlement callbacks of superseded runs.
    pub epoch: u64,
    #[cfg(debug_assertions)]
    pub created_at: &'static Location<'static>,
}

impl EffectNode {
    pub fn push_trigger(&mut self, record: TriggerRecord) {
        if self.last_triggers.len() == MAX_LINEAGE {
            self.last_triggers.remove(0);
        }
        self.last_triggers.push(record);
    }
}

/// Options accepted by [`effect_with`].
#[derive(Default)]
pub struct EffectOptions {
    /// Per-effect async policy override.
    pub async_mode: Option<AsyncMode>,
    /// See [`EffectNode::opaque`]: schedule this effect on every replacement
    /// of an object it reads, regardless of recursive-diff suppression.
    pub opaque: bool,
    /// Refuse writes while this effect is running.
    pub computed: bool,
    /// Diagnostic label, used in cycle reports.
    pub label: Option<String>,
}

/// A stop handle for an effect. `Copy`, so it can be captured freely.
#[derive(Clone, Copy)]
pub struct EffectHandle {
    id: EffectId,
    root: &'static Root,
}

impl EffectHandle {
    pub(crate) fn from_raw(id: EffectId, root: &'static Root) -> Self {
        Self { id, root }
    }

    pub(crate) fn id(self) -> EffectId {
        self.id
    }

    /// Stops the effect: runs its cleanup thunk, removes its dependency
    /// edges, cancels any in-flight async run, and stops every descendant.
    /// Idempotent.
    pub fn stop(self) {
        stop_effect(self.root, self.id, StopReason::Explicit);
    }

    /// Whether the effect has not been stopped yet.
    pub fn is_alive(self) -> bool {
        let effects = self.root.effects.borrow();
        effects.get(self.id).is_some_and(|node| !node.stopped)
    }

    /// The most recent engine-raised error concerning this effect, such as
    /// [`Error::EffectCanceled`] after an aborted async run.
    pub fn last_error(self) -> Option<Error> {
        let effects = self.root.effects.borrow();
        effects.get(self.id).and_then(|node| node.last_error.clone())
    }

    /// The recent trigger lineage, when `introspection.gather_reasons`
    /// enables gathering.
    pub fn last_triggers(self) -> Vec<TriggerRecord> {
        let effects = self.root.effects.borrow();
        effects
            .get(self.id)
            .map(|node| node.last_triggers.clone())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for EffectHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EffectHandle({:?})", self.id)
    }
}

/// The access object passed to every effect run.
#[derive(Clone, Copy)]
pub struct EffectScope {
    id: EffectId,
    root: &'static Root,
}

impl EffectScope {
    pub(crate) fn id(self) -> EffectId {
        self.id
    }

    /// `false` on the first execution, `true` on any subsequent re-run.
    pub fn reaction(self) -> bool {
        let effects = self.root.effects.borrow();
        effects.get(self.id).is_some_and(|node| node.reaction)
    }

    /// Runs `f` with this effect active, so reads register against it.
    ///
    /// Rust's async machinery does not preserve the active effect across an
    /// `await`; continuations call this to restore it.
    pub fn tracked<T>(self, f: impl FnOnce() -> T) -> T {
        {
            let effects = self.root.effects.borrow();
            match effects.get(self.id) {
                Some(node) if !node.stopped => {}
                _ => return crate::root::untrack(f),
            }
        }
        let prev_tracking = self.root.tracking.replace(true);
        self.root.effect_stack.borrow_mut().push(self.id);
        let ret = f();
        self.root.effect_stack.borrow_mut().pop();
        self.root.tracking.set(prev_tracking);
        ret
    }

    /// Runs `f` with the effect stack captured at this effect's *creation*,
    /// not the current one.
    ///
    /// An effect created inside `f` is therefore a child of the outer
    /// effect: an outer change disposes it, while its own dependencies do
    /// not restart the outer effect. Derived containers are built on this.
    pub fn ascend<T>(self, f: impl FnOnce() -> T) -> T {
        let creation = {
            let effects = self.root.effects.borrow();
            match effects.get(self.id) {
                Some(node) => node.creation_stack.clone(),
                None => Vec::new(),
            }
        };
        let prev_stack = std::mem::replace(&mut *self.root.effect_stack.borrow_mut(), creation);
        let prev_tracking = self.root.tracking.replace(true);
        let ret = f();
        *self.root.effect_stack.borrow_mut() = prev_stack;
        self.root.tracking.set(prev_tracking);
        ret
    }

    /// The stop handle of this effect.
    pub fn handle(self) -> EffectHandle {
        EffectHandle {
            id: self.id,
            root: self.root,
        }
    }
}

/// Creates a new effect and runs it once immediately.
///
/// Any reactive reads performed during a run register the effect as a
/// dependent; mutating any of those properties re-runs it. A re-run first
/// executes the cleanup thunk returned by the previous run (if any), removes
/// the previous run's dependency edges, and stops child effects created by
/// the previous run.
///
/// The returned handle stops the effect. Stopping a parent stops every
/// descendant exactly once.
///
/// # Panics
///
/// Panics raised by `f` propagate to the caller. A scheduler error raised
/// while draining the triggers cascaded by the first run (for example a
/// detected cycle) panics as well; cascades triggered by later writes
/// surface as the `Err` of the write instead.
///
/// # Example
/// ```
/// # use banyan_reactive::*;
/// # let _ = create_root(|| {
/// let state = reactive_obj(record! { count: 0 });
/// let stop = effect(move |_| {
///     let _ = state.get("count");
/// });
/// state.set("count", 1.into()).unwrap(); // re-runs the effect
/// stop.stop();
/// state.set("count", 2.into()).unwrap(); // does not
/// # });
/// ```
#[cfg_attr(debug_assertions, track_caller)]
pub fn effect<R: IntoEffectResult>(f: impl FnMut(EffectScope) -> R + 'static) -> EffectHandle {
    effect_with(EffectOptions::default(), f)
}

/// [`effect`] with explicit [`EffectOptions`].
#[cfg_attr(debug_assertions, track_caller)]
pub fn effect_with<R: IntoEffectResult>(
    options: EffectOptions,
    mut f: impl FnMut(EffectScope) -> R + 'static,
) -> EffectHandle {
    let root = Root::global();
    let creation_stack = root.effect_stack.borrow().clone();
    let parent = creation_stack.last().copied().unwrap_or_else(EffectId::null);

    let id = root.effects.borrow_mut().insert(EffectNode {
        callback: Rc::new(RefCell::new(move |scope: EffectScope| {
            f(scope).into_effect_result()
        })),
        parent,
        children: Vec::new(),
        stopped: false,
        cleanup: None,
        watches: Vec::new(),
        deep_targets: Vec::new(),
        reaction: false,
        opaque: options.opaque,
        computed: options.computed,
        async_mode: options.async_mode,
        label: options.label.map(|l| Rc::from(l.as_str())),
        creation_stack,
        trigger_trackers: Vec::new(),
        last_triggers: Vec::new(),
        last_error: None,
        abort: None,
        in_flight: false,
        queued_rerun: false,
        epoch: 0,
        #[cfg(debug_assertions)]
        created_at: Location::caller(),
    });
    if !parent.is_null() {
        let mut effects = root.effects.borrow_mut();
        if let Some(parent_node) = effects.get_mut(parent) {
            parent_node.children.push(id);
        }
    }

    // The first run happens inline so user panics propagate from here. Any
    // cascaded triggers drain through the (possibly freshly opened) batch.
    let opened = crate::batch::open_if_needed(root);
    struct CreationGuard {
        root: &'static Root,
        opened: bool,
        armed: bool,
    }
    impl Drop for CreationGuard {
        fn drop(&mut self) {
            if self.armed && self.opened {
                let _ = self.root.batch.take();
                let _ = self.root.take_error();
            }
        }
    }
    let mut guard = CreationGuard {
        root,
        opened,
        armed: true,
    };

    {
        let mut batch = root.batch.borrow_mut();
        if let Some(state) = batch.as_mut() {
            state.running.insert(id);
        }
    }
    run_effect(root, id);
    {
        let mut batch = root.batch.borrow_mut();
        if let Some(state) = batch.as_mut() {
            state.running.remove(&id);
        }
    }
    guard.armed = false;

    if opened {
        if let Err(error) = crate::batch::drain_and_close(root) {
            panic!("{error}");
        }
    }
    EffectHandle { id, root }
}

/// Registers a one-shot callback invoked the next time the active effect is
/// triggered, delivering the triggering object and change.
///
/// Fails with [`Error::NoActiveEffect`] outside an effect run.
pub fn track_effect(cb: impl FnOnce(Obj, Evolution) + 'static) -> Result<()> {
    let root = Root::global();
    let current = root
        .effect_stack
        .borrow()
        .last()
        .copied()
        .ok_or(Error::NoActiveEffect)?;
    let mut effects = root.effects.borrow_mut();
    match effects.get_mut(current) {
        Some(node) if !node.stopped => {
            node.trigger_trackers.push(Box::new(cb));
            Ok(())
        }
        _ => Err(Error::NoActiveEffect),
    }
}

/// Executes one run of `id`: previous cleanup, edge and child teardown, the
/// user callback under the active-effect stack, then result classification.
pub(crate) fn run_effect(root: &'static Root, id: EffectId) {
    let Some((callback, mode)) = ({
        let effects = root.effects.borrow();
        effects.get(id).and_then(|node| {
            (!node.stopped).then(|| {
                let mode = node
                    .async_mode
                    .unwrap_or_else(|| root.options.borrow().async_mode);
                (Rc::clone(&node.callback), mode)
            })
        })
    }) else {
        return;
    };

    // Gate on an in-flight async run.
    let in_flight = root.effects.borrow()[id].in_flight;
    if in_flight {
        match mode {
            AsyncMode::Queue => {
                root.effects.borrow_mut()[id].queued_rerun = true;
                return;
            }
            AsyncMode::Ignore => return,
            AsyncMode::Cancel => {
                let abort = {
                    let mut effects = root.effects.borrow_mut();
                    let node = &mut effects[id];
                    node.in_flight = false;
                    node.epoch += 1;
                    node.last_error = Some(Error::EffectCanceled);
                    node.abort.take()
                };
                if let Some(handle) = abort {
                    handle.abort();
                }
            }
            AsyncMode::Off => {}
        }
    }

    // Previous cleanup runs before anything of the new run.
    let prev_cleanup = root.effects.borrow_mut()[id].cleanup.take();
    if let Some(cleanup) = prev_cleanup {
        run_untracked_in(root, cleanup);
    }
    // Stale edges and children of the previous run go away.
    root.clear_effect_deps(id);
    crate::deep::clear_deep_marks(root, id);
    stop_children(root, id);

    let hooks = root.hook_set();
    if let Some(hook) = &hooks.enter {
        hook(EffectHandle::from_raw(id, root));
    }

    // Restore the stack and flags even if the callback panics.
    struct RunGuard {
        root: &'static Root,
        prev_tracking: bool,
        prev_running: EffectId,
    }
    impl Drop for RunGuard {
        fn drop(&mut self) {
            self.root.effect_stack.borrow_mut().pop();
            self.root.tracking.set(self.prev_tracking);
            self.root.current_running.set(self.prev_running);
        }
    }
    let result = {
        let _guard = RunGuard {
            root,
            prev_tracking: root.tracking.replace(true),
            prev_running: root.current_running.replace(id),
        };
        root.effect_stack.borrow_mut().push(id);
        let scope = EffectScope { id, root };
        (callback.borrow_mut())(scope)
    };

    let mut pending_future = None;
    {
        let mut effects = root.effects.borrow_mut();
        if let Some(node) = effects.get_mut(id) {
            node.reaction = true;
            match result {
                EffectResult::Unit => {}
                EffectResult::Cleanup(thunk) => node.cleanup = Some(thunk),
                EffectResult::Future(fut) => pending_future = Some(fut),
            }
        }
    }
    if let Some(fut) = pending_future {
        dispatch_async(root, id, mode, fut);
    }

    if let Some(hook) = &hooks.leave {
        hook(EffectHandle::from_raw(id, root));
    }
}

/// Hands an async continuation to the executor under the given mode.
fn dispatch_async(
    root: &'static Root,
    id: EffectId,
    mode: AsyncMode,
    fut: std::pin::Pin<Box<dyn Future<Output = ()>>>,
) {
    if mode == AsyncMode::Off {
        root.spawn(fut);
        return;
    }
    let (abortable, handle) = futures::future::abortable(fut);
    let epoch = {
        let mut effects = root.effects.borrow_mut();
        let Some(node) = effects.get_mut(id) else {
            return;
        };
        node.abort = Some(handle);
        node.in_flight = true;
        node.epoch += 1;
        node.epoch
    };
    root.spawn(async move {
        let aborted = abortable.await.is_err();
        async_settled(root, id, epoch, aborted);
    });
}

/// Called when an async run settles (or is aborted): clears the in-flight
/// state and dispatches the coalesced follow-up run, if one is queued.
fn async_settled(root: &'static Root, id: EffectId, epoch: u64, aborted: bool) {
    let rerun = {
        let mut effects = root.effects.borrow_mut();
        let Some(node) = effects.get_mut(id) else {
            return;
        };
        if node.epoch != epoch {
            return; // a newer run superseded this one
        }
        node.in_flight = false;
        node.abort = None;
        if aborted {
            node.last_error = Some(Error::EffectCanceled);
        }
        let rerun = node.queued_rerun && !node.stopped;
        node.queued_rerun = false;
        rerun
    };
    if rerun {
        let prev = Root::set_global(Some(root));
        let _ = crate::batch::enqueue(root, vec![id], true);
        Root::set_global(prev);
    }
}

/// Why an effect is being stopped.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopReason {
    Explicit,
    ParentStopped,
    RootDisposed,
}

/// Stops an effect: cleanup thunk, edge removal, async cancellation, child
/// stops, queue purge, and finally arena removal. Idempotent; a child is
/// stopped at most once even when its parent stops concurrently.
pub(crate) fn stop_effect(root: &'static Root, id: EffectId, reason: StopReason) {
    {
        let mut effects = root.effects.borrow_mut();
        match effects.get_mut(id) {
            Some(node) if !node.stopped => node.stopped = true,
            _ => return,
        }
    }
    // No stale entries may survive in the pending queue.
    crate::batch::dequeue(root, id);

    if reason == StopReason::RootDisposed {
        let hooks = root.hook_set();
        if let Some(hook) = &hooks.garbage_collected {
            hook(EffectHandle::from_raw(id, root));
        }
    }

    // (1) cleanup thunk, (2) edges, (3) in-flight async, (4) children.
    let (cleanup, abort, children, parent) = {
        let mut effects = root.effects.borrow_mut();
        let node = &mut effects[id];
        node.trigger_trackers.clear();
        (
            node.cleanup.take(),
            node.abort.take(),
            std::mem::take(&mut node.children),
            node.parent,
        )
    };
    if let Some(cleanup) = cleanup {
        run_untracked_in(root, cleanup);
    }
    root.clear_effect_deps(id);
    crate::deep::clear_deep_marks(root, id);
    if let Some(handle) = abort {
        handle.abort();
    }
    for child in children {
        stop_effect(root, child, StopReason::ParentStopped);
    }

    if reason == StopReason::Explicit && !parent.is_null() {
        let mut effects = root.effects.borrow_mut();
        if let Some(parent_node) = effects.get_mut(parent) {
            parent_node.children.retain(|&c| c != id);
        }
    }

    // A running effect finishes its current call; the node is reclaimed once
    // the batch has drained.
    if root.is_running(id) {
        crate::batch::post_batch_cleanup(root, move || {
            root.effects.borrow_mut().remove(id);
        });
    } else {
        root.effects.borrow_mut().remove(id);
    }
}

/// Stops every child of `id`, as part of a re-run or stop.
fn stop_children(root: &'static Root, id: EffectId) {
    let children = {
        let mut effects = root.effects.borrow_mut();
        match effects.get_mut(id) {
            Some(node) => std::mem::take(&mut node.children),
            None => return,
        }
    };
    for child in children {
        stop_effect(root, child, StopReason::ParentStopped);
    }
}

/// Runs `f` with tracking off, against an explicit root.
fn run_untracked_in(root: &Root, f: impl FnOnce()) {
    let prev = root.tracking.replace(false);
    f();
    root.tracking.set(prev);
}

/// A human-readable name for an effect, used in cycle reports.
pub(crate) fn effect_label(root: &Root, id: EffectId) -> String {
    let effects = root.effects.borrow();
    match effects.get(id) {
        Some(node) => match &node.label {
            Some(label) => label.to_string(),
            #[cfg(debug_assertions)]
            None => format!("effect@{}", node.created_at),
            #[cfg(not(debug_assertions))]
            None => format!("{:?}", id),
        },
        None => format!("{id:?}"),
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    use crate::*;

    #[test]
    fn effect_reruns_on_write() {
        let _ = create_root(|| {
            let state = reactive_obj(record! { count: 0 });
            let runs = Rc::new(Cell::new(0));
            let seen = runs.clone();
            let stop = effect(move |_| {
                seen.set(seen.get() + 1);
                let _ = state.get("count");
            });
            assert_eq!(runs.get(), 1);
            state.set("count", 1.into()).unwrap();
            assert_eq!(runs.get(), 2);
            stop.stop();
            state.set("count", 2.into()).unwrap();
            assert_eq!(runs.get(), 2);
        });
    }

    #[test]
    fn unread_keys_do_not_retrigger() {
        let _ = create_root(|| {
            let state = reactive_obj(record! { which: true, a: 0, b: 0 });
            let runs = Rc::new(Cell::new(0));
            let seen = runs.clone();
            effect(move |_| {
                seen.set(seen.get() + 1);
                if state.get("which").is_truthy() {
                    let _ = state.get("a");
                } else {
                    let _ = state.get("b");
                }
            });
            assert_eq!(runs.get(), 1);
            state.set("a", 1.into()).unwrap();
            assert_eq!(runs.get(), 2);
            state.set("b", 1.into()).unwrap();
            assert_eq!(runs.get(), 2); // b was never read

            state.set("which", false.into()).unwrap();
            assert_eq!(runs.get(), 3);
            // Liberation: `a` is no longer read, so writing it must not
            // re-schedule the effect.
            state.set("a", 2.into()).unwrap();
            assert_eq!(runs.get(), 3);
            state.set("b", 2.into()).unwrap();
            assert_eq!(runs.get(), 4);
        });
    }

    #[test]
    fn cleanup_runs_before_each_rerun_and_on_stop() {
        let _ = create_root(|| {
            let state = reactive_obj(record! { n: 0 });
            let log = Rc::new(RefCell::new(Vec::new()));
            let inner = log.clone();
            let stop = effect(move |_| {
                let n = state.get("n").as_int().unwrap();
                inner.borrow_mut().push(format!("run {n}"));
                let inner = inner.clone();
                cleanup(move || inner.borrow_mut().push(format!("cleanup {n}")))
            });
            state.set("n", 1.into()).unwrap();
            stop.stop();
            assert_eq!(
                *log.borrow(),
                vec!["run 0", "cleanup 0", "run 1", "cleanup 1"]
            );
        });
    }

    #[test]
    fn stopping_a_parent_stops_descendants_once() {
        let _ = create_root(|| {
            let state = reactive_obj(record! { n: 0 });
            let child_stops = Rc::new(Cell::new(0));
            let child_runs = Rc::new(Cell::new(0));
            let stops = child_stops.clone();
            let runs = child_runs.clone();
            let parent = effect(move |_| {
                let stops = stops.clone();
                let runs = runs.clone();
                effect(move |_| {
                    runs.set(runs.get() + 1);
                    let _ = state.get("n");
                    let stops = stops.clone();
                    cleanup(move || stops.set(stops.get() + 1))
                });
            });
            assert_eq!(child_runs.get(), 1);
            parent.stop();
            assert_eq!(child_stops.get(), 1);
            state.set("n", 1.into()).unwrap();
            assert_eq!(child_runs.get(), 1); // stopped child never runs again
            parent.stop(); // idempotent
            assert_eq!(child_stops.get(), 1);
        });
    }

    #[test]
    fn reaction_flag_distinguishes_first_run() {
        let _ = create_root(|| {
            let state = reactive_obj(record! { n: 0 });
            let reactions = Rc::new(RefCell::new(Vec::new()));
            let seen = reactions.clone();
            effect(move |scope| {
                let _ = state.get("n");
                seen.borrow_mut().push(scope.reaction());
            });
            state.set("n", 1.into()).unwrap();
            state.set("n", 2.into()).unwrap();
            assert_eq!(*reactions.borrow(), vec![false, true, true]);
        });
    }

    #[test]
    fn ascend_creates_children_of_the_outer_effect() {
        let _ = create_root(|| {
            let state = reactive_obj(record! { outer: 0, inner: 0 });
            let outer_runs = Rc::new(Cell::new(0));
            let inner_runs = Rc::new(Cell::new(0));
            let o = outer_runs.clone();
            let i = inner_runs.clone();
            effect(move |_| {
                o.set(o.get() + 1);
                let _ = state.get("outer");
                let i = i.clone();
                effect(move |scope| {
                    // Dependencies of this grandchild are registered against
                    // the outer stack, so `inner` writes do not restart the
                    // middle effect.
                    scope.ascend(|| {
                        let i = i.clone();
                        effect(move |_| {
                            i.set(i.get() + 1);
                            let _ = state.get("inner");
                        });
                    });
                });
            });
            assert_eq!((outer_runs.get(), inner_runs.get()), (1, 1));
            state.set("inner", 1.into()).unwrap();
            assert_eq!(outer_runs.get(), 1);
            assert!(inner_runs.get() >= 2);
        });
    }

    #[test]
    fn track_effect_delivers_the_next_trigger_once() {
        let _ = create_root(|| {
            let state = reactive_obj(record! { n: 0 });
            let triggers = Rc::new(RefCell::new(Vec::new()));
            let seen = triggers.clone();
            effect(move |_| {
                let _ = state.get("n");
                let seen = seen.clone();
                track_effect(move |_obj, evolution| {
                    seen.borrow_mut().push(evolution);
                })
                .unwrap();
            });
            state.set("n", 1.into()).unwrap();
            state.set("n", 2.into()).unwrap();
            // Registered once per run, delivered once per trigger.
            assert_eq!(triggers.borrow().len(), 2);
            assert!(matches!(triggers.borrow()[0], Evolution::Set(_)));
        });
    }

    #[test]
    fn track_effect_outside_effect_fails() {
        let _ = create_root(|| {
            assert_eq!(
                track_effect(|_, _| {}).unwrap_err(),
                Error::NoActiveEffect
            );
        });
    }
}
