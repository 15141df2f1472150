//! The [`Root`] owning all reactive state, plus process-wide configuration.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use futures::executor::{LocalPool, LocalSpawner};
use futures::task::LocalSpawnExt;
use slotmap::{Key as _, SlotMap};

use crate::batch::BatchState;
use crate::effect::{EffectHandle, EffectId, EffectNode, StopReason};
use crate::error::Error;
use crate::object::{ObjectData, ObjectId};
use crate::reactive::Obj;
use crate::value::{Evolution, Key};

/// The struct managing the state of the reactive system. Only one should be
/// created per running app.
///
/// Often times, this is intended to be leaked to be able to get a
/// `&'static Root`. However, the `Root` is also `dispose`-able, meaning that
/// any resources allocated in this `Root` will get deallocated. Therefore in
/// practice, there should be no memory leak at all except for the `Root`
/// itself.
pub(crate) struct Root {
    /// All composite objects created in this root.
    pub objects: RefCell<SlotMap<ObjectId, ObjectData>>,
    /// All effect nodes created in this root.
    pub effects: RefCell<SlotMap<EffectId, EffectNode>>,
    /// The active-effect stack; the top is the effect currently tracking.
    pub effect_stack: RefCell<Vec<EffectId>>,
    /// Whether reads currently register dependencies. Cleared by `untrack`.
    pub tracking: Cell<bool>,
    /// The effect whose run routine is currently executing, if any. This is
    /// distinct from the top of `effect_stack`: it survives `untrack`.
    pub current_running: Cell<EffectId>,
    /// The open batch, if any.
    pub batch: RefCell<Option<BatchState>>,
    /// The first error raised while draining the current batch.
    pub pending_error: RefCell<Option<Error>>,
    /// Process-wide options.
    pub options: RefCell<Options>,
    /// Diagnostic hooks, shared so they can be invoked without holding a
    /// borrow across user code.
    pub hooks: RefCell<Rc<Hooks>>,
    /// Prototypes whose instances are classified non-reactive.
    pub non_reactive_protos: RefCell<Vec<ObjectId>>,
    /// Custom non-reactive classification predicates.
    pub non_reactive_predicates: RefCell<Vec<Rc<dyn Fn(Obj) -> bool>>>,
    /// Bounded trigger history, when enabled by introspection options.
    pub history: RefCell<VecDeque<TriggerRecord>>,
    /// Guard against re-entrant `has` checks on the same `(object, key)`.
    pub has_guard: RefCell<Vec<(ObjectId, Key)>>,
    /// Single-threaded executor driving async effect runs.
    pub executor: RefCell<LocalPool>,
    pub spawner: LocalSpawner,
}

thread_local! {
    /// The current reactive root.
    static GLOBAL_ROOT: Cell<Option<&'static Root>> = const { Cell::new(None) };
}

impl Root {
    /// Get the current reactive root. Panics if no root is found.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn global() -> &'static Root {
        GLOBAL_ROOT.with(|root| root.get()).expect("no root found")
    }

    /// Sets the current reactive root. Returns the previous root.
    pub fn set_global(root: Option<&'static Root>) -> Option<&'static Root> {
        GLOBAL_ROOT.with(|r| r.replace(root))
    }

    /// Create a new reactive root. This root is leaked and so lives until the
    /// end of the program.
    pub fn new_static() -> &'static Self {
        let pool = LocalPool::new();
        let spawner = pool.spawner();
        let this = Self {
            objects: RefCell::new(SlotMap::default()),
            effects: RefCell::new(SlotMap::default()),
            effect_stack: RefCell::new(Vec::new()),
            tracking: Cell::new(false),
            current_running: Cell::new(EffectId::null()),
            batch: RefCell::new(None),
            pending_error: RefCell::new(None),
            options: RefCell::new(Options::default()),
            hooks: RefCell::new(Rc::new(Hooks::default())),
            non_reactive_protos: RefCell::new(Vec::new()),
            non_reactive_predicates: RefCell::new(Vec::new()),
            history: RefCell::new(VecDeque::new()),
            has_guard: RefCell::new(Vec::new()),
            executor: RefCell::new(pool),
            spawner,
        };
        Box::leak(Box::new(this))
    }

    /// Disposes of all the resources held on by this root and resets the
    /// state.
    pub fn reinit(&'static self) {
        // Stop top-level effects first so cleanup thunks can still read the
        // objects they captured. Orphans reaped here are reported through the
        // `garbage_collected` hook.
        let top_level: Vec<EffectId> = {
            let effects = self.effects.borrow();
            effects
                .iter()
                .filter(|(_, node)| node.parent.is_null())
                .map(|(id, _)| id)
                .collect()
        };
        let prev = Root::set_global(Some(self));
        for id in top_level {
            crate::effect::stop_effect(self, id, StopReason::RootDisposed);
        }
        Root::set_global(prev);

        let _ = self.effects.take();
        let _ = self.objects.take();
        let _ = self.effect_stack.take();
        let _ = self.batch.take();
        let _ = self.pending_error.take();
        let _ = self.non_reactive_protos.take();
        let _ = self.non_reactive_predicates.take();
        let _ = self.history.take();
        let _ = self.has_guard.take();
        self.tracking.set(false);
        self.current_running.set(EffectId::null());
        *self.options.borrow_mut() = Options::default();
        *self.hooks.borrow_mut() = Rc::new(Hooks::default());
        // Dropping the pool aborts any still-pending async runs.
        *self.executor.borrow_mut() = LocalPool::new();
    }

    /// A shared handle on the installed hooks, so they can be called after
    /// all borrows are released.
    pub fn hook_set(&self) -> Rc<Hooks> {
        Rc::clone(&self.hooks.borrow())
    }

    /// The effect currently registering dependencies, if tracking is on.
    pub fn current_effect(&self) -> Option<EffectId> {
        if !self.tracking.get() {
            return None;
        }
        self.effect_stack.borrow().last().copied()
    }

    /// Whether `effect` is being executed by the scheduler right now.
    pub fn is_running(&self, effect: EffectId) -> bool {
        self.batch
            .borrow()
            .as_ref()
            .is_some_and(|b| b.running.contains(&effect))
    }

    /// Registers the current effect as depending on `(obj, key)`.
    /// Both directions of the edge are stored.
    pub fn depend(&'static self, obj: ObjectId, key: Key) {
        let Some(current) = self.current_effect() else {
            return;
        };
        {
            let effects = self.effects.borrow();
            match effects.get(current) {
                Some(node) if !node.stopped => {}
                _ => return,
            }
        }
        // Under the `Strict` policy an edge that would close an effect cycle
        // is refused at dependency-creation time.
        crate::batch::note_dependency(self, current, obj, &key);
        {
            let mut objects = self.objects.borrow_mut();
            let Some(data) = objects.get_mut(obj) else {
                return;
            };
            data.add_watcher(key.clone(), current);
        }
        let gather = matches!(
            self.options.borrow().introspection.gather_reasons,
            Lineages::Dependency | Lineages::Both
        );
        let mut effects = self.effects.borrow_mut();
        let node = &mut effects[current];
        if !node.watches.contains(&obj) {
            node.watches.push(obj);
        }
        if gather {
            node.push_trigger(TriggerRecord {
                object: obj,
                evolution: None,
                kind: TriggerKind::Dependency,
            });
        }
    }

    /// Removes every dependency edge mentioning `effect`, walking its watched
    /// objects to delete the reverse entries.
    pub fn clear_effect_deps(&self, effect: EffectId) {
        let watched = {
            let mut effects = self.effects.borrow_mut();
            match effects.get_mut(effect) {
                Some(node) => std::mem::take(&mut node.watches),
                None => return,
            }
        };
        let mut objects = self.objects.borrow_mut();
        for obj in watched {
            if let Some(data) = objects.get_mut(obj) {
                data.remove_watcher(effect);
            }
        }
    }

    /// Collects the live effects watching any of `keys` on `obj` into `out`.
    ///
    /// Effects that are currently running are skipped (reported through the
    /// `skip_running_effect` hook); one-shot trigger trackers are invoked and
    /// discarded. The watcher sets are snapshotted before any user code runs.
    pub fn collect(
        &'static self,
        obj: ObjectId,
        evolution: &Evolution,
        keys: &[Key],
        out: &mut Vec<EffectId>,
    ) {
        let mut found = Vec::new();
        {
            let objects = self.objects.borrow();
            if let Some(data) = objects.get(obj) {
                data.watchers_for(keys, &mut found);
            }
        }
        let gather = matches!(
            self.options.borrow().introspection.gather_reasons,
            Lineages::Touch | Lineages::Both
        );
        let mut skipped = Vec::new();
        let mut trackers = Vec::new();
        {
            let mut effects = self.effects.borrow_mut();
            found.retain(|&id| {
                let Some(node) = effects.get_mut(id) else {
                    return false;
                };
                if node.stopped {
                    return false;
                }
                if self.is_running(id) {
                    skipped.push(id);
                    return false;
                }
                trackers.extend(node.trigger_trackers.drain(..));
                if gather {
                    node.push_trigger(TriggerRecord {
                        object: obj,
                        evolution: Some(evolution.clone()),
                        kind: TriggerKind::Touch,
                    });
                }
                true
            });
        }
        let hooks = self.hook_set();
        if let Some(hook) = &hooks.skip_running_effect {
            for id in &skipped {
                hook(EffectHandle::from_raw(*id, self));
            }
        }
        let target = Obj::from_raw(self, obj);
        for tracker in trackers {
            tracker(target, evolution.clone());
        }
        for id in found {
            if !out.contains(&id) {
                out.push(id);
            }
        }
    }

    /// A plain snapshot of the live effects watching any of `keys` on `obj`,
    /// with none of [`collect`](Root::collect)'s side effects. Used to
    /// compute the recursive-diff `allowed` set.
    pub fn watchers_of(&self, obj: ObjectId, keys: &[Key]) -> Vec<EffectId> {
        let mut out = Vec::new();
        {
            let objects = self.objects.borrow();
            if let Some(data) = objects.get(obj) {
                data.watchers_for(keys, &mut out);
            }
        }
        let effects = self.effects.borrow();
        out.retain(|&id| effects.get(id).is_some_and(|node| !node.stopped));
        out
    }

    /// Records a touch in the introspection history, when enabled.
    pub fn record_touch(&self, obj: ObjectId, evolution: &Evolution) {
        let options = self.options.borrow();
        if !options.introspection.enable_history {
            return;
        }
        let cap = options.introspection.history_size;
        drop(options);
        let mut history = self.history.borrow_mut();
        history.push_back(TriggerRecord {
            object: obj,
            evolution: Some(evolution.clone()),
            kind: TriggerKind::Touch,
        });
        while history.len() > cap {
            history.pop_front();
        }
    }

    /// Stores the first error raised during the current batch.
    pub fn fail(&self, error: Error) {
        let mut slot = self.pending_error.borrow_mut();
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    /// Takes the pending batch error, if any.
    pub fn take_error(&self) -> Option<Error> {
        self.pending_error.borrow_mut().take()
    }

    /// Spawns a future on the root's executor.
    pub fn spawn(&self, fut: impl std::future::Future<Output = ()> + 'static) {
        if self.spawner.spawn_local(fut).is_err() {
            let hooks = self.hook_set();
            if let Some(warn) = &hooks.warn {
                warn("async effect spawned after its root was shut down");
            }
        }
    }

    /// Emits through the `warn` hook, if one is installed.
    pub fn warn(&self, message: &str) {
        let hooks = self.hook_set();
        if let Some(warn) = &hooks.warn {
            warn(message);
        }
        #[cfg(feature = "trace")]
        tracing::warn!("{message}");
    }
}

/// A handle to a root. This lets you reinitialize or dispose the root for
/// resource cleanup.
///
/// This is generally obtained from [`create_root`].
#[derive(Clone, Copy)]
pub struct RootHandle {
    _ref: &'static Root,
}

impl RootHandle {
    /// Destroy everything that was created in this root.
    pub fn dispose(&self) {
        self._ref.reinit();
    }

    /// Runs the closure with this root installed as the current one.
    pub fn run_in<T>(&self, f: impl FnOnce() -> T) -> T {
        let prev = Root::set_global(Some(self._ref));
        let ret = f();
        Root::set_global(prev);
        ret
    }
}

/// Creates a new reactive root and runs `f` inside it. The returned
/// [`RootHandle`] can be used to [`dispose`](RootHandle::dispose) the root or
/// re-enter it later.
///
/// # Example
/// ```rust
/// # use banyan_reactive::*;
/// let root = create_root(|| {
///     let state = reactive_obj(record! { ready: false });
///     let _ = state;
/// });
/// root.dispose();
/// ```
#[must_use = "root should be disposed"]
pub fn create_root(f: impl FnOnce()) -> RootHandle {
    let _ref = Root::new_static();
    {
        /// An unsafe wrapper around a raw pointer which we promise to never
        /// touch, effectively making it thread-safe.
        #[allow(dead_code)]
        struct UnsafeSendPtr<T>(*const T);
        /// We never ever touch the pointer inside so surely this is safe!
        unsafe impl<T> Send for UnsafeSendPtr<T> {}

        /// A static variable to keep on holding to the allocated `Root`s to
        /// prevent Miri and Valgrind from complaining.
        static KEEP_ALIVE: std::sync::Mutex<Vec<UnsafeSendPtr<Root>>> =
            std::sync::Mutex::new(Vec::new());
        KEEP_ALIVE
            .lock()
            .unwrap()
            .push(UnsafeSendPtr(_ref as *const Root));
    }

    Root::set_global(Some(_ref));
    f();
    Root::set_global(None);
    RootHandle { _ref }
}

/// Run the passed closure inside an untracked dependency scope.
///
/// Reads performed inside `f` do not register dependencies on the currently
/// active effect.
///
/// # Example
/// ```
/// # use banyan_reactive::*;
/// # let _ = create_root(|| {
/// let state = reactive_obj(record! { a: 0 });
/// effect(move |_| {
///     // Not a dependency: mutating `a` later will not re-run this effect.
///     let _ = untrack(|| state.get("a"));
/// });
/// state.set("a", 1.into()).unwrap();
/// # });
/// ```
pub fn untrack<T>(f: impl FnOnce() -> T) -> T {
    let root = Root::global();
    let prev = root.tracking.replace(false);
    let ret = f();
    root.tracking.set(prev);
    ret
}

/// Temporarily switches the active effect while running `f`.
///
/// With `None`, this behaves like [`untrack`]; with `Some(effect)`, reads
/// inside `f` register against that effect instead of the current one.
pub fn with_effect<T>(effect: Option<EffectHandle>, f: impl FnOnce() -> T) -> T {
    let root = Root::global();
    match effect {
        None => untrack(f),
        Some(handle) => {
            let prev_tracking = root.tracking.replace(true);
            root.effect_stack.borrow_mut().push(handle.id());
            let ret = f();
            root.effect_stack.borrow_mut().pop();
            root.tracking.set(prev_tracking);
            ret
        }
    }
}

/// Runs the root's async executor until every spawned effect future is either
/// settled or waiting on an external wake-up.
///
/// The engine never polls on its own: async effect runs make progress only
/// when the host calls this (or drives an equivalent outer loop).
pub fn run_async_tasks() {
    let root = Root::global();
    root.executor.borrow_mut().run_until_stalled();
}

/// Updates the process-wide [`Options`] in place.
///
/// # Example
/// ```
/// # use banyan_reactive::*;
/// # let _ = create_root(|| {
/// configure(|options| options.max_effect_chain = 50);
/// assert_eq!(options().max_effect_chain, 50);
/// # });
/// ```
pub fn configure(f: impl FnOnce(&mut Options)) {
    let root = Root::global();
    f(&mut root.options.borrow_mut());
}

/// A snapshot of the process-wide [`Options`].
pub fn options() -> Options {
    Root::global().options.borrow().clone()
}

/// Installs the diagnostic [`Hooks`], replacing any previous set.
pub fn set_hooks(hooks: Hooks) {
    *Root::global().hooks.borrow_mut() = Rc::new(hooks);
}

/// The recorded trigger history, oldest first. Empty unless
/// `introspection.enable_history` is set.
pub fn trigger_history() -> Vec<TriggerRecord> {
    Root::global().history.borrow().iter().cloned().collect()
}

/// How the scheduler treats suspected or proven effect cycles.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CycleHandling {
    /// FIFO ordering; cycles are only caught heuristically by the chain and
    /// per-effect trigger caps.
    #[default]
    None,
    /// Topological ordering; a proven cycle raises
    /// [`CycleDetected`](Error::CycleDetected).
    Throw,
    /// Topological ordering; a proven cycle is reported through the `warn`
    /// hook and execution continues.
    Warn,
    /// Topological ordering; the re-trigger closing the cycle is silently
    /// dropped.
    Break,
    /// Like `Throw`, but the offending edge is refused already when the
    /// dependency is registered.
    Strict,
}

/// What happens when a batch exceeds its chain or trigger caps.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MaxEffectReaction {
    /// Raise the corresponding error and unwind the batch.
    #[default]
    Throw,
    /// Report through the `warn` hook and trip a debug assertion.
    Debug,
    /// Report through the `warn` hook and keep going.
    Warn,
}

/// Per-effect policy for a run that returned a future.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AsyncMode {
    /// A new trigger before settlement aborts the in-flight run and starts a
    /// fresh one.
    #[default]
    Cancel,
    /// A new trigger before settlement is coalesced into a single follow-up
    /// run dispatched when the in-flight one settles.
    Queue,
    /// New triggers are dropped until the in-flight run settles.
    Ignore,
    /// Futures returned by effects are spawned but not tracked at all.
    Off,
}

/// Which trigger lineages the engine gathers per effect.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Lineages {
    /// Gather nothing.
    #[default]
    None,
    /// Record the touches that scheduled each effect.
    Touch,
    /// Record the dependencies each effect registers.
    Dependency,
    /// Record both.
    Both,
}

/// Introspection switches.
#[derive(Clone, Debug)]
pub struct Introspection {
    /// Keep a bounded history of touches, readable via
    /// [`trigger_history`].
    pub enable_history: bool,
    /// Capacity of the touch history ring.
    pub history_size: usize,
    /// Which per-effect lineages to gather.
    pub gather_reasons: Lineages,
}

impl Default for Introspection {
    fn default() -> Self {
        Self {
            enable_history: false,
            history_size: 256,
            gather_reasons: Lineages::None,
        }
    }
}

/// Process-wide engine options.
#[derive(Clone, Debug)]
pub struct Options {
    /// Maximum effect runs in one batch.
    pub max_effect_chain: usize,
    /// Maximum times one effect may be re-queued within a batch.
    pub max_trigger_per_batch: usize,
    /// Cycle handling policy.
    pub cycle_handling: CycleHandling,
    /// Reaction when a cap is exceeded.
    pub max_effect_reaction: MaxEffectReaction,
    /// Depth cap for deep-watch traversal.
    pub max_deep_watch_depth: usize,
    /// Skip tracking of prototype-inherited members.
    pub instance_members: bool,
    /// Do not register a dependency for the outer read of an accessor-backed
    /// property. Reads inside the accessor body still track.
    pub ignore_accessors: bool,
    /// Replacing a composite by a structurally similar one dispatches a
    /// recursive diff instead of a plain property touch.
    pub recursive_touching: bool,
    /// Default async policy for effects that do not override it.
    pub async_mode: AsyncMode,
    /// Introspection switches.
    pub introspection: Introspection,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_effect_chain: 100,
            max_trigger_per_batch: 10,
            cycle_handling: CycleHandling::None,
            max_effect_reaction: MaxEffectReaction::Throw,
            max_deep_watch_depth: 100,
            instance_members: true,
            ignore_accessors: true,
            recursive_touching: true,
            async_mode: AsyncMode::Cancel,
            introspection: Introspection::default(),
        }
    }
}

/// Why an effect was scheduled or what it registered, for diagnostics.
#[derive(Clone, Debug)]
pub struct TriggerRecord {
    /// The object involved.
    pub object: ObjectId,
    /// The change, when the record describes a touch.
    pub evolution: Option<Evolution>,
    /// Whether this records a touch or a dependency registration.
    pub kind: TriggerKind,
}

/// Discriminates [`TriggerRecord`]s.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerKind {
    /// The effect was scheduled by this change.
    Touch,
    /// The effect registered a dependency on this object.
    Dependency,
}

/// Diagnostic callbacks invoked at engine decision points.
///
/// All fields are optional; the engine never formats or prints anything
/// itself beyond handing structured data to these hooks.
#[derive(Default)]
pub struct Hooks {
    /// An effect run is starting.
    pub enter: Option<Box<dyn Fn(EffectHandle)>>,
    /// An effect run has finished.
    pub leave: Option<Box<dyn Fn(EffectHandle)>>,
    /// Effects were submitted to the scheduler; the second argument is the
    /// effect whose run caused the submission, if any.
    pub chain: Option<Box<dyn Fn(&[EffectHandle], Option<EffectHandle>)>>,
    /// A batch opened.
    pub begin_chain: Option<Box<dyn Fn()>>,
    /// A batch closed.
    pub end_chain: Option<Box<dyn Fn()>>,
    /// An object was touched.
    pub touched: Option<Box<dyn Fn(Obj, &Evolution)>>,
    /// A trigger was skipped because the target effect was already running.
    pub skip_running_effect: Option<Box<dyn Fn(EffectHandle)>>,
    /// An orphan effect was reaped by root disposal.
    pub garbage_collected: Option<Box<dyn Fn(EffectHandle)>>,
    /// A non-fatal condition worth reporting.
    pub warn: Option<Box<dyn Fn(&str)>>,
}
