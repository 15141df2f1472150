//! Fine-grained reactive runtime for dynamic object graphs.
//!
//! Banyan tracks which effects read which properties of which objects, and
//! re-runs exactly the affected effects when those properties change. On top
//! of the plain dependency machinery it carries two deep-change subsystems:
//! *deep watching* (changes anywhere in a subtree bubble up through parent
//! back-references) and *recursive diffing* (replacing a subtree by a
//! structurally similar one notifies only readers of the leaves that
//! actually changed, filtered by the origin property of the replacement).
//!
//! All state lives in a thread-local root created with [`create_root`]:
//!
//! ```rust
//! use banyan_reactive::*;
//!
//! let _ = create_root(|| {
//!     let state = reactive_obj(record! { count: 0 });
//!     let stop = effect(move |_| {
//!         let _ = state.get("count");
//!     });
//!     state.set("count", 1.into()).unwrap(); // re-runs the effect
//!     stop.stop();
//! });
//! ```

#![warn(missing_docs)]

mod batch;
mod deep;
mod diff;
mod effect;
mod error;
mod macros;
mod notify;
mod object;
mod reactive;
mod root;
#[cfg(feature = "serde")]
mod serde_impls;
mod value;
mod watch;

pub use batch::{batch, batch_effects};
pub use deep::{deep_watch, DeepWatchOptions};
pub use effect::{
    cleanup, effect, effect_with, spawn, track_effect, EffectHandle, EffectOptions, EffectResult,
    EffectScope, IntoEffectResult,
};
pub use error::{Error, Result};
pub use object::{ObjectId, ObjectKind};
pub use reactive::{
    create_list, create_map, create_record, create_record_with_proto, create_set, is_reactive,
    mark_unreactive_keys, non_reactive, non_reactive_proto, non_reactive_when, reactive,
    reactive_obj, unwrap, Obj,
};
pub use root::{
    configure, create_root, options, run_async_tasks, set_hooks, trigger_history, untrack,
    with_effect, AsyncMode, CycleHandling, Hooks, Introspection, Lineages, MaxEffectReaction,
    Options, RootHandle, TriggerKind, TriggerRecord,
};
pub use value::{Evolution, Key, MapKey, Opaque, Value};
pub use watch::{bi_di, derived, watch, when, when_timeout, BiDi, WatchOptions, WatchSource, When};

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    use crate::*;

    /// One gate per effect run, so tests control when async runs settle.
    type Gates = Rc<RefCell<Vec<futures::channel::oneshot::Sender<()>>>>;

    fn release_gates(gates: &Gates) {
        for tx in gates.borrow_mut().drain(..) {
            let _ = tx.send(());
        }
    }

    #[test]
    fn async_cancel_discards_superseded_runs() {
        let _ = create_root(|| {
            let state = reactive_obj(record! { id: 1 });
            let outcomes: Rc<RefCell<Vec<i64>>> = Rc::new(RefCell::new(Vec::new()));
            let gates: Gates = Rc::new(RefCell::new(Vec::new()));

            let seen = outcomes.clone();
            let gate = gates.clone();
            let handle = effect(move |_| {
                let local = state.get("id").as_int().unwrap();
                let (tx, rx) = futures::channel::oneshot::channel();
                gate.borrow_mut().push(tx);
                let seen = seen.clone();
                spawn(async move {
                    let _ = rx.await;
                    seen.borrow_mut().push(local);
                })
            });

            run_async_tasks();
            assert!(outcomes.borrow().is_empty());

            // A newer trigger before settlement cancels the first run.
            state.set("id", 2.into()).unwrap();
            assert_eq!(handle.last_error(), Some(Error::EffectCanceled));

            release_gates(&gates);
            run_async_tasks();
            assert_eq!(*outcomes.borrow(), vec![2]);
        });
    }

    #[test]
    fn async_queue_coalesces_follow_up_runs() {
        let _ = create_root(|| {
            let state = reactive_obj(record! { id: 1 });
            let runs = Rc::new(Cell::new(0));
            let gates: Gates = Rc::new(RefCell::new(Vec::new()));

            let count = runs.clone();
            let gate = gates.clone();
            effect_with(
                EffectOptions {
                    async_mode: Some(AsyncMode::Queue),
                    ..Default::default()
                },
                move |_| {
                    count.set(count.get() + 1);
                    let _ = state.get("id");
                    let (tx, rx) = futures::channel::oneshot::channel();
                    gate.borrow_mut().push(tx);
                    spawn(async move {
                        let _ = rx.await;
                    })
                },
            );
            assert_eq!(runs.get(), 1);

            // Two triggers while in flight coalesce into one follow-up.
            state.set("id", 2.into()).unwrap();
            state.set("id", 3.into()).unwrap();
            assert_eq!(runs.get(), 1);

            release_gates(&gates);
            run_async_tasks();
            assert_eq!(runs.get(), 2);

            release_gates(&gates);
            run_async_tasks();
            assert_eq!(runs.get(), 2); // nothing further queued
        });
    }

    #[test]
    fn async_ignore_drops_triggers_while_in_flight() {
        let _ = create_root(|| {
            let state = reactive_obj(record! { id: 1 });
            let runs = Rc::new(Cell::new(0));
            let gates: Gates = Rc::new(RefCell::new(Vec::new()));

            let count = runs.clone();
            let gate = gates.clone();
            effect_with(
                EffectOptions {
                    async_mode: Some(AsyncMode::Ignore),
                    ..Default::default()
                },
                move |_| {
                    count.set(count.get() + 1);
                    let _ = state.get("id");
                    let (tx, rx) = futures::channel::oneshot::channel();
                    gate.borrow_mut().push(tx);
                    spawn(async move {
                        let _ = rx.await;
                    })
                },
            );

            state.set("id", 2.into()).unwrap();
            release_gates(&gates);
            run_async_tasks();
            assert_eq!(runs.get(), 1); // the trigger was dropped, not queued

            state.set("id", 3.into()).unwrap();
            assert_eq!(runs.get(), 2); // settled: triggers act again
        });
    }

    #[test]
    fn tracked_restores_the_effect_across_await_points() {
        let _ = create_root(|| {
            let state = reactive_obj(record! { late: 0, early: 0 });
            let runs = Rc::new(Cell::new(0));
            let gates: Gates = Rc::new(RefCell::new(Vec::new()));

            let count = runs.clone();
            let gate = gates.clone();
            effect(move |scope| {
                count.set(count.get() + 1);
                let _ = state.get("early");
                let (tx, rx) = futures::channel::oneshot::channel();
                gate.borrow_mut().push(tx);
                spawn(async move {
                    let _ = rx.await;
                    // The native async machinery lost the active effect; the
                    // scope restores it for this continuation.
                    scope.tracked(|| {
                        let _ = state.get("late");
                    });
                })
            });
            release_gates(&gates);
            run_async_tasks();
            assert_eq!(runs.get(), 1);

            // The continuation's read registered a live dependency.
            state.set("late", 1.into()).unwrap();
            assert_eq!(runs.get(), 2);
        });
    }

    #[test]
    fn stopping_an_effect_purges_it_from_an_open_batch() {
        let _ = create_root(|| {
            let state = reactive_obj(record! { n: 0 });
            let runs = Rc::new(Cell::new(0));
            let count = runs.clone();
            let victim = effect(move |_| {
                count.set(count.get() + 1);
                let _ = state.get("n");
            });
            batch(|| {
                state.set("n", 1.into()).unwrap();
                victim.stop(); // queued, then stopped before the flush
            })
            .unwrap();
            assert_eq!(runs.get(), 1);
        });
    }

    #[test]
    fn computed_effects_cannot_write() {
        let _ = create_root(|| {
            let state = reactive_obj(record! { a: 0, out: 0 });
            let seen = Rc::new(RefCell::new(None));
            let inner = seen.clone();
            effect_with(
                EffectOptions {
                    computed: true,
                    ..Default::default()
                },
                move |_| {
                    let _ = state.get("a");
                    *inner.borrow_mut() = Some(state.set("out", 1.into()));
                },
            );
            assert_eq!(
                *seen.borrow(),
                Some(Err(Error::WriteInComputed))
            );
        });
    }

    #[test]
    fn effect_lineages_are_gathered_on_demand() {
        let _ = create_root(|| {
            configure(|options| options.introspection.gather_reasons = Lineages::Both);
            let state = reactive_obj(record! { n: 0 });
            let handle = effect(move |_| {
                let _ = state.get("n");
            });
            state.set("n", 1.into()).unwrap();
            let triggers = handle.last_triggers();
            assert!(triggers
                .iter()
                .any(|record| record.kind == TriggerKind::Dependency));
            assert!(triggers
                .iter()
                .any(|record| record.kind == TriggerKind::Touch));
        });
    }

    #[test]
    fn enter_and_leave_hooks_bracket_every_run() {
        let _ = create_root(|| {
            let depth = Rc::new(Cell::new(0i32));
            let max_depth = Rc::new(Cell::new(0i32));
            let enter_depth = depth.clone();
            let enter_max = max_depth.clone();
            let leave_depth = depth.clone();
            set_hooks(Hooks {
                enter: Some(Box::new(move |_| {
                    enter_depth.set(enter_depth.get() + 1);
                    enter_max.set(enter_max.get().max(enter_depth.get()));
                })),
                leave: Some(Box::new(move |_| {
                    leave_depth.set(leave_depth.get() - 1);
                })),
                ..Default::default()
            });
            let state = reactive_obj(record! { n: 0 });
            effect(move |_| {
                let _ = state.get("n");
            });
            state.set("n", 1.into()).unwrap();
            assert_eq!(depth.get(), 0);
            assert!(max_depth.get() >= 1);
        });
    }

    #[test]
    fn effects_observe_writes_from_earlier_effects_in_the_batch() {
        let _ = create_root(|| {
            let state = reactive_obj(record! { input: 0, derived: 0 });
            let observed = Rc::new(RefCell::new(Vec::new()));

            effect(move |_| {
                let input = state.get("input").as_int().unwrap();
                let _ = state.set("derived", (input * 2).into());
            });
            let seen = observed.clone();
            effect(move |_| {
                seen.borrow_mut()
                    .push(state.get("derived").as_int().unwrap());
            });

            state.set("input", 3.into()).unwrap();
            assert_eq!(observed.borrow().last(), Some(&6));
        });
    }
}
