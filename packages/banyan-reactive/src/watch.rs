//! Value-change watching, one-shot predicate awaiting, and bi-directional
//! binding. Thin layers above the effect engine.

use std::cell::RefCell;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use crate::effect::{effect, EffectHandle};
use crate::error::{Error, Result};
use crate::reactive::{reactive_obj, Obj};
use crate::root::Root;
use crate::value::{Key, Value};

/// What a [`watch`] observes: a reactive object as a whole, or a derivation
/// function.
pub enum WatchSource {
    /// Any property change of the object fires the callback.
    Object(Obj),
    /// The function is re-evaluated under tracking; the callback fires when
    /// the produced value changes.
    Derived(Box<dyn FnMut() -> Value>),
}

impl From<Obj> for WatchSource {
    fn from(o: Obj) -> Self {
        WatchSource::Object(o)
    }
}

/// Builds a derivation [`WatchSource`].
pub fn derived(f: impl FnMut() -> Value + 'static) -> WatchSource {
    WatchSource::Derived(Box::new(f))
}

/// Options accepted by [`watch`].
#[derive(Clone, Copy, Default)]
pub struct WatchOptions {
    /// Fire the callback once, synchronously, on setup.
    pub immediate: bool,
    /// Additionally watch the produced subtree deeply.
    pub deep: bool,
}

/// Re-runs `cb(new, old)` whenever the observed source changes.
///
/// For derivation sources the callback is suppressed when the produced value
/// compares equal to the previous one — unless `deep` is set, in which case
/// a change anywhere inside the produced subtree fires it regardless of the
/// (identical) outer value.
///
/// # Example
/// ```
/// # use banyan_reactive::*;
/// # use std::cell::Cell;
/// # use std::rc::Rc;
/// # let _ = create_root(|| {
/// let state = reactive_obj(record! { n: 1 });
/// let observed = Rc::new(Cell::new(0));
/// let seen = observed.clone();
/// watch(
///     derived(move || state.get("n")),
///     move |new, _old| seen.set(new.as_int().unwrap()),
///     WatchOptions { immediate: true, ..Default::default() },
/// );
/// assert_eq!(observed.get(), 1);
/// state.set("n", 7.into()).unwrap();
/// assert_eq!(observed.get(), 7);
/// # });
/// ```
pub fn watch(
    source: impl Into<WatchSource>,
    mut cb: impl FnMut(&Value, &Value) + 'static,
    options: WatchOptions,
) -> EffectHandle {
    let source = source.into();
    let WatchOptions { immediate, deep } = options;
    match source {
        WatchSource::Object(o) => {
            let view = reactive_obj(o);
            let mut prev: Option<Value> = None;
            effect(move |scope| {
                let root = Root::global();
                root.depend(view.id(), Key::All);
                if deep {
                    crate::deep::traverse_and_mark(root, scope.id(), view.id());
                }
                let value = Value::Obj(view);
                let old = prev.replace(value.clone());
                match old {
                    // Object identity never changes; every reaction is a
                    // change by definition.
                    Some(old) => cb(&value, &old),
                    None if immediate => cb(&value, &Value::Unit),
                    None => {}
                }
            })
        }
        WatchSource::Derived(mut f) => {
            let mut prev: Option<Value> = None;
            effect(move |scope| {
                let value = f();
                if deep {
                    if let Some(o) = value.as_obj() {
                        crate::deep::traverse_and_mark(Root::global(), scope.id(), o.id());
                    }
                }
                let old = prev.replace(value.clone());
                match old {
                    Some(old) => {
                        if deep || old != value {
                            cb(&value, &old);
                        }
                    }
                    None if immediate => cb(&value, &Value::Unit),
                    None => {}
                }
            })
        }
    }
}

struct WhenState {
    effect: Option<EffectHandle>,
    result: Option<Result<Value>>,
    waker: Option<Waker>,
}

/// A lazy one-shot future resolving with the first truthy value of its
/// predicate. See [`when`].
pub struct When {
    state: Rc<RefCell<WhenState>>,
    pred: Option<Box<dyn FnMut() -> Value>>,
    deadline: Option<Instant>,
}

/// Resolves when `pred` becomes truthy under reactive re-evaluation.
///
/// Lazy: the watching effect is only installed on the first poll. The helper
/// effect's teardown is deferred past the batch that resolved it, so the
/// scheduler queue never holds a stopped effect.
pub fn when(pred: impl FnMut() -> Value + 'static) -> When {
    When {
        state: Rc::new(RefCell::new(WhenState {
            effect: None,
            result: None,
            waker: None,
        })),
        pred: Some(Box::new(pred)),
        deadline: None,
    }
}

/// [`when`] with a deadline. The engine owns no timer: the deadline is
/// checked whenever the predicate re-evaluates, rejecting with
/// [`Error::TimeoutExpired`].
pub fn when_timeout(pred: impl FnMut() -> Value + 'static, timeout: Duration) -> When {
    let mut w = when(pred);
    w.deadline = Some(Instant::now() + timeout);
    w
}

impl std::future::Future for When {
    type Output = Result<Value>;

    fn poll(self: std::pin::Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        {
            let mut state = this.state.borrow_mut();
            if let Some(result) = state.result.take() {
                state.effect = None;
                return Poll::Ready(result);
            }
            state.waker = Some(cx.waker().clone());
        }
        if let Some(mut pred) = this.pred.take() {
            let state = Rc::clone(&this.state);
            let deadline = this.deadline;
            let handle = effect(move |scope| {
                let value = pred();
                let mut st = state.borrow_mut();
                if st.result.is_some() {
                    return;
                }
                let resolved = if value.is_truthy() {
                    Some(Ok(value))
                } else if deadline.is_some_and(|d| Instant::now() >= d) {
                    Some(Err(Error::TimeoutExpired))
                } else {
                    None
                };
                if let Some(result) = resolved {
                    st.result = Some(result);
                    let waker = st.waker.take();
                    drop(st);
                    let h = scope.handle();
                    crate::batch::post_batch_cleanup(Root::global(), move || h.stop());
                    if let Some(waker) = waker {
                        waker.wake();
                    }
                }
            });
            let mut state = this.state.borrow_mut();
            if let Some(result) = state.result.take() {
                return Poll::Ready(result);
            }
            state.effect = Some(handle);
        }
        Poll::Pending
    }
}

impl Drop for When {
    fn drop(&mut self) {
        if let Some(handle) = self.state.borrow_mut().effect.take() {
            handle.stop();
        }
    }
}

/// A bi-directional binding between a reactive value and an external mutable
/// value. See [`bi_di`].
pub struct BiDi {
    effect: EffectHandle,
    set: Box<dyn FnMut(Value)>,
}

/// Binds a reactive value to an external value and vice-versa.
///
/// The binding effect pushes every reactive change outward through
/// `external_set` (untracked). External changes come back in through
/// [`BiDi::provide`], which suppresses the circular re-notification by
/// removing the binding effect from the batch its own write just scheduled.
pub fn bi_di(
    mut external_set: impl FnMut(&Value) + 'static,
    mut get: impl FnMut() -> Value + 'static,
    set: impl FnMut(Value) + 'static,
) -> BiDi {
    let effect = effect(move |_| {
        let value = get();
        crate::root::untrack(|| external_set(&value));
    });
    BiDi {
        effect,
        set: Box::new(set),
    }
}

impl BiDi {
    /// Feeds an external change into the reactive side without echoing it
    /// back out through the binding.
    pub fn provide(&mut self, value: Value) -> Result<()> {
        let root = Root::global();
        let effect = self.effect;
        crate::batch::batch(|| {
            (self.set)(value);
            crate::batch::dequeue(root, effect.id());
        })
    }

    /// Tears the binding down.
    pub fn stop(&self) {
        self.effect.stop();
    }
}
