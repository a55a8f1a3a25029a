use crate::guard::{Shared, SharedId};
use crate::queue::Pending;
use crate::reactive::{ArrayProxy, MapProxy, Value, WeakArrayProxy, WeakMapProxy};
use fnv::FnvHashMap;
use futures::channel::mpsc;
use futures::prelude::*;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use yrs::Doc;

/// A materialized controller, strongly held.
#[derive(Clone)]
pub(crate) enum Controller {
    Map(MapProxy),
    Array(ArrayProxy),
}

impl Controller {
    pub(crate) fn id(&self) -> usize {
        match self {
            Controller::Map(m) => m.id(),
            Controller::Array(a) => a.id(),
        }
    }

    pub(crate) fn as_value(&self) -> Value {
        match self {
            Controller::Map(m) => Value::Map(m.clone()),
            Controller::Array(a) => Value::Array(a.clone()),
        }
    }
}

enum WeakController {
    Map(WeakMapProxy),
    Array(WeakArrayProxy),
}

impl WeakController {
    fn upgrade(&self) -> Option<Controller> {
        match self {
            WeakController::Map(m) => m.upgrade().map(Controller::Map),
            WeakController::Array(a) => a.upgrade().map(Controller::Array),
        }
    }

    fn ctrl_id(&self) -> usize {
        match self {
            WeakController::Map(m) => m.id(),
            WeakController::Array(a) => a.id(),
        }
    }
}

/// A slot on a parent controller, addressed for upgrades and leaf touches.
#[derive(Clone, Debug)]
pub(crate) enum Slot {
    Key(String),
    Index(usize),
}

pub(crate) type Disposer = Box<dyn FnOnce()>;

#[derive(Default)]
struct CtxState {
    shared_to_ctrl: FnvHashMap<SharedId, WeakController>,
    ctrl_to_shared: FnvHashMap<usize, Shared>,
    subs: FnvHashMap<SharedId, Disposer>,
    disposers: Vec<Disposer>,
}

/// Per-binding state: identity caches, reentrancy flag, disposers, pending
/// write tables and the flush wakeup signal.
pub(crate) struct Context {
    doc: Doc,
    reconciling: AtomicBool,
    disposed: AtomicBool,
    flush_scheduled: AtomicBool,
    state: Mutex<CtxState>,
    pending: Mutex<Pending>,
    signal: mpsc::Sender<()>,
}

impl Context {
    pub(crate) fn new(doc: Doc, signal: mpsc::Sender<()>) -> Self {
        Self {
            doc,
            reconciling: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            flush_scheduled: AtomicBool::new(false),
            state: Mutex::new(CtxState::default()),
            pending: Mutex::new(Pending::default()),
            signal,
        }
    }

    pub(crate) fn doc(&self) -> &Doc {
        &self.doc
    }

    /// Runs `f` with the reentrancy flag raised. Save/restore rather than
    /// set/clear, so nested invocations are safe.
    pub(crate) fn with_reconciling_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        let prev = self.reconciling.swap(true, Ordering::AcqRel);
        let out = f();
        self.reconciling.store(prev, Ordering::Release);
        out
    }

    pub(crate) fn is_reconciling(&self) -> bool {
        self.reconciling.load(Ordering::Acquire)
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// The controller paired with a shared container, if it is still alive.
    pub(crate) fn controller_for(&self, id: SharedId) -> Option<Controller> {
        let mut state = self.state.lock();
        match state.shared_to_ctrl.get(&id) {
            Some(weak) => match weak.upgrade() {
                Some(ctrl) => Some(ctrl),
                None => {
                    let ctrl_id = weak.ctrl_id();
                    state.shared_to_ctrl.remove(&id);
                    state.ctrl_to_shared.remove(&ctrl_id);
                    None
                }
            },
            None => None,
        }
    }

    /// The shared container paired with a controller.
    pub(crate) fn shared_for(&self, ctrl_id: usize) -> Option<Shared> {
        self.state.lock().ctrl_to_shared.get(&ctrl_id).cloned()
    }

    /// Records a shared/controller pair in both identity caches.
    pub(crate) fn record_pair(&self, shared: Shared, ctrl: &Controller) {
        let mut state = self.state.lock();
        let weak = match ctrl {
            Controller::Map(m) => WeakController::Map(m.downgrade()),
            Controller::Array(a) => WeakController::Array(a.downgrade()),
        };
        state.shared_to_ctrl.insert(shared.id(), weak);
        state.ctrl_to_shared.insert(ctrl.id(), shared);
    }

    /// Registers the disposer for a shared node's subscription, replacing and
    /// running any previous one.
    pub(crate) fn register_subscription(&self, id: SharedId, disposer: Disposer) {
        let prev = {
            let mut state = self.state.lock();
            state.subs.insert(id, disposer)
        };
        if let Some(prev) = prev {
            prev();
        }
    }

    /// Registers a disposer run at teardown.
    pub(crate) fn register_disposer(&self, disposer: Disposer) {
        self.state.lock().disposers.push(disposer);
    }

    pub(crate) fn pending(&self) -> parking_lot::MutexGuard<'_, Pending> {
        self.pending.lock()
    }

    /// Snapshots and clears the pending tables, rearming the scheduler.
    pub(crate) fn take_pending(&self) -> Pending {
        self.flush_scheduled.store(false, Ordering::Release);
        std::mem::take(&mut *self.pending.lock())
    }

    /// Arms the flush wakeup unless one is already armed.
    pub(crate) fn schedule_flush(&self) {
        if self.is_disposed() {
            return;
        }
        if !self.flush_scheduled.swap(true, Ordering::AcqRel) {
            self.signal.clone().send(()).now_or_never();
        }
    }

    /// Tears the context down: runs every disposer, clears caches and pending
    /// writes. Idempotent.
    pub(crate) fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let (subs, disposers) = {
            let mut state = self.state.lock();
            state.shared_to_ctrl.clear();
            state.ctrl_to_shared.clear();
            (
                std::mem::take(&mut state.subs),
                std::mem::take(&mut state.disposers),
            )
        };
        for (_, disposer) in subs {
            disposer();
        }
        for disposer in disposers {
            disposer();
        }
        *self.pending.lock() = Pending::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconciling_lock_nests() {
        let (tx, _rx) = mpsc::channel(1);
        let ctx = Context::new(Doc::new(), tx);
        assert!(!ctx.is_reconciling());
        ctx.with_reconciling_lock(|| {
            assert!(ctx.is_reconciling());
            ctx.with_reconciling_lock(|| assert!(ctx.is_reconciling()));
            assert!(ctx.is_reconciling());
        });
        assert!(!ctx.is_reconciling());
    }

    #[test]
    fn dispose_is_idempotent() {
        let (tx, _rx) = mpsc::channel(1);
        let ctx = Context::new(Doc::new(), tx);
        let count = std::rc::Rc::new(std::cell::Cell::new(0));
        let c = count.clone();
        ctx.register_disposer(Box::new(move || c.set(c.get() + 1)));
        ctx.dispose();
        ctx.dispose();
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn register_subscription_replaces_the_previous_one() {
        let (tx, _rx) = mpsc::channel(1);
        let ctx = Context::new(Doc::new(), tx);
        let doc = Doc::new();
        let root = doc.get_or_insert_map("root");
        let id = crate::guard::id_of(&root);
        let dropped = std::rc::Rc::new(std::cell::Cell::new(false));
        let d = dropped.clone();
        ctx.register_subscription(id, Box::new(move || d.set(true)));
        assert!(!dropped.get());
        ctx.register_subscription(id, Box::new(|| {}));
        assert!(dropped.get());
    }
}
