use crate::bridge;
use crate::context::{Context, Controller};
use crate::convert;
use crate::error::{Error, Result};
use crate::guard::Shared;
use crate::listener;
use crate::plain::Plain;
use crate::queue;
use crate::reactive::{ArrayProxy, MapProxy, Value};
use crate::reconcile;
use futures::channel::mpsc;
use futures::prelude::*;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::Poll;
use tracing::warn;
use yrs::updates::decoder::Decode;
use yrs::{Array, Doc, Map, Origin, ReadTxn, StateVector, Transact, Update};

/// The origin tag carried by every doc transaction the bridge opens.
///
/// Remote listeners can filter update events by it; no other code path may
/// write with this origin.
pub const ORIGIN: &str = "yrs-reactive";

/// The [`Origin`] used to tag bridge transactions.
pub fn origin() -> Origin {
    Origin::from(ORIGIN)
}

/// A live binding between one doc root and a tree of reactive controllers.
///
/// Writes on controllers are planned, validated and queued synchronously,
/// then flushed into a single origin-tagged doc transaction per wakeup:
/// either poll the binding as a future from your executor, or call
/// [`Binding::flush`] at your own checkpoints. Remote doc transactions are
/// reconciled back onto the controllers. Dropping the binding disposes it.
pub struct Binding {
    ctx: Arc<Context>,
    root: Shared,
    root_ctrl: Controller,
    get_root: Box<dyn Fn(&Doc) -> Shared>,
    bootstrapped: AtomicBool,
    rx: mpsc::Receiver<()>,
}

impl Binding {
    /// Binds `doc` through the root container `get_root` selects.
    pub fn new(doc: &Doc, get_root: impl Fn(&Doc) -> Shared + 'static) -> Result<Self> {
        Self::create(doc, Box::new(get_root), None)
    }

    /// Binds `doc` and merges `initial` into the root first, preserving
    /// remote-only keys: the initial state is applied as the encoded state of
    /// a temporary doc filled with it.
    pub fn with_initial(
        doc: &Doc,
        get_root: impl Fn(&Doc) -> Shared + 'static,
        initial: impl Into<Plain>,
    ) -> Result<Self> {
        Self::create(doc, Box::new(get_root), Some(initial.into()))
    }

    fn create(
        doc: &Doc,
        get_root: Box<dyn Fn(&Doc) -> Shared>,
        initial: Option<Plain>,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel(1);
        let ctx = Arc::new(Context::new(doc.clone(), tx));
        let root = get_root(doc);
        if let Some(initial) = initial {
            let update = encode_initial(&*get_root, &initial)?;
            let mut txn = doc.transact_mut_with(origin());
            let update = Update::decode_v1(&update).map_err(|e| Error::Apply(e.to_string()))?;
            txn.apply_update(update)
                .map_err(|e| Error::Apply(e.to_string()))?;
        }
        let root_ctrl = {
            let txn = doc.transact();
            bridge::materialize(&ctx, &txn, root.clone())
        };
        let sub = listener::install(&ctx, root.clone());
        ctx.register_disposer(Box::new(move || drop(sub)));
        Ok(Self {
            ctx,
            root,
            root_ctrl,
            get_root,
            bootstrapped: AtomicBool::new(false),
            rx,
        })
    }

    /// The root controller.
    pub fn root(&self) -> Value {
        self.root_ctrl.as_value()
    }

    /// The root controller as a map, if the root is one.
    pub fn root_map(&self) -> Option<MapProxy> {
        match &self.root_ctrl {
            Controller::Map(m) => Some(m.clone()),
            _ => None,
        }
    }

    /// The root controller as an array, if the root is one.
    pub fn root_array(&self) -> Option<ArrayProxy> {
        match &self.root_ctrl {
            Controller::Array(a) => Some(a.clone()),
            _ => None,
        }
    }

    /// The bound doc.
    pub fn doc(&self) -> &Doc {
        self.ctx.doc()
    }

    /// Drains pending controller writes into one doc transaction now.
    pub fn flush(&self) -> Result<()> {
        queue::flush(&self.ctx)
    }

    /// Merges `initial` into an empty root in a single origin-tagged
    /// transaction. Warns and does nothing when the root is not empty or the
    /// binding was already bootstrapped.
    pub fn bootstrap(&self, initial: impl Into<Plain>) -> Result<()> {
        if self.ctx.is_disposed() {
            return Err(Error::Disposed);
        }
        if self.bootstrapped.load(Ordering::Acquire) {
            warn!("already bootstrapped; ignoring");
            return Ok(());
        }
        let doc = self.ctx.doc().clone();
        let non_empty = {
            let txn = doc.transact();
            match &self.root {
                Shared::Map(m) => m.len(&txn) > 0,
                Shared::Array(a) => a.len(&txn) > 0,
            }
        };
        if non_empty {
            warn!("root is not empty; refusing to bootstrap");
            return Ok(());
        }
        let initial = initial.into();
        let update = encode_initial(&*self.get_root, &initial)?;
        {
            let mut txn = doc.transact_mut_with(origin());
            let update = Update::decode_v1(&update).map_err(|e| Error::Apply(e.to_string()))?;
            txn.apply_update(update)
                .map_err(|e| Error::Apply(e.to_string()))?;
        }
        self.bootstrapped.store(true, Ordering::Release);
        // The bridge origin suppresses the deep observer for this
        // transaction; line the root controller up here instead.
        let txn = doc.transact();
        self.ctx.with_reconciling_lock(|| match (&self.root, &self.root_ctrl) {
            (Shared::Map(m), Controller::Map(p)) => {
                reconcile::reconcile_map(&self.ctx, &txn, m, p)
            }
            (Shared::Array(a), Controller::Array(p)) => {
                reconcile::reconcile_array(&self.ctx, &txn, a, p)
            }
            _ => {}
        });
        Ok(())
    }

    /// Stops propagation in both directions. Idempotent; local controllers
    /// keep working detached.
    pub fn dispose(&self) {
        self.ctx.dispose();
    }

    /// Returns true once the binding was disposed.
    pub fn is_disposed(&self) -> bool {
        self.ctx.is_disposed()
    }
}

impl Future for Binding {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut std::task::Context) -> Poll<Self::Output> {
        if Pin::new(&mut self.rx).poll_next(cx).is_ready() {
            Poll::Ready(queue::flush(&self.ctx))
        } else {
            Poll::Pending
        }
    }
}

impl Drop for Binding {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Binding")
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

fn encode_initial(get_root: &dyn Fn(&Doc) -> Shared, initial: &Plain) -> Result<Vec<u8>> {
    let temp = Doc::new();
    let root = get_root(&temp);
    {
        let mut txn = temp.transact_mut();
        match (&root, initial) {
            (Shared::Map(m), Plain::Map(entries)) => convert::fill_map(&mut txn, m, entries)?,
            (Shared::Array(a), Plain::List(items)) => convert::fill_array(&mut txn, a, items)?,
            _ => {
                return Err(Error::unsupported(
                    "$",
                    "initial state does not match the root container kind",
                ))
            }
        }
    }
    let txn = temp.transact();
    Ok(txn.encode_state_as_update_v1(&StateVector::default()))
}
