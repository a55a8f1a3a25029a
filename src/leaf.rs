use crate::context::{Context, Controller, Slot};
use crate::guard::Leaf;
use crate::reactive::{ArrayProxy, MapProxy, Value, WeakArrayProxy, WeakMapProxy};
use std::sync::{Arc, Weak};
use yrs::{Doc, Observable, ReadTxn, Transact};

/// An opaque wrapper around a leaf CRDT node.
///
/// Leaves are never mirrored structurally: the wrapper hands out the typed
/// ref so applications can use the leaf's own API inside their own doc
/// transactions, and the bridge observes the leaf natively to keep parent
/// watchers informed.
#[derive(Clone)]
pub struct LeafProxy {
    inner: Arc<LeafInner>,
}

struct LeafInner {
    leaf: Leaf,
    doc: Doc,
}

impl LeafProxy {
    pub(crate) fn new(leaf: Leaf, doc: Doc) -> Self {
        Self {
            inner: Arc::new(LeafInner { leaf, doc }),
        }
    }

    /// The wrapped leaf.
    pub fn leaf(&self) -> &Leaf {
        &self.inner.leaf
    }

    /// Projects the leaf to its string form in a fresh read transaction.
    pub fn string(&self) -> String {
        let txn = self.inner.doc.transact();
        self.inner.leaf.get_string(&txn)
    }

    /// Projects the leaf to its string form in the caller's transaction.
    pub fn string_in<T: ReadTxn>(&self, txn: &T) -> String {
        self.inner.leaf.get_string(txn)
    }

    pub(crate) fn id(&self) -> crate::guard::SharedId {
        self.inner.leaf.id()
    }
}

impl PartialEq for LeafProxy {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl std::fmt::Debug for LeafProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let kind = match self.inner.leaf {
            Leaf::Text(_) => "text",
            Leaf::XmlText(_) => "xml text",
            Leaf::XmlElement(_) => "xml element",
            Leaf::XmlFragment(_) => "xml fragment",
        };
        f.debug_struct("LeafProxy")
            .field("kind", &kind)
            .finish_non_exhaustive()
    }
}

enum WeakParent {
    Map(WeakMapProxy),
    Array(WeakArrayProxy),
}

/// Wraps a leaf for a parent slot and observes it natively. When the leaf
/// changes, the same wrapper is re-asserted on the parent under the
/// reentrancy lock, so parent watchers fire without emitting a doc-bound op.
pub(crate) fn wrap(ctx: &Arc<Context>, leaf: Leaf, parent: &Controller, slot: Slot) -> LeafProxy {
    let proxy = LeafProxy::new(leaf.clone(), ctx.doc().clone());
    let weak_ctx = Arc::downgrade(ctx);
    let weak_parent = match parent {
        Controller::Map(m) => WeakParent::Map(m.downgrade()),
        Controller::Array(a) => WeakParent::Array(a.downgrade()),
    };
    let touch_proxy = proxy.clone();
    let touch = Arc::new(move || touch_parent(&weak_ctx, &weak_parent, &slot, &touch_proxy));
    let sub = match &leaf {
        Leaf::Text(t) => {
            let touch = touch.clone();
            t.observe(move |_txn, _e| touch())
        }
        Leaf::XmlText(t) => {
            let touch = touch.clone();
            t.observe(move |_txn, _e| touch())
        }
        Leaf::XmlElement(e) => {
            let touch = touch.clone();
            e.observe(move |_txn, _e| touch())
        }
        Leaf::XmlFragment(fr) => {
            let touch = touch.clone();
            fr.observe(move |_txn, _e| touch())
        }
    };
    ctx.register_subscription(leaf.id(), Box::new(move || drop(sub)));
    proxy
}

fn touch_parent(ctx: &Weak<Context>, parent: &WeakParent, slot: &Slot, proxy: &LeafProxy) {
    let Some(ctx) = ctx.upgrade() else {
        return;
    };
    if ctx.is_disposed() {
        return;
    }
    ctx.with_reconciling_lock(|| match (parent, slot) {
        (WeakParent::Map(weak), Slot::Key(key)) => {
            if let Some(map) = weak.upgrade() {
                touch_map_slot(&map, key, proxy);
            }
        }
        (WeakParent::Array(weak), Slot::Index(index)) => {
            if let Some(arr) = weak.upgrade() {
                touch_array_slot(&arr, *index, proxy);
            }
        }
        _ => {}
    });
}

fn touch_map_slot(map: &MapProxy, key: &str, proxy: &LeafProxy) {
    match map.peek(key) {
        Some(Value::Leaf(current)) if current == *proxy => {
            let _ = map.insert(key, Value::Leaf(current));
        }
        _ => {}
    }
}

fn touch_array_slot(arr: &ArrayProxy, index: usize, proxy: &LeafProxy) {
    let hit = match arr.peek(index) {
        Some(Value::Leaf(current)) if current == *proxy => Some(index),
        // The slot may have shifted under splices; find the wrapper again.
        _ => (0..arr.len()).find(|ix| match arr.peek(*ix) {
            Some(Value::Leaf(current)) => current == *proxy,
            _ => false,
        }),
    };
    if let Some(ix) = hit {
        arr.touch_index(ix);
    }
}
