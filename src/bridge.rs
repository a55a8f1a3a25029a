use crate::context::{Context, Controller, Slot};
use crate::convert::{self, validate_deep};
use crate::error::Result;
use crate::guard::{classify, id_of, Node, Shared};
use crate::leaf;
use crate::plain::Plain;
use crate::plan::{plan_array, plan_map};
use crate::queue;
use crate::reactive::{ArrayProxy, MapProxy, Op, Segment, Value};
use std::sync::Arc;
use tracing::warn;
use yrs::{Array, ArrayRef, Map, MapRef, Out, ReadTxn, Transact};

/// Pairs a shared container with a controller, creating one if none is
/// cached. Container children enter as plain snapshots and are upgraded on
/// first read through the lazy hook; leaves are wrapped opaquely right away
/// so their native observers are in place.
pub(crate) fn materialize<T: ReadTxn>(ctx: &Arc<Context>, txn: &T, shared: Shared) -> Controller {
    if let Some(existing) = ctx.controller_for(shared.id()) {
        return existing;
    }
    match shared {
        Shared::Map(m) => {
            let proxy = MapProxy::empty();
            let ctrl = Controller::Map(proxy.clone());
            ctx.record_pair(Shared::Map(m.clone()), &ctrl);
            let entries: Vec<(String, Out)> =
                m.iter(txn).map(|(k, v)| (k.to_string(), v)).collect();
            for (key, out) in entries {
                let value = initial_slot_value(ctx, txn, &ctrl, Slot::Key(key.clone()), out);
                proxy.replace_silent(&key, value);
            }
            install_map_hooks(ctx, &m, &proxy);
            ctrl
        }
        Shared::Array(a) => {
            let proxy = ArrayProxy::empty();
            let ctrl = Controller::Array(proxy.clone());
            ctx.record_pair(Shared::Array(a.clone()), &ctrl);
            let items: Vec<Out> = a.iter(txn).collect();
            for (ix, out) in items.into_iter().enumerate() {
                let value = initial_slot_value(ctx, txn, &ctrl, Slot::Index(ix), out);
                proxy.set_silent(ix, value);
            }
            install_array_hooks(ctx, &a, &proxy);
            ctrl
        }
    }
}

/// The value a doc entry takes inside a freshly materialized controller.
pub(crate) fn initial_slot_value<T: ReadTxn>(
    ctx: &Arc<Context>,
    txn: &T,
    parent: &Controller,
    slot: Slot,
    out: Out,
) -> Value {
    match classify(out) {
        Node::Primitive(any) => Value::Plain(convert::any_to_plain(&any)),
        Node::Leaf(l) => Value::Leaf(leaf::wrap(ctx, l, parent, slot)),
        Node::Map(m) => Value::Plain(convert::shared_to_plain(txn, &Out::YMap(m))),
        Node::Array(a) => Value::Plain(convert::shared_to_plain(txn, &Out::YArray(a))),
        Node::Other(out) => {
            warn!("unsupported doc value {out}; mirroring as null");
            Value::Plain(Plain::Null)
        }
    }
}

/// Materializes or wraps a doc value for a parent slot, if it is a container
/// or leaf.
pub(crate) fn upgrade_value<T: ReadTxn>(
    ctx: &Arc<Context>,
    txn: &T,
    parent: &Controller,
    slot: Slot,
    out: Out,
) -> Option<Value> {
    match classify(out) {
        Node::Map(m) => Some(materialize(ctx, txn, Shared::Map(m)).as_value()),
        Node::Array(a) => Some(materialize(ctx, txn, Shared::Array(a)).as_value()),
        Node::Leaf(l) => Some(Value::Leaf(leaf::wrap(ctx, l, parent, slot))),
        _ => None,
    }
}

/// Returns true when `current` already mirrors `out`.
pub(crate) fn same_pair(ctx: &Context, current: &Value, out: &Out) -> bool {
    match (current, classify(out.clone())) {
        (Value::Map(mp), Node::Map(m)) => {
            ctx.shared_for(mp.id()).map(|s| s.id()) == Some(id_of(&m))
        }
        (Value::Array(ap), Node::Array(a)) => {
            ctx.shared_for(ap.id()).map(|s| s.id()) == Some(id_of(&a))
        }
        (Value::Leaf(lp), Node::Leaf(l)) => lp.id() == l.id(),
        _ => false,
    }
}

/// Replaces a parent slot with the controller or wrapper for a freshly
/// integrated doc value, unless it already holds it. Runs under the caller's
/// reentrancy lock.
pub(crate) fn upgrade_child<T: ReadTxn>(
    ctx: &Arc<Context>,
    txn: &T,
    parent: &Controller,
    slot: &Slot,
    out: Out,
) {
    match (parent, slot) {
        (Controller::Map(mp), Slot::Key(key)) => {
            if let Some(current) = mp.peek(key) {
                if same_pair(ctx, &current, &out) {
                    return;
                }
            }
            if let Some(value) = upgrade_value(ctx, txn, parent, slot.clone(), out) {
                mp.replace_silent(key, value);
            }
        }
        (Controller::Array(ap), Slot::Index(ix)) => {
            if let Some(current) = ap.peek(*ix) {
                if same_pair(ctx, &current, &out) {
                    return;
                }
            }
            if let Some(value) = upgrade_value(ctx, txn, parent, slot.clone(), out) {
                ap.set_silent(*ix, value);
            }
        }
        _ => {}
    }
}

fn install_map_hooks(ctx: &Arc<Context>, shared: &MapRef, proxy: &MapProxy) {
    let lazy = {
        let weak_ctx = Arc::downgrade(ctx);
        let shared = shared.clone();
        let weak_proxy = proxy.downgrade();
        Arc::new(move |key: &str, snapshot: &Plain| -> Option<Value> {
            let ctx = weak_ctx.upgrade()?;
            if ctx.is_disposed() || ctx.is_reconciling() {
                return None;
            }
            let proxy = weak_proxy.upgrade()?;
            let doc = ctx.doc().clone();
            let txn = doc.transact();
            let out = shared.get(&txn, key)?;
            // A snapshot that does not line up with the doc is a local write
            // still waiting for its flush; leave it alone.
            if convert::shared_to_plain(&txn, &out) != convert::normalized(snapshot) {
                return None;
            }
            upgrade_value(
                &ctx,
                &txn,
                &Controller::Map(proxy),
                Slot::Key(key.to_owned()),
                out,
            )
        })
    };
    proxy.set_lazy_hook(Some(lazy));

    let sync = {
        let weak_ctx = Arc::downgrade(ctx);
        let shared = shared.clone();
        let weak_proxy = proxy.downgrade();
        Arc::new(move |ops: &[Op]| -> Result<()> {
            let Some(ctx) = weak_ctx.upgrade() else {
                return Ok(());
            };
            if ctx.is_reconciling() || ctx.is_disposed() {
                return Ok(());
            }
            let Some(proxy) = weak_proxy.upgrade() else {
                return Ok(());
            };
            let plan = plan_map(ops);
            for value in plan.sets.values() {
                if let Err(err) = validate_deep(value, &ctx) {
                    rollback_map(&ctx, &proxy, ops);
                    return Err(err);
                }
            }
            for (key, value) in plan.sets {
                queue::enqueue_map_set(&ctx, Shared::Map(shared.clone()), key, value);
            }
            for key in plan.deletes {
                queue::enqueue_map_delete(&ctx, Shared::Map(shared.clone()), key);
            }
            Ok(())
        })
    };
    proxy.set_sync_hook(Some(sync));

    let weak_proxy = proxy.downgrade();
    ctx.register_subscription(
        id_of(shared),
        Box::new(move || {
            if let Some(proxy) = weak_proxy.upgrade() {
                proxy.set_sync_hook(None);
                proxy.set_lazy_hook(None);
            }
        }),
    );
}

fn install_array_hooks(ctx: &Arc<Context>, shared: &ArrayRef, proxy: &ArrayProxy) {
    let lazy = {
        let weak_ctx = Arc::downgrade(ctx);
        let shared = shared.clone();
        let weak_proxy = proxy.downgrade();
        Arc::new(move |index: usize, snapshot: &Plain| -> Option<Value> {
            let ctx = weak_ctx.upgrade()?;
            if ctx.is_disposed() || ctx.is_reconciling() {
                return None;
            }
            let proxy = weak_proxy.upgrade()?;
            let doc = ctx.doc().clone();
            let txn = doc.transact();
            let out = shared.get(&txn, index as u32)?;
            if convert::shared_to_plain(&txn, &out) != convert::normalized(snapshot) {
                return None;
            }
            upgrade_value(
                &ctx,
                &txn,
                &Controller::Array(proxy),
                Slot::Index(index),
                out,
            )
        })
    };
    proxy.set_lazy_hook(Some(lazy));

    let sync = {
        let weak_ctx = Arc::downgrade(ctx);
        let shared = shared.clone();
        let weak_proxy = proxy.downgrade();
        Arc::new(move |ops: &[Op]| -> Result<()> {
            let Some(ctx) = weak_ctx.upgrade() else {
                return Ok(());
            };
            if ctx.is_reconciling() || ctx.is_disposed() {
                return Ok(());
            }
            let Some(proxy) = weak_proxy.upgrade() else {
                return Ok(());
            };
            let baseline = {
                let txn = ctx.doc().transact();
                shared.len(&txn) as usize
            };
            let plan = plan_array(ops, baseline);
            for value in plan.sets.values().chain(plan.replaces.values()) {
                if let Err(err) = validate_deep(value, &ctx) {
                    rollback_array(&ctx, &proxy, ops);
                    return Err(err);
                }
            }
            for (ix, value) in plan.sets {
                queue::enqueue_array_set(&ctx, Shared::Array(shared.clone()), ix, value);
            }
            for (ix, value) in plan.replaces {
                queue::enqueue_array_replace(&ctx, Shared::Array(shared.clone()), ix, value);
            }
            for ix in plan.deletes {
                queue::enqueue_array_delete(&ctx, Shared::Array(shared.clone()), ix);
            }
            Ok(())
        })
    };
    proxy.set_sync_hook(Some(sync));

    let weak_proxy = proxy.downgrade();
    ctx.register_subscription(
        id_of(shared),
        Box::new(move || {
            if let Some(proxy) = weak_proxy.upgrade() {
                proxy.set_sync_hook(None);
                proxy.set_lazy_hook(None);
            }
        }),
    );
}

/// Restores a rejected map burst from the ops' prev slots, newest first.
fn rollback_map(ctx: &Context, proxy: &MapProxy, ops: &[Op]) {
    ctx.with_reconciling_lock(|| {
        for op in ops.iter().rev() {
            match op {
                Op::Set { path, prev, .. } => {
                    if let Some(Segment::Key(key)) = path.first() {
                        match prev {
                            Some(value) => proxy.replace_silent(key, value.clone()),
                            None => proxy.remove_silent(key),
                        }
                    }
                }
                Op::Delete { path, prev } => {
                    if let (Some(Segment::Key(key)), Some(value)) = (path.first(), prev) {
                        proxy.replace_silent(key, value.clone());
                    }
                }
            }
        }
    });
}

/// Restores a rejected array burst from the ops' prev slots, newest first.
fn rollback_array(ctx: &Context, proxy: &ArrayProxy, ops: &[Op]) {
    ctx.with_reconciling_lock(|| {
        for op in ops.iter().rev() {
            match op {
                Op::Set { path, prev, .. } => {
                    if let Some(Segment::Index(ix)) = path.first() {
                        match prev {
                            Some(value) => proxy.set_silent(*ix, value.clone()),
                            None => proxy.remove_silent(*ix),
                        }
                    }
                }
                Op::Delete { path, prev } => {
                    if let (Some(Segment::Index(ix)), Some(value)) = (path.first(), prev) {
                        proxy.insert_silent(*ix, value.clone());
                    }
                }
            }
        }
    });
}
