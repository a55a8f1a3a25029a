use crate::bridge::{self, same_pair};
use crate::context::{Context, Controller, Slot};
use crate::convert;
use crate::guard::{classify, Node, Shared};
use crate::leaf;
use crate::plain::Plain;
use crate::reactive::{ArrayProxy, MapProxy, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;
use yrs::types::Change;
use yrs::{Array, ArrayRef, Map, MapRef, Out, ReadTxn};

/// Brings a map controller in line with its shared map.
///
/// Identity is preserved for slots that already mirror the shared value:
/// controllers for the same container, wrappers for the same leaf, equal
/// primitives. Unmaterialized container slots stay snapshots, refreshed only
/// when their projection changed; slots that were materialized are rebuilt as
/// controllers. Runs under the reentrancy lock.
pub(crate) fn reconcile_map<T: ReadTxn>(
    ctx: &Arc<Context>,
    txn: &T,
    shared: &MapRef,
    proxy: &MapProxy,
) {
    let parent = Controller::Map(proxy.clone());
    let mut writes: Vec<(String, Option<Value>)> = Vec::new();
    let mut seen = HashSet::new();
    let entries: Vec<(String, Out)> = shared.iter(txn).map(|(k, v)| (k.to_string(), v)).collect();
    for (key, out) in entries {
        seen.insert(key.clone());
        let current = proxy.peek(&key);
        if let Some(value) = reconcile_slot(ctx, txn, &parent, Slot::Key(key.clone()), current, out)
        {
            writes.push((key, Some(value)));
        }
    }
    for key in proxy.keys() {
        if !seen.contains(&key) {
            writes.push((key, None));
        }
    }
    proxy.write_many(writes);
}

/// Brings an array controller in line with its shared array positionally.
/// Used only when no delta is available for the array.
pub(crate) fn reconcile_array<T: ReadTxn>(
    ctx: &Arc<Context>,
    txn: &T,
    shared: &ArrayRef,
    proxy: &ArrayProxy,
) {
    let parent = Controller::Array(proxy.clone());
    let items: Vec<Out> = shared.iter(txn).collect();
    let mut desired: Vec<Value> = Vec::with_capacity(items.len());
    for (ix, out) in items.into_iter().enumerate() {
        let current = proxy.peek(ix);
        match reconcile_slot(ctx, txn, &parent, Slot::Index(ix), current.clone(), out) {
            Some(value) => desired.push(value),
            None => match current {
                Some(value) => desired.push(value),
                None => unreachable!("kept slots exist"),
            },
        }
    }
    let len = proxy.len();
    let _ = proxy.splice(0, len, desired);
}

/// Applies a doc delta to an array controller, preserving identity for
/// retained items. Inserted containers enter lazily as snapshots; inserted
/// leaves are wrapped so their observers are live.
pub(crate) fn apply_array_delta<T: ReadTxn>(
    ctx: &Arc<Context>,
    txn: &T,
    proxy: &ArrayProxy,
    delta: &[Change],
) {
    let parent = Controller::Array(proxy.clone());
    let mut pos = 0usize;
    for change in delta {
        match change {
            Change::Retain(n) => pos += *n as usize,
            Change::Removed(n) => {
                let _ = proxy.splice(pos, *n as usize, Vec::new());
            }
            Change::Added(outs) => {
                let items: Vec<Value> = outs
                    .iter()
                    .enumerate()
                    .map(|(i, out)| {
                        bridge::initial_slot_value(
                            ctx,
                            txn,
                            &parent,
                            Slot::Index(pos + i),
                            out.clone(),
                        )
                    })
                    .collect();
                let n = items.len();
                let _ = proxy.splice(pos, 0, items);
                pos += n;
            }
        }
    }
}

fn reconcile_slot<T: ReadTxn>(
    ctx: &Arc<Context>,
    txn: &T,
    parent: &Controller,
    slot: Slot,
    current: Option<Value>,
    out: Out,
) -> Option<Value> {
    match classify(out) {
        Node::Primitive(any) => {
            let plain = convert::any_to_plain(&any);
            match &current {
                Some(Value::Plain(p)) if *p == plain => None,
                _ => Some(Value::Plain(plain)),
            }
        }
        Node::Leaf(l) => match &current {
            Some(Value::Leaf(lp)) if lp.id() == l.id() => None,
            _ => Some(Value::Leaf(leaf::wrap(ctx, l, parent, slot))),
        },
        Node::Map(m) => {
            let out = Out::YMap(m.clone());
            match &current {
                Some(v @ Value::Map(_)) if same_pair(ctx, v, &out) => None,
                Some(Value::Map(_) | Value::Array(_) | Value::Leaf(_)) => {
                    Some(bridge::materialize(ctx, txn, Shared::Map(m)).as_value())
                }
                Some(Value::Plain(p @ Plain::Map(_))) => {
                    let now = convert::shared_to_plain(txn, &out);
                    if *p == now {
                        None
                    } else {
                        Some(Value::Plain(now))
                    }
                }
                _ => Some(Value::Plain(convert::shared_to_plain(txn, &out))),
            }
        }
        Node::Array(a) => {
            let out = Out::YArray(a.clone());
            match &current {
                Some(v @ Value::Array(_)) if same_pair(ctx, v, &out) => None,
                Some(Value::Map(_) | Value::Array(_) | Value::Leaf(_)) => {
                    Some(bridge::materialize(ctx, txn, Shared::Array(a)).as_value())
                }
                Some(Value::Plain(p @ Plain::List(_))) => {
                    let now = convert::shared_to_plain(txn, &out);
                    if *p == now {
                        None
                    } else {
                        Some(Value::Plain(now))
                    }
                }
                _ => Some(Value::Plain(convert::shared_to_plain(txn, &out))),
            }
        }
        Node::Other(out) => {
            warn!("skipping unsupported doc value {out}");
            None
        }
    }
}
