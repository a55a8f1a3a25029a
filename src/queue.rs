use crate::binding::origin;
use crate::bridge;
use crate::context::{Context, Slot};
use crate::convert::{self, Dest, WriteSrc};
use crate::error::Result;
use crate::guard::{Shared, SharedId};
use crate::reactive::Value;
use fnv::FnvHashMap;
use indexmap::{IndexMap, IndexSet};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;
use yrs::{Any, Array, In, Map, Out, Transact};

/// A pending array write at one index.
pub(crate) enum ArrayIntent {
    Set(Value),
    Replace(Value),
    Delete,
}

/// Per-target dedup tables for writes awaiting the next flush.
#[derive(Default)]
pub(crate) struct Pending {
    map_sets: FnvHashMap<SharedId, IndexMap<String, Value>>,
    map_deletes: FnvHashMap<SharedId, IndexSet<String>>,
    arrays: FnvHashMap<SharedId, BTreeMap<usize, ArrayIntent>>,
    targets: FnvHashMap<SharedId, Shared>,
}

impl Pending {
    fn is_empty(&self) -> bool {
        self.map_sets.values().all(|sets| sets.is_empty())
            && self.map_deletes.values().all(|dels| dels.is_empty())
            && self.arrays.values().all(|ops| ops.is_empty())
    }
}

/// Records a map set, cancelling any pending delete for the key.
pub(crate) fn enqueue_map_set(ctx: &Context, target: Shared, key: String, value: Value) {
    let id = target.id();
    {
        let mut pending = ctx.pending();
        pending.targets.insert(id, target);
        if let Some(dels) = pending.map_deletes.get_mut(&id) {
            dels.shift_remove(&key);
        }
        pending.map_sets.entry(id).or_default().insert(key, value);
    }
    ctx.schedule_flush();
}

/// Records a map delete, cancelling any pending set for the key.
pub(crate) fn enqueue_map_delete(ctx: &Context, target: Shared, key: String) {
    let id = target.id();
    {
        let mut pending = ctx.pending();
        pending.targets.insert(id, target);
        if let Some(sets) = pending.map_sets.get_mut(&id) {
            sets.shift_remove(&key);
        }
        pending.map_deletes.entry(id).or_default().insert(key);
    }
    ctx.schedule_flush();
}

/// Records an array set. A set over a pending delete at the same index
/// promotes to a replace.
pub(crate) fn enqueue_array_set(ctx: &Context, target: Shared, index: usize, value: Value) {
    let id = target.id();
    {
        let mut pending = ctx.pending();
        pending.targets.insert(id, target);
        let ops = pending.arrays.entry(id).or_default();
        let intent = match ops.get(&index) {
            Some(ArrayIntent::Delete) | Some(ArrayIntent::Replace(_)) => {
                ArrayIntent::Replace(value)
            }
            _ => ArrayIntent::Set(value),
        };
        ops.insert(index, intent);
    }
    ctx.schedule_flush();
}

/// Records an array replace.
pub(crate) fn enqueue_array_replace(ctx: &Context, target: Shared, index: usize, value: Value) {
    let id = target.id();
    {
        let mut pending = ctx.pending();
        pending.targets.insert(id, target);
        pending
            .arrays
            .entry(id)
            .or_default()
            .insert(index, ArrayIntent::Replace(value));
    }
    ctx.schedule_flush();
}

/// Records an array delete, overriding any pending write at the index.
pub(crate) fn enqueue_array_delete(ctx: &Context, target: Shared, index: usize) {
    let id = target.id();
    {
        let mut pending = ctx.pending();
        pending.targets.insert(id, target);
        pending
            .arrays
            .entry(id)
            .or_default()
            .insert(index, ArrayIntent::Delete);
    }
    ctx.schedule_flush();
}

enum PreparedIntent {
    Set(WriteSrc),
    Replace(WriteSrc),
    Delete,
}

/// Drains the pending tables into exactly one doc transaction tagged with the
/// bridge origin, then runs post-integration upgrades under the reentrancy
/// lock.
///
/// The tables are snapshotted and cleared first: anything enqueued while the
/// flush runs lands in the next transaction. Values referring to existing
/// shared state are deep-cloned before any delete is applied.
pub(crate) fn flush(ctx: &Arc<Context>) -> Result<()> {
    let pending = ctx.take_pending();
    if ctx.is_disposed() || pending.is_empty() {
        return Ok(());
    }
    let doc = ctx.doc().clone();
    let mut upgrades: Vec<(SharedId, Slot, Out)> = Vec::new();
    {
        let mut txn = doc.transact_mut_with(origin());

        let mut prepared_maps: Vec<(Shared, Vec<(String, WriteSrc)>)> = Vec::new();
        for (id, sets) in &pending.map_sets {
            let Some(target) = pending.targets.get(id) else {
                continue;
            };
            let mut srcs = Vec::with_capacity(sets.len());
            for (key, value) in sets {
                match convert::prepare(&txn, value, ctx) {
                    Ok(src) => srcs.push((key.clone(), src)),
                    Err(err) => warn!("dropping pending set for {key:?}: {err}"),
                }
            }
            prepared_maps.push((target.clone(), srcs));
        }
        let mut prepared_arrays: Vec<(Shared, BTreeMap<usize, PreparedIntent>)> = Vec::new();
        for (id, intents) in &pending.arrays {
            let Some(target) = pending.targets.get(id) else {
                continue;
            };
            let mut prepared = BTreeMap::new();
            for (ix, intent) in intents {
                let prep = match intent {
                    ArrayIntent::Delete => Some(PreparedIntent::Delete),
                    ArrayIntent::Set(value) => match convert::prepare(&txn, value, ctx) {
                        Ok(src) => Some(PreparedIntent::Set(src)),
                        Err(err) => {
                            warn!("dropping pending set at {ix}: {err}");
                            None
                        }
                    },
                    ArrayIntent::Replace(value) => match convert::prepare(&txn, value, ctx) {
                        Ok(src) => Some(PreparedIntent::Replace(src)),
                        Err(err) => {
                            warn!("dropping pending replace at {ix}: {err}");
                            None
                        }
                    },
                };
                if let Some(prep) = prep {
                    prepared.insert(*ix, prep);
                }
            }
            prepared_arrays.push((target.clone(), prepared));
        }

        for (id, keys) in &pending.map_deletes {
            if let Some(Shared::Map(m)) = pending.targets.get(id) {
                for key in keys {
                    m.remove(&mut txn, key);
                }
            }
        }
        for (target, srcs) in prepared_maps {
            let Shared::Map(m) = &target else {
                continue;
            };
            for (key, src) in srcs {
                match convert::write(&mut txn, Dest::MapKey(m, &key), src) {
                    Ok(Some(out)) => upgrades.push((target.id(), Slot::Key(key), out)),
                    Ok(None) => {}
                    Err(err) => warn!("write for {key:?} failed: {err}"),
                }
            }
        }
        for (target, intents) in prepared_arrays {
            let Shared::Array(a) = &target else {
                continue;
            };
            let deletes: Vec<usize> = intents
                .iter()
                .filter_map(|(ix, intent)| matches!(intent, PreparedIntent::Delete).then_some(*ix))
                .collect();
            for ix in deletes.into_iter().rev() {
                if (ix as u32) < a.len(&txn) {
                    a.remove(&mut txn, ix as u32);
                }
            }
            for (ix, intent) in intents {
                let src = match intent {
                    PreparedIntent::Set(src) | PreparedIntent::Replace(src) => src,
                    PreparedIntent::Delete => continue,
                };
                let len = a.len(&txn) as usize;
                let dest = if ix < len {
                    a.remove(&mut txn, ix as u32);
                    Dest::ArrayInsert(a, ix as u32)
                } else if ix == len {
                    Dest::ArrayPush(a)
                } else {
                    for _ in len..ix {
                        a.push_back(&mut txn, In::Any(Any::Null));
                    }
                    Dest::ArrayPush(a)
                };
                match convert::write(&mut txn, dest, src) {
                    Ok(Some(out)) => upgrades.push((target.id(), Slot::Index(ix), out)),
                    Ok(None) => {}
                    Err(err) => warn!("write at {ix} failed: {err}"),
                }
            }
        }
    }
    if !upgrades.is_empty() {
        let txn = doc.transact();
        ctx.with_reconciling_lock(|| {
            for (target, slot, out) in upgrades {
                if let Some(parent) = ctx.controller_for(target) {
                    bridge::upgrade_child(ctx, &txn, &parent, &slot, out);
                }
            }
        });
    }
    Ok(())
}
