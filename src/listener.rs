use crate::binding::origin;
use crate::context::{Context, Controller};
use crate::guard::{classify, id_of, Node, Shared, SharedId};
use crate::reconcile;
use fnv::{FnvHashMap, FnvHashSet};
use std::sync::{Arc, Weak};
use tracing::warn;
use yrs::types::{Change, Event, Events, Path, PathSegment};
use yrs::{Array, DeepObservable, Map, ReadTxn, Subscription, TransactionMut};

/// Installs the deep observer on the root container. The returned
/// subscription unobserves on drop and is registered as a context disposer by
/// the binding.
pub(crate) fn install(ctx: &Arc<Context>, root: Shared) -> Subscription {
    let weak = Arc::downgrade(ctx);
    match root.clone() {
        Shared::Map(m) => {
            m.observe_deep(move |txn, events| handle_batch(&weak, &root, txn, events))
        }
        Shared::Array(a) => {
            a.observe_deep(move |txn, events| handle_batch(&weak, &root, txn, events))
        }
    }
}

struct Boundary {
    depth: usize,
    shared: Shared,
    ctrl: Controller,
}

/// Routes one deep-event batch: suppresses echoes by origin, resolves each
/// event to its boundary, then reconciles boundaries parents-first and
/// applies array deltas, all under the reentrancy lock. Handling is
/// best-effort per event: an unresolvable event is skipped, not fatal.
fn handle_batch(ctx: &Weak<Context>, root: &Shared, txn: &TransactionMut, events: &Events) {
    let Some(ctx) = ctx.upgrade() else {
        return;
    };
    if ctx.is_disposed() {
        return;
    }
    if txn.origin() == Some(&origin()) {
        return;
    }

    let mut boundaries: FnvHashMap<SharedId, Boundary> = FnvHashMap::default();
    let mut deltas: Vec<(SharedId, Vec<Change>)> = Vec::new();
    let mut delta_targets: FnvHashSet<SharedId> = FnvHashSet::default();

    for event in events.iter() {
        let path = match event {
            Event::Map(e) => e.path(),
            Event::Array(e) => {
                let delta = e.delta(txn);
                if !delta.is_empty() {
                    let id = id_of(e.target());
                    delta_targets.insert(id);
                    deltas.push((id, delta.to_vec()));
                }
                e.path()
            }
            Event::Text(e) => e.path(),
            Event::XmlFragment(e) => e.path(),
            Event::XmlText(e) => e.path(),
            _ => continue,
        };
        match resolve_boundary(&ctx, txn, root, &path) {
            Some((depth, shared, ctrl)) => {
                boundaries
                    .entry(shared.id())
                    .or_insert(Boundary { depth, shared, ctrl });
            }
            None => warn!("no boundary for remote event; skipping it"),
        }
    }

    let mut ordered: Vec<Boundary> = boundaries.into_values().collect();
    ordered.sort_by_key(|b| b.depth);

    ctx.with_reconciling_lock(|| {
        for b in ordered {
            match (&b.shared, &b.ctrl) {
                (Shared::Map(m), Controller::Map(p)) => {
                    reconcile::reconcile_map(&ctx, txn, m, p)
                }
                (Shared::Array(a), Controller::Array(p)) => {
                    if !delta_targets.contains(&b.shared.id()) {
                        reconcile::reconcile_array(&ctx, txn, a, p);
                    }
                }
                _ => warn!("controller kind does not match its shared container"),
            }
        }
        for (id, delta) in deltas {
            if let Some(Controller::Array(p)) = ctx.controller_for(id) {
                reconcile::apply_array_delta(&ctx, txn, &p, &delta);
            }
        }
    });
}

/// Walks the event path from the root, returning the deepest node along it
/// (the target included) that has a live controller. The root is the
/// fallback boundary.
fn resolve_boundary<T: ReadTxn>(
    ctx: &Arc<Context>,
    txn: &T,
    root: &Shared,
    path: &Path,
) -> Option<(usize, Shared, Controller)> {
    let mut best = ctx
        .controller_for(root.id())
        .map(|ctrl| (0, root.clone(), ctrl));
    let mut cur = root.clone();
    let mut depth = 0;
    for seg in path.iter() {
        let child = match (&cur, seg) {
            (Shared::Map(m), PathSegment::Key(key)) => m.get(txn, key.as_ref()),
            (Shared::Array(a), PathSegment::Index(ix)) => a.get(txn, *ix),
            _ => None,
        };
        let Some(child) = child else {
            break;
        };
        depth += 1;
        match classify(child) {
            Node::Map(m) => cur = Shared::Map(m),
            Node::Array(a) => cur = Shared::Array(a),
            _ => break,
        }
        if let Some(ctrl) = ctx.controller_for(cur.id()) {
            best = Some((depth, cur.clone(), ctrl));
        }
    }
    best
}
