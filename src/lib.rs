//! # Reactive bindings for yrs documents
//!
//! This crate maintains a live, mutually consistent projection between two
//! state models: a [`yrs::Doc`] made of shared containers (maps and arrays)
//! plus opaque leaf types (text and the XML family), and a reactive
//! plain-object model of *controllers* ([`MapProxy`], [`ArrayProxy`]) that
//! emit low-level mutation ops for every write. An application may read and
//! write either side and observe coherent results on both.
//!
//! ## Write path (controller → doc)
//! A write on a controller emits a synchronous burst of ops. The burst is
//! planned into per-key and per-index intents, validated ([`Error::UnsupportedValue`]
//! aborts the burst and rolls the controller back before anything reaches the
//! doc), and queued in dedup tables. A wakeup later drains the tables into
//! exactly one doc transaction tagged with [`ORIGIN`], applying map deletes,
//! then map sets, then per-array deletes in descending and sets in ascending
//! index order. Values written as plain maps or lists become shared
//! containers, and the parent slot is upgraded to a live controller right
//! after the transaction commits.
//!
//! ## Read path (doc → controller)
//! A deep observer on the root receives one event batch per remote
//! transaction. Each event is routed to its *boundary*, the deepest node on
//! its path that already has a controller; boundaries are reconciled parents
//! first, and array deltas are applied to materialized targets so surviving
//! items keep their identity.
//!
//! ## Echo suppression
//! Two mechanisms, both required: the origin filter keeps the deep observer
//! from treating the bridge's own transactions as remote, and a reentrancy
//! flag on the per-binding context keeps the controller subscriptions from
//! re-emitting the writes reconciliation performs.
//!
//! ## Laziness
//! Controllers are created on explicit request only. A container child read
//! from a controller is a plain snapshot until it is first accessed, at which
//! point it is materialized and cached; repeated materialization of the same
//! shared container returns the same controller for the lifetime of the
//! binding. The caches hold controllers weakly, so unreferenced subtrees can
//! be collected.
//!
//! ## Leaves
//! Leaf types are never deep-proxied: their internal state is opaque to the
//! bridge, which would otherwise observe private CRDT mutations as generic
//! property changes. A [`LeafProxy`] hands out the typed ref and the bridge
//! observes the leaf natively, re-asserting the wrapper on the parent slot so
//! watchers see leaf changes.
//!
//! ## No move semantics
//! Splice-driven reorders arrive as per-index sets and deletes and are
//! applied literally; the doc has no move primitive. Concurrent reorders
//! converge but lose logical identity; applications that need stable order
//! under concurrent edits should key rows by fractional indexes.
#![warn(missing_docs)]
mod binding;
mod bridge;
mod context;
mod convert;
mod error;
mod guard;
mod leaf;
mod listener;
mod plain;
mod plan;
#[cfg(test)]
mod props;
mod queue;
mod reactive;
mod reconcile;

pub use crate::binding::{origin, Binding, ORIGIN};
pub use crate::error::{Error, Result};
pub use crate::guard::{Leaf, Shared};
pub use crate::leaf::LeafProxy;
pub use crate::plain::Plain;
pub use crate::reactive::{ArrayProxy, MapProxy, Op, OpPath, Segment, Value, Watch};
