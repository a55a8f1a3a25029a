use crate::error::Result;
use crate::leaf::LeafProxy;
use crate::plain::Plain;
use fnv::FnvHashMap;
use indexmap::IndexMap;
use parking_lot::Mutex;
use smallvec::{smallvec, SmallVec};
use std::sync::{Arc, Weak};

/// One step of an op path.
#[derive(Clone, Debug, PartialEq)]
pub enum Segment {
    /// A map key.
    Key(String),
    /// An array index.
    Index(usize),
}

/// The path of an op, relative to the controller that emitted it.
pub type OpPath = SmallVec<[Segment; 2]>;

/// A low-level mutation op, emitted synchronously for any write.
///
/// `prev` carries the value the write displaced, which is what makes a burst
/// reversible without consulting anything but the ops themselves.
#[derive(Clone, Debug)]
pub enum Op {
    /// A key or index was written.
    Set {
        /// Where the write landed.
        path: OpPath,
        /// The value written.
        value: Value,
        /// The displaced value, if the slot existed.
        prev: Option<Value>,
    },
    /// A key or index was removed.
    Delete {
        /// Where the removal happened.
        path: OpPath,
        /// The removed value.
        prev: Option<Value>,
    },
}

impl Op {
    /// The path of this op.
    pub fn path(&self) -> &OpPath {
        match self {
            Op::Set { path, .. } | Op::Delete { path, .. } => path,
        }
    }

    pub(crate) fn is_top_level(&self) -> bool {
        self.path().len() == 1
    }
}

/// A value held by a controller slot.
///
/// A slot holds a controller only once its underlying shared container has
/// been materialized; until then reads see a plain snapshot.
#[derive(Clone)]
pub enum Value {
    /// A primitive or a plain snapshot of an unmaterialized container.
    Plain(Plain),
    /// A live map controller.
    Map(MapProxy),
    /// A live array controller.
    Array(ArrayProxy),
    /// An opaque leaf wrapper.
    Leaf(LeafProxy),
}

impl Value {
    /// Returns the plain value, if this is one.
    pub fn as_plain(&self) -> Option<&Plain> {
        match self {
            Value::Plain(p) => Some(p),
            _ => None,
        }
    }

    /// Returns the map controller, if this is one.
    pub fn as_map(&self) -> Option<&MapProxy> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Returns the array controller, if this is one.
    pub fn as_array(&self) -> Option<&ArrayProxy> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Returns the leaf wrapper, if this is one.
    pub fn as_leaf(&self) -> Option<&LeafProxy> {
        match self {
            Value::Leaf(l) => Some(l),
            _ => None,
        }
    }

    /// Projects this value to plain data. Controllers snapshot their current
    /// state; leaves project to their string form.
    pub fn snapshot(&self) -> Plain {
        match self {
            Value::Plain(p) => p.clone(),
            Value::Map(m) => m.snapshot(),
            Value::Array(a) => a.snapshot(),
            Value::Leaf(l) => Plain::String(l.string()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Plain(a), Value::Plain(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => Arc::ptr_eq(&a.inner, &b.inner),
            (Value::Array(a), Value::Array(b)) => Arc::ptr_eq(&a.inner, &b.inner),
            (Value::Leaf(a), Value::Leaf(b)) => a == b,
            _ => false,
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Value::Plain(p) => p.fmt(f),
            Value::Map(m) => m.fmt(f),
            Value::Array(a) => a.fmt(f),
            Value::Leaf(l) => l.fmt(f),
        }
    }
}

impl From<Plain> for Value {
    fn from(value: Plain) -> Self {
        Value::Plain(value)
    }
}

impl From<MapProxy> for Value {
    fn from(value: MapProxy) -> Self {
        Value::Map(value)
    }
}

impl From<ArrayProxy> for Value {
    fn from(value: ArrayProxy) -> Self {
        Value::Array(value)
    }
}

impl From<LeafProxy> for Value {
    fn from(value: LeafProxy) -> Self {
        Value::Leaf(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Plain(value.into())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Plain(value.into())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Plain(value.into())
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Plain(value.into())
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Plain(value.into())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Plain(value.into())
    }
}

pub(crate) type SyncHook = Arc<dyn Fn(&[Op]) -> Result<()>>;
pub(crate) type KeyLazyHook = Arc<dyn Fn(&str, &Plain) -> Option<Value>>;
pub(crate) type IndexLazyHook = Arc<dyn Fn(usize, &Plain) -> Option<Value>>;
type Watcher = Arc<dyn Fn(&[Op])>;

struct Hooks<L> {
    sync: Option<SyncHook>,
    lazy: Option<L>,
    watchers: FnvHashMap<u64, Watcher>,
    next_watcher: u64,
}

impl<L> Default for Hooks<L> {
    fn default() -> Self {
        Self {
            sync: None,
            lazy: None,
            watchers: FnvHashMap::default(),
            next_watcher: 0,
        }
    }
}

impl<L: Clone> Hooks<L> {
    fn for_emit(&self) -> (Option<SyncHook>, Vec<Watcher>) {
        (self.sync.clone(), self.watchers.values().cloned().collect())
    }
}

/// Unsubscribes its watcher on drop.
pub struct Watch {
    cancel: Option<Box<dyn FnOnce()>>,
}

impl Drop for Watch {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

fn key_path(key: &str) -> OpPath {
    smallvec![Segment::Key(key.to_owned())]
}

fn index_path(index: usize) -> OpPath {
    smallvec![Segment::Index(index)]
}

/// A reactive object mirroring one shared map.
///
/// Handles are cheap to clone and compare by identity. Mutators emit one
/// burst of ops per call; a burst rejected by the sync hook is rolled back by
/// the hook and the error is returned to the caller.
#[derive(Clone)]
pub struct MapProxy {
    inner: Arc<MapInner>,
}

struct MapInner {
    slots: Mutex<IndexMap<String, Value>>,
    hooks: Mutex<Hooks<KeyLazyHook>>,
}

impl MapProxy {
    pub(crate) fn empty() -> Self {
        Self {
            inner: Arc::new(MapInner {
                slots: Mutex::new(IndexMap::new()),
                hooks: Mutex::new(Hooks::default()),
            }),
        }
    }

    pub(crate) fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    pub(crate) fn downgrade(&self) -> WeakMapProxy {
        WeakMapProxy {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Reads a key. Reading is an explicit materialization request: a slot
    /// holding the snapshot of a shared container comes back as a live
    /// controller.
    pub fn get(&self, key: &str) -> Option<Value> {
        let current = self.inner.slots.lock().get(key).cloned()?;
        if let Value::Plain(snapshot @ (Plain::Map(_) | Plain::List(_))) = &current {
            let lazy = self.inner.hooks.lock().lazy.clone();
            if let Some(lazy) = lazy {
                if let Some(upgraded) = lazy(key, snapshot) {
                    self.replace_silent(key, upgraded.clone());
                    return Some(upgraded);
                }
            }
        }
        Some(current)
    }

    /// Reads a key without upgrading it.
    pub(crate) fn peek(&self, key: &str) -> Option<Value> {
        self.inner.slots.lock().get(key).cloned()
    }

    /// Writes a key. Returns the sync hook's verdict; on rejection the local
    /// state has been restored and the doc is untouched.
    pub fn insert(&self, key: impl Into<String>, value: impl Into<Value>) -> Result<()> {
        let key = key.into();
        let value = value.into();
        let prev = self.inner.slots.lock().insert(key.clone(), value.clone());
        self.emit(&[Op::Set {
            path: key_path(&key),
            value,
            prev,
        }])
    }

    /// Removes a key, returning the removed value.
    pub fn remove(&self, key: &str) -> Result<Option<Value>> {
        let prev = self.inner.slots.lock().shift_remove(key);
        if prev.is_none() {
            return Ok(None);
        }
        self.emit(&[Op::Delete {
            path: key_path(key),
            prev: prev.clone(),
        }])?;
        Ok(prev)
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.inner.slots.lock().len()
    }

    /// Returns true when the map has no keys.
    pub fn is_empty(&self) -> bool {
        self.inner.slots.lock().is_empty()
    }

    /// Returns true when the key exists.
    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.slots.lock().contains_key(key)
    }

    /// The keys in insertion order.
    pub fn keys(&self) -> Vec<String> {
        self.inner.slots.lock().keys().cloned().collect()
    }

    /// Projects the map to plain data.
    pub fn snapshot(&self) -> Plain {
        let entries: Vec<(String, Value)> = {
            let slots = self.inner.slots.lock();
            slots.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        Plain::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k, v.snapshot()))
                .collect(),
        )
    }

    /// Registers a watcher that runs after each mutation burst.
    pub fn subscribe(&self, f: impl Fn(&[Op]) + 'static) -> Watch {
        let id = {
            let mut hooks = self.inner.hooks.lock();
            let id = hooks.next_watcher;
            hooks.next_watcher += 1;
            hooks.watchers.insert(id, Arc::new(f));
            id
        };
        let weak = Arc::downgrade(&self.inner);
        Watch {
            cancel: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.hooks.lock().watchers.remove(&id);
                }
            })),
        }
    }

    /// Applies a batch of writes as one burst, skipping writes that change
    /// nothing.
    pub(crate) fn write_many(&self, writes: Vec<(String, Option<Value>)>) {
        let mut ops = Vec::new();
        {
            let mut slots = self.inner.slots.lock();
            for (key, write) in writes {
                match write {
                    Some(value) => {
                        if slots.get(&key) == Some(&value) {
                            continue;
                        }
                        let prev = slots.insert(key.clone(), value.clone());
                        ops.push(Op::Set {
                            path: key_path(&key),
                            value,
                            prev,
                        });
                    }
                    None => {
                        if let Some(prev) = slots.shift_remove(&key) {
                            ops.push(Op::Delete {
                                path: key_path(&key),
                                prev: Some(prev),
                            });
                        }
                    }
                }
            }
        }
        let _ = self.emit(&ops);
    }

    pub(crate) fn replace_silent(&self, key: &str, value: Value) {
        self.inner.slots.lock().insert(key.to_owned(), value);
    }

    pub(crate) fn remove_silent(&self, key: &str) {
        self.inner.slots.lock().shift_remove(key);
    }

    pub(crate) fn set_sync_hook(&self, hook: Option<SyncHook>) {
        self.inner.hooks.lock().sync = hook;
    }

    pub(crate) fn set_lazy_hook(&self, hook: Option<KeyLazyHook>) {
        self.inner.hooks.lock().lazy = hook;
    }

    fn emit(&self, ops: &[Op]) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let (sync, watchers) = self.inner.hooks.lock().for_emit();
        if let Some(sync) = sync {
            sync(ops)?;
        }
        for watcher in watchers {
            watcher(ops);
        }
        Ok(())
    }
}

impl PartialEq for MapProxy {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for MapProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("MapProxy")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

pub(crate) struct WeakMapProxy {
    inner: Weak<MapInner>,
}

impl WeakMapProxy {
    pub(crate) fn upgrade(&self) -> Option<MapProxy> {
        self.inner.upgrade().map(|inner| MapProxy { inner })
    }

    pub(crate) fn id(&self) -> usize {
        self.inner.as_ptr() as usize
    }
}

/// A reactive sequence mirroring one shared array.
///
/// Shifting edits (`insert`, `remove`, `splice`) emit the literal per-index
/// set/delete cascade: there is no move op, and a burst that looks like a
/// move is applied as delete plus insert.
#[derive(Clone)]
pub struct ArrayProxy {
    inner: Arc<ArrayInner>,
}

struct ArrayInner {
    slots: Mutex<Vec<Value>>,
    hooks: Mutex<Hooks<IndexLazyHook>>,
}

impl ArrayProxy {
    pub(crate) fn empty() -> Self {
        Self {
            inner: Arc::new(ArrayInner {
                slots: Mutex::new(Vec::new()),
                hooks: Mutex::new(Hooks::default()),
            }),
        }
    }

    pub(crate) fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    pub(crate) fn downgrade(&self) -> WeakArrayProxy {
        WeakArrayProxy {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Reads an index, upgrading a container snapshot to a live controller.
    pub fn get(&self, index: usize) -> Option<Value> {
        let current = self.inner.slots.lock().get(index).cloned()?;
        if let Value::Plain(snapshot @ (Plain::Map(_) | Plain::List(_))) = &current {
            let lazy = self.inner.hooks.lock().lazy.clone();
            if let Some(lazy) = lazy {
                if let Some(upgraded) = lazy(index, snapshot) {
                    self.set_silent(index, upgraded.clone());
                    return Some(upgraded);
                }
            }
        }
        Some(current)
    }

    pub(crate) fn peek(&self, index: usize) -> Option<Value> {
        self.inner.slots.lock().get(index).cloned()
    }

    /// Writes an index. Writing at the length appends; writing past it fills
    /// the gap with nulls.
    pub fn set(&self, index: usize, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let len = self.len();
        if index < len {
            self.splice(index, 1, vec![value]).map(|_| ())
        } else {
            let mut items: Vec<Value> =
                std::iter::repeat_with(|| Value::Plain(Plain::Null))
                    .take(index - len)
                    .collect();
            items.push(value);
            self.splice(len, 0, items).map(|_| ())
        }
    }

    /// Inserts before `index`, shifting the tail.
    pub fn insert(&self, index: usize, value: impl Into<Value>) -> Result<()> {
        let index = index.min(self.len());
        self.splice(index, 0, vec![value.into()]).map(|_| ())
    }

    /// Appends a value.
    pub fn push(&self, value: impl Into<Value>) -> Result<()> {
        let len = self.len();
        self.splice(len, 0, vec![value.into()]).map(|_| ())
    }

    /// Removes an index, shifting the tail. Returns the removed value.
    pub fn remove(&self, index: usize) -> Result<Option<Value>> {
        if index >= self.len() {
            return Ok(None);
        }
        let removed = self.splice(index, 1, Vec::new())?;
        Ok(removed.into_iter().next())
    }

    /// Removes `delete_count` items at `start` and inserts `items` there,
    /// returning the removed values.
    pub fn splice(
        &self,
        start: usize,
        delete_count: usize,
        items: Vec<Value>,
    ) -> Result<Vec<Value>> {
        let (removed, ops) = {
            let mut slots = self.inner.slots.lock();
            let old_len = slots.len();
            let start = start.min(old_len);
            let delete_count = delete_count.min(old_len - start);
            let old = slots.clone();
            let removed: Vec<Value> = slots
                .splice(start..start + delete_count, items)
                .collect();
            let new_len = slots.len();
            let mut ops = Vec::new();
            for i in start..new_len {
                let value = slots[i].clone();
                let prev = old.get(i).cloned();
                if prev.as_ref() == Some(&value) {
                    continue;
                }
                ops.push(Op::Set {
                    path: index_path(i),
                    value,
                    prev,
                });
            }
            for i in (new_len..old_len).rev() {
                ops.push(Op::Delete {
                    path: index_path(i),
                    prev: old.get(i).cloned(),
                });
            }
            (removed, ops)
        };
        self.emit(&ops)?;
        Ok(removed)
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.inner.slots.lock().len()
    }

    /// Returns true when the array is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.slots.lock().is_empty()
    }

    /// Projects the array to plain data.
    pub fn snapshot(&self) -> Plain {
        let items: Vec<Value> = self.inner.slots.lock().clone();
        Plain::List(items.into_iter().map(|v| v.snapshot()).collect())
    }

    /// Registers a watcher that runs after each mutation burst.
    pub fn subscribe(&self, f: impl Fn(&[Op]) + 'static) -> Watch {
        let id = {
            let mut hooks = self.inner.hooks.lock();
            let id = hooks.next_watcher;
            hooks.next_watcher += 1;
            hooks.watchers.insert(id, Arc::new(f));
            id
        };
        let weak = Arc::downgrade(&self.inner);
        Watch {
            cancel: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.hooks.lock().watchers.remove(&id);
                }
            })),
        }
    }

    /// Re-emits the current value at `index` as a burst, unconditionally.
    pub(crate) fn touch_index(&self, index: usize) {
        let value = self.inner.slots.lock().get(index).cloned();
        if let Some(value) = value {
            let _ = self.emit(&[Op::Set {
                path: index_path(index),
                value: value.clone(),
                prev: Some(value),
            }]);
        }
    }

    pub(crate) fn set_silent(&self, index: usize, value: Value) {
        let mut slots = self.inner.slots.lock();
        if index < slots.len() {
            slots[index] = value;
        } else {
            slots.push(value);
        }
    }

    pub(crate) fn insert_silent(&self, index: usize, value: Value) {
        let mut slots = self.inner.slots.lock();
        let index = index.min(slots.len());
        slots.insert(index, value);
    }

    pub(crate) fn remove_silent(&self, index: usize) {
        let mut slots = self.inner.slots.lock();
        if index < slots.len() {
            slots.remove(index);
        }
    }

    pub(crate) fn set_sync_hook(&self, hook: Option<SyncHook>) {
        self.inner.hooks.lock().sync = hook;
    }

    pub(crate) fn set_lazy_hook(&self, hook: Option<IndexLazyHook>) {
        self.inner.hooks.lock().lazy = hook;
    }

    fn emit(&self, ops: &[Op]) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let (sync, watchers) = self.inner.hooks.lock().for_emit();
        if let Some(sync) = sync {
            sync(ops)?;
        }
        for watcher in watchers {
            watcher(ops);
        }
        Ok(())
    }
}

impl PartialEq for ArrayProxy {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for ArrayProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ArrayProxy")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

pub(crate) struct WeakArrayProxy {
    inner: Weak<ArrayInner>,
}

impl WeakArrayProxy {
    pub(crate) fn upgrade(&self) -> Option<ArrayProxy> {
        self.inner.upgrade().map(|inner| ArrayProxy { inner })
    }

    pub(crate) fn id(&self) -> usize {
        self.inner.as_ptr() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn collect_ops(ops: &[Op]) -> Vec<String> {
        ops.iter()
            .map(|op| match op {
                Op::Set { path, value, .. } => format!("set {:?} {:?}", path, value.snapshot()),
                Op::Delete { path, .. } => format!("del {:?}", path),
            })
            .collect()
    }

    #[test]
    fn map_insert_emits_one_burst() {
        let map = MapProxy::empty();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let _watch = map.subscribe(move |ops| sink.borrow_mut().push(ops.len()));
        map.insert("a", 1).unwrap();
        map.insert("a", 2).unwrap();
        assert_eq!(*seen.borrow(), [1, 1]);
        assert_eq!(map.get("a").unwrap().snapshot(), Plain::from(2));
    }

    #[test]
    fn splice_emits_literal_cascade() {
        let arr = ArrayProxy::empty();
        arr.splice(0, 0, vec![10.into(), 11.into(), 12.into(), 13.into()])
            .unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let _watch = arr.subscribe(move |ops| sink.borrow_mut().extend(collect_ops(ops)));
        arr.splice(2, 1, vec![99.into()]).unwrap();
        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(
            arr.snapshot(),
            Plain::list([10.0, 11.0, 99.0, 13.0])
        );
    }

    #[test]
    fn remove_shifts_and_truncates() {
        let arr = ArrayProxy::empty();
        arr.splice(0, 0, vec!["a".into(), "b".into(), "c".into()])
            .unwrap();
        let removed = arr.remove(0).unwrap().unwrap();
        assert_eq!(removed.snapshot(), Plain::from("a"));
        assert_eq!(arr.snapshot(), Plain::list(["b", "c"]));
    }

    #[test]
    fn sparse_set_fills_with_null() {
        let arr = ArrayProxy::empty();
        arr.set(2, "x").unwrap();
        assert_eq!(
            arr.snapshot(),
            Plain::List(vec![Plain::Null, Plain::Null, Plain::from("x")])
        );
    }

    #[test]
    fn rejected_burst_returns_the_error() {
        let map = MapProxy::empty();
        map.set_sync_hook(Some(Arc::new(|_ops| {
            Err(crate::Error::unsupported("$", "nope"))
        })));
        assert!(map.insert("a", 1).is_err());
    }

    #[test]
    fn watch_unsubscribes_on_drop() {
        let map = MapProxy::empty();
        let seen = Rc::new(RefCell::new(0usize));
        let sink = seen.clone();
        let watch = map.subscribe(move |_| *sink.borrow_mut() += 1);
        map.insert("a", 1).unwrap();
        drop(watch);
        map.insert("b", 2).unwrap();
        assert_eq!(*seen.borrow(), 1);
    }
}
