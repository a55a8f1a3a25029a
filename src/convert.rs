use crate::context::Context;
use crate::error::{Error, Result};
use crate::guard::{classify, Node};
use crate::plain::Plain;
use crate::reactive::Value;
use indexmap::IndexMap;
use yrs::types::AsPrelim;
use yrs::{
    Any, Array, ArrayPrelim, ArrayRef, In, Map, MapPrelim, MapRef, Out, ReadTxn, TransactionMut,
};

/// Where a converted value lands in the doc.
pub(crate) enum Dest<'a> {
    MapKey(&'a MapRef, &'a str),
    ArrayInsert(&'a ArrayRef, u32),
    ArrayPush(&'a ArrayRef),
}

/// A pending value prepared for writing.
///
/// Values referring to existing shared state are deep-cloned up front:
/// a container detached later in the same transaction can no longer be read,
/// and an integrated node cannot be re-parented.
pub(crate) enum WriteSrc {
    Plain(Plain),
    Shared(In),
}

/// Prepares a react value for the flush, resolving controllers through the
/// context's identity caches.
pub(crate) fn prepare<T: ReadTxn>(txn: &T, value: &Value, ctx: &Context) -> Result<WriteSrc> {
    match value {
        Value::Plain(p) => Ok(WriteSrc::Plain(p.clone())),
        Value::Map(m) => {
            let shared = ctx
                .shared_for(m.id())
                .ok_or_else(|| Error::unsupported("$", "controller from another binding"))?;
            Ok(WriteSrc::Shared(shared.to_out().as_prelim(txn)))
        }
        Value::Array(a) => {
            let shared = ctx
                .shared_for(a.id())
                .ok_or_else(|| Error::unsupported("$", "controller from another binding"))?;
            Ok(WriteSrc::Shared(shared.to_out().as_prelim(txn)))
        }
        Value::Leaf(l) => Ok(WriteSrc::Shared(l.leaf().to_out().as_prelim(txn))),
    }
}

/// Writes a prepared value, returning the integrated doc value when it is a
/// container or leaf so the scheduler can upgrade the parent slot.
pub(crate) fn write(txn: &mut TransactionMut, dest: Dest, src: WriteSrc) -> Result<Option<Out>> {
    match src {
        WriteSrc::Shared(prelim) => Ok(put_and_get(txn, dest, prelim)),
        WriteSrc::Plain(p) => write_plain(txn, dest, &p),
    }
}

fn write_plain(txn: &mut TransactionMut, dest: Dest, value: &Plain) -> Result<Option<Out>> {
    match value {
        Plain::Map(entries) => match put_and_get(txn, dest, In::Map(MapPrelim::default())) {
            Some(Out::YMap(m)) => {
                for (k, v) in entries {
                    write_plain(txn, Dest::MapKey(&m, k), v)?;
                }
                Ok(Some(Out::YMap(m)))
            }
            other => Ok(other),
        },
        Plain::List(items) => match put_and_get(txn, dest, In::Array(ArrayPrelim::default())) {
            Some(Out::YArray(a)) => {
                for v in items {
                    write_plain(txn, Dest::ArrayPush(&a), v)?;
                }
                Ok(Some(Out::YArray(a)))
            }
            other => Ok(other),
        },
        other => {
            let any = plain_to_any(other)?;
            put(txn, dest, In::Any(any));
            Ok(None)
        }
    }
}

fn put(txn: &mut TransactionMut, dest: Dest, value: In) {
    match dest {
        Dest::MapKey(m, key) => {
            m.insert(txn, key, value);
        }
        Dest::ArrayInsert(a, index) => {
            a.insert(txn, index, value);
        }
        Dest::ArrayPush(a) => {
            a.push_back(txn, value);
        }
    }
}

fn put_and_get(txn: &mut TransactionMut, dest: Dest, value: In) -> Option<Out> {
    match dest {
        Dest::MapKey(m, key) => {
            m.insert(txn, key, value);
            m.get(txn, key)
        }
        Dest::ArrayInsert(a, index) => {
            a.insert(txn, index, value);
            a.get(txn, index)
        }
        Dest::ArrayPush(a) => {
            a.push_back(txn, value);
            a.get(txn, a.len(txn) - 1)
        }
    }
}

/// Fills a map container from plain entries, in insertion order.
pub(crate) fn fill_map(
    txn: &mut TransactionMut,
    map: &MapRef,
    entries: &IndexMap<String, Plain>,
) -> Result<()> {
    for (k, v) in entries {
        write_plain(txn, Dest::MapKey(map, k), v)?;
    }
    Ok(())
}

/// Fills an array container from plain items, preserving positions.
pub(crate) fn fill_array(txn: &mut TransactionMut, arr: &ArrayRef, items: &[Plain]) -> Result<()> {
    for v in items {
        write_plain(txn, Dest::ArrayPush(arr), v)?;
    }
    Ok(())
}

fn plain_to_any(value: &Plain) -> Result<Any> {
    match value {
        Plain::Null => Ok(Any::Null),
        Plain::Bool(b) => Ok(Any::from(*b)),
        Plain::Number(n) if n.is_finite() => Ok(Any::from(*n)),
        Plain::Number(_) => Err(Error::unsupported("$", "non-finite number")),
        Plain::String(s) => Ok(Any::from(s.as_str())),
        Plain::Date(_) | Plain::Regex(_) | Plain::Url(_) => {
            let s = value.special_string().expect("special has a string form");
            Ok(Any::from(s.as_str()))
        }
        Plain::Bytes(_) => Err(Error::unsupported("$", "byte buffer")),
        Plain::List(_) | Plain::Map(_) => Err(Error::unsupported("$", "container")),
    }
}

/// Projects a doc value to plain data.
pub(crate) fn shared_to_plain<T: ReadTxn>(txn: &T, out: &Out) -> Plain {
    match classify(out.clone()) {
        Node::Primitive(any) => any_to_plain(&any),
        Node::Map(m) => Plain::Map(
            m.iter(txn)
                .map(|(k, v)| (k.to_string(), shared_to_plain(txn, &v)))
                .collect(),
        ),
        Node::Array(a) => {
            Plain::List(a.iter(txn).map(|v| shared_to_plain(txn, &v)).collect())
        }
        Node::Leaf(l) => Plain::String(l.get_string(txn)),
        Node::Other(_) => Plain::Null,
    }
}

/// The projection the doc hands back for a written plain value: specials
/// become their string forms, everything else survives unchanged.
pub(crate) fn normalized(value: &Plain) -> Plain {
    match value {
        Plain::Date(_) | Plain::Regex(_) | Plain::Url(_) => {
            Plain::String(value.special_string().expect("special has a string form"))
        }
        Plain::List(items) => Plain::List(items.iter().map(normalized).collect()),
        Plain::Map(entries) => Plain::Map(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), normalized(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Projects a primitive doc value to plain data. `Undefined` projects to
/// null; plain `Any` maps are keyed in sorted order for a stable projection.
pub(crate) fn any_to_plain(any: &Any) -> Plain {
    match any {
        Any::Null | Any::Undefined => Plain::Null,
        Any::Bool(b) => Plain::Bool(*b),
        Any::Number(n) => Plain::Number(*n),
        Any::BigInt(i) => Plain::Number(*i as f64),
        Any::String(s) => Plain::String(s.to_string()),
        Any::Buffer(b) => Plain::Bytes(b.to_vec()),
        Any::Array(items) => Plain::List(items.iter().map(any_to_plain).collect()),
        Any::Map(entries) => {
            let mut keys: Vec<&String> = entries.keys().collect();
            keys.sort();
            Plain::Map(
                keys.into_iter()
                    .map(|k| (k.clone(), any_to_plain(&entries[k])))
                    .collect(),
            )
        }
    }
}

/// Fails fast on any node anywhere in `value` that cannot be represented in
/// the doc. Does not mutate; runs before anything is enqueued so a rejected
/// burst can be rolled back without touching the doc.
pub(crate) fn validate_deep(value: &Value, ctx: &Context) -> Result<()> {
    match value {
        Value::Plain(p) => {
            let mut trace = Trace::default();
            validate_plain(p, &mut trace)
        }
        Value::Map(m) => ctx
            .shared_for(m.id())
            .map(|_| ())
            .ok_or_else(|| Error::unsupported("$", "controller from another binding")),
        Value::Array(a) => ctx
            .shared_for(a.id())
            .map(|_| ())
            .ok_or_else(|| Error::unsupported("$", "controller from another binding")),
        Value::Leaf(_) => Ok(()),
    }
}

fn validate_plain(value: &Plain, trace: &mut Trace) -> Result<()> {
    match value {
        Plain::Number(n) if !n.is_finite() => {
            Err(Error::unsupported(trace.render(), "non-finite number"))
        }
        Plain::Bytes(_) => Err(Error::unsupported(trace.render(), "byte buffer")),
        Plain::List(items) => {
            for (ix, item) in items.iter().enumerate() {
                trace.push_index(ix);
                validate_plain(item, trace)?;
                trace.pop();
            }
            Ok(())
        }
        Plain::Map(entries) => {
            for (key, item) in entries {
                trace.push_key(key);
                validate_plain(item, trace)?;
                trace.pop();
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

#[derive(Default)]
struct Trace(Vec<String>);

impl Trace {
    fn push_key(&mut self, key: &str) {
        self.0.push(format!(".{key}"));
    }

    fn push_index(&mut self, index: usize) {
        self.0.push(format!("[{index}]"));
    }

    fn pop(&mut self) {
        self.0.pop();
    }

    fn render(&self) -> String {
        let mut out = String::from("$");
        for seg in &self.0 {
            out.push_str(seg);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plain::Plain;
    use yrs::{Doc, Transact};

    fn doc_with_root() -> (Doc, MapRef) {
        let doc = Doc::new();
        let root = doc.get_or_insert_map("root");
        (doc, root)
    }

    #[test]
    fn validate_reports_the_offending_path() {
        let nested = Plain::map([(
            "user",
            Plain::map([("scores", Plain::List(vec![1.0.into(), f64::NAN.into()]))]),
        )]);
        let mut trace = Trace::default();
        let err = validate_plain(&nested, &mut trace).unwrap_err();
        match err {
            Error::UnsupportedValue { path, reason } => {
                assert_eq!(path, "$.user.scores[1]");
                assert_eq!(reason, "non-finite number");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn validate_rejects_byte_buffers() {
        let mut trace = Trace::default();
        let err = validate_plain(&Plain::Bytes(vec![1, 2]), &mut trace).unwrap_err();
        assert!(matches!(err, Error::UnsupportedValue { .. }));
    }

    #[test]
    fn nested_plain_round_trips_through_the_doc() {
        let (doc, root) = doc_with_root();
        let value = Plain::map([
            ("name", Plain::from("ada")),
            ("tags", Plain::list(["a", "b"])),
            ("meta", Plain::map([("depth", Plain::from(2.0))])),
        ]);
        {
            let mut txn = doc.transact_mut();
            write_plain(
                &mut txn,
                Dest::MapKey(&root, "data"),
                &value,
            )
            .unwrap();
        }
        let txn = doc.transact();
        let back = shared_to_plain(&txn, &root.get(&txn, "data").unwrap());
        assert_eq!(back, value);
    }

    #[test]
    fn specials_project_as_strings() {
        let (doc, root) = doc_with_root();
        let date: chrono::DateTime<chrono::Utc> = "2024-05-01T12:00:00Z".parse().unwrap();
        let value = Plain::map([
            ("when", Plain::Date(date)),
            ("pat", Plain::Regex(regex::Regex::new("a+").unwrap())),
            ("link", Plain::Url(url::Url::parse("https://example.com/a").unwrap())),
        ]);
        {
            let mut txn = doc.transact_mut();
            write_plain(&mut txn, Dest::MapKey(&root, "data"), &value).unwrap();
        }
        let txn = doc.transact();
        let back = shared_to_plain(&txn, &root.get(&txn, "data").unwrap());
        assert_eq!(
            back,
            Plain::map([
                ("when", "2024-05-01T12:00:00.000Z"),
                ("pat", "a+"),
                ("link", "https://example.com/a"),
            ])
        );
    }
}
