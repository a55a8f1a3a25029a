use anyhow::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use yrs::updates::decoder::Decode;
use yrs::{DeepObservable, Doc, Map, ReadTxn, Text, TextPrelim, Transact, Update};
use yrs_reactive::{origin, Binding, Plain, Shared, Value};

fn log_init() {
    tracing_log::LogTracer::init().ok();
    let env = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_owned());
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::new(env))
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
}

fn map_root() -> impl Fn(&Doc) -> Shared + 'static {
    |doc: &Doc| Shared::Map(doc.get_or_insert_map("data"))
}

fn array_root() -> impl Fn(&Doc) -> Shared + 'static {
    |doc: &Doc| Shared::Array(doc.get_or_insert_array("data"))
}

/// Relays everything `dst` is missing from `src` as one encoded update.
fn relay(src: &Doc, dst: &Doc) {
    let sv = dst.transact().state_vector();
    let update = src.transact().encode_state_as_update_v1(&sv);
    let mut txn = dst.transact_mut();
    txn.apply_update(Update::decode_v1(&update).unwrap()).unwrap();
}

/// Counts doc transactions carrying the bridge origin.
fn bridge_txn_counter(doc: &Doc) -> (Arc<AtomicUsize>, yrs::Subscription) {
    let counter = Arc::new(AtomicUsize::new(0));
    let count = counter.clone();
    let root = doc.get_or_insert_map("data");
    let sub = root.observe_deep(move |txn, _events| {
        if txn.origin() == Some(&origin()) {
            count.fetch_add(1, Ordering::SeqCst);
        }
    });
    (counter, sub)
}

#[test]
fn simple_map_set_reaches_a_relayed_peer() -> Result<()> {
    log_init();
    let doc_a = Doc::new();
    let a = Binding::new(&doc_a, map_root())?;
    let proxy_a = a.root_map().unwrap();
    proxy_a.insert("foo", "a")?;
    a.flush()?;

    {
        let txn = doc_a.transact();
        let root = txn.get_map("data").unwrap();
        assert_eq!(root.len(&txn), 1);
    }

    let doc_b = Doc::new();
    let b = Binding::new(&doc_b, map_root())?;
    relay(&doc_a, &doc_b);
    let proxy_b = b.root_map().unwrap();
    assert_eq!(proxy_b.get("foo").unwrap().snapshot(), Plain::from("a"));
    Ok(())
}

#[test]
fn nested_values_materialize_and_keep_writing() -> Result<()> {
    log_init();
    let doc = Doc::new();
    let binding = Binding::new(&doc, map_root())?;
    let proxy = binding.root_map().unwrap();
    proxy.insert("foo", Plain::map([("bar", "a")]))?;
    binding.flush()?;

    let foo = match proxy.get("foo").unwrap() {
        Value::Map(m) => m,
        other => panic!("expected a controller, got {other:?}"),
    };
    assert_eq!(foo.get("bar").unwrap().snapshot(), Plain::from("a"));

    foo.insert("bar", "b")?;
    binding.flush()?;

    let doc_b = Doc::new();
    let b = Binding::new(&doc_b, map_root())?;
    relay(&doc, &doc_b);
    assert_eq!(
        b.root_map().unwrap().snapshot(),
        Plain::map([("foo", Plain::map([("bar", "b")]))])
    );
    Ok(())
}

#[test]
fn splice_replaces_in_place() -> Result<()> {
    log_init();
    let doc = Doc::new();
    let binding = Binding::new(&doc, array_root())?;
    let arr = binding.root_array().unwrap();
    arr.splice(0, 0, vec![10.into(), 11.into(), 12.into(), 13.into()])?;
    binding.flush()?;

    arr.splice(2, 1, vec![99.into()])?;
    binding.flush()?;

    let doc_b = Doc::new();
    let b = Binding::new(&doc_b, array_root())?;
    relay(&doc, &doc_b);
    assert_eq!(
        b.root_array().unwrap().snapshot(),
        Plain::list([10.0, 11.0, 99.0, 13.0])
    );
    Ok(())
}

#[test]
fn pushes_in_one_window_land_in_order() -> Result<()> {
    log_init();
    let doc = Doc::new();
    let binding = Binding::new(&doc, array_root())?;
    let arr = binding.root_array().unwrap();
    arr.push("a")?;
    arr.push("b")?;
    binding.flush()?;

    let doc_b = Doc::new();
    let b = Binding::new(&doc_b, array_root())?;
    relay(&doc, &doc_b);
    assert_eq!(b.root_array().unwrap().snapshot(), Plain::list(["a", "b"]));
    Ok(())
}

#[test]
fn bootstrap_refuses_a_non_empty_root() -> Result<()> {
    log_init();
    let doc = Doc::new();
    {
        let root = doc.get_or_insert_map("data");
        let mut txn = doc.transact_mut();
        root.insert(&mut txn, "k", 1.0);
    }
    let binding = Binding::new(&doc, map_root())?;
    binding.bootstrap(Plain::map([("k", 2.0)]))?;

    let proxy = binding.root_map().unwrap();
    assert_eq!(proxy.get("k").unwrap().snapshot(), Plain::from(1.0));
    let txn = doc.transact();
    let root = txn.get_map("data").unwrap();
    assert_eq!(root.len(&txn), 1);
    Ok(())
}

#[test]
fn bootstrap_twice_is_a_no_op() -> Result<()> {
    log_init();
    let doc = Doc::new();
    let binding = Binding::new(&doc, map_root())?;
    binding.bootstrap(Plain::map([("k", 1.0)]))?;
    binding.bootstrap(Plain::map([("k", 2.0)]))?;
    let proxy = binding.root_map().unwrap();
    assert_eq!(proxy.get("k").unwrap().snapshot(), Plain::from(1.0));
    Ok(())
}

#[test]
fn unsupported_values_roll_the_burst_back() -> Result<()> {
    log_init();
    let doc = Doc::new();
    let binding = Binding::new(&doc, map_root())?;
    let proxy = binding.root_map().unwrap();
    proxy.insert("a", 1.0)?;
    binding.flush()?;

    let err = proxy
        .insert("bad", Plain::Bytes(vec![1, 2, 3]))
        .unwrap_err();
    assert!(matches!(
        err,
        yrs_reactive::Error::UnsupportedValue { .. }
    ));
    assert!(!proxy.contains_key("bad"));
    assert_eq!(proxy.snapshot(), Plain::map([("a", 1.0)]));

    binding.flush()?;
    let txn = doc.transact();
    let root = txn.get_map("data").unwrap();
    assert_eq!(root.len(&txn), 1);
    Ok(())
}

#[test]
fn nan_is_rejected_with_its_path() -> Result<()> {
    log_init();
    let doc = Doc::new();
    let binding = Binding::new(&doc, map_root())?;
    let proxy = binding.root_map().unwrap();
    let err = proxy
        .insert("v", Plain::map([("n", f64::NAN)]))
        .unwrap_err();
    match err {
        yrs_reactive::Error::UnsupportedValue { path, .. } => assert_eq!(path, "$.n"),
        other => panic!("unexpected error: {other}"),
    }
    Ok(())
}

#[test]
fn dispose_stops_both_directions_and_is_idempotent() -> Result<()> {
    log_init();
    let doc = Doc::new();
    let binding = Binding::new(&doc, map_root())?;
    let proxy = binding.root_map().unwrap();
    proxy.insert("x", 1.0)?;
    binding.flush()?;

    binding.dispose();
    binding.dispose();

    {
        let root = doc.get_or_insert_map("data");
        let mut txn = doc.transact_mut();
        root.insert(&mut txn, "remote", 9.0);
    }
    assert!(!proxy.contains_key("remote"));

    proxy.insert("y", 2.0)?;
    binding.flush()?;
    let txn = doc.transact();
    let root = txn.get_map("data").unwrap();
    assert!(root.get(&txn, "y").is_none());
    assert_eq!(proxy.get("y").unwrap().snapshot(), Plain::from(2.0));
    Ok(())
}

#[test]
fn deep_remote_changes_reach_an_untouched_subtree() -> Result<()> {
    log_init();
    let doc_a = Doc::new();
    let a = Binding::new(&doc_a, map_root())?;
    a.bootstrap(Plain::map([(
        "data",
        Plain::map([("a", Plain::map([("b", Plain::map([("c", 1.0)]))]))]),
    )]))?;

    let doc_b = Doc::new();
    let b = Binding::new(&doc_b, map_root())?;
    relay(&doc_a, &doc_b);

    // B only touches the first level; nothing deeper is materialized.
    let data_b = match b.root_map().unwrap().get("data").unwrap() {
        Value::Map(m) => m,
        other => panic!("expected a controller, got {other:?}"),
    };

    let data_a = a.root_map().unwrap().get("data").unwrap();
    let c = data_a
        .as_map()
        .unwrap()
        .get("a")
        .and_then(|v| v.as_map().cloned())
        .unwrap()
        .get("b")
        .and_then(|v| v.as_map().cloned())
        .unwrap();
    c.insert("c", 2.0)?;
    a.flush()?;
    relay(&doc_a, &doc_b);

    let got = data_b
        .get("a")
        .unwrap()
        .as_map()
        .unwrap()
        .get("b")
        .unwrap()
        .as_map()
        .unwrap()
        .get("c")
        .unwrap()
        .snapshot();
    assert_eq!(got, Plain::from(2.0));
    Ok(())
}

#[test]
fn one_transaction_per_flush_and_no_echo() -> Result<()> {
    log_init();
    let doc_a = Doc::new();
    let (count_a, _sub_a) = bridge_txn_counter(&doc_a);
    let a = Binding::new(&doc_a, map_root())?;
    let proxy_a = a.root_map().unwrap();
    proxy_a.insert("x", 1.0)?;
    proxy_a.insert("y", 2.0)?;
    proxy_a.remove("x")?;
    a.flush()?;
    assert_eq!(count_a.load(Ordering::SeqCst), 1);

    let doc_b = Doc::new();
    let (count_b, _sub_b) = bridge_txn_counter(&doc_b);
    let b = Binding::new(&doc_b, map_root())?;
    relay(&doc_a, &doc_b);
    b.flush()?;
    assert_eq!(count_b.load(Ordering::SeqCst), 0);
    assert_eq!(
        b.root_map().unwrap().snapshot(),
        Plain::map([("y", 2.0)])
    );
    Ok(())
}

#[test]
fn initial_state_preserves_remote_keys() -> Result<()> {
    log_init();
    let doc = Doc::new();
    {
        let root = doc.get_or_insert_map("data");
        let mut txn = doc.transact_mut();
        root.insert(&mut txn, "remote", 1.0);
    }
    let binding = Binding::with_initial(&doc, map_root(), Plain::map([("local", 2.0)]))?;
    let proxy = binding.root_map().unwrap();
    assert_eq!(proxy.get("remote").unwrap().snapshot(), Plain::from(1.0));
    assert_eq!(proxy.get("local").unwrap().snapshot(), Plain::from(2.0));
    Ok(())
}

#[test]
fn leaves_stay_opaque_but_notify_watchers() -> Result<()> {
    log_init();
    let doc = Doc::new();
    let binding = Binding::new(&doc, map_root())?;
    let proxy = binding.root_map().unwrap();

    let bursts = Arc::new(AtomicUsize::new(0));
    let seen = bursts.clone();
    let _watch = proxy.subscribe(move |_ops| {
        seen.fetch_add(1, Ordering::SeqCst);
    });

    {
        let root = doc.get_or_insert_map("data");
        let mut txn = doc.transact_mut();
        root.insert(&mut txn, "note", TextPrelim::new("hi"));
    }
    assert!(bursts.load(Ordering::SeqCst) >= 1);

    let leaf = match proxy.get("note").unwrap() {
        Value::Leaf(l) => l,
        other => panic!("expected a leaf, got {other:?}"),
    };
    let text = leaf.leaf().as_text().unwrap().clone();
    let before = bursts.load(Ordering::SeqCst);
    {
        let mut txn = doc.transact_mut();
        text.insert(&mut txn, 2, "!");
    }
    assert!(bursts.load(Ordering::SeqCst) > before);
    assert_eq!(leaf.string(), "hi!");

    // The doc side never saw a bridge write for any of this.
    binding.flush()?;
    let txn = doc.transact();
    let root = txn.get_map("data").unwrap();
    assert_eq!(root.len(&txn), 1);
    Ok(())
}

#[test]
fn moving_a_subtree_clones_it() -> Result<()> {
    log_init();
    let doc = Doc::new();
    let binding = Binding::new(&doc, map_root())?;
    let proxy = binding.root_map().unwrap();
    proxy.insert("src", Plain::map([("v", 1.0)]))?;
    binding.flush()?;

    let src = proxy.get("src").unwrap();
    proxy.insert("dst", src)?;
    binding.flush()?;

    let doc_b = Doc::new();
    let b = Binding::new(&doc_b, map_root())?;
    relay(&doc, &doc_b);
    let snap = b.root_map().unwrap().snapshot();
    assert_eq!(snap.get("src").unwrap(), snap.get("dst").unwrap());
    Ok(())
}

#[test]
fn repeated_reads_return_the_same_controller() -> Result<()> {
    log_init();
    let doc = Doc::new();
    let binding = Binding::new(&doc, map_root())?;
    let proxy = binding.root_map().unwrap();
    proxy.insert("nested", Plain::map([("x", 1.0)]))?;
    binding.flush()?;

    let first = proxy.get("nested").unwrap();
    let second = proxy.get("nested").unwrap();
    match (first, second) {
        (Value::Map(a), Value::Map(b)) => assert_eq!(a, b),
        other => panic!("expected controllers, got {other:?}"),
    }
    Ok(())
}

#[async_std::test]
async fn polling_the_binding_drives_the_flush() -> Result<()> {
    log_init();
    let doc = Doc::new();
    let mut binding = Binding::new(&doc, map_root())?;
    binding.root_map().unwrap().insert("foo", "a")?;
    std::pin::Pin::new(&mut binding).await?;

    let txn = doc.transact();
    let root = txn.get_map("data").unwrap();
    assert_eq!(root.len(&txn), 1);
    Ok(())
}
