use crate::convert::{self, normalized};
use crate::plain::Plain;
use crate::plan::{plan_array, plan_map};
use crate::reactive::{Op, Segment, Value};
use chrono::{TimeZone, Utc};
use indexmap::IndexMap;
use proptest::prelude::*;
use smallvec::smallvec;
use yrs::{Doc, Map, Transact};

pub fn arb_key() -> impl Strategy<Value = String> {
    "[a-z]{1,4}"
}

pub fn arb_primitive() -> impl Strategy<Value = Plain> {
    prop_oneof![
        Just(Plain::Null),
        any::<bool>().prop_map(Plain::Bool),
        (-1.0e6f64..1.0e6).prop_map(Plain::Number),
        "[a-z0-9]{0,6}".prop_map(Plain::from),
    ]
}

pub fn arb_special() -> impl Strategy<Value = Plain> {
    prop_oneof![
        (0i64..4_000_000_000).prop_map(|secs| Plain::Date(Utc.timestamp_opt(secs, 0).unwrap())),
        prop_oneof![Just("a+b"), Just("[0-9]{2}"), Just("x|y")]
            .prop_map(|p| Plain::Regex(regex::Regex::new(p).unwrap())),
        "[a-z]{1,8}".prop_map(|path| {
            Plain::Url(url::Url::parse(&format!("https://example.com/{path}")).unwrap())
        }),
    ]
}

pub fn arb_plain() -> impl Strategy<Value = Plain> {
    let leaf = prop_oneof![arb_primitive(), arb_special()];
    leaf.prop_recursive(4, 32, 5, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..5).prop_map(Plain::List),
            prop::collection::btree_map(arb_key(), inner, 0..5)
                .prop_map(|m| Plain::Map(m.into_iter().collect())),
        ]
    })
}

fn key_op(key: String, write: Option<i64>) -> Op {
    match write {
        Some(v) => Op::Set {
            path: smallvec![Segment::Key(key)],
            value: v.into(),
            prev: None,
        },
        None => Op::Delete {
            path: smallvec![Segment::Key(key)],
            prev: None,
        },
    }
}

fn index_op(index: usize, write: Option<i64>) -> Op {
    match write {
        Some(v) => Op::Set {
            path: smallvec![Segment::Index(index)],
            value: v.into(),
            prev: None,
        },
        None => Op::Delete {
            path: smallvec![Segment::Index(index)],
            prev: None,
        },
    }
}

proptest! {
    #[test]
    fn plain_round_trips_through_a_doc(value in arb_plain()) {
        let doc = Doc::new();
        let root = doc.get_or_insert_map("root");
        let wrapper = Plain::map([("v", value.clone())]);
        {
            let mut txn = doc.transact_mut();
            let Plain::Map(entries) = &wrapper else { unreachable!() };
            convert::fill_map(&mut txn, &root, entries).unwrap();
        }
        let txn = doc.transact();
        let back = convert::shared_to_plain(&txn, &root.get(&txn, "v").unwrap());
        prop_assert_eq!(back, normalized(&value));
    }

    #[test]
    fn map_plan_matches_the_last_writer(
        writes in prop::collection::vec((arb_key(), prop::option::of(-100i64..100)), 0..20)
    ) {
        let ops: Vec<Op> = writes
            .iter()
            .map(|(k, w)| key_op(k.clone(), *w))
            .collect();
        let mut last: IndexMap<String, Option<i64>> = IndexMap::new();
        for (k, w) in &writes {
            last.insert(k.clone(), *w);
        }
        let plan = plan_map(&ops);
        for (key, write) in &last {
            match write {
                Some(v) => {
                    prop_assert_eq!(plan.sets.get(key), Some(&Value::from(*v)));
                    prop_assert!(!plan.deletes.contains(key));
                }
                None => {
                    prop_assert!(plan.deletes.contains(key));
                    prop_assert!(!plan.sets.contains_key(key));
                }
            }
        }
        prop_assert_eq!(plan.sets.len() + plan.deletes.len(), last.len());
    }

    #[test]
    fn array_plan_is_disjoint_and_anchored(
        writes in prop::collection::vec((0usize..8, prop::option::of(-100i64..100)), 0..20),
        baseline in 0usize..6,
    ) {
        let ops: Vec<Op> = writes
            .iter()
            .map(|(ix, w)| index_op(*ix, *w))
            .collect();
        let plan = plan_array(&ops, baseline);
        for ix in plan.sets.keys() {
            prop_assert!(!plan.replaces.contains_key(ix));
            prop_assert!(!plan.deletes.contains(ix));
            // appends and gap fills only ever sit at or past the baseline
            prop_assert!(*ix >= baseline);
        }
        for ix in plan.replaces.keys() {
            prop_assert!(!plan.deletes.contains(ix));
        }
    }
}
