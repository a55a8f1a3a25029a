use crate::reactive::{Op, Segment, Value};
use indexmap::IndexMap;
use std::collections::{BTreeMap, BTreeSet};

/// The intent of a map burst: final sets and deletes, one per key.
#[derive(Default)]
pub(crate) struct MapPlan {
    pub sets: IndexMap<String, Value>,
    pub deletes: Vec<String>,
}

/// Categorizes a map burst. Only top-level ops count; for the same key the
/// later op wins: a set after a delete is a set, a delete after a set is a
/// delete.
pub(crate) fn plan_map(ops: &[Op]) -> MapPlan {
    let mut intents: IndexMap<String, Option<Value>> = IndexMap::new();
    for op in ops {
        if !op.is_top_level() {
            continue;
        }
        match op {
            Op::Set { path, value, .. } => {
                if let Segment::Key(key) = &path[0] {
                    intents.insert(key.clone(), Some(value.clone()));
                }
            }
            Op::Delete { path, .. } => {
                if let Segment::Key(key) = &path[0] {
                    intents.insert(key.clone(), None);
                }
            }
        }
    }
    let mut plan = MapPlan::default();
    for (key, intent) in intents {
        match intent {
            Some(value) => {
                plan.sets.insert(key, value);
            }
            None => plan.deletes.push(key),
        }
    }
    plan
}

/// The intent of an array burst: disjoint sets, replaces and deletes keyed by
/// index against the planning baseline.
#[derive(Default)]
pub(crate) struct ArrayPlan {
    /// Writes at or past the baseline length: appends, or null-filled gaps.
    pub sets: BTreeMap<usize, Value>,
    /// Writes below the baseline length, and delete+set pairs.
    pub replaces: BTreeMap<usize, Value>,
    /// Deletes with no surviving set at the same index.
    pub deletes: BTreeSet<usize>,
}

/// Categorizes an array burst against `baseline_len`, the doc-side length at
/// planning time. Indices are anchored to the doc side so results do not
/// drift with intermediate react-side shuffles within the burst. Bursts that
/// look like moves are expressed literally as delete plus insert.
pub(crate) fn plan_array(ops: &[Op], baseline_len: usize) -> ArrayPlan {
    let mut intents: BTreeMap<usize, Option<Value>> = BTreeMap::new();
    let mut deleted: BTreeSet<usize> = BTreeSet::new();
    for op in ops {
        if !op.is_top_level() {
            continue;
        }
        match op {
            Op::Set { path, value, .. } => {
                if let Segment::Index(ix) = path[0] {
                    intents.insert(ix, Some(value.clone()));
                }
            }
            Op::Delete { path, .. } => {
                if let Segment::Index(ix) = path[0] {
                    intents.insert(ix, None);
                    deleted.insert(ix);
                }
            }
        }
    }
    let mut plan = ArrayPlan::default();
    for (ix, intent) in intents {
        match intent {
            Some(value) => {
                if deleted.contains(&ix) || ix < baseline_len {
                    plan.replaces.insert(ix, value);
                } else {
                    plan.sets.insert(ix, value);
                }
            }
            None => {
                plan.deletes.insert(ix);
            }
        }
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn set(ix: usize, v: i64) -> Op {
        Op::Set {
            path: smallvec![Segment::Index(ix)],
            value: v.into(),
            prev: None,
        }
    }

    fn del(ix: usize) -> Op {
        Op::Delete {
            path: smallvec![Segment::Index(ix)],
            prev: None,
        }
    }

    fn key_set(key: &str, v: i64) -> Op {
        Op::Set {
            path: smallvec![Segment::Key(key.to_owned())],
            value: v.into(),
            prev: None,
        }
    }

    fn key_del(key: &str) -> Op {
        Op::Delete {
            path: smallvec![Segment::Key(key.to_owned())],
            prev: None,
        }
    }

    #[test]
    fn later_map_ops_win() {
        let plan = plan_map(&[key_set("a", 1), key_del("a"), key_set("b", 2), key_del("c")]);
        assert!(plan.sets.get("a").is_none());
        assert_eq!(plan.sets.get("b"), Some(&crate::Value::from(2i64)));
        assert_eq!(plan.deletes, ["a", "c"]);
    }

    #[test]
    fn set_after_delete_is_a_set() {
        let plan = plan_map(&[key_del("a"), key_set("a", 1)]);
        assert!(plan.sets.contains_key("a"));
        assert!(plan.deletes.is_empty());
    }

    #[test]
    fn nested_ops_are_ignored() {
        let nested = Op::Set {
            path: smallvec![Segment::Key("a".into()), Segment::Key("b".into())],
            value: 1i64.into(),
            prev: None,
        };
        let plan = plan_map(&[nested]);
        assert!(plan.sets.is_empty());
        assert!(plan.deletes.is_empty());
    }

    #[test]
    fn sets_below_the_baseline_are_replaces() {
        let plan = plan_array(&[set(2, 99)], 4);
        assert_eq!(plan.replaces.len(), 1);
        assert!(plan.sets.is_empty());
        assert!(plan.deletes.is_empty());
    }

    #[test]
    fn delete_set_pairs_promote_to_replace() {
        let plan = plan_array(&[del(5), set(5, 1)], 4);
        assert!(plan.replaces.contains_key(&5));
        assert!(plan.deletes.is_empty());
    }

    #[test]
    fn sets_at_or_past_the_baseline_are_appends() {
        let plan = plan_array(&[set(4, 1), set(6, 2)], 4);
        assert_eq!(
            plan.sets.keys().copied().collect::<Vec<_>>(),
            [4, 6]
        );
        assert!(plan.replaces.is_empty());
    }

    #[test]
    fn pure_deletes_survive() {
        let plan = plan_array(&[set(0, 1), del(2)], 3);
        assert!(plan.replaces.contains_key(&0));
        assert_eq!(plan.deletes.iter().copied().collect::<Vec<_>>(), [2]);
    }

    #[test]
    fn shifting_remove_plans_as_replaces_plus_tail_delete() {
        // Removing index 0 from [a, b, c] emits sets at 0 and 1 and a delete
        // at 2; nothing here is a move.
        let ops = [set(0, 2), set(1, 3), del(2)];
        let plan = plan_array(&ops, 3);
        assert_eq!(plan.replaces.len(), 2);
        assert_eq!(plan.deletes.len(), 1);
        assert!(plan.sets.is_empty());
    }
}
