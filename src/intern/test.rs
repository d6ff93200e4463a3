use std::sync::Arc;

use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing_test::traced_test;

use super::WeakSet;

#[test]
#[traced_test]
fn equal_values_share_one_copy() {
    let mut set = WeakSet::new();
    let a = set.add("parse".to_owned());
    let b = set.add("parse".to_owned());
    let c = set.add("print".to_owned());
    assert!(Arc::ptr_eq(&a, &b));
    assert!(!Arc::ptr_eq(&a, &c));
    assert_eq!(**a, "parse");
    assert_eq!(set.size(), 2);
}

#[test]
#[traced_test]
fn dropped_values_disappear_on_the_next_operation() {
    let mut set = WeakSet::new();
    let keep = set.add(1u32);
    let gone = set.add(2u32);
    assert_eq!(set.size(), 2);
    drop(gone);
    // nothing happened to the set yet
    assert_eq!(set.size(), 2);
    assert!(!set.contains(&2));
    assert_eq!(set.size(), 1);
    assert!(set.contains(&1));
    drop(keep);
}

#[test]
#[traced_test]
fn re_adding_after_drop_makes_a_new_copy() {
    let mut set = WeakSet::new();
    let first = set.add("x".to_owned());
    let weak = Arc::downgrade(&first);
    drop(first);
    let second = set.add("x".to_owned());
    assert_eq!(**second, "x");
    assert_eq!(set.size(), 1);
    assert!(weak.upgrade().is_none());
}

#[test]
#[traced_test]
fn the_set_does_not_keep_values_alive() {
    let mut set = WeakSet::new();
    let value = set.add(vec![1, 2, 3]);
    let weak = Arc::downgrade(&value);
    drop(value);
    assert!(weak.upgrade().is_none());
    assert!(set.get(&vec![1, 2, 3]).is_none());
}

#[test]
#[traced_test]
fn table_grows_before_it_gets_crowded() {
    let mut set = WeakSet::new();
    let start = set.capacity();
    let held = (0..1000).map(|i| set.add(i)).collect::<Vec<_>>();
    assert!(set.capacity() > start);
    assert!(set.size() as f64 * 1.75 <= set.capacity() as f64);
    assert!(set.capacity().is_power_of_two());
    for (i, value) in held.iter().enumerate() {
        assert!(Arc::ptr_eq(value, &set.get(&i).unwrap()));
    }
}

#[test]
#[traced_test]
fn remove_leaves_references_usable() {
    let mut set = WeakSet::new();
    let a = set.add("a".to_owned());
    let removed = set.remove(&"a".to_owned()).unwrap();
    assert!(Arc::ptr_eq(&a, &removed));
    assert!(!set.contains(&"a".to_owned()));
    assert_eq!(set.size(), 0);
    assert_eq!(**a, "a");
    assert!(set.remove(&"a".to_owned()).is_none());
    // the old copy is no longer canonical
    let b = set.add("a".to_owned());
    assert!(!Arc::ptr_eq(&a, &b));
}

#[test]
#[traced_test]
fn random_drops_keep_lookups_consistent() {
    let mut rng = StdRng::seed_from_u64(0x1A7E);
    let mut set = WeakSet::with_capacity(4);
    let mut held = std::collections::HashMap::new();
    for _ in 0..5000 {
        let v = rng.gen_range(0..300u32);
        match rng.gen_range(0..3) {
            0 => {
                let got = set.add(v);
                if let Some(prev) = held.get(&v) {
                    assert!(Arc::ptr_eq(prev, &got));
                }
                held.insert(v, got);
            }
            1 => {
                held.remove(&v);
            }
            _ => {
                assert_eq!(set.contains(&v), held.contains_key(&v), "value {v}");
            }
        }
    }
    // one more operation to sweep everything that was dropped
    set.contains(&u32::MAX);
    assert_eq!(set.size(), held.len());
    for v in held.keys() {
        assert!(set.contains(v));
    }
}
