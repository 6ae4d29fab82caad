//! Model-based property tests: the store against a plain map.

use arbor::{Config, PageId, Store, StoreError};
use proptest::prelude::*;
use std::collections::HashMap;

#[derive(Debug, Clone)]
enum Op {
    /// Create a page and stamp its first byte.
    Create(u8),
    /// Rewrite the first byte of the i-th created page, if still bound.
    Update(usize, u8),
    /// Remove the i-th created page, if still bound.
    Remove(usize),
    /// Commit the running transaction and branch a fresh one.
    Cycle,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => any::<u8>().prop_map(Op::Create),
        3 => (any::<usize>(), any::<u8>()).prop_map(|(i, b)| Op::Update(i, b)),
        2 => any::<usize>().prop_map(Op::Remove),
        1 => Just(Op::Cycle),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Arbitrary create/update/remove sequences, interleaved with
    /// commit-and-branch cycles, always agree with a map model, and the
    /// structural checker stays green.
    #[test]
    fn store_matches_map_model(ops in prop::collection::vec(op_strategy(), 1..120)) {
        let store = Store::new(Config::compact()).unwrap();
        let mut model: HashMap<PageId, u8> = HashMap::new();
        let mut created: Vec<PageId> = Vec::new();
        let mut txn = store.branch().unwrap();

        for op in ops {
            match op {
                Op::Create(byte) => {
                    let page = txn.create(16).unwrap();
                    page.write(|d| d[0] = byte).unwrap();
                    model.insert(page.id(), byte);
                    created.push(page.id());
                }
                Op::Update(i, byte) => {
                    if created.is_empty() {
                        continue;
                    }
                    let id = created[i % created.len()];
                    if model.contains_key(&id) {
                        let page = txn.get_for_update(id).unwrap();
                        page.write(|d| d[0] = byte).unwrap();
                        model.insert(id, byte);
                    } else {
                        prop_assert!(matches!(
                            txn.get_for_update(id),
                            Err(StoreError::PageNotFound(_))
                        ));
                    }
                }
                Op::Remove(i) => {
                    if created.is_empty() {
                        continue;
                    }
                    let id = created[i % created.len()];
                    if model.remove(&id).is_some() {
                        txn.remove(id).unwrap();
                    } else {
                        prop_assert!(matches!(
                            txn.remove(id),
                            Err(StoreError::PageNotFound(_))
                        ));
                    }
                }
                Op::Cycle => {
                    txn.commit().unwrap();
                    txn = store.branch().unwrap();
                }
            }
            prop_assert!(txn.check().unwrap());
        }

        for (id, byte) in &model {
            let page = txn.get(*id).unwrap();
            prop_assert_eq!(page.read(|d| d[0]).unwrap(), *byte);
        }
        for id in &created {
            if !model.contains_key(id) {
                prop_assert!(matches!(txn.get(*id), Err(StoreError::PageNotFound(_))));
            }
        }
        txn.rollback().unwrap();
    }

    /// A rolled back transaction never leaks pages or memory, whatever it
    /// did beforehand.
    #[test]
    fn rollback_restores_footprint(ops in prop::collection::vec(op_strategy(), 1..80)) {
        let store = Store::new(Config::compact()).unwrap();

        // seed a committed base the transaction can mutate
        let base = store.branch().unwrap();
        let mut created: Vec<PageId> = Vec::new();
        for _ in 0..10 {
            created.push(base.create(16).unwrap().id());
        }
        base.commit().unwrap();
        let pages_before = store.page_count();
        let memory_before = store.memory_in_use();

        let txn = store.branch().unwrap();
        let mut bound: Vec<PageId> = created.clone();
        for op in ops {
            match op {
                Op::Create(byte) => {
                    let page = txn.create(16).unwrap();
                    page.write(|d| d[0] = byte).unwrap();
                    bound.push(page.id());
                }
                Op::Update(i, byte) => {
                    if !bound.is_empty() {
                        let id = bound[i % bound.len()];
                        let page = txn.get_for_update(id).unwrap();
                        page.write(|d| d[0] = byte).unwrap();
                    }
                }
                Op::Remove(i) => {
                    if !bound.is_empty() {
                        let id = bound.remove(i % bound.len());
                        txn.remove(id).unwrap();
                    }
                }
                // no commits in this scenario
                Op::Cycle => {}
            }
        }

        txn.rollback().unwrap();
        prop_assert_eq!(store.page_count(), pages_before);
        prop_assert_eq!(store.memory_in_use(), memory_before);
        prop_assert!(store.master().unwrap().check().unwrap());
    }
}
