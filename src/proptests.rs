use super::*;

use crossbeam_epoch as epoch;
use proptest::prelude::*;
use proptest_derive::Arbitrary;
use std::collections::BTreeMap;

fn index_strategy() -> impl Strategy<Value = u64> {
    // Mostly small indices so entries collide and share nodes, plus a few
    // far away ones that force extra levels.
    prop_oneof![
        8 => 0u64..300,
        2 => (0u64..300).prop_map(|i| (1 << 20) + i),
        1 => (0u64..64).prop_map(|i| u64::MAX - i),
        1 => any::<u64>(),
    ]
}

fn order_strategy() -> impl Strategy<Value = u32> {
    // The wide orders land in the shift-54 and shift-60 top nodes.
    prop_oneof![
        3 => 1u32..=13,
        1 => 58u32..=63,
    ]
}

fn tag_strategy() -> impl Strategy<Value = usize> {
    0..MAX_TAGS
}

#[derive(Clone, Debug, Arbitrary)]
enum Op {
    #[proptest(weight = 6)]
    Insert(#[proptest(strategy = "index_strategy()")] u64),
    #[proptest(weight = 2)]
    InsertOrder(
        #[proptest(strategy = "index_strategy()")] u64,
        #[proptest(strategy = "order_strategy()")] u32,
    ),
    #[proptest(weight = 3)]
    Delete(#[proptest(strategy = "index_strategy()")] u64),
    DeleteItem(#[proptest(strategy = "index_strategy()")] u64, bool),
    Replace(#[proptest(strategy = "index_strategy()")] u64),
    #[proptest(weight = 3)]
    TagSet(
        #[proptest(strategy = "index_strategy()")] u64,
        #[proptest(strategy = "tag_strategy()")] usize,
    ),
    #[proptest(weight = 2)]
    TagClear(
        #[proptest(strategy = "index_strategy()")] u64,
        #[proptest(strategy = "tag_strategy()")] usize,
    ),
    RangeTag {
        #[proptest(strategy = "index_strategy()")]
        first: u64,
        #[proptest(strategy = "index_strategy()")]
        last: u64,
        #[proptest(strategy = "1usize..8")]
        budget: usize,
        #[proptest(strategy = "tag_strategy()")]
        if_tag: usize,
        #[proptest(strategy = "tag_strategy()")]
        set_tag: usize,
    },
}

fn ops_strategy() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(any::<Op>(), 0..=300)
}

#[derive(Debug)]
struct Entry {
    order: u32,
    value: u64,
    tags: [bool; MAX_TAGS],
}

impl Entry {
    fn last(&self, first: u64) -> u64 {
        first | ((1u64 << self.order) - 1)
    }
}

/// Reference model: entries keyed by the first index of their block.
#[derive(Default)]
struct Model {
    entries: BTreeMap<u64, Entry>,
}

impl Model {
    fn covering(&self, index: u64) -> Option<u64> {
        let (&first, entry) = self.entries.range(..=index).next_back()?;
        (index <= entry.last(first)).then_some(first)
    }

    fn overlaps(&self, first: u64, last: u64) -> bool {
        self.covering(first).is_some() || self.entries.range(first..=last).next().is_some()
    }

    fn entry_mut(&mut self, index: u64) -> Option<&mut Entry> {
        let first = self.covering(index)?;
        self.entries.get_mut(&first)
    }

    fn remove(&mut self, index: u64) -> Option<u64> {
        let first = self.covering(index)?;
        self.entries.remove(&first).map(|entry| entry.value)
    }

    /// Blocks in `first..=last` (or covering `first`) that carry `tag`.
    fn tagged_in(&self, first: u64, last: u64, tag: usize) -> Vec<u64> {
        let start = self.covering(first).unwrap_or(first);
        self.entries
            .range(start..=last)
            .filter(|(_, entry)| entry.tags[tag])
            .map(|(&index, _)| index)
            .collect()
    }
}

fn check_against_model(tree: &RadixTree<u64>, model: &Model, query: u64) -> std::result::Result<(), TestCaseError> {
    let guard = &epoch::pin();
    prop_assert_eq!(tree.len(), model.entries.len());

    for (&first, entry) in &model.entries {
        let last = entry.last(first);
        prop_assert_eq!(tree.get(first, guard), Some(&entry.value));
        prop_assert_eq!(tree.get(last, guard), Some(&entry.value));
        for tag in 0..MAX_TAGS {
            prop_assert_eq!(tree.tag_get(first, tag), entry.tags[tag]);
            prop_assert_eq!(tree.tag_get(last, tag), entry.tags[tag]);
        }
        prop_assert_eq!(tree.locate_item(&entry.value), Some(first));
    }
    prop_assert_eq!(tree.get(query, guard).copied(), model.covering(query).map(|first| model.entries[&first].value));

    let got: Vec<(u64, u64)> = tree.iter(0, guard).map(|(index, value)| (index, *value)).collect();
    let expected: Vec<(u64, u64)> = model.entries.iter().map(|(&index, entry)| (index, entry.value)).collect();
    prop_assert_eq!(got, expected);

    // Starting mid-way reports the entry covering the start first.
    let from = model.covering(query).unwrap_or(query);
    let got: Vec<u64> = tree.gang_lookup(query, 8, guard).into_iter().copied().collect();
    let expected: Vec<u64> = model.entries.range(from..).take(8).map(|(_, entry)| entry.value).collect();
    prop_assert_eq!(got, expected);

    for tag in 0..MAX_TAGS {
        let expected = model.tagged_in(0, u64::MAX, tag);
        prop_assert_eq!(tree.tagged(tag), !expected.is_empty());
        let got: Vec<u64> = tree.iter_tagged(0, tag, guard).map(|(index, _)| index).collect();
        prop_assert_eq!(got, expected);
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        max_shrink_iters: 50_000,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_equivalence(ops in ops_strategy(), query in index_strategy()) {
        let tree: RadixTree<u64> = RadixTree::new();
        let mut model = Model::default();
        let mut next_value = 0u64;

        for op in ops {
            let mut w = tree.write();
            match op {
                Op::Insert(index) => {
                    next_value += 1;
                    let got = w.insert(index, next_value);
                    if model.overlaps(index, index) {
                        prop_assert_eq!(got, Err(Error::Exists { index }));
                    } else {
                        prop_assert_eq!(got, Ok(()));
                        model.entries.insert(index, Entry { order: 0, value: next_value, tags: [false; MAX_TAGS] });
                    }
                }
                Op::InsertOrder(index, order) => {
                    next_value += 1;
                    let mask = (1u64 << order) - 1;
                    let (first, last) = (index & !mask, index | mask);
                    let got = w.insert_order(index, order, next_value);
                    if model.overlaps(first, last) {
                        prop_assert_eq!(got, Err(Error::Exists { index }));
                    } else {
                        prop_assert_eq!(got, Ok(()));
                        model.entries.insert(first, Entry { order, value: next_value, tags: [false; MAX_TAGS] });
                    }
                }
                Op::Delete(index) => {
                    prop_assert_eq!(w.delete(index), model.remove(index));
                }
                Op::DeleteItem(index, matching) => {
                    let current = model.covering(index).map(|first| model.entries[&first].value);
                    let expected = match (current, matching) {
                        (Some(value), true) => value,
                        _ => u64::MAX,
                    };
                    let got = w.delete_item(index, &expected);
                    if current == Some(expected) {
                        prop_assert_eq!(got, model.remove(index));
                    } else {
                        prop_assert_eq!(got, None);
                    }
                }
                Op::Replace(index) => {
                    next_value += 1;
                    match w.lookup_slot(index) {
                        Some(mut slot) => {
                            prop_assert_eq!(slot.index(), index);
                            let entry = model.entry_mut(index);
                            prop_assert!(entry.is_some());
                            let entry = entry.unwrap();
                            prop_assert_eq!(*slot.get(), entry.value);
                            slot.replace(next_value);
                            entry.value = next_value;
                        }
                        None => prop_assert!(model.covering(index).is_none()),
                    }
                }
                Op::TagSet(index, tag) => {
                    let present = match model.entry_mut(index) {
                        Some(entry) => {
                            entry.tags[tag] = true;
                            true
                        }
                        None => false,
                    };
                    prop_assert_eq!(w.tag_set(index, tag), present);
                }
                Op::TagClear(index, tag) => {
                    let present = match model.entry_mut(index) {
                        Some(entry) => {
                            entry.tags[tag] = false;
                            true
                        }
                        None => false,
                    };
                    prop_assert_eq!(w.tag_clear(index, tag), present);
                }
                Op::RangeTag { first, last, budget, if_tag, set_tag } => {
                    let (first, last) = (first.min(last), first.max(last));
                    let expected = model.tagged_in(first, last, if_tag);

                    let mut start = first;
                    let mut tagged = 0;
                    loop {
                        let pass = w.range_tag_if_tagged(start, last, budget, if_tag, set_tag);
                        prop_assert!(pass.tagged <= budget);
                        tagged += pass.tagged;
                        match pass.next_index {
                            Some(next) if next <= last => {
                                prop_assert!(next > start || pass.tagged > 0);
                                start = next;
                            }
                            _ => break,
                        }
                    }

                    prop_assert_eq!(tagged, expected.len());
                    for index in expected {
                        model.entries.get_mut(&index).unwrap().tags[set_tag] = true;
                    }
                }
            }
            drop(w);
            tree.validate();
        }

        check_against_model(&tree, &model, query)?;
    }
}

/// Calls `visit` with every ordering of `items`, generated in place by
/// Heap's algorithm.
fn permutations<T: Copy>(items: &[T], mut visit: impl FnMut(&[T])) {
    let mut order = items.to_vec();
    let mut swaps = vec![0usize; order.len()];
    visit(&order);

    let mut level = 1;
    while level < order.len() {
        if swaps[level] < level {
            let other = if level % 2 == 0 { 0 } else { swaps[level] };
            order.swap(other, level);
            visit(&order);
            swaps[level] += 1;
            level = 1;
        } else {
            swaps[level] = 0;
            level += 1;
        }
    }
}

/// Indices that sit at node boundaries of different levels.
const EDGE_KEYS: [u64; 6] = [0, 1, 63, 64, 4096, 1 << 40];

#[test]
fn exhaustive_insert_order_small_set() {
    permutations(&EDGE_KEYS, |perm| {
        let tree: RadixTree<u64> = RadixTree::new();
        let mut w = tree.write();
        for &index in perm {
            w.insert(index, index).unwrap();
            w.tag_set(index, (index % MAX_TAGS as u64) as usize);
        }
        drop(w);

        tree.validate();
        assert_eq!(tree.height(), 7);
        let guard = &epoch::pin();
        let got: Vec<u64> = tree.iter(0, guard).map(|(index, _)| index).collect();
        assert_eq!(got, EDGE_KEYS.to_vec());
    });
}

#[test]
fn exhaustive_delete_order_small_set() {
    permutations(&EDGE_KEYS, |perm| {
        let tree: RadixTree<u64> = RadixTree::new();
        let mut w = tree.write();
        for &index in &EDGE_KEYS {
            w.insert(index, index).unwrap();
            w.tag_set(index, 0);
        }

        for &index in perm {
            assert_eq!(w.remove(index), Some(&index));
            assert!(!w.contains(index));
            tree.validate();
        }
        assert!(w.is_empty());
        assert_eq!(w.height(), 0);
        assert_eq!(w.nodes_in_use(), 0);
        assert!(!w.tagged(0));
    });
}
