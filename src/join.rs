//! Hash equi-join over two sequences.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

#[derive(Debug, PartialEq, Eq)]
pub struct Joined<L, R> {
    pub pairs: Vec<(L, R)>,
    pub left_only: Vec<L>,
    pub right_only: Vec<R>,
}

/// Pair up elements of `lefts` and `rights` whose keys are equal.
///
/// Every element ends up in exactly one output.  Duplicate keys pair up one
/// to one in sequence order, and each output keeps the order of its input.
pub fn hash_join<L, R, K, FL, FR>(
    lefts: impl IntoIterator<Item = L>,
    rights: impl IntoIterator<Item = R>,
    left_key: FL,
    right_key: FR,
) -> Joined<L, R>
where
    K: Eq + Hash,
    FL: Fn(&L) -> K,
    FR: Fn(&R) -> K,
{
    let mut rights: Vec<Option<R>> = rights.into_iter().map(Some).collect();
    let mut index: HashMap<K, VecDeque<usize>> = HashMap::new();
    for (i, right) in rights.iter().enumerate() {
        if let Some(right) = right {
            index.entry(right_key(right)).or_default().push_back(i);
        }
    }

    let mut pairs = Vec::new();
    let mut left_only = Vec::new();
    for left in lefts {
        let matched = index
            .get_mut(&left_key(&left))
            .and_then(VecDeque::pop_front)
            .and_then(|i| rights[i].take());
        match matched {
            Some(right) => pairs.push((left, right)),
            None => left_only.push(left),
        }
    }

    Joined {
        pairs,
        left_only,
        right_only: rights.into_iter().flatten().collect(),
    }
}
