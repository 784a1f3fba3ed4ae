//! Greedy longest-processing-time bin packing.

use std::cmp::Reverse;

/// One bin of the packing: the items it received and their summed weight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bin<T> {
    pub items: Vec<T>,
    pub weight: u64,
}

impl<T> Default for Bin<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            weight: 0,
        }
    }
}

/// Packs weighted items into exactly `k` bins.
///
/// Items are taken heaviest first (equal weights keep their input order) and
/// each goes to the currently lightest bin, the lowest index winning ties.
/// The heaviest bin never exceeds `sum / k + max weight`. Bins may stay empty
/// when there are fewer items than bins. `k == 0` yields no bins.
pub fn balance<T>(items: Vec<(T, u64)>, k: usize) -> Vec<Bin<T>> {
    let mut bins: Vec<Bin<T>> = (0..k).map(|_| Bin::default()).collect();
    if bins.is_empty() {
        return bins;
    }
    let mut items = items;
    items.sort_by_key(|&(_, weight)| Reverse(weight));
    for (item, weight) in items {
        let lightest = bins
            .iter()
            .enumerate()
            .min_by_key(|(index, bin)| (bin.weight, *index))
            .map(|(index, _)| index)
            .unwrap_or(0);
        let bin = &mut bins[lightest];
        bin.weight = bin.weight.saturating_add(weight);
        bin.items.push(item);
    }
    bins
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heaviest_first_to_lightest_bin() {
        let bins = balance(vec![("a", 5), ("b", 7), ("c", 3), ("d", 3), ("e", 2)], 2);
        assert_eq!(bins.len(), 2);
        assert_eq!(bins[0].items, ["b", "d"]);
        assert_eq!(bins[1].items, ["a", "c", "e"]);
        assert_eq!((bins[0].weight, bins[1].weight), (10, 10));
    }

    #[test]
    fn ties_go_to_lowest_index() {
        let bins = balance(vec![("x", 1), ("y", 1), ("z", 1)], 3);
        let firsts: Vec<&str> = bins.iter().map(|b| b.items[0]).collect();
        assert_eq!(firsts, ["x", "y", "z"]);
    }

    #[test]
    fn produces_exactly_k_bins_even_when_short_of_items() {
        let bins = balance(vec![("only", 4)], 3);
        assert_eq!(bins.len(), 3);
        assert_eq!(bins[0].items, ["only"]);
        assert!(bins[1].items.is_empty() && bins[2].items.is_empty());
        assert!(balance::<u8>(vec![(1, 1)], 0).is_empty());
    }

    #[test]
    fn heaviest_bin_respects_lpt_bound() {
        let mut seed: u64 = 42;
        for k in 1..8usize {
            let items: Vec<(usize, u64)> = (0..40)
                .map(|i| {
                    seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
                    (i, 1 + (seed >> 40) % 500)
                })
                .collect();
            let sum: u64 = items.iter().map(|(_, w)| w).sum();
            let max = items.iter().map(|(_, w)| *w).max().unwrap();
            let bins = balance(items, k);
            let heaviest = bins.iter().map(|b| b.weight).max().unwrap();
            assert!(
                heaviest <= sum / k as u64 + max,
                "k={k}: heaviest bin {heaviest} exceeds {sum}/{k} + {max}"
            );
            assert_eq!(bins.iter().map(|b| b.items.len()).sum::<usize>(), 40);
        }
    }
}
