//! # mp-verify: The "Law" of mergeproxy
//!
//! Properties of the [`KWayMerger`] that the federation relies on, stated
//! once as checkers and then discharged two ways:
//!
//! - under Kani (`cargo kani --package mp-verify`) for every symbolic input
//!   of bounded size;
//! - in ordinary builds by exhaustive enumeration of small inputs.
//!
//! # Property: Stable Merge
//!
//! For sorted sources, the merged output contains every input element
//! exactly once, keys never decrease, and among equal keys the element from
//! the lower source index (then the earlier position) comes first.
//!
//! # Property: Fetch-Limit Bound
//!
//! The first `limit` merged elements are the same whether each source is
//! merged in full or cut to its first `limit` elements. This is what lets
//! the proxy ask each backend for `limit` records only.

use mp_core::KWayMerger;

/// One merged element: its key and where it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tagged<K> {
    pub key: K,
    pub source: usize,
    pub position: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// A source was not sorted; the properties do not apply.
    UnsortedSource { source: usize },
    /// Output length differs from the total input length.
    LostElements { expected: usize, merged: usize },
    /// An element appeared twice or not at all.
    Duplicate { source: usize, position: usize },
    /// Keys decreased at `index`.
    Decreasing { index: usize },
    /// Equal keys emitted out of (source, position) order at `index`.
    UnstableTie { index: usize },
    /// Truncated and full merges disagree on the first `limit` elements.
    LimitBound { limit: usize },
}

/// Merge `sources` by key, tagging each element with its origin.
pub fn merge_tagged<K: Ord + Copy + Send>(sources: &[Vec<K>]) -> Vec<Tagged<K>> {
    let tagged = sources.iter().enumerate().map(|(source, keys)| {
        keys.iter()
            .enumerate()
            .map(move |(position, &key)| Tagged {
                key,
                source,
                position,
            })
            .collect::<Vec<_>>()
            .into_iter()
    });
    match KWayMerger::from_iters(tagged, |a: &Tagged<K>, b: &Tagged<K>| a.key.cmp(&b.key)) {
        Ok(merger) => merger.collect(),
        // No sources, nothing to merge.
        Err(_) => Vec::new(),
    }
}

pub fn is_non_decreasing<K: Ord>(keys: &[K]) -> bool {
    keys.windows(2).all(|pair| pair[0] <= pair[1])
}

/// Check the stable-merge property for one input.
pub fn check_merge<K: Ord + Copy + Send>(sources: &[Vec<K>]) -> Result<(), Violation> {
    if let Some(source) = sources.iter().position(|keys| !is_non_decreasing(keys)) {
        return Err(Violation::UnsortedSource { source });
    }

    let merged = merge_tagged(sources);
    let expected: usize = sources.iter().map(Vec::len).sum();
    if merged.len() != expected {
        return Err(Violation::LostElements {
            expected,
            merged: merged.len(),
        });
    }

    let mut seen: Vec<Vec<bool>> = sources.iter().map(|keys| vec![false; keys.len()]).collect();
    for element in &merged {
        let slot = &mut seen[element.source][element.position];
        if *slot || sources[element.source][element.position] != element.key {
            return Err(Violation::Duplicate {
                source: element.source,
                position: element.position,
            });
        }
        *slot = true;
    }

    for (index, pair) in merged.windows(2).enumerate() {
        let (a, b) = (&pair[0], &pair[1]);
        if b.key < a.key {
            return Err(Violation::Decreasing { index: index + 1 });
        }
        if a.key == b.key && (b.source, b.position) < (a.source, a.position) {
            return Err(Violation::UnstableTie { index: index + 1 });
        }
    }
    Ok(())
}

/// Check the fetch-limit bound for one input and one `limit`.
pub fn check_limit_bound<K: Ord + Copy + Send>(
    sources: &[Vec<K>],
    limit: usize,
) -> Result<(), Violation> {
    if let Some(source) = sources.iter().position(|keys| !is_non_decreasing(keys)) {
        return Err(Violation::UnsortedSource { source });
    }

    let truncated: Vec<Vec<K>> = sources
        .iter()
        .map(|keys| keys.iter().copied().take(limit).collect())
        .collect();

    let full = merge_tagged(sources);
    let cut = merge_tagged(&truncated);
    let full_head = &full[..limit.min(full.len())];
    let cut_head = &cut[..limit.min(cut.len())];
    if full_head != cut_head {
        return Err(Violation::LimitBound { limit });
    }
    Ok(())
}

// =============================================================================
// Kani Proofs
// =============================================================================

#[cfg(kani)]
mod proofs {
    use super::*;

    /// A symbolic sorted source of length `len` over a small key domain.
    fn any_sorted_source(len: usize) -> Vec<u8> {
        let mut keys = Vec::with_capacity(len);
        let mut previous = 0u8;
        for _ in 0..len {
            let key: u8 = kani::any();
            kani::assume(key >= previous && key < 4);
            keys.push(key);
            previous = key;
        }
        keys
    }

    /// **Proof: Stable Merge of two sources**
    #[kani::proof]
    #[kani::unwind(8)]
    fn verify_stable_merge_two_sources() {
        let sources = vec![any_sorted_source(2), any_sorted_source(2)];
        assert!(check_merge(&sources).is_ok(), "stable merge violated");
    }

    /// **Proof: Stable Merge of three sources with one empty**
    #[kani::proof]
    #[kani::unwind(8)]
    fn verify_stable_merge_with_empty_source() {
        let sources = vec![any_sorted_source(2), Vec::new(), any_sorted_source(1)];
        assert!(check_merge(&sources).is_ok(), "stable merge violated");
    }

    /// **Proof: Fetch-Limit Bound**
    ///
    /// Two sources of three elements, cut to a limit of two.
    #[kani::proof]
    #[kani::unwind(10)]
    fn verify_limit_bound() {
        let sources = vec![any_sorted_source(3), any_sorted_source(3)];
        assert!(check_limit_bound(&sources, 2).is_ok(), "fetch-limit bound violated");
    }
}
