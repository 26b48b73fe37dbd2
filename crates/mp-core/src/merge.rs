//! # K-Way Merger
//!
//! Merges N independently ascending sources into one ascending sequence,
//! pulling from each source only when its buffered head has been emitted.
//!
//! Each source is a *producer*: a zero-argument closure that yields the
//! next element of its sequence, or `None` once the sequence has ended.
//!
//! # Selection rule
//!
//! On every [`Iterator::next`] call:
//!
//! 1. Every empty slot calls its producer exactly once. A slot that still
//!    holds an element is never re-queried.
//! 2. The slot holding the minimum element wins. Exhausted slots never win.
//! 3. Ties go to the lowest slot index, so equal keys keep the caller's
//!    source order and the output is reproducible for a fixed input.
//! 4. The winning slot is emptied and its element returned.
//!
//! The scan is linear, O(N) per element. N is the number of backends, not
//! the data volume.
//!
//! The merger does not sort within a source: if a producer's sequence is
//! not non-decreasing under the comparator, neither is the output.

use std::cmp::Ordering;
use std::iter::FusedIterator;

use crate::error::{Error, Result};

/// A source of elements; `None` means exhausted.
pub type Producer<'a, T> = Box<dyn FnMut() -> Option<T> + Send + 'a>;

/// Natural-order comparator used by [`KWayMerger::new`].
pub type NaturalOrder<T> = fn(&T, &T) -> Ordering;

enum Slot<T> {
    /// The producer must be asked for its next element.
    Empty,
    /// Buffered head, not yet emitted.
    Pending(T),
    /// The producer reported the end of its sequence. It is not called again.
    Exhausted,
}

pub struct KWayMerger<'a, T, C = NaturalOrder<T>> {
    producers: Vec<Producer<'a, T>>,
    slots: Vec<Slot<T>>,
    compare: C,
}

impl<'a, T: Ord> KWayMerger<'a, T, NaturalOrder<T>> {
    /// Merge by `T`'s natural ordering.
    ///
    /// Returns [`Error::Configuration`] if `producers` is empty.
    pub fn new(producers: Vec<Producer<'a, T>>) -> Result<Self> {
        Self::with_comparator(producers, T::cmp)
    }
}

impl<'a, T, C> KWayMerger<'a, T, C>
where
    C: FnMut(&T, &T) -> Ordering,
{
    /// Merge by a caller-supplied total order.
    ///
    /// Returns [`Error::Configuration`] if `producers` is empty.
    pub fn with_comparator(producers: Vec<Producer<'a, T>>, compare: C) -> Result<Self> {
        if producers.is_empty() {
            return Err(Error::Configuration(
                "k-way merger needs at least one producer".into(),
            ));
        }
        let slots = producers.iter().map(|_| Slot::Empty).collect();
        Ok(Self {
            producers,
            slots,
            compare,
        })
    }

    /// Wrap each iterator as a producer.
    pub fn from_iters<I>(sources: impl IntoIterator<Item = I>, compare: C) -> Result<Self>
    where
        I: Iterator<Item = T> + Send + 'a,
    {
        let producers = sources
            .into_iter()
            .map(|mut source| Box::new(move || source.next()) as Producer<'a, T>)
            .collect();
        Self::with_comparator(producers, compare)
    }

    /// Number of sources this merger was built over.
    pub fn sources(&self) -> usize {
        self.producers.len()
    }

    /// `true` once every source has reported exhaustion and every buffered
    /// element has been emitted.
    pub fn is_exhausted(&self) -> bool {
        self.slots.iter().all(|slot| matches!(slot, Slot::Exhausted))
    }

    fn fill_empty_slots(&mut self) {
        for (slot, producer) in self.slots.iter_mut().zip(self.producers.iter_mut()) {
            if matches!(slot, Slot::Empty) {
                *slot = match producer() {
                    Some(value) => Slot::Pending(value),
                    None => Slot::Exhausted,
                };
            }
        }
    }

    /// Index of the smallest pending element; lowest index wins ties.
    fn smallest_slot(&mut self) -> Option<usize> {
        let mut smallest: Option<usize> = None;
        for index in 0..self.slots.len() {
            let Slot::Pending(candidate) = &self.slots[index] else {
                continue;
            };
            let replace = match smallest {
                None => true,
                Some(best) => match &self.slots[best] {
                    // Strictly less: an equal element at a higher index loses.
                    Slot::Pending(current) => (self.compare)(candidate, current) == Ordering::Less,
                    _ => true,
                },
            };
            if replace {
                smallest = Some(index);
            }
        }
        smallest
    }
}

impl<'a, T, C> Iterator for KWayMerger<'a, T, C>
where
    C: FnMut(&T, &T) -> Ordering,
{
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.fill_empty_slots();
        let winner = self.smallest_slot()?;
        match std::mem::replace(&mut self.slots[winner], Slot::Empty) {
            Slot::Pending(value) => Some(value),
            // smallest_slot only returns Pending slots
            _ => None,
        }
    }
}

impl<'a, T, C> FusedIterator for KWayMerger<'a, T, C> where C: FnMut(&T, &T) -> Ordering {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Arc;

    /// Pops from the front of a list, like a remote page being drained.
    fn fetcher<T: Send + 'static>(values: Vec<T>) -> Producer<'static, T> {
        let mut queue: VecDeque<T> = values.into();
        Box::new(move || queue.pop_front())
    }

    #[test]
    fn test_empty_producer_list_is_a_configuration_error() {
        let err = KWayMerger::<u32>::new(Vec::new()).err().unwrap();
        assert_eq!(err.kind(), crate::ErrorKind::Configuration);
    }

    #[test]
    fn test_single_value_from_single_producer() {
        let mut merger = KWayMerger::new(vec![fetcher(vec![123456])]).unwrap();
        assert_eq!(merger.next(), Some(123456));
        assert_eq!(merger.next(), None);
    }

    #[test]
    fn test_first_next_returns_smallest_of_ten() {
        let producers = (0..10).rev().map(|i| fetcher(vec![i])).collect();
        let mut merger = KWayMerger::new(producers).unwrap();
        assert_eq!(merger.next(), Some(0));
    }

    #[test]
    fn test_two_elements_are_sorted() {
        let mut merger = KWayMerger::new(vec![fetcher(vec![2]), fetcher(vec![1])]).unwrap();
        assert_eq!(merger.next(), Some(1));
        assert_eq!(merger.next(), Some(2));
        assert_eq!(merger.next(), None);
    }

    #[test]
    fn test_single_ordered_source_is_returned_as_is() {
        let merger = KWayMerger::new(vec![fetcher((0..10).collect())]).unwrap();
        assert_eq!(merger.collect::<Vec<_>>(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_identical_sources_repeat_each_value() {
        const LIST_LENGTH: u32 = 5;
        const NUMBER_OF_LISTS: usize = 10;

        let producers = (0..NUMBER_OF_LISTS)
            .map(|_| fetcher((0..LIST_LENGTH).collect()))
            .collect();
        let merged: Vec<u32> = KWayMerger::new(producers).unwrap().collect();

        let expected: Vec<u32> = (0..LIST_LENGTH)
            .flat_map(|v| std::iter::repeat(v).take(NUMBER_OF_LISTS))
            .collect();
        assert_eq!(merged, expected);
    }

    #[test]
    fn test_zipper_merge_reconstructs_sequence() {
        const LIST_LENGTH: u32 = 50;
        const NUMBER_OF_LISTS: u32 = 200;

        let producers = (0..NUMBER_OF_LISTS)
            .map(|start| {
                let end = start + NUMBER_OF_LISTS * LIST_LENGTH;
                fetcher((start..end).step_by(NUMBER_OF_LISTS as usize).collect())
            })
            .collect();
        let merged: Vec<u32> = KWayMerger::new(producers).unwrap().collect();

        assert_eq!(merged, (0..LIST_LENGTH * NUMBER_OF_LISTS).collect::<Vec<_>>());
    }

    #[test]
    fn test_ties_go_to_lowest_source_index() {
        // (key, source) pairs; compare by key only.
        let sources = vec![
            vec![(1, 0), (3, 0)],
            vec![(1, 1), (2, 1), (3, 1)],
            vec![(1, 2), (3, 2)],
        ];
        let merged: Vec<(u32, u32)> = KWayMerger::from_iters(
            sources.into_iter().map(Vec::into_iter),
            |a: &(u32, u32), b: &(u32, u32)| a.0.cmp(&b.0),
        )
        .unwrap()
        .collect();

        assert_eq!(
            merged,
            vec![(1, 0), (1, 1), (1, 2), (2, 1), (3, 0), (3, 1), (3, 2)]
        );
    }

    #[test]
    fn test_per_source_order_is_kept_for_equal_keys() {
        let sources = vec![
            vec![(0, "a0"), (0, "a1"), (0, "a2")],
            vec![(0, "b0"), (0, "b1")],
        ];
        let merged: Vec<&str> = KWayMerger::from_iters(
            sources.into_iter().map(Vec::into_iter),
            |a: &(u32, &str), b: &(u32, &str)| a.0.cmp(&b.0),
        )
        .unwrap()
        .map(|(_, tag)| tag)
        .collect();

        // Source 0 keeps winning ties while it has elements.
        assert_eq!(merged, vec!["a0", "a1", "a2", "b0", "b1"]);
    }

    #[test]
    fn test_producers_are_called_once_per_needed_element() {
        let calls: Vec<Arc<AtomicUsize>> = (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();
        let producers = calls
            .iter()
            .enumerate()
            .map(|(i, counter)| {
                let counter = counter.clone();
                let mut queue: VecDeque<usize> = vec![i, i + 3].into();
                Box::new(move || {
                    counter.fetch_add(1, AtomicOrdering::SeqCst);
                    queue.pop_front()
                }) as Producer<'static, usize>
            })
            .collect();
        let mut merger = KWayMerger::new(producers).unwrap();

        assert_eq!(merger.next(), Some(0));
        // Every slot was filled once; only slot 0 was drained.
        let counts: Vec<usize> = calls.iter().map(|c| c.load(AtomicOrdering::SeqCst)).collect();
        assert_eq!(counts, vec![1, 1, 1]);

        assert_eq!(merger.next(), Some(1));
        let counts: Vec<usize> = calls.iter().map(|c| c.load(AtomicOrdering::SeqCst)).collect();
        assert_eq!(counts, vec![2, 1, 1]);
    }

    #[test]
    fn test_exhausted_producer_is_not_called_again() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let empty: Producer<'static, u32> = Box::new(move || {
            counter.fetch_add(1, AtomicOrdering::SeqCst);
            None
        });
        let merger = KWayMerger::new(vec![empty, fetcher(vec![1, 2, 3])]).unwrap();
        assert_eq!(merger.collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn test_all_exhausted_keeps_returning_none() {
        let mut merger = KWayMerger::new(vec![fetcher(Vec::<u8>::new()), fetcher(vec![])]).unwrap();
        assert_eq!(merger.next(), None);
        assert!(merger.is_exhausted());
        assert_eq!(merger.next(), None);
    }

    #[test]
    fn test_custom_comparator_descending() {
        let merger = KWayMerger::with_comparator(
            vec![fetcher(vec![9, 5, 1]), fetcher(vec![8, 4])],
            |a: &i32, b: &i32| b.cmp(a),
        )
        .unwrap();
        assert_eq!(merger.collect::<Vec<_>>(), vec![9, 8, 5, 4, 1]);
    }

    #[test]
    fn test_take_pulls_lazily() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let counter = pulled.clone();
        let mut next = 0u64;
        let infinite: Producer<'static, u64> = Box::new(move || {
            counter.fetch_add(1, AtomicOrdering::SeqCst);
            next += 1;
            Some(next)
        });
        let merger = KWayMerger::new(vec![infinite]).unwrap();
        assert_eq!(merger.take(3).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(pulled.load(AtomicOrdering::SeqCst), 3);
    }
}
