// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::loser::LoserTree;
use super::{LabeledProfile, ProfileIterator, Timestamped};
use crate::error::{Error, MultiError, Result};
use crate::model::Labels;
use std::cmp::Ordering;

type LessFn<T> = fn(&T, &T) -> bool;

fn less_profile<P: LabeledProfile>(a: &P, b: &P) -> bool {
    match a.timestamp().cmp(&b.timestamp()) {
        Ordering::Equal => a.labels() < b.labels(),
        ord => ord == Ordering::Less,
    }
}

/// K-way merges streams that are each sorted by (timestamp, labels).
///
/// With `dedupe`, an element equal in timestamp and labels to the one
/// emitted just before is skipped; its source still advances past it.
/// Sources are closed as soon as they run dry.
pub struct MergeIterator<I>
where
    I: ProfileIterator,
    I::Item: LabeledProfile,
{
    tree: LoserTree<I, LessFn<I::Item>>,
    dedupe: bool,
    last: Option<(i64, Labels)>,
    closed: Vec<bool>,
    errs: MultiError,
    err: Option<Error>,
}

impl<I> MergeIterator<I>
where
    I: ProfileIterator,
    I::Item: LabeledProfile,
{
    pub fn new(inputs: Vec<I>, dedupe: bool) -> Self {
        let closed = vec![false; inputs.len()];
        Self {
            tree: LoserTree::new(inputs, less_profile::<I::Item> as LessFn<I::Item>),
            dedupe,
            last: None,
            closed,
            errs: MultiError::new(),
            err: None,
        }
    }

    fn close_exhausted(&mut self) {
        for i in self.tree.take_exhausted() {
            if let Some(closed) = self.closed.get_mut(i) {
                if !*closed {
                    *closed = true;
                    let res = self.tree.sources_mut()[i].close();
                    self.errs.add(res);
                }
            }
        }
    }

    fn is_duplicate(&self, item: &I::Item) -> bool {
        match &self.last {
            Some((ts, labels)) => *ts == item.timestamp() && labels == item.labels(),
            None => false,
        }
    }
}

impl<I> Iterator for MergeIterator<I>
where
    I: ProfileIterator,
    I::Item: LabeledProfile,
{
    type Item = I::Item;

    fn next(&mut self) -> Option<I::Item> {
        loop {
            let popped = self.tree.pop();
            self.close_exhausted();
            let Some((item, _)) = popped else {
                if self.err.is_none() {
                    self.err = std::mem::take(&mut self.errs).into_result().err();
                }
                return None;
            };
            if self.dedupe {
                if self.is_duplicate(&item) {
                    continue;
                }
                self.last = Some((item.timestamp(), item.labels().clone()));
            }
            return Some(item);
        }
    }
}

impl<I> ProfileIterator for MergeIterator<I>
where
    I: ProfileIterator,
    I::Item: LabeledProfile,
{
    fn err(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    /// Closes every source still open and aggregates all their errors.
    fn close(&mut self) -> Result<()> {
        let mut errs = std::mem::take(&mut self.errs);
        if let Some(err) = self.err.take() {
            errs.push(err);
        }
        for (i, closed) in self.closed.iter_mut().enumerate() {
            if !*closed {
                *closed = true;
                errs.add(self.tree.sources_mut()[i].close());
            }
        }
        errs.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iter::tests::{Entry, FailingIterator};
    use crate::iter::{collect, SliceIterator};
    use proptest::prelude::*;

    fn slices(inputs: Vec<Vec<Entry>>) -> Vec<SliceIterator<Entry>> {
        inputs.into_iter().map(SliceIterator::new).collect()
    }

    #[test]
    fn merges_by_time_then_labels() {
        let merged = MergeIterator::new(
            slices(vec![
                vec![Entry::new(1, "b"), Entry::new(3, "a")],
                vec![Entry::new(1, "a"), Entry::new(2, "c")],
            ]),
            false,
        );
        let got: Vec<_> = collect(merged)
            .unwrap()
            .into_iter()
            .map(|e| (e.ts, e.labels.get("series").unwrap_or_default().to_string()))
            .collect();
        assert_eq!(
            got,
            [
                (1, "a".to_string()),
                (1, "b".to_string()),
                (2, "c".to_string()),
                (3, "a".to_string())
            ]
        );
    }

    #[test]
    fn dedupe_collapses_replicas() {
        let replica = vec![Entry::new(1, "a"), Entry::new(2, "a"), Entry::new(2, "b")];
        let merged = MergeIterator::new(
            slices(vec![replica.clone(), replica.clone(), replica.clone()]),
            true,
        );
        assert_eq!(collect(merged).unwrap(), replica);

        let merged = MergeIterator::new(slices(vec![replica.clone(), replica]), false);
        assert_eq!(collect(merged).unwrap().len(), 6);
    }

    #[test]
    fn close_aggregates_errors() {
        let inputs = vec![
            FailingIterator {
                items: vec![Entry::new(1, "a")].into_iter(),
                close_err: Some(Error::InvalidCrc),
            },
            FailingIterator {
                items: vec![Entry::new(2, "a")].into_iter(),
                close_err: None,
            },
            FailingIterator {
                items: vec![Entry::new(3, "a"), Entry::new(4, "a")].into_iter(),
                close_err: Some(Error::Cancelled),
            },
        ];
        let mut merged = MergeIterator::new(inputs, false);
        assert_eq!(merged.next().map(|e| e.ts), Some(1));
        assert_eq!(merged.next().map(|e| e.ts), Some(2));
        match merged.close().unwrap_err() {
            Error::Multi(errs) => {
                assert_eq!(errs.len(), 2);
                assert!(matches!(errs.errors()[0], Error::InvalidCrc));
                assert!(matches!(errs.errors()[1], Error::Cancelled));
            }
            err => panic!("unexpected error: {err:?}"),
        }
        // Nothing left to close.
        assert!(merged.close().is_ok());
    }

    #[test]
    fn exhaustion_surfaces_close_errors() {
        let inputs = vec![FailingIterator {
            items: vec![Entry::new(1, "a")].into_iter(),
            close_err: Some(Error::InvalidMagic),
        }];
        let mut merged = MergeIterator::new(inputs, true);
        assert!(merged.next().is_some());
        assert!(merged.next().is_none());
        assert!(matches!(merged.err(), Some(Error::InvalidMagic)));
    }

    fn sorted_stream() -> impl Strategy<Value = Vec<Entry>> {
        proptest::collection::vec((0i64..20, "[ab]"), 0..16).prop_map(|mut v| {
            v.sort();
            v.into_iter().map(|(ts, s)| Entry::new(ts, &s)).collect()
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: if cfg!(miri) { 4 } else { 64 },
            ..ProptestConfig::default()
        })]

        #[test]
        fn order_is_preserved(inputs in proptest::collection::vec(sorted_stream(), 0..6)) {
            let total: usize = inputs.iter().map(Vec::len).sum();
            let merged = collect(MergeIterator::new(slices(inputs.clone()), false)).unwrap();
            prop_assert_eq!(merged.len(), total);
            for pair in merged.windows(2) {
                prop_assert!(!less_profile(&pair[1], &pair[0]));
            }

            let deduped = collect(MergeIterator::new(slices(inputs), true)).unwrap();
            for pair in deduped.windows(2) {
                prop_assert!(less_profile(&pair[0], &pair[1]));
            }
            let mut unique = merged.clone();
            unique.dedup();
            prop_assert_eq!(deduped, unique);
        }
    }
}
