// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ordered profile streams.
//!
//! Every stream is a plain [`Iterator`] plus [`ProfileIterator`], which adds
//! the terminal error. `None` from `next` with no error means the stream is
//! exhausted; `None` with [`ProfileIterator::err`] set means it failed, e.g.
//! with [`Error::Cancelled`].

mod loser;
mod merge;
mod time;

pub use merge::MergeIterator;
pub use time::{TimeInterval, TimeIntervalIterator, TimeRangedIterator};

use crate::error::{Error, MultiError, Result};
use crate::model::Labels;
use tokio_util::sync::CancellationToken;

pub trait Timestamped {
    /// Milliseconds since the epoch.
    fn timestamp(&self) -> i64;
}

/// An element of a mergeable stream. Streams are sorted by timestamp, then
/// by label set.
pub trait LabeledProfile: Timestamped {
    fn labels(&self) -> &Labels;
}

pub trait ProfileIterator: Iterator {
    /// The error that ended the iteration, if any.
    fn err(&self) -> Option<&Error> {
        None
    }

    /// Releases the stream. Returns the terminal error, if it was not taken
    /// yet, together with any error raised while closing.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<I: ProfileIterator + ?Sized> ProfileIterator for Box<I> {
    fn err(&self) -> Option<&Error> {
        (**self).err()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// Drains `it`, returning its elements or its terminal error.
pub fn collect<I: ProfileIterator>(mut it: I) -> Result<Vec<I::Item>> {
    let items: Vec<_> = it.by_ref().collect();
    it.close()?;
    Ok(items)
}

/// Iterates over an owned, already sorted, vector.
pub struct SliceIterator<T> {
    inner: std::vec::IntoIter<T>,
}

impl<T> SliceIterator<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            inner: items.into_iter(),
        }
    }
}

impl<T> Iterator for SliceIterator<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<T> ProfileIterator for SliceIterator<T> {}

/// Checks the token before every advance of `inner`. Once cancelled, the
/// stream ends with [`Error::Cancelled`].
pub struct Cancellable<I> {
    inner: I,
    token: CancellationToken,
    err: Option<Error>,
}

impl<I: ProfileIterator> Cancellable<I> {
    pub fn new(inner: I, token: CancellationToken) -> Self {
        Self {
            inner,
            token,
            err: None,
        }
    }
}

impl<I: ProfileIterator> Iterator for Cancellable<I> {
    type Item = I::Item;

    fn next(&mut self) -> Option<I::Item> {
        if self.err.is_some() {
            return None;
        }
        if self.token.is_cancelled() {
            self.err = Some(Error::Cancelled);
            return None;
        }
        self.inner.next()
    }
}

impl<I: ProfileIterator> ProfileIterator for Cancellable<I> {
    fn err(&self) -> Option<&Error> {
        self.err.as_ref().or_else(|| self.inner.err())
    }

    fn close(&mut self) -> Result<()> {
        let mut errs = MultiError::new();
        if let Some(err) = self.err.take() {
            errs.push(err);
        }
        errs.add(self.inner.close());
        errs.into_result()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A test element: a timestamp and a label set.
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct Entry {
        pub ts: i64,
        pub labels: Labels,
    }

    impl Entry {
        pub fn new(ts: i64, series: &str) -> Self {
            Self {
                ts,
                labels: Labels::new(vec![crate::model::LabelPair::new("series", series)]),
            }
        }
    }

    impl Timestamped for Entry {
        fn timestamp(&self) -> i64 {
            self.ts
        }
    }

    impl LabeledProfile for Entry {
        fn labels(&self) -> &Labels {
            &self.labels
        }
    }

    /// Yields its elements, then fails with `err` on close.
    pub struct FailingIterator {
        pub items: std::vec::IntoIter<Entry>,
        pub close_err: Option<Error>,
    }

    impl Iterator for FailingIterator {
        type Item = Entry;

        fn next(&mut self) -> Option<Entry> {
            self.items.next()
        }
    }

    impl ProfileIterator for FailingIterator {
        fn close(&mut self) -> Result<()> {
            match self.close_err.take() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }

    #[test]
    fn cancellation_is_terminal() {
        let token = CancellationToken::new();
        let mut it = Cancellable::new(
            SliceIterator::new(vec![Entry::new(1, "a"), Entry::new(2, "a")]),
            token.clone(),
        );
        assert_eq!(it.next().map(|e| e.ts), Some(1));
        token.cancel();
        assert!(it.next().is_none());
        assert!(matches!(it.err(), Some(Error::Cancelled)));
        // Stays terminal.
        assert!(it.next().is_none());
        assert!(matches!(it.close(), Err(Error::Cancelled)));
    }

    #[test]
    fn exhausted_is_not_an_error() {
        let it = Cancellable::new(
            SliceIterator::new(vec![Entry::new(1, "a")]),
            CancellationToken::new(),
        );
        let items = collect(it).unwrap();
        assert_eq!(items.len(), 1);
    }
}
