// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{ProfileIterator, Timestamped};
use crate::error::{Error, Result};

/// Filters a time-sorted stream to `[min, max]`, inclusive.
///
/// The first element past `max` ends the stream for good.
pub struct TimeRangedIterator<I> {
    inner: I,
    min: i64,
    max: i64,
    done: bool,
}

impl<I> TimeRangedIterator<I> {
    pub fn new(inner: I, min: i64, max: i64) -> Self {
        Self {
            inner,
            min,
            max,
            done: false,
        }
    }
}

impl<I> Iterator for TimeRangedIterator<I>
where
    I: Iterator,
    I::Item: Timestamped,
{
    type Item = I::Item;

    fn next(&mut self) -> Option<I::Item> {
        if self.done {
            return None;
        }
        for item in self.inner.by_ref() {
            let ts = item.timestamp();
            if ts < self.min {
                continue;
            }
            if ts > self.max {
                self.done = true;
                return None;
            }
            return Some(item);
        }
        self.done = true;
        None
    }
}

impl<I> ProfileIterator for TimeRangedIterator<I>
where
    I: ProfileIterator,
    I::Item: Timestamped,
{
    fn err(&self) -> Option<&Error> {
        self.inner.err()
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TimeInterval {
    pub start: i64,
    pub end: i64,
}

impl TimeInterval {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }
}

/// Splits `[start, end]` into sub-ranges aligned to `interval`, e.g. with an
/// interval of 900: `[1, 899], [900, 1799], ..., [3600, 3602]`.
///
/// An interval of zero (or less) yields the whole range at once. An empty
/// range yields nothing.
#[derive(Clone, Debug)]
pub struct TimeIntervalIterator {
    start: i64,
    end: i64,
    interval: i64,
}

impl TimeIntervalIterator {
    pub fn new(start: i64, end: i64, interval: i64) -> Self {
        Self {
            start,
            end,
            interval,
        }
    }
}

impl Iterator for TimeIntervalIterator {
    type Item = TimeInterval;

    fn next(&mut self) -> Option<TimeInterval> {
        if self.start >= self.end {
            return None;
        }
        let start = self.start;
        if self.interval <= 0 {
            self.start = self.end;
            return Some(TimeInterval::new(start, self.end));
        }
        let boundary = start
            .saturating_add(self.interval - start.rem_euclid(self.interval));
        self.start = boundary;
        if self.end > boundary {
            Some(TimeInterval::new(start, boundary - 1))
        } else {
            Some(TimeInterval::new(start, self.end))
        }
    }
}
