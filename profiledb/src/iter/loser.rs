// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A tournament tree of losers for k-way merging.
//!
//! Leaves live at positions `k..2k` and the internal nodes `1..k` hold the
//! loser of the match played there; `nodes[0]` holds the overall winner.
//! An exhausted source compares greater than every element, and ties go to
//! the lower source index so that the merge is stable.

pub(crate) struct LoserTree<I: Iterator, F> {
    sources: Vec<I>,
    heads: Vec<Option<I::Item>>,
    nodes: Vec<usize>,
    less: F,
    initialized: bool,
    exhausted: Vec<usize>,
}

impl<I, F> LoserTree<I, F>
where
    I: Iterator,
    F: Fn(&I::Item, &I::Item) -> bool,
{
    pub fn new(sources: Vec<I>, less: F) -> Self {
        let k = sources.len();
        Self {
            heads: Vec::with_capacity(k),
            nodes: vec![0; k.max(1)],
            sources,
            less,
            initialized: false,
            exhausted: Vec::new(),
        }
    }

    pub fn sources_mut(&mut self) -> &mut [I] {
        &mut self.sources
    }

    /// Sources that ran dry since the last call.
    pub fn take_exhausted(&mut self) -> Vec<usize> {
        std::mem::take(&mut self.exhausted)
    }

    /// Removes the smallest element and refills from its source. Returns the
    /// element with the index of the source it came from.
    pub fn pop(&mut self) -> Option<(I::Item, usize)> {
        if !self.initialized {
            self.init();
        }
        let winner = *self.nodes.first()?;
        let item = self.heads.get_mut(winner)?.take()?;
        let next = self.sources[winner].next();
        if next.is_none() {
            self.exhausted.push(winner);
        }
        self.heads[winner] = next;
        self.replay(winner);
        Some((item, winner))
    }

    fn init(&mut self) {
        self.initialized = true;
        for (i, source) in self.sources.iter_mut().enumerate() {
            let head = source.next();
            if head.is_none() {
                self.exhausted.push(i);
            }
            self.heads.push(head);
        }
        let k = self.sources.len();
        if k == 0 {
            return;
        }
        // winners[n] is the winner of the subtree rooted at n.
        let mut winners = vec![0; 2 * k];
        for (i, w) in winners.iter_mut().skip(k).enumerate() {
            *w = i;
        }
        for n in (1..k).rev() {
            let (a, b) = (winners[2 * n], winners[2 * n + 1]);
            if self.beats(a, b) {
                winners[n] = a;
                self.nodes[n] = b;
            } else {
                winners[n] = b;
                self.nodes[n] = a;
            }
        }
        self.nodes[0] = if k == 1 { 0 } else { winners[1] };
    }

    /// Replays the matches on the path from leaf `source` to the root.
    fn replay(&mut self, source: usize) {
        let k = self.sources.len();
        let mut winner = source;
        let mut n = (k + source) / 2;
        while n >= 1 {
            let loser = self.nodes[n];
            if self.beats(loser, winner) {
                self.nodes[n] = winner;
                winner = loser;
            }
            n /= 2;
        }
        self.nodes[0] = winner;
    }

    /// Whether source `a`'s head sorts before source `b`'s.
    fn beats(&self, a: usize, b: usize) -> bool {
        match (&self.heads[a], &self.heads[b]) {
            (Some(x), Some(y)) => {
                if (self.less)(x, y) {
                    true
                } else if (self.less)(y, x) {
                    false
                } else {
                    a < b
                }
            }
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => a < b,
        }
    }
}
