// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::tree::StacktraceTree;
use crate::collections::FxHashMap;
use crate::error::{Error, Result};
use parking_lot::{ArcMutexGuard, Mutex, RawMutex, RwLock};
use std::sync::Arc;

const DEFAULT_TREE_SIZE: usize = 1 << 10;

/// Accepts resolved stack traces. `locations` is leaf first and must not be
/// retained.
pub trait StacktraceInserter {
    fn insert_stacktrace(&mut self, id: u32, locations: &[u64]);
}

impl<F: FnMut(u32, &[u64])> StacktraceInserter for F {
    fn insert_stacktrace(&mut self, id: u32, locations: &[u64]) {
        self(id, locations)
    }
}

pub trait StacktraceResolver {
    /// Resolves every id in `ids`, which must be sorted ascending, and
    /// passes the locations to `dst` in the same order.
    fn resolve_stacktraces<S: StacktraceInserter + ?Sized>(&mut self, dst: &mut S, ids: &[u32]) -> Result<()>;
}

pub(crate) fn check_ascending(ids: &[u32]) -> Result<()> {
    if ids.windows(2).any(|w| w[0] > w[1]) {
        return Err(Error::invalid_input("stack trace ids must be sorted ascending"));
    }
    Ok(())
}

/// A bounded shard of a mapping's tree. Ids in the chunk are
/// `stid..stid + tree.len()`.
#[derive(Debug)]
pub(crate) struct Chunk {
    pub stid: u32,
    pub tree: StacktraceTree,
    pub stacktraces: u32,
    pub max_depth: u32,
}

impl Chunk {
    fn new(stid: u32) -> Self {
        Self {
            stid,
            tree: StacktraceTree::with_capacity(DEFAULT_TREE_SIZE),
            stacktraces: 0,
            max_depth: 0,
        }
    }
}

#[derive(Debug)]
struct MappingState {
    index: FxHashMap<Box<[u64]>, u32>,
    chunks: Vec<Chunk>,
}

/// The stack traces whose root frames belong to one mapping (binary).
#[derive(Debug)]
pub(crate) struct InMemoryMapping {
    pub name: u64,
    pub max_nodes: u32,
    appender: Arc<Mutex<()>>,
    state: RwLock<MappingState>,
}

impl InMemoryMapping {
    pub fn new(name: u64, max_nodes: u32) -> Self {
        Self {
            name,
            max_nodes,
            appender: Arc::new(Mutex::new(())),
            state: RwLock::new(MappingState {
                index: FxHashMap::default(),
                chunks: vec![Chunk::new(0)],
            }),
        }
    }

    /// Calls `f` with every chunk, in id order.
    pub fn with_chunks<R>(&self, f: impl FnOnce(&[Chunk]) -> R) -> R {
        f(&self.state.read().chunks)
    }

    fn append(&self, dst: &mut [u32], stacktraces: &[&[u64]]) -> Result<()> {
        if dst.len() < stacktraces.len() {
            return Err(Error::invalid_input(
                "destination is shorter than the stack trace batch",
            ));
        }
        let mut misses = 0;
        {
            let state = self.state.read();
            for (slot, locations) in dst.iter_mut().zip(stacktraces) {
                match state.index.get(*locations) {
                    Some(&id) => *slot = id,
                    None if locations.is_empty() => *slot = 0,
                    None => {
                        *slot = u32::MAX;
                        misses += 1;
                    }
                }
            }
        }
        if misses == 0 {
            return Ok(());
        }

        let mut state = self.state.write();
        let state = &mut *state;
        for (slot, locations) in dst.iter_mut().zip(stacktraces) {
            if *slot != u32::MAX {
                continue;
            }
            if let Some(&id) = state.index.get(*locations) {
                *slot = id;
                continue;
            }
            let full = state
                .chunks
                .last()
                .map_or(true, |c| self.max_nodes > 0 && c.tree.len() >= self.max_nodes);
            if full {
                let stid = match state.chunks.last() {
                    Some(c) => c
                        .stid
                        .checked_add(c.tree.len())
                        .ok_or(Error::CapacityExceeded("stack trace ids"))?,
                    None => 0,
                };
                state.chunks.push(Chunk::new(stid));
            }
            let Some(chunk) = state.chunks.last_mut() else {
                return Err(Error::invalid_input("mapping has no chunk"));
            };
            // u32::MAX marks unresolved slots above.
            let highest = u64::from(chunk.stid) + u64::from(chunk.tree.len()) + locations.len() as u64;
            if highest >= u64::from(u32::MAX) {
                return Err(Error::CapacityExceeded("stack trace ids"));
            }
            let id = chunk.stid + chunk.tree.insert(locations)?;
            chunk.stacktraces += 1;
            chunk.max_depth = chunk.max_depth.max(locations.len() as u32);
            state.index.insert(Box::from(*locations), id);
            *slot = id;
        }
        Ok(())
    }

    fn resolve<S: StacktraceInserter + ?Sized>(&self, dst: &mut S, ids: &[u32]) -> Result<()> {
        check_ascending(ids)?;
        let state = self.state.read();
        let mut buf = Vec::new();
        for &id in ids {
            let i = state.chunks.partition_point(|c| c.stid <= id);
            let chunk = i
                .checked_sub(1)
                .and_then(|i| state.chunks.get(i))
                .ok_or(Error::StacktraceNotFound(id))?;
            if !chunk.tree.resolve(id - chunk.stid, &mut buf) {
                return Err(Error::StacktraceNotFound(id));
            }
            dst.insert_stacktrace(id, &buf);
        }
        Ok(())
    }
}

/// Write access to one mapping.
#[derive(Clone, Debug)]
pub struct MappingWriter {
    pub(crate) mapping: Arc<InMemoryMapping>,
}

impl MappingWriter {
    /// Returns the exclusive appender of the mapping, blocking while another
    /// appender holds it.
    ///
    /// The appender must be released exactly once, with
    /// [`StacktraceAppender::release`] or by dropping it; until then every
    /// other writer of the mapping waits.
    pub fn stacktrace_appender(&self) -> StacktraceAppender {
        let guard = self.mapping.appender.lock_arc();
        StacktraceAppender {
            mapping: Arc::clone(&self.mapping),
            guard: Some(guard),
        }
    }

    /// Like [`MappingWriter::stacktrace_appender`], but returns `None` if the
    /// appender is taken.
    pub fn try_stacktrace_appender(&self) -> Option<StacktraceAppender> {
        let guard = self.mapping.appender.try_lock_arc()?;
        Some(StacktraceAppender {
            mapping: Arc::clone(&self.mapping),
            guard: Some(guard),
        })
    }
}

pub struct StacktraceAppender {
    mapping: Arc<InMemoryMapping>,
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
}

impl StacktraceAppender {
    /// Assigns an id to every stack trace (location ids, leaf first) and
    /// writes it into `dst[i]`. Known stack traces keep their id; the empty
    /// stack trace is the root, id 0.
    pub fn append_stacktraces(&mut self, dst: &mut [u32], stacktraces: &[&[u64]]) -> Result<()> {
        if self.guard.is_none() {
            return Err(Error::invalid_input("stack trace appender was released"));
        }
        self.mapping.append(dst, stacktraces)
    }

    /// Hands the mapping to the next appender. Releasing twice is a no-op.
    pub fn release(&mut self) {
        drop(self.guard.take());
    }

    pub fn is_released(&self) -> bool {
        self.guard.is_none()
    }
}

impl Drop for StacktraceAppender {
    fn drop(&mut self) {
        self.release();
    }
}

/// Shared read access to one mapping.
#[derive(Clone, Debug)]
pub struct MappingReader {
    pub(crate) mapping: Arc<InMemoryMapping>,
}

impl MappingReader {
    pub fn stacktrace_resolver(&self) -> MemoryResolver {
        MemoryResolver {
            mapping: Arc::clone(&self.mapping),
        }
    }
}

pub struct MemoryResolver {
    mapping: Arc<InMemoryMapping>,
}

impl StacktraceResolver for MemoryResolver {
    fn resolve_stacktraces<S: StacktraceInserter + ?Sized>(&mut self, dst: &mut S, ids: &[u32]) -> Result<()> {
        self.mapping.resolve(dst, ids)
    }
}
