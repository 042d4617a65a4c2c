// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The deduplicating column store.
//!
//! Every table of a head is a [`ColumnStore`]. Callers rewrite their rows and
//! hand them to a dedicated writer thread through a bounded queue; the
//! writer is the only one mutating the dedup lookup table and the buffer, so
//! two batches can never race for the same key. Readers share the buffer
//! through a read lock.
//!
//! [`ColumnStore::append`] cuts a row group as soon as the buffer is full.
//! [`ColumnStore::ingest`] and [`ColumnStore::stage`] never touch the disk;
//! the caller cuts with [`ColumnStore::cut_if_full`] once its whole batch is
//! committed, so an I/O error can not interrupt a batch half way.

mod persist;
pub mod segment;

pub use persist::Persist;

use crate::collections::FxHashMap;
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::rewriter::Rewriter;
use parking_lot::{Mutex, RwLock};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// Totals reported by [`ColumnStore::flush`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub rows: u64,
    pub row_groups: u64,
}

/// Where a cut row group lives. Rows `first_row..first_row + num_rows` are
/// all in this group, in sort key order.
#[derive(Clone, Debug)]
struct RowGroupHandle {
    path: PathBuf,
    offset: u64,
    first_row: u64,
    num_rows: u64,
}

impl RowGroupHandle {
    fn contains(&self, row_id: u64) -> bool {
        row_id >= self.first_row && row_id - self.first_row < self.num_rows
    }
}

struct State<T: Persist> {
    lookup: FxHashMap<T::Key, u64>,
    /// Rows not cut yet, in row id order.
    buffer: Vec<(u64, T)>,
    buffer_bytes: u64,
    num_rows: u64,
    row_groups: Vec<RowGroupHandle>,
    finalized: bool,
}

struct Shared<T: Persist> {
    dir: PathBuf,
    config: StoreConfig,
    state: RwLock<State<T>>,
}

enum Request<T> {
    Append {
        rows: Vec<T>,
        cut: bool,
        reply: SyncSender<Result<Vec<u64>>>,
    },
    Cut {
        reply: SyncSender<Result<bool>>,
    },
    Flush {
        reply: SyncSender<Result<FlushStats>>,
    },
}

pub struct ColumnStore<T: Persist> {
    shared: Arc<Shared<T>>,
    sender: Mutex<Option<SyncSender<Request<T>>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Persist> ColumnStore<T> {
    /// Creates the store in `dir` and starts its writer thread.
    pub fn open(dir: impl Into<PathBuf>, config: StoreConfig) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let (tx, mailbox) = sync_channel(config.append_queue_depth);
        let shared = Arc::new(Shared {
            dir,
            config,
            state: RwLock::new(State {
                lookup: FxHashMap::default(),
                buffer: Vec::new(),
                buffer_bytes: 0,
                num_rows: 0,
                row_groups: Vec::new(),
                finalized: false,
            }),
        });
        let worker = Arc::clone(&shared);
        let writer = std::thread::Builder::new()
            .name(format!("{}-writer", T::NAME))
            .spawn(move || worker.run(mailbox))?;
        Ok(Self {
            shared,
            sender: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
        })
    }

    pub fn name(&self) -> &'static str {
        T::NAME
    }

    pub fn path(&self) -> PathBuf {
        self.shared.table_path()
    }

    /// Rewrites `rows` through `rewriter`, stores them, and records the
    /// local to global translation for `T` into `rewriter`.
    ///
    /// Returns the row id of every input row. Blocks while the append queue
    /// is full. Never cuts.
    pub fn ingest(&self, mut rows: Vec<T>, rewriter: &mut Rewriter) -> Result<Vec<u64>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let mut locals = Vec::with_capacity(rows.len());
        for (pos, row) in rows.iter_mut().enumerate() {
            locals.push(row.local_id(pos));
            row.rewrite(rewriter)?;
        }
        let ids = self.stage(rows)?;
        for (local, id) in locals.into_iter().zip(&ids) {
            rewriter.insert(T::KIND, local, T::reference(*id));
        }
        Ok(ids)
    }

    /// Stores already rewritten rows, cutting a row group if the buffer
    /// fills up, and returns their row ids.
    pub fn append(&self, rows: Vec<T>) -> Result<Vec<u64>> {
        self.request_append(rows, true)
    }

    /// Like [`ColumnStore::append`], but leaves the buffer in memory.
    pub fn stage(&self, rows: Vec<T>) -> Result<Vec<u64>> {
        self.request_append(rows, false)
    }

    fn request_append(&self, rows: Vec<T>, cut: bool) -> Result<Vec<u64>> {
        let (reply, rx) = sync_channel(1);
        self.send(Request::Append { rows, cut, reply })?;
        rx.recv().map_err(|_| Error::StoreClosed(T::NAME))?
    }

    /// Cuts a row group if the buffer reached a threshold. Returns whether
    /// it did. A failed cut keeps the rows buffered.
    pub fn cut_if_full(&self) -> Result<bool> {
        let (reply, rx) = sync_channel(1);
        self.send(Request::Cut { reply })?;
        rx.recv().map_err(|_| Error::StoreClosed(T::NAME))?
    }

    /// Cuts the remaining rows and joins every segment into the table file.
    /// The table accepts no rows afterwards. Flushing a flushed table
    /// returns its totals again, even after [`ColumnStore::close`].
    pub fn flush(&self) -> Result<FlushStats> {
        if let Some(stats) = self.shared.finalized_stats() {
            return Ok(stats);
        }
        let (reply, rx) = sync_channel(1);
        self.send(Request::Flush { reply })?;
        rx.recv().map_err(|_| Error::StoreClosed(T::NAME))?
    }

    /// Stops the writer thread. Rows already stored stay readable.
    pub fn close(&self) -> Result<()> {
        drop(self.sender.lock().take());
        if let Some(writer) = self.writer.lock().take() {
            writer
                .join()
                .map_err(|_| io::Error::other(format!("{} writer panicked", T::NAME)))?;
        }
        Ok(())
    }

    fn send(&self, request: Request<T>) -> Result<()> {
        // Clone the sender so a full queue does not hold the lock.
        let sender = self
            .sender
            .lock()
            .clone()
            .ok_or(Error::StoreClosed(T::NAME))?;
        sender.send(request).map_err(|_| Error::StoreClosed(T::NAME))
    }

    pub fn get(&self, row_id: u64) -> Result<Option<T>> {
        let handle = {
            let state = self.shared.state.read();
            if let Some(row) = find_buffered(&state.buffer, row_id) {
                return Ok(Some(row.clone()));
            }
            let i = state
                .row_groups
                .partition_point(|g| g.first_row + g.num_rows <= row_id);
            match state.row_groups.get(i) {
                Some(g) if g.contains(row_id) => g.clone(),
                _ => return Ok(None),
            }
        };
        let rows: Vec<(u64, T)> = segment::read_row_group_at(&handle.path, handle.offset)?;
        Ok(rows.into_iter().find(|(id, _)| *id == row_id).map(|(_, row)| row))
    }

    /// Buffered rows, in row id order.
    pub fn snapshot(&self) -> Vec<T> {
        let state = self.shared.state.read();
        state.buffer.iter().map(|(_, row)| row.clone()).collect()
    }

    /// Every stored row, cut or buffered, in row id order.
    pub fn rows(&self) -> Result<Vec<(u64, T)>> {
        let (groups, buffered) = {
            let state = self.shared.state.read();
            (state.row_groups.clone(), state.buffer.clone())
        };
        let mut rows = Vec::new();
        for g in &groups {
            let mut group: Vec<(u64, T)> = segment::read_row_group_at(&g.path, g.offset)?;
            group.sort_unstable_by_key(|(id, _)| *id);
            rows.extend(group);
        }
        rows.extend(buffered);
        Ok(rows)
    }

    pub fn lookup(&self, key: &T::Key) -> Option<u64> {
        self.shared.state.read().lookup.get(key).copied()
    }

    pub fn num_rows(&self) -> u64 {
        self.shared.state.read().num_rows
    }

    pub fn buffered_rows(&self) -> usize {
        self.shared.state.read().buffer.len()
    }

    pub fn buffered_size(&self) -> u64 {
        self.shared.state.read().buffer_bytes
    }

    pub fn row_groups(&self) -> usize {
        self.shared.state.read().row_groups.len()
    }
}

impl<T: Persist> Drop for ColumnStore<T> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(store = T::NAME, %err, "failed to stop store writer");
        }
    }
}

fn find_buffered<T>(buffer: &[(u64, T)], row_id: u64) -> Option<&T> {
    buffer
        .binary_search_by_key(&row_id, |(id, _)| *id)
        .ok()
        .map(|i| &buffer[i].1)
}

impl<T: Persist> Shared<T> {
    fn run(&self, mailbox: Receiver<Request<T>>) {
        while let Ok(request) = mailbox.recv() {
            match request {
                Request::Append { rows, cut, reply } => {
                    let _ = reply.send(self.append(rows, cut));
                }
                Request::Cut { reply } => {
                    let _ = reply.send(self.cut_if_full());
                }
                Request::Flush { reply } => {
                    let _ = reply.send(self.flush());
                }
            }
        }
    }

    fn table_path(&self) -> PathBuf {
        self.dir.join(format!("{}.bin", T::NAME))
    }

    fn finalized_stats(&self) -> Option<FlushStats> {
        let state = self.state.read();
        state.finalized.then(|| FlushStats {
            rows: state.num_rows,
            row_groups: state.row_groups.len() as u64,
        })
    }

    fn is_full(&self, state: &State<T>) -> bool {
        state.buffer.len() >= self.config.max_buffer_row_count
            || state.buffer_bytes >= self.config.max_row_group_bytes
    }

    fn cut_if_full(&self) -> Result<bool> {
        let full = {
            let state = self.state.read();
            !state.finalized && self.is_full(&state)
        };
        if full {
            self.cut()?;
        }
        Ok(full)
    }

    fn append(&self, rows: Vec<T>, cut: bool) -> Result<Vec<u64>> {
        let mut ids = Vec::with_capacity(rows.len());
        let full = {
            let mut state = self.state.write();
            if state.finalized {
                return Err(Error::StoreClosed(T::NAME));
            }
            for mut row in rows {
                if T::DEDUPLICATE {
                    if let Some(id) = state.lookup.get(&row.key()).copied() {
                        ids.push(id);
                        continue;
                    }
                }
                let id = state.num_rows;
                state.num_rows += 1;
                row.set_id(id);
                if T::DEDUPLICATE {
                    state.lookup.insert(row.key(), id);
                }
                state.buffer_bytes += row.size();
                state.buffer.push((id, row));
                ids.push(id);
            }
            self.is_full(&state)
        };
        if cut && full {
            self.cut()?;
        }
        Ok(ids)
    }

    /// Moves the buffered rows into a new segment file.
    ///
    /// Only the writer thread mutates the state, so the buffer read under
    /// the read lock is still current when the write lock is taken. Readers
    /// keep seeing the buffered rows while the segment is written.
    fn cut(&self) -> Result<()> {
        let mut rows = {
            let state = self.state.read();
            if state.buffer.is_empty() {
                return Ok(());
            }
            state.buffer.clone()
        };
        rows.sort_by_key(|(id, row)| row.sort_key(*id));
        let first_row = rows.iter().map(|(id, _)| *id).min().unwrap_or_default();
        let num_rows = rows.len() as u64;

        let encoded = segment::encode_row_group(&rows)?;
        let path = self.dir.join(format!("{}.{first_row}.seg", T::NAME));
        fs::write(&path, &encoded)?;
        debug!(store = T::NAME, rows = num_rows, bytes = encoded.len(), path = %path.display(), "cut row group");

        let mut state = self.state.write();
        state.buffer.clear();
        state.buffer_bytes = 0;
        state.row_groups.push(RowGroupHandle {
            path,
            offset: 0,
            first_row,
            num_rows,
        });
        Ok(())
    }

    fn flush(&self) -> Result<FlushStats> {
        if let Some(stats) = self.finalized_stats() {
            return Ok(stats);
        }
        self.cut()?;

        let table = self.table_path();
        let groups = self.state.read().row_groups.clone();
        let joined = join_segments(&table, &groups)?;

        let mut state = self.state.write();
        state.row_groups = joined;
        state.finalized = true;
        let stats = FlushStats {
            rows: state.num_rows,
            row_groups: state.row_groups.len() as u64,
        };
        debug!(store = T::NAME, rows = stats.rows, row_groups = stats.row_groups, path = %table.display(), "flushed table");
        Ok(stats)
    }
}

/// Concatenates segment files into `table` and removes them. Returns the
/// handles pointing into the table.
fn join_segments(table: &Path, groups: &[RowGroupHandle]) -> Result<Vec<RowGroupHandle>> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(table)?;
    let mut out = BufWriter::new(file);
    let mut offset = 0;
    let mut joined = Vec::with_capacity(groups.len());
    for g in groups {
        let mut segment = File::open(&g.path)?;
        let len = io::copy(&mut segment, &mut out)?;
        joined.push(RowGroupHandle {
            path: table.to_path_buf(),
            offset,
            ..g.clone()
        });
        offset += len;
    }
    out.flush()?;
    out.get_ref().sync_all()?;
    for g in groups {
        fs::remove_file(&g.path)?;
    }
    Ok(joined)
}
