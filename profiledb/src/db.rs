// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::block::{Block, BlockMeta, HEAD_DIR_NAME, LOCAL_DIR_NAME};
use crate::compact;
use crate::config::HeadConfig;
use crate::error::{Error, Result};
use crate::head::{move_to_local, Head};
use crate::iter::{MergeIterator, ProfileIterator};
use crate::model::LabelPair;
use crate::pprof;
use crate::query::{ProfileWithLabels, SelectProfilesRequest};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Flushed blocks, by id.
pub type Blocks = BTreeMap<Uuid, Arc<Block>>;

/// The live head plus the blocks it has flushed to `<data_path>/local/`.
pub struct ProfileDb {
    head: Head,
    blocks: RwLock<Blocks>,
    compacting: Mutex<()>,
}

impl ProfileDb {
    /// Opens the database.
    ///
    /// Head directories that hold a complete block, left by a flush that
    /// failed to move them, are moved to `<data_path>/local/` first; empty
    /// ones are removed. Every block under `<data_path>/local/` is then
    /// loaded. Directories without a readable block are skipped with a
    /// warning.
    pub fn open(config: HeadConfig) -> Result<Self> {
        recover_head_dirs(&config.data_path)?;
        let mut blocks = Blocks::new();
        if let Some(entries) = read_dir_if_exists(&config.data_path.join(LOCAL_DIR_NAME))? {
            for entry in entries {
                let path = entry?.path();
                if !path.is_dir() {
                    continue;
                }
                match Block::open(&path) {
                    Ok(block) => {
                        blocks.insert(block.meta().id, Arc::new(block));
                    }
                    Err(err) => {
                        warn!(path = %path.display(), %err, "Skipping unreadable block");
                    }
                }
            }
        }
        info!(path = %config.data_path.display(), blocks = blocks.len(), "Opened profile database");
        Ok(Self {
            head: Head::new(config)?,
            blocks: RwLock::new(blocks),
            compacting: Mutex::new(()),
        })
    }

    pub fn head(&self) -> &Head {
        &self.head
    }

    pub fn ingest(&self, p: &pprof::Profile, id: Uuid, external_labels: &[LabelPair]) -> Result<()> {
        self.head.ingest(p, id, external_labels)
    }

    /// Flushes the head and registers the new blocks. A generation that
    /// fails to flush stays queryable in the head and is retried by the
    /// next call.
    pub fn flush(&self) -> Result<Vec<BlockMeta>> {
        self.head.flush_with(|meta| self.register(meta.id))
    }

    fn register(&self, id: Uuid) {
        match Block::open(self.block_dir(id)) {
            Ok(block) => {
                self.blocks.write().insert(id, Arc::new(block));
            }
            Err(err) => {
                error!(block = %id, %err, "Failed to open flushed block");
            }
        }
    }

    /// Flushes the head if its oldest profile is older than the block
    /// duration.
    pub fn flush_if_due(&self, now_millis: i64) -> Result<Vec<BlockMeta>> {
        if !self.head.should_flush(now_millis) {
            return Ok(Vec::new());
        }
        self.flush()
    }

    pub fn block_dir(&self, id: Uuid) -> PathBuf {
        self.head
            .config()
            .data_path
            .join(LOCAL_DIR_NAME)
            .join(id.to_string())
    }

    /// Metadata of the flushed blocks, oldest id first.
    pub fn blocks(&self) -> Vec<BlockMeta> {
        self.blocks
            .read()
            .values()
            .map(|b| b.meta().clone())
            .collect()
    }

    /// Holds the block map for reading, e.g. while a retention pass picks
    /// blocks to evict. Evictions wait until the guard is dropped.
    pub fn blocks_read_lock(&self) -> RwLockReadGuard<'_, Blocks> {
        self.blocks.read()
    }

    /// Removes block `id` from the map and deletes its directory. Returns
    /// whether the block was known.
    pub fn evict(&self, id: Uuid) -> Result<bool> {
        let Some(block) = self.blocks.write().remove(&id) else {
            return Ok(false);
        };
        fs::remove_dir_all(block.dir())?;
        let meta = block.meta();
        info!(block = %id, path = %block.dir().display(), min_time = meta.min_time, max_time = meta.max_time, "Evicted block");
        Ok(true)
    }

    /// Merges blocks `ids` into a new block, registers it and evicts the
    /// sources.
    pub fn compact(&self, ids: &[Uuid]) -> Result<BlockMeta> {
        let _compacting = self.compacting.lock();
        let sources = {
            let blocks = self.blocks.read();
            ids.iter()
                .map(|id| {
                    blocks
                        .get(id)
                        .cloned()
                        .ok_or_else(|| Error::invalid_input(format!("unknown block {id}")))
                })
                .collect::<Result<Vec<_>>>()?
        };
        let config = self.head.config();
        let meta = compact::compact(
            &sources,
            &config.data_path.join(LOCAL_DIR_NAME),
            &config.store,
        )?;
        let block = Block::open(self.block_dir(meta.id))?;
        self.blocks.write().insert(meta.id, Arc::new(block));
        for id in ids {
            self.evict(*id)?;
        }
        Ok(meta)
    }

    /// Selects profiles from the head and from every flushed block that
    /// overlaps the requested range, merged and deduplicated.
    pub fn select_profiles(
        &self,
        req: &SelectProfilesRequest,
        token: CancellationToken,
    ) -> Result<MergeIterator<Box<dyn ProfileIterator<Item = ProfileWithLabels> + Send>>> {
        let matchers = req.matchers()?;
        let mut inputs: Vec<Box<dyn ProfileIterator<Item = ProfileWithLabels> + Send>> =
            vec![Box::new(self.head.select_profiles(req, token.clone())?)];

        let blocks: Vec<Arc<Block>> = self
            .blocks
            .read()
            .values()
            .filter(|b| b.meta().overlaps(req.start, req.end))
            .cloned()
            .collect();
        for block in blocks {
            let stream = block.select_profiles(&matchers, req.start, req.end, token.clone())?;
            inputs.push(Box::new(stream));
        }
        Ok(MergeIterator::new(inputs, true))
    }
}

fn read_dir_if_exists(path: &Path) -> Result<Option<fs::ReadDir>> {
    match fs::read_dir(path) {
        Ok(entries) => Ok(Some(entries)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Moves the complete blocks found under `<data_path>/head/` to
/// `<data_path>/local/` and removes empty head directories.
fn recover_head_dirs(data_path: &Path) -> Result<()> {
    let Some(entries) = read_dir_if_exists(&data_path.join(HEAD_DIR_NAME))? else {
        return Ok(());
    };
    for entry in entries {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        match BlockMeta::read_from(&path) {
            Ok(meta) => {
                let dst = move_to_local(&path, data_path, meta.id)?;
                info!(block = %meta.id, path = %dst.display(), "Recovered flushed head");
            }
            Err(_) if fs::read_dir(&path)?.next().is_none() => {
                fs::remove_dir(&path)?;
                debug!(path = %path.display(), "Removed empty head directory");
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "Leaving incomplete head directory");
            }
        }
    }
    Ok(())
}
