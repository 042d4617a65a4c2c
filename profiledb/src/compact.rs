// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Merges flushed blocks into one.
//!
//! The symbols of every source block go through a [`Rewriter`] into fresh
//! tables, so symbols shared by several blocks are stored once. Profiles are
//! merged in time order; a profile found in several sources with the same
//! time and labels is kept once.

use crate::block::{Block, BlockMeta, BlockSource};
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::head::HeadStores;
use crate::iter::{MergeIterator, ProfileIterator, SliceIterator};
use crate::model::{Labels, Profile};
use crate::query::ProfileWithLabels;
use crate::rewriter::Rewriter;
use crate::store::Persist;
use std::fs;
use std::mem;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const PROFILE_BATCH_SIZE: usize = 1024;

/// Writes the union of `blocks` to a new block under `dst/<id>/` and
/// returns its metadata. The new block has [`BlockSource::Compactor`] as
/// source. On failure the partial directory is removed.
pub fn compact(blocks: &[Arc<Block>], dst: &Path, store: &StoreConfig) -> Result<BlockMeta> {
    if blocks.is_empty() {
        return Err(Error::invalid_input("no blocks to compact"));
    }
    let id = Uuid::new_v4();
    let dir = dst.join(id.to_string());
    let stores = HeadStores::create(dir.clone(), id, store)?;
    info!(block = %id, sources = blocks.len(), path = %dir.display(), "Compacting blocks");

    match write_compacted(blocks, &stores) {
        Ok(meta) => {
            info!(
                block = %meta.id,
                min_time = meta.min_time,
                max_time = meta.max_time,
                num_series = meta.stats.num_series,
                num_profiles = meta.stats.num_profiles,
                "Compacted blocks"
            );
            Ok(meta)
        }
        Err(err) => {
            drop(stores);
            if let Err(rm) = fs::remove_dir_all(&dir) {
                warn!(path = %dir.display(), err = %rm, "Failed to remove partial block");
            }
            Err(err)
        }
    }
}

fn write_compacted(blocks: &[Arc<Block>], stores: &HeadStores) -> Result<BlockMeta> {
    let mut streams = Vec::new();
    for block in blocks {
        let mut r = Rewriter::new();
        stores.strings.ingest(dense_rows(block)?, &mut r)?;
        stores.mappings.ingest(dense_rows(block)?, &mut r)?;
        stores.functions.ingest(dense_rows(block)?, &mut r)?;
        stores.locations.ingest(dense_rows(block)?, &mut r)?;
        stores.stacktraces.ingest(dense_rows(block)?, &mut r)?;
        stores.cut_full_tables()?;

        let mut rows: Vec<Option<Profile>> = dense_rows::<Profile>(block)?
            .into_iter()
            .map(Some)
            .collect();
        for entry in block.index() {
            let labels = Arc::new(entry.labels.clone());
            let mut series = Vec::new();
            for &(first, last) in &entry.rows {
                for row in first..last {
                    let mut profile = rows
                        .get_mut(row as usize)
                        .and_then(Option::take)
                        .ok_or(Error::InvalidSize)?;
                    profile.rewrite(&r)?;
                    series.push(ProfileWithLabels {
                        profile: Arc::new(profile),
                        labels: Arc::clone(&labels),
                        fingerprint: entry.fingerprint,
                    });
                }
            }
            series.sort_by_key(|p| p.profile.time_nanos);
            streams.push(SliceIterator::new(series));
        }
        debug!(block = %block.meta().id, series = block.index().len(), "Rewrote block symbols");
    }

    let mut merged = MergeIterator::new(streams, true);
    let mut batch: Vec<(Profile, Labels)> = Vec::with_capacity(PROFILE_BATCH_SIZE);
    for p in merged.by_ref() {
        batch.push((Arc::unwrap_or_clone(p.profile), Labels::clone(&p.labels)));
        if batch.len() == PROFILE_BATCH_SIZE {
            stores.append_profiles(mem::take(&mut batch))?;
            stores.cut_full_tables()?;
        }
    }
    merged.close()?;
    stores.append_profiles(batch)?;
    stores.write_block(BlockSource::Compactor)
}

/// Rows of table `T`, which must hold every id from 0 up.
fn dense_rows<T: Persist>(block: &Block) -> Result<Vec<T>> {
    let rows = block.table::<T>()?;
    if rows
        .iter()
        .enumerate()
        .any(|(pos, (id, _))| *id != pos as u64)
    {
        return Err(Error::InvalidSize);
    }
    Ok(rows.into_iter().map(|(_, row)| row).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::META_FILE_NAME;
    use crate::collections::offset_of_pprof_id;
    use crate::head::tests::{cpu_profile, external, request, test_config};
    use crate::iter::collect;
    use crate::model::{Function, Location, Stacktrace};
    use crate::ProfileDb;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn compaction_merges_symbols_and_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let db = ProfileDb::open(test_config(dir.path())).unwrap();
        let id = Uuid::new_v4();
        db.ingest(&cpu_profile(1_000_000), id, &external("api"))
            .unwrap();
        let first = db.flush().unwrap().remove(0);
        db.ingest(&cpu_profile(1_000_000), id, &external("api"))
            .unwrap();
        db.ingest(&cpu_profile(2_000_000), Uuid::new_v4(), &external("api"))
            .unwrap();
        let second = db.flush().unwrap().remove(0);
        assert_eq!(second.stats.num_profiles, 4);

        let meta = db.compact(&[first.id, second.id]).unwrap();
        assert_eq!(meta.source, BlockSource::Compactor);
        assert_eq!((meta.min_time, meta.max_time), (1, 2));
        assert_eq!(meta.stats.num_series, 2);
        // The profile found in both sources is kept once.
        assert_eq!(meta.stats.num_profiles, 4);
        assert_eq!(db.blocks(), [meta.clone()]);
        assert!(!db.block_dir(first.id).exists());
        assert!(!db.block_dir(second.id).exists());

        let block = Block::open(db.block_dir(meta.id)).unwrap();
        let json: serde_json::Value =
            serde_json::from_slice(&fs::read(block.dir().join(META_FILE_NAME)).unwrap()).unwrap();
        assert_eq!(json["source"], "compactor");

        let strings: Vec<(u64, String)> = block.table().unwrap();
        assert_eq!(strings.len(), 11);
        let stacktraces: Vec<(u64, Stacktrace)> = block.table().unwrap();
        assert_eq!(stacktraces.len(), 2);
        let locations: Vec<(u64, Location)> = block.table().unwrap();
        let functions: Vec<(u64, Function)> = block.table().unwrap();

        let req = request("{}", "cpu", "nanoseconds", 0, 10);
        let profiles = collect(db.select_profiles(&req, CancellationToken::new()).unwrap()).unwrap();
        let times: Vec<i64> = profiles.iter().map(|p| p.profile.time_millis()).collect();
        assert_eq!(times, [1, 2]);
        for p in &profiles {
            assert_eq!(p.profile.total(), 400);
            let st = &stacktraces[p.profile.samples[0].stacktrace_id as usize].1;
            let leaf = &locations[offset_of_pprof_id(st.location_ids[0]).unwrap() as usize].1;
            let function = &functions[offset_of_pprof_id(leaf.lines[0].function_id).unwrap() as usize].1;
            assert_eq!(strings[function.name as usize].1, "work");
        }
    }

    #[test]
    fn nothing_to_compact() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            compact(&[], dir.path(), &StoreConfig::default()),
            Err(Error::InvalidInput(_))
        ));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);

        let db = ProfileDb::open(test_config(dir.path())).unwrap();
        assert!(matches!(
            db.compact(&[Uuid::new_v4()]),
            Err(Error::InvalidInput(_))
        ));
    }
}
