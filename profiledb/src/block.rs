// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Flushed, immutable blocks.
//!
//! A block is a directory `<data_path>/local/<block id>/` holding one table
//! file per store, `index.bin` and `meta.json`.

use crate::collections::FxHashMap;
use crate::error::{Error, Result};
use crate::index::{self, matches_all, Matcher, SeriesEntry};
use crate::iter::{Cancellable, MergeIterator, ProfileIterator, TimeRangedIterator};
use crate::model::{Fingerprint, Labels, Profile};
use crate::query::{ProfileStream, ProfileWithLabels};
use crate::store::segment::{self, RowGroupInfo};
use crate::store::Persist;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const META_FILE_NAME: &str = "meta.json";
pub const META_VERSION: u32 = 1;
pub const HEAD_DIR_NAME: &str = "head";
pub const LOCAL_DIR_NAME: &str = "local";

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockSource {
    Head,
    Compactor,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStats {
    pub num_series: u64,
    pub num_profiles: u64,
    pub num_samples: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockFile {
    /// Relative to the block directory.
    pub rel_path: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<u64>,
}

/// Contents of `meta.json`. Times are milliseconds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    pub id: Uuid,
    pub min_time: i64,
    pub max_time: i64,
    pub version: u32,
    pub source: BlockSource,
    pub stats: BlockStats,
    #[serde(default)]
    pub files: Vec<BlockFile>,
}

impl BlockMeta {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            min_time: 0,
            max_time: 0,
            version: META_VERSION,
            source: BlockSource::Head,
            stats: BlockStats::default(),
            files: Vec::new(),
        }
    }

    /// Whether `[start, end]` (milliseconds, inclusive) overlaps the block.
    pub fn overlaps(&self, start: i64, end: i64) -> bool {
        start <= self.max_time && end >= self.min_time
    }

    pub fn write_to(&self, dir: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        fs::write(dir.join(META_FILE_NAME), bytes)?;
        Ok(())
    }

    pub fn read_from(dir: &Path) -> Result<Self> {
        let bytes = fs::read(dir.join(META_FILE_NAME))?;
        let meta: Self = serde_json::from_slice(&bytes)?;
        if meta.version != META_VERSION {
            return Err(Error::UnsupportedVersion(meta.version));
        }
        Ok(meta)
    }
}

/// Read access to a flushed block.
///
/// Opening reads `meta.json`, `index.bin` and the row group headers of
/// `profiles.bin`. Profile rows are read per series while a selection is
/// consumed.
#[derive(Debug)]
pub struct Block {
    dir: PathBuf,
    meta: BlockMeta,
    /// In series index order.
    index: Vec<SeriesEntry>,
    profile_groups: Arc<[RowGroupInfo]>,
}

impl Block {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let meta = BlockMeta::read_from(&dir)?;
        let mut index = index::read_index(&dir)?;
        index.sort_by_key(|s| s.series_index);
        let profile_groups = segment::read_directory(&table_path::<Profile>(&dir))?.into();
        Ok(Self {
            dir,
            meta,
            index,
            profile_groups,
        })
    }

    pub fn meta(&self) -> &BlockMeta {
        &self.meta
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Every row of table `T`, in row id order.
    pub fn table<T: Persist>(&self) -> Result<Vec<(u64, T)>> {
        let mut rows: Vec<(u64, T)> = segment::read_table(&table_path::<T>(&self.dir))?;
        rows.sort_unstable_by_key(|(id, _)| *id);
        Ok(rows)
    }

    pub fn index(&self) -> &[SeriesEntry] {
        &self.index
    }

    /// Profiles of the series matching `matchers`, merged in time order and
    /// limited to `[start, end]` milliseconds.
    ///
    /// Each series reads its rows when the stream first needs it, after
    /// checking `token`. Row groups read for one series are shared with the
    /// others of the same selection.
    pub fn select_profiles(
        &self,
        matchers: &[Matcher],
        start: i64,
        end: i64,
        token: CancellationToken,
    ) -> Result<ProfileStream<BlockSeries>> {
        let rows = Arc::new(ProfileRows {
            path: table_path::<Profile>(&self.dir),
            groups: Arc::clone(&self.profile_groups),
            loaded: Mutex::default(),
        });
        let streams = self
            .index
            .iter()
            .filter(|s| matches_all(matchers, &s.labels))
            .map(|s| {
                let series = BlockSeries {
                    rows: Arc::clone(&rows),
                    ranges: s.rows.clone(),
                    labels: Arc::new(s.labels.clone()),
                    fingerprint: s.fingerprint,
                    token: token.clone(),
                    profiles: None,
                    err: None,
                };
                TimeRangedIterator::new(series, start, end)
            })
            .collect();
        Ok(Cancellable::new(MergeIterator::new(streams, true), token))
    }

    /// Label sets of the series of the block.
    pub fn series(&self) -> Vec<Labels> {
        self.index.iter().map(|s| s.labels.clone()).collect()
    }
}

fn table_path<T: Persist>(dir: &Path) -> PathBuf {
    dir.join(format!("{}.bin", T::NAME))
}

type DecodedGroup = Arc<Vec<(u64, Arc<Profile>)>>;

/// Row groups of `profiles.bin`, decoded on demand.
#[derive(Debug)]
struct ProfileRows {
    path: PathBuf,
    groups: Arc<[RowGroupInfo]>,
    loaded: Mutex<FxHashMap<usize, DecodedGroup>>,
}

impl ProfileRows {
    fn group(&self, i: usize, info: &RowGroupInfo) -> Result<DecodedGroup> {
        if let Some(rows) = self.loaded.lock().get(&i) {
            return Ok(Arc::clone(rows));
        }
        let mut rows: Vec<(u64, Profile)> = segment::read_row_group_at(&self.path, info.offset)?;
        rows.sort_unstable_by_key(|(id, _)| *id);
        let rows: DecodedGroup = Arc::new(rows.into_iter().map(|(id, p)| (id, Arc::new(p))).collect());
        self.loaded.lock().insert(i, Arc::clone(&rows));
        Ok(rows)
    }

    /// Profiles with row ids in `[first, last)`, in row id order.
    fn range(&self, first: u64, last: u64, out: &mut Vec<Arc<Profile>>) -> Result<()> {
        let start = self.groups.partition_point(|g| g.end_row() <= first);
        for (i, info) in self.groups.iter().enumerate().skip(start) {
            if info.first_row >= last {
                break;
            }
            let rows = self.group(i, info)?;
            let from = rows.partition_point(|(id, _)| *id < first);
            out.extend(
                rows[from..]
                    .iter()
                    .take_while(|(id, _)| *id < last)
                    .map(|(_, p)| Arc::clone(p)),
            );
        }
        Ok(())
    }
}

/// One series of a block selection, sorted by time. Its rows are read on
/// the first advance.
pub struct BlockSeries {
    rows: Arc<ProfileRows>,
    ranges: Vec<(u64, u64)>,
    labels: Arc<Labels>,
    fingerprint: Fingerprint,
    token: CancellationToken,
    profiles: Option<std::vec::IntoIter<ProfileWithLabels>>,
    err: Option<Error>,
}

impl BlockSeries {
    fn load(&self) -> Result<Vec<ProfileWithLabels>> {
        let mut rows = Vec::new();
        for &(first, last) in &self.ranges {
            self.rows.range(first, last, &mut rows)?;
        }
        let mut profiles: Vec<ProfileWithLabels> = rows
            .into_iter()
            .map(|profile| ProfileWithLabels {
                profile,
                labels: Arc::clone(&self.labels),
                fingerprint: self.fingerprint,
            })
            .collect();
        profiles.sort_by_key(|p| p.profile.time_nanos);
        Ok(profiles)
    }
}

impl Iterator for BlockSeries {
    type Item = ProfileWithLabels;

    fn next(&mut self) -> Option<ProfileWithLabels> {
        if self.profiles.is_none() {
            if self.err.is_some() {
                return None;
            }
            if self.token.is_cancelled() {
                self.err = Some(Error::Cancelled);
                return None;
            }
            match self.load() {
                Ok(profiles) => self.profiles = Some(profiles.into_iter()),
                Err(err) => {
                    self.err = Some(err);
                    return None;
                }
            }
        }
        self.profiles.as_mut()?.next()
    }
}

impl ProfileIterator for BlockSeries {
    fn err(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    fn close(&mut self) -> Result<()> {
        match self.err.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::head::tests::{cpu_profile, external, test_config};
    use crate::head::Head;
    use crate::iter::collect;
    use crate::model::LABEL_NAME_TYPE;

    #[test]
    fn meta_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut meta = BlockMeta::new(Uuid::new_v4());
        meta.min_time = 1_000;
        meta.max_time = 2_000;
        meta.stats.num_profiles = 3;
        meta.files.push(BlockFile {
            rel_path: "profiles.bin".into(),
            size_bytes: 42,
            rows: Some(3),
        });
        meta.write_to(dir.path()).unwrap();

        let json: serde_json::Value =
            serde_json::from_slice(&fs::read(dir.path().join(META_FILE_NAME)).unwrap()).unwrap();
        assert_eq!(json["source"], "head");
        assert_eq!(json["stats"]["num_profiles"], 3);
        assert_eq!(BlockMeta::read_from(dir.path()).unwrap(), meta);

        assert!(meta.overlaps(2_000, 3_000));
        assert!(meta.overlaps(0, 1_000));
        assert!(!meta.overlaps(2_001, 3_000));
    }

    #[test]
    fn series_are_read_on_demand() {
        let dir = tempfile::tempdir().unwrap();
        let head = Head::new(test_config(dir.path())).unwrap();
        for (job, ms) in [("a", 1), ("b", 2), ("a", 3)] {
            head.ingest(&cpu_profile(ms * 1_000_000), Uuid::new_v4(), &external(job))
                .unwrap();
        }
        let meta = head.flush().unwrap().remove(0);
        let block = Block::open(dir.path().join(LOCAL_DIR_NAME).join(meta.id.to_string())).unwrap();
        assert_eq!(block.index().len(), 4);
        assert_eq!(block.series().len(), 4);

        let matchers = [Matcher::equal(LABEL_NAME_TYPE, "cpu")];
        let got: Vec<(i64, String)> = collect(
            block
                .select_profiles(&matchers, 0, 10, CancellationToken::new())
                .unwrap(),
        )
        .unwrap()
        .into_iter()
        .map(|p| (p.profile.time_millis(), p.labels.get("job").unwrap_or_default().to_string()))
        .collect();
        assert_eq!(
            got,
            [(1, "a".to_string()), (2, "b".to_string()), (3, "a".to_string())]
        );

        // Nothing is read before the first advance, and a cancelled
        // selection never reads.
        fs::remove_file(block.dir().join("profiles.bin")).unwrap();
        let token = CancellationToken::new();
        let mut it = block.select_profiles(&matchers, 0, 10, token.clone()).unwrap();
        token.cancel();
        assert!(it.next().is_none());
        assert!(matches!(it.close(), Err(Error::Cancelled)));

        match collect(
            block
                .select_profiles(&matchers, 0, 10, CancellationToken::new())
                .unwrap(),
        ) {
            Err(Error::Multi(errs)) => {
                assert_eq!(errs.len(), 2);
                assert!(errs.errors().iter().all(|e| matches!(e, Error::Io(_))));
            }
            other => panic!("unexpected result: {:?}", other.map(|p| p.len())),
        }
    }

    #[test]
    fn cancelled_series_never_loads() {
        let rows = Arc::new(ProfileRows {
            path: PathBuf::from("missing"),
            groups: Arc::from(Vec::new()),
            loaded: Mutex::default(),
        });
        let token = CancellationToken::new();
        let mut series = BlockSeries {
            rows,
            ranges: Vec::new(),
            labels: Arc::new(Labels::default()),
            fingerprint: Fingerprint::default(),
            token: token.clone(),
            profiles: None,
            err: None,
        };
        token.cancel();
        assert!(series.next().is_none());
        assert!(matches!(series.err(), Some(Error::Cancelled)));
        assert!(matches!(series.close(), Err(Error::Cancelled)));
        assert!(series.close().is_ok());
    }

    #[test]
    fn unknown_meta_version() {
        let dir = tempfile::tempdir().unwrap();
        let mut meta = BlockMeta::new(Uuid::new_v4());
        meta.version = 7;
        meta.write_to(dir.path()).unwrap();
        assert!(matches!(
            BlockMeta::read_from(dir.path()),
            Err(Error::UnsupportedVersion(7))
        ));
        assert!(matches!(
            Block::open(dir.path().join("missing")),
            Err(Error::Io(_))
        ));
    }
}
