// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The head: the mutable block that receives every ingested profile until
//! it is flushed to disk.

use crate::block::{BlockFile, BlockMeta, BlockSource, BlockStats, HEAD_DIR_NAME, LOCAL_DIR_NAME};
use crate::collections::{offset_of_pprof_id, FxIndexSet};
use crate::config::{HeadConfig, StoreConfig};
use crate::error::{Error, MultiError, Result};
use crate::index::{Matcher, ProfileIndex, INDEX_FILE_NAME};
use crate::iter::{Cancellable, MergeIterator, SliceIterator, TimeRangedIterator};
use crate::model::*;
use crate::pprof;
use crate::query::{ProfileStream, ProfileWithLabels, SelectProfilesRequest};
use crate::rewriter::Rewriter;
use crate::store::{ColumnStore, FlushStats, Persist};
use parking_lot::{Mutex, RwLock};
use std::fs;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const NANOS_PER_MILLI: i64 = 1_000_000;

/// One generation of block tables. Flushing swaps in a fresh generation and
/// drains the old one; compaction fills one from existing blocks.
pub(crate) struct HeadStores {
    pub(crate) block_id: Uuid,
    pub(crate) dir: PathBuf,
    pub(crate) strings: ColumnStore<String>,
    pub(crate) mappings: ColumnStore<Mapping>,
    pub(crate) functions: ColumnStore<Function>,
    pub(crate) locations: ColumnStore<Location>,
    pub(crate) stacktraces: ColumnStore<Stacktrace>,
    pub(crate) profiles: ColumnStore<Profile>,
    pub(crate) index: ProfileIndex,
    num_samples: AtomicU64,
}

impl HeadStores {
    fn open(config: &HeadConfig) -> Result<Self> {
        let block_id = Uuid::new_v4();
        let dir = config
            .data_path
            .join(HEAD_DIR_NAME)
            .join(block_id.to_string());
        Self::create(dir, block_id, &config.store)
    }

    pub(crate) fn create(dir: PathBuf, block_id: Uuid, store: &StoreConfig) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(Self {
            block_id,
            strings: ColumnStore::open(&dir, store.clone())?,
            mappings: ColumnStore::open(&dir, store.clone())?,
            functions: ColumnStore::open(&dir, store.clone())?,
            locations: ColumnStore::open(&dir, store.clone())?,
            stacktraces: ColumnStore::open(&dir, store.clone())?,
            profiles: ColumnStore::open(&dir, store.clone())?,
            index: ProfileIndex::new(),
            num_samples: AtomicU64::new(0),
            dir,
        })
    }

    fn is_empty(&self) -> bool {
        self.index.num_profiles() == 0
    }

    /// Stores the symbols and the profiles of `p`. The profile must have
    /// passed [`validate`]. Nothing is cut here, see
    /// [`HeadStores::cut_full_tables`].
    fn ingest(&self, p: &pprof::Profile, id: Uuid, series: &[Labels]) -> Result<()> {
        let mut r = Rewriter::new();
        self.strings.ingest(p.string_table.clone(), &mut r)?;

        let mappings = p
            .mappings
            .iter()
            .map(Mapping::try_from)
            .collect::<Result<Vec<_>>>()?;
        self.mappings.ingest(mappings, &mut r)?;

        let functions = p
            .functions
            .iter()
            .map(Function::try_from)
            .collect::<Result<Vec<_>>>()?;
        self.functions.ingest(functions, &mut r)?;

        let locations = p.locations.iter().map(Location::from).collect();
        self.locations.ingest(locations, &mut r)?;

        // Stack trace i is the stack trace of sample i.
        let stacktraces = p
            .samples
            .iter()
            .map(|s| Stacktrace::new(s.location_ids.clone()))
            .collect();
        self.stacktraces.ingest(stacktraces, &mut r)?;

        let comments = p
            .comment
            .iter()
            .map(|&c| string_ref(c))
            .collect::<Result<Vec<_>>>()?;
        let mut rows = Vec::with_capacity(series.len());
        for (i, labels) in series.iter().enumerate() {
            let mut samples = Vec::with_capacity(p.samples.len());
            for (pos, s) in p.samples.iter().enumerate() {
                let value = s.values.get(i).copied().unwrap_or_default();
                if value == 0 {
                    continue;
                }
                samples.push(Sample {
                    stacktrace_id: pos as u64,
                    value,
                    labels: s
                        .labels
                        .iter()
                        .map(SampleLabel::try_from)
                        .collect::<Result<Vec<_>>>()?,
                });
            }
            rows.push(Profile {
                id,
                series_fingerprint: labels.fingerprint(),
                samples,
                time_nanos: p.time_nanos,
                duration_nanos: p.duration_nanos,
                period: p.period,
                drop_frames: string_ref(p.drop_frames)?,
                keep_frames: string_ref(p.keep_frames)?,
                comments: comments.clone(),
                default_sample_type: string_ref(p.default_sample_type)?,
            });
        }
        for row in &mut rows {
            row.rewrite(&r)?;
        }
        self.append_profiles(rows.into_iter().zip(series.iter().cloned()).collect())
    }

    /// Stores rewritten profile rows and indexes each under its labels.
    pub(crate) fn append_profiles(&self, rows: Vec<(Profile, Labels)>) -> Result<()> {
        let (rows, labels): (Vec<Profile>, Vec<Labels>) = rows.into_iter().unzip();
        let row_ids = self.profiles.stage(rows.clone())?;

        let mut num_samples = 0;
        for ((row, row_id), labels) in rows.into_iter().zip(row_ids).zip(&labels) {
            num_samples += row.samples.len() as u64;
            self.index.add(Arc::new(row), labels, row_id);
        }
        self.num_samples.fetch_add(num_samples, Ordering::Relaxed);
        Ok(())
    }

    /// Cuts a row group out of every table whose buffer is full.
    pub(crate) fn cut_full_tables(&self) -> Result<()> {
        let mut errs = MultiError::new();
        errs.add(self.strings.cut_if_full());
        errs.add(self.mappings.cut_if_full());
        errs.add(self.functions.cut_if_full());
        errs.add(self.locations.cut_if_full());
        errs.add(self.stacktraces.cut_if_full());
        errs.add(self.profiles.cut_if_full());
        errs.into_result()
    }

    /// Writes the tables, `index.bin` and `meta.json` into the generation's
    /// directory and stops the writers. Safe to call again after a failure.
    pub(crate) fn write_block(&self, source: BlockSource) -> Result<BlockMeta> {
        let mut files = Vec::new();
        flush_table(&self.strings, &mut files)?;
        flush_table(&self.mappings, &mut files)?;
        flush_table(&self.functions, &mut files)?;
        flush_table(&self.locations, &mut files)?;
        flush_table(&self.stacktraces, &mut files)?;
        flush_table(&self.profiles, &mut files)?;

        let size_bytes = self.index.write_to(&self.dir)?;
        files.push(BlockFile {
            rel_path: INDEX_FILE_NAME.to_string(),
            size_bytes,
            rows: None,
        });

        let mut meta = BlockMeta::new(self.block_id);
        meta.source = source;
        if let Some((min, max)) = self.index.bounds() {
            meta.min_time = min.div_euclid(NANOS_PER_MILLI);
            meta.max_time = max.div_euclid(NANOS_PER_MILLI);
        }
        meta.stats = BlockStats {
            num_series: self.index.num_series() as u64,
            num_profiles: self.index.num_profiles(),
            num_samples: self.num_samples.load(Ordering::Relaxed),
        };
        meta.files = files;
        meta.write_to(&self.dir)?;

        self.strings.close()?;
        self.mappings.close()?;
        self.functions.close()?;
        self.locations.close()?;
        self.stacktraces.close()?;
        self.profiles.close()?;
        Ok(meta)
    }

    /// Writes the generation and moves it to `<data_path>/local/<block id>`.
    fn drain(&self, data_path: &Path) -> Result<BlockMeta> {
        let meta = self.write_block(BlockSource::Head)?;
        move_to_local(&self.dir, data_path, self.block_id)?;
        Ok(meta)
    }
}

/// Moves a written block directory to `<data_path>/local/<id>`.
pub(crate) fn move_to_local(dir: &Path, data_path: &Path, id: Uuid) -> Result<PathBuf> {
    let local = data_path.join(LOCAL_DIR_NAME);
    fs::create_dir_all(&local)?;
    let dst = local.join(id.to_string());
    fs::rename(dir, &dst)?;
    Ok(dst)
}

fn flush_table<T: Persist>(store: &ColumnStore<T>, files: &mut Vec<BlockFile>) -> Result<()> {
    let FlushStats { rows, row_groups } = store.flush()?;
    let path = store.path();
    let size_bytes = fs::metadata(&path)?.len();
    debug!(table = store.name(), rows, row_groups, size_bytes, "Flushed head table");
    files.push(BlockFile {
        rel_path: format!("{}.bin", store.name()),
        size_bytes,
        rows: Some(rows),
    });
    Ok(())
}

/// Rejects payloads that would fail halfway through ingestion.
fn validate(p: &pprof::Profile) -> Result<()> {
    let strings = p.string_table.len() as i64;
    let check = |what: &str, index: i64| {
        if (0..strings).contains(&index) {
            Ok(())
        } else {
            Err(Error::invalid_profile(format!(
                "{what} string index {index} out of range [0, {strings})"
            )))
        }
    };

    for st in &p.sample_types {
        check("sample type", st.r#type)?;
        check("sample unit", st.unit)?;
    }
    if let Some(pt) = &p.period_type {
        check("period type", pt.r#type)?;
        check("period unit", pt.unit)?;
    }
    check("drop frames", p.drop_frames)?;
    check("keep frames", p.keep_frames)?;
    check("default sample type", p.default_sample_type)?;
    for &c in &p.comment {
        check("comment", c)?;
    }

    let mut mappings = FxIndexSet::default();
    for m in &p.mappings {
        check("mapping filename", m.filename)?;
        check("mapping build id", m.build_id)?;
        mappings.insert(m.id);
    }
    let mut functions = FxIndexSet::default();
    for f in &p.functions {
        check("function name", f.name)?;
        check("function system name", f.system_name)?;
        check("function filename", f.filename)?;
        functions.insert(f.id);
    }
    let mut locations = FxIndexSet::default();
    for l in &p.locations {
        if l.mapping_id != 0 && !mappings.contains(&l.mapping_id) {
            return Err(Error::invalid_profile(format!(
                "location {} references unknown mapping {}",
                l.id, l.mapping_id
            )));
        }
        if let Some(line) = l
            .lines
            .iter()
            .find(|line| line.function_id != 0 && !functions.contains(&line.function_id))
        {
            return Err(Error::invalid_profile(format!(
                "location {} references unknown function {}",
                l.id, line.function_id
            )));
        }
        locations.insert(l.id);
    }

    for (i, s) in p.samples.iter().enumerate() {
        if s.values.len() != p.sample_types.len() {
            return Err(Error::invalid_profile(format!(
                "sample {i} has {} values, expected {}",
                s.values.len(),
                p.sample_types.len()
            )));
        }
        if let Some(id) = s.location_ids.iter().find(|id| !locations.contains(*id)) {
            return Err(Error::invalid_profile(format!(
                "sample {i} references unknown location {id}"
            )));
        }
        for l in &s.labels {
            check("label key", l.key)?;
            check("label value", l.str)?;
            check("label unit", l.num_unit)?;
        }
    }
    Ok(())
}


/// One label set per sample type of `p`. The external `__name__` label is
/// required, it is the first part of every profile type.
fn series_labels(p: &pprof::Profile, external: &[LabelPair]) -> Result<Vec<Labels>> {
    let s = |i: i64| p.string(i).unwrap_or_default();
    let metric = external
        .iter()
        .rev()
        .find(|l| l.name == LABEL_NAME_METRIC)
        .map(|l| l.value.as_str())
        .unwrap_or_default();
    if metric.is_empty() {
        return Err(Error::invalid_profile(format!(
            "missing {LABEL_NAME_METRIC} label"
        )));
    }

    let mut common = external.to_vec();
    let (period_type, period_unit) = match &p.period_type {
        Some(pt) => {
            let (ty, unit) = (s(pt.r#type), s(pt.unit));
            common.push(LabelPair::new(LABEL_NAME_PERIOD_TYPE, ty));
            common.push(LabelPair::new(LABEL_NAME_PERIOD_UNIT, unit));
            (ty, unit)
        }
        None => ("", ""),
    };

    Ok(p.sample_types
        .iter()
        .map(|st| {
            let (ty, unit) = (s(st.r#type), s(st.unit));
            let mut pairs = common.clone();
            pairs.push(LabelPair::new(LABEL_NAME_TYPE, ty));
            pairs.push(LabelPair::new(LABEL_NAME_UNIT, unit));
            pairs.push(LabelPair::new(
                LABEL_NAME_PROFILE_TYPE,
                format!("{metric}:{ty}:{unit}:{period_type}:{period_unit}"),
            ));
            Labels::new(pairs)
        })
        .collect())
}

/// The mutable write buffer of the database.
///
/// Ingestion, queries and lookups share the current generation of tables.
/// [`Head::flush`] takes the write lock only to swap in a fresh generation;
/// it waits for in-flight ingestion to finish, so the old generation is
/// complete when it is drained.
///
/// A generation stays pending from the swap until its block is on disk.
/// Pending generations are still queried, and a generation whose drain
/// failed is retried by the next flush.
pub struct Head {
    config: HeadConfig,
    stores: RwLock<Arc<HeadStores>>,
    /// Oldest first.
    pending: RwLock<Vec<Arc<HeadStores>>>,
    flushing: Mutex<()>,
}

impl Head {
    pub fn new(config: HeadConfig) -> Result<Self> {
        let stores = HeadStores::open(&config)?;
        info!(block = %stores.block_id, path = %stores.dir.display(), "Created head");
        Ok(Self {
            config,
            stores: RwLock::new(Arc::new(stores)),
            pending: RwLock::new(Vec::new()),
            flushing: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &HeadConfig {
        &self.config
    }

    fn current(&self) -> Arc<HeadStores> {
        Arc::clone(&self.stores.read())
    }

    /// Pending generations followed by the current one.
    fn generations(&self) -> Vec<Arc<HeadStores>> {
        // Same lock order as the swap in `flush_with`, so a generation is
        // never missed while it moves to the pending list.
        let current = self.stores.read();
        let mut all = self.pending.read().clone();
        all.push(Arc::clone(&current));
        all
    }

    fn merged<T: Ord>(&self, f: impl Fn(&ProfileIndex) -> Vec<T>) -> Vec<T> {
        let mut out: Vec<T> = self.generations().iter().flat_map(|s| f(&s.index)).collect();
        out.sort();
        out.dedup();
        out
    }

    pub fn block_id(&self) -> Uuid {
        self.stores.read().block_id
    }

    pub fn dir(&self) -> PathBuf {
        self.stores.read().dir.clone()
    }

    /// Number of generations waiting for their block to be written.
    pub fn pending(&self) -> usize {
        self.pending.read().len()
    }

    /// Stores `p` under `id`, as one profile row per sample type.
    ///
    /// `external_labels` are added to the label set of every series; the
    /// `__name__` label names the profile type and must be present.
    pub fn ingest(&self, p: &pprof::Profile, id: Uuid, external_labels: &[LabelPair]) -> Result<()> {
        validate(p)?;
        let series = series_labels(p, external_labels)?;
        // Held for the whole call, see `flush_with`.
        let stores = self.stores.read();
        stores.ingest(p, id, &series)?;
        // The profile is committed; a failed cut leaves the rows buffered
        // for the next cut or the flush.
        if let Err(err) = stores.cut_full_tables() {
            warn!(block = %stores.block_id, %err, "Failed to cut head row groups");
        }
        Ok(())
    }

    /// Flushes the head into blocks under `<data_path>/local/`, see
    /// [`Head::flush_with`].
    pub fn flush(&self) -> Result<Vec<BlockMeta>> {
        self.flush_with(|_| {})
    }

    /// Swaps in a fresh generation and writes every pending generation,
    /// oldest first, to a block. `publish` sees each block before its
    /// generation stops being queried.
    ///
    /// Returns the blocks written, none if the head was empty. If any
    /// generation fails it stays pending and its error is returned.
    pub fn flush_with(&self, mut publish: impl FnMut(&BlockMeta)) -> Result<Vec<BlockMeta>> {
        let _flushing = self.flushing.lock();
        let mut errs = MultiError::new();

        if !self.stores.read().is_empty() {
            if let Some(fresh) = errs.add(HeadStores::open(&self.config)) {
                let mut stores = self.stores.write();
                let old = mem::replace(&mut *stores, Arc::new(fresh));
                self.pending.write().push(old);
            }
        }

        let mut flushed = Vec::new();
        let pending = self.pending.read().clone();
        for stores in pending {
            info!(block = %stores.block_id, profiles = stores.index.num_profiles(), "Flushing head");
            match stores.drain(&self.config.data_path) {
                Ok(meta) => {
                    publish(&meta);
                    self.pending
                        .write()
                        .retain(|s| !Arc::ptr_eq(s, &stores));
                    info!(
                        block = %meta.id,
                        min_time = meta.min_time,
                        max_time = meta.max_time,
                        num_series = meta.stats.num_series,
                        num_profiles = meta.stats.num_profiles,
                        "Flushed head to block"
                    );
                    flushed.push(meta);
                }
                Err(err) => {
                    error!(block = %stores.block_id, path = %stores.dir.display(), %err, "Failed to flush head, keeping it pending");
                    errs.push(err);
                }
            }
        }
        errs.into_result()?;
        Ok(flushed)
    }

    /// Whether the oldest profile of the head is older than the block
    /// duration, relative to `now_millis`.
    pub fn should_flush(&self, now_millis: i64) -> bool {
        let duration = self.config.block_duration.as_millis() as i64;
        self.bounds()
            .is_some_and(|(min, _)| now_millis.saturating_sub(min) >= duration)
    }

    /// Profiles of `req.profile_type` whose series match
    /// `req.label_selector`, within `[req.start, req.end]` milliseconds, in
    /// time order. Profiles of equal time and labels are returned once.
    pub fn select_profiles(
        &self,
        req: &SelectProfilesRequest,
        token: CancellationToken,
    ) -> Result<ProfileStream> {
        let matchers = req.matchers()?;
        let streams = self
            .generations()
            .iter()
            .flat_map(|stores| stores.index.select(&matchers))
            .map(|s| {
                let profiles = s
                    .profiles
                    .into_iter()
                    .map(|profile| ProfileWithLabels {
                        profile,
                        labels: Arc::clone(&s.labels),
                        fingerprint: s.fingerprint,
                    })
                    .collect();
                TimeRangedIterator::new(SliceIterator::new(profiles), req.start, req.end)
            })
            .collect();
        Ok(Cancellable::new(MergeIterator::new(streams, true), token))
    }

    pub fn label_names(&self) -> Vec<String> {
        self.merged(ProfileIndex::label_names)
    }

    pub fn label_values(&self, name: &str) -> Vec<String> {
        self.merged(|index| index.label_values(name))
    }

    pub fn profile_types(&self) -> Vec<ProfileType> {
        let mut types: Vec<ProfileType> = self
            .generations()
            .iter()
            .flat_map(|s| s.index.profile_types())
            .collect();
        types.sort_by_key(ProfileType::id);
        types.dedup();
        types
    }

    pub fn series(&self, matchers: &[Matcher]) -> Vec<Labels> {
        self.merged(|index| index.series(matchers))
    }

    /// `(min, max)` profile time in milliseconds.
    pub fn bounds(&self) -> Option<(i64, i64)> {
        self.generations()
            .iter()
            .filter_map(|s| s.index.bounds())
            .reduce(|(a_min, a_max), (b_min, b_max)| (a_min.min(b_min), a_max.max(b_max)))
            .map(|(min, max)| {
                (
                    min.div_euclid(NANOS_PER_MILLI),
                    max.div_euclid(NANOS_PER_MILLI),
                )
            })
    }

    pub fn num_profiles(&self) -> u64 {
        self.generations()
            .iter()
            .map(|s| s.index.num_profiles())
            .sum()
    }

    pub fn num_series(&self) -> usize {
        self.series(&[]).len()
    }

    // Symbol lookups resolve against the current generation only; row ids
    // are not shared between generations.

    /// String row `id`.
    pub fn string(&self, id: u64) -> Result<Option<String>> {
        self.current().strings.get(id)
    }

    /// Mapping with the global reference `id`.
    pub fn mapping(&self, id: u64) -> Result<Option<Mapping>> {
        pprof_row(&self.current().mappings, id)
    }

    /// Function with the global reference `id`.
    pub fn function(&self, id: u64) -> Result<Option<Function>> {
        pprof_row(&self.current().functions, id)
    }

    /// Location with the global reference `id`.
    pub fn location(&self, id: u64) -> Result<Option<Location>> {
        pprof_row(&self.current().locations, id)
    }

    /// Stack trace row `id`, as referenced by [`Sample::stacktrace_id`].
    pub fn stacktrace(&self, id: u64) -> Result<Option<Stacktrace>> {
        self.current().stacktraces.get(id)
    }

    pub fn num_rows(&self, kind: SymbolKind) -> u64 {
        let stores = self.current();
        match kind {
            SymbolKind::String => stores.strings.num_rows(),
            SymbolKind::Mapping => stores.mappings.num_rows(),
            SymbolKind::Function => stores.functions.num_rows(),
            SymbolKind::Location => stores.locations.num_rows(),
            SymbolKind::Stacktrace => stores.stacktraces.num_rows(),
            SymbolKind::Profile => stores.profiles.num_rows(),
        }
    }
}

fn pprof_row<T: Persist>(store: &ColumnStore<T>, id: u64) -> Result<Option<T>> {
    match offset_of_pprof_id(id) {
        Some(row) => store.get(row),
        None => Ok(None),
    }
}
