// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The profile index: label set -> series fingerprint -> profiles.

mod selector;

pub use selector::*;

use crate::collections::FxIndexMap;
use crate::error::Result;
use crate::model::{Fingerprint, Labels, Profile, ProfileType, LABEL_NAME_PROFILE_TYPE};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

pub const INDEX_FILE_NAME: &str = "index.bin";

/// One series, sorted by time, as selected from the index.
#[derive(Clone, Debug)]
pub struct SeriesProfiles {
    pub labels: Arc<Labels>,
    pub fingerprint: Fingerprint,
    pub profiles: Vec<Arc<Profile>>,
}

/// A persisted series entry of `index.bin`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesEntry {
    pub labels: Labels,
    pub fingerprint: Fingerprint,
    pub series_index: u32,
    /// Row ids of the series' profiles in `profiles.bin`, as half-open
    /// ranges.
    pub rows: Vec<(u64, u64)>,
}

#[derive(Debug)]
struct Series {
    labels: Arc<Labels>,
    index: u32,
    /// Sorted by time, then by insertion.
    profiles: Vec<(Arc<Profile>, u64)>,
}

#[derive(Debug, Default)]
struct Inner {
    series: FxIndexMap<Fingerprint, Series>,
    postings: BTreeMap<String, BTreeMap<String, Vec<Fingerprint>>>,
    num_profiles: u64,
    min_time: i64,
    max_time: i64,
}

#[derive(Debug, Default)]
pub struct ProfileIndex {
    inner: RwLock<Inner>,
}

impl ProfileIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `profile`, stored at `row_id`, under its series. The series
    /// gets the next series index the first time its fingerprint is seen.
    pub fn add(&self, profile: Arc<Profile>, labels: &Labels, row_id: u64) {
        let fingerprint = profile.series_fingerprint;
        let time = profile.time_nanos;
        let mut inner = self.inner.write();
        let inner = &mut *inner;

        if inner.num_profiles == 0 {
            inner.min_time = time;
            inner.max_time = time;
        } else {
            inner.min_time = inner.min_time.min(time);
            inner.max_time = inner.max_time.max(time);
        }
        inner.num_profiles += 1;

        let next_index = inner.series.len() as u32;
        let series = inner.series.entry(fingerprint).or_insert_with(|| {
            for pair in labels.iter() {
                inner
                    .postings
                    .entry(pair.name.clone())
                    .or_default()
                    .entry(pair.value.clone())
                    .or_default()
                    .push(fingerprint);
            }
            Series {
                labels: Arc::new(labels.clone()),
                index: next_index,
                profiles: Vec::new(),
            }
        });
        let at = series
            .profiles
            .partition_point(|(p, _)| p.time_nanos <= time);
        series.profiles.insert(at, (profile, row_id));
    }

    fn candidates(inner: &Inner, matchers: &[Matcher]) -> Vec<Fingerprint> {
        let narrowed = matchers
            .iter()
            .filter(|m| m.kind == MatchType::Equal && !m.value.is_empty())
            .map(|m| {
                inner
                    .postings
                    .get(&m.name)
                    .and_then(|values| values.get(&m.value))
                    .map(Vec::as_slice)
                    .unwrap_or_default()
            })
            .min_by_key(|list| list.len());
        match narrowed {
            Some(list) => list.to_vec(),
            None => inner.series.keys().copied().collect(),
        }
    }

    /// Series matching every matcher, in series index order.
    pub fn select(&self, matchers: &[Matcher]) -> Vec<SeriesProfiles> {
        let inner = self.inner.read();
        let mut out: Vec<(u32, SeriesProfiles)> = Self::candidates(&inner, matchers)
            .into_iter()
            .filter_map(|fp| inner.series.get(&fp).map(|s| (fp, s)))
            .filter(|(_, s)| matches_all(matchers, &s.labels))
            .map(|(fp, s)| {
                let selected = SeriesProfiles {
                    labels: Arc::clone(&s.labels),
                    fingerprint: fp,
                    profiles: s.profiles.iter().map(|(p, _)| Arc::clone(p)).collect(),
                };
                (s.index, selected)
            })
            .collect();
        out.sort_by_key(|(index, _)| *index);
        out.into_iter().map(|(_, s)| s).collect()
    }

    /// Label sets of the series matching every matcher.
    pub fn series(&self, matchers: &[Matcher]) -> Vec<Labels> {
        self.select(matchers)
            .into_iter()
            .map(|s| Labels::clone(&s.labels))
            .collect()
    }

    pub fn label_names(&self) -> Vec<String> {
        self.inner.read().postings.keys().cloned().collect()
    }

    pub fn label_values(&self, name: &str) -> Vec<String> {
        self.inner
            .read()
            .postings
            .get(name)
            .map(|values| values.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn profile_types(&self) -> Vec<ProfileType> {
        self.label_values(LABEL_NAME_PROFILE_TYPE)
            .iter()
            .filter_map(|id| ProfileType::parse(id).ok())
            .collect()
    }

    /// `(min, max)` profile time in nanoseconds, if any profile was added.
    pub fn bounds(&self) -> Option<(i64, i64)> {
        let inner = self.inner.read();
        (inner.num_profiles > 0).then_some((inner.min_time, inner.max_time))
    }

    pub fn num_series(&self) -> usize {
        self.inner.read().series.len()
    }

    pub fn num_profiles(&self) -> u64 {
        self.inner.read().num_profiles
    }

    pub fn entries(&self) -> Vec<SeriesEntry> {
        let inner = self.inner.read();
        inner
            .series
            .iter()
            .map(|(fp, s)| {
                let mut rows: Vec<u64> = s.profiles.iter().map(|(_, row)| *row).collect();
                rows.sort_unstable();
                SeriesEntry {
                    labels: Labels::clone(&s.labels),
                    fingerprint: *fp,
                    series_index: s.index,
                    rows: row_ranges(&rows),
                }
            })
            .collect()
    }

    /// Writes `index.bin` into `dir`.
    pub fn write_to(&self, dir: &Path) -> Result<u64> {
        let bytes = rmp_serde::to_vec(&self.entries())?;
        fs::write(dir.join(INDEX_FILE_NAME), &bytes)?;
        Ok(bytes.len() as u64)
    }
}

pub fn read_index(dir: &Path) -> Result<Vec<SeriesEntry>> {
    let bytes = fs::read(dir.join(INDEX_FILE_NAME))?;
    Ok(rmp_serde::from_slice(&bytes)?)
}

/// Folds sorted ids into half-open ranges of consecutive ids.
fn row_ranges(rows: &[u64]) -> Vec<(u64, u64)> {
    let mut ranges: Vec<(u64, u64)> = Vec::new();
    for &row in rows {
        match ranges.last_mut() {
            Some((_, end)) if *end == row => *end += 1,
            _ => ranges.push((row, row + 1)),
        }
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LabelPair;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        Labels::new(pairs.iter().map(|(k, v)| LabelPair::new(*k, *v)).collect())
    }

    fn profile(labels: &Labels, time_nanos: i64) -> Arc<Profile> {
        Arc::new(Profile {
            series_fingerprint: labels.fingerprint(),
            time_nanos,
            ..Default::default()
        })
    }

    #[test]
    fn series_index_is_stable() {
        let index = ProfileIndex::new();
        let a = labels(&[("job", "a")]);
        let b = labels(&[("job", "b")]);
        index.add(profile(&a, 20), &a, 0);
        index.add(profile(&b, 10), &b, 1);
        index.add(profile(&a, 5), &a, 2);

        let selected = index.select(&[]);
        assert_eq!(selected.len(), 2);
        assert_eq!(*selected[0].labels, a);
        let times: Vec<_> = selected[0].profiles.iter().map(|p| p.time_nanos).collect();
        assert_eq!(times, [5, 20]);
        assert_eq!(index.bounds(), Some((5, 20)));
        assert_eq!(index.num_profiles(), 3);

        let entries = index.entries();
        assert_eq!(entries[0].series_index, 0);
        assert_eq!(entries[0].rows, [(0, 1), (2, 3)]);
        assert_eq!(entries[1].series_index, 1);
    }

    #[test]
    fn label_enumeration() {
        let index = ProfileIndex::new();
        assert!(index.bounds().is_none());
        for (job, pt) in [
            ("a", "process_cpu:cpu:nanoseconds:cpu:nanoseconds"),
            ("b", "memory:alloc_space:bytes:space:bytes"),
            ("b", "bogus"),
        ] {
            let l = labels(&[("job", job), (LABEL_NAME_PROFILE_TYPE, pt)]);
            index.add(profile(&l, 1), &l, 0);
        }
        assert_eq!(index.label_names(), [LABEL_NAME_PROFILE_TYPE, "job"]);
        assert_eq!(index.label_values("job"), ["a", "b"]);
        assert!(index.label_values("nope").is_empty());
        let types: Vec<String> = index.profile_types().iter().map(|t| t.id()).collect();
        assert_eq!(
            types,
            [
                "memory:alloc_space:bytes:space:bytes",
                "process_cpu:cpu:nanoseconds:cpu:nanoseconds"
            ]
        );
    }

    #[test]
    fn select_with_matchers() {
        let index = ProfileIndex::new();
        for (job, env) in [("api", "prod"), ("api", "dev"), ("db", "prod")] {
            let l = labels(&[("job", job), ("env", env)]);
            index.add(profile(&l, 1), &l, 0);
        }
        let got = index.series(&parse_selector(r#"{job="api"}"#).unwrap());
        assert_eq!(got.len(), 2);
        let got = index.series(&parse_selector(r#"{job="api", env!="dev"}"#).unwrap());
        assert_eq!(got, [labels(&[("job", "api"), ("env", "prod")])]);
        let got = index.series(&parse_selector(r#"{env=~"pr.*", job!~"api"}"#).unwrap());
        assert_eq!(got, [labels(&[("job", "db"), ("env", "prod")])]);
        assert!(index
            .series(&parse_selector(r#"{job="none"}"#).unwrap())
            .is_empty());
    }

    #[test]
    fn index_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let index = ProfileIndex::new();
        let l = labels(&[("job", "a")]);
        index.add(profile(&l, 1), &l, 0);
        index.add(profile(&l, 2), &l, 1);
        index.write_to(dir.path()).unwrap();
        let entries = read_index(dir.path()).unwrap();
        assert_eq!(entries, index.entries());
        assert_eq!(entries[0].rows, [(0, 2)]);
    }

    #[test]
    fn ranges_fold_consecutive_rows() {
        assert!(row_ranges(&[]).is_empty());
        assert_eq!(row_ranges(&[1, 2, 3, 7, 9, 10]), [(1, 4), (7, 8), (9, 11)]);
    }
}
