// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::collections::non_zero_pprof_id;
use crate::error::Result;
use crate::model::*;
use crate::rewriter::Rewriter;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::hash::Hash;
use std::mem::size_of;

/// Per-row-type behavior of a [`ColumnStore`](super::ColumnStore).
///
/// Implemented once for each of the six tables.
pub trait Persist: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// File name stem of the table.
    const NAME: &'static str;
    const KIND: SymbolKind;
    /// Rows that never deduplicate are appended unconditionally.
    const DEDUPLICATE: bool = true;

    type Key: Eq + Hash + Send + Sync + 'static;
    type SortKey: Ord;

    /// The value-equality key used for deduplication.
    fn key(&self) -> Self::Key;

    /// The id the payload uses to reference this row, before rewriting.
    fn local_id(&self, position: usize) -> u64 {
        position as u64
    }

    /// Translates local references to global ones.
    fn rewrite(&mut self, _rewriter: &Rewriter) -> Result<()> {
        Ok(())
    }

    /// The reference other rows use for the row stored at `row_id`.
    fn reference(row_id: u64) -> u64 {
        row_id
    }

    /// Called once a new row is assigned `row_id`.
    fn set_id(&mut self, _row_id: u64) {}

    /// Estimated in-memory size, used for the row group byte threshold.
    fn size(&self) -> u64;

    fn sort_key(&self, row_id: u64) -> Self::SortKey;
}

fn pprof_reference(row_id: u64) -> u64 {
    // Row ids never reach u64::MAX.
    non_zero_pprof_id(row_id).unwrap_or(u64::MAX)
}

impl Persist for String {
    const NAME: &'static str = "strings";
    const KIND: SymbolKind = SymbolKind::String;

    type Key = String;
    type SortKey = u64;

    fn key(&self) -> String {
        self.clone()
    }

    fn size(&self) -> u64 {
        (self.len() + size_of::<String>()) as u64
    }

    fn sort_key(&self, row_id: u64) -> u64 {
        row_id
    }
}

impl Persist for Mapping {
    const NAME: &'static str = "mappings";
    const KIND: SymbolKind = SymbolKind::Mapping;

    type Key = MappingKey;
    type SortKey = u64;

    fn key(&self) -> MappingKey {
        Mapping::key(self)
    }

    fn local_id(&self, _position: usize) -> u64 {
        self.id
    }

    fn rewrite(&mut self, r: &Rewriter) -> Result<()> {
        self.filename = r.rewrite(SymbolKind::String, self.filename)?;
        self.build_id = r.rewrite(SymbolKind::String, self.build_id)?;
        Ok(())
    }

    fn reference(row_id: u64) -> u64 {
        pprof_reference(row_id)
    }

    fn set_id(&mut self, row_id: u64) {
        self.id = pprof_reference(row_id);
    }

    fn size(&self) -> u64 {
        size_of::<Self>() as u64
    }

    fn sort_key(&self, row_id: u64) -> u64 {
        row_id
    }
}

impl Persist for Function {
    const NAME: &'static str = "functions";
    const KIND: SymbolKind = SymbolKind::Function;

    type Key = FunctionKey;
    type SortKey = u64;

    fn key(&self) -> FunctionKey {
        Function::key(self)
    }

    fn local_id(&self, _position: usize) -> u64 {
        self.id
    }

    fn rewrite(&mut self, r: &Rewriter) -> Result<()> {
        self.name = r.rewrite(SymbolKind::String, self.name)?;
        self.system_name = r.rewrite(SymbolKind::String, self.system_name)?;
        self.filename = r.rewrite(SymbolKind::String, self.filename)?;
        Ok(())
    }

    fn reference(row_id: u64) -> u64 {
        pprof_reference(row_id)
    }

    fn set_id(&mut self, row_id: u64) {
        self.id = pprof_reference(row_id);
    }

    fn size(&self) -> u64 {
        size_of::<Self>() as u64
    }

    fn sort_key(&self, row_id: u64) -> u64 {
        row_id
    }
}

impl Persist for Location {
    const NAME: &'static str = "locations";
    const KIND: SymbolKind = SymbolKind::Location;

    type Key = LocationKey;
    type SortKey = u64;

    fn key(&self) -> LocationKey {
        Location::key(self)
    }

    fn local_id(&self, _position: usize) -> u64 {
        self.id
    }

    fn rewrite(&mut self, r: &Rewriter) -> Result<()> {
        self.mapping_id = r.rewrite_optional(SymbolKind::Mapping, self.mapping_id)?;
        for line in &mut self.lines {
            line.function_id = r.rewrite_optional(SymbolKind::Function, line.function_id)?;
        }
        Ok(())
    }

    fn reference(row_id: u64) -> u64 {
        pprof_reference(row_id)
    }

    fn set_id(&mut self, row_id: u64) {
        self.id = pprof_reference(row_id);
    }

    fn size(&self) -> u64 {
        (size_of::<Self>() + self.lines.len() * size_of::<Line>()) as u64
    }

    fn sort_key(&self, row_id: u64) -> u64 {
        row_id
    }
}

impl Persist for Stacktrace {
    const NAME: &'static str = "stacktraces";
    const KIND: SymbolKind = SymbolKind::Stacktrace;

    type Key = Vec<u64>;
    type SortKey = u64;

    fn key(&self) -> Vec<u64> {
        self.location_ids.clone()
    }

    fn rewrite(&mut self, r: &Rewriter) -> Result<()> {
        for id in &mut self.location_ids {
            *id = r.rewrite(SymbolKind::Location, *id)?;
        }
        Ok(())
    }

    fn size(&self) -> u64 {
        (size_of::<Self>() + self.location_ids.len() * size_of::<u64>()) as u64
    }

    fn sort_key(&self, row_id: u64) -> u64 {
        row_id
    }
}

impl Persist for Profile {
    const NAME: &'static str = "profiles";
    const KIND: SymbolKind = SymbolKind::Profile;
    const DEDUPLICATE: bool = false;

    type Key = ();
    /// Series first, then time, so a series reads sequentially.
    type SortKey = (Fingerprint, i64, u64);

    fn key(&self) {}

    fn rewrite(&mut self, r: &Rewriter) -> Result<()> {
        for sample in &mut self.samples {
            sample.stacktrace_id = r.rewrite(SymbolKind::Stacktrace, sample.stacktrace_id)?;
            for label in &mut sample.labels {
                label.key = r.rewrite(SymbolKind::String, label.key)?;
                label.str = r.rewrite(SymbolKind::String, label.str)?;
                label.num_unit = r.rewrite(SymbolKind::String, label.num_unit)?;
            }
        }
        for comment in &mut self.comments {
            *comment = r.rewrite(SymbolKind::String, *comment)?;
        }
        self.drop_frames = r.rewrite(SymbolKind::String, self.drop_frames)?;
        self.keep_frames = r.rewrite(SymbolKind::String, self.keep_frames)?;
        self.default_sample_type = r.rewrite(SymbolKind::String, self.default_sample_type)?;
        Ok(())
    }

    fn size(&self) -> u64 {
        let samples: usize = self
            .samples
            .iter()
            .map(|s| size_of::<Sample>() + s.labels.len() * size_of::<SampleLabel>())
            .sum();
        (size_of::<Self>() + samples + self.comments.len() * size_of::<u64>()) as u64
    }

    fn sort_key(&self, row_id: u64) -> Self::SortKey {
        (self.series_fingerprint, self.time_nanos, row_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locations_keep_unset_references() {
        let mut r = Rewriter::new();
        r.insert(SymbolKind::Function, 4, 1);
        let mut loc = Location {
            id: 9,
            mapping_id: 0,
            lines: vec![
                Line {
                    function_id: 4,
                    line: 10,
                },
                Line {
                    function_id: 0,
                    line: 0,
                },
            ],
            ..Default::default()
        };
        assert_eq!(Persist::local_id(&loc, 3), 9);
        loc.rewrite(&r).unwrap();
        assert_eq!(loc.mapping_id, 0);
        assert_eq!(loc.lines[0].function_id, 1);
        assert_eq!(loc.lines[1].function_id, 0);

        loc.set_id(0);
        assert_eq!(loc.id, 1);
        assert_eq!(<Location as Persist>::reference(0), 1);
    }

    #[test]
    fn profiles_sort_by_series_then_time() {
        let a = Profile {
            series_fingerprint: Fingerprint(1),
            time_nanos: 20,
            ..Default::default()
        };
        let b = Profile {
            series_fingerprint: Fingerprint(2),
            time_nanos: 10,
            ..Default::default()
        };
        assert!(a.sort_key(5) < b.sort_key(0));
        assert!(!Profile::DEDUPLICATE);
    }
}
