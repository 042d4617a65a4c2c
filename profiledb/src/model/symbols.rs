// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::{Error, Result};
use crate::pprof;
use serde::{Deserialize, Serialize};

/// Converts a pprof string table index into a local string reference.
pub fn string_ref(index: i64) -> Result<u64> {
    u64::try_from(index).map_err(|_| Error::invalid_profile("negative string table index"))
}

/// A binary mapped into the profiled process.
///
/// `id` holds the local pprof id until the row is stored, and the global,
/// non-zero reference afterwards. String fields reference the strings table.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Mapping {
    pub id: u64,
    pub memory_start: u64,
    pub memory_limit: u64,
    pub file_offset: u64,
    pub filename: u64,
    pub build_id: u64,
    pub has_functions: bool,
    pub has_filenames: bool,
    pub has_line_numbers: bool,
    pub has_inline_frames: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct MappingKey {
    pub memory_start: u64,
    pub memory_limit: u64,
    pub file_offset: u64,
    pub filename: u64,
    pub build_id: u64,
    pub flags: u8,
}

impl Mapping {
    pub fn key(&self) -> MappingKey {
        let flags = u8::from(self.has_functions)
            | u8::from(self.has_filenames) << 1
            | u8::from(self.has_line_numbers) << 2
            | u8::from(self.has_inline_frames) << 3;
        MappingKey {
            memory_start: self.memory_start,
            memory_limit: self.memory_limit,
            file_offset: self.file_offset,
            filename: self.filename,
            build_id: self.build_id,
            flags,
        }
    }
}

impl TryFrom<&pprof::Mapping> for Mapping {
    type Error = Error;

    fn try_from(m: &pprof::Mapping) -> Result<Self> {
        Ok(Self {
            id: m.id,
            memory_start: m.memory_start,
            memory_limit: m.memory_limit,
            file_offset: m.file_offset,
            filename: string_ref(m.filename)?,
            build_id: string_ref(m.build_id)?,
            has_functions: m.has_functions,
            has_filenames: m.has_filenames,
            has_line_numbers: m.has_line_numbers,
            has_inline_frames: m.has_inline_frames,
        })
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Function {
    pub id: u64,
    pub name: u64,
    pub system_name: u64,
    pub filename: u64,
    pub start_line: i64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct FunctionKey {
    pub name: u64,
    pub system_name: u64,
    pub filename: u64,
    pub start_line: i64,
}

impl Function {
    pub fn key(&self) -> FunctionKey {
        FunctionKey {
            name: self.name,
            system_name: self.system_name,
            filename: self.filename,
            start_line: self.start_line,
        }
    }
}

impl TryFrom<&pprof::Function> for Function {
    type Error = Error;

    fn try_from(f: &pprof::Function) -> Result<Self> {
        Ok(Self {
            id: f.id,
            name: string_ref(f.name)?,
            system_name: string_ref(f.system_name)?,
            filename: string_ref(f.filename)?,
            start_line: f.start_line,
        })
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Line {
    pub function_id: u64,
    pub line: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub id: u64,
    /// Zero when the location has no mapping.
    pub mapping_id: u64,
    pub address: u64,
    pub is_folded: bool,
    pub lines: Vec<Line>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LocationKey {
    pub mapping_id: u64,
    pub address: u64,
    pub is_folded: bool,
    pub lines: Vec<Line>,
}

impl Location {
    pub fn key(&self) -> LocationKey {
        LocationKey {
            mapping_id: self.mapping_id,
            address: self.address,
            is_folded: self.is_folded,
            lines: self.lines.clone(),
        }
    }
}

impl From<&pprof::Location> for Location {
    fn from(l: &pprof::Location) -> Self {
        Self {
            id: l.id,
            mapping_id: l.mapping_id,
            address: l.address,
            is_folded: l.is_folded,
            lines: l
                .lines
                .iter()
                .map(|line| Line {
                    function_id: line.function_id,
                    line: line.line,
                })
                .collect(),
        }
    }
}

/// Location ids of a stack trace, leaf first.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stacktrace {
    pub location_ids: Vec<u64>,
}

impl Stacktrace {
    pub fn new(location_ids: Vec<u64>) -> Self {
        Self { location_ids }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_ignore_ids() {
        let a = Mapping {
            id: 1,
            memory_start: 0x1000,
            has_functions: true,
            ..Default::default()
        };
        let b = Mapping { id: 7, ..a };
        assert_eq!(a.key(), b.key());
        let c = Mapping {
            has_inline_frames: true,
            ..a
        };
        assert_ne!(a.key(), c.key());

        let f = Function {
            id: 3,
            name: 1,
            ..Default::default()
        };
        assert_eq!(f.key(), Function { id: 9, ..f }.key());
    }

    #[test]
    fn negative_string_index_is_rejected() {
        let m = pprof::Mapping {
            filename: -1,
            ..Default::default()
        };
        assert!(matches!(
            Mapping::try_from(&m),
            Err(Error::InvalidProfile(_))
        ));
    }
}
