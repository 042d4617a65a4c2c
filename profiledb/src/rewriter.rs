// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::collections::FxHashMap;
use crate::error::{Error, Result};
use crate::model::SymbolKind;

const ABSENT: u64 = u64::MAX;

/// Translates the local references of one ingested payload into row
/// references of the shared stores.
///
/// Tables are filled in ingestion order: strings, mappings, functions,
/// locations, stack traces. A table must be complete before any row that
/// references its kind is rewritten.
#[derive(Debug, Default)]
pub struct Rewriter {
    /// Indexed by string table position.
    strings: Vec<u64>,
    /// Keyed by the pprof ids of the payload.
    mappings: FxHashMap<u64, u64>,
    functions: FxHashMap<u64, u64>,
    locations: FxHashMap<u64, u64>,
    /// Indexed by position in the stack trace batch.
    stacktraces: Vec<u64>,
}

impl Rewriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `local` of `kind` is stored as `global`. Profiles are
    /// never referenced, so they are not recorded.
    pub fn insert(&mut self, kind: SymbolKind, local: u64, global: u64) {
        match kind {
            SymbolKind::String => insert_dense(&mut self.strings, local, global),
            SymbolKind::Mapping => {
                self.mappings.insert(local, global);
            }
            SymbolKind::Function => {
                self.functions.insert(local, global);
            }
            SymbolKind::Location => {
                self.locations.insert(local, global);
            }
            SymbolKind::Stacktrace => insert_dense(&mut self.stacktraces, local, global),
            SymbolKind::Profile => {}
        }
    }

    /// Returns the global reference of `local`.
    ///
    /// A missing entry means the tables were populated out of order, and is
    /// reported as [`Error::UnknownReference`].
    pub fn rewrite(&self, kind: SymbolKind, local: u64) -> Result<u64> {
        let found = match kind {
            SymbolKind::String => get_dense(&self.strings, local),
            SymbolKind::Mapping => self.mappings.get(&local).copied(),
            SymbolKind::Function => self.functions.get(&local).copied(),
            SymbolKind::Location => self.locations.get(&local).copied(),
            SymbolKind::Stacktrace => get_dense(&self.stacktraces, local),
            SymbolKind::Profile => None,
        };
        found.ok_or(Error::UnknownReference { kind, id: local })
    }

    /// Like [`Rewriter::rewrite`], but zero stays zero. pprof uses zero for
    /// "no mapping" and "no function".
    pub fn rewrite_optional(&self, kind: SymbolKind, local: u64) -> Result<u64> {
        if local == 0 {
            return Ok(0);
        }
        self.rewrite(kind, local)
    }

    pub fn len(&self, kind: SymbolKind) -> usize {
        match kind {
            SymbolKind::String => self.strings.iter().filter(|&&g| g != ABSENT).count(),
            SymbolKind::Mapping => self.mappings.len(),
            SymbolKind::Function => self.functions.len(),
            SymbolKind::Location => self.locations.len(),
            SymbolKind::Stacktrace => self.stacktraces.iter().filter(|&&g| g != ABSENT).count(),
            SymbolKind::Profile => 0,
        }
    }
}

fn insert_dense(table: &mut Vec<u64>, local: u64, global: u64) {
    let Ok(local) = usize::try_from(local) else {
        return;
    };
    if local >= table.len() {
        table.resize(local + 1, ABSENT);
    }
    table[local] = global;
}

fn get_dense(table: &[u64], local: u64) -> Option<u64> {
    let local = usize::try_from(local).ok()?;
    table.get(local).copied().filter(|&g| g != ABSENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrite_known_references() {
        let mut r = Rewriter::new();
        r.insert(SymbolKind::String, 0, 10);
        r.insert(SymbolKind::String, 2, 12);
        r.insert(SymbolKind::Mapping, 7, 1);
        r.insert(SymbolKind::Profile, 0, 5);

        assert_eq!(r.rewrite(SymbolKind::String, 0).unwrap(), 10);
        assert_eq!(r.rewrite(SymbolKind::String, 2).unwrap(), 12);
        assert_eq!(r.rewrite(SymbolKind::Mapping, 7).unwrap(), 1);
        assert_eq!(r.len(SymbolKind::String), 2);
        assert_eq!(r.len(SymbolKind::Profile), 0);
    }

    #[test]
    fn unknown_reference_is_loud() {
        let mut r = Rewriter::new();
        r.insert(SymbolKind::String, 2, 12);
        let err = r.rewrite(SymbolKind::String, 1).unwrap_err();
        assert!(matches!(
            err,
            Error::UnknownReference {
                kind: SymbolKind::String,
                id: 1
            }
        ));
        // Locations rewritten before mappings were ingested.
        assert!(r.rewrite(SymbolKind::Mapping, 3).is_err());
        assert!(r.rewrite(SymbolKind::Profile, 0).is_err());
    }

    #[test]
    fn zero_means_unset() {
        let r = Rewriter::new();
        assert_eq!(r.rewrite_optional(SymbolKind::Mapping, 0).unwrap(), 0);
        assert!(r.rewrite_optional(SymbolKind::Function, 1).is_err());
    }
}
