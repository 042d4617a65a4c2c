// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The stack trace symbol database.
//!
//! Stack traces are grouped by the mapping (binary) they belong to. Each
//! mapping keeps a prefix tree of location ids, split into chunks of a
//! bounded node count; a stack trace id is the index of its leaf node,
//! numbered continuously across the chunks of the mapping.

pub mod format;
mod mapping;
mod reader;
mod tree;
mod writer;

pub use mapping::{
    MappingReader, MappingWriter, MemoryResolver, StacktraceAppender, StacktraceInserter,
    StacktraceResolver,
};
pub use reader::{FileMappingReader, FileResolver, Reader};
pub use tree::{ParentPointerTree, StacktraceTree};
pub use writer::Writer;

use crate::collections::FxIndexMap;
use crate::config::SymDbConfig;
use crate::error::Result;
use mapping::InMemoryMapping;
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

pub const DEFAULT_FILE_NAME: &str = "symbols.symdb";

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SymDbStats {
    pub mappings: usize,
    pub chunks: usize,
    pub nodes: u64,
    pub stacktraces: u64,
}

#[derive(Debug)]
pub struct SymDb {
    config: SymDbConfig,
    mappings: RwLock<FxIndexMap<u64, Arc<InMemoryMapping>>>,
}

impl SymDb {
    pub fn new(config: SymDbConfig) -> Self {
        Self {
            config,
            mappings: RwLock::new(FxIndexMap::default()),
        }
    }

    /// Returns the writer of `mapping`, creating the mapping on first use.
    pub fn mapping_writer(&self, mapping: u64) -> MappingWriter {
        if let Some(m) = self.mappings.read().get(&mapping) {
            return MappingWriter {
                mapping: Arc::clone(m),
            };
        }
        let max_nodes = self.config.max_nodes_per_chunk;
        let m = self
            .mappings
            .write()
            .entry(mapping)
            .or_insert_with(|| Arc::new(InMemoryMapping::new(mapping, max_nodes)))
            .clone();
        MappingWriter { mapping: m }
    }

    pub fn mapping_reader(&self, mapping: u64) -> Option<MappingReader> {
        let m = self.mappings.read().get(&mapping).cloned()?;
        Some(MappingReader { mapping: m })
    }

    /// Known mappings, ascending.
    pub fn mapping_names(&self) -> Vec<u64> {
        let mut names: Vec<u64> = self.mappings.read().keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn stats(&self) -> SymDbStats {
        let mappings = self.mappings.read();
        let mut stats = SymDbStats {
            mappings: mappings.len(),
            ..Default::default()
        };
        for m in mappings.values() {
            m.with_chunks(|chunks| {
                stats.chunks += chunks.len();
                for c in chunks {
                    stats.nodes += u64::from(c.tree.len());
                    stats.stacktraces += u64::from(c.stacktraces);
                }
            });
        }
        stats
    }

    /// Writes every chunk of every mapping to `<dir>/symbols.symdb`.
    pub fn flush(&self) -> Result<PathBuf> {
        let mut writer = Writer::new(&self.config.dir)?;
        for name in self.mapping_names() {
            if let Some(reader) = self.mapping_reader(name) {
                writer.write_mapping(&reader)?;
            }
        }
        let chunks = writer.num_chunks();
        let path = writer.write_file()?;
        info!(path = %path.display(), chunks, "Flushed symbol database");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn mappings_are_independent() {
        let db = SymDb::new(SymDbConfig::default());
        let mut sids = [0u32; 1];
        let w = db.mapping_writer(7);
        w.stacktrace_appender()
            .append_stacktraces(&mut sids, &[&[1, 2]])
            .unwrap();
        assert_eq!(sids, [2]);
        // Another mapping starts its own tree.
        db.mapping_writer(3)
            .stacktrace_appender()
            .append_stacktraces(&mut sids, &[&[9]])
            .unwrap();
        assert_eq!(sids, [1]);

        assert_eq!(db.mapping_names(), [3, 7]);
        assert!(db.mapping_reader(1).is_none());
        assert_eq!(
            db.stats(),
            SymDbStats {
                mappings: 2,
                chunks: 2,
                nodes: 5,
                stacktraces: 2,
            }
        );
    }

    #[test]
    fn concurrent_appenders_agree() {
        let db = Arc::new(SymDb::new(SymDbConfig {
            max_nodes_per_chunk: 4,
            ..Default::default()
        }));
        let stacks: Vec<Vec<u64>> = (0..64u64).map(|i| vec![i % 16, i % 4, 1]).collect();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let db = Arc::clone(&db);
                let stacks = stacks.clone();
                thread::spawn(move || {
                    let refs: Vec<&[u64]> = stacks.iter().map(Vec::as_slice).collect();
                    let mut sids = vec![0u32; refs.len()];
                    let mut a = db.mapping_writer(0).stacktrace_appender();
                    a.append_stacktraces(&mut sids, &refs).unwrap();
                    a.release();
                    sids
                })
            })
            .collect();
        let results: Vec<Vec<u32>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(results.windows(2).all(|w| w[0] == w[1]));

        let mut ids: Vec<u32> = results[0].clone();
        ids.sort_unstable();
        ids.dedup();
        let mut resolved = Vec::new();
        db.mapping_reader(0)
            .unwrap()
            .stacktrace_resolver()
            .resolve_stacktraces(&mut |_: u32, l: &[u64]| resolved.push(l.to_vec()), &ids)
            .unwrap();
        let mut expected: Vec<Vec<u64>> = stacks.clone();
        expected.sort_unstable_by_key(|s| {
            let i = stacks.iter().position(|x| x == s).unwrap_or_default();
            results[0][i]
        });
        expected.dedup();
        assert_eq!(resolved, expected);
    }
}
