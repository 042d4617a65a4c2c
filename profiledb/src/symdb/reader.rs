// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::format::*;
use super::mapping::{check_ascending, StacktraceInserter, StacktraceResolver};
use super::tree::ParentPointerTree;
use crate::collections::FxIndexMap;
use crate::error::{Error, Result};
use std::fs;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

fn section(entry: &TocEntry, len: usize) -> Result<Range<usize>> {
    let start = usize::try_from(entry.offset).map_err(|_| Error::InvalidSize)?;
    let end = entry
        .end()
        .and_then(|end| usize::try_from(end).ok())
        .ok_or(Error::InvalidSize)?;
    if end > len {
        return Err(Error::InvalidSize);
    }
    Ok(start..end)
}

/// A validated `symbols.symdb` held in memory.
#[derive(Debug)]
pub struct Reader {
    data: Arc<[u8]>,
    header: Header,
    toc: Toc,
    chunks: Vec<ChunkHeader>,
    /// Chunk indices per mapping, ordered by `stid`.
    mappings: FxIndexMap<u64, Vec<usize>>,
}

impl Reader {
    /// Validates the header, the TOC and every chunk header. Chunk payloads
    /// are checked when first decoded, or all at once by
    /// [`Reader::verify`].
    pub fn open(bytes: Vec<u8>) -> Result<Self> {
        let header = Header::unmarshal(bytes.get(..HEADER_SIZE).ok_or(Error::InvalidSize)?)?;
        let toc = Toc::unmarshal(
            bytes
                .get(HEADER_SIZE..HEADER_SIZE + TOC_SIZE)
                .ok_or(Error::InvalidSize)?,
        )?;

        let headers = section(&toc.entries[TOC_STACKTRACE_CHUNK_HEADERS], bytes.len())?;
        let data = section(&toc.entries[TOC_STACKTRACE_CHUNK_DATA], bytes.len())?;
        let chunks = unmarshal_chunk_headers(&bytes[headers])?;

        let mut mappings: FxIndexMap<u64, Vec<usize>> = FxIndexMap::default();
        for (i, chunk) in chunks.iter().enumerate() {
            let end = chunk.end().ok_or(Error::InvalidSize)?;
            if chunk.offset < data.start as u64 || end > data.end as u64 {
                return Err(Error::InvalidSize);
            }
            mappings.entry(chunk.mapping).or_default().push(i);
        }
        for indices in mappings.values_mut() {
            indices.sort_by_key(|&i| chunks[i].stid);
        }

        Ok(Self {
            data: Arc::from(bytes),
            header,
            toc,
            chunks,
            mappings,
        })
    }

    pub fn open_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(fs::read(path)?)
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn toc(&self) -> &Toc {
        &self.toc
    }

    pub fn chunk_headers(&self) -> &[ChunkHeader] {
        &self.chunks
    }

    pub fn mappings(&self) -> impl Iterator<Item = u64> + '_ {
        self.mappings.keys().copied()
    }

    /// Checks the CRC of every chunk payload.
    pub fn verify(&self) -> Result<()> {
        self.chunks
            .iter()
            .try_for_each(|h| payload(&self.data, h).map(|_| ()))
    }

    pub fn mapping_reader(&self, mapping: u64) -> Option<FileMappingReader> {
        let chunks = self
            .mappings
            .get(&mapping)?
            .iter()
            .map(|&i| self.chunks[i])
            .collect();
        Some(FileMappingReader {
            data: Arc::clone(&self.data),
            chunks: Arc::new(chunks),
        })
    }
}

fn payload<'a>(data: &'a [u8], header: &ChunkHeader) -> Result<&'a [u8]> {
    // Bounds were checked on open.
    let b = data
        .get(header.offset as usize..(header.offset + header.size) as usize)
        .ok_or(Error::InvalidSize)?;
    if crc32fast::hash(b) != header.crc {
        return Err(Error::InvalidCrc);
    }
    Ok(b)
}

/// The chunks of one mapping in a symbol file.
#[derive(Clone, Debug)]
pub struct FileMappingReader {
    data: Arc<[u8]>,
    chunks: Arc<Vec<ChunkHeader>>,
}

impl FileMappingReader {
    pub fn stacktrace_resolver(&self) -> FileResolver {
        FileResolver {
            data: Arc::clone(&self.data),
            trees: vec![None; self.chunks.len()],
            chunks: Arc::clone(&self.chunks),
        }
    }
}

/// Decodes chunk trees on first use and keeps them for later lookups.
pub struct FileResolver {
    data: Arc<[u8]>,
    chunks: Arc<Vec<ChunkHeader>>,
    trees: Vec<Option<ParentPointerTree>>,
}

impl FileResolver {
    fn tree(&mut self, i: usize) -> Result<&ParentPointerTree> {
        let slot = &mut self.trees[i];
        if slot.is_none() {
            let header = &self.chunks[i];
            let tree = ParentPointerTree::decode(payload(&self.data, header)?)?;
            if tree.len() != header.nodes {
                return Err(Error::InvalidSize);
            }
            *slot = Some(tree);
        }
        slot.as_ref().ok_or(Error::InvalidSize)
    }
}

impl StacktraceResolver for FileResolver {
    fn resolve_stacktraces<S: StacktraceInserter + ?Sized>(&mut self, dst: &mut S, ids: &[u32]) -> Result<()> {
        check_ascending(ids)?;
        let mut buf = Vec::new();
        for &id in ids {
            let i = self
                .chunks
                .partition_point(|c| c.stid <= id)
                .checked_sub(1)
                .ok_or(Error::StacktraceNotFound(id))?;
            let stid = self.chunks[i].stid;
            if !self.tree(i)?.resolve(id - stid, &mut buf) {
                return Err(Error::StacktraceNotFound(id));
            }
            dst.insert_stacktrace(id, &buf);
        }
        Ok(())
    }
}
