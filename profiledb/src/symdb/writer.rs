// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::format::*;
use super::mapping::{Chunk, MappingReader};
use super::DEFAULT_FILE_NAME;
use crate::error::Result;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

pub(super) const TMP_FILE_NAME: &str = "stacktraces.symdb.tmp";

/// Writes `symbols.symdb`.
///
/// Chunk payloads are staged in a temporary file while their headers are
/// collected; [`Writer::write_to`] then emits the header, the TOC and the
/// chunk headers, and copies the staged payloads after them.
pub struct Writer {
    dir: PathBuf,
    tmp_path: PathBuf,
    tmp: BufWriter<File>,
    /// Bytes staged so far; chunk offsets are relative to it until
    /// `write_to` shifts them.
    staged: u64,
    headers: Vec<ChunkHeader>,
    scratch: Vec<u8>,
}

impl Writer {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let tmp_path = dir.join(TMP_FILE_NAME);
        let tmp = BufWriter::new(File::create(&tmp_path)?);
        Ok(Self {
            dir,
            tmp_path,
            tmp,
            staged: 0,
            headers: Vec::new(),
            scratch: Vec::new(),
        })
    }

    /// Stages every chunk of a mapping, in id order.
    pub fn write_mapping(&mut self, mapping: &MappingReader) -> Result<()> {
        let m = &mapping.mapping;
        m.with_chunks(|chunks| {
            chunks
                .iter()
                .try_for_each(|chunk| self.write_chunk(m.name, m.max_nodes, chunk))
        })
    }

    pub(crate) fn write_chunk(&mut self, mapping: u64, max_nodes: u32, chunk: &Chunk) -> Result<()> {
        self.scratch.clear();
        let size = chunk.tree.write_to(&mut self.scratch)?;
        self.tmp.write_all(&self.scratch)?;
        self.headers.push(ChunkHeader {
            offset: self.staged,
            size,
            mapping,
            stid: chunk.stid,
            nodes: chunk.tree.len(),
            max_nodes,
            stacktraces: chunk.stacktraces,
            max_depth: chunk.max_depth,
            crc: crc32fast::hash(&self.scratch),
        });
        self.staged += size;
        Ok(())
    }

    pub fn num_chunks(&self) -> usize {
        self.headers.len()
    }

    /// Writes the complete file to `dst` and removes the staging file.
    /// Returns the number of bytes written.
    pub fn write_to<W: Write>(&mut self, dst: &mut W) -> Result<u64> {
        self.tmp.flush()?;

        let headers_offset = (HEADER_SIZE + TOC_SIZE) as u64;
        let headers_size = (self.headers.len() * CHUNK_HEADER_SIZE) as u64;
        let data_offset = headers_offset + headers_size;

        let mut toc = Toc::default();
        toc.entries[TOC_STACKTRACE_CHUNK_HEADERS] = TocEntry {
            offset: headers_offset,
            size: headers_size,
        };
        toc.entries[TOC_STACKTRACE_CHUNK_DATA] = TocEntry {
            offset: data_offset,
            size: self.staged,
        };
        let headers: Vec<ChunkHeader> = self
            .headers
            .iter()
            .map(|h| ChunkHeader {
                offset: h.offset + data_offset,
                ..*h
            })
            .collect();

        dst.write_all(&Header::default().marshal())?;
        dst.write_all(&toc.marshal())?;
        dst.write_all(&marshal_chunk_headers(&headers))?;
        let copied = io::copy(&mut File::open(&self.tmp_path)?, dst)?;
        fs::remove_file(&self.tmp_path)?;
        Ok(data_offset + copied)
    }

    /// Writes `<dir>/symbols.symdb` and syncs it.
    pub fn write_file(&mut self) -> Result<PathBuf> {
        let path = self.dir.join(DEFAULT_FILE_NAME);
        let mut file = BufWriter::new(File::create(&path)?);
        self.write_to(&mut file)?;
        file.flush()?;
        file.get_ref().sync_all()?;
        Ok(path)
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        // Already gone after a successful write.
        let _ = fs::remove_file(&self.tmp_path);
    }
}
