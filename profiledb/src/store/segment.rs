// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Row group framing shared by segment files and table files.
//!
//! A file is a sequence of row groups:
//!
//! ```text
//! | rows: u32 BE | payload length: u32 BE | payload: lz4 frame |
//! ```
//!
//! The payload decompresses to the MessagePack encoding of
//! `Vec<(row_id, row)>`.

use crate::error::{Error, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;

pub const ROW_GROUP_HEADER_SIZE: u64 = 8;

pub fn encode_row_group<T: Serialize>(rows: &[(u64, T)]) -> Result<Vec<u8>> {
    let count = u32::try_from(rows.len()).map_err(|_| Error::InvalidSize)?;
    let payload = rmp_serde::to_vec(rows)?;
    let mut zipper = FrameEncoder::new(Vec::with_capacity(payload.len() / 2));
    zipper.write_all(&payload)?;
    let compressed = zipper.finish()?;
    let len = u32::try_from(compressed.len()).map_err(|_| Error::InvalidSize)?;

    let mut out = Vec::with_capacity(compressed.len() + ROW_GROUP_HEADER_SIZE as usize);
    out.write_u32::<BigEndian>(count)?;
    out.write_u32::<BigEndian>(len)?;
    out.extend_from_slice(&compressed);
    Ok(out)
}

/// Reads the row group at the current position. Returns `None` at a clean
/// end of input.
pub fn read_row_group<T: DeserializeOwned, R: Read>(reader: &mut R) -> Result<Option<Vec<(u64, T)>>> {
    let count = match reader.read_u32::<BigEndian>() {
        Ok(count) => count,
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let len = u64::from(reader.read_u32::<BigEndian>()?);
    // The length comes from disk; let the input bound the allocation.
    let mut compressed = Vec::new();
    reader.by_ref().take(len).read_to_end(&mut compressed)?;
    if compressed.len() as u64 != len {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
    }

    let mut payload = Vec::new();
    FrameDecoder::new(compressed.as_slice()).read_to_end(&mut payload)?;
    let rows: Vec<(u64, T)> = rmp_serde::from_slice(&payload)?;
    if rows.len() != count as usize {
        return Err(Error::InvalidSize);
    }
    Ok(Some(rows))
}

/// Reads one row group at `offset` of the file at `path`.
pub fn read_row_group_at<T: DeserializeOwned>(path: &Path, offset: u64) -> Result<Vec<(u64, T)>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut reader = BufReader::new(file);
    read_row_group(&mut reader)?.ok_or(Error::InvalidSize)
}

/// Position of one row group inside a table file.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RowGroupInfo {
    pub offset: u64,
    pub first_row: u64,
    pub num_rows: u64,
}

impl RowGroupInfo {
    pub fn end_row(&self) -> u64 {
        self.first_row + self.num_rows
    }
}

/// Walks the row group headers of a table file without decoding payloads.
///
/// Table files hold groups of consecutive row ids in id order, so a group's
/// first row is the number of rows before it.
pub fn read_directory(path: &Path) -> Result<Vec<RowGroupInfo>> {
    let file = File::open(path)?;
    let size = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut groups = Vec::new();
    let (mut offset, mut first_row) = (0u64, 0u64);
    while offset < size {
        if size - offset < ROW_GROUP_HEADER_SIZE {
            return Err(Error::InvalidSize);
        }
        reader.seek(SeekFrom::Start(offset))?;
        let num_rows = u64::from(reader.read_u32::<BigEndian>()?);
        let len = u64::from(reader.read_u32::<BigEndian>()?);
        let end = offset + ROW_GROUP_HEADER_SIZE + len;
        if end > size {
            return Err(Error::InvalidSize);
        }
        groups.push(RowGroupInfo {
            offset,
            first_row,
            num_rows,
        });
        first_row += num_rows;
        offset = end;
    }
    Ok(groups)
}

/// Reads every row of a table file, in file order.
pub fn read_table<T: DeserializeOwned>(path: &Path) -> Result<Vec<(u64, T)>> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut rows = Vec::new();
    while let Some(group) = read_row_group(&mut reader)? {
        rows.extend(group);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_groups_concatenate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strings.bin");

        let first = encode_row_group(&[(0u64, "a".to_string()), (1, "b".to_string())]).unwrap();
        let second = encode_row_group(&[(2u64, "c".to_string())]).unwrap();
        let mut bytes = first.clone();
        bytes.extend_from_slice(&second);
        std::fs::write(&path, &bytes).unwrap();

        let rows: Vec<(u64, String)> = read_table(&path).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2], (2, "c".to_string()));

        let group: Vec<(u64, String)> = read_row_group_at(&path, first.len() as u64).unwrap();
        assert_eq!(group, vec![(2, "c".to_string())]);
    }

    #[test]
    fn directory_lists_group_positions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profiles.bin");
        let first = encode_row_group(&[(0u64, 1i64), (1, 2)]).unwrap();
        let second = encode_row_group(&[(2u64, 3i64)]).unwrap();
        let mut bytes = first.clone();
        bytes.extend_from_slice(&second);
        std::fs::write(&path, &bytes).unwrap();

        let groups = read_directory(&path).unwrap();
        assert_eq!(
            groups,
            [
                RowGroupInfo {
                    offset: 0,
                    first_row: 0,
                    num_rows: 2
                },
                RowGroupInfo {
                    offset: first.len() as u64,
                    first_row: 2,
                    num_rows: 1
                },
            ]
        );
        assert_eq!(groups[1].end_row(), 3);

        bytes.truncate(bytes.len() - 1);
        std::fs::write(&path, &bytes).unwrap();
        assert!(matches!(read_directory(&path), Err(Error::InvalidSize)));
    }

    #[test]
    fn truncated_group_is_an_error() {
        let mut bytes = encode_row_group(&[(0u64, 42i64)]).unwrap();
        bytes.truncate(bytes.len() - 1);
        let err = read_row_group::<i64, _>(&mut bytes.as_slice()).unwrap_err();
        assert!(matches!(err, Error::Io(_)), "{err:?}");
    }

    #[test]
    fn oversized_length_is_not_trusted() {
        let mut bytes = encode_row_group(&[(0u64, 7i64)]).unwrap();
        bytes[4..8].copy_from_slice(&u32::MAX.to_be_bytes());
        let err = read_row_group::<i64, _>(&mut bytes.as_slice()).unwrap_err();
        match err {
            Error::Io(err) => assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof),
            err => panic!("unexpected error: {err:?}"),
        }
    }

    #[test]
    fn row_count_must_match_payload() {
        let mut bytes = encode_row_group(&[(0u64, 1i64), (1, 2)]).unwrap();
        bytes[3] = 3;
        let err = read_row_group::<i64, _>(&mut bytes.as_slice()).unwrap_err();
        assert!(matches!(err, Error::InvalidSize), "{err:?}");
    }
}
