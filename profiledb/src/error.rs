// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::model::SymbolKind;
use std::borrow::Cow;
use std::{fmt, io};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Represents errors that occur in the storage engine.
///
/// Format errors (magic, CRC, size, version) are kept apart so that callers
/// can tell "not a symbol file" from "truncated or corrupted file".
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("invalid magic number")]
    InvalidMagic,
    #[error("invalid CRC")]
    InvalidCrc,
    #[error("invalid size")]
    InvalidSize,
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u32),
    /// A local reference was rewritten before its table was populated. This
    /// is an ordering bug in the caller.
    #[error("unknown {kind} reference {id}")]
    UnknownReference { kind: SymbolKind, id: u64 },
    /// A stack trace id beyond the node count of its tree.
    #[error("stack trace {0} not found")]
    StacktraceNotFound(u32),
    #[error("invalid profile: {0}")]
    InvalidProfile(Cow<'static, str>),
    /// A parameter was incorrect, e.g. ids that are not sorted.
    #[error("invalid input: {0}")]
    InvalidInput(Cow<'static, str>),
    #[error("invalid label selector: {0}")]
    InvalidSelector(String),
    /// A structure reached the largest size its ids can address.
    #[error("{0} capacity exceeded")]
    CapacityExceeded(&'static str),
    #[error("{0} store is closed")]
    StoreClosed(&'static str),
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Encode(#[from] rmp_serde::encode::Error),
    #[error(transparent)]
    Decode(#[from] rmp_serde::decode::Error),
    #[error(transparent)]
    Compression(#[from] lz4_flex::frame::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Multi(#[from] MultiError),
}

impl Error {
    pub fn invalid_profile(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::InvalidProfile(msg.into())
    }

    pub fn invalid_input(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::InvalidInput(msg.into())
    }
}

/// Collects every error of a fan-out operation, such as closing all inputs
/// of a merge, instead of keeping only the first one.
#[derive(Debug, Default)]
pub struct MultiError(Vec<Error>);

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: Error) {
        self.0.push(err);
    }

    pub fn add<T>(&mut self, result: Result<T>) -> Option<T> {
        match result {
            Ok(v) => Some(v),
            Err(err) => {
                self.push(err);
                None
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn errors(&self) -> &[Error] {
        &self.0
    }

    /// Returns `Ok` when nothing was collected. A single error is returned
    /// as is; several are wrapped in [`Error::Multi`].
    pub fn into_result(mut self) -> Result<()> {
        match self.0.len() {
            0 => Ok(()),
            1 => Err(self.0.remove(0)),
            _ => Err(Error::Multi(self)),
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors occurred:", self.0.len())?;
        for err in &self.0 {
            write!(f, "\n\t* {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}
