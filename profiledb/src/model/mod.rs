// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Row types of the six column stores, plus label sets and profile types.

mod labels;
mod profile;
mod symbols;

pub use labels::*;
pub use profile::*;
pub use symbols::*;

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of a table, used to pick the rewriter table and to name stores.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    String,
    Mapping,
    Function,
    Location,
    Stacktrace,
    Profile,
}

impl SymbolKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            SymbolKind::String => "string",
            SymbolKind::Mapping => "mapping",
            SymbolKind::Function => "function",
            SymbolKind::Location => "location",
            SymbolKind::Stacktrace => "stacktrace",
            SymbolKind::Profile => "profile",
        }
    }
}

impl fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
