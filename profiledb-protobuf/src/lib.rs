// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! This crate holds the [`profiles`] message types the storage engine ingests,
//! decoded with prost, plus the unsigned LEB128 and zig-zag helpers used by the
//! on-disk stack trace encoding.
//!
//! Indices into the string table are `i64`, as in the upstream proto. IDs of
//! mappings, functions and locations are non-zero `u64`; zero means "unset".
//!
//! [`profiles`]: https://github.com/google/pprof/blob/main/proto/profile.proto

mod prost_impls;
pub mod varint;

pub use prost::Message;
pub use prost_impls::*;
