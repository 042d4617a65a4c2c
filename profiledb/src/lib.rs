// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! A storage engine for continuous profiling data.
//!
//! Profiles are ingested into the [`head::Head`], whose tables deduplicate
//! symbols (strings, mappings, functions, locations, stack traces) and keep
//! one row per profile and sample type. A [`index::ProfileIndex`] maps label
//! sets to series, and queries return time-ordered, merged streams of
//! profiles. Flushing turns the head into an immutable block on disk, and
//! [`compact`] merges blocks into one.
//!
//! The [`symdb`] module holds an independent, chunked stack trace store with
//! its own file format.

pub mod block;
pub mod collections;
pub mod compact;
pub mod config;
pub mod db;
pub mod error;
pub mod head;
pub mod index;
pub mod iter;
pub mod model;
pub mod query;
pub mod rewriter;
pub mod store;
pub mod symdb;

pub use profiledb_protobuf as pprof;

pub use db::ProfileDb;
pub use error::{Error, MultiError, Result};
pub use head::Head;
pub use query::{ProfileStream, ProfileWithLabels, SelectProfilesRequest};
