// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::hash::BuildHasherDefault;

pub type FxBuildHasher = BuildHasherDefault<rustc_hash::FxHasher>;
pub type FxHashMap<K, V> = hashbrown::HashMap<K, V, FxBuildHasher>;
pub type FxIndexMap<K, V> = indexmap::IndexMap<K, V, FxBuildHasher>;
pub type FxIndexSet<K> = indexmap::IndexSet<K, FxBuildHasher>;

/// Creates a non-zero, 64-bit id from a dense row offset. It's guaranteed to
/// be the offset + 1.
///
/// pprof does not allow mappings, functions or locations with an id of zero,
/// since zero means "unset", even for the first row of a table.
#[inline]
pub fn non_zero_pprof_id(offset: u64) -> Option<u64> {
    offset.checked_add(1)
}

/// The inverse of [`non_zero_pprof_id`].
#[inline]
pub fn offset_of_pprof_id(id: u64) -> Option<u64> {
    id.checked_sub(1)
}
