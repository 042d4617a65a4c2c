// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::symbols::string_ref;
use super::Fingerprint;
use crate::error::{Error, Result};
use crate::pprof;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One ingested sample batch of a single sample type.
///
/// String references point into the strings table and `stacktrace_id`s into
/// the stacktraces table, once the row is stored. Before that they are local
/// to the payload being ingested.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    pub series_fingerprint: Fingerprint,
    pub samples: Vec<Sample>,
    pub time_nanos: i64,
    pub duration_nanos: i64,
    pub period: i64,
    pub drop_frames: u64,
    pub keep_frames: u64,
    pub comments: Vec<u64>,
    pub default_sample_type: u64,
}

impl Profile {
    pub fn time_millis(&self) -> i64 {
        self.time_nanos.div_euclid(1_000_000)
    }

    pub fn total(&self) -> i64 {
        self.samples.iter().map(|s| s.value).sum()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sample {
    pub stacktrace_id: u64,
    pub value: i64,
    pub labels: Vec<SampleLabel>,
}

/// A per-sample label, with `key`, `str` and `num_unit` referencing strings.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SampleLabel {
    pub key: u64,
    pub str: u64,
    pub num: i64,
    pub num_unit: u64,
}

impl TryFrom<&pprof::Label> for SampleLabel {
    type Error = Error;

    fn try_from(l: &pprof::Label) -> Result<Self> {
        Ok(Self {
            key: string_ref(l.key)?,
            str: string_ref(l.str)?,
            num: l.num,
            num_unit: string_ref(l.num_unit)?,
        })
    }
}
