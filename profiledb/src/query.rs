// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::Result;
use crate::index::{parse_selector, Matcher};
use crate::iter::{
    Cancellable, LabeledProfile, MergeIterator, SliceIterator, TimeRangedIterator, Timestamped,
};
use crate::model::{Fingerprint, Labels, Profile, ProfileType, LABEL_NAME_PROFILE_TYPE};
use std::sync::Arc;

/// Selects the profiles of one profile type whose series match a label
/// selector, within `[start, end]` milliseconds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelectProfilesRequest {
    pub label_selector: String,
    pub profile_type: ProfileType,
    pub start: i64,
    pub end: i64,
}

impl SelectProfilesRequest {
    /// The parsed selector, narrowed to the requested profile type.
    pub fn matchers(&self) -> Result<Vec<Matcher>> {
        let mut matchers = parse_selector(&self.label_selector)?;
        matchers.push(Matcher::equal(
            LABEL_NAME_PROFILE_TYPE,
            self.profile_type.id(),
        ));
        Ok(matchers)
    }
}

/// A stored profile together with the labels of its series.
#[derive(Clone, Debug)]
pub struct ProfileWithLabels {
    pub profile: Arc<Profile>,
    pub labels: Arc<Labels>,
    pub fingerprint: Fingerprint,
}

impl Timestamped for ProfileWithLabels {
    fn timestamp(&self) -> i64 {
        self.profile.time_millis()
    }
}

impl LabeledProfile for ProfileWithLabels {
    fn labels(&self) -> &Labels {
        &self.labels
    }
}

/// The result of a profile selection: one time-ranged stream per series,
/// merged into a single ordered stream. The head serves series from memory;
/// blocks read theirs from disk, see [`crate::block::BlockSeries`].
pub type ProfileStream<S = SliceIterator<ProfileWithLabels>> =
    Cancellable<MergeIterator<TimeRangedIterator<S>>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::MatchType;

    #[test]
    fn profile_type_is_always_matched() {
        let req = SelectProfilesRequest {
            label_selector: r#"{job="api"}"#.into(),
            profile_type: ProfileType::parse("process_cpu:cpu:nanoseconds:cpu:nanoseconds")
                .unwrap(),
            start: 0,
            end: 10,
        };
        let m = req.matchers().unwrap();
        assert_eq!(m.len(), 2);
        assert_eq!(m[1].kind, MatchType::Equal);
        assert_eq!(m[1].name, LABEL_NAME_PROFILE_TYPE);
        assert_eq!(m[1].value, "process_cpu:cpu:nanoseconds:cpu:nanoseconds");
    }
}
