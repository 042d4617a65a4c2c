// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hasher;

pub const LABEL_NAME_METRIC: &str = "__name__";
pub const LABEL_NAME_PERIOD_TYPE: &str = "__period_type__";
pub const LABEL_NAME_PERIOD_UNIT: &str = "__period_unit__";
pub const LABEL_NAME_TYPE: &str = "__type__";
pub const LABEL_NAME_UNIT: &str = "__unit__";
pub const LABEL_NAME_PROFILE_TYPE: &str = "__profile_type__";

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LabelPair {
    pub name: String,
    pub value: String,
}

impl LabelPair {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A label set sorted by name, with unique names.
///
/// The derived ordering compares label sets lexicographically, which is the
/// tie-break of the merge order.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Labels(Vec<LabelPair>);

impl Labels {
    /// Sorts the pairs by name. When a name repeats, the last pair wins.
    pub fn new(mut pairs: Vec<LabelPair>) -> Self {
        // Stable sort keeps the input order among equal names.
        pairs.sort_by(|a, b| a.name.cmp(&b.name));
        let mut out: Vec<LabelPair> = Vec::with_capacity(pairs.len());
        for pair in pairs {
            match out.last_mut() {
                Some(last) if last.name == pair.name => *last = pair,
                _ => out.push(pair),
            }
        }
        Self(out)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .binary_search_by(|p| p.name.as_str().cmp(name))
            .ok()
            .map(|i| self.0[i].value.as_str())
    }

    /// Returns a copy with `name` set to `value`.
    pub fn with(&self, name: &str, value: &str) -> Self {
        let mut pairs = self.0.clone();
        match pairs.binary_search_by(|p| p.name.as_str().cmp(name)) {
            Ok(i) => pairs[i].value = value.to_string(),
            Err(i) => pairs.insert(i, LabelPair::new(name, value)),
        }
        Self(pairs)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LabelPair> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The series fingerprint: a pure function of the sorted pairs.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = rustc_hash::FxHasher::default();
        for pair in &self.0 {
            hasher.write(pair.name.as_bytes());
            hasher.write_u8(0xff);
            hasher.write(pair.value.as_bytes());
            hasher.write_u8(0xff);
        }
        Fingerprint(hasher.finish())
    }
}

impl From<Vec<LabelPair>> for Labels {
    fn from(pairs: Vec<LabelPair>) -> Self {
        Self::new(pairs)
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, pair) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={:?}", pair.name, pair.value)?;
        }
        f.write_str("}")
    }
}

#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Fingerprint(pub u64);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// `name:sample_type:sample_unit:period_type:period_unit`, e.g.
/// `process_cpu:cpu:nanoseconds:cpu:nanoseconds`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProfileType {
    pub name: String,
    pub sample_type: String,
    pub sample_unit: String,
    pub period_type: String,
    pub period_unit: String,
}

impl ProfileType {
    pub fn parse(id: &str) -> Result<Self> {
        let parts: Vec<&str> = id.split(':').collect();
        match parts.as_slice() {
            [name, sample_type, sample_unit, period_type, period_unit] if !name.is_empty() => {
                Ok(Self {
                    name: name.to_string(),
                    sample_type: sample_type.to_string(),
                    sample_unit: sample_unit.to_string(),
                    period_type: period_type.to_string(),
                    period_unit: period_unit.to_string(),
                })
            }
            _ => Err(Error::invalid_input(format!(
                "profile type {id:?} must have the form name:type:unit:period_type:period_unit"
            ))),
        }
    }

    pub fn id(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ProfileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}",
            self.name, self.sample_type, self.sample_unit, self.period_type, self.period_unit
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn labels_sorted_last_wins() {
        let labels = Labels::new(vec![
            LabelPair::new("job", "a"),
            LabelPair::new("env", "prod"),
            LabelPair::new("job", "b"),
        ]);
        let names: Vec<_> = labels.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["env", "job"]);
        assert_eq!(labels.get("job"), Some("b"));
        assert_eq!(labels.get("missing"), None);
        assert_eq!(labels.to_string(), r#"{env="prod", job="b"}"#);

        let more = labels.with("az", "1").with("env", "dev");
        assert_eq!(more.get("az"), Some("1"));
        assert_eq!(more.get("env"), Some("dev"));
        assert_eq!(more.len(), 3);
    }

    #[test]
    fn fingerprint_separates_names_and_values() {
        let a = Labels::new(vec![LabelPair::new("ab", "c")]);
        let b = Labels::new(vec![LabelPair::new("a", "bc")]);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn profile_type_parse() {
        let pt = ProfileType::parse("process_cpu:cpu:nanoseconds:cpu:nanoseconds").unwrap();
        assert_eq!(pt.name, "process_cpu");
        assert_eq!(pt.sample_unit, "nanoseconds");
        assert_eq!(pt.id(), "process_cpu:cpu:nanoseconds:cpu:nanoseconds");

        assert!(ProfileType::parse("memory:alloc_space:bytes").is_err());
        assert!(ProfileType::parse(":a:b:c:d").is_err());
    }

    proptest! {
        #[test]
        fn fingerprint_ignores_input_order(
            pairs in proptest::collection::btree_map("[a-z]{1,4}", "[a-z0-9]{0,4}", 0..6)
        ) {
            let forward: Vec<_> = pairs.iter().map(|(k, v)| LabelPair::new(k, v)).collect();
            let mut backward = forward.clone();
            backward.reverse();
            prop_assert_eq!(
                Labels::new(forward).fingerprint(),
                Labels::new(backward).fingerprint()
            );
        }
    }
}
