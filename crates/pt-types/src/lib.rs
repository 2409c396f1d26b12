#![forbid(unsafe_code)]

//! Shared vocabulary for the pipetest workspace.
//!
//! A [`TestSpec`] names one verification unit and carries the three
//! [`SuffixPolicy`] matchers that decide how each output file is graded.
//! Specs are collected into a [`TestRegistry`] once at startup and handed to
//! the engine explicitly.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_TARGET: &str = "full";
pub const TEST_NAME_PREFIX: &str = "test_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Existence,
    LineCount,
    Checksum,
}

impl MetricKind {
    /// Grading precedence: a path matching several policies is graded under
    /// the first one listed here.
    pub const PRECEDENCE: [Self; 3] = [Self::Existence, Self::LineCount, Self::Checksum];

    #[must_use]
    pub fn column_name(self) -> &'static str {
        match self {
            Self::Existence => "exists",
            Self::LineCount => "line_count",
            Self::Checksum => "checksum",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column_name())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnclassifiedPolicy {
    /// Shared files matching no policy are listed but do not affect status.
    #[default]
    Ignore,
    /// Any unclassified shared file forces a FAIL verdict.
    Fail,
    /// A reference path matching no policy is a configuration error.
    Reject,
}

impl UnclassifiedPolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ignore => "ignore",
            Self::Fail => "fail",
            Self::Reject => "reject",
        }
    }
}

impl fmt::Display for UnclassifiedPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnclassifiedPolicy {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "ignore" => Ok(Self::Ignore),
            "fail" => Ok(Self::Fail),
            "reject" => Ok(Self::Reject),
            other => Err(ConfigError::UnknownUnclassifiedPolicy(other.to_owned())),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{metric} suffix list contains an empty fragment")]
    EmptyFragment { metric: MetricKind },
    #[error("{metric} suffix fragment {fragment:?} contains whitespace")]
    WhitespaceInFragment { metric: MetricKind, fragment: String },
    #[error("failed to compile {metric} policy: {detail}")]
    Pattern { metric: MetricKind, detail: String },
    #[error("invalid test name {0:?}")]
    InvalidTestName(String),
    #[error("test {0} is defined more than once")]
    DuplicateTest(String),
    #[error("unknown test {0}")]
    UnknownTest(String),
    #[error("unknown unclassified policy {0:?}; expected ignore, fail or reject")]
    UnknownUnclassifiedPolicy(String),
    #[error("no reference data defined for {test}: {} does not exist", path.display())]
    MissingReference { test: String, path: PathBuf },
    #[error("test {test}: {count} reference path(s) match no policy: {paths}")]
    UnclassifiedReference {
        test: String,
        count: usize,
        paths: String,
    },
}

/// Split a comma-separated configuration value into trimmed, non-empty items.
#[must_use]
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Literal filename-suffix matcher for one metric.
///
/// Fragments are escaped before being joined into a single anchored
/// alternation, so configuration text never acts as regex syntax.
#[derive(Debug, Clone)]
pub struct SuffixPolicy {
    metric: MetricKind,
    fragments: Vec<String>,
    matcher: Option<Regex>,
}

impl SuffixPolicy {
    pub fn new<I, S>(metric: MetricKind, fragments: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut validated = Vec::new();
        for fragment in fragments {
            let fragment = fragment.as_ref().trim();
            if fragment.is_empty() {
                return Err(ConfigError::EmptyFragment { metric });
            }
            if fragment.chars().any(char::is_whitespace) {
                return Err(ConfigError::WhitespaceInFragment {
                    metric,
                    fragment: fragment.to_owned(),
                });
            }
            if !validated.iter().any(|known: &String| known == fragment) {
                validated.push(fragment.to_owned());
            }
        }

        let matcher = if validated.is_empty() {
            None
        } else {
            let alternation = validated
                .iter()
                .map(|fragment| regex::escape(fragment))
                .collect::<Vec<_>>()
                .join("|");
            let pattern = format!("(?:{alternation})$");
            Some(Regex::new(&pattern).map_err(|err| ConfigError::Pattern {
                metric,
                detail: err.to_string(),
            })?)
        };

        Ok(Self {
            metric,
            fragments: validated,
            matcher,
        })
    }

    pub fn from_comma_list(metric: MetricKind, raw: &str) -> Result<Self, ConfigError> {
        Self::new(metric, split_list(raw))
    }

    #[must_use]
    pub fn empty(metric: MetricKind) -> Self {
        Self {
            metric,
            fragments: Vec::new(),
            matcher: None,
        }
    }

    #[must_use]
    pub fn metric(&self) -> MetricKind {
        self.metric
    }

    #[must_use]
    pub fn fragments(&self) -> &[String] {
        &self.fragments
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.matcher.is_none()
    }

    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        self.matcher
            .as_ref()
            .is_some_and(|matcher| matcher.is_match(path))
    }
}

impl PartialEq for SuffixPolicy {
    fn eq(&self, other: &Self) -> bool {
        self.metric == other.metric && self.fragments == other.fragments
    }
}

impl Eq for SuffixPolicy {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicySet {
    pub existence: SuffixPolicy,
    pub linecount: SuffixPolicy,
    pub checksum: SuffixPolicy,
}

impl Default for PolicySet {
    fn default() -> Self {
        Self {
            existence: SuffixPolicy::empty(MetricKind::Existence),
            linecount: SuffixPolicy::empty(MetricKind::LineCount),
            checksum: SuffixPolicy::empty(MetricKind::Checksum),
        }
    }
}

impl PolicySet {
    pub fn from_lists<E, L, C>(existence: E, linecount: L, checksum: C) -> Result<Self, ConfigError>
    where
        E: IntoIterator,
        E::Item: AsRef<str>,
        L: IntoIterator,
        L::Item: AsRef<str>,
        C: IntoIterator,
        C::Item: AsRef<str>,
    {
        Ok(Self {
            existence: SuffixPolicy::new(MetricKind::Existence, existence)?,
            linecount: SuffixPolicy::new(MetricKind::LineCount, linecount)?,
            checksum: SuffixPolicy::new(MetricKind::Checksum, checksum)?,
        })
    }

    /// Build from the comma-separated form used on the command line.
    pub fn from_comma_lists(
        existence: &str,
        linecount: &str,
        checksum: &str,
    ) -> Result<Self, ConfigError> {
        Self::from_lists(
            split_list(existence),
            split_list(linecount),
            split_list(checksum),
        )
    }

    #[must_use]
    pub fn policy(&self, metric: MetricKind) -> &SuffixPolicy {
        match metric {
            MetricKind::Existence => &self.existence,
            MetricKind::LineCount => &self.linecount,
            MetricKind::Checksum => &self.checksum,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        MetricKind::PRECEDENCE
            .iter()
            .all(|metric| self.policy(*metric).is_empty())
    }

    /// The single metric a shared path is graded under, honouring precedence.
    #[must_use]
    pub fn classify(&self, path: &str) -> Option<MetricKind> {
        MetricKind::PRECEDENCE
            .into_iter()
            .find(|metric| self.policy(*metric).matches(path))
    }

    pub fn unmatched<'a, I>(&self, paths: I) -> Vec<&'a str>
    where
        I: IntoIterator<Item = &'a str>,
    {
        paths
            .into_iter()
            .filter(|path| self.classify(path).is_none())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestSpec {
    pub name: String,
    pub pipeline_name: String,
    pub targets: Vec<String>,
    pub policies: PolicySet,
}

impl TestSpec {
    pub fn new(name: impl Into<String>, policies: PolicySet) -> Result<Self, ConfigError> {
        let name = name.into();
        if name.trim().is_empty()
            || name.contains(['/', '\\', '.'])
            || name.chars().any(char::is_whitespace)
        {
            return Err(ConfigError::InvalidTestName(name));
        }
        let pipeline_name = default_pipeline_name(&name).to_owned();
        Ok(Self {
            name,
            pipeline_name,
            targets: vec![DEFAULT_TARGET.to_owned()],
            policies,
        })
    }

    #[must_use]
    pub fn with_pipeline(mut self, pipeline_name: impl Into<String>) -> Self {
        self.pipeline_name = pipeline_name.into();
        self
    }

    #[must_use]
    pub fn with_targets(mut self, targets: Vec<String>) -> Self {
        if !targets.is_empty() {
            self.targets = targets;
        }
        self
    }
}

/// `test_mapping` runs the `mapping` pipeline unless configured otherwise.
#[must_use]
pub fn default_pipeline_name(test_name: &str) -> &str {
    test_name
        .strip_prefix(TEST_NAME_PREFIX)
        .filter(|rest| !rest.is_empty())
        .unwrap_or(test_name)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestRegistry {
    tests: BTreeMap<String, TestSpec>,
}

impl TestRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tests: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, spec: TestSpec) -> Result<(), ConfigError> {
        if self.tests.contains_key(&spec.name) {
            return Err(ConfigError::DuplicateTest(spec.name));
        }
        self.tests.insert(spec.name.clone(), spec);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&TestSpec> {
        self.tests.get(name)
    }

    pub fn require(&self, name: &str) -> Result<&TestSpec, ConfigError> {
        self.get(name)
            .ok_or_else(|| ConfigError::UnknownTest(name.to_owned()))
    }

    pub fn specs(&self) -> impl Iterator<Item = &TestSpec> {
        self.tests.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tests.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tests.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }
}
