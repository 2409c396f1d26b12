use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use pt_fingerprint::{CollectorOptions, DEFAULT_COMMENT_MARKER, ExclusionRules};
use pt_types::{ConfigError, PolicySet, TestRegistry, TestSpec, UnclassifiedPolicy, split_list};
use serde::{Deserialize, Serialize};

use crate::HarnessError;

/// A configuration value given either as a YAML list or as one
/// comma-separated string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ListValue {
    Items(Vec<String>),
    Joined(String),
}

impl Default for ListValue {
    fn default() -> Self {
        Self::Items(Vec::new())
    }
}

impl ListValue {
    #[must_use]
    pub fn items(&self) -> Vec<String> {
        match self {
            Self::Items(items) => items.iter().flat_map(|item| split_list(item)).collect(),
            Self::Joined(joined) => split_list(joined),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TestConfig {
    pub pipeline: Option<String>,
    #[serde(alias = "targets")]
    pub target: ListValue,
    #[serde(alias = "regex_md5")]
    pub checksum: ListValue,
    #[serde(alias = "regex_linecount")]
    pub linecount: ListValue,
    #[serde(alias = "regex_exist")]
    pub exist: ListValue,
}

impl TestConfig {
    pub fn to_spec(&self, name: &str) -> Result<TestSpec, ConfigError> {
        let policies =
            PolicySet::from_lists(self.exist.items(), self.linecount.items(), self.checksum.items())?;
        let mut spec = TestSpec::new(name, policies)?.with_targets(self.target.items());
        if let Some(pipeline) = self.pipeline.as_deref().map(str::trim)
            && !pipeline.is_empty()
        {
            spec = spec.with_pipeline(pipeline);
        }
        Ok(spec)
    }
}

/// On-disk suite description, usually `pipeline.yml` in the work root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SuiteConfig {
    pub comment_marker: String,
    pub unclassified: UnclassifiedPolicy,
    pub prerequisites: ListValue,
    pub exclusions: ExclusionRules,
    pub tests: BTreeMap<String, TestConfig>,
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            comment_marker: DEFAULT_COMMENT_MARKER.to_owned(),
            unclassified: UnclassifiedPolicy::default(),
            prerequisites: ListValue::default(),
            exclusions: ExclusionRules::default(),
            tests: BTreeMap::new(),
        }
    }
}

impl SuiteConfig {
    pub fn from_yaml_str(input: &str) -> Result<Self, HarnessError> {
        Ok(serde_yaml::from_str(input)?)
    }

    pub fn load(path: &Path) -> Result<Self, HarnessError> {
        Self::from_yaml_str(&fs::read_to_string(path)?)
    }

    /// Compile every test's suffix lists once. The first malformed entry
    /// aborts the whole build.
    pub fn into_suite(self) -> Result<Suite, ConfigError> {
        let mut registry = TestRegistry::new();
        for (name, test) in &self.tests {
            registry.insert(test.to_spec(name)?)?;
        }
        Ok(Suite {
            registry,
            collector: CollectorOptions {
                comment_marker: self.comment_marker,
                exclusions: self.exclusions,
            },
            unclassified: self.unclassified,
            prerequisites: self.prerequisites.items().into_iter().collect(),
        })
    }
}

/// Everything a suite run needs, built once from a [`SuiteConfig`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Suite {
    pub registry: TestRegistry,
    pub collector: CollectorOptions,
    pub unclassified: UnclassifiedPolicy,
    /// Setup-only tests; present in the registry but never verified.
    pub prerequisites: BTreeSet<String>,
}

impl Suite {
    #[must_use]
    pub fn is_prerequisite(&self, test: &str) -> bool {
        self.prerequisites.contains(test)
    }

    pub fn verifiable(&self) -> impl Iterator<Item = &TestSpec> {
        self.registry
            .specs()
            .filter(|spec| !self.is_prerequisite(&spec.name))
    }
}

#[cfg(test)]
mod tests {
    use pt_types::{ConfigError, MetricKind, UnclassifiedPolicy};

    use super::SuiteConfig;

    const SUITE: &str = r#"
unclassified: fail
prerequisites: prereq_annotations
tests:
  prereq_annotations:
    regex_md5: gtf.gz
  test_mapping:
    regex_md5: [bam, bed.gz]
    regex_linecount: counts.tsv
    regex_exist: bam.bai, rates.gff.gz
  test_bamstats:
    pipeline: bamstats
    target: full,build_report
    checksum: tsv.gz
"#;

    #[test]
    fn list_fields_accept_strings_and_sequences() {
        let suite = SuiteConfig::from_yaml_str(SUITE)
            .expect("parse")
            .into_suite()
            .expect("compile");

        assert_eq!(suite.unclassified, UnclassifiedPolicy::Fail);
        assert_eq!(suite.collector.comment_marker, "#");
        assert_eq!(suite.registry.len(), 3);

        let mapping = suite.registry.require("test_mapping").expect("mapping");
        assert_eq!(mapping.pipeline_name, "mapping");
        assert_eq!(mapping.targets, vec!["full"]);
        assert_eq!(mapping.policies.checksum.fragments(), ["bam", "bed.gz"]);
        assert_eq!(
            mapping.policies.existence.fragments(),
            ["bam.bai", "rates.gff.gz"]
        );
        assert_eq!(
            mapping.policies.classify("bwa.dir/x.bam.bai"),
            Some(MetricKind::Existence)
        );

        let bamstats = suite.registry.require("test_bamstats").expect("bamstats");
        assert_eq!(bamstats.pipeline_name, "bamstats");
        assert_eq!(bamstats.targets, vec!["full", "build_report"]);
    }

    #[test]
    fn prerequisites_are_not_verified() {
        let suite = SuiteConfig::from_yaml_str(SUITE)
            .expect("parse")
            .into_suite()
            .expect("compile");
        assert!(suite.is_prerequisite("prereq_annotations"));
        assert_eq!(
            suite
                .verifiable()
                .map(|spec| spec.name.as_str())
                .collect::<Vec<_>>(),
            vec!["test_bamstats", "test_mapping"]
        );
    }

    #[test]
    fn malformed_suffix_lists_fail_the_build() {
        let yaml = "tests:\n  test_x:\n    regex_md5: \"bam, tsv gz\"\n";
        let err = SuiteConfig::from_yaml_str(yaml)
            .expect("parse")
            .into_suite()
            .expect_err("whitespace");
        assert!(matches!(err, ConfigError::WhitespaceInFragment { .. }));
    }

    #[test]
    fn unknown_keys_and_policies_are_rejected() {
        assert!(SuiteConfig::from_yaml_str("tests:\n  test_x:\n    regex_md6: bam\n").is_err());
        assert!(SuiteConfig::from_yaml_str("unclassified: sometimes\n").is_err());
    }

    #[test]
    fn empty_document_yields_defaults() {
        let config = SuiteConfig::from_yaml_str("{}").expect("parse");
        assert_eq!(config, SuiteConfig::default());
        let suite = config.into_suite().expect("compile");
        assert!(suite.registry.is_empty());
        assert_eq!(suite.collector.exclusions.report_prefix, "report");
    }
}
