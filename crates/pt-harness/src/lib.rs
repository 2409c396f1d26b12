#![forbid(unsafe_code)]

//! Suite runner: loads the suite config, checks each test's run for
//! completion, fingerprints its output tree, reconciles it against the
//! stored reference and reports one verdict per test.

use std::path::PathBuf;

use pt_fingerprint::{CollectError, FingerprintTable, TableError, collect_fingerprints};
use pt_reconcile::{Verdict, aggregate, reconcile};
use pt_types::{ConfigError, TestSpec, UnclassifiedPolicy};
use rayon::prelude::*;
use thiserror::Error;
use tracing::{error, info, warn};

mod artifacts;
mod completion;
mod config;

pub use artifacts::{
    DriftHistoryEntry, WrittenArtifacts, append_drift_history, write_suite_artifacts,
};
pub use completion::{
    DEFAULT_COMPLETION_MARKER, LogMarkerCompletion, RunCompletion, job_finished, log_paths,
};
pub use config::{ListValue, Suite, SuiteConfig, TestConfig};

pub const DEFAULT_CONFIG_FILE: &str = "pipeline.yml";

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Holds `<test>.dir`, `<test>.ref`, `<test>.stats` and the logs.
    pub work_root: PathBuf,
    pub artifact_root: PathBuf,
    pub completion_marker: String,
}

impl HarnessConfig {
    #[must_use]
    pub fn new(work_root: impl Into<PathBuf>) -> Self {
        let work_root = work_root.into();
        Self {
            artifact_root: work_root.join("report"),
            completion_marker: DEFAULT_COMPLETION_MARKER.to_owned(),
            work_root,
        }
    }

    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        self.work_root.join(DEFAULT_CONFIG_FILE)
    }

    #[must_use]
    pub fn run_root(&self, test: &str) -> PathBuf {
        self.work_root.join(format!("{test}.dir"))
    }

    #[must_use]
    pub fn reference_path(&self, test: &str) -> PathBuf {
        self.work_root.join(format!("{test}.ref"))
    }

    #[must_use]
    pub fn stats_path(&self, test: &str) -> PathBuf {
        self.work_root.join(format!("{test}.stats"))
    }

    #[must_use]
    pub fn summary_path(&self) -> PathBuf {
        self.artifact_root.join("compare.tsv")
    }

    #[must_use]
    pub fn verdict_path(&self, test: &str) -> PathBuf {
        self.artifact_root.join(format!("{test}.verdict.json"))
    }

    #[must_use]
    pub fn drift_history_path(&self) -> PathBuf {
        self.artifact_root.join("drift_history.jsonl")
    }

    #[must_use]
    pub fn completion(&self) -> LogMarkerCompletion {
        LogMarkerCompletion::new(self.completion_marker.clone())
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::new(".")
    }
}

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Collect(#[from] CollectError),
    #[error("suite is not green: {0}")]
    SuiteNotGreen(String),
    #[error("reference {} already exists; pass --force to replace it", .0.display())]
    ReferenceExists(PathBuf),
    #[error("{test}: refusing to snapshot unreadable outputs: {paths}")]
    UnreadableOutputs { test: String, paths: String },
}

#[derive(Debug, Clone, Default)]
pub struct SuiteOptions {
    /// Run only this test.
    pub test_filter: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TestRun {
    pub verdict: Verdict,
    /// Fingerprints of the run's outputs, as persisted to `<test>.stats`.
    pub current: FingerprintTable,
}

#[derive(Debug, Clone)]
pub enum TestOutcome {
    Verified(Box<TestRun>),
    Errored { test: String, error: String },
}

impl TestOutcome {
    #[must_use]
    pub fn test(&self) -> &str {
        match self {
            Self::Verified(run) => &run.verdict.track,
            Self::Errored { test, .. } => test,
        }
    }

    #[must_use]
    pub fn verdict(&self) -> Option<&Verdict> {
        match self {
            Self::Verified(run) => Some(&run.verdict),
            Self::Errored { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SuiteReport {
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    pub outcomes: Vec<TestOutcome>,
}

impl SuiteReport {
    #[must_use]
    pub fn is_green(&self) -> bool {
        self.failed == 0 && self.errored == 0 && self.passed > 0
    }

    pub fn verdicts(&self) -> impl Iterator<Item = &Verdict> {
        self.outcomes.iter().filter_map(TestOutcome::verdict)
    }

    fn from_outcomes(outcomes: Vec<TestOutcome>) -> Self {
        let mut report = Self {
            passed: 0,
            failed: 0,
            errored: 0,
            outcomes,
        };
        for outcome in &report.outcomes {
            match outcome.verdict() {
                Some(verdict) if verdict.is_ok() => report.passed += 1,
                Some(_) => report.failed += 1,
                None => report.errored += 1,
            }
        }
        report
    }
}

/// Verify one test's latest run against its reference snapshot.
pub fn verify_test(
    config: &HarnessConfig,
    suite: &Suite,
    spec: &TestSpec,
    completion: &dyn RunCompletion,
) -> Result<TestRun, HarnessError> {
    let reference_path = config.reference_path(&spec.name);
    if !reference_path.is_file() {
        return Err(ConfigError::MissingReference {
            test: spec.name.clone(),
            path: reference_path,
        }
        .into());
    }
    // References captured from the work root key rows as `<test>.dir/...`.
    let reference = FingerprintTable::read_path(&reference_path)?
        .strip_path_prefix(&format!("{}.dir/", spec.name));

    if suite.unclassified == UnclassifiedPolicy::Reject {
        let unmatched = spec.policies.unmatched(reference.paths());
        if !unmatched.is_empty() {
            return Err(ConfigError::UnclassifiedReference {
                test: spec.name.clone(),
                count: unmatched.len(),
                paths: unmatched.join(","),
            }
            .into());
        }
    }

    let job_finished = job_finished(config, &spec.name, completion);
    let run_root = config.run_root(&spec.name);
    let current = match collect_fingerprints(&run_root, &spec.policies, &suite.collector) {
        Ok(table) => table,
        Err(CollectError::RootNotFound(root)) => {
            warn!(
                test = %spec.name,
                root = %root.display(),
                "run output directory is missing; every reference file counts as missing"
            );
            FingerprintTable::default()
        }
        Err(err) => return Err(err.into()),
    };

    let result = reconcile(&current, &reference, &spec.policies);
    let verdict = aggregate(
        spec.name.clone(),
        result,
        job_finished,
        current.len(),
        reference.len(),
        suite.unclassified,
    );
    info!(
        test = %spec.name,
        status = %verdict.status,
        job_finished,
        nfiles = verdict.nfiles,
        nref = verdict.nref,
        different = verdict.different_total(),
        "test verified"
    );
    Ok(TestRun { verdict, current })
}

/// Verify every non-prerequisite test, in parallel. A test that cannot be
/// verified is reported as errored without stopping its siblings.
pub fn run_suite(
    config: &HarnessConfig,
    suite: &Suite,
    options: &SuiteOptions,
    completion: &dyn RunCompletion,
) -> Result<SuiteReport, HarnessError> {
    if let Some(test) = options.test_filter.as_deref() {
        suite.registry.require(test)?;
    }

    let specs = suite
        .verifiable()
        .filter(|spec| {
            options
                .test_filter
                .as_deref()
                .is_none_or(|test| spec.name == test)
        })
        .collect::<Vec<_>>();
    info!(tests = specs.len(), work_root = %config.work_root.display(), "verifying suite");

    let outcomes = specs
        .into_par_iter()
        .map(|spec| match verify_test(config, suite, spec, completion) {
            Ok(run) => TestOutcome::Verified(Box::new(run)),
            Err(err) => {
                error!(test = %spec.name, error = %err, "test could not be verified");
                TestOutcome::Errored {
                    test: spec.name.clone(),
                    error: err.to_string(),
                }
            }
        })
        .collect::<Vec<_>>();

    Ok(SuiteReport::from_outcomes(outcomes))
}

pub fn enforce_green(report: &SuiteReport) -> Result<(), HarnessError> {
    if report.is_green() {
        return Ok(());
    }

    let mut failures = Vec::new();
    if report.outcomes.is_empty() {
        failures.push("no tests were verified".to_owned());
    }
    for outcome in &report.outcomes {
        match outcome {
            TestOutcome::Verified(run) if !run.verdict.is_ok() => failures.push(format!(
                "{}: FAIL {}",
                run.verdict.track,
                run.verdict.failure_reasons().join(" ")
            )),
            TestOutcome::Verified(_) => {}
            TestOutcome::Errored { test, error } => failures.push(format!("{test}: {error}")),
        }
    }
    Err(HarnessError::SuiteNotGreen(failures.join(" | ")))
}

/// Fingerprint the current run of `spec` and store it as the test's
/// reference snapshot.
pub fn capture_reference(
    config: &HarnessConfig,
    suite: &Suite,
    spec: &TestSpec,
    force: bool,
) -> Result<PathBuf, HarnessError> {
    let reference_path = config.reference_path(&spec.name);
    if reference_path.exists() && !force {
        return Err(HarnessError::ReferenceExists(reference_path));
    }

    let table = collect_fingerprints(&config.run_root(&spec.name), &spec.policies, &suite.collector)?;
    let unreadable = table.unreadable().map(|(path, _)| path).collect::<Vec<_>>();
    if !unreadable.is_empty() {
        return Err(HarnessError::UnreadableOutputs {
            test: spec.name.clone(),
            paths: unreadable.join(","),
        });
    }

    table.write_path(&reference_path)?;
    info!(
        test = %spec.name,
        files = table.len(),
        reference = %reference_path.display(),
        "reference snapshot captured"
    );
    Ok(reference_path)
}
