#![forbid(unsafe_code)]

//! Regression verification for re-executed pipelines.
//!
//! ```text
//! collect_fingerprints ─┐
//!                       ├─ reconcile ─ aggregate ─ Verdict
//! <test>.ref ───────────┘
//! ```
//!
//! Most callers want [`run_suite`] with a [`SuiteConfig`] loaded from
//! `pipeline.yml`; the lower layers are re-exported for embedding.

pub use pt_fingerprint::{
    CollectError, CollectorOptions, ContentDigest, ExclusionRules, FingerprintRecord,
    FingerprintTable, MetricValue, TableError, collect_fingerprints, digest_file,
};
pub use pt_harness::{
    DriftHistoryEntry, HarnessConfig, HarnessError, LogMarkerCompletion, RunCompletion, Suite,
    SuiteConfig, SuiteOptions, SuiteReport, TestOutcome, TestRun, WrittenArtifacts,
    append_drift_history, capture_reference, enforce_green, job_finished, run_suite, verify_test,
    write_suite_artifacts,
};
pub use pt_reconcile::{
    ReconciliationResult, SUMMARY_COLUMNS, Verdict, VerdictStatus, aggregate, reconcile,
    write_summary_tsv,
};
pub use pt_types::{
    ConfigError, MetricKind, PolicySet, SuffixPolicy, TestRegistry, TestSpec, UnclassifiedPolicy,
};
