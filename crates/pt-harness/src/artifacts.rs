use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use chrono::{SecondsFormat, Utc};
use pt_reconcile::write_summary_tsv;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{HarnessConfig, HarnessError, SuiteReport, TestOutcome};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrittenArtifacts {
    pub summary_path: PathBuf,
    pub verdict_paths: Vec<PathBuf>,
    pub stats_paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftHistoryEntry {
    pub ts_unix_ms: i64,
    pub recorded_at: String,
    pub track: String,
    /// `OK`, `FAIL`, or `ERROR` when the test could not be verified.
    pub status: String,
    pub job_finished: bool,
    pub nfiles: usize,
    pub nref: usize,
    pub missing: usize,
    pub extra: usize,
    pub different: usize,
    pub same: usize,
    pub unclassified: usize,
    pub unreadable: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict_hash: Option<String>,
}

/// Write `<test>.stats` next to each run, one `<test>.verdict.json` per
/// verified test and the suite summary table.
pub fn write_suite_artifacts(
    config: &HarnessConfig,
    report: &SuiteReport,
) -> Result<WrittenArtifacts, HarnessError> {
    fs::create_dir_all(&config.artifact_root)?;

    let mut verdict_paths = Vec::new();
    let mut stats_paths = Vec::new();
    for outcome in &report.outcomes {
        let TestOutcome::Verified(run) = outcome else {
            continue;
        };
        let test = run.verdict.track.as_str();

        let stats_path = config.stats_path(test);
        run.current.write_path(&stats_path)?;
        stats_paths.push(stats_path);

        let verdict_path = config.verdict_path(test);
        fs::write(&verdict_path, serde_json::to_string_pretty(&run.verdict)?)?;
        verdict_paths.push(verdict_path);
    }

    let summary_path = config.summary_path();
    let mut writer = BufWriter::new(File::create(&summary_path)?);
    write_summary_tsv(&mut writer, report.verdicts())?;
    writer.flush()?;
    debug!(summary = %summary_path.display(), tests = verdict_paths.len(), "artifacts written");

    Ok(WrittenArtifacts {
        summary_path,
        verdict_paths,
        stats_paths,
    })
}

/// Append one JSON line per test outcome to the drift history.
pub fn append_drift_history(
    config: &HarnessConfig,
    report: &SuiteReport,
) -> Result<PathBuf, HarnessError> {
    let history_path = config.drift_history_path();
    if let Some(parent) = history_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&history_path)?;

    let now = Utc::now();
    let recorded_at = now.to_rfc3339_opts(SecondsFormat::Millis, true);
    for outcome in &report.outcomes {
        let entry = match outcome {
            TestOutcome::Verified(run) => {
                let verdict = &run.verdict;
                let verdict_json = serde_json::to_vec(verdict)?;
                DriftHistoryEntry {
                    ts_unix_ms: now.timestamp_millis(),
                    recorded_at: recorded_at.clone(),
                    track: verdict.track.clone(),
                    status: verdict.status.to_string(),
                    job_finished: verdict.job_finished,
                    nfiles: verdict.nfiles,
                    nref: verdict.nref,
                    missing: verdict.result.missing.len(),
                    extra: verdict.result.extra.len(),
                    different: verdict.different_total(),
                    same: verdict.same_total(),
                    unclassified: verdict.result.unclassified.len(),
                    unreadable: verdict.result.unreadable.len(),
                    error: None,
                    verdict_hash: Some(format!("sha256:{:x}", Sha256::digest(&verdict_json))),
                }
            }
            TestOutcome::Errored { test, error } => DriftHistoryEntry {
                ts_unix_ms: now.timestamp_millis(),
                recorded_at: recorded_at.clone(),
                track: test.clone(),
                status: "ERROR".to_owned(),
                job_finished: false,
                nfiles: 0,
                nref: 0,
                missing: 0,
                extra: 0,
                different: 0,
                same: 0,
                unclassified: 0,
                unreadable: 0,
                error: Some(error.clone()),
                verdict_hash: None,
            },
        };
        writeln!(file, "{}", serde_json::to_string(&entry)?)?;
    }

    Ok(history_path)
}
