use std::collections::BTreeSet;
use std::fmt;
use std::io::Write;

use csv::WriterBuilder;
use pt_types::UnclassifiedPolicy;
use serde::{Deserialize, Serialize};

use crate::ReconciliationResult;

/// Column order of the suite summary table.
pub const SUMMARY_COLUMNS: [&str; 22] = [
    "track",
    "status",
    "job_finished",
    "nfiles",
    "nref",
    "missing",
    "extra",
    "different",
    "different_checksum",
    "different_linecount",
    "same",
    "same_checksum",
    "same_linecount",
    "same_existence_only",
    "files_missing",
    "files_extra",
    "files_different_checksum",
    "files_different_linecount",
    "unclassified",
    "unreadable",
    "files_unclassified",
    "files_unreadable",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerdictStatus {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "FAIL")]
    Fail,
}

impl VerdictStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Fail => "FAIL",
        }
    }
}

impl fmt::Display for VerdictStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub track: String,
    pub status: VerdictStatus,
    pub job_finished: bool,
    pub nfiles: usize,
    pub nref: usize,
    pub unclassified_policy: UnclassifiedPolicy,
    #[serde(flatten)]
    pub result: ReconciliationResult,
}

impl Verdict {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == VerdictStatus::Ok
    }

    #[must_use]
    pub fn different_total(&self) -> usize {
        self.result.different_total()
    }

    #[must_use]
    pub fn same_total(&self) -> usize {
        self.result.same_total()
    }

    /// Why the verdict is FAIL; empty for OK.
    #[must_use]
    pub fn failure_reasons(&self) -> Vec<String> {
        let mut reasons = Vec::new();
        if !self.job_finished {
            reasons.push("job did not finish".to_owned());
        }
        let counted = [
            ("missing", &self.result.missing),
            ("extra", &self.result.extra),
            ("different_checksum", &self.result.different_checksum),
            ("different_linecount", &self.result.different_linecount),
            ("unreadable", &self.result.unreadable),
        ];
        for (label, paths) in counted {
            if !paths.is_empty() {
                reasons.push(format!("{label}={}", paths.len()));
            }
        }
        if unclassified_fails(self.unclassified_policy) && !self.result.unclassified.is_empty() {
            reasons.push(format!("unclassified={}", self.result.unclassified.len()));
        }
        reasons
    }

    /// One summary row, aligned with [`SUMMARY_COLUMNS`].
    #[must_use]
    pub fn summary_row(&self) -> Vec<String> {
        let result = &self.result;
        vec![
            self.track.clone(),
            self.status.to_string(),
            self.job_finished.to_string(),
            self.nfiles.to_string(),
            self.nref.to_string(),
            result.missing.len().to_string(),
            result.extra.len().to_string(),
            result.different_total().to_string(),
            result.different_checksum.len().to_string(),
            result.different_linecount.len().to_string(),
            result.same_total().to_string(),
            result.same_checksum.len().to_string(),
            result.same_linecount.len().to_string(),
            result.same_existence_only.len().to_string(),
            join_paths(&result.missing),
            join_paths(&result.extra),
            join_paths(&result.different_checksum),
            join_paths(&result.different_linecount),
            result.unclassified.len().to_string(),
            result.unreadable.len().to_string(),
            join_paths(&result.unclassified),
            join_paths(&result.unreadable),
        ]
    }
}

fn join_paths(paths: &BTreeSet<String>) -> String {
    paths
        .iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

fn unclassified_fails(policy: UnclassifiedPolicy) -> bool {
    matches!(policy, UnclassifiedPolicy::Fail | UnclassifiedPolicy::Reject)
}

/// Fold completion status and a reconciliation into the test's verdict.
pub fn aggregate(
    track: impl Into<String>,
    result: ReconciliationResult,
    job_finished: bool,
    nfiles: usize,
    nref: usize,
    unclassified_policy: UnclassifiedPolicy,
) -> Verdict {
    let track = track.into();

    for _path in &result.unclassified {
        trace_event!(
            warn,
            track = %track,
            path = %_path,
            policy = %unclassified_policy,
            "shared file matches no suffix policy"
        );
    }

    let clean = job_finished
        && result.missing.is_empty()
        && result.extra.is_empty()
        && result.different_checksum.is_empty()
        && result.different_linecount.is_empty()
        && result.unreadable.is_empty()
        && !(unclassified_fails(unclassified_policy) && !result.unclassified.is_empty());

    let verdict = Verdict {
        track,
        status: if clean {
            VerdictStatus::Ok
        } else {
            VerdictStatus::Fail
        },
        job_finished,
        nfiles,
        nref,
        unclassified_policy,
        result,
    };

    trace_event!(
        debug,
        track = %verdict.track,
        status = %verdict.status,
        nfiles = verdict.nfiles,
        nref = verdict.nref,
        "verdict aggregated"
    );
    verdict
}

pub fn write_summary_tsv<'a, W, I>(writer: W, verdicts: I) -> Result<(), csv::Error>
where
    W: Write,
    I: IntoIterator<Item = &'a Verdict>,
{
    let mut writer = WriterBuilder::new().delimiter(b'\t').from_writer(writer);
    writer.write_record(SUMMARY_COLUMNS)?;
    for verdict in verdicts {
        writer.write_record(verdict.summary_row())?;
    }
    writer.flush()?;
    Ok(())
}
