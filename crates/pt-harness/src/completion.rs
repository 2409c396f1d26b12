use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::HarnessConfig;

pub const DEFAULT_COMPLETION_MARKER: &str = "# job finished";

/// Only the end of a log is inspected; pipeline logs can be large.
const LOG_TAIL_BYTES: u64 = 8 * 1024;

/// Decides whether one pipeline log shows a completed run.
pub trait RunCompletion: Sync {
    fn is_run_complete(&self, log: &Path) -> bool;
}

/// Complete when the last non-blank line of the log starts with the marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMarkerCompletion {
    marker: String,
}

impl LogMarkerCompletion {
    #[must_use]
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
        }
    }

    #[must_use]
    pub fn marker(&self) -> &str {
        &self.marker
    }
}

impl Default for LogMarkerCompletion {
    fn default() -> Self {
        Self::new(DEFAULT_COMPLETION_MARKER)
    }
}

impl RunCompletion for LogMarkerCompletion {
    fn is_run_complete(&self, log: &Path) -> bool {
        match read_tail(log) {
            Ok(tail) => last_line_has_marker(&tail, &self.marker),
            Err(err) => {
                warn!(log = %log.display(), error = %err, "cannot read pipeline log");
                false
            }
        }
    }
}

fn read_tail(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    file.seek(SeekFrom::Start(len.saturating_sub(LOG_TAIL_BYTES)))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn last_line_has_marker(text: &str, marker: &str) -> bool {
    text.lines()
        .rev()
        .map(str::trim_end)
        .find(|line| !line.is_empty())
        .is_some_and(|line| line.starts_with(marker))
}

/// Logs written for `test`: `<test>.log` and `<test>.<anything>.log` in the
/// work root, sorted.
pub fn log_paths(config: &HarnessConfig, test: &str) -> io::Result<Vec<PathBuf>> {
    let dotted = format!("{test}.");
    let mut logs = Vec::new();
    for entry in fs::read_dir(&config.work_root)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name.starts_with(&dotted) && name.ends_with(".log") && entry.file_type()?.is_file() {
            logs.push(entry.path());
        }
    }
    logs.sort();
    Ok(logs)
}

/// A test's run finished only if it left at least one log and every one of
/// its logs is complete.
pub fn job_finished(config: &HarnessConfig, test: &str, completion: &dyn RunCompletion) -> bool {
    let logs = match log_paths(config, test) {
        Ok(logs) => logs,
        Err(err) => {
            warn!(test, error = %err, "cannot list pipeline logs");
            return false;
        }
    };
    if logs.is_empty() {
        warn!(test, "no pipeline log found; completion unknown");
        return false;
    }

    logs.iter().all(|log| {
        let complete = completion.is_run_complete(log);
        debug!(test, log = %log.display(), complete, "log completion check");
        complete
    })
}
