use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use flate2::bufread::MultiGzDecoder;
use pt_types::{MetricKind, PolicySet};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use walkdir::WalkDir;

use crate::{FingerprintRecord, FingerprintTable, TableError};

pub const DEFAULT_COMMENT_MARKER: &str = "#";
pub const DEFAULT_RESERVED_PREFIXES: [&str; 1] = ["_"];
pub const DEFAULT_REPORT_PREFIX: &str = "report";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const NAME_COLLISION: &str = "file name is not valid UTF-8 and collides with another output";

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("run output directory {} does not exist", .0.display())]
    RootNotFound(PathBuf),
    #[error("failed to walk run output directory: {0}")]
    Walk(#[from] walkdir::Error),
    #[error(transparent)]
    Table(#[from] TableError),
}

/// Paths the collector never fingerprints: generated reports and
/// underscore-prefixed scratch trees belong to the harness, not the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExclusionRules {
    pub reserved_prefixes: Vec<String>,
    pub report_prefix: String,
}

impl Default for ExclusionRules {
    fn default() -> Self {
        Self {
            reserved_prefixes: DEFAULT_RESERVED_PREFIXES
                .iter()
                .map(|prefix| (*prefix).to_owned())
                .collect(),
            report_prefix: DEFAULT_REPORT_PREFIX.to_owned(),
        }
    }
}

impl ExclusionRules {
    #[must_use]
    pub fn excludes_component(&self, name: &str) -> bool {
        (!self.report_prefix.is_empty() && name.starts_with(&self.report_prefix))
            || self
                .reserved_prefixes
                .iter()
                .any(|prefix| !prefix.is_empty() && name.starts_with(prefix.as_str()))
    }

    #[must_use]
    pub fn excludes_path(&self, relative: &str) -> bool {
        relative
            .split('/')
            .any(|component| self.excludes_component(component))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorOptions {
    /// Lines starting with this marker are dropped before hashing. Empty
    /// disables comment stripping.
    pub comment_marker: String,
    pub exclusions: ExclusionRules,
}

impl Default for CollectorOptions {
    fn default() -> Self {
        Self {
            comment_marker: DEFAULT_COMMENT_MARKER.to_owned(),
            exclusions: ExclusionRules::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentDigest {
    pub checksum: String,
    pub line_count: u64,
}

impl ContentDigest {
    /// Single pass over `reader`: every `\n`-terminated record is counted,
    /// and every line not starting with `comment_marker` is hashed.
    pub fn from_reader<R: BufRead>(mut reader: R, comment_marker: &[u8]) -> io::Result<Self> {
        let mut hasher = Sha256::new();
        let mut line = Vec::with_capacity(256);
        let mut line_count = 0_u64;

        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line)? == 0 {
                break;
            }
            if line.last() == Some(&b'\n') {
                line_count += 1;
            }
            if !comment_marker.is_empty() && line.starts_with(comment_marker) {
                continue;
            }
            hasher.update(&line);
        }

        Ok(Self {
            checksum: format!("{:x}", hasher.finalize()),
            line_count,
        })
    }
}

/// Open `path` for line reading, inflating it first when it starts with a
/// gzip member header. Multi-member streams (bgzip, BAM) are read through.
pub fn open_decompressed(path: &Path) -> io::Result<Box<dyn BufRead + Send>> {
    let mut reader = BufReader::new(File::open(path)?);
    if reader.fill_buf()?.starts_with(&GZIP_MAGIC) {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(reader))))
    } else {
        Ok(Box::new(reader))
    }
}

pub fn digest_file(path: &Path, comment_marker: &str) -> io::Result<ContentDigest> {
    ContentDigest::from_reader(open_decompressed(path)?, comment_marker.as_bytes())
}

/// Value columns a collection with `policies` will fill.
#[must_use]
pub fn requested_columns(policies: &PolicySet) -> Vec<MetricKind> {
    [MetricKind::Checksum, MetricKind::LineCount]
        .into_iter()
        .filter(|metric| !policies.policy(*metric).is_empty())
        .collect()
}

#[derive(Debug)]
struct Candidate {
    relative: String,
    absolute: PathBuf,
    checksum: bool,
    line_count: bool,
}

/// Fingerprint every regular file under `root` whose run-relative path ends
/// in one of the policy suffixes.
///
/// Files matched by the existence policy are recorded without reading
/// their content, since existence outranks both value metrics. Otherwise
/// each value metric is filled when its policy matches. An empty
/// `policies` returns an empty table without touching the filesystem.
///
/// Any directory that cannot be walked fails the whole collection rather
/// than dropping its subtree. Distinct non-UTF-8 names that map to the same
/// lossy key are recorded as one unreadable row.
pub fn collect_fingerprints(
    root: &Path,
    policies: &PolicySet,
    options: &CollectorOptions,
) -> Result<FingerprintTable, CollectError> {
    let mut table = FingerprintTable::new(requested_columns(policies));
    if policies.is_empty() {
        trace_event!(debug, root = %root.display(), "no metrics requested");
        return Ok(table);
    }
    if !root.is_dir() {
        return Err(CollectError::RootNotFound(root.to_path_buf()));
    }

    let candidates = discover_candidates(root, policies, &options.exclusions)?;
    trace_event!(
        debug,
        root = %root.display(),
        candidates = candidates.len(),
        "fingerprinting run outputs"
    );

    let marker = options.comment_marker.as_str();
    let records = candidates
        .into_par_iter()
        .map(|candidate| {
            let record = fingerprint_candidate(&candidate, marker);
            (candidate.relative, record)
        })
        .collect::<Vec<_>>();

    let mut rows = BTreeMap::new();
    for (path, record) in records {
        match rows.entry(path) {
            Entry::Vacant(slot) => {
                slot.insert(record);
            }
            Entry::Occupied(mut slot) => {
                trace_event!(
                    warn,
                    path = %slot.key(),
                    "distinct non-UTF-8 file names share one path key"
                );
                slot.insert(FingerprintRecord::unreadable(NAME_COLLISION));
            }
        }
    }
    for (path, record) in rows {
        table.insert(path, record)?;
    }
    Ok(table)
}

fn discover_candidates(
    root: &Path,
    policies: &PolicySet,
    exclusions: &ExclusionRules,
) -> Result<Vec<Candidate>, CollectError> {
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0 || !exclusions.excludes_component(&entry.file_name().to_string_lossy())
        });

    let mut candidates = Vec::new();
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(relative) = relative_key(root, entry.path()) else {
            continue;
        };

        let existence = policies.existence.matches(&relative);
        let checksum = !existence && policies.checksum.matches(&relative);
        let line_count = !existence && policies.linecount.matches(&relative);
        if existence || checksum || line_count {
            candidates.push(Candidate {
                relative,
                absolute: entry.into_path(),
                checksum,
                line_count,
            });
        }
    }
    Ok(candidates)
}

fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts = relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>();
    if parts.is_empty() {
        return None;
    }
    let key = parts.join("/");
    if relative.to_str().is_none() {
        trace_event!(warn, path = %key, "file name is not valid UTF-8; keyed lossily");
    }
    Some(key)
}

fn fingerprint_candidate(candidate: &Candidate, comment_marker: &str) -> FingerprintRecord {
    if !candidate.checksum && !candidate.line_count {
        return FingerprintRecord::present();
    }

    match digest_file(&candidate.absolute, comment_marker) {
        Ok(digest) => FingerprintRecord {
            checksum: candidate.checksum.then_some(digest.checksum),
            line_count: candidate.line_count.then_some(digest.line_count),
            error: None,
        },
        Err(err) => {
            trace_event!(
                warn,
                path = %candidate.relative,
                error = %err,
                "output file is unreadable; recording it as such"
            );
            FingerprintRecord::unreadable(err.to_string())
        }
    }
}
