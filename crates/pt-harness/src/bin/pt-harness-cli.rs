#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use pt_fingerprint::{CollectorOptions, collect_fingerprints};
use pt_harness::{
    HarnessConfig, HarnessError, Suite, SuiteConfig, SuiteOptions, TestOutcome,
    append_drift_history, capture_reference, enforce_green, run_suite, write_suite_artifacts,
};
use pt_types::PolicySet;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Regression verification for re-executed pipelines.
#[derive(Parser, Debug)]
#[command(name = "pt-harness-cli")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log at debug level (RUST_LOG overrides).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Verify test runs against their reference snapshots.
    Verify(VerifyArgs),
    /// Store the current run of one test as its reference snapshot.
    Snapshot(SnapshotArgs),
    /// Fingerprint an output directory and print or write the table.
    Collect(CollectArgs),
}

#[derive(Args, Debug)]
struct SuiteArgs {
    /// Directory holding `<test>.dir`, `<test>.ref` and the pipeline logs.
    #[arg(long, default_value = ".")]
    work_root: PathBuf,

    /// Suite configuration; defaults to `pipeline.yml` in the work root.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

impl SuiteArgs {
    fn load(&self) -> Result<(HarnessConfig, Suite), HarnessError> {
        let harness = HarnessConfig::new(&self.work_root);
        let path = self
            .config
            .clone()
            .unwrap_or_else(|| harness.config_path());
        let suite = SuiteConfig::load(&path)?.into_suite()?;
        Ok((harness, suite))
    }
}

#[derive(Args, Debug)]
struct VerifyArgs {
    #[command(flatten)]
    suite: SuiteArgs,

    /// Verify only this test.
    #[arg(short, long)]
    test: Option<String>,

    /// Where verdicts, the summary table and drift history go.
    #[arg(long)]
    artifact_root: Option<PathBuf>,

    /// Write `<test>.stats`, per-test verdict JSON and the summary table.
    #[arg(long)]
    write_artifacts: bool,

    /// Append one line per test to the drift history.
    #[arg(long)]
    write_drift_history: bool,

    /// Exit non-zero unless every verified test is OK.
    #[arg(long)]
    require_green: bool,
}

#[derive(Args, Debug)]
struct SnapshotArgs {
    #[command(flatten)]
    suite: SuiteArgs,

    #[arg(short, long)]
    test: String,

    /// Replace an existing reference.
    #[arg(long)]
    force: bool,
}

#[derive(Args, Debug)]
struct CollectArgs {
    /// Output directory to fingerprint.
    #[arg(long)]
    root: PathBuf,

    /// Comma-separated suffixes to checksum.
    #[arg(long, default_value = "")]
    checksum: String,

    /// Comma-separated suffixes to count lines for.
    #[arg(long, default_value = "")]
    linecount: String,

    /// Comma-separated suffixes to record by existence only.
    #[arg(long, default_value = "")]
    exist: String,

    /// Write the table here instead of stdout.
    #[arg(short, long)]
    out: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli.command) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(err) => {
            eprintln!("pt-harness-cli: {err}");
            ExitCode::from(2)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn run(command: Command) -> Result<bool, HarnessError> {
    match command {
        Command::Verify(args) => verify(&args),
        Command::Snapshot(args) => snapshot(&args),
        Command::Collect(args) => collect(&args),
    }
}

fn verify(args: &VerifyArgs) -> Result<bool, HarnessError> {
    let (mut harness, suite) = args.suite.load()?;
    if let Some(root) = &args.artifact_root {
        harness.artifact_root.clone_from(root);
    }
    let options = SuiteOptions {
        test_filter: args.test.clone(),
    };

    let report = run_suite(&harness, &suite, &options, &harness.completion())?;
    for outcome in &report.outcomes {
        match outcome {
            TestOutcome::Verified(run) => {
                let verdict = &run.verdict;
                println!(
                    "test={} status={} job_finished={} nfiles={} nref={} missing={} extra={} different={} same={}",
                    verdict.track,
                    verdict.status,
                    verdict.job_finished,
                    verdict.nfiles,
                    verdict.nref,
                    verdict.result.missing.len(),
                    verdict.result.extra.len(),
                    verdict.different_total(),
                    verdict.same_total(),
                );
            }
            TestOutcome::Errored { test, error } => {
                println!("test={test} status=ERROR error={error:?}");
            }
        }
    }
    println!(
        "passed={} failed={} errored={} green={}",
        report.passed,
        report.failed,
        report.errored,
        report.is_green()
    );

    if args.write_artifacts {
        let written = write_suite_artifacts(&harness, &report)?;
        println!(
            "wrote summary={} verdicts={} stats={}",
            written.summary_path.display(),
            written.verdict_paths.len(),
            written.stats_paths.len()
        );
    }
    if args.write_drift_history {
        let history_path = append_drift_history(&harness, &report)?;
        println!("wrote drift_history={}", history_path.display());
    }

    if args.require_green
        && let Err(err) = enforce_green(&report)
    {
        eprintln!("{err}");
        return Ok(false);
    }
    Ok(true)
}

fn snapshot(args: &SnapshotArgs) -> Result<bool, HarnessError> {
    let (harness, suite) = args.suite.load()?;
    let spec = suite.registry.require(&args.test)?;
    let path = capture_reference(&harness, &suite, spec, args.force)?;
    println!("wrote reference={}", path.display());
    Ok(true)
}

fn collect(args: &CollectArgs) -> Result<bool, HarnessError> {
    let policies = PolicySet::from_comma_lists(&args.exist, &args.linecount, &args.checksum)?;
    let table = collect_fingerprints(&args.root, &policies, &CollectorOptions::default())?;
    match args.out.as_deref() {
        Some(path) => write_table(&table, path)?,
        None => print!("{}", table.to_tsv_string()?),
    }
    Ok(table.unreadable().next().is_none())
}

fn write_table(table: &pt_fingerprint::FingerprintTable, path: &Path) -> Result<(), HarnessError> {
    table.write_path(path)?;
    println!("wrote table={} rows={}", path.display(), table.len());
    Ok(())
}
