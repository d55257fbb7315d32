use std::fs::File;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use clap::Parser;
use miatag_core::config::{DEFAULT_CONFIG_PATH, MiaConfig, load_config};
use miatag_core::fetch::{HttpListSource, HttpListSourceConfig};
use miatag_core::pipeline::{FileOutcome, RunOptions, RunReport, VersionComparison, run};
use miatag_core::replace::{ReplaceReport, apply_replacements};
use tracing::debug;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::{Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(
    name = "miatag",
    version,
    about = "Mark missing-in-action discs in Redump DAT files"
)]
struct Cli {
    #[arg(value_name = "PATH", help = "DAT files or folders of DATs (prompted for when omitted)")]
    paths: Vec<PathBuf>,
    #[arg(
        long,
        value_name = "URL",
        conflicts_with = "index_url",
        help = "Use one MIA list page for every DAT"
    )]
    list_url: Option<String>,
    #[arg(long, value_name = "URL", help = "MIA index page linking one list per system")]
    index_url: Option<String>,
    #[arg(long, value_name = "SUFFIX", help = "Appended to the stem of tagged copies")]
    suffix: Option<String>,
    #[arg(
        long,
        conflicts_with = "keep_originals",
        help = "Replace originals with the tagged copies without asking"
    )]
    overwrite: bool,
    #[arg(long, help = "Keep originals next to the tagged copies without asking")]
    keep_originals: bool,
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, value_name = "PATH", help = "Also write debug logs to this file")]
    log_file: Option<PathBuf>,
    #[arg(long, help = "Print the run report as JSON")]
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();
    init_tracing(cli.log_file.as_deref())?;

    let config = resolve_config(&cli)?;
    let inputs = if cli.paths.is_empty() {
        vec![prompt_for_path()?]
    } else {
        cli.paths.clone()
    };

    let options = RunOptions::from_config(&config);
    let mut source = HttpListSource::new(HttpListSourceConfig::from_config(&config))?;
    let report = run(&options, &mut source, &inputs)
        .with_context(|| format!("failed to load MIA source {}", options.plan.url()))?;

    if !cli.json {
        print_report(&report);
    }
    let replaced =
        should_replace(&cli, &report)?.then(|| apply_replacements(&report.replacement_plan()));
    if cli.json {
        let output = serde_json::json!({
            "summary": report.summary(),
            "report": report,
            "replacements": replaced,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else if let Some(replaced) = &replaced {
        print_replacements(replaced);
    }

    if report.files.is_empty() {
        bail!("no DAT files to process in {}", join_paths(&inputs));
    }
    if let Some(replaced) = replaced.filter(|replaced| !replaced.is_clean()) {
        bail!("{} original(s) could not be replaced", replaced.failed.len());
    }
    Ok(())
}

fn init_tracing(log_file: Option<&Path>) -> Result<()> {
    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("miatag=info"));
    let file_layer = match log_file {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("failed to create log file {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .with_filter(EnvFilter::new("miatag=debug")),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(io::stderr)
                .with_filter(console_filter),
        )
        .with(file_layer)
        .init();
    Ok(())
}

fn resolve_config(cli: &Cli) -> Result<MiaConfig> {
    let config_path = match &cli.config {
        Some(path) if !path.exists() => bail!("config file not found: {}", path.display()),
        Some(path) => path.clone(),
        None => PathBuf::from(DEFAULT_CONFIG_PATH),
    };
    let mut config = load_config(&config_path)?.with_env_overrides()?;
    debug!(path = %config_path.display(), found = config_path.exists(), "loaded configuration");

    if let Some(url) = &cli.list_url {
        config.source.list_url = Some(url.clone());
    }
    if let Some(url) = &cli.index_url {
        config.source.index_url = Some(url.clone());
        config.source.list_url = None;
    }
    if let Some(suffix) = &cli.suffix {
        config.output.suffix = Some(suffix.clone());
    }
    config.validate()?;
    Ok(config)
}

fn prompt_for_path() -> Result<PathBuf> {
    print!("Path to a DAT file or a folder of DATs: ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let path = strip_wrapping_quotes(line.trim());
    if path.is_empty() {
        bail!("no input path given");
    }
    Ok(PathBuf::from(path))
}

/// Dragging a file onto a terminal quotes paths that contain spaces.
fn strip_wrapping_quotes(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner.trim();
        }
    }
    value
}

fn should_replace(cli: &Cli, report: &RunReport) -> Result<bool> {
    if report.replacement_plan().is_empty() || cli.keep_originals {
        return Ok(false);
    }
    if cli.overwrite {
        return Ok(true);
    }
    if cli.json {
        return Ok(false);
    }
    print!(
        "Replace {} original DAT(s) with the tagged copies? [y/N]: ",
        report.replacement_plan().len()
    );
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(is_yes(&answer))
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

fn print_report(report: &RunReport) {
    let summary = report.summary();
    println!("miatag run");
    println!("source: {}", report.source_url);
    println!("list_requests: {}", report.list_requests);
    println!("files_found: {}", summary.files_found);
    println!("files_processed: {}", summary.files_processed);
    println!("files_modified: {}", summary.files_modified);
    println!("files_not_listed: {}", summary.files_not_listed);
    println!("files_skipped: {}", summary.files_skipped);
    println!("previously_tagged: {}", report.previously_tagged.len());
    println!("records_tagged: {}", summary.records_tagged);
    println!("records_already_tagged: {}", summary.records_already_tagged);
    println!("entries_not_found: {}", summary.entries_not_found);
    println!("dats_outdated: {}", summary.dats_outdated);
    println!("lists_outdated: {}", summary.lists_outdated);

    if !report.files.is_empty() {
        println!("files:");
    }
    for file in &report.files {
        let path = normalize_path(&file.path);
        match &file.outcome {
            FileOutcome::Written {
                output,
                stats,
                versions,
            } => println!(
                "  - {path}: tagged {} -> {}{}",
                stats.tagged,
                normalize_path(output),
                version_note(*versions)
            ),
            FileOutcome::Unchanged { versions, .. } => {
                println!("  - {path}: no update needed{}", version_note(*versions))
            }
            FileOutcome::NotListed { reason } => println!("  - {path}: no update needed ({reason})"),
            FileOutcome::Skipped { reason } => println!("  - {path}: skipped ({reason})"),
        }
        if let Some(stats) = file.stats().filter(|stats| !stats.unmatched.is_empty()) {
            println!("    not found in DAT:");
            for entry in &stats.unmatched {
                println!("      - {}", entry.title);
            }
        }
    }

    if !report.warnings.is_empty() {
        println!("warnings:");
        for warning in &report.warnings {
            println!("  - {warning}");
        }
    }
}

fn print_replacements(report: &ReplaceReport) {
    println!("replaced: {}", report.replaced.len());
    if !report.failed.is_empty() {
        println!("replace_failures:");
        for failure in &report.failed {
            println!(
                "  - {}: {} (tagged copy kept at {})",
                normalize_path(&failure.original),
                failure.reason,
                normalize_path(&failure.written)
            );
        }
    }
}

fn version_note(versions: VersionComparison) -> &'static str {
    match versions {
        VersionComparison::DatOutdated => " [DAT older than MIA list]",
        VersionComparison::ListOutdated => " [MIA list older than DAT]",
        VersionComparison::Match | VersionComparison::Unknown => "",
    }
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|path| normalize_path(path))
        .collect::<Vec<_>>()
        .join(", ")
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
