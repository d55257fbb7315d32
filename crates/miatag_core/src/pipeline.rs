//! One tagging run: fetch the MIA source, find DATs, tag and write each.
//!
//! Files move through `Discovered -> Parsed -> Tagged -> Written`, or stop
//! early as `Unchanged`, `NotListed` or `Skipped`. Only a failure to read
//! the MIA source itself aborts the run, and that happens before any input
//! file is opened.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{MiaConfig, SourcePlan};
use crate::dat::{DatFile, output_path_for, parse_dat, write_dat};
use crate::error::Result;
use crate::fetch::{ListSource, resolve_link};
use crate::locate::{LocateOptions, locate_dat_files};
use crate::mialist::{
    MiaIndex, MiaList, SystemCategory, SystemListing, normalize_title, parse_mia_list,
    parse_system_index,
};
use crate::replace::Replacement;
use crate::tagger::{TagStats, tag_file};

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub plan: SourcePlan,
    pub locate: LocateOptions,
    pub suffix: String,
}

impl RunOptions {
    pub fn from_config(config: &MiaConfig) -> Self {
        Self {
            plan: config.source_plan(),
            locate: LocateOptions::from_config(config),
            suffix: config.suffix().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionComparison {
    DatOutdated,
    ListOutdated,
    Match,
    Unknown,
}

/// Both sides use `YYYY-MM-DD HH-MM-SS`, which orders correctly as text.
pub fn compare_versions(dat: Option<&str>, list: Option<&str>) -> VersionComparison {
    match (dat, list) {
        (Some(dat), Some(list)) if dat < list => VersionComparison::DatOutdated,
        (Some(dat), Some(list)) if list < dat => VersionComparison::ListOutdated,
        (Some(_), Some(_)) => VersionComparison::Match,
        _ => VersionComparison::Unknown,
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FileOutcome {
    Written {
        output: PathBuf,
        stats: TagStats,
        versions: VersionComparison,
    },
    Unchanged {
        stats: TagStats,
        versions: VersionComparison,
    },
    /// No MIA list applies to this DAT's system.
    NotListed { reason: String },
    Skipped { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub path: PathBuf,
    pub system: Option<String>,
    pub outcome: FileOutcome,
}

impl FileReport {
    pub fn stats(&self) -> Option<&TagStats> {
        match &self.outcome {
            FileOutcome::Written { stats, .. } | FileOutcome::Unchanged { stats, .. } => Some(stats),
            FileOutcome::NotListed { .. } | FileOutcome::Skipped { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub files_found: usize,
    pub files_processed: usize,
    pub files_modified: usize,
    pub files_not_listed: usize,
    pub files_skipped: usize,
    pub records_tagged: usize,
    pub records_already_tagged: usize,
    pub entries_not_found: usize,
    pub dats_outdated: usize,
    pub lists_outdated: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub source_url: String,
    pub files: Vec<FileReport>,
    pub previously_tagged: Vec<PathBuf>,
    pub warnings: Vec<String>,
    pub list_requests: usize,
}

impl RunReport {
    pub fn summary(&self) -> RunSummary {
        let mut summary = RunSummary {
            files_found: self.files.len(),
            ..RunSummary::default()
        };
        for file in &self.files {
            let versions = match &file.outcome {
                FileOutcome::Written { versions, .. } => {
                    summary.files_modified += 1;
                    Some(*versions)
                }
                FileOutcome::Unchanged { versions, .. } => Some(*versions),
                FileOutcome::NotListed { .. } => {
                    summary.files_not_listed += 1;
                    None
                }
                FileOutcome::Skipped { .. } => {
                    summary.files_skipped += 1;
                    None
                }
            };
            if versions.is_some() {
                summary.files_processed += 1;
            }
            match versions {
                Some(VersionComparison::DatOutdated) => summary.dats_outdated += 1,
                Some(VersionComparison::ListOutdated) => summary.lists_outdated += 1,
                _ => {}
            }
            if let Some(stats) = file.stats() {
                summary.records_tagged += stats.tagged;
                summary.records_already_tagged += stats.already_tagged;
                summary.entries_not_found += stats.unmatched.len();
            }
        }
        summary
    }

    /// `(original, written)` pairs for the optional overwrite step.
    pub fn replacement_plan(&self) -> Vec<Replacement> {
        self.files
            .iter()
            .filter_map(|file| match &file.outcome {
                FileOutcome::Written { output, .. } => Some(Replacement {
                    original: file.path.clone(),
                    written: output.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    pub fn skipped(&self) -> impl Iterator<Item = (&Path, &str)> {
        self.files.iter().filter_map(|file| match &file.outcome {
            FileOutcome::Skipped { reason } => Some((file.path.as_path(), reason.as_str())),
            _ => None,
        })
    }
}

struct LoadedList {
    list: MiaList,
    index: MiaIndex,
}

impl LoadedList {
    fn new(url: &str, list: MiaList) -> Self {
        let index = MiaIndex::from(&list);
        if index.is_empty() {
            warn!(%url, "MIA list has no entries");
        } else {
            info!(%url, entries = index.len(), "loaded MIA list");
        }
        Self { list, index }
    }
}

enum ListResolver {
    Single(LoadedList),
    Index {
        base_url: String,
        systems: HashMap<String, SystemListing>,
        cache: HashMap<String, std::result::Result<LoadedList, String>>,
    },
}

enum Resolved<'a> {
    List {
        loaded: &'a LoadedList,
        system: Option<String>,
    },
    NotListed {
        reason: String,
        system: Option<String>,
    },
    Failed {
        reason: String,
        system: Option<String>,
    },
}

impl ListResolver {
    fn load<S: ListSource>(plan: &SourcePlan, source: &mut S) -> Result<Self> {
        match plan {
            SourcePlan::Single { url } => {
                let text = source.fetch(url)?;
                let list = parse_mia_list(&text)?;
                Ok(Self::Single(LoadedList::new(url, list)))
            }
            SourcePlan::Index { url } => {
                let text = source.fetch(url)?;
                let systems = parse_system_index(&text)?;
                info!(%url, systems = systems.len(), "loaded MIA system index");
                Ok(Self::Index {
                    base_url: url.clone(),
                    systems: systems
                        .into_iter()
                        .map(|system| (normalize_title(&system.name), system))
                        .collect(),
                    cache: HashMap::new(),
                })
            }
        }
    }

    fn resolve<S: ListSource>(&mut self, source: &mut S, dat_path: &Path) -> Resolved<'_> {
        let (base_url, systems, cache) = match self {
            Self::Single(loaded) => {
                return Resolved::List {
                    loaded,
                    system: None,
                };
            }
            Self::Index {
                base_url,
                systems,
                cache,
            } => (base_url, systems, cache),
        };

        let file_name = dat_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let system_name = system_name_for(&file_name);
        let system = Some(system_name.clone());

        let Some(listing) = systems.get(&normalize_title(&system_name)) else {
            return Resolved::NotListed {
                reason: format!("no MIA list for system `{system_name}`"),
                system,
            };
        };
        let Some(link) = listing.link.as_deref() else {
            let reason = match listing.category {
                SystemCategory::NoReportedMias => "system has no reported MIAs",
                SystemCategory::WithMias => "system is listed without a linked MIA list",
            };
            return Resolved::NotListed {
                reason: reason.to_string(),
                system,
            };
        };
        let Some(url) = resolve_link(base_url, link) else {
            return Resolved::Failed {
                reason: format!("cannot resolve MIA list link `{link}`"),
                system,
            };
        };

        let entry = cache.entry(url.clone()).or_insert_with(|| {
            source
                .fetch(&url)
                .and_then(|text| parse_mia_list(&text))
                .map(|list| LoadedList::new(&url, list))
                .map_err(|error| error.to_string())
        });
        match entry {
            Ok(loaded) => Resolved::List { loaded, system },
            Err(reason) => Resolved::Failed {
                reason: reason.clone(),
                system,
            },
        }
    }
}

/// Run the whole batch. `Err` only for a fatal source failure; everything
/// that goes wrong for a single file lands in the report.
pub fn run<S: ListSource>(options: &RunOptions, source: &mut S, inputs: &[PathBuf]) -> Result<RunReport> {
    let mut resolver = ListResolver::load(&options.plan, source)?;

    let located = locate_dat_files(inputs, &options.locate);
    info!(files = located.files.len(), "located DAT files");

    let mut files = Vec::with_capacity(located.files.len());
    for path in &located.files {
        let report = process_file(path, options, &mut resolver, source);
        match &report.outcome {
            FileOutcome::Written { output, stats, .. } => info!(
                file = %path.display(),
                output = %output.display(),
                tagged = stats.tagged,
                "updated"
            ),
            FileOutcome::Unchanged { .. } => info!(file = %path.display(), "no update needed"),
            FileOutcome::NotListed { reason } => info!(file = %path.display(), %reason, "no update needed"),
            FileOutcome::Skipped { reason } => warn!(file = %path.display(), %reason, "skipped"),
        }
        files.push(report);
    }

    Ok(RunReport {
        source_url: options.plan.url().to_string(),
        files,
        previously_tagged: located.previously_tagged,
        warnings: located.warnings.iter().map(ToString::to_string).collect(),
        list_requests: source.request_count(),
    })
}

fn process_file<S: ListSource>(
    path: &Path,
    options: &RunOptions,
    resolver: &mut ListResolver,
    source: &mut S,
) -> FileReport {
    let skipped = |reason: String, system: Option<String>| FileReport {
        path: path.to_path_buf(),
        system,
        outcome: FileOutcome::Skipped { reason },
    };

    let mut dat = match parse_dat(path) {
        Ok(dat) => dat,
        Err(error) => return skipped(error.to_string(), None),
    };
    debug!(file = %path.display(), records = dat.records.len(), "parsed DAT");

    let (loaded, system) = match resolver.resolve(source, path) {
        Resolved::List { loaded, system } => (loaded, system),
        Resolved::NotListed { reason, system } => {
            return FileReport {
                path: path.to_path_buf(),
                system,
                outcome: FileOutcome::NotListed { reason },
            };
        }
        Resolved::Failed { reason, system } => return skipped(reason, system),
    };

    let stats = tag_file(&mut dat, &loaded.index);
    let versions = compare_versions(dat.timestamp().as_deref(), loaded.list.timestamp());
    if !dat.is_modified() {
        return FileReport {
            path: path.to_path_buf(),
            system,
            outcome: FileOutcome::Unchanged { stats, versions },
        };
    }

    match write_tagged(&dat, &options.suffix) {
        Ok(output) => FileReport {
            path: path.to_path_buf(),
            system,
            outcome: FileOutcome::Written {
                output,
                stats,
                versions,
            },
        },
        Err(error) => skipped(error.to_string(), system),
    }
}

fn write_tagged(dat: &DatFile, suffix: &str) -> Result<PathBuf> {
    let output = output_path_for(&dat.path, suffix);
    write_dat(dat, &output)?;
    Ok(output)
}

/// System name a DAT's file name refers to on the MIA index page.
///
/// `Sony - PlayStation - Datfile (123) (2024-01-02 03-04-05).dat` becomes
/// `Sony - PlayStation`; BIOS DATs map to the wiki's "... BIOS Images"
/// entries; fixdat prefixes are ignored.
pub fn system_name_for(file_name: &str) -> String {
    let mut name = file_name.replace('_', " ");
    for prefix in ["fixdat", "fix"] {
        let head = name.get(..prefix.len()).unwrap_or_default();
        if head.eq_ignore_ascii_case(prefix) {
            name = name[prefix.len()..].trim_start().to_string();
        }
    }

    if name.contains("BIOS") {
        let base = name.split(" Datfile").next().unwrap_or_default().trim_end();
        return format!("{base} Images");
    }
    let parts = name.split(" - ").collect::<Vec<_>>();
    if parts.len() < 2 {
        return name
            .rsplit_once('.')
            .map_or(name.as_str(), |(stem, _)| stem)
            .trim()
            .to_string();
    }
    parts[..parts.len() - 1].join(" - ")
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs;
    use std::path::{Path, PathBuf};

    use tempfile::tempdir;

    use super::{FileOutcome, RunOptions, VersionComparison, compare_versions, run, system_name_for};
    use crate::config::SourcePlan;
    use crate::error::{MiaError, Result};
    use crate::fetch::ListSource;
    use crate::locate::LocateOptions;

    #[derive(Default)]
    struct MockSource {
        pages: BTreeMap<String, String>,
        requested: Vec<String>,
    }

    impl MockSource {
        fn with_page(mut self, url: &str, body: &str) -> Self {
            self.pages.insert(url.to_string(), body.to_string());
            self
        }
    }

    impl ListSource for MockSource {
        fn fetch(&mut self, url: &str) -> Result<String> {
            self.requested.push(url.to_string());
            self.pages.get(url).cloned().ok_or_else(|| MiaError::Fetch {
                url: url.to_string(),
                reason: "connection refused".to_string(),
            })
        }

        fn request_count(&self) -> usize {
            self.requested.len()
        }
    }

    const LIST_URL: &str = "http://wiki.example/index.php?title=PS1_MIA";
    const INDEX_URL: &str = "http://wiki.example/index.php?title=MIA_Lists";

    fn dat_with(games: &[(&str, Option<&str>)]) -> String {
        let mut text = String::from(
            "<?xml version=\"1.0\"?>\n<datafile>\n\t<header>\n\t\t<name>Sony - PlayStation</name>\n\t\t<version>2024-01-02 03-04-05</version>\n\t</header>\n",
        );
        for (name, serial) in games {
            text.push_str(&format!("\t<game name=\"{name}\">\n"));
            if let Some(serial) = serial {
                text.push_str(&format!("\t\t<serial>{serial}</serial>\n"));
            }
            text.push_str(&format!("\t\t<rom name=\"{name}.cue\" size=\"1\"/>\n"));
            text.push_str(&format!("\t\t<rom name=\"{name}.bin\" size=\"2\"/>\n"));
            text.push_str("\t</game>\n");
        }
        text.push_str("</datafile>\n");
        text
    }

    fn write_file(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent dir");
        }
        fs::write(path, content).expect("write file");
    }

    fn options(plan: SourcePlan) -> RunOptions {
        RunOptions {
            plan,
            locate: LocateOptions::default(),
            suffix: " [mia-fixed]".to_string(),
        }
    }

    fn single() -> RunOptions {
        options(SourcePlan::Single {
            url: LIST_URL.to_string(),
        })
    }

    const TABLE_LIST: &str = r#"<p>DAT version: Sony - PlayStation (2024-02-01 00-00-00)</p>
<table><tr><th>Title</th><th>Serial</th></tr>
<tr><td>Example Game</td><td>SLPS-12345</td></tr></table>"#;

    #[test]
    fn serial_match_tags_one_record_and_writes_new_file() {
        let temp = tempdir().expect("tempdir");
        let dat_path = temp.path().join("Sony - PlayStation - Datfile (2) (2024-01-02).dat");
        let original = dat_with(&[("Example Game", Some("slps-12345")), ("Bystander", Some("SLPS-99999"))]);
        write_file(&dat_path, &original);

        let mut source = MockSource::default().with_page(LIST_URL, TABLE_LIST);
        let report = run(&single(), &mut source, &[temp.path().to_path_buf()]).expect("run");

        let summary = report.summary();
        assert_eq!(summary.files_processed, 1);
        assert_eq!(summary.files_modified, 1);
        assert_eq!(summary.records_tagged, 1);
        assert_eq!(summary.dats_outdated, 1);

        let plan = report.replacement_plan();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].original, dat_path);
        let written = fs::read_to_string(&plan[0].written).expect("read output");
        assert_eq!(
            written,
            original.replace(
                "<rom name=\"Example Game.bin\" size=\"2\"/>",
                "<rom name=\"Example Game.bin\" size=\"2\" mia=\"yes\"/>"
            )
        );
        assert_eq!(fs::read_to_string(&dat_path).expect("read original"), original);
    }

    #[test]
    fn fetch_failure_aborts_before_touching_inputs() {
        let temp = tempdir().expect("tempdir");
        let dat_path = temp.path().join("a.dat");
        write_file(&dat_path, &dat_with(&[("Example Game", Some("SLPS-12345"))]));

        let mut source = MockSource::default();
        let error = run(&single(), &mut source, &[temp.path().to_path_buf()]).expect_err("must fail");
        assert!(matches!(error, MiaError::Fetch { .. }));
        assert!(error.is_fatal());

        let entries = fs::read_dir(temp.path()).expect("read dir").count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn unrecognized_list_is_fatal() {
        let mut source = MockSource::default().with_page(LIST_URL, "<p>moved</p>");
        let error = run(&single(), &mut source, &[]).expect_err("must fail");
        assert!(matches!(error, MiaError::Parse(_)));
    }

    #[test]
    fn malformed_file_is_skipped_and_others_still_written() {
        let temp = tempdir().expect("tempdir");
        let good = dat_with(&[("Example Game", Some("SLPS-12345"))]);
        write_file(&temp.path().join("a.dat"), &good);
        write_file(&temp.path().join("b.dat"), "this is not xml");
        write_file(&temp.path().join("c.dat"), &good);

        let mut source = MockSource::default().with_page(LIST_URL, TABLE_LIST);
        let report = run(&single(), &mut source, &[temp.path().to_path_buf()]).expect("run");

        let summary = report.summary();
        assert_eq!(summary.files_found, 3);
        assert_eq!(summary.files_modified, 2);
        assert_eq!(summary.files_skipped, 1);
        let skipped = report.skipped().collect::<Vec<_>>();
        assert_eq!(skipped.len(), 1);
        assert!(skipped[0].0.ends_with("b.dat"));
        assert!(temp.path().join("a [mia-fixed].dat").exists());
        assert!(temp.path().join("c [mia-fixed].dat").exists());
        assert!(!temp.path().join("b [mia-fixed].dat").exists());
    }

    #[test]
    fn second_run_produces_identical_output() {
        let temp = tempdir().expect("tempdir");
        write_file(
            &temp.path().join("a.dat"),
            &dat_with(&[("Example Game", Some("SLPS-12345"))]),
        );
        let output = temp.path().join("a [mia-fixed].dat");

        let mut source = MockSource::default().with_page(LIST_URL, TABLE_LIST);
        run(&single(), &mut source, &[temp.path().to_path_buf()]).expect("first run");
        let first = fs::read_to_string(&output).expect("first output");

        let report = run(&single(), &mut source, &[temp.path().to_path_buf()]).expect("second run");
        assert_eq!(report.previously_tagged.len(), 1);
        assert_eq!(fs::read_to_string(&output).expect("second output"), first);

        // Feeding the tagged file back in directly is a no-op.
        fs::rename(&output, temp.path().join("tagged.dat")).expect("rename");
        let report = run(&single(), &mut source, &[temp.path().join("tagged.dat")]).expect("third run");
        assert!(matches!(report.files[0].outcome, FileOutcome::Unchanged { .. }));
        assert_eq!(report.summary().records_already_tagged, 1);
    }

    #[test]
    fn index_mode_routes_each_dat_to_its_system_list() {
        let temp = tempdir().expect("tempdir");
        let ps1 = temp.path().join("Sony - PlayStation - Datfile (2) (2024-01-02 03-04-05).dat");
        let saturn = temp.path().join("Sega - Saturn - Datfile (1) (2024-01-02 03-04-05).dat");
        let unknown = temp.path().join("Nobody - Nothing - Datfile (1) (2024).dat");
        let three_do = temp.path().join("Panasonic - 3DO - Datfile (1) (2024).dat");
        let ps1_second = temp.path().join("fixdat_Sony - PlayStation - Datfile (1) (2024).dat");
        write_file(&ps1, &dat_with(&[("Example Game", None)]));
        write_file(&ps1_second, &dat_with(&[("Example Game", None)]));
        write_file(&saturn, &dat_with(&[("Saturn Game", None)]));
        write_file(&unknown, &dat_with(&[("Example Game", None)]));
        write_file(&three_do, &dat_with(&[("Example Game", None)]));

        let index = r#"
<h2><span class="mw-headline" id="Systems_with_MIAs">Systems with MIAs</span></h2>
<ul>
<li><a href="/index.php?title=PS1_MIA">Sony - PlayStation</a></li>
<li><a href="/index.php?title=Saturn_MIA">Sega - Saturn</a></li>
</ul>
<h2><span class="mw-headline" id="Systems_with_no_reported_MIAs">Systems with no reported MIAs</span></h2>
<ul><li>Panasonic - 3DO</li></ul>"#;
        let mut source = MockSource::default()
            .with_page(INDEX_URL, index)
            .with_page(LIST_URL, "<pre>\nExample Game\n</pre>");

        let report = run(
            &options(SourcePlan::Index {
                url: INDEX_URL.to_string(),
            }),
            &mut source,
            &[temp.path().to_path_buf()],
        )
        .expect("run");

        let outcome = |path: &PathBuf| {
            report
                .files
                .iter()
                .find(|file| &file.path == path)
                .map(|file| file.outcome.clone())
                .expect("file in report")
        };
        assert!(matches!(outcome(&ps1), FileOutcome::Written { .. }));
        assert!(matches!(outcome(&ps1_second), FileOutcome::Written { .. }));
        assert!(matches!(outcome(&saturn), FileOutcome::Skipped { .. }));
        assert!(matches!(outcome(&unknown), FileOutcome::NotListed { .. }));
        assert!(matches!(outcome(&three_do), FileOutcome::NotListed { .. }));

        // Index once, PS1 list once (cached for the fixdat), Saturn attempt once.
        assert_eq!(report.list_requests, 3);
        let summary = report.summary();
        assert_eq!(summary.files_modified, 2);
        assert_eq!(summary.files_skipped, 1);
        assert_eq!(summary.files_not_listed, 2);
    }

    #[test]
    fn system_names_follow_wiki_naming() {
        assert_eq!(
            system_name_for("Sony - PlayStation - Datfile (10784) (2024-01-02 03-04-05).dat"),
            "Sony - PlayStation"
        );
        assert_eq!(
            system_name_for("Sony - PlayStation - BIOS Datfile (13) (2024-01-02 03-04-05).dat"),
            "Sony - PlayStation - BIOS Images"
        );
        assert_eq!(
            system_name_for("fixdat_Sega - Mega CD & Sega CD - Datfile (1) (2024).dat"),
            "Sega - Mega CD & Sega CD"
        );
        assert_eq!(system_name_for("custom.dat"), "custom");
    }

    #[test]
    fn version_comparison_is_lexicographic_on_timestamps() {
        assert_eq!(
            compare_versions(Some("2024-01-01 00-00-00"), Some("2024-02-01 00-00-00")),
            VersionComparison::DatOutdated
        );
        assert_eq!(
            compare_versions(Some("2024-03-01 00-00-00"), Some("2024-02-01 00-00-00")),
            VersionComparison::ListOutdated
        );
        assert_eq!(compare_versions(Some("x"), Some("x")), VersionComparison::Match);
        assert_eq!(compare_versions(None, Some("x")), VersionComparison::Unknown);
    }
}
