use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::MiaConfig;
use crate::error::MiaError;

#[derive(Debug, Clone)]
pub struct LocateOptions {
    /// Catalog extension without the dot, compared case-insensitively.
    pub extension: String,
    /// Stem suffix marking files written by an earlier run.
    pub output_suffix: Option<String>,
}

impl Default for LocateOptions {
    fn default() -> Self {
        Self {
            extension: crate::config::DEFAULT_EXTENSION.to_string(),
            output_suffix: Some(crate::config::DEFAULT_SUFFIX.to_string()),
        }
    }
}

impl LocateOptions {
    pub fn from_config(config: &MiaConfig) -> Self {
        Self {
            extension: config.extension().to_string(),
            output_suffix: Some(config.suffix().to_string()),
        }
    }
}

#[derive(Debug, Default)]
pub struct Located {
    pub files: Vec<PathBuf>,
    /// Outputs of a previous run that were left alone.
    pub previously_tagged: Vec<PathBuf>,
    pub warnings: Vec<MiaError>,
}

/// Expand input files and directories into catalog file paths.
///
/// Directories are walked to any depth with entries sorted by name, and the
/// result keeps first-seen order across inputs with duplicates removed.
/// Symlinks are followed; a link back to an ancestor is reported as a
/// warning instead of being descended into.
pub fn locate_dat_files(inputs: &[PathBuf], options: &LocateOptions) -> Located {
    let mut located = Located::default();
    let mut seen = HashSet::new();

    for input in inputs {
        if input.is_dir() {
            walk_directory(input, options, &mut seen, &mut located);
        } else if input.is_file() {
            if has_extension(input, &options.extension) {
                accept(input, options, &mut seen, &mut located);
            } else {
                debug!(path = %input.display(), "ignoring non-catalog input file");
            }
        } else {
            warn!(path = %input.display(), "input is neither a file nor a directory");
            located.warnings.push(MiaError::Path {
                path: input.clone(),
                reason: "not a file or directory".to_string(),
            });
        }
    }

    located
}

fn walk_directory(
    root: &Path,
    options: &LocateOptions,
    seen: &mut HashSet<PathBuf>,
    located: &mut Located,
) {
    let walker = WalkDir::new(root)
        .follow_links(true)
        .sort_by(|left, right| left.file_name().cmp(right.file_name()));
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(error) => {
                let path = error
                    .path()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| root.to_path_buf());
                let reason = match error.loop_ancestor() {
                    Some(ancestor) => format!("symlink loop back to {}", ancestor.display()),
                    None => error.to_string(),
                };
                warn!(path = %path.display(), %reason, "skipping unreadable path");
                located.warnings.push(MiaError::Path { path, reason });
                continue;
            }
        };
        if !entry.file_type().is_file() || !has_extension(entry.path(), &options.extension) {
            continue;
        }
        accept(entry.path(), options, seen, located);
    }
}

fn accept(path: &Path, options: &LocateOptions, seen: &mut HashSet<PathBuf>, located: &mut Located) {
    let identity = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    if !seen.insert(identity) {
        return;
    }
    if is_previous_output(path, options.output_suffix.as_deref()) {
        debug!(path = %path.display(), "already tagged by an earlier run");
        located.previously_tagged.push(path.to_path_buf());
        return;
    }
    located.files.push(path.to_path_buf());
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(extension))
}

fn is_previous_output(path: &Path, suffix: Option<&str>) -> bool {
    let Some(suffix) = suffix.filter(|suffix| !suffix.is_empty()) else {
        return false;
    };
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .is_some_and(|stem| stem.ends_with(suffix))
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};

    use tempfile::tempdir;

    use super::{LocateOptions, locate_dat_files};
    use crate::error::MiaError;

    fn write_file(path: &Path) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent dir");
        }
        fs::write(path, "<datafile/>").expect("write file");
    }

    fn names(paths: &[PathBuf]) -> Vec<String> {
        paths
            .iter()
            .map(|path| path.file_name().unwrap_or_default().to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn directory_walk_finds_catalogs_at_any_depth() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        write_file(&root.join("a.dat"));
        write_file(&root.join("nested/b.DAT"));
        write_file(&root.join("nested/deeper/still/c.dat"));
        write_file(&root.join("readme.txt"));
        write_file(&root.join("nested/cover.png"));

        let located = locate_dat_files(&[root.to_path_buf()], &LocateOptions::default());
        assert_eq!(names(&located.files), vec!["a.dat", "b.DAT", "c.dat"]);
        assert!(located.warnings.is_empty());
    }

    #[test]
    fn mixed_inputs_are_deduplicated_in_first_seen_order() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        write_file(&root.join("dir/x.dat"));
        write_file(&root.join("dir/y.dat"));
        write_file(&root.join("z.dat"));
        write_file(&root.join("notes.txt"));

        let inputs = vec![
            root.join("z.dat"),
            root.join("dir"),
            root.join("dir/x.dat"),
            root.join("notes.txt"),
        ];
        let located = locate_dat_files(&inputs, &LocateOptions::default());
        assert_eq!(names(&located.files), vec!["z.dat", "x.dat", "y.dat"]);
    }

    #[test]
    fn missing_input_is_a_warning() {
        let temp = tempdir().expect("tempdir");
        write_file(&temp.path().join("ok.dat"));
        let inputs = vec![temp.path().join("missing"), temp.path().join("ok.dat")];

        let located = locate_dat_files(&inputs, &LocateOptions::default());
        assert_eq!(names(&located.files), vec!["ok.dat"]);
        assert_eq!(located.warnings.len(), 1);
        assert!(matches!(located.warnings[0], MiaError::Path { .. }));
    }

    #[test]
    fn previous_outputs_are_not_reprocessed() {
        let temp = tempdir().expect("tempdir");
        write_file(&temp.path().join("Sony - PlayStation - Datfile (1) (2024).dat"));
        write_file(&temp.path().join("Sony - PlayStation - Datfile (1) (2024) [mia-fixed].dat"));

        let located = locate_dat_files(&[temp.path().to_path_buf()], &LocateOptions::default());
        assert_eq!(located.files.len(), 1);
        assert_eq!(located.previously_tagged.len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn symlink_cycle_is_reported_not_followed_forever() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("root");
        write_file(&root.join("inner/a.dat"));
        std::os::unix::fs::symlink(&root, root.join("inner/back")).expect("symlink");

        let located = locate_dat_files(&[root.clone()], &LocateOptions::default());
        assert_eq!(names(&located.files), vec!["a.dat"]);
        assert_eq!(located.warnings.len(), 1);
        assert!(located.warnings[0].to_string().contains("symlink loop"));
    }
}
