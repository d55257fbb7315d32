use std::fs;
use std::path::PathBuf;

use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Replacement {
    pub original: PathBuf,
    pub written: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplaceFailure {
    pub original: PathBuf,
    pub written: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplaceReport {
    pub replaced: Vec<PathBuf>,
    pub failed: Vec<ReplaceFailure>,
}

impl ReplaceReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Move each tagged file over its original.
///
/// Pairs are independent: a failed pair leaves both of its files where they
/// were and the rest are still attempted. Re-running with the same plan
/// only retries pairs whose tagged file is still present.
pub fn apply_replacements(plan: &[Replacement]) -> ReplaceReport {
    let mut report = ReplaceReport::default();
    for pair in plan {
        let outcome = if !pair.written.is_file() {
            Err(format!("tagged file {} is missing", pair.written.display()))
        } else {
            fs::rename(&pair.written, &pair.original).map_err(|error| error.to_string())
        };
        match outcome {
            Ok(()) => {
                info!(file = %pair.original.display(), "replaced original");
                report.replaced.push(pair.original.clone());
            }
            Err(reason) => {
                warn!(file = %pair.original.display(), %reason, "failed to replace original");
                report.failed.push(ReplaceFailure {
                    original: pair.original.clone(),
                    written: pair.written.clone(),
                    reason,
                });
            }
        }
    }
    report
}
