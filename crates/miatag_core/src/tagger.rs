use std::collections::HashSet;

use serde::Serialize;
use tracing::debug;

use crate::dat::{DatFile, DatRecord, MiaMark};
use crate::mialist::{MiaEntry, MiaIndex, normalize_key, normalize_title};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome<'a> {
    Serial(&'a MiaEntry),
    Title(&'a MiaEntry),
    NoMatch,
}

impl<'a> MatchOutcome<'a> {
    pub fn entry(self) -> Option<&'a MiaEntry> {
        match self {
            Self::Serial(entry) | Self::Title(entry) => Some(entry),
            Self::NoMatch => None,
        }
    }
}

/// Serial first, then title. Serials are tried in the record's own order,
/// so the outcome never depends on how the index was filled.
pub fn match_record<'a>(record: &DatRecord, index: &'a MiaIndex) -> MatchOutcome<'a> {
    if let Some(entry) = record.serials.iter().find_map(|serial| index.by_key(serial)) {
        return MatchOutcome::Serial(entry);
    }
    if record.name.trim().is_empty() {
        return MatchOutcome::NoMatch;
    }
    match index.by_title(&record.name).or_else(|| index.by_key(&record.name)) {
        Some(entry) => MatchOutcome::Title(entry),
        None => MatchOutcome::NoMatch,
    }
}

/// Mark every data rom of a matching record. Returns whether anything
/// changed; an already-tagged record is left as it is.
pub fn tag_record(record: &mut DatRecord, index: &MiaIndex) -> bool {
    if match_record(record, index) == MatchOutcome::NoMatch {
        return false;
    }
    mark_data_roms(record)
}

fn mark_data_roms(record: &mut DatRecord) -> bool {
    let mut changed = false;
    for rom in record.roms.iter_mut().filter(|rom| !rom.is_sheet()) {
        if rom.mia == MiaMark::Absent {
            rom.mia = MiaMark::Added;
            changed = true;
        }
    }
    changed
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TagStats {
    /// Records that matched an entry, tagged now or earlier.
    pub matched: usize,
    pub by_serial: usize,
    pub by_title: usize,
    /// Records modified in this pass.
    pub tagged: usize,
    pub already_tagged: usize,
    /// Matched records with only cue sheets, or no roms, to mark.
    pub without_data: usize,
    /// Entries that no record in the file matched.
    pub unmatched: Vec<MiaEntry>,
}

pub fn tag_file(file: &mut DatFile, index: &MiaIndex) -> TagStats {
    let mut stats = TagStats::default();
    let mut hit_keys = HashSet::new();
    // A row listing several serials yields one entry per serial, all sharing
    // the title; a title match covers every one of them.
    let mut hit_titles = HashSet::new();

    for record in &mut file.records {
        let outcome = match_record(record, index);
        let Some(entry) = outcome.entry() else {
            continue;
        };
        stats.matched += 1;
        match outcome {
            MatchOutcome::Serial(_) => stats.by_serial += 1,
            _ => {
                stats.by_title += 1;
                hit_titles.insert(normalize_title(&entry.title));
            }
        }
        hit_keys.insert(normalize_key(&entry.key));

        if mark_data_roms(record) {
            stats.tagged += 1;
            debug!(disc = %record.name, "tagged MIA");
        } else if record.is_tagged() {
            stats.already_tagged += 1;
            debug!(disc = %record.name, "already tagged");
        } else {
            stats.without_data += 1;
            debug!(disc = %record.name, "matched but has no data roms");
        }
    }

    stats.unmatched = index
        .entries()
        .iter()
        .filter(|entry| {
            !hit_keys.contains(&normalize_key(&entry.key))
                && !hit_titles.contains(&normalize_title(&entry.title))
        })
        .cloned()
        .collect();
    for entry in &stats.unmatched {
        debug!(disc = %entry.title, "MIA entry not found in DAT");
    }
    stats
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{MatchOutcome, match_record, tag_file, tag_record};
    use crate::dat::{DatFile, MiaMark, parse_dat_str};
    use crate::mialist::{MiaEntry, MiaIndex};

    const DAT: &str = r#"<datafile>
<game name="Example Game"><serial>slps-12345</serial><rom name="Example Game.cue"/><rom name="Example Game.bin"/></game>
<game name="Other Game"><rom name="Other Game.bin"/></game>
<game name="Title Only (Japan)"><rom name="t1.bin"/><rom name="t2.bin"/></game>
</datafile>"#;

    fn dat() -> DatFile {
        parse_dat_str(Path::new("x.dat"), DAT.to_string()).expect("parse")
    }

    fn entry(key: &str, title: &str) -> MiaEntry {
        MiaEntry {
            key: key.to_string(),
            title: title.to_string(),
        }
    }

    #[test]
    fn serial_match_tags_only_that_record() {
        let index = MiaIndex::new([entry("SLPS-12345", "Example Game")]);
        let mut file = dat();
        let stats = tag_file(&mut file, &index);

        assert_eq!(stats.tagged, 1);
        assert_eq!(stats.by_serial, 1);
        assert!(stats.unmatched.is_empty());
        let example = &file.records[0];
        assert_eq!(example.roms[0].mia, MiaMark::Absent);
        assert_eq!(example.roms[1].mia, MiaMark::Added);
        assert!(file.records[1].roms.iter().all(|rom| rom.mia == MiaMark::Absent));
        assert!(file.records[2].roms.iter().all(|rom| rom.mia == MiaMark::Absent));
    }

    #[test]
    fn serial_outranks_title() {
        let index = MiaIndex::new([
            entry("Example Game", "Example Game"),
            entry(" SLPS-12345 ", "Renamed Upstream"),
        ]);
        let file = dat();
        match match_record(&file.records[0], &index) {
            MatchOutcome::Serial(found) => assert_eq!(found.title, "Renamed Upstream"),
            other => panic!("expected serial match, got {other:?}"),
        }
    }

    #[test]
    fn title_match_is_case_and_space_insensitive() {
        let index = MiaIndex::new([entry("title only  (JAPAN)", "title only  (JAPAN)")]);
        let mut file = dat();
        assert!(matches!(match_record(&file.records[2], &index), MatchOutcome::Title(_)));
        assert!(tag_record(&mut file.records[2], &index));
        assert!(file.records[2].roms.iter().all(|rom| rom.mia == MiaMark::Added));
    }

    #[test]
    fn match_outcome_ignores_insertion_order() {
        let forward = MiaIndex::new([entry("A-1", "Other Game"), entry("SLPS-12345", "Example Game")]);
        let backward = MiaIndex::new([entry("SLPS-12345", "Example Game"), entry("A-1", "Other Game")]);
        let file = dat();
        for record in &file.records {
            assert_eq!(
                match_record(record, &forward).entry().map(|e| e.key.clone()),
                match_record(record, &backward).entry().map(|e| e.key.clone())
            );
        }
    }

    #[test]
    fn tagging_twice_changes_nothing_the_second_time() {
        let index = MiaIndex::new([entry("Other Game", "Other Game")]);
        let mut file = dat();
        assert!(tag_record(&mut file.records[1], &index));
        let once = file.render();
        assert!(!tag_record(&mut file.records[1], &index));
        assert_eq!(file.render(), once);

        let mut reparsed = parse_dat_str(Path::new("x.dat"), once.clone()).expect("reparse");
        let stats = tag_file(&mut reparsed, &index);
        assert_eq!(stats.tagged, 0);
        assert_eq!(stats.already_tagged, 1);
        assert!(!reparsed.is_modified());
        assert_eq!(reparsed.render(), once);
    }

    #[test]
    fn unmatched_entries_are_reported() {
        let index = MiaIndex::new([entry("Missing Disc", "Missing Disc"), entry("Other Game", "Other Game")]);
        let mut file = dat();
        let stats = tag_file(&mut file, &index);
        assert_eq!(stats.matched, 1);
        assert_eq!(stats.unmatched, vec![entry("Missing Disc", "Missing Disc")]);
    }

    #[test]
    fn title_match_covers_every_serial_of_a_row() {
        let index = MiaIndex::new([
            entry("SLUS-1", "Twin Pack"),
            entry("SLUS-2", "Twin Pack"),
            entry("SLUS-3", "Missing Disc"),
        ]);
        let mut file = parse_dat_str(
            Path::new("x.dat"),
            r#"<datafile><game name="Twin Pack"><rom name="t.bin"/></game></datafile>"#.to_string(),
        )
        .expect("parse");
        let stats = tag_file(&mut file, &index);
        assert_eq!(stats.tagged, 1);
        assert_eq!(stats.unmatched, vec![entry("SLUS-3", "Missing Disc")]);
    }

    #[test]
    fn records_without_data_roms_are_not_counted_as_tagged() {
        let index = MiaIndex::new([entry("Sheet Only", "Sheet Only"), entry("Empty", "Empty")]);
        let mut file = parse_dat_str(
            Path::new("x.dat"),
            r#"<datafile><game name="Sheet Only"><rom name="s.cue"/></game><game name="Empty"></game></datafile>"#
                .to_string(),
        )
        .expect("parse");
        let stats = tag_file(&mut file, &index);
        assert_eq!(stats.matched, 2);
        assert_eq!(stats.tagged, 0);
        assert_eq!(stats.already_tagged, 0);
        assert_eq!(stats.without_data, 2);
        assert!(!file.is_modified());
    }

    #[test]
    fn unmatched_record_is_left_alone() {
        let index = MiaIndex::new([entry("Nope", "Nope")]);
        let mut file = dat();
        assert!(!tag_record(&mut file.records[0], &index));
        assert_eq!(file.render(), DAT);
    }
}
