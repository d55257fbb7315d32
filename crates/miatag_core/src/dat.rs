//! Logiqx-style DAT catalogs (`<datafile>` / `<game>` / `<rom>`).
//!
//! A [`DatFile`] keeps the file's original text. Tagging only records where
//! `mia="yes"` must be inserted, and [`DatFile::render`] splices those
//! attributes into the original bytes. Everything else, including comments,
//! DOCTYPE, attribute order, quoting and indentation, is written back
//! unchanged.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{MiaError, Result};
use crate::markup::{
    TagMatch, element_span, find_first_tag, find_tag_start, read_tag, scan_tags_in, strip_tags,
};

pub const MIA_ATTRIBUTE: &str = "mia";
pub const MIA_VALUE: &str = "yes";
const RECORD_TAGS: [&str; 2] = ["game", "machine"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatHeader {
    pub name: Option<String>,
    pub description: Option<String>,
    pub version: Option<String>,
}

/// MIA state of one rom entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiaMark {
    Absent,
    /// `mia="yes"` was already in the file.
    Present,
    /// A `mia` attribute with some other value is in the file. It is left
    /// alone since a second `mia` attribute would be malformed XML.
    Other,
    /// Added during this run; emitted by `render`.
    Added,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatRom {
    pub name: String,
    pub attributes: BTreeMap<String, String>,
    pub mia: MiaMark,
    insert_at: usize,
}

impl DatRom {
    /// Cue sheets describe a disc's layout and are never the missing data.
    pub fn is_sheet(&self) -> bool {
        self.name.to_ascii_lowercase().ends_with(".cue")
    }

    pub fn is_mia(&self) -> bool {
        matches!(self.mia, MiaMark::Present | MiaMark::Added)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatRecord {
    pub name: String,
    pub serials: Vec<String>,
    pub roms: Vec<DatRom>,
}

impl DatRecord {
    /// Roms that carry disc data, i.e. everything but cue sheets.
    pub fn data_roms(&self) -> impl Iterator<Item = &DatRom> {
        self.roms.iter().filter(|rom| !rom.is_sheet())
    }

    pub fn is_tagged(&self) -> bool {
        let mut data = self.data_roms().peekable();
        data.peek().is_some() && data.all(|rom| rom.is_mia() || rom.mia == MiaMark::Other)
    }
}

#[derive(Debug, Clone)]
pub struct DatFile {
    pub path: PathBuf,
    pub header: DatHeader,
    pub records: Vec<DatRecord>,
    source: String,
}

impl DatFile {
    pub fn is_modified(&self) -> bool {
        self.records
            .iter()
            .flat_map(|record| &record.roms)
            .any(|rom| rom.mia == MiaMark::Added)
    }

    /// The header version as a comparable timestamp. Custom DATs use `:` in
    /// times where the wiki uses `-`.
    pub fn timestamp(&self) -> Option<String> {
        self.header
            .version
            .as_deref()
            .map(|version| version.trim().replace(':', "-"))
            .filter(|version| !version.is_empty())
    }

    pub fn render(&self) -> String {
        let mut inserts = self
            .records
            .iter()
            .flat_map(|record| &record.roms)
            .filter(|rom| rom.mia == MiaMark::Added)
            .map(|rom| rom.insert_at)
            .collect::<Vec<_>>();
        inserts.sort_unstable();

        let attribute = format!(" {MIA_ATTRIBUTE}=\"{MIA_VALUE}\"");
        let mut output = String::with_capacity(self.source.len() + inserts.len() * attribute.len());
        let mut cursor = 0usize;
        for at in inserts {
            output.push_str(&self.source[cursor..at]);
            output.push_str(&attribute);
            cursor = at;
        }
        output.push_str(&self.source[cursor..]);
        output
    }
}

pub fn parse_dat(path: &Path) -> Result<DatFile> {
    let bytes = fs::read(path).map_err(|error| MiaError::io(path, error))?;
    let text = String::from_utf8(bytes).map_err(|_| MiaError::CatalogFormat {
        path: path.to_path_buf(),
        reason: "file is not valid UTF-8".to_string(),
    })?;
    parse_dat_str(path, text)
}

pub fn parse_dat_str(path: &Path, text: String) -> Result<DatFile> {
    let format_error = |reason: &str| MiaError::CatalogFormat {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    let root_open =
        find_tag_start(&text, "datafile", 0, text.len()).ok_or_else(|| format_error("missing <datafile> root element"))?;
    let root = element_span(&text, root_open, "datafile")
        .ok_or_else(|| format_error("unterminated <datafile> element"))?;

    let header = match find_tag_start(&text, "header", root.inner_start, root.inner_end) {
        Some(open) => {
            let span = element_span(&text, open, "header")
                .ok_or_else(|| format_error("unterminated <header> element"))?;
            DatHeader {
                name: child_text(&text, span.inner_start, span.inner_end, "name"),
                description: child_text(&text, span.inner_start, span.inner_end, "description"),
                version: child_text(&text, span.inner_start, span.inner_end, "version"),
            }
        }
        None => DatHeader::default(),
    };

    let mut records = Vec::new();
    let mut index = root.inner_start;
    while let Some((open, tag_name)) = find_first_tag(&text, &RECORD_TAGS, index, root.inner_end) {
        let tag = read_tag(&text, open, tag_name)
            .ok_or_else(|| format_error("unterminated record tag"))?;
        let span = element_span(&text, open, tag_name)
            .ok_or_else(|| format_error(&format!("unterminated <{tag_name}> element")))?;
        records.push(read_record(&text, &tag, span.inner_start, span.inner_end));
        index = span.close_end;
    }

    Ok(DatFile {
        path: path.to_path_buf(),
        header,
        records,
        source: text,
    })
}

fn read_record(text: &str, tag: &TagMatch, inner_start: usize, inner_end: usize) -> DatRecord {
    let mut serials = Vec::new();
    if let Some(value) = tag.attr("serial") {
        push_serials(&mut serials, value);
    }
    for serial in scan_tags_in(text, "serial", inner_start, inner_end) {
        if let Some(span) = element_span(text, serial.start, "serial") {
            push_serials(&mut serials, &strip_tags(&text[span.inner_start..span.inner_end]));
        }
    }

    let roms = scan_tags_in(text, "rom", inner_start, inner_end)
        .into_iter()
        .map(|rom| {
            let mia = match rom.attr(MIA_ATTRIBUTE) {
                None => MiaMark::Absent,
                Some(value) if value.trim().eq_ignore_ascii_case(MIA_VALUE) => MiaMark::Present,
                Some(_) => MiaMark::Other,
            };
            DatRom {
                name: rom.attr("name").unwrap_or_default().to_string(),
                insert_at: rom.insertion_point(text),
                mia,
                attributes: rom.attrs,
            }
        })
        .collect();

    DatRecord {
        name: tag.attr("name").unwrap_or_default().to_string(),
        serials,
        roms,
    }
}

fn push_serials(serials: &mut Vec<String>, value: &str) {
    for serial in value.split(',') {
        let serial = serial.trim();
        if !serial.is_empty() && !serials.iter().any(|known| known == serial) {
            serials.push(serial.to_string());
        }
    }
}

fn child_text(text: &str, from: usize, to: usize, tag_name: &str) -> Option<String> {
    let open = find_tag_start(text, tag_name, from, to)?;
    let span = element_span(text, open, tag_name)?;
    let value = strip_tags(&text[span.inner_start..span.inner_end]).trim().to_string();
    if value.is_empty() { None } else { Some(value) }
}

/// Serialize `file` to `target`. Whether `target` is a fresh path or the
/// original is the caller's decision.
pub fn write_dat(file: &DatFile, target: &Path) -> Result<()> {
    fs::write(target, file.render()).map_err(|error| MiaError::io(target, error))
}

/// `<dir>/<stem><suffix>.<ext>` next to the original.
pub fn output_path_for(original: &Path, suffix: &str) -> PathBuf {
    let stem = original
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_default();
    let file_name = match original.extension() {
        Some(ext) => format!("{stem}{suffix}.{}", ext.to_string_lossy()),
        None => format!("{stem}{suffix}"),
    };
    original.with_file_name(file_name)
}
