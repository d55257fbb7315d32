//! Reader for the wiki-hosted MIA lists.
//!
//! Every assumption about how the wiki lays out its lists lives in this
//! module. Two page shapes are understood: a `<pre>` block with one disc per
//! line, and a table with a "Title" header column (optionally alongside a
//! serial column). The index page of all systems is parsed here too.

use std::collections::HashMap;

use serde::Serialize;
use tracing::debug;

use crate::error::{MiaError, Result};
use crate::markup::{
    element_span, find_first_tag, find_ignore_ascii_case, find_tag_start, read_tag, scan_tags_in,
    strip_tags,
};

const WITH_MIAS_ANCHOR: &str = "Systems_with_MIAs";
const NO_MIAS_ANCHOR: &str = "Systems_with_no_reported_MIAs";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MiaEntry {
    pub key: String,
    pub title: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MiaList {
    pub entries: Vec<MiaEntry>,
    /// The "DAT version" the list was checked against, when the page says.
    pub version: Option<String>,
}

impl MiaList {
    /// Timestamp inside the last parentheses of the version line,
    /// e.g. `2024-01-02 03-04-05` from `Sony - PlayStation (2024-01-02 03-04-05)`.
    pub fn timestamp(&self) -> Option<&str> {
        let version = self.version.as_deref()?;
        let open = version.rfind('(')?;
        let inner = version[open + 1..].trim_end().trim_end_matches(')').trim();
        if inner.is_empty() { None } else { Some(inner) }
    }
}

pub fn normalize_key(value: &str) -> String {
    value.trim().to_lowercase()
}

pub fn normalize_title(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// Lookup over a parsed list. Later rows replace earlier rows that normalize
/// to the same key.
#[derive(Debug, Clone, Default)]
pub struct MiaIndex {
    entries: Vec<MiaEntry>,
    by_key: HashMap<String, usize>,
    by_title: HashMap<String, usize>,
}

impl MiaIndex {
    pub fn new(entries: impl IntoIterator<Item = MiaEntry>) -> Self {
        let mut index = Self::default();
        for entry in entries {
            index.insert(entry);
        }
        index
    }

    fn insert(&mut self, entry: MiaEntry) {
        let key = normalize_key(&entry.key);
        let title = normalize_title(&entry.title);
        let slot = match self.by_key.get(&key) {
            Some(&slot) => {
                let previous_title = normalize_title(&self.entries[slot].title);
                if self.by_title.get(&previous_title) == Some(&slot) {
                    self.by_title.remove(&previous_title);
                }
                self.entries[slot] = entry;
                slot
            }
            None => {
                self.entries.push(entry);
                self.entries.len() - 1
            }
        };
        self.by_key.insert(key, slot);
        self.by_title.insert(title, slot);
    }

    pub fn by_key(&self, key: &str) -> Option<&MiaEntry> {
        self.by_key
            .get(&normalize_key(key))
            .map(|&slot| &self.entries[slot])
    }

    pub fn by_title(&self, title: &str) -> Option<&MiaEntry> {
        self.by_title
            .get(&normalize_title(title))
            .map(|&slot| &self.entries[slot])
    }

    pub fn entries(&self) -> &[MiaEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl From<&MiaList> for MiaIndex {
    fn from(list: &MiaList) -> Self {
        Self::new(list.entries.iter().cloned())
    }
}

/// Parse one MIA list page.
///
/// Rows that do not fit the expected shape are dropped. Only a page with
/// neither a `<pre>` block nor a title table is an error.
pub fn parse_mia_list(text: &str) -> Result<MiaList> {
    let version = find_version(text);

    if let Some(entries) = parse_preformatted(text) {
        debug!(entries = entries.len(), "parsed preformatted MIA list");
        return Ok(MiaList { entries, version });
    }
    if let Some(entries) = parse_title_table(text) {
        debug!(entries = entries.len(), "parsed tabular MIA list");
        return Ok(MiaList { entries, version });
    }
    Err(MiaError::Parse(
        "page has neither a <pre> disc list nor a table with a Title column".to_string(),
    ))
}

fn parse_preformatted(text: &str) -> Option<Vec<MiaEntry>> {
    let open = find_tag_start(text, "pre", 0, text.len())?;
    let span = element_span(text, open, "pre")?;
    let body = strip_tags(&text[span.inner_start..span.inner_end]);

    let mut entries = Vec::new();
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.split_once('\t').or_else(|| line.split_once(" | ")) {
            Some((title, key)) if !title.trim().is_empty() && !key.trim().is_empty() => {
                push_entries(&mut entries, title.trim(), Some(key.trim()));
            }
            _ => push_entries(&mut entries, line, None),
        }
    }
    Some(entries)
}

fn parse_title_table(text: &str) -> Option<Vec<MiaEntry>> {
    let mut search = 0usize;
    while let Some(open) = find_tag_start(text, "table", search, text.len()) {
        let span = element_span(text, open, "table")?;
        if let Some(entries) = read_table(text, span.inner_start, span.inner_end) {
            return Some(entries);
        }
        search = open + 1;
    }
    None
}

struct Cell {
    header: bool,
    text: String,
}

fn read_table(text: &str, from: usize, to: usize) -> Option<Vec<MiaEntry>> {
    let rows = table_rows(text, from, to);
    let header_at = rows.iter().position(|cells| {
        cells
            .iter()
            .any(|cell| cell.header && cell.text.to_lowercase().contains("title"))
    })?;

    let header = &rows[header_at];
    let title_column = header
        .iter()
        .position(|cell| cell.text.to_lowercase().contains("title"))?;
    let key_column = header.iter().position(|cell| is_key_header(&cell.text));

    let mut entries = Vec::new();
    for cells in &rows[header_at + 1..] {
        if cells.iter().all(|cell| cell.header) {
            continue;
        }
        let Some(title) = cells
            .get(title_column)
            .map(|cell| cell.text.trim())
            .filter(|title| !title.is_empty())
        else {
            continue;
        };
        let keys = key_column
            .and_then(|column| cells.get(column))
            .map(|cell| cell.text.trim())
            .filter(|key| !key.is_empty());
        push_entries(&mut entries, title, keys);
    }
    Some(entries)
}

fn is_key_header(text: &str) -> bool {
    let lower = text.trim().to_lowercase();
    lower.contains("serial") || lower.contains("catalog") || lower == "id" || lower.ends_with(" id")
}

fn table_rows(text: &str, from: usize, to: usize) -> Vec<Vec<Cell>> {
    let mut rows = Vec::new();
    let mut index = from;
    while let Some(open) = find_tag_start(text, "tr", index, to) {
        let Some(span) = element_span(text, open, "tr") else {
            break;
        };
        rows.push(row_cells(text, span.inner_start, span.inner_end));
        index = span.close_end;
    }
    rows
}

fn row_cells(text: &str, from: usize, to: usize) -> Vec<Cell> {
    let mut opens = scan_tags_in(text, "th", from, to)
        .into_iter()
        .map(|tag| (tag.start, true))
        .chain(
            scan_tags_in(text, "td", from, to)
                .into_iter()
                .map(|tag| (tag.start, false)),
        )
        .collect::<Vec<_>>();
    opens.sort_by_key(|(start, _)| *start);

    let mut cells = Vec::new();
    let mut consumed = from;
    for (start, header) in opens {
        if start < consumed {
            continue;
        }
        let name = if header { "th" } else { "td" };
        // Cells are often left unclosed in wiki output; end at the next cell.
        let (inner_start, inner_end, next) = match element_span(text, start, name) {
            Some(span) if span.close_end <= to => (span.inner_start, span.inner_end, span.close_end),
            _ => {
                let Some(tag) = read_tag(text, start, name) else {
                    continue;
                };
                let end = next_cell_start(text, tag.end + 1, to);
                (tag.end + 1, end, end)
            }
        };
        cells.push(Cell {
            header,
            text: collapse_whitespace(&strip_tags(&text[inner_start..inner_end])),
        });
        consumed = next;
    }
    cells
}

fn next_cell_start(text: &str, from: usize, to: usize) -> usize {
    find_first_tag(text, &["th", "td"], from, to).map_or(to, |(at, _)| at)
}

/// One entry per listed serial; a title with no serial keys itself.
fn push_entries(entries: &mut Vec<MiaEntry>, title: &str, keys: Option<&str>) {
    let title = collapse_whitespace(title);
    let mut pushed = false;
    for key in keys.unwrap_or_default().split([',', '\n']) {
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        entries.push(MiaEntry {
            key: key.to_string(),
            title: title.clone(),
        });
        pushed = true;
    }
    if !pushed {
        entries.push(MiaEntry {
            key: title.clone(),
            title,
        });
    }
}

fn collapse_whitespace(value: &str) -> String {
    value
        .split(|ch: char| ch.is_whitespace() || ch == '\u{a0}')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn find_version(text: &str) -> Option<String> {
    let plain = strip_tags(text);
    let at = find_ignore_ascii_case(&plain, "dat version", 0)?;
    let after = &plain[at + "dat version".len()..];
    let mut lines = after.lines();
    let same_line = lines
        .next()
        .unwrap_or_default()
        .trim_start_matches([':', ' ', '\t'])
        .trim();
    let value = if same_line.is_empty() {
        lines.map(str::trim).find(|line| !line.is_empty())?
    } else {
        same_line
    };
    Some(collapse_whitespace(value))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SystemCategory {
    WithMias,
    NoReportedMias,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SystemListing {
    pub name: String,
    pub category: SystemCategory,
    /// Raw href of the system's list page. `None` when the index names the
    /// system without linking a page (or only links a missing one).
    pub link: Option<String>,
}

/// Parse the index page that links one MIA list per system.
pub fn parse_system_index(html: &str) -> Result<Vec<SystemListing>> {
    let with = section_items(html, WITH_MIAS_ANCHOR, SystemCategory::WithMias);
    let without = section_items(html, NO_MIAS_ANCHOR, SystemCategory::NoReportedMias);
    if with.is_none() && without.is_none() {
        return Err(MiaError::Parse(format!(
            "index page has no `{WITH_MIAS_ANCHOR}` or `{NO_MIAS_ANCHOR}` section"
        )));
    }
    let systems = with
        .into_iter()
        .flatten()
        .chain(without.into_iter().flatten())
        .collect::<Vec<_>>();
    debug!(systems = systems.len(), "parsed MIA system index");
    Ok(systems)
}

fn section_items(html: &str, anchor: &str, category: SystemCategory) -> Option<Vec<SystemListing>> {
    let anchor_at = find_ignore_ascii_case(html, &format!("id=\"{anchor}\""), 0)?;
    let next_heading = find_tag_start(html, "h2", anchor_at, html.len()).unwrap_or(html.len());
    let heading_close = find_ignore_ascii_case(html, "</h2>", anchor_at).unwrap_or(anchor_at);

    let mut items = Vec::new();
    let Some(list_open) = find_tag_start(html, "ul", heading_close, next_heading) else {
        return Some(items);
    };
    let list = element_span(html, list_open, "ul")?;

    let mut index = list.inner_start;
    while let Some(open) = find_tag_start(html, "li", index, list.inner_end) {
        let item_end = match element_span(html, open, "li") {
            Some(span) if span.close_end <= list.inner_end => span.inner_end,
            _ => find_tag_start(html, "li", open + 1, list.inner_end).unwrap_or(list.inner_end),
        };
        let Some(tag) = read_tag(html, open, "li") else {
            break;
        };
        let inner = &html[tag.end + 1..item_end];
        let name = collapse_whitespace(&strip_tags(inner));
        if !name.is_empty() {
            let link = scan_tags_in(inner, "a", 0, inner.len())
                .into_iter()
                .next()
                .filter(|anchor| !is_missing_page_link(anchor.attr("href"), anchor.attr("class")))
                .and_then(|anchor| anchor.attr("href").map(ToString::to_string));
            items.push(SystemListing {
                name,
                category,
                link,
            });
        }
        index = item_end;
    }
    Some(items)
}

fn is_missing_page_link(href: Option<&str>, class: Option<&str>) -> bool {
    let Some(href) = href.map(str::trim).filter(|href| !href.is_empty()) else {
        return true;
    };
    href.contains("redlink=1")
        || class.is_some_and(|class| class.split_whitespace().any(|item| item == "new"))
}
