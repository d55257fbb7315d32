//! Minimal tag scanner shared by the wiki (HTML) and DAT (XML) readers.
//!
//! Nothing here builds a tree. Callers get byte offsets into the original
//! text, which is what lets the DAT writer splice attributes without
//! disturbing anything else in the file.

use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TagMatch {
    /// Offset of the opening `<`.
    pub start: usize,
    /// Offset of the closing `>`.
    pub end: usize,
    pub self_closing: bool,
    pub attrs: BTreeMap<String, String>,
}

impl TagMatch {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    /// Offset where a new attribute can be inserted: just before `/>` or `>`.
    pub fn insertion_point(&self, text: &str) -> usize {
        let bytes = text.as_bytes();
        let mut at = self.end;
        if self.self_closing && at > self.start && bytes[at - 1] == b'/' {
            at -= 1;
        }
        while at > self.start && bytes[at - 1].is_ascii_whitespace() {
            at -= 1;
        }
        at
    }
}

/// Byte range of an element's content, between its start and end tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ElementSpan {
    pub open: usize,
    pub inner_start: usize,
    pub inner_end: usize,
    /// Offset one past the closing tag's `>`.
    pub close_end: usize,
}

/// Every `name` start tag opening inside `from..to`.
pub(crate) fn scan_tags_in(text: &str, tag_name: &str, from: usize, to: usize) -> Vec<TagMatch> {
    let mut tags = Vec::new();
    let mut index = from;
    while let Some(at) = find_tag_start(text, tag_name, index, to) {
        let Some(tag) = read_tag(text, at, tag_name) else {
            break;
        };
        index = tag.end + 1;
        tags.push(tag);
    }
    tags
}

pub(crate) fn read_tag(text: &str, at: usize, tag_name: &str) -> Option<TagMatch> {
    let name = open_tag_name(text, at).filter(|name| name.eq_ignore_ascii_case(tag_name))?;
    let end = tag_end(text, at)?;
    let body = &text[at + 1 + name.len()..end];
    Some(TagMatch {
        start: at,
        end,
        self_closing: body.trim_end().ends_with('/'),
        attrs: parse_attributes(body),
    })
}

/// Locate the element opened at `open` and its matching close tag, counting
/// nested elements of the same name.
pub(crate) fn element_span(text: &str, open: usize, tag_name: &str) -> Option<ElementSpan> {
    let tag = read_tag(text, open, tag_name)?;
    let inner_start = tag.end + 1;
    if tag.self_closing {
        return Some(ElementSpan {
            open,
            inner_start,
            inner_end: inner_start,
            close_end: inner_start,
        });
    }

    let mut depth = 1usize;
    let mut resume = inner_start;
    for at in markup_starts(text, inner_start, text.len()) {
        if at < resume {
            continue;
        }
        if close_tag_name(text, at).is_some_and(|name| name.eq_ignore_ascii_case(tag_name)) {
            let close = tag_end(text, at)?;
            depth -= 1;
            if depth == 0 {
                return Some(ElementSpan {
                    open,
                    inner_start,
                    inner_end: at,
                    close_end: close + 1,
                });
            }
            resume = close + 1;
        } else if open_tag_name(text, at).is_some_and(|name| name.eq_ignore_ascii_case(tag_name)) {
            let nested = read_tag(text, at, tag_name)?;
            if !nested.self_closing {
                depth += 1;
            }
            resume = nested.end + 1;
        }
    }
    None
}

/// First start tag named `tag_name` that opens inside `from..to`.
pub(crate) fn find_tag_start(text: &str, tag_name: &str, from: usize, to: usize) -> Option<usize> {
    find_first_tag(text, &[tag_name], from, to).map(|(at, _)| at)
}

/// First start tag inside `from..to` whose name is any of `names`, in one
/// forward pass.
pub(crate) fn find_first_tag<'n>(
    text: &str,
    names: &[&'n str],
    from: usize,
    to: usize,
) -> Option<(usize, &'n str)> {
    markup_starts(text, from, to).find_map(|at| {
        let found = open_tag_name(text, at)?;
        names
            .iter()
            .find(|name| name.eq_ignore_ascii_case(found))
            .map(|name| (at, *name))
    })
}

/// Offsets of each `<` in `from..to`, skipping over comments.
fn markup_starts(text: &str, from: usize, to: usize) -> impl Iterator<Item = usize> + '_ {
    let to = to.min(text.len());
    let mut index = from;
    std::iter::from_fn(move || {
        while index < to {
            let at = index + text[index..to].find('<')?;
            if let Some(comment) = text[at..].strip_prefix("<!--") {
                index = comment.find("-->").map_or(text.len(), |end| at + 4 + end + 3);
                continue;
            }
            index = at + 1;
            return Some(at);
        }
        None
    })
}

fn open_tag_name(text: &str, at: usize) -> Option<&str> {
    let rest = text.get(at..)?.strip_prefix('<')?;
    let len = element_name_len(rest);
    (len > 0).then(|| &rest[..len])
}

fn close_tag_name(text: &str, at: usize) -> Option<&str> {
    let rest = text.get(at..)?.strip_prefix("</")?;
    let len = element_name_len(rest);
    (len > 0).then(|| &rest[..len])
}

fn element_name_len(rest: &str) -> usize {
    let bytes = rest.as_bytes();
    if !bytes.first().is_some_and(u8::is_ascii_alphabetic) {
        return 0;
    }
    bytes
        .iter()
        .take_while(|byte| byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b':' | b'.'))
        .count()
}

/// Offset of the `>` closing the tag that starts at `at`. A `>` inside a
/// quoted attribute value does not count.
fn tag_end(text: &str, at: usize) -> Option<usize> {
    let mut quote = None::<u8>;
    let offset = text.as_bytes().get(at..)?.iter().position(|&byte| match quote {
        Some(open) => {
            if byte == open {
                quote = None;
            }
            false
        }
        None if byte == b'"' || byte == b'\'' => {
            quote = Some(byte);
            false
        }
        None => byte == b'>',
    })?;
    Some(at + offset)
}

/// Attributes from the part of a start tag after its name. Names are
/// lowercased; values are entity-decoded, and a bare name maps to "".
fn parse_attributes(body: &str) -> BTreeMap<String, String> {
    let mut attrs = BTreeMap::new();
    let mut rest = body;
    loop {
        rest = rest.trim_start_matches(|ch: char| ch.is_whitespace() || ch == '/');
        if rest.is_empty() {
            break;
        }
        let name_len = rest
            .find(|ch: char| ch.is_whitespace() || ch == '=' || ch == '/')
            .unwrap_or(rest.len());
        if name_len == 0 {
            rest = &rest[1..];
            continue;
        }
        let name = rest[..name_len].to_ascii_lowercase();
        rest = rest[name_len..].trim_start();

        let value = match rest.strip_prefix('=') {
            Some(after) => {
                let (value, remaining) = split_attribute_value(after.trim_start());
                rest = remaining;
                decode_entities(value)
            }
            None => String::new(),
        };
        attrs.insert(name, value);
    }
    attrs
}

fn split_attribute_value(input: &str) -> (&str, &str) {
    match input.chars().next() {
        Some(quote @ ('"' | '\'')) => {
            let inner = &input[1..];
            match inner.find(quote) {
                Some(end) => (&inner[..end], &inner[end + 1..]),
                None => (inner, ""),
            }
        }
        _ => {
            let end = input.find(char::is_whitespace).unwrap_or(input.len());
            input.split_at(end)
        }
    }
}

/// Text content of a markup fragment: tags dropped, entities decoded,
/// whitespace left as-is. `<br>` becomes a newline.
pub(crate) fn strip_tags(fragment: &str) -> String {
    let mut output = String::with_capacity(fragment.len());
    let mut rest = fragment;
    while let Some(lt) = rest.find('<') {
        output.push_str(&rest[..lt]);
        let tail = &rest[lt..];
        if let Some(comment) = tail.strip_prefix("<!--") {
            rest = comment.find("-->").map_or("", |end| &comment[end + 3..]);
            continue;
        }
        let Some(end) = tag_end(tail, 0) else {
            output.push_str(tail);
            rest = "";
            break;
        };
        if open_tag_name(tail, 0).is_some_and(|name| name.eq_ignore_ascii_case("br")) {
            output.push('\n');
        }
        rest = &tail[end + 1..];
    }
    output.push_str(rest);
    decode_entities(&output)
}

pub(crate) fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    let mut output = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        output.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let Some(semi) = tail.bytes().take(12).position(|byte| byte == b';') else {
            output.push('&');
            rest = &tail[1..];
            continue;
        };
        let entity = &tail[1..semi];
        match decode_entity(entity) {
            Some(ch) => {
                output.push(ch);
                rest = &tail[semi + 1..];
            }
            None => {
                output.push('&');
                rest = &tail[1..];
            }
        }
    }
    output.push_str(rest);
    output
}

fn decode_entity(entity: &str) -> Option<char> {
    match entity {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some('\u{a0}'),
        _ => {
            let number = entity.strip_prefix('#')?;
            let code = match number.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => number.parse::<u32>().ok()?,
            };
            char::from_u32(code)
        }
    }
}

/// Byte offset of the first ASCII-case-insensitive match of `needle` at or
/// after `from`.
pub(crate) fn find_ignore_ascii_case(haystack: &str, needle: &str, from: usize) -> Option<usize> {
    let needle = needle.as_bytes();
    if needle.is_empty() {
        return Some(from);
    }
    haystack
        .as_bytes()
        .get(from..)?
        .windows(needle.len())
        .position(|window| window.eq_ignore_ascii_case(needle))
        .map(|offset| from + offset)
}
