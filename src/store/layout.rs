//! Line index over a block-style YAML document.
//!
//! The index records where every mapping key, sequence entry and inline
//! value sits in the original text so the patcher can rewrite only the lines
//! that changed. It understands the subset of YAML a hand-written menu file
//! uses: block mappings, block sequences, inline scalars and comments. Any
//! line it cannot place makes [`Layout::parse`] return `None`.

use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineKind {
    Blank,
    /// Comments, and document markers / directives, which carry no data.
    Comment,
    Content,
}

/// A block mapping: its key column and fields in document order.
#[derive(Debug, Clone)]
pub(crate) struct MappingSpan {
    pub key_col: usize,
    pub fields: Vec<FieldSpan>,
}

/// One `key: value` entry of a mapping.
#[derive(Debug, Clone)]
pub(crate) struct FieldSpan {
    pub key: String,
    /// Line holding the key.
    pub line: usize,
    /// Byte column of the key on that line.
    pub col: usize,
    /// Byte range of the inline value on the key line, comment excluded.
    /// Empty (and positioned right after the colon) when there is none.
    pub value: Range<usize>,
    /// Byte column of a trailing comment on the key line.
    pub comment: Option<usize>,
    /// Exclusive end line, trailing blank and comment lines excluded.
    pub end: usize,
    /// The inline value can be replaced in place.
    pub inline: bool,
    pub seq: Option<SeqSpan>,
    pub map: Option<MappingSpan>,
}

/// A block sequence whose dashes sit at `indent`.
#[derive(Debug, Clone)]
pub(crate) struct SeqSpan {
    pub indent: usize,
    pub entries: Vec<EntrySpan>,
}

/// One `- ...` entry.
#[derive(Debug, Clone)]
pub(crate) struct EntrySpan {
    /// First line of the blank/comment run that precedes the dash line.
    pub lead: usize,
    /// The dash line.
    pub start: usize,
    pub end: usize,
    /// The entry's mapping, if the entry is one.
    pub map: Option<MappingSpan>,
}

#[derive(Debug)]
pub(crate) struct Layout<'a> {
    pub lines: Vec<&'a str>,
    pub newline: &'static str,
    pub trailing_newline: bool,
    pub root: MappingSpan,
}

/// Marker error: the patcher cannot express an edit on this layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Unsupported;

/// A replacement of lines `start..end` by `lines`. `start == end` inserts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Splice {
    pub start: usize,
    pub end: usize,
    pub lines: Vec<String>,
}

impl Splice {
    pub fn replace(range: Range<usize>, lines: Vec<String>) -> Self {
        Self {
            start: range.start,
            end: range.end,
            lines,
        }
    }

    pub fn insert(at: usize, lines: Vec<String>) -> Self {
        Self {
            start: at,
            end: at,
            lines,
        }
    }
}

impl MappingSpan {
    pub fn field(&self, key: &str) -> Option<&FieldSpan> {
        self.fields.iter().find(|f| f.key == key)
    }

    /// Line after the last field, where new fields are appended.
    pub fn end(&self) -> Option<usize> {
        self.fields.last().map(|f| f.end)
    }
}

impl FieldSpan {
    /// Text before the key on its line (indentation, and `- ` on a dash line).
    pub fn prefix<'a>(&self, layout: &Layout<'a>) -> &'a str {
        &layout.lines[self.line][..self.col]
    }

    /// Trailing comment of the key line with one separating space, or "".
    pub fn comment_suffix(&self, layout: &Layout<'_>) -> String {
        match self.comment {
            Some(col) => format!(" {}", &layout.lines[self.line][col..]),
            None => String::new(),
        }
    }

    pub fn on_dash_line(&self, layout: &Layout<'_>) -> bool {
        self.prefix(layout).trim_start().starts_with('-')
    }
}

/// True when the text holds no data at all (empty, blank or comments only).
pub(crate) fn is_blank_document(text: &str) -> bool {
    text.lines()
        .all(|line| classify(line.trim_end_matches('\r')) != LineKind::Content)
}

impl<'a> Layout<'a> {
    pub fn parse(text: &'a str) -> Option<Self> {
        let trailing_newline = text.ends_with('\n');
        let newline = if text.contains("\r\n") { "\r\n" } else { "\n" };
        let body = text.strip_suffix('\n').unwrap_or(text);
        let lines: Vec<&str> = if text.is_empty() {
            Vec::new()
        } else {
            body.split('\n')
                .map(|l| l.strip_suffix('\r').unwrap_or(l))
                .collect()
        };

        let kinds: Vec<LineKind> = lines.iter().map(|l| classify(l)).collect();
        for (line, kind) in lines.iter().zip(&kinds) {
            if *kind == LineKind::Content && leading_ws(line).contains('\t') {
                return None;
            }
        }

        let indexer = Indexer {
            lines: &lines,
            kinds: &kinds,
        };
        let root = match kinds.iter().position(|k| *k == LineKind::Content) {
            None => MappingSpan {
                key_col: 0,
                fields: Vec::new(),
            },
            Some(first) => {
                let col = indent(lines[first]);
                indexer.mapping(first, col, lines.len())?
            }
        };

        Some(Self {
            lines,
            newline,
            trailing_newline,
            root,
        })
    }

    /// Apply sorted, non-overlapping splices to `range` and return its lines.
    pub fn apply(
        &self,
        range: Range<usize>,
        mut splices: Vec<Splice>,
    ) -> Result<Vec<String>, Unsupported> {
        splices.sort_by_key(|s| (s.start, s.end));
        let mut out = Vec::with_capacity(range.len());
        let mut cursor = range.start;
        for splice in splices {
            if splice.start < cursor || splice.end > range.end || splice.start > splice.end {
                return Err(Unsupported);
            }
            out.extend(self.lines[cursor..splice.start].iter().map(|l| l.to_string()));
            out.extend(splice.lines);
            cursor = splice.end;
        }
        out.extend(self.lines[cursor..range.end].iter().map(|l| l.to_string()));
        Ok(out)
    }

    /// Apply splices to the whole document and join it back into text.
    pub fn assemble(&self, splices: Vec<Splice>) -> Result<String, Unsupported> {
        let lines = self.apply(0..self.lines.len(), splices)?;
        let mut text = lines.join(self.newline);
        if !lines.is_empty() && (self.trailing_newline || self.lines.is_empty()) {
            text.push_str(self.newline);
        }
        Ok(text)
    }
}

struct Indexer<'l, 'a> {
    lines: &'l [&'a str],
    kinds: &'l [LineKind],
}

impl Indexer<'_, '_> {
    fn is_content(&self, line: usize) -> bool {
        self.kinds[line] == LineKind::Content
    }

    /// End of the content in `range`: one past its last content line.
    fn content_end(&self, range: Range<usize>) -> usize {
        let start = range.start;
        range
            .rev()
            .find(|&l| self.is_content(l))
            .map(|l| l + 1)
            .unwrap_or(start)
    }

    fn first_content(&self, range: Range<usize>) -> Option<usize> {
        range.into_iter().find(|&l| self.is_content(l))
    }

    /// Index a block mapping whose first key sits at (`first`, `key_col`)
    /// and whose content ends before line `end`.
    fn mapping(&self, first: usize, key_col: usize, end: usize) -> Option<MappingSpan> {
        let mut starts = vec![first];
        for line in first + 1..end {
            if !self.is_content(line) {
                continue;
            }
            let text = self.lines[line];
            let ind = indent(text);
            if ind < key_col {
                return None;
            }
            // A sequence may sit at its key's own indentation.
            if ind == key_col && !is_dash(&text[ind..]) {
                starts.push(line);
            }
        }

        let mut fields = Vec::with_capacity(starts.len());
        for (n, &line) in starts.iter().enumerate() {
            let next = starts.get(n + 1).copied().unwrap_or(end);
            let field_end = self.content_end(line..next);
            fields.push(self.field(line, key_col, field_end)?);
        }
        Some(MappingSpan { key_col, fields })
    }

    fn field(&self, line: usize, col: usize, end: usize) -> Option<FieldSpan> {
        let text = self.lines[line];
        let (key, colon) = parse_key(&text[col..])?;
        let after = col + colon + 1;
        let rest = &text[after..];
        let comment = find_comment(rest).map(|c| after + c);
        let raw = &text[after..comment.unwrap_or(text.len())];

        let value = if raw.trim().is_empty() {
            after..after
        } else {
            let lead = raw.len() - raw.trim_start().len();
            after + lead..after + raw.trim_end().len()
        };
        let inline_text = &text[value.clone()];

        let mut span = FieldSpan {
            key,
            line,
            col,
            value: value.clone(),
            comment,
            end,
            inline: false,
            seq: None,
            map: None,
        };

        let child = self.first_content(line + 1..end);
        match child {
            None => {
                span.inline = !inline_text.starts_with(['|', '>', '&', '*', '!']);
            }
            Some(child) if inline_text.is_empty() => {
                let child_text = self.lines[child];
                let ind = indent(child_text);
                if is_dash(&child_text[ind..]) {
                    span.seq = Some(self.sequence(line + 1, ind, end)?);
                } else if parse_key(&child_text[ind..]).is_some() {
                    span.map = Some(self.mapping(child, ind, end)?);
                }
            }
            // Multi-line scalar: opaque, replaced as a whole when edited.
            Some(_) => {}
        }
        Some(span)
    }

    fn sequence(&self, from: usize, dash_col: usize, end: usize) -> Option<SeqSpan> {
        let mut dashes = Vec::new();
        for line in from..end {
            if !self.is_content(line) {
                continue;
            }
            let text = self.lines[line];
            let ind = indent(text);
            if ind < dash_col {
                return None;
            }
            if ind == dash_col {
                if !is_dash(&text[ind..]) {
                    return None;
                }
                dashes.push(line);
            }
        }

        let mut entries = Vec::with_capacity(dashes.len());
        let mut lead = from;
        for (n, &start) in dashes.iter().enumerate() {
            let next = dashes.get(n + 1).copied().unwrap_or(end);
            let entry_end = self.content_end(start..next);
            let map = self.entry_body(start, dash_col, entry_end)?;
            entries.push(EntrySpan {
                lead,
                start,
                end: entry_end,
                map,
            });
            lead = entry_end;
        }
        Some(SeqSpan {
            indent: dash_col,
            entries,
        })
    }

    /// `Some(None)` for entries that are not block mappings.
    fn entry_body(&self, start: usize, dash_col: usize, end: usize) -> Option<Option<MappingSpan>> {
        let text = self.lines[start];
        let after_dash = dash_col + 1;
        let body_col = after_dash + indent(&text[after_dash..]);
        let body = &text[body_col..];

        if body.is_empty() || body.starts_with('#') {
            let Some(child) = self.first_content(start + 1..end) else {
                return Some(None);
            };
            let child_text = self.lines[child];
            let ind = indent(child_text);
            if parse_key(&child_text[ind..]).is_some() {
                return self.mapping(child, ind, end).map(Some);
            }
            return Some(None);
        }
        if parse_key(body).is_some() {
            return self.mapping(start, body_col, end).map(Some);
        }
        Some(None)
    }
}

fn classify(line: &str) -> LineKind {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return LineKind::Blank;
    }
    if trimmed.starts_with('#') {
        return LineKind::Comment;
    }
    // Document markers and directives only count at column 0.
    for marker in ["---", "..."] {
        if let Some(rest) = line.strip_prefix(marker) {
            let rest = rest.trim();
            if rest.is_empty() || rest.starts_with('#') {
                return LineKind::Comment;
            }
        }
    }
    if line.starts_with('%') {
        return LineKind::Comment;
    }
    LineKind::Content
}

fn leading_ws(line: &str) -> &str {
    &line[..line.len() - line.trim_start().len()]
}

fn indent(line: &str) -> usize {
    line.len() - line.trim_start_matches(' ').len()
}

fn is_dash(text: &str) -> bool {
    text == "-" || text.starts_with("- ")
}

/// Match a plain mapping key at the start of `text`. Returns the key and the
/// byte offset of its colon.
pub(crate) fn parse_key(text: &str) -> Option<(String, usize)> {
    let bytes = text.as_bytes();
    let first = *bytes.first()?;
    if !(first.is_ascii_alphabetic() || first == b'_') {
        return None;
    }
    let key_len = bytes
        .iter()
        .position(|b| !(b.is_ascii_alphanumeric() || *b == b'_' || *b == b'-'))
        .unwrap_or(bytes.len());
    let mut colon = key_len;
    while bytes.get(colon) == Some(&b' ') {
        colon += 1;
    }
    if bytes.get(colon) != Some(&b':') {
        return None;
    }
    match bytes.get(colon + 1) {
        None | Some(b' ') => Some((text[..key_len].to_string(), colon)),
        _ => None,
    }
}

/// Byte offset of a trailing `#` comment in a value, honouring quotes.
fn find_comment(value: &str) -> Option<usize> {
    let start = value.len() - value.trim_start().len();
    let trimmed = &value[start..];

    let scan_from = match trimmed.chars().next() {
        Some('"') => start + closing_double(&trimmed[1..])? + 2,
        Some('\'') => start + closing_single(&trimmed[1..])? + 2,
        Some('#') => return Some(start),
        _ => start,
    };

    let mut prev_ws = scan_from == 0 || value[..scan_from].ends_with([' ', '\t']);
    for (idx, ch) in value[scan_from..].char_indices() {
        if ch == '#' && prev_ws {
            return Some(scan_from + idx);
        }
        prev_ws = ch == ' ' || ch == '\t';
    }
    None
}

fn closing_double(s: &str) -> Option<usize> {
    let mut escaped = false;
    for (idx, ch) in s.char_indices() {
        match ch {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '"' => return Some(idx),
            _ => {}
        }
    }
    None
}

fn closing_single(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] == b'\'' {
            if bytes.get(idx + 1) == Some(&b'\'') {
                idx += 2;
                continue;
            }
            return Some(idx);
        }
        idx += 1;
    }
    None
}
