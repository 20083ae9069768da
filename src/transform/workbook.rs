//! Minimal first-worksheet access for `.xlsx` packages.
//!
//! An xlsx file is a zip archive of XML parts. Only the parts needed to read
//! and fill text cells are interpreted; every other entry is copied through
//! byte for byte.
//!
//! Cells are located with regular expressions over the sheet XML rather than
//! a full XML parser. Written text always becomes an inline string, so the
//! shared string table never needs rewriting.

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const WORKBOOK_PART: &str = "xl/workbook.xml";
const WORKBOOK_RELS_PART: &str = "xl/_rels/workbook.xml.rels";
const SHARED_STRINGS_PART: &str = "xl/sharedStrings.xml";
const FALLBACK_SHEET_PART: &str = "xl/worksheets/sheet1.xml";

struct Patterns {
    sheet: Regex,
    relationship: Regex,
    shared_item: Regex,
    phonetic: Regex,
    text: Regex,
    value: Regex,
    row: Regex,
    cell: Regex,
    attr: Regex,
    sheet_data: Regex,
}

impl Patterns {
    fn new() -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).with_context(|| format!("compile workbook pattern {pattern}"))
        };
        Ok(Self {
            sheet: compile(r"<sheet\b[^>]*>")?,
            relationship: compile(r"<Relationship\b[^>]*>")?,
            shared_item: compile(r"(?s)<si>(.*?)</si>|<si/>")?,
            phonetic: compile(r"(?s)<rPh\b.*?</rPh>")?,
            text: compile(r"(?s)<t(?:\s[^>]*)?>(.*?)</t>")?,
            value: compile(r"(?s)<v(?:\s[^>]*)?>(.*?)</v>")?,
            row: compile(r"(?s)<row\b([^>]*?)(?:/>|>(.*?)</row>)")?,
            cell: compile(r"(?s)<c\b([^>]*?)(?:/>|>(.*?)</c>)")?,
            attr: compile(r#"([\w:]+)="([^"]*)""#)?,
            sheet_data: compile(r"(?s)<sheetData\b[^>]*?(?:/>|>(.*?)</sheetData>)")?,
        })
    }

    fn attr<'a>(&self, attrs: &'a str, name: &str) -> Option<&'a str> {
        self.attr
            .captures_iter(attrs)
            .find(|cap| cap.get(1).is_some_and(|m| m.as_str() == name))
            .and_then(|cap| cap.get(2))
            .map(|m| m.as_str())
    }

    /// Concatenated `<t>` runs, ignoring phonetic hints.
    fn rich_text(&self, xml: &str) -> String {
        let stripped = self.phonetic.replace_all(xml, "");
        self.text
            .captures_iter(&stripped)
            .filter_map(|cap| cap.get(1))
            .map(|m| unescape_xml(m.as_str()))
            .collect()
    }
}

/// A cell position, 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CellRef {
    pub row: u32,
    pub col: u32,
}

impl CellRef {
    /// Parse `B12`.
    pub fn parse(raw: &str) -> Option<Self> {
        let split = raw.find(|ch: char| ch.is_ascii_digit())?;
        let (letters, digits) = raw.split_at(split);
        let col = column_index(letters)?;
        let row = digits.parse().ok().filter(|row| *row > 0)?;
        Some(Self { row, col })
    }

    pub fn label(&self) -> String {
        format!("{}{}", column_letters(self.col), self.row)
    }
}

/// `A` is 1, `Z` is 26, `AA` is 27.
pub fn column_index(letters: &str) -> Option<u32> {
    if letters.is_empty() || letters.len() > 3 {
        return None;
    }
    letters.chars().try_fold(0u32, |acc, ch| {
        let ch = ch.to_ascii_uppercase();
        ch.is_ascii_uppercase()
            .then(|| acc * 26 + (ch as u32 - 'A' as u32 + 1))
    })
}

pub fn column_letters(mut col: u32) -> String {
    let mut letters = Vec::new();
    while col > 0 {
        let rem = (col - 1) % 26;
        letters.push(char::from(b'A' + rem as u8));
        col = (col - 1) / 26;
    }
    letters.iter().rev().collect()
}

struct Part {
    name: String,
    data: Vec<u8>,
    is_dir: bool,
}

/// An opened workbook with its first worksheet ready for edits.
pub struct Workbook {
    parts: Vec<Part>,
    sheet_part: String,
    sheet_xml: String,
    shared: Vec<String>,
    patterns: Patterns,
}

impl Workbook {
    pub fn open(bytes: &[u8]) -> Result<Self> {
        let patterns = Patterns::new()?;
        let mut archive =
            ZipArchive::new(Cursor::new(bytes)).context("open workbook archive")?;
        let mut parts = Vec::with_capacity(archive.len());
        for idx in 0..archive.len() {
            let mut entry = archive
                .by_index(idx)
                .with_context(|| format!("read workbook entry {idx}"))?;
            let mut data = Vec::new();
            if !entry.is_dir() {
                entry
                    .read_to_end(&mut data)
                    .with_context(|| format!("read workbook part {}", entry.name()))?;
            }
            parts.push(Part {
                name: entry.name().to_string(),
                data,
                is_dir: entry.is_dir(),
            });
        }

        let part_text = |name: &str| -> Result<Option<String>> {
            parts
                .iter()
                .find(|part| part.name == name)
                .map(|part| {
                    String::from_utf8(part.data.clone())
                        .with_context(|| format!("decode workbook part {name}"))
                })
                .transpose()
        };

        let sheet_part = first_sheet_part(
            &patterns,
            part_text(WORKBOOK_PART)?.as_deref(),
            part_text(WORKBOOK_RELS_PART)?.as_deref(),
        );
        let sheet_xml = part_text(&sheet_part)?
            .or(part_text(FALLBACK_SHEET_PART)?)
            .ok_or_else(|| anyhow!("workbook has no worksheet"))?;
        let sheet_part = if parts.iter().any(|part| part.name == sheet_part) {
            sheet_part
        } else {
            FALLBACK_SHEET_PART.to_string()
        };
        let shared = match part_text(SHARED_STRINGS_PART)? {
            Some(xml) => patterns
                .shared_item
                .captures_iter(&xml)
                .map(|cap| {
                    cap.get(1)
                        .map(|m| patterns.rich_text(m.as_str()))
                        .unwrap_or_default()
                })
                .collect(),
            None => Vec::new(),
        };

        Ok(Self {
            parts,
            sheet_part,
            sheet_xml,
            shared,
            patterns,
        })
    }

    #[cfg(test)]
    pub fn sheet_part(&self) -> &str {
        &self.sheet_part
    }

    /// Text of every non-empty cell in the first worksheet.
    pub fn cells(&self) -> BTreeMap<CellRef, String> {
        let mut cells = BTreeMap::new();
        let mut next_row: u32 = 1;
        for row_cap in self.patterns.row.captures_iter(&self.sheet_xml) {
            let row_attrs = row_cap.get(1).map_or("", |m| m.as_str());
            let row = self
                .patterns
                .attr(row_attrs, "r")
                .and_then(|r| r.parse().ok())
                .unwrap_or(next_row);
            next_row = row.saturating_add(1);
            let Some(body) = row_cap.get(2) else {
                continue;
            };
            let mut next_col: u32 = 1;
            for cell_cap in self.patterns.cell.captures_iter(body.as_str()) {
                let attrs = cell_cap.get(1).map_or("", |m| m.as_str());
                let col = self
                    .patterns
                    .attr(attrs, "r")
                    .and_then(CellRef::parse)
                    .map_or(next_col, |cell| cell.col);
                next_col = col.saturating_add(1);
                let inner = cell_cap.get(2).map_or("", |m| m.as_str());
                let text = self.cell_text(attrs, inner);
                if !text.is_empty() {
                    cells.insert(CellRef { row, col }, text);
                }
            }
        }
        cells
    }

    fn cell_text(&self, attrs: &str, inner: &str) -> String {
        let value = || {
            self.patterns
                .value
                .captures(inner)
                .and_then(|cap| cap.get(1))
                .map(|m| unescape_xml(m.as_str()))
        };
        match self.patterns.attr(attrs, "t") {
            Some("s") => value()
                .and_then(|idx| idx.trim().parse::<usize>().ok())
                .and_then(|idx| self.shared.get(idx).cloned())
                .unwrap_or_default(),
            Some("inlineStr") => self.patterns.rich_text(inner),
            _ => value().unwrap_or_default(),
        }
    }

    /// Write `text` into a cell as an inline string, keeping its style.
    pub fn set_text(&mut self, at: CellRef, text: &str) -> Result<()> {
        let sheet_data = self
            .patterns
            .sheet_data
            .captures(&self.sheet_xml)
            .ok_or_else(|| anyhow!("worksheet has no sheetData"))?;
        let whole = sheet_data.get(0).map_or(0..0, |m| m.range());
        let rows_range = sheet_data.get(1).map(|m| m.range());

        let Some(rows_range) = rows_range else {
            // `<sheetData/>`
            let replacement = format!("<sheetData>{}</sheetData>", new_row(at, text));
            self.sheet_xml.replace_range(whole, &replacement);
            return Ok(());
        };

        let rows_xml = &self.sheet_xml[rows_range.clone()];
        let mut insert_at = rows_xml.len();
        let mut next_row: u32 = 1;
        let mut edit: Option<(std::ops::Range<usize>, String)> = None;
        for row_cap in self.patterns.row.captures_iter(rows_xml) {
            let span = row_cap.get(0).map_or(0..0, |m| m.range());
            let row_attrs = row_cap.get(1).map_or("", |m| m.as_str());
            let row = self
                .patterns
                .attr(row_attrs, "r")
                .and_then(|r| r.parse().ok())
                .unwrap_or(next_row);
            next_row = row.saturating_add(1);
            if row > at.row {
                insert_at = span.start;
                break;
            }
            if row == at.row {
                let body = row_cap.get(2).map_or("", |m| m.as_str());
                let rebuilt = format!(
                    "<row{row_attrs}>{}</row>",
                    self.put_cell(body, at, text)
                );
                edit = Some((span, rebuilt));
                break;
            }
        }
        let (range, replacement) = match edit {
            Some((span, rebuilt)) => (span, rebuilt),
            None => (insert_at..insert_at, new_row(at, text)),
        };
        let start = rows_range.start;
        self.sheet_xml
            .replace_range(start + range.start..start + range.end, &replacement);
        Ok(())
    }

    /// Row body with the target cell replaced or inserted in column order.
    fn put_cell(&self, body: &str, at: CellRef, text: &str) -> String {
        let mut next_col: u32 = 1;
        for cell_cap in self.patterns.cell.captures_iter(body) {
            let span = cell_cap.get(0).map_or(0..0, |m| m.range());
            let attrs = cell_cap.get(1).map_or("", |m| m.as_str());
            let col = self
                .patterns
                .attr(attrs, "r")
                .and_then(CellRef::parse)
                .map_or(next_col, |cell| cell.col);
            next_col = col.saturating_add(1);
            if col == at.col {
                let style = self.patterns.attr(attrs, "s");
                return format!(
                    "{}{}{}",
                    &body[..span.start],
                    inline_cell(at, style, text),
                    &body[span.end..]
                );
            }
            if col > at.col {
                return format!(
                    "{}{}{}",
                    &body[..span.start],
                    inline_cell(at, None, text),
                    &body[span.start..]
                );
            }
        }
        format!("{body}{}", inline_cell(at, None, text))
    }

    /// Re-package the workbook with the edited worksheet.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options =
            SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        for part in &self.parts {
            if part.is_dir {
                writer
                    .add_directory(part.name.as_str(), options)
                    .with_context(|| format!("write workbook dir {}", part.name))?;
                continue;
            }
            writer
                .start_file(part.name.as_str(), options)
                .with_context(|| format!("start workbook part {}", part.name))?;
            let data = if part.name == self.sheet_part {
                self.sheet_xml.as_bytes()
            } else {
                &part.data
            };
            writer
                .write_all(data)
                .with_context(|| format!("write workbook part {}", part.name))?;
        }
        let cursor = writer.finish().context("finish workbook archive")?;
        Ok(cursor.into_inner())
    }
}

/// Resolve the first `<sheet>` of the workbook through its relationship.
fn first_sheet_part(patterns: &Patterns, workbook: Option<&str>, rels: Option<&str>) -> String {
    let target = workbook
        .and_then(|xml| patterns.sheet.find(xml))
        .and_then(|sheet| patterns.attr(sheet.as_str(), "r:id"))
        .and_then(|rid| {
            let rels = rels?;
            patterns
                .relationship
                .find_iter(rels)
                .find(|rel| patterns.attr(rel.as_str(), "Id") == Some(rid))
                .and_then(|rel| patterns.attr(rel.as_str(), "Target"))
        });
    match target {
        Some(target) if target.starts_with('/') => target.trim_start_matches('/').to_string(),
        Some(target) => format!("xl/{}", target.trim_start_matches("./")),
        None => FALLBACK_SHEET_PART.to_string(),
    }
}

fn new_row(at: CellRef, text: &str) -> String {
    format!("<row r=\"{}\">{}</row>", at.row, inline_cell(at, None, text))
}

fn inline_cell(at: CellRef, style: Option<&str>, text: &str) -> String {
    let style = style
        .map(|s| format!(" s=\"{s}\""))
        .unwrap_or_default();
    format!(
        "<c r=\"{}\"{style} t=\"inlineStr\"><is><t xml:space=\"preserve\">{}</t></is></c>",
        at.label(),
        escape_xml(text)
    )
}

/// Escape text for element content, dropping characters XML 1.0 forbids.
pub fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\t' | '\n' | '\r' => out.push(ch),
            c if (c as u32) < 0x20 => {}
            c => out.push(c),
        }
    }
    out
}

pub fn unescape_xml(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(idx) = rest.find('&') {
        out.push_str(&rest[..idx]);
        let tail = &rest[idx..];
        let Some(end) = tail.find(';') else {
            out.push_str(tail);
            return out;
        };
        let entity = &tail[1..end];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ => entity
                .strip_prefix("#x")
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                .and_then(char::from_u32),
        };
        match decoded {
            Some(ch) => {
                out.push(ch);
                rest = &tail[end + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
#[path = "workbook_tests.rs"]
mod tests;
